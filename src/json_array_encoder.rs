use std::io::Write;

use anyhow::{Result, bail};

use crate::submission::AnnotationSubmission;
use crate::submission_encoder::SubmissionEncoder;

/// A `SubmissionEncoder` that writes submissions as a single JSON array.
///
/// Design:
/// - Output streams straight into a `Write`; a long session's history is never
///   rendered into one string first.
/// - The encoder is stateful so the array can be emitted one submission at a time
///   and still be well-formed.
/// - Each element is exactly the payload that was posted for its clip, so an export
///   can be replayed against `/annotation` as-is.
///
/// Example output (whitespace added; the encoder writes compact JSON):
/// ```json
/// [
///   {
///     "audioFileId": "birds/b1",
///     "annotatedBy": "42",
///     "annotations": [{ "start": 0.0, "end": 2.0, "annotation": "dog" }],
///     "labelingTime": 1500,
///     "mousePath": [],
///     "hoverDurations": {},
///     "aiHoverCount": 0,
///     "clickDelays": [1500]
///   }
/// ]
/// ```
pub struct JsonArrayEncoder<W: Write> {
    w: W,

    /// Whether we have written the opening `[`.
    started: bool,

    /// Whether the next element is the first (no leading comma).
    first: bool,

    /// Once closed, no further writes are allowed.
    closed: bool,
}

impl<W: Write> JsonArrayEncoder<W> {
    /// Nothing is written until the first submission or `close`, so an encoder closed
    /// without submissions still produces `[]`.
    pub fn new(w: W) -> Self {
        Self {
            w,
            started: false,
            first: true,
            closed: false,
        }
    }

    fn start_if_needed(&mut self) -> Result<()> {
        if !self.started {
            self.w.write_all(b"[")?;
            self.started = true;
        }
        Ok(())
    }
}

impl<W: Write> SubmissionEncoder for JsonArrayEncoder<W> {
    fn write_submission(&mut self, submission: &AnnotationSubmission) -> Result<()> {
        if self.closed {
            bail!("cannot write submission: encoder is already closed");
        }

        self.start_if_needed()?;

        if !self.first {
            self.w.write_all(b",")?;
        }
        self.first = false;

        serde_json::to_writer(&mut self.w, submission)?;
        Ok(())
    }

    /// Finalize the JSON array and flush. Idempotent.
    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }

        self.start_if_needed()?;
        self.w.write_all(b"]")?;
        self.w.flush()?;

        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clip::ClipId;
    use crate::submission::AnnotationEntry;

    fn submission(clip: &str, label: &str) -> AnnotationSubmission {
        AnnotationSubmission {
            audio_file_id: ClipId::new(clip),
            annotated_by: "42".into(),
            annotations: vec![AnnotationEntry {
                start: 0.0,
                end: 1.0,
                annotation: label.into(),
                comment: None,
            }],
            ai_classes: None,
            ai_regions: None,
            ai_interface: None,
            labeling_time: 1_000,
            mouse_path: Vec::new(),
            hover_durations: Default::default(),
            ai_hover_count: 0,
            click_delays: Vec::new(),
        }
    }

    #[test]
    fn json_array_close_without_submissions_emits_empty_array() -> anyhow::Result<()> {
        let mut out = Vec::new();
        let mut enc = JsonArrayEncoder::new(&mut out);
        enc.close()?;
        assert_eq!(std::str::from_utf8(&out)?, "[]");
        Ok(())
    }

    #[test]
    fn json_array_round_trips_submissions() -> anyhow::Result<()> {
        let first = submission("c1", "dog");
        let second = submission("c2", "cat");

        let mut out = Vec::new();
        let mut enc = JsonArrayEncoder::new(&mut out);
        enc.write_submission(&first)?;
        enc.write_submission(&second)?;
        enc.close()?;

        let parsed: Vec<AnnotationSubmission> = serde_json::from_slice(&out)?;
        assert_eq!(parsed, vec![first, second]);
        Ok(())
    }

    #[test]
    fn json_array_close_is_idempotent() -> anyhow::Result<()> {
        let mut out = Vec::new();
        let mut enc = JsonArrayEncoder::new(&mut out);
        enc.close()?;
        enc.close()?;
        assert_eq!(std::str::from_utf8(&out)?, "[]");
        Ok(())
    }

    #[test]
    fn json_array_write_after_close_errors() -> anyhow::Result<()> {
        let mut out = Vec::new();
        let mut enc = JsonArrayEncoder::new(&mut out);
        enc.close()?;
        let err = enc.write_submission(&submission("c1", "x")).unwrap_err();
        assert!(err.to_string().contains("already closed"));
        Ok(())
    }
}
