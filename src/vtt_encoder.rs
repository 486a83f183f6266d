use std::io::Write;

use anyhow::{Result, bail};

use crate::submission::AnnotationSubmission;
use crate::submission_encoder::SubmissionEncoder;

/// A `SubmissionEncoder` that writes accepted regions as WebVTT cues.
///
/// Each submission becomes a `NOTE clip <id>` block followed by one cue per region.
/// Cue timings are relative to the start of that clip. The label is the first cue
/// line; a comment, if any, is the second.
pub struct VttEncoder<W: Write> {
    w: W,

    /// Whether we've written the `WEBVTT` header.
    started: bool,

    closed: bool,
}

impl<W: Write> VttEncoder<W> {
    pub fn new(w: W) -> Self {
        Self {
            w,
            started: false,
            closed: false,
        }
    }

    fn start_if_needed(&mut self) -> Result<()> {
        if !self.started {
            self.w.write_all(b"WEBVTT\n\n")?;
            self.started = true;
        }
        Ok(())
    }
}

impl<W: Write> SubmissionEncoder for VttEncoder<W> {
    fn write_submission(&mut self, submission: &AnnotationSubmission) -> Result<()> {
        if self.closed {
            bail!("cannot write submission: encoder is already closed");
        }

        self.start_if_needed()?;

        writeln!(
            &mut self.w,
            "NOTE clip {}\n",
            cue_text(submission.audio_file_id.as_str())
        )?;

        for entry in &submission.annotations {
            let start = format_timestamp_vtt(entry.start);
            let end = format_timestamp_vtt(entry.end);
            writeln!(&mut self.w, "{start} --> {end}")?;

            let label = if entry.annotation.trim().is_empty() {
                "(unlabeled)".to_owned()
            } else {
                cue_text(&entry.annotation)
            };
            writeln!(&mut self.w, "{label}")?;
            if let Some(comment) = &entry.comment {
                writeln!(&mut self.w, "{}", cue_text(comment))?;
            }
            writeln!(&mut self.w)?;
        }

        Ok(())
    }

    /// Flush the underlying writer. Idempotent.
    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }

        self.w.flush()?;
        self.closed = true;
        Ok(())
    }
}

// Cue payloads are single lines and may not contain the timing arrow.
fn cue_text(s: &str) -> String {
    s.replace("-->", "->").replace(['\r', '\n'], " ")
}

/// Format seconds into a WebVTT timestamp (`HH:MM:SS.mmm`), rounding to the nearest ms.
fn format_timestamp_vtt(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;

    let ms = total_ms % 1000;
    let total_s = total_ms / 1000;

    let s = total_s % 60;
    let total_m = total_s / 60;

    let m = total_m % 60;
    let h = total_m / 60;

    format!("{h:02}:{m:02}:{s:02}.{ms:03}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clip::ClipId;
    use crate::submission::AnnotationEntry;

    fn entry(start: f64, end: f64, label: &str, comment: Option<&str>) -> AnnotationEntry {
        AnnotationEntry {
            start,
            end,
            annotation: label.into(),
            comment: comment.map(str::to_owned),
        }
    }

    fn submission(clip: &str, annotations: Vec<AnnotationEntry>) -> AnnotationSubmission {
        AnnotationSubmission {
            audio_file_id: ClipId::new(clip),
            annotated_by: "42".into(),
            annotations,
            ai_classes: None,
            ai_regions: None,
            ai_interface: None,
            labeling_time: 0,
            mouse_path: Vec::new(),
            hover_durations: Default::default(),
            ai_hover_count: 0,
            click_delays: Vec::new(),
        }
    }

    #[test]
    fn vtt_close_without_submissions_emits_nothing() -> anyhow::Result<()> {
        let mut out = Vec::new();
        let mut enc = VttEncoder::new(&mut out);
        enc.close()?;
        assert_eq!(std::str::from_utf8(&out)?, "");
        Ok(())
    }

    #[test]
    fn vtt_writes_header_once_and_a_block_per_clip() -> anyhow::Result<()> {
        let mut out = Vec::new();
        let mut enc = VttEncoder::new(&mut out);

        enc.write_submission(&submission(
            "c1",
            vec![
                entry(0.0, 1.2346, "dog", None),
                entry(61.2, 62.0, "", Some("faint\nbark")),
            ],
        ))?;
        enc.write_submission(&submission("c2", vec![entry(0.5, 1.0, "a --> b", None)]))?;
        enc.close()?;

        let s = std::str::from_utf8(&out)?;
        assert!(s.starts_with("WEBVTT\n\nNOTE clip c1\n\n"));
        assert!(s.contains("00:00:00.000 --> 00:00:01.235\ndog\n\n"));
        assert!(s.contains("00:01:01.200 --> 00:01:02.000\n(unlabeled)\nfaint bark\n\n"));
        assert!(s.contains("NOTE clip c2\n\n00:00:00.500 --> 00:00:01.000\na -> b\n\n"));
        assert_eq!(s.matches("WEBVTT").count(), 1);
        Ok(())
    }

    #[test]
    fn vtt_format_timestamp_rounds_to_nearest_millisecond() {
        assert_eq!(format_timestamp_vtt(0.0004), "00:00:00.000");
        assert_eq!(format_timestamp_vtt(0.0015), "00:00:00.002");
        assert_eq!(format_timestamp_vtt(3_723.5), "01:02:03.500");
    }

    #[test]
    fn vtt_write_after_close_errors() -> anyhow::Result<()> {
        let mut out = Vec::new();
        let mut enc = VttEncoder::new(&mut out);
        enc.close()?;
        let err = enc
            .write_submission(&submission("c1", Vec::new()))
            .unwrap_err();
        assert!(err.to_string().contains("already closed"));
        Ok(())
    }
}
