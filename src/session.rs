//! High-level API for annotating clips.
//!
//! `AnnotationSession` wires the region set, telemetry recorder, waveform controller and
//! identity together and owns the clip-advance protocol:
//!
//! validate → assemble → (verify token) → submit → fetch next clip → reset & rebind
//!
//! Everything before "reset & rebind" is side-effect free on local state, so any failure
//! there leaves the user's regions, telemetry, clip and waveform exactly as they were.

use std::io::{BufWriter, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::api::{AnnotationApi, ApiError, ClipFetch, ClipPayload};
use crate::clip::{ClipContext, ClipId};
use crate::clock::SharedClock;
use crate::error::{Error, NetworkStage, Result, ValidationError};
use crate::export_format::ExportFormat;
use crate::identity::IdentityContext;
use crate::json_array_encoder::JsonArrayEncoder;
use crate::opts::{FetchRetry, SessionOpts};
use crate::region::{Region, RegionEvent, RegionId, RegionSet, ValidityPolicy};
use crate::submission::{self, AnnotationEntry, AnnotationSubmission};
use crate::submission_encoder::SubmissionEncoder;
use crate::telemetry::TelemetryRecorder;
use crate::vtt_encoder::VttEncoder;
use crate::waveform::{
    AudioSource, SurfaceEvent, SurfaceFactory, TimeHook, WaveformController, noop_hook,
};

/// Guard against overlapping advances.
///
/// Clones share the same flag, so a frontend can hold one to disable its "next" action
/// while an advance is running.
#[derive(Debug, Clone, Default)]
pub struct AdvanceGate(Arc<AtomicBool>);

impl AdvanceGate {
    /// Take the gate, or `None` if an advance is already in flight.
    pub fn try_begin(&self) -> Option<AdvanceTicket> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| AdvanceTicket(self.0.clone()))
    }

    pub fn is_busy(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Held for the duration of one advance; releases the gate when dropped.
#[derive(Debug)]
pub struct AdvanceTicket(Arc<AtomicBool>);

impl Drop for AdvanceTicket {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdvanceOutcome {
    /// A new clip is bound.
    Advanced {
        clip_id: ClipId,
        /// Regions materialized from the new clip's AI suggestions.
        suggested_regions: usize,
    },
    /// The server has no more clips for this selection. Local state is kept.
    Exhausted,
}

/// The annotation list the server already accepted for the current clip, and from whom.
#[derive(Debug, Clone)]
struct Delivered {
    clip_id: ClipId,
    annotated_by: String,
    annotations: Vec<AnnotationEntry>,
}

impl Delivered {
    fn covers(&self, submission: &AnnotationSubmission) -> bool {
        self.clip_id == submission.audio_file_id
            && self.annotated_by == submission.annotated_by
            && self.annotations == submission.annotations
    }
}

/// The main annotation entry point.
///
/// Typical usage:
/// - Construct once per annotating UI. The signed-in identity may change between advances.
/// - `start()` to load the first clip.
/// - Forward UI input (regions, transport, pointer/hover/click telemetry).
/// - `advance()` whenever the user asks for the next clip.
pub struct AnnotationSession<A: AnnotationApi, F: SurfaceFactory> {
    api: A,
    opts: SessionOpts,
    identity: IdentityContext,

    regions: RegionSet,
    telemetry: TelemetryRecorder,
    waveform: WaveformController<F>,
    clip: Option<ClipContext>,

    gate: AdvanceGate,
    delivered: Option<Delivered>,
    exhausted: bool,
    history: Vec<AnnotationSubmission>,

    on_time_update: TimeHook,
    on_duration_ready: TimeHook,
}

impl<A: AnnotationApi, F: SurfaceFactory> AnnotationSession<A, F> {
    pub fn new(
        api: A,
        factory: F,
        identity: IdentityContext,
        clock: SharedClock,
        opts: SessionOpts,
    ) -> Self {
        Self {
            api,
            regions: RegionSet::with_default_span(opts.default_region_seconds),
            telemetry: TelemetryRecorder::with_sample_interval(
                clock,
                opts.pointer_sample_interval_ms,
            ),
            waveform: WaveformController::with_skip_seconds(factory, opts.skip_seconds),
            opts,
            identity,
            clip: None,
            gate: AdvanceGate::default(),
            delivered: None,
            exhausted: false,
            history: Vec::new(),
            on_time_update: noop_hook(),
            on_duration_ready: noop_hook(),
        }
    }

    /// Callbacks invoked with the playback time and with the clip duration once known.
    ///
    /// They take effect on the next waveform bind.
    pub fn with_hooks(mut self, on_time_update: TimeHook, on_duration_ready: TimeHook) -> Self {
        self.on_time_update = on_time_update;
        self.on_duration_ready = on_duration_ready;
        self
    }

    // ---------------------------------------------------------------------
    // Clip advancement
    // ---------------------------------------------------------------------

    /// Load the first clip.
    pub fn start(&mut self) -> Result<AdvanceOutcome> {
        let _ticket = self.gate.try_begin().ok_or(Error::AdvanceInFlight)?;
        if self.clip.is_some() {
            return Err(Error::msg("session already has a clip; use advance()"));
        }

        match self.fetch_next()? {
            ClipFetch::Exhausted => Ok(self.mark_exhausted()),
            ClipFetch::Clip(payload) => self.bind_clip(payload),
        }
    }

    /// Submit the current clip's regions and move on to the next clip.
    ///
    /// Design:
    /// - At most one advance runs at a time; a second call gets `AdvanceInFlight`.
    /// - Regions are validated before anything touches the network.
    /// - The submission is built from the signed-in identity at call time, so a user who
    ///   signs in after a failure submits under their own id.
    /// - The token is optionally verified, then the submission is posted.
    /// - Local state (regions, telemetry, clip) is only reset once the next clip arrives.
    ///   On any earlier error nothing is lost and the call can simply be retried.
    /// - A retry by the same user never re-posts a list the server already accepted
    ///   for this clip. An edited list, or another user's, is posted.
    ///
    /// Returns `Exhausted` when the server has no clips left; the current clip and its
    /// regions stay in place.
    pub fn advance(&mut self) -> Result<AdvanceOutcome> {
        let _ticket = self.gate.try_begin().ok_or(Error::AdvanceInFlight)?;

        let Some(clip) = self.clip.as_ref() else {
            return Err(Error::NoClip);
        };
        let accepted = validate(&self.regions, self.opts.validity)?;

        let Some(identity) = self.identity.identity() else {
            return Err(Error::Auth("no signed-in user".to_owned()));
        };
        let submission = submission::assemble(
            clip,
            &identity.user_id,
            &accepted,
            &self.telemetry.snapshot(),
            self.telemetry.elapsed_since_load_ms(),
        );
        let token = identity.token.clone();

        self.submit(&token, submission)?;

        match self.fetch_next()? {
            ClipFetch::Exhausted => Ok(self.mark_exhausted()),
            ClipFetch::Clip(payload) => self.bind_clip(payload),
        }
    }

    /// Retry binding the current clip's audio after a failed waveform initialization.
    pub fn rebind_waveform(&mut self) -> Result<()> {
        let Some(clip) = self.clip.as_ref() else {
            return Err(Error::NoClip);
        };
        let source: AudioSource = clip.audio.clone();

        self.waveform.destroy();
        self.waveform.initialize(
            &source,
            self.on_time_update.clone(),
            self.on_duration_ready.clone(),
        )?;
        self.pump_surface();
        Ok(())
    }

    fn submit(&mut self, token: &str, submission: AnnotationSubmission) -> Result<()> {
        if let Some(delivered) = &self.delivered {
            if delivered.covers(&submission) {
                debug!(clip_id = %submission.audio_file_id, "annotation already accepted; not re-posting");
                return Ok(());
            }
        }

        if self.opts.verify_token_before_submit {
            match self.api.verify_token(token) {
                Ok(true) => {}
                Ok(false) | Err(ApiError::Unauthorized) => {
                    self.identity.invalidate();
                    return Err(Error::Auth("token was rejected".to_owned()));
                }
                Err(err) => {
                    warn!(error = %err, "token check failed");
                    return Err(Error::network(NetworkStage::VerifyToken, err));
                }
            }
        }

        match self.api.submit_annotation(token, &submission) {
            Ok(()) => {
                info!(
                    clip_id = %submission.audio_file_id,
                    regions = submission.annotations.len(),
                    labeling_ms = submission.labeling_time,
                    "annotation submitted"
                );
                self.delivered = Some(Delivered {
                    clip_id: submission.audio_file_id.clone(),
                    annotated_by: submission.annotated_by.clone(),
                    annotations: submission.annotations.clone(),
                });
                // An edited re-post supersedes the same user's earlier one for the clip.
                if self.history.last().is_some_and(|prev| {
                    prev.audio_file_id == submission.audio_file_id
                        && prev.annotated_by == submission.annotated_by
                }) {
                    self.history.pop();
                }
                self.history.push(submission);
                Ok(())
            }
            Err(ApiError::Unauthorized) => {
                self.identity.invalidate();
                Err(Error::Auth("annotation submit was rejected".to_owned()))
            }
            Err(err) => {
                warn!(error = %err, clip_id = %submission.audio_file_id, "annotation submit failed");
                Err(Error::network(NetworkStage::Submit, err))
            }
        }
    }

    fn fetch_next(&mut self) -> Result<ClipFetch> {
        let Some(request) = self.opts.clip_selection.request(self.identity.identity()) else {
            return Err(Error::Auth(
                "clip selection requires a signed-in user".to_owned(),
            ));
        };
        let token = self.identity.token().map(str::to_owned);

        let (retries, backoff) = match self.opts.fetch_retry {
            FetchRetry::Manual => (0, Duration::ZERO),
            FetchRetry::Automatic { attempts, backoff } => (attempts, backoff),
        };

        let mut attempt = 0;
        loop {
            match self.api.fetch_clip(&request, token.as_deref()) {
                Ok(fetch) => return Ok(fetch),
                Err(ApiError::Unauthorized) => {
                    self.identity.invalidate();
                    return Err(Error::Auth("clip request was rejected".to_owned()));
                }
                Err(err) if attempt < retries => {
                    attempt += 1;
                    warn!(attempt, retries, error = %err, "clip fetch failed; retrying");
                    std::thread::sleep(backoff);
                }
                Err(err) => {
                    warn!(error = %err, path = %request.path, "clip fetch failed");
                    return Err(Error::network(NetworkStage::FetchClip, err));
                }
            }
        }
    }

    fn mark_exhausted(&mut self) -> AdvanceOutcome {
        info!("no clips remain");
        self.exhausted = true;
        AdvanceOutcome::Exhausted
    }

    // Past this point the new clip is committed. A waveform failure is reported but the
    // clip stays bound so `rebind_waveform` can retry.
    fn bind_clip(&mut self, payload: ClipPayload) -> Result<AdvanceOutcome> {
        self.waveform.destroy();
        self.regions.clear();
        self.telemetry.reset();
        self.telemetry.mark_clip_loaded();
        self.delivered = None;
        self.exhausted = false;

        let clip = ClipContext::new(payload.metadata, AudioSource::from(payload.audio));
        let suggested_regions = match &clip.ai {
            Some(ai) => self.regions.create_regions_from_suggestions(&ai.regions),
            None => 0,
        };
        let clip_id = clip.id.clone();
        info!(%clip_id, suggested_regions, annotated = clip.annotated, "clip bound");
        self.clip = Some(clip);

        self.rebind_waveform()?;
        Ok(AdvanceOutcome::Advanced {
            clip_id,
            suggested_regions,
        })
    }

    // ---------------------------------------------------------------------
    // Waveform events and transport
    // ---------------------------------------------------------------------

    /// Forward an event from the playback surface.
    pub fn handle_surface_event(&mut self, event: SurfaceEvent) {
        if let Some(duration) = self.waveform.handle_event(event) {
            self.on_surface_ready(duration);
        }
    }

    /// Drain and handle everything the surface queued.
    pub fn pump_surface(&mut self) {
        loop {
            let events = self.waveform.take_events();
            if events.is_empty() {
                break;
            }
            for event in events {
                self.handle_surface_event(event);
            }
        }
    }

    fn on_surface_ready(&mut self, duration: f64) {
        let dropped = self.regions.set_clip_duration(duration);
        if !dropped.is_empty() {
            debug!(dropped = dropped.len(), duration, "regions outside the clip dropped");
        }
        if let Some(clip) = self.clip.as_mut() {
            clip.duration = Some(duration);
        }

        let Ok(surface) = self.waveform.region_surface() else {
            return;
        };
        let mut failed = Vec::new();
        for region in self.regions.regions() {
            if let Err(err) = surface.add(region) {
                warn!(id = %region.id, error = %format!("{err:#}"), "region could not be drawn; removing");
                failed.push(region.id.clone());
            }
        }
        for id in failed {
            self.regions.remove_region(&id);
        }
    }

    /// Toggle playback; returns whether the clip is now playing.
    pub fn play_pause(&mut self) -> Result<bool> {
        self.waveform.play_pause()
    }

    pub fn skip_forward(&mut self) -> Result<f64> {
        let t = self.waveform.skip_forward()?;
        self.pump_surface();
        Ok(t)
    }

    pub fn skip_backward(&mut self) -> Result<f64> {
        let t = self.waveform.skip_backward()?;
        self.pump_surface();
        Ok(t)
    }

    pub fn seek_relative(&mut self, delta_seconds: f64) -> Result<f64> {
        let t = self.waveform.seek_relative(delta_seconds)?;
        self.pump_surface();
        Ok(t)
    }

    pub fn set_volume(&mut self, level: f64) -> Result<f64> {
        self.waveform.set_volume(level)
    }

    pub fn current_time(&self) -> Result<f64> {
        self.waveform.current_time()
    }

    // ---------------------------------------------------------------------
    // Regions
    // ---------------------------------------------------------------------

    /// Create a region at the playback position and draw it.
    pub fn add_region(&mut self) -> Result<RegionId> {
        let now = self.waveform.current_time()?;
        let region = self
            .regions
            .create_region(now)?
            .last()
            .cloned()
            .ok_or_else(|| Error::msg("region was not created"))?;

        let drawn = self
            .waveform
            .region_surface()
            .and_then(|surface| surface.add(&region).map_err(Error::from));
        if let Err(err) = drawn {
            self.regions.remove_region(&region.id);
            return Err(err);
        }
        Ok(region.id)
    }

    pub fn label_region(&mut self, id: &RegionId, label: impl Into<String>) -> bool {
        self.regions.update_annotation(id, label)
    }

    pub fn comment_region(&mut self, id: &RegionId, text: impl Into<String>) -> bool {
        self.regions.update_comment(id, text)
    }

    /// Remove a region from the set and from the surface.
    pub fn remove_region(&mut self, id: &RegionId) -> Option<Region> {
        let removed = self.regions.remove_region(id)?;
        if let Ok(surface) = self.waveform.region_surface() {
            surface.remove(id);
        }
        Some(removed)
    }

    /// Apply a change the user made directly on the surface.
    pub fn handle_region_event(&mut self, event: RegionEvent) {
        self.regions.apply_event(&event);

        // A rejected resize leaves the surface out of sync; redraw the authoritative bounds.
        if let RegionEvent::UpdateEnd { id, start, end } = &event {
            let Some(region) = self.regions.get(id) else {
                return;
            };
            if region.start != *start || region.end != *end {
                if let Ok(surface) = self.waveform.region_surface() {
                    if let Err(err) = surface.add(region) {
                        warn!(%id, error = %format!("{err:#}"), "failed to redraw region");
                    }
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Telemetry
    // ---------------------------------------------------------------------

    pub fn pointer_moved(&mut self, x: f64, y: f64) -> bool {
        self.telemetry.record_pointer_move(x, y)
    }

    pub fn hover_began(&mut self, key: impl Into<String>) {
        self.telemetry.begin_hover(key);
    }

    pub fn hover_ended(&mut self, key: &str, is_ai_suggested: bool) {
        self.telemetry.end_hover(key, is_ai_suggested);
    }

    pub fn clicked(&mut self) {
        self.telemetry.record_click();
    }

    // ---------------------------------------------------------------------
    // History export
    // ---------------------------------------------------------------------

    /// Write every submission accepted this session, then forget them.
    ///
    /// Returns how many submissions were written.
    pub fn export_history<W: Write>(&mut self, w: W, format: ExportFormat) -> Result<usize> {
        if self.history.is_empty() {
            return Err(Error::msg("no annotations to export"));
        }

        let writer = BufWriter::new(w);
        match format {
            ExportFormat::Json => {
                let mut encoder = JsonArrayEncoder::new(writer);
                let run_res = write_all(&mut encoder, &self.history);
                merge_run_and_close(run_res, encoder.close())?;
            }
            ExportFormat::Vtt => {
                let mut encoder = VttEncoder::new(writer);
                let run_res = write_all(&mut encoder, &self.history);
                merge_run_and_close(run_res, encoder.close())?;
            }
        }

        let written = self.history.len();
        self.history.clear();
        info!(written, ?format, "session annotations exported");
        Ok(written)
    }

    // ---------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------

    pub fn regions(&self) -> &RegionSet {
        &self.regions
    }

    pub fn clip(&self) -> Option<&ClipContext> {
        self.clip.as_ref()
    }

    pub fn telemetry(&self) -> &TelemetryRecorder {
        &self.telemetry
    }

    pub fn waveform(&self) -> &WaveformController<F> {
        &self.waveform
    }

    pub fn waveform_mut(&mut self) -> &mut WaveformController<F> {
        &mut self.waveform
    }

    pub fn identity(&self) -> &IdentityContext {
        &self.identity
    }

    pub fn identity_mut(&mut self) -> &mut IdentityContext {
        &mut self.identity
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn opts(&self) -> &SessionOpts {
        &self.opts
    }

    pub fn history(&self) -> &[AnnotationSubmission] {
        &self.history
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// A handle on the duplicate-advance guard.
    pub fn advance_gate(&self) -> AdvanceGate {
        self.gate.clone()
    }

    pub fn is_advancing(&self) -> bool {
        self.gate.is_busy()
    }
}

fn validate(regions: &RegionSet, policy: ValidityPolicy) -> Result<Vec<Region>> {
    if regions.is_empty() {
        return Err(ValidationError::EmptyRegionSet.into());
    }

    let validation = regions.validate_for_submission(policy);
    if !validation.all_valid {
        let invalid = validation.rejected(regions.len());
        let err = match policy {
            ValidityPolicy::LabelOrComment => ValidationError::MissingClassOrComment { invalid },
            ValidityPolicy::LabelRequired => ValidationError::MissingClass { invalid },
        };
        debug!(invalid, ?policy, "region set rejected");
        return Err(err.into());
    }
    Ok(validation.accepted)
}

fn write_all<E: SubmissionEncoder>(
    encoder: &mut E,
    submissions: &[AnnotationSubmission],
) -> anyhow::Result<()> {
    for submission in submissions {
        encoder.write_submission(submission)?;
    }
    Ok(())
}

fn merge_run_and_close(
    run_res: anyhow::Result<()>,
    close_res: anyhow::Result<()>,
) -> anyhow::Result<()> {
    match (run_res, close_res) {
        (Ok(()), Ok(())) => Ok(()),
        (Ok(()), Err(close_err)) => Err(close_err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(close_err)) => Err(err.context(close_err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_admits_one_advance_at_a_time() {
        let gate = AdvanceGate::default();
        let ui_handle = gate.clone();

        let ticket = gate.try_begin().expect("gate is free");
        assert!(ui_handle.is_busy());
        assert!(gate.try_begin().is_none());

        drop(ticket);
        assert!(!ui_handle.is_busy());
        assert!(gate.try_begin().is_some());
    }

    #[test]
    fn empty_set_is_rejected_before_policy() {
        let err = validate(&RegionSet::new(), ValidityPolicy::LabelOrComment).unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::EmptyRegionSet)
        ));
    }

    #[test]
    fn validation_error_depends_on_policy() -> anyhow::Result<()> {
        let mut set = RegionSet::new();
        set.create_region(0.0)?;

        let err = validate(&set, ValidityPolicy::LabelRequired).unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::MissingClass { invalid: 1 })
        ));
        let err = validate(&set, ValidityPolicy::LabelOrComment).unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::MissingClassOrComment { invalid: 1 })
        ));
        Ok(())
    }

    #[test]
    fn close_error_is_kept_when_run_fails() {
        let merged = merge_run_and_close(
            Err(anyhow::anyhow!("write failed")),
            Err(anyhow::anyhow!("flush failed")),
        )
        .unwrap_err();
        let chain = format!("{merged:#}");
        assert!(chain.contains("write failed"));
        assert!(chain.contains("flush failed"));
    }
}
