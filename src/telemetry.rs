//! Behavioral telemetry captured while one clip is being annotated.
//!
//! We record:
//! - a debounced pointer path (one sample per `sample_interval_ms` at most)
//! - per-element hover dwell time, plus a counter for hovers over AI-suggested labels
//! - raw click timestamps, converted to delays relative to clip load at snapshot time
//!
//! The recorder never persists anything on its own. The session snapshots it into a
//! submission and resets it only after that submission went through and the next clip is
//! bound, so a failed advance never loses telemetry.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::clock::SharedClock;

/// Minimum spacing between recorded pointer samples.
pub const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 100;

/// One recorded pointer position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MousePosition {
    pub x: f64,
    pub y: f64,
    /// Capture time in milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// Immutable copy of everything recorded for the current clip.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub mouse_path: Vec<MousePosition>,
    pub hover_durations: BTreeMap<String, u64>,
    pub ai_hover_count: u32,
    pub click_timestamps: Vec<u64>,
    pub clip_loaded_at: Option<u64>,
}

impl TelemetrySnapshot {
    /// Click times as millisecond delays since the clip was loaded.
    ///
    /// If no load time was marked, delays are measured from the first click.
    pub fn click_delays(&self) -> Vec<u64> {
        let origin = match self.clip_loaded_at {
            Some(loaded) => loaded,
            None => match self.click_timestamps.first() {
                Some(first) => *first,
                None => return Vec::new(),
            },
        };
        self.click_timestamps
            .iter()
            .map(|t| t.saturating_sub(origin))
            .collect()
    }
}

pub struct TelemetryRecorder {
    clock: SharedClock,
    sample_interval_ms: u64,

    mouse_path: Vec<MousePosition>,
    last_sample_at: Option<u64>,

    // Open hover intervals, keyed by UI element.
    hover_started: HashMap<String, u64>,
    hover_durations: BTreeMap<String, u64>,
    ai_hover_count: u32,

    clicks: Vec<u64>,
    clip_loaded_at: Option<u64>,
}

impl TelemetryRecorder {
    pub fn new(clock: SharedClock) -> Self {
        Self::with_sample_interval(clock, DEFAULT_SAMPLE_INTERVAL_MS)
    }

    pub fn with_sample_interval(clock: SharedClock, sample_interval_ms: u64) -> Self {
        Self {
            clock,
            sample_interval_ms,
            mouse_path: Vec::new(),
            last_sample_at: None,
            hover_started: HashMap::new(),
            hover_durations: BTreeMap::new(),
            ai_hover_count: 0,
            clicks: Vec::new(),
            clip_loaded_at: None,
        }
    }

    /// Record a pointer position if the sampling interval has elapsed.
    ///
    /// Returns whether the sample was kept.
    pub fn record_pointer_move(&mut self, x: f64, y: f64) -> bool {
        let now = self.clock.now_ms();
        if let Some(last) = self.last_sample_at {
            if now.saturating_sub(last) < self.sample_interval_ms {
                return false;
            }
        }

        self.mouse_path.push(MousePosition {
            x,
            y,
            timestamp: now,
        });
        self.last_sample_at = Some(now);
        true
    }

    /// Open a hover interval for `key`. A second begin restarts the interval.
    pub fn begin_hover(&mut self, key: impl Into<String>) {
        let now = self.clock.now_ms();
        self.hover_started.insert(key.into(), now);
    }

    /// Close the hover interval for `key`.
    ///
    /// Without a matching begin this is a no-op, including for the AI-hover counter.
    pub fn end_hover(&mut self, key: &str, is_ai_suggested: bool) {
        let Some(started) = self.hover_started.remove(key) else {
            return;
        };

        let elapsed = self.clock.now_ms().saturating_sub(started);
        *self.hover_durations.entry(key.to_owned()).or_insert(0) += elapsed;
        if is_ai_suggested {
            self.ai_hover_count = self.ai_hover_count.saturating_add(1);
        }
    }

    pub fn record_click(&mut self) {
        let now = self.clock.now_ms();
        self.clicks.push(now);
    }

    pub fn mark_clip_loaded(&mut self) {
        self.clip_loaded_at = Some(self.clock.now_ms());
    }

    pub fn clip_loaded_at(&self) -> Option<u64> {
        self.clip_loaded_at
    }

    /// Milliseconds since the clip was loaded (0 if it never was).
    pub fn elapsed_since_load_ms(&self) -> u64 {
        match self.clip_loaded_at {
            Some(loaded) => self.clock.now_ms().saturating_sub(loaded),
            None => 0,
        }
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            mouse_path: self.mouse_path.clone(),
            hover_durations: self.hover_durations.clone(),
            ai_hover_count: self.ai_hover_count,
            click_timestamps: self.clicks.clone(),
            clip_loaded_at: self.clip_loaded_at,
        }
    }

    pub fn reset(&mut self) {
        self.mouse_path.clear();
        self.last_sample_at = None;
        self.hover_started.clear();
        self.hover_durations.clear();
        self.ai_hover_count = 0;
        self.clicks.clear();
        self.clip_loaded_at = None;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::{Clock, ManualClock};

    fn recorder() -> (ManualClock, TelemetryRecorder) {
        let clock = ManualClock::new(10_000);
        let rec = TelemetryRecorder::new(Arc::new(clock.clone()));
        (clock, rec)
    }

    #[test]
    fn pointer_samples_are_debounced() {
        let (clock, mut rec) = recorder();

        // Offsets (ms) between successive raw events.
        let gaps = [0, 30, 30, 50, 100, 10, 99, 1, 250];
        let mut expected = 0;
        let mut last_kept: Option<u64> = None;
        for gap in gaps {
            clock.advance(gap);
            let now = clock.now_ms();
            let should_keep = last_kept.is_none_or(|last| now - last >= 100);
            if should_keep {
                expected += 1;
                last_kept = Some(now);
            }
            assert_eq!(rec.record_pointer_move(1.0, 2.0), should_keep);
        }

        let snap = rec.snapshot();
        assert_eq!(snap.mouse_path.len(), expected);
        for pair in snap.mouse_path.windows(2) {
            assert!(pair[1].timestamp - pair[0].timestamp >= 100);
        }
    }

    #[test]
    fn hover_adds_exact_elapsed_time() {
        let (clock, mut rec) = recorder();

        rec.begin_hover("class-dog");
        clock.advance(340);
        rec.end_hover("class-dog", false);

        rec.begin_hover("class-dog");
        clock.advance(60);
        rec.end_hover("class-dog", true);

        let snap = rec.snapshot();
        assert_eq!(snap.hover_durations.get("class-dog"), Some(&400));
        assert_eq!(snap.ai_hover_count, 1);
    }

    #[test]
    fn hover_end_without_begin_is_a_no_op() {
        let (clock, mut rec) = recorder();
        rec.begin_hover("a");
        clock.advance(20);
        rec.end_hover("a", true);
        let before = rec.snapshot();

        clock.advance(500);
        rec.end_hover("b", true);
        // A closed interval cannot be ended twice.
        rec.end_hover("a", true);

        assert_eq!(rec.snapshot(), before);
    }

    #[test]
    fn click_delays_are_relative_to_clip_load() {
        let (clock, mut rec) = recorder();
        rec.mark_clip_loaded();
        clock.advance(1_500);
        rec.record_click();
        clock.advance(250);
        rec.record_click();

        assert_eq!(rec.snapshot().click_delays(), vec![1_500, 1_750]);
        assert_eq!(rec.elapsed_since_load_ms(), 1_750);
    }

    #[test]
    fn click_delays_without_load_time_start_at_first_click() {
        let (clock, mut rec) = recorder();
        rec.record_click();
        clock.advance(70);
        rec.record_click();
        assert_eq!(rec.snapshot().click_delays(), vec![0, 70]);
    }

    #[test]
    fn snapshot_does_not_reset_but_reset_clears_everything() {
        let (clock, mut rec) = recorder();
        rec.mark_clip_loaded();
        rec.record_pointer_move(3.0, 4.0);
        rec.begin_hover("x");
        clock.advance(10);
        rec.end_hover("x", true);
        rec.record_click();

        let first = rec.snapshot();
        assert_eq!(rec.snapshot(), first);
        assert_eq!(first.mouse_path.len(), 1);

        rec.reset();
        assert_eq!(rec.snapshot(), TelemetrySnapshot::default());

        // Sampling starts fresh after a reset.
        assert!(rec.record_pointer_move(0.0, 0.0));
    }
}
