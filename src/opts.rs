use std::time::Duration;

use crate::clip::ClipSelection;
use crate::region::{DEFAULT_REGION_SECONDS, ValidityPolicy};
use crate::telemetry::DEFAULT_SAMPLE_INTERVAL_MS;
use crate::waveform::DEFAULT_SKIP_SECONDS;

/// Options that control how an annotation session behaves.
///
/// This struct represents *library-level configuration*, not CLI flags directly.
/// Frontends map their own input (flags, settings screens) into this type.
#[derive(Debug, Clone)]
pub struct SessionOpts {
    /// Which regions count as complete when advancing.
    pub validity: ValidityPolicy,

    /// Which pool the next clip is drawn from.
    pub clip_selection: ClipSelection,

    /// What to do when the next-clip request fails after a successful submit.
    pub fetch_retry: FetchRetry,

    /// Check the token against the server before every submit.
    pub verify_token_before_submit: bool,

    /// Increment used by skip-forward/back, in seconds.
    pub skip_seconds: f64,

    /// Span of regions created from the playback position, in seconds.
    pub default_region_seconds: f64,

    /// Minimum spacing between recorded pointer samples.
    pub pointer_sample_interval_ms: u64,
}

impl Default for SessionOpts {
    fn default() -> Self {
        Self {
            validity: ValidityPolicy::default(),
            clip_selection: ClipSelection::default(),
            fetch_retry: FetchRetry::default(),
            verify_token_before_submit: true,
            skip_seconds: DEFAULT_SKIP_SECONDS,
            default_region_seconds: DEFAULT_REGION_SECONDS,
            pointer_sample_interval_ms: DEFAULT_SAMPLE_INTERVAL_MS,
        }
    }
}

/// Retry policy for fetching the next clip.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FetchRetry {
    /// Report the failure; the user retries the advance.
    #[default]
    Manual,

    /// Retry up to `attempts` more times, sleeping `backoff` between tries.
    /// Authentication failures are never retried.
    Automatic { attempts: u32, backoff: Duration },
}
