//! `clipmark` — the session engine behind an audio-clip annotation tool.
//!
//! This crate provides:
//! - Region editing on the clip being annotated
//! - Behavioral telemetry (pointer path, hover dwell, click delays)
//! - Waveform lifecycle and transport control behind a pluggable surface
//! - The clip-advance protocol: validate, submit, fetch the next clip, rebind
//! - Pluggable export encoders for a session's submissions (JSON, VTT)
//!
//! Rendering and transport are abstracted behind traits (`SurfaceFactory`, `AnnotationApi`),
//! so the same session drives a GUI, the bundled terminal client, or a test harness.

// High-level API (most consumers should start here).
pub mod opts;
pub mod session;

// Session components.
pub mod identity;
pub mod region;
pub mod telemetry;
pub mod waveform;

// Clips and what gets sent for them.
pub mod clip;
pub mod submission;

// Network boundary.
pub mod api;
#[cfg(feature = "http")]
pub mod http;

// Surfaces and time.
pub mod clock;
pub mod headless;

// Export selection and encoder interfaces.
pub mod export_format;
pub mod submission_encoder;

// Export encoders that serialize submissions into various formats.
pub mod json_array_encoder;
pub mod vtt_encoder;

// Logging configuration and control.
#[cfg(feature = "logging")]
pub mod logging;

mod error;

pub use error::{Error, NetworkStage, Result, ValidationError};
pub use opts::{FetchRetry, SessionOpts};
pub use session::{AdvanceGate, AdvanceOutcome, AnnotationSession};
