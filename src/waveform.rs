//! Lifecycle and transport control for the playback surface bound to one clip.
//!
//! The controller never draws anything. A [`SurfaceFactory`] produces the concrete
//! [`PlaybackSurface`] (a browser waveform, a native widget, or the headless surface used by
//! the CLI and tests), and the controller enforces the state machine around it:
//!
//! `Uninitialized → Loading → Ready → (Playing ⇄ Paused) → Destroyed`
//!
//! Surfaces report asynchronous happenings (ready, progress, end of clip) as
//! [`SurfaceEvent`]s. Surfaces that produce events synchronously queue them and the owner
//! drains them with [`WaveformController::take_events`].

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::region::RegionSurface;

/// Fixed increment used by skip-forward/back.
pub const DEFAULT_SKIP_SECONDS: f64 = 0.05;

/// Where the audio for a clip comes from.
#[derive(Clone)]
pub enum AudioSource {
    /// The audio payload itself, as delivered by the clip endpoint.
    Bytes(Arc<[u8]>),
    Path(PathBuf),
    Url(String),
}

impl std::fmt::Debug for AudioSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioSource::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            AudioSource::Path(path) => f.debug_tuple("Path").field(path).finish(),
            AudioSource::Url(url) => f.debug_tuple("Url").field(url).finish(),
        }
    }
}

impl From<Vec<u8>> for AudioSource {
    fn from(bytes: Vec<u8>) -> Self {
        AudioSource::Bytes(bytes.into())
    }
}

/// Something a surface reports back to its controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SurfaceEvent {
    /// Audio is decoded and the duration is known.
    Ready,
    /// Playback progressed.
    AudioProcess,
    /// The playhead was moved.
    Seeking,
    /// Playback reached the end of the clip.
    Finish,
}

/// A rendered, playable view of one clip.
pub trait PlaybackSurface {
    fn duration(&self) -> f64;
    fn current_time(&self) -> f64;
    fn set_time(&mut self, seconds: f64);
    fn play(&mut self);
    fn pause(&mut self);
    fn is_playing(&self) -> bool;
    fn set_volume(&mut self, level: f64);

    /// The regions layer drawn over this surface.
    fn regions(&mut self) -> &mut dyn RegionSurface;

    /// Release everything bound to this surface.
    fn destroy(&mut self);

    /// Drain events the surface queued synchronously.
    fn take_events(&mut self) -> Vec<SurfaceEvent> {
        Vec::new()
    }
}

/// Creates surfaces bound to an audio source.
pub trait SurfaceFactory {
    type Surface: PlaybackSurface;

    /// Fail if the source is unreachable or not decodable.
    fn create(&mut self, source: &AudioSource) -> anyhow::Result<Self::Surface>;
}

/// Callback receiving a time in seconds.
pub type TimeHook = Arc<dyn Fn(f64) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaveformState {
    Uninitialized,
    Loading,
    Ready,
    Playing,
    Paused,
    Destroyed,
}

impl WaveformState {
    /// Whether transport and region operations are allowed.
    pub fn is_ready(self) -> bool {
        matches!(
            self,
            WaveformState::Ready | WaveformState::Playing | WaveformState::Paused
        )
    }
}

pub struct WaveformController<F: SurfaceFactory> {
    factory: F,
    surface: Option<F::Surface>,
    state: WaveformState,
    skip_seconds: f64,
    on_time_update: Option<TimeHook>,
    on_duration_ready: Option<TimeHook>,
}

impl<F: SurfaceFactory> WaveformController<F> {
    pub fn new(factory: F) -> Self {
        Self::with_skip_seconds(factory, DEFAULT_SKIP_SECONDS)
    }

    pub fn with_skip_seconds(factory: F, skip_seconds: f64) -> Self {
        Self {
            factory,
            surface: None,
            state: WaveformState::Uninitialized,
            skip_seconds,
            on_time_update: None,
            on_duration_ready: None,
        }
    }

    pub fn state(&self) -> WaveformState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    pub fn skip_seconds(&self) -> f64 {
        self.skip_seconds
    }

    /// Bind a new surface to `source`.
    ///
    /// The previous surface must have been destroyed first; initializing over a live surface
    /// would leak it. On failure the controller stays `Uninitialized`.
    pub fn initialize(
        &mut self,
        source: &AudioSource,
        on_time_update: TimeHook,
        on_duration_ready: TimeHook,
    ) -> Result<()> {
        match self.state {
            WaveformState::Uninitialized | WaveformState::Destroyed => {}
            _ => return Err(Error::StaleSurface),
        }

        let surface = match self.factory.create(source) {
            Ok(surface) => surface,
            Err(err) => {
                self.state = WaveformState::Uninitialized;
                warn!(error = %format!("{err:#}"), ?source, "waveform initialization failed");
                return Err(Error::AudioUnavailable(format!("{err:#}")));
            }
        };

        self.surface = Some(surface);
        self.on_time_update = Some(on_time_update);
        self.on_duration_ready = Some(on_duration_ready);
        self.state = WaveformState::Loading;
        debug!(?source, "waveform surface bound");
        Ok(())
    }

    /// React to a surface event.
    ///
    /// Returns the clip duration when the event completed loading.
    pub fn handle_event(&mut self, event: SurfaceEvent) -> Option<f64> {
        let surface = self.surface.as_mut()?;

        match event {
            SurfaceEvent::Ready => {
                if self.state != WaveformState::Loading {
                    return None;
                }
                self.state = WaveformState::Ready;
                let duration = surface.duration();
                if let Some(hook) = &self.on_duration_ready {
                    hook(duration);
                }
                self.report_time();
                Some(duration)
            }
            SurfaceEvent::AudioProcess | SurfaceEvent::Seeking => {
                self.report_time();
                None
            }
            SurfaceEvent::Finish => {
                // Clips loop rather than stop.
                surface.set_time(0.0);
                surface.play();
                self.state = WaveformState::Playing;
                self.report_time();
                None
            }
        }
    }

    /// Drain the events a synchronous surface queued.
    pub fn take_events(&mut self) -> Vec<SurfaceEvent> {
        match self.surface.as_mut() {
            Some(surface) => surface.take_events(),
            None => Vec::new(),
        }
    }

    /// Toggle playback and return the new playing state.
    pub fn play_pause(&mut self) -> Result<bool> {
        let surface = self.ready_surface()?;
        if surface.is_playing() {
            surface.pause();
        } else {
            surface.play();
        }
        let playing = surface.is_playing();
        self.state = if playing {
            WaveformState::Playing
        } else {
            WaveformState::Paused
        };
        Ok(playing)
    }

    /// Move the playhead by `delta_seconds`, clamped to the clip. Returns the new time.
    pub fn seek_relative(&mut self, delta_seconds: f64) -> Result<f64> {
        if !delta_seconds.is_finite() {
            return Err(Error::msg(format!("invalid seek delta: {delta_seconds}")));
        }
        let surface = self.ready_surface()?;
        let target = (surface.current_time() + delta_seconds).clamp(0.0, surface.duration());
        surface.set_time(target);
        self.report_time();
        Ok(target)
    }

    pub fn skip_forward(&mut self) -> Result<f64> {
        self.seek_relative(self.skip_seconds)
    }

    pub fn skip_backward(&mut self) -> Result<f64> {
        self.seek_relative(-self.skip_seconds)
    }

    /// Set the volume, clamped into `[0, 1]`.
    pub fn set_volume(&mut self, level: f64) -> Result<f64> {
        if !level.is_finite() {
            return Err(Error::msg(format!("invalid volume: {level}")));
        }
        let level = level.clamp(0.0, 1.0);
        self.ready_surface()?.set_volume(level);
        Ok(level)
    }

    pub fn current_time(&self) -> Result<f64> {
        match (&self.surface, self.state.is_ready()) {
            (Some(surface), true) => Ok(surface.current_time()),
            _ => Err(Error::NotReady(self.state)),
        }
    }

    pub fn duration(&self) -> Option<f64> {
        match (&self.surface, self.state.is_ready()) {
            (Some(surface), true) => Some(surface.duration()),
            _ => None,
        }
    }

    /// The regions layer of a ready surface.
    pub fn region_surface(&mut self) -> Result<&mut dyn RegionSurface> {
        Ok(self.ready_surface()?.regions())
    }

    /// Direct access to the bound surface, e.g. to drive a headless clock.
    pub fn surface_mut(&mut self) -> Option<&mut F::Surface> {
        self.surface.as_mut()
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Release the bound surface. Safe to call in any state.
    pub fn destroy(&mut self) {
        if let Some(mut surface) = self.surface.take() {
            surface.destroy();
            debug!("waveform surface destroyed");
        }
        self.on_time_update = None;
        self.on_duration_ready = None;
        if self.state != WaveformState::Uninitialized {
            self.state = WaveformState::Destroyed;
        }
    }

    fn ready_surface(&mut self) -> Result<&mut F::Surface> {
        if !self.state.is_ready() {
            return Err(Error::NotReady(self.state));
        }
        self.surface.as_mut().ok_or(Error::NotReady(self.state))
    }

    fn report_time(&self) {
        if let (Some(surface), Some(hook)) = (&self.surface, &self.on_time_update) {
            hook(surface.current_time());
        }
    }
}

impl<F: SurfaceFactory> Drop for WaveformController<F> {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Format seconds as `m:ss.mmm` for transport displays.
pub fn format_time(seconds: f64) -> String {
    let seconds = if seconds.is_finite() {
        seconds.max(0.0)
    } else {
        0.0
    };
    let total_ms = (seconds * 1000.0).floor() as u64;
    let ms = total_ms % 1000;
    let total_s = total_ms / 1000;
    let sec = total_s % 60;
    let min = total_s / 60;
    format!("{min}:{sec:02}.{ms:03}")
}

/// A hook that ignores its input.
pub fn noop_hook() -> TimeHook {
    Arc::new(|_| {})
}
