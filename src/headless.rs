//! A playback surface with no rendering, driven by an explicit clock.
//!
//! The CLI and the test-suite bind clips to this surface. It decodes the WAV header with
//! `hound` to learn the clip duration, keeps a playhead that only moves when [`HeadlessSurface::tick`]
//! is called, and tracks which regions are "drawn".

use std::collections::VecDeque;
use std::io::Cursor;

use anyhow::{Context, bail};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use crate::region::{Region, RegionId, RegionSurface};
use crate::waveform::{AudioSource, PlaybackSurface, SurfaceEvent, SurfaceFactory};

/// The regions layer of a [`HeadlessSurface`].
#[derive(Debug, Default)]
pub struct HeadlessRegions {
    duration: f64,
    drawn: Vec<Region>,
}

impl HeadlessRegions {
    pub fn drawn(&self) -> &[Region] {
        &self.drawn
    }

    pub fn is_drawn(&self, id: &RegionId) -> bool {
        self.drawn.iter().any(|r| &r.id == id)
    }
}

impl RegionSurface for HeadlessRegions {
    fn add(&mut self, region: &Region) -> anyhow::Result<()> {
        if region.start < 0.0 || region.end > self.duration || region.start >= region.end {
            bail!(
                "region {} [{}, {}] does not fit a {}s clip",
                region.id,
                region.start,
                region.end,
                self.duration
            );
        }
        self.drawn.retain(|r| r.id != region.id);
        self.drawn.push(region.clone());
        Ok(())
    }

    fn remove(&mut self, id: &RegionId) {
        self.drawn.retain(|r| &r.id != id);
    }
}

#[derive(Debug)]
pub struct HeadlessSurface {
    duration: f64,
    time: f64,
    playing: bool,
    volume: f64,
    regions: HeadlessRegions,
    events: VecDeque<SurfaceEvent>,
    destroyed: bool,
}

impl HeadlessSurface {
    /// A surface for a clip of `duration` seconds. `Ready` is queued immediately.
    pub fn with_duration(duration: f64) -> Self {
        let mut events = VecDeque::new();
        events.push_back(SurfaceEvent::Ready);
        Self {
            duration,
            time: 0.0,
            playing: false,
            volume: 1.0,
            regions: HeadlessRegions {
                duration,
                drawn: Vec::new(),
            },
            events,
            destroyed: false,
        }
    }

    /// Advance the playhead by `seconds` if playing.
    pub fn tick(&mut self, seconds: f64) {
        if !self.playing || self.destroyed {
            return;
        }
        self.time += seconds.max(0.0);
        if self.time >= self.duration {
            self.time = self.duration;
            self.playing = false;
            self.events.push_back(SurfaceEvent::Finish);
        } else {
            self.events.push_back(SurfaceEvent::AudioProcess);
        }
    }

    pub fn volume(&self) -> f64 {
        self.volume
    }

    pub fn drawn_regions(&self) -> &HeadlessRegions {
        &self.regions
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

impl PlaybackSurface for HeadlessSurface {
    fn duration(&self) -> f64 {
        self.duration
    }

    fn current_time(&self) -> f64 {
        self.time
    }

    fn set_time(&mut self, seconds: f64) {
        self.time = seconds.clamp(0.0, self.duration);
        self.events.push_back(SurfaceEvent::Seeking);
    }

    fn play(&mut self) {
        self.playing = true;
    }

    fn pause(&mut self) {
        self.playing = false;
    }

    fn is_playing(&self) -> bool {
        self.playing
    }

    fn set_volume(&mut self, level: f64) {
        self.volume = level;
    }

    fn regions(&mut self) -> &mut dyn RegionSurface {
        &mut self.regions
    }

    fn destroy(&mut self) {
        self.playing = false;
        self.regions.drawn.clear();
        self.events.clear();
        self.destroyed = true;
    }

    fn take_events(&mut self) -> Vec<SurfaceEvent> {
        self.events.drain(..).collect()
    }
}

/// Builds [`HeadlessSurface`]s from WAV audio.
#[derive(Debug, Default)]
pub struct HeadlessFactory {
    created: usize,
}

impl HeadlessFactory {
    /// How many surfaces this factory has produced.
    pub fn created(&self) -> usize {
        self.created
    }
}

impl SurfaceFactory for HeadlessFactory {
    type Surface = HeadlessSurface;

    fn create(&mut self, source: &AudioSource) -> anyhow::Result<HeadlessSurface> {
        let duration = match source {
            AudioSource::Bytes(bytes) => {
                let reader = WavReader::new(Cursor::new(&bytes[..]))
                    .context("failed to read WAV data from clip payload")?;
                wav_duration(reader.spec(), reader.duration())
            }
            AudioSource::Path(path) => {
                let reader = WavReader::open(path)
                    .with_context(|| format!("failed to open WAV file {}", path.display()))?;
                wav_duration(reader.spec(), reader.duration())
            }
            AudioSource::Url(url) => bail!("headless surface cannot stream {url}"),
        }?;

        self.created += 1;
        Ok(HeadlessSurface::with_duration(duration))
    }
}

fn wav_duration(spec: WavSpec, frames: u32) -> anyhow::Result<f64> {
    if spec.sample_rate == 0 {
        bail!("WAV header reports a zero sample rate");
    }
    Ok(frames as f64 / spec.sample_rate as f64)
}

/// Encode `seconds` of mono 16-bit silence as an in-memory WAV file.
pub fn wav_bytes(seconds: f64, sample_rate: u32) -> anyhow::Result<Vec<u8>> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let frames = (seconds.max(0.0) * sample_rate as f64).round() as u64;

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, spec).context("failed to start WAV writer")?;
        for _ in 0..frames {
            writer.write_sample(0i16)?;
        }
        writer.finalize().context("failed to finalize WAV data")?;
    }
    Ok(cursor.into_inner())
}
