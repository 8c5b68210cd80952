//! Pitch and tempo processing.
//!
//! Three strategies, picked by [`PitchMode`]:
//!
//! - **tape**: plain rate change, pitch and duration move together.
//! - **granular**: resample by the pitch ratio, then overlap-add stretch
//!   back to the requested tempo.
//! - **hq**: a [`StretchBackend`] (WSOLA by default), degrading to the
//!   granular algorithm with the larger `hq` grain profile when the
//!   backend fails or the source has more than two channels.

pub mod granular;
pub mod wsola;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;

use crate::buffer::{AudioBuffer, read_interpolated, resample_linear, resampled_len};
use crate::settings::{PitchMode, Settings};

pub use granular::{GrainStream, granular_stretch, stretched_len};
pub use wsola::Wsola;

/// Grain and search-window parameters of one quality level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StretchProfile {
    /// Grain length in samples; also the WSOLA yield interval.
    pub buffer_size: usize,
    pub sequence_ms: f64,
    pub seek_window_ms: f64,
    pub overlap_ms: f64,
    pub quick_seek: bool,
    /// Fraction of a grain shared with its neighbour in the granular path.
    pub grain_overlap: f64,
}

impl StretchProfile {
    pub const GRANULAR: StretchProfile = StretchProfile {
        buffer_size: 2048,
        sequence_ms: 56.0,
        seek_window_ms: 18.0,
        overlap_ms: 8.0,
        quick_seek: true,
        grain_overlap: 0.5,
    };

    pub const HQ: StretchProfile = StretchProfile {
        buffer_size: 4096,
        sequence_ms: 82.0,
        seek_window_ms: 24.0,
        overlap_ms: 12.0,
        quick_seek: false,
        grain_overlap: 0.75,
    };

    pub fn for_mode(mode: PitchMode) -> &'static StretchProfile {
        match mode {
            PitchMode::Hq => &Self::HQ,
            PitchMode::Tape | PitchMode::Granular => &Self::GRANULAR,
        }
    }

    pub fn grain_size(&self) -> usize {
        self.buffer_size.max(1)
    }

    /// Output advance between grains.
    pub fn synthesis_hop(&self) -> usize {
        ((self.grain_size() as f64 * (1.0 - self.grain_overlap)).round() as usize).max(1)
    }
}

/// Why a stretch backend produced nothing usable.
#[derive(Debug, Error)]
pub enum StretchError {
    #[error("stretch backend supports at most 2 channels, got {0}")]
    TooManyChannels(usize),

    #[error("input too short to stretch: {len} frames, need {needed}")]
    InputTooShort { len: usize, needed: usize },

    #[error("stretch backend produced no output")]
    NoOutput,

    #[error("stretch backend failed: {0}")]
    Backend(String),
}

pub type StretchFuture<'a> =
    Pin<Box<dyn Future<Output = std::result::Result<Vec<Vec<f32>>, StretchError>> + Send + 'a>>;

/// A pitch-preserving time stretcher used by `hq` mode.
///
/// `ratio` is output length over input length; pitch must not change.
pub trait StretchBackend: Send + Sync {
    fn name(&self) -> &str;

    fn stretch<'a>(
        &'a self,
        channels: &'a [Vec<f32>],
        ratio: f64,
        sample_rate: u32,
        profile: &'a StretchProfile,
    ) -> StretchFuture<'a>;
}

/// Apply the pitch shift and tempo of `settings` to `buffer`.
///
/// Never fails: a failing `hq` backend degrades to granular.
pub async fn apply_pitch_tempo(
    buffer: &AudioBuffer,
    settings: &Settings,
    backend: &dyn StretchBackend,
) -> AudioBuffer {
    let pitch = settings.pitch_ratio();
    let tempo = settings.tempo_clamped();
    let channels = match settings.pitch_mode {
        PitchMode::Tape => tape(buffer.channels(), settings.tape_rate()).await,
        PitchMode::Granular => granular(buffer.channels(), pitch, tempo, &StretchProfile::GRANULAR).await,
        PitchMode::Hq => hq(buffer, pitch, tempo, backend).await,
    };
    rebuild(channels, buffer)
}

fn rebuild(channels: Vec<Vec<f32>>, like: &AudioBuffer) -> AudioBuffer {
    AudioBuffer::new(channels, like.sample_rate()).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "pitch stage produced an invalid buffer, passing source through");
        like.clone()
    })
}

async fn tape(channels: &[Vec<f32>], rate: f64) -> Vec<Vec<f32>> {
    let mut out = Vec::with_capacity(channels.len());
    for ch in channels {
        out.push(resample_linear(ch, rate).await);
    }
    out
}

/// Resample by `pitch`, then stretch by `pitch / tempo` in one pass.
async fn granular(channels: &[Vec<f32>], pitch: f64, tempo: f64, profile: &StretchProfile) -> Vec<Vec<f32>> {
    let resampled = if (pitch - 1.0).abs() > f64::EPSILON {
        tape(channels, pitch).await
    } else {
        channels.to_vec()
    };
    granular_stretch(&resampled, pitch / tempo, profile).await
}

async fn hq(buffer: &AudioBuffer, pitch: f64, tempo: f64, backend: &dyn StretchBackend) -> Vec<Vec<f32>> {
    let profile = &StretchProfile::HQ;
    if buffer.channel_count() > 2 {
        tracing::debug!(
            channels = buffer.channel_count(),
            "hq stretch supports mono/stereo only, using granular"
        );
        return granular(buffer.channels(), pitch, tempo, profile).await;
    }

    let target = stretched_len(buffer.len(), pitch, tempo);
    let result = backend
        .stretch(buffer.channels(), pitch / tempo, buffer.sample_rate(), profile)
        .await
        .and_then(|out| {
            if out.first().is_none_or(Vec::is_empty) {
                Err(StretchError::NoOutput)
            } else {
                Ok(out)
            }
        });

    match result {
        Ok(stretched) => {
            let mut out = Vec::with_capacity(stretched.len());
            for ch in &stretched {
                let mut shifted = if (pitch - 1.0).abs() > f64::EPSILON {
                    resample_linear(ch, pitch).await
                } else {
                    ch.clone()
                };
                shifted.resize(target, 0.0);
                out.push(shifted);
            }
            out
        }
        Err(e) => {
            tracing::warn!(backend = backend.name(), error = %e, "hq stretch failed, falling back to granular");
            granular(buffer.channels(), pitch, tempo, profile).await
        }
    }
}

/// Plays the source back at a fixed rate (tape mode, live).
#[derive(Debug, Clone)]
pub struct RateSource {
    source: Arc<AudioBuffer>,
    rate: f64,
    position: usize,
    total: usize,
}

impl RateSource {
    pub fn new(source: Arc<AudioBuffer>, rate: f64) -> Self {
        let total = resampled_len(source.len(), rate);
        RateSource {
            source,
            rate,
            position: 0,
            total,
        }
    }

    pub fn total_frames(&self) -> usize {
        self.total
    }

    /// Write the next frame; `false` once the source is exhausted.
    pub fn next_frame(&mut self, frame: &mut [f32]) -> bool {
        if self.position >= self.total {
            return false;
        }
        let pos = self.position as f64 * self.rate;
        for (ch, s) in frame.iter_mut().enumerate() {
            *s = read_interpolated(self.source.channel(ch), pos);
        }
        self.position += 1;
        true
    }
}

/// The live pitch/tempo strategy instance.
#[derive(Debug)]
pub enum LiveSource {
    Tape(RateSource),
    Grains(GrainStream),
    /// `hq` output stretched ahead of playback.
    Prepared(RateSource),
}

impl LiveSource {
    /// Strategy for `settings`.
    ///
    /// Tape and granular stream straight from `source`. `hq` runs
    /// [`apply_pitch_tempo`] once, so the backend and its granular
    /// fallback are exactly those of an offline render, and plays the
    /// result.
    pub async fn prepare(source: Arc<AudioBuffer>, settings: &Settings, backend: &dyn StretchBackend) -> Self {
        match settings.pitch_mode {
            PitchMode::Tape => LiveSource::Tape(RateSource::new(source, settings.tape_rate())),
            PitchMode::Granular => LiveSource::Grains(GrainStream::new(
                source,
                settings.pitch_ratio(),
                settings.tempo_clamped(),
                &StretchProfile::GRANULAR,
            )),
            PitchMode::Hq => {
                let stretched = apply_pitch_tempo(&source, settings, backend).await;
                LiveSource::Prepared(RateSource::new(Arc::new(stretched), 1.0))
            }
        }
    }

    pub fn total_frames(&self) -> usize {
        match self {
            LiveSource::Tape(s) | LiveSource::Prepared(s) => s.total_frames(),
            LiveSource::Grains(s) => s.total_frames(),
        }
    }

    pub fn next_frame(&mut self, frame: &mut [f32]) -> bool {
        match self {
            LiveSource::Tape(s) | LiveSource::Prepared(s) => s.next_frame(frame),
            LiveSource::Grains(s) => s.next_frame(frame),
        }
    }
}
