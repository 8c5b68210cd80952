//! Audio buffers and the primitive operations on them.
//!
//! Buffers are planar: one `Vec<f32>` per channel, all the same length.
//! Operations never mutate their input; every derived buffer is a new
//! allocation.

use std::f32::consts::PI;

use crate::error::{LabError, Result};

/// Samples processed between cooperative yields in offline loops.
pub const RESAMPLE_CHUNK: usize = 32_768;

/// Smallest resampling ratio accepted before flooring.
pub const MIN_RESAMPLE_RATIO: f64 = 1e-3;

/// A decoded, planar audio buffer.
///
/// Used both for the caller's source and for rendered output.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    sample_rate: u32,
    channels: Vec<Vec<f32>>,
}

impl AudioBuffer {
    /// Build a buffer, validating the input contract: at least one
    /// channel, a positive sample rate, equal channel lengths.
    pub fn new(channels: Vec<Vec<f32>>, sample_rate: u32) -> Result<Self> {
        if channels.is_empty() {
            return Err(LabError::InvalidSource("no channels".into()));
        }
        if sample_rate == 0 {
            return Err(LabError::InvalidSource("sample rate must be positive".into()));
        }
        let len = channels[0].len();
        if channels.iter().any(|c| c.len() != len) {
            return Err(LabError::InvalidSource(
                "channels have different lengths".into(),
            ));
        }
        Ok(AudioBuffer {
            sample_rate,
            channels,
        })
    }

    /// Buffer of silence.
    pub fn silent(channel_count: usize, frames: usize, sample_rate: u32) -> Result<Self> {
        Self::new(vec![vec![0.0; frames]; channel_count], sample_rate)
    }

    /// Build from interleaved samples.
    pub fn from_interleaved(samples: &[f32], channel_count: usize, sample_rate: u32) -> Result<Self> {
        if channel_count == 0 {
            return Err(LabError::InvalidSource("no channels".into()));
        }
        let frames = samples.len() / channel_count;
        let mut channels = vec![Vec::with_capacity(frames); channel_count];
        for frame in samples.chunks_exact(channel_count) {
            for (ch, &s) in channels.iter_mut().zip(frame) {
                ch.push(s);
            }
        }
        Self::new(channels, sample_rate)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Frames per channel.
    pub fn len(&self) -> usize {
        self.channels[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn duration(&self) -> f64 {
        self.len() as f64 / self.sample_rate as f64
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index]
    }

    pub fn channels(&self) -> &[Vec<f32>] {
        &self.channels
    }

    pub fn into_channels(self) -> Vec<Vec<f32>> {
        self.channels
    }

    /// Read a sample with linear interpolation at a fractional position.
    /// Positions past the end read as silence.
    #[inline]
    pub fn read_interpolated(&self, channel: usize, position: f64) -> f32 {
        read_interpolated(&self.channels[channel], position)
    }
}

/// Linear interpolation into a channel; out-of-range reads are silent.
#[inline]
pub fn read_interpolated(data: &[f32], position: f64) -> f32 {
    if data.is_empty() || position < 0.0 {
        return 0.0;
    }
    let idx = position as usize;
    if idx >= data.len() - 1 {
        return if idx < data.len() { data[idx] } else { 0.0 };
    }
    let frac = (position - idx as f64) as f32;
    data[idx] + (data[idx + 1] - data[idx]) * frac
}

/// Clamp `value` into `[min, max]`, replacing NaN/inf with `fallback`.
#[inline]
pub fn clamp_finite(value: f64, min: f64, max: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value.clamp(min, max)
    } else {
        fallback
    }
}

/// Cooperative yield point between offline processing chunks.
pub async fn yield_point() {
    tokio::task::yield_now().await;
}

/// Drop `offset_seconds` from the start of the buffer.
///
/// The offset is clamped to `[0, duration)` and at least one frame is
/// always kept.
pub fn trim(buffer: &AudioBuffer, offset_seconds: f64) -> AudioBuffer {
    let len = buffer.len();
    let offset = clamp_finite(offset_seconds, 0.0, f64::MAX, 0.0);
    let start = ((offset * buffer.sample_rate as f64).floor() as usize).min(len.saturating_sub(1));
    let channels = buffer
        .channels
        .iter()
        .map(|c| {
            if c.is_empty() {
                vec![0.0]
            } else {
                c[start..].to_vec()
            }
        })
        .collect();
    AudioBuffer {
        sample_rate: buffer.sample_rate,
        channels,
    }
}

/// Output length of [`resample_linear`] for a given input length.
pub fn resampled_len(input_len: usize, ratio: f64) -> usize {
    (input_len as f64 / ratio.max(MIN_RESAMPLE_RATIO)).floor() as usize
}

/// Linear-interpolation resampler.
///
/// Output sample `i` reads the input at position `i * ratio`, so a ratio
/// above 1 shortens the signal and raises its pitch.
pub async fn resample_linear(channel: &[f32], ratio: f64) -> Vec<f32> {
    let ratio = ratio.max(MIN_RESAMPLE_RATIO);
    let out_len = resampled_len(channel.len(), ratio);
    let mut out = Vec::with_capacity(out_len);
    let mut i = 0;
    while i < out_len {
        let end = (i + RESAMPLE_CHUNK).min(out_len);
        for n in i..end {
            out.push(read_interpolated(channel, n as f64 * ratio));
        }
        i = end;
        if i < out_len {
            yield_point().await;
        }
    }
    out
}

/// Symmetric Hann (raised-cosine) window.
pub fn hann_window(size: usize) -> Vec<f32> {
    match size {
        0 => Vec::new(),
        1 => vec![1.0],
        _ => {
            let denom = (size - 1) as f32;
            (0..size)
                .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / denom).cos()))
                .collect()
        }
    }
}
