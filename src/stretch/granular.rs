//! Granular overlap-add time stretch.
//!
//! Windowed grains are read from the input at an analysis hop and laid
//! into the output at a fixed synthesis hop; the analysis hop is the
//! synthesis hop divided by the stretch ratio. The sum is normalized by the
//! accumulated window weight so overlap density never changes loudness.
//!
//! [`granular_stretch`] does this offline over whole channels,
//! [`GrainStream`] produces the same output one frame at a time for live
//! playback.

use std::sync::Arc;

use crate::buffer::{AudioBuffer, hann_window, read_interpolated, resampled_len, yield_point};

use super::StretchProfile;

/// Grains laid down between cooperative yields.
pub const GRAINS_PER_CHUNK: usize = 48;

/// Weights below this produce silence rather than a division blow-up.
const MIN_WEIGHT: f32 = 1e-6;

/// Frames produced by resampling `len` frames by `pitch` and stretching
/// the result by `pitch / tempo`.
pub fn stretched_len(len: usize, pitch: f64, tempo: f64) -> usize {
    let resampled = if is_unity(pitch) {
        len
    } else {
        resampled_len(len, pitch)
    };
    (resampled as f64 * pitch / tempo).round() as usize
}

fn is_unity(ratio: f64) -> bool {
    (ratio - 1.0).abs() <= f64::EPSILON
}

/// Grain length and synthesis hop for an input of `len` frames. Inputs
/// shorter than one grain are treated as a single grain.
fn grain_geometry(profile: &StretchProfile, len: usize) -> (usize, usize) {
    let grain = profile.grain_size().min(len.max(1));
    let hop = ((grain as f64 * (1.0 - profile.grain_overlap)).round() as usize).max(1);
    (grain, hop)
}

#[inline]
fn analysis_start(grain_index: usize, hop: usize, ratio: f64) -> f64 {
    (grain_index as f64 * (hop as f64 / ratio)).round()
}

/// Stretch every channel by `ratio` (output/input length) without
/// changing pitch. All channels share the same grain positions.
pub async fn granular_stretch(channels: &[Vec<f32>], ratio: f64, profile: &StretchProfile) -> Vec<Vec<f32>> {
    let len = channels.first().map_or(0, Vec::len);
    let out_len = (len as f64 * ratio).round() as usize;
    if len == 0 || out_len == 0 {
        return vec![Vec::new(); channels.len()];
    }
    if is_unity(ratio) {
        return channels.to_vec();
    }

    let (grain, hop) = grain_geometry(profile, len);
    let window = hann_window(grain);
    let mut acc = vec![vec![0.0_f32; out_len + grain]; channels.len()];
    let mut weight = vec![0.0_f32; out_len + grain];

    for k in 0..out_len.div_ceil(hop) {
        let out_pos = k * hop;
        let in_pos = analysis_start(k, hop, ratio) as usize;

        for (w_acc, &w) in weight[out_pos..out_pos + grain].iter_mut().zip(&window) {
            *w_acc += w;
        }
        for (a, src) in acc.iter_mut().zip(channels) {
            let grain_src = src.get(in_pos..).unwrap_or(&[]);
            for ((out, &s), &w) in a[out_pos..out_pos + grain].iter_mut().zip(grain_src).zip(&window) {
                *out += s * w;
            }
        }

        if (k + 1) % GRAINS_PER_CHUNK == 0 {
            yield_point().await;
        }
    }

    acc.into_iter()
        .map(|mut a| {
            a.truncate(out_len);
            for (s, &w) in a.iter_mut().zip(&weight) {
                *s = if w > MIN_WEIGHT { *s / w } else { 0.0 };
            }
            a
        })
        .collect()
}

/// Streaming granular pitch/tempo shifter.
///
/// Equivalent to resampling the source by `pitch` and running
/// [`granular_stretch`] with ratio `pitch / tempo`, but grains are read
/// straight from the source at `pitch` frames per step and only one grain
/// of overlap-add state is kept.
#[derive(Debug)]
pub struct GrainStream {
    source: Arc<AudioBuffer>,
    pitch: f64,
    ratio: f64,
    window: Vec<f32>,
    grain: usize,
    hop: usize,
    acc: Vec<Vec<f32>>,
    weight: Vec<f32>,
    position: usize,
    total: usize,
}

impl GrainStream {
    pub fn new(source: Arc<AudioBuffer>, pitch: f64, tempo: f64, profile: &StretchProfile) -> Self {
        let len = source.len();
        let resampled = if is_unity(pitch) { len } else { resampled_len(len, pitch) };
        let (grain, hop) = grain_geometry(profile, resampled);
        let channels = source.channel_count();
        GrainStream {
            total: stretched_len(len, pitch, tempo),
            pitch,
            ratio: pitch / tempo,
            window: hann_window(grain),
            grain,
            hop,
            acc: vec![vec![0.0; grain]; channels],
            weight: vec![0.0; grain],
            position: 0,
            source,
        }
    }

    pub fn total_frames(&self) -> usize {
        self.total
    }

    fn spawn_grain(&mut self) {
        let start = analysis_start(self.position / self.hop, self.hop, self.ratio);
        for (j, &w) in self.window.iter().enumerate() {
            let slot = (self.position + j) % self.grain;
            self.weight[slot] += w;
            let src_pos = (start + j as f64) * self.pitch;
            for (ch, acc) in self.acc.iter_mut().enumerate() {
                acc[slot] += read_interpolated(self.source.channel(ch), src_pos) * w;
            }
        }
    }

    /// Write the next frame; `false` once the stream is exhausted.
    pub fn next_frame(&mut self, frame: &mut [f32]) -> bool {
        if self.position >= self.total {
            return false;
        }

        if is_unity(self.ratio) {
            let pos = self.position as f64 * self.pitch;
            for (ch, s) in frame.iter_mut().enumerate().take(self.acc.len()) {
                *s = read_interpolated(self.source.channel(ch), pos);
            }
            self.position += 1;
            return true;
        }

        if self.position % self.hop == 0 {
            self.spawn_grain();
        }
        let slot = self.position % self.grain;
        let w = self.weight[slot];
        for (s, acc) in frame.iter_mut().zip(&mut self.acc) {
            *s = if w > MIN_WEIGHT { acc[slot] / w } else { 0.0 };
            acc[slot] = 0.0;
        }
        self.weight[slot] = 0.0;
        self.position += 1;
        true
    }
}
