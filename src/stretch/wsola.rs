//! WSOLA (waveform-similarity overlap-add) time stretch.
//!
//! The output is built from fixed-length sequences of input. Each new
//! sequence is taken near its nominal input position, shifted within a
//! seek window to the offset whose start best matches what naturally
//! followed the previous sequence, then crossfaded in over the overlap.
//! Timing follows the profile's millisecond settings; `quick_seek`
//! replaces the exhaustive search with a coarse scan plus refinement.

use crate::buffer::yield_point;

use super::{StretchBackend, StretchError, StretchFuture, StretchProfile};

const QUICK_SEEK_STEP: usize = 4;
const QUICK_SEEK_REFINE: usize = 3;

/// Default `hq` backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct Wsola;

impl StretchBackend for Wsola {
    fn name(&self) -> &str {
        "wsola"
    }

    fn stretch<'a>(
        &'a self,
        channels: &'a [Vec<f32>],
        ratio: f64,
        sample_rate: u32,
        profile: &'a StretchProfile,
    ) -> StretchFuture<'a> {
        Box::pin(wsola_stretch(channels, ratio, sample_rate, profile))
    }
}

/// Sequence, seek and overlap lengths in samples.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Geometry {
    sequence: usize,
    seek: usize,
    overlap: usize,
}

impl Geometry {
    fn new(profile: &StretchProfile, sample_rate: u32) -> Self {
        let samples = |ms: f64| (ms * sample_rate as f64 / 1000.0).round() as usize;
        let sequence = samples(profile.sequence_ms).max(2);
        Geometry {
            sequence,
            seek: samples(profile.seek_window_ms).max(1),
            overlap: samples(profile.overlap_ms).clamp(1, sequence - 1),
        }
    }
}

/// Normalized similarity of `guide[candidate..]` against `guide[reference..]`.
#[inline]
fn similarity(guide: &[f32], reference: usize, candidate: usize, len: usize) -> f64 {
    let mut cross = 0.0_f64;
    let mut energy = 0.0_f64;
    for (&r, &c) in guide[reference..reference + len]
        .iter()
        .zip(&guide[candidate..candidate + len])
    {
        cross += r as f64 * c as f64;
        energy += c as f64 * c as f64;
    }
    cross / (energy + 1e-9).sqrt()
}

fn best_offset(guide: &[f32], reference: usize, lo: usize, hi: usize, overlap: usize, quick: bool) -> usize {
    let scan = |from: usize, to: usize, step: usize| {
        let mut best = from;
        let mut best_score = f64::NEG_INFINITY;
        let mut c = from;
        while c <= to {
            let score = similarity(guide, reference, c, overlap);
            if score > best_score {
                best_score = score;
                best = c;
            }
            c += step;
        }
        best
    };

    if quick {
        let coarse = scan(lo, hi, QUICK_SEEK_STEP);
        scan(
            coarse.saturating_sub(QUICK_SEEK_REFINE).max(lo),
            (coarse + QUICK_SEEK_REFINE).min(hi),
            1,
        )
    } else {
        scan(lo, hi, 1)
    }
}

/// Stretch mono or stereo audio by `ratio` (output/input length).
/// All channels are cut at the same offsets, chosen on their mono mix.
pub async fn wsola_stretch(
    channels: &[Vec<f32>],
    ratio: f64,
    sample_rate: u32,
    profile: &StretchProfile,
) -> Result<Vec<Vec<f32>>, StretchError> {
    if channels.len() > 2 {
        return Err(StretchError::TooManyChannels(channels.len()));
    }
    let len = channels.first().map_or(0, Vec::len);
    let geo = Geometry::new(profile, sample_rate);
    let needed = geo.sequence + geo.seek;
    if len < needed {
        return Err(StretchError::InputTooShort { len, needed });
    }
    let target = (len as f64 * ratio).round() as usize;
    if target == 0 || !ratio.is_finite() {
        return Err(StretchError::NoOutput);
    }

    let scale = 1.0 / channels.len() as f32;
    let guide: Vec<f32> = (0..len)
        .map(|i| channels.iter().map(|c| c[i]).sum::<f32>() * scale)
        .collect();

    let hop_out = geo.sequence - geo.overlap;
    let max_start = len - geo.sequence;
    let mut out: Vec<Vec<f32>> = channels
        .iter()
        .map(|c| {
            let mut o = Vec::with_capacity(target + geo.sequence);
            o.extend_from_slice(&c[..geo.sequence]);
            o
        })
        .collect();

    let mut prev_start = 0;
    let mut k = 1;
    let mut since_yield = 0;
    while out[0].len() < target {
        let nominal = (k * hop_out) as f64 / ratio;
        let lo = (nominal - geo.seek as f64 / 2.0).max(0.0).round() as usize;
        if lo > max_start {
            break;
        }
        let hi = (lo + geo.seek).min(max_start);
        let start = best_offset(&guide, prev_start + hop_out, lo, hi, geo.overlap, profile.quick_seek);

        for (o, src) in out.iter_mut().zip(channels) {
            let base = o.len() - geo.overlap;
            for (j, (dst, &s)) in o[base..].iter_mut().zip(&src[start..start + geo.overlap]).enumerate() {
                let t = j as f32 / geo.overlap as f32;
                *dst = *dst * (1.0 - t) + s * t;
            }
            o.extend_from_slice(&src[start + geo.overlap..start + geo.sequence]);
        }

        prev_start = start;
        k += 1;
        since_yield += hop_out;
        if since_yield >= profile.buffer_size {
            since_yield = 0;
            yield_point().await;
        }
    }

    // Input ran out before the target: continue from the last sequence
    let tail_from = prev_start + geo.sequence;
    for (o, src) in out.iter_mut().zip(channels) {
        if o.len() < target {
            let missing = target - o.len();
            let tail = &src[tail_from.min(len)..];
            o.extend_from_slice(&tail[..missing.min(tail.len())]);
        }
        o.resize(target, 0.0);
    }
    Ok(out)
}
