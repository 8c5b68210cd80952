//! Reverb effect — convolution against a synthesized impulse response.
//!
//! ```text
//! in ──┬────────────────────────── dry ──────┐
//!      └─► convolver ─► damping LP ─── wet ──┴─► out
//! ```
//!
//! The impulse is seeded noise shaped by two envelopes, so equal
//! parameters always give the same room. Synthesis is the expensive part;
//! [`ImpulseCache`] keeps the last impulse keyed by its signature.

use std::f64::consts::PI;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::settings::ReverbParams;

use super::convolver::{CONVOLUTION_BLOCK, Convolver};
use super::filter::{BiquadFilter, FilterType};
use super::smoothing::SmoothedParam;

const IMPULSE_SEED: u64 = 0x5eed_0f_7e7b;

/// Crossover between the steady low band and the damped high band.
const CROSSOVER_HZ: f64 = 1500.0;

/// A synthesized stereo (or n-channel) impulse response.
#[derive(Debug, Clone, PartialEq)]
pub struct ImpulseResponse {
    pub channels: Vec<Vec<f32>>,
    pub sample_rate: u32,
}

impl ImpulseResponse {
    pub fn len(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Synthesize an impulse of `seconds * sample_rate` frames.
///
/// Each channel is independent white noise split at [`CROSSOVER_HZ`].
/// The whole signal follows `(1 - p)^decay`; the high band is further
/// scaled by the spectral envelope `(1 - p)^(1 - damping)`. At damping 1
/// the noise stays white for the whole tail; at 0 the highs fade linearly.
/// Channels are normalized to unit energy.
pub fn synthesize_impulse(params: &ReverbParams, channels: usize, sample_rate: u32) -> ImpulseResponse {
    let sr = sample_rate as f64;
    let len = ((params.seconds * sr).round() as usize).max(1);
    let lp_coef = 1.0 - (-2.0 * PI * CROSSOVER_HZ / sr).exp();

    let channels = (0..channels.max(1))
        .map(|ch| {
            let mut rng = StdRng::seed_from_u64(IMPULSE_SEED + ch as u64);
            let mut low = 0.0_f64;
            let mut ir: Vec<f32> = (0..len)
                .map(|i| {
                    let remaining = 1.0 - i as f64 / len as f64;
                    let white: f64 = rng.gen_range(-1.0..1.0);
                    low += lp_coef * (white - low);
                    let high = white - low;
                    let amplitude = remaining.powf(params.decay);
                    let spectral = remaining.powf(1.0 - params.damping);
                    ((low + high * spectral) * amplitude) as f32
                })
                .collect();

            let energy: f64 = ir.iter().map(|&s| (s as f64) * (s as f64)).sum();
            if energy > 0.0 {
                let scale = (1.0 / energy.sqrt()) as f32;
                for s in &mut ir {
                    *s *= scale;
                }
            }
            ir
        })
        .collect();

    ImpulseResponse {
        channels,
        sample_rate,
    }
}

/// Single-entry impulse cache keyed by reverb signature.
#[derive(Debug, Default)]
pub struct ImpulseCache {
    entry: Option<(String, Arc<ImpulseResponse>)>,
}

impl ImpulseCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(params: &ReverbParams, channels: usize, sample_rate: u32) -> String {
        format!("{}@{}x{}", params.signature(), sample_rate, channels)
    }

    /// The impulse for `params`, synthesized only when the signature
    /// differs from the cached one.
    pub fn get(&mut self, params: &ReverbParams, channels: usize, sample_rate: u32) -> Arc<ImpulseResponse> {
        let key = Self::key(params, channels, sample_rate);
        if let Some((cached, ir)) = &self.entry {
            if *cached == key {
                return Arc::clone(ir);
            }
        }
        tracing::debug!(signature = %key, "synthesizing reverb impulse");
        let ir = Arc::new(synthesize_impulse(params, channels, sample_rate));
        self.entry = Some((key, Arc::clone(&ir)));
        ir
    }

    pub fn clear(&mut self) {
        self.entry = None;
    }
}

/// One partitioned convolver per channel of `ir`.
pub fn convolver_bank(ir: &ImpulseResponse) -> Vec<Convolver> {
    ir.channels
        .iter()
        .map(|c| Convolver::new(c, CONVOLUTION_BLOCK))
        .collect()
}

/// Convolution reverb with dry/wet mix and a damping low-pass.
#[derive(Debug)]
pub struct Reverb {
    convolvers: Vec<Convolver>,
    damping: Vec<BiquadFilter>,
    wet: SmoothedParam,
    dry: SmoothedParam,
    signature: String,
}

impl Reverb {
    pub fn new(params: &ReverbParams, ir: &ImpulseResponse, channels: usize, sample_rate: f64, ramp_ms: f64) -> Self {
        let (wet, dry) = Self::gains(params);
        let mut convolvers = convolver_bank(ir);
        // Mono impulse feeding a wider frame: reuse the first channel
        while convolvers.len() < channels {
            convolvers.push(Convolver::new(ir.channels.first().map_or(&[][..], Vec::as_slice), CONVOLUTION_BLOCK));
        }
        Reverb {
            convolvers,
            damping: (0..channels)
                .map(|_| {
                    BiquadFilter::with_params(
                        FilterType::Lowpass,
                        sample_rate,
                        Self::cutoff(params, sample_rate),
                        0.707,
                        0.0,
                    )
                })
                .collect(),
            wet: SmoothedParam::new(wet, ramp_ms, sample_rate),
            dry: SmoothedParam::new(dry, ramp_ms, sample_rate),
            signature: params.signature(),
        }
    }

    fn gains(params: &ReverbParams) -> (f64, f64) {
        if params.enabled {
            (params.mix, 1.0 - params.mix)
        } else {
            (0.0, 1.0)
        }
    }

    fn cutoff(params: &ReverbParams, sample_rate: f64) -> f64 {
        params.damping_cutoff().min(sample_rate * 0.49)
    }

    /// Signature of the impulse currently loaded.
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Retarget mix and damping. A new convolver bank, built off the audio
    /// thread for a changed signature, is swapped in when given.
    pub fn set_params(&mut self, params: &ReverbParams, sample_rate: f64, bank: Option<Vec<Convolver>>) {
        let (wet, dry) = Self::gains(params);
        self.wet.set_target(wet);
        self.dry.set_target(dry);
        let cutoff = Self::cutoff(params, sample_rate);
        for f in &mut self.damping {
            f.configure(FilterType::Lowpass, cutoff, 0.707, 0.0);
        }
        if let Some(bank) = bank {
            if bank.len() >= self.damping.len() {
                self.convolvers = bank;
                self.signature = params.signature();
            }
        }
    }

    /// Process one frame in place.
    #[inline]
    pub fn process_frame(&mut self, frame: &mut [f32]) {
        let wet = self.wet.next() as f32;
        let dry = self.dry.next() as f32;
        if wet == 0.0 && !self.wet.is_smoothing() {
            for s in frame.iter_mut() {
                *s *= dry;
            }
            return;
        }
        for ((sample, conv), damp) in frame
            .iter_mut()
            .zip(&mut self.convolvers)
            .zip(&mut self.damping)
        {
            let tail = damp.process(conv.process_sample(*sample) as f64) as f32;
            *sample = *sample * dry + tail * wet;
        }
    }
}
