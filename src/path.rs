//! The per-frame signal path shared by offline rendering and live playback.
//!
//! ```text
//! source ─► velocity ─► formant shelves ─► effect chain ─► output gain ─► fade ─► out
//! ```
//!
//! Offline renders build it with a zero ramp so parameters are exact from
//! the first frame; live sessions use [`LIVE_RAMP_MS`](crate::dsp::smoothing::LIVE_RAMP_MS)
//! so updates glide.

use crate::dsp::chain::EffectChain;
use crate::dsp::convolver::Convolver;
use crate::dsp::envelope::FadeEnvelope;
use crate::dsp::filter::{BiquadFilter, FilterType};
use crate::dsp::reverb::ImpulseCache;
use crate::dsp::smoothing::SmoothedParam;
use crate::settings::{DelayParams, FormantCompensation, FxKind, ReverbParams, Settings, clamp_frequency};

/// Frames processed between cooperative yields when rendering offline.
pub const PATH_CHUNK: usize = 16_384;

/// Seconds of delay and reverb tail for `settings`. A module contributes
/// only when it is enabled and part of the chain.
pub fn tail_seconds(settings: &Settings, sample_rate: u32) -> f64 {
    let mut tail = 0.0;
    if settings.fx_order.contains(FxKind::Delay) {
        tail += DelayParams::from_settings(settings, sample_rate as f64).tail();
    }
    if settings.fx_order.contains(FxKind::Reverb) {
        tail += ReverbParams::from_settings(settings).tail();
    }
    tail
}

/// Output length: the processed source plus effect tails.
pub fn planned_frames(settings: &Settings, base_frames: usize, sample_rate: u32) -> usize {
    base_frames + (tail_seconds(settings, sample_rate) * sample_rate as f64).ceil() as usize
}

/// Low and high shelves countering the spectral tilt of a pitch shift.
#[derive(Debug, Clone)]
pub struct FormantShelves {
    enabled: bool,
    low: Vec<BiquadFilter>,
    high: Vec<BiquadFilter>,
}

impl FormantShelves {
    pub fn new(comp: &FormantCompensation, channels: usize, sample_rate: f64) -> Self {
        let bank = |kind, freq: f64, gain| -> Vec<BiquadFilter> {
            let freq = clamp_frequency(freq, sample_rate, freq);
            (0..channels)
                .map(|_| BiquadFilter::with_params(kind, sample_rate, freq, 0.707, gain))
                .collect()
        };
        FormantShelves {
            enabled: comp.enabled,
            low: bank(FilterType::Lowshelf, comp.low_frequency, comp.low_gain_db),
            high: bank(FilterType::Highshelf, comp.high_frequency, comp.high_gain_db),
        }
    }

    #[inline]
    pub fn process_frame(&mut self, frame: &mut [f32]) {
        if !self.enabled {
            return;
        }
        for ((s, low), high) in frame.iter_mut().zip(&mut self.low).zip(&mut self.high) {
            *s = high.process(low.process(*s as f64)) as f32;
        }
    }
}

/// Velocity, formant compensation, effects, gain and fades for one
/// render or session.
#[derive(Debug)]
pub struct SignalPath {
    velocity: SmoothedParam,
    formant: FormantShelves,
    chain: EffectChain,
    gain: SmoothedParam,
    output_gain: f64,
    master_volume: f64,
    fade: FadeEnvelope,
    position: usize,
}

impl SignalPath {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: &Settings,
        master_volume: f64,
        channels: usize,
        sample_rate: u32,
        base_frames: usize,
        total_frames: usize,
        cache: &mut ImpulseCache,
        ramp_ms: f64,
    ) -> Self {
        let sr = sample_rate as f64;
        let output_gain = settings.output_gain_clamped();
        let master_volume = master_volume.clamp(0.0, 1.0);
        SignalPath {
            velocity: SmoothedParam::new(settings.velocity_clamped(), ramp_ms, sr),
            formant: FormantShelves::new(&FormantCompensation::from_settings(settings), channels, sr),
            chain: EffectChain::assemble(settings, channels, sample_rate, cache, ramp_ms),
            gain: SmoothedParam::new(output_gain * master_volume, ramp_ms, sr),
            output_gain,
            master_volume,
            fade: FadeEnvelope::new(
                settings.fade_in_clamped(),
                settings.fade_out_clamped(),
                base_frames,
                total_frames,
                sr,
            ),
            position: 0,
        }
    }

    pub fn chain(&self) -> &EffectChain {
        &self.chain
    }

    pub fn total_frames(&self) -> usize {
        self.fade.total_frames()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn is_finished(&self) -> bool {
        self.position >= self.fade.total_frames()
    }

    /// Retarget velocity, gain and every effect module. Chain order,
    /// formant compensation and fades stay as built.
    pub fn apply_live(&mut self, settings: &Settings, reverb_bank: Option<Vec<Convolver>>) {
        self.velocity.set_target(settings.velocity_clamped());
        self.output_gain = settings.output_gain_clamped();
        self.gain.set_target(self.output_gain * self.master_volume);
        self.chain.apply_params(settings, reverb_bank);
    }

    pub fn set_master_volume(&mut self, master_volume: f64) {
        self.master_volume = master_volume.clamp(0.0, 1.0);
        self.gain.set_target(self.output_gain * self.master_volume);
    }

    /// Process one input frame in place and advance the fade position.
    #[inline]
    pub fn process_frame(&mut self, frame: &mut [f32]) {
        let velocity = self.velocity.next() as f32;
        for s in frame.iter_mut() {
            *s *= velocity;
        }
        self.formant.process_frame(frame);
        self.chain.process_frame(frame);

        let gain = self.gain.next() as f32 * self.fade.gain(self.position);
        for s in frame.iter_mut() {
            *s *= gain;
        }
        self.position += 1;
    }

    /// Release every effect module.
    pub fn disconnect(&mut self) {
        self.chain.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::FxOrder;

    fn path(settings: &Settings, master: f64, base: usize, total: usize) -> SignalPath {
        SignalPath::new(settings, master, 1, 1000, base, total, &mut ImpulseCache::new(), 0.0)
    }

    #[test]
    fn tails_add_up() {
        let s = Settings {
            delay_enabled: true,
            delay_time: 0.5,
            reverb_enabled: true,
            reverb_seconds: 1.0,
            reverb_decay: 0.0,
            ..Settings::default()
        };
        assert!((tail_seconds(&s, 44100) - 2.9).abs() < 1e-9);
        let frames = planned_frames(&s, 100, 1000);
        assert!((3000..=3001).contains(&frames), "{frames}");
    }

    #[test]
    fn tail_ignores_modules_outside_the_order() {
        let s = Settings {
            delay_enabled: true,
            reverb_enabled: true,
            fx_order: FxOrder::new(vec![FxKind::Filter]).unwrap(),
            ..Settings::default()
        };
        assert_eq!(tail_seconds(&s, 44100), 0.0);
    }

    #[test]
    fn gain_stages_multiply() {
        let s = Settings {
            velocity: 0.5,
            output_gain: 1.5,
            ..Settings::default()
        };
        let mut p = path(&s, 0.8, 10, 10);
        let mut frame = [1.0];
        p.process_frame(&mut frame);
        assert!((frame[0] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn fades_shape_the_output() {
        let s = Settings {
            fade_in: 0.01,
            fade_out: 0.01,
            ..Settings::default()
        };
        let mut p = path(&s, 1.0, 100, 100);
        let out: Vec<f32> = (0..100)
            .map(|_| {
                let mut f = [1.0];
                p.process_frame(&mut f);
                f[0]
            })
            .collect();
        assert_eq!(out[0], 0.0);
        assert_eq!(out[99], 0.0);
        assert_eq!(out[50], 1.0);
        assert!(p.is_finished());
    }

    #[test]
    fn formant_shelves_only_with_shift() {
        let s = Settings {
            preserve_formants: true,
            pitch_semitones: 12.0,
            ..Settings::default()
        };
        let mut p = path(&s, 1.0, 4000, 4000);
        // Upward shift lifts the low shelf: DC gains about +4 dB
        let mut last = 0.0;
        for _ in 0..4000 {
            let mut f = [0.5];
            p.process_frame(&mut f);
            last = f[0];
        }
        let db = 20.0 * (last / 0.5).log10();
        assert!((db - 4.0).abs() < 0.1, "dc gain {db} dB");
    }

    #[test]
    fn live_gain_glides() {
        let s = Settings::default();
        let mut p = SignalPath::new(&s, 1.0, 1, 1000, 1000, 1000, &mut ImpulseCache::new(), 20.0);
        p.apply_live(
            &Settings {
                output_gain: 0.0,
                ..s.clone()
            },
            None,
        );
        let mut f = [1.0];
        p.process_frame(&mut f);
        assert!(f[0] > 0.9, "gain jumped to {}", f[0]);
    }
}
