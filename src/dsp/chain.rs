//! Effect chain — the five effect modules wired in `fxOrder` order.
//!
//! Modules listed in the order are always present, enabled or not: a
//! disabled module is parameterized to pass audio through untouched, so a
//! live session can toggle it without rewiring. Modules missing from the
//! order are never built.

use crate::settings::{
    CompressorParams, DelayParams, DistortionParams, FilterParams, FilterStage, FxKind, ReverbParams,
    Settings,
};

use super::compressor::Compressor;
use super::convolver::Convolver;
use super::delay::Delay;
use super::distortion::Distortion;
use super::filter::{BiquadFilter, FilterType};
use super::reverb::{ImpulseCache, Reverb};
use super::smoothing::SmoothedParam;

/// Frames between coefficient updates while a filter parameter glides.
const CONTROL_INTERVAL: u32 = 32;

/// One biquad stage across all channels.
///
/// Enabling or disabling crossfades between the dry input and the
/// filtered signal; a fully bypassed stage passes audio through untouched.
#[derive(Debug, Clone)]
struct StageNode {
    filter_type: FilterType,
    frequency: SmoothedParam,
    q: f64,
    gain_db: SmoothedParam,
    /// 1 while enabled, 0 while bypassed.
    blend: SmoothedParam,
    filters: Vec<BiquadFilter>,
}

impl StageNode {
    fn new(filter_type: FilterType, stage: &FilterStage, channels: usize, sample_rate: f64, ramp_ms: f64) -> Self {
        StageNode {
            filter_type,
            frequency: SmoothedParam::new(stage.frequency, ramp_ms, sample_rate),
            q: stage.q,
            gain_db: SmoothedParam::new(stage.gain_db, ramp_ms, sample_rate),
            blend: SmoothedParam::new(blend_target(stage.enabled), ramp_ms, sample_rate),
            filters: (0..channels)
                .map(|_| BiquadFilter::with_params(filter_type, sample_rate, stage.frequency, stage.q, stage.gain_db))
                .collect(),
        }
    }

    fn set_params(&mut self, stage: &FilterStage) {
        self.q = stage.q;
        self.frequency.set_target(stage.frequency);
        self.gain_db.set_target(stage.gain_db);
        self.blend.set_target(blend_target(stage.enabled));
        self.reconfigure();
    }

    fn reconfigure(&mut self) {
        let (frequency, gain_db) = (self.frequency.value(), self.gain_db.value());
        for f in &mut self.filters {
            f.configure(self.filter_type, frequency, self.q, gain_db);
        }
    }

    /// Advance the parameter ramps by `frames`.
    fn tick(&mut self, frames: u32) {
        if !(self.frequency.is_smoothing() || self.gain_db.is_smoothing()) {
            return;
        }
        for _ in 0..frames {
            self.frequency.next();
            self.gain_db.next();
        }
        self.reconfigure();
    }

    #[inline]
    fn process_frame(&mut self, frame: &mut [f32]) {
        let previous = self.blend.value();
        let blend = self.blend.next();
        if blend == 0.0 {
            return;
        }
        if previous == 0.0 {
            // Coming out of bypass: the filters hold state from before it
            for f in &mut self.filters {
                f.reset();
            }
        }
        let blend = blend as f32;
        for (s, f) in frame.iter_mut().zip(&mut self.filters) {
            let filtered = f.process(*s as f64) as f32;
            *s = if blend == 1.0 { filtered } else { *s + blend * (filtered - *s) };
        }
    }
}

fn blend_target(enabled: bool) -> f64 {
    if enabled { 1.0 } else { 0.0 }
}

/// High-pass → peaking → low-pass in series.
#[derive(Debug, Clone)]
pub struct FilterModule {
    stages: [StageNode; 3],
    counter: u32,
}

impl FilterModule {
    pub fn new(params: &FilterParams, channels: usize, sample_rate: f64, ramp_ms: f64) -> Self {
        FilterModule {
            stages: [
                StageNode::new(FilterType::Highpass, &params.highpass, channels, sample_rate, ramp_ms),
                StageNode::new(FilterType::Peaking, &params.peaking, channels, sample_rate, ramp_ms),
                StageNode::new(FilterType::Lowpass, &params.lowpass, channels, sample_rate, ramp_ms),
            ],
            counter: 0,
        }
    }

    pub fn set_params(&mut self, params: &FilterParams) {
        let [hp, pk, lp] = &mut self.stages;
        hp.set_params(&params.highpass);
        pk.set_params(&params.peaking);
        lp.set_params(&params.lowpass);
    }

    pub fn process_frame(&mut self, frame: &mut [f32]) {
        self.counter += 1;
        if self.counter >= CONTROL_INTERVAL {
            for stage in &mut self.stages {
                stage.tick(self.counter);
            }
            self.counter = 0;
        }
        for stage in &mut self.stages {
            stage.process_frame(frame);
        }
    }
}

/// A single module in the chain.
#[derive(Debug)]
pub enum EffectModule {
    Filter(FilterModule),
    Distortion(Distortion),
    Compressor(Compressor),
    Delay(Delay),
    Reverb(Reverb),
}

impl EffectModule {
    pub fn kind(&self) -> FxKind {
        match self {
            EffectModule::Filter(_) => FxKind::Filter,
            EffectModule::Distortion(_) => FxKind::Distortion,
            EffectModule::Compressor(_) => FxKind::Compressor,
            EffectModule::Delay(_) => FxKind::Delay,
            EffectModule::Reverb(_) => FxKind::Reverb,
        }
    }

    #[inline]
    pub fn process_frame(&mut self, frame: &mut [f32]) {
        match self {
            EffectModule::Filter(m) => m.process_frame(frame),
            EffectModule::Distortion(m) => m.process_frame(frame),
            EffectModule::Compressor(m) => m.process_frame(frame),
            EffectModule::Delay(m) => m.process_frame(frame),
            EffectModule::Reverb(m) => m.process_frame(frame),
        }
    }
}

/// The ordered series of effect modules.
#[derive(Debug, Default)]
pub struct EffectChain {
    modules: Vec<EffectModule>,
    sample_rate: f64,
}

impl EffectChain {
    /// Build one module per entry of `settings.fx_order`, in order.
    pub fn assemble(
        settings: &Settings,
        channels: usize,
        sample_rate: u32,
        cache: &mut ImpulseCache,
        ramp_ms: f64,
    ) -> Self {
        let sr = sample_rate as f64;
        let modules = settings
            .fx_order
            .kinds()
            .iter()
            .map(|kind| match kind {
                FxKind::Filter => {
                    EffectModule::Filter(FilterModule::new(&FilterParams::from_settings(settings, sr), channels, sr, ramp_ms))
                }
                FxKind::Distortion => {
                    let p = DistortionParams::from_settings(settings);
                    EffectModule::Distortion(Distortion::new(p.enabled, p.amount))
                }
                FxKind::Compressor => {
                    EffectModule::Compressor(Compressor::new(&CompressorParams::from_settings(settings), sr, ramp_ms))
                }
                FxKind::Delay => {
                    EffectModule::Delay(Delay::new(&DelayParams::from_settings(settings, sr), channels, sr, ramp_ms))
                }
                FxKind::Reverb => {
                    let p = ReverbParams::from_settings(settings);
                    let ir = cache.get(&p, channels, sample_rate);
                    EffectModule::Reverb(Reverb::new(&p, &ir, channels, sr, ramp_ms))
                }
            })
            .collect();
        EffectChain {
            modules,
            sample_rate: sr,
        }
    }

    /// Module kinds in processing order.
    pub fn kinds(&self) -> Vec<FxKind> {
        self.modules.iter().map(EffectModule::kind).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Impulse signature of the reverb module, if the chain has one.
    pub fn reverb_signature(&self) -> Option<&str> {
        self.modules.iter().find_map(|m| match m {
            EffectModule::Reverb(r) => Some(r.signature()),
            _ => None,
        })
    }

    /// Retarget every module in place. Topology is untouched; `reverb_bank`
    /// replaces the reverb's convolvers when its impulse changed.
    pub fn apply_params(&mut self, settings: &Settings, mut reverb_bank: Option<Vec<Convolver>>) {
        let sr = self.sample_rate;
        for module in &mut self.modules {
            match module {
                EffectModule::Filter(m) => m.set_params(&FilterParams::from_settings(settings, sr)),
                EffectModule::Distortion(m) => {
                    let p = DistortionParams::from_settings(settings);
                    m.set_params(p.enabled, p.amount);
                }
                EffectModule::Compressor(m) => m.set_params(&CompressorParams::from_settings(settings)),
                EffectModule::Delay(m) => m.set_params(&DelayParams::from_settings(settings, sr)),
                EffectModule::Reverb(m) => m.set_params(&ReverbParams::from_settings(settings), sr, reverb_bank.take()),
            }
        }
    }

    #[inline]
    pub fn process_frame(&mut self, frame: &mut [f32]) {
        for module in &mut self.modules {
            module.process_frame(frame);
        }
    }

    /// Drop every module.
    pub fn disconnect(&mut self) {
        self.modules.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::FxOrder;

    fn chain_for(settings: &Settings) -> EffectChain {
        EffectChain::assemble(settings, 2, 8000, &mut ImpulseCache::new(), 0.0)
    }

    #[test]
    fn follows_fx_order() {
        let s = Settings {
            fx_order: FxOrder::new(vec![FxKind::Reverb, FxKind::Distortion, FxKind::Filter]).unwrap(),
            ..Settings::default()
        };
        assert_eq!(chain_for(&s).kinds(), vec![FxKind::Reverb, FxKind::Distortion, FxKind::Filter]);
    }

    #[test]
    fn absent_modules_are_skipped() {
        let s = Settings {
            delay_enabled: true,
            reverb_enabled: true,
            fx_order: FxOrder::new(vec![FxKind::Compressor]).unwrap(),
            ..Settings::default()
        };
        let chain = chain_for(&s);
        assert_eq!(chain.kinds(), vec![FxKind::Compressor]);
        assert!(chain.reverb_signature().is_none());
    }

    #[test]
    fn all_disabled_is_transparent() {
        let mut chain = chain_for(&Settings::default());
        assert_eq!(chain.kinds().len(), 5);
        for i in 0..3000 {
            let x = ((i * 37 % 200) as f32 - 100.0) / 120.0;
            let mut frame = [x, x * 0.5];
            chain.process_frame(&mut frame);
            assert!((frame[0] - x).abs() < 1e-4 && (frame[1] - x * 0.5).abs() < 1e-4, "frame {i}");
        }
    }

    #[test]
    fn live_enable_filter_without_rebuild() {
        let s = Settings::default();
        let mut chain = chain_for(&s);
        let enabled = Settings {
            highpass_enabled: true,
            highpass_frequency: 500.0,
            ..s.clone()
        };
        chain.apply_params(&enabled, None);
        assert_eq!(chain.kinds().len(), 5);
        let mut last = [1.0, 1.0];
        for _ in 0..4000 {
            last = [1.0, 1.0];
            chain.process_frame(&mut last);
        }
        // DC blocked by the high-pass now in the path
        assert!(last[0].abs() < 0.01, "{last:?}");
    }

    #[test]
    fn live_filter_toggle_crossfades() {
        let s = Settings::default();
        let mut chain = EffectChain::assemble(&s, 1, 8000, &mut ImpulseCache::new(), 20.0);
        let enabled = Settings {
            highpass_enabled: true,
            highpass_frequency: 1000.0,
            ..s.clone()
        };

        let run = |chain: &mut EffectChain, frames: usize| {
            let mut out = Vec::with_capacity(frames);
            for _ in 0..frames {
                let mut frame = [0.5];
                chain.process_frame(&mut frame);
                out.push(frame[0]);
            }
            out
        };
        let max_step = |out: &[f32]| out.windows(2).map(|w| (w[1] - w[0]).abs()).fold(0.0, f32::max);

        assert_eq!(run(&mut chain, 100), vec![0.5; 100]);

        chain.apply_params(&enabled, None);
        let on = run(&mut chain, 4000);
        assert!((on[0] - 0.5).abs() < 0.02, "jumped on enable: {}", on[0]);
        assert!(max_step(&on) < 0.02);
        assert!(on[3999].abs() < 1e-3, "{}", on[3999]);

        chain.apply_params(&s, None);
        let off = run(&mut chain, 4000);
        assert!(off[0].abs() < 0.02, "jumped on disable: {}", off[0]);
        assert!(max_step(&off) < 0.02);
        assert_eq!(off[3999], 0.5);
    }

    #[test]
    fn disconnect_empties_chain() {
        let mut chain = chain_for(&Settings::default());
        chain.disconnect();
        assert!(chain.is_empty());
        let mut frame = [0.3, 0.3];
        chain.process_frame(&mut frame);
        assert_eq!(frame, [0.3, 0.3]);
    }
}
