//! Compressor effect — feed-forward soft-knee compressor.
//!
//! Detection is linked across channels: the frame peak drives one
//! envelope, and the resulting gain is applied to every channel.

use crate::settings::CompressorParams;

use super::smoothing::SmoothedParam;

/// Soft knee width in dB.
const KNEE_DB: f64 = 6.0;

/// Level in dBFS, floored at -120 for silence.
fn amplitude_db(linear: f64) -> f64 {
    if linear <= 0.0 {
        -120.0
    } else {
        20.0 * linear.log10()
    }
}

fn db_gain(db: f64) -> f64 {
    10.0_f64.powf(db / 20.0)
}

/// Static curve: gain change in dB (zero or negative) for a detector
/// level, with a quadratic knee of [`KNEE_DB`] centered on the threshold.
fn reduction_db(threshold: f64, ratio: f64, level_db: f64) -> f64 {
    let slope = 1.0 - 1.0 / ratio;
    let over = level_db - (threshold - KNEE_DB / 2.0);
    if over <= 0.0 {
        0.0
    } else if over >= KNEE_DB {
        (threshold - level_db) * slope
    } else {
        -over * over / (2.0 * KNEE_DB) * slope
    }
}

/// A linked multichannel dynamics compressor.
#[derive(Debug, Clone)]
pub struct Compressor {
    sample_rate: f64,

    threshold: SmoothedParam,
    ratio: SmoothedParam,
    attack: f64,
    release: f64,
    attack_coef: f64,
    release_coef: f64,

    /// Detector level, linear.
    envelope: f64,
}

impl Compressor {
    pub fn new(params: &CompressorParams, sample_rate: f64, ramp_ms: f64) -> Self {
        let (threshold, ratio) = params.effective();
        let mut c = Self {
            sample_rate,
            threshold: SmoothedParam::new(threshold, ramp_ms, sample_rate),
            ratio: SmoothedParam::new(ratio, ramp_ms, sample_rate),
            attack: -1.0,
            release: -1.0,
            attack_coef: 0.0,
            release_coef: 0.0,
            envelope: 0.0,
        };
        c.set_times(params.attack, params.release);
        c
    }

    /// Retarget for new settings; a disabled compressor glides to unity.
    pub fn set_params(&mut self, params: &CompressorParams) {
        let (threshold, ratio) = params.effective();
        self.threshold.set_target(threshold);
        self.ratio.set_target(ratio);
        self.set_times(params.attack, params.release);
    }

    fn set_times(&mut self, attack: f64, release: f64) {
        if attack != self.attack {
            self.attack = attack;
            self.attack_coef = Self::time_coef(attack, self.sample_rate);
        }
        if release != self.release {
            self.release = release;
            self.release_coef = Self::time_coef(release, self.sample_rate);
        }
    }

    #[inline]
    fn time_coef(seconds: f64, sample_rate: f64) -> f64 {
        let samples = seconds * sample_rate;
        if samples < 1.0 {
            0.0
        } else {
            (-1.0 / samples).exp()
        }
    }

    /// Process one frame in place.
    #[inline]
    pub fn process_frame(&mut self, frame: &mut [f32]) {
        let threshold = self.threshold.next();
        let ratio = self.ratio.next();

        let input_level = frame.iter().fold(0.0_f32, |m, s| m.max(s.abs())) as f64;

        let coef = if input_level > self.envelope {
            self.attack_coef
        } else {
            self.release_coef
        };
        self.envelope = coef * self.envelope + (1.0 - coef) * input_level;

        if ratio <= 1.0 {
            return;
        }

        let envelope_db = amplitude_db(self.envelope);
        let gain = db_gain(reduction_db(threshold, ratio, envelope_db)) as f32;
        for s in frame.iter_mut() {
            *s *= gain;
        }
    }

    /// Reset the compressor state.
    pub fn reset(&mut self) {
        self.envelope = 0.0;
    }

    /// Current gain reduction in dB (for metering).
    pub fn gain_reduction(&self) -> f64 {
        let envelope_db = amplitude_db(self.envelope);
        -reduction_db(self.threshold.value(), self.ratio.value(), envelope_db)
    }
}
