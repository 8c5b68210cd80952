//! Lab settings — the declarative description of one render or session.
//!
//! These types map directly to the settings JSON the host sends. Every
//! numeric field is accepted as-is and clamped when read through the
//! parameter views below, so callers never need to pre-validate.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::buffer::clamp_finite;
use crate::error::{LabError, Result};

/// Longest delay line the delay module allocates, in seconds.
pub const MAX_DELAY_SECONDS: f64 = 2.0;

/// Delay tail estimate: seconds of ringing per second of delay time.
pub const DELAY_TAIL_FACTOR: f64 = 3.8;

/// Reverb tail estimate: extra length per unit of decay.
pub const REVERB_TAIL_DECAY_FACTOR: f64 = 0.35;

// ── Enumerations ────────────────────────────────────────────

/// Pitch/tempo algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PitchMode {
    /// Playback-rate shift; pitch and duration move together.
    #[default]
    Tape,
    /// In-process granular overlap-add.
    Granular,
    /// Stretch backend with granular fallback.
    Hq,
}

/// The five effect modules of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FxKind {
    Filter,
    Distortion,
    Compressor,
    Delay,
    Reverb,
}

impl FxKind {
    pub const ALL: [FxKind; 5] = [
        FxKind::Filter,
        FxKind::Distortion,
        FxKind::Compressor,
        FxKind::Delay,
        FxKind::Reverb,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FxKind::Filter => "filter",
            FxKind::Distortion => "distortion",
            FxKind::Compressor => "compressor",
            FxKind::Delay => "delay",
            FxKind::Reverb => "reverb",
        }
    }
}

impl fmt::Display for FxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered subset of the effect modules, without duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<FxKind>", into = "Vec<FxKind>")]
pub struct FxOrder(Vec<FxKind>);

impl FxOrder {
    /// Build an order, rejecting repeated modules.
    pub fn new(kinds: Vec<FxKind>) -> Result<Self> {
        for (i, kind) in kinds.iter().enumerate() {
            if kinds[..i].contains(kind) {
                return Err(LabError::DuplicateModule(*kind));
            }
        }
        Ok(FxOrder(kinds))
    }

    pub fn kinds(&self) -> &[FxKind] {
        &self.0
    }

    pub fn contains(&self, kind: FxKind) -> bool {
        self.0.contains(&kind)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for FxOrder {
    fn default() -> Self {
        FxOrder(FxKind::ALL.to_vec())
    }
}

impl TryFrom<Vec<FxKind>> for FxOrder {
    type Error = LabError;

    fn try_from(kinds: Vec<FxKind>) -> Result<Self> {
        FxOrder::new(kinds)
    }
}

impl From<FxOrder> for Vec<FxKind> {
    fn from(order: FxOrder) -> Self {
        order.0
    }
}

// ── Settings ────────────────────────────────────────────────

/// Complete settings for one render or playback session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Seconds trimmed from the start of the source.
    pub offset: f64,
    pub pitch_semitones: f64,
    pub pitch_mode: PitchMode,
    pub preserve_formants: bool,
    /// Linear gain applied before the chain (0-1).
    pub velocity: f64,
    pub fade_in: f64,
    pub fade_out: f64,
    /// Tempo multiplier (0.25-4). Ignored in tape mode.
    pub tempo: f64,
    /// Output gain (0-2).
    pub output_gain: f64,

    pub highpass_enabled: bool,
    pub highpass_frequency: f64,
    pub highpass_q: f64,
    pub peaking_enabled: bool,
    pub peaking_frequency: f64,
    pub peaking_q: f64,
    pub peaking_gain: f64,
    pub lowpass_enabled: bool,
    pub lowpass_frequency: f64,
    pub lowpass_q: f64,

    pub distortion_enabled: bool,
    pub distortion_amount: f64,

    pub compressor_enabled: bool,
    pub compressor_threshold: f64,
    pub compressor_ratio: f64,
    pub compressor_attack: f64,
    pub compressor_release: f64,

    pub delay_enabled: bool,
    pub delay_time: f64,
    pub delay_feedback: f64,
    pub delay_mix: f64,
    /// Cutoff of the low-pass inside the feedback loop, in Hz.
    pub delay_tone: f64,

    pub reverb_enabled: bool,
    pub reverb_seconds: f64,
    pub reverb_decay: f64,
    pub reverb_mix: f64,
    pub reverb_damping: f64,

    pub fx_order: FxOrder,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            offset: 0.0,
            pitch_semitones: 0.0,
            pitch_mode: PitchMode::Tape,
            preserve_formants: false,
            velocity: 1.0,
            fade_in: 0.0,
            fade_out: 0.0,
            tempo: 1.0,
            output_gain: 1.0,
            highpass_enabled: false,
            highpass_frequency: 80.0,
            highpass_q: 0.707,
            peaking_enabled: false,
            peaking_frequency: 1000.0,
            peaking_q: 1.0,
            peaking_gain: 0.0,
            lowpass_enabled: false,
            lowpass_frequency: 18000.0,
            lowpass_q: 0.707,
            distortion_enabled: false,
            distortion_amount: 0.2,
            compressor_enabled: false,
            compressor_threshold: -24.0,
            compressor_ratio: 4.0,
            compressor_attack: 0.003,
            compressor_release: 0.25,
            delay_enabled: false,
            delay_time: 0.25,
            delay_feedback: 0.3,
            delay_mix: 0.3,
            delay_tone: 4000.0,
            reverb_enabled: false,
            reverb_seconds: 2.0,
            reverb_decay: 2.0,
            reverb_mix: 0.3,
            reverb_damping: 0.4,
            fx_order: FxOrder::default(),
        }
    }
}

impl Settings {
    /// Parse settings JSON; absent fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn offset_clamped(&self) -> f64 {
        clamp_finite(self.offset, 0.0, f64::MAX, 0.0)
    }

    pub fn semitones_clamped(&self) -> f64 {
        clamp_finite(self.pitch_semitones, -24.0, 24.0, 0.0)
    }

    /// Frequency ratio of the pitch shift, `2^(semitones/12)`.
    pub fn pitch_ratio(&self) -> f64 {
        2.0_f64.powf(self.semitones_clamped() / 12.0)
    }

    /// Playback rate used by tape mode.
    pub fn tape_rate(&self) -> f64 {
        self.pitch_ratio().clamp(0.25, 4.0)
    }

    pub fn tempo_clamped(&self) -> f64 {
        clamp_finite(self.tempo, 0.25, 4.0, 1.0)
    }

    pub fn velocity_clamped(&self) -> f64 {
        clamp_finite(self.velocity, 0.0, 1.0, 1.0)
    }

    pub fn output_gain_clamped(&self) -> f64 {
        clamp_finite(self.output_gain, 0.0, 2.0, 1.0)
    }

    pub fn fade_in_clamped(&self) -> f64 {
        clamp_finite(self.fade_in, 0.0, f64::MAX, 0.0)
    }

    pub fn fade_out_clamped(&self) -> f64 {
        clamp_finite(self.fade_out, 0.0, f64::MAX, 0.0)
    }

    /// Whether `kind` is part of the chain and switched on.
    pub fn module_active(&self, kind: FxKind) -> bool {
        if !self.fx_order.contains(kind) {
            return false;
        }
        match kind {
            FxKind::Filter => self.highpass_enabled || self.peaking_enabled || self.lowpass_enabled,
            FxKind::Distortion => self.distortion_enabled,
            FxKind::Compressor => self.compressor_enabled,
            FxKind::Delay => self.delay_enabled,
            FxKind::Reverb => self.reverb_enabled,
        }
    }
}

// ── Clamped parameter views ─────────────────────────────────

/// One biquad stage of the filter module.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterStage {
    pub enabled: bool,
    pub frequency: f64,
    pub q: f64,
    pub gain_db: f64,
}

/// High-pass → peaking → low-pass, in series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterParams {
    pub highpass: FilterStage,
    pub peaking: FilterStage,
    pub lowpass: FilterStage,
}

/// Clamp a cutoff into `[10 Hz, 0.49 * sample_rate]`.
pub fn clamp_frequency(freq: f64, sample_rate: f64, fallback: f64) -> f64 {
    let nyquist_guard = (sample_rate * 0.49).max(10.0);
    clamp_finite(freq, 10.0, nyquist_guard, fallback.min(nyquist_guard))
}

impl FilterParams {
    pub fn from_settings(s: &Settings, sample_rate: f64) -> Self {
        let q = |q: f64| clamp_finite(q, 0.0001, 30.0, 0.707);
        FilterParams {
            highpass: FilterStage {
                enabled: s.highpass_enabled,
                frequency: clamp_frequency(s.highpass_frequency, sample_rate, 80.0),
                q: q(s.highpass_q),
                gain_db: 0.0,
            },
            peaking: FilterStage {
                enabled: s.peaking_enabled,
                frequency: clamp_frequency(s.peaking_frequency, sample_rate, 1000.0),
                q: q(s.peaking_q),
                gain_db: clamp_finite(s.peaking_gain, -40.0, 40.0, 0.0),
            },
            lowpass: FilterStage {
                enabled: s.lowpass_enabled,
                frequency: clamp_frequency(s.lowpass_frequency, sample_rate, 18000.0),
                q: q(s.lowpass_q),
                gain_db: 0.0,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistortionParams {
    pub enabled: bool,
    /// Drive in `[0, 1]`.
    pub amount: f64,
}

impl DistortionParams {
    pub fn from_settings(s: &Settings) -> Self {
        DistortionParams {
            enabled: s.distortion_enabled,
            amount: clamp_finite(s.distortion_amount, 0.0, 1.0, 0.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressorParams {
    pub enabled: bool,
    /// Threshold in dB.
    pub threshold: f64,
    pub ratio: f64,
    /// Attack in seconds.
    pub attack: f64,
    /// Release in seconds.
    pub release: f64,
}

impl CompressorParams {
    pub fn from_settings(s: &Settings) -> Self {
        CompressorParams {
            enabled: s.compressor_enabled,
            threshold: clamp_finite(s.compressor_threshold, -100.0, 0.0, -24.0),
            ratio: clamp_finite(s.compressor_ratio, 1.0, 20.0, 4.0),
            attack: clamp_finite(s.compressor_attack, 0.0, 1.0, 0.003),
            release: clamp_finite(s.compressor_release, 0.0, 1.0, 0.25),
        }
    }

    /// Threshold and ratio actually applied; a disabled compressor is a
    /// unity-ratio no-op.
    pub fn effective(&self) -> (f64, f64) {
        if self.enabled {
            (self.threshold, self.ratio)
        } else {
            (0.0, 1.0)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelayParams {
    pub enabled: bool,
    /// Delay time in seconds.
    pub time: f64,
    /// Feedback gain, kept below 1 for stability.
    pub feedback: f64,
    pub mix: f64,
    /// Tone low-pass cutoff in Hz.
    pub tone: f64,
}

impl DelayParams {
    pub fn from_settings(s: &Settings, sample_rate: f64) -> Self {
        DelayParams {
            enabled: s.delay_enabled,
            time: clamp_finite(s.delay_time, 0.001, MAX_DELAY_SECONDS, 0.25),
            feedback: clamp_finite(s.delay_feedback, 0.0, 0.95, 0.3),
            mix: clamp_finite(s.delay_mix, 0.0, 1.0, 0.3),
            tone: clamp_frequency(s.delay_tone, sample_rate, 4000.0),
        }
    }

    /// Extra seconds the echoes ring past the dry signal.
    pub fn tail(&self) -> f64 {
        if self.enabled {
            self.time * DELAY_TAIL_FACTOR
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReverbParams {
    pub enabled: bool,
    /// Impulse length in seconds.
    pub seconds: f64,
    /// Exponent of the amplitude envelope.
    pub decay: f64,
    pub mix: f64,
    /// High-frequency damping in `[0, 1]`.
    pub damping: f64,
}

impl ReverbParams {
    pub fn from_settings(s: &Settings) -> Self {
        ReverbParams {
            enabled: s.reverb_enabled,
            seconds: clamp_finite(s.reverb_seconds, 0.1, 10.0, 2.0),
            decay: clamp_finite(s.reverb_decay, 0.0, 10.0, 2.0),
            mix: clamp_finite(s.reverb_mix, 0.0, 1.0, 0.3),
            damping: clamp_finite(s.reverb_damping, 0.0, 1.0, 0.4),
        }
    }

    pub fn tail(&self) -> f64 {
        if self.enabled {
            self.seconds * (1.0 + self.decay * REVERB_TAIL_DECAY_FACTOR)
        } else {
            0.0
        }
    }

    /// Identity of the synthesized impulse; equal signatures share one IR.
    pub fn signature(&self) -> String {
        format!("{:.4}:{:.4}:{:.4}", self.seconds, self.decay, self.damping)
    }

    /// Cutoff of the post-convolution damping low-pass.
    pub fn damping_cutoff(&self) -> f64 {
        18000.0 - self.damping * 16000.0
    }
}

// ── Formant compensation ────────────────────────────────────

const FORMANT_LOW_HZ: f64 = 320.0;
const FORMANT_HIGH_HZ: f64 = 3200.0;
const FORMANT_LOW_DB: f64 = 4.0;
const FORMANT_HIGH_DB: f64 = 6.0;
const FORMANT_MAX_AMOUNT: f64 = 1.5;

/// Shelving pair that tilts the spectrum against a pitch shift.
///
/// Fixed heuristic: a low shelf and a high shelf whose gains scale with
/// `|semitones| / 12` (capped at 1.5) and flip sign with the shift direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FormantCompensation {
    pub enabled: bool,
    pub low_frequency: f64,
    pub high_frequency: f64,
    pub low_gain_db: f64,
    pub high_gain_db: f64,
}

impl FormantCompensation {
    pub fn from_settings(s: &Settings) -> Self {
        let semitones = s.semitones_clamped();
        let amount = (semitones.abs() / 12.0).min(FORMANT_MAX_AMOUNT);
        let direction = semitones.signum();
        let enabled = s.preserve_formants && amount > 0.0;
        FormantCompensation {
            enabled,
            low_frequency: FORMANT_LOW_HZ,
            high_frequency: FORMANT_HIGH_HZ,
            // Shifting up brightens: lift lows, cut highs. Down is the mirror.
            low_gain_db: if enabled { FORMANT_LOW_DB * amount * direction } else { 0.0 },
            high_gain_db: if enabled { -FORMANT_HIGH_DB * amount * direction } else { 0.0 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let s = Settings::from_json(r#"{"pitchMode":"granular","delayEnabled":true}"#).unwrap();
        assert_eq!(s.pitch_mode, PitchMode::Granular);
        assert!(s.delay_enabled);
        assert_eq!(s.tempo, 1.0);
        assert_eq!(s.fx_order.kinds(), &FxKind::ALL);
    }

    #[test]
    fn fx_order_rejects_duplicates() {
        let err = FxOrder::new(vec![FxKind::Delay, FxKind::Filter, FxKind::Delay]).unwrap_err();
        assert!(matches!(err, LabError::DuplicateModule(FxKind::Delay)));

        let json = r#"{"fxOrder":["reverb","reverb"]}"#;
        assert!(Settings::from_json(json).is_err());
    }

    #[test]
    fn fx_order_accepts_subsets() {
        let s = Settings::from_json(r#"{"fxOrder":["reverb","filter"]}"#).unwrap();
        assert_eq!(s.fx_order.kinds(), &[FxKind::Reverb, FxKind::Filter]);
        assert!(!s.fx_order.contains(FxKind::Delay));
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let s = Settings {
            delay_feedback: 1.2,
            tempo: 9.0,
            velocity: -3.0,
            output_gain: f64::NAN,
            reverb_mix: 4.0,
            ..Settings::default()
        };
        assert_eq!(DelayParams::from_settings(&s, 44100.0).feedback, 0.95);
        assert_eq!(s.tempo_clamped(), 4.0);
        assert_eq!(s.velocity_clamped(), 0.0);
        assert_eq!(s.output_gain_clamped(), 1.0);
        assert_eq!(ReverbParams::from_settings(&s).mix, 1.0);
    }

    #[test]
    fn filter_frequency_stays_below_nyquist() {
        let s = Settings {
            lowpass_frequency: 40000.0,
            ..Settings::default()
        };
        let p = FilterParams::from_settings(&s, 22050.0);
        assert!(p.lowpass.frequency < 11025.0);
    }

    #[test]
    fn disabled_compressor_is_unity() {
        let p = CompressorParams::from_settings(&Settings::default());
        assert_eq!(p.effective(), (0.0, 1.0));
    }

    #[test]
    fn tails_only_when_enabled() {
        let mut s = Settings {
            delay_time: 0.5,
            reverb_seconds: 1.0,
            reverb_decay: 2.0,
            ..Settings::default()
        };
        assert_eq!(DelayParams::from_settings(&s, 44100.0).tail(), 0.0);
        assert_eq!(ReverbParams::from_settings(&s).tail(), 0.0);
        s.delay_enabled = true;
        s.reverb_enabled = true;
        assert!((DelayParams::from_settings(&s, 44100.0).tail() - 1.9).abs() < 1e-12);
        assert!((ReverbParams::from_settings(&s).tail() - 1.7).abs() < 1e-12);
    }

    #[test]
    fn formant_gain_flips_with_direction() {
        let up = FormantCompensation::from_settings(&Settings {
            pitch_semitones: 12.0,
            preserve_formants: true,
            ..Settings::default()
        });
        let down = FormantCompensation::from_settings(&Settings {
            pitch_semitones: -12.0,
            preserve_formants: true,
            ..Settings::default()
        });
        assert!(up.enabled && down.enabled);
        assert!(up.high_gain_db < 0.0 && down.high_gain_db > 0.0);
        assert!((up.low_gain_db + down.low_gain_db).abs() < 1e-12);
    }

    #[test]
    fn formant_amount_is_capped() {
        let f = FormantCompensation::from_settings(&Settings {
            pitch_semitones: 24.0,
            preserve_formants: true,
            ..Settings::default()
        });
        assert!((f.high_gain_db + FORMANT_HIGH_DB * 1.5).abs() < 1e-12);
    }

    #[test]
    fn formant_disabled_without_flag_or_shift() {
        let off = FormantCompensation::from_settings(&Settings {
            pitch_semitones: 5.0,
            ..Settings::default()
        });
        assert!(!off.enabled);
        let flat = FormantCompensation::from_settings(&Settings {
            preserve_formants: true,
            ..Settings::default()
        });
        assert!(!flat.enabled);
    }

    #[test]
    fn module_active_requires_order_membership() {
        let s = Settings {
            reverb_enabled: true,
            fx_order: FxOrder::new(vec![FxKind::Delay]).unwrap(),
            ..Settings::default()
        };
        assert!(!s.module_active(FxKind::Reverb));
    }
}
