//! Delay effect — feedback delay line with a tone low-pass in the loop.
//!
//! Topology per channel:
//!
//! ```text
//! in ──┬──────────────── dry ──────────────┐
//!      └─► line ─► tone LP ─┬─── wet ──────┴─► out
//!           ▲               │
//!           └── feedback ◄──┘
//! ```

use crate::settings::{DelayParams, MAX_DELAY_SECONDS};

use super::filter::{BiquadFilter, FilterType};
use super::smoothing::SmoothedParam;

/// A multichannel delay with time, feedback, mix and tone control.
///
/// The line holds `MAX_DELAY_SECONDS` of audio so the time can move
/// while running without reallocating.
#[derive(Debug, Clone)]
pub struct Delay {
    lines: Vec<Vec<f32>>,
    tone: Vec<BiquadFilter>,
    write_pos: usize,
    sample_rate: f64,

    time: SmoothedParam,
    feedback: SmoothedParam,
    wet: SmoothedParam,
    dry: SmoothedParam,
}

impl Delay {
    pub fn new(params: &DelayParams, channels: usize, sample_rate: f64, ramp_ms: f64) -> Self {
        let buffer_size = (sample_rate * MAX_DELAY_SECONDS) as usize + 2;
        let (wet, dry) = Self::gains(params);
        Self {
            lines: vec![vec![0.0; buffer_size]; channels],
            tone: (0..channels)
                .map(|_| {
                    BiquadFilter::with_params(FilterType::Lowpass, sample_rate, params.tone, 0.707, 0.0)
                })
                .collect(),
            write_pos: 0,
            sample_rate,
            time: SmoothedParam::new(params.time, ramp_ms, sample_rate),
            feedback: SmoothedParam::new(params.feedback, ramp_ms, sample_rate),
            wet: SmoothedParam::new(wet, ramp_ms, sample_rate),
            dry: SmoothedParam::new(dry, ramp_ms, sample_rate),
        }
    }

    /// Wet and dry gains; disabled means fully dry.
    fn gains(params: &DelayParams) -> (f64, f64) {
        if params.enabled {
            (params.mix, 1.0 - params.mix)
        } else {
            (0.0, 1.0)
        }
    }

    pub fn set_params(&mut self, params: &DelayParams) {
        let (wet, dry) = Self::gains(params);
        self.time.set_target(params.time);
        self.feedback.set_target(params.feedback);
        self.wet.set_target(wet);
        self.dry.set_target(dry);
        for f in &mut self.tone {
            f.configure(FilterType::Lowpass, params.tone, 0.707, 0.0);
        }
    }

    /// Read `delay` samples behind the write head, linearly interpolated.
    #[inline]
    fn read_fractional(line: &[f32], write_pos: usize, delay: f64) -> f32 {
        let len = line.len();
        let delay_int = delay as usize;
        let frac = (delay - delay_int as f64) as f32;
        let p0 = (write_pos + len - delay_int) % len;
        let p1 = (p0 + len - 1) % len;
        line[p0] + (line[p1] - line[p0]) * frac
    }

    /// Process one frame in place.
    #[inline]
    pub fn process_frame(&mut self, frame: &mut [f32]) {
        let buffer_len = self.lines.first().map_or(0, Vec::len);
        if buffer_len < 3 {
            return;
        }
        let delay_samples = (self.time.next() * self.sample_rate).clamp(1.0, (buffer_len - 2) as f64);
        let feedback = self.feedback.next() as f32;
        let wet = self.wet.next() as f32;
        let dry = self.dry.next() as f32;

        for ((sample, line), tone) in frame.iter_mut().zip(&mut self.lines).zip(&mut self.tone) {
            let delayed = Self::read_fractional(line, self.write_pos, delay_samples);
            let toned = tone.process(delayed as f64) as f32;
            line[self.write_pos] = *sample + toned * feedback;
            *sample = *sample * dry + toned * wet;
        }

        self.write_pos = (self.write_pos + 1) % buffer_len;
    }

    /// Clear the delay lines.
    pub fn clear(&mut self) {
        for line in &mut self.lines {
            line.fill(0.0);
        }
        for f in &mut self.tone {
            f.reset();
        }
        self.write_pos = 0;
    }
}
