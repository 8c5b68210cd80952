//! Biquad filter — Audio EQ Cookbook coefficients.

use std::f64::consts::PI;

/// Response of a [`BiquadFilter`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FilterType {
    Lowpass,
    Highpass,
    Peaking,
    Lowshelf,
    Highshelf,
}

/// Normalized coefficients `(b0, b1, b2, a1, a2)`.
type Coefficients = (f64, f64, f64, f64, f64);

/// Cookbook coefficients for one response.
fn design(filter_type: FilterType, sample_rate: f64, frequency: f64, q: f64, gain_db: f64) -> Coefficients {
    let w0 = 2.0 * PI * frequency / sample_rate;
    let (sin, cos) = w0.sin_cos();
    let alpha = sin / (2.0 * q);
    let amp = 10.0_f64.powf(gain_db / 40.0);

    let normalize = |b0: f64, b1: f64, b2: f64, a0: f64, a1: f64, a2: f64| {
        (b0 / a0, b1 / a0, b2 / a0, a1 / a0, a2 / a0)
    };

    match filter_type {
        FilterType::Lowpass => {
            let b = (1.0 - cos) / 2.0;
            normalize(b, 2.0 * b, b, 1.0 + alpha, -2.0 * cos, 1.0 - alpha)
        }
        FilterType::Highpass => {
            let b = (1.0 + cos) / 2.0;
            normalize(b, -2.0 * b, b, 1.0 + alpha, -2.0 * cos, 1.0 - alpha)
        }
        FilterType::Peaking => normalize(
            1.0 + alpha * amp,
            -2.0 * cos,
            1.0 - alpha * amp,
            1.0 + alpha / amp,
            -2.0 * cos,
            1.0 - alpha / amp,
        ),
        FilterType::Lowshelf | FilterType::Highshelf => {
            // The high shelf is the low shelf with cos negated
            let sign = if filter_type == FilterType::Lowshelf { 1.0 } else { -1.0 };
            let c = sign * cos;
            let beta = 2.0 * amp.sqrt() * alpha;
            let (up, down) = (amp + 1.0, amp - 1.0);
            normalize(
                amp * (up - down * c + beta),
                sign * 2.0 * amp * (down - up * c),
                amp * (up - down * c - beta),
                up + down * c + beta,
                -sign * 2.0 * (down + up * c),
                up + down * c - beta,
            )
        }
    }
}

/// Second-order IIR section, Direct Form II Transposed.
///
/// Parameter changes mark the coefficients dirty; they are recomputed
/// lazily on the next sample and the state is kept, so a running signal
/// does not click.
#[derive(Debug, Clone)]
pub struct BiquadFilter {
    pub filter_type: FilterType,
    pub frequency: f64,
    pub q: f64,
    /// Peaking and shelves only.
    pub gain_db: f64,
    sample_rate: f64,
    coefficients: Coefficients,
    z1: f64,
    z2: f64,
    dirty: bool,
}

impl BiquadFilter {
    pub fn with_params(filter_type: FilterType, sample_rate: f64, frequency: f64, q: f64, gain_db: f64) -> Self {
        BiquadFilter {
            filter_type,
            frequency,
            q,
            gain_db,
            sample_rate,
            coefficients: design(filter_type, sample_rate, frequency, q, gain_db),
            z1: 0.0,
            z2: 0.0,
            dirty: false,
        }
    }

    fn update_coefficients(&mut self) {
        self.coefficients = design(self.filter_type, self.sample_rate, self.frequency, self.q, self.gain_db);
        self.dirty = false;
    }

    #[inline]
    pub fn process(&mut self, input: f64) -> f64 {
        if self.dirty {
            self.update_coefficients();
        }
        let (b0, b1, b2, a1, a2) = self.coefficients;
        let output = b0 * input + self.z1;
        self.z1 = b1 * input - a1 * output + self.z2;
        self.z2 = b2 * input - a2 * output;
        output
    }

    pub fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }

    /// Set every parameter at once. Marks the filter dirty only when
    /// something changed.
    pub fn configure(&mut self, filter_type: FilterType, frequency: f64, q: f64, gain_db: f64) {
        if (self.filter_type, self.frequency, self.q, self.gain_db) != (filter_type, frequency, q, gain_db) {
            self.filter_type = filter_type;
            self.frequency = frequency;
            self.q = q;
            self.gain_db = gain_db;
            self.dirty = true;
        }
    }
}
