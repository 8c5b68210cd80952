//! Distortion — waveshaper driven by a sampled transfer curve.

use std::f64::consts::PI;

/// Points in a transfer curve.
pub const CURVE_SIZE: usize = 2048;

/// Fill `curve` with the classic soft-clip transfer function
/// `y = (3 + k)·x·20° / (π + k·|x|)`, `k = amount·180`, sampled over
/// `x ∈ [-1, 1]`.
pub fn fill_distortion_curve(curve: &mut [f32], amount: f64) {
    let k = amount.clamp(0.0, 1.0) * 180.0;
    let deg = PI / 180.0;
    let last = (curve.len().max(2) - 1) as f64;
    for (i, y) in curve.iter_mut().enumerate() {
        let x = i as f64 * 2.0 / last - 1.0;
        *y = ((3.0 + k) * x * 20.0 * deg / (PI + k * x.abs())) as f32;
    }
}

/// Fill `curve` with the identity transfer `y = x`.
pub fn fill_identity_curve(curve: &mut [f32]) {
    let last = (curve.len().max(2) - 1) as f64;
    for (i, y) in curve.iter_mut().enumerate() {
        *y = (i as f64 * 2.0 / last - 1.0) as f32;
    }
}

pub fn distortion_curve(amount: f64) -> Vec<f32> {
    let mut curve = vec![0.0; CURVE_SIZE];
    fill_distortion_curve(&mut curve, amount);
    curve
}

/// Waveshaper: maps each sample through the curve with linear
/// interpolation, input clamped to `[-1, 1]`.
#[derive(Debug, Clone)]
pub struct Distortion {
    curve: Vec<f32>,
    enabled: bool,
    amount: f64,
}

impl Distortion {
    pub fn new(enabled: bool, amount: f64) -> Self {
        let mut d = Distortion {
            curve: vec![0.0; CURVE_SIZE],
            enabled: !enabled,
            amount: f64::NAN,
        };
        d.set_params(enabled, amount);
        d
    }

    /// Rewrite the curve in place when the shape changes.
    pub fn set_params(&mut self, enabled: bool, amount: f64) {
        if enabled == self.enabled && amount == self.amount {
            return;
        }
        self.enabled = enabled;
        self.amount = amount;
        if enabled {
            fill_distortion_curve(&mut self.curve, amount);
        } else {
            fill_identity_curve(&mut self.curve);
        }
    }

    pub fn curve(&self) -> &[f32] {
        &self.curve
    }

    #[inline]
    pub fn shape(&self, input: f32) -> f32 {
        let last = (self.curve.len() - 1) as f32;
        let pos = (input.clamp(-1.0, 1.0) + 1.0) * 0.5 * last;
        let idx = pos as usize;
        if idx >= self.curve.len() - 1 {
            return self.curve[self.curve.len() - 1];
        }
        let frac = pos - idx as f32;
        self.curve[idx] + (self.curve[idx + 1] - self.curve[idx]) * frac
    }

    pub fn process_frame(&mut self, frame: &mut [f32]) {
        for s in frame.iter_mut() {
            *s = self.shape(*s);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn curve_is_odd() {
        for amount in [0.0, 0.3, 1.0] {
            let c = distortion_curve(amount);
            let n = c.len();
            for i in 0..n {
                assert!(
                    (c[i] + c[n - 1 - i]).abs() < 1e-6,
                    "curve not odd at {i} for amount {amount}"
                );
            }
        }
    }

    #[test]
    fn more_drive_saturates_harder() {
        let soft = Distortion::new(true, 0.1);
        let hard = Distortion::new(true, 1.0);
        assert!(hard.shape(0.2) > soft.shape(0.2));
        assert!(hard.shape(1.0) <= 1.0 + 1e-6);
    }

    #[test]
    fn disabled_is_identity() {
        let d = Distortion::new(false, 0.8);
        for x in [-1.0_f32, -0.5, 0.0, 0.123, 0.9] {
            assert!((d.shape(x) - x).abs() < 1e-5, "identity failed at {x}");
        }
    }

    #[test]
    fn toggling_rewrites_curve() {
        let mut d = Distortion::new(false, 0.8);
        let identity = d.shape(0.5);
        d.set_params(true, 0.8);
        assert!((d.shape(0.5) - identity).abs() > 0.01);
        d.set_params(false, 0.8);
        assert!((d.shape(0.5) - 0.5).abs() < 1e-5);
    }
}
