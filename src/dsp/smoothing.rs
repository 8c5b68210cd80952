//! Parameter smoothing for live updates.
//!
//! Exponential ramp between current and target values so that parameter
//! changes on a running session never jump.

/// Ramp time used by live sessions, in milliseconds.
pub const LIVE_RAMP_MS: f64 = 20.0;

/// Smoothed parameter with exponential ramp.
#[derive(Debug, Clone)]
pub struct SmoothedParam {
    current: f64,
    target: f64,
    /// Coefficient per sample: `current = current + coeff * (target - current)`
    coeff: f64,
}

impl SmoothedParam {
    /// Create a new smoothed parameter.
    ///
    /// `ramp_ms`: time to reach ~63% of target (one time constant).
    /// A ramp of zero makes every `set_target` take effect immediately.
    pub fn new(initial: f64, ramp_ms: f64, sample_rate: f64) -> Self {
        Self {
            current: initial,
            target: initial,
            coeff: Self::coefficient(ramp_ms, sample_rate),
        }
    }

    fn coefficient(ramp_ms: f64, sample_rate: f64) -> f64 {
        let samples = (ramp_ms / 1000.0) * sample_rate;
        if samples <= 1.0 {
            1.0
        } else {
            1.0 - (-1.0_f64 / samples).exp()
        }
    }

    pub fn set_target(&mut self, target: f64) {
        self.target = target;
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    pub fn value(&self) -> f64 {
        self.current
    }

    /// Get next smoothed value (called per sample).
    #[inline]
    pub fn next(&mut self) -> f64 {
        if self.current != self.target {
            self.current += self.coeff * (self.target - self.current);
            if (self.current - self.target).abs() < 1e-9 {
                self.current = self.target;
            }
        }
        self.current
    }

    /// Snap to target immediately.
    pub fn reset(&mut self, value: f64) {
        self.current = value;
        self.target = value;
    }

    pub fn is_smoothing(&self) -> bool {
        self.current != self.target
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snap_on_reset() {
        let mut p = SmoothedParam::new(0.0, 10.0, 44100.0);
        p.reset(1.0);
        assert_eq!(p.next(), 1.0);
    }

    #[test]
    fn ramps_toward_target() {
        let mut p = SmoothedParam::new(0.0, 10.0, 44100.0);
        p.set_target(1.0);
        let first = p.next();
        assert!(first > 0.0 && first < 0.01, "first step should be small: {first}");
        for _ in 0..44100 {
            p.next();
        }
        assert_eq!(p.next(), 1.0);
        assert!(!p.is_smoothing());
    }

    #[test]
    fn zero_ramp_is_immediate() {
        let mut p = SmoothedParam::new(0.0, 0.0, 44100.0);
        p.set_target(0.7);
        assert_eq!(p.next(), 0.7);
    }
}
