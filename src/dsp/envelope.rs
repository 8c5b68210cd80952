//! Fade envelope — linear fade-in and fade-out over a rendered region.

/// Gain law for the start and end of a render.
///
/// The fade-in ramps 0→1 from the first frame. The fade-out ramps 1→0
/// across the last frames of the output, so delay and reverb tails fade
/// with it. Both windows are limited to the dry (`base`) length and
/// never overlap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FadeEnvelope {
    total_frames: usize,
    fade_in_frames: usize,
    fade_out_frames: usize,
}

impl FadeEnvelope {
    /// `fade_in`/`fade_out` in seconds; `base_frames` is the dry length,
    /// `total_frames` includes effect tails.
    pub fn new(
        fade_in: f64,
        fade_out: f64,
        base_frames: usize,
        total_frames: usize,
        sample_rate: f64,
    ) -> Self {
        let to_frames = |secs: f64| (secs.max(0.0) * sample_rate).round() as usize;
        let base = base_frames.min(total_frames);
        let fade_in_frames = to_frames(fade_in).min(base);
        let fade_out_frames = to_frames(fade_out).min(base - fade_in_frames);
        FadeEnvelope {
            total_frames,
            fade_in_frames,
            fade_out_frames,
        }
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    /// Gain at frame `index`.
    #[inline]
    pub fn gain(&self, index: usize) -> f32 {
        let mut gain = 1.0_f32;
        if self.fade_in_frames > 0 && index < self.fade_in_frames {
            gain = index as f32 / self.fade_in_frames as f32;
        }
        if self.fade_out_frames > 0 {
            let start = self.total_frames - self.fade_out_frames;
            if index >= start {
                let remaining = self.total_frames.saturating_sub(index + 1);
                gain = gain.min(remaining as f32 / self.fade_out_frames as f32);
            }
        }
        gain
    }
}
