//! Offline renderer — settings plus a source buffer in, one finished
//! buffer out.
//!
//! trim → pitch/tempo → [`SignalPath`] over the processed source and its
//! effect tails. The output is sized once from [`planned_frames`] before
//! any frame is synthesized.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::{AudioBuffer, trim, yield_point};
use crate::dsp::reverb::ImpulseCache;
use crate::error::Result;
use crate::path::{PATH_CHUNK, SignalPath, planned_frames, tail_seconds};
use crate::pcm::encode_wav;
use crate::settings::Settings;
use crate::stretch::{StretchBackend, Wsola, apply_pitch_tempo};

/// Offline renderer.
///
/// Holds the global volume, the `hq` stretch backend and the reverb
/// impulse cache, so repeated renders with the same room skip synthesis.
pub struct Renderer {
    master_volume: f64,
    backend: Arc<dyn StretchBackend>,
    cache: Mutex<ImpulseCache>,
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer {
    pub fn new() -> Self {
        Renderer {
            master_volume: 1.0,
            backend: Arc::new(Wsola),
            cache: Mutex::new(ImpulseCache::new()),
        }
    }

    pub fn with_master_volume(mut self, volume: f64) -> Self {
        self.master_volume = volume.clamp(0.0, 1.0);
        self
    }

    /// Use a different stretch library for `hq` mode.
    pub fn with_backend(mut self, backend: Arc<dyn StretchBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn master_volume(&self) -> f64 {
        self.master_volume
    }

    /// Render `source` with `settings`.
    pub async fn render(&self, source: &AudioBuffer, settings: &Settings) -> Result<AudioBuffer> {
        let sample_rate = source.sample_rate();
        let channels = source.channel_count();

        let trimmed = trim(source, settings.offset_clamped());
        let processed = apply_pitch_tempo(&trimmed, settings, self.backend.as_ref()).await;
        let base = processed.len();
        let total = planned_frames(settings, base, sample_rate);
        tracing::debug!(
            mode = ?settings.pitch_mode,
            base_frames = base,
            total_frames = total,
            tail_seconds = tail_seconds(settings, sample_rate),
            "render plan"
        );

        let mut path = {
            let mut cache = self.cache.lock();
            SignalPath::new(settings, self.master_volume, channels, sample_rate, base, total, &mut cache, 0.0)
        };

        let mut out = vec![vec![0.0_f32; total]; channels];
        let mut frame = vec![0.0_f32; channels];
        let mut start = 0;
        while start < total {
            let end = (start + PATH_CHUNK).min(total);
            for i in start..end {
                for (s, src) in frame.iter_mut().zip(processed.channels()) {
                    *s = src.get(i).copied().unwrap_or(0.0);
                }
                path.process_frame(&mut frame);
                for (dst, &s) in out.iter_mut().zip(&frame) {
                    dst[i] = s;
                }
            }
            start = end;
            if start < total {
                yield_point().await;
            }
        }

        AudioBuffer::new(out, sample_rate)
    }

    /// Render and encode as 16-bit WAV.
    pub async fn render_wav(&self, source: &AudioBuffer, settings: &Settings) -> Result<Vec<u8>> {
        let rendered = self.render(source, settings).await?;
        encode_wav(&rendered).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{FxKind, FxOrder, PitchMode};
    use approx::assert_abs_diff_eq;

    const SR: u32 = 44_100;

    fn source(seconds: f64, channels: usize) -> AudioBuffer {
        let len = (seconds * SR as f64) as usize;
        let ch: Vec<f32> = (0..len)
            .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / SR as f32).sin() * 0.5)
            .collect();
        AudioBuffer::new(vec![ch; channels], SR).unwrap()
    }

    #[tokio::test]
    async fn tape_octave_up_halves_duration() {
        let s = Settings {
            pitch_mode: PitchMode::Tape,
            pitch_semitones: 12.0,
            ..Settings::default()
        };
        let out = Renderer::new().render(&source(2.0, 1), &s).await.unwrap();
        assert_abs_diff_eq!(out.duration(), 1.0, epsilon = 1e-4);
        assert_eq!(out.sample_rate(), SR);
        assert_eq!(out.channel_count(), 1);
    }

    #[tokio::test]
    async fn tape_duration_follows_semitones() {
        let src = source(1.0, 1);
        let renderer = Renderer::new();
        for semitones in [-12.0, -5.0, 0.0, 3.0, 7.0, 19.0] {
            let s = Settings {
                pitch_semitones: semitones,
                ..Settings::default()
            };
            let out = renderer.render(&src, &s).await.unwrap();
            let expected = 1.0 / 2f64.powf(semitones / 12.0);
            assert_abs_diff_eq!(out.duration(), expected, epsilon = 1.0 / SR as f64);
        }
    }

    #[tokio::test]
    async fn granular_double_tempo_halves_duration() {
        let s = Settings {
            pitch_mode: PitchMode::Granular,
            tempo: 2.0,
            ..Settings::default()
        };
        let out = Renderer::new().render(&source(2.0, 2), &s).await.unwrap();
        assert_abs_diff_eq!(out.duration(), 1.0, epsilon = 1e-4);
        assert_eq!(out.channel_count(), 2);
    }

    #[tokio::test]
    async fn delay_tail_extends_output() {
        let s = Settings {
            delay_enabled: true,
            delay_time: 0.5,
            delay_feedback: 0.5,
            ..Settings::default()
        };
        let out = Renderer::new().render(&source(1.0, 1), &s).await.unwrap();
        assert!(out.duration() >= 1.0 + 0.5 * 3.8 - 1e-9, "{}", out.duration());
        // Echo of the source lands past its end
        let after = &out.channel(0)[SR as usize + 100..(SR as f64 * 1.4) as usize];
        assert!(after.iter().any(|s| s.abs() > 0.05));
    }

    #[tokio::test]
    async fn reverb_adds_at_least_its_length() {
        let dry = Settings {
            reverb_seconds: 0.5,
            reverb_decay: 2.0,
            ..Settings::default()
        };
        let wet = Settings {
            reverb_enabled: true,
            ..dry.clone()
        };
        let renderer = Renderer::new();
        let src = source(0.5, 1);
        let a = renderer.render(&src, &dry).await.unwrap();
        let b = renderer.render(&src, &wet).await.unwrap();
        assert!(b.duration() >= a.duration() + 0.5, "{} vs {}", b.duration(), a.duration());
        let tail = &b.channel(0)[src.len() + 2000..];
        assert!(tail.iter().any(|s| s.abs() > 1e-4));
    }

    #[tokio::test]
    async fn reverb_outside_order_adds_nothing() {
        let s = Settings {
            reverb_enabled: true,
            fx_order: FxOrder::new(vec![FxKind::Filter, FxKind::Delay]).unwrap(),
            ..Settings::default()
        };
        let src = source(0.5, 1);
        let out = Renderer::new().render(&src, &s).await.unwrap();
        assert_eq!(out.len(), src.len());
    }

    #[tokio::test]
    async fn fade_endpoints_and_middle() {
        let s = Settings {
            fade_in: 0.1,
            fade_out: 0.1,
            ..Settings::default()
        };
        let src = AudioBuffer::new(vec![vec![0.5; SR as usize]], SR).unwrap();
        let out = Renderer::new().render(&src, &s).await.unwrap();
        let ch = out.channel(0);
        assert_eq!(ch[0], 0.0);
        assert_eq!(ch[ch.len() - 1], 0.0);
        for &v in &ch[(SR / 10) as usize..(SR as usize - SR as usize / 10)] {
            assert_abs_diff_eq!(v, 0.5, epsilon = 1e-6);
        }
    }

    #[tokio::test]
    async fn offset_is_trimmed() {
        let s = Settings {
            offset: 0.25,
            ..Settings::default()
        };
        let out = Renderer::new().render(&source(1.0, 1), &s).await.unwrap();
        assert_abs_diff_eq!(out.duration(), 0.75, epsilon = 1e-4);
    }

    #[tokio::test]
    async fn master_volume_scales_output() {
        let src = AudioBuffer::new(vec![vec![0.5; 1000]], SR).unwrap();
        let out = Renderer::new()
            .with_master_volume(0.5)
            .render(&src, &Settings::default())
            .await
            .unwrap();
        assert_abs_diff_eq!(out.channel(0)[500], 0.25, epsilon = 1e-6);
    }

    #[tokio::test]
    async fn render_wav_has_header() {
        let wav = Renderer::new()
            .render_wav(&source(0.1, 2), &Settings::default())
            .await
            .unwrap();
        assert_eq!(&wav[..4], b"RIFF");
        assert_eq!(wav.len(), 44 + 4410 * 2 * 2);
    }
}
