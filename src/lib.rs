pub mod buffer;
pub mod dsp;
pub mod error;
#[cfg(feature = "fetch")]
pub mod fetch;
pub mod path;
pub mod pcm;
pub mod render;
pub mod session;
pub mod settings;
pub mod stretch;

pub use buffer::AudioBuffer;
pub use error::{LabError, Result};
pub use render::Renderer;
pub use session::{Lab, PlaybackOutput, WaveformReceiver};
pub use settings::{FxKind, FxOrder, PitchMode, Settings};
pub use stretch::{StretchBackend, StretchError, StretchProfile};

/// The crate version, read from Cargo.toml at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Render `source` with settings given as JSON and encode the result as
/// 16-bit WAV.
pub async fn render_json_to_wav(source: &AudioBuffer, settings_json: &str) -> Result<Vec<u8>> {
    let settings = Settings::from_json(settings_json)?;
    Renderer::new().render_wav(source, &settings).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn json_settings_render() {
        let source = AudioBuffer::new(vec![vec![0.1; 8000]], 8000).unwrap();
        let wav = render_json_to_wav(&source, r#"{"pitchMode":"tape","pitchSemitones":12}"#)
            .await
            .unwrap();
        assert_eq!(wav.len(), 44 + 4000 * 2);
    }

    #[tokio::test]
    async fn bad_json_is_a_settings_error() {
        let source = AudioBuffer::new(vec![vec![0.0; 10]], 8000).unwrap();
        let err = render_json_to_wav(&source, "{not json").await.unwrap_err();
        assert!(matches!(err, LabError::Settings(_)));
    }
}
