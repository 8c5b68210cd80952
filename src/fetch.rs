//! Fetch boundary — download a sample and decode it before any processing.
//!
//! WAV is decoded with `hound`, MP3 with `minimp3`. Any failure aborts the
//! call; no partial buffer is returned.

use std::io::Cursor;

use crate::buffer::AudioBuffer;
use crate::error::{LabError, Result};
use crate::pcm::decode_wav;

/// GET `url` and decode the body into an [`AudioBuffer`].
pub async fn fetch_source(url: &str) -> Result<AudioBuffer> {
    let response = reqwest::get(url).await?;
    let status = response.status();
    if !status.is_success() {
        return Err(LabError::FetchStatus(status.as_u16()));
    }
    let bytes = response.bytes().await?;
    tracing::debug!(url, bytes = bytes.len(), "fetched sample");
    decode_bytes(&bytes)
}

/// Decode WAV or MP3 bytes, picked by the RIFF magic.
pub fn decode_bytes(bytes: &[u8]) -> Result<AudioBuffer> {
    if bytes.starts_with(b"RIFF") {
        decode_wav(bytes)
    } else {
        decode_mp3(bytes)
    }
}

/// Decode an MP3 stream to float samples.
pub fn decode_mp3(bytes: &[u8]) -> Result<AudioBuffer> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(bytes));
    let mut samples = Vec::new();
    let mut channels = 0;
    let mut sample_rate = 0;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                if channels == 0 {
                    channels = frame.channels;
                    sample_rate = frame.sample_rate;
                } else if frame.channels != channels {
                    return Err(LabError::Decode("mp3 channel count changed mid-stream".into()));
                }
                samples.extend(frame.data.iter().map(|&s| s as f32 / 32768.0));
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(LabError::Decode(format!("mp3: {e}"))),
        }
    }

    if channels == 0 || samples.is_empty() {
        return Err(LabError::Decode("no audio frames found".into()));
    }
    let sample_rate =
        u32::try_from(sample_rate).map_err(|_| LabError::Decode(format!("bad sample rate {sample_rate}")))?;
    AudioBuffer::from_interleaved(&samples, channels, sample_rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_audio_bytes_fail() {
        assert!(matches!(decode_bytes(b"hello, world"), Err(LabError::Decode(_))));
        assert!(matches!(decode_bytes(b"RIFF1234"), Err(LabError::Decode(_))));
    }

    #[tokio::test]
    async fn wav_bytes_dispatch_to_wav_decoder() {
        let buffer = AudioBuffer::new(vec![vec![0.5; 16]], 8000).unwrap();
        let wav = crate::pcm::encode_wav(&buffer).await.unwrap();
        let back = decode_bytes(&wav).unwrap();
        assert_eq!(back.len(), 16);
    }
}
