//! 16-bit PCM WAV encoding and WAV decoding.

use std::io::Cursor;

use crate::buffer::{AudioBuffer, yield_point};
use crate::error::{LabError, Result};

/// Frames converted between cooperative yields.
pub const ENCODE_CHUNK: usize = 32_768;

const HEADER_LEN: usize = 44;
const BITS_PER_SAMPLE: u16 = 16;

/// Float sample to 16-bit: clamp, then scale negatives by 32768 and the
/// rest by 32767 before truncation.
#[inline]
pub fn to_i16(sample: f32) -> i16 {
    let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Encode `buffer` as a canonical 44-byte-header RIFF/WAVE file with
/// interleaved 16-bit little-endian samples.
pub async fn encode_wav(buffer: &AudioBuffer) -> Result<Vec<u8>> {
    let channels = buffer.channel_count();
    let frames = buffer.len();
    let block_align = channels * (BITS_PER_SAMPLE as usize / 8);
    let data_size = frames
        .checked_mul(block_align)
        .ok_or(LabError::EncodeOverflow(usize::MAX))?;
    let riff_size = u32::try_from(data_size + 36).map_err(|_| LabError::EncodeOverflow(data_size))?;
    let channel_field = u16::try_from(channels).map_err(|_| LabError::EncodeOverflow(data_size))?;
    let sample_rate = buffer.sample_rate();
    let byte_rate = sample_rate
        .checked_mul(block_align as u32)
        .ok_or(LabError::EncodeOverflow(data_size))?;

    let mut buf = Vec::with_capacity(HEADER_LEN + data_size);

    // RIFF header
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&riff_size.to_le_bytes());
    buf.extend_from_slice(b"WAVE");

    // fmt chunk
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes()); // chunk size
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM format
    buf.extend_from_slice(&channel_field.to_le_bytes());
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&byte_rate.to_le_bytes());
    buf.extend_from_slice(&(block_align as u16).to_le_bytes());
    buf.extend_from_slice(&BITS_PER_SAMPLE.to_le_bytes());

    // data chunk
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&(data_size as u32).to_le_bytes());

    let mut start = 0;
    while start < frames {
        let end = (start + ENCODE_CHUNK).min(frames);
        for i in start..end {
            for ch in buffer.channels() {
                buf.extend_from_slice(&to_i16(ch[i]).to_le_bytes());
            }
        }
        start = end;
        if start < frames {
            yield_point().await;
        }
    }

    Ok(buf)
}

/// Decode WAV bytes (8/16/24/32-bit integer or 32-bit float PCM).
pub fn decode_wav(bytes: &[u8]) -> Result<AudioBuffer> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    let channels = spec.channels as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<std::result::Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1_i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<std::result::Result<_, _>>()?
        }
    };

    AudioBuffer::from_interleaved(&interleaved, channels, spec.sample_rate)
}
