//! RIFF/WAV header parsing (component C2).
//!
//! TTS providers that return WAV-formatted audio don't reliably use a
//! 44-byte header — some emit extra chunks (`LIST`, `fact`) before `data`.
//! This scans for the `data` FourCC rather than assuming a fixed offset.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::CallError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WavPcm {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    /// Raw PCM payload, downmixed to mono if the source was multi-channel.
    pub data: Vec<u8>,
}

const RIFF_HEADER_LEN: usize = 12;
const FMT_CHANNELS_OFFSET: usize = 22;
const FMT_SAMPLE_RATE_OFFSET: usize = 24;
const FMT_BITS_PER_SAMPLE_OFFSET: usize = 34;

/// Parse a WAV byte buffer, returning the PCM payload and its sample rate.
/// Fails (as a non-fatal `TtsFailed`) if the format isn't 16-bit PCM.
pub fn parse_wav(bytes: &[u8]) -> Result<WavPcm, CallError> {
    if bytes.len() < RIFF_HEADER_LEN || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Err(CallError::TtsFailed("not a RIFF/WAVE buffer".to_string()));
    }
    if bytes.len() < FMT_BITS_PER_SAMPLE_OFFSET + 2 {
        return Err(CallError::TtsFailed("WAV header truncated".to_string()));
    }

    let channels = LittleEndian::read_u16(&bytes[FMT_CHANNELS_OFFSET..]);
    let sample_rate = LittleEndian::read_u32(&bytes[FMT_SAMPLE_RATE_OFFSET..]);
    let bits_per_sample = LittleEndian::read_u16(&bytes[FMT_BITS_PER_SAMPLE_OFFSET..]);

    if bits_per_sample != 16 {
        return Err(CallError::TtsFailed(format!(
            "unsupported WAV bit depth: {bits_per_sample}"
        )));
    }

    let (data_offset, data_len) = find_data_chunk(bytes)?;
    let raw = &bytes[data_offset..data_offset + data_len];

    let data = if channels > 1 {
        downmix_to_mono(raw, channels)
    } else {
        raw.to_vec()
    };

    Ok(WavPcm {
        sample_rate,
        channels: 1,
        bits_per_sample,
        data,
    })
}

/// Scan chunk headers from offset 12 looking for `data`, since the `fmt `
/// chunk (and any others preceding it) may not end at byte 44.
fn find_data_chunk(bytes: &[u8]) -> Result<(usize, usize), CallError> {
    let mut pos = RIFF_HEADER_LEN;
    while pos + 8 <= bytes.len() {
        let chunk_id = &bytes[pos..pos + 4];
        let chunk_len = LittleEndian::read_u32(&bytes[pos + 4..pos + 8]) as usize;
        let body_start = pos + 8;

        if chunk_id == b"data" {
            let available = bytes.len().saturating_sub(body_start);
            let len = chunk_len.min(available);
            return Ok((body_start, len));
        }

        // Chunks are word-aligned: an odd-length chunk is padded by one byte.
        let advance = chunk_len + (chunk_len % 2);
        pos = body_start + advance;
    }
    Err(CallError::TtsFailed("no data chunk found in WAV".to_string()))
}

fn downmix_to_mono(raw: &[u8], channels: u16) -> Vec<u8> {
    let channels = channels as usize;
    let frame_bytes = channels * 2;
    let mut out = Vec::with_capacity(raw.len() / channels.max(1));

    for frame in raw.chunks_exact(frame_bytes) {
        let mut sum: i32 = 0;
        for ch in 0..channels {
            let sample = LittleEndian::read_i16(&frame[ch * 2..ch * 2 + 2]) as i32;
            sum += sample;
        }
        let avg = (sum / channels as i32).clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        out.extend_from_slice(&avg.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_wav(sample_rate: u32, channels: u16, bits: u16, data: &[u8], leading_chunk: Option<(&[u8; 4], &[u8])>) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(b"WAVE");

        body.extend_from_slice(b"fmt ");
        body.extend_from_slice(&16u32.to_le_bytes());
        body.extend_from_slice(&1u16.to_le_bytes()); // PCM
        body.extend_from_slice(&channels.to_le_bytes());
        body.extend_from_slice(&sample_rate.to_le_bytes());
        let byte_rate = sample_rate * channels as u32 * (bits as u32 / 8);
        body.extend_from_slice(&byte_rate.to_le_bytes());
        body.extend_from_slice(&(channels * (bits / 8)).to_le_bytes());
        body.extend_from_slice(&bits.to_le_bytes());

        if let Some((id, chunk_data)) = leading_chunk {
            body.extend_from_slice(id);
            body.extend_from_slice(&(chunk_data.len() as u32).to_le_bytes());
            body.extend_from_slice(chunk_data);
            if chunk_data.len() % 2 == 1 {
                body.push(0);
            }
        }

        body.extend_from_slice(b"data");
        body.extend_from_slice(&(data.len() as u32).to_le_bytes());
        body.extend_from_slice(data);

        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&body);
        out
    }

    #[test]
    fn parses_standard_44_byte_header() {
        let pcm: Vec<u8> = vec![1, 0, 2, 0, 3, 0];
        let wav = build_wav(24000, 1, 16, &pcm, None);
        let parsed = parse_wav(&wav).unwrap();
        assert_eq!(parsed.sample_rate, 24000);
        assert_eq!(parsed.channels, 1);
        assert_eq!(parsed.data, pcm);
    }

    #[test]
    fn finds_data_chunk_past_nonstandard_offset() {
        let pcm: Vec<u8> = vec![9, 0, 9, 0];
        // A big leading LIST chunk pushes `data` well past byte 44.
        let filler = vec![0u8; 34];
        let wav = build_wav(16000, 1, 16, &pcm, Some((b"LIST", &filler)));
        assert!(wav.len() > 78);
        let parsed = parse_wav(&wav).unwrap();
        assert_eq!(parsed.data, pcm);
    }

    #[test]
    fn downmixes_stereo_to_mono_by_averaging() {
        // L=100, R=200 -> avg 150 per frame.
        let mut pcm = Vec::new();
        pcm.extend_from_slice(&100i16.to_le_bytes());
        pcm.extend_from_slice(&200i16.to_le_bytes());
        let wav = build_wav(22050, 2, 16, &pcm, None);
        let parsed = parse_wav(&wav).unwrap();
        assert_eq!(parsed.channels, 1);
        let sample = i16::from_le_bytes([parsed.data[0], parsed.data[1]]);
        assert_eq!(sample, 150);
    }

    #[test]
    fn rejects_non_16_bit_depth() {
        let wav = build_wav(16000, 1, 8, &[0, 1, 2, 3], None);
        let err = parse_wav(&wav).unwrap_err();
        assert!(matches!(err, CallError::TtsFailed(_)));
    }

    #[test]
    fn rejects_non_riff_buffer() {
        let err = parse_wav(b"not a wav file at all").unwrap_err();
        assert!(matches!(err, CallError::TtsFailed(_)));
    }
}
