//! Integration coverage for the WAV header scanner against the boundary
//! case called out in the spec: a `data` chunk that doesn't begin at the
//! standard 44-byte offset.

use callbridge::wav::parse_wav;

fn build_wav_with_leading_chunk(sample_rate: u32, pcm: &[u8], filler_len: usize) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(b"WAVE");
    body.extend_from_slice(b"fmt ");
    body.extend_from_slice(&16u32.to_le_bytes());
    body.extend_from_slice(&1u16.to_le_bytes());
    body.extend_from_slice(&1u16.to_le_bytes());
    body.extend_from_slice(&sample_rate.to_le_bytes());
    body.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    body.extend_from_slice(&2u16.to_le_bytes());
    body.extend_from_slice(&16u16.to_le_bytes());

    let filler = vec![0u8; filler_len];
    body.extend_from_slice(b"LIST");
    body.extend_from_slice(&(filler.len() as u32).to_le_bytes());
    body.extend_from_slice(&filler);
    if filler.len() % 2 == 1 {
        body.push(0);
    }

    body.extend_from_slice(b"data");
    body.extend_from_slice(&(pcm.len() as u32).to_le_bytes());
    body.extend_from_slice(pcm);

    let mut out = Vec::new();
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    out
}

#[test]
fn data_chunk_at_offset_78_is_found() {
    // 12-byte RIFF header + 24-byte fmt chunk header+body + 8-byte LIST
    // header + a 34-byte filler lands `data`'s FourCC right at byte 78.
    let pcm: Vec<u8> = vec![7, 0, 7, 0];
    let wav = build_wav_with_leading_chunk(8000, &pcm, 34);
    assert_eq!(wav.len() - pcm.len() - 8, 78);

    let parsed = parse_wav(&wav).unwrap();
    assert_eq!(parsed.sample_rate, 8000);
    assert_eq!(parsed.data, pcm);
}

#[test]
fn odd_length_leading_chunk_is_word_aligned() {
    let pcm: Vec<u8> = vec![3, 0];
    let wav = build_wav_with_leading_chunk(16000, &pcm, 5);
    let parsed = parse_wav(&wav).unwrap();
    assert_eq!(parsed.data, pcm);
}

#[test]
fn truncated_data_chunk_clamps_to_available_bytes() {
    let pcm: Vec<u8> = vec![1, 0, 2, 0];
    let mut wav = build_wav_with_leading_chunk(8000, &pcm, 0);
    wav.truncate(wav.len() - 2);
    let parsed = parse_wav(&wav).unwrap();
    assert_eq!(parsed.data.len(), pcm.len() - 2);
}
