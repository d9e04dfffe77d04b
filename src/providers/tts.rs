//! TTS provider (component C3): text -> PCM, one-shot or streamed.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures_util::StreamExt;
use serde::Serialize;

use crate::error::CallError;
use crate::wav::parse_wav;

#[derive(Debug, Clone)]
pub struct TtsAudio {
    pub pcm: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u8,
}

#[async_trait]
pub trait TtsProvider: Send + Sync {
    /// Synthesize the full utterance in one call.
    async fn synthesize(&self, text: &str) -> Result<TtsAudio, CallError>;

    /// Synthesize as a sequence of raw-byte chunks, restartable per call
    /// (not per chunk) and intended to reduce first-audio latency. Most
    /// OpenAI-compatible endpoints don't truly stream synthesis, so this is
    /// commonly the one-shot response sliced as it arrives over the wire.
    async fn synthesize_stream(&self, text: &str) -> Result<BoxStream<'static, Result<bytes::Bytes, CallError>>, CallError>;

    fn name(&self) -> &str;
    fn default_sample_rate(&self) -> u32;
    fn voice(&self) -> &str;
}

/// An OpenAI-compatible `/audio/speech` client. Covers both genuine OpenAI
/// TTS and drop-in-compatible hosts (e.g. lemonfox.ai), distinguished only
/// by the response format they're asked to return.
pub struct OpenAiCompatibleTts {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    voice: String,
    model: String,
    sample_rate_hint: u32,
    response_format: ResponseFormat,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ResponseFormat {
    Wav,
    Pcm,
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    voice: &'a str,
    input: &'a str,
    response_format: &'static str,
}

impl OpenAiCompatibleTts {
    pub fn new(
        api_key: String,
        base_url: Option<String>,
        voice: String,
        model: String,
        sample_rate_hint: Option<u32>,
    ) -> Self {
        let base_url = base_url.unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        // URL substring selects the provider flavor: lemonfox.ai only
        // returns well-formed audio for an explicit "wav" response format.
        let response_format = if base_url.contains("lemonfox") {
            ResponseFormat::Wav
        } else {
            ResponseFormat::Pcm
        };
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url,
            voice,
            model,
            sample_rate_hint: sample_rate_hint.unwrap_or(24_000),
            response_format,
        }
    }

    fn request_body(&self, text: &str) -> SpeechRequest<'_> {
        SpeechRequest {
            model: &self.model,
            voice: &self.voice,
            input: text,
            response_format: match self.response_format {
                ResponseFormat::Wav => "wav",
                ResponseFormat::Pcm => "pcm",
            },
        }
    }

    fn parse_response(&self, bytes: &[u8]) -> Result<TtsAudio, CallError> {
        if bytes.is_empty() {
            return Ok(TtsAudio { pcm: Vec::new(), sample_rate: self.sample_rate_hint, channels: 1 });
        }
        if bytes.len() >= 4 && &bytes[0..4] == b"RIFF" {
            let wav = parse_wav(bytes)?;
            let pcm = bytes_to_i16_le(&wav.data);
            return Ok(TtsAudio { pcm, sample_rate: wav.sample_rate, channels: 1 });
        }
        // Raw PCM: trust the advertised/hinted rate.
        Ok(TtsAudio {
            pcm: bytes_to_i16_le(bytes),
            sample_rate: self.sample_rate_hint,
            channels: 1,
        })
    }
}

fn bytes_to_i16_le(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

#[async_trait]
impl TtsProvider for OpenAiCompatibleTts {
    async fn synthesize(&self, text: &str) -> Result<TtsAudio, CallError> {
        let url = format!("{}/audio/speech", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(text))
            .send()
            .await
            .map_err(|e| CallError::TtsFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CallError::TtsFailed(format!("upstream status {}", response.status())));
        }

        let bytes = response.bytes().await.map_err(|e| CallError::TtsFailed(e.to_string()))?;
        self.parse_response(&bytes)
    }

    async fn synthesize_stream(&self, text: &str) -> Result<BoxStream<'static, Result<bytes::Bytes, CallError>>, CallError> {
        let url = format!("{}/audio/speech", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(text))
            .send()
            .await
            .map_err(|e| CallError::TtsFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CallError::TtsFailed(format!("upstream status {}", response.status())));
        }

        let stream = response.bytes_stream().map(|chunk| chunk.map_err(|e| CallError::TtsFailed(e.to_string())));
        Ok(Box::pin(stream))
    }

    fn name(&self) -> &str {
        "openai-compatible"
    }

    fn default_sample_rate(&self) -> u32 {
        self.sample_rate_hint
    }

    fn voice(&self) -> &str {
        &self.voice
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_raw_pcm_response_trusting_hint() {
        let tts = OpenAiCompatibleTts::new("key".into(), None, "alloy".into(), "tts-1".into(), Some(24000));
        let raw: Vec<u8> = vec![1, 0, 2, 0, 3, 0];
        let audio = tts.parse_response(&raw).unwrap();
        assert_eq!(audio.sample_rate, 24000);
        assert_eq!(audio.pcm, vec![1, 2, 3]);
    }

    #[test]
    fn parses_wav_response_using_header_rate() {
        let tts = OpenAiCompatibleTts::new("key".into(), Some("https://lemonfox.ai/v1".into()), "alloy".into(), "tts-1".into(), None);
        let mut wav = Vec::new();
        wav.extend_from_slice(b"RIFF");
        wav.extend_from_slice(&36u32.to_le_bytes());
        wav.extend_from_slice(b"WAVE");
        wav.extend_from_slice(b"fmt ");
        wav.extend_from_slice(&16u32.to_le_bytes());
        wav.extend_from_slice(&1u16.to_le_bytes());
        wav.extend_from_slice(&1u16.to_le_bytes());
        wav.extend_from_slice(&16000u32.to_le_bytes());
        wav.extend_from_slice(&32000u32.to_le_bytes());
        wav.extend_from_slice(&2u16.to_le_bytes());
        wav.extend_from_slice(&16u16.to_le_bytes());
        wav.extend_from_slice(b"data");
        wav.extend_from_slice(&4u32.to_le_bytes());
        wav.extend_from_slice(&[5, 0, 6, 0]);

        let audio = tts.parse_response(&wav).unwrap();
        assert_eq!(audio.sample_rate, 16000);
        assert_eq!(audio.pcm, vec![5, 6]);
    }

    #[test]
    fn empty_response_yields_empty_audio() {
        let tts = OpenAiCompatibleTts::new("key".into(), None, "alloy".into(), "tts-1".into(), Some(24000));
        let audio = tts.parse_response(&[]).unwrap();
        assert!(audio.pcm.is_empty());
    }

    #[test]
    fn lemonfox_base_url_selects_wav_format() {
        let tts = OpenAiCompatibleTts::new("key".into(), Some("https://api.lemonfox.ai/v1".into()), "alloy".into(), "tts-1".into(), None);
        assert_eq!(tts.response_format, ResponseFormat::Wav);
    }
}
