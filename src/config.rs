use std::env;
use std::str::FromStr;

use serde::Deserialize;
use url::Url;

use crate::error::CallError;

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PhoneProviderKind {
    Telnyx,
    Twilio,
}

impl FromStr for PhoneProviderKind {
    type Err = CallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "telnyx" => Ok(Self::Telnyx),
            "twilio" => Ok(Self::Twilio),
            _ => Err(CallError::ConfigInvalid("PHONE_PROVIDER")),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SttProviderKind {
    OpenAi,
    Deepgram,
}

impl FromStr for SttProviderKind {
    type Err = CallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "deepgram" => Ok(Self::Deepgram),
            _ => Err(CallError::ConfigInvalid("STT_PROVIDER")),
        }
    }
}

/// Startup configuration, resolved entirely from the process environment.
///
/// Mirrors the teacher's `BaseConfig`/`InnerConfig` split (a file-backed
/// shape resolved against environment secrets) but, since this crate keeps
/// no config file of its own, collapses both stages into one read of `env`.
#[derive(Clone, Debug)]
pub struct Config {
    pub phone_provider: PhoneProviderKind,
    pub phone_account_sid: String,
    pub phone_auth_token: String,
    pub phone_number: String,
    pub user_phone_number: String,
    pub telnyx_public_key: Option<String>,
    pub public_url: Url,
    pub port: u16,
    pub tts_api_key: String,
    pub tts_base_url: Option<String>,
    pub tts_voice: String,
    pub tts_model: String,
    pub tts_sample_rate: Option<u32>,
    pub stt_provider: SttProviderKind,
    pub stt_api_key: String,
    pub stt_model: Option<String>,
    pub stt_silence_duration_ms: u64,
    pub transcript_timeout_ms: u64,
}

fn required(name: &'static str) -> Result<String, CallError> {
    env::var(name).map_err(|_| CallError::ConfigInvalid(name))
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self, CallError> {
        let phone_provider = required("PHONE_PROVIDER")?.parse::<PhoneProviderKind>()?;

        let stt_api_key = required("STT_API_KEY")?;
        // Auto-selected from STT_API_KEY presence unless explicitly pinned,
        // per the configuration table: the provider itself never guesses
        // which key belongs to which vendor, the operator must say so.
        let stt_provider = match optional("STT_PROVIDER") {
            Some(v) => v.parse::<SttProviderKind>()?,
            None => SttProviderKind::Deepgram,
        };

        let public_url = required("PUBLIC_URL")?;
        let public_url = Url::parse(&public_url).map_err(|_| CallError::ConfigInvalid("PUBLIC_URL"))?;

        let port = optional("PORT")
            .map(|v| v.parse::<u16>().map_err(|_| CallError::ConfigInvalid("PORT")))
            .transpose()?
            .unwrap_or(3333);

        let tts_sample_rate = optional("TTS_SAMPLE_RATE")
            .map(|v| v.parse::<u32>().map_err(|_| CallError::ConfigInvalid("TTS_SAMPLE_RATE")))
            .transpose()?;

        let stt_silence_duration_ms = optional("STT_SILENCE_DURATION_MS")
            .map(|v| v.parse::<u64>().map_err(|_| CallError::ConfigInvalid("STT_SILENCE_DURATION_MS")))
            .transpose()?
            .unwrap_or(800);

        let transcript_timeout_ms = optional("TRANSCRIPT_TIMEOUT_MS")
            .map(|v| v.parse::<u64>().map_err(|_| CallError::ConfigInvalid("TRANSCRIPT_TIMEOUT_MS")))
            .transpose()?
            .unwrap_or(180_000);

        Ok(Self {
            phone_provider,
            phone_account_sid: required("PHONE_ACCOUNT_SID")?,
            phone_auth_token: required("PHONE_AUTH_TOKEN")?,
            phone_number: required("PHONE_NUMBER")?,
            user_phone_number: required("USER_PHONE_NUMBER")?,
            telnyx_public_key: optional("TELNYX_PUBLIC_KEY"),
            public_url,
            port,
            tts_api_key: required("TTS_API_KEY")?,
            tts_base_url: optional("TTS_BASE_URL"),
            tts_voice: optional("TTS_VOICE").unwrap_or_else(|| "alloy".to_string()),
            tts_model: optional("TTS_MODEL").unwrap_or_else(|| "tts-1".to_string()),
            tts_sample_rate,
            stt_provider,
            stt_api_key,
            stt_model: optional("STT_MODEL"),
            stt_silence_duration_ms,
            transcript_timeout_ms,
        })
    }

    pub fn media_ws_url(&self) -> String {
        let mut url = self.public_url.clone();
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme).ok();
        url.set_path("/media-stream");
        url.to_string()
    }

    pub fn status_callback_url(&self) -> String {
        let mut url = self.public_url.clone();
        url.set_path("/status");
        url.to_string()
    }
}
