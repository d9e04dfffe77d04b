//! Telephony provider (component C5): place/hangup a call, verify inbound
//! webhook signatures, and render the carrier's call-instruction document.
//!
//! Twilio and Telnyx differ in credential naming and signature scheme but
//! share one contract (`TelephonyProvider`), so `webhook.rs`/`call.rs` never
//! branch on provider identity.

use async_trait::async_trait;
use base64::Engine;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::error::CallError;

#[derive(Debug, Clone)]
pub struct PlaceCallArgs<'a> {
    pub from: &'a str,
    pub to: &'a str,
    pub media_ws_url: &'a str,
    pub status_callback_url: &'a str,
}

#[async_trait]
pub trait TelephonyProvider: Send + Sync {
    async fn place_call(&self, args: PlaceCallArgs<'_>) -> Result<String, CallError>;

    async fn hangup(&self, carrier_call_ref: &str) -> Result<(), CallError>;

    /// Verifies the webhook signature over the raw body. Returns `false`
    /// (never an error) for a missing or invalid signature so callers treat
    /// it as "reject the request", not "the server is broken".
    fn verify_webhook(&self, headers: &http::HeaderMap, raw_body: &[u8], request_url: &str) -> bool;

    /// Produces the `(content_type, body)` document the carrier fetches on
    /// pickup, directing it to open a bidirectional stream to `media_ws_url`.
    fn render_call_instruction(&self, media_ws_url: &str) -> (&'static str, String);

    fn name(&self) -> &str;
}

// ---- Twilio ----

pub struct TwilioTelephony {
    client: reqwest::Client,
    account_sid: String,
    auth_token: String,
}

impl TwilioTelephony {
    pub fn new(account_sid: String, auth_token: String) -> Self {
        Self { client: reqwest::Client::new(), account_sid, auth_token }
    }

    /// Twilio's `X-Twilio-Signature`: HMAC-SHA1 over the request URL followed
    /// by each POST parameter name/value pair sorted and concatenated, keyed
    /// by the auth token, base64-encoded.
    fn compute_signature(&self, request_url: &str, raw_body: &[u8]) -> Result<String, CallError> {
        let mut mac = Hmac::<Sha1>::new_from_slice(self.auth_token.as_bytes())
            .map_err(|_| CallError::ConfigInvalid("PHONE_AUTH_TOKEN"))?;
        mac.update(request_url.as_bytes());

        if let Ok(body) = std::str::from_utf8(raw_body) {
            let mut pairs: Vec<(String, String)> = form_urlencoded_pairs(body);
            pairs.sort_by(|a, b| a.0.cmp(&b.0));
            for (key, value) in pairs {
                mac.update(key.as_bytes());
                mac.update(value.as_bytes());
            }
        }

        let result = mac.finalize().into_bytes();
        Ok(base64::engine::general_purpose::STANDARD.encode(result))
    }
}

fn form_urlencoded_pairs(body: &str) -> Vec<(String, String)> {
    url::form_urlencoded::parse(body.as_bytes())
        .into_owned()
        .collect()
}

#[async_trait]
impl TelephonyProvider for TwilioTelephony {
    async fn place_call(&self, args: PlaceCallArgs<'_>) -> Result<String, CallError> {
        let url = format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Calls.json",
            self.account_sid
        );
        let twiml = render_twilio_twiml(args.media_ws_url);
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[
                ("From", args.from),
                ("To", args.to),
                ("Twiml", twiml.as_str()),
                ("StatusCallback", args.status_callback_url),
            ])
            .send()
            .await
            .map_err(|e| CallError::CarrierRejected(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CallError::CarrierRejected(format!("twilio {status}: {body}")));
        }

        let body: serde_json::Value = response.json().await.map_err(|e| CallError::CarrierRejected(e.to_string()))?;
        body.get("sid")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| CallError::CarrierRejected("twilio response missing call sid".to_string()))
    }

    async fn hangup(&self, carrier_call_ref: &str) -> Result<(), CallError> {
        let url = format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Calls/{carrier_call_ref}.json",
            self.account_sid
        );
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[("Status", "completed")])
            .send()
            .await
            .map_err(|e| CallError::CarrierRejected(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CallError::CarrierRejected(format!("twilio hangup status {}", response.status())));
        }
        Ok(())
    }

    fn verify_webhook(&self, headers: &http::HeaderMap, raw_body: &[u8], request_url: &str) -> bool {
        let header = match headers.get("X-Twilio-Signature").and_then(|v| v.to_str().ok()) {
            Some(h) => h,
            None => return false,
        };
        match self.compute_signature(request_url, raw_body) {
            Ok(expected) => expected == header,
            Err(_) => false,
        }
    }

    fn render_call_instruction(&self, media_ws_url: &str) -> (&'static str, String) {
        ("text/xml", render_twilio_twiml(media_ws_url))
    }

    fn name(&self) -> &str {
        "twilio"
    }
}

fn render_twilio_twiml(media_ws_url: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response><Connect><Stream url=\"{media_ws_url}\"/></Connect></Response>"
    )
}

// ---- Telnyx ----

pub struct TelnyxTelephony {
    client: reqwest::Client,
    api_key: String,
    public_key: Option<VerifyingKey>,
}

impl TelnyxTelephony {
    pub fn new(api_key: String, public_key_b64: Option<&str>) -> Result<Self, CallError> {
        let public_key = public_key_b64
            .map(|encoded| {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|_| CallError::ConfigInvalid("TELNYX_PUBLIC_KEY"))?;
                let bytes: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| CallError::ConfigInvalid("TELNYX_PUBLIC_KEY"))?;
                VerifyingKey::from_bytes(&bytes).map_err(|_| CallError::ConfigInvalid("TELNYX_PUBLIC_KEY"))
            })
            .transpose()?;
        Ok(Self { client: reqwest::Client::new(), api_key, public_key })
    }
}

#[async_trait]
impl TelephonyProvider for TelnyxTelephony {
    async fn place_call(&self, args: PlaceCallArgs<'_>) -> Result<String, CallError> {
        let response = self
            .client
            .post("https://api.telnyx.com/v2/calls")
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "connection_id": args.from,
                "to": args.to,
                "from": args.from,
                "webhook_url": args.status_callback_url,
            }))
            .send()
            .await
            .map_err(|e| CallError::CarrierRejected(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CallError::CarrierRejected(format!("telnyx {status}: {body}")));
        }

        let body: serde_json::Value = response.json().await.map_err(|e| CallError::CarrierRejected(e.to_string()))?;
        body.pointer("/data/call_control_id")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| CallError::CarrierRejected("telnyx response missing call_control_id".to_string()))
    }

    async fn hangup(&self, carrier_call_ref: &str) -> Result<(), CallError> {
        let url = format!("https://api.telnyx.com/v2/calls/{carrier_call_ref}/actions/hangup");
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| CallError::CarrierRejected(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CallError::CarrierRejected(format!("telnyx hangup status {}", response.status())));
        }
        Ok(())
    }

    fn verify_webhook(&self, headers: &http::HeaderMap, raw_body: &[u8], _request_url: &str) -> bool {
        let public_key = match &self.public_key {
            Some(key) => key,
            // No key configured: nothing to check against, reject rather
            // than silently accept unsigned webhooks.
            None => return false,
        };
        let signature_header = match headers.get("telnyx-signature-ed25519").and_then(|v| v.to_str().ok()) {
            Some(h) => h,
            None => return false,
        };
        let timestamp = match headers.get("telnyx-timestamp").and_then(|v| v.to_str().ok()) {
            Some(t) => t,
            None => return false,
        };

        let signature_bytes = match base64::engine::general_purpose::STANDARD.decode(signature_header) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        let signature = match Signature::from_slice(&signature_bytes) {
            Ok(sig) => sig,
            Err(_) => return false,
        };

        let mut signed_payload = Vec::with_capacity(timestamp.len() + 1 + raw_body.len());
        signed_payload.extend_from_slice(timestamp.as_bytes());
        signed_payload.push(b'|');
        signed_payload.extend_from_slice(raw_body);

        public_key.verify(&signed_payload, &signature).is_ok()
    }

    fn render_call_instruction(&self, media_ws_url: &str) -> (&'static str, String) {
        let body = serde_json::json!({
            "stream_url": media_ws_url,
            "stream_track": "both_tracks",
            "stream_codec": "PCMU",
        })
        .to_string();
        ("application/json", body)
    }

    fn name(&self) -> &str {
        "telnyx"
    }
}
