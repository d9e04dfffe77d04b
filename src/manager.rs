//! Call Manager (component C8): the process-wide registry keyed by `callId`.
//!
//! Mirrors the teacher's `VoiceResponseCollection` shape (a mutex-guarded
//! map handed out by capability, not a singleton) generalized from a
//! one-shot response table to the full call registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::call::{CallSession, CallState};
use crate::config::Config;
use crate::error::CallError;
use crate::providers::stt::SttSessionConfig;
use crate::providers::telephony::PlaceCallArgs;
use crate::providers::ProviderRegistry;

/// Media WS must connect within 30s of the carrier answering the call.
const MEDIA_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

type Registry = Arc<Mutex<HashMap<Uuid, Arc<CallSession>>>>;
type CarrierRefIndex = Arc<Mutex<HashMap<String, Uuid>>>;

pub struct CallManager {
    registry: Registry,
    by_carrier_ref: CarrierRefIndex,
    providers: ProviderRegistry,
    config: Arc<Config>,
}

impl CallManager {
    pub fn new(providers: ProviderRegistry, config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            registry: Arc::new(Mutex::new(HashMap::new())),
            by_carrier_ref: Arc::new(Mutex::new(HashMap::new())),
            providers,
            config,
        })
    }

    fn stt_session_config(&self) -> SttSessionConfig {
        SttSessionConfig {
            api_key: self.config.stt_api_key.clone(),
            model: self.config.stt_model.clone(),
            silence_duration_ms: self.config.stt_silence_duration_ms,
        }
    }

    fn transcript_timeout(&self) -> Duration {
        Duration::from_millis(self.config.transcript_timeout_ms)
    }

    /// `initiate(message) -> {callId, response}`. Creates the call, places
    /// the outbound leg, awaits `READY`, and executes the initial turn —
    /// the first response is inseparable from initiation.
    pub async fn initiate(&self, message: &str) -> Result<(Uuid, String), CallError> {
        let stt = self.providers.stt.create_session(self.stt_session_config());
        let session = CallSession::new(stt, self.providers.tts.clone(), self.providers.phone.clone());
        let call_id = session.id;
        self.registry.lock().await.insert(call_id, session.clone());
        self.spawn_forget_watcher(&session);

        let media_ws_url = self.config.media_ws_url();
        let status_callback_url = self.config.status_callback_url();
        let place_result = self
            .providers
            .phone
            .place_call(PlaceCallArgs {
                from: &self.config.phone_number,
                to: &self.config.user_phone_number,
                media_ws_url: &media_ws_url,
                status_callback_url: &status_callback_url,
            })
            .await;

        let carrier_ref = match place_result {
            Ok(carrier_ref) => carrier_ref,
            Err(e) => {
                self.registry.lock().await.remove(&call_id);
                return Err(e);
            }
        };

        session.set_carrier_call_ref(carrier_ref.clone()).await;
        session.mark_ringing().await;
        self.by_carrier_ref.lock().await.insert(carrier_ref, call_id);

        if let Err(e) = session.wait_until_ready(MEDIA_CONNECT_TIMEOUT).await {
            self.forget(call_id).await;
            return Err(e);
        }

        match session.speak(message, true, self.transcript_timeout()).await {
            Ok(response) => Ok((call_id, response.unwrap_or_default())),
            Err(e) => Err(e),
        }
    }

    /// `continue(callId, message) -> response`. Requires `READY`.
    pub async fn continue_call(&self, call_id: Uuid, message: &str) -> Result<String, CallError> {
        let session = self.get(call_id).await?;
        self.require_ready(&session).await?;
        let response = session.speak(message, true, self.transcript_timeout()).await?;
        Ok(response.unwrap_or_default())
    }

    /// `speakOnly(callId, message)`. Requires `READY`.
    pub async fn speak_only(&self, call_id: Uuid, message: &str) -> Result<(), CallError> {
        let session = self.get(call_id).await?;
        self.require_ready(&session).await?;
        session.speak(message, false, self.transcript_timeout()).await?;
        Ok(())
    }

    /// `end(callId, message) -> {durationSeconds}`.
    pub async fn end(&self, call_id: Uuid, message: Option<&str>) -> Result<Duration, CallError> {
        let session = self.get(call_id).await?;
        let duration = session.end_call(message).await?;
        self.forget(call_id).await;
        Ok(duration)
    }

    /// Looked up by webhook handlers dispatching a carrier status event or
    /// a media-stream upgrade to the call it belongs to.
    pub async fn find_by_carrier_ref(&self, carrier_ref: &str) -> Option<Arc<CallSession>> {
        let call_id = *self.by_carrier_ref.lock().await.get(carrier_ref)?;
        self.registry.lock().await.get(&call_id).cloned()
    }

    pub async fn get_call(&self, call_id: Uuid) -> Result<Arc<CallSession>, CallError> {
        self.get(call_id).await
    }

    async fn get(&self, call_id: Uuid) -> Result<Arc<CallSession>, CallError> {
        self.registry
            .lock()
            .await
            .get(&call_id)
            .cloned()
            .ok_or(CallError::CallNotFound(call_id))
    }

    /// A second operation on a call that isn't `READY` — whether because a
    /// turn is already in flight or the call has ended — fails `CallBusy`
    /// here, before ever touching the call's own turn lock.
    async fn require_ready(&self, session: &Arc<CallSession>) -> Result<(), CallError> {
        match session.state().await {
            CallState::Ready => Ok(()),
            CallState::Ending | CallState::Ended => Err(CallError::CallEnded(session.id)),
            _ => Err(CallError::CallBusy(session.id)),
        }
    }

    async fn forget(&self, call_id: Uuid) {
        forget_in(&self.registry, &self.by_carrier_ref, call_id).await;
    }

    /// Releases `session` from the registry the moment it reaches `Ended`,
    /// however it got there — agent-initiated `end`, carrier hangup, a
    /// media-bind failure, or the hard-ceiling watchdog all route through
    /// `CallSession::force_end`, and this is the one place that reacts to
    /// all of them uniformly. Holding cloned `Arc<Mutex<_>>` handles rather
    /// than `&self` lets the watcher outlive any single call into
    /// `CallManager`.
    fn spawn_forget_watcher(&self, session: &Arc<CallSession>) {
        let call_id = session.id;
        let registry = self.registry.clone();
        let by_carrier_ref = self.by_carrier_ref.clone();
        let mut ended_rx = session.on_ended();
        tokio::spawn(async move {
            if ended_rx.changed().await.is_ok() && *ended_rx.borrow() {
                forget_in(&registry, &by_carrier_ref, call_id).await;
            }
        });
    }
}

async fn forget_in(registry: &Registry, by_carrier_ref: &CarrierRefIndex, call_id: Uuid) {
    if let Some(session) = registry.lock().await.remove(&call_id) {
        if let Some(carrier_ref) = session.carrier_call_ref().await {
            by_carrier_ref.lock().await.remove(&carrier_ref);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::stt::{SttProvider, SttSession};
    use crate::providers::telephony::TelephonyProvider;
    use crate::providers::tts::{TtsAudio, TtsProvider};
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::stream::BoxStream;
    use tokio::sync::broadcast;
    use url::Url;

    struct ImmediateStt;
    #[async_trait]
    impl SttSession for ImmediateStt {
        async fn connect(&self) -> Result<(), CallError> {
            Ok(())
        }
        fn send_audio(&self, _mu_law: Bytes) {}
        fn subscribe_partial(&self) -> broadcast::Receiver<String> {
            broadcast::channel(1).1
        }
        async fn wait_for_transcript(&self, _timeout_duration: Duration) -> Result<String, CallError> {
            Ok("okay".to_string())
        }
        async fn close(&self) {}
        fn is_connected(&self) -> bool {
            true
        }
    }

    struct ImmediateSttProvider;
    impl SttProvider for ImmediateSttProvider {
        fn create_session(&self, _config: SttSessionConfig) -> Arc<dyn SttSession> {
            Arc::new(ImmediateStt)
        }
    }

    struct ImmediateTts;
    #[async_trait]
    impl TtsProvider for ImmediateTts {
        async fn synthesize(&self, _text: &str) -> Result<TtsAudio, CallError> {
            Ok(TtsAudio { pcm: vec![0; 10], sample_rate: 8000, channels: 1 })
        }
        async fn synthesize_stream(&self, _text: &str) -> Result<BoxStream<'static, Result<Bytes, CallError>>, CallError> {
            unimplemented!()
        }
        fn name(&self) -> &str {
            "mock"
        }
        fn default_sample_rate(&self) -> u32 {
            8000
        }
        fn voice(&self) -> &str {
            "mock"
        }
    }

    struct AcceptingTelephony;
    #[async_trait]
    impl TelephonyProvider for AcceptingTelephony {
        async fn place_call(&self, _args: PlaceCallArgs<'_>) -> Result<String, CallError> {
            Ok("CARRIER-REF-1".to_string())
        }
        async fn hangup(&self, _carrier_call_ref: &str) -> Result<(), CallError> {
            Ok(())
        }
        fn verify_webhook(&self, _headers: &http::HeaderMap, _raw_body: &[u8], _request_url: &str) -> bool {
            true
        }
        fn render_call_instruction(&self, _media_ws_url: &str) -> (&'static str, String) {
            ("text/xml", String::new())
        }
        fn name(&self) -> &str {
            "mock"
        }
    }

    struct RejectingTelephony;
    #[async_trait]
    impl TelephonyProvider for RejectingTelephony {
        async fn place_call(&self, _args: PlaceCallArgs<'_>) -> Result<String, CallError> {
            Err(CallError::CarrierRejected("no lines available".to_string()))
        }
        async fn hangup(&self, _carrier_call_ref: &str) -> Result<(), CallError> {
            Ok(())
        }
        fn verify_webhook(&self, _headers: &http::HeaderMap, _raw_body: &[u8], _request_url: &str) -> bool {
            true
        }
        fn render_call_instruction(&self, _media_ws_url: &str) -> (&'static str, String) {
            ("text/xml", String::new())
        }
        fn name(&self) -> &str {
            "mock"
        }
    }

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            phone_provider: crate::config::PhoneProviderKind::Twilio,
            phone_account_sid: "AC1".to_string(),
            phone_auth_token: "token".to_string(),
            phone_number: "+15551234567".to_string(),
            user_phone_number: "+15557654321".to_string(),
            telnyx_public_key: None,
            public_url: Url::parse("https://example.com").unwrap(),
            port: 3333,
            tts_api_key: "key".to_string(),
            tts_base_url: None,
            tts_voice: "alloy".to_string(),
            tts_model: "tts-1".to_string(),
            tts_sample_rate: None,
            stt_provider: crate::config::SttProviderKind::Deepgram,
            stt_api_key: "key".to_string(),
            stt_model: None,
            stt_silence_duration_ms: 800,
            transcript_timeout_ms: 500,
        })
    }

    #[tokio::test]
    async fn initiate_removes_call_when_carrier_rejects() {
        let providers = ProviderRegistry {
            phone: Arc::new(RejectingTelephony),
            tts: Arc::new(ImmediateTts),
            stt: Arc::new(ImmediateSttProvider),
        };
        let manager = CallManager::new(providers, test_config());
        let result = manager.initiate("hello").await;
        assert!(matches!(result, Err(CallError::CarrierRejected(_))));
        assert!(manager.registry.lock().await.is_empty());
    }

    /// Carrier hangup, a media-bind failure, and the hard-ceiling watchdog
    /// all end a call by calling `CallSession::force_end` directly, with no
    /// call into `CallManager::end`/`forget`. The background forget-watcher
    /// spawned by `initiate` must release the call from the registry on its
    /// own in every one of those cases.
    #[tokio::test]
    async fn force_end_without_calling_end_is_still_forgotten() {
        let providers = ProviderRegistry {
            phone: Arc::new(AcceptingTelephony),
            tts: Arc::new(ImmediateTts),
            stt: Arc::new(ImmediateSttProvider),
        };
        let manager = CallManager::new(providers, test_config());

        let stt = manager.providers.stt.create_session(manager.stt_session_config());
        let session = CallSession::new(stt, manager.providers.tts.clone(), manager.providers.phone.clone());
        let call_id = session.id;
        manager.registry.lock().await.insert(call_id, session.clone());
        manager.spawn_forget_watcher(&session);

        session.force_end().await;
        tokio::task::yield_now().await;

        assert!(manager.registry.lock().await.get(&call_id).is_none());
    }

    #[tokio::test]
    async fn continue_call_on_unknown_id_is_not_found() {
        let providers = ProviderRegistry {
            phone: Arc::new(RejectingTelephony),
            tts: Arc::new(ImmediateTts),
            stt: Arc::new(ImmediateSttProvider),
        };
        let manager = CallManager::new(providers, test_config());
        let result = manager.continue_call(Uuid::new_v4(), "hi").await;
        assert!(matches!(result, Err(CallError::CallNotFound(_))));
    }
}
