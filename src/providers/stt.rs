//! Streaming STT provider (component C4): 8 kHz mu-law in, interim/final
//! transcripts out, with endpointing and a bounded reconnect policy.
//!
//! This is the most invariant-heavy module in the crate: at most one
//! `wait_for_transcript` waiter at a time, silent audio drop during a
//! reconnect gap, exponential backoff capped at 5 attempts, a 10s keepalive.
//! Every mutable field below is commented with who is allowed to write it.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, Notify};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::client::IntoClientRequest, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use crate::config::SttProviderKind;
use crate::error::CallError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const MAX_RECONNECT_ATTEMPTS: u32 = 5;

#[derive(Clone, Debug)]
pub struct SttSessionConfig {
    pub api_key: String,
    pub model: Option<String>,
    pub silence_duration_ms: u64,
}

#[async_trait]
pub trait SttSession: Send + Sync {
    /// Opens the streaming channel; resolves once the upstream confirms the
    /// session, or fails with `SttUnavailable` after the 10s connect timeout.
    async fn connect(&self) -> Result<(), CallError>;

    /// Enqueues 8 kHz mu-law bytes. Never blocks; silently dropped while a
    /// reconnect is in flight.
    fn send_audio(&self, mu_law: Bytes);

    /// Subscribe to interim (supersedable) transcripts.
    fn subscribe_partial(&self) -> broadcast::Receiver<String>;

    /// Resolves with the next finalized utterance, or `TranscriptTimeout`.
    /// At most one outstanding waiter; a second call while one is pending
    /// cancels the first.
    async fn wait_for_transcript(&self, timeout_duration: Duration) -> Result<String, CallError>;

    async fn close(&self);

    fn is_connected(&self) -> bool;
}

pub trait SttProvider: Send + Sync {
    fn create_session(&self, config: SttSessionConfig) -> Arc<dyn SttSession>;
}

#[derive(Debug)]
enum SttEvent {
    Interim(String),
    Final(String),
    SpeechFinal,
    UtteranceEnd,
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

trait SttFlavor: Send + Sync + Clone + 'static {
    fn connect_request(&self, config: &SttSessionConfig) -> Result<tokio_tungstenite::tungstenite::http::Request<()>, CallError>;
    fn encode_audio(&self, mu_law: &[u8]) -> Message;
    fn parse_message(&self, msg: &Message) -> Option<SttEvent>;
    fn keepalive(&self) -> Message;
}

async fn resolve_waiter(state: &SharedState, result: Result<String, CallError>) {
    if let Some(tx) = state.waiter.lock().await.take() {
        tx.send(result).ok();
    }
}

async fn flush_utterance(state: &SharedState) {
    let text = {
        let mut acc = state.accumulator.lock().await;
        std::mem::take(&mut *acc)
    };
    if !text.is_empty() {
        resolve_waiter(state, Ok(text)).await;
    }
}

/// Single-writer fields are annotated inline: the supervisor task owns
/// `connected`/`audio_tx`; the receive loop owns `accumulator`; any caller
/// may install a waiter, but only the receive loop (or supervisor, on
/// exhausted reconnect) resolves it.
struct SharedState {
    connected: AtomicBool,
    closed: AtomicBool,
    reconnect_attempts: AtomicU32,
    audio_tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    waiter: Mutex<Option<oneshot::Sender<Result<String, CallError>>>>,
    accumulator: Mutex<String>,
    partial_tx: broadcast::Sender<String>,
    speech_notify: Notify,
    first_connect: Mutex<Option<oneshot::Sender<Result<(), CallError>>>>,
}

pub struct WsSttSession<F: SttFlavor> {
    flavor: F,
    config: SttSessionConfig,
    state: Arc<SharedState>,
}

impl<F: SttFlavor> WsSttSession<F> {
    fn new(flavor: F, config: SttSessionConfig) -> Self {
        let (partial_tx, _) = broadcast::channel(64);
        Self {
            flavor,
            config,
            state: Arc::new(SharedState {
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                reconnect_attempts: AtomicU32::new(0),
                audio_tx: Mutex::new(None),
                waiter: Mutex::new(None),
                accumulator: Mutex::new(String::new()),
                partial_tx,
                speech_notify: Notify::new(),
                first_connect: Mutex::new(None),
            }),
        }
    }

    fn spawn_supervisor(flavor: F, config: SttSessionConfig, state: Arc<SharedState>) {
        tokio::spawn(async move {
            loop {
                if state.closed.load(Ordering::SeqCst) {
                    return;
                }

                match open_connection(&flavor, &config).await {
                    Ok(ws) => {
                        state.connected.store(true, Ordering::SeqCst);
                        state.reconnect_attempts.store(0, Ordering::SeqCst);
                        if let Some(tx) = state.first_connect.lock().await.take() {
                            tx.send(Ok(())).ok();
                        }

                        run_connection(&flavor, &config, ws, &state).await;
                        state.connected.store(false, Ordering::SeqCst);

                        if state.closed.load(Ordering::SeqCst) {
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("STT connect failed: {e}");
                    }
                }

                let attempt = state.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt > MAX_RECONNECT_ATTEMPTS {
                    tracing::error!("STT reconnect attempts exhausted");
                    if let Some(tx) = state.first_connect.lock().await.take() {
                        tx.send(Err(CallError::SttUnavailable("reconnect attempts exhausted".into()))).ok();
                    }
                    resolve_waiter(&state, Err(CallError::SttUnavailable("reconnect attempts exhausted".into()))).await;
                    return;
                }

                let backoff = BACKOFF_BASE * 2u32.pow(attempt - 1);
                tracing::info!("STT reconnecting in {:?} (attempt {attempt})", backoff);
                tokio::time::sleep(backoff).await;
            }
        });
    }
}

async fn open_connection<F: SttFlavor>(flavor: &F, config: &SttSessionConfig) -> Result<WsStream, CallError> {
    let request = flavor.connect_request(config)?;
    let (ws, _response) = connect_async(request)
        .await
        .map_err(|e| CallError::SttUnavailable(e.to_string()))?;
    Ok(ws)
}

async fn run_connection<F: SttFlavor>(flavor: &F, config: &SttSessionConfig, ws: WsStream, state: &Arc<SharedState>) {
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    *state.audio_tx.lock().await = Some(tx);

    let silence = Duration::from_millis(config.silence_duration_ms.max(1));
    let endpoint_state = state.clone();
    let endpoint_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = endpoint_state.speech_notify.notified() => {}
                _ = tokio::time::sleep(silence) => {
                    flush_utterance(&endpoint_state).await;
                }
            }
        }
    });

    let writer_task = async {
        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.tick().await; // first tick fires immediately
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(m) => {
                            if sink.send(m).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = keepalive.tick() => {
                    if sink.send(flavor.keepalive()).await.is_err() {
                        break;
                    }
                }
            }
        }
    };

    let reader_task = async {
        while let Some(Ok(msg)) = stream.next().await {
            if msg.is_close() {
                break;
            }
            match flavor.parse_message(&msg) {
                Some(SttEvent::Interim(text)) => {
                    if !text.is_empty() {
                        state.speech_notify.notify_one();
                    }
                    state.partial_tx.send(text).ok();
                }
                Some(SttEvent::Final(text)) => {
                    if !text.is_empty() {
                        state.speech_notify.notify_one();
                        let mut acc = state.accumulator.lock().await;
                        if !acc.is_empty() {
                            acc.push(' ');
                        }
                        acc.push_str(&text);
                    }
                }
                Some(SttEvent::SpeechFinal) | Some(SttEvent::UtteranceEnd) => {
                    flush_utterance(state).await;
                }
                None => {}
            }
        }
    };

    tokio::select! {
        _ = writer_task => {}
        _ = reader_task => {}
    }
    endpoint_task.abort();
    *state.audio_tx.lock().await = None;
}

#[async_trait]
impl<F: SttFlavor> SttSession for WsSttSession<F> {
    async fn connect(&self) -> Result<(), CallError> {
        let (tx, rx) = oneshot::channel();
        *self.state.first_connect.lock().await = Some(tx);

        WsSttSession::<F>::spawn_supervisor(self.flavor.clone(), self.config.clone(), self.state.clone());

        match timeout(CONNECT_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CallError::SttUnavailable("connect task dropped".into())),
            Err(_) => Err(CallError::SttUnavailable("connect timed out after 10s".into())),
        }
    }

    fn send_audio(&self, mu_law: Bytes) {
        let message = self.flavor.encode_audio(&mu_law);
        let state = self.state.clone();
        tokio::spawn(async move {
            if let Some(tx) = state.audio_tx.lock().await.as_ref() {
                tx.send(message).ok();
            }
            // No queuing across a reconnect gap: audio received while
            // `audio_tx` is `None` is dropped, per the provider contract.
        });
    }

    fn subscribe_partial(&self) -> broadcast::Receiver<String> {
        self.state.partial_tx.subscribe()
    }

    async fn wait_for_transcript(&self, timeout_duration: Duration) -> Result<String, CallError> {
        let (tx, rx) = oneshot::channel();
        if let Some(old) = self.state.waiter.lock().await.replace(tx) {
            old.send(Err(CallError::Cancelled)).ok();
        }

        match timeout(timeout_duration, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CallError::Cancelled),
            Err(_) => {
                self.state.waiter.lock().await.take();
                Err(CallError::TranscriptTimeout)
            }
        }
    }

    async fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
        *self.state.audio_tx.lock().await = None;
        resolve_waiter(&self.state, Err(CallError::Cancelled)).await;
    }

    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }
}

// ---- Deepgram ----

#[derive(Clone)]
pub struct DeepgramFlavor;

impl SttFlavor for DeepgramFlavor {
    fn connect_request(&self, config: &SttSessionConfig) -> Result<tokio_tungstenite::tungstenite::http::Request<()>, CallError> {
        let model = config.model.as_deref().unwrap_or("nova-2");
        let url = format!(
            "wss://api.deepgram.com/v1/listen?encoding=mulaw&sample_rate=8000&channels=1&model={model}&interim_results=true&endpointing={}&utterance_end_ms=1000",
            config.silence_duration_ms
        );
        let mut request = url
            .into_client_request()
            .map_err(|e| CallError::SttUnavailable(e.to_string()))?;
        let auth = format!("Token {}", config.api_key);
        request.headers_mut().insert(
            "Authorization",
            auth.parse().map_err(|_| CallError::ConfigInvalid("STT_API_KEY"))?,
        );
        Ok(request)
    }

    fn encode_audio(&self, mu_law: &[u8]) -> Message {
        Message::Binary(mu_law.to_vec())
    }

    fn parse_message(&self, msg: &Message) -> Option<SttEvent> {
        let text = msg.to_text().ok()?;
        let json: Value = serde_json::from_str(text).ok()?;
        match json.get("type").and_then(Value::as_str) {
            Some("UtteranceEnd") => Some(SttEvent::UtteranceEnd),
            Some("Results") => {
                let transcript = json
                    .pointer("/channel/alternatives/0/transcript")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let is_final = json.get("is_final").and_then(Value::as_bool).unwrap_or(false);
                let speech_final = json.get("speech_final").and_then(Value::as_bool).unwrap_or(false);
                if speech_final {
                    Some(SttEvent::SpeechFinal)
                } else if is_final {
                    Some(SttEvent::Final(transcript))
                } else {
                    Some(SttEvent::Interim(transcript))
                }
            }
            _ => None,
        }
    }

    fn keepalive(&self) -> Message {
        Message::Text(r#"{"type":"KeepAlive"}"#.to_string())
    }
}

// ---- OpenAI realtime transcription ----

#[derive(Clone)]
pub struct OpenAiSttFlavor;

impl SttFlavor for OpenAiSttFlavor {
    fn connect_request(&self, config: &SttSessionConfig) -> Result<tokio_tungstenite::tungstenite::http::Request<()>, CallError> {
        let model = config.model.as_deref().unwrap_or("whisper-1");
        let url = format!("wss://api.openai.com/v1/realtime?intent=transcription&model={model}");
        let mut request = url
            .into_client_request()
            .map_err(|e| CallError::SttUnavailable(e.to_string()))?;
        let auth = format!("Bearer {}", config.api_key);
        request.headers_mut().insert(
            "Authorization",
            auth.parse().map_err(|_| CallError::ConfigInvalid("STT_API_KEY"))?,
        );
        request
            .headers_mut()
            .insert("OpenAI-Beta", "realtime=v1".parse().unwrap());
        Ok(request)
    }

    fn encode_audio(&self, mu_law: &[u8]) -> Message {
        let payload = serde_json::json!({
            "type": "input_audio_buffer.append",
            "audio": base64::engine::general_purpose::STANDARD.encode(mu_law),
        });
        Message::Text(payload.to_string())
    }

    fn parse_message(&self, msg: &Message) -> Option<SttEvent> {
        let text = msg.to_text().ok()?;
        let json: Value = serde_json::from_str(text).ok()?;
        match json.get("type").and_then(Value::as_str) {
            Some("conversation.item.input_audio_transcription.delta") => {
                let delta = json.get("delta").and_then(Value::as_str).unwrap_or("").to_string();
                Some(SttEvent::Interim(delta))
            }
            Some("conversation.item.input_audio_transcription.completed") => {
                let transcript = json.get("transcript").and_then(Value::as_str).unwrap_or("").to_string();
                Some(SttEvent::Final(transcript))
            }
            Some("input_audio_buffer.speech_stopped") => Some(SttEvent::SpeechFinal),
            _ => None,
        }
    }

    fn keepalive(&self) -> Message {
        Message::Ping(Vec::new())
    }
}

pub struct DeepgramSttProvider;
impl SttProvider for DeepgramSttProvider {
    fn create_session(&self, config: SttSessionConfig) -> Arc<dyn SttSession> {
        Arc::new(WsSttSession::new(DeepgramFlavor, config))
    }
}

pub struct OpenAiSttProvider;
impl SttProvider for OpenAiSttProvider {
    fn create_session(&self, config: SttSessionConfig) -> Arc<dyn SttSession> {
        Arc::new(WsSttSession::new(OpenAiSttFlavor, config))
    }
}

/// Selects a concrete provider from the auto-detected (or explicit) kind.
pub fn provider_for(kind: SttProviderKind) -> Arc<dyn SttProvider> {
    match kind {
        SttProviderKind::Deepgram => Arc::new(DeepgramSttProvider),
        SttProviderKind::OpenAi => Arc::new(OpenAiSttProvider),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deepgram_parses_interim_and_final() {
        let flavor = DeepgramFlavor;
        let interim = Message::Text(
            r#"{"type":"Results","is_final":false,"speech_final":false,"channel":{"alternatives":[{"transcript":"ok"}]}}"#.to_string(),
        );
        match flavor.parse_message(&interim) {
            Some(SttEvent::Interim(text)) => assert_eq!(text, "ok"),
            other => panic!("unexpected: {other:?}"),
        }

        let finalized = Message::Text(
            r#"{"type":"Results","is_final":true,"speech_final":true,"channel":{"alternatives":[{"transcript":"okay"}]}}"#.to_string(),
        );
        match flavor.parse_message(&finalized) {
            Some(SttEvent::SpeechFinal) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn deepgram_utterance_end_recognized() {
        let flavor = DeepgramFlavor;
        let msg = Message::Text(r#"{"type":"UtteranceEnd"}"#.to_string());
        assert!(matches!(flavor.parse_message(&msg), Some(SttEvent::UtteranceEnd)));
    }

    #[tokio::test]
    async fn wait_for_transcript_times_out_with_no_finals() {
        let session = WsSttSession::new(DeepgramFlavor, SttSessionConfig {
            api_key: "k".into(),
            model: None,
            silence_duration_ms: 800,
        });
        let result = session.wait_for_transcript(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(CallError::TranscriptTimeout)));
    }

    #[tokio::test]
    async fn second_waiter_cancels_first() {
        let session = WsSttSession::new(DeepgramFlavor, SttSessionConfig {
            api_key: "k".into(),
            model: None,
            silence_duration_ms: 800,
        });
        let first = tokio::spawn({
            let state = session.state.clone();
            async move {
                let (tx, rx) = oneshot::channel();
                state.waiter.lock().await.replace(tx);
                rx.await
            }
        });
        tokio::task::yield_now().await;
        let _ = session.wait_for_transcript(Duration::from_millis(50)).await;
        let first_result = first.await.unwrap();
        assert!(matches!(first_result, Ok(Err(CallError::Cancelled))));
    }
}
