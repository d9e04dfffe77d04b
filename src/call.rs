//! Call Session (component C7) — the state machine at the heart of the crate.
//!
//! One `CallSession` per active call. Transitions, the turn lock, and the
//! three timeouts (per-call hard ceiling, per-listen transcript, STT
//! connect) are all enforced here; every other component is a capability
//! this session calls into, never a chain of callbacks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::CallError;
use crate::media::MediaSession;
use crate::providers::stt::SttSession;
use crate::providers::telephony::TelephonyProvider;
use crate::providers::tts::TtsProvider;

/// 6 minutes after `placeCall`, force the call to `ENDING` regardless of state.
const HARD_CEILING: Duration = Duration::from_secs(6 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Initiating,
    Ringing,
    Answered,
    Ready,
    Speaking,
    Listening,
    Ending,
    Ended,
}

impl CallState {
    fn is_terminal(self) -> bool {
        matches!(self, CallState::Ending | CallState::Ended)
    }
}

pub struct CallSession {
    pub id: Uuid,
    carrier_call_ref: Mutex<Option<String>>,
    state: Mutex<CallState>,
    /// Serializes `speak`/`continue`/`speakOnly`/`end`: at most one active.
    turn_lock: Mutex<()>,
    /// Set once `endCall` / a fatal error / the hard ceiling fires; every
    /// suspension point inside a turn races against it so cancellation is
    /// immediate rather than waiting for the turn lock to free up.
    ending: CancellationToken,
    media: Mutex<Option<Arc<MediaSession>>>,
    stt: Arc<dyn SttSession>,
    tts: Arc<dyn TtsProvider>,
    phone: Arc<dyn TelephonyProvider>,
    created_at: Instant,
    ended_at: Mutex<Option<Instant>>,
    /// Latched true once `bind_media` completes; `watch` (unlike `Notify`)
    /// keeps the last value around so a late subscriber never misses it.
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
    /// Latched true once `force_end` finishes tearing the call down. Lets
    /// `CallManager` release the call from its registry no matter which of
    /// the several triggers (agent `end`, carrier hangup, media-bind
    /// failure, the hard-ceiling watchdog) drove the transition.
    ended_tx: watch::Sender<bool>,
}

impl CallSession {
    pub fn new(stt: Arc<dyn SttSession>, tts: Arc<dyn TtsProvider>, phone: Arc<dyn TelephonyProvider>) -> Arc<Self> {
        let (ready_tx, ready_rx) = watch::channel(false);
        let (ended_tx, _) = watch::channel(false);
        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            carrier_call_ref: Mutex::new(None),
            state: Mutex::new(CallState::Initiating),
            turn_lock: Mutex::new(()),
            ending: CancellationToken::new(),
            media: Mutex::new(None),
            stt,
            tts,
            phone,
            created_at: Instant::now(),
            ended_at: Mutex::new(None),
            ready_tx,
            ready_rx,
            ended_tx,
        });
        session.clone().spawn_hard_ceiling_watchdog();
        session
    }

    /// Waits for `ANSWERED -> READY` (media bound, `start` received, STT
    /// connected), or fails with `MediaTimeout` after `timeout_duration`.
    pub async fn wait_until_ready(&self, timeout_duration: Duration) -> Result<(), CallError> {
        let mut rx = self.ready_rx.clone();
        if *rx.borrow() {
            return Ok(());
        }
        tokio::select! {
            result = rx.changed() => result.map_err(|_| CallError::MediaTimeout),
            _ = tokio::time::sleep(timeout_duration) => Err(CallError::MediaTimeout),
            _ = self.ending.cancelled() => Err(CallError::CallEnded(self.id)),
        }
    }

    fn spawn_hard_ceiling_watchdog(self: Arc<Self>) {
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(HARD_CEILING) => {
                    if !self.state.lock().await.is_terminal() {
                        tracing::warn!(call_id = %self.id, "hard ceiling reached, forcing end");
                        self.force_end().await;
                    }
                }
                _ = self.ending.cancelled() => {}
            }
        });
    }

    pub async fn state(&self) -> CallState {
        *self.state.lock().await
    }

    /// Subscribes to this call's terminal transition. Fires once, after
    /// `force_end` has fully torn the call down (STT closed, media closed,
    /// carrier hung up) and the state is `Ended` — regardless of which
    /// trigger caused it.
    pub fn on_ended(&self) -> watch::Receiver<bool> {
        self.ended_tx.subscribe()
    }

    pub async fn set_carrier_call_ref(&self, carrier_call_ref: String) {
        *self.carrier_call_ref.lock().await = Some(carrier_call_ref);
    }

    pub async fn carrier_call_ref(&self) -> Option<String> {
        self.carrier_call_ref.lock().await.clone()
    }

    pub fn stt(&self) -> Arc<dyn SttSession> {
        self.stt.clone()
    }

    pub async fn mark_ringing(&self) {
        let mut state = self.state.lock().await;
        if *state == CallState::Initiating {
            *state = CallState::Ringing;
            tracing::info!(call_id = %self.id, "ringing");
        }
    }

    pub async fn mark_answered(&self) {
        let mut state = self.state.lock().await;
        if matches!(*state, CallState::Initiating | CallState::Ringing) {
            *state = CallState::Answered;
            tracing::info!(call_id = %self.id, "answered");
        }
    }

    /// Binds the connected media session and awaits STT `connect()`,
    /// transitioning `ANSWERED -> READY` only once both have happened. STT
    /// connect failure is fatal to the call.
    pub async fn bind_media(&self, media: Arc<MediaSession>) -> Result<(), CallError> {
        *self.media.lock().await = Some(media);
        self.stt.connect().await?;
        let mut state = self.state.lock().await;
        if !state.is_terminal() {
            *state = CallState::Ready;
            drop(state);
            self.ready_tx.send(true).ok();
            tracing::info!(call_id = %self.id, "ready");
        }
        Ok(())
    }

    /// `speak(text, expectReply)`: the turn protocol. Requires `READY`.
    pub async fn speak(&self, text: &str, expect_reply: bool, transcript_timeout: Duration) -> Result<Option<String>, CallError> {
        let _turn_guard = self.turn_lock.lock().await;

        {
            let mut state = self.state.lock().await;
            if *state != CallState::Ready {
                return Err(CallError::CallBusy(self.id));
            }
            *state = CallState::Speaking;
        }

        let media = match self.media.lock().await.clone() {
            Some(media) => media,
            None => {
                self.return_to_ready_unless_ending().await;
                return Err(CallError::MediaTimeout);
            }
        };

        let audio = tokio::select! {
            result = self.tts.synthesize(text) => result,
            _ = self.ending.cancelled() => return Err(CallError::Cancelled),
        };
        let audio = match audio {
            Ok(audio) => audio,
            Err(e) => {
                // TTS failure: abort the turn, remain in READY.
                self.return_to_ready_unless_ending().await;
                return Err(e);
            }
        };

        let played = tokio::select! {
            result = media.speak(&audio.pcm, audio.sample_rate) => result,
            _ = self.ending.cancelled() => return Err(CallError::Cancelled),
        };
        if let Err(e) = played {
            self.return_to_ready_unless_ending().await;
            return Err(e);
        }

        if !expect_reply {
            self.return_to_ready_unless_ending().await;
            return Ok(None);
        }

        {
            let mut state = self.state.lock().await;
            if !state.is_terminal() {
                *state = CallState::Listening;
            }
        }

        // Armed only now that SPEAKING has fully completed: transcripts
        // produced while this call's own voice was playing are never seen
        // by a waiter and are discarded by the STT session itself.
        let result = tokio::select! {
            result = self.stt.wait_for_transcript(transcript_timeout) => result,
            _ = self.ending.cancelled() => Err(CallError::Cancelled),
        };
        self.return_to_ready_unless_ending().await;
        result.map(Some)
    }

    async fn return_to_ready_unless_ending(&self) {
        let mut state = self.state.lock().await;
        if !state.is_terminal() {
            *state = CallState::Ready;
        }
    }

    /// `endCall(finalMessage)`: speaks `finalMessage` best-effort if the
    /// call was in a state where speaking still makes sense, then hangs up.
    pub async fn end_call(&self, final_message: Option<&str>) -> Result<Duration, CallError> {
        let should_speak_final = matches!(self.state().await, CallState::Ready | CallState::Listening);

        if should_speak_final {
            if let Some(message) = final_message {
                // Acquire the turn lock only for the farewell message itself;
                // a concurrent in-flight turn is still cancelled below via
                // the `ending` token regardless of who holds the lock.
                if let Ok(_turn_guard) = self.turn_lock.try_lock() {
                    if let Some(media) = self.media.lock().await.clone() {
                        match self.tts.synthesize(message).await {
                            Ok(audio) => {
                                media.speak(&audio.pcm, audio.sample_rate).await.ok();
                            }
                            Err(e) => {
                                tracing::warn!(call_id = %self.id, "final message synthesis failed: {e}");
                            }
                        }
                    }
                }
            }
        }

        self.force_end().await;

        let ended_at = self.ended_at.lock().await.ok_or(CallError::CallEnded(self.id))?;
        Ok(ended_at.saturating_duration_since(self.created_at))
    }

    /// Carrier `call.hangup` webhook, or any fatal error: cancel in-flight
    /// work and tear down without attempting a farewell message.
    pub async fn force_end(&self) {
        {
            let mut state = self.state.lock().await;
            if *state == CallState::Ended {
                return;
            }
            *state = CallState::Ending;
        }
        self.ending.cancel();
        tracing::info!(call_id = %self.id, "ending");

        self.stt.close().await;
        if let Some(media) = self.media.lock().await.take() {
            media.close().await;
        }
        if let Some(carrier_ref) = self.carrier_call_ref().await {
            if let Err(e) = self.phone.hangup(&carrier_ref).await {
                tracing::warn!(call_id = %self.id, "hangup failed: {e}");
            }
        }

        *self.state.lock().await = CallState::Ended;
        *self.ended_at.lock().await = Some(Instant::now());
        tracing::info!(call_id = %self.id, "ended");
        self.ended_tx.send(true).ok();
    }
}
