//! Media Stream Session (component C6): the carrier-facing WebSocket.
//!
//! Frame protocol is line-delimited JSON with event kinds `start`/`media`/
//! `stop`/`mark`. Inbound `media` frames are decoded and forwarded to the
//! bound STT session; outbound PCM is resampled, mu-law encoded, and paced
//! out in 500ms chunks terminated by a `mark` the caller can wait on.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex};
use warp::filters::ws::{Message, WebSocket};

use crate::codec::{mu_law_encode, resample_linear};
use crate::error::CallError;
use crate::providers::stt::SttSession;

const CHUNK_BYTES: usize = 4000;
const CHUNK_MS: u64 = 500;
const PACING_LEAD_MS: u64 = 50;
const MARK_SAFETY_MARGIN: Duration = Duration::from_secs(2);
const TARGET_SAMPLE_RATE: u32 = 8000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum MediaFrame {
    Start {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: MediaPayload,
    },
    Mark {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        mark: MarkPayload,
    },
    Stop {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaPayload {
    pub payload: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkPayload {
    pub name: String,
}

fn frame_count(total_bytes: usize) -> usize {
    total_bytes.div_ceil(CHUNK_BYTES).max(1)
}

fn mark_safety_timeout(chunk_count: usize) -> Duration {
    Duration::from_millis(CHUNK_MS * chunk_count as u64) + MARK_SAFETY_MARGIN
}

struct SharedState {
    stream_sid: Mutex<Option<String>>,
    outbound_tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    mark_waiter: Mutex<Option<(String, oneshot::Sender<()>)>>,
    closed: AtomicBool,
    mark_seq: AtomicU64,
    /// Which call's STT session receives decoded inbound audio. Unknown
    /// until the caller resolves the `start` frame's stream identifier
    /// against the call registry and calls `bind_stt`.
    stt: Mutex<Option<Arc<dyn SttSession>>>,
}

/// One session per call: a reader task drains inbound frames into STT, a
/// writer task drains outbound frames onto the socket, and `speak` only
/// ever talks to those tasks through channels.
pub struct MediaSession {
    state: Arc<SharedState>,
}

impl MediaSession {
    /// Spawns the reader/writer tasks for an accepted WebSocket upgrade.
    /// The returned receiver resolves with the carrier-assigned stream
    /// identifier once a `start` frame arrives; the caller looks up the
    /// call it belongs to, calls `bind_stt` with that call's STT session,
    /// and enforces the media-connect timeout around the whole thing.
    pub fn new(ws: WebSocket) -> (Arc<Self>, oneshot::Receiver<String>) {
        let (mut sink, mut stream) = ws.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (ready_tx, ready_rx) = oneshot::channel();

        let state = Arc::new(SharedState {
            stream_sid: Mutex::new(None),
            outbound_tx: Mutex::new(Some(outbound_tx)),
            mark_waiter: Mutex::new(None),
            closed: AtomicBool::new(false),
            mark_seq: AtomicU64::new(0),
            stt: Mutex::new(None),
        });

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
        });

        let reader_state = state.clone();
        let mut ready_tx = Some(ready_tx);
        tokio::spawn(async move {
            while let Some(Ok(message)) = stream.next().await {
                if !message.is_text() {
                    continue;
                }
                let text = match message.to_str() {
                    Ok(t) => t,
                    Err(_) => continue,
                };
                let frame: MediaFrame = match serde_json::from_str(text) {
                    Ok(f) => f,
                    Err(_) => continue,
                };

                match frame {
                    MediaFrame::Start { stream_sid } => {
                        *reader_state.stream_sid.lock().await = Some(stream_sid.clone());
                        if let Some(tx) = ready_tx.take() {
                            tx.send(stream_sid).ok();
                        }
                    }
                    MediaFrame::Media { media, .. } => {
                        // No stream_sid recorded yet means no `start` has
                        // arrived: drop, per the inbound-path contract.
                        if reader_state.stream_sid.lock().await.is_some() {
                            if let Some(stt) = reader_state.stt.lock().await.as_ref() {
                                if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(&media.payload) {
                                    stt.send_audio(bytes::Bytes::from(bytes));
                                }
                            }
                        }
                    }
                    MediaFrame::Mark { mark, .. } => {
                        let mut waiter = reader_state.mark_waiter.lock().await;
                        let matches = waiter.as_ref().is_some_and(|(name, _)| *name == mark.name);
                        if matches {
                            if let Some((_, tx)) = waiter.take() {
                                tx.send(()).ok();
                            }
                        }
                    }
                    MediaFrame::Stop { .. } => {
                        reader_state.closed.store(true, Ordering::SeqCst);
                        break;
                    }
                }
            }
            reader_state.closed.store(true, Ordering::SeqCst);
        });

        (Arc::new(Self { state }), ready_rx)
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub async fn bind_stt(&self, stt: Arc<dyn SttSession>) {
        *self.state.stt.lock().await = Some(stt);
    }

    /// Plays `pcm` (at `source_rate`) out over the media stream: resample to
    /// 8 kHz if needed, mu-law encode, chunk into 500ms/4000-byte frames
    /// paced with a 50ms lead, then wait for the trailing mark to echo (or
    /// time out after `chunks * 500ms + 2s` — the carrier may not support
    /// marks at all).
    pub async fn speak(&self, pcm: &[i16], source_rate: u32) -> Result<(), CallError> {
        let stream_sid = self
            .state
            .stream_sid
            .lock()
            .await
            .clone()
            .ok_or(CallError::MediaTimeout)?;

        let resampled = if source_rate == TARGET_SAMPLE_RATE {
            pcm.to_vec()
        } else {
            resample_linear(pcm, source_rate, TARGET_SAMPLE_RATE)
        };
        let encoded = mu_law_encode(&resampled);
        let chunks: Vec<&[u8]> = if encoded.is_empty() { Vec::new() } else { encoded.chunks(CHUNK_BYTES).collect() };

        let lead = Duration::from_millis(PACING_LEAD_MS);
        let chunk_duration = Duration::from_millis(CHUNK_MS);

        for chunk in &chunks {
            let frame = MediaFrame::Media {
                stream_sid: stream_sid.clone(),
                media: MediaPayload {
                    payload: base64::engine::general_purpose::STANDARD.encode(chunk),
                },
            };
            self.send_frame(&frame).await?;
            tokio::time::sleep(chunk_duration.saturating_sub(lead)).await;
        }

        let mark_name = format!("m{}", self.state.mark_seq.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        *self.state.mark_waiter.lock().await = Some((mark_name.clone(), tx));

        let mark_frame = MediaFrame::Mark {
            stream_sid,
            mark: MarkPayload { name: mark_name },
        };
        self.send_frame(&mark_frame).await?;

        let safety_timeout = mark_safety_timeout(frame_count(encoded.len()));
        tokio::time::timeout(safety_timeout, rx).await.ok();
        self.state.mark_waiter.lock().await.take();

        Ok(())
    }

    async fn send_frame(&self, frame: &MediaFrame) -> Result<(), CallError> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(CallError::MediaTimeout);
        }
        let text = serde_json::to_string(frame).map_err(|e| CallError::TtsFailed(e.to_string()))?;
        let guard = self.state.outbound_tx.lock().await;
        match guard.as_ref() {
            Some(tx) => tx.send(Message::text(text)).map_err(|_| CallError::MediaTimeout),
            None => Err(CallError::MediaTimeout),
        }
    }

    pub async fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
        *self.state.outbound_tx.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_frame_round_trips() {
        let json = r#"{"event":"start","streamSid":"S1"}"#;
        let frame: MediaFrame = serde_json::from_str(json).unwrap();
        assert!(matches!(frame, MediaFrame::Start { ref stream_sid } if stream_sid == "S1"));
        assert_eq!(serde_json::to_string(&frame).unwrap(), json);
    }

    #[test]
    fn media_frame_carries_base64_payload() {
        let json = r#"{"event":"media","streamSid":"S1","media":{"payload":"AAEC"}}"#;
        let frame: MediaFrame = serde_json::from_str(json).unwrap();
        match frame {
            MediaFrame::Media { stream_sid, media } => {
                assert_eq!(stream_sid, "S1");
                assert_eq!(media.payload, "AAEC");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn frame_count_matches_500ms_chunking() {
        // 1.5s of 8kHz mu-law audio is 12000 bytes -> 3 chunks of 4000.
        assert_eq!(frame_count(12000), 3);
        assert_eq!(frame_count(12001), 4);
        assert_eq!(frame_count(0), 1);
    }

    #[test]
    fn mark_safety_timeout_is_chunks_times_500ms_plus_2s() {
        assert_eq!(mark_safety_timeout(3), Duration::from_millis(1500) + Duration::from_secs(2));
    }
}
