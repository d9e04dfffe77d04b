//! Webhook Router (component C9): the carrier-facing HTTP/WebSocket surface.
//!
//! Grounded in the teacher's `warp::path(...).and(warp::ws())...on_upgrade(...)`
//! shape from `api/voice.rs::routes` and its `handle_rejection` convention
//! from `main.rs`, generalized from session-authenticated app routes to
//! carrier-authenticated (signature-verified) webhook routes.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use warp::http::StatusCode;
use warp::ws::{WebSocket, Ws};
use warp::{Filter, Rejection, Reply};

use crate::call::CallSession;
use crate::error::CallError;
use crate::manager::CallManager;
use crate::media::MediaSession;
use crate::providers::{ProviderRegistry, TelephonyProvider};

/// Media WS must connect within 30s of the carrier answering the call.
const MEDIA_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

enum StatusKind {
    Ringing,
    Answered,
    Hangup,
    Other,
}

/// Normalizes the two carriers' differently-shaped status payloads into one
/// `(carrier_call_ref, kind)` pair. Twilio posts form-urlencoded fields;
/// Telnyx posts a JSON envelope.
fn parse_status_event(provider_name: &str, raw_body: &[u8]) -> Option<(String, StatusKind)> {
    match provider_name {
        "twilio" => {
            let body = std::str::from_utf8(raw_body).ok()?;
            let fields: std::collections::HashMap<String, String> =
                url::form_urlencoded::parse(body.as_bytes()).into_owned().collect();
            let call_sid = fields.get("CallSid")?.clone();
            let kind = match fields.get("CallStatus").map(String::as_str) {
                Some("ringing") => StatusKind::Ringing,
                Some("in-progress") => StatusKind::Answered,
                Some("completed") | Some("busy") | Some("failed") | Some("no-answer") | Some("canceled") => {
                    StatusKind::Hangup
                }
                _ => StatusKind::Other,
            };
            Some((call_sid, kind))
        }
        "telnyx" => {
            let json: serde_json::Value = serde_json::from_slice(raw_body).ok()?;
            let call_ref = json.pointer("/data/payload/call_control_id").and_then(serde_json::Value::as_str)?;
            let event_type = json.pointer("/data/event_type").and_then(serde_json::Value::as_str).unwrap_or("");
            let kind = match event_type {
                "call.ringing" => StatusKind::Ringing,
                "call.answered" => StatusKind::Answered,
                "call.hangup" => StatusKind::Hangup,
                _ => StatusKind::Other,
            };
            Some((call_ref.to_string(), kind))
        }
        _ => None,
    }
}

fn with_state<T: Clone + Send + Sync>(value: T) -> impl Filter<Extract = (T,), Error = Infallible> + Clone {
    warp::any().map(move || value.clone())
}

pub fn routes(
    manager: Arc<CallManager>,
    providers: ProviderRegistry,
    media_ws_url: String,
    status_callback_url: String,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let call_instruction = warp::path("call-instruction")
        .and(warp::get().or(warp::post()).unify())
        .and(with_state(providers.phone.clone()))
        .and(with_state(media_ws_url))
        .map(|phone: Arc<dyn TelephonyProvider>, media_ws_url: String| {
            let (content_type, body) = phone.render_call_instruction(&media_ws_url);
            warp::reply::with_header(body, "content-type", content_type)
        });

    let status = warp::path("status")
        .and(warp::post())
        .and(warp::header::headers_cloned())
        .and(warp::body::bytes())
        .and(with_state(manager.clone()))
        .and(with_state(providers.phone.clone()))
        .and(with_state(status_callback_url))
        .and_then(handle_status);

    let media_stream = warp::path("media-stream")
        .and(warp::ws())
        .and(with_state(manager))
        .map(|ws: Ws, manager: Arc<CallManager>| {
            ws.on_upgrade(move |socket| async move {
                handle_media_stream(socket, manager).await;
            })
        });

    let health = warp::path("health").and(warp::get()).and(with_state(providers)).map(|providers: ProviderRegistry| {
        warp::reply::json(&serde_json::json!({
            "status": "ok",
            "telephony_provider": providers.phone.name(),
            "tts_provider": providers.tts.name(),
        }))
    });

    call_instruction
        .map(|reply| -> Box<dyn Reply> { Box::new(reply) })
        .or(status.map(|reply| -> Box<dyn Reply> { Box::new(reply) }))
        .unify()
        .or(media_stream.map(|reply| -> Box<dyn Reply> { Box::new(reply) }))
        .unify()
        .or(health.map(|reply| -> Box<dyn Reply> { Box::new(reply) }))
        .unify()
}

async fn handle_status(
    headers: warp::http::HeaderMap,
    body: bytes::Bytes,
    manager: Arc<CallManager>,
    phone: Arc<dyn TelephonyProvider>,
    status_callback_url: String,
) -> Result<impl Reply, Rejection> {
    if !phone.verify_webhook(&headers, &body, &status_callback_url) {
        return Err(warp::reject::custom(CallError::CarrierRejected("invalid webhook signature".to_string())));
    }

    if let Some((carrier_ref, kind)) = parse_status_event(phone.name(), &body) {
        if let Some(session) = manager.find_by_carrier_ref(&carrier_ref).await {
            match kind {
                StatusKind::Ringing => session.mark_ringing().await,
                StatusKind::Answered => session.mark_answered().await,
                // CallManager's background forget-watcher (spawned alongside
                // the call in `initiate`) releases the registry entry once
                // this reaches `Ended`; nothing further to do here.
                StatusKind::Hangup => session.force_end().await,
                StatusKind::Other => {}
            }
        }
    }

    Ok(warp::reply::with_status(warp::reply(), StatusCode::NO_CONTENT))
}

async fn handle_media_stream(ws: WebSocket, manager: Arc<CallManager>) {
    let (media, ready_rx) = MediaSession::new(ws);

    let stream_sid = match tokio::time::timeout(MEDIA_CONNECT_TIMEOUT, ready_rx).await {
        Ok(Ok(stream_sid)) => stream_sid,
        _ => {
            tracing::warn!("media stream never sent a start frame");
            media.close().await;
            return;
        }
    };

    let session: Arc<CallSession> = match manager.find_by_carrier_ref(&stream_sid).await {
        Some(session) => session,
        None => {
            tracing::warn!("media stream start for unknown call reference {stream_sid}");
            media.close().await;
            return;
        }
    };

    media.bind_stt(session.stt()).await;
    if let Err(e) = session.bind_media(media).await {
        tracing::warn!(call_id = %session.id, "media bind failed, ending call: {e}");
        // Same forget-watcher as the hangup path above releases this call.
        session.force_end().await;
    }
}

/// Converts rejections (both warp's built-ins and our `CallError`) into a
/// JSON body, the way the teacher's `handle_rejection` converts failures at
/// the edge rather than letting them panic the request task.
pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "not found".to_string())
    } else if let Some(call_err) = err.find::<CallError>() {
        let status = match call_err {
            CallError::CallNotFound(_) => StatusCode::NOT_FOUND,
            CallError::CallBusy(_) => StatusCode::CONFLICT,
            CallError::CallEnded(_) => StatusCode::GONE,
            CallError::ConfigInvalid(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CallError::CarrierRejected(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::UNPROCESSABLE_ENTITY,
        };
        (status, call_err.to_string())
    } else if err.find::<warp::filters::body::BodyDeserializeError>().is_some() {
        (StatusCode::BAD_REQUEST, "malformed request body".to_string())
    } else {
        tracing::error!("unhandled rejection: {err:?}");
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
    };

    Ok(warp::reply::with_status(warp::reply::json(&serde_json::json!({ "error": message })), status))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_twilio_ringing_status() {
        let body = b"CallSid=CA123&CallStatus=ringing";
        let (carrier_ref, kind) = parse_status_event("twilio", body).unwrap();
        assert_eq!(carrier_ref, "CA123");
        assert!(matches!(kind, StatusKind::Ringing));
    }

    #[test]
    fn parses_twilio_completed_as_hangup() {
        let body = b"CallSid=CA123&CallStatus=completed";
        let (_, kind) = parse_status_event("twilio", body).unwrap();
        assert!(matches!(kind, StatusKind::Hangup));
    }

    #[test]
    fn parses_telnyx_answered_status() {
        let body = br#"{"data":{"event_type":"call.answered","payload":{"call_control_id":"v3:abc"}}}"#;
        let (carrier_ref, kind) = parse_status_event("telnyx", body).unwrap();
        assert_eq!(carrier_ref, "v3:abc");
        assert!(matches!(kind, StatusKind::Answered));
    }

    #[test]
    fn unknown_provider_yields_none() {
        assert!(parse_status_event("vonage", b"{}").is_none());
    }
}
