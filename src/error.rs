use uuid::Uuid;

/// The one error type surfaced across call orchestration. Provider-specific
/// errors (`reqwest`, websocket, decode) are folded into a variant here at
/// the point they cross into a component boundary rather than propagated raw.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("missing required configuration: {0}")]
    ConfigInvalid(&'static str),

    #[error("carrier rejected the call: {0}")]
    CarrierRejected(String),

    #[error("carrier did not open the media stream in time")]
    MediaTimeout,

    #[error("speech synthesis failed: {0}")]
    TtsFailed(String),

    #[error("speech recognizer unavailable: {0}")]
    SttUnavailable(String),

    #[error("no reply transcript arrived before the timeout")]
    TranscriptTimeout,

    #[error("call {0} is busy with another operation")]
    CallBusy(Uuid),

    #[error("call {0} was not found")]
    CallNotFound(Uuid),

    #[error("call {0} has already ended")]
    CallEnded(Uuid),

    #[error("operation cancelled")]
    Cancelled,
}

impl warp::reject::Reject for CallError {}
