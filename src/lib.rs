//! `callbridge`: bridges a programmatic agent to a live phone call. One
//! process places outbound calls through a telephony carrier, streams the
//! caller's audio to a speech-to-text provider, and speaks synthesized
//! replies back down the same media stream, all driven through the small
//! [`AgentOps`] surface below.

pub mod call;
pub mod codec;
pub mod config;
pub mod error;
pub mod manager;
pub mod media;
pub mod providers;
pub mod wav;
pub mod webhook;

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

pub use error::CallError;

/// The four operations an external agent-control transport (HTTP, an MCP
/// tool surface, anything) adapts to. Out of scope per spec: the transport
/// itself. In scope: a stable capability any transport can be bolted onto
/// without reaching through a singleton.
#[async_trait]
pub trait AgentOps: Send + Sync {
    /// Places the call and executes its opening turn in one step; the
    /// caller never sees a call that exists but hasn't spoken yet.
    async fn initiate_call(&self, message: &str) -> Result<(Uuid, String), CallError>;

    /// Speaks `message` and waits for the caller's reply.
    async fn continue_call(&self, call_id: Uuid, message: &str) -> Result<String, CallError>;

    /// Speaks `message` without waiting for a reply.
    async fn speak_to_user(&self, call_id: Uuid, message: &str) -> Result<(), CallError>;

    /// Speaks an optional farewell, then hangs up. Returns call duration.
    async fn end_call(&self, call_id: Uuid, message: Option<&str>) -> Result<Duration, CallError>;
}

#[async_trait]
impl AgentOps for manager::CallManager {
    async fn initiate_call(&self, message: &str) -> Result<(Uuid, String), CallError> {
        self.initiate(message).await
    }

    async fn continue_call(&self, call_id: Uuid, message: &str) -> Result<String, CallError> {
        self.continue_call(call_id, message).await
    }

    async fn speak_to_user(&self, call_id: Uuid, message: &str) -> Result<(), CallError> {
        self.speak_only(call_id, message).await
    }

    async fn end_call(&self, call_id: Uuid, message: Option<&str>) -> Result<Duration, CallError> {
        self.end(call_id, message).await
    }
}
