pub mod stt;
pub mod telephony;
pub mod tts;

use std::sync::Arc;

pub use stt::{SttProvider, SttSession};
pub use telephony::TelephonyProvider;
pub use tts::TtsProvider;

/// Immutable bundle of provider capabilities, built once at startup and
/// shared (via `Arc`) across every call. Each call owns its own `SttSession`
/// (created from `stt`), but `phone` and `tts` are stateless dispatchers
/// safe to share directly.
#[derive(Clone)]
pub struct ProviderRegistry {
    pub phone: Arc<dyn TelephonyProvider>,
    pub tts: Arc<dyn TtsProvider>,
    pub stt: Arc<dyn SttProvider>,
}
