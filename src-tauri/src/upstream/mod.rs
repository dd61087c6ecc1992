//! Upstream client adapter for the Gemini Live API.
//!
//! The streaming loop talks to the hosted model only through the traits in
//! this module: a connector that opens one bidirectional session from the
//! merged settings, and a session exposing realtime audio/video sends plus
//! an inbound event stream. The wire protocol lives in `messages` and the
//! WebSocket transport in `session`.

pub mod messages;
pub mod session;

use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Mutex};

pub use session::GeminiConnector;

/// Gemini Live API WebSocket URL.
pub const LIVE_API_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Error type for upstream operations.
#[derive(Debug)]
pub enum UpstreamError {
    /// Failed to open the session
    Connect(String),
    /// Failed to send a realtime input message
    Send(String),
    /// Failed while reading the inbound stream
    Receive(String),
    /// The server broke the expected protocol framing
    Protocol(String),
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamError::Connect(msg) => write!(f, "Upstream connect failed: {}", msg),
            UpstreamError::Send(msg) => write!(f, "Upstream send failed: {}", msg),
            UpstreamError::Receive(msg) => write!(f, "Upstream receive failed: {}", msg),
            UpstreamError::Protocol(msg) => write!(f, "Upstream protocol error: {}", msg),
        }
    }
}

impl std::error::Error for UpstreamError {}

impl From<UpstreamError> for String {
    fn from(err: UpstreamError) -> Self {
        err.to_string()
    }
}

/// Inbound session events the streaming loop cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Synthesized speech bytes to play back
    Audio(Vec<u8>),
    /// A new session-resumption handle
    Resumption(String),
    /// The model finished a response turn
    TurnComplete,
    /// The model was interrupted by new user input
    Interrupted,
}

/// Parameters for opening an upstream session.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub api_key: String,
    pub model: String,
    pub voice_name: String,
    pub response_modalities: Vec<String>,
    pub system_instruction: String,
    pub resumption_handle: Option<String>,
    pub input_sample_rate: u32,
}

/// One open bidirectional session with the hosted model.
#[async_trait]
pub trait UpstreamSession: Send + Sync {
    /// Send one chunk of raw PCM microphone audio.
    async fn send_audio(&self, pcm: &[u8]) -> Result<(), UpstreamError>;

    /// Send one JPEG-encoded video frame.
    async fn send_video(&self, jpeg: &[u8]) -> Result<(), UpstreamError>;

    /// Await the next inbound event. Returns `None` when the inbound stream
    /// has ended.
    async fn next_event(&self) -> Result<Option<SessionEvent>, UpstreamError>;

    /// Close the session. Best effort.
    async fn close(&self);
}

/// Opens upstream sessions. One session per streaming loop instance.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(&self, params: &ConnectParams)
        -> Result<Arc<dyn UpstreamSession>, UpstreamError>;
}

// ---------------------------------------------------------------------------
// Session resumption slot
// ---------------------------------------------------------------------------

/// Most recent resumption handle observed from any session, carried across
/// stop/start cycles for the life of the process.
static RESUMPTION_HANDLE: Mutex<Option<String>> = Mutex::new(None);

/// Record a resumption handle for reuse by the next session.
pub fn record_resumption_handle(handle: String) {
    if let Ok(mut slot) = RESUMPTION_HANDLE.lock() {
        *slot = Some(handle);
    }
}

/// The resumption handle recorded by the previous session, if any.
pub fn resumption_handle() -> Option<String> {
    RESUMPTION_HANDLE.lock().ok().and_then(|slot| slot.clone())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resumption_slot_roundtrip() {
        let _guard = testing::GLOBAL_STATE_LOCK.lock().unwrap();
        record_resumption_handle("handle-1".to_string());
        assert_eq!(resumption_handle().as_deref(), Some("handle-1"));
        record_resumption_handle("handle-2".to_string());
        assert_eq!(resumption_handle().as_deref(), Some("handle-2"));
    }
}
