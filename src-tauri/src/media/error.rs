//! Error types for the streaming loop.

use crate::devices::DeviceError;
use crate::upstream::UpstreamError;
use std::fmt;

/// Error type for a streaming session.
#[derive(Debug)]
pub enum StreamError {
    /// A microphone or speaker device failed
    Device(DeviceError),
    /// The upstream session failed
    Upstream(UpstreamError),
    /// A frame could not be encoded
    Codec(String),
    /// A task panicked or could not be joined
    Task(String),
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::Device(err) => write!(f, "{}", err),
            StreamError::Upstream(err) => write!(f, "{}", err),
            StreamError::Codec(msg) => write!(f, "Frame encoding failed: {}", msg),
            StreamError::Task(msg) => write!(f, "Streaming task failed: {}", msg),
        }
    }
}

impl std::error::Error for StreamError {}

impl From<DeviceError> for StreamError {
    fn from(err: DeviceError) -> Self {
        StreamError::Device(err)
    }
}

impl From<UpstreamError> for StreamError {
    fn from(err: UpstreamError) -> Self {
        StreamError::Upstream(err)
    }
}

impl From<StreamError> for String {
    fn from(err: StreamError) -> Self {
        err.to_string()
    }
}
