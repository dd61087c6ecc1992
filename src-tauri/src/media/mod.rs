//! Streaming media core.
//!
//! `stream` holds the concurrent media loop; `image` the frame processing
//! helpers it feeds the upstream session and the UI with.

pub mod error;
pub mod image;
pub mod stream;

pub use error::StreamError;
pub use stream::{LatestFrame, MediaLoop};
