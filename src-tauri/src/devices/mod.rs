//! Media device seams.
//!
//! This module provides blocking-call interfaces for the microphone, the
//! speaker, and the webcam, with the real backends selected by a factory
//! trait so the streaming loop never touches device libraries directly. The
//! streaming loop offloads every call through `spawn_blocking`.

pub mod audio;
pub mod camera;

use std::fmt;
use std::sync::Arc;

pub use camera::ensure_ffmpeg;

/// Error type for device operations.
#[derive(Debug)]
pub enum DeviceError {
    /// The device does not exist or could not be opened
    Unavailable(String),
    /// The device backend reported an error mid-stream
    Backend(String),
    /// The device stream has ended or been torn down
    Closed,
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::Unavailable(msg) => write!(f, "Device unavailable: {}", msg),
            DeviceError::Backend(msg) => write!(f, "Device error: {}", msg),
            DeviceError::Closed => write!(f, "Device stream closed"),
        }
    }
}

impl std::error::Error for DeviceError {}

impl From<DeviceError> for String {
    fn from(err: DeviceError) -> Self {
        err.to_string()
    }
}

/// Parameters for opening an audio device.
#[derive(Debug, Clone)]
pub struct AudioSpec {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels (1 = mono)
    pub channels: u16,
    /// Chunk size in bytes for reads (input side only)
    pub chunk_bytes: usize,
}

/// A single webcam frame in interleaved RGB24.
#[derive(Clone)]
pub struct CameraFrame {
    pub width: u32,
    pub height: u32,
    /// RGB pixel data, `width * height * 3` bytes
    pub data: Vec<u8>,
}

/// Blocking microphone source.
pub trait AudioSource: Send {
    /// Read one fixed-size chunk of PCM bytes. Blocks until a full chunk
    /// is available.
    fn read_chunk(&mut self) -> Result<Vec<u8>, DeviceError>;
}

/// Blocking speaker sink.
pub trait AudioSink: Send {
    /// Write PCM bytes to the output device. Blocks until the device has
    /// accepted the bytes.
    fn write(&mut self, pcm: &[u8]) -> Result<(), DeviceError>;
}

/// Blocking webcam source.
pub trait CameraSource: Send {
    /// Grab the next frame. Blocks until a frame is available.
    fn grab_frame(&mut self) -> Result<CameraFrame, DeviceError>;
}

/// Factory for the media devices a streaming session needs.
pub trait MediaDevices: Send + Sync {
    /// Open the default microphone.
    fn open_mic(&self, spec: &AudioSpec) -> Result<Box<dyn AudioSource>, DeviceError>;

    /// Open the default speaker.
    fn open_speaker(&self, spec: &AudioSpec) -> Result<Box<dyn AudioSink>, DeviceError>;

    /// Open the default webcam.
    fn open_camera(&self) -> Result<Box<dyn CameraSource>, DeviceError>;
}

/// Real device backend: cpal for audio, an ffmpeg rawvideo pipe for video.
pub struct SystemDevices;

impl MediaDevices for SystemDevices {
    fn open_mic(&self, spec: &AudioSpec) -> Result<Box<dyn AudioSource>, DeviceError> {
        Ok(Box::new(audio::CpalMic::open(spec)?))
    }

    fn open_speaker(&self, spec: &AudioSpec) -> Result<Box<dyn AudioSink>, DeviceError> {
        Ok(Box::new(audio::CpalSpeaker::open(spec)?))
    }

    fn open_camera(&self) -> Result<Box<dyn CameraSource>, DeviceError> {
        Ok(Box::new(camera::FfmpegCamera::open()?))
    }
}

/// Get the system device backend.
pub fn system_devices() -> Arc<dyn MediaDevices> {
    Arc::new(SystemDevices)
}
