//! Microphone and speaker backends built on cpal.
//!
//! cpal streams are callback-driven and not `Send`, so each device gets a
//! dedicated thread that owns the stream for its whole lifetime and bridges
//! samples over a channel. That turns the callback API into the blocking
//! read/write calls the streaming loop expects.

use super::{AudioSink, AudioSource, AudioSpec, DeviceError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, StreamConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// Poll interval for the stream-owner threads' shutdown checks.
const KEEPALIVE_POLL: Duration = Duration::from_millis(50);

fn stream_config(spec: &AudioSpec) -> StreamConfig {
    StreamConfig {
        channels: spec.channels,
        sample_rate: SampleRate(spec.sample_rate),
        buffer_size: BufferSize::Default,
    }
}

/// Blocking microphone source over a cpal input stream.
pub struct CpalMic {
    samples: mpsc::Receiver<i16>,
    chunk_bytes: usize,
    stop: Arc<AtomicBool>,
}

impl CpalMic {
    /// Open the default input device.
    pub fn open(spec: &AudioSpec) -> Result<Self, DeviceError> {
        let (sample_tx, sample_rx) = mpsc::channel::<i16>();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), DeviceError>>(1);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = stop.clone();
        let config = stream_config(spec);

        std::thread::Builder::new()
            .name("gemchat-mic".to_string())
            .spawn(move || {
                let device = match cpal::default_host().default_input_device() {
                    Some(d) => d,
                    None => {
                        let _ = ready_tx.send(Err(DeviceError::Unavailable(
                            "no default input device".to_string(),
                        )));
                        return;
                    }
                };

                let stream = match device.build_input_stream(
                    &config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        for &sample in data {
                            // Receiver gone means the mic handle was dropped;
                            // the keepalive loop below notices via `stop`.
                            if sample_tx.send(sample).is_err() {
                                break;
                            }
                        }
                    },
                    |err| error!("Microphone stream error: {}", err),
                    None,
                ) {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = ready_tx.send(Err(DeviceError::Unavailable(e.to_string())));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(DeviceError::Unavailable(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Keep the stream alive until the handle is dropped.
                while !stop_thread.load(Ordering::SeqCst) {
                    std::thread::sleep(KEEPALIVE_POLL);
                }
                drop(stream);
            })
            .map_err(|e| DeviceError::Unavailable(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                samples: sample_rx,
                chunk_bytes: spec.chunk_bytes,
                stop,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DeviceError::Unavailable(
                "microphone thread exited during open".to_string(),
            )),
        }
    }
}

impl AudioSource for CpalMic {
    fn read_chunk(&mut self) -> Result<Vec<u8>, DeviceError> {
        let sample_count = self.chunk_bytes / 2;
        let mut chunk = Vec::with_capacity(self.chunk_bytes);
        for _ in 0..sample_count {
            let sample = self.samples.recv().map_err(|_| DeviceError::Closed)?;
            chunk.extend_from_slice(&sample.to_le_bytes());
        }
        Ok(chunk)
    }
}

impl Drop for CpalMic {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Blocking speaker sink over a cpal output stream.
///
/// The channel between writer and output callback is bounded to roughly one
/// second of audio, so `write` blocks when the device falls behind.
pub struct CpalSpeaker {
    samples: mpsc::SyncSender<i16>,
    stop: Arc<AtomicBool>,
}

impl CpalSpeaker {
    /// Open the default output device.
    pub fn open(spec: &AudioSpec) -> Result<Self, DeviceError> {
        let capacity = (spec.sample_rate as usize * spec.channels as usize).max(1024);
        let (sample_tx, sample_rx) = mpsc::sync_channel::<i16>(capacity);
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), DeviceError>>(1);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = stop.clone();
        let config = stream_config(spec);

        std::thread::Builder::new()
            .name("gemchat-speaker".to_string())
            .spawn(move || {
                let device = match cpal::default_host().default_output_device() {
                    Some(d) => d,
                    None => {
                        let _ = ready_tx.send(Err(DeviceError::Unavailable(
                            "no default output device".to_string(),
                        )));
                        return;
                    }
                };

                let stream = match device.build_output_stream(
                    &config,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        for slot in data.iter_mut() {
                            // Silence when no queued audio.
                            *slot = sample_rx.try_recv().unwrap_or(0);
                        }
                    },
                    |err| error!("Speaker stream error: {}", err),
                    None,
                ) {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = ready_tx.send(Err(DeviceError::Unavailable(e.to_string())));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(DeviceError::Unavailable(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                while !stop_thread.load(Ordering::SeqCst) {
                    std::thread::sleep(KEEPALIVE_POLL);
                }
                drop(stream);
            })
            .map_err(|e| DeviceError::Unavailable(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                samples: sample_tx,
                stop,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DeviceError::Unavailable(
                "speaker thread exited during open".to_string(),
            )),
        }
    }
}

impl AudioSink for CpalSpeaker {
    fn write(&mut self, pcm: &[u8]) -> Result<(), DeviceError> {
        if pcm.len() % 2 != 0 {
            warn!("Dropping trailing odd byte from PCM write");
        }
        for pair in pcm.chunks_exact(2) {
            let sample = i16::from_le_bytes([pair[0], pair[1]]);
            self.samples.send(sample).map_err(|_| DeviceError::Closed)?;
        }
        Ok(())
    }
}

impl Drop for CpalSpeaker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}
