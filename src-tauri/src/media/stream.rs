//! The concurrent media streaming loop.
//!
//! A `MediaLoop` keeps one full-duplex conversation with the upstream model
//! alive: four tasks run concurrently against a shared session until the
//! cancellation flag is set, and the owning `run` call returns only after
//! every task has terminated.
//!
//! - microphone capture: blocking chunk reads forwarded as realtime audio
//! - reception: inbound events fanned into the bounded playback queue
//! - playback: queued audio written to the speaker, drained on shutdown
//! - video capture: webcam frames resized, JPEG-encoded, and forwarded
//!
//! The playback queue is the only backpressure point: when it is full the
//! reception task blocks on enqueue instead of buffering without bound.

use crate::config::Settings;
use crate::devices::{AudioSpec, MediaDevices};
use crate::media::error::StreamError;
use crate::media::image::{encode_jpeg, resize_to_fit, rgb_from_raw};
use crate::upstream::{self, ConnectParams, SessionEvent, UpstreamConnector, UpstreamSession};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// How often idle tasks re-check the cancellation flag.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long the video task waits for the camera to open before degrading
/// the session to audio-only.
const CAMERA_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// The most recently captured video frame, as shown in the UI preview.
///
/// Single writer (the video task), last-write-wins, no history.
#[derive(Clone)]
pub struct LatestFrame {
    /// JPEG-encoded frame
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// One streaming session: four concurrent tasks over a shared upstream
/// session, a bounded inbound-audio queue, and a set-once cancellation flag.
pub struct MediaLoop {
    settings: Settings,
    instruction: String,
    chunk_size: usize,
    connector: Arc<dyn UpstreamConnector>,
    devices: Arc<dyn MediaDevices>,
    quit: Arc<AtomicBool>,
    latest_frame: Arc<Mutex<Option<LatestFrame>>>,
}

impl MediaLoop {
    /// Create a new loop. The capture chunk size is derived from the
    /// configured microphone kind.
    pub fn new(
        settings: Settings,
        instruction: String,
        connector: Arc<dyn UpstreamConnector>,
        devices: Arc<dyn MediaDevices>,
    ) -> Self {
        let chunk_size = settings.chunk_size();
        Self {
            settings,
            instruction,
            chunk_size,
            connector,
            devices,
            quit: Arc::new(AtomicBool::new(false)),
            latest_frame: Arc::new(Mutex::new(None)),
        }
    }

    /// Signal all tasks to stop. Idempotent; the flag is never cleared.
    pub fn shutdown(&self) {
        self.quit.store(true, Ordering::SeqCst);
    }

    /// Whether shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    /// The most recently captured video frame, if any.
    pub fn latest_frame(&self) -> Option<LatestFrame> {
        self.latest_frame.lock().ok().and_then(|slot| slot.clone())
    }

    /// Open the upstream session and run all streaming tasks until shutdown
    /// or the first task failure.
    pub async fn run(&self, api_key: &str) -> Result<(), StreamError> {
        let params = ConnectParams {
            api_key: api_key.to_string(),
            model: self.settings.model.clone(),
            voice_name: self.settings.voice_name.clone(),
            response_modalities: self.settings.response_modalities.clone(),
            system_instruction: self.instruction.clone(),
            resumption_handle: upstream::resumption_handle(),
            input_sample_rate: self.settings.input_sample_rate,
        };

        info!(
            model = %params.model,
            mic = self.settings.mic_type.as_str(),
            chunk_size = self.chunk_size,
            "Opening live session"
        );
        let session = self.connector.connect(&params).await?;

        let result = self.run_streams(session.clone()).await;
        session.close().await;

        match &result {
            Ok(()) => info!("Streaming session stopped"),
            Err(e) => error!("Streaming session failed: {}", e),
        }
        result
    }

    /// Run the four streaming tasks against an open session.
    ///
    /// Structured join: returns only once every task has finished. The
    /// first task error sets the cancellation flag so the siblings wind
    /// down cooperatively, and that error is returned.
    async fn run_streams(&self, session: Arc<dyn UpstreamSession>) -> Result<(), StreamError> {
        let (audio_tx, audio_rx) = mpsc::channel::<Vec<u8>>(self.settings.audio_queue_depth);

        let mic_spec = AudioSpec {
            sample_rate: self.settings.input_sample_rate,
            channels: self.settings.audio_channels,
            chunk_bytes: self.chunk_size,
        };
        let speaker_spec = AudioSpec {
            sample_rate: self.settings.output_sample_rate,
            channels: self.settings.audio_channels,
            chunk_bytes: self.chunk_size,
        };

        let mut tasks: JoinSet<Result<(), StreamError>> = JoinSet::new();
        tasks.spawn(listen_audio(
            self.devices.clone(),
            session.clone(),
            self.quit.clone(),
            mic_spec,
        ));
        tasks.spawn(receive_audio(
            session.clone(),
            audio_tx,
            self.quit.clone(),
        ));
        tasks.spawn(play_audio(
            self.devices.clone(),
            audio_rx,
            self.quit.clone(),
            self.chunk_size,
            speaker_spec,
        ));
        tasks.spawn(capture_video(
            self.devices.clone(),
            session,
            self.quit.clone(),
            self.latest_frame.clone(),
            Duration::from_secs_f64(self.settings.video_capture_interval),
            self.settings.thumbnail_max_size,
        ));

        let mut first_error: Option<StreamError> = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(result) => result,
                Err(e) => Err(StreamError::Task(e.to_string())),
            };
            if let Err(e) = outcome {
                // Fail fast: wind down the remaining tasks cooperatively.
                self.quit.store(true, Ordering::SeqCst);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Microphone capture task: read fixed-size chunks from the input device
/// and forward them to the session as realtime audio.
async fn listen_audio(
    devices: Arc<dyn MediaDevices>,
    session: Arc<dyn UpstreamSession>,
    quit: Arc<AtomicBool>,
    spec: AudioSpec,
) -> Result<(), StreamError> {
    let open_spec = spec.clone();
    let mut mic = tokio::task::spawn_blocking(move || devices.open_mic(&open_spec))
        .await
        .map_err(|e| StreamError::Task(e.to_string()))??;

    while !quit.load(Ordering::SeqCst) {
        let (returned, chunk) = tokio::task::spawn_blocking(move || {
            let chunk = mic.read_chunk();
            (mic, chunk)
        })
        .await
        .map_err(|e| StreamError::Task(e.to_string()))?;
        mic = returned;

        session.send_audio(&chunk?).await?;
    }
    Ok(())
}

/// Reception task: pull inbound events and enqueue audio for playback.
///
/// The enqueue blocks when the queue is full, which applies backpressure to
/// message consumption instead of growing memory without bound.
async fn receive_audio(
    session: Arc<dyn UpstreamSession>,
    audio_tx: mpsc::Sender<Vec<u8>>,
    quit: Arc<AtomicBool>,
) -> Result<(), StreamError> {
    while !quit.load(Ordering::SeqCst) {
        let event = match tokio::time::timeout(POLL_INTERVAL, session.next_event()).await {
            Ok(result) => result?,
            Err(_) => continue, // idle; re-check the cancellation flag
        };

        match event {
            Some(SessionEvent::Audio(bytes)) => {
                if audio_tx.send(bytes).await.is_err() {
                    break; // playback task is gone
                }
            }
            Some(SessionEvent::Resumption(handle)) => {
                info!("Recorded session resumption handle");
                upstream::record_resumption_handle(handle);
            }
            Some(_) => {} // turn markers and other kinds are not handled here
            None => break, // inbound stream ended
        }
    }
    Ok(())
}

/// Playback task: dequeue audio and write it to the output device.
///
/// Chunks are buffered to smooth playback and flushed once enough has
/// accumulated. On cancellation the queue is drained and everything still
/// buffered is written before the device is released.
async fn play_audio(
    devices: Arc<dyn MediaDevices>,
    mut audio_rx: mpsc::Receiver<Vec<u8>>,
    quit: Arc<AtomicBool>,
    chunk_size: usize,
    spec: AudioSpec,
) -> Result<(), StreamError> {
    let open_spec = spec.clone();
    let mut speaker = tokio::task::spawn_blocking(move || devices.open_speaker(&open_spec))
        .await
        .map_err(|e| StreamError::Task(e.to_string()))??;

    let flush_threshold = chunk_size * 4;
    let mut buf: Vec<u8> = Vec::new();

    while !quit.load(Ordering::SeqCst) {
        match tokio::time::timeout(POLL_INTERVAL, audio_rx.recv()).await {
            Ok(Some(chunk)) => buf.extend_from_slice(&chunk),
            Ok(None) => break, // producer gone, queue fully drained
            Err(_) => {}       // idle; re-check the cancellation flag
        }

        if buf.len() >= flush_threshold {
            let data = std::mem::take(&mut buf);
            let (returned, written) = tokio::task::spawn_blocking(move || {
                let written = speaker.write(&data);
                (speaker, written)
            })
            .await
            .map_err(|e| StreamError::Task(e.to_string()))?;
            speaker = returned;
            written?;
        }
    }

    // Graceful flush: everything already queued still gets played.
    while let Ok(chunk) = audio_rx.try_recv() {
        buf.extend_from_slice(&chunk);
    }
    if !buf.is_empty() {
        let data = std::mem::take(&mut buf);
        let (_speaker, written) = tokio::task::spawn_blocking(move || {
            let written = speaker.write(&data);
            (speaker, written)
        })
        .await
        .map_err(|e| StreamError::Task(e.to_string()))?;
        written?;
    }
    Ok(())
}

/// Video capture task: grab webcam frames on a fixed interval, resize and
/// encode them, forward them upstream, and publish the latest frame.
///
/// A camera that cannot be opened downgrades the session to audio-only
/// without affecting the other tasks.
async fn capture_video(
    devices: Arc<dyn MediaDevices>,
    session: Arc<dyn UpstreamSession>,
    quit: Arc<AtomicBool>,
    latest_frame: Arc<Mutex<Option<LatestFrame>>>,
    interval: Duration,
    max_size: [u32; 2],
) -> Result<(), StreamError> {
    let opening = tokio::task::spawn_blocking(move || devices.open_camera());
    let opened = match tokio::time::timeout(CAMERA_OPEN_TIMEOUT, opening).await {
        Ok(joined) => joined.map_err(|e| StreamError::Task(e.to_string()))?,
        Err(_) => {
            warn!("Camera open timed out, continuing audio-only");
            return Ok(());
        }
    };
    let mut camera = match opened {
        Ok(camera) => camera,
        Err(e) => {
            warn!("Cannot open camera, continuing audio-only: {}", e);
            return Ok(());
        }
    };

    while !quit.load(Ordering::SeqCst) {
        let (returned, grabbed) = tokio::task::spawn_blocking(move || {
            let frame = camera.grab_frame();
            (camera, frame)
        })
        .await
        .map_err(|e| StreamError::Task(e.to_string()))?;
        camera = returned;

        let frame = match grabbed {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Camera stream ended, continuing audio-only: {}", e);
                break;
            }
        };

        let img = match rgb_from_raw(frame.width, frame.height, frame.data) {
            Ok(img) => img,
            Err(e) => {
                warn!("Skipping malformed camera frame: {}", e);
                continue;
            }
        };
        let resized = resize_to_fit(&img, max_size[0], max_size[1]);
        let (width, height) = resized.dimensions();
        let jpeg = encode_jpeg(&resized).map_err(StreamError::Codec)?;

        session.send_video(&jpeg).await?;
        if let Ok(mut slot) = latest_frame.lock() {
            *slot = Some(LatestFrame {
                jpeg,
                width,
                height,
            });
        }

        tokio::time::sleep(interval).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MicType;
    use crate::devices::testing::FakeDevices;
    use crate::upstream::testing::{
        FailingConnector, MockConnector, MockSession, GLOBAL_STATE_LOCK,
    };
    use crate::upstream::UpstreamError;

    fn test_settings(mic_type: MicType, queue_depth: usize) -> Settings {
        Settings {
            mic_type,
            model: "models/test".to_string(),
            voice_name: "Leda".to_string(),
            video_capture_interval: 0.05,
            ui_title: "test".to_string(),
            response_modalities: vec!["AUDIO".to_string()],
            input_sample_rate: 16000,
            output_sample_rate: 24000,
            audio_channels: 1,
            audio_format: "s16le".to_string(),
            thumbnail_max_size: [320, 320],
            blank_image_shape: [480, 640, 3],
            instructions_file: "instructions.txt".to_string(),
            audio_queue_depth: queue_depth,
            extra: serde_json::Map::new(),
        }
    }

    fn make_loop(
        session: Arc<MockSession>,
        devices: Arc<FakeDevices>,
        mic_type: MicType,
    ) -> Arc<MediaLoop> {
        let connector = MockConnector::new(session);
        Arc::new(MediaLoop::new(
            test_settings(mic_type, 64),
            "be helpful".to_string(),
            connector,
            devices,
        ))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_stops_all_tasks() {
        let session = MockSession::idle();
        let devices = Arc::new(FakeDevices::new());
        let media_loop = make_loop(session.clone(), devices, MicType::DynamicMic);

        let runner = {
            let media_loop = media_loop.clone();
            tokio::spawn(async move { media_loop.run("test-key").await })
        };

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!runner.is_finished());

        media_loop.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("run did not return after shutdown")
            .unwrap();
        assert!(result.is_ok());

        // The microphone kept feeding the session while it ran.
        assert!(!session.sent_audio.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_camera_failure_degrades_to_audio_only() {
        let session = MockSession::scripted(
            vec![
                SessionEvent::Audio(vec![1u8; 1500]),
                SessionEvent::Audio(vec![2u8; 1500]),
            ],
            false,
        );
        let devices = Arc::new(FakeDevices::without_camera());
        let media_loop = make_loop(session.clone(), devices.clone(), MicType::DynamicMic);

        let runner = {
            let media_loop = media_loop.clone();
            tokio::spawn(async move { media_loop.run("test-key").await })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        media_loop.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("run did not return after shutdown")
            .unwrap();

        // The camera failure never surfaced as a session failure, and the
        // audio tasks kept running: mic chunks went up, queued audio was
        // played back.
        assert!(result.is_ok());
        assert!(!session.sent_audio.lock().unwrap().is_empty());
        assert!(session.sent_video.lock().unwrap().is_empty());
        let played = devices.bytes_played();
        assert_eq!(played.len(), 3000);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_playback_drains_queue_before_exit() {
        // Three small chunks, well under the flush threshold, so nothing is
        // written until shutdown forces the drain.
        let session = MockSession::scripted(
            vec![
                SessionEvent::Audio(vec![1u8; 100]),
                SessionEvent::Audio(vec![2u8; 100]),
                SessionEvent::Audio(vec![3u8; 100]),
            ],
            false,
        );
        let devices = Arc::new(FakeDevices::new());
        let media_loop = make_loop(session.clone(), devices.clone(), MicType::ComputerMic);

        let runner = {
            let media_loop = media_loop.clone();
            tokio::spawn(async move { media_loop.run("test-key").await })
        };

        tokio::time::sleep(Duration::from_millis(150)).await;
        media_loop.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("run did not return after shutdown")
            .unwrap();
        assert!(result.is_ok());

        // All three chunks reached the device, in order.
        let mut expected = vec![1u8; 100];
        expected.extend(vec![2u8; 100]);
        expected.extend(vec![3u8; 100]);
        assert_eq!(devices.bytes_played(), expected);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_video_capture_updates_latest_frame() {
        let session = MockSession::idle();
        let devices = Arc::new(FakeDevices::new());
        let media_loop = make_loop(session.clone(), devices, MicType::DynamicMic);

        let runner = {
            let media_loop = media_loop.clone();
            tokio::spawn(async move { media_loop.run("test-key").await })
        };

        tokio::time::sleep(Duration::from_millis(300)).await;
        media_loop.shutdown();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("run did not return after shutdown")
            .unwrap()
            .unwrap();

        let frame = media_loop.latest_frame().expect("no frame captured");
        assert!(frame.width <= 320 && frame.height <= 320);
        assert_eq!(&frame.jpeg[..2], &[0xFF, 0xD8]);
        assert!(!session.sent_video.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_send_failure_cancels_siblings() {
        let session = MockSession::idle();
        session.fail_audio_sends();
        let devices = Arc::new(FakeDevices::new());
        let media_loop = make_loop(session, devices, MicType::DynamicMic);

        let result = tokio::time::timeout(Duration::from_secs(5), media_loop.run("test-key"))
            .await
            .expect("run did not fail fast");
        assert!(matches!(result, Err(StreamError::Upstream(_))));
        // Fail-fast wound the whole loop down via the cancellation flag.
        assert!(media_loop.is_shutdown());
    }

    #[tokio::test]
    async fn test_connect_failure_propagates() {
        let media_loop = MediaLoop::new(
            test_settings(MicType::DynamicMic, 8),
            "be helpful".to_string(),
            Arc::new(FailingConnector),
            Arc::new(FakeDevices::new()),
        );
        let result = media_loop.run("test-key").await;
        assert!(matches!(
            result,
            Err(StreamError::Upstream(UpstreamError::Connect(_)))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_backpressure_bounds_queue_depth() {
        // 50 inbound chunks, consumption paused: the reception task must
        // stall at the queue bound instead of pulling everything.
        let events = (0..50)
            .map(|i| SessionEvent::Audio(vec![i as u8; 16]))
            .collect();
        let session = MockSession::scripted(events, false);
        let (audio_tx, audio_rx) = mpsc::channel::<Vec<u8>>(4);
        let quit = Arc::new(AtomicBool::new(false));

        let receiver = tokio::spawn(receive_audio(session.clone(), audio_tx, quit.clone()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        // Queue depth 4, plus one event held by the blocked send.
        let delivered = session.events_delivered.load(std::sync::atomic::Ordering::SeqCst);
        assert!(delivered <= 5, "queue overran its bound: {}", delivered);
        assert!(session.remaining() >= 45);

        // Dropping the consumer unblocks the task, which then exits.
        drop(audio_rx);
        let result = tokio::time::timeout(Duration::from_secs(5), receiver)
            .await
            .expect("reception task did not exit")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_resumption_handle_flows_into_next_connect() {
        let _guard = GLOBAL_STATE_LOCK.lock().unwrap();

        upstream::record_resumption_handle("seed-handle".to_string());

        let session = MockSession::scripted(
            vec![SessionEvent::Resumption("next-handle".to_string())],
            false,
        );
        let connector = MockConnector::new(session);
        let media_loop = Arc::new(MediaLoop::new(
            test_settings(MicType::DynamicMic, 8),
            "be helpful".to_string(),
            connector.clone(),
            Arc::new(FakeDevices::new()),
        ));

        let runner = {
            let media_loop = media_loop.clone();
            tokio::spawn(async move { media_loop.run("test-key").await })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        media_loop.shutdown();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("run did not return after shutdown")
            .unwrap()
            .unwrap();

        // The connect saw the handle recorded before this session, and the
        // one received during it is ready for the next start.
        let params = connector.last_params.lock().unwrap().clone().unwrap();
        assert_eq!(params.resumption_handle.as_deref(), Some("seed-handle"));
        assert_eq!(
            upstream::resumption_handle().as_deref(),
            Some("next-handle")
        );
    }
}
