//! Webcam capture via an ffmpeg rawvideo pipe.
//!
//! Rather than binding a platform camera API directly, the webcam is read
//! through ffmpeg: one long-running process opens the default camera device
//! and writes fixed-size RGB24 frames to stdout, which `grab_frame` consumes
//! with plain blocking reads.

use super::{CameraFrame, DeviceError};
use ffmpeg_sidecar::command::FfmpegCommand;
use std::io::Read;
use std::path::PathBuf;
use std::process::{ChildStdout, Command, Stdio};
use tracing::debug;

/// Frame size requested from ffmpeg. The camera's native frames are scaled
/// to this before they reach the pipe, making the per-frame byte count
/// deterministic.
const CAPTURE_WIDTH: u32 = 640;
const CAPTURE_HEIGHT: u32 = 480;

/// Frames per second requested from the pipe. Kept low: the streaming loop
/// samples one frame per capture interval, and a slow pipe keeps frames
/// close to live.
const CAPTURE_FPS: u32 = 4;

/// Resolve the path to the FFmpeg binary.
///
/// Prefers a system-installed `ffmpeg` from PATH; falls back to the
/// auto-downloaded sidecar binary location.
fn resolve_ffmpeg_path() -> PathBuf {
    let system = PathBuf::from("ffmpeg");
    let found = Command::new(&system)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false);
    if found {
        system
    } else {
        ffmpeg_sidecar::paths::ffmpeg_path()
    }
}

/// Create a new FfmpegCommand using the resolved FFmpeg path.
fn new_ffmpeg_command() -> FfmpegCommand {
    FfmpegCommand::new_with_path(resolve_ffmpeg_path())
}

/// Verify that an FFmpeg binary is available, downloading one as a last
/// resort. Called once at startup.
pub fn ensure_ffmpeg() -> Result<(), String> {
    let ffmpeg = resolve_ffmpeg_path();
    match Command::new(&ffmpeg)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) if status.success() => Ok(()),
        _ => ffmpeg_sidecar::download::auto_download()
            .map_err(|e| format!("FFmpeg not found and auto-download failed: {}", e)),
    }
}

/// Platform capture arguments for the default webcam.
fn camera_input_args() -> Vec<&'static str> {
    #[cfg(target_os = "linux")]
    {
        vec!["-f", "v4l2", "-i", "/dev/video0"]
    }
    #[cfg(target_os = "macos")]
    {
        vec!["-f", "avfoundation", "-framerate", "30", "-i", "0"]
    }
    #[cfg(target_os = "windows")]
    {
        vec!["-f", "dshow", "-i", "video=Integrated Camera"]
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        vec!["-f", "v4l2", "-i", "/dev/video0"]
    }
}

/// Blocking webcam source backed by a long-running ffmpeg process.
pub struct FfmpegCamera {
    child: std::process::Child,
    stdout: ChildStdout,
    /// First frame, read during open to verify the device works.
    pending: Option<CameraFrame>,
}

impl FfmpegCamera {
    /// Open the default webcam.
    ///
    /// Fails if the camera device cannot be opened (ffmpeg exits before
    /// producing a first frame).
    pub fn open() -> Result<Self, DeviceError> {
        let scale_filter = format!(
            "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2",
            w = CAPTURE_WIDTH,
            h = CAPTURE_HEIGHT
        );
        let fps = CAPTURE_FPS.to_string();

        let mut command = new_ffmpeg_command();
        command.hide_banner().args(camera_input_args()).args([
            "-vf",
            scale_filter.as_str(),
            "-r",
            fps.as_str(),
            "-f",
            "rawvideo",
            "-pix_fmt",
            "rgb24",
            "pipe:1",
        ]);

        let inner_command = command.as_inner_mut();
        inner_command.stdin(Stdio::null());
        inner_command.stdout(Stdio::piped());
        inner_command.stderr(Stdio::piped());

        let mut child = inner_command
            .spawn()
            .map_err(|e| DeviceError::Unavailable(format!("Failed to start FFmpeg: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DeviceError::Unavailable("Failed to get FFmpeg stdout".to_string()))?;

        // Drain stderr in the background so ffmpeg never blocks on it.
        if let Some(stderr) = child.stderr.take() {
            std::thread::spawn(move || {
                use std::io::{BufRead, BufReader};
                let reader = BufReader::new(stderr);
                for line in reader.lines().map_while(Result::ok) {
                    debug!("[FFmpeg] {}", line);
                }
            });
        }

        let mut camera = Self {
            child,
            stdout,
            pending: None,
        };

        // Pull the first frame now: a camera that cannot be opened makes
        // ffmpeg exit immediately, which surfaces here as a short read.
        match camera.read_frame() {
            Ok(frame) => {
                camera.pending = Some(frame);
                Ok(camera)
            }
            Err(_) => Err(DeviceError::Unavailable(
                "camera produced no frames (device missing or busy?)".to_string(),
            )),
        }
    }

    fn read_frame(&mut self) -> Result<CameraFrame, DeviceError> {
        let mut data = vec![0u8; (CAPTURE_WIDTH * CAPTURE_HEIGHT * 3) as usize];
        self.stdout.read_exact(&mut data).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                DeviceError::Closed
            } else {
                DeviceError::Backend(e.to_string())
            }
        })?;
        Ok(CameraFrame {
            width: CAPTURE_WIDTH,
            height: CAPTURE_HEIGHT,
            data,
        })
    }
}

impl super::CameraSource for FfmpegCamera {
    fn grab_frame(&mut self) -> Result<CameraFrame, DeviceError> {
        if let Some(frame) = self.pending.take() {
            return Ok(frame);
        }
        self.read_frame()
    }
}

impl Drop for FfmpegCamera {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
