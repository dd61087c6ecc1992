//! gemchat Tauri application.
//!
//! Realtime audio/video chat with the Gemini Live API: webcam frames and
//! microphone audio stream up, synthesized speech streams back. The UI is
//! two buttons and a status readout wired to the session manager, plus a
//! live preview fed by the streaming loop's latest frame.

mod config;
mod devices;
mod logging;
mod media;
mod state;
mod upstream;

use base64::{engine::general_purpose::STANDARD, Engine};
use state::SessionManager;
use std::sync::OnceLock;
use tauri::State;
use tracing::{error, warn};

/// Application state wrapper.
pub struct AppState {
    session_manager: SessionManager,
}

impl AppState {
    fn new() -> Self {
        // Verify FFmpeg at startup (downloads if needed); without it the
        // video task degrades the session to audio-only.
        if let Err(e) = devices::ensure_ffmpeg() {
            warn!("FFmpeg unavailable, sessions will be audio-only: {}", e);
        }

        Self {
            session_manager: SessionManager::new(),
        }
    }
}

/// Start a streaming session.
#[tauri::command]
async fn start_session(state: State<'_, AppState>) -> Result<String, String> {
    state
        .session_manager
        .start()
        .map(str::to_string)
        .map_err(|e| {
            error!("[start_session] {}", e);
            e.to_string()
        })
}

/// Stop the active streaming session.
#[tauri::command]
async fn stop_session(state: State<'_, AppState>) -> Result<String, String> {
    Ok(state.session_manager.stop().to_string())
}

/// Get the current session status.
#[tauri::command]
async fn get_session_status(state: State<'_, AppState>) -> Result<String, String> {
    Ok(state.session_manager.status().as_str().to_string())
}

/// Frame payload for the UI preview.
#[derive(Clone, serde::Serialize)]
pub struct FramePayload {
    /// Base64-encoded JPEG image data
    data: String,
    /// Frame width in pixels
    width: u32,
    /// Frame height in pixels
    height: u32,
}

static PLACEHOLDER: OnceLock<FramePayload> = OnceLock::new();

/// Placeholder shown before the first frame arrives, built once from the
/// configured blank-image shape.
fn placeholder_frame() -> Result<FramePayload, String> {
    if let Some(payload) = PLACEHOLDER.get() {
        return Ok(payload.clone());
    }
    let shape = config::load_default_settings()
        .map(|settings| settings.blank_image_shape)
        .unwrap_or([480, 640, 3]);
    let img = media::image::blank_image(shape);
    let jpeg = media::image::encode_jpeg(&img)?;
    let payload = FramePayload {
        data: STANDARD.encode(&jpeg),
        width: img.width(),
        height: img.height(),
    };
    Ok(PLACEHOLDER.get_or_init(|| payload).clone())
}

/// Get the most recent captured video frame, or the placeholder image when
/// no session is active or no frame has arrived yet.
#[tauri::command]
async fn get_latest_frame(state: State<'_, AppState>) -> Result<FramePayload, String> {
    match state.session_manager.latest_frame() {
        Some(frame) => Ok(FramePayload {
            data: STANDARD.encode(&frame.jpeg),
            width: frame.width,
            height: frame.height,
        }),
        None => placeholder_frame(),
    }
}

/// Get the configured UI title.
#[tauri::command]
async fn get_ui_title() -> Result<String, String> {
    Ok(config::load_default_settings()
        .map(|settings| settings.ui_title)
        .unwrap_or_else(|_| "Gemini Audio/Video Demo".to_string()))
}

#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    logging::init();

    tauri::Builder::default()
        .manage(AppState::new())
        .invoke_handler(tauri::generate_handler![
            start_session,
            stop_session,
            get_session_status,
            get_latest_frame,
            get_ui_title,
        ])
        .run(tauri::generate_context!())
        .expect("error while running tauri application");
}
