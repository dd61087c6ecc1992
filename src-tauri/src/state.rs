//! Session lifecycle management.
//!
//! A `SessionManager` serializes start/stop requests against the single
//! streaming-loop instance this process may run. It is an owned object,
//! constructed once at startup and handed to the UI layer as managed state;
//! the registration slot behind its mutex is the only place in the
//! application that needs an explicit lock.

use crate::config::{
    load_instruction, load_settings, ConfigError, API_KEY_ENV, CONFIG_FILE, MEDIA_FILE,
};
use crate::devices::{self, MediaDevices};
use crate::media::{LatestFrame, MediaLoop};
use crate::upstream::{GeminiConnector, UpstreamConnector};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use tracing::{error, info};

/// Point-in-time session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// A streaming loop is registered and has not finished
    Running,
    /// No streaming loop is active
    Stopped,
}

impl SessionStatus {
    /// Convert to the status string shown in the UI.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Stopped => "stopped",
        }
    }
}

/// A registered streaming session: the loop plus its background thread.
struct ActiveSession {
    media_loop: Arc<MediaLoop>,
    thread: thread::JoinHandle<()>,
}

/// Serializes start/stop requests against one streaming loop instance.
pub struct SessionManager {
    active: Mutex<Option<ActiveSession>>,
    connector: Arc<dyn UpstreamConnector>,
    devices: Arc<dyn MediaDevices>,
    config_path: PathBuf,
    media_path: PathBuf,
}

impl SessionManager {
    /// Create a manager wired to the real upstream and device backends.
    pub fn new() -> Self {
        Self::with_backends(
            Arc::new(GeminiConnector),
            devices::system_devices(),
            PathBuf::from(CONFIG_FILE),
            PathBuf::from(MEDIA_FILE),
        )
    }

    /// Create a manager with explicit backends and settings paths.
    pub fn with_backends(
        connector: Arc<dyn UpstreamConnector>,
        devices: Arc<dyn MediaDevices>,
        config_path: PathBuf,
        media_path: PathBuf,
    ) -> Self {
        Self {
            active: Mutex::new(None),
            connector,
            devices,
            config_path,
            media_path,
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.active.lock().expect("session state lock poisoned")
    }

    /// Start a new streaming session on a background thread.
    ///
    /// Returns "already running" without side effects when a live session is
    /// registered. A registered session whose loop has already finished
    /// (stopped on its own or failed) counts as stale and is replaced.
    pub fn start(&self) -> Result<&'static str, ConfigError> {
        let mut active = self.slot();

        if let Some(session) = active.as_ref() {
            if !session.thread.is_finished() && !session.media_loop.is_shutdown() {
                return Ok("already running");
            }
            if let Some(stale) = active.take() {
                info!("Clearing finished session before starting a new one");
                let _ = stale.thread.join();
            }
        }

        let api_key =
            std::env::var(API_KEY_ENV).map_err(|_| ConfigError::MissingCredential)?;
        let settings = load_settings(&self.config_path, &self.media_path)?;
        let instruction = load_instruction(&settings)?;

        let media_loop = Arc::new(MediaLoop::new(
            settings,
            instruction,
            self.connector.clone(),
            self.devices.clone(),
        ));

        let loop_for_thread = media_loop.clone();
        let thread = thread::Builder::new()
            .name("gemchat-session".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Runtime::new() {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("Failed to create session runtime: {}", e);
                        loop_for_thread.shutdown();
                        return;
                    }
                };
                if let Err(e) = runtime.block_on(loop_for_thread.run(&api_key)) {
                    error!("Session ended with failure: {}", e);
                    // Mark the loop finished so status reports stopped.
                    loop_for_thread.shutdown();
                }
            })
            .expect("failed to spawn session thread");

        *active = Some(ActiveSession { media_loop, thread });
        info!("Streaming session started");
        Ok("started")
    }

    /// Stop the active session and wait for its background thread.
    pub fn stop(&self) -> &'static str {
        let session = self.slot().take();
        match session {
            None => "not running",
            Some(active) => {
                active.media_loop.shutdown();
                if active.thread.join().is_err() {
                    error!("Session thread panicked during shutdown");
                }
                info!("Streaming session stopped");
                "stopped"
            }
        }
    }

    /// Point-in-time status snapshot.
    pub fn status(&self) -> SessionStatus {
        let active = self.slot();
        match active.as_ref() {
            Some(session)
                if !session.thread.is_finished() && !session.media_loop.is_shutdown() =>
            {
                SessionStatus::Running
            }
            _ => SessionStatus::Stopped,
        }
    }

    /// The most recent video frame from the active session, if any.
    pub fn latest_frame(&self) -> Option<LatestFrame> {
        self.slot()
            .as_ref()
            .and_then(|session| session.media_loop.latest_frame())
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::testing::FakeDevices;
    use crate::upstream::testing::{
        FailingConnector, MockConnector, MockSession, GLOBAL_STATE_LOCK,
    };
    use std::fs;
    use std::time::Duration;

    /// Write a minimal settings + instruction trio and return the paths.
    fn write_test_config(tag: &str) -> (PathBuf, PathBuf, PathBuf) {
        let dir = std::env::temp_dir();
        let pid = std::process::id();
        let instr = dir.join(format!("gemchat_mgr_{}_{}_instr.txt", pid, tag));
        let media = dir.join(format!("gemchat_mgr_{}_{}_media.json", pid, tag));
        let config = dir.join(format!("gemchat_mgr_{}_{}_config.json", pid, tag));
        fs::write(&instr, "be helpful").unwrap();
        fs::write(
            &media,
            r#"{"mic_type": "dynamic_mic", "video_capture_interval": 0.05}"#,
        )
        .unwrap();
        fs::write(
            &config,
            format!(
                r#"{{"model": "models/test", "voice_name": "Leda", "instructions_file": "{}"}}"#,
                instr.display()
            ),
        )
        .unwrap();
        (config, media, instr)
    }

    fn cleanup(paths: (PathBuf, PathBuf, PathBuf)) {
        let _ = fs::remove_file(paths.0);
        let _ = fs::remove_file(paths.1);
        let _ = fs::remove_file(paths.2);
    }

    fn test_manager(connector: Arc<dyn UpstreamConnector>, tag: &str) -> (SessionManager, (PathBuf, PathBuf, PathBuf)) {
        let paths = write_test_config(tag);
        let manager = SessionManager::with_backends(
            connector,
            Arc::new(FakeDevices::new()),
            paths.0.clone(),
            paths.1.clone(),
        );
        (manager, paths)
    }

    #[test]
    fn test_start_stop_lifecycle() {
        let _guard = GLOBAL_STATE_LOCK.lock().unwrap();
        std::env::set_var(API_KEY_ENV, "test-key");

        let connector = MockConnector::new(MockSession::idle());
        let (manager, paths) = test_manager(connector, "lifecycle");

        assert_eq!(manager.status(), SessionStatus::Stopped);
        assert_eq!(manager.start().unwrap(), "started");
        assert_eq!(manager.status(), SessionStatus::Running);

        // A second start is a no-op: one loop instance process-wide.
        assert_eq!(manager.start().unwrap(), "already running");

        assert_eq!(manager.stop(), "stopped");
        assert_eq!(manager.status(), SessionStatus::Stopped);

        // Stopping again is a no-op.
        assert_eq!(manager.stop(), "not running");

        cleanup(paths);
    }

    #[test]
    fn test_missing_credential_is_fatal() {
        let _guard = GLOBAL_STATE_LOCK.lock().unwrap();
        std::env::remove_var(API_KEY_ENV);

        let connector = MockConnector::new(MockSession::idle());
        let (manager, paths) = test_manager(connector, "nocred");

        let err = manager.start().unwrap_err();
        assert!(matches!(err, ConfigError::MissingCredential));
        assert_eq!(manager.status(), SessionStatus::Stopped);

        cleanup(paths);
    }

    #[test]
    fn test_missing_settings_file_is_fatal() {
        let _guard = GLOBAL_STATE_LOCK.lock().unwrap();
        std::env::set_var(API_KEY_ENV, "test-key");

        let manager = SessionManager::with_backends(
            MockConnector::new(MockSession::idle()),
            Arc::new(FakeDevices::new()),
            PathBuf::from("/nonexistent/config.json"),
            PathBuf::from("/nonexistent/media.json"),
        );

        let err = manager.start().unwrap_err();
        assert!(matches!(err, ConfigError::MissingFile(_)));
        assert_eq!(manager.status(), SessionStatus::Stopped);
    }

    #[test]
    fn test_failed_session_reports_stopped() {
        let _guard = GLOBAL_STATE_LOCK.lock().unwrap();
        std::env::set_var(API_KEY_ENV, "test-key");

        let (manager, paths) = test_manager(Arc::new(FailingConnector), "failfast");

        assert_eq!(manager.start().unwrap(), "started");

        // The background thread fails to connect and winds down; give it a
        // moment, then the failure must be visible as "stopped".
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while manager.status() == SessionStatus::Running {
            assert!(std::time::Instant::now() < deadline, "session never failed");
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(manager.status(), SessionStatus::Stopped);

        // A failed registration is stale, not "already running".
        assert_eq!(manager.start().unwrap(), "started");
        assert_eq!(manager.stop(), "stopped");

        cleanup(paths);
    }

    #[test]
    fn test_latest_frame_requires_session() {
        let connector = MockConnector::new(MockSession::idle());
        let (manager, paths) = test_manager(connector, "noframe");
        assert!(manager.latest_frame().is_none());
        cleanup(paths);
    }
}
