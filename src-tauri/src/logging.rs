//! Logging setup and platform-specific log directory resolution.

use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Keeps the non-blocking file writer alive for the process lifetime.
static APPENDER_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Returns the platform-appropriate directory for log files.
///
/// | Platform | Directory |
/// |----------|-----------|
/// | Linux | `$XDG_STATE_HOME/gemchat/logs` or `~/.local/state/gemchat/logs` |
/// | macOS / Windows | local data dir, `gemchat/logs` |
pub fn log_dir() -> Option<PathBuf> {
    let base = directories::ProjectDirs::from("", "", "gemchat")?;

    #[cfg(target_os = "linux")]
    {
        Some(
            base.state_dir()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| base.data_local_dir().join("state"))
                .join("logs"),
        )
    }

    #[cfg(not(target_os = "linux"))]
    {
        Some(base.data_local_dir().join("logs"))
    }
}

/// Initialize tracing with RUST_LOG env var support.
///
/// Logs go to stderr and, when the log directory is available, to a daily
/// rolling file as well. Safe to call once at startup.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = log_dir()
        .and_then(|dir| std::fs::create_dir_all(&dir).ok().map(|_| dir))
        .map(|dir| {
            let appender = tracing_appender::rolling::daily(dir, "gemchat.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = APPENDER_GUARD.set(guard);
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
        });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
}
