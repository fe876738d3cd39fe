//! Logging setup shared by the `openagb` binary and anything else that wants
//! the firmware's `tracing` output on a terminal or in a file.

use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
};

use chrono::Utc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt};

/// `LogKind` represents the kind of logging: `stdout` or `logfile`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LogKind {
    /// It logs to console, the default choice.
    STDOUT,

    /// It logs on a file in /tmp/openagb-<timestamp>.log
    FILE,
}

/// Keeps the background log writer alive.
/// Buffered lines are written out when the guard is dropped.
#[must_use = "dropping the guard stops file logging"]
pub struct LoggerGuard {
    _worker: Option<WorkerGuard>,
    path: Option<PathBuf>,
}

impl LoggerGuard {
    /// Location of the log file, `None` when logging to stdout.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn log_file_path() -> PathBuf {
    let filename = format!("openagb-{}.log", Utc::now().timestamp());
    std::env::temp_dir().join(filename)
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG` is honoured, the default level is `info`. Installing twice keeps
/// the first subscriber, so calling this from several tests is harmless.
///
/// # Errors
/// Fails if the log file cannot be created.
pub fn init_logger(kind: LogKind) -> io::Result<LoggerGuard> {
    match kind {
        LogKind::STDOUT => {
            let _ = fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .try_init();

            Ok(LoggerGuard {
                _worker: None,
                path: None,
            })
        }
        LogKind::FILE => {
            let path = log_file_path();
            let file = File::create(&path)?;
            println!("Logging to file: {}", path.display());

            // Non-blocking so the frame handler never waits on the disk.
            let (writer, worker) = tracing_appender::non_blocking(file);
            let _ = fmt()
                .with_env_filter(env_filter())
                .with_ansi(false)
                .with_writer(writer)
                .try_init();

            Ok(LoggerGuard {
                _worker: Some(worker),
                path: Some(path),
            })
        }
    }
}
