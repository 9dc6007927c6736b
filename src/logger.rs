use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result, anyhow};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

static INIT: OnceLock<()> = OnceLock::new();
static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

const APP_DIR: &str = "proxy-mock";
const LOG_FILE: &str = "proxy-mock.log";

/// Where log output goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    File(PathBuf),
    Stderr,
}

/// Install the global subscriber once. Later calls are no-ops, and a
/// subscriber installed by someone else is left alone.
pub fn init() -> Result<()> {
    if INIT.get().is_some() {
        return Ok(());
    }

    init_inner()?;
    let _ = INIT.set(());
    Ok(())
}

fn init_inner() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let writer = match determine_target()? {
        LogTarget::Stderr => {
            let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stderr());
            let _ = GUARD.set(guard);
            non_blocking
        }
        LogTarget::File(log_path) => {
            if let Some(parent) = log_path.parent() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create log directory at {}", parent.display())
                })?;
            }
            let (directory, file_name) = split_path(&log_path)?;
            let file_appender = rolling::never(directory, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let _ = GUARD.set(guard);
            non_blocking
        }
    };

    let result = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_thread_names(true)
                .with_target(false),
        )
        .try_init();
    if result.is_err() {
        // Another global subscriber (e.g. the host test suite's) wins.
        tracing::debug!("tracing subscriber already installed");
    }

    Ok(())
}

fn determine_target() -> Result<LogTarget> {
    if std::env::var("PROXY_MOCK_LOG").is_ok_and(|v| v.eq_ignore_ascii_case("stderr")) {
        return Ok(LogTarget::Stderr);
    }
    Ok(LogTarget::File(determine_log_path()?))
}

fn determine_log_path() -> Result<PathBuf> {
    if let Ok(state_home) = std::env::var("XDG_STATE_HOME")
        && !state_home.is_empty()
    {
        return Ok(PathBuf::from(state_home).join(APP_DIR).join(LOG_FILE));
    }

    // XDG default: ~/.local/state/proxy-mock/proxy-mock.log
    if let Some(home_dir) = home::home_dir() {
        return Ok(home_dir
            .join(".local")
            .join("state")
            .join(APP_DIR)
            .join(LOG_FILE));
    }

    Ok(std::env::current_dir()?.join(LOG_FILE))
}

fn split_path(path: &Path) -> Result<(PathBuf, &str)> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("Invalid log file name"))?;

    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    Ok((dir, file_name))
}
