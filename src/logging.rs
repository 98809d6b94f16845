use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::Subscriber;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

pub use crate::config::default_log_file_path;

/// Overrides the level passed to [`init_log_file`], in env-filter syntax.
pub const LOG_ENV: &str = "RTM_LOG";

/// Installs the global subscriber: a fresh log file per run, mirrored to
/// stdout. A subscriber that is already installed is left alone.
pub fn init_log_file(path: &Path, level: &str) -> Result<()> {
    let subscriber = build_subscriber(path, level, true)?;
    let _ = tracing::subscriber::set_global_default(subscriber);
    Ok(())
}

pub fn init_default_log_file(level: &str) -> Result<PathBuf> {
    let path = default_log_file_path();
    init_log_file(&path, level)?;
    Ok(path)
}

fn build_subscriber(
    path: &Path,
    level: &str,
    mirror_to_stdout: bool,
) -> Result<impl Subscriber + Send + Sync + 'static> {
    let file = open_truncated(path)?;
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = fmt::layer()
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(true);
    let stdout_layer = mirror_to_stdout.then(|| fmt::layer().with_writer(std::io::stdout));

    Ok(tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stdout_layer))
}

fn open_truncated(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))
}
