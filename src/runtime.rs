//! Process facts reported by `/version` and the pid file written at startup.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::Serialize;

static STARTED: OnceLock<(Instant, u64)> = OnceLock::new();

/// Pins the process start time; later calls keep the first value.
pub fn mark_started() {
    STARTED.get_or_init(|| {
        let unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        (Instant::now(), unix)
    });
}

#[derive(Debug, Serialize)]
pub struct ProcessInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub commit: &'static str,
    pub pid: u32,
    pub started_at: u64,
    pub uptime_secs: u64,
    pub inflight_fetches: usize,
}

pub fn process_info(inflight_fetches: usize) -> ProcessInfo {
    mark_started();
    let (since, started_at) = STARTED.get().copied().unwrap_or((Instant::now(), 0));
    ProcessInfo {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        commit: option_env!("GIT_REV").unwrap_or("unknown"),
        pid: std::process::id(),
        started_at,
        uptime_secs: since.elapsed().as_secs(),
        inflight_fetches,
    }
}

/// Pid file that is removed again when the guard is dropped.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create pid dir {}", parent.display()))?;
        }
        std::fs::write(path, std::process::id().to_string())
            .with_context(|| format!("write pid file {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            log::debug!("remove pid file {}: {err}", self.path.display());
        }
    }
}
