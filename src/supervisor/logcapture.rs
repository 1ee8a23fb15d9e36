//! Per-slot worker log capture.
//!
//! Each spawn appends a banner to `<slot>/logs/worker.log` and hands the same
//! file to the worker as stdout and stderr. Logs are append-only across runs;
//! once the file grows past [`MAX_LOG_BYTES`] it is rotated to `worker.log.1`
//! before the next run starts.

use chrono::Utc;
use slotwarden_common::{RunId, SlotId};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::errors::SupervisorError;

pub const MAX_LOG_BYTES: u64 = 16 * 1024 * 1024;

fn capture_err(path: &Path) -> impl FnOnce(std::io::Error) -> SupervisorError + '_ {
    move |source| SupervisorError::LogCaptureFailed {
        path: path.to_path_buf(),
        source,
    }
}

/// Open the slot log for a new run and return handles for stdout and stderr.
pub fn open(path: &Path, slot: &SlotId, run_id: RunId) -> Result<(File, File), SupervisorError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(capture_err(path))?;
    }
    rotate_if_larger(path, MAX_LOG_BYTES).map_err(capture_err(path))?;

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(capture_err(path))?;
    writeln!(
        file,
        "===== slot {} run {} spawned at {} =====",
        slot,
        run_id,
        Utc::now().to_rfc3339()
    )
    .map_err(capture_err(path))?;

    let stderr = file.try_clone().map_err(capture_err(path))?;
    Ok((file, stderr))
}

/// Move `path` aside to `<path>.1` when it is larger than `max_bytes`.
pub fn rotate_if_larger(path: &Path, max_bytes: u64) -> std::io::Result<bool> {
    let len = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if len <= max_bytes {
        return Ok(false);
    }
    fs::rename(path, rotated_path(path))?;
    Ok(true)
}

fn rotated_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".1");
    path.with_file_name(name)
}

/// Last `lines` lines of a slot log, for `status` output.
pub fn tail(path: &Path, lines: usize) -> std::io::Result<Vec<String>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let content = String::from_utf8_lossy(&bytes);
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    Ok(all[start..].iter().map(|l| l.to_string()).collect())
}
