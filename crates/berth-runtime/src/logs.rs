//! Container log files.
//!
//! One file per container under `<data_dir>/logs/`. The engine writes
//! lifecycle events; captured entry process output goes to the same file.

use std::io::Write;
use std::path::{Path, PathBuf};

use berth_common::error::{BerthError, Result};
use berth_common::types::ContainerId;

/// Returns the log file path for a container.
#[must_use]
pub fn log_path(data_dir: &Path, id: &ContainerId) -> PathBuf {
    data_dir.join("logs").join(format!("{id}.log"))
}

/// Reads a container's log. A log that does not exist yet reads as empty.
///
/// With `tail`, only the last `tail` lines are returned.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read.
pub fn read_logs(data_dir: &Path, id: &ContainerId, tail: Option<usize>) -> Result<String> {
    let path = log_path(data_dir, id);
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => return Err(BerthError::io(path, e)),
    };
    let Some(n) = tail else {
        return Ok(content);
    };
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(n);
    let mut out = lines[start..].join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    Ok(out)
}

/// Appends a timestamped lifecycle event to a container's log.
///
/// # Errors
///
/// Returns an error if the directory or file cannot be created or written.
pub fn append_event(data_dir: &Path, id: &ContainerId, event: &str) -> Result<()> {
    let path = log_path(data_dir, id);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| BerthError::io(parent, e))?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| BerthError::io(&path, e))?;
    let stamp = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    writeln!(file, "[{stamp}] berth: {event}").map_err(|e| BerthError::io(path, e))
}
