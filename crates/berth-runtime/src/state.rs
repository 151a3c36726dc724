//! Persistent state management.
//!
//! Maintains a local JSON index of all containers and their current
//! states, so `ps`, `logs`, and `stop` work without a daemon.

use std::io::Write;
use std::path::Path;

use berth_common::error::{BerthError, Result};
use serde::{Deserialize, Serialize};

use crate::container::ContainerRecord;

/// On-disk container index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateFile {
    /// Every known container, oldest first.
    pub containers: Vec<ContainerRecord>,
}

impl StateFile {
    /// Inserts `record`, replacing any record with the same id.
    pub fn upsert(&mut self, record: ContainerRecord) {
        match self.containers.iter_mut().find(|c| c.id == record.id) {
            Some(existing) => *existing = record,
            None => self.containers.push(record),
        }
    }

    /// Resolves a full container id or a unique prefix of one.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if nothing matches and `Config` if the prefix is
    /// ambiguous.
    pub fn find(&self, reference: &str) -> Result<&ContainerRecord> {
        let matches: Vec<&ContainerRecord> = self
            .containers
            .iter()
            .filter(|c| c.id.as_str().starts_with(reference))
            .collect();
        match matches.as_slice() {
            [single] => Ok(single),
            [] => Err(BerthError::NotFound {
                kind: "container",
                id: reference.to_string(),
            }),
            _ => Err(BerthError::Config {
                message: format!("container reference `{reference}` is ambiguous"),
            }),
        }
    }
}

/// Loads the state index from disk. A missing file is an empty index.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_state(path: &Path) -> Result<StateFile> {
    tracing::debug!(path = %path.display(), "loading state index");
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(serde_json::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StateFile::default()),
        Err(e) => Err(BerthError::io(path, e)),
    }
}

/// Persists the state index to disk atomically.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn save_state(path: &Path, state: &StateFile) -> Result<()> {
    tracing::debug!(path = %path.display(), containers = state.containers.len(), "saving state index");
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| BerthError::io(dir, e))?;
    let json = serde_json::to_vec_pretty(state)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| BerthError::io(dir, e))?;
    tmp.write_all(&json).map_err(|e| BerthError::io(tmp.path(), e))?;
    let _ = tmp.persist(path).map_err(|e| BerthError::io(path, e.error))?;
    Ok(())
}

/// Loads the index, applies `update`, and saves it back.
///
/// # Errors
///
/// Returns an error if the index cannot be read or written, or whatever
/// `update` returns.
pub fn update_state<T>(path: &Path, update: impl FnOnce(&mut StateFile) -> Result<T>) -> Result<T> {
    let mut state = load_state(path)?;
    let value = update(&mut state)?;
    save_state(path, &state)?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use berth_common::types::{ContainerId, ContainerState, ImageId, Isolation};

    use super::*;

    fn record(id: &str) -> ContainerRecord {
        ContainerRecord::new(
            ContainerId::new(id),
            ImageId::new("ab12"),
            "chatbot".into(),
            "bot".into(),
            Isolation::Direct,
            PathBuf::from("/data/containers").join(id).join("rootfs"),
        )
    }

    #[test]
    fn missing_file_is_empty_index() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = load_state(&dir.path().join("state.json")).expect("load");
        assert!(state.containers.is_empty());
    }

    #[test]
    fn save_then_load_keeps_lifecycle_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        let mut running = record("c1");
        running.mark_running(4242);
        let mut exited = record("c2");
        exited.mark_exited(3);

        let mut state = StateFile::default();
        state.upsert(running);
        state.upsert(exited);
        save_state(&path, &state).expect("save");

        let loaded = load_state(&path).expect("load");
        assert_eq!(loaded.containers.len(), 2);
        assert_eq!(loaded.containers[0].state, ContainerState::Running);
        assert_eq!(loaded.containers[0].pid, Some(4242));
        assert_eq!(loaded.containers[1].state, ContainerState::Exited);
        assert_eq!(loaded.containers[1].exit_code, Some(3));
    }

    #[test]
    fn upsert_replaces_by_id() {
        let mut state = StateFile::default();
        state.upsert(record("c1"));
        let mut updated = record("c1");
        updated.mark_running(7);
        state.upsert(updated);
        assert_eq!(state.containers.len(), 1);
        assert_eq!(state.containers[0].pid, Some(7));
    }

    #[test]
    fn find_accepts_unique_prefixes_only() {
        let mut state = StateFile::default();
        state.upsert(record("abc123"));
        state.upsert(record("abd456"));
        assert_eq!(state.find("abc").expect("found").id.as_str(), "abc123");
        assert!(matches!(state.find("ab"), Err(BerthError::Config { .. })));
        assert!(matches!(state.find("zz"), Err(BerthError::NotFound { .. })));
    }

    #[test]
    fn update_state_persists_changes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        update_state(&path, |s| {
            s.upsert(record("c1"));
            Ok(())
        })
        .expect("update");
        assert_eq!(load_state(&path).expect("load").containers.len(), 1);
    }
}
