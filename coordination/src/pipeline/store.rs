//! Case persistence
//!
//! The stepper reloads state before every mutation and writes it back only
//! after the whole step has been computed, so a failed write leaves the
//! previous state on disk intact.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::error::{PipelineError, PipelineResult};
use super::stage::Stage;
use super::state::CaseState;
use crate::atomic_file::{write_atomic, write_json_atomic};

/// Where case state and stage artifacts live
pub trait CaseStore: Send + Sync {
    fn load_state(&self, case_id: &str) -> PipelineResult<Option<CaseState>>;
    fn save_state(&self, state: &CaseState) -> PipelineResult<()>;
    fn load_artifact(&self, case_id: &str, stage: Stage) -> PipelineResult<Option<Vec<u8>>>;
    fn save_artifact(&self, case_id: &str, stage: Stage, bytes: &[u8]) -> PipelineResult<()>;
    fn remove_artifact(&self, case_id: &str, stage: Stage) -> PipelineResult<()>;
}

/// Shared reference to a case store
pub type SharedCaseStore = Arc<dyn CaseStore>;

/// Reject ids that would escape the store root
fn validate_case_id(case_id: &str) -> PipelineResult<()> {
    let bad = case_id.is_empty()
        || case_id == "."
        || case_id == ".."
        || case_id.contains(['/', '\\'])
        || case_id.contains('\0');
    if bad {
        return Err(PipelineError::InvalidCaseId(case_id.to_string()));
    }
    Ok(())
}

/// File-backed store: `<root>/<case_id>/state.json` plus one
/// `<family>.json` per produced artifact
#[derive(Debug, Clone)]
pub struct FileCaseStore {
    root: PathBuf,
}

impl FileCaseStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn case_dir(&self, case_id: &str) -> PathBuf {
        self.root.join(case_id)
    }

    pub fn state_path(&self, case_id: &str) -> PathBuf {
        self.case_dir(case_id).join("state.json")
    }

    pub fn artifact_path(&self, case_id: &str, stage: Stage) -> PathBuf {
        self.case_dir(case_id).join(format!("{}.json", stage.family()))
    }

    fn read_optional(&self, case_id: &str, path: &Path) -> PipelineResult<Option<Vec<u8>>> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PipelineError::persistence(case_id, path, e)),
        }
    }
}

impl CaseStore for FileCaseStore {
    fn load_state(&self, case_id: &str) -> PipelineResult<Option<CaseState>> {
        validate_case_id(case_id)?;
        let path = self.state_path(case_id);
        let Some(bytes) = self.read_optional(case_id, &path)? else {
            return Ok(None);
        };
        let state = serde_json::from_slice(&bytes).map_err(|e| PipelineError::CorruptState {
            case_id: case_id.to_string(),
            message: e.to_string(),
        })?;
        Ok(Some(state))
    }

    fn save_state(&self, state: &CaseState) -> PipelineResult<()> {
        validate_case_id(&state.case_id)?;
        let path = self.state_path(&state.case_id);
        write_json_atomic(&path, state)
            .map_err(|e| PipelineError::persistence(&state.case_id, path, e))
    }

    fn load_artifact(&self, case_id: &str, stage: Stage) -> PipelineResult<Option<Vec<u8>>> {
        validate_case_id(case_id)?;
        self.read_optional(case_id, &self.artifact_path(case_id, stage))
    }

    fn save_artifact(&self, case_id: &str, stage: Stage, bytes: &[u8]) -> PipelineResult<()> {
        validate_case_id(case_id)?;
        let path = self.artifact_path(case_id, stage);
        write_atomic(&path, bytes).map_err(|e| PipelineError::persistence(case_id, path, e))
    }

    fn remove_artifact(&self, case_id: &str, stage: Stage) -> PipelineResult<()> {
        validate_case_id(case_id)?;
        let path = self.artifact_path(case_id, stage);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PipelineError::persistence(case_id, path, e)),
        }
    }
}

#[derive(Default)]
struct MemoryInner {
    states: HashMap<String, CaseState>,
    artifacts: HashMap<(String, Stage), Vec<u8>>,
}

/// In-memory store for in-process runs and tests
#[derive(Default)]
pub struct MemoryCaseStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryCaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> SharedCaseStore {
        Arc::new(self)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        // A poisoned lock only means another thread panicked mid-test; the maps stay usable.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl CaseStore for MemoryCaseStore {
    fn load_state(&self, case_id: &str) -> PipelineResult<Option<CaseState>> {
        Ok(self.lock().states.get(case_id).cloned())
    }

    fn save_state(&self, state: &CaseState) -> PipelineResult<()> {
        self.lock()
            .states
            .insert(state.case_id.clone(), state.clone());
        Ok(())
    }

    fn load_artifact(&self, case_id: &str, stage: Stage) -> PipelineResult<Option<Vec<u8>>> {
        Ok(self
            .lock()
            .artifacts
            .get(&(case_id.to_string(), stage))
            .cloned())
    }

    fn save_artifact(&self, case_id: &str, stage: Stage, bytes: &[u8]) -> PipelineResult<()> {
        self.lock()
            .artifacts
            .insert((case_id.to_string(), stage), bytes.to_vec());
        Ok(())
    }

    fn remove_artifact(&self, case_id: &str, stage: Stage) -> PipelineResult<()> {
        self.lock().artifacts.remove(&(case_id.to_string(), stage));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_store_state_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FileCaseStore::new(dir.path());
        assert!(store.load_state("case-1").unwrap().is_none());

        let mut state = CaseState::new("case-1");
        state.advance(Stage::Recall, "START", "start pipeline");
        store.save_state(&state).unwrap();

        let loaded = store.load_state("case-1").unwrap().unwrap();
        assert_eq!(loaded.current_stage, Stage::Recall);
        assert_eq!(loaded.history.len(), 1);
        assert!(dir.path().join("case-1/state.json").exists());
    }

    #[test]
    fn test_file_store_artifacts() {
        let dir = TempDir::new().unwrap();
        let store = FileCaseStore::new(dir.path());
        store
            .save_artifact("case-1", Stage::Triage, br#"{"symptom_category":"infra"}"#)
            .unwrap();
        assert!(dir.path().join("case-1/triage.json").exists());
        assert!(store.load_artifact("case-1", Stage::Triage).unwrap().is_some());
        store.remove_artifact("case-1", Stage::Triage).unwrap();
        store.remove_artifact("case-1", Stage::Triage).unwrap();
        assert!(store.load_artifact("case-1", Stage::Triage).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_state_is_reported() {
        let dir = TempDir::new().unwrap();
        let store = FileCaseStore::new(dir.path());
        std::fs::create_dir_all(dir.path().join("case-1")).unwrap();
        std::fs::write(dir.path().join("case-1/state.json"), b"{oops").unwrap();
        let err = store.load_state("case-1").unwrap_err();
        assert!(matches!(err, PipelineError::CorruptState { .. }));
    }

    #[test]
    fn test_path_traversal_case_id_rejected() {
        let dir = TempDir::new().unwrap();
        let store = FileCaseStore::new(dir.path());
        assert!(matches!(
            store.load_state("../escape"),
            Err(PipelineError::InvalidCaseId(_))
        ));
    }
}
