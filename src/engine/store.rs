//! Run persistence: atomic state writes and the single-writer lock.
//!
//! Every run lives under `runs/<run_id>/`: `state.json` is rewritten
//! atomically on each transition; `.lock` carries an advisory exclusive lock
//! so only one engine task mutates a run at a time.

use crate::artifact::store::write_json_atomic;
use crate::engine::run::{Run, RunStatus};
use crate::errors::StoreError;
use fs2::FileExt;
use std::fs;
use std::path::PathBuf;

pub struct RunStore {
    runs_root: PathBuf,
}

/// Held while a run is being mutated. Dropping releases the lock.
#[derive(Debug)]
pub struct RunGuard {
    file: fs::File,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

impl RunStore {
    pub fn new(runs_root: impl Into<PathBuf>) -> Self {
        Self {
            runs_root: runs_root.into(),
        }
    }

    fn dir_for(&self, run_id: &str) -> PathBuf {
        self.runs_root.join(run_id)
    }

    fn state_path(&self, run_id: &str) -> PathBuf {
        self.dir_for(run_id).join("state.json")
    }

    /// Persist the run record atomically.
    pub fn save(&self, run: &Run) -> Result<(), StoreError> {
        let dir = self.dir_for(&run.run_id);
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        write_json_atomic(&self.state_path(&run.run_id), run)
    }

    pub fn load(&self, run_id: &str) -> Result<Run, StoreError> {
        let path = self.state_path(run_id);
        if !path.exists() {
            return Err(StoreError::RunNotFound {
                run_id: run_id.to_string(),
            });
        }
        let text = fs::read_to_string(&path).map_err(|e| StoreError::io(&path, e))?;
        serde_json::from_str(&text).map_err(|e| StoreError::Serde {
            subject: format!("run {run_id}"),
            source: e,
        })
    }

    /// All run ids, sorted (run ids are time-prefixed, so this is creation
    /// order).
    pub fn list(&self) -> Result<Vec<String>, StoreError> {
        if !self.runs_root.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in
            fs::read_dir(&self.runs_root).map_err(|e| StoreError::io(&self.runs_root, e))?
        {
            let entry = entry.map_err(|e| StoreError::io(&self.runs_root, e))?;
            if entry.path().join("state.json").exists()
                && let Some(name) = entry.file_name().to_str()
            {
                ids.push(name.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Runs that should be rehydrated after a restart.
    pub fn scan_resumable(&self) -> Result<Vec<Run>, StoreError> {
        let mut resumable = Vec::new();
        for run_id in self.list()? {
            let run = self.load(&run_id)?;
            if matches!(run.status, RunStatus::Running | RunStatus::AwaitingConsensus) {
                resumable.push(run);
            }
        }
        Ok(resumable)
    }

    /// Take the single-writer lock for a run. Fails fast when another writer
    /// holds it.
    pub fn lock(&self, run_id: &str) -> Result<RunGuard, StoreError> {
        let dir = self.dir_for(run_id);
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        let path = dir.join(".lock");
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        file.try_lock_exclusive()
            .map_err(|_| StoreError::RunLocked {
                run_id: run_id.to_string(),
            })?;
        Ok(RunGuard { file })
    }

    /// Persist the resolved intake document next to the run state. The raw
    /// document is stored so the digest survives the round trip.
    pub fn save_intake(&self, run_id: &str, intake: &crate::intake::Intake) -> Result<(), StoreError> {
        let dir = self.dir_for(run_id);
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        write_json_atomic(&dir.join("intake.json"), intake.raw())
    }

    /// Reload the resolved intake, revalidating and recomputing its digest.
    pub fn load_intake(&self, run_id: &str) -> Result<crate::intake::Intake, StoreError> {
        let path = self.dir_for(run_id).join("intake.json");
        let text = fs::read_to_string(&path).map_err(|e| StoreError::io(&path, e))?;
        let value: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| StoreError::Serde {
                subject: format!("intake for {run_id}"),
                source: e,
            })?;
        crate::intake::Intake::from_value(value).map_err(|e| StoreError::Serde {
            subject: format!("intake for {run_id}: {e}"),
            source: serde_json::Error::io(std::io::Error::other(e.to_string())),
        })
    }
}
