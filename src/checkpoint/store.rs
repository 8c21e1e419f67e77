//! Checkpoint persistence, versioning, rollback, and comparison.
//!
//! Layout: `runs/<run_id>/checkpoints/<phase>_<kind>_v<n>.json`. Writes use
//! write-then-fsync-then-rename; a half-written `.tmp` left by a crash is
//! discarded on scan. Each file embeds a digest of its own content; a
//! mismatch on load is an integrity failure, never silently ignored.

use crate::artifact::ArtifactStore;
use crate::artifact::store::write_json_atomic;
use crate::checkpoint::{
    ArtifactPin, Checkpoint, CheckpointDiff, CheckpointKind, OrchestratorState,
};
use crate::engine::run::Run;
use crate::errors::StoreError;
use crate::ident;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// Inputs for creating one checkpoint.
pub struct CheckpointSpec {
    pub run_id: String,
    pub phase: String,
    pub phase_order: u32,
    pub kind: CheckpointKind,
    pub orchestrator_state: OrchestratorState,
    pub agent_states: BTreeMap<String, crate::checkpoint::AgentStateSnapshot>,
    pub artifacts: BTreeMap<String, ArtifactPin>,
    pub governance_results: Vec<crate::governance::GateResult>,
    pub parent_checkpoint_id: Option<Uuid>,
    pub duration_ms: u64,
    pub metadata: BTreeMap<String, String>,
}

impl CheckpointSpec {
    pub fn new(run: &Run, phase: &str, kind: CheckpointKind) -> Self {
        Self {
            run_id: run.run_id.clone(),
            phase: phase.to_string(),
            phase_order: run.profile.phase_order(phase).unwrap_or_default() as u32,
            kind,
            orchestrator_state: OrchestratorState::from_run(run),
            agent_states: BTreeMap::new(),
            artifacts: BTreeMap::new(),
            governance_results: Vec::new(),
            parent_checkpoint_id: None,
            duration_ms: 0,
            metadata: BTreeMap::new(),
        }
    }
}

/// Versioned checkpoint storage. Single writer per run (enforced by the
/// engine); any number of readers.
pub struct CheckpointStore {
    runs_root: PathBuf,
}

impl CheckpointStore {
    pub fn new(runs_root: impl Into<PathBuf>) -> Self {
        Self {
            runs_root: runs_root.into(),
        }
    }

    fn dir_for(&self, run_id: &str) -> PathBuf {
        self.runs_root.join(run_id).join("checkpoints")
    }

    fn file_name(phase: &str, kind: CheckpointKind, version: u32) -> String {
        format!("{phase}_{kind}_v{version}.json")
    }

    /// Create a new checkpoint. The version is one past the highest existing
    /// version for the same (run, phase, kind).
    pub fn create(&self, spec: CheckpointSpec) -> Result<Checkpoint, StoreError> {
        let dir = self.dir_for(&spec.run_id);
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;

        let version = self.next_version(&spec.run_id, &spec.phase, spec.kind)?;
        let mut checkpoint = Checkpoint {
            checkpoint_id: Uuid::new_v4(),
            run_id: spec.run_id,
            phase: spec.phase,
            phase_order: spec.phase_order,
            kind: spec.kind,
            version,
            created_at: chrono::Utc::now(),
            duration_ms: spec.duration_ms,
            parent_checkpoint_id: spec.parent_checkpoint_id,
            orchestrator_state: spec.orchestrator_state,
            agent_states: spec.agent_states,
            artifacts: spec.artifacts,
            governance_results: spec.governance_results,
            metadata: spec.metadata,
            content_digest: String::new(),
        };
        checkpoint.content_digest = digest_of(&checkpoint)?;

        let path = dir.join(Self::file_name(&checkpoint.phase, checkpoint.kind, version));
        write_json_atomic(&path, &checkpoint)?;
        info!(
            run_id = %checkpoint.run_id,
            phase = %checkpoint.phase,
            kind = %checkpoint.kind,
            version,
            "checkpoint created"
        );
        Ok(checkpoint)
    }

    /// Load a checkpoint by id, verifying its content digest.
    pub fn load(&self, run_id: &str, checkpoint_id: &Uuid) -> Result<Checkpoint, StoreError> {
        self.list_for_run(run_id)?
            .into_iter()
            .find(|c| &c.checkpoint_id == checkpoint_id)
            .ok_or_else(|| StoreError::CheckpointNotFound {
                checkpoint_id: checkpoint_id.to_string(),
            })
    }

    /// All checkpoints for a run, ordered by (phase_order, version, kind).
    pub fn list_for_run(&self, run_id: &str) -> Result<Vec<Checkpoint>, StoreError> {
        let dir = self.dir_for(run_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut checkpoints = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))? {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                checkpoints.push(self.load_file(&path)?);
            }
        }
        checkpoints.sort_by_key(|c| (c.phase_order, c.version, c.kind.rank()));
        Ok(checkpoints)
    }

    /// The most recent checkpoint of a kind for a phase, if any.
    pub fn latest(
        &self,
        run_id: &str,
        phase: &str,
        kind: CheckpointKind,
    ) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self
            .list_for_run(run_id)?
            .into_iter()
            .filter(|c| c.phase == phase && c.kind == kind)
            .max_by_key(|c| c.version))
    }

    /// Remove half-written temp files left behind by a crash.
    pub fn discard_partial(&self, run_id: &str) -> Result<usize, StoreError> {
        let dir = self.dir_for(run_id);
        if !dir.exists() {
            return Ok(0);
        }
        let mut discarded = 0;
        for entry in fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))? {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            let path = entry.path();
            if path.extension().map(|e| e == "tmp").unwrap_or(false) {
                warn!(path = %path.display(), "discarding half-written checkpoint");
                fs::remove_file(&path).map_err(|e| StoreError::io(&path, e))?;
                discarded += 1;
            }
        }
        Ok(discarded)
    }

    /// Roll the run back to a target checkpoint.
    ///
    /// Restores the run cursor from the target's frozen state, archives the
    /// manifests of phases past the restored point (blobs stay), and records
    /// a new `pre_rollback` checkpoint parented on the target. The run record
    /// is only mutated after every file operation succeeded.
    pub fn rollback(
        &self,
        run: &mut Run,
        target_checkpoint_id: &Uuid,
        artifacts: &ArtifactStore,
    ) -> Result<Checkpoint, StoreError> {
        let start = Instant::now();
        let target = self.load(&run.run_id, target_checkpoint_id)?;

        let restored_completed = target.orchestrator_state.completed_phases.clone();
        let restored_current = target
            .orchestrator_state
            .current_phase
            .clone()
            .or_else(|| Some(target.phase.clone()));

        // Pin set of the state being restored: only artifacts from phases
        // that remain completed.
        let manifest = artifacts.load_manifest(&run.run_id)?;
        let mut pins: BTreeMap<String, ArtifactPin> = BTreeMap::new();
        for entry in &manifest.entries {
            if restored_completed.contains(&entry.producing_phase) {
                pins.insert(
                    entry.logical_name.clone(),
                    ArtifactPin {
                        stable_path: ident::blob_rel_path(&entry.blob_hash)
                            .display()
                            .to_string(),
                        blob_hash: entry.blob_hash.clone(),
                        size: entry.size,
                    },
                );
            }
        }

        let mut rollback_state = target.orchestrator_state.clone();
        rollback_state.completed_phases = restored_completed.clone();
        rollback_state.current_phase = restored_current.clone();

        let spec = CheckpointSpec {
            run_id: run.run_id.clone(),
            phase: target.phase.clone(),
            phase_order: target.phase_order,
            kind: CheckpointKind::PreRollback,
            orchestrator_state: rollback_state,
            agent_states: target.agent_states.clone(),
            artifacts: pins,
            governance_results: Vec::new(),
            parent_checkpoint_id: Some(target.checkpoint_id),
            duration_ms: start.elapsed().as_millis() as u64,
            metadata: BTreeMap::new(),
        };
        let checkpoint = self.create(spec)?;

        if let Err(e) = artifacts.archive_after(&run.run_id, &restored_completed) {
            // Undo the checkpoint so a failed rollback leaves no trace.
            let path = self.dir_for(&run.run_id).join(Self::file_name(
                &checkpoint.phase,
                checkpoint.kind,
                checkpoint.version,
            ));
            let _ = fs::remove_file(path);
            return Err(e);
        }

        run.completed_phases = restored_completed;
        run.current_phase = restored_current;
        run.touch();

        info!(
            run_id = %run.run_id,
            target = %target_checkpoint_id,
            phase = %checkpoint.phase,
            "rollback performed"
        );
        Ok(checkpoint)
    }

    /// Compare two checkpoints' pinned artifacts and agent states.
    pub fn compare(&self, a: &Checkpoint, b: &Checkpoint) -> CheckpointDiff {
        let mut diff = CheckpointDiff::default();

        for (name, pin) in &b.artifacts {
            match a.artifacts.get(name) {
                None => diff.added.push(name.clone()),
                Some(prev) if prev.blob_hash != pin.blob_hash => {
                    diff.changed_artifacts.push(name.clone());
                }
                Some(_) => {}
            }
        }
        for name in a.artifacts.keys() {
            if !b.artifacts.contains_key(name) {
                diff.removed.push(name.clone());
            }
        }
        for (agent_id, state) in &b.agent_states {
            match a.agent_states.get(agent_id) {
                None => diff.changed_agents.push(agent_id.clone()),
                Some(prev)
                    if prev.status != state.status
                        || prev.token_usage != state.token_usage =>
                {
                    diff.changed_agents.push(agent_id.clone());
                }
                Some(_) => {}
            }
        }
        for agent_id in a.agent_states.keys() {
            if !b.agent_states.contains_key(agent_id) {
                diff.changed_agents.push(agent_id.clone());
            }
        }
        diff
    }

    fn next_version(
        &self,
        run_id: &str,
        phase: &str,
        kind: CheckpointKind,
    ) -> Result<u32, StoreError> {
        let max = self
            .list_for_run(run_id)?
            .into_iter()
            .filter(|c| c.phase == phase && c.kind == kind)
            .map(|c| c.version)
            .max()
            .unwrap_or(0);
        Ok(max + 1)
    }

    fn load_file(&self, path: &PathBuf) -> Result<Checkpoint, StoreError> {
        let text = fs::read_to_string(path).map_err(|e| StoreError::io(path, e))?;
        let checkpoint: Checkpoint =
            serde_json::from_str(&text).map_err(|e| StoreError::Serde {
                subject: path.display().to_string(),
                source: e,
            })?;

        let expected = checkpoint.content_digest.clone();
        let actual = digest_of(&checkpoint)?;
        if expected != actual {
            return Err(StoreError::Integrity {
                subject: format!("checkpoint {}", checkpoint.checkpoint_id),
                expected,
                actual,
            });
        }
        Ok(checkpoint)
    }
}

/// Digest of a checkpoint with its digest field blanked.
fn digest_of(checkpoint: &Checkpoint) -> Result<String, StoreError> {
    let mut blank = checkpoint.clone();
    blank.content_digest = String::new();
    let value = serde_json::to_value(&blank).map_err(|e| StoreError::Serde {
        subject: "checkpoint digest".to_string(),
        source: e,
    })?;
    Ok(ident::digest_json(&value))
}
