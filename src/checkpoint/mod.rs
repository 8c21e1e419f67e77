//! Checkpoint types: versioned snapshots around phase boundaries.
//!
//! A checkpoint freezes the run state, the agent states, and a pin set of
//! artifact hashes. Cross-entity references are ids; the only parent link is
//! the one-way `parent_checkpoint_id` from a rollback checkpoint to its
//! target.

use crate::agent::AgentStatus;
use crate::budget::TokenUsage;
use crate::config::ExecutionMode;
use crate::engine::run::{Run, RunStatus};
use crate::governance::GateResult;
use crate::profile::Profile;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub mod store;
pub use store::{CheckpointSpec, CheckpointStore};

/// Where in the phase boundary a checkpoint was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    Pre,
    Post,
    PostFailed,
    PreRollback,
}

impl CheckpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointKind::Pre => "pre",
            CheckpointKind::Post => "post",
            CheckpointKind::PostFailed => "post_failed",
            CheckpointKind::PreRollback => "pre_rollback",
        }
    }

    /// Sort rank within one (phase, version) group.
    pub fn rank(&self) -> u8 {
        match self {
            CheckpointKind::Pre => 0,
            CheckpointKind::Post => 1,
            CheckpointKind::PostFailed => 2,
            CheckpointKind::PreRollback => 3,
        }
    }
}

impl std::fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pinned artifact: enough to find and verify its bytes later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPin {
    /// Blob-store-relative path of the content.
    pub stable_path: String,
    pub blob_hash: String,
    pub size: u64,
}

/// Frozen view of one agent's terminal state at snapshot time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStateSnapshot {
    pub status: AgentStatus,
    pub token_usage: TokenUsage,
    pub output_summary: String,
}

/// Frozen fields of the run record at snapshot time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorState {
    pub status: RunStatus,
    pub profile: Profile,
    pub intake_digest: String,
    pub execution_mode: ExecutionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<String>,
    pub completed_phases: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl OrchestratorState {
    pub fn from_run(run: &Run) -> Self {
        Self {
            status: run.status,
            profile: run.profile,
            intake_digest: run.intake_digest.clone(),
            execution_mode: run.execution_mode,
            current_phase: run.current_phase.clone(),
            completed_phases: run.completed_phases.clone(),
            metadata: run.metadata.clone(),
        }
    }
}

/// A versioned snapshot around a phase boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: Uuid,
    pub run_id: String,
    pub phase: String,
    /// Position of the phase in the profile graph, for stable listing.
    pub phase_order: u32,
    pub kind: CheckpointKind,
    /// Monotonic per (run, phase, kind).
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_checkpoint_id: Option<Uuid>,
    pub orchestrator_state: OrchestratorState,
    #[serde(default)]
    pub agent_states: BTreeMap<String, AgentStateSnapshot>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, ArtifactPin>,
    #[serde(default)]
    pub governance_results: Vec<GateResult>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Digest over the checkpoint content with this field blanked; verified
    /// on load.
    #[serde(default)]
    pub content_digest: String,
}

/// Difference between two checkpoints' pinned artifacts and agent states.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed_artifacts: Vec<String>,
    pub changed_agents: Vec<String>,
}

impl CheckpointDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.changed_artifacts.is_empty()
            && self.changed_agents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_and_ranks() {
        assert_eq!(CheckpointKind::PostFailed.as_str(), "post_failed");
        assert!(CheckpointKind::Pre.rank() < CheckpointKind::Post.rank());
        assert!(CheckpointKind::Post.rank() < CheckpointKind::PreRollback.rank());
    }

    #[test]
    fn test_orchestrator_state_freezes_run_fields() {
        let mut run = Run::new(Profile::Ml, "digest-1", ExecutionMode::Sandboxed);
        run.advance();
        run.metadata.insert("client".to_string(), "acme".to_string());

        let state = OrchestratorState::from_run(&run);
        assert_eq!(state.profile, Profile::Ml);
        assert_eq!(state.completed_phases, vec!["planning"]);
        assert_eq!(state.current_phase.as_deref(), Some("architecture"));
        assert_eq!(state.execution_mode, ExecutionMode::Sandboxed);
        assert_eq!(state.metadata["client"], "acme");

        // Later run mutations do not leak into the frozen state
        run.advance();
        assert_eq!(state.completed_phases, vec!["planning"]);
    }

    #[test]
    fn test_diff_empty() {
        assert!(CheckpointDiff::default().is_empty());
        let diff = CheckpointDiff {
            added: vec!["x".to_string()],
            ..Default::default()
        };
        assert!(!diff.is_empty());
    }
}
