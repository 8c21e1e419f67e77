//! Run and phase records: the engine's persisted view of one execution.

use crate::budget::TokenUsage;
use crate::config::ExecutionMode;
use crate::governance::GovernanceVerdict;
use crate::ident;
use crate::profile::Profile;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    AwaitingConsensus,
    Paused,
    Failed,
    Completed,
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Completed | Self::Aborted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::AwaitingConsensus => "awaiting_consensus",
            RunStatus::Paused => "paused",
            RunStatus::Failed => "failed",
            RunStatus::Completed => "completed",
            RunStatus::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one phase within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Running,
    Complete,
    Failed,
    Skipped,
}

/// Per-phase execution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase_name: String,
    pub status: PhaseStatus,
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub agent_ids: Vec<String>,
    /// Agents whose last attempt failed; the retry subset.
    #[serde(default)]
    pub failed_agent_ids: Vec<String>,
    #[serde(default)]
    pub artifact_ids: Vec<Uuid>,
    #[serde(default)]
    pub checkpoint_ids: Vec<Uuid>,
    #[serde(default)]
    pub token_usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub governance_verdict: Option<GovernanceVerdict>,
    /// Most recent structured failure, when the phase did not complete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Remediation hints from the last failed gate or agent.
    #[serde(default)]
    pub remediation_hints: Vec<String>,
}

impl PhaseRecord {
    pub fn new(phase_name: &str) -> Self {
        Self {
            phase_name: phase_name.to_string(),
            status: PhaseStatus::Pending,
            attempt_count: 0,
            started_at: None,
            ended_at: None,
            agent_ids: Vec::new(),
            failed_agent_ids: Vec::new(),
            artifact_ids: Vec::new(),
            checkpoint_ids: Vec::new(),
            token_usage: TokenUsage::default(),
            governance_verdict: None,
            last_error: None,
            remediation_hints: Vec::new(),
        }
    }
}

/// One end-to-end execution from intake to terminal status. Owned
/// exclusively by the engine; persisted atomically on every transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub profile: Profile,
    pub intake_digest: String,
    pub status: RunStatus,
    pub execution_mode: ExecutionMode,
    /// Phase currently executing or about to execute; `None` once completed.
    pub current_phase: Option<String>,
    /// Completed phases, a prefix of the profile's phase order.
    pub completed_phases: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub phase_records: BTreeMap<String, PhaseRecord>,
}

impl Run {
    pub fn new(profile: Profile, intake_digest: &str, execution_mode: ExecutionMode) -> Self {
        let now = Utc::now();
        Self {
            run_id: ident::new_run_id(now),
            profile,
            intake_digest: intake_digest.to_string(),
            status: RunStatus::Running,
            execution_mode,
            current_phase: profile.phases().first().map(|p| p.to_string()),
            completed_phases: Vec::new(),
            created_at: now,
            updated_at: now,
            metadata: BTreeMap::new(),
            phase_records: BTreeMap::new(),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Record for a phase, creating a pending one on first access.
    pub fn phase_record_mut(&mut self, phase: &str) -> &mut PhaseRecord {
        self.phase_records
            .entry(phase.to_string())
            .or_insert_with(|| PhaseRecord::new(phase))
    }

    /// Move the cursor past the current phase. Returns false when the graph
    /// is exhausted and the run is complete.
    pub fn advance(&mut self) -> bool {
        let Some(current) = self.current_phase.clone() else {
            return false;
        };
        self.completed_phases.push(current.clone());
        match self.profile.next_phase(&current) {
            Some(next) => {
                self.current_phase = Some(next.to_string());
                true
            }
            None => {
                self.current_phase = None;
                self.status = RunStatus::Completed;
                false
            }
        }
    }

    /// Sum of per-phase token usage.
    pub fn total_token_usage(&self) -> TokenUsage {
        let mut total = TokenUsage::default();
        for record in self.phase_records.values() {
            total += record.token_usage;
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_run_starts_at_first_phase() {
        let run = Run::new(Profile::Analytics, "digest", ExecutionMode::Direct);
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.current_phase.as_deref(), Some("planning"));
        assert!(run.completed_phases.is_empty());
        assert!(run.run_id.starts_with("run-"));
    }

    #[test]
    fn test_advance_walks_the_graph() {
        let mut run = Run::new(Profile::Analytics, "digest", ExecutionMode::Direct);
        assert!(run.advance());
        assert_eq!(run.completed_phases, vec!["planning"]);
        assert_eq!(run.current_phase.as_deref(), Some("architecture"));
    }

    #[test]
    fn test_advance_past_last_phase_completes() {
        let mut run = Run::new(Profile::Analytics, "digest", ExecutionMode::Direct);
        while run.advance() {}
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.current_phase.is_none());
        assert_eq!(run.completed_phases, Profile::Analytics.phases());
    }

    #[test]
    fn test_completed_phases_prefix_invariant() {
        let mut run = Run::new(Profile::Ml, "digest", ExecutionMode::Direct);
        run.advance();
        run.advance();
        let phases = Profile::Ml.phases();
        assert_eq!(run.completed_phases, &phases[..2]);
    }

    #[test]
    fn test_total_token_usage_sums_phases() {
        let mut run = Run::new(Profile::Analytics, "digest", ExecutionMode::Direct);
        run.phase_record_mut("planning").token_usage = TokenUsage::new(100, 50, 0.1);
        run.phase_record_mut("architecture").token_usage = TokenUsage::new(200, 100, 0.2);

        let total = run.total_token_usage();
        assert_eq!(total.input_tokens, 300);
        assert_eq!(total.output_tokens, 150);
    }

    #[test]
    fn test_status_terminal_classification() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Aborted.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::AwaitingConsensus.is_terminal());
        assert!(!RunStatus::Paused.is_terminal());
    }
}
