//! Run summaries and usage reports for external drivers.

use crate::budget::{BudgetReport, TokenUsage};
use crate::engine::run::{Run, RunStatus};
use crate::profile::Profile;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maximum remediation hints surfaced to the operator.
const MAX_HINTS: usize = 3;

/// Exit code a driver should use for a run awaiting human review.
pub const EXIT_AWAITING_CONSENSUS: i32 = 10;

/// Snapshot of a run for the `status` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub profile: Profile,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<String>,
    pub completed_phases: Vec<String>,
    pub token_usage: TokenUsage,
    /// Most recent structured error, when one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Up to three remediation hints from the last failed gate or agent.
    #[serde(default)]
    pub remediation_hints: Vec<String>,
}

impl RunSummary {
    pub fn from_run(run: &Run) -> Self {
        // The most recently started record carrying an error wins.
        let failing = run
            .phase_records
            .values()
            .filter(|r| r.last_error.is_some())
            .max_by_key(|r| r.started_at);

        Self {
            run_id: run.run_id.clone(),
            profile: run.profile,
            status: run.status,
            current_phase: run.current_phase.clone(),
            completed_phases: run.completed_phases.clone(),
            token_usage: run.total_token_usage(),
            last_error: failing.and_then(|r| r.last_error.clone()),
            remediation_hints: failing
                .map(|r| r.remediation_hints.iter().take(MAX_HINTS).cloned().collect())
                .unwrap_or_default(),
        }
    }

    /// Process exit code for drivers: 0 on success, non-zero on
    /// failure/abort, a distinct code while consensus is pending.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Completed => 0,
            RunStatus::Failed | RunStatus::Aborted => 1,
            RunStatus::AwaitingConsensus => EXIT_AWAITING_CONSENSUS,
            RunStatus::Running | RunStatus::Paused => 2,
        }
    }
}

/// Usage breakdown for the `metrics` command. Phase totals come from the
/// persisted run record; per-agent rows come from the live ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageReport {
    pub run_id: String,
    pub total: TokenUsage,
    pub by_phase: BTreeMap<String, TokenUsage>,
    pub by_agent: BTreeMap<String, TokenUsage>,
}

pub fn usage_report(run: &Run, ledger: &BudgetReport) -> UsageReport {
    UsageReport {
        run_id: run.run_id.clone(),
        total: run.total_token_usage(),
        by_phase: run
            .phase_records
            .iter()
            .map(|(phase, record)| (phase.clone(), record.token_usage))
            .collect(),
        by_agent: ledger.by_agent.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionMode;

    #[test]
    fn test_summary_surfaces_latest_error() {
        let mut run = Run::new(Profile::Ml, "digest", ExecutionMode::Direct);
        {
            let record = run.phase_record_mut("planning");
            record.started_at = Some(chrono::Utc::now() - chrono::Duration::minutes(10));
            record.last_error = Some("old error".to_string());
        }
        {
            let record = run.phase_record_mut("development");
            record.started_at = Some(chrono::Utc::now());
            record.last_error = Some("schema violation".to_string());
            record.remediation_hints = vec![
                "hint 1".to_string(),
                "hint 2".to_string(),
                "hint 3".to_string(),
                "hint 4".to_string(),
            ];
        }

        let summary = RunSummary::from_run(&run);
        assert_eq!(summary.last_error.as_deref(), Some("schema violation"));
        assert_eq!(summary.remediation_hints.len(), 3);
    }

    #[test]
    fn test_exit_codes() {
        let mut run = Run::new(Profile::Analytics, "digest", ExecutionMode::Direct);
        assert_eq!(RunSummary::from_run(&run).exit_code(), 2);

        run.status = RunStatus::Completed;
        assert_eq!(RunSummary::from_run(&run).exit_code(), 0);

        run.status = RunStatus::AwaitingConsensus;
        assert_eq!(
            RunSummary::from_run(&run).exit_code(),
            EXIT_AWAITING_CONSENSUS
        );

        run.status = RunStatus::Aborted;
        assert_eq!(RunSummary::from_run(&run).exit_code(), 1);
    }

    #[test]
    fn test_usage_report_merges_sources() {
        let mut run = Run::new(Profile::Analytics, "digest", ExecutionMode::Direct);
        run.phase_record_mut("planning").token_usage = TokenUsage::new(100, 50, 0.1);

        let ledger = BudgetReport {
            run_id: run.run_id.clone(),
            total: TokenUsage::default(),
            by_phase: BTreeMap::new(),
            by_agent: BTreeMap::from([(
                "planning/project_planner".to_string(),
                TokenUsage::new(100, 50, 0.1),
            )]),
        };

        let report = usage_report(&run, &ledger);
        assert_eq!(report.total.input_tokens, 100);
        assert_eq!(report.by_phase["planning"].output_tokens, 50);
        assert!(report.by_agent.contains_key("planning/project_planner"));
    }
}
