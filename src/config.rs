//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default per-agent timeout (30 minutes).
const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 1800;

/// Default concurrent agents per phase.
const DEFAULT_CONCURRENCY_LIMIT: usize = 4;

/// Default per-agent retry budget for transient failures.
const DEFAULT_RETRY_BUDGET: u32 = 2;

/// Default budget alert threshold (fraction of limit).
const DEFAULT_ALERT_THRESHOLD: f64 = 0.8;

/// How agent side effects are isolated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Agents run with host filesystem and network access.
    #[default]
    Direct,
    /// Agents are confined to their working directory; network denied.
    Sandboxed,
}

/// Token limits per budget scope level. `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BudgetLimits {
    pub run_tokens: Option<u64>,
    pub phase_tokens: Option<u64>,
    pub agent_tokens: Option<u64>,
    pub tool_tokens: Option<u64>,
}

impl BudgetLimits {
    pub fn with_run_tokens(mut self, limit: u64) -> Self {
        self.run_tokens = Some(limit);
        self
    }

    pub fn with_phase_tokens(mut self, limit: u64) -> Self {
        self.phase_tokens = Some(limit);
        self
    }

    pub fn with_agent_tokens(mut self, limit: u64) -> Self {
        self.agent_tokens = Some(limit);
        self
    }

    pub fn with_tool_tokens(mut self, limit: u64) -> Self {
        self.tool_tokens = Some(limit);
        self
    }
}

/// Configuration for the run engine and its components.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory for runs, checkpoints, artifacts, and policies.
    pub storage_root: PathBuf,
    /// Maximum agents dispatched concurrently within a phase.
    pub concurrency_limit: usize,
    /// Per-agent wall-clock timeout.
    pub agent_timeout: Duration,
    /// Per-agent retry budget for transient failures.
    pub retry_budget: u32,
    /// Maximum phase retry attempts before the run fails.
    pub phase_retry_limit: u32,
    /// Fraction of a budget limit that triggers a threshold event.
    pub alert_threshold: f64,
    /// Token limits per budget scope.
    pub budget_limits: BudgetLimits,
    /// Default isolation mode for agent side effects.
    pub execution_mode: ExecutionMode,
    /// Event buffer capacity per run; overflow drops oldest events.
    pub event_buffer_capacity: usize,
}

impl EngineConfig {
    /// Create a config rooted at the given storage directory.
    pub fn new(storage_root: impl Into<PathBuf>) -> Self {
        Self {
            storage_root: storage_root.into(),
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            agent_timeout: Duration::from_secs(DEFAULT_AGENT_TIMEOUT_SECS),
            retry_budget: DEFAULT_RETRY_BUDGET,
            phase_retry_limit: 3,
            alert_threshold: DEFAULT_ALERT_THRESHOLD,
            budget_limits: BudgetLimits::default(),
            execution_mode: ExecutionMode::Direct,
            event_buffer_capacity: 1024,
        }
    }

    /// Set the maximum concurrent agents per phase.
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit.max(1);
        self
    }

    /// Set the per-agent timeout.
    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = timeout;
        self
    }

    /// Set the per-agent transient retry budget.
    pub fn with_retry_budget(mut self, budget: u32) -> Self {
        self.retry_budget = budget;
        self
    }

    /// Set the phase retry limit.
    pub fn with_phase_retry_limit(mut self, limit: u32) -> Self {
        self.phase_retry_limit = limit;
        self
    }

    /// Set the budget alert threshold (clamped to 0.0..=1.0).
    pub fn with_alert_threshold(mut self, threshold: f64) -> Self {
        self.alert_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// Set the token limits.
    pub fn with_budget_limits(mut self, limits: BudgetLimits) -> Self {
        self.budget_limits = limits;
        self
    }

    /// Set the agent isolation mode.
    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    /// Set the per-run event buffer capacity.
    pub fn with_event_buffer_capacity(mut self, capacity: usize) -> Self {
        self.event_buffer_capacity = capacity.max(1);
        self
    }

    /// Directory holding per-run state.
    pub fn runs_dir(&self) -> PathBuf {
        self.storage_root.join("runs")
    }

    /// Directory holding content-addressed blobs.
    pub fn blobs_dir(&self) -> PathBuf {
        self.storage_root.join("artifacts").join("blobs")
    }

    /// Directory holding policy documents.
    pub fn policies_dir(&self) -> PathBuf {
        self.storage_root.join("policies")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::new("/tmp/conductor");
        assert_eq!(config.concurrency_limit, 4);
        assert_eq!(config.agent_timeout, Duration::from_secs(1800));
        assert_eq!(config.retry_budget, 2);
        assert!((config.alert_threshold - 0.8).abs() < f64::EPSILON);
        assert_eq!(config.execution_mode, ExecutionMode::Direct);
    }

    #[test]
    fn test_builder_setters() {
        let config = EngineConfig::new("/tmp/conductor")
            .with_concurrency_limit(8)
            .with_retry_budget(1)
            .with_alert_threshold(0.5)
            .with_execution_mode(ExecutionMode::Sandboxed);
        assert_eq!(config.concurrency_limit, 8);
        assert_eq!(config.retry_budget, 1);
        assert!((config.alert_threshold - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.execution_mode, ExecutionMode::Sandboxed);
    }

    #[test]
    fn test_concurrency_limit_floor() {
        let config = EngineConfig::new("/x").with_concurrency_limit(0);
        assert_eq!(config.concurrency_limit, 1);
    }

    #[test]
    fn test_alert_threshold_clamped() {
        let config = EngineConfig::new("/x").with_alert_threshold(1.5);
        assert!((config.alert_threshold - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_storage_layout() {
        let config = EngineConfig::new("/data");
        assert_eq!(config.runs_dir(), PathBuf::from("/data/runs"));
        assert_eq!(
            config.blobs_dir(),
            PathBuf::from("/data/artifacts/blobs")
        );
        assert_eq!(config.policies_dir(), PathBuf::from("/data/policies"));
    }

    #[test]
    fn test_budget_limits_builder() {
        let limits = BudgetLimits::default()
            .with_run_tokens(10_000)
            .with_phase_tokens(5_000);
        assert_eq!(limits.run_tokens, Some(10_000));
        assert_eq!(limits.phase_tokens, Some(5_000));
        assert_eq!(limits.agent_tokens, None);
    }
}
