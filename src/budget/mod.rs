//! Hierarchical token and cost budgeting.
//!
//! Budgets form a tree: run ⊃ phase ⊃ agent ⊃ tool. Admission checks every
//! ancestor before a model call; recording updates every ancestor under one
//! lock. Denial never mutates any counter. Crossing the alert threshold is
//! reported once per scope key.

use crate::config::BudgetLimits;
use crate::errors::BudgetError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::AddAssign;
use std::sync::Mutex;

/// Token and cost counters. Monotonic within a run; never reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_units: f64,
    pub request_count: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64, cost_units: f64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            cost_units,
            request_count: 1,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, other: Self) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cost_units += other.cost_units;
        self.request_count += other.request_count;
    }
}

/// Budget scope levels, outermost first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Run,
    Phase,
    Agent,
    Tool,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Run => "run",
            Scope::Phase => "phase",
            Scope::Agent => "agent",
            Scope::Tool => "tool",
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully-qualified position in the budget tree. Each level implies all of
/// its ancestors.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BudgetKey {
    pub run_id: String,
    pub phase: Option<String>,
    pub agent_id: Option<String>,
    pub tool: Option<String>,
}

impl BudgetKey {
    pub fn run(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            phase: None,
            agent_id: None,
            tool: None,
        }
    }

    pub fn phase(run_id: &str, phase: &str) -> Self {
        Self {
            phase: Some(phase.to_string()),
            ..Self::run(run_id)
        }
    }

    pub fn agent(run_id: &str, phase: &str, agent_id: &str) -> Self {
        Self {
            agent_id: Some(agent_id.to_string()),
            ..Self::phase(run_id, phase)
        }
    }

    pub fn tool(run_id: &str, phase: &str, agent_id: &str, tool: &str) -> Self {
        Self {
            tool: Some(tool.to_string()),
            ..Self::agent(run_id, phase, agent_id)
        }
    }

    /// This key and every ancestor, outermost first.
    fn lineage(&self) -> Vec<(Scope, String)> {
        let mut out = vec![(Scope::Run, self.run_id.clone())];
        if let Some(phase) = &self.phase {
            out.push((Scope::Phase, format!("{}/{}", self.run_id, phase)));
            if let Some(agent) = &self.agent_id {
                out.push((Scope::Agent, format!("{}/{}/{}", self.run_id, phase, agent)));
                if let Some(tool) = &self.tool {
                    out.push((
                        Scope::Tool,
                        format!("{}/{}/{}/{}", self.run_id, phase, agent, tool),
                    ));
                }
            }
        }
        out
    }
}

/// Outcome of a pre-call admission check.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Allowed,
    Denied { scope: Scope, reason: String },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }

    /// Convert a denial into an error, for callers that cannot proceed.
    pub fn into_result(self, key: &BudgetKey) -> Result<(), BudgetError> {
        match self {
            Admission::Allowed => Ok(()),
            Admission::Denied { scope, reason } => Err(BudgetError::Denied {
                scope: scope.to_string(),
                key: key.run_id.clone(),
                reason,
            }),
        }
    }
}

/// A scope key that crossed its alert threshold during a `record` call.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdCrossing {
    pub scope: Scope,
    pub key: String,
    pub used_tokens: u64,
    pub limit_tokens: u64,
}

/// Spending strategies advertised to agents, cheapest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Minimal,
    Balanced,
    Thorough,
}

impl Strategy {
    /// Nominal token floor: the estimated cost of one call at this strategy.
    pub fn nominal_floor(&self) -> u64 {
        match self {
            Strategy::Minimal => 2_000,
            Strategy::Balanced => 8_000,
            Strategy::Thorough => 32_000,
        }
    }

    /// One level cheaper, or `None` below minimal.
    pub fn downgrade(&self) -> Option<Strategy> {
        match self {
            Strategy::Thorough => Some(Strategy::Balanced),
            Strategy::Balanced => Some(Strategy::Minimal),
            Strategy::Minimal => None,
        }
    }
}

#[derive(Default)]
struct Ledger {
    counters: HashMap<(Scope, String), TokenUsage>,
    alerted: HashSet<(Scope, String)>,
}

/// The budget controller: hierarchical counters with admission and alerts.
pub struct BudgetController {
    limits: BudgetLimits,
    alert_threshold: f64,
    ledger: Mutex<Ledger>,
}

impl BudgetController {
    pub fn new(limits: BudgetLimits, alert_threshold: f64) -> Self {
        Self {
            limits,
            alert_threshold,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    fn limit_for(&self, scope: Scope) -> Option<u64> {
        match scope {
            Scope::Run => self.limits.run_tokens,
            Scope::Phase => self.limits.phase_tokens,
            Scope::Agent => self.limits.agent_tokens,
            Scope::Tool => self.limits.tool_tokens,
        }
    }

    /// Check whether a call with the estimated input token count fits every
    /// ancestor budget. Denial mutates nothing.
    pub fn admit(&self, key: &BudgetKey, estimated_input_tokens: u64) -> Admission {
        let ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
        for (scope, scope_key) in key.lineage() {
            let Some(limit) = self.limit_for(scope) else {
                continue;
            };
            let used = ledger
                .counters
                .get(&(scope, scope_key.clone()))
                .map(|u| u.total_tokens())
                .unwrap_or(0);
            if used + estimated_input_tokens > limit {
                return Admission::Denied {
                    scope,
                    reason: format!(
                        "estimated {estimated_input_tokens} tokens would exceed {scope} limit \
                         ({used}/{limit} used)"
                    ),
                };
            }
        }
        Admission::Allowed
    }

    /// Record actual usage against the key and all ancestors. Returns scope
    /// keys that crossed the alert threshold for the first time.
    pub fn record(
        &self,
        key: &BudgetKey,
        input_tokens: u64,
        output_tokens: u64,
        cost_units: f64,
    ) -> Vec<ThresholdCrossing> {
        let usage = TokenUsage::new(input_tokens, output_tokens, cost_units);
        let mut crossings = Vec::new();
        let mut ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());

        for (scope, scope_key) in key.lineage() {
            let counter = ledger
                .counters
                .entry((scope, scope_key.clone()))
                .or_default();
            *counter += usage;
            let used = counter.total_tokens();

            if let Some(limit) = self.limit_for(scope) {
                let threshold = (limit as f64 * self.alert_threshold) as u64;
                if used >= threshold && ledger.alerted.insert((scope, scope_key.clone())) {
                    crossings.push(ThresholdCrossing {
                        scope,
                        key: scope_key,
                        used_tokens: used,
                        limit_tokens: limit,
                    });
                }
            }
        }
        crossings
    }

    /// A consistent snapshot of one counter.
    pub fn snapshot(&self, scope: Scope, key: &BudgetKey) -> TokenUsage {
        let ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
        key.lineage()
            .into_iter()
            .find(|(s, _)| *s == scope)
            .and_then(|(s, k)| ledger.counters.get(&(s, k)).copied())
            .unwrap_or_default()
    }

    /// Remaining run-level tokens, or `None` when unlimited.
    pub fn remaining_run_tokens(&self, run_id: &str) -> Option<u64> {
        let limit = self.limits.run_tokens?;
        let used = self.snapshot(Scope::Run, &BudgetKey::run(run_id)).total_tokens();
        Some(limit.saturating_sub(used))
    }

    /// Highest strategy whose nominal floor fits the remaining run budget.
    /// Falls back to minimal so an agent can always attempt a cheap call.
    pub fn select_strategy(&self, run_id: &str) -> Strategy {
        let Some(remaining) = self.remaining_run_tokens(run_id) else {
            return Strategy::Thorough;
        };
        for strategy in [Strategy::Thorough, Strategy::Balanced, Strategy::Minimal] {
            if strategy.nominal_floor() <= remaining {
                return strategy;
            }
        }
        Strategy::Minimal
    }

    /// Per-phase and per-agent usage breakdown for a run.
    pub fn report(&self, run_id: &str) -> BudgetReport {
        let ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
        let run_prefix = format!("{run_id}/");
        let mut report = BudgetReport {
            run_id: run_id.to_string(),
            total: ledger
                .counters
                .get(&(Scope::Run, run_id.to_string()))
                .copied()
                .unwrap_or_default(),
            by_phase: BTreeMap::new(),
            by_agent: BTreeMap::new(),
        };

        for ((scope, key), usage) in &ledger.counters {
            let Some(rest) = key.strip_prefix(&run_prefix) else {
                continue;
            };
            match scope {
                Scope::Phase => {
                    report.by_phase.insert(rest.to_string(), *usage);
                }
                Scope::Agent => {
                    report.by_agent.insert(rest.to_string(), *usage);
                }
                _ => {}
            }
        }
        report
    }
}

/// Usage breakdown returned by the `metrics` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetReport {
    pub run_id: String,
    pub total: TokenUsage,
    /// Keyed by phase name.
    pub by_phase: BTreeMap<String, TokenUsage>,
    /// Keyed by `phase/agent_id`.
    pub by_agent: BTreeMap<String, TokenUsage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(run: u64, phase: u64) -> BudgetController {
        let limits = BudgetLimits::default()
            .with_run_tokens(run)
            .with_phase_tokens(phase);
        BudgetController::new(limits, 0.8)
    }

    #[test]
    fn test_admit_within_limits() {
        let budget = controller(10_000, 5_000);
        let key = BudgetKey::agent("run-1", "planning", "planner");
        assert!(budget.admit(&key, 4_000).is_allowed());
    }

    #[test]
    fn test_admit_denied_by_phase_limit() {
        let budget = controller(10_000, 5_000);
        let key = BudgetKey::agent("run-1", "planning", "planner");
        let admission = budget.admit(&key, 6_000);
        match admission {
            Admission::Denied { scope, .. } => assert_eq!(scope, Scope::Phase),
            Admission::Allowed => panic!("Expected denial"),
        }
    }

    #[test]
    fn test_admission_into_result() {
        let budget = controller(10_000, 5_000);
        let key = BudgetKey::agent("run-1", "planning", "planner");

        assert!(budget.admit(&key, 1_000).into_result(&key).is_ok());

        let err = budget.admit(&key, 6_000).into_result(&key).unwrap_err();
        let BudgetError::Denied { scope, reason, .. } = err;
        assert_eq!(scope, "phase");
        assert!(reason.contains("6000"));
    }

    #[test]
    fn test_denied_admission_mutates_nothing() {
        let budget = controller(10_000, 5_000);
        let key = BudgetKey::agent("run-1", "planning", "planner");
        let _ = budget.admit(&key, 6_000);
        let snapshot = budget.snapshot(Scope::Phase, &key);
        assert_eq!(snapshot.input_tokens, 0);
        assert_eq!(snapshot.total_tokens(), 0);
    }

    #[test]
    fn test_record_updates_all_ancestors() {
        let budget = controller(10_000, 5_000);
        let key = BudgetKey::tool("run-1", "planning", "planner", "search");
        budget.record(&key, 100, 50, 0.01);

        assert_eq!(budget.snapshot(Scope::Run, &key).total_tokens(), 150);
        assert_eq!(budget.snapshot(Scope::Phase, &key).total_tokens(), 150);
        assert_eq!(budget.snapshot(Scope::Agent, &key).total_tokens(), 150);
        assert_eq!(budget.snapshot(Scope::Tool, &key).total_tokens(), 150);
        assert_eq!(budget.snapshot(Scope::Run, &key).request_count, 1);
    }

    #[test]
    fn test_usage_is_monotonic_across_records() {
        let budget = controller(100_000, 50_000);
        let key = BudgetKey::phase("run-1", "planning");
        budget.record(&key, 100, 0, 0.0);
        budget.record(&key, 200, 0, 0.0);
        let usage = budget.snapshot(Scope::Phase, &key);
        assert_eq!(usage.input_tokens, 300);
        assert_eq!(usage.request_count, 2);
    }

    #[test]
    fn test_threshold_crossing_reported_once() {
        let budget = controller(1_000, 1_000);
        let key = BudgetKey::phase("run-1", "planning");

        let first = budget.record(&key, 850, 0, 0.0);
        assert_eq!(first.len(), 2); // run and phase both crossed 80%
        assert!(first.iter().any(|c| c.scope == Scope::Run));

        let second = budget.record(&key, 10, 0, 0.0);
        assert!(second.is_empty());
    }

    #[test]
    fn test_strategy_selection_by_remaining() {
        let budget = controller(10_000, 10_000);
        assert_eq!(budget.select_strategy("run-1"), Strategy::Balanced);

        budget.record(&BudgetKey::run("run-1"), 7_000, 0, 0.0);
        assert_eq!(budget.select_strategy("run-1"), Strategy::Minimal);
    }

    #[test]
    fn test_strategy_thorough_when_unlimited() {
        let budget = BudgetController::new(BudgetLimits::default(), 0.8);
        assert_eq!(budget.select_strategy("run-1"), Strategy::Thorough);
    }

    #[test]
    fn test_strategy_downgrade_chain() {
        assert_eq!(Strategy::Thorough.downgrade(), Some(Strategy::Balanced));
        assert_eq!(Strategy::Balanced.downgrade(), Some(Strategy::Minimal));
        assert_eq!(Strategy::Minimal.downgrade(), None);
    }

    #[test]
    fn test_report_breakdown() {
        let budget = controller(100_000, 50_000);
        budget.record(&BudgetKey::agent("run-1", "planning", "planner"), 100, 10, 0.0);
        budget.record(&BudgetKey::agent("run-1", "qa", "qa_engineer"), 200, 20, 0.0);
        budget.record(&BudgetKey::agent("run-2", "planning", "planner"), 999, 0, 0.0);

        let report = budget.report("run-1");
        assert_eq!(report.total.total_tokens(), 330);
        assert_eq!(report.by_phase.len(), 2);
        assert_eq!(report.by_phase["planning"].total_tokens(), 110);
        assert_eq!(report.by_agent["qa/qa_engineer"].total_tokens(), 220);
    }
}
