//! Governance engine: policy composition, gate evaluation, and audit.
//!
//! The engine evaluates the effective policy's gates at every phase
//! transition. The outcome is a value the run engine branches on; a blocked
//! transition is a state, not an exception.

pub mod audit;
pub mod gates;
pub mod policy;

pub use audit::{AuditLog, GateAuditEntry};
pub use gates::{
    Comparison, Gate, GateKind, GateResult, GateSeverity, GateStatus, GovernanceOutcome,
    GovernanceVerdict, PhaseContext, ToolGateRunner, ToolVerdict,
};
pub use policy::{Policy, PolicyCache, compose};

use tracing::info;

/// Evaluates gates for phase transitions and records the audit trail.
pub struct GovernanceEngine {
    audit: AuditLog,
}

impl GovernanceEngine {
    pub fn new(audit: AuditLog) -> Self {
        Self { audit }
    }

    /// Gates from the policy applicable to the given phase, in declared order.
    pub fn gates_for_phase<'p>(&self, policy: &'p Policy, phase: &str) -> Vec<&'p Gate> {
        policy.gates().iter().filter(|g| g.applies_to(phase)).collect()
    }

    /// Evaluate all applicable gates for a phase transition. Every result is
    /// appended to the audit log before the outcome is returned.
    pub async fn evaluate(
        &self,
        policy: &Policy,
        ctx: &PhaseContext<'_>,
        tools: &dyn ToolGateRunner,
    ) -> Result<GovernanceOutcome, crate::errors::StoreError> {
        let applicable = self.gates_for_phase(policy, ctx.phase);
        let mut results = Vec::with_capacity(applicable.len());
        for gate in applicable {
            let result = gates::evaluate_gate(gate, ctx, tools).await;
            info!(
                run_id = ctx.run_id,
                phase = ctx.phase,
                gate_id = %result.gate_id,
                status = ?result.status,
                "gate evaluated"
            );
            results.push(result);
        }

        self.audit.append(ctx.run_id, ctx.phase, &results)?;
        Ok(GovernanceOutcome::from_results(results))
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{ArtifactStore, ArtifactType};
    use async_trait::async_trait;
    use serde_json::Value;
    use tempfile::TempDir;

    struct NoTools;

    #[async_trait]
    impl ToolGateRunner for NoTools {
        async fn run_tool(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: &Value,
        ) -> anyhow::Result<ToolVerdict> {
            anyhow::bail!("no tools")
        }
    }

    fn coverage_gate(phase: &str) -> Gate {
        Gate {
            gate_id: "coverage-floor".to_string(),
            kind: GateKind::Metric {
                artifact: "qa_report".to_string(),
                pointer: "/coverage/line_pct".to_string(),
                comparison: Comparison::Gte,
                threshold: 80.0,
            },
            phase_applicability: vec![phase.to_string()],
            on_failure: GateSeverity::Block,
            remediation: Some("add tests".to_string()),
        }
    }

    #[tokio::test]
    async fn test_evaluate_appends_audit() {
        let dir = TempDir::new().unwrap();
        let artifacts = ArtifactStore::new(dir.path().join("blobs"), dir.path().join("runs"));
        artifacts
            .put(
                "run-1",
                "qa",
                "qa_engineer",
                "qa_report",
                ArtifactType::Json,
                br#"{"coverage": {"line_pct": 95}}"#,
            )
            .unwrap();

        let engine = GovernanceEngine::new(AuditLog::new(dir.path().join("runs")));
        let policy = Policy {
            gates: Some(vec![coverage_gate("qa")]),
            ..Default::default()
        };
        let ctx = PhaseContext {
            run_id: "run-1",
            phase: "qa",
            artifacts: &artifacts,
            workspace: None,
        };

        let outcome = engine.evaluate(&policy, &ctx, &NoTools).await.unwrap();
        assert_eq!(outcome.verdict, GovernanceVerdict::Pass);

        let entries = engine.audit_log().read_for_run("run-1").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].gate_id, "coverage-floor");
    }

    #[tokio::test]
    async fn test_gates_filtered_by_phase() {
        let dir = TempDir::new().unwrap();
        let engine = GovernanceEngine::new(AuditLog::new(dir.path().join("runs")));
        let policy = Policy {
            gates: Some(vec![coverage_gate("qa"), coverage_gate("security")]),
            ..Default::default()
        };

        assert_eq!(engine.gates_for_phase(&policy, "qa").len(), 1);
        assert_eq!(engine.gates_for_phase(&policy, "planning").len(), 0);
    }

    #[tokio::test]
    async fn test_no_gates_passes() {
        let dir = TempDir::new().unwrap();
        let artifacts = ArtifactStore::new(dir.path().join("blobs"), dir.path().join("runs"));
        let engine = GovernanceEngine::new(AuditLog::new(dir.path().join("runs")));
        let ctx = PhaseContext {
            run_id: "run-1",
            phase: "planning",
            artifacts: &artifacts,
            workspace: None,
        };

        let outcome = engine
            .evaluate(&Policy::default(), &ctx, &NoTools)
            .await
            .unwrap();
        assert_eq!(outcome.verdict, GovernanceVerdict::Pass);
        assert!(outcome.results.is_empty());
    }
}
