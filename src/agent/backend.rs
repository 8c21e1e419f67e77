//! The backend seam: how a role-specific callable is reached.
//!
//! The engine never talks to a model transport directly; it hands an
//! `AgentCall` to an `AgentBackend` and normalizes whatever comes back. The
//! `ScriptedBackend` is the in-process implementation used for tests and dry
//! runs: deterministic outputs per role, optional failure injection and
//! delays.

use crate::agent::{AgentFailure, AgentRequest, AgentRole};
use crate::artifact::ArtifactType;
use crate::budget::{Strategy, TokenUsage};
use crate::config::ExecutionMode;
use crate::errors::FailureKind;
use crate::governance::ToolVerdict;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One invocation of an agent, as seen by the backend.
pub struct AgentCall<'a> {
    pub run_id: &'a str,
    pub phase: &'a str,
    pub request: &'a AgentRequest,
    /// Composed context blob from the context cache.
    pub context: Arc<Value>,
    pub strategy: Strategy,
    pub execution_mode: ExecutionMode,
}

/// An artifact the agent registers in its output manifest. Only registered
/// entries are persisted.
#[derive(Debug, Clone)]
pub struct ProducedArtifact {
    pub logical_name: String,
    pub artifact_type: ArtifactType,
    pub bytes: Vec<u8>,
}

/// Raw backend response before dispatcher normalization.
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub summary: String,
    pub artifacts: Vec<ProducedArtifact>,
    pub token_usage: TokenUsage,
}

/// The single capability all agent roles share.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn invoke(&self, call: AgentCall<'_>) -> Result<BackendResponse, AgentFailure>;

    /// Run a governance scanner tool. Backends without scanners pass.
    async fn run_tool(
        &self,
        _run_id: &str,
        _phase: &str,
        _tool: &str,
        _args: &Value,
    ) -> Result<ToolVerdict, AgentFailure> {
        Ok(ToolVerdict {
            passed: true,
            findings: Vec::new(),
        })
    }
}

struct FailurePlan {
    kind: FailureKind,
    remaining: u32,
}

#[derive(Default)]
struct ScriptState {
    failures: HashMap<String, FailurePlan>,
    invocations: Vec<String>,
}

/// Deterministic in-process backend.
pub struct ScriptedBackend {
    state: Mutex<ScriptState>,
    delays: HashMap<String, Duration>,
    tool_verdicts: HashMap<String, ToolVerdict>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ScriptState::default()),
            delays: HashMap::new(),
            tool_verdicts: HashMap::new(),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Make the named agent fail `times` times with the given kind before
    /// succeeding.
    pub fn fail_agent(self, agent_id: &str, kind: FailureKind, times: u32) -> Self {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.failures.insert(
            agent_id.to_string(),
            FailurePlan {
                kind,
                remaining: times,
            },
        );
        drop(state);
        self
    }

    /// Sleep before answering for the named agent, to exercise concurrency.
    pub fn with_delay(mut self, agent_id: &str, delay: Duration) -> Self {
        self.delays.insert(agent_id.to_string(), delay);
        self
    }

    /// Fix the verdict a named scanner tool reports.
    pub fn with_tool_verdict(mut self, tool: &str, verdict: ToolVerdict) -> Self {
        self.tool_verdicts.insert(tool.to_string(), verdict);
        self
    }

    /// Agent ids in invocation order (including retried attempts).
    pub fn invocations(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .invocations
            .clone()
    }

    /// Highest number of concurrently running invocations observed.
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn canned_artifact(role: AgentRole, name: &str, artifact_type: ArtifactType) -> Vec<u8> {
        match artifact_type {
            ArtifactType::Json => match role {
                AgentRole::QaEngineer => {
                    json!({"coverage": {"line_pct": 87.5}, "tests": {"passed": 42, "failed": 0}})
                }
                AgentRole::SecurityAuditor => json!({"passed": true, "findings": []}),
                AgentRole::PerformanceEngineer => {
                    json!({"latency_p95_ms": 120, "throughput_rps": 850})
                }
                _ => json!({"name": name}),
            }
            .to_string()
            .into_bytes(),
            ArtifactType::Markdown => format!("# {name}\n\nProduced by {role}.\n").into_bytes(),
            ArtifactType::Yaml => format!("{name}:\n  produced_by: {role}\n").into_bytes(),
            ArtifactType::Code => format!("// {name} ({role})\n").into_bytes(),
            ArtifactType::Tabular => format!("col_a,col_b\n1,{role}\n").into_bytes(),
        }
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    async fn invoke(&self, call: AgentCall<'_>) -> Result<BackendResponse, AgentFailure> {
        let agent_id = call.request.agent_id.clone();
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.invocations.push(agent_id.clone());
            if let Some(plan) = state.failures.get_mut(&agent_id)
                && plan.remaining > 0
            {
                plan.remaining -= 1;
                let kind = plan.kind;
                return Err(AgentFailure::new(
                    kind,
                    format!("scripted failure for '{agent_id}'"),
                )
                .with_remediation("re-run the agent once the scripted fault clears"));
            }
        }

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        if let Some(delay) = self.delays.get(&agent_id) {
            tokio::time::sleep(*delay).await;
        } else {
            // Yield so concurrently dispatched agents overlap.
            tokio::task::yield_now().await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let artifacts = call
            .request
            .role
            .required_artifacts()
            .into_iter()
            .map(|req| ProducedArtifact {
                logical_name: req.logical_name.to_string(),
                artifact_type: req.artifact_type,
                bytes: Self::canned_artifact(call.request.role, req.logical_name, req.artifact_type),
            })
            .collect();

        Ok(BackendResponse {
            summary: format!(
                "{} completed {} work for {}",
                call.request.role, call.phase, call.run_id
            ),
            artifacts,
            token_usage: TokenUsage::new(call.strategy.nominal_floor() / 2, 200, 0.01),
        })
    }

    async fn run_tool(
        &self,
        _run_id: &str,
        _phase: &str,
        tool: &str,
        _args: &Value,
    ) -> Result<ToolVerdict, AgentFailure> {
        Ok(self
            .tool_verdicts
            .get(tool)
            .cloned()
            .unwrap_or(ToolVerdict {
                passed: true,
                findings: Vec::new(),
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call<'a>(request: &'a AgentRequest, context: &'a Arc<Value>) -> AgentCall<'a> {
        AgentCall {
            run_id: "run-1",
            phase: "development",
            request,
            context: context.clone(),
            strategy: Strategy::Balanced,
            execution_mode: ExecutionMode::Direct,
        }
    }

    #[tokio::test]
    async fn test_scripted_backend_produces_role_schema() {
        let backend = ScriptedBackend::new();
        let request = AgentRequest::new("dev", AgentRole::Developer);
        let context = Arc::new(Value::Null);

        let response = backend.invoke(call(&request, &context)).await.unwrap();
        assert_eq!(response.artifacts.len(), 1);
        assert_eq!(response.artifacts[0].logical_name, "implementation");
        assert!(response.token_usage.input_tokens > 0);
    }

    #[tokio::test]
    async fn test_failure_injection_clears_after_n() {
        let backend =
            ScriptedBackend::new().fail_agent("dev", FailureKind::Transient, 2);
        let request = AgentRequest::new("dev", AgentRole::Developer);
        let context = Arc::new(Value::Null);

        let first = backend.invoke(call(&request, &context)).await;
        assert_eq!(first.unwrap_err().kind, FailureKind::Transient);
        let second = backend.invoke(call(&request, &context)).await;
        assert_eq!(second.unwrap_err().kind, FailureKind::Transient);
        let third = backend.invoke(call(&request, &context)).await;
        assert!(third.is_ok());

        assert_eq!(backend.invocations(), vec!["dev", "dev", "dev"]);
    }

    #[tokio::test]
    async fn test_qa_report_carries_coverage_metric() {
        let backend = ScriptedBackend::new();
        let request = AgentRequest::new("qa", AgentRole::QaEngineer);
        let context = Arc::new(Value::Null);

        let response = backend.invoke(call(&request, &context)).await.unwrap();
        let report: Value = serde_json::from_slice(&response.artifacts[0].bytes).unwrap();
        assert!(report.pointer("/coverage/line_pct").unwrap().as_f64().unwrap() > 0.0);
    }

    #[tokio::test]
    async fn test_tool_verdict_override() {
        let backend = ScriptedBackend::new().with_tool_verdict(
            "dependency_scanner",
            ToolVerdict {
                passed: false,
                findings: vec!["CVE-2026-0001".to_string()],
            },
        );

        let verdict = backend
            .run_tool("run-1", "security", "dependency_scanner", &Value::Null)
            .await
            .unwrap();
        assert!(!verdict.passed);

        let default = backend
            .run_tool("run-1", "security", "other_tool", &Value::Null)
            .await
            .unwrap();
        assert!(default.passed);
    }
}
