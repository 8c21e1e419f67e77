//! The agent dispatcher: one uniform lifecycle for every role.
//!
//! INITIALIZE (compose context through the cache) → budget admission →
//! ACT (backend call under timeout and cancellation) → SUMMARIZE (schema
//! validation, artifact capture, usage recording) → COMPLETE.
//!
//! Errors are normalized onto the failure kinds the swarm retry policy
//! understands.

use crate::agent::backend::{AgentBackend, AgentCall};
use crate::agent::{AgentFailure, AgentOutput, AgentRequest, AgentStatus};
use crate::artifact::ArtifactStore;
use crate::budget::{BudgetController, BudgetKey, Strategy, ThresholdCrossing};
use crate::config::ExecutionMode;
use crate::context::ContextCache;
use crate::errors::FailureKind;
use crate::events::{EventBus, EventDraft, EventType};
use crate::governance::{ToolGateRunner, ToolVerdict};
use crate::ident;
use crate::swarm::CancelToken;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct AgentDispatcher {
    backend: Arc<dyn AgentBackend>,
    artifacts: Arc<ArtifactStore>,
    budget: Arc<BudgetController>,
    cache: Arc<ContextCache>,
    events: Arc<EventBus>,
    timeout: Duration,
    execution_mode: ExecutionMode,
}

impl AgentDispatcher {
    pub fn new(
        backend: Arc<dyn AgentBackend>,
        artifacts: Arc<ArtifactStore>,
        budget: Arc<BudgetController>,
        cache: Arc<ContextCache>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            backend,
            artifacts,
            budget,
            cache,
            events,
            timeout: Duration::from_secs(1800),
            execution_mode: ExecutionMode::Direct,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    /// Invoke one agent and normalize the result. Never panics; every
    /// failure path comes back as a classified `AgentOutput`.
    pub async fn invoke(
        &self,
        run_id: &str,
        phase: &str,
        request: &AgentRequest,
        cancel: &CancelToken,
    ) -> AgentOutput {
        self.events.emit(
            run_id,
            EventDraft::new(
                EventType::AgentStarted,
                format!("agent '{}' started", request.agent_id),
            )
            .with_phase(phase)
            .with_agent(&request.agent_id),
        );

        let output = self.invoke_inner(run_id, phase, request, cancel).await;

        match output.status {
            AgentStatus::Succeeded => {
                self.events.emit(
                    run_id,
                    EventDraft::new(
                        EventType::AgentCompleted,
                        format!("agent '{}' completed", request.agent_id),
                    )
                    .with_phase(phase)
                    .with_agent(&request.agent_id)
                    .with_payload(json!({
                        "artifacts": output.artifacts.len(),
                        "input_tokens": output.token_usage.input_tokens,
                        "output_tokens": output.token_usage.output_tokens,
                    })),
                );
            }
            AgentStatus::Failed | AgentStatus::Cancelled => {
                let payload =
                    serde_json::to_value(&output.failure).unwrap_or(Value::Null);
                self.events.emit(
                    run_id,
                    EventDraft::new(
                        EventType::AgentFailed,
                        format!("agent '{}' failed", request.agent_id),
                    )
                    .with_phase(phase)
                    .with_agent(&request.agent_id)
                    .with_payload(payload),
                );
            }
        }
        output
    }

    async fn invoke_inner(
        &self,
        run_id: &str,
        phase: &str,
        request: &AgentRequest,
        cancel: &CancelToken,
    ) -> AgentOutput {
        // INITIALIZE: compose the context blob, memoized by input digest.
        let context_key = ident::digest_json(&json!({
            "phase": phase,
            "role": request.role,
            "input": request.input_spec,
        }));
        let input_spec = request.input_spec.clone();
        let role = request.role;
        let phase_name = phase.to_string();
        let context = match self
            .cache
            .get_or_compute(&context_key, || async move {
                Ok(json!({
                    "phase": phase_name,
                    "role": role,
                    "input": input_spec,
                }))
            })
            .await
        {
            Ok((context, hit)) => {
                debug!(agent_id = %request.agent_id, cache_hit = hit, "context composed");
                context
            }
            Err(e) => {
                return AgentOutput::failed(
                    request,
                    AgentFailure::new(
                        FailureKind::Permanent,
                        format!("context composition failed: {e}"),
                    ),
                );
            }
        };

        // Admission: highest affordable strategy, one downgrade on denial.
        let budget_key = BudgetKey::agent(run_id, phase, &request.agent_id);
        let mut strategy = self.budget.select_strategy(run_id);
        let mut admission = self.budget.admit(&budget_key, strategy.nominal_floor());
        if !admission.is_allowed()
            && let Some(lower) = strategy.downgrade()
        {
            debug!(
                agent_id = %request.agent_id,
                from = ?strategy,
                to = ?lower,
                "budget denied, downgrading strategy"
            );
            strategy = lower;
            admission = self.budget.admit(&budget_key, strategy.nominal_floor());
        }
        if let Err(denied) = admission.into_result(&budget_key) {
            return AgentOutput::failed(
                request,
                AgentFailure::new(FailureKind::Budget, denied.to_string())
                    .with_remediation("raise the budget limit or prune earlier phases"),
            );
        }

        if self.execution_mode == ExecutionMode::Sandboxed {
            // Network is denied by the backend contract in sandboxed mode;
            // host resource limits apply only where the OS supports them.
            debug!(agent_id = %request.agent_id, "sandboxed invocation");
        }

        // ACT: the dominant suspension point. Cancellation and timeout are
        // both observed here.
        let call = AgentCall {
            run_id,
            phase,
            request,
            context,
            strategy,
            execution_mode: self.execution_mode,
        };
        let response = tokio::select! {
            _ = cancel.cancelled() => {
                return AgentOutput::failed(
                    request,
                    AgentFailure::new(FailureKind::Cancelled, "run cancelled"),
                );
            }
            result = tokio::time::timeout(self.timeout, self.backend.invoke(call)) => {
                match result {
                    Err(_) => {
                        return AgentOutput::failed(
                            request,
                            AgentFailure::new(
                                FailureKind::Transient,
                                format!("timeout after {:?}", self.timeout),
                            ),
                        );
                    }
                    Ok(Err(failure)) => return AgentOutput::failed(request, failure),
                    Ok(Ok(response)) => response,
                }
            }
        };

        // Usage is recorded before validation: the tokens were spent either
        // way.
        let crossings = self.budget.record(
            &budget_key,
            response.token_usage.input_tokens,
            response.token_usage.output_tokens,
            response.token_usage.cost_units,
        );
        self.emit_threshold_events(run_id, phase, &crossings);

        // SUMMARIZE: validate the response against the role's schema.
        for required in request.role.required_artifacts() {
            let found = response
                .artifacts
                .iter()
                .any(|a| a.logical_name == required.logical_name);
            if !found {
                return AgentOutput {
                    agent_id: request.agent_id.clone(),
                    role: request.role,
                    status: AgentStatus::Failed,
                    summary: response.summary,
                    artifacts: Vec::new(),
                    token_usage: response.token_usage,
                    failure: Some(
                        AgentFailure::new(
                            FailureKind::Permanent,
                            format!(
                                "output schema violation: required artifact '{}' missing",
                                required.logical_name
                            ),
                        )
                        .with_remediation(format!(
                            "ensure the {} role registers '{}' in its output manifest",
                            request.role, required.logical_name
                        )),
                    ),
                };
            }
        }

        // Persist exactly the artifacts the agent registered.
        let mut artifact_refs = Vec::with_capacity(response.artifacts.len());
        for produced in &response.artifacts {
            match self.artifacts.put(
                run_id,
                phase,
                &request.agent_id,
                &produced.logical_name,
                produced.artifact_type,
                &produced.bytes,
            ) {
                Ok(artifact) => artifact_refs.push(artifact),
                Err(e) => {
                    return AgentOutput {
                        agent_id: request.agent_id.clone(),
                        role: request.role,
                        status: AgentStatus::Failed,
                        summary: response.summary,
                        artifacts: artifact_refs,
                        token_usage: response.token_usage,
                        failure: Some(AgentFailure::new(
                            FailureKind::Permanent,
                            format!(
                                "failed to store artifact '{}': {e}",
                                produced.logical_name
                            ),
                        )),
                    };
                }
            }
        }

        // COMPLETE.
        AgentOutput {
            agent_id: request.agent_id.clone(),
            role: request.role,
            status: AgentStatus::Succeeded,
            summary: response.summary,
            artifacts: artifact_refs,
            token_usage: response.token_usage,
            failure: None,
        }
    }

    fn emit_threshold_events(&self, run_id: &str, phase: &str, crossings: &[ThresholdCrossing]) {
        for crossing in crossings {
            self.events.emit(
                run_id,
                EventDraft::new(
                    EventType::BudgetThreshold,
                    format!(
                        "{} budget for '{}' at {}/{} tokens",
                        crossing.scope, crossing.key, crossing.used_tokens, crossing.limit_tokens
                    ),
                )
                .with_phase(phase)
                .with_payload(json!({
                    "scope": crossing.scope.as_str(),
                    "key": crossing.key,
                    "used_tokens": crossing.used_tokens,
                    "limit_tokens": crossing.limit_tokens,
                })),
            );
        }
    }
}

#[async_trait]
impl ToolGateRunner for AgentDispatcher {
    /// Tool gates route through the same budget surface as agents, under the
    /// reserved `governance` agent key.
    async fn run_tool(
        &self,
        run_id: &str,
        phase: &str,
        tool: &str,
        args: &Value,
    ) -> anyhow::Result<ToolVerdict> {
        let key = BudgetKey::tool(run_id, phase, "governance", tool);
        self.budget
            .admit(&key, Strategy::Minimal.nominal_floor())
            .into_result(&key)
            .map_err(|e| anyhow::anyhow!("tool '{tool}' blocked: {e}"))?;

        let verdict = self
            .backend
            .run_tool(run_id, phase, tool, args)
            .await
            .map_err(|f| anyhow::anyhow!("tool '{tool}' failed: {}", f.message))?;

        let crossings = self.budget.record(&key, Strategy::Minimal.nominal_floor(), 0, 0.0);
        self.emit_threshold_events(run_id, phase, &crossings);
        Ok(verdict)
    }
}
