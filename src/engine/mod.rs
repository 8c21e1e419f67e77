//! The run engine: a durable, resumable state machine over the phase graph.
//!
//! Exactly one phase per run is active at a time; multiple runs may be in
//! flight concurrently, each with its own single-writer lock. Every state
//! transition is persisted atomically before observers hear about it.

pub mod report;
pub mod run;
pub mod store;

pub use report::{EXIT_AWAITING_CONSENSUS, RunSummary, UsageReport};
pub use run::{PhaseRecord, PhaseStatus, Run, RunStatus};
pub use store::RunStore;

use crate::agent::{AgentBackend, AgentDispatcher, AgentOutput, AgentRequest, AgentRoster};
use crate::artifact::{ArtifactStore, Manifest};
use crate::budget::{BudgetController, TokenUsage};
use crate::checkpoint::{
    AgentStateSnapshot, ArtifactPin, Checkpoint, CheckpointKind, CheckpointSpec, CheckpointStore,
};
use crate::config::{EngineConfig, ExecutionMode};
use crate::context::ContextCache;
use crate::errors::{EngineError, StoreError};
use crate::events::{EventBus, EventDraft, EventType};
use crate::governance::{GovernanceEngine, GovernanceVerdict, PhaseContext, Policy};
use crate::intake::Intake;
use crate::planner;
use crate::profile::Profile;
use crate::swarm::{AgentRunner, CancelToken, PhaseOutcome, SwarmConfig, SwarmExecutor};
use crate::{governance, ident};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

/// Options for one `next` invocation.
#[derive(Debug, Clone)]
pub struct NextOptions {
    /// Dispatch roster agents concurrently. Off forces one at a time.
    pub parallel: bool,
    /// Override the configured concurrency limit.
    pub max_workers: Option<usize>,
    /// Override the configured per-agent timeout.
    pub timeout: Option<Duration>,
}

impl Default for NextOptions {
    fn default() -> Self {
        Self {
            parallel: true,
            max_workers: None,
            timeout: None,
        }
    }
}

/// Bridges the swarm executor onto the dispatcher for one phase.
struct PhaseRunner {
    dispatcher: Arc<AgentDispatcher>,
    run_id: String,
    phase: String,
}

#[async_trait]
impl AgentRunner for PhaseRunner {
    async fn run(
        &self,
        request: &AgentRequest,
        _attempt: u32,
        cancel: &CancelToken,
    ) -> AgentOutput {
        self.dispatcher
            .invoke(&self.run_id, &self.phase, request, cancel)
            .await
    }
}

/// The engine owns every component instance; there are no globals.
pub struct Engine {
    config: EngineConfig,
    backend: Arc<dyn AgentBackend>,
    runs: RunStore,
    checkpoints: CheckpointStore,
    artifacts: Arc<ArtifactStore>,
    budget: Arc<BudgetController>,
    governance: GovernanceEngine,
    policies: governance::PolicyCache,
    cache: Arc<ContextCache>,
    events: Arc<EventBus>,
    cancels: Mutex<HashMap<String, CancelToken>>,
}

impl Engine {
    pub fn new(config: EngineConfig, backend: Arc<dyn AgentBackend>) -> Self {
        let runs_dir = config.runs_dir();
        Self {
            runs: RunStore::new(&runs_dir),
            checkpoints: CheckpointStore::new(&runs_dir),
            artifacts: Arc::new(ArtifactStore::new(config.blobs_dir(), &runs_dir)),
            budget: Arc::new(BudgetController::new(
                config.budget_limits,
                config.alert_threshold,
            )),
            governance: GovernanceEngine::new(governance::AuditLog::new(&runs_dir)),
            policies: governance::PolicyCache::new(config.policies_dir()),
            cache: Arc::new(ContextCache::new()),
            events: Arc::new(
                EventBus::new(config.event_buffer_capacity).with_log_root(&runs_dir),
            ),
            cancels: Mutex::new(HashMap::new()),
            backend,
            config,
        }
    }

    /// Create a run from a resolved intake and persist it.
    pub fn start(
        &self,
        intake: &Intake,
        profile_override: Option<Profile>,
        mode_override: Option<ExecutionMode>,
    ) -> Result<String, EngineError> {
        let profile = profile_override.unwrap_or_else(|| intake.profile());
        let mode = mode_override.unwrap_or(self.config.execution_mode);
        let mut run = Run::new(profile, intake.digest(), mode);

        if let Some(client_id) = intake
            .constraints
            .get("client_id")
            .and_then(|v| v.as_str())
        {
            run.metadata
                .insert("client_id".to_string(), client_id.to_string());
        }

        self.runs.save_intake(&run.run_id, intake)?;
        self.runs.save(&run)?;
        self.token_for(&run.run_id);

        self.events.emit(
            &run.run_id,
            EventDraft::new(
                EventType::RunStarted,
                format!("run started for '{}'", intake.project_name),
            )
            .with_payload(json!({
                "profile": profile.as_str(),
                "intake_digest": intake.digest(),
            })),
        );
        info!(run_id = %run.run_id, profile = %profile, "run started");
        Ok(run.run_id)
    }

    /// Execute the current phase. A run awaiting consensus, paused, or
    /// terminal is returned unchanged.
    pub async fn next(
        &self,
        run_id: &str,
        opts: NextOptions,
    ) -> Result<RunSummary, EngineError> {
        let _guard = self.runs.lock(run_id)?;
        let mut run = self.runs.load(run_id)?;

        if run.status != RunStatus::Running || run.current_phase.is_none() {
            return Ok(RunSummary::from_run(&run));
        }

        let result = self.run_phase(&mut run, &opts, None, false).await;
        if let Err(EngineError::Store(StoreError::Integrity { .. })) = &result {
            // Integrity failures are fatal for the run, never ignored.
            run.status = RunStatus::Aborted;
            run.touch();
            self.runs.save(&run)?;
            self.events.emit(
                run_id,
                EventDraft::new(
                    EventType::RunAborted,
                    "integrity failure; run aborted".to_string(),
                ),
            );
        }
        result?;
        Ok(RunSummary::from_run(&run))
    }

    /// Approve the pending consensus request and advance the run.
    pub fn approve(&self, run_id: &str) -> Result<RunSummary, EngineError> {
        let _guard = self.runs.lock(run_id)?;
        let mut run = self.runs.load(run_id)?;
        if run.status != RunStatus::AwaitingConsensus {
            return Err(EngineError::NoConsensusPending {
                run_id: run_id.to_string(),
            });
        }

        let phase = run.current_phase.clone().unwrap_or_default();
        self.events.emit(
            run_id,
            EventDraft::new(EventType::ConsensusApproved, "consensus approved")
                .with_phase(&phase),
        );

        run.status = RunStatus::Running;
        if !run.advance() {
            self.events.emit(
                run_id,
                EventDraft::new(EventType::RunCompleted, "run completed"),
            );
        }
        run.touch();
        self.runs.save(&run)?;
        Ok(RunSummary::from_run(&run))
    }

    /// Reject the pending consensus request; the run fails and no further
    /// phase executes.
    pub fn reject(&self, run_id: &str, reason: &str) -> Result<RunSummary, EngineError> {
        let _guard = self.runs.lock(run_id)?;
        let mut run = self.runs.load(run_id)?;
        if run.status != RunStatus::AwaitingConsensus {
            return Err(EngineError::NoConsensusPending {
                run_id: run_id.to_string(),
            });
        }

        let phase = run.current_phase.clone().unwrap_or_default();
        run.status = RunStatus::Failed;
        run.metadata.insert(
            "failure_reason".to_string(),
            "consensus_rejected".to_string(),
        );
        run.metadata
            .insert("rejection_detail".to_string(), reason.to_string());
        run.touch();
        self.runs.save(&run)?;

        self.events.emit(
            run_id,
            EventDraft::new(
                EventType::ConsensusRejected,
                format!("consensus rejected: {reason}"),
            )
            .with_phase(&phase),
        );
        Ok(RunSummary::from_run(&run))
    }

    /// Replay the failed subset of a phase under its existing PRE
    /// checkpoint.
    pub async fn retry(
        &self,
        run_id: &str,
        phase: &str,
        agent: Option<&str>,
    ) -> Result<RunSummary, EngineError> {
        let _guard = self.runs.lock(run_id)?;
        let mut run = self.runs.load(run_id)?;

        if run.current_phase.as_deref() != Some(phase) {
            return Err(EngineError::UnknownPhase {
                run_id: run_id.to_string(),
                phase: phase.to_string(),
            });
        }
        let record = run.phase_record_mut(phase);
        if record.attempt_count >= self.config.phase_retry_limit {
            return Err(EngineError::RetryLimit {
                run_id: run_id.to_string(),
                phase: phase.to_string(),
                limit: self.config.phase_retry_limit,
            });
        }

        let subset: Option<HashSet<String>> = match agent {
            Some(agent_id) => Some(HashSet::from([agent_id.to_string()])),
            None if record.failed_agent_ids.is_empty() => None,
            None => Some(record.failed_agent_ids.iter().cloned().collect()),
        };

        run.status = RunStatus::Running;
        run.metadata.remove("pause_reason");
        self.run_phase(&mut run, &NextOptions::default(), subset, true)
            .await?;
        Ok(RunSummary::from_run(&run))
    }

    /// Roll the run back to a target checkpoint.
    pub fn rollback(
        &self,
        run_id: &str,
        target_checkpoint_id: &Uuid,
    ) -> Result<RunSummary, EngineError> {
        let _guard = self.runs.lock(run_id)?;
        let mut run = self.runs.load(run_id)?;

        let checkpoint =
            self.checkpoints
                .rollback(&mut run, target_checkpoint_id, &self.artifacts)?;

        // Phases past the restored cursor go back to pending.
        let completed: HashSet<String> = run.completed_phases.iter().cloned().collect();
        for (phase, record) in run.phase_records.iter_mut() {
            if !completed.contains(phase) {
                record.status = PhaseStatus::Pending;
                record.failed_agent_ids.clear();
                record.last_error = None;
                record.remediation_hints.clear();
            }
        }

        run.status = RunStatus::Running;
        run.metadata.remove("pause_reason");
        run.touch();
        self.runs.save(&run)?;

        self.events.emit(
            run_id,
            EventDraft::new(
                EventType::RollbackPerformed,
                format!("rolled back to checkpoint {target_checkpoint_id}"),
            )
            .with_phase(&checkpoint.phase)
            .with_payload(json!({
                "target_checkpoint_id": target_checkpoint_id.to_string(),
                "rollback_checkpoint_id": checkpoint.checkpoint_id.to_string(),
                "rollback_version": checkpoint.version,
            })),
        );
        Ok(RunSummary::from_run(&run))
    }

    /// Abort a run. An in-flight phase observes the cancellation signal at
    /// its next suspension point and finalizes the abort itself.
    pub fn abort(&self, run_id: &str) -> Result<RunSummary, EngineError> {
        self.token_for(run_id).cancel();

        match self.runs.lock(run_id) {
            Ok(_guard) => {
                let mut run = self.runs.load(run_id)?;
                if run.status.is_terminal() {
                    return Ok(RunSummary::from_run(&run));
                }
                run.status = RunStatus::Aborted;
                run.metadata
                    .insert("abort_reason".to_string(), "operator".to_string());
                run.touch();
                self.runs.save(&run)?;
                self.events.emit(
                    run_id,
                    EventDraft::new(EventType::RunAborted, "run aborted by operator"),
                );
                Ok(RunSummary::from_run(&run))
            }
            Err(StoreError::RunLocked { .. }) => {
                // The in-flight phase will see the cancelled token.
                Ok(RunSummary::from_run(&self.runs.load(run_id)?))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Rehydrate a run for continued execution. A paused run returns to
    /// running; terminal runs cannot resume.
    pub fn resume(&self, run_id: &str) -> Result<RunSummary, EngineError> {
        let _guard = self.runs.lock(run_id)?;
        let mut run = self.runs.load(run_id)?;

        if run.status.is_terminal() {
            return Err(EngineError::InvalidTransition {
                run_id: run_id.to_string(),
                status: run.status.to_string(),
                action: "resume".to_string(),
            });
        }

        let discarded = self.checkpoints.discard_partial(run_id)?;
        if discarded > 0 {
            warn!(run_id, discarded, "discarded half-written checkpoints");
        }

        // A fresh token: any previous cancellation is spent.
        self.cancels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(run_id.to_string(), CancelToken::new());

        if run.status == RunStatus::Paused {
            run.status = RunStatus::Running;
            run.metadata.remove("pause_reason");
            run.touch();
            self.runs.save(&run)?;
        }
        Ok(RunSummary::from_run(&run))
    }

    /// Runs that were in flight when the process last stopped.
    pub fn scan_resumable(&self) -> Result<Vec<RunSummary>, EngineError> {
        Ok(self
            .runs
            .scan_resumable()?
            .iter()
            .map(RunSummary::from_run)
            .collect())
    }

    pub fn status(&self, run_id: &str) -> Result<RunSummary, EngineError> {
        Ok(RunSummary::from_run(&self.runs.load(run_id)?))
    }

    pub fn metrics(&self, run_id: &str) -> Result<UsageReport, EngineError> {
        let run = self.runs.load(run_id)?;
        Ok(report::usage_report(&run, &self.budget.report(run_id)))
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn governance(&self) -> &GovernanceEngine {
        &self.governance
    }

    pub fn policies(&self) -> &governance::PolicyCache {
        &self.policies
    }

    pub fn context_cache(&self) -> &ContextCache {
        &self.cache
    }

    fn token_for(&self, run_id: &str) -> CancelToken {
        self.cancels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(run_id.to_string())
            .or_default()
            .clone()
    }

    fn effective_policy(&self, run: &Run) -> Result<Arc<Policy>, EngineError> {
        Ok(self
            .policies
            .effective(run.metadata.get("client_id").map(String::as_str))?)
    }

    fn consensus_boundaries(policy: &Policy, profile: Profile) -> Vec<String> {
        policy.consensus_boundaries.clone().unwrap_or_else(|| {
            profile
                .default_consensus_boundaries()
                .into_iter()
                .map(String::from)
                .collect()
        })
    }

    fn pins_from_manifest(&self, manifest: &Manifest) -> Result<BTreeMap<String, ArtifactPin>, StoreError> {
        let mut pins = BTreeMap::new();
        for entry in &manifest.entries {
            if !self.artifacts.has_blob(&entry.blob_hash) {
                return Err(StoreError::BlobNotFound {
                    hash: entry.blob_hash.clone(),
                });
            }
            pins.insert(
                entry.logical_name.clone(),
                ArtifactPin {
                    stable_path: ident::blob_rel_path(&entry.blob_hash).display().to_string(),
                    blob_hash: entry.blob_hash.clone(),
                    size: entry.size,
                },
            );
        }
        Ok(pins)
    }

    fn checkpoint_spec(
        &self,
        run: &Run,
        phase: &str,
        kind: CheckpointKind,
        outcome: Option<&PhaseOutcome>,
        duration_ms: u64,
    ) -> Result<CheckpointSpec, StoreError> {
        let mut spec = CheckpointSpec::new(run, phase, kind);
        spec.artifacts = self.pins_from_manifest(&self.artifacts.load_manifest(&run.run_id)?)?;
        spec.duration_ms = duration_ms;
        if let Some(outcome) = outcome {
            for output in &outcome.results {
                spec.agent_states.insert(
                    output.agent_id.clone(),
                    AgentStateSnapshot {
                        status: output.status,
                        token_usage: output.token_usage,
                        output_summary: output.summary.clone(),
                    },
                );
            }
        }
        Ok(spec)
    }

    fn emit_checkpoint_created(&self, run_id: &str, checkpoint: &Checkpoint) {
        self.events.emit(
            run_id,
            EventDraft::new(
                EventType::CheckpointCreated,
                format!(
                    "{} checkpoint v{} for '{}'",
                    checkpoint.kind, checkpoint.version, checkpoint.phase
                ),
            )
            .with_phase(&checkpoint.phase)
            .with_payload(json!({
                "checkpoint_id": checkpoint.checkpoint_id.to_string(),
                "kind": checkpoint.kind.as_str(),
                "version": checkpoint.version,
            })),
        );
    }

    /// The per-phase protocol: PRE checkpoint, roster, swarm, artifact
    /// validation, POST checkpoint, governance, consensus, advance.
    async fn run_phase(
        &self,
        run: &mut Run,
        opts: &NextOptions,
        subset: Option<HashSet<String>>,
        skip_pre: bool,
    ) -> Result<(), EngineError> {
        let phase = run
            .current_phase
            .clone()
            .ok_or_else(|| EngineError::InvalidTransition {
                run_id: run.run_id.clone(),
                status: run.status.to_string(),
                action: "next".to_string(),
            })?;
        let run_id = run.run_id.clone();
        let started = Instant::now();

        let intake = self.runs.load_intake(&run_id)?;
        let policy = self.effective_policy(run)?;

        // 1. PRE checkpoint (retries re-use the existing one).
        if !skip_pre {
            let spec = self.checkpoint_spec(run, &phase, CheckpointKind::Pre, None, 0)?;
            let pre = self.checkpoints.create(spec)?;
            run.phase_record_mut(&phase).checkpoint_ids.push(pre.checkpoint_id);
            self.emit_checkpoint_created(&run_id, &pre);
        }

        {
            let record = run.phase_record_mut(&phase);
            record.status = PhaseStatus::Running;
            record.attempt_count += 1;
            if record.started_at.is_none() {
                record.started_at = Some(Utc::now());
            }
        }
        self.runs.save(run)?;

        // 2. Roster from the planner, optionally narrowed to a retry subset.
        let full_roster = planner::derive_roster(&intake, &policy, run.profile, &phase);
        let roster = match &subset {
            None => full_roster,
            Some(keep) => {
                let mut agents: Vec<AgentRequest> = full_roster
                    .agents
                    .into_iter()
                    .filter(|a| keep.contains(&a.agent_id))
                    .collect();
                let kept: HashSet<String> =
                    agents.iter().map(|a| a.agent_id.clone()).collect();
                for agent in &mut agents {
                    // Upstream dependencies already completed in the prior
                    // attempt.
                    agent.dependency_refs.retain(|d| kept.contains(d));
                }
                AgentRoster::new(agents)
            }
        };
        {
            let record = run.phase_record_mut(&phase);
            if record.agent_ids.is_empty() {
                record.agent_ids = roster.agent_ids();
            }
        }

        self.events.emit(
            &run_id,
            EventDraft::new(EventType::PhaseStarted, format!("phase '{phase}' started"))
                .with_phase(&phase)
                .with_payload(json!({ "agents": roster.agent_ids() })),
        );

        // 3. Swarm dispatch.
        let timeout = opts.timeout.unwrap_or(self.config.agent_timeout);
        let concurrency = if opts.parallel {
            opts.max_workers.unwrap_or(self.config.concurrency_limit)
        } else {
            1
        };
        let dispatcher = Arc::new(
            AgentDispatcher::new(
                self.backend.clone(),
                self.artifacts.clone(),
                self.budget.clone(),
                self.cache.clone(),
                self.events.clone(),
            )
            .with_timeout(timeout)
            .with_execution_mode(run.execution_mode),
        );
        let runner = Arc::new(PhaseRunner {
            dispatcher: dispatcher.clone(),
            run_id: run_id.clone(),
            phase: phase.clone(),
        });
        let cancel = self.token_for(&run_id);
        let executor = SwarmExecutor::new(
            SwarmConfig::default()
                .with_concurrency_limit(concurrency)
                .with_retry_budget(self.config.retry_budget),
        );
        let outcome = executor.execute(&roster, runner, cancel.clone()).await?;

        // 4. Collect usage and artifacts into the phase record.
        let attempt_usage = outcome
            .results
            .iter()
            .fold(TokenUsage::default(), |mut acc, o| {
                acc += o.token_usage;
                acc
            });
        {
            let record = run.phase_record_mut(&phase);
            record.token_usage += attempt_usage;
            record
                .artifact_ids
                .extend(outcome.results.iter().flat_map(|o| {
                    o.artifacts.iter().map(|a| a.artifact_id)
                }));
        }

        if !outcome.success {
            return self.finish_failed_phase(run, &phase, &outcome, started).await;
        }

        // Validate required artifacts against the roster's declared schemas.
        if let Some(missing) = self.missing_artifact(&run_id, &phase, &roster)? {
            let record = run.phase_record_mut(&phase);
            record.status = PhaseStatus::Failed;
            record.ended_at = Some(Utc::now());
            record.last_error =
                Some(format!("required artifact '{missing}' was not produced"));
            record.remediation_hints =
                vec![format!("re-run the phase so '{missing}' is registered")];
            record.failed_agent_ids = roster.agent_ids();

            let spec = self.checkpoint_spec(
                run,
                &phase,
                CheckpointKind::PostFailed,
                Some(&outcome),
                started.elapsed().as_millis() as u64,
            )?;
            let checkpoint = self.checkpoints.create(spec)?;
            run.phase_record_mut(&phase).checkpoint_ids.push(checkpoint.checkpoint_id);
            self.emit_checkpoint_created(&run_id, &checkpoint);

            run.status = RunStatus::Paused;
            run.metadata
                .insert("pause_reason".to_string(), "phase_failed".to_string());
            run.touch();
            self.runs.save(run)?;
            self.events.emit(
                &run_id,
                EventDraft::new(
                    EventType::PhaseFailed,
                    format!("phase '{phase}' failed: missing artifact '{missing}'"),
                )
                .with_phase(&phase),
            );
            return Ok(());
        }

        // 5. POST checkpoint.
        let mut spec = self.checkpoint_spec(
            run,
            &phase,
            CheckpointKind::Post,
            Some(&outcome),
            started.elapsed().as_millis() as u64,
        )?;

        // 6. Governance over the transition.
        let ctx = PhaseContext {
            run_id: &run_id,
            phase: &phase,
            artifacts: &self.artifacts,
            workspace: None,
        };
        let governance_outcome = self
            .governance
            .evaluate(&policy, &ctx, dispatcher.as_ref())
            .await?;
        spec.governance_results = governance_outcome.results.clone();
        let post = self.checkpoints.create(spec)?;
        run.phase_record_mut(&phase).checkpoint_ids.push(post.checkpoint_id);
        self.emit_checkpoint_created(&run_id, &post);

        {
            let record = run.phase_record_mut(&phase);
            record.governance_verdict = Some(governance_outcome.verdict.clone());
            record.failed_agent_ids.clear();
        }

        match &governance_outcome.verdict {
            GovernanceVerdict::Block => {
                let hints = governance_outcome.remediation_hints();
                self.events.emit(
                    &run_id,
                    EventDraft::new(
                        EventType::GovernanceCheckFailed,
                        format!("phase '{phase}' blocked by governance"),
                    )
                    .with_phase(&phase)
                    .with_payload(json!({
                        "blocked": governance_outcome
                            .results
                            .iter()
                            .filter(|r| r.status == governance::GateStatus::Block)
                            .map(|r| r.gate_id.clone())
                            .collect::<Vec<_>>(),
                    })),
                );
                let record = run.phase_record_mut(&phase);
                record.last_error = Some("blocked by governance gate".to_string());
                record.remediation_hints = hints;

                run.status = RunStatus::Paused;
                run.metadata
                    .insert("pause_reason".to_string(), "gate_block".to_string());
                run.touch();
                self.runs.save(run)?;
                return Ok(());
            }
            verdict => {
                self.events.emit(
                    &run_id,
                    EventDraft::new(
                        EventType::GovernanceCheckPassed,
                        format!("phase '{phase}' passed governance"),
                    )
                    .with_phase(&phase)
                    .with_payload(json!({
                        "verdict": verdict,
                        "warnings": governance_outcome
                            .results
                            .iter()
                            .filter(|r| r.status == governance::GateStatus::Warn)
                            .count(),
                    })),
                );
            }
        }

        {
            let record = run.phase_record_mut(&phase);
            record.status = PhaseStatus::Complete;
            record.ended_at = Some(Utc::now());
            record.last_error = None;
        }
        self.runs.save(run)?;
        self.events.emit(
            &run_id,
            EventDraft::new(
                EventType::PhaseCompleted,
                format!("phase '{phase}' completed"),
            )
            .with_phase(&phase),
        );

        // 7. Consensus boundary: hold for human review.
        let boundaries = Self::consensus_boundaries(&policy, run.profile);
        if boundaries.iter().any(|b| b == &phase) {
            run.status = RunStatus::AwaitingConsensus;
            run.touch();
            self.runs.save(run)?;
            self.events.emit(
                &run_id,
                EventDraft::new(
                    EventType::ConsensusRequested,
                    format!("human review requested after '{phase}'"),
                )
                .with_phase(&phase)
                .with_payload(json!({
                    "checkpoint_id": post.checkpoint_id.to_string(),
                    "checkpoint_digest": post.content_digest,
                })),
            );
            return Ok(());
        }

        // 8. Advance the cursor.
        if !run.advance() {
            self.events.emit(
                &run_id,
                EventDraft::new(EventType::RunCompleted, "run completed"),
            );
        }
        run.touch();
        self.runs.save(run)?;
        Ok(())
    }

    async fn finish_failed_phase(
        &self,
        run: &mut Run,
        phase: &str,
        outcome: &PhaseOutcome,
        started: Instant,
    ) -> Result<(), EngineError> {
        let run_id = run.run_id.clone();
        let first_failure = outcome
            .results
            .iter()
            .find_map(|o| o.failure.as_ref().map(|f| (o.agent_id.clone(), f.clone())));

        {
            let record = run.phase_record_mut(phase);
            record.status = PhaseStatus::Failed;
            record.ended_at = Some(Utc::now());
            record.failed_agent_ids = outcome.failed_agent_ids();
            record.failed_agent_ids.extend(outcome.skipped.clone());
            if let Some((agent_id, failure)) = &first_failure {
                record.last_error =
                    Some(format!("agent '{agent_id}' failed: {}", failure.message));
                record.remediation_hints = failure.remediation.clone();
            } else if outcome.cancelled {
                record.last_error = Some("phase cancelled".to_string());
            }
        }

        let mut spec = self.checkpoint_spec(
            run,
            phase,
            CheckpointKind::PostFailed,
            Some(outcome),
            started.elapsed().as_millis() as u64,
        )?;
        spec.metadata.insert(
            "reason".to_string(),
            if outcome.cancelled {
                "cancelled".to_string()
            } else {
                "agent_failure".to_string()
            },
        );
        let checkpoint = self.checkpoints.create(spec)?;
        run.phase_record_mut(phase).checkpoint_ids.push(checkpoint.checkpoint_id);
        self.emit_checkpoint_created(&run_id, &checkpoint);

        self.events.emit(
            &run_id,
            EventDraft::new(EventType::PhaseFailed, format!("phase '{phase}' failed"))
                .with_phase(phase)
                .with_payload(json!({
                    "failed_agents": outcome.failed_agent_ids(),
                    "skipped_agents": outcome.skipped,
                    "cancelled": outcome.cancelled,
                })),
        );

        if outcome.cancelled {
            run.status = RunStatus::Aborted;
            run.metadata
                .insert("abort_reason".to_string(), "cancelled".to_string());
            self.events.emit(
                &run_id,
                EventDraft::new(EventType::RunAborted, "run aborted"),
            );
        } else {
            run.status = RunStatus::Paused;
            run.metadata
                .insert("pause_reason".to_string(), "phase_failed".to_string());
        }
        run.touch();
        self.runs.save(run)?;
        Ok(())
    }

    /// First required artifact missing from the phase's production, if any.
    fn missing_artifact(
        &self,
        run_id: &str,
        phase: &str,
        roster: &AgentRoster,
    ) -> Result<Option<String>, StoreError> {
        let produced: HashSet<String> = self
            .artifacts
            .list_by_phase(run_id, phase)?
            .into_iter()
            .map(|a| a.logical_name)
            .collect();
        for agent in &roster.agents {
            for required in agent.role.required_artifacts() {
                if !produced.contains(required.logical_name) {
                    return Ok(Some(required.logical_name.to_string()));
                }
            }
        }
        Ok(None)
    }
}
