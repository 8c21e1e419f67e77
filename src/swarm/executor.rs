//! The swarm executor: runs a roster level by level.
//!
//! Levels come from the roster graph; within a level up to
//! `concurrency_limit` agents run at once. Transient failures are retried
//! with exponential backoff up to the per-agent retry budget. A permanent
//! failure (or an exhausted retry budget) stops dispatch of later levels
//! while already-scheduled peers finish. Results always come back in roster
//! order.

use crate::agent::{AgentOutput, AgentRequest, AgentStatus};
use crate::errors::SwarmError;
use crate::swarm::CancelToken;
use crate::swarm::graph::RosterGraph;
use crate::agent::AgentRoster;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Configuration for swarm execution.
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    /// Maximum agents running concurrently within a phase.
    pub concurrency_limit: usize,
    /// Transient retries per agent.
    pub retry_budget: u32,
    /// Base delay for exponential backoff between retries.
    pub retry_base_delay: Duration,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 4,
            retry_budget: 2,
            retry_base_delay: Duration::from_millis(500),
        }
    }
}

impl SwarmConfig {
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit.max(1);
        self
    }

    pub fn with_retry_budget(mut self, budget: u32) -> Self {
        self.retry_budget = budget;
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }
}

/// How the executor reaches the agent dispatcher.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, request: &AgentRequest, attempt: u32, cancel: &CancelToken)
    -> AgentOutput;
}

/// Result of executing one phase's roster.
#[derive(Debug, Clone)]
pub struct PhaseOutcome {
    /// True when every agent succeeded and none were skipped.
    pub success: bool,
    /// True when execution stopped due to cancellation.
    pub cancelled: bool,
    /// Outputs of dispatched agents, in roster order.
    pub results: Vec<AgentOutput>,
    /// Agents never dispatched because an earlier level failed, in roster
    /// order.
    pub skipped: Vec<String>,
}

impl PhaseOutcome {
    pub fn output_for(&self, agent_id: &str) -> Option<&AgentOutput> {
        self.results.iter().find(|o| o.agent_id == agent_id)
    }

    pub fn failed_agent_ids(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|o| !o.is_success())
            .map(|o| o.agent_id.clone())
            .collect()
    }
}

/// Dependency-ordered, bounded-concurrency executor.
pub struct SwarmExecutor {
    config: SwarmConfig,
}

impl SwarmExecutor {
    pub fn new(config: SwarmConfig) -> Self {
        Self { config }
    }

    /// Execute the roster. The graph is validated before any agent is
    /// dispatched; an invalid graph invokes nothing.
    pub async fn execute(
        &self,
        roster: &AgentRoster,
        runner: Arc<dyn AgentRunner>,
        cancel: CancelToken,
    ) -> Result<PhaseOutcome, SwarmError> {
        let graph = RosterGraph::build(roster)?;
        let levels = graph.levels();
        debug!(agents = graph.len(), levels = levels.len(), "roster graph built");

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency_limit));
        let mut outputs: HashMap<usize, AgentOutput> = HashMap::new();
        let mut halted = false;

        for level in levels {
            if halted || cancel.is_cancelled() {
                break;
            }

            let mut join_set: JoinSet<(usize, AgentOutput)> = JoinSet::new();
            for &idx in &level {
                if cancel.is_cancelled() {
                    break;
                }
                let semaphore = semaphore.clone();
                let runner = runner.clone();
                let request = graph.agent(idx).clone();
                let cancel = cancel.clone();
                let retry_budget = self.config.retry_budget;
                let base_delay = self.config.retry_base_delay;

                join_set.spawn(async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => {
                            return (
                                idx,
                                AgentOutput::failed(
                                    &request,
                                    crate::agent::AgentFailure::new(
                                        crate::errors::FailureKind::Cancelled,
                                        "executor shut down",
                                    ),
                                ),
                            );
                        }
                    };
                    let mut attempt = 0;
                    loop {
                        let output = runner.run(&request, attempt, &cancel).await;
                        let retryable = output
                            .failure
                            .as_ref()
                            .map(|f| f.kind.is_retryable())
                            .unwrap_or(false);
                        if retryable && attempt < retry_budget && !cancel.is_cancelled() {
                            let delay = base_delay * 2u32.saturating_pow(attempt);
                            warn!(
                                agent_id = %request.agent_id,
                                attempt,
                                "transient agent failure, retrying"
                            );
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                            continue;
                        }
                        return (idx, output);
                    }
                });
            }

            // The level completes when every scheduled agent finishes,
            // success or failure.
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok((idx, output)) => {
                        if !output.is_success() {
                            halted = true;
                        }
                        outputs.insert(idx, output);
                    }
                    Err(e) => {
                        warn!(error = %e, "agent task panicked");
                        halted = true;
                    }
                }
            }
        }

        let mut results = Vec::new();
        let mut skipped = Vec::new();
        for idx in 0..graph.len() {
            match outputs.remove(&idx) {
                Some(output) => results.push(output),
                None => skipped.push(graph.agent(idx).agent_id.clone()),
            }
        }

        let cancelled = cancel.is_cancelled()
            || results.iter().any(|o| o.status == AgentStatus::Cancelled);
        let success = skipped.is_empty() && results.iter().all(AgentOutput::is_success);

        Ok(PhaseOutcome {
            success,
            cancelled,
            results,
            skipped,
        })
    }
}
