//! Typed error hierarchy for the Conductor engine.
//!
//! Each subsystem has its own enum:
//! - `StoreError` — artifact, checkpoint, and run store failures
//! - `SwarmError` — roster graph and dispatch failures
//! - `IntakeError` — intake document parse/schema failures
//! - `BudgetError` — admission denials
//! - `EngineError` — run state machine failures
//!
//! `FailureKind` classifies agent-level failures for the retry policy.

use thiserror::Error;

/// Classification of an agent or gate failure, driving retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Retryable: model timeout, rate limit, transport error.
    Transient,
    /// Not retryable: schema violation, contract mismatch, missing artifact.
    Permanent,
    /// Blocked by a governance gate; operator action required.
    PolicyViolation,
    /// Hash mismatch loading a blob or checkpoint. Fatal for the operation.
    Integrity,
    /// Budget admission denied after strategy downgrade.
    Budget,
    /// Cooperative cancellation (including timeouts).
    Cancelled,
}

impl FailureKind {
    /// Whether the swarm executor may retry an agent that failed this way.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// Errors from the artifact, checkpoint, and run stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Integrity failure for {subject}: expected {expected}, got {actual}")]
    Integrity {
        subject: String,
        expected: String,
        actual: String,
    },

    #[error("Blob {hash} not found")]
    BlobNotFound { hash: String },

    #[error("Artifact {artifact_id} not found in run {run_id}")]
    ArtifactNotFound { run_id: String, artifact_id: String },

    #[error("Checkpoint {checkpoint_id} not found")]
    CheckpointNotFound { checkpoint_id: String },

    #[error("Run {run_id} not found")]
    RunNotFound { run_id: String },

    #[error("Run {run_id} is locked by another writer")]
    RunLocked { run_id: String },

    #[error("Serialization error for {subject}: {source}")]
    Serde {
        subject: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn io(path: impl Into<std::path::PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors from the swarm executor.
#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("Invalid roster graph: cycle involving agents {participants:?}")]
    InvalidGraph { participants: Vec<String> },

    #[error("Agent '{agent_id}' references unknown dependency '{dependency}'")]
    UnknownDependency { agent_id: String, dependency: String },

    #[error("Duplicate agent id '{agent_id}' in roster")]
    DuplicateAgent { agent_id: String },

    #[error("Swarm dispatch failed: {0}")]
    Dispatch(String),
}

/// Error raised when an intake document fails its schema check.
#[derive(Debug, Error)]
#[error("Intake error in section '{section}', field '{field}': {reason}")]
pub struct IntakeError {
    pub section: String,
    pub field: String,
    pub reason: String,
}

impl IntakeError {
    pub fn new(section: &str, field: &str, reason: impl Into<String>) -> Self {
        Self {
            section: section.to_string(),
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors from the budget controller.
#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("Budget denied at {scope} '{key}': {reason}")]
    Denied {
        scope: String,
        key: String,
        reason: String,
    },
}

/// Errors from the run engine state machine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Unknown run {run_id}")]
    UnknownRun { run_id: String },

    #[error("Run {run_id} is {status}; cannot {action}")]
    InvalidTransition {
        run_id: String,
        status: String,
        action: String,
    },

    #[error("Run {run_id} has no consensus request pending")]
    NoConsensusPending { run_id: String },

    #[error("Retry limit ({limit}) reached for phase '{phase}' of run {run_id}")]
    RetryLimit {
        run_id: String,
        phase: String,
        limit: u32,
    },

    #[error("Phase '{phase}' is not part of run {run_id}")]
    UnknownPhase { run_id: String, phase: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Swarm(#[from] SwarmError),

    #[error(transparent)]
    Intake(#[from] IntakeError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
