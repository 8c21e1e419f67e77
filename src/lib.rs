//! Conductor: a multi-agent workflow engine.
//!
//! Drives a project intake through a profile-selected phase graph. Each
//! phase runs a roster of agents under bounded concurrency, checkpoints the
//! boundary, evaluates governance gates, and pauses at human-review
//! boundaries. Everything is resumable from persisted state.

pub mod agent;
pub mod artifact;
pub mod budget;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod engine;
pub mod errors;
pub mod events;
pub mod governance;
pub mod ident;
pub mod intake;
pub mod planner;
pub mod profile;
pub mod swarm;

pub use agent::{AgentBackend, AgentDispatcher, AgentRole, ScriptedBackend};
pub use config::{BudgetLimits, EngineConfig, ExecutionMode};
pub use engine::{Engine, NextOptions, Run, RunStatus, RunSummary};
pub use errors::{EngineError, FailureKind, IntakeError, StoreError, SwarmError};
pub use intake::Intake;
pub use profile::Profile;

/// Install a tracing subscriber honoring `RUST_LOG`. Call once from the
/// hosting process; library code only emits spans and events.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .try_init();
}
