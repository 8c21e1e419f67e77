//! Swarm execution: dependency-ordered, bounded-concurrency agent dispatch.

pub mod executor;
pub mod graph;

pub use executor::{AgentRunner, PhaseOutcome, SwarmConfig, SwarmExecutor};
pub use graph::RosterGraph;

use tokio::sync::watch;

/// Cooperative cancellation signal shared by a run, the swarm, and in-flight
/// agents. Cancellation is observed at suspension points; nothing is killed.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: std::sync::Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
            rx,
        }
    }

    /// Signal cancellation to every clone of this token.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
