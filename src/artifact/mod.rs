//! Artifact types and the content-addressed artifact store.
//!
//! Artifacts are immutable named outputs produced by agents. Their bytes are
//! stored once per content hash; each `put` records a distinct reference
//! carrying producer metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod store;
pub use store::ArtifactStore;

/// Semantic type of an artifact's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Markdown,
    Json,
    Code,
    Yaml,
    Tabular,
}

/// Reference to a stored artifact. Bytes are resolved through the blob hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub artifact_id: Uuid,
    pub run_id: String,
    pub producing_phase: String,
    pub producing_agent: String,
    pub logical_name: String,
    pub artifact_type: ArtifactType,
    pub blob_hash: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// The per-run manifest indexing logical names to artifact references.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    pub entries: Vec<ArtifactRef>,
}

impl Manifest {
    /// Latest entry for a logical name, if any.
    pub fn find(&self, logical_name: &str) -> Option<&ArtifactRef> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.logical_name == logical_name)
    }

    /// Entry for a specific artifact id.
    pub fn find_by_id(&self, artifact_id: &Uuid) -> Option<&ArtifactRef> {
        self.entries.iter().find(|e| &e.artifact_id == artifact_id)
    }

    /// Entries produced by a specific phase, in insertion order.
    pub fn for_phase(&self, phase: &str) -> Vec<&ArtifactRef> {
        self.entries
            .iter()
            .filter(|e| e.producing_phase == phase)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact_ref(name: &str, phase: &str) -> ArtifactRef {
        ArtifactRef {
            artifact_id: Uuid::new_v4(),
            run_id: "run-1".to_string(),
            producing_phase: phase.to_string(),
            producing_agent: "developer".to_string(),
            logical_name: name.to_string(),
            artifact_type: ArtifactType::Markdown,
            blob_hash: "00".repeat(32),
            size: 10,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_manifest_find_returns_latest() {
        let mut manifest = Manifest::default();
        let first = artifact_ref("plan", "planning");
        let second = artifact_ref("plan", "planning");
        manifest.entries.push(first.clone());
        manifest.entries.push(second.clone());

        let found = manifest.find("plan").unwrap();
        assert_eq!(found.artifact_id, second.artifact_id);
    }

    #[test]
    fn test_manifest_for_phase_filters() {
        let mut manifest = Manifest::default();
        manifest.entries.push(artifact_ref("plan", "planning"));
        manifest.entries.push(artifact_ref("design", "architecture"));
        manifest.entries.push(artifact_ref("adr", "architecture"));

        assert_eq!(manifest.for_phase("architecture").len(), 2);
        assert_eq!(manifest.for_phase("qa").len(), 0);
    }

    #[test]
    fn test_artifact_type_serde_snake_case() {
        let json = serde_json::to_string(&ArtifactType::Tabular).unwrap();
        assert_eq!(json, "\"tabular\"");
    }
}
