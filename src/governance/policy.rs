//! Policy documents and hierarchical composition.
//!
//! Policies layer universal → organization → client. Composition is
//! child-overrides-parent: map-valued sections merge shallowly (per key,
//! child value replaces), scalars replace, and list-valued keys replace
//! wholesale.

use crate::governance::gates::Gate;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// One policy layer as loaded from disk, or the composed effective policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Policy {
    /// Revision marker used for cache keying.
    #[serde(default)]
    pub revision: Option<String>,
    /// Free-form keyed configuration (scalars, lists, one-level maps).
    #[serde(default)]
    pub settings: serde_json::Map<String, Value>,
    /// Gate declarations. Absent means "inherit from parent layer".
    #[serde(default)]
    pub gates: Option<Vec<Gate>>,
    /// Consensus boundary override. Absent means profile defaults apply.
    #[serde(default)]
    pub consensus_boundaries: Option<Vec<String>>,
}

impl Policy {
    /// Parse a policy layer from YAML text.
    pub fn parse(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("Failed to parse policy document")
    }

    /// Load a policy layer from a file; a missing file is an empty layer.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read policy file {}", path.display()))?;
        Self::parse(&text)
    }

    /// Layer `child` over `self`, producing the effective policy.
    pub fn compose(&self, child: &Policy) -> Policy {
        let mut settings = self.settings.clone();
        for (key, value) in &child.settings {
            match (settings.get_mut(key), value) {
                // Shallow merge for map-valued keys: child entries override.
                (Some(Value::Object(base)), Value::Object(overlay)) => {
                    for (k, v) in overlay {
                        base.insert(k.clone(), v.clone());
                    }
                }
                // Scalars and lists replace wholesale.
                _ => {
                    settings.insert(key.clone(), value.clone());
                }
            }
        }

        Policy {
            revision: child.revision.clone().or_else(|| self.revision.clone()),
            settings,
            gates: child.gates.clone().or_else(|| self.gates.clone()),
            consensus_boundaries: child
                .consensus_boundaries
                .clone()
                .or_else(|| self.consensus_boundaries.clone()),
        }
    }

    /// The effective gate list.
    pub fn gates(&self) -> &[Gate] {
        self.gates.as_deref().unwrap_or(&[])
    }

    /// A scalar setting as a string, if present.
    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(Value::as_str)
    }

    /// A boolean setting, defaulting to `false`.
    pub fn setting_bool(&self, key: &str) -> bool {
        self.settings
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Compose the three standard layers.
pub fn compose(universal: &Policy, org: &Policy, client: &Policy) -> Policy {
    universal.compose(org).compose(client)
}

/// Cache of composed policies keyed by (universal_rev, org_rev, client_id).
/// Read-mostly; invalidated by explicit admin action.
pub struct PolicyCache {
    policies_dir: PathBuf,
    cache: RwLock<HashMap<(String, String, String), Arc<Policy>>>,
}

impl PolicyCache {
    pub fn new(policies_dir: impl Into<PathBuf>) -> Self {
        Self {
            policies_dir: policies_dir.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Load and compose the effective policy for a client. Results are
    /// cached under the revision markers of the loaded layers.
    pub fn effective(&self, client_id: Option<&str>) -> Result<Arc<Policy>> {
        let universal = Policy::load(&self.policies_dir.join("universal.yaml"))?;
        let org = Policy::load(&self.policies_dir.join("org.yaml"))?;
        let client = match client_id {
            Some(id) => Policy::load(&self.policies_dir.join("clients").join(format!("{id}.yaml")))?,
            None => Policy::default(),
        };

        let key = (
            universal.revision.clone().unwrap_or_default(),
            org.revision.clone().unwrap_or_default(),
            client_id.unwrap_or_default().to_string(),
        );

        if let Some(cached) = self
            .cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
        {
            return Ok(cached.clone());
        }

        let composed = Arc::new(compose(&universal, &org, &client));
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, composed.clone());
        Ok(composed)
    }

    /// Drop all cached compositions.
    pub fn invalidate(&self) {
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}
