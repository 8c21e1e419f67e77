//! Intake loader and schema check.
//!
//! The intake document is the structured project description consumed by the
//! run engine. It is parsed from YAML (JSON is a YAML subset), checked
//! against the set of recognized sections, canonicalized, and digested so a
//! run records exactly which intake it executed.

use crate::errors::IntakeError;
use crate::ident;
use crate::profile::Profile;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Recognized top-level sections. Anything else fails the schema check.
const RECOGNIZED_SECTIONS: &[&str] = &[
    "project_name",
    "project_type",
    "description",
    "requirements",
    "environment",
    "constraints",
    "data",
    "compliance",
    "performance_slas",
    "brand_constraints",
];

/// Markers in requirements or data hints that indicate database work.
const DATABASE_MARKERS: &[&str] = &["database", "sql", "schema", "postgres", "warehouse", "table"];

/// Markers that indicate performance-sensitive requirements.
const PERFORMANCE_MARKERS: &[&str] = &["performance", "latency", "throughput", "p95", "p99"];

/// Deployment environment for the produced system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    #[default]
    Dev,
    Staging,
    Production,
}

/// Compliance regimes the project must satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceRegime {
    Gdpr,
    Hipaa,
    Soc2,
}

/// Optional `data` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataSection {
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub schema_hints: Vec<String>,
}

/// Optional `performance_slas` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceSlas {
    #[serde(default)]
    pub latency_p95_ms: u64,
}

/// A parsed and schema-checked intake document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intake {
    pub project_name: String,
    #[serde(default)]
    pub project_type: Option<Profile>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub constraints: BTreeMap<String, Value>,
    #[serde(default)]
    pub data: DataSection,
    #[serde(default)]
    pub compliance: Vec<ComplianceRegime>,
    #[serde(default)]
    pub performance_slas: PerformanceSlas,
    #[serde(default)]
    pub brand_constraints: BTreeMap<String, Value>,
    /// Digest of the canonicalized document.
    #[serde(skip)]
    digest: String,
    /// The document as parsed, for faithful re-persistence.
    #[serde(skip)]
    raw: Value,
}

impl Intake {
    /// Parse an intake document from YAML or JSON text.
    pub fn parse(text: &str) -> Result<Self, IntakeError> {
        let value: Value = serde_yaml::from_str(text)
            .map_err(|e| IntakeError::new("document", "root", e.to_string()))?;
        Self::from_value(value)
    }

    /// Build an intake from an already-parsed JSON value.
    pub fn from_value(value: Value) -> Result<Self, IntakeError> {
        let map = value
            .as_object()
            .ok_or_else(|| IntakeError::new("document", "root", "intake must be a mapping"))?;

        for key in map.keys() {
            if !RECOGNIZED_SECTIONS.contains(&key.as_str()) {
                return Err(IntakeError::new(key, "-", "unrecognized section"));
            }
        }

        match map.get("project_name") {
            Some(Value::String(name)) if !name.trim().is_empty() => {}
            Some(_) => {
                return Err(IntakeError::new(
                    "project_name",
                    "project_name",
                    "must be a non-empty string",
                ));
            }
            None => {
                return Err(IntakeError::new(
                    "project_name",
                    "project_name",
                    "required section is missing",
                ));
            }
        }

        if let Some(slas) = map.get("performance_slas")
            && let Some(latency) = slas.get("latency_p95_ms")
            && !latency.is_u64()
        {
            return Err(IntakeError::new(
                "performance_slas",
                "latency_p95_ms",
                "must be a non-negative integer",
            ));
        }

        let digest = ident::digest_json(&value);
        let mut intake: Intake = serde_json::from_value(value.clone()).map_err(|e| {
            // serde paths look like "compliance[1]"; keep the raw message
            IntakeError::new("document", "-", e.to_string())
        })?;
        intake.digest = digest;
        intake.raw = value;
        Ok(intake)
    }

    /// Digest of the canonicalized document. Stable across key ordering.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// The document exactly as parsed.
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// The profile the intake selects, defaulting to analytics.
    pub fn profile(&self) -> Profile {
        self.project_type.unwrap_or(Profile::Analytics)
    }

    /// Whether the intake references database or schema work.
    pub fn references_database(&self) -> bool {
        let mut haystacks: Vec<&str> = self.requirements.iter().map(String::as_str).collect();
        haystacks.extend(self.data.sources.iter().map(String::as_str));
        haystacks.extend(self.data.schema_hints.iter().map(String::as_str));
        haystacks.push(&self.description);
        contains_marker(&haystacks, DATABASE_MARKERS)
    }

    /// Whether performance engineering signals are present.
    pub fn performance_sensitive(&self) -> bool {
        if self.performance_slas.latency_p95_ms > 0 {
            return true;
        }
        if self.environment == Environment::Production {
            return true;
        }
        let haystacks: Vec<&str> = self.requirements.iter().map(String::as_str).collect();
        contains_marker(&haystacks, PERFORMANCE_MARKERS)
    }

    /// Whether the intake requests a security scan via constraints.
    pub fn requires_security_scan(&self) -> bool {
        matches!(
            self.constraints.get("require_security_scan"),
            Some(Value::Bool(true))
        )
    }

    /// Whether the project falls under any regulated compliance regime.
    pub fn has_compliance_regime(&self) -> bool {
        !self.compliance.is_empty()
    }
}

fn contains_marker(haystacks: &[&str], markers: &[&str]) -> bool {
    haystacks.iter().any(|text| {
        let lower = text.to_lowercase();
        markers.iter().any(|m| lower.contains(m))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "project_name: Q3 forecast\n";

    #[test]
    fn test_parse_minimal() {
        let intake = Intake::parse(MINIMAL).unwrap();
        assert_eq!(intake.project_name, "Q3 forecast");
        assert_eq!(intake.environment, Environment::Dev);
        assert_eq!(intake.profile(), Profile::Analytics);
        assert!(!intake.digest().is_empty());
    }

    #[test]
    fn test_missing_project_name_fails() {
        let err = Intake::parse("description: no name\n").unwrap_err();
        assert_eq!(err.section, "project_name");
    }

    #[test]
    fn test_unrecognized_section_fails() {
        let err = Intake::parse("project_name: x\nbudget_caps: {}\n").unwrap_err();
        assert_eq!(err.section, "budget_caps");
        assert!(err.reason.contains("unrecognized"));
    }

    #[test]
    fn test_latency_must_be_integer() {
        let text = "project_name: x\nperformance_slas:\n  latency_p95_ms: fast\n";
        let err = Intake::parse(text).unwrap_err();
        assert_eq!(err.section, "performance_slas");
        assert_eq!(err.field, "latency_p95_ms");
    }

    #[test]
    fn test_digest_stable_across_key_order() {
        let a = Intake::parse("project_name: x\nenvironment: staging\n").unwrap();
        let b = Intake::parse("environment: staging\nproject_name: x\n").unwrap();
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn test_references_database() {
        let text = "project_name: x\nrequirements:\n  - build SQL reporting layer\n";
        let intake = Intake::parse(text).unwrap();
        assert!(intake.references_database());

        let plain = Intake::parse(MINIMAL).unwrap();
        assert!(!plain.references_database());
    }

    #[test]
    fn test_performance_sensitive_via_sla() {
        let text = "project_name: x\nperformance_slas:\n  latency_p95_ms: 250\n";
        let intake = Intake::parse(text).unwrap();
        assert!(intake.performance_sensitive());
    }

    #[test]
    fn test_performance_sensitive_via_environment() {
        let text = "project_name: x\nenvironment: production\n";
        let intake = Intake::parse(text).unwrap();
        assert!(intake.performance_sensitive());
    }

    #[test]
    fn test_requires_security_scan_constraint() {
        let text = "project_name: x\nconstraints:\n  require_security_scan: true\n";
        let intake = Intake::parse(text).unwrap();
        assert!(intake.requires_security_scan());
    }

    #[test]
    fn test_compliance_parse() {
        let text = "project_name: x\ncompliance: [gdpr, soc2]\n";
        let intake = Intake::parse(text).unwrap();
        assert_eq!(
            intake.compliance,
            vec![ComplianceRegime::Gdpr, ComplianceRegime::Soc2]
        );
        assert!(intake.has_compliance_regime());
    }

    #[test]
    fn test_profile_from_project_type() {
        let text = "project_name: x\nproject_type: webapp\n";
        let intake = Intake::parse(text).unwrap();
        assert_eq!(intake.profile(), Profile::Webapp);
    }
}
