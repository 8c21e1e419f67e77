//! Gate declarations and evaluation.
//!
//! Gates come in three kinds:
//! - *Metric*: extract a number from a JSON artifact and compare it to a
//!   threshold.
//! - *Tool*: invoke an external scanner through the agent dispatcher and
//!   interpret its structured verdict.
//! - *Validator*: scan artifact text (and optionally a workspace tree) for
//!   disallowed patterns and required attributes.

use crate::artifact::ArtifactStore;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use walkdir::WalkDir;

/// Comparison operator for metric gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Gte,
    Lte,
    Gt,
    Lt,
    Eq,
}

impl Comparison {
    pub fn holds(&self, actual: f64, threshold: f64) -> bool {
        match self {
            Comparison::Gte => actual >= threshold,
            Comparison::Lte => actual <= threshold,
            Comparison::Gt => actual > threshold,
            Comparison::Lt => actual < threshold,
            Comparison::Eq => (actual - threshold).abs() < f64::EPSILON,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Comparison::Gte => ">=",
            Comparison::Lte => "<=",
            Comparison::Gt => ">",
            Comparison::Lt => "<",
            Comparison::Eq => "==",
        }
    }
}

/// What a failing gate does to the phase transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GateSeverity {
    #[default]
    Block,
    Warn,
}

/// The kind-specific evaluation spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GateKind {
    /// Compare a number extracted from a JSON artifact to a threshold.
    Metric {
        /// Logical name of the artifact to read.
        artifact: String,
        /// JSON pointer to the numeric value, e.g. `/coverage/line_pct`.
        pointer: String,
        comparison: Comparison,
        threshold: f64,
    },
    /// Run an external scanner and interpret its verdict.
    Tool {
        tool: String,
        #[serde(default)]
        args: Value,
    },
    /// Scan artifact text for disallowed and required patterns.
    Validator {
        /// Regexes that must not match anywhere.
        #[serde(default)]
        disallowed_patterns: Vec<String>,
        /// Regexes that must match in at least one scanned artifact.
        #[serde(default)]
        required_patterns: Vec<String>,
        /// File extensions to scan in the workspace, e.g. `["css", "html"]`.
        /// Empty means artifacts only.
        #[serde(default)]
        workspace_extensions: Vec<String>,
    },
}

/// A declarative quality gate applied at phase boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gate {
    pub gate_id: String,
    #[serde(flatten)]
    pub kind: GateKind,
    /// Phases this gate applies to; empty means every phase.
    #[serde(default)]
    pub phase_applicability: Vec<String>,
    #[serde(default)]
    pub on_failure: GateSeverity,
    /// Shown to the operator when the gate fails.
    #[serde(default)]
    pub remediation: Option<String>,
}

impl Gate {
    pub fn applies_to(&self, phase: &str) -> bool {
        self.phase_applicability.is_empty()
            || self.phase_applicability.iter().any(|p| p == phase)
    }
}

/// Status of one evaluated gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Pass,
    Warn,
    Block,
}

/// Result of evaluating one gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub gate_id: String,
    pub status: GateStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<f64>,
}

/// Aggregate verdict over all gates of a phase transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GovernanceVerdict {
    Pass,
    PassWithWarnings,
    Block,
}

impl GovernanceVerdict {
    pub fn allows_advance(&self) -> bool {
        !matches!(self, GovernanceVerdict::Block)
    }
}

/// Verdict plus per-gate results for a phase transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernanceOutcome {
    pub verdict: GovernanceVerdict,
    pub results: Vec<GateResult>,
}

impl GovernanceOutcome {
    pub fn from_results(results: Vec<GateResult>) -> Self {
        let verdict = if results.iter().any(|r| r.status == GateStatus::Block) {
            GovernanceVerdict::Block
        } else if results.iter().any(|r| r.status == GateStatus::Warn) {
            GovernanceVerdict::PassWithWarnings
        } else {
            GovernanceVerdict::Pass
        };
        Self { verdict, results }
    }

    /// Remediation hints from failing gates, most severe first.
    pub fn remediation_hints(&self) -> Vec<String> {
        let mut hints: Vec<String> = self
            .results
            .iter()
            .filter(|r| r.status == GateStatus::Block)
            .chain(self.results.iter().filter(|r| r.status == GateStatus::Warn))
            .filter_map(|r| r.remediation.clone())
            .collect();
        hints.dedup();
        hints
    }
}

/// Structured verdict returned by an external scanner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolVerdict {
    pub passed: bool,
    #[serde(default)]
    pub findings: Vec<String>,
}

/// Seam through which tool gates reach the agent dispatcher.
#[async_trait]
pub trait ToolGateRunner: Send + Sync {
    async fn run_tool(
        &self,
        run_id: &str,
        phase: &str,
        tool: &str,
        args: &Value,
    ) -> anyhow::Result<ToolVerdict>;
}

/// Everything a gate evaluation can see.
pub struct PhaseContext<'a> {
    pub run_id: &'a str,
    pub phase: &'a str,
    pub artifacts: &'a ArtifactStore,
    /// Workspace root for validator file scans, when one exists.
    pub workspace: Option<&'a Path>,
}

/// Evaluate one gate against the context. Failures map to the gate's
/// declared severity; evaluation errors surface as failures, not panics.
pub async fn evaluate_gate(
    gate: &Gate,
    ctx: &PhaseContext<'_>,
    tools: &dyn ToolGateRunner,
) -> GateResult {
    let failure_status = match gate.on_failure {
        GateSeverity::Block => GateStatus::Block,
        GateSeverity::Warn => GateStatus::Warn,
    };

    match &gate.kind {
        GateKind::Metric {
            artifact,
            pointer,
            comparison,
            threshold,
        } => evaluate_metric(gate, ctx, artifact, pointer, *comparison, *threshold, failure_status),
        GateKind::Tool { tool, args } => {
            match tools.run_tool(ctx.run_id, ctx.phase, tool, args).await {
                Ok(verdict) if verdict.passed => GateResult {
                    gate_id: gate.gate_id.clone(),
                    status: GateStatus::Pass,
                    message: format!("tool '{tool}' passed"),
                    remediation: None,
                    threshold: None,
                    actual: None,
                },
                Ok(verdict) => GateResult {
                    gate_id: gate.gate_id.clone(),
                    status: failure_status,
                    message: format!(
                        "tool '{tool}' reported {} finding(s): {}",
                        verdict.findings.len(),
                        verdict.findings.join("; ")
                    ),
                    remediation: gate.remediation.clone(),
                    threshold: None,
                    actual: Some(verdict.findings.len() as f64),
                },
                Err(e) => GateResult {
                    gate_id: gate.gate_id.clone(),
                    status: failure_status,
                    message: format!("tool '{tool}' failed to run: {e}"),
                    remediation: gate.remediation.clone(),
                    threshold: None,
                    actual: None,
                },
            }
        }
        GateKind::Validator {
            disallowed_patterns,
            required_patterns,
            workspace_extensions,
        } => evaluate_validator(
            gate,
            ctx,
            disallowed_patterns,
            required_patterns,
            workspace_extensions,
            failure_status,
        ),
    }
}

fn evaluate_metric(
    gate: &Gate,
    ctx: &PhaseContext<'_>,
    artifact: &str,
    pointer: &str,
    comparison: Comparison,
    threshold: f64,
    failure_status: GateStatus,
) -> GateResult {
    let fail = |message: String, actual: Option<f64>| GateResult {
        gate_id: gate.gate_id.clone(),
        status: failure_status,
        message,
        remediation: gate.remediation.clone(),
        threshold: Some(threshold),
        actual,
    };

    let manifest = match ctx.artifacts.load_manifest(ctx.run_id) {
        Ok(m) => m,
        Err(e) => return fail(format!("could not load manifest: {e}"), None),
    };
    let Some(entry) = manifest.find(artifact) else {
        return fail(format!("artifact '{artifact}' not found"), None);
    };
    let bytes = match ctx.artifacts.resolve_blob(&entry.blob_hash) {
        Ok(b) => b,
        Err(e) => return fail(format!("could not read artifact '{artifact}': {e}"), None),
    };
    let json: Value = match serde_json::from_slice(&bytes) {
        Ok(v) => v,
        Err(e) => return fail(format!("artifact '{artifact}' is not JSON: {e}"), None),
    };
    let Some(actual) = json.pointer(pointer).and_then(Value::as_f64) else {
        return fail(
            format!("no numeric value at '{pointer}' in artifact '{artifact}'"),
            None,
        );
    };

    if comparison.holds(actual, threshold) {
        GateResult {
            gate_id: gate.gate_id.clone(),
            status: GateStatus::Pass,
            message: format!(
                "{artifact}{pointer} = {actual} {} {threshold}",
                comparison.symbol()
            ),
            remediation: None,
            threshold: Some(threshold),
            actual: Some(actual),
        }
    } else {
        fail(
            format!(
                "{artifact}{pointer} = {actual}, required {} {threshold}",
                comparison.symbol()
            ),
            Some(actual),
        )
    }
}

fn evaluate_validator(
    gate: &Gate,
    ctx: &PhaseContext<'_>,
    disallowed_patterns: &[String],
    required_patterns: &[String],
    workspace_extensions: &[String],
    failure_status: GateStatus,
) -> GateResult {
    let fail = |message: String| GateResult {
        gate_id: gate.gate_id.clone(),
        status: failure_status,
        message,
        remediation: gate.remediation.clone(),
        threshold: None,
        actual: None,
    };

    let mut disallowed = Vec::with_capacity(disallowed_patterns.len());
    for pattern in disallowed_patterns {
        match Regex::new(pattern) {
            Ok(re) => disallowed.push(re),
            Err(e) => return fail(format!("invalid pattern '{pattern}': {e}")),
        }
    }
    let mut required = Vec::with_capacity(required_patterns.len());
    for pattern in required_patterns {
        match Regex::new(pattern) {
            Ok(re) => required.push((pattern.as_str(), re)),
            Err(e) => return fail(format!("invalid pattern '{pattern}': {e}")),
        }
    }

    // Gather scannable text: all live artifacts, plus workspace files with
    // the requested extensions.
    let mut texts: Vec<(String, String)> = Vec::new();
    let manifest = match ctx.artifacts.load_manifest(ctx.run_id) {
        Ok(m) => m,
        Err(e) => return fail(format!("could not load manifest: {e}")),
    };
    for entry in &manifest.entries {
        if let Ok(bytes) = ctx.artifacts.resolve_blob(&entry.blob_hash)
            && let Ok(text) = String::from_utf8(bytes)
        {
            texts.push((entry.logical_name.clone(), text));
        }
    }
    if let Some(root) = ctx.workspace
        && !workspace_extensions.is_empty()
    {
        for file in WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let matches_ext = file
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .map(|ext| workspace_extensions.iter().any(|w| w == ext))
                .unwrap_or(false);
            if matches_ext && let Ok(text) = std::fs::read_to_string(file.path()) {
                texts.push((file.path().display().to_string(), text));
            }
        }
    }

    let mut violations = Vec::new();
    for (name, text) in &texts {
        for re in &disallowed {
            if re.is_match(text) {
                violations.push(format!("'{}' matches disallowed pattern {}", name, re.as_str()));
            }
        }
    }
    for (pattern, re) in &required {
        if !texts.iter().any(|(_, text)| re.is_match(text)) {
            violations.push(format!("required pattern '{pattern}' not found"));
        }
    }

    if violations.is_empty() {
        GateResult {
            gate_id: gate.gate_id.clone(),
            status: GateStatus::Pass,
            message: format!("{} item(s) scanned clean", texts.len()),
            remediation: None,
            threshold: None,
            actual: None,
        }
    } else {
        fail(violations.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactType;
    use tempfile::TempDir;

    struct NoTools;

    #[async_trait]
    impl ToolGateRunner for NoTools {
        async fn run_tool(
            &self,
            _: &str,
            _: &str,
            tool: &str,
            _: &Value,
        ) -> anyhow::Result<ToolVerdict> {
            anyhow::bail!("no tool runner configured for '{tool}'")
        }
    }

    struct FixedTool(bool);

    #[async_trait]
    impl ToolGateRunner for FixedTool {
        async fn run_tool(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: &Value,
        ) -> anyhow::Result<ToolVerdict> {
            Ok(ToolVerdict {
                passed: self.0,
                findings: if self.0 {
                    vec![]
                } else {
                    vec!["open port".to_string()]
                },
            })
        }
    }

    fn store(dir: &TempDir) -> ArtifactStore {
        ArtifactStore::new(dir.path().join("blobs"), dir.path().join("runs"))
    }

    fn metric_gate(threshold: f64, on_failure: GateSeverity) -> Gate {
        Gate {
            gate_id: "coverage-floor".to_string(),
            kind: GateKind::Metric {
                artifact: "qa_report".to_string(),
                pointer: "/coverage/line_pct".to_string(),
                comparison: Comparison::Gte,
                threshold,
            },
            phase_applicability: vec!["qa".to_string()],
            on_failure,
            remediation: Some("raise test coverage".to_string()),
        }
    }

    #[tokio::test]
    async fn test_metric_gate_pass() {
        let dir = TempDir::new().unwrap();
        let artifacts = store(&dir);
        artifacts
            .put(
                "run-1",
                "qa",
                "qa_engineer",
                "qa_report",
                ArtifactType::Json,
                br#"{"coverage": {"line_pct": 91.5}}"#,
            )
            .unwrap();

        let ctx = PhaseContext {
            run_id: "run-1",
            phase: "qa",
            artifacts: &artifacts,
            workspace: None,
        };
        let result = evaluate_gate(&metric_gate(80.0, GateSeverity::Block), &ctx, &NoTools).await;
        assert_eq!(result.status, GateStatus::Pass);
        assert_eq!(result.actual, Some(91.5));
    }

    #[tokio::test]
    async fn test_metric_gate_block_below_threshold() {
        let dir = TempDir::new().unwrap();
        let artifacts = store(&dir);
        artifacts
            .put(
                "run-1",
                "qa",
                "qa_engineer",
                "qa_report",
                ArtifactType::Json,
                br#"{"coverage": {"line_pct": 40.0}}"#,
            )
            .unwrap();

        let ctx = PhaseContext {
            run_id: "run-1",
            phase: "qa",
            artifacts: &artifacts,
            workspace: None,
        };
        let result = evaluate_gate(&metric_gate(80.0, GateSeverity::Block), &ctx, &NoTools).await;
        assert_eq!(result.status, GateStatus::Block);
        assert_eq!(result.remediation.as_deref(), Some("raise test coverage"));
    }

    #[tokio::test]
    async fn test_metric_gate_missing_artifact_fails() {
        let dir = TempDir::new().unwrap();
        let artifacts = store(&dir);
        let ctx = PhaseContext {
            run_id: "run-1",
            phase: "qa",
            artifacts: &artifacts,
            workspace: None,
        };
        let result = evaluate_gate(&metric_gate(80.0, GateSeverity::Warn), &ctx, &NoTools).await;
        assert_eq!(result.status, GateStatus::Warn);
        assert!(result.message.contains("not found"));
    }

    #[tokio::test]
    async fn test_tool_gate_verdicts() {
        let dir = TempDir::new().unwrap();
        let artifacts = store(&dir);
        let ctx = PhaseContext {
            run_id: "run-1",
            phase: "security",
            artifacts: &artifacts,
            workspace: None,
        };
        let gate = Gate {
            gate_id: "security-scan".to_string(),
            kind: GateKind::Tool {
                tool: "dependency_scanner".to_string(),
                args: Value::Null,
            },
            phase_applicability: vec![],
            on_failure: GateSeverity::Block,
            remediation: None,
        };

        let pass = evaluate_gate(&gate, &ctx, &FixedTool(true)).await;
        assert_eq!(pass.status, GateStatus::Pass);

        let block = evaluate_gate(&gate, &ctx, &FixedTool(false)).await;
        assert_eq!(block.status, GateStatus::Block);
        assert!(block.message.contains("open port"));
    }

    #[tokio::test]
    async fn test_validator_gate_disallowed_pattern() {
        let dir = TempDir::new().unwrap();
        let artifacts = store(&dir);
        artifacts
            .put(
                "run-1",
                "documentation",
                "doc_writer",
                "style.css",
                ArtifactType::Code,
                b"body { color: #ff00ff; }",
            )
            .unwrap();

        let gate = Gate {
            gate_id: "brand-colors".to_string(),
            kind: GateKind::Validator {
                disallowed_patterns: vec!["#ff00ff".to_string()],
                required_patterns: vec![],
                workspace_extensions: vec![],
            },
            phase_applicability: vec![],
            on_failure: GateSeverity::Warn,
            remediation: Some("use palette colors only".to_string()),
        };
        let ctx = PhaseContext {
            run_id: "run-1",
            phase: "documentation",
            artifacts: &artifacts,
            workspace: None,
        };

        let result = evaluate_gate(&gate, &ctx, &NoTools).await;
        assert_eq!(result.status, GateStatus::Warn);
        assert!(result.message.contains("disallowed"));
    }

    #[tokio::test]
    async fn test_validator_gate_required_pattern() {
        let dir = TempDir::new().unwrap();
        let artifacts = store(&dir);
        artifacts
            .put(
                "run-1",
                "documentation",
                "doc_writer",
                "readme",
                ArtifactType::Markdown,
                b"# Project\n\n## License\nMIT",
            )
            .unwrap();

        let gate = Gate {
            gate_id: "license-section".to_string(),
            kind: GateKind::Validator {
                disallowed_patterns: vec![],
                required_patterns: vec!["## License".to_string()],
                workspace_extensions: vec![],
            },
            phase_applicability: vec![],
            on_failure: GateSeverity::Block,
            remediation: None,
        };
        let ctx = PhaseContext {
            run_id: "run-1",
            phase: "documentation",
            artifacts: &artifacts,
            workspace: None,
        };

        let result = evaluate_gate(&gate, &ctx, &NoTools).await;
        assert_eq!(result.status, GateStatus::Pass);
    }

    #[test]
    fn test_gate_applicability() {
        let gate = metric_gate(80.0, GateSeverity::Block);
        assert!(gate.applies_to("qa"));
        assert!(!gate.applies_to("planning"));

        let everywhere = Gate {
            phase_applicability: vec![],
            ..metric_gate(80.0, GateSeverity::Block)
        };
        assert!(everywhere.applies_to("planning"));
    }

    #[test]
    fn test_outcome_aggregation() {
        let pass = GateResult {
            gate_id: "a".into(),
            status: GateStatus::Pass,
            message: String::new(),
            remediation: None,
            threshold: None,
            actual: None,
        };
        let warn = GateResult {
            status: GateStatus::Warn,
            remediation: Some("tidy up".into()),
            ..pass.clone()
        };
        let block = GateResult {
            status: GateStatus::Block,
            remediation: Some("fix now".into()),
            ..pass.clone()
        };

        let outcome = GovernanceOutcome::from_results(vec![pass.clone()]);
        assert_eq!(outcome.verdict, GovernanceVerdict::Pass);

        let outcome = GovernanceOutcome::from_results(vec![pass.clone(), warn.clone()]);
        assert_eq!(outcome.verdict, GovernanceVerdict::PassWithWarnings);

        let outcome = GovernanceOutcome::from_results(vec![pass, warn, block]);
        assert_eq!(outcome.verdict, GovernanceVerdict::Block);
        assert_eq!(outcome.remediation_hints(), vec!["fix now", "tidy up"]);
    }

    #[test]
    fn test_gate_yaml_round_trip() {
        let yaml = r#"
gate_id: coverage-floor
kind: metric
artifact: qa_report
pointer: /coverage/line_pct
comparison: gte
threshold: 80
phase_applicability: [qa]
on_failure: block
"#;
        let gate: Gate = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(gate.gate_id, "coverage-floor");
        assert!(matches!(gate.kind, GateKind::Metric { threshold, .. } if threshold == 80.0));
    }
}
