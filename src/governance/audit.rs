//! Immutable gate-evaluation audit log.
//!
//! Every gate evaluation is appended as one JSON line under the run's
//! directory. Entries are never rewritten.

use crate::errors::StoreError;
use crate::governance::gates::{GateResult, GateStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// One appended audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateAuditEntry {
    pub run_id: String,
    pub phase: String,
    pub gate_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<f64>,
    pub status: GateStatus,
    pub timestamp: DateTime<Utc>,
}

impl GateAuditEntry {
    pub fn from_result(run_id: &str, phase: &str, result: &GateResult) -> Self {
        Self {
            run_id: run_id.to_string(),
            phase: phase.to_string(),
            gate_id: result.gate_id.clone(),
            threshold: result.threshold,
            actual: result.actual,
            status: result.status,
            timestamp: Utc::now(),
        }
    }
}

/// Append-only JSONL audit log, one file per run.
pub struct AuditLog {
    runs_root: PathBuf,
}

impl AuditLog {
    pub fn new(runs_root: impl Into<PathBuf>) -> Self {
        Self {
            runs_root: runs_root.into(),
        }
    }

    fn path_for(&self, run_id: &str) -> PathBuf {
        self.runs_root.join(run_id).join("governance-audit.jsonl")
    }

    /// Append entries for a batch of gate results.
    pub fn append(
        &self,
        run_id: &str,
        phase: &str,
        results: &[GateResult],
    ) -> Result<(), StoreError> {
        if results.is_empty() {
            return Ok(());
        }
        let path = self.path_for(run_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        for result in results {
            let entry = GateAuditEntry::from_result(run_id, phase, result);
            let line = serde_json::to_string(&entry).map_err(|e| StoreError::Serde {
                subject: "audit entry".to_string(),
                source: e,
            })?;
            writeln!(file, "{line}").map_err(|e| StoreError::io(&path, e))?;
        }
        Ok(())
    }

    /// All entries for a run, in append order.
    pub fn read_for_run(&self, run_id: &str) -> Result<Vec<GateAuditEntry>, StoreError> {
        let path = self.path_for(run_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        read_entries(&path)
    }
}

fn read_entries(path: &Path) -> Result<Vec<GateAuditEntry>, StoreError> {
    let text = fs::read_to_string(path).map_err(|e| StoreError::io(path, e))?;
    let mut entries = Vec::new();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let entry = serde_json::from_str(line).map_err(|e| StoreError::Serde {
            subject: "audit entry".to_string(),
            source: e,
        })?;
        entries.push(entry);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn result(gate_id: &str, status: GateStatus) -> GateResult {
        GateResult {
            gate_id: gate_id.to_string(),
            status,
            message: "msg".to_string(),
            remediation: None,
            threshold: Some(80.0),
            actual: Some(75.0),
        }
    }

    #[test]
    fn test_append_and_read() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path());

        log.append("run-1", "qa", &[result("coverage", GateStatus::Block)])
            .unwrap();
        log.append("run-1", "qa", &[result("coverage", GateStatus::Pass)])
            .unwrap();

        let entries = log.read_for_run("run-1").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].status, GateStatus::Block);
        assert_eq!(entries[1].status, GateStatus::Pass);
        assert_eq!(entries[0].threshold, Some(80.0));
    }

    #[test]
    fn test_runs_are_isolated() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path());

        log.append("run-1", "qa", &[result("g", GateStatus::Pass)])
            .unwrap();

        assert!(log.read_for_run("run-2").unwrap().is_empty());
    }

    #[test]
    fn test_empty_batch_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path());
        log.append("run-1", "qa", &[]).unwrap();
        assert!(!dir.path().join("run-1").exists());
    }
}
