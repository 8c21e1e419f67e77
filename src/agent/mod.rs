//! Agent roles, requests, and outputs.
//!
//! An agent is a role-specific callable with a declared output schema. All
//! roles share one capability (`AgentBackend::invoke`); the role variant
//! selects the prompt surface and the schema the dispatcher validates
//! against.

use crate::artifact::{ArtifactRef, ArtifactType};
use crate::budget::TokenUsage;
use crate::errors::FailureKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod backend;
pub mod dispatcher;

pub use backend::{AgentBackend, AgentCall, BackendResponse, ProducedArtifact, ScriptedBackend};
pub use dispatcher::AgentDispatcher;

/// The roles an agent can take within a phase roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    ProjectPlanner,
    SolutionArchitect,
    DataEngineer,
    DatabaseArchitect,
    Developer,
    QaEngineer,
    PerformanceEngineer,
    SecurityAuditor,
    DocWriter,
    ReleaseManager,
}

/// One artifact a role must produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredArtifact {
    pub logical_name: &'static str,
    pub artifact_type: ArtifactType,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::ProjectPlanner => "project_planner",
            AgentRole::SolutionArchitect => "solution_architect",
            AgentRole::DataEngineer => "data_engineer",
            AgentRole::DatabaseArchitect => "database_architect",
            AgentRole::Developer => "developer",
            AgentRole::QaEngineer => "qa_engineer",
            AgentRole::PerformanceEngineer => "performance_engineer",
            AgentRole::SecurityAuditor => "security_auditor",
            AgentRole::DocWriter => "doc_writer",
            AgentRole::ReleaseManager => "release_manager",
        }
    }

    /// Artifacts this role must register for its output to validate.
    pub fn required_artifacts(&self) -> Vec<RequiredArtifact> {
        match self {
            AgentRole::ProjectPlanner => vec![RequiredArtifact {
                logical_name: "project_plan",
                artifact_type: ArtifactType::Markdown,
            }],
            AgentRole::SolutionArchitect => vec![RequiredArtifact {
                logical_name: "architecture_overview",
                artifact_type: ArtifactType::Markdown,
            }],
            AgentRole::DataEngineer => vec![RequiredArtifact {
                logical_name: "data_pipeline",
                artifact_type: ArtifactType::Code,
            }],
            AgentRole::DatabaseArchitect => vec![RequiredArtifact {
                logical_name: "database_schema",
                artifact_type: ArtifactType::Yaml,
            }],
            AgentRole::Developer => vec![RequiredArtifact {
                logical_name: "implementation",
                artifact_type: ArtifactType::Code,
            }],
            AgentRole::QaEngineer => vec![RequiredArtifact {
                logical_name: "qa_report",
                artifact_type: ArtifactType::Json,
            }],
            AgentRole::PerformanceEngineer => vec![RequiredArtifact {
                logical_name: "performance_report",
                artifact_type: ArtifactType::Json,
            }],
            AgentRole::SecurityAuditor => vec![RequiredArtifact {
                logical_name: "security_report",
                artifact_type: ArtifactType::Json,
            }],
            AgentRole::DocWriter => vec![RequiredArtifact {
                logical_name: "documentation",
                artifact_type: ArtifactType::Markdown,
            }],
            AgentRole::ReleaseManager => vec![RequiredArtifact {
                logical_name: "release_notes",
                artifact_type: ArtifactType::Markdown,
            }],
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request to execute one agent within a phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub agent_id: String,
    pub role: AgentRole,
    /// Agent ids that must complete before this one starts.
    #[serde(default)]
    pub dependency_refs: Vec<String>,
    /// Role-specific input passed through to the backend.
    #[serde(default)]
    pub input_spec: Value,
}

impl AgentRequest {
    pub fn new(agent_id: &str, role: AgentRole) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            role,
            dependency_refs: Vec::new(),
            input_spec: Value::Null,
        }
    }

    pub fn depends_on(mut self, agent_id: &str) -> Self {
        self.dependency_refs.push(agent_id.to_string());
        self
    }

    pub fn with_input(mut self, input_spec: Value) -> Self {
        self.input_spec = input_spec;
        self
    }
}

/// The ordered set of agents executed within one phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentRoster {
    pub agents: Vec<AgentRequest>,
}

impl AgentRoster {
    pub fn new(agents: Vec<AgentRequest>) -> Self {
        Self { agents }
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.agents.iter().map(|a| a.agent_id.clone()).collect()
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentRequest> {
        self.agents.iter().find(|a| a.agent_id == agent_id)
    }
}

/// Terminal status of one agent invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Succeeded,
    Failed,
    Cancelled,
}

/// Why an agent invocation did not succeed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentFailure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default)]
    pub remediation: Vec<String>,
}

impl AgentFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            remediation: Vec::new(),
        }
    }

    pub fn with_remediation(mut self, hint: impl Into<String>) -> Self {
        self.remediation.push(hint.into());
        self
    }
}

/// Normalized result of one agent invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutput {
    pub agent_id: String,
    pub role: AgentRole,
    pub status: AgentStatus,
    pub summary: String,
    pub artifacts: Vec<ArtifactRef>,
    pub token_usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<AgentFailure>,
}

impl AgentOutput {
    pub fn is_success(&self) -> bool {
        self.status == AgentStatus::Succeeded
    }

    /// A failed output for a request that never produced a response.
    pub fn failed(request: &AgentRequest, failure: AgentFailure) -> Self {
        Self {
            agent_id: request.agent_id.clone(),
            role: request.role,
            status: if failure.kind == FailureKind::Cancelled {
                AgentStatus::Cancelled
            } else {
                AgentStatus::Failed
            },
            summary: String::new(),
            artifacts: Vec::new(),
            token_usage: TokenUsage::default(),
            failure: Some(failure),
        }
    }
}
