//! Auto-detection planner: derives the agent roster for a phase.
//!
//! Starts from the profile's base roster and augments it from intake and
//! policy signals: database work pulls in a database architect ahead of the
//! developer; performance and security signals append the matching
//! specialists after development and QA.

use crate::agent::{AgentRequest, AgentRole, AgentRoster};
use crate::governance::Policy;
use crate::intake::Intake;
use crate::profile::Profile;
use serde_json::json;

/// Base roster for a phase: (agent id, role) pairs in declared order.
pub fn base_roster(phase: &str) -> Vec<(&'static str, AgentRole)> {
    match phase {
        "planning" => vec![("project_planner", AgentRole::ProjectPlanner)],
        "architecture" => vec![("solution_architect", AgentRole::SolutionArchitect)],
        "data" => vec![("data_engineer", AgentRole::DataEngineer)],
        "development" => vec![("developer", AgentRole::Developer)],
        "qa" => vec![("qa_engineer", AgentRole::QaEngineer)],
        "documentation" => vec![("doc_writer", AgentRole::DocWriter)],
        "security" => vec![("security_auditor", AgentRole::SecurityAuditor)],
        _ => Vec::new(),
    }
}

/// Whether security review signals are present in intake or policy.
fn security_triggered(intake: &Intake, policy: &Policy) -> bool {
    intake.requires_security_scan()
        || policy.setting_bool("require_security_scan")
        || intake.has_compliance_regime()
        || intake.environment == crate::intake::Environment::Production
}

/// Derive the roster for one phase of a run.
pub fn derive_roster(
    intake: &Intake,
    policy: &Policy,
    _profile: Profile,
    phase: &str,
) -> AgentRoster {
    let mut roles: Vec<(String, AgentRole)> = base_roster(phase)
        .into_iter()
        .map(|(id, role)| (id.to_string(), role))
        .collect();

    // Database work is prepared before the developer touches code.
    if intake.references_database()
        && let Some(dev_pos) = roles.iter().position(|(_, r)| *r == AgentRole::Developer)
    {
        roles.insert(
            dev_pos,
            ("database_architect".to_string(), AgentRole::DatabaseArchitect),
        );
    }

    let reviews_follow = matches!(phase, "development" | "qa");
    if reviews_follow && intake.performance_sensitive() {
        roles.push((
            "performance_engineer".to_string(),
            AgentRole::PerformanceEngineer,
        ));
    }
    if reviews_follow && security_triggered(intake, policy) {
        roles.push(("security_auditor".to_string(), AgentRole::SecurityAuditor));
    }

    // Dedupe while preserving declared order.
    let mut seen = std::collections::HashSet::new();
    roles.retain(|(id, _)| seen.insert(id.clone()));

    // Roster agents run as a chain: each depends on its predecessor.
    let mut agents = Vec::with_capacity(roles.len());
    let mut previous: Option<String> = None;
    for (agent_id, role) in roles {
        let mut request = AgentRequest::new(&agent_id, role).with_input(json!({
            "project_name": intake.project_name,
            "phase": phase,
            "environment": intake.environment,
            "requirements": intake.requirements,
        }));
        if let Some(prev) = &previous {
            request = request.depends_on(prev);
        }
        previous = Some(agent_id);
        agents.push(request);
    }
    AgentRoster::new(agents)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intake(text: &str) -> Intake {
        Intake::parse(text).unwrap()
    }

    #[test]
    fn test_analytics_staging_has_no_specialists() {
        let intake = intake(
            "project_name: Q3 forecast\nproject_type: analytics\nenvironment: staging\nrequirements:\n  - monthly forecast\n",
        );
        let policy = Policy::default();

        for phase in Profile::Analytics.phases() {
            let roster = derive_roster(&intake, &policy, Profile::Analytics, phase);
            let ids = roster.agent_ids();
            assert!(!ids.contains(&"security_auditor".to_string()), "{phase}");
            assert!(
                !ids.contains(&"performance_engineer".to_string()),
                "{phase}"
            );
        }
    }

    #[test]
    fn test_database_architect_inserted_before_developer() {
        let intake = intake(
            "project_name: x\nrequirements:\n  - persist orders in a SQL database\n",
        );
        let roster = derive_roster(&intake, &Policy::default(), Profile::Webapp, "development");
        let ids = roster.agent_ids();
        let db = ids.iter().position(|id| id == "database_architect").unwrap();
        let dev = ids.iter().position(|id| id == "developer").unwrap();
        assert!(db < dev);
        // The developer waits for the schema
        assert!(
            roster
                .get("developer")
                .unwrap()
                .dependency_refs
                .contains(&"database_architect".to_string())
        );
    }

    #[test]
    fn test_compliance_appends_security_auditor() {
        let intake = intake(
            "project_name: x\nproject_type: webapp\ncompliance: [gdpr]\nenvironment: production\n",
        );
        let policy = Policy::default();

        for phase in ["development", "qa"] {
            let ids = derive_roster(&intake, &policy, Profile::Webapp, phase).agent_ids();
            assert!(ids.contains(&"security_auditor".to_string()), "{phase}");
        }
        // Not appended to planning
        let ids = derive_roster(&intake, &policy, Profile::Webapp, "planning").agent_ids();
        assert!(!ids.contains(&"security_auditor".to_string()));
    }

    #[test]
    fn test_policy_can_require_security_scan() {
        let intake = intake("project_name: x\n");
        let policy = Policy::parse("settings:\n  require_security_scan: true\n").unwrap();

        let ids = derive_roster(&intake, &policy, Profile::Webapp, "qa").agent_ids();
        assert!(ids.contains(&"security_auditor".to_string()));
    }

    #[test]
    fn test_performance_engineer_on_sla() {
        let intake = intake(
            "project_name: x\nperformance_slas:\n  latency_p95_ms: 200\n",
        );
        let ids =
            derive_roster(&intake, &Policy::default(), Profile::Webapp, "development").agent_ids();
        assert!(ids.contains(&"performance_engineer".to_string()));
    }

    #[test]
    fn test_security_phase_roster_deduplicates() {
        let intake = intake("project_name: x\ncompliance: [soc2]\n");
        let roster = derive_roster(&intake, &Policy::default(), Profile::Webapp, "security");
        let ids = roster.agent_ids();
        assert_eq!(
            ids.iter().filter(|id| *id == "security_auditor").count(),
            1
        );
    }

    #[test]
    fn test_roster_forms_a_chain() {
        let intake = intake(
            "project_name: x\nenvironment: production\ncompliance: [hipaa]\nrequirements:\n  - low latency schema queries\n",
        );
        let roster = derive_roster(&intake, &Policy::default(), Profile::Webapp, "development");
        assert!(roster.len() >= 3);
        assert!(roster.agents[0].dependency_refs.is_empty());
        for pair in roster.agents.windows(2) {
            assert_eq!(pair[1].dependency_refs, vec![pair[0].agent_id.clone()]);
        }
    }

    #[test]
    fn test_unknown_phase_empty_roster() {
        let intake = intake("project_name: x\n");
        let roster = derive_roster(&intake, &Policy::default(), Profile::Analytics, "release");
        assert!(roster.is_empty());
    }
}
