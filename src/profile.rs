//! Project profiles and their phase graphs.
//!
//! A profile maps a project type to the ordered phase sequence a run walks.
//! Consensus boundaries default to the phases listed here; policy can
//! override them.

use serde::{Deserialize, Serialize};

/// Project type, selecting the phase graph for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    Analytics,
    Ml,
    Webapp,
    Optimization,
}

impl Profile {
    /// Ordered executable phases for this profile. The terminal `complete`
    /// status is reached after the last phase; it is not itself a phase.
    pub fn phases(&self) -> &'static [&'static str] {
        match self {
            Profile::Analytics => &[
                "planning",
                "architecture",
                "data",
                "development",
                "documentation",
            ],
            Profile::Ml => &[
                "planning",
                "architecture",
                "data",
                "development",
                "qa",
                "documentation",
            ],
            Profile::Webapp => &[
                "planning",
                "architecture",
                "development",
                "qa",
                "documentation",
                "security",
            ],
            Profile::Optimization => &[
                "planning",
                "architecture",
                "data",
                "development",
                "qa",
                "documentation",
            ],
        }
    }

    /// Position of a phase in this profile's graph.
    pub fn phase_order(&self, phase: &str) -> Option<usize> {
        self.phases().iter().position(|p| *p == phase)
    }

    /// The phase after the given one, or `None` at the end of the graph.
    pub fn next_phase(&self, phase: &str) -> Option<&'static str> {
        let idx = self.phase_order(phase)?;
        self.phases().get(idx + 1).copied()
    }

    /// Default human-review boundaries: a run pauses for consensus after
    /// these phases complete. Policy may override the list.
    pub fn default_consensus_boundaries(&self) -> Vec<&'static str> {
        self.phases()
            .iter()
            .filter(|p| **p == "planning" || **p == "qa")
            .copied()
            .collect()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::Analytics => "analytics",
            Profile::Ml => "ml",
            Profile::Webapp => "webapp",
            Profile::Optimization => "optimization",
        }
    }
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Profile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "analytics" => Ok(Profile::Analytics),
            "ml" => Ok(Profile::Ml),
            "webapp" => Ok(Profile::Webapp),
            "optimization" => Ok(Profile::Optimization),
            other => Err(format!("unknown profile '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analytics_phases() {
        let phases = Profile::Analytics.phases();
        assert_eq!(
            phases,
            &[
                "planning",
                "architecture",
                "data",
                "development",
                "documentation"
            ]
        );
    }

    #[test]
    fn test_webapp_ends_with_security() {
        let phases = Profile::Webapp.phases();
        assert_eq!(*phases.last().unwrap(), "security");
        assert!(phases.contains(&"qa"));
    }

    #[test]
    fn test_phase_order_and_next() {
        let profile = Profile::Ml;
        assert_eq!(profile.phase_order("planning"), Some(0));
        assert_eq!(profile.next_phase("planning"), Some("architecture"));
        assert_eq!(profile.next_phase("documentation"), None);
        assert_eq!(profile.phase_order("security"), None);
    }

    #[test]
    fn test_consensus_defaults() {
        assert_eq!(
            Profile::Analytics.default_consensus_boundaries(),
            vec!["planning"]
        );
        assert_eq!(
            Profile::Ml.default_consensus_boundaries(),
            vec!["planning", "qa"]
        );
    }

    #[test]
    fn test_from_str_round_trip() {
        for profile in [
            Profile::Analytics,
            Profile::Ml,
            Profile::Webapp,
            Profile::Optimization,
        ] {
            let parsed: Profile = profile.as_str().parse().unwrap();
            assert_eq!(parsed, profile);
        }
        assert!("desktop".parse::<Profile>().is_err());
    }
}
