//! Epic plan input document.
//!
//! The planning collaborator hands the scheduler an ordered list of sprint
//! definitions and an optional contract list as a YAML document. Parsing is
//! deterministic; all structural validation happens in the graph builder.

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;

use serde::Deserialize;

use crate::core::errors::{EpicError, Result};

/// One sprint definition as declared by the planner.
#[derive(Debug, Clone, Deserialize)]
pub struct SprintSpec {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub estimated_hours: f64,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub produces: Vec<String>,
    #[serde(default)]
    pub consumes: Vec<String>,
    /// Execution agent to route this sprint to; falls back to the registry
    /// default when absent.
    #[serde(default)]
    pub agent: Option<String>,
    /// Planner-disabled sprint: recorded as `skipped` without dispatch.
    #[serde(default)]
    pub skip: bool,
}

/// Optional explicit contract declaration; producer/consumer relationships
/// are always derived from the sprint list, this only pins the expected set.
#[derive(Debug, Clone, Deserialize)]
pub struct ContractSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// The full plan document for one epic.
#[derive(Debug, Clone, Deserialize)]
pub struct EpicPlan {
    #[serde(default)]
    pub epic_id: Option<String>,
    pub name: String,
    pub sprints: Vec<SprintSpec>,
    #[serde(default)]
    pub contracts: Vec<ContractSpec>,
}

impl EpicPlan {
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let plan: EpicPlan = serde_yaml::from_str(content)?;
        plan.check_basic_shape()?;
        Ok(plan)
    }

    pub fn from_yaml_file(path: &str) -> Result<Self> {
        let mut file = File::open(path).map_err(|e| EpicError::Io {
            operation: format!("open epic plan '{}'", path),
            source: e,
        })?;
        let mut content = String::new();
        file.read_to_string(&mut content).map_err(|e| EpicError::Io {
            operation: format!("read epic plan '{}'", path),
            source: e,
        })?;
        Self::from_yaml_str(&content)
    }

    /// The declared epic id, or a generated one.
    pub fn epic_id(&self) -> String {
        self.epic_id.clone().unwrap_or_else(|| cuid2::create_id())
    }

    pub fn sprint(&self, id: &str) -> Option<&SprintSpec> {
        self.sprints.iter().find(|s| s.id == id)
    }

    pub fn contains_sprint(&self, id: &str) -> bool {
        self.sprint(id).is_some()
    }

    /// Cheap shape checks that do not require the graph: non-empty plan,
    /// unique sprint ids, sane estimates.
    fn check_basic_shape(&self) -> Result<()> {
        if self.sprints.is_empty() {
            return Err(EpicError::structure("epic plan declares no sprints"));
        }
        let mut seen = HashSet::new();
        for sprint in &self.sprints {
            if sprint.id.is_empty() {
                return Err(EpicError::structure("sprint id cannot be empty"));
            }
            if !seen.insert(sprint.id.as_str()) {
                return Err(EpicError::structure_sprint(
                    format!("duplicate sprint id '{}'", sprint.id),
                    sprint.id.clone(),
                ));
            }
            if sprint.estimated_hours < 0.0 || !sprint.estimated_hours.is_finite() {
                return Err(EpicError::structure_sprint(
                    format!(
                        "sprint '{}' has invalid estimated_hours {}",
                        sprint.id, sprint.estimated_hours
                    ),
                    sprint.id.clone(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = r#"
epic_id: epic-auth
name: Authentication rework
sprints:
  - id: s1
    name: Token model
    estimated_hours: 2.0
    produces: [token_api]
  - id: s2
    estimated_hours: 3.5
    dependencies: [s1]
    consumes: [token_api]
contracts:
  - name: token_api
    description: Token issuance interface
"#;

    #[test]
    fn test_parse_plan() {
        let plan = EpicPlan::from_yaml_str(PLAN).unwrap();
        assert_eq!(plan.epic_id(), "epic-auth");
        assert_eq!(plan.sprints.len(), 2);
        assert_eq!(plan.sprints[0].produces, vec!["token_api"]);
        assert_eq!(plan.sprints[1].dependencies, vec!["s1"]);
        assert_eq!(plan.contracts.len(), 1);
        // name falls back to the id when omitted
        assert!(plan.sprints[1].name.is_none());
    }

    #[test]
    fn test_generated_epic_id() {
        let plan = EpicPlan::from_yaml_str(
            "name: x\nsprints:\n  - id: a\n    estimated_hours: 1.0\n",
        )
        .unwrap();
        assert!(!plan.epic_id().is_empty());
    }

    #[test]
    fn test_duplicate_sprint_id_rejected() {
        let err = EpicPlan::from_yaml_str(
            "name: x\nsprints:\n  - id: a\n    estimated_hours: 1.0\n  - id: a\n    estimated_hours: 1.0\n",
        )
        .unwrap_err();
        assert!(err.is_structural());
        assert!(err.to_string().contains("duplicate sprint id 'a'"));
    }

    #[test]
    fn test_negative_estimate_rejected() {
        let err = EpicPlan::from_yaml_str(
            "name: x\nsprints:\n  - id: a\n    estimated_hours: -2.0\n",
        )
        .unwrap_err();
        assert!(err.is_structural());
    }
}
