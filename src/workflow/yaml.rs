//! Workflow YAML structural round-trip: the on-disk/submitted
//! form of a workflow definition, kept deliberately close to the job spec
//! shape so a single job can be promoted to a one-node workflow with no
//! translation layer.

use serde::{Deserialize, Serialize};

use crate::errors::{JobletError, Result};
use crate::model::{DependencyEdge, JobSpec};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowYaml {
    pub name: Option<String>,
    pub jobs: std::collections::BTreeMap<String, JobSpec>,
    #[serde(default)]
    pub dependencies: Vec<DependencyYaml>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyYaml {
    pub from: String,
    pub to: String,
    #[serde(default = "default_condition")]
    pub condition: String,
}

fn default_condition() -> String {
    "success".to_string()
}

impl WorkflowYaml {
    pub fn parse(source: &str) -> Result<Self> {
        serde_yaml::from_str(source).map_err(|e| JobletError::validation(format!("invalid workflow yaml: {e}")))
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| JobletError::internal(format!("serialize workflow yaml: {e}")))
    }

    pub fn job_names(&self) -> Vec<String> {
        self.jobs.keys().cloned().collect()
    }

    pub fn dependency_edges(&self) -> Vec<DependencyEdge> {
        self.dependencies
            .iter()
            .map(|d| DependencyEdge {
                from: d.from.clone(),
                to: d.to.clone(),
                condition: d.condition.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_workflow() {
        let yaml = r#"
name: build-and-test
jobs:
  build:
    command: make
  test:
    command: make
    args: ["test"]
dependencies:
  - from: build
    to: test
"#;
        let wf = WorkflowYaml::parse(yaml).unwrap();
        assert_eq!(wf.name.as_deref(), Some("build-and-test"));
        assert_eq!(wf.jobs.len(), 2);
        assert_eq!(wf.dependencies[0].condition, "success");
    }

    #[test]
    fn round_trips_through_to_yaml() {
        let yaml = "jobs:\n  solo:\n    command: echo\n";
        let wf = WorkflowYaml::parse(yaml).unwrap();
        let rendered = wf.to_yaml().unwrap();
        let reparsed = WorkflowYaml::parse(&rendered).unwrap();
        assert_eq!(reparsed.jobs.len(), 1);
    }

    #[test]
    fn rejects_malformed_yaml() {
        assert!(WorkflowYaml::parse("not: [valid yaml").is_err());
    }
}
