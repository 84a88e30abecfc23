//! Workflow document model
//!
//! Declarative workflows parsed from YAML or TOML. The document shape
//! is strict: unknown fields are rejected, `schema_version` must be
//! "2.0", and step graphs are validated up front (unique ids, existing
//! dependency references, acyclic).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{NtmError, Result};

/// The only schema version this build understands
pub const SCHEMA_VERSION: &str = "2.0";

/// How a failed step affects the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    /// Mark the step failed and keep scheduling unblocked steps
    Continue,
    /// Fail the whole run
    #[default]
    Abort,
    /// Re-run the step up to its retry count
    Retry,
}

/// Workflow-wide settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Settings {
    pub on_error: OnError,
    /// Per-step timeout in seconds
    pub timeout: Option<u64>,
}

/// One nested loop construct
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoopSpec {
    /// Expression producing the item list (e.g. `${vars.files}`)
    pub items: String,
    /// Binding name available as `${loop.<name>}` inside iterations
    #[serde(rename = "as")]
    pub bind: String,
    pub steps: Vec<Step>,
}

/// One workflow step
///
/// Exactly one of `prompt`, `parallel`, or `loop` may be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Step {
    /// Unique within its containing step list
    pub id: String,
    /// Agent type the prompt is delivered to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub retry_count: u32,
    /// Step-level override of the workflow error policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<OnError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<Vec<Step>>,
    #[serde(default, rename = "loop", skip_serializing_if = "Option::is_none")]
    pub loop_spec: Option<LoopSpec>,
}

impl Step {
    /// Count how many of prompt/parallel/loop are set
    fn body_count(&self) -> usize {
        usize::from(self.prompt.is_some())
            + usize::from(self.parallel.is_some())
            + usize::from(self.loop_spec.is_some())
    }
}

/// A parsed and validated workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Workflow {
    pub schema_version: String,
    pub name: String,
    /// Declared variables with their default values
    #[serde(default)]
    pub vars: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub settings: Settings,
    pub steps: Vec<Step>,
}

impl Workflow {
    /// Parse from a file, choosing the format by extension
    pub fn parse_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let workflow = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::parse_toml(&content)?,
            _ => Self::parse_yaml(&content)?,
        };
        workflow.validate()?;
        Ok(workflow)
    }

    /// Parse a YAML document (does not validate)
    pub fn parse_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| NtmError::Validation {
            field: "workflow".to_string(),
            message: e.to_string(),
        })
    }

    /// Parse a TOML document (does not validate)
    pub fn parse_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| NtmError::Validation {
            field: "workflow".to_string(),
            message: e.to_string(),
        })
    }

    /// Validate schema version, step shapes, and the dependency graph
    pub fn validate(&self) -> Result<()> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(NtmError::Validation {
                field: "schema_version".to_string(),
                message: format!(
                    "unsupported schema version '{}', expected '{SCHEMA_VERSION}'",
                    self.schema_version
                ),
            });
        }
        if self.steps.is_empty() {
            return Err(NtmError::Validation {
                field: "steps".to_string(),
                message: "workflow has no steps".to_string(),
            });
        }
        validate_container(&self.steps)
    }

    /// Merge overrides into the declared variables
    ///
    /// Overrides must name a declared variable and carry the same JSON
    /// type as its default; anything else is a validation error.
    pub fn bind_variables(
        &self,
        overrides: &HashMap<String, serde_json::Value>,
    ) -> Result<BTreeMap<String, serde_json::Value>> {
        let mut bound = self.vars.clone();
        for (name, value) in overrides {
            let Some(default) = self.vars.get(name) else {
                return Err(NtmError::Validation {
                    field: format!("vars.{name}"),
                    message: "override names an undeclared variable".to_string(),
                });
            };
            if !same_json_type(default, value) {
                return Err(NtmError::Validation {
                    field: format!("vars.{name}"),
                    message: format!(
                        "override type {} does not match declared {}",
                        json_type_name(value),
                        json_type_name(default)
                    ),
                });
            }
            bound.insert(name.clone(), value.clone());
        }
        Ok(bound)
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "list",
        serde_json::Value::Object(_) => "map",
    }
}

fn same_json_type(a: &serde_json::Value, b: &serde_json::Value) -> bool {
    json_type_name(a) == json_type_name(b)
}

/// Validate one step list: unique ids, single body, resolvable
/// dependencies, and an acyclic graph. Recurses into parallel and
/// loop children; every nested step list forms its own container
/// scope with the same rules as the top level.
fn validate_container(steps: &[Step]) -> Result<()> {
    let mut ids: HashSet<&str> = HashSet::new();
    for step in steps {
        if step.id.trim().is_empty() {
            return Err(NtmError::Validation {
                field: "id".to_string(),
                message: "step id must not be empty".to_string(),
            });
        }
        if !ids.insert(step.id.as_str()) {
            return Err(NtmError::Validation {
                field: "id".to_string(),
                message: format!("duplicate step id '{}'", step.id),
            });
        }
        if step.body_count() > 1 {
            return Err(NtmError::Validation {
                field: step.id.clone(),
                message: "a step may have at most one of prompt, parallel, or loop".to_string(),
            });
        }
        if let Some(spec) = &step.loop_spec {
            if spec.steps.is_empty() {
                return Err(NtmError::Validation {
                    field: step.id.clone(),
                    message: "loop has no steps".to_string(),
                });
            }
        }
    }

    // Dependency references must exist within this container
    for step in steps {
        for dep in &step.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(NtmError::Validation {
                    field: "depends_on".to_string(),
                    message: format!("step '{}' depends on unknown step '{dep}'", step.id),
                });
            }
        }
    }

    detect_cycle(steps)?;

    for step in steps {
        if let Some(children) = &step.parallel {
            validate_container(children)?;
        }
        if let Some(spec) = &step.loop_spec {
            validate_container(&spec.steps)?;
        }
    }
    Ok(())
}

/// Kahn's algorithm over id-indexed edge sets
fn detect_cycle(steps: &[Step]) -> Result<()> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for step in steps {
        in_degree.entry(step.id.as_str()).or_insert(0);
        for dep in &step.depends_on {
            *in_degree.entry(step.id.as_str()).or_insert(0) += 1;
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(step.id.as_str());
        }
    }

    let mut ready: Vec<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0usize;

    while let Some(id) = ready.pop() {
        visited += 1;
        if let Some(next) = dependents.get(id) {
            for dependent in next {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(dependent);
                    }
                }
            }
        }
    }

    if visited != steps.len() {
        return Err(NtmError::Validation {
            field: "depends_on".to_string(),
            message: "dependency cycle detected".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC_YAML: &str = r#"
schema_version: "2.0"
name: build-and-test
vars:
  target: main
  parallelism: 2
settings:
  on_error: continue
  timeout: 120
steps:
  - id: init
    agent: claude
    prompt: "Set up the ${vars.target} branch"
  - id: fan
    depends_on: [init]
    parallel:
      - id: a
        agent: claude
        prompt: "part a"
      - id: b
        agent: codex
        prompt: "part b"
  - id: finalize
    depends_on: [fan]
    agent: claude
    prompt: "wrap up"
"#;

    #[test]
    fn test_parse_yaml_and_validate() {
        let workflow = Workflow::parse_yaml(BASIC_YAML).unwrap();
        workflow.validate().unwrap();
        assert_eq!(workflow.name, "build-and-test");
        assert_eq!(workflow.settings.on_error, OnError::Continue);
        assert_eq!(workflow.settings.timeout, Some(120));
        assert_eq!(workflow.steps.len(), 3);
        assert_eq!(workflow.steps[1].parallel.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn test_parse_toml() {
        let toml_doc = r#"
schema_version = "2.0"
name = "simple"

[[steps]]
id = "one"
agent = "claude"
prompt = "hello"
"#;
        let workflow = Workflow::parse_toml(toml_doc).unwrap();
        workflow.validate().unwrap();
        assert_eq!(workflow.steps[0].id, "one");
    }

    #[test]
    fn test_unknown_schema_version_rejected() {
        let doc = BASIC_YAML.replace("\"2.0\"", "\"3.1\"");
        let workflow = Workflow::parse_yaml(&doc).unwrap();
        let err = workflow.validate().unwrap_err();
        assert!(err.to_string().contains("schema_version"));
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let doc = format!("{BASIC_YAML}\nextra_field: true\n");
        assert!(Workflow::parse_yaml(&doc).is_err());
    }

    #[test]
    fn test_cycle_rejected_with_depends_on_field() {
        let doc = r#"
schema_version: "2.0"
name: cyclic
steps:
  - id: a
    depends_on: [b]
    prompt: "a"
  - id: b
    depends_on: [a]
    prompt: "b"
"#;
        let workflow = Workflow::parse_yaml(doc).unwrap();
        match workflow.validate().unwrap_err() {
            NtmError::Validation { field, .. } => assert_eq!(field, "depends_on"),
            other => panic!("expected validation error, got {other}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let doc = r#"
schema_version: "2.0"
name: selfloop
steps:
  - id: a
    depends_on: [a]
    prompt: "a"
"#;
        let workflow = Workflow::parse_yaml(doc).unwrap();
        assert!(workflow.validate().is_err());
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let doc = r#"
schema_version: "2.0"
name: dangling
steps:
  - id: a
    depends_on: [ghost]
    prompt: "a"
"#;
        let workflow = Workflow::parse_yaml(doc).unwrap();
        let err = workflow.validate().unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let doc = r#"
schema_version: "2.0"
name: dupes
steps:
  - id: a
    prompt: "one"
  - id: a
    prompt: "two"
"#;
        let workflow = Workflow::parse_yaml(doc).unwrap();
        assert!(workflow.validate().is_err());
    }

    #[test]
    fn test_duplicate_ids_allowed_across_containers() {
        // Ids are unique per container, not globally
        let doc = r#"
schema_version: "2.0"
name: scoped
steps:
  - id: outer
    parallel:
      - id: inner
        prompt: "x"
  - id: second
    loop:
      items: "${vars.items}"
      as: item
      steps:
        - id: inner
          prompt: "y"
"#;
        let workflow = Workflow::parse_yaml(doc).unwrap();
        workflow.validate().unwrap();
    }

    #[test]
    fn test_nested_containers_validate() {
        // Containers nest recursively: a loop body may hold a parallel
        // block, and siblings inside a container may depend on each other
        let doc = r#"
schema_version: "2.0"
name: nested
steps:
  - id: outer
    loop:
      items: "${vars.items}"
      as: item
      steps:
        - id: prep
          prompt: "prep ${loop.item}"
        - id: inner
          depends_on: [prep]
          parallel:
            - id: deep
              prompt: "x"
"#;
        let workflow = Workflow::parse_yaml(doc).unwrap();
        workflow.validate().unwrap();
    }

    #[test]
    fn test_nested_cycle_rejected() {
        let doc = r#"
schema_version: "2.0"
name: nested-cycle
steps:
  - id: fan
    parallel:
      - id: a
        depends_on: [b]
        prompt: "a"
      - id: b
        depends_on: [a]
        prompt: "b"
"#;
        let workflow = Workflow::parse_yaml(doc).unwrap();
        match workflow.validate().unwrap_err() {
            NtmError::Validation { field, .. } => assert_eq!(field, "depends_on"),
            other => panic!("expected validation error, got {other}"),
        }
    }

    #[test]
    fn test_nested_unknown_dependency_rejected() {
        // Dependency references resolve within their own container only
        let doc = r#"
schema_version: "2.0"
name: nested-dangling
steps:
  - id: root
    prompt: "root"
  - id: fan
    parallel:
      - id: a
        depends_on: [root]
        prompt: "a"
"#;
        let workflow = Workflow::parse_yaml(doc).unwrap();
        let err = workflow.validate().unwrap_err();
        assert!(err.to_string().contains("root"));
    }

    #[test]
    fn test_multiple_bodies_rejected() {
        let doc = r#"
schema_version: "2.0"
name: both
steps:
  - id: a
    prompt: "x"
    parallel:
      - id: b
        prompt: "y"
"#;
        let workflow = Workflow::parse_yaml(doc).unwrap();
        let err = workflow.validate().unwrap_err();
        assert!(err.to_string().contains("at most one"));
    }

    #[test]
    fn test_bind_variables_override() {
        let workflow = Workflow::parse_yaml(BASIC_YAML).unwrap();
        let mut overrides = HashMap::new();
        overrides.insert("target".to_string(), serde_json::json!("release"));

        let bound = workflow.bind_variables(&overrides).unwrap();
        assert_eq!(bound["target"], serde_json::json!("release"));
        assert_eq!(bound["parallelism"], serde_json::json!(2));
    }

    #[test]
    fn test_bind_variables_type_mismatch() {
        let workflow = Workflow::parse_yaml(BASIC_YAML).unwrap();
        let mut overrides = HashMap::new();
        overrides.insert("parallelism".to_string(), serde_json::json!("lots"));

        let err = workflow.bind_variables(&overrides).unwrap_err();
        assert!(err.to_string().contains("vars.parallelism"));
    }

    #[test]
    fn test_bind_variables_undeclared() {
        let workflow = Workflow::parse_yaml(BASIC_YAML).unwrap();
        let mut overrides = HashMap::new();
        overrides.insert("bogus".to_string(), serde_json::json!(1));
        assert!(workflow.bind_variables(&overrides).is_err());
    }
}
