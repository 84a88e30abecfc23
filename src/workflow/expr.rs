//! Workflow expression templating
//!
//! The expression language is a closed set of references substituted
//! textually into prompts:
//! - `${vars.X}`: a bound workflow variable
//! - `${steps.X.output}`: a completed step's output
//! - `${loop.X}`: the current loop binding
//!
//! Loop `items` expressions must resolve to a list: either a list
//! variable or a JSON-array string produced by a prior step.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::errors::{NtmError, Result};

static EXPR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{(vars|steps|loop)\.([A-Za-z0-9_\-]+)(\.output)?\}").expect("static regex")
});

/// Resolution scope for one render
#[derive(Debug, Clone, Default)]
pub struct ExprContext {
    pub vars: HashMap<String, Value>,
    /// Outputs of completed steps, by step id
    pub step_outputs: HashMap<String, String>,
    /// Loop bindings in scope, by bind name
    pub loop_vars: HashMap<String, Value>,
}

impl ExprContext {
    /// Derive a per-iteration scope with one extra loop binding
    pub fn with_loop_binding(&self, name: &str, value: Value) -> Self {
        let mut scope = self.clone();
        scope.loop_vars.insert(name.to_string(), value);
        scope
    }

    fn resolve(&self, kind: &str, name: &str, has_output: bool) -> Result<String> {
        match kind {
            "vars" => self
                .vars
                .get(name)
                .map(value_to_string)
                .ok_or_else(|| NtmError::Validation {
                    field: format!("vars.{name}"),
                    message: "reference to unknown variable".to_string(),
                }),
            "steps" => {
                if !has_output {
                    return Err(NtmError::Validation {
                        field: format!("steps.{name}"),
                        message: "step references must use the .output form".to_string(),
                    });
                }
                self.step_outputs
                    .get(name)
                    .cloned()
                    .ok_or_else(|| NtmError::Validation {
                        field: format!("steps.{name}"),
                        message: "reference to unknown or incomplete step".to_string(),
                    })
            }
            "loop" => self
                .loop_vars
                .get(name)
                .map(value_to_string)
                .ok_or_else(|| NtmError::Validation {
                    field: format!("loop.{name}"),
                    message: "reference outside its loop scope".to_string(),
                }),
            _ => Err(NtmError::Validation {
                field: kind.to_string(),
                message: "unknown reference kind".to_string(),
            }),
        }
    }

    /// Substitute every reference in `template`
    pub fn render(&self, template: &str) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut last = 0;
        for caps in EXPR_RE.captures_iter(template) {
            let whole = caps.get(0).unwrap_or_else(|| unreachable!("capture 0 always exists"));
            out.push_str(&template[last..whole.start()]);
            let kind = &caps[1];
            let name = &caps[2];
            let has_output = caps.get(3).is_some();
            out.push_str(&self.resolve(kind, name, has_output)?);
            last = whole.end();
        }
        out.push_str(&template[last..]);
        Ok(out)
    }

    /// Evaluate a loop `items` expression into its item list
    pub fn evaluate_items(&self, expr: &str) -> Result<Vec<Value>> {
        let trimmed = expr.trim();

        // A single reference resolves structurally, preserving lists
        if let Some(caps) = EXPR_RE.captures(trimmed) {
            let whole = caps.get(0).unwrap_or_else(|| unreachable!("capture 0 always exists"));
            if whole.as_str() == trimmed {
                let kind = &caps[1];
                let name = &caps[2];
                if kind == "vars" || kind == "loop" {
                    let source = if kind == "vars" {
                        &self.vars
                    } else {
                        &self.loop_vars
                    };
                    let value = source.get(name).ok_or_else(|| NtmError::Validation {
                        field: format!("{kind}.{name}"),
                        message: "reference to unknown variable".to_string(),
                    })?;
                    return items_from_value(value, expr);
                }
            }
        }

        // Otherwise render textually and expect a JSON array
        let rendered = self.render(trimmed)?;
        let parsed: Value =
            serde_json::from_str(&rendered).map_err(|_| NtmError::Validation {
                field: "items".to_string(),
                message: format!("'{expr}' did not produce a list"),
            })?;
        items_from_value(&parsed, expr)
    }
}

fn items_from_value(value: &Value, expr: &str) -> Result<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items.clone()),
        // A string may itself be a JSON array (step outputs are text)
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Array(items)) => Ok(items),
            _ => Err(NtmError::Validation {
                field: "items".to_string(),
                message: format!("'{expr}' did not produce a list"),
            }),
        },
        _ => Err(NtmError::Validation {
            field: "items".to_string(),
            message: format!("'{expr}' did not produce a list"),
        }),
    }
}

/// Render a JSON value into prompt text
///
/// Strings substitute bare; everything else is compact JSON.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
