//! Structural and content checks on the agent's output object.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{EXIT_CODE_MARKER, SETUP_REPO_SCRIPT};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field `{0}`")]
    MissingField(String),

    #[error("field `{field}` is malformed: {reason}")]
    Malformed { field: String, reason: String },

    /// Only raised when repair is disabled.
    #[error("eval_script never echoes OMNIGRIL_EXIT_CODE")]
    MissingMarker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatorConfig {
    /// Append the exit-code echo instead of rejecting.
    pub repair_missing_marker: bool,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            repair_missing_marker: true,
        }
    }
}

/// A validated environment spec for one instance.
///
/// Serializes to the per-instance value of the output file. Keys the agent
/// emitted beyond the required three are carried through untouched, except
/// `instance_id`, which always names the instance the spec was built for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifacts {
    pub instance_id: String,
    pub dockerfile: String,
    pub eval_script: String,
    pub setup_scripts: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Artifacts {
    pub fn setup_repo_script(&self) -> Option<&str> {
        self.setup_scripts.get(SETUP_REPO_SCRIPT).map(String::as_str)
    }
}

/// Whether a non-comment line of `script` mentions the exit-code marker.
pub fn has_exit_marker(script: &str) -> bool {
    script.lines().any(|line| {
        let line = line.trim_start();
        !line.starts_with('#') && line.contains(EXIT_CODE_MARKER)
    })
}

/// Append the exit-code echo unless the script already has one.
pub fn repair_exit_marker(script: &str) -> String {
    if has_exit_marker(script) {
        return script.to_string();
    }
    format!(
        "{}\nrc=$?\necho \"{EXIT_CODE_MARKER}=$rc\"\n",
        script.trim_end()
    )
}

fn required_string(obj: &serde_json::Map<String, Value>, field: &str) -> Result<String, ValidationError> {
    match obj.get(field) {
        None | Some(Value::Null) => Err(ValidationError::MissingField(field.to_string())),
        Some(Value::String(s)) if s.trim().is_empty() => Err(ValidationError::Malformed {
            field: field.to_string(),
            reason: "must not be empty".to_string(),
        }),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(ValidationError::Malformed {
            field: field.to_string(),
            reason: format!("expected a string, got {}", json_type(other)),
        }),
    }
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Check `raw` and turn it into [`Artifacts`].
pub fn validate(
    instance_id: &str,
    raw: &Value,
    config: &ValidatorConfig,
) -> Result<Artifacts, ValidationError> {
    let Value::Object(obj) = raw else {
        return Err(ValidationError::Malformed {
            field: "<root>".to_string(),
            reason: format!("expected an object, got {}", json_type(raw)),
        });
    };

    let dockerfile = required_string(obj, "dockerfile")?;
    let mut eval_script = required_string(obj, "eval_script")?;

    let scripts = match obj.get("setup_scripts") {
        None | Some(Value::Null) => {
            return Err(ValidationError::MissingField("setup_scripts".to_string()));
        }
        Some(Value::Object(map)) => map,
        Some(other) => {
            return Err(ValidationError::Malformed {
                field: "setup_scripts".to_string(),
                reason: format!("expected an object, got {}", json_type(other)),
            });
        }
    };

    let mut setup_scripts = BTreeMap::new();
    for (name, body) in scripts {
        let Value::String(body) = body else {
            return Err(ValidationError::Malformed {
                field: format!("setup_scripts.{name}"),
                reason: format!("expected a string, got {}", json_type(body)),
            });
        };
        setup_scripts.insert(name.clone(), body.clone());
    }
    match setup_scripts.get(SETUP_REPO_SCRIPT) {
        None => {
            return Err(ValidationError::MissingField(format!(
                "setup_scripts.{SETUP_REPO_SCRIPT}"
            )));
        }
        Some(body) if body.trim().is_empty() => {
            return Err(ValidationError::Malformed {
                field: format!("setup_scripts.{SETUP_REPO_SCRIPT}"),
                reason: "must not be empty".to_string(),
            });
        }
        Some(_) => {}
    }

    if !has_exit_marker(&eval_script) {
        if !config.repair_missing_marker {
            return Err(ValidationError::MissingMarker);
        }
        tracing::warn!(instance_id, "eval_script missing {EXIT_CODE_MARKER}, injecting");
        eval_script = repair_exit_marker(&eval_script);
    }

    let extra = obj
        .iter()
        .filter(|(k, _)| {
            !matches!(
                k.as_str(),
                "instance_id" | "dockerfile" | "eval_script" | "setup_scripts"
            )
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Ok(Artifacts {
        instance_id: instance_id.to_string(),
        dockerfile,
        eval_script,
        setup_scripts,
        extra,
    })
}
