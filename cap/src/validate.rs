//! Validators and wards
//!
//! A named validator is either a builtin function or a sub-cascade whose
//! final output is a `{"valid": bool, "reason": str}` blob. Wards attach
//! validators to a phase's input (pre), output (post) or individual turns,
//! with a mode deciding what a failure means: block the phase, log and
//! continue, or burn a retry attempt.

use std::collections::BTreeMap;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::cascade::config::ValidatorConfig;
use crate::error::{CascadeError, Result};

/// Outcome of running one validator
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub valid: bool,
    pub reason: Option<String>,
}

impl ValidationResult {
    pub fn pass() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

/// Hook for validators implemented as sub-cascades
///
/// Defined here to keep the validator free of a dependency on the cascade
/// runner; the engine provides the implementation.
#[async_trait]
pub trait CascadeValidatorHook: Send + Sync {
    async fn run_validator_cascade(&self, path: &str, content: &str) -> Result<ValidationResult>;
}

/// Runs named validators against content blobs
pub struct Validator {
    validators: BTreeMap<String, ValidatorConfig>,
}

impl Validator {
    pub fn new(validators: BTreeMap<String, ValidatorConfig>) -> Self {
        Self { validators }
    }

    pub fn empty() -> Self {
        Self {
            validators: BTreeMap::new(),
        }
    }

    /// Run the named validator against a content blob
    ///
    /// Unknown names and misconfigured validators are config errors, not
    /// validation failures.
    pub async fn run(
        &self,
        name: &str,
        content: &str,
        cascade_hook: Option<&dyn CascadeValidatorHook>,
    ) -> Result<ValidationResult> {
        // Bare builtin names work without a config entry
        let config = match self.validators.get(name) {
            Some(config) => config.clone(),
            None => ValidatorConfig {
                function: Some(name.to_string()),
                ..Default::default()
            },
        };

        if let Some(path) = &config.cascade {
            let hook = cascade_hook.ok_or_else(|| {
                CascadeError::Config(format!("Validator '{}' needs a cascade runner", name))
            })?;
            let result = hook.run_validator_cascade(path, content).await?;
            debug!(validator = name, valid = result.valid, "Cascade validator finished");
            return Ok(result);
        }

        let function = config
            .function
            .as_deref()
            .ok_or_else(|| CascadeError::Config(format!("Validator '{}' declares neither function nor cascade", name)))?;

        let result = run_builtin(function, content, config.args.as_ref())?;
        debug!(validator = name, function, valid = result.valid, "Validator finished");
        Ok(result)
    }
}

/// Builtin validator functions
fn run_builtin(function: &str, content: &str, args: Option<&Value>) -> Result<ValidationResult> {
    match function {
        "has_json" => Ok(match extract_json_lenient(content) {
            Some(_) => ValidationResult::pass(),
            None => ValidationResult::fail("No parseable JSON found in output"),
        }),
        "non_empty" => Ok(if content.trim().is_empty() {
            ValidationResult::fail("Output is empty")
        } else {
            ValidationResult::pass()
        }),
        "contains" => {
            let needle = arg_str(args, "substring")
                .ok_or_else(|| CascadeError::Config("contains validator needs args.substring".to_string()))?;
            Ok(if content.contains(&needle) {
                ValidationResult::pass()
            } else {
                ValidationResult::fail(format!("Output does not contain '{}'", needle))
            })
        }
        "matches" => {
            let pattern = arg_str(args, "pattern")
                .ok_or_else(|| CascadeError::Config("matches validator needs args.pattern".to_string()))?;
            let re = Regex::new(&pattern)
                .map_err(|e| CascadeError::Config(format!("Invalid validator pattern '{}': {}", pattern, e)))?;
            Ok(if re.is_match(content) {
                ValidationResult::pass()
            } else {
                ValidationResult::fail(format!("Output does not match /{}/", pattern))
            })
        }
        "min_length" => {
            let min = arg_u64(args, "value").unwrap_or(1) as usize;
            Ok(if content.trim().len() >= min {
                ValidationResult::pass()
            } else {
                ValidationResult::fail(format!("Output shorter than {} chars", min))
            })
        }
        "max_length" => {
            let max = arg_u64(args, "value").unwrap_or(u64::MAX) as usize;
            Ok(if content.len() <= max {
                ValidationResult::pass()
            } else {
                ValidationResult::fail(format!("Output longer than {} chars", max))
            })
        }
        other => Err(CascadeError::Config(format!("Unknown validator function '{}'", other))),
    }
}

fn arg_str(args: Option<&Value>, key: &str) -> Option<String> {
    args?.get(key)?.as_str().map(String::from)
}

fn arg_u64(args: Option<&Value>, key: &str) -> Option<u64> {
    args?.get(key)?.as_u64()
}

/// Pull JSON out of model output: direct parse, fenced block, greedy object
pub fn extract_json_lenient(content: &str) -> Option<Value> {
    let trimmed = content.trim();

    // Direct
    if let Ok(value) = serde_json::from_str::<Value>(trimmed)
        && (value.is_object() || value.is_array())
    {
        return Some(value);
    }

    // Fenced ```json ... ``` (or anonymous fence holding JSON)
    let fence_re = Regex::new(r"(?s)```(?:json)?[ \t]*\n(.*?)```").ok()?;
    for caps in fence_re.captures_iter(content) {
        if let Ok(value) = serde_json::from_str::<Value>(caps[1].trim())
            && (value.is_object() || value.is_array())
        {
            return Some(value);
        }
    }

    // Greedy: first '{' to last '}'
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end > start {
        if let Ok(value) = serde_json::from_str::<Value>(&content[start..=end]) {
            return Some(value);
        }
    }
    None
}

/// Validate model output against a declared JSON schema
///
/// Returns the parsed value on success so the caller can store it.
pub fn validate_output_schema(content: &str, schema: &Value) -> Result<Value> {
    let value = extract_json_lenient(content)
        .ok_or_else(|| CascadeError::Schema("Output is not parseable as JSON".to_string()))?;

    jsonschema::validate(schema, &value)
        .map_err(|e| CascadeError::Schema(format!("Output does not match schema: {}", e)))?;
    Ok(value)
}
