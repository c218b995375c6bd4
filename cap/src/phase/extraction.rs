//! Output extraction - structured capture from phase output
//!
//! Scratchpad pattern: reasoning stays in the transcript, the part that
//! matters is captured by regex into a state variable for clean handoffs.

use regex::RegexBuilder;
use serde_json::Value;

use crate::cascade::config::{ExtractionFormat, OutputExtractionConfig};
use crate::error::{CascadeError, Result};

/// Extract content per the config
///
/// Returns `Ok(None)` when an optional pattern does not match; a missing
/// required pattern is an extraction error.
pub fn extract_output(content: &str, config: &OutputExtractionConfig) -> Result<Option<Value>> {
    let re = RegexBuilder::new(&config.pattern)
        .dot_matches_new_line(true)
        .case_insensitive(true)
        .build()
        .map_err(|e| CascadeError::Config(format!("Invalid extraction pattern '{}': {}", config.pattern, e)))?;

    let Some(captures) = re.captures(content) else {
        if config.required {
            return Err(CascadeError::Extraction(config.pattern.clone()));
        }
        return Ok(None);
    };

    let extracted = captures
        .get(1)
        .or_else(|| captures.get(0))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default();

    match config.format {
        ExtractionFormat::Text => Ok(Some(Value::String(extracted))),
        ExtractionFormat::Json => match serde_json::from_str::<Value>(&extracted) {
            Ok(value) => Ok(Some(value)),
            Err(e) if config.required => Err(CascadeError::Extraction(format!("Invalid JSON: {}", e))),
            // Optional extraction degrades to the raw text
            Err(_) => Ok(Some(Value::String(extracted))),
        },
        ExtractionFormat::Code => {
            let code_re = RegexBuilder::new(r"```(?:\w+)?\n(.*?)```")
                .dot_matches_new_line(true)
                .build()
                .map_err(|e| CascadeError::Config(e.to_string()))?;
            let code = code_re
                .captures(&extracted)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
                .unwrap_or(extracted);
            Ok(Some(Value::String(code)))
        }
    }
}

/// Whether a pattern matches at all (used for decision detection)
pub fn has_pattern(content: &str, pattern: &str) -> bool {
    RegexBuilder::new(pattern)
        .dot_matches_new_line(true)
        .case_insensitive(true)
        .build()
        .map(|re| re.is_match(content))
        .unwrap_or(false)
}
