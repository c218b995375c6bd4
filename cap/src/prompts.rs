//! Prompt template rendering
//!
//! Phase instructions, turn prompts and retry prompts are Handlebars
//! templates rendered against a JSON context. A template string starting
//! with `@` is treated as a file path and loaded before rendering.

use std::fs;
use std::path::Path;

use handlebars::Handlebars;
use serde::Serialize;
use serde_json::Value;

use crate::error::{CascadeError, Result};

/// Context available to phase instruction templates
#[derive(Debug, Clone, Default, Serialize)]
pub struct PromptContext {
    /// Original cascade input
    pub input: Value,
    /// Current echo state map
    pub state: Value,
    /// Outputs of completed phases keyed by phase name
    pub outputs: Value,
    /// Lineage entries (phase, output)
    pub lineage: Value,
    /// Rendered history length, for templates that care
    pub history: Value,
    /// Current turn number
    pub turn: usize,
    /// Sounding index when running inside a sounding, else 0
    pub sounding_index: usize,
    pub is_sounding: bool,
    pub sounding_factor: usize,
}

/// Template engine wrapper
///
/// Strict mode is off: templates referencing absent values render empty,
/// which is what phase authors expect from optional context.
pub struct PromptEngine {
    handlebars: Handlebars<'static>,
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();
        handlebars.register_escape_fn(handlebars::no_escape);
        Self { handlebars }
    }

    /// Render an inline template, or a file when prefixed with `@`
    pub fn render<T: Serialize>(&self, template: &str, context: &T) -> Result<String> {
        let source = if let Some(path) = template.strip_prefix('@') {
            self.load_template_file(Path::new(path))?
        } else {
            template.to_string()
        };

        self.handlebars
            .render_template(&source, context)
            .map_err(|e| CascadeError::Template(e.to_string()))
    }

    fn load_template_file(&self, path: &Path) -> Result<String> {
        fs::read_to_string(path)
            .map_err(|e| CascadeError::Template(format!("Template not found {}: {}", path.display(), e)))
    }
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}
