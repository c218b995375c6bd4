//! Cascade file loading
//!
//! JSON or YAML selected by extension; unknown extensions try JSON first and
//! fall back to YAML.

use std::path::Path;

use eyre::{Context, Result, eyre};
use tracing::debug;

use super::config::CascadeConfig;

/// Load and structurally validate a cascade definition
pub fn load_cascade(path: impl AsRef<Path>) -> Result<CascadeConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).context(format!("Failed to read cascade file {}", path.display()))?;

    let config = parse_cascade(&content, path)?;
    config
        .validate()
        .map_err(|e| eyre!("Invalid cascade {}: {}", path.display(), e))?;

    debug!(cascade_id = %config.cascade_id, phases = config.phases.len(), "Loaded cascade");
    Ok(config)
}

fn parse_cascade(content: &str, path: &Path) -> Result<CascadeConfig> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    match extension {
        "yaml" | "yml" => {
            serde_yaml::from_str(content).context(format!("Invalid YAML in {}", path.display()))
        }
        "json" => serde_json::from_str(content).context(format!("Invalid JSON in {}", path.display())),
        _ => serde_json::from_str(content)
            .or_else(|_| serde_yaml::from_str(content))
            .context(format!("Neither valid JSON nor YAML: {}", path.display())),
    }
}
