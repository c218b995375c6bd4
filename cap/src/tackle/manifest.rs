//! Tackle manifest - unified discovery of function and cascade tools
//!
//! Function tools come from the registry; cascade tools are cascade files
//! under the configured tackle directories that declare an `inputs_schema`
//! (which is what makes them callable). The manifest feeds both the
//! quartermaster prompt and the checkpoint UI.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::registry::ToolRegistry;
use crate::cascade::loader::load_cascade;

/// One manifest entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// "function" or "cascade"
    pub kind: String,
    pub description: String,
    /// Parameter schema for functions, inputs_schema for cascades
    pub schema: Value,
    /// Cascade file path, when kind == "cascade"
    pub path: Option<PathBuf>,
}

/// Build the full manifest: registry tools plus cascade tools on disk
pub fn build_manifest(registry: &ToolRegistry, tackle_dirs: &[PathBuf]) -> BTreeMap<String, ManifestEntry> {
    let mut manifest = BTreeMap::new();

    for (name, tool) in registry.iter() {
        manifest.insert(
            name.clone(),
            ManifestEntry {
                kind: "function".to_string(),
                description: tool.description().to_string(),
                schema: tool.schema(),
                path: None,
            },
        );
    }

    for dir in tackle_dirs {
        scan_dir(dir, &mut manifest);
    }

    debug!(entries = manifest.len(), "Tackle manifest built");
    manifest
}

fn scan_dir(dir: &Path, manifest: &mut BTreeMap<String, ManifestEntry>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            scan_dir(&path, manifest);
            continue;
        }
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if !matches!(extension, "json" | "yaml" | "yml") {
            continue;
        }
        // Only cascades with an inputs_schema are usable as tools
        let Ok(config) = load_cascade(&path) else {
            continue;
        };
        if config.inputs_schema.is_empty() {
            continue;
        }

        let mut description = config
            .description
            .clone()
            .unwrap_or_else(|| format!("Cascade tool: {}", config.cascade_id));
        let params: Vec<String> = config
            .inputs_schema
            .iter()
            .map(|(name, desc)| format!("  - {}: {}", name, desc))
            .collect();
        if !params.is_empty() {
            description.push_str("\n\nParameters:\n");
            description.push_str(&params.join("\n"));
        }

        manifest.insert(
            config.cascade_id.clone(),
            ManifestEntry {
                kind: "cascade".to_string(),
                description,
                schema: serde_json::to_value(&config.inputs_schema).unwrap_or(Value::Null),
                path: Some(path),
            },
        );
    }
}

/// Readable one-line-per-tool listing for the quartermaster prompt
pub fn format_manifest(manifest: &BTreeMap<String, ManifestEntry>) -> String {
    let mut lines = vec!["Available Tackle:".to_string(), String::new()];
    for (name, entry) in manifest {
        let first_line = entry.description.lines().next().unwrap_or("");
        lines.push(format!("- {} ({}): {}", name, entry.kind, first_line));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_manifest_includes_registry_tools() {
        let mut registry = ToolRegistry::new();
        registry.register_fn("search", "Full text search", json!({"type": "object"}), |_| {
            Ok(json!([]))
        });

        let manifest = build_manifest(&registry, &[]);
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest["search"].kind, "function");
    }

    #[test]
    fn test_manifest_discovers_cascade_tools() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("summarize.json"),
            r#"{
                "cascade_id": "summarize_doc",
                "description": "Summarize a document",
                "inputs_schema": {"text": "The document text"},
                "phases": [{"name": "sum", "instructions": "Summarize {{input}}"}]
            }"#,
        )
        .unwrap();
        // A cascade without inputs_schema is not a tool
        std::fs::write(
            dir.path().join("internal.json"),
            r#"{"cascade_id": "internal", "phases": [{"name": "p", "instructions": "x"}]}"#,
        )
        .unwrap();

        let manifest = build_manifest(&ToolRegistry::new(), &[dir.path().to_path_buf()]);
        assert_eq!(manifest.len(), 1);
        let entry = &manifest["summarize_doc"];
        assert_eq!(entry.kind, "cascade");
        assert!(entry.description.contains("text: The document text"));
        assert!(entry.path.is_some());
    }

    #[test]
    fn test_manifest_scans_nested_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("analysis");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(
            nested.join("rank.yaml"),
            "cascade_id: rank_items\ninputs_schema:\n  items: the items\nphases:\n  - name: rank\n    instructions: rank them\n",
        )
        .unwrap();

        let manifest = build_manifest(&ToolRegistry::new(), &[dir.path().to_path_buf()]);
        assert!(manifest.contains_key("rank_items"));
    }

    #[test]
    fn test_format_manifest() {
        let mut registry = ToolRegistry::new();
        registry.register_fn("search", "Full text search\nwith extra detail", json!({}), |_| Ok(json!(null)));
        let manifest = build_manifest(&registry, &[]);

        let formatted = format_manifest(&manifest);
        assert!(formatted.starts_with("Available Tackle:"));
        assert!(formatted.contains("- search (function): Full text search"));
        assert!(!formatted.contains("extra detail"));
    }

    #[test]
    fn test_missing_dir_is_fine() {
        let manifest = build_manifest(&ToolRegistry::new(), &[PathBuf::from("/no/such/dir")]);
        assert!(manifest.is_empty());
    }
}
