//! Quartermaster - model-driven tool selection
//!
//! When a phase declares `tackle: "manifest"`, a quartermaster call sees the
//! current goal plus the full tackle manifest and returns the subset of tool
//! names worth offering. Selection errors degrade to "no tools" rather than
//! failing the phase.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use super::manifest::{ManifestEntry, format_manifest};
use crate::agent::{Agent, AgentRequest};
use crate::validate::extract_json_lenient;

const QUARTERMASTER_SYSTEM: &str = "You are the quartermaster: given a mission and the available tackle, \
     select the tools the agent will actually need. Too many tools dilute \
     attention; too few strand the mission. Respond with ONLY a JSON array \
     of tool names, e.g. [\"search\", \"run_sql\"]. Respond [] if none apply.";

/// Ask the model to select tools for a goal
///
/// Returns names filtered to those actually in the manifest.
pub async fn select_tackle(
    agent: &dyn Agent,
    model: &str,
    goal: &str,
    manifest: &BTreeMap<String, ManifestEntry>,
) -> Vec<String> {
    if manifest.is_empty() {
        return Vec::new();
    }

    let user = format!("Mission:\n{}\n\n{}", goal, format_manifest(manifest));
    let request = AgentRequest {
        system: QUARTERMASTER_SYSTEM.to_string(),
        user: Some(user),
        context: vec![],
        tools: vec![],
        model: model.to_string(),
    };

    let response = match agent.run(request).await {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "Quartermaster call failed; offering no tools");
            return Vec::new();
        }
    };

    let selected = parse_selection(&response.content);
    let filtered: Vec<String> = selected
        .into_iter()
        .filter(|name| manifest.contains_key(name))
        .collect();
    debug!(?filtered, "Quartermaster selection");
    filtered
}

fn parse_selection(content: &str) -> Vec<String> {
    // Direct or embedded JSON array of strings
    if let Some(value) = extract_json_lenient(content)
        && let Some(items) = value.as_array()
    {
        return items
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect();
    }
    // Plain array even outside an object context
    if let Ok(value) = serde_json::from_str::<Vec<String>>(content.trim()) {
        return value;
    }
    // Line-based fallback: "- name" bullets
    content
        .lines()
        .filter_map(|line| line.trim().strip_prefix("- ").map(|s| s.trim().to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{MockAgent, text_response};
    use crate::tackle::registry::ToolRegistry;
    use serde_json::json;

    fn manifest() -> BTreeMap<String, ManifestEntry> {
        let mut registry = ToolRegistry::new();
        registry.register_fn("search", "Search", json!({}), |_| Ok(json!(null)));
        registry.register_fn("run_sql", "Run SQL", json!({}), |_| Ok(json!(null)));
        crate::tackle::manifest::build_manifest(&registry, &[])
    }

    #[tokio::test]
    async fn test_selects_from_json_array() {
        let agent = MockAgent::new(vec![text_response(r#"["search"]"#)]);
        let selected = select_tackle(&agent, "m", "find tide data", &manifest()).await;
        assert_eq!(selected, vec!["search"]);
    }

    #[tokio::test]
    async fn test_unknown_names_filtered() {
        let agent = MockAgent::new(vec![text_response(r#"["search", "made_up_tool"]"#)]);
        let selected = select_tackle(&agent, "m", "goal", &manifest()).await;
        assert_eq!(selected, vec!["search"]);
    }

    #[tokio::test]
    async fn test_fenced_array_parses() {
        let agent = MockAgent::new(vec![text_response("```json\n[\"run_sql\"]\n```")]);
        let selected = select_tackle(&agent, "m", "goal", &manifest()).await;
        assert_eq!(selected, vec!["run_sql"]);
    }

    #[tokio::test]
    async fn test_agent_failure_degrades_to_empty() {
        let agent = MockAgent::new(vec![]);
        let selected = select_tackle(&agent, "m", "goal", &manifest()).await;
        assert!(selected.is_empty());
    }

    #[tokio::test]
    async fn test_empty_manifest_skips_call() {
        let agent = MockAgent::new(vec![]);
        let selected = select_tackle(&agent, "m", "goal", &BTreeMap::new()).await;
        assert!(selected.is_empty());
        assert_eq!(agent.call_count(), 0);
    }

    #[test]
    fn test_bullet_fallback() {
        assert_eq!(parse_selection("- search\n- run_sql"), vec!["search", "run_sql"]);
    }
}
