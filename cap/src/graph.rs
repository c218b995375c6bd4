//! Trace tree reconstruction and Mermaid serialization
//!
//! The diagram is a view on the log, not a parallel data structure: every
//! row carries its parent linkage, so the tree (and the `.mmd` file) is
//! rebuilt from rows alone.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use eyre::Result;
use unilog::{LogFilter, LogRow, UnifiedLog};

/// One node of the in-memory trace tree
#[derive(Debug, Clone)]
pub struct TraceNode {
    pub id: String,
    pub node_type: String,
    pub name: String,
    pub parent_id: Option<String>,
    pub depth: i64,
    pub children: Vec<TraceNode>,
}

/// Rebuild the trace tree for a session from its log rows
///
/// Returns the roots (rows whose parent is absent from the session).
pub fn build_trace_tree(rows: &[LogRow]) -> Vec<TraceNode> {
    let ids: HashSet<&str> = rows.iter().map(|row| row.trace_id.as_str()).collect();

    // Children grouped by parent, preserving timestamp order
    let mut children_of: BTreeMap<String, Vec<&LogRow>> = BTreeMap::new();
    let mut roots: Vec<&LogRow> = Vec::new();
    for row in rows {
        match row.parent_id.as_deref().filter(|p| ids.contains(p)) {
            Some(parent) => children_of.entry(parent.to_string()).or_default().push(row),
            None => roots.push(row),
        }
    }

    fn build(row: &LogRow, children_of: &BTreeMap<String, Vec<&LogRow>>) -> TraceNode {
        let children = children_of
            .get(&row.trace_id)
            .map(|rows| rows.iter().map(|r| build(r, children_of)).collect())
            .unwrap_or_default();
        TraceNode {
            id: row.trace_id.clone(),
            node_type: row.node_type.clone(),
            name: node_label(row),
            parent_id: row.parent_id.clone(),
            depth: row.depth,
            children,
        }
    }

    roots.iter().map(|row| build(row, &children_of)).collect()
}

fn node_label(row: &LogRow) -> String {
    let mut label = match (&row.phase_name, row.role.as_deref()) {
        (Some(phase), Some(role)) => format!("{}: {}", phase, role),
        (Some(phase), None) => phase.clone(),
        (None, Some(role)) => role.to_string(),
        (None, None) => row.node_type.clone(),
    };
    if let Some(index) = row.sounding_index {
        label.push_str(&format!(" [s{}]", index));
    }
    label
}

/// Render a session's trace tree as a Mermaid flowchart
pub fn mermaid_for_session(log: &UnifiedLog, session_id: &str) -> Result<String> {
    let rows = log.query(&LogFilter::session(session_id))?;
    let mut lines = vec!["graph TD".to_string()];

    for row in &rows {
        let id = short_id(&row.trace_id);
        lines.push(format!("    {}[\"{}\"]", id, escape(&node_label(row))));
        if let Some(parent) = &row.parent_id {
            lines.push(format!("    {} --> {}", short_id(parent), id));
        }
    }
    Ok(lines.join("\n"))
}

/// Write the diagram to `{graph_root}/{session_id}.mmd`
pub fn write_session_graph(log: &UnifiedLog, graph_root: &Path, session_id: &str) -> Result<()> {
    let content = mermaid_for_session(log, session_id)?;
    std::fs::create_dir_all(graph_root)?;
    std::fs::write(graph_root.join(format!("{}.mmd", session_id)), content)?;
    Ok(())
}

fn short_id(trace_id: &str) -> String {
    let cleaned: String = trace_id.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    format!("n{}", &cleaned[..8.min(cleaned.len())])
}

fn escape(label: &str) -> String {
    label.replace('"', "'")
}

#[cfg(test)]
mod tests {
    use super::*;
    use unilog::LogRow;

    fn row(trace: &str, parent: Option<&str>, node_type: &str, phase: Option<&str>) -> LogRow {
        let mut row = LogRow::new("sess-1", node_type);
        row.trace_id = trace.to_string();
        row.parent_id = parent.map(String::from);
        row.phase_name = phase.map(String::from);
        row
    }

    #[test]
    fn test_tree_reconstruction() {
        let rows = vec![
            row("root", None, "cascade", None),
            row("phase1", Some("root"), "phase", Some("draft")),
            row("msg1", Some("phase1"), "message", Some("draft")),
            row("msg2", Some("phase1"), "message", Some("draft")),
        ];
        let tree = build_trace_tree(&rows);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].id, "root");
        assert_eq!(tree[0].children.len(), 1);
        assert_eq!(tree[0].children[0].children.len(), 2);
    }

    #[test]
    fn test_orphan_parent_becomes_root() {
        let rows = vec![row("a", Some("missing"), "message", None)];
        let tree = build_trace_tree(&rows);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_sounding_label() {
        let mut r = row("a", None, "message", Some("draft"));
        r.sounding_index = Some(2);
        r.role = Some("assistant".to_string());
        assert_eq!(node_label(&r), "draft: assistant [s2]");
    }

    #[tokio::test]
    async fn test_mermaid_output() {
        let log = UnifiedLog::open_in_memory().unwrap();
        let mut root = LogRow::new("sess-1", "cascade");
        root.trace_id = "aaaaaaaa-1111".to_string();
        log.log(root);
        let mut child = LogRow::new("sess-1", "phase");
        child.trace_id = "bbbbbbbb-2222".to_string();
        child.parent_id = Some("aaaaaaaa-1111".to_string());
        child.phase_name = Some("draft".to_string());
        log.log(child);
        log.flush().await;

        let mermaid = mermaid_for_session(&log, "sess-1").unwrap();
        assert!(mermaid.starts_with("graph TD"));
        assert!(mermaid.contains("naaaaaaaa --> nbbbbbbbb"));
        assert!(mermaid.contains("draft"));
    }

    #[tokio::test]
    async fn test_write_session_graph() {
        let log = UnifiedLog::open_in_memory().unwrap();
        log.log(LogRow::new("sess-1", "cascade"));
        log.flush().await;

        let dir = tempfile::tempdir().unwrap();
        write_session_graph(&log, dir.path(), "sess-1").unwrap();
        let content = std::fs::read_to_string(dir.path().join("sess-1.mmd")).unwrap();
        assert!(content.starts_with("graph TD"));
    }
}
