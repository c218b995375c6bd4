//! Tool call extraction from free-form model output
//!
//! Models that are not using native tool calling announce tool invocations
//! in a zoo of dialects: fenced JSON, XML-ish tags, ReAct transcripts,
//! special tokens, YAML blocks, provider wrappers. Each dialect is a
//! distinct extractor; all of them canonicalize to `{id, name, args}` and
//! duplicates collapse by `(name, hash(canonical args))`.
//!
//! Malformed JSON inside something that was clearly meant as a tool call is
//! reported as an error string so the runner can retry the attempt instead
//! of silently ignoring the call.

use regex::Regex;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tracing::debug;

use crate::cascade::species::canonical_json;

/// One canonicalized tool invocation
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedToolCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

/// Extraction result: calls found plus an optional parse error
///
/// Both can be present: well-formed calls are kept even when another block
/// failed to parse.
#[derive(Debug, Default)]
pub struct ParseOutcome {
    pub calls: Vec<ParsedToolCall>,
    pub error: Option<String>,
}

/// Fence languages that are real languages, not tool names
const KNOWN_LANGUAGES: &[&str] = &[
    "python", "rust", "javascript", "js", "typescript", "ts", "bash", "sh", "shell", "json", "jsonc", "yaml", "yml",
    "sql", "html", "css", "c", "cpp", "java", "go", "ruby", "php", "xml", "markdown", "md", "toml", "text", "txt",
    "diff", "mermaid",
];

/// Identifiers that look like calls but are everyday prose/stdlib
const STDLIB_NAMES: &[&str] = &[
    "print", "println", "len", "format", "str", "int", "float", "dict", "list", "set", "range", "type", "json",
    "console", "require", "import", "function", "return", "if", "while", "for", "match",
];

/// Layered tool-call parser
pub struct ToolCallParser {
    known_tools: Vec<String>,
}

impl ToolCallParser {
    /// Parser aware of the tools actually offered to the phase
    ///
    /// Knowing the names tightens the heuristic formats (fence-language and
    /// function-call syntax); unknown names from explicit formats still
    /// parse, the registry rejects them later.
    pub fn new(known_tools: Vec<String>) -> Self {
        Self { known_tools }
    }

    pub fn without_known_tools() -> Self {
        Self::new(Vec::new())
    }

    /// Run every extractor over the content and canonicalize the results
    pub fn parse(&self, content: &str) -> ParseOutcome {
        let mut state = ParseState::default();

        self.extract_fenced_json(content, &mut state);
        self.extract_fenced_tool_language(content, &mut state);
        self.extract_fenced_yaml(content, &mut state);
        self.extract_tagged_blocks(content, &mut state);
        self.extract_invoke_tags(content, &mut state);
        self.extract_named_xml(content, &mut state);
        self.extract_special_tokens(content, &mut state);
        self.extract_mistral(content, &mut state);
        self.extract_react(content, &mut state);
        self.extract_directive(content, &mut state);
        self.extract_markdown_tool(content, &mut state);
        self.extract_function_syntax(content, &mut state);
        self.extract_bare_json(content, &mut state);
        self.extract_simple_kv(content, &mut state);

        debug!(calls = state.calls.len(), error = ?state.error, "Tool call parse complete");
        ParseOutcome {
            calls: state.calls,
            error: state.error,
        }
    }

    fn is_known_tool(&self, name: &str) -> bool {
        self.known_tools.iter().any(|t| t == name)
    }

    // === Format 1: fenced ```json blocks ===
    fn extract_fenced_json(&self, content: &str, state: &mut ParseState) {
        for block in fenced_blocks(content, Some("json")) {
            match serde_json::from_str::<Value>(&block) {
                Ok(value) => state.push_value(&value, None),
                Err(e) => {
                    if looks_like_tool_call(&block) {
                        state.set_error(format!("Malformed JSON in tool call block: {}", e));
                    }
                }
            }
        }
    }

    // === Format 2: fence language is a tool name ===
    fn extract_fenced_tool_language(&self, content: &str, state: &mut ParseState) {
        let re = fence_open_regex();
        for caps in re.captures_iter(content) {
            let lang = caps[1].to_string();
            if KNOWN_LANGUAGES.contains(&lang.as_str()) {
                continue;
            }
            if !self.is_known_tool(&lang) {
                continue;
            }
            let after = caps.get(0).map(|m| m.end()).unwrap_or(0);
            if let Some(body) = fence_body(content, after) {
                let args = serde_json::from_str::<Value>(body.trim()).unwrap_or_else(|_| {
                    // Non-JSON body becomes a single "input" argument
                    serde_json::json!({ "input": body.trim() })
                });
                state.push_call(&lang, args);
            }
        }
    }

    // === Format 11: fenced YAML with tool:/function:/action: key ===
    fn extract_fenced_yaml(&self, content: &str, state: &mut ParseState) {
        for block in fenced_blocks(content, Some("yaml")).into_iter().chain(fenced_blocks(content, Some("yml"))) {
            if let Some((name, args)) = yaml_tool_mapping(&block) {
                state.push_call(&name, args);
            }
        }
    }

    // === Formats 3, 8, 15: tagged blocks ===
    fn extract_tagged_blocks(&self, content: &str, state: &mut ParseState) {
        for tag in ["tool_call", "function_call", "tools", "tool_calls", "function_calls"] {
            for body in tag_bodies(content, tag) {
                let trimmed = body.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(trimmed) {
                    Ok(value) => state.push_value(&value, None),
                    Err(e) => {
                        if looks_like_tool_call(trimmed) {
                            state.set_error(format!("Malformed JSON in <{}> block: {}", tag, e));
                        }
                    }
                }
            }
        }
    }

    // === Format 4: <invoke name="N"> with JSON or <parameter> children ===
    fn extract_invoke_tags(&self, content: &str, state: &mut ParseState) {
        let re = Regex::new(r#"(?s)<invoke(?:\s+name="([^"]+)")?\s*>(.*?)</invoke>"#).expect("static regex");
        let param_re =
            Regex::new(r#"(?s)<parameter\s+name="([^"]+)"\s*>(.*?)</parameter>"#).expect("static regex");

        for caps in re.captures_iter(content) {
            let body = caps[2].trim().to_string();
            let name_attr = caps.get(1).map(|m| m.as_str().to_string());

            if param_re.is_match(&body) {
                let mut args = Map::new();
                for param in param_re.captures_iter(&body) {
                    let key = param[1].to_string();
                    let raw = param[2].trim();
                    let value = serde_json::from_str::<Value>(raw)
                        .unwrap_or_else(|_| Value::String(raw.to_string()));
                    args.insert(key, value);
                }
                if let Some(name) = name_attr {
                    state.push_call(&name, Value::Object(args));
                }
                continue;
            }

            match serde_json::from_str::<Value>(&body) {
                Ok(value) => match name_attr {
                    Some(name) => state.push_call(&name, value),
                    None => state.push_value(&value, None),
                },
                Err(e) => {
                    if looks_like_tool_call(&body) || name_attr.is_some() {
                        state.set_error(format!("Malformed JSON in <invoke> block: {}", e));
                    }
                }
            }
        }
    }

    // === Format 10: XML with name= attribute ===
    fn extract_named_xml(&self, content: &str, state: &mut ParseState) {
        let re = Regex::new(
            r#"(?s)<(function_call|tool|action)\s+name="([^"]+)"\s*>(.*?)</(?:function_call|tool|action)>"#,
        )
        .expect("static regex");
        for caps in re.captures_iter(content) {
            let name = caps[2].to_string();
            let body = caps[3].trim();
            let args = if body.is_empty() {
                Value::Object(Map::new())
            } else {
                match serde_json::from_str::<Value>(body) {
                    Ok(value) => value,
                    Err(e) => {
                        state.set_error(format!("Malformed JSON in <{} name=..> block: {}", &caps[1], e));
                        continue;
                    }
                }
            };
            state.push_call(&name, args);
        }
    }

    // === Format 16: special tokens ===
    fn extract_special_tokens(&self, content: &str, state: &mut ParseState) {
        let patterns = [
            r"(?s)<\|tool_call\|>(.*?)<\|/tool_call\|>",
            r"(?s)\[TOOL_CALL\](.*?)\[/TOOL_CALL\]",
        ];
        for pattern in patterns {
            let re = Regex::new(pattern).expect("static regex");
            for caps in re.captures_iter(content) {
                let body = caps[1].trim();
                match serde_json::from_str::<Value>(body) {
                    Ok(value) => state.push_value(&value, None),
                    Err(e) => state.set_error(format!("Malformed JSON in tool call token: {}", e)),
                }
            }
        }
    }

    // === Format 7: Mistral [TOOL_CALLS] [...] ===
    fn extract_mistral(&self, content: &str, state: &mut ParseState) {
        if let Some(pos) = content.find("[TOOL_CALLS]") {
            let rest = &content[pos + "[TOOL_CALLS]".len()..];
            if let Some(json_str) = take_balanced_json(rest) {
                match serde_json::from_str::<Value>(&json_str) {
                    Ok(value) => state.push_value(&value, None),
                    Err(e) => state.set_error(format!("Malformed JSON after [TOOL_CALLS]: {}", e)),
                }
            }
        }
    }

    // === Format 6: ReAct Action / Action Input ===
    fn extract_react(&self, content: &str, state: &mut ParseState) {
        let re = Regex::new(r"(?m)^\s*Action:\s*(\S+)\s*$").expect("static regex");
        for caps in re.captures_iter(content) {
            let name = caps[1].trim_end_matches(':').to_string();
            let after = caps.get(0).map(|m| m.end()).unwrap_or(0);
            let rest = &content[after..];
            if let Some(input_pos) = rest.find("Action Input:") {
                let input_rest = &rest[input_pos + "Action Input:".len()..];
                if let Some(json_str) = take_balanced_json(input_rest) {
                    match serde_json::from_str::<Value>(&json_str) {
                        Ok(args) => state.push_call(&name, args),
                        Err(e) => state.set_error(format!("Malformed JSON in Action Input: {}", e)),
                    }
                }
            }
        }
    }

    // === Format 17: Use/Call/Execute/Run directive ===
    fn extract_directive(&self, content: &str, state: &mut ParseState) {
        let re = Regex::new(r"(?m)^\s*(?:Use|Call|Execute|Run):\s*(\S+)\s*$").expect("static regex");
        for caps in re.captures_iter(content) {
            let name = caps[1].to_string();
            let after = caps.get(0).map(|m| m.end()).unwrap_or(0);
            let rest = &content[after..];
            if let Some(with_pos) = rest.find("With:") {
                let with_rest = &rest[with_pos + "With:".len()..];
                if let Some(json_str) = take_balanced_json(with_rest) {
                    match serde_json::from_str::<Value>(&json_str) {
                        Ok(args) => state.push_call(&name, args),
                        Err(e) => state.set_error(format!("Malformed JSON in With: block: {}", e)),
                    }
                }
            }
        }
    }

    // === Format 18: markdown ## Tool: N + ### Arguments: fenced block ===
    fn extract_markdown_tool(&self, content: &str, state: &mut ParseState) {
        let re = Regex::new(r"(?m)^#{1,4}\s*Tool:\s*(\S+)\s*$").expect("static regex");
        for caps in re.captures_iter(content) {
            let name = caps[1].to_string();
            let after = caps.get(0).map(|m| m.end()).unwrap_or(0);
            let rest = &content[after..];
            let args_section = rest
                .find("Arguments:")
                .map(|pos| &rest[pos + "Arguments:".len()..])
                .unwrap_or(rest);
            let candidate = fenced_blocks(args_section, None)
                .into_iter()
                .next()
                .or_else(|| take_balanced_json(args_section));
            if let Some(raw) = candidate {
                match serde_json::from_str::<Value>(raw.trim()) {
                    Ok(args) => state.push_call(&name, args),
                    Err(e) => state.set_error(format!("Malformed JSON in Tool arguments: {}", e)),
                }
            }
        }
    }

    // === Format 5: function-call syntax N({...}) ===
    fn extract_function_syntax(&self, content: &str, state: &mut ParseState) {
        let re = Regex::new(r"\b([a-zA-Z_][a-zA-Z0-9_]*)\s*\(\s*\{").expect("static regex");
        for caps in re.captures_iter(content) {
            let name = caps[1].to_string();
            if STDLIB_NAMES.contains(&name.as_str()) {
                continue;
            }
            if !self.known_tools.is_empty() && !self.is_known_tool(&name) {
                continue;
            }
            let brace_start = caps.get(0).map(|m| m.end() - 1).unwrap_or(0);
            if let Some(json_str) = take_balanced_json(&content[brace_start..]) {
                if let Ok(args) = serde_json::from_str::<Value>(&json_str) {
                    state.push_call(&name, args);
                }
            }
        }
    }

    // === Formats 9, 12, 13, 14, 15: bare JSON lines and arrays ===
    fn extract_bare_json(&self, content: &str, state: &mut ParseState) {
        for line in content.lines() {
            let trimmed = line.trim();
            let is_object = trimmed.starts_with('{')
                && (trimmed.contains("\"tool\"")
                    || trimmed.contains("\"name\"")
                    || trimmed.contains("\"function\"")
                    || trimmed.contains("\"tool_name\"")
                    || trimmed.contains("\"function_call\""));
            let is_array = trimmed.starts_with('[') && looks_like_tool_call(trimmed);
            if !is_object && !is_array {
                continue;
            }
            if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
                state.push_value(&value, None);
            }
        }

        // Raw JSON spanning multiple lines from the start of a line
        for (offset, _) in content.match_indices('\n') {
            let rest = &content[offset + 1..];
            let trimmed = rest.trim_start();
            if (trimmed.starts_with('{') || trimmed.starts_with('['))
                && looks_like_tool_call(trimmed.split("\n\n").next().unwrap_or(trimmed))
                && let Some(json_str) = take_balanced_json(trimmed)
                && let Ok(value) = serde_json::from_str::<Value>(&json_str)
            {
                state.push_value(&value, None);
            }
        }
    }

    // === Format 19: simple KV block ===
    fn extract_simple_kv(&self, content: &str, state: &mut ParseState) {
        // A paragraph whose first line is `tool: N` and remaining lines are
        // `key: value` pairs.
        for paragraph in content.split("\n\n") {
            let trimmed = paragraph.trim();
            let first = trimmed.lines().next().unwrap_or("");
            let named = first.strip_prefix("tool:").or_else(|| first.strip_prefix("function:"));
            if named.is_none() {
                continue;
            }
            if trimmed.contains('{') || trimmed.contains('`') {
                continue;
            }
            if let Some((name, args)) = yaml_tool_mapping(trimmed) {
                state.push_call(&name, args);
            }
        }
    }
}

#[derive(Default)]
struct ParseState {
    calls: Vec<ParsedToolCall>,
    seen: HashSet<(String, String)>,
    error: Option<String>,
    next_id: usize,
}

impl ParseState {
    fn set_error(&mut self, message: String) {
        if self.error.is_none() {
            self.error = Some(message);
        }
    }

    /// Canonicalize an arbitrary JSON value into zero or more calls
    fn push_value(&mut self, value: &Value, name_hint: Option<&str>) {
        match value {
            Value::Array(items) => {
                for item in items {
                    self.push_value(item, name_hint);
                }
            }
            Value::Object(_) => {
                if let Some((name, args)) = canonical_call(value, name_hint) {
                    self.push_call(&name, args);
                }
            }
            _ => {}
        }
    }

    fn push_call(&mut self, name: &str, args: Value) {
        let args = normalize_args(args);
        let key = (name.to_string(), args_fingerprint(&args));
        if !self.seen.insert(key) {
            return;
        }
        let id = format!("call_{}", self.next_id);
        self.next_id += 1;
        self.calls.push(ParsedToolCall {
            id,
            name: name.to_string(),
            args,
        });
    }
}

/// Interpret one JSON object as a tool call in any of the known shapes
fn canonical_call(value: &Value, name_hint: Option<&str>) -> Option<(String, Value)> {
    let obj = value.as_object()?;

    // OpenAI wrapper: {"type":"function","function":{"name":..,"arguments":..}}
    if let Some(function) = obj.get("function").and_then(|f| f.as_object()) {
        let name = function.get("name")?.as_str()?.to_string();
        let args = function
            .get("arguments")
            .cloned()
            .unwrap_or(Value::Object(Map::new()));
        return Some((name, args));
    }

    // Gemini: {"function_call":{"name":..,"args":..}}
    if let Some(call) = obj.get("function_call").and_then(|f| f.as_object()) {
        let name = call.get("name")?.as_str()?.to_string();
        let args = call
            .get("args")
            .or_else(|| call.get("arguments"))
            .cloned()
            .unwrap_or(Value::Object(Map::new()));
        return Some((name, args));
    }

    // Cohere: {"tool_name":..,"parameters":..}
    if let Some(name) = obj.get("tool_name").and_then(|v| v.as_str()) {
        let args = obj.get("parameters").cloned().unwrap_or(Value::Object(Map::new()));
        return Some((name.to_string(), args));
    }

    // Plain: {"tool"|"name": N, "arguments"|"args"|"parameters"|"input": A}
    let name = obj
        .get("tool")
        .or_else(|| obj.get("name"))
        .and_then(|v| v.as_str())
        .map(String::from)
        .or_else(|| name_hint.map(String::from))?;
    let args = obj
        .get("arguments")
        .or_else(|| obj.get("args"))
        .or_else(|| obj.get("parameters"))
        .or_else(|| obj.get("input"))
        .cloned()
        .unwrap_or_else(|| {
            // Remaining keys become the arguments
            let rest: Map<String, Value> = obj
                .iter()
                .filter(|(k, _)| !matches!(k.as_str(), "tool" | "name" | "type"))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            Value::Object(rest)
        });
    Some((name, args))
}

/// Arguments serialized as a JSON string get decoded
fn normalize_args(args: Value) -> Value {
    match args {
        Value::String(text) => serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text)),
        other => other,
    }
}

fn args_fingerprint(args: &Value) -> String {
    let digest = Sha256::digest(canonical_json(args).as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn looks_like_tool_call(text: &str) -> bool {
    text.contains("\"tool\"")
        || text.contains("\"name\"")
        || text.contains("\"function\"")
        || text.contains("\"tool_name\"")
        || text.contains("\"function_call\"")
}

/// Bodies of ``` fenced blocks, optionally filtered by language
fn fenced_blocks(content: &str, language: Option<&str>) -> Vec<String> {
    let pattern = match language {
        Some(lang) => format!(r"(?s)```{}[ \t]*\n(.*?)```", regex::escape(lang)),
        None => r"(?s)```[a-zA-Z0-9_]*[ \t]*\n(.*?)```".to_string(),
    };
    let Ok(re) = Regex::new(&pattern) else {
        return Vec::new();
    };
    re.captures_iter(content).map(|c| c[1].to_string()).collect()
}

/// Bodies of `<tag>...</tag>` blocks
fn tag_bodies(content: &str, tag: &str) -> Vec<String> {
    let pattern = format!("(?s)<{0}>(.*?)</{0}>", regex::escape(tag));
    let Ok(re) = Regex::new(&pattern) else {
        return Vec::new();
    };
    re.captures_iter(content).map(|c| c[1].to_string()).collect()
}

fn fence_open_regex() -> Regex {
    Regex::new(r"```([a-zA-Z0-9_]+)[ \t]*\n").expect("static regex")
}

/// Body of the fence whose opener ends at `from`
fn fence_body(content: &str, from: usize) -> Option<&str> {
    let rest = &content[from..];
    let end = rest.find("```")?;
    Some(&rest[..end])
}

/// Scan a balanced JSON object or array from the first brace/bracket
fn take_balanced_json(text: &str) -> Option<String> {
    let start = text.find(|c| c == '{' || c == '[')?;
    let bytes = text.as_bytes();
    let open = bytes[start] as char;
    let close = if open == '{' { '}' } else { ']' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            c if !in_string && c == open => depth += 1,
            c if !in_string && c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + offset + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse a YAML mapping carrying a tool/function/action key
fn yaml_tool_mapping(block: &str) -> Option<(String, Value)> {
    let parsed: serde_yaml::Value = serde_yaml::from_str(block).ok()?;
    let map = parsed.as_mapping()?;

    let mut name = None;
    let mut args = Map::new();
    let mut explicit_args = None;

    for (key, value) in map {
        let key = key.as_str()?;
        match key {
            "tool" | "function" | "action" => {
                name = value.as_str().map(String::from);
            }
            "arguments" | "args" | "parameters" => {
                explicit_args = serde_json::to_value(value).ok();
            }
            other => {
                if let Ok(v) = serde_json::to_value(value) {
                    args.insert(other.to_string(), v);
                }
            }
        }
    }

    let name = name?;
    let args = explicit_args.unwrap_or(Value::Object(args));
    Some((name, args))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parser() -> ToolCallParser {
        ToolCallParser::new(vec![
            "run_code".to_string(),
            "linux_shell".to_string(),
            "search".to_string(),
            "run_sql".to_string(),
        ])
    }

    fn single(content: &str) -> ParsedToolCall {
        let outcome = parser().parse(content);
        assert!(outcome.error.is_none(), "unexpected error: {:?}", outcome.error);
        assert_eq!(outcome.calls.len(), 1, "expected one call in: {}", content);
        outcome.calls.into_iter().next().unwrap()
    }

    #[test]
    fn test_fenced_json() {
        let call = single("Here:\n```json\n{\"tool\": \"run_code\", \"arguments\": {\"code\": \"x=1\"}}\n```\n");
        assert_eq!(call.name, "run_code");
        assert_eq!(call.args, json!({"code": "x=1"}));
    }

    #[test]
    fn test_fence_language_is_tool_name() {
        let call = single("```search\n{\"query\": \"tide tables\"}\n```");
        assert_eq!(call.name, "search");
        assert_eq!(call.args, json!({"query": "tide tables"}));
    }

    #[test]
    fn test_fence_language_known_language_skipped() {
        let outcome = parser().parse("```python\nprint('hi')\n```");
        assert!(outcome.calls.is_empty());
    }

    #[test]
    fn test_tool_call_tag() {
        let call = single("<tool_call>{\"name\": \"search\", \"arguments\": {\"q\": 1}}</tool_call>");
        assert_eq!(call.name, "search");
        assert_eq!(call.args, json!({"q": 1}));
    }

    #[test]
    fn test_function_call_tag() {
        let call = single("<function_call>{\"name\": \"search\", \"arguments\": {}}</function_call>");
        assert_eq!(call.name, "search");
    }

    #[test]
    fn test_invoke_with_json() {
        let call = single("<invoke name=\"search\">{\"query\": \"x\"}</invoke>");
        assert_eq!(call.name, "search");
        assert_eq!(call.args, json!({"query": "x"}));
    }

    #[test]
    fn test_invoke_with_parameter_children() {
        let call = single(
            "<invoke name=\"run_sql\"><parameter name=\"sql\">SELECT 1</parameter><parameter name=\"limit\">10</parameter></invoke>",
        );
        assert_eq!(call.name, "run_sql");
        assert_eq!(call.args, json!({"sql": "SELECT 1", "limit": 10}));
    }

    #[test]
    fn test_named_xml_variants() {
        let call = single("<tool name=\"search\">{\"q\": \"a\"}</tool>");
        assert_eq!(call.name, "search");
        let call = single("<action name=\"search\">{\"q\": \"b\"}</action>");
        assert_eq!(call.name, "search");
        let call = single("<function_call name=\"search\">{\"q\": \"c\"}</function_call>");
        assert_eq!(call.name, "search");
    }

    #[test]
    fn test_function_call_syntax() {
        let call = single("I'll run search({\"query\": \"weather\"}) now.");
        assert_eq!(call.name, "search");
        assert_eq!(call.args, json!({"query": "weather"}));
    }

    #[test]
    fn test_function_call_syntax_stdlib_skipped() {
        let outcome = parser().parse("print({\"x\": 1})");
        assert!(outcome.calls.is_empty());
    }

    #[test]
    fn test_react_format() {
        let call = single("Thought: I should search.\nAction: search\nAction Input: {\"query\": \"tides\"}\nObservation:");
        assert_eq!(call.name, "search");
        assert_eq!(call.args, json!({"query": "tides"}));
    }

    #[test]
    fn test_mistral_tool_calls() {
        let call = single("[TOOL_CALLS] [{\"name\": \"search\", \"arguments\": {\"q\": \"x\"}}]");
        assert_eq!(call.name, "search");
    }

    #[test]
    fn test_hermes_chatml() {
        let call = single("<tool_call>{\"name\": \"search\", \"arguments\": {\"query\": \"x\"}}</tool_call>");
        assert_eq!(call.name, "search");
        assert_eq!(call.args, json!({"query": "x"}));
    }

    #[test]
    fn test_bare_json_line() {
        let call = single("I'll run this: gets ignored\n{\"tool\": \"linux_shell\", \"arguments\": {\"command\": \"ls /tmp\"}}\n");
        assert_eq!(call.name, "linux_shell");
        assert_eq!(call.args, json!({"command": "ls /tmp"}));
    }

    #[test]
    fn test_openai_wrapper_with_string_arguments() {
        let call = single(
            r#"{"type":"function","function":{"name":"search","arguments":"{\"query\":\"x\"}"}}"#,
        );
        assert_eq!(call.name, "search");
        assert_eq!(call.args, json!({"query": "x"}));
    }

    #[test]
    fn test_cohere_format() {
        let call = single(r#"{"tool_name":"search","parameters":{"query":"x"}}"#);
        assert_eq!(call.name, "search");
        assert_eq!(call.args, json!({"query": "x"}));
    }

    #[test]
    fn test_gemini_format() {
        let call = single(r#"{"function_call":{"name":"search","args":{"query":"x"}}}"#);
        assert_eq!(call.name, "search");
        assert_eq!(call.args, json!({"query": "x"}));
    }

    #[test]
    fn test_wrapped_array() {
        let outcome = parser().parse(
            "<tool_calls>[{\"name\": \"search\", \"arguments\": {\"q\": 1}}, {\"name\": \"run_sql\", \"arguments\": {\"sql\": \"SELECT 1\"}}]</tool_calls>",
        );
        assert_eq!(outcome.calls.len(), 2);
        assert_eq!(outcome.calls[0].name, "search");
        assert_eq!(outcome.calls[1].name, "run_sql");
    }

    #[test]
    fn test_special_tokens() {
        let call = single("<|tool_call|>{\"name\": \"search\", \"arguments\": {\"q\": 1}}<|/tool_call|>");
        assert_eq!(call.name, "search");
        let call = single("[TOOL_CALL]{\"name\": \"search\", \"arguments\": {\"q\": 2}}[/TOOL_CALL]");
        assert_eq!(call.name, "search");
    }

    #[test]
    fn test_directive_format() {
        let call = single("Use: search\nWith: {\"query\": \"x\"}");
        assert_eq!(call.name, "search");
        let call = single("Execute: run_sql\nWith: {\"sql\": \"SELECT 1\"}");
        assert_eq!(call.name, "run_sql");
    }

    #[test]
    fn test_markdown_tool_format() {
        let call = single("## Tool: search\n### Arguments:\n```json\n{\"query\": \"x\"}\n```");
        assert_eq!(call.name, "search");
        assert_eq!(call.args, json!({"query": "x"}));
    }

    #[test]
    fn test_yaml_fenced_block() {
        let call = single("```yaml\ntool: search\nquery: tides\nlimit: 3\n```");
        assert_eq!(call.name, "search");
        assert_eq!(call.args, json!({"query": "tides", "limit": 3}));
    }

    #[test]
    fn test_simple_kv_block() {
        let call = single("tool: search\nquery: tides\nlimit: 3");
        assert_eq!(call.name, "search");
        assert_eq!(call.args, json!({"query": "tides", "limit": 3}));
    }

    #[test]
    fn test_dedup_same_call_across_formats() {
        let content = r#"```json
{"tool": "search", "arguments": {"query": "x"}}
```
<tool_call>{"name": "search", "arguments": {"query": "x"}}</tool_call>"#;
        let outcome = parser().parse(content);
        assert_eq!(outcome.calls.len(), 1);
    }

    #[test]
    fn test_distinct_args_not_deduped() {
        let content = "```json\n{\"tool\": \"search\", \"arguments\": {\"q\": 1}}\n```\n```json\n{\"tool\": \"search\", \"arguments\": {\"q\": 2}}\n```";
        let outcome = parser().parse(content);
        assert_eq!(outcome.calls.len(), 2);
    }

    #[test]
    fn test_multiple_calls_mixed_formats() {
        let content = r#"First:
```json
{"tool": "run_code", "arguments": {"code": "x=1"}}
```

Then:
{"tool": "search", "arguments": {"query": "result"}}
"#;
        let outcome = parser().parse(content);
        assert_eq!(outcome.calls.len(), 2);
    }

    #[test]
    fn test_malformed_json_sets_error() {
        let outcome = parser().parse("```json\n{\"tool\": \"search\", \"arguments\": {broken}\n```");
        assert!(outcome.error.is_some());
    }

    #[test]
    fn test_plain_prose_yields_nothing() {
        let outcome = parser().parse("The tides are governed by the moon. Nothing to run here.");
        assert!(outcome.calls.is_empty());
        assert!(outcome.error.is_none());
    }

    #[test]
    fn test_ids_are_sequential() {
        let content = "```json\n[{\"tool\": \"search\", \"arguments\": {\"q\": 1}}, {\"tool\": \"search\", \"arguments\": {\"q\": 2}}]\n```";
        let outcome = parser().parse(content);
        assert_eq!(outcome.calls[0].id, "call_0");
        assert_eq!(outcome.calls[1].id, "call_1");
    }

    #[test]
    fn test_balanced_json_respects_strings() {
        let text = r#"prefix {"a": "}", "b": {"c": 1}} suffix"#;
        let json_str = take_balanced_json(text).unwrap();
        assert_eq!(json_str, r#"{"a": "}", "b": {"c": 1}}"#);
    }
}
