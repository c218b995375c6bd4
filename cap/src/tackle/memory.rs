//! Memory-bank tools - the inline fallback tackle
//!
//! Every phase can fall back on these when a declared tool name is not in
//! the registry: a small key-value bank the model reads and writes across
//! turns. The bank is shared by all three tools and lives for the run.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};

use super::registry::{ToolDescriptor, ToolRegistry};

/// Shared key-value store behind the memory tools
#[derive(Clone, Default)]
pub struct MemoryBank {
    entries: Arc<Mutex<BTreeMap<String, Value>>>,
}

impl MemoryBank {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.into(), value);
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

/// Register the memory-bank tools on a registry
pub fn register_memory_tools(registry: &mut ToolRegistry, bank: MemoryBank) {
    let set_bank = bank.clone();
    registry.register(Arc::new(ToolDescriptor::new(
        "remember",
        "Store a value under a key for later recall",
        json!({
            "type": "object",
            "properties": {
                "key": { "type": "string" },
                "value": {}
            },
            "required": ["key", "value"]
        }),
        move |args| {
            let key = args
                .get("key")
                .and_then(|v| v.as_str())
                .ok_or("remember requires a string 'key'")?;
            let value = args.get("value").cloned().unwrap_or(Value::Null);
            set_bank.set(key, value);
            Ok(json!({"stored": key}))
        },
    )));

    let get_bank = bank.clone();
    registry.register(Arc::new(ToolDescriptor::new(
        "recall",
        "Recall a previously stored value by key",
        json!({
            "type": "object",
            "properties": { "key": { "type": "string" } },
            "required": ["key"]
        }),
        move |args| {
            let key = args
                .get("key")
                .and_then(|v| v.as_str())
                .ok_or("recall requires a string 'key'")?;
            Ok(match get_bank.get(key) {
                Some(value) => json!({"key": key, "value": value}),
                None => json!({"key": key, "value": null, "missing": true}),
            })
        },
    )));

    let list_bank = bank;
    registry.register(Arc::new(ToolDescriptor::new(
        "recall_keys",
        "List the keys currently stored in memory",
        json!({"type": "object", "properties": {}}),
        move |_| Ok(json!({"keys": list_bank.keys()})),
    )));
}
