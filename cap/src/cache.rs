//! Content-addressed cache for deterministic tool results
//!
//! Keyed by tool name plus a hash of the arguments (or a single designated
//! argument for query/SQL tools). Entries expire on TTL, evict LRU at the
//! size cap, and drop on subscribed invalidation events.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::cascade::config::{CacheKeyKind, ToolCachePolicy, ToolCachingConfig};
use crate::cascade::species::canonical_json;

struct CacheEntry {
    tool: String,
    result: Value,
    stored_at: Instant,
    last_used: Instant,
}

/// Cache statistics
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Per-run tool result cache
pub struct ToolCache {
    config: ToolCachingConfig,
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl ToolCache {
    pub fn new(config: ToolCachingConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    /// Disabled cache that never hits
    pub fn disabled() -> Self {
        Self::new(ToolCachingConfig::default())
    }

    fn policy(&self, tool_name: &str) -> Option<&ToolCachePolicy> {
        if !self.config.enabled {
            return None;
        }
        self.config.tools.get(tool_name).filter(|p| p.enabled)
    }

    /// Cached result for this call, if fresh
    pub fn get(&mut self, tool_name: &str, args: &Value) -> Option<Value> {
        let policy = self.policy(tool_name)?;
        let ttl = Duration::from_secs(policy.ttl_seconds);
        let key = cache_key(tool_name, args, policy.key);

        match self.entries.get_mut(&key) {
            Some(entry) if entry.stored_at.elapsed() < ttl => {
                entry.last_used = Instant::now();
                self.hits += 1;
                debug!(tool_name, key = &key[..16.min(key.len())], "Tool cache hit");
                Some(entry.result.clone())
            }
            Some(_) => {
                self.entries.remove(&key);
                self.misses += 1;
                None
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Store a result under the policy's key
    pub fn set(&mut self, tool_name: &str, args: &Value, result: Value) {
        let Some(policy) = self.policy(tool_name) else {
            return;
        };
        let key = cache_key(tool_name, args, policy.key);
        let now = Instant::now();
        self.entries.insert(
            key,
            CacheEntry {
                tool: tool_name.to_string(),
                result,
                stored_at: now,
                last_used: now,
            },
        );

        // LRU eviction past the size cap
        while self.entries.len() > self.config.max_cache_size {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                    self.evictions += 1;
                }
                None => break,
            }
        }
    }

    /// Drop entries whose policy subscribes to this event
    pub fn invalidate(&mut self, event: &str) {
        let tools: Vec<String> = self
            .config
            .tools
            .iter()
            .filter(|(_, p)| p.invalidate_on.iter().any(|e| e == event))
            .map(|(name, _)| name.clone())
            .collect();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !tools.contains(&entry.tool));
        let dropped = before - self.entries.len();
        if dropped > 0 {
            debug!(event, dropped, "Tool cache invalidated");
        }
    }

    /// Clear one tool's entries, or everything
    pub fn clear(&mut self, tool_name: Option<&str>) {
        match tool_name {
            Some(name) => self.entries.retain(|_, entry| entry.tool != name),
            None => self.entries.clear(),
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            size: self.entries.len(),
        }
    }
}

/// Build the cache key for a call under a key policy
fn cache_key(tool_name: &str, args: &Value, kind: CacheKeyKind) -> String {
    match kind {
        CacheKeyKind::ArgsHash => format!("{}:{}", tool_name, sha_hex(&canonical_json(args))),
        CacheKeyKind::Query => {
            let query = args.get("query").and_then(|v| v.as_str()).unwrap_or("");
            format!("{}:query:{}", tool_name, sha_hex(query))
        }
        CacheKeyKind::SqlHash => {
            let sql = args.get("sql").and_then(|v| v.as_str()).unwrap_or("");
            format!("{}:sql:{}", tool_name, sha_hex(sql))
        }
    }
}

fn sha_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
