//! Species hash - stable identity for a phase's prompt DNA
//!
//! The hash captures the configuration that *generates* prompts, not any
//! rendered prompt: the instruction template, soundings config, rules,
//! output schema and wards. Model choice and rendered template values are
//! deliberately excluded so runs can be compared across models and inputs.
//! Prior winning rewrites are retrieved by this key.

use serde_json::Value;
use sha2::{Digest, Sha256};

use super::config::PhaseConfig;

/// Compute the 16-hex-char species hash for a phase
pub fn species_hash(phase: &PhaseConfig) -> String {
    let spec_parts = serde_json::json!({
        "instructions": phase.instructions,
        "soundings": phase.soundings,
        "rules": phase.rules,
        "output_schema": phase.output_schema,
        "wards": phase.wards,
    });

    let canonical = canonical_json(&spec_parts);
    let digest = Sha256::digest(canonical.as_bytes());
    hex_prefix(&digest, 16)
}

/// Deterministic JSON: keys sorted recursively, compact separators
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let entries: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", entries.join(","))
        }
        Value::Array(items) => {
            let entries: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", entries.join(","))
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn hex_prefix(bytes: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for byte in bytes {
        out.push_str(&format!("{:02x}", byte));
        if out.len() >= chars {
            break;
        }
    }
    out.truncate(chars);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cascade::config::{RulesConfig, SoundingsConfig};

    fn phase(instructions: &str) -> PhaseConfig {
        PhaseConfig {
            name: "p".to_string(),
            instructions: instructions.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_hash_is_16_hex_chars() {
        let hash = species_hash(&phase("Write a poem about {{topic}}"));
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_stable_across_calls() {
        let p = phase("Write a poem about {{topic}}");
        assert_eq!(species_hash(&p), species_hash(&p));
    }

    #[test]
    fn test_model_does_not_affect_hash() {
        let mut a = phase("Do the thing");
        let mut b = phase("Do the thing");
        a.model = Some("model-x".to_string());
        b.model = Some("model-y".to_string());
        assert_eq!(species_hash(&a), species_hash(&b));
    }

    #[test]
    fn test_phase_name_does_not_affect_hash() {
        let mut a = phase("Do the thing");
        a.name = "alpha".to_string();
        let mut b = phase("Do the thing");
        b.name = "beta".to_string();
        assert_eq!(species_hash(&a), species_hash(&b));
    }

    #[test]
    fn test_instructions_change_hash() {
        assert_ne!(species_hash(&phase("A")), species_hash(&phase("B")));
    }

    #[test]
    fn test_soundings_change_hash() {
        let plain = phase("Do the thing");
        let mut with_soundings = phase("Do the thing");
        with_soundings.soundings = Some(SoundingsConfig {
            factor: 3,
            ..Default::default()
        });
        assert_ne!(species_hash(&plain), species_hash(&with_soundings));
    }

    #[test]
    fn test_rules_change_hash() {
        let a = phase("Do the thing");
        let mut b = phase("Do the thing");
        b.rules = RulesConfig {
            max_turns: 5,
            ..Default::default()
        };
        assert_ne!(species_hash(&a), species_hash(&b));
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let value = serde_json::json!({"b": 1, "a": {"d": 2, "c": [3, {"f": 4, "e": 5}]}});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"c":[3,{"e":5,"f":4}],"d":2},"b":1}"#
        );
    }

    #[test]
    fn test_canonical_json_null_preserved() {
        let value = serde_json::json!({"soundings": null});
        assert_eq!(canonical_json(&value), r#"{"soundings":null}"#);
    }
}
