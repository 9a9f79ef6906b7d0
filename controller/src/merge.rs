//! Merge implements the key-aware recursive merge of YAML-shaped trees.
//!
//! Kubernetes object lists are semantically identified by `name` or
//! `metadata.name`; a plain list concat or wholesale replace loses user
//! intent. Sequences are therefore merged entry-by-entry against the key
//! inferred once from the source side, so sibling entries share a matcher.

use std::collections::HashMap;

use serde_json::Value;

/// Merge combines `overlay` onto `source`.
///
/// Mappings merge by key union, sequences merge key-aware, and on any other
/// pairing (scalars, type mismatch) the overlay side wins.
pub fn merge(source: Value, overlay: Value) -> Value {
    match (source, overlay) {
        (Value::Object(existing), Value::Object(incoming)) => {
            let mut merged = existing;
            for (key, value) in incoming {
                match merged.remove(&key) {
                    Some(current) => {
                        merged.insert(key, merge(current, value));
                    }
                    None => {
                        merged.insert(key, value);
                    }
                }
            }
            Value::Object(merged)
        }
        (Value::Array(existing), Value::Array(incoming)) => {
            Value::Array(merge_sequences(existing, incoming))
        }
        (_, overlay) => overlay,
    }
}

/// Merge_sequences replaces-by-merge entries whose key matches an entry of
/// `existing` and appends the rest in input order.
fn merge_sequences(existing: Vec<Value>, incoming: Vec<Value>) -> Vec<Value> {
    let matcher = Matcher::infer(&existing);

    // Index only the source side; first occurrence of a key wins.
    let mut index: HashMap<String, usize> = HashMap::new();
    for (position, entry) in existing.iter().enumerate() {
        if let Some(key) = matcher.key_of(entry) {
            index.entry(key.to_string()).or_insert(position);
        }
    }

    let mut merged = existing;
    for entry in incoming {
        let slot = matcher
            .key_of(&entry)
            .and_then(|key| index.get(key).copied());
        match slot {
            Some(position) => {
                let current = std::mem::take(&mut merged[position]);
                merged[position] = merge(current, entry);
            }
            None => merged.push(entry),
        }
    }
    merged
}

/// Matcher extracts the identity key sequence entries are matched on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Matcher {
    /// Entries carry a top-level `name`.
    Name,
    /// Entries carry `metadata.name`.
    MetadataName,
    /// No identity key; every incoming entry appends.
    None,
}

impl Matcher {
    /// Infer inspects `entries` in order and picks the first applicable rule.
    fn infer(entries: &[Value]) -> Matcher {
        for entry in entries {
            let Some(map) = entry.as_object() else {
                continue;
            };
            if map.contains_key("name") {
                return Matcher::Name;
            }
            let nested = map.get("metadata").and_then(Value::as_object);
            if nested.is_some_and(|meta| meta.contains_key("name")) {
                return Matcher::MetadataName;
            }
        }
        Matcher::None
    }

    /// Key_of returns the non-empty string key of `entry`, if it has one.
    fn key_of(self, entry: &Value) -> Option<&str> {
        let map = entry.as_object()?;
        let key = match self {
            Matcher::Name => map.get("name")?.as_str(),
            Matcher::MetadataName => map.get("metadata")?.get("name")?.as_str(),
            Matcher::None => None,
        };
        key.filter(|key| !key.is_empty())
    }
}
