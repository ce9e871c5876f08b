//! The databag: the run's shared key-value state.
//!
//! Every value is a flat string because the whole bag is exported as an
//! environment-variable set to handler subprocesses. Keys are normalized to
//! lower snake-case both on insertion and on lookup, so `ClusterName`,
//! `cluster-name` and `cluster_name` all address the same entry.
//!
//! Structured input (YAML databag files, JSON reported by handlers) is
//! flattened on the way in: nested mappings become `parent_child` keys and
//! sequences become `parent_0`, `parent_1`, ...

use crate::error::{Result, StagehandError};
use serde::Serialize;
use serde_yaml::Value;
use std::collections::BTreeMap;

/// Key holding the path of the per-run intermediate databag file
pub const KEY_INTERMEDIATE_DATABAG: &str = "intermediate_databag_file";
/// Key holding `"debug"` when debug output was requested, else empty
pub const KEY_DEBUG: &str = "debug";
/// Key holding the active environment scope name (empty for the root scope)
pub const KEY_ENV: &str = "env";

/// Message handlers log when a resource needs no work
pub const MSG_UP_TO_DATE: &str = "[√] up to date";

/// Compiled-in keys present in every run
pub const DEFAULT_KEYS: &[(&str, &str)] = &[
    ("msg_up_to_date", MSG_UP_TO_DATE),
    ("up_verb", "up"),
    ("down_verb", "down"),
];

/// Shared key-value state threaded through a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Databag {
    values: BTreeMap<String, String>,
}

impl Databag {
    /// Create an empty databag
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value under the normalized form of `key`, returning any previous value
    pub fn insert(&mut self, key: impl AsRef<str>, value: impl Into<String>) -> Option<String> {
        self.values.insert(normalize_key(key.as_ref()), value.into())
    }

    /// Look up a value by key (normalized before lookup)
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(&normalize_key(key)).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(&normalize_key(key))
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.values.remove(&normalize_key(key))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Apply `other` over this databag; values in `other` win
    pub fn merge(&mut self, other: &Databag) {
        for (key, value) in &other.values {
            self.values.insert(key.clone(), value.clone());
        }
    }

    /// Flatten a structured document into this databag.
    ///
    /// `null` documents contribute nothing. Anything other than a mapping at
    /// the top level is rejected. Returns the number of keys written.
    pub fn merge_value(&mut self, value: &Value) -> Result<usize> {
        let value = untag(value);
        match value {
            Value::Null => Ok(0),
            Value::Mapping(_) => {
                let mut flattened = Vec::new();
                flatten_into(None, value, &mut flattened);
                let count = flattened.len();
                for (key, value) in flattened {
                    self.insert(key, value);
                }
                Ok(count)
            }
            other => Err(StagehandError::config(format!(
                "databag content must be a mapping, found {}",
                value_kind(other)
            ))),
        }
    }

    /// Parse a YAML document into a new databag
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let value: Value = serde_yaml::from_str(content)
            .map_err(|e| StagehandError::config(format!("malformed databag YAML: {}", e)))?;
        let mut databag = Self::new();
        databag.merge_value(&value)?;
        Ok(databag)
    }

    /// Serialize to a YAML mapping
    pub fn to_yaml_string(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.values)?)
    }

    /// Convert to environment variables for handler subprocesses
    pub fn to_env_vars(&self) -> Vec<(String, String)> {
        self.values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Insert the compiled-in default keys
    pub fn insert_defaults(&mut self) {
        for (key, value) in DEFAULT_KEYS {
            self.insert(key, *value);
        }
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Databag {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut databag = Self::new();
        databag.extend(iter);
        databag
    }
}

impl<K: AsRef<str>, V: Into<String>> Extend<(K, V)> for Databag {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (key, value) in iter {
            self.insert(key, value);
        }
    }
}

/// Normalize a key to lower snake-case.
///
/// Separators (`-`, space, `.`) become `_`, a word boundary inside camel or
/// Pascal case gets an `_`, and everything is lowercased:
/// `mixed-CasePascalCase` → `mixed_case_pascal_case`, `HTTPServer` → `http_server`.
pub fn normalize_key(key: &str) -> String {
    let chars: Vec<char> = key.trim().chars().collect();
    let mut out = String::with_capacity(chars.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if matches!(c, '-' | ' ' | '.') {
            out.push('_');
            continue;
        }

        if c.is_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_is_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            let boundary = prev.is_lowercase()
                || prev.is_ascii_digit()
                || (prev.is_uppercase() && next_is_lower);
            if boundary && !out.ends_with('_') {
                out.push('_');
            }
        }

        out.extend(c.to_lowercase());
    }

    out
}

/// Render a scalar YAML value as its flat string form
pub fn scalar_to_string(value: &Value) -> Option<String> {
    match untag(value) {
        Value::Null => Some(String::new()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        Value::Sequence(_) | Value::Mapping(_) | Value::Tagged(_) => None,
    }
}

fn untag(value: &Value) -> &Value {
    match value {
        Value::Tagged(tagged) => untag(&tagged.value),
        other => other,
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a sequence",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

fn flatten_into(prefix: Option<&str>, value: &Value, out: &mut Vec<(String, String)>) {
    let join = |child: &str| match prefix {
        Some(parent) => format!("{}_{}", parent, child),
        None => child.to_string(),
    };

    match untag(value) {
        Value::Mapping(map) => {
            for (key, child) in map {
                let key = scalar_to_string(key).unwrap_or_else(|| {
                    serde_yaml::to_string(key)
                        .map(|s| s.trim().to_string())
                        .unwrap_or_default()
                });
                flatten_into(Some(&join(&key)), child, out);
            }
        }
        Value::Sequence(items) => {
            for (index, child) in items.iter().enumerate() {
                flatten_into(Some(&join(&index.to_string())), child, out);
            }
        }
        scalar => {
            if let (Some(key), Some(text)) = (prefix, scalar_to_string(scalar)) {
                out.push((key.to_string(), text));
            }
        }
    }
}
