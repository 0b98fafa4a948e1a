//! Originate variable-string formatting.
//!
//! FreeSWITCH accepts a `{k1=v1,k2=v2,...}` prefix on endpoint strings.
//! Booleans are lowercased, numbers stay unquoted, already-quoted strings
//! pass through, everything else is wrapped in single quotes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A value in an originate variable set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl VarValue {
    fn format(&self) -> String {
        match self {
            VarValue::Bool(b) => b.to_string(),
            VarValue::Int(n) => n.to_string(),
            VarValue::Float(x) => x.to_string(),
            VarValue::Str(s) => {
                let pre_quoted = (s.starts_with('\'') && s.ends_with('\'') && s.len() >= 2)
                    || (s.starts_with('"') && s.ends_with('"') && s.len() >= 2);
                if pre_quoted {
                    s.clone()
                } else {
                    format!("'{s}'")
                }
            }
        }
    }
}

impl From<bool> for VarValue {
    fn from(value: bool) -> Self {
        VarValue::Bool(value)
    }
}

impl From<i64> for VarValue {
    fn from(value: i64) -> Self {
        VarValue::Int(value)
    }
}

impl From<f64> for VarValue {
    fn from(value: f64) -> Self {
        VarValue::Float(value)
    }
}

impl From<&str> for VarValue {
    fn from(value: &str) -> Self {
        VarValue::Str(value.to_owned())
    }
}

impl From<String> for VarValue {
    fn from(value: String) -> Self {
        VarValue::Str(value)
    }
}

impl fmt::Display for VarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format())
    }
}

// ---------------------------------------------------------------------------
// VarMap
// ---------------------------------------------------------------------------

/// An insertion-ordered variable set for `originate` and `bridge` targets.
///
/// Order matters: FreeSWITCH reads the variables left to right, and the
/// wire trace of commands must be deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VarMap(Vec<(String, VarValue)>);

impl VarMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a variable; replaces an existing value in place.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<VarValue>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = value,
            None => self.0.push((key, value)),
        }
    }

    /// Set a variable only if it is not already present.
    pub fn set_default(&mut self, key: impl Into<String>, value: impl Into<VarValue>) {
        let key = key.into();
        if !self.contains_key(&key) {
            self.0.push((key, value.into()));
        }
    }

    pub fn get(&self, key: &str) -> Option<&VarValue> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.iter().any(|(k, _)| k == key)
    }

    pub fn remove(&mut self, key: &str) -> Option<VarValue> {
        let idx = self.0.iter().position(|(k, _)| k == key)?;
        Some(self.0.remove(idx).1)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &VarValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Merge `other` on top of `self` without overriding existing keys.
    pub fn merge_defaults(&mut self, other: &VarMap) {
        for (key, value) in other.iter() {
            self.set_default(key, value.clone());
        }
    }

    /// Render the `{k=v,...}` prefix.  An empty map renders as an empty
    /// string, not `{}`.
    pub fn to_variable_string(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let pairs: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| format!("{k}={}", v.format()))
            .collect();
        format!("{{{}}}", pairs.join(","))
    }

    /// Render without quoting, for `api originate` option lists that are
    /// built from raw strings (`origination_uuid=...,return_ring_ready=true`).
    pub fn to_raw_option_string(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let pairs: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| {
                let raw = match v {
                    VarValue::Str(s) => s.clone(),
                    other => other.format(),
                };
                format!("{k}={raw}")
            })
            .collect();
        format!("{{{}}}", pairs.join(","))
    }
}

impl<K: Into<String>, V: Into<VarValue>> FromIterator<(K, V)> for VarMap {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut map = VarMap::new();
        for (k, v) in iter {
            map.set(k, v);
        }
        map
    }
}
