//! Cache key derivation.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

/// A key that uniquely identifies a cached read.
///
/// The key is composed of the resource name and its parameters, serialized in
/// sorted order, so the same query built with parameters in any insertion
/// order maps to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// The resource being read, e.g. `catalog`
    pub resource: String,
    /// Query parameters, sorted by name
    pub params: BTreeMap<String, String>,
}

impl CacheKey {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            params: BTreeMap::new(),
        }
    }

    /// Add a parameter. A repeated name replaces the earlier value.
    pub fn param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }

    /// Build a key from any serializable parameter struct or map.
    ///
    /// Top-level fields become parameters; `null` fields are skipped. A
    /// non-object value is stored under the single parameter `value`.
    pub fn from_params<P: Serialize>(
        resource: impl Into<String>,
        params: &P,
    ) -> serde_json::Result<Self> {
        let mut key = Self::new(resource);
        match serde_json::to_value(params)? {
            Value::Object(fields) => {
                for (name, value) in fields {
                    match value {
                        Value::Null => {}
                        Value::String(s) => {
                            key.params.insert(name, s);
                        }
                        other => {
                            key.params.insert(name, other.to_string());
                        }
                    }
                }
            }
            Value::Null => {}
            other => {
                key.params.insert("value".to_string(), other.to_string());
            }
        }
        Ok(key)
    }

    /// Prefix shared by every key of `resource`.
    pub fn resource_prefix(resource: &str) -> String {
        format!("{}:", resource)
    }

    /// Convert the key to its string form: `resource:k1=v1,k2=v2`.
    pub fn to_string_key(&self) -> String {
        let entries: Vec<String> = self
            .params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        format!("{}:{}", self.resource, entries.join(","))
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.to_string_key()
    }
}
