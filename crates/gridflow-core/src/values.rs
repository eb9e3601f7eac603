// Copyright 2025 DataStax Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A cheaply cloneable reference to an immutable JSON value.
///
/// Step data, handler configuration, and event payloads are all carried as
/// `ValueRef`. Cloning shares the underlying allocation, which matters because
/// the same payload is routinely held by an event, the projected step state,
/// and an in-flight handler at once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValueRef(Arc<serde_json::Value>);

impl ValueRef {
    pub fn new(value: serde_json::Value) -> Self {
        Self(Arc::new(value))
    }

    /// Get the underlying JSON value.
    pub fn value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }

    /// Look up a field on an object value.
    ///
    /// Returns `None` when the value is not an object or the field is absent.
    pub fn get(&self, field: &str) -> Option<&serde_json::Value> {
        self.0.get(field)
    }

    pub fn is_truthy(&self) -> bool {
        match self.0.as_ref() {
            serde_json::Value::Null => false,
            serde_json::Value::Bool(b) => *b,
            serde_json::Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
            serde_json::Value::String(s) => !s.is_empty(),
            _ => true,
        }
    }

    /// Merge `other` into this value, returning the merged result.
    ///
    /// Object fields from `other` overwrite fields of the same name; any
    /// non-object pairing replaces the value wholesale.
    pub fn merged_with(&self, other: &ValueRef) -> ValueRef {
        match (self.0.as_ref(), other.0.as_ref()) {
            (serde_json::Value::Object(base), serde_json::Value::Object(overlay)) => {
                let mut merged = base.clone();
                for (k, v) in overlay {
                    merged.insert(k.clone(), v.clone());
                }
                ValueRef::new(serde_json::Value::Object(merged))
            }
            _ => other.clone(),
        }
    }
}

impl Default for ValueRef {
    fn default() -> Self {
        Self(Arc::new(serde_json::Value::Null))
    }
}

impl From<serde_json::Value> for ValueRef {
    fn from(value: serde_json::Value) -> Self {
        Self::new(value)
    }
}

impl AsRef<serde_json::Value> for ValueRef {
    fn as_ref(&self) -> &serde_json::Value {
        &self.0
    }
}

impl std::fmt::Display for ValueRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for ValueRef {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ValueRef {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(Self::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_clone_shares_allocation() {
        let a = ValueRef::new(json!({"companyName": "Engie"}));
        let b = a.clone();
        assert!(Arc::ptr_eq(&a.0, &b.0));
    }

    #[test]
    fn test_merged_with_overwrites_fields() {
        let base = ValueRef::new(json!({"a": 1, "b": 2}));
        let overlay = ValueRef::new(json!({"b": 3, "c": 4}));
        let merged = base.merged_with(&overlay);
        assert_eq!(merged.value(), &json!({"a": 1, "b": 3, "c": 4}));
    }

    #[test]
    fn test_merged_with_non_object_replaces() {
        let base = ValueRef::new(json!({"a": 1}));
        let overlay = ValueRef::new(json!("replacement"));
        assert_eq!(base.merged_with(&overlay), overlay);
    }

    #[test]
    fn test_truthiness() {
        assert!(!ValueRef::new(json!(null)).is_truthy());
        assert!(!ValueRef::new(json!(false)).is_truthy());
        assert!(!ValueRef::new(json!(0)).is_truthy());
        assert!(!ValueRef::new(json!("")).is_truthy());
        assert!(ValueRef::new(json!("x")).is_truthy());
        assert!(ValueRef::new(json!({})).is_truthy());
    }

    #[test]
    fn test_serde_round_trip() {
        let value = ValueRef::new(json!({"accessPoints": ["EAN-1"]}));
        let serialized = serde_json::to_string(&value).unwrap();
        let deserialized: ValueRef = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized, value);
    }
}
