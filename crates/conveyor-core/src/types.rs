//! Payloads and the instance variable bag.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

/// An opaque JSON payload carried by task results and external events.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Payload {
    /// The inner JSON value
    pub value: Value,
}

impl Payload {
    /// Create a new payload from a JSON value
    #[inline]
    pub fn new(value: Value) -> Self {
        Self { value }
    }

    /// Create a null payload
    #[inline]
    pub fn null() -> Self {
        Self { value: Value::Null }
    }

    /// Get the inner JSON value
    #[inline]
    pub fn as_value(&self) -> &Value {
        &self.value
    }

    /// Take ownership of the inner JSON value
    #[inline]
    pub fn into_value(self) -> Value {
        self.value
    }

    /// Check if the payload is null
    #[inline]
    pub fn is_null(&self) -> bool {
        self.value.is_null()
    }

    /// Try to deserialize the payload into a concrete type
    pub fn to<T>(&self) -> Result<T, serde_json::Error>
    where
        T: DeserializeOwned,
    {
        serde_json::from_value(self.value.clone())
    }

    /// Create a payload from a serializable value
    pub fn from<T>(value: &T) -> Result<Self, serde_json::Error>
    where
        T: Serialize,
    {
        Ok(Self::new(serde_json::to_value(value)?))
    }
}

/// The variable bag of a process instance: an opaque key-value map visible
/// to guard expressions and step configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct VariableBag {
    values: Map<String, Value>,
}

impl VariableBag {
    /// Create an empty variable bag
    pub fn new() -> Self {
        Self { values: Map::new() }
    }

    /// Get a variable by name
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Set a variable, replacing any previous value
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// Merge another set of keys into the bag; later keys win
    pub fn merge(&mut self, other: Map<String, Value>) {
        for (key, value) in other {
            self.values.insert(key, value);
        }
    }

    /// Number of variables in the bag
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when the bag holds no variables
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The bag as a JSON object, for guard evaluation contexts
    pub fn as_object(&self) -> &Map<String, Value> {
        &self.values
    }
}

impl From<Map<String, Value>> for VariableBag {
    fn from(values: Map<String, Value>) -> Self {
        Self { values }
    }
}

impl From<Value> for VariableBag {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(values) => Self { values },
            _ => Self::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_roundtrip() {
        let original = Payload::new(json!({"outcome": {"approved": true, "score": 3}}));
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: Payload = serde_json::from_str(&serialized).unwrap();
        assert_eq!(original, deserialized);
    }

    #[test]
    fn test_payload_null() {
        assert!(Payload::null().is_null());
        assert!(!Payload::new(json!(0)).is_null());
    }

    #[test]
    fn test_payload_to_typed() {
        #[derive(Deserialize)]
        struct Outcome {
            approved: bool,
        }

        let payload = Payload::new(json!({"approved": true}));
        let outcome: Outcome = payload.to().unwrap();
        assert!(outcome.approved);
    }

    #[test]
    fn test_variable_bag_set_get() {
        let mut bag = VariableBag::new();
        assert!(bag.is_empty());

        bag.set("severity", json!("high"));
        bag.set("attempts", json!(2));

        assert_eq!(bag.get("severity"), Some(&json!("high")));
        assert_eq!(bag.get("missing"), None);
        assert_eq!(bag.len(), 2);
    }

    #[test]
    fn test_variable_bag_merge_overwrites() {
        let mut bag = VariableBag::from(json!({"severity": "low", "region": "eu"}));

        let mut update = Map::new();
        update.insert("severity".to_string(), json!("high"));
        update.insert("owner".to_string(), json!("risk-team"));
        bag.merge(update);

        assert_eq!(bag.get("severity"), Some(&json!("high")));
        assert_eq!(bag.get("region"), Some(&json!("eu")));
        assert_eq!(bag.get("owner"), Some(&json!("risk-team")));
    }

    #[test]
    fn test_variable_bag_from_non_object() {
        let bag = VariableBag::from(json!([1, 2, 3]));
        assert!(bag.is_empty());
    }
}
