use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Declared worker metadata, and the requirement set a request places on it.
///
/// Keys are matched exactly. A requirement is met when the worker declares the
/// same value, or declares an array containing it (`"models": ["a", "b"]`
/// satisfies `"models": "a"`).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Capabilities(BTreeMap<String, Value>);

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn satisfies(&self, requirements: &Capabilities) -> bool {
        requirements.iter().all(|(key, wanted)| match self.0.get(key) {
            Some(Value::Array(items)) if !wanted.is_array() => items.contains(wanted),
            Some(declared) => declared == wanted,
            None => false,
        })
    }
}

impl From<BTreeMap<String, Value>> for Capabilities {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Capabilities {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        f.write_str("{")?;
        for (key, value) in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            write!(f, "{key}={value}")?;
        }
        f.write_str("}")
    }
}

/// Accepts an object or `null`; extensions send `"metadata": null` when they
/// have nothing to declare.
impl<'de> Deserialize<'de> for Capabilities {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let map = Option::<BTreeMap<String, Value>>::deserialize(deserializer)?;
        Ok(Self(map.unwrap_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_requirements_are_always_met() {
        let declared = Capabilities::new().with("model", "a");
        assert!(declared.satisfies(&Capabilities::new()));
        assert!(Capabilities::new().satisfies(&Capabilities::new()));
    }

    #[test]
    fn scalar_requirement_needs_equal_value() {
        let declared = Capabilities::new().with("model", "a").with("version", 3);
        assert!(declared.satisfies(&Capabilities::new().with("model", "a")));
        assert!(!declared.satisfies(&Capabilities::new().with("model", "b")));
        assert!(!declared.satisfies(&Capabilities::new().with("region", "eu")));
        assert!(declared.satisfies(&Capabilities::new().with("version", 3)));
    }

    #[test]
    fn array_capability_matches_any_member() {
        let declared = Capabilities::new().with("requestTypes", json!(["image", "text"]));
        assert!(declared.satisfies(&Capabilities::new().with("requestTypes", "text")));
        assert!(!declared.satisfies(&Capabilities::new().with("requestTypes", "video")));
        assert!(declared.satisfies(
            &Capabilities::new().with("requestTypes", json!(["image", "text"]))
        ));
    }

    #[test]
    fn null_metadata_deserializes_as_empty() {
        let caps: Capabilities = serde_json::from_str("null").expect("null caps");
        assert!(caps.is_empty());
        let caps: Capabilities =
            serde_json::from_str(r#"{"model":"a","version":"1.2"}"#).expect("object caps");
        assert_eq!(caps.len(), 2);
        assert_eq!(caps.to_string(), r#"{model="a",version="1.2"}"#);
    }
}
