use std::{collections::BTreeMap, rc::Rc};

use serde::{Deserialize, Serialize};

use crate::StructuralShare;

/// A JSON document whose strings, arrays and objects are reference counted.
///
/// Cloning is cheap and [`StructuralShare`] keeps the allocations of unchanged
/// subtrees across refetches, so consumers can compare them with [`Rc::ptr_eq`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SharedJson {
    /// JSON `null`.
    #[default]
    Null,
    /// JSON boolean.
    Bool(bool),
    /// JSON number.
    Number(serde_json::Number),
    /// JSON string.
    String(Rc<str>),
    /// JSON array.
    Array(Rc<Vec<SharedJson>>),
    /// JSON object with keys in sorted order.
    Object(Rc<BTreeMap<String, SharedJson>>),
}

impl SharedJson {
    /// Looks up a field of an object.
    pub fn get(&self, key: &str) -> Option<&SharedJson> {
        self.as_object().and_then(|object| object.get(key))
    }

    /// Looks up an element of an array.
    pub fn at(&self, index: usize) -> Option<&SharedJson> {
        self.as_array().and_then(|array| array.get(index))
    }

    /// Returns the entries if this is an object.
    pub fn as_object(&self) -> Option<&Rc<BTreeMap<String, SharedJson>>> {
        match self {
            SharedJson::Object(object) => Some(object),
            _ => None,
        }
    }

    /// Returns the elements if this is an array.
    pub fn as_array(&self) -> Option<&Rc<Vec<SharedJson>>> {
        match self {
            SharedJson::Array(array) => Some(array),
            _ => None,
        }
    }

    /// Returns the string if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SharedJson::String(string) => Some(string.as_ref()),
            _ => None,
        }
    }

    /// Returns the number as an `i64` if it fits.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SharedJson::Number(number) => number.as_i64(),
            _ => None,
        }
    }

    /// Whether this is `null`.
    pub fn is_null(&self) -> bool {
        matches!(self, SharedJson::Null)
    }
}

impl StructuralShare for SharedJson {
    fn share(prev: &Self, next: Self) -> (Self, bool) {
        match (prev, next) {
            (SharedJson::Array(prev), SharedJson::Array(next)) => {
                let (shared, unchanged) = StructuralShare::share(prev, next);
                (SharedJson::Array(shared), unchanged)
            }
            (SharedJson::Object(prev), SharedJson::Object(next)) => {
                let (shared, unchanged) = StructuralShare::share(prev, next);
                (SharedJson::Object(shared), unchanged)
            }
            (prev, next) if *prev == next => (prev.clone(), true),
            (_, next) => (next, false),
        }
    }
}

impl From<serde_json::Value> for SharedJson {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => SharedJson::Null,
            serde_json::Value::Bool(value) => SharedJson::Bool(value),
            serde_json::Value::Number(value) => SharedJson::Number(value),
            serde_json::Value::String(value) => SharedJson::String(value.into()),
            serde_json::Value::Array(values) => {
                SharedJson::Array(Rc::new(values.into_iter().map(SharedJson::from).collect()))
            }
            serde_json::Value::Object(entries) => SharedJson::Object(Rc::new(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, SharedJson::from(value)))
                    .collect(),
            )),
        }
    }
}

impl From<&SharedJson> for serde_json::Value {
    fn from(value: &SharedJson) -> Self {
        match value {
            SharedJson::Null => serde_json::Value::Null,
            SharedJson::Bool(value) => serde_json::Value::Bool(*value),
            SharedJson::Number(value) => serde_json::Value::Number(value.clone()),
            SharedJson::String(value) => serde_json::Value::String(value.to_string()),
            SharedJson::Array(values) => {
                serde_json::Value::Array(values.iter().map(serde_json::Value::from).collect())
            }
            SharedJson::Object(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), serde_json::Value::from(value)))
                    .collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::replace_equal_deep;

    #[test]
    fn partial_reuse_of_objects() {
        let prev = SharedJson::from(json!({ "a": { "x": 1 }, "b": { "y": 2 } }));
        let next = SharedJson::from(json!({ "a": { "x": 1 }, "b": { "y": 3 } }));

        let result = replace_equal_deep(&prev, next.clone());

        assert_eq!(result, next);
        let (Some(SharedJson::Object(result_a)), Some(SharedJson::Object(prev_a))) =
            (result.get("a"), prev.get("a"))
        else {
            panic!("expected objects");
        };
        assert!(Rc::ptr_eq(result_a, prev_a));

        let (Some(SharedJson::Object(result_b)), Some(SharedJson::Object(prev_b))) =
            (result.get("b"), prev.get("b"))
        else {
            panic!("expected objects");
        };
        assert!(!Rc::ptr_eq(result_b, prev_b));
        assert!(!Rc::ptr_eq(result.as_object().unwrap(), prev.as_object().unwrap()));
    }

    #[test]
    fn equal_documents_keep_previous_reference() {
        let prev = SharedJson::from(json!([{ "id": 1, "tags": ["a", "b"] }, null, true]));
        let next = SharedJson::from(json!([{ "id": 1, "tags": ["a", "b"] }, null, true]));

        let result = replace_equal_deep(&prev, next);
        assert!(Rc::ptr_eq(result.as_array().unwrap(), prev.as_array().unwrap()));
    }

    #[test]
    fn type_change_takes_next() {
        let prev = SharedJson::from(json!({ "a": [1, 2] }));
        let next = SharedJson::from(json!({ "a": "1,2" }));

        let result = replace_equal_deep(&prev, next.clone());
        assert_eq!(result, next);
        assert_eq!(result.get("a").and_then(SharedJson::as_str), Some("1,2"));
    }

    #[test]
    fn json_conversion_is_lossless() {
        let source = json!({ "n": 1.5, "s": "x", "list": [1, null, false], "nested": { "k": -3 } });
        let shared = SharedJson::from(source.clone());
        assert_eq!(serde_json::Value::from(&shared), source);

        let encoded = serde_json::to_value(&shared).unwrap();
        assert_eq!(encoded, source);
        let decoded: SharedJson = serde_json::from_value(source).unwrap();
        assert_eq!(decoded, shared);
    }
}
