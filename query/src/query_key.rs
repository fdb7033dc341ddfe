use std::{hash::Hash, rc::Rc};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Number, Value};

use crate::QueryError;

/// Identity of a query: an ordered tuple of JSON values.
///
/// Two keys are equal iff their normalized forms are equal. Normalization sorts object
/// fields, so `{"a":1,"b":2}` and `{"b":2,"a":1}` produce the same key, writes integral
/// numbers as integers, so `1.0` and `1` do too, and keeps JSON types apart, so `1` and
/// `"1"` do not.
///
/// ```
/// use query_core::{query_key, QueryKey};
///
/// let a = query_key!["user", { "a": 1, "b": 2 }];
/// let b = QueryKey::new(&("user", serde_json::json!({ "b": 2, "a": 1 }))).unwrap();
/// assert_eq!(a, b);
/// assert_ne!(query_key!["user", 1], query_key!["user", "1"]);
/// ```
#[derive(Clone)]
pub struct QueryKey {
    hash: Rc<str>,
    parts: Rc<[Value]>,
}

impl QueryKey {
    /// Normalizes any value that serializes to a JSON array.
    ///
    /// Tuples, arrays, slices and `Vec`s all qualify. Anything else is rejected with
    /// [`QueryError::InvalidKey`].
    pub fn new<T: Serialize + ?Sized>(key: &T) -> Result<Self, QueryError> {
        let value =
            serde_json::to_value(key).map_err(|error| QueryError::InvalidKey(error.to_string()))?;
        match value {
            Value::Array(parts) => Ok(Self::from_parts(parts)),
            other => Err(QueryError::InvalidKey(format!(
                "query keys must serialize to an array, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Builds a key from its parts.
    pub fn from_parts(parts: Vec<Value>) -> Self {
        let parts: Rc<[Value]> = parts.into_iter().map(canonicalize).collect();
        // Serializing plain JSON values cannot fail.
        let hash = serde_json::to_string(&*parts).unwrap_or_default();
        Self {
            hash: hash.into(),
            parts,
        }
    }

    #[doc(hidden)]
    pub fn __from_json_array(value: Value) -> Self {
        match value {
            Value::Array(parts) => Self::from_parts(parts),
            other => Self::from_parts(vec![other]),
        }
    }

    /// The normalized string form used as the cache's map key.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// The normalized parts.
    pub fn parts(&self) -> &[Value] {
        &self.parts
    }

    /// Whether `prefix` is a leading sub-tuple of this key.
    ///
    /// Matching is structural: `["posts"]` is a prefix of `["posts", "detail", 1]` but not of
    /// `["postsArchive"]`. Parts are compared as whole values.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        prefix.parts.len() <= self.parts.len()
            && prefix
                .parts
                .iter()
                .zip(self.parts.iter())
                .all(|(expected, actual)| expected == actual)
    }
}

/// Normalizes a key into its canonical string form.
pub fn normalize<T: Serialize + ?Sized>(key: &T) -> Result<String, QueryError> {
    QueryKey::new(key).map(|key| key.hash.to_string())
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Array(values) => Value::Array(values.into_iter().map(canonicalize).collect()),
        Value::Object(entries) => {
            let mut entries: Vec<(String, Value)> = entries.into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, canonicalize(value)))
                    .collect::<Map<String, Value>>(),
            )
        }
        Value::Number(number) => Value::Number(canonical_number(number)),
        other => other,
    }
}

// Integral floats are written as integers, so `1.0` and `1` are the same key part.
fn canonical_number(number: Number) -> Number {
    match number.as_f64() {
        Some(float) if number.is_f64() && float.fract() == 0.0 => {
            if float >= i64::MIN as f64 && float < i64::MAX as f64 {
                Number::from(float as i64)
            } else if float >= 0.0 && float < u64::MAX as f64 {
                Number::from(float as u64)
            } else {
                number
            }
        }
        _ => number,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state)
    }
}

impl std::fmt::Display for QueryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.hash)
    }
}

impl std::fmt::Debug for QueryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("QueryKey").field(&self.hash).finish()
    }
}

impl Serialize for QueryKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.parts.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for QueryKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Vec::<Value>::deserialize(deserializer).map(QueryKey::from_parts)
    }
}

/// Builds a [`QueryKey`] from JSON-like parts.
///
/// ```
/// use query_core::query_key;
///
/// let key = query_key!["posts", { "category": "tech" }, 2];
/// assert_eq!(key.hash(), r#"["posts",{"category":"tech"},2]"#);
/// ```
#[macro_export]
macro_rules! query_key {
    ($($part:tt)*) => {
        $crate::QueryKey::__from_json_array($crate::__private::serde_json::json!([$($part)*]))
    };
}

/// Selects cache entries by key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryFilter {
    /// Key or key prefix to match. `None` matches every entry.
    pub key: Option<QueryKey>,
    /// Require the whole key to match instead of a prefix.
    pub exact: bool,
}

impl QueryFilter {
    /// Matches every entry.
    pub fn all() -> Self {
        Self::default()
    }

    /// Matches entries whose key starts with `key`.
    pub fn prefix(key: QueryKey) -> Self {
        Self {
            key: Some(key),
            exact: false,
        }
    }

    /// Matches the entry with exactly this key.
    pub fn exact(key: QueryKey) -> Self {
        Self {
            key: Some(key),
            exact: true,
        }
    }

    /// Whether `key` is selected by this filter.
    pub fn matches(&self, key: &QueryKey) -> bool {
        match &self.key {
            None => true,
            Some(filter) if self.exact => filter == key,
            Some(filter) => key.starts_with(filter),
        }
    }
}

impl From<QueryKey> for QueryFilter {
    fn from(key: QueryKey) -> Self {
        QueryFilter::prefix(key)
    }
}
