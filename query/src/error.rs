use thiserror::Error;

use crate::FetchError;

/// Errors surfaced by the query client.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    /// The key could not be normalized. Keys must serialize to a JSON array.
    #[error("invalid query key: {0}")]
    InvalidKey(String),

    /// The cached entry for this key holds a different value type than requested.
    #[error("query {key} holds a different value type than requested")]
    TypeMismatch {
        /// Normalized key of the entry.
        key: String,
    },

    /// A value could not be converted to or from its serialized form.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// The underlying fetch failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

impl From<serde_json::Error> for QueryError {
    fn from(error: serde_json::Error) -> Self {
        QueryError::Serialization(error.to_string())
    }
}
