//! The contract between the cache and whatever performs the actual requests.

use std::{future::Future, rc::Rc};

use async_trait::async_trait;
use futures::{future::LocalBoxFuture, FutureExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::QueryError;

/// The uniform fetch closure the cache executes for a query.
pub type QueryFn<V> = Rc<dyn Fn() -> LocalBoxFuture<'static, Result<V, FetchError>>>;

/// Wraps an async closure into a [`QueryFn`].
///
/// ```
/// use query_core::{query_fn, FetchError, QueryFn};
///
/// let fetch_answer: QueryFn<u32> = query_fn(|| async { Ok::<_, FetchError>(42) });
/// ```
pub fn query_fn<V, F, Fu>(fetcher: F) -> QueryFn<V>
where
    F: Fn() -> Fu + 'static,
    Fu: Future<Output = Result<V, FetchError>> + 'static,
{
    Rc::new(move || fetcher().boxed_local())
}

/// Typed error produced by the transport layer.
///
/// The cache stores it verbatim in the query state and never retries on its own.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct FetchError {
    /// Human readable description.
    pub message: String,
    /// Machine readable classification, e.g. [`FetchError::NETWORK_ERROR`].
    pub code: String,
    /// The response, when one was received.
    pub response: Option<ErrorResponse>,
}

/// The part of a response attached to a [`FetchError`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub data: serde_json::Value,
}

impl FetchError {
    /// No response was received.
    pub const NETWORK_ERROR: &'static str = "NETWORK_ERROR";
    /// A response was received but did not have the expected shape.
    pub const VALIDATION_ERROR: &'static str = "VALIDATION_ERROR";
    /// The request was cancelled through the query client.
    pub const CANCELLED: &'static str = "CANCELLED";

    /// Creates an error with the given code.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: code.into(),
            response: None,
        }
    }

    /// The request failed before a response was received.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(Self::NETWORK_ERROR, message)
    }

    /// The response failed validation.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(Self::VALIDATION_ERROR, message)
    }

    pub(crate) fn cancelled() -> Self {
        Self::new(Self::CANCELLED, "query was cancelled")
    }

    /// Attaches the response that caused this error.
    pub fn with_response(self, status: u16, data: serde_json::Value) -> Self {
        Self {
            response: Some(ErrorResponse { status, data }),
            ..self
        }
    }

    /// Whether this error comes from [`QueryClient::cancel_query`](crate::QueryClient::cancel_query).
    pub fn is_cancelled(&self) -> bool {
        self.code == Self::CANCELLED
    }
}

/// Request options handed to a [`Fetcher`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestConfig {
    /// Query parameters.
    pub params: serde_json::Value,
}

/// A successful response from a [`Fetcher`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchResponse {
    /// HTTP status code.
    pub status: u16,
    /// Decoded body.
    pub data: serde_json::Value,
}

/// Transport used by URL based queries.
#[async_trait(?Send)]
pub trait Fetcher {
    /// Performs a GET request.
    async fn get(&self, url: &str, config: &RequestConfig) -> Result<FetchResponse, FetchError>;
}

/// Function form of a [`QueryDefinition`].
pub type ParamsFn<P, V> = Rc<dyn Fn(P, Rc<dyn Fetcher>) -> LocalBoxFuture<'static, Result<V, FetchError>>>;

/// How a query obtains its data.
///
/// Both variants are resolved once into a [`QueryFn`], so the cache never needs to know
/// which one produced the closure.
pub enum QueryDefinition<P, V> {
    /// GET `url` with the parameters as query string and deserialize the body into `V`.
    Url {
        /// Request target.
        url: String,
    },
    /// Call a function with the parameters and the fetcher.
    Function(ParamsFn<P, V>),
}

impl<P, V> Clone for QueryDefinition<P, V> {
    fn clone(&self) -> Self {
        match self {
            QueryDefinition::Url { url } => QueryDefinition::Url { url: url.clone() },
            QueryDefinition::Function(function) => QueryDefinition::Function(function.clone()),
        }
    }
}

impl<P, V> std::fmt::Debug for QueryDefinition<P, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryDefinition::Url { url } => f.debug_struct("Url").field("url", url).finish(),
            QueryDefinition::Function(_) => f.debug_tuple("Function").field(&"...").finish(),
        }
    }
}

impl<P, V> QueryDefinition<P, V>
where
    P: Serialize + 'static,
    V: DeserializeOwned + 'static,
{
    /// A URL based query.
    pub fn url(url: impl Into<String>) -> Self {
        QueryDefinition::Url { url: url.into() }
    }

    /// A function based query.
    pub fn function<F, Fu>(function: F) -> Self
    where
        F: Fn(P, Rc<dyn Fetcher>) -> Fu + 'static,
        Fu: Future<Output = Result<V, FetchError>> + 'static,
    {
        QueryDefinition::Function(Rc::new(move |params, fetcher| {
            function(params, fetcher).boxed_local()
        }))
    }

    /// Binds the parameters and the fetcher, producing the closure the cache executes.
    ///
    /// Fails if the parameters cannot be serialized.
    pub fn resolve(&self, params: P, fetcher: Rc<dyn Fetcher>) -> Result<QueryFn<V>, QueryError>
    where
        P: Clone,
    {
        match self {
            QueryDefinition::Url { url } => {
                let url: Rc<str> = url.as_str().into();
                let config = Rc::new(RequestConfig {
                    params: serde_json::to_value(&params)?,
                });
                Ok(Rc::new(move || {
                    let url = url.clone();
                    let config = config.clone();
                    let fetcher = fetcher.clone();
                    async move {
                        let response = fetcher.get(&url, &config).await?;
                        let status = response.status;
                        serde_json::from_value::<V>(response.data.clone()).map_err(|error| {
                            FetchError::validation(error.to_string())
                                .with_response(status, response.data)
                        })
                    }
                    .boxed_local()
                }))
            }
            QueryDefinition::Function(function) => {
                let function = function.clone();
                Ok(Rc::new(move || function(params.clone(), fetcher.clone())))
            }
        }
    }
}
