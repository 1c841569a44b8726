//! Error types of the HTTP session store client.

use reqwest::StatusCode;
use thiserror::Error;

use crate::dao::{models::Table, storage::StorageError};

/// Convenient result alias returning [`HttpDaoError`] failures.
pub type HttpResult<T> = Result<T, HttpDaoError>;

/// Failures that can occur while talking to the store server.
#[derive(Debug, Error)]
pub enum HttpDaoError {
    /// Required environment variable is missing.
    #[error("missing store environment variable `{var}`")]
    MissingEnvVar { var: &'static str },
    /// Building the HTTP client failed (invalid TLS setup, etc).
    #[error("failed to build store client")]
    ClientBuilder {
        #[source]
        source: reqwest::Error,
    },
    /// A request could not be sent.
    #[error("failed to send store request to `{path}`")]
    RequestSend {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    /// The server answered with an unexpected status code.
    #[error("unexpected store response status {status} for `{path}`")]
    RequestStatus { path: String, status: StatusCode },
    /// Response payload could not be parsed into JSON.
    #[error("failed to decode store response for `{path}`")]
    DecodeResponse {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    /// The filter could not be encoded as a query parameter.
    #[error("failed to encode filter for `{table}`")]
    EncodeFilter {
        table: Table,
        #[source]
        source: serde_json::Error,
    },
}

impl From<HttpDaoError> for StorageError {
    fn from(err: HttpDaoError) -> Self {
        StorageError::unavailable(err.to_string(), err)
    }
}
