//! Error types for bucket streaming

use thiserror::Error;

use crate::streaming::bucket::{BucketAddress, BucketState};

/// Failure reported by the network boundary
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("HTTP status {0}")]
    Status(u16),

    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),
}

impl TransportError {
    /// The data store answers 403 once a token has expired
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, TransportError::Status(403))
    }
}

/// Main error type for the streaming cache
#[derive(Debug, Error)]
pub enum Error {
    #[error("Fetch error: {0}")]
    Fetch(#[from] TransportError),

    #[error("Auth token expired and refresh did not help")]
    AuthTokenExpired,

    #[error("Malformed bucket data: expected {expected} bytes, got {actual}")]
    MalformedBucketData { expected: usize, actual: usize },

    #[error("Permanent push failure: {0}")]
    PermanentPushFailure(String),

    #[error("Bucket {0} is not loaded")]
    BucketNotLoaded(BucketAddress),

    #[error("Bucket {address}: cannot {action} in state {state:?}")]
    InvalidTransition {
        address: BucketAddress,
        state: BucketState,
        action: &'static str,
    },

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
