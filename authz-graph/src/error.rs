use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum AuthzError {
    #[error("Exceeded max # of candidates ({limit}) in BFS without finding path: {seen}")]
    SearchBoundExceeded { limit: usize, seen: usize },

    #[error("Inconsistency detected for edge type {edge_type_id} on edge {edge_id}. Repeat the call")]
    CacheInconsistency { edge_type_id: Uuid, edge_id: Uuid },

    #[error("Attribute check timed out after {0:?}")]
    Timeout(Duration),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid edge: {0}")]
    InvalidEdge(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Remote evaluator error: {0}")]
    RemoteEvaluator(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AuthzError {
    /// True for failures that are expected to clear on their own, so the
    /// caller can repeat the call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CacheInconsistency { .. } | Self::Timeout(_))
    }
}

impl From<sqlx::Error> for AuthzError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".to_string()),
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<redis::RedisError> for AuthzError {
    fn from(err: redis::RedisError) -> Self {
        Self::Cache(err.to_string())
    }
}

impl From<reqwest::Error> for AuthzError {
    fn from(err: reqwest::Error) -> Self {
        Self::RemoteEvaluator(err.to_string())
    }
}

impl From<config::ConfigError> for AuthzError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AuthzError>;
