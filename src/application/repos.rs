//! Ports to the collaborators the rendering pipeline depends on.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::application::rate_limit::RateLimitRecord;
use crate::domain::documents::{Document, DocumentId};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("storage timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }
}

/// Looks up documents owned by the ingestion side of the platform.
#[async_trait]
pub trait DocumentResolver: Send + Sync {
    /// Returns `None` for unknown documents. Callers decide what an unprocessed
    /// document means for them.
    async fn resolve(&self, id: &DocumentId) -> Result<Option<Document>, RepoError>;
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub bytes: Bytes,
    pub content_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub content_type: String,
}

/// Byte-level object storage addressed by slash-separated keys.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<StoredObject>, RepoError>;

    async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> Result<(), RepoError>;

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, RepoError>;

    /// Keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, RepoError>;

    /// Remove every key starting with `prefix` and return how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, RepoError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: i64,
}

/// Shared counter state with per-key compare-and-swap and TTL expiry.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Current live record for `key`; expired records read as absent.
    async fn get(&self, key: &str) -> Result<Option<Versioned<RateLimitRecord>>, RepoError>;

    /// Store `record` only if the live version still equals `expected`
    /// (`None` meaning "no live record"). Returns whether the write happened.
    async fn compare_and_put(
        &self,
        key: &str,
        expected: Option<i64>,
        record: &RateLimitRecord,
        ttl: Duration,
    ) -> Result<bool, RepoError>;
}
