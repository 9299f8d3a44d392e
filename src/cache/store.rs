//! Persistent artifact cache over an [`ObjectStore`].
//!
//! Reads that fail are reported as misses and writes that fail are logged and
//! counted; neither ever reaches the caller of a render.

use std::{sync::Arc, time::Instant};

use bytes::Bytes;
use metrics::counter;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::application::repos::{ObjectStore, RepoError};
use crate::domain::documents::DocumentId;

use super::keys::{self, CacheKey};

const METRIC_CACHE_WRITE_FAILED: &str = "stave_cache_write_failed_total";

/// Immutable bytes stored under one cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedArtifact {
    pub bytes: Bytes,
    pub content_type: String,
}

#[derive(Debug, Error)]
#[error("failed to write cache entry `{key}`: {source}")]
pub struct CacheWriteError {
    pub key: String,
    #[source]
    pub source: RepoError,
}

#[derive(Clone)]
pub struct CacheStore {
    objects: Arc<dyn ObjectStore>,
}

impl CacheStore {
    pub fn new(objects: Arc<dyn ObjectStore>) -> Self {
        Self { objects }
    }

    pub async fn get(&self, key: &CacheKey) -> Option<CachedArtifact> {
        let path = key.path();
        match self.objects.get(&path).await {
            Ok(Some(object)) => Some(CachedArtifact {
                bytes: object.bytes,
                content_type: object.content_type,
            }),
            Ok(None) => None,
            Err(err) => {
                warn!(
                    target = "cache::store",
                    op = "get",
                    key = %path,
                    result = "read_failed",
                    error = %err,
                    "Cache read failed; treating as miss"
                );
                None
            }
        }
    }

    /// Write an artifact. Failures are absorbed; the return value only says
    /// whether the write landed.
    pub async fn put(&self, key: &CacheKey, bytes: Bytes, content_type: &str) -> bool {
        let started = Instant::now();
        match self.try_put(key, bytes, content_type).await {
            Ok(()) => {
                debug!(
                    target = "cache::store",
                    op = "put",
                    key = %key,
                    result = "ok",
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Cache entry written"
                );
                true
            }
            Err(err) => {
                counter!(METRIC_CACHE_WRITE_FAILED).increment(1);
                warn!(
                    target = "cache::store",
                    op = "put",
                    key = %err.key,
                    result = "write_failed",
                    error = %err.source,
                    "Cache write failed"
                );
                false
            }
        }
    }

    /// Spawn the write so the caller never waits on storage.
    pub fn put_detached(
        &self,
        key: CacheKey,
        bytes: Bytes,
        content_type: String,
    ) -> JoinHandle<bool> {
        let store = self.clone();
        tokio::spawn(async move { store.put(&key, bytes, &content_type).await })
    }

    async fn try_put(
        &self,
        key: &CacheKey,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<(), CacheWriteError> {
        let path = key.path();
        self.objects
            .put(&path, bytes, content_type)
            .await
            .map_err(|source| CacheWriteError { key: path, source })
    }

    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, RepoError> {
        self.objects.list(prefix).await
    }

    pub async fn remove_prefix(&self, prefix: &str) -> Result<usize, RepoError> {
        self.objects.delete_prefix(prefix).await
    }

    /// Page numbers with a canonical rendition in any format, ascending.
    pub async fn cached_pages(&self, document: &DocumentId) -> Result<Vec<u32>, RepoError> {
        let mut pages: Vec<u32> = self
            .list(&keys::page_prefix(document))
            .await?
            .iter()
            .filter_map(|path| keys::parse_page_number(path))
            .collect();
        pages.sort_unstable();
        pages.dedup();
        Ok(pages)
    }

    pub async fn has_thumbnail(&self, document: &DocumentId) -> Result<bool, RepoError> {
        Ok(!self.list(&keys::thumbnail_prefix(document)).await?.is_empty())
    }

    /// Delete every canonical, variant and thumbnail artifact of a document.
    pub async fn remove_document(&self, document: &DocumentId) -> Result<usize, RepoError> {
        let mut removed = 0;
        for prefix in [
            keys::page_prefix(document),
            keys::variant_prefix(document),
            keys::thumbnail_prefix(document),
        ] {
            removed += self.remove_prefix(&prefix).await?;
        }
        Ok(removed)
    }
}
