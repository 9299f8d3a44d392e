//! Document resolution straight from object storage.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    application::repos::{DocumentResolver, ObjectStore, RepoError},
    domain::documents::{Document, DocumentId, ProcessingStatus},
};

pub const SOURCES_PREFIX: &str = "sources";

pub fn source_key(id: &DocumentId) -> String {
    format!("{SOURCES_PREFIX}/{id}.pdf")
}

/// Treats every `sources/{id}.pdf` object as a processed document of unknown
/// length. Used when no database is configured.
#[derive(Clone)]
pub struct StorageDocumentResolver {
    objects: Arc<dyn ObjectStore>,
}

impl StorageDocumentResolver {
    pub fn new(objects: Arc<dyn ObjectStore>) -> Self {
        Self { objects }
    }
}

#[async_trait]
impl DocumentResolver for StorageDocumentResolver {
    async fn resolve(&self, id: &DocumentId) -> Result<Option<Document>, RepoError> {
        let key = source_key(id);
        Ok(self.objects.head(&key).await?.map(|_| Document {
            id: id.clone(),
            page_count: None,
            source_key: key,
            status: ProcessingStatus::Completed,
        }))
    }
}
