//! Source documents as seen by the rendering pipeline.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use super::error::DomainError;

const MAX_DOCUMENT_ID_LEN: usize = 128;

/// Opaque document identifier.
///
/// Identifiers end up inside cache keys and storage paths, so only ASCII
/// alphanumerics, `-` and `_` are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation("document id must not be empty"));
        }
        if trimmed.len() > MAX_DOCUMENT_ID_LEN {
            return Err(DomainError::validation(format!(
                "document id exceeds {MAX_DOCUMENT_ID_LEN} characters"
            )));
        }
        if !trimmed
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
        {
            return Err(DomainError::validation(
                "document id may only contain letters, digits, `-` and `_`",
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Completed,
}

impl ProcessingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Completed => "completed",
        }
    }
}

impl FromStr for ProcessingStatus {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(ProcessingStatus::Pending),
            "completed" => Ok(ProcessingStatus::Completed),
            other => Err(DomainError::validation(format!(
                "unknown processing status `{other}`"
            ))),
        }
    }
}

/// A stored multi-page source asset. Read-only to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub id: DocumentId,
    /// Known page count; `None` when the resolver cannot tell.
    pub page_count: Option<u32>,
    pub source_key: String,
    pub status: ProcessingStatus,
}

impl Document {
    pub fn is_renderable(&self) -> bool {
        self.status == ProcessingStatus::Completed
    }

    pub fn has_page(&self, page: u32) -> bool {
        self.page_count.is_none_or(|count| page <= count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_id_accepts_slug_like_values() {
        let id = DocumentId::parse(" doc_42 ").expect("valid id");
        assert_eq!(id.as_str(), "doc_42");
        assert_eq!(id.to_string(), "doc_42");
    }

    #[test]
    fn document_id_rejects_path_characters() {
        assert!(DocumentId::parse("../etc").is_err());
        assert!(DocumentId::parse("a/b").is_err());
        assert!(DocumentId::parse("").is_err());
        assert!(DocumentId::parse(&"x".repeat(129)).is_err());
    }

    #[test]
    fn pending_documents_are_not_renderable() {
        let document = Document {
            id: DocumentId::parse("doc").expect("id"),
            page_count: Some(3),
            source_key: "sources/doc.pdf".to_string(),
            status: ProcessingStatus::Pending,
        };
        assert!(!document.is_renderable());
        assert!(document.has_page(3));
        assert!(!document.has_page(4));
    }

    #[test]
    fn processing_status_parses_case_insensitively() {
        assert_eq!(
            "Completed".parse::<ProcessingStatus>().expect("status"),
            ProcessingStatus::Completed
        );
        assert!("archived".parse::<ProcessingStatus>().is_err());
    }
}
