use async_trait::async_trait;

use crate::{
    application::repos::{DocumentResolver, RepoError},
    domain::documents::{Document, DocumentId, ProcessingStatus},
};

use super::{PostgresRepositories, map_sqlx_error};

#[derive(sqlx::FromRow)]
struct DocumentRow {
    id: String,
    page_count: Option<i32>,
    source_key: String,
    status: String,
}

impl TryFrom<DocumentRow> for Document {
    type Error = RepoError;

    fn try_from(row: DocumentRow) -> Result<Self, Self::Error> {
        let id = DocumentId::parse(&row.id)
            .map_err(|err| RepoError::invalid_input(format!("stored document id: {err}")))?;
        let status = row
            .status
            .parse::<ProcessingStatus>()
            .map_err(|err| RepoError::invalid_input(err.to_string()))?;
        let page_count = row
            .page_count
            .map(u32::try_from)
            .transpose()
            .map_err(|_| RepoError::invalid_input("negative page count"))?;

        Ok(Document {
            id,
            page_count,
            source_key: row.source_key,
            status,
        })
    }
}

#[async_trait]
impl DocumentResolver for PostgresRepositories {
    async fn resolve(&self, id: &DocumentId) -> Result<Option<Document>, RepoError> {
        let row = sqlx::query_as::<_, DocumentRow>(
            r#"
            SELECT id,
                   page_count,
                   source_key,
                   status
            FROM documents
            WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        row.map(Document::try_from).transpose()
    }
}
