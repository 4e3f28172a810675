use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use tracing::debug;

use super::{DocumentRecord, DocumentStore, NewDocument, StorageStats};
use crate::cli::config::StorageSettings;
use crate::error::Result;

/// PostgreSQL implementation of the document store.
pub struct PostgresDocumentStore {
    pool: Pool<Postgres>,
    schema: String,
}

#[derive(sqlx::FromRow)]
struct DocumentRow {
    id: i64,
    url: String,
    site_id: String,
    content_hash: String,
    clean_content: String,
    title: Option<String>,
    mimetype: Option<String>,
    version: i32,
    indexed: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<DocumentRow> for DocumentRecord {
    fn from(row: DocumentRow) -> Self {
        DocumentRecord {
            id: row.id,
            url: row.url,
            site_id: row.site_id,
            content_hash: row.content_hash,
            clean_content: row.clean_content,
            title: row.title,
            mimetype: row.mimetype,
            version: row.version.max(0) as u32,
            indexed: row.indexed,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

impl PostgresDocumentStore {
    pub async fn new(settings: &StorageSettings) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&settings.connection_string)
            .await?;

        let store = Self {
            pool,
            schema: settings.schema_name.clone(),
        };
        store.ensure_schema().await?;

        debug!("Connected to PostgreSQL document store");
        Ok(store)
    }

    fn table(&self) -> String {
        format!("{}.documents", self.schema)
    }

    async fn ensure_schema(&self) -> Result<()> {
        let create_schema = format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema);
        sqlx::query(&create_schema).execute(&self.pool).await?;

        let create_table = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id BIGSERIAL PRIMARY KEY,
                url TEXT NOT NULL,
                site_id TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                clean_content TEXT NOT NULL,
                title TEXT,
                mimetype TEXT,
                version INTEGER NOT NULL,
                indexed BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (url, version)
            )",
            self.table()
        );
        sqlx::query(&create_table).execute(&self.pool).await?;

        let create_index = format!(
            "CREATE INDEX IF NOT EXISTS documents_content_hash_idx
             ON {} (content_hash)",
            self.table()
        );
        sqlx::query(&create_index).execute(&self.pool).await?;

        Ok(())
    }
}

#[async_trait]
impl DocumentStore for PostgresDocumentStore {
    async fn find_by_url(&self, url: &str) -> Result<Option<DocumentRecord>> {
        let query = format!(
            "SELECT id, url, site_id, content_hash, clean_content, title, mimetype,
                    version, indexed, created_at, updated_at
             FROM {} WHERE url = $1
             ORDER BY version DESC LIMIT 1",
            self.table()
        );
        let row = sqlx::query_as::<_, DocumentRow>(&query)
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(DocumentRecord::from))
    }

    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<DocumentRecord>> {
        let query = format!(
            "SELECT id, url, site_id, content_hash, clean_content, title, mimetype,
                    version, indexed, created_at, updated_at
             FROM {} WHERE content_hash = $1
             LIMIT 1",
            self.table()
        );
        let row = sqlx::query_as::<_, DocumentRow>(&query)
            .bind(content_hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(DocumentRecord::from))
    }

    async fn insert_version(&self, doc: NewDocument) -> Result<DocumentRecord> {
        let query = format!(
            "INSERT INTO {} (url, site_id, content_hash, clean_content, title, mimetype, version)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING id, url, site_id, content_hash, clean_content, title, mimetype,
                       version, indexed, created_at, updated_at",
            self.table()
        );
        let row = sqlx::query_as::<_, DocumentRow>(&query)
            .bind(&doc.url)
            .bind(&doc.site_id)
            .bind(&doc.content_hash)
            .bind(&doc.clean_content)
            .bind(&doc.title)
            .bind(&doc.mimetype)
            .bind(doc.version as i32)
            .fetch_one(&self.pool)
            .await?;

        debug!(url = %row.url, version = row.version, "document revision stored");
        Ok(DocumentRecord::from(row))
    }

    async fn delete_by_url(&self, url: &str) -> Result<bool> {
        let query = format!("DELETE FROM {} WHERE url = $1", self.table());
        let result = sqlx::query(&query).bind(url).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_indexed(&self, url: &str, indexed: bool) -> Result<bool> {
        let query = format!(
            "UPDATE {table} SET indexed = $2, updated_at = NOW()
             WHERE url = $1
               AND version = (SELECT MAX(version) FROM {table} WHERE url = $1)",
            table = self.table()
        );
        let result = sqlx::query(&query)
            .bind(url)
            .bind(indexed)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn stats(&self) -> Result<StorageStats> {
        let query = format!(
            "SELECT COUNT(*) AS documents,
                    COUNT(DISTINCT url) AS distinct_urls,
                    COUNT(*) FILTER (WHERE NOT indexed) AS pending_index
             FROM {}",
            self.table()
        );
        let row: (i64, i64, i64) = sqlx::query_as(&query).fetch_one(&self.pool).await?;
        Ok(StorageStats {
            documents: row.0.max(0) as u64,
            distinct_urls: row.1.max(0) as u64,
            pending_index: row.2.max(0) as u64,
        })
    }
}
