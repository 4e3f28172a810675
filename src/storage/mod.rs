pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::cli::config::StorageSettings;
use crate::error::{PipelineError, Result};

// Re-export common types
pub use memory::MemoryDocumentStore;
pub use postgres::PostgresDocumentStore;

/// One stored revision of a page. Rows are append-only: a content change
/// appends a new row with an incremented version rather than rewriting the
/// old one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: i64,
    pub url: String,
    pub site_id: String,
    pub content_hash: String,
    pub clean_content: String,
    pub title: Option<String>,
    pub mimetype: Option<String>,
    pub version: u32,
    pub indexed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields of a new document revision, written by the persister.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub url: String,
    pub site_id: String,
    pub content_hash: String,
    pub clean_content: String,
    pub title: Option<String>,
    pub mimetype: Option<String>,
    pub version: u32,
}

/// Storage statistics for the admin read surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageStats {
    pub documents: u64,
    pub distinct_urls: u64,
    pub pending_index: u64,
}

/// Relational persistence consulted by the persister and marked by the
/// indexer. Keyed by `(url, content_hash)`.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Latest revision stored for this URL, if any.
    async fn find_by_url(&self, url: &str) -> Result<Option<DocumentRecord>>;

    /// Any revision carrying this content hash.
    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<DocumentRecord>>;

    /// Append a new revision row.
    async fn insert_version(&self, doc: NewDocument) -> Result<DocumentRecord>;

    /// Remove every revision of a URL. Returns whether anything was removed.
    async fn delete_by_url(&self, url: &str) -> Result<bool>;

    /// Flag the latest revision of a URL as indexed (or not).
    async fn mark_indexed(&self, url: &str, indexed: bool) -> Result<bool>;

    async fn stats(&self) -> Result<StorageStats>;
}

/// Factory for creating a DocumentStore implementation
pub struct DocumentStoreFactory;

impl DocumentStoreFactory {
    pub async fn create(settings: &StorageSettings) -> Result<Arc<dyn DocumentStore>> {
        match settings.storage_type.as_str() {
            "postgres" | "postgresql" => {
                let store = PostgresDocumentStore::new(settings).await?;
                Ok(Arc::new(store))
            }
            "memory" => Ok(Arc::new(MemoryDocumentStore::new())),
            other => Err(PipelineError::Config(format!(
                "unsupported document store type: {other}"
            ))),
        }
    }
}
