use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use super::{DocumentRecord, DocumentStore, NewDocument, StorageStats};
use crate::error::Result;

/// In-process document store used by tests and single-process runs.
pub struct MemoryDocumentStore {
    rows: Mutex<Vec<DocumentRecord>>,
    next_id: AtomicI64,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        MemoryDocumentStore {
            rows: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
        }
    }
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn find_by_url(&self, url: &str) -> Result<Option<DocumentRecord>> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .iter()
            .filter(|row| row.url == url)
            .max_by_key(|row| row.version)
            .cloned())
    }

    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<DocumentRecord>> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .iter()
            .find(|row| row.content_hash == content_hash)
            .cloned())
    }

    async fn insert_version(&self, doc: NewDocument) -> Result<DocumentRecord> {
        let now = Utc::now();
        let record = DocumentRecord {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            url: doc.url,
            site_id: doc.site_id,
            content_hash: doc.content_hash,
            clean_content: doc.clean_content,
            title: doc.title,
            mimetype: doc.mimetype,
            version: doc.version,
            indexed: false,
            created_at: now,
            updated_at: now,
        };
        self.rows.lock().unwrap().push(record.clone());
        Ok(record)
    }

    async fn delete_by_url(&self, url: &str) -> Result<bool> {
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|row| row.url != url);
        Ok(rows.len() != before)
    }

    async fn mark_indexed(&self, url: &str, indexed: bool) -> Result<bool> {
        let mut rows = self.rows.lock().unwrap();
        let latest = rows
            .iter_mut()
            .filter(|row| row.url == url)
            .max_by_key(|row| row.version);
        match latest {
            Some(row) => {
                row.indexed = indexed;
                row.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn stats(&self) -> Result<StorageStats> {
        let rows = self.rows.lock().unwrap();
        let distinct_urls = rows
            .iter()
            .map(|row| row.url.as_str())
            .collect::<std::collections::HashSet<_>>()
            .len() as u64;
        let pending_index = rows.iter().filter(|row| !row.indexed).count() as u64;
        Ok(StorageStats {
            documents: rows.len() as u64,
            distinct_urls,
            pending_index,
        })
    }
}
