use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{IndexedChunk, VectorIndex};
use crate::error::Result;

/// In-process vector store keyed by document key.
pub struct MemoryVectorIndex {
    chunks: Mutex<HashMap<String, Vec<IndexedChunk>>>,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        MemoryVectorIndex {
            chunks: Mutex::new(HashMap::new()),
        }
    }

    /// Chunks stored under a document key, for assertions and debugging.
    pub fn chunks_for(&self, doc_key: &str) -> Vec<IndexedChunk> {
        self.chunks
            .lock()
            .unwrap()
            .get(doc_key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn doc_keys(&self) -> Vec<String> {
        self.chunks.lock().unwrap().keys().cloned().collect()
    }
}

impl Default for MemoryVectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn upsert(&self, doc_key: &str, chunks: Vec<IndexedChunk>) -> Result<()> {
        self.chunks
            .lock()
            .unwrap()
            .insert(doc_key.to_string(), chunks);
        Ok(())
    }

    async fn remove(&self, doc_key: &str) -> Result<usize> {
        Ok(self
            .chunks
            .lock()
            .unwrap()
            .remove(doc_key)
            .map(|chunks| chunks.len())
            .unwrap_or(0))
    }

    async fn remove_by_url(&self, url: &str) -> Result<usize> {
        let mut store = self.chunks.lock().unwrap();
        let doomed: Vec<String> = store
            .iter()
            .filter(|(_, chunks)| chunks.iter().any(|chunk| chunk.url == url))
            .map(|(key, _)| key.clone())
            .collect();
        let mut removed = 0;
        for key in doomed {
            if let Some(chunks) = store.remove(&key) {
                removed += chunks.len();
            }
        }
        Ok(removed)
    }

    async fn chunk_count(&self) -> Result<usize> {
        Ok(self
            .chunks
            .lock()
            .unwrap()
            .values()
            .map(|chunks| chunks.len())
            .sum())
    }
}
