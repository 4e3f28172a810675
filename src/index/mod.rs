pub mod chunker;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;

// Re-export common types
pub use chunker::chunk_text;
pub use memory::MemoryVectorIndex;

/// One embedded chunk of a document, keyed by the owning document key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedChunk {
    pub ordinal: usize,
    pub text: String,
    pub embedding: Vec<f32>,
    pub url: String,
    pub site_id: String,
}

/// Embedding generation seam. Real deployments plug a model-backed
/// implementation in here; the default below is deterministic and local.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Deterministic digest-based embedder.
///
/// Not semantically meaningful; it exists so the index stage is exercisable
/// end-to-end without an embedding service, and so identical text always
/// maps to identical vectors.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        HashEmbedder {
            dimension: dimension.max(1),
        }
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let vectors = texts
            .iter()
            .map(|text| {
                let digest = Sha256::digest(text.as_bytes());
                (0..self.dimension)
                    .map(|i| {
                        let byte = digest[i % digest.len()];
                        let salt = (i / digest.len()) as u8;
                        (byte.wrapping_add(salt) as f32 / 255.0) * 2.0 - 1.0
                    })
                    .collect()
            })
            .collect();
        Ok(vectors)
    }
}

/// Vector store consulted by the indexer, keyed by document key
/// (the content hash).
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Replace all chunks stored under `doc_key`.
    async fn upsert(&self, doc_key: &str, chunks: Vec<IndexedChunk>) -> Result<()>;

    /// Remove all chunks stored under `doc_key`. Returns how many were
    /// removed.
    async fn remove(&self, doc_key: &str) -> Result<usize>;

    /// Remove every chunk belonging to a URL, across document keys.
    async fn remove_by_url(&self, url: &str) -> Result<usize>;

    async fn chunk_count(&self) -> Result<usize>;
}
