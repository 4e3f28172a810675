use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::envelope::{IndexOperation, PageEnvelope};
use super::handler::{HandlerError, HandlerResult, Stage, StageHandler};
use crate::index::{chunk_text, Embedder, IndexedChunk, VectorIndex};
use crate::storage::DocumentStore;

/// Index stage: chunk `clean_content`, embed the chunks and write them to
/// the vector store keyed by content hash.
///
/// Honours the persister's decision: `new`/`edit` upsert, `delete` removes
/// by key. Replays are safe because an upsert under the same hash replaces
/// rather than duplicates.
pub struct IndexHandler {
    chunk_size: usize,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    store: Arc<dyn DocumentStore>,
    handler_id: String,
}

impl IndexHandler {
    pub fn new(
        chunk_size: usize,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        store: Arc<dyn DocumentStore>,
        handler_id: String,
    ) -> Self {
        Self {
            chunk_size,
            embedder,
            index,
            store,
            handler_id,
        }
    }

    async fn remove_document(&self, envelope: &PageEnvelope) -> Result<usize, HandlerError> {
        let removed = match envelope.content_hash.as_deref() {
            Some(hash) if !hash.is_empty() => self
                .index
                .remove(hash)
                .await
                .map_err(|e| HandlerError::Transient(e.to_string()))?,
            // Delete signals seeded directly at persist may carry no hash;
            // fall back to removing every chunk under the URL.
            _ => self
                .index
                .remove_by_url(&envelope.url)
                .await
                .map_err(|e| HandlerError::Transient(e.to_string()))?,
        };
        Ok(removed)
    }
}

#[async_trait]
impl StageHandler for IndexHandler {
    fn name(&self) -> &str {
        &self.handler_id
    }

    fn stage(&self) -> Stage {
        Stage::Index
    }

    async fn process(&self, envelope: PageEnvelope) -> HandlerResult {
        let operation = envelope.index_operation.ok_or_else(|| {
            HandlerError::Permanent("envelope reached index stage without an operation".to_string())
        })?;

        match operation {
            IndexOperation::Delete => {
                let removed = self.remove_document(&envelope).await?;
                info!(url = %envelope.url, removed, "document removed from index");
                return Ok(None);
            }
            IndexOperation::New | IndexOperation::Edit => {}
        }

        let content_hash = envelope.hash_or_empty().to_string();
        if content_hash.is_empty() {
            return Err(HandlerError::Permanent(
                "envelope reached index stage without a content hash".to_string(),
            ));
        }

        let Some(clean_content) = envelope.clean_content.as_deref() else {
            return Err(HandlerError::Permanent(
                "envelope reached index stage without clean content".to_string(),
            ));
        };

        let texts = chunk_text(clean_content, self.chunk_size);
        if texts.is_empty() {
            debug!(url = %envelope.url, "no indexable content, completing without output");
            return Ok(None);
        }

        let embeddings = self.embedder.embed(&texts).await.map_err(|e| {
            HandlerError::Transient(format!("embedding generation failed: {e}"))
        })?;
        if embeddings.len() != texts.len() {
            return Err(HandlerError::Transient(format!(
                "embedder returned {} vectors for {} chunks",
                embeddings.len(),
                texts.len()
            )));
        }

        let chunks: Vec<IndexedChunk> = texts
            .into_iter()
            .zip(embeddings)
            .enumerate()
            .map(|(ordinal, (text, embedding))| IndexedChunk {
                ordinal,
                text,
                embedding,
                url: envelope.url.clone(),
                site_id: envelope.site_id.clone(),
            })
            .collect();
        let chunk_count = chunks.len();

        self.index
            .upsert(&content_hash, chunks)
            .await
            .map_err(|e| HandlerError::Transient(e.to_string()))?;

        if let Err(err) = self.store.mark_indexed(&envelope.url, true).await {
            warn!(url = %envelope.url, error = %err, "failed to flag document as indexed");
        }

        info!(url = %envelope.url, hash = %content_hash, chunks = chunk_count, ?operation, "document indexed");
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{HashEmbedder, MemoryVectorIndex};
    use crate::storage::{MemoryDocumentStore, NewDocument};

    fn envelope(url: &str, hash: &str, operation: IndexOperation, content: &str) -> PageEnvelope {
        let mut envelope = PageEnvelope::seed(url, "demo");
        envelope.content_hash = Some(hash.to_string());
        envelope.index_operation = Some(operation);
        envelope.clean_content = Some(content.to_string());
        envelope
    }

    struct Fixture {
        index: Arc<MemoryVectorIndex>,
        store: Arc<MemoryDocumentStore>,
        handler: IndexHandler,
    }

    fn fixture() -> Fixture {
        let index = Arc::new(MemoryVectorIndex::new());
        let store = Arc::new(MemoryDocumentStore::new());
        let handler = IndexHandler::new(
            100,
            Arc::new(HashEmbedder::new(8)),
            index.clone(),
            store.clone(),
            "index-worker-0".to_string(),
        );
        Fixture {
            index,
            store,
            handler,
        }
    }

    #[tokio::test]
    async fn new_document_is_upserted_by_hash() {
        let f = fixture();
        f.store
            .insert_version(NewDocument {
                url: "https://example.com/".to_string(),
                site_id: "demo".to_string(),
                content_hash: "h1".to_string(),
                clean_content: "# Doc".to_string(),
                title: None,
                mimetype: None,
                version: 1,
            })
            .await
            .unwrap();

        let output = f
            .handler
            .process(envelope(
                "https://example.com/",
                "h1",
                IndexOperation::New,
                "# Doc\n\nSome body text.",
            ))
            .await
            .unwrap();

        // Terminal stage: no downstream output.
        assert!(output.is_none());
        assert!(!f.index.chunks_for("h1").is_empty());
        // Document flagged indexed.
        let stored = f
            .store
            .find_by_url("https://example.com/")
            .await
            .unwrap()
            .unwrap();
        assert!(stored.indexed);
    }

    #[tokio::test]
    async fn replay_of_same_hash_does_not_duplicate_chunks() {
        let f = fixture();
        let env = envelope(
            "https://example.com/",
            "h1",
            IndexOperation::New,
            "short body",
        );

        f.handler.process(env.clone()).await.unwrap();
        let count_after_first = f.index.chunk_count().await.unwrap();
        f.handler.process(env).await.unwrap();

        assert_eq!(f.index.chunk_count().await.unwrap(), count_after_first);
    }

    #[tokio::test]
    async fn edit_keeps_both_hashes_available() {
        let f = fixture();
        f.handler
            .process(envelope(
                "https://example.com/",
                "h1",
                IndexOperation::New,
                "first revision",
            ))
            .await
            .unwrap();
        f.handler
            .process(envelope(
                "https://example.com/",
                "h2",
                IndexOperation::Edit,
                "second revision",
            ))
            .await
            .unwrap();

        let mut keys = f.index.doc_keys();
        keys.sort();
        assert_eq!(keys, vec!["h1".to_string(), "h2".to_string()]);
    }

    #[tokio::test]
    async fn delete_removes_chunks_by_hash() {
        let f = fixture();
        f.handler
            .process(envelope(
                "https://example.com/",
                "h1",
                IndexOperation::New,
                "body",
            ))
            .await
            .unwrap();

        f.handler
            .process(envelope(
                "https://example.com/",
                "h1",
                IndexOperation::Delete,
                "",
            ))
            .await
            .unwrap();

        assert_eq!(f.index.chunk_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_without_hash_removes_by_url() {
        let f = fixture();
        f.handler
            .process(envelope(
                "https://example.com/gone",
                "h1",
                IndexOperation::New,
                "body",
            ))
            .await
            .unwrap();

        let mut delete = PageEnvelope::delete_signal("https://example.com/gone", "demo");
        delete.content_hash = None;
        f.handler.process(delete).await.unwrap();

        assert_eq!(f.index.chunk_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_operation_is_permanent() {
        let f = fixture();
        let mut env = PageEnvelope::seed("https://example.com/", "demo");
        env.content_hash = Some("h1".to_string());
        env.clean_content = Some("text".to_string());

        let err = f.handler.process(env).await.unwrap_err();
        assert!(matches!(err, HandlerError::Permanent(_)));
    }

    #[tokio::test]
    async fn empty_clean_content_completes_quietly() {
        let f = fixture();
        let output = f
            .handler
            .process(envelope(
                "https://example.com/",
                "h1",
                IndexOperation::New,
                "",
            ))
            .await
            .unwrap();
        assert!(output.is_none());
        assert_eq!(f.index.chunk_count().await.unwrap(), 0);
    }
}
