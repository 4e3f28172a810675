use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

use super::envelope::{IndexOperation, PageEnvelope};
use super::handler::{HandlerError, HandlerResult, Stage, StageHandler};
use crate::storage::{DocumentStore, NewDocument};

/// Persist stage: consult the document store keyed by `(url, content_hash)`
/// and decide the index operation.
///
/// Unknown URL: insert version 1 and forward as `new`. Known URL with the
/// same hash: drop (the idempotency gate). Known URL with a different hash:
/// append the next version and forward as `edit`. A delete signal forwards
/// as `delete` after removing the stored revisions.
pub struct PersistHandler {
    store: Arc<dyn DocumentStore>,
    handler_id: String,
}

impl PersistHandler {
    pub fn new(store: Arc<dyn DocumentStore>, handler_id: String) -> Self {
        Self { store, handler_id }
    }

    fn new_document(envelope: &PageEnvelope, version: u32) -> NewDocument {
        NewDocument {
            url: envelope.url.clone(),
            site_id: envelope.site_id.clone(),
            content_hash: envelope.hash_or_empty().to_string(),
            clean_content: envelope.clean_content.clone().unwrap_or_default(),
            title: envelope.metadata.title.clone(),
            mimetype: envelope.mimetype.clone(),
            version,
        }
    }
}

#[async_trait]
impl StageHandler for PersistHandler {
    fn name(&self) -> &str {
        &self.handler_id
    }

    fn stage(&self) -> Stage {
        Stage::Persist
    }

    async fn process(&self, envelope: PageEnvelope) -> HandlerResult {
        // Deletions are seeded directly at this stage and bypass fetch/clean.
        if envelope.index_operation == Some(IndexOperation::Delete) {
            let removed = self
                .store
                .delete_by_url(&envelope.url)
                .await
                .map_err(|e| HandlerError::Transient(e.to_string()))?;
            info!(url = %envelope.url, removed, "delete signal persisted");
            let mut output = envelope;
            output.clean_content = Some(String::new());
            output.updated_at = Some(Utc::now());
            return Ok(Some(output));
        }

        let content_hash = envelope.hash_or_empty().to_string();
        if content_hash.is_empty() {
            return Err(HandlerError::Permanent(
                "envelope reached persist stage without a content hash".to_string(),
            ));
        }

        let existing = self
            .store
            .find_by_url(&envelope.url)
            .await
            .map_err(|e| HandlerError::Transient(e.to_string()))?;

        let (operation, version) = match &existing {
            None => (IndexOperation::New, 1),
            Some(doc) if doc.content_hash == content_hash => {
                debug!(url = %envelope.url, hash = %content_hash, "content unchanged, dropping");
                return Ok(None);
            }
            Some(doc) => (IndexOperation::Edit, doc.version + 1),
        };

        self.store
            .insert_version(Self::new_document(&envelope, version))
            .await
            .map_err(|e| HandlerError::Transient(e.to_string()))?;

        info!(url = %envelope.url, ?operation, version, "document revision persisted");

        let mut output = envelope;
        output.index_operation = Some(operation);
        output.version = Some(version);
        output.updated_at = Some(Utc::now());
        Ok(Some(output))
    }
}
