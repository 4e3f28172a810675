pub mod cleaner;
pub mod envelope;
pub mod fetcher;
pub mod handler;
pub mod indexer;
pub mod page_parser;
pub mod persister;
pub mod url_filter;

use std::sync::Arc;

use crate::cli::config::PipelineConfig;
use crate::index::{Embedder, VectorIndex};
use crate::queue::manager::QueueManager;
use crate::storage::DocumentStore;

// Re-export common types
pub use envelope::{IndexOperation, PageContent, PageEnvelope, PageMetadata};
pub use fetcher::{FetchError, FetchHandler, FetchedPage, HttpFetcher, PageFetcher};
pub use handler::{
    run_worker, HandlerError, Stage, StageHandler, WorkerContext, WorkerSnapshot, WorkerState,
    WorkerStatus,
};
pub use url_filter::UrlFilter;

use cleaner::{default_strategies, CleanHandler, CleanStrategy};
use indexer::IndexHandler;
use persister::PersistHandler;

/// Binds each concrete stage handler to its collaborators and queue names.
///
/// Fetch handlers are stateful (seen-URL filter, page budget) so every
/// worker replica gets its own instance; the other stages share their
/// collaborators through `Arc`s.
pub struct HandlerFactory {
    config: PipelineConfig,
    queue: Arc<QueueManager>,
    fetcher: Arc<dyn PageFetcher>,
    store: Arc<dyn DocumentStore>,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    strategies: Vec<Arc<dyn CleanStrategy>>,
}

impl HandlerFactory {
    pub fn new(
        config: PipelineConfig,
        queue: Arc<QueueManager>,
        fetcher: Arc<dyn PageFetcher>,
        store: Arc<dyn DocumentStore>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            config,
            queue,
            fetcher,
            store,
            index,
            embedder,
            strategies: default_strategies(),
        }
    }

    /// Replace the clean strategies, e.g. to register pdf or docx
    /// converters.
    pub fn with_strategies(mut self, strategies: Vec<Arc<dyn CleanStrategy>>) -> Self {
        self.strategies = strategies;
        self
    }

    /// Build a handler for `stage`, reading from `input_queue`.
    pub fn create_handler(
        &self,
        stage: Stage,
        input_queue: &str,
        handler_id: &str,
    ) -> Arc<dyn StageHandler> {
        match stage {
            Stage::Fetch => Arc::new(FetchHandler::new(
                self.config.fetch.clone(),
                self.fetcher.clone(),
                self.queue.clone(),
                input_queue.to_string(),
                handler_id.to_string(),
            )),
            Stage::Clean => Arc::new(CleanHandler::new(
                self.strategies.clone(),
                self.store.clone(),
                handler_id.to_string(),
            )),
            Stage::Persist => Arc::new(PersistHandler::new(
                self.store.clone(),
                handler_id.to_string(),
            )),
            Stage::Index => Arc::new(IndexHandler::new(
                self.config.indexer.chunk_size,
                self.embedder.clone(),
                self.index.clone(),
                self.store.clone(),
                handler_id.to_string(),
            )),
        }
    }
}
