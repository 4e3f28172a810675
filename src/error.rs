use thiserror::Error;

/// Custom Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors surfaced by the queue manager, supervisor and stage workers.
///
/// Stage-level processing failures are represented separately by
/// `pipeline::handler::HandlerError`; the worker loop converts those into
/// queue state transitions and only orchestration-level errors reach callers.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("queue backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("task {task_id} metadata unreadable: {detail}")]
    CorruptTask { task_id: String, detail: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("components already running")]
    AlreadyRunning,

    #[error("stage {stage} reached {reached} of {requested} requested workers")]
    SpawnFailed {
        stage: String,
        requested: usize,
        reached: usize,
    },

    #[error("scale operation on stage {0} timed out")]
    ScaleTimeout(String),

    #[error("unknown worker: {0}")]
    UnknownWorker(String),

    #[error("unknown crawl job: {0}")]
    UnknownJob(String),

    #[error("downstream enqueue to {queue} failed for completed task {task_id}: {detail}")]
    DownstreamEnqueueFailed {
        queue: String,
        task_id: String,
        detail: String,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

impl From<redis::RedisError> for PipelineError {
    fn from(err: redis::RedisError) -> Self {
        PipelineError::BackendUnavailable(err.to_string())
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        PipelineError::Storage(err.to_string())
    }
}
