use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::envelope::PageEnvelope;
use crate::error::PipelineError;
use crate::queue::manager::QueueManager;

/// The four pipeline stages, each a worker pool plus its input and output
/// queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Fetch,
    Clean,
    Persist,
    Index,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Fetch, Stage::Clean, Stage::Persist, Stage::Index];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Fetch => "fetch",
            Stage::Clean => "clean",
            Stage::Persist => "persist",
            Stage::Index => "index",
        }
    }

    /// Queue this stage leases from.
    pub fn input_queue(self) -> &'static str {
        match self {
            Stage::Fetch => "url",
            Stage::Clean => "crawl",
            Stage::Persist => "clean",
            Stage::Index => "index",
        }
    }

    /// Queue this stage forwards its output to, if any.
    pub fn output_queue(self) -> Option<&'static str> {
        match self {
            Stage::Fetch => Some("crawl"),
            Stage::Clean => Some("clean"),
            Stage::Persist => Some("index"),
            Stage::Index => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fetch" => Ok(Stage::Fetch),
            "clean" => Ok(Stage::Clean),
            "persist" => Ok(Stage::Persist),
            "index" => Ok(Stage::Index),
            other => Err(PipelineError::Config(format!("unknown stage: {other}"))),
        }
    }
}

/// Processing failures a handler can surface to the worker loop.
///
/// Transient errors are retried up to the stage's retry ceiling; permanent
/// errors fail the task immediately.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("permanent: {0}")]
    Permanent(String),
}

pub type HandlerResult = std::result::Result<Option<PageEnvelope>, HandlerError>;

/// Domain transform applied by one stage.
///
/// `process` returns the envelope to forward downstream, or `None` when the
/// task completes without output (filtered URL, unchanged content, terminal
/// stage).
#[async_trait]
pub trait StageHandler: Send + Sync {
    fn name(&self) -> &str;

    fn stage(&self) -> Stage;

    async fn process(&self, envelope: PageEnvelope) -> HandlerResult;

    async fn on_start(&self) {}

    async fn on_stop(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Starting,
    Running,
    Stopped,
}

const STATUS_STARTING: u8 = 0;
const STATUS_RUNNING: u8 = 1;
const STATUS_STOPPED: u8 = 2;

/// Shared mutable view of a worker, read by the supervisor status surface.
pub struct WorkerState {
    pub worker_id: String,
    pub stage: Stage,
    pub spawned_at: DateTime<Utc>,
    status: AtomicU8,
    tasks_processed: AtomicU64,
    tasks_failed: AtomicU64,
    last_activity_ms: AtomicU64,
}

impl WorkerState {
    pub fn new(worker_id: String, stage: Stage) -> Self {
        WorkerState {
            worker_id,
            stage,
            spawned_at: Utc::now(),
            status: AtomicU8::new(STATUS_STARTING),
            tasks_processed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> WorkerStatus {
        match self.status.load(Ordering::Relaxed) {
            STATUS_RUNNING => WorkerStatus::Running,
            STATUS_STOPPED => WorkerStatus::Stopped,
            _ => WorkerStatus::Starting,
        }
    }

    fn set_status(&self, status: WorkerStatus) {
        let raw = match status {
            WorkerStatus::Starting => STATUS_STARTING,
            WorkerStatus::Running => STATUS_RUNNING,
            WorkerStatus::Stopped => STATUS_STOPPED,
        };
        self.status.store(raw, Ordering::Relaxed);
    }

    fn record_processed(&self) {
        self.tasks_processed.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    fn record_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            worker_id: self.worker_id.clone(),
            stage: self.stage,
            spawned_at: self.spawned_at,
            status: self.status(),
            tasks_processed: self.tasks_processed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            last_activity: match self.last_activity_ms.load(Ordering::Relaxed) {
                0 => None,
                ms => chrono::TimeZone::timestamp_millis_opt(&Utc, ms as i64).single(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub worker_id: String,
    pub stage: Stage,
    pub spawned_at: DateTime<Utc>,
    pub status: WorkerStatus,
    pub tasks_processed: u64,
    pub tasks_failed: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Queue wiring and policy for one worker replica.
#[derive(Clone)]
pub struct WorkerContext {
    pub worker_id: String,
    pub stage: Stage,
    pub input_queue: String,
    pub output_queue: Option<String>,
    pub poll_timeout: Duration,
    pub max_retries: u32,
}

/// Pause after a backend error before the next lease attempt.
const BACKEND_ERROR_BACKOFF: Duration = Duration::from_secs(2);

/// The lease loop shared by all four stages.
///
/// Lease, process, re-enqueue downstream, handle failure with bounded retry.
/// The stop token is observed between lease iterations; an in-flight
/// `process` runs to completion, and the bounded dequeue wait keeps stop
/// response within the poll timeout.
pub async fn run_worker(
    ctx: WorkerContext,
    queue: Arc<QueueManager>,
    handler: Arc<dyn StageHandler>,
    state: Arc<WorkerState>,
    token: CancellationToken,
) {
    handler.on_start().await;
    state.set_status(WorkerStatus::Running);
    info!(
        worker_id = %ctx.worker_id,
        stage = %ctx.stage,
        handler = handler.name(),
        input = %ctx.input_queue,
        "worker started"
    );

    while !token.is_cancelled() {
        let task = match queue.dequeue(&ctx.input_queue, true, ctx.poll_timeout).await {
            Ok(Some(task)) => task,
            Ok(None) => continue,
            Err(PipelineError::CorruptTask { task_id, detail }) => {
                warn!(worker_id = %ctx.worker_id, task_id = %task_id, detail = %detail, "corrupt task parked in failed set");
                continue;
            }
            Err(err) => {
                error!(worker_id = %ctx.worker_id, error = %err, "lease failed, backing off");
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(BACKEND_ERROR_BACKOFF) => {}
                }
                continue;
            }
        };

        debug!(worker_id = %ctx.worker_id, task_id = %task.id, "processing task");
        match handler.process(task.data.clone()).await {
            Ok(output) => {
                match queue.complete_task(&ctx.input_queue, &task.id, None).await {
                    Ok(_) => state.record_processed(),
                    Err(err) => {
                        error!(worker_id = %ctx.worker_id, task_id = %task.id, error = %err, "failed to complete task");
                        continue;
                    }
                }
                if let (Some(output_queue), Some(envelope)) = (&ctx.output_queue, output) {
                    // The only double-processing window: the upstream task is
                    // already completed, so a failed enqueue is logged as an
                    // incident and the URL must be reseeded by the operator.
                    if let Err(err) = queue.enqueue(output_queue, envelope, None).await {
                        let incident = PipelineError::DownstreamEnqueueFailed {
                            queue: output_queue.clone(),
                            task_id: task.id.clone(),
                            detail: err.to_string(),
                        };
                        error!(worker_id = %ctx.worker_id, error = %incident, "downstream enqueue failed");
                    }
                }
            }
            Err(HandlerError::Transient(message)) => {
                let retry = task.retry_count < ctx.max_retries;
                if !retry {
                    warn!(worker_id = %ctx.worker_id, task_id = %task.id, retries = task.retry_count, "retry ceiling reached");
                }
                if let Err(err) = queue
                    .fail_task(&ctx.input_queue, &task.id, &message, retry)
                    .await
                {
                    error!(worker_id = %ctx.worker_id, task_id = %task.id, error = %err, "failed to fail task");
                }
                state.record_failed();
            }
            Err(HandlerError::Permanent(message)) => {
                if let Err(err) = queue
                    .fail_task(&ctx.input_queue, &task.id, &message, false)
                    .await
                {
                    error!(worker_id = %ctx.worker_id, task_id = %task.id, error = %err, "failed to fail task");
                }
                state.record_failed();
            }
        }
    }

    state.set_status(WorkerStatus::Stopped);
    handler.on_stop().await;
    info!(worker_id = %ctx.worker_id, stage = %ctx.stage, "worker stopped");
}
