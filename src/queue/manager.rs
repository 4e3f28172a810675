use chrono::{TimeZone, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::backend::QueueBackend;
use super::task::{QueueMetrics, TaskRecord, TaskStatus};
use crate::error::{PipelineError, Result};
use crate::pipeline::envelope::PageEnvelope;

/// Reserved key prefix for everything the pipeline stores in the backend.
pub const KEY_PREFIX: &str = "sitesearch";

/// Standard queue names connecting the four stages.
pub const STANDARD_QUEUES: [&str; 4] = ["url", "crawl", "clean", "index"];

/// Rolling window of per-task processing time samples kept per queue.
const PROCESSING_TIME_SAMPLES: i64 = 100;

fn queue_key(queue: &str) -> String {
    // Per-task scoped queues ("task:{id}") use the task-scoped key layout.
    match queue.strip_prefix("task:") {
        Some(task_id) => format!("{KEY_PREFIX}:task:{task_id}:queue"),
        None => format!("{KEY_PREFIX}:queue:{queue}"),
    }
}

fn processing_key(queue: &str) -> String {
    format!("{KEY_PREFIX}:processing:{queue}")
}

fn completed_key(queue: &str) -> String {
    format!("{KEY_PREFIX}:completed:{queue}")
}

fn failed_key(queue: &str) -> String {
    format!("{KEY_PREFIX}:failed:{queue}")
}

fn task_meta_key(task_id: &str) -> String {
    format!("{KEY_PREFIX}:task:meta:{task_id}")
}

fn stats_key(queue: &str) -> String {
    format!("{KEY_PREFIX}:stats:{queue}")
}

fn processing_times_key(queue: &str) -> String {
    format!("{KEY_PREFIX}:processing_times:{queue}")
}

fn last_activity_key(queue: &str) -> String {
    format!("{KEY_PREFIX}:last_activity:{queue}")
}

/// Durable multi-state work queue over the key-value backend.
///
/// Provides enqueue/lease/complete/fail semantics with per-task metadata and
/// per-queue counters. A task id occupies exactly one of pending, processing,
/// completed or failed at any quiescent observation; transitions
/// `pending -> processing -> {completed, failed}` are totally ordered per id.
/// Leases have no server-side expiry; crashed leases are reclaimed by the
/// supervisor's stall sweep.
pub struct QueueManager {
    backend: Arc<dyn QueueBackend>,
}

impl QueueManager {
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        QueueManager { backend }
    }

    pub fn backend(&self) -> Arc<dyn QueueBackend> {
        self.backend.clone()
    }

    fn generate_task_id() -> String {
        let millis = Utc::now().timestamp_millis();
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{millis}-{}", &suffix[..8])
    }

    async fn read_record(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let Some(raw) = self.backend.get(&task_meta_key(task_id)).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<TaskRecord>(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(err) => Err(PipelineError::CorruptTask {
                task_id: task_id.to_string(),
                detail: err.to_string(),
            }),
        }
    }

    async fn write_record(&self, record: &TaskRecord) -> Result<()> {
        let raw = serde_json::to_string(record)?;
        self.backend.set(&task_meta_key(&record.id), &raw).await
    }

    async fn touch_activity(&self, queue: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis() as f64 / 1000.0;
        self.backend
            .set(&last_activity_key(queue), &now.to_string())
            .await
    }

    /// Create a task for `data` and push it onto the pending list.
    ///
    /// Returns the assigned task id.
    pub async fn enqueue(
        &self,
        queue: &str,
        data: PageEnvelope,
        task_id: Option<String>,
    ) -> Result<String> {
        let task_id = task_id.unwrap_or_else(Self::generate_task_id);
        let now = Utc::now();

        let record = TaskRecord {
            id: task_id.clone(),
            queue: queue.to_string(),
            status: TaskStatus::Pending,
            data,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error: None,
            retry_count: 0,
            result: None,
        };

        self.write_record(&record).await?;
        self.backend
            .list_push(&queue_key(queue), &json!({ "id": task_id }).to_string())
            .await?;

        let stats = stats_key(queue);
        self.backend.hash_incr(&stats, "total_enqueued", 1).await?;
        self.backend.hash_incr(&stats, "pending", 1).await?;
        self.touch_activity(queue).await?;

        debug!(task_id = %task_id, queue, "task enqueued");
        Ok(task_id)
    }

    /// Atomically lease one task: pop its id from pending, insert it into the
    /// processing set and stamp `started_at`.
    ///
    /// With `block` the call waits up to `timeout` for an item and returns
    /// `None` on expiry. A popped id whose metadata is missing or unreadable
    /// is moved to the failed set and surfaces as `CorruptTask`; it is never
    /// silently dropped.
    pub async fn dequeue(
        &self,
        queue: &str,
        block: bool,
        timeout: Duration,
    ) -> Result<Option<TaskRecord>> {
        let key = queue_key(queue);
        let raw = if block {
            self.backend.list_pop_blocking(&key, timeout).await?
        } else {
            self.backend.list_pop(&key).await?
        };
        let Some(raw) = raw else {
            return Ok(None);
        };

        let stats = stats_key(queue);
        let task_id = serde_json::from_str::<serde_json::Value>(&raw)
            .ok()
            .and_then(|v| v.get("id").and_then(|id| id.as_str().map(String::from)));
        let Some(task_id) = task_id else {
            self.backend.hash_incr(&stats, "pending", -1).await?;
            self.backend.hash_incr(&stats, "failed", 1).await?;
            return Err(PipelineError::CorruptTask {
                task_id: raw,
                detail: "pending entry is not an id record".to_string(),
            });
        };

        let record = match self.read_record(&task_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                self.backend.set_add(&failed_key(queue), &task_id).await?;
                self.backend.hash_incr(&stats, "pending", -1).await?;
                self.backend.hash_incr(&stats, "failed", 1).await?;
                return Err(PipelineError::CorruptTask {
                    task_id,
                    detail: "task metadata not found".to_string(),
                });
            }
            Err(err) => {
                self.backend.set_add(&failed_key(queue), &task_id).await?;
                self.backend.hash_incr(&stats, "pending", -1).await?;
                self.backend.hash_incr(&stats, "failed", 1).await?;
                return Err(err);
            }
        };

        let now = Utc::now();
        let mut record = record;
        record.status = TaskStatus::Processing;
        record.started_at = Some(now);
        record.updated_at = now;

        self.write_record(&record).await?;
        self.backend.set_add(&processing_key(queue), &task_id).await?;
        self.backend.hash_incr(&stats, "pending", -1).await?;
        self.backend.hash_incr(&stats, "processing", 1).await?;
        self.touch_activity(queue).await?;

        debug!(task_id = %task_id, queue, "task leased");
        Ok(Some(record))
    }

    /// Move a leased task to completed and record its processing time.
    ///
    /// Idempotent: completing a task that is not in processing is a no-op
    /// and returns `false`.
    pub async fn complete_task(
        &self,
        queue: &str,
        task_id: &str,
        result: Option<serde_json::Value>,
    ) -> Result<bool> {
        let Some(mut record) = self.read_record(task_id).await? else {
            warn!(task_id, queue, "complete_task: no metadata for task");
            return Ok(false);
        };
        if record.status != TaskStatus::Processing {
            warn!(task_id, queue, status = ?record.status, "complete_task: task not processing");
            return Ok(false);
        }

        let now = Utc::now();
        record.status = TaskStatus::Completed;
        record.completed_at = Some(now);
        record.updated_at = now;
        record.result = result;

        let processing_time = record
            .started_at
            .map(|started| (now - started).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0);

        self.write_record(&record).await?;
        self.backend
            .set_remove(&processing_key(queue), task_id)
            .await?;
        self.backend.set_add(&completed_key(queue), task_id).await?;

        let stats = stats_key(queue);
        self.backend.hash_incr(&stats, "processing", -1).await?;
        self.backend.hash_incr(&stats, "completed", 1).await?;
        self.backend
            .hash_incr_float(&stats, "total_processing_time", processing_time)
            .await?;

        let times = processing_times_key(queue);
        self.backend
            .list_push(&times, &processing_time.to_string())
            .await?;
        self.backend
            .list_trim(&times, 0, PROCESSING_TIME_SAMPLES - 1)
            .await?;
        self.touch_activity(queue).await?;

        debug!(task_id, queue, processing_time, "task completed");
        Ok(true)
    }

    /// Fail a leased task.
    ///
    /// With `retry` the task re-enters the pending list with an incremented
    /// `retry_count` and a cleared `started_at`; otherwise it moves to the
    /// failed set with the error stamped. The retry ceiling is enforced by
    /// the caller, not here.
    pub async fn fail_task(
        &self,
        queue: &str,
        task_id: &str,
        error: &str,
        retry: bool,
    ) -> Result<bool> {
        let Some(mut record) = self.read_record(task_id).await? else {
            warn!(task_id, queue, "fail_task: no metadata for task");
            return Ok(false);
        };

        let now = Utc::now();
        record.error = Some(error.to_string());
        record.updated_at = now;

        self.backend
            .set_remove(&processing_key(queue), task_id)
            .await?;
        let stats = stats_key(queue);
        self.backend.hash_incr(&stats, "processing", -1).await?;

        if retry {
            record.status = TaskStatus::Pending;
            record.retry_count += 1;
            record.started_at = None;
            self.write_record(&record).await?;

            self.backend
                .list_push(&queue_key(queue), &json!({ "id": task_id }).to_string())
                .await?;
            self.backend.hash_incr(&stats, "retries", 1).await?;
            self.backend.hash_incr(&stats, "pending", 1).await?;
            debug!(task_id, queue, retry_count = record.retry_count, error, "task requeued");
        } else {
            record.status = TaskStatus::Failed;
            self.write_record(&record).await?;

            self.backend.set_add(&failed_key(queue), task_id).await?;
            self.backend.hash_incr(&stats, "failed", 1).await?;
            debug!(task_id, queue, error, "task failed");
        }

        self.touch_activity(queue).await?;
        Ok(true)
    }

    /// Full task record by id, if it exists.
    pub async fn get_task_status(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        self.read_record(task_id).await
    }

    /// Refresh a leased task's `updated_at`, keeping the stall sweep at bay
    /// during long handler calls.
    pub async fn touch_task(&self, task_id: &str) -> Result<bool> {
        let Some(mut record) = self.read_record(task_id).await? else {
            return Ok(false);
        };
        record.updated_at = Utc::now();
        self.write_record(&record).await?;
        Ok(true)
    }

    pub async fn get_queue_length(&self, queue: &str) -> Result<usize> {
        self.backend.list_len(&queue_key(queue)).await
    }

    /// Ids currently leased on this queue; input to the stall sweep.
    pub async fn processing_task_ids(&self, queue: &str) -> Result<Vec<String>> {
        self.backend.set_members(&processing_key(queue)).await
    }

    pub async fn get_queue_metrics(&self, queue: &str) -> Result<QueueMetrics> {
        let pending = self.backend.list_len(&queue_key(queue)).await?;
        let processing = self.backend.set_len(&processing_key(queue)).await?;
        let completed = self.backend.set_len(&completed_key(queue)).await?;
        let failed = self.backend.set_len(&failed_key(queue)).await?;

        let stats = self.backend.hash_get_all(&stats_key(queue)).await?;
        let stat_f64 = |name: &str| -> f64 {
            stats
                .get(name)
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(0.0)
        };
        let completed_total = stat_f64("completed");
        let avg_processing_time = if completed_total > 0.0 {
            stat_f64("total_processing_time") / completed_total
        } else {
            0.0
        };

        let last_activity = self
            .backend
            .get(&last_activity_key(queue))
            .await?
            .and_then(|raw| raw.parse::<f64>().ok())
            .and_then(|secs| Utc.timestamp_millis_opt((secs * 1000.0) as i64).single());

        Ok(QueueMetrics {
            queue_name: queue.to_string(),
            pending,
            processing,
            completed,
            failed,
            retries: stat_f64("retries") as u64,
            avg_processing_time,
            last_activity,
        })
    }

    /// Drain the pending list and delete the metadata of drained tasks.
    ///
    /// In-flight leases are unaffected: the processing set and the
    /// completed/failed sets are left intact, so leased tasks still land in
    /// their terminal state.
    pub async fn clear_queue(&self, queue: &str) -> Result<bool> {
        let key = queue_key(queue);
        let pending_entries = self.backend.list_range(&key, 0, -1).await?;

        let mut doomed_keys = vec![key];
        for raw in &pending_entries {
            if let Some(id) = serde_json::from_str::<serde_json::Value>(raw)
                .ok()
                .and_then(|v| v.get("id").and_then(|id| id.as_str().map(String::from)))
            {
                doomed_keys.push(task_meta_key(&id));
            }
        }
        self.backend.delete(&doomed_keys).await?;
        self.backend.hash_set(&stats_key(queue), "pending", "0").await?;

        debug!(queue, drained = pending_entries.len(), "queue cleared");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::backend::InMemoryBackend;
    use std::time::Instant;

    fn manager() -> QueueManager {
        QueueManager::new(Arc::new(InMemoryBackend::new()))
    }

    fn envelope(url: &str) -> PageEnvelope {
        PageEnvelope::seed(url, "demo")
    }

    #[tokio::test]
    async fn enqueue_then_dequeue_returns_same_data() {
        let queue = manager();
        let data = envelope("https://example.com/");
        let task_id = queue.enqueue("url", data.clone(), None).await.unwrap();

        let task = queue
            .dequeue("url", false, Duration::ZERO)
            .await
            .unwrap()
            .expect("task should be leased");

        assert_eq!(task.id, task_id);
        assert_eq!(task.data, data);
        assert_eq!(task.status, TaskStatus::Processing);
        assert!(task.started_at.is_some());
        assert!(task.started_at.unwrap() >= task.created_at);
    }

    #[tokio::test]
    async fn task_occupies_exactly_one_state() {
        let queue = manager();
        let task_id = queue
            .enqueue("url", envelope("https://example.com/a"), None)
            .await
            .unwrap();

        let metrics = queue.get_queue_metrics("url").await.unwrap();
        assert_eq!(
            (metrics.pending, metrics.processing, metrics.completed, metrics.failed),
            (1, 0, 0, 0)
        );

        queue.dequeue("url", false, Duration::ZERO).await.unwrap();
        let metrics = queue.get_queue_metrics("url").await.unwrap();
        assert_eq!(
            (metrics.pending, metrics.processing, metrics.completed, metrics.failed),
            (0, 1, 0, 0)
        );

        queue.complete_task("url", &task_id, None).await.unwrap();
        let metrics = queue.get_queue_metrics("url").await.unwrap();
        assert_eq!(
            (metrics.pending, metrics.processing, metrics.completed, metrics.failed),
            (0, 0, 1, 0)
        );
    }

    #[tokio::test]
    async fn complete_is_idempotent() {
        let queue = manager();
        let task_id = queue
            .enqueue("url", envelope("https://example.com/a"), None)
            .await
            .unwrap();
        queue.dequeue("url", false, Duration::ZERO).await.unwrap();

        assert!(queue.complete_task("url", &task_id, None).await.unwrap());
        // Second completion is a no-op.
        assert!(!queue.complete_task("url", &task_id, None).await.unwrap());

        let metrics = queue.get_queue_metrics("url").await.unwrap();
        assert_eq!(metrics.completed, 1);
    }

    #[tokio::test]
    async fn completing_a_pending_task_is_a_no_op() {
        let queue = manager();
        let task_id = queue
            .enqueue("url", envelope("https://example.com/a"), None)
            .await
            .unwrap();
        assert!(!queue.complete_task("url", &task_id, None).await.unwrap());
        assert_eq!(queue.get_queue_length("url").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn retry_requeues_with_incremented_count() {
        let queue = manager();
        let task_id = queue
            .enqueue("url", envelope("https://example.com/a"), None)
            .await
            .unwrap();
        queue.dequeue("url", false, Duration::ZERO).await.unwrap();
        queue
            .fail_task("url", &task_id, "connect timeout", true)
            .await
            .unwrap();

        let record = queue.get_task_status(&task_id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.retry_count, 1);
        assert!(record.started_at.is_none());

        let leased = queue
            .dequeue("url", false, Duration::ZERO)
            .await
            .unwrap()
            .expect("retried task should be leased again");
        assert_eq!(leased.id, task_id);
        assert_eq!(leased.retry_count, 1);
    }

    #[tokio::test]
    async fn retry_count_never_decreases() {
        let queue = manager();
        let task_id = queue
            .enqueue("url", envelope("https://example.com/a"), None)
            .await
            .unwrap();

        let mut last = 0;
        for _ in 0..3 {
            queue.dequeue("url", false, Duration::ZERO).await.unwrap();
            queue
                .fail_task("url", &task_id, "flaky", true)
                .await
                .unwrap();
            let record = queue.get_task_status(&task_id).await.unwrap().unwrap();
            assert!(record.retry_count > last);
            last = record.retry_count;
        }
        assert_eq!(last, 3);
    }

    #[tokio::test]
    async fn terminal_failure_lands_in_failed_set() {
        let queue = manager();
        let task_id = queue
            .enqueue("url", envelope("https://example.com/a"), None)
            .await
            .unwrap();
        queue.dequeue("url", false, Duration::ZERO).await.unwrap();
        queue
            .fail_task("url", &task_id, "404 not found", false)
            .await
            .unwrap();

        let record = queue.get_task_status(&task_id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("404 not found"));

        let metrics = queue.get_queue_metrics("url").await.unwrap();
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.pending, 0);
        assert_eq!(metrics.processing, 0);
    }

    #[tokio::test]
    async fn blocking_dequeue_times_out_on_empty_queue() {
        let queue = manager();
        let started = Instant::now();
        let task = queue
            .dequeue("url", true, Duration::from_millis(150))
            .await
            .unwrap();
        assert!(task.is_none());
        assert!(started.elapsed() >= Duration::from_millis(120));
    }

    #[tokio::test]
    async fn missing_metadata_surfaces_as_corrupt_task() {
        let backend: Arc<dyn QueueBackend> = Arc::new(InMemoryBackend::new());
        let queue = QueueManager::new(backend.clone());

        // A pending pointer with no metadata record behind it.
        backend
            .list_push(&queue_key("url"), &json!({ "id": "ghost-1" }).to_string())
            .await
            .unwrap();

        let err = queue
            .dequeue("url", false, Duration::ZERO)
            .await
            .expect_err("corrupt task should surface");
        assert!(matches!(err, PipelineError::CorruptTask { ref task_id, .. } if task_id == "ghost-1"));

        // The id was parked in the failed set, not dropped.
        let failed = backend.set_members(&failed_key("url")).await.unwrap();
        assert_eq!(failed, vec!["ghost-1".to_string()]);
    }

    #[tokio::test]
    async fn clear_queue_drains_pending_but_not_processing() {
        let queue = manager();
        let leased_id = queue
            .enqueue("clean", envelope("https://example.com/leased"), None)
            .await
            .unwrap();
        queue.dequeue("clean", false, Duration::ZERO).await.unwrap();

        for i in 0..5 {
            queue
                .enqueue("clean", envelope(&format!("https://example.com/{i}")), None)
                .await
                .unwrap();
        }

        queue.clear_queue("clean").await.unwrap();

        let metrics = queue.get_queue_metrics("clean").await.unwrap();
        assert_eq!(metrics.pending, 0);
        assert_eq!(metrics.processing, 1);

        // The leased task still reaches a terminal state.
        queue.complete_task("clean", &leased_id, None).await.unwrap();
        let metrics = queue.get_queue_metrics("clean").await.unwrap();
        assert_eq!(metrics.processing, 0);
        assert_eq!(metrics.completed, 1);
    }

    #[tokio::test]
    async fn completed_at_follows_started_at_follows_created_at() {
        let queue = manager();
        let task_id = queue
            .enqueue("url", envelope("https://example.com/a"), None)
            .await
            .unwrap();
        queue.dequeue("url", false, Duration::ZERO).await.unwrap();
        queue.complete_task("url", &task_id, None).await.unwrap();

        let record = queue.get_task_status(&task_id).await.unwrap().unwrap();
        let started = record.started_at.unwrap();
        let completed = record.completed_at.unwrap();
        assert!(completed >= started);
        assert!(started >= record.created_at);
    }

    #[tokio::test]
    async fn metrics_track_avg_processing_time() {
        let queue = manager();
        let task_id = queue
            .enqueue("url", envelope("https://example.com/a"), None)
            .await
            .unwrap();
        queue.dequeue("url", false, Duration::ZERO).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.complete_task("url", &task_id, None).await.unwrap();

        let metrics = queue.get_queue_metrics("url").await.unwrap();
        assert!(metrics.avg_processing_time > 0.0);
        assert!(metrics.last_activity.is_some());
    }

    #[tokio::test]
    async fn touch_task_refreshes_updated_at() {
        let queue = manager();
        let task_id = queue
            .enqueue("url", envelope("https://example.com/a"), None)
            .await
            .unwrap();
        queue.dequeue("url", false, Duration::ZERO).await.unwrap();
        let before = queue
            .get_task_status(&task_id)
            .await
            .unwrap()
            .unwrap()
            .updated_at;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(queue.touch_task(&task_id).await.unwrap());

        let after = queue
            .get_task_status(&task_id)
            .await
            .unwrap()
            .unwrap()
            .updated_at;
        assert!(after > before);
        assert!(!queue.touch_task("missing-task").await.unwrap());
    }

    #[tokio::test]
    async fn scoped_task_queue_uses_task_key_layout() {
        let backend: Arc<dyn QueueBackend> = Arc::new(InMemoryBackend::new());
        let queue = QueueManager::new(backend.clone());
        queue
            .enqueue("task:job-42", envelope("https://example.com/"), None)
            .await
            .unwrap();

        assert_eq!(
            backend
                .list_len("sitesearch:task:job-42:queue")
                .await
                .unwrap(),
            1
        );
    }
}
