pub mod status;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cli::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::pipeline::envelope::PageEnvelope;
use crate::pipeline::handler::{run_worker, Stage, WorkerContext, WorkerState};
use crate::pipeline::HandlerFactory;
use crate::queue::manager::{QueueManager, STANDARD_QUEUES};
use crate::queue::monitor::QueueMonitor;
use crate::storage::DocumentStore;

pub use status::{ComponentStatus, CrawlJobStatus, MonitoringStatus, StatusSnapshot};

/// A spawned worker replica: its stop token, shared state and join handle.
struct WorkerHandle {
    id: String,
    stage: Stage,
    input_queue: String,
    token: CancellationToken,
    state: Arc<WorkerState>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    fn is_active(&self) -> bool {
        !self.join.is_finished()
    }
}

/// A crawl job with its own scoped input queue and dedicated fetch workers.
struct CrawlJob {
    job_id: String,
    start_url: String,
    site_id: String,
    input_queue: String,
    state: String,
    started_at: DateTime<Utc>,
    workers: Vec<WorkerHandle>,
}

/// Owns the worker pools for all four stages: launches, monitors, scales and
/// restarts replicas, reclaims stalled leases, and produces the status
/// snapshot.
///
/// The supervisor never leases or completes tasks itself; the queue backend
/// owns all task state.
pub struct Supervisor {
    config: PipelineConfig,
    queue: Arc<QueueManager>,
    factory: HandlerFactory,
    store: Arc<dyn DocumentStore>,
    monitor: Arc<QueueMonitor>,
    pools: Mutex<HashMap<Stage, Vec<WorkerHandle>>>,
    jobs: Mutex<HashMap<String, CrawlJob>>,
    component_configs: Mutex<HashMap<Stage, serde_json::Value>>,
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
    monitoring_active: AtomicBool,
    shutdown_token: CancellationToken,
    worker_seq: AtomicUsize,
}

impl Supervisor {
    pub fn new(
        config: PipelineConfig,
        queue: Arc<QueueManager>,
        factory: HandlerFactory,
        store: Arc<dyn DocumentStore>,
    ) -> Arc<Self> {
        let monitor = Arc::new(QueueMonitor::new(
            queue.clone(),
            STANDARD_QUEUES.iter().map(|q| q.to_string()).collect(),
            config.monitor.clone(),
        ));
        Arc::new(Supervisor {
            config,
            queue,
            factory,
            store,
            monitor,
            pools: Mutex::new(HashMap::new()),
            jobs: Mutex::new(HashMap::new()),
            component_configs: Mutex::new(HashMap::new()),
            sweep_handle: Mutex::new(None),
            monitoring_active: AtomicBool::new(false),
            shutdown_token: CancellationToken::new(),
            worker_seq: AtomicUsize::new(0),
        })
    }

    pub fn monitor(&self) -> Arc<QueueMonitor> {
        self.monitor.clone()
    }

    async fn worker_count(&self) -> usize {
        let pools = self.pools.lock().await;
        let pooled: usize = pools.values().map(|pool| pool.len()).sum();
        let jobs = self.jobs.lock().await;
        pooled + jobs.values().map(|job| job.workers.len()).sum::<usize>()
    }

    /// Record per-component configuration. Idempotent while no workers
    /// exist.
    pub async fn initialize_components(
        &self,
        crawler_cfg: serde_json::Value,
        cleaner_cfg: serde_json::Value,
        storage_cfg: serde_json::Value,
        indexer_cfg: serde_json::Value,
    ) -> Result<()> {
        if self.worker_count().await > 0 {
            return Err(PipelineError::AlreadyRunning);
        }
        let mut configs = self.component_configs.lock().await;
        configs.insert(Stage::Fetch, crawler_cfg);
        configs.insert(Stage::Clean, cleaner_cfg);
        configs.insert(Stage::Persist, storage_cfg);
        configs.insert(Stage::Index, indexer_cfg);
        info!("component configurations recorded");
        Ok(())
    }

    fn spawn_worker(&self, stage: Stage, input_queue: String) -> Result<WorkerHandle> {
        if self.shutdown_token.is_cancelled() {
            return Err(PipelineError::SpawnFailed {
                stage: stage.to_string(),
                requested: 1,
                reached: 0,
            });
        }

        let seq = self.worker_seq.fetch_add(1, Ordering::SeqCst);
        let worker_id = format!("{stage}-worker-{seq}");
        let handler = self.factory.create_handler(stage, &input_queue, &worker_id);
        debug_assert_eq!(handler.stage(), stage);
        let state = Arc::new(WorkerState::new(worker_id.clone(), stage));
        let token = self.shutdown_token.child_token();
        let stage_cfg = self.config.stages.for_stage(stage);

        let ctx = WorkerContext {
            worker_id: worker_id.clone(),
            stage,
            input_queue: input_queue.clone(),
            output_queue: stage.output_queue().map(String::from),
            poll_timeout: Duration::from_millis(stage_cfg.poll_timeout_ms),
            max_retries: stage_cfg.max_retries,
        };
        let join = tokio::spawn(run_worker(
            ctx,
            self.queue.clone(),
            handler,
            state.clone(),
            token.clone(),
        ));

        debug!(worker_id = %worker_id, stage = %stage, "worker spawned");
        Ok(WorkerHandle {
            id: worker_id,
            stage,
            input_queue,
            token,
            state,
            join,
        })
    }

    /// Spawn the requested replicas per stage and start the stall sweep.
    ///
    /// Partial success leaves the pool in the reached state.
    pub async fn start_workers(
        self: &Arc<Self>,
        fetch_n: usize,
        clean_n: usize,
        persist_n: usize,
        index_n: usize,
    ) -> Result<()> {
        let plan = [
            (Stage::Fetch, fetch_n),
            (Stage::Clean, clean_n),
            (Stage::Persist, persist_n),
            (Stage::Index, index_n),
        ];

        for (stage, requested) in plan {
            for reached in 0..requested {
                let handle = match self.spawn_worker(stage, stage.input_queue().to_string()) {
                    Ok(handle) => handle,
                    Err(_) => {
                        return Err(PipelineError::SpawnFailed {
                            stage: stage.to_string(),
                            requested,
                            reached,
                        })
                    }
                };
                self.pools.lock().await.entry(stage).or_default().push(handle);
            }
        }

        self.start_sweep_loop().await;
        info!(fetch_n, clean_n, persist_n, index_n, "worker pools started");
        Ok(())
    }

    async fn start_sweep_loop(self: &Arc<Self>) {
        let mut guard = self.sweep_handle.lock().await;
        if guard.is_some() {
            return;
        }
        let supervisor = self.clone();
        let token = self.shutdown_token.clone();
        let interval = Duration::from_secs(self.config.supervisor.sweep_interval_secs);
        *guard = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(err) = supervisor.sweep_stalled_once().await {
                    error!(error = %err, "stall sweep failed");
                }
                supervisor.reap_dead_workers_once().await;
            }
        }));
    }

    /// Requeue leased tasks whose metadata has not been touched within the
    /// stall timeout, respecting each stage's retry ceiling.
    pub async fn sweep_stalled_once(&self) -> Result<usize> {
        let stall_secs = self.config.supervisor.stall_timeout_secs as i64;
        let mut queues: Vec<String> = STANDARD_QUEUES.iter().map(|q| q.to_string()).collect();
        {
            let jobs = self.jobs.lock().await;
            queues.extend(jobs.values().map(|job| job.input_queue.clone()));
        }

        let mut reclaimed = 0;
        for queue_name in queues {
            let stage = stage_for_queue(&queue_name);
            let max_retries = self.config.stages.for_stage(stage).max_retries;

            for task_id in self.queue.processing_task_ids(&queue_name).await? {
                let record = match self.queue.get_task_status(&task_id).await {
                    Ok(Some(record)) => record,
                    Ok(None) => {
                        warn!(task_id = %task_id, queue = %queue_name, "leased task has no metadata");
                        continue;
                    }
                    Err(err) => {
                        warn!(task_id = %task_id, error = %err, "unreadable leased task");
                        continue;
                    }
                };

                let idle = (Utc::now() - record.updated_at).num_seconds();
                if idle <= stall_secs {
                    continue;
                }

                let retry = record.retry_count < max_retries;
                info!(
                    task_id = %task_id,
                    queue = %queue_name,
                    idle,
                    retry,
                    "reclaiming stalled lease"
                );
                self.queue
                    .fail_task(&queue_name, &task_id, "stalled lease reclaimed", retry)
                    .await?;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    /// Respawn workers whose task exited without being asked to stop.
    pub async fn reap_dead_workers_once(&self) -> usize {
        let mut respawned = 0;
        let mut pools = self.pools.lock().await;
        for pool in pools.values_mut() {
            let mut index = 0;
            while index < pool.len() {
                let died = pool[index].join.is_finished() && !pool[index].token.is_cancelled();
                if died {
                    let dead = pool.remove(index);
                    warn!(worker_id = %dead.id, stage = %dead.stage, "worker died, respawning");
                    match self.spawn_worker(dead.stage, dead.input_queue.clone()) {
                        Ok(handle) => {
                            pool.push(handle);
                            respawned += 1;
                        }
                        Err(err) => error!(error = %err, "failed to respawn worker"),
                    }
                } else {
                    index += 1;
                }
            }
        }
        respawned
    }

    /// Grow or shrink a stage pool to `target_count`.
    ///
    /// Shrinking stops the oldest workers cooperatively and waits up to the
    /// scale timeout for them to drain.
    pub async fn scale(&self, stage: Stage, target_count: usize) -> Result<()> {
        let current = {
            let pools = self.pools.lock().await;
            pools.get(&stage).map(|pool| pool.len()).unwrap_or(0)
        };

        if target_count > current {
            for _ in current..target_count {
                let handle = self.spawn_worker(stage, stage.input_queue().to_string())?;
                self.pools.lock().await.entry(stage).or_default().push(handle);
            }
            info!(stage = %stage, from = current, to = target_count, "scaled up");
            return Ok(());
        }

        let excess: Vec<WorkerHandle> = {
            let mut pools = self.pools.lock().await;
            match pools.get_mut(&stage) {
                Some(pool) => pool.drain(0..current - target_count).collect(),
                None => Vec::new(),
            }
        };
        for handle in &excess {
            handle.token.cancel();
        }

        let deadline = Duration::from_secs(self.config.supervisor.scale_timeout_secs);
        for handle in excess {
            let abort = handle.join.abort_handle();
            match tokio::time::timeout(deadline, handle.join).await {
                Ok(_) => debug!(worker_id = %handle.id, "worker drained"),
                Err(_) => {
                    warn!(worker_id = %handle.id, "worker did not drain in time");
                    abort.abort();
                    return Err(PipelineError::ScaleTimeout(stage.to_string()));
                }
            }
        }
        info!(stage = %stage, from = current, to = target_count, "scaled down");
        Ok(())
    }

    /// Cooperatively stop one worker and respawn it with the same stage
    /// config.
    pub async fn restart(&self, worker_id: &str) -> Result<String> {
        let handle = {
            let mut pools = self.pools.lock().await;
            let mut found = None;
            for pool in pools.values_mut() {
                if let Some(position) = pool.iter().position(|h| h.id == worker_id) {
                    found = Some(pool.remove(position));
                    break;
                }
            }
            found
        };
        let Some(handle) = handle else {
            return Err(PipelineError::UnknownWorker(worker_id.to_string()));
        };

        handle.token.cancel();
        let deadline = Duration::from_secs(self.config.supervisor.scale_timeout_secs);
        let stage = handle.stage;
        let input_queue = handle.input_queue.clone();
        let abort = handle.join.abort_handle();
        if tokio::time::timeout(deadline, handle.join).await.is_err() {
            abort.abort();
            return Err(PipelineError::ScaleTimeout(stage.to_string()));
        }

        let replacement = self.spawn_worker(stage, input_queue)?;
        let new_id = replacement.id.clone();
        self.pools.lock().await.entry(stage).or_default().push(replacement);
        info!(old = worker_id, new = %new_id, "worker restarted");
        Ok(new_id)
    }

    /// Seed the pipeline with a URL on the shared fetch queue.
    pub async fn add_url_to_queue(&self, url: &str, site_id: &str) -> Result<String> {
        self.queue
            .enqueue("url", PageEnvelope::seed(url, site_id), None)
            .await
    }

    /// Seed a deletion directly at the persist stage.
    pub async fn delete_url(&self, url: &str, site_id: &str) -> Result<String> {
        self.queue
            .enqueue("clean", PageEnvelope::delete_signal(url, site_id), None)
            .await
    }

    /// Create a crawl job with a scoped input queue and dedicated fetch
    /// workers, then seed the start URL.
    pub async fn create_crawl_task(
        &self,
        start_url: &str,
        site_id: &str,
        fetch_workers: usize,
    ) -> Result<String> {
        let job_id = format!("job-{}", &Uuid::new_v4().simple().to_string()[..8]);
        let input_queue = format!("task:{job_id}");

        let mut workers = Vec::with_capacity(fetch_workers);
        for _ in 0..fetch_workers.max(1) {
            workers.push(self.spawn_worker(Stage::Fetch, input_queue.clone())?);
        }

        self.queue
            .enqueue(&input_queue, PageEnvelope::seed(start_url, site_id), None)
            .await?;

        let job = CrawlJob {
            job_id: job_id.clone(),
            start_url: start_url.to_string(),
            site_id: site_id.to_string(),
            input_queue,
            state: "running".to_string(),
            started_at: Utc::now(),
            workers,
        };
        self.jobs.lock().await.insert(job_id.clone(), job);

        info!(job_id = %job_id, start_url, "crawl job created");
        Ok(job_id)
    }

    /// Stop a crawl job's workers and drain its scoped queue.
    pub async fn stop_task(&self, job_id: &str) -> Result<()> {
        let mut job = {
            let mut jobs = self.jobs.lock().await;
            jobs.remove(job_id)
                .ok_or_else(|| PipelineError::UnknownJob(job_id.to_string()))?
        };

        for worker in &job.workers {
            worker.token.cancel();
        }
        let deadline = Duration::from_secs(self.config.supervisor.drain_timeout_secs);
        for worker in job.workers.drain(..) {
            if tokio::time::timeout(deadline, worker.join).await.is_err() {
                warn!(worker_id = %worker.id, "job worker did not stop in time");
            }
        }

        self.queue.clear_queue(&job.input_queue).await?;
        job.state = "stopped".to_string();
        self.jobs.lock().await.insert(job_id.to_string(), job);

        info!(job_id = %job_id, "crawl job stopped");
        Ok(())
    }

    pub async fn get_task_status(&self, job_id: &str) -> Result<CrawlJobStatus> {
        let (job_id, start_url, site_id, state, started_at, input_queue, active, total) = {
            let jobs = self.jobs.lock().await;
            let job = jobs
                .get(job_id)
                .ok_or_else(|| PipelineError::UnknownJob(job_id.to_string()))?;
            (
                job.job_id.clone(),
                job.start_url.clone(),
                job.site_id.clone(),
                job.state.clone(),
                job.started_at,
                job.input_queue.clone(),
                job.workers.iter().filter(|w| w.is_active()).count(),
                job.workers.len(),
            )
        };
        let queue_metrics = self.queue.get_queue_metrics(&input_queue).await?;

        Ok(CrawlJobStatus {
            job_id,
            start_url,
            site_id,
            state,
            started_at,
            active_workers: active,
            total_workers: total,
            queue_metrics,
        })
    }

    pub async fn start_monitoring(&self) {
        self.monitor.start().await;
        self.monitoring_active.store(true, Ordering::SeqCst);
    }

    pub async fn stop_monitoring(&self) {
        self.monitor.stop().await;
        self.monitoring_active.store(false, Ordering::SeqCst);
    }

    /// Cooperative stop of everything the supervisor owns, bounded by the
    /// drain timeout, then forced termination.
    pub async fn shutdown(&self) {
        info!("shutting down pipeline");
        self.shutdown_token.cancel();
        self.stop_monitoring().await;

        if let Some(handle) = self.sweep_handle.lock().await.take() {
            let _ = handle.await;
        }

        let mut handles: Vec<WorkerHandle> = Vec::new();
        {
            let mut pools = self.pools.lock().await;
            for (_, mut pool) in pools.drain() {
                handles.append(&mut pool);
            }
        }
        {
            let mut jobs = self.jobs.lock().await;
            for job in jobs.values_mut() {
                handles.append(&mut job.workers);
                job.state = "stopped".to_string();
            }
        }

        let drain_timeout = Duration::from_secs(self.config.supervisor.drain_timeout_secs);
        let drained = tokio::time::timeout(
            drain_timeout,
            futures::future::join_all(handles.iter_mut().map(|handle| &mut handle.join)),
        )
        .await;
        if drained.is_err() {
            for handle in &handles {
                if !handle.join.is_finished() {
                    warn!(worker_id = %handle.id, "worker forced down after drain timeout");
                    handle.join.abort();
                }
            }
        }
        info!("pipeline shut down");
    }

    /// Read-only snapshot for the admin surface.
    pub async fn get_status(&self) -> Result<StatusSnapshot> {
        let configs = self.component_configs.lock().await.clone();

        let mut components = HashMap::new();
        let pool_info: Vec<(Stage, usize, usize, Vec<crate::pipeline::WorkerSnapshot>)> = {
            let pools = self.pools.lock().await;
            Stage::ALL
                .iter()
                .map(|stage| {
                    let empty = Vec::new();
                    let pool = pools.get(stage).unwrap_or(&empty);
                    (
                        *stage,
                        pool.len(),
                        pool.iter().filter(|h| h.is_active()).count(),
                        pool.iter().map(|h| h.state.snapshot()).collect(),
                    )
                })
                .collect()
        };

        for (stage, total, active, workers) in pool_info {
            let queue_metrics = self.queue.get_queue_metrics(stage.input_queue()).await?;
            components.insert(
                stage.as_str().to_string(),
                ComponentStatus {
                    stage,
                    total_workers: total,
                    active_workers: active,
                    status: if active > 0 { "running" } else { "stopped" }.to_string(),
                    config: configs.get(&stage).cloned().unwrap_or(serde_json::Value::Null),
                    queue_metrics,
                    workers,
                },
            );
        }

        let mut queues = HashMap::new();
        for queue_name in STANDARD_QUEUES {
            queues.insert(
                queue_name.to_string(),
                self.queue.get_queue_metrics(queue_name).await?,
            );
        }

        let job_ids: Vec<String> = self.jobs.lock().await.keys().cloned().collect();
        let mut jobs = HashMap::new();
        for job_id in job_ids {
            if let Ok(status) = self.get_task_status(&job_id).await {
                jobs.insert(job_id, status);
            }
        }

        let backend = self.queue.backend().server_stats().await?;
        let storage = self.store.stats().await?;

        Ok(StatusSnapshot {
            components,
            queues,
            jobs,
            backend,
            storage,
            monitoring: MonitoringStatus {
                is_active: self.monitoring_active.load(Ordering::SeqCst),
                interval_secs: self.config.monitor.check_interval_secs,
            },
            timestamp: Utc::now(),
        })
    }
}

/// Map a queue name back to the stage that leases from it.
fn stage_for_queue(queue_name: &str) -> Stage {
    if queue_name.starts_with("task:") {
        return Stage::Fetch;
    }
    match queue_name {
        "url" => Stage::Fetch,
        "crawl" => Stage::Clean,
        "clean" => Stage::Persist,
        _ => Stage::Index,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{HashEmbedder, MemoryVectorIndex};
    use crate::pipeline::fetcher::{FetchError, FetchedPage, PageFetcher};
    use crate::queue::backend::InMemoryBackend;
    use crate::queue::task::TaskStatus;
    use crate::storage::MemoryDocumentStore;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// Serves scripted bodies in order, regardless of URL.
    struct SequenceFetcher {
        bodies: std::sync::Mutex<VecDeque<String>>,
    }

    impl SequenceFetcher {
        fn new(bodies: &[&str]) -> Arc<Self> {
            Arc::new(SequenceFetcher {
                bodies: std::sync::Mutex::new(bodies.iter().map(|b| b.to_string()).collect()),
            })
        }
    }

    #[async_trait]
    impl PageFetcher for SequenceFetcher {
        async fn fetch(&self, url: &str) -> std::result::Result<FetchedPage, FetchError> {
            let body = self
                .bodies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| "<p>default</p>".to_string());
            Ok(FetchedPage {
                final_url: url.to_string(),
                status_code: 200,
                headers: HashMap::new(),
                body: body.into_bytes(),
                content_type: Some("text/html".to_string()),
            })
        }
    }

    struct Fixture {
        supervisor: Arc<Supervisor>,
        queue: Arc<QueueManager>,
        store: Arc<MemoryDocumentStore>,
        index: Arc<MemoryVectorIndex>,
    }

    fn test_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.backend.backend_type = "memory".to_string();
        for stage in Stage::ALL {
            let settings = match stage {
                Stage::Fetch => &mut config.stages.fetch,
                Stage::Clean => &mut config.stages.clean,
                Stage::Persist => &mut config.stages.persist,
                Stage::Index => &mut config.stages.index,
            };
            settings.poll_timeout_ms = 50;
        }
        config.supervisor.sweep_interval_secs = 3600;
        config.supervisor.stall_timeout_secs = 0;
        config.supervisor.scale_timeout_secs = 5;
        config.supervisor.drain_timeout_secs = 5;
        config
    }

    fn build(fetcher: Arc<dyn PageFetcher>, config: PipelineConfig) -> Fixture {
        let queue = Arc::new(QueueManager::new(Arc::new(InMemoryBackend::new())));
        let store = Arc::new(MemoryDocumentStore::new());
        let index = Arc::new(MemoryVectorIndex::new());
        let factory = HandlerFactory::new(
            config.clone(),
            queue.clone(),
            fetcher,
            store.clone(),
            index.clone(),
            Arc::new(HashEmbedder::new(8)),
        );
        let supervisor = Supervisor::new(config, queue.clone(), factory, store.clone());
        Fixture {
            supervisor,
            queue,
            store,
            index,
        }
    }

    async fn wait_for_completed(queue: &QueueManager, queue_name: &str, count: usize) -> bool {
        for _ in 0..200 {
            let metrics = queue.get_queue_metrics(queue_name).await.unwrap();
            if metrics.completed >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        false
    }

    #[tokio::test]
    async fn pipeline_processes_seed_dedup_and_edit() {
        // Three fetches of the same URL: identical bytes twice, then a
        // mutation.
        let fetcher = SequenceFetcher::new(&["<p>alpha</p>", "<p>alpha</p>", "<p>beta</p>"]);
        let f = build(fetcher, test_config());

        f.supervisor.start_workers(1, 1, 1, 1).await.unwrap();
        f.supervisor
            .add_url_to_queue("https://example.com/", "demo")
            .await
            .unwrap();

        // Seed flows through all four stages exactly once.
        assert!(wait_for_completed(&f.queue, "index", 1).await);
        for queue_name in ["url", "crawl", "clean", "index"] {
            let metrics = f.queue.get_queue_metrics(queue_name).await.unwrap();
            assert_eq!(metrics.completed, 1, "queue {queue_name}");
        }
        let stored = f
            .store
            .find_by_url("https://example.com/")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(f.index.doc_keys().len(), 1);

        // Re-seed with identical bytes: the persister drops the envelope,
        // the indexer never sees it.
        f.supervisor
            .add_url_to_queue("https://example.com/", "demo")
            .await
            .unwrap();
        assert!(wait_for_completed(&f.queue, "clean", 2).await);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(f.queue.get_queue_metrics("index").await.unwrap().completed, 1);
        assert_eq!(f.store.stats().await.unwrap().documents, 1);

        // Re-seed with mutated bytes: version 2, edit operation, both
        // hashes indexed.
        f.supervisor
            .add_url_to_queue("https://example.com/", "demo")
            .await
            .unwrap();
        assert!(wait_for_completed(&f.queue, "index", 2).await);
        let stored = f
            .store
            .find_by_url("https://example.com/")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(f.index.doc_keys().len(), 2);

        f.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn stall_sweep_requeues_then_fails_at_ceiling() {
        let mut config = test_config();
        config.stages.persist.max_retries = 1;
        let f = build(SequenceFetcher::new(&[]), config);

        // Simulate a worker crash: lease a task and never complete it.
        let mut envelope = PageEnvelope::seed("https://example.com/stuck", "demo");
        envelope.content_hash = Some("h1".to_string());
        let task_id = f.queue.enqueue("clean", envelope, None).await.unwrap();
        f.queue.dequeue("clean", false, Duration::ZERO).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(f.supervisor.sweep_stalled_once().await.unwrap(), 1);

        let record = f.queue.get_task_status(&task_id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.retry_count, 1);

        // Lease again and stall again: the retry ceiling (1) is reached, so
        // the sweep fails the task terminally.
        f.queue.dequeue("clean", false, Duration::ZERO).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(f.supervisor.sweep_stalled_once().await.unwrap(), 1);

        let record = f.queue.get_task_status(&task_id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn scaling_preserves_metrics_counters() {
        let f = build(SequenceFetcher::new(&[]), test_config());
        f.supervisor.start_workers(0, 0, 1, 0).await.unwrap();

        let mut envelope = PageEnvelope::seed("https://example.com/doc", "demo");
        envelope.content_hash = Some("h1".to_string());
        envelope.clean_content = Some("# body".to_string());
        f.queue.enqueue("clean", envelope, None).await.unwrap();
        assert!(wait_for_completed(&f.queue, "clean", 1).await);

        f.supervisor.scale(Stage::Persist, 0).await.unwrap();
        let status = f.supervisor.get_status().await.unwrap();
        assert_eq!(status.components["persist"].total_workers, 0);

        f.supervisor.scale(Stage::Persist, 3).await.unwrap();
        let status = f.supervisor.get_status().await.unwrap();
        assert_eq!(status.components["persist"].total_workers, 3);
        // Counters survived the scale cycle.
        assert_eq!(status.components["persist"].queue_metrics.completed, 1);

        f.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn restart_replaces_a_worker() {
        let f = build(SequenceFetcher::new(&[]), test_config());
        f.supervisor.start_workers(0, 1, 0, 0).await.unwrap();

        let status = f.supervisor.get_status().await.unwrap();
        let old_id = status.components["clean"].workers[0].worker_id.clone();

        let new_id = f.supervisor.restart(&old_id).await.unwrap();
        assert_ne!(new_id, old_id);

        let status = f.supervisor.get_status().await.unwrap();
        assert_eq!(status.components["clean"].total_workers, 1);
        assert_eq!(status.components["clean"].workers[0].worker_id, new_id);

        let err = f.supervisor.restart("no-such-worker").await.unwrap_err();
        assert!(matches!(err, PipelineError::UnknownWorker(_)));

        f.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn dead_worker_is_respawned() {
        let f = build(SequenceFetcher::new(&[]), test_config());
        f.supervisor.start_workers(0, 0, 0, 1).await.unwrap();

        {
            let pools = f.supervisor.pools.lock().await;
            pools[&Stage::Index][0].join.abort();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(f.supervisor.reap_dead_workers_once().await, 1);
        let status = f.supervisor.get_status().await.unwrap();
        assert_eq!(status.components["index"].total_workers, 1);
        assert!(status.components["index"].active_workers >= 1);

        f.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn initialize_components_rejects_running_pool() {
        let f = build(SequenceFetcher::new(&[]), test_config());
        f.supervisor
            .initialize_components(
                serde_json::json!({"timeout": 10}),
                serde_json::Value::Null,
                serde_json::Value::Null,
                serde_json::Value::Null,
            )
            .await
            .unwrap();

        f.supervisor.start_workers(0, 1, 0, 0).await.unwrap();
        let err = f
            .supervisor
            .initialize_components(
                serde_json::Value::Null,
                serde_json::Value::Null,
                serde_json::Value::Null,
                serde_json::Value::Null,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyRunning));

        f.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn crawl_job_runs_on_scoped_queue() {
        let fetcher = SequenceFetcher::new(&["<p>job page</p>"]);
        let f = build(fetcher, test_config());

        let job_id = f
            .supervisor
            .create_crawl_task("https://example.com/", "demo", 1)
            .await
            .unwrap();

        let scoped_queue = format!("task:{job_id}");
        assert!(wait_for_completed(&f.queue, &scoped_queue, 1).await);
        // Fetched envelope landed on the shared crawl queue.
        assert_eq!(f.queue.get_queue_length("crawl").await.unwrap(), 1);

        let status = f.supervisor.get_task_status(&job_id).await.unwrap();
        assert_eq!(status.state, "running");
        assert_eq!(status.total_workers, 1);

        f.supervisor.stop_task(&job_id).await.unwrap();
        let status = f.supervisor.get_task_status(&job_id).await.unwrap();
        assert_eq!(status.state, "stopped");
        assert_eq!(status.active_workers, 0);

        f.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn delete_url_seeds_the_persist_stage() {
        let f = build(SequenceFetcher::new(&[]), test_config());
        f.supervisor
            .delete_url("https://example.com/gone", "demo")
            .await
            .unwrap();

        let task = f
            .queue
            .dequeue("clean", false, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            task.data.index_operation,
            Some(crate::pipeline::IndexOperation::Delete)
        );
        assert_eq!(task.data.clean_content.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn status_snapshot_covers_all_surfaces() {
        let f = build(SequenceFetcher::new(&[]), test_config());
        f.supervisor.start_workers(1, 1, 1, 1).await.unwrap();
        f.supervisor.start_monitoring().await;

        let status = f.supervisor.get_status().await.unwrap();
        assert_eq!(status.components.len(), 4);
        assert_eq!(status.queues.len(), 4);
        assert_eq!(status.backend.backend, "memory");
        assert!(status.monitoring.is_active);

        f.supervisor.shutdown().await;
        let status = f.supervisor.get_status().await.unwrap();
        assert!(!status.monitoring.is_active);
        assert_eq!(status.components["fetch"].total_workers, 0);
    }
}
