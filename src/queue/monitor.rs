use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::manager::QueueManager;
use super::task::QueueMetrics;
use crate::cli::config::MonitorSettings;
use crate::error::Result;

/// Derived health of one queue at a sampling tick.
#[derive(Debug, Clone, Serialize)]
pub struct QueueHealthStatus {
    pub queue_name: String,
    pub is_healthy: bool,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub avg_processing_time: f64,
    pub last_activity: Option<DateTime<Utc>>,
    pub stalled: bool,
    pub backlog_size_warning: bool,
    pub error_rate_warning: bool,
    pub message: String,
}

type AlertCallback = Box<dyn Fn(&QueueHealthStatus) + Send + Sync>;

/// Maximum number of metric samples retained per queue.
const MAX_HISTORY_SIZE: usize = 100;

/// Samples queue health on a fixed interval and dispatches alerts.
///
/// A queue is stalled when its last activity is older than the activity
/// timeout while work is still outstanding; backlog and error-rate warnings
/// come from the configured thresholds. Alert callbacks must not block; the
/// monitor keeps running regardless of what they do.
pub struct QueueMonitor {
    queue: Arc<QueueManager>,
    queue_names: Vec<String>,
    settings: MonitorSettings,
    health: Arc<Mutex<HashMap<String, QueueHealthStatus>>>,
    history: Arc<Mutex<HashMap<String, Vec<QueueMetrics>>>>,
    callbacks: Arc<Mutex<Vec<AlertCallback>>>,
    token: Mutex<CancellationToken>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl QueueMonitor {
    pub fn new(queue: Arc<QueueManager>, queue_names: Vec<String>, settings: MonitorSettings) -> Self {
        QueueMonitor {
            queue,
            queue_names,
            settings,
            health: Arc::new(Mutex::new(HashMap::new())),
            history: Arc::new(Mutex::new(HashMap::new())),
            callbacks: Arc::new(Mutex::new(Vec::new())),
            token: Mutex::new(CancellationToken::new()),
            handle: Mutex::new(None),
        }
    }

    /// Register a callback invoked for every unhealthy sample.
    pub async fn add_alert_callback<F>(&self, callback: F)
    where
        F: Fn(&QueueHealthStatus) + Send + Sync + 'static,
    {
        self.callbacks.lock().await.push(Box::new(callback));
    }

    /// Start the sampling loop.
    pub async fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            warn!("queue monitor already running");
            return;
        }

        let monitor = self.clone();
        let token = CancellationToken::new();
        *self.token.lock().await = token.clone();
        let interval = Duration::from_secs(monitor.settings.check_interval_secs);
        *handle = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(err) = monitor.check_queues_once().await {
                    error!(error = %err, "queue health check failed");
                }
            }
            debug!("queue monitor loop exited");
        }));
    }

    /// Halt the sampling loop at the next interval boundary.
    pub async fn stop(&self) {
        self.token.lock().await.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }

    /// One sampling pass over all monitored queues.
    pub async fn check_queues_once(&self) -> Result<()> {
        for queue_name in &self.queue_names {
            match self.check_queue_health(queue_name).await {
                Ok(health) => {
                    if !health.is_healthy {
                        warn!(queue = %queue_name, message = %health.message, "queue unhealthy");
                        let callbacks = self.callbacks.lock().await;
                        for callback in callbacks.iter() {
                            callback(&health);
                        }
                    }
                    self.health
                        .lock()
                        .await
                        .insert(queue_name.clone(), health);
                }
                Err(err) => error!(queue = %queue_name, error = %err, "health sample failed"),
            }
        }
        Ok(())
    }

    async fn check_queue_health(&self, queue_name: &str) -> Result<QueueHealthStatus> {
        let metrics = self.queue.get_queue_metrics(queue_name).await?;

        let mut history = self.history.lock().await;
        let samples = history.entry(queue_name.to_string()).or_default();
        samples.push(metrics.clone());
        if samples.len() > MAX_HISTORY_SIZE {
            samples.remove(0);
        }
        // Error rate over the retained window: failures and completions that
        // happened since the oldest sample, falling back to lifetime totals.
        let (window_completed, window_failed) = if samples.len() >= 2 {
            let oldest = &samples[0];
            (
                metrics.completed.saturating_sub(oldest.completed),
                metrics.failed.saturating_sub(oldest.failed),
            )
        } else {
            (metrics.completed, metrics.failed)
        };
        drop(history);

        let mut health = QueueHealthStatus {
            queue_name: queue_name.to_string(),
            is_healthy: true,
            pending: metrics.pending,
            processing: metrics.processing,
            completed: metrics.completed,
            failed: metrics.failed,
            avg_processing_time: metrics.avg_processing_time,
            last_activity: metrics.last_activity,
            stalled: false,
            backlog_size_warning: false,
            error_rate_warning: false,
            message: String::new(),
        };

        if metrics.pending > self.settings.max_pending_threshold {
            health.backlog_size_warning = true;
            health.is_healthy = false;
            health.message.push_str(&format!(
                "backlog of {} exceeds threshold {}. ",
                metrics.pending, self.settings.max_pending_threshold
            ));
        }

        let finished = window_completed + window_failed;
        if finished > 0 {
            let error_rate = window_failed as f64 / finished as f64;
            if error_rate > self.settings.max_error_rate {
                health.error_rate_warning = true;
                health.is_healthy = false;
                health.message.push_str(&format!(
                    "error rate {:.1}% exceeds {:.1}%. ",
                    error_rate * 100.0,
                    self.settings.max_error_rate * 100.0
                ));
            }
        }

        let outstanding = metrics.pending + metrics.processing;
        if outstanding > 0 {
            let idle_secs = metrics
                .last_activity
                .map(|at| (Utc::now() - at).num_seconds())
                .unwrap_or(i64::MAX);
            if idle_secs > self.settings.activity_timeout_secs as i64 {
                health.stalled = true;
                health.is_healthy = false;
                health.message.push_str(&format!(
                    "no queue activity for {idle_secs}s with {outstanding} tasks outstanding. "
                ));
            }
        }

        Ok(health)
    }

    pub async fn get_queue_health(&self, queue_name: &str) -> Option<QueueHealthStatus> {
        self.health.lock().await.get(queue_name).cloned()
    }

    pub async fn get_all_queue_health(&self) -> HashMap<String, QueueHealthStatus> {
        self.health.lock().await.clone()
    }

    pub async fn get_metrics_history(&self, queue_name: &str) -> Vec<QueueMetrics> {
        self.history
            .lock()
            .await
            .get(queue_name)
            .cloned()
            .unwrap_or_default()
    }

    /// Aggregate report across all monitored queues.
    pub async fn get_summary_report(&self) -> MonitorSummary {
        let health = self.health.lock().await;
        let mut summary = MonitorSummary {
            timestamp: Utc::now(),
            total_queues: self.queue_names.len(),
            unhealthy_queues: 0,
            unhealthy_names: Vec::new(),
            total_pending: 0,
            total_processing: 0,
            total_failed: 0,
        };
        for status in health.values() {
            summary.total_pending += status.pending;
            summary.total_processing += status.processing;
            summary.total_failed += status.failed;
            if !status.is_healthy {
                summary.unhealthy_queues += 1;
                summary.unhealthy_names.push(status.queue_name.clone());
            }
        }
        summary
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorSummary {
    pub timestamp: DateTime<Utc>,
    pub total_queues: usize,
    pub unhealthy_queues: usize,
    pub unhealthy_names: Vec<String>,
    pub total_pending: usize,
    pub total_processing: usize,
    pub total_failed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::envelope::PageEnvelope;
    use crate::queue::backend::InMemoryBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings() -> MonitorSettings {
        MonitorSettings {
            check_interval_secs: 1,
            max_pending_threshold: 3,
            max_error_rate: 0.25,
            activity_timeout_secs: 300,
        }
    }

    fn monitor(queue: Arc<QueueManager>) -> Arc<QueueMonitor> {
        Arc::new(QueueMonitor::new(
            queue,
            vec!["url".to_string()],
            settings(),
        ))
    }

    #[tokio::test]
    async fn healthy_queue_produces_no_alert() {
        let queue = Arc::new(QueueManager::new(Arc::new(InMemoryBackend::new())));
        queue
            .enqueue("url", PageEnvelope::seed("https://example.com/", "demo"), None)
            .await
            .unwrap();

        let monitor = monitor(queue);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        monitor
            .add_alert_callback(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        monitor.check_queues_once().await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        let health = monitor.get_queue_health("url").await.unwrap();
        assert!(health.is_healthy);
    }

    #[tokio::test]
    async fn backlog_over_threshold_raises_warning() {
        let queue = Arc::new(QueueManager::new(Arc::new(InMemoryBackend::new())));
        for i in 0..5 {
            queue
                .enqueue(
                    "url",
                    PageEnvelope::seed(format!("https://example.com/{i}"), "demo"),
                    None,
                )
                .await
                .unwrap();
        }

        let monitor = monitor(queue);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        monitor
            .add_alert_callback(move |health| {
                assert!(health.backlog_size_warning);
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        monitor.check_queues_once().await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn high_error_rate_raises_warning() {
        let queue = Arc::new(QueueManager::new(Arc::new(InMemoryBackend::new())));
        for i in 0..3 {
            let id = queue
                .enqueue(
                    "url",
                    PageEnvelope::seed(format!("https://example.com/{i}"), "demo"),
                    None,
                )
                .await
                .unwrap();
            queue
                .dequeue("url", false, Duration::ZERO)
                .await
                .unwrap();
            if i == 0 {
                queue.complete_task("url", &id, None).await.unwrap();
            } else {
                queue.fail_task("url", &id, "boom", false).await.unwrap();
            }
        }

        let monitor = monitor(queue);
        monitor.check_queues_once().await.unwrap();
        let health = monitor.get_queue_health("url").await.unwrap();
        assert!(health.error_rate_warning);
        assert!(!health.is_healthy);
    }

    #[tokio::test]
    async fn idle_queue_with_backlog_is_stalled() {
        let queue = Arc::new(QueueManager::new(Arc::new(InMemoryBackend::new())));
        queue
            .enqueue("url", PageEnvelope::seed("https://example.com/", "demo"), None)
            .await
            .unwrap();

        let settings = MonitorSettings {
            activity_timeout_secs: 0,
            ..settings()
        };
        let monitor = Arc::new(QueueMonitor::new(
            queue,
            vec!["url".to_string()],
            settings,
        ));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        monitor.check_queues_once().await.unwrap();
        let health = monitor.get_queue_health("url").await.unwrap();
        assert!(health.stalled);
    }

    #[tokio::test]
    async fn summary_counts_unhealthy_queues() {
        let queue = Arc::new(QueueManager::new(Arc::new(InMemoryBackend::new())));
        for i in 0..5 {
            queue
                .enqueue(
                    "url",
                    PageEnvelope::seed(format!("https://example.com/{i}"), "demo"),
                    None,
                )
                .await
                .unwrap();
        }
        let monitor = monitor(queue);
        monitor.check_queues_once().await.unwrap();

        let summary = monitor.get_summary_report().await;
        assert_eq!(summary.total_queues, 1);
        assert_eq!(summary.unhealthy_queues, 1);
        assert_eq!(summary.total_pending, 5);
    }

    #[tokio::test]
    async fn metrics_history_is_retained_per_sample() {
        let queue = Arc::new(QueueManager::new(Arc::new(InMemoryBackend::new())));
        let monitor = monitor(queue);

        monitor.check_queues_once().await.unwrap();
        monitor.check_queues_once().await.unwrap();

        let history = monitor.get_metrics_history("url").await;
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn stop_halts_the_sampling_loop() {
        let queue = Arc::new(QueueManager::new(Arc::new(InMemoryBackend::new())));
        let monitor = monitor(queue);
        monitor.start().await;
        monitor.stop().await;
        assert!(monitor.handle.lock().await.is_none());
    }
}
