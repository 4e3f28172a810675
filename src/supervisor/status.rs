use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

use crate::pipeline::{Stage, WorkerSnapshot};
use crate::queue::backend::BackendServerStats;
use crate::queue::task::QueueMetrics;
use crate::storage::StorageStats;

/// Per-stage view: worker pool counts plus the metrics of the stage's input
/// queue.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentStatus {
    pub stage: Stage,
    pub total_workers: usize,
    pub active_workers: usize,
    pub status: String,
    pub config: serde_json::Value,
    pub queue_metrics: QueueMetrics,
    pub workers: Vec<WorkerSnapshot>,
}

/// Point-in-time view of one crawl job and its scoped queue.
#[derive(Debug, Clone, Serialize)]
pub struct CrawlJobStatus {
    pub job_id: String,
    pub start_url: String,
    pub site_id: String,
    pub state: String,
    pub started_at: DateTime<Utc>,
    pub active_workers: usize,
    pub total_workers: usize,
    pub queue_metrics: QueueMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitoringStatus {
    pub is_active: bool,
    pub interval_secs: u64,
}

/// Read-only snapshot consumed by the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub components: HashMap<String, ComponentStatus>,
    pub queues: HashMap<String, QueueMetrics>,
    pub jobs: HashMap<String, CrawlJobStatus>,
    pub backend: BackendServerStats,
    pub storage: StorageStats,
    pub monitoring: MonitoringStatus,
    pub timestamp: DateTime<Utc>,
}
