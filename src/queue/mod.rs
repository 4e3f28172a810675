pub mod backend;
pub mod manager;
pub mod monitor;
pub mod redis_backend;
pub mod task;

// Re-export common types
pub use backend::{BackendServerStats, InMemoryBackend, QueueBackend, QueueBackendFactory};
pub use manager::{QueueManager, STANDARD_QUEUES};
pub use monitor::{QueueHealthStatus, QueueMonitor};
pub use task::{QueueMetrics, TaskRecord, TaskStatus};
