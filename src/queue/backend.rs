use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::cli::config::BackendSettings;
use crate::error::{PipelineError, Result};

/// Server-side statistics reported by the queue backend, surfaced through
/// the supervisor status snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendServerStats {
    pub backend: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub used_memory: String,
    pub total_keys: u64,
    pub connected_clients: u64,
}

/// Key-value primitives the queue manager builds on.
///
/// The contract mirrors the subset of Redis the pipeline needs: atomic list
/// push/pop with blocking pop, set add/remove, hash counters and plain
/// string keys. List push inserts at the head and pop removes from the tail,
/// so a list used as a queue is FIFO.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn list_push(&self, key: &str, value: &str) -> Result<()>;
    async fn list_pop(&self, key: &str) -> Result<Option<String>>;
    /// Pop from the tail, waiting up to `timeout` for an item.
    async fn list_pop_blocking(&self, key: &str, timeout: Duration) -> Result<Option<String>>;
    async fn list_len(&self, key: &str) -> Result<usize>;
    /// Inclusive range with Redis index semantics (negative counts from the
    /// tail; `(0, -1)` is the whole list).
    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;
    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<()>;

    async fn set_add(&self, key: &str, member: &str) -> Result<()>;
    async fn set_remove(&self, key: &str, member: &str) -> Result<bool>;
    async fn set_members(&self, key: &str) -> Result<Vec<String>>;
    async fn set_len(&self, key: &str) -> Result<usize>;

    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn hash_incr(&self, key: &str, field: &str, by: i64) -> Result<i64>;
    async fn hash_incr_float(&self, key: &str, field: &str, by: f64) -> Result<f64>;
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()>;
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    async fn delete(&self, keys: &[String]) -> Result<()>;

    async fn server_stats(&self) -> Result<BackendServerStats>;
}

/// Factory for creating a queue backend from settings.
pub struct QueueBackendFactory;

impl QueueBackendFactory {
    pub async fn create(settings: &BackendSettings) -> Result<Arc<dyn QueueBackend>> {
        match settings.backend_type.as_str() {
            "redis" => {
                let backend =
                    super::redis_backend::RedisBackend::connect(&settings.redis_url).await?;
                Ok(Arc::new(backend))
            }
            "memory" => Ok(Arc::new(InMemoryBackend::new())),
            other => Err(PipelineError::Config(format!(
                "unsupported queue backend type: {other}"
            ))),
        }
    }
}

#[derive(Default)]
struct MemoryState {
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, HashSet<String>>,
    hashes: HashMap<String, HashMap<String, String>>,
    strings: HashMap<String, String>,
}

impl MemoryState {
    fn key_count(&self) -> u64 {
        (self.lists.len() + self.sets.len() + self.hashes.len() + self.strings.len()) as u64
    }
}

/// In-process backend with the same observable semantics as the Redis one.
///
/// Used by tests and by single-process runs that have no Redis available.
pub struct InMemoryBackend {
    state: Arc<Mutex<MemoryState>>,
    push_notify: Arc<Notify>,
    started: Instant,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        InMemoryBackend {
            state: Arc::new(Mutex::new(MemoryState::default())),
            push_notify: Arc::new(Notify::new()),
            started: Instant::now(),
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Translate a Redis-style index pair into a concrete `[start, end]` range.
fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let len = len as i64;
    let mut start = if start < 0 { len + start } else { start };
    let mut stop = if stop < 0 { len + stop } else { stop };
    start = start.max(0);
    stop = stop.min(len - 1);
    if start > stop {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl QueueBackend for InMemoryBackend {
    async fn list_push(&self, key: &str, value: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .lists
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
        drop(state);
        self.push_notify.notify_waiters();
        Ok(())
    }

    async fn list_pop(&self, key: &str) -> Result<Option<String>> {
        let mut state = self.state.lock().await;
        Ok(state.lists.get_mut(key).and_then(|list| list.pop_back()))
    }

    async fn list_pop_blocking(&self, key: &str, timeout: Duration) -> Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(value) = self.list_pop(key).await? {
                return Ok(Some(value));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            // Re-check on push notification or a short tick, whichever
            // comes first; the tick covers notifications that raced ahead
            // of this waiter.
            let wait = (deadline - now).min(Duration::from_millis(50));
            tokio::select! {
                _ = self.push_notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn list_len(&self, key: &str) -> Result<usize> {
        let state = self.state.lock().await;
        Ok(state.lists.get(key).map(|l| l.len()).unwrap_or(0))
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        let Some(list) = state.lists.get(key) else {
            return Ok(Vec::new());
        };
        match resolve_range(list.len(), start, stop) {
            Some((from, to)) => Ok(list.iter().skip(from).take(to - from + 1).cloned().collect()),
            None => Ok(Vec::new()),
        }
    }

    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(list) = state.lists.get_mut(key) {
            match resolve_range(list.len(), start, stop) {
                Some((from, to)) => {
                    let kept: VecDeque<String> =
                        list.iter().skip(from).take(to - from + 1).cloned().collect();
                    *list = kept;
                }
                None => list.clear(),
            }
        }
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(state
            .sets
            .get_mut(key)
            .map(|set| set.remove(member))
            .unwrap_or(false))
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        Ok(state
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_len(&self, key: &str) -> Result<usize> {
        let state = self.state.lock().await;
        Ok(state.sets.get(key).map(|set| set.len()).unwrap_or(0))
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let state = self.state.lock().await;
        Ok(state.strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.strings.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_incr(&self, key: &str, field: &str, by: i64) -> Result<i64> {
        let mut state = self.state.lock().await;
        let entry = state
            .hashes
            .entry(key.to_string())
            .or_default()
            .entry(field.to_string())
            .or_insert_with(|| "0".to_string());
        let current: i64 = entry.parse().unwrap_or(0);
        let next = current + by;
        *entry = next.to_string();
        Ok(next)
    }

    async fn hash_incr_float(&self, key: &str, field: &str, by: f64) -> Result<f64> {
        let mut state = self.state.lock().await;
        let entry = state
            .hashes
            .entry(key.to_string())
            .or_default()
            .entry(field.to_string())
            .or_insert_with(|| "0".to_string());
        let current: f64 = entry.parse().unwrap_or(0.0);
        let next = current + by;
        *entry = next.to_string();
        Ok(next)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let state = self.state.lock().await;
        Ok(state.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        let mut state = self.state.lock().await;
        for key in keys {
            state.lists.remove(key);
            state.sets.remove(key);
            state.hashes.remove(key);
            state.strings.remove(key);
        }
        debug!(count = keys.len(), "deleted backend keys");
        Ok(())
    }

    async fn server_stats(&self) -> Result<BackendServerStats> {
        let state = self.state.lock().await;
        Ok(BackendServerStats {
            backend: "memory".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.started.elapsed().as_secs(),
            used_memory: "n/a".to_string(),
            total_keys: state.key_count(),
            connected_clients: 1,
        })
    }
}
