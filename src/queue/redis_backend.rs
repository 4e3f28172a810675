use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, Client};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use super::backend::{BackendServerStats, QueueBackend};
use crate::error::Result;

/// Redis implementation of the queue backend.
pub struct RedisBackend {
    client: Client,
    conn_pool: Arc<Mutex<MultiplexedConnection>>,
}

impl RedisBackend {
    /// Connect to Redis at the given URL.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        debug!(url = redis_url, "connected to redis queue backend");

        Ok(Self {
            client,
            conn_pool: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl QueueBackend for RedisBackend {
    async fn list_push(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn_pool.lock().await;
        redis::cmd("LPUSH")
            .arg(key)
            .arg(value)
            .query_async::<_, ()>(&mut *conn)
            .await?;
        Ok(())
    }

    async fn list_pop(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn_pool.lock().await;
        let value: Option<String> = redis::cmd("RPOP").arg(key).query_async(&mut *conn).await?;
        Ok(value)
    }

    async fn list_pop_blocking(&self, key: &str, timeout: Duration) -> Result<Option<String>> {
        // BRPOP holds the shared connection for its full wait, so it runs on
        // a dedicated connection instead of the multiplexed pool.
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let result: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(key)
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await?;
        Ok(result.map(|(_, value)| value))
    }

    async fn list_len(&self, key: &str) -> Result<usize> {
        let mut conn = self.conn_pool.lock().await;
        let len: usize = redis::cmd("LLEN").arg(key).query_async(&mut *conn).await?;
        Ok(len)
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let mut conn = self.conn_pool.lock().await;
        let values: Vec<String> = redis::cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut *conn)
            .await?;
        Ok(values)
    }

    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        let mut conn = self.conn_pool.lock().await;
        redis::cmd("LTRIM")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async::<_, ()>(&mut *conn)
            .await?;
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn_pool.lock().await;
        redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async::<_, ()>(&mut *conn)
            .await?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn_pool.lock().await;
        let removed: u64 = redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async(&mut *conn)
            .await?;
        Ok(removed > 0)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn_pool.lock().await;
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut *conn)
            .await?;
        Ok(members)
    }

    async fn set_len(&self, key: &str) -> Result<usize> {
        let mut conn = self.conn_pool.lock().await;
        let len: usize = redis::cmd("SCARD").arg(key).query_async(&mut *conn).await?;
        Ok(len)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn_pool.lock().await;
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut *conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn_pool.lock().await;
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async::<_, ()>(&mut *conn)
            .await?;
        Ok(())
    }

    async fn hash_incr(&self, key: &str, field: &str, by: i64) -> Result<i64> {
        let mut conn = self.conn_pool.lock().await;
        let value: i64 = redis::cmd("HINCRBY")
            .arg(key)
            .arg(field)
            .arg(by)
            .query_async(&mut *conn)
            .await?;
        Ok(value)
    }

    async fn hash_incr_float(&self, key: &str, field: &str, by: f64) -> Result<f64> {
        let mut conn = self.conn_pool.lock().await;
        let value: f64 = redis::cmd("HINCRBYFLOAT")
            .arg(key)
            .arg(field)
            .arg(by)
            .query_async(&mut *conn)
            .await?;
        Ok(value)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn_pool.lock().await;
        redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async::<_, ()>(&mut *conn)
            .await?;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn_pool.lock().await;
        let all: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut *conn)
            .await?;
        Ok(all)
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn_pool.lock().await;
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(key);
        }
        cmd.query_async::<_, ()>(&mut *conn).await?;
        Ok(())
    }

    async fn server_stats(&self) -> Result<BackendServerStats> {
        let mut conn = self.conn_pool.lock().await;
        let info: String = redis::cmd("INFO").query_async(&mut *conn).await?;
        let total_keys: u64 = redis::cmd("DBSIZE").query_async(&mut *conn).await?;

        let field = |name: &str| -> String {
            info.lines()
                .find_map(|line| line.strip_prefix(&format!("{name}:")))
                .map(|v| v.trim().to_string())
                .unwrap_or_default()
        };

        Ok(BackendServerStats {
            backend: "redis".to_string(),
            version: field("redis_version"),
            uptime_seconds: field("uptime_in_seconds").parse().unwrap_or(0),
            used_memory: field("used_memory_human"),
            total_keys,
            connected_clients: field("connected_clients").parse().unwrap_or(0),
        })
    }
}
