//! Pipelined key/value sink.
//!
//! Commands are buffered and dispatched as a single Redis pipeline either
//! when `pipeline_size` commands are queued or `flush_interval_ms` elapses.
//! Cache data is ephemeral by design: a failed pipeline is never retried,
//! just counted and logged.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{error, warn};

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub url: String,
    pub pipeline_size: usize,
    pub flush_interval_ms: u64,
    /// Approximate MAXLEN for XADD streams.
    pub stream_maxlen: usize,
    pub command_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1/".into(),
            pipeline_size: 200,
            flush_interval_ms: 50,
            stream_maxlen: 1_000,
            command_timeout: Duration::from_secs(3),
        }
    }
}

/// One queued write. `ttl = None` means the key never expires — several
/// logical stores are intentionally TTL-less.
#[derive(Debug, Clone)]
pub enum CacheCommand {
    HSet {
        key: String,
        fields: Vec<(String, String)>,
        ttl: Option<Duration>,
    },
    XAdd {
        key: String,
        fields: Vec<(String, String)>,
    },
}

#[derive(Debug, Default)]
pub struct CacheCounters {
    pub written: AtomicU64,
    pub flushed: AtomicU64,
    pub flush_failed: AtomicU64,
}

impl CacheCounters {
    pub fn pending(&self) -> u64 {
        self.written
            .load(Ordering::Relaxed)
            .saturating_sub(self.flushed.load(Ordering::Relaxed))
    }
}

struct Inner {
    config: CacheConfig,
    conn: Mutex<Option<ConnectionManager>>,
    queue: Mutex<(Vec<CacheCommand>, Option<Instant>)>,
    counters: CacheCounters,
}

/// Pipelined cache writer. Cheap to clone.
#[derive(Clone)]
pub struct CacheWriter {
    inner: Arc<Inner>,
}

impl CacheWriter {
    pub fn new(config: CacheConfig) -> Self {
        let writer = Self {
            inner: Arc::new(Inner {
                config,
                conn: Mutex::new(None),
                queue: Mutex::new((Vec::new(), None)),
                counters: CacheCounters::default(),
            }),
        };
        writer.clone().spawn_flush_loop();
        writer
    }

    pub fn counters(&self) -> &CacheCounters {
        &self.inner.counters
    }

    /// Enqueue a command. Never suspends — the queue is drained on its own
    /// timer/size threshold by the flush loop.
    pub fn enqueue(&self, command: CacheCommand) {
        self.inner.counters.written.fetch_add(1, Ordering::Relaxed);
        let mut queue = self.inner.queue.lock();
        if queue.1.is_none() {
            queue.1 = Some(Instant::now());
        }
        queue.0.push(command);
    }

    pub async fn flush_now(&self) {
        self.flush().await;
    }

    fn spawn_flush_loop(self) {
        tokio::spawn(async move {
            let tick = Duration::from_millis(5);
            loop {
                tokio::time::sleep(tick).await;
                if self.is_due() {
                    self.flush().await;
                }
            }
        });
    }

    fn is_due(&self) -> bool {
        let queue = self.inner.queue.lock();
        if queue.0.is_empty() {
            return false;
        }
        if queue.0.len() >= self.inner.config.pipeline_size {
            return true;
        }
        match queue.1 {
            Some(opened_at) => {
                opened_at.elapsed() >= Duration::from_millis(self.inner.config.flush_interval_ms)
            }
            None => false,
        }
    }

    async fn flush(&self) {
        let batch = {
            let mut queue = self.inner.queue.lock();
            if queue.0.is_empty() {
                return;
            }
            queue.1 = None;
            std::mem::take(&mut queue.0)
        };
        let n = batch.len() as u64;

        match self.dispatch(&batch).await {
            Ok(()) => {
                self.inner.counters.flushed.fetch_add(n, Ordering::Relaxed);
            }
            Err(e) => {
                self.inner
                    .counters
                    .flush_failed
                    .fetch_add(n, Ordering::Relaxed);
                error!(commands = n, error = %e, "cache pipeline failed, batch dropped");
                // Drop the connection so the next flush reconnects from
                // scratch instead of retrying a poisoned pipeline.
                *self.inner.conn.lock() = None;
            }
        }
    }

    async fn dispatch(&self, batch: &[CacheCommand]) -> anyhow::Result<()> {
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();

        for command in batch {
            match command {
                CacheCommand::HSet { key, fields, ttl } => {
                    pipe.hset_multiple(key, fields).ignore();
                    if let Some(ttl) = ttl {
                        pipe.expire(key, ttl.as_secs() as i64).ignore();
                    }
                }
                CacheCommand::XAdd { key, fields } => {
                    pipe.xadd_maxlen(
                        key,
                        redis::streams::StreamMaxlen::Approx(self.inner.config.stream_maxlen),
                        "*",
                        fields,
                    )
                    .ignore();
                }
            }
        }

        tokio::time::timeout(self.inner.config.command_timeout, pipe.query_async(&mut conn))
            .await
            .map_err(|_| anyhow::anyhow!("cache pipeline timed out"))?
            .map_err(anyhow::Error::from)
    }

    async fn connection(&self) -> anyhow::Result<ConnectionManager> {
        {
            let guard = self.inner.conn.lock();
            if let Some(conn) = guard.as_ref() {
                return Ok(conn.clone());
            }
        }
        let client = redis::Client::open(self.inner.config.url.clone())?;
        let mut backoff_ms = 100u64;
        loop {
            match client.get_connection_manager().await {
                Ok(conn) => {
                    *self.inner.conn.lock() = Some(conn.clone());
                    return Ok(conn);
                }
                Err(e) => {
                    warn!(error = %e, backoff_ms, "cache reconnect failed, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = (backoff_ms * 2).min(5_000);
                }
            }
        }
    }
}

/// Build the hash field pair the external interface expects for a given
/// decimal field: all numeric values are written as strings for
/// bit-exact decimal round-trip.
pub fn decimal_field(name: &str, value: rust_decimal::Decimal) -> (String, String) {
    (name.to_string(), value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_increments_written() {
        let writer = CacheWriter::new(CacheConfig::default());
        writer.enqueue(CacheCommand::HSet {
            key: "marketdata:last:l1:BTCUSDT".into(),
            fields: vec![("best_bid".into(), "100.0".into())],
            ttl: None,
        });
        assert_eq!(writer.counters().written.load(Ordering::Relaxed), 1);
        assert_eq!(writer.counters().pending(), 1);
    }
}
