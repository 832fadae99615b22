//! Batched analytics sink.
//!
//! One row buffer per table; a background flush loop (spawned once, shared
//! by every table) checks each buffer against the size/time thresholds and
//! POSTs a line-delimited-JSON body when either trips. Retries are bounded;
//! on final failure the batch is dropped, never spooled to disk (a
//! documented limitation, not an oversight).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, warn};

const RETRY_BACKOFFS_MS: [u64; 3] = [100, 400, 1_600];

#[derive(Debug, Clone)]
pub struct ColumnarConfig {
    /// HTTP endpoint, credentials embedded in the URL userinfo.
    pub url: String,
    pub database: String,
    pub batch_rows: usize,
    pub flush_interval_ms: u64,
    pub compression: bool,
    pub request_timeout: Duration,
}

impl Default for ColumnarConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".into(),
            database: "marketdata".into(),
            batch_rows: 5_000,
            flush_interval_ms: 250,
            compression: true,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Per-table counters, exposed for the health monitor.
#[derive(Debug, Default)]
pub struct TableCounters {
    pub written: AtomicU64,
    pub flushed: AtomicU64,
    pub flush_failed: AtomicU64,
}

impl TableCounters {
    pub fn pending(&self) -> u64 {
        self.written
            .load(Ordering::Relaxed)
            .saturating_sub(self.flushed.load(Ordering::Relaxed))
    }
}

struct TableBuffer {
    rows: Vec<Value>,
    opened_at: Option<Instant>,
}

impl TableBuffer {
    fn new() -> Self {
        Self {
            rows: Vec::new(),
            opened_at: None,
        }
    }
}

struct Inner {
    config: ColumnarConfig,
    client: reqwest::Client,
    buffers: Mutex<HashMap<String, TableBuffer>>,
    counters: Mutex<HashMap<String, Arc<TableCounters>>>,
}

/// Batched columnar writer. Cheap to clone — every clone shares the same
/// buffers and background flush loop.
#[derive(Clone)]
pub struct ColumnarWriter {
    inner: Arc<Inner>,
}

impl ColumnarWriter {
    pub fn new(config: ColumnarConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("failed to build reqwest client");

        let writer = Self {
            inner: Arc::new(Inner {
                config,
                client,
                buffers: Mutex::new(HashMap::new()),
                counters: Mutex::new(HashMap::new()),
            }),
        };
        writer.clone().spawn_flush_loop();
        writer
    }

    /// Enqueue one row for `table`. Never suspends (the buffer is an
    /// in-memory push under a short-held mutex); backpressure, if ever
    /// needed, would come from bounding buffer size — not implemented today
    /// because `batch_rows` already caps how much can accumulate before the
    /// flush loop drains it.
    pub fn enqueue(&self, table: &str, row: Value) {
        let counters = self.counters_for(table);
        counters.written.fetch_add(1, Ordering::Relaxed);

        let mut buffers = self.inner.buffers.lock();
        let buf = buffers
            .entry(table.to_string())
            .or_insert_with(TableBuffer::new);
        if buf.opened_at.is_none() {
            buf.opened_at = Some(Instant::now());
        }
        buf.rows.push(row);
    }

    pub fn counters_for(&self, table: &str) -> Arc<TableCounters> {
        self.inner
            .counters
            .lock()
            .entry(table.to_string())
            .or_insert_with(|| Arc::new(TableCounters::default()))
            .clone()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.inner.counters.lock().keys().cloned().collect()
    }

    /// Force-flush every table's buffer regardless of thresholds, used by
    /// the supervisor during ordered shutdown.
    pub async fn flush_all(&self) {
        let tables: Vec<String> = self.inner.buffers.lock().keys().cloned().collect();
        for table in tables {
            self.flush_table(&table).await;
        }
    }

    fn spawn_flush_loop(self) {
        tokio::spawn(async move {
            let tick = Duration::from_millis(10);
            loop {
                tokio::time::sleep(tick).await;
                let due: Vec<String> = {
                    let buffers = self.inner.buffers.lock();
                    buffers
                        .iter()
                        .filter(|(_, buf)| self.is_due(buf))
                        .map(|(name, _)| name.clone())
                        .collect()
                };
                for table in due {
                    self.flush_table(&table).await;
                }
            }
        });
    }

    fn is_due(&self, buf: &TableBuffer) -> bool {
        if buf.rows.is_empty() {
            return false;
        }
        if buf.rows.len() >= self.inner.config.batch_rows {
            return true;
        }
        match buf.opened_at {
            Some(opened_at) => {
                opened_at.elapsed() >= Duration::from_millis(self.inner.config.flush_interval_ms)
            }
            None => false,
        }
    }

    async fn flush_table(&self, table: &str) {
        let rows = {
            let mut buffers = self.inner.buffers.lock();
            match buffers.get_mut(table) {
                Some(buf) if !buf.rows.is_empty() => {
                    buf.opened_at = None;
                    std::mem::take(&mut buf.rows)
                }
                _ => return,
            }
        };
        let n = rows.len();
        let counters = self.counters_for(table);

        match self.post_with_retry(table, &rows).await {
            Ok(()) => {
                counters.flushed.fetch_add(n as u64, Ordering::Relaxed);
                debug!(table, rows = n, "columnar flush ok");
            }
            Err(e) => {
                counters.flush_failed.fetch_add(n as u64, Ordering::Relaxed);
                error!(table, rows = n, error = %e, "columnar flush failed after retries, batch dropped");
            }
        }
    }

    async fn post_with_retry(&self, table: &str, rows: &[Value]) -> anyhow::Result<()> {
        let body = ndjson_body(rows);
        let body = if self.inner.config.compression {
            lz4_flex::compress_prepend_size(body.as_bytes())
        } else {
            body.into_bytes()
        };

        let mut last_err = None;
        for (attempt, backoff_ms) in std::iter::once(0).chain(RETRY_BACKOFFS_MS).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                warn!(table, attempt, "retrying columnar flush");
            }
            let url = format!(
                "{}/?database={}&table={}",
                self.inner.config.url, self.inner.config.database, table
            );
            let mut req = self.inner.client.post(&url).body(body.clone());
            if self.inner.config.compression {
                req = req.header("Content-Encoding", "lz4");
            }
            match req.send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => last_err = Some(anyhow::anyhow!("non-2xx status: {}", resp.status())),
                Err(e) => last_err = Some(anyhow::anyhow!(e)),
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("unknown columnar flush failure")))
    }
}

fn ndjson_body(rows: &[Value]) -> String {
    let mut body = String::new();
    for row in rows {
        body.push_str(&row.to_string());
        body.push('\n');
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ndjson_has_one_line_per_row() {
        let rows = vec![json!({"a": 1}), json!({"a": 2})];
        let body = ndjson_body(&rows);
        assert_eq!(body.lines().count(), 2);
    }

    #[tokio::test]
    async fn enqueue_increments_written() {
        let writer = ColumnarWriter::new(ColumnarConfig::default());
        writer.enqueue("trades", json!({"instrument": "BTCUSDT"}));
        let counters = writer.counters_for("trades");
        assert_eq!(counters.written.load(Ordering::Relaxed), 1);
        assert_eq!(counters.pending(), 1);
    }
}
