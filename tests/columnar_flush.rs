//! Columnar batch-flush scenarios: a mock HTTP endpoint stands in for the
//! analytics store so the size/time threshold logic can be driven end to
//! end without a live database.

use std::time::Duration;

use httpmock::MockServer;
use marketfeed_ingest::writer::columnar::{ColumnarConfig, ColumnarWriter};
use serde_json::json;

fn config_for(server: &MockServer, batch_rows: usize, flush_interval_ms: u64) -> ColumnarConfig {
    ColumnarConfig {
        url: server.base_url(),
        database: "marketdata".into(),
        batch_rows,
        flush_interval_ms,
        compression: false,
        request_timeout: Duration::from_secs(5),
    }
}

#[tokio::test]
async fn flushes_on_row_count_threshold() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(httpmock::Method::POST)
            .path("/")
            .query_param("table", "trades");
        then.status(200);
    });

    let writer = ColumnarWriter::new(config_for(&server, 10, 60_000));
    for i in 0..10 {
        writer.enqueue("trades", json!({"trade_id": i}));
    }

    tokio::time::timeout(Duration::from_millis(200), async {
        loop {
            if writer.counters_for("trades").flushed.load(std::sync::atomic::Ordering::Relaxed) >= 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("rows should flush well before the 60s time threshold");

    mock.assert();
    assert_eq!(writer.counters_for("trades").pending(), 0);
}

#[tokio::test]
async fn flushes_on_time_threshold_with_partial_batch() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(httpmock::Method::POST)
            .path("/")
            .query_param("table", "trades");
        then.status(200);
    });

    let writer = ColumnarWriter::new(config_for(&server, 10_000, 100));
    for i in 0..3 {
        writer.enqueue("trades", json!({"trade_id": i}));
    }

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(
        writer.counters_for("trades").flushed.load(std::sync::atomic::Ordering::Relaxed),
        3
    );
    mock.assert();
}
