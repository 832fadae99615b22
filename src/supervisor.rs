//! Per-preset supervisor.
//!
//! Binds the preset's CPU affinity, builds the writer set the preset's
//! sink selection calls for, constructs the router and health monitor, fans
//! out one [`Shard`] per vendor channel the preset's channel set requires,
//! and runs until interrupt. On interrupt it runs an ordered shutdown:
//! stop the adapter, drain the router, force-flush both writers within
//! [`FLUSH_SHUTDOWN_DEADLINE`], exit.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::adapter::shard::Shard;
use crate::adapter::{shard_symbols, VendorChannel};
use crate::config::{Config, Preset};
use crate::health::HealthMonitor;
use crate::model::Channel;
use crate::router::{Router, RouterConfig, SinkMask};
use crate::writer::cache::CacheWriter;
use crate::writer::columnar::ColumnarWriter;
use crate::writer::{spawn_cache_sink, spawn_columnar_sink, FLUSH_SHUTDOWN_DEADLINE};

const COLUMNAR_CHANNEL_DEPTH: usize = 10_000;
const CACHE_CHANNEL_DEPTH: usize = 10_000;

/// The vendor stream(s) that must be open for a canonical channel to be
/// produced at all. `Channel::ObDiff` is intentionally gated by the
/// preset's `enable_diff_orderbook` flag rather than being implied by any
/// other channel selection (Open Question 2, see DESIGN.md).
fn vendor_channel_for(channel: Channel) -> Option<VendorChannel> {
    match channel {
        Channel::Trades | Channel::AggTrades5s => Some(VendorChannel::AggTrade),
        Channel::L1 => Some(VendorChannel::BookTicker),
        Channel::ObDiff => Some(VendorChannel::Depth),
        Channel::Klines => Some(VendorChannel::Kline1m),
        Channel::MarkPrice | Channel::Funding => Some(VendorChannel::MarkPrice1s),
        Channel::Liquidations => Some(VendorChannel::ForceOrder),
        // No vendor stream backs a multi-level order-book snapshot or the
        // advanced-metrics channel; a preset naming these gets nothing
        // (documented limitation, not a silent crash).
        Channel::ObTop5 | Channel::ObTop20 | Channel::AdvancedMetrics => None,
    }
}

pub struct Supervisor {
    config: Config,
    preset: Preset,
}

impl Supervisor {
    pub fn new(config: Config, preset: Preset) -> Self {
        Self { config, preset }
    }

    /// Run until `shutdown` resolves (normally `tokio::signal::ctrl_c()`).
    pub async fn run(self) -> anyhow::Result<()> {
        if let Some(index) = self.preset.cpu_affinity {
            bind_cpu_affinity(index);
        }

        let columnar = self
            .config
            .enable_columnar
            .then(|| ColumnarWriter::new(self.config.columnar.clone()));
        let cache = self
            .config
            .enable_cache
            .then(|| CacheWriter::new(self.config.cache.clone()));

        let (columnar_tx, columnar_rx) = mpsc::channel(COLUMNAR_CHANNEL_DEPTH);
        let (cache_tx, cache_rx) = mpsc::channel(CACHE_CHANNEL_DEPTH);

        if let Some(writer) = columnar.clone() {
            spawn_columnar_sink(columnar_rx, writer);
        }
        if let Some(writer) = cache.clone() {
            spawn_cache_sink(cache_rx, writer);
        }

        let mut router_config = RouterConfig::new();
        for &channel in &self.preset.channels {
            router_config = router_config.with_mask(
                channel,
                SinkMask {
                    to_columnar: columnar.is_some(),
                    to_cache: cache.is_some(),
                },
            );
        }
        let router = Router::new(
            router_config,
            columnar.as_ref().map(|_| columnar_tx.clone()),
            cache.as_ref().map(|_| cache_tx.clone()),
        );

        let health = Arc::new(HealthMonitor::new(
            self.preset.label.clone(),
            self.preset.symbols.len() as u64,
            self.preset.log_intervals.clone(),
            columnar.clone(),
            cache.clone(),
        ));
        health.clone().spawn();

        let vendor_channels: HashSet<VendorChannel> = self
            .preset
            .channels
            .iter()
            .filter(|&&c| c != Channel::ObDiff || self.preset.enable_diff_orderbook)
            .filter_map(|&c| vendor_channel_for(c))
            .collect();

        let mut shard_id = 0usize;
        let mut handles = Vec::new();
        for vendor_channel in vendor_channels {
            for symbols in shard_symbols(&self.preset.symbols, vendor_channel.max_streams_per_conn()) {
                let shard = Shard::new(
                    shard_id,
                    vendor_channel,
                    symbols,
                    self.config.ws_host.clone(),
                    self.config.rest_host.clone(),
                    router.clone(),
                    health.clone(),
                );
                shard_id += 1;
                handles.push(tokio::spawn(shard.run()));
            }
        }

        info!(
            preset = %self.preset.label,
            shards = handles.len(),
            symbols = self.preset.symbols.len(),
            "supervisor running"
        );

        tokio::signal::ctrl_c().await?;
        warn!(preset = %self.preset.label, "shutdown signal received, draining");

        for handle in handles {
            handle.abort();
        }
        drop(columnar_tx);
        drop(cache_tx);

        let drain = async {
            if let Some(writer) = &columnar {
                writer.flush_all().await;
            }
            if let Some(writer) = &cache {
                writer.flush_now().await;
            }
        };
        if tokio::time::timeout(FLUSH_SHUTDOWN_DEADLINE, drain)
            .await
            .is_err()
        {
            warn!(preset = %self.preset.label, "shutdown flush deadline exceeded, exiting anyway");
        }

        info!(preset = %self.preset.label, "supervisor shut down cleanly");
        Ok(())
    }
}

fn bind_cpu_affinity(index: usize) {
    match core_affinity::get_core_ids() {
        Some(core_ids) => match core_ids.get(index) {
            Some(&core_id) => {
                if core_affinity::set_for_current(core_id) {
                    info!(cpu = index, "bound to CPU core");
                } else {
                    warn!(cpu = index, "failed to bind CPU affinity, continuing unpinned");
                }
            }
            None => warn!(cpu = index, available = core_ids.len(), "CPU index out of range, continuing unpinned"),
        },
        None => warn!("could not enumerate CPU cores, continuing unpinned"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_channel_mapping_covers_every_stream_backed_channel() {
        assert_eq!(vendor_channel_for(Channel::Trades), Some(VendorChannel::AggTrade));
        assert_eq!(vendor_channel_for(Channel::ObDiff), Some(VendorChannel::Depth));
        assert_eq!(vendor_channel_for(Channel::ObTop5), None);
    }
}
