//! Pure dispatch from the canonical event channel to zero, one, or two
//! writers.
//!
//! The router holds no buffering and no per-event mutable state of its own:
//! it looks up the two independent `to_columnar` / `to_cache` masks for the
//! event's channel and forwards a clone of the event into whichever sinks are
//! selected. Each forward is an `mpsc::Sender::send().await`: a full writer
//! channel blocks the router, which blocks the adapter shard that called it
//! — deliberate backpressure rather than an unbounded queue.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::model::{Channel, Event};

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("writer channel closed for channel {0}")]
    WriterClosed(Channel),
}

/// Per-channel sink selection. Both may be true; both may be false (the
/// event is produced, routed nowhere, and dropped — a legal configuration,
/// e.g. for a channel a preset only uses internally for aggregation).
#[derive(Debug, Clone, Copy, Default)]
pub struct SinkMask {
    pub to_columnar: bool,
    pub to_cache: bool,
}

/// Configuration consumed by the router: one [`SinkMask`] per channel that is
/// in use for the running preset. A channel absent from the map is routed
/// nowhere.
#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    masks: HashMap<Channel, SinkMask>,
}

impl RouterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mask(mut self, channel: Channel, mask: SinkMask) -> Self {
        self.masks.insert(channel, mask);
        self
    }

    pub fn mask_for(&self, channel: Channel) -> SinkMask {
        self.masks.get(&channel).copied().unwrap_or_default()
    }
}

/// Typed dispatcher. Cloning is cheap: both held senders are `mpsc::Sender`,
/// which clone as reference-counted handles.
#[derive(Clone)]
pub struct Router {
    config: RouterConfig,
    columnar: Option<mpsc::Sender<Event>>,
    cache: Option<mpsc::Sender<Event>>,
}

impl Router {
    pub fn new(
        config: RouterConfig,
        columnar: Option<mpsc::Sender<Event>>,
        cache: Option<mpsc::Sender<Event>>,
    ) -> Self {
        Self {
            config,
            columnar,
            cache,
        }
    }

    /// Dispatch `event` to whichever writers are selected for its channel.
    /// Suspends on each selected writer's acceptance, in turn; ordering
    /// between the two writers is unspecified, but per-writer,
    /// per-instrument, per-channel order is preserved because a single
    /// shard task calls `publish` serially for its own stream.
    pub async fn publish(&self, event: Event) -> Result<(), RouterError> {
        let channel = event.channel();
        let mask = self.config.mask_for(channel);

        if mask.to_columnar {
            if let Some(tx) = &self.columnar {
                tx.send(event.clone())
                    .await
                    .map_err(|_| RouterError::WriterClosed(channel))?;
            }
        }

        if mask.to_cache {
            if let Some(tx) = &self.cache {
                tx.send(event)
                    .await
                    .map_err(|_| RouterError::WriterClosed(channel))?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BaseEvent, MarkPriceEvent};
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn mark_event() -> Event {
        Event::MarkPrice(MarkPriceEvent {
            base: BaseEvent {
                instrument: "BTCUSDT".into(),
                channel: Channel::MarkPrice,
                ts_event_ns: 1,
                ts_recv_ns: 2,
            },
            mark_price: Decimal::from_str("100.5").unwrap(),
            index_price: None,
        })
    }

    #[tokio::test]
    async fn routes_to_both_when_both_selected() {
        let (col_tx, mut col_rx) = mpsc::channel(8);
        let (cache_tx, mut cache_rx) = mpsc::channel(8);
        let config = RouterConfig::new().with_mask(
            Channel::MarkPrice,
            SinkMask {
                to_columnar: true,
                to_cache: true,
            },
        );
        let router = Router::new(config, Some(col_tx), Some(cache_tx));

        router.publish(mark_event()).await.unwrap();

        assert!(col_rx.recv().await.is_some());
        assert!(cache_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn routes_nowhere_when_unselected() {
        let (col_tx, mut col_rx) = mpsc::channel(8);
        let config = RouterConfig::new();
        let router = Router::new(config, Some(col_tx), None);

        router.publish(mark_event()).await.unwrap();

        // No mask registered for MarkPrice -> nothing forwarded.
        assert!(col_rx.try_recv().is_err());
    }
}
