// =============================================================================
// Message Bus — broker seam for all stream I/O
// =============================================================================
//
// Workers never talk to the broker directly; they read and publish through
// the `Bus` trait. Production uses Redis Streams with durable consumer
// groups (at-least-once, explicit ack). Tests use the in-process bus, which
// honors the same group/cursor/ack contract deterministically.

pub mod memory;
pub mod redis;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

pub use self::memory::MemoryBus;
pub use self::redis::RedisBus;

/// Stream names shared by the whole pipeline.
pub mod streams {
    // Raw input streams, fed by the ingestion layer.
    pub const TRADES: &str = "trades";
    pub const TICKER_UPDATES: &str = "ticker_updates";
    pub const ORDERBOOK_DELTAS: &str = "orderbook_deltas";
    pub const LIFECYCLE: &str = "lifecycle";

    // Per-processor signal streams.
    pub const SIGNALS_FLOW_TOXICITY: &str = "signals:flow_toxicity";
    pub const SIGNALS_OI_DIVERGENCE: &str = "signals:oi_divergence";
    pub const SIGNALS_REGIME: &str = "signals:regime";
    pub const SIGNALS_CROSS_MARKET: &str = "signals:cross_market";
    pub const SIGNALS_LIFECYCLE: &str = "signals:lifecycle";

    // Fan-in of every emitted signal, consumed by the aggregator.
    pub const SIGNALS_ALL: &str = "signals:all";
    // Aggregator output.
    pub const SIGNALS_COMPOSITE: &str = "signals:composite";
}

/// One delivered stream record: broker-assigned id plus the JSON payload.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    /// Stream the record was read from.
    pub stream: String,
    /// Broker delivery id, used for acking.
    pub id: String,
    pub payload: serde_json::Value,
}

/// Broker-agnostic stream bus with consumer-group semantics.
///
/// Delivery is at-least-once: a record stays pending for its consumer until
/// acked, and an unacked record is redelivered after restart.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Append a payload to `stream`, returning the broker-assigned id.
    async fn publish(&self, stream: &str, payload: &serde_json::Value) -> Result<String>;

    /// Create the consumer group on each stream if it does not exist yet.
    async fn ensure_group(&self, streams: &[&str], group: &str) -> Result<()>;

    /// Read up to `count` new records for `group`/`consumer` across
    /// `streams`, blocking up to `block` when nothing is available.
    async fn read_group(
        &self,
        streams: &[&str],
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>>;

    /// Acknowledge successful processing of one delivered record.
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()>;
}
