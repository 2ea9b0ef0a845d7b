// =============================================================================
// Redis Streams bus
// =============================================================================
//
// Production `Bus` backed by Redis Streams: XADD for publishing, XREADGROUP
// for durable consumer-group reads, XACK once processing succeeds. Groups
// are created with MKSTREAM so workers can start before the ingestion layer
// has written a single record.
//
// Payload convention: every record carries one `data` field holding the JSON
// document, so stream schemas stay self-describing and a `redis-cli xrange`
// remains readable during an incident.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tracing::{debug, info};

use super::{Bus, StreamEntry};

pub struct RedisBus {
    conn: ConnectionManager,
}

impl RedisBus {
    /// Connect to the broker. The connection manager reconnects on its own,
    /// so transient broker restarts surface as retryable command errors
    /// rather than a dead client.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid bus url")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("failed to connect to bus")?;
        info!(url, "bus connected");
        Ok(Self { conn })
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, stream: &str, payload: &serde_json::Value) -> Result<String> {
        let mut conn = self.conn.clone();
        let data = serde_json::to_string(payload).context("serialize bus payload")?;
        let id: String = conn
            .xadd(stream, "*", &[("data", data.as_str())])
            .await
            .with_context(|| format!("XADD {stream}"))?;
        Ok(id)
    }

    async fn ensure_group(&self, streams: &[&str], group: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        for stream in streams {
            let created: redis::RedisResult<()> =
                conn.xgroup_create_mkstream(*stream, group, "$").await;
            match created {
                Ok(()) => {
                    info!(stream, group, "created consumer group");
                }
                Err(e) if e.to_string().contains("BUSYGROUP") => {
                    debug!(stream, group, "consumer group already exists");
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("XGROUP CREATE {stream} {group}"));
                }
            }
        }
        Ok(())
    }

    async fn read_group(
        &self,
        streams: &[&str],
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.conn.clone();
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block.as_millis() as usize);
        let ids: Vec<&str> = streams.iter().map(|_| ">").collect();

        let reply: StreamReadReply = conn
            .xread_options(streams, &ids, &opts)
            .await
            .with_context(|| format!("XREADGROUP {group}/{consumer}"))?;

        let mut entries = Vec::new();
        for key in reply.keys {
            for record in key.ids {
                let Some(raw) = record.map.get("data") else {
                    // Record without the data field: surface it as a null
                    // payload so the worker's poison path acks and counts it.
                    entries.push(StreamEntry {
                        stream: key.key.clone(),
                        id: record.id.clone(),
                        payload: serde_json::Value::Null,
                    });
                    continue;
                };
                let data: String = redis::from_redis_value(raw)
                    .with_context(|| format!("non-string data field in {}", key.key))?;
                let payload = serde_json::from_str(&data)
                    .unwrap_or(serde_json::Value::Null);
                entries.push(StreamEntry {
                    stream: key.key.clone(),
                    id: record.id,
                    payload,
                });
            }
        }
        Ok(entries)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _acked: i64 = conn
            .xack(stream, group, &[id])
            .await
            .with_context(|| format!("XACK {stream} {group} {id}"))?;
        Ok(())
    }
}
