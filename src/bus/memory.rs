// =============================================================================
// In-process bus
// =============================================================================
//
// Deterministic `Bus` used by tests and local development. Mirrors the
// broker contract that matters to workers: per-group delivery cursors
// created at group-creation time ("new records only"), a pending set per
// consumer group, and explicit ack. `>`-style reads never redeliver within a
// process; unacked records simply stay pending, which the tests assert on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{Bus, StreamEntry};

#[derive(Default)]
struct GroupState {
    /// Index of the next never-delivered record in the stream.
    next_index: usize,
    /// Delivered-but-unacked record ids.
    pending: HashMap<String, usize>,
}

#[derive(Default)]
struct Inner {
    streams: HashMap<String, Vec<(String, serde_json::Value)>>,
    groups: HashMap<(String, String), GroupState>,
    seq: u64,
}

pub struct MemoryBus {
    inner: Mutex<Inner>,
    notify: Arc<Notify>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Arc::new(Notify::new()),
        }
    }

    /// All records ever appended to `stream`, oldest first.
    pub fn dump(&self, stream: &str) -> Vec<serde_json::Value> {
        self.inner
            .lock()
            .streams
            .get(stream)
            .map(|v| v.iter().map(|(_, p)| p.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of delivered-but-unacked records for a group on a stream.
    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.inner
            .lock()
            .groups
            .get(&(stream.to_string(), group.to_string()))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    fn take_new(
        &self,
        streams: &[&str],
        group: &str,
        count: usize,
    ) -> Vec<StreamEntry> {
        let mut inner = self.inner.lock();
        let mut out = Vec::new();
        for stream in streams {
            if out.len() >= count {
                break;
            }
            let key = (stream.to_string(), group.to_string());
            let available: Vec<(usize, String, serde_json::Value)> = {
                let Some(records) = inner.streams.get(*stream) else {
                    continue;
                };
                let Some(state) = inner.groups.get(&key) else {
                    continue;
                };
                records
                    .iter()
                    .enumerate()
                    .skip(state.next_index)
                    .take(count - out.len())
                    .map(|(i, (id, payload))| (i, id.clone(), payload.clone()))
                    .collect()
            };
            if available.is_empty() {
                continue;
            }
            let state = inner.groups.get_mut(&key).unwrap();
            for (index, id, payload) in available {
                state.next_index = index + 1;
                state.pending.insert(id.clone(), index);
                out.push(StreamEntry {
                    stream: stream.to_string(),
                    id,
                    payload,
                });
            }
        }
        out
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, stream: &str, payload: &serde_json::Value) -> Result<String> {
        let id = {
            let mut inner = self.inner.lock();
            inner.seq += 1;
            let id = format!("{}-0", inner.seq);
            inner
                .streams
                .entry(stream.to_string())
                .or_default()
                .push((id.clone(), payload.clone()));
            id
        };
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn ensure_group(&self, streams: &[&str], group: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        for stream in streams {
            let key = (stream.to_string(), group.to_string());
            let start = inner.streams.get(*stream).map(|v| v.len()).unwrap_or(0);
            inner.groups.entry(key).or_insert_with(|| GroupState {
                next_index: start,
                pending: HashMap::new(),
            });
        }
        Ok(())
    }

    async fn read_group(
        &self,
        streams: &[&str],
        group: &str,
        _consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let entries = self.take_new(streams, group, count);
        if !entries.is_empty() || block.is_zero() {
            return Ok(entries);
        }
        // Nothing available: wait for a publish or the block timeout.
        let _ = tokio::time::timeout(block, self.notify.notified()).await;
        Ok(self.take_new(streams, group, count))
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(state) = inner
            .groups
            .get_mut(&(stream.to_string(), group.to_string()))
        {
            state.pending.remove(id);
        }
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn group_created_at_tail_sees_only_new_records() {
        let bus = MemoryBus::new();
        bus.publish("trades", &json!({"n": 1})).await.unwrap();
        bus.ensure_group(&["trades"], "g").await.unwrap();
        bus.publish("trades", &json!({"n": 2})).await.unwrap();

        let got = bus
            .read_group(&["trades"], "g", "c0", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].payload["n"], 2);
    }

    #[tokio::test]
    async fn unacked_records_stay_pending() {
        let bus = MemoryBus::new();
        bus.ensure_group(&["trades"], "g").await.unwrap();
        bus.publish("trades", &json!({"n": 1})).await.unwrap();
        bus.publish("trades", &json!({"n": 2})).await.unwrap();

        let got = bus
            .read_group(&["trades"], "g", "c0", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(bus.pending_count("trades", "g"), 2);

        bus.ack("trades", "g", &got[0].id).await.unwrap();
        assert_eq!(bus.pending_count("trades", "g"), 1);
    }

    #[tokio::test]
    async fn independent_groups_have_independent_cursors() {
        let bus = MemoryBus::new();
        bus.ensure_group(&["trades"], "g1").await.unwrap();
        bus.ensure_group(&["trades"], "g2").await.unwrap();
        bus.publish("trades", &json!({"n": 1})).await.unwrap();

        let a = bus
            .read_group(&["trades"], "g1", "c", 10, Duration::ZERO)
            .await
            .unwrap();
        let b = bus
            .read_group(&["trades"], "g2", "c", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);

        // A second read on the same group yields nothing new.
        let again = bus
            .read_group(&["trades"], "g1", "c", 10, Duration::ZERO)
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn blocking_read_wakes_on_publish() {
        let bus = Arc::new(MemoryBus::new());
        bus.ensure_group(&["trades"], "g").await.unwrap();

        let reader = {
            let bus = bus.clone();
            tokio::spawn(async move {
                bus.read_group(&["trades"], "g", "c", 10, Duration::from_secs(5))
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish("trades", &json!({"n": 7})).await.unwrap();

        let got = reader.await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].payload["n"], 7);
    }

    #[tokio::test]
    async fn read_spans_multiple_streams() {
        let bus = MemoryBus::new();
        bus.ensure_group(&["trades", "lifecycle"], "g").await.unwrap();
        bus.publish("trades", &json!({"n": 1})).await.unwrap();
        bus.publish("lifecycle", &json!({"n": 2})).await.unwrap();

        let got = bus
            .read_group(&["trades", "lifecycle"], "g", "c", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(got.len(), 2);
        let streams: Vec<&str> = got.iter().map(|e| e.stream.as_str()).collect();
        assert!(streams.contains(&"trades"));
        assert!(streams.contains(&"lifecycle"));
    }
}
