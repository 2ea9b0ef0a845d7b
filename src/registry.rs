// =============================================================================
// Market Registry — shared market → metadata map
// =============================================================================
//
// The discovery poller owns market metadata upstream; inside the pipeline the
// registry is the single read path for event/series membership, close times
// and terminal status. It is fed from the lifecycle stream (whose payloads
// carry discovery-grade fields when known) and read by the regime,
// cross-market and lifecycle processors plus the aggregator.
//
// Terminal markets are retained for a grace window so late signals can still
// be voided against them, then swept to keep the map bounded across
// thousands of markets.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::events::{LifecycleEvent, MarketStatus};

/// Static-ish per-market metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketMeta {
    pub market_ticker: String,
    pub event_id: Option<String>,
    pub series_id: Option<String>,
    pub close_time: Option<DateTime<Utc>>,
    pub status: MarketStatus,
    /// Event time of the last update we folded in.
    pub updated_at: DateTime<Utc>,
}

/// How long a terminal market's metadata survives before the sweep.
const TERMINAL_RETENTION_SECS: i64 = 3600;

/// Thread-safe registry shared across worker tasks via `Arc`.
pub struct MarketRegistry {
    markets: RwLock<HashMap<String, MarketMeta>>,
    by_event: RwLock<HashMap<String, HashSet<String>>>,
}

impl MarketRegistry {
    pub fn new() -> Self {
        Self {
            markets: RwLock::new(HashMap::new()),
            by_event: RwLock::new(HashMap::new()),
        }
    }

    /// Fold one lifecycle event into the registry.
    pub fn apply_lifecycle(&self, ev: &LifecycleEvent) {
        let mut markets = self.markets.write();
        let entry = markets
            .entry(ev.market_ticker.clone())
            .or_insert_with(|| MarketMeta {
                market_ticker: ev.market_ticker.clone(),
                event_id: None,
                series_id: None,
                close_time: None,
                status: ev.status,
                updated_at: ev.ts,
            });

        // Monotonic in event time: never fold an older event over a newer one.
        if ev.ts < entry.updated_at {
            return;
        }

        entry.status = ev.status;
        entry.updated_at = ev.ts;
        if let Some(event_id) = &ev.event_id {
            entry.event_id = Some(event_id.clone());
        }
        if let Some(series_id) = &ev.series_id {
            entry.series_id = Some(series_id.clone());
        }
        if let Some(close_time) = ev.close_time {
            entry.close_time = Some(close_time);
        }

        if let Some(event_id) = &ev.event_id {
            self.by_event
                .write()
                .entry(event_id.clone())
                .or_default()
                .insert(ev.market_ticker.clone());
        }
    }

    pub fn event_id(&self, market_ticker: &str) -> Option<String> {
        self.markets
            .read()
            .get(market_ticker)
            .and_then(|m| m.event_id.clone())
    }

    pub fn series_id(&self, market_ticker: &str) -> Option<String> {
        self.markets
            .read()
            .get(market_ticker)
            .and_then(|m| m.series_id.clone())
    }

    /// All known members of an event, including the queried market.
    pub fn event_members(&self, event_id: &str) -> Vec<String> {
        self.by_event
            .read()
            .get(event_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Sibling markets of `market_ticker` within the same event.
    pub fn siblings(&self, market_ticker: &str) -> Vec<String> {
        let Some(event_id) = self.event_id(market_ticker) else {
            return Vec::new();
        };
        self.event_members(&event_id)
            .into_iter()
            .filter(|m| m != market_ticker)
            .collect()
    }

    pub fn is_terminal(&self, market_ticker: &str) -> bool {
        self.markets
            .read()
            .get(market_ticker)
            .map(|m| m.status.is_terminal())
            .unwrap_or(false)
    }

    /// Seconds until the market's scheduled close, if known.
    pub fn time_to_close_secs(&self, market_ticker: &str, now: DateTime<Utc>) -> Option<i64> {
        self.markets
            .read()
            .get(market_ticker)
            .and_then(|m| m.close_time)
            .map(|close| (close - now).num_seconds())
    }

    /// Evict terminal markets whose last update is past the retention window.
    pub fn sweep_terminal(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::seconds(TERMINAL_RETENTION_SECS);
        let mut markets = self.markets.write();
        let evicted: Vec<MarketMeta> = markets
            .iter()
            .filter(|(_, m)| m.status.is_terminal() && m.updated_at < cutoff)
            .map(|(_, m)| m.clone())
            .collect();

        if evicted.is_empty() {
            return 0;
        }

        let mut by_event = self.by_event.write();
        for meta in &evicted {
            markets.remove(&meta.market_ticker);
            if let Some(event_id) = &meta.event_id {
                if let Some(members) = by_event.get_mut(event_id) {
                    members.remove(&meta.market_ticker);
                    if members.is_empty() {
                        by_event.remove(event_id);
                    }
                }
            }
        }

        debug!(count = evicted.len(), "swept terminal markets from registry");
        evicted.len()
    }

    pub fn len(&self) -> usize {
        self.markets.read().len()
    }
}

impl Default for MarketRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn lifecycle(market: &str, event: Option<&str>, status: MarketStatus, ts: DateTime<Utc>) -> LifecycleEvent {
        LifecycleEvent {
            ts,
            market_ticker: market.into(),
            status,
            result: None,
            event_id: event.map(Into::into),
            series_id: None,
            close_time: None,
        }
    }

    #[test]
    fn siblings_share_an_event() {
        let reg = MarketRegistry::new();
        reg.apply_lifecycle(&lifecycle("M1", Some("EV"), MarketStatus::Open, t(0)));
        reg.apply_lifecycle(&lifecycle("M2", Some("EV"), MarketStatus::Open, t(1)));
        reg.apply_lifecycle(&lifecycle("M3", Some("EV"), MarketStatus::Open, t(2)));
        reg.apply_lifecycle(&lifecycle("X1", Some("OTHER"), MarketStatus::Open, t(3)));

        let mut sibs = reg.siblings("M1");
        sibs.sort();
        assert_eq!(sibs, vec!["M2".to_string(), "M3".to_string()]);
    }

    #[test]
    fn stale_lifecycle_does_not_regress_status() {
        let reg = MarketRegistry::new();
        reg.apply_lifecycle(&lifecycle("M1", Some("EV"), MarketStatus::Settled, t(100)));
        reg.apply_lifecycle(&lifecycle("M1", Some("EV"), MarketStatus::Open, t(50)));
        assert!(reg.is_terminal("M1"));
    }

    #[test]
    fn metadata_accretes_across_events() {
        let reg = MarketRegistry::new();
        reg.apply_lifecycle(&lifecycle("M1", Some("EV"), MarketStatus::Open, t(0)));
        // Later event without event_id keeps the earlier membership.
        reg.apply_lifecycle(&lifecycle("M1", None, MarketStatus::Paused, t(10)));
        assert_eq!(reg.event_id("M1"), Some("EV".to_string()));
    }

    #[test]
    fn sweep_evicts_old_terminal_markets_only() {
        let reg = MarketRegistry::new();
        reg.apply_lifecycle(&lifecycle("M1", Some("EV"), MarketStatus::Settled, t(0)));
        reg.apply_lifecycle(&lifecycle("M2", Some("EV"), MarketStatus::Open, t(0)));

        assert_eq!(reg.sweep_terminal(t(10)), 0);
        assert_eq!(reg.sweep_terminal(t(4000)), 1);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.siblings("M2"), Vec::<String>::new());
    }
}
