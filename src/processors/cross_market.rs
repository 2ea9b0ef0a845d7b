// =============================================================================
// Cross-Market Propagation Processor — lagging-sibling repricing
// =============================================================================
//
// Markets that share an event are mutually exclusive outcomes: when one of
// them reprices sharply, its siblings' implied probabilities must give
// ground. This processor watches per-market price tracks, detects a leader
// move (>= N cents inside a minute), and emits one corrective signal per
// sibling that has not followed within the lookback window.
//
// A leader move against the siblings means their yes-probability is too
// high, so the corrective direction is buy_no when the leader rises and
// buy_yes when it falls. Siblings that already repriced, or that received
// the same corrective call in the last minute, are skipped.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::debug;

use crate::bus::streams;
use crate::config::CrossMarketConfig;
use crate::events::RawEvent;
use crate::registry::MarketRegistry;
use crate::signal::{Direction, Signal, SignalIdGen, SignalType, Urgency};
use crate::stats::clamp01;

use super::Processor;

/// Lookback for detecting the leader's own move, seconds.
const LEADER_MOVE_WINDOW_SECS: i64 = 60;
/// A leader that already fired does not fire again for this long.
const LEADER_REFIRE_SECS: i64 = 60;
/// Do not re-signal a sibling in the same direction within this window.
const SELF_SUPPRESS_SECS: i64 = 60;
/// Leader move (cents) at which strength saturates.
const FULL_STRENGTH_MOVE_CENTS: f64 = 10.0;
const IDLE_EVICT_SECS: i64 = 3600;
const CROSS_TTL_SECS: i64 = 180;

// =============================================================================
// Per-market price track
// =============================================================================

struct PriceTrack {
    /// (ts, yes price in cents), pruned to the sibling lookback horizon.
    prices: VecDeque<(DateTime<Utc>, i64)>,
    last_fire_ts: Option<DateTime<Utc>>,
    last_update_ts: DateTime<Utc>,
}

impl PriceTrack {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            prices: VecDeque::new(),
            last_fire_ts: None,
            last_update_ts: now,
        }
    }

    fn push(&mut self, ts: DateTime<Utc>, price: i64, horizon_secs: i64) {
        self.prices.push_back((ts, price));
        self.last_update_ts = ts;
        let cutoff = ts - Duration::seconds(horizon_secs);
        while let Some((head_ts, _)) = self.prices.front() {
            if *head_ts < cutoff {
                self.prices.pop_front();
            } else {
                break;
            }
        }
    }

    fn last_price(&self) -> Option<i64> {
        self.prices.back().map(|(_, p)| *p)
    }

    /// Signed price change over the trailing `secs`: current price minus the
    /// latest sample at or before the cutoff (or the oldest sample when the
    /// track is younger than the lookback).
    fn move_over(&self, now: DateTime<Utc>, secs: i64) -> Option<i64> {
        let current = self.last_price()?;
        let cutoff = now - Duration::seconds(secs);
        let baseline = self
            .prices
            .iter()
            .rev()
            .find(|(ts, _)| *ts <= cutoff)
            .or_else(|| self.prices.front())
            .map(|(_, p)| *p)?;
        Some(current - baseline)
    }

    /// Price dispersion over the track, in cents. A noisy sibling makes a
    /// poor propagation target.
    fn noise(&self) -> f64 {
        if self.prices.len() < 2 {
            return 0.0;
        }
        let n = self.prices.len() as f64;
        let mean = self.prices.iter().map(|(_, p)| *p as f64).sum::<f64>() / n;
        let var = self
            .prices
            .iter()
            .map(|(_, p)| (*p as f64 - mean).powi(2))
            .sum::<f64>()
            / n;
        var.sqrt()
    }
}

// =============================================================================
// Processor
// =============================================================================

pub struct CrossMarketProcessor {
    cfg: CrossMarketConfig,
    ids: SignalIdGen,
    registry: Arc<MarketRegistry>,
    markets: HashMap<String, PriceTrack>,
    /// (sibling, direction) -> last corrective emission, for suppression.
    recent_emits: HashMap<(String, Direction), DateTime<Utc>>,
}

impl CrossMarketProcessor {
    pub fn new(cfg: CrossMarketConfig, registry: Arc<MarketRegistry>, instance_id: &str) -> Self {
        Self {
            cfg,
            ids: SignalIdGen::new(format!("cross-market-{instance_id}")),
            registry,
            markets: HashMap::new(),
            recent_emits: HashMap::new(),
        }
    }

    fn on_price(&mut self, market: &str, ts: DateTime<Utc>, price: i64) -> Vec<Signal> {
        let horizon = self.cfg.window_sec.max(LEADER_MOVE_WINDOW_SECS);
        let track = self
            .markets
            .entry(market.to_string())
            .or_insert_with(|| PriceTrack::new(ts));
        track.push(ts, price, horizon);

        let Some(leader_move) = track.move_over(ts, LEADER_MOVE_WINDOW_SECS) else {
            return Vec::new();
        };
        if leader_move.abs() < self.cfg.leader_min_move {
            return Vec::new();
        }
        if let Some(last_fire) = track.last_fire_ts {
            if (ts - last_fire).num_seconds() < LEADER_REFIRE_SECS {
                return Vec::new();
            }
        }
        track.last_fire_ts = Some(ts);

        debug!(
            market,
            leader_move,
            price,
            "leader move detected, scanning siblings"
        );

        // Leader yes-probability up means sibling yes-probabilities are now
        // overstated, and vice versa.
        let direction = if leader_move > 0 {
            Direction::BuyNo
        } else {
            Direction::BuyYes
        };

        let mut out = Vec::new();
        for sibling in self.registry.siblings(market) {
            if self.registry.is_terminal(&sibling) {
                continue;
            }
            let Some(sib_track) = self.markets.get(&sibling) else {
                continue;
            };
            let Some(sib_price) = sib_track.last_price() else {
                continue;
            };
            let Some(sib_move) = sib_track.move_over(ts, self.cfg.window_sec) else {
                continue;
            };
            // A sibling that already repriced is not lagging.
            if sib_move.abs() > self.cfg.follower_max_move {
                continue;
            }
            if let Some(last) = self.recent_emits.get(&(sibling.clone(), direction)) {
                if (ts - *last).num_seconds() < SELF_SUPPRESS_SECS {
                    continue;
                }
            }

            let lag_seconds = (ts - sib_track.last_update_ts).num_seconds().max(0);
            let noise = sib_track.noise();
            let strength = clamp01(leader_move.abs() as f64 / FULL_STRENGTH_MOVE_CENTS);
            let confidence = clamp01(1.0 / (1.0 + noise));
            // Naive repricing edge in cents, bounded by the price floor.
            let implied_edge = (leader_move.abs()).min((sib_price - 1).max(0));

            out.push(Signal {
                signal_id: self.ids.next(),
                ts,
                signal_type: SignalType::CrossMarket,
                market_ticker: sibling.clone(),
                event_id: self.registry.event_id(&sibling),
                series_id: self.registry.series_id(&sibling),
                direction,
                strength,
                confidence,
                urgency: Urgency::Normal,
                ttl_seconds: CROSS_TTL_SECS,
                metadata: json!({
                    "leader_market": market,
                    "leader_move": leader_move,
                    "lag_seconds": lag_seconds,
                    "implied_edge": implied_edge,
                }),
            });
            self.recent_emits.insert((sibling, direction), ts);
        }
        out
    }
}

impl Processor for CrossMarketProcessor {
    fn name(&self) -> &'static str {
        "cross_market"
    }

    fn input_streams(&self) -> &'static [&'static str] {
        &[
            streams::TRADES,
            streams::TICKER_UPDATES,
            streams::LIFECYCLE,
        ]
    }

    fn on_event(&mut self, event: &RawEvent) -> Vec<Signal> {
        match event {
            RawEvent::Trade(trade) => {
                self.on_price(&trade.market_ticker, trade.ts, trade.yes_price)
            }
            RawEvent::Ticker(update) => match update.price {
                Some(price) => self.on_price(&update.market_ticker, update.ts, price),
                None => Vec::new(),
            },
            RawEvent::Lifecycle(lifecycle) => {
                self.registry.apply_lifecycle(lifecycle);
                if lifecycle.status.is_terminal() {
                    self.markets.remove(&lifecycle.market_ticker);
                }
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn housekeeping(&mut self, now: DateTime<Utc>) -> Vec<Signal> {
        let cutoff = now - Duration::seconds(IDLE_EVICT_SECS);
        self.markets.retain(|_, t| t.last_update_ts >= cutoff);
        let suppress_cutoff = now - Duration::seconds(SELF_SUPPRESS_SECS * 2);
        self.recent_emits.retain(|_, ts| *ts >= suppress_cutoff);
        Vec::new()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{LifecycleEvent, MarketStatus};
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn processor() -> CrossMarketProcessor {
        let cfg = CrossMarketConfig {
            leader_min_move: 3,
            follower_max_move: 1,
            window_sec: 120,
        };
        CrossMarketProcessor::new(cfg, Arc::new(MarketRegistry::new()), "0")
    }

    fn open(p: &mut CrossMarketProcessor, market: &str, secs: i64) {
        p.on_event(&RawEvent::Lifecycle(LifecycleEvent {
            ts: t(secs),
            market_ticker: market.into(),
            status: MarketStatus::Open,
            result: None,
            event_id: Some("EV".into()),
            series_id: Some("SER".into()),
            close_time: None,
        }));
    }

    #[test]
    fn leader_move_signals_lagging_siblings() {
        let mut p = processor();
        for m in ["M1", "M2", "M3"] {
            open(&mut p, m, 0);
        }
        // Flat starting prices everywhere.
        assert!(p.on_price("M1", t(1), 50).is_empty());
        assert!(p.on_price("M2", t(1), 30).is_empty());
        assert!(p.on_price("M3", t(1), 20).is_empty());

        // M1 runs 50 -> 55 inside ten seconds; M2 and M3 stay put.
        assert!(p.on_price("M1", t(5), 52).is_empty());
        let signals = p.on_price("M1", t(10), 55);

        assert_eq!(signals.len(), 2);
        let mut targets: Vec<&str> = signals.iter().map(|s| s.market_ticker.as_str()).collect();
        targets.sort();
        assert_eq!(targets, vec!["M2", "M3"]);
        for s in &signals {
            assert_eq!(s.direction, Direction::BuyNo);
            assert_eq!(s.metadata["leader_market"], "M1");
            assert_eq!(s.metadata["leader_move"], 5);
            assert_eq!(s.ttl_seconds, 180);
            assert!((s.strength - 0.5).abs() < 1e-12);
            assert!(s.validate().is_ok());
        }
    }

    #[test]
    fn falling_leader_flips_the_correction() {
        let mut p = processor();
        for m in ["M1", "M2"] {
            open(&mut p, m, 0);
        }
        p.on_price("M1", t(1), 50);
        p.on_price("M2", t(1), 30);
        let signals = p.on_price("M1", t(10), 46);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].direction, Direction::BuyYes);
        assert_eq!(signals[0].metadata["leader_move"], -4);
    }

    #[test]
    fn sibling_that_already_moved_is_skipped() {
        let mut p = processor();
        for m in ["M1", "M2", "M3"] {
            open(&mut p, m, 0);
        }
        p.on_price("M1", t(1), 50);
        p.on_price("M2", t(1), 30);
        p.on_price("M3", t(1), 20);
        // M2 reprices on its own before the leader move completes.
        p.on_price("M2", t(8), 27);

        let signals = p.on_price("M1", t(10), 55);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].market_ticker, "M3");
    }

    #[test]
    fn same_direction_resignal_is_suppressed() {
        let mut p = processor();
        for m in ["M1", "M2", "M3"] {
            open(&mut p, m, 0);
        }
        p.on_price("M1", t(1), 50);
        p.on_price("M2", t(1), 30);
        p.on_price("M3", t(1), 20);
        // M1 leads up: both flat siblings get buy_no.
        let first = p.on_price("M1", t(10), 55);
        assert_eq!(first.len(), 2);

        // M3 turns leader twenty seconds later. M1 has moved and is not a
        // target; M2 was just told buy_no and is not told again.
        let second = p.on_price("M3", t(30), 25);
        assert!(second.is_empty());
    }

    #[test]
    fn markets_without_shared_event_do_not_propagate() {
        let mut p = processor();
        open(&mut p, "M1", 0);
        // M2 belongs to a different event.
        p.on_event(&RawEvent::Lifecycle(LifecycleEvent {
            ts: t(0),
            market_ticker: "M2".into(),
            status: MarketStatus::Open,
            result: None,
            event_id: Some("OTHER".into()),
            series_id: None,
            close_time: None,
        }));
        p.on_price("M1", t(1), 50);
        p.on_price("M2", t(1), 30);
        assert!(p.on_price("M1", t(10), 55).is_empty());
    }
}
