// =============================================================================
// Lifecycle-Alpha Processor — settlement cascades and new-market mispricing
// =============================================================================
//
// Two reads on market lifecycle transitions inside mutually-exclusive
// events:
//
//   Settlement cascade. When one market settles YES, every open sibling is
//   resolved by elimination: immediate buy_no, critical urgency, short TTL.
//   When a market settles NO and exactly one sibling remains open, that
//   survivor takes the residual probability: immediate buy_yes.
//
//   New-market scan. A market that opens into an event with established,
//   priced siblings should start near the residual probability the event
//   leaves it (100 minus the sibling yes-prices, bounded). A first print far
//   from that residual gets a corrective signal toward it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{debug, info};

use crate::bus::streams;
use crate::events::{LifecycleEvent, MarketStatus, RawEvent, Side};
use crate::registry::MarketRegistry;
use crate::signal::{Direction, Signal, SignalIdGen, SignalType, Urgency};
use crate::stats::clamp01;

use super::Processor;

/// How long after `open` the first print still counts as the initial price.
const NEW_MARKET_PRICE_WAIT_SECS: i64 = 60;
/// Cents of divergence from the implied residual worth signaling.
const NEW_MARKET_DIVERGENCE_CENTS: i64 = 5;
/// Divergence (cents) at which the corrective strength saturates.
const NEW_MARKET_FULL_STRENGTH_CENTS: f64 = 20.0;
/// Established siblings with known prices required for a residual read.
const MIN_PRICED_SIBLINGS: usize = 2;
const IDLE_EVICT_SECS: i64 = 3600;

const CASCADE_TTL_SECS: i64 = 60;
const NEW_MARKET_TTL_SECS: i64 = 300;

// =============================================================================
// Processor
// =============================================================================

pub struct LifecycleProcessor {
    ids: SignalIdGen,
    registry: Arc<MarketRegistry>,
    /// Latest yes price per market.
    prices: HashMap<String, (DateTime<Utc>, i64)>,
    /// Recently opened markets awaiting their first print.
    pending_new: HashMap<String, DateTime<Utc>>,
}

impl LifecycleProcessor {
    pub fn new(registry: Arc<MarketRegistry>, instance_id: &str) -> Self {
        Self {
            ids: SignalIdGen::new(format!("lifecycle-{instance_id}")),
            registry,
            prices: HashMap::new(),
            pending_new: HashMap::new(),
        }
    }

    fn on_lifecycle(&mut self, ev: &LifecycleEvent) -> Vec<Signal> {
        self.registry.apply_lifecycle(ev);

        match ev.status {
            MarketStatus::Open => {
                self.pending_new.insert(ev.market_ticker.clone(), ev.ts);
                Vec::new()
            }
            MarketStatus::Settled | MarketStatus::Determined => {
                self.prices.remove(&ev.market_ticker);
                self.pending_new.remove(&ev.market_ticker);
                match ev.result {
                    Some(winner) => self.cascade(ev, winner),
                    None => Vec::new(),
                }
            }
            _ => Vec::new(),
        }
    }

    /// Resolve siblings by elimination once one leg of the event settles.
    fn cascade(&self, ev: &LifecycleEvent, winner: Side) -> Vec<Signal> {
        let siblings = self.registry.siblings(&ev.market_ticker);
        if siblings.is_empty() {
            return Vec::new();
        }
        let survivors: Vec<String> = siblings
            .into_iter()
            .filter(|m| !self.registry.is_terminal(m))
            .collect();

        let mut out = Vec::new();
        match winner {
            Side::Yes => {
                // The event is decided: every open sibling is a NO.
                for sibling in &survivors {
                    out.push(self.cascade_signal(
                        ev,
                        sibling,
                        Direction::BuyNo,
                        survivors.len(),
                    ));
                }
            }
            Side::No => {
                // One leg eliminated; only a unique survivor is actionable.
                if survivors.len() == 1 {
                    out.push(self.cascade_signal(
                        ev,
                        &survivors[0],
                        Direction::BuyYes,
                        survivors.len(),
                    ));
                }
            }
        }

        if !out.is_empty() {
            info!(
                settled = %ev.market_ticker,
                winner = %winner,
                signals = out.len(),
                "settlement cascade"
            );
        }
        out
    }

    fn cascade_signal(
        &self,
        ev: &LifecycleEvent,
        sibling: &str,
        direction: Direction,
        surviving: usize,
    ) -> Signal {
        Signal {
            signal_id: self.ids.next(),
            ts: ev.ts,
            signal_type: SignalType::LifecycleCascade,
            market_ticker: sibling.to_string(),
            event_id: self.registry.event_id(sibling),
            series_id: self.registry.series_id(sibling),
            direction,
            strength: 1.0,
            confidence: 0.9,
            urgency: Urgency::Critical,
            ttl_seconds: CASCADE_TTL_SECS,
            metadata: json!({
                "settled_market": ev.market_ticker,
                "settled_result": ev.result.map(|s| s.to_string()),
                "surviving_count": surviving,
            }),
        }
    }

    /// First print of a recently opened market against the event residual.
    fn on_price(&mut self, market: &str, ts: DateTime<Utc>, price: i64) -> Vec<Signal> {
        self.prices.insert(market.to_string(), (ts, price));

        let Some(opened_at) = self.pending_new.remove(market) else {
            return Vec::new();
        };
        if (ts - opened_at).num_seconds() > NEW_MARKET_PRICE_WAIT_SECS {
            return Vec::new();
        }

        let siblings = self.registry.siblings(market);
        let priced: Vec<i64> = siblings
            .iter()
            .filter(|m| !self.registry.is_terminal(m))
            .filter_map(|m| self.prices.get(m.as_str()).map(|(_, p)| *p))
            .collect();
        if priced.len() < MIN_PRICED_SIBLINGS {
            return Vec::new();
        }

        let residual = (100 - priced.iter().sum::<i64>()).clamp(1, 99);
        let divergence = price - residual;
        if divergence.abs() < NEW_MARKET_DIVERGENCE_CENTS {
            return Vec::new();
        }

        let direction = if divergence > 0 {
            Direction::BuyNo
        } else {
            Direction::BuyYes
        };

        debug!(
            market,
            price,
            residual,
            divergence,
            "new market priced away from event residual"
        );

        vec![Signal {
            signal_id: self.ids.next(),
            ts,
            signal_type: SignalType::LifecycleNewMarket,
            market_ticker: market.to_string(),
            event_id: self.registry.event_id(market),
            series_id: self.registry.series_id(market),
            direction,
            strength: clamp01(divergence.abs() as f64 / NEW_MARKET_FULL_STRENGTH_CENTS),
            confidence: clamp01(priced.len() as f64 / siblings.len().max(1) as f64),
            urgency: Urgency::Normal,
            ttl_seconds: NEW_MARKET_TTL_SECS,
            metadata: json!({
                "implied_residual": residual,
                "initial_price": price,
                "divergence": divergence,
                "priced_siblings": priced.len(),
            }),
        }]
    }
}

impl Processor for LifecycleProcessor {
    fn name(&self) -> &'static str {
        "lifecycle"
    }

    fn input_streams(&self) -> &'static [&'static str] {
        &[
            streams::LIFECYCLE,
            streams::TRADES,
            streams::TICKER_UPDATES,
        ]
    }

    fn on_event(&mut self, event: &RawEvent) -> Vec<Signal> {
        match event {
            RawEvent::Lifecycle(ev) => self.on_lifecycle(ev),
            RawEvent::Trade(trade) => {
                self.on_price(&trade.market_ticker, trade.ts, trade.yes_price)
            }
            RawEvent::Ticker(update) => match update.price {
                Some(price) => self.on_price(&update.market_ticker, update.ts, price),
                None => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    fn housekeeping(&mut self, now: DateTime<Utc>) -> Vec<Signal> {
        let wait_cutoff = now - Duration::seconds(NEW_MARKET_PRICE_WAIT_SECS);
        self.pending_new.retain(|_, opened| *opened >= wait_cutoff);
        let idle_cutoff = now - Duration::seconds(IDLE_EVICT_SECS);
        self.prices.retain(|_, (ts, _)| *ts >= idle_cutoff);
        Vec::new()
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

    fn lifecycle(
        market: &str,
        secs: i64,
        status: MarketStatus,
        result: Option<Side>,
    ) -> LifecycleEvent {
        LifecycleEvent {
            ts: t(secs),
            market_ticker: market.into(),
            status,
            result,
            event_id: Some("EV".into()),
            series_id: Some("SER".into()),
            close_time: None,
        }
    }

    fn processor() -> LifecycleProcessor {
        LifecycleProcessor::new(Arc::new(MarketRegistry::new()), "0")
    }

    fn open_all(p: &mut LifecycleProcessor, markets: &[&str], secs: i64) {
        for m in markets {
            p.on_lifecycle(&lifecycle(m, secs, MarketStatus::Open, None));
        }
    }

    #[test]
    fn yes_settlement_cascades_buy_no_to_siblings() {
        let mut p = processor();
        open_all(&mut p, &["M1", "M2", "M3"], 0);

        let signals = p.on_lifecycle(&lifecycle("M1", 100, MarketStatus::Settled, Some(Side::Yes)));
        assert_eq!(signals.len(), 2);
        let mut targets: Vec<&str> = signals.iter().map(|s| s.market_ticker.as_str()).collect();
        targets.sort();
        assert_eq!(targets, vec!["M2", "M3"]);
        for s in &signals {
            assert_eq!(s.direction, Direction::BuyNo);
            assert_eq!(s.urgency, Urgency::Critical);
            assert_eq!(s.ttl_seconds, 60);
            assert_eq!(s.metadata["settled_market"], "M1");
            assert!(s.validate().is_ok());
        }
    }

    #[test]
    fn no_settlement_signals_only_the_unique_survivor() {
        let mut p = processor();
        open_all(&mut p, &["M1", "M2", "M3"], 0);

        // First elimination leaves two candidates: nothing actionable.
        let first = p.on_lifecycle(&lifecycle("M1", 50, MarketStatus::Settled, Some(Side::No)));
        assert!(first.is_empty());

        // Second elimination leaves one: buy_yes on the survivor.
        let second = p.on_lifecycle(&lifecycle("M2", 60, MarketStatus::Settled, Some(Side::No)));
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].market_ticker, "M3");
        assert_eq!(second[0].direction, Direction::BuyYes);
        assert_eq!(second[0].urgency, Urgency::Critical);
    }

    #[test]
    fn settlement_without_result_is_inert() {
        let mut p = processor();
        open_all(&mut p, &["M1", "M2"], 0);
        let signals = p.on_lifecycle(&lifecycle("M1", 10, MarketStatus::Settled, None));
        assert!(signals.is_empty());
    }

    #[test]
    fn new_market_far_from_residual_gets_corrected() {
        let mut p = processor();
        open_all(&mut p, &["M1", "M2"], 0);
        p.on_price("M1", t(1), 60);
        p.on_price("M2", t(1), 25);

        // M3 opens; the event leaves it 100 - 85 = 15 cents of implied
        // probability, but it prints at 30.
        p.on_lifecycle(&lifecycle("M3", 10, MarketStatus::Open, None));
        let signals = p.on_price("M3", t(20), 30);

        assert_eq!(signals.len(), 1);
        let s = &signals[0];
        assert_eq!(s.signal_type, SignalType::LifecycleNewMarket);
        assert_eq!(s.direction, Direction::BuyNo);
        assert_eq!(s.metadata["implied_residual"], 15);
        assert_eq!(s.metadata["divergence"], 15);
        assert!((s.strength - 0.75).abs() < 1e-12);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn new_market_near_residual_stays_quiet() {
        let mut p = processor();
        open_all(&mut p, &["M1", "M2"], 0);
        p.on_price("M1", t(1), 60);
        p.on_price("M2", t(1), 25);
        p.on_lifecycle(&lifecycle("M3", 10, MarketStatus::Open, None));
        assert!(p.on_price("M3", t(20), 17).is_empty());
    }

    #[test]
    fn late_first_print_is_not_an_initial_price() {
        let mut p = processor();
        open_all(&mut p, &["M1", "M2"], 0);
        p.on_price("M1", t(1), 60);
        p.on_price("M2", t(1), 25);
        p.on_lifecycle(&lifecycle("M3", 10, MarketStatus::Open, None));
        // First print lands well past the wait window.
        assert!(p.on_price("M3", t(200), 30).is_empty());
    }

    #[test]
    fn unpriced_siblings_block_the_residual_read() {
        let mut p = processor();
        open_all(&mut p, &["M1", "M2"], 0);
        p.on_price("M1", t(1), 60);
        p.on_lifecycle(&lifecycle("M3", 10, MarketStatus::Open, None));
        assert!(p.on_price("M3", t(20), 30).is_empty());
    }
}
