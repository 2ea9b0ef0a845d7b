// =============================================================================
// Regime Processor — five-state activity machine with hysteresis
// =============================================================================
//
// Classifies every market into DEAD / QUIET / ACTIVE / INFORMED / PRE_SETTLE
// from a 30-second rolling view of trade rate, message rate and best-level
// depth imbalance, plus time-to-close from the registry.
//
// Evaluation runs on a 5-second event-time cadence. A candidate state must
// hold for the hysteresis window before the machine commits. The one
// exception is PRE_SETTLE: the clock dominates, and it is entered the
// moment the close window opens.
//
// Each committed transition emits one neutral regime signal whose strength
// encodes how much the transition matters downstream; the aggregator uses
// the embedded new_regime to pick its multiplier.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::info;

use crate::bus::streams;
use crate::config::RegimeConfig;
use crate::events::{OrderbookDelta, RawEvent, Side};
use crate::registry::MarketRegistry;
use crate::signal::{Direction, Regime, Signal, SignalIdGen, SignalType, Urgency};
use crate::stats::TimedWindow;

use super::Processor;

/// Observation window for rates and imbalance, seconds.
const OBS_WINDOW_SECS: i64 = 30;
const IDLE_EVICT_SECS: i64 = 3600;
const REGIME_TTL_SECS: i64 = 3600;

// Transition thresholds from the classification table.
const DEAD_TRADE_RATE: f64 = 0.1;
const DEAD_MSG_RATE: f64 = 1.0;
const WAKE_TRADE_RATE: f64 = 0.5;
const ACTIVE_TRADE_RATE: f64 = 5.0;
const ACTIVE_MSG_RATE: f64 = 20.0;
const COOL_TRADE_RATE: f64 = 2.0;
const INFORMED_IMBALANCE: f64 = 0.6;
const CALM_IMBALANCE: f64 = 0.3;

// =============================================================================
// Per-market state
// =============================================================================

struct RegimeTracker {
    regime: Regime,
    entered_at: DateTime<Utc>,
    /// Candidate state waiting out the hysteresis window.
    pending: Option<(Regime, DateTime<Utc>)>,
    trades: TimedWindow,
    messages: TimedWindow,
    yes_book: BTreeMap<i64, i64>,
    no_book: BTreeMap<i64, i64>,
    last_activity_ts: DateTime<Utc>,
}

impl RegimeTracker {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            regime: Regime::Quiet,
            entered_at: now,
            pending: None,
            trades: TimedWindow::new(OBS_WINDOW_SECS),
            messages: TimedWindow::new(OBS_WINDOW_SECS),
            yes_book: BTreeMap::new(),
            no_book: BTreeMap::new(),
            last_activity_ts: now,
        }
    }

    fn apply_book_delta(&mut self, delta: &OrderbookDelta) {
        let book = match delta.side {
            Side::Yes => &mut self.yes_book,
            Side::No => &mut self.no_book,
        };
        let size = book.entry(delta.price).or_insert(0);
        *size += delta.delta;
        if *size <= 0 {
            book.remove(&delta.price);
        }
    }

    /// Imbalance between the best yes and best no level sizes, in [-1, +1].
    fn depth_imbalance(&self) -> f64 {
        let best_yes = self.yes_book.iter().next_back().map(|(_, s)| *s).unwrap_or(0);
        let best_no = self.no_book.iter().next_back().map(|(_, s)| *s).unwrap_or(0);
        let total = best_yes + best_no;
        if total <= 0 {
            return 0.0;
        }
        (best_yes - best_no) as f64 / total as f64
    }
}

/// One evaluated view of a market's observables.
struct Observables {
    trade_rate: f64,
    message_rate: f64,
    depth_imbalance: f64,
    time_to_close_secs: Option<i64>,
}

// =============================================================================
// Processor
// =============================================================================

pub struct RegimeProcessor {
    cfg: RegimeConfig,
    ids: SignalIdGen,
    registry: Arc<MarketRegistry>,
    markets: HashMap<String, RegimeTracker>,
    last_eval: Option<DateTime<Utc>>,
}

impl RegimeProcessor {
    pub fn new(cfg: RegimeConfig, registry: Arc<MarketRegistry>, instance_id: &str) -> Self {
        Self {
            cfg,
            ids: SignalIdGen::new(format!("regime-{instance_id}")),
            registry,
            markets: HashMap::new(),
            last_eval: None,
        }
    }

    fn evaluate_market(&mut self, market: &str, now: DateTime<Utc>) -> Option<Signal> {
        let time_to_close_secs = self.registry.time_to_close_secs(market, now);
        let pre_settle_secs = self.cfg.pre_settle_min * 60;
        let hysteresis_sec = self.cfg.hysteresis_sec;
        let tracker = self.markets.get_mut(market)?;
        tracker.trades.prune(now);
        tracker.messages.prune(now);

        let obs = Observables {
            trade_rate: tracker.trades.rate_per_min(now),
            message_rate: tracker.messages.rate_per_min(now),
            depth_imbalance: tracker.depth_imbalance(),
            time_to_close_secs,
        };

        let current = tracker.regime;
        let target = target_regime(current, &obs, pre_settle_secs);

        if target == current {
            tracker.pending = None;
            return None;
        }

        // PRE_SETTLE commits immediately; everything else waits out the
        // hysteresis window.
        let commit = if target == Regime::PreSettle {
            true
        } else {
            match tracker.pending {
                Some((candidate, since)) if candidate == target => {
                    (now - since).num_seconds() >= hysteresis_sec
                }
                _ => {
                    tracker.pending = Some((target, now));
                    false
                }
            }
        };
        if !commit {
            return None;
        }

        let previous_age_secs = (now - tracker.entered_at).num_seconds();
        tracker.regime = target;
        tracker.entered_at = now;
        tracker.pending = None;

        info!(
            market,
            from = %current,
            to = %target,
            trade_rate = format!("{:.1}", obs.trade_rate),
            message_rate = format!("{:.1}", obs.message_rate),
            depth_imbalance = format!("{:+.2}", obs.depth_imbalance),
            "regime transition"
        );

        Some(Signal {
            signal_id: self.ids.next(),
            ts: now,
            signal_type: SignalType::Regime,
            market_ticker: market.to_string(),
            event_id: self.registry.event_id(market),
            series_id: self.registry.series_id(market),
            direction: Direction::Neutral,
            strength: transition_strength(target),
            confidence: 1.0,
            urgency: match target {
                Regime::PreSettle | Regime::Informed => Urgency::High,
                _ => Urgency::Normal,
            },
            ttl_seconds: REGIME_TTL_SECS,
            metadata: json!({
                "old_regime": current.to_string(),
                "new_regime": target.to_string(),
                "previous_regime_age_secs": previous_age_secs,
                "trade_rate": obs.trade_rate,
                "message_rate": obs.message_rate,
                "depth_imbalance": obs.depth_imbalance,
                "time_to_close_secs": obs.time_to_close_secs,
            }),
        })
    }
}

/// The target state implied by the observables, given the current state.
fn target_regime(current: Regime, obs: &Observables, pre_settle_secs: i64) -> Regime {
    // The clock dominates everything else.
    if let Some(ttc) = obs.time_to_close_secs {
        if ttc < pre_settle_secs {
            return Regime::PreSettle;
        }
    }
    if current == Regime::PreSettle {
        return Regime::PreSettle;
    }
    if obs.trade_rate < DEAD_TRADE_RATE && obs.message_rate < DEAD_MSG_RATE {
        return Regime::Dead;
    }
    match current {
        Regime::Dead => {
            if obs.trade_rate >= WAKE_TRADE_RATE {
                Regime::Quiet
            } else {
                Regime::Dead
            }
        }
        Regime::Quiet => {
            if obs.trade_rate >= ACTIVE_TRADE_RATE || obs.message_rate >= ACTIVE_MSG_RATE {
                Regime::Active
            } else {
                Regime::Quiet
            }
        }
        Regime::Active => {
            if obs.depth_imbalance.abs() >= INFORMED_IMBALANCE
                && obs.trade_rate >= ACTIVE_TRADE_RATE
            {
                Regime::Informed
            } else if obs.trade_rate < COOL_TRADE_RATE {
                Regime::Quiet
            } else {
                Regime::Active
            }
        }
        Regime::Informed => {
            if obs.depth_imbalance.abs() < CALM_IMBALANCE {
                Regime::Active
            } else {
                Regime::Informed
            }
        }
        Regime::PreSettle => Regime::PreSettle,
    }
}

/// How much a transition into `to` matters downstream.
fn transition_strength(to: Regime) -> f64 {
    match to {
        Regime::PreSettle => 1.0,
        Regime::Informed => 0.9,
        Regime::Active => 0.6,
        Regime::Quiet => 0.4,
        Regime::Dead => 0.3,
    }
}

impl Processor for RegimeProcessor {
    fn name(&self) -> &'static str {
        "regime"
    }

    fn input_streams(&self) -> &'static [&'static str] {
        &[
            streams::TRADES,
            streams::TICKER_UPDATES,
            streams::ORDERBOOK_DELTAS,
            streams::LIFECYCLE,
        ]
    }

    fn on_event(&mut self, event: &RawEvent) -> Vec<Signal> {
        let ts = event.ts();
        let market = event.market_ticker().to_string();

        if let RawEvent::Lifecycle(lifecycle) = event {
            self.registry.apply_lifecycle(lifecycle);
            if lifecycle.status.is_terminal() {
                self.markets.remove(&market);
                return Vec::new();
            }
        }

        let tracker = self
            .markets
            .entry(market)
            .or_insert_with(|| RegimeTracker::new(ts));
        tracker.last_activity_ts = ts;
        tracker.messages.push(ts, 1.0);
        match event {
            RawEvent::Trade(_) => tracker.trades.push(ts, 1.0),
            RawEvent::Orderbook(delta) => tracker.apply_book_delta(delta),
            _ => {}
        }
        Vec::new()
    }

    fn housekeeping(&mut self, now: DateTime<Utc>) -> Vec<Signal> {
        let due = self
            .last_eval
            .map(|last| (now - last).num_seconds() >= self.cfg.eval_period_sec)
            .unwrap_or(true);
        if !due {
            return Vec::new();
        }
        self.last_eval = Some(now);

        let cutoff = now - Duration::seconds(IDLE_EVICT_SECS);
        self.markets.retain(|_, t| t.last_activity_ts >= cutoff);

        let tickers: Vec<String> = self.markets.keys().cloned().collect();
        let mut out = Vec::new();
        for market in tickers {
            if let Some(signal) = self.evaluate_market(&market, now) {
                out.push(signal);
            }
        }
        out
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{LifecycleEvent, MarketStatus, Trade};
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn processor() -> RegimeProcessor {
        let cfg = RegimeConfig {
            eval_period_sec: 5,
            hysteresis_sec: 15,
            pre_settle_min: 15,
        };
        RegimeProcessor::new(cfg, Arc::new(MarketRegistry::new()), "0")
    }

    fn trade_event(market: &str, secs: i64, n: usize) -> RawEvent {
        RawEvent::Trade(Trade {
            ts: t(secs),
            market_ticker: market.into(),
            yes_price: 50,
            no_price: 50,
            count: 5,
            taker_side: Side::Yes,
            trade_id: format!("tr-{n}"),
        })
    }

    fn book_event(market: &str, secs: i64, side: Side, price: i64, delta: i64) -> RawEvent {
        RawEvent::Orderbook(OrderbookDelta {
            ts: t(secs),
            market_ticker: market.into(),
            side,
            price,
            delta,
            is_own_order: None,
        })
    }

    fn lifecycle_event(market: &str, secs: i64, close_secs: Option<i64>) -> RawEvent {
        RawEvent::Lifecycle(LifecycleEvent {
            ts: t(secs),
            market_ticker: market.into(),
            status: MarketStatus::Open,
            result: None,
            event_id: Some("EV".into()),
            series_id: None,
            close_time: close_secs.map(t),
        })
    }

    #[test]
    fn silence_then_flow_then_imbalance_walks_the_ladder() {
        let mut p = processor();
        p.on_event(&lifecycle_event("M1", 0, None));

        let mut signals = Vec::new();
        let mut n = 0usize;
        // Chronological drive: two minutes of silence, then a trade every 2s,
        // then a strongly one-sided book on top of the flow at 200s.
        for s in 0..=260i64 {
            if s >= 120 && s % 2 == 0 {
                p.on_event(&trade_event("M1", s, n));
                n += 1;
            }
            if s == 200 {
                p.on_event(&book_event("M1", s, Side::Yes, 55, 90));
                p.on_event(&book_event("M1", s, Side::No, 45, 10));
            }
            if s % 5 == 0 {
                signals.extend(p.housekeeping(t(s)));
            }
        }

        let transitions: Vec<(String, String)> = signals
            .iter()
            .map(|s| {
                (
                    s.metadata["old_regime"].as_str().unwrap().to_string(),
                    s.metadata["new_regime"].as_str().unwrap().to_string(),
                )
            })
            .collect();

        // Chain property: each old_regime continues the previous new_regime.
        for pair in transitions.windows(2) {
            assert_eq!(pair[0].1, pair[1].0);
        }

        let path: Vec<&str> = transitions.iter().map(|(_, to)| to.as_str()).collect();
        assert_eq!(path, vec!["DEAD", "QUIET", "ACTIVE", "INFORMED"]);
        assert!(signals.iter().all(|s| s.direction == Direction::Neutral));
        assert!(signals.iter().all(|s| s.validate().is_ok()));
    }

    #[test]
    fn hysteresis_suppresses_flicker() {
        let mut p = processor();
        let mut n = 0usize;
        let mut reached = Vec::new();
        // Steady flow to ACTIVE.
        for s in 0..120i64 {
            if s % 2 == 0 {
                p.on_event(&trade_event("M1", s, n));
                n += 1;
            }
            if s % 5 == 0 {
                reached.extend(p.housekeeping(t(s)));
            }
        }
        assert_eq!(
            reached.last().unwrap().metadata["new_regime"].as_str(),
            Some("ACTIVE")
        );

        // A 40-second lull (long enough for a DEAD candidate to appear but
        // shorter than observation + hysteresis), then flow resumes: no
        // transition may be committed.
        let mut flicker = Vec::new();
        for s in 120..220i64 {
            let lull = (120..160).contains(&s);
            if !lull && s % 2 == 0 {
                p.on_event(&trade_event("M1", s, n));
                n += 1;
            }
            if s % 5 == 0 {
                flicker.extend(p.housekeeping(t(s)));
            }
        }
        assert!(
            flicker.is_empty(),
            "unexpected transitions: {:?}",
            flicker
                .iter()
                .map(|s| s.metadata["new_regime"].clone())
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn close_window_forces_pre_settle_immediately() {
        let mut p = processor();
        // Close in 10 minutes: inside the 15-minute pre-settle window.
        p.on_event(&lifecycle_event("M1", 0, Some(600)));
        let signals = p.housekeeping(t(5));
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].metadata["new_regime"].as_str(), Some("PRE_SETTLE"));
        assert!((signals[0].strength - 1.0).abs() < 1e-12);
    }

    #[test]
    fn terminal_lifecycle_drops_the_tracker() {
        let mut p = processor();
        p.on_event(&trade_event("M1", 0, 0));
        assert_eq!(p.markets.len(), 1);
        p.on_event(&RawEvent::Lifecycle(LifecycleEvent {
            ts: t(10),
            market_ticker: "M1".into(),
            status: MarketStatus::Settled,
            result: Some(Side::Yes),
            event_id: None,
            series_id: None,
            close_time: None,
        }));
        assert!(p.markets.is_empty());
    }

    #[test]
    fn depth_imbalance_uses_best_levels() {
        let mut tracker = RegimeTracker::new(t(0));
        tracker.apply_book_delta(&OrderbookDelta {
            ts: t(0),
            market_ticker: "M1".into(),
            side: Side::Yes,
            price: 55,
            delta: 90,
            is_own_order: None,
        });
        tracker.apply_book_delta(&OrderbookDelta {
            ts: t(0),
            market_ticker: "M1".into(),
            side: Side::Yes,
            price: 40,
            delta: 500,
            is_own_order: None,
        });
        tracker.apply_book_delta(&OrderbookDelta {
            ts: t(0),
            market_ticker: "M1".into(),
            side: Side::No,
            price: 45,
            delta: 10,
            is_own_order: None,
        });
        // Best yes level (55 @ 90) vs best no level (45 @ 10): the deep
        // level at 40 must not count.
        assert!((tracker.depth_imbalance() - 0.8).abs() < 1e-12);
    }
}
