// =============================================================================
// OI-Divergence Processor — open-interest flow vs price
// =============================================================================
//
// Tracks an event-time EWMA of open-interest deltas (`oi_velocity`) per
// market and z-scores it against its own recent history. A large velocity
// z-score combined with the short-horizon price change classifies the flow
// into one of four subtypes:
//
//   z >= +2, dp > 0  new_longs         -> buy_yes
//   z <= -2, dp > 0  short_covering    -> buy_no   (weaker)
//   z >= +2, dp < 0  new_shorts        -> buy_no
//   z <= -2, dp < 0  long_liquidation  -> buy_yes  (weaker, mean-reversion)

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::debug;

use crate::bus::streams;
use crate::config::OiConfig;
use crate::events::{RawEvent, TickerUpdate};
use crate::registry::MarketRegistry;
use crate::signal::{Direction, Signal, SignalIdGen, SignalType, Urgency};
use crate::stats::{clamp01, Ewma, RollingWindow, TimedWindow};

use super::Processor;

/// Horizon for the short-term price change, seconds.
const PRICE_HORIZON_SECS: i64 = 300;
/// Velocity history length and the minimum samples before z-scores count.
const VELOCITY_WINDOW: usize = 120;
const VELOCITY_MIN_SAMPLES: usize = 20;
/// Counter-flow subtypes carry less conviction.
const WEAK_SUBTYPE_FACTOR: f64 = 0.6;
const IDLE_EVICT_SECS: i64 = 3600;
const OI_TTL_SECS: i64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Subtype {
    NewLongs,
    ShortCovering,
    NewShorts,
    LongLiquidation,
}

impl Subtype {
    fn label(self) -> &'static str {
        match self {
            Self::NewLongs => "new_longs",
            Self::ShortCovering => "short_covering",
            Self::NewShorts => "new_shorts",
            Self::LongLiquidation => "long_liquidation",
        }
    }

    fn direction(self) -> Direction {
        match self {
            Self::NewLongs | Self::LongLiquidation => Direction::BuyYes,
            Self::ShortCovering | Self::NewShorts => Direction::BuyNo,
        }
    }

    /// Covering / liquidation flows are mean-reversion reads, not conviction.
    fn is_weak(self) -> bool {
        matches!(self, Self::ShortCovering | Self::LongLiquidation)
    }
}

// =============================================================================
// Per-market state
// =============================================================================

struct OiState {
    oi_velocity: Ewma,
    velocity_history: RollingWindow,
    prices: TimedWindow,
    /// Std of the velocity window at the previous update, for the
    /// variance-stability term of confidence.
    prev_std: Option<f64>,
    last_update_ts: DateTime<Utc>,
}

impl OiState {
    fn new(half_life_secs: f64, now: DateTime<Utc>) -> Self {
        Self {
            oi_velocity: Ewma::new(half_life_secs),
            velocity_history: RollingWindow::new(VELOCITY_WINDOW),
            prices: TimedWindow::new(PRICE_HORIZON_SECS),
            prev_std: None,
            last_update_ts: now,
        }
    }
}

// =============================================================================
// Processor
// =============================================================================

pub struct OiDivergenceProcessor {
    cfg: OiConfig,
    ids: SignalIdGen,
    registry: Arc<MarketRegistry>,
    markets: HashMap<String, OiState>,
}

impl OiDivergenceProcessor {
    pub fn new(cfg: OiConfig, registry: Arc<MarketRegistry>, instance_id: &str) -> Self {
        Self {
            cfg,
            ids: SignalIdGen::new(format!("oi-divergence-{instance_id}")),
            registry,
            markets: HashMap::new(),
        }
    }

    fn on_ticker(&mut self, update: &TickerUpdate) -> Vec<Signal> {
        let half_life = self.cfg.ewma_halflife_sec;
        let state = self
            .markets
            .entry(update.market_ticker.clone())
            .or_insert_with(|| OiState::new(half_life, update.ts));
        state.last_update_ts = update.ts;

        if let Some(price) = update.price {
            state.prices.push(update.ts, price as f64);
        }
        state.prices.prune(update.ts);

        let velocity = state
            .oi_velocity
            .update(update.ts, update.open_interest_delta as f64);

        let zscore = state
            .velocity_history
            .zscore(velocity, VELOCITY_MIN_SAMPLES);
        let std_now = state.velocity_history.std();
        state.velocity_history.push(velocity);

        // Variance stability: a window whose dispersion is jumping around is
        // a window we should not trust yet.
        let stability = match (state.prev_std, std_now) {
            (Some(prev), Some(now)) if prev > f64::EPSILON => {
                clamp01(1.0 - ((now - prev).abs() / prev))
            }
            _ => 0.0,
        };
        state.prev_std = std_now;

        let Some(z) = zscore else {
            return Vec::new();
        };
        if z.abs() < self.cfg.zscore_threshold {
            return Vec::new();
        }
        let Some(price_delta) = state.prices.delta() else {
            return Vec::new();
        };
        if price_delta == 0.0 {
            return Vec::new();
        }

        let subtype = match (z > 0.0, price_delta > 0.0) {
            (true, true) => Subtype::NewLongs,
            (false, true) => Subtype::ShortCovering,
            (true, false) => Subtype::NewShorts,
            (false, false) => Subtype::LongLiquidation,
        };

        let fill = state.velocity_history.fill_ratio();
        let confidence = clamp01(0.5 * fill + 0.5 * stability);
        let mut strength = clamp01(z.abs() / 4.0);
        if subtype.is_weak() {
            strength *= WEAK_SUBTYPE_FACTOR;
        }

        debug!(
            market = %update.market_ticker,
            subtype = subtype.label(),
            zscore = format!("{:+.2}", z),
            velocity = format!("{:+.2}", velocity),
            price_delta,
            "oi divergence detected"
        );

        vec![Signal {
            signal_id: self.ids.next(),
            ts: update.ts,
            signal_type: SignalType::OiDivergence,
            market_ticker: update.market_ticker.clone(),
            event_id: self.registry.event_id(&update.market_ticker),
            series_id: self.registry.series_id(&update.market_ticker),
            direction: subtype.direction(),
            strength,
            confidence,
            urgency: Urgency::Normal,
            ttl_seconds: OI_TTL_SECS,
            metadata: json!({
                "oi_velocity": velocity,
                "oi_velocity_zscore": z,
                "price_delta": price_delta,
                "subtype": subtype.label(),
            }),
        }]
    }
}

impl Processor for OiDivergenceProcessor {
    fn name(&self) -> &'static str {
        "oi_divergence"
    }

    fn input_streams(&self) -> &'static [&'static str] {
        &[streams::TICKER_UPDATES]
    }

    fn on_event(&mut self, event: &RawEvent) -> Vec<Signal> {
        match event {
            RawEvent::Ticker(update) => self.on_ticker(update),
            _ => Vec::new(),
        }
    }

    fn housekeeping(&mut self, now: DateTime<Utc>) -> Vec<Signal> {
        let cutoff = now - Duration::seconds(IDLE_EVICT_SECS);
        self.markets.retain(|_, s| s.last_update_ts >= cutoff);
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

    fn update(market: &str, secs: i64, oi_delta: i64, price: i64) -> TickerUpdate {
        TickerUpdate {
            ts: t(secs),
            market_ticker: market.into(),
            price: Some(price),
            volume_delta: 0,
            open_interest_delta: oi_delta,
            dollar_volume_delta: None,
            dollar_open_interest_delta: None,
        }
    }

    fn processor() -> OiDivergenceProcessor {
        let cfg = OiConfig {
            zscore_threshold: 2.0,
            ewma_halflife_sec: 300.0,
        };
        OiDivergenceProcessor::new(cfg, Arc::new(MarketRegistry::new()), "0")
    }

    /// Quiet warmup (alternating small deltas, flat price) followed by a
    /// directional OI burst with a price trend.
    fn run_scenario(oi_burst: i64, price_step: i64) -> Vec<Signal> {
        let mut p = processor();
        let mut signals = Vec::new();
        for i in 0..60i64 {
            let delta = if i % 2 == 0 { 10 } else { -10 };
            signals.extend(p.on_ticker(&update("M1", i * 5, delta, 50)));
        }
        for i in 0..10i64 {
            let price = 50 + (i + 1) * price_step;
            signals.extend(p.on_ticker(&update("M1", 300 + i * 5, oi_burst, price)));
        }
        signals
    }

    #[test]
    fn rising_oi_rising_price_is_new_longs() {
        let signals = run_scenario(500, 1);
        assert!(!signals.is_empty());
        let s = &signals[0];
        assert_eq!(s.direction, Direction::BuyYes);
        assert_eq!(s.metadata["subtype"], "new_longs");
        assert!(s.metadata["oi_velocity_zscore"].as_f64().unwrap() >= 2.0);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn falling_oi_rising_price_is_short_covering() {
        let signals = run_scenario(-500, 1);
        assert!(!signals.is_empty());
        let s = &signals[0];
        assert_eq!(s.direction, Direction::BuyNo);
        assert_eq!(s.metadata["subtype"], "short_covering");
    }

    #[test]
    fn rising_oi_falling_price_is_new_shorts() {
        let signals = run_scenario(500, -1);
        assert!(!signals.is_empty());
        let s = &signals[0];
        assert_eq!(s.direction, Direction::BuyNo);
        assert_eq!(s.metadata["subtype"], "new_shorts");
    }

    #[test]
    fn falling_oi_falling_price_is_long_liquidation() {
        let signals = run_scenario(-500, -1);
        assert!(!signals.is_empty());
        let s = &signals[0];
        assert_eq!(s.direction, Direction::BuyYes);
        assert_eq!(s.metadata["subtype"], "long_liquidation");
    }

    #[test]
    fn weak_subtypes_are_discounted_for_their_zscore() {
        let strong = run_scenario(500, 1);
        let s = &strong[0];
        let z = s.metadata["oi_velocity_zscore"].as_f64().unwrap();
        assert!((s.strength - clamp01(z.abs() / 4.0)).abs() < 1e-9);

        let weak = run_scenario(-500, 1);
        let w = &weak[0];
        let wz = w.metadata["oi_velocity_zscore"].as_f64().unwrap();
        assert!((w.strength - WEAK_SUBTYPE_FACTOR * clamp01(wz.abs() / 4.0)).abs() < 1e-9);
    }

    #[test]
    fn quiet_flow_emits_nothing() {
        let mut p = processor();
        let mut signals = Vec::new();
        for i in 0..200i64 {
            let delta = if i % 2 == 0 { 10 } else { -10 };
            signals.extend(p.on_ticker(&update("M1", i * 5, delta, 50)));
        }
        assert!(signals.is_empty());
    }

    #[test]
    fn flat_price_suppresses_classification() {
        let mut p = processor();
        let mut signals = Vec::new();
        for i in 0..60i64 {
            let delta = if i % 2 == 0 { 10 } else { -10 };
            signals.extend(p.on_ticker(&update("M1", i * 5, delta, 50)));
        }
        for i in 0..10i64 {
            signals.extend(p.on_ticker(&update("M1", 300 + i * 5, 500, 50)));
        }
        assert!(signals.is_empty());
    }
}
