// =============================================================================
// Flow-Toxicity Processor — VPIN over equal-volume buckets
// =============================================================================
//
// Volume-Synchronized Probability of Informed Trading, per market. Trades
// accumulate into buckets of an adaptive target volume (trailing one-minute
// volume, floored); each closed bucket contributes one absolute buy/sell
// imbalance to a sliding window, and VPIN is the window mean. A signal fires
// when VPIN crosses the threshold from below while the closing bucket has a
// directional lean.
//
// A secondary burst sub-signal fires when a bucket closes abnormally fat and
// fast: volume at least three times the rolling bucket mean, filled in ten
// seconds or less.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::debug;

use crate::bus::streams;
use crate::config::VpinConfig;
use crate::events::{RawEvent, Side, Trade};
use crate::registry::MarketRegistry;
use crate::signal::{Direction, Signal, SignalIdGen, SignalType, Urgency};
use crate::stats::{clamp01, RollingWindow, TimedWindow};

use super::Processor;

/// Bucket volume must exceed the rolling bucket mean by this factor.
const BURST_VOLUME_FACTOR: f64 = 3.0;
/// Maximum bucket fill time for a burst, seconds.
const BURST_MAX_FILL_SECS: i64 = 10;
/// Closed buckets needed before burst z-scores are trusted.
const BURST_MIN_BUCKETS: usize = 10;
/// Idle markets are dropped after this long without a trade.
const IDLE_EVICT_SECS: i64 = 3600;

const VPIN_TTL_SECS: i64 = 300;
const BURST_TTL_SECS: i64 = 120;

// =============================================================================
// Per-market state
// =============================================================================

#[derive(Debug)]
struct FlowState {
    /// Current bucket accumulation, in contracts.
    bucket_buy: f64,
    bucket_sell: f64,
    bucket_opened: Option<DateTime<Utc>>,
    /// Adaptive bucket close target, recomputed on every close.
    bucket_target: f64,
    /// Absolute imbalance of the last K closed buckets.
    imbalances: VecDeque<f64>,
    /// Volumes of recently closed buckets, for burst z-scores.
    bucket_volumes: RollingWindow,
    /// Contract volume over the trailing minute, for target sizing.
    minute_volume: TimedWindow,
    last_vpin: Option<f64>,
    last_trade_ts: DateTime<Utc>,
}

impl FlowState {
    fn new(min_vol: f64, now: DateTime<Utc>) -> Self {
        Self {
            bucket_buy: 0.0,
            bucket_sell: 0.0,
            bucket_opened: None,
            bucket_target: min_vol,
            imbalances: VecDeque::new(),
            bucket_volumes: RollingWindow::new(60),
            minute_volume: TimedWindow::new(60),
            last_vpin: None,
            last_trade_ts: now,
        }
    }

    fn bucket_volume(&self) -> f64 {
        self.bucket_buy + self.bucket_sell
    }
}

/// Everything signal construction needs from one closed bucket.
struct BucketEval {
    vpin: f64,
    prev_vpin: f64,
    filled: usize,
    signed_imbalance: f64,
    volume: f64,
    fill_secs: i64,
    closed_at: DateTime<Utc>,
    burst_z: Option<f64>,
    burst_mean: Option<f64>,
    burst_fill: f64,
}

// =============================================================================
// Processor
// =============================================================================

pub struct ToxicityProcessor {
    cfg: VpinConfig,
    ids: SignalIdGen,
    registry: Arc<MarketRegistry>,
    markets: HashMap<String, FlowState>,
}

impl ToxicityProcessor {
    pub fn new(cfg: VpinConfig, registry: Arc<MarketRegistry>, instance_id: &str) -> Self {
        Self {
            cfg,
            ids: SignalIdGen::new(format!("toxicity-{instance_id}")),
            registry,
            markets: HashMap::new(),
        }
    }

    fn on_trade(&mut self, trade: &Trade) -> Vec<Signal> {
        let min_vol = self.cfg.bucket_min_vol;
        let window = self.cfg.window;
        let state = self
            .markets
            .entry(trade.market_ticker.clone())
            .or_insert_with(|| FlowState::new(min_vol, trade.ts));

        let volume = trade.count as f64;
        state.last_trade_ts = trade.ts;
        state.minute_volume.push(trade.ts, volume);
        if state.bucket_opened.is_none() {
            state.bucket_opened = Some(trade.ts);
        }
        match trade.taker_side {
            Side::Yes => state.bucket_buy += volume,
            Side::No => state.bucket_sell += volume,
        }

        if state.bucket_volume() < state.bucket_target {
            return Vec::new();
        }

        // Close the bucket whole: a block trade may overshoot the target,
        // which is exactly what the burst detector wants to see.
        let bucket_volume = state.bucket_volume();
        let signed = (state.bucket_buy - state.bucket_sell) / bucket_volume;
        let opened = state.bucket_opened.unwrap_or(trade.ts);
        let fill_secs = (trade.ts - opened).num_seconds();

        state.bucket_buy = 0.0;
        state.bucket_sell = 0.0;
        state.bucket_opened = None;

        state.imbalances.push_back(signed.abs());
        while state.imbalances.len() > window {
            state.imbalances.pop_front();
        }

        let vpin = state.imbalances.iter().sum::<f64>() / state.imbalances.len() as f64;
        let prev_vpin = state.last_vpin.unwrap_or(0.0);
        state.last_vpin = Some(vpin);

        // Burst stats against buckets closed before this one.
        let burst_z = state.bucket_volumes.zscore(bucket_volume, BURST_MIN_BUCKETS);
        let burst_mean = state.bucket_volumes.mean();
        let burst_fill = state.bucket_volumes.fill_ratio();
        state.bucket_volumes.push(bucket_volume);

        // Retarget the next bucket from trailing one-minute volume.
        state.minute_volume.prune(trade.ts);
        state.bucket_target = state.minute_volume.sum().max(min_vol);

        let eval = BucketEval {
            vpin,
            prev_vpin,
            filled: state.imbalances.len(),
            signed_imbalance: signed,
            volume: bucket_volume,
            fill_secs,
            closed_at: trade.ts,
            burst_z,
            burst_mean,
            burst_fill,
        };

        debug!(
            market = %trade.market_ticker,
            vpin = format!("{:.3}", eval.vpin),
            filled = eval.filled,
            imbalance = format!("{:+.3}", eval.signed_imbalance),
            target = state.bucket_target,
            "bucket closed"
        );

        self.build_signals(&trade.market_ticker, &eval)
    }

    fn build_signals(&self, market: &str, eval: &BucketEval) -> Vec<Signal> {
        let mut out = Vec::new();
        let event_id = self.registry.event_id(market);
        let series_id = self.registry.series_id(market);

        // Upward threshold cross with a directional closing bucket.
        if eval.prev_vpin < self.cfg.threshold
            && eval.vpin >= self.cfg.threshold
            && eval.signed_imbalance.abs() > 0.0
        {
            let direction = if eval.signed_imbalance > 0.0 {
                Direction::BuyYes
            } else {
                Direction::BuyNo
            };
            out.push(Signal {
                signal_id: self.ids.next(),
                ts: eval.closed_at,
                signal_type: SignalType::ToxicityVpin,
                market_ticker: market.to_string(),
                event_id: event_id.clone(),
                series_id: series_id.clone(),
                direction,
                strength: clamp01((eval.vpin - 0.5) / 0.5),
                confidence: clamp01(eval.filled as f64 / self.cfg.window as f64),
                urgency: if eval.vpin > self.cfg.high {
                    Urgency::High
                } else {
                    Urgency::Normal
                },
                ttl_seconds: VPIN_TTL_SECS,
                metadata: json!({
                    "vpin": eval.vpin,
                    "bucket_count": eval.filled,
                    "last_imbalance": eval.signed_imbalance,
                }),
            });
        }

        // Burst: fat bucket filled fast.
        if let (Some(z), Some(mean)) = (eval.burst_z, eval.burst_mean) {
            if eval.volume >= BURST_VOLUME_FACTOR * mean
                && eval.fill_secs <= BURST_MAX_FILL_SECS
                && z > 0.0
            {
                let direction = if eval.signed_imbalance > 0.0 {
                    Direction::BuyYes
                } else if eval.signed_imbalance < 0.0 {
                    Direction::BuyNo
                } else {
                    Direction::Neutral
                };
                out.push(Signal {
                    signal_id: self.ids.next(),
                    ts: eval.closed_at,
                    signal_type: SignalType::ToxicityBurst,
                    market_ticker: market.to_string(),
                    event_id,
                    series_id,
                    direction,
                    strength: clamp01(z / 5.0),
                    confidence: clamp01(eval.burst_fill),
                    urgency: Urgency::High,
                    ttl_seconds: BURST_TTL_SECS,
                    metadata: json!({
                        "bucket_volume": eval.volume,
                        "volume_zscore": z,
                        "fill_secs": eval.fill_secs,
                    }),
                });
            }
        }

        out
    }
}

impl Processor for ToxicityProcessor {
    fn name(&self) -> &'static str {
        "flow_toxicity"
    }

    fn input_streams(&self) -> &'static [&'static str] {
        &[streams::TRADES]
    }

    fn on_event(&mut self, event: &RawEvent) -> Vec<Signal> {
        match event {
            RawEvent::Trade(trade) => self.on_trade(trade),
            _ => Vec::new(),
        }
    }

    fn housekeeping(&mut self, now: DateTime<Utc>) -> Vec<Signal> {
        let cutoff = now - Duration::seconds(IDLE_EVICT_SECS);
        self.markets.retain(|_, s| s.last_trade_ts >= cutoff);
        Vec::new()
    }
}
