// =============================================================================
// Aggregator — regime-aware fusion of active signals
// =============================================================================
//
// Consumes the fan-in signal stream and maintains, per market, the set of
// currently active signals: at most one per (type, direction), newest wins,
// opposite direction within a type evicts the prior call. Every change
// recomputes the weighted composite score, modulated by the market's last
// known regime and clamped to [-1, +1].
//
// Emission is throttled: a composite is published when the score moved
// enough, flipped sign, or the active set changed while the score is
// meaningful — plus a wall-clock heartbeat re-publish for markets that stay
// interesting. Event time drives everything else, including TTL expiry.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bus::{streams, Bus};
use crate::config::{AggregatorConfig, RegimeMultipliers, SignalWeights, WorkerConfig};
use crate::registry::MarketRegistry;
use crate::signal::{CompositeSignal, Direction, Regime, Signal, SignalType};

/// Active-set changes matter once the score is at least this large.
const SET_CHANGE_MIN_SCORE: f64 = 0.15;
/// Heartbeat re-publish requires at least this much score.
const HEARTBEAT_MIN_SCORE: f64 = 0.20;
/// Books with no active signals and no traffic for this long are dropped.
const IDLE_BOOK_EVICT_SECS: i64 = 3600;

// =============================================================================
// Per-market book
// =============================================================================

struct MarketBook {
    active: HashMap<(SignalType, Direction), Signal>,
    regime: Regime,
    last_emit: Option<(f64, usize)>,
    last_emit_wall: Option<Instant>,
    last_activity: DateTime<Utc>,
}

impl MarketBook {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            active: HashMap::new(),
            // An unclassified market is neither boosted nor damped.
            regime: Regime::Active,
            last_emit: None,
            last_emit_wall: None,
            last_activity: now,
        }
    }

    fn expire(&mut self, now: DateTime<Utc>) {
        self.active.retain(|_, s| s.expires_at() > now);
    }
}

// =============================================================================
// Fusion state
// =============================================================================

/// The pure fusion core: signals in, composites out. The bus worker below
/// wraps it; tests drive it directly.
pub struct AggregatorState {
    cfg: AggregatorConfig,
    weights: SignalWeights,
    multipliers: RegimeMultipliers,
    registry: Arc<MarketRegistry>,
    books: HashMap<String, MarketBook>,
    /// Sliding window of recently seen signal ids.
    seen: HashMap<String, DateTime<Utc>>,
}

impl AggregatorState {
    pub fn new(
        cfg: AggregatorConfig,
        weights: SignalWeights,
        multipliers: RegimeMultipliers,
        registry: Arc<MarketRegistry>,
    ) -> Self {
        Self {
            cfg,
            weights,
            multipliers,
            registry,
            books: HashMap::new(),
            seen: HashMap::new(),
        }
    }

    /// Fold one signal from the fan-in stream.
    pub fn on_signal(&mut self, signal: Signal) -> Option<CompositeSignal> {
        // At-least-once delivery upstream: drop replays by id.
        if self.seen.contains_key(&signal.signal_id) {
            return None;
        }
        self.seen.insert(signal.signal_id.clone(), signal.ts);

        let market = signal.market_ticker.clone();
        if self.registry.is_terminal(&market) {
            self.books.remove(&market);
            return None;
        }

        let now = signal.ts;
        let book = self
            .books
            .entry(market.clone())
            .or_insert_with(|| MarketBook::new(now));
        book.last_activity = now;
        book.expire(now);

        if signal.signal_type == SignalType::Regime {
            // Regime signals steer the multiplier; they are not held in the
            // active set.
            if let Some(regime) = signal
                .metadata
                .get("new_regime")
                .and_then(|v| v.as_str())
                .and_then(Regime::parse)
            {
                book.regime = regime;
            }
        } else {
            let key = (signal.signal_type, signal.direction);
            // Bus arrival order is not event-time order: an older signal
            // than the one already active is stale.
            if let Some(existing) = book.active.get(&key) {
                if existing.ts > signal.ts {
                    return None;
                }
            }
            book.active
                .remove(&(signal.signal_type, signal.direction.opposite()));
            book.active.insert(key, signal);
        }

        self.recompute(&market, now, false)
    }

    /// Event-time housekeeping: expiry, dedupe pruning, terminal flush and
    /// the wall-clock heartbeat re-publish.
    pub fn housekeeping(&mut self, now: DateTime<Utc>) -> Vec<CompositeSignal> {
        let dedupe_cutoff = now - chrono::Duration::seconds(self.cfg.dedupe_window_sec);
        self.seen.retain(|_, ts| *ts >= dedupe_cutoff);
        self.registry.sweep_terminal(now);

        let idle_cutoff = now - chrono::Duration::seconds(IDLE_BOOK_EVICT_SECS);
        let registry = self.registry.clone();
        self.books.retain(|market, book| {
            !registry.is_terminal(market)
                && (!book.active.is_empty() || book.last_activity >= idle_cutoff)
        });

        let markets: Vec<String> = self.books.keys().cloned().collect();
        let mut out = Vec::new();
        for market in markets {
            if let Some(book) = self.books.get_mut(&market) {
                book.expire(now);
            }
            if let Some(composite) = self.recompute(&market, now, true) {
                out.push(composite);
            }
        }
        out
    }

    /// Recompute the composite for one market and decide whether to emit.
    fn recompute(
        &mut self,
        market: &str,
        now: DateTime<Utc>,
        heartbeat_only: bool,
    ) -> Option<CompositeSignal> {
        let weights = &self.weights;
        let multipliers = &self.multipliers;
        let book = self.books.get_mut(market)?;

        let raw: f64 = book
            .active
            .values()
            .map(|s| s.direction.sign() * s.strength * s.confidence * weights.weight(s.signal_type))
            .sum();
        let score = (raw * multipliers.multiplier(book.regime)).clamp(-1.0, 1.0);
        let count = book.active.len();

        let emit = if heartbeat_only {
            match book.last_emit_wall {
                Some(wall) => {
                    wall.elapsed() >= Duration::from_secs(self.cfg.heartbeat_sec)
                        && score.abs() >= HEARTBEAT_MIN_SCORE
                }
                None => false,
            }
        } else {
            let (last_score, last_count) = book.last_emit.unwrap_or((0.0, 0));
            (score - last_score).abs() >= self.cfg.emit_delta
                || score * last_score < 0.0
                || (count != last_count && score.abs() >= SET_CHANGE_MIN_SCORE)
        };
        if !emit {
            return None;
        }

        let direction = if score.abs() < self.cfg.neutral_band {
            Direction::Neutral
        } else if score > 0.0 {
            Direction::BuyYes
        } else {
            Direction::BuyNo
        };

        let mut active_signal_ids: Vec<String> =
            book.active.values().map(|s| s.signal_id.clone()).collect();
        active_signal_ids.sort();

        book.last_emit = Some((score, count));
        book.last_emit_wall = Some(Instant::now());

        debug!(
            market,
            score = format!("{:+.4}", score),
            regime = %book.regime,
            active = count,
            "composite emitted"
        );

        Some(CompositeSignal {
            ts: now,
            market_ticker: market.to_string(),
            direction,
            composite_score: score,
            regime: book.regime,
            active_signal_count: active_signal_ids.len(),
            active_signal_ids,
        })
    }
}

// =============================================================================
// Bus worker
// =============================================================================

const BACKOFF_MIN: Duration = Duration::from_millis(250);
const BACKOFF_MAX: Duration = Duration::from_secs(10);
const HOUSEKEEPING_PERIOD_SECS: i64 = 1;

/// Worker loop wrapping [`AggregatorState`]: reads the fan-in stream under
/// its own consumer group and publishes composites.
pub struct AggregatorWorker {
    state: AggregatorState,
    bus: Arc<dyn Bus>,
    cfg: WorkerConfig,
    group: String,
    consumer: String,
    stop: watch::Receiver<bool>,
    processed: AtomicU64,
    malformed: AtomicU64,
    emitted: AtomicU64,
    last_housekeeping: Option<DateTime<Utc>>,
    high_water_ts: Option<DateTime<Utc>>,
}

impl AggregatorWorker {
    pub fn new(
        state: AggregatorState,
        bus: Arc<dyn Bus>,
        cfg: WorkerConfig,
        group_prefix: &str,
        instance_id: &str,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            state,
            bus,
            cfg,
            group: format!("{group_prefix}:aggregator"),
            consumer: format!("aggregator-{instance_id}"),
            stop,
            processed: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            emitted: AtomicU64::new(0),
            last_housekeeping: None,
            high_water_ts: None,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let inputs = [streams::SIGNALS_ALL];
        self.bus
            .ensure_group(&inputs, &self.group)
            .await
            .context("aggregator: ensure group")?;

        info!(group = %self.group, consumer = %self.consumer, "aggregator started");

        let mut backoff = BACKOFF_MIN;
        while !*self.stop.borrow() {
            let batch = match self
                .bus
                .read_group(
                    &inputs,
                    &self.group,
                    &self.consumer,
                    self.cfg.batch_size,
                    Duration::from_millis(self.cfg.block_ms),
                )
                .await
            {
                Ok(batch) => {
                    backoff = BACKOFF_MIN;
                    batch
                }
                Err(e) => {
                    warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "aggregator read failed, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                    continue;
                }
            };

            for entry in batch {
                match serde_json::from_value::<Signal>(entry.payload.clone()) {
                    Ok(signal) => {
                        self.high_water_ts = Some(match self.high_water_ts {
                            Some(hw) => hw.max(signal.ts),
                            None => signal.ts,
                        });
                        self.processed.fetch_add(1, Ordering::Relaxed);
                        if let Some(composite) = self.state.on_signal(signal) {
                            self.publish_composite(&composite).await?;
                        }
                    }
                    Err(e) => {
                        self.malformed.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            stream = %entry.stream,
                            id = %entry.id,
                            error = %e,
                            "malformed signal acked and skipped"
                        );
                    }
                }
                self.ack_with_retry(&entry.id).await?;
            }

            if let Some(now) = self.high_water_ts {
                let due = self
                    .last_housekeeping
                    .map(|last| (now - last).num_seconds() >= HOUSEKEEPING_PERIOD_SECS)
                    .unwrap_or(true);
                if due {
                    self.last_housekeeping = Some(now);
                    for composite in self.state.housekeeping(now) {
                        self.publish_composite(&composite).await?;
                    }
                }
            }
        }

        info!(
            processed = self.processed.load(Ordering::Relaxed),
            emitted = self.emitted.load(Ordering::Relaxed),
            malformed = self.malformed.load(Ordering::Relaxed),
            "aggregator stopped"
        );
        Ok(())
    }

    async fn ack_with_retry(&self, id: &str) -> Result<()> {
        let mut backoff = BACKOFF_MIN;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.bus.ack(streams::SIGNALS_ALL, &self.group, id).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= 8 => {
                    return Err(e).context("persistent ack failure on fan-in stream");
                }
                Err(e) => {
                    warn!(attempt, error = %e, "ack failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
            }
        }
    }

    async fn publish_composite(&self, composite: &CompositeSignal) -> Result<()> {
        let payload = serde_json::to_value(composite).context("serialize composite")?;
        let mut backoff = BACKOFF_MIN;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.bus.publish(streams::SIGNALS_COMPOSITE, &payload).await {
                Ok(_) => {
                    self.emitted.fetch_add(1, Ordering::Relaxed);
                    info!(
                        market = %composite.market_ticker,
                        score = format!("{:+.4}", composite.composite_score),
                        direction = %composite.direction,
                        regime = %composite.regime,
                        active = composite.active_signal_count,
                        "composite published"
                    );
                    return Ok(());
                }
                Err(e) if attempt >= 8 => {
                    return Err(e).context("persistent composite publish failure");
                }
                Err(e) => {
                    warn!(attempt, error = %e, "composite publish failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
            }
        }
    }
}
