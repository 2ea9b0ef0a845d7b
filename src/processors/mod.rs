// =============================================================================
// Processor scaffolding — the shared worker contract
// =============================================================================
//
// Every processor is a single-threaded state machine behind the same worker
// loop: read a batch from its input streams under a durable consumer group,
// step the state machine per event, publish whatever signals came out, then
// ack. Acks happen only after processing and publishing succeed, so a crash
// loses at most the in-flight batch and the broker redelivers it on restart.
//
// Error taxonomy in the loop:
//   - transient bus errors  -> capped exponential backoff, input is never
//                              dropped (the broker retains it)
//   - malformed payloads    -> acked immediately, counted, logged once
//   - invariant violations  -> the worker returns an error and the process
//                              dies; the supervisor restarts it
//
// Signals are published to the processor's typed stream first and the fan-in
// stream last; the aggregator dedupes by signal_id, so a retried fan-in
// publish is benign.

pub mod cross_market;
pub mod lifecycle;
pub mod oi_divergence;
pub mod regime;
pub mod toxicity;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::bus::{streams, Bus};
use crate::config::WorkerConfig;
use crate::events::RawEvent;
use crate::signal::{Direction, Signal, SignalType};

/// Backoff floor and ceiling for transient bus errors.
const BACKOFF_MIN: Duration = Duration::from_millis(250);
const BACKOFF_MAX: Duration = Duration::from_secs(10);
/// Publish attempts before the worker gives up and halts.
const PUBLISH_MAX_ATTEMPTS: u32 = 8;
/// Event-time cadence of the housekeeping call into the processor.
const HOUSEKEEPING_PERIOD_SECS: i64 = 1;

// =============================================================================
// Processor trait
// =============================================================================

/// A stateful stream transducer: events in, signals out. Implementations own
/// all their per-market state and are driven by exactly one worker loop, so
/// no interior locking is needed.
pub trait Processor: Send {
    fn name(&self) -> &'static str;

    /// Raw streams this processor subscribes to.
    fn input_streams(&self) -> &'static [&'static str];

    /// Fold one event into state, returning any signals it produced.
    fn on_event(&mut self, event: &RawEvent) -> Vec<Signal>;

    /// Periodic sweep at event-time cadence (expiry, cadence-driven evals).
    fn housekeeping(&mut self, _now: DateTime<Utc>) -> Vec<Signal> {
        Vec::new()
    }
}

// =============================================================================
// Emit gate
// =============================================================================

#[derive(Debug, Clone)]
struct EmitRecord {
    ts: DateTime<Utc>,
    strength: f64,
    ttl_seconds: i64,
}

/// Chatter suppression, keyed by (market, type, direction).
///
/// A same-key signal is suppressed inside the cooldown window outright, and
/// while the prior signal is still alive unless its strength moved by at
/// least the configured delta. Once the prior signal has expired the gate
/// opens again regardless of delta.
pub struct EmitGate {
    cooldown_secs: i64,
    min_delta: f64,
    last: HashMap<(String, SignalType, Direction), EmitRecord>,
}

impl EmitGate {
    pub fn new(cooldown_secs: i64, min_delta: f64) -> Self {
        Self {
            cooldown_secs,
            min_delta,
            last: HashMap::new(),
        }
    }

    pub fn allows(&self, signal: &Signal) -> bool {
        // Regime transitions are already debounced by hysteresis and the
        // regime log must see every one of them.
        if signal.signal_type == SignalType::Regime {
            return true;
        }
        let key = (
            signal.market_ticker.clone(),
            signal.signal_type,
            signal.direction,
        );
        let Some(prev) = self.last.get(&key) else {
            return true;
        };
        let elapsed = (signal.ts - prev.ts).num_seconds();
        if elapsed < self.cooldown_secs {
            return false;
        }
        if elapsed >= prev.ttl_seconds {
            return true;
        }
        (signal.strength - prev.strength).abs() >= self.min_delta
    }

    pub fn record(&mut self, signal: &Signal) {
        self.last.insert(
            (
                signal.market_ticker.clone(),
                signal.signal_type,
                signal.direction,
            ),
            EmitRecord {
                ts: signal.ts,
                strength: signal.strength,
                ttl_seconds: signal.ttl_seconds,
            },
        );
    }

    /// Drop gate entries whose signal expired long ago.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let cooldown = self.cooldown_secs;
        self.last.retain(|_, rec| {
            let horizon = rec.ttl_seconds.max(cooldown) * 2;
            (now - rec.ts).num_seconds() < horizon
        });
    }
}

// =============================================================================
// Worker counters
// =============================================================================

/// Lock-free counters, logged periodically and on shutdown.
#[derive(Default)]
pub struct WorkerCounters {
    pub processed: AtomicU64,
    pub emitted: AtomicU64,
    pub malformed: AtomicU64,
    pub suppressed: AtomicU64,
}

impl WorkerCounters {
    fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.processed.load(Ordering::Relaxed),
            self.emitted.load(Ordering::Relaxed),
            self.malformed.load(Ordering::Relaxed),
            self.suppressed.load(Ordering::Relaxed),
        )
    }
}

// =============================================================================
// Worker
// =============================================================================

/// The generic worker loop wrapping one processor instance.
pub struct Worker<P: Processor> {
    processor: P,
    bus: Arc<dyn Bus>,
    cfg: WorkerConfig,
    group: String,
    consumer: String,
    stop: watch::Receiver<bool>,
    gate: EmitGate,
    counters: Arc<WorkerCounters>,
    last_housekeeping: Option<DateTime<Utc>>,
    high_water_ts: Option<DateTime<Utc>>,
    last_stats_log: std::time::Instant,
}

impl<P: Processor> Worker<P> {
    pub fn new(
        processor: P,
        bus: Arc<dyn Bus>,
        cfg: WorkerConfig,
        group_prefix: &str,
        instance_id: &str,
        stop: watch::Receiver<bool>,
    ) -> Self {
        let group = format!("{}:{}", group_prefix, processor.name());
        let consumer = format!("{}-{}", processor.name(), instance_id);
        let gate = EmitGate::new(cfg.cooldown_sec, cfg.min_emit_delta);
        Self {
            processor,
            bus,
            cfg,
            group,
            consumer,
            stop,
            gate,
            counters: Arc::new(WorkerCounters::default()),
            last_housekeeping: None,
            high_water_ts: None,
            last_stats_log: std::time::Instant::now(),
        }
    }

    pub fn counters(&self) -> Arc<WorkerCounters> {
        self.counters.clone()
    }

    fn stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Main loop. Returns `Ok(())` on cooperative shutdown and `Err` on an
    /// unrecoverable failure (persistent publish failure, invariant
    /// violation), in which case the process should exit.
    pub async fn run(mut self) -> Result<()> {
        let streams = self.processor.input_streams();
        self.bus
            .ensure_group(streams, &self.group)
            .await
            .with_context(|| format!("{}: ensure groups", self.processor.name()))?;

        info!(
            processor = self.processor.name(),
            group = %self.group,
            consumer = %self.consumer,
            streams = ?streams,
            "worker started"
        );

        let mut backoff = BACKOFF_MIN;
        while !self.stopped() {
            let batch = match self
                .bus
                .read_group(
                    streams,
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
                    warn!(
                        processor = self.processor.name(),
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "bus read failed, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                    continue;
                }
            };

            for entry in batch {
                self.handle_entry(entry).await?;
            }

            // Drive time-based state with the newest event time seen.
            if let Some(now) = self.high_water_ts {
                let due = self
                    .last_housekeeping
                    .map(|last| (now - last).num_seconds() >= HOUSEKEEPING_PERIOD_SECS)
                    .unwrap_or(true);
                if due {
                    self.last_housekeeping = Some(now);
                    let signals = self.processor.housekeeping(now);
                    self.emit_all(signals).await?;
                    self.gate.prune(now);
                }
            }

            if self.last_stats_log.elapsed() >= Duration::from_secs(60) {
                self.last_stats_log = std::time::Instant::now();
                let (processed, emitted, malformed, suppressed) = self.counters.snapshot();
                info!(
                    processor = self.processor.name(),
                    processed, emitted, malformed, suppressed, "worker stats"
                );
            }
        }

        let (processed, emitted, malformed, suppressed) = self.counters.snapshot();
        info!(
            processor = self.processor.name(),
            processed, emitted, malformed, suppressed, "worker stopped"
        );
        Ok(())
    }

    async fn handle_entry(&mut self, entry: crate::bus::StreamEntry) -> Result<()> {
        match RawEvent::parse(&entry.stream, &entry.payload) {
            Ok(event) => {
                self.high_water_ts = Some(match self.high_water_ts {
                    Some(hw) => hw.max(event.ts()),
                    None => event.ts(),
                });
                let signals = self.processor.on_event(&event);
                self.counters.processed.fetch_add(1, Ordering::Relaxed);
                self.emit_all(signals).await?;
            }
            Err(e) => {
                // Poison message: never redelivered, only counted.
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    processor = self.processor.name(),
                    stream = %entry.stream,
                    id = %entry.id,
                    error = %e,
                    "malformed event acked and skipped"
                );
            }
        }
        self.ack_with_retry(&entry.stream, &entry.id).await
    }

    async fn emit_all(&mut self, signals: Vec<Signal>) -> Result<()> {
        for signal in signals {
            // A processor that builds an out-of-range signal is broken;
            // never publish it, crash instead.
            if let Err(e) = signal.validate() {
                error!(
                    processor = self.processor.name(),
                    market = %signal.market_ticker,
                    error = %e,
                    "invariant violation in produced signal"
                );
                return Err(e.context("signal invariant violation"));
            }

            if !self.gate.allows(&signal) {
                self.counters.suppressed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    processor = self.processor.name(),
                    market = %signal.market_ticker,
                    signal_type = %signal.signal_type,
                    "signal suppressed by emit gate"
                );
                continue;
            }

            let payload = serde_json::to_value(&signal).context("serialize signal")?;
            self.publish_with_retry(signal.signal_type.stream(), &payload)
                .await?;
            self.publish_with_retry(streams::SIGNALS_ALL, &payload)
                .await?;

            self.gate.record(&signal);
            self.counters.emitted.fetch_add(1, Ordering::Relaxed);
            info!(
                processor = self.processor.name(),
                market = %signal.market_ticker,
                signal_type = %signal.signal_type,
                direction = %signal.direction,
                strength = format!("{:.3}", signal.strength),
                confidence = format!("{:.3}", signal.confidence),
                "signal emitted"
            );
        }
        Ok(())
    }

    async fn publish_with_retry(&self, stream: &str, payload: &serde_json::Value) -> Result<()> {
        let mut backoff = BACKOFF_MIN;
        for attempt in 1..=PUBLISH_MAX_ATTEMPTS {
            match self.bus.publish(stream, payload).await {
                Ok(_) => return Ok(()),
                Err(e) if attempt == PUBLISH_MAX_ATTEMPTS => {
                    return Err(e)
                        .with_context(|| format!("persistent publish failure on {stream}"));
                }
                Err(e) => {
                    warn!(
                        processor = self.processor.name(),
                        stream,
                        attempt,
                        error = %e,
                        "publish failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
            }
        }
        unreachable!("publish retry loop always returns");
    }

    async fn ack_with_retry(&self, stream: &str, id: &str) -> Result<()> {
        let mut backoff = BACKOFF_MIN;
        for attempt in 1..=PUBLISH_MAX_ATTEMPTS {
            match self.bus.ack(stream, &self.group, id).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt == PUBLISH_MAX_ATTEMPTS => {
                    return Err(e).with_context(|| format!("persistent ack failure on {stream}"));
                }
                Err(e) => {
                    warn!(
                        processor = self.processor.name(),
                        stream,
                        attempt,
                        error = %e,
                        "ack failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
            }
        }
        unreachable!("ack retry loop always returns");
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{SignalIdGen, Urgency};
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn signal(ts: DateTime<Utc>, strength: f64) -> Signal {
        Signal {
            signal_id: SignalIdGen::new("test").next(),
            ts,
            signal_type: SignalType::ToxicityVpin,
            market_ticker: "M1".into(),
            event_id: None,
            series_id: None,
            direction: Direction::BuyYes,
            strength,
            confidence: 1.0,
            urgency: Urgency::Normal,
            ttl_seconds: 300,
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn gate_passes_first_signal() {
        let gate = EmitGate::new(30, 0.05);
        assert!(gate.allows(&signal(t(0), 0.5)));
    }

    #[test]
    fn gate_blocks_inside_cooldown() {
        let mut gate = EmitGate::new(30, 0.05);
        let first = signal(t(0), 0.5);
        gate.record(&first);
        assert!(!gate.allows(&signal(t(10), 0.9)));
    }

    #[test]
    fn gate_requires_delta_while_prior_is_alive() {
        let mut gate = EmitGate::new(30, 0.05);
        gate.record(&signal(t(0), 0.50));
        // Past cooldown but prior still active and delta too small.
        assert!(!gate.allows(&signal(t(60), 0.52)));
        assert!(gate.allows(&signal(t(60), 0.60)));
    }

    #[test]
    fn gate_reopens_after_prior_expires() {
        let mut gate = EmitGate::new(30, 0.05);
        gate.record(&signal(t(0), 0.50));
        assert!(gate.allows(&signal(t(301), 0.50)));
    }

    #[test]
    fn gate_keys_include_direction() {
        let mut gate = EmitGate::new(30, 0.05);
        gate.record(&signal(t(0), 0.50));
        let mut other = signal(t(5), 0.50);
        other.direction = Direction::BuyNo;
        assert!(gate.allows(&other));
    }

    #[test]
    fn gate_never_thins_regime_transitions() {
        let mut gate = EmitGate::new(30, 0.05);
        let mut first = signal(t(0), 0.4);
        first.signal_type = SignalType::Regime;
        first.direction = Direction::Neutral;
        gate.record(&first);
        let mut second = signal(t(15), 0.6);
        second.signal_type = SignalType::Regime;
        second.direction = Direction::Neutral;
        assert!(gate.allows(&second));
    }

    #[test]
    fn gate_prune_drops_ancient_entries() {
        let mut gate = EmitGate::new(30, 0.05);
        gate.record(&signal(t(0), 0.5));
        gate.prune(t(10_000));
        assert!(gate.last.is_empty());
    }

    // ── Worker loop over the in-process bus ─────────────────────────────

    use crate::bus::MemoryBus;
    use crate::config::VpinConfig;
    use crate::processors::toxicity::ToxicityProcessor;
    use crate::registry::MarketRegistry;
    use serde_json::json;

    fn trade_payload(secs: i64, n: usize) -> serde_json::Value {
        json!({
            "ts": t(secs).to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            "market_ticker": "M1",
            "yes_price": 55,
            "no_price": 45,
            "count": 100,
            "taker_side": "yes",
            "trade_id": format!("tr-{n}"),
        })
    }

    #[tokio::test]
    async fn worker_reads_processes_publishes_and_acks() {
        let bus = Arc::new(MemoryBus::new());
        let registry = Arc::new(MarketRegistry::new());
        let cfg = WorkerConfig {
            batch_size: 100,
            block_ms: 20,
            cooldown_sec: 30,
            min_emit_delta: 0.05,
        };
        let processor = ToxicityProcessor::new(
            VpinConfig {
                bucket_min_vol: 50.0,
                window: 50,
                threshold: 0.60,
                high: 0.80,
            },
            registry,
            "0",
        );
        let (stop_tx, stop_rx) = watch::channel(false);
        let worker = Worker::new(
            processor,
            bus.clone() as Arc<dyn Bus>,
            cfg,
            "test",
            "0",
            stop_rx,
        );
        let counters = worker.counters();
        let handle = tokio::spawn(worker.run());

        // Let the worker create its consumer group before publishing.
        tokio::time::sleep(Duration::from_millis(100)).await;
        bus.publish(streams::TRADES, &json!({ "garbage": true }))
            .await
            .unwrap();
        for n in 0..60usize {
            bus.publish(streams::TRADES, &trade_payload(n as i64, n))
                .await
                .unwrap();
        }

        // One-sided flow: the VPIN signal should land on both streams.
        let mut waited = 0u64;
        while bus.dump(streams::SIGNALS_ALL).is_empty() && waited < 5000 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            waited += 50;
        }

        stop_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        let all = bus.dump(streams::SIGNALS_ALL);
        let typed = bus.dump(streams::SIGNALS_FLOW_TOXICITY);
        assert!(!all.is_empty());
        assert_eq!(all.len(), typed.len());
        assert_eq!(all[0]["signal_type"], "toxicity_vpin");
        assert_eq!(all[0]["market_ticker"], "M1");

        // Poison record counted, everything acked.
        assert_eq!(counters.malformed.load(Ordering::Relaxed), 1);
        assert_eq!(counters.processed.load(Ordering::Relaxed), 60);
        assert_eq!(bus.pending_count(streams::TRADES, "test:flow_toxicity"), 0);
    }
}
