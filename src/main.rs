// =============================================================================
// KASS — Prediction-Market Alpha Signal Pipeline
// =============================================================================
//
// One process hosts the five stream processors and the aggregator, each on
// its own task with its own durable consumer group, all joined by the
// stream bus. Shutdown is cooperative: SIGINT flips a stop flag, loops
// finish their in-flight batch and acks, then exit.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod aggregator;
mod bus;
mod config;
mod events;
mod processors;
mod registry;
mod signal;
mod stats;

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::aggregator::{AggregatorState, AggregatorWorker};
use crate::bus::{Bus, RedisBus};
use crate::config::Config;
use crate::processors::cross_market::CrossMarketProcessor;
use crate::processors::lifecycle::LifecycleProcessor;
use crate::processors::oi_divergence::OiDivergenceProcessor;
use crate::processors::regime::RegimeProcessor;
use crate::processors::toxicity::ToxicityProcessor;
use crate::processors::{Processor, Worker};
use crate::registry::MarketRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        KASS Alpha Signal Pipeline — Starting Up          ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = Config::from_env();
    info!(
        bus = %config.bus_url,
        group_prefix = %config.group_prefix,
        instance = %config.instance_id,
        "configuration loaded"
    );

    // ── 2. Bus & shared registry ─────────────────────────────────────────
    let bus: Arc<dyn Bus> = Arc::new(RedisBus::connect(&config.bus_url).await?);
    let registry = Arc::new(MarketRegistry::new());

    // ── 3. Cooperative shutdown flag ─────────────────────────────────────
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install SIGINT handler");
            return;
        }
        info!("shutdown requested, draining workers");
        let _ = stop_tx.send(true);
    });

    // ── 4. Spawn workers ─────────────────────────────────────────────────
    let instance = config.instance_id.clone();
    let mut workers: JoinSet<(&'static str, anyhow::Result<()>)> = JoinSet::new();

    let toxicity = ToxicityProcessor::new(config.vpin.clone(), registry.clone(), &instance);
    spawn_worker(&mut workers, "flow_toxicity", toxicity, &config, bus.clone(), stop_rx.clone());

    let oi = OiDivergenceProcessor::new(config.oi.clone(), registry.clone(), &instance);
    spawn_worker(&mut workers, "oi_divergence", oi, &config, bus.clone(), stop_rx.clone());

    let regime = RegimeProcessor::new(config.regime.clone(), registry.clone(), &instance);
    spawn_worker(&mut workers, "regime", regime, &config, bus.clone(), stop_rx.clone());

    let cross = CrossMarketProcessor::new(config.cross_market.clone(), registry.clone(), &instance);
    spawn_worker(&mut workers, "cross_market", cross, &config, bus.clone(), stop_rx.clone());

    let lifecycle = LifecycleProcessor::new(registry.clone(), &instance);
    spawn_worker(&mut workers, "lifecycle", lifecycle, &config, bus.clone(), stop_rx.clone());

    let agg_state = AggregatorState::new(
        config.aggregator.clone(),
        config.weights.clone(),
        config.regime_multipliers.clone(),
        registry.clone(),
    );
    let agg = AggregatorWorker::new(
        agg_state,
        bus.clone(),
        config.worker.clone(),
        &config.group_prefix,
        &instance,
        stop_rx.clone(),
    );
    workers.spawn(async move { ("aggregator", agg.run().await) });

    info!(workers = workers.len(), "pipeline running");

    // ── 5. Wait for workers ──────────────────────────────────────────────
    // A worker error is unrecoverable by design: exit and let the
    // supervisor restart the process with a clean slate.
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok((name, Ok(()))) => info!(worker = name, "worker exited cleanly"),
            Ok((name, Err(e))) => {
                error!(worker = name, error = %e, "worker failed");
                std::process::exit(1);
            }
            Err(e) => {
                error!(error = %e, "worker panicked");
                std::process::exit(1);
            }
        }
    }

    info!("pipeline stopped");
    Ok(())
}

fn spawn_worker<P: Processor + Sync + 'static>(
    workers: &mut JoinSet<(&'static str, anyhow::Result<()>)>,
    name: &'static str,
    processor: P,
    config: &Config,
    bus: Arc<dyn Bus>,
    stop: watch::Receiver<bool>,
) {
    let worker = Worker::new(
        processor,
        bus,
        config.worker.clone(),
        &config.group_prefix,
        &config.instance_id,
        stop,
    );
    workers.spawn(async move { (name, worker.run().await) });
}
