// =============================================================================
// Pipeline Configuration — env-driven tunables
// =============================================================================
//
// Every knob of the pipeline is an environment variable with a default. An
// unparseable value is never fatal: it logs a warning and falls back, so a
// bad deploy manifest degrades to defaults instead of crash-looping.

use serde::Serialize;
use tracing::warn;

use crate::signal::Regime;

// =============================================================================
// Env helpers
// =============================================================================

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T
where
    T: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, fallback = %default, "unparseable env var, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

// =============================================================================
// Sub-configs
// =============================================================================

/// Flow-toxicity (VPIN) processor tunables.
#[derive(Debug, Clone, Serialize)]
pub struct VpinConfig {
    /// Floor for the adaptive volume-bucket target, in contracts.
    pub bucket_min_vol: f64,
    /// Number of closed buckets in the sliding VPIN window.
    pub window: usize,
    /// Emission threshold VPIN must cross upward through.
    pub threshold: f64,
    /// VPIN level above which urgency escalates to high.
    pub high: f64,
}

/// OI-divergence processor tunables.
#[derive(Debug, Clone, Serialize)]
pub struct OiConfig {
    pub zscore_threshold: f64,
    pub ewma_halflife_sec: f64,
}

/// Regime state-machine tunables.
#[derive(Debug, Clone, Serialize)]
pub struct RegimeConfig {
    pub eval_period_sec: i64,
    pub hysteresis_sec: i64,
    /// Minutes before scheduled close at which PRE_SETTLE dominates.
    pub pre_settle_min: i64,
}

/// Cross-market propagation tunables.
#[derive(Debug, Clone, Serialize)]
pub struct CrossMarketConfig {
    /// Leader move size in cents that triggers a sibling scan.
    pub leader_min_move: i64,
    /// A sibling that moved more than this (cents) is not lagging.
    pub follower_max_move: i64,
    /// Lookback horizon for sibling moves, seconds.
    pub window_sec: i64,
}

/// Aggregator emission tunables.
#[derive(Debug, Clone, Serialize)]
pub struct AggregatorConfig {
    pub emit_delta: f64,
    pub neutral_band: f64,
    pub heartbeat_sec: u64,
    /// Sliding dedupe horizon for seen signal ids, seconds.
    pub dedupe_window_sec: i64,
}

/// Per-type fusion weights.
#[derive(Debug, Clone, Serialize)]
pub struct SignalWeights {
    pub toxicity_vpin: f64,
    pub toxicity_burst: f64,
    pub oi_divergence: f64,
    pub cross_market: f64,
    pub lifecycle_cascade: f64,
    pub lifecycle_new_market: f64,
}

impl SignalWeights {
    pub fn weight(&self, signal_type: crate::signal::SignalType) -> f64 {
        use crate::signal::SignalType::*;
        match signal_type {
            ToxicityVpin => self.toxicity_vpin,
            ToxicityBurst => self.toxicity_burst,
            OiDivergence => self.oi_divergence,
            CrossMarket => self.cross_market,
            LifecycleCascade => self.lifecycle_cascade,
            LifecycleNewMarket => self.lifecycle_new_market,
            // Regime signals steer the multiplier, they carry no weight.
            Regime => 0.0,
        }
    }
}

/// Regime multipliers applied to the weighted sum before clamping.
#[derive(Debug, Clone, Serialize)]
pub struct RegimeMultipliers {
    pub dead: f64,
    pub quiet: f64,
    pub active: f64,
    pub informed: f64,
    pub pre_settle: f64,
}

impl RegimeMultipliers {
    pub fn multiplier(&self, regime: Regime) -> f64 {
        match regime {
            Regime::Dead => self.dead,
            Regime::Quiet => self.quiet,
            Regime::Active => self.active,
            Regime::Informed => self.informed,
            Regime::PreSettle => self.pre_settle,
        }
    }
}

/// Worker-loop scaffolding tunables shared by every processor.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerConfig {
    /// Max events read per batch.
    pub batch_size: usize,
    /// Blocking read timeout, milliseconds.
    pub block_ms: u64,
    /// Per-(market, type, direction) emission cooldown, event-time seconds.
    pub cooldown_sec: i64,
    /// Minimum strength delta between successive signals of the same key.
    pub min_emit_delta: f64,
}

// =============================================================================
// Config
// =============================================================================

/// Full pipeline configuration, assembled once at startup.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub bus_url: String,
    pub group_prefix: String,
    pub instance_id: String,
    pub vpin: VpinConfig,
    pub oi: OiConfig,
    pub regime: RegimeConfig,
    pub cross_market: CrossMarketConfig,
    pub aggregator: AggregatorConfig,
    pub weights: SignalWeights,
    pub regime_multipliers: RegimeMultipliers,
    pub worker: WorkerConfig,
}

impl Config {
    /// Read the whole configuration surface from the environment.
    pub fn from_env() -> Self {
        Self {
            bus_url: env_string("BUS_URL", "redis://127.0.0.1:6379"),
            group_prefix: env_string("GROUP_PREFIX", "kass"),
            instance_id: env_string("INSTANCE_ID", "0"),
            vpin: VpinConfig {
                bucket_min_vol: env_parse("VPIN_BUCKET_MIN_VOL", 50.0),
                window: env_parse("VPIN_WINDOW", 50),
                threshold: env_parse("VPIN_THRESHOLD", 0.60),
                high: env_parse("VPIN_HIGH", 0.80),
            },
            oi: OiConfig {
                zscore_threshold: env_parse("OI_ZSCORE_THRESHOLD", 2.0),
                ewma_halflife_sec: env_parse("OI_EWMA_HALFLIFE_SEC", 300.0),
            },
            regime: RegimeConfig {
                eval_period_sec: env_parse("REGIME_EVAL_PERIOD_SEC", 5),
                hysteresis_sec: env_parse("REGIME_HYSTERESIS_SEC", 15),
                pre_settle_min: env_parse("PRE_SETTLE_MIN", 15),
            },
            cross_market: CrossMarketConfig {
                leader_min_move: env_parse("CROSS_LEADER_MIN_MOVE", 3),
                follower_max_move: env_parse("CROSS_FOLLOWER_MAX_MOVE", 1),
                window_sec: env_parse("CROSS_WINDOW_SEC", 120),
            },
            aggregator: AggregatorConfig {
                emit_delta: env_parse("AGG_EMIT_DELTA", 0.10),
                neutral_band: env_parse("AGG_NEUTRAL_BAND", 0.05),
                heartbeat_sec: env_parse("AGG_HEARTBEAT_SEC", 60),
                dedupe_window_sec: env_parse("AGG_DEDUPE_WINDOW_SEC", 300),
            },
            weights: SignalWeights {
                toxicity_vpin: env_parse("WEIGHT_TOXICITY_VPIN", 0.25),
                toxicity_burst: env_parse("WEIGHT_TOXICITY_BURST", 0.15),
                oi_divergence: env_parse("WEIGHT_OI_DIVERGENCE", 0.25),
                cross_market: env_parse("WEIGHT_CROSS_MARKET", 0.20),
                lifecycle_cascade: env_parse("WEIGHT_LIFECYCLE_CASCADE", 0.30),
                lifecycle_new_market: env_parse("WEIGHT_LIFECYCLE_NEW_MARKET", 0.15),
            },
            regime_multipliers: RegimeMultipliers {
                dead: env_parse("REGIME_MULT_DEAD", 0.2),
                quiet: env_parse("REGIME_MULT_QUIET", 0.6),
                active: env_parse("REGIME_MULT_ACTIVE", 1.0),
                informed: env_parse("REGIME_MULT_INFORMED", 1.3),
                pre_settle: env_parse("REGIME_MULT_PRE_SETTLE", 1.5),
            },
            worker: WorkerConfig {
                batch_size: env_parse("WORKER_BATCH_SIZE", 100),
                block_ms: env_parse("WORKER_BLOCK_MS", 1000),
                cooldown_sec: env_parse("EMIT_COOLDOWN_SEC", 30),
                min_emit_delta: env_parse("EMIT_MIN_DELTA", 0.05),
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        // Defaults only; deliberately does not consult the environment.
        Self {
            bus_url: "redis://127.0.0.1:6379".into(),
            group_prefix: "kass".into(),
            instance_id: "0".into(),
            vpin: VpinConfig {
                bucket_min_vol: 50.0,
                window: 50,
                threshold: 0.60,
                high: 0.80,
            },
            oi: OiConfig {
                zscore_threshold: 2.0,
                ewma_halflife_sec: 300.0,
            },
            regime: RegimeConfig {
                eval_period_sec: 5,
                hysteresis_sec: 15,
                pre_settle_min: 15,
            },
            cross_market: CrossMarketConfig {
                leader_min_move: 3,
                follower_max_move: 1,
                window_sec: 120,
            },
            aggregator: AggregatorConfig {
                emit_delta: 0.10,
                neutral_band: 0.05,
                heartbeat_sec: 60,
                dedupe_window_sec: 300,
            },
            weights: SignalWeights {
                toxicity_vpin: 0.25,
                toxicity_burst: 0.15,
                oi_divergence: 0.25,
                cross_market: 0.20,
                lifecycle_cascade: 0.30,
                lifecycle_new_market: 0.15,
            },
            regime_multipliers: RegimeMultipliers {
                dead: 0.2,
                quiet: 0.6,
                active: 1.0,
                informed: 1.3,
                pre_settle: 1.5,
            },
            worker: WorkerConfig {
                batch_size: 100,
                block_ms: 1000,
                cooldown_sec: 30,
                min_emit_delta: 0.05,
            },
        }
    }
}
