// =============================================================================
// Signal model — the typed output of every processor
// =============================================================================
//
// A Signal is one processor's observation about one market: a direction, a
// strength in [0, 1], a confidence in [0, 1] and a TTL after which it stops
// contributing to any composite. Signals are published to the processor's own
// stream and to the fan-in stream; the aggregator dedupes by `signal_id`, so
// re-publishing on retry is harmless.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Enums
// =============================================================================

/// Directional call on a binary market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    BuyYes,
    BuyNo,
    Neutral,
}

impl Direction {
    /// Numeric sign used in composite fusion.
    pub fn sign(self) -> f64 {
        match self {
            Self::BuyYes => 1.0,
            Self::BuyNo => -1.0,
            Self::Neutral => 0.0,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::BuyYes => Self::BuyNo,
            Self::BuyNo => Self::BuyYes,
            Self::Neutral => Self::Neutral,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BuyYes => write!(f, "buy_yes"),
            Self::BuyNo => write!(f, "buy_no"),
            Self::Neutral => write!(f, "neutral"),
        }
    }
}

/// How quickly downstream consumers should react.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Normal,
    High,
    Critical,
}

/// Every signal kind the pipeline can emit. The variant decides the typed
/// output stream and the fusion weight key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    ToxicityVpin,
    ToxicityBurst,
    OiDivergence,
    Regime,
    CrossMarket,
    LifecycleCascade,
    LifecycleNewMarket,
}

impl SignalType {
    /// The per-processor output stream this type is published to.
    pub fn stream(self) -> &'static str {
        use crate::bus::streams;
        match self {
            Self::ToxicityVpin | Self::ToxicityBurst => streams::SIGNALS_FLOW_TOXICITY,
            Self::OiDivergence => streams::SIGNALS_OI_DIVERGENCE,
            Self::Regime => streams::SIGNALS_REGIME,
            Self::CrossMarket => streams::SIGNALS_CROSS_MARKET,
            Self::LifecycleCascade | Self::LifecycleNewMarket => streams::SIGNALS_LIFECYCLE,
        }
    }
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ToxicityVpin => write!(f, "toxicity_vpin"),
            Self::ToxicityBurst => write!(f, "toxicity_burst"),
            Self::OiDivergence => write!(f, "oi_divergence"),
            Self::Regime => write!(f, "regime"),
            Self::CrossMarket => write!(f, "cross_market"),
            Self::LifecycleCascade => write!(f, "lifecycle_cascade"),
            Self::LifecycleNewMarket => write!(f, "lifecycle_new_market"),
        }
    }
}

/// Coarse per-market activity class. Drives how much the aggregator trusts
/// the other signals on that market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Regime {
    Dead,
    Quiet,
    Active,
    Informed,
    PreSettle,
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dead => write!(f, "DEAD"),
            Self::Quiet => write!(f, "QUIET"),
            Self::Active => write!(f, "ACTIVE"),
            Self::Informed => write!(f, "INFORMED"),
            Self::PreSettle => write!(f, "PRE_SETTLE"),
        }
    }
}

impl Regime {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DEAD" => Some(Self::Dead),
            "QUIET" => Some(Self::Quiet),
            "ACTIVE" => Some(Self::Active),
            "INFORMED" => Some(Self::Informed),
            "PRE_SETTLE" => Some(Self::PreSettle),
            _ => None,
        }
    }
}

// =============================================================================
// Signal
// =============================================================================

/// One processor observation. Active at time t iff `ts <= t < ts + ttl` and
/// the market has not gone terminal since `ts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub signal_id: String,
    pub ts: DateTime<Utc>,
    pub signal_type: SignalType,
    pub market_ticker: String,
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub series_id: Option<String>,
    pub direction: Direction,
    pub strength: f64,
    pub confidence: f64,
    pub urgency: Urgency,
    pub ttl_seconds: i64,
    /// Free-form typed payload for audit and downstream diagnostics.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Signal {
    /// Expiry instant derived from ts + ttl.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.ts + chrono::Duration::seconds(self.ttl_seconds)
    }

    /// Structural invariants every emitted signal must satisfy. A violation
    /// is fatal for the emitting worker; the bad signal is never published.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.signal_id.is_empty() {
            anyhow::bail!("empty signal_id");
        }
        if self.market_ticker.is_empty() {
            anyhow::bail!("empty market_ticker");
        }
        if !(0.0..=1.0).contains(&self.strength) || !self.strength.is_finite() {
            anyhow::bail!("strength out of [0,1]: {}", self.strength);
        }
        if !(0.0..=1.0).contains(&self.confidence) || !self.confidence.is_finite() {
            anyhow::bail!("confidence out of [0,1]: {}", self.confidence);
        }
        if self.ttl_seconds <= 0 {
            anyhow::bail!("non-positive ttl_seconds: {}", self.ttl_seconds);
        }
        Ok(())
    }
}

// =============================================================================
// Signal id generation
// =============================================================================

/// Generates globally unique signal ids: `{source}-{counter}-{uuid8}`.
/// The monotonic counter keeps ids sortable per source; the uuid fragment
/// keeps them unique across restarts.
pub struct SignalIdGen {
    source: String,
    counter: AtomicU64,
}

impl SignalIdGen {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn next(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}-{}", self.source, n, &suffix[..8])
    }
}

// =============================================================================
// CompositeSignal
// =============================================================================

/// The aggregator's fused output for one market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeSignal {
    pub ts: DateTime<Utc>,
    pub market_ticker: String,
    pub direction: Direction,
    /// Regime-modulated score clamped to [-1, +1].
    pub composite_score: f64,
    pub regime: Regime,
    pub active_signal_ids: Vec<String>,
    pub active_signal_count: usize,
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn base_signal() -> Signal {
        Signal {
            signal_id: "tox-0-deadbeef".into(),
            ts: Utc::now(),
            signal_type: SignalType::ToxicityVpin,
            market_ticker: "KXBTC-24DEC31".into(),
            event_id: None,
            series_id: None,
            direction: Direction::BuyYes,
            strength: 0.5,
            confidence: 0.9,
            urgency: Urgency::Normal,
            ttl_seconds: 300,
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn validate_accepts_well_formed() {
        assert!(base_signal().validate().is_ok());
    }

    #[test]
    fn validate_rejects_out_of_range_strength() {
        let mut s = base_signal();
        s.strength = 1.2;
        assert!(s.validate().is_err());
        s.strength = f64::NAN;
        assert!(s.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_ttl() {
        let mut s = base_signal();
        s.ttl_seconds = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn id_gen_is_unique_and_prefixed() {
        let gen = SignalIdGen::new("toxicity-1");
        let ids: HashSet<String> = (0..1000).map(|_| gen.next()).collect();
        assert_eq!(ids.len(), 1000);
        assert!(ids.iter().all(|id| id.starts_with("toxicity-1-")));
    }

    #[test]
    fn direction_sign_matches_fusion_convention() {
        assert_eq!(Direction::BuyYes.sign(), 1.0);
        assert_eq!(Direction::BuyNo.sign(), -1.0);
        assert_eq!(Direction::Neutral.sign(), 0.0);
    }

    #[test]
    fn signal_type_streams_cover_all_variants() {
        use crate::bus::streams;
        assert_eq!(SignalType::ToxicityBurst.stream(), streams::SIGNALS_FLOW_TOXICITY);
        assert_eq!(SignalType::LifecycleNewMarket.stream(), streams::SIGNALS_LIFECYCLE);
        assert_eq!(SignalType::Regime.stream(), streams::SIGNALS_REGIME);
    }

    #[test]
    fn regime_round_trips_display_parse() {
        for r in [
            Regime::Dead,
            Regime::Quiet,
            Regime::Active,
            Regime::Informed,
            Regime::PreSettle,
        ] {
            assert_eq!(Regime::parse(&r.to_string()), Some(r));
        }
    }
}
