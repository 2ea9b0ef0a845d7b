// =============================================================================
// Raw market-data event model
// =============================================================================
//
// Every record on the raw input streams is a self-describing JSON object with
// at minimum `ts` (RFC-3339, millisecond precision) and `market_ticker`.
// Event time from the payload is the authoritative clock everywhere in the
// pipeline; wall-clock never enters processor state.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Enums
// =============================================================================

/// The two sides of a binary contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Yes,
    No,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Yes => write!(f, "yes"),
            Self::No => write!(f, "no"),
        }
    }
}

/// Market lifecycle status as reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketStatus {
    Unopened,
    Open,
    Paused,
    Closed,
    Determined,
    Settled,
}

impl MarketStatus {
    /// A terminal market can never trade again; signals on it are void.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Determined | Self::Settled)
    }
}

impl std::fmt::Display for MarketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unopened => write!(f, "unopened"),
            Self::Open => write!(f, "open"),
            Self::Paused => write!(f, "paused"),
            Self::Closed => write!(f, "closed"),
            Self::Determined => write!(f, "determined"),
            Self::Settled => write!(f, "settled"),
        }
    }
}

// =============================================================================
// Event payloads
// =============================================================================

/// One executed trade on one market. Prices are integer cents in [1, 99];
/// `yes_price + no_price == 100` always holds on a well-formed trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub ts: DateTime<Utc>,
    pub market_ticker: String,
    pub yes_price: i64,
    pub no_price: i64,
    /// Contracts exchanged.
    pub count: u64,
    pub taker_side: Side,
    pub trade_id: String,
}

impl Trade {
    /// Well-formedness check used by every consumer before touching state.
    pub fn sanity_check(&self) -> Result<()> {
        if self.yes_price + self.no_price != 100 {
            anyhow::bail!(
                "price pair does not sum to 100: yes={} no={}",
                self.yes_price,
                self.no_price
            );
        }
        if !(1..=99).contains(&self.yes_price) {
            anyhow::bail!("yes_price out of range: {}", self.yes_price);
        }
        if self.count == 0 {
            anyhow::bail!("zero-count trade");
        }
        Ok(())
    }
}

/// Incremental delta of price / volume / open interest for one market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerUpdate {
    pub ts: DateTime<Utc>,
    pub market_ticker: String,
    /// Last traded yes price in cents, when the update carries one.
    #[serde(default)]
    pub price: Option<i64>,
    #[serde(default)]
    pub volume_delta: i64,
    #[serde(default)]
    pub open_interest_delta: i64,
    #[serde(default)]
    pub dollar_volume_delta: Option<i64>,
    #[serde(default)]
    pub dollar_open_interest_delta: Option<i64>,
}

/// One level-change on one side of a market's book. `delta` is signed
/// contracts added to (positive) or removed from (negative) the level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderbookDelta {
    pub ts: DateTime<Utc>,
    pub market_ticker: String,
    pub side: Side,
    pub price: i64,
    pub delta: i64,
    /// Advisory flag from the ingest layer; never used to skip events.
    #[serde(default)]
    pub is_own_order: Option<bool>,
}

/// Market state transition. Discovery-grade metadata rides along when the
/// upstream poller knows it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub ts: DateTime<Utc>,
    pub market_ticker: String,
    pub status: MarketStatus,
    /// Winning side, present once a market is determined or settled.
    #[serde(default)]
    pub result: Option<Side>,
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub series_id: Option<String>,
    #[serde(default)]
    pub close_time: Option<DateTime<Utc>>,
}

// =============================================================================
// Stream → payload dispatch
// =============================================================================

/// A parsed record from one of the raw input streams.
#[derive(Debug, Clone)]
pub enum RawEvent {
    Trade(Trade),
    Ticker(TickerUpdate),
    Orderbook(OrderbookDelta),
    Lifecycle(LifecycleEvent),
}

impl RawEvent {
    /// Decode a bus payload according to the stream it arrived on.
    ///
    /// Any failure here is a poison message: the caller acks it, counts it
    /// and moves on.
    pub fn parse(stream: &str, payload: &serde_json::Value) -> Result<Self> {
        use crate::bus::streams;
        match stream {
            streams::TRADES => {
                let trade: Trade = serde_json::from_value(payload.clone())
                    .context("malformed trade record")?;
                trade.sanity_check()?;
                Ok(Self::Trade(trade))
            }
            streams::TICKER_UPDATES => Ok(Self::Ticker(
                serde_json::from_value(payload.clone()).context("malformed ticker record")?,
            )),
            streams::ORDERBOOK_DELTAS => Ok(Self::Orderbook(
                serde_json::from_value(payload.clone()).context("malformed orderbook record")?,
            )),
            streams::LIFECYCLE => Ok(Self::Lifecycle(
                serde_json::from_value(payload.clone()).context("malformed lifecycle record")?,
            )),
            other => anyhow::bail!("no decoder for stream {other}"),
        }
    }

    /// The event-time timestamp of the payload.
    pub fn ts(&self) -> DateTime<Utc> {
        match self {
            Self::Trade(t) => t.ts,
            Self::Ticker(t) => t.ts,
            Self::Orderbook(o) => o.ts,
            Self::Lifecycle(l) => l.ts,
        }
    }

    /// The market the payload pertains to.
    pub fn market_ticker(&self) -> &str {
        match self {
            Self::Trade(t) => &t.market_ticker,
            Self::Ticker(t) => &t.market_ticker,
            Self::Orderbook(o) => &o.market_ticker,
            Self::Lifecycle(l) => &l.market_ticker,
        }
    }
}
