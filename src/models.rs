//! Shared domain types for positions, trades, and bus events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::str::FromStr for Side {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            other => Err(anyhow::anyhow!("invalid side: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

/// A single logical position, keyed by caller-supplied `pos_id`.
///
/// A CLOSED position is removed from the registry rather than retained with
/// this status; the variant exists for transient in-flight values (e.g. the
/// record returned by `close`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub pos_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: i64,
    pub entry_price: f64,
    pub security_id: Option<String>,
    pub open_ts: DateTime<Utc>,
    pub closed_ts: Option<DateTime<Utc>>,
    pub exit_price: Option<f64>,
    pub pnl: f64,
    pub trailing_sl: Option<f64>,
    pub status: PositionStatus,
    pub tags: HashMap<String, String>,
}

impl Position {
    pub fn unrealized_pnl(&self, market_price: f64) -> f64 {
        match self.side {
            Side::Buy => (market_price - self.entry_price) * self.quantity as f64,
            Side::Sell => (self.entry_price - market_price) * self.quantity as f64,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Created,
    Simulated,
    Sent,
    Filled,
    Rejected,
    Failed,
    Closed,
    TimedOut,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Created => "created",
            TradeStatus::Simulated => "simulated",
            TradeStatus::Sent => "sent",
            TradeStatus::Filled => "filled",
            TradeStatus::Rejected => "rejected",
            TradeStatus::Failed => "failed",
            TradeStatus::Closed => "closed",
            TradeStatus::TimedOut => "timed_out",
        }
    }
}

/// Append-only record of an order state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: i64,
    pub ts: DateTime<Utc>,
    pub side: Side,
    pub quantity: i64,
    pub price: f64,
    pub status: TradeStatus,
    /// Opaque JSON payload (broker response, pos_id, etc.)
    pub info: serde_json::Value,
}

/// A placed-but-unfilled order, keyed by `pos_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOrder {
    pub pos_id: String,
    pub db_id: i64,
    pub placed_ts: DateTime<Utc>,
    pub qty: i64,
    pub side: Side,
    pub price: f64,
    pub broker_info: Option<serde_json::Value>,
    pub simulated: bool,
}

/// ENTRY_SIGNAL payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntrySignal {
    pub pos_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub quantity: i64,
    pub price: Option<f64>,
    pub security_id: Option<String>,
    pub confidence_score: Option<f64>,
    pub stop_loss: Option<f64>,
}

/// EXIT_SIGNAL payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitSignal {
    pub pos_id: Option<String>,
    pub security_id: Option<String>,
    pub price: f64,
}

/// ORDER_PLACED / ORDER_FILLED status payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStatusEvent {
    pub pos_id: String,
    pub db_id: i64,
    pub ts: DateTime<Utc>,
    pub broker_info: Option<serde_json::Value>,
}

/// ORDER_TIMEOUT payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderTimeoutEvent {
    pub pos_id: String,
    pub db_id: i64,
    pub age_seconds: u64,
    pub info: Option<serde_json::Value>,
}
