// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Fixed-point scale for prices: 1_000_000 = 1 unit of quote currency.
pub const PRICE_SCALE: i64 = 1_000_000;

// Pub/sub channels
pub const CH_PRICE_UPDATES: &str = "price_updates";
pub const CH_TRADES: &str = "trades";
pub const CH_MARKET_STATUS: &str = "market_status";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side { Buy, Sell }
impl Side {
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "buy", Side::Sell => "sell" } }
    pub fn parse(s: &str) -> Option<Self> {
        match s { "buy" => Some(Side::Buy), "sell" => Some(Side::Sell), _ => None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus { Pending, Confirmed, Failed }
impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Pending => "pending",
            TradeStatus::Confirmed => "confirmed",
            TradeStatus::Failed => "failed",
        }
    }
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TradeStatus::Pending),
            "confirmed" => Some(TradeStatus::Confirmed),
            "failed" => Some(TradeStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType { Trade, PriceUpdate, MarketInit, MarketPause, VaultWithdraw }
impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Trade => "trade",
            EventType::PriceUpdate => "price_update",
            EventType::MarketInit => "market_init",
            EventType::MarketPause => "market_pause",
            EventType::VaultWithdraw => "vault_withdraw",
        }
    }
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "trade" => Some(EventType::Trade),
            "price_update" => Some(EventType::PriceUpdate),
            "market_init" => Some(EventType::MarketInit),
            "market_pause" => Some(EventType::MarketPause),
            "vault_withdraw" => Some(EventType::VaultWithdraw),
            _ => None,
        }
    }
}

/// Provenance of a price. `Fallback` marks canned feed data and must stay
/// distinguishable from live quotes everywhere it is stored or exported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceSource { Oracle, Trade, Manual, Fallback, Feed(String) }
impl PriceSource {
    pub fn tag(&self) -> &str {
        match self {
            PriceSource::Oracle => "oracle",
            PriceSource::Trade => "trade",
            PriceSource::Manual => "manual",
            PriceSource::Fallback => "fallback",
            PriceSource::Feed(name) => name.as_str(),
        }
    }
    pub fn is_fallback(&self) -> bool { matches!(self, PriceSource::Fallback) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Market {
    pub id: String,
    pub bond_id: String,
    pub name: String,
    pub current_price: i64,
    pub paused: bool,
    pub active: bool,
    pub program_market: Option<String>,
    pub vault_bond: Option<String>,
    pub vault_usdc: Option<String>,
    pub admin: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Market {
    /// Account the settlement program knows this market by.
    pub fn ledger_address(&self) -> &str {
        self.program_market.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub signature: String,
    pub market_id: String,
    pub trader: String,
    pub side: Side,
    pub amount: i64,
    pub price: i64,
    pub total_value: i64,
    pub status: TradeStatus,
    pub slot: Option<u64>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEvent {
    pub id: i64,
    pub event_type: EventType,
    pub market_id: Option<String>,
    pub signature: Option<String>,
    pub payload: serde_json::Value,
    pub processed: bool,
    pub outcome: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_type: EventType,
    pub market_id: Option<String>,
    pub signature: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl NewEvent {
    pub fn now(event_type: EventType, market_id: Option<String>, signature: Option<String>, payload: serde_json::Value) -> Self {
        Self { event_type, market_id, signature, payload, created_at: Utc::now() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint { pub market_id: String, pub price: i64, pub source: String, pub recorded_at: DateTime<Utc> }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleUpdate { pub market_id: String, pub old_price: i64, pub new_price: i64, pub source: String, pub created_at: DateTime<Utc> }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub trader: String,
    pub market_id: String,
    pub quantity: i64,
    pub avg_cost: i64,
    pub cost_basis: i64,
    pub updated_at: DateTime<Utc>,
}

/// One transaction touching the settlement program, as seen by the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerTx {
    pub signature: String,
    pub slot: u64,
    pub block_time: Option<DateTime<Utc>>,
    pub success: bool,
    pub err: Option<String>,
    pub logs: Vec<String>,
}

/// External bond reference data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BondRecord {
    pub bond_id: String,
    pub name: String,
    pub yield_pct: f64,
    pub coupon_pct: f64,
    pub maturity: DateTime<Utc>,
    pub face_value: f64,
    pub source: PriceSource,
}

/// Pub/sub envelope `{type, data, timestamp}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}
impl Envelope {
    pub fn new(kind: &str, data: serde_json::Value) -> Self {
        Self { kind: kind.to_string(), data, timestamp: Utc::now() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopState { Ok, Error }

/// Health record written to the status store after every loop cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleStatus {
    pub status: LoopState,
    pub last_run: DateTime<Utc>,
    pub counts: BTreeMap<String, u64>,
    pub error: Option<String>,
}
