// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    #[default]
    Buy,
    Sell,
}
impl Side {
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "buy", Side::Sell => "sell" } }
    pub fn upper(&self) -> &'static str { match self { Side::Buy => "BUY", Side::Sell => "SELL" } }
}

/// Latest quote seen by the feed for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot { pub symbol: String, pub bid: f64, pub ask: f64, pub ts: DateTime<Utc> }

impl MarketSnapshot {
    pub fn empty(symbol: &str) -> Self {
        Self { symbol: symbol.to_string(), bid: 0.0, ask: 0.0, ts: Utc::now() }
    }
    pub fn mid(&self) -> f64 { (self.bid + self.ask) / 2.0 }
}

/// Proposed trade instruction. Produced and consumed within one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss_pips: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit_pips: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    #[serde(rename = "TRADE_RETCODE_DONE")]
    Done,
    #[serde(rename = "TRADE_RETCODE_PLACED")]
    Placed,
}

/// Broker confirmation of a placed market order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    pub status: OrderStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Open,
    Closed,
    #[default]
    Pending,
}
impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self { TradeStatus::Open => "open", TradeStatus::Closed => "closed", TradeStatus::Pending => "pending" }
    }
}

/// Viewer-facing record of one position. `id` is the only identity key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    pub status: TradeStatus,
    #[serde(default)]
    pub profit: f64,
    pub opened_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss_pips: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit_pips: Option<u32>,
}

impl Trade {
    /// Project a confirmed order into an open trade.
    pub fn from_order(order: &Order, sl_pips: Option<u32>, tp_pips: Option<u32>, profit: f64) -> Self {
        Self {
            id: order.id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            volume: order.volume,
            status: TradeStatus::Open,
            profit,
            opened_at: Utc::now(),
            closed_at: None,
            stop_loss_pips: sl_pips,
            take_profit_pips: tp_pips,
        }
    }
}

/// Wire form of a trade event. Absent fields mean "unchanged".
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeUpdate {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side: Option<Side>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TradeStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss_pips: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit_pips: Option<u32>,
}

impl From<&Trade> for TradeUpdate {
    fn from(t: &Trade) -> Self {
        Self {
            id: t.id.clone(),
            symbol: Some(t.symbol.clone()),
            side: Some(t.side),
            volume: Some(t.volume),
            status: Some(t.status),
            profit: Some(t.profit),
            opened_at: Some(t.opened_at),
            closed_at: t.closed_at,
            stop_loss_pips: t.stop_loss_pips,
            take_profit_pips: t.take_profit_pips,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeKind {
    #[default]
    Info,
    Success,
    Error,
}
impl NoticeKind {
    pub fn as_str(&self) -> &'static str {
        match self { NoticeKind::Info => "info", NoticeKind::Success => "success", NoticeKind::Error => "error" }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice { pub kind: NoticeKind, pub message: String, pub timestamp: DateTime<Utc> }

/// Server -> viewer push frame: `{"event": "...", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum PushEvent {
    #[serde(rename = "tradeUpdate")]
    TradeUpdate(TradeUpdate),
    #[serde(rename = "notification")]
    Notification(Notice),
}

/// Result of one pipeline tick.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Skipped,
    Rejected(String),
    ExecutionFailed(String),
    Executed(Trade),
}
impl TickOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            TickOutcome::Skipped => "skipped",
            TickOutcome::Rejected(_) => "rejected",
            TickOutcome::ExecutionFailed(_) => "execution_failed",
            TickOutcome::Executed(_) => "executed",
        }
    }
}

/// Lines written by the JSONL recorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Tick { ts: DateTime<Utc>, outcome: String, detail: Option<String> },
    Trade(Trade),
    Update(TradeUpdate),
}
