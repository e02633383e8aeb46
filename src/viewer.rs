// ===============================
// src/viewer.rs (viewer-side state)
// ===============================
//
// Reconciles pushed trade events into one collection keyed by trade id and
// derives the dashboard aggregates from it. Nothing here does I/O; the
// websocket loop lives in viewer_client.rs.
//
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt;

use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::domain::{Notice, NoticeKind, PushEvent, Trade, TradeStatus, TradeUpdate};

pub const NOTIFICATION_CAPACITY: usize = 20;
/// Notional per standard lot, used for exposure.
pub const LOT_SIZE: f64 = 100_000.0;
const EXPOSURE_FOR_FULL_RISK: f64 = 50_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertKind {
    Inserted,
    Merged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    #[default]
    OpenedAt,
    Symbol,
    Side,
    Volume,
    Profit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDir {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusFilter {
    #[default]
    All,
    Only(TradeStatus),
}

/// Aggregates over the whole collection. Pure function of the trades.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TradeStats {
    pub total_trades: usize,
    pub active_trades: usize,
    pub total_profit: f64,
    /// percent, 0 when there are no trades
    pub win_rate: f64,
    pub avg_profit: f64,
    pub best_trade: f64,
    pub worst_trade: f64,
    pub total_exposure: f64,
    /// 0..=100
    pub risk_score: f64,
}

pub fn compute_stats(trades: &[Trade]) -> TradeStats {
    if trades.is_empty() {
        return TradeStats::default();
    }
    let n = trades.len();
    let total_profit: f64 = trades.iter().map(|t| t.profit).sum();
    let wins = trades.iter().filter(|t| t.profit > 0.0).count();
    let open: Vec<&Trade> = trades.iter().filter(|t| t.status == TradeStatus::Open).collect();
    let total_exposure: f64 = open.iter().map(|t| t.volume * LOT_SIZE).sum();
    TradeStats {
        total_trades: n,
        active_trades: open.len(),
        total_profit,
        win_rate: wins as f64 / n as f64 * 100.0,
        avg_profit: total_profit / n as f64,
        best_trade: trades.iter().map(|t| t.profit).fold(f64::NEG_INFINITY, f64::max),
        worst_trade: trades.iter().map(|t| t.profit).fold(f64::INFINITY, f64::min),
        total_exposure,
        risk_score: (total_exposure / EXPOSURE_FOR_FULL_RISK * 100.0).min(100.0),
    }
}

#[derive(Debug, Default)]
pub struct ClientStateStore {
    trades: Vec<Trade>,
    index: HashMap<String, usize>,
    stats: TradeStats,
}

impl ClientStateStore {
    pub fn new() -> Self { Self::default() }

    pub fn upsert(&mut self, update: TradeUpdate) -> UpsertKind {
        self.upsert_at(update, Utc::now())
    }

    /// `now` stamps `closed_at` when a close arrives without one, and
    /// `opened_at` for a first event that lacks it.
    pub fn upsert_at(&mut self, update: TradeUpdate, now: DateTime<Utc>) -> UpsertKind {
        let kind = match self.index.get(&update.id) {
            Some(&i) => {
                merge(&mut self.trades[i], update, now);
                UpsertKind::Merged
            }
            None => {
                let mut t = Trade {
                    id: update.id.clone(),
                    symbol: String::new(),
                    side: Default::default(),
                    volume: 0.0,
                    status: TradeStatus::Pending,
                    profit: 0.0,
                    opened_at: now,
                    closed_at: None,
                    stop_loss_pips: None,
                    take_profit_pips: None,
                };
                merge(&mut t, update, now);
                self.index.insert(t.id.clone(), self.trades.len());
                self.trades.push(t);
                UpsertKind::Inserted
            }
        };
        self.stats = compute_stats(&self.trades);
        kind
    }

    pub fn get(&self, id: &str) -> Option<&Trade> { self.index.get(id).map(|&i| &self.trades[i]) }
    pub fn len(&self) -> usize { self.trades.len() }
    pub fn is_empty(&self) -> bool { self.trades.is_empty() }
    /// Arrival order.
    pub fn trades(&self) -> &[Trade] { &self.trades }
    pub fn stats(&self) -> &TradeStats { &self.stats }

    pub fn view(&self, filter: StatusFilter, key: SortKey, dir: SortDir) -> Vec<&Trade> {
        let mut out: Vec<&Trade> = self
            .trades
            .iter()
            .filter(|t| match filter {
                StatusFilter::All => true,
                StatusFilter::Only(s) => t.status == s,
            })
            .collect();
        out.sort_by(|a, b| {
            let ord = compare(a, b, key);
            match dir {
                SortDir::Asc => ord,
                SortDir::Desc => ord.reverse(),
            }
        });
        out
    }
}

fn compare(a: &Trade, b: &Trade, key: SortKey) -> Ordering {
    match key {
        SortKey::OpenedAt => a.opened_at.cmp(&b.opened_at),
        SortKey::Symbol => a.symbol.cmp(&b.symbol),
        SortKey::Side => a.side.as_str().cmp(b.side.as_str()),
        SortKey::Volume => a.volume.total_cmp(&b.volume),
        SortKey::Profit => a.profit.total_cmp(&b.profit),
    }
}

/// Field-wise override; absent fields keep their value. Closed is terminal.
fn merge(t: &mut Trade, u: TradeUpdate, now: DateTime<Utc>) {
    if let Some(v) = u.symbol { t.symbol = v; }
    if let Some(v) = u.side { t.side = v; }
    if let Some(v) = u.volume { t.volume = v; }
    if let Some(v) = u.profit { t.profit = v; }
    if let Some(v) = u.opened_at { t.opened_at = v; }
    if let Some(v) = u.stop_loss_pips { t.stop_loss_pips = Some(v); }
    if let Some(v) = u.take_profit_pips { t.take_profit_pips = Some(v); }
    if let Some(v) = u.closed_at { t.closed_at = Some(v); }
    if let Some(status) = u.status {
        if t.status == TradeStatus::Closed && status != TradeStatus::Closed {
            debug!(id = %t.id, to = status.as_str(), "ignoring status change on closed trade");
        } else {
            t.status = status;
        }
    }
    if t.status == TradeStatus::Closed && t.closed_at.is_none() {
        t.closed_at = Some(now);
    }
}

// ---------------------------------------------------------------------------
// Notifications + connection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct NotificationRecord {
    pub id: u64,
    pub message: String,
    pub kind: NoticeKind,
    pub timestamp: DateTime<Utc>,
}

/// Newest first; the oldest is evicted past capacity.
#[derive(Debug)]
pub struct NotificationBuffer {
    items: VecDeque<NotificationRecord>,
    capacity: usize,
    next_id: u64,
}

impl Default for NotificationBuffer {
    fn default() -> Self { Self::with_capacity(NOTIFICATION_CAPACITY) }
}

impl NotificationBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self { items: VecDeque::with_capacity(capacity), capacity: capacity.max(1), next_id: 1 }
    }

    pub fn push(&mut self, kind: NoticeKind, message: impl Into<String>, timestamp: DateTime<Utc>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.items.push_front(NotificationRecord { id, message: message.into(), kind, timestamp });
        self.items.truncate(self.capacity);
        id
    }

    pub fn remove(&mut self, id: u64) -> bool {
        let before = self.items.len();
        self.items.retain(|n| n.id != id);
        self.items.len() != before
    }

    pub fn clear(&mut self) { self.items.clear(); }
    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }
    pub fn iter(&self) -> impl Iterator<Item = &NotificationRecord> { self.items.iter() }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Everything one viewer holds.
#[derive(Debug, Default)]
pub struct ViewerState {
    pub store: ClientStateStore,
    pub notifications: NotificationBuffer,
    connection: ConnectionState,
}

impl ViewerState {
    pub fn new() -> Self { Self::default() }

    pub fn connection(&self) -> ConnectionState { self.connection }

    pub fn set_connection(&mut self, state: ConnectionState, detail: Option<&str>) {
        if self.connection == state {
            return;
        }
        self.connection = state;
        let now = Utc::now();
        match state {
            ConnectionState::Connected => {
                self.notifications.push(NoticeKind::Success, "Connected to trading bot", now);
            }
            ConnectionState::Error => {
                let msg = format!("Connection error: {}", detail.unwrap_or("unknown"));
                self.notifications.push(NoticeKind::Error, msg, now);
            }
            ConnectionState::Disconnected => {
                self.notifications.push(NoticeKind::Info, "Disconnected from trading bot", now);
            }
            ConnectionState::Connecting => {}
        }
    }

    pub fn apply(&mut self, ev: PushEvent) {
        match ev {
            PushEvent::TradeUpdate(u) => {
                let id = u.id.clone();
                self.store.upsert(u);
                if let Some(t) = self.store.get(&id) {
                    let action = if t.status == TradeStatus::Closed { "closed" } else { "updated" };
                    let msg = format!("Trade {action}: {} {}", t.side.upper(), t.symbol);
                    self.notifications.push(NoticeKind::Info, msg, Utc::now());
                }
            }
            PushEvent::Notification(Notice { kind, message, timestamp }) => {
                self.notifications.push(kind, message, timestamp);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Side;
    use chrono::Duration;

    fn full(id: &str, symbol: &str, profit: f64, opened_at: DateTime<Utc>) -> TradeUpdate {
        TradeUpdate {
            id: id.into(),
            symbol: Some(symbol.into()),
            side: Some(Side::Buy),
            volume: Some(0.01),
            status: Some(TradeStatus::Open),
            profit: Some(profit),
            opened_at: Some(opened_at),
            ..Default::default()
        }
    }

    fn profit_only(id: &str, profit: f64) -> TradeUpdate {
        TradeUpdate { id: id.into(), profit: Some(profit), ..Default::default() }
    }

    #[test]
    fn applying_same_event_twice_is_idempotent() {
        let now = Utc::now();
        let ev = full("t1", "EURUSD", 3.5, now);

        let mut once = ClientStateStore::new();
        once.upsert_at(ev.clone(), now);
        let mut twice = ClientStateStore::new();
        twice.upsert_at(ev.clone(), now);
        assert_eq!(twice.upsert_at(ev, now), UpsertKind::Merged);

        assert_eq!(once.trades(), twice.trades());
        assert_eq!(once.stats(), twice.stats());
        assert_eq!(twice.len(), 1);
    }

    #[test]
    fn partial_update_merges_without_erasing() {
        let mut s = ClientStateStore::new();
        s.upsert(TradeUpdate {
            id: "t1".into(),
            symbol: Some("EURUSD".into()),
            side: Some(Side::Buy),
            status: Some(TradeStatus::Open),
            ..Default::default()
        });
        s.upsert(profit_only("t1", 5.0));

        let t = s.get("t1").unwrap();
        assert_eq!(t.symbol, "EURUSD");
        assert_eq!(t.side, Side::Buy);
        assert_eq!(t.status, TradeStatus::Open);
        assert_eq!(t.profit, 5.0);
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn win_rate_boundaries() {
        assert_eq!(compute_stats(&[]).win_rate, 0.0);
        assert_eq!(ClientStateStore::new().stats().win_rate, 0.0);

        let mut s = ClientStateStore::new();
        let now = Utc::now();
        s.upsert_at(full("a", "EURUSD", 10.0, now), now);
        s.upsert_at(full("b", "GBPUSD", -5.0, now), now);
        s.upsert_at(full("c", "USDJPY", 0.0, now), now);
        let st = s.stats();
        assert!((st.win_rate - 33.33).abs() < 0.01, "win rate {}", st.win_rate);
        assert_eq!(st.total_profit, 5.0);
        assert!((st.avg_profit - 5.0 / 3.0).abs() < 1e-9);
        assert_eq!(st.best_trade, 10.0);
        assert_eq!(st.worst_trade, -5.0);
        assert_eq!(st.active_trades, 3);
    }

    #[test]
    fn close_is_terminal_and_stamps_closed_at() {
        let mut s = ClientStateStore::new();
        let now = Utc::now();
        s.upsert_at(full("t1", "EURUSD", 1.0, now), now);
        s.upsert_at(TradeUpdate { id: "t1".into(), status: Some(TradeStatus::Closed), ..Default::default() }, now);
        assert_eq!(s.get("t1").unwrap().closed_at, Some(now));
        assert_eq!(s.stats().active_trades, 0);

        s.upsert_at(TradeUpdate { id: "t1".into(), status: Some(TradeStatus::Open), ..Default::default() }, now);
        assert_eq!(s.get("t1").unwrap().status, TradeStatus::Closed);
    }

    #[test]
    fn unknown_partial_event_is_appended_as_pending() {
        let mut s = ClientStateStore::new();
        let now = Utc::now();
        assert_eq!(s.upsert_at(profit_only("x", 2.0), now), UpsertKind::Inserted);
        let t = s.get("x").unwrap();
        assert_eq!(t.status, TradeStatus::Pending);
        assert_eq!(t.opened_at, now);
        assert_eq!(t.profit, 2.0);
    }

    #[test]
    fn default_view_is_newest_first_and_sort_keys_toggle() {
        let mut s = ClientStateStore::new();
        let t0 = Utc::now();
        s.upsert(full("old", "USDJPY", 4.0, t0 - Duration::hours(2)));
        s.upsert(full("mid", "EURUSD", -1.0, t0 - Duration::hours(1)));
        s.upsert(full("new", "GBPUSD", 9.0, t0));

        let ids = |v: Vec<&Trade>| v.into_iter().map(|t| t.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(s.view(StatusFilter::All, SortKey::default(), SortDir::default())), ["new", "mid", "old"]);
        assert_eq!(ids(s.view(StatusFilter::All, SortKey::Symbol, SortDir::Asc)), ["mid", "new", "old"]);
        assert_eq!(ids(s.view(StatusFilter::All, SortKey::Profit, SortDir::Desc)), ["new", "old", "mid"]);
        assert_eq!(ids(s.view(StatusFilter::All, SortKey::Profit, SortDir::Asc)), ["mid", "old", "new"]);

        s.upsert(TradeUpdate { id: "mid".into(), status: Some(TradeStatus::Closed), ..Default::default() });
        assert_eq!(ids(s.view(StatusFilter::Only(TradeStatus::Closed), SortKey::OpenedAt, SortDir::Desc)), ["mid"]);
    }

    #[test]
    fn exposure_and_risk_score_follow_open_volume() {
        let now = Utc::now();
        let mut u = full("a", "EURUSD", 0.0, now);
        u.volume = Some(0.2);
        let mut s = ClientStateStore::new();
        s.upsert_at(u, now);
        assert_eq!(s.stats().total_exposure, 20_000.0);
        assert_eq!(s.stats().risk_score, 40.0);

        let mut big = full("b", "EURUSD", 0.0, now);
        big.volume = Some(1.0);
        s.upsert_at(big, now);
        assert_eq!(s.stats().risk_score, 100.0);
    }

    #[test]
    fn notification_buffer_is_bounded_newest_first() {
        let mut b = NotificationBuffer::with_capacity(3);
        let now = Utc::now();
        for i in 0..5 {
            b.push(NoticeKind::Info, format!("n{i}"), now);
        }
        let msgs: Vec<&str> = b.iter().map(|n| n.message.as_str()).collect();
        assert_eq!(msgs, ["n4", "n3", "n2"]);
        let newest = b.iter().next().unwrap().id;
        assert!(b.remove(newest));
        assert_eq!(b.len(), 2);
        b.clear();
        assert!(b.is_empty());
    }

    #[test]
    fn viewer_state_tracks_pushes_and_connection() {
        let mut v = ViewerState::new();
        assert_eq!(v.connection(), ConnectionState::Connecting);
        v.set_connection(ConnectionState::Connected, None);
        v.apply(PushEvent::TradeUpdate(full("t1", "EURUSD", 0.0, Utc::now())));
        v.apply(PushEvent::Notification(Notice {
            kind: NoticeKind::Error,
            message: "Trade execution failed: broker unavailable".into(),
            timestamp: Utc::now(),
        }));
        assert_eq!(v.store.stats().active_trades, 1);
        let kinds: Vec<NoticeKind> = v.notifications.iter().map(|n| n.kind).collect();
        assert_eq!(kinds, [NoticeKind::Error, NoticeKind::Info, NoticeKind::Success]);

        v.set_connection(ConnectionState::Error, Some("refused"));
        assert_eq!(v.connection(), ConnectionState::Error);
        assert_eq!(v.notifications.iter().next().unwrap().message, "Connection error: refused");
    }
}
