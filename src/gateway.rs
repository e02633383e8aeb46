// ===============================
// src/gateway.rs
// ===============================
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::info;

use crate::domain::{Order, OrderStatus, Side};

pub const DEFAULT_SL_PIPS: u32 = 50;
pub const DEFAULT_TP_PIPS: u32 = 100;

type Cause = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// Any step of the remote placement failed; the cause is kept.
    #[error("broker unavailable ({stage}): {source}")]
    Unavailable {
        stage: &'static str,
        #[source]
        source: Cause,
    },
}

impl BrokerError {
    pub fn unavailable(stage: &'static str, cause: impl Into<Cause>) -> Self {
        BrokerError::Unavailable { stage, source: cause.into() }
    }
}

/// Effective stop-loss / take-profit once defaults are applied.
pub fn effective_pips(sl_pips: Option<u32>, tp_pips: Option<u32>) -> (u32, u32) {
    (sl_pips.unwrap_or(DEFAULT_SL_PIPS), tp_pips.unwrap_or(DEFAULT_TP_PIPS))
}

/// Order placement against one trading account.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    fn mode(&self) -> &'static str;

    async fn place_market_order(
        &self,
        symbol: &str,
        volume: f64,
        side: Side,
        sl_pips: Option<u32>,
        tp_pips: Option<u32>,
    ) -> Result<Order, BrokerError>;
}

/// Used when no broker credential is configured: every order is
/// synthesized locally and reported as done.
#[derive(Debug, Default)]
pub struct DemoGateway {
    last_ms: AtomicI64,
}

impl DemoGateway {
    pub fn new() -> Self { Self::default() }

    // millisecond timestamp, bumped so two orders in the same ms stay distinct
    fn next_id(&self) -> String {
        let now = Utc::now().timestamp_millis();
        let prev = self
            .last_ms
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last + 1)))
            .unwrap_or(now);
        format!("demo_{}", now.max(prev + 1))
    }
}

#[async_trait]
impl BrokerGateway for DemoGateway {
    fn mode(&self) -> &'static str { "demo" }

    async fn place_market_order(
        &self,
        symbol: &str,
        volume: f64,
        side: Side,
        sl_pips: Option<u32>,
        tp_pips: Option<u32>,
    ) -> Result<Order, BrokerError> {
        let (sl, tp) = effective_pips(sl_pips, tp_pips);
        let order = Order {
            id: self.next_id(),
            symbol: symbol.to_string(),
            side,
            volume,
            status: OrderStatus::Done,
            open_price: Some(match side { Side::Buy => 1.1234, Side::Sell => 1.1230 }),
            stop_loss: Some(sl as f64),
            take_profit: Some(tp as f64),
            comment: Some("Demo order - broker not configured".to_string()),
        };
        info!(id = %order.id, symbol, side = side.as_str(), volume, "demo order created");
        Ok(order)
    }
}
