// ===============================
// src/metaapi.rs
// ===============================
//
// Minimal wire model for the MetaApi provisioning + trade REST APIs.
//
use serde::{Deserialize, Serialize};

use crate::domain::Side;

pub const AUTH_HEADER: &str = "auth-token";

pub fn account_url(provisioning: &str, account_id: &str) -> String {
    format!(
        "{}/users/current/accounts/{}",
        provisioning.trim_end_matches('/'),
        urlencoding::encode(account_id)
    )
}

pub fn trade_url(client: &str, account_id: &str) -> String {
    format!(
        "{}/users/current/accounts/{}/trade",
        client.trim_end_matches('/'),
        urlencoding::encode(account_id)
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    #[serde(rename = "_id", default)]
    pub id: Option<String>,
    pub state: String,                     // CREATED, DEPLOYING, DEPLOYED, UNDEPLOYING, UNDEPLOYED, ...
    #[serde(default)]
    pub connection_status: Option<String>, // CONNECTED, DISCONNECTED, DISCONNECTED_FROM_BROKER
}

impl AccountInfo {
    pub fn is_deployed(&self) -> bool { self.state == "DEPLOYED" }
    pub fn is_deploying(&self) -> bool { self.state == "DEPLOYING" }
    pub fn is_connected(&self) -> bool { self.connection_status.as_deref() == Some("CONNECTED") }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRequest {
    pub action_type: &'static str,
    pub symbol: String,
    pub volume: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub stop_loss_units: &'static str,
    pub take_profit_units: &'static str,
}

impl TradeRequest {
    pub fn market(symbol: &str, volume: f64, side: Side, sl_pips: u32, tp_pips: u32) -> Self {
        Self {
            action_type: match side {
                Side::Buy => "ORDER_TYPE_BUY",
                Side::Sell => "ORDER_TYPE_SELL",
            },
            symbol: symbol.to_string(),
            volume,
            stop_loss: sl_pips as f64,
            take_profit: tp_pips as f64,
            stop_loss_units: "RELATIVE_PIPS",
            take_profit_units: "RELATIVE_PIPS",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeResponse {
    #[serde(default)]
    pub numeric_code: Option<i64>,
    pub string_code: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub position_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trade_request_uses_relative_pips() {
        let v = serde_json::to_value(TradeRequest::market("EURUSD", 0.01, Side::Sell, 50, 100)).unwrap();
        assert_eq!(v["actionType"], "ORDER_TYPE_SELL");
        assert_eq!(v["stopLoss"], 50.0);
        assert_eq!(v["takeProfitUnits"], "RELATIVE_PIPS");
    }

    #[test]
    fn account_ids_are_path_encoded() {
        assert_eq!(account_url("https://p.example/", "a b"), "https://p.example/users/current/accounts/a%20b");
    }

    #[test]
    fn parses_trade_response() {
        let r: TradeResponse =
            serde_json::from_str(r#"{"numericCode":10009,"stringCode":"TRADE_RETCODE_DONE","message":"Request completed","orderId":"46870472"}"#)
                .unwrap();
        assert_eq!(r.string_code, "TRADE_RETCODE_DONE");
        assert_eq!(r.order_id.as_deref(), Some("46870472"));
    }
}
