// ===============================
// src/gateway_metaapi.rs
// ===============================
use async_trait::async_trait;
use tokio::time::{sleep, Duration, Instant};
use tracing::{info, warn};

use crate::config::{http_client, ConfigError, MetaApiCfg};
use crate::domain::{Order, OrderStatus, Side};
use crate::gateway::{effective_pips, BrokerError, BrokerGateway};
use crate::metaapi::{account_url, trade_url, AccountInfo, TradeRequest, TradeResponse, AUTH_HEADER};

const POLL_EVERY: Duration = Duration::from_millis(1000);

/// Real trading account over REST.
/// Each order: fetch account -> deploy if needed -> wait connected -> trade.
pub struct MetaApiGateway {
    http: reqwest::Client,
    cfg: MetaApiCfg,
}

impl MetaApiGateway {
    pub fn new(cfg: MetaApiCfg) -> Result<Self, ConfigError> {
        Ok(Self { http: http_client(cfg.request_timeout)?, cfg })
    }

    fn request_failed(&self, stage: &'static str, e: reqwest::Error) -> BrokerError {
        if e.is_timeout() {
            return BrokerError::unavailable(stage, format!("no response within {:?}", self.cfg.request_timeout));
        }
        BrokerError::unavailable(stage, e)
    }

    async fn fetch_account(&self) -> Result<AccountInfo, BrokerError> {
        let url = account_url(&self.cfg.provisioning_url, &self.cfg.account_id);
        let rsp = self
            .http
            .get(url)
            .header(AUTH_HEADER, &self.cfg.token)
            .send()
            .await
            .map_err(|e| self.request_failed("account", e))?;
        if !rsp.status().is_success() {
            let code = rsp.status();
            let body = rsp.text().await.unwrap_or_default();
            return Err(BrokerError::unavailable("account", format!("HTTP {code}: {body}")));
        }
        rsp.json::<AccountInfo>().await.map_err(|e| self.request_failed("account", e))
    }

    async fn deploy(&self) -> Result<(), BrokerError> {
        let url = format!("{}/deploy", account_url(&self.cfg.provisioning_url, &self.cfg.account_id));
        let rsp = self
            .http
            .post(url)
            .header(AUTH_HEADER, &self.cfg.token)
            .send()
            .await
            .map_err(|e| self.request_failed("deploy", e))?;
        if !rsp.status().is_success() {
            let code = rsp.status();
            let body = rsp.text().await.unwrap_or_default();
            return Err(BrokerError::unavailable("deploy", format!("HTTP {code}: {body}")));
        }
        info!(account = %self.cfg.account_id, "broker account deploy requested");
        Ok(())
    }

    /// Deploy (idempotent) and wait until the terminal reports CONNECTED.
    async fn ensure_connected(&self) -> Result<(), BrokerError> {
        let deadline = Instant::now() + self.cfg.connect_timeout;
        let mut deploy_sent = false;
        loop {
            let acc = self.fetch_account().await?;
            if acc.is_deployed() && acc.is_connected() {
                return Ok(());
            }
            if !acc.is_deployed() && !acc.is_deploying() && !deploy_sent {
                self.deploy().await?;
                deploy_sent = true;
            }
            if Instant::now() >= deadline {
                return Err(BrokerError::unavailable(
                    "connect",
                    format!(
                        "account not ready after {:?} (state={}, connection={})",
                        self.cfg.connect_timeout,
                        acc.state,
                        acc.connection_status.as_deref().unwrap_or("unknown")
                    ),
                ));
            }
            sleep(POLL_EVERY).await;
        }
    }

    async fn submit(&self, req: &TradeRequest) -> Result<TradeResponse, BrokerError> {
        let url = trade_url(&self.cfg.client_url, &self.cfg.account_id);
        let rsp = self
            .http
            .post(url)
            .header(AUTH_HEADER, &self.cfg.token)
            .json(req)
            .send()
            .await
            .map_err(|e| self.request_failed("trade", e))?;
        if !rsp.status().is_success() {
            let code = rsp.status();
            let body = rsp.text().await.unwrap_or_default();
            return Err(BrokerError::unavailable("trade", format!("HTTP {code}: {body}")));
        }
        rsp.json::<TradeResponse>().await.map_err(|e| self.request_failed("trade", e))
    }
}

#[async_trait]
impl BrokerGateway for MetaApiGateway {
    fn mode(&self) -> &'static str { "metaapi" }

    async fn place_market_order(
        &self,
        symbol: &str,
        volume: f64,
        side: Side,
        sl_pips: Option<u32>,
        tp_pips: Option<u32>,
    ) -> Result<Order, BrokerError> {
        self.ensure_connected().await?;

        let (sl, tp) = effective_pips(sl_pips, tp_pips);
        let req = TradeRequest::market(symbol, volume, side, sl, tp);
        let rsp = self.submit(&req).await?;

        let status = match rsp.string_code.as_str() {
            "TRADE_RETCODE_DONE" => OrderStatus::Done,
            "TRADE_RETCODE_PLACED" => OrderStatus::Placed,
            other => {
                warn!(code = %other, message = ?rsp.message, "order rejected by broker");
                return Err(BrokerError::unavailable(
                    "trade",
                    format!("{other}: {}", rsp.message.unwrap_or_default()),
                ));
            }
        };
        let id = rsp
            .order_id
            .or(rsp.position_id)
            .ok_or_else(|| BrokerError::unavailable("trade", "response carried no order id"))?;

        info!(%id, symbol, side = side.as_str(), volume, "order placed");
        Ok(Order {
            id,
            symbol: symbol.to_string(),
            side,
            volume,
            status,
            open_price: None,
            stop_loss: Some(sl as f64),
            take_profit: Some(tp as f64),
            comment: rsp.message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Method, Request, Response, Server};

    #[derive(Default)]
    struct MockState {
        account_state: &'static str,
        trade_code: &'static str,
        deploys: u32,
        trades: Vec<serde_json::Value>,
    }

    async fn route(req: Request<Body>, state: Arc<Mutex<MockState>>) -> Response<Body> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();
        let body = hyper::body::to_bytes(req.into_body()).await.unwrap_or_default();
        let mut st = state.lock().unwrap();
        let json = match (method, path.as_str()) {
            (Method::GET, "/users/current/accounts/acc-1") => {
                serde_json::json!({ "_id": "acc-1", "state": st.account_state, "connectionStatus": "CONNECTED" })
            }
            (Method::POST, "/users/current/accounts/acc-1/deploy") => {
                st.deploys += 1;
                st.account_state = "DEPLOYED";
                return Response::builder().status(204).body(Body::empty()).unwrap();
            }
            (Method::POST, "/users/current/accounts/acc-1/trade") => {
                st.trades.push(serde_json::from_slice(&body).unwrap_or_default());
                serde_json::json!({ "numericCode": 10009, "stringCode": st.trade_code, "message": "Request completed", "orderId": "777" })
            }
            _ => return Response::builder().status(404).body(Body::empty()).unwrap(),
        };
        Response::new(Body::from(json.to_string()))
    }

    async fn spawn_mock(state: Arc<Mutex<MockState>>) -> SocketAddr {
        let make_svc = make_service_fn(move |_| {
            let state = state.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let state = state.clone();
                    async move { Ok::<_, Infallible>(route(req, state).await) }
                }))
            }
        });
        let server = Server::bind(&([127, 0, 0, 1], 0).into()).serve(make_svc);
        let addr = server.local_addr();
        tokio::spawn(server);
        addr
    }

    fn gateway(addr: SocketAddr) -> MetaApiGateway {
        let base = format!("http://{addr}");
        MetaApiGateway::new(MetaApiCfg {
            token: "tok".into(),
            account_id: "acc-1".into(),
            provisioning_url: base.clone(),
            client_url: base,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_millis(300),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn deploys_then_places_order_with_default_pips() {
        let state = Arc::new(Mutex::new(MockState { account_state: "UNDEPLOYED", trade_code: "TRADE_RETCODE_DONE", ..Default::default() }));
        let gw = gateway(spawn_mock(state.clone()).await);

        let order = gw.place_market_order("EURUSD", 0.01, Side::Buy, None, None).await.unwrap();
        assert_eq!(order.id, "777");
        assert_eq!(order.status, OrderStatus::Done);

        let st = state.lock().unwrap();
        assert_eq!(st.deploys, 1);
        assert_eq!(st.trades.len(), 1);
        assert_eq!(st.trades[0]["actionType"], "ORDER_TYPE_BUY");
        assert_eq!(st.trades[0]["stopLoss"], 50.0);
        assert_eq!(st.trades[0]["takeProfit"], 100.0);
    }

    #[tokio::test]
    async fn already_deployed_account_is_not_redeployed() {
        let state = Arc::new(Mutex::new(MockState { account_state: "DEPLOYED", trade_code: "TRADE_RETCODE_DONE", ..Default::default() }));
        let gw = gateway(spawn_mock(state.clone()).await);
        gw.place_market_order("EURUSD", 0.01, Side::Sell, Some(30), Some(60)).await.unwrap();
        assert_eq!(state.lock().unwrap().deploys, 0);
    }

    #[tokio::test]
    async fn rejected_trade_surfaces_as_unavailable() {
        let state = Arc::new(Mutex::new(MockState { account_state: "DEPLOYED", trade_code: "TRADE_RETCODE_NO_MONEY", ..Default::default() }));
        let gw = gateway(spawn_mock(state).await);
        let err = gw.place_market_order("EURUSD", 0.01, Side::Buy, None, None).await.unwrap_err();
        let BrokerError::Unavailable { stage, source } = err;
        assert_eq!(stage, "trade");
        assert!(source.to_string().contains("TRADE_RETCODE_NO_MONEY"));
    }

    #[tokio::test]
    async fn unreachable_broker_fails_at_account_stage() {
        // bind then drop to get a port nobody listens on
        let addr = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap()
        };
        let err = gateway(addr).place_market_order("EURUSD", 0.01, Side::Buy, None, None).await.unwrap_err();
        assert!(matches!(err, BrokerError::Unavailable { stage: "account", .. }));
    }

    #[tokio::test]
    async fn silent_broker_fails_within_request_timeout() {
        // accepts connections, never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((sock, _)) = listener.accept().await {
                held.push(sock);
            }
        });

        let started = Instant::now();
        let err = gateway(addr).place_market_order("EURUSD", 0.01, Side::Buy, None, None).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
        let BrokerError::Unavailable { stage, source } = err;
        assert_eq!(stage, "account");
        assert!(source.to_string().contains("no response within"), "{source}");
    }
}
