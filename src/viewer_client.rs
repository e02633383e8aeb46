// ===============================
// src/viewer_client.rs
// ===============================
//
// `signal_desk watch`: a terminal viewer. Holds one push connection, feeds
// every frame into ViewerState and prints a summary after each change.
// Reconnects forever with exponential backoff + jitter.
//
use std::time::Duration;

use futures_util::StreamExt;
use rand::Rng;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};
use url::Url;

use crate::domain::PushEvent;
use crate::server::stopped;
use crate::viewer::{ConnectionState, SortDir, SortKey, StatusFilter, ViewerState};

/// 0.5s * 2^min(attempt, 6), so capped at 32s before jitter.
pub fn backoff(attempt: u32) -> Duration {
    let shift = attempt.min(6);
    Duration::from_millis(500u64.saturating_mul(1u64 << shift))
}

pub fn render(state: &ViewerState) -> String {
    let s = state.store.stats();
    let mut out = format!(
        "[{}] trades={} active={} pnl={:.2} win={:.2}% avg={:.2} best={:.2} worst={:.2} exposure={:.0} risk={:.0}\n",
        state.connection(),
        s.total_trades,
        s.active_trades,
        s.total_profit,
        s.win_rate,
        s.avg_profit,
        s.best_trade,
        s.worst_trade,
        s.total_exposure,
        s.risk_score,
    );
    for t in state.store.view(StatusFilter::All, SortKey::OpenedAt, SortDir::Desc).into_iter().take(10) {
        out.push_str(&format!(
            "  {:<24} {:<7} {:<4} {:>6.2} {:<7} {:>8.2}\n",
            t.id,
            t.symbol,
            t.side.upper(),
            t.volume,
            t.status.as_str(),
            t.profit
        ));
    }
    if let Some(n) = state.notifications.iter().next() {
        out.push_str(&format!("  last: [{}] {}\n", n.kind.as_str(), n.message));
    }
    out
}

/// Apply one text frame. Unknown or malformed frames are logged and ignored.
pub fn apply_frame(state: &mut ViewerState, text: &str) -> bool {
    match serde_json::from_str::<PushEvent>(text) {
        Ok(ev) => {
            state.apply(ev);
            true
        }
        Err(e) => {
            warn!(?e, frame = %text, "ignoring unrecognised push frame");
            false
        }
    }
}

pub async fn run(url: String, origin: Option<String>, shutdown: watch::Receiver<bool>) -> ViewerState {
    let mut state = ViewerState::new();
    let stop = stopped(shutdown);
    tokio::pin!(stop);

    let url = match Url::parse(&url) {
        Ok(u) => u,
        Err(e) => {
            error!(?e, %url, "bad push url");
            return state;
        }
    };

    let mut attempt: u32 = 0;
    loop {
        state.set_connection(ConnectionState::Connecting, None);
        let mut req = match url.as_str().into_client_request() {
            Ok(r) => r,
            Err(e) => {
                error!(?e, "cannot build upgrade request");
                return state;
            }
        };
        if let Some(o) = origin.as_deref() {
            match HeaderValue::from_str(o) {
                Ok(v) => {
                    req.headers_mut().insert("Origin", v);
                }
                Err(e) => warn!(?e, origin = o, "origin header dropped"),
            }
        }

        info!(%url, attempt, "connecting to push channel");
        let connected = tokio::select! {
            _ = &mut stop => return state,
            r = connect_async(req) => r,
        };
        match connected {
            Ok((mut ws, _rsp)) => {
                attempt = 0;
                state.set_connection(ConnectionState::Connected, None);
                println!("{}", render(&state));
                loop {
                    let frame = tokio::select! {
                        _ = &mut stop => {
                            let _ = ws.close(None).await;
                            state.set_connection(ConnectionState::Disconnected, None);
                            return state;
                        }
                        f = ws.next() => f,
                    };
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            if apply_frame(&mut state, &text) {
                                println!("{}", render(&state));
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(?e, "push stream error");
                            break;
                        }
                    }
                }
                warn!("push channel closed, reconnecting");
                state.set_connection(ConnectionState::Disconnected, None);
            }
            Err(e) => {
                warn!(?e, "push connect failed");
                state.set_connection(ConnectionState::Error, Some(&e.to_string()));
            }
        }

        attempt = attempt.saturating_add(1);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=250));
        tokio::select! {
            _ = &mut stop => return state,
            _ = sleep(backoff(attempt) + jitter) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::viewer::ConnectionState;

    #[test]
    fn backoff_doubles_then_caps_at_32s() {
        assert_eq!(backoff(0), Duration::from_millis(500));
        assert_eq!(backoff(1), Duration::from_secs(1));
        assert_eq!(backoff(5), Duration::from_secs(16));
        assert_eq!(backoff(6), Duration::from_secs(32));
        assert_eq!(backoff(40), Duration::from_secs(32));
    }

    #[test]
    fn frames_feed_the_store_and_garbage_is_ignored() {
        let mut st = ViewerState::new();
        assert!(apply_frame(
            &mut st,
            r#"{"event":"tradeUpdate","data":{"id":"t1","symbol":"EURUSD","side":"buy","volume":0.01,"status":"open","profit":1.5,"openedAt":"2025-01-01T00:00:00Z"}}"#
        ));
        assert!(apply_frame(&mut st, r#"{"event":"tradeUpdate","data":{"id":"t1","profit":2.5}}"#));
        assert!(!apply_frame(&mut st, "not json"));
        assert!(!apply_frame(&mut st, r#"{"event":"somethingElse","data":{}}"#));

        assert_eq!(st.store.len(), 1);
        assert_eq!(st.store.get("t1").unwrap().profit, 2.5);
        let text = render(&st);
        assert!(text.contains("active=1"));
        assert!(text.contains("EURUSD"));
    }

    #[tokio::test]
    async fn unreachable_backend_reports_error_then_stops_on_shutdown() {
        let addr = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap()
        };
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run(format!("ws://{addr}/ws"), None, stop_rx));
        tokio::time::sleep(Duration::from_millis(200)).await;
        stop_tx.send(true).unwrap();
        let st = task.await.unwrap();
        assert_eq!(st.connection(), ConnectionState::Error);
        assert!(st.notifications.iter().any(|n| n.message.starts_with("Connection error")));
    }
}
