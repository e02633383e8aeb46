// ===============================
// src/server.rs
// ===============================
//
// One hyper listener for everything viewers touch:
//   GET  /ws             push channel (websocket upgrade, Origin checked)
//   POST /auth/login     demo account -> bearer token
//   GET  /auth/profile   POST /auth/validate   POST /auth/logout  (bearer)
//   GET  /health         GET /metrics
//
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use hyper::header::{self, HeaderValue};
use hyper::service::{make_service_fn, service_fn};
use hyper::upgrade::Upgraded;
use hyper::{Body, Method, Request, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::auth::{AuthError, Authenticator};
use crate::broadcast::Broadcaster;
use crate::config::AllowedOrigins;
use crate::metrics::{encode_metrics, LOGINS};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: hyper::Error,
    },
    #[error("http server failed: {0}")]
    Serve(#[from] hyper::Error),
}

pub struct AppState {
    pub broadcaster: Arc<Broadcaster>,
    pub auth: Authenticator,
    pub origins: AllowedOrigins,
    /// flips to true once; closes the listener and every push session
    pub shutdown: watch::Receiver<bool>,
}

/// Resolves when `rx` reads true or its sender is gone.
pub async fn stopped(mut rx: watch::Receiver<bool>) {
    loop {
        let stop = *rx.borrow_and_update();
        if stop || rx.changed().await.is_err() {
            return;
        }
    }
}

/// Bind now (so bind errors surface at startup) and serve in the background.
pub fn bind(addr: SocketAddr, state: Arc<AppState>) -> Result<(SocketAddr, JoinHandle<Result<(), ServerError>>), ServerError> {
    let builder = hyper::Server::try_bind(&addr).map_err(|source| ServerError::Bind { addr, source })?;
    let stop = state.shutdown.clone();
    let make_svc = make_service_fn(move |_| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(route(req, state).await) }
            }))
        }
    });
    let server = builder.serve(make_svc);
    let local = server.local_addr();
    info!(addr = %local, "http server listening");

    let handle = tokio::spawn(async move {
        server.with_graceful_shutdown(stopped(stop)).await?;
        info!("http server closed");
        Ok::<(), ServerError>(())
    });
    Ok((local, handle))
}

async fn route(req: Request<Body>, state: Arc<AppState>) -> Response<Body> {
    let origin = req.headers().get(header::ORIGIN).cloned();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let mut rsp = match (&method, path.as_str()) {
        (&Method::GET, "/health") => json_response(StatusCode::OK, json!({ "status": "ok", "timestamp": Utc::now() })),
        (&Method::GET, "/metrics") => {
            let mut rsp = Response::new(Body::from(encode_metrics()));
            rsp.headers_mut().insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; version=0.0.4"));
            rsp
        }
        (&Method::GET, "/ws") => return upgrade(req, state),
        (&Method::POST, "/auth/login") => login(req, &state).await,
        (&Method::GET, "/auth/profile") => with_claims(&req, &state, |claims, state| {
            let user = state.auth.user(&claims.user_id)?;
            Ok(json!(user))
        }),
        (&Method::POST, "/auth/validate") => with_claims(&req, &state, |claims, _| {
            Ok(json!({ "valid": true, "user": { "userId": claims.user_id, "email": claims.email } }))
        }),
        (&Method::POST, "/auth/logout") => with_claims(&req, &state, |claims, _| {
            info!(email = %claims.email, "user logged out");
            Ok(json!({ "message": "Logged out successfully" }))
        }),
        (&Method::OPTIONS, _) => {
            let mut rsp = Response::new(Body::empty());
            *rsp.status_mut() = StatusCode::NO_CONTENT;
            rsp
        }
        _ => json_response(StatusCode::NOT_FOUND, json!({ "error": "Not found" })),
    };
    cors(&mut rsp, origin, &state.origins);
    rsp
}

fn json_response(status: StatusCode, body: Value) -> Response<Body> {
    let mut rsp = Response::new(Body::from(body.to_string()));
    *rsp.status_mut() = status;
    rsp.headers_mut().insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    rsp
}

fn cors(rsp: &mut Response<Body>, origin: Option<HeaderValue>, allowed: &AllowedOrigins) {
    let Some(origin) = origin else { return };
    if !allowed.allows(origin.to_str().ok()) {
        return;
    }
    let h = rsp.headers_mut();
    h.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    h.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("authorization, content-type"));
    h.insert(header::ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static("GET, POST, OPTIONS"));
}

fn auth_status(e: &AuthError) -> StatusCode {
    match e {
        AuthError::MissingField => StatusCode::BAD_REQUEST,
        AuthError::InvalidCredentials | AuthError::MissingToken => StatusCode::UNAUTHORIZED,
        AuthError::InvalidToken | AuthError::Expired => StatusCode::FORBIDDEN,
        AuthError::UnknownUser => StatusCode::NOT_FOUND,
        AuthError::Key => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn auth_error(e: AuthError) -> Response<Body> {
    json_response(auth_status(&e), json!({ "error": e.to_string() }))
}

#[derive(Debug, Default, Deserialize)]
struct LoginBody {
    email: Option<String>,
    password: Option<String>,
}

async fn login(req: Request<Body>, state: &AppState) -> Response<Body> {
    let body = match hyper::body::to_bytes(req.into_body()).await {
        Ok(b) => b,
        Err(e) => return json_response(StatusCode::BAD_REQUEST, json!({ "error": format!("unreadable body: {e}") })),
    };
    // malformed json is treated like missing fields
    let creds: LoginBody = serde_json::from_slice(&body).unwrap_or_default();
    match state.auth.login(creds.email.as_deref(), creds.password.as_deref()) {
        Ok((token, user)) => {
            LOGINS.with_label_values(&["ok"]).inc();
            info!(email = %user.email, "user logged in");
            json_response(StatusCode::OK, json!({ "token": token, "user": user }))
        }
        Err(e) => {
            LOGINS.with_label_values(&["failed"]).inc();
            warn!(email = ?creds.email, error = %e, "login refused");
            auth_error(e)
        }
    }
}

fn with_claims<F>(req: &Request<Body>, state: &AppState, f: F) -> Response<Body>
where
    F: FnOnce(crate::auth::Claims, &AppState) -> Result<Value, AuthError>,
{
    let bearer = req.headers().get(header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    match state.auth.authorize(bearer).and_then(|claims| f(claims, state)) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => auth_error(e),
    }
}

// ---------------------------------------------------------------------------
// Push channel
// ---------------------------------------------------------------------------

fn header_has(req: &Request<Body>, name: header::HeaderName, token: &str) -> bool {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|p| p.trim().eq_ignore_ascii_case(token)))
        .unwrap_or(false)
}

fn upgrade(mut req: Request<Body>, state: Arc<AppState>) -> Response<Body> {
    let origin = req.headers().get(header::ORIGIN).and_then(|v| v.to_str().ok()).map(str::to_string);
    if !state.origins.allows(origin.as_deref()) {
        warn!(origin = ?origin, "push upgrade refused: origin not allowed");
        return json_response(StatusCode::FORBIDDEN, json!({ "error": "Origin not allowed" }));
    }
    let key = match req.headers().get(header::SEC_WEBSOCKET_KEY) {
        Some(k) if header_has(&req, header::UPGRADE, "websocket") && header_has(&req, header::CONNECTION, "upgrade") => {
            derive_accept_key(k.as_bytes())
        }
        _ => return json_response(StatusCode::BAD_REQUEST, json!({ "error": "Expected websocket upgrade" })),
    };
    let Ok(accept) = HeaderValue::from_str(&key) else {
        return json_response(StatusCode::BAD_REQUEST, json!({ "error": "Bad websocket key" }));
    };

    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let ws = WebSocketStream::from_raw_socket(upgraded, Role::Server, None).await;
                push_session(ws, state).await;
            }
            Err(e) => warn!(?e, "push upgrade failed"),
        }
    });

    let mut rsp = Response::new(Body::empty());
    *rsp.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let h = rsp.headers_mut();
    h.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    h.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    h.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
    rsp
}

/// Drains the session queue into the socket until either side goes away.
async fn push_session(ws: WebSocketStream<Upgraded>, state: Arc<AppState>) {
    let (id, mut queue) = state.broadcaster.register();
    let (mut sink, mut incoming) = ws.split();
    let stop = stopped(state.shutdown.clone());
    tokio::pin!(stop);

    loop {
        tokio::select! {
            frame = queue.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = sink.send(Message::Text(frame.to_string())).await {
                    debug!(session = id, ?e, "push write failed");
                    break;
                }
            }
            msg = incoming.next() => match msg {
                None | Some(Ok(Message::Close(_))) => break,
                Some(Err(e)) => {
                    debug!(session = id, ?e, "push read failed");
                    break;
                }
                // viewers only listen; pings are answered by the protocol layer
                Some(Ok(_)) => {}
            },
            _ = &mut stop => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
    state.broadcaster.deregister(id);
}
