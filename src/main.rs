// ===============================
// src/main.rs
// ===============================
/*
 cargo run -- serve                         # backend on :3000 (PORT)
 cargo run -- watch --url ws://127.0.0.1:3000/ws

 curl -s localhost:3000/health
 curl -s localhost:3000/metrics | egrep '^(ticks_total|orders_total|viewers_connected)'
 curl -s -XPOST localhost:3000/auth/login -H 'content-type: application/json' \
      -d '{"email":"demo@signal-desk.local","password":"1234567ASD"}'
*/
mod auth;
mod broadcast;
mod config;
mod domain;
mod feed;
mod gateway;          // BrokerGateway trait + demo gateway
mod gateway_metaapi;  // real account over REST
mod metaapi;          // wire types / urls for the broker REST API
mod metrics;
mod notify;
mod pipeline;
mod recorder;
mod risk;
mod scheduler;
mod server;
mod simulator;
mod strategy;
mod viewer;
mod viewer_client;

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::auth::Authenticator;
use crate::broadcast::Broadcaster;
use crate::config::{BrokerMode, Cli, Command, Config, ConfigError, DEFAULT_JWT_SECRET};
use crate::domain::{Event, MarketSnapshot};
use crate::gateway::{BrokerGateway, DemoGateway};
use crate::gateway_metaapi::MetaApiGateway;
use crate::notify::NotificationSink;
use crate::pipeline::ExecutionPipeline;
use crate::server::{AppState, ServerError};

const FEED_EVERY: Duration = Duration::from_secs(1);
const RECORDER_DRAIN: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Server(#[from] ServerError),
}

impl StartupError {
    fn exit_code(&self) -> u8 {
        match self {
            StartupError::Config(_) => 2,
            StartupError::Server(_) => 1,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // ---- Logging ----
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Serve { port: None, tick_secs: None });

    match command {
        Command::Watch { url, origin } => {
            watch_viewer(url, origin).await;
            ExitCode::SUCCESS
        }
        Command::Serve { port, tick_secs } => {
            let result = match Config::load() {
                Ok(mut cfg) => {
                    if let Some(p) = port {
                        cfg.port = p;
                    }
                    if let Some(t) = tick_secs {
                        cfg.tick_interval = Duration::from_secs(t.max(1));
                    }
                    serve(cfg).await
                }
                Err(e) => Err(e.into()),
            };
            match result {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!(error = %e, "fatal");
                    ExitCode::from(e.exit_code())
                }
            }
        }
    }
}

async fn serve(cfg: Config) -> Result<(), StartupError> {
    // ---- Metrics + startup info ----
    metrics::init();
    metrics::CONFIG_BROKER_MODE.with_label_values(&[cfg.broker_mode_label()]).set(1);
    info!(
        port = cfg.port,
        broker = cfg.broker_mode_label(),
        strategy = ?cfg.strategy,
        symbols = ?cfg.symbols,
        tick_secs = cfg.tick_interval.as_secs(),
        max_volume = cfg.limits.max_volume,
        replay = cfg.replay_capacity,
        simulate = cfg.simulate_updates,
        "startup config"
    );
    if cfg.auth.secret == DEFAULT_JWT_SECRET {
        warn!("JWT_SECRET not set, using the development secret");
    }

    // ---- Services ----
    let sink = Arc::new(NotificationSink::from_config(cfg.telegram.as_ref(), cfg.smtp.as_ref())?);
    let gateway: Arc<dyn BrokerGateway> = match &cfg.broker {
        BrokerMode::Demo => {
            warn!("broker credentials not configured, orders are simulated");
            Arc::new(DemoGateway::new())
        }
        BrokerMode::MetaApi(m) => {
            info!(account = %m.account_id, "using broker REST gateway");
            Arc::new(MetaApiGateway::new(m.clone())?)
        }
    };
    let broadcaster = Arc::new(Broadcaster::new(cfg.replay_capacity));
    let (stop_tx, stop_rx) = watch::channel(false);

    // ---- Recorder (optional) ----
    let (rec_tx, rec_task) = match cfg.record_file.clone() {
        Some(path) => {
            let (tx, rx) = mpsc::channel::<Event>(8192);
            let task = tokio::spawn(async move {
                if let Err(e) = recorder::run(rx, path).await {
                    error!(?e, "recorder stopped");
                }
            });
            (Some(tx), Some(task))
        }
        None => (None, None),
    };

    // ---- Feed (mock) ----
    let primary = cfg.symbols.first().cloned().unwrap_or_else(|| "EURUSD".to_string());
    let (snap_tx, snap_rx) = watch::channel(MarketSnapshot::empty(&primary));
    let feed_task = tokio::spawn(feed::run_mock(snap_tx, primary, FEED_EVERY));

    // ---- Pipeline ----
    let generator = strategy::build(&cfg.strategy, &cfg.symbols);
    info!(generator = generator.name(), "signal generator ready");
    let mut pipeline = ExecutionPipeline::new(generator, gateway, sink, broadcaster.clone(), cfg.limits.clone());
    if let Some(tx) = &rec_tx {
        pipeline = pipeline.with_recorder(tx.clone());
    }
    let sim_task = if cfg.simulate_updates {
        let (tap_tx, tap_rx) = mpsc::unbounded_channel();
        pipeline = pipeline.with_trade_tap(tap_tx);
        Some(tokio::spawn(simulator::run(
            tap_rx,
            broadcaster.clone(),
            rec_tx.clone(),
            simulator::DRIFT_EVERY,
            stop_rx.clone(),
        )))
    } else {
        None
    };
    let pipeline = Arc::new(pipeline);

    // ---- HTTP + push ----
    let state = Arc::new(AppState {
        broadcaster: broadcaster.clone(),
        auth: Authenticator::new(&cfg.auth),
        origins: cfg.allowed_origins.clone(),
        shutdown: stop_rx.clone(),
    });
    let (local, mut http) = server::bind(SocketAddr::from(([0, 0, 0, 0], cfg.port)), state)?;
    info!(push = %format!("ws://{local}/ws"), "ready");

    // ---- Scheduler ----
    let sched = scheduler::spawn(pipeline.clone(), snap_rx, cfg.tick_interval, cfg.shutdown_grace);

    // ---- Wait for a signal or a dead server ----
    let early = tokio::select! {
        _ = shutdown_signal() => {
            info!("termination signal received");
            None
        }
        r = &mut http => {
            warn!("http server task ended, shutting down");
            Some(r)
        }
    };

    // stop ticking + drain, then close listener and push sessions
    sched.shutdown().await;
    let _ = stop_tx.send(true);
    let served = match early {
        Some(r) => r,
        None => http.await,
    };
    feed_task.abort();
    if let Some(t) = sim_task {
        let _ = t.await;
    }

    // recorder exits once every sender is gone
    drop(pipeline);
    drop(rec_tx);
    if let Some(t) = rec_task {
        if tokio::time::timeout(RECORDER_DRAIN, t).await.is_err() {
            warn!("recorder did not drain in time");
        }
    }

    match served {
        Ok(Ok(())) => {
            info!("shutdown complete");
            Ok(())
        }
        Ok(Err(e)) => Err(e.into()),
        Err(e) => {
            error!(?e, "http server task panicked");
            Ok(())
        }
    }
}

async fn watch_viewer(url: String, origin: Option<String>) {
    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(viewer_client::run(url, origin, stop_rx));
    shutdown_signal().await;
    let _ = stop_tx.send(true);
    match task.await {
        Ok(state) => println!("{}", viewer_client::render(&state)),
        Err(e) => error!(?e, "viewer task failed"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(?e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!(?e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = term => {}
    }
}
