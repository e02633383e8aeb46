// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Pipeline --------
pub static TICKS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ticks_total", "pipeline ticks by outcome"),
        &["outcome"],
    )
    .unwrap()
});

pub static SIGNALS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("signals_total", "signals produced by the generator (labels: symbol)"),
        &["symbol"],
    )
    .unwrap()
});

pub static ORDERS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("orders_total", "market orders by gateway mode and result"),
        &["mode", "result"],
    )
    .unwrap()
});

// Tick start -> outcome (milliseconds); overlap skips are not observed
pub static TICK_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new("tick_latency_ms", "Latency from tick start to its outcome (ms)"),
        &["outcome"],
    )
    .unwrap()
});

// -------- Notifications --------
pub static NOTIFICATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("notifications_total", "notification attempts"),
        &["channel", "result"],
    )
    .unwrap()
});

// -------- Push channel --------
pub static BROADCASTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("push_events_total", "events fanned out to viewers"),
        &["event"],
    )
    .unwrap()
});

pub static VIEWERS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("viewers_connected", "registered viewer sessions").unwrap());

pub static LOGINS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("auth_logins_total", "login attempts"), &["result"]).unwrap()
});

// ---- Config visibility ----
pub static CONFIG_BROKER_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_broker_mode", "broker gateway mode (label: mode)"),
        &["mode"],
    )
    .unwrap()
});

pub static CONFIG_CHANNEL: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_notification_channel", "1 if channel configured (label: channel)"),
        &["channel"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry; re-registration errors are ignored
    for m in [
        REGISTRY.register(Box::new(TICKS.clone())),
        REGISTRY.register(Box::new(SIGNALS.clone())),
        REGISTRY.register(Box::new(ORDERS.clone())),
        REGISTRY.register(Box::new(TICK_LATENCY.clone())),
        REGISTRY.register(Box::new(NOTIFICATIONS.clone())),
        REGISTRY.register(Box::new(BROADCASTS.clone())),
        REGISTRY.register(Box::new(VIEWERS.clone())),
        REGISTRY.register(Box::new(LOGINS.clone())),
        REGISTRY.register(Box::new(CONFIG_BROKER_MODE.clone())),
        REGISTRY.register(Box::new(CONFIG_CHANNEL.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}
