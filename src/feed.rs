// ===============================
// src/feed.rs
// ===============================
//
// Market data for the signal generator. Real ingestion is out of scope; the
// mock feed random-walks one symbol and keeps only the latest quote in a
// watch channel, which is all the scheduler ever reads.
//
use chrono::Utc;
use rand::Rng;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::debug;

use crate::domain::MarketSnapshot;

fn start_price(symbol: &str) -> (f64, f64) {
    // (price, pip size)
    match symbol {
        "EURUSD" => (1.0850, 0.0001),
        "GBPUSD" => (1.2700, 0.0001),
        "AUDUSD" => (0.6600, 0.0001),
        "USDCAD" => (1.3600, 0.0001),
        "USDJPY" => (150.00, 0.01),
        _ => (1.0, 0.0001),
    }
}

/// One random-walk step: bid moves -3..=3 pips, spread fixed at one pip.
pub fn step(prev: &MarketSnapshot, pip: f64, pips: i32) -> MarketSnapshot {
    let floor = pip * 100.0;
    let bid = (prev.bid + pips as f64 * pip).max(floor);
    MarketSnapshot { symbol: prev.symbol.clone(), bid, ask: bid + pip, ts: Utc::now() }
}

/// Mock generator, ~1 quote per `every`. Runs until the receiver side is gone.
pub async fn run_mock(snap_tx: watch::Sender<MarketSnapshot>, symbol: String, every: Duration) {
    let (px, pip) = start_price(&symbol);
    let mut last = MarketSnapshot { symbol: symbol.clone(), bid: px, ask: px + pip, ts: Utc::now() };
    loop {
        // jangan simpan ThreadRng melewati .await
        let pips = rand::thread_rng().gen_range(-3..=3);
        last = step(&last, pip, pips);
        if snap_tx.send(last.clone()).is_err() {
            debug!(%symbol, "feed: no subscribers left, stopping");
            return;
        }
        sleep(every).await;
    }
}
