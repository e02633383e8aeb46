// ===============================
// src/simulator.rs
// ===============================
//
// SIMULATE_UPDATES=true: demo trades drift after they open.
// Every `every`, each open trade gets profit += (r - 0.45) * 2; after its
// fifth update it closes with 10% chance per step. Updates go out as
// partial TradeUpdates (id + changed fields only).
//
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use chrono::Utc;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::broadcast::Broadcaster;
use crate::domain::{Event, Trade, TradeStatus, TradeUpdate};
use crate::server::stopped;

pub const DRIFT_EVERY: Duration = Duration::from_secs(5);
const UPDATES_BEFORE_CLOSE: u32 = 5;

struct Tracked {
    profit: f64,
    updates: u32,
}

pub struct Drift {
    rng: StdRng,
    close_chance: f64,
    open: HashMap<String, Tracked>,
}

impl Drift {
    pub fn new(rng: StdRng) -> Self {
        Self { rng, close_chance: 0.1, open: HashMap::new() }
    }

    pub fn with_close_chance(mut self, p: f64) -> Self {
        self.close_chance = p.clamp(0.0, 1.0);
        self
    }

    pub fn track(&mut self, trade: &Trade) {
        if trade.status == TradeStatus::Open {
            self.open.insert(trade.id.clone(), Tracked { profit: trade.profit, updates: 0 });
        }
    }

    pub fn open_count(&self) -> usize { self.open.len() }

    /// One drift step over every open trade. Closed ones stop being tracked.
    pub fn step(&mut self) -> Vec<TradeUpdate> {
        let mut out = Vec::with_capacity(self.open.len());
        let mut closed = Vec::new();
        for (id, t) in self.open.iter_mut() {
            t.updates += 1;
            let change: f64 = (self.rng.gen::<f64>() - 0.45) * 2.0;
            t.profit = ((t.profit + change) * 100.0).round() / 100.0;
            let close = t.updates > UPDATES_BEFORE_CLOSE && self.rng.gen_bool(self.close_chance);
            let mut u = TradeUpdate { id: id.clone(), profit: Some(t.profit), ..Default::default() };
            if close {
                u.status = Some(TradeStatus::Closed);
                u.closed_at = Some(Utc::now());
                closed.push(id.clone());
            }
            out.push(u);
        }
        for id in closed {
            self.open.remove(&id);
        }
        out
    }
}

pub async fn run(
    mut trades: mpsc::UnboundedReceiver<Trade>,
    broadcaster: Arc<Broadcaster>,
    recorder: Option<mpsc::Sender<Event>>,
    every: Duration,
    shutdown: watch::Receiver<bool>,
) {
    let mut drift = Drift::new(StdRng::from_entropy());
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let stop = stopped(shutdown);
    tokio::pin!(stop);
    info!(every_secs = every.as_secs_f64(), "trade drift simulator started");

    loop {
        tokio::select! {
            _ = &mut stop => break,
            t = trades.recv() => match t {
                Some(t) => drift.track(&t),
                None => break,
            },
            _ = ticker.tick() => {
                for u in drift.step() {
                    if u.status == Some(TradeStatus::Closed) {
                        info!(id = %u.id, profit = ?u.profit, "simulated close");
                    }
                    if let Some(tx) = &recorder {
                        let _ = tx.try_send(Event::Update(u.clone()));
                    }
                    broadcaster.publish_update(u);
                }
                debug!(open = drift.open_count(), "drift step");
            }
        }
    }
    info!("trade drift simulator stopped");
}
