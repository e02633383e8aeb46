// ===============================
// src/broadcast.rs
// ===============================
//
// Viewer registry + fan-out. One unbounded queue per session keeps delivery
// FIFO per connection; the websocket writer task drains it. Frames are
// serialized once per publish and shared.
//
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use ahash::AHashMap as HashMap;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::domain::{Notice, NoticeKind, PushEvent, Trade, TradeUpdate};
use crate::metrics::{BROADCASTS, VIEWERS};

pub type SessionId = u64;
pub type Frame = Arc<str>;

struct Registry {
    sessions: HashMap<SessionId, mpsc::UnboundedSender<Frame>>,
    replay: VecDeque<Frame>,
}

pub struct Broadcaster {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    replay_cap: usize,
}

impl Broadcaster {
    /// `replay_cap` = number of recent trade frames handed to new sessions (0 = none).
    pub fn new(replay_cap: usize) -> Self {
        Self {
            registry: Mutex::new(Registry { sessions: HashMap::new(), replay: VecDeque::with_capacity(replay_cap) }),
            next_id: AtomicU64::new(1),
            replay_cap,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Called on viewer connect. Replayed frames (if any) are queued first.
    pub fn register(&self) -> (SessionId, mpsc::UnboundedReceiver<Frame>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut reg = self.lock();
        for frame in reg.replay.iter() {
            let _ = tx.send(frame.clone());
        }
        reg.sessions.insert(id, tx);
        VIEWERS.set(reg.sessions.len() as i64);
        info!(session = id, viewers = reg.sessions.len(), "viewer connected");
        (id, rx)
    }

    /// Called on viewer disconnect.
    pub fn deregister(&self, id: SessionId) {
        let mut reg = self.lock();
        if reg.sessions.remove(&id).is_some() {
            VIEWERS.set(reg.sessions.len() as i64);
            info!(session = id, viewers = reg.sessions.len(), "viewer disconnected");
        }
    }

    pub fn session_count(&self) -> usize { self.lock().sessions.len() }

    /// Fan a full trade out to every viewer.
    pub fn publish(&self, trade: &Trade) {
        self.publish_update(TradeUpdate::from(trade));
    }

    /// Fan a (possibly partial) trade event out to every viewer.
    pub fn publish_update(&self, update: TradeUpdate) {
        self.fan_out(&PushEvent::TradeUpdate(update), true);
    }

    /// Push a notice into every viewer's notification list. Never replayed.
    pub fn announce(&self, kind: NoticeKind, message: &str) {
        let ev = PushEvent::Notification(Notice { kind, message: message.to_string(), timestamp: Utc::now() });
        self.fan_out(&ev, false);
    }

    fn fan_out(&self, ev: &PushEvent, replayable: bool) {
        let frame: Frame = match serde_json::to_string(ev) {
            Ok(s) => s.into(),
            Err(e) => {
                error!(?e, "push event serialize failed, dropped");
                return;
            }
        };
        let label = match ev {
            PushEvent::TradeUpdate(_) => "tradeUpdate",
            PushEvent::Notification(_) => "notification",
        };

        let mut reg = self.lock();
        if replayable && self.replay_cap > 0 {
            if reg.replay.len() == self.replay_cap {
                reg.replay.pop_front();
            }
            reg.replay.push_back(frame.clone());
        }
        // fire-and-forget; a closed queue means the writer is gone
        let before = reg.sessions.len();
        reg.sessions.retain(|id, tx| {
            let alive = tx.send(frame.clone()).is_ok();
            if !alive {
                debug!(session = *id, "pruned closed viewer session");
            }
            alive
        });
        if reg.sessions.len() != before {
            VIEWERS.set(reg.sessions.len() as i64);
        }
        BROADCASTS.with_label_values(&[label]).inc();
        debug!(event = label, viewers = reg.sessions.len(), "push event fanned out");
    }
}
