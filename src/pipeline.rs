// ===============================
// src/pipeline.rs
// ===============================
//
// One tick: generator -> checks -> broker -> notify -> broadcast.
// At most one tick runs at a time; an overlapping tick is skipped, never
// queued. Every failure stays inside the tick.
//
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::broadcast::Broadcaster;
use crate::config::Limits;
use crate::domain::{Event, MarketSnapshot, NoticeKind, TickOutcome, Trade};
use crate::gateway::{effective_pips, BrokerGateway};
use crate::metrics::{ORDERS, SIGNALS, TICKS, TICK_LATENCY};
use crate::notify::NotificationSink;
use crate::risk;
use crate::strategy::SignalGenerator;

/// Small opening P&L so demo trades do not all sit at exactly zero.
pub fn demo_profit() -> f64 {
    let raw: f64 = rand::thread_rng().gen_range(-1.0..1.0);
    (raw * 100.0).round() / 100.0
}

pub struct ExecutionPipeline {
    generator: Mutex<Box<dyn SignalGenerator>>,
    gateway: Arc<dyn BrokerGateway>,
    sink: Arc<NotificationSink>,
    broadcaster: Arc<Broadcaster>,
    limits: Limits,
    recorder: Option<mpsc::Sender<Event>>,
    trade_tap: Option<mpsc::UnboundedSender<Trade>>,
    in_flight: tokio::sync::Mutex<()>,
    profit_seed: fn() -> f64,
}

impl ExecutionPipeline {
    pub fn new(
        generator: Box<dyn SignalGenerator>,
        gateway: Arc<dyn BrokerGateway>,
        sink: Arc<NotificationSink>,
        broadcaster: Arc<Broadcaster>,
        limits: Limits,
    ) -> Self {
        Self {
            generator: Mutex::new(generator),
            gateway,
            sink,
            broadcaster,
            limits,
            recorder: None,
            trade_tap: None,
            in_flight: tokio::sync::Mutex::new(()),
            profit_seed: demo_profit,
        }
    }

    pub fn with_recorder(mut self, tx: mpsc::Sender<Event>) -> Self {
        self.recorder = Some(tx);
        self
    }

    /// Every executed trade is also sent here (drift simulator).
    pub fn with_trade_tap(mut self, tx: mpsc::UnboundedSender<Trade>) -> Self {
        self.trade_tap = Some(tx);
        self
    }

    pub fn with_profit_seed(mut self, seed: fn() -> f64) -> Self {
        self.profit_seed = seed;
        self
    }

    pub fn gateway_mode(&self) -> &'static str { self.gateway.mode() }

    pub async fn run_tick(&self, snapshot: &MarketSnapshot) -> TickOutcome {
        let Ok(_guard) = self.in_flight.try_lock() else {
            warn!("tick skipped: previous tick still in flight");
            return self.finish(TickOutcome::Skipped, None);
        };
        let started = Instant::now();

        let signal = {
            let mut g = self.generator.lock().unwrap_or_else(|p| p.into_inner());
            g.generate(snapshot)
        };
        let Some(signal) = signal else {
            debug!(symbol = %snapshot.symbol, "no signal this tick");
            return self.finish(TickOutcome::Skipped, Some(started));
        };
        SIGNALS.with_label_values(&[&signal.symbol]).inc();
        info!(symbol = %signal.symbol, side = signal.side.as_str(), volume = signal.volume, "signal");

        if let Err(e) = risk::check(&signal, &self.limits) {
            warn!(error = %e, ?signal, "signal rejected");
            self.notify_failure(&e.to_string()).await;
            return self.finish(TickOutcome::Rejected(e.to_string()), Some(started));
        }

        let mode = self.gateway.mode();
        let order = match self
            .gateway
            .place_market_order(&signal.symbol, signal.volume, signal.side, signal.stop_loss_pips, signal.take_profit_pips)
            .await
        {
            Ok(o) => o,
            Err(e) => {
                // next tick is the only retry
                error!(error = %e, symbol = %signal.symbol, "order placement failed");
                ORDERS.with_label_values(&[mode, "failed"]).inc();
                self.notify_failure(&e.to_string()).await;
                return self.finish(TickOutcome::ExecutionFailed(e.to_string()), Some(started));
            }
        };
        ORDERS.with_label_values(&[mode, "ok"]).inc();

        let (sl, tp) = effective_pips(signal.stop_loss_pips, signal.take_profit_pips);
        let trade = Trade::from_order(&order, Some(sl), Some(tp), (self.profit_seed)());

        let message = format!("Trade executed: {} {} {}", signal.side.upper(), signal.volume, signal.symbol);
        self.sink.send(NoticeKind::Success, &message).await;
        info!(id = %trade.id, "{message}");

        self.broadcaster.publish(&trade);
        self.record(Event::Trade(trade.clone()));
        if let Some(tap) = &self.trade_tap {
            let _ = tap.send(trade.clone());
        }

        self.finish(TickOutcome::Executed(trade), Some(started))
    }

    async fn notify_failure(&self, reason: &str) {
        let message = format!("Trade execution failed: {reason}");
        self.sink.send(NoticeKind::Error, &message).await;
        self.broadcaster.announce(NoticeKind::Error, &message);
    }

    fn record(&self, ev: Event) {
        if let Some(tx) = &self.recorder {
            let _ = tx.try_send(ev);
        }
    }

    fn finish(&self, outcome: TickOutcome, started: Option<Instant>) -> TickOutcome {
        TICKS.with_label_values(&[outcome.label()]).inc();
        if let Some(t) = started {
            TICK_LATENCY.with_label_values(&[outcome.label()]).observe(t.elapsed().as_secs_f64() * 1_000.0);
        }
        let detail = match &outcome {
            TickOutcome::Rejected(r) | TickOutcome::ExecutionFailed(r) => Some(r.clone()),
            TickOutcome::Executed(t) => Some(t.id.clone()),
            TickOutcome::Skipped => None,
        };
        self.record(Event::Tick { ts: Utc::now(), outcome: outcome.label().to_string(), detail });
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use crate::domain::{Order, PushEvent, Side, Signal, TradeStatus};
    use crate::gateway::{BrokerError, DemoGateway};
    use crate::notify::tests::StubChannel;
    use crate::notify::Channel;
    use crate::strategy::FixedSignal;
    use crate::viewer::ClientStateStore;

    struct NoSignal;
    impl SignalGenerator for NoSignal {
        fn name(&self) -> &'static str { "none" }
        fn generate(&mut self, _: &MarketSnapshot) -> Option<Signal> { None }
    }

    #[derive(Default)]
    struct CountingGateway {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl BrokerGateway for CountingGateway {
        fn mode(&self) -> &'static str { "stub" }
        async fn place_market_order(
            &self,
            symbol: &str,
            volume: f64,
            side: Side,
            sl: Option<u32>,
            tp: Option<u32>,
        ) -> Result<Order, BrokerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(BrokerError::unavailable("connect", "account not ready"));
            }
            DemoGateway::new().place_market_order(symbol, volume, side, sl, tp).await
        }
    }

    /// Blocks inside the order call until released.
    #[derive(Default)]
    struct BlockingGateway {
        calls: AtomicUsize,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl BrokerGateway for BlockingGateway {
        fn mode(&self) -> &'static str { "blocking" }
        async fn place_market_order(
            &self,
            symbol: &str,
            volume: f64,
            side: Side,
            sl: Option<u32>,
            tp: Option<u32>,
        ) -> Result<Order, BrokerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            self.release.notified().await;
            DemoGateway::new().place_market_order(symbol, volume, side, sl, tp).await
        }
    }

    fn demo_sink() -> Arc<NotificationSink> {
        Arc::new(NotificationSink::new(vec![Channel::Unconfigured("telegram"), Channel::Unconfigured("email")]))
    }

    fn pipeline(gen: Box<dyn SignalGenerator>, gw: Arc<dyn BrokerGateway>, sink: Arc<NotificationSink>, b: Arc<Broadcaster>) -> ExecutionPipeline {
        ExecutionPipeline::new(gen, gw, sink, b, Limits { max_volume: 1.0 }).with_profit_seed(|| 0.25)
    }

    fn trade_frames(rx: &mut mpsc::UnboundedReceiver<crate::broadcast::Frame>) -> (usize, usize) {
        let (mut trades, mut notices) = (0, 0);
        while let Ok(f) = rx.try_recv() {
            match serde_json::from_str::<PushEvent>(&f).unwrap() {
                PushEvent::TradeUpdate(_) => trades += 1,
                PushEvent::Notification(_) => notices += 1,
            }
        }
        (trades, notices)
    }

    #[tokio::test]
    async fn no_signal_means_no_downstream_calls() {
        let gw = Arc::new(CountingGateway::default());
        let (chat, seen) = StubChannel::new("telegram", false);
        let sink = Arc::new(NotificationSink::new(vec![Channel::Configured(Box::new(chat))]));
        let b = Arc::new(Broadcaster::new(0));
        let (_, mut rx) = b.register();

        let p = pipeline(Box::new(NoSignal), gw.clone(), sink, b);
        assert_eq!(p.run_tick(&MarketSnapshot::empty("EURUSD")).await, TickOutcome::Skipped);
        assert_eq!(gw.calls.load(Ordering::SeqCst), 0);
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(trade_frames(&mut rx), (0, 0));
    }

    #[tokio::test]
    async fn invalid_signal_is_rejected_before_the_gateway() {
        let gw = Arc::new(CountingGateway::default());
        let (chat, seen) = StubChannel::new("telegram", false);
        let sink = Arc::new(NotificationSink::new(vec![Channel::Configured(Box::new(chat))]));
        let b = Arc::new(Broadcaster::new(0));
        let (_, mut rx) = b.register();

        let mut bad = FixedSignal::default();
        bad.signal.volume = 0.0;
        let p = pipeline(Box::new(bad), gw.clone(), sink, b);

        let timed = || TICK_LATENCY.with_label_values(&["rejected"]).get_sample_count();
        let before = timed();
        let out = p.run_tick(&MarketSnapshot::empty("EURUSD")).await;
        assert!(matches!(out, TickOutcome::Rejected(_)));
        assert!(timed() > before, "rejected tick latency not observed");
        assert_eq!(gw.calls.load(Ordering::SeqCst), 0);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, NoticeKind::Error);
        assert!(seen[0].1.starts_with("Trade execution failed"));
        assert_eq!(trade_frames(&mut rx), (0, 1));
    }

    #[tokio::test]
    async fn gateway_failure_notifies_and_does_not_broadcast_or_retry() {
        let gw = Arc::new(CountingGateway { fail: true, ..Default::default() });
        let (chat, seen) = StubChannel::new("telegram", true);
        let sink = Arc::new(NotificationSink::new(vec![Channel::Configured(Box::new(chat))]));
        let b = Arc::new(Broadcaster::new(0));
        let (_, mut rx) = b.register();
        let p = pipeline(Box::new(FixedSignal::default()), gw.clone(), sink, b);

        let out = p.run_tick(&MarketSnapshot::empty("EURUSD")).await;
        match out {
            TickOutcome::ExecutionFailed(reason) => assert!(reason.contains("account not ready")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(gw.calls.load(Ordering::SeqCst), 1);
        // the failing notification channel was still attempted and swallowed
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(trade_frames(&mut rx), (0, 1));
    }

    #[tokio::test]
    async fn overlapping_tick_is_skipped_not_queued() {
        let gw = Arc::new(BlockingGateway::default());
        let b = Arc::new(Broadcaster::new(0));
        let p = Arc::new(pipeline(Box::new(FixedSignal::default()), gw.clone(), demo_sink(), b));

        let first = {
            let p = p.clone();
            tokio::spawn(async move { p.run_tick(&MarketSnapshot::empty("EURUSD")).await })
        };
        gw.entered.notified().await;

        let second = p.run_tick(&MarketSnapshot::empty("EURUSD")).await;
        assert_eq!(second, TickOutcome::Skipped);
        assert_eq!(gw.calls.load(Ordering::SeqCst), 1);

        gw.release.notify_one();
        let first = first.await.unwrap();
        assert!(matches!(first, TickOutcome::Executed(_)));
        assert_eq!(gw.calls.load(Ordering::SeqCst), 1);

        // guard released: the next tick runs again
        gw.release.notify_one();
        assert!(matches!(p.run_tick(&MarketSnapshot::empty("EURUSD")).await, TickOutcome::Executed(_)));
        assert_eq!(gw.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fixed_signal_end_to_end_reaches_viewer_store() {
        let b = Arc::new(Broadcaster::new(0));
        let (_, mut rx) = b.register();
        let p = pipeline(Box::new(FixedSignal::default()), Arc::new(DemoGateway::new()), demo_sink(), b);

        let mut store = ClientStateStore::new();
        let before = store.stats().active_trades;

        let trade = match p.run_tick(&MarketSnapshot::empty("EURUSD")).await {
            TickOutcome::Executed(t) => t,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(trade.status, TradeStatus::Open);
        assert_eq!(trade.symbol, "EURUSD");
        assert_eq!(trade.side, Side::Buy);
        assert_eq!(trade.stop_loss_pips, Some(30));
        assert_eq!(trade.take_profit_pips, Some(60));
        assert_eq!(trade.profit, 0.25);

        let mut published = 0;
        while let Ok(f) = rx.try_recv() {
            if let PushEvent::TradeUpdate(u) = serde_json::from_str::<PushEvent>(&f).unwrap() {
                assert_eq!(u.id, trade.id);
                published += 1;
                store.upsert(u);
            }
        }
        assert_eq!(published, 1);
        assert_eq!(store.stats().active_trades, before + 1);
        assert_eq!(store.get(&trade.id).map(|t| t.symbol.as_str()), Some("EURUSD"));
    }

    #[tokio::test]
    async fn silent_chat_endpoint_does_not_stall_broadcast_or_next_tick() {
        use crate::config::TelegramCfg;
        use crate::notify::TelegramChannel;
        use std::time::Duration;

        // accepts connections, never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((sock, _)) = listener.accept().await {
                held.push(sock);
            }
        });

        let chat = TelegramChannel::new(TelegramCfg {
            bot_token: "123:abc".into(),
            chat_id: "42".into(),
            api_base: format!("http://{addr}"),
        })
        .unwrap();
        let sink = Arc::new(
            NotificationSink::new(vec![Channel::Configured(Box::new(chat))]).with_deliver_timeout(Duration::from_millis(300)),
        );
        let b = Arc::new(Broadcaster::new(0));
        let (_, mut rx) = b.register();
        let p = pipeline(Box::new(FixedSignal::default()), Arc::new(DemoGateway::new()), sink, b);

        let first = tokio::time::timeout(Duration::from_secs(5), p.run_tick(&MarketSnapshot::empty("EURUSD")))
            .await
            .expect("tick stalled on the chat endpoint");
        assert!(matches!(first, TickOutcome::Executed(_)));
        assert_eq!(trade_frames(&mut rx), (1, 0));

        let second = tokio::time::timeout(Duration::from_secs(5), p.run_tick(&MarketSnapshot::empty("EURUSD")))
            .await
            .expect("second tick stalled");
        assert!(matches!(second, TickOutcome::Executed(_)));
    }

    #[tokio::test]
    async fn executed_and_skipped_ticks_are_recorded() {
        let (tx, mut rx) = mpsc::channel(16);
        let p = pipeline(Box::new(FixedSignal::default()), Arc::new(DemoGateway::new()), demo_sink(), Arc::new(Broadcaster::new(0)))
            .with_recorder(tx);
        p.run_tick(&MarketSnapshot::empty("EURUSD")).await;

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert!(matches!(first, Event::Trade(_)));
        assert!(matches!(second, Event::Tick { ref outcome, .. } if outcome == "executed"));
    }
}
