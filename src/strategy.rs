// ===============================
// src/strategy.rs
// ===============================
//
// Signal generators. Strategy logic itself is a stub:
// 1) Fixed  (default) -> always the same EURUSD buy, deterministic
// 2) Random           -> ~30% of ticks produce a random symbol/side/volume
//
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::config::StrategyMode;
use crate::domain::{MarketSnapshot, Side, Signal};

/// Produces zero or one signal per tick from the latest snapshot.
pub trait SignalGenerator: Send {
    fn name(&self) -> &'static str;
    fn generate(&mut self, snapshot: &MarketSnapshot) -> Option<Signal>;
}

pub fn build(mode: &StrategyMode, symbols: &[String]) -> Box<dyn SignalGenerator> {
    match mode {
        StrategyMode::Fixed => Box::new(FixedSignal::default()),
        StrategyMode::Random => Box::new(RandomSignal::new(symbols.to_vec(), StdRng::from_entropy())),
    }
}

#[derive(Debug, Clone)]
pub struct FixedSignal {
    pub signal: Signal,
}

impl Default for FixedSignal {
    fn default() -> Self {
        Self {
            signal: Signal {
                symbol: "EURUSD".into(),
                side: Side::Buy,
                volume: 0.01,
                stop_loss_pips: Some(30),
                take_profit_pips: Some(60),
            },
        }
    }
}

impl SignalGenerator for FixedSignal {
    fn name(&self) -> &'static str { "fixed" }
    fn generate(&mut self, _snapshot: &MarketSnapshot) -> Option<Signal> { Some(self.signal.clone()) }
}

pub struct RandomSignal {
    symbols: Vec<String>,
    rng: StdRng,
    chance: f64,
}

impl RandomSignal {
    pub fn new(symbols: Vec<String>, rng: StdRng) -> Self {
        Self { symbols, rng, chance: 0.3 }
    }

    pub fn with_chance(mut self, chance: f64) -> Self {
        self.chance = chance.clamp(0.0, 1.0);
        self
    }
}

impl SignalGenerator for RandomSignal {
    fn name(&self) -> &'static str { "random" }

    fn generate(&mut self, snapshot: &MarketSnapshot) -> Option<Signal> {
        if !self.rng.gen_bool(self.chance) {
            return None;
        }
        let symbol = if self.symbols.is_empty() {
            snapshot.symbol.clone()
        } else {
            self.symbols[self.rng.gen_range(0..self.symbols.len())].clone()
        };
        let side = if self.rng.gen_bool(0.5) { Side::Buy } else { Side::Sell };
        // 0.01 .. 0.10 lots, two decimals
        let volume = (self.rng.gen_range(1..=10) as f64) / 100.0;
        Some(Signal {
            symbol,
            side,
            volume,
            stop_loss_pips: Some(self.rng.gen_range(20..50)),
            take_profit_pips: Some(self.rng.gen_range(40..90)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_signal_is_deterministic() {
        let mut g = FixedSignal::default();
        let snap = MarketSnapshot::empty("EURUSD");
        let a = g.generate(&snap).unwrap();
        let b = g.generate(&snap).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.symbol, "EURUSD");
        assert_eq!(a.stop_loss_pips, Some(30));
        assert_eq!(a.take_profit_pips, Some(60));
    }

    #[test]
    fn random_signal_respects_bounds() {
        let symbols = vec!["GBPUSD".to_string(), "USDJPY".to_string()];
        let mut g = RandomSignal::new(symbols.clone(), StdRng::seed_from_u64(7)).with_chance(1.0);
        let snap = MarketSnapshot::empty("EURUSD");
        for _ in 0..50 {
            let s = g.generate(&snap).unwrap();
            assert!(symbols.contains(&s.symbol));
            assert!(s.volume >= 0.01 && s.volume <= 0.10);
        }
    }

    #[test]
    fn random_signal_can_stay_silent() {
        let mut g = RandomSignal::new(vec![], StdRng::seed_from_u64(1)).with_chance(0.0);
        assert!(g.generate(&MarketSnapshot::empty("EURUSD")).is_none());
    }
}
