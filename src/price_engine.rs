//! Price and Market Engine
//!
//! Advances the live price once per tick from a base volatility, a trend
//! component (scenario bias, rolling-volume imbalance, regime, mean
//! reversion), and a fat-tailed random component.

use crate::scenario::Bias;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regime {
    Bullish,
    Bearish,
    Sideways,
}

/// `σ_base` decreases with price level.
pub fn base_volatility(price: f64) -> f64 {
    if price < 5.0 {
        0.025
    } else if price < 10.0 {
        0.020
    } else if price < 20.0 {
        0.018
    } else if price < 35.0 {
        0.015
    } else {
        0.012
    }
}

/// Logarithmic scaling of volatility by target throughput.
fn throughput_vol_factor(target_tps: f64) -> f64 {
    1.0 + (target_tps.max(1.0).ln() / 10_f64.ln()) * 0.15
}

pub struct PriceEngine {
    pub price: f64,
    pub regime: Regime,
    pub realized_vol: f64,
    recent_prices: VecDeque<f64>,
}

impl PriceEngine {
    pub fn new(initial_price: f64) -> Self {
        let mut recent_prices = VecDeque::with_capacity(32);
        recent_prices.push_back(initial_price);
        Self {
            price: initial_price,
            regime: Regime::Sideways,
            realized_vol: 0.0,
            recent_prices,
        }
    }

    fn imbalance(recent_trades: &[(crate::trader::Side, f64)]) -> f64 {
        // `recent_trades` is newest-first (Session::push_trade uses push_front),
        // so the most recent 100 trades are the front slice, not the tail.
        let window = &recent_trades[..100.min(recent_trades.len())];
        let buy: f64 = window
            .iter()
            .filter(|(s, _)| *s == crate::trader::Side::Buy)
            .map(|(_, n)| n)
            .sum();
        let sell: f64 = window
            .iter()
            .filter(|(s, _)| *s == crate::trader::Side::Sell)
            .map(|(_, n)| n)
            .sum();
        let total = buy + sell;
        if total <= 0.0 {
            0.0
        } else {
            ((buy - sell) / total).clamp(-1.0, 1.0)
        }
    }

    /// One tick of price advancement. `bar_closes` is the recent sequence
    /// of finalized-candle closes (oldest first), used for the 15-bar
    /// mean-reversion term.
    pub fn tick(
        &mut self,
        recent_trades: &[(crate::trader::Side, f64)],
        throughput_target_tps: f64,
        interval_vol_multiplier: f64,
        bias: Bias,
        bar_closes: &[f64],
        rng: &mut impl Rng,
    ) -> f64 {
        let imbalance = Self::imbalance(recent_trades);
        let mut sigma = base_volatility(self.price) * throughput_vol_factor(throughput_target_tps)
            * interval_vol_multiplier
            * bias.vol_multiplier;
        if imbalance.abs() > 0.2 {
            sigma *= 2.0;
        }

        let trend = if let Some(t) = bias.trend_override {
            t
        } else {
            let mut t = imbalance * 0.001;
            t += match self.regime {
                Regime::Bullish => 0.0002,
                Regime::Bearish => -0.0002,
                Regime::Sideways => 0.0,
            };
            if !bar_closes.is_empty() {
                let window = &bar_closes[bar_closes.len().saturating_sub(15)..];
                let avg15: f64 = window.iter().sum::<f64>() / window.len() as f64;
                if avg15 > 0.0 {
                    let deviation = (self.price - avg15) / avg15;
                    if deviation.abs() > 0.03 {
                        t -= deviation * 0.002;
                    }
                }
            }
            t
        };

        let tail_roll: f64 = rng.gen();
        let tail_sigma = if tail_roll < 0.05 {
            sigma * 4.0
        } else if tail_roll < 0.20 {
            sigma * 2.0
        } else {
            sigma
        };
        let normal = Normal::new(0.0, tail_sigma.max(1e-9)).expect("finite sigma");
        let random = normal.sample(rng);
        let microstructure = rng.gen_range(-0.0001..=0.0001);

        let new_price = (self.price * (1.0 + trend + random + microstructure)).max(1e-9);
        self.price = new_price;

        self.recent_prices.push_back(new_price);
        if self.recent_prices.len() > 32 {
            self.recent_prices.pop_front();
        }
        self.update_regime();
        new_price
    }

    fn update_regime(&mut self) {
        let n = self.recent_prices.len();
        if n < 2 {
            return;
        }
        let window = 5.min(n - 1);
        let past = self.recent_prices[n - 1 - window];
        let ret = if past > 0.0 { (self.price - past) / past } else { 0.0 };

        let threshold = if self.price < 1.0 { 0.003 } else { 0.01 };
        self.regime = if ret > threshold {
            Regime::Bullish
        } else if ret < -threshold {
            Regime::Bearish
        } else {
            Regime::Sideways
        };

        let returns: Vec<f64> = self
            .recent_prices
            .iter()
            .zip(self.recent_prices.iter().skip(1))
            .filter(|(a, _)| **a > 0.0)
            .map(|(a, b)| (b - a) / a)
            .collect();
        if returns.len() >= 2 {
            let mean = returns.iter().sum::<f64>() / returns.len() as f64;
            let variance =
                returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
            self.realized_vol = 1.2 * variance.sqrt();
        }
    }
}

/// Price category for the random initial-price sampler.
#[derive(Debug, Clone, Copy)]
pub enum PriceCategory {
    Micro,
    Small,
    Mid,
    Large,
    Mega,
}

impl PriceCategory {
    fn range(self) -> (f64, f64) {
        match self {
            PriceCategory::Micro => (0.000_001, 0.01),
            PriceCategory::Small => (0.01, 1.0),
            PriceCategory::Mid => (1.0, 10.0),
            PriceCategory::Large => (10.0, 100.0),
            PriceCategory::Mega => (100.0, 10_000.0),
        }
    }

    fn round_to(self, price: f64) -> f64 {
        let decimals = match self {
            PriceCategory::Micro => 8,
            PriceCategory::Small => 6,
            PriceCategory::Mid | PriceCategory::Large => 4,
            PriceCategory::Mega => 2,
        };
        let factor = 10f64.powi(decimals);
        (price * factor).round() / factor
    }
}

/// Weighted category sampler: micro 25%, small 30%, mid 25%, large 15%,
/// mega 5%, then a log-uniform draw within the category range.
pub fn sample_initial_price(rng: &mut impl Rng) -> f64 {
    let roll: f64 = rng.gen();
    let category = if roll < 0.25 {
        PriceCategory::Micro
    } else if roll < 0.55 {
        PriceCategory::Small
    } else if roll < 0.80 {
        PriceCategory::Mid
    } else if roll < 0.95 {
        PriceCategory::Large
    } else {
        PriceCategory::Mega
    };
    let (lo, hi) = category.range();
    let log_lo = lo.ln();
    let log_hi = hi.ln();
    let sampled = (log_lo + rng.gen_range(0.0..=(log_hi - log_lo))).exp();
    category.round_to(sampled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn base_volatility_decreases_with_price() {
        assert!(base_volatility(1.0) > base_volatility(50.0));
    }

    #[test]
    fn tick_keeps_price_positive() {
        let mut engine = PriceEngine::new(0.0001);
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            engine.tick(&[], 25.0, 1.0, Bias::default(), &[], &mut rng);
            assert!(engine.price > 0.0);
        }
    }

    #[test]
    fn scenario_trend_overrides_default_trend() {
        let mut engine = PriceEngine::new(10.0);
        let mut rng = StdRng::seed_from_u64(7);
        let bias = Bias {
            trend_override: Some(-0.5),
            vol_multiplier: 0.0001,
        };
        let next = engine.tick(&[], 25.0, 1.0, bias, &[], &mut rng);
        assert!(next < 10.0);
    }

    #[test]
    fn sample_initial_price_is_positive() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..50 {
            assert!(sample_initial_price(&mut rng) > 0.0);
        }
    }
}
