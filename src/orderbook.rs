//! Order Book Manager
//!
//! Maintains a two-sided depth-of-book centered on the live price, with
//! pressure-driven rebalancing and a deterministic external-order fill
//! routine. Level price ordering follows the same `is_bid`-dependent `Ord`
//! shape used for L2 books elsewhere in this codebase, but levels here are
//! fully recomputed from the pricing formulas each tick rather than
//! patched from exchange deltas.

use crate::clock::Millis;
use crate::trader::Side;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Level {
    pub price: f64,
    pub quantity: f64,
}

#[derive(Debug, Clone)]
pub struct OrderBookConfig {
    pub depth_levels: usize,
    pub default_spread: f64,
    pub min_qty: f64,
}

impl Default for OrderBookConfig {
    fn default() -> Self {
        Self {
            depth_levels: 20,
            default_spread: 0.002,
            min_qty: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderBook {
    /// Price descending: bids[0] is the best bid.
    pub bids: Vec<Level>,
    /// Price ascending: asks[0] is the best ask.
    pub asks: Vec<Level>,
    pub last_mid: f64,
    pub stamp_ms: Millis,
    cfg: OrderBookConfig,
}

/// Result of walking the opposing side for an external order.
#[derive(Debug, Clone, Copy)]
pub struct Fill {
    pub avg_price: f64,
    pub filled_quantity: f64,
    pub impact: f64,
}

impl OrderBook {
    pub fn new(mid: f64, liquidity: f64, cfg: OrderBookConfig) -> Self {
        let bids = Self::build_side(mid, liquidity, &cfg, true);
        let asks = Self::build_side(mid, liquidity, &cfg, false);
        Self {
            bids,
            asks,
            last_mid: mid,
            stamp_ms: 0,
            cfg,
        }
    }

    fn offset_frac(i: usize, n: usize, spread: f64) -> f64 {
        spread / 2.0 + (spread / n as f64) * (i as f64 + 1.0)
    }

    fn build_side(mid: f64, liquidity: f64, cfg: &OrderBookConfig, is_bid: bool) -> Vec<Level> {
        let n = cfg.depth_levels;
        (0..n)
            .map(|i| {
                let offset = Self::offset_frac(i, n, cfg.default_spread);
                let price = if is_bid { mid * (1.0 - offset) } else { mid * (1.0 + offset) };
                let qty = (liquidity * 0.1 / n as f64) * (-(i as f64) * 0.1).exp();
                Level {
                    price,
                    quantity: qty.max(cfg.min_qty),
                }
            })
            .collect()
    }

    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }

    pub fn spread(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some(a - b),
            _ => None,
        }
    }

    /// §4.3 per-tick update: recenter or apply pressure, refill depth,
    /// remove crossed levels, then enforce minimum spread.
    pub fn update(&mut self, mid: f64, recent_trades: &[(Side, f64)], now_ms: Millis, liquidity: f64) {
        let drift = if self.last_mid > 0.0 {
            (mid - self.last_mid).abs() / self.last_mid
        } else {
            0.0
        };

        if drift >= 0.01 {
            self.recenter(mid, liquidity);
        } else {
            self.apply_pressure(recent_trades);
        }

        self.refill(mid);
        self.decross();
        self.enforce_min_spread(mid);
        self.last_mid = mid;
        self.stamp_ms = now_ms;
    }

    fn recenter(&mut self, mid: f64, liquidity: f64) {
        let n = self.cfg.depth_levels.max(self.bids.len()).max(self.asks.len());
        for (i, level) in self.bids.iter_mut().enumerate() {
            let offset = Self::offset_frac(i, n, self.cfg.default_spread);
            level.price = mid * (1.0 - offset);
        }
        for (i, level) in self.asks.iter_mut().enumerate() {
            let offset = Self::offset_frac(i, n, self.cfg.default_spread);
            level.price = mid * (1.0 + offset);
        }
        let _ = liquidity; // decay profile (relative quantities) is preserved as-is
    }

    fn apply_pressure(&mut self, recent_trades: &[(Side, f64)]) {
        // `recent_trades` is newest-first, so the last 10 trades are the
        // front slice, not the tail.
        let window = &recent_trades[..10.min(recent_trades.len())];
        if window.is_empty() {
            return;
        }
        let buy_notional: f64 = window.iter().filter(|(s, _)| *s == Side::Buy).map(|(_, n)| n).sum();
        let sell_notional: f64 = window.iter().filter(|(s, _)| *s == Side::Sell).map(|(_, n)| n).sum();
        let total = buy_notional + sell_notional;
        if total <= 0.0 {
            return;
        }
        let pressure = ((buy_notional - sell_notional) / total).clamp(-1.0, 1.0);
        if pressure == 0.0 {
            return;
        }
        let (strong, weak) = if pressure > 0.0 {
            (&mut self.bids, &mut self.asks)
        } else {
            (&mut self.asks, &mut self.bids)
        };
        let p = pressure.abs();
        for l in strong.iter_mut() {
            l.quantity *= 1.0 + p * 0.1;
        }
        for l in weak.iter_mut() {
            l.quantity *= (1.0 - p * 0.2).max(0.0);
        }
    }

    fn refill(&mut self, mid: f64) {
        self.bids.retain(|l| l.quantity >= self.cfg.min_qty);
        self.asks.retain(|l| l.quantity >= self.cfg.min_qty);

        while self.bids.len() < self.cfg.depth_levels {
            let i = self.bids.len();
            let worst = self.bids.last().map(|l| l.price).unwrap_or(mid * (1.0 - self.cfg.default_spread));
            let price = worst * (1.0 - 0.001 * (i as f64 + 1.0));
            self.bids.push(Level { price, quantity: self.cfg.min_qty });
        }
        while self.asks.len() < self.cfg.depth_levels {
            let i = self.asks.len();
            let worst = self.asks.last().map(|l| l.price).unwrap_or(mid * (1.0 + self.cfg.default_spread));
            let price = worst * (1.0 + 0.001 * (i as f64 + 1.0));
            self.asks.push(Level { price, quantity: self.cfg.min_qty });
        }

        self.bids.sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap());
        self.asks.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap());
    }

    fn decross(&mut self) {
        if let Some(best_ask) = self.best_ask() {
            self.bids.retain(|l| l.price < best_ask);
        }
        if let Some(best_bid) = self.best_bid() {
            self.asks.retain(|l| l.price > best_bid);
        }
    }

    fn enforce_min_spread(&mut self, mid: f64) {
        let Some(bid) = self.best_bid() else { return };
        let Some(ask) = self.best_ask() else { return };
        let min_spread = mid * self.cfg.default_spread;
        let deficit = min_spread - (ask - bid);
        if deficit > 0.0 {
            let half = deficit / 2.0;
            for l in self.bids.iter_mut() {
                l.price -= half;
            }
            for l in self.asks.iter_mut() {
                l.price += half;
            }
        }
    }

    /// Walk the opposing side for an incoming external order. Returns
    /// `None` if nothing fills (limit price never crosses).
    pub fn fill(&mut self, action: Side, limit_price: f64, quantity: f64) -> Option<Fill> {
        let side = match action {
            Side::Buy => &mut self.asks,
            Side::Sell => &mut self.bids,
        };
        let opposing_depth: f64 = side.iter().map(|l| l.quantity).sum();
        let mut remaining = quantity;
        let mut notional = 0.0;
        let mut filled = 0.0;

        for level in side.iter_mut() {
            if remaining <= 0.0 {
                break;
            }
            let crosses = match action {
                Side::Buy => level.price <= limit_price,
                Side::Sell => level.price >= limit_price,
            };
            if !crosses {
                break;
            }
            let take = remaining.min(level.quantity);
            if take <= 0.0 {
                continue;
            }
            level.quantity -= take;
            notional += take * level.price;
            filled += take;
            remaining -= take;
        }

        if filled <= 0.0 {
            return None;
        }

        let avg_price = notional / filled;
        let raw_impact = notional / (opposing_depth + notional);
        let impact = raw_impact.clamp(0.0, 0.08) * action.sign();

        Some(Fill {
            avg_price,
            filled_quantity: filled,
            impact,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_yields_depth_levels_both_sides() {
        let book = OrderBook::new(10.0, 100_000.0, OrderBookConfig::default());
        assert_eq!(book.bids.len(), 20);
        assert_eq!(book.asks.len(), 20);
        assert!(book.best_bid().unwrap() < book.best_ask().unwrap());
    }

    #[test]
    fn quantities_decay_with_distance() {
        let book = OrderBook::new(10.0, 100_000.0, OrderBookConfig::default());
        for w in book.bids.windows(2) {
            assert!(w[0].quantity >= w[1].quantity - 1e-9);
        }
    }

    #[test]
    fn recenter_keeps_spread_invariant() {
        let mut book = OrderBook::new(10.0, 100_000.0, OrderBookConfig::default());
        book.update(10.3, &[], 1_000, 100_000.0);
        assert!(book.best_bid().unwrap() < book.best_ask().unwrap());
        let mid = 10.3;
        assert!(book.spread().unwrap() >= mid * book.cfg.default_spread - 1e-6);
    }

    #[test]
    fn fill_consumes_levels_and_emits_impact() {
        let mut book = OrderBook::new(10.0, 100_000.0, OrderBookConfig::default());
        let best_ask = book.best_ask().unwrap();
        let fill = book.fill(Side::Buy, best_ask * 1.01, 50.0).unwrap();
        assert!(fill.filled_quantity > 0.0);
        assert!(fill.impact >= 0.0 && fill.impact <= 0.08);
    }

    #[test]
    fn fill_returns_none_when_limit_never_crosses() {
        let mut book = OrderBook::new(10.0, 100_000.0, OrderBookConfig::default());
        let best_ask = book.best_ask().unwrap();
        let fill = book.fill(Side::Buy, best_ask * 0.5, 10.0);
        assert!(fill.is_none());
    }
}
