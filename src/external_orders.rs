//! External Order Generator
//!
//! Synthesizes an exogenous order stream sized by the session's current
//! throughput mode, and drains it into the order book's fill routine in
//! priority-then-FIFO order.

use crate::clock::Millis;
use crate::pool::{Pool, Pooled};
use crate::trader::Side;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ThroughputMode {
    Normal,
    Burst,
    Stress,
    Hft,
}

impl ThroughputMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "NORMAL" => Some(ThroughputMode::Normal),
            "BURST" => Some(ThroughputMode::Burst),
            "STRESS" => Some(ThroughputMode::Stress),
            "HFT" => Some(ThroughputMode::Hft),
            _ => None,
        }
    }

    pub fn target_tps(self) -> f64 {
        match self {
            ThroughputMode::Normal => 25.0,
            ThroughputMode::Burst => 150.0,
            ThroughputMode::Stress => 1_500.0,
            ThroughputMode::Hft => 15_000.0,
        }
    }

    pub fn tick_cap(self) -> u32 {
        match self {
            ThroughputMode::Normal => 1,
            ThroughputMode::Burst => 10,
            ThroughputMode::Stress => 100,
            ThroughputMode::Hft => 1_000,
        }
    }

    pub fn archetype_weights(self) -> [(Archetype, f64); 6] {
        use Archetype::*;
        match self {
            ThroughputMode::Normal => [
                (ArbitrageBot, 0.15),
                (RetailTrader, 0.55),
                (MarketMaker, 0.20),
                (MevBot, 0.03),
                (Whale, 0.05),
                (PanicSeller, 0.02),
            ],
            ThroughputMode::Burst => [
                (ArbitrageBot, 0.20),
                (RetailTrader, 0.35),
                (MarketMaker, 0.25),
                (MevBot, 0.10),
                (Whale, 0.07),
                (PanicSeller, 0.03),
            ],
            ThroughputMode::Stress => [
                (ArbitrageBot, 0.20),
                (RetailTrader, 0.20),
                (MarketMaker, 0.20),
                (MevBot, 0.20),
                (Whale, 0.10),
                (PanicSeller, 0.10),
            ],
            ThroughputMode::Hft => [
                (ArbitrageBot, 0.15),
                (RetailTrader, 0.05),
                (MarketMaker, 0.15),
                (MevBot, 0.50),
                (Whale, 0.10),
                (PanicSeller, 0.05),
            ],
        }
    }

    pub fn dominant_archetype(self) -> Archetype {
        self.archetype_weights()
            .into_iter()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap())
            .map(|(a, _)| a)
            .unwrap_or(Archetype::RetailTrader)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Archetype {
    ArbitrageBot,
    RetailTrader,
    MarketMaker,
    MevBot,
    Whale,
    PanicSeller,
}

#[derive(Debug, Clone, Copy)]
pub struct ArchetypeConfig {
    pub base_frequency: f64,
    pub size_range: (f64, f64),
    pub price_deviation: f64,
    pub priority: u8,
}

impl Archetype {
    pub fn config(self) -> ArchetypeConfig {
        match self {
            Archetype::ArbitrageBot => ArchetypeConfig {
                base_frequency: 0.5,
                size_range: (500.0, 5_000.0),
                price_deviation: 0.0005,
                priority: 4,
            },
            Archetype::RetailTrader => ArchetypeConfig {
                base_frequency: 1.0,
                size_range: (100.0, 2_000.0),
                price_deviation: 0.002,
                priority: 1,
            },
            Archetype::MarketMaker => ArchetypeConfig {
                base_frequency: 0.8,
                size_range: (1_000.0, 10_000.0),
                price_deviation: 0.0008,
                priority: 3,
            },
            Archetype::MevBot => ArchetypeConfig {
                base_frequency: 0.3,
                size_range: (2_000.0, 20_000.0),
                price_deviation: 0.0001,
                priority: 5,
            },
            Archetype::Whale => ArchetypeConfig {
                base_frequency: 0.05,
                size_range: (20_000.0, 200_000.0),
                price_deviation: 0.05,
                priority: 2,
            },
            Archetype::PanicSeller => ArchetypeConfig {
                base_frequency: 0.02,
                size_range: (5_000.0, 50_000.0),
                price_deviation: 0.10,
                priority: 3,
            },
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExternalOrder {
    pub archetype: Option<Archetype>,
    pub side: Option<Side>,
    pub limit_price: f64,
    pub quantity: f64,
    pub priority: u8,
    pub queued_at: Millis,
    pub seq: u64,
    /// The id the order pool issued for this slot, needed to release the
    /// specific failed order back to its own slot rather than an unrelated
    /// freshly acquired one.
    pool_id: u64,
}

impl Eq for ExternalOrder {}
impl PartialEq for ExternalOrder {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Ord for ExternalOrder {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap on priority, then earliest sequence number first (FIFO).
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for ExternalOrder {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct LiquidationCascadeResult {
    pub generated: usize,
    pub estimated_impact: f64,
    pub cascade_size: usize,
}

pub struct ExternalOrderGenerator {
    queue: BinaryHeap<ExternalOrder>,
    seq_counter: u64,
    order_pool: Arc<Pool<ExternalOrder>>,
}

impl ExternalOrderGenerator {
    pub fn new(order_pool: Arc<Pool<ExternalOrder>>) -> Self {
        Self {
            queue: BinaryHeap::new(),
            seq_counter: 0,
            order_pool,
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    fn next_seq(&mut self) -> u64 {
        self.seq_counter += 1;
        self.seq_counter
    }

    fn sample_archetype(weights: [(Archetype, f64); 6], rng: &mut impl Rng) -> Archetype {
        let total: f64 = weights.iter().map(|(_, w)| w).sum();
        let mut roll = rng.gen::<f64>() * total;
        for (a, w) in weights {
            if roll < w {
                return a;
            }
            roll -= w;
        }
        weights[weights.len() - 1].0
    }

    fn side_for(archetype: Archetype, mid: f64, initial_price: f64, trend: f64, rng: &mut impl Rng) -> Option<Side> {
        match archetype {
            Archetype::ArbitrageBot | Archetype::MarketMaker => {
                Some(if rng.gen_bool(0.5) { Side::Buy } else { Side::Sell })
            }
            Archetype::RetailTrader => Some(Side::from_sign(trend)),
            Archetype::Whale => {
                if mid < 0.9 * initial_price {
                    Some(Side::Buy)
                } else if mid > 1.2 * initial_price {
                    Some(Side::Sell)
                } else {
                    None
                }
            }
            Archetype::MevBot => Some(if rng.gen_bool(0.5) { Side::Buy } else { Side::Sell }),
            Archetype::PanicSeller => Some(Side::Sell),
        }
    }

    fn build_order(
        &mut self,
        archetype: Archetype,
        side: Side,
        mid: f64,
        now_ms: Millis,
        rng: &mut impl Rng,
    ) -> ExternalOrder {
        let cfg = archetype.config();
        let normal = Normal::new(0.0, cfg.price_deviation).unwrap();
        let magnitude = normal.sample(rng).abs();
        let limit_price = match side {
            Side::Buy => mid * (1.0 + magnitude),
            Side::Sell => mid * (1.0 - magnitude),
        };
        let notional = rng.gen_range(cfg.size_range.0..=cfg.size_range.1);
        let quantity = notional / limit_price.max(1e-9);
        let seq = self.next_seq();
        self.acquire_order(ExternalOrder {
            archetype: Some(archetype),
            side: Some(side),
            limit_price,
            quantity,
            priority: cfg.priority,
            queued_at: now_ms,
            seq,
            pool_id: 0,
        })
    }

    /// Stamps a freshly constructed order with the id of a pool slot it is
    /// now backed by, fully overwriting whatever stale value previously
    /// occupied that slot.
    fn acquire_order(&self, order: ExternalOrder) -> ExternalOrder {
        let mut pooled = self.order_pool.acquire();
        pooled.value = order;
        pooled.value.pool_id = pooled.id;
        pooled.value
    }

    /// §4.6 tick budget: `ceil(target_tps * dt_ms / 1000)` capped by mode.
    pub fn generate_for_tick(
        &mut self,
        mode: ThroughputMode,
        mid: f64,
        initial_price: f64,
        trend: f64,
        dt_ms: i64,
        now_ms: Millis,
        rng: &mut impl Rng,
    ) {
        let raw = (mode.target_tps() * dt_ms as f64 / 1000.0).ceil() as u32;
        let budget = raw.min(mode.tick_cap());
        let weights = mode.archetype_weights();

        for _ in 0..budget {
            let archetype = Self::sample_archetype(weights, rng);
            let Some(side) = Self::side_for(archetype, mid, initial_price, trend, rng) else {
                continue;
            };
            let order = self.build_order(archetype, side, mid, now_ms, rng);
            self.queue.push(order);
        }
    }

    /// Drain the queue in priority-then-FIFO order, up to the mode cap,
    /// handing each order to the order-book fill routine.
    pub fn drain_and_fill(
        &mut self,
        mode: ThroughputMode,
        book: &mut crate::orderbook::OrderBook,
    ) -> Vec<(ExternalOrder, Option<crate::orderbook::Fill>)> {
        let cap = mode.tick_cap() as usize;
        let mut results = Vec::new();
        for _ in 0..cap {
            let Some(order) = self.queue.pop() else { break };
            let side = order.side.unwrap_or(Side::Buy);
            let fill = book.fill(side, order.limit_price, order.quantity);
            if fill.is_none() {
                self.order_pool.release(Pooled {
                    id: order.pool_id,
                    value: order.clone(),
                });
            }
            results.push((order, fill));
        }
        results
    }

    /// STRESS/HFT-only burst of descending-price sell orders.
    pub fn trigger_liquidation_cascade(
        &mut self,
        mode: ThroughputMode,
        mid: f64,
        market_cap: f64,
        now_ms: Millis,
        rng: &mut impl Rng,
    ) -> Option<LiquidationCascadeResult> {
        if !matches!(mode, ThroughputMode::Stress | ThroughputMode::Hft) {
            return None;
        }
        let size = rng.gen_range(10..=30usize);
        let mut total_notional = 0.0;
        for step in 0..size {
            let discount = 0.01 * (step as f64 + 1.0);
            let price = mid * (1.0 - discount);
            let notional = rng.gen_range(5_000.0..=50_000.0);
            let quantity = notional / price.max(1e-9);
            total_notional += notional;
            let seq = self.next_seq();
            let order = self.acquire_order(ExternalOrder {
                archetype: Some(Archetype::PanicSeller),
                side: Some(Side::Sell),
                limit_price: price,
                quantity,
                priority: 3,
                queued_at: now_ms + step as i64,
                seq,
                pool_id: 0,
            });
            self.queue.push(order);
        }
        Some(LiquidationCascadeResult {
            generated: size,
            estimated_impact: if market_cap > 0.0 { total_notional / market_cap } else { 0.0 },
            cascade_size: size,
        })
    }

    /// MEV front-running: on a large incoming order, enqueue a
    /// co-directional follower priced tighter to the mid.
    pub fn maybe_front_run(&mut self, prey_side: Side, prey_notional: f64, mid: f64, now_ms: Millis) {
        const LARGE_ORDER_THRESHOLD: f64 = 10_000.0;
        if prey_notional <= LARGE_ORDER_THRESHOLD {
            return;
        }
        let magnitude = 0.001;
        let limit_price = match prey_side {
            Side::Buy => mid * (1.0 + magnitude),
            Side::Sell => mid * (1.0 - magnitude),
        };
        let notional = prey_notional * 0.30;
        let quantity = notional / limit_price.max(1e-9);
        let seq = self.next_seq();
        let order = self.acquire_order(ExternalOrder {
            archetype: Some(Archetype::MevBot),
            side: Some(prey_side),
            limit_price,
            quantity,
            priority: 5,
            queued_at: now_ms,
            seq,
            pool_id: 0,
        });
        self.queue.push(order);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn tick_cap_is_enforced() {
        let pool = Arc::new(Pool::new("ext_orders", 100));
        let mut gen = ExternalOrderGenerator::new(pool);
        let mut rng = StdRng::seed_from_u64(3);
        gen.generate_for_tick(ThroughputMode::Hft, 10.0, 10.0, 0.0, 50, 0, &mut rng);
        assert!(gen.queue_depth() as u32 <= ThroughputMode::Hft.tick_cap());
    }

    #[test]
    fn liquidation_cascade_requires_stress_or_hft() {
        let pool = Arc::new(Pool::new("ext_orders", 100));
        let mut gen = ExternalOrderGenerator::new(pool);
        let mut rng = StdRng::seed_from_u64(4);
        assert!(gen
            .trigger_liquidation_cascade(ThroughputMode::Normal, 10.0, 1_000_000.0, 0, &mut rng)
            .is_none());
        let result = gen.trigger_liquidation_cascade(ThroughputMode::Stress, 10.0, 1_000_000.0, 0, &mut rng);
        assert!(result.is_some());
        let result = result.unwrap();
        assert!((10..=30).contains(&result.cascade_size));
    }

    #[test]
    fn priority_orders_drain_before_lower_priority() {
        let mut queue = BinaryHeap::new();
        queue.push(ExternalOrder {
            archetype: Some(Archetype::RetailTrader),
            side: Some(Side::Buy),
            limit_price: 10.0,
            quantity: 1.0,
            priority: 1,
            queued_at: 0,
            seq: 1,
            pool_id: 0,
        });
        queue.push(ExternalOrder {
            archetype: Some(Archetype::MevBot),
            side: Some(Side::Buy),
            limit_price: 10.0,
            quantity: 1.0,
            priority: 5,
            queued_at: 0,
            seq: 2,
            pool_id: 0,
        });
        let first = queue.pop().unwrap();
        assert_eq!(first.priority, 5);
    }
}
