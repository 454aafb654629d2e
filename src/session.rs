//! Session Data Model
//!
//! A `Session` owns every collection named in the data model: traders,
//! positions, closed positions, recent trades, ranking, price history
//! bar sequence (via the candle-aggregator registry), order book,
//! throughput metrics. It is mutated exclusively by the tick loop while
//! `running ∧ ¬paused`, and by lifecycle operations under the session's
//! mutex otherwise.

use crate::candle::CandleAggregator;
use crate::clock::{Millis, SimClock};
use crate::external_orders::{ExternalOrderGenerator, ThroughputMode};
use crate::orderbook::{OrderBook, OrderBookConfig};
use crate::pool::Pool;
use crate::price_engine::PriceEngine;
use crate::scenario::ScenarioBias;
use crate::trader::{Position, Trade, TraderEngine, TraderProfile};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, never started (or returned here by reset).
    Idle,
    Running,
    Paused,
    Stopped,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub initial_price: f64,
    pub liquidity_seed: f64,
    pub speed: u32,
    pub volatility_multiplier: f64,
    pub duration_minutes: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initial_price: 1.0,
            liquidity_seed: 1_000_000.0,
            speed: 1,
            volatility_multiplier: 1.0,
            duration_minutes: 60,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThroughputMetrics {
    pub actual_tps: f64,
    pub trades_since_last_sample: u64,
    pub last_sampled_at_ms: Millis,
    pub last_broadcast_at_ms: Millis,
    pub last_broadcast_hash: u64,
}

pub struct Session {
    pub id: Uuid,
    pub config: SessionConfig,
    pub state: SessionState,
    pub clock: SimClock,

    pub price_engine: PriceEngine,
    pub order_book: OrderBook,
    pub throughput_mode: ThroughputMode,
    pub external_orders: ExternalOrderGenerator,
    pub trader_engine: TraderEngine,

    pub profiles: HashMap<String, TraderProfile>,
    pub positions: HashMap<String, Position>,
    pub closed_positions: VecDeque<Position>,
    pub recent_trades: VecDeque<Trade>,
    pub ranking: Vec<String>,

    pub candles: Arc<AsyncMutex<CandleAggregator>>,
    pub scenario: Option<Box<dyn ScenarioBias>>,
    pub scenario_started_ms: Option<Millis>,
    pub scenario_duration_ms: Option<i64>,

    pub total_trades_processed: u64,
    pub next_trade_id: u64,
    pub metrics: ThroughputMetrics,

    pub rng: StdRng,
}

#[allow(clippy::too_many_arguments)]
impl Session {
    /// Assembles a freshly created session around a sampled or caller-supplied
    /// price. `profiles` is pre-derived by the caller from the trader-data
    /// provider's population (outside the simulation core per §1).
    pub fn new(
        id: Uuid,
        config: SessionConfig,
        profiles: HashMap<String, TraderProfile>,
        candles: Arc<AsyncMutex<CandleAggregator>>,
        order_pool: Arc<Pool<crate::external_orders::ExternalOrder>>,
        order_book_cfg: OrderBookConfig,
    ) -> Self {
        let order_book = OrderBook::new(config.initial_price, config.liquidity_seed, order_book_cfg);
        let ranking = crate::trader::rank_traders(&profiles);
        Self {
            id,
            state: SessionState::Idle,
            clock: SimClock::new(0, config.duration_minutes),
            price_engine: PriceEngine::new(config.initial_price),
            order_book,
            throughput_mode: ThroughputMode::Normal,
            external_orders: ExternalOrderGenerator::new(order_pool),
            trader_engine: TraderEngine::new(),
            profiles,
            positions: HashMap::new(),
            closed_positions: VecDeque::new(),
            recent_trades: VecDeque::new(),
            ranking,
            candles,
            scenario: None,
            scenario_started_ms: None,
            scenario_duration_ms: None,
            total_trades_processed: 0,
            next_trade_id: 0,
            metrics: ThroughputMetrics::default(),
            rng: StdRng::from_entropy(),
            config,
        }
    }
}

impl Session {
    pub fn recent_trade_notionals(&self) -> Vec<(crate::trader::Side, f64)> {
        self.recent_trades
            .iter()
            .map(|t| (t.action(), t.notional))
            .collect()
    }

    pub fn recent_trade_prices(&self) -> Vec<f64> {
        self.recent_trades.iter().map(|t| t.price).collect()
    }

    pub fn push_trade(&mut self, trade: Trade, cap: usize) {
        self.total_trades_processed += 1;
        if self.recent_trades.len() >= cap {
            self.recent_trades.pop_back(); // evict oldest (list is newest-first)
        }
        self.recent_trades.push_front(trade);
    }
}
