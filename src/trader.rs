//! Trader Engine
//!
//! Produces per-tick decisions for each agent and materializes them as
//! trades and position mutations. `TraderTickCtx` borrows the session's
//! owned collections for the duration of one tick, the same shape as a
//! pipeline context threaded through discrete processing stages.

use crate::clock::Millis;
use crate::pool::{Pool, Pooled};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

pub const MIN_CLOSE_QUANTITY: f64 = 10.0;
pub const DEDUP_CACHE_CAP: usize = 20_000;
pub const ACQUIRE_RELEASE_DRIFT_THRESHOLD: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn sign(self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }

    pub fn from_sign(sign: f64) -> Side {
        if sign >= 0.0 {
            Side::Buy
        } else {
            Side::Sell
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskClass {
    Conservative,
    Moderate,
    Aggressive,
}

impl RiskClass {
    fn base_pct(self) -> f64 {
        match self {
            RiskClass::Aggressive => 0.30,
            RiskClass::Moderate => 0.20,
            RiskClass::Conservative => 0.10,
        }
    }

    fn buy_bias(self) -> f64 {
        match self {
            RiskClass::Aggressive => 0.10,
            RiskClass::Moderate => 0.0,
            RiskClass::Conservative => -0.10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Scalper,
    Swing,
    Momentum,
    Contrarian,
}

#[derive(Debug, Clone)]
pub struct TraderProfile {
    pub wallet_id: String,
    pub lifetime_volume: f64,
    pub trade_count: u64,
    pub net_pnl: f64,
    pub win_rate: f64,
    pub risk_class: RiskClass,
    pub strategy: Strategy,
    pub entry_threshold: f64,
    pub exit_profit_threshold: f64,
    pub exit_loss_threshold: f64,
    pub holding_period_min_ms: i64,
    pub holding_period_max_ms: i64,
    pub trading_frequency: f64,
    pub sentiment_sensitivity: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
}

/// A Position record as kept in the object pool. `Pool::acquire()` may hand
/// back a previously-released, non-zeroed slot, so `materialize_position`
/// resets every numeric field itself before treating an acquired slot as a
/// fresh position.
#[derive(Debug, Clone, Default)]
pub struct Position {
    pub trader_id: String,
    pub entry_price: f64,
    pub quantity: f64,
    pub entry_clock: Millis,
    pub pnl: f64,
    pub pnl_fraction: f64,
    /// The id the position pool issued for this slot, kept so a position
    /// that survives many ticks can still be released correctly when it
    /// finally closes.
    pool_id: u64,
}

impl Position {
    /// The id the position pool issued for this slot; needed by callers that
    /// release a position outside the normal tick-time acquire/release path
    /// (session reset, session delete).
    pub fn pool_id(&self) -> u64 {
        self.pool_id
    }

    pub fn side(&self) -> Side {
        Side::from_sign(self.quantity)
    }

    pub fn mark_to_market(&mut self, mark: f64) {
        let sign = self.quantity.signum();
        let qty_abs = self.quantity.abs();
        self.pnl = sign * qty_abs * (mark - self.entry_price);
        self.pnl_fraction = if qty_abs > 0.0 && self.entry_price > 0.0 {
            self.pnl / (qty_abs * self.entry_price)
        } else {
            0.0
        };
    }
}

#[derive(Debug, Clone, Default)]
pub struct Trade {
    pub id: u64,
    pub clock: Millis,
    pub trader_id: String,
    pub action: Option<Side>,
    pub price: f64,
    pub quantity: f64,
    pub notional: f64,
    pub impact: f64,
}

impl Trade {
    pub fn action(&self) -> Side {
        self.action.unwrap_or(Side::Buy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityMode {
    MaximumNormal,
    MaximumMedium,
    MaximumFast,
}

impl ActivityMode {
    pub fn from_speed(speed: u32) -> Self {
        if speed <= 5 {
            ActivityMode::MaximumNormal
        } else if speed <= 15 {
            ActivityMode::MaximumMedium
        } else {
            ActivityMode::MaximumFast
        }
    }

    pub fn tick_trade_budget(self) -> u32 {
        match self {
            ActivityMode::MaximumNormal => 100,
            ActivityMode::MaximumMedium => 200,
            ActivityMode::MaximumFast => 400,
        }
    }

    pub fn participation_pct(self) -> f64 {
        match self {
            ActivityMode::MaximumNormal => 0.8,
            ActivityMode::MaximumMedium => 0.9,
            ActivityMode::MaximumFast => 1.0,
        }
    }

    pub fn turnover_pct(self) -> f64 {
        match self {
            ActivityMode::MaximumNormal => 0.4,
            ActivityMode::MaximumMedium => 0.6,
            ActivityMode::MaximumFast => 0.8,
        }
    }
}

/// Decision rule per agent: either close the existing position (opposite
/// side), or open a fresh one on the side chosen by strategy.
pub fn decide_close(rng: &mut impl Rng) -> bool {
    rng.gen::<f64>() < 0.4
}

pub fn decide_side(
    profile: &TraderProfile,
    trend: f64,
    realized_vol: f64,
    rng: &mut impl Rng,
) -> Side {
    match profile.strategy {
        Strategy::Momentum => {
            if profile.win_rate > 0.5 {
                Side::from_sign(trend)
            } else {
                weighted_side(0.7, rng)
            }
        }
        Strategy::Contrarian => {
            if realized_vol > 0.02 {
                Side::from_sign(-trend)
            } else {
                weighted_side(0.6, rng)
            }
        }
        Strategy::Scalper => {
            if realized_vol > 0.005 {
                weighted_side(0.5, rng)
            } else {
                Side::Buy
            }
        }
        Strategy::Swing => weighted_side(0.5 + profile.risk_class.buy_bias(), rng),
    }
}

fn weighted_side(buy_probability: f64, rng: &mut impl Rng) -> Side {
    if rng.gen::<f64>() < buy_probability {
        Side::Buy
    } else {
        Side::Sell
    }
}

fn quantity_upper_bound(price: f64) -> f64 {
    if price < 1.0 {
        100_000.0
    } else if price < 10.0 {
        50_000.0
    } else if price < 100.0 {
        20_000.0
    } else {
        5_000.0
    }
}

/// Notional = lifetime_volume * base_pct * U[0.5, 1.5]; quantity clamped
/// to [500, upper_bound(price)].
pub fn size_trade(profile: &TraderProfile, price: f64, rng: &mut impl Rng) -> f64 {
    let base_pct = profile.risk_class.base_pct();
    let notional = profile.lifetime_volume.max(1.0) * base_pct * rng.gen_range(0.5..=1.5);
    let quantity = notional / price.max(1e-9);
    quantity.clamp(500.0, quantity_upper_bound(price))
}

pub enum PositionOutcome {
    Merged,
    Flipped,
    Closed(Position),
}

/// Apply a fill to an existing (or freshly acquired) position, per the
/// merge/flip/close rules.
pub fn apply_fill(position: &mut Position, trade: &Trade) -> PositionOutcome {
    let fill_signed_qty = trade.action().sign() * trade.quantity;
    let same_sign = position.quantity == 0.0 || position.quantity.signum() == fill_signed_qty.signum();

    if same_sign {
        let total_qty = position.quantity.abs() + fill_signed_qty.abs();
        if total_qty > 0.0 {
            position.entry_price = (position.entry_price * position.quantity.abs()
                + trade.price * fill_signed_qty.abs())
                / total_qty;
        }
        position.quantity += fill_signed_qty;
    } else {
        let was_sign = position.quantity.signum();
        position.quantity += fill_signed_qty;
        if position.quantity.signum() != was_sign && position.quantity != 0.0 {
            position.entry_price = trade.price;
            position.entry_clock = trade.clock;
        }
    }

    if position.quantity.abs() < MIN_CLOSE_QUANTITY {
        PositionOutcome::Closed(position.clone())
    } else if !same_sign {
        PositionOutcome::Flipped
    } else {
        PositionOutcome::Merged
    }
}

/// Per-session dedup cache and pool bookkeeping for the trader engine.
pub struct TraderEngine {
    dedup: HashSet<u64>,
    dedup_order: VecDeque<u64>,
    acquired_trades: u64,
    released_trades: u64,
    acquired_positions: u64,
    released_positions: u64,
}

impl TraderEngine {
    pub fn new() -> Self {
        Self {
            dedup: HashSet::new(),
            dedup_order: VecDeque::new(),
            acquired_trades: 0,
            released_trades: 0,
            acquired_positions: 0,
            released_positions: 0,
        }
    }

    /// True if this trade id has not been seen before; records it either way.
    pub fn dedup_insert(&mut self, trade_id: u64) -> bool {
        if self.dedup.contains(&trade_id) {
            return false;
        }
        self.dedup.insert(trade_id);
        self.dedup_order.push_back(trade_id);
        if self.dedup_order.len() > DEDUP_CACHE_CAP {
            if let Some(old) = self.dedup_order.pop_front() {
                self.dedup.remove(&old);
            }
        }
        true
    }

    pub fn note_trade_acquire(&mut self) {
        self.acquired_trades += 1;
    }
    pub fn note_trade_release(&mut self) {
        self.released_trades += 1;
    }
    pub fn note_position_acquire(&mut self) {
        self.acquired_positions += 1;
    }
    pub fn note_position_release(&mut self) {
        self.released_positions += 1;
    }

    pub fn trade_drift(&self) -> i64 {
        self.acquired_trades as i64 - self.released_trades as i64
    }
    pub fn position_drift(&self) -> i64 {
        self.acquired_positions as i64 - self.released_positions as i64
    }

    pub fn needs_cleanup(&self) -> bool {
        self.trade_drift().abs() > ACQUIRE_RELEASE_DRIFT_THRESHOLD
            || self.position_drift().abs() > ACQUIRE_RELEASE_DRIFT_THRESHOLD
    }
}

impl Default for TraderEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Borrowed session state for one tick of trader decisions.
pub struct TraderTickCtx<'a> {
    pub profiles: &'a mut HashMap<String, TraderProfile>,
    pub positions: &'a mut HashMap<String, Position>,
    pub closed_positions: &'a mut VecDeque<Position>,
    pub closed_positions_cap: usize,
    pub mode: ActivityMode,
    pub price: f64,
    pub trend: f64,
    pub realized_vol: f64,
    pub clock: Millis,
    pub trade_pool: &'a Arc<Pool<Trade>>,
    pub position_pool: &'a Arc<Pool<Position>>,
    pub next_trade_id: &'a mut u64,
}

impl TraderEngine {
    /// Drive one tick: shuffle participants, apply the decision rule to
    /// the active subset, size and materialize trades, update positions
    /// and P&L, and re-sort the ranking by lifetime net P&L.
    pub fn run_tick(&mut self, ctx: &mut TraderTickCtx<'_>, rng: &mut impl Rng) -> Vec<Trade> {
        let mut wallets: Vec<String> = ctx.profiles.keys().cloned().collect();
        wallets.shuffle(rng);

        let active_count = ((wallets.len() as f64) * ctx.mode.participation_pct()).round() as usize;
        let mut trades = Vec::new();

        for wallet in wallets.into_iter().take(active_count) {
            let emits = if ctx.mode == ActivityMode::MaximumFast {
                rng.gen_range(1..=3)
            } else {
                1
            };
            for _ in 0..emits {
                if let Some(trade) = self.decide_and_materialize(ctx, &wallet, rng) {
                    trades.push(trade);
                }
            }
        }

        self.generate_supplementary_trades(ctx, &mut trades, rng);

        self.apply_pnl(ctx);
        trades
    }

    /// Market-maker and retail generators top up the per-agent decision
    /// trades with further synthetic flow weighted 0.4×turnover (the
    /// mode's per-tick position-turnover multiplier) and 0.5× of the
    /// mode's tick-trade budget; a residual random-fill generator then
    /// makes up whatever is still short of the budget. These trades are
    /// not tied to a named profile's position, the same way §4.6's
    /// external-order trades are published without a tracked position.
    fn generate_supplementary_trades(&mut self, ctx: &mut TraderTickCtx<'_>, trades: &mut Vec<Trade>, rng: &mut impl Rng) {
        let budget = ctx.mode.tick_trade_budget() as usize;
        let mm_target = (0.4 * ctx.mode.turnover_pct() * budget as f64).round() as usize;
        let retail_target = (0.5 * budget as f64).round() as usize;

        for _ in 0..mm_target {
            let side = weighted_side(0.5, rng);
            let quantity = rng.gen_range(50.0..=500.0);
            trades.push(self.synth_trade(ctx, "market_maker", side, quantity));
        }
        for _ in 0..retail_target {
            let side = weighted_side(0.5 + ctx.trend.clamp(-1.0, 1.0) * 0.2, rng);
            let quantity = rng.gen_range(10.0..=200.0);
            trades.push(self.synth_trade(ctx, "retail", side, quantity));
        }

        let shortfall = budget.saturating_sub(trades.len());
        for _ in 0..shortfall {
            let side = weighted_side(0.5, rng);
            let quantity = rng.gen_range(10.0..=1_000.0);
            trades.push(self.synth_trade(ctx, "random_fill", side, quantity));
        }
    }

    fn synth_trade(&mut self, ctx: &mut TraderTickCtx<'_>, generator: &str, side: Side, quantity: f64) -> Trade {
        let notional = quantity * ctx.price;
        let impact = (notional / 1_000_000.0).clamp(-0.01, 0.01) * side.sign();

        let mut pooled_trade: Pooled<Trade> = ctx.trade_pool.acquire();
        self.note_trade_acquire();
        *ctx.next_trade_id += 1;
        pooled_trade.value = Trade {
            id: *ctx.next_trade_id,
            clock: ctx.clock,
            trader_id: generator.to_string(),
            action: Some(side),
            price: ctx.price,
            quantity,
            notional,
            impact,
        };
        let trade = pooled_trade.value.clone();
        ctx.trade_pool.release(pooled_trade);
        self.note_trade_release();
        trade
    }

    fn decide_and_materialize(
        &mut self,
        ctx: &mut TraderTickCtx<'_>,
        wallet: &str,
        rng: &mut impl Rng,
    ) -> Option<Trade> {
        let profile = ctx.profiles.get(wallet)?.clone();
        let has_position = ctx.positions.contains_key(wallet);

        let side = if has_position {
            if !decide_close(rng) {
                return None;
            }
            ctx.positions.get(wallet).map(|p| p.side().opposite())?
        } else {
            decide_side(&profile, ctx.trend, ctx.realized_vol, rng)
        };

        let quantity = size_trade(&profile, ctx.price, rng);
        let notional = quantity * ctx.price;
        let impact = (notional / 1_000_000.0).clamp(-0.01, 0.01) * side.sign();

        let mut pooled_trade: Pooled<Trade> = ctx.trade_pool.acquire();
        self.note_trade_acquire();
        *ctx.next_trade_id += 1;
        pooled_trade.value = Trade {
            id: *ctx.next_trade_id,
            clock: ctx.clock,
            trader_id: wallet.to_string(),
            action: Some(side),
            price: ctx.price,
            quantity,
            notional,
            impact,
        };
        let trade = pooled_trade.value.clone();
        // Trade records are published immutably; the pool slot backing
        // this one is handed straight back since the caller owns the
        // returned value from here on.
        ctx.trade_pool.release(pooled_trade);
        self.note_trade_release();

        self.materialize_position(ctx, &trade, rng);

        if let Some(p) = ctx.profiles.get_mut(wallet) {
            p.trade_count += 1;
            p.lifetime_volume += notional;
        }

        Some(trade)
    }

    fn materialize_position(&mut self, ctx: &mut TraderTickCtx<'_>, trade: &Trade, _rng: &mut impl Rng) {
        let wallet = &trade.trader_id;
        let mut pooled_position = match ctx.positions.remove(wallet) {
            Some(existing) => {
                let id = existing.pool_id;
                Pooled { id, value: existing }
            }
            None => {
                let mut p = ctx.position_pool.acquire();
                self.note_position_acquire();
                // The slot may be a reused, previously-released Position still
                // carrying a prior trader's entry price/quantity/pnl; a pool
                // acquire only guarantees a slot, not a zeroed one.
                p.value.trader_id = wallet.clone();
                p.value.entry_price = 0.0;
                p.value.quantity = 0.0;
                p.value.pnl = 0.0;
                p.value.pnl_fraction = 0.0;
                p.value.entry_clock = ctx.clock;
                p.value.pool_id = p.id;
                p
            }
        };

        match apply_fill(&mut pooled_position.value, trade) {
            PositionOutcome::Closed(mut closed) => {
                closed.mark_to_market(trade.price);
                if let Some(profile) = ctx.profiles.get_mut(wallet) {
                    profile.net_pnl += closed.pnl;
                }
                if ctx.closed_positions.len() >= ctx.closed_positions_cap {
                    ctx.closed_positions.pop_front();
                }
                ctx.closed_positions.push_back(closed);
                ctx.position_pool.release(pooled_position);
                self.note_position_release();
            }
            _ => {
                ctx.positions.insert(wallet.clone(), pooled_position.value);
            }
        }
    }

    fn apply_pnl(&mut self, ctx: &mut TraderTickCtx<'_>) {
        for position in ctx.positions.values_mut() {
            position.mark_to_market(ctx.price);
        }
    }
}

/// Ranking by lifetime net P&L, descending.
pub fn rank_traders(profiles: &HashMap<String, TraderProfile>) -> Vec<String> {
    let mut ids: Vec<String> = profiles.keys().cloned().collect();
    ids.sort_by(|a, b| {
        profiles[b]
            .net_pnl
            .partial_cmp(&profiles[a].net_pnl)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn profile(strategy: Strategy, risk: RiskClass) -> TraderProfile {
        TraderProfile {
            wallet_id: "w1".into(),
            lifetime_volume: 10_000.0,
            trade_count: 0,
            net_pnl: 0.0,
            win_rate: 0.6,
            risk_class: risk,
            strategy,
            entry_threshold: 0.01,
            exit_profit_threshold: 0.05,
            exit_loss_threshold: 0.03,
            holding_period_min_ms: 1_000,
            holding_period_max_ms: 60_000,
            trading_frequency: 0.5,
            sentiment_sensitivity: 0.5,
            stop_loss: 0.05,
            take_profit: 0.1,
        }
    }

    #[test]
    fn momentum_follows_trend_above_half_win_rate() {
        let p = profile(Strategy::Momentum, RiskClass::Moderate);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(decide_side(&p, 1.0, 0.01, &mut rng), Side::Buy);
        assert_eq!(decide_side(&p, -1.0, 0.01, &mut rng), Side::Sell);
    }

    #[test]
    fn sizing_respects_bounds() {
        let p = profile(Strategy::Swing, RiskClass::Aggressive);
        let mut rng = StdRng::seed_from_u64(2);
        for _ in 0..50 {
            let q = size_trade(&p, 5.0, &mut rng);
            assert!((500.0..=100_000.0).contains(&q));
        }
    }

    #[test]
    fn position_closes_below_min_quantity() {
        let mut pos = Position {
            trader_id: "w1".into(),
            entry_price: 10.0,
            quantity: 12.0,
            entry_clock: 0,
            pnl: 0.0,
            pnl_fraction: 0.0,
            pool_id: 0,
        };
        let trade = Trade {
            id: 1,
            clock: 1,
            trader_id: "w1".into(),
            action: Some(Side::Sell),
            price: 10.0,
            quantity: 5.0,
            notional: 50.0,
            impact: 0.0,
        };
        match apply_fill(&mut pos, &trade) {
            PositionOutcome::Closed(_) => {}
            _ => panic!("expected close"),
        }
    }

    #[test]
    fn dedup_cache_rejects_repeat_ids() {
        let mut engine = TraderEngine::new();
        assert!(engine.dedup_insert(1));
        assert!(!engine.dedup_insert(1));
        assert!(engine.dedup_insert(2));
    }
}
