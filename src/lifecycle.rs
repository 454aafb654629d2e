//! Lifecycle Controller
//!
//! Owns the process-wide session map, the single-active-session lock, the
//! shared object pools, and the candle-aggregator registry. Implements the
//! Session API (creation, state gating, start/pause/resume/reset/delete,
//! throughput-mode control, liquidation cascades) and drives the per-session
//! tick and metrics tasks.

use crate::candle::{CandleAggregator, CandleAggregatorRegistry};
use crate::clock::Millis;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{
    OrderBookSnapshot, PriceUpdatePayload, SerializableCandle, SerializableTrade, StreamEvent,
    ThroughputMetricsSnapshot,
};
use crate::external_orders::{ExternalOrder, ThroughputMode};
use crate::orderbook::OrderBookConfig;
use crate::pool::Pool;
use crate::price_engine::{sample_initial_price, Regime};
use crate::provider::{CachingTraderDataProvider, HttpTraderDataProvider, RawTrader};
use crate::session::{Session, SessionConfig, SessionState};
use crate::trader::{rank_traders, ActivityMode, RiskClass, Side, Strategy, Trade, TraderProfile};
use parking_lot::{Mutex as SyncMutex, RwLock as SyncRwLock};
use rand::Rng;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

const CANDLE_RETRY_ATTEMPTS: u32 = 3;
const BROADCAST_CHANNEL_CAPACITY: usize = 1_024;
const MIN_BACKFILL_TRADES: usize = 50;
const LARGE_ORDER_NOTIONAL: f64 = 10_000.0;

/// Inputs to `createSession` (spec.md §6, "optional {price-range tag or
/// custom price, duration minutes, compression factor, volatility
/// multiplier, initial liquidity}").
#[derive(Debug, Clone, Default)]
pub struct CreateSessionParams {
    pub custom_price: Option<f64>,
    pub duration_minutes: Option<u32>,
    pub speed: Option<u32>,
    pub volatility_multiplier: Option<f64>,
    pub initial_liquidity: Option<f64>,
}

/// Read-only projection of a session returned by `getSession`/`listSessions`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub state: SessionState,
    pub price: f64,
    pub clock_ms: Millis,
    pub speed: u32,
    pub throughput_mode: ThroughputMode,
    pub total_trades_processed: u64,
    pub trader_count: usize,
}

struct SessionRecord {
    session: Arc<AsyncMutex<Session>>,
    op_lock: Arc<AsyncMutex<()>>,
    tick_handle: SyncMutex<Option<JoinHandle<()>>>,
    metrics_handle: SyncMutex<Option<JoinHandle<()>>>,
    broadcaster: broadcast::Sender<StreamEvent>,
}

pub struct LifecycleController {
    config: EngineConfig,
    sessions: SyncRwLock<std::collections::HashMap<Uuid, Arc<SessionRecord>>>,
    active_session: SyncRwLock<Option<Uuid>>,
    candle_registry: Arc<CandleAggregatorRegistry>,
    trade_pool: Arc<Pool<Trade>>,
    position_pool: Arc<Pool<crate::trader::Position>>,
    order_pool: Arc<Pool<ExternalOrder>>,
    trader_provider: Arc<CachingTraderDataProvider<HttpTraderDataProvider>>,
}

impl LifecycleController {
    pub fn new(config: EngineConfig, trader_data_endpoint: impl Into<String>) -> Arc<Self> {
        let trader_provider = Arc::new(CachingTraderDataProvider::new(
            HttpTraderDataProvider::new(trader_data_endpoint),
            config.trader_cache_dir.clone(),
            config.trader_cache_ttl,
            "top-traders",
        ));
        let controller = Arc::new(Self {
            trade_pool: Arc::new(Pool::new("trades", config.trade_pool_size)),
            position_pool: Arc::new(Pool::new("positions", config.position_pool_size)),
            order_pool: Arc::new(Pool::new("external_orders", config.trade_pool_size)),
            candle_registry: Arc::new(CandleAggregatorRegistry::new()),
            sessions: SyncRwLock::new(std::collections::HashMap::new()),
            active_session: SyncRwLock::new(None),
            trader_provider,
            config,
        });
        controller.clone().spawn_pool_monitor();
        controller
    }

    fn spawn_pool_monitor(self: Arc<Self>) {
        tokio::spawn(async move {
            let idle_deadline = Duration::from_secs(60);
            loop {
                tokio::time::sleep(Duration::from_secs(30)).await;
                for pool in [self.trade_pool.health(), self.position_pool.health(), self.order_pool.health()] {
                    if pool.drift().unsigned_abs() > 500 {
                        tracing::warn!(drift = pool.drift(), "pool leak escalation across sessions");
                    }
                }
                self.trade_pool.maybe_gc(idle_deadline);
                self.position_pool.maybe_gc(idle_deadline);
                self.order_pool.maybe_gc(idle_deadline);
            }
        });
    }

    // ---- Session API -----------------------------------------------------

    pub async fn create_session(self: &Arc<Self>, params: CreateSessionParams) -> EngineResult<Uuid> {
        {
            let active = self.active_session.read();
            if let Some(existing) = *active {
                return Err(EngineError::SingleSessionLock(existing));
            }
        }

        let id = Uuid::new_v4();
        let initial_price = params.custom_price.unwrap_or_else(|| {
            let mut rng = rand::thread_rng();
            sample_initial_price(&mut rng)
        });

        let raw_traders = self.trader_provider.fetch_top_traders().await;
        let profiles = raw_traders.into_iter().map(|r| (r.wallet.clone(), derive_profile(r))).collect();

        let candle = self.acquire_candle_aggregator(id, initial_price).await?;

        let session_config = SessionConfig {
            initial_price,
            liquidity_seed: params.initial_liquidity.unwrap_or(1_000_000.0),
            speed: params.speed.unwrap_or(1).clamp(1, 200),
            volatility_multiplier: params.volatility_multiplier.unwrap_or(1.0),
            duration_minutes: params.duration_minutes.unwrap_or(60),
        };

        let order_book_cfg = OrderBookConfig {
            depth_levels: self.config.depth_levels,
            default_spread: self.config.default_spread,
            min_qty: 1.0,
        };

        let session = Session::new(id, session_config, profiles, candle, self.order_pool.clone(), order_book_cfg);
        let (tx, _rx) = broadcast::channel(BROADCAST_CHANNEL_CAPACITY);
        let record = Arc::new(SessionRecord {
            session: Arc::new(AsyncMutex::new(session)),
            op_lock: Arc::new(AsyncMutex::new(())),
            tick_handle: SyncMutex::new(None),
            metrics_handle: SyncMutex::new(None),
            broadcaster: tx,
        });

        self.sessions.write().insert(id, record);
        *self.active_session.write() = Some(id);
        tracing::info!(session = %id, price = initial_price, "session created");
        Ok(id)
    }

    /// `get_or_create` cannot itself fail today (§4.7 only prescribes a retry
    /// shape for a fallible creation path), but the attempt counter and
    /// exponential backoff are kept here so a future fallible backing store
    /// slots in without touching callers.
    async fn acquire_candle_aggregator(
        &self,
        id: Uuid,
        initial_price: f64,
    ) -> EngineResult<Arc<AsyncMutex<CandleAggregator>>> {
        for attempt in 1..=CANDLE_RETRY_ATTEMPTS {
            if attempt > 1 {
                tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
            }
            return Ok(self
                .candle_registry
                .get_or_create(id, initial_price, self.config.candle_history_cap)
                .await);
        }
        Err(EngineError::Internal("candle aggregator creation failed".into()))
    }

    fn record(&self, id: Uuid) -> EngineResult<Arc<SessionRecord>> {
        self.sessions.read().get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn get_session(&self, id: Uuid) -> EngineResult<SessionSnapshot> {
        let record = self.record(id)?;
        let session = record.session.lock().await;
        Ok(snapshot_of(&session))
    }

    pub async fn list_sessions(&self) -> Vec<SessionSnapshot> {
        let ids: Vec<Uuid> = self.sessions.read().keys().copied().collect();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(record) = self.record(id) {
                out.push(snapshot_of(&*record.session.lock().await));
            }
        }
        out
    }

    pub async fn set_speed(&self, id: Uuid, speed: u32) -> EngineResult<u32> {
        if !(1..=200).contains(&speed) {
            return Err(EngineError::InvalidSpeed(speed));
        }
        let record = self.record(id)?;
        let mut session = record.session.lock().await;
        session.config.speed = speed;
        Ok(speed)
    }

    pub async fn start_session(self: &Arc<Self>, id: Uuid) -> EngineResult<SessionState> {
        let record = self.record(id)?;
        {
            let mut session = record.session.lock().await;
            if session.state != SessionState::Idle {
                return Err(EngineError::InvalidTransition(format!("cannot start from {:?}", session.state)));
            }
            session.state = SessionState::Running;
        }
        self.spawn_tick_task(id, record.clone());
        self.spawn_metrics_task(id, record.clone());
        self.broadcast_status(id, &record, SessionState::Running, false);
        Ok(SessionState::Running)
    }

    pub async fn pause_session(&self, id: Uuid) -> EngineResult<SessionState> {
        let record = self.record(id)?;
        let Ok(_guard) = record.op_lock.try_lock() else {
            return Err(EngineError::OperationInProgress);
        };
        {
            let mut session = record.session.lock().await;
            if session.state != SessionState::Running {
                return Err(EngineError::InvalidTransition("pause requires running∧¬paused".into()));
            }
            session.state = SessionState::Paused;
        }
        self.teardown_tasks(&record);
        {
            let session = record.session.lock().await;
            let mut candle = session.candles.lock().await;
            candle.finalize_in_progress();
        }
        self.trade_pool.maybe_gc(Duration::from_secs(60));
        self.position_pool.maybe_gc(Duration::from_secs(60));
        self.broadcast_status(id, &record, SessionState::Paused, true);
        Ok(SessionState::Paused)
    }

    pub async fn resume_session(self: &Arc<Self>, id: Uuid) -> EngineResult<SessionState> {
        let record = self.record(id)?;
        let Ok(_guard) = record.op_lock.try_lock() else {
            return Err(EngineError::OperationInProgress);
        };
        {
            let mut session = record.session.lock().await;
            if session.state != SessionState::Paused {
                return Err(EngineError::InvalidTransition("resume requires running∧paused".into()));
            }
            session.state = SessionState::Running;
        }
        self.spawn_tick_task(id, record.clone());
        self.spawn_metrics_task(id, record.clone());
        self.broadcast_status(id, &record, SessionState::Running, false);
        Ok(SessionState::Running)
    }

    async fn stop_session_internal(&self, id: Uuid, record: &Arc<SessionRecord>) {
        self.teardown_tasks(record);
        let mut session = record.session.lock().await;
        session.state = SessionState::Stopped;
        drop(session);
        self.broadcast_status(id, record, SessionState::Stopped, false);
    }

    pub async fn reset_session(&self, id: Uuid) -> EngineResult<SessionState> {
        let record = self.record(id)?;
        self.teardown_tasks(&record);
        let mut session = record.session.lock().await;

        for (_, pos) in session.positions.drain() {
            let id = pos.pool_id();
            self.position_pool.release(crate::pool::Pooled { id, value: pos });
        }
        session.closed_positions.clear();
        session.recent_trades.clear();

        let fresh_price = {
            let mut rng = rand::thread_rng();
            sample_initial_price(&mut rng)
        };
        session.config.initial_price = fresh_price;
        session.price_engine = crate::price_engine::PriceEngine::new(fresh_price);
        let order_book_cfg = OrderBookConfig {
            depth_levels: self.config.depth_levels,
            default_spread: self.config.default_spread,
            min_qty: 1.0,
        };
        session.order_book = crate::orderbook::OrderBook::new(fresh_price, session.config.liquidity_seed, order_book_cfg);
        session.throughput_mode = ThroughputMode::Normal;
        session.total_trades_processed = 0;
        session.metrics = Default::default();
        let duration_minutes = session.config.duration_minutes;
        session.clock.reset_to(0, duration_minutes);
        session.state = SessionState::Idle;

        {
            let mut candle = session.candles.lock().await;
            candle.reset(fresh_price);
        }

        drop(session);
        let _ = record.broadcaster.send(StreamEvent::SimulationReset { session_id: id });
        Ok(SessionState::Idle)
    }

    pub async fn delete_session(&self, id: Uuid) -> EngineResult<()> {
        let record = self.record(id)?;
        self.stop_session_internal(id, &record).await;

        let mut session = record.session.lock().await;
        for (_, pos) in session.positions.drain() {
            let id = pos.pool_id();
            self.position_pool.release(crate::pool::Pooled { id, value: pos });
        }
        drop(session);

        self.candle_registry.remove(&id);
        self.sessions.write().remove(&id);
        {
            let mut active = self.active_session.write();
            if *active == Some(id) {
                *active = None;
            }
        }
        tracing::info!(session = %id, "session deleted");
        Ok(())
    }

    pub async fn set_throughput_mode(&self, id: Uuid, mode_str: &str) -> EngineResult<(ThroughputMode, ThroughputMetricsSnapshot)> {
        let mode = ThroughputMode::parse(mode_str).ok_or_else(|| EngineError::UnknownThroughputMode(mode_str.to_string()))?;
        let record = self.record(id)?;
        let mut session = record.session.lock().await;
        let previous = session.throughput_mode;
        session.throughput_mode = mode;
        let snapshot = metrics_snapshot(&session);
        Ok((previous, snapshot))
    }

    pub async fn trigger_liquidation_cascade(&self, id: Uuid) -> EngineResult<(usize, f64, usize)> {
        let record = self.record(id)?;
        let mut session = record.session.lock().await;
        if !matches!(session.throughput_mode, ThroughputMode::Stress | ThroughputMode::Hft) {
            return Err(EngineError::WrongMode(session.throughput_mode));
        }
        let market_cap = session.price_engine.price * session.config.liquidity_seed;
        let now = session.clock.now();
        let price = session.price_engine.price;
        let mode = session.throughput_mode;
        let mut rng_snapshot = rand::thread_rng();
        let result = session
            .external_orders
            .trigger_liquidation_cascade(mode, price, market_cap, now, &mut rng_snapshot)
            .ok_or(EngineError::WrongMode(mode))?;
        let payload = (result.generated, result.estimated_impact, result.cascade_size);
        drop(session);
        let _ = record.broadcaster.send(StreamEvent::LiquidationCascadeTriggered {
            generated: payload.0,
            estimated_impact: payload.1,
            cascade_size: payload.2,
        });
        Ok(payload)
    }

    pub fn subscribe(&self, id: Uuid) -> EngineResult<broadcast::Receiver<StreamEvent>> {
        Ok(self.record(id)?.broadcaster.subscribe())
    }

    // ---- Task management ---------------------------------------------------

    fn teardown_tasks(&self, record: &Arc<SessionRecord>) {
        if let Some(handle) = record.tick_handle.lock().take() {
            handle.abort();
        }
        if let Some(handle) = record.metrics_handle.lock().take() {
            handle.abort();
        }
    }

    fn spawn_tick_task(self: &Arc<Self>, id: Uuid, record: Arc<SessionRecord>) {
        let controller = self.clone();
        let period = controller.config.tick_period;
        let task_record = record.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if let Err(e) = controller.run_tick(id, &task_record).await {
                    tracing::error!(session = %id, error = %e, "tick failed, continuing loop");
                }
            }
        });
        *record.tick_handle.lock() = Some(handle);
    }

    fn spawn_metrics_task(self: &Arc<Self>, id: Uuid, record: Arc<SessionRecord>) {
        let controller = self.clone();
        let period = controller.config.metrics_period;
        let task_record = record.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                controller.run_metrics_sample(id, &task_record).await;
            }
        });
        *record.metrics_handle.lock() = Some(handle);
    }

    async fn run_metrics_sample(&self, id: Uuid, record: &Arc<SessionRecord>) {
        let mut session = record.session.lock().await;
        let now = wall_clock_ms();
        let elapsed_s = ((now - session.metrics.last_sampled_at_ms).max(1) as f64) / 1000.0;
        session.metrics.actual_tps = session.metrics.trades_since_last_sample as f64 / elapsed_s;
        session.metrics.trades_since_last_sample = 0;
        session.metrics.last_sampled_at_ms = now;
        let snapshot = metrics_snapshot(&session);
        let hash = hash_metrics(&snapshot);
        let stale = now - session.metrics.last_broadcast_at_ms >= 10_000;
        if hash != session.metrics.last_broadcast_hash || stale {
            session.metrics.last_broadcast_hash = hash;
            session.metrics.last_broadcast_at_ms = now;
            let _ = record.broadcaster.send(StreamEvent::ExternalMarketPressure(snapshot));
        }
    }

    fn broadcast_status(&self, id: Uuid, record: &Arc<SessionRecord>, state: SessionState, paused: bool) {
        let _ = record.broadcaster.send(StreamEvent::SimulationStatus {
            session_id: id,
            state: format!("{state:?}"),
            paused,
        });
    }

    /// One 50 ms tick: `max(1, speed/5)` internal sub-ticks, each advancing
    /// observable time by `(50ms · speed · 2) / sub_ticks`, per §4.7.
    async fn run_tick(&self, id: Uuid, record: &Arc<SessionRecord>) -> anyhow::Result<()> {
        let mut session = record.session.lock().await;
        if session.state != SessionState::Running {
            return Ok(());
        }

        let speed = session.config.speed;
        let sub_ticks = (speed / 5).max(1);
        let total_advance = 50i64 * speed as i64 * 2;
        let per_sub_advance = (total_advance / sub_ticks as i64).max(1);

        let candle_arc = session.candles.clone();
        for _ in 0..sub_ticks {
            session.clock.advance(per_sub_advance);
            let mut candle = candle_arc.lock().await;
            self.run_subtick(&mut session, &mut candle, per_sub_advance)?;
        }

        if session.clock.has_ended() {
            drop(session);
            let _ = self.pause_session(id).await;
            return Ok(());
        }

        let payload = build_price_update(&session, id);
        drop(session);
        let _ = record.broadcaster.send(StreamEvent::PriceUpdate(payload));
        Ok(())
    }

    fn run_subtick(&self, session: &mut Session, candle: &mut CandleAggregator, dt_ms: i64) -> anyhow::Result<()> {
        let recent = session.recent_trade_notionals();
        let bar_closes: Vec<f64> = candle.recent(15).iter().map(|c| c.close).collect();
        let scenario_bias = session_scenario_bias(session);
        let throughput_target = session.throughput_mode.target_tps();
        let interval_vol_mult = interval_volatility_multiplier(candle.interval_ms());

        let price = {
            let Session { price_engine, rng, .. } = session;
            price_engine.tick(&recent, throughput_target, interval_vol_mult, scenario_bias, &bar_closes, rng)
        };
        let trend = match session.price_engine.regime {
            Regime::Bullish => 1.0,
            Regime::Bearish => -1.0,
            Regime::Sideways => 0.0,
        };
        let realized_vol = session.price_engine.realized_vol;

        let mode = ActivityMode::from_speed(session.config.speed);
        let mut trader_trades = {
            let cap = self.config.closed_positions_cap;
            let clock = session.clock.now();
            let trade_pool = &self.trade_pool;
            let position_pool = &self.position_pool;
            let Session {
                profiles,
                positions,
                closed_positions,
                trader_engine,
                next_trade_id,
                rng,
                ..
            } = session;
            let mut ctx = crate::trader::TraderTickCtx {
                profiles,
                positions,
                closed_positions,
                closed_positions_cap: cap,
                mode,
                price,
                trend,
                realized_vol,
                clock,
                trade_pool,
                position_pool,
                next_trade_id,
            };
            trader_engine.run_tick(&mut ctx, rng)
        };
        session.ranking = rank_traders(&session.profiles);

        let now = session.clock.now();
        let initial_price = session.config.initial_price;
        let throughput_mode = session.throughput_mode;
        {
            let Session { external_orders, rng, .. } = session;
            external_orders.generate_for_tick(throughput_mode, price, initial_price, trend, dt_ms, now, rng);
        }
        for t in &trader_trades {
            if t.notional > LARGE_ORDER_NOTIONAL {
                session.external_orders.maybe_front_run(t.action(), t.notional, price, now);
            }
        }

        let fills = session.external_orders.drain_and_fill(throughput_mode, &mut session.order_book);
        let mut external_trades = Vec::with_capacity(fills.len());
        for (order, fill) in fills {
            let Some(fill) = fill else {
                continue;
            };
            session.next_trade_id += 1;
            let side = order.side.unwrap_or(Side::Buy);
            session.price_engine.price = (session.price_engine.price * (1.0 + fill.impact)).max(1e-9);
            external_trades.push(Trade {
                id: session.next_trade_id,
                clock: now,
                trader_id: format!("external:{:?}", order.archetype.unwrap_or(crate::external_orders::Archetype::RetailTrader)),
                action: Some(side),
                price: fill.avg_price,
                quantity: fill.filled_quantity,
                notional: fill.avg_price * fill.filled_quantity,
                impact: fill.impact,
            });
        }

        // Ordering guarantee: trader-engine trades precede external-engine
        // trades in the published stream (§5 "Ordering guarantees", item 3).
        trader_trades.extend(external_trades);
        let mut tick_volume = 0.0;
        let mut last_price = session.price_engine.price;
        for trade in trader_trades {
            if !session.trader_engine.dedup_insert(trade.id) {
                continue;
            }
            session.metrics.trades_since_last_sample += 1;
            tick_volume += trade.quantity;
            last_price = trade.price;
            session.push_trade(trade, self.config.recent_trades_cap);
        }

        if session.recent_trades.len() < MIN_BACKFILL_TRADES {
            let (backfill_volume, backfill_price) = backfill_trades(session, last_price, self.config.recent_trades_cap);
            tick_volume += backfill_volume;
            last_price = backfill_price;
        }

        candle.ingest(now, last_price, tick_volume.max(0.0));

        let recent_pairs = session.recent_trade_notionals();
        session
            .order_book
            .update(session.price_engine.price, &recent_pairs, now, session.config.liquidity_seed);

        Ok(())
    }
}

/// Wall-clock timestamp used only for metrics-sampling cadence and
/// broadcast-staleness deadlines — never for the simulated clock itself,
/// which `SimClock` advances exclusively from the tick loop.
fn wall_clock_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn session_scenario_bias(session: &Session) -> crate::scenario::Bias {
    match &session.scenario {
        None => crate::scenario::Bias::default(),
        Some(scenario) => {
            let progress = match (session.scenario_started_ms, session.scenario_duration_ms) {
                (Some(started), Some(duration)) if duration > 0 => {
                    ((session.clock.now() - started) as f64 / duration as f64).clamp(0.0, 1.0)
                }
                _ => 1.0,
            };
            scenario.bias(progress)
        }
    }
}

/// Shorter bar intervals imply choppier per-sample price action; this scales
/// the price engine's σ up for sub-10s intervals and down for the 15s cap,
/// bounded to keep the effect secondary to throughput and regime scaling.
fn interval_volatility_multiplier(interval_ms: Millis) -> f64 {
    (15_000.0 / interval_ms.max(1) as f64).sqrt().clamp(0.8, 1.5)
}

/// Injects 5-15 small synthetic trades when the recent-trades window is thin,
/// so candles stay non-degenerate (§4.7 "backfill generator"). Returns the
/// total synthetic volume and the last synthetic price for candle ingestion.
fn backfill_trades(session: &mut Session, base_price: f64, cap: usize) -> (f64, f64) {
    let count = session.rng.gen_range(5..=15);
    let mut volume = 0.0;
    let mut price = base_price;
    for _ in 0..count {
        session.next_trade_id += 1;
        let side = if session.rng.gen_bool(0.5) { Side::Buy } else { Side::Sell };
        let quantity = session.rng.gen_range(50.0..=500.0);
        let impact = (quantity * price / 1_000_000.0).clamp(0.0, 0.0005) * side.sign();
        price = (price * (1.0 + impact)).max(1e-9);
        volume += quantity;
        session.push_trade(
            Trade {
                id: session.next_trade_id,
                clock: session.clock.now(),
                trader_id: "synthetic-backfill".to_string(),
                action: Some(side),
                price,
                quantity,
                notional: quantity * price,
                impact,
            },
            cap,
        );
    }
    session.price_engine.price = price;
    (volume, price)
}

fn snapshot_of(session: &Session) -> SessionSnapshot {
    SessionSnapshot {
        id: session.id,
        state: session.state,
        price: session.price_engine.price,
        clock_ms: session.clock.now(),
        speed: session.config.speed,
        throughput_mode: session.throughput_mode,
        total_trades_processed: session.total_trades_processed,
        trader_count: session.profiles.len(),
    }
}

fn metrics_snapshot(session: &Session) -> ThroughputMetricsSnapshot {
    ThroughputMetricsSnapshot {
        actual_tps: session.metrics.actual_tps,
        configured_tps: session.throughput_mode.target_tps(),
        queue_depth: session.external_orders.queue_depth(),
        sentiment: match session.price_engine.regime {
            Regime::Bullish => "bullish".to_string(),
            Regime::Bearish => "bearish".to_string(),
            Regime::Sideways => "sideways".to_string(),
        },
        dominant_archetype: format!("{:?}", session.throughput_mode.dominant_archetype()),
    }
}

fn hash_metrics(snapshot: &ThroughputMetricsSnapshot) -> u64 {
    let mut hasher = DefaultHasher::new();
    (snapshot.actual_tps as i64).hash(&mut hasher);
    (snapshot.configured_tps as i64).hash(&mut hasher);
    snapshot.queue_depth.hash(&mut hasher);
    snapshot.sentiment.hash(&mut hasher);
    snapshot.dominant_archetype.hash(&mut hasher);
    hasher.finish()
}

fn build_price_update(session: &Session, id: Uuid) -> PriceUpdatePayload {
    // Note: candle history is read synchronously here via try_lock since the
    // tick loop already released the aggregator lock by this point; if it is
    // momentarily held elsewhere the update simply ships an empty candle list
    // rather than blocking the broadcast path (§5 "fire-and-forget").
    let candles = session
        .candles
        .try_lock()
        .map(|c| c.recent(250).into_iter().map(SerializableCandle::from).collect())
        .unwrap_or_default();

    PriceUpdatePayload {
        session_id: id,
        price: session.price_engine.price,
        candles,
        trades: session.recent_trades.iter().take(1_000).map(SerializableTrade::from).collect(),
        order_book: OrderBookSnapshot {
            bids: session.order_book.bids.iter().map(Into::into).collect(),
            asks: session.order_book.asks.iter().map(Into::into).collect(),
        },
        rankings: session.ranking.iter().take(20).cloned().collect(),
        metrics: metrics_snapshot(session),
        total_trades_processed: session.total_trades_processed,
        throughput_mode: session.throughput_mode,
    }
}

/// Minimal, deterministic derivation from a raw trader-analytics record.
/// Full profile-derivation heuristics are explicitly out of scope (spec.md
/// §1); this picks a risk class from win rate and a strategy from trade
/// frequency so every synthetic/real trader still drives a coherent agent.
fn derive_profile(raw: RawTrader) -> TraderProfile {
    let risk_class = if raw.win_rate > 0.55 {
        RiskClass::Aggressive
    } else if raw.win_rate > 0.45 {
        RiskClass::Moderate
    } else {
        RiskClass::Conservative
    };
    let avg_trade_interval = raw.total_volume / raw.trade_count.max(1) as f64;
    let strategy = if raw.trade_count > 500 {
        Strategy::Scalper
    } else if avg_trade_interval > 50_000.0 {
        Strategy::Swing
    } else if raw.buy_volume >= raw.sell_volume {
        Strategy::Momentum
    } else {
        Strategy::Contrarian
    };

    TraderProfile {
        wallet_id: raw.wallet,
        lifetime_volume: raw.total_volume,
        trade_count: raw.trade_count,
        net_pnl: raw.net_pnl,
        win_rate: raw.win_rate,
        risk_class,
        strategy,
        entry_threshold: 0.01,
        exit_profit_threshold: 0.05,
        exit_loss_threshold: 0.03,
        holding_period_min_ms: 1_000,
        holding_period_max_ms: 600_000,
        trading_frequency: (raw.trade_count as f64 / 1_000.0).clamp(0.05, 1.0),
        sentiment_sensitivity: 0.5,
        stop_loss: 0.05,
        take_profit: 0.10,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_profile_picks_aggressive_for_high_win_rate() {
        let raw = RawTrader {
            position: 1,
            wallet: "0xabc".into(),
            net_pnl: 100.0,
            total_volume: 10_000.0,
            buy_volume: 6_000.0,
            sell_volume: 4_000.0,
            trade_count: 50,
            fees_usd: 10.0,
            win_rate: 0.8,
            avg_trade_size: 200.0,
            largest_trade: 1_000.0,
            last_active: 0,
        };
        let profile = derive_profile(raw);
        assert_eq!(profile.risk_class, RiskClass::Aggressive);
    }

    #[test]
    fn interval_volatility_multiplier_is_bounded() {
        assert!(interval_volatility_multiplier(6_000) <= 1.5);
        assert!(interval_volatility_multiplier(15_000) >= 0.8);
    }
}
