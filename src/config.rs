//! Engine Configuration
//!
//! Tunables named in the Session API's "Configuration" surface. Loaded from
//! the environment the way the teacher's `Config::from_env` does it, with a
//! hardcoded default for every field so the engine runs unconfigured.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub http_port: u16,

    pub tick_period: Duration,
    pub metrics_period: Duration,
    pub broadcast_throttle: Duration,

    pub trade_pool_size: usize,
    pub position_pool_size: usize,

    pub candle_history_cap: usize,
    pub recent_trades_cap: usize,
    pub closed_positions_cap: usize,

    pub default_spread: f64,
    pub depth_levels: usize,
    pub min_order_size: f64,
    pub max_order_size: f64,

    pub trader_cache_ttl: Duration,
    pub trader_cache_dir: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            tick_period: Duration::from_millis(50),
            metrics_period: Duration::from_secs(2),
            broadcast_throttle: Duration::from_secs(2),
            trade_pool_size: 5_000,
            position_pool_size: 2_500,
            candle_history_cap: 2_000,
            recent_trades_cap: 5_000,
            closed_positions_cap: 500,
            default_spread: 0.002,
            depth_levels: 20,
            min_order_size: 100.0,
            max_order_size: 10_000.0,
            trader_cache_ttl: Duration::from_secs(3_600),
            trader_cache_dir: "./.trader_cache".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("PORT") {
            if let Ok(p) = v.parse() {
                cfg.http_port = p;
            }
        }
        if let Ok(v) = std::env::var("TRADER_CACHE_TTL_SECS") {
            if let Ok(secs) = v.parse() {
                cfg.trader_cache_ttl = Duration::from_secs(secs);
            }
        }
        if let Ok(v) = std::env::var("TRADER_CACHE_DIR") {
            cfg.trader_cache_dir = v;
        }

        cfg
    }
}
