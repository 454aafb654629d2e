//! Trader-Data Provider
//!
//! Consumes an external analytics query for the top-trader population.
//! Decorated with a file-backed TTL cache: on fetch error the cache is
//! returned even if stale, and if no cache exists either, a synthetic
//! population is generated from the documented archetype distributions.

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const SYNTHETIC_POPULATION_SIZE: usize = 118;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTrader {
    pub position: u32,
    pub wallet: String,
    pub net_pnl: f64,
    pub total_volume: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub trade_count: u64,
    pub fees_usd: f64,
    pub win_rate: f64,
    pub avg_trade_size: f64,
    pub largest_trade: f64,
    pub last_active: i64,
}

#[async_trait]
pub trait TraderDataProvider: Send + Sync {
    async fn fetch_top_traders(&self) -> anyhow::Result<Vec<RawTrader>>;
}

/// Upstream HTTP-backed provider. The query itself is out of scope for
/// the simulation core (§1); this is the thin interface boundary the
/// cache and synthetic fallback sit behind.
pub struct HttpTraderDataProvider {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpTraderDataProvider {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl TraderDataProvider for HttpTraderDataProvider {
    async fn fetch_top_traders(&self) -> anyhow::Result<Vec<RawTrader>> {
        let resp = self.client.get(&self.endpoint).send().await?;
        let traders = resp.json::<Vec<RawTrader>>().await?;
        Ok(traders)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    timestamp_ms: i64,
    payload: Vec<RawTrader>,
}

/// Wraps an upstream provider with a per-query-identifier TTL cache
/// backed by one JSON file per identifier. On upstream failure, the
/// stale cache is returned if present; if both fail, a synthetic
/// population is generated.
pub struct CachingTraderDataProvider<P: TraderDataProvider> {
    inner: P,
    cache_dir: PathBuf,
    ttl: Duration,
    query_id: String,
}

impl<P: TraderDataProvider> CachingTraderDataProvider<P> {
    pub fn new(inner: P, cache_dir: impl Into<PathBuf>, ttl: Duration, query_id: impl Into<String>) -> Self {
        Self {
            inner,
            cache_dir: cache_dir.into(),
            ttl,
            query_id: query_id.into(),
        }
    }

    fn cache_path(&self) -> PathBuf {
        self.cache_dir.join(format!("{}.json", self.query_id))
    }

    fn read_cache(&self) -> Option<CacheEntry> {
        let bytes = std::fs::read(self.cache_path()).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn write_cache(&self, payload: &[RawTrader]) {
        let entry = CacheEntry {
            timestamp_ms: now_ms(),
            payload: payload.to_vec(),
        };
        if std::fs::create_dir_all(&self.cache_dir).is_ok() {
            if let Ok(bytes) = serde_json::to_vec(&entry) {
                let _ = std::fs::write(self.cache_path(), bytes);
            }
        }
    }

    pub async fn fetch_top_traders(&self) -> Vec<RawTrader> {
        match self.inner.fetch_top_traders().await {
            Ok(fresh) => {
                self.write_cache(&fresh);
                fresh
            }
            Err(e) => {
                tracing::warn!(error = %e, "trader-data fetch failed, falling back to cache");
                if let Some(cached) = self.read_cache() {
                    cached.payload
                } else {
                    tracing::warn!("no cache available, generating synthetic trader population");
                    generate_synthetic_population()
                }
            }
        }
    }

    pub fn is_fresh(&self) -> bool {
        match self.read_cache() {
            Some(entry) => (now_ms() - entry.timestamp_ms) < self.ttl.as_millis() as i64,
            None => false,
        }
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Generates a fixed-size synthetic population matching the documented
/// archetype distributions when both the live fetch and the cache fail.
pub fn generate_synthetic_population() -> Vec<RawTrader> {
    let mut rng = rand::thread_rng();
    (0..SYNTHETIC_POPULATION_SIZE)
        .map(|i| {
            let total_volume = rng.gen_range(10_000.0..=5_000_000.0);
            let buy_volume = total_volume * rng.gen_range(0.3..=0.7);
            let sell_volume = total_volume - buy_volume;
            let trade_count = rng.gen_range(10..=2_000);
            RawTrader {
                position: i as u32 + 1,
                wallet: format!("0xsynthetic{i:04x}"),
                net_pnl: rng.gen_range(-50_000.0..=150_000.0),
                total_volume,
                buy_volume,
                sell_volume,
                trade_count,
                fees_usd: total_volume * 0.001,
                win_rate: rng.gen_range(0.3..=0.7),
                avg_trade_size: total_volume / trade_count.max(1) as f64,
                largest_trade: total_volume * rng.gen_range(0.02..=0.1),
                last_active: now_ms(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysFails;

    #[async_trait]
    impl TraderDataProvider for AlwaysFails {
        async fn fetch_top_traders(&self) -> anyhow::Result<Vec<RawTrader>> {
            anyhow::bail!("upstream down")
        }
    }

    #[test]
    fn synthetic_population_has_documented_size() {
        let pop = generate_synthetic_population();
        assert_eq!(pop.len(), SYNTHETIC_POPULATION_SIZE);
    }

    #[tokio::test]
    async fn falls_back_to_synthetic_when_no_cache_and_upstream_fails() {
        let dir = tempfile::tempdir().unwrap();
        let provider = CachingTraderDataProvider::new(
            AlwaysFails,
            dir.path(),
            Duration::from_secs(3600),
            "test-query",
        );
        let traders = provider.fetch_top_traders().await;
        assert_eq!(traders.len(), SYNTHETIC_POPULATION_SIZE);
    }

    #[tokio::test]
    async fn stale_cache_is_returned_on_fetch_error() {
        let dir = tempfile::tempdir().unwrap();
        let provider = CachingTraderDataProvider::new(
            AlwaysFails,
            dir.path(),
            Duration::from_secs(3600),
            "test-query",
        );
        provider.write_cache(&[RawTrader {
            position: 1,
            wallet: "0xabc".into(),
            net_pnl: 1.0,
            total_volume: 1.0,
            buy_volume: 0.5,
            sell_volume: 0.5,
            trade_count: 1,
            fees_usd: 0.0,
            win_rate: 0.5,
            avg_trade_size: 1.0,
            largest_trade: 1.0,
            last_active: 0,
        }]);
        let traders = provider.fetch_top_traders().await;
        assert_eq!(traders.len(), 1);
        assert_eq!(traders[0].wallet, "0xabc");
    }
}
