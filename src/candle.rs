//! Candle Aggregator
//!
//! Converts a per-session stream of `(timestamp, price, volume)` samples
//! into a validated OHLCV sequence. Exactly one aggregator exists per
//! session; `CandleAggregatorRegistry` is the process-wide map with
//! coalescing creation described in the redesign notes for "singleton
//! registries".

use crate::clock::Millis;
use dashmap::DashMap;
use std::collections::VecDeque;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

pub const MAX_PRICE: f64 = 1_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candle {
    pub open_ms: Millis,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    fn is_valid(&self) -> bool {
        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|p| !p.is_finite() || *p <= 0.0 || *p > MAX_PRICE) {
            return false;
        }
        if !self.volume.is_finite() || self.volume < 0.0 {
            return false;
        }
        let lo = self.open.min(self.close);
        let hi = self.open.max(self.close);
        self.low <= lo && lo <= hi && hi <= self.high
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CandleStats {
    pub total_updates: u64,
    pub timestamp_fixes: u64,
    pub ohlc_fixes: u64,
    pub invalid_dropped: u64,
}

impl CandleStats {
    pub fn success_rate(&self) -> f64 {
        if self.total_updates == 0 {
            return 1.0;
        }
        1.0 - (self.invalid_dropped as f64 / self.total_updates as f64)
    }
}

/// Chooses and caps the bar interval from the initial instrument price.
pub fn interval_for_price(price: f64) -> Millis {
    let secs: i64 = if price < 0.01 {
        6
    } else if price < 1.0 {
        8
    } else if price < 10.0 {
        10
    } else if price < 100.0 {
        12
    } else {
        15
    };
    secs.min(15) * crate::clock::MILLIS_PER_SEC
}

pub struct CandleAggregator {
    pub session_id: Uuid,
    interval_ms: Millis,
    current: Option<Candle>,
    history: VecDeque<Candle>,
    history_cap: usize,
    last_input_timestamp: Millis,
    last_finalized_clock: Option<Millis>,
    drift_accum_ms: i64,
    stats: CandleStats,
}

impl CandleAggregator {
    pub fn new(session_id: Uuid, initial_price: f64, history_cap: usize) -> Self {
        Self {
            session_id,
            interval_ms: interval_for_price(initial_price),
            current: None,
            history: VecDeque::with_capacity(history_cap.min(256)),
            history_cap,
            last_input_timestamp: Millis::MIN,
            last_finalized_clock: None,
            drift_accum_ms: 0,
            stats: CandleStats::default(),
        }
    }

    pub fn interval_ms(&self) -> Millis {
        self.interval_ms
    }

    pub fn stats(&self) -> CandleStats {
        self.stats
    }

    pub fn current(&self) -> Option<Candle> {
        self.current
    }

    pub fn history(&self) -> &VecDeque<Candle> {
        &self.history
    }

    pub fn recent(&self, n: usize) -> Vec<Candle> {
        self.history.iter().rev().take(n).rev().copied().collect()
    }

    /// Re-derive the bar interval from a freshly sampled price, as happens
    /// on session reset.
    pub fn rederive_interval(&mut self, initial_price: f64) {
        self.interval_ms = interval_for_price(initial_price);
    }

    fn coordinate_timestamp(&mut self, raw: Millis) -> Millis {
        let floor = if self.last_input_timestamp == Millis::MIN {
            raw
        } else {
            self.last_input_timestamp + self.interval_ms
        };
        let coordinated = raw.max(floor);
        self.drift_accum_ms += coordinated - raw;
        self.last_input_timestamp = coordinated;
        coordinated
    }

    fn align(&mut self, timestamp: Millis) -> Millis {
        let mut aligned = (timestamp / self.interval_ms) * self.interval_ms;
        if let Some(last) = self.last_finalized_clock {
            if aligned <= last {
                aligned = last + self.interval_ms;
                self.stats.timestamp_fixes += 1;
            }
        }
        aligned
    }

    fn finalize_current(&mut self) {
        if let Some(c) = self.current.take() {
            if self.history.len() >= self.history_cap {
                self.history.pop_front();
            }
            self.last_finalized_clock = Some(c.open_ms);
            self.history.push_back(c);
        }
    }

    fn validate_and_repair(&mut self, candle: &mut Candle) -> bool {
        if candle.is_valid() {
            return true;
        }
        let mut prices = [candle.open, candle.high, candle.low, candle.close];
        let fallback = prices.iter().copied().find(|p| p.is_finite() && *p > 0.0 && *p <= MAX_PRICE);
        if let Some(fallback) = fallback {
            for p in prices.iter_mut() {
                if !p.is_finite() || *p <= 0.0 || *p > MAX_PRICE {
                    *p = fallback;
                }
            }
            candle.open = prices[0];
            candle.high = prices.iter().copied().fold(f64::MIN, f64::max);
            candle.low = prices.iter().copied().fold(f64::MAX, f64::min);
            candle.close = prices[3];
            candle.volume = candle.volume.max(0.0);
            if !candle.volume.is_finite() {
                candle.volume = 0.0;
            }
            self.stats.ohlc_fixes += 1;
        }
        if candle.is_valid() {
            true
        } else {
            self.stats.invalid_dropped += 1;
            false
        }
    }

    /// Ingest one `(timestamp, price, volume)` sample.
    pub fn ingest(&mut self, raw_timestamp: Millis, price: f64, volume: f64) {
        self.stats.total_updates += 1;
        let coordinated = self.coordinate_timestamp(raw_timestamp);
        let aligned = self.align(coordinated);

        let opens_new_bar = match &self.current {
            None => true,
            Some(c) => aligned != c.open_ms,
        };

        if opens_new_bar {
            if let Some(c) = &self.current {
                if c.open_ms < aligned {
                    self.finalize_current();
                }
            }
            let open = self.history.back().map(|c| c.close).unwrap_or(price);
            let mut candle = Candle {
                open_ms: aligned,
                open,
                high: open,
                low: open,
                close: open,
                volume,
            };
            if self.validate_and_repair(&mut candle) {
                self.current = Some(candle);
            }
        } else if let Some(c) = self.current {
            let mut updated = c;
            updated.close = price;
            updated.high = updated.high.max(price);
            updated.low = updated.low.min(price);
            updated.volume += volume;
            if self.validate_and_repair(&mut updated) {
                self.current = Some(updated);
            } else {
                self.current = None;
            }
        }
    }

    /// Revalidate an externally supplied batch, repairing non-monotone
    /// timestamps and OHLC violations, dropping unrepairable bars.
    pub fn set_candles(&mut self, mut bars: Vec<Candle>) -> Vec<Candle> {
        bars.sort_by_key(|c| c.open_ms);
        let mut out = Vec::with_capacity(bars.len());
        let mut last: Option<Millis> = None;
        for mut bar in bars {
            self.stats.total_updates += 1;
            if let Some(prev) = last {
                if bar.open_ms <= prev {
                    bar.open_ms = prev + self.interval_ms;
                    self.stats.timestamp_fixes += 1;
                }
            }
            if self.validate_and_repair(&mut bar) {
                last = Some(bar.open_ms);
                out.push(bar);
            }
        }
        out
    }

    /// Finalize the in-progress candle without starting a new one, used by
    /// the pause protocol.
    pub fn finalize_in_progress(&mut self) {
        self.finalize_current();
    }

    pub fn reset(&mut self, initial_price: f64) {
        self.current = None;
        self.history.clear();
        self.last_input_timestamp = Millis::MIN;
        self.last_finalized_clock = None;
        self.drift_accum_ms = 0;
        self.stats = CandleStats::default();
        self.rederive_interval(initial_price);
    }

    pub fn drift_accum_ms(&self) -> i64 {
        self.drift_accum_ms
    }
}

/// Process-wide registry of per-session aggregators with coalescing
/// creation: concurrent callers for the same session share one creation
/// future instead of racing to construct duplicate instances.
#[derive(Default)]
pub struct CandleAggregatorRegistry {
    instances: DashMap<Uuid, std::sync::Arc<AsyncMutex<CandleAggregator>>>,
}

impl CandleAggregatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_create(
        &self,
        session_id: Uuid,
        initial_price: f64,
        history_cap: usize,
    ) -> std::sync::Arc<AsyncMutex<CandleAggregator>> {
        self.instances
            .entry(session_id)
            .or_insert_with(|| {
                std::sync::Arc::new(AsyncMutex::new(CandleAggregator::new(
                    session_id,
                    initial_price,
                    history_cap,
                )))
            })
            .clone()
    }

    pub fn get(&self, session_id: &Uuid) -> Option<std::sync::Arc<AsyncMutex<CandleAggregator>>> {
        self.instances.get(session_id).map(|e| e.clone())
    }

    pub fn remove(&self, session_id: &Uuid) {
        self.instances.remove(session_id);
    }

    /// Integrity audit: detects orphaned or uninitialized instances.
    pub fn audit(&self) -> IntegrityReport {
        let mut uninitialized = 0;
        for entry in self.instances.iter() {
            if let Ok(guard) = entry.value().try_lock() {
                if guard.current.is_none() && guard.history.is_empty() {
                    uninitialized += 1;
                }
            }
        }
        IntegrityReport {
            instance_count: self.instances.len(),
            uninitialized,
        }
    }
}

#[derive(Debug)]
pub struct IntegrityReport {
    pub instance_count: usize,
    pub uninitialized: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_selection_matches_table() {
        assert_eq!(interval_for_price(0.005), 6_000);
        assert_eq!(interval_for_price(0.5), 8_000);
        assert_eq!(interval_for_price(5.0), 10_000);
        assert_eq!(interval_for_price(50.0), 12_000);
        assert_eq!(interval_for_price(500.0), 15_000);
    }

    #[test]
    fn first_sample_opens_at_initial_price() {
        let mut agg = CandleAggregator::new(Uuid::new_v4(), 5.0, 2_000);
        agg.ingest(0, 5.0, 10.0);
        let c = agg.current().unwrap();
        assert_eq!(c.open, 5.0);
        assert_eq!(c.volume, 10.0);
    }

    #[test]
    fn non_monotone_timestamp_is_advanced() {
        let mut agg = CandleAggregator::new(Uuid::new_v4(), 5.0, 2_000);
        agg.ingest(0, 5.0, 1.0);
        // force a finalize by jumping a full interval ahead
        agg.ingest(20_000, 5.1, 1.0);
        assert_eq!(agg.history().len(), 1);
        // now feed a timestamp equal to the last finalized bar's clock
        let last_open = agg.history().back().unwrap().open_ms;
        agg.ingest(last_open, 5.2, 1.0);
        assert_eq!(agg.stats().timestamp_fixes, 1);
        assert_eq!(agg.history().len(), 1); // still in progress, bar count unchanged
    }

    #[test]
    fn non_finite_price_triggers_repair() {
        let mut agg = CandleAggregator::new(Uuid::new_v4(), 5.0, 2_000);
        agg.ingest(0, 5.0, 1.0);
        if let Some(c) = &mut agg.current {
            c.high = f64::NAN;
        }
        let mut c = agg.current.unwrap();
        let ok = agg.validate_and_repair(&mut c);
        assert!(ok);
        assert!(c.high.is_finite());
        assert_eq!(agg.stats().ohlc_fixes, 1);
    }

    #[test]
    fn history_is_bounded() {
        let mut agg = CandleAggregator::new(Uuid::new_v4(), 5.0, 3);
        for i in 0..10 {
            agg.ingest(i * 20_000, 5.0 + i as f64 * 0.01, 1.0);
        }
        assert!(agg.history().len() <= 3);
    }
}
