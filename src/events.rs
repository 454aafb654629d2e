//! Streaming Event Model
//!
//! Canonical events pushed to a session's broadcast channel. Tagged the
//! way the teacher's `WsServerEvent` is tagged for `serde_json`
//! round-tripping over the WebSocket surface.

use crate::candle::Candle;
use crate::clock::Millis;
use crate::external_orders::ThroughputMode;
use crate::orderbook::Level;
use crate::trader::{Side, Trade};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct SerializableCandle {
    pub open_ms: Millis,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl From<Candle> for SerializableCandle {
    fn from(c: Candle) -> Self {
        Self {
            open_ms: c.open_ms,
            open: c.open,
            high: c.high,
            low: c.low,
            close: c.close,
            volume: c.volume,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SerializableTrade {
    pub id: u64,
    pub clock: Millis,
    pub trader_id: String,
    pub action: String,
    pub price: f64,
    pub quantity: f64,
    pub notional: f64,
    pub impact: f64,
}

impl From<&Trade> for SerializableTrade {
    fn from(t: &Trade) -> Self {
        Self {
            id: t.id,
            clock: t.clock,
            trader_id: t.trader_id.clone(),
            action: match t.action() {
                Side::Buy => "buy".to_string(),
                Side::Sell => "sell".to_string(),
            },
            price: t.price,
            quantity: t.quantity,
            notional: t.notional,
            impact: t.impact,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SerializableLevel {
    pub price: f64,
    pub quantity: f64,
}

impl From<&Level> for SerializableLevel {
    fn from(l: &Level) -> Self {
        Self {
            price: l.price,
            quantity: l.quantity,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderBookSnapshot {
    pub bids: Vec<SerializableLevel>,
    pub asks: Vec<SerializableLevel>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThroughputMetricsSnapshot {
    pub actual_tps: f64,
    pub configured_tps: f64,
    pub queue_depth: usize,
    pub sentiment: String,
    pub dominant_archetype: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PriceUpdatePayload {
    pub session_id: Uuid,
    pub price: f64,
    pub candles: Vec<SerializableCandle>,
    pub trades: Vec<SerializableTrade>,
    pub order_book: OrderBookSnapshot,
    pub rankings: Vec<String>,
    pub metrics: ThroughputMetricsSnapshot,
    pub total_trades_processed: u64,
    pub throughput_mode: ThroughputMode,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    PriceUpdate(PriceUpdatePayload),
    ProcessedTrade(SerializableTrade),
    ExternalMarketPressure(ThroughputMetricsSnapshot),
    ScenarioStarted { name: String },
    ScenarioEnded { name: String },
    SimulationReset { session_id: Uuid },
    LiquidationCascadeTriggered { generated: usize, estimated_impact: f64, cascade_size: usize },
    SimulationStatus { session_id: Uuid, state: String, paused: bool },
}
