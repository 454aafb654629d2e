//! Scenario Engine
//!
//! Per the redesign note in the data model: scenarios are a pluggable
//! strategy the price engine consumes as a single `Bias` value each tick,
//! rather than a `match` over scenario kind sprinkled through the price
//! update. Each variant below is a tiny struct implementing `ScenarioBias`.

use std::fmt;

/// Output a scenario contributes to one price-engine tick.
#[derive(Debug, Clone, Copy)]
pub struct Bias {
    pub trend_override: Option<f64>,
    pub vol_multiplier: f64,
}

impl Default for Bias {
    fn default() -> Self {
        Self {
            trend_override: None,
            vol_multiplier: 1.0,
        }
    }
}

pub trait ScenarioBias: Send + Sync {
    fn name(&self) -> &'static str;
    /// Called once per tick with the elapsed fraction of the scenario's
    /// configured lifetime in `[0, 1]`.
    fn bias(&self, progress: f64) -> Bias;
    fn is_finished(&self, progress: f64) -> bool {
        progress >= 1.0
    }
}

macro_rules! intensity_scenario {
    ($name:ident, $label:literal, $trend_fn:expr, $vol_mult:expr) => {
        #[derive(Debug, Clone, Copy)]
        pub struct $name {
            pub intensity: f64,
        }

        impl ScenarioBias for $name {
            fn name(&self) -> &'static str {
                $label
            }

            fn bias(&self, progress: f64) -> Bias {
                let trend_fn: fn(f64, f64) -> f64 = $trend_fn;
                Bias {
                    trend_override: Some(trend_fn(self.intensity, progress)),
                    vol_multiplier: $vol_mult,
                }
            }
        }
    };
}

intensity_scenario!(Crash, "crash", |i, p| -i * (1.0 - p * 0.3), 2.5);
intensity_scenario!(Pump, "pump", |i, p| i * (1.0 - p * 0.3), 2.2);
intensity_scenario!(Breakout, "breakout", |i, p| i * 0.6, 1.8);
intensity_scenario!(Trend, "trend", |i, _p| i * 0.3, 1.2);
intensity_scenario!(Consolidation, "consolidation", |_i, _p| 0.0, 0.5);
intensity_scenario!(Accumulation, "accumulation", |i, _p| i * 0.05, 0.7);
intensity_scenario!(Distribution, "distribution", |i, _p| -i * 0.05, 0.7);

impl fmt::Display for Bias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Bias{{trend={:?}, vol_mult={:.2}}}",
            self.trend_override, self.vol_multiplier
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_produces_negative_trend() {
        let crash = Crash { intensity: 0.5 };
        let bias = crash.bias(0.0);
        assert!(bias.trend_override.unwrap() < 0.0);
        assert!(bias.vol_multiplier > 1.0);
    }

    #[test]
    fn consolidation_is_flat() {
        let c = Consolidation { intensity: 0.9 };
        let bias = c.bias(0.5);
        assert_eq!(bias.trend_override, Some(0.0));
    }
}
