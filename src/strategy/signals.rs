use serde::{Deserialize, Serialize};

use crate::error::TradingError;
use crate::models::TradeSignal;
use crate::Result;

pub const DEFAULT_LOW_THRESHOLD: f64 = 35.0;
pub const DEFAULT_HIGH_THRESHOLD: f64 = 55.0;

/// Maps an oscillator reading to a trade decision
///
/// Readings strictly below `low_threshold` are oversold (Long), strictly
/// above `high_threshold` overbought (Short). The closed band
/// `[low_threshold, high_threshold]` is a no-trade zone.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalClassifier {
    pub low_threshold: f64,
    pub high_threshold: f64,
}

impl Default for SignalClassifier {
    fn default() -> Self {
        Self {
            low_threshold: DEFAULT_LOW_THRESHOLD,
            high_threshold: DEFAULT_HIGH_THRESHOLD,
        }
    }
}

impl SignalClassifier {
    pub fn new(low_threshold: f64, high_threshold: f64) -> Result<Self> {
        let classifier = Self {
            low_threshold,
            high_threshold,
        };
        classifier.validate()?;
        Ok(classifier)
    }

    pub fn validate(&self) -> Result<()> {
        let in_range = |v: f64| (0.0..=100.0).contains(&v);
        if !in_range(self.low_threshold) || !in_range(self.high_threshold) {
            return Err(TradingError::InvalidConfiguration(format!(
                "signal thresholds must be within 0-100 (low {}, high {})",
                self.low_threshold, self.high_threshold
            )));
        }
        if self.low_threshold >= self.high_threshold {
            return Err(TradingError::InvalidConfiguration(format!(
                "low threshold {} must be below high threshold {}",
                self.low_threshold, self.high_threshold
            )));
        }
        Ok(())
    }

    pub fn classify(&self, oscillator_value: f64) -> TradeSignal {
        if oscillator_value < self.low_threshold {
            TradeSignal::Long
        } else if oscillator_value > self.high_threshold {
            TradeSignal::Short
        } else {
            TradeSignal::None
        }
    }
}
