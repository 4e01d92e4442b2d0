use super::{signals::SignalClassifier, Strategy};
use crate::indicators::calculate_rsi;
use crate::models::{Candle, TradeSignal};
use crate::Result;

/// Oscillator reading and the decision derived from it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalReading {
    pub rsi: f64,
    pub signal: TradeSignal,
}

/// RSI mean-reversion strategy
///
/// Buys oversold and sells overbought readings of a short-period RSI over
/// candle closes. Stateless: every call only looks at the candles given.
#[derive(Debug, Clone)]
pub struct RsiStrategy {
    rsi_period: usize,
    classifier: SignalClassifier,
}

impl RsiStrategy {
    pub fn new(rsi_period: usize, classifier: SignalClassifier) -> Self {
        Self {
            rsi_period,
            classifier,
        }
    }

    pub fn rsi_period(&self) -> usize {
        self.rsi_period
    }

    /// Compute the RSI of the closes and classify it
    pub fn evaluate(&self, candles: &[Candle]) -> Result<SignalReading> {
        let closes = Self::extract_prices(candles);
        let rsi = calculate_rsi(&closes, self.rsi_period)?;

        Ok(SignalReading {
            rsi,
            signal: self.classifier.classify(rsi),
        })
    }

    fn extract_prices(candles: &[Candle]) -> Vec<f64> {
        candles.iter().map(|c| c.close).collect()
    }
}

impl Default for RsiStrategy {
    fn default() -> Self {
        Self::new(2, SignalClassifier::default())
    }
}

impl Strategy for RsiStrategy {
    fn generate_signal(&self, candles: &[Candle]) -> Result<TradeSignal> {
        Ok(self.evaluate(candles)?.signal)
    }

    fn name(&self) -> &str {
        "RsiStrategy"
    }

    fn min_candles_required(&self) -> usize {
        self.rsi_period + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TradingError;
    use chrono::{Duration, Utc};

    fn create_test_candles(prices: &[f64]) -> Vec<Candle> {
        let start = Utc::now() - Duration::hours(prices.len() as i64);
        prices
            .iter()
            .enumerate()
            .map(|(i, &price)| Candle {
                open_time: start + Duration::hours(i as i64),
                open: price,
                high: price * 1.01,
                low: price * 0.99,
                close: price,
                volume: 1000.0,
            })
            .collect()
    }

    #[test]
    fn test_strategy_requires_sufficient_data() {
        let strategy = RsiStrategy::new(14, SignalClassifier::default());
        let candles = create_test_candles(&[100.0, 101.0]);

        let result = strategy.generate_signal(&candles);
        assert_eq!(
            result,
            Err(TradingError::InsufficientData { have: 2, need: 15 })
        );
    }

    #[test]
    fn test_downtrend_generates_long() {
        let strategy = RsiStrategy::default();
        let candles = create_test_candles(&[100.0, 93.0, 96.0]);

        let reading = strategy.evaluate(&candles).unwrap();
        assert!((reading.rsi - 30.0).abs() < 1e-9);
        assert_eq!(reading.signal, TradeSignal::Long);
    }

    #[test]
    fn test_uptrend_generates_short() {
        let strategy = RsiStrategy::default();
        let prices: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        let candles = create_test_candles(&prices);

        assert_eq!(strategy.generate_signal(&candles).unwrap(), TradeSignal::Short);
    }

    #[test]
    fn test_strategy_name() {
        let strategy = RsiStrategy::default();
        assert_eq!(strategy.name(), "RsiStrategy");
    }

    #[test]
    fn test_min_candles_required() {
        let strategy = RsiStrategy::new(14, SignalClassifier::default());
        assert_eq!(strategy.min_candles_required(), 15);
    }
}
