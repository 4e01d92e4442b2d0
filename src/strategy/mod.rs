// Trading strategy module
pub mod momentum;
pub mod signals;

pub use momentum::{RsiStrategy, SignalReading};
pub use signals::SignalClassifier;

use crate::models::{Candle, TradeSignal};
use crate::Result;

/// Base trait for all trading strategies
pub trait Strategy: Send + Sync {
    /// Generate a trading signal based on market data
    fn generate_signal(&self, candles: &[Candle]) -> Result<TradeSignal>;

    /// Get strategy name
    fn name(&self) -> &str;

    /// Minimum candles required for this strategy
    fn min_candles_required(&self) -> usize;
}
