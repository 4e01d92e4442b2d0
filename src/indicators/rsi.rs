use crate::error::TradingError;
use crate::Result;

/// Calculate Relative Strength Index (RSI) with Wilder smoothing
///
/// The first average gain/loss is the simple mean of the first `period`
/// close-to-close deltas; each later delta is folded in as
/// `avg = (avg * (period - 1) + delta) / period`. Only the last value of the
/// series is returned.
///
/// Values:
/// - RSI > 70: Overbought
/// - RSI < 30: Oversold
///
/// Needs at least `period + 1` closes.
pub fn calculate_rsi(prices: &[f64], period: usize) -> Result<f64> {
    if period == 0 {
        return Err(TradingError::InvalidConfiguration(
            "RSI period must be positive".to_string(),
        ));
    }
    if prices.len() < period + 1 {
        return Err(TradingError::InsufficientData {
            have: prices.len(),
            need: period + 1,
        });
    }

    let mut deltas = prices.windows(2).map(|w| w[1] - w[0]);

    // Seed with the simple average of the first window
    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for change in deltas.by_ref().take(period) {
        if change > 0.0 {
            avg_gain += change;
        } else if change < 0.0 {
            avg_loss += change.abs();
        }
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;

    let smoothing = (period - 1) as f64;
    for change in deltas {
        let gain = if change > 0.0 { change } else { 0.0 };
        let loss = if change < 0.0 { change.abs() } else { 0.0 };
        avg_gain = (avg_gain * smoothing + gain) / period as f64;
        avg_loss = (avg_loss * smoothing + loss) / period as f64;
    }

    if avg_loss == 0.0 {
        return Ok(100.0);
    }

    let rs = avg_gain / avg_loss;
    Ok(100.0 - (100.0 / (1.0 + rs)))
}
