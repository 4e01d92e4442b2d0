use serde::{Deserialize, Serialize};

use crate::error::TradingError;
use crate::models::{Candle, RiskLevels, TradeSignal};
use crate::Result;

/// When stop-loss levels are recomputed
///
/// Both modes price levels with the same formula. `Dynamic` additionally
/// re-prices the open position from the latest close on a separate timer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StopLossMode {
    Static,
    #[default]
    Dynamic,
}

/// Stop-loss price `coefficient` away from `latest_close`, against the trade
pub fn compute_stop_loss(latest_close: f64, direction: TradeSignal, coefficient: f64) -> Result<f64> {
    let adjustment = adjustment(latest_close, coefficient)?;
    match direction {
        TradeSignal::Long => Ok(latest_close - adjustment),
        TradeSignal::Short => Ok(latest_close + adjustment),
        TradeSignal::None => Err(TradingError::InvalidDirection(direction)),
    }
}

/// Take-profit price `coefficient` away from `latest_close`, with the trade
pub fn compute_take_profit(
    latest_close: f64,
    direction: TradeSignal,
    coefficient: f64,
) -> Result<f64> {
    let adjustment = adjustment(latest_close, coefficient)?;
    match direction {
        TradeSignal::Long => Ok(latest_close + adjustment),
        TradeSignal::Short => Ok(latest_close - adjustment),
        TradeSignal::None => Err(TradingError::InvalidDirection(direction)),
    }
}

fn adjustment(latest_close: f64, coefficient: f64) -> Result<f64> {
    if !(coefficient > 0.0) || !coefficient.is_finite() {
        return Err(TradingError::InvalidConfiguration(format!(
            "risk coefficient must be positive, got {}",
            coefficient
        )));
    }
    if !(latest_close > 0.0) || !latest_close.is_finite() {
        return Err(TradingError::InvalidPrice(latest_close));
    }
    Ok(latest_close * coefficient)
}

/// Prices stop-loss and take-profit levels from candle data
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskCalculator {
    pub mode: StopLossMode,
    pub stop_loss_coef: f64,
    pub take_profit_coef: f64,
}

impl Default for RiskCalculator {
    fn default() -> Self {
        Self {
            mode: StopLossMode::Dynamic,
            stop_loss_coef: 0.25,
            take_profit_coef: 0.5,
        }
    }
}

impl RiskCalculator {
    pub fn new(mode: StopLossMode, stop_loss_coef: f64, take_profit_coef: f64) -> Self {
        Self {
            mode,
            stop_loss_coef,
            take_profit_coef,
        }
    }

    pub fn is_dynamic(&self) -> bool {
        self.mode == StopLossMode::Dynamic
    }

    /// Levels for `direction` priced off the last candle's close
    pub fn levels(&self, candles: &[Candle], direction: TradeSignal) -> Result<RiskLevels> {
        let latest = candles
            .last()
            .ok_or(TradingError::InsufficientData { have: 0, need: 1 })?;
        self.levels_at(latest.close, direction)
    }

    pub fn levels_at(&self, latest_close: f64, direction: TradeSignal) -> Result<RiskLevels> {
        Ok(RiskLevels {
            stop_loss: compute_stop_loss(latest_close, direction, self.stop_loss_coef)?,
            take_profit: compute_take_profit(latest_close, direction, self.take_profit_coef)?,
        })
    }
}
