use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use config::builder::DefaultState;
use config::ConfigBuilder;
use serde::{Deserialize, Serialize};

use crate::error::TradingError;
use crate::execution::RetryPolicy;
use crate::models::{OrderType, Timeframe};
use crate::risk::{DrawdownMonitor, RiskCalculator, StopLossMode};
use crate::strategy::{RsiStrategy, SignalClassifier};
use crate::Result;

/// Environment variable prefix, e.g. `RSIBOT_MAX_DRAWDOWN_PCT=15`
pub const ENV_PREFIX: &str = "RSIBOT";

/// Everything the trading loop needs to know, with named and typed fields
///
/// Credentials are deliberately absent; they come from the environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub symbol: String,
    pub timeframe: Timeframe,
    /// Order size in base currency
    pub position_size: f64,
    pub leverage: u32,
    pub rsi_period: usize,
    /// Candles fetched per cycle
    pub candle_limit: usize,
    pub low_threshold: f64,
    pub high_threshold: f64,
    pub stop_loss_coef: f64,
    pub take_profit_coef: f64,
    pub stop_loss_mode: StopLossMode,
    pub max_drawdown_pct: f64,
    pub cycle_interval_secs: u64,
    pub dynamic_sl_interval_secs: u64,
    /// Total attempts per gateway call, the first one included
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub order_type: OrderType,
    /// Keep refreshing the open position's stop-loss while the drawdown breaker is tripped
    pub manage_position_while_tripped: bool,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            timeframe: Timeframe::OneHour,
            position_size: 0.01,
            leverage: 1,
            rsi_period: 2,
            candle_limit: 200,
            low_threshold: 35.0,
            high_threshold: 55.0,
            stop_loss_coef: 0.25,
            take_profit_coef: 0.5,
            stop_loss_mode: StopLossMode::Dynamic,
            max_drawdown_pct: 20.0,
            cycle_interval_secs: 60,
            dynamic_sl_interval_secs: 60,
            retry_attempts: 3,
            retry_base_delay_ms: 1_000,
            order_type: OrderType::Market,
            manage_position_while_tripped: true,
        }
    }
}

impl BotConfig {
    /// Load defaults, then the optional TOML file, then `RSIBOT_*` env vars
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .try_parsing(true),
        );

        let config = Self::from_builder(builder)?;
        tracing::debug!("Loaded configuration: {:?}", config);
        Ok(config)
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> anyhow::Result<Self> {
        let settings = builder.build().context("Failed to read configuration")?;
        let config: Self = settings
            .try_deserialize()
            .context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the loop cannot run with
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(TradingError::InvalidConfiguration(msg));

        if self.symbol.trim().is_empty() {
            return invalid("symbol must not be empty".into());
        }
        if !(self.position_size > 0.0) || !self.position_size.is_finite() {
            return invalid(format!("position_size must be positive, got {}", self.position_size));
        }
        if self.leverage == 0 {
            return invalid("leverage must be at least 1".into());
        }
        if self.rsi_period == 0 {
            return invalid("rsi_period must be at least 1".into());
        }
        if self.candle_limit <= self.rsi_period {
            return invalid(format!(
                "candle_limit ({}) must exceed rsi_period ({})",
                self.candle_limit, self.rsi_period
            ));
        }
        self.classifier()?;
        if !(self.stop_loss_coef > 0.0 && self.stop_loss_coef < 1.0) {
            return invalid(format!(
                "stop_loss_coef must be in (0, 1), got {}",
                self.stop_loss_coef
            ));
        }
        if !(self.take_profit_coef > 0.0) || !self.take_profit_coef.is_finite() {
            return invalid(format!(
                "take_profit_coef must be positive, got {}",
                self.take_profit_coef
            ));
        }
        self.drawdown_monitor()?;
        if self.cycle_interval_secs == 0 || self.dynamic_sl_interval_secs == 0 {
            return invalid("intervals must be at least one second".into());
        }
        if self.retry_attempts == 0 {
            return invalid("retry_attempts must be at least 1".into());
        }
        Ok(())
    }

    pub fn classifier(&self) -> Result<SignalClassifier> {
        SignalClassifier::new(self.low_threshold, self.high_threshold)
    }

    pub fn strategy(&self) -> Result<RsiStrategy> {
        Ok(RsiStrategy::new(self.rsi_period, self.classifier()?))
    }

    pub fn risk_calculator(&self) -> RiskCalculator {
        RiskCalculator::new(self.stop_loss_mode, self.stop_loss_coef, self.take_profit_coef)
    }

    pub fn drawdown_monitor(&self) -> Result<DrawdownMonitor> {
        DrawdownMonitor::new(self.max_drawdown_pct)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
        )
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }

    pub fn dynamic_sl_interval(&self) -> Duration {
        Duration::from_secs(self.dynamic_sl_interval_secs)
    }
}
