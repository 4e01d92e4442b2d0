// Risk management module
pub mod drawdown;
pub mod stop_loss;

pub use drawdown::DrawdownMonitor;
pub use stop_loss::{compute_stop_loss, compute_take_profit, RiskCalculator, StopLossMode};
