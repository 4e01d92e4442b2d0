// Core modules
pub mod api;
pub mod bot;
pub mod config;
pub mod error;
pub mod execution;
pub mod indicators;
pub mod logging;
pub mod models;
pub mod risk;
pub mod strategy;

// Re-export commonly used types
pub use api::ExchangeGateway;
pub use bot::{BotHandle, BotState, CycleOutcome, TradingBot};
pub use config::BotConfig;
pub use error::{GatewayError, TradingError};
pub use models::*;
pub use strategy::Strategy;

// Error handling
pub type Result<T> = std::result::Result<T, TradingError>;
