use thiserror::Error;

use crate::models::TradeSignal;

/// Failures reported by an exchange gateway
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    /// Network error, timeout, rate limit or 5xx; safe to retry
    #[error("transient gateway error: {0}")]
    Transient(String),
    /// Auth failure, closed gateway or other unrecoverable condition
    #[error("permanent gateway error: {0}")]
    Permanent(String),
    /// Venue-side validation failure (bad params, insufficient balance)
    #[error("rejected by venue: {0}")]
    Rejected(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Transient(_) => "transient",
            GatewayError::Permanent(_) => "permanent",
            GatewayError::Rejected(_) => "rejected",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TradingError {
    #[error("insufficient data: {have} candles, need {need}")]
    InsufficientData { have: usize, need: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("invalid direction {0:?}: expected Long or Short")]
    InvalidDirection(TradeSignal),

    #[error("invalid price {0}")]
    InvalidPrice(f64),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}
