use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// OHLCV candlestick, immutable once fetched
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Candle timeframe
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "1d")]
    OneDay,
}

impl Timeframe {
    pub fn as_secs(&self) -> i64 {
        match self {
            Timeframe::OneMinute => 60,
            Timeframe::FiveMinutes => 300,
            Timeframe::FifteenMinutes => 900,
            Timeframe::OneHour => 3_600,
            Timeframe::FourHours => 14_400,
            Timeframe::OneDay => 86_400,
        }
    }

    /// Interval code used by the Bybit kline endpoint
    pub fn as_bybit_interval(&self) -> &'static str {
        match self {
            Timeframe::OneMinute => "1",
            Timeframe::FiveMinutes => "5",
            Timeframe::FifteenMinutes => "15",
            Timeframe::OneHour => "60",
            Timeframe::FourHours => "240",
            Timeframe::OneDay => "D",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Timeframe::OneMinute => "1m",
            Timeframe::FiveMinutes => "5m",
            Timeframe::FifteenMinutes => "15m",
            Timeframe::OneHour => "1h",
            Timeframe::FourHours => "4h",
            Timeframe::OneDay => "1d",
        };
        f.write_str(label)
    }
}

/// Trading signal
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TradeSignal {
    Long,
    Short,
    None,
}

impl TradeSignal {
    /// Order side for an entry, `None` for the no-trade signal
    pub fn side(&self) -> Option<Side> {
        match self {
            TradeSignal::Long => Some(Side::Buy),
            TradeSignal::Short => Some(Side::Sell),
            TradeSignal::None => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "Buy",
            Side::Sell => "Sell",
        }
    }

    pub fn signal(&self) -> TradeSignal {
        match self {
            Side::Buy => TradeSignal::Long,
            Side::Sell => TradeSignal::Short,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    #[default]
    Market,
    /// Limit order priced at the latest close
    Limit,
}

/// Stop-loss and take-profit prices for one direction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RiskLevels {
    pub stop_loss: f64,
    pub take_profit: f64,
}

/// Order as sent to the venue; never mutated after submission
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderRequest {
    /// Reused across retries so the venue can deduplicate
    pub client_order_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub order_type: OrderType,
    /// Latest close at decision time; the limit price for limit orders
    pub entry_price: f64,
    pub leverage: u32,
    pub stop_loss: f64,
    pub take_profit: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Closed,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    /// Terminal statuses release the managed position
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Closed | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }
}

/// Venue acknowledgement of a submitted order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderResult {
    pub order_id: String,
    pub accepted_price: f64,
    pub status: OrderStatus,
}

/// The single position currently under management
#[derive(Debug, Clone, PartialEq)]
pub struct ManagedPosition {
    pub order: OrderResult,
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub risk: RiskLevels,
    pub opened_at: DateTime<Utc>,
}

impl ManagedPosition {
    pub fn is_open(&self) -> bool {
        !self.order.status.is_terminal()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BalanceSnapshot {
    pub as_of: DateTime<Utc>,
    pub total_equity: f64,
}

/// Drawdown bookkeeping, recomputed on every balance update
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct DrawdownState {
    pub peak_equity: Option<f64>,
    pub current_equity: f64,
    pub drawdown_pct: f64,
    pub tripped: bool,
    /// Timestamp of the snapshot this state reflects
    pub as_of: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_sides() {
        assert_eq!(TradeSignal::Long.side(), Some(Side::Buy));
        assert_eq!(TradeSignal::Short.side(), Some(Side::Sell));
        assert_eq!(TradeSignal::None.side(), None);
        assert_eq!(Side::Sell.signal(), TradeSignal::Short);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(OrderStatus::Closed.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(!OrderStatus::New.is_terminal());
        assert!(!OrderStatus::Filled.is_terminal());
    }

    #[test]
    fn test_timeframe_parsing() {
        let tf: Timeframe = serde_json::from_str("\"1h\"").unwrap();
        assert_eq!(tf, Timeframe::OneHour);
        assert_eq!(tf.as_bybit_interval(), "60");
        assert_eq!(tf.to_string(), "1h");
        assert_eq!(tf.as_secs(), 3600);
    }
}
