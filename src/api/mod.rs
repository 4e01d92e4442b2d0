pub mod bybit;
pub mod paper;

pub use bybit::BybitClient;
pub use paper::{Operation, PaperExchange};

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::models::{BalanceSnapshot, Candle, OrderRequest, OrderResult, OrderStatus, RiskLevels, Timeframe};

/// Venue operations the trading loop depends on
///
/// Every call may fail with [`GatewayError::Transient`] (worth retrying) or
/// [`GatewayError::Permanent`]; order calls may also be
/// [`GatewayError::Rejected`] by venue-side validation.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Recent candles, oldest first
    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, GatewayError>;

    async fn fetch_balance(&self) -> Result<BalanceSnapshot, GatewayError>;

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderResult, GatewayError>;

    /// Replace the stop-loss/take-profit attached to an open position
    async fn update_order(
        &self,
        symbol: &str,
        order_id: &str,
        levels: &RiskLevels,
    ) -> Result<OrderResult, GatewayError>;

    /// Current lifecycle status of a previously submitted order
    async fn order_status(&self, symbol: &str, order_id: &str) -> Result<OrderStatus, GatewayError>;

    /// Look up an order by the client order id it was submitted with
    ///
    /// `Ok(None)` means the venue has no such order.
    async fn find_order(
        &self,
        symbol: &str,
        client_order_id: Uuid,
    ) -> Result<Option<OrderResult>, GatewayError>;

    async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> Result<(), GatewayError> {
        Ok(())
    }

    /// Release held connections. Idempotent.
    async fn close(&self);
}

/// Shared gateways, e.g. a paper exchange inspected while the loop runs
#[async_trait]
impl<T: ExchangeGateway + ?Sized> ExchangeGateway for Arc<T> {
    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, GatewayError> {
        (**self).fetch_candles(symbol, timeframe, limit).await
    }

    async fn fetch_balance(&self) -> Result<BalanceSnapshot, GatewayError> {
        (**self).fetch_balance().await
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderResult, GatewayError> {
        (**self).submit_order(request).await
    }

    async fn update_order(
        &self,
        symbol: &str,
        order_id: &str,
        levels: &RiskLevels,
    ) -> Result<OrderResult, GatewayError> {
        (**self).update_order(symbol, order_id, levels).await
    }

    async fn order_status(&self, symbol: &str, order_id: &str) -> Result<OrderStatus, GatewayError> {
        (**self).order_status(symbol, order_id).await
    }

    async fn find_order(
        &self,
        symbol: &str,
        client_order_id: Uuid,
    ) -> Result<Option<OrderResult>, GatewayError> {
        (**self).find_order(symbol, client_order_id).await
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), GatewayError> {
        (**self).set_leverage(symbol, leverage).await
    }

    async fn close(&self) {
        (**self).close().await
    }
}
