use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

use super::ExchangeGateway;
use crate::error::GatewayError;
use crate::models::{
    BalanceSnapshot, Candle, OrderRequest, OrderResult, OrderStatus, OrderType, RiskLevels,
    Side, Timeframe,
};

/// Gateway operations, for failure injection and call counting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    FetchCandles,
    FetchBalance,
    SubmitOrder,
    UpdateOrder,
    OrderStatus,
    FindOrder,
    SetLeverage,
}

#[derive(Debug, Clone)]
struct PaperOrder {
    order_id: String,
    client_order_id: Uuid,
    side: Side,
    size: f64,
    entry_price: f64,
    order_type: OrderType,
    stop_loss: f64,
    take_profit: f64,
    status: OrderStatus,
}

impl PaperOrder {
    fn result(&self) -> OrderResult {
        OrderResult {
            order_id: self.order_id.clone(),
            accepted_price: self.entry_price,
            status: self.status,
        }
    }

    fn pnl(&self, exit_price: f64) -> f64 {
        match self.side {
            Side::Buy => (exit_price - self.entry_price) * self.size,
            Side::Sell => (self.entry_price - exit_price) * self.size,
        }
    }
}

/// Seeded random walk that extends the candle history on every fetch
#[derive(Debug)]
struct PriceWalk {
    rng: StdRng,
    volatility: f64,
}

#[derive(Debug)]
struct PaperState {
    timeframe: Timeframe,
    candles: Vec<Candle>,
    cash_equity: f64,
    walk: Option<PriceWalk>,
    orders: Vec<PaperOrder>,
    submitted: Vec<OrderRequest>,
    client_ids: HashSet<Uuid>,
    failures: HashMap<Operation, VecDeque<GatewayError>>,
    lost_submit_replies: usize,
    calls: HashMap<Operation, usize>,
    closed: bool,
}

impl PaperState {
    /// Count the call and hand back an injected failure, if any
    fn enter(&mut self, op: Operation) -> Result<(), GatewayError> {
        *self.calls.entry(op).or_insert(0) += 1;
        if self.closed {
            return Err(GatewayError::Permanent("gateway closed".to_string()));
        }
        match self.failures.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn last_close(&self) -> Option<f64> {
        self.candles.last().map(|c| c.close)
    }

    fn advance(&mut self) {
        let Some(walk) = self.walk.as_mut() else {
            return;
        };
        let Some(last) = self.candles.last() else {
            return;
        };

        let change = walk.rng.gen_range(-walk.volatility..walk.volatility);
        let open = last.close;
        let close = (open * (1.0 + change)).max(f64::EPSILON);
        let wick = open.max(close) * walk.rng.gen_range(0.0..walk.volatility / 2.0);
        let candle = Candle {
            open_time: last.open_time + Duration::seconds(self.timeframe.as_secs()),
            open,
            high: open.max(close) + wick,
            low: (open.min(close) - wick).max(f64::EPSILON),
            close,
            volume: walk.rng.gen_range(500.0..1500.0),
        };

        self.settle(&candle);
        self.candles.push(candle);
    }

    /// Fill resting limit orders and trigger stops/targets within `candle`
    fn settle(&mut self, candle: &Candle) {
        for order in self.orders.iter_mut() {
            match order.status {
                OrderStatus::New if candle.low <= order.entry_price && order.entry_price <= candle.high => {
                    order.status = OrderStatus::Filled;
                }
                OrderStatus::Filled => {
                    let exit = match order.side {
                        Side::Buy if candle.low <= order.stop_loss => Some(order.stop_loss),
                        Side::Buy if candle.high >= order.take_profit => Some(order.take_profit),
                        Side::Sell if candle.high >= order.stop_loss => Some(order.stop_loss),
                        Side::Sell if candle.low <= order.take_profit => Some(order.take_profit),
                        _ => None,
                    };
                    if let Some(exit_price) = exit {
                        let pnl = order.pnl(exit_price);
                        self.cash_equity += pnl;
                        order.status = OrderStatus::Closed;
                        tracing::info!(
                            "[paper] {} closed @ ${:.4} (P&L ${:.2})",
                            order.order_id,
                            exit_price,
                            pnl
                        );
                    }
                }
                _ => {}
            }
        }
    }

    fn unrealized_pnl(&self) -> f64 {
        let Some(price) = self.last_close() else {
            return 0.0;
        };
        self.orders
            .iter()
            .filter(|o| o.status == OrderStatus::Filled)
            .map(|o| o.pnl(price))
            .sum()
    }
}

/// In-memory venue for dry runs and tests
///
/// Orders fill at their reference price. With a price walk attached
/// ([`PaperExchange::simulated`]) every candle fetch produces a new candle,
/// and open positions close when their stop-loss or take-profit is crossed.
pub struct PaperExchange {
    state: Mutex<PaperState>,
}

impl PaperExchange {
    /// Venue with `equity` and no candles
    pub fn new(equity: f64) -> Self {
        Self {
            state: Mutex::new(PaperState {
                timeframe: Timeframe::OneHour,
                candles: Vec::new(),
                cash_equity: equity,
                walk: None,
                orders: Vec::new(),
                submitted: Vec::new(),
                client_ids: HashSet::new(),
                failures: HashMap::new(),
                lost_submit_replies: 0,
                calls: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Venue whose prices follow a seeded random walk from `start_price`
    pub fn simulated(seed: u64, start_price: f64, equity: f64, timeframe: Timeframe) -> Self {
        let exchange = Self::new(equity);
        {
            let mut state = exchange.lock();
            state.timeframe = timeframe;
            state.walk = Some(PriceWalk {
                rng: StdRng::seed_from_u64(seed),
                volatility: 0.01,
            });
            let start = Utc::now() - Duration::seconds(timeframe.as_secs() * 200);
            state.candles = candles_from_closes(&[start_price], start, timeframe);
            // Pre-roll some history so indicators have data on the first cycle
            for _ in 0..199 {
                state.advance();
            }
        }
        exchange
    }

    fn lock(&self) -> MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace the candle history with one candle per close
    pub fn set_closes(&self, closes: &[f64]) {
        let mut state = self.lock();
        let timeframe = state.timeframe;
        let start = Utc::now() - Duration::seconds(timeframe.as_secs() * closes.len() as i64);
        state.candles = candles_from_closes(closes, start, timeframe);
    }

    /// Set account equity, excluding unrealized P&L
    pub fn set_equity(&self, equity: f64) {
        self.lock().cash_equity = equity;
    }

    /// Fail the next call to `op` with `error`; repeated calls queue up
    pub fn inject_failure(&self, op: Operation, error: GatewayError) {
        self.lock().failures.entry(op).or_default().push_back(error);
    }

    /// Accept the next order but answer with a timeout, as if the reply was lost
    pub fn lose_next_submit_reply(&self) {
        self.lock().lost_submit_replies += 1;
    }

    /// Number of calls made to `op`, failed ones included
    pub fn calls(&self, op: Operation) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn submitted_orders(&self) -> Vec<OrderRequest> {
        self.lock().submitted.clone()
    }

    /// Close every open position at `exit_price`, as if a stop or target hit
    pub fn close_open_position(&self, exit_price: f64) {
        let mut state = self.lock();
        let mut realized = 0.0;
        for order in state.orders.iter_mut() {
            if !order.status.is_terminal() {
                if order.status == OrderStatus::Filled {
                    realized += order.pnl(exit_price);
                }
                order.status = OrderStatus::Closed;
            }
        }
        state.cash_equity += realized;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn last_close(&self) -> Option<f64> {
        self.lock().last_close()
    }
}

/// Flat candles (open = high = low = close) spaced one `timeframe` apart
pub fn candles_from_closes(closes: &[f64], start: DateTime<Utc>, timeframe: Timeframe) -> Vec<Candle> {
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| Candle {
            open_time: start + Duration::seconds(timeframe.as_secs() * i as i64),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1000.0,
        })
        .collect()
}

#[async_trait]
impl ExchangeGateway for PaperExchange {
    async fn fetch_candles(
        &self,
        _symbol: &str,
        _timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, GatewayError> {
        let mut state = self.lock();
        state.enter(Operation::FetchCandles)?;
        state.advance();

        let skip = state.candles.len().saturating_sub(limit);
        Ok(state.candles[skip..].to_vec())
    }

    async fn fetch_balance(&self) -> Result<BalanceSnapshot, GatewayError> {
        let mut state = self.lock();
        state.enter(Operation::FetchBalance)?;

        Ok(BalanceSnapshot {
            as_of: Utc::now(),
            total_equity: state.cash_equity + state.unrealized_pnl(),
        })
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderResult, GatewayError> {
        let mut state = self.lock();
        state.enter(Operation::SubmitOrder)?;

        if !state.client_ids.insert(request.client_order_id) {
            return Err(GatewayError::Rejected(format!(
                "duplicate client order id {}",
                request.client_order_id
            )));
        }
        if !(request.size > 0.0) {
            return Err(GatewayError::Rejected(format!("invalid size {}", request.size)));
        }

        let status = match request.order_type {
            OrderType::Market => OrderStatus::Filled,
            OrderType::Limit => OrderStatus::New,
        };
        let order = PaperOrder {
            order_id: format!("paper-{}", state.orders.len() + 1),
            client_order_id: request.client_order_id,
            side: request.side,
            size: request.size,
            entry_price: request.entry_price,
            order_type: request.order_type,
            stop_loss: request.stop_loss,
            take_profit: request.take_profit,
            status,
        };
        tracing::debug!(
            "[paper] {} {:?} {} {:.4} @ ${:.4}",
            order.order_id,
            order.order_type,
            order.side.as_str(),
            order.size,
            order.entry_price
        );

        let result = order.result();
        state.orders.push(order);
        state.submitted.push(request.clone());

        if state.lost_submit_replies > 0 {
            state.lost_submit_replies -= 1;
            return Err(GatewayError::Transient("timeout waiting for reply".to_string()));
        }
        Ok(result)
    }

    async fn update_order(
        &self,
        _symbol: &str,
        order_id: &str,
        levels: &RiskLevels,
    ) -> Result<OrderResult, GatewayError> {
        let mut state = self.lock();
        state.enter(Operation::UpdateOrder)?;

        let order = state
            .orders
            .iter_mut()
            .find(|o| o.order_id == order_id)
            .ok_or_else(|| GatewayError::Rejected(format!("order {} not found", order_id)))?;
        if order.status.is_terminal() {
            return Err(GatewayError::Rejected(format!(
                "order {} is {:?}",
                order_id, order.status
            )));
        }

        order.stop_loss = levels.stop_loss;
        order.take_profit = levels.take_profit;
        Ok(order.result())
    }

    async fn order_status(&self, _symbol: &str, order_id: &str) -> Result<OrderStatus, GatewayError> {
        let mut state = self.lock();
        state.enter(Operation::OrderStatus)?;

        state
            .orders
            .iter()
            .find(|o| o.order_id == order_id)
            .map(|o| o.status)
            .ok_or_else(|| GatewayError::Rejected(format!("order {} not found", order_id)))
    }

    async fn find_order(
        &self,
        _symbol: &str,
        client_order_id: Uuid,
    ) -> Result<Option<OrderResult>, GatewayError> {
        let mut state = self.lock();
        state.enter(Operation::FindOrder)?;

        Ok(state
            .orders
            .iter()
            .find(|o| o.client_order_id == client_order_id)
            .map(PaperOrder::result))
    }

    async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> Result<(), GatewayError> {
        self.lock().enter(Operation::SetLeverage)
    }

    async fn close(&self) {
        let mut state = self.lock();
        if !state.closed {
            state.closed = true;
            tracing::debug!("[paper] gateway closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(side: Side, stop_loss: f64, take_profit: f64) -> OrderRequest {
        OrderRequest {
            client_order_id: Uuid::new_v4(),
            symbol: "BTCUSDT".to_string(),
            side,
            size: 2.0,
            order_type: OrderType::Market,
            entry_price: 100.0,
            leverage: 1,
            stop_loss,
            take_profit,
        }
    }

    #[tokio::test]
    async fn test_fetch_candles_respects_limit() {
        let exchange = PaperExchange::new(1000.0);
        exchange.set_closes(&[1.0, 2.0, 3.0, 4.0]);

        let candles = exchange
            .fetch_candles("BTCUSDT", Timeframe::OneHour, 2)
            .await
            .unwrap();
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        assert_eq!(closes, vec![3.0, 4.0]);
    }

    #[tokio::test]
    async fn test_duplicate_client_id_rejected() {
        let exchange = PaperExchange::new(1000.0);
        let req = request(Side::Buy, 90.0, 120.0);

        exchange.submit_order(&req).await.unwrap();
        let result = exchange.submit_order(&req).await;
        assert!(matches!(result, Err(GatewayError::Rejected(_))));
        assert_eq!(exchange.submitted_orders().len(), 1);
    }

    #[tokio::test]
    async fn test_lost_reply_order_is_still_live() {
        let exchange = PaperExchange::new(1000.0);
        let req = request(Side::Buy, 90.0, 120.0);
        exchange.lose_next_submit_reply();

        let result = exchange.submit_order(&req).await;
        assert!(matches!(result, Err(GatewayError::Transient(_))));

        let found = exchange.find_order("BTCUSDT", req.client_order_id).await.unwrap();
        assert_eq!(found.map(|o| o.status), Some(OrderStatus::Filled));
        assert_eq!(exchange.find_order("BTCUSDT", Uuid::new_v4()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_balance_includes_unrealized_pnl() {
        let exchange = PaperExchange::new(1000.0);
        exchange.set_closes(&[100.0]);
        exchange.submit_order(&request(Side::Sell, 130.0, 50.0)).await.unwrap();
        exchange.set_closes(&[90.0]);

        let balance = exchange.fetch_balance().await.unwrap();
        // Short 2 from 100 to 90
        assert_eq!(balance.total_equity, 1020.0);
    }

    #[tokio::test]
    async fn test_injected_failure_consumed_once() {
        let exchange = PaperExchange::new(1000.0);
        exchange.inject_failure(Operation::FetchBalance, GatewayError::Transient("503".into()));

        assert!(exchange.fetch_balance().await.is_err());
        assert!(exchange.fetch_balance().await.is_ok());
        assert_eq!(exchange.calls(Operation::FetchBalance), 2);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let exchange = PaperExchange::new(1000.0);
        exchange.close().await;
        exchange.close().await;

        assert!(exchange.is_closed());
        let result = exchange.fetch_balance().await;
        assert_eq!(result, Err(GatewayError::Permanent("gateway closed".into())));
    }

    #[tokio::test]
    async fn test_simulated_walk_is_seeded() {
        let a = PaperExchange::simulated(7, 100.0, 1000.0, Timeframe::OneHour);
        let b = PaperExchange::simulated(7, 100.0, 1000.0, Timeframe::OneHour);

        let ca = a.fetch_candles("X", Timeframe::OneHour, 50).await.unwrap();
        let cb = b.fetch_candles("X", Timeframe::OneHour, 50).await.unwrap();
        let closes_a: Vec<f64> = ca.iter().map(|c| c.close).collect();
        let closes_b: Vec<f64> = cb.iter().map(|c| c.close).collect();

        assert_eq!(ca.len(), 50);
        assert_eq!(closes_a, closes_b);
    }

    #[tokio::test]
    async fn test_walk_triggers_stop_loss() {
        let exchange = PaperExchange::simulated(1, 100.0, 1000.0, Timeframe::OneHour);
        let last = exchange.last_close().unwrap();
        let mut req = request(Side::Buy, last * 2.0, last * 3.0);
        req.entry_price = last;
        let order = exchange.submit_order(&req).await.unwrap();

        // Stop is above the market, so the next candle closes the position
        exchange.fetch_candles("X", Timeframe::OneHour, 10).await.unwrap();
        let status = exchange.order_status("X", &order.order_id).await.unwrap();
        assert_eq!(status, OrderStatus::Closed);
    }
}
