use chrono::Utc;
use uuid::Uuid;

use crate::api::ExchangeGateway;
use crate::error::GatewayError;
use crate::execution::RetryPolicy;
use crate::models::{
    ManagedPosition, OrderRequest, OrderResult, OrderStatus, OrderType, RiskLevels, TradeSignal,
};
use crate::Result;

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionAction {
    Submitted(OrderResult),
    Skip,
}

#[derive(Debug, Clone)]
pub struct ExecutionDecision {
    pub action: ExecutionAction,
    pub reason: String,
}

impl ExecutionDecision {
    fn skip(reason: impl Into<String>) -> Self {
        Self {
            action: ExecutionAction::Skip,
            reason: reason.into(),
        }
    }
}

/// Turns signals into orders and owns the at-most-one-position rule
///
/// The managed position itself lives with the caller and is passed in by
/// reference, so the coordinator holds no state between cycles.
#[derive(Debug, Clone)]
pub struct OrderCoordinator {
    symbol: String,
    order_type: OrderType,
    leverage: u32,
    retry: RetryPolicy,
}

impl OrderCoordinator {
    pub fn new(symbol: String, order_type: OrderType, leverage: u32, retry: RetryPolicy) -> Self {
        Self {
            symbol,
            order_type,
            leverage,
            retry,
        }
    }

    /// Submit an entry order for `signal` unless there is nothing to do
    ///
    /// No gateway call is made for [`TradeSignal::None`] or while `position`
    /// is still open. Transient submission failures are retried with the
    /// same client order id, and shutdown does not cut them short. When
    /// submission still fails, the venue is asked for the client order id
    /// and an order it already holds is adopted as the position.
    pub async fn execute<G>(
        &self,
        gateway: &G,
        position: &mut Option<ManagedPosition>,
        signal: TradeSignal,
        levels: &RiskLevels,
        size: f64,
        entry_price: f64,
    ) -> Result<ExecutionDecision>
    where
        G: ExchangeGateway + ?Sized,
    {
        let side = match signal.side() {
            Some(side) => side,
            None => return Ok(ExecutionDecision::skip("No signal")),
        };

        // Check: Do we already manage a position?
        if let Some(open) = position.as_ref().filter(|p| p.is_open()) {
            tracing::info!(
                "  Skipping {:?} entry: position {} still open",
                signal,
                open.order.order_id
            );
            return Ok(ExecutionDecision::skip(format!(
                "Already have open position {}",
                open.order.order_id
            )));
        }

        let request = OrderRequest {
            client_order_id: Uuid::new_v4(),
            symbol: self.symbol.clone(),
            side,
            size,
            order_type: self.order_type,
            entry_price,
            leverage: self.leverage,
            stop_loss: levels.stop_loss,
            take_profit: levels.take_profit,
        };

        tracing::info!(
            "  → Submitting {} {:.4} {} @ ~${:.4} (SL ${:.4}, TP ${:.4})",
            side.as_str(),
            size,
            self.symbol,
            entry_price,
            levels.stop_loss,
            levels.take_profit
        );

        let result = match self
            .retry
            .run_to_completion("submit_order", || gateway.submit_order(&request))
            .await
        {
            Ok(result) => result,
            Err(e) => self.adopt(gateway, &request, e).await?,
        };

        tracing::info!(
            "  ✓ Order {} accepted @ ${:.4} ({:?})",
            result.order_id,
            result.accepted_price,
            result.status
        );

        *position = Some(ManagedPosition {
            order: result.clone(),
            symbol: self.symbol.clone(),
            side,
            size,
            risk: *levels,
            opened_at: Utc::now(),
        });

        Ok(ExecutionDecision {
            action: ExecutionAction::Submitted(result),
            reason: format!("{:?} signal with no open position", signal),
        })
    }

    /// Look for an order the venue accepted although its reply never arrived
    async fn adopt<G>(
        &self,
        gateway: &G,
        request: &OrderRequest,
        error: GatewayError,
    ) -> Result<OrderResult>
    where
        G: ExchangeGateway + ?Sized,
    {
        match self
            .retry
            .run("find_order", || {
                gateway.find_order(&self.symbol, request.client_order_id)
            })
            .await
        {
            Ok(Some(result)) => {
                tracing::warn!(
                    "Submission of {} failed ({}) but the venue holds it as {}. Adopting",
                    request.client_order_id,
                    error,
                    result.order_id
                );
                Ok(result)
            }
            Ok(None) => Err(error.into()),
            Err(lookup) => {
                tracing::error!(
                    "Submission of {} failed ({}) and the lookup failed too ({})",
                    request.client_order_id,
                    error,
                    lookup
                );
                Err(error.into())
            }
        }
    }

    /// Ask the venue whether the managed position is still open
    ///
    /// A terminal status releases the position. If the venue cannot be
    /// reached the position is kept.
    pub async fn reconcile<G>(&self, gateway: &G, position: &mut Option<ManagedPosition>)
    where
        G: ExchangeGateway + ?Sized,
    {
        let Some(current) = position.as_mut() else {
            return;
        };

        let order_id = current.order.order_id.clone();
        match self
            .retry
            .run("order_status", || gateway.order_status(&self.symbol, &order_id))
            .await
        {
            Ok(status) => {
                current.order.status = status;
                if status.is_terminal() {
                    tracing::info!("✓ Position {} finished ({:?})", order_id, status);
                    *position = None;
                }
            }
            Err(e) => {
                tracing::warn!(
                    "Could not reconcile position {} ({}): {}. Keeping it as open",
                    order_id,
                    e.kind(),
                    e
                );
            }
        }
    }

    /// Push new risk levels for the open position to the venue
    ///
    /// Returns `Ok(true)` when the venue accepted new levels, `Ok(false)`
    /// when there was nothing to update. An entry that has not filled yet
    /// has no position to attach levels to and is left alone.
    pub async fn refresh_risk_levels<G>(
        &self,
        gateway: &G,
        position: &mut Option<ManagedPosition>,
        levels: &RiskLevels,
    ) -> Result<bool>
    where
        G: ExchangeGateway + ?Sized,
    {
        let Some(current) = position.as_mut().filter(|p| p.is_open()) else {
            return Ok(false);
        };
        if current.risk == *levels {
            return Ok(false);
        }
        if current.order.status == OrderStatus::New {
            tracing::debug!(
                "Order {} not filled yet, keeping levels",
                current.order.order_id
            );
            return Ok(false);
        }

        let order_id = current.order.order_id.clone();
        let result = self
            .retry
            .run("update_order", || {
                gateway.update_order(&self.symbol, &order_id, levels)
            })
            .await?;

        tracing::info!(
            "  ✓ Position {} levels moved: SL ${:.4} → ${:.4}, TP ${:.4} → ${:.4}",
            order_id,
            current.risk.stop_loss,
            levels.stop_loss,
            current.risk.take_profit,
            levels.take_profit
        );

        current.risk = *levels;
        current.order.status = result.status;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Operation, PaperExchange};
    use crate::error::{GatewayError, TradingError};
    use crate::models::Side;
    use tokio::time::Duration;

    fn coordinator() -> OrderCoordinator {
        OrderCoordinator::new(
            "BTCUSDT".to_string(),
            OrderType::Market,
            1,
            RetryPolicy::new(3, Duration::from_millis(10)),
        )
    }

    fn levels() -> RiskLevels {
        RiskLevels {
            stop_loss: 75.0,
            take_profit: 150.0,
        }
    }

    #[tokio::test]
    async fn test_no_signal_makes_no_call() {
        let exchange = PaperExchange::new(10_000.0);
        let mut position = None;

        let decision = coordinator()
            .execute(&exchange, &mut position, TradeSignal::None, &levels(), 0.01, 100.0)
            .await
            .unwrap();

        assert_eq!(decision.action, ExecutionAction::Skip);
        assert!(decision.reason.contains("No signal"));
        assert_eq!(exchange.calls(Operation::SubmitOrder), 0);
        assert!(position.is_none());
    }

    #[tokio::test]
    async fn test_execute_long_opens_position() {
        let exchange = PaperExchange::new(10_000.0);
        let mut position = None;

        let decision = coordinator()
            .execute(&exchange, &mut position, TradeSignal::Long, &levels(), 0.01, 100.0)
            .await
            .unwrap();

        assert!(matches!(decision.action, ExecutionAction::Submitted(_)));
        let managed = position.expect("position should be open");
        assert_eq!(managed.side, Side::Buy);
        assert_eq!(managed.size, 0.01);
        assert_eq!(managed.risk, levels());

        let orders = exchange.submitted_orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].side, Side::Buy);
        assert_eq!(orders[0].stop_loss, 75.0);
        assert_eq!(orders[0].take_profit, 150.0);
    }

    #[tokio::test]
    async fn test_skip_when_already_positioned() {
        let exchange = PaperExchange::new(10_000.0);
        let coordinator = coordinator();
        let mut position = None;

        coordinator
            .execute(&exchange, &mut position, TradeSignal::Long, &levels(), 0.01, 100.0)
            .await
            .unwrap();
        let decision = coordinator
            .execute(&exchange, &mut position, TradeSignal::Short, &levels(), 0.01, 100.0)
            .await
            .unwrap();

        assert_eq!(decision.action, ExecutionAction::Skip);
        assert!(decision.reason.contains("Already have open position"));
        assert_eq!(exchange.calls(Operation::SubmitOrder), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_submit_is_retried_with_same_client_id() {
        let exchange = PaperExchange::new(10_000.0);
        exchange.inject_failure(Operation::SubmitOrder, GatewayError::Transient("timeout".into()));
        let mut position = None;

        let decision = coordinator()
            .execute(&exchange, &mut position, TradeSignal::Long, &levels(), 0.01, 100.0)
            .await
            .unwrap();

        assert!(matches!(decision.action, ExecutionAction::Submitted(_)));
        assert_eq!(exchange.calls(Operation::SubmitOrder), 2);
        // Only the successful attempt created an order
        assert_eq!(exchange.submitted_orders().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_submit_reply_adopts_live_order() {
        let exchange = PaperExchange::new(10_000.0);
        exchange.lose_next_submit_reply();
        let mut position = None;

        // Second attempt is refused as a duplicate client order id
        let decision = coordinator()
            .execute(&exchange, &mut position, TradeSignal::Long, &levels(), 0.01, 100.0)
            .await
            .unwrap();

        assert!(matches!(decision.action, ExecutionAction::Submitted(_)));
        assert_eq!(exchange.calls(Operation::SubmitOrder), 2);
        assert_eq!(exchange.calls(Operation::FindOrder), 1);
        assert_eq!(exchange.submitted_orders().len(), 1);

        let managed = position.expect("live order should be managed");
        assert_eq!(managed.order.order_id, "paper-1");
        assert_eq!(managed.order.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn test_rejection_is_surfaced_without_retry() {
        let exchange = PaperExchange::new(10_000.0);
        exchange.inject_failure(
            Operation::SubmitOrder,
            GatewayError::Rejected("insufficient balance".into()),
        );
        let mut position = None;

        let result = coordinator()
            .execute(&exchange, &mut position, TradeSignal::Long, &levels(), 0.01, 100.0)
            .await;

        assert!(matches!(
            result,
            Err(TradingError::Gateway(GatewayError::Rejected(_)))
        ));
        assert_eq!(exchange.calls(Operation::SubmitOrder), 1);
        assert_eq!(exchange.calls(Operation::FindOrder), 1);
        assert!(position.is_none());
    }

    #[tokio::test]
    async fn test_reconcile_releases_closed_position() {
        let exchange = PaperExchange::new(10_000.0);
        let coordinator = coordinator();
        let mut position = None;

        coordinator
            .execute(&exchange, &mut position, TradeSignal::Long, &levels(), 0.01, 100.0)
            .await
            .unwrap();

        coordinator.reconcile(&exchange, &mut position).await;
        assert!(position.is_some());

        exchange.close_open_position(100.0);
        coordinator.reconcile(&exchange, &mut position).await;
        assert!(position.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_failure_keeps_position() {
        let exchange = PaperExchange::new(10_000.0);
        let coordinator = coordinator();
        let mut position = None;

        coordinator
            .execute(&exchange, &mut position, TradeSignal::Long, &levels(), 0.01, 100.0)
            .await
            .unwrap();
        exchange.inject_failure(Operation::OrderStatus, GatewayError::Permanent("auth".into()));

        coordinator.reconcile(&exchange, &mut position).await;
        assert!(position.is_some());
    }

    #[tokio::test]
    async fn test_refresh_risk_levels() {
        let exchange = PaperExchange::new(10_000.0);
        let coordinator = coordinator();
        let mut position = None;

        // Nothing to refresh without a position
        assert!(!coordinator
            .refresh_risk_levels(&exchange, &mut position, &levels())
            .await
            .unwrap());

        coordinator
            .execute(&exchange, &mut position, TradeSignal::Long, &levels(), 0.01, 100.0)
            .await
            .unwrap();

        // Unchanged levels are not pushed
        assert!(!coordinator
            .refresh_risk_levels(&exchange, &mut position, &levels())
            .await
            .unwrap());
        assert_eq!(exchange.calls(Operation::UpdateOrder), 0);

        let moved = RiskLevels {
            stop_loss: 80.0,
            take_profit: 160.0,
        };
        assert!(coordinator
            .refresh_risk_levels(&exchange, &mut position, &moved)
            .await
            .unwrap());
        assert_eq!(position.as_ref().unwrap().risk, moved);
        assert_eq!(exchange.calls(Operation::UpdateOrder), 1);
        assert_eq!(position.unwrap().order.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn test_unfilled_limit_entry_keeps_levels() {
        let exchange = PaperExchange::new(10_000.0);
        exchange.set_closes(&[110.0]);
        let coordinator = OrderCoordinator::new(
            "BTCUSDT".to_string(),
            OrderType::Limit,
            1,
            RetryPolicy::new(3, Duration::from_millis(10)),
        );
        let mut position = None;

        coordinator
            .execute(&exchange, &mut position, TradeSignal::Long, &levels(), 0.01, 100.0)
            .await
            .unwrap();
        assert_eq!(position.as_ref().unwrap().order.status, OrderStatus::New);

        let moved = RiskLevels {
            stop_loss: 80.0,
            take_profit: 160.0,
        };
        let refreshed = coordinator
            .refresh_risk_levels(&exchange, &mut position, &moved)
            .await
            .unwrap();

        assert!(!refreshed);
        assert_eq!(exchange.calls(Operation::UpdateOrder), 0);
        assert_eq!(position.unwrap().risk, levels());
    }
}
