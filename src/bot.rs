use std::any::Any;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::api::ExchangeGateway;
use crate::config::BotConfig;
use crate::error::{GatewayError, TradingError};
use crate::execution::{ExecutionAction, OrderCoordinator, RetryPolicy};
use crate::models::{Candle, DrawdownState, ManagedPosition, OrderResult, TradeSignal};
use crate::risk::{DrawdownMonitor, RiskCalculator};
use crate::strategy::{RsiStrategy, Strategy};
use crate::Result;

/// Observable lifecycle of the trading loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotState {
    Stopped,
    Running,
    Paused,
}

/// What one primary cycle ended up doing
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Traded(OrderResult),
    NoSignal { rsi: f64 },
    /// Signal ignored because a managed position is still open
    PositionOpen { signal: TradeSignal },
    /// Signal ignored because the drawdown breaker is tripped
    BreakerTripped { signal: TradeSignal },
    InsufficientData { have: usize, need: usize },
    FetchFailed(GatewayError),
    Failed(TradingError),
    /// Shutdown was requested before the cycle could finish
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Pause,
    Resume,
    ResetDrawdown,
    Stop,
}

/// Process-lifetime state, owned by the loop and lent to components
#[derive(Debug, Default)]
struct TradingContext {
    position: Option<ManagedPosition>,
    drawdown: DrawdownState,
}

/// The trading control loop
///
/// Holds the gateway and the only mutable trading state. Components are
/// configured once from [`BotConfig`] and never keep state of their own.
pub struct TradingBot<G> {
    config: BotConfig,
    gateway: G,
    strategy: RsiStrategy,
    risk: RiskCalculator,
    coordinator: OrderCoordinator,
    monitor: DrawdownMonitor,
    retry: RetryPolicy,
    shutdown: CancellationToken,
    context: TradingContext,
}

impl<G: ExchangeGateway + 'static> TradingBot<G> {
    /// Build the loop; fails only on invalid configuration
    pub fn new(config: BotConfig, gateway: G) -> Result<Self> {
        config.validate()?;

        let shutdown = CancellationToken::new();
        let retry = config.retry_policy().with_shutdown(shutdown.clone());

        Ok(Self {
            strategy: config.strategy()?,
            risk: config.risk_calculator(),
            monitor: config.drawdown_monitor()?,
            coordinator: Self::coordinator(&config, retry.clone()),
            retry,
            shutdown,
            gateway,
            config,
            context: TradingContext::default(),
        })
    }

    fn coordinator(config: &BotConfig, retry: RetryPolicy) -> OrderCoordinator {
        OrderCoordinator::new(
            config.symbol.clone(),
            config.order_type,
            config.leverage,
            retry,
        )
    }

    /// Fresh shutdown token for a new run; a stopped bot can be started again
    fn arm_shutdown(&mut self) -> CancellationToken {
        self.shutdown = CancellationToken::new();
        self.retry = self.config.retry_policy().with_shutdown(self.shutdown.clone());
        self.coordinator = Self::coordinator(&self.config, self.retry.clone());
        self.shutdown.clone()
    }

    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn position(&self) -> Option<&ManagedPosition> {
        self.context.position.as_ref()
    }

    pub fn drawdown(&self) -> DrawdownState {
        self.context.drawdown
    }

    /// Re-arm the drawdown breaker; there is no automatic reset
    pub fn reset_drawdown(&mut self) {
        self.monitor.reset(&mut self.context.drawdown);
    }

    /// One primary iteration: reconcile → candles → signal → risk → execute → balance
    ///
    /// Never returns an error; every failure is logged and reported in the
    /// outcome so the loop can carry on.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        self.coordinator
            .reconcile(&self.gateway, &mut self.context.position)
            .await;

        if self.shutdown.is_cancelled() {
            return CycleOutcome::Cancelled;
        }

        let candles = match self.fetch_candles().await {
            Ok(candles) => candles,
            Err(_) if self.shutdown.is_cancelled() => return CycleOutcome::Cancelled,
            Err(e) => {
                tracing::error!(
                    "Cycle skipped: fetch_candles failed ({}): {}",
                    e.kind(),
                    e
                );
                return CycleOutcome::FetchFailed(e);
            }
        };

        let outcome = self.decide_and_execute(&candles).await;
        if outcome != CycleOutcome::Cancelled {
            self.update_balance().await;
        }
        outcome
    }

    async fn decide_and_execute(&mut self, candles: &[Candle]) -> CycleOutcome {
        let reading = match self.strategy.evaluate(candles) {
            Ok(reading) => reading,
            Err(TradingError::InsufficientData { have, need }) => {
                tracing::warn!(
                    "Cycle skipped: {} candles for {}, need {}",
                    have,
                    self.config.symbol,
                    need
                );
                return CycleOutcome::InsufficientData { have, need };
            }
            Err(e) => return Self::failed("evaluate", e),
        };

        let Some(latest) = candles.last() else {
            return CycleOutcome::InsufficientData { have: 0, need: 1 };
        };
        tracing::info!(
            "📊 {} @ ${:.4} RSI({}) = {:.2} → {:?}",
            self.config.symbol,
            latest.close,
            self.strategy.rsi_period(),
            reading.rsi,
            reading.signal
        );

        let signal = reading.signal;
        if signal == TradeSignal::None {
            return CycleOutcome::NoSignal { rsi: reading.rsi };
        }

        if self.context.drawdown.tripped {
            tracing::debug!(
                "  Skipping {:?} entry: drawdown breaker tripped ({:.2}%)",
                signal,
                self.context.drawdown.drawdown_pct
            );
            return CycleOutcome::BreakerTripped { signal };
        }

        let levels = match self.risk.levels(candles, signal) {
            Ok(levels) => levels,
            Err(e) => return Self::failed("risk_levels", e),
        };

        if self.shutdown.is_cancelled() {
            tracing::info!("  Skipping {:?} entry: shutting down", signal);
            return CycleOutcome::Cancelled;
        }

        match self
            .coordinator
            .execute(
                &self.gateway,
                &mut self.context.position,
                signal,
                &levels,
                self.config.position_size,
                latest.close,
            )
            .await
        {
            Ok(decision) => match decision.action {
                ExecutionAction::Submitted(result) => CycleOutcome::Traded(result),
                ExecutionAction::Skip => CycleOutcome::PositionOpen { signal },
            },
            Err(e) => Self::failed("submit_order", e),
        }
    }

    fn failed(operation: &str, error: TradingError) -> CycleOutcome {
        match &error {
            TradingError::Gateway(e) => tracing::error!(
                "Cycle failed: {} ({}): {}",
                operation,
                e.kind(),
                e
            ),
            _ => tracing::error!("Cycle failed: {}: {}", operation, error),
        }
        CycleOutcome::Failed(error)
    }

    async fn fetch_candles(&self) -> std::result::Result<Vec<Candle>, GatewayError> {
        let symbol = &self.config.symbol;
        let timeframe = self.config.timeframe;
        let limit = self.config.candle_limit;
        self.retry
            .run("fetch_candles", || {
                self.gateway.fetch_candles(symbol, timeframe, limit)
            })
            .await
    }

    async fn update_balance(&mut self) {
        match self
            .retry
            .run("fetch_balance", || self.gateway.fetch_balance())
            .await
        {
            Ok(snapshot) => {
                let state = self.monitor.update(&mut self.context.drawdown, snapshot);
                tracing::debug!(
                    "💰 Equity ${:.2} (peak ${:.2}, drawdown {:.2}%)",
                    state.current_equity,
                    state.peak_equity.unwrap_or(state.current_equity),
                    state.drawdown_pct
                );
            }
            Err(e) => {
                tracing::warn!(
                    "fetch_balance failed ({}): {}. Keeping previous drawdown state",
                    e.kind(),
                    e
                );
            }
        }
    }

    /// Re-price the open position's stop-loss and take-profit from the latest close
    ///
    /// Returns `Ok(true)` when new levels were pushed to the venue.
    pub async fn refresh_stop_loss(&mut self) -> Result<bool> {
        self.coordinator
            .reconcile(&self.gateway, &mut self.context.position)
            .await;

        let direction = match self.context.position.as_ref().filter(|p| p.is_open()) {
            Some(position) => position.side.signal(),
            None => return Ok(false),
        };

        if self.context.drawdown.tripped && !self.config.manage_position_while_tripped {
            tracing::debug!("Stop-loss refresh skipped: drawdown breaker tripped");
            return Ok(false);
        }

        let candles = self.fetch_candles().await?;
        let levels = self.risk.levels(&candles, direction)?;
        self.coordinator
            .refresh_risk_levels(&self.gateway, &mut self.context.position, &levels)
            .await
    }

    async fn guarded_cycle(&mut self) {
        match AssertUnwindSafe(self.run_cycle()).catch_unwind().await {
            Ok(outcome) => tracing::debug!("Cycle finished: {:?}", outcome),
            Err(panic) => tracing::error!(
                "💥 Unexpected panic in trading cycle: {}",
                panic_message(&*panic)
            ),
        }
    }

    async fn guarded_refresh(&mut self) {
        match AssertUnwindSafe(self.refresh_stop_loss()).catch_unwind().await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::error!("Stop-loss refresh failed: {}", e),
            Err(panic) => tracing::error!(
                "💥 Unexpected panic in stop-loss refresh: {}",
                panic_message(&*panic)
            ),
        }
    }

    /// Spawn the driver task and hand back its control handle
    pub fn start(mut self) -> BotHandle<G> {
        let shutdown = self.arm_shutdown();
        let (commands, receiver) = mpsc::channel(16);
        let (state_tx, state) = watch::channel(BotState::Running);
        let task = tokio::spawn(self.drive(receiver, state_tx));

        BotHandle {
            commands,
            state,
            shutdown,
            task,
        }
    }

    async fn drive(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        state: watch::Sender<BotState>,
    ) -> Self {
        tracing::info!(
            "🚀 Trading loop started: {} on {} {} every {:?} (stop-loss {:?})",
            self.strategy.name(),
            self.config.symbol,
            self.config.timeframe,
            self.config.cycle_interval(),
            self.config.stop_loss_mode
        );

        let symbol = self.config.symbol.clone();
        let leverage = self.config.leverage;
        if let Err(e) = self
            .retry
            .run("set_leverage", || self.gateway.set_leverage(&symbol, leverage))
            .await
        {
            tracing::warn!("set_leverage {}x failed ({}): {}", leverage, e.kind(), e);
        }

        let mut cycle_ticker = interval(self.config.cycle_interval());
        cycle_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let refresh_every = self.config.dynamic_sl_interval();
        let mut refresh_ticker = interval_at(Instant::now() + refresh_every, refresh_every);
        refresh_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let dynamic = self.risk.is_dynamic();

        let mut paused = false;

        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(Command::Pause) => {
                        paused = true;
                        state.send_replace(BotState::Paused);
                        tracing::info!("⏸️  Trading loop paused");
                    }
                    Some(Command::Resume) => {
                        paused = false;
                        state.send_replace(BotState::Running);
                        tracing::info!("▶️  Trading loop resumed");
                    }
                    Some(Command::ResetDrawdown) => self.reset_drawdown(),
                    Some(Command::Stop) | None => break,
                },
                _ = cycle_ticker.tick() => {
                    if !paused {
                        self.guarded_cycle().await;
                    }
                }
                _ = refresh_ticker.tick(), if dynamic => {
                    if !paused {
                        self.guarded_refresh().await;
                    }
                }
            }
        }

        self.gateway.close().await;
        state.send_replace(BotState::Stopped);
        tracing::info!("👋 Trading loop stopped");
        self
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic"
    }
}

/// Control handle for a running [`TradingBot`]
pub struct BotHandle<G> {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<BotState>,
    shutdown: CancellationToken,
    task: JoinHandle<TradingBot<G>>,
}

impl<G: ExchangeGateway + 'static> BotHandle<G> {
    pub fn state(&self) -> BotState {
        *self.state.borrow()
    }

    /// Watch state changes, e.g. to wait for a pause to take effect
    pub fn subscribe(&self) -> watch::Receiver<BotState> {
        self.state.clone()
    }

    pub async fn pause(&self) {
        self.send(Command::Pause).await;
    }

    pub async fn resume(&self) {
        self.send(Command::Resume).await;
    }

    pub async fn reset_drawdown(&self) {
        self.send(Command::ResetDrawdown).await;
    }

    /// Stop the loop, close the gateway and return the bot
    ///
    /// Pending retry backoffs are abandoned and no new entry is submitted.
    /// An order submission already under way still runs to completion.
    pub async fn stop(self) -> Option<TradingBot<G>> {
        self.shutdown.cancel();
        self.send(Command::Stop).await;
        match self.task.await {
            Ok(bot) => Some(bot),
            Err(e) => {
                tracing::error!("Trading loop task failed: {}", e);
                None
            }
        }
    }

    async fn send(&self, command: Command) {
        if self.commands.send(command).await.is_err() {
            tracing::warn!("Trading loop is not running, {:?} ignored", command);
        }
    }
}
