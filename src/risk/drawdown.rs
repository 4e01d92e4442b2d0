use serde::{Deserialize, Serialize};

use crate::error::TradingError;
use crate::models::{BalanceSnapshot, DrawdownState};
use crate::Result;

/// Drawdown circuit breaker
///
/// Tracks the running equity peak and trips once the decline from that peak
/// exceeds `max_drawdown_pct` (a percentage, 20.0 = -20%). The trip is
/// advisory and sticky: the control loop decides what to stop, and only
/// [`DrawdownMonitor::reset`] clears it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DrawdownMonitor {
    pub max_drawdown_pct: f64,
}

impl Default for DrawdownMonitor {
    fn default() -> Self {
        Self {
            max_drawdown_pct: 20.0, // -20% from peak
        }
    }
}

impl DrawdownMonitor {
    pub fn new(max_drawdown_pct: f64) -> Result<Self> {
        if !(max_drawdown_pct > 0.0) || !max_drawdown_pct.is_finite() {
            return Err(TradingError::InvalidConfiguration(format!(
                "max drawdown must be a positive percentage, got {}",
                max_drawdown_pct
            )));
        }
        Ok(Self { max_drawdown_pct })
    }

    /// Fold a balance snapshot into `state` and return the new state
    ///
    /// Snapshots older than the one `state` already reflects are ignored.
    pub fn update(&self, state: &mut DrawdownState, snapshot: BalanceSnapshot) -> DrawdownState {
        if let Some(as_of) = state.as_of {
            if snapshot.as_of < as_of {
                tracing::debug!(
                    "Ignoring stale balance snapshot from {} (state is at {})",
                    snapshot.as_of,
                    as_of
                );
                return *state;
            }
        }

        let equity = snapshot.total_equity;
        if !equity.is_finite() || equity < 0.0 {
            tracing::warn!("Ignoring invalid equity reading {}", equity);
            return *state;
        }

        state.current_equity = equity;
        state.as_of = Some(snapshot.as_of);

        let peak = match state.peak_equity {
            Some(peak) if peak >= equity => peak,
            _ => {
                state.peak_equity = Some(equity);
                equity
            }
        };

        state.drawdown_pct = if peak > 0.0 {
            (peak - equity) / peak * 100.0
        } else {
            0.0
        };

        if !state.tripped && state.drawdown_pct > self.max_drawdown_pct {
            state.tripped = true;
            tracing::warn!(
                "🛑 Drawdown breaker tripped: {:.2}% from peak ${:.2} (equity ${:.2}, limit {:.2}%)",
                state.drawdown_pct,
                peak,
                equity,
                self.max_drawdown_pct
            );
        }

        *state
    }

    /// Re-arm the breaker, re-basing the peak on the current equity
    pub fn reset(&self, state: &mut DrawdownState) {
        if state.tripped {
            tracing::info!(
                "Drawdown breaker reset at equity ${:.2} (was {:.2}% down)",
                state.current_equity,
                state.drawdown_pct
            );
        }
        state.tripped = false;
        if state.as_of.is_some() {
            state.peak_equity = Some(state.current_equity);
        }
        state.drawdown_pct = 0.0;
    }
}
