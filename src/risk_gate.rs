//! C4: admission and sizing.

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::Config;
use crate::models::{EntrySignal, Side};
use crate::position_store::PositionStore;

/// Process-wide daily counters the gate checks against. Reset is the
/// caller's responsibility (e.g. a daily cron); this crate does not
/// schedule that reset itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct BotState {
    pub daily_pnl: f64,
    pub daily_trade_count: u32,
}

pub struct RiskGate {
    config: Config,
    positions: PositionStore,
    state: Mutex<BotState>,
}

impl RiskGate {
    pub fn new(config: Config, positions: PositionStore) -> Self {
        Self {
            config,
            positions,
            state: Mutex::new(BotState::default()),
        }
    }

    pub fn record_trade_taken(&self) {
        self.state.lock().daily_trade_count += 1;
    }

    pub fn record_realized_pnl(&self, pnl: f64) {
        self.state.lock().daily_pnl += pnl;
    }

    pub fn snapshot_state(&self) -> BotState {
        *self.state.lock()
    }

    /// Runs the admission algorithm against `signal`, returning
    /// `(approved, sized_qty)`. Never approves on internal error.
    pub fn check(&self, side: Side, requested_qty: i64, signal: &EntrySignal) -> (bool, i64) {
        let qty = match signal.confidence_score {
            Some(confidence) if confidence.is_finite() => {
                ((self.config.base_qty as f64) * confidence).floor().max(1.0) as i64
            }
            _ => requested_qty,
        };

        let state = self.state.lock();

        if state.daily_pnl <= -self.config.max_daily_loss.abs() {
            warn!(daily_pnl = state.daily_pnl, "risk gate: daily loss limit reached");
            return (false, qty);
        }

        if state.daily_trade_count >= self.config.max_trades_per_day {
            warn!(
                daily_trade_count = state.daily_trade_count,
                "risk gate: daily trade count limit reached"
            );
            return (false, qty);
        }
        drop(state);

        let net_open: i64 = self
            .positions
            .list()
            .iter()
            .map(|p| match p.side {
                Side::Buy => p.quantity,
                Side::Sell => -p.quantity,
            })
            .sum();

        let projected = match side {
            Side::Buy => net_open + qty,
            Side::Sell => net_open - qty,
        };

        if projected.abs() > self.config.max_position {
            warn!(projected, max_position = self.config.max_position, "risk gate: position cap exceeded");
            return (false, qty);
        }

        info!(qty, side = side.as_str(), "risk gate: admitted");
        (true, qty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(max_position: i64, max_daily_loss: f64, max_trades_per_day: u32) -> RiskGate {
        let config = Config {
            database_path: String::new(),
            port: 0,
            simulate: true,
            order_timeout_seconds: 30,
            max_position,
            max_daily_loss,
            max_trades_per_day,
            base_qty: 50,
            initial_stoploss: None,
            strategy_window: 20,
            strategy_confirm_count: 2,
            dhan_client_id: None,
            dhan_access_token: None,
        };
        RiskGate::new(config, PositionStore::new())
    }

    fn entry(qty: i64, confidence: Option<f64>) -> EntrySignal {
        EntrySignal {
            pos_id: Some("P".into()),
            symbol: "NIFTY".into(),
            side: Side::Buy,
            quantity: qty,
            price: None,
            security_id: None,
            confidence_score: confidence,
            stop_loss: None,
        }
    }

    #[test]
    fn rejects_over_position_cap() {
        let gate = gate(5, 10_000.0, 100);
        let (approved, _) = gate.check(Side::Buy, 10, &entry(10, None));
        assert!(!approved);
    }

    #[test]
    fn rejects_on_daily_loss_breach() {
        let gate = gate(100, 100.0, 100);
        gate.record_realized_pnl(-150.0);
        let (approved, _) = gate.check(Side::Buy, 1, &entry(1, None));
        assert!(!approved);
    }

    #[test]
    fn rejects_on_trade_count_breach() {
        let gate = gate(100, 10_000.0, 2);
        gate.record_trade_taken();
        gate.record_trade_taken();
        let (approved, _) = gate.check(Side::Buy, 1, &entry(1, None));
        assert!(!approved);
    }

    #[test]
    fn confidence_sizes_quantity_from_base_qty() {
        let gate = gate(1_000, 10_000.0, 100);
        let (approved, qty) = gate.check(Side::Buy, 1, &entry(1, Some(0.5)));
        assert!(approved);
        assert_eq!(qty, 25); // floor(50 * 0.5)
    }

    #[test]
    fn sell_side_negates_projected_exposure() {
        let gate = gate(5, 10_000.0, 100);
        let (approved, qty) = gate.check(Side::Sell, 6, &entry(6, None));
        assert!(!approved);
        assert_eq!(qty, 6);
    }
}
