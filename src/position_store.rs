//! C2: in-memory registry of open positions.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::models::{Position, PositionStatus, Side};

#[derive(Clone, Default)]
pub struct PositionStore {
    inner: Arc<Mutex<HashMap<String, Position>>>,
}

impl PositionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new position. Rejects (returns `None`) if any position is
    /// already open (single-position mode) or if an existing OPEN position
    /// shares `symbol`, or if `qty <= 0`.
    pub fn open(
        &self,
        pos_id: &str,
        symbol: &str,
        side: Side,
        qty: i64,
        entry_price: f64,
        security_id: Option<String>,
        trailing_sl: Option<f64>,
    ) -> Option<Position> {
        if qty <= 0 {
            warn!(pos_id, qty, "rejecting open: non-positive quantity");
            return None;
        }

        let mut guard = self.inner.lock();

        if !guard.is_empty() {
            warn!(pos_id, "rejecting open: single-position mode already has an open position");
            return None;
        }

        if guard.values().any(|p| p.symbol == symbol) {
            warn!(pos_id, symbol, "rejecting open: symbol already has an open position");
            return None;
        }

        let position = Position {
            pos_id: pos_id.to_string(),
            symbol: symbol.to_string(),
            side,
            quantity: qty,
            entry_price,
            security_id,
            open_ts: Utc::now(),
            closed_ts: None,
            exit_price: None,
            pnl: 0.0,
            trailing_sl,
            status: PositionStatus::Open,
            tags: HashMap::new(),
        };

        info!(pos_id, symbol, side = side.as_str(), qty, entry_price, "position opened");
        guard.insert(pos_id.to_string(), position.clone());
        Some(position)
    }

    /// Closes a position, computing realized PnL, and removes it from the
    /// registry.
    pub fn close(&self, pos_id: &str, exit_price: f64) -> Option<Position> {
        let mut guard = self.inner.lock();
        let mut position = guard.remove(pos_id)?;

        let pnl = match position.side {
            Side::Buy => (exit_price - position.entry_price) * position.quantity as f64,
            Side::Sell => (position.entry_price - exit_price) * position.quantity as f64,
        };

        position.exit_price = Some(exit_price);
        position.closed_ts = Some(Utc::now());
        position.pnl = pnl;
        position.status = PositionStatus::Closed;

        info!(pos_id, exit_price, pnl, "position closed");
        Some(position)
    }

    /// Refreshes unrealized PnL for an OPEN position. No-op if absent.
    pub fn update_market_price(&self, pos_id: &str, price: f64) {
        let mut guard = self.inner.lock();
        if let Some(position) = guard.get_mut(pos_id) {
            position.pnl = position.unrealized_pnl(price);
        }
    }

    pub fn get(&self, pos_id: &str) -> Option<Position> {
        self.inner.lock().get(pos_id).cloned()
    }

    /// Deep-copy snapshot; safe to iterate without holding the store's lock.
    pub fn list(&self) -> Vec<Position> {
        self.inner.lock().values().cloned().collect()
    }

    pub fn has_open(&self) -> bool {
        !self.inner.lock().is_empty()
    }

    /// True when `price` has crossed `trailing_sl` unfavorably for the
    /// position's side.
    pub fn check_trailing_stop(&self, pos_id: &str, price: f64) -> bool {
        let guard = self.inner.lock();
        let Some(position) = guard.get(pos_id) else {
            return false;
        };
        let Some(trailing_sl) = position.trailing_sl else {
            return false;
        };
        match position.side {
            Side::Buy => price <= trailing_sl,
            Side::Sell => price >= trailing_sl,
        }
    }

    /// True if the stored `security_id` differs from what the broker
    /// reported.
    pub fn detect_broker_mismatch(&self, pos_id: &str, broker_security_id: &str) -> bool {
        let guard = self.inner.lock();
        match guard.get(pos_id).and_then(|p| p.security_id.as_deref()) {
            Some(stored) => stored != broker_security_id,
            None => false,
        }
    }
}
