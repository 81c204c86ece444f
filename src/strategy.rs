//! C12 (collaborator): emits ENTRY_SIGNAL / EXIT_SIGNAL onto the bus from
//! completed candles. The indicator arithmetic (ATR) is injected as a pure
//! function, consistent with it being out of scope for this core; this
//! module owns only the breakout decision and the confirm-count state
//! machine that damps single-candle noise.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::candles::Candle;
use crate::event_bus::{Event, EventBus};
use crate::models::{EntrySignal, ExitSignal, Side};

/// Pure ATR function signature the runner calls; the computation itself is
/// out of scope here.
pub type AtrFn = Arc<dyn Fn(&[Candle]) -> f64 + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Long,
    Short,
    Flat,
}

struct SymbolState {
    window: Vec<Candle>,
    direction: Direction,
    confirm_count: u32,
    pending_direction: Option<Direction>,
}

impl Default for SymbolState {
    fn default() -> Self {
        Self {
            window: Vec::new(),
            direction: Direction::Flat,
            confirm_count: 0,
            pending_direction: None,
        }
    }
}

pub struct StrategyRunner {
    bus: EventBus,
    atr: AtrFn,
    window_size: usize,
    confirm_threshold: u32,
    /// Quantity placed on a breakout entry (LOT_SIZE/BASE_QTY, per the
    /// glossary these name the same knob). Without this, RiskGate would see
    /// `requested_qty=0` and every strategy-originated entry would be sized
    /// to zero and dropped.
    lot_size: i64,
    state: Mutex<HashMap<String, SymbolState>>,
    has_open_position: Arc<dyn Fn(&str) -> bool + Send + Sync>,
}

impl StrategyRunner {
    pub fn new(
        bus: EventBus,
        atr: AtrFn,
        window_size: usize,
        confirm_threshold: u32,
        lot_size: i64,
        has_open_position: Arc<dyn Fn(&str) -> bool + Send + Sync>,
    ) -> Self {
        Self {
            bus,
            atr,
            window_size,
            confirm_threshold,
            lot_size,
            state: Mutex::new(HashMap::new()),
            has_open_position,
        }
    }

    /// Feeds one completed candle for `symbol`, evaluating the breakout
    /// condition and publishing ENTRY_SIGNAL / EXIT_SIGNAL as needed.
    pub fn on_candle_closed(&self, symbol: &str, candle: Candle) {
        let decision = {
            let mut guard = self.state.lock();
            let state = guard.entry(symbol.to_string()).or_default();
            state.window.push(candle);
            if state.window.len() > self.window_size {
                state.window.remove(0);
            }

            if state.window.len() < 2 {
                return;
            }

            let atr = (self.atr)(&state.window);
            let high = state
                .window
                .iter()
                .map(|c| c.high)
                .fold(f64::MIN, f64::max);
            let low = state.window.iter().map(|c| c.low).fold(f64::MAX, f64::min);

            let breakout_direction = if candle.close > high - atr && candle.close >= high {
                Some(Direction::Long)
            } else if candle.close < low + atr && candle.close <= low {
                Some(Direction::Short)
            } else {
                None
            };

            match breakout_direction {
                Some(dir) if state.pending_direction == Some(dir) => {
                    state.confirm_count += 1;
                }
                Some(dir) => {
                    state.pending_direction = Some(dir);
                    state.confirm_count = 1;
                }
                None => {
                    state.pending_direction = None;
                    state.confirm_count = 0;
                }
            }

            if state.confirm_count < self.confirm_threshold {
                return;
            }

            let Some(confirmed) = state.pending_direction else {
                return;
            };
            if confirmed == state.direction {
                return;
            }

            state.direction = confirmed;
            state.confirm_count = 0;
            state.pending_direction = None;
            confirmed
        };

        self.emit_for_direction(symbol, decision, candle.close);
    }

    fn emit_for_direction(&self, symbol: &str, direction: Direction, price: f64) {
        let has_position = (self.has_open_position)(symbol);

        match direction {
            Direction::Long if !has_position => {
                info!(symbol, "strategy: breakout long, emitting entry signal");
                self.bus.publish(Event::EntrySignal(EntrySignal {
                    pos_id: None,
                    symbol: symbol.to_string(),
                    side: Side::Buy,
                    quantity: self.lot_size,
                    price: Some(price),
                    security_id: None,
                    confidence_score: None,
                    stop_loss: None,
                }));
            }
            Direction::Short if has_position => {
                info!(symbol, "strategy: breakout reverses, emitting exit signal");
                self.bus.publish(Event::ExitSignal(ExitSignal {
                    pos_id: None,
                    security_id: Some(symbol.to_string()),
                    price,
                }));
            }
            _ => {}
        }
    }
}
