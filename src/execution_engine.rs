//! C7: the heart of the system — consumes ENTRY/EXIT signals and drives the
//! order lifecycle under two-level locking (advisory lock, then the
//! in-process `exec_lock`, wider-to-narrower per the resolved design
//! question on lock ordering).

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::advisory_lock::AdvisoryLockService;
use crate::broker::{
    BrokerAdapter, BrokerOrderRequest, OrderType, ProductType, TransactionType,
};
use crate::config::Config;
use crate::event_bus::{Event, EventBus, EventKind};
use crate::market_clock::MarketClock;
use crate::models::{
    EntrySignal, ExitSignal, OrderStatusEvent, PendingOrder, Side, TradeStatus,
};
use crate::pending_orders::PendingOrderTable;
use crate::position_store::PositionStore;
use crate::risk_gate::RiskGate;
use crate::trade_journal::TradeJournal;

pub struct ExecutionEngine {
    config: Config,
    positions: PositionStore,
    pending: PendingOrderTable,
    risk_gate: RiskGate,
    advisory_lock: AdvisoryLockService,
    journal: TradeJournal,
    broker: Arc<dyn BrokerAdapter>,
    market_clock: MarketClock,
    bus: EventBus,
    /// Process-wide re-entrant critical section. `tokio::sync::Mutex` is
    /// not literally re-entrant, but every call path here acquires it
    /// exactly once per signal, which is the property the spec actually
    /// needs.
    exec_lock: AsyncMutex<()>,
}

impl ExecutionEngine {
    pub fn new(
        config: Config,
        positions: PositionStore,
        pending: PendingOrderTable,
        risk_gate: RiskGate,
        advisory_lock: AdvisoryLockService,
        journal: TradeJournal,
        broker: Arc<dyn BrokerAdapter>,
        market_clock: MarketClock,
        bus: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            positions,
            pending,
            risk_gate,
            advisory_lock,
            journal,
            broker,
            market_clock,
            bus,
            exec_lock: AsyncMutex::new(()),
        })
    }

    /// Subscribes this engine's handlers onto its bus. Takes `self: &Arc<Self>`
    /// so each handler can hold its own clone for the lifetime of the
    /// subscription.
    pub fn subscribe(self: &Arc<Self>) {
        let engine = self.clone();
        self.bus.subscribe(EventKind::EntrySignal, move |event| {
            let engine = engine.clone();
            async move {
                if let Event::EntrySignal(signal) = event {
                    if let Err(e) = engine.handle_entry_signal(signal).await {
                        warn!(error = %e, "entry signal handling failed");
                    }
                }
            }
        });

        let engine = self.clone();
        self.bus.subscribe(EventKind::ExitSignal, move |event| {
            let engine = engine.clone();
            async move {
                if let Event::ExitSignal(signal) = event {
                    if let Err(e) = engine.handle_exit_signal(signal).await {
                        warn!(error = %e, "exit signal handling failed");
                    }
                }
            }
        });

        let engine = self.clone();
        self.bus.subscribe(EventKind::OrderFilled, move |event| {
            let engine = engine.clone();
            async move {
                if let Event::OrderFilled(status) = event {
                    engine.handle_order_filled(status);
                }
            }
        });
    }

    fn synthesize_pos_id() -> String {
        format!("pos_{}", uuid::Uuid::new_v4())
    }

    async fn handle_entry_signal(&self, signal: EntrySignal) -> anyhow::Result<()> {
        let pos_id = signal.pos_id.clone().unwrap_or_else(Self::synthesize_pos_id);
        let lock_key = AdvisoryLockService::lock_key_for(&pos_id);

        if !self.advisory_lock.try_acquire(lock_key).await? {
            info!(pos_id, "entry signal: advisory lock held elsewhere, dropping");
            return Ok(());
        }

        let result = self.handle_entry_signal_locked(&pos_id, &signal).await;
        self.advisory_lock.release(lock_key).await?;
        result
    }

    async fn handle_entry_signal_locked(
        &self,
        pos_id: &str,
        signal: &EntrySignal,
    ) -> anyhow::Result<()> {
        let (approved, qty) = self.risk_gate.check(signal.side, signal.quantity, signal);
        if !approved {
            info!(pos_id, "entry signal: risk gate rejected");
            return Ok(());
        }
        if qty <= 0 {
            info!(pos_id, qty, "entry signal: sized quantity non-positive, dropping");
            return Ok(());
        }

        let _exec_guard = self.exec_lock.lock().await;

        if self.positions.get(pos_id).is_some() || self.pending.get(pos_id).is_some() {
            info!(pos_id, "entry signal: pos_id already has an order in flight, dropping");
            return Ok(());
        }

        let price = signal.price.unwrap_or(0.0);

        if self.config.simulate {
            self.place_simulated_entry(pos_id, signal, qty, price).await
        } else {
            self.place_live_entry(pos_id, signal, qty, price).await
        }
    }

    async fn place_simulated_entry(
        &self,
        pos_id: &str,
        signal: &EntrySignal,
        qty: i64,
        price: f64,
    ) -> anyhow::Result<()> {
        let db_id = self
            .journal
            .record(
                signal.side,
                qty,
                price,
                TradeStatus::Simulated,
                serde_json::json!({"pos_id": pos_id}),
            )
            .await?;

        self.bus.publish(Event::OrderPlaced(OrderStatusEvent {
            pos_id: pos_id.to_string(),
            db_id,
            ts: Utc::now(),
            broker_info: None,
        }));

        self.pending.insert(PendingOrder {
            pos_id: pos_id.to_string(),
            db_id,
            placed_ts: Utc::now(),
            qty,
            side: signal.side,
            price,
            broker_info: None,
            simulated: true,
        });

        if !self.market_clock.is_market_open() {
            self.positions.open(
                pos_id,
                &signal.symbol,
                signal.side,
                qty,
                price,
                signal.security_id.clone(),
                signal.stop_loss,
            );
            self.risk_gate.record_trade_taken();
            self.bus.publish(Event::OrderFilled(OrderStatusEvent {
                pos_id: pos_id.to_string(),
                db_id,
                ts: Utc::now(),
                broker_info: None,
            }));
            self.pending.remove(pos_id);
            info!(pos_id, "entry signal: simulated fill (market closed)");
        } else {
            info!(pos_id, "entry signal: simulated, left pending (market open)");
        }

        Ok(())
    }

    async fn place_live_entry(
        &self,
        pos_id: &str,
        signal: &EntrySignal,
        qty: i64,
        price: f64,
    ) -> anyhow::Result<()> {
        if !self.config.has_live_credentials() {
            warn!(pos_id, "entry signal: live mode but credentials missing, aborting");
            return Ok(());
        }

        let request = BrokerOrderRequest {
            security_id: signal.security_id.clone().unwrap_or_default(),
            exch_seg: "NSE_FNO".to_string(),
            transaction_type: match signal.side {
                Side::Buy => TransactionType::Buy,
                Side::Sell => TransactionType::Sell,
            },
            quantity: qty,
            order_type: OrderType::Market,
            price: None,
            trigger_price: None,
            product_type: ProductType::Intraday,
        };

        let response = match self.broker.place_order(request).await {
            Ok(resp) => resp,
            Err(e) => {
                self.journal
                    .record(
                        signal.side,
                        qty,
                        price,
                        TradeStatus::Failed,
                        serde_json::json!({"pos_id": pos_id, "error": e.to_string()}),
                    )
                    .await?;
                warn!(pos_id, error = %e, "entry signal: broker call failed");
                return Ok(());
            }
        };

        if response.indicates_rejection() {
            self.journal
                .record(
                    signal.side,
                    qty,
                    price,
                    TradeStatus::Rejected,
                    response.as_json(),
                )
                .await?;
            warn!(pos_id, "entry signal: broker rejected order");
            return Ok(());
        }

        let db_id = self
            .journal
            .record(signal.side, qty, price, TradeStatus::Sent, response.as_json())
            .await?;

        self.bus.publish(Event::OrderPlaced(OrderStatusEvent {
            pos_id: pos_id.to_string(),
            db_id,
            ts: Utc::now(),
            broker_info: Some(response.as_json()),
        }));

        self.positions.open(
            pos_id,
            &signal.symbol,
            signal.side,
            qty,
            price,
            signal.security_id.clone(),
            signal.stop_loss,
        );
        self.risk_gate.record_trade_taken();

        self.pending.insert(PendingOrder {
            pos_id: pos_id.to_string(),
            db_id,
            placed_ts: Utc::now(),
            qty,
            side: signal.side,
            price,
            broker_info: Some(response.as_json()),
            simulated: false,
        });

        if response.indicates_fill() {
            self.bus.publish(Event::OrderFilled(OrderStatusEvent {
                pos_id: pos_id.to_string(),
                db_id,
                ts: Utc::now(),
                broker_info: Some(response.as_json()),
            }));
            self.pending.remove(pos_id);
            info!(pos_id, "entry signal: live order filled immediately");

            if let Some(sl_points) = self.config.initial_stoploss {
                self.place_stop_loss(signal, price, sl_points).await;
            }
        }

        Ok(())
    }

    async fn place_stop_loss(&self, signal: &EntrySignal, entry_price: f64, sl_points: f64) {
        let trigger = match signal.side {
            Side::Buy => entry_price - sl_points,
            Side::Sell => entry_price + sl_points,
        };
        let request = BrokerOrderRequest {
            security_id: signal.security_id.clone().unwrap_or_default(),
            exch_seg: "NSE_FNO".to_string(),
            transaction_type: match signal.side.opposite() {
                Side::Buy => TransactionType::Buy,
                Side::Sell => TransactionType::Sell,
            },
            quantity: signal.quantity,
            order_type: OrderType::SlM,
            price: None,
            trigger_price: Some(trigger),
            product_type: ProductType::Intraday,
        };
        if let Err(e) = self.broker.place_order(request).await {
            warn!(error = %e, "failed to place broker-side stop loss");
        }
    }

    async fn handle_exit_signal(&self, signal: ExitSignal) -> anyhow::Result<()> {
        if let Some(pos_id) = signal.pos_id.clone() {
            return self.close_by_pos_id(&pos_id, signal.price).await;
        }

        if let Some(security_id) = signal.security_id.clone() {
            for position in self.positions.list() {
                if position.security_id.as_deref() != Some(security_id.as_str()) {
                    continue;
                }
                let lock_key = AdvisoryLockService::lock_key_for(&position.pos_id);
                if self.advisory_lock.try_acquire(lock_key).await? {
                    let result = self
                        .close_position_locked(&position.pos_id, signal.price)
                        .await;
                    self.advisory_lock.release(lock_key).await?;
                    return result;
                }
            }
        }

        Ok(())
    }

    async fn close_by_pos_id(&self, pos_id: &str, price: f64) -> anyhow::Result<()> {
        let lock_key = AdvisoryLockService::lock_key_for(pos_id);
        if !self.advisory_lock.try_acquire(lock_key).await? {
            info!(pos_id, "exit signal: advisory lock held elsewhere, dropping");
            return Ok(());
        }
        let result = self.close_position_locked(pos_id, price).await;
        self.advisory_lock.release(lock_key).await?;
        result
    }

    async fn close_position_locked(&self, pos_id: &str, price: f64) -> anyhow::Result<()> {
        let _exec_guard = self.exec_lock.lock().await;

        let Some(position) = self.positions.get(pos_id) else {
            info!(pos_id, "exit signal: no open position, dropping");
            return Ok(());
        };

        if position.quantity <= 0 {
            warn!(pos_id, "exit signal: stored position has non-positive quantity");
            return Ok(());
        }

        if !self.config.simulate {
            self.close_live(pos_id, &position.side, position.quantity, price)
                .await
        } else if !self.market_clock.is_market_open() {
            if let Some(closed) = self.positions.close(pos_id, price) {
                self.risk_gate.record_realized_pnl(closed.pnl);
                self.journal
                    .record(
                        closed.side,
                        closed.quantity,
                        price,
                        TradeStatus::Closed,
                        serde_json::json!({"pos_id": pos_id}),
                    )
                    .await?;
            }
            Ok(())
        } else {
            let db_id = self
                .journal
                .record(
                    position.side,
                    position.quantity,
                    price,
                    TradeStatus::Simulated,
                    serde_json::json!({"pos_id": pos_id, "exit": true}),
                )
                .await?;
            self.bus.publish(Event::OrderPlaced(OrderStatusEvent {
                pos_id: pos_id.to_string(),
                db_id,
                ts: Utc::now(),
                broker_info: None,
            }));
            self.pending.insert(PendingOrder {
                pos_id: pos_id.to_string(),
                db_id,
                placed_ts: Utc::now(),
                qty: position.quantity,
                side: position.side,
                price,
                broker_info: None,
                simulated: true,
            });
            info!(pos_id, "exit signal: simulated, left pending (market open)");
            Ok(())
        }
    }

    async fn close_live(
        &self,
        pos_id: &str,
        side: &Side,
        qty: i64,
        price: f64,
    ) -> anyhow::Result<()> {
        let request = BrokerOrderRequest {
            security_id: String::new(),
            exch_seg: "NSE_FNO".to_string(),
            transaction_type: match side.opposite() {
                Side::Buy => TransactionType::Buy,
                Side::Sell => TransactionType::Sell,
            },
            quantity: qty,
            order_type: OrderType::Market,
            price: None,
            trigger_price: None,
            product_type: ProductType::Intraday,
        };

        let response = match self.broker.place_order(request).await {
            Ok(resp) => resp,
            Err(e) => {
                self.journal
                    .record(
                        *side,
                        qty,
                        price,
                        TradeStatus::Failed,
                        serde_json::json!({"pos_id": pos_id, "error": e.to_string()}),
                    )
                    .await?;
                return Ok(());
            }
        };

        if response.indicates_rejection() {
            self.journal
                .record(*side, qty, price, TradeStatus::Rejected, response.as_json())
                .await?;
            return Ok(());
        }

        let db_id = self
            .journal
            .record(*side, qty, price, TradeStatus::Sent, response.as_json())
            .await?;

        self.bus.publish(Event::OrderPlaced(OrderStatusEvent {
            pos_id: pos_id.to_string(),
            db_id,
            ts: Utc::now(),
            broker_info: Some(response.as_json()),
        }));

        self.pending.insert(PendingOrder {
            pos_id: pos_id.to_string(),
            db_id,
            placed_ts: Utc::now(),
            qty,
            side: *side,
            price,
            broker_info: Some(response.as_json()),
            simulated: false,
        });

        if response.indicates_fill() {
            if let Some(closed) = self.positions.close(pos_id, price) {
                self.risk_gate.record_realized_pnl(closed.pnl);
            }
            self.journal
                .record(*side, qty, price, TradeStatus::Closed, response.as_json())
                .await?;
            self.pending.remove(pos_id);
        }

        Ok(())
    }

    fn handle_order_filled(&self, status: OrderStatusEvent) {
        self.pending.remove(&status.pos_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBrokerAdapter;
    use std::time::Duration as StdDuration;
    use tokio::time::sleep;

    async fn build_engine(config: Config) -> (Arc<ExecutionEngine>, EventBus) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("engine.db");
        std::mem::forget(dir);
        let db_path = db_path.to_str().unwrap().to_string();

        let positions = PositionStore::new();
        let pending = PendingOrderTable::new();
        let risk_gate = RiskGate::new(config.clone(), positions.clone());
        let advisory_lock = AdvisoryLockService::new(&db_path, "test-worker").unwrap();
        let journal = TradeJournal::new(&db_path).unwrap();
        let bus = EventBus::new();

        let engine = ExecutionEngine::new(
            config,
            positions,
            pending,
            risk_gate,
            advisory_lock,
            journal,
            Arc::new(PaperBrokerAdapter),
            MarketClock::new(),
            bus.clone(),
        );
        engine.subscribe();
        (engine, bus)
    }

    fn test_config() -> Config {
        Config {
            database_path: String::new(),
            port: 0,
            simulate: true,
            order_timeout_seconds: 30,
            max_position: 1_000,
            max_daily_loss: 100_000.0,
            max_trades_per_day: 1_000,
            base_qty: 50,
            initial_stoploss: None,
            strategy_window: 20,
            strategy_confirm_count: 2,
            dhan_client_id: None,
            dhan_access_token: None,
        }
    }

    fn entry(pos_id: &str, side: Side, qty: i64, price: f64) -> EntrySignal {
        EntrySignal {
            pos_id: Some(pos_id.to_string()),
            symbol: "NIFTY".into(),
            side,
            quantity: qty,
            price: Some(price),
            security_id: Some(format!("SIM_{pos_id}")),
            confidence_score: None,
            stop_loss: None,
        }
    }

    #[tokio::test]
    async fn single_buy_entry_market_closed_opens_and_fills() {
        let (engine, _bus) = build_engine(test_config()).await;
        engine
            .handle_entry_signal(entry("P1", Side::Buy, 50, 100.0))
            .await
            .unwrap();

        let position = engine.positions.get("P1").expect("position open");
        assert_eq!(position.entry_price, 100.0);
        assert!(engine.pending.get("P1").is_none());
    }

    #[tokio::test]
    async fn duplicate_entry_publishes_result_in_one_position() {
        let (engine, bus) = build_engine(test_config()).await;
        for _ in 0..5 {
            bus.publish(Event::EntrySignal(entry("P1", Side::Buy, 1, 100.0)));
        }
        sleep(StdDuration::from_millis(50)).await;
        assert!(engine.positions.get("P1").is_some());
        // Single-position mode means nothing else can have opened either.
        assert_eq!(engine.positions.list().len(), 1);
    }

    /// Genuine concurrency (not sequential publishes): several tasks race to
    /// place the same `pos_id` at once. The advisory lock plus `exec_lock`
    /// must still leave exactly one TradeRecord and one open position.
    #[tokio::test]
    async fn concurrent_duplicate_entries_place_at_most_one_order() {
        let (engine, _bus) = build_engine(test_config()).await;
        let tasks = (0..8).map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .handle_entry_signal(entry("P1", Side::Buy, 1, 100.0))
                    .await
            })
        });
        for result in futures::future::join_all(tasks).await {
            result.unwrap().unwrap();
        }

        assert_eq!(engine.positions.list().len(), 1);
        let trades = engine.journal.list_recent(100).await.unwrap();
        let simulated_entries = trades
            .iter()
            .filter(|t| t.status.as_str() == "simulated")
            .count();
        assert_eq!(simulated_entries, 1);
    }

    /// Concurrent EXIT_SIGNALs for the same `pos_id` must close the position
    /// exactly once, not once per racing task.
    #[tokio::test]
    async fn concurrent_exits_close_the_position_exactly_once() {
        let (engine, _bus) = build_engine(test_config()).await;
        engine
            .handle_entry_signal(entry("P1", Side::Buy, 50, 100.0))
            .await
            .unwrap();

        let tasks = (0..8).map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .handle_exit_signal(ExitSignal {
                        pos_id: Some("P1".into()),
                        security_id: None,
                        price: 50.0,
                    })
                    .await
            })
        });
        for result in futures::future::join_all(tasks).await {
            result.unwrap().unwrap();
        }

        assert!(engine.positions.get("P1").is_none());
        let trades = engine.journal.list_recent(100).await.unwrap();
        let closed = trades.iter().filter(|t| t.status.as_str() == "closed").count();
        assert_eq!(closed, 1);
    }

    #[tokio::test]
    async fn risk_rejection_opens_no_position() {
        let mut config = test_config();
        config.max_position = 5;
        let (engine, _bus) = build_engine(config).await;
        engine
            .handle_entry_signal(entry("P1", Side::Buy, 10, 100.0))
            .await
            .unwrap();
        assert!(engine.positions.get("P1").is_none());
    }

    #[tokio::test]
    async fn exit_signal_closes_position_when_market_closed() {
        let (engine, _bus) = build_engine(test_config()).await;
        engine
            .handle_entry_signal(entry("P1", Side::Buy, 50, 100.0))
            .await
            .unwrap();

        engine
            .handle_exit_signal(ExitSignal {
                pos_id: Some("P1".into()),
                security_id: None,
                price: 50.0,
            })
            .await
            .unwrap();

        assert!(engine.positions.get("P1").is_none());
    }

    #[tokio::test]
    async fn order_filled_is_idempotent_for_pending_table() {
        let (engine, _bus) = build_engine(test_config()).await;
        engine.pending.insert(PendingOrder {
            pos_id: "P1".into(),
            db_id: 1,
            placed_ts: Utc::now(),
            qty: 1,
            side: Side::Buy,
            price: 1.0,
            broker_info: None,
            simulated: true,
        });

        let status = OrderStatusEvent {
            pos_id: "P1".into(),
            db_id: 1,
            ts: Utc::now(),
            broker_info: None,
        };
        engine.handle_order_filled(status.clone());
        engine.handle_order_filled(status);
        assert!(engine.pending.get("P1").is_none());
    }
}
