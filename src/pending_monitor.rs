//! C8: background reconciler for pending orders that never heard back from
//! the broker within `order_timeout_seconds`.

use std::sync::Arc;

use chrono::Utc;
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};

use crate::broker::BrokerAdapter;
use crate::config::Config;
use crate::event_bus::{Event, EventBus};
use crate::models::OrderTimeoutEvent;
use crate::pending_orders::PendingOrderTable;
use crate::trade_journal::TradeJournal;

pub struct PendingMonitor {
    config: Config,
    pending: PendingOrderTable,
    journal: TradeJournal,
    broker: Arc<dyn BrokerAdapter>,
    bus: EventBus,
}

impl PendingMonitor {
    pub fn new(
        config: Config,
        pending: PendingOrderTable,
        journal: TradeJournal,
        broker: Arc<dyn BrokerAdapter>,
        bus: EventBus,
    ) -> Self {
        Self {
            config,
            pending,
            journal,
            broker,
            bus,
        }
    }

    /// Spawns the monitor loop, returning its join handle so callers can
    /// hold onto it for graceful shutdown.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_secs(self.config.monitor_interval_seconds()));
        loop {
            ticker.tick().await;
            if let Err(e) = self.scan_once().await {
                error!(error = %e, "pending monitor iteration failed, retrying after 5s");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }

    async fn scan_once(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        for order in self.pending.list() {
            let age = (now - order.placed_ts).num_seconds().max(0) as u64;
            if age < self.config.order_timeout_seconds {
                continue;
            }

            if !self.config.simulate {
                if let Some(order_id) = order
                    .broker_info
                    .as_ref()
                    .and_then(|v| v.get("order_id"))
                    .and_then(|v| v.as_str())
                {
                    if let Err(e) = self.broker.cancel_order(order_id).await {
                        warn!(pos_id = %order.pos_id, error = %e, "best-effort broker cancel failed");
                    }
                }
            }

            self.bus.publish(Event::OrderTimeout(OrderTimeoutEvent {
                pos_id: order.pos_id.clone(),
                db_id: order.db_id,
                age_seconds: age,
                info: order.broker_info.clone(),
            }));

            self.journal.mark_timed_out(order.db_id).await?;
            self.pending.remove(&order.pos_id);

            info!(pos_id = %order.pos_id, age_seconds = age, "pending order timed out");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBrokerAdapter;
    use crate::event_bus::EventKind;
    use crate::models::{PendingOrder, Side};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    fn config(timeout: u64) -> Config {
        Config {
            database_path: String::new(),
            port: 0,
            simulate: true,
            order_timeout_seconds: timeout,
            max_position: 100,
            max_daily_loss: 1_000.0,
            max_trades_per_day: 100,
            base_qty: 1,
            initial_stoploss: None,
            strategy_window: 20,
            strategy_confirm_count: 2,
            dhan_client_id: None,
            dhan_access_token: None,
        }
    }

    async fn journal_and_pending() -> (TradeJournal, PendingOrderTable) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.db");
        std::mem::forget(dir);
        let journal = TradeJournal::new(path.to_str().unwrap()).unwrap();
        (journal, PendingOrderTable::new())
    }

    #[tokio::test]
    async fn expired_entries_publish_timeout_and_are_removed() {
        let (journal, pending) = journal_and_pending().await;
        let db_id = journal
            .record(Side::Buy, 1, 1.0, crate::models::TradeStatus::Sent, serde_json::json!({}))
            .await
            .unwrap();

        pending.insert(PendingOrder {
            pos_id: "P1".into(),
            db_id,
            placed_ts: Utc::now() - chrono::Duration::seconds(10),
            qty: 1,
            side: Side::Buy,
            price: 1.0,
            broker_info: None,
            simulated: true,
        });

        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        bus.subscribe(EventKind::OrderTimeout, move |_event| {
            let seen = seen_clone.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        let monitor = Arc::new(PendingMonitor::new(
            config(5),
            pending.clone(),
            journal.clone(),
            Arc::new(PaperBrokerAdapter),
            bus,
        ));
        monitor.scan_once().await.unwrap();

        assert!(pending.is_empty());
        let record = journal.get(db_id).await.unwrap().unwrap();
        assert_eq!(record.status.as_str(), "timed_out");

        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fresh_entries_are_left_alone() {
        let (journal, pending) = journal_and_pending().await;
        let db_id = journal
            .record(Side::Buy, 1, 1.0, crate::models::TradeStatus::Sent, serde_json::json!({}))
            .await
            .unwrap();
        pending.insert(PendingOrder {
            pos_id: "P1".into(),
            db_id,
            placed_ts: Utc::now(),
            qty: 1,
            side: Side::Buy,
            price: 1.0,
            broker_info: None,
            simulated: true,
        });

        let monitor = PendingMonitor::new(
            config(30),
            pending.clone(),
            journal,
            Arc::new(PaperBrokerAdapter),
            EventBus::new(),
        );
        monitor.scan_once().await.unwrap();
        assert!(!pending.is_empty());
    }
}
