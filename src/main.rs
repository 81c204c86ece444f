//! Entry point: wires the execution core's components together and serves
//! the read-mostly HTTP surface alongside the background order lifecycle.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use options_exec_core::advisory_lock::AdvisoryLockService;
use options_exec_core::api::{self, ApiState};
use options_exec_core::broker::{BrokerAdapter, DhanBrokerAdapter, PaperBrokerAdapter};
use options_exec_core::candles::{Candle, CandleAggregator};
use options_exec_core::config::Config;
use options_exec_core::event_bus::EventBus;
use options_exec_core::execution_engine::ExecutionEngine;
use options_exec_core::market_clock::MarketClock;
use options_exec_core::models::PositionStatus;
use options_exec_core::pending_monitor::PendingMonitor;
use options_exec_core::pending_orders::PendingOrderTable;
use options_exec_core::position_store::PositionStore;
use options_exec_core::risk_gate::RiskGate;
use options_exec_core::strategy::StrategyRunner;
use options_exec_core::trade_journal::TradeJournal;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env().context("failed to load configuration")?;
    info!(
        simulate = config.simulate,
        port = config.port,
        "options-exec starting"
    );

    let positions = PositionStore::new();
    let pending = PendingOrderTable::new();
    let risk_gate = RiskGate::new(config.clone(), positions.clone());
    let advisory_lock = AdvisoryLockService::new(&config.database_path, worker_id())
        .context("failed to initialize advisory lock store")?;
    let journal = TradeJournal::new(&config.database_path).context("failed to open trade journal")?;
    let market_clock = MarketClock::new();
    let bus = EventBus::new();

    let broker: Arc<dyn BrokerAdapter> = if config.simulate {
        Arc::new(PaperBrokerAdapter)
    } else {
        match DhanBrokerAdapter::from_env() {
            Some(adapter) => Arc::new(adapter),
            None => {
                warn!("SIMULATE=false but live broker credentials are missing; falling back to paper adapter");
                Arc::new(PaperBrokerAdapter)
            }
        }
    };

    let engine = ExecutionEngine::new(
        config.clone(),
        positions.clone(),
        pending.clone(),
        risk_gate,
        advisory_lock,
        journal.clone(),
        broker.clone(),
        market_clock,
        bus.clone(),
    );
    engine.subscribe();

    let monitor = Arc::new(PendingMonitor::new(
        config.clone(),
        pending.clone(),
        journal.clone(),
        broker,
        bus.clone(),
    ));
    monitor.spawn();

    let candle_db_path = format!("{}.candles", config.database_path);
    let candles = CandleAggregator::new(&candle_db_path).context("failed to open candle store")?;

    let strategy_positions = positions.clone();
    let strategy = Arc::new(StrategyRunner::new(
        bus.clone(),
        Arc::new(average_true_range),
        config.strategy_window,
        config.strategy_confirm_count,
        config.base_qty,
        Arc::new(move |symbol: &str| {
            strategy_positions
                .list()
                .iter()
                .any(|p| p.symbol == symbol && p.status == PositionStatus::Open)
        }),
    ));

    let api_state = ApiState {
        positions: positions.clone(),
        candles: candles.clone(),
        journal: journal.clone(),
        bus: bus.clone(),
        strategy,
    };
    let app = api::router(api_state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await.context("failed to bind listener")?;
    info!(addr = %addr, "HTTP surface listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    if let Err(e) = candles.flush().await {
        warn!(error = %e, "failed to flush candle aggregator on shutdown");
    }

    Ok(())
}

/// Default ATR implementation injected into the strategy runner: a textbook
/// mean true range over the supplied window. The strategy's breakout logic
/// and confirm-count state machine are what this core actually owns; this is
/// just a standard indicator fed into it.
fn average_true_range(window: &[Candle]) -> f64 {
    if window.len() < 2 {
        return 0.0;
    }
    let mut sum = 0.0;
    for pair in window.windows(2) {
        let (prev, cur) = (pair[0], pair[1]);
        let range = (cur.high - cur.low)
            .max((cur.high - prev.close).abs())
            .max((cur.low - prev.close).abs());
        sum += range;
    }
    sum / (window.len() - 1) as f64
}

fn worker_id() -> String {
    std::env::var("WORKER_ID").unwrap_or_else(|_| format!("pid-{}", std::process::id()))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received, draining");
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "options_exec_core=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
