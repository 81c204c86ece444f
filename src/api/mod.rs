//! Read-mostly HTTP surface. This is observability and a manual entry point,
//! not the trading path itself — ENTRY_SIGNAL/EXIT_SIGNAL still flow through
//! the EventBus whether they originate here or from the StrategyRunner.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::candles::{CandleAggregator, Tick};
use crate::event_bus::{Event, EventBus};
use crate::models::{EntrySignal, Side};
use crate::position_store::PositionStore;
use crate::strategy::StrategyRunner;
use crate::trade_journal::TradeJournal;

#[derive(Clone)]
pub struct ApiState {
    pub positions: PositionStore,
    pub candles: CandleAggregator,
    pub journal: TradeJournal,
    pub bus: EventBus,
    pub strategy: Arc<StrategyRunner>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/candles/last", get(candles_last))
        .route("/v1/option_chain", get(option_chain))
        .route("/v1/quote", get(quote))
        .route("/v1/positions", get(positions))
        .route("/v1/trades/recent", get(trades_recent))
        .route("/v1/ticks", post(ingest_tick))
        .route("/execute", post(execute))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn bad_request(msg: impl Into<String>) -> (StatusCode, Json<ErrorBody>) {
    (StatusCode::BAD_REQUEST, Json(ErrorBody { error: msg.into() }))
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

#[derive(Deserialize)]
struct CandlesLastQuery {
    symbol: String,
    timeframe_seconds: i64,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    100
}

async fn candles_last(
    State(state): State<ApiState>,
    Query(q): Query<CandlesLastQuery>,
) -> impl IntoResponse {
    if q.timeframe_seconds % 60 != 0 || q.timeframe_seconds <= 0 {
        return bad_request("timeframe_seconds must be a positive multiple of 60").into_response();
    }

    match state.candles.last(&q.symbol, q.timeframe_seconds, q.limit).await {
        Ok(candles) => Json(candles).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorBody { error: e.to_string() }))
            .into_response(),
    }
}

#[derive(Deserialize)]
struct IngestTickRequest {
    symbol: String,
    ltp: f64,
    ts: i64,
}

/// Broker-feed stand-in: this core doesn't own the websocket subscription
/// (out of scope), so normalized ticks arrive here instead and flow through
/// the same CandleAggregator -> StrategyRunner chain a live feed would drive.
async fn ingest_tick(
    State(state): State<ApiState>,
    Json(req): Json<IngestTickRequest>,
) -> impl IntoResponse {
    let closed = match state
        .candles
        .ingest(&req.symbol, Tick { ltp: req.ltp, ts: req.ts })
        .await
    {
        Ok(closed) => closed,
        Err(e) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorBody { error: e.to_string() }))
                .into_response()
        }
    };

    if let Some(candle) = closed {
        state.strategy.on_candle_closed(&req.symbol, candle);
    }

    (StatusCode::ACCEPTED, Json(serde_json::json!({"status": "accepted"}))).into_response()
}

#[derive(Deserialize)]
struct OptionChainQuery {
    #[allow(dead_code)]
    symbol: String,
    #[allow(dead_code)]
    expiry: Option<String>,
}

/// Placeholder surface for the option-chain read path: this core does not
/// own a live option-chain cache (that lives upstream, in the broker feed),
/// so this route only validates shape today.
async fn option_chain(Query(_q): Query<OptionChainQuery>) -> impl IntoResponse {
    Json(serde_json::json!({"chain": []}))
}

#[derive(Deserialize)]
struct QuoteQuery {
    #[allow(dead_code)]
    symbol: String,
}

async fn quote(Query(_q): Query<QuoteQuery>) -> impl IntoResponse {
    Json(serde_json::json!({"ltp": null}))
}

async fn positions(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.positions.list())
}

#[derive(Deserialize)]
struct RecentQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

async fn trades_recent(
    State(state): State<ApiState>,
    Query(q): Query<RecentQuery>,
) -> impl IntoResponse {
    match state.journal.list_recent(q.limit).await {
        Ok(trades) => Json(trades).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorBody { error: e.to_string() }))
            .into_response(),
    }
}

#[derive(Deserialize)]
struct ExecuteRequest {
    security_id: String,
    transaction_type: Side,
    qty: i64,
    index_name: Option<String>,
}

/// Manual order entry. Translates directly into an ENTRY_SIGNAL on the bus;
/// admission and sizing are still decided by the risk gate downstream, same
/// as a strategy-originated signal.
async fn execute(
    State(state): State<ApiState>,
    Json(req): Json<ExecuteRequest>,
) -> impl IntoResponse {
    if req.qty <= 0 {
        return bad_request("qty must be positive").into_response();
    }

    let symbol = req.index_name.unwrap_or_else(|| req.security_id.clone());
    info!(security_id = %req.security_id, qty = req.qty, "manual execute request received");

    state.bus.publish(Event::EntrySignal(EntrySignal {
        pos_id: None,
        symbol,
        side: req.transaction_type,
        quantity: req.qty,
        price: None,
        security_id: Some(req.security_id),
        confidence_score: None,
        stop_loss: None,
    }));

    (StatusCode::ACCEPTED, Json(serde_json::json!({"status": "accepted"}))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> ApiState {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("api.db");
        std::mem::forget(dir);
        let db_path = db_path.to_str().unwrap();
        let bus = EventBus::new();
        ApiState {
            positions: PositionStore::new(),
            candles: CandleAggregator::new(db_path).unwrap(),
            journal: TradeJournal::new(db_path).unwrap(),
            strategy: Arc::new(StrategyRunner::new(
                bus.clone(),
                Arc::new(|_candles| 1.0),
                5,
                1,
                75,
                Arc::new(|_| false),
            )),
            bus,
        }
    }

    #[tokio::test]
    async fn execute_rejects_non_positive_qty() {
        let state = state();
        let resp = execute(
            State(state),
            Json(ExecuteRequest {
                security_id: "SEC1".into(),
                transaction_type: Side::Buy,
                qty: 0,
                index_name: None,
            }),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn execute_publishes_entry_signal() {
        let state = state();
        let bus = state.bus.clone();
        let seen = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let seen_clone = seen.clone();
        bus.subscribe(crate::event_bus::EventKind::EntrySignal, move |_e| {
            let seen = seen_clone.clone();
            async move {
                seen.store(true, std::sync::atomic::Ordering::SeqCst);
            }
        });

        execute(
            State(state),
            Json(ExecuteRequest {
                security_id: "SEC1".into(),
                transaction_type: Side::Buy,
                qty: 50,
                index_name: Some("NIFTY".into()),
            }),
        )
        .await;

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(seen.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn ingest_tick_drives_candles_into_strategy() {
        let state = state();
        let bus = state.bus.clone();
        let seen_qty = Arc::new(std::sync::atomic::AtomicI64::new(-1));
        let seen_qty_clone = seen_qty.clone();
        bus.subscribe(crate::event_bus::EventKind::EntrySignal, move |e| {
            let seen_qty = seen_qty_clone.clone();
            async move {
                if let crate::event_bus::Event::EntrySignal(signal) = e {
                    seen_qty.store(signal.quantity, std::sync::atomic::Ordering::SeqCst);
                }
            }
        });

        for (ltp, ts) in [(100.0, 0_i64), (101.0, 60), (105.0, 120)] {
            ingest_tick(
                State(state.clone()),
                Json(IngestTickRequest { symbol: "NIFTY".into(), ltp, ts }),
            )
            .await;
        }

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        // A quantity of 0 would be silently dropped by RiskGate/ExecutionEngine;
        // assert the strategy actually sizes a placeable lot, not just that it fired.
        assert!(seen_qty.load(std::sync::atomic::Ordering::SeqCst) > 0);
    }
}
