//! Process configuration, loaded once at startup from the environment.

/// Runtime configuration for the execution core.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,

    /// When true, no broker calls are made; fills are simulated and gated
    /// by market hours.
    pub simulate: bool,
    pub order_timeout_seconds: u64,
    pub max_position: i64,
    pub max_daily_loss: f64,
    pub max_trades_per_day: u32,
    pub base_qty: i64,
    pub initial_stoploss: Option<f64>,

    /// Rolling candle window the breakout strategy evaluates against.
    pub strategy_window: usize,
    /// Consecutive confirming candles required before the strategy flips direction.
    pub strategy_confirm_count: u32,

    pub dhan_client_id: Option<String>,
    pub dhan_access_token: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./options_exec.db".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let simulate = std::env::var("SIMULATE")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
            .unwrap_or(true);

        let order_timeout_seconds = std::env::var("ORDER_TIMEOUT_SECONDS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .unwrap_or(30);

        let max_position = std::env::var("MAX_POSITION")
            .unwrap_or_else(|_| "100".to_string())
            .parse()
            .unwrap_or(100);

        let max_daily_loss = std::env::var("MAX_DAILY_LOSS")
            .unwrap_or_else(|_| "5000".to_string())
            .parse()
            .unwrap_or(5000.0);

        let max_trades_per_day = std::env::var("MAX_TRADES_PER_DAY")
            .unwrap_or_else(|_| "20".to_string())
            .parse()
            .unwrap_or(20);

        let base_qty = std::env::var("BASE_QTY")
            .unwrap_or_else(|_| "50".to_string())
            .parse()
            .unwrap_or(50);

        let initial_stoploss = std::env::var("INITIAL_STOPLOSS")
            .ok()
            .and_then(|v| v.parse().ok());

        let strategy_window = std::env::var("STRATEGY_WINDOW")
            .unwrap_or_else(|_| "20".to_string())
            .parse()
            .unwrap_or(20);

        let strategy_confirm_count = std::env::var("STRATEGY_CONFIRM_COUNT")
            .unwrap_or_else(|_| "2".to_string())
            .parse()
            .unwrap_or(2);

        let dhan_client_id = std::env::var("DHAN_CLIENT_ID").ok();
        let dhan_access_token = std::env::var("DHAN_ACCESS_TOKEN").ok();

        Ok(Self {
            database_path,
            port,
            simulate,
            order_timeout_seconds,
            max_position,
            max_daily_loss,
            max_trades_per_day,
            base_qty,
            initial_stoploss,
            strategy_window,
            strategy_confirm_count,
            dhan_client_id,
            dhan_access_token,
        })
    }

    /// Seconds between PendingMonitor scans: `max(1, min(5, timeout/3))`.
    pub fn monitor_interval_seconds(&self) -> u64 {
        (self.order_timeout_seconds / 3).clamp(1, 5)
    }

    pub fn has_live_credentials(&self) -> bool {
        self.dhan_client_id.is_some() && self.dhan_access_token.is_some()
    }
}
