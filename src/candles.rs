//! C11 (collaborator): builds per-minute OHLC candles from a tick stream and
//! persists them, matching the original candle builder's bucket-on-ingest /
//! flush-on-shutdown behavior.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Tick {
    pub ltp: f64,
    pub ts: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    pub ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

struct InProgress {
    symbol: String,
    bucket_ts: i64,
    candle: Candle,
}

/// Stored persistence handle, shared across the in-flight aggregator state.
struct CandleDb {
    conn: Arc<AsyncMutex<Connection>>,
}

impl CandleDb {
    fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open candle db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS candles (
                symbol TEXT NOT NULL,
                ts INTEGER NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                PRIMARY KEY (symbol, ts)
            )",
            [],
        )?;
        Ok(Self {
            conn: Arc::new(AsyncMutex::new(conn)),
        })
    }

    async fn persist(&self, symbol: &str, candle: Candle) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO candles (symbol, ts, open, high, low, close) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(symbol, ts) DO UPDATE SET
                high = MAX(candles.high, excluded.high),
                low = MIN(candles.low, excluded.low),
                close = excluded.close",
            params![symbol, candle.ts, candle.open, candle.high, candle.low, candle.close],
        )?;
        Ok(())
    }

    async fn last(&self, symbol: &str, limit: usize) -> Result<Vec<Candle>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT ts, open, high, low, close FROM candles WHERE symbol = ?1 ORDER BY ts DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![symbol, limit as i64], |row| {
            Ok(Candle {
                ts: row.get(0)?,
                open: row.get(1)?,
                high: row.get(2)?,
                low: row.get(3)?,
                close: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        out.reverse();
        Ok(out)
    }
}

#[derive(Clone)]
pub struct CandleAggregator {
    in_progress: Arc<Mutex<HashMap<String, InProgress>>>,
    db: Arc<CandleDb>,
}

impl CandleAggregator {
    pub fn new(db_path: &str) -> Result<Self> {
        Ok(Self {
            in_progress: Arc::new(Mutex::new(HashMap::new())),
            db: Arc::new(CandleDb::new(db_path)?),
        })
    }

    /// Bucket a tick's timestamp down to the minute.
    fn bucket(ts: i64) -> i64 {
        ts - ts.rem_euclid(60)
    }

    /// Ingests one tick. Returns the just-closed candle when this tick
    /// belongs to a new minute bucket.
    pub async fn ingest(&self, symbol: &str, tick: Tick) -> Result<Option<Candle>> {
        let bucket_ts = Self::bucket(tick.ts);
        let closed = {
            let mut guard = self.in_progress.lock();
            match guard.get_mut(symbol) {
                Some(state) if state.bucket_ts == bucket_ts => {
                    state.candle.high = state.candle.high.max(tick.ltp);
                    state.candle.low = state.candle.low.min(tick.ltp);
                    state.candle.close = tick.ltp;
                    None
                }
                Some(state) => {
                    let closed_candle = state.candle;
                    state.bucket_ts = bucket_ts;
                    state.candle = Candle {
                        ts: bucket_ts,
                        open: tick.ltp,
                        high: tick.ltp,
                        low: tick.ltp,
                        close: tick.ltp,
                    };
                    Some(closed_candle)
                }
                None => {
                    guard.insert(
                        symbol.to_string(),
                        InProgress {
                            symbol: symbol.to_string(),
                            bucket_ts,
                            candle: Candle {
                                ts: bucket_ts,
                                open: tick.ltp,
                                high: tick.ltp,
                                low: tick.ltp,
                                close: tick.ltp,
                            },
                        },
                    );
                    None
                }
            }
        };

        if let Some(candle) = closed {
            self.db.persist(symbol, candle).await?;
            debug!(symbol, ts = candle.ts, "candle closed");
            return Ok(Some(candle));
        }
        Ok(None)
    }

    /// Last `limit` candles for `symbol`, aggregated to `timeframe_seconds`
    /// (a multiple of 60). Aggregation itself only combines stored 1-minute
    /// candles; validating `timeframe_seconds % 60 == 0` is the HTTP
    /// boundary's job, not this method's.
    pub async fn last(&self, symbol: &str, timeframe_seconds: i64, limit: usize) -> Result<Vec<Candle>> {
        let buckets_per_frame = (timeframe_seconds / 60).max(1) as usize;
        let raw = self.db.last(symbol, limit * buckets_per_frame).await?;

        if buckets_per_frame <= 1 {
            return Ok(raw);
        }

        let mut out: Vec<Candle> = Vec::new();
        for chunk in raw.chunks(buckets_per_frame) {
            if chunk.is_empty() {
                continue;
            }
            let mut agg = chunk[0];
            for c in &chunk[1..] {
                agg.high = agg.high.max(c.high);
                agg.low = agg.low.min(c.low);
                agg.close = c.close;
            }
            out.push(agg);
        }
        Ok(out)
    }

    /// Flushes every in-progress (incomplete) candle to storage. Called on
    /// shutdown so no partial minute of data is lost.
    pub async fn flush(&self) -> Result<()> {
        let snapshot: Vec<(String, Candle)> = {
            let guard = self.in_progress.lock();
            guard.values().map(|s| (s.symbol.clone(), s.candle)).collect()
        };
        for (symbol, candle) in snapshot {
            self.db.persist(&symbol, candle).await?;
        }
        Ok(())
    }

    #[cfg(test)]
    fn in_progress_ts(&self, symbol: &str) -> Option<i64> {
        self.in_progress.lock().get(symbol).map(|s| s.bucket_ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn aggregator() -> CandleAggregator {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("candles.db");
        std::mem::forget(dir);
        CandleAggregator::new(path.to_str().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn ticks_within_the_same_minute_update_one_candle() {
        let agg = aggregator().await;
        assert!(agg.ingest("NIFTY", Tick { ltp: 100.0, ts: 0 }).await.unwrap().is_none());
        assert!(agg.ingest("NIFTY", Tick { ltp: 105.0, ts: 30 }).await.unwrap().is_none());
        assert_eq!(agg.in_progress_ts("NIFTY"), Some(0));
    }

    #[tokio::test]
    async fn a_tick_in_a_new_minute_closes_the_prior_candle() {
        let agg = aggregator().await;
        agg.ingest("NIFTY", Tick { ltp: 100.0, ts: 0 }).await.unwrap();
        agg.ingest("NIFTY", Tick { ltp: 110.0, ts: 30 }).await.unwrap();
        let closed = agg
            .ingest("NIFTY", Tick { ltp: 90.0, ts: 61 })
            .await
            .unwrap()
            .expect("prior candle closes");
        assert_eq!(closed.open, 100.0);
        assert_eq!(closed.high, 110.0);
        assert_eq!(closed.close, 110.0);
    }

    #[tokio::test]
    async fn flush_persists_the_incomplete_candle() {
        let agg = aggregator().await;
        agg.ingest("NIFTY", Tick { ltp: 100.0, ts: 0 }).await.unwrap();
        agg.flush().await.unwrap();
        let stored = agg.last("NIFTY", 60, 10).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].open, 100.0);
    }

    #[tokio::test]
    async fn last_aggregates_multiple_one_minute_candles_into_a_wider_timeframe() {
        let agg = aggregator().await;
        for (ts, price) in [(0, 100.0), (60, 110.0), (120, 90.0), (180, 95.0)] {
            agg.ingest("NIFTY", Tick { ltp: price, ts }).await.unwrap();
        }
        agg.flush().await.unwrap();
        let frames = agg.last("NIFTY", 120, 10).await.unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].open, 100.0);
        assert_eq!(frames[0].high, 110.0);
    }
}
