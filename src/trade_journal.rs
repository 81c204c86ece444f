//! C6: append-only persistence of every order state transition.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use tokio::sync::Mutex;

use crate::models::{Side, TradeRecord, TradeStatus};

#[derive(Clone)]
pub struct TradeJournal {
    conn: Arc<Mutex<Connection>>,
}

impl TradeJournal {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open trade journal db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts INTEGER NOT NULL,
                side TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                price REAL NOT NULL,
                status TEXT NOT NULL,
                info TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_trades_status ON trades(status)",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Inserts an immutable row and returns its new id.
    pub async fn record(
        &self,
        side: Side,
        qty: i64,
        price: f64,
        status: TradeStatus,
        info: serde_json::Value,
    ) -> Result<i64> {
        let conn = self.conn.lock().await;
        let ts = Utc::now();
        conn.execute(
            "INSERT INTO trades (ts, side, quantity, price, status, info) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                ts.timestamp(),
                side.as_str(),
                qty,
                price,
                status.as_str(),
                info.to_string(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Updates a single row's status to `timed_out`. This is the one
    /// permitted in-place mutation of an existing row.
    pub async fn mark_timed_out(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE trades SET status = ?1 WHERE id = ?2",
            params![TradeStatus::TimedOut.as_str(), id],
        )?;
        Ok(())
    }

    pub async fn get(&self, id: i64) -> Result<Option<TradeRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, ts, side, quantity, price, status, info FROM trades WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![id])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        Ok(Some(row_to_record(row)?))
    }

    pub async fn list_recent(&self, limit: usize) -> Result<Vec<TradeRecord>> {
        let limit = limit.clamp(1, 10_000) as i64;
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, ts, side, quantity, price, status, info FROM trades ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| Ok(row_to_record(row)))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r??);
        }
        Ok(out)
    }
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<TradeRecord> {
    let id: i64 = row.get(0)?;
    let ts: i64 = row.get(1)?;
    let side: String = row.get(2)?;
    let quantity: i64 = row.get(3)?;
    let price: f64 = row.get(4)?;
    let status: String = row.get(5)?;
    let info: String = row.get(6)?;

    let side = side.parse().unwrap_or(Side::Buy);
    let status = match status.as_str() {
        "created" => TradeStatus::Created,
        "simulated" => TradeStatus::Simulated,
        "sent" => TradeStatus::Sent,
        "filled" => TradeStatus::Filled,
        "rejected" => TradeStatus::Rejected,
        "failed" => TradeStatus::Failed,
        "closed" => TradeStatus::Closed,
        "timed_out" => TradeStatus::TimedOut,
        other => {
            tracing::warn!(status = other, "unrecognized trade status in journal row, treating as timed_out");
            TradeStatus::TimedOut
        }
    };

    Ok(TradeRecord {
        id,
        ts: chrono::DateTime::from_timestamp(ts, 0).unwrap_or_else(chrono::Utc::now),
        side,
        quantity,
        price,
        status,
        info: serde_json::from_str(&info).unwrap_or(serde_json::Value::Null),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn journal() -> TradeJournal {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.db");
        std::mem::forget(dir);
        TradeJournal::new(path.to_str().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn record_then_mark_timed_out_updates_in_place() {
        let journal = journal().await;
        let id = journal
            .record(Side::Buy, 50, 100.0, TradeStatus::Sent, serde_json::json!({}))
            .await
            .unwrap();

        journal.mark_timed_out(id).await.unwrap();
        let record = journal.get(id).await.unwrap().expect("row exists");
        assert_eq!(record.status.as_str(), "timed_out");
    }

    #[tokio::test]
    async fn ids_are_monotonically_increasing() {
        let journal = journal().await;
        let first = journal
            .record(Side::Buy, 1, 1.0, TradeStatus::Simulated, serde_json::json!({}))
            .await
            .unwrap();
        let second = journal
            .record(Side::Sell, 1, 1.0, TradeStatus::Simulated, serde_json::json!({}))
            .await
            .unwrap();
        assert!(second > first);
    }
}
