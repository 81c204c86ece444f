//! C5: cross-process mutual exclusion keyed by position id.
//!
//! The original system backs this with Postgres `pg_try_advisory_lock` /
//! `pg_advisory_unlock` on a shared session connection. This crate's
//! persistence layer is SQLite (see the ambient stack notes), which has no
//! session-scoped advisory lock primitive, so the same non-blocking
//! try-lock semantics are emulated with a dedicated table: `try_acquire` is
//! a conditional insert that fails on the primary-key constraint when the
//! key is already held; `release` is a keyed delete.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct AdvisoryLockService {
    conn: Arc<Mutex<Connection>>,
    holder: String,
}

impl AdvisoryLockService {
    pub fn new(db_path: &str, holder: impl Into<String>) -> Result<Self> {
        let conn = Connection::open(db_path).context("open advisory lock db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS advisory_locks (
                lock_key INTEGER PRIMARY KEY,
                holder TEXT NOT NULL,
                acquired_at INTEGER NOT NULL
            )",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            holder: holder.into(),
        })
    }

    /// Derives a stable, 63-bit-signed-range lock key from `pos_id`.
    pub fn lock_key_for(pos_id: &str) -> i64 {
        let mut hasher = DefaultHasher::new();
        pos_id.hash(&mut hasher);
        (hasher.finish() & 0x7FFF_FFFF_FFFF_FFFF) as i64
    }

    /// Non-blocking try-lock. Returns `false` (without erroring) if another
    /// holder already owns the key.
    pub async fn try_acquire(&self, key: i64) -> Result<bool> {
        let conn = self.conn.lock().await;
        let result = conn.execute(
            "INSERT INTO advisory_locks (lock_key, holder, acquired_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![key, self.holder, Utc::now().timestamp()],
        );

        match result {
            Ok(_) => {
                debug!(lock_key = key, "advisory lock acquired");
                Ok(true)
            }
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                debug!(lock_key = key, "advisory lock contended");
                Ok(false)
            }
            Err(e) => Err(e).context("advisory lock acquire failed"),
        }
    }

    pub async fn release(&self, key: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        let affected = conn
            .execute("DELETE FROM advisory_locks WHERE lock_key = ?1", [key])
            .context("advisory lock release failed")?;
        if affected == 0 {
            warn!(lock_key = key, "released a lock that was not held");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn service() -> AdvisoryLockService {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locks.db");
        // Leak the tempdir so the file outlives the test function scope.
        std::mem::forget(dir);
        AdvisoryLockService::new(path.to_str().unwrap(), "worker-1").unwrap()
    }

    #[tokio::test]
    async fn second_acquire_of_same_key_fails_until_released() {
        let svc = service().await;
        let key = AdvisoryLockService::lock_key_for("P1");

        assert!(svc.try_acquire(key).await.unwrap());
        assert!(!svc.try_acquire(key).await.unwrap());

        svc.release(key).await.unwrap();
        assert!(svc.try_acquire(key).await.unwrap());
    }

    #[test]
    fn lock_key_is_deterministic_and_in_63_bit_range() {
        let a = AdvisoryLockService::lock_key_for("P1");
        let b = AdvisoryLockService::lock_key_for("P1");
        let c = AdvisoryLockService::lock_key_for("P2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a >= 0);
    }
}
