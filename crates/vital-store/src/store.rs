use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, Transaction};
use tracing::info;

use crate::db::init_db;
use crate::error::Result;

/// Shared handle over the SQLite connection.
///
/// Thread-safe: the connection sits behind a Mutex; callers either borrow it
/// for reads or run a closure inside an explicit transaction. Closures never
/// await, so the guard is not held across suspension points.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        init_db(&conn)?;
        info!(path = %path.as_ref().display(), "store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Borrow the connection for read-style access.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    /// Run `f` inside a transaction; commit on Ok, roll back on Err.
    pub fn with_tx<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut guard = self.conn.lock().unwrap();
        let tx = guard.transaction()?;
        match f(&tx) {
            Ok(out) => {
                tx.commit()?;
                Ok(out)
            }
            Err(e) => {
                // Dropping the transaction rolls it back.
                drop(tx);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_rolls_back_on_error() {
        let store = Store::open_in_memory().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        let result: Result<()> = store.with_tx(|tx| {
            tx.execute(
                "INSERT INTO users (username, username_normalized, display_name, created_at, updated_at)
                 VALUES ('a', 'a', 'A', ?1, ?1)",
                [&now],
            )?;
            Err(crate::StoreError::Integrity("boom".to_string()))
        });
        assert!(result.is_err());

        let count: i64 = store
            .conn()
            .query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn tx_commits_on_ok() {
        let store = Store::open_in_memory().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        store
            .with_tx(|tx| {
                tx.execute(
                    "INSERT INTO users (username, username_normalized, display_name, created_at, updated_at)
                     VALUES ('a', 'a', 'A', ?1, ?1)",
                    [&now],
                )?;
                Ok(())
            })
            .unwrap();

        let count: i64 = store
            .conn()
            .query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
