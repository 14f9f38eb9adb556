pub mod cache;
pub mod catalog;
pub mod curation;
pub mod query;
pub mod repo;
pub mod schema;

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::Connection;
use tracing::debug;

use crate::error::Result;
use schema::SCHEMA;

/// Owns one SQLite connection with the schema applied.
///
/// A `Store` is meant to live for one caller-visible operation (or one
/// request) and be dropped afterwards, which closes the connection.
pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        // Concurrent writers wait here instead of failing with SQLITE_BUSY.
        conn.busy_timeout(busy_timeout)?;
        let store = Self { conn };
        store.initialize_schema()?;
        debug!("Opened store at {:?}", path.as_ref());
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<()> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

/// Everything needed to open a [`Store`] on demand.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub busy_timeout: Duration,
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>, busy_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            busy_timeout,
        }
    }

    pub fn open(&self) -> Result<Store> {
        Store::open(&self.path, self.busy_timeout)
    }
}

/// Largest id list bound into a single `IN (...)`; longer lists are chunked.
pub const MAX_IN_LIST: usize = 500;

/// `?,?,?` for `n` bound values.
///
/// Callers bind the values themselves; nothing user supplied is ever
/// formatted into SQL.
pub fn placeholders(n: usize) -> String {
    let mut out = String::with_capacity(n.saturating_mul(2));
    for i in 0..n {
        if i > 0 {
            out.push(',');
        }
        out.push('?');
    }
    out
}
