//! Durable position store
//!
//! SQLite-backed table of open and closed positions. The monitor and the
//! evaluation loop run concurrently against this store, so every
//! read-then-write sequence on a position is a single conditional UPDATE
//! keyed on the position id, its status, and the protective order id the
//! caller observed when it read the row. A conditional update that matched
//! no row reports `false` rather than failing; the caller treats it as a
//! lost race and backs off.
//!
//! Closed positions are never deleted; they are the audit trail.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use tracing::{debug, info};

use crate::types::Symbol;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Position lifecycle state; `Closed` is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "closed" => PositionStatus::Closed,
            _ => PositionStatus::Open,
        }
    }
}

/// A recorded position
#[derive(Debug, Clone)]
pub struct Position {
    pub id: i64,
    pub symbol: String,
    pub quantity: f64,
    pub entry_price: f64,
    /// Current protective trigger; only ever ratchets upward
    pub stop_price: f64,
    /// Live protective order at the exchange; `None` marks the unprotected
    /// sub-state the monitor must repair
    pub protective_order_id: Option<String>,
    pub status: PositionStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub realized_pnl: Option<f64>,
    pub realized_pnl_pct: Option<f64>,
}

impl Position {
    pub fn symbol(&self) -> Symbol {
        Symbol::new(self.symbol.as_str())
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }
}

/// Fields supplied when recording a freshly opened position
#[derive(Debug, Clone)]
pub struct NewPosition {
    pub symbol: String,
    pub quantity: f64,
    pub entry_price: f64,
    pub stop_price: f64,
    pub protective_order_id: Option<String>,
}

/// SQLite-backed store shared by the evaluation and monitor loops
pub struct PositionStore {
    conn: Arc<Mutex<Connection>>,
}

impl PositionStore {
    /// Open (or create) the database at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let store = PositionStore {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.create_tables()?;
        info!("Position store opened: {}", path.display());

        Ok(store)
    }

    /// In-memory store, used by tests
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = PositionStore {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.create_tables()?;
        Ok(store)
    }

    fn create_tables(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                quantity REAL NOT NULL,
                entry_price REAL NOT NULL,
                stop_price REAL NOT NULL,
                protective_order_id TEXT,
                status TEXT NOT NULL DEFAULT 'open',
                opened_at TEXT NOT NULL,
                closed_at TEXT,
                realized_pnl REAL,
                realized_pnl_pct REAL,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_positions_symbol_status
             ON positions(symbol, status)",
            [],
        )?;

        debug!("Database schema created/verified");
        Ok(())
    }

    fn map_row(row: &Row<'_>) -> rusqlite::Result<Position> {
        let opened_at: String = row.get("opened_at")?;
        let closed_at: Option<String> = row.get("closed_at")?;
        let status: String = row.get("status")?;

        Ok(Position {
            id: row.get("id")?,
            symbol: row.get("symbol")?,
            quantity: row.get("quantity")?,
            entry_price: row.get("entry_price")?,
            stop_price: row.get("stop_price")?,
            protective_order_id: row.get("protective_order_id")?,
            status: PositionStatus::from_str(&status),
            opened_at: opened_at.parse().unwrap_or_else(|_| Utc::now()),
            closed_at: closed_at.and_then(|t| t.parse().ok()),
            realized_pnl: row.get("realized_pnl")?,
            realized_pnl_pct: row.get("realized_pnl_pct")?,
        })
    }

    /// Record a freshly opened position, returning it with its assigned id
    pub fn insert(&self, new: &NewPosition) -> Result<Position, StoreError> {
        let conn = self.conn.lock().unwrap();
        let opened_at = Utc::now();

        conn.execute(
            "INSERT INTO positions
             (symbol, quantity, entry_price, stop_price, protective_order_id,
              status, opened_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'open', ?6)",
            params![
                new.symbol,
                new.quantity,
                new.entry_price,
                new.stop_price,
                new.protective_order_id,
                opened_at.to_rfc3339(),
            ],
        )?;

        let id = conn.last_insert_rowid();
        debug!(
            "Position recorded: #{} {} qty={:.8} @ {:.8} stop={:.8}",
            id, new.symbol, new.quantity, new.entry_price, new.stop_price
        );

        let position = conn.query_row(
            "SELECT * FROM positions WHERE id = ?1",
            params![id],
            Self::map_row,
        )?;
        Ok(position)
    }

    /// Fetch a position by id
    pub fn get(&self, id: i64) -> Result<Option<Position>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let position = conn
            .query_row(
                "SELECT * FROM positions WHERE id = ?1",
                params![id],
                Self::map_row,
            )
            .optional()?;
        Ok(position)
    }

    /// All open positions, for the monitor's sweep
    pub fn open_positions(&self) -> Result<Vec<Position>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM positions WHERE status = 'open' ORDER BY id")?;
        let positions = stmt
            .query_map([], Self::map_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(positions)
    }

    /// The open position on a symbol, if any
    pub fn open_position_for(&self, symbol: &Symbol) -> Result<Option<Position>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let position = conn
            .query_row(
                "SELECT * FROM positions WHERE symbol = ?1 AND status = 'open' LIMIT 1",
                params![symbol.as_str()],
                Self::map_row,
            )
            .optional()?;
        Ok(position)
    }

    /// Every position ever recorded, newest first
    pub fn all_positions(&self) -> Result<Vec<Position>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM positions ORDER BY id DESC")?;
        let positions = stmt
            .query_map([], Self::map_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(positions)
    }

    /// Ratchet the stop upward and swap in the replacement order id.
    ///
    /// Succeeds only while the position is open, the protective order the
    /// caller observed is still the recorded one, and the stored stop is
    /// still strictly below `new_stop`. Returns `false` when another sweep
    /// got there first or the position closed meanwhile.
    pub fn ratchet_stop(
        &self,
        id: i64,
        new_stop: f64,
        observed_order_id: &str,
        new_order_id: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE positions
             SET stop_price = ?2, protective_order_id = ?4,
                 updated_at = CURRENT_TIMESTAMP
             WHERE id = ?1 AND status = 'open'
               AND stop_price < ?2 AND protective_order_id = ?3",
            params![id, new_stop, observed_order_id, new_order_id],
        )?;
        Ok(changed == 1)
    }

    /// Mark the position unprotected, but only if the recorded protective
    /// order is still the one the caller observed.
    pub fn clear_protective_order(
        &self,
        id: i64,
        observed_order_id: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE positions
             SET protective_order_id = NULL, updated_at = CURRENT_TIMESTAMP
             WHERE id = ?1 AND status = 'open' AND protective_order_id = ?2",
            params![id, observed_order_id],
        )?;
        Ok(changed == 1)
    }

    /// Attach a protective order to a position that currently has none.
    /// Returns `false` when some other actor attached one first (or the
    /// position closed); the caller then owns an order the store never
    /// recorded and must cancel it.
    pub fn attach_protective_order(
        &self,
        id: i64,
        order_id: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE positions
             SET protective_order_id = ?2, updated_at = CURRENT_TIMESTAMP
             WHERE id = ?1 AND status = 'open' AND protective_order_id IS NULL",
            params![id, order_id],
        )?;
        Ok(changed == 1)
    }

    /// Finalize a position. Returns `false` when it was already closed; the
    /// transition fires exactly once.
    pub fn close(
        &self,
        id: i64,
        realized_pnl: f64,
        realized_pnl_pct: f64,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE positions
             SET status = 'closed', closed_at = ?2, realized_pnl = ?3,
                 realized_pnl_pct = ?4, updated_at = CURRENT_TIMESTAMP
             WHERE id = ?1 AND status = 'open'",
            params![id, Utc::now().to_rfc3339(), realized_pnl, realized_pnl_pct],
        )?;
        Ok(changed == 1)
    }
}
