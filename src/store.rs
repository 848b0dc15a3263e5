// ===============================
// src/store.rs
// ===============================
//
// Relational state: markets, trades, positions, system_events,
// price_history, oracle_updates (+ sync_state cursor). SQLite behind an
// async mutex; every write is a single statement except the price commit,
// the pending-trade record and trade confirmation, which run inside one
// transaction each.
//
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::error;

use crate::domain::{
    EventType, Market, NewEvent, OracleUpdate, Position, PricePoint, Side, SystemEvent, Trade,
    TradeStatus,
};
use crate::metrics::MALFORMED_ROWS;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("duplicate settlement signature {0}")]
    DuplicateSignature(String),
    #[error("market {0} not found")]
    MarketNotFound(String),
    #[error("market {market} price moved under us (expected {expected})")]
    StalePrice { market: String, expected: i64 },
    #[error("malformed {table} row: {detail}")]
    Malformed { table: &'static str, detail: String },
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Everything one accepted price move writes, committed atomically.
#[derive(Debug, Clone)]
pub struct PriceCommit {
    pub market_id: String,
    pub old_price: i64,
    pub new_price: i64,
    pub source: String,
    pub at: DateTime<Utc>,
    pub event: NewEvent,
}

/// Result of promoting a pending trade.
#[derive(Debug, Clone)]
pub struct ConfirmedFill {
    pub trade: Trade,
    pub position: Option<Position>,
}

fn ms(t: DateTime<Utc>) -> i64 { t.timestamp_millis() }
fn from_ms(v: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(v).single().unwrap_or_default()
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS markets (
    id TEXT PRIMARY KEY,
    bond_id TEXT NOT NULL,
    name TEXT NOT NULL,
    current_price INTEGER NOT NULL CHECK (current_price > 0),
    paused INTEGER NOT NULL DEFAULT 0,
    active INTEGER NOT NULL DEFAULT 1,
    program_market TEXT,
    vault_bond TEXT,
    vault_usdc TEXT,
    admin TEXT,
    updated_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS trades (
    signature TEXT PRIMARY KEY,
    market_id TEXT NOT NULL,
    trader TEXT NOT NULL,
    side TEXT NOT NULL,
    amount INTEGER NOT NULL,
    price INTEGER NOT NULL,
    total_value INTEGER NOT NULL,
    status TEXT NOT NULL,
    slot INTEGER,
    confirmed_at INTEGER,
    failure TEXT,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_trades_status ON trades(status, created_at);
CREATE TABLE IF NOT EXISTS positions (
    trader TEXT NOT NULL,
    market_id TEXT NOT NULL,
    quantity INTEGER NOT NULL,
    avg_cost INTEGER NOT NULL,
    cost_basis INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (trader, market_id)
);
CREATE TABLE IF NOT EXISTS system_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    market_id TEXT,
    signature TEXT,
    payload TEXT NOT NULL,
    processed INTEGER NOT NULL DEFAULT 0,
    outcome TEXT,
    created_at INTEGER NOT NULL,
    processed_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_events_pending ON system_events(processed, created_at);
CREATE INDEX IF NOT EXISTS idx_events_signature ON system_events(signature);
CREATE TABLE IF NOT EXISTS price_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    market_id TEXT NOT NULL,
    price INTEGER NOT NULL,
    source TEXT NOT NULL,
    recorded_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_price_history_market ON price_history(market_id, recorded_at);
CREATE TABLE IF NOT EXISTS oracle_updates (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    market_id TEXT NOT NULL,
    old_price INTEGER NOT NULL,
    new_price INTEGER NOT NULL,
    source TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS sync_state (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
";

/// Outcome stamped on event rows that cannot be decoded.
pub const MALFORMED_OUTCOME: &str = "malformed";

const MARKET_COLS: &str =
    "id, bond_id, name, current_price, paused, active, program_market, vault_bond, vault_usdc, admin, updated_at";
const TRADE_COLS: &str =
    "signature, market_id, trader, side, amount, price, total_value, status, slot, confirmed_at, created_at";
const EVENT_COLS: &str =
    "id, event_type, market_id, signature, payload, processed, outcome, created_at, processed_at";

fn market_from_row(row: &Row<'_>) -> rusqlite::Result<Market> {
    Ok(Market {
        id: row.get(0)?,
        bond_id: row.get(1)?,
        name: row.get(2)?,
        current_price: row.get(3)?,
        paused: row.get(4)?,
        active: row.get(5)?,
        program_market: row.get(6)?,
        vault_bond: row.get(7)?,
        vault_usdc: row.get(8)?,
        admin: row.get(9)?,
        updated_at: from_ms(row.get(10)?),
    })
}

// Raw trade row; enum columns are validated afterwards.
type TradeRow = (String, String, String, String, i64, i64, i64, String, Option<i64>, Option<i64>, i64);

fn trade_row(row: &Row<'_>) -> rusqlite::Result<TradeRow> {
    Ok((
        row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?,
        row.get(6)?, row.get(7)?, row.get(8)?, row.get(9)?, row.get(10)?,
    ))
}

fn trade_from_raw(r: TradeRow) -> Result<Trade, StoreError> {
    let side = Side::parse(&r.3).ok_or_else(|| StoreError::Malformed {
        table: "trades",
        detail: format!("{}: side {:?}", r.0, r.3),
    })?;
    let status = TradeStatus::parse(&r.7).ok_or_else(|| StoreError::Malformed {
        table: "trades",
        detail: format!("{}: status {:?}", r.0, r.7),
    })?;
    Ok(Trade {
        signature: r.0,
        market_id: r.1,
        trader: r.2,
        side,
        amount: r.4,
        price: r.5,
        total_value: r.6,
        status,
        slot: r.8.map(|s| s as u64),
        confirmed_at: r.9.map(from_ms),
        created_at: from_ms(r.10),
    })
}

type EventRow = (i64, String, Option<String>, Option<String>, String, bool, Option<String>, i64, Option<i64>);

fn event_row(row: &Row<'_>) -> rusqlite::Result<EventRow> {
    Ok((
        row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?,
        row.get(5)?, row.get(6)?, row.get(7)?, row.get(8)?,
    ))
}

fn event_from_raw(r: EventRow) -> Result<SystemEvent, StoreError> {
    let event_type = EventType::parse(&r.1).ok_or_else(|| StoreError::Malformed {
        table: "system_events",
        detail: format!("{}: event_type {:?}", r.0, r.1),
    })?;
    let payload: Value = serde_json::from_str(&r.4).map_err(|e| StoreError::Malformed {
        table: "system_events",
        detail: format!("{}: payload {e}", r.0),
    })?;
    Ok(SystemEvent {
        id: r.0,
        event_type,
        market_id: r.2,
        signature: r.3,
        payload,
        processed: r.5,
        outcome: r.6,
        created_at: from_ms(r.7),
        processed_at: r.8.map(from_ms),
    })
}

fn position_from_row(row: &Row<'_>) -> rusqlite::Result<Position> {
    Ok(Position {
        trader: row.get(0)?,
        market_id: row.get(1)?,
        quantity: row.get(2)?,
        avg_cost: row.get(3)?,
        cost_basis: row.get(4)?,
        updated_at: from_ms(row.get(5)?),
    })
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation)
}

fn insert_event_on(conn: &Connection, ev: &NewEvent, processed: Option<&str>) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO system_events (event_type, market_id, signature, payload, processed, outcome, created_at, processed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            ev.event_type.as_str(),
            ev.market_id,
            ev.signature,
            serde_json::to_string(&ev.payload)?,
            processed.is_some(),
            processed,
            ms(ev.created_at),
            processed.map(|_| ms(Utc::now())),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    // ---------------- markets ----------------

    pub async fn upsert_market(&self, m: &Market) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO markets (id, bond_id, name, current_price, paused, active, program_market, vault_bond, vault_usdc, admin, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                bond_id = excluded.bond_id,
                name = excluded.name,
                current_price = excluded.current_price,
                paused = excluded.paused,
                active = excluded.active,
                program_market = excluded.program_market,
                vault_bond = excluded.vault_bond,
                vault_usdc = excluded.vault_usdc,
                admin = excluded.admin,
                updated_at = excluded.updated_at",
            params![
                m.id, m.bond_id, m.name, m.current_price, m.paused, m.active,
                m.program_market, m.vault_bond, m.vault_usdc, m.admin, ms(m.updated_at),
            ],
        )?;
        Ok(())
    }

    pub async fn market(&self, id: &str) -> Result<Option<Market>, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {MARKET_COLS} FROM markets WHERE id = ?1");
        Ok(conn.query_row(&sql, [id], market_from_row).optional()?)
    }

    pub async fn markets(&self) -> Result<Vec<Market>, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {MARKET_COLS} FROM markets ORDER BY id ASC");
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map([], market_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn set_paused(&self, id: &str, paused: bool) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "UPDATE markets SET paused = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, paused, ms(Utc::now())],
        )?;
        if n == 0 {
            return Err(StoreError::MarketNotFound(id.to_string()));
        }
        Ok(())
    }

    // ---------------- trades ----------------

    /// Insert a new trade. A signature that already exists is rejected.
    #[cfg(test)]
    pub async fn insert_trade(&self, t: &Trade) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let res = conn.execute(
            "INSERT INTO trades (signature, market_id, trader, side, amount, price, total_value, status, slot, confirmed_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                t.signature, t.market_id, t.trader, t.side.as_str(), t.amount, t.price, t.total_value,
                t.status.as_str(), t.slot.map(|s| s as i64), t.confirmed_at.map(ms), ms(t.created_at),
            ],
        );
        match res {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::DuplicateSignature(t.signature.clone())),
            Err(e) => Err(e.into()),
        }
    }

    /// Insert a freshly submitted trade together with the `trade` event the
    /// reconciler will settle it from. Either both rows land or neither does.
    pub async fn record_pending_trade(&self, t: &Trade, ev: &NewEvent) -> Result<i64, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let res = tx.execute(
            "INSERT INTO trades (signature, market_id, trader, side, amount, price, total_value, status, slot, confirmed_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                t.signature, t.market_id, t.trader, t.side.as_str(), t.amount, t.price, t.total_value,
                t.status.as_str(), t.slot.map(|s| s as i64), t.confirmed_at.map(ms), ms(t.created_at),
            ],
        );
        match res {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => return Err(StoreError::DuplicateSignature(t.signature.clone())),
            Err(e) => return Err(e.into()),
        }
        let id = insert_event_on(&tx, ev, None)?;
        tx.commit()?;
        Ok(id)
    }

    pub async fn trade(&self, signature: &str) -> Result<Option<Trade>, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {TRADE_COLS} FROM trades WHERE signature = ?1");
        let raw = conn.query_row(&sql, [signature], trade_row).optional()?;
        raw.map(trade_from_raw).transpose()
    }

    pub async fn trades_with_status(&self, status: TradeStatus) -> Result<Vec<Trade>, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {TRADE_COLS} FROM trades WHERE status = ?1 ORDER BY created_at ASC");
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map([status.as_str()], trade_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(trade_from_raw(r?)?);
        }
        Ok(out)
    }

    /// Promote a pending trade to confirmed and fold it into the trader's
    /// position in one transaction. Returns `None` if the trade is unknown
    /// or no longer pending, which makes repeated confirmation a no-op.
    pub async fn confirm_trade<F>(
        &self,
        signature: &str,
        slot: u64,
        at: DateTime<Utc>,
        apply: F,
    ) -> Result<Option<ConfirmedFill>, StoreError>
    where
        F: FnOnce(Option<&Position>, &Trade) -> Option<Position>,
    {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let n = tx.execute(
            "UPDATE trades SET status = 'confirmed', slot = ?2, confirmed_at = ?3
             WHERE signature = ?1 AND status = 'pending'",
            params![signature, slot as i64, ms(at)],
        )?;
        if n == 0 {
            return Ok(None);
        }

        let sql = format!("SELECT {TRADE_COLS} FROM trades WHERE signature = ?1");
        let trade = trade_from_raw(tx.query_row(&sql, [signature], trade_row)?)?;

        let prev = tx
            .query_row(
                "SELECT trader, market_id, quantity, avg_cost, cost_basis, updated_at
                 FROM positions WHERE trader = ?1 AND market_id = ?2",
                params![trade.trader, trade.market_id],
                position_from_row,
            )
            .optional()?;

        let position = apply(prev.as_ref(), &trade);
        match &position {
            Some(p) => {
                tx.execute(
                    "INSERT INTO positions (trader, market_id, quantity, avg_cost, cost_basis, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(trader, market_id) DO UPDATE SET
                        quantity = excluded.quantity,
                        avg_cost = excluded.avg_cost,
                        cost_basis = excluded.cost_basis,
                        updated_at = excluded.updated_at",
                    params![p.trader, p.market_id, p.quantity, p.avg_cost, p.cost_basis, ms(p.updated_at)],
                )?;
            }
            None => {
                tx.execute(
                    "DELETE FROM positions WHERE trader = ?1 AND market_id = ?2",
                    params![trade.trader, trade.market_id],
                )?;
            }
        }

        tx.commit()?;
        Ok(Some(ConfirmedFill { trade, position }))
    }

    /// Mark a pending trade failed; returns whether a row changed.
    pub async fn fail_trade(&self, signature: &str, slot: u64, reason: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "UPDATE trades SET status = 'failed', slot = ?2, failure = ?3
             WHERE signature = ?1 AND status = 'pending'",
            params![signature, slot as i64, reason],
        )?;
        Ok(n > 0)
    }

    // ---------------- positions ----------------

    pub async fn position(&self, trader: &str, market_id: &str) -> Result<Option<Position>, StoreError> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                "SELECT trader, market_id, quantity, avg_cost, cost_basis, updated_at
                 FROM positions WHERE trader = ?1 AND market_id = ?2",
                params![trader, market_id],
                position_from_row,
            )
            .optional()?)
    }

    // ---------------- system events ----------------

    pub async fn insert_event(&self, ev: &NewEvent) -> Result<i64, StoreError> {
        let conn = self.conn.lock().await;
        insert_event_on(&conn, ev, None)
    }

    /// Insert an event that is already settled (e.g. synthesized from the ledger).
    pub async fn insert_processed_event(&self, ev: &NewEvent, outcome: &str) -> Result<i64, StoreError> {
        let conn = self.conn.lock().await;
        insert_event_on(&conn, ev, Some(outcome))
    }

    /// Oldest-first unprocessed events of the given types. Malformed rows
    /// are logged, counted and marked processed with outcome `malformed`,
    /// so they never occupy a slot in a later batch.
    pub async fn unprocessed_events(&self, types: &[EventType], limit: usize) -> Result<Vec<SystemEvent>, StoreError> {
        let conn = self.conn.lock().await;
        let placeholders = vec!["?"; types.len()].join(", ");
        let sql = format!(
            "SELECT {EVENT_COLS} FROM system_events
             WHERE processed = 0 AND event_type IN ({placeholders})
             ORDER BY created_at ASC, id ASC LIMIT {limit}"
        );
        let mut out = Vec::new();
        let mut malformed = Vec::new();
        {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(types.iter().map(|t| t.as_str())), event_row)?;
            for r in rows {
                let raw = r?;
                let id = raw.0;
                match event_from_raw(raw) {
                    Ok(ev) => out.push(ev),
                    Err(e) => {
                        error!(event = id, ?e, "malformed system event, retiring it");
                        MALFORMED_ROWS.with_label_values(&["system_events"]).inc();
                        malformed.push(id);
                    }
                }
            }
        }
        for id in malformed {
            conn.execute(
                "UPDATE system_events SET processed = 1, outcome = ?2, processed_at = ?3 WHERE id = ?1",
                params![id, MALFORMED_OUTCOME, ms(Utc::now())],
            )?;
        }
        Ok(out)
    }

    /// Flip `processed`; a content match may attach the ledger signature.
    pub async fn mark_event_processed(&self, id: i64, outcome: &str, signature: Option<&str>) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE system_events
             SET processed = 1, outcome = ?2, processed_at = ?3, signature = COALESCE(signature, ?4)
             WHERE id = ?1",
            params![id, outcome, ms(Utc::now()), signature],
        )?;
        Ok(())
    }

    pub async fn event(&self, id: i64) -> Result<Option<SystemEvent>, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {EVENT_COLS} FROM system_events WHERE id = ?1");
        let raw = conn.query_row(&sql, [id], event_row).optional()?;
        raw.map(event_from_raw).transpose()
    }

    pub async fn events_for_signature(&self, signature: &str) -> Result<Vec<SystemEvent>, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {EVENT_COLS} FROM system_events WHERE signature = ?1 ORDER BY id ASC");
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map([signature], event_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(event_from_raw(r?)?);
        }
        Ok(out)
    }

    /// True if any local record (event or trade) carries this signature.
    pub async fn has_record_for_signature(&self, signature: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let found: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM system_events WHERE signature = ?1)
                 OR EXISTS(SELECT 1 FROM trades WHERE signature = ?1)",
            [signature],
            |row| row.get(0),
        )?;
        Ok(found)
    }

    // ---------------- prices ----------------

    /// Apply an accepted price move: market price, history row, oracle
    /// audit row and system event, all or nothing. The market update is
    /// guarded on the price the move was validated against.
    pub async fn apply_price_update(&self, c: &PriceCommit) -> Result<i64, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let n = tx.execute(
            "UPDATE markets SET current_price = ?2, updated_at = ?4 WHERE id = ?1 AND current_price = ?3",
            params![c.market_id, c.new_price, c.old_price, ms(c.at)],
        )?;
        if n == 0 {
            let exists: bool =
                tx.query_row("SELECT EXISTS(SELECT 1 FROM markets WHERE id = ?1)", [&c.market_id], |r| r.get(0))?;
            // dropping `tx` rolls back
            return Err(if exists {
                StoreError::StalePrice { market: c.market_id.clone(), expected: c.old_price }
            } else {
                StoreError::MarketNotFound(c.market_id.clone())
            });
        }

        tx.execute(
            "INSERT INTO price_history (market_id, price, source, recorded_at) VALUES (?1, ?2, ?3, ?4)",
            params![c.market_id, c.new_price, c.source, ms(c.at)],
        )?;
        tx.execute(
            "INSERT INTO oracle_updates (market_id, old_price, new_price, source, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![c.market_id, c.old_price, c.new_price, c.source, ms(c.at)],
        )?;
        let event_id = insert_event_on(&tx, &c.event, None)?;

        tx.commit()?;
        Ok(event_id)
    }

    pub async fn price_history(&self, market_id: &str) -> Result<Vec<PricePoint>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT market_id, price, source, recorded_at FROM price_history WHERE market_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([market_id], |row| {
            Ok(PricePoint {
                market_id: row.get(0)?,
                price: row.get(1)?,
                source: row.get(2)?,
                recorded_at: from_ms(row.get(3)?),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn oracle_updates(&self, market_id: &str) -> Result<Vec<OracleUpdate>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT market_id, old_price, new_price, source, created_at FROM oracle_updates WHERE market_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([market_id], |row| {
            Ok(OracleUpdate {
                market_id: row.get(0)?,
                old_price: row.get(1)?,
                new_price: row.get(2)?,
                source: row.get(3)?,
                created_at: from_ms(row.get(4)?),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ---------------- sync cursor ----------------

    /// Keep the highest slot ever seen; returns the stored value.
    pub async fn record_slot(&self, slot: u64) -> Result<u64, StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO sync_state (key, value) VALUES ('last_slot', ?1)
             ON CONFLICT(key) DO UPDATE SET value = MAX(value, excluded.value)",
            [slot as i64],
        )?;
        let v: i64 = conn.query_row("SELECT value FROM sync_state WHERE key = 'last_slot'", [], |r| r.get(0))?;
        Ok(v as u64)
    }

    #[cfg(test)]
    pub async fn raw_execute(&self, sql: &str) -> Result<usize, StoreError> {
        let conn = self.conn.lock().await;
        Ok(conn.execute(sql, [])?)
    }
}
