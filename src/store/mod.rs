//! Durable engine state.
//!
//! SQLite store for liquidations, orders, order relationships, tranches and
//! fills. Connections are short-lived per operation (one statement, release
//! promptly); "database is busy" is treated as retryable.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::models::{
    FillRecord, LiquidationEvent, OrderKind, OrderRecord, OrderRelationship, OrderStatus,
    PositionSide, Side, TimeInForce, Tranche,
};

const BUSY_RETRIES: u32 = 3;

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::DatabaseBusy
                || e.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

impl Store {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open engine db")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory db")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.busy_timeout(Duration::from_secs(5)).ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS liquidations (
                event_id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                qty REAL NOT NULL,
                price REAL NOT NULL,
                usdt_value REAL NOT NULL,
                event_time INTEGER NOT NULL,
                received_time INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_liquidations_symbol_side_time
             ON liquidations(symbol, side, event_time DESC)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS orders (
                order_id INTEGER PRIMARY KEY,
                client_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                position_side TEXT NOT NULL,
                kind TEXT NOT NULL,
                side TEXT NOT NULL,
                qty REAL NOT NULL,
                price REAL,
                stop_price REAL,
                status TEXT NOT NULL,
                tranche_id INTEGER,
                parent_order_id INTEGER,
                placed_at INTEGER NOT NULL,
                final_at INTEGER,
                executed_qty REAL NOT NULL DEFAULT 0,
                avg_fill_price REAL NOT NULL DEFAULT 0,
                time_in_force TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_orders_symbol_time ON orders(symbol, placed_at DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_orders_client ON orders(client_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS order_relationships (
                main_order_id INTEGER PRIMARY KEY,
                tp_order_id INTEGER,
                sl_order_id INTEGER,
                tranche_id INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS tranches (
                symbol TEXT NOT NULL,
                position_side TEXT NOT NULL,
                tranche_id INTEGER NOT NULL,
                avg_entry_price REAL NOT NULL,
                quantity REAL NOT NULL,
                tp_order_id INTEGER,
                sl_order_id INTEGER,
                unprotected INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (symbol, position_side, tranche_id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS fills (
                order_id INTEGER NOT NULL,
                seq INTEGER NOT NULL,
                qty REAL NOT NULL,
                price REAL NOT NULL,
                time INTEGER NOT NULL,
                commission REAL NOT NULL DEFAULT 0,
                PRIMARY KEY (order_id, seq)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_fills_time ON fills(time DESC)",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_retry<T, F>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(&Connection) -> rusqlite::Result<T>,
    {
        let mut attempt = 0u32;
        loop {
            let result = {
                let conn = self.conn.lock().await;
                f(&conn)
            };
            match result {
                Ok(v) => return Ok(v),
                Err(e) if is_busy(&e) && attempt < BUSY_RETRIES => {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(50 * attempt as u64)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    // ========================================================================
    // Liquidations
    // ========================================================================

    /// Idempotent on `event_id`; replays after a reconnect are no-ops.
    pub async fn insert_liquidation(&self, e: &LiquidationEvent) -> Result<bool> {
        let e = e.clone();
        self.with_retry(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO liquidations
                 (event_id, symbol, side, qty, price, usdt_value, event_time, received_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    e.event_id,
                    e.symbol,
                    e.liquidated_side.as_str(),
                    e.qty,
                    e.price,
                    e.usdt_value,
                    e.event_time_ms,
                    e.received_time_ms,
                ],
            )
            .map(|n| n > 0)
        })
        .await
    }

    pub async fn sum_usdt_volume(&self, symbol: &str, side: Side, since_ms: i64) -> Result<f64> {
        let symbol = symbol.to_string();
        self.with_retry(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT COALESCE(SUM(usdt_value), 0.0) FROM liquidations
                 WHERE symbol = ?1 AND side = ?2 AND event_time >= ?3",
            )?;
            stmt.query_row(params![symbol, side.as_str(), since_ms], |row| row.get(0))
        })
        .await
    }

    pub async fn liquidations_since(&self, since_ms: i64) -> Result<Vec<LiquidationEvent>> {
        self.with_retry(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT event_id, symbol, side, qty, price, usdt_value, event_time, received_time
                 FROM liquidations WHERE event_time >= ?1 ORDER BY event_time ASC",
            )?;
            let rows = stmt.query_map(params![since_ms], row_to_liquidation)?;
            rows.collect()
        })
        .await
        .map_err(Into::into)
    }

    pub async fn recent_liquidations(&self, limit: usize) -> Result<Vec<LiquidationEvent>> {
        let limit = limit.clamp(1, 1_000) as i64;
        self.with_retry(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT event_id, symbol, side, qty, price, usdt_value, event_time, received_time
                 FROM liquidations ORDER BY event_time DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit], row_to_liquidation)?;
            rows.collect()
        })
        .await
        .map_err(Into::into)
    }

    pub async fn prune_liquidations(&self, before_ms: i64) -> Result<usize> {
        self.with_retry(move |conn| {
            conn.execute(
                "DELETE FROM liquidations WHERE event_time < ?1",
                params![before_ms],
            )
        })
        .await
    }

    // ========================================================================
    // Orders
    // ========================================================================

    pub async fn upsert_order(&self, o: &OrderRecord) -> Result<()> {
        let o = o.clone();
        self.with_retry(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO orders
                 (order_id, client_id, symbol, position_side, kind, side, qty, price, stop_price,
                  status, tranche_id, parent_order_id, placed_at, final_at, executed_qty,
                  avg_fill_price, time_in_force)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                params![
                    o.order_id,
                    o.client_id,
                    o.symbol,
                    o.position_side.as_str(),
                    o.kind.as_str(),
                    o.side.as_str(),
                    o.qty,
                    o.price,
                    o.stop_price,
                    o.status.as_str(),
                    o.tranche_id.map(|t| t as i64),
                    o.parent_order_id,
                    o.placed_at,
                    o.final_at,
                    o.executed_qty,
                    o.avg_fill_price,
                    o.time_in_force.as_str(),
                ],
            )
            .map(|_| ())
        })
        .await
    }

    pub async fn update_order_execution(
        &self,
        order_id: i64,
        status: OrderStatus,
        executed_qty: f64,
        avg_fill_price: f64,
        final_at: Option<i64>,
    ) -> Result<()> {
        self.with_retry(move |conn| {
            conn.execute(
                "UPDATE orders SET status = ?2, executed_qty = ?3, avg_fill_price = ?4,
                 final_at = COALESCE(?5, final_at)
                 WHERE order_id = ?1",
                params![order_id, status.as_str(), executed_qty, avg_fill_price, final_at],
            )
            .map(|_| ())
        })
        .await
    }

    pub async fn get_order(&self, order_id: i64) -> Result<Option<OrderRecord>> {
        self.with_retry(move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {ORDER_COLS} FROM orders WHERE order_id = ?1"
            ))?;
            stmt.query_row(params![order_id], row_to_order).optional()
        })
        .await
    }

    pub async fn get_order_by_client_id(&self, client_id: &str) -> Result<Option<OrderRecord>> {
        let client_id = client_id.to_string();
        self.with_retry(move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {ORDER_COLS} FROM orders WHERE client_id = ?1"
            ))?;
            stmt.query_row(params![client_id], row_to_order).optional()
        })
        .await
    }

    /// Entry orders for a symbol that have not reached a terminal state.
    pub async fn open_entry_count(&self, symbol: &str) -> Result<u32> {
        let symbol = symbol.to_string();
        self.with_retry(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT COUNT(*) FROM orders
                 WHERE symbol = ?1 AND kind = 'ENTRY'
                   AND status IN ('NEW', 'PARTIALLY_FILLED')",
            )?;
            stmt.query_row(params![symbol], |row| row.get::<_, i64>(0))
        })
        .await
        .map(|n| n as u32)
    }

    pub async fn non_terminal_orders(&self) -> Result<Vec<OrderRecord>> {
        self.with_retry(move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {ORDER_COLS} FROM orders
                 WHERE status IN ('NEW', 'PARTIALLY_FILLED') ORDER BY placed_at ASC"
            ))?;
            let rows = stmt.query_map([], row_to_order)?;
            rows.collect()
        })
        .await
        .map_err(Into::into)
    }

    pub async fn recent_orders(&self, limit: usize) -> Result<Vec<OrderRecord>> {
        let limit = limit.clamp(1, 1_000) as i64;
        self.with_retry(move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {ORDER_COLS} FROM orders ORDER BY placed_at DESC LIMIT ?1"
            ))?;
            let rows = stmt.query_map(params![limit], row_to_order)?;
            rows.collect()
        })
        .await
        .map_err(Into::into)
    }

    pub async fn orders_for_tranche(
        &self,
        symbol: &str,
        position_side: PositionSide,
        tranche_id: u64,
    ) -> Result<Vec<OrderRecord>> {
        let symbol = symbol.to_string();
        self.with_retry(move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {ORDER_COLS} FROM orders
                 WHERE symbol = ?1 AND position_side = ?2 AND tranche_id = ?3
                 ORDER BY placed_at ASC"
            ))?;
            let rows = stmt.query_map(
                params![symbol, position_side.as_str(), tranche_id as i64],
                row_to_order,
            )?;
            rows.collect()
        })
        .await
        .map_err(Into::into)
    }

    // ========================================================================
    // Relationships
    // ========================================================================

    pub async fn insert_relationship(&self, rel: &OrderRelationship) -> Result<()> {
        let rel = rel.clone();
        self.with_retry(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO order_relationships
                 (main_order_id, tp_order_id, sl_order_id, tranche_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    rel.main_order_id,
                    rel.tp_order_id,
                    rel.sl_order_id,
                    rel.tranche_id as i64,
                    rel.created_at,
                ],
            )
            .map(|_| ())
        })
        .await
    }

    /// Find the relationship row containing `order_id` in any leg.
    pub async fn find_companions(&self, order_id: i64) -> Result<Option<OrderRelationship>> {
        self.with_retry(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT main_order_id, tp_order_id, sl_order_id, tranche_id, created_at
                 FROM order_relationships
                 WHERE main_order_id = ?1 OR tp_order_id = ?1 OR sl_order_id = ?1",
            )?;
            stmt.query_row(params![order_id], |row| {
                Ok(OrderRelationship {
                    main_order_id: row.get(0)?,
                    tp_order_id: row.get(1)?,
                    sl_order_id: row.get(2)?,
                    tranche_id: row.get::<_, i64>(3)? as u64,
                    created_at: row.get(4)?,
                })
            })
            .optional()
        })
        .await
    }

    pub async fn delete_relationship(&self, main_order_id: i64) -> Result<()> {
        self.with_retry(move |conn| {
            conn.execute(
                "DELETE FROM order_relationships WHERE main_order_id = ?1",
                params![main_order_id],
            )
            .map(|_| ())
        })
        .await
    }

    // ========================================================================
    // Tranches
    // ========================================================================

    pub async fn upsert_tranche(&self, t: &Tranche) -> Result<()> {
        let t = t.clone();
        self.with_retry(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO tranches
                 (symbol, position_side, tranche_id, avg_entry_price, quantity,
                  tp_order_id, sl_order_id, unprotected, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    t.symbol,
                    t.position_side.as_str(),
                    t.tranche_id as i64,
                    t.avg_entry_price,
                    t.quantity,
                    t.tp_order_id,
                    t.sl_order_id,
                    t.unprotected as i64,
                    t.created_at,
                    t.updated_at,
                ],
            )
            .map(|_| ())
        })
        .await
    }

    pub async fn delete_tranche(
        &self,
        symbol: &str,
        position_side: PositionSide,
        tranche_id: u64,
    ) -> Result<()> {
        let symbol = symbol.to_string();
        self.with_retry(move |conn| {
            conn.execute(
                "DELETE FROM tranches
                 WHERE symbol = ?1 AND position_side = ?2 AND tranche_id = ?3",
                params![symbol, position_side.as_str(), tranche_id as i64],
            )
            .map(|_| ())
        })
        .await
    }

    pub async fn list_tranches(
        &self,
        symbol: &str,
        position_side: PositionSide,
    ) -> Result<Vec<Tranche>> {
        let symbol = symbol.to_string();
        self.with_retry(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT symbol, position_side, tranche_id, avg_entry_price, quantity,
                        tp_order_id, sl_order_id, unprotected, created_at, updated_at
                 FROM tranches WHERE symbol = ?1 AND position_side = ?2
                 ORDER BY tranche_id ASC",
            )?;
            let rows = stmt.query_map(params![symbol, position_side.as_str()], row_to_tranche)?;
            rows.collect()
        })
        .await
        .map_err(Into::into)
    }

    pub async fn list_all_tranches(&self) -> Result<Vec<Tranche>> {
        self.with_retry(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT symbol, position_side, tranche_id, avg_entry_price, quantity,
                        tp_order_id, sl_order_id, unprotected, created_at, updated_at
                 FROM tranches ORDER BY symbol, position_side, tranche_id ASC",
            )?;
            let rows = stmt.query_map([], row_to_tranche)?;
            rows.collect()
        })
        .await
        .map_err(Into::into)
    }

    // ========================================================================
    // Fills
    // ========================================================================

    pub async fn insert_fill(&self, f: &FillRecord) -> Result<()> {
        let f = f.clone();
        self.with_retry(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO fills (order_id, seq, qty, price, time, commission)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![f.order_id, f.seq, f.qty, f.price, f.time, f.commission],
            )
            .map(|_| ())
        })
        .await
    }

    pub async fn next_fill_seq(&self, order_id: i64) -> Result<i64> {
        self.with_retry(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM fills WHERE order_id = ?1",
            )?;
            stmt.query_row(params![order_id], |row| row.get(0))
        })
        .await
    }

    /// Recent fills joined with their orders, newest first.
    pub async fn recent_fills(
        &self,
        symbol: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(FillRecord, OrderRecord)>> {
        let limit = limit.clamp(1, 1_000) as i64;
        let symbol = symbol.map(|s| s.to_string());
        self.with_retry(move |conn| {
            let sql = format!(
                "SELECT f.order_id, f.seq, f.qty, f.price, f.time, f.commission, {}
                 FROM fills f JOIN orders o ON o.order_id = f.order_id
                 {} ORDER BY f.time DESC LIMIT {}",
                ORDER_COLS_PREFIXED,
                if symbol.is_some() {
                    "WHERE o.symbol = ?1"
                } else {
                    ""
                },
                limit,
            );
            let mut stmt = conn.prepare(&sql)?;
            let map_row = |row: &rusqlite::Row<'_>| {
                let fill = FillRecord {
                    order_id: row.get(0)?,
                    seq: row.get(1)?,
                    qty: row.get(2)?,
                    price: row.get(3)?,
                    time: row.get(4)?,
                    commission: row.get(5)?,
                };
                let order = row_to_order_at(row, 6)?;
                Ok((fill, order))
            };
            let rows = match &symbol {
                Some(s) => stmt.query_map(params![s], map_row)?.collect(),
                None => stmt.query_map([], map_row)?.collect(),
            };
            rows
        })
        .await
        .map_err(Into::into)
    }

    /// Per-(symbol, side) aggregate of stored tranches, used by startup
    /// recovery and the reconciler.
    pub async fn tranche_totals(&self) -> Result<HashMap<(String, PositionSide), f64>> {
        let tranches = self.list_all_tranches().await?;
        let mut totals = HashMap::new();
        for t in tranches {
            *totals
                .entry((t.symbol.clone(), t.position_side))
                .or_insert(0.0) += t.quantity;
        }
        Ok(totals)
    }
}

const ORDER_COLS: &str = "order_id, client_id, symbol, position_side, kind, side, qty, price, \
     stop_price, status, tranche_id, parent_order_id, placed_at, final_at, executed_qty, \
     avg_fill_price, time_in_force";

const ORDER_COLS_PREFIXED: &str = "o.order_id, o.client_id, o.symbol, o.position_side, o.kind, \
     o.side, o.qty, o.price, o.stop_price, o.status, o.tranche_id, o.parent_order_id, \
     o.placed_at, o.final_at, o.executed_qty, o.avg_fill_price, o.time_in_force";

fn row_to_liquidation(row: &rusqlite::Row<'_>) -> rusqlite::Result<LiquidationEvent> {
    let side_str: String = row.get(2)?;
    Ok(LiquidationEvent {
        event_id: row.get(0)?,
        symbol: row.get(1)?,
        liquidated_side: Side::parse(&side_str).unwrap_or(Side::Sell),
        qty: row.get(3)?,
        price: row.get(4)?,
        usdt_value: row.get(5)?,
        event_time_ms: row.get(6)?,
        received_time_ms: row.get(7)?,
    })
}

fn row_to_order(row: &rusqlite::Row<'_>) -> rusqlite::Result<OrderRecord> {
    row_to_order_at(row, 0)
}

fn row_to_order_at(row: &rusqlite::Row<'_>, base: usize) -> rusqlite::Result<OrderRecord> {
    let position_side: String = row.get(base + 3)?;
    let kind: String = row.get(base + 4)?;
    let side: String = row.get(base + 5)?;
    let status: String = row.get(base + 9)?;
    let tif: String = row.get(base + 16)?;
    Ok(OrderRecord {
        order_id: row.get(base)?,
        client_id: row.get(base + 1)?,
        symbol: row.get(base + 2)?,
        position_side: PositionSide::parse(&position_side).unwrap_or(PositionSide::Long),
        kind: OrderKind::parse(&kind).unwrap_or(OrderKind::Entry),
        side: Side::parse(&side).unwrap_or(Side::Buy),
        qty: row.get(base + 6)?,
        price: row.get(base + 7)?,
        stop_price: row.get(base + 8)?,
        status: OrderStatus::parse(&status).unwrap_or(OrderStatus::New),
        tranche_id: row.get::<_, Option<i64>>(base + 10)?.map(|t| t as u64),
        parent_order_id: row.get(base + 11)?,
        placed_at: row.get(base + 12)?,
        final_at: row.get(base + 13)?,
        executed_qty: row.get(base + 14)?,
        avg_fill_price: row.get(base + 15)?,
        time_in_force: match tif.as_str() {
            "IOC" => TimeInForce::Ioc,
            "FOK" => TimeInForce::Fok,
            _ => TimeInForce::Gtc,
        },
    })
}

fn row_to_tranche(row: &rusqlite::Row<'_>) -> rusqlite::Result<Tranche> {
    let position_side: String = row.get(1)?;
    Ok(Tranche {
        symbol: row.get(0)?,
        position_side: PositionSide::parse(&position_side).unwrap_or(PositionSide::Long),
        tranche_id: row.get::<_, i64>(2)? as u64,
        avg_entry_price: row.get(3)?,
        quantity: row.get(4)?,
        tp_order_id: row.get(5)?,
        sl_order_id: row.get(6)?,
        unprotected: row.get::<_, i64>(7)? != 0,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}
