// =============================================================================
// Metadata Ledger — structured SQLite tables behind a single connection
// =============================================================================
//
// Six tables: signals, trades, positions, market_snapshots,
// strategy_performance, embedding_bookkeeping.  WAL journal mode for
// concurrent reads during writes; every public operation is one implicit
// transaction.  There is no cross-table foreign-key enforcement at this
// layer; referential invariants (executed trade references a signal,
// open position has quantity > 0) are enforced by the emitters.
//
// A failed write never corrupts the ledger: the typed error is returned to
// the caller, which logs it and emits the error-pattern memory.
// =============================================================================

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::{CoreError, CoreResult};
use crate::types::{PositionStatus, TradeSide, TradeStatus};

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRow {
    pub id: String,
    pub symbol: String,
    pub kind: String,
    pub confidence: f64,
    pub price: f64,
    pub volume: f64,
    pub timeframe: String,
    /// Indicator snapshot as JSON.
    pub indicators: serde_json::Value,
    /// Free-form metadata as JSON.
    pub metadata: serde_json::Value,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRow {
    pub id: String,
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: f64,
    pub price: f64,
    pub pnl: f64,
    pub fees: f64,
    pub strategy: String,
    /// Reference to the signal row this trade executes.
    pub signal_id: Option<String>,
    pub status: TradeStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRow {
    pub id: String,
    pub symbol: String,
    pub quantity: f64,
    pub avg_price: f64,
    pub current_price: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub stop_price: Option<f64>,
    pub target_price: Option<f64>,
    pub status: PositionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRow {
    pub id: String,
    pub symbol: String,
    pub timeframe: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub indicators: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyPerformanceRow {
    pub id: String,
    pub strategy: String,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub total_pnl: f64,
    pub max_drawdown: f64,
    pub sharpe_ratio: f64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRow {
    pub id: String,
    pub content_hash: String,
    pub content_type: String,
    pub source: String,
    pub importance: f64,
    pub access_count: u32,
    pub last_access: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

pub struct MetadataLedger {
    conn: Mutex<Connection>,
}

impl MetadataLedger {
    /// Open (or create) the ledger at `path` and ensure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> CoreResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let ledger = Self {
            conn: Mutex::new(conn),
        };
        ledger.create_schema()?;

        info!(path = %path.as_ref().display(), "metadata ledger opened");
        Ok(ledger)
    }

    /// In-memory ledger for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> CoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let ledger = Self {
            conn: Mutex::new(conn),
        };
        ledger.create_schema()?;
        Ok(ledger)
    }

    fn create_schema(&self) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS signals (
                id          TEXT PRIMARY KEY,
                symbol      TEXT NOT NULL,
                kind        TEXT NOT NULL,
                confidence  REAL NOT NULL,
                price       REAL NOT NULL,
                volume      REAL NOT NULL,
                timeframe   TEXT NOT NULL,
                indicators  TEXT NOT NULL,
                metadata    TEXT NOT NULL,
                processed   INTEGER NOT NULL DEFAULT 0,
                created_at  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_signals_symbol ON signals(symbol, created_at);

            CREATE TABLE IF NOT EXISTS trades (
                id          TEXT PRIMARY KEY,
                symbol      TEXT NOT NULL,
                side        TEXT NOT NULL,
                quantity    REAL NOT NULL,
                price       REAL NOT NULL,
                pnl         REAL NOT NULL DEFAULT 0,
                fees        REAL NOT NULL DEFAULT 0,
                strategy    TEXT NOT NULL,
                signal_id   TEXT,
                status      TEXT NOT NULL,
                created_at  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades(symbol, created_at);

            CREATE TABLE IF NOT EXISTS positions (
                id              TEXT PRIMARY KEY,
                symbol          TEXT NOT NULL,
                quantity        REAL NOT NULL,
                avg_price       REAL NOT NULL,
                current_price   REAL NOT NULL,
                unrealized_pnl  REAL NOT NULL DEFAULT 0,
                realized_pnl    REAL NOT NULL DEFAULT 0,
                stop_price      REAL,
                target_price    REAL,
                status          TEXT NOT NULL,
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_positions_symbol ON positions(symbol, status);

            CREATE TABLE IF NOT EXISTS market_snapshots (
                id          TEXT PRIMARY KEY,
                symbol      TEXT NOT NULL,
                timeframe   TEXT NOT NULL,
                open        REAL NOT NULL,
                high        REAL NOT NULL,
                low         REAL NOT NULL,
                close       REAL NOT NULL,
                volume      REAL NOT NULL,
                indicators  TEXT NOT NULL,
                created_at  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_snapshots_symbol ON market_snapshots(symbol, created_at);

            CREATE TABLE IF NOT EXISTS strategy_performance (
                id              TEXT PRIMARY KEY,
                strategy        TEXT NOT NULL UNIQUE,
                total_trades    INTEGER NOT NULL DEFAULT 0,
                winning_trades  INTEGER NOT NULL DEFAULT 0,
                total_pnl       REAL NOT NULL DEFAULT 0,
                max_drawdown    REAL NOT NULL DEFAULT 0,
                sharpe_ratio    REAL NOT NULL DEFAULT 0,
                updated_at      TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS embedding_bookkeeping (
                id            TEXT PRIMARY KEY,
                content_hash  TEXT NOT NULL,
                content_type  TEXT NOT NULL,
                source        TEXT NOT NULL,
                importance    REAL NOT NULL DEFAULT 0.5,
                access_count  INTEGER NOT NULL DEFAULT 0,
                last_access   TEXT,
                created_at    TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_embedding_type_importance
                ON embedding_bookkeeping(content_type, importance);
            "#,
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Signals
    // -------------------------------------------------------------------------

    pub fn insert_signal(&self, row: &SignalRow) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO signals
                (id, symbol, kind, confidence, price, volume, timeframe, indicators, metadata, processed, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                row.id,
                row.symbol,
                row.kind,
                row.confidence,
                row.price,
                row.volume,
                row.timeframe,
                row.indicators.to_string(),
                row.metadata.to_string(),
                row.processed as i64,
                row.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn mark_signal_processed(&self, id: &str) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.execute("UPDATE signals SET processed = 1 WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn recent_signals(&self, limit: usize) -> CoreResult<Vec<SignalRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, symbol, kind, confidence, price, volume, timeframe, indicators, metadata, processed, created_at
             FROM signals ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], Self::signal_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn unprocessed_signals(&self, limit: usize) -> CoreResult<Vec<SignalRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, symbol, kind, confidence, price, volume, timeframe, indicators, metadata, processed, created_at
             FROM signals WHERE processed = 0 ORDER BY created_at ASC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], Self::signal_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn signal_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SignalRow> {
        Ok(SignalRow {
            id: row.get(0)?,
            symbol: row.get(1)?,
            kind: row.get(2)?,
            confidence: row.get(3)?,
            price: row.get(4)?,
            volume: row.get(5)?,
            timeframe: row.get(6)?,
            indicators: parse_json(row.get::<_, String>(7)?),
            metadata: parse_json(row.get::<_, String>(8)?),
            processed: row.get::<_, i64>(9)? != 0,
            created_at: parse_ts(row.get::<_, String>(10)?),
        })
    }

    // -------------------------------------------------------------------------
    // Trades
    // -------------------------------------------------------------------------

    pub fn insert_trade(&self, row: &TradeRow) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO trades
                (id, symbol, side, quantity, price, pnl, fees, strategy, signal_id, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                row.id,
                row.symbol,
                row.side.to_string(),
                row.quantity,
                row.price,
                row.pnl,
                row.fees,
                row.strategy,
                row.signal_id,
                row.status.to_string(),
                row.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn update_trade_status(&self, id: &str, status: TradeStatus, pnl: f64) -> CoreResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE trades SET status = ?2, pnl = ?3 WHERE id = ?1",
            params![id, status.to_string(), pnl],
        )?;
        if changed == 0 {
            return Err(CoreError::LedgerWriteFailed(format!("trade '{id}' not found")));
        }
        Ok(())
    }

    pub fn recent_trades(&self, limit: usize) -> CoreResult<Vec<TradeRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, symbol, side, quantity, price, pnl, fees, strategy, signal_id, status, created_at
             FROM trades ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(TradeRow {
                    id: row.get(0)?,
                    symbol: row.get(1)?,
                    side: parse_side(row.get::<_, String>(2)?),
                    quantity: row.get(3)?,
                    price: row.get(4)?,
                    pnl: row.get(5)?,
                    fees: row.get(6)?,
                    strategy: row.get(7)?,
                    signal_id: row.get(8)?,
                    status: parse_trade_status(row.get::<_, String>(9)?),
                    created_at: parse_ts(row.get::<_, String>(10)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -------------------------------------------------------------------------
    // Positions
    // -------------------------------------------------------------------------

    /// Insert or fully replace a position row keyed by id.
    pub fn upsert_position(&self, row: &PositionRow) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO positions
                (id, symbol, quantity, avg_price, current_price, unrealized_pnl, realized_pnl,
                 stop_price, target_price, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(id) DO UPDATE SET
                quantity = excluded.quantity,
                avg_price = excluded.avg_price,
                current_price = excluded.current_price,
                unrealized_pnl = excluded.unrealized_pnl,
                realized_pnl = excluded.realized_pnl,
                stop_price = excluded.stop_price,
                target_price = excluded.target_price,
                status = excluded.status,
                updated_at = excluded.updated_at",
            params![
                row.id,
                row.symbol,
                row.quantity,
                row.avg_price,
                row.current_price,
                row.unrealized_pnl,
                row.realized_pnl,
                row.stop_price,
                row.target_price,
                row.status.to_string(),
                row.created_at.to_rfc3339(),
                row.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// The open position for `symbol`, if any. Open positions are unique
    /// per symbol by emitter contract.
    pub fn open_position(&self, symbol: &str) -> CoreResult<Option<PositionRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, symbol, quantity, avg_price, current_price, unrealized_pnl, realized_pnl,
                    stop_price, target_price, status, created_at, updated_at
             FROM positions WHERE symbol = ?1 AND status = 'open' LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![symbol], Self::position_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn open_positions(&self) -> CoreResult<Vec<PositionRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, symbol, quantity, avg_price, current_price, unrealized_pnl, realized_pnl,
                    stop_price, target_price, status, created_at, updated_at
             FROM positions WHERE status = 'open' ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map([], Self::position_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn position_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PositionRow> {
        Ok(PositionRow {
            id: row.get(0)?,
            symbol: row.get(1)?,
            quantity: row.get(2)?,
            avg_price: row.get(3)?,
            current_price: row.get(4)?,
            unrealized_pnl: row.get(5)?,
            realized_pnl: row.get(6)?,
            stop_price: row.get(7)?,
            target_price: row.get(8)?,
            status: parse_position_status(row.get::<_, String>(9)?),
            created_at: parse_ts(row.get::<_, String>(10)?),
            updated_at: parse_ts(row.get::<_, String>(11)?),
        })
    }

    // -------------------------------------------------------------------------
    // Market snapshots
    // -------------------------------------------------------------------------

    pub fn insert_snapshot(&self, row: &SnapshotRow) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO market_snapshots
                (id, symbol, timeframe, open, high, low, close, volume, indicators, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                row.id,
                row.symbol,
                row.timeframe,
                row.open,
                row.high,
                row.low,
                row.close,
                row.volume,
                row.indicators.to_string(),
                row.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn recent_snapshots(&self, symbol: &str, limit: usize) -> CoreResult<Vec<SnapshotRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, symbol, timeframe, open, high, low, close, volume, indicators, created_at
             FROM market_snapshots WHERE symbol = ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![symbol, limit as i64], |row| {
                Ok(SnapshotRow {
                    id: row.get(0)?,
                    symbol: row.get(1)?,
                    timeframe: row.get(2)?,
                    open: row.get(3)?,
                    high: row.get(4)?,
                    low: row.get(5)?,
                    close: row.get(6)?,
                    volume: row.get(7)?,
                    indicators: parse_json(row.get::<_, String>(8)?),
                    created_at: parse_ts(row.get::<_, String>(9)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -------------------------------------------------------------------------
    // Strategy performance
    // -------------------------------------------------------------------------

    pub fn upsert_strategy_performance(&self, row: &StrategyPerformanceRow) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO strategy_performance
                (id, strategy, total_trades, winning_trades, total_pnl, max_drawdown, sharpe_ratio, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(strategy) DO UPDATE SET
                total_trades = excluded.total_trades,
                winning_trades = excluded.winning_trades,
                total_pnl = excluded.total_pnl,
                max_drawdown = excluded.max_drawdown,
                sharpe_ratio = excluded.sharpe_ratio,
                updated_at = excluded.updated_at",
            params![
                row.id,
                row.strategy,
                row.total_trades,
                row.winning_trades,
                row.total_pnl,
                row.max_drawdown,
                row.sharpe_ratio,
                row.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn strategy_performance(&self, strategy: &str) -> CoreResult<Option<StrategyPerformanceRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, strategy, total_trades, winning_trades, total_pnl, max_drawdown, sharpe_ratio, updated_at
             FROM strategy_performance WHERE strategy = ?1",
        )?;
        let mut rows = stmt.query_map(params![strategy], |row| {
            Ok(StrategyPerformanceRow {
                id: row.get(0)?,
                strategy: row.get(1)?,
                total_trades: row.get(2)?,
                winning_trades: row.get(3)?,
                total_pnl: row.get(4)?,
                max_drawdown: row.get(5)?,
                sharpe_ratio: row.get(6)?,
                updated_at: parse_ts(row.get::<_, String>(7)?),
            })
        })?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    // -------------------------------------------------------------------------
    // Embedding bookkeeping
    // -------------------------------------------------------------------------

    /// Insert or refresh the bookkeeping row for a stored memory record.
    /// Re-storing the same id upserts, so the table holds exactly one row
    /// per record.
    pub fn upsert_embedding(&self, row: &EmbeddingRow) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO embedding_bookkeeping
                (id, content_hash, content_type, source, importance, access_count, last_access, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                content_hash = excluded.content_hash,
                content_type = excluded.content_type,
                source = excluded.source,
                importance = excluded.importance",
            params![
                row.id,
                row.content_hash,
                row.content_type,
                row.source,
                row.importance,
                row.access_count,
                row.last_access.map(|t| t.to_rfc3339()),
                row.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Bump the access counter and last-access timestamp for a record.
    pub fn touch_embedding(&self, id: &str) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE embedding_bookkeeping
             SET access_count = access_count + 1, last_access = ?2
             WHERE id = ?1",
            params![id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn delete_embedding(&self, id: &str) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM embedding_bookkeeping WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn embedding_count(&self) -> CoreResult<u64> {
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM embedding_bookkeeping", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn embedding_row(&self, id: &str) -> CoreResult<Option<EmbeddingRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, content_hash, content_type, source, importance, access_count, last_access, created_at
             FROM embedding_bookkeeping WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], |row| {
            Ok(EmbeddingRow {
                id: row.get(0)?,
                content_hash: row.get(1)?,
                content_type: row.get(2)?,
                source: row.get(3)?,
                importance: row.get(4)?,
                access_count: row.get(5)?,
                last_access: row.get::<_, Option<String>>(6)?.map(parse_ts),
                created_at: parse_ts(row.get::<_, String>(7)?),
            })
        })?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for MetadataLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataLedger").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Parse helpers — stored values were written by this module, so failures
// indicate external tampering and map to safe defaults with a debug log.
// ---------------------------------------------------------------------------

fn parse_json(raw: String) -> serde_json::Value {
    serde_json::from_str(&raw).unwrap_or(serde_json::Value::Null)
}

fn parse_ts(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| {
            debug!(raw, "unparseable timestamp in ledger row");
            Utc::now()
        })
}

fn parse_side(raw: String) -> TradeSide {
    match raw.as_str() {
        "sell" => TradeSide::Sell,
        _ => TradeSide::Buy,
    }
}

fn parse_trade_status(raw: String) -> TradeStatus {
    match raw.as_str() {
        "executed" => TradeStatus::Executed,
        "cancelled" => TradeStatus::Cancelled,
        _ => TradeStatus::Pending,
    }
}

fn parse_position_status(raw: String) -> PositionStatus {
    match raw.as_str() {
        "closed" => PositionStatus::Closed,
        _ => PositionStatus::Open,
    }
}
