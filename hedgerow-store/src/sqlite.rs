//! SQLite implementation of the persistence gateway.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use hedgerow_core::{
    DoubleLimit, DoubleLimitState, Fill, Incident, Order, OrderRole, OrderStatus, OrderType,
    Side, SimulatedRun, Size, Trade, Venue,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::{OrderEventRow, Store, StoreError, StoreResult};

/// Versioned migrations, applied in lexicographic order. Each migration
/// records its `schema_migrations` row inside the same transaction as its
/// DDL.
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_orders",
        r#"
        CREATE TABLE orders (
            client_order_id TEXT PRIMARY KEY,
            venue_order_id  TEXT,
            venue           TEXT NOT NULL,
            account_id      TEXT NOT NULL,
            market_id       TEXT NOT NULL,
            pair_id         TEXT NOT NULL,
            side            TEXT NOT NULL,
            order_type      TEXT NOT NULL,
            price           TEXT,
            requested_size  TEXT NOT NULL,
            filled_size     TEXT NOT NULL,
            status          TEXT NOT NULL,
            role            TEXT NOT NULL,
            parent_fill_id  TEXT,
            dry_run         INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL,
            raw             TEXT
        );
        CREATE INDEX idx_orders_venue_order ON orders(venue, venue_order_id);
        CREATE INDEX idx_orders_pair_status ON orders(pair_id, status);

        CREATE TABLE order_events (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            client_order_id TEXT NOT NULL,
            stage           TEXT NOT NULL,
            payload         TEXT NOT NULL,
            ts              TEXT NOT NULL
        );
        CREATE INDEX idx_order_events_order ON order_events(client_order_id, id);
        "#,
    ),
    (
        "0002_fills_trades",
        r#"
        CREATE TABLE fills (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            venue           TEXT NOT NULL,
            venue_order_id  TEXT NOT NULL,
            fill_id         TEXT,
            client_order_id TEXT,
            market_id       TEXT NOT NULL,
            side            TEXT NOT NULL,
            price           TEXT NOT NULL,
            size            TEXT NOT NULL,
            dedup_key       TEXT NOT NULL UNIQUE,
            ts              TEXT NOT NULL
        );
        CREATE INDEX idx_fills_order ON fills(venue, venue_order_id);

        CREATE TABLE fill_watermarks (
            venue           TEXT NOT NULL,
            venue_order_id  TEXT NOT NULL,
            cumulative      TEXT NOT NULL,
            updated_at      TEXT NOT NULL,
            PRIMARY KEY (venue, venue_order_id)
        );

        CREATE TABLE trades (
            id              TEXT PRIMARY KEY,
            entry_order_id  TEXT NOT NULL,
            hedge_order_id  TEXT NOT NULL,
            entry_venue     TEXT NOT NULL,
            hedge_venue     TEXT NOT NULL,
            size            TEXT NOT NULL,
            entry_price     TEXT NOT NULL,
            hedge_price     TEXT NOT NULL,
            fees            TEXT NOT NULL,
            pnl_estimate    TEXT NOT NULL,
            ts              TEXT NOT NULL
        );
        "#,
    ),
    (
        "0003_double_limits_incidents",
        r#"
        CREATE TABLE double_limits (
            id                 TEXT PRIMARY KEY,
            pair_key           TEXT NOT NULL,
            order_a_ref        TEXT NOT NULL UNIQUE,
            order_b_ref        TEXT NOT NULL UNIQUE,
            venue_a            TEXT NOT NULL,
            venue_b            TEXT NOT NULL,
            state              TEXT NOT NULL,
            triggered_order_id TEXT,
            cancelled_order_id TEXT,
            created_at         TEXT NOT NULL,
            updated_at         TEXT NOT NULL
        );

        CREATE TABLE incidents (
            id      INTEGER PRIMARY KEY AUTOINCREMENT,
            level   TEXT NOT NULL,
            message TEXT NOT NULL,
            details TEXT NOT NULL,
            ts      TEXT NOT NULL
        );

        CREATE TABLE simulated_runs (
            id           TEXT PRIMARY KEY,
            pair_id      TEXT NOT NULL,
            size         TEXT NOT NULL,
            plan         TEXT NOT NULL,
            expected_pnl TEXT NOT NULL,
            notes        TEXT,
            ts           TEXT NOT NULL
        );
        "#,
    ),
];

/// SQLite-backed [`Store`]. One connection guarded by a mutex keeps every
/// call a short serialized transaction.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply pending migrations.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory store for tests and dry runs.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> StoreResult<()> {
        let mut conn = self.conn.lock().unwrap();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
            [],
        )?;
        let mut ordered: Vec<(&str, &str)> = MIGRATIONS.to_vec();
        ordered.sort_by_key(|(version, _)| *version);
        for (version, sql) in ordered {
            let applied: Option<String> = conn
                .query_row(
                    "SELECT version FROM schema_migrations WHERE version = ?1",
                    params![version],
                    |row| row.get(0),
                )
                .optional()?;
            if applied.is_some() {
                continue;
            }
            let tx = conn.transaction()?;
            tx.execute_batch(sql)?;
            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                params![version, Utc::now().to_rfc3339()],
            )?;
            tx.commit()?;
        }
        Ok(())
    }
}

impl Store for SqliteStore {
    fn upsert_order(&self, order: &Order) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let raw = order
            .raw
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        conn.execute(
            r#"
            INSERT INTO orders (
                client_order_id, venue_order_id, venue, account_id, market_id,
                pair_id, side, order_type, price, requested_size, filled_size,
                status, role, parent_fill_id, dry_run, created_at, updated_at, raw
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
            ON CONFLICT(client_order_id) DO UPDATE SET
                venue_order_id = excluded.venue_order_id,
                filled_size = excluded.filled_size,
                status = excluded.status,
                updated_at = excluded.updated_at,
                raw = COALESCE(excluded.raw, orders.raw)
            "#,
            params![
                order.client_order_id,
                order.venue_order_id,
                order.venue.as_str(),
                order.account_id,
                order.market_id,
                order.pair_id,
                order.side.as_str(),
                match order.order_type {
                    OrderType::Limit => "LIMIT",
                    OrderType::Market => "MARKET",
                },
                order.price.map(|price| price.to_string()),
                order.requested_size.to_string(),
                order.filled_size.to_string(),
                order.status.as_str(),
                order.role.as_str(),
                order.parent_fill_id,
                order.dry_run as i64,
                order.created_at.to_rfc3339(),
                order.updated_at.to_rfc3339(),
                raw,
            ],
        )?;
        Ok(())
    }

    fn load_order(&self, client_order_id: &str) -> StoreResult<Option<Order>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM orders WHERE client_order_id = ?1",
            params![client_order_id],
            order_from_row,
        )
        .optional()
        .map_err(StoreError::from)?
        .transpose()
    }

    fn open_orders(&self) -> StoreResult<Vec<Order>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM orders
             WHERE status IN ('NEW', 'PENDING_PLACE', 'LIVE', 'PARTIAL', 'CANCELLING')
             ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], order_from_row)?;
        let mut orders = Vec::new();
        for row in rows {
            orders.push(row??);
        }
        Ok(orders)
    }

    fn append_order_event(
        &self,
        client_order_id: &str,
        stage: &str,
        payload: &serde_json::Value,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO order_events (client_order_id, stage, payload, ts)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                client_order_id,
                stage,
                serde_json::to_string(payload)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn order_events(&self, client_order_id: &str) -> StoreResult<Vec<OrderEventRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, client_order_id, stage, payload, ts
             FROM order_events WHERE client_order_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![client_order_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut events = Vec::new();
        for row in rows {
            let (id, client_order_id, stage, payload, ts) = row?;
            events.push(OrderEventRow {
                id,
                client_order_id,
                stage,
                payload: serde_json::from_str(&payload)?,
                ts: parse_ts(&ts)?,
            });
        }
        Ok(events)
    }

    fn record_fill(&self, fill: &Fill) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            r#"
            INSERT OR IGNORE INTO fills (
                venue, venue_order_id, fill_id, client_order_id, market_id,
                side, price, size, dedup_key, ts
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                fill.venue.as_str(),
                fill.venue_order_id,
                fill.fill_id,
                fill.client_order_id,
                fill.market_id,
                fill.side.as_str(),
                fill.price.to_string(),
                fill.size.to_string(),
                fill.dedup_key(),
                fill.ts.to_rfc3339(),
            ],
        )?;
        Ok(inserted > 0)
    }

    fn recent_fill_keys(&self, limit: usize) -> StoreResult<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT dedup_key FROM fills ORDER BY id DESC LIMIT ?1")?;
        let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }

    fn fill_watermark(&self, venue: &Venue, venue_order_id: &str) -> StoreResult<Option<Size>> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> = conn
            .query_row(
                "SELECT cumulative FROM fill_watermarks WHERE venue = ?1 AND venue_order_id = ?2",
                params![venue.as_str(), venue_order_id],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|value| parse_decimal(&value)).transpose()
    }

    fn save_fill_watermark(
        &self,
        venue: &Venue,
        venue_order_id: &str,
        cumulative: Size,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO fill_watermarks (venue, venue_order_id, cumulative, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(venue, venue_order_id) DO UPDATE SET
                cumulative = excluded.cumulative,
                updated_at = excluded.updated_at
            "#,
            params![
                venue.as_str(),
                venue_order_id,
                cumulative.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn load_fill_watermarks(&self) -> StoreResult<HashMap<(Venue, String), Size>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT venue, venue_order_id, cumulative FROM fill_watermarks")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut marks = HashMap::new();
        for row in rows {
            let (venue, order, cumulative) = row?;
            marks.insert((Venue::new(venue), order), parse_decimal(&cumulative)?);
        }
        Ok(marks)
    }

    fn save_trade(&self, trade: &Trade) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO trades (
                id, entry_order_id, hedge_order_id, entry_venue, hedge_venue,
                size, entry_price, hedge_price, fees, pnl_estimate, ts
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                trade.id.to_string(),
                trade.entry_order_id,
                trade.hedge_order_id,
                trade.entry_venue.as_str(),
                trade.hedge_venue.as_str(),
                trade.size.to_string(),
                trade.entry_price.to_string(),
                trade.hedge_price.to_string(),
                trade.fees.to_string(),
                trade.pnl_estimate.to_string(),
                trade.ts.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn trades(&self) -> StoreResult<Vec<Trade>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM trades ORDER BY ts")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>("id")?,
                row.get::<_, String>("entry_order_id")?,
                row.get::<_, String>("hedge_order_id")?,
                row.get::<_, String>("entry_venue")?,
                row.get::<_, String>("hedge_venue")?,
                row.get::<_, String>("size")?,
                row.get::<_, String>("entry_price")?,
                row.get::<_, String>("hedge_price")?,
                row.get::<_, String>("fees")?,
                row.get::<_, String>("pnl_estimate")?,
                row.get::<_, String>("ts")?,
            ))
        })?;
        let mut trades = Vec::new();
        for row in rows {
            let (id, entry_order_id, hedge_order_id, entry_venue, hedge_venue, size, entry_price, hedge_price, fees, pnl, ts) =
                row?;
            trades.push(Trade {
                id: Uuid::parse_str(&id)
                    .map_err(|_| StoreError::Corrupt(format!("trade id '{id}'")))?,
                entry_order_id,
                hedge_order_id,
                entry_venue: Venue::new(entry_venue),
                hedge_venue: Venue::new(hedge_venue),
                size: parse_decimal(&size)?,
                entry_price: parse_decimal(&entry_price)?,
                hedge_price: parse_decimal(&hedge_price)?,
                fees: parse_decimal(&fees)?,
                pnl_estimate: parse_decimal(&pnl)?,
                ts: parse_ts(&ts)?,
            });
        }
        Ok(trades)
    }

    fn save_double_limit(&self, record: &DoubleLimit) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO double_limits (
                id, pair_key, order_a_ref, order_b_ref, venue_a, venue_b,
                state, triggered_order_id, cancelled_order_id, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                record.id,
                record.pair_key,
                record.order_a_ref,
                record.order_b_ref,
                record.venue_a.as_str(),
                record.venue_b.as_str(),
                record.state.as_str(),
                record.triggered_order_id,
                record.cancelled_order_id,
                record.created_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn get_double_limit_by_order(&self, order_ref: &str) -> StoreResult<Option<DoubleLimit>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM double_limits WHERE order_a_ref = ?1 OR order_b_ref = ?1",
            params![order_ref],
            double_limit_from_row,
        )
        .optional()
        .map_err(StoreError::from)?
        .transpose()
    }

    fn update_double_limit_state(
        &self,
        id: &str,
        state: DoubleLimitState,
        triggered_order_id: Option<&str>,
        cancelled_order_id: Option<&str>,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            UPDATE double_limits SET
                state = ?2,
                triggered_order_id = COALESCE(?3, triggered_order_id),
                cancelled_order_id = COALESCE(?4, cancelled_order_id),
                updated_at = ?5
            WHERE id = ?1
            "#,
            params![
                id,
                state.as_str(),
                triggered_order_id,
                cancelled_order_id,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn record_incident(&self, incident: &Incident) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO incidents (level, message, details, ts) VALUES (?1, ?2, ?3, ?4)",
            params![
                incident.level.as_str(),
                incident.message,
                serde_json::to_string(&incident.details)?,
                incident.ts.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn recent_incidents(&self, limit: usize) -> StoreResult<Vec<Incident>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT level, message, details, ts FROM incidents ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut incidents = Vec::new();
        for row in rows {
            let (level, message, details, ts) = row?;
            incidents.push(Incident {
                level: level
                    .parse()
                    .map_err(|_| StoreError::Corrupt(format!("incident level '{level}'")))?,
                message,
                details: serde_json::from_str(&details)?,
                ts: parse_ts(&ts)?,
            });
        }
        Ok(incidents)
    }

    fn record_simulated_run(&self, run: &SimulatedRun) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO simulated_runs (id, pair_id, size, plan, expected_pnl, notes, ts)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                run.id,
                run.pair_id,
                run.size.to_string(),
                serde_json::to_string(&run.plan)?,
                run.expected_pnl.to_string(),
                run.notes,
                run.ts.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

fn order_from_row(row: &Row<'_>) -> rusqlite::Result<StoreResult<Order>> {
    Ok(build_order(row))
}

fn build_order(row: &Row<'_>) -> StoreResult<Order> {
    let side: String = row.get("side")?;
    let status: String = row.get("status")?;
    let role: String = row.get("role")?;
    let order_type: String = row.get("order_type")?;
    let price: Option<String> = row.get("price")?;
    let requested: String = row.get("requested_size")?;
    let filled: String = row.get("filled_size")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let raw: Option<String> = row.get("raw")?;
    Ok(Order {
        client_order_id: row.get("client_order_id")?,
        venue_order_id: row.get("venue_order_id")?,
        venue: Venue::new(row.get::<_, String>("venue")?),
        account_id: row.get("account_id")?,
        market_id: row.get("market_id")?,
        pair_id: row.get("pair_id")?,
        side: Side::from_str(&side).map_err(|err| StoreError::Corrupt(err.to_string()))?,
        order_type: match order_type.as_str() {
            "LIMIT" => OrderType::Limit,
            "MARKET" => OrderType::Market,
            other => return Err(StoreError::Corrupt(format!("order type '{other}'"))),
        },
        price: price.map(|value| parse_decimal(&value)).transpose()?,
        requested_size: parse_decimal(&requested)?,
        filled_size: parse_decimal(&filled)?,
        status: OrderStatus::from_str(&status)
            .map_err(|err| StoreError::Corrupt(err.to_string()))?,
        role: OrderRole::from_str(&role).map_err(|err| StoreError::Corrupt(err.to_string()))?,
        parent_fill_id: row.get("parent_fill_id")?,
        dry_run: row.get::<_, i64>("dry_run")? != 0,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
        raw: raw.map(|value| serde_json::from_str(&value)).transpose()?,
    })
}

fn double_limit_from_row(row: &Row<'_>) -> rusqlite::Result<StoreResult<DoubleLimit>> {
    Ok(build_double_limit(row))
}

fn build_double_limit(row: &Row<'_>) -> StoreResult<DoubleLimit> {
    let state: String = row.get("state")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    Ok(DoubleLimit {
        id: row.get("id")?,
        pair_key: row.get("pair_key")?,
        order_a_ref: row.get("order_a_ref")?,
        order_b_ref: row.get("order_b_ref")?,
        venue_a: Venue::new(row.get::<_, String>("venue_a")?),
        venue_b: Venue::new(row.get::<_, String>("venue_b")?),
        state: DoubleLimitState::from_str(&state)
            .map_err(|err| StoreError::Corrupt(err.to_string()))?,
        triggered_order_id: row.get("triggered_order_id")?,
        cancelled_order_id: row.get("cancelled_order_id")?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

fn parse_decimal(raw: &str) -> StoreResult<Decimal> {
    Decimal::from_str(raw).map_err(|_| StoreError::Corrupt(format!("decimal '{raw}'")))
}

fn parse_ts(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| StoreError::Corrupt(format!("timestamp '{raw}'")))
}

/// Generate a fresh record id for double limits and simulated runs.
#[must_use]
pub fn new_record_id() -> String {
    Uuid::new_v4().simple().to_string()
}
