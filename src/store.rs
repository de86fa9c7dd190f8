//! SQLite-backed persistence
//!
//! Holds strategy definitions, the live trade ledger, resource registry,
//! and settlement records. One connection behind a mutex; a settlement
//! commit is a single SQLite transaction so the record, its
//! distributions, and the resource profit credits land atomically.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::types::{
    DistributionPolicy, MarketId, OrderSide, ProfitDistribution, ResourceCapacityInfo,
    SettlementRecord, SettlementStatus, StrategyDefinition, StrategyStatus, Trade,
};

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

        // WAL for better concurrency
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.create_tables()?;
        info!("SQLite store initialized: {}", db_path.display());
        Ok(store)
    }

    /// In-memory store for tests and dry runs
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.create_tables()?;
        Ok(store)
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS strategies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'DRAFT',
                market_id TEXT NOT NULL,
                payload TEXT NOT NULL DEFAULT '{}',
                last_execution_time TEXT,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                market_id TEXT NOT NULL,
                resource_id TEXT,
                side TEXT NOT NULL,
                quantity REAL NOT NULL,
                price REAL NOT NULL,
                commission REAL DEFAULT 0,
                slippage REAL DEFAULT 0,
                profit REAL,
                timestamp TEXT NOT NULL,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS resources (
                resource_id TEXT PRIMARY KEY,
                vpp_id TEXT NOT NULL,
                capacity_kw REAL NOT NULL,
                available_kw REAL NOT NULL,
                max_power_kw REAL NOT NULL,
                min_power_kw REAL NOT NULL,
                cumulative_profit REAL NOT NULL DEFAULT 0,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        // UNIQUE(vpp_id, period) is the idempotency guarantee
        conn.execute(
            "CREATE TABLE IF NOT EXISTS settlements (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                vpp_id TEXT NOT NULL,
                period TEXT NOT NULL,
                period_start TEXT NOT NULL,
                period_end TEXT NOT NULL,
                total_revenue REAL NOT NULL,
                total_cost REAL NOT NULL,
                net_profit REAL NOT NULL,
                policy TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'COMPLETED',
                settled_at TEXT NOT NULL,
                UNIQUE(vpp_id, period)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS settlement_distributions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                settlement_id INTEGER NOT NULL REFERENCES settlements(id),
                resource_id TEXT NOT NULL,
                ratio REAL NOT NULL,
                amount REAL NOT NULL,
                method TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_trades_timestamp ON trades(timestamp)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_resources_vpp ON resources(vpp_id)",
            [],
        )?;

        debug!("Database schema created/verified");
        Ok(())
    }

    // =========================================================================
    // Strategies
    // =========================================================================

    pub fn insert_strategy(
        &self,
        name: &str,
        status: StrategyStatus,
        market_id: &MarketId,
        payload: &serde_json::Value,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO strategies (name, status, market_id, payload)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                name,
                status.as_str(),
                market_id.as_str(),
                serde_json::to_string(payload)?,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_strategy(&self, id: i64) -> Result<Option<StrategyDefinition>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, status, market_id, payload, last_execution_time
             FROM strategies WHERE id = ?1",
            params![id],
            map_strategy_row,
        )
        .optional()
        .with_context(|| format!("Failed to load strategy {id}"))
    }

    pub fn list_strategies(&self, status: Option<StrategyStatus>) -> Result<Vec<StrategyDefinition>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, status, market_id, payload, last_execution_time
             FROM strategies WHERE (?1 IS NULL OR status = ?1) ORDER BY id",
        )?;
        let strategies = stmt
            .query_map(params![status.map(|s| s.as_str())], map_strategy_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(strategies)
    }

    pub fn update_strategy_status(&self, id: i64, status: StrategyStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE strategies SET status = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        if changed == 0 {
            anyhow::bail!("strategy {id} not found");
        }
        debug!("Strategy {} -> {}", id, status.as_str());
        Ok(())
    }

    pub fn touch_strategy_execution(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE strategies SET last_execution_time = ?1 WHERE id = ?2",
            params![at.to_rfc3339(), id],
        )?;
        Ok(())
    }

    // =========================================================================
    // Trade ledger
    // =========================================================================

    pub fn record_trade(&self, trade: &Trade) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO trades
             (market_id, resource_id, side, quantity, price, commission, slippage, profit, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                trade.market_id.as_str(),
                trade.resource_id,
                trade.side.as_str(),
                trade.quantity,
                trade.price,
                trade.commission,
                trade.slippage,
                trade.profit,
                trade.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Trades for a VPP's resources in `[start, end)`, ascending by time
    pub fn trades_for_vpp(
        &self,
        vpp_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Trade>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT t.market_id, t.resource_id, t.side, t.quantity, t.price,
                    t.commission, t.slippage, t.profit, t.timestamp
             FROM trades t
             JOIN resources r ON r.resource_id = t.resource_id
             WHERE r.vpp_id = ?1 AND t.timestamp >= ?2 AND t.timestamp < ?3
             ORDER BY t.timestamp",
        )?;
        let trades = stmt
            .query_map(
                params![vpp_id, start.to_rfc3339(), end.to_rfc3339()],
                map_trade_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(trades)
    }

    // =========================================================================
    // Resources
    // =========================================================================

    pub fn upsert_resource(&self, vpp_id: &str, info: &ResourceCapacityInfo) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO resources
             (resource_id, vpp_id, capacity_kw, available_kw, max_power_kw, min_power_kw)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(resource_id) DO UPDATE SET
                vpp_id = excluded.vpp_id,
                capacity_kw = excluded.capacity_kw,
                available_kw = excluded.available_kw,
                max_power_kw = excluded.max_power_kw,
                min_power_kw = excluded.min_power_kw,
                updated_at = CURRENT_TIMESTAMP",
            params![
                info.resource_id,
                vpp_id,
                info.capacity_kw,
                info.available_kw,
                info.max_power_kw,
                info.min_power_kw,
            ],
        )?;
        Ok(())
    }

    pub fn list_resources(&self, vpp_id: &str) -> Result<Vec<ResourceCapacityInfo>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT resource_id, capacity_kw, available_kw, max_power_kw, min_power_kw
             FROM resources WHERE vpp_id = ?1 ORDER BY resource_id",
        )?;
        let resources = stmt
            .query_map(params![vpp_id], |row| {
                Ok(ResourceCapacityInfo {
                    resource_id: row.get(0)?,
                    capacity_kw: row.get(1)?,
                    available_kw: row.get(2)?,
                    max_power_kw: row.get(3)?,
                    min_power_kw: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(resources)
    }

    /// Resources of a VPP ranked by settled cumulative profit, best first
    pub fn resource_profit_ranking(
        &self,
        vpp_id: &str,
        limit: usize,
    ) -> Result<Vec<(String, f64)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT resource_id, cumulative_profit FROM resources
             WHERE vpp_id = ?1 ORDER BY cumulative_profit DESC, resource_id LIMIT ?2",
        )?;
        let ranking = stmt
            .query_map(params![vpp_id, limit as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ranking)
    }

    pub fn cumulative_profit(&self, resource_id: &str) -> Result<Option<f64>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT cumulative_profit FROM resources WHERE resource_id = ?1",
            params![resource_id],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to read cumulative profit")
    }

    // =========================================================================
    // Settlements
    // =========================================================================

    pub fn get_settlement(&self, vpp_id: &str, period: &str) -> Result<Option<SettlementRecord>> {
        let conn = self.conn.lock().unwrap();

        let header = conn
            .query_row(
                "SELECT id, vpp_id, period, period_start, period_end, total_revenue,
                        total_cost, net_profit, policy, status, settled_at
                 FROM settlements WHERE vpp_id = ?1 AND period = ?2",
                params![vpp_id, period],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, f64>(5)?,
                        row.get::<_, f64>(6)?,
                        row.get::<_, f64>(7)?,
                        row.get::<_, String>(8)?,
                        row.get::<_, String>(9)?,
                        row.get::<_, String>(10)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, vpp, period, start, end, revenue, cost, profit, policy, status, settled_at)) =
            header
        else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT resource_id, ratio, amount, method
             FROM settlement_distributions WHERE settlement_id = ?1 ORDER BY resource_id",
        )?;
        let distributions = stmt
            .query_map(params![id], |row| {
                Ok(ProfitDistribution {
                    resource_id: row.get(0)?,
                    ratio: row.get(1)?,
                    amount: row.get(2)?,
                    method: parse_policy(&row.get::<_, String>(3)?)
                        .unwrap_or(DistributionPolicy::EqualShare),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(SettlementRecord {
            vpp_id: vpp,
            period,
            period_start: parse_timestamp(&start)?,
            period_end: parse_timestamp(&end)?,
            total_revenue: revenue,
            total_cost: cost,
            net_profit: profit,
            policy: parse_policy(&policy)
                .with_context(|| format!("unknown distribution policy in store: {policy}"))?,
            distributions,
            status: SettlementStatus::parse(&status)
                .with_context(|| format!("unknown settlement status in store: {status}"))?,
            settled_at: parse_timestamp(&settled_at)?,
        }))
    }

    /// Persist a settlement atomically: record, distributions, and
    /// resource profit credits commit together or not at all.
    pub fn save_settlement(&self, record: &SettlementRecord) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO settlements
             (vpp_id, period, period_start, period_end, total_revenue, total_cost,
              net_profit, policy, status, settled_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.vpp_id,
                record.period,
                record.period_start.to_rfc3339(),
                record.period_end.to_rfc3339(),
                record.total_revenue,
                record.total_cost,
                record.net_profit,
                record.policy.as_str(),
                record.status.as_str(),
                record.settled_at.to_rfc3339(),
            ],
        )?;
        let settlement_id = tx.last_insert_rowid();

        for dist in &record.distributions {
            tx.execute(
                "INSERT INTO settlement_distributions
                 (settlement_id, resource_id, ratio, amount, method)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    settlement_id,
                    dist.resource_id,
                    dist.ratio,
                    dist.amount,
                    dist.method.as_str(),
                ],
            )?;
            tx.execute(
                "UPDATE resources
                 SET cumulative_profit = cumulative_profit + ?1, updated_at = CURRENT_TIMESTAMP
                 WHERE resource_id = ?2",
                params![dist.amount, dist.resource_id],
            )?;
        }

        tx.commit()?;
        info!(
            "Settlement saved: {} {} net {:.2} across {} resources",
            record.vpp_id,
            record.period,
            record.net_profit,
            record.distributions.len()
        );
        Ok(())
    }

    pub fn settlement_history(&self, vpp_id: &str) -> Result<Vec<SettlementRecord>> {
        let periods: Vec<String> = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT period FROM settlements WHERE vpp_id = ?1 ORDER BY period_start",
            )?;
            let rows = stmt
                .query_map(params![vpp_id], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut records = Vec::with_capacity(periods.len());
        for period in periods {
            if let Some(record) = self.get_settlement(vpp_id, &period)? {
                records.push(record);
            }
        }
        Ok(records)
    }
}

fn map_strategy_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StrategyDefinition> {
    Ok(StrategyDefinition {
        id: row.get(0)?,
        name: row.get(1)?,
        status: StrategyStatus::parse(&row.get::<_, String>(2)?)
            .unwrap_or(StrategyStatus::Draft),
        market_id: MarketId::new(row.get::<_, String>(3)?),
        payload: serde_json::from_str(&row.get::<_, String>(4)?).unwrap_or_default(),
        last_execution_time: row
            .get::<_, Option<String>>(5)?
            .and_then(|s| s.parse::<DateTime<Utc>>().ok()),
    })
}

fn map_trade_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Trade> {
    Ok(Trade {
        market_id: MarketId::new(row.get::<_, String>(0)?),
        resource_id: row.get(1)?,
        side: OrderSide::parse(&row.get::<_, String>(2)?).unwrap_or(OrderSide::Buy),
        quantity: row.get(3)?,
        price: row.get(4)?,
        commission: row.get(5)?,
        slippage: row.get(6)?,
        profit: row.get(7)?,
        timestamp: row
            .get::<_, String>(8)?
            .parse::<DateTime<Utc>>()
            .unwrap_or_default(),
    })
}

fn parse_policy(s: &str) -> Option<DistributionPolicy> {
    DistributionPolicy::parse(s)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    s.parse::<DateTime<Utc>>()
        .with_context(|| format!("invalid timestamp in store: {s}"))
}
