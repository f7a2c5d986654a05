//! SQLite-based state store.
//!
//! The connection lives behind a mutex so every public method is a single
//! atomic unit with respect to other callers; multi-statement updates
//! (zone replacement) run inside a transaction.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("an active route for {0} already exists")]
    Conflict(String),

    #[error("State not found: {0}")]
    NotFound(String),

    #[error("state store lock poisoned")]
    Poisoned,
}

/// Where a route's traffic lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    /// A port on the host, reached through `localhost`.
    Host,
    /// A container reached by name over a shared network.
    Container,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Container => "container",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "host" => Some(Self::Host),
            "container" => Some(Self::Container),
            _ => None,
        }
    }
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing record lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteStatus {
    Active,
    Deleted,
}

impl RouteStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Deleted => "deleted",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }
}

/// A public-hostname-to-internal-target mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRecord {
    pub id: i64,
    /// Bare label, e.g. `api`.
    pub hostname: String,
    /// Zone, e.g. `example.com`.
    pub domain: String,
    pub owning_workload: String,
    pub target_port: u16,
    pub target_kind: TargetKind,
    /// `localhost:5000` or `web:5073`.
    pub target_address: String,
    pub status: RouteStatus,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl RoutingRecord {
    /// Fully qualified public hostname.
    pub fn fqdn(&self) -> String {
        format!("{}.{}", self.hostname, self.domain)
    }

    /// Public URL served by the tunnel.
    pub fn public_url(&self) -> String {
        format!("https://{}", self.fqdn())
    }

    /// Target in `kind:address` form, e.g. `host:localhost:5000`.
    pub fn target(&self) -> String {
        format!("{}:{}", self.target_kind, self.target_address)
    }
}

/// Fields needed to insert a new active routing record.
#[derive(Debug, Clone)]
pub struct NewRoute {
    pub hostname: String,
    pub domain: String,
    pub owning_workload: String,
    pub target_port: u16,
    pub target_kind: TargetKind,
    pub target_address: String,
}

/// Filter for listing active routes.
#[derive(Debug, Clone, Default)]
pub struct RouteFilter {
    pub owning_workload: Option<String>,
    pub domain: Option<String>,
}

/// Daemon state as recorded in health samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleState {
    Up,
    Degraded,
    Down,
}

impl SampleState {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Degraded => "degraded",
            Self::Down => "down",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "up" => Some(Self::Up),
            "degraded" => Some(Self::Degraded),
            "down" => Some(Self::Down),
            _ => None,
        }
    }
}

/// One liveness observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSample {
    pub timestamp: DateTime<Utc>,
    pub state: SampleState,
    pub consecutive_failures: u32,
    pub restart_count: u64,
}

/// A DNS zone the operator's credentials can manage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub domain_name: String,
    pub provider_zone_id: String,
    pub discovered_at: DateTime<Utc>,
}

/// The full zone list plus the time it was pulled.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ZoneSnapshot {
    pub zones: Vec<Zone>,
    /// `None` until the first successful discovery.
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl ZoneSnapshot {
    /// Look up a zone by domain name.
    pub fn find(&self, domain: &str) -> Option<&Zone> {
        self.zones.iter().find(|z| z.domain_name == domain)
    }
}

/// Diagnostic copy of the last topology snapshot.
#[derive(Debug, Clone)]
pub struct StoredTopology {
    pub captured_at: DateTime<Utc>,
    pub snapshot_json: String,
}

/// An audit log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub action: String,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub detail: String,
}

impl AuditEntry {
    /// Build an entry stamped with the current time.
    pub fn now(
        action: impl Into<String>,
        actor: impl Into<String>,
        success: bool,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            action: action.into(),
            actor: actor.into(),
            timestamp: Utc::now(),
            success,
            detail: detail.into(),
        }
    }
}

/// SQLite state store.
pub struct StateStore {
    conn: Mutex<Connection>,
}

const ROUTE_COLUMNS: &str = "id, hostname, domain, owning_workload, target_port, target_kind, \
     target_address, status, created_at, deleted_at";

impl StateStore {
    /// Open or create a state store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StateStoreError> {
        let conn = Connection::open(path)?;

        // WAL lets diagnostics read while the daemon writes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StateStoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StateStoreError> {
        self.conn.lock().map_err(|_| StateStoreError::Poisoned)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<(), StateStoreError> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS routes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                hostname TEXT NOT NULL,
                domain TEXT NOT NULL,
                owning_workload TEXT NOT NULL,
                target_port INTEGER NOT NULL,
                target_kind TEXT NOT NULL,
                target_address TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                deleted_at INTEGER
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_routes_active_hostname
                ON routes(hostname, domain) WHERE status = 'active';
            CREATE INDEX IF NOT EXISTS idx_routes_workload ON routes(owning_workload);

            CREATE TABLE IF NOT EXISTS health_samples (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL,
                state TEXT NOT NULL,
                consecutive_failures INTEGER NOT NULL,
                restart_count INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS zones (
                domain_name TEXT PRIMARY KEY,
                provider_zone_id TEXT NOT NULL,
                discovered_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS zone_snapshot (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                refreshed_at INTEGER
            );

            INSERT OR IGNORE INTO zone_snapshot (id) VALUES (1);

            CREATE TABLE IF NOT EXISTS topology_snapshots (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                captured_at INTEGER NOT NULL,
                snapshot TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                action TEXT NOT NULL,
                actor TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                success INTEGER NOT NULL,
                detail TEXT NOT NULL
            );
            "#,
        )?;

        debug!("State store schema initialized");
        Ok(())
    }

    /// Cheap connectivity probe for readiness checks.
    pub fn health_check(&self) -> Result<(), StateStoreError> {
        self.conn()?.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Routes
    // -------------------------------------------------------------------------

    /// Insert a new active route.
    ///
    /// Fails with [`StateStoreError::Conflict`] if (hostname, domain) is already active.
    pub fn insert_route(&self, route: &NewRoute) -> Result<RoutingRecord, StateStoreError> {
        let conn = self.conn()?;
        let now = Utc::now();

        let inserted = conn.execute(
            r#"
            INSERT INTO routes (hostname, domain, owning_workload, target_port, target_kind,
                                target_address, status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'active', ?7)
            "#,
            params![
                route.hostname,
                route.domain,
                route.owning_workload,
                route.target_port,
                route.target_kind.as_str(),
                route.target_address,
                now.timestamp_millis(),
            ],
        );

        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                return Err(StateStoreError::Conflict(format!(
                    "{}.{}",
                    route.hostname, route.domain
                )));
            }
            Err(e) => return Err(e.into()),
        }

        let id = conn.last_insert_rowid();
        let sql = format!("SELECT {ROUTE_COLUMNS} FROM routes WHERE id = ?1");
        conn.query_row(&sql, params![id], route_from_row)
            .map_err(Into::into)
    }

    /// Get the active route for (hostname, domain), if any.
    pub fn get_active_route(
        &self,
        hostname: &str,
        domain: &str,
    ) -> Result<Option<RoutingRecord>, StateStoreError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {ROUTE_COLUMNS} FROM routes
             WHERE hostname = ?1 AND domain = ?2 AND status = 'active'"
        );
        conn.query_row(&sql, params![hostname, domain], route_from_row)
            .optional()
            .map_err(Into::into)
    }

    /// Get a route by id regardless of status.
    pub fn get_route(&self, id: i64) -> Result<Option<RoutingRecord>, StateStoreError> {
        let conn = self.conn()?;
        let sql = format!("SELECT {ROUTE_COLUMNS} FROM routes WHERE id = ?1");
        conn.query_row(&sql, params![id], route_from_row)
            .optional()
            .map_err(Into::into)
    }

    /// Mark an active route deleted.
    pub fn mark_route_deleted(&self, id: i64) -> Result<(), StateStoreError> {
        let changed = self.conn()?.execute(
            "UPDATE routes SET status = 'deleted', deleted_at = ?1 WHERE id = ?2 AND status = 'active'",
            params![Utc::now().timestamp_millis(), id],
        )?;
        if changed == 0 {
            return Err(StateStoreError::NotFound(format!("active route {id}")));
        }
        Ok(())
    }

    /// Undo [`Self::mark_route_deleted`] during rollback.
    pub fn reactivate_route(&self, id: i64) -> Result<(), StateStoreError> {
        let result = self.conn()?.execute(
            "UPDATE routes SET status = 'active', deleted_at = NULL WHERE id = ?1 AND status = 'deleted'",
            params![id],
        );
        match result {
            Ok(0) => Err(StateStoreError::NotFound(format!("deleted route {id}"))),
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(StateStoreError::Conflict(format!("route {id}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a route row entirely. Only used to undo an insert during rollback.
    pub fn purge_route(&self, id: i64) -> Result<(), StateStoreError> {
        self.conn()?
            .execute("DELETE FROM routes WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// List active routes, ordered by domain then hostname.
    pub fn list_active_routes(
        &self,
        filter: &RouteFilter,
    ) -> Result<Vec<RoutingRecord>, StateStoreError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {ROUTE_COLUMNS} FROM routes
             WHERE status = 'active'
               AND (?1 IS NULL OR owning_workload = ?1)
               AND (?2 IS NULL OR domain = ?2)
             ORDER BY domain, hostname"
        );
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(
                params![filter.owning_workload, filter.domain],
                route_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    // -------------------------------------------------------------------------
    // Health samples
    // -------------------------------------------------------------------------

    /// Append a health sample.
    pub fn append_health_sample(&self, sample: &HealthSample) -> Result<(), StateStoreError> {
        self.conn()?.execute(
            r#"
            INSERT INTO health_samples (timestamp, state, consecutive_failures, restart_count)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                sample.timestamp.timestamp_millis(),
                sample.state.as_str(),
                sample.consecutive_failures,
                sample.restart_count as i64,
            ],
        )?;
        Ok(())
    }

    /// Most recent samples, newest first.
    pub fn recent_health_samples(&self, limit: u32) -> Result<Vec<HealthSample>, StateStoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT timestamp, state, consecutive_failures, restart_count
             FROM health_samples ORDER BY id DESC LIMIT ?1",
        )?;
        let samples = stmt
            .query_map(params![limit], |row| {
                let state: String = row.get(1)?;
                let restart_count: i64 = row.get(3)?;
                Ok(HealthSample {
                    timestamp: from_millis(row.get(0)?),
                    state: SampleState::from_str(&state).unwrap_or(SampleState::Down),
                    consecutive_failures: row.get(2)?,
                    restart_count: restart_count.max(0) as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(samples)
    }

    /// Latest sample, if any.
    pub fn latest_health_sample(&self) -> Result<Option<HealthSample>, StateStoreError> {
        Ok(self.recent_health_samples(1)?.into_iter().next())
    }

    // -------------------------------------------------------------------------
    // Zones
    // -------------------------------------------------------------------------

    /// Replace the zone snapshot wholesale.
    pub fn replace_zones(
        &self,
        zones: &[Zone],
        refreshed_at: DateTime<Utc>,
    ) -> Result<(), StateStoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM zones", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO zones (domain_name, provider_zone_id, discovered_at) VALUES (?1, ?2, ?3)",
            )?;
            for zone in zones {
                stmt.execute(params![
                    zone.domain_name,
                    zone.provider_zone_id,
                    zone.discovered_at.timestamp_millis(),
                ])?;
            }
        }
        tx.execute(
            "UPDATE zone_snapshot SET refreshed_at = ?1 WHERE id = 1",
            params![refreshed_at.timestamp_millis()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Read the current zone snapshot.
    pub fn zone_snapshot(&self) -> Result<ZoneSnapshot, StateStoreError> {
        let conn = self.conn()?;
        let refreshed_at: Option<i64> = conn.query_row(
            "SELECT refreshed_at FROM zone_snapshot WHERE id = 1",
            [],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(
            "SELECT domain_name, provider_zone_id, discovered_at FROM zones ORDER BY domain_name",
        )?;
        let zones = stmt
            .query_map([], |row| {
                Ok(Zone {
                    domain_name: row.get(0)?,
                    provider_zone_id: row.get(1)?,
                    discovered_at: from_millis(row.get(2)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ZoneSnapshot {
            zones,
            refreshed_at: refreshed_at.map(from_millis),
        })
    }

    // -------------------------------------------------------------------------
    // Topology
    // -------------------------------------------------------------------------

    /// Keep the last topology snapshot for diagnostics.
    pub fn record_topology_snapshot(
        &self,
        captured_at: DateTime<Utc>,
        snapshot_json: &str,
    ) -> Result<(), StateStoreError> {
        self.conn()?.execute(
            r#"
            INSERT INTO topology_snapshots (id, captured_at, snapshot) VALUES (1, ?1, ?2)
            ON CONFLICT(id) DO UPDATE SET
                captured_at = excluded.captured_at,
                snapshot = excluded.snapshot
            "#,
            params![captured_at.timestamp_millis(), snapshot_json],
        )?;
        Ok(())
    }

    /// Last recorded topology snapshot.
    pub fn latest_topology_snapshot(&self) -> Result<Option<StoredTopology>, StateStoreError> {
        self.conn()?
            .query_row(
                "SELECT captured_at, snapshot FROM topology_snapshots WHERE id = 1",
                [],
                |row| {
                    Ok(StoredTopology {
                        captured_at: from_millis(row.get(0)?),
                        snapshot_json: row.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }

    // -------------------------------------------------------------------------
    // Audit log
    // -------------------------------------------------------------------------

    /// Append an audit entry.
    pub fn append_audit(&self, entry: &AuditEntry) -> Result<(), StateStoreError> {
        self.conn()?.execute(
            "INSERT INTO audit_log (action, actor, timestamp, success, detail) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.action,
                entry.actor,
                entry.timestamp.timestamp_millis(),
                entry.success,
                entry.detail,
            ],
        )?;
        Ok(())
    }

    /// Most recent audit entries, newest first.
    pub fn recent_audit(&self, limit: u32) -> Result<Vec<AuditEntry>, StateStoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT action, actor, timestamp, success, detail FROM audit_log ORDER BY id DESC LIMIT ?1",
        )?;
        let entries = stmt
            .query_map(params![limit], |row| {
                Ok(AuditEntry {
                    action: row.get(0)?,
                    actor: row.get(1)?,
                    timestamp: from_millis(row.get(2)?),
                    success: row.get(3)?,
                    detail: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn route_from_row(row: &Row<'_>) -> rusqlite::Result<RoutingRecord> {
    let kind: String = row.get(5)?;
    let status: String = row.get(7)?;
    let deleted_at: Option<i64> = row.get(9)?;

    Ok(RoutingRecord {
        id: row.get(0)?,
        hostname: row.get(1)?,
        domain: row.get(2)?,
        owning_workload: row.get(3)?,
        target_port: row.get(4)?,
        target_kind: TargetKind::from_str(&kind).unwrap_or(TargetKind::Host),
        target_address: row.get(6)?,
        status: RouteStatus::from_str(&status).unwrap_or(RouteStatus::Deleted),
        created_at: from_millis(row.get(8)?),
        deleted_at: deleted_at.map(from_millis),
    })
}
