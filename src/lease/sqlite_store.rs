//! SQLite-backed lease store.
//!
//! Every operation runs in an `IMMEDIATE` transaction, so processes sharing
//! the database file serialize on the write lock and each lease id behaves
//! linearizably. Waiting on that lock is blocking I/O, so the async store
//! methods run their SQL on the blocking thread pool.
//!
//! Fencing tokens live in `lease_fences`, which is never pruned: a lease id
//! that was pruned and acquired again continues from its old high-water mark.

use super::{FencingToken, LeaseAcquireResult, LeaseState, LeaseStore, LeaseStoreError, LeaseTicket};
use crate::clock::{to_chrono, SharedClock};
use crate::sqlite_column;
use crate::sqlite_persistence::{
    migrate_to_latest, read_schema_version, Column, SqlType, Table, VersionedSchema,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

const LEASES_TABLE_V1: Table = Table {
    name: "leases",
    columns: &[
        sqlite_column!("lease_id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("token", &SqlType::Integer, non_null = true),
        sqlite_column!("expires_at", &SqlType::Text),
        sqlite_column!("last_acquired_at", &SqlType::Text),
        sqlite_column!("last_released_at", &SqlType::Text),
        sqlite_column!("updated_at", &SqlType::Text, non_null = true),
    ],
    indices: &[("idx_leases_updated_at", "updated_at")],
};

const LEASE_FENCES_TABLE_V2: Table = Table {
    name: "lease_fences",
    columns: &[
        sqlite_column!("lease_id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("token", &SqlType::Integer, non_null = true),
    ],
    indices: &[],
};

fn add_lease_fences(conn: &Connection) -> Result<()> {
    LEASE_FENCES_TABLE_V2.create(conn)?;
    conn.execute(
        "INSERT INTO lease_fences (lease_id, token) SELECT lease_id, token FROM leases",
        [],
    )?;
    Ok(())
}

/// All versioned schemas for the lease database.
///
/// Version 1: leases table
/// Version 2: lease_fences table, fencing high-water marks that survive pruning
pub const LEASE_VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 1,
        tables: &[LEASES_TABLE_V1],
        migration: None,
    },
    VersionedSchema {
        version: 2,
        tables: &[LEASES_TABLE_V1, LEASE_FENCES_TABLE_V2],
        migration: Some(add_lease_fences),
    },
];

struct LeaseRow {
    token: u64,
    expires_at: Option<DateTime<Utc>>,
    last_acquired_at: Option<DateTime<Utc>>,
    last_released_at: Option<DateTime<Utc>>,
}

impl LeaseRow {
    fn state(&self) -> LeaseState {
        LeaseState {
            expires: self.expires_at,
            last_acquired_at: self.last_acquired_at,
            last_released_at: self.last_released_at,
        }
    }
}

pub struct SqliteLeaseStore {
    conn: Arc<Mutex<Connection>>,
    clock: SharedClock,
    initialized: AtomicBool,
}

impl SqliteLeaseStore {
    /// Opens (or creates) the database file. The schema is left untouched
    /// until [`SqliteLeaseStore::migrate`] runs.
    pub fn open<P: AsRef<Path>>(db_path: P, clock: SharedClock) -> Result<Self> {
        let path = db_path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open lease database at {:?}", path))?;
        conn.busy_timeout(Duration::from_secs(5))?;

        let latest = LEASE_VERSIONED_SCHEMAS.last().map(|s| s.version);
        let initialized = read_schema_version(&conn)? == latest;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock,
            initialized: AtomicBool::new(initialized),
        })
    }

    /// Creates or migrates the schema to the latest version. Blocking.
    pub fn migrate(&self) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let version = migrate_to_latest(&mut conn, LEASE_VERSIONED_SCHEMAS)?;
        self.initialized.store(true, Ordering::SeqCst);
        info!("Lease database at schema version {}", version);
        Ok(version)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Deletes rows without a live holder that were last touched before
    /// `cutoff`. Fencing high-water marks are kept. Returns the number of
    /// deleted rows. Blocking.
    pub fn prune_idle(&self, cutoff: DateTime<Utc>) -> Result<usize, LeaseStoreError> {
        self.ensure_initialized()?;
        let now = format_ts(&self.now());
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let deleted = conn.execute(
            "DELETE FROM leases
             WHERE (expires_at IS NULL OR expires_at <= ?1) AND updated_at < ?2",
            params![now, format_ts(&cutoff)],
        )?;
        Ok(deleted)
    }

    fn ensure_initialized(&self) -> Result<(), LeaseStoreError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(LeaseStoreError::NotInitialized)
        }
    }

    // Stored timestamps have microsecond precision
    fn now(&self) -> DateTime<Utc> {
        self.clock.now().trunc_subsecs(6)
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, LeaseStoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, LeaseStoreError> + Send + 'static,
    {
        self.ensure_initialized()?;
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut conn)
        })
        .await
        .map_err(|e| LeaseStoreError::Unavailable(format!("SQLite task failed: {}", e)))?
    }

    fn load(conn: &Connection, lease_id: &str) -> Result<Option<LeaseRow>, LeaseStoreError> {
        let raw = conn
            .query_row(
                "SELECT token, expires_at, last_acquired_at, last_released_at
                 FROM leases WHERE lease_id = ?1",
                params![lease_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((token, expires_at, last_acquired_at, last_released_at)) = raw else {
            return Ok(None);
        };

        Ok(Some(LeaseRow {
            token: token as u64,
            expires_at: parse_ts(lease_id, expires_at)?,
            last_acquired_at: parse_ts(lease_id, last_acquired_at)?,
            last_released_at: parse_ts(lease_id, last_released_at)?,
        }))
    }

    /// Bumps and returns the fencing high-water mark for `lease_id`.
    fn next_token(conn: &Connection, lease_id: &str) -> Result<u64, LeaseStoreError> {
        let token: i64 = conn.query_row(
            "INSERT INTO lease_fences (lease_id, token) VALUES (?1, 1)
             ON CONFLICT(lease_id) DO UPDATE SET token = token + 1
             RETURNING token",
            params![lease_id],
            |row| row.get(0),
        )?;
        Ok(token as u64)
    }
}

fn format_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(lease_id: &str, raw: Option<String>) -> Result<Option<DateTime<Utc>>, LeaseStoreError> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| LeaseStoreError::Corrupt {
                lease_id: lease_id.to_string(),
                reason: format!("bad timestamp {:?}: {}", s, e),
            })
    })
    .transpose()
}

#[async_trait]
impl LeaseStore for SqliteLeaseStore {
    async fn try_acquire(
        &self,
        lease_id: &str,
        duration: Duration,
    ) -> Result<LeaseAcquireResult, LeaseStoreError> {
        let now = self.now();
        let lease_id = lease_id.to_string();

        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let row = Self::load(&tx, &lease_id)?;
            if let Some(row) = &row {
                if row.expires_at.is_some_and(|expires| expires > now) {
                    return Ok(LeaseAcquireResult::NotAcquired { state: row.state() });
                }
            }

            let token = Self::next_token(&tx, &lease_id)?;
            let expires = now + to_chrono(duration);
            tx.execute(
                "INSERT INTO leases (lease_id, token, expires_at, last_acquired_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(lease_id) DO UPDATE SET
                    token = excluded.token,
                    expires_at = excluded.expires_at,
                    last_acquired_at = excluded.last_acquired_at,
                    updated_at = excluded.updated_at",
                params![lease_id, token as i64, format_ts(&expires), format_ts(&now)],
            )?;
            tx.commit()?;

            Ok(LeaseAcquireResult::Acquired {
                state: LeaseState {
                    expires: Some(expires),
                    last_acquired_at: Some(now),
                    last_released_at: row.and_then(|r| r.last_released_at),
                },
                ticket: LeaseTicket {
                    lease_id,
                    token: FencingToken(token),
                    expires,
                },
            })
        })
        .await
    }

    async fn try_renew(
        &self,
        ticket: &LeaseTicket,
        duration: Duration,
    ) -> Result<LeaseAcquireResult, LeaseStoreError> {
        let now = self.now();
        let ticket = ticket.clone();

        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let Some(row) = Self::load(&tx, &ticket.lease_id)? else {
                return Ok(LeaseAcquireResult::NotAcquired {
                    state: LeaseState::default(),
                });
            };
            if row.token != ticket.token.0 || row.expires_at.is_none() {
                return Ok(LeaseAcquireResult::NotAcquired { state: row.state() });
            }

            let expires = now + to_chrono(duration);
            tx.execute(
                "UPDATE leases SET expires_at = ?1, updated_at = ?2 WHERE lease_id = ?3",
                params![format_ts(&expires), format_ts(&now), ticket.lease_id],
            )?;
            tx.commit()?;

            Ok(LeaseAcquireResult::Acquired {
                ticket: LeaseTicket { expires, ..ticket },
                state: LeaseState {
                    expires: Some(expires),
                    ..row.state()
                },
            })
        })
        .await
    }

    async fn release(
        &self,
        ticket: &LeaseTicket,
    ) -> Result<Option<DateTime<Utc>>, LeaseStoreError> {
        let now = self.now();
        let ticket = ticket.clone();

        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE leases
                 SET expires_at = NULL, last_released_at = ?1, updated_at = ?1
                 WHERE lease_id = ?2 AND token = ?3 AND expires_at IS NOT NULL",
                params![format_ts(&now), ticket.lease_id, ticket.token.0 as i64],
            )?;
            Ok((updated == 1).then_some(now))
        })
        .await
    }

    async fn describe(&self, lease_id: &str) -> Result<Option<LeaseState>, LeaseStoreError> {
        let lease_id = lease_id.to_string();
        self.with_conn(move |conn| Ok(Self::load(conn, &lease_id)?.map(|row| row.state())))
            .await
    }
}
