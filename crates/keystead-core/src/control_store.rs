//! Transactional control-plane store.
//!
//! Every mutation of a control-plane row commits together with a checksum
//! over the canonical serialization of the full mutable row set and a
//! revision bump of exactly one. WAL journal mode, full synchronous
//! durability and foreign keys are configured at connection time — never
//! inside a migration transaction, because SQLite forbids changing the
//! journal mode there. Migrations are forward-only, keyed by a persisted
//! schema version, and applied in a single transaction; failure is fatal at
//! startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction,
    TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

pub const SCHEMA_VERSION: i64 = 1;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Tamper-evidence singleton: monotonic revision plus a checksum over the
/// canonical mutable row set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    pub revision: i64,
    pub checksum: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppRow {
    pub name: String,
    pub payload: Vec<u8>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRow {
    pub seq: i64,
    pub kind: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

pub struct ControlStore {
    write: Mutex<Connection>,
    read: Mutex<Connection>,
    path: PathBuf,
}

/// Holds the store's write lock for the export snapshot window. Writers
/// resume when this guard drops.
pub struct QuiesceGuard<'a> {
    _conn: MutexGuard<'a, Connection>,
}

impl ControlStore {
    /// Open (or create) the store and bring the schema up to date. Serves no
    /// requests if any migration fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let write = Connection::open(&path)?;
        write.busy_timeout(BUSY_TIMEOUT)?;
        write.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = FULL;",
        )?;

        migrate(&write)?;

        let read = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        read.busy_timeout(BUSY_TIMEOUT)?;

        Ok(Self {
            write: Mutex::new(write),
            read: Mutex::new(read),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ── Mutations ────────────────────────────────────────────────────────

    /// Run one logical-row mutation inside a transaction that also
    /// recomputes the checksum and bumps the revision by exactly one.
    /// All four steps commit together or none do.
    fn with_mutation(&self, f: impl FnOnce(&Transaction) -> Result<()>) -> Result<Meta> {
        let mut conn = self.write.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        f(&tx)?;
        let checksum = compute_checksum(&tx)?;
        let revision: i64 = tx.query_row("SELECT revision FROM meta WHERE id = 1", [], |row| {
            row.get(0)
        })?;
        let meta = Meta {
            revision: revision + 1,
            checksum,
            updated_at: Utc::now(),
        };
        tx.execute(
            "UPDATE meta SET revision = ?1, checksum = ?2, updated_at = ?3 WHERE id = 1",
            params![meta.revision, meta.checksum, meta.updated_at.to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(meta)
    }

    pub fn set_auth_state(&self, payload: &[u8]) -> Result<Meta> {
        self.with_mutation(|tx| {
            tx.execute(
                "INSERT INTO auth_state (id, payload, updated_at) VALUES (1, ?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET payload = ?1, updated_at = ?2",
                params![payload, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    pub fn set_remote_config(&self, payload: &[u8]) -> Result<Meta> {
        self.with_mutation(|tx| {
            tx.execute(
                "INSERT INTO remote_config (id, payload, updated_at) VALUES (1, ?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET payload = ?1, updated_at = ?2",
                params![payload, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    pub fn upsert_app(&self, name: &str, payload: &[u8]) -> Result<Meta> {
        if name.is_empty() {
            return Err(Error::InvalidInput("app name must not be empty"));
        }
        self.with_mutation(|tx| {
            tx.execute(
                "INSERT INTO apps (name, payload, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO UPDATE SET payload = ?2, updated_at = ?3",
                params![name, payload, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    /// Administrative reset: clears every mutable row. The revision counter
    /// stays monotonic across the reset.
    pub fn reset(&self) -> Result<Meta> {
        let meta = self.with_mutation(|tx| {
            tx.execute("DELETE FROM auth_state", [])?;
            tx.execute("DELETE FROM remote_config", [])?;
            tx.execute("DELETE FROM apps", [])?;
            Ok(())
        })?;
        info!(revision = meta.revision, "control store reset");
        Ok(meta)
    }

    /// Append to the audit log. Events are append-only rather than mutable
    /// state, so they bump neither the revision nor the checksum.
    pub fn append_event(&self, kind: &str, payload: serde_json::Value) -> Result<()> {
        let conn = self.write.lock();
        conn.execute(
            "INSERT INTO events (kind, payload, created_at) VALUES (?1, ?2, ?3)",
            params![kind, payload.to_string(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    // ── Reads (separate connection; not blocked by in-flight writes) ─────

    pub fn meta(&self) -> Result<Meta> {
        let conn = self.read.lock();
        read_meta(&conn)
    }

    pub fn auth_state(&self) -> Result<Option<Vec<u8>>> {
        let conn = self.read.lock();
        conn.query_row("SELECT payload FROM auth_state WHERE id = 1", [], |row| {
            row.get(0)
        })
        .optional()
        .map_err(Into::into)
    }

    pub fn remote_config(&self) -> Result<Option<Vec<u8>>> {
        let conn = self.read.lock();
        conn.query_row("SELECT payload FROM remote_config WHERE id = 1", [], |row| {
            row.get(0)
        })
        .optional()
        .map_err(Into::into)
    }

    pub fn app(&self, name: &str) -> Result<Option<AppRow>> {
        let conn = self.read.lock();
        let row = conn
            .query_row(
                "SELECT name, payload, updated_at FROM apps WHERE name = ?1",
                params![name],
                row_to_app,
            )
            .optional()?;
        row.map(app_from_parts).transpose()
    }

    pub fn list_apps(&self) -> Result<Vec<AppRow>> {
        let conn = self.read.lock();
        let mut stmt =
            conn.prepare("SELECT name, payload, updated_at FROM apps ORDER BY name")?;
        let rows = stmt
            .query_map([], row_to_app)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(app_from_parts).collect()
    }

    pub fn recent_events(&self, limit: u32) -> Result<Vec<EventRow>> {
        let conn = self.read.lock();
        let mut stmt = conn.prepare(
            "SELECT seq, kind, payload, created_at FROM events ORDER BY seq DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                let payload: String = row.get(2)?;
                let created_at: String = row.get(3)?;
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, payload, created_at))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(seq, kind, payload, created_at)| {
                Ok(EventRow {
                    seq,
                    kind,
                    payload: serde_json::from_str(&payload)?,
                    created_at: parse_rfc3339(&created_at)?,
                })
            })
            .collect()
    }

    /// Recompute the checksum over the current row set and compare against
    /// the stored one.
    pub fn verify(&self) -> Result<()> {
        let conn = self.read.lock();
        let meta = read_meta(&conn)?;
        let actual = compute_checksum(&conn)?;
        if actual != meta.checksum {
            return Err(Error::IntegrityMismatch {
                volume: "control-store".into(),
                expected: meta.checksum,
                actual,
            });
        }
        Ok(())
    }

    /// Take the write lock and checkpoint the WAL so the on-disk files are a
    /// consistent snapshot. Hold the guard only for the copy window.
    pub fn quiesce(&self) -> Result<QuiesceGuard<'_>> {
        let conn = self.write.lock();
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(QuiesceGuard { _conn: conn })
    }
}

fn row_to_app(row: &rusqlite::Row) -> rusqlite::Result<(String, Vec<u8>, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

/// A row with an unparseable timestamp is corrupted data and surfaces as an
/// error, never as a substituted value.
fn app_from_parts((name, payload, updated_at): (String, Vec<u8>, String)) -> Result<AppRow> {
    Ok(AppRow {
        name,
        payload,
        updated_at: parse_rfc3339(&updated_at)?,
    })
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::MigrationFailure(format!("bad timestamp in store: {e}")))
}

fn read_meta(conn: &Connection) -> Result<Meta> {
    let (revision, checksum, updated_at): (i64, String, String) = conn.query_row(
        "SELECT revision, checksum, updated_at FROM meta WHERE id = 1",
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;
    Ok(Meta {
        revision,
        checksum,
        updated_at: parse_rfc3339(&updated_at)?,
    })
}

/// Canonical serialization of the mutable row set: singletons in fixed
/// order, then apps sorted by name. Field separator 0x1f, row terminator
/// '\n'. Events and meta itself are excluded — events are append-only and
/// meta is derived.
fn compute_checksum(conn: &Connection) -> Result<String> {
    let mut hasher = blake3::Hasher::new();

    for (table, label) in [("auth_state", "auth_state"), ("remote_config", "remote_config")] {
        let row: Option<(Vec<u8>, String)> = conn
            .query_row(
                &format!("SELECT payload, updated_at FROM {table} WHERE id = 1"),
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((payload, updated_at)) = row {
            hasher.update(label.as_bytes());
            hasher.update(&[0x1f]);
            hasher.update(&payload);
            hasher.update(&[0x1f]);
            hasher.update(updated_at.as_bytes());
            hasher.update(b"\n");
        }
    }

    let mut stmt = conn.prepare("SELECT name, payload, updated_at FROM apps ORDER BY name")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, Vec<u8>>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;
    for row in rows {
        let (name, payload, updated_at) = row?;
        hasher.update(b"app");
        hasher.update(&[0x1f]);
        hasher.update(name.as_bytes());
        hasher.update(&[0x1f]);
        hasher.update(&payload);
        hasher.update(&[0x1f]);
        hasher.update(updated_at.as_bytes());
        hasher.update(b"\n");
    }

    Ok(hasher.finalize().to_hex().to_string())
}

/// Forward-only migrations inside one transaction. A store written by a
/// newer schema than this build understands is refused outright.
fn migrate(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
        [],
    )
    .map_err(|e| Error::MigrationFailure(e.to_string()))?;

    let current: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .map_err(|e| Error::MigrationFailure(e.to_string()))?;

    if current > SCHEMA_VERSION {
        return Err(Error::MigrationFailure(format!(
            "store schema version {current} is newer than supported {SCHEMA_VERSION}"
        )));
    }
    if current == SCHEMA_VERSION {
        return Ok(());
    }

    let apply = || -> Result<()> {
        conn.execute_batch("BEGIN IMMEDIATE")?;
        if current < 1 {
            migrate_v1(conn)?;
        }
        conn.execute_batch("COMMIT")?;
        Ok(())
    };
    if let Err(e) = apply() {
        let _ = conn.execute_batch("ROLLBACK");
        return Err(Error::MigrationFailure(e.to_string()));
    }
    info!(from = current, to = SCHEMA_VERSION, "control store migrated");
    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            revision INTEGER NOT NULL,
            checksum TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS auth_state (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            payload BLOB NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS remote_config (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            payload BLOB NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS apps (
            name TEXT PRIMARY KEY,
            payload BLOB NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS events (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind);

        INSERT INTO schema_version (version) VALUES (1);
        "#,
    )?;

    // Fresh store: seed the meta singleton at revision 0 with the checksum
    // of the (empty) row set.
    let exists: Option<i64> = conn
        .query_row("SELECT id FROM meta WHERE id = 1", [], |row| row.get(0))
        .optional()?;
    if exists.is_none() {
        let checksum = compute_checksum(conn)?;
        conn.execute(
            "INSERT INTO meta (id, revision, checksum, updated_at) VALUES (1, 0, ?1, ?2)",
            params![checksum, Utc::now().to_rfc3339()],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn fresh_store_has_meta_at_revision_zero() {
        let dir = tempdir().unwrap();
        let store = ControlStore::open(dir.path().join("control.db")).unwrap();
        let meta = store.meta().unwrap();
        assert_eq!(meta.revision, 0);
        store.verify().unwrap();
    }

    #[test]
    fn each_mutation_bumps_revision_by_one_and_checksum_verifies() {
        let dir = tempdir().unwrap();
        let store = ControlStore::open(dir.path().join("control.db")).unwrap();
        let base = store.meta().unwrap().revision;

        let m1 = store.set_auth_state(b"auth-blob").unwrap();
        let m2 = store.set_remote_config(b"config-blob").unwrap();
        let m3 = store.upsert_app("nextcloud", b"{\"v\":1}").unwrap();
        let m4 = store.upsert_app("nextcloud", b"{\"v\":2}").unwrap();

        assert_eq!(m1.revision, base + 1);
        assert_eq!(m2.revision, base + 2);
        assert_eq!(m3.revision, base + 3);
        assert_eq!(m4.revision, base + 4);
        store.verify().unwrap();

        let app = store.app("nextcloud").unwrap().unwrap();
        assert_eq!(app.payload, b"{\"v\":2}");
    }

    #[test]
    fn checksum_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("control.db");
        {
            let store = ControlStore::open(&path).unwrap();
            store.upsert_app("a", b"1").unwrap();
            store.upsert_app("b", b"2").unwrap();
        }
        let store = ControlStore::open(&path).unwrap();
        store.verify().unwrap();
        assert_eq!(store.meta().unwrap().revision, 2);
        assert_eq!(store.list_apps().unwrap().len(), 2);
    }

    #[test]
    fn interrupted_transaction_leaves_store_at_previous_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("control.db");
        let before = {
            let store = ControlStore::open(&path).unwrap();
            store.upsert_app("app-a", b"payload").unwrap();
            store.meta().unwrap()
        };

        // Simulate a crash after the row mutation but before the
        // checksum/revision update: an uncommitted transaction dropped on
        // the floor.
        {
            let mut conn = Connection::open(&path).unwrap();
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .unwrap();
            tx.execute(
                "INSERT INTO apps (name, payload, updated_at) VALUES ('app-b', x'00', '2026-01-01T00:00:00Z')",
                [],
            )
            .unwrap();
            // dropped without commit
        }

        let store = ControlStore::open(&path).unwrap();
        let after = store.meta().unwrap();
        assert_eq!(after.revision, before.revision);
        assert_eq!(after.checksum, before.checksum);
        assert!(store.app("app-b").unwrap().is_none());
        store.verify().unwrap();
    }

    #[test]
    fn concurrent_upserts_commit_with_distinct_increasing_revisions() {
        let dir = tempdir().unwrap();
        let store = Arc::new(ControlStore::open(dir.path().join("control.db")).unwrap());

        let a = {
            let store = store.clone();
            std::thread::spawn(move || store.upsert_app("app-a", b"payload-a").unwrap())
        };
        let b = {
            let store = store.clone();
            std::thread::spawn(move || store.upsert_app("app-b", b"payload-b").unwrap())
        };
        let ma = a.join().unwrap();
        let mb = b.join().unwrap();

        assert_ne!(ma.revision, mb.revision);
        assert_eq!(store.meta().unwrap().revision, 2);
        store.verify().unwrap();
        assert!(store.app("app-a").unwrap().is_some());
        assert!(store.app("app-b").unwrap().is_some());
    }

    #[test]
    fn events_do_not_touch_revision() {
        let dir = tempdir().unwrap();
        let store = ControlStore::open(dir.path().join("control.db")).unwrap();
        store.upsert_app("a", b"1").unwrap();
        let before = store.meta().unwrap();
        store
            .append_event("INTEGRITY_ALERT", serde_json::json!({"volume": "preauth"}))
            .unwrap();
        assert_eq!(store.meta().unwrap(), before);
        let events = store.recent_events(10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "INTEGRITY_ALERT");
        store.verify().unwrap();
    }

    #[test]
    fn out_of_band_row_edit_fails_verification() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("control.db");
        let store = ControlStore::open(&path).unwrap();
        store.upsert_app("app-a", b"payload").unwrap();
        store.verify().unwrap();

        // Edit the row directly, bypassing with_mutation: no checksum
        // recomputation, no revision bump.
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute("UPDATE apps SET payload = x'ff' WHERE name = 'app-a'", [])
                .unwrap();
        }

        match store.verify() {
            Err(Error::IntegrityMismatch { .. }) => {}
            other => panic!("expected IntegrityMismatch, got {other:?}"),
        }
    }

    #[test]
    fn corrupted_timestamp_surfaces_as_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("control.db");
        let store = ControlStore::open(&path).unwrap();
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute(
                "INSERT INTO apps (name, payload, updated_at) VALUES ('bad', x'00', 'garbage')",
                [],
            )
            .unwrap();
        }
        assert!(store.app("bad").is_err());
        assert!(store.list_apps().is_err());
    }

    #[test]
    fn reset_clears_rows_but_keeps_revision_monotonic() {
        let dir = tempdir().unwrap();
        let store = ControlStore::open(dir.path().join("control.db")).unwrap();
        store.set_auth_state(b"x").unwrap();
        store.upsert_app("a", b"1").unwrap();
        let meta = store.reset().unwrap();
        assert_eq!(meta.revision, 3);
        assert!(store.auth_state().unwrap().is_none());
        assert!(store.list_apps().unwrap().is_empty());
        store.verify().unwrap();
    }
}
