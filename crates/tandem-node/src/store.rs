//! The configuration database on this controller.
//!
//! Local writes go through [`SqliteStore::write`], which commits them and
//! posts them to the journal replicator. Writes replayed from the MASTER
//! arrive through [`Datastore::execute`] and are not journaled again.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params};
use tandem_failover::platform::{Datastore, SettingsStore};
use tandem_failover::{HaError, HaResult};
use tandem_journal::JournalQueue;
use tandem_types::{HaConfig, NodeSlot, SqlParam};
use tracing::{debug, info, warn};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS failover_settings (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    disabled INTEGER NOT NULL DEFAULT 0,
    master_node TEXT NOT NULL DEFAULT 'A',
    timeout INTEGER NOT NULL DEFAULT 2
);
INSERT OR IGNORE INTO failover_settings (id) VALUES (1);

CREATE TABLE IF NOT EXISTS system_keyvalue (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS storage_volume (
    vol_name TEXT PRIMARY KEY,
    vol_guid TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS network_interfaces (
    int_interface TEXT PRIMARY KEY,
    int_critical INTEGER NOT NULL DEFAULT 0,
    int_vip TEXT NOT NULL DEFAULT '',
    int_internal INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS services_services (
    srv_service TEXT PRIMARY KEY,
    srv_enable INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS system_kmip (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    enabled INTEGER NOT NULL DEFAULT 0,
    manage_zfs_keys INTEGER NOT NULL DEFAULT 0
);
INSERT OR IGNORE INTO system_kmip (id) VALUES (1);
";

/// A failover interface row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceRow {
    pub name: String,
    pub critical: bool,
    pub vips: Vec<String>,
    pub internal: bool,
}

pub struct SqliteStore {
    path: PathBuf,
    conn: Mutex<Connection>,
    journal: Mutex<Option<JournalQueue>>,
}

fn db_error(err: rusqlite::Error) -> HaError {
    HaError::platform(format_args!("configuration database: {err}"))
}

fn to_value(param: &SqlParam) -> Value {
    match param {
        SqlParam::Null => Value::Null,
        SqlParam::Integer(v) => Value::Integer(*v),
        SqlParam::Real(v) => Value::Real(*v),
        SqlParam::Text(v) => Value::Text(v.clone()),
        SqlParam::Blob(v) => Value::Blob(v.clone()),
    }
}

fn open_connection(path: &Path) -> HaResult<Connection> {
    let conn = Connection::open(path).map_err(db_error)?;
    conn.execute_batch(SCHEMA).map_err(db_error)?;
    Ok(conn)
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path`.
    pub fn open(path: impl Into<PathBuf>) -> HaResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| HaError::platform(format_args!("{}: {e}", parent.display())))?;
        }
        let conn = open_connection(&path)?;
        debug!(path = %path.display(), "configuration database opened");
        Ok(Self {
            path,
            conn: Mutex::new(conn),
            journal: Mutex::new(None),
        })
    }

    /// Connects the replicator; writes before this are not journaled.
    pub fn attach_journal(&self, queue: JournalQueue) {
        let mut journal = self.journal.lock().unwrap_or_else(PoisonError::into_inner);
        if journal.replace(queue).is_some() {
            debug!("journal queue replaced");
        }
    }

    /// Disconnects the replicator. It drains what was queued and stops once
    /// no other producer is left.
    pub fn detach_journal(&self) -> Option<JournalQueue> {
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Commits a local configuration change and queues it for the peer.
    pub fn write(&self, sql: &str, params: Vec<SqlParam>) -> HaResult<()> {
        self.conn()
            .execute(sql, rusqlite::params_from_iter(params.iter().map(to_value)))
            .map_err(db_error)?;
        let queue = self
            .journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match queue {
            Some(queue) => queue.post_execute_write(sql, params)?,
            None => debug!(sql, "journal not attached, write stays local"),
        }
        Ok(())
    }

    /// A `system_keyvalue` entry.
    pub fn value(&self, key: &str) -> HaResult<Option<String>> {
        self.conn()
            .query_row(
                "SELECT value FROM system_keyvalue WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(db_error)
    }

    pub fn set_value(&self, key: &str, value: &str) -> HaResult<()> {
        self.write(
            "INSERT INTO system_keyvalue (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            vec![key.into(), value.into()],
        )
    }

    pub fn pools(&self) -> HaResult<Vec<(String, String)>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT vol_name, vol_guid FROM storage_volume ORDER BY vol_name")
            .map_err(db_error)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(db_error)?;
        rows.collect::<Result<_, _>>().map_err(db_error)
    }

    pub fn interfaces(&self) -> HaResult<Vec<InterfaceRow>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT int_interface, int_critical, int_vip, int_internal \
                 FROM network_interfaces ORDER BY int_interface",
            )
            .map_err(db_error)?;
        let rows = stmt
            .query_map([], |row| {
                let vips: String = row.get(2)?;
                Ok(InterfaceRow {
                    name: row.get(0)?,
                    critical: row.get(1)?,
                    vips: vips
                        .split([',', ' '])
                        .filter(|v| !v.is_empty())
                        .map(str::to_string)
                        .collect(),
                    internal: row.get(3)?,
                })
            })
            .map_err(db_error)?;
        rows.collect::<Result<_, _>>().map_err(db_error)
    }

    pub fn service_enabled(&self, service: &str) -> bool {
        self.conn()
            .query_row(
                "SELECT srv_enable FROM services_services WHERE srv_service = ?1",
                params![service],
                |row| row.get::<_, bool>(0),
            )
            .optional()
            .unwrap_or_else(|e| {
                warn!(service, error = %e, "failed to read service state");
                None
            })
            .unwrap_or(false)
    }

    pub fn kmip_manages_zfs_keys(&self) -> bool {
        self.conn()
            .query_row(
                "SELECT enabled AND manage_zfs_keys FROM system_kmip WHERE id = 1",
                [],
                |row| row.get::<_, bool>(0),
            )
            .unwrap_or(false)
    }
}

impl SettingsStore for SqliteStore {
    fn ha_config(&self) -> HaResult<HaConfig> {
        let (disabled, master, timeout) = self
            .conn()
            .query_row(
                "SELECT disabled, master_node, timeout FROM failover_settings WHERE id = 1",
                [],
                |row| Ok((row.get::<_, bool>(0)?, row.get::<_, String>(1)?, row.get::<_, u32>(2)?)),
            )
            .map_err(db_error)?;
        let master_slot = master
            .parse::<NodeSlot>()
            .map_err(|e| HaError::platform(format_args!("failover_settings.master_node: {e}")))?;
        Ok(HaConfig {
            disabled,
            master_slot,
            timeout_seconds: timeout,
        })
    }

    fn save_ha_config(&self, config: &HaConfig) -> HaResult<()> {
        self.write(
            "UPDATE failover_settings SET disabled = ?1, master_node = ?2, timeout = ?3 WHERE id = 1",
            vec![
                config.disabled.into(),
                config.master_slot.as_char().to_string().into(),
                i64::from(config.timeout_seconds).into(),
            ],
        )
    }

    fn flag(&self, key: &str) -> bool {
        self.value(key)
            .unwrap_or_else(|e| {
                warn!(key, error = %e, "failed to read flag");
                None
            })
            .is_some_and(|value| value == "true")
    }

    fn set_flag(&self, key: &str, value: bool) -> HaResult<()> {
        self.set_value(key, &value.to_string())
    }
}

impl Datastore for SqliteStore {
    fn path(&self) -> PathBuf {
        self.path.clone()
    }

    fn execute(&self, sql: &str, params: &[SqlParam]) -> HaResult<()> {
        self.conn()
            .execute(sql, rusqlite::params_from_iter(params.iter().map(to_value)))
            .map_err(db_error)?;
        Ok(())
    }

    fn install(&self, replacement: &Path) -> HaResult<()> {
        let mut conn = self.conn();
        // Checkpoint and close the old handle before the file is swapped.
        let placeholder = Connection::open_in_memory().map_err(db_error)?;
        let old = std::mem::replace(&mut *conn, placeholder);
        if let Err((_, e)) = old.close() {
            warn!(error = %e, "closing the replaced database failed");
        }
        fs::rename(replacement, &self.path).map_err(|e| {
            HaError::platform(format_args!(
                "install {} as {}: {e}",
                replacement.display(),
                self.path.display()
            ))
        })?;
        *conn = open_connection(&self.path)?;
        info!(path = %self.path.display(), "configuration database replaced");
        Ok(())
    }
}
