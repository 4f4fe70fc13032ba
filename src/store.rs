//! Persistent host state backed by SQLite.
//!
//! Two concerns live here: the enabled/disabled flag per plugin (which must
//! survive restarts and re-discovery), and the per-plugin key/value config
//! that plugins read and write through the host SDK. Values are stored as
//! JSON text so plugins can keep structured settings.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;

/// Database file name inside the data directory
const STORE_DB_NAME: &str = "medley.db";

/// Current schema version - increment when adding migrations
const SCHEMA_VERSION: i64 = 1;

/// One plugin's persisted row.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginRow {
    pub id: String,
    pub name: String,
    pub description: String,
    pub version: String,
    pub capabilities: Vec<String>,
    pub enabled: bool,
    pub first_seen_at: String,
    pub updated_at: String,
}

/// Host state database handle.
///
/// `rusqlite::Connection` is not `Sync`, so the handle serializes access
/// through a mutex; every operation is a single short statement.
pub struct Store {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl Store {
    /// Open or create the database at the specified path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data directory at {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;

        let store = Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Open or create the database inside a data directory.
    pub fn open_in_dir(data_dir: &Path) -> Result<Self> {
        Self::open(&data_dir.join(STORE_DB_NAME))
    }

    /// Get the database path
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("Database lock poisoned"))
    }

    /// Ensure database schema exists and run migrations
    fn ensure_schema(&self) -> Result<()> {
        let conn = self.conn()?;

        // Create version tracking table first
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;

        // Get current version (0 if table is empty = new db)
        let current_version: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            tracing::info!(
                "Migrating database from version {} to {}",
                current_version,
                SCHEMA_VERSION
            );
            Self::run_migrations(&conn, current_version)?;
        }

        Ok(())
    }

    /// Run all migrations from current_version to SCHEMA_VERSION
    fn run_migrations(conn: &Connection, from_version: i64) -> Result<()> {
        if from_version < 1 {
            Self::migrate_v1(conn)?;
        }

        // Record current version
        conn.execute(
            "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
            params![SCHEMA_VERSION],
        )?;
        Ok(())
    }

    /// Migration v1: plugin registry and per-plugin config
    fn migrate_v1(conn: &Connection) -> Result<()> {
        tracing::debug!("Running migration v1: plugin tables");
        conn.execute_batch(
            r#"
            -- Known plugins and their enabled flag. Rows persist even when
            -- the plugin directory disappears, so a re-installed plugin
            -- keeps its previous enabled state. Name/version/capabilities
            -- are refreshed from the running plugin's metadata on load.
            CREATE TABLE IF NOT EXISTS plugins (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                version TEXT NOT NULL DEFAULT '',
                capabilities TEXT NOT NULL DEFAULT '[]',
                enabled INTEGER NOT NULL DEFAULT 1,
                first_seen_at TEXT DEFAULT (datetime('now')),
                updated_at TEXT DEFAULT (datetime('now'))
            );

            -- Per-plugin key/value settings written through the host SDK.
            -- Values are JSON text.
            CREATE TABLE IF NOT EXISTS plugin_config (
                plugin_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT DEFAULT (datetime('now')),
                PRIMARY KEY (plugin_id, key)
            );
            "#,
        )
        .context("Failed to create v1 schema")?;

        Ok(())
    }

    // === Plugin Registry Operations ===

    /// Record a discovered plugin, preserving its enabled flag if the row
    /// already exists. New plugins start enabled. Returns the effective flag.
    pub fn record_plugin(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO plugins (id) VALUES (?1)
             ON CONFLICT(id) DO UPDATE SET updated_at = datetime('now')",
            params![id],
        )?;
        let enabled: i64 =
            conn.query_row("SELECT enabled FROM plugins WHERE id = ?1", params![id], |row| {
                row.get(0)
            })?;
        Ok(enabled != 0)
    }

    /// Refresh a plugin's descriptive fields from its live metadata.
    pub fn update_plugin_details(
        &self,
        id: &str,
        name: &str,
        description: &str,
        version: &str,
        capabilities: &[String],
    ) -> Result<()> {
        let caps = serde_json::to_string(capabilities)?;
        let conn = self.conn()?;
        conn.execute(
            "UPDATE plugins
             SET name = ?2, description = ?3, version = ?4, capabilities = ?5,
                 updated_at = datetime('now')
             WHERE id = ?1",
            params![id, name, description, version, caps],
        )?;
        Ok(())
    }

    /// Flip a plugin's enabled flag. The row is created if missing so the
    /// choice sticks even before the plugin is first loaded.
    pub fn set_plugin_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO plugins (id, enabled) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET enabled = ?2, updated_at = datetime('now')",
            params![id, enabled as i64],
        )?;
        Ok(())
    }

    /// Look up a plugin's persisted enabled flag.
    pub fn plugin_enabled(&self, id: &str) -> Result<Option<bool>> {
        let conn = self.conn()?;
        let enabled: Option<i64> = conn
            .query_row("SELECT enabled FROM plugins WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(enabled.map(|v| v != 0))
    }

    /// List every plugin the host has ever seen, ordered by id.
    pub fn list_plugins(&self) -> Result<Vec<PluginRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, description, version, capabilities, enabled,
                    first_seen_at, updated_at
             FROM plugins ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let caps: String = row.get(4)?;
                Ok(PluginRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    description: row.get(2)?,
                    version: row.get(3)?,
                    capabilities: serde_json::from_str(&caps).unwrap_or_default(),
                    enabled: row.get::<_, i64>(5)? != 0,
                    first_seen_at: row.get(6)?,
                    updated_at: row.get(7)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // === Plugin Config Operations (host SDK backing) ===

    /// Read one config value for a plugin.
    pub fn config_get(&self, plugin_id: &str, key: &str) -> Result<Option<Value>> {
        let conn = self.conn()?;
        let text: Option<String> = conn
            .query_row(
                "SELECT value FROM plugin_config WHERE plugin_id = ?1 AND key = ?2",
                params![plugin_id, key],
                |row| row.get(0),
            )
            .optional()?;
        match text {
            Some(text) => {
                let value = serde_json::from_str(&text).with_context(|| {
                    format!("Corrupt config value for {}/{}", plugin_id, key)
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Write one config value for a plugin.
    pub fn config_set(&self, plugin_id: &str, key: &str, value: &Value) -> Result<()> {
        let text = serde_json::to_string(value)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO plugin_config (plugin_id, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(plugin_id, key) DO UPDATE SET value = ?3, updated_at = datetime('now')",
            params![plugin_id, key, text],
        )?;
        Ok(())
    }

    /// Delete one config value. Returns whether a row existed.
    pub fn config_delete(&self, plugin_id: &str, key: &str) -> Result<bool> {
        let conn = self.conn()?;
        let affected = conn.execute(
            "DELETE FROM plugin_config WHERE plugin_id = ?1 AND key = ?2",
            params![plugin_id, key],
        )?;
        Ok(affected > 0)
    }
}
