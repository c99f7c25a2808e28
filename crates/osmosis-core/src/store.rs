//! File-backed destination stores.
//!
//! The main store and every worker shard are SQLite files with an identical
//! schema. A store has at most one writer at a time: the executor releases
//! the main store's handle while workers run and re-acquires it for the merge.

use crate::value::Value;
use rusqlite::{Connection, OptionalExtension, params};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// One versioned schema change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: u32,
    pub name: String,
    pub sql: String,
}

/// Ordered list of migrations applied to every store of a run.
///
/// The applied version is tracked in SQLite's `user_version`, so reopening an
/// up-to-date store runs nothing.
#[derive(Debug, Clone)]
pub struct Schema {
    migrations: Arc<Vec<Migration>>,
}

const RECORDS_SQL: &str = r#"
CREATE TABLE records (
    kind TEXT NOT NULL,
    key  TEXT NOT NULL,
    data TEXT NOT NULL,
    PRIMARY KEY (kind, key)
) WITHOUT ROWID;
"#;

const LOG_ENTRIES_SQL: &str = r#"
CREATE TABLE log_entries (
    id         INTEGER PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    type       TEXT NOT NULL,
    step       TEXT,
    message    TEXT NOT NULL,
    exception  TEXT,
    details    TEXT,
    item       TEXT
);
CREATE INDEX log_entries_type ON log_entries (type);
"#;

impl Default for Schema {
    fn default() -> Self {
        Self::core()
    }
}

impl Schema {
    /// The engine's own tables: `records` and `log_entries`.
    pub fn core() -> Self {
        Self::empty()
            .with_migration(1, "create_records", RECORDS_SQL)
            .with_migration(2, "create_log_entries", LOG_ENTRIES_SQL)
    }

    /// A schema with no tables at all.
    pub fn empty() -> Self {
        Self {
            migrations: Arc::new(Vec::new()),
        }
    }

    /// Append a migration. Versions must be strictly increasing; this is
    /// checked when the schema is applied.
    pub fn with_migration(
        mut self,
        version: u32,
        name: impl Into<String>,
        sql: impl Into<String>,
    ) -> Self {
        Arc::make_mut(&mut self.migrations).push(Migration {
            version,
            name: name.into(),
            sql: sql.into(),
        });
        self
    }

    fn validate(&self) -> Result<(), StoreError> {
        for pair in self.migrations.windows(2) {
            if pair[1].version <= pair[0].version {
                return Err(StoreError::MigrationOrder {
                    version: pair[1].version,
                    previous: pair[0].version,
                });
            }
        }
        Ok(())
    }

    /// Apply every migration newer than the connection's `user_version`.
    fn apply(&self, conn: &Connection) -> Result<u32, StoreError> {
        self.validate()?;

        let current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        let current = u32::try_from(current).unwrap_or(0);

        let mut applied = current;
        for migration in self.migrations.iter().filter(|m| m.version > current) {
            let tx = conn.unchecked_transaction()?;
            tx.execute_batch(&migration.sql)
                .and_then(|_| {
                    tx.execute_batch(&format!("PRAGMA user_version = {}", migration.version))
                })
                .map_err(|source| StoreError::Migration {
                    version: migration.version,
                    name: migration.name.clone(),
                    source,
                })?;
            tx.commit()?;
            debug!(version = migration.version, name = %migration.name, "applied migration");
            applied = migration.version;
        }
        Ok(applied)
    }
}

/// Severity of a structured log row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogType {
    Info,
    Warning,
    Error,
}

impl LogType {
    pub fn as_str(self) -> &'static str {
        match self {
            LogType::Info => "info",
            LogType::Warning => "warning",
            LogType::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(LogType::Info),
            "warning" => Some(LogType::Warning),
            "error" => Some(LogType::Error),
            _ => None,
        }
    }
}

impl fmt::Display for LogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured log row persisted in `log_entries`.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub kind: LogType,
    pub step: Option<String>,
    pub message: String,
    pub exception: Option<String>,
    pub details: Option<Value>,
    pub item: Option<Value>,
}

impl LogEntry {
    pub fn new(kind: LogType, message: impl Into<String>) -> Self {
        Self {
            kind,
            step: None,
            message: message.into(),
            exception: None,
            details: None,
            item: None,
        }
    }

    pub fn step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    pub fn exception(mut self, exception: impl Into<String>) -> Self {
        self.exception = Some(exception.into());
        self
    }

    pub fn details(mut self, details: impl Into<Value>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn item(mut self, item: impl Into<Value>) -> Self {
        self.item = Some(item.into());
        self
    }
}

/// Errors raised by store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("i/o on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid stored json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("migration {version} ({name}) failed: {source}")]
    Migration {
        version: u32,
        name: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("migration version {version} does not follow {previous}")]
    MigrationOrder { version: u32, previous: u32 },

    #[error("store {} has been released", .0.display())]
    Released(PathBuf),
}

/// A single-writer SQLite store.
pub struct Store {
    path: PathBuf,
    schema: Schema,
    conn: Option<Connection>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("released", &self.conn.is_none())
            .finish()
    }
}

impl Store {
    /// Open (creating if needed) the store at `path` and bring it up to `schema`.
    pub fn open(path: impl Into<PathBuf>, schema: Schema) -> Result<Self, StoreError> {
        let path = path.into();
        let conn = connect(&path)?;
        schema.apply(&conn)?;
        Ok(Self {
            path,
            schema,
            conn: Some(conn),
        })
    }

    /// Create a brand-new store at `path`, discarding any previous file.
    pub fn create_fresh(path: impl Into<PathBuf>, schema: Schema) -> Result<Self, StoreError> {
        let path = path.into();
        remove_store_files(&path)?;
        Self::open(path, schema)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn is_released(&self) -> bool {
        self.conn.is_none()
    }

    /// The live connection, for steps that keep their own tables.
    pub fn connection(&self) -> Result<&Connection, StoreError> {
        self.conn
            .as_ref()
            .ok_or_else(|| StoreError::Released(self.path.clone()))
    }

    /// Close the write handle. The store can be reopened with `reacquire`.
    pub fn release(&mut self) -> Result<(), StoreError> {
        if let Some(conn) = self.conn.take() {
            conn.close().map_err(|(_, e)| StoreError::Sqlite(e))?;
            debug!(path = %self.path.display(), "released store handle");
        }
        Ok(())
    }

    pub fn reacquire(&mut self) -> Result<(), StoreError> {
        if self.conn.is_none() {
            let conn = connect(&self.path)?;
            self.schema.apply(&conn)?;
            self.conn = Some(conn);
            debug!(path = %self.path.display(), "re-acquired store handle");
        }
        Ok(())
    }

    /// Drop cached statements and ask SQLite to free what memory it can.
    pub fn reclaim_memory(&self) -> Result<(), StoreError> {
        let conn = self.connection()?;
        conn.flush_prepared_statement_cache();
        conn.execute_batch("PRAGMA shrink_memory")?;
        Ok(())
    }

    pub fn schema_version(&self) -> Result<u32, StoreError> {
        let version: i64 = self
            .connection()?
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;
        Ok(u32::try_from(version).unwrap_or(0))
    }

    /// Insert or replace the normalized record `(kind, key)`.
    pub fn put_record(&self, kind: &str, key: &str, data: &Value) -> Result<(), StoreError> {
        self.connection()?
            .prepare_cached("INSERT OR REPLACE INTO records (kind, key, data) VALUES (?1, ?2, ?3)")?
            .execute(params![kind, key, data.to_json()])?;
        Ok(())
    }

    pub fn get_record(&self, kind: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let text: Option<String> = self
            .connection()?
            .prepare_cached("SELECT data FROM records WHERE kind = ?1 AND key = ?2")?
            .query_row(params![kind, key], |row| row.get(0))
            .optional()?;
        text.map(|t| Value::from_json(&t).map_err(StoreError::from))
            .transpose()
    }

    pub fn count_records(&self, kind: &str) -> Result<u64, StoreError> {
        let count: i64 = self.connection()?.query_row(
            "SELECT COUNT(*) FROM records WHERE kind = ?1",
            params![kind],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// All keys of one record kind, in key order.
    pub fn record_keys(&self, kind: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare("SELECT key FROM records WHERE kind = ?1 ORDER BY key")?;
        let keys = stmt
            .query_map(params![kind], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    pub fn log(&self, entry: &LogEntry) -> Result<(), StoreError> {
        self.connection()?
            .prepare_cached(
                "INSERT INTO log_entries (type, step, message, exception, details, item)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?
            .execute(params![
                entry.kind.as_str(),
                entry.step,
                entry.message,
                entry.exception,
                entry.details.as_ref().map(Value::to_json),
                entry.item.as_ref().map(Value::to_json),
            ])?;
        Ok(())
    }

    /// Log rows in insertion order, optionally filtered by type.
    pub fn log_entries(&self, kind: Option<LogType>) -> Result<Vec<LogEntry>, StoreError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT type, step, message, exception, details, item FROM log_entries
             WHERE ?1 IS NULL OR type = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![kind.map(LogType::as_str)], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut entries = Vec::with_capacity(rows.len());
        for (kind, step, message, exception, details, item) in rows {
            entries.push(LogEntry {
                kind: LogType::parse(&kind).unwrap_or(LogType::Info),
                step,
                message,
                exception,
                details: details.as_deref().map(Value::from_json).transpose()?,
                item: item.as_deref().map(Value::from_json).transpose()?,
            });
        }
        Ok(entries)
    }

    /// Copy every row of the shard at `shard` into this store, then delete
    /// the shard's files. Returns the number of rows inserted.
    ///
    /// Rows are inserted with `INSERT OR IGNORE`, so natural keys never
    /// duplicate. A table whose only key is an integer rowid alias gets fresh
    /// ids instead of the shard's.
    pub fn merge_shard(&self, shard: &Path) -> Result<u64, StoreError> {
        let conn = self.connection()?;
        conn.execute(
            "ATTACH DATABASE ?1 AS shard",
            params![shard.to_string_lossy().into_owned()],
        )?;

        let copied = copy_attached_tables(conn);
        let detached = conn.execute_batch("DETACH DATABASE shard");
        let copied = copied?;
        detached?;

        remove_store_files(shard)?;
        debug!(shard = %shard.display(), rows = copied, "merged shard");
        Ok(copied)
    }
}

fn connect(path: &Path) -> Result<Connection, StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let conn = Connection::open(path)?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        "#,
    )?;
    Ok(conn)
}

fn copy_attached_tables(conn: &Connection) -> Result<u64, StoreError> {
    let tables: Vec<String> = conn
        .prepare(
            "SELECT name FROM shard.sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?
        .query_map([], |row| row.get(0))?
        .collect::<Result<_, _>>()?;

    let tx = conn.unchecked_transaction()?;
    let mut copied = 0u64;
    for table in &tables {
        let columns = mergeable_columns(&tx, table)?;
        if columns.is_empty() {
            continue;
        }
        let list = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT OR IGNORE INTO main.{table} ({list}) SELECT {list} FROM shard.{table}",
            table = quote_ident(table),
        );
        copied += tx.execute(&sql, [])? as u64;
    }
    tx.commit()?;
    Ok(copied)
}

/// Columns of a shard table to copy. A lone `INTEGER` primary key is a rowid
/// alias and is left for the target to assign.
fn mergeable_columns(conn: &Connection, table: &str) -> Result<Vec<String>, StoreError> {
    let mut stmt = conn.prepare(&format!("PRAGMA shard.table_info({})", quote_ident(table)))?;
    let columns = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let key_columns: Vec<_> = columns.iter().filter(|(_, _, pk)| *pk > 0).collect();
    let rowid_alias = match key_columns.as_slice() {
        [(name, ty, _)] if ty.eq_ignore_ascii_case("INTEGER") => Some(name.clone()),
        _ => None,
    };

    Ok(columns
        .into_iter()
        .map(|(name, _, _)| name)
        .filter(|name| Some(name) != rowid_alias.as_ref())
        .collect())
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Delete a store file and its WAL companions. Missing files are fine.
pub fn remove_store_files(path: &Path) -> Result<(), StoreError> {
    let mut candidates = vec![path.to_path_buf()];
    for suffix in ["-wal", "-shm"] {
        let mut name = path.as_os_str().to_owned();
        name.push(suffix);
        candidates.push(PathBuf::from(name));
    }

    for candidate in candidates {
        match std::fs::remove_file(&candidate) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(StoreError::Io {
                    path: candidate,
                    source,
                });
            }
        }
    }
    Ok(())
}
