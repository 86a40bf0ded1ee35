// --- Persistence (SQLite) -------------------------------------------------
//
// One database file holds three record sets:
//   - files: the content cache index, keyed by unique file name
//   - stats: proof-of-play records waiting to be reported
//   - logs:  log lines waiting to be submitted to the CMS
//
// rusqlite is synchronous, so every operation opens a connection inside
// `spawn_blocking`. The schema is created once, in `Db::open`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use rusqlite::Connection;

/// How long a connection waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct Db {
    path: PathBuf,
}

fn connect(path: &Path) -> anyhow::Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open sqlite db {}", path.display()))?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(conn)
}

fn db_init(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;

        CREATE TABLE IF NOT EXISTS files (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            name           TEXT NOT NULL UNIQUE,
            url            TEXT NOT NULL,
            local_path     TEXT NOT NULL,
            size           INTEGER NOT NULL,
            status         TEXT NOT NULL,
            file_id        TEXT NOT NULL,
            type           TEXT NOT NULL,
            file_type      TEXT NOT NULL,
            hash           TEXT NOT NULL,
            last_downloaded TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        CREATE INDEX IF NOT EXISTS idx_files_file_id_type ON files(file_id, type);

        CREATE TABLE IF NOT EXISTS stats (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            schedule_id INTEGER NOT NULL,
            layout_id   INTEGER NOT NULL,
            media_id    TEXT,
            type        TEXT NOT NULL,
            fromdt      TEXT NOT NULL,
            todt        TEXT,
            count       INTEGER NOT NULL,
            duration    INTEGER NOT NULL,
            tag         TEXT
        );

        DROP INDEX IF EXISTS idx_stats_open;

        -- At most one open stat per play key.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_stats_open_key
            ON stats(schedule_id, layout_id, IFNULL(media_id, ''), type)
            WHERE todt IS NULL;

        CREATE TABLE IF NOT EXISTS logs (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            uid         TEXT NOT NULL,
            date        TEXT NOT NULL,
            category    TEXT NOT NULL,
            message     TEXT NOT NULL,
            method      TEXT,
            schedule_id INTEGER,
            layout_id   INTEGER,
            media_id    TEXT,
            event_type  TEXT,
            alert_type  TEXT,
            ref_id      INTEGER
        );
        "#,
    )
}

impl Db {
    /// Open (and create if needed) the database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let db = Self { path: path.as_ref().to_path_buf() };
        if let Some(parent) = db.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("failed to create db dir {}", parent.display()))?;
            }
        }
        let path = db.path.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let conn = connect(&path)?;
            db_init(&conn).with_context(|| format!("failed to initialise {}", path.display()))?;
            Ok(())
        })
        .await
        .map_err(|e| anyhow::anyhow!("sqlite task join failed: {e}"))??;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against a fresh connection on the blocking pool.
    pub async fn run<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<T> {
            let mut conn = connect(&path)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| anyhow::anyhow!("sqlite task join failed: {e}"))?
    }
}
