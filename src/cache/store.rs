// `files` table access. Plain functions over a connection; the cache calls
// them through `Db::run`.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

/// Outcome recorded for a library file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Success,
    Failed,
    Skipped,
    Updated,
}

impl FileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FileStatus::Success => "success",
            FileStatus::Failed => "failed",
            FileStatus::Skipped => "skipped",
            FileStatus::Updated => "updated",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "success" => FileStatus::Success,
            "skipped" => FileStatus::Skipped,
            "updated" => FileStatus::Updated,
            _ => FileStatus::Failed,
        }
    }

    /// The file on disk is complete and usable.
    pub fn is_available(self) -> bool {
        matches!(self, FileStatus::Success | FileStatus::Updated)
    }
}

/// One row of the `files` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalFile {
    pub name: String,
    pub url: String,
    pub local_path: String,
    pub size: u64,
    pub status: FileStatus,
    pub file_id: String,
    pub file_type: String,
    pub sub_type: String,
    pub hash: String,
    pub last_downloaded: String,
}

impl LocalFile {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status: String = row.get("status")?;
        let size: i64 = row.get("size")?;
        Ok(Self {
            name: row.get("name")?,
            url: row.get("url")?,
            local_path: row.get("local_path")?,
            size: size.max(0) as u64,
            status: FileStatus::parse(&status),
            file_id: row.get("file_id")?,
            file_type: row.get("type")?,
            sub_type: row.get("file_type")?,
            hash: row.get("hash")?,
            last_downloaded: row.get("last_downloaded")?,
        })
    }
}

const COLUMNS: &str =
    "name, url, local_path, size, status, file_id, type, file_type, hash, last_downloaded";

pub fn get_by_name(conn: &Connection, name: &str) -> rusqlite::Result<Option<LocalFile>> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM files WHERE name = ?1"),
        params![name],
        LocalFile::from_row,
    )
    .optional()
}

/// Newest available record for `(file_id, type)`.
pub fn get_by_file(
    conn: &Connection,
    file_id: &str,
    file_type: &str,
) -> rusqlite::Result<Option<LocalFile>> {
    conn.query_row(
        &format!(
            "SELECT {COLUMNS} FROM files
             WHERE file_id = ?1 AND type = ?2 AND status IN ('success', 'updated')
             ORDER BY last_downloaded DESC, id DESC
             LIMIT 1"
        ),
        params![file_id, file_type],
        LocalFile::from_row,
    )
    .optional()
}

pub fn upsert(conn: &Connection, f: &LocalFile) -> rusqlite::Result<()> {
    conn.execute(
        r#"
        INSERT INTO files (name, url, local_path, size, status, file_id, type, file_type, hash, last_downloaded)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, CURRENT_TIMESTAMP)
        ON CONFLICT(name) DO UPDATE SET
            url = excluded.url,
            local_path = excluded.local_path,
            size = excluded.size,
            status = excluded.status,
            file_id = excluded.file_id,
            type = excluded.type,
            file_type = excluded.file_type,
            hash = excluded.hash,
            last_downloaded = CURRENT_TIMESTAMP
        "#,
        params![
            f.name,
            f.url,
            f.local_path,
            f.size as i64,
            f.status.as_str(),
            f.file_id,
            f.file_type,
            f.sub_type,
            f.hash,
        ],
    )?;
    Ok(())
}

pub fn list(conn: &Connection) -> rusqlite::Result<Vec<LocalFile>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM files ORDER BY last_downloaded DESC, id DESC"
    ))?;
    let rows = stmt.query_map([], LocalFile::from_row)?;
    rows.collect()
}

pub fn delete_by_name(conn: &Connection, name: &str) -> rusqlite::Result<usize> {
    conn.execute("DELETE FROM files WHERE name = ?1", params![name])
}
