// --- Proof of play --------------------------------------------------------
//
// A stat is opened when something starts playing (duration 0, no todt) and
// closed when it stops. Closed stats wait in the `stats` table until the CMS
// accepts them, then they are deleted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rusqlite::{params, params_from_iter, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{format_cms_date, parse_cms_date, Clock};
use crate::db::Db;
use crate::xmds::envelope::escape;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatType {
    Layout,
    Media,
    Widget,
    Event,
}

impl StatType {
    pub fn as_str(self) -> &'static str {
        match self {
            StatType::Layout => "layout",
            StatType::Media => "media",
            StatType::Widget => "widget",
            StatType::Event => "event",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "media" => StatType::Media,
            "widget" => StatType::Widget,
            "event" => StatType::Event,
            _ => StatType::Layout,
        }
    }
}

/// Identity of a play. At most one open stat exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatKey {
    pub schedule_id: i64,
    pub layout_id: i64,
    #[serde(default)]
    pub media_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: StatType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlayStat {
    pub id: i64,
    pub key: StatKey,
    pub fromdt: String,
    pub todt: Option<String>,
    pub count: i64,
    /// Seconds between `fromdt` and `todt`.
    pub duration: i64,
    pub tag: Option<String>,
}

impl PlayStat {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let kind: String = row.get("type")?;
        Ok(Self {
            id: row.get("id")?,
            key: StatKey {
                schedule_id: row.get("schedule_id")?,
                layout_id: row.get("layout_id")?,
                media_id: row.get("media_id")?,
                kind: StatType::parse(&kind),
            },
            fromdt: row.get("fromdt")?,
            todt: row.get("todt")?,
            count: row.get("count")?,
            duration: row.get("duration")?,
            tag: row.get("tag")?,
        })
    }

    pub fn is_open(&self) -> bool {
        self.todt.is_none()
    }
}

const COLUMNS: &str = "id, schedule_id, layout_id, media_id, type, fromdt, todt, count, duration, tag";

#[derive(Clone)]
pub struct StatsStore {
    db: Db,
    clock: Arc<dyn Clock>,
}

impl StatsStore {
    pub fn new(db: Db, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Start a play. If one is already open for `key` its id is returned and
    /// nothing is written.
    pub async fn open_stat(&self, key: StatKey, tag: Option<String>) -> Result<i64> {
        let fromdt = format_cms_date(self.clock.now());
        self.db
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let existing: Option<i64> = tx
                    .query_row(
                        "SELECT id FROM stats
                         WHERE schedule_id = ?1 AND layout_id = ?2 AND IFNULL(media_id, '') = IFNULL(?3, '') AND type = ?4
                           AND todt IS NULL
                         LIMIT 1",
                        params![key.schedule_id, key.layout_id, key.media_id, key.kind.as_str()],
                        |r| r.get(0),
                    )
                    .optional()?;

                let id = match existing {
                    Some(id) => id,
                    None => {
                        tx.execute(
                            "INSERT INTO stats (schedule_id, layout_id, media_id, type, fromdt, todt, count, duration, tag)
                             VALUES (?1, ?2, ?3, ?4, ?5, NULL, 1, 0, ?6)",
                            params![
                                key.schedule_id,
                                key.layout_id,
                                key.media_id,
                                key.kind.as_str(),
                                fromdt,
                                tag
                            ],
                        )?;
                        tx.last_insert_rowid()
                    }
                };
                tx.commit()?;
                Ok(id)
            })
            .await
    }

    /// Finish the open play for `key`. Returns the closed record, or `None`
    /// when nothing was open.
    pub async fn close_stat(&self, key: StatKey) -> Result<Option<PlayStat>> {
        let now = self.clock.now();
        let todt = format_cms_date(now);
        self.db
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let open = tx
                    .query_row(
                        &format!(
                            "SELECT {COLUMNS} FROM stats
                             WHERE schedule_id = ?1 AND layout_id = ?2 AND IFNULL(media_id, '') = IFNULL(?3, '') AND type = ?4
                               AND todt IS NULL
                             ORDER BY id LIMIT 1"
                        ),
                        params![key.schedule_id, key.layout_id, key.media_id, key.kind.as_str()],
                        PlayStat::from_row,
                    )
                    .optional()?;

                let Some(mut stat) = open else {
                    return Ok(None);
                };

                let duration = parse_cms_date(&stat.fromdt)
                    .map(|from| (now - from).whole_seconds().max(0))
                    .unwrap_or(0);

                tx.execute(
                    "UPDATE stats SET todt = ?1, duration = ?2 WHERE id = ?3",
                    params![todt, duration, stat.id],
                )?;
                tx.commit()?;
                stat.todt = Some(todt);
                stat.duration = duration;
                Ok(Some(stat))
            })
            .await
    }

    /// Closed stats ready to report, oldest first.
    pub async fn pending(&self, limit: usize) -> Result<Vec<PlayStat>> {
        let limit = limit.max(1) as i64;
        self.db
            .run(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLUMNS} FROM stats WHERE todt IS NOT NULL ORDER BY id LIMIT ?1"
                ))?;
                let rows = stmt.query_map(params![limit], PlayStat::from_row)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await
    }

    pub async fn delete(&self, ids: Vec<i64>) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.db
            .run(move |conn| {
                let placeholders = vec!["?"; ids.len()].join(", ");
                let n = conn.execute(
                    &format!("DELETE FROM stats WHERE id IN ({placeholders})"),
                    params_from_iter(ids.iter()),
                )?;
                Ok(n)
            })
            .await
    }

    pub async fn clear(&self) -> Result<()> {
        self.db
            .run(|conn| {
                conn.execute("DELETE FROM stats", [])?;
                Ok(())
            })
            .await
    }

    /// Drop stats that were opened more than `max_age_secs` ago and never closed.
    pub async fn cleanup_stale(&self, max_age_secs: i64) -> Result<usize> {
        let cutoff = format_cms_date(self.clock.now() - time::Duration::seconds(max_age_secs));
        self.db
            .run(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM stats WHERE todt IS NULL AND fromdt < ?1",
                    params![cutoff],
                )?)
            })
            .await
    }

    /// Periodic stale-stat cleanup until cancelled.
    pub async fn run_cleanup(self, interval: Duration, max_age_secs: i64, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    match self.cleanup_stale(max_age_secs).await {
                        Ok(0) => {}
                        Ok(n) => info!(removed = n, "dropped abandoned open stats"),
                        Err(e) => warn!("stats cleanup failed: {e:#}"),
                    }
                }
            }
        }
        debug!("stats cleanup loop stopped");
    }
}

/// `<records>` document for `SubmitStats`.
pub fn records_xml(stats: &[PlayStat]) -> String {
    let mut xml = String::from("<records>");
    for s in stats {
        xml.push_str(&format!(
            r#"<stat fromdt="{}" todt="{}" type="{}" scheduleid="{}" layoutid="{}" mediaid="{}" count="{}" duration="{}""#,
            escape(&s.fromdt),
            escape(s.todt.as_deref().unwrap_or("")),
            s.key.kind.as_str(),
            s.key.schedule_id,
            s.key.layout_id,
            escape(s.key.media_id.as_deref().unwrap_or("")),
            s.count,
            s.duration,
        ));
        if let Some(tag) = s.tag.as_deref().filter(|t| !t.is_empty()) {
            xml.push_str(&format!(r#" tag="{}""#, escape(tag)));
        }
        xml.push_str("/>");
    }
    xml.push_str("</records>");
    xml
}
