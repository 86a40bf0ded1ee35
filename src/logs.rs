// --- CMS log forwarding ---------------------------------------------------
//
// `CmsLogLayer` picks WARN/ERROR events (and anything tagged with a
// `category` field) out of the tracing stream and hands them to a writer
// task, which stores them in the `logs` table. The session drains that table
// with `SubmitLog`.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use rusqlite::{params, params_from_iter, Row};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::clock::{format_cms_date, Clock};
use crate::db::Db;
use crate::xmds::envelope::escape;

/// Events from this module are never forwarded, so a failing writer cannot
/// feed itself.
const SELF_TARGET: &str = module_path!();

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub id: i64,
    pub uid: String,
    pub date: String,
    /// `error`, `audit` or `event`.
    pub category: String,
    pub message: String,
    pub method: Option<String>,
    pub schedule_id: Option<i64>,
    pub layout_id: Option<i64>,
    pub media_id: Option<String>,
    pub event_type: Option<String>,
    pub alert_type: Option<String>,
    pub ref_id: Option<i64>,
}

impl LogEntry {
    pub fn new(category: impl Into<String>, message: impl Into<String>, date: String) -> Self {
        Self {
            id: 0,
            uid: uuid::Uuid::new_v4().to_string(),
            date,
            category: category.into(),
            message: message.into(),
            method: None,
            schedule_id: None,
            layout_id: None,
            media_id: None,
            event_type: None,
            alert_type: None,
            ref_id: None,
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            uid: row.get("uid")?,
            date: row.get("date")?,
            category: row.get("category")?,
            message: row.get("message")?,
            method: row.get("method")?,
            schedule_id: row.get("schedule_id")?,
            layout_id: row.get("layout_id")?,
            media_id: row.get("media_id")?,
            event_type: row.get("event_type")?,
            alert_type: row.get("alert_type")?,
            ref_id: row.get("ref_id")?,
        })
    }
}

/// Which categories the CMS wants, from its `logLevel` setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevelFilter {
    /// Only `event` entries.
    Off,
    /// `error` and `event` entries.
    Error,
    All,
}

impl LogLevelFilter {
    pub fn from_setting(level: &str) -> Self {
        match level.trim().to_ascii_lowercase().as_str() {
            "off" => LogLevelFilter::Off,
            "error" => LogLevelFilter::Error,
            _ => LogLevelFilter::All,
        }
    }
}

// --- Store ----------------------------------------------------------------

#[derive(Clone)]
pub struct LogStore {
    db: Db,
}

impl LogStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn insert(&self, entry: LogEntry) -> Result<()> {
        self.insert_many(vec![entry]).await
    }

    pub async fn insert_many(&self, entries: Vec<LogEntry>) -> Result<()> {
        self.db
            .run(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO logs (uid, date, category, message, method, schedule_id, layout_id,
                                           media_id, event_type, alert_type, ref_id)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    )?;
                    for e in &entries {
                        stmt.execute(params![
                            e.uid,
                            e.date,
                            e.category,
                            e.message,
                            e.method,
                            e.schedule_id,
                            e.layout_id,
                            e.media_id,
                            e.event_type,
                            e.alert_type,
                            e.ref_id
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await
    }

    pub async fn count(&self) -> Result<usize> {
        self.db
            .run(|conn| {
                let n: i64 = conn.query_row("SELECT COUNT(*) FROM logs", [], |r| r.get(0))?;
                Ok(n.max(0) as usize)
            })
            .await
    }

    /// Oldest `limit` entries the filter lets through.
    pub async fn fetch(&self, filter: LogLevelFilter, limit: usize) -> Result<Vec<LogEntry>> {
        let limit = limit.max(1) as i64;
        self.db
            .run(move |conn| {
                let clause = match filter {
                    LogLevelFilter::Off => "WHERE category = 'event'",
                    LogLevelFilter::Error => "WHERE category IN ('error', 'event')",
                    LogLevelFilter::All => "",
                };
                let mut stmt = conn.prepare(&format!(
                    "SELECT id, uid, date, category, message, method, schedule_id, layout_id,
                            media_id, event_type, alert_type, ref_id
                     FROM logs {clause} ORDER BY id LIMIT ?1"
                ))?;
                let rows = stmt.query_map(params![limit], LogEntry::from_row)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await
    }

    /// Drop entries the filter would never submit.
    pub async fn discard_filtered(&self, filter: LogLevelFilter) -> Result<usize> {
        let clause = match filter {
            LogLevelFilter::Off => "category <> 'event'",
            LogLevelFilter::Error => "category NOT IN ('error', 'event')",
            LogLevelFilter::All => return Ok(0),
        };
        self.db
            .run(move |conn| Ok(conn.execute(&format!("DELETE FROM logs WHERE {clause}"), [])?))
            .await
    }

    pub async fn delete(&self, ids: Vec<i64>) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.db
            .run(move |conn| {
                let placeholders = vec!["?"; ids.len()].join(", ");
                Ok(conn.execute(
                    &format!("DELETE FROM logs WHERE id IN ({placeholders})"),
                    params_from_iter(ids.iter()),
                )?)
            })
            .await
    }
}

/// `<logs>` document for `SubmitLog`.
pub fn logs_xml(entries: &[LogEntry]) -> String {
    let mut xml = String::from("<logs>");
    for e in entries {
        xml.push_str(&format!(
            r#"<log date="{}" category="{}"><message>{}</message>"#,
            escape(&e.date),
            escape(&e.category),
            escape(&e.message)
        ));
        let mut opt = |tag: &str, value: Option<String>| {
            if let Some(v) = value.filter(|v| !v.is_empty()) {
                xml.push_str(&format!("<{tag}>{}</{tag}>", escape(&v)));
            }
        };
        opt("method", e.method.clone());
        opt("scheduleId", e.schedule_id.map(|v| v.to_string()));
        opt("layoutId", e.layout_id.map(|v| v.to_string()));
        opt("mediaId", e.media_id.clone());
        opt("eventType", e.event_type.clone());
        opt("alertType", e.alert_type.clone());
        opt("refId", e.ref_id.map(|v| v.to_string()));
        xml.push_str("</log>");
    }
    xml.push_str("</logs>");
    xml
}

// --- tracing layer ----------------------------------------------------------

#[derive(Default)]
struct EntryVisitor {
    message: String,
    category: Option<String>,
    method: Option<String>,
    schedule_id: Option<i64>,
    layout_id: Option<i64>,
    media_id: Option<String>,
    event_type: Option<String>,
    alert_type: Option<String>,
    ref_id: Option<i64>,
    extra: Vec<String>,
}

impl EntryVisitor {
    fn set_str(&mut self, name: &str, value: String) {
        match name {
            "message" => self.message = value,
            "category" => self.category = Some(value),
            "method" => self.method = Some(value),
            "media_id" => self.media_id = Some(value),
            "event_type" => self.event_type = Some(value),
            "alert_type" => self.alert_type = Some(value),
            _ => self.extra.push(format!("{name}={value}")),
        }
    }

    fn set_int(&mut self, name: &str, value: i64) {
        match name {
            "schedule_id" => self.schedule_id = Some(value),
            "layout_id" => self.layout_id = Some(value),
            "ref_id" => self.ref_id = Some(value),
            "media_id" => self.media_id = Some(value.to_string()),
            _ => self.extra.push(format!("{name}={value}")),
        }
    }
}

impl Visit for EntryVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.set_str(field.name(), value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.set_int(field.name(), value);
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.set_int(field.name(), value.min(i64::MAX as u64) as i64);
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.set_str(field.name(), format!("{value:?}"));
    }
}

/// Forwards CMS-relevant tracing events to the log writer.
pub struct CmsLogLayer {
    tx: mpsc::UnboundedSender<LogEntry>,
    clock: Arc<dyn Clock>,
}

impl CmsLogLayer {
    pub fn new(clock: Arc<dyn Clock>) -> (Self, mpsc::UnboundedReceiver<LogEntry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, clock }, rx)
    }
}

impl<S: Subscriber> Layer<S> for CmsLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if meta.target().starts_with(SELF_TARGET) {
            return;
        }

        let mut visitor = EntryVisitor::default();
        event.record(&mut visitor);

        let category = match (visitor.category.take(), *meta.level()) {
            (Some(c), _) => c,
            (None, Level::ERROR) => "error".to_string(),
            (None, Level::WARN) => "audit".to_string(),
            (None, _) => return,
        };

        let mut message = visitor.message;
        if !visitor.extra.is_empty() {
            message = format!("{message} {}", visitor.extra.join(" "));
        }

        let mut entry = LogEntry::new(category, message, format_cms_date(self.clock.now()));
        entry.method = visitor.method.or_else(|| Some(meta.target().to_string()));
        entry.schedule_id = visitor.schedule_id;
        entry.layout_id = visitor.layout_id;
        entry.media_id = visitor.media_id;
        entry.event_type = visitor.event_type;
        entry.alert_type = visitor.alert_type;
        entry.ref_id = visitor.ref_id;

        // Receiver gone means we are shutting down.
        let _ = self.tx.send(entry);
    }
}

/// Persist forwarded entries until cancelled, then flush what is queued.
pub async fn run_writer(
    mut rx: mpsc::UnboundedReceiver<LogEntry>,
    store: LogStore,
    cancel: CancellationToken,
) {
    loop {
        let first = tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(e) => e,
                None => return,
            },
        };

        let mut batch = vec![first];
        while let Ok(e) = rx.try_recv() {
            batch.push(e);
        }
        if let Err(e) = store.insert_many(batch).await {
            tracing::debug!("failed to store log entries: {e:#}");
        }
    }

    let mut rest = Vec::new();
    while let Ok(e) = rx.try_recv() {
        rest.push(e);
    }
    if !rest.is_empty() {
        if let Err(e) = store.insert_many(rest).await {
            tracing::debug!("failed to flush log entries: {e:#}");
        }
    }
}
