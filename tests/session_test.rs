// Collection cycles against a scripted CMS.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use time::macros::datetime;
use tokio::sync::broadcast::error::TryRecvError;
use tokio_util::sync::CancellationToken;

use signage_engine::cache::{ContentCache, FileSource, Fetcher};
use signage_engine::clock::ManualClock;
use signage_engine::db::Db;
use signage_engine::error::{XmdsError, NOT_AUTHORISED_MSG};
use signage_engine::logs::{LogEntry, LogStore};
use signage_engine::player::Player;
use signage_engine::schedule::{EngineOptions, Predicates, ScheduleEngine};
use signage_engine::session::{SessionClient, SessionEvent, SessionOptions};
use signage_engine::stats::StatsStore;
use signage_engine::xmds::envelope::escape;
use signage_engine::xmds::{DisplayStatus, XmdsClient, XmdsIdentity, XmdsMethod, XmdsTransport};

fn response(method: XmdsMethod, field: &str, inner: &str) -> String {
    format!(
        "<Envelope><Body><{el}><{field}>{}</{field}></{el}></Body></Envelope>",
        escape(inner),
        el = method.response_element()
    )
}

fn display(status: i64, check_rf: &str, check_schedule: &str) -> String {
    format!(
        r#"<display status="{status}" code="X" message="m" checkRf="{check_rf}" checkSchedule="{check_schedule}"><collectInterval>900</collectInterval><statsEnabled>1</statsEnabled></display>"#
    )
}

fn default_layout_schedule(file: i64) -> String {
    format!(r#"<schedule><default file="{file}" duration="30"/></schedule>"#)
}

struct ScriptedCms {
    display: Mutex<String>,
    schedule: Mutex<String>,
    unauthorised: Mutex<bool>,
    calls: Mutex<Vec<XmdsMethod>>,
}

impl ScriptedCms {
    fn new(display: String) -> Self {
        Self {
            display: Mutex::new(display),
            schedule: Mutex::new(default_layout_schedule(7)),
            unauthorised: Mutex::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn take_calls(&self) -> Vec<XmdsMethod> {
        std::mem::take(&mut *self.calls.lock())
    }
}

#[async_trait]
impl XmdsTransport for ScriptedCms {
    async fn post(&self, method: XmdsMethod, _body: String) -> Result<String, XmdsError> {
        self.calls.lock().push(method);
        if *self.unauthorised.lock() {
            return Err(XmdsError::from_fault("Sender", NOT_AUTHORISED_MSG));
        }
        let body = match method {
            XmdsMethod::RegisterDisplay => {
                response(method, "ActivationMessage", &self.display.lock())
            }
            XmdsMethod::RequiredFiles => response(
                method,
                "RequiredFilesXml",
                r#"<files><file type="layout" id="7" md5="x" download="http" path="https://cms/7.xlf"/></files>"#,
            ),
            XmdsMethod::Schedule => response(method, "ScheduleXml", &self.schedule.lock()),
            _ => response(method, "success", "true"),
        };
        Ok(body)
    }
}

struct Harness {
    dir: tempfile::TempDir,
    db: Db,
    cms: Arc<ScriptedCms>,
    xmds: XmdsClient,
    engine: Arc<ScheduleEngine>,
    logs: LogStore,
    session: Arc<SessionClient>,
}

async fn harness(display_xml: String) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(datetime!(2025-01-15 10:00:00)));
    let db = Db::open(dir.path().join("engine.db")).await.unwrap();
    let logs = LogStore::new(db.clone());
    let stats = StatsStore::new(db.clone(), clock.clone());
    let engine = Arc::new(ScheduleEngine::new(clock.clone(), EngineOptions::default(), Predicates::default()));

    let cms = Arc::new(ScriptedCms::new(display_xml));
    let identity = XmdsIdentity {
        server_key: "key".into(),
        hardware_key: "hw".into(),
        display_name: "test".into(),
        client_version: "0.0.0".into(),
        xmr_channel: String::new(),
        operating_system: "linux".into(),
    };
    let xmds = XmdsClient::new(cms.clone(), identity);
    let session = Arc::new(SessionClient::new(
        xmds.clone(),
        clock,
        engine.clone(),
        logs.clone(),
        Some(stats),
        SessionOptions {
            collect_interval_secs: 300,
            stats_enabled: false,
            library_dir: dir.path().to_path_buf(),
        },
    ));

    Harness { dir, db, cms, xmds, engine, logs, session }
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<SessionEvent>) -> Vec<&'static str> {
    let mut names = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        names.push(match ev {
            SessionEvent::Collecting => "collecting",
            SessionEvent::Registered(_) => "registered",
            SessionEvent::SubmitLogs => "submit-logs",
            SessionEvent::RequiredFiles(_) => "required-files",
            SessionEvent::Schedule(_) => "schedule",
            SessionEvent::SubmitStats => "submit-stats",
            SessionEvent::ReportFaults => "report-faults",
            SessionEvent::Collected => "collected",
        });
    }
    names
}

#[tokio::test]
async fn ready_cycle_publishes_events_in_order() {
    let h = harness(display(0, "rf1", "s1")).await;
    let mut rx = h.session.subscribe();

    let report = h.session.collect().await;
    assert!(report.registered);
    assert!(report.required_files_fetched);
    assert!(report.schedule_fetched);
    assert!(report.status_notified);

    assert_eq!(
        drain(&mut rx),
        vec![
            "collecting",
            "registered",
            "submit-logs",
            "required-files",
            "schedule",
            "submit-stats",
            "report-faults",
            "collected",
        ]
    );

    let state = h.session.state();
    assert_eq!(state.display_status, DisplayStatus::Ready);
    assert_eq!(state.fetched_rf.as_deref(), Some("rf1"));
    assert!(state.last_collected.is_some());
    // The CMS asked for a longer interval.
    assert_eq!(h.session.interval_secs(), 900);
}

#[tokio::test]
async fn unchanged_checksums_skip_fetches() {
    let h = harness(display(0, "rf1", "s1")).await;
    h.session.collect().await;
    let first = h.cms.take_calls();
    assert!(first.contains(&XmdsMethod::RequiredFiles));
    assert!(first.contains(&XmdsMethod::Schedule));

    let report = h.session.collect().await;
    assert!(!report.required_files_fetched);
    assert!(!report.schedule_fetched);
    let second = h.cms.take_calls();
    assert!(!second.contains(&XmdsMethod::RequiredFiles));
    assert!(!second.contains(&XmdsMethod::Schedule));

    *h.cms.display.lock() = display(0, "rf2", "s1");
    let report = h.session.collect().await;
    assert!(report.required_files_fetched);
    assert!(!report.schedule_fetched);
}

#[tokio::test]
async fn unauthorised_display_stops_after_registration() {
    let h = harness(display(0, "rf1", "s1")).await;
    *h.cms.unauthorised.lock() = true;
    let mut rx = h.session.subscribe();

    let report = h.session.collect().await;
    assert!(report.unauthorized);
    assert!(!report.registered);
    assert_eq!(h.cms.take_calls(), vec![XmdsMethod::RegisterDisplay]);
    assert_eq!(drain(&mut rx), vec!["collecting", "collected"]);
    assert_eq!(h.session.state().display_status, DisplayStatus::AwaitingAuthorization);
}

#[tokio::test]
async fn waiting_display_only_registers() {
    let h = harness(display(1, "rf1", "s1")).await;
    let report = h.session.collect().await;
    assert!(report.registered);
    assert!(!report.required_files_fetched);
    assert_eq!(h.cms.take_calls(), vec![XmdsMethod::RegisterDisplay]);
    assert_eq!(h.session.state().display_status, DisplayStatus::AwaitingAuthorization);
}

#[tokio::test]
async fn accepted_logs_are_deleted() {
    let h = harness(display(0, "rf1", "s1")).await;
    let date = "2025-01-15 10:00:00".to_string();
    h.logs
        .insert_many(vec![
            LogEntry::new("error", "disk full", date.clone()),
            LogEntry::new("audit", "verbose", date),
        ])
        .await
        .unwrap();

    let report = h.session.collect().await;
    assert!(report.logs_submitted);
    assert!(h.cms.take_calls().contains(&XmdsMethod::SubmitLog));
    // The error went to the CMS; the audit entry was below the default level.
    assert_eq!(h.logs.count().await.unwrap(), 0);
}

#[tokio::test]
async fn interval_update_ignores_zero_and_same_value() {
    let h = harness(display(0, "rf1", "s1")).await;
    assert!(!h.session.update_interval(0));
    assert!(!h.session.update_interval(300));
    assert!(h.session.update_interval(60));
    assert_eq!(h.session.interval_secs(), 60);
    assert_eq!(h.session.state().collect_interval_secs, 60);
}

#[tokio::test]
async fn concurrent_collect_now_is_refused() {
    let h = harness(display(0, "rf1", "s1")).await;
    let (a, b) = tokio::join!(h.session.collect_now(), h.session.collect_now());
    // The first cycle is still waiting on the database when the second asks.
    assert!(a.is_some());
    assert!(b.is_none());
}

/// Layout downloads that take a while, like a large library on a slow link.
struct SlowFetcher(Duration);

#[async_trait]
impl Fetcher for SlowFetcher {
    async fn fetch(&self, _source: &FileSource) -> Result<Bytes> {
        tokio::time::sleep(self.0).await;
        Ok(Bytes::from_static(b"<layout/>"))
    }
}

async fn player(h: &Harness, delay: Duration) -> Player {
    let cache = ContentCache::new(
        h.db.clone(),
        h.dir.path().join("library"),
        "/files",
        Arc::new(SlowFetcher(delay)),
        2,
    )
    .await
    .unwrap();
    Player::new(h.xmds.clone(), cache, h.engine.clone())
}

async fn wait_for_loop(engine: &ScheduleEngine, expected: Vec<i64>) {
    let mut rx = engine.subscribe();
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if rx.borrow_and_update().layout_ids() == expected {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    })
    .await;
    assert!(reached.is_ok(), "loop never became {expected:?}");
    assert_eq!(engine.current_loop().layout_ids(), expected);
}

#[tokio::test]
async fn schedule_survives_a_lagging_event_subscriber() {
    let h = harness(display(0, "rf1", "s1")).await;
    let mut events = h.session.subscribe();
    let feed = h.session.feed();

    // Enough cycles to overflow the event channel before anyone reads it.
    for _ in 0..7 {
        h.session.collect().await;
    }
    assert!(matches!(events.try_recv(), Err(TryRecvError::Lagged(_))));

    let calls = h.cms.take_calls();
    assert_eq!(calls.iter().filter(|m| **m == XmdsMethod::Schedule).count(), 1);

    let cancel = CancellationToken::new();
    let task = tokio::spawn(player(&h, Duration::ZERO).await.run(feed, cancel.clone()));
    wait_for_loop(&h.engine, vec![7]).await;

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn newer_schedule_applies_after_slow_downloads() {
    let h = harness(display(0, "rf1", "s1")).await;
    let cancel = CancellationToken::new();
    let task = tokio::spawn(
        player(&h, Duration::from_millis(200))
            .await
            .run(h.session.feed(), cancel.clone()),
    );

    h.session.collect().await;
    // The CMS publishes a new schedule while the first batch is downloading.
    *h.cms.schedule.lock() = default_layout_schedule(8);
    *h.cms.display.lock() = display(0, "rf1", "s2");
    let report = h.session.collect().await;
    assert!(report.schedule_fetched);

    wait_for_loop(&h.engine, vec![8]).await;

    cancel.cancel();
    task.await.unwrap();
}
