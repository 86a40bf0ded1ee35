// Local HTTP surface, served on an ephemeral port.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use time::macros::datetime;
use tokio::net::TcpListener;

use signage_engine::cache::{ContentCache, FileSource, Fetcher};
use signage_engine::clock::ManualClock;
use signage_engine::db::Db;
use signage_engine::error::XmdsError;
use signage_engine::logs::LogStore;
use signage_engine::schedule::{EngineOptions, Predicates, ScheduleEngine};
use signage_engine::server::{build_router, AppState};
use signage_engine::session::{SessionClient, SessionOptions};
use signage_engine::stats::StatsStore;
use signage_engine::xmds::{RequiredFile, XmdsClient, XmdsIdentity, XmdsMethod, XmdsTransport};

struct Offline;

#[async_trait]
impl XmdsTransport for Offline {
    async fn post(&self, _method: XmdsMethod, _body: String) -> Result<String, XmdsError> {
        Err(XmdsError::Transport("offline".into()))
    }
}

struct StaticFetcher;

#[async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch(&self, source: &FileSource) -> Result<Bytes> {
        match source {
            FileSource::Http(url) if url.ends_with("7.xlf") => Ok(Bytes::from_static(b"<layout/>")),
            _ => Err(anyhow!("not found")),
        }
    }
}

async fn start() -> (tempfile::TempDir, SocketAddr, Arc<ScheduleEngine>) {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(datetime!(2025-01-15 10:00:00)));
    let db = Db::open(dir.path().join("engine.db")).await.unwrap();

    let cache = ContentCache::new(db.clone(), dir.path().join("library"), "/files", Arc::new(StaticFetcher), 2)
        .await
        .unwrap();
    let layout = RequiredFile {
        file_type: "layout".into(),
        id: "7".into(),
        download: "http".into(),
        path: "https://cms/7.xlf".into(),
        save_as: "7.xlf".into(),
        ..Default::default()
    };
    cache.download_all(&[layout]).await;

    let engine = Arc::new(ScheduleEngine::new(clock.clone(), EngineOptions::default(), Predicates::default()));
    let identity = XmdsIdentity {
        server_key: "key".into(),
        hardware_key: "hw".into(),
        display_name: "test".into(),
        client_version: "0.0.0".into(),
        xmr_channel: String::new(),
        operating_system: "linux".into(),
    };
    let xmds = XmdsClient::new(Arc::new(Offline), identity);
    let stats = StatsStore::new(db.clone(), clock.clone());
    let session = Arc::new(SessionClient::new(
        xmds,
        clock,
        engine.clone(),
        LogStore::new(db),
        Some(stats.clone()),
        SessionOptions { collect_interval_secs: 300, stats_enabled: true, library_dir: dir.path().into() },
    ));

    let app = build_router(AppState {
        version: "test".into(),
        cache,
        engine: engine.clone(),
        session,
        stats,
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (dir, addr, engine)
}

async fn post_json(addr: SocketAddr, path: &str, body: &str) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("http://{addr}{path}"))
        .header("content-type", "application/json")
        .body(body.to_string())
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn health_and_library_files() {
    let (_dir, addr, _engine) = start().await;

    let health = reqwest::get(format!("http://{addr}/health")).await.unwrap();
    assert_eq!(health.text().await.unwrap(), "OK");

    let file = reqwest::get(format!("http://{addr}/files/7.xlf")).await.unwrap();
    assert_eq!(file.status(), 200);
    assert_eq!(file.text().await.unwrap(), "<layout/>");

    let missing = reqwest::get(format!("http://{addr}/files/nope.xlf")).await.unwrap();
    assert_eq!(missing.status(), 404);

    let index = reqwest::get(format!("http://{addr}/api/v1/files")).await.unwrap();
    let index: serde_json::Value = serde_json::from_str(&index.text().await.unwrap()).unwrap();
    assert_eq!(index[0]["name"], "7.xlf");
    assert_eq!(index[0]["status"], "success");
}

#[tokio::test]
async fn loop_falls_back_to_splash() {
    let (_dir, addr, _engine) = start().await;
    let body = reqwest::get(format!("http://{addr}/api/v1/loop")).await.unwrap().text().await.unwrap();
    let entries: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(entries[0]["layoutId"], 0);
    assert_eq!(entries[0]["shortPath"], "0.xlf");
}

#[tokio::test]
async fn layout_stats_track_current_layout_and_plays() {
    let (_dir, addr, engine) = start().await;
    let key = r#"{"scheduleId": 3, "layoutId": 7, "type": "layout"}"#;

    let start = post_json(addr, "/api/v1/stats", &format!(r#"{{"action": "start", "key": {key}}}"#)).await;
    assert_eq!(start.status(), 200);
    assert_eq!(engine.current_layout(), Some(7));
    assert_eq!(engine.play_count(3), 1);

    let end = post_json(addr, "/api/v1/stats", &format!(r#"{{"action": "end", "key": {key}}}"#)).await;
    assert_eq!(end.status(), 200);

    let again = post_json(addr, "/api/v1/stats", &format!(r#"{{"action": "end", "key": {key}}}"#)).await;
    assert_eq!(again.status(), 404);

    let status = reqwest::get(format!("http://{addr}/api/v1/status")).await.unwrap().text().await.unwrap();
    let status: serde_json::Value = serde_json::from_str(&status).unwrap();
    assert_eq!(status["currentLayoutId"], 7);
    assert_eq!(status["scheduleStatus"], "Splash only");
}
