// Content cache against an in-memory fetcher.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use md5::{Digest, Md5};
use parking_lot::Mutex;

use signage_engine::cache::{ContentCache, FileSource, FileStatus, Fetcher};
use signage_engine::db::Db;
use signage_engine::xmds::{PurgeItem, RequiredFile};

#[derive(Default)]
struct FakeFetcher {
    bodies: Mutex<HashMap<String, Bytes>>,
    calls: AtomicUsize,
}

impl FakeFetcher {
    fn serve(&self, url: &str, body: &str) {
        self.bodies.lock().insert(url.to_string(), Bytes::from(body.to_string()));
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(&self, source: &FileSource) -> Result<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let key = source.describe();
        self.bodies.lock().get(&key).cloned().ok_or_else(|| anyhow!("404 for {key}"))
    }
}

fn md5_hex(body: &str) -> String {
    Md5::digest(body.as_bytes()).iter().map(|b| format!("{b:02x}")).collect()
}

fn media(id: &str, url: &str, body: &str) -> RequiredFile {
    RequiredFile {
        file_type: "media".into(),
        id: id.into(),
        size: body.len() as u64,
        md5: md5_hex(body),
        download: "http".into(),
        path: url.into(),
        save_as: format!("{id}.png"),
        ..Default::default()
    }
}

async fn cache(dir: &tempfile::TempDir, fetcher: Arc<FakeFetcher>) -> ContentCache {
    let db = Db::open(dir.path().join("engine.db")).await.unwrap();
    ContentCache::new(db, dir.path().join("library"), "/files", fetcher, 2)
        .await
        .unwrap()
}

#[tokio::test]
async fn unchanged_file_is_downloaded_once() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(FakeFetcher::default());
    fetcher.serve("https://cms/12.png", "png-bytes");
    let cache = cache(&dir, fetcher.clone()).await;
    let files = vec![media("12", "https://cms/12.png", "png-bytes")];

    let first = cache.download_all(&files).await;
    assert_eq!(first[0].status, FileStatus::Success);
    let path = first[0].local_path.clone().unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "png-bytes");

    let second = cache.download_all(&files).await;
    assert_eq!(second[0].status, FileStatus::Skipped);
    assert_eq!(fetcher.calls(), 1);

    let rec = cache.get_file("12.png").await.unwrap();
    assert_eq!(rec.status, FileStatus::Success);
    assert_eq!(rec.hash, md5_hex("png-bytes"));
    assert_eq!(rec.size, 9);
}

#[tokio::test]
async fn changed_hash_is_fetched_as_update() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(FakeFetcher::default());
    fetcher.serve("https://cms/12.png", "v1");
    let cache = cache(&dir, fetcher.clone()).await;
    cache.download_all(&[media("12", "https://cms/12.png", "v1")]).await;

    fetcher.serve("https://cms/12.png", "v2");
    let out = cache.download_all(&[media("12", "https://cms/12.png", "v2")]).await;
    assert_eq!(out[0].status, FileStatus::Updated);
    assert_eq!(fetcher.calls(), 2);

    let rec = cache.get_file("12.png").await.unwrap();
    assert_eq!(rec.status, FileStatus::Updated);
    assert!(rec.status.is_available());
    assert_eq!(std::fs::read_to_string(dir.path().join("library/12.png")).unwrap(), "v2");
}

#[tokio::test]
async fn missing_file_on_disk_is_fetched_again() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(FakeFetcher::default());
    fetcher.serve("https://cms/12.png", "v1");
    let cache = cache(&dir, fetcher.clone()).await;
    let files = vec![media("12", "https://cms/12.png", "v1")];
    cache.download_all(&files).await;

    std::fs::remove_file(dir.path().join("library/12.png")).unwrap();
    let out = cache.download_all(&files).await;
    assert_eq!(out[0].status, FileStatus::Success);
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test]
async fn failures_are_recorded_without_affecting_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(FakeFetcher::default());
    fetcher.serve("https://cms/ok.png", "fine");
    fetcher.serve("https://cms/corrupt.png", "truncated");
    let cache = cache(&dir, fetcher.clone()).await;

    let mut corrupt = media("corrupt", "https://cms/corrupt.png", "truncated");
    corrupt.md5 = md5_hex("the real content");
    let files = vec![
        media("ok", "https://cms/ok.png", "fine"),
        media("gone", "https://cms/gone.png", "whatever"),
        corrupt,
    ];

    let out = cache.download_all(&files).await;
    assert_eq!(out.len(), 3);
    assert_eq!(out[0].status, FileStatus::Success);
    assert_eq!(out[1].status, FileStatus::Failed);
    assert_eq!(out[2].status, FileStatus::Failed);
    assert!(out[2].error.as_deref().unwrap().contains("md5 mismatch"));

    let rec = cache.get_file("corrupt.png").await.unwrap();
    assert_eq!(rec.status, FileStatus::Failed);
    assert!(rec.local_path.is_empty());
    assert!(rec.hash.is_empty());
    assert!(!dir.path().join("library/corrupt.png").exists());
    assert!(!dir.path().join("library/corrupt.png.part").exists());

    // Failed records never resolve as local files.
    assert!(cache.get_local_file("corrupt", "media").await.is_none());
    assert!(cache.get_local_file("ok", "media").await.is_some());
}

#[tokio::test]
async fn font_css_is_rewritten_to_local_urls() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(FakeFetcher::default());
    let css = "@font-face { src: url('https://cms/xmds.php?file=roboto.ttf'); }";
    fetcher.serve("https://cms/fonts.css", css);
    let cache = cache(&dir, fetcher.clone()).await;

    let file = RequiredFile {
        file_type: "dependency".into(),
        id: "fonts.css".into(),
        download: "http".into(),
        path: "https://cms/fonts.css".into(),
        save_as: "fonts.css".into(),
        sub_type: "FONTCSS".into(),
        ..Default::default()
    };
    let out = cache.download_all(&[file]).await;
    assert_eq!(out[0].status, FileStatus::Success);

    let stored = std::fs::read_to_string(dir.path().join("library/fonts.css")).unwrap();
    assert_eq!(stored, r#"@font-face { src: url("/files/roboto.ttf"); }"#);
}

#[tokio::test]
async fn resources_come_from_the_cms_and_are_rewritten() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(FakeFetcher::default());
    fetcher.serve(
        "xmds:getResource/7/r1/33",
        r#"<html><img src="https://cms/xmds.php?file=logo.png&amp;x=1"></html>"#,
    );
    let cache = cache(&dir, fetcher.clone()).await;

    let file = RequiredFile {
        file_type: "resource".into(),
        id: "33".into(),
        layout_id: Some(7),
        region_id: Some("r1".into()),
        media_id: Some("33".into()),
        updated: Some("1736935200".into()),
        ..Default::default()
    };
    let out = cache.download_all(&[file.clone()]).await;
    assert_eq!(out[0].name, "7_r1_33.html");
    assert_eq!(out[0].status, FileStatus::Success);

    let stored = std::fs::read_to_string(dir.path().join("library/7_r1_33.html")).unwrap();
    assert_eq!(stored, r#"<html><img src="/files/logo.png"></html>"#);

    // Same `updated` stamp: nothing to do.
    let again = cache.download_all(&[file]).await;
    assert_eq!(again[0].status, FileStatus::Skipped);
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn unsafe_names_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(FakeFetcher::default());
    fetcher.serve("https://cms/x", "x");
    let cache = cache(&dir, fetcher.clone()).await;

    let mut file = media("x", "https://cms/x", "x");
    file.save_as = "../escape.png".into();
    let out = cache.download_all(&[file]).await;
    assert_eq!(out[0].status, FileStatus::Failed);
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test]
async fn purge_removes_file_and_record() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(FakeFetcher::default());
    fetcher.serve("https://cms/4.png", "old");
    let cache = cache(&dir, fetcher.clone()).await;
    cache.download_all(&[media("4", "https://cms/4.png", "old")]).await;

    let removed = cache
        .purge(&[PurgeItem { id: Some(4), stored_as: "4.png".into() }])
        .await;
    assert_eq!(removed, 1);
    assert!(!dir.path().join("library/4.png").exists());
    assert!(cache.get_file("4.png").await.is_none());
}

#[tokio::test]
async fn inventory_reports_completeness() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(FakeFetcher::default());
    fetcher.serve("https://cms/1.png", "one");
    let cache = cache(&dir, fetcher.clone()).await;
    let files = vec![
        media("1", "https://cms/1.png", "one"),
        media("2", "https://cms/2.png", "two"),
    ];
    cache.download_all(&files).await;

    let xml = cache.media_inventory(&files).await;
    assert!(xml.starts_with("<files>"));
    assert!(xml.contains(r#"type="media" id="1" complete="1""#));
    assert!(xml.contains(r#"type="media" id="2" complete="0""#));

    let listed = cache.downloaded_files().await.unwrap();
    assert_eq!(listed.len(), 2);
}
