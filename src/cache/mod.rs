// --- Content cache --------------------------------------------------------
//
// Downloads the files the CMS requires, verifies them, and keeps one
// `files` row per saved name. Lookups never fail: a missing or broken file
// is simply "not found" and the caller leaves it out.

pub mod fetch;
pub mod rewrite;
pub mod store;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use md5::{Digest, Md5};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub use fetch::{FileSource, Fetcher, RemoteFetcher};
pub use store::{FileStatus, LocalFile};

use crate::db::Db;
use crate::xmds::{PurgeItem, RequiredFile};

/// Everything needed to fetch and record one library file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    /// Unique library name (the `files` key).
    pub save_name: String,
    pub source: FileSource,
    /// Change-detection token: the MD5, or the `updated` stamp for resources.
    pub declared_hash: String,
    /// When non-empty, downloaded bytes must hash to this.
    pub md5: String,
    pub file_id: String,
    pub file_type: String,
    pub sub_type: String,
}

impl From<&RequiredFile> for DownloadRequest {
    fn from(f: &RequiredFile) -> Self {
        let source = if f.is_resource() {
            FileSource::Resource {
                layout_id: f.layout_id.unwrap_or(0),
                region_id: f.region_id.clone().unwrap_or_default(),
                media_id: f.media_id.clone().unwrap_or_default(),
            }
        } else {
            FileSource::Http(f.path.clone())
        };
        Self {
            save_name: f.save_name(),
            source,
            declared_hash: f.declared_hash(),
            md5: f.md5.clone(),
            file_id: f.id.clone(),
            file_type: f.file_type.clone(),
            sub_type: f.sub_type.clone(),
        }
    }
}

/// What `download_file` did for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadOutcome {
    pub name: String,
    pub status: FileStatus,
    pub local_path: Option<PathBuf>,
    pub size: u64,
    /// Set when the fetch or write failed.
    pub error: Option<String>,
}

struct Inner {
    db: Db,
    library_dir: PathBuf,
    /// URL prefix the local file server exposes the library under.
    local_base: String,
    fetcher: Arc<dyn Fetcher>,
    permits: Arc<Semaphore>,
}

/// Shared handle; clones refer to the same cache.
#[derive(Clone)]
pub struct ContentCache {
    inner: Arc<Inner>,
}

/// Names land directly in the library directory, so they must be a single
/// normal path component.
fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}

fn md5_hex(bytes: &[u8]) -> String {
    let digest = Md5::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

impl ContentCache {
    pub async fn new(
        db: Db,
        library_dir: impl Into<PathBuf>,
        local_base: impl Into<String>,
        fetcher: Arc<dyn Fetcher>,
        max_concurrent: usize,
    ) -> Result<Self> {
        let library_dir = library_dir.into();
        tokio::fs::create_dir_all(&library_dir)
            .await
            .with_context(|| format!("failed to create library dir {}", library_dir.display()))?;

        Ok(Self {
            inner: Arc::new(Inner {
                db,
                library_dir,
                local_base: local_base.into(),
                fetcher,
                permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            }),
        })
    }

    pub fn library_dir(&self) -> &Path {
        &self.inner.library_dir
    }

    /// URL the renderer uses for a library file.
    pub fn local_url(&self, name: &str) -> String {
        format!("{}/{}", self.inner.local_base.trim_end_matches('/'), name)
    }

    // --- Download ---------------------------------------------------------

    /// Fetch `req` unless an available copy with the same hash is on disk.
    ///
    /// Never returns an error: failures are recorded as `failed` and reported
    /// through the outcome.
    pub async fn download_file(&self, req: &DownloadRequest) -> DownloadOutcome {
        if !is_safe_name(&req.save_name) {
            warn!("refusing to store file under unsafe name {:?}", req.save_name);
            return DownloadOutcome {
                name: req.save_name.clone(),
                status: FileStatus::Failed,
                local_path: None,
                size: 0,
                error: Some("unsafe file name".into()),
            };
        }

        let local_path = self.inner.library_dir.join(&req.save_name);
        let existing = self.record(&req.save_name).await;

        let status = match existing {
            Some(rec) if rec.status.is_available() => {
                let on_disk = tokio::fs::try_exists(&local_path).await.unwrap_or(false);
                if rec.hash == req.declared_hash && on_disk {
                    debug!(name = %req.save_name, "unchanged, skipping download");
                    return DownloadOutcome {
                        name: req.save_name.clone(),
                        status: FileStatus::Skipped,
                        local_path: Some(local_path),
                        size: rec.size,
                        error: None,
                    };
                }
                if rec.hash != req.declared_hash {
                    FileStatus::Updated
                } else {
                    FileStatus::Success
                }
            }
            _ => FileStatus::Success,
        };

        match self.fetch_and_store(req, &local_path).await {
            Ok(size) => {
                let rec = LocalFile {
                    name: req.save_name.clone(),
                    url: req.source.describe(),
                    local_path: local_path.to_string_lossy().into_owned(),
                    size,
                    status,
                    file_id: req.file_id.clone(),
                    file_type: req.file_type.clone(),
                    sub_type: req.sub_type.clone(),
                    hash: req.declared_hash.clone(),
                    last_downloaded: String::new(),
                };
                self.save_record(rec).await;
                info!(name = %req.save_name, size, status = status.as_str(), "file downloaded");
                DownloadOutcome {
                    name: req.save_name.clone(),
                    status,
                    local_path: Some(local_path),
                    size,
                    error: None,
                }
            }
            Err(e) => {
                warn!("download of {} failed: {e:#}", req.save_name);
                let rec = LocalFile {
                    name: req.save_name.clone(),
                    url: req.source.describe(),
                    local_path: String::new(),
                    size: 0,
                    status: FileStatus::Failed,
                    file_id: req.file_id.clone(),
                    file_type: req.file_type.clone(),
                    sub_type: req.sub_type.clone(),
                    hash: String::new(),
                    last_downloaded: String::new(),
                };
                self.save_record(rec).await;
                DownloadOutcome {
                    name: req.save_name.clone(),
                    status: FileStatus::Failed,
                    local_path: None,
                    size: 0,
                    error: Some(format!("{e:#}")),
                }
            }
        }
    }

    async fn fetch_and_store(&self, req: &DownloadRequest, local_path: &Path) -> Result<u64> {
        let bytes = self.inner.fetcher.fetch(&req.source).await?;

        if !req.md5.is_empty() {
            let actual = md5_hex(&bytes);
            if !actual.eq_ignore_ascii_case(&req.md5) {
                return Err(anyhow!("md5 mismatch: expected {}, got {actual}", req.md5));
            }
        }

        let bytes = self.transform(req, bytes);

        let part = self.inner.library_dir.join(format!("{}.part", req.save_name));
        let written = async {
            tokio::fs::write(&part, &bytes).await?;
            tokio::fs::rename(&part, local_path).await?;
            anyhow::Ok(())
        }
        .await;

        if let Err(e) = written {
            if let Err(rm) = tokio::fs::remove_file(&part).await {
                if rm.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove partial file {}: {rm}", part.display());
                }
            }
            return Err(e.context(format!("failed to write {}", local_path.display())));
        }

        Ok(bytes.len() as u64)
    }

    fn transform(&self, req: &DownloadRequest, bytes: Bytes) -> Bytes {
        let font_css = req.sub_type.eq_ignore_ascii_case("fontCss");
        let resource = matches!(req.source, FileSource::Resource { .. });
        if !font_css && !resource {
            return bytes;
        }

        let Ok(text) = std::str::from_utf8(&bytes) else {
            warn!(name = %req.save_name, "not utf-8, stored without rewriting");
            return bytes;
        };
        let base = self.local_url("");
        let base = base.trim_end_matches('/');
        let out = if font_css {
            rewrite::rewrite_font_css(text, base)
        } else {
            rewrite::rewrite_resource_html(text, base)
        };
        Bytes::from(out)
    }

    /// Download a whole batch. Each file runs on its own task, at most
    /// `max_concurrent` at a time; one failure never affects the others.
    pub async fn download_all(&self, files: &[RequiredFile]) -> Vec<DownloadOutcome> {
        let mut set = JoinSet::new();
        for (idx, f) in files.iter().enumerate() {
            let req = DownloadRequest::from(f);
            let cache = self.clone();
            let permits = Arc::clone(&self.inner.permits);
            set.spawn(async move {
                let _permit = permits.acquire_owned().await;
                (idx, cache.download_file(&req).await)
            });
        }

        let mut outcomes: Vec<Option<DownloadOutcome>> = vec![None; files.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, outcome)) => outcomes[idx] = Some(outcome),
                Err(e) => warn!("download task failed: {e}"),
            }
        }

        let outcomes: Vec<_> = outcomes.into_iter().flatten().collect();
        let failed = outcomes.iter().filter(|o| o.status == FileStatus::Failed).count();
        info!(total = files.len(), failed, "required files processed");
        outcomes
    }

    // --- Lookup -----------------------------------------------------------

    async fn record(&self, name: &str) -> Option<LocalFile> {
        let name = name.to_string();
        match self.inner.db.run(move |conn| Ok(store::get_by_name(conn, &name)?)).await {
            Ok(rec) => rec,
            Err(e) => {
                warn!("files lookup failed: {e:#}");
                None
            }
        }
    }

    async fn save_record(&self, rec: LocalFile) {
        if let Err(e) = self.inner.db.run(move |conn| Ok(store::upsert(conn, &rec)?)).await {
            warn!("failed to record file state: {e:#}");
        }
    }

    /// Record by library name.
    pub async fn get_file(&self, name: &str) -> Option<LocalFile> {
        self.record(name).await
    }

    /// Available file for `(file_id, type)`, if any.
    pub async fn get_local_file(&self, file_id: &str, file_type: &str) -> Option<LocalFile> {
        let (id, ty) = (file_id.to_string(), file_type.to_string());
        match self.inner.db.run(move |conn| Ok(store::get_by_file(conn, &id, &ty)?)).await {
            Ok(rec) => rec,
            Err(e) => {
                warn!("file lookup for {file_type} {file_id} failed: {e:#}");
                None
            }
        }
    }

    /// All records, newest first.
    pub async fn downloaded_files(&self) -> Result<Vec<LocalFile>> {
        self.inner.db.run(|conn| Ok(store::list(conn)?)).await
    }

    // --- Housekeeping -----------------------------------------------------

    /// Delete purged files from disk and from the index.
    pub async fn purge(&self, items: &[PurgeItem]) -> usize {
        let mut removed = 0;
        for item in items {
            let name = item.stored_as.clone();
            if !is_safe_name(&name) {
                warn!("ignoring purge of unsafe name {name:?}");
                continue;
            }

            let path = self.inner.library_dir.join(&name);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("failed to purge {}: {e}", path.display()),
            }

            let key = name.clone();
            if let Err(e) = self.inner.db.run(move |conn| Ok(store::delete_by_name(conn, &key)?)).await {
                warn!("failed to drop purged record {name}: {e:#}");
            }
        }
        if removed > 0 {
            info!(removed, "purged library files");
        }
        removed
    }

    /// `<files>` inventory document for `MediaInventory`.
    pub async fn media_inventory(&self, files: &[RequiredFile]) -> String {
        let checked = time::OffsetDateTime::now_utc().unix_timestamp();
        let mut xml = String::from("<files>");
        for f in files {
            let complete = self
                .record(&f.save_name())
                .await
                .map(|r| r.status.is_available())
                .unwrap_or(false);
            xml.push_str(&format!(
                r#"<file type="{}" id="{}" complete="{}" md5="{}" lastChecked="{checked}""#,
                crate::xmds::envelope::escape(&f.file_type),
                crate::xmds::envelope::escape(&f.id),
                u8::from(complete),
                crate::xmds::envelope::escape(&f.md5),
            ));
            if f.file_type == "dependency" {
                xml.push_str(&format!(
                    r#" fileType="{}""#,
                    crate::xmds::envelope::escape(&f.sub_type)
                ));
            }
            xml.push_str("/>");
        }
        xml.push_str("</files>");
        xml
    }
}
