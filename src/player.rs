// --- Event wiring ---------------------------------------------------------
//
// Applies what the session fetched to the cache and the schedule engine:
//   required files -> download batch, report inventory, purge
//   schedule       -> replace snapshot, reassess, purge
// Runs as its own task so downloads never hold up the collection cycle.
// Only the newest value of each is applied; anything superseded while a
// batch was downloading is skipped.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{ContentCache, FileStatus};
use crate::schedule::ScheduleEngine;
use crate::session::SessionFeed;
use crate::xmds::{RequiredFiles, Schedule, XmdsClient};

#[derive(Clone)]
pub struct Player {
    xmds: XmdsClient,
    cache: ContentCache,
    engine: Arc<ScheduleEngine>,
}

impl Player {
    pub fn new(xmds: XmdsClient, cache: ContentCache, engine: Arc<ScheduleEngine>) -> Self {
        Self { xmds, cache, engine }
    }

    /// Apply the feed until cancelled or the session goes away. Values
    /// already in the feed are applied first.
    pub async fn run(self, mut feed: SessionFeed, cancel: CancellationToken) {
        let files = feed.required_files.borrow_and_update().clone();
        if let Some(files) = files {
            self.on_required_files(&files).await;
        }
        let schedule = feed.schedule.borrow_and_update().clone();
        if let Some(schedule) = schedule {
            self.on_schedule(&schedule).await;
        }

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                changed = feed.required_files.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let files = feed.required_files.borrow_and_update().clone();
                    if let Some(files) = files {
                        self.on_required_files(&files).await;
                    }
                }
                changed = feed.schedule.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let schedule = feed.schedule.borrow_and_update().clone();
                    if let Some(schedule) = schedule {
                        self.on_schedule(&schedule).await;
                    }
                }
            }
        }
        debug!("player stopped");
    }

    async fn on_required_files(&self, files: &RequiredFiles) {
        let outcomes = self.cache.download_all(&files.files).await;
        for o in outcomes.iter().filter(|o| o.status == FileStatus::Failed) {
            warn!(file = %o.name, "download failed: {}", o.error.as_deref().unwrap_or("unknown"));
        }

        let inventory = self.cache.media_inventory(&files.files).await;
        match self.xmds.media_inventory(inventory).await {
            Ok(true) => debug!("media inventory accepted"),
            Ok(false) => warn!("media inventory not accepted by the CMS"),
            Err(e) => warn!("media inventory failed: {e}"),
        }

        self.cache.purge(&files.purge).await;

        // New layout files can change what the loop resolves to.
        self.engine.assess();
    }

    async fn on_schedule(&self, schedule: &Schedule) {
        let purge = schedule.purge.clone();
        self.engine.update(schedule.clone());
        let outcome = self.engine.assess();
        info!(?outcome, status = %self.engine.loop_status(), "schedule applied");

        if !purge.is_empty() {
            self.cache.purge(&purge).await;
        }
    }
}
