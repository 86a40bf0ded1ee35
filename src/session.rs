// --- Session client -------------------------------------------------------
//
// Owns the collection timer. One cycle:
//   register -> (ready only) logs, required files, schedule, stats,
//   status, faults -> collected
// Required files and schedule are only fetched when the checksum from the
// latest registration differs from the one we last fetched with. The
// latest fetched copy of each is held in a `watch` channel, so a slow
// consumer always gets it even after missing broadcast events.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{format_cms_date, Clock};
use crate::config::{LOGS_DRAIN_INTERVAL_SECS, LOGS_THRESHOLD};
use crate::error::XmdsError;
use crate::logs::{logs_xml, LogLevelFilter, LogStore};
use crate::schedule::ScheduleEngine;
use crate::stats::{records_xml, StatsStore};
use crate::xmds::{DisplayStatus, RegisterDisplay, RequiredFiles, Schedule, XmdsClient};

/// Most stats sent in one `SubmitStats` call.
const STATS_BATCH: usize = 50;

/// 1x1 transparent PNG sent as proof of life when the CMS asks for a
/// screenshot.
const PLACEHOLDER_PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44, 0x52,
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F, 0x15, 0xC4,
    0x89, 0x00, 0x00, 0x00, 0x0A, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00, 0x01, 0x00, 0x00,
    0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4E, 0x44, 0xAE,
    0x42, 0x60, 0x82,
];

/// Published in this order within a cycle.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Collecting,
    Registered(Arc<RegisterDisplay>),
    SubmitLogs,
    RequiredFiles(Arc<RequiredFiles>),
    Schedule(Arc<Schedule>),
    SubmitStats,
    ReportFaults,
    Collected,
}

/// Latest required files and schedule, for whoever applies them.
pub struct SessionFeed {
    pub required_files: watch::Receiver<Option<Arc<RequiredFiles>>>,
    pub schedule: watch::Receiver<Option<Arc<Schedule>>>,
}

/// What the session knows about its standing with the CMS.
#[derive(Debug, Clone, Serialize)]
pub struct SessionState {
    pub display_status: DisplayStatus,
    /// Checksums from the latest registration.
    pub check_rf: Option<String>,
    pub check_schedule: Option<String>,
    /// Checksums the data we hold was fetched under.
    pub fetched_rf: Option<String>,
    pub fetched_schedule: Option<String>,
    pub collect_interval_secs: u64,
    pub registration_message: String,
    pub last_collected: Option<String>,
}

/// Per-step results of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub registered: bool,
    /// The CMS answered "not authorised" and the cycle stopped there.
    pub unauthorized: bool,
    pub required_files_fetched: bool,
    pub schedule_fetched: bool,
    pub logs_submitted: bool,
    pub stats_submitted: bool,
    pub status_notified: bool,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub collect_interval_secs: u64,
    /// Fallback when the CMS does not send `statsEnabled`.
    pub stats_enabled: bool,
    /// Directory whose disk is reported in NotifyStatus.
    pub library_dir: PathBuf,
}

/// JSON body of `NotifyStatus`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub last_activity: String,
    pub application_state: &'static str,
    pub current_layout_id: Option<i64>,
    pub schedule_status: String,
    pub available_space: u64,
    pub total_space: u64,
    pub device_name: String,
    pub time_zone: String,
    pub display_status: DisplayStatus,
    pub client_version: String,
}

impl DeviceStatus {
    fn gather(session: &SessionClient) -> Self {
        let (available_space, total_space) = disk_space(&session.options.library_dir);
        let time_zone = session
            .registration()
            .map(|r| r.timezone.clone())
            .filter(|tz| !tz.is_empty())
            .unwrap_or_else(local_offset);

        Self {
            last_activity: format_cms_date(session.clock.now()),
            application_state: "running",
            current_layout_id: session.engine.current_layout(),
            schedule_status: session.engine.loop_status(),
            available_space,
            total_space,
            device_name: sysinfo::System::host_name().unwrap_or_default(),
            time_zone,
            display_status: session.state.read().display_status,
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

fn local_offset() -> String {
    time::UtcOffset::current_local_offset()
        .map(|o| {
            let (h, m, _) = o.as_hms();
            let sign = if o.is_negative() { '-' } else { '+' };
            format!("{sign}{:02}:{:02}", h.abs(), m.abs())
        })
        .unwrap_or_else(|_| "+00:00".to_string())
}

/// `(available, total)` bytes of the disk holding `dir`.
fn disk_space(dir: &std::path::Path) -> (u64, u64) {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| dir.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| (d.available_space(), d.total_space()))
        .unwrap_or((0, 0))
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

fn needs_fetch(remote: &Option<String>, held: &Option<String>) -> bool {
    held.is_none() || held != remote
}

fn parse_flag(v: &str) -> bool {
    matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "on" | "yes")
}

pub struct SessionClient {
    xmds: XmdsClient,
    clock: Arc<dyn Clock>,
    engine: Arc<ScheduleEngine>,
    logs: LogStore,
    stats: Option<StatsStore>,
    options: SessionOptions,
    state: RwLock<SessionState>,
    registration: RwLock<Option<Arc<RegisterDisplay>>>,
    interval_secs: AtomicU64,
    rearm: Notify,
    cycle: Mutex<()>,
    log_submission: Mutex<()>,
    events: broadcast::Sender<SessionEvent>,
    required_files_tx: watch::Sender<Option<Arc<RequiredFiles>>>,
    schedule_tx: watch::Sender<Option<Arc<Schedule>>>,
}

impl SessionClient {
    pub fn new(
        xmds: XmdsClient,
        clock: Arc<dyn Clock>,
        engine: Arc<ScheduleEngine>,
        logs: LogStore,
        stats: Option<StatsStore>,
        options: SessionOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(32);
        let interval = options.collect_interval_secs.max(1);
        Self {
            xmds,
            clock,
            engine,
            logs,
            stats,
            state: RwLock::new(SessionState {
                display_status: DisplayStatus::Unregistered,
                check_rf: None,
                check_schedule: None,
                fetched_rf: None,
                fetched_schedule: None,
                collect_interval_secs: interval,
                registration_message: String::new(),
                last_collected: None,
            }),
            options,
            registration: RwLock::new(None),
            interval_secs: AtomicU64::new(interval),
            rearm: Notify::new(),
            cycle: Mutex::new(()),
            log_submission: Mutex::new(()),
            events,
            required_files_tx: watch::channel(None).0,
            schedule_tx: watch::channel(None).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn feed(&self) -> SessionFeed {
        SessionFeed {
            required_files: self.required_files_tx.subscribe(),
            schedule: self.schedule_tx.subscribe(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state.read().clone()
    }

    pub fn registration(&self) -> Option<Arc<RegisterDisplay>> {
        self.registration.read().clone()
    }

    pub fn interval_secs(&self) -> u64 {
        self.interval_secs.load(Ordering::Acquire)
    }

    /// CMS setting from the latest registration, or `default`.
    pub fn setting(&self, name: &str, default: &str) -> String {
        match self.registration.read().as_ref() {
            Some(reg) => reg.get_setting(name, default),
            None => default.to_string(),
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    // --- Timer ------------------------------------------------------------

    /// Change the collection interval. The running wait restarts with the new
    /// value; an in-flight cycle is not affected. Returns whether it changed.
    pub fn update_interval(&self, secs: u64) -> bool {
        if secs == 0 || secs == self.interval_secs() {
            return false;
        }
        info!(secs, "collection interval changed");
        self.interval_secs.store(secs, Ordering::Release);
        self.state.write().collect_interval_secs = secs;
        self.rearm.notify_one();
        true
    }

    /// Arm the timer with `interval_secs`, run one cycle right away, then
    /// one cycle per interval (counted from the end of the previous cycle)
    /// until cancelled.
    pub async fn start(self: Arc<Self>, interval_secs: u64, cancel: CancellationToken) {
        if interval_secs > 0 {
            self.interval_secs.store(interval_secs, Ordering::Release);
            self.state.write().collect_interval_secs = interval_secs;
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.collect() => {}
            }

            loop {
                let wait = Duration::from_secs(self.interval_secs());
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("collection loop stopped");
                        return;
                    }
                    _ = self.rearm.notified() => continue,
                    _ = tokio::time::sleep(wait) => break,
                }
            }
        }
        debug!("collection loop stopped");
    }

    /// Drain the log backlog every few seconds while it is above threshold.
    pub async fn run_log_drain(self: Arc<Self>, cancel: CancellationToken) {
        let interval = Duration::from_secs(LOGS_DRAIN_INTERVAL_SECS);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            if self.state.read().display_status != DisplayStatus::Ready {
                continue;
            }
            match self.logs.count().await {
                Ok(n) if n > LOGS_THRESHOLD => {
                    debug!(pending = n, "log backlog above threshold, draining");
                    if let Err(e) = self.submit_logs().await {
                        warn!("log backlog submission failed: {e}");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("failed to count pending logs: {e:#}"),
            }
        }
        debug!("log drain loop stopped");
    }

    // --- Cycle ------------------------------------------------------------

    /// Run a cycle now unless one is already running.
    pub async fn collect_now(&self) -> Option<CycleReport> {
        let guard = self.cycle.try_lock().ok()?;
        Some(self.run_cycle(guard).await)
    }

    /// Run one cycle, waiting for a running one to finish first.
    pub async fn collect(&self) -> CycleReport {
        let guard = self.cycle.lock().await;
        self.run_cycle(guard).await
    }

    async fn run_cycle(&self, _guard: tokio::sync::MutexGuard<'_, ()>) -> CycleReport {
        let mut report = CycleReport::default();
        self.emit(SessionEvent::Collecting);

        match self.register().await {
            Ok(()) => report.registered = true,
            Err(e) if e.is_not_authorized() => {
                self.mark_unauthorized(&e);
                report.unauthorized = true;
            }
            Err(e) => warn!("unable to register with the CMS: {e}"),
        }

        if !report.unauthorized && self.state.read().display_status == DisplayStatus::Ready {
            if let Err(e) = self.ready_steps(&mut report).await {
                self.mark_unauthorized(&e);
                report.unauthorized = true;
            }
        }

        self.state.write().last_collected = Some(format_cms_date(self.clock.now()));
        self.emit(SessionEvent::Collected);
        report
    }

    fn mark_unauthorized(&self, e: &XmdsError) {
        warn!("display is not authorised, skipping the rest of this cycle: {e}");
        self.state.write().display_status = DisplayStatus::AwaitingAuthorization;
    }

    async fn register(&self) -> Result<(), XmdsError> {
        let reg = self.xmds.register_display().await?;
        let status = reg.display_status();

        {
            let mut st = self.state.write();
            st.display_status = status;
            st.check_rf = non_empty(&reg.check_rf);
            st.check_schedule = non_empty(&reg.check_schedule);
            st.registration_message = reg.message.clone();
        }

        if status != DisplayStatus::Ready {
            info!(code = %reg.code, "display registered but not ready: {}", reg.message);
        } else {
            debug!(check_rf = %reg.check_rf, check_schedule = %reg.check_schedule, "display registered");
        }

        if let Some(secs) = reg.collect_interval() {
            self.update_interval(secs);
        }

        let reg = Arc::new(reg);
        *self.registration.write() = Some(Arc::clone(&reg));
        self.emit(SessionEvent::Registered(reg));
        Ok(())
    }

    /// Everything after a successful registration. Only "not authorised"
    /// is returned; other failures are logged and the step is skipped.
    async fn ready_steps(&self, report: &mut CycleReport) -> Result<(), XmdsError> {
        self.emit(SessionEvent::SubmitLogs);
        report.logs_submitted = soft(self.submit_logs().await, "submit logs")?.unwrap_or(false);

        report.required_files_fetched =
            soft(self.fetch_required_files().await, "required files")?.unwrap_or(false);
        report.schedule_fetched = soft(self.fetch_schedule().await, "schedule")?.unwrap_or(false);

        if self.stats_enabled() {
            self.emit(SessionEvent::SubmitStats);
            report.stats_submitted = soft(self.submit_stats().await, "submit stats")?.unwrap_or(false);
        }

        report.status_notified = soft(self.notify_status().await, "notify status")?.unwrap_or(false);

        if parse_flag(&self.setting("screenShotRequested", "0")) {
            soft(self.xmds.submit_screenshot(PLACEHOLDER_PNG).await, "screenshot")?;
        }

        self.emit(SessionEvent::ReportFaults);
        Ok(())
    }

    fn stats_enabled(&self) -> bool {
        if self.stats.is_none() {
            return false;
        }
        let fallback = if self.options.stats_enabled { "1" } else { "0" };
        parse_flag(&self.setting("statsEnabled", fallback))
    }

    async fn fetch_required_files(&self) -> Result<bool, XmdsError> {
        let (remote, held) = {
            let st = self.state.read();
            (st.check_rf.clone(), st.fetched_rf.clone())
        };
        if !needs_fetch(&remote, &held) {
            debug!("required files unchanged");
            return Ok(false);
        }

        let files = self.xmds.required_files().await?;
        info!(files = files.files.len(), "required files fetched");
        let files = Arc::new(files);
        self.required_files_tx.send_replace(Some(Arc::clone(&files)));
        self.state.write().fetched_rf = remote;
        self.emit(SessionEvent::RequiredFiles(files));
        Ok(true)
    }

    async fn fetch_schedule(&self) -> Result<bool, XmdsError> {
        let (remote, held) = {
            let st = self.state.read();
            (st.check_schedule.clone(), st.fetched_schedule.clone())
        };
        if !needs_fetch(&remote, &held) {
            debug!("schedule unchanged");
            return Ok(false);
        }

        let schedule = self.xmds.schedule().await?;
        info!(layouts = schedule.layouts.len(), "schedule fetched");
        let schedule = Arc::new(schedule);
        self.schedule_tx.send_replace(Some(Arc::clone(&schedule)));
        self.state.write().fetched_schedule = remote;
        self.emit(SessionEvent::Schedule(schedule));
        Ok(true)
    }

    /// Send one batch of pending logs. They are deleted only when the CMS
    /// answers with an explicit success.
    pub async fn submit_logs(&self) -> Result<bool, XmdsError> {
        let _guard = self.log_submission.lock().await;
        let filter = LogLevelFilter::from_setting(&self.setting("logLevel", "error"));

        if let Err(e) = self.logs.discard_filtered(filter).await {
            warn!("failed to discard filtered logs: {e:#}");
        }
        let entries = match self.logs.fetch(filter, LOGS_THRESHOLD).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("failed to read pending logs: {e:#}");
                return Ok(false);
            }
        };
        if entries.is_empty() {
            return Ok(false);
        }

        let accepted = self.xmds.submit_log(logs_xml(&entries)).await?;
        if accepted {
            let ids = entries.iter().map(|e| e.id).collect();
            if let Err(e) = self.logs.delete(ids).await {
                warn!("failed to delete submitted logs: {e:#}");
            }
            debug!(count = entries.len(), "logs submitted");
        }
        Ok(accepted)
    }

    async fn submit_stats(&self) -> Result<bool, XmdsError> {
        let Some(stats) = self.stats.as_ref() else {
            return Ok(false);
        };
        let pending = match stats.pending(STATS_BATCH).await {
            Ok(p) => p,
            Err(e) => {
                warn!("failed to read pending stats: {e:#}");
                return Ok(false);
            }
        };
        if pending.is_empty() {
            return Ok(false);
        }

        let accepted = self.xmds.submit_stats(records_xml(&pending)).await?;
        if accepted {
            let ids = pending.iter().map(|s| s.id).collect();
            if let Err(e) = stats.delete(ids).await {
                warn!("failed to delete submitted stats: {e:#}");
            }
            debug!(count = pending.len(), "stats submitted");
        }
        Ok(accepted)
    }

    async fn notify_status(&self) -> Result<bool, XmdsError> {
        let status = DeviceStatus::gather(self);
        let json = serde_json::to_string(&status)
            .map_err(|e| XmdsError::Malformed(format!("status encoding: {e}")))?;
        self.xmds.notify_status(json).await
    }
}

/// Log a failed step and carry on, unless the CMS says we are not authorised.
fn soft<T>(res: Result<T, XmdsError>, step: &str) -> Result<Option<T>, XmdsError> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_not_authorized() => Err(e),
        Err(e) => {
            warn!("{step} failed: {e}");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_gate_follows_held_checksum() {
        let a = Some("a".to_string());
        let b = Some("b".to_string());
        assert!(needs_fetch(&a, &None));
        assert!(needs_fetch(&b, &a));
        assert!(!needs_fetch(&a, &a));
        assert!(needs_fetch(&None, &None));
    }
}
