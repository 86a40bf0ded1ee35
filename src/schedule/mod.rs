// --- Schedule engine ------------------------------------------------------
//
// Resolves the current schedule snapshot into a playback loop. Assessment is
// synchronous and guarded: a trigger that arrives while one is running is
// dropped, not queued. The next timer tick picks up whatever it missed.

pub mod playback;
pub mod predicate;
pub mod weave;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use time::PrimitiveDateTime;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use playback::{LoopItem, LoopItemKind, PlaybackLoop, RendererEntry, SPLASH_FILE, SPLASH_LAYOUT_ID};
pub use predicate::{AssessContext, LayoutPredicate, Predicates};

use crate::cache::ContentCache;
use crate::clock::Clock;
use crate::xmds::{Layout, Schedule};

/// A layout file as the renderer should load it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLayout {
    pub name: String,
    pub url: String,
}

/// Maps a layout id to its downloaded file.
#[async_trait]
pub trait LayoutResolver: Send + Sync {
    async fn resolve_layout(&self, layout_id: i64) -> Option<ResolvedLayout>;
}

#[async_trait]
impl LayoutResolver for ContentCache {
    async fn resolve_layout(&self, layout_id: i64) -> Option<ResolvedLayout> {
        let file = self.get_local_file(&layout_id.to_string(), "layout").await?;
        Some(ResolvedLayout { url: self.local_url(&file.name), name: file.name })
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Cap interrupts at their shareOfVoice seconds per hour instead of one
    /// commit per pass.
    pub share_of_voice_targets: bool,
}

/// Result of one `assess()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assessment {
    /// Another assessment was running; nothing was done.
    Skipped,
    Unchanged,
    Changed,
}

impl Assessment {
    pub fn has_changed(self) -> bool {
        self == Assessment::Changed
    }
}

#[derive(Debug, Default)]
struct PlayCounts {
    /// `(date, hour)` the counters belong to.
    hour: Option<(time::Date, u8)>,
    counts: HashMap<i64, u32>,
}

impl PlayCounts {
    fn roll(&mut self, now: PrimitiveDateTime) {
        let key = (now.date(), now.hour());
        if self.hour != Some(key) {
            if self.hour.is_some() {
                debug!("hour changed, resetting play counts");
            }
            self.counts.clear();
            self.hour = Some(key);
        }
    }
}

pub struct ScheduleEngine {
    clock: Arc<dyn Clock>,
    options: EngineOptions,
    predicates: Predicates,
    schedule: RwLock<Arc<Schedule>>,
    current: RwLock<Arc<PlaybackLoop>>,
    plays: Mutex<PlayCounts>,
    max_plays_watch: Mutex<HashSet<i64>>,
    location: RwLock<Option<(f64, f64)>>,
    current_layout: RwLock<Option<i64>>,
    assessing: AtomicBool,
    loop_tx: watch::Sender<Arc<PlaybackLoop>>,
}

impl ScheduleEngine {
    pub fn new(clock: Arc<dyn Clock>, options: EngineOptions, predicates: Predicates) -> Self {
        let splash = Arc::new(PlaybackLoop::splash());
        let (loop_tx, _) = watch::channel(Arc::clone(&splash));
        Self {
            clock,
            options,
            predicates,
            schedule: RwLock::new(Arc::new(Schedule::default())),
            current: RwLock::new(splash),
            plays: Mutex::new(PlayCounts::default()),
            max_plays_watch: Mutex::new(HashSet::new()),
            location: RwLock::new(None),
            current_layout: RwLock::new(None),
            assessing: AtomicBool::new(false),
            loop_tx,
        }
    }

    /// Replace the schedule snapshot. Takes effect on the next assessment.
    pub fn update(&self, schedule: Schedule) {
        info!(layouts = schedule.layouts.len(), "schedule updated");
        *self.schedule.write() = Arc::new(schedule);
    }

    pub fn schedule(&self) -> Arc<Schedule> {
        self.schedule.read().clone()
    }

    pub fn set_location(&self, location: Option<(f64, f64)>) {
        *self.location.write() = location;
    }

    /// Loop changes, starting with the current loop.
    pub fn subscribe(&self) -> watch::Receiver<Arc<PlaybackLoop>> {
        self.loop_tx.subscribe()
    }

    pub fn current_loop(&self) -> Arc<PlaybackLoop> {
        self.current.read().clone()
    }

    /// Summary of the current loop for status displays.
    pub fn loop_status(&self) -> String {
        self.current.read().status()
    }

    /// Layout the renderer reported as showing.
    pub fn current_layout(&self) -> Option<i64> {
        *self.current_layout.read()
    }

    pub fn set_current_layout(&self, layout_id: Option<i64>) {
        *self.current_layout.write() = layout_id;
    }

    pub fn play_count(&self, schedule_id: i64) -> u32 {
        let mut plays = self.plays.lock();
        plays.roll(self.clock.now());
        plays.counts.get(&schedule_id).copied().unwrap_or(0)
    }

    /// Record a play of `schedule_id`. Returns `true` when the schedule has a
    /// max-plays limit and an assessment was run because of it.
    pub fn increment_play_count(&self, schedule_id: i64) -> bool {
        {
            let mut plays = self.plays.lock();
            plays.roll(self.clock.now());
            *plays.counts.entry(schedule_id).or_insert(0) += 1;
        }

        let watched = self.max_plays_watch.lock().contains(&schedule_id);
        if watched {
            debug!(schedule_id, "play count changed for a max-plays schedule, reassessing");
            self.assess();
        }
        watched
    }

    /// Resolve the schedule into a loop and publish it if it changed.
    pub fn assess(&self) -> Assessment {
        if self
            .assessing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("assessment already running, skipping");
            return Assessment::Skipped;
        }

        let next = self.resolve();
        let outcome = self.publish(next);

        self.assessing.store(false, Ordering::Release);
        outcome
    }

    fn resolve(&self) -> PlaybackLoop {
        let schedule = self.schedule();
        if schedule.is_empty() {
            debug!("no layouts and no default, splash only");
            return PlaybackLoop::splash();
        }

        let ctx = AssessContext { now: self.clock.now(), location: *self.location.read() };
        let survivors = self.eligible(&schedule, &ctx);

        let (mut normal, mut interrupts): (Vec<Layout>, Vec<Layout>) =
            survivors.into_iter().partition(|l| !l.is_interrupt());
        let mut normal_items: Vec<LoopItem> = normal.iter().cloned().map(LoopItem::scheduled).collect();

        if normal.is_empty() {
            if let Some(default) = schedule.default_layout.as_ref().filter(|d| d.is_valid()) {
                debug!(layout = default.file, "no normal layouts, using default");
                normal.push(default.to_layout());
                normal_items.push(LoopItem::default_layout(default));
            }
        }

        if interrupts.is_empty() {
            return PlaybackLoop::from_items(normal_items);
        }

        debug!(interrupts = interrupts.len(), "weaving interrupts into the hour");
        // When the default was seeded it is the whole normal pool.
        let seeded_default = normal_items.iter().any(|i| i.kind == LoopItemKind::Default);
        let woven = weave::weave(&normal, &mut interrupts, self.options.share_of_voice_targets);
        let items = woven
            .into_iter()
            .map(|l| {
                if seeded_default && !l.is_interrupt() {
                    LoopItem { kind: LoopItemKind::Default, layout: l }
                } else {
                    LoopItem::scheduled(l)
                }
            })
            .collect();
        PlaybackLoop::from_items(items)
    }

    /// Scheduled layouts that may play now, highest priority tier only,
    /// in schedule order.
    fn eligible(&self, schedule: &Schedule, ctx: &AssessContext) -> Vec<Layout> {
        let mut accepted: Vec<Layout> = Vec::new();
        let mut max_priority = 0i64;

        let mut plays = self.plays.lock();
        plays.roll(ctx.now);

        for layout in &schedule.layouts {
            if !layout.is_current(ctx.now) {
                continue;
            }
            if !self.predicates.accepts(layout, ctx) {
                continue;
            }

            if layout.max_plays_per_hour > 0 {
                self.max_plays_watch.lock().insert(layout.schedule_id);
                let played = plays.counts.get(&layout.schedule_id).copied().unwrap_or(0);
                if played >= layout.max_plays_per_hour {
                    debug!(layout = layout.file, played, "max plays per hour reached");
                    continue;
                }
            }

            if layout.priority > max_priority {
                accepted.clear();
                max_priority = layout.priority;
            } else if layout.priority < max_priority {
                continue;
            }

            let mut layout = layout.clone();
            layout.interrupt_committed_duration = 0;
            accepted.push(layout);
        }

        accepted
    }

    fn publish(&self, next: PlaybackLoop) -> Assessment {
        let changed = {
            let current = self.current.read();
            current.layout_ids() != next.layout_ids()
        };

        if !changed {
            debug!("assessment finished, no change");
            return Assessment::Unchanged;
        }

        let next = Arc::new(next);
        info!(status = %next.status(), "playback loop changed");
        *self.current.write() = Arc::clone(&next);
        self.loop_tx.send_replace(next);
        Assessment::Changed
    }

    /// Current loop resolved to renderer entries. Layouts whose file is not
    /// in the cache are left out; if none remain the splash is returned.
    pub async fn layout_loop(&self, resolver: &dyn LayoutResolver) -> Vec<RendererEntry> {
        let current = self.current_loop();
        let mut entries = Vec::with_capacity(current.len());
        for item in current.items() {
            if item.is_splash() {
                entries.push(RendererEntry::splash());
                continue;
            }
            match resolver.resolve_layout(item.layout_id()).await {
                Some(file) => entries.push(RendererEntry {
                    layout_id: item.layout_id(),
                    path: file.url,
                    short_path: file.name,
                    response: item.layout.response.clone(),
                }),
                None => debug!(layout = item.layout_id(), "layout file not cached, leaving it out"),
            }
        }

        if entries.is_empty() {
            entries.push(RendererEntry::splash());
        }
        entries
    }

    /// Re-assess every `interval` until cancelled.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        self.assess();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    self.assess();
                }
            }
        }
        debug!("assessment loop stopped");
    }
}
