// Hourly interleaving of interrupt layouts with normal layouts.

use crate::xmds::Layout;

/// Length of the window interrupts compete for, in seconds.
pub const HOUR_SECS: u64 = 3600;

/// Whether an interrupt has had its share for this pass.
///
/// By default an interrupt is satisfied once it has been committed once
/// (its own duration), so each interrupt is placed once per pass. With
/// `sov_targets` it is satisfied once its committed seconds reach its
/// `shareOfVoice`.
fn satisfied(layout: &Layout, sov_targets: bool) -> bool {
    if sov_targets {
        layout.duration == 0 || layout.interrupt_committed_duration >= layout.share_of_voice
    } else {
        layout.duration == 0 || layout.interrupt_committed_duration >= layout.duration
    }
}

/// Commit interrupts round-robin until all are satisfied or the hour is
/// full. Returns the picks and the committed seconds.
fn commit_interrupts(interrupts: &mut [Layout], sov_targets: bool) -> (Vec<Layout>, u64) {
    for l in interrupts.iter_mut() {
        l.interrupt_committed_duration = 0;
    }

    let mut picks = Vec::new();
    let mut seconds = 0u64;
    if interrupts.is_empty() {
        return (picks, seconds);
    }

    let mut index = 0;
    loop {
        if index >= interrupts.len() {
            index = 0;
            if interrupts.iter().all(|l| satisfied(l, sov_targets)) {
                break;
            }
        }

        let layout = &mut interrupts[index];
        if !satisfied(layout, sov_targets) {
            layout.interrupt_committed_duration += layout.duration;
            seconds += layout.duration;
            picks.push(layout.clone());
            if seconds >= HOUR_SECS {
                break;
            }
        }
        index += 1;
    }

    (picks, seconds)
}

/// Normal layouts, wrapping, until `target` seconds are covered.
fn fill_normal(normal: &[Layout], target: u64) -> Vec<Layout> {
    let total: u64 = normal.iter().map(|l| l.duration).sum();
    if total == 0 {
        return normal.to_vec();
    }

    let mut out = Vec::new();
    let mut remaining = target as i64;
    let mut index = 0;
    while remaining > 0 {
        let layout = &normal[index % normal.len()];
        remaining -= layout.duration as i64;
        out.push(layout.clone());
        index += 1;
    }
    out
}

/// Build one hour of playback from the normal and interrupt pools.
pub fn weave(normal: &[Layout], interrupts: &mut [Layout], sov_targets: bool) -> Vec<Layout> {
    let (resolved_interrupts, interrupt_seconds) = commit_interrupts(interrupts, sov_targets);

    if interrupt_seconds >= HOUR_SECS || normal.is_empty() {
        return resolved_interrupts;
    }
    if resolved_interrupts.is_empty() {
        return normal.to_vec();
    }

    let resolved_normal = fill_normal(normal, HOUR_SECS - interrupt_seconds);

    let pick_count = resolved_interrupts.len().max(resolved_normal.len());
    let normal_pick = pick_count.div_ceil(resolved_normal.len()).max(1);
    let interrupt_pick = (pick_count / resolved_interrupts.len()).max(1);

    let mut out = Vec::with_capacity(pick_count * 2);
    let mut allocated = 0u64;
    let mut normal_index = 0;
    let mut interrupt_index = 0;

    for i in 0..pick_count {
        if i % normal_pick == 0 {
            let layout = &resolved_normal[normal_index % resolved_normal.len()];
            allocated += layout.duration;
            out.push(layout.clone());
            normal_index += 1;
        }
        if i % interrupt_pick == 0 && interrupt_index < resolved_interrupts.len() {
            let layout = &resolved_interrupts[interrupt_index];
            allocated += layout.duration;
            out.push(layout.clone());
            interrupt_index += 1;
        }
    }

    if resolved_normal.iter().any(|l| l.duration > 0) {
        while allocated < HOUR_SECS {
            let layout = &resolved_normal[normal_index % resolved_normal.len()];
            allocated += layout.duration;
            out.push(layout.clone());
            normal_index += 1;
        }
    }

    out
}
