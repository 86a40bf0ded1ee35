// signage-engine
//
// Unattended background engine of a digital-signage player:
//   - talk to the CMS over XMDS on a timer (session)
//   - keep a local library of content files (cache)
//   - resolve the schedule into a playback loop (schedule)
//
// Drawing layouts is somebody else's job; they consume `schedule::RendererEntry`.

pub mod cache;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod logs;
pub mod player;
pub mod schedule;
pub mod server;
pub mod session;
pub mod stats;
pub mod xmds;
