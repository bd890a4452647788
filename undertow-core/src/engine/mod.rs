//! Streaming engine actor.
//!
//! One actor owns the torrent registry; callers talk to it through a
//! cloneable `EngineHandle`. Each started torrent runs its own session task
//! that drives the swarm, scheduler and playback cursor.

mod actor;
mod commands;
mod handle;
mod session;

pub use actor::spawn_engine;
pub use commands::{FileStatus, TorrentState, TorrentStatus};
pub use handle::EngineHandle;
