//! Statestream Core - deterministic replay and incremental save states
//!
//! This crate records a stream of per-frame inputs so a session can be
//! reproduced exactly, and captures, diffs and restores snapshots of
//! emulated-machine memory.
//!
//! # Architecture
//!
//! - [`replay`] - Binary replay format, recording and playback sessions
//! - [`replay::CheckpointDiffer`] - Block/superblock diffing of snapshots
//! - [`state`] - Save states with one level of undo, carrying the active replay
//! - [`control`] - Scheduled start/stop of sessions and the session registry
//! - [`CoreMemory`] - Trait implemented by the emulation core

pub mod config;
pub mod control;
pub mod error;
#[cfg(test)]
mod integration;
pub mod io;
pub mod machine;
pub mod notify;
pub mod replay;
pub mod state;
pub mod task;
#[cfg(test)]
pub mod test_utils;

// Re-export core traits and types
pub use config::ReplayConfig;
pub use control::{ControlEnv, MovieTasks, Operation, SessionMode, SessionRegistry, TaskReport};
pub use error::{FormatError, IoError, ReplayError, Result};
pub use io::{ByteStream, FileSystem, MemoryStreams, OpenMode, StreamProvider};
pub use machine::CoreMemory;
pub use notify::{LogNotifier, Notification, NotificationLog, Notifier};
pub use task::{Completion, Progress, Task, TaskHandle, TaskQueue, TaskState};

// Re-export replay types
pub use replay::{
    CheckpointPolicy, Compression, NextFrame, PlaybackSession, PlayerConfig, RecordSession,
    RecorderConfig, SessionHeader,
};

// Re-export save state types
pub use state::{
    EmbeddedReplay, UndoBuffer, UndoBuffers, load_state, save_state, undo_load_state,
    undo_save_state,
};
