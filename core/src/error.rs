//! Error types for replay recording, playback, checkpoints and undo

use std::path::PathBuf;

use thiserror::Error;

use crate::control::SessionMode;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, ReplayError>;

/// Unified error type for the replay subsystem
#[derive(Debug, Error)]
pub enum ReplayError {
    /// The file is not a replay, or is a replay this build cannot read
    #[error(transparent)]
    Format(#[from] FormatError),

    /// The replay was recorded against different content
    #[error("content checksum mismatch: expected {expected:#010x}, recorded {recorded:#010x}")]
    ContentMismatch { expected: u32, recorded: u32 },

    #[error(transparent)]
    Io(#[from] IoError),

    /// A snapshot or diff table could not be allocated
    #[error("failed to allocate {bytes} bytes")]
    Allocation { bytes: usize },

    /// The task was cancelled before it produced a session
    #[error("operation cancelled")]
    Cancelled,

    /// The frame is not (or no longer) addressable through the frame index
    #[error("frame {frame} out of range (seekable frames {oldest}..{next})")]
    OutOfRange { frame: u64, oldest: u64, next: u64 },

    /// A checkpoint record or frame record is corrupt
    #[error("corrupt checkpoint: {0}")]
    Checkpoint(String),

    /// A session of this mode is already active or a start/stop is pending
    #[error("a {mode} session is already active or pending")]
    SessionBusy { mode: SessionMode },

    /// The session was already stopped or aborted
    #[error("session is closed")]
    SessionClosed,

    /// A save state from outside the active session
    #[error("save state does not belong to the active {mode} session")]
    ForeignState { mode: SessionMode },

    /// The emulation core refused to serialize or deserialize its state
    #[error("core error: {0}")]
    Core(String),
}

/// Header decoding failures
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("not a replay file (magic {found:#010x})")]
    NotAReplayFile { found: u32 },

    #[error("unsupported replay version {found} (max {max})")]
    UnsupportedVersion { found: u32, max: u32 },

    #[error("replay header truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("save state replay block declares {declared} bytes, has {available}")]
    StateBlock { declared: u64, available: usize },
}

/// Byte-stream failures, tagged with what was being attempted
#[derive(Debug, Error)]
pub enum IoError {
    #[error("failed to open {}: {source}", path.display())]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("read failed: {0}")]
    ReadFailed(#[source] std::io::Error),

    #[error("write failed: {0}")]
    WriteFailed(#[source] std::io::Error),

    #[error("seek to {offset} is past end of stream ({len} bytes)")]
    SeekOutOfRange { offset: u64, len: u64 },
}

impl ReplayError {
    pub(crate) fn read(e: std::io::Error) -> Self {
        Self::Io(IoError::ReadFailed(e))
    }

    pub(crate) fn write(e: std::io::Error) -> Self {
        Self::Io(IoError::WriteFailed(e))
    }

    /// True when the operation was cancelled rather than failed
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
