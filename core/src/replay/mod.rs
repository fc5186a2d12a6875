//! Input replay with incremental checkpoints
//!
//! A replay file is a header, an optional full checkpoint of the initial
//! machine state, then one record per frame:
//!
//! ```text
//! ┌────────────┬─────────────────┬──────────┬──────────┬─────┐
//! │ header     │ prelude (full   │ frame 0  │ frame 1  │ ... │
//! │ 28/40 B    │ checkpoint)     │          │          │     │
//! └────────────┴─────────────────┴──────────┴──────────┴─────┘
//! ```
//!
//! A frame record carries the frame's input and, when the commit policy
//! fires, a checkpoint of the blocks that changed since the previous one.
//!
//! # Usage
//!
//! ## Recording
//!
//! ```ignore
//! use statestream_core::replay::{RecordSession, RecorderConfig};
//!
//! let config = RecorderConfig::new(content_checksum, &replay_config);
//! let mut session = RecordSession::start(&FileSystem, path, &config, &mut core)?;
//!
//! // Each frame, before the core runs it:
//! session.record_input_frame(&input, &mut core)?;
//!
//! session.stop()?;
//! ```
//!
//! ## Playback
//!
//! ```ignore
//! use statestream_core::replay::{NextFrame, PlaybackSession, PlayerConfig};
//!
//! let config = PlayerConfig::new(content_checksum, &replay_config);
//! let mut session = PlaybackSession::start(&FileSystem, path, &config)?;
//!
//! while let NextFrame::Input(input) = session.next_input_frame(&mut core)? {
//!     // Run the frame with `input`
//! }
//! ```

pub mod checkpoint;
mod frame;
pub mod frame_index;
pub mod header;
pub mod player;
pub mod recorder;

pub use checkpoint::{
    BlockLayout, CheckpointDiffer, CheckpointPolicy, CommitFlags, CommitRecord, Compression,
    DifferState,
};
pub use frame::FrameToken;
pub use frame_index::FrameIndex;
pub use header::{FORMAT_VERSION, MAGIC, SessionHeader};
pub use player::{NextFrame, PlaybackSession, PlayerConfig};
pub use recorder::{RecordSession, RecorderConfig};
