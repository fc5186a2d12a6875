//! Incremental checkpointing
//!
//! A snapshot is split into fixed-size blocks, grouped into superblocks.
//! The [`CheckpointDiffer`] tracks a signature per block and per superblock
//! and emits a [`CommitRecord`] holding only the blocks that changed since
//! the previous commit.

mod differ;
mod record;

use serde::{Deserialize, Serialize};

use crate::error::{ReplayError, Result};

pub use differ::{CheckpointDiffer, DifferState};
pub use record::{CommitFlags, CommitHeader, CommitRecord};

/// Largest commit interval the packed config word can hold
pub const MAX_COMMIT_INTERVAL: u32 = 0xFFFF;

/// Largest commit threshold the packed config word can hold
pub const MAX_COMMIT_THRESHOLD: u32 = 0xFFF;

/// Snapshots below this size use the small block layout
pub const SMALL_SNAPSHOT_LIMIT: usize = 1 << 20;

/// Compression applied to a commit record body
///
/// lz4 is the only compressor. Other selectors, such as zlib or zstd
/// written by other tools, are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Compression {
    None = 0,
    #[default]
    Lz4 = 1,
}

impl Compression {
    /// Decode a selector as stored on disk
    pub fn from_selector(selector: u8) -> Option<Self> {
        match selector {
            0 => Some(Self::None),
            1 => Some(Self::Lz4),
            _ => None,
        }
    }

    pub fn selector(self) -> u8 {
        self as u8
    }
}

/// When checkpoints are committed during recording
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointPolicy {
    /// Frames between commits (0 = never by interval)
    pub interval: u32,
    /// Changed blocks that force a commit (0 = never by threshold)
    pub threshold: u32,
    pub compression: Compression,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self {
            interval: 300,
            threshold: 256,
            compression: Compression::Lz4,
        }
    }
}

impl CheckpointPolicy {
    /// Build a policy, rejecting values the config word cannot store
    pub fn new(interval: u32, threshold: u32, compression: Compression) -> Result<Self> {
        if interval > MAX_COMMIT_INTERVAL {
            return Err(ReplayError::Checkpoint(format!(
                "commit interval {interval} exceeds {MAX_COMMIT_INTERVAL}"
            )));
        }
        if threshold > MAX_COMMIT_THRESHOLD {
            return Err(ReplayError::Checkpoint(format!(
                "commit threshold {threshold} exceeds {MAX_COMMIT_THRESHOLD}"
            )));
        }
        Ok(Self {
            interval,
            threshold,
            compression,
        })
    }

    /// Whether a commit is due
    pub fn should_commit(&self, frames_since_commit: u32, changed_blocks: usize) -> bool {
        (self.interval > 0 && frames_since_commit >= self.interval)
            || (self.threshold > 0 && changed_blocks >= self.threshold as usize)
    }

    /// True when only the interval can trigger a commit, so diffing each frame is wasted work
    pub fn interval_only(&self) -> bool {
        self.threshold == 0
    }

    /// Pack into the header's checkpoint config word
    ///
    /// Bits 0..4 compression, 4..16 threshold, 16..32 interval.
    pub fn to_word(&self) -> u32 {
        (self.interval.min(MAX_COMMIT_INTERVAL) << 16)
            | (self.threshold.min(MAX_COMMIT_THRESHOLD) << 4)
            | u32::from(self.compression.selector() & 0xF)
    }

    /// Unpack a config word; `None` if the compression selector is unknown
    pub fn from_word(word: u32) -> Option<Self> {
        Some(Self {
            interval: word >> 16,
            threshold: (word >> 4) & MAX_COMMIT_THRESHOLD,
            compression: Compression::from_selector((word & 0xF) as u8)?,
        })
    }
}

/// Block partitioning of a snapshot, fixed for the life of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    pub block_size: u32,
    pub blocks_per_superblock: u32,
}

impl BlockLayout {
    pub const SMALL: Self = Self {
        block_size: 128,
        blocks_per_superblock: 16,
    };
    pub const LARGE: Self = Self {
        block_size: 4096,
        blocks_per_superblock: 64,
    };

    /// Layout chosen from the snapshot size
    pub fn for_snapshot(snapshot_size: usize) -> Self {
        if snapshot_size < SMALL_SNAPSHOT_LIMIT {
            Self::SMALL
        } else {
            Self::LARGE
        }
    }

    /// Rebuild a layout from header fields
    pub fn from_sizes(block_size: u32, superblock_size: u32) -> Result<Self> {
        if block_size == 0 || superblock_size < block_size || superblock_size % block_size != 0 {
            return Err(ReplayError::Checkpoint(format!(
                "invalid block layout {block_size}/{superblock_size}"
            )));
        }
        Ok(Self {
            block_size,
            blocks_per_superblock: superblock_size / block_size,
        })
    }

    pub fn superblock_size(&self) -> u32 {
        self.block_size * self.blocks_per_superblock
    }

    /// Number of blocks covering `snapshot_size` bytes; the last may be short
    pub fn block_count(&self, snapshot_size: usize) -> usize {
        snapshot_size.div_ceil(self.block_size as usize)
    }

    pub fn superblock_count(&self, snapshot_size: usize) -> usize {
        self.block_count(snapshot_size)
            .div_ceil(self.blocks_per_superblock as usize)
    }

    /// Byte range of block `index` within a snapshot
    pub fn block_range(&self, index: usize, snapshot_size: usize) -> std::ops::Range<usize> {
        let start = (index * self.block_size as usize).min(snapshot_size);
        let end = (start + self.block_size as usize).min(snapshot_size);
        start..end
    }

    /// Byte range of superblock `index` within a snapshot
    pub fn superblock_range(&self, index: usize, snapshot_size: usize) -> std::ops::Range<usize> {
        let size = self.superblock_size() as usize;
        let start = (index * size).min(snapshot_size);
        let end = (start + size).min(snapshot_size);
        start..end
    }
}
