//! Block/superblock diff table over a snapshot buffer

use xxhash_rust::xxh3::xxh3_64;

use super::{BlockLayout, CheckpointPolicy, CommitFlags, CommitRecord};
use crate::error::{ReplayError, Result};

/// Lifecycle of a differ within one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifferState {
    /// Table allocated, no baseline yet; the next commit is full
    Uninitialized,
    /// Signatures match the last committed snapshot
    Baseline,
    /// A commit is being built; if left here, the table is stale
    Committing,
}

/// Tracks which blocks of a snapshot changed since the last commit
#[derive(Debug)]
pub struct CheckpointDiffer {
    layout: BlockLayout,
    policy: CheckpointPolicy,
    snapshot_size: usize,
    block_sigs: Vec<u64>,
    superblock_sigs: Vec<u64>,
    state: DifferState,
}

fn zeroed_table(len: usize) -> Result<Vec<u64>> {
    let mut table = Vec::new();
    table
        .try_reserve_exact(len)
        .map_err(|_| ReplayError::Allocation {
            bytes: len * std::mem::size_of::<u64>(),
        })?;
    table.resize(len, 0);
    Ok(table)
}

impl CheckpointDiffer {
    /// Allocate a diff table sized for `snapshot_size`
    pub fn initialize(snapshot_size: usize, policy: CheckpointPolicy) -> Result<Self> {
        Self::with_layout(snapshot_size, BlockLayout::for_snapshot(snapshot_size), policy)
    }

    pub fn with_layout(snapshot_size: usize, layout: BlockLayout, policy: CheckpointPolicy) -> Result<Self> {
        let block_sigs = zeroed_table(layout.block_count(snapshot_size))?;
        let superblock_sigs = zeroed_table(layout.superblock_count(snapshot_size))?;
        Ok(Self {
            layout,
            policy,
            snapshot_size,
            block_sigs,
            superblock_sigs,
            state: DifferState::Uninitialized,
        })
    }

    pub fn layout(&self) -> BlockLayout {
        self.layout
    }

    pub fn policy(&self) -> CheckpointPolicy {
        self.policy
    }

    pub fn state(&self) -> DifferState {
        self.state
    }

    pub fn snapshot_size(&self) -> usize {
        self.snapshot_size
    }

    pub fn block_count(&self) -> usize {
        self.block_sigs.len()
    }

    /// Forget the baseline so the next commit is full
    pub fn invalidate(&mut self) {
        self.state = DifferState::Uninitialized;
    }

    /// Count blocks that differ from the last commit, without committing
    pub fn changed_block_count(&self, snapshot: &[u8]) -> Result<usize> {
        Ok(self.changed_blocks(snapshot)?.len())
    }

    /// Indices of blocks that differ from the last commit
    ///
    /// Superblocks whose signature is unchanged are skipped without hashing
    /// their blocks. Before the first commit every block counts as changed.
    pub fn changed_blocks(&self, snapshot: &[u8]) -> Result<Vec<u32>> {
        self.check_size(snapshot)?;
        if self.state != DifferState::Baseline {
            return Ok((0..self.block_sigs.len() as u32).collect());
        }

        let per_super = self.layout.blocks_per_superblock as usize;
        let mut changed = Vec::new();
        for (sb, &stored) in self.superblock_sigs.iter().enumerate() {
            let range = self.layout.superblock_range(sb, self.snapshot_size);
            if xxh3_64(&snapshot[range]) == stored {
                continue;
            }
            let first = sb * per_super;
            let last = (first + per_super).min(self.block_sigs.len());
            for block in first..last {
                let range = self.layout.block_range(block, self.snapshot_size);
                if xxh3_64(&snapshot[range]) != self.block_sigs[block] {
                    changed.push(block as u32);
                }
            }
        }
        Ok(changed)
    }

    /// Diff `snapshot` against the table, update it, and build a commit record
    pub fn commit(&mut self, snapshot: &[u8], frame: u64) -> Result<CommitRecord> {
        self.check_size(snapshot)?;
        let changed = self.changed_blocks(snapshot)?;
        self.state = DifferState::Committing;

        let full = changed.len() == self.block_sigs.len();
        let body_len: usize = changed
            .iter()
            .map(|&b| 4 + self.layout.block_range(b as usize, self.snapshot_size).len())
            .sum();
        let mut body = Vec::new();
        body.try_reserve_exact(body_len)
            .map_err(|_| ReplayError::Allocation { bytes: body_len })?;

        let per_super = self.layout.blocks_per_superblock as usize;
        let mut touched_superblock = None;
        for &block in &changed {
            let range = self.layout.block_range(block as usize, self.snapshot_size);
            let bytes = &snapshot[range];
            self.block_sigs[block as usize] = xxh3_64(bytes);
            body.extend_from_slice(&block.to_be_bytes());
            body.extend_from_slice(bytes);

            let sb = block as usize / per_super;
            if touched_superblock != Some(sb) {
                let range = self.layout.superblock_range(sb, self.snapshot_size);
                self.superblock_sigs[sb] = xxh3_64(&snapshot[range]);
                touched_superblock = Some(sb);
            }
        }

        self.state = DifferState::Baseline;
        tracing::debug!(
            "[Replay] checkpoint at frame {}: {} of {} blocks{}",
            frame,
            changed.len(),
            self.block_sigs.len(),
            if full { " (full)" } else { "" }
        );
        Ok(CommitRecord {
            frame,
            flags: if full { CommitFlags::FULL } else { CommitFlags::empty() },
            changed_blocks: changed.len() as u32,
            body,
        })
    }

    fn check_size(&self, snapshot: &[u8]) -> Result<()> {
        if snapshot.len() != self.snapshot_size {
            return Err(ReplayError::Checkpoint(format!(
                "snapshot size changed from {} to {}",
                self.snapshot_size,
                snapshot.len()
            )));
        }
        Ok(())
    }
}
