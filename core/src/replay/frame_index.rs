//! Frame position index
//!
//! Power-of-two ring of file offsets, one per recorded frame. Once more than
//! `capacity` frames have been recorded only the most recent `capacity`
//! remain seekable.

use crate::error::{ReplayError, Result};

#[derive(Debug, Clone)]
pub struct FrameIndex {
    offsets: Vec<u64>,
    mask: u64,
    next_frame: u64,
    /// Oldest frame whose slot has not been overwritten; never moves back
    oldest: u64,
    min_offset: u64,
}

impl FrameIndex {
    /// Allocate a ring of `1 << capacity_log2` entries
    ///
    /// `min_offset` is the first byte after the header and prelude; frame 0
    /// always starts there.
    pub fn new(capacity_log2: u32, min_offset: u64) -> Result<Self> {
        let capacity = 1usize << capacity_log2;
        let mut offsets = Vec::new();
        offsets
            .try_reserve_exact(capacity)
            .map_err(|_| ReplayError::Allocation {
                bytes: capacity * std::mem::size_of::<u64>(),
            })?;
        offsets.resize(capacity, 0);
        offsets[0] = min_offset;
        Ok(Self {
            offsets,
            mask: capacity as u64 - 1,
            next_frame: 0,
            oldest: 0,
            min_offset,
        })
    }

    pub fn capacity(&self) -> u64 {
        self.mask + 1
    }

    pub fn min_offset(&self) -> u64 {
        self.min_offset
    }

    /// Move the start of frame 0, before any frame is recorded
    pub(crate) fn set_min_offset(&mut self, offset: u64) {
        debug_assert_eq!(self.next_frame, 0);
        self.min_offset = offset;
        self.offsets[0] = offset;
    }

    /// Number of frames recorded (the index the next frame will get)
    pub fn next_frame(&self) -> u64 {
        self.next_frame
    }

    /// Oldest frame whose offset is still retained
    pub fn oldest_frame(&self) -> u64 {
        self.oldest
    }

    /// Record where the next frame starts and return its frame number
    pub fn record_frame_start(&mut self, offset: u64) -> u64 {
        let frame = self.next_frame;
        self.offsets[(frame & self.mask) as usize] = offset;
        self.next_frame += 1;
        if self.next_frame - self.oldest > self.capacity() {
            self.oldest = self.next_frame - self.capacity();
        }
        frame
    }

    /// Start offset of `frame`
    pub fn offset_for_frame(&self, frame: u64) -> Result<u64> {
        if frame < self.oldest_frame() || frame >= self.next_frame {
            return Err(ReplayError::OutOfRange {
                frame,
                oldest: self.oldest_frame(),
                next: self.next_frame,
            });
        }
        Ok(self.offsets[(frame & self.mask) as usize])
    }

    /// Forget `frame` and everything after it
    ///
    /// Frames overwritten by a wrapped ring stay unreachable afterwards.
    pub fn truncate_to(&mut self, frame: u64) -> Result<()> {
        if frame != self.next_frame {
            self.offset_for_frame(frame)?;
        }
        self.next_frame = frame;
        if frame == 0 {
            self.offsets[0] = self.min_offset;
        }
        Ok(())
    }
}
