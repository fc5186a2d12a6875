//! Checkpoint commit record codec
//!
//! On-disk layout (big-endian):
//! ```text
//! compression: u8 | flags: u8 | frame: u64 | changed_blocks: u32
//! raw_len: u32 | stored_len: u32 | body[stored_len]
//! ```
//! The raw body is `changed_blocks` repetitions of `block_index: u32`
//! followed by the block bytes. Compression covers the whole body.

use std::io::{self, Read, Write};

use bitflags::bitflags;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use lz4_flex::{compress_prepend_size, decompress_size_prepended};

use super::{BlockLayout, Compression};
use crate::error::{ReplayError, Result};
use crate::io::len_u32;

bitflags! {
    /// Flags byte of a commit record
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommitFlags: u8 {
        /// Every block of the snapshot is present
        const FULL = 0b0000_0001;
    }
}

/// Fixed-size prefix of a commit record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitHeader {
    pub compression: Compression,
    pub flags: CommitFlags,
    pub frame: u64,
    pub changed_blocks: u32,
    pub raw_len: u32,
    pub stored_len: u32,
}

impl CommitHeader {
    pub const LEN: u64 = 22;

    pub fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        let selector = reader.read_u8().map_err(ReplayError::read)?;
        let compression = Compression::from_selector(selector).ok_or_else(|| {
            ReplayError::Checkpoint(format!("unknown compression selector {selector}"))
        })?;
        let bits = reader.read_u8().map_err(ReplayError::read)?;
        let flags = CommitFlags::from_bits(bits)
            .ok_or_else(|| ReplayError::Checkpoint(format!("unknown commit flags {bits:#04x}")))?;
        let frame = reader.read_u64::<BigEndian>().map_err(ReplayError::read)?;
        let changed_blocks = reader.read_u32::<BigEndian>().map_err(ReplayError::read)?;
        let raw_len = reader.read_u32::<BigEndian>().map_err(ReplayError::read)?;
        let stored_len = reader.read_u32::<BigEndian>().map_err(ReplayError::read)?;
        if compression == Compression::None && raw_len != stored_len {
            return Err(ReplayError::Checkpoint(format!(
                "uncompressed body length {stored_len} != {raw_len}"
            )));
        }
        Ok(Self {
            compression,
            flags,
            frame,
            changed_blocks,
            raw_len,
            stored_len,
        })
    }

    /// Total encoded size of the record, header included
    pub fn record_len(&self) -> u64 {
        Self::LEN + u64::from(self.stored_len)
    }
}

/// A committed checkpoint: the blocks that changed, in index order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    /// Frame whose starting state this checkpoint holds
    pub frame: u64,
    pub flags: CommitFlags,
    pub changed_blocks: u32,
    /// Uncompressed body
    pub body: Vec<u8>,
}

impl CommitRecord {
    pub fn is_full(&self) -> bool {
        self.flags.contains(CommitFlags::FULL)
    }

    /// Encode the record, compressing the body as a whole
    ///
    /// Falls back to an uncompressed body when compression does not shrink it.
    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W, compression: Compression) -> io::Result<()> {
        let compressed = match compression {
            Compression::Lz4 => Some(compress_prepend_size(&self.body)),
            Compression::None => None,
        };
        let (selector, stored): (Compression, &[u8]) = match &compressed {
            Some(bytes) if bytes.len() < self.body.len() => (Compression::Lz4, bytes),
            _ => (Compression::None, &self.body),
        };

        let raw_len = len_u32(self.body.len(), "checkpoint body")?;
        let stored_len = len_u32(stored.len(), "stored checkpoint body")?;
        writer.write_u8(selector.selector())?;
        writer.write_u8(self.flags.bits())?;
        writer.write_u64::<BigEndian>(self.frame)?;
        writer.write_u32::<BigEndian>(self.changed_blocks)?;
        writer.write_u32::<BigEndian>(raw_len)?;
        writer.write_u32::<BigEndian>(stored_len)?;
        writer.write_all(stored)
    }

    /// Decode a full record
    pub fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        let header = CommitHeader::read_from(reader)?;
        Self::read_body(header, reader)
    }

    /// Decode the body that follows an already-read header
    pub fn read_body<R: Read + ?Sized>(header: CommitHeader, reader: &mut R) -> Result<Self> {
        let stored_len = header.stored_len as usize;
        let mut stored = Vec::new();
        stored
            .try_reserve_exact(stored_len)
            .map_err(|_| ReplayError::Allocation { bytes: stored_len })?;
        stored.resize(stored_len, 0);
        reader.read_exact(&mut stored).map_err(ReplayError::read)?;

        let body = match header.compression {
            Compression::None => stored,
            Compression::Lz4 => {
                // lz4_flex prepends the raw size little-endian; check it before it allocates
                let declared = stored
                    .get(..4)
                    .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]));
                if declared != Some(header.raw_len) {
                    return Err(ReplayError::Checkpoint("compressed size prefix mismatch".into()));
                }
                decompress_size_prepended(&stored)
                    .map_err(|e| ReplayError::Checkpoint(format!("lz4: {e}")))?
            }
        };
        if body.len() != header.raw_len as usize {
            return Err(ReplayError::Checkpoint(format!(
                "body length {} != declared {}",
                body.len(),
                header.raw_len
            )));
        }

        Ok(Self {
            frame: header.frame,
            flags: header.flags,
            changed_blocks: header.changed_blocks,
            body,
        })
    }

    /// Copy every block in the record into `snapshot`
    pub fn apply(&self, snapshot: &mut [u8], layout: BlockLayout) -> Result<()> {
        let len = snapshot.len();
        self.walk(layout, len, |index, bytes| {
            let range = layout.block_range(index as usize, len);
            snapshot[range].copy_from_slice(bytes);
        })
    }

    /// Indices of the blocks carried by this record
    pub fn block_indices(&self, layout: BlockLayout, snapshot_len: usize) -> Result<Vec<u32>> {
        let mut indices = Vec::with_capacity(self.changed_blocks as usize);
        self.walk(layout, snapshot_len, |index, _| indices.push(index))?;
        Ok(indices)
    }

    fn walk(&self, layout: BlockLayout, snapshot_len: usize, mut visit: impl FnMut(u32, &[u8])) -> Result<()> {
        let block_count = layout.block_count(snapshot_len);
        if self.is_full() && self.changed_blocks as usize != block_count {
            return Err(ReplayError::Checkpoint(format!(
                "full commit carries {} of {} blocks",
                self.changed_blocks, block_count
            )));
        }

        let mut body = self.body.as_slice();
        for _ in 0..self.changed_blocks {
            let index = body
                .read_u32::<BigEndian>()
                .map_err(|_| ReplayError::Checkpoint("body ends inside a block index".into()))?;
            if index as usize >= block_count {
                return Err(ReplayError::Checkpoint(format!(
                    "block {index} out of range ({block_count} blocks)"
                )));
            }
            let size = layout.block_range(index as usize, snapshot_len).len();
            if body.len() < size {
                return Err(ReplayError::Checkpoint(format!("block {index} truncated")));
            }
            let (bytes, rest) = body.split_at(size);
            visit(index, bytes);
            body = rest;
        }
        if !body.is_empty() {
            return Err(ReplayError::Checkpoint(format!(
                "{} trailing bytes after last block",
                body.len()
            )));
        }
        Ok(())
    }
}
