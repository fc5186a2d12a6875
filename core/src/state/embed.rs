//! Replay block carried by save states
//!
//! A state saved while a session is active is the core snapshot followed by
//! ```text
//! tag: "RPLY" | len: u32 (big-endian) | replay[len]
//! ```
//! where `replay` is the session's replay up to the saved frame. States
//! without the tag are a bare snapshot.

use std::io;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use crate::error::{FormatError, Result};
use crate::io::len_u32;
use crate::replay::SessionHeader;

const TAG: [u8; 4] = *b"RPLY";
const PREFIX_LEN: usize = 8;

/// The replay inside a loaded save state
#[derive(Debug, Clone, Copy)]
pub struct EmbeddedReplay<'a> {
    pub header: SessionHeader,
    pub bytes: &'a [u8],
}

impl EmbeddedReplay<'_> {
    pub fn session_id(&self) -> i64 {
        self.header.session_id
    }

    /// Frame the state was saved at
    pub fn frame(&self) -> u64 {
        u64::from(self.header.frame_count)
    }
}

/// Append a replay block to a serialized snapshot
pub(crate) fn append(state: &mut Vec<u8>, replay: &[u8]) -> io::Result<()> {
    let len = len_u32(replay.len(), "embedded replay")?;
    state.extend_from_slice(&TAG);
    state.write_u32::<BigEndian>(len)?;
    state.extend_from_slice(replay);
    Ok(())
}

/// Separate the core snapshot from the replay block, if there is one
pub(crate) fn split(state: &[u8], snapshot_size: usize) -> Result<(&[u8], Option<EmbeddedReplay<'_>>)> {
    let Some(block) = state.get(snapshot_size..).filter(|b| b.starts_with(&TAG)) else {
        return Ok((state, None));
    };
    let snapshot = &state[..snapshot_size];
    let Some(len) = block.get(TAG.len()..PREFIX_LEN).map(BigEndian::read_u32) else {
        return Err(FormatError::StateBlock {
            declared: 0,
            available: block.len(),
        }
        .into());
    };
    let replay = &block[PREFIX_LEN..];
    if replay.len() as u64 != u64::from(len) {
        return Err(FormatError::StateBlock {
            declared: u64::from(len),
            available: replay.len(),
        }
        .into());
    }
    let header = SessionHeader::decode(replay)?;
    Ok((
        snapshot,
        Some(EmbeddedReplay {
            header,
            bytes: replay,
        }),
    ))
}
