//! Session header codec
//!
//! Layout (big-endian):
//! ```text
//! 0   magic "BSV2"      | 4  version        | 8  content checksum
//! 12  snapshot size     | 16 frame count    | 20 session id (i64)
//! 28  block size        | 32 superblock size | 36 checkpoint config word
//! ```
//! Versions before 2 end at offset 28.

use std::io::{Read, Seek, SeekFrom};

use byteorder::{BigEndian, ByteOrder};

use super::checkpoint::{BlockLayout, CheckpointPolicy};
use crate::error::{FormatError, ReplayError, Result};
use crate::io::ByteStream;

/// Magic bytes at offset 0
pub const MAGIC: [u8; 4] = *b"BSV2";

/// Version written by this build, and the highest it reads
pub const FORMAT_VERSION: u32 = 2;

/// First version carrying block layout and config word fields
pub const DIFF_FIELDS_VERSION: u32 = 2;

pub const SHORT_HEADER_LEN: usize = 28;
pub const LONG_HEADER_LEN: usize = 40;

/// Byte offset of the frame count, patched when recording stops
pub const FRAME_COUNT_OFFSET: u64 = 16;

/// Fixed-size record at the start of every replay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHeader {
    pub version: u32,
    pub content_checksum: u32,
    pub snapshot_size: u32,
    pub frame_count: u32,
    pub session_id: i64,
    pub block_size: u32,
    pub superblock_size: u32,
    pub checkpoint_config: u32,
}

impl SessionHeader {
    /// Header for a new recording, with a placeholder frame count
    pub fn new(content_checksum: u32, snapshot_size: u32, policy: CheckpointPolicy) -> Self {
        let layout = BlockLayout::for_snapshot(snapshot_size as usize);
        Self {
            version: FORMAT_VERSION,
            content_checksum,
            snapshot_size,
            frame_count: 0,
            session_id: chrono::Utc::now().timestamp_millis(),
            block_size: layout.block_size,
            superblock_size: layout.superblock_size(),
            checkpoint_config: policy.to_word(),
        }
    }

    /// Encoded length for this header's version
    pub fn encoded_len(&self) -> usize {
        header_len(self.version)
    }

    pub fn has_diff_fields(&self) -> bool {
        self.version >= DIFF_FIELDS_VERSION
    }

    pub fn layout(&self) -> Result<BlockLayout> {
        BlockLayout::from_sizes(self.block_size, self.superblock_size)
    }

    /// Commit policy recorded by the writer, if the selector is known
    pub fn policy(&self) -> Option<CheckpointPolicy> {
        CheckpointPolicy::from_word(self.checkpoint_config)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.encoded_len()];
        buf[0..4].copy_from_slice(&MAGIC);
        BigEndian::write_u32(&mut buf[4..8], self.version);
        BigEndian::write_u32(&mut buf[8..12], self.content_checksum);
        BigEndian::write_u32(&mut buf[12..16], self.snapshot_size);
        BigEndian::write_u32(&mut buf[16..20], self.frame_count);
        BigEndian::write_i64(&mut buf[20..28], self.session_id);
        if self.has_diff_fields() {
            BigEndian::write_u32(&mut buf[28..32], self.block_size);
            BigEndian::write_u32(&mut buf[32..36], self.superblock_size);
            BigEndian::write_u32(&mut buf[36..40], self.checkpoint_config);
        }
        buf
    }

    /// Decode a header, choosing the layout from the version before reading it
    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, FormatError> {
        if bytes.len() < 8 {
            // Too short for magic and version, but a wrong magic still wins
            if bytes.len() >= 4 && bytes[0..4] != MAGIC {
                return Err(FormatError::NotAReplayFile {
                    found: BigEndian::read_u32(&bytes[0..4]),
                });
            }
            return Err(FormatError::Truncated {
                needed: 8,
                available: bytes.len(),
            });
        }
        if bytes[0..4] != MAGIC {
            return Err(FormatError::NotAReplayFile {
                found: BigEndian::read_u32(&bytes[0..4]),
            });
        }

        let version = BigEndian::read_u32(&bytes[4..8]);
        if version > FORMAT_VERSION {
            return Err(FormatError::UnsupportedVersion {
                found: version,
                max: FORMAT_VERSION,
            });
        }
        let needed = header_len(version);
        if bytes.len() < needed {
            return Err(FormatError::Truncated {
                needed,
                available: bytes.len(),
            });
        }

        let snapshot_size = BigEndian::read_u32(&bytes[12..16]);
        let (block_size, superblock_size, checkpoint_config) = if version >= DIFF_FIELDS_VERSION {
            (
                BigEndian::read_u32(&bytes[28..32]),
                BigEndian::read_u32(&bytes[32..36]),
                BigEndian::read_u32(&bytes[36..40]),
            )
        } else {
            let layout = BlockLayout::for_snapshot(snapshot_size as usize);
            (layout.block_size, layout.superblock_size(), 0)
        };

        Ok(Self {
            version,
            content_checksum: BigEndian::read_u32(&bytes[8..12]),
            snapshot_size,
            frame_count: BigEndian::read_u32(&bytes[16..20]),
            session_id: BigEndian::read_i64(&bytes[20..28]),
            block_size,
            superblock_size,
            checkpoint_config,
        })
    }

    /// Read and decode a header from the start of a stream
    ///
    /// Consumes up to [`LONG_HEADER_LEN`] bytes; callers reposition to
    /// [`encoded_len`](Self::encoded_len) afterwards.
    pub fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        let mut bytes = Vec::with_capacity(LONG_HEADER_LEN);
        reader
            .take(LONG_HEADER_LEN as u64)
            .read_to_end(&mut bytes)
            .map_err(ReplayError::read)?;
        Ok(Self::decode(&bytes)?)
    }
}

/// Copy the first `len` bytes of a replay stream, claiming `frames` frames
///
/// The stream cursor is left at `len`.
pub(crate) fn copy_prefix(stream: &mut dyn ByteStream, len: u64, frames: u64) -> Result<Vec<u8>> {
    let size = usize::try_from(len).map_err(|_| ReplayError::Allocation { bytes: usize::MAX })?;
    let mut bytes = Vec::new();
    bytes
        .try_reserve_exact(size)
        .map_err(|_| ReplayError::Allocation { bytes: size })?;
    bytes.resize(size, 0);
    stream.seek(SeekFrom::Start(0)).map_err(ReplayError::read)?;
    stream.read_exact(&mut bytes).map_err(ReplayError::read)?;
    stream.seek(SeekFrom::Start(len)).map_err(ReplayError::read)?;

    let at = FRAME_COUNT_OFFSET as usize;
    if bytes.len() >= at + 4 {
        BigEndian::write_u32(&mut bytes[at..at + 4], u32::try_from(frames).unwrap_or(u32::MAX));
    }
    Ok(bytes)
}

fn header_len(version: u32) -> usize {
    if version >= DIFF_FIELDS_VERSION {
        LONG_HEADER_LEN
    } else {
        SHORT_HEADER_LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::checkpoint::Compression;
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg64;

    fn sample() -> SessionHeader {
        SessionHeader {
            version: FORMAT_VERSION,
            content_checksum: 0xCAFE_F00D,
            snapshot_size: 65536,
            frame_count: 1234,
            session_id: 1_700_000_000_123,
            block_size: 128,
            superblock_size: 2048,
            checkpoint_config: CheckpointPolicy::new(4, 2, Compression::Lz4).unwrap().to_word(),
        }
    }

    #[test]
    fn test_roundtrip_long_header() {
        let header = sample();
        let bytes = header.encode();
        assert_eq!(bytes.len(), LONG_HEADER_LEN);
        assert_eq!(&bytes[0..4], b"BSV2");
        assert_eq!(SessionHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn test_roundtrip_random_headers() {
        let mut rng = Pcg64::seed_from_u64(0xb5f2);
        for _ in 0..500 {
            let header = SessionHeader {
                version: FORMAT_VERSION,
                content_checksum: rng.random(),
                snapshot_size: rng.random(),
                frame_count: rng.random(),
                session_id: rng.random(),
                block_size: rng.random(),
                superblock_size: rng.random(),
                checkpoint_config: rng.random(),
            };
            let bytes = header.encode();
            assert_eq!(bytes.len(), header.encoded_len());
            assert_eq!(SessionHeader::decode(&bytes).unwrap(), header);

            let mut reader = &bytes[..];
            assert_eq!(SessionHeader::read_from(&mut reader).unwrap(), header);
        }
    }

    #[test]
    fn test_fields_are_big_endian() {
        let bytes = sample().encode();
        assert_eq!(&bytes[4..8], &[0, 0, 0, 2]);
        assert_eq!(&bytes[8..12], &[0xCA, 0xFE, 0xF0, 0x0D]);
        assert_eq!(BigEndian::read_u32(&bytes[16..20]), 1234);
    }

    #[test]
    fn test_corrupted_magic() {
        let mut bytes = sample().encode();
        bytes[0] = b'X';
        assert!(matches!(
            SessionHeader::decode(&bytes),
            Err(FormatError::NotAReplayFile { .. })
        ));
    }

    #[test]
    fn test_future_version_rejected() {
        let mut bytes = sample().encode();
        BigEndian::write_u32(&mut bytes[4..8], FORMAT_VERSION + 1);
        assert!(matches!(
            SessionHeader::decode(&bytes),
            Err(FormatError::UnsupportedVersion { found: 3, max: 2 })
        ));
    }

    #[test]
    fn test_short_header_does_not_read_diff_fields() {
        let mut header = sample();
        header.version = 1;
        let mut bytes = header.encode();
        assert_eq!(bytes.len(), SHORT_HEADER_LEN);
        // Bytes following a short header belong to the prelude, not the header
        bytes.extend_from_slice(&[0xFF; 12]);

        let decoded = SessionHeader::decode(&bytes).unwrap();
        assert_eq!(decoded.version, 1);
        assert_eq!(decoded.block_size, 128);
        assert_eq!(decoded.superblock_size, 2048);
        assert_eq!(decoded.checkpoint_config, 0);
        assert_eq!(decoded.encoded_len(), SHORT_HEADER_LEN);
    }

    #[test]
    fn test_truncated_long_header() {
        let bytes = sample().encode();
        assert!(matches!(
            SessionHeader::decode(&bytes[..30]),
            Err(FormatError::Truncated {
                needed: 40,
                available: 30
            })
        ));
        assert!(matches!(
            SessionHeader::decode(&bytes[..5]),
            Err(FormatError::Truncated { needed: 8, .. })
        ));
    }

    #[test]
    fn test_new_header_picks_layout_and_policy() {
        let policy = CheckpointPolicy::new(300, 256, Compression::Lz4).unwrap();
        let header = SessionHeader::new(7, 4 << 20, policy);
        assert_eq!(header.layout().unwrap(), BlockLayout::LARGE);
        assert_eq!(header.policy(), Some(policy));
        assert_eq!(header.frame_count, 0);
    }

    #[test]
    fn test_read_from_stream() {
        let header = sample();
        let mut bytes = header.encode();
        bytes.extend_from_slice(&[1, 2, 3]);
        let decoded = SessionHeader::read_from(&mut bytes.as_slice()).unwrap();
        assert_eq!(decoded, header);
    }
}
