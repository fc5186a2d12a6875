//! Frame record codec
//!
//! Version 2 layout (big-endian):
//! ```text
//! backref: u32 | token: u8 | [commit record] | payload_len: u32 | payload
//! ```
//! `backref` is the distance in bytes back to the previous frame's start
//! (0 for frame 0). Version 1 records have no backref.

use std::io::{self, Read, Seek, SeekFrom, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::checkpoint::{CommitHeader, CommitRecord, Compression};
use crate::error::{ReplayError, Result};
use crate::io::len_u32;

/// Kind of frame record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameToken {
    Regular = 0x00,
    /// A commit record precedes the payload
    Checkpoint = 0x01,
}

impl FrameToken {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Regular),
            0x01 => Some(Self::Checkpoint),
            _ => None,
        }
    }
}

/// Whether records of this version carry a backref
pub(crate) fn has_backref(version: u32) -> bool {
    version >= 2
}

fn prefix_len(version: u32) -> u64 {
    if has_backref(version) { 5 } else { 1 }
}

/// Encode one frame record
pub(crate) fn write_frame<W: Write + ?Sized>(
    writer: &mut W,
    backref: u32,
    checkpoint: Option<(&CommitRecord, Compression)>,
    payload: &[u8],
) -> io::Result<()> {
    writer.write_u32::<BigEndian>(backref)?;
    match checkpoint {
        Some((record, compression)) => {
            writer.write_u8(FrameToken::Checkpoint as u8)?;
            record.write_to(writer, compression)?;
        }
        None => writer.write_u8(FrameToken::Regular as u8)?,
    }
    writer.write_u32::<BigEndian>(len_u32(payload.len(), "frame payload")?)?;
    writer.write_all(payload)
}

/// Location of a frame found by [`scan_frame`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ScannedFrame {
    pub start: u64,
    pub backref: Option<u32>,
    /// Offset and header of the embedded commit record
    pub commit: Option<(u64, CommitHeader)>,
    pub end: u64,
}

#[derive(Debug)]
pub(crate) enum ScanStep {
    Frame(ScannedFrame),
    /// Clean end of stream at a record boundary
    End,
    /// Stream ends partway through a record
    Truncated,
}

/// Walk over the record at `start` without reading commit bodies or payloads
pub(crate) fn scan_frame<S: Read + Seek + ?Sized>(
    stream: &mut S,
    version: u32,
    start: u64,
    file_len: u64,
) -> Result<ScanStep> {
    if start == file_len {
        return Ok(ScanStep::End);
    }
    let mut pos = start + prefix_len(version);
    if pos > file_len {
        return Ok(ScanStep::Truncated);
    }
    stream.seek(SeekFrom::Start(start)).map_err(ReplayError::read)?;

    let backref = if has_backref(version) {
        Some(stream.read_u32::<BigEndian>().map_err(ReplayError::read)?)
    } else {
        None
    };
    let token = read_token(stream)?;

    let commit = if token == FrameToken::Checkpoint {
        if pos + CommitHeader::LEN > file_len {
            return Ok(ScanStep::Truncated);
        }
        let header = CommitHeader::read_from(stream)?;
        let at = pos;
        pos += header.record_len();
        if pos > file_len {
            return Ok(ScanStep::Truncated);
        }
        stream.seek(SeekFrom::Start(pos)).map_err(ReplayError::read)?;
        Some((at, header))
    } else {
        None
    };

    if pos + 4 > file_len {
        return Ok(ScanStep::Truncated);
    }
    let payload_len = stream.read_u32::<BigEndian>().map_err(ReplayError::read)?;
    pos += 4 + u64::from(payload_len);
    if pos > file_len {
        return Ok(ScanStep::Truncated);
    }

    Ok(ScanStep::Frame(ScannedFrame {
        start,
        backref,
        commit,
        end: pos,
    }))
}

/// A fully decoded frame record
#[derive(Debug)]
pub(crate) struct FrameRecord {
    pub checkpoint: Option<CommitRecord>,
    pub payload: Vec<u8>,
}

/// Decode the record at the stream's current position
pub(crate) fn read_frame<R: Read + ?Sized>(reader: &mut R, version: u32) -> Result<FrameRecord> {
    if has_backref(version) {
        reader.read_u32::<BigEndian>().map_err(ReplayError::read)?;
    }
    let checkpoint = match read_token(reader)? {
        FrameToken::Checkpoint => Some(CommitRecord::read_from(reader)?),
        FrameToken::Regular => None,
    };
    let len = reader.read_u32::<BigEndian>().map_err(ReplayError::read)? as usize;
    let mut payload = Vec::new();
    payload
        .try_reserve_exact(len)
        .map_err(|_| ReplayError::Allocation { bytes: len })?;
    payload.resize(len, 0);
    reader.read_exact(&mut payload).map_err(ReplayError::read)?;
    Ok(FrameRecord { checkpoint, payload })
}

fn read_token<R: Read + ?Sized>(reader: &mut R) -> Result<FrameToken> {
    let byte = reader.read_u8().map_err(ReplayError::read)?;
    FrameToken::from_byte(byte)
        .ok_or_else(|| ReplayError::Checkpoint(format!("unknown frame token {byte:#04x}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{ByteStream, MemoryStreams, OpenMode, StreamProvider};
    use crate::replay::checkpoint::CommitFlags;
    use std::path::Path;

    fn stream_with(bytes: Vec<u8>) -> Box<dyn ByteStream> {
        let streams = MemoryStreams::new();
        streams.insert("f", bytes);
        streams.open(Path::new("f"), OpenMode::Read).unwrap()
    }

    #[test]
    fn test_write_then_scan_and_read() {
        let record = CommitRecord {
            frame: 3,
            flags: CommitFlags::empty(),
            changed_blocks: 0,
            body: Vec::new(),
        };
        let mut bytes = Vec::new();
        write_frame(&mut bytes, 0, None, &[1, 2]).unwrap();
        let second = bytes.len() as u64;
        write_frame(&mut bytes, second as u32, Some((&record, Compression::None)), &[3]).unwrap();
        let len = bytes.len() as u64;

        let mut stream = stream_with(bytes);
        let ScanStep::Frame(first) = scan_frame(stream.as_mut(), 2, 0, len).unwrap() else {
            panic!("expected frame");
        };
        assert_eq!(first.end, second);
        assert!(first.commit.is_none());

        let ScanStep::Frame(next) = scan_frame(stream.as_mut(), 2, second, len).unwrap() else {
            panic!("expected frame");
        };
        assert_eq!(next.backref, Some(second as u32));
        assert_eq!(next.commit.map(|(at, h)| (at, h.frame)), Some((second + 5, 3)));
        assert!(matches!(scan_frame(stream.as_mut(), 2, len, len).unwrap(), ScanStep::End));

        stream.seek(SeekFrom::Start(second)).unwrap();
        let frame = read_frame(stream.as_mut(), 2).unwrap();
        assert_eq!(frame.payload, vec![3]);
        assert_eq!(frame.checkpoint, Some(record));
    }

    #[test]
    fn test_scan_detects_truncated_payload() {
        let mut bytes = Vec::new();
        write_frame(&mut bytes, 0, None, &[9; 16]).unwrap();
        bytes.truncate(bytes.len() - 1);
        let len = bytes.len() as u64;
        let mut stream = stream_with(bytes);
        assert!(matches!(
            scan_frame(stream.as_mut(), 2, 0, len).unwrap(),
            ScanStep::Truncated
        ));
    }

    #[test]
    fn test_unknown_token_is_corrupt() {
        let bytes = vec![0, 0, 0, 0, 0x7F, 0, 0, 0, 0];
        let mut stream = stream_with(bytes);
        assert!(matches!(
            scan_frame(stream.as_mut(), 2, 0, 9),
            Err(ReplayError::Checkpoint(_))
        ));
    }

    #[test]
    fn test_version_one_has_no_backref() {
        let bytes = vec![0x00, 0, 0, 0, 1, 42];
        let mut stream = stream_with(bytes);
        let ScanStep::Frame(frame) = scan_frame(stream.as_mut(), 1, 0, 6).unwrap() else {
            panic!("expected frame");
        };
        assert_eq!(frame.backref, None);
        assert_eq!(frame.end, 6);

        stream.seek(SeekFrom::Start(0)).unwrap();
        assert_eq!(read_frame(stream.as_mut(), 1).unwrap().payload, vec![42]);
    }
}
