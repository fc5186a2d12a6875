//! Replay recorder
//!
//! Appends input frames to a replay stream, interleaving incremental
//! checkpoint commits according to the [`CheckpointPolicy`].

use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::checkpoint::{CheckpointDiffer, CheckpointPolicy, CommitRecord};
use super::frame::{self, ScanStep, has_backref};
use super::frame_index::FrameIndex;
use super::header::{self, FRAME_COUNT_OFFSET, SessionHeader};
use crate::config::ReplayConfig;
use crate::error::{FormatError, ReplayError, Result};
use crate::io::{self, ByteStream, OpenMode, StreamProvider};
use crate::machine::{self, CoreMemory};

/// Configuration for the recorder
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Checksum of the content being recorded
    pub content_checksum: u32,
    pub policy: CheckpointPolicy,
    /// log2 of the frame index capacity
    pub index_capacity_log2: u32,
}

impl RecorderConfig {
    pub fn new(content_checksum: u32, config: &ReplayConfig) -> Self {
        Self {
            content_checksum,
            policy: config.policy(),
            index_capacity_log2: config.index_capacity_log2(),
        }
    }
}

/// An open recording
pub struct RecordSession {
    stream: Option<Box<dyn ByteStream>>,
    path: PathBuf,
    header: SessionHeader,
    index: FrameIndex,
    differ: Option<CheckpointDiffer>,
    snapshot: Vec<u8>,
    frame_buf: Vec<u8>,
    /// Append cursor shared by commits and frame payloads
    cursor: u64,
    last_frame_start: Option<u64>,
    frames_since_commit: u32,
    force_full: bool,
    prelude_written: bool,
    commits: u64,
}

impl RecordSession {
    /// Create the stream and write the header
    ///
    /// The frame count is left as a placeholder until [`stop`](Self::stop).
    /// Call [`write_prelude`](Self::write_prelude) before the first frame.
    pub fn create(
        streams: &dyn StreamProvider,
        path: &Path,
        config: &RecorderConfig,
        snapshot_size: usize,
    ) -> Result<Self> {
        let size = u32::try_from(snapshot_size).map_err(|_| {
            ReplayError::Checkpoint(format!("snapshot of {snapshot_size} bytes is too large"))
        })?;
        let differ = if snapshot_size > 0 {
            Some(CheckpointDiffer::initialize(snapshot_size, config.policy)?)
        } else {
            None
        };

        let header = SessionHeader::new(config.content_checksum, size, config.policy);
        let bytes = header.encode();
        let index = FrameIndex::new(config.index_capacity_log2, bytes.len() as u64)?;

        let mut stream = streams.open(path, OpenMode::Create)?;
        stream.write_all(&bytes).map_err(ReplayError::write)?;

        tracing::info!(
            "[Replay] Recording to {} (snapshot {} bytes, session {})",
            path.display(),
            snapshot_size,
            header.session_id
        );

        Ok(Self {
            stream: Some(stream),
            path: path.to_path_buf(),
            header,
            index,
            differ,
            snapshot: Vec::new(),
            frame_buf: Vec::new(),
            cursor: bytes.len() as u64,
            last_frame_start: None,
            frames_since_commit: 0,
            force_full: false,
            prelude_written: false,
            commits: 0,
        })
    }

    /// Create the stream, write the header and the initial full checkpoint
    pub fn start(
        streams: &dyn StreamProvider,
        path: &Path,
        config: &RecorderConfig,
        core: &mut dyn CoreMemory,
    ) -> Result<Self> {
        let mut session = Self::create(streams, path, config, core.serialize_size())?;
        session.write_prelude(core)?;
        Ok(session)
    }

    /// Write the initial full checkpoint that frame 0 starts from
    pub fn write_prelude(&mut self, core: &mut dyn CoreMemory) -> Result<()> {
        if self.prelude_written {
            return Ok(());
        }
        let stream = self.stream.as_mut().ok_or(ReplayError::SessionClosed)?;
        if let Some(differ) = self.differ.as_mut() {
            machine::capture(core, &mut self.snapshot)?;
            let record = differ.commit(&self.snapshot, 0)?;
            self.frame_buf.clear();
            record
                .write_to(&mut self.frame_buf, differ.policy().compression)
                .map_err(ReplayError::write)?;
            stream.write_all(&self.frame_buf).map_err(ReplayError::write)?;
            self.cursor += self.frame_buf.len() as u64;
            self.commits += 1;
        }
        self.index.set_min_offset(self.cursor);
        self.prelude_written = true;
        self.frames_since_commit = 0;
        Ok(())
    }

    /// Append one frame of input
    ///
    /// Call before the core runs the frame: a checkpoint written here holds
    /// the state the frame starts from. Any failure closes the session.
    pub fn record_input_frame(&mut self, input: &[u8], core: &mut dyn CoreMemory) -> Result<()> {
        if self.stream.is_none() {
            return Err(ReplayError::SessionClosed);
        }
        let result = self.append_frame(input, core);
        if let Err(e) = &result {
            tracing::error!(
                "[Replay] Recording aborted at frame {}: {}",
                self.index.next_frame(),
                e
            );
            self.stream = None;
        }
        result
    }

    fn append_frame(&mut self, input: &[u8], core: &mut dyn CoreMemory) -> Result<()> {
        if !self.prelude_written {
            self.write_prelude(core)?;
        }
        let frame = self.index.next_frame();
        let start = self.cursor;

        let commit = self.maybe_commit(frame, core)?;
        let compression = self
            .differ
            .as_ref()
            .map(|d| d.policy().compression)
            .unwrap_or_default();

        let backref = match self.last_frame_start {
            Some(prev) => u32::try_from(start - prev)
                .map_err(|_| ReplayError::Checkpoint(format!("frame {} is too large", frame - 1)))?,
            None => 0,
        };
        self.frame_buf.clear();
        frame::write_frame(
            &mut self.frame_buf,
            backref,
            commit.as_ref().map(|r| (r, compression)),
            input,
        )
        .map_err(ReplayError::write)?;

        let stream = self.stream.as_mut().ok_or(ReplayError::SessionClosed)?;
        stream.write_all(&self.frame_buf).map_err(ReplayError::write)?;
        self.cursor += self.frame_buf.len() as u64;
        self.index.record_frame_start(start);
        self.last_frame_start = Some(start);

        if commit.is_some() {
            self.commits += 1;
            self.force_full = false;
            self.frames_since_commit = 1;
        } else {
            self.frames_since_commit = self.frames_since_commit.saturating_add(1);
        }
        Ok(())
    }

    /// Commit a checkpoint for the start of `frame` if the policy says so
    fn maybe_commit(&mut self, frame: u64, core: &mut dyn CoreMemory) -> Result<Option<CommitRecord>> {
        let Some(differ) = self.differ.as_mut() else {
            return Ok(None);
        };
        let policy = differ.policy();
        let interval_due = self.force_full || policy.should_commit(self.frames_since_commit, 0);
        if !interval_due && policy.interval_only() {
            return Ok(None);
        }

        machine::capture(core, &mut self.snapshot)?;
        let due = interval_due
            || policy.should_commit(0, differ.changed_block_count(&self.snapshot)?);
        if !due {
            return Ok(None);
        }
        differ.commit(&self.snapshot, frame).map(Some)
    }

    /// Truncate the recording so that `frame` is the next frame written
    ///
    /// The next checkpoint after a rewind is full.
    pub fn rewind_to_frame(&mut self, frame: u64) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(ReplayError::SessionClosed)?;
        if frame == self.index.next_frame() {
            return Ok(());
        }
        let offset = self.index.offset_for_frame(frame)?;
        io::seek_within(stream.as_mut(), offset)?;

        let previous = if frame == 0 || !has_backref(self.header.version) {
            None
        } else {
            let min_offset = self.index.min_offset();
            let previous = stream
                .read_u32::<BigEndian>()
                .map_err(ReplayError::read)
                .and_then(|backref| {
                    offset
                        .checked_sub(u64::from(backref))
                        .filter(|&p| p >= min_offset)
                        .ok_or_else(|| ReplayError::Checkpoint(format!("backref mismatch at frame {frame}")))
                });
            match previous {
                Ok(previous) => Some(previous),
                Err(e) => {
                    // Leave the append cursor where it was
                    stream
                        .seek(SeekFrom::Start(self.cursor))
                        .map_err(ReplayError::write)?;
                    return Err(e);
                }
            }
        };

        stream.truncate(offset).map_err(ReplayError::write)?;
        stream.seek(SeekFrom::Start(offset)).map_err(ReplayError::write)?;
        self.index.truncate_to(frame)?;
        self.cursor = offset;
        self.last_frame_start = previous;
        self.frames_since_commit = 0;
        if let Some(differ) = self.differ.as_mut() {
            differ.invalidate();
            self.force_full = true;
        }

        tracing::info!("[Replay] Recording rewound to frame {}", frame);
        Ok(())
    }

    /// Discard every recorded frame, keeping the initial state
    pub fn reset(&mut self) -> Result<()> {
        self.rewind_to_frame(0)
    }

    /// True if [`rewind_to_frame`](Self::rewind_to_frame) can reach `frame`
    pub fn can_rewind_to(&self, frame: u64) -> bool {
        frame == self.index.next_frame() || self.index.offset_for_frame(frame).is_ok()
    }

    /// Everything recorded so far, with the header claiming the frames written
    pub fn replay_bytes(&mut self) -> Result<Vec<u8>> {
        let stream = self.stream.as_mut().ok_or(ReplayError::SessionClosed)?;
        header::copy_prefix(stream.as_mut(), self.cursor, self.index.next_frame())
    }

    /// Replace the recording with an earlier copy of this session's replay
    ///
    /// Recording continues after the copy's last frame, with a full
    /// checkpoint next. Reaches frames a rewind cannot, such as frames past
    /// the end of the current recording or overwritten in the frame index.
    pub fn replace_with(&mut self, bytes: &[u8]) -> Result<()> {
        if self.stream.is_none() {
            return Err(ReplayError::SessionClosed);
        }
        let copy = SessionHeader::decode(bytes)?;
        if copy.session_id != self.header.session_id {
            return Err(ReplayError::Checkpoint(format!(
                "replay of session {} cannot continue session {}",
                copy.session_id, self.header.session_id
            )));
        }
        let min_offset = self.index.min_offset();
        let len = bytes.len() as u64;
        if len < min_offset {
            return Err(FormatError::Truncated {
                needed: min_offset as usize,
                available: bytes.len(),
            }
            .into());
        }

        let mut index = FrameIndex::new(self.index.capacity().trailing_zeros(), min_offset)?;
        let mut reader = std::io::Cursor::new(bytes);
        let mut pos = min_offset;
        let mut last = None;
        loop {
            match frame::scan_frame(&mut reader, copy.version, pos, len)? {
                ScanStep::Frame(scanned) => {
                    index.record_frame_start(scanned.start);
                    last = Some(scanned.start);
                    pos = scanned.end;
                }
                ScanStep::End => break,
                ScanStep::Truncated => {
                    return Err(ReplayError::Checkpoint(format!(
                        "replay copy ends inside frame {}",
                        index.next_frame()
                    )));
                }
            }
        }

        let stream = self.stream.as_mut().ok_or(ReplayError::SessionClosed)?;
        let written = stream
            .truncate(0)
            .and_then(|()| stream.seek(SeekFrom::Start(0)))
            .and_then(|_| stream.write_all(bytes));
        if let Err(e) = written {
            tracing::error!("[Replay] Failed to replace {}: {}", self.path.display(), e);
            self.stream = None;
            return Err(ReplayError::write(e));
        }

        self.index = index;
        self.cursor = pos;
        self.last_frame_start = last;
        self.frames_since_commit = 0;
        if let Some(differ) = self.differ.as_mut() {
            differ.invalidate();
            self.force_full = true;
        }
        tracing::info!(
            "[Replay] Recording replaced, continuing at frame {}",
            self.index.next_frame()
        );
        Ok(())
    }

    /// Patch the final frame count into the header and close the stream
    ///
    /// Calling it again is a no-op.
    pub fn stop(&mut self) -> Result<()> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        let frames = self.index.next_frame();
        let count = u32::try_from(frames).unwrap_or_else(|_| {
            tracing::warn!("[Replay] frame count {} does not fit the header", frames);
            u32::MAX
        });

        stream
            .seek(SeekFrom::Start(FRAME_COUNT_OFFSET))
            .map_err(ReplayError::write)?;
        stream
            .write_u32::<BigEndian>(count)
            .map_err(ReplayError::write)?;
        stream.flush().map_err(ReplayError::write)?;
        self.header.frame_count = count;

        tracing::info!(
            "[Replay] Recording stopped: {} frames, {} checkpoints ({})",
            frames,
            self.commits,
            self.path.display()
        );
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// Frames recorded so far
    pub fn frame_count(&self) -> u64 {
        self.index.next_frame()
    }

    /// Checkpoint commits written, including the prelude and any later truncated by a rewind
    pub fn commit_count(&self) -> u64 {
        self.commits
    }

    pub fn header(&self) -> &SessionHeader {
        &self.header
    }

    pub fn index(&self) -> &FrameIndex {
        &self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RecordSession {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!("[Replay] Failed to finalize {}: {}", self.path.display(), e);
        }
    }
}
