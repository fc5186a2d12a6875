//! Replay player
//!
//! Opens a recording, validates it, and feeds its input frames back in
//! order. Checkpoints found along the way are folded into a shadow snapshot
//! and, when enabled, loaded into the core.

use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};

use super::checkpoint::{BlockLayout, CommitHeader, CommitRecord};
use super::frame::{self, ScanStep};
use super::frame_index::FrameIndex;
use super::header::{self, SessionHeader};
use crate::config::ReplayConfig;
use crate::error::{ReplayError, Result};
use crate::io::{ByteStream, OpenMode, StreamProvider};
use crate::machine::{self, CoreMemory};

/// Configuration for the player
#[derive(Debug, Clone)]
pub struct PlayerConfig {
    /// Checksum of the loaded content; the recording must match it
    pub expected_checksum: u32,
    /// Load checkpoints into the core as they are replayed
    pub apply_checkpoints: bool,
    /// log2 of the frame index capacity
    pub index_capacity_log2: u32,
}

impl PlayerConfig {
    pub fn new(expected_checksum: u32, config: &ReplayConfig) -> Self {
        Self {
            expected_checksum,
            apply_checkpoints: config.playback.apply_checkpoints,
            index_capacity_log2: config.index_capacity_log2(),
        }
    }
}

/// Result of asking for the next frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextFrame {
    /// Input bytes for the frame about to run
    Input(Vec<u8>),
    /// Every recorded frame has been returned
    EndOfRecording,
}

/// A commit found by the start-up scan
#[derive(Debug, Clone, Copy)]
struct CommitLocation {
    frame: u64,
    offset: u64,
}

/// An open playback
pub struct PlaybackSession {
    stream: Option<Box<dyn ByteStream>>,
    path: PathBuf,
    header: SessionHeader,
    layout: BlockLayout,
    index: FrameIndex,
    /// Commits inside frame records, in frame order (the prelude is not listed)
    commits: Vec<CommitLocation>,
    frame_count: u64,
    end_offset: u64,
    next_frame: u64,
    shadow: Vec<u8>,
    restore_pending: bool,
    apply_checkpoints: bool,
}

impl PlaybackSession {
    /// Open and validate a recording, then index every frame
    ///
    /// Header and checksum are checked before any frame is read.
    pub fn start(streams: &dyn StreamProvider, path: &Path, config: &PlayerConfig) -> Result<Self> {
        let mut stream = streams.open(path, OpenMode::Read)?;
        let header = SessionHeader::read_from(stream.as_mut())?;
        if header.content_checksum != config.expected_checksum {
            return Err(ReplayError::ContentMismatch {
                expected: config.expected_checksum,
                recorded: header.content_checksum,
            });
        }
        let layout = header.layout()?;
        let file_len = stream.total_len().map_err(ReplayError::read)?;

        let header_len = header.encoded_len() as u64;
        stream
            .seek(SeekFrom::Start(header_len))
            .map_err(ReplayError::read)?;
        let mut shadow = Vec::new();
        let min_offset = if header.snapshot_size > 0 {
            let size = header.snapshot_size as usize;
            shadow
                .try_reserve_exact(size)
                .map_err(|_| ReplayError::Allocation { bytes: size })?;
            shadow.resize(size, 0);
            let prelude = CommitRecord::read_from(stream.as_mut())?;
            if !prelude.is_full() {
                return Err(ReplayError::Checkpoint("initial checkpoint is not full".into()));
            }
            prelude.apply(&mut shadow, layout)?;
            stream.stream_position().map_err(ReplayError::read)?
        } else {
            header_len
        };

        let mut index = FrameIndex::new(config.index_capacity_log2, min_offset)?;
        let mut commits = Vec::new();
        let mut pos = min_offset;
        let mut previous: Option<u64> = None;
        loop {
            let scanned = match frame::scan_frame(stream.as_mut(), header.version, pos, file_len)? {
                ScanStep::Frame(scanned) => scanned,
                ScanStep::End => break,
                ScanStep::Truncated => {
                    tracing::warn!(
                        "[Replay] {} ends inside frame {}; ignoring the partial frame",
                        path.display(),
                        index.next_frame()
                    );
                    break;
                }
            };
            if let Some(backref) = scanned.backref {
                let expected = previous.map_or(0, |p| scanned.start - p);
                if u64::from(backref) != expected {
                    return Err(ReplayError::Checkpoint(format!(
                        "backref mismatch at frame {}",
                        index.next_frame()
                    )));
                }
            }
            let frame = index.record_frame_start(scanned.start);
            if let Some((offset, commit)) = scanned.commit {
                check_commit(&commit, frame, header.snapshot_size)?;
                commits.push(CommitLocation { frame, offset });
            }
            previous = Some(scanned.start);
            pos = scanned.end;
        }

        let frame_count = index.next_frame();
        if frame_count != u64::from(header.frame_count) {
            tracing::warn!(
                "[Replay] header of {} says {} frames, found {}; using {}",
                path.display(),
                header.frame_count,
                frame_count,
                frame_count
            );
        }

        stream
            .seek(SeekFrom::Start(min_offset))
            .map_err(ReplayError::read)?;
        tracing::info!(
            "[Replay] Playing {} ({} frames, {} checkpoints)",
            path.display(),
            frame_count,
            commits.len()
        );

        Ok(Self {
            stream: Some(stream),
            path: path.to_path_buf(),
            header,
            layout,
            index,
            commits,
            frame_count,
            end_offset: pos,
            next_frame: 0,
            restore_pending: !shadow.is_empty(),
            shadow,
            apply_checkpoints: config.apply_checkpoints,
        })
    }

    /// Read the next frame's input
    ///
    /// Before returning input, loads pending checkpoint state into the core
    /// (the recorded initial state before frame 0, or the state after a seek).
    pub fn next_input_frame(&mut self, core: &mut dyn CoreMemory) -> Result<NextFrame> {
        let stream = self.stream.as_mut().ok_or(ReplayError::SessionClosed)?;
        if self.restore_pending {
            if self.apply_checkpoints {
                machine::restore(core, &self.shadow, true)?;
            }
            self.restore_pending = false;
        }
        if self.next_frame >= self.frame_count {
            return Ok(NextFrame::EndOfRecording);
        }

        let record = frame::read_frame(stream.as_mut(), self.header.version)?;
        if let Some(commit) = record.checkpoint {
            commit.apply(&mut self.shadow, self.layout)?;
            if self.apply_checkpoints {
                machine::restore(core, &self.shadow, true)?;
            }
        }
        self.next_frame += 1;
        Ok(NextFrame::Input(record.payload))
    }

    /// Reposition so that `frame` is the next frame returned
    ///
    /// The shadow snapshot is rebuilt from every checkpoint before `frame`
    /// and loaded into the core on the next read.
    pub fn seek_to_frame(&mut self, frame: u64) -> Result<()> {
        self.reposition(frame, true)
    }

    /// Continue from `frame` with the core already holding that frame's state
    ///
    /// Used after loading a save state taken during this replay. Unlike
    /// [`seek_to_frame`](Self::seek_to_frame) the core is left alone.
    pub fn resume_at_frame(&mut self, frame: u64) -> Result<()> {
        self.reposition(frame, false)?;
        self.restore_pending = false;
        Ok(())
    }

    /// Fail with [`ReplayError::OutOfRange`] unless `frame` can be seeked to
    pub fn check_seek(&self, frame: u64) -> Result<()> {
        self.frame_offset(frame).map(|_| ())
    }

    fn frame_offset(&self, frame: u64) -> Result<u64> {
        if frame == self.frame_count {
            return Ok(self.end_offset);
        }
        self.index
            .offset_for_frame(frame)
            .map_err(|_| ReplayError::OutOfRange {
                frame,
                oldest: self.index.oldest_frame(),
                next: self.frame_count,
            })
    }

    fn reposition(&mut self, frame: u64, restore: bool) -> Result<()> {
        let offset = self.frame_offset(frame)?;
        let stream = self.stream.as_mut().ok_or(ReplayError::SessionClosed)?;

        if !self.shadow.is_empty() {
            stream
                .seek(SeekFrom::Start(self.header.encoded_len() as u64))
                .map_err(ReplayError::read)?;
            CommitRecord::read_from(stream.as_mut())?.apply(&mut self.shadow, self.layout)?;
            for location in self.commits.iter().take_while(|c| c.frame < frame) {
                stream
                    .seek(SeekFrom::Start(location.offset))
                    .map_err(ReplayError::read)?;
                CommitRecord::read_from(stream.as_mut())?.apply(&mut self.shadow, self.layout)?;
            }
            self.restore_pending = restore;
        }

        stream
            .seek(SeekFrom::Start(offset))
            .map_err(ReplayError::read)?;
        self.next_frame = frame;
        tracing::debug!("[Replay] Playback seek to frame {}", frame);
        Ok(())
    }

    /// The replay up to the next frame, with the header claiming the frames played
    pub fn replay_bytes(&mut self) -> Result<Vec<u8>> {
        let stream = self.stream.as_mut().ok_or(ReplayError::SessionClosed)?;
        let end = stream.stream_position().map_err(ReplayError::read)?;
        header::copy_prefix(stream.as_mut(), end, self.next_frame)
    }

    /// Release the stream; calling it again is a no-op
    pub fn stop(&mut self) {
        if self.stream.take().is_some() {
            tracing::info!(
                "[Replay] Playback stopped at frame {} of {} ({})",
                self.next_frame,
                self.frame_count,
                self.path.display()
            );
        }
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// Fraction of frames already returned
    pub fn progress(&self) -> f32 {
        if self.frame_count == 0 {
            1.0
        } else {
            self.next_frame as f32 / self.frame_count as f32
        }
    }

    /// State as of the last checkpoint read
    pub fn current_snapshot(&self) -> &[u8] {
        &self.shadow
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Index of the next frame [`next_input_frame`](Self::next_input_frame) returns
    pub fn current_frame(&self) -> u64 {
        self.next_frame
    }

    /// Latest frame at or before `frame` whose starting state is checkpointed
    ///
    /// Seeking there and replaying forward reproduces the recording exactly.
    /// Returns 0 (the initial state) when no later checkpoint qualifies.
    pub fn checkpoint_frame_at_or_before(&self, frame: u64) -> u64 {
        self.commits
            .iter()
            .rev()
            .find(|c| c.frame <= frame)
            .map_or(0, |c| c.frame)
    }

    /// Number of checkpoints inside frame records
    pub fn checkpoint_count(&self) -> usize {
        self.commits.len()
    }

    pub fn header(&self) -> &SessionHeader {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn check_commit(commit: &CommitHeader, frame: u64, snapshot_size: u32) -> Result<()> {
    if snapshot_size == 0 {
        return Err(ReplayError::Checkpoint(format!(
            "checkpoint at frame {frame} in a recording without snapshots"
        )));
    }
    if commit.frame != frame {
        return Err(ReplayError::Checkpoint(format!(
            "checkpoint for frame {} stored in frame {}",
            commit.frame, frame
        )));
    }
    Ok(())
}
