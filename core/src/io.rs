//! Byte-stream I/O abstraction
//!
//! Sessions never touch `std::fs` directly. They open streams through a
//! [`StreamProvider`], so hosts can back replays with real files
//! ([`FileSystem`]) or with in-memory buffers ([`MemoryStreams`]).

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::error::{IoError, ReplayError, Result};

/// How a stream is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Existing stream, read-only
    Read,
    /// Create or truncate, read-write
    Create,
    /// Existing stream, read-write, no truncation
    ReadWrite,
}

/// A seekable byte stream that can also be truncated
pub trait ByteStream: Read + Write + Seek {
    /// Cut the stream to `len` bytes
    fn truncate(&mut self, len: u64) -> io::Result<()>;

    /// Total length of the stream; the cursor is left where it was
    fn total_len(&mut self) -> io::Result<u64> {
        let pos = self.stream_position()?;
        let len = self.seek(SeekFrom::End(0))?;
        if pos != len {
            self.seek(SeekFrom::Start(pos))?;
        }
        Ok(len)
    }
}

impl ByteStream for fs::File {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Opens byte streams by path
pub trait StreamProvider {
    fn open(&self, path: &Path, mode: OpenMode) -> Result<Box<dyn ByteStream>>;

    fn exists(&self, path: &Path) -> bool;

    /// Read a whole stream into memory
    fn read_all(&self, path: &Path) -> Result<Vec<u8>> {
        let mut stream = self.open(path, OpenMode::Read)?;
        let mut bytes = Vec::new();
        stream.read_to_end(&mut bytes).map_err(ReplayError::read)?;
        Ok(bytes)
    }

    /// Replace a stream's contents
    fn write_all(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let mut stream = self.open(path, OpenMode::Create)?;
        stream.write_all(bytes).map_err(ReplayError::write)?;
        stream.flush().map_err(ReplayError::write)
    }
}

/// Streams backed by the host file system
#[derive(Debug, Clone, Copy, Default)]
pub struct FileSystem;

impl StreamProvider for FileSystem {
    fn open(&self, path: &Path, mode: OpenMode) -> Result<Box<dyn ByteStream>> {
        let mut options = fs::OpenOptions::new();
        match mode {
            OpenMode::Read => options.read(true),
            OpenMode::Create => options.read(true).write(true).create(true).truncate(true),
            OpenMode::ReadWrite => options.read(true).write(true),
        };
        let file = options.open(path).map_err(|source| IoError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Box::new(file))
    }

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }
}

type SharedBuffer = Rc<RefCell<Vec<u8>>>;

/// In-memory stream namespace for headless hosts and tests
///
/// Streams opened on the same path share one buffer, so a replay written
/// through one handle can be read back through another.
#[derive(Debug, Clone, Default)]
pub struct MemoryStreams {
    files: Rc<RefCell<HashMap<PathBuf, SharedBuffer>>>,
}

impl MemoryStreams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of a stream's current contents
    pub fn contents(&self, path: &Path) -> Option<Vec<u8>> {
        self.files.borrow().get(path).map(|b| b.borrow().clone())
    }

    /// Insert or replace a stream's contents
    pub fn insert(&self, path: impl Into<PathBuf>, bytes: Vec<u8>) {
        self.files
            .borrow_mut()
            .insert(path.into(), Rc::new(RefCell::new(bytes)));
    }
}

impl StreamProvider for MemoryStreams {
    fn open(&self, path: &Path, mode: OpenMode) -> Result<Box<dyn ByteStream>> {
        let mut files = self.files.borrow_mut();
        let buffer = match mode {
            OpenMode::Create => {
                let buffer = files
                    .entry(path.to_path_buf())
                    .or_insert_with(|| Rc::new(RefCell::new(Vec::new())))
                    .clone();
                buffer.borrow_mut().clear();
                buffer
            }
            OpenMode::Read | OpenMode::ReadWrite => match files.get(path) {
                Some(buffer) => buffer.clone(),
                None => {
                    return Err(IoError::OpenFailed {
                        path: path.to_path_buf(),
                        source: io::Error::new(io::ErrorKind::NotFound, "no such stream"),
                    }
                    .into());
                }
            },
        };
        Ok(Box::new(MemoryStream {
            buffer,
            pos: 0,
            writable: mode != OpenMode::Read,
        }))
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.borrow().contains_key(path)
    }
}

/// Cursor over a shared in-memory buffer
pub struct MemoryStream {
    buffer: SharedBuffer,
    pos: u64,
    writable: bool,
}

impl Read for MemoryStream {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let buffer = self.buffer.borrow();
        let start = (self.pos as usize).min(buffer.len());
        let n = out.len().min(buffer.len() - start);
        out[..n].copy_from_slice(&buffer[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for MemoryStream {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if !self.writable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "stream opened read-only",
            ));
        }
        let mut buffer = self.buffer.borrow_mut();
        let start = self.pos as usize;
        let end = start + data.len();
        if buffer.len() < end {
            buffer.resize(end, 0);
        }
        buffer[start..end].copy_from_slice(data);
        self.pos = end as u64;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.buffer.borrow().len() as i64;
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(delta) => len + delta,
            SeekFrom::Current(delta) => self.pos as i64 + delta,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of stream",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

impl ByteStream for MemoryStream {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.buffer.borrow_mut().truncate(len as usize);
        Ok(())
    }
}

/// Seek to an absolute offset that must lie within the stream
pub(crate) fn seek_within(stream: &mut dyn ByteStream, offset: u64) -> Result<()> {
    let len = stream.total_len().map_err(ReplayError::read)?;
    if offset > len {
        return Err(IoError::SeekOutOfRange { offset, len }.into());
    }
    stream
        .seek(SeekFrom::Start(offset))
        .map_err(ReplayError::read)?;
    Ok(())
}

/// Length of a section written behind a `u32` length prefix
pub(crate) fn len_u32(len: usize, what: &str) -> io::Result<u32> {
    u32::try_from(len).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{what} of {len} bytes does not fit a u32 length"),
        )
    })
}
