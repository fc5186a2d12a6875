//! Single-slot undo buffers

use std::path::{Path, PathBuf};

use crate::error::{ReplayError, Result};
use crate::io::StreamProvider;

/// Bytes captured by a backup, with the path they belong to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoState {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
}

/// Holds at most one backup; restoring consumes it
#[derive(Debug, Default)]
pub struct UndoBuffer {
    slot: Option<UndoState>,
}

impl UndoBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace any held backup with a copy of `bytes`
    pub fn backup(&mut self, path: &Path, bytes: &[u8]) -> Result<()> {
        // Free the old buffer before allocating the new one
        self.slot = None;
        let mut owned = Vec::new();
        owned
            .try_reserve_exact(bytes.len())
            .map_err(|_| ReplayError::Allocation { bytes: bytes.len() })?;
        owned.extend_from_slice(bytes);
        self.slot = Some(UndoState {
            path: path.to_path_buf(),
            bytes: owned,
        });
        Ok(())
    }

    /// Write the backup to its path and clear it
    ///
    /// Returns `Ok(false)` when nothing is held. On a write error the bytes
    /// stay held so the restore can be retried.
    pub fn restore(&mut self, streams: &dyn StreamProvider) -> Result<bool> {
        let Some(state) = self.slot.as_ref() else {
            return Ok(false);
        };
        streams.write_all(&state.path, &state.bytes)?;
        tracing::info!("[Undo] Restored {}", state.path.display());
        self.slot = None;
        Ok(true)
    }

    /// Take the backup without writing it anywhere
    pub fn take(&mut self) -> Option<UndoState> {
        self.slot.take()
    }

    /// Hold an already-owned backup, dropping any previous one
    pub(crate) fn hold(&mut self, state: UndoState) {
        self.slot = Some(state);
    }

    pub fn peek(&self) -> Option<&UndoState> {
        self.slot.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.slot.is_none()
    }

    pub fn reset(&mut self) {
        self.slot = None;
    }
}

/// The save-side and load-side undo slots
#[derive(Debug, Default)]
pub struct UndoBuffers {
    /// File contents a save overwrote
    pub save: UndoBuffer,
    /// Core state a load replaced
    pub load: UndoBuffer,
}

impl UndoBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.save.reset();
        self.load.reset();
    }
}
