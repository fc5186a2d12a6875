//! Save states with one level of undo
//!
//! Saving backs up the file it overwrites into the save-side slot. Loading
//! backs up the live core state into the load-side slot. Battery-backed save
//! RAM survives loads and undos unless `restore_save_ram` is set.
//!
//! A state saved during a recording or playback carries that replay up to
//! the saved frame. Loading it moves the session back to that frame.

mod embed;
mod undo;

use std::path::Path;

pub use embed::EmbeddedReplay;
pub use undo::{UndoBuffer, UndoBuffers, UndoState};

use crate::config::UndoConfig;
use crate::control::SessionRegistry;
use crate::error::{ReplayError, Result};
use crate::io::StreamProvider;
use crate::machine::{self, CoreMemory};
use crate::notify::Notifier;

/// Serialize the core to `path`, backing up what was there
///
/// The active session's replay is stored alongside the snapshot.
pub fn save_state(
    streams: &dyn StreamProvider,
    path: &Path,
    core: &mut dyn CoreMemory,
    undo: &mut UndoBuffers,
    sessions: &mut SessionRegistry,
) -> Result<()> {
    let mut state = Vec::new();
    machine::capture(core, &mut state)?;
    if let Some(replay) = sessions.replay_for_state()? {
        embed::append(&mut state, &replay).map_err(ReplayError::write)?;
    }

    if streams.exists(path) {
        let previous = streams.read_all(path)?;
        undo.save.backup(path, &previous)?;
    }
    streams.write_all(path, &state)?;
    tracing::info!("[Undo] Saved state to {}", path.display());
    Ok(())
}

/// Load the state at `path` into the core, backing up the live state
///
/// An active recording refuses states from other sessions and nothing is
/// loaded. An active playback halts on them. A state from the active
/// session rewinds it to the saved frame.
pub fn load_state(
    streams: &dyn StreamProvider,
    path: &Path,
    core: &mut dyn CoreMemory,
    undo: &mut UndoBuffers,
    sessions: &mut SessionRegistry,
    notifier: &mut dyn Notifier,
    config: &UndoConfig,
) -> Result<()> {
    let bytes = streams.read_all(path)?;
    let (snapshot, embedded) = embed::split(&bytes, core.serialize_size())?;
    let sync = sessions.prepare_state_load(embedded, notifier)?;

    let mut current = Vec::new();
    machine::capture(core, &mut current)?;
    undo.load.hold(UndoState {
        path: path.to_path_buf(),
        bytes: current,
    });

    machine::restore(core, snapshot, config.restore_save_ram)?;
    sessions.finish_state_load(sync, notifier)?;
    tracing::info!("[Undo] Loaded state from {}", path.display());
    Ok(())
}

/// Put back the file the last save overwrote
///
/// Returns `Ok(false)` when there is nothing to undo.
pub fn undo_save_state(streams: &dyn StreamProvider, undo: &mut UndoBuffers) -> Result<bool> {
    undo.save.restore(streams)
}

/// Put the core back into the state it had before the last load
///
/// Single-use. On failure the backup is kept for a retry.
pub fn undo_load_state(core: &mut dyn CoreMemory, undo: &mut UndoBuffers, config: &UndoConfig) -> Result<bool> {
    let Some(state) = undo.load.take() else {
        return Ok(false);
    };
    match machine::restore(core, &state.bytes, config.restore_save_ram) {
        Ok(()) => {
            tracing::info!("[Undo] Reverted load of {}", state.path.display());
            Ok(true)
        }
        Err(e) => {
            undo.load.hold(state);
            Err(e)
        }
    }
}
