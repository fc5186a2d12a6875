//! Emulation-core collaborator interface
//!
//! The replay subsystem never looks inside machine state. It asks the core
//! for an opaque snapshot and hands snapshots back.

use crate::error::{ReplayError, Result};

/// Core-memory snapshot interface
pub trait CoreMemory {
    /// Size in bytes of a serialized snapshot
    fn serialize_size(&self) -> usize;

    /// Serialize the live machine state into `buffer` (exactly `serialize_size()` bytes)
    fn serialize(&mut self, buffer: &mut [u8]) -> bool;

    /// Replace the live machine state with a snapshot
    fn deserialize(&mut self, buffer: &[u8]) -> bool;

    /// Battery-backed save RAM, if the machine has any
    ///
    /// Save RAM is excluded from state loads unless explicitly requested.
    fn save_ram(&self) -> Option<Vec<u8>> {
        None
    }

    fn restore_save_ram(&mut self, _bytes: &[u8]) {}
}

/// Serialize the core into `buffer`, resizing it to the snapshot size
pub(crate) fn capture(core: &mut dyn CoreMemory, buffer: &mut Vec<u8>) -> Result<()> {
    let size = core.serialize_size();
    if buffer.len() != size {
        buffer
            .try_reserve_exact(size.saturating_sub(buffer.len()))
            .map_err(|_| ReplayError::Allocation { bytes: size })?;
        buffer.resize(size, 0);
    }
    if !core.serialize(buffer) {
        return Err(ReplayError::Core("serialize failed".into()));
    }
    Ok(())
}

/// Load a snapshot into the core, keeping save RAM intact unless `include_save_ram`
pub(crate) fn restore(core: &mut dyn CoreMemory, snapshot: &[u8], include_save_ram: bool) -> Result<()> {
    let preserved = if include_save_ram { None } else { core.save_ram() };
    let ok = core.deserialize(snapshot);
    if let Some(sram) = preserved {
        core.restore_save_ram(&sram);
    }
    if ok {
        Ok(())
    } else {
        Err(ReplayError::Core("deserialize failed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestCore;

    #[test]
    fn test_capture_resizes_buffer() {
        let mut core = TestCore::new(64);
        core.ram[3] = 7;
        let mut buf = Vec::new();
        capture(&mut core, &mut buf).unwrap();
        assert_eq!(buf.len(), 64);
        assert_eq!(buf[3], 7);
    }

    #[test]
    fn test_restore_preserves_save_ram() {
        let mut core = TestCore::new(16).with_save_ram(vec![1, 2, 3]);
        // Snapshot layout is RAM followed by save RAM
        let snapshot = vec![0xAA; 19];
        core.sram = vec![9, 9, 9];
        restore(&mut core, &snapshot, false).unwrap();
        assert_eq!(core.ram, vec![0xAA; 16]);
        assert_eq!(core.sram, vec![9, 9, 9]);
    }

    #[test]
    fn test_restore_can_include_save_ram() {
        let mut core = TestCore::new(16).with_save_ram(vec![1, 2, 3]);
        let mut snapshot = Vec::new();
        capture(&mut core, &mut snapshot).unwrap();
        core.sram = vec![9, 9, 9];
        restore(&mut core, &snapshot, true).unwrap();
        assert_eq!(core.sram, vec![1, 2, 3]);
    }

    #[test]
    fn test_serialize_failure_surfaces() {
        let mut core = TestCore::new(8);
        core.fail_serialize = true;
        let mut buf = Vec::new();
        assert!(matches!(
            capture(&mut core, &mut buf),
            Err(ReplayError::Core(_))
        ));
    }
}
