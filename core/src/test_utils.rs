//! Shared test utilities for integration and unit tests

use crate::machine::CoreMemory;
use crate::notify::{Notification, Notifier};

// ============================================================================
// Test Core Implementation
// ============================================================================

/// Fake emulation core: a flat RAM buffer plus optional save RAM
///
/// Snapshots are `ram ++ sram`.
pub struct TestCore {
    pub ram: Vec<u8>,
    pub sram: Vec<u8>,
    pub fail_serialize: bool,
    pub fail_deserialize: bool,
    pub deserialize_count: u32,
}

impl TestCore {
    pub fn new(size: usize) -> Self {
        Self {
            ram: vec![0; size],
            sram: Vec::new(),
            fail_serialize: false,
            fail_deserialize: false,
            deserialize_count: 0,
        }
    }

    pub fn with_save_ram(mut self, sram: Vec<u8>) -> Self {
        self.sram = sram;
        self
    }

    /// Deterministic "emulation": fold the input into RAM
    pub fn step(&mut self, input: &[u8]) {
        let len = self.ram.len();
        if len == 0 {
            return;
        }
        for (i, b) in input.iter().enumerate() {
            let idx = (*b as usize * 31 + i) % len;
            self.ram[idx] = self.ram[idx].wrapping_add(*b).wrapping_add(1);
        }
    }
}

impl CoreMemory for TestCore {
    fn serialize_size(&self) -> usize {
        self.ram.len() + self.sram.len()
    }

    fn serialize(&mut self, buffer: &mut [u8]) -> bool {
        if self.fail_serialize || buffer.len() != self.serialize_size() {
            return false;
        }
        let (ram, sram) = buffer.split_at_mut(self.ram.len());
        ram.copy_from_slice(&self.ram);
        sram.copy_from_slice(&self.sram);
        true
    }

    fn deserialize(&mut self, buffer: &[u8]) -> bool {
        if self.fail_deserialize || buffer.len() != self.serialize_size() {
            return false;
        }
        let (ram, sram) = buffer.split_at(self.ram.len());
        self.ram.copy_from_slice(ram);
        self.sram.copy_from_slice(sram);
        self.deserialize_count += 1;
        true
    }

    fn save_ram(&self) -> Option<Vec<u8>> {
        if self.sram.is_empty() {
            None
        } else {
            Some(self.sram.clone())
        }
    }

    fn restore_save_ram(&mut self, bytes: &[u8]) {
        self.sram = bytes.to_vec();
    }
}

// ============================================================================
// Recording Notifier
// ============================================================================

/// Notifier that keeps every message for assertions
#[derive(Default)]
pub struct RecordingNotifier {
    pub messages: Vec<Notification>,
}

impl RecordingNotifier {
    pub fn texts(&self) -> Vec<&str> {
        self.messages.iter().map(|n| n.message.as_str()).collect()
    }
}

impl Notifier for RecordingNotifier {
    fn push(&mut self, message: &str, priority: u32, duration_frames: u32, flush: bool) {
        self.messages.push(Notification {
            message: message.to_string(),
            priority,
            duration_frames,
            flush,
        });
    }
}
