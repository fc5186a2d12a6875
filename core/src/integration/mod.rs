//! Integration tests for the replay subsystem
//!
//! Exercises recording, playback, checkpointing and undo together through
//! the public session APIs.
