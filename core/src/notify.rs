//! User-facing notification sink
//!
//! Notifications are short on-screen messages. They are separate from the
//! `tracing` log: every terminal replay outcome produces exactly one.

/// Receives short user-facing messages
pub trait Notifier {
    /// Push a message shown for `duration_frames` frames
    ///
    /// `flush` asks the host to drop any queued messages first.
    fn push(&mut self, message: &str, priority: u32, duration_frames: u32, flush: bool);
}

/// A buffered notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub message: String,
    pub priority: u32,
    pub duration_frames: u32,
    pub flush: bool,
}

/// Forwards notifications to the `tracing` log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn push(&mut self, message: &str, priority: u32, duration_frames: u32, _flush: bool) {
        tracing::info!(priority, duration_frames, "[Replay] {}", message);
    }
}

/// Buffers notifications until the host drains them
#[derive(Debug, Default)]
pub struct NotificationLog {
    pending: Vec<Notification>,
}

impl NotificationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take all pending notifications, oldest first
    pub fn drain(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.pending)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Notifier for NotificationLog {
    fn push(&mut self, message: &str, priority: u32, duration_frames: u32, flush: bool) {
        if flush {
            self.pending.clear();
        }
        self.pending.push(Notification {
            message: message.to_string(),
            priority,
            duration_frames,
            flush,
        });
    }
}
