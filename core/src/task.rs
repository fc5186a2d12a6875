//! Cooperative task queue
//!
//! Tasks are polled once per host tick on the host's own thread. A task
//! moves `Queued → Running → Finished`; its `Result` is handed out once, in
//! a [`Completion`], on the tick it finishes.

use std::collections::VecDeque;
use std::task::Poll;

use crate::error::{ReplayError, Result};

/// Task lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Submitted, not yet polled
    Queued,
    /// Polled at least once, not yet finished
    Running,
    /// Completed, failed or cancelled; the completion has been handed out
    Finished,
}

/// Identifies a submitted task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskHandle(u64);

/// Completion percentage reported by a task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    percent: u8,
}

impl Progress {
    /// Set the percentage, clamped to 100
    pub fn set(&mut self, percent: u8) {
        self.percent = percent.min(100);
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }
}

/// A unit of work polled by a [`TaskQueue`]
///
/// `E` is the environment the host lends to tasks on each tick.
pub trait Task<E> {
    type Output;

    /// Advance the task; keep each call short
    fn poll(&mut self, env: &mut E, progress: &mut Progress) -> Poll<Result<Self::Output>>;

    /// Release partial work when cancelled while running
    fn abort(&mut self, _env: &mut E) {}
}

/// A finished task and its result
#[derive(Debug)]
pub struct Completion<T> {
    pub handle: TaskHandle,
    pub result: Result<T>,
}

struct Entry<T> {
    handle: TaskHandle,
    task: T,
    state: TaskState,
    progress: Progress,
    cancel_requested: bool,
}

/// Finished cancellations remembered for [`TaskQueue::is_cancelled`]
const CANCELLED_HISTORY: usize = 32;

/// Cooperative scheduler for one kind of task
pub struct TaskQueue<T> {
    entries: Vec<Entry<T>>,
    next_id: u64,
    /// Most recent finished cancellations, oldest first
    cancelled: VecDeque<TaskHandle>,
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 0,
            cancelled: VecDeque::new(),
        }
    }
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a task; it first runs on the next [`poll`](Self::poll)
    pub fn submit(&mut self, task: T) -> TaskHandle {
        let handle = TaskHandle(self.next_id);
        self.next_id += 1;
        self.entries.push(Entry {
            handle,
            task,
            state: TaskState::Queued,
            progress: Progress::default(),
            cancel_requested: false,
        });
        handle
    }

    /// Request cancellation; returns false if the task already finished
    ///
    /// The task completes with [`ReplayError::Cancelled`] on the next poll.
    pub fn cancel(&mut self, handle: TaskHandle) -> bool {
        match self.entries.iter_mut().find(|e| e.handle == handle) {
            Some(entry) => {
                entry.cancel_requested = true;
                true
            }
            None => false,
        }
    }

    /// State of a task, `None` for a handle this queue never issued
    pub fn state(&self, handle: TaskHandle) -> Option<TaskState> {
        if handle.0 >= self.next_id {
            return None;
        }
        Some(
            self.entries
                .iter()
                .find(|e| e.handle == handle)
                .map_or(TaskState::Finished, |e| e.state),
        )
    }

    pub fn is_finished(&self, handle: TaskHandle) -> bool {
        self.state(handle) == Some(TaskState::Finished)
    }

    /// True once cancellation was requested, before or after it took effect
    ///
    /// Only the last few finished cancellations are remembered.
    pub fn is_cancelled(&self, handle: TaskHandle) -> bool {
        self.cancelled.contains(&handle)
            || self
                .entries
                .iter()
                .any(|e| e.handle == handle && e.cancel_requested)
    }

    pub fn progress(&self, handle: TaskHandle) -> Option<u8> {
        self.entries
            .iter()
            .find(|e| e.handle == handle)
            .map(|e| e.progress.percent())
    }

    /// Tasks not yet finished
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Poll every unfinished task once, in submission order
    pub fn poll<E>(&mut self, env: &mut E) -> Vec<Completion<<T as Task<E>>::Output>>
    where
        T: Task<E>,
    {
        let mut completions = Vec::new();
        let mut i = 0;
        while i < self.entries.len() {
            let entry = &mut self.entries[i];
            let outcome = if entry.cancel_requested {
                if entry.state == TaskState::Running {
                    entry.task.abort(env);
                }
                Some(Err(ReplayError::Cancelled))
            } else {
                entry.state = TaskState::Running;
                match entry.task.poll(env, &mut entry.progress) {
                    Poll::Ready(result) => Some(result),
                    Poll::Pending => None,
                }
            };

            match outcome {
                Some(result) => {
                    let entry = self.entries.remove(i);
                    if entry.cancel_requested {
                        if self.cancelled.len() == CANCELLED_HISTORY {
                            self.cancelled.pop_front();
                        }
                        self.cancelled.push_back(entry.handle);
                    }
                    completions.push(Completion {
                        handle: entry.handle,
                        result,
                    });
                }
                None => i += 1,
            }
        }
        completions
    }
}
