//! Movie session control
//!
//! Record and playback sessions are started and stopped through scheduled
//! tasks so a start never races a state load. The [`SessionRegistry`] owns
//! the live sessions and enforces one session per mode.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::task::Poll;

use crate::config::{NotifyConfig, ReplayConfig};
use crate::error::{ReplayError, Result};
use crate::io::StreamProvider;
use crate::machine::CoreMemory;
use crate::notify::Notifier;
use crate::replay::{NextFrame, PlaybackSession, PlayerConfig, RecordSession, RecorderConfig};
use crate::state::EmbeddedReplay;
use crate::task::{Progress, Task, TaskHandle, TaskQueue, TaskState};

/// Kind of movie session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionMode {
    Record,
    Playback,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Record => f.write_str("record"),
            Self::Playback => f.write_str("playback"),
        }
    }
}

/// Occupancy of one mode
enum Slot<S> {
    Idle,
    /// A start or stop task owns the slot
    Pending,
    Active(S),
}

impl<S> Slot<S> {
    fn reserve(&mut self, mode: SessionMode) -> Result<()> {
        match self {
            Self::Idle => {
                *self = Self::Pending;
                Ok(())
            }
            _ => Err(ReplayError::SessionBusy { mode }),
        }
    }

    /// Move an active session out, leaving the slot pending
    fn take_active(&mut self, mode: SessionMode) -> Result<S> {
        match std::mem::replace(self, Self::Pending) {
            Self::Active(session) => Ok(session),
            Self::Pending => Err(ReplayError::SessionBusy { mode }),
            Self::Idle => {
                *self = Self::Idle;
                Err(ReplayError::SessionClosed)
            }
        }
    }

    fn active_mut(&mut self) -> Option<&mut S> {
        match self {
            Self::Active(session) => Some(session),
            _ => None,
        }
    }

    fn active(&self) -> Option<&S> {
        match self {
            Self::Active(session) => Some(session),
            _ => None,
        }
    }
}

/// How a save state load moves the active sessions
///
/// Decided before the core is touched, applied after it loads.
#[derive(Debug, Default)]
pub(crate) struct StateSync<'a> {
    record: Option<EmbeddedReplay<'a>>,
    playback: Option<u64>,
}

/// Live sessions, at most one per mode
pub struct SessionRegistry {
    record: Slot<RecordSession>,
    playback: Slot<PlaybackSession>,
    notify: NotifyConfig,
}

impl SessionRegistry {
    pub fn new(notify: NotifyConfig) -> Self {
        Self {
            record: Slot::Idle,
            playback: Slot::Idle,
            notify,
        }
    }

    pub fn is_active(&self, mode: SessionMode) -> bool {
        match mode {
            SessionMode::Record => self.record.active().is_some(),
            SessionMode::Playback => self.playback.active().is_some(),
        }
    }

    /// True while a start or stop task holds the mode
    pub fn is_pending(&self, mode: SessionMode) -> bool {
        match mode {
            SessionMode::Record => matches!(self.record, Slot::Pending),
            SessionMode::Playback => matches!(self.playback, Slot::Pending),
        }
    }

    pub fn recording(&self) -> Option<&RecordSession> {
        self.record.active()
    }

    pub fn recording_mut(&mut self) -> Option<&mut RecordSession> {
        self.record.active_mut()
    }

    pub fn playback(&self) -> Option<&PlaybackSession> {
        self.playback.active()
    }

    pub fn playback_mut(&mut self) -> Option<&mut PlaybackSession> {
        self.playback.active_mut()
    }

    /// Record this frame's input into the active recording
    ///
    /// On failure the recording is closed and dropped.
    pub fn record_frame(
        &mut self,
        input: &[u8],
        core: &mut dyn CoreMemory,
        notifier: &mut dyn Notifier,
    ) -> Result<()> {
        let session = self.record.active_mut().ok_or(ReplayError::SessionClosed)?;
        if let Err(e) = session.record_input_frame(input, core) {
            self.record = Slot::Idle;
            push(notifier, &self.notify, &format!("Recording failed: {e}"));
            return Err(e);
        }
        Ok(())
    }

    /// Fetch this frame's input from the active playback
    ///
    /// The session is closed and dropped when the recording ends or fails.
    pub fn playback_frame(&mut self, core: &mut dyn CoreMemory, notifier: &mut dyn Notifier) -> Result<NextFrame> {
        let session = self.playback.active_mut().ok_or(ReplayError::SessionClosed)?;
        match session.next_input_frame(core) {
            Ok(NextFrame::EndOfRecording) => {
                session.stop();
                self.playback = Slot::Idle;
                push(notifier, &self.notify, "Replay finished");
                Ok(NextFrame::EndOfRecording)
            }
            Ok(frame) => Ok(frame),
            Err(e) => {
                self.playback = Slot::Idle;
                push(notifier, &self.notify, &format!("Playback failed: {e}"));
                Err(e)
            }
        }
    }

    /// Replay to embed in a save state taken now
    ///
    /// The recording is used when both modes are active.
    pub fn replay_for_state(&mut self) -> Result<Option<Vec<u8>>> {
        if let Some(session) = self.record.active_mut() {
            return session.replay_bytes().map(Some);
        }
        if let Some(session) = self.playback.active_mut() {
            return session.replay_bytes().map(Some);
        }
        Ok(None)
    }

    /// Check a save state about to be loaded against the active sessions
    ///
    /// A recording refuses states from any other session. A playback halts
    /// on them and lets the load go ahead, but refuses a state from its own
    /// session that it cannot seek to.
    pub(crate) fn prepare_state_load<'a>(
        &mut self,
        embedded: Option<EmbeddedReplay<'a>>,
        notifier: &mut dyn Notifier,
    ) -> Result<StateSync<'a>> {
        let mut sync = StateSync::default();

        if let Some(session) = self.record.active() {
            let id = session.header().session_id;
            match embedded.filter(|e| e.session_id() == id) {
                Some(replay) => sync.record = Some(replay),
                None => {
                    tracing::error!("[Replay] Refused state load: not part of recording session {}", id);
                    push(notifier, &self.notify, "Cannot load a state from outside this recording");
                    return Err(ReplayError::ForeignState {
                        mode: SessionMode::Record,
                    });
                }
            }
        }

        if let Some(session) = self.playback.active() {
            let id = session.header().session_id;
            match embedded.filter(|e| e.session_id() == id) {
                Some(replay) => {
                    if let Err(e) = session.check_seek(replay.frame()) {
                        tracing::error!("[Replay] Refused state load: {}", e);
                        push(notifier, &self.notify, "Cannot load a state from outside this replay");
                        return Err(e);
                    }
                    sync.playback = Some(replay.frame());
                }
                None => {
                    if let Slot::Active(mut session) = std::mem::replace(&mut self.playback, Slot::Idle) {
                        session.stop();
                    }
                    tracing::warn!("[Replay] State is not part of playback session {}; halting", id);
                    push(notifier, &self.notify, "Playback halted: state is from another replay");
                }
            }
        }
        Ok(sync)
    }

    /// Move the active sessions to the frame of a state that just loaded
    ///
    /// A session that fails to follow is closed and dropped.
    pub(crate) fn finish_state_load(&mut self, sync: StateSync<'_>, notifier: &mut dyn Notifier) -> Result<()> {
        if let (Some(replay), Some(session)) = (sync.record, self.record.active_mut()) {
            let frame = replay.frame();
            let result = if session.can_rewind_to(frame) {
                session.rewind_to_frame(frame)
            } else {
                session.replace_with(replay.bytes)
            };
            if let Err(e) = result {
                self.record = Slot::Idle;
                push(notifier, &self.notify, &format!("Recording failed: {e}"));
                return Err(e);
            }
        }
        if let (Some(frame), Some(session)) = (sync.playback, self.playback.active_mut()) {
            if let Err(e) = session.resume_at_frame(frame) {
                self.playback = Slot::Idle;
                push(notifier, &self.notify, &format!("Playback failed: {e}"));
                return Err(e);
            }
        }
        Ok(())
    }

    fn reserve(&mut self, mode: SessionMode) -> Result<()> {
        match mode {
            SessionMode::Record => self.record.reserve(mode),
            SessionMode::Playback => self.playback.reserve(mode),
        }
    }

    fn release(&mut self, mode: SessionMode) {
        match mode {
            SessionMode::Record => self.record = Slot::Idle,
            SessionMode::Playback => self.playback = Slot::Idle,
        }
    }
}

fn push(notifier: &mut dyn Notifier, config: &NotifyConfig, message: &str) {
    notifier.push(message, config.priority, config.duration_frames, false);
}

/// What the host lends to movie tasks on each tick
pub struct ControlEnv<'a> {
    pub core: &'a mut dyn CoreMemory,
    pub streams: &'a dyn StreamProvider,
    pub notifier: &'a mut dyn Notifier,
    /// Set while a state load is in flight; recording starts wait for it
    pub load_in_progress: bool,
}

/// Kind of scheduled movie operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    StartRecord,
    StartPlayback,
    StopRecord,
    StopPlayback,
}

impl Operation {
    pub fn mode(self) -> SessionMode {
        match self {
            Self::StartRecord | Self::StopRecord => SessionMode::Record,
            Self::StartPlayback | Self::StopPlayback => SessionMode::Playback,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::StartRecord => "Start recording",
            Self::StartPlayback => "Start playback",
            Self::StopRecord => "Stop recording",
            Self::StopPlayback => "Stop playback",
        }
    }
}

/// Outcome of one movie task, reported by [`MovieTasks::tick`]
#[derive(Debug)]
pub struct TaskReport {
    pub handle: TaskHandle,
    pub operation: Operation,
    pub result: Result<()>,
}

enum RecordPhase {
    /// Waiting for an in-flight state load to finish, then create the stream
    WaitForLoad,
    /// Write the initial checkpoint
    Prelude(RecordSession),
    Done,
}

enum MovieTask {
    StartRecord {
        path: PathBuf,
        config: RecorderConfig,
        phase: RecordPhase,
    },
    StartPlayback {
        path: PathBuf,
        config: PlayerConfig,
    },
    StopRecord(Option<RecordSession>),
    StopPlayback(Option<PlaybackSession>),
}

enum MovieOutput {
    Recording(RecordSession),
    Playback(PlaybackSession),
    Stopped,
}

impl<'a> Task<ControlEnv<'a>> for MovieTask {
    type Output = MovieOutput;

    fn poll(&mut self, env: &mut ControlEnv<'a>, progress: &mut Progress) -> Poll<Result<MovieOutput>> {
        match self {
            Self::StartRecord {
                path,
                config,
                phase,
            } => match std::mem::replace(phase, RecordPhase::Done) {
                RecordPhase::WaitForLoad if env.load_in_progress => {
                    *phase = RecordPhase::WaitForLoad;
                    Poll::Pending
                }
                RecordPhase::WaitForLoad => {
                    let size = env.core.serialize_size();
                    match RecordSession::create(env.streams, path, config, size) {
                        Ok(session) => {
                            *phase = RecordPhase::Prelude(session);
                            progress.set(50);
                            Poll::Pending
                        }
                        Err(e) => Poll::Ready(Err(e)),
                    }
                }
                RecordPhase::Prelude(mut session) => {
                    progress.set(100);
                    Poll::Ready(
                        session
                            .write_prelude(env.core)
                            .map(|()| MovieOutput::Recording(session)),
                    )
                }
                RecordPhase::Done => Poll::Ready(Err(ReplayError::SessionClosed)),
            },
            Self::StartPlayback { path, config } => {
                progress.set(100);
                Poll::Ready(PlaybackSession::start(env.streams, path, config).map(MovieOutput::Playback))
            }
            Self::StopRecord(session) => {
                progress.set(100);
                let result = match session.take() {
                    Some(mut session) => session.stop(),
                    None => Err(ReplayError::SessionClosed),
                };
                Poll::Ready(result.map(|()| MovieOutput::Stopped))
            }
            Self::StopPlayback(session) => {
                progress.set(100);
                match session.take() {
                    Some(mut session) => {
                        session.stop();
                        Poll::Ready(Ok(MovieOutput::Stopped))
                    }
                    None => Poll::Ready(Err(ReplayError::SessionClosed)),
                }
            }
        }
    }

    fn abort(&mut self, _env: &mut ControlEnv<'a>) {
        if let Self::StartRecord { phase, .. } = self {
            // Dropping a half-built session closes its stream
            *phase = RecordPhase::Done;
        }
    }
}

/// Schedules movie start/stop operations and installs their results
pub struct MovieTasks {
    queue: TaskQueue<MovieTask>,
    pending: HashMap<TaskHandle, Operation>,
    config: ReplayConfig,
}

impl MovieTasks {
    pub fn new(config: ReplayConfig) -> Self {
        Self {
            queue: TaskQueue::new(),
            pending: HashMap::new(),
            config,
        }
    }

    /// Schedule a recording start; fails fast if a recording is active or pending
    pub fn start_record(
        &mut self,
        registry: &mut SessionRegistry,
        path: impl Into<PathBuf>,
        content_checksum: u32,
    ) -> Result<TaskHandle> {
        registry.reserve(SessionMode::Record)?;
        let task = MovieTask::StartRecord {
            path: path.into(),
            config: RecorderConfig::new(content_checksum, &self.config),
            phase: RecordPhase::WaitForLoad,
        };
        Ok(self.submit(task, Operation::StartRecord))
    }

    /// Schedule a playback start; fails fast if a playback is active or pending
    pub fn start_playback(
        &mut self,
        registry: &mut SessionRegistry,
        path: impl Into<PathBuf>,
        expected_checksum: u32,
    ) -> Result<TaskHandle> {
        registry.reserve(SessionMode::Playback)?;
        let task = MovieTask::StartPlayback {
            path: path.into(),
            config: PlayerConfig::new(expected_checksum, &self.config),
        };
        Ok(self.submit(task, Operation::StartPlayback))
    }

    pub fn stop_record(&mut self, registry: &mut SessionRegistry) -> Result<TaskHandle> {
        let session = registry.record.take_active(SessionMode::Record)?;
        Ok(self.submit(MovieTask::StopRecord(Some(session)), Operation::StopRecord))
    }

    pub fn stop_playback(&mut self, registry: &mut SessionRegistry) -> Result<TaskHandle> {
        let session = registry.playback.take_active(SessionMode::Playback)?;
        Ok(self.submit(MovieTask::StopPlayback(Some(session)), Operation::StopPlayback))
    }

    /// Cancel a pending start; stops cannot be cancelled
    pub fn cancel(&mut self, handle: TaskHandle) -> bool {
        match self.pending.get(&handle) {
            Some(Operation::StartRecord | Operation::StartPlayback) => self.queue.cancel(handle),
            _ => false,
        }
    }

    pub fn state(&self, handle: TaskHandle) -> Option<TaskState> {
        self.queue.state(handle)
    }

    pub fn is_cancelled(&self, handle: TaskHandle) -> bool {
        self.queue.is_cancelled(handle)
    }

    pub fn progress(&self, handle: TaskHandle) -> Option<u8> {
        self.queue.progress(handle)
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    /// Poll every pending task once and settle the ones that finished
    ///
    /// Each finished task produces exactly one notification.
    pub fn tick(&mut self, registry: &mut SessionRegistry, env: &mut ControlEnv<'_>) -> Vec<TaskReport> {
        let completions = self.queue.poll(env);
        let mut reports = Vec::with_capacity(completions.len());
        for completion in completions {
            let Some(operation) = self.pending.remove(&completion.handle) else {
                continue;
            };
            let result = match completion.result {
                Ok(MovieOutput::Recording(session)) => {
                    let message = format!("Recording started: {}", session.path().display());
                    registry.record = Slot::Active(session);
                    self.notify(env, &message);
                    Ok(())
                }
                Ok(MovieOutput::Playback(session)) => {
                    let message = format!("Playback started: {}", session.path().display());
                    registry.playback = Slot::Active(session);
                    self.notify(env, &message);
                    Ok(())
                }
                Ok(MovieOutput::Stopped) => {
                    registry.release(operation.mode());
                    let message = match operation.mode() {
                        SessionMode::Record => "Recording stopped",
                        SessionMode::Playback => "Playback stopped",
                    };
                    self.notify(env, message);
                    Ok(())
                }
                Err(e) => {
                    registry.release(operation.mode());
                    if e.is_cancelled() {
                        tracing::info!("[Replay] {} cancelled", operation.label());
                    } else {
                        tracing::error!("[Replay] {} failed: {}", operation.label(), e);
                    }
                    self.notify(env, &format!("{} failed: {}", operation.label(), e));
                    Err(e)
                }
            };
            reports.push(TaskReport {
                handle: completion.handle,
                operation,
                result,
            });
        }
        reports
    }

    fn submit(&mut self, task: MovieTask, operation: Operation) -> TaskHandle {
        let handle = self.queue.submit(task);
        self.pending.insert(handle, operation);
        handle
    }

    fn notify(&self, env: &mut ControlEnv<'_>, message: &str) {
        push(env.notifier, &self.config.notify, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UndoConfig;
    use crate::io::MemoryStreams;
    use crate::replay::SessionHeader;
    use crate::state::{UndoBuffers, load_state, save_state};
    use crate::test_utils::{RecordingNotifier, TestCore};
    use std::path::Path;

    fn replay_config() -> ReplayConfig {
        let mut config = ReplayConfig::default();
        config.checkpoint.interval = 4;
        config.checkpoint.threshold = 0;
        config.index.capacity_log2 = 8;
        config
    }

    struct Host {
        core: TestCore,
        streams: MemoryStreams,
        notifier: RecordingNotifier,
        registry: SessionRegistry,
        tasks: MovieTasks,
        undo: UndoBuffers,
        loading: bool,
    }

    impl Host {
        fn new() -> Self {
            let config = replay_config();
            Self {
                core: TestCore::new(512),
                streams: MemoryStreams::new(),
                notifier: RecordingNotifier::default(),
                registry: SessionRegistry::new(config.notify.clone()),
                tasks: MovieTasks::new(config),
                undo: UndoBuffers::new(),
                loading: false,
            }
        }

        fn tick(&mut self) -> Vec<TaskReport> {
            let mut env = ControlEnv {
                core: &mut self.core,
                streams: &self.streams,
                notifier: &mut self.notifier,
                load_in_progress: self.loading,
            };
            self.tasks.tick(&mut self.registry, &mut env)
        }

        /// Tick until the task finishes
        fn settle(&mut self, handle: TaskHandle) -> TaskReport {
            for _ in 0..10 {
                if let Some(report) = self.tick().into_iter().find(|r| r.handle == handle) {
                    return report;
                }
            }
            panic!("task did not finish");
        }

        fn start_recording(&mut self, path: &str) {
            let handle = self.tasks.start_record(&mut self.registry, path, 1).unwrap();
            assert!(self.settle(handle).result.is_ok());
        }

        fn stop_recording(&mut self) {
            let handle = self.tasks.stop_record(&mut self.registry).unwrap();
            assert!(self.settle(handle).result.is_ok());
        }

        fn start_playback(&mut self, path: &str) {
            let handle = self.tasks.start_playback(&mut self.registry, path, 1).unwrap();
            assert!(self.settle(handle).result.is_ok());
        }

        /// Record one single-byte frame per input, running the core after each
        fn record(&mut self, inputs: impl IntoIterator<Item = u8>) {
            for i in inputs {
                self.registry
                    .record_frame(&[i], &mut self.core, &mut self.notifier)
                    .unwrap();
                self.core.step(&[i]);
            }
        }

        /// Play up to `frames` frames, running the core after each
        fn play(&mut self, frames: usize) -> Vec<u8> {
            let mut played = Vec::new();
            while played.len() < frames {
                match self
                    .registry
                    .playback_frame(&mut self.core, &mut self.notifier)
                    .unwrap()
                {
                    NextFrame::Input(input) => {
                        self.core.step(&input);
                        played.extend_from_slice(&input);
                    }
                    NextFrame::EndOfRecording => break,
                }
            }
            played
        }

        fn save(&mut self, path: &str) {
            save_state(
                &self.streams,
                Path::new(path),
                &mut self.core,
                &mut self.undo,
                &mut self.registry,
            )
            .unwrap();
        }

        fn load(&mut self, path: &str) -> Result<()> {
            load_state(
                &self.streams,
                Path::new(path),
                &mut self.core,
                &mut self.undo,
                &mut self.registry,
                &mut self.notifier,
                &UndoConfig::default(),
            )
        }
    }

    #[test]
    fn test_record_start_waits_for_load() {
        let mut host = Host::new();
        host.loading = true;
        let handle = host
            .tasks
            .start_record(&mut host.registry, "a.bsv", 1)
            .unwrap();

        for _ in 0..3 {
            assert!(host.tick().is_empty());
        }
        assert_eq!(host.tasks.state(handle), Some(TaskState::Running));
        assert!(!host.streams.exists(Path::new("a.bsv")));

        host.loading = false;
        let report = host.settle(handle);
        assert!(report.result.is_ok());
        assert!(host.registry.is_active(SessionMode::Record));
        assert_eq!(host.notifier.texts(), vec!["Recording started: a.bsv"]);
    }

    #[test]
    fn test_second_start_fails_fast() {
        let mut host = Host::new();
        host.tasks
            .start_record(&mut host.registry, "a.bsv", 1)
            .unwrap();
        assert!(matches!(
            host.tasks.start_record(&mut host.registry, "b.bsv", 1),
            Err(ReplayError::SessionBusy {
                mode: SessionMode::Record
            })
        ));

        let handle = host.tasks.start_playback(&mut host.registry, "c.bsv", 1);
        assert!(handle.is_ok(), "playback slot is independent");
    }

    #[test]
    fn test_cancel_while_queued_leaves_file_untouched() {
        let mut host = Host::new();
        let handle = host
            .tasks
            .start_record(&mut host.registry, "a.bsv", 1)
            .unwrap();
        assert!(host.tasks.cancel(handle));

        let report = host.settle(handle);
        assert!(matches!(report.result, Err(ReplayError::Cancelled)));
        assert!(!host.streams.exists(Path::new("a.bsv")));
        assert!(!host.registry.is_pending(SessionMode::Record));
        assert_eq!(host.notifier.messages.len(), 1);
        assert!(host.tasks.is_cancelled(handle));
    }

    #[test]
    fn test_cancel_while_running_drops_partial_session() {
        let mut host = Host::new();
        let handle = host
            .tasks
            .start_record(&mut host.registry, "a.bsv", 1)
            .unwrap();
        // First tick opens the stream and writes the header
        assert!(host.tick().is_empty());
        assert!(host.streams.exists(Path::new("a.bsv")));

        host.tasks.cancel(handle);
        let report = host.settle(handle);
        assert!(matches!(report.result, Err(ReplayError::Cancelled)));
        assert!(!host.registry.is_active(SessionMode::Record));
        assert_eq!(host.notifier.messages.len(), 1);

        // The slot is free again
        assert!(
            host.tasks
                .start_record(&mut host.registry, "a.bsv", 1)
                .is_ok()
        );
    }

    #[test]
    fn test_record_then_stop() {
        let mut host = Host::new();
        let handle = host
            .tasks
            .start_record(&mut host.registry, "a.bsv", 7)
            .unwrap();
        host.settle(handle);

        for i in 0..6u8 {
            host.registry
                .record_frame(&[i], &mut host.core, &mut host.notifier)
                .unwrap();
            host.core.step(&[i]);
        }
        let handle = host.tasks.stop_record(&mut host.registry).unwrap();
        assert!(!host.tasks.cancel(handle));
        assert!(host.settle(handle).result.is_ok());

        let header =
            SessionHeader::decode(&host.streams.contents(Path::new("a.bsv")).unwrap()).unwrap();
        assert_eq!(header.frame_count, 6);
        assert_eq!(
            host.notifier.texts(),
            vec!["Recording started: a.bsv", "Recording stopped"]
        );
        assert!(matches!(
            host.tasks.stop_record(&mut host.registry),
            Err(ReplayError::SessionClosed)
        ));
    }

    #[test]
    fn test_recording_failure_closes_session_with_one_notification() {
        let mut host = Host::new();
        let handle = host
            .tasks
            .start_record(&mut host.registry, "a.bsv", 1)
            .unwrap();
        host.settle(handle);

        for _ in 0..4 {
            host.registry
                .record_frame(&[1], &mut host.core, &mut host.notifier)
                .unwrap();
        }
        // Frame 4 is due for a checkpoint
        host.core.fail_serialize = true;
        assert!(
            host.registry
                .record_frame(&[1], &mut host.core, &mut host.notifier)
                .is_err()
        );
        assert!(!host.registry.is_active(SessionMode::Record));
        assert_eq!(host.notifier.messages.len(), 2);
        assert!(host.notifier.texts()[1].starts_with("Recording failed"));
        assert!(matches!(
            host.registry
                .record_frame(&[1], &mut host.core, &mut host.notifier),
            Err(ReplayError::SessionClosed)
        ));
    }

    #[test]
    fn test_playback_runs_to_end() {
        let mut host = Host::new();
        let handle = host
            .tasks
            .start_record(&mut host.registry, "a.bsv", 3)
            .unwrap();
        host.settle(handle);
        for i in 0..5u8 {
            host.registry
                .record_frame(&[i], &mut host.core, &mut host.notifier)
                .unwrap();
        }
        let handle = host.tasks.stop_record(&mut host.registry).unwrap();
        host.settle(handle);

        let handle = host
            .tasks
            .start_playback(&mut host.registry, "a.bsv", 3)
            .unwrap();
        assert!(host.settle(handle).result.is_ok());

        let mut inputs = Vec::new();
        loop {
            match host
                .registry
                .playback_frame(&mut host.core, &mut host.notifier)
                .unwrap()
            {
                NextFrame::Input(input) => inputs.push(input),
                NextFrame::EndOfRecording => break,
            }
        }
        assert_eq!(inputs, (0..5u8).map(|i| vec![i]).collect::<Vec<_>>());
        assert!(!host.registry.is_active(SessionMode::Playback));
        assert_eq!(
            host.notifier
                .texts()
                .iter()
                .filter(|t| **t == "Replay finished")
                .count(),
            1
        );
    }

    #[test]
    fn test_playback_start_failure_reports_once() {
        let mut host = Host::new();
        let handle = host
            .tasks
            .start_playback(&mut host.registry, "missing.bsv", 0)
            .unwrap();
        let report = host.settle(handle);
        assert!(matches!(report.result, Err(ReplayError::Io(_))));
        assert!(!host.registry.is_pending(SessionMode::Playback));
        assert_eq!(host.notifier.messages.len(), 1);
        assert!(host.notifier.texts()[0].starts_with("Start playback failed"));
    }

    #[test]
    fn test_state_saved_while_recording_carries_the_replay() {
        let mut host = Host::new();
        host.start_recording("a.bsv");
        host.record(0..6);
        host.save("s.state");

        let state = host.streams.contents(Path::new("s.state")).unwrap();
        assert_eq!(&state[512..516], b"RPLY");
        let replay = SessionHeader::decode(&state[520..]).unwrap();
        assert_eq!(replay.frame_count, 6);
        assert_eq!(
            replay.session_id,
            host.registry.recording().unwrap().header().session_id
        );
    }

    #[test]
    fn test_state_load_rewinds_recording() {
        let mut host = Host::new();
        host.start_recording("a.bsv");
        host.record(0..6);
        host.save("s.state");
        let ram_at_6 = host.core.ram.clone();
        host.record(6..10);

        host.load("s.state").unwrap();
        assert_eq!(host.core.ram, ram_at_6);
        assert_eq!(host.registry.recording().unwrap().frame_count(), 6);

        host.record([0x40, 0x41]);
        let final_ram = host.core.ram.clone();
        host.stop_recording();

        host.start_playback("a.bsv");
        assert_eq!(host.play(100), vec![0, 1, 2, 3, 4, 5, 0x40, 0x41]);
        assert_eq!(host.core.ram, final_ram);
    }

    #[test]
    fn test_state_past_rewind_replaces_recording() {
        let mut host = Host::new();
        host.start_recording("a.bsv");
        host.record(0..8);
        host.save("s.state");
        let ram_at_8 = host.core.ram.clone();
        host.registry.recording_mut().unwrap().rewind_to_frame(3).unwrap();
        host.record([0xEE]);

        // Frame 8 is past the end of the rewound recording
        host.load("s.state").unwrap();
        assert_eq!(host.core.ram, ram_at_8);
        assert_eq!(host.registry.recording().unwrap().frame_count(), 8);

        host.record([0x77]);
        let final_ram = host.core.ram.clone();
        host.stop_recording();

        host.start_playback("a.bsv");
        assert_eq!(host.play(100), vec![0, 1, 2, 3, 4, 5, 6, 7, 0x77]);
        assert_eq!(host.core.ram, final_ram);
    }

    #[test]
    fn test_state_before_wrapped_index_replaces_recording() {
        let mut host = Host::new();
        host.start_recording("a.bsv");
        host.record(0..2);
        host.save("s.state");
        let ram_at_2 = host.core.ram.clone();
        // The index holds 256 frames; frame 2 is no longer rewindable
        host.record((0..298).map(|i| i as u8));
        assert!(!host.registry.recording().unwrap().can_rewind_to(2));

        host.load("s.state").unwrap();
        assert_eq!(host.core.ram, ram_at_2);
        assert_eq!(host.registry.recording().unwrap().frame_count(), 2);
        assert!(!host.registry.recording().unwrap().is_closed());
    }

    #[test]
    fn test_recording_refuses_foreign_state() {
        let mut host = Host::new();
        host.save("bare.state");
        host.start_recording("a.bsv");
        host.record(0..3);
        host.save("own.state");
        let live_ram = host.core.ram.clone();

        assert!(matches!(
            host.load("bare.state"),
            Err(ReplayError::ForeignState {
                mode: SessionMode::Record
            })
        ));

        // Same replay block, different session identifier
        let mut state = host.streams.contents(Path::new("own.state")).unwrap();
        state[540] ^= 0xFF;
        host.streams.insert("other.state", state);
        assert!(matches!(
            host.load("other.state"),
            Err(ReplayError::ForeignState { .. })
        ));

        assert_eq!(host.core.ram, live_ram);
        assert!(host.undo.load.is_empty());
        assert_eq!(host.registry.recording().unwrap().frame_count(), 3);
        assert_eq!(
            host.notifier
                .texts()
                .iter()
                .filter(|t| **t == "Cannot load a state from outside this recording")
                .count(),
            2
        );
    }

    #[test]
    fn test_state_load_seeks_playback() {
        let mut host = Host::new();
        host.start_recording("a.bsv");
        host.record(0..5);
        host.save("rec.state");
        let ram_at_5 = host.core.ram.clone();
        host.record(5..12);
        host.stop_recording();

        host.start_playback("a.bsv");
        assert_eq!(host.play(3), vec![0, 1, 2]);
        host.save("play.state");
        let ram_at_3 = host.core.ram.clone();
        assert_eq!(host.play(6), vec![3, 4, 5, 6, 7, 8]);

        host.load("rec.state").unwrap();
        assert_eq!(host.registry.playback().unwrap().current_frame(), 5);
        assert_eq!(host.core.ram, ram_at_5);

        host.load("play.state").unwrap();
        assert_eq!(host.registry.playback().unwrap().current_frame(), 3);
        assert_eq!(host.core.ram, ram_at_3);
        assert_eq!(host.play(100), vec![3, 4, 5, 6, 7, 8, 9, 10, 11]);
    }

    #[test]
    fn test_foreign_state_halts_playback() {
        let mut host = Host::new();
        host.start_recording("a.bsv");
        host.record(0..4);
        host.stop_recording();
        host.save("bare.state");
        host.core.step(&[9]);

        host.start_playback("a.bsv");
        host.play(2);
        host.load("bare.state").unwrap();
        assert!(!host.registry.is_active(SessionMode::Playback));
        assert_eq!(
            host.notifier.texts().last(),
            Some(&"Playback halted: state is from another replay")
        );
    }

    #[test]
    fn test_playback_refuses_state_past_its_end() {
        let mut host = Host::new();
        host.start_recording("a.bsv");
        host.record(0..10);
        host.save("late.state");
        host.registry.recording_mut().unwrap().rewind_to_frame(5).unwrap();
        host.stop_recording();

        host.start_playback("a.bsv");
        host.play(2);
        let live_ram = host.core.ram.clone();
        assert!(matches!(
            host.load("late.state"),
            Err(ReplayError::OutOfRange {
                frame: 10,
                next: 5,
                ..
            })
        ));
        assert_eq!(host.core.ram, live_ram);
        assert_eq!(host.registry.playback().unwrap().current_frame(), 2);
        assert_eq!(
            host.notifier.texts().last(),
            Some(&"Cannot load a state from outside this replay")
        );
    }
}
