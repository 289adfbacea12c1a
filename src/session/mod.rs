//! Recording session controller
//!
//! Owns the session state machine and wires the pipeline together:
//! read loop (tokio task) -> frame buffer -> segment writer (OS thread) ->
//! storage handle. Children report events over channels; only the actor
//! task in this module ever changes [`SessionState`].

mod reader;
mod state;

pub use state::{SessionState, Transition};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::buffer::FrameBuffer;
use crate::config::Config;
use crate::error::{ErrorKind, RecorderError, StorageError};
use crate::media::StreamDescriptor;
use crate::mux::{SegmentInfo, SegmentWriter, WriterEvent, WriterHandle};
use crate::reconnect::ReconnectPolicy;
use crate::status::StatusEvent;
use crate::storage::StorageHandle;
use crate::transport::Connector;
use reader::{ReadLoop, ReaderEvent};

/// Final result of a recording run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RecordingOutcome {
    Stopped {
        segments: Vec<SegmentInfo>,
    },
    Failed {
        kind: ErrorKind,
        segments: Vec<SegmentInfo>,
    },
}

impl RecordingOutcome {
    pub fn segments(&self) -> &[SegmentInfo] {
        match self {
            RecordingOutcome::Stopped { segments } | RecordingOutcome::Failed { segments, .. } => segments,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            RecordingOutcome::Stopped { .. } => None,
            RecordingOutcome::Failed { kind, .. } => Some(*kind),
        }
    }
}

/// Commands accepted by the controller actor
#[derive(Debug, Clone, Copy)]
enum Command {
    Stop,
}

/// Cloneable handle for requesting a stop from anywhere, including
/// non-async contexts such as a signal handler
#[derive(Clone)]
pub struct ControlHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl ControlHandle {
    pub fn stop(&self) {
        if self.cmd_tx.try_send(Command::Stop).is_err() {
            debug!("Stop ignored: controller not running or already stopping");
        }
    }
}

/// Single writer of the session state
struct StateMachine {
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    status_tx: broadcast::Sender<StatusEvent>,
}

impl StateMachine {
    fn apply(&mut self, transition: Transition) -> bool {
        let Some(next) = self.state.apply(transition) else {
            debug!("Ignoring {:?} in state {}", transition, self.state);
            return false;
        };
        if next == self.state {
            return false;
        }
        info!("State {} -> {} ({:?})", self.state, next, transition);
        let from = std::mem::replace(&mut self.state, next);
        self.state_tx.send_replace(next);
        self.publish(StatusEvent::StateChanged { from, to: next });
        true
    }

    fn publish(&self, event: StatusEvent) {
        // No subscribers is fine
        let _ = self.status_tx.send(event);
    }
}

pub struct RecordingController {
    config: Config,
    connector: Arc<dyn Connector>,
    run_id: Uuid,
    state_tx: Option<watch::Sender<SessionState>>,
    state_rx: watch::Receiver<SessionState>,
    status_tx: broadcast::Sender<StatusEvent>,
    cmd_tx: mpsc::Sender<Command>,
    cmd_rx: Option<mpsc::Receiver<Command>>,
    outcome_rx: Option<oneshot::Receiver<RecordingOutcome>>,
    outcome: Option<RecordingOutcome>,
    task: Option<JoinHandle<()>>,
}

impl RecordingController {
    pub fn new(config: Config, connector: Arc<dyn Connector>) -> Self {
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (status_tx, _) = broadcast::channel(64);
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        Self {
            config,
            connector,
            run_id: Uuid::new_v4(),
            state_tx: Some(state_tx),
            state_rx,
            status_tx,
            cmd_tx,
            cmd_rx: Some(cmd_rx),
            outcome_rx: None,
            outcome: None,
            task: None,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Start recording `descriptor` into `storage`. Returns once the
    /// pipeline is running; progress is reported through [`Self::subscribe`].
    pub fn start(
        &mut self,
        descriptor: StreamDescriptor,
        storage: Arc<dyn StorageHandle>,
    ) -> Result<(), RecorderError> {
        let (Some(state_tx), Some(cmd_rx)) = (self.state_tx.take(), self.cmd_rx.take()) else {
            return Err(RecorderError::AlreadyStarted(self.current_state()));
        };
        let mut machine = StateMachine {
            state: SessionState::Idle,
            state_tx,
            status_tx: self.status_tx.clone(),
        };

        if let Err(e) = self.config.validate() {
            error!("Refusing to start: {}", e);
            self.fail_before_start(&mut machine, ErrorKind::Configuration);
            return Err(e.into());
        }
        if !storage.is_valid() {
            let e = StorageError::Permission(format!("{} is not writable", storage.location()));
            error!("Refusing to start: {}", e);
            self.fail_before_start(&mut machine, ErrorKind::Permission);
            return Err(e.into());
        }

        let buffer = Arc::new(FrameBuffer::new(&self.config.buffer));
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let writer = SegmentWriter::new(
            self.config.recording.clone(),
            self.config.writer.clone(),
            Arc::clone(&storage),
            Arc::clone(&buffer),
            writer_tx,
        )
        .spawn()
        .map_err(StorageError::Io);
        let writer = match writer {
            Ok(writer) => writer,
            Err(e) => {
                error!("Failed to start segment writer: {}", e);
                self.fail_before_start(&mut machine, ErrorKind::Io);
                return Err(e.into());
            }
        };

        let span = tracing::info_span!("recording", run = %self.run_id);
        let cancel = CancellationToken::new();
        let (reader_tx, reader_rx) = mpsc::unbounded_channel();
        let read_loop = ReadLoop {
            connector: Arc::clone(&self.connector),
            descriptor: descriptor.clone(),
            transport: self.config.transport.clone(),
            policy: ReconnectPolicy::new(self.config.reconnect.clone(), self.run_id.to_string()),
            buffer: Arc::clone(&buffer),
            events: reader_tx,
            cancel: cancel.clone(),
        };

        info!(
            "Starting recording {} of {} into {}",
            self.run_id,
            descriptor.url(),
            storage.location()
        );
        machine.apply(Transition::Start);
        let reader = tokio::spawn(read_loop.run().instrument(span.clone()));

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let actor = SessionActor {
            config: self.config.clone(),
            machine,
            cmd_rx,
            reader_rx,
            writer_rx,
            buffer,
            writer: Some(writer),
            reader,
            cancel,
            segments: Vec::new(),
            pending_failure: None,
            deadline: None,
            writer_done: false,
        };
        self.task = Some(tokio::spawn(
            async move {
                let outcome = actor.run().await;
                let _ = outcome_tx.send(outcome);
            }
            .instrument(span),
        ));
        self.outcome_rx = Some(outcome_rx);
        Ok(())
    }

    fn fail_before_start(&mut self, machine: &mut StateMachine, kind: ErrorKind) {
        machine.apply(Transition::Fatal(kind));
        let outcome = RecordingOutcome::Failed {
            kind,
            segments: Vec::new(),
        };
        machine.publish(StatusEvent::Finished(outcome.clone()));
        self.outcome = Some(outcome);
    }

    /// Request a cooperative stop
    pub fn stop(&self) {
        self.handle().stop();
    }

    pub fn handle(&self) -> ControlHandle {
        ControlHandle {
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    pub fn current_state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Watch state changes
    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Status events for the lifecycle layer
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.status_tx.subscribe()
    }

    /// Wait for the run to end and return its outcome
    pub async fn wait(&mut self) -> RecordingOutcome {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        let outcome = match self.outcome_rx.take() {
            Some(rx) => rx.await.unwrap_or_else(|_| {
                error!("Controller task ended without an outcome");
                RecordingOutcome::Failed {
                    kind: ErrorKind::Io,
                    segments: Vec::new(),
                }
            }),
            None => RecordingOutcome::Stopped { segments: Vec::new() },
        };
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.outcome = Some(outcome.clone());
        outcome
    }
}

struct SessionActor {
    config: Config,
    machine: StateMachine,
    cmd_rx: mpsc::Receiver<Command>,
    reader_rx: mpsc::UnboundedReceiver<ReaderEvent>,
    writer_rx: mpsc::UnboundedReceiver<WriterEvent>,
    buffer: Arc<FrameBuffer>,
    writer: Option<WriterHandle>,
    reader: JoinHandle<()>,
    cancel: CancellationToken,
    segments: Vec<SegmentInfo>,
    /// Failure to apply once the writer has flushed
    pending_failure: Option<Transition>,
    /// Bound on waiting for the writer
    deadline: Option<Instant>,
    writer_done: bool,
}

impl SessionActor {
    async fn run(mut self) -> RecordingOutcome {
        while !self.machine.state.is_terminal() {
            let deadline = self.deadline;
            tokio::select! {
                Some(cmd) = self.cmd_rx.recv() => match cmd {
                    Command::Stop => self.on_stop(),
                },
                Some(event) = self.reader_rx.recv() => self.on_reader_event(event),
                event = self.writer_rx.recv(), if !self.writer_done => match event {
                    Some(event) => self.on_writer_event(event),
                    None => {
                        warn!("Segment writer exited without reporting");
                        self.pending_failure.get_or_insert(Transition::Fatal(ErrorKind::Io));
                        self.begin_shutdown();
                        self.on_writer_finished();
                    }
                },
                _ = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                } => self.on_flush_timeout(),
                else => {
                    warn!("All pipeline channels closed");
                    self.on_writer_finished();
                }
            }
        }

        self.cancel.cancel();
        if let Some(writer) = self.writer.take() {
            if !writer.is_finished() {
                writer.detach();
            }
        }
        if !self.reader.is_finished() {
            self.reader.abort();
        }

        let segments = std::mem::take(&mut self.segments);
        let outcome = match self.machine.state {
            SessionState::Failed(kind) => RecordingOutcome::Failed { kind, segments },
            _ => RecordingOutcome::Stopped { segments },
        };
        info!(
            "Recording finished: {} ({} segments)",
            self.machine.state,
            outcome.segments().len()
        );
        self.machine.publish(StatusEvent::Finished(outcome.clone()));
        outcome
    }

    /// Stop the read loop and let the writer drain, bounded by the flush timeout
    fn begin_shutdown(&mut self) {
        self.cancel.cancel();
        self.buffer.close();
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.config.writer.flush_timeout());
        }
    }

    fn on_stop(&mut self) {
        if self.machine.apply(Transition::StopRequested) {
            info!("Stop requested, finalizing");
            self.begin_shutdown();
        }
    }

    fn on_reader_event(&mut self, event: ReaderEvent) {
        match event {
            ReaderEvent::Connected { descriptor, continuity } => {
                debug!("Connected: {:?} ({:?})", descriptor, continuity);
                self.machine.apply(Transition::Connected);
            }
            ReaderEvent::Lost { error, attempt, delay } => {
                self.machine.apply(Transition::TransportLost);
                self.machine.publish(StatusEvent::Reconnecting {
                    attempt,
                    delay,
                    reason: error.to_string(),
                });
            }
            ReaderEvent::GaveUp(error) => {
                error!("Transport failed for good: {}", error);
                if self.pending_failure.is_none() {
                    self.pending_failure = Some(Transition::GaveUp(ErrorKind::from(&error)));
                }
                self.begin_shutdown();
                self.maybe_finish();
            }
            ReaderEvent::FramesDropped { lane, frames, keyframe } => {
                warn!("Frame buffer full: dropped {} {} frame(s)", frames, lane);
                self.machine.publish(StatusEvent::FramesDropped { lane, frames, keyframe });
            }
        }
    }

    fn on_writer_event(&mut self, event: WriterEvent) {
        match event {
            WriterEvent::SegmentOpened { index, name } => {
                self.machine.publish(StatusEvent::SegmentStarted { index, name });
            }
            WriterEvent::SegmentClosed(info) => {
                self.segments.push(info.clone());
                self.machine.publish(StatusEvent::SegmentClosed(info));
            }
            WriterEvent::SegmentDiscarded { name, bytes, .. } => {
                debug!("Segment {} discarded ({} bytes)", name, bytes);
            }
            WriterEvent::WriteFailed { attempt, error } => {
                warn!("Write attempt {} failed: {}", attempt, error);
            }
            WriterEvent::StorageRevoked { reason } => {
                error!("Storage invalidated: {}", reason);
                self.machine.apply(Transition::StorageLost);
                self.begin_shutdown();
            }
            WriterEvent::Fatal { error } => {
                error!("Writer failed: {}", error);
                self.pending_failure = Some(Transition::Fatal(ErrorKind::Io));
                self.begin_shutdown();
            }
            WriterEvent::Finished {
                reordered_dropped,
                skipped_frames,
                abandoned_frames,
            } => {
                if reordered_dropped > 0 {
                    warn!("{} out-of-order frames were dropped", reordered_dropped);
                }
                if skipped_frames > 0 {
                    info!("{} frames skipped waiting for a keyframe or malformed", skipped_frames);
                }
                if abandoned_frames > 0 {
                    warn!("{} buffered frames were never written", abandoned_frames);
                }
                self.on_writer_finished();
            }
        }
    }

    fn on_writer_finished(&mut self) {
        self.writer_done = true;
        self.maybe_finish();
    }

    /// Settle the run once the writer has nothing left to flush
    fn maybe_finish(&mut self) {
        if !self.writer_done {
            return;
        }
        if let Some(failure) = self.pending_failure.take() {
            // A give-up that raced a stop request is absorbed by Finalizing
            if self.machine.apply(failure) {
                return;
            }
        }
        if self.machine.state == SessionState::Finalizing {
            self.machine.apply(Transition::FlushDone);
        }
    }

    fn on_flush_timeout(&mut self) {
        warn!(
            "Writer did not flush within {}ms, forcing shutdown",
            self.config.writer.flush_timeout_ms
        );
        self.deadline = None;
        if let Some(writer) = &self.writer {
            writer.abort();
        }
        self.writer_done = true;
        self.maybe_finish();
    }
}
