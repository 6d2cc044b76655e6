//! # Session Version Controller
//!
//! Owns the lifecycle of one interview attempt at a time.
//!
//! ## Versioning:
//! Every [`SessionController::start`] and [`SessionController::end`] bumps
//! the controller's version. The task driving an attempt captures its
//! version at spawn time and re-checks it, under the state lock, right
//! before every state mutation. A stale task only cleans up:
//!
//! - every await while acquiring devices and connecting races the version
//!   watch, so a pending microphone grant or relay connect is abandoned and
//!   whatever was already acquired is released as soon as the version moves
//! - a microphone grant that still resolves late is stopped immediately
//! - events from a superseded connection never reach the snapshot
//!
//! Devices are held under a single lease. A newer attempt waits for the
//! older one to release everything before it opens its own microphone, so a
//! higher version existing implies every lower version has let go.
//! "Start, then immediately cancel" is therefore an ordinary case, not a race.
//!
//! ## Teardown:
//! [`LiveSession::release`] closes the relay connection (listeners detached
//! first), stops capture, stops every scheduled playback source, closes the
//! output and stops the microphone track. It is idempotent and also runs on
//! drop, so every exit path releases everything exactly once.

use crate::audio::codec::decode_to_float;
use crate::client::capture::CapturePipeline;
use crate::client::devices::{MediaDevices, MediaTrack, MicrophoneStream};
use crate::client::error::SessionError;
use crate::client::feedback::FeedbackHandoff;
use crate::client::playback::{AudioChunk, AudioOutput, PlaybackScheduler, SourceId};
use crate::client::setup::{interview_prompt, InterviewSetup};
use crate::client::transcript::{Message, TranscriptAggregator};
use crate::client::transport::{RelayConnection, RelayTransport, TransportEvent};
use crate::config::SessionConfig;
use crate::protocol::frames::{ClientFrame, PARSE_ERROR_MESSAGE};
use crate::protocol::provider::{parse_server_events, ServerEvent};

use chrono::Utc;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

/// Client-side knobs, usually derived from the relay's `[session]` config.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub relay_url: String,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub capture_block_size: usize,
    pub feedback_timeout: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &SessionConfig, relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            input_sample_rate: config.input_sample_rate,
            output_sample_rate: config.output_sample_rate,
            capture_block_size: config.capture_block_size,
            feedback_timeout: config.feedback_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionStatus {
    #[default]
    Idle,
    Connecting,
    Active,
    Ended,
    Errored,
}

/// Read-only view handed to consumers.
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    /// Version of the attempt this snapshot describes
    pub version: u64,
    pub status: SessionStatus,
    pub error: Option<SessionError>,
    /// Advisory text from the relay, e.g. the inactivity warning
    pub notice: Option<String>,
    pub messages: Vec<Message>,
    pub agent_speaking: bool,
    /// 0-255 microphone level
    pub mic_level: u8,
    pub feedback_requested: bool,
    pub feedback_complete: bool,
}

#[derive(Debug)]
enum SessionCommand {
    RequestFeedback,
}

/// How a running attempt stopped.
#[derive(Debug)]
enum SessionExit {
    /// A newer version exists; leave the snapshot alone
    Superseded,
    Closed,
    TimedOut(String),
    Failed(SessionError),
}

struct ControllerState {
    version: u64,
    snapshot: SessionSnapshot,
    commands: Option<UnboundedSender<SessionCommand>>,
    mic_level: Option<Arc<AtomicU8>>,
}

struct ControllerShared {
    devices: Arc<dyn MediaDevices>,
    transport: Arc<dyn RelayTransport>,
    settings: SessionSettings,
    state: Mutex<ControllerState>,
    version_tx: watch::Sender<u64>,
    /// One permit: held by whichever attempt owns the microphone and output
    device_lease: Arc<Semaphore>,
}

/// Cheap to clone; all clones drive the same controller.
#[derive(Clone)]
pub struct SessionController {
    shared: Arc<ControllerShared>,
}

impl SessionController {
    pub fn new(devices: Arc<dyn MediaDevices>, transport: Arc<dyn RelayTransport>, settings: SessionSettings) -> Self {
        let (version_tx, _) = watch::channel(0);
        Self {
            shared: Arc::new(ControllerShared {
                devices,
                transport,
                settings,
                state: Mutex::new(ControllerState {
                    version: 0,
                    snapshot: SessionSnapshot::default(),
                    commands: None,
                    mic_level: None,
                }),
                version_tx,
                device_lease: Arc::new(Semaphore::new(1)),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        match self.shared.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn current_version(&self) -> u64 {
        self.lock().version
    }

    /// Begin a new attempt, superseding any running one. Returns its version.
    pub fn start(&self, setup: InterviewSetup) -> u64 {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let version = {
            let mut state = self.lock();
            state.version += 1;
            state.snapshot = SessionSnapshot {
                version: state.version,
                status: SessionStatus::Connecting,
                ..SessionSnapshot::default()
            };
            state.commands = Some(command_tx);
            state.mic_level = None;
            state.version
        };
        self.shared.version_tx.send_replace(version);

        info!(version, "Starting interview session");
        let task = self.clone().run(version, setup, command_rx);
        tokio::spawn(task.instrument(info_span!("session", version)));
        version
    }

    /// User-initiated end. Safe to call at any time, any number of times.
    pub fn end(&self) {
        let version = {
            let mut state = self.lock();
            state.version += 1;
            if matches!(state.snapshot.status, SessionStatus::Connecting | SessionStatus::Active) {
                state.snapshot.status = SessionStatus::Ended;
            }
            state.snapshot.agent_speaking = false;
            state.commands = None;
            state.mic_level = None;
            state.version
        };
        self.shared.version_tx.send_replace(version);
        debug!(version, "Session ended by user");
    }

    /// Ask the interviewer to wrap up with structured feedback.
    /// Returns false when no session is active.
    pub fn request_feedback(&self) -> bool {
        let state = self.lock();
        if state.snapshot.status != SessionStatus::Active {
            return false;
        }
        state
            .commands
            .as_ref()
            .map(|commands| commands.send(SessionCommand::RequestFeedback).is_ok())
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.lock();
        let mut snapshot = state.snapshot.clone();
        snapshot.mic_level = state
            .mic_level
            .as_ref()
            .map(|level| level.load(Ordering::Relaxed))
            .unwrap_or(0);
        snapshot
    }

    fn is_current(&self, version: u64) -> bool {
        self.lock().version == version
    }

    /// Mutate controller state only if `version` is still current.
    fn update(&self, version: u64, f: impl FnOnce(&mut ControllerState)) -> bool {
        let mut state = self.lock();
        if state.version != version {
            return false;
        }
        f(&mut state);
        true
    }

    /// Snapshot mutation for the event loop; a stale version ends the loop.
    fn commit(&self, version: u64, f: impl FnOnce(&mut SessionSnapshot)) -> Result<(), SessionExit> {
        if self.update(version, |state| f(&mut state.snapshot)) {
            Ok(())
        } else {
            Err(SessionExit::Superseded)
        }
    }

    fn fail(&self, version: u64, error: SessionError) {
        warn!("Session failed: {}", error);
        self.update(version, |state| {
            state.snapshot.status = SessionStatus::Errored;
            state.snapshot.error = Some(error);
            state.mic_level = None;
        });
    }

    async fn run(self, version: u64, setup: InterviewSetup, commands: UnboundedReceiver<SessionCommand>) {
        let Some(mut live) = self.establish(version, &setup).await else {
            return;
        };
        let exit = self.drive(version, &mut live, commands).await;
        let leftover = live.transcript.flush(Utc::now());
        live.release();
        self.finish(version, exit, leftover);
    }

    /// Acquire microphone, output and relay connection. Each await is
    /// abandoned as soon as the version moves on.
    async fn establish(&self, version: u64, setup: &InterviewSetup) -> Option<LiveSession> {
        let settings = &self.shared.settings;
        let mut superseded = self.shared.version_tx.subscribe();

        let lease = self.shared.device_lease.clone().acquire_owned();
        let Some(Ok(lease)) = until_superseded(&mut superseded, version, lease).await else {
            debug!("Superseded while the previous session was releasing its devices");
            return None;
        };

        let microphone = self
            .shared
            .devices
            .open_microphone(settings.input_sample_rate, settings.capture_block_size);
        let MicrophoneStream { blocks, mut track } = match until_superseded(&mut superseded, version, microphone).await {
            Some(Ok(microphone)) => microphone,
            Some(Err(e)) => {
                self.fail(version, e);
                return None;
            }
            None => {
                debug!("Superseded while acquiring the microphone");
                return None;
            }
        };
        if !self.is_current(version) {
            debug!("Superseded as the microphone was granted, releasing it");
            track.stop();
            return None;
        }

        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        let output = self.shared.devices.open_output(settings.output_sample_rate, ended_tx);
        let output = match until_superseded(&mut superseded, version, output).await {
            Some(Ok(output)) => output,
            Some(Err(e)) => {
                track.stop();
                self.fail(version, e);
                return None;
            }
            None => {
                debug!("Superseded while opening the output");
                track.stop();
                return None;
            }
        };
        let mut live = LiveSession {
            track,
            blocks,
            ended: ended_rx,
            playback: PlaybackScheduler::new(output),
            capture: CapturePipeline::new(interview_prompt(setup)),
            connection: None,
            incoming: None,
            transcript: TranscriptAggregator::new(),
            feedback: FeedbackHandoff::new(settings.feedback_timeout),
            notice_shown: false,
            released: false,
            _lease: lease,
        };

        let connection = self.shared.transport.connect(&settings.relay_url);
        let connection = match until_superseded(&mut superseded, version, connection).await {
            Some(Ok(connection)) => connection,
            Some(Err(e)) => {
                live.release();
                self.fail(version, e);
                return None;
            }
            None => {
                debug!("Superseded while connecting to the relay, releasing devices");
                live.release();
                return None;
            }
        };
        live.attach(connection);

        let level = live.capture.level_handle();
        let activated = self.update(version, |state| {
            state.snapshot.status = SessionStatus::Active;
            state.mic_level = Some(level);
        });
        if !activated {
            debug!("Superseded as the relay connection opened");
            return None;
        }
        info!("Interview session active");
        Some(live)
    }

    async fn drive(
        &self,
        version: u64,
        live: &mut LiveSession,
        mut commands: UnboundedReceiver<SessionCommand>,
    ) -> SessionExit {
        let mut superseded = self.shared.version_tx.subscribe();
        let Some(mut incoming) = live.incoming.take() else {
            return SessionExit::Closed;
        };
        let mut mic_open = true;

        loop {
            let deadline = live.feedback.deadline();
            let step = tokio::select! {
                biased;

                _ = superseded.wait_for(|current| *current != version) => Err(SessionExit::Superseded),

                block = live.blocks.recv(), if mic_open => match block {
                    Some(block) => self.capture_block(version, live, &block),
                    None => {
                        warn!("Microphone stream ended");
                        mic_open = false;
                        Ok(())
                    }
                },

                event = incoming.recv() => match event {
                    Some(TransportEvent::Message(text)) => self.handle_message(version, live, &text),
                    Some(TransportEvent::Error(e)) => Err(SessionExit::Failed(SessionError::Connection(e))),
                    Some(TransportEvent::Closed) | None => Err(SessionExit::Closed),
                },

                Some(id) = live.ended.recv() => self.source_ended(version, live, id),

                Some(command) = commands.recv() => match command {
                    SessionCommand::RequestFeedback => self.begin_feedback(version, live),
                },

                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.feedback_deadline(version, live)
                }
            };

            if let Err(exit) = step {
                return exit;
            }
        }
    }

    /// Encode and send one microphone block; outbound audio clears a
    /// pending inactivity notice.
    fn capture_block(&self, version: u64, live: &mut LiveSession, block: &[f32]) -> Result<(), SessionExit> {
        let sent_before = live.capture.blocks_sent();
        live.capture.process_block(block);
        if live.notice_shown && live.capture.blocks_sent() > sent_before {
            self.clear_notice(version, live)?;
        }
        Ok(())
    }

    fn clear_notice(&self, version: u64, live: &mut LiveSession) -> Result<(), SessionExit> {
        live.notice_shown = false;
        self.commit(version, |s| s.notice = None)
    }

    fn handle_message(&self, version: u64, live: &mut LiveSession, text: &str) -> Result<(), SessionExit> {
        let events = match parse_server_events(text) {
            Ok(events) => events,
            Err(e) => {
                warn!("Ignoring unparseable relay message: {}", e);
                return Ok(());
            }
        };

        for event in events {
            match event {
                ServerEvent::SetupComplete => debug!("Upstream session ready"),
                ServerEvent::TranscriptionDelta { role, text } => live.transcript.push_transcription(role, &text),
                ServerEvent::ModelText(text) => live.transcript.push_model_text(&text),
                ServerEvent::InlineAudio(payload) => match decode_to_float(&payload) {
                    Ok(samples) => {
                        live.playback.schedule(AudioChunk {
                            samples,
                            sample_rate: self.shared.settings.output_sample_rate,
                        });
                        self.commit(version, |s| s.agent_speaking = true)?;
                    }
                    Err(e) => warn!("Dropping undecodable audio chunk: {}", e),
                },
                ServerEvent::Interrupted => {
                    debug!("Interrupted, flushing playback");
                    live.playback.interrupt();
                    let feedback_done = live.feedback.on_playback_drained();
                    self.commit(version, |s| {
                        s.agent_speaking = false;
                        s.feedback_complete |= feedback_done;
                    })?;
                }
                ServerEvent::GenerationComplete | ServerEvent::TurnComplete => {
                    if live.notice_shown {
                        self.clear_notice(version, live)?;
                    }
                    let messages = live.transcript.flush(Utc::now());
                    let feedback_done = live.feedback.on_turn_complete(!live.playback.is_speaking());
                    self.commit(version, |s| {
                        s.messages.extend(messages);
                        s.feedback_complete |= feedback_done;
                    })?;
                }
                ServerEvent::Warning(message) => {
                    info!("Relay warning: {}", message);
                    live.notice_shown = true;
                    self.commit(version, |s| s.notice = Some(message))?;
                }
                ServerEvent::SessionTimeout(message) => return Err(SessionExit::TimedOut(message)),
                // The relay keeps the connection open after rejecting a frame
                ServerEvent::Error(message) if message == PARSE_ERROR_MESSAGE => {
                    warn!("Relay rejected a frame: {}", message);
                }
                ServerEvent::Error(message) => return Err(SessionExit::Failed(SessionError::Upstream(message))),
            }
        }
        Ok(())
    }

    fn source_ended(&self, version: u64, live: &mut LiveSession, id: SourceId) -> Result<(), SessionExit> {
        if !live.playback.source_ended(id) {
            return Ok(());
        }
        let feedback_done = live.feedback.on_playback_drained();
        self.commit(version, |s| {
            s.agent_speaking = false;
            s.feedback_complete |= feedback_done;
        })
    }

    fn begin_feedback(&self, version: u64, live: &mut LiveSession) -> Result<(), SessionExit> {
        let Some(prompt) = live.feedback.request(Instant::now()) else {
            debug!("Feedback already requested");
            return Ok(());
        };

        let sent = live.capture.ensure_handshake()
            && live
                .connection
                .as_ref()
                .map(|connection| connection.outgoing().send(ClientFrame::Text(prompt)).is_ok())
                .unwrap_or(false);
        if !sent {
            warn!("Could not send feedback request, resuming capture");
            live.feedback.cancel();
            return Ok(());
        }

        live.capture.set_muted(true);
        info!("Feedback requested, capture muted");
        self.commit(version, |s| s.feedback_requested = true)
    }

    fn feedback_deadline(&self, version: u64, live: &mut LiveSession) -> Result<(), SessionExit> {
        if !live.feedback.on_deadline(Instant::now()) {
            return Ok(());
        }
        warn!("Feedback deadline passed, completing with the partial transcript");
        let messages = live.transcript.flush(Utc::now());
        self.commit(version, |s| {
            s.messages.extend(messages);
            s.feedback_complete = true;
        })
    }

    fn finish(&self, version: u64, exit: SessionExit, leftover: Vec<Message>) {
        info!(?exit, "Interview session finished");
        self.update(version, |state| {
            let snapshot = &mut state.snapshot;
            snapshot.messages.extend(leftover);
            snapshot.agent_speaking = false;
            match exit {
                SessionExit::Superseded => {}
                SessionExit::Closed => snapshot.status = SessionStatus::Ended,
                SessionExit::TimedOut(message) => {
                    snapshot.status = SessionStatus::Ended;
                    snapshot.notice = Some(message.clone());
                    snapshot.error = Some(SessionError::SessionTimeout(message));
                }
                SessionExit::Failed(error) => {
                    snapshot.status = SessionStatus::Errored;
                    snapshot.error = Some(error);
                }
            }
            state.commands = None;
            state.mic_level = None;
        });
    }
}

/// Run `future` unless the controller moves past `version` first.
async fn until_superseded<F: Future>(superseded: &mut watch::Receiver<u64>, version: u64, future: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = superseded.wait_for(|current| *current != version) => None,
        output = future => Some(output),
    }
}

/// Everything one live attempt holds.
struct LiveSession {
    track: Box<dyn MediaTrack>,
    blocks: mpsc::Receiver<Vec<f32>>,
    ended: UnboundedReceiver<SourceId>,
    playback: PlaybackScheduler<Box<dyn AudioOutput>>,
    capture: CapturePipeline<UnboundedSender<ClientFrame>>,
    connection: Option<RelayConnection>,
    incoming: Option<UnboundedReceiver<TransportEvent>>,
    transcript: TranscriptAggregator,
    feedback: FeedbackHandoff,
    /// A relay notice is on the snapshot
    notice_shown: bool,
    released: bool,
    /// Dropped after `Drop::drop` has released everything above
    _lease: OwnedSemaphorePermit,
}

impl LiveSession {
    fn attach(&mut self, mut connection: RelayConnection) {
        self.incoming = connection.take_incoming();
        self.capture.start(connection.outgoing());
        self.connection = Some(connection);
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(mut connection) = self.connection.take() {
            connection.close();
        }
        self.incoming = None;
        self.capture.stop();
        self.playback.close();
        self.track.stop();
        self.blocks.close();
        debug!("Session resources released");
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.release();
    }
}
