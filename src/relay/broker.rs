//! # Broker State Machine
//!
//! Pure per-connection logic: every input (client frame, upstream event,
//! timer fire, disconnect) returns the [`BrokerAction`]s the connection
//! actor has to perform. No I/O happens here, which keeps ordering and the
//! close-exactly-once rule testable without sockets.
//!
//! ## Invariants:
//! - AUDIO received before the upstream is open is queued, never dropped
//! - The queue drains in arrival order before any newer frame is forwarded
//! - AUDIO between arming and firing of either timer phase cancels both
//! - Once `Closed`, every input yields no actions

use crate::protocol::frames::{ClientFrame, ServerFrame, PARSE_ERROR_MESSAGE};
use crate::protocol::provider::ProviderMessage;
use crate::relay::queue::AudioQueue;
use crate::relay::timer::{InactivityTimer, TimerPhase, TimerTicket};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const CREATE_ERROR_MESSAGE: &str = "Failed to create Gemini session.";
pub const SESSION_ERROR_MESSAGE: &str = "Gemini session error.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    /// Connected, waiting for INITIAL_SETUP
    Idle,
    /// Upstream session requested, not yet open
    Establishing,
    /// Upstream open, model speaking or listening
    Active,
    /// Model finished; warning countdown running
    AwaitingInput,
    /// WARNING sent; hard timeout countdown running
    Warned,
    Closed,
}

/// Why the broker closed the client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    SessionTimeout,
    UpstreamFailed,
    UpstreamClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerAction {
    /// Open the upstream session with this system instruction
    ConnectUpstream { system_instruction: String },
    /// Frame held because the upstream is not open yet
    AudioQueued { depth: usize },
    ForwardAudio(String),
    ForwardText(String),
    /// Client frame of a type the relay does not interpret, verbatim
    ForwardRaw(String),
    /// Provider message passed through verbatim
    ForwardToClient(String),
    SendFrame(ServerFrame),
    SendError(String),
    ScheduleTimer { ticket: TimerTicket, after: Duration },
    CancelTimers,
    CloseUpstream,
    CloseClient(CloseCause),
}

pub struct Broker {
    state: BrokerState,
    queue: AudioQueue,
    pending_text: Vec<String>,
    timer: InactivityTimer,
}

impl Broker {
    pub fn new(warning: Duration, timeout: Duration) -> Self {
        Self {
            state: BrokerState::Idle,
            queue: AudioQueue::new(),
            pending_text: Vec::new(),
            timer: InactivityTimer::new(warning, timeout),
        }
    }

    pub fn state(&self) -> BrokerState {
        self.state
    }

    pub fn queued_audio(&self) -> usize {
        self.queue.len()
    }

    pub fn on_client_frame(&mut self, frame: ClientFrame) -> Vec<BrokerAction> {
        match (self.state, frame) {
            (BrokerState::Closed, _) => Vec::new(),

            (BrokerState::Idle, ClientFrame::InitialSetup(system_instruction)) => {
                info!("Creating upstream session with system instruction");
                self.state = BrokerState::Establishing;
                vec![BrokerAction::ConnectUpstream { system_instruction }]
            }
            (state, ClientFrame::InitialSetup(_)) => {
                warn!(?state, "Duplicate INITIAL_SETUP ignored");
                Vec::new()
            }

            (BrokerState::Idle | BrokerState::Establishing, ClientFrame::Audio(payload)) => {
                self.queue.push(payload);
                debug!(queued = self.queue.len(), "Queueing audio until upstream is ready");
                vec![BrokerAction::AudioQueued { depth: self.queue.len() }]
            }
            (BrokerState::Active, ClientFrame::Audio(payload)) => {
                vec![BrokerAction::ForwardAudio(payload)]
            }
            (BrokerState::AwaitingInput | BrokerState::Warned, ClientFrame::Audio(payload)) => {
                debug!("Client audio resumed, cancelling inactivity timer");
                self.timer.cancel();
                self.state = BrokerState::Active;
                vec![BrokerAction::CancelTimers, BrokerAction::ForwardAudio(payload)]
            }

            (BrokerState::Idle, ClientFrame::Text(_)) => {
                warn!("TEXT received before INITIAL_SETUP, dropping");
                Vec::new()
            }
            (BrokerState::Establishing, ClientFrame::Text(text)) => {
                self.pending_text.push(text);
                Vec::new()
            }
            (BrokerState::Active, ClientFrame::Text(text)) => vec![BrokerAction::ForwardText(text)],
            (BrokerState::AwaitingInput | BrokerState::Warned, ClientFrame::Text(text)) => {
                self.timer.cancel();
                self.state = BrokerState::Active;
                vec![BrokerAction::CancelTimers, BrokerAction::ForwardText(text)]
            }
        }
    }

    /// A well-formed frame of a type the relay does not interpret. Relayed
    /// verbatim once the upstream is open; there is nothing to relay it to
    /// before that. It does not count as candidate activity.
    pub fn on_passthrough_frame(&mut self, kind: &str, raw: String) -> Vec<BrokerAction> {
        match self.state {
            BrokerState::Active | BrokerState::AwaitingInput | BrokerState::Warned => {
                debug!(kind, "Relaying uninterpreted client frame");
                vec![BrokerAction::ForwardRaw(raw)]
            }
            BrokerState::Closed => Vec::new(),
            state => {
                warn!(kind, ?state, "Upstream not open, dropping client frame");
                Vec::new()
            }
        }
    }

    /// A client frame that could not be parsed. The connection stays open.
    pub fn on_invalid_frame(&mut self, reason: &str) -> Vec<BrokerAction> {
        if self.state == BrokerState::Closed {
            return Vec::new();
        }
        warn!(reason, "Failed to parse client frame");
        vec![BrokerAction::SendError(PARSE_ERROR_MESSAGE.to_string())]
    }

    /// Upstream signalled readiness: flush everything held so far, oldest first.
    pub fn on_upstream_open(&mut self) -> Vec<BrokerAction> {
        if self.state != BrokerState::Establishing {
            return Vec::new();
        }
        self.state = BrokerState::Active;

        let queued = self.queue.drain();
        info!(queued = queued.len(), "Upstream session open, draining queued audio");
        let mut actions: Vec<BrokerAction> = queued.into_iter().map(BrokerAction::ForwardAudio).collect();
        actions.extend(self.pending_text.drain(..).map(BrokerAction::ForwardText));
        actions
    }

    pub fn on_upstream_message(&mut self, raw: String) -> Vec<BrokerAction> {
        if self.state == BrokerState::Closed {
            return Vec::new();
        }

        let ends_output = serde_json::from_str::<ProviderMessage>(&raw)
            .map(|message| message.ends_model_output())
            .unwrap_or(false);
        let mut actions = vec![BrokerAction::ForwardToClient(raw)];

        let listening = matches!(
            self.state,
            BrokerState::Active | BrokerState::AwaitingInput | BrokerState::Warned
        );
        if ends_output && listening {
            let (ticket, after) = self.timer.arm_warning();
            debug!(?after, "Model finished speaking, arming inactivity warning");
            self.state = BrokerState::AwaitingInput;
            actions.push(BrokerAction::CancelTimers);
            actions.push(BrokerAction::ScheduleTimer { ticket, after });
        }
        actions
    }

    pub fn on_timer(&mut self, ticket: TimerTicket) -> Vec<BrokerAction> {
        if !self.timer.accept(ticket) {
            debug!(phase = ?ticket.phase, "Ignoring stale timer");
            return Vec::new();
        }

        match (ticket.phase, self.state) {
            (TimerPhase::Warning, BrokerState::AwaitingInput) => {
                info!("No client activity, sending inactivity warning");
                self.state = BrokerState::Warned;
                let (ticket, after) = self.timer.arm_timeout();
                vec![
                    BrokerAction::SendFrame(ServerFrame::inactivity_warning()),
                    BrokerAction::ScheduleTimer { ticket, after },
                ]
            }
            (TimerPhase::Timeout, BrokerState::Warned) => {
                info!("Inactivity timeout reached, closing session");
                self.close();
                vec![
                    BrokerAction::CloseUpstream,
                    BrokerAction::SendFrame(ServerFrame::session_timeout()),
                    BrokerAction::CloseClient(CloseCause::SessionTimeout),
                ]
            }
            _ => Vec::new(),
        }
    }

    /// Upstream failed, either while connecting or mid-session.
    pub fn on_upstream_error(&mut self, reason: &str) -> Vec<BrokerAction> {
        if self.state == BrokerState::Closed {
            return Vec::new();
        }
        let message = if self.state == BrokerState::Establishing {
            CREATE_ERROR_MESSAGE
        } else {
            SESSION_ERROR_MESSAGE
        };
        warn!(reason, state = ?self.state, "Upstream session error");
        self.close();
        vec![
            BrokerAction::CancelTimers,
            BrokerAction::SendError(message.to_string()),
            BrokerAction::CloseUpstream,
            BrokerAction::CloseClient(CloseCause::UpstreamFailed),
        ]
    }

    pub fn on_upstream_closed(&mut self) -> Vec<BrokerAction> {
        if self.state == BrokerState::Closed {
            return Vec::new();
        }
        info!("Upstream session closed, closing client");
        self.close();
        vec![
            BrokerAction::CancelTimers,
            BrokerAction::CloseUpstream,
            BrokerAction::CloseClient(CloseCause::UpstreamClosed),
        ]
    }

    pub fn on_client_disconnect(&mut self) -> Vec<BrokerAction> {
        if self.state == BrokerState::Closed {
            return Vec::new();
        }
        let had_upstream = self.state != BrokerState::Idle;
        self.close();
        let mut actions = vec![BrokerAction::CancelTimers];
        if had_upstream {
            actions.push(BrokerAction::CloseUpstream);
        }
        actions
    }

    fn close(&mut self) {
        self.state = BrokerState::Closed;
        self.timer.cancel();
        self.queue.clear();
        self.pending_text.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GENERATION_COMPLETE: &str = r#"{"serverContent":{"generationComplete":true}}"#;

    fn broker() -> Broker {
        Broker::new(Duration::from_secs(60), Duration::from_secs(60))
    }

    fn open_broker() -> Broker {
        let mut broker = broker();
        broker.on_client_frame(ClientFrame::InitialSetup("ctx".into()));
        broker.on_upstream_open();
        broker
    }

    fn scheduled(actions: &[BrokerAction]) -> TimerTicket {
        actions
            .iter()
            .find_map(|a| match a {
                BrokerAction::ScheduleTimer { ticket, .. } => Some(*ticket),
                _ => None,
            })
            .expect("timer scheduled")
    }

    #[test]
    fn test_audio_queued_until_open_then_drained_in_order() {
        let mut broker = broker();
        let actions = broker.on_client_frame(ClientFrame::InitialSetup("ctx".into()));
        assert_eq!(actions, vec![BrokerAction::ConnectUpstream { system_instruction: "ctx".into() }]);

        for payload in ["a1", "a2", "a3"] {
            broker.on_client_frame(ClientFrame::Audio(payload.into()));
        }
        assert_eq!(broker.queued_audio(), 3);

        let drained = broker.on_upstream_open();
        assert_eq!(
            drained,
            vec![
                BrokerAction::ForwardAudio("a1".into()),
                BrokerAction::ForwardAudio("a2".into()),
                BrokerAction::ForwardAudio("a3".into()),
            ]
        );
        assert_eq!(broker.state(), BrokerState::Active);
        assert_eq!(
            broker.on_client_frame(ClientFrame::Audio("a4".into())),
            vec![BrokerAction::ForwardAudio("a4".into())]
        );
    }

    #[test]
    fn test_audio_before_setup_is_queued() {
        let mut broker = broker();
        let actions = broker.on_client_frame(ClientFrame::Audio("early".into()));
        assert_eq!(actions, vec![BrokerAction::AudioQueued { depth: 1 }]);
        broker.on_client_frame(ClientFrame::InitialSetup("ctx".into()));
        assert_eq!(broker.on_upstream_open(), vec![BrokerAction::ForwardAudio("early".into())]);
    }

    #[test]
    fn test_text_during_establishing_follows_queued_audio() {
        let mut broker = broker();
        broker.on_client_frame(ClientFrame::InitialSetup("ctx".into()));
        broker.on_client_frame(ClientFrame::Audio("a1".into()));
        assert!(broker.on_client_frame(ClientFrame::Text("feedback".into())).is_empty());
        assert_eq!(
            broker.on_upstream_open(),
            vec![BrokerAction::ForwardAudio("a1".into()), BrokerAction::ForwardText("feedback".into())]
        );
    }

    #[test]
    fn test_duplicate_setup_ignored() {
        let mut broker = open_broker();
        assert!(broker.on_client_frame(ClientFrame::InitialSetup("again".into())).is_empty());
        assert_eq!(broker.state(), BrokerState::Active);
    }

    #[test]
    fn test_inactivity_warning_then_timeout() {
        let mut broker = open_broker();
        let actions = broker.on_upstream_message(GENERATION_COMPLETE.to_string());
        assert_eq!(actions[0], BrokerAction::ForwardToClient(GENERATION_COMPLETE.to_string()));
        assert_eq!(broker.state(), BrokerState::AwaitingInput);

        let warning = broker.on_timer(scheduled(&actions));
        assert_eq!(warning[0], BrokerAction::SendFrame(ServerFrame::inactivity_warning()));
        assert_eq!(broker.state(), BrokerState::Warned);

        let timeout = broker.on_timer(scheduled(&warning));
        assert_eq!(
            timeout,
            vec![
                BrokerAction::CloseUpstream,
                BrokerAction::SendFrame(ServerFrame::session_timeout()),
                BrokerAction::CloseClient(CloseCause::SessionTimeout),
            ]
        );
        assert_eq!(broker.state(), BrokerState::Closed);
        assert!(broker.on_client_disconnect().is_empty());
    }

    #[test]
    fn test_audio_cancels_timers() {
        let mut broker = open_broker();
        let armed = broker.on_upstream_message(GENERATION_COMPLETE.to_string());
        let ticket = scheduled(&armed);

        let actions = broker.on_client_frame(ClientFrame::Audio("a".into()));
        assert_eq!(actions[0], BrokerAction::CancelTimers);
        assert_eq!(broker.state(), BrokerState::Active);
        // A fire that raced the cancel is ignored
        assert!(broker.on_timer(ticket).is_empty());
    }

    #[test]
    fn test_audio_while_warned_cancels_timeout() {
        let mut broker = open_broker();
        let armed = broker.on_upstream_message(GENERATION_COMPLETE.to_string());
        let warning = broker.on_timer(scheduled(&armed));
        let timeout_ticket = scheduled(&warning);

        broker.on_client_frame(ClientFrame::Audio("a".into()));
        assert!(broker.on_timer(timeout_ticket).is_empty());
        assert_eq!(broker.state(), BrokerState::Active);
    }

    #[test]
    fn test_turn_complete_also_arms_and_rearm_restarts() {
        let mut broker = open_broker();
        let first = broker.on_upstream_message(r#"{"serverContent":{"turnComplete":true}}"#.into());
        let second = broker.on_upstream_message(GENERATION_COMPLETE.to_string());
        assert!(broker.on_timer(scheduled(&first)).is_empty());
        assert!(!broker.on_timer(scheduled(&second)).is_empty());
    }

    #[test]
    fn test_upstream_failure_before_open() {
        let mut broker = broker();
        broker.on_client_frame(ClientFrame::InitialSetup("ctx".into()));
        let actions = broker.on_upstream_error("dns failure");
        assert!(actions.contains(&BrokerAction::SendError(CREATE_ERROR_MESSAGE.into())));
        assert!(actions.contains(&BrokerAction::CloseClient(CloseCause::UpstreamFailed)));
        assert!(broker.on_upstream_closed().is_empty());
    }

    #[test]
    fn test_upstream_error_mid_session() {
        let mut broker = open_broker();
        let actions = broker.on_upstream_error("reset");
        assert!(actions.contains(&BrokerAction::SendError(SESSION_ERROR_MESSAGE.into())));
        assert!(broker.on_client_frame(ClientFrame::Audio("late".into())).is_empty());
    }

    #[test]
    fn test_invalid_frame_keeps_connection() {
        let mut broker = open_broker();
        assert_eq!(
            broker.on_invalid_frame("expected value"),
            vec![BrokerAction::SendError(PARSE_ERROR_MESSAGE.into())]
        );
        assert_eq!(broker.state(), BrokerState::Active);
    }

    #[test]
    fn test_uninterpreted_frames_follow_the_session() {
        let raw = r#"{"type":"PING","payload":"x"}"#;

        let mut idle = broker();
        assert!(idle.on_passthrough_frame("PING", raw.into()).is_empty());
        idle.on_client_frame(ClientFrame::InitialSetup("ctx".into()));
        assert!(idle.on_passthrough_frame("PING", raw.into()).is_empty());
        assert_eq!(idle.queued_audio(), 0);

        let mut broker = open_broker();
        assert_eq!(
            broker.on_passthrough_frame("PING", raw.into()),
            vec![BrokerAction::ForwardRaw(raw.into())]
        );

        // Forwarded while waiting for input, without cancelling the countdown
        let armed = broker.on_upstream_message(GENERATION_COMPLETE.to_string());
        assert_eq!(
            broker.on_passthrough_frame("PING", raw.into()),
            vec![BrokerAction::ForwardRaw(raw.into())]
        );
        assert_eq!(broker.state(), BrokerState::AwaitingInput);
        assert!(!broker.on_timer(scheduled(&armed)).is_empty());
    }

    #[test]
    fn test_client_disconnect_closes_upstream_once() {
        let mut idle = broker();
        assert_eq!(idle.on_client_disconnect(), vec![BrokerAction::CancelTimers]);

        let mut broker = open_broker();
        assert_eq!(
            broker.on_client_disconnect(),
            vec![BrokerAction::CancelTimers, BrokerAction::CloseUpstream]
        );
        assert!(broker.on_client_disconnect().is_empty());
        assert!(broker.on_upstream_message(GENERATION_COMPLETE.into()).is_empty());
    }
}
