//! # Relay WebSocket Handler
//!
//! Clients connect to `/ws`; each connection becomes one [`RelaySocket`]
//! actor owning one [`Broker`] and at most one upstream session.
//!
//! ## Inputs the actor feeds into the broker:
//! 1. **Client frames**: WebSocket text (or UTF-8 binary) JSON
//! 2. **Upstream events**: added as a second actor stream once the session exists
//! 3. **Timer fires**: `run_later` callbacks carrying the arming ticket
//! 4. **Disconnect**: the actor stopping for any reason
//!
//! The broker decides; this actor only performs the returned actions.

use crate::error::AppError;
use crate::protocol::frames::{ErrorFrame, InboundFrame, ServerFrame};
use crate::relay::broker::{Broker, BrokerAction, CloseCause};
use crate::relay::upstream::{UpstreamCommand, UpstreamEvent, UpstreamSession, UpstreamSetup};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, info_span, warn, Span};
use uuid::Uuid;

/// Forwarded audio is logged once per this many frames.
const PROGRESS_LOG_INTERVAL: u64 = 10;

/// WebSocket actor bridging one client to one upstream session.
pub struct RelaySocket {
    connection_id: Uuid,
    span: Span,
    broker: Broker,
    upstream: Option<UpstreamSession>,
    app_state: AppState,
    timers: Vec<SpawnHandle>,
    forwarded_audio: u64,
}

impl RelaySocket {
    pub fn new(app_state: AppState) -> Self {
        let session = app_state.get_config().session;
        let connection_id = Uuid::new_v4();
        Self {
            connection_id,
            span: info_span!("relay", %connection_id),
            broker: Broker::new(session.inactivity_warning(), session.session_timeout()),
            upstream: None,
            app_state,
            timers: Vec::new(),
            forwarded_audio: 0,
        }
    }

    fn apply(&mut self, actions: Vec<BrokerAction>, ctx: &mut ws::WebsocketContext<Self>) {
        for action in actions {
            match action {
                BrokerAction::ConnectUpstream { system_instruction } => {
                    let mut session = self.app_state.upstream.open(UpstreamSetup { system_instruction });
                    self.app_state.upstream_opened();
                    if let Some(events) = session.take_events() {
                        ctx.add_stream(UnboundedReceiverStream::new(events));
                    }
                    self.upstream = Some(session);
                }
                BrokerAction::AudioQueued { depth } => {
                    debug!(queued = depth, "Audio queued while upstream is establishing");
                    self.app_state.audio_queued();
                }
                BrokerAction::ForwardAudio(payload) => {
                    self.send_upstream(UpstreamCommand::Audio(payload));
                    self.forwarded_audio += 1;
                    self.app_state.audio_forwarded();
                    if self.forwarded_audio % PROGRESS_LOG_INTERVAL == 0 {
                        info!(frames = self.forwarded_audio, "Audio frames relayed upstream");
                    }
                }
                BrokerAction::ForwardText(text) => {
                    debug!(len = text.len(), "Relaying text turn upstream");
                    self.send_upstream(UpstreamCommand::Text(text));
                }
                BrokerAction::ForwardRaw(raw) => self.send_upstream(UpstreamCommand::Raw(raw)),
                BrokerAction::ForwardToClient(raw) => ctx.text(raw),
                BrokerAction::SendFrame(frame) => {
                    match &frame {
                        ServerFrame::Warning { .. } => self.app_state.warning_sent(),
                        ServerFrame::SessionTimeout { .. } => self.app_state.session_timed_out(),
                    }
                    match serde_json::to_string(&frame) {
                        Ok(json) => ctx.text(json),
                        Err(e) => error!("Failed to serialize server frame: {}", e),
                    }
                }
                BrokerAction::SendError(message) => {
                    if let Ok(json) = serde_json::to_string(&ErrorFrame::new(message)) {
                        ctx.text(json);
                    }
                }
                BrokerAction::ScheduleTimer { ticket, after } => {
                    let handle = ctx.run_later(after, move |act, ctx| {
                        let span = act.span.clone();
                        let _entered = span.enter();
                        let actions = act.broker.on_timer(ticket);
                        act.apply(actions, ctx);
                    });
                    self.timers.push(handle);
                }
                BrokerAction::CancelTimers => {
                    for handle in self.timers.drain(..) {
                        ctx.cancel_future(handle);
                    }
                }
                BrokerAction::CloseUpstream => {
                    if let Some(session) = self.upstream.take() {
                        session.close();
                    }
                }
                BrokerAction::CloseClient(cause) => {
                    info!(?cause, "Closing client connection");
                    ctx.close(Some(close_reason(cause)));
                    ctx.stop();
                }
            }
        }
    }

    fn send_upstream(&self, command: UpstreamCommand) {
        match &self.upstream {
            Some(session) => {
                if !session.send(command) {
                    warn!("Upstream session task is gone, dropping frame");
                }
            }
            None => warn!("No upstream session, dropping frame"),
        }
    }

    fn handle_client_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let actions = match InboundFrame::parse(text) {
            Ok(InboundFrame::Client(frame)) => {
                debug!(kind = frame.kind(), "Received client frame");
                self.broker.on_client_frame(frame)
            }
            Ok(InboundFrame::Passthrough { kind, raw }) => self.broker.on_passthrough_frame(&kind, raw),
            Err(e) => self.broker.on_invalid_frame(&e.to_string()),
        };
        self.apply(actions, ctx);
    }
}

fn close_reason(cause: CloseCause) -> ws::CloseReason {
    let (code, description) = match cause {
        CloseCause::SessionTimeout => (ws::CloseCode::Normal, "session timeout"),
        CloseCause::UpstreamFailed => (ws::CloseCode::Error, "upstream session error"),
        CloseCause::UpstreamClosed => (ws::CloseCode::Normal, "upstream session closed"),
    };
    ws::CloseReason {
        code,
        description: Some(description.to_string()),
    }
}

impl Actor for RelaySocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, _ctx: &mut Self::Context) {
        let _entered = self.span.enter();
        info!("Client connected");
    }

    fn stopped(&mut self, ctx: &mut Self::Context) {
        let span = self.span.clone();
        let _entered = span.enter();
        let actions = self.broker.on_client_disconnect();
        self.apply(actions, ctx);
        self.app_state.connection_closed();
        info!(frames = self.forwarded_audio, "Client disconnected");
    }
}

/// Frames from the client socket.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelaySocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let span = self.span.clone();
        let _entered = span.enter();
        match msg {
            Ok(ws::Message::Text(text)) => self.handle_client_text(&text, ctx),
            Ok(ws::Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => self.handle_client_text(text, ctx),
                Err(e) => {
                    let actions = self.broker.on_invalid_frame(&e.to_string());
                    self.apply(actions, ctx);
                }
            },
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                info!(?reason, "Client closed the connection");
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Events from the upstream session task.
impl StreamHandler<UpstreamEvent> for RelaySocket {
    fn handle(&mut self, event: UpstreamEvent, ctx: &mut Self::Context) {
        let span = self.span.clone();
        let _entered = span.enter();
        let actions = match event {
            UpstreamEvent::Open => self.broker.on_upstream_open(),
            UpstreamEvent::Message(raw) => self.broker.on_upstream_message(raw),
            UpstreamEvent::Error(reason) => {
                self.app_state.upstream_failed();
                self.broker.on_upstream_error(&reason)
            }
            UpstreamEvent::Closed => self.broker.on_upstream_closed(),
        };
        self.apply(actions, ctx);
    }

    // The upstream stream ending must not stop the client connection;
    // `Closed` already went through the broker.
    fn finished(&mut self, _ctx: &mut Self::Context) {
        debug!(connection_id = %self.connection_id, "Upstream event stream ended");
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Reserves a connection slot first and refuses the upgrade with 503 when
/// the relay already serves `max_concurrent_sessions` clients; otherwise
/// hands the connection to a new [`RelaySocket`] actor.
pub async fn relay_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!("New relay connection request from: {:?}", req.connection_info().peer_addr());

    if !app_state.try_open_connection() {
        warn!("Refusing relay connection, session limit reached");
        return Err(AppError::Capacity("Maximum concurrent sessions reached".to_string()).into());
    }

    // The actor releases the slot in `stopped`; a failed handshake never starts it
    let response = ws::start(RelaySocket::new(app_state.get_ref().clone()), &req, stream);
    if response.is_err() {
        app_state.connection_closed();
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_reasons() {
        assert_eq!(close_reason(CloseCause::SessionTimeout).code, ws::CloseCode::Normal);
        assert_eq!(close_reason(CloseCause::UpstreamFailed).code, ws::CloseCode::Error);
        assert_eq!(
            close_reason(CloseCause::UpstreamClosed).description.as_deref(),
            Some("upstream session closed")
        );
    }
}
