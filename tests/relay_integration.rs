//! End-to-end relay behavior over real WebSockets, with a scripted upstream.

use actix_web::{web, App, HttpServer};
use futures_util::{SinkExt, StreamExt};
use interview_relay::config::AppConfig;
use interview_relay::protocol::frames::{ClientFrame, INACTIVITY_WARNING_MESSAGE, SESSION_TIMEOUT_MESSAGE};
use interview_relay::relay::relay_websocket;
use interview_relay::relay::upstream::{
    UpstreamCommand, UpstreamConnector, UpstreamEvent, UpstreamPeer, UpstreamSession, UpstreamSetup,
};
use interview_relay::state::AppState;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Hands every opened session's provider end to the test.
#[derive(Clone, Default)]
struct ScriptedConnector {
    opened: Arc<Mutex<Vec<(UpstreamSetup, UpstreamPeer)>>>,
}

impl ScriptedConnector {
    async fn next_peer(&self) -> (UpstreamSetup, UpstreamPeer) {
        for _ in 0..200 {
            if let Some(opened) = self.opened.lock().unwrap().pop() {
                return opened;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("relay never opened an upstream session");
    }
}

impl UpstreamConnector for ScriptedConnector {
    fn open(&self, setup: UpstreamSetup) -> UpstreamSession {
        let (session, peer) = UpstreamSession::channel();
        self.opened.lock().unwrap().push((setup, peer));
        session
    }
}

fn start_relay(config: AppConfig, connector: ScriptedConnector) -> SocketAddr {
    let state = AppState::new(config, Arc::new(connector));
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .route("/ws", web::get().to(relay_websocket))
    })
    .workers(1)
    .bind(("127.0.0.1", 0))
    .unwrap();
    let addr = server.addrs()[0];
    actix_web::rt::spawn(server.run());
    addr
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
    client
}

async fn send(client: &mut Client, frame: ClientFrame) {
    let json = serde_json::to_string(&frame).unwrap();
    client.send(Message::Text(json)).await.unwrap();
}

/// Next text frame; `None` once the relay closed the connection.
async fn next_text(client: &mut Client) -> Option<String> {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for the relay");
        match message {
            Some(Ok(Message::Text(text))) => return Some(text),
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => continue,
        }
    }
}

async fn next_command(peer: &mut UpstreamPeer) -> Option<UpstreamCommand> {
    tokio::time::timeout(Duration::from_secs(5), peer.commands.recv())
        .await
        .expect("timed out waiting for an upstream command")
}

#[actix_web::test]
async fn test_queued_input_is_flushed_in_order() {
    let connector = ScriptedConnector::default();
    let addr = start_relay(AppConfig::default(), connector.clone());
    let mut client = connect(addr).await;

    send(&mut client, ClientFrame::InitialSetup("Interview for a Rust role".into())).await;
    send(&mut client, ClientFrame::Audio("first".into())).await;
    send(&mut client, ClientFrame::Audio("second".into())).await;
    send(&mut client, ClientFrame::Audio("third".into())).await;
    send(&mut client, ClientFrame::Text("hello".into())).await;

    let (setup, mut peer) = connector.next_peer().await;
    assert_eq!(setup.system_instruction, "Interview for a Rust role");

    peer.events.send(UpstreamEvent::Open).unwrap();
    assert_eq!(next_command(&mut peer).await, Some(UpstreamCommand::Audio("first".into())));
    assert_eq!(next_command(&mut peer).await, Some(UpstreamCommand::Audio("second".into())));
    assert_eq!(next_command(&mut peer).await, Some(UpstreamCommand::Audio("third".into())));
    assert_eq!(next_command(&mut peer).await, Some(UpstreamCommand::Text("hello".into())));

    // Once open, audio goes straight through
    send(&mut client, ClientFrame::Audio("fourth".into())).await;
    assert_eq!(next_command(&mut peer).await, Some(UpstreamCommand::Audio("fourth".into())));

    // Provider messages reach the client verbatim
    let raw = r#"{"serverContent":{"outputTranscription":{"text":"Welcome"}}}"#;
    peer.events.send(UpstreamEvent::Message(raw.into())).unwrap();
    assert_eq!(next_text(&mut client).await.as_deref(), Some(raw));

    // A second setup on the same connection is ignored
    send(&mut client, ClientFrame::InitialSetup("again".into())).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(connector.opened.lock().unwrap().is_empty());
}

#[actix_web::test]
async fn test_inactivity_warning_then_timeout() {
    let mut config = AppConfig::default();
    config.session.inactivity_warning_secs = 1;
    config.session.session_timeout_secs = 1;
    let connector = ScriptedConnector::default();
    let addr = start_relay(config, connector.clone());
    let mut client = connect(addr).await;

    send(&mut client, ClientFrame::InitialSetup("context".into())).await;
    let (_, mut peer) = connector.next_peer().await;
    peer.events.send(UpstreamEvent::Open).unwrap();

    let turn_done = r#"{"serverContent":{"turnComplete":true}}"#;
    peer.events.send(UpstreamEvent::Message(turn_done.into())).unwrap();
    assert_eq!(next_text(&mut client).await.as_deref(), Some(turn_done));

    let warning: Value = serde_json::from_str(&next_text(&mut client).await.unwrap()).unwrap();
    assert_eq!(warning["type"], "WARNING");
    assert_eq!(warning["message"], INACTIVITY_WARNING_MESSAGE);

    let timeout: Value = serde_json::from_str(&next_text(&mut client).await.unwrap()).unwrap();
    assert_eq!(timeout["type"], "SESSION_TIMEOUT");
    assert_eq!(timeout["message"], SESSION_TIMEOUT_MESSAGE);

    assert_eq!(next_text(&mut client).await, None);
    assert_eq!(next_command(&mut peer).await, Some(UpstreamCommand::Close));
}

#[actix_web::test]
async fn test_client_activity_cancels_the_warning() {
    let mut config = AppConfig::default();
    config.session.inactivity_warning_secs = 1;
    let connector = ScriptedConnector::default();
    let addr = start_relay(config, connector.clone());
    let mut client = connect(addr).await;

    send(&mut client, ClientFrame::InitialSetup("context".into())).await;
    let (_, mut peer) = connector.next_peer().await;
    peer.events.send(UpstreamEvent::Open).unwrap();

    let turn_done = r#"{"serverContent":{"generationComplete":true}}"#;
    peer.events.send(UpstreamEvent::Message(turn_done.into())).unwrap();
    assert_eq!(next_text(&mut client).await.as_deref(), Some(turn_done));

    // Keep talking for longer than the warning delay
    for i in 0..4 {
        tokio::time::sleep(Duration::from_millis(400)).await;
        send(&mut client, ClientFrame::Audio(format!("chunk-{}", i))).await;
        assert_eq!(next_command(&mut peer).await, Some(UpstreamCommand::Audio(format!("chunk-{}", i))));
    }

    let nothing = tokio::time::timeout(Duration::from_millis(1500), client.next()).await;
    assert!(nothing.is_err(), "no frame expected while the candidate is active");
}

#[actix_web::test]
async fn test_invalid_frames_and_upstream_failure() {
    let connector = ScriptedConnector::default();
    let addr = start_relay(AppConfig::default(), connector.clone());
    let mut client = connect(addr).await;

    client.send(Message::Text("not json".into())).await.unwrap();
    let error: Value = serde_json::from_str(&next_text(&mut client).await.unwrap()).unwrap();
    assert_eq!(error["error"], "Failed to process message.");

    // The connection survives a bad frame
    send(&mut client, ClientFrame::InitialSetup("context".into())).await;
    let (_, mut peer) = connector.next_peer().await;
    peer.events.send(UpstreamEvent::Error("handshake rejected".into())).unwrap();

    let error: Value = serde_json::from_str(&next_text(&mut client).await.unwrap()).unwrap();
    assert_eq!(error["error"], "Failed to create Gemini session.");
    assert_eq!(next_text(&mut client).await, None);
    assert_eq!(next_command(&mut peer).await, Some(UpstreamCommand::Close));
}

#[actix_web::test]
async fn test_uninterpreted_frames_pass_through_once_open() {
    let connector = ScriptedConnector::default();
    let addr = start_relay(AppConfig::default(), connector.clone());
    let mut client = connect(addr).await;

    // No session yet: dropped without an error frame
    client.send(Message::Text(r#"{"type":"PING"}"#.into())).await.unwrap();

    send(&mut client, ClientFrame::InitialSetup("context".into())).await;
    let (_, mut peer) = connector.next_peer().await;
    peer.events.send(UpstreamEvent::Open).unwrap();

    let raw = r#"{"type":"CLIENT_CONTENT","payload":{"turns":[]}}"#;
    client.send(Message::Text(raw.into())).await.unwrap();
    assert_eq!(next_command(&mut peer).await, Some(UpstreamCommand::Raw(raw.into())));

    // A known type with a bad payload is still rejected
    client.send(Message::Text(r#"{"type":"AUDIO","payload":7}"#.into())).await.unwrap();
    let error: Value = serde_json::from_str(&next_text(&mut client).await.unwrap()).unwrap();
    assert_eq!(error["error"], "Failed to process message.");
}

#[actix_web::test]
async fn test_client_disconnect_closes_upstream() {
    let connector = ScriptedConnector::default();
    let addr = start_relay(AppConfig::default(), connector.clone());
    let mut client = connect(addr).await;

    send(&mut client, ClientFrame::InitialSetup("context".into())).await;
    let (_, mut peer) = connector.next_peer().await;
    peer.events.send(UpstreamEvent::Open).unwrap();

    client.close(None).await.unwrap();
    assert_eq!(next_command(&mut peer).await, Some(UpstreamCommand::Close));
}

#[actix_web::test]
async fn test_connections_over_the_limit_are_refused() {
    let mut config = AppConfig::default();
    config.performance.max_concurrent_sessions = 1;
    let addr = start_relay(config, ScriptedConnector::default());

    let _first = connect(addr).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    match connect_async(format!("ws://{}/ws", addr)).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status().as_u16(), 503);
        }
        other => panic!("expected 503, got {:?}", other.map(|_| ())),
    }
}
