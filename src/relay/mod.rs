//! # Connection Broker (relay)
//!
//! One broker per client WebSocket. Each broker owns exactly one upstream
//! provider session, holds client audio in an [`queue::AudioQueue`] until that
//! session is ready, forwards messages in both directions and runs the
//! two-phase [`timer::InactivityTimer`].
//!
//! ## Layers:
//! - **broker**: Pure state machine; inputs in, [`broker::BrokerAction`]s out
//! - **websocket**: actix actor that executes actions against real sockets/timers
//! - **upstream**: Provider session handle and the Gemini Live connector
//!
//! ## Connection lifecycle:
//! ```text
//! Idle --INITIAL_SETUP--> Establishing --upstream open--> Active
//! Active --generation complete--> AwaitingInput --warning--> Warned --timeout--> Closed
//! AwaitingInput/Warned --AUDIO--> Active
//! ```

pub mod broker;     // Per-connection state machine
pub mod queue;      // Audio held while the upstream session is establishing
pub mod timer;      // Two-phase inactivity countdown
pub mod upstream;   // Upstream session handle and provider connector
pub mod websocket;  // actix actor and the /ws endpoint

pub use broker::{Broker, BrokerAction, BrokerState};
pub use websocket::relay_websocket;
