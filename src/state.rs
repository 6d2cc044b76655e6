//! # Application State Management
//!
//! This module manages state shared by every relayed connection: the live
//! configuration, relay-wide counters, and the upstream connector that holds
//! the process-wide provider credential.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Allows many connection actors to share ownership of the same data
//! - **Memory safety**: Automatically cleans up data when the last reference is dropped
//!
//! ### RwLock (Reader-Writer Lock)
//! - **Purpose**: Allows multiple readers OR one writer at a time (but not both)
//! - **Why needed**: Every connection reads the config, only the config endpoint writes it
//!
//! ## What is *not* shared:
//! Each connection's upstream session, audio queue and timers live inside its
//! own actor. Nothing here is per-connection state; a failure in one
//! connection can only ever touch the counters below.

use crate::config::AppConfig;                 // Our configuration types
use crate::relay::upstream::UpstreamConnector; // Opens provider sessions
use serde::Serialize;
use std::sync::{Arc, RwLock};                 // Thread-safe shared ownership and locking
use std::time::Instant;                       // For tracking server uptime

/// The state shared across HTTP handlers and WebSocket actors.
///
/// ## Rust Concepts:
/// - **#[derive(Clone)]**: Cloning only copies the `Arc` pointers, not the data
/// - **Arc<RwLock<T>>**: Thread-safe shared mutable data
/// - **Arc<dyn Trait>**: Shared ownership of "something that can open upstream sessions"
#[derive(Clone)]
pub struct AppState {
    /// Relay configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Relay-wide counters updated by every connection
    pub metrics: Arc<RwLock<RelayMetrics>>,

    /// Opens one upstream session per client connection
    pub upstream: Arc<dyn UpstreamConnector>,

    /// When the server started (never changes, so no Arc<RwLock> needed)
    pub start_time: Instant,
}

/// Relay counters collected across all connections.
///
/// ## Why these metrics matter:
/// - **active_connections**: Current concurrent clients (for capacity planning)
/// - **audio_frames_queued**: Frames that arrived before the upstream was ready
/// - **warnings_sent / session_timeouts**: How often candidates go quiet
/// - **upstream_errors**: Provider reliability
#[derive(Debug, Default, Clone, Serialize)]
pub struct RelayMetrics {
    /// Clients currently connected
    pub active_connections: u32,

    /// Clients connected since server start
    pub total_connections: u64,

    /// Upstream sessions constructed since server start
    pub upstream_sessions_opened: u64,

    /// AUDIO frames held in a queue while the upstream was being established
    pub audio_frames_queued: u64,

    /// AUDIO frames delivered to an upstream session
    pub audio_frames_forwarded: u64,

    /// WARNING frames sent to clients
    pub warnings_sent: u64,

    /// SESSION_TIMEOUT frames sent to clients
    pub session_timeouts: u64,

    /// Upstream sessions that failed to open or errored mid-session
    pub upstream_errors: u64,
}

/// Implementation of methods for AppState.
impl AppState {
    /// Create a new AppState with the given configuration and upstream connector.
    ///
    /// ## Rust Concepts:
    /// - **Arc::new()**: Creates a new reference-counted pointer
    /// - **RwLock::new()**: Creates a new reader-writer lock
    /// - **Instant::now()**: Captures the current moment in time
    pub fn new(config: AppConfig, upstream: Arc<dyn UpstreamConnector>) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(RelayMetrics::default())),
            upstream,
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// ## Why clone:
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    /// A poisoned lock still holds a valid config, so we recover it instead of panicking.
    pub fn get_config(&self) -> AppConfig {
        match self.config.read() {
            Ok(config) => config.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the configuration after validating it.
    ///
    /// ## Error handling:
    /// Configuration is validated before updating to ensure it's always valid.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        match self.config.write() {
            Ok(mut config) => *config = new_config,
            Err(poisoned) => *poisoned.into_inner() = new_config,
        }
        Ok(())
    }

    /// Apply a mutation to the metrics under the write lock.
    fn with_metrics<R>(&self, update: impl FnOnce(&mut RelayMetrics) -> R) -> R {
        match self.metrics.write() {
            Ok(mut metrics) => update(&mut metrics),
            Err(poisoned) => update(&mut poisoned.into_inner()),
        }
    }

    /// Reserve a connection slot at upgrade time.
    ///
    /// ## Why check and count together:
    /// The limit check and the increment happen under one write lock, so
    /// concurrent upgrades can never both take the last slot. Every `true`
    /// must be paired with one [`AppState::connection_closed`].
    pub fn try_open_connection(&self) -> bool {
        let limit = self.get_config().performance.max_concurrent_sessions;
        self.with_metrics(|m| {
            if (m.active_connections as usize) >= limit {
                return false;
            }
            m.active_connections += 1;
            m.total_connections += 1;
            true
        })
    }

    /// Called when a client connection actor stops.
    ///
    /// ## Safety check:
    /// Includes a check to prevent underflow (going below zero).
    pub fn connection_closed(&self) {
        self.with_metrics(|m| {
            if m.active_connections > 0 {
                m.active_connections -= 1;
            }
        });
    }

    pub fn upstream_opened(&self) {
        self.with_metrics(|m| m.upstream_sessions_opened += 1);
    }

    pub fn upstream_failed(&self) {
        self.with_metrics(|m| m.upstream_errors += 1);
    }

    pub fn audio_queued(&self) {
        self.with_metrics(|m| m.audio_frames_queued += 1);
    }

    pub fn audio_forwarded(&self) {
        self.with_metrics(|m| m.audio_frames_forwarded += 1);
    }

    pub fn warning_sent(&self) {
        self.with_metrics(|m| m.warnings_sent += 1);
    }

    pub fn session_timed_out(&self) {
        self.with_metrics(|m| m.session_timeouts += 1);
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    ///
    /// ## Why a snapshot:
    /// Cloning the counters means we don't hold the lock while serializing JSON.
    pub fn get_metrics_snapshot(&self) -> RelayMetrics {
        match self.metrics.read() {
            Ok(metrics) => metrics.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Get server uptime in seconds.
    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
