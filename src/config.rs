//! # Configuration Management
//!
//! This module handles loading and managing relay configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization library for converting between Rust structs and data formats
//! - **derive macros**: Automatically generate code for common traits (Debug, Clone, Serialize, Deserialize)
//! - **impl blocks**: Add methods to structs
//! - **Result<T, E>**: Error handling that forces you to handle potential failures
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Platform variables (HOST, PORT, API_KEY)
//! 2. Environment variables (APP_SERVER__PORT, APP_SESSION__INACTIVITY_WARNING_SECS, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use anyhow::Result;              // Better error handling with context
use serde::{Deserialize, Serialize};  // For converting to/from TOML, JSON, etc.
use std::env;                    // For reading environment variables
use std::time::Duration;         // Timer durations handed to the broker and client

/// Main relay configuration that contains all settings.
///
/// ## Rust Concepts:
/// - **#[derive(...)]**: Automatically implements common traits:
///   - `Debug`: Allows printing with {:?} for debugging
///   - `Clone`: Allows making copies of the struct
///   - `Serialize`/`Deserialize`: Can convert this struct to and from JSON, TOML, etc.
///
/// ## Why separate config structs:
/// The HTTP listener, the upstream provider, the per-session timers and the
/// capacity limits change for different reasons, so each gets its own group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub session: SessionConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
/// - `port = 3001`: The port the interview client expects the relay on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,  // u16 = unsigned 16-bit integer (0-65535), perfect for port numbers
}

/// Upstream conversational provider settings.
///
/// ## Fields:
/// - `endpoint`: WebSocket URL of the live bidirectional endpoint
/// - `model_id`: Model identifier sent in the setup message
/// - `voice_name`: Prebuilt voice used for the interviewer's speech
/// - `api_key`: Process-wide credential shared by every connection
///
/// ## Secrets:
/// `api_key` is never serialized, so it cannot leak through the config
/// endpoint or debug dumps. It is normally supplied through `API_KEY`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub endpoint: String,
    pub model_id: String,
    pub voice_name: String,
    #[serde(default, skip_serializing)]
    pub api_key: String,
}

/// Per-session timing and audio format settings.
///
/// ## Fields:
/// - `inactivity_warning_secs`: Silence after the interviewer finishes speaking before a WARNING frame
/// - `session_timeout_secs`: Further silence after the warning before SESSION_TIMEOUT
/// - `feedback_timeout_secs`: Upper bound on waiting for the feedback turn
/// - `input_sample_rate`: Microphone PCM rate sent upstream (16 kHz)
/// - `output_sample_rate`: Interviewer PCM rate received from upstream (24 kHz)
/// - `capture_block_size`: Samples per captured block (one AUDIO frame each)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub inactivity_warning_secs: u64,
    pub session_timeout_secs: u64,
    pub feedback_timeout_secs: u64,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub capture_block_size: usize,
}

/// Capacity configuration.
///
/// ## Tuning guidelines:
/// Every relayed connection holds one upstream session open, so this is
/// effectively a cap on concurrent provider sessions billed to the API key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,  // usize = platform-specific unsigned integer (usually 64-bit)
}

/// Provides default configuration values.
///
/// ## Why defaults matter:
/// Default values ensure the relay can start even if no configuration file exists.
/// The session timings here (60s warning, 60s timeout, 90s feedback) are the
/// authoritative values; everything can still be overridden.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),  // Localhost only (safe for development)
                port: 3001,
            },
            upstream: UpstreamConfig {
                endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
                model_id: "gemini-2.5-flash-native-audio-preview-12-2025".to_string(),
                voice_name: "Kore".to_string(),
                api_key: String::new(),
            },
            session: SessionConfig {
                inactivity_warning_secs: 60,
                session_timeout_secs: 60,
                feedback_timeout_secs: 90,
                input_sample_rate: 16_000,
                output_sample_rate: 24_000,
                capture_block_size: 4096,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
            },
        }
    }
}

impl SessionConfig {
    /// Delay between "interviewer finished speaking" and the WARNING frame.
    pub fn inactivity_warning(&self) -> Duration {
        Duration::from_secs(self.inactivity_warning_secs)
    }

    /// Delay between the WARNING frame and the SESSION_TIMEOUT frame.
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    /// How long a feedback request may wait before completing best-effort.
    pub fn feedback_timeout(&self) -> Duration {
        Duration::from_secs(self.feedback_timeout_secs)
    }
}

/// Implementation block for AppConfig - adds methods to the struct.
impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_ (nested keys use `__`)
    /// 4. Handle special cases for HOST, PORT and API_KEY
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_SESSION__INACTIVITY_WARNING_SECS=30`: Shorter inactivity warning
    /// - `APP_UPSTREAM__MODEL_ID=...`: Use another provider model
    /// - `API_KEY=...`: Provider credential (also read from .env)
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            // 1. Start with defaults - converts our Default impl to config format
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // 2. Load from config.toml file (if it exists) - required(false) means "don't error if missing"
            .add_source(config::File::with_name("config").required(false))
            // 3. Load from environment variables with APP_ prefix
            // Field names contain underscores, so nesting uses a double underscore
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        // Handle special environment variables used by deployment platforms
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(api_key) = env::var("API_KEY") {
            settings = settings.set_override("upstream.api_key", api_key)?;
        }

        // Build the final configuration and convert it back to our AppConfig struct
        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Every timer duration is non-zero (a zero timer would fire immediately)
    /// - Sample rates and capture block size are non-zero
    /// - At least one concurrent session is allowed
    ///
    /// The API key is checked separately by [`AppConfig::require_api_key`] so
    /// that tests and tooling can validate a config without credentials.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.upstream.endpoint.is_empty() {
            return Err(anyhow::anyhow!("Upstream endpoint cannot be empty"));
        }

        if self.upstream.model_id.is_empty() {
            return Err(anyhow::anyhow!("Upstream model id cannot be empty"));
        }

        if self.session.inactivity_warning_secs == 0 || self.session.session_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Inactivity warning and session timeout must be greater than 0"));
        }

        if self.session.feedback_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Feedback timeout must be greater than 0"));
        }

        if self.session.input_sample_rate == 0 || self.session.output_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.session.capture_block_size == 0 {
            return Err(anyhow::anyhow!("Capture block size must be greater than 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        Ok(())  // All validation passed
    }

    /// Fail startup when no provider credential is configured.
    pub fn require_api_key(&self) -> Result<()> {
        if self.upstream.api_key.trim().is_empty() {
            return Err(anyhow::anyhow!("API_KEY not found in environment or .env file"));
        }
        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the provided fields change. For example `{"session": {"inactivity_warning_secs": 30}}`
    /// shortens the warning for connections opened after the update; connections
    /// already running keep the timings they were created with.
    ///
    /// The API key cannot be changed through this path.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        // Parse the JSON string into a generic value
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        // Update server configuration if provided
        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = u16::try_from(port)
                    .map_err(|_| anyhow::anyhow!("Server port out of range: {}", port))?;
            }
        }

        if let Some(upstream) = partial_config.get("upstream") {
            if let Some(model_id) = upstream.get("model_id").and_then(|v| v.as_str()) {
                self.upstream.model_id = model_id.to_string();
            }
            if let Some(voice) = upstream.get("voice_name").and_then(|v| v.as_str()) {
                self.upstream.voice_name = voice.to_string();
            }
        }

        if let Some(session) = partial_config.get("session") {
            if let Some(secs) = session.get("inactivity_warning_secs").and_then(|v| v.as_u64()) {
                self.session.inactivity_warning_secs = secs;
            }
            if let Some(secs) = session.get("session_timeout_secs").and_then(|v| v.as_u64()) {
                self.session.session_timeout_secs = secs;
            }
            if let Some(secs) = session.get("feedback_timeout_secs").and_then(|v| v.as_u64()) {
                self.session.feedback_timeout_secs = secs;
            }
        }

        // Update performance configuration if provided
        if let Some(performance) = partial_config.get("performance") {
            if let Some(sessions) = performance.get("max_concurrent_sessions").and_then(|v| v.as_u64()) {
                self.performance.max_concurrent_sessions = sessions as usize;
            }
        }

        // Validate the updated configuration to ensure it's still valid
        self.validate()?;
        Ok(())
    }
}

/// Tests for the configuration module.
///
/// ## Rust Concepts:
/// - **#[cfg(test)]**: Only compile this code when running tests
/// - **#[test]**: Marks a function as a test case
/// - **assert_eq!**: Checks that two values are equal
#[cfg(test)]
mod tests {
    use super::*;  // Import everything from the parent module

    /// The defaults carry the authoritative session timings.
    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 3001);
        assert_eq!(config.session.inactivity_warning(), Duration::from_secs(60));
        assert_eq!(config.session.session_timeout(), Duration::from_secs(60));
        assert_eq!(config.session.feedback_timeout(), Duration::from_secs(90));
        assert_eq!(config.session.input_sample_rate, 16_000);
        assert_eq!(config.session.output_sample_rate, 24_000);
        assert!(config.validate().is_ok());
    }

    /// Test that validation catches invalid configurations.
    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;  // Invalid port
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.session.session_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.session.capture_block_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_api_key_required_but_not_serialized() {
        let mut config = AppConfig::default();
        assert!(config.require_api_key().is_err());

        config.upstream.api_key = "secret-key".to_string();
        assert!(config.require_api_key().is_ok());

        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret-key"));
    }

    /// Test that runtime configuration updates work correctly.
    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"server": {"port": 9090}, "session": {"inactivity_warning_secs": 30}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.session.inactivity_warning_secs, 30);
        // Other fields should remain unchanged
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.session.session_timeout_secs, 60);
    }

    #[test]
    fn test_config_update_rejects_invalid_values() {
        let mut config = AppConfig::default();
        assert!(config.update_from_json(r#"{"session": {"feedback_timeout_secs": 0}}"#).is_err());
        assert!(config.update_from_json(r#"{"server": {"port": 70000}}"#).is_err());
    }
}
