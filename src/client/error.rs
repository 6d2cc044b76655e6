use std::fmt;

/// Failures that end a client session.
///
/// `SessionTimeout` is kept apart from the others so a consumer can tell
/// "the relay closed an idle session" from a crash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Microphone or speaker could not be opened
    MediaAccess(String),

    /// Relay connection failed or dropped
    Connection(String),

    /// The relay reported an upstream failure
    Upstream(String),

    /// The relay closed the session for inactivity
    SessionTimeout(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::MediaAccess(msg) => write!(f, "Media access error: {}", msg),
            SessionError::Connection(msg) => write!(f, "Connection error: {}", msg),
            SessionError::Upstream(msg) => write!(f, "Interview session error: {}", msg),
            SessionError::SessionTimeout(msg) => write!(f, "Session timed out: {}", msg),
        }
    }
}

impl std::error::Error for SessionError {}
