//! Error sink capability: where post-handshake session errors go.

use tracing::warn;

use super::engine::SessionError;
use crate::telemetry::counters;

/// Receives session errors that occur after a successful handshake.
/// The sink never terminates the process or, by itself, the connection.
pub trait ErrorSink: Send + Sync {
    fn session_error(&self, error: &SessionError);
}

/// Default sink: log at WARN and continue.
pub struct LogSink;

impl ErrorSink for LogSink {
    fn session_error(&self, error: &SessionError) {
        counters::session_error();
        warn!(error = %error, "session error");
    }
}
