//! Per-connection lifecycle composition.

use crate::session::{SessionError, SessionHandle};

/// Compose a session's two-phase lifecycle into one terminal outcome.
///
/// Awaits the start notifier first. A handshake error short-circuits:
/// the contract ends with that error and the closed signal is never
/// awaited. On success the contract stays pending until the session
/// reports closed, then ends normally. Exactly one terminal outcome per
/// connection.
pub(crate) async fn drive(handle: SessionHandle) -> Result<(), SessionError> {
    let SessionHandle {
        started, closed, ..
    } = handle;

    match started.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e),
        // The session task went away without reporting a start outcome.
        Err(_) => return Err(SessionError::Aborted),
    }

    let _ = closed.await;
    Ok(())
}
