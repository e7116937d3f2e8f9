//! Bearer-token authentication state.
//!
//! [`TokenStore`] owns the access/refresh pair. [`AuthEvents`] lets the
//! rest of the application react when authentication changes without
//! being on the call path that caused it.

mod storage;

pub use storage::{TokenRecord, TokenResponse, TokenStore};

use tokio::sync::broadcast;

/// Authentication state changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    /// Tokens were obtained via login.
    LoggedIn,
    /// Tokens were replaced by a successful refresh.
    Refreshed,
    /// Refresh failed; tokens were cleared.
    Expired { reason: String },
    /// Tokens were cleared on request.
    LoggedOut,
}

/// Fan-out channel for [`AuthEvent`]s.
///
/// Cloning shares the same channel. Publishing with no subscribers is not
/// an error.
#[derive(Debug, Clone)]
pub struct AuthEvents {
    tx: broadcast::Sender<AuthEvent>,
}

/// Buffered events per subscriber before the oldest are dropped.
const EVENT_CAPACITY: usize = 16;

impl AuthEvents {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: AuthEvent) {
        tracing::debug!(?event, "auth event");
        let _ = self.tx.send(event);
    }
}

impl Default for AuthEvents {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_reach_all_subscribers() {
        let events = AuthEvents::new();
        let mut a = events.subscribe();
        let mut b = events.clone().subscribe();

        events.emit(AuthEvent::Expired {
            reason: "refresh failed".into(),
        });

        assert!(matches!(a.recv().await.unwrap(), AuthEvent::Expired { .. }));
        assert!(matches!(b.recv().await.unwrap(), AuthEvent::Expired { .. }));
    }

    #[test]
    fn test_emit_without_subscribers() {
        AuthEvents::new().emit(AuthEvent::LoggedOut);
    }
}
