//! Periodic activity touch.

use super::SessionManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Background task touching the session on a fixed interval.
///
/// Stops when [`Heartbeat::stop`] is called or the handle is dropped.
#[derive(Debug)]
pub struct Heartbeat {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Heartbeat {
    pub(crate) fn start(manager: Arc<SessionManager>, period: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            // First tick one period from now, not immediately
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => manager.update_activity(),
                }
            }
            tracing::debug!("Session heartbeat stopped");
        });

        Self {
            cancel,
            handle: Some(handle),
        }
    }

    /// Stop the heartbeat and wait for the task to exit.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
