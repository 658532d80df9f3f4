use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// A one shot timer that can be stopped before it fires.
#[derive(Debug)]
pub(crate) struct TimeOut {
    name: &'static str,
    running: Mutex<Option<CancellationToken>>,
}

impl TimeOut {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            running: Mutex::new(None),
        }
    }

    /// Runs `action` once `duration` elapsed, unless the timer is stopped or `parent` cancelled
    /// first. Returns false when the timer is already running.
    pub(crate) fn start<F>(&self, parent: &CancellationToken, duration: Duration, action: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|token| !token.is_cancelled()) {
            return false;
        }
        let token = parent.child_token();
        *running = Some(token.clone());

        let name = self.name;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::trace!(timer = name, "timer stopped");
                }
                _ = tokio::time::sleep(duration) => {
                    // fired timers are no longer running
                    token.cancel();
                    tracing::debug!(timer = name, "timer fired");
                    action();
                }
            }
        });
        true
    }

    /// Stops the timer. Returns true when it was running and had not fired yet.
    pub(crate) fn stop(&self) -> bool {
        match self.running.lock().take() {
            Some(token) if !token.is_cancelled() => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }
}
