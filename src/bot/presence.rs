//! Periodic "typing..." / "sending photo..." indicator.
//!
//! A [`PresenceSignal`] owns one background task that re-emits a chat action
//! every interval until stopped. Telegram expires a chat action after a few
//! seconds, so a single call is not enough for long generations.

use crate::bot::transport::{ChatTransport, PresenceAction};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lifecycle of a [`PresenceSignal`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceState {
    /// Created, nothing emitted yet
    Idle,
    /// Background loop running
    Active,
    /// Loop finished, terminal
    Stopped,
}

/// Repeating presence indicator for one chat, tied to one request
pub struct PresenceSignal {
    transport: Arc<dyn ChatTransport>,
    chat_id: i64,
    action: PresenceAction,
    interval: Duration,
    cancel: CancellationToken,
    task: Option<JoinHandle<u64>>,
    state: PresenceState,
}

impl PresenceSignal {
    /// Create an idle signal
    #[must_use]
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        chat_id: i64,
        action: PresenceAction,
        interval: Duration,
    ) -> Self {
        Self {
            transport,
            chat_id,
            action,
            interval,
            cancel: CancellationToken::new(),
            task: None,
            state: PresenceState::Idle,
        }
    }

    /// Current lifecycle state
    #[must_use]
    pub const fn state(&self) -> PresenceState {
        self.state
    }

    /// Spawn the emit loop. Only valid from [`PresenceState::Idle`].
    pub fn start(&mut self) {
        if self.state != PresenceState::Idle {
            warn!(chat_id = self.chat_id, state = ?self.state, "Presence signal already started");
            return;
        }
        let task = tokio::spawn(run_signal_loop(
            Arc::clone(&self.transport),
            self.chat_id,
            self.action,
            self.interval,
            self.cancel.clone(),
        ));
        self.task = Some(task);
        self.state = PresenceState::Active;
    }

    /// Stop the loop and wait for it to exit.
    ///
    /// Once this returns no further presence action is emitted for this
    /// signal. Returns the number of actions that were delivered.
    pub async fn stop(&mut self) -> u64 {
        self.cancel.cancel();
        self.state = PresenceState::Stopped;
        let Some(task) = self.task.take() else {
            return 0;
        };
        match task.await {
            Ok(emitted) => emitted,
            Err(e) => {
                warn!(chat_id = self.chat_id, error = %e, "Presence loop ended abnormally");
                0
            }
        }
    }
}

impl Drop for PresenceSignal {
    fn drop(&mut self) {
        // Dropped without stop(): the loop exits at its next check.
        self.cancel.cancel();
    }
}

async fn run_signal_loop(
    transport: Arc<dyn ChatTransport>,
    chat_id: i64,
    action: PresenceAction,
    interval: Duration,
    cancel: CancellationToken,
) -> u64 {
    let mut emitted = 0;
    while !cancel.is_cancelled() {
        match transport.send_presence(chat_id, action).await {
            Ok(()) => emitted += 1,
            Err(e) => debug!(chat_id, error = %e, "Failed to send presence action"),
        }
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }
    }
    emitted
}

/// Run `work` while a presence signal is shown in `chat_id`.
///
/// The signal is stopped before the result is returned, whether `work`
/// succeeded or not.
pub async fn with_presence<F>(
    transport: Arc<dyn ChatTransport>,
    chat_id: i64,
    action: PresenceAction,
    interval: Duration,
    work: F,
) -> F::Output
where
    F: Future,
{
    let mut signal = PresenceSignal::new(transport, chat_id, action, interval);
    signal.start();
    let output = work.await;
    let emitted = signal.stop().await;
    debug!(chat_id, ?action, emitted, "Presence signal stopped");
    output
}
