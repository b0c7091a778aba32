//! Listener contract (spec.md §4.7): `Source`, `IsConnected`, `StartAsync`,
//! `StopAsync`, `DisposeAsync`, `OnMessageReceived`, `SendResponseAsync`,
//! plus the common connect/receive-loop/disconnect skeleton every concrete
//! listener shares.

use crate::error::TriggerResult;
use crate::model::{IncomingMessage, Source};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A single inbound channel: a chat bot, a webhook server, a filesystem
/// watch. Every listener owns its own connection state and receive loop
/// (spec.md §5: "Listeners hold their own connection state; no sharing
/// across listeners.").
#[async_trait]
pub trait Listener: Send + Sync {
    fn source(&self) -> Source;
    fn is_connected(&self) -> bool;

    /// Establishes the connection and spawns the receive loop, forwarding
    /// normalized messages to `sink`.
    async fn start(&self, sink: mpsc::Sender<IncomingMessage>, cancel: CancellationToken) -> TriggerResult<()>;

    async fn stop(&self) -> TriggerResult<()>;

    /// Best-effort reply through the channel the message arrived on.
    async fn send_response(&self, message: &IncomingMessage, text: &str) -> TriggerResult<()>;
}

/// Shared connected-flag helper so each listener doesn't reimplement the
/// same `AtomicBool`.
#[derive(Default)]
pub struct ConnectionFlag(AtomicBool);

impl ConnectionFlag {
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }
    pub fn set(&self, connected: bool) {
        self.0.store(connected, Ordering::SeqCst);
    }
    pub fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Exponential-with-jitter backoff used between consecutive receive
/// errors (spec.md §4.7 step 2).
pub struct Backoff {
    base: Duration,
    max: Duration,
    consecutive_errors: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, consecutive_errors: 0 }
    }

    pub fn reset(&mut self) {
        self.consecutive_errors = 0;
    }

    /// Registers an error and returns how long to sleep before retrying.
    pub fn next_delay(&mut self) -> Duration {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        let shift = self.consecutive_errors.min(10);
        let exp = self.base.saturating_mul(1u32 << shift.min(16));
        let capped = exp.min(self.max);
        let jitter_ms = rand::random::<u64>() % (capped.as_millis() as u64 / 4 + 1);
        capped + Duration::from_millis(jitter_ms)
    }
}

/// Drives `poll` in a loop until `cancel` fires, applying [`Backoff`] on
/// error and resetting it on success (spec.md §4.7 step 2: "on any
/// exception counts a consecutive-error, sleeps an exponential-with-jitter
/// backoff, and retries. `OperationCanceled` ... terminates the loop
/// cleanly.").
pub async fn run_receive_loop<F, Fut>(
    label: &str,
    cancel: CancellationToken,
    connected: Arc<ConnectionFlag>,
    mut poll: F,
) where
    F: FnMut() -> Fut + Send,
    Fut: std::future::Future<Output = TriggerResult<()>> + Send,
{
    let mut backoff = Backoff::new(Duration::from_millis(250), Duration::from_secs(30));
    connected.set(true);
    loop {
        if cancel.is_cancelled() {
            break;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = poll() => {
                match result {
                    Ok(()) => backoff.reset(),
                    Err(e) => {
                        tracing::warn!(listener = label, error = %e, "receive error, backing off");
                        let delay = backoff.next_delay();
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }
    }
    connected.set(false);
}
