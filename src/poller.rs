//! Poll loop — drives a receiver through repeated connect → fetch →
//! disconnect cycles.
//!
//! Cancellation is cooperative: [`PollState::stop`] clears the
//! `continue_polling` flag, and the loop only looks at it between cycles.
//! A cycle already in flight always runs to completion or failure.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::ReceiverError;
use crate::receivers::Receiver;

/// The process-wide `continue_polling` flag.
#[derive(Debug)]
pub struct PollState {
    continue_polling: AtomicBool,
    stopped: Notify,
}

impl Default for PollState {
    fn default() -> Self {
        Self {
            continue_polling: AtomicBool::new(true),
            stopped: Notify::new(),
        }
    }
}

impl PollState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_polling(&self) -> bool {
        self.continue_polling.load(Ordering::SeqCst)
    }

    /// Ask the loop to stop after the current cycle.
    pub fn stop(&self) {
        self.continue_polling.store(false, Ordering::SeqCst);
        self.stopped.notify_one();
    }

    /// Clear the flag on the first interrupt signal.
    ///
    /// Until this is called the platform default applies and an interrupt
    /// kills the process.
    pub fn install_interrupt_handler(self: &Arc<Self>) -> JoinHandle<()> {
        self.stop_on(tokio::signal::ctrl_c())
    }

    /// Stop once `signal` resolves successfully.
    pub fn stop_on<F>(self: &Arc<Self>, signal: F) -> JoinHandle<()>
    where
        F: Future<Output = std::io::Result<()>> + Send + 'static,
    {
        let state = Arc::clone(self);
        tokio::spawn(async move {
            match signal.await {
                Ok(()) => {
                    info!("Interrupt received, stopping after the current poll");
                    state.stop();
                }
                Err(e) => error!("Failed to listen for interrupt signal: {e}"),
            }
        })
    }

    /// Sleep for `delay`, returning early if stopped.
    async fn sleep(&self, delay: Duration) {
        if !self.is_polling() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.stopped.notified() => {}
        }
    }
}

/// Run one full cycle: connect, fetch everything, disconnect.
///
/// If anything fails after connecting, the receiver is still disconnected
/// before the original error is returned, so no connection outlives its
/// cycle. Returns the number of messages dispatched.
pub async fn run_cycle(receiver: &mut dyn Receiver) -> Result<usize, ReceiverError> {
    receiver.connect().await?;

    let fetched = match receiver.get_messages().await {
        Ok(count) => count,
        Err(e) => {
            if let Err(close_err) = receiver.disconnect().await {
                warn!(
                    receiver = receiver.name(),
                    "Disconnect after failed fetch also failed: {close_err}"
                );
            }
            return Err(e);
        }
    };

    receiver.disconnect().await?;
    Ok(fetched)
}

/// Run one cycle, absorbing transient transport faults.
///
/// Transient faults are logged and reported as success so the caller moves
/// on to the next scheduled cycle. Anything else is returned.
pub async fn retrieve(receiver: &mut dyn Receiver) -> Result<(), ReceiverError> {
    debug!(receiver = receiver.name(), "Checking for new messages");
    match run_cycle(receiver).await {
        Ok(count) => {
            debug!(receiver = receiver.name(), count, "Poll cycle finished");
            Ok(())
        }
        Err(e) if e.is_transient() => {
            error!(receiver = receiver.name(), "Poll cycle failed: {e}");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Repeats [`retrieve`] with a fixed delay until stopped or a fatal error.
pub struct PollLoop {
    receiver: Box<dyn Receiver>,
    interval: Duration,
    state: Arc<PollState>,
}

impl PollLoop {
    pub fn new(receiver: Box<dyn Receiver>, interval: Duration, state: Arc<PollState>) -> Self {
        Self {
            receiver,
            interval,
            state,
        }
    }

    /// Poll until the state is stopped. Only non-transient errors end the
    /// loop early.
    pub async fn run(mut self) -> Result<(), ReceiverError> {
        loop {
            retrieve(self.receiver.as_mut()).await?;

            if !self.state.is_polling() {
                break;
            }
            self.state.sleep(self.interval).await;
            if !self.state.is_polling() {
                break;
            }
        }

        info!(receiver = self.receiver.name(), "Polling stopped");
        Ok(())
    }
}
