//! Application orchestrator.
//!
//! Resolves the single [`InputMode`] for this run and drives it:
//! one message from stdin, a polled remote mailbox, or a watched maildir.

use std::io::IsTerminal;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use crate::config::{InputMode, ReceiverConfig, Settings};
use crate::dispatch::DispatchSink;
use crate::error::Result;
use crate::maildir::{Maildir, MaildirWatcher};
use crate::poller::{PollLoop, PollState, retrieve};
use crate::receivers::build_receiver;

/// Top-level composition of settings and a dispatch sink.
pub struct Application {
    settings: Settings,
    sink: Arc<dyn DispatchSink>,
    state: Arc<PollState>,
}

impl Application {
    pub fn new(settings: Settings, sink: Arc<dyn DispatchSink>) -> Self {
        Self {
            settings,
            sink,
            state: PollState::new(),
        }
    }

    /// The cancellation flag the poll loop observes.
    pub fn poll_state(&self) -> Arc<PollState> {
        Arc::clone(&self.state)
    }

    /// Run until the selected mode finishes.
    pub async fn run(self) -> Result<()> {
        info!("Mailman v{} started", env!("CARGO_PKG_VERSION"));

        let stdin = if self.settings.ignore_stdin {
            None
        } else {
            read_piped_stdin().await?
        };
        self.run_with_stdin(stdin).await
    }

    /// Run with an already-captured stdin message (`None` if there is none).
    pub async fn run_with_stdin(self, stdin: Option<Vec<u8>>) -> Result<()> {
        let Self {
            settings,
            sink,
            state,
        } = self;

        match InputMode::resolve(stdin, settings.receiver, settings.maildir) {
            InputMode::Stdin(raw) => {
                debug!(bytes = raw.len(), "Processing message from STDIN.");
                sink.process(&raw).await?;
            }
            InputMode::Polled(config) => {
                let interval = settings.poll_interval;
                let graceful = settings.graceful_death;
                poll(config, sink, state, interval, graceful).await?;
            }
            InputMode::Maildir(path) => {
                info!("Maildir receiver enabled ({}).", path.display());
                let maildir = Maildir::open(path)?;
                MaildirWatcher::new(maildir, sink).watch().await?;
            }
            InputMode::Idle => {
                info!("No stdin message, mail server or maildir configured; nothing to do");
            }
        }

        Ok(())
    }
}

async fn poll(
    config: ReceiverConfig,
    sink: Arc<dyn DispatchSink>,
    state: Arc<PollState>,
    interval: std::time::Duration,
    graceful_death: bool,
) -> Result<()> {
    let protocol = config.protocol();
    let server = format!("{}:{}", config.server().server, config.server().port);
    let mut receiver = build_receiver(config, sink);

    if interval.is_zero() {
        info!(protocol, %server, "Polling disabled. Checking for messages once.");
        retrieve(receiver.as_mut()).await?;
        return Ok(());
    }

    info!(
        protocol,
        %server,
        "Polling enabled. Checking every {} seconds.",
        interval.as_secs()
    );
    let signal = graceful_death.then(|| state.install_interrupt_handler());

    let result = PollLoop::new(receiver, interval, state).run().await;

    if let Some(handle) = signal {
        handle.abort();
    }
    Ok(result?)
}

/// How long a redirected stdin may stay silent before it counts as empty.
const STDIN_READY_MS: u16 = 100;

/// Read stdin to the end when a message is waiting on it.
///
/// A terminal, a pipe nobody has written to, or an empty read such as
/// `/dev/null` means no message.
async fn read_piped_stdin() -> std::io::Result<Option<Vec<u8>>> {
    if std::io::stdin().is_terminal() {
        return Ok(None);
    }

    let ready = tokio::task::spawn_blocking(|| input_ready(std::io::stdin(), STDIN_READY_MS))
        .await
        .map_err(std::io::Error::other)??;
    if !ready {
        debug!("Nothing waiting on STDIN");
        return Ok(None);
    }

    let mut raw = Vec::new();
    tokio::io::stdin().read_to_end(&mut raw).await?;
    Ok((!raw.is_empty()).then_some(raw))
}

/// Whether `input` has data or end-of-file to report within `timeout_ms`.
#[cfg(unix)]
fn input_ready(input: impl std::os::fd::AsFd, timeout_ms: u16) -> std::io::Result<bool> {
    use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

    let mut fds = [PollFd::new(input.as_fd(), PollFlags::POLLIN)];
    if poll(&mut fds, PollTimeout::from(timeout_ms))? == 0 {
        return Ok(false);
    }
    Ok(fds[0]
        .revents()
        .is_some_and(|events| events.intersects(PollFlags::POLLIN | PollFlags::POLLHUP)))
}

#[cfg(not(unix))]
fn input_ready<T>(_input: T, _timeout_ms: u16) -> std::io::Result<bool> {
    Ok(true)
}
