//! Dispatch sinks — where fetched raw messages are handed off.
//!
//! Routing and message handling belong to the application; receivers and
//! the maildir watcher only see the [`DispatchSink`] trait.

use std::process::Stdio;

use async_trait::async_trait;
use mail_parser::MessageParser;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::DispatchError;
use crate::maildir::MaildirEntry;

/// Consumer of raw messages.
///
/// An error aborts the rest of the current fetch enumeration.
#[async_trait]
pub trait DispatchSink: Send + Sync {
    /// Handle one raw RFC 5322 message.
    async fn process(&self, raw: &[u8]) -> Result<(), DispatchError>;

    /// Handle a message delivered into a maildir's `new` directory.
    ///
    /// The default reads the entry, runs [`process`](Self::process) and then
    /// moves the entry into `cur` flagged as seen, so it is not picked up by
    /// the next drain.
    async fn process_from_maildir_entry(&self, entry: MaildirEntry) -> Result<(), DispatchError> {
        let raw = entry.read().await?;
        self.process(&raw).await?;
        entry.mark_seen().await?;
        Ok(())
    }
}

/// Logs a one-line summary of each message.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl DispatchSink for LogSink {
    async fn process(&self, raw: &[u8]) -> Result<(), DispatchError> {
        let Some(parsed) = MessageParser::default().parse(raw) else {
            return Err(DispatchError::Rejected("not an RFC 5322 message".into()));
        };

        let sender = parsed
            .from()
            .and_then(|addr| addr.first())
            .and_then(|a| a.address())
            .unwrap_or("unknown");
        let subject = parsed.subject().unwrap_or("(no subject)");

        info!(
            sender = %sender,
            subject = %subject,
            bytes = raw.len(),
            "Received message"
        );
        Ok(())
    }
}

/// Pipes each raw message into a shell command.
///
/// A non-zero exit status counts as a dispatch failure.
#[derive(Debug, Clone)]
pub struct CommandSink {
    command: String,
}

impl CommandSink {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl DispatchSink for CommandSink {
    async fn process(&self, raw: &[u8]) -> Result<(), DispatchError> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(raw).await?;
            // Dropping stdin closes the pipe so the command sees EOF.
        }

        let status = child.wait().await?;
        debug!(command = %self.command, %status, "Delivery command finished");

        if status.success() {
            Ok(())
        } else {
            Err(DispatchError::CommandFailed {
                command: self.command.clone(),
                status: status.to_string(),
            })
        }
    }
}
