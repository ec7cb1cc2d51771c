//! POP3 receiver.
//!
//! POP3 has no folders: every message in the maildrop is retrieved,
//! dispatched and marked with `DELE`. The server only removes marked
//! messages when the session ends with `QUIT`, which is what disconnect
//! sends.

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tracing::{debug, info, trace, warn};

use super::Receiver;
use super::transport::MailStream;
use crate::config::{Pop3Config, ServerConfig};
use crate::dispatch::DispatchSink;
use crate::error::ReceiverError;

const NAME: &str = "pop3";

/// Receives messages over POP3 and hands them to a [`DispatchSink`].
pub struct Pop3Receiver {
    config: Pop3Config,
    sink: Arc<dyn DispatchSink>,
    session: Option<Pop3Session>,
}

impl Pop3Receiver {
    pub fn new(config: Pop3Config, sink: Arc<dyn DispatchSink>) -> Self {
        Self {
            config,
            sink,
            session: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }
}

#[async_trait]
impl Receiver for Pop3Receiver {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn connect(&mut self) -> Result<(), ReceiverError> {
        if let Some(mut stale) = self.session.take() {
            warn!("Dropping POP3 connection left over from a previous cycle");
            stale.stream.shutdown().await;
        }

        let mut session = Pop3Session::open(&self.config.server).await?;
        session.login(&self.config.server).await?;
        self.session = Some(session);
        Ok(())
    }

    async fn get_messages(&mut self) -> Result<usize, ReceiverError> {
        let Self { sink, session, .. } = self;
        let session = session
            .as_mut()
            .ok_or(ReceiverError::NotConnected { receiver: NAME })?;

        let numbers = session.list().await?;
        debug!(count = numbers.len(), "Listed POP3 messages");

        for &number in &numbers {
            let raw = session.retr(number).await?;
            sink.process(&raw)
                .await
                .map_err(|source| ReceiverError::Dispatch {
                    handle: format!("pop3 message {number}"),
                    source,
                })?;
            session.command(&format!("DELE {number}"), "DELE").await?;
        }

        Ok(numbers.len())
    }

    async fn disconnect(&mut self) -> Result<(), ReceiverError> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };

        let result = session.command("QUIT", "QUIT").await.map(|_| ());
        session.stream.shutdown().await;
        result
    }
}

/// An authenticated POP3 connection in the TRANSACTION state.
struct Pop3Session {
    stream: MailStream,
}

impl Pop3Session {
    async fn open(config: &ServerConfig) -> Result<Self, ReceiverError> {
        let mut stream = MailStream::connect(NAME, config).await?;
        let greeting = String::from_utf8_lossy(&stream.read_line().await?).into_owned();
        if !greeting.starts_with("+OK") {
            return Err(ReceiverError::Protocol {
                receiver: NAME,
                command: "greeting".into(),
                response: greeting.trim_end().to_string(),
            });
        }
        Ok(Self { stream })
    }

    async fn login(&mut self, config: &ServerConfig) -> Result<(), ReceiverError> {
        let auth_failed = |e: ReceiverError| match e {
            ReceiverError::Protocol { response, .. } => ReceiverError::AuthFailed {
                receiver: NAME,
                username: config.username.clone(),
                response,
            },
            other => other,
        };

        self.command(&format!("USER {}", config.username), "USER")
            .await
            .map_err(auth_failed)?;
        self.command(
            &format!("PASS {}", config.password.expose_secret()),
            "PASS",
        )
        .await
        .map_err(auth_failed)?;

        info!(server = %config.server, user = %config.username, "Logged in to POP3 server");
        Ok(())
    }

    /// Message numbers in the maildrop, in server order.
    async fn list(&mut self) -> Result<Vec<u32>, ReceiverError> {
        self.command("LIST", "LIST").await?;
        let listing = self.read_multiline().await?;
        Ok(parse_listing(&listing))
    }

    async fn retr(&mut self, number: u32) -> Result<Vec<u8>, ReceiverError> {
        self.command(&format!("RETR {number}"), "RETR").await?;
        self.read_multiline().await
    }

    /// Send a command and require a `+OK` status line, which is returned.
    ///
    /// `shown` is what gets logged in place of the command text.
    async fn command(&mut self, command: &str, shown: &str) -> Result<String, ReceiverError> {
        trace!(command = shown, "POP3 >");
        self.stream.write_line(command).await?;

        let status = String::from_utf8_lossy(&self.stream.read_line().await?)
            .trim_end()
            .to_string();
        trace!(%status, "POP3 <");

        if status.starts_with("+OK") {
            Ok(status)
        } else {
            Err(ReceiverError::Protocol {
                receiver: NAME,
                command: shown.to_string(),
                response: status,
            })
        }
    }

    /// Read a dot-terminated multi-line body, undoing dot-stuffing.
    async fn read_multiline(&mut self) -> Result<Vec<u8>, ReceiverError> {
        let mut body = Vec::new();
        loop {
            let line = self.stream.read_line().await?;
            if line == b".\r\n" || line == b".\n" {
                return Ok(body);
            }
            let line = match line.strip_prefix(b".") {
                Some(rest) => rest,
                None => &line[..],
            };
            body.extend_from_slice(line);
        }
    }
}

/// Message numbers from a `LIST` listing (`<number> <size>` per line).
fn parse_listing(listing: &[u8]) -> Vec<u32> {
    String::from_utf8_lossy(listing)
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter_map(|number| number.parse().ok())
        .collect()
}
