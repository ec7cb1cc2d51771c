//! Remote mailbox receivers.
//!
//! A receiver owns at most one live connection. The poll loop drives it
//! through `connect` → `get_messages` → `disconnect` once per cycle and
//! never reuses a connection across cycles.

pub mod imap;
pub mod pop3;
pub mod transport;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ReceiverConfig;
use crate::dispatch::DispatchSink;
use crate::error::ReceiverError;

pub use imap::ImapReceiver;
pub use pop3::Pop3Receiver;

/// One transport variant of a remote mailbox.
#[async_trait]
pub trait Receiver: Send {
    /// Short protocol name, used in logs.
    fn name(&self) -> &'static str;

    /// Open and authenticate a fresh connection.
    async fn connect(&mut self) -> Result<(), ReceiverError>;

    /// Dispatch every message in the inbound mailbox and flag each one for
    /// deletion. Returns how many messages were dispatched.
    ///
    /// Requires a live connection.
    async fn get_messages(&mut self) -> Result<usize, ReceiverError>;

    /// Purge flagged messages and close the connection.
    ///
    /// Idempotent: without a live connection this does nothing.
    async fn disconnect(&mut self) -> Result<(), ReceiverError>;
}

/// Build the receiver for a polled configuration, wired to `sink`.
pub fn build_receiver(config: ReceiverConfig, sink: Arc<dyn DispatchSink>) -> Box<dyn Receiver> {
    match config {
        ReceiverConfig::Imap(config) => Box::new(ImapReceiver::new(config, sink)),
        ReceiverConfig::Pop3(config) => Box::new(Pop3Receiver::new(config, sink)),
    }
}
