//! Mailman — receives mail from stdin, a polled IMAP/POP3 mailbox or a
//! watched maildir, and hands each raw message to a dispatch sink.

pub mod app;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod maildir;
pub mod poller;
pub mod receivers;

pub use app::Application;
pub use config::{InputMode, ReceiverConfig, Settings};
pub use dispatch::DispatchSink;
pub use error::{Error, Result};
