//! IMAP receiver.
//!
//! Per cycle: select the inbound folder, enumerate every UID, and for each
//! one fetch the raw message, dispatch it, copy it into the processed folder
//! and flag it `\Seen \Deleted`. Flagged messages are purged by `EXPUNGE`
//! on disconnect.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tracing::{debug, error, info, trace, warn};

use super::Receiver;
use super::transport::MailStream;
use crate::config::{ImapConfig, ServerConfig};
use crate::dispatch::DispatchSink;
use crate::error::ReceiverError;

const NAME: &str = "imap";

/// Receives messages over IMAP and hands them to a [`DispatchSink`].
pub struct ImapReceiver {
    config: ImapConfig,
    sink: Arc<dyn DispatchSink>,
    session: Option<ImapSession>,
}

impl ImapReceiver {
    pub fn new(config: ImapConfig, sink: Arc<dyn DispatchSink>) -> Self {
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
impl Receiver for ImapReceiver {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn connect(&mut self) -> Result<(), ReceiverError> {
        if let Some(mut stale) = self.session.take() {
            warn!("Dropping IMAP connection left over from a previous cycle");
            stale.stream.shutdown().await;
        }

        let mut session = ImapSession::open(&self.config.server).await?;
        session.login(&self.config.server).await?;
        self.session = Some(session);
        Ok(())
    }

    async fn get_messages(&mut self) -> Result<usize, ReceiverError> {
        let Self {
            config,
            sink,
            session,
        } = self;
        let session = session
            .as_mut()
            .ok_or(ReceiverError::NotConnected { receiver: NAME })?;

        session.command(&format!("SELECT {}", quote(&config.in_folder))).await?;
        let uids = session.uid_search_all().await?;
        debug!(folder = %config.in_folder, count = uids.len(), "Listed IMAP messages");

        let mut dispatched = 0;
        for uid in uids {
            let raw = session.uid_fetch_rfc822(uid).await?;

            match sink.process(&raw).await {
                Ok(()) => {
                    if let Some(folder) = &config.processed_folder {
                        session.copy_to(uid, folder).await?;
                    }
                    dispatched += 1;
                }
                Err(source) => match &config.error_folder {
                    Some(folder) => {
                        error!(uid, "Dispatch failed, moving message to {folder}: {source}");
                        session.copy_to(uid, folder).await?;
                    }
                    None => {
                        return Err(ReceiverError::Dispatch {
                            handle: format!("imap uid {uid}"),
                            source,
                        });
                    }
                },
            }

            session
                .command(&format!("UID STORE {uid} +FLAGS (\\Seen \\Deleted)"))
                .await?;
        }

        Ok(dispatched)
    }

    async fn disconnect(&mut self) -> Result<(), ReceiverError> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };

        if let Err(e) = session.command("EXPUNGE").await {
            warn!("Failed to expunge: {e}");
        }

        let result = session.logout().await;
        session.stream.shutdown().await;
        result
    }
}

/// Completion status of a tagged command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Ok,
    No,
    Bad,
}

/// An untagged response line and the literals embedded in it.
#[derive(Debug, Default)]
struct Untagged {
    text: String,
    literals: Vec<Vec<u8>>,
}

#[derive(Debug)]
struct Response {
    status: Status,
    /// The tagged completion line, tag stripped.
    text: String,
    untagged: Vec<Untagged>,
}

/// An authenticated IMAP connection.
struct ImapSession {
    stream: MailStream,
    next_tag: u32,
    /// Folders known to exist on this connection.
    known_folders: HashSet<String>,
}

impl ImapSession {
    async fn open(config: &ServerConfig) -> Result<Self, ReceiverError> {
        let mut stream = MailStream::connect(NAME, config).await?;

        let greeting = String::from_utf8_lossy(&stream.read_line().await?).into_owned();
        if !(greeting.starts_with("* OK") || greeting.starts_with("* PREAUTH")) {
            return Err(ReceiverError::Protocol {
                receiver: NAME,
                command: "greeting".into(),
                response: greeting.trim_end().to_string(),
            });
        }

        Ok(Self {
            stream,
            next_tag: 1,
            known_folders: HashSet::new(),
        })
    }

    async fn login(&mut self, config: &ServerConfig) -> Result<(), ReceiverError> {
        let command = format!(
            "LOGIN {} {}",
            quote(&config.username),
            quote(config.password.expose_secret())
        );
        let response = self.execute(&command, "LOGIN").await?;
        if response.status != Status::Ok {
            return Err(ReceiverError::AuthFailed {
                receiver: NAME,
                username: config.username.clone(),
                response: response.text,
            });
        }
        info!(server = %config.server, user = %config.username, "Logged in to IMAP server");
        Ok(())
    }

    async fn logout(&mut self) -> Result<(), ReceiverError> {
        match self.command("LOGOUT").await {
            Ok(_) => Ok(()),
            // Some servers hang up straight after the BYE.
            Err(ReceiverError::Io { source, .. })
                if source.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn uid_search_all(&mut self) -> Result<Vec<u32>, ReceiverError> {
        let untagged = self.command("UID SEARCH ALL").await?;
        Ok(parse_search(&untagged))
    }

    async fn uid_fetch_rfc822(&mut self, uid: u32) -> Result<Vec<u8>, ReceiverError> {
        let command = format!("UID FETCH {uid} RFC822");
        let untagged = self.command(&command).await?;
        untagged
            .into_iter()
            .filter(|u| u.text.contains("FETCH"))
            .find_map(|u| u.literals.into_iter().next())
            .ok_or_else(|| ReceiverError::Protocol {
                receiver: NAME,
                command,
                response: "no message body in FETCH response".into(),
            })
    }

    /// Copy a message into `folder`, creating the folder first if needed.
    async fn copy_to(&mut self, uid: u32, folder: &str) -> Result<(), ReceiverError> {
        self.ensure_folder(folder).await?;
        self.command(&format!("UID COPY {uid} {}", quote(folder)))
            .await?;
        Ok(())
    }

    async fn ensure_folder(&mut self, folder: &str) -> Result<(), ReceiverError> {
        if self.known_folders.contains(folder) {
            return Ok(());
        }

        let listed = self
            .command(&format!("LIST \"\" {}", quote(folder)))
            .await?;
        if !listed.iter().any(|u| u.text.starts_with("* LIST")) {
            info!(folder, "Creating IMAP folder");
            self.command(&format!("CREATE {}", quote(folder))).await?;
        }

        self.known_folders.insert(folder.to_string());
        Ok(())
    }

    /// Run a command and require an `OK` completion.
    async fn command(&mut self, command: &str) -> Result<Vec<Untagged>, ReceiverError> {
        let response = self.execute(command, command).await?;
        match response.status {
            Status::Ok => Ok(response.untagged),
            Status::No | Status::Bad => Err(ReceiverError::Protocol {
                receiver: NAME,
                command: command.to_string(),
                response: response.text,
            }),
        }
    }

    /// Send a tagged command and collect responses up to its completion.
    ///
    /// `shown` is what gets logged in place of the command text.
    async fn execute(&mut self, command: &str, shown: &str) -> Result<Response, ReceiverError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        trace!(%tag, command = shown, "IMAP >");
        self.stream.write_line(&format!("{tag} {command}")).await?;

        let prefix = format!("{tag} ");
        let mut untagged = Vec::new();
        loop {
            let line = self.read_response().await?;
            if let Some(completion) = line.text.strip_prefix(&prefix) {
                let (status, text) = completion.split_once(' ').unwrap_or((completion, ""));
                let status = match status.to_ascii_uppercase().as_str() {
                    "OK" => Status::Ok,
                    "NO" => Status::No,
                    "BAD" => Status::Bad,
                    _ => {
                        return Err(ReceiverError::Protocol {
                            receiver: NAME,
                            command: shown.to_string(),
                            response: completion.to_string(),
                        });
                    }
                };
                trace!(%tag, ?status, "IMAP <");
                return Ok(Response {
                    status,
                    text: text.to_string(),
                    untagged,
                });
            }
            if line.text.starts_with('+') {
                // We never send literals, so a continuation request is out of sync.
                return Err(ReceiverError::Protocol {
                    receiver: NAME,
                    command: shown.to_string(),
                    response: line.text,
                });
            }
            untagged.push(line);
        }
    }

    /// Read one logical response line, pulling in any `{n}` literals.
    async fn read_response(&mut self) -> Result<Untagged, ReceiverError> {
        let mut response = Untagged::default();
        loop {
            let raw = self.stream.read_line().await?;
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\r', '\n']);
            response.text.push_str(line);

            match literal_len(line) {
                Some(len) => response.literals.push(self.stream.read_exact(len).await?),
                None => return Ok(response),
            }
        }
    }
}

/// Length of the literal announced at the end of `line`, as in `{42}`.
fn literal_len(line: &str) -> Option<usize> {
    let body = line.strip_suffix('}')?;
    let open = body.rfind('{')?;
    body[open + 1..].trim_end_matches('+').parse().ok()
}

/// UIDs from `* SEARCH` responses, in server order.
fn parse_search(untagged: &[Untagged]) -> Vec<u32> {
    untagged
        .iter()
        .filter_map(|u| u.text.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace())
        .filter_map(|id| id.parse().ok())
        .collect()
}

/// IMAP quoted string.
fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for ch in value.chars() {
        if ch == '"' || ch == '\\' {
            quoted.push('\\');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}
