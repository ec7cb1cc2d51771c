//! Configuration types, built from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default delay between poll cycles.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

pub const IMAP_PORT: u16 = 143;
pub const IMAPS_PORT: u16 = 993;
pub const POP3_PORT: u16 = 110;
pub const POP3S_PORT: u16 = 995;

/// Connection settings shared by every remote receiver.
#[derive(Debug)]
pub struct ServerConfig {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    /// Wrap the connection in TLS from the first byte.
    pub ssl: bool,
}

/// IMAP receiver configuration.
#[derive(Debug)]
pub struct ImapConfig {
    pub server: ServerConfig,
    /// Folder messages are fetched from.
    pub in_folder: String,
    /// Folder every dispatched message is copied into. `None` skips the copy.
    pub processed_folder: Option<String>,
    /// Folder a message is copied into when dispatch fails. `None` lets the
    /// dispatch error abort the cycle.
    pub error_folder: Option<String>,
}

/// POP3 receiver configuration. POP3 has no server-side folders.
#[derive(Debug)]
pub struct Pop3Config {
    pub server: ServerConfig,
}

/// Configuration for exactly one polled receiver variant.
#[derive(Debug)]
pub enum ReceiverConfig {
    Imap(ImapConfig),
    Pop3(Pop3Config),
}

impl ReceiverConfig {
    pub fn server(&self) -> &ServerConfig {
        match self {
            Self::Imap(c) => &c.server,
            Self::Pop3(c) => &c.server,
        }
    }

    pub fn protocol(&self) -> &'static str {
        match self {
            Self::Imap(_) => "imap",
            Self::Pop3(_) => "pop3",
        }
    }
}

/// The single input mode a run is driven by.
#[derive(Debug)]
pub enum InputMode {
    /// One raw message read from standard input.
    Stdin(Vec<u8>),
    /// A remote mailbox, polled or checked once.
    Polled(ReceiverConfig),
    /// A local maildir watched for new deliveries.
    Maildir(PathBuf),
    /// Nothing configured; the run is a no-op.
    Idle,
}

impl InputMode {
    /// Pick the mode in priority order: stdin, polled connection, maildir.
    pub fn resolve(
        stdin: Option<Vec<u8>>,
        receiver: Option<ReceiverConfig>,
        maildir: Option<PathBuf>,
    ) -> Self {
        if let Some(raw) = stdin {
            Self::Stdin(raw)
        } else if let Some(config) = receiver {
            Self::Polled(config)
        } else if let Some(path) = maildir {
            Self::Maildir(path)
        } else {
            Self::Idle
        }
    }
}

/// Application settings.
#[derive(Debug)]
pub struct Settings {
    pub maildir: Option<PathBuf>,
    pub receiver: Option<ReceiverConfig>,
    /// Delay between cycles. Zero means check once.
    pub poll_interval: Duration,
    /// Stop polling on interrupt after the current cycle instead of dying.
    pub graceful_death: bool,
    pub ignore_stdin: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            maildir: None,
            receiver: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            graceful_death: false,
            ignore_stdin: false,
        }
    }
}

impl Settings {
    /// Build settings from `MAILMAN_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let maildir = lookup("MAILMAN_MAILDIR")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        let pop3 = server_config(&lookup, "POP3", POP3_PORT, POP3S_PORT)?;
        let imap = server_config(&lookup, "IMAP", IMAP_PORT, IMAPS_PORT)?;

        let receiver = match (pop3, imap) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::Conflict {
                    first: "MAILMAN_POP3_SERVER".into(),
                    second: "MAILMAN_IMAP_SERVER".into(),
                });
            }
            (Some(server), None) => Some(ReceiverConfig::Pop3(Pop3Config { server })),
            (None, Some(server)) => Some(ReceiverConfig::Imap(ImapConfig {
                server,
                in_folder: lookup("MAILMAN_IMAP_IN_FOLDER").unwrap_or_else(|| "INBOX".into()),
                processed_folder: match lookup("MAILMAN_IMAP_PROCESSED_FOLDER") {
                    Some(folder) if folder.is_empty() => None,
                    Some(folder) => Some(folder),
                    None => Some("Processed".into()),
                },
                error_folder: lookup("MAILMAN_IMAP_ERROR_FOLDER").filter(|s| !s.is_empty()),
            })),
            (None, None) => None,
        };

        let poll_interval = match lookup("MAILMAN_POLL_INTERVAL") {
            Some(raw) => Duration::from_secs(parse_number("MAILMAN_POLL_INTERVAL", &raw)?),
            None => DEFAULT_POLL_INTERVAL,
        };

        Ok(Self {
            maildir,
            receiver,
            poll_interval,
            graceful_death: parse_flag(&lookup, "MAILMAN_GRACEFUL_DEATH")?.unwrap_or(false),
            ignore_stdin: parse_flag(&lookup, "MAILMAN_IGNORE_STDIN")?.unwrap_or(false),
        })
    }
}

/// Read `MAILMAN_<PROTO>_*`. Returns `None` when no server is set.
///
/// An unset port follows the TLS flag; an unset TLS flag follows the port.
fn server_config<F>(
    lookup: &F,
    proto: &str,
    plain_port: u16,
    tls_port: u16,
) -> Result<Option<ServerConfig>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(server) = lookup(&format!("MAILMAN_{proto}_SERVER")).filter(|s| !s.trim().is_empty())
    else {
        return Ok(None);
    };

    let port_key = format!("MAILMAN_{proto}_PORT");
    let port: Option<u16> = lookup(&port_key)
        .map(|raw| parse_number(&port_key, &raw))
        .transpose()?;
    let ssl = parse_flag(lookup, &format!("MAILMAN_{proto}_SSL"))?;

    let (port, ssl) = match (port, ssl) {
        (Some(port), Some(ssl)) => (port, ssl),
        (Some(port), None) => (port, port == tls_port),
        (None, Some(true)) => (tls_port, true),
        (None, Some(false) | None) => (plain_port, false),
    };

    Ok(Some(ServerConfig {
        server,
        port,
        username: lookup(&format!("MAILMAN_{proto}_USERNAME")).unwrap_or_default(),
        password: SecretString::from(
            lookup(&format!("MAILMAN_{proto}_PASSWORD")).unwrap_or_default(),
        ),
        ssl,
    }))
}

fn parse_number<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{raw:?}: {e}"),
    })
}

fn parse_flag<F>(lookup: &F, key: &str) -> Result<Option<bool>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" | "" => Ok(Some(false)),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?} is not a boolean"),
        }),
    }
}
