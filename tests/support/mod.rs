//! In-memory IMAP and POP3 servers plus a recording sink for receiver tests.
//!
//! Each server listens on a random local port and keeps its mailbox state
//! behind an `Arc<Mutex<_>>` so tests can seed and inspect it.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use mailman::config::{ImapConfig, Pop3Config, ServerConfig};
use mailman::dispatch::DispatchSink;
use mailman::error::DispatchError;

/// Maximum time any test is allowed to run before we consider it hung.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

pub const USERNAME: &str = "bob@example.com";
pub const PASSWORD: &str = "s3cret \"quoted\"";

// ── Recording sink ──────────────────────────────────────────────────

/// Records every dispatched message; rejects bodies listed in `reject`.
#[derive(Default)]
pub struct RecordingSink {
    pub seen: Mutex<Vec<Vec<u8>>>,
    pub reject: Vec<Vec<u8>>,
}

impl RecordingSink {
    pub fn rejecting(body: &[u8]) -> Self {
        Self {
            reject: vec![body.to_vec()],
            ..Default::default()
        }
    }

    pub fn seen(&self) -> Vec<Vec<u8>> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl DispatchSink for RecordingSink {
    async fn process(&self, raw: &[u8]) -> Result<(), DispatchError> {
        self.seen.lock().unwrap().push(raw.to_vec());
        if self.reject.iter().any(|r| r == raw) {
            return Err(DispatchError::Rejected("test sink rejects this body".into()));
        }
        Ok(())
    }
}

pub fn server_config(port: u16, password: &str) -> ServerConfig {
    ServerConfig {
        server: "127.0.0.1".into(),
        port,
        username: USERNAME.into(),
        password: SecretString::from(password.to_string()),
        ssl: false,
    }
}

pub fn imap_config(port: u16, processed: Option<&str>, errors: Option<&str>) -> ImapConfig {
    ImapConfig {
        server: server_config(port, PASSWORD),
        in_folder: "INBOX".into(),
        processed_folder: processed.map(str::to_string),
        error_folder: errors.map(str::to_string),
    }
}

pub fn pop3_config(port: u16, password: &str) -> Pop3Config {
    Pop3Config {
        server: server_config(port, password),
    }
}

// ── Fake IMAP server ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub uid: u32,
    pub body: Vec<u8>,
    pub flags: Vec<String>,
}

impl StoredMessage {
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }
}

/// Server-side IMAP state.
#[derive(Debug, Default)]
pub struct ImapState {
    pub folders: BTreeMap<String, Vec<StoredMessage>>,
    pub creates: Vec<String>,
    pub commands: Vec<String>,
    pub refuse_expunge: bool,
    next_uid: u32,
}

impl ImapState {
    pub fn with_inbox(bodies: &[&[u8]]) -> Self {
        let mut state = Self::default();
        state.folders.insert("INBOX".into(), Vec::new());
        for body in bodies {
            state.deliver("INBOX", body);
        }
        state
    }

    pub fn deliver(&mut self, folder: &str, body: &[u8]) {
        self.next_uid += 1;
        let uid = self.next_uid;
        self.folders
            .entry(folder.to_string())
            .or_default()
            .push(StoredMessage {
                uid,
                body: body.to_vec(),
                flags: Vec::new(),
            });
    }

    pub fn bodies(&self, folder: &str) -> Vec<Vec<u8>> {
        self.folders
            .get(folder)
            .map(|msgs| msgs.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of commands starting with `prefix` the server received.
    pub fn count(&self, prefix: &str) -> usize {
        self.commands.iter().filter(|c| c.starts_with(prefix)).count()
    }
}

pub type SharedImap = Arc<Mutex<ImapState>>;

/// Start a fake IMAP server; returns its port.
pub async fn start_imap(state: SharedImap) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(serve_imap(socket, Arc::clone(&state)));
        }
    });
    port
}

async fn serve_imap(socket: TcpStream, state: SharedImap) {
    let (read, mut write) = socket.into_split();
    let mut lines = BufReader::new(read);
    let mut selected: Option<String> = None;

    if write.write_all(b"* OK fake IMAP ready\r\n").await.is_err() {
        return;
    }

    loop {
        let mut line = String::new();
        match lines.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let line = line.trim_end();
        let (tag, command) = line.split_once(' ').unwrap_or((line, ""));
        let args = tokenize(command);
        let upper: Vec<String> = args.iter().map(|a| a.to_ascii_uppercase()).collect();
        let words: Vec<&str> = upper.iter().map(String::as_str).collect();

        let mut out: Vec<u8> = Vec::new();
        let mut close = false;
        {
            let mut st = state.lock().unwrap();
            st.commands.push(if words.first() == Some(&"LOGIN") {
                "LOGIN".to_string()
            } else {
                command.to_string()
            });

            let status = match words.as_slice() {
                ["LOGIN", ..] if args.len() == 3 => {
                    if args[1] == USERNAME && args[2] == PASSWORD {
                        "OK LOGIN completed".to_string()
                    } else {
                        "NO [AUTHENTICATIONFAILED] invalid credentials".to_string()
                    }
                }
                ["SELECT", _] => {
                    if st.folders.contains_key(&args[1]) {
                        selected = Some(args[1].clone());
                        "OK [READ-WRITE] SELECT completed".to_string()
                    } else {
                        "NO no such mailbox".to_string()
                    }
                }
                ["UID", "SEARCH", "ALL"] => match selected.as_ref().and_then(|f| st.folders.get(f)) {
                    Some(msgs) => {
                        let mut search = String::from("* SEARCH");
                        for m in msgs {
                            search.push_str(&format!(" {}", m.uid));
                        }
                        out.extend_from_slice(format!("{search}\r\n").as_bytes());
                        "OK SEARCH completed".to_string()
                    }
                    None => "BAD no mailbox selected".to_string(),
                },
                ["UID", "FETCH", _, "RFC822"] => {
                    let uid: u32 = args[2].parse().unwrap_or(0);
                    let found = selected
                        .as_ref()
                        .and_then(|f| st.folders.get(f))
                        .and_then(|msgs| msgs.iter().enumerate().find(|(_, m)| m.uid == uid))
                        .map(|(seq, m)| (seq + 1, m.body.clone()));
                    if let Some((seq, body)) = found {
                        out.extend_from_slice(
                            format!("* {seq} FETCH (UID {uid} RFC822 {{{}}}\r\n", body.len()).as_bytes(),
                        );
                        out.extend_from_slice(&body);
                        out.extend_from_slice(b")\r\n");
                    }
                    "OK FETCH completed".to_string()
                }
                ["LIST", _, _] => {
                    if st.folders.contains_key(&args[2]) {
                        out.extend_from_slice(format!("* LIST () \"/\" \"{}\"\r\n", args[2]).as_bytes());
                    }
                    "OK LIST completed".to_string()
                }
                ["CREATE", _] => {
                    if st.folders.contains_key(&args[1]) {
                        "NO mailbox already exists".to_string()
                    } else {
                        st.folders.insert(args[1].clone(), Vec::new());
                        st.creates.push(args[1].clone());
                        "OK CREATE completed".to_string()
                    }
                }
                ["UID", "COPY", _, _] => {
                    let uid: u32 = args[2].parse().unwrap_or(0);
                    let body = selected
                        .as_ref()
                        .and_then(|f| st.folders.get(f))
                        .and_then(|msgs| msgs.iter().find(|m| m.uid == uid))
                        .map(|m| m.body.clone());
                    match body {
                        Some(_) if !st.folders.contains_key(&args[3]) => {
                            "NO [TRYCREATE] no such mailbox".to_string()
                        }
                        Some(body) => {
                            let target = args[3].clone();
                            st.deliver(&target, &body);
                            "OK COPY completed".to_string()
                        }
                        None => "NO no such message".to_string(),
                    }
                }
                ["UID", "STORE", _, "+FLAGS", ..] => {
                    let uid: u32 = args[2].parse().unwrap_or(0);
                    let flags: Vec<String> = args[4..]
                        .iter()
                        .map(|f| f.trim_matches(|c| c == '(' || c == ')').to_string())
                        .collect();
                    if let Some(msg) = selected
                        .clone()
                        .and_then(|f| st.folders.get_mut(&f))
                        .and_then(|msgs| msgs.iter_mut().find(|m| m.uid == uid))
                    {
                        msg.flags.extend(flags);
                    }
                    "OK STORE completed".to_string()
                }
                ["EXPUNGE"] => {
                    if st.refuse_expunge {
                        "NO expunge refused while another session is open".to_string()
                    } else {
                        if let Some(msgs) = selected.clone().and_then(|f| st.folders.get_mut(&f)) {
                            msgs.retain(|m| !m.has_flag("\\Deleted"));
                        }
                        "OK EXPUNGE completed".to_string()
                    }
                }
                ["LOGOUT"] => {
                    out.extend_from_slice(b"* BYE logging out\r\n");
                    close = true;
                    "OK LOGOUT completed".to_string()
                }
                _ => "BAD unknown command".to_string(),
            };
            out.extend_from_slice(format!("{tag} {status}\r\n").as_bytes());
        }

        if write.write_all(&out).await.is_err() || close {
            return;
        }
    }
}

/// Split an IMAP command into atoms and unquoted strings.
fn tokenize(command: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut chars = command.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c == ' ' {
            chars.next();
        } else if c == '"' {
            chars.next();
            let mut arg = String::new();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            arg.push(escaped);
                        }
                    }
                    '"' => break,
                    _ => arg.push(c),
                }
            }
            args.push(arg);
        } else {
            let mut arg = String::new();
            while let Some(&c) = chars.peek() {
                if c == ' ' {
                    break;
                }
                arg.push(c);
                chars.next();
            }
            args.push(arg);
        }
    }
    args
}

// ── Fake POP3 server ────────────────────────────────────────────────

/// Server-side POP3 maildrop.
#[derive(Debug, Default)]
pub struct Pop3State {
    pub messages: Vec<Vec<u8>>,
    pub commands: Vec<String>,
    pub sessions: usize,
}

impl Pop3State {
    pub fn with_messages(bodies: &[&[u8]]) -> Self {
        Self {
            messages: bodies.iter().map(|b| b.to_vec()).collect(),
            ..Default::default()
        }
    }
}

pub type SharedPop3 = Arc<Mutex<Pop3State>>;

/// Start a fake POP3 server; returns its port.
pub async fn start_pop3(state: SharedPop3) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(serve_pop3(socket, Arc::clone(&state)));
        }
    });
    port
}

async fn serve_pop3(socket: TcpStream, state: SharedPop3) {
    let (read, mut write) = socket.into_split();
    let mut lines = BufReader::new(read);
    let mut authenticated = false;
    let mut user_ok = false;
    // Marked for deletion; only applied on QUIT.
    let mut deleted: Vec<usize> = Vec::new();

    state.lock().unwrap().sessions += 1;
    if write.write_all(b"+OK fake POP3 ready\r\n").await.is_err() {
        return;
    }

    loop {
        let mut line = String::new();
        match lines.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let line = line.trim_end();
        let (verb, arg) = line.split_once(' ').unwrap_or((line, ""));
        let verb = verb.to_ascii_uppercase();

        let mut out: Vec<u8> = Vec::new();
        let mut close = false;
        {
            let mut st = state.lock().unwrap();
            st.commands.push(if verb == "PASS" {
                "PASS".to_string()
            } else {
                line.to_string()
            });

            match verb.as_str() {
                "USER" => {
                    user_ok = arg == USERNAME;
                    out.extend_from_slice(b"+OK\r\n");
                }
                "PASS" => {
                    if user_ok && arg == PASSWORD {
                        authenticated = true;
                        out.extend_from_slice(b"+OK maildrop locked\r\n");
                    } else {
                        out.extend_from_slice(b"-ERR [AUTH] invalid credentials\r\n");
                    }
                }
                _ if !authenticated => out.extend_from_slice(b"-ERR not authenticated\r\n"),
                "LIST" => {
                    out.extend_from_slice(b"+OK scan listing follows\r\n");
                    for (i, m) in st.messages.iter().enumerate() {
                        if !deleted.contains(&i) {
                            out.extend_from_slice(format!("{} {}\r\n", i + 1, m.len()).as_bytes());
                        }
                    }
                    out.extend_from_slice(b".\r\n");
                }
                "RETR" => match arg.parse::<usize>().ok().and_then(|n| n.checked_sub(1)) {
                    Some(i) if i < st.messages.len() && !deleted.contains(&i) => {
                        out.extend_from_slice(b"+OK message follows\r\n");
                        out.extend_from_slice(&dot_stuff(&st.messages[i]));
                        out.extend_from_slice(b".\r\n");
                    }
                    _ => out.extend_from_slice(b"-ERR no such message\r\n"),
                },
                "DELE" => match arg.parse::<usize>().ok().and_then(|n| n.checked_sub(1)) {
                    Some(i) if i < st.messages.len() && !deleted.contains(&i) => {
                        deleted.push(i);
                        out.extend_from_slice(b"+OK marked\r\n");
                    }
                    _ => out.extend_from_slice(b"-ERR no such message\r\n"),
                },
                "QUIT" => {
                    let mut i = 0;
                    st.messages.retain(|_| {
                        let keep = !deleted.contains(&i);
                        i += 1;
                        keep
                    });
                    close = true;
                    out.extend_from_slice(b"+OK bye\r\n");
                }
                _ => out.extend_from_slice(b"-ERR unknown command\r\n"),
            }
        }

        if write.write_all(&out).await.is_err() || close {
            return;
        }
    }
}

/// Byte-stuff a message for a POP3 multi-line response (CRLF line endings).
fn dot_stuff(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 8);
    let text = String::from_utf8_lossy(body);
    for line in text.split_inclusive("\r\n") {
        if line.starts_with('.') {
            out.push(b'.');
        }
        out.extend_from_slice(line.as_bytes());
    }
    if !out.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
    out
}
