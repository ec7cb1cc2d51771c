//! Line-oriented TCP/TLS stream shared by the IMAP and POP3 receivers.

use std::sync::Arc;
use std::time::Duration;

use rustls_pki_types::ServerName;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::config::ServerConfig;
use crate::error::ReceiverError;

/// Connect (TCP plus TLS handshake) deadline.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for any single read or write.
pub const IO_TIMEOUT: Duration = Duration::from_secs(30);

trait MailIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> MailIo for T {}

/// A buffered, optionally TLS-wrapped connection to a mail server.
pub struct MailStream {
    receiver: &'static str,
    server: String,
    inner: BufReader<Box<dyn MailIo>>,
}

impl MailStream {
    /// Open a connection to `config.server:config.port`.
    pub async fn connect(
        receiver: &'static str,
        config: &ServerConfig,
    ) -> Result<Self, ReceiverError> {
        let server = format!("{}:{}", config.server, config.port);

        let io = tokio::time::timeout(CONNECT_TIMEOUT, open(receiver, config))
            .await
            .map_err(|_| ReceiverError::Timeout {
                receiver,
                server: server.clone(),
                timeout: CONNECT_TIMEOUT,
            })??;

        tracing::debug!(receiver, %server, tls = config.ssl, "Connected");

        Ok(Self {
            receiver,
            server,
            inner: BufReader::new(io),
        })
    }

    /// Read one line, CRLF included. A closed connection is an error.
    pub async fn read_line(&mut self) -> Result<Vec<u8>, ReceiverError> {
        let Self {
            receiver,
            server,
            inner,
        } = self;
        let mut buf = Vec::new();
        let n = deadline(*receiver, server, inner.read_until(b'\n', &mut buf)).await?;
        if n == 0 {
            return Err(ReceiverError::Io {
                receiver: *receiver,
                source: std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("{server} closed the connection"),
                ),
            });
        }
        Ok(buf)
    }

    /// Read exactly `len` bytes (an IMAP literal).
    pub async fn read_exact(&mut self, len: usize) -> Result<Vec<u8>, ReceiverError> {
        let Self {
            receiver,
            server,
            inner,
        } = self;
        let mut buf = vec![0u8; len];
        deadline(*receiver, server, inner.read_exact(&mut buf)).await?;
        Ok(buf)
    }

    /// Write `line` followed by CRLF and flush.
    pub async fn write_line(&mut self, line: &str) -> Result<(), ReceiverError> {
        let Self {
            receiver,
            server,
            inner,
        } = self;
        let io = inner.get_mut();
        deadline(*receiver, server, async {
            io.write_all(line.as_bytes()).await?;
            io.write_all(b"\r\n").await?;
            io.flush().await
        })
        .await
    }

    /// Close the write side. Errors are ignored; the peer may already be gone.
    pub async fn shutdown(&mut self) {
        let _ = tokio::time::timeout(IO_TIMEOUT, self.inner.get_mut().shutdown()).await;
    }
}

async fn deadline<T, F>(receiver: &'static str, server: &str, fut: F) -> Result<T, ReceiverError>
where
    F: std::future::Future<Output = std::io::Result<T>>,
{
    match tokio::time::timeout(IO_TIMEOUT, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => Err(ReceiverError::Io { receiver, source }),
        Err(_) => Err(ReceiverError::Timeout {
            receiver,
            server: server.to_string(),
            timeout: IO_TIMEOUT,
        }),
    }
}

async fn open(
    receiver: &'static str,
    config: &ServerConfig,
) -> Result<Box<dyn MailIo>, ReceiverError> {
    let io_err = |source| ReceiverError::Io { receiver, source };
    let tls_err = |reason: String| ReceiverError::Tls { receiver, reason };

    let tcp = TcpStream::connect((config.server.as_str(), config.port))
        .await
        .map_err(io_err)?;

    if !config.ssl {
        return Ok(Box::new(tcp));
    }

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| tls_err(e.to_string()))?
    .with_root_certificates(root_store)
    .with_no_client_auth();

    let server_name = ServerName::try_from(config.server.clone())
        .map_err(|e| tls_err(format!("invalid server name {:?}: {e}", config.server)))?;

    let tls = TlsConnector::from(Arc::new(tls_config))
        .connect(server_name, tcp)
        .await
        .map_err(io_err)?;

    Ok(Box::new(tls))
}
