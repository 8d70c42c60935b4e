use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_rustls::TlsAcceptor;

use crate::limits::Line;

/// How long a STARTTLS handshake may take
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Any byte stream a session can run over, plain or encrypted
pub trait Duplex: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Duplex for T {}

#[derive(Error, Debug)]
pub enum UpgradeError {
    /// The plaintext transport is handed back so the session can go on
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] io::Error, Transport),

    #[error("TLS handshake timed out")]
    TimedOut,
}

/// Line oriented connection whose stream is replaced as a whole on
/// STARTTLS
pub struct Transport {
    stream: BufReader<Box<dyn Duplex>>,
    tls: bool,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("tls", &self.tls)
            .field("buffered", &self.stream.buffer().len())
            .finish()
    }
}

impl Transport {
    pub fn plain(stream: Box<dyn Duplex>) -> Self {
        Self {
            stream: BufReader::new(stream),
            tls: false,
        }
    }

    /// A stream that is already encrypted (implicit TLS)
    pub fn tls(stream: Box<dyn Duplex>) -> Self {
        Self {
            stream: BufReader::new(stream),
            tls: true,
        }
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// Bytes received but not consumed yet
    pub fn pending(&self) -> usize {
        self.stream.buffer().len()
    }

    /// Reads one LF terminated line, CR LF stripped. At most `cap` bytes
    /// are kept, the rest is only counted. `None` means the peer went away,
    /// an unterminated last line is dropped.
    pub async fn read_line(&mut self, cap: usize) -> io::Result<Option<Line>> {
        let mut bytes = Vec::new();
        let mut len = 0;
        let mut last = None;

        loop {
            let available = self.stream.fill_buf().await?;
            if available.is_empty() {
                return Ok(None);
            }

            let (chunk, found) = match available.iter().position(|&b| b == b'\n') {
                Some(pos) => (&available[..pos], true),
                None => (available, false),
            };
            let room = cap.saturating_sub(bytes.len());
            bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
            len += chunk.len();
            if let Some(&byte) = chunk.last() {
                last = Some(byte);
            }

            let used = chunk.len() + usize::from(found);
            self.stream.consume(used);
            if found {
                break;
            }
        }

        if last == Some(b'\r') {
            len -= 1;
            bytes.truncate(len);
        }
        Ok(Some(Line::new(bytes, len)))
    }

    /// Queues one reply line, CRLF appended
    pub async fn send(&mut self, reply: &str) -> io::Result<()> {
        self.stream.write_all(reply.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        self.stream.flush().await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }

    /// Runs the server side handshake over the current stream. Anything the
    /// peer pipelined in plaintext is dropped first.
    pub async fn upgrade(self, acceptor: &TlsAcceptor) -> Result<Transport, UpgradeError> {
        let stream = self.stream.into_inner();
        let accept = acceptor.accept(stream).into_fallible();

        match tokio::time::timeout(HANDSHAKE_TIMEOUT, accept).await {
            Ok(Ok(tls_stream)) => Ok(Transport::tls(Box::new(tls_stream))),
            Ok(Err((e, stream))) => Err(UpgradeError::Handshake(e, Transport::plain(stream))),
            Err(_) => Err(UpgradeError::TimedOut),
        }
    }
}
