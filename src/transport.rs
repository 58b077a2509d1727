//! CRLF-framed line transport with dot-stuffed body streaming
//!
//! Wraps any async byte stream in NNTP line framing: single status lines
//! terminated by CRLF and multi-line bodies terminated by a lone `.` line,
//! with dot-unstuffing applied on read and dot-stuffing on write.

use std::fmt;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Errors produced by the line transport
///
/// The forward path branches on the failure class: a closed transport
/// means the connection must be discarded and the command retried, while
/// an unexpected status code is a healthy reply that simply isn't the one
/// the caller hoped for.
#[derive(Debug)]
pub enum TransportError {
    /// The peer closed the stream (EOF)
    Closed,

    /// A status line did not start with a three-digit code
    BadStatusLine { line: String },

    /// A status line carried a different code than the caller expected
    UnexpectedCode {
        expected: u16,
        code: u16,
        text: String,
    },

    /// I/O error on the underlying stream
    Io(std::io::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "transport closed by peer"),
            Self::BadStatusLine { line } => {
                write!(f, "malformed status line: {:?}", line)
            }
            Self::UnexpectedCode {
                expected,
                code,
                text,
            } => {
                write!(
                    f,
                    "expected status {} but got {} {}",
                    expected, code, text
                )
            }
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// Parse a three-digit status code off the head of a line
///
/// Returns the code and the text after it (without the separating space).
fn parse_status_line(line: &str) -> Option<(u16, &str)> {
    let digits = line.get(..3)?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let code = digits.parse().ok()?;
    let rest = line.get(3..).unwrap_or("");
    Some((code, rest.strip_prefix(' ').unwrap_or(rest)))
}

/// A CRLF-framed transport over an async stream
///
/// Reads are buffered; writes go straight through and are flushed after
/// every complete line or body.
#[derive(Debug)]
pub struct LineTransport<S> {
    io: BufReader<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> LineTransport<S> {
    pub fn new(stream: S) -> Self {
        Self {
            io: BufReader::new(stream),
        }
    }

    /// Write one line followed by CRLF and flush
    pub async fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        self.io.write_all(line.as_bytes()).await?;
        self.io.write_all(b"\r\n").await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Read one line, stripped of its CRLF terminator
    ///
    /// Returns [`TransportError::Closed`] on EOF.
    pub async fn read_line(&mut self) -> Result<String, TransportError> {
        let mut line = String::new();
        let n = self.io.read_line(&mut line).await?;
        if n == 0 {
            return Err(TransportError::Closed);
        }
        if line.ends_with('\n') {
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
        }
        Ok(line)
    }

    /// Read one status line and require a specific code
    ///
    /// On success returns the text after the code. A different code is
    /// reported as [`TransportError::UnexpectedCode`] carrying the reply
    /// so the caller can relay it.
    pub async fn read_code_line(&mut self, expected: u16) -> Result<String, TransportError> {
        let line = self.read_line().await?;
        let (code, text) =
            parse_status_line(&line).ok_or(TransportError::BadStatusLine { line: line.clone() })?;
        if code != expected {
            return Err(TransportError::UnexpectedCode {
                expected,
                code,
                text: text.to_string(),
            });
        }
        Ok(text.to_string())
    }

    /// Stream a dot-terminated body from `self` into `dst`
    ///
    /// Body lines are handled as raw bytes: article payloads are
    /// routinely 8-bit (yEnc and friends) and must round-trip without a
    /// UTF-8 requirement, which only the control-line readers impose.
    /// Each line is unstuffed on read (leading `..` becomes `.`) and
    /// re-stuffed on write. The body is copied line by line and is never
    /// held in memory as a whole. Returns the number of payload bytes
    /// observed at the transport boundary: the unstuffed line contents
    /// plus a CRLF per line, excluding the terminator.
    pub async fn copy_dot_body<W>(
        &mut self,
        dst: &mut LineTransport<W>,
    ) -> Result<u64, TransportError>
    where
        W: AsyncRead + AsyncWrite + Unpin,
    {
        let mut copied = 0u64;
        let mut line: Vec<u8> = Vec::with_capacity(1024);
        loop {
            line.clear();
            let n = self.io.read_until(b'\n', &mut line).await?;
            if n == 0 {
                return Err(TransportError::Closed);
            }
            if line.ends_with(b"\n") {
                line.pop();
                if line.ends_with(b"\r") {
                    line.pop();
                }
            }
            if line == b"." {
                break;
            }
            let payload = line.strip_prefix(b".").unwrap_or(&line);
            copied += payload.len() as u64 + 2;
            if payload.first() == Some(&b'.') {
                dst.io.write_all(b".").await?;
            }
            dst.io.write_all(payload).await?;
            dst.io.write_all(b"\r\n").await?;
        }
        dst.io.write_all(b".\r\n").await?;
        dst.io.flush().await?;
        Ok(copied)
    }
}
