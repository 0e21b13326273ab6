//! Transport boundary.
//!
//! The session needs nothing more than a duplex byte stream carrying
//! newline-terminated lines. Anything implementing `AsyncRead + AsyncWrite`
//! qualifies: a TCP socket, an SSH channel stream, a serial port, or an
//! in-memory `tokio::io::duplex` pipe in tests.

use futures_util::future::BoxFuture;
use std::future::Future;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;

/// Telnet "interpret as command" byte
const IAC: u8 = 0xFF;
const SB: u8 = 0xFA;
const SE: u8 = 0xF0;

/// Longest line accepted from the device, terminator included
pub(crate) const MAX_LINE: usize = 64 * 1024;

/// A duplex byte stream usable as a TTP transport
pub trait TransportStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> TransportStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Type-erased transport stream
pub type BoxedTransport = Box<dyn TransportStream>;

/// Opens transport streams on demand
///
/// The session calls this once per (re)connection attempt, so a connector
/// must be able to produce a fresh stream every time.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'_, io::Result<BoxedTransport>>;
}

impl<F, Fut, S> Connector for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = io::Result<S>> + Send + 'static,
    S: TransportStream,
{
    fn connect(&self) -> BoxFuture<'_, io::Result<BoxedTransport>> {
        let fut = self();
        Box::pin(async move { Ok(Box::new(fut.await?) as BoxedTransport) })
    }
}

/// Plain TCP connector (e.g. the device's telnet port)
///
/// Telnet option negotiation is not answered; negotiation bytes are
/// stripped from incoming lines.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Connector for TcpConnector {
    fn connect(&self) -> BoxFuture<'_, io::Result<BoxedTransport>> {
        Box::pin(async move {
            tracing::info!("Connecting to {}:{}", self.host, self.port);
            let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxedTransport)
        })
    }
}

/// Read one line from the stream, buffering partial input across reads.
///
/// Returns `Ok(None)` at end of stream. The terminator and surrounding
/// whitespace are trimmed; invalid UTF-8 is replaced rather than rejected.
/// Lines longer than [`MAX_LINE`] are discarded up to their terminator.
pub(crate) async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        buf.clear();
        let read = (&mut *reader)
            .take(MAX_LINE as u64)
            .read_until(b'\n', buf)
            .await?;
        if read == 0 {
            return Ok(None);
        }
        if buf.len() >= MAX_LINE && buf.last() != Some(&b'\n') {
            tracing::warn!("Dropping line longer than {} bytes", MAX_LINE);
            if !discard_line(reader).await? {
                return Ok(None);
            }
            continue;
        }
        strip_telnet_negotiation(buf);
        return Ok(Some(String::from_utf8_lossy(buf).trim().to_string()));
    }
}

/// Skip input up to and including the next newline; false at end of stream
async fn discard_line<R>(reader: &mut R) -> io::Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let (consumed, found) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(false);
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(end) => (end + 1, true),
                None => (available.len(), false),
            }
        };
        reader.consume(consumed);
        if found {
            return Ok(true);
        }
    }
}

/// Remove telnet IAC sequences in place
fn strip_telnet_negotiation(buf: &mut Vec<u8>) {
    if !buf.contains(&IAC) {
        return;
    }
    let mut out = Vec::with_capacity(buf.len());
    let mut i = 0;
    while i < buf.len() {
        if buf[i] != IAC {
            out.push(buf[i]);
            i += 1;
            continue;
        }
        match buf.get(i + 1) {
            // Escaped 0xFF data byte
            Some(&IAC) => {
                out.push(IAC);
                i += 2;
            }
            // Sub-negotiation runs until IAC SE
            Some(&SB) => {
                i += 2;
                while i < buf.len() && !(buf[i] == IAC && buf.get(i + 1) == Some(&SE)) {
                    i += 1;
                }
                i += 2;
            }
            // WILL/WONT/DO/DONT carry an option byte
            Some(&cmd) if (0xFB..=0xFE).contains(&cmd) => i += 3,
            _ => i += 2,
        }
    }
    *buf = out;
}
