//! Stream transport: newline-delimited JSON over a byte stream.
//!
//! One envelope per line in each direction. Used for `callwire serve` over
//! stdin/stdout and for TCP connections.

use async_trait::async_trait;
use callwire_core::{Envelope, Inbound, Transport, TransportError};
use serde_json::Value;
use std::io;
use std::sync::{Mutex, PoisonError};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Longest accepted inbound line unless configured otherwise.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

type Reader = Box<dyn AsyncBufRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

pub struct StreamTransport {
    name: String,
    reader: Mutex<Option<Reader>>,
    writer: tokio::sync::Mutex<Option<Writer>>,
    max_frame_bytes: usize,
}

impl StreamTransport {
    pub fn new(
        name: impl Into<String>,
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            reader: Mutex::new(Some(Box::new(BufReader::new(reader)))),
            writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    /// Frames over stdin/stdout. Logging must not go to stdout.
    pub fn stdio() -> Self {
        Self::new("stdio", tokio::io::stdin(), tokio::io::stdout())
    }

    pub fn tcp(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self::new("tcp", reader, writer)
    }

    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max.max(1);
        self
    }
}

/// Decode one line into a frame. `None` for blank lines.
fn decode_line(line: &str, max_frame_bytes: usize) -> Option<Result<Value, TransportError>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if line.len() > max_frame_bytes {
        return Some(Err(TransportError::InvalidFrame(format!(
            "frame of {} bytes exceeds limit of {max_frame_bytes}",
            line.len()
        ))));
    }

    Some(serde_json::from_str(line).map_err(|e| TransportError::InvalidFrame(e.to_string())))
}

/// Result of reading one newline-terminated frame.
#[derive(Debug, PartialEq, Eq)]
enum FrameRead {
    /// `buf` holds the line without its terminator.
    Line,
    /// The line ran past the limit and was skipped through its newline.
    Oversized,
    Eof,
}

/// Read the next line into `buf`, never holding more than `max + 1` bytes.
///
/// The tail of an oversized line is consumed straight from the reader's
/// buffer without being copied.
async fn read_frame<R>(reader: &mut R, max: usize, buf: &mut Vec<u8>) -> io::Result<FrameRead>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let limit = u64::try_from(max).unwrap_or(u64::MAX).saturating_add(1);
    let read = (&mut *reader).take(limit).read_until(b'\n', buf).await?;

    if read == 0 {
        return Ok(FrameRead::Eof);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        return Ok(FrameRead::Line);
    }
    if (read as u64) < limit {
        // Final line without a terminator.
        return Ok(FrameRead::Line);
    }

    buf.clear();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            break;
        }
        if let Some(pos) = available.iter().position(|b| *b == b'\n') {
            reader.consume(pos + 1);
            break;
        }
        let len = available.len();
        reader.consume(len);
    }
    Ok(FrameRead::Oversized)
}

#[async_trait]
impl Transport for StreamTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<Inbound, TransportError> {
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| TransportError::AlreadyStarted(self.name.clone()))?;

        let (tx, rx) = mpsc::channel(32);
        let name = self.name.clone();
        let max_frame_bytes = self.max_frame_bytes;

        tokio::spawn(async move {
            let mut reader = reader;
            let mut buf = Vec::new();

            loop {
                let frame = match read_frame(&mut reader, max_frame_bytes, &mut buf).await {
                    Ok(FrameRead::Line) => match std::str::from_utf8(&buf) {
                        Ok(line) => match decode_line(line, max_frame_bytes) {
                            Some(frame) => frame,
                            None => continue,
                        },
                        Err(e) => Err(TransportError::InvalidFrame(e.to_string())),
                    },
                    Ok(FrameRead::Oversized) => {
                        warn!(transport = %name, max_frame_bytes, "Discarded oversized frame");
                        Err(TransportError::InvalidFrame(format!(
                            "frame exceeds limit of {max_frame_bytes} bytes"
                        )))
                    }
                    Ok(FrameRead::Eof) => {
                        debug!(transport = %name, "End of stream");
                        break;
                    }
                    Err(e) => {
                        warn!(transport = %name, error = %e, "Read failed");
                        let _ = tx.send(Err(e.into())).await;
                        break;
                    }
                };

                if tx.send(frame).await.is_err() {
                    break; // Engine dropped the receiver
                }
            }
        });

        Ok(rx)
    }

    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        let mut frame = serde_json::to_string(&envelope)
            .map_err(|e| TransportError::InvalidFrame(e.to_string()))?;
        frame.push('\n');

        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| TransportError::Closed(format!("{} stopped", self.name)))?;

        let written = async {
            writer.write_all(frame.as_bytes()).await?;
            writer.flush().await
        }
        .await;

        written.map_err(|e| TransportError::SendFailed {
            transport: self.name.clone(),
            reason: e.to_string(),
        })
    }

    async fn stop(&self) -> Result<(), TransportError> {
        if let Some(mut writer) = self.writer.lock().await.take() {
            writer.shutdown().await?;
        }
        Ok(())
    }
}
