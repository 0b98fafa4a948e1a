//! TCP transport for one ESL connection.
//!
//! Reads are incremental: bytes accumulate until the first blank line
//! (`\n\n` or `\r\n\r\n`) after at least one header byte, then exactly
//! `Content-Length` more bytes are read if that header is present.  The
//! connect timeout applies only to the initial dial; steady-state reads
//! block until the socket is closed.

use crate::error::EslError;
use esl_wire::{EslEvent, WireError, content_length, parse_header_block};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, trace};

/// Dial a FreeSWITCH ESL endpoint.
pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, EslError> {
    let target = format!("{host}:{port}");
    debug!(%target, "connecting to freeswitch");
    match tokio::time::timeout(timeout, TcpStream::connect(&target)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(EslError::Io(e)),
        Err(_) => Err(EslError::ConnectTimeout),
    }
}

/// One raw server-to-client frame: the parsed header block plus the exact
/// body bytes it promised.
#[derive(Debug)]
pub struct RawFrame {
    pub headers: EslEvent,
    pub body: Option<Vec<u8>>,
}

/// Incremental frame reader over the read half of the socket.
pub struct FrameReader {
    read_half: OwnedReadHalf,
    buffer: Vec<u8>,
}

impl FrameReader {
    pub fn new(read_half: OwnedReadHalf) -> Self {
        FrameReader {
            read_half,
            buffer: Vec::with_capacity(4096),
        }
    }

    /// Read one complete frame; `Ok(None)` on clean end-of-stream.
    pub async fn read_frame(&mut self) -> Result<Option<RawFrame>, EslError> {
        let Some(block) = self.read_header_block().await? else {
            return Ok(None);
        };
        trace!(block = %block, "frame header block");
        let headers = parse_header_block(&block);

        let body = match content_length(&headers)? {
            None | Some(0) => None,
            Some(length) => Some(self.read_exact_body(length).await?),
        };

        Ok(Some(RawFrame { headers, body }))
    }

    /// Accumulate bytes until the first blank line, returning the header
    /// block without its terminator.
    async fn read_header_block(&mut self) -> Result<Option<String>, EslError> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some((end, skip)) = find_blank_line(&self.buffer) {
                let raw: Vec<u8> = self.buffer.drain(..end + skip).collect();
                let block = String::from_utf8_lossy(&raw[..end]).into_owned();
                if block.trim().is_empty() {
                    // Stray blank line between frames; keep reading.
                    continue;
                }
                return Ok(Some(block));
            }
            match self.read_half.read(&mut chunk).await {
                Ok(0) => {
                    return if self.buffer.iter().all(|b| b.is_ascii_whitespace()) {
                        Ok(None)
                    } else {
                        Err(EslError::Connection(
                            "stream closed mid-frame".to_owned(),
                        ))
                    };
                }
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) => return Err(EslError::Io(e)),
            }
        }
    }

    /// Read exactly `length` body bytes, draining the buffer first.
    async fn read_exact_body(&mut self, length: usize) -> Result<Vec<u8>, EslError> {
        let mut body = Vec::with_capacity(length);
        let take = length.min(self.buffer.len());
        body.extend(self.buffer.drain(..take));

        while body.len() < length {
            let mut chunk = vec![0u8; (length - body.len()).min(65536)];
            match self.read_half.read(&mut chunk).await {
                Ok(0) => {
                    return Err(EslError::Wire(WireError::TruncatedBody {
                        expected: length,
                        got: body.len(),
                    }));
                }
                Ok(n) => body.extend_from_slice(&chunk[..n]),
                Err(e) => return Err(EslError::Io(e)),
            }
        }
        Ok(body)
    }
}

/// Find the first header terminator; returns (block end, terminator len).
fn find_blank_line(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (one, other) => one.or(other),
    }
}

/// Write one client command frame (the blank-line terminator is appended
/// here) and flush before returning.
pub async fn write_command(writer: &mut OwnedWriteHalf, command: &str) -> Result<(), EslError> {
    let frame = format!("{command}\n\n");
    writer
        .write_all(frame.as_bytes())
        .await
        .map_err(|e| EslError::Connection(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| EslError::Connection(e.to_string()))
}
