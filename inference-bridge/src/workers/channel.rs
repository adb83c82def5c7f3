//! Line-delimited JSON request/response channel
//!
//! # Protocol
//!
//! - Request: one compact JSON object followed by `\n`, written to the
//!   worker's stdin
//! - Response: one JSON line read from the worker's stdout
//!
//! Exactly one request is in flight at a time; there are no correlation
//! ids. A response that arrives after its request timed out is discarded
//! before the next response is read.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::config::Timeouts;
use crate::error::{ChannelError, ProtocolFault, Stage};
use crate::protocol::{encode_line, Command, ResponseEnvelope};

/// Synchronous request/response exchange with a worker
#[async_trait]
pub trait WireChannel: Send {
    /// Write `command` and wait for its response envelope
    async fn send(&mut self, command: &Command) -> Result<ResponseEnvelope, ChannelError>;
}

/// [`WireChannel`] over any async byte streams (child pipes in production,
/// in-memory duplex pipes in tests)
pub struct LineChannel<W, R> {
    writer: W,
    reader: R,
    write_timeout: Duration,
    read_timeout: Duration,
    /// Requests written whose response has not been consumed yet
    outstanding: usize,
    /// Partial line kept across a timed-out read
    pending: Vec<u8>,
}

impl<W, R> LineChannel<W, R>
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(writer: W, reader: R, timeouts: &Timeouts) -> Self {
        Self {
            writer,
            reader,
            write_timeout: timeouts.write,
            read_timeout: timeouts.read,
            outstanding: 0,
            pending: Vec::new(),
        }
    }

    /// Number of requests still waiting for a response line
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Write one command line and flush it, bounded by the write timeout
    pub async fn write_command(&mut self, command: &Command) -> Result<(), ChannelError> {
        let line = encode_line(command).map_err(ProtocolFault::from)?;
        debug!(command = command.name(), bytes = line.len(), "Sending request");

        let writer = &mut self.writer;
        let write = async move {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        };
        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ProtocolFault::Io(e).into()),
            Err(_) => {
                warn!(
                    command = command.name(),
                    timeout_ms = self.write_timeout.as_millis(),
                    "Request write timed out"
                );
                Err(ChannelError::Timeout {
                    stage: Stage::Write,
                    after: self.write_timeout,
                })
            }
        }
    }

    /// Read and decode one envelope line within `timeout`, outside the
    /// request bookkeeping (used for the startup handshake).
    pub async fn read_envelope(&mut self, timeout: Duration) -> Result<ResponseEnvelope, ChannelError> {
        let line = self.read_line(timeout).await?;
        decode(&line)
    }

    async fn read_line(&mut self, timeout: Duration) -> Result<String, ChannelError> {
        match tokio::time::timeout(timeout, self.reader.read_until(b'\n', &mut self.pending)).await {
            Ok(Ok(0)) => Err(ProtocolFault::Eof.into()),
            Ok(Ok(_)) => {
                let bytes = std::mem::take(&mut self.pending);
                Ok(String::from_utf8_lossy(&bytes).into_owned())
            }
            Ok(Err(e)) => Err(ProtocolFault::Io(e).into()),
            Err(_) => Err(ChannelError::Timeout {
                stage: Stage::Read,
                after: timeout,
            }),
        }
    }
}

fn decode(line: &str) -> Result<ResponseEnvelope, ChannelError> {
    ResponseEnvelope::decode_line(line).map_err(|e| {
        warn!(line = %line.trim_end(), error = %e, "Malformed response line");
        ChannelError::Protocol(ProtocolFault::Malformed(e))
    })
}

#[async_trait]
impl<W, R> WireChannel for LineChannel<W, R>
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncBufRead + Unpin + Send,
{
    async fn send(&mut self, command: &Command) -> Result<ResponseEnvelope, ChannelError> {
        self.write_command(command).await?;
        self.outstanding += 1;

        loop {
            let line = self.read_line(self.read_timeout).await.inspect_err(|e| {
                if e.is_timeout() {
                    warn!(
                        command = command.name(),
                        timeout_ms = self.read_timeout.as_millis(),
                        "Response read timed out"
                    );
                }
            })?;
            self.outstanding -= 1;
            if self.outstanding == 0 {
                debug!(command = command.name(), bytes = line.len(), "Response received");
                return decode(&line);
            }
            debug!(late = %line.trim_end(), "Discarding response to a timed-out request");
        }
    }
}
