//! Connection handling for the OTA session
//!
//! Manages the single stream to the device, including:
//! - Command encoding
//! - Unbuffered, newline-terminated response reading
//! - Connection state and statistics

use bytes::BytesMut;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::{
    CodecError, Command, Response, CHUNK_SIZE, FRAME_HEADER_SIZE, LINE_TERMINATOR,
};

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoding error: {0}")]
    Codec(#[from] CodecError),

    #[error("Connection broken during send")]
    BrokenSend,

    #[error("Connection broken during receive")]
    BrokenReceive,

    #[error("Timed out waiting for a response")]
    Timeout,

    #[error("Connection closed")]
    Closed,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// State of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Stream open, exchanges allowed
    Open,
    /// A send or receive failed; the stream must not be reused
    Broken,
    /// The stream has been shut down
    Closed,
}

/// Connection statistics
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    /// Completed command/response exchanges
    pub exchanges: u64,
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
}

/// One open stream to the device
///
/// Exactly one exchange is in flight at a time: `exchange` takes `&mut self`
/// and does not return until the response line has been read.
pub struct Connection<S> {
    /// The underlying stream
    stream: S,
    /// Write buffer
    write_buf: BytesMut,
    /// Time allowed for each response
    read_timeout: Option<Duration>,
    /// Connection state
    state: ConnectionState,
    /// Statistics
    stats: ConnectionStats,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Create a new connection from an established stream
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            write_buf: BytesMut::with_capacity(CHUNK_SIZE + FRAME_HEADER_SIZE),
            read_timeout: None,
            state: ConnectionState::Open,
            stats: ConnectionStats::default(),
        }
    }

    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Get connection statistics
    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Send a command and wait for the device's response line
    pub async fn exchange(&mut self, command: &Command) -> ConnectionResult<Response> {
        if self.state != ConnectionState::Open {
            return Err(ConnectionError::Closed);
        }

        self.write_buf.clear();
        command.encode(&mut self.write_buf)?;

        let result = self.round_trip().await;
        if result.is_err() {
            self.state = ConnectionState::Broken;
        }
        result
    }

    async fn round_trip(&mut self) -> ConnectionResult<Response> {
        self.send_buffered().await?;

        let response = match self.read_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.recv_line())
                .await
                .map_err(|_| ConnectionError::Timeout)??,
            None => self.recv_line().await?,
        };

        self.stats.exchanges += 1;
        Ok(response)
    }

    /// Write the whole buffer, continuing after partial writes
    async fn send_buffered(&mut self) -> ConnectionResult<()> {
        let mut sent = 0;
        while sent < self.write_buf.len() {
            let n = self.stream.write(&self.write_buf[sent..]).await?;
            if n == 0 {
                return Err(ConnectionError::BrokenSend);
            }
            sent += n;
        }
        self.stream.flush().await?;

        self.stats.bytes_sent += sent as u64;
        Ok(())
    }

    /// Read one byte at a time up to and including the newline
    async fn recv_line(&mut self) -> ConnectionResult<Response> {
        let mut line = BytesMut::with_capacity(16);
        let mut byte = [0u8; 1];

        loop {
            let n = self.stream.read(&mut byte).await?;
            if n == 0 {
                return Err(ConnectionError::BrokenReceive);
            }

            line.extend_from_slice(&byte);
            self.stats.bytes_received += 1;

            if byte[0] == LINE_TERMINATOR {
                return Ok(Response::new(line.freeze()));
            }
        }
    }

    /// Shut the stream down
    pub async fn close(&mut self) -> ConnectionResult<()> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        self.state = ConnectionState::Closed;
        self.stream.shutdown().await?;
        Ok(())
    }
}
