//! Connection Handler
//!
//! Each client gets its own task running a read, decode, execute, reply loop.
//!
//! ```text
//!    ┌──────────────────────────────┐
//!    │  read bytes into BytesMut    │◀─────────┐
//!    └──────────────┬───────────────┘          │
//!                   ▼                          │
//!    ┌──────────────────────────────┐  no line │
//!    │  decode next datagram        │──────────┘
//!    └──────────────┬───────────────┘
//!                   ▼
//!    ┌──────────────────────────────┐
//!    │  CommandHandler::execute     │
//!    └──────────────┬───────────────┘
//!                   ▼
//!    ┌──────────────────────────────┐
//!    │  encode + write reply        │
//!    └──────────────────────────────┘
//! ```
//!
//! TCP is a stream, so one read can hold half a datagram or several of them.
//! Bytes accumulate in the buffer until the codec finds a full line. A line
//! that isn't a valid request gets a `syntax` reply; a line longer than the
//! configured limit closes the connection.

use crate::commands::CommandHandler;
use crate::protocol::{DatagramCodec, ProtocolError, Reply, Status};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

/// Initial buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Total requests processed
    pub requests_processed: AtomicU64,
    /// Requests rejected as malformed
    pub malformed_requests: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn request_processed(&self) {
        self.requests_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_malformed(&self) {
        self.malformed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written
            .fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Handles a single client connection.
pub struct ConnectionHandler {
    stream: BufWriter<TcpStream>,
    /// Client's address (for logging)
    addr: SocketAddr,
    /// Incoming bytes not yet decoded
    buffer: BytesMut,
    /// Encoded replies waiting to be written
    out: BytesMut,
    codec: DatagramCodec,
    command_handler: CommandHandler,
    stats: Arc<ConnectionStats>,
}

impl ConnectionHandler {
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        codec: DatagramCodec,
        command_handler: CommandHandler,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        stats.connection_opened();

        Self {
            stream: BufWriter::new(stream),
            addr,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            out: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            codec,
            command_handler,
            stats,
        }
    }

    /// Runs the connection until the client disconnects or an error occurs.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        info!(client = %self.addr, "Client connected");

        let result = self.main_loop().await;

        match &result {
            Ok(()) => info!(client = %self.addr, "Client disconnected gracefully"),
            Err(ConnectionError::ClientDisconnected) => {
                debug!(client = %self.addr, "Client disconnected")
            }
            Err(ConnectionError::IoError(io_err))
                if io_err.kind() == std::io::ErrorKind::ConnectionReset =>
            {
                debug!(client = %self.addr, "Connection reset by client")
            }
            Err(e) => warn!(client = %self.addr, error = %e, "Connection error"),
        }

        self.stats.connection_closed();
        result
    }

    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        loop {
            loop {
                let reply = match self.codec.decode(&mut self.buffer) {
                    Ok(Some(request)) => {
                        trace!(client = %self.addr, op = ?request.op, "Decoded request");
                        let reply = self.command_handler.execute(request).await;
                        self.stats.request_processed();
                        reply
                    }
                    Ok(None) => break,
                    Err(e) if !e.is_fatal() => {
                        debug!(client = %self.addr, error = %e, "Malformed request");
                        self.stats.request_malformed();
                        Reply::failure(Status::Syntax, e.to_string())
                    }
                    Err(e) => {
                        // Say why before hanging up.
                        let reply = Reply::failure(Status::Syntax, e.to_string());
                        let _ = self.send_reply(&reply).await;
                        return Err(e.into());
                    }
                };
                self.send_reply(&reply).await?;
            }

            self.read_more_data().await?;
        }
    }

    /// Reads more data from the socket into the buffer.
    async fn read_more_data(&mut self) -> Result<(), ConnectionError> {
        if self.buffer.capacity() - self.buffer.len() < 1024 {
            self.buffer.reserve(INITIAL_BUFFER_SIZE);
        }

        let n = self.stream.get_mut().read_buf(&mut self.buffer).await?;

        if n == 0 {
            return if self.buffer.iter().all(u8::is_ascii_whitespace) {
                Err(ConnectionError::ClientDisconnected)
            } else {
                Err(ConnectionError::UnexpectedEof)
            };
        }

        self.stats.bytes_read(n);
        trace!(client = %self.addr, bytes = n, "Read data");
        Ok(())
    }

    async fn send_reply(&mut self, reply: &Reply) -> Result<(), ConnectionError> {
        self.out.clear();
        self.codec.encode(reply, &mut self.out)?;
        self.stream.write_all(&self.out).await?;
        self.stream.flush().await?;
        self.stats.bytes_written(self.out.len());
        trace!(client = %self.addr, bytes = self.out.len(), "Sent reply");
        Ok(())
    }
}

/// Errors that can occur while handling a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Client disconnected normally
    #[error("Client disconnected")]
    ClientDisconnected,

    /// Unexpected end of stream (partial datagram)
    #[error("Unexpected end of stream")]
    UnexpectedEof,
}

/// Creates a [`ConnectionHandler`] and runs it to completion.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    codec: DatagramCodec,
    command_handler: CommandHandler,
    stats: Arc<ConnectionStats>,
) {
    let handler = ConnectionHandler::new(stream, addr, codec, command_handler, stats);
    if let Err(e) = handler.run().await {
        match e {
            ConnectionError::ClientDisconnected => {}
            ConnectionError::IoError(ref io_err)
                if io_err.kind() == std::io::ErrorKind::ConnectionReset => {}
            _ => {
                debug!(client = %addr, error = %e, "Connection ended with error");
            }
        }
    }
}
