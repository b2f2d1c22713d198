//! Timeout-Bounded Socket I/O
//!
//! Every raw read and write is preceded by a readiness wait with a timeout.
//! A wait has exactly three outcomes:
//!
//! - timeout: re-check the engine stop flag and wait again
//! - stop requested: abort with [`ConnectionError::Stopped`]
//! - readiness error: abort with the I/O error
//!
//! So a connection never blocks for longer than one timeout without looking
//! at the stop flag.

use crate::config::Timeouts;
use crate::connection::handler::ConnectionError;
use crate::engine::{EngineContext, StatsCounter};
use crate::protocol::StreamSource;
use async_trait::async_trait;
use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::Interest;
use tokio::net::TcpStream;
use tracing::trace;

#[derive(Debug)]
pub struct Transport {
    socket: TcpStream,
    peer: SocketAddr,
    context: Arc<EngineContext>,
    timeouts: Timeouts,
}

impl Transport {
    pub fn new(
        socket: TcpStream,
        peer: SocketAddr,
        context: Arc<EngineContext>,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            socket,
            peer,
            context,
            timeouts,
        }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.context
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    async fn wait_ready(&self, interest: Interest, limit: Duration) -> Result<(), ConnectionError> {
        loop {
            if self.context.stop_requested() {
                return Err(ConnectionError::Stopped);
            }

            match tokio::time::timeout(limit, self.socket.ready(interest)).await {
                Err(_) => {
                    trace!(client = %self.peer, ?interest, "Readiness timeout, retrying");
                }
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Waits for readability and performs one raw read into `buf`.
    ///
    /// Returns `Ok(0)` when the peer closed its side.
    pub async fn read_some(&self, buf: &mut BytesMut) -> Result<usize, ConnectionError> {
        loop {
            self.wait_ready(Interest::READABLE, self.timeouts.read).await?;

            match self.socket.try_read_buf(buf) {
                Ok(n) => {
                    self.context
                        .stats()
                        .add(StatsCounter::BytesReceived, n as u64);
                    trace!(client = %self.peer, bytes = n, "Read data");
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Writes all of `data`, waiting for writability before each attempt.
    pub async fn write_all(&self, data: &[u8]) -> Result<(), ConnectionError> {
        let mut written = 0;

        while written < data.len() {
            self.wait_ready(Interest::WRITABLE, self.timeouts.write).await?;

            match self.socket.try_write(&data[written..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => {
                    written += n;
                    self.context.stats().add(StatsCounter::BytesSent, n as u64);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        trace!(client = %self.peer, bytes = written, "Sent data");
        Ok(())
    }
}

#[async_trait]
impl StreamSource for Transport {
    type Error = ConnectionError;

    async fn fill(&mut self, buf: &mut BytesMut) -> Result<usize, ConnectionError> {
        self.read_some(buf).await
    }
}
