//! Protocol Decode Stream
//!
//! A [`ProtocolStream`] owns the inbound staging buffer of one connection and
//! pulls bytes through a pluggable [`StreamSource`] until the decoder yields a
//! complete message. A single message may take many reads; a single read may
//! carry several pipelined messages, which stay buffered for the next call.

use crate::protocol::parser::{DecodeError, DecodeLimits, Decoder};
use crate::protocol::types::{ProtocolMessage, ResponseFrame, Value};
use async_trait::async_trait;
use bytes::BytesMut;
use tracing::trace;

/// Bytes reserved ahead of each read.
const READ_CHUNK: usize = 4096;

/// Where a [`ProtocolStream`] gets its bytes from.
///
/// The connection supplies a source that waits for readiness with a timeout
/// and then performs one raw read.
#[async_trait]
pub trait StreamSource: Send {
    type Error: From<DecodeError> + Send;

    /// Appends whatever is available to `buf`; `Ok(0)` means end of stream.
    async fn fill(&mut self, buf: &mut BytesMut) -> Result<usize, Self::Error>;
}

/// Incremental decoder state for one connection.
#[derive(Debug)]
pub struct ProtocolStream {
    decoder: Decoder,
    buffer: BytesMut,
}

impl ProtocolStream {
    pub fn new(limits: DecodeLimits) -> Self {
        Self {
            decoder: Decoder::new(limits),
            buffer: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Number of bytes received but not yet consumed by a decoded message.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Decodes exactly one client request.
    ///
    /// Returns `Ok(None)` on a clean end of stream between messages.
    pub async fn decode<S: StreamSource>(
        &mut self,
        source: &mut S,
    ) -> Result<Option<ProtocolMessage>, S::Error> {
        match self.next_value(source).await? {
            Some(value) => Ok(Some(ProtocolMessage::from_value(&value)?)),
            None => Ok(None),
        }
    }

    /// Decodes exactly one server response frame.
    pub async fn decode_frame<S: StreamSource>(
        &mut self,
        source: &mut S,
    ) -> Result<Option<ResponseFrame>, S::Error> {
        match self.next_value(source).await? {
            Some(value) => Ok(Some(ResponseFrame::from_value(&value)?)),
            None => Ok(None),
        }
    }

    async fn next_value<S: StreamSource>(&mut self, source: &mut S) -> Result<Option<Value>, S::Error> {
        loop {
            if !self.buffer.is_empty() {
                if let Some((value, consumed)) = self.decoder.parse(&self.buffer)? {
                    let _ = self.buffer.split_to(consumed);
                    trace!(
                        consumed = consumed,
                        remaining = self.buffer.len(),
                        "Decoded message"
                    );
                    return Ok(Some(value));
                }

                let memcap = self.decoder.limits().memcap;
                if self.buffer.len() > memcap {
                    return Err(DecodeError::MemcapExceeded { max: memcap }.into());
                }
            }

            if self.buffer.capacity() - self.buffer.len() < READ_CHUNK {
                self.buffer.reserve(READ_CHUNK);
            }

            let n = source.fill(&mut self.buffer).await?;
            if n == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(DecodeError::UnexpectedEof.into());
            }
        }
    }

    /// Drops any partially received message.
    pub fn teardown(&mut self) {
        self.buffer.clear();
    }
}
