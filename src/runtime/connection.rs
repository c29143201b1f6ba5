//! Per-connection I/O state machine.
//!
//! A `Connection` owns one channel, a read buffer that accumulates bytes
//! until whole frames are available, a queue of encoded outbound frames, and
//! the codec bound at registration. It is driven exclusively by its owning
//! controller's thread, so none of its buffers need synchronization.
//!
//! The channel is generic so the state machine can be driven by any
//! non-blocking `Read + Write` endpoint; controllers use `mio::net::TcpStream`.

use crate::codec::{Codec, CodecKind};
use crate::error::ConnectionError;
use crate::frame;
use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;
use std::io::{self, IoSlice, Read, Write};
use std::sync::Arc;
use tracing::debug;

/// Identifier of a connection, unique within its controller.
pub type ConnectionId = u64;

/// Upper bound on buffers handed to a single vectored write.
const MAX_WRITE_SLICES: usize = 64;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Open,
    Closed,
}

/// Result of draining the write queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Every queued byte reached the channel.
    Flushed,
    /// The channel stopped accepting bytes; resume on the next writable event.
    Pending,
}

/// Frames decoded by one readable event.
///
/// Frames completed before EOF or before a failure are always returned, so
/// the caller can dispatch them before closing the connection.
#[derive(Debug, Default)]
pub struct ReadOutcome {
    /// Decoded payloads in receipt order.
    pub frames: Vec<Vec<u8>>,
    /// The peer closed its write half.
    pub eof: bool,
    /// The read budget ran out before the channel would block.
    pub exhausted: bool,
    /// Read or decode failure that ended this call. The connection must close.
    pub error: Option<ConnectionError>,
}

impl ReadOutcome {
    /// True if the connection cannot be read from again.
    pub fn is_terminal(&self) -> bool {
        self.eof || self.error.is_some()
    }
}

/// A single framed, codec-bound connection.
pub struct Connection<S> {
    id: ConnectionId,
    stream: S,
    codec: Arc<dyn Codec>,
    read_buf: BytesMut,
    write_queue: VecDeque<Bytes>,
    pending_bytes: usize,
    max_frame_size: usize,
    read_chunk: usize,
    state: ConnState,
}

impl<S: Read + Write> Connection<S> {
    /// Wrap a channel. The codec is fixed for the connection's lifetime.
    pub fn new(
        id: ConnectionId,
        stream: S,
        codec: Arc<dyn Codec>,
        max_frame_size: usize,
        read_chunk: usize,
    ) -> Self {
        Self {
            id,
            stream,
            codec,
            read_buf: BytesMut::with_capacity(read_chunk),
            write_queue: VecDeque::new(),
            pending_bytes: 0,
            max_frame_size,
            read_chunk: read_chunk.max(frame::HEADER_LEN),
            state: ConnState::Open,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn codec_kind(&self) -> CodecKind {
        self.codec.kind()
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    /// Bytes queued but not yet accepted by the channel.
    pub fn pending_write_bytes(&self) -> usize {
        self.pending_bytes
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.write_queue.is_empty()
    }

    /// Access the channel, e.g. for poll registration.
    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Read until the channel would block, then decode every complete frame.
    ///
    /// At most `max_reads` read calls are made. When the budget runs out
    /// first, `exhausted` is set and the caller must come back without
    /// waiting for another readiness event. Frames are decoded as bytes
    /// arrive so the read buffer never holds more than one partial frame plus
    /// one read chunk.
    pub fn read_ready(&mut self, max_reads: usize) -> Result<ReadOutcome, ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }

        let mut outcome = ReadOutcome::default();
        let mut reads = 0;
        loop {
            if reads >= max_reads {
                outcome.exhausted = true;
                break;
            }
            reads += 1;

            let start = self.read_buf.len();
            self.read_buf.resize(start + self.read_chunk, 0);

            match self.stream.read(&mut self.read_buf[start..]) {
                Ok(0) => {
                    self.read_buf.truncate(start);
                    outcome.eof = true;
                    break;
                }
                Ok(n) => {
                    self.read_buf.truncate(start + n);
                    if let Err(e) = self.decode_frames(&mut outcome.frames) {
                        outcome.error = Some(e);
                        break;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.read_buf.truncate(start);
                    break;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                    self.read_buf.truncate(start);
                }
                Err(e) => {
                    self.read_buf.truncate(start);
                    outcome.error = Some(e.into());
                    break;
                }
            }
        }

        Ok(outcome)
    }

    fn decode_frames(&mut self, out: &mut Vec<Vec<u8>>) -> Result<(), ConnectionError> {
        while let Some(payload) =
            frame::decode(&mut self.read_buf, self.codec.as_ref(), self.max_frame_size)?
        {
            out.push(payload);
        }
        Ok(())
    }

    /// Compress and frame `payload`, then queue it for writing.
    ///
    /// Nothing is written here; call `write_ready` to push bytes out.
    pub fn send(&mut self, payload: &[u8]) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let frame = frame::encode(self.codec.as_ref(), payload)?;
        self.pending_bytes += frame.len();
        self.write_queue.push_back(frame);
        Ok(())
    }

    /// Write queued frames until the queue drains or the channel would block.
    ///
    /// Partially written frames keep their position and resume on the next
    /// call.
    pub fn write_ready(&mut self) -> Result<WriteStatus, ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }

        while !self.write_queue.is_empty() {
            let result = {
                let slices: Vec<IoSlice<'_>> = self
                    .write_queue
                    .iter()
                    .take(MAX_WRITE_SLICES)
                    .map(|frame| IoSlice::new(frame))
                    .collect();
                self.stream.write_vectored(&slices)
            };

            match result {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0").into());
                }
                Ok(n) => self.consume_written(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(WriteStatus::Pending);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(WriteStatus::Flushed)
    }

    fn consume_written(&mut self, mut n: usize) {
        self.pending_bytes -= n;
        while n > 0 {
            let Some(front) = self.write_queue.front_mut() else {
                break;
            };
            if n >= front.len() {
                n -= front.len();
                self.write_queue.pop_front();
            } else {
                front.advance(n);
                n = 0;
            }
        }
    }

    /// Push out whatever the channel accepts without blocking, then close.
    pub fn flush_and_close(&mut self) {
        if !self.is_closed() {
            if let Err(e) = self.write_ready() {
                debug!(conn_id = self.id, error = %e, "Flush before close failed");
            }
        }
        self.close();
    }

    /// Mark the connection closed and drop its buffers. Idempotent.
    pub fn close(&mut self) {
        self.state = ConnState::Closed;
        self.read_buf.clear();
        self.write_queue.clear();
        self.pending_bytes = 0;
    }
}
