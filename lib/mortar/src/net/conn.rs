use crate::net::addr::PeerAddress;
use crate::net::buffer::Buffer;
use crate::net::socket::Stream;
use crate::net::state::{ConnState, StateSet};
use crate::net::support::{ErrorType, NetworkError, NetworkResult};
use grout::logging;
use std::time::{Duration, Instant};

/// Result of one receive pass.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReadOutcome {
    /// The socket drained; more data may arrive later.
    WouldBlock(usize),
    /// The peer closed its write side after the counted bytes.
    Eof(usize),
    /// The read buffer is at capacity; the parser must consume or fail.
    Full(usize),
}

/// Per-client state owned by the reactor: the socket, the peer identity and
/// the two byte queues the protocol engine works against.
pub struct Connection {
    stream: Stream,
    peer: PeerAddress,
    pub read_buffer: Buffer,
    pub write_buffer: Buffer,
    pub state: StateSet,
    last_ingress: Instant,
    last_egress: Instant,
    log: logging::Logger,
}

impl Connection {
    pub fn new(
        stream: Stream,
        peer: PeerAddress,
        read_capacity: usize,
        write_capacity: usize,
        log: logging::Logger,
    ) -> Connection {
        let now = Instant::now();
        let mut state = StateSet::new();

        state.insert(ConnState::IDLE);

        Connection {
            stream,
            peer,
            read_buffer: Buffer::new(read_capacity),
            write_buffer: Buffer::new(write_capacity),
            state,
            last_ingress: now,
            last_egress: now,
            log,
        }
    }

    #[inline]
    pub fn peer(&self) -> &PeerAddress {
        &self.peer
    }

    #[inline]
    pub fn stream_mut(&mut self) -> &mut Stream {
        &mut self.stream
    }

    #[inline]
    pub fn has_egress(&self) -> bool {
        !self.write_buffer.is_empty()
    }

    #[inline]
    pub fn idle_for(&self, now: Instant) -> Duration {
        let last = if self.last_egress > self.last_ingress {
            self.last_egress
        } else {
            self.last_ingress
        };

        now.duration_since(last)
    }

    /// Reads everything available off the socket into the read buffer.
    pub fn receive(&mut self, now: Instant) -> NetworkResult<ReadOutcome> {
        if self.state.contains(ConnState::CLOSED) {
            return Err(NetworkError::Fatal(ErrorType::PeerClosed));
        }

        let ingress = self.read_buffer.ingress(&mut self.stream)?;

        if ingress.received > 0 {
            self.last_ingress = now;
        }

        logging::trace!(self.log, "received data";
                        "context" => "receive",
                        "peer" => %self.peer,
                        "count" => ingress.received,
                        "eof" => ingress.eof);

        if ingress.eof {
            Ok(ReadOutcome::Eof(ingress.received))
        } else if ingress.full {
            Ok(ReadOutcome::Full(ingress.received))
        } else {
            Ok(ReadOutcome::WouldBlock(ingress.received))
        }
    }

    /// Writes as much of the write buffer as the socket accepts.
    pub fn flush(&mut self, now: Instant) -> NetworkResult<usize> {
        if self.state.contains(ConnState::CLOSED) {
            return Ok(0);
        }

        if self.write_buffer.is_empty() {
            return Ok(0);
        }

        let sent = self.write_buffer.egress(&mut self.stream)?;

        if sent > 0 {
            self.last_egress = now;
        }

        logging::trace!(self.log, "flushed data";
                        "context" => "flush",
                        "peer" => %self.peer,
                        "count" => sent,
                        "pending" => self.write_buffer.len());

        Ok(sent)
    }

    /// Appends response bytes for the reactor to flush. Overrun means the
    /// peer is not consuming what we already queued.
    pub fn queue(&mut self, bytes: &[u8]) -> NetworkResult<()> {
        if self.state.contains(ConnState::CLOSED) {
            return Err(NetworkError::Fatal(ErrorType::PeerClosed));
        }

        if !self.write_buffer.append(bytes) {
            logging::warn!(self.log, "write buffer overrun";
                           "context" => "queue",
                           "peer" => %self.peer,
                           "pending" => self.write_buffer.len(),
                           "rejected" => bytes.len());

            return Err(NetworkError::Fatal(ErrorType::BufferOverrun));
        }

        Ok(())
    }

    /// Shuts the socket down and drops the buffers. Safe to call twice; the
    /// second call is a no-op.
    pub fn close(&mut self) {
        if self.state.contains(ConnState::CLOSED) {
            return;
        }

        logging::debug!(self.log, "closing connection";
                        "context" => "close",
                        "peer" => %self.peer,
                        "unread" => self.read_buffer.len(),
                        "unsent" => self.write_buffer.len());

        self.stream.shutdown();
        self.read_buffer.clear();
        self.write_buffer.clear();
        self.state.clear();
        self.state.insert(ConnState::CLOSED);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
