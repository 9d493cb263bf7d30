use crate::config::WritePolicy;
use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use mio::Interest;
use std::collections::BTreeMap;
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Result of one bounded read
#[derive(Debug)]
pub enum ReadOutcome {
    /// This many bytes landed at the front of the buffer
    Data(usize),
    /// Peer performed an orderly shutdown
    Closed,
    /// Nothing more to read until the next readiness edge
    WouldBlock,
    Failed(io::Error),
}

/// Result of pushing the outbound buffer to the socket
#[derive(Debug)]
pub enum FlushOutcome {
    /// Everything queued has been written
    Drained,
    /// Socket is full; the rest waits for a writable edge
    Blocked,
    /// Single-shot write left bytes behind and they were dropped
    Truncated { unsent: usize },
    /// The connection can no longer be written to
    Broken(io::Error),
}

/// One accepted client link
///
/// Besides the socket, a connection tracks the responses still owed to the
/// peer. Requests are numbered as they are read; responses computed off the
/// dispatch thread may come back in any order and are released to the
/// outbound buffer strictly by that number.
///
/// Reading stops while the outbound buffer sits above the high watermark and
/// resumes once it drains to the low watermark. A peer that half-closes is
/// still owed every response for what it already sent.
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    interest: Interest,
    outbound: BytesMut,
    read_paused: bool,
    read_closed: bool,
    connected_at: Instant,
    requests: u64,
    bytes_read: u64,
    bytes_written: u64,

    // Pending-request table
    next_seq: u64,
    next_reply: u64,
    completed: BTreeMap<u64, Vec<u8>>,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            interest: Interest::READABLE,
            outbound: BytesMut::new(),
            read_paused: false,
            read_closed: false,
            connected_at: Instant::now(),
            requests: 0,
            bytes_read: 0,
            bytes_written: 0,
            next_seq: 0,
            next_reply: 0,
            completed: BTreeMap::new(),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn interest(&self) -> Interest {
        self.interest
    }

    pub fn set_interest(&mut self, interest: Interest) {
        self.interest = interest;
    }

    /// Interest the connection needs given what is still queued for the peer
    pub fn desired_interest(&self) -> Interest {
        match (self.read_paused, self.outbound.is_empty()) {
            (_, true) => Interest::READABLE,
            (true, false) => Interest::WRITABLE,
            (false, false) => Interest::READABLE | Interest::WRITABLE,
        }
    }

    /// Whether the next readable edge should be drained
    pub fn can_read(&self) -> bool {
        !self.read_closed && !self.read_paused
    }

    pub fn is_read_paused(&self) -> bool {
        self.read_paused
    }

    /// Peer sent FIN; keep the link until owed responses are written
    pub fn mark_read_closed(&mut self) {
        self.read_closed = true;
    }

    /// Peer is done sending and has been given every response
    pub fn is_finished(&self) -> bool {
        self.read_closed && self.in_flight() == 0 && self.outbound.is_empty()
    }

    /// Pause reads at `high` queued bytes, resume at `low`
    pub fn update_backpressure(&mut self, high: usize, low: usize) {
        if self.read_paused {
            if self.outbound.len() <= low {
                self.read_paused = false;
            }
            return;
        }
        if self.outbound.len() >= high {
            self.read_paused = true;
        }
    }

    pub fn requests(&self) -> u64 {
        self.requests
    }

    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Read at most `buf.len()` bytes
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> ReadOutcome {
        loop {
            match self.stream.read(buf) {
                Ok(0) => return ReadOutcome::Closed,
                Ok(n) => {
                    self.requests += 1;
                    self.bytes_read += n as u64;
                    return ReadOutcome::Data(n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return ReadOutcome::WouldBlock,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return ReadOutcome::Failed(e),
            }
        }
    }

    /// Append a response for the peer
    pub fn queue_response(&mut self, response: &[u8]) {
        self.outbound.extend_from_slice(response);
    }

    pub fn has_pending_output(&self) -> bool {
        !self.outbound.is_empty()
    }

    pub fn pending_output(&self) -> usize {
        self.outbound.len()
    }

    /// Write queued output according to `policy`
    pub fn flush(&mut self, policy: WritePolicy) -> FlushOutcome {
        match policy {
            WritePolicy::Retry => self.flush_all(),
            WritePolicy::Single => self.flush_once(),
        }
    }

    fn flush_all(&mut self) -> FlushOutcome {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => return FlushOutcome::Broken(ErrorKind::WriteZero.into()),
                Ok(n) => self.consume(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return FlushOutcome::Blocked,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return FlushOutcome::Broken(e),
            }
        }
        FlushOutcome::Drained
    }

    fn flush_once(&mut self) -> FlushOutcome {
        if self.outbound.is_empty() {
            return FlushOutcome::Drained;
        }
        let written = loop {
            match self.stream.write(&self.outbound) {
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break 0,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return FlushOutcome::Broken(e),
            }
        };
        self.consume(written);
        let unsent = self.outbound.len();
        self.outbound.clear();
        if unsent == 0 {
            FlushOutcome::Drained
        } else {
            FlushOutcome::Truncated { unsent }
        }
    }

    fn consume(&mut self, n: usize) {
        self.outbound.advance(n);
        self.bytes_written += n as u64;
    }

    /// Number the next request handed off for out-of-line processing
    pub fn begin_request(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Record the response for request `seq` and move every response that is
    /// now in order into the outbound buffer. Returns how many were released.
    pub fn complete_request(&mut self, seq: u64, response: Vec<u8>) -> usize {
        if seq < self.next_reply || seq >= self.next_seq {
            return 0;
        }
        self.completed.insert(seq, response);

        let mut released = 0;
        while let Some(response) = self.completed.remove(&self.next_reply) {
            self.outbound.extend_from_slice(&response);
            self.next_reply += 1;
            released += 1;
        }
        released
    }

    /// Requests handed off whose responses have not been released yet
    pub fn in_flight(&self) -> u64 {
        self.next_seq - self.next_reply
    }
}
