use super::connection::{Connection, FlushOutcome, ReadOutcome};
use super::multiplexer::{Multiplexer, ReadinessEvent};
use super::registry::ConnectionRegistry;
use crate::config::{Config, WritePolicy};
use crate::error::{Error, Result};
use crate::processor::{CommandProcessor, Completion, Job, ProcessorPool, ReplyRoute};
use crossbeam_channel::{unbounded, Receiver, Sender};
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token, Waker};
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Token of the listening socket
pub const LISTENER: Token = Token(0);
/// Token of the waker used for shutdown and pool completions
pub const WAKER: Token = Token(1);
const FIRST_CONNECTION_TOKEN: usize = 2;

/// Per-loop tunables taken from [`Config`]
#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    pub max_events: usize,
    pub buffer_size: usize,
    pub write_policy: WritePolicy,
    pub write_high_watermark: usize,
    pub write_low_watermark: usize,
    pub tcp_nodelay: bool,
}

impl From<&Config> for DispatchSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_events: config.max_events,
            buffer_size: config.buffer_size,
            write_policy: config.write_policy,
            write_high_watermark: config.write_high_watermark,
            write_low_watermark: config.write_low_watermark,
            tcp_nodelay: config.tcp_nodelay,
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Where request bytes go once read
enum Execution {
    /// Call the processor on the dispatch thread
    Inline(Arc<dyn CommandProcessor>),
    /// Hand the request to a worker pool and wait for the completion
    Offload {
        jobs: Sender<Job>,
        route: ReplyRoute,
        completions: Receiver<Completion>,
    },
}

/// Why a connection is being torn down
enum CloseReason {
    PeerClosed,
    ReadFailed(io::Error),
    WriteFailed(io::Error),
    ProcessorGone,
    Shutdown,
}

/// Single-threaded readiness loop: accepts connections, reads requests,
/// runs them through the processor and writes the responses back.
///
/// Every read of up to `buffer_size` bytes is one request. There is no
/// framing: a request split across two reads reaches the processor as two
/// requests, and two requests arriving in one read reach it as one.
pub struct Dispatcher {
    id: usize,
    mux: Multiplexer,
    listener: TcpListener,
    waker: Arc<Waker>,
    registry: ConnectionRegistry,
    ready: Vec<ReadinessEvent>,
    read_buffer: Vec<u8>,
    settings: DispatchSettings,
    execution: Execution,
    active: Arc<AtomicUsize>,
}

impl Dispatcher {
    /// Build a loop around an already listening socket.
    ///
    /// # Errors
    ///
    /// Fails if the poll instance cannot be created or the listener or waker
    /// cannot be registered with it.
    pub fn new(
        id: usize,
        listener: std::net::TcpListener,
        processor: Arc<dyn CommandProcessor>,
        settings: DispatchSettings,
    ) -> Result<Self> {
        let mux = Multiplexer::new(settings.max_events)?;

        listener.set_nonblocking(true)?;
        let mut listener = TcpListener::from_std(listener);
        mux.register(&mut listener, LISTENER, Interest::READABLE, "server socket")?;

        let waker = Waker::new(mux.registry(), WAKER).map_err(|e| Error::Register {
            what: "waker",
            source: e,
        })?;

        Ok(Self {
            id,
            mux,
            listener,
            waker: Arc::new(waker),
            registry: ConnectionRegistry::new(FIRST_CONNECTION_TOKEN),
            ready: Vec::with_capacity(settings.max_events),
            read_buffer: vec![0u8; settings.buffer_size],
            settings,
            execution: Execution::Inline(processor),
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Run requests on `pool` instead of on this thread
    pub fn offload_to(mut self, pool: &ProcessorPool) -> Self {
        let (tx, completions) = unbounded();
        self.execution = Execution::Offload {
            jobs: pool.submitter(),
            route: ReplyRoute::new(tx, Arc::clone(&self.waker)),
            completions,
        };
        self
    }

    /// Count connections in a counter shared with other loops
    pub fn with_connection_counter(mut self, active: Arc<AtomicUsize>) -> Self {
        self.active = active;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Waker that interrupts a blocked [`Dispatcher::poll_once`]
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Connections currently open on this loop
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Response bytes queued across all connections, not yet written
    pub fn pending_output(&self) -> usize {
        self.registry.pending_output()
    }

    /// Run until `shutdown` is set, then close every connection.
    ///
    /// Waits without a timeout; whoever sets `shutdown` must also wake the
    /// loop through [`Dispatcher::waker`].
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        debug!("Dispatch loop {} started", self.id);
        while !shutdown.load(Ordering::Acquire) {
            self.poll_once(None)?;
        }
        self.close_all();
        debug!("Dispatch loop {} stopped", self.id);
        Ok(())
    }

    /// Wait for one batch of readiness events and handle each in order.
    ///
    /// Returns the number of events in the batch.
    ///
    /// # Errors
    ///
    /// Only infrastructure failures (poll wait, socket registration) are
    /// returned; per-connection failures are logged and the connection closed.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> Result<usize> {
        let count = self.mux.wait(&mut self.ready, timeout)?;

        for index in 0..count {
            let event = self.ready[index];
            match event.token {
                LISTENER => self.accept_connections()?,
                WAKER => {}
                token => self.handle_connection_event(token, event)?,
            }
        }

        // Completions are drained every pass: wakes may be coalesced
        self.drain_completions()?;

        Ok(count)
    }

    /// Close every open connection. The listener stays registered.
    pub fn close_all(&mut self) {
        let connections: Vec<Connection> = self.registry.drain().map(|(_, c)| c).collect();
        for connection in connections {
            self.close_connection(connection, CloseReason::Shutdown);
        }
    }

    fn accept_connections(&mut self) -> Result<()> {
        // Edge-triggered: accept until the queue is empty
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.open_connection(stream, peer)?,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::Interrupted | ErrorKind::ConnectionAborted
                    ) =>
                {
                    continue
                }
                Err(e) => {
                    error!("Failed to accept client connection: {}", e);
                    return Ok(());
                }
            }
        }
    }

    fn open_connection(&mut self, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
        if let Err(e) = stream.set_nodelay(self.settings.tcp_nodelay) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }

        let token = self.registry.allocate_token();
        self.mux
            .register(&mut stream, token, Interest::READABLE, "client socket")?;

        info!("New connection from {}", peer);
        self.registry.insert(token, Connection::new(stream, peer));
        self.active.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn handle_connection_event(&mut self, token: Token, event: ReadinessEvent) -> Result<()> {
        // Stale event for a connection closed earlier in this batch
        let Some(mut connection) = self.registry.remove(token) else {
            return Ok(());
        };

        let mut outcome = None;
        if (event.readable || event.closed) && connection.can_read() {
            outcome = self.drain_reads(token, &mut connection);
        }
        if outcome.is_none() && event.writable && connection.has_pending_output() {
            outcome = self.flush_and_resume(token, &mut connection);
        }

        self.settle(token, connection, outcome)
    }

    /// Read until the socket would block or backpressure pauses the
    /// connection, treating each chunk as one request
    fn drain_reads(&mut self, token: Token, connection: &mut Connection) -> Option<CloseReason> {
        while connection.can_read() {
            let n = match connection.read_chunk(&mut self.read_buffer) {
                ReadOutcome::Data(n) => n,
                ReadOutcome::WouldBlock => return None,
                ReadOutcome::Closed => {
                    // Closed once every owed response is out, see `settle`
                    connection.mark_read_closed();
                    return None;
                }
                ReadOutcome::Failed(e) => return Some(CloseReason::ReadFailed(e)),
            };
            let request = &self.read_buffer[..n];

            match &self.execution {
                Execution::Inline(processor) => {
                    let response = processor.handle(request);
                    connection.queue_response(&response);
                    if let Some(reason) = Self::flush_connection(connection, &self.settings) {
                        return Some(reason);
                    }
                }
                Execution::Offload { jobs, route, .. } => {
                    let job = Job {
                        token,
                        seq: connection.begin_request(),
                        request: request.to_vec(),
                        route: route.clone(),
                    };
                    if jobs.send(job).is_err() {
                        return Some(CloseReason::ProcessorGone);
                    }
                }
            }
        }
        None
    }

    /// Flush, and if that lifted backpressure, read what arrived meanwhile
    fn flush_and_resume(
        &mut self,
        token: Token,
        connection: &mut Connection,
    ) -> Option<CloseReason> {
        let was_paused = connection.is_read_paused();
        let outcome = Self::flush_connection(connection, &self.settings);
        // Input left in the kernel while paused will not raise another edge
        if outcome.is_none() && was_paused && connection.can_read() {
            return self.drain_reads(token, connection);
        }
        outcome
    }

    /// Write what the policy allows, then re-evaluate read backpressure
    fn flush_connection(
        connection: &mut Connection,
        settings: &DispatchSettings,
    ) -> Option<CloseReason> {
        let outcome = match connection.flush(settings.write_policy) {
            FlushOutcome::Drained | FlushOutcome::Blocked => None,
            FlushOutcome::Truncated { unsent } => {
                warn!(
                    "Short write to {}: dropped {} response bytes",
                    connection.peer(),
                    unsent
                );
                None
            }
            FlushOutcome::Broken(e) => Some(CloseReason::WriteFailed(e)),
        };
        connection.update_backpressure(settings.write_high_watermark, settings.write_low_watermark);
        outcome
    }

    fn drain_completions(&mut self) -> Result<()> {
        let Execution::Offload { completions, .. } = &self.execution else {
            return Ok(());
        };
        let completions = completions.clone();

        for completion in completions.try_iter() {
            let Some(mut connection) = self.registry.remove(completion.token) else {
                debug!(
                    "Dropping response for closed connection {:?}",
                    completion.token
                );
                continue;
            };
            connection.complete_request(completion.seq, completion.response);
            let outcome = self.flush_and_resume(completion.token, &mut connection);
            self.settle(completion.token, connection, outcome)?;
        }
        Ok(())
    }

    /// Put a connection back with the interest it now needs, or close it
    fn settle(
        &mut self,
        token: Token,
        mut connection: Connection,
        outcome: Option<CloseReason>,
    ) -> Result<()> {
        if let Some(reason) = outcome {
            self.close_connection(connection, reason);
            return Ok(());
        }
        if connection.is_finished() {
            self.close_connection(connection, CloseReason::PeerClosed);
            return Ok(());
        }

        let desired = connection.desired_interest();
        if desired != connection.interest() {
            self.mux
                .reregister(connection.stream_mut(), token, desired)?;
            connection.set_interest(desired);
        }
        self.registry.insert(token, connection);
        Ok(())
    }

    fn close_connection(&self, mut connection: Connection, reason: CloseReason) {
        self.mux.deregister(connection.stream_mut());

        let peer = connection.peer();
        match reason {
            CloseReason::PeerClosed => info!("Client disconnected {}", peer),
            CloseReason::Shutdown => info!("Closing connection {} on shutdown", peer),
            CloseReason::ReadFailed(e) => error!("Error in recv from {}: {}", peer, e),
            CloseReason::WriteFailed(e) => error!("Error in send to {}: {}", peer, e),
            CloseReason::ProcessorGone => {
                error!("Processor pool unavailable, dropping {}", peer)
            }
        }
        debug!(
            "Connection {} served {} requests ({} bytes in, {} bytes out) over {:?}",
            peer,
            connection.requests(),
            connection.bytes_read(),
            connection.bytes_written(),
            connection.age()
        );

        // Dropping the stream closes the descriptor
        drop(connection);
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}
