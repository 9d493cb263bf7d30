use crate::error::{Error, Result};
use mio::event::Source;
use mio::{Events, Interest, Poll, Registry, Token};
use std::io::ErrorKind;
use std::time::Duration;
use tracing::debug;

/// One ready descriptor reported by [`Multiplexer::wait`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessEvent {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    /// Peer hung up or the socket reported an error
    pub closed: bool,
}

/// Edge-triggered readiness notification over `mio::Poll`
///
/// A registered source is reported once per transition into readiness, so
/// callers must drain it until `WouldBlock` before waiting again.
pub struct Multiplexer {
    poll: Poll,
    events: Events,
}

impl Multiplexer {
    /// Create a multiplexer reporting at most `max_events` events per wait
    pub fn new(max_events: usize) -> Result<Self> {
        Ok(Self {
            poll: Poll::new().map_err(Error::PollCreate)?,
            events: Events::with_capacity(max_events),
        })
    }

    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Start watching `source` under `token`
    pub fn register<S>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
        what: &'static str,
    ) -> Result<()>
    where
        S: Source + ?Sized,
    {
        self.poll
            .registry()
            .register(source, token, interest)
            .map_err(|e| Error::Register { what, source: e })
    }

    /// Change the interest set of an already registered source
    pub fn reregister<S>(&self, source: &mut S, token: Token, interest: Interest) -> Result<()>
    where
        S: Source + ?Sized,
    {
        self.poll
            .registry()
            .reregister(source, token, interest)
            .map_err(|e| Error::Register {
                what: "client socket",
                source: e,
            })
    }

    /// Stop watching `source`. Failure only means the kernel already forgot it.
    pub fn deregister<S>(&self, source: &mut S)
    where
        S: Source + ?Sized,
    {
        if let Err(e) = self.poll.registry().deregister(source) {
            debug!("Deregister failed: {}", e);
        }
    }

    /// Block until at least one source is ready (or `timeout` passes) and
    /// copy the batch into `ready`.
    ///
    /// An interrupted wait yields an empty batch. Any other failure is fatal.
    pub fn wait(
        &mut self,
        ready: &mut Vec<ReadinessEvent>,
        timeout: Option<Duration>,
    ) -> Result<usize> {
        ready.clear();
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(Error::Wait(e)),
        }

        ready.extend(self.events.iter().map(|event| ReadinessEvent {
            token: event.token(),
            readable: event.is_readable(),
            writable: event.is_writable(),
            closed: event.is_read_closed() || event.is_error(),
        }));
        Ok(ready.len())
    }

    /// Upper bound on events per wait
    pub fn batch_capacity(&self) -> usize {
        self.events.capacity()
    }
}
