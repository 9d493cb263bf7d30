//! Socket acceptance, readiness tracking and the dispatch loop

mod acceptor;
mod connection;
mod dispatcher;
mod multiplexer;
mod registry;


pub use acceptor::bind_listener;
pub use connection::{Connection, FlushOutcome, ReadOutcome};
pub use dispatcher::{DispatchSettings, Dispatcher, LISTENER, WAKER};
pub use multiplexer::{Multiplexer, ReadinessEvent};
pub use registry::ConnectionRegistry;
