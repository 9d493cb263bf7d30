//! kvfront: readiness-driven TCP front end for a command processor
//!
//! A dispatch loop multiplexes every client socket over one thread with
//! edge-triggered readiness (mio), hands each read to a
//! [`CommandProcessor`](processor::CommandProcessor) and writes the response
//! back to the same client.
//!
//! # Architecture
//!
//! - Listener bound up front with an explicit backlog; bind failures are fatal
//! - One poll, one connection registry and one read buffer per dispatch loop
//! - Accept and read drain until `WouldBlock` on every readiness edge
//! - Optional sharding across several loops and an off-thread processor pool

/// Configuration management for the server
pub mod config;

/// Error types and result aliases
pub mod error;

/// Log sink setup
pub mod logging;

/// Network layer: acceptor, multiplexer, connections and the dispatch loop
pub mod network;

/// Command processor interface and implementations
pub mod processor;

/// Core server implementation
pub mod server;

pub use config::Config;
pub use error::{Error, Result};
pub use processor::CommandProcessor;
pub use server::Server;
