use std::io;
use std::net::SocketAddrV4;
use thiserror::Error;

/// Errors that stop the server.
///
/// Per-connection failures (accept, read, write) are logged and handled
/// inside the dispatch loop; they never surface through this type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("FeOxDB error: {0}")]
    Database(#[from] feoxdb::FeoxError),

    #[error("Failed to create socket: {0}")]
    SocketCreate(#[source] nix::Error),

    #[error("Failed to bind socket to {addr}: {source}")]
    Bind {
        addr: SocketAddrV4,
        #[source]
        source: nix::Error,
    },

    #[error("Failed to listen on socket: {0}")]
    Listen(#[source] nix::Error),

    #[error("Failed to create poll instance: {0}")]
    PollCreate(#[source] io::Error),

    #[error("Failed to register {what} with poll: {source}")]
    Register {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Error in poll wait: {0}")]
    Wait(#[source] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the error comes from socket or poll infrastructure rather than
    /// from configuration or the processor backend.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Error::SocketCreate(_)
                | Error::Bind { .. }
                | Error::Listen(_)
                | Error::PollCreate(_)
                | Error::Register { .. }
                | Error::Wait(_)
        )
    }
}
