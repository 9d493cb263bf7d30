mod kv;
mod pool;

pub use kv::KvProcessor;
pub use pool::{Completion, Job, ProcessorPool, ReplyRoute};

/// Interprets one request and produces its response.
///
/// Called synchronously for every non-empty read. Implementations must not
/// block for long: with inline execution a slow call stalls every
/// connection served by the same dispatch loop.
pub trait CommandProcessor: Send + Sync {
    fn handle(&self, request: &[u8]) -> Vec<u8>;
}

impl<F> CommandProcessor for F
where
    F: Fn(&[u8]) -> Vec<u8> + Send + Sync,
{
    fn handle(&self, request: &[u8]) -> Vec<u8> {
        self(request)
    }
}
