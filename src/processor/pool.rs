use super::CommandProcessor;
use crossbeam_channel::{unbounded, Receiver, Sender};
use mio::{Token, Waker};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// A processed request on its way back to the dispatch loop that owns the connection
#[derive(Debug)]
pub struct Completion {
    pub token: Token,
    pub seq: u64,
    pub response: Vec<u8>,
}

/// Where a worker delivers a completion: the owning loop's queue plus its poll waker
#[derive(Clone)]
pub struct ReplyRoute {
    tx: Sender<Completion>,
    waker: Arc<Waker>,
}

impl ReplyRoute {
    pub fn new(tx: Sender<Completion>, waker: Arc<Waker>) -> Self {
        Self { tx, waker }
    }

    fn deliver(&self, completion: Completion) {
        // A closed queue means the dispatch loop already exited
        if self.tx.send(completion).is_err() {
            return;
        }
        if let Err(e) = self.waker.wake() {
            error!("Failed to wake dispatch loop: {}", e);
        }
    }
}

/// One request handed to the pool
pub struct Job {
    pub token: Token,
    pub seq: u64,
    pub request: Vec<u8>,
    pub route: ReplyRoute,
}

/// Worker threads that run the command processor off the dispatch threads
///
/// Workers exit once every job sender (the pool and all submitters cloned
/// from it) has been dropped.
pub struct ProcessorPool {
    jobs: Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl ProcessorPool {
    /// Spawn `threads` workers sharing `processor`
    pub fn new(threads: usize, processor: Arc<dyn CommandProcessor>) -> std::io::Result<Self> {
        let (jobs, queue) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(threads);

        for worker_id in 0..threads {
            let queue = queue.clone();
            let processor = Arc::clone(&processor);
            let handle = thread::Builder::new()
                .name(format!("kvfront-processor-{}", worker_id))
                .spawn(move || run_worker(worker_id, queue, processor))?;
            workers.push(handle);
        }

        Ok(Self { jobs, workers })
    }

    /// Handle for submitting jobs from a dispatch loop
    pub fn submitter(&self) -> Sender<Job> {
        self.jobs.clone()
    }

    /// Number of worker threads
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Stop accepting jobs and wait for the workers to finish what is queued
    pub fn join(self) {
        let Self { jobs, workers } = self;
        drop(jobs);
        for handle in workers {
            let _ = handle.join();
        }
    }
}

fn run_worker(worker_id: usize, queue: Receiver<Job>, processor: Arc<dyn CommandProcessor>) {
    debug!("Processor worker {} started", worker_id);
    for job in queue {
        let response = processor.handle(&job.request);
        job.route.deliver(Completion {
            token: job.token,
            seq: job.seq,
            response,
        });
    }
    debug!("Processor worker {} stopped", worker_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Events, Poll};
    use std::time::Duration;

    const WAKER: Token = Token(1);

    #[test]
    fn completions_come_back_with_their_correlation() {
        let poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), WAKER).unwrap());
        let (tx, rx) = unbounded();
        let route = ReplyRoute::new(tx, waker);

        let processor: Arc<dyn CommandProcessor> =
            Arc::new(|req: &[u8]| req.iter().rev().copied().collect::<Vec<u8>>());
        let pool = ProcessorPool::new(2, processor).unwrap();
        assert_eq!(pool.size(), 2);

        let submit = pool.submitter();
        for seq in 0..4u64 {
            submit
                .send(Job {
                    token: Token(10 + seq as usize),
                    seq,
                    request: format!("req{}", seq).into_bytes(),
                    route: route.clone(),
                })
                .unwrap();
        }
        drop(submit);
        pool.join();

        let mut done: Vec<Completion> = rx.try_iter().collect();
        done.sort_by_key(|c| c.seq);
        assert_eq!(done.len(), 4);
        for (seq, completion) in done.iter().enumerate() {
            assert_eq!(completion.seq, seq as u64);
            assert_eq!(completion.token, Token(10 + seq));
            assert_eq!(completion.response, format!("{}qer", seq).into_bytes());
        }
    }

    #[test]
    fn delivery_wakes_the_poll() {
        let mut poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), WAKER).unwrap());
        let (tx, _rx) = unbounded();

        ReplyRoute::new(tx, waker).deliver(Completion {
            token: Token(5),
            seq: 0,
            response: b"x".to_vec(),
        });

        let mut events = Events::with_capacity(4);
        poll.poll(&mut events, Some(Duration::from_secs(1))).unwrap();
        assert!(events.iter().any(|e| e.token() == WAKER));
    }

    #[test]
    fn closed_queue_is_ignored() {
        let poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), WAKER).unwrap());
        let (tx, rx) = unbounded();
        drop(rx);

        ReplyRoute::new(tx, waker).deliver(Completion {
            token: Token(5),
            seq: 0,
            response: Vec::new(),
        });
    }
}
