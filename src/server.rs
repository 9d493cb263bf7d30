use crate::config::Config;
use crate::error::{Error, Result};
use crate::network::{bind_listener, DispatchSettings, Dispatcher};
use crate::processor::{CommandProcessor, ProcessorPool};
use mio::Waker;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{error, info};

/// TCP front end relaying each request to a [`CommandProcessor`]
///
/// The listening socket is bound by [`Server::bind`], so address problems
/// surface before [`Server::run`] is ever called. `run` takes the socket
/// over and closes it on return; a server runs once.
pub struct Server {
    config: Config,
    processor: Arc<dyn CommandProcessor>,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    shutdown: AtomicBool,
    active_connections: Arc<AtomicUsize>,
    wakers: Mutex<Vec<Arc<Waker>>>,
}

impl Server {
    /// Validate the configuration and bind the listening socket
    pub fn bind(config: Config, processor: Arc<dyn CommandProcessor>) -> Result<Self> {
        let addr = config
            .validate()
            .and_then(|()| config.listen_addr())
            .map_err(|e| Error::Config(e.to_string()))?;

        let listener = bind_listener(addr, config.backlog)?;
        let local_addr = listener.local_addr()?;
        info!("Server started. Listening on port {}", local_addr.port());

        Ok(Self {
            config,
            processor,
            local_addr,
            listener: Mutex::new(Some(listener)),
            shutdown: AtomicBool::new(false),
            active_connections: Arc::new(AtomicUsize::new(0)),
            wakers: Mutex::new(Vec::new()),
        })
    }

    /// Address the server is listening on
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local_addr)
    }

    /// Run the dispatch loops
    ///
    /// This method blocks until [`Server::shutdown`] is called or a loop hits
    /// a fatal error. With `threads > 1` each loop runs on its own thread and
    /// the first fatal error is returned once all loops have stopped.
    pub fn run(&self) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .ok_or_else(|| anyhow::anyhow!("server is already running or has run"))?;
        let listeners = self.shard_listeners(listener)?;

        let pool = if self.config.offloads_processor() {
            let pool =
                ProcessorPool::new(self.config.processor_threads, Arc::clone(&self.processor))?;
            info!("Processing requests on {} worker threads", pool.size());
            Some(pool)
        } else {
            None
        };

        let settings = DispatchSettings::from(&self.config);
        let mut dispatchers = Vec::with_capacity(listeners.len());
        for (id, listener) in listeners.into_iter().enumerate() {
            let mut dispatcher =
                Dispatcher::new(id, listener, Arc::clone(&self.processor), settings)?
                    .with_connection_counter(Arc::clone(&self.active_connections));
            if let Some(pool) = &pool {
                dispatcher = dispatcher.offload_to(pool);
            }
            dispatchers.push(dispatcher);
        }

        if let Ok(mut wakers) = self.wakers.lock() {
            wakers.extend(dispatchers.iter().map(Dispatcher::waker));
        }

        let result = if dispatchers.len() == 1 {
            let mut dispatcher = dispatchers.remove(0);
            self.run_dispatcher(&mut dispatcher)
        } else {
            thread::scope(|scope| {
                let handles: Vec<_> = dispatchers
                    .into_iter()
                    .map(|mut dispatcher| scope.spawn(move || self.run_dispatcher(&mut dispatcher)))
                    .collect();

                let mut first_error = None;
                for handle in handles {
                    match handle.join() {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            first_error.get_or_insert(e);
                        }
                        Err(_) => error!("Dispatch loop panicked"),
                    }
                }
                first_error.map_or(Ok(()), Err)
            })
        };

        if let Ok(mut wakers) = self.wakers.lock() {
            wakers.clear();
        }
        if let Some(pool) = pool {
            pool.join();
        }
        result
    }

    /// One listener per dispatch loop; duplicates only when sharding
    fn shard_listeners(&self, listener: TcpListener) -> Result<Vec<TcpListener>> {
        let mut listeners = Vec::with_capacity(self.config.threads);
        for _ in 1..self.config.threads {
            listeners.push(listener.try_clone()?);
        }
        listeners.push(listener);
        Ok(listeners)
    }

    fn run_dispatcher(&self, dispatcher: &mut Dispatcher) -> Result<()> {
        let result = dispatcher.run(&self.shutdown);
        if let Err(e) = &result {
            error!("Dispatch loop failed: {}", e);
            // One loop down takes the others with it
            self.shutdown();
        }
        result
    }

    /// Signal every dispatch loop to close its connections and return
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Initiating server shutdown");
        if let Ok(wakers) = self.wakers.lock() {
            for waker in wakers.iter() {
                if let Err(e) = waker.wake() {
                    error!("Failed to wake dispatch loop: {}", e);
                }
            }
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Get the number of active client connections
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
