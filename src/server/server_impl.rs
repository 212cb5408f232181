//! The public entry point: [`ServerBuilder`] assembles a [`ServerConfig`]
//! and an [`EndpointRegistry`], and [`Server::launch`] turns that into N
//! pinned worker threads, each running its own [`WorkerReactor`] (4.F/4.G).

use std::{
    os::fd::RawFd,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use crate::{
    config::ServerConfig,
    errors::ServerError,
    server::{
        io,
        reactor::WorkerReactor,
        registry::{EndpointRegistry, EndpointRegistryBuilder, Handler},
    },
};

/// Builds a [`Server`]: register every route up front, then [`build`](Self::build)
/// — the resulting [`EndpointRegistry`] is immutable for the server's
/// lifetime (4.D).
///
/// # Examples
/// ```no_run
/// use reactorweb::{ServerBuilder, StatusCode};
///
/// use reactorweb::{Request, Response, Handled};
///
/// let server = ServerBuilder::new()
///     .port(8080)
///     .get("/", |_: &Request, resp: &mut Response| -> Handled {
///         resp.status(StatusCode::Ok).body("ok")
///     })
///     .unwrap()
///     .build();
/// ```
pub struct ServerBuilder {
    config: ServerConfig,
    routes: EndpointRegistryBuilder,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            routes: EndpointRegistryBuilder::new(),
        }
    }

    /// Replaces the whole configuration in one call.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Bind address (default `0.0.0.0`).
    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        self.config.ip = ip.into();
        self
    }

    /// Bind port.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Worker thread count (default: hardware concurrency; see
    /// [`ServerConfig::resolved_thread_count`]).
    pub fn max_threads(mut self, max_threads: u32) -> Self {
        self.config.max_threads = max_threads;
        self
    }

    /// Registers `handler` for the exact `(path, method)` pair. Fails if
    /// that pair is already registered (4.D: "fails with DuplicateRoute on
    /// collision").
    pub fn route(
        mut self,
        path: &str,
        method: &str,
        handler: impl Handler,
    ) -> Result<Self, ServerError> {
        self.routes.register(path, method, handler)?;
        Ok(self)
    }

    pub fn get(self, path: &str, handler: impl Handler) -> Result<Self, ServerError> {
        self.route(path, "GET", handler)
    }

    pub fn post(self, path: &str, handler: impl Handler) -> Result<Self, ServerError> {
        self.route(path, "POST", handler)
    }

    pub fn put(self, path: &str, handler: impl Handler) -> Result<Self, ServerError> {
        self.route(path, "PUT", handler)
    }

    pub fn patch(self, path: &str, handler: impl Handler) -> Result<Self, ServerError> {
        self.route(path, "PATCH", handler)
    }

    pub fn delete(self, path: &str, handler: impl Handler) -> Result<Self, ServerError> {
        self.route(path, "DELETE", handler)
    }

    pub fn head(self, path: &str, handler: impl Handler) -> Result<Self, ServerError> {
        self.route(path, "HEAD", handler)
    }

    pub fn options(self, path: &str, handler: impl Handler) -> Result<Self, ServerError> {
        self.route(path, "OPTIONS", handler)
    }

    pub fn build(self) -> Server {
        Server {
            config: Arc::new(self.config),
            registry: Arc::new(self.routes.build()),
        }
    }
}

/// A built, ready-to-launch server. Immutable: every route and config
/// value is fixed once [`ServerBuilder::build`] runs.
pub struct Server {
    config: Arc<ServerConfig>,
    registry: Arc<EndpointRegistry>,
}

impl Server {
    #[inline]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Binds one `SO_REUSEPORT` listener per worker, pins each worker
    /// thread to a CPU core (5: "N parallel OS threads, each pinned to one
    /// CPU core"), installs `SIGINT`/`SIGTERM` handling, and blocks until
    /// every worker exits.
    ///
    /// Returns [`ServerError::SocketSetupError`] only if *every* worker
    /// failed to bind — a single worker's bind failure is logged and that
    /// worker simply does not start, since `SO_REUSEPORT` means its peers
    /// keep serving the port (7: "fatal to the owning worker; other
    /// workers may continue if using SO_REUSEPORT").
    pub fn launch(self) -> Result<(), ServerError> {
        io::raise_nofile_limit();

        let thread_count = self.config.resolved_thread_count().max(1);
        let core_ids = core_affinity::get_core_ids().unwrap_or_default();
        let running = Arc::new(AtomicBool::new(true));

        let (wake_tx, wake_rx) = crossbeam::channel::bounded::<Result<RawFd, String>>(thread_count);
        let mut handles = Vec::with_capacity(thread_count);

        for id in 0..thread_count {
            let config = self.config.clone();
            let registry = self.registry.clone();
            let running = running.clone();
            let wake_tx = wake_tx.clone();
            let core_id = (!core_ids.is_empty()).then(|| core_ids[id % core_ids.len()]);

            let handle = thread::Builder::new()
                .name(format!("reactorweb-worker-{id}"))
                .spawn(move || {
                    if let Some(core_id) = core_id {
                        core_affinity::set_for_current(core_id);
                    }
                    run_worker(id, config, registry, running, wake_tx);
                })
                .map_err(|err| ServerError::FatalWorkerError(err.to_string()))?;

            handles.push(handle);
        }
        drop(wake_tx);

        let wake_fds: Vec<RawFd> = wake_rx
            .iter()
            .filter_map(|result| match result {
                Ok(fd) => Some(fd),
                Err(err) => {
                    tracing::warn!(%err, "a worker failed to start");
                    None
                }
            })
            .collect();

        if wake_fds.is_empty() {
            running.store(false, Ordering::Release);
            for handle in handles {
                let _ = handle.join();
            }
            return Err(ServerError::SocketSetupError(std::io::Error::new(
                std::io::ErrorKind::Other,
                "no worker was able to bind a listening socket",
            )));
        }

        let shutdown_running = running.clone();
        let shutdown_wake_fds = wake_fds.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutdown signal received, draining connections");
            shutdown_running.store(false, Ordering::Release);
            for &fd in &shutdown_wake_fds {
                io::notify_wakeup(fd);
            }
        })
        .map_err(|err| ServerError::FatalWorkerError(format!("failed to install signal handler: {err}")))?;

        for handle in handles {
            let _ = handle.join();
        }

        Ok(())
    }
}

/// Runs on a freshly spawned, pinned worker thread: binds this worker's
/// own `SO_REUSEPORT` listener, builds its [`WorkerReactor`], reports the
/// reactor's wakeup fd back to [`Server::launch`] so shutdown can reach it,
/// then runs until `running` goes false.
fn run_worker(
    id: usize,
    config: Arc<ServerConfig>,
    registry: Arc<EndpointRegistry>,
    running: Arc<AtomicBool>,
    wake_tx: crossbeam::channel::Sender<Result<RawFd, String>>,
) {
    let listen_fd = match io::create_listener(&config.ip, config.port, config.backlog_size) {
        Ok(fd) => fd,
        Err(err) => {
            let _ = wake_tx.send(Err(format!("worker {id} bind failed: {err}")));
            return;
        }
    };

    let mut reactor = match WorkerReactor::new(id, listen_fd, config, registry) {
        Ok(reactor) => reactor,
        Err(err) => {
            io::close_fd(listen_fd);
            let _ = wake_tx.send(Err(format!("worker {id} epoll setup failed: {err}")));
            return;
        }
    };

    let _ = wake_tx.send(Ok(reactor.wake_fd()));
    drop(wake_tx);

    tracing::info!(worker = id, "listening");
    reactor.run(&running);
}
