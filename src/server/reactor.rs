//! Per-worker event loop (4.F of the design): owns one epoll instance, one
//! `SO_REUSEPORT` listening socket, a wakeup eventfd, and the session table
//! for every connection this worker has accepted.
//!
//! Nothing here crosses a worker boundary. The session table is a plain
//! `HashMap<RawFd, Session>` rather than the source's `vector<shared_ptr
//! <Session>>` indexed by fd (9, open question #2) — a fd that outlives its
//! Session is simply absent from the map instead of aliasing a stale slot,
//! and since a single worker thread drives both `accept()` and every
//! `close()` for its own fds, there is no window where a recycled fd number
//! could collide with a still-live entry.

use std::{
    collections::HashMap,
    os::fd::RawFd,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crate::{
    config::ServerConfig,
    server::{
        io as sock,
        registry::EndpointRegistry,
        session::{IoIntent, Session},
    },
};

/// Cadence of the idle reaper's table scan (4.H: "e.g. 1 Hz").
const REAPER_INTERVAL: Duration = Duration::from_secs(1);
/// Bounded fan-out per wake, per 4.F step 2.
const MAX_EVENTS: usize = 1024;

pub(crate) struct WorkerReactor {
    id: usize,
    epoll: sock::Epoll,
    listen_fd: RawFd,
    wake_fd: RawFd,
    sessions: HashMap<RawFd, Session>,
    config: Arc<ServerConfig>,
    registry: Arc<EndpointRegistry>,
    last_reap: Instant,
}

impl WorkerReactor {
    pub(crate) fn new(
        id: usize,
        listen_fd: RawFd,
        config: Arc<ServerConfig>,
        registry: Arc<EndpointRegistry>,
    ) -> std::io::Result<Self> {
        let epoll = sock::Epoll::new()?;
        epoll.add(listen_fd, sock::LISTENER_TOKEN, sock::READ_INTEREST)?;

        let wake_fd = sock::create_wakeup()?;
        epoll.add(wake_fd, sock::WAKE_TOKEN, sock::READ_INTEREST)?;

        Ok(Self {
            id,
            epoll,
            listen_fd,
            wake_fd,
            sessions: HashMap::new(),
            config,
            registry,
            last_reap: Instant::now(),
        })
    }

    /// The wakeup eventfd the outer controller pokes to break this worker
    /// out of `epoll_wait` at shutdown.
    pub(crate) fn wake_fd(&self) -> RawFd {
        self.wake_fd
    }

    /// Runs until `running` goes false, then tears down every owned
    /// resource and returns.
    pub(crate) fn run(&mut self, running: &AtomicBool) {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        while running.load(Ordering::Acquire) {
            let timeout_ms = self.next_timeout_ms();
            let ready = match self.epoll.wait(&mut events, timeout_ms) {
                Ok(n) => n,
                Err(err) => {
                    tracing::error!(worker = self.id, %err, "epoll_wait failed, worker exiting");
                    break;
                }
            };

            for event in &events[..ready] {
                self.dispatch_event(event.u64, event.events);
            }

            self.reap_if_due();
        }

        self.shutdown();
    }

    fn next_timeout_ms(&self) -> i32 {
        let until_reap = REAPER_INTERVAL.saturating_sub(self.last_reap.elapsed());
        until_reap.as_millis().clamp(1, REAPER_INTERVAL.as_millis()) as i32
    }

    fn dispatch_event(&mut self, token: u64, readiness: u32) {
        if token == sock::LISTENER_TOKEN {
            self.accept_loop();
            return;
        }
        if token == sock::WAKE_TOKEN {
            sock::drain_wakeup(self.wake_fd);
            return;
        }

        let fd = token as RawFd;

        if sock::is_error_event(readiness) {
            self.close_session(fd);
            return;
        }

        if readiness & sock::READ_INTEREST != 0 {
            self.handle_read(fd);
        }

        // The read above may have closed and removed this session already;
        // only a still-valid socket can be written to.
        if self.sessions.contains_key(&fd) && readiness & sock::WRITE_INTEREST != 0 {
            self.handle_write(fd);
        }
    }

    fn handle_read(&mut self, fd: RawFd) {
        let intent = match self.sessions.get_mut(&fd) {
            Some(session) => session.on_read_ready(&self.config, &self.registry),
            None => return,
        };
        self.act_on(fd, intent);
    }

    fn handle_write(&mut self, fd: RawFd) {
        let intent = match self.sessions.get_mut(&fd) {
            Some(session) => session.on_write_ready(&self.config, &self.registry),
            None => return,
        };
        self.act_on(fd, intent);
    }

    fn act_on(&mut self, fd: RawFd, intent: IoIntent) {
        match intent {
            IoIntent::WantRead => {
                let _ = self.epoll.modify(fd, fd as u64, sock::READ_INTEREST);
            }
            IoIntent::WantWrite => {
                let _ = self.epoll.modify(fd, fd as u64, sock::WRITE_INTEREST);
            }
            IoIntent::Close => self.close_session(fd),
            IoIntent::None => {}
        }
    }

    /// Accepts until `EAGAIN` (4.F step 3a). Each new connection is
    /// registered with READ interest only — WRITE is armed on-demand, per
    /// the design notes' third open question.
    fn accept_loop(&mut self) {
        loop {
            let fd = match sock::accept_nonblocking(self.listen_fd) {
                Ok(Some(fd)) => fd,
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!(worker = self.id, %err, "accept failed");
                    break;
                }
            };

            if let Err(err) = sock::set_tcp_nodelay(fd) {
                tracing::debug!(worker = self.id, %err, "TCP_NODELAY failed");
            }

            if let Err(err) = self.epoll.add(fd, fd as u64, sock::READ_INTEREST) {
                tracing::warn!(worker = self.id, %err, "failed to register accepted socket");
                sock::close_fd(fd);
                continue;
            }

            self.sessions.insert(fd, Session::new(fd, &self.config));
        }
    }

    fn close_session(&mut self, fd: RawFd) {
        let _ = self.epoll.delete(fd);
        match self.sessions.remove(&fd) {
            Some(mut session) => session.close(),
            None => sock::close_fd(fd),
        }
    }

    /// 4.H: scans every session this worker owns and closes any that have
    /// been idle past `connection_timeout_ms`. Runs on the worker thread
    /// that owns these sessions, never cross-thread.
    fn reap_if_due(&mut self) {
        if self.last_reap.elapsed() < REAPER_INTERVAL {
            return;
        }
        self.last_reap = Instant::now();

        let timeout = self.config.connection_timeout();
        let stale: Vec<RawFd> = self
            .sessions
            .iter()
            .filter(|(_, session)| session.last_activity.elapsed() > timeout)
            .map(|(fd, _)| *fd)
            .collect();

        for fd in stale {
            tracing::debug!(worker = self.id, fd, "reaping idle connection");
            self.close_session(fd);
        }
    }

    fn shutdown(&mut self) {
        for (fd, mut session) in self.sessions.drain() {
            let _ = self.epoll.delete(fd);
            session.close();
        }

        let _ = self.epoll.delete(self.listen_fd);
        sock::close_fd(self.listen_fd);
        let _ = self.epoll.delete(self.wake_fd);
        sock::close_fd(self.wake_fd);

        tracing::info!(worker = self.id, "worker exited");
    }
}
