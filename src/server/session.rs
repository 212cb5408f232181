//! Per-connection state machine (4.E of the design): owns the socket, both
//! ring buffers, the request-scratch [`Parser`], and the `Request`/
//! `Response` pair reused across every request the connection carries.
//!
//! A `Session` never touches its worker's epoll instance or session table
//! directly — each driving method returns an [`IoIntent`] describing what
//! the caller should do next (re-arm READ, re-arm WRITE, or tear the
//! connection down). This is the "callback inversion" fix from the design
//! notes: the source threads the event loop into every Session so handlers
//! can re-arm interest; here the worker reads the intent back out instead
//! of Session holding a pointer into the loop that owns it.

use std::{
    os::fd::RawFd,
    panic::{self, AssertUnwindSafe},
    time::Instant,
};

use crate::{
    buffer::RingBuffer,
    config::ServerConfig,
    errors::ErrorKind,
    http::{
        request::{Parser, Request},
        response::Response,
        types::{Method, StatusCode, Version},
    },
    server::{io as sock, registry::EndpointRegistry},
};

/// What the owning worker should do with a session's socket after driving
/// it one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IoIntent {
    /// Re-arm (or leave armed) `EPOLLIN` for this fd.
    WantRead,
    /// Re-arm (or leave armed) `EPOLLOUT` for this fd.
    WantWrite,
    /// The session closed its own socket; the worker should drop it from
    /// the session table and deregister it from epoll.
    Close,
    /// Nothing to do right now (e.g. the read drained without a complete
    /// request arriving; READ interest is already armed from accept time).
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Reading,
    ParsingAndDispatching,
    Writing,
    Closed,
}

enum Drain {
    Drained,
    Blocked,
    Errored,
}

pub(crate) struct Session {
    fd: RawFd,
    state: State,
    read_buf: RingBuffer,
    write_buf: RingBuffer,
    parser: Parser,
    request: Request,
    response: Response,
    /// Decision carried from a successful parse into the dispatch step;
    /// `Response::configure` needs both before the handler runs.
    pending_version: Version,
    pending_keep_alive: bool,
    /// Final keep-alive decision for the response just written, set once
    /// dispatch (or the error path) has run.
    keep_alive: bool,
    pub(crate) last_activity: Instant,
}

impl Session {
    pub(crate) fn new(fd: RawFd, config: &ServerConfig) -> Self {
        Self {
            fd,
            state: State::Idle,
            read_buf: RingBuffer::new(config.max_request_size),
            write_buf: RingBuffer::new(config.max_response_size),
            parser: Parser::new(config.max_request_size),
            request: Request::new(config),
            response: Response::new(config.max_response_size),
            pending_version: Version::Http11,
            pending_keep_alive: true,
            keep_alive: true,
            last_activity: Instant::now(),
        }
    }

    /// The live socket descriptor, or `None` once [`Session::close`] has
    /// run. The worker consults this before issuing `epoll_ctl(DEL)` so it
    /// never operates on a descriptor the kernel may already have recycled.
    #[inline]
    pub(crate) fn fd(&self) -> Option<RawFd> {
        (self.fd >= 0).then_some(self.fd)
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// Closes the socket exactly once. The descriptor is swapped for a
    /// sentinel (`-1`) before the syscall runs, so a second call — from a
    /// different code path that observed the same session before this one
    /// took effect — is a no-op rather than a double-close (S3).
    pub(crate) fn close(&mut self) {
        let fd = std::mem::replace(&mut self.fd, -1);
        if fd >= 0 {
            sock::close_fd(fd);
        }
        self.state = State::Closed;
    }

    /// Drives the session after a `READ`-readiness event: drains the
    /// socket into `read_buf` until `EAGAIN` (edge-triggered requires this),
    /// then runs the parse/dispatch/write state machine as far as it can
    /// go without blocking.
    pub(crate) fn on_read_ready(
        &mut self,
        config: &ServerConfig,
        registry: &EndpointRegistry,
    ) -> IoIntent {
        if self.state == State::Closed {
            return IoIntent::Close;
        }

        if self.fill_read_buf() == IoIntent::Close {
            return IoIntent::Close;
        }

        if self.state == State::Idle {
            self.state = State::Reading;
        }
        self.drive(config, registry)
    }

    /// Drives the session after a `WRITE`-readiness event.
    pub(crate) fn on_write_ready(
        &mut self,
        config: &ServerConfig,
        registry: &EndpointRegistry,
    ) -> IoIntent {
        if self.state == State::Closed {
            return IoIntent::Close;
        }
        self.drive(config, registry)
    }

    /// Reads until the socket would block, the peer closes, or an error
    /// occurs. Never advances the state machine itself — just fills
    /// `read_buf` as full as the kernel currently allows.
    fn fill_read_buf(&mut self) -> IoIntent {
        loop {
            if self.read_buf.is_full() {
                return IoIntent::None;
            }

            let view_len;
            let result = {
                let view = self.read_buf.write_view();
                view_len = view.len();
                sock::read_nonblocking(self.fd, view)
            };

            match result {
                Ok(0) => {
                    tracing::debug!(fd = self.fd, "peer closed the connection");
                    self.close();
                    return IoIntent::Close;
                }
                Ok(n) => {
                    self.read_buf.advance_write(n);
                    self.last_activity = Instant::now();
                    if n < view_len {
                        return IoIntent::None;
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return IoIntent::None,
                Err(err) => {
                    tracing::debug!(fd = self.fd, %err, "read failed, closing connection");
                    self.close();
                    return IoIntent::Close;
                }
            }
        }
    }

    /// Runs Reading → ParsingAndDispatching → Writing → (Reading | Idle |
    /// Closed) as far as it can without blocking on I/O, looping back into
    /// Reading on a pipelined keep-alive request per `onWriteComplete`.
    fn drive(&mut self, config: &ServerConfig, registry: &EndpointRegistry) -> IoIntent {
        loop {
            match self.state {
                State::Closed => return IoIntent::Close,
                State::Idle => return IoIntent::WantRead,
                State::Reading => match self.try_parse(config) {
                    Ok(outcome) => {
                        self.pending_version = outcome.version;
                        self.pending_keep_alive = outcome.keep_alive;
                        self.state = State::ParsingAndDispatching;
                    }
                    Err(ErrorKind::NeedMore) => {
                        self.state = State::Idle;
                        return IoIntent::WantRead;
                    }
                    Err(err) => {
                        tracing::info!(fd = self.fd, ?err, "rejecting malformed request");
                        self.write_protocol_error(config, &err);
                        self.keep_alive = false;
                        self.state = State::Writing;
                    }
                },
                State::ParsingAndDispatching => {
                    self.dispatch(config, registry);
                    if self.response.buffer().len() > config.max_response_size {
                        self.reject_oversized_response(config);
                    }
                    self.write_buf.clear();
                    self.write_buf.write(self.response.buffer());
                    self.last_activity = Instant::now();
                    self.state = State::Writing;
                }
                State::Writing => match self.drain_write() {
                    Drain::Blocked => return IoIntent::WantWrite,
                    Drain::Errored => {
                        tracing::debug!(fd = self.fd, "write failed, closing connection");
                        self.close();
                        return IoIntent::Close;
                    }
                    Drain::Drained => {
                        self.request.clear();
                        self.write_buf.clear();
                        if self.keep_alive && !self.read_buf.is_empty() {
                            self.state = State::Reading;
                        } else if self.keep_alive {
                            self.state = State::Idle;
                            return IoIntent::WantRead;
                        } else {
                            self.close();
                            return IoIntent::Close;
                        }
                    }
                },
            }
        }
    }

    /// Snapshots `read_buf`'s unconsumed bytes into the scratch parser and
    /// attempts one request. On success, drains the consumed bytes off
    /// `read_buf`; on failure (including `NeedMore`), `read_buf` is left
    /// untouched so the next attempt sees the same bytes plus whatever
    /// arrives after.
    fn try_parse(
        &mut self,
        config: &ServerConfig,
    ) -> Result<crate::http::request::ParseOutcome, ErrorKind> {
        self.parser.refill(&self.read_buf);
        let result = self.request.parse(&mut self.parser, config);
        if result.is_ok() {
            self.read_buf.advance_read(self.parser.position());
        }
        result
    }

    /// Builds a best-effort error response directly from `err`, bypassing
    /// the `Response` builder (there is no well-formed request to hang a
    /// fluent call chain off of for most of these failures).
    fn write_protocol_error(&mut self, config: &ServerConfig, err: &ErrorKind) {
        let bytes = err.as_http(self.request.version(), config.json_errors);
        self.write_buf.clear();
        self.write_buf.write(bytes);
    }

    /// Looks up and invokes the registered handler, falling back to a 405
    /// for an unrecognized method token, a 404 when no route matches, and a
    /// 500 when the handler panics.
    fn dispatch(&mut self, config: &ServerConfig, registry: &EndpointRegistry) {
        self.response.reset(config.max_response_size);
        self.response
            .configure(self.pending_version, self.pending_keep_alive);

        let method = self.request.method();
        let path = self.request.url().path();
        let handler = (method != Method::Unknown)
            .then(|| registry.lookup(path, method.as_str()))
            .flatten();

        let outcome = match handler {
            Some(handler) => {
                let request = &self.request;
                let response = &mut self.response;
                panic::catch_unwind(AssertUnwindSafe(|| handler.handle(request, response)))
            }
            None if method == Method::Unknown => Ok(self
                .response
                .status(StatusCode::MethodNotAllowed)
                .body("Method not allowed.")),
            None => Ok(self
                .response
                .status(StatusCode::NotFound)
                .body("Endpoint not found.")),
        };

        match outcome {
            Ok(_handled) => {
                self.keep_alive = self.pending_keep_alive;
            }
            Err(payload) => {
                let message = panic_message(&payload);
                tracing::warn!(fd = self.fd, %message, "handler panicked");
                self.response.reset(config.max_response_size);
                self.response.configure(self.pending_version, false);
                self.response
                    .status(StatusCode::InternalServerError)
                    .body(message);
                self.keep_alive = false;
            }
        }
    }

    /// A handler response that doesn't fit in `write_buf`'s fixed
    /// `max_response_size` capacity would otherwise be silently truncated
    /// by the `RingBuffer::write` call in `drive` — draining fewer bytes
    /// than the `Content-Length` header it already serialized, and
    /// desynchronizing any pipelined request that follows on a keep-alive
    /// connection. Replace it with a 500 that is guaranteed to fit instead.
    fn reject_oversized_response(&mut self, config: &ServerConfig) {
        tracing::warn!(
            fd = self.fd,
            len = self.response.buffer().len(),
            limit = config.max_response_size,
            "handler response exceeds max_response_size, rejecting"
        );
        self.response.reset(config.max_response_size);
        self.response.configure(self.pending_version, false);
        self.response
            .status(StatusCode::InternalServerError)
            .body("Response too large.");
        self.keep_alive = false;
    }

    /// Sends from `write_buf`'s read-view until it drains, the socket would
    /// block, or an unrecoverable error occurs. Loops across the ring
    /// buffer's wrap point, draining fully per readiness event as ET
    /// requires.
    fn drain_write(&mut self) -> Drain {
        loop {
            if self.write_buf.is_empty() {
                return Drain::Drained;
            }

            let result = {
                let view = self.write_buf.read_view();
                sock::write_nonblocking(self.fd, view)
            };

            match result {
                Ok(0) => return Drain::Blocked,
                Ok(n) => self.write_buf.advance_read(n),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return Drain::Blocked,
                Err(_) => return Drain::Errored,
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "internal server error".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::types::StatusCode;
    use crate::server::registry::EndpointRegistryBuilder;

    /// A connected, non-blocking Unix socket pair: `server_fd` is handed to
    /// the `Session` under test, `client_fd` plays the peer.
    fn socket_pair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(ret, 0);
        for fd in fds {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        }
        (fds[0], fds[1])
    }

    fn send_all(fd: RawFd, data: &[u8]) {
        let mut sent = 0;
        while sent < data.len() {
            match sock::write_nonblocking(fd, &data[sent..]) {
                Ok(n) => sent += n,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(err) => panic!("send failed: {err}"),
            }
        }
    }

    fn recv_available(fd: RawFd) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match sock::read_nonblocking(fd, &mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(_) => break,
            }
        }
        out
    }

    fn ok_handler(_: &Request, resp: &mut Response) -> crate::http::response::Handled {
        resp.status(StatusCode::Ok).body("ok")
    }

    fn panicking_handler(_: &Request, _: &mut Response) -> crate::http::response::Handled {
        panic!("handler blew up")
    }

    #[test]
    fn close_is_idempotent() {
        let (server_fd, client_fd) = socket_pair();
        let config = ServerConfig::default();
        let mut session = Session::new(server_fd, &config);

        session.close();
        assert!(session.is_closed());
        assert!(session.fd().is_none());

        // A second close must not touch the fd again (no double-close).
        session.close();
        assert!(session.is_closed());

        sock::close_fd(client_fd);
    }

    #[test]
    fn full_request_produces_a_response_and_keeps_the_connection_open() {
        let (server_fd, client_fd) = socket_pair();
        let config = ServerConfig::default();
        let mut session = Session::new(server_fd, &config);

        let mut builder = EndpointRegistryBuilder::new();
        builder.register("/hello", "GET", ok_handler).unwrap();
        let registry = builder.build();

        send_all(
            client_fd,
            b"GET /hello HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n",
        );

        let intent = session.on_read_ready(&config, &registry);
        assert_eq!(intent, IoIntent::WantRead);
        assert!(!session.is_closed());

        let response = recv_available(client_fd);
        let text = std::str::from_utf8(&response).unwrap();
        assert!(text.starts_with("HTTP/1.1 200"));
        assert!(text.ends_with("ok"));

        session.close();
        sock::close_fd(client_fd);
    }

    /// S1 (spec.md §8): "after N pipelined requests on one connection with
    /// Connection: keep-alive, exactly N responses are produced in order
    /// and the connection remains open." All N requests arrive in a single
    /// write, ahead of any readiness event for them individually — per I4,
    /// `drive`'s `State::Reading` re-entry (session.rs:238-239) must parse
    /// and answer each one without waiting for a fresh READ event.
    #[test]
    fn pipelined_keep_alive_requests_all_get_answered_in_order() {
        let (server_fd, client_fd) = socket_pair();
        let config = ServerConfig::default();
        let mut session = Session::new(server_fd, &config);

        let mut builder = EndpointRegistryBuilder::new();
        builder
            .register(
                "/one",
                "GET",
                |_: &Request, resp: &mut Response| resp.status(StatusCode::Ok).body("one"),
            )
            .unwrap();
        builder
            .register(
                "/two",
                "GET",
                |_: &Request, resp: &mut Response| resp.status(StatusCode::Ok).body("two"),
            )
            .unwrap();
        builder
            .register(
                "/three",
                "GET",
                |_: &Request, resp: &mut Response| resp.status(StatusCode::Ok).body("three"),
            )
            .unwrap();
        let registry = builder.build();

        let pipelined = [
            "GET /one HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n",
            "GET /two HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n",
            "GET /three HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n",
        ]
        .concat();
        send_all(client_fd, pipelined.as_bytes());

        let intent = session.on_read_ready(&config, &registry);
        assert_eq!(intent, IoIntent::WantRead);
        assert!(!session.is_closed());

        let response = recv_available(client_fd);
        let text = std::str::from_utf8(&response).unwrap();
        let bodies: Vec<&str> = text
            .split("HTTP/1.1 200")
            .skip(1)
            .map(|chunk| chunk.rsplit("\r\n\r\n").next().unwrap())
            .collect();
        assert_eq!(bodies, vec!["one", "two", "three"]);

        session.close();
        sock::close_fd(client_fd);
    }

    #[test]
    fn handler_panic_yields_500_and_closes_the_connection() {
        let (server_fd, client_fd) = socket_pair();
        let config = ServerConfig::default();
        let mut session = Session::new(server_fd, &config);

        let mut builder = EndpointRegistryBuilder::new();
        builder.register("/boom", "GET", panicking_handler).unwrap();
        let registry = builder.build();

        send_all(client_fd, b"GET /boom HTTP/1.1\r\nHost: x\r\n\r\n");

        let intent = session.on_read_ready(&config, &registry);
        assert_eq!(intent, IoIntent::Close);
        assert!(session.is_closed());

        let response = recv_available(client_fd);
        let text = std::str::from_utf8(&response).unwrap();
        assert!(text.starts_with("HTTP/1.1 500"));
        assert!(text.contains("handler blew up"));

        sock::close_fd(client_fd);
    }

    #[test]
    fn oversized_response_is_replaced_with_500_instead_of_truncated() {
        let (server_fd, client_fd) = socket_pair();
        let config = ServerConfig {
            max_response_size: 64,
            ..ServerConfig::default()
        };
        let mut session = Session::new(server_fd, &config);

        let mut builder = EndpointRegistryBuilder::new();
        builder
            .register(
                "/huge",
                "GET",
                |_: &Request, resp: &mut Response| {
                    resp.status(StatusCode::Ok).body("x".repeat(500))
                },
            )
            .unwrap();
        let registry = builder.build();

        send_all(
            client_fd,
            b"GET /huge HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n",
        );

        let intent = session.on_read_ready(&config, &registry);
        assert_eq!(intent, IoIntent::Close);
        assert!(session.is_closed());

        let response = recv_available(client_fd);
        let text = std::str::from_utf8(&response).unwrap();
        assert!(text.starts_with("HTTP/1.1 500"));
        assert!(text.contains("Response too large."));
        // The declared Content-Length must match what was actually sent,
        // not be left over from a truncated oversized body.
        let declared_len: usize = text
            .lines()
            .find_map(|line| line.to_ascii_lowercase().starts_with("content-length:").then(|| {
                line.split(':').nth(1).unwrap().trim().parse().unwrap()
            }))
            .unwrap();
        let body = text.rsplit("\r\n\r\n").next().unwrap();
        assert_eq!(declared_len, body.len());

        sock::close_fd(client_fd);
    }

    #[test]
    fn unknown_route_yields_404() {
        let (server_fd, client_fd) = socket_pair();
        let config = ServerConfig::default();
        let mut session = Session::new(server_fd, &config);
        let registry = EndpointRegistryBuilder::new().build();

        send_all(
            client_fd,
            b"GET /missing HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
        );

        let intent = session.on_read_ready(&config, &registry);
        assert_eq!(intent, IoIntent::Close);

        let response = recv_available(client_fd);
        assert!(std::str::from_utf8(&response).unwrap().starts_with("HTTP/1.1 404"));

        sock::close_fd(client_fd);
    }

    #[test]
    fn unrecognized_method_yields_405() {
        let (server_fd, client_fd) = socket_pair();
        let config = ServerConfig::default();
        let mut session = Session::new(server_fd, &config);

        let mut builder = EndpointRegistryBuilder::new();
        builder.register("/hello", "GET", ok_handler).unwrap();
        let registry = builder.build();

        send_all(
            client_fd,
            b"PROPFIND /hello HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
        );

        let intent = session.on_read_ready(&config, &registry);
        assert_eq!(intent, IoIntent::Close);

        let response = recv_available(client_fd);
        assert!(std::str::from_utf8(&response).unwrap().starts_with("HTTP/1.1 405"));

        sock::close_fd(client_fd);
    }
}
