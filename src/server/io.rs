//! Low-level, raw-`libc` socket and epoll plumbing shared by every worker.
//!
//! Kept separate from [`crate::server::reactor`] so the reactor's dispatch
//! logic reads as pure state-machine bookkeeping: every raw syscall lives
//! here, behind a thin API that maps the two cases the reactor actually
//! cares about (made progress / would block) onto `Ok`/`Err(WouldBlock)`
//! rather than the source's pair of errno checks. Resolves the `redesign
//! flag about EAGAIN && EWOULDBLOCK (should be ||)` by construction: the
//! only question a caller can ask here is "did this block", not "which of
//! two codes means blocked".

use std::{
    io,
    net::SocketAddr,
    os::fd::{IntoRawFd, RawFd},
};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

/// Epoll token reserved for a worker's own listening socket.
pub(crate) const LISTENER_TOKEN: u64 = u64::MAX;
/// Epoll token reserved for a worker's wakeup eventfd.
pub(crate) const WAKE_TOKEN: u64 = u64::MAX - 1;

pub(crate) const READ_INTEREST: u32 = libc::EPOLLIN as u32;
pub(crate) const WRITE_INTEREST: u32 = libc::EPOLLOUT as u32;
const ERROR_EVENTS: u32 = (libc::EPOLLERR | libc::EPOLLHUP) as u32;

/// Thin wrapper around one `epoll` instance. Always arms interests
/// edge-triggered (`EPOLLET`); see 4.F of the design: "edge-triggered
/// readiness is mandatory".
pub(crate) struct Epoll {
    fd: RawFd,
}

impl Epoll {
    pub(crate) fn new() -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    pub(crate) fn add(&self, fd: RawFd, token: u64, interests: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interests)
    }

    pub(crate) fn modify(&self, fd: RawFd, token: u64, interests: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interests)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: u64, interests: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests | libc::EPOLLET as u32,
            u64: token,
        };
        let ret = unsafe { libc::epoll_ctl(self.fd, op, fd, &mut event) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Removes `fd` from the set. Tolerates `ENOENT` (the fd was already
    /// dropped from the set, e.g. the kernel did it on close) so callers
    /// don't need to special-case double-deletion during shutdown.
    pub(crate) fn delete(&self, fd: RawFd) -> io::Result<()> {
        let ret = unsafe {
            libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOENT) {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    /// Blocks up to `timeout_ms` (negative means forever) for readiness.
    /// `EINTR` is folded into `Ok(0)`, matching the worker's "nothing to do
    /// this wake, loop again" handling.
    pub(crate) fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: i32) -> io::Result<usize> {
        let ret = unsafe {
            libc::epoll_wait(self.fd, events.as_mut_ptr(), events.len() as i32, timeout_ms)
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(ret as usize)
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[inline]
pub(crate) fn is_error_event(events: u32) -> bool {
    events & ERROR_EVENTS != 0
}

/// Binds a `SO_REUSEADDR` + `SO_REUSEPORT` non-blocking listening socket.
/// Every worker calls this independently on the same `(ip, port)`; the
/// kernel load-balances accepted connections across the resulting sockets
/// (see 4.G, preferred model).
pub(crate) fn create_listener(ip: &str, port: u16, backlog: i32) -> io::Result<RawFd> {
    let addr: SocketAddr = format!("{ip}:{port}")
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid bind address"))?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(backlog)?;
    Ok(socket.into_raw_fd())
}

/// Accepts at most one pending connection, non-blocking. `Ok(None)` means
/// the accept queue is drained (`EAGAIN`); callers loop on this until it
/// returns `None` or an error, per 4.F step 3a.
pub(crate) fn accept_nonblocking(listener_fd: RawFd) -> io::Result<Option<RawFd>> {
    let fd = unsafe {
        libc::accept4(
            listener_fd,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            libc::SOCK_NONBLOCK,
        )
    };
    if fd >= 0 {
        return Ok(Some(fd));
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock {
        return Ok(None);
    }
    Err(err)
}

/// Sets `TCP_NODELAY` on a freshly accepted connection.
pub(crate) fn set_tcp_nodelay(fd: RawFd) -> io::Result<()> {
    let enable: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &enable as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Reads into `buf`. `Ok(0)` means the peer half-closed the connection
/// (the session's `recv == 0 ⇒ Closed` case); `Err` with
/// `ErrorKind::WouldBlock` means "no data right now, re-arm READ".
pub(crate) fn read_nonblocking(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    let ret = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if ret >= 0 {
        return Ok(ret as usize);
    }
    Err(io::Error::last_os_error())
}

/// Writes from `buf`. `Err` with `ErrorKind::WouldBlock` means "the kernel
/// send buffer is full, re-arm WRITE and retry on the next readiness
/// event" — never a hard failure.
pub(crate) fn write_nonblocking(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    let ret = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if ret >= 0 {
        return Ok(ret as usize);
    }
    Err(io::Error::last_os_error())
}

pub(crate) fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Creates a non-blocking `eventfd` used as a worker's wakeup counter:
/// the shutdown path writes to it to break the owning worker out of
/// `epoll_wait` (see 4.F, "Shutdown").
pub(crate) fn create_wakeup() -> io::Result<RawFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// Increments a wakeup eventfd, unblocking any `epoll_wait` on it.
pub(crate) fn notify_wakeup(fd: RawFd) {
    let one: u64 = 1;
    unsafe {
        libc::write(fd, &one as *const u64 as *const libc::c_void, 8);
    }
}

/// Drains a wakeup eventfd's counter back to zero.
pub(crate) fn drain_wakeup(fd: RawFd) {
    let mut buf = [0u8; 8];
    loop {
        let ret = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, 8) };
        if ret <= 0 {
            break;
        }
    }
}

/// Raises `RLIMIT_NOFILE` to its hard ceiling, best-effort. A server
/// sharded across many workers, each holding its own session table, can
/// exhaust the default soft limit (`1024` on most distributions) well
/// before it exhausts memory.
pub(crate) fn raise_nofile_limit() {
    unsafe {
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) != 0 {
            return;
        }
        limit.rlim_cur = limit.rlim_max;
        if libc::setrlimit(libc::RLIMIT_NOFILE, &limit) != 0 {
            tracing::debug!("failed to raise RLIMIT_NOFILE: {}", io::Error::last_os_error());
        }
    }
}
