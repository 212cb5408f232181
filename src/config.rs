//! Server configuration: connection admission, parsing limits and buffer
//! pre-allocation strategy.
//!
//! # Security-First Defaults
//!
//! Default limits are intentionally conservative to prevent:
//! - Resource exhaustion attacks
//! - Memory overflows
//! - Slowloris attacks
//! - Header flooding
//!
//! # Examples
//!
//! ```no_run
//! use reactorweb::config::{ParseLimits, ServerConfig};
//! use std::time::Duration;
//!
//! let config = ServerConfig {
//!     port: 8080,
//!     max_threads: 8,
//!     connection_timeout_ms: 5_000,
//!     parse_limits: ParseLimits {
//!         header_count: 32,
//!         ..ParseLimits::default()
//!     },
//!     ..ServerConfig::default()
//! };
//! ```

use std::time::Duration;

/// Top-level server configuration.
///
/// Maps directly onto the external configuration surface: bind address,
/// worker count, connection admission backlog, idle timeout, and the three
/// size ceilings that bound per-connection memory (`max_body_size`,
/// `max_request_size`, `max_response_size`).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `"0.0.0.0"`).
    pub ip: String,

    /// Bind port. There is no sensible default; [`ServerConfig::default`]
    /// uses `0`, which the OS interprets as "pick an ephemeral port" —
    /// callers building a real server should always set this explicitly.
    pub port: u16,

    /// Number of worker OS threads (default: `0`, meaning "clamp to
    /// the host's available parallelism" — see
    /// [`ServerConfig::resolved_thread_count`]).
    pub max_threads: u32,

    /// Backlog passed to `listen()` on each worker's (or the acceptor's)
    /// listening socket (default: `1024`).
    pub backlog_size: i32,

    /// Idle-reaper threshold: a connection with no activity for longer
    /// than this many milliseconds is closed (default: `120_000`, i.e.
    /// 2 minutes).
    pub connection_timeout_ms: u64,

    /// Hard limit on a request's `Content-Length` (default: `4 KiB`).
    /// Requests whose declared body size exceeds this are rejected
    /// without allocating a body buffer.
    pub max_body_size: u64,

    /// Capacity of each session's read [`crate::buffer::RingBuffer`]
    /// (default: `16 KiB`). Bounds the request line, headers, and body
    /// together; a request that does not fit triggers a `414`/`431`/`413`
    /// response appropriate to the component that overflowed.
    pub max_request_size: usize,

    /// Capacity of each session's write [`crate::buffer::RingBuffer`]
    /// (default: `16 KiB`). A response that does not fit is written in
    /// multiple write-readiness passes rather than truncated.
    pub max_response_size: usize,

    /// Fine-grained parser pre-allocation hints (see [`ParseLimits`]).
    pub parse_limits: ParseLimits,

    /// Whether error responses carry a small JSON body describing the
    /// failure, or an empty body (default: `true`).
    ///
    /// # Examples
    /// If `true`, then on error the server will return:
    /// ```text
    /// HTTP/1.1 400 Bad Request\r
    /// connection: close\r
    /// content-length: 55\r
    /// content-type: application/json\r
    /// \r
    /// {"error":"Invalid HTTP method","code":"INVALID_METHOD"}
    /// ```
    /// If `false`, then on error the server will return:
    /// ```text
    /// HTTP/1.1 400 Bad Request\r
    /// connection: close\r
    /// content-length: 0\r
    /// \r
    /// ```
    pub json_errors: bool,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ip: "0.0.0.0".to_owned(),
            port: 0,
            max_threads: 0,
            backlog_size: 1024,
            connection_timeout_ms: 120_000,
            max_body_size: 4 * 1024,
            max_request_size: 16 * 1024,
            max_response_size: 16 * 1024,
            parse_limits: ParseLimits::default(),
            json_errors: true,

            _priv: (),
        }
    }
}

impl ServerConfig {
    /// Idle-reaper threshold as a [`Duration`].
    #[inline(always)]
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Worker thread count, clamped to the host's available parallelism
    /// when `max_threads` is `0` or exceeds it.
    pub fn resolved_thread_count(&self) -> usize {
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        if self.max_threads == 0 {
            available
        } else {
            (self.max_threads as usize).min(available)
        }
    }
}

/// Parser pre-allocation hints: how many `Vec` slots to reserve up front
/// for path segments, query pairs, and headers.
///
/// Unlike `max_request_size`/`max_response_size`, these do not bound the
/// wire bytes a session will accept — that bound is the ring buffer
/// capacity. They only size the initial capacity of the `Vec`s the parser
/// fills in while walking the buffer, so a request with more segments,
/// query pairs, or headers than these hints still parses correctly; it
/// just costs a reallocation.
#[derive(Debug, Clone)]
pub struct ParseLimits {
    /// Expected number of path segments (default: `8`).
    pub url_parts: usize,
    /// Expected number of query parameters (default: `8`).
    pub url_query_parts: usize,
    /// Expected number of headers per request (default: `16`).
    ///
    /// This is a hint, not a hard cap: a fixed ceiling the parser enforces
    /// internally (`TooManyHeaders`) governs header-flooding protection
    /// separately, regardless of this hint's value.
    pub header_count: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            url_parts: 8,
            url_query_parts: 8,
            header_count: 16,

            _priv: (),
        }
    }
}

/// Hard ceiling on headers per request, enforced regardless of
/// [`ParseLimits::header_count`]. Prevents unbounded `Vec` growth from a
/// request that declares an enormous number of header lines.
pub(crate) const MAX_HEADER_COUNT: usize = 128;

/// Hard ceiling on query parameters per request, enforced regardless of
/// [`ParseLimits::url_query_parts`]. Prevents unbounded `Vec` growth from a
/// query string packed with parameters.
pub(crate) const MAX_QUERY_PARAM_COUNT: usize = 128;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolved_thread_count_clamps_to_available_parallelism_when_zero() {
        let config = ServerConfig {
            max_threads: 0,
            ..ServerConfig::default()
        };
        assert!(config.resolved_thread_count() >= 1);
    }

    #[test]
    fn resolved_thread_count_honors_explicit_value() {
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let config = ServerConfig {
            max_threads: 2,
            ..ServerConfig::default()
        };
        assert_eq!(config.resolved_thread_count(), 2.min(available));
    }

    #[test]
    fn resolved_thread_count_clamps_above_available_parallelism() {
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let config = ServerConfig {
            max_threads: available as u32 + 1_000,
            ..ServerConfig::default()
        };
        assert_eq!(config.resolved_thread_count(), available);
    }

    #[test]
    fn connection_timeout_converts_millis() {
        let config = ServerConfig {
            connection_timeout_ms: 2_500,
            ..ServerConfig::default()
        };
        assert_eq!(config.connection_timeout(), Duration::from_millis(2_500));
    }
}
