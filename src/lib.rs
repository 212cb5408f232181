//! reactorweb - sharded, readiness-driven HTTP/1.1 server for microservices
//!
//! A synchronous, multi-threaded HTTP server built directly on Linux
//! `epoll`. Each worker is an OS thread pinned to one CPU core, running its
//! own edge-triggered reactor over its own `SO_REUSEPORT` listening socket
//! and its own connection table — there is no async runtime and no
//! cross-thread handoff on the request path.
//!
//! # Protocol Support
//!
//! - **HTTP/1.1**: persistent connections, pipelined keep-alive requests.
//! - **HTTP/1.0**: basic protocol support for legacy clients.
//!
//! # Features
//!
//! ## Performance & Memory
//! - **Per-core pinned workers** - no async runtime, no task scheduler
//!   overhead; the kernel's readiness notifications are the scheduler.
//! - **Pre-allocated per-connection buffers** - fixed-capacity ring buffers
//!   sized once from [`ServerConfig`], reused across every request a
//!   connection carries.
//!
//! ## Production Ready
//! - **Fully configurable limits and timeouts** via [`ServerConfig`].
//! - **Idle connection reaping** - connections with no activity past
//!   `connection_timeout_ms` are closed automatically.
//! - **Graceful shutdown** - `SIGINT`/`SIGTERM` drain in-flight connections
//!   before every worker exits.
//! - **Custom error format** - structured JSON or a plain HTTP response,
//!   controlled by [`ServerConfig::json_errors`].
//!
//! # Quick Start
//!
//! ```no_run
//! use reactorweb::{Server, Request, Response, Handled, StatusCode};
//!
//! fn main() {
//!     Server::builder()
//!         .port(8080)
//!         .get("/", |_: &Request, resp: &mut Response| -> Handled {
//!             resp.status(StatusCode::Ok).body("Hello, world!")
//!         })
//!         .unwrap()
//!         .build()
//!         .launch()
//!         .unwrap();
//! }
//! ```
//!
//! For more examples, see the
//! [`demos/`](https://github.com/AmakeSashaDev/reactorweb/tree/main/demos)
//! directory.
//!
//! # Use Cases
//!
//! - **High-throughput microservices** - configurable for specific workloads.
//! - **Resource-constrained environments** - predictable, bounded memory use.
//! - **Internal APIs** - security-conscious defaults.
pub(crate) mod http {
    pub mod query;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod server {
    pub(crate) mod io;
    pub(crate) mod reactor;
    pub(crate) mod registry;
    pub(crate) mod server_impl;
    pub(crate) mod session;
}
pub mod config;
pub(crate) mod buffer;
pub(crate) mod errors;
pub(crate) mod url;

pub use crate::{
    config::{ParseLimits, ServerConfig},
    errors::ServerError,
    http::{
        query,
        request::Request,
        response::{
            write::{BodyWriter, WriteBuffer},
            Handled, Response,
        },
        types::{Method, StatusCode, Url, Version},
    },
    server::{
        registry::Handler,
        server_impl::{Server, ServerBuilder},
    },
};

#[doc(hidden)]
pub fn run_test<F: FnOnce(&Request, &mut Response) -> Handled>(f: F) {
    let config = ServerConfig::default();
    f(&Request::new(&config), &mut Response::new(config.max_response_size));
}

#[doc(hidden)]
#[macro_export]
macro_rules! impt_default_handler {
    ($name:ident) => {
        use reactorweb::{Handled, Handler, Request, Response, StatusCode};
        struct $name;

        impl Handler for $name {
            fn handle(&self, _: &Request, resp: &mut Response) -> Handled {
                resp.status(StatusCode::Ok).body("Hello world!")
            }
        }
    };
}

#[doc(hidden)]
#[cfg(test)]
pub(crate) mod tools {
    use std::str::from_utf8;

    #[inline]
    pub(crate) fn str(value: Option<&[u8]>) -> Option<&str> {
        Some(from_utf8(value?).unwrap())
    }

    #[inline]
    pub(crate) fn str_op(value: &[u8]) -> &str {
        from_utf8(value).unwrap()
    }

    #[inline]
    pub(crate) fn str_2<'a>(value: (&'a [u8], &'a [u8])) -> (&'a str, &'a str) {
        (from_utf8(value.0).unwrap(), from_utf8(value.1).unwrap())
    }
}
