//! Immutable-after-startup mapping from `"{path}:{METHOD}"` to a handler.

use crate::{
    errors::ServerError,
    http::{
        request::Request,
        response::{Handled, Response},
    },
};
use std::collections::HashMap;

/// Handles one HTTP request and produces a response.
///
/// Dispatch happens inline, on the worker thread that owns the connection,
/// as one step of driving its [`crate::server::session::Session`] state
/// machine — there is no per-request task to suspend into, so `handle` is a
/// plain synchronous call rather than `async fn`. A handler that blocks or
/// loops forever blocks every other connection on that worker; handlers
/// must be cooperative.
///
/// # Examples
/// ```
/// use reactorweb::{Handler, Request, Response, Handled, StatusCode};
///
/// struct Echo;
///
/// impl Handler for Echo {
///     fn handle(&self, req: &Request, resp: &mut Response) -> Handled {
///         resp.status(StatusCode::Ok).body(req.body())
///     }
/// }
/// ```
/// Plain closures implement [`Handler`] too:
/// ```
/// use reactorweb::{Request, Response, Handled, StatusCode};
///
/// let hello = |_: &Request, resp: &mut Response| -> Handled {
///     resp.status(StatusCode::Ok).body("Hello, world!")
/// };
/// ```
pub trait Handler: Send + Sync + 'static {
    /// Processes an HTTP request and generates a response.
    ///
    /// # Errors
    ///
    /// A handler can't return an error: set an appropriate status code on
    /// `response` instead. Panicking inside `handle` is caught by the
    /// session and turned into a `500` response with the connection closed
    /// afterward; it does not take down the worker.
    fn handle(&self, request: &Request, response: &mut Response) -> Handled;
}

impl<F> Handler for F
where
    F: Fn(&Request, &mut Response) -> Handled + Send + Sync + 'static,
{
    #[inline]
    fn handle(&self, request: &Request, response: &mut Response) -> Handled {
        self(request, response)
    }
}

/// Maps `"{path}:{METHOD}"` to a registered [`Handler`].
///
/// Populated only through [`EndpointRegistryBuilder`], before any worker
/// starts; read-only and shared across every worker thread afterward via
/// `Arc`.
pub(crate) struct EndpointRegistry {
    routes: HashMap<String, Box<dyn Handler>>,
}

impl EndpointRegistry {
    /// O(1) average lookup by exact path and method. Returns `None` both for
    /// an unregistered path and for a registered path requested with the
    /// wrong method — the registry does not distinguish the two, matching
    /// its single combined-key contract.
    pub(crate) fn lookup(&self, path: &[u8], method: &str) -> Option<&dyn Handler> {
        let path = std::str::from_utf8(path).ok()?;
        self.routes.get(&route_key(path, method)).map(Box::as_ref)
    }
}

/// Builder for an [`EndpointRegistry`]: every route must be registered
/// before [`EndpointRegistryBuilder::build`] is called, since the resulting
/// registry is immutable for the life of the server.
pub(crate) struct EndpointRegistryBuilder {
    routes: HashMap<String, Box<dyn Handler>>,
}

impl EndpointRegistryBuilder {
    pub(crate) fn new() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }

    /// Registers `handler` for `path`/`method`. Fails with
    /// [`ServerError::ConfigError`] if that exact pair was already
    /// registered.
    pub(crate) fn register(
        &mut self,
        path: &str,
        method: &str,
        handler: impl Handler,
    ) -> Result<(), ServerError> {
        let key = route_key(path, method);
        if self.routes.contains_key(&key) {
            return Err(ServerError::ConfigError(format!(
                "duplicate route registered for {key}"
            )));
        }

        self.routes.insert(key, Box::new(handler));
        Ok(())
    }

    pub(crate) fn build(self) -> EndpointRegistry {
        EndpointRegistry {
            routes: self.routes,
        }
    }
}

#[inline]
fn route_key(path: &str, method: &str) -> String {
    format!("{path}:{method}")
}
