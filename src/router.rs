//! Route registration.
//!
//! The [`Router`] is a builder: routes, middleware and the error hook are
//! registered at startup, then the whole thing is frozen into an
//! [`App`](crate::App) when the server starts. Nothing is looked up in a
//! global registry.

use std::sync::Arc;

use crate::error::HandlerError;
use crate::handler::{BoxedHandler, Handler};
use crate::method::Method;
use crate::middleware::{BoxedMiddleware, Middleware};
use crate::pipeline::{Endpoint, ErrorHook};
use crate::trie::{RouteError, RouteTable};

/// The application router.
///
/// Each registration returns `self` so calls chain naturally:
///
/// ```rust
/// # use weft::{HandlerError, Method, Params, Request, Router, Status};
/// # async fn get_user(_: Request, _: Params) -> Status { Status::OK }
/// # async fn create_user(_: Request, _: Params) -> Status { Status::CREATED }
/// # async fn delete_user(_: Request, _: Params) -> Status { Status::NO_CONTENT }
/// Router::new()
///     .on(Method::Delete, "/users/{id}", delete_user)
///     .get("/users/{id}", get_user)
///     .post("/users", create_user);
/// ```
///
/// Path parameters use `{name}` syntax. A literal segment is preferred over
/// a parameter at the same position, whatever the registration order.
pub struct Router {
    table: RouteTable<Endpoint>,
    layers: Vec<BoxedMiddleware>,
    on_error: Option<ErrorHook>,
}

impl Router {
    pub fn new() -> Self {
        Self { table: RouteTable::new(), layers: Vec::new(), on_error: None }
    }

    /// Registers a handler for a method name and pattern.
    ///
    /// The fallible form of [`Router::on`], for routes that come from
    /// configuration rather than code.
    pub fn register(
        &mut self,
        method: &str,
        pattern: &str,
        handler: impl Handler,
    ) -> Result<&mut Self, RouteError> {
        let method: Method = method.parse()?;
        self.insert(method, pattern, handler.into_boxed_handler(), no_layers())?;
        Ok(self)
    }

    /// Registers a handler for a method and pattern.
    ///
    /// # Panics
    ///
    /// Panics if `pattern` is not a valid route pattern.
    pub fn on(mut self, method: Method, pattern: &str, handler: impl Handler) -> Self {
        self.insert(method, pattern, handler.into_boxed_handler(), no_layers())
            .unwrap_or_else(|e| panic!("invalid route `{pattern}`: {e}"));
        self
    }

    pub fn get(self, pattern: &str, handler: impl Handler) -> Self {
        self.on(Method::Get, pattern, handler)
    }

    pub fn post(self, pattern: &str, handler: impl Handler) -> Self {
        self.on(Method::Post, pattern, handler)
    }

    pub fn put(self, pattern: &str, handler: impl Handler) -> Self {
        self.on(Method::Put, pattern, handler)
    }

    pub fn delete(self, pattern: &str, handler: impl Handler) -> Self {
        self.on(Method::Delete, pattern, handler)
    }

    pub fn patch(self, pattern: &str, handler: impl Handler) -> Self {
        self.on(Method::Patch, pattern, handler)
    }

    /// Adds middleware around every request, including those answered 404
    /// or 405. Layers run in the order they were added.
    pub fn layer(mut self, middleware: impl Middleware) -> Self {
        self.layers.push(Arc::new(middleware));
        self
    }

    /// Registers routes under `prefix` with middleware of their own.
    ///
    /// ```rust
    /// # use weft::{middleware::Trace, Params, Request, Router};
    /// # async fn list(_: Request, _: Params) -> &'static str { "[]" }
    /// let app = Router::new().group("/admin", |g| g.layer(Trace).get("/users", list));
    /// ```
    ///
    /// # Panics
    ///
    /// Panics if a pattern in the group is invalid.
    pub fn group(mut self, prefix: &str, build: impl FnOnce(Group) -> Group) -> Self {
        let group = build(Group::new(prefix));
        let layers: Arc<[BoxedMiddleware]> = group.layers.into();
        for (method, pattern, handler) in group.routes {
            self.insert(method, &pattern, handler, Arc::clone(&layers))
                .unwrap_or_else(|e| panic!("invalid route `{pattern}`: {e}"));
        }
        self
    }

    /// Called with every error a handler or middleware returns, after it has
    /// been logged and before it is turned into a response.
    pub fn on_error(mut self, hook: impl Fn(&HandlerError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }

    /// Number of registered method and pattern pairs.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(
        &mut self,
        method: Method,
        pattern: &str,
        handler: BoxedHandler,
        layers: Arc<[BoxedMiddleware]>,
    ) -> Result<(), RouteError> {
        self.table.insert(method, pattern, Endpoint { handler, layers })
    }

    pub(crate) fn into_parts(self) -> (RouteTable<Endpoint>, Vec<BoxedMiddleware>, Option<ErrorHook>) {
        (self.table, self.layers, self.on_error)
    }
}

impl Default for Router {
    fn default() -> Self { Self::new() }
}

fn no_layers() -> Arc<[BoxedMiddleware]> {
    Arc::new([])
}

/// Routes sharing a path prefix and middleware. See [`Router::group`].
pub struct Group {
    prefix: String,
    layers: Vec<BoxedMiddleware>,
    routes: Vec<(Method, String, BoxedHandler)>,
}

impl Group {
    fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_owned(),
            layers: Vec::new(),
            routes: Vec::new(),
        }
    }

    /// Adds middleware to every route of the group, inside the global
    /// layers.
    pub fn layer(mut self, middleware: impl Middleware) -> Self {
        self.layers.push(Arc::new(middleware));
        self
    }

    pub fn on(mut self, method: Method, pattern: &str, handler: impl Handler) -> Self {
        let full = format!("{}{pattern}", self.prefix);
        self.routes.push((method, full, handler.into_boxed_handler()));
        self
    }

    pub fn get(self, pattern: &str, handler: impl Handler) -> Self {
        self.on(Method::Get, pattern, handler)
    }

    pub fn post(self, pattern: &str, handler: impl Handler) -> Self {
        self.on(Method::Post, pattern, handler)
    }

    pub fn put(self, pattern: &str, handler: impl Handler) -> Self {
        self.on(Method::Put, pattern, handler)
    }

    pub fn delete(self, pattern: &str, handler: impl Handler) -> Self {
        self.on(Method::Delete, pattern, handler)
    }

    pub fn patch(self, pattern: &str, handler: impl Handler) -> Self {
        self.on(Method::Patch, pattern, handler)
    }
}
