//! Middleware layer.
//!
//! Middleware wraps the handler and is the place for cross-cutting concerns:
//! tracing, request-id injection, authentication-header inspection.
//!
//! A middleware receives the request and a [`Next`] handle. It may
//!
//! - inspect or modify the request, then forward it with `next.run(req)`;
//! - short-circuit by returning its own response without calling `next`;
//! - post-process the response `next.run` returns.
//!
//! ```rust
//! use weft::middleware::Next;
//! use weft::{HandlerError, Request, Response, Router, Status};
//!
//! async fn require_token(req: Request, next: Next) -> Result<Response, HandlerError> {
//!     if req.header("authorization").is_none() {
//!         return Ok(Response::status(Status::UNAUTHORIZED));
//!     }
//!     let mut res = next.run(req).await?;
//!     res.set_header("x-authenticated", "1");
//!     Ok(res)
//! }
//!
//! let app = Router::new().layer(require_token);
//! ```
//!
//! Global layers ([`Router::layer`](crate::Router::layer)) run in
//! registration order around every request that parsed, including 404 and
//! 405 outcomes. Group layers ([`Router::group`](crate::Router::group)) run
//! inside the global ones and only for that group's routes.

mod trace;

use std::future::Future;
use std::sync::Arc;

pub use trace::Trace;

use crate::error::HandlerError;
use crate::handler::{BoxFuture, BoxedHandler};
use crate::pipeline::{Stage, StageCell};
use crate::request::Request;
use crate::response::Response;
use crate::trie::Params;

/// A request/response wrapper. Implemented for every
/// `Fn(Request, Next) -> impl Future<Output = Result<Response, HandlerError>>`.
pub trait Middleware: Send + Sync + 'static {
    fn call(&self, req: Request, next: Next) -> BoxFuture<Result<Response, HandlerError>>;
}

pub(crate) type BoxedMiddleware = Arc<dyn Middleware>;

impl<F, Fut> Middleware for F
where
    F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, HandlerError>> + Send + 'static,
{
    fn call(&self, req: Request, next: Next) -> BoxFuture<Result<Response, HandlerError>> {
        Box::pin(self(req, next))
    }
}

/// What sits at the end of the chain.
pub(crate) enum Target {
    Route { handler: BoxedHandler, params: Params },
    /// Routing already decided the answer (404, 405).
    Reject(Response),
}

/// The rest of the chain: remaining middleware, then the handler.
pub struct Next {
    global: Arc<[BoxedMiddleware]>,
    local: Arc<[BoxedMiddleware]>,
    index: usize,
    target: Target,
    stage: StageCell,
}

impl Next {
    pub(crate) fn new(
        global: Arc<[BoxedMiddleware]>,
        local: Arc<[BoxedMiddleware]>,
        target: Target,
        stage: StageCell,
    ) -> Self {
        Self { global, local, index: 0, target, stage }
    }

    /// Runs the remaining middleware and the handler.
    pub async fn run(mut self, req: Request) -> Result<Response, HandlerError> {
        let layer = match self.index.checked_sub(self.global.len()) {
            None => self.global.get(self.index),
            Some(i) => self.local.get(i),
        }
        .cloned();

        if let Some(layer) = layer {
            self.index += 1;
            return layer.call(req, self).await;
        }

        self.stage.set(Stage::Handling);
        let out = match self.target {
            Target::Route { handler, params } => handler.call(req, params).await,
            Target::Reject(res) => Ok(res),
        };
        // a failed handler goes straight to serializing
        if out.is_ok() {
            self.stage.set(Stage::PostMiddleware);
        }
        out
    }
}
