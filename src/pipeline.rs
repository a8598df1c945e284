//! Dispatch pipeline: routing, middleware, handler invocation, error
//! conversion.
//!
//! Every request cycle walks the same stages:
//!
//! ```text
//! Parsing → Routing → PreMiddleware → Handling → PostMiddleware → Serializing → Written
//!    │                      │             │
//!    └── invalid input ─────┴─ short-circuit / handler error / timeout ──▶ Serializing
//! ```
//!
//! The middleware chain and the handler run in a child task on the same
//! worker. A panic there becomes a [`HandlerError`] instead of tearing the
//! connection down, and dropping the pipeline (timeout, connection closed,
//! forced shutdown) aborts the child task.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, trace, warn};

use crate::config::Config;
use crate::conn::Connection;
use crate::error::HandlerError;
use crate::handler::BoxedHandler;
use crate::middleware::{BoxedMiddleware, Next, Target};
use crate::request::Request;
use crate::response::Response;
use crate::router::Router;
use crate::shutdown::Watch;
use crate::trie::{Resolution, RouteTable};
use crate::Status;

pub(crate) type ErrorHook = Arc<dyn Fn(&HandlerError) + Send + Sync>;

/// A route's handler together with the group middleware wrapping it.
#[derive(Clone)]
pub(crate) struct Endpoint {
    pub(crate) handler: BoxedHandler,
    pub(crate) layers: Arc<[BoxedMiddleware]>,
}

// ── Stage ─────────────────────────────────────────────────────────────────────

/// Where a request cycle currently is.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[repr(u8)]
pub(crate) enum Stage {
    Parsing,
    Routing,
    PreMiddleware,
    Handling,
    PostMiddleware,
    Serializing,
    Written,
}

impl Stage {
    const ORDER: [Stage; 7] = [
        Stage::Parsing,
        Stage::Routing,
        Stage::PreMiddleware,
        Stage::Handling,
        Stage::PostMiddleware,
        Stage::Serializing,
        Stage::Written,
    ];

    /// Steps forward one stage at a time; any stage before `Serializing` may
    /// jump to it; `Written` starts the next cycle on the connection.
    pub(crate) fn can_advance_to(self, next: Stage) -> bool {
        match (self, next) {
            (Stage::Written, Stage::Parsing) => true,
            (from, Stage::Serializing) => from < Stage::Serializing,
            (from, to) => to as u8 == from as u8 + 1,
        }
    }
}

/// Shared view of a cycle's stage. The connection task and the handler task
/// both advance it.
#[derive(Clone, Debug)]
pub(crate) struct StageCell(Arc<AtomicU8>);

impl StageCell {
    pub(crate) fn new() -> Self {
        Self(Arc::new(AtomicU8::new(Stage::Parsing as u8)))
    }

    pub(crate) fn get(&self) -> Stage {
        Stage::ORDER[usize::from(self.0.load(Ordering::Acquire))]
    }

    pub(crate) fn set(&self, next: Stage) {
        let from = self.get();
        if !from.can_advance_to(next) {
            // e.g. a middleware that calls `next.run` twice
            debug!(?from, to = ?next, "out-of-order request stage");
        }
        trace!(?from, to = ?next, "request stage");
        self.0.store(next as u8, Ordering::Release);
    }
}

// ── App ───────────────────────────────────────────────────────────────────────

/// A frozen [`Router`] plus the configuration it serves with.
///
/// [`Server`](crate::Server) builds one internally. Build it yourself to
/// serve a custom transport with [`App::serve_connection`], or to run
/// requests through routing and middleware without any I/O with
/// [`App::handle`].
pub struct App {
    routes: RouteTable<Endpoint>,
    layers: Arc<[BoxedMiddleware]>,
    no_layers: Arc<[BoxedMiddleware]>,
    on_error: Option<ErrorHook>,
    config: Config,
}

impl App {
    pub fn new(router: Router, config: Config) -> Self {
        let (routes, layers, on_error) = router.into_parts();
        Self {
            routes,
            layers: layers.into(),
            no_layers: Vec::new().into(),
            on_error,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs one request through routing, middleware and its handler.
    ///
    /// Must be called from within a tokio runtime: the handler runs in a
    /// spawned task.
    pub async fn handle(&self, req: Request) -> Response {
        self.dispatch(req, &StageCell::new()).await
    }

    /// Serves HTTP/1.1 on any byte stream until the peer closes it, the
    /// connection is no longer keep-alive, or an error ends it.
    pub async fn serve_connection<S>(self: Arc<Self>, io: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        Connection::new(io, self, Watch::detached(), None).serve().await;
    }

    pub(crate) async fn dispatch(&self, req: Request, stage: &StageCell) -> Response {
        stage.set(Stage::Routing);
        let method = req.method();
        let path = req.path().to_owned();

        let (local, target) = match self.routes.resolve(method, &path) {
            Resolution::Matched(hit) => (
                Arc::clone(&hit.value.layers),
                Target::Route { handler: Arc::clone(&hit.value.handler), params: hit.params },
            ),
            Resolution::MethodNotAllowed(allowed) => {
                let allow = allowed.iter().map(|m| m.as_str()).collect::<Vec<_>>().join(", ");
                let res = Response::builder()
                    .status(Status::METHOD_NOT_ALLOWED)
                    .header("allow", &allow)
                    .no_body();
                (Arc::clone(&self.no_layers), Target::Reject(res))
            }
            Resolution::NotFound => (
                Arc::clone(&self.no_layers),
                Target::Reject(Response::status(Status::NOT_FOUND)),
            ),
        };

        stage.set(Stage::PreMiddleware);
        let next = Next::new(Arc::clone(&self.layers), local, target, stage.clone());
        let chain = AbortOnDrop(tokio::spawn(next.run(req)));

        let result = match chain.await {
            Ok(result) => result,
            Err(join) => Err(HandlerError::from_join(join)),
        };
        match result {
            Ok(res) => res,
            Err(err) => {
                if err.status().is_server_error() {
                    error!(%method, %path, status = err.status().as_u16(), error = %err, "handler failed");
                } else {
                    warn!(%method, %path, status = err.status().as_u16(), error = %err, "handler rejected request");
                }
                if let Some(hook) = &self.on_error {
                    hook(&err);
                }
                err.to_response()
            }
        }
    }
}

/// Aborts the handler task if the pipeline is dropped before it finishes.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Future for AbortOnDrop<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::middleware::Next;
    use crate::parser::{Limits, ParseState, Parser};
    use crate::{Params, Router};

    fn request(raw: &str) -> Request {
        match Parser::new(Limits::default()).feed(raw.as_bytes()) {
            ParseState::Complete(req) => req,
            other => panic!("bad test request: {other:?}"),
        }
    }

    fn body(res: &Response) -> String {
        String::from_utf8_lossy(res.body().as_bytes().unwrap_or_default()).into_owned()
    }

    async fn hello(_req: Request, params: Params) -> Result<String, HandlerError> {
        Ok(format!("hi {}", params.require("name")?))
    }

    #[test]
    fn stage_transitions() {
        use Stage::*;
        assert!(Parsing.can_advance_to(Routing));
        assert!(Parsing.can_advance_to(Serializing));
        assert!(PreMiddleware.can_advance_to(Serializing));
        assert!(Handling.can_advance_to(Serializing));
        assert!(Serializing.can_advance_to(Written));
        assert!(Written.can_advance_to(Parsing));

        assert!(!Parsing.can_advance_to(Handling));
        assert!(!Handling.can_advance_to(Routing));
        assert!(!Handling.can_advance_to(Written));
        assert!(!Written.can_advance_to(Serializing));
    }

    #[tokio::test]
    async fn routes_and_reports_404_and_405() {
        let app = App::new(Router::new().get("/hello/{name}", hello), Config::default());

        let res = app.handle(request("GET /hello/world HTTP/1.1\r\n\r\n")).await;
        assert_eq!(res.status_code(), Status::OK);
        assert_eq!(body(&res), "hi world");

        let res = app.handle(request("POST /hello/world HTTP/1.1\r\n\r\n")).await;
        assert_eq!(res.status_code(), Status::METHOD_NOT_ALLOWED);
        assert_eq!(res.header("allow"), Some("GET, HEAD"));

        let res = app.handle(request("GET /unknown HTTP/1.1\r\n\r\n")).await;
        assert_eq!(res.status_code(), Status::NOT_FOUND);
    }

    #[tokio::test]
    async fn middleware_runs_in_order_around_the_handler() {
        let log = Arc::new(Mutex::new(Vec::new()));

        let outer_log = Arc::clone(&log);
        let outer = move |req: Request, next: Next| {
            let log = Arc::clone(&outer_log);
            async move {
                log.lock().unwrap().push("outer:pre");
                let res = next.run(req).await;
                log.lock().unwrap().push("outer:post");
                res
            }
        };
        let inner_log = Arc::clone(&log);
        let inner = move |req: Request, next: Next| {
            let log = Arc::clone(&inner_log);
            async move {
                log.lock().unwrap().push("inner:pre");
                let mut res = next.run(req).await?;
                res.set_header("x-inner", "1");
                log.lock().unwrap().push("inner:post");
                Ok::<_, HandlerError>(res)
            }
        };

        let router = Router::new()
            .layer(outer)
            .group("/api", |g| g.layer(inner).get("/hello/{name}", hello))
            .get("/plain", |_: Request, _: Params| async { "plain" });
        let app = App::new(router, Config::default());

        let res = app.handle(request("GET /api/hello/ann HTTP/1.1\r\n\r\n")).await;
        assert_eq!(body(&res), "hi ann");
        assert_eq!(res.header("x-inner"), Some("1"));
        assert_eq!(*log.lock().unwrap(), ["outer:pre", "inner:pre", "inner:post", "outer:post"]);

        log.lock().unwrap().clear();
        let res = app.handle(request("GET /plain HTTP/1.1\r\n\r\n")).await;
        assert_eq!(res.header("x-inner"), None);
        assert_eq!(*log.lock().unwrap(), ["outer:pre", "outer:post"]);
    }

    #[tokio::test]
    async fn middleware_can_short_circuit() {
        let deny = |_req: Request, _next: Next| async {
            Ok::<_, HandlerError>(Response::status(Status::UNAUTHORIZED))
        };
        let app = App::new(Router::new().layer(deny).get("/hello/{name}", hello), Config::default());

        let stage = StageCell::new();
        let res = app.dispatch(request("GET /hello/x HTTP/1.1\r\n\r\n"), &stage).await;
        assert_eq!(res.status_code(), Status::UNAUTHORIZED);
        assert_eq!(stage.get(), Stage::PreMiddleware);
    }

    #[tokio::test]
    async fn handler_errors_become_responses_and_reach_the_hook() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let hook_seen = Arc::clone(&seen);

        let router = Router::new()
            .get("/io", |_: Request, _: Params| async {
                Err::<String, _>(std::io::Error::other("disk on fire"))
            })
            .get("/gone", |_: Request, _: Params| async {
                Err::<String, _>(HandlerError::new(Status::GONE, "moved away"))
            })
            .get("/panic", |_: Request, _: Params| async {
                if true {
                    panic!("boom");
                }
                "unreachable"
            })
            .on_error(move |err| hook_seen.lock().unwrap().push(err.to_string()));
        let app = App::new(router, Config::default());

        let stage = StageCell::new();
        let res = app.dispatch(request("GET /io HTTP/1.1\r\n\r\n"), &stage).await;
        assert_eq!(res.status_code(), Status::INTERNAL_SERVER_ERROR);
        assert_eq!(body(&res), "Internal Server Error");
        assert_eq!(stage.get(), Stage::Handling);

        let res = app.handle(request("GET /gone HTTP/1.1\r\n\r\n")).await;
        assert_eq!(res.status_code(), Status::GONE);
        assert_eq!(body(&res), "moved away");

        let res = app.handle(request("GET /panic HTTP/1.1\r\n\r\n")).await;
        assert_eq!(res.status_code(), Status::INTERNAL_SERVER_ERROR);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], "disk on fire");
        assert_eq!(seen[2], "handler panicked: boom");
    }

    #[tokio::test]
    async fn successful_cycles_reach_post_middleware() {
        let app = App::new(Router::new().get("/hello/{name}", hello), Config::default());
        let stage = StageCell::new();
        app.dispatch(request("GET /hello/x HTTP/1.1\r\n\r\n"), &stage).await;
        assert_eq!(stage.get(), Stage::PostMiddleware);
    }
}
