//! # weft
//!
//! A lightweight async HTTP/1.1 framework for services behind a reverse
//! proxy.
//!
//! ## The contract
//!
//! nginx handles TLS, rate limiting and compression. weft does not. What
//! is left is the part that changes between applications, plus the limits
//! every server has to enforce on its own sockets:
//!
//! - Prefix-tree routing with `{name}` parameters, literal segments first
//! - Middleware, globally or per route group
//! - Incremental HTTP/1.1 parsing with header and body limits, keep-alive
//!   and pipelining
//! - A pool of single-threaded worker runtimes with a connection ceiling
//! - Per-request deadlines and graceful shutdown on SIGTERM / Ctrl-C
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use weft::{HandlerError, Json, Params, Request, Response, Router, Server, Status};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), weft::Error> {
//!     let app = Router::new()
//!         .layer(weft::middleware::Trace)
//!         .get("/users/{id}", get_user)
//!         .post("/users", create_user);
//!
//!     Server::bind("0.0.0.0:3000").serve(app).await
//! }
//!
//! async fn get_user(_req: Request, params: Params) -> Result<Json<serde_json::Value>, HandlerError> {
//!     let id: u64 = params.require("id")?.parse()?;
//!     Ok(Json(serde_json::json!({ "id": id })))
//! }
//!
//! async fn create_user(req: Request, _params: Params) -> Result<Response, HandlerError> {
//!     let user: serde_json::Value = req.json()?;
//!     Ok(Response::builder()
//!         .status(Status::CREATED)
//!         .header("location", "/users/99")
//!         .json(serde_json::to_vec(&user)?))
//! }
//! ```
//!
//! Logging goes through [`tracing`]; install a subscriber to see it.

mod config;
mod conn;
mod error;
mod handler;
mod listener;
mod method;
mod parser;
mod pipeline;
mod request;
mod response;
mod router;
mod scheduler;
mod server;
mod shutdown;
mod trie;
mod writer;

pub mod middleware;

pub use config::Config;
pub use error::{Error, HandlerError};
pub use handler::Handler;
pub use http::StatusCode as Status;
pub use method::{Method, UnknownMethod};
pub use parser::{Limits, ParseError, ParseState, Parser};
pub use pipeline::App;
pub use request::{FormPart, Request, Version};
pub use response::{Body, BodyClosed, BodySender, ContentType, IntoResponse, Json, Reply, Response, ResponseBuilder};
pub use router::{Group, Router};
pub use scheduler::blocking;
pub use server::{Server, ServerHandle};
pub use trie::{Params, RouteError};
