//! Per-request log line: method, path, status, latency.

use std::time::Instant;

use tracing::info;

use super::{Middleware, Next};
use crate::error::HandlerError;
use crate::handler::BoxFuture;
use crate::request::Request;
use crate::response::Response;

/// Logs one `info!` event per request once its response is ready.
///
/// ```rust
/// use weft::{middleware::Trace, Router};
///
/// let app = Router::new().layer(Trace);
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct Trace;

impl Middleware for Trace {
    fn call(&self, req: Request, next: Next) -> BoxFuture<Result<Response, HandlerError>> {
        Box::pin(async move {
            let method = req.method();
            let path = req.path().to_owned();
            let started = Instant::now();

            let result = next.run(req).await;

            let status = match &result {
                Ok(res) => res.status_code(),
                Err(err) => err.status(),
            };
            info!(
                %method,
                %path,
                status = status.as_u16(),
                elapsed_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
                "request"
            );
            result
        })
    }
}
