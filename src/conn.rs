//! One connection's request/response loop.
//!
//! ```text
//!   ┌──▶ read until the parser has a request ──invalid──▶ error response, close
//!   │          │ idle: keep_alive_timeout / drain → close
//!   │          │ stalled mid-request: read_timeout → 408, close
//!   │          ▼
//!   │    dispatch under request_timeout ──expired──▶ 504, close
//!   │          ▼
//!   └─── write under write_timeout ──not keep-alive / expired──▶ close
//! ```
//!
//! Requests on one connection are handled strictly one after another, so
//! pipelined requests are answered in the order they arrived.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, debug_span, warn, Instrument};

use crate::method::Method;
use crate::parser::{ParseError, ParseState, Parser};
use crate::pipeline::{App, Stage, StageCell};
use crate::request::Request;
use crate::response::Response;
use crate::shutdown::Watch;
use crate::writer::{write_response, WriteContext};
use crate::Status;

enum Read {
    Request(Request),
    Invalid(ParseError),
    /// Started a request, then went quiet for `read_timeout`.
    Stalled,
    /// Peer closed, idle timeout, drain, or a transport error.
    Closed,
}

pub(crate) struct Connection<S> {
    io: S,
    parser: Parser,
    buf: Vec<u8>,
    app: Arc<App>,
    watch: Watch,
    peer: Option<SocketAddr>,
    stage: StageCell,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(io: S, app: Arc<App>, watch: Watch, peer: Option<SocketAddr>) -> Self {
        let config = app.config();
        Self {
            io,
            parser: Parser::new(config.limits()),
            buf: vec![0; config.read_buffer_size],
            app,
            watch,
            peer,
            stage: StageCell::new(),
        }
    }

    pub(crate) async fn serve(self) {
        let span = debug_span!("conn", peer = ?self.peer);
        self.run().instrument(span).await;
    }

    async fn run(mut self) {
        debug!("connection open");
        let mut closing = self.watch.clone();
        tokio::select! {
            biased;
            () = closing.closing() => debug!("connection dropped at shutdown"),
            () = self.cycles() => debug!("connection closed"),
        }
    }

    async fn cycles(&mut self) {
        loop {
            if self.stage.get() == Stage::Written {
                self.stage.set(Stage::Parsing);
            }

            let req = match self.read_request().await {
                Read::Request(req) => req,
                Read::Invalid(e) => {
                    debug!(error = %e, "rejecting malformed request");
                    self.reject(e.to_response()).await;
                    return;
                }
                Read::Stalled => {
                    debug!("request read timed out");
                    self.reject(Response::status(Status::REQUEST_TIMEOUT)).await;
                    return;
                }
                Read::Closed => break,
            };

            let mut ctx = WriteContext {
                version: req.version(),
                keep_alive: req.keep_alive(),
                head_only: req.method() == Method::Head,
            };
            let span = debug_span!("request", method = %req.method(), path = %req.path());
            let deadline = self.app.config().request_timeout;

            let dispatched = timeout(deadline, self.app.dispatch(req, &self.stage))
                .instrument(span.clone())
                .await;
            let res = match dispatched {
                Ok(res) => res,
                Err(_) => {
                    span.in_scope(|| warn!(timeout = ?deadline, "request timed out, handler cancelled"));
                    ctx.keep_alive = false;
                    Response::status(Status::GATEWAY_TIMEOUT)
                }
            };
            ctx.keep_alive &= !self.watch.is_draining();

            match self.write(res, ctx).await {
                Some(true) => {}
                Some(false) => break,
                None => return,
            }
        }
        let _ = self.io.shutdown().await;
    }

    /// Answers input that cannot be served and closes.
    async fn reject(&mut self, res: Response) {
        if self.write(res, WriteContext::closing()).await.is_some() {
            let _ = self.io.shutdown().await;
        }
    }

    /// Writes `res` under `write_timeout`. `None` means the connection must
    /// be dropped without further writes; otherwise whether it may be reused.
    async fn write(&mut self, res: Response, ctx: WriteContext) -> Option<bool> {
        let deadline = self.app.config().write_timeout;
        self.stage.set(Stage::Serializing);
        match timeout(deadline, write_response(&mut self.io, res, ctx)).await {
            Ok(Ok(reuse)) => {
                self.stage.set(Stage::Written);
                Some(reuse)
            }
            Ok(Err(e)) => {
                debug!("write failed: {e}");
                None
            }
            Err(_) => {
                warn!(timeout = ?deadline, "response write timed out, dropping connection");
                None
            }
        }
    }

    async fn read_request(&mut self) -> Read {
        let config = self.app.config();
        let (keep_alive_timeout, read_timeout) = (config.keep_alive_timeout, config.read_timeout);

        // pipelined bytes from the previous read come first
        let mut state = self.parser.feed(&[]);
        loop {
            match state {
                ParseState::Complete(req) => return Read::Request(req),
                ParseState::Invalid(e) => return Read::Invalid(e),
                ParseState::Incomplete => {}
            }

            let read = if self.parser.is_idle() {
                if self.watch.is_draining() {
                    return Read::Closed;
                }
                tokio::select! {
                    () = self.watch.draining() => return Read::Closed,
                    read = timeout(keep_alive_timeout, self.io.read(&mut self.buf)) => match read {
                        Ok(read) => read,
                        Err(_) => {
                            debug!("idle timeout");
                            return Read::Closed;
                        }
                    },
                }
            } else {
                match timeout(read_timeout, self.io.read(&mut self.buf)).await {
                    Ok(read) => read,
                    Err(_) => return Read::Stalled,
                }
            };

            let n = match read {
                Ok(0) => return Read::Closed,
                Ok(n) => n,
                Err(e) => {
                    debug!("read failed: {e}");
                    return Read::Closed;
                }
            };
            state = self.parser.feed(&self.buf[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::config::Config;
    use crate::response::{Body, ContentType};
    use crate::trie::Params;
    use crate::{HandlerError, Router};

    async fn hello(_req: Request, params: Params) -> Result<String, HandlerError> {
        Ok(format!("hi {}", params.require("name")?))
    }

    fn app(config: Config) -> Arc<App> {
        let router = Router::new()
            .get("/hello/{name}", hello)
            .get("/slow", |_: Request, _: Params| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                "late"
            });
        Arc::new(App::new(router, config))
    }

    async fn stalled_stream(_req: Request, _params: Params) -> Response {
        let (tx, body) = Body::channel(1);
        tokio::spawn(async move {
            if tx.send("first").await.is_ok() {
                // keeps the body open without ever finishing it
                std::future::pending::<()>().await;
            }
        });
        Response::stream(ContentType::Text, body)
    }

    fn connect(app: Arc<App>) -> DuplexStream {
        let (client, server) = duplex(4096);
        tokio::spawn(app.serve_connection(server));
        client
    }

    async fn read_all(mut client: DuplexStream) -> String {
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn answers_pipelined_requests_in_order() {
        let mut client = connect(app(Config::default()));
        client
            .write_all(
                b"GET /hello/a HTTP/1.1\r\n\r\nGET /hello/b HTTP/1.1\r\n\r\nGET /hello/c HTTP/1.1\r\nconnection: close\r\n\r\n",
            )
            .await
            .unwrap();

        let out = read_all(client).await;
        let a = out.find("hi a").unwrap();
        let b = out.find("hi b").unwrap();
        let c = out.find("hi c").unwrap();
        assert!(a < b && b < c);
        assert_eq!(out.matches("HTTP/1.1 200 OK").count(), 3);
    }

    #[tokio::test]
    async fn malformed_request_gets_400_and_close() {
        let mut client = connect(app(Config::default()));
        client.write_all(b"GARBAGE\r\n\r\n").await.unwrap();
        let out = read_all(client).await;
        assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(out.contains("connection: close\r\n"));
    }

    #[tokio::test]
    async fn oversized_body_gets_413() {
        let config = Config { max_body_size: 4, ..Config::default() };
        let mut client = connect(app(config));
        client
            .write_all(b"POST /hello/x HTTP/1.1\r\ncontent-length: 10\r\n\r\n")
            .await
            .unwrap();
        let out = read_all(client).await;
        assert!(out.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_gets_504_and_close() {
        let config = Config { request_timeout: Duration::from_millis(50), ..Config::default() };
        let mut client = connect(app(config));
        client.write_all(b"GET /slow HTTP/1.1\r\n\r\n").await.unwrap();
        let out = read_all(client).await;
        assert!(out.starts_with("HTTP/1.1 504 Gateway Timeout\r\n"));
        assert!(out.contains("connection: close\r\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_request_gets_408() {
        let config = Config { read_timeout: Duration::from_millis(50), ..Config::default() };
        let mut client = connect(app(config));
        client.write_all(b"GET /hello/x HTTP/1.1\r\nhost: a").await.unwrap();
        let out = read_all(client).await;
        assert!(out.starts_with("HTTP/1.1 408 Request Timeout\r\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_closes_silently() {
        let config = Config { keep_alive_timeout: Duration::from_millis(50), ..Config::default() };
        let client = connect(app(config));
        assert_eq!(read_all(client).await, "");
    }

    #[tokio::test(start_paused = true)]
    async fn unfinished_stream_is_dropped_at_the_write_deadline() {
        let config = Config { write_timeout: Duration::from_millis(100), ..Config::default() };
        let router = Router::new().get("/stream", stalled_stream);
        let mut client = connect(Arc::new(App::new(router, config)));
        client.write_all(b"GET /stream HTTP/1.1\r\n\r\n").await.unwrap();

        let out = timeout(Duration::from_secs(5), read_all(client)).await.unwrap();
        assert!(out.contains("transfer-encoding: chunked\r\n"));
        assert!(out.ends_with("5\r\nfirst\r\n"), "{out:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn client_that_stops_reading_is_dropped_at_the_write_deadline() {
        let config = Config { write_timeout: Duration::from_millis(100), ..Config::default() };
        let router = Router::new().get("/big", |_: Request, _: Params| async { vec![b'x'; 1024 * 1024] });
        let app = Arc::new(App::new(router, config));

        let (mut client, server) = duplex(1024);
        let task = tokio::spawn(app.serve_connection(server));
        client.write_all(b"GET /big HTTP/1.1\r\n\r\n").await.unwrap();

        // the client never reads, so the write can never finish
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        drop(client);
    }

    #[tokio::test]
    async fn head_gets_headers_only() {
        let mut client = connect(app(Config::default()));
        client
            .write_all(b"HEAD /hello/x HTTP/1.1\r\nconnection: close\r\n\r\n")
            .await
            .unwrap();
        let out = read_all(client).await;
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("content-length: 4\r\n"));
        assert!(out.ends_with("\r\n\r\n"));
    }
}
