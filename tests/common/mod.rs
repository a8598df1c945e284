#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use weft::{App, Config, HandlerError, Json, ParseState, Parser, Params, Request, Router};

pub async fn hello(_req: Request, params: Params) -> Result<Json<serde_json::Value>, HandlerError> {
    let name = params.require("name")?;
    Ok(Json(serde_json::json!({ "msg": format!("hi {name}") })))
}

pub fn hello_router() -> Router {
    Router::new().get("/hello/{name}", hello)
}

/// Defaults, on an OS-assigned local port.
pub fn local_config() -> Config {
    Config { addr: SocketAddr::from(([127, 0, 0, 1], 0)), ..Config::default() }
}

pub fn parse(raw: &[u8]) -> Request {
    match Parser::new(Default::default()).feed(raw) {
        ParseState::Complete(req) => req,
        other => panic!("test request did not parse: {other:?}"),
    }
}

/// One end of an in-memory connection served by `app`.
pub fn serve_duplex(app: Arc<App>) -> DuplexStream {
    let (client, server) = tokio::io::duplex(64 * 1024);
    tokio::spawn(app.serve_connection(server));
    client
}

/// A hyper HTTP/1.1 client over `io`.
pub async fn hyper_client<S>(io: S) -> SendRequest<Full<Bytes>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, conn) = http1::handshake(TokioIo::new(io)).await.unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });
    sender
}

pub async fn send(
    sender: &mut SendRequest<Full<Bytes>>,
    req: http::Request<Full<Bytes>>,
) -> (http::response::Parts, Bytes) {
    sender.ready().await.unwrap();
    let res = sender.send_request(req).await.unwrap();
    let (parts, body) = res.into_parts();
    (parts, body.collect().await.unwrap().to_bytes())
}

pub fn get(uri: &str) -> http::Request<Full<Bytes>> {
    http::Request::get(uri).body(Full::new(Bytes::new())).unwrap()
}

/// Reads a single `content-length` framed response.
pub async fn read_response<S: AsyncRead + Unpin>(io: &mut S) -> String {
    let mut out = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(end) = out.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&out[..end]).to_ascii_lowercase();
            let len = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length: "))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if out.len() >= end + 4 + len {
                return String::from_utf8(out).unwrap();
            }
        }
        let n = io.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed mid-response: {:?}", String::from_utf8_lossy(&out));
        out.extend_from_slice(&chunk[..n]);
    }
}

/// Sends `raw` on a fresh TCP connection and reads until the server closes.
pub async fn roundtrip(addr: SocketAddr, raw: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw).await.unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    String::from_utf8(out).unwrap()
}
