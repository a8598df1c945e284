//! Response serialization.
//!
//! Turns a [`Response`] into HTTP/1.1 bytes on the socket:
//!
//! | body                   | HTTP/1.1 client            | HTTP/1.0 client          |
//! |------------------------|----------------------------|--------------------------|
//! | `Body::Full`           | `content-length`           | `content-length`         |
//! | `Body::Stream`         | `transfer-encoding: chunked` | close-delimited        |
//! | 1xx / 204 / 304        | no body, no length         | no body, no length       |
//!
//! Framing headers are always computed here. A `content-length`,
//! `transfer-encoding` or `connection` header set by the application is
//! dropped, except that `connection: close` is honored. A header whose name
//! or value is not valid HTTP (a CR or LF in a value, say) is dropped and
//! logged rather than written.

use bytes::{BufMut, Bytes, BytesMut};
use http::{HeaderName, HeaderValue};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::error;

use crate::request::Version;
use crate::response::{Body, Response};
use crate::Status;

/// What the writer needs to know about the request being answered.
#[derive(Clone, Copy, Debug)]
pub(crate) struct WriteContext {
    pub(crate) version: Version,
    /// The connection would be reused if the response allows it.
    pub(crate) keep_alive: bool,
    /// Answering a HEAD request: headers only.
    pub(crate) head_only: bool,
}

impl WriteContext {
    /// Context for a response to input that never parsed: always closes.
    pub(crate) fn closing() -> Self {
        Self { version: Version::Http11, keep_alive: false, head_only: false }
    }
}

/// Writes `res` to `io` and flushes it.
///
/// Returns whether the connection may serve another request afterwards.
pub(crate) async fn write_response<W>(io: &mut W, res: Response, ctx: WriteContext) -> std::io::Result<bool>
where
    W: AsyncWrite + Unpin,
{
    let Response { status, headers, body } = res;

    let status = if (100..=599).contains(&status.as_u16()) {
        status
    } else {
        error!(status = status.as_u16(), "handler produced an invalid status, sending 500");
        Status::INTERNAL_SERVER_ERROR
    };

    let wants_close = headers.iter().any(|(k, v)| {
        k.eq_ignore_ascii_case("connection")
            && v.split(',').any(|t| t.trim().eq_ignore_ascii_case("close"))
    });
    let bodyless = status.is_informational()
        || status == Status::NO_CONTENT
        || status == Status::NOT_MODIFIED;

    let framing = match &body {
        _ if bodyless => Framing::None,
        Body::Full(bytes) => Framing::Length(bytes.len()),
        Body::Stream(_) if ctx.version == Version::Http11 => Framing::Chunked,
        Body::Stream(_) => Framing::UntilClose,
    };
    let keep_alive = ctx.keep_alive && !wants_close && framing != Framing::UntilClose;

    let head = encode_head(status, &headers, framing, keep_alive, ctx.version);
    io.write_all(&head).await?;

    if !ctx.head_only && !bodyless {
        match body {
            Body::Full(bytes) => io.write_all(&bytes).await?,
            Body::Stream(mut rx) => {
                while let Some(chunk) = rx.recv().await {
                    if chunk.is_empty() {
                        continue;
                    }
                    match framing {
                        Framing::Chunked => write_chunk(io, chunk).await?,
                        _ => io.write_all(&chunk).await?,
                    }
                }
                if framing == Framing::Chunked {
                    io.write_all(b"0\r\n\r\n").await?;
                }
            }
        }
    }
    io.flush().await?;
    Ok(keep_alive)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Framing {
    None,
    Length(usize),
    Chunked,
    UntilClose,
}

fn encode_head(
    status: Status,
    headers: &[(String, String)],
    framing: Framing,
    keep_alive: bool,
    version: Version,
) -> BytesMut {
    let mut buf = BytesMut::with_capacity(256);
    buf.put_slice(b"HTTP/1.1 ");
    buf.put_slice(status.as_str().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
    buf.put_slice(b"\r\n");

    for (name, value) in headers {
        if is_framing_header(name) {
            continue;
        }
        if HeaderName::from_bytes(name.as_bytes()).is_err() || HeaderValue::from_bytes(value.as_bytes()).is_err() {
            error!(header = ?name, value = ?value, "dropping invalid response header");
            continue;
        }
        put_header(&mut buf, name, value);
    }

    match framing {
        Framing::Length(len) => put_header(&mut buf, "content-length", &len.to_string()),
        Framing::Chunked => put_header(&mut buf, "transfer-encoding", "chunked"),
        Framing::None | Framing::UntilClose => {}
    }
    if !keep_alive {
        put_header(&mut buf, "connection", "close");
    } else if version == Version::Http10 {
        put_header(&mut buf, "connection", "keep-alive");
    }
    buf.put_slice(b"\r\n");
    buf
}

fn is_framing_header(name: &str) -> bool {
    ["content-length", "transfer-encoding", "connection"]
        .iter()
        .any(|h| name.eq_ignore_ascii_case(h))
}

fn put_header(buf: &mut BytesMut, name: &str, value: &str) {
    buf.put_slice(name.as_bytes());
    buf.put_slice(b": ");
    buf.put_slice(value.as_bytes());
    buf.put_slice(b"\r\n");
}

async fn write_chunk<W: AsyncWrite + Unpin>(io: &mut W, chunk: Bytes) -> std::io::Result<()> {
    io.write_all(format!("{:x}\r\n", chunk.len()).as_bytes()).await?;
    io.write_all(&chunk).await?;
    io.write_all(b"\r\n").await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::ContentType;

    const KEEP_11: WriteContext =
        WriteContext { version: Version::Http11, keep_alive: true, head_only: false };

    async fn render(res: Response, ctx: WriteContext) -> (String, bool) {
        let mut out = Vec::new();
        let reuse = write_response(&mut out, res, ctx).await.unwrap();
        (String::from_utf8(out).unwrap(), reuse)
    }

    #[tokio::test]
    async fn full_body_gets_content_length() {
        let (out, reuse) = render(Response::text("hello"), KEEP_11).await;
        assert_eq!(
            out,
            "HTTP/1.1 200 OK\r\ncontent-type: text/plain; charset=utf-8\r\ncontent-length: 5\r\n\r\nhello"
        );
        assert!(reuse);
    }

    #[tokio::test]
    async fn stream_is_chunked_for_http11() {
        let (tx, body) = Body::channel(4);
        let res = Response::builder().stream(ContentType::Text, body);
        tokio::spawn(async move {
            tx.send("hel").await.unwrap();
            tx.send("").await.unwrap();
            tx.send("lo world").await.unwrap();
        });

        let (out, reuse) = render(res, KEEP_11).await;
        assert!(out.contains("transfer-encoding: chunked\r\n"));
        assert!(!out.contains("content-length"));
        assert!(out.ends_with("\r\n\r\n3\r\nhel\r\n8\r\nlo world\r\n0\r\n\r\n"));
        assert!(reuse);
    }

    #[tokio::test]
    async fn stream_is_close_delimited_for_http10() {
        let (tx, body) = Body::channel(1);
        let res = Response::builder().stream(ContentType::Text, body);
        tokio::spawn(async move {
            tx.send("abc").await.unwrap();
        });

        let ctx = WriteContext { version: Version::Http10, keep_alive: true, head_only: false };
        let (out, reuse) = render(res, ctx).await;
        assert!(out.contains("connection: close\r\n"));
        assert!(out.ends_with("\r\n\r\nabc"));
        assert!(!reuse);
    }

    #[tokio::test]
    async fn bodyless_statuses_send_no_length() {
        let (out, _) = render(Response::status(Status::NO_CONTENT), KEEP_11).await;
        assert_eq!(out, "HTTP/1.1 204 No Content\r\n\r\n");

        let res = Response::builder().status(Status::NOT_MODIFIED).text("ignored");
        let (out, _) = render(res, KEEP_11).await;
        assert!(!out.contains("content-length"));
        assert!(!out.contains("ignored"));
    }

    #[tokio::test]
    async fn head_requests_get_headers_only() {
        let ctx = WriteContext { head_only: true, ..KEEP_11 };
        let (out, reuse) = render(Response::text("hello"), ctx).await;
        assert!(out.contains("content-length: 5\r\n"));
        assert!(out.ends_with("\r\n\r\n"));
        assert!(reuse);
    }

    #[tokio::test]
    async fn application_framing_headers_are_replaced() {
        let res = Response::builder()
            .header("Content-Length", "999")
            .header("Transfer-Encoding", "gzip")
            .header("x-kept", "yes")
            .text("ok");
        let (out, _) = render(res, KEEP_11).await;
        assert!(out.contains("content-length: 2\r\n"));
        assert!(!out.contains("999"));
        assert!(!out.contains("gzip"));
        assert!(out.contains("x-kept: yes\r\n"));
    }

    #[tokio::test]
    async fn application_can_force_close() {
        let res = Response::builder().header("Connection", "close").text("bye");
        let (out, reuse) = render(res, KEEP_11).await;
        assert!(out.contains("connection: close\r\n"));
        assert!(!reuse);
    }

    #[tokio::test]
    async fn headers_with_line_breaks_are_dropped() {
        let mut res = Response::redirect("/a\r\nset-cookie: pwned=1");
        res.set_header("x-bad\r\nset-cookie", "pwned=2");
        res.set_header("x-note", "caf\u{e9}\tok");
        let (out, reuse) = render(res, KEEP_11).await;
        assert_eq!(
            out,
            "HTTP/1.1 302 Found\r\nx-note: caf\u{e9}\tok\r\ncontent-length: 0\r\n\r\n"
        );
        assert!(reuse);
    }

    #[tokio::test]
    async fn http10_keep_alive_is_acknowledged() {
        let ctx = WriteContext { version: Version::Http10, keep_alive: true, head_only: false };
        let (out, reuse) = render(Response::text("x"), ctx).await;
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("connection: keep-alive\r\n"));
        assert!(reuse);
    }

    #[tokio::test]
    async fn out_of_range_status_becomes_500() {
        let odd = Status::from_u16(799).unwrap();
        let (out, _) = render(Response::status(odd), KEEP_11).await;
        assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    }
}
