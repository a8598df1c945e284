//! Outgoing HTTP response type, its body, and the conversions handlers use
//! to produce one.
//!
//! Build a [`Response`] in your handler and return it, or return anything
//! that implements [`Reply`]: a [`Status`], a `String`, a [`Json`] value, or
//! a `Result` of any of those.

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::HandlerError;
use crate::Status;

// ── ContentType ───────────────────────────────────────────────────────────────

/// Common content-type values for use with [`ResponseBuilder::bytes`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ContentType {
    Csv,          // text/csv
    EventStream,  // text/event-stream  (SSE)
    FormData,     // application/x-www-form-urlencoded
    Html,         // text/html; charset=utf-8
    Json,         // application/json
    OctetStream,  // application/octet-stream  (binary / file download)
    Text,         // text/plain; charset=utf-8
    Xml,          // application/xml
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Csv         => "text/csv",
            Self::EventStream => "text/event-stream",
            Self::FormData    => "application/x-www-form-urlencoded",
            Self::Html        => "text/html; charset=utf-8",
            Self::Json        => "application/json",
            Self::OctetStream => "application/octet-stream",
            Self::Text        => "text/plain; charset=utf-8",
            Self::Xml         => "application/xml",
        }
    }
}

// ── Body ──────────────────────────────────────────────────────────────────────

/// A response body: either fully buffered or a lazy sequence of chunks.
///
/// Streamed bodies are written with chunked framing to HTTP/1.1 clients and
/// close-delimited to HTTP/1.0 clients.
pub enum Body {
    Full(Bytes),
    Stream(mpsc::Receiver<Bytes>),
}

impl Body {
    pub fn empty() -> Self {
        Self::Full(Bytes::new())
    }

    /// Creates a streamed body and the sender that feeds it. The body ends
    /// when every [`BodySender`] is dropped. `buffer` bounds how many chunks
    /// may be queued ahead of the socket.
    pub fn channel(buffer: usize) -> (BodySender, Body) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (BodySender(tx), Body::Stream(rx))
    }

    /// The buffered bytes, or `None` for a streamed body.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Full(b) => Some(b),
            Self::Stream(_) => None,
        }
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full(b) => f.debug_tuple("Full").field(&b.len()).finish(),
            Self::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// The producing half of [`Body::channel`].
#[derive(Clone, Debug)]
pub struct BodySender(mpsc::Sender<Bytes>);

/// The connection dropped the body before it was fully written.
#[derive(Debug, thiserror::Error)]
#[error("response body receiver dropped")]
pub struct BodyClosed;

impl BodySender {
    /// Queues one chunk, waiting while the buffer is full.
    pub async fn send(&self, chunk: impl Into<Bytes>) -> Result<(), BodyClosed> {
        self.0.send(chunk.into()).await.map_err(|_| BodyClosed)
    }
}

// ── Response ─────────────────────────────────────────────────────────────────

/// An outgoing HTTP response.
///
/// # Shortcuts (200 OK, no custom headers needed)
///
/// ```rust
/// use weft::{Response, Status};
///
/// Response::json(br#"{"id":1}"#.to_vec());
/// Response::text("hello");
/// Response::status(Status::NO_CONTENT);
/// ```
///
/// # Builder (custom status or headers)
///
/// ```rust
/// use weft::{ContentType, Response, Status};
///
/// Response::builder()
///     .status(Status::CREATED)
///     .header("location", "/users/42")
///     .json(br#"{"id":42}"#.to_vec());
///
/// Response::builder()
///     .bytes(ContentType::Xml, b"<ok/>".to_vec());
/// ```
#[derive(Debug)]
pub struct Response {
    pub(crate) status: Status,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: Body,
}

impl Response {
    /// `200 OK`, `application/json`.
    pub fn json(body: Vec<u8>) -> Self {
        Self::builder().json(body)
    }

    /// `200 OK`, `text/plain; charset=utf-8`.
    pub fn text(body: impl Into<String>) -> Self {
        Self::builder().text(body)
    }

    /// `200 OK`, `text/html; charset=utf-8`.
    pub fn html(body: impl Into<String>) -> Self {
        let body: String = body.into();
        Self::builder().bytes(ContentType::Html, body)
    }

    /// `200 OK` with a streamed body, usually from [`Body::channel`].
    pub fn stream(content_type: ContentType, body: Body) -> Self {
        Self::builder().stream(content_type, body)
    }

    /// Response with no body.
    pub fn status(code: Status) -> Self {
        Self { status: code, headers: Vec::new(), body: Body::empty() }
    }

    /// `302 Found` pointing at `location`.
    pub fn redirect(location: &str) -> Self {
        Self::builder().status(Status::FOUND).header("location", location).no_body()
    }

    /// Builder for responses that need a custom status or extra headers.
    pub fn builder() -> ResponseBuilder {
        ResponseBuilder { headers: Vec::new(), status: Status::OK }
    }

    pub fn status_code(&self) -> Status {
        self.status
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Case-insensitive lookup of the first header named `name`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replaces every header named `name` with a single value.
    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_owned(), value.to_owned()));
    }

    pub fn body(&self) -> &Body {
        &self.body
    }
}

// ── ResponseBuilder ───────────────────────────────────────────────────────────

/// Fluent builder for [`Response`].
///
/// Obtain via [`Response::builder()`]. Defaults to `200 OK`. Terminated by a
/// typed body method, so you always know what you're sending.
pub struct ResponseBuilder {
    headers: Vec<(String, String)>,
    status: Status,
}

impl ResponseBuilder {
    pub fn status(mut self, code: Status) -> Self {
        self.status = code;
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    /// Terminate with a JSON body (`application/json`).
    pub fn json(self, body: Vec<u8>) -> Response {
        self.finish(ContentType::Json, Body::Full(body.into()))
    }

    /// Terminate with a plain-text body (`text/plain; charset=utf-8`).
    pub fn text(self, body: impl Into<String>) -> Response {
        let body: String = body.into();
        self.finish(ContentType::Text, Body::Full(Bytes::from(body)))
    }

    /// Terminate with a typed body. Use this for XML, HTML, binary, etc.
    pub fn bytes(self, content_type: ContentType, body: impl Into<Bytes>) -> Response {
        self.finish(content_type, Body::Full(body.into()))
    }

    /// Terminate with a streamed body, typically from [`Body::channel`].
    pub fn stream(self, content_type: ContentType, body: Body) -> Response {
        self.finish(content_type, body)
    }

    /// Terminate with no body (e.g. `204 No Content`, redirects).
    pub fn no_body(self) -> Response {
        Response { status: self.status, headers: self.headers, body: Body::empty() }
    }

    fn finish(self, content_type: ContentType, body: Body) -> Response {
        let mut headers = vec![("content-type".to_owned(), content_type.as_str().to_owned())];
        headers.extend(self.headers);
        Response { status: self.status, headers, body }
    }
}

// ── IntoResponse ──────────────────────────────────────────────────────────────

/// Infallible conversion into an HTTP [`Response`].
pub trait IntoResponse {
    fn into_response(self) -> Response;
}

impl IntoResponse for Response {
    fn into_response(self) -> Response { self }
}

/// Strings are sent as `text/plain`, never `text/html`, so echoed input is not
/// rendered as markup. Use [`Response::html`] for pages.
impl IntoResponse for &'static str {
    fn into_response(self) -> Response { Response::text(self) }
}

impl IntoResponse for String {
    fn into_response(self) -> Response { Response::text(self) }
}

/// Raw bytes are sent as `application/octet-stream`.
impl IntoResponse for Vec<u8> {
    fn into_response(self) -> Response {
        Response::builder().bytes(ContentType::OctetStream, self)
    }
}

impl IntoResponse for Bytes {
    fn into_response(self) -> Response {
        Response::builder().bytes(ContentType::OctetStream, self)
    }
}

/// Return a [`Status`] directly from a handler: `return Status::NOT_FOUND`
impl IntoResponse for Status {
    fn into_response(self) -> Response { Response::status(self) }
}

impl IntoResponse for (Status, String) {
    fn into_response(self) -> Response { Response::builder().status(self.0).text(self.1) }
}

impl IntoResponse for (Status, &'static str) {
    fn into_response(self) -> Response { Response::builder().status(self.0).text(self.1) }
}

// ── Reply ─────────────────────────────────────────────────────────────────────

/// What a handler may return.
///
/// Implemented for every built-in [`IntoResponse`] type, for [`Json`], and
/// for `Result<T, E>` where `T: Reply` and `E` converts into a
/// [`HandlerError`], so handlers can use `?`:
///
/// ```rust
/// use weft::{HandlerError, Params, Request, Status};
///
/// async fn delete_user(_req: Request, params: Params) -> Result<Status, HandlerError> {
///     let _id: u64 = params.require("id")?.parse()?;
///     Ok(Status::NO_CONTENT)
/// }
/// ```
///
/// Implement it for your own types by delegating to `IntoResponse`.
pub trait Reply {
    fn into_reply(self) -> Result<Response, HandlerError>;
}

macro_rules! reply_via_into_response {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Reply for $ty {
                fn into_reply(self) -> Result<Response, HandlerError> {
                    Ok(self.into_response())
                }
            }
        )*
    };
}

reply_via_into_response!(
    Response,
    Status,
    String,
    &'static str,
    Vec<u8>,
    Bytes,
    (Status, String),
    (Status, &'static str),
);

impl<T, E> Reply for Result<T, E>
where
    T: Reply,
    E: Into<HandlerError>,
{
    fn into_reply(self) -> Result<Response, HandlerError> {
        self.map_err(Into::into).and_then(Reply::into_reply)
    }
}

/// Serializes `T` with serde_json into a `200 OK` JSON response.
///
/// A serialization failure is a [`HandlerError`] (500).
#[derive(Clone, Debug)]
pub struct Json<T>(pub T);

impl<T: Serialize> Reply for Json<T> {
    fn into_reply(self) -> Result<Response, HandlerError> {
        let body = serde_json::to_vec(&self.0)?;
        Ok(Response::json(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_puts_content_type_first() {
        let res = Response::builder()
            .status(Status::CREATED)
            .header("location", "/users/42")
            .json(b"{}".to_vec());

        assert_eq!(res.status_code(), Status::CREATED);
        assert_eq!(res.headers()[0], ("content-type".into(), "application/json".into()));
        assert_eq!(res.header("LOCATION"), Some("/users/42"));
    }

    #[test]
    fn set_header_replaces_case_insensitively() {
        let mut res = Response::text("x");
        res.set_header("Content-Type", "text/csv");
        assert_eq!(res.headers().len(), 1);
        assert_eq!(res.header("content-type"), Some("text/csv"));
    }

    #[test]
    fn result_replies_flatten_errors() {
        let ok: Result<&'static str, HandlerError> = Ok("fine");
        assert_eq!(ok.into_reply().map(|r| r.status_code()).ok(), Some(Status::OK));

        let err: Result<Status, std::io::Error> = Err(std::io::Error::other("nope"));
        let err = err.into_reply().err();
        assert_eq!(err.map(|e| e.status()), Some(Status::INTERNAL_SERVER_ERROR));
    }

    #[test]
    fn json_reply_serializes() {
        let res = Json(serde_json::json!({ "msg": "hi" })).into_reply().ok();
        let body = res.as_ref().and_then(|r| r.body().as_bytes());
        assert_eq!(body, Some(&br#"{"msg":"hi"}"#[..]));
    }

    #[test]
    fn redirect_sets_location() {
        let res = Response::redirect("/login");
        assert_eq!(res.status_code(), Status::FOUND);
        assert_eq!(res.header("location"), Some("/login"));
        assert_eq!(res.body().as_bytes(), Some(&b""[..]));
    }
}
