//! Error types.
//!
//! Two families, kept apart on purpose of who sees them:
//!
//! - [`Error`]: infrastructure failures surfaced to the process: binding a
//!   port, reading a config file, registering an invalid route.
//! - [`HandlerError`]: application failures raised by handlers or
//!   middleware. The pipeline catches every one of them, logs it, hands it to
//!   the `on_error` hook and turns it into an HTTP response. It never reaches
//!   the worker thread.

use std::error::Error as StdError;
use std::fmt;

use serde_json::json;
use tokio::task::JoinError;

use crate::response::Response;
use crate::trie::RouteError;
use crate::Status;

/// The error type returned by weft's fallible setup and lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("config: {0}")]
    Config(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Route(#[from] RouteError),
}

// ── HandlerError ──────────────────────────────────────────────────────────────

/// A failure produced while handling a request.
///
/// Any `std::error::Error` converts into a `HandlerError` through `?`, which
/// makes it a `500 Internal Server Error`. Use the constructors to pick a
/// different status:
///
/// ```rust
/// use weft::{HandlerError, Status};
///
/// let missing = HandlerError::bad_request("missing argument: name");
/// assert_eq!(missing.status(), Status::BAD_REQUEST);
///
/// let gone = HandlerError::new(Status::GONE, "user was deleted");
/// assert_eq!(gone.status(), Status::GONE);
/// ```
///
/// Like `anyhow::Error`, `HandlerError` deliberately does not implement
/// `std::error::Error` itself; that is what lets the blanket `From` exist.
pub struct HandlerError {
    status: Status,
    kind: Kind,
}

enum Kind {
    Source(Box<dyn StdError + Send + Sync + 'static>),
    Message(String),
    Api { error: String, data: String, message: String },
    Panic(String),
}

impl HandlerError {
    /// An error with an explicit status whose message is sent to the client.
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self { status, kind: Kind::Message(message.into()) }
    }

    /// `400 Bad Request` with a client-visible message.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(Status::BAD_REQUEST, message)
    }

    /// A structured API error, rendered as
    /// `{"error": …, "data": …, "message": …}` with status 400.
    ///
    /// `error` is a machine-readable code such as `"value:invalid"`, `data`
    /// names the offending field.
    ///
    /// The status is 400 rather than 200 so clients can tell a rejected call
    /// from a successful one without reading the body. Chain
    /// [`with_status`](Self::with_status)`(Status::OK)` where callers expect
    /// the error object inside a 200 response.
    pub fn api(
        error: impl Into<String>,
        data: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status: Status::BAD_REQUEST,
            kind: Kind::Api {
                error: error.into(),
                data: data.into(),
                message: message.into(),
            },
        }
    }

    /// Overrides the status the error is reported with.
    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// The wrapped error, when this was built from a `std::error::Error`.
    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match &self.kind {
            Kind::Source(e) => Some(e.as_ref()),
            _ => None,
        }
    }

    /// `true` when the handler panicked instead of returning.
    pub fn is_panic(&self) -> bool {
        matches!(self.kind, Kind::Panic(_))
    }

    /// Converts a failed handler task into an error. Panic payloads that are
    /// strings are kept for the logs.
    pub(crate) fn from_join(err: JoinError) -> Self {
        let what = if err.is_panic() {
            let payload = err.into_panic();
            payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_owned())
        } else {
            "handler task cancelled".to_owned()
        };
        Self { status: Status::INTERNAL_SERVER_ERROR, kind: Kind::Panic(what) }
    }

    /// The response sent to the client. Internal details (wrapped errors,
    /// panic messages) stay in the logs; the body only carries the reason.
    pub(crate) fn to_response(&self) -> Response {
        match &self.kind {
            Kind::Message(message) => Response::builder()
                .status(self.status)
                .text(message.clone()),
            Kind::Api { error, data, message } => {
                let body = json!({ "error": error, "data": data, "message": message });
                Response::builder()
                    .status(self.status)
                    .json(body.to_string().into_bytes())
            }
            Kind::Source(_) | Kind::Panic(_) => Response::builder()
                .status(self.status)
                .text(self.status.canonical_reason().unwrap_or("Error")),
        }
    }
}

impl<E> From<E> for HandlerError
where
    E: StdError + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        Self { status: Status::INTERNAL_SERVER_ERROR, kind: Kind::Source(Box::new(err)) }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Kind::Source(e) => write!(f, "{e}"),
            Kind::Message(m) => f.write_str(m),
            Kind::Api { error, message, .. } => write!(f, "{error}: {message}"),
            Kind::Panic(m) => write!(f, "handler panicked: {m}"),
        }
    }
}

impl fmt::Debug for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerError")
            .field("status", &self.status.as_u16())
            .field("error", &self.to_string())
            .finish()
    }
}
