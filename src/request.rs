//! Incoming HTTP request type.

use std::collections::HashMap;

use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_TYPE};
use http::HeaderMap;
use serde::de::DeserializeOwned;

use crate::error::HandlerError;
use crate::method::Method;

/// HTTP protocol version of a request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

/// An incoming HTTP request, parsed from the raw byte stream.
///
/// Built by the parser and read-only for handlers. Middleware may adjust
/// headers through [`Request::headers_mut`] before forwarding.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    pub(crate) method: Method,
    pub(crate) path: String,
    pub(crate) query: HashMap<String, String>,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Bytes,
}

impl Request {
    pub fn method(&self) -> Method { self.method }

    /// The request path exactly as sent, percent-encoding included, without
    /// the query string.
    pub fn path(&self) -> &str { &self.path }
    pub fn version(&self) -> Version { self.version }
    pub fn headers(&self) -> &HeaderMap { &self.headers }
    pub fn headers_mut(&mut self) -> &mut HeaderMap { &mut self.headers }
    pub fn body(&self) -> &[u8] { &self.body }

    /// A decoded query parameter. When a name repeats, the first value wins.
    pub fn query(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    /// Case-insensitive lookup of the first value of a header. Values that
    /// are not visible ASCII are reported as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The media type of the body, lowercased, without parameters.
    pub fn content_type(&self) -> Option<String> {
        let raw = self.headers.get(CONTENT_TYPE)?.to_str().ok()?;
        let essence = raw.split(';').next().unwrap_or_default().trim();
        Some(essence.to_ascii_lowercase())
    }

    /// Whether the client asked to reuse the connection.
    ///
    /// HTTP/1.1 defaults to keep-alive unless `Connection: close` is sent;
    /// HTTP/1.0 defaults to close unless `Connection: keep-alive` is sent.
    pub fn keep_alive(&self) -> bool {
        let has_token = |token: &str| {
            self.headers.get_all(CONNECTION).iter().any(|v| {
                v.to_str()
                    .map(|s| s.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
                    .unwrap_or(false)
            })
        };

        if has_token("close") {
            return false;
        }
        match self.version {
            Version::Http11 => true,
            Version::Http10 => has_token("keep-alive"),
        }
    }

    /// Decodes a JSON body.
    ///
    /// Fails with `400 Bad Request` when the content type is missing or not
    /// JSON, or when the body does not deserialize into `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        match self.content_type().as_deref() {
            None => Err(HandlerError::bad_request("missing content-type")),
            Some("application/json") => serde_json::from_slice(&self.body)
                .map_err(|e| HandlerError::bad_request(format!("invalid json body: {e}"))),
            Some(other) => Err(HandlerError::bad_request(format!(
                "unsupported content-type: {other}"
            ))),
        }
    }

    /// Decodes the text fields of an `application/x-www-form-urlencoded` or
    /// `multipart/form-data` body. When a name repeats, the first value wins.
    ///
    /// Uploaded files are left out; read them with [`Request::multipart`].
    pub async fn form(&self) -> Result<HashMap<String, String>, HandlerError> {
        match self.content_type().as_deref() {
            Some("application/x-www-form-urlencoded") => Ok(decode_pairs(&self.body)),
            Some("multipart/form-data") => {
                let mut fields = HashMap::new();
                for part in self.multipart().await? {
                    if part.file_name.is_some() {
                        continue;
                    }
                    let value = String::from_utf8(part.data.to_vec()).map_err(|_| {
                        HandlerError::bad_request(format!("form field `{}` is not utf-8", part.name))
                    })?;
                    fields.entry(part.name).or_insert(value);
                }
                Ok(fields)
            }
            Some(other) => Err(HandlerError::bad_request(format!(
                "unsupported content-type: {other}"
            ))),
            None => Err(HandlerError::bad_request("missing content-type")),
        }
    }

    /// Splits a `multipart/form-data` body into its parts, files included.
    ///
    /// The body is already buffered under `max_body_size`, so no part can be
    /// larger than that.
    pub async fn multipart(&self) -> Result<Vec<FormPart>, HandlerError> {
        let content_type = self
            .header(CONTENT_TYPE.as_str())
            .ok_or_else(|| HandlerError::bad_request("missing content-type"))?;
        let boundary = multer::parse_boundary(content_type).map_err(invalid_multipart)?;

        let mut reader = multer::Multipart::with_reader(std::io::Cursor::new(self.body.clone()), boundary);
        let mut parts = Vec::new();
        while let Some(field) = reader.next_field().await.map_err(invalid_multipart)? {
            let name = field.name().unwrap_or_default().to_owned();
            let file_name = field.file_name().map(str::to_owned);
            let content_type = field.content_type().map(ToString::to_string);
            let data = field.bytes().await.map_err(invalid_multipart)?;
            parts.push(FormPart { name, file_name, content_type, data });
        }
        Ok(parts)
    }
}

/// One part of a `multipart/form-data` body.
#[derive(Clone, Debug, PartialEq)]
pub struct FormPart {
    pub name: String,
    /// Set for uploaded files.
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub data: Bytes,
}

fn invalid_multipart(e: multer::Error) -> HandlerError {
    HandlerError::bad_request(format!("invalid multipart body: {e}"))
}

/// Decodes `a=1&b=2` pairs, keeping the first value of a repeated name.
pub(crate) fn decode_pairs(raw: &[u8]) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for (k, v) in url::form_urlencoded::parse(raw) {
        out.entry(k.into_owned()).or_insert_with(|| v.into_owned());
    }
    out
}
