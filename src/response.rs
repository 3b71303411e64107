//! Response builder (§4.C "Response emission").

use std::sync::Arc;

use crate::stream::Stream;

pub(crate) fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        415 => "Unsupported Media Type",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Builds a single `HTTP/1.1 <code> <reason>\r\n<headers>\r\n<body>` byte region
/// (§4.C, §6 "Non-streaming"). Status and headers accumulate via the builder;
/// [`Response::into_bytes`] formats the final wire representation in one pass.
pub struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    keep_alive: bool,
    stream: Option<Arc<Stream>>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Response {
            status,
            headers: Vec::new(),
            body: Vec::new(),
            keep_alive: true,
            stream: None,
        }
    }

    /// A handler hands off a live [`Stream`] instead of a fixed body (§4.E); the
    /// connection pipeline drives it directly rather than formatting `status`
    /// into wire bytes — `status`/`Content-Type` for a streaming response live on
    /// the `Stream` itself, via [`Stream::header_block`].
    pub fn streaming(stream: Arc<Stream>) -> Self {
        Response {
            status: 0,
            headers: Vec::new(),
            body: Vec::new(),
            keep_alive: true,
            stream: Some(stream),
        }
    }

    /// The streaming handle attached by [`Response::streaming`], if any.
    pub fn stream(&self) -> Option<Arc<Stream>> {
        self.stream.clone()
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.body = bytes.into();
        self
    }

    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn json(status: u16, value: &crate::json::JsonValue) -> Self {
        let bytes = crate::json::serialize_bytes(value).unwrap_or_default();
        Response::new(status)
            .header("Content-Type", "application/json")
            .body(bytes)
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Response::new(status)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body.into().into_bytes())
    }

    /// 405 response with a materialized `Allow:` header (§6).
    pub fn method_not_allowed(allowed: &str) -> Self {
        Response::text(405, "405 Method Not Allowed").header("Allow", allowed.to_string())
    }

    pub fn not_found() -> Self {
        Response::text(404, "404 Not Found")
    }

    pub fn bad_request() -> Self {
        Response::text(400, "400 Bad Request")
    }

    pub fn unsupported_media_type() -> Self {
        Response::text(415, "415 Unsupported Media Type")
    }

    pub fn internal_error() -> Self {
        Response::text(500, "500 Internal Server Error")
    }

    /// Tear down the builder into its raw pieces, so a caller (e.g. the connection
    /// pipeline folding a handler's response into the middleware context) can carry
    /// status/headers/body onward without going through the wire format.
    pub fn into_parts(self) -> (u16, Vec<(String, String)>, Vec<u8>) {
        (self.status, self.headers, self.body)
    }

    /// Format into the exact wire bytes: status line, headers (with
    /// `Content-Length` and `Connection` appended if not already set), blank line,
    /// body.
    pub fn into_bytes(self) -> Vec<u8> {
        let reason = reason_phrase(self.status);
        let mut out = Vec::with_capacity(self.body.len() + 256);
        out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", self.status, reason).as_bytes());

        let has_content_length = self
            .headers
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case("content-length"));
        let has_connection = self
            .headers
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case("connection"));

        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        if !has_content_length {
            out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        if !has_connection {
            let conn = if self.keep_alive { "keep-alive" } else { "close" };
            out.extend_from_slice(format!("Connection: {conn}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}
