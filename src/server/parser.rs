//! Incremental HTTP/1.1 parser (§4.C "Parser callbacks").
//!
//! Wraps `httparse`'s single-shot header tokenizer in a callback-shaped state
//! machine so the connection loop can feed it bytes as they arrive rather than
//! requiring the whole request up front. `httparse` does the byte-level tokenizing;
//! this module owns per-message state and the growable body buffer.

use thiserror::Error;

use crate::request::ContentType;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed request line or headers: {0}")]
    Malformed(String),
    #[error("header block exceeded {0} bytes")]
    HeadersTooLarge(usize),
    #[error("request line exceeded {0} bytes; truncated")]
    UrlTooLong(usize),
}

const MAX_HEADERS: usize = 64;
const MAX_URL_LEN: usize = 8192;
const INITIAL_BODY_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    AwaitingHeaders,
    ReadingBody,
    Complete,
}

/// One parsed request's accumulated state, reset between messages on the same
/// keep-alive connection (§4.C "on_message_begin: reset all per-message state").
pub struct IncrementalParser {
    stage: Stage,
    method: String,
    url: String,
    headers: Vec<(String, String)>,
    content_type: ContentType,
    content_length: Option<usize>,
    body: Vec<u8>,
    header_buf_len: usize,
}

/// Result of feeding bytes into the parser. Both variants carry `consumed`: the
/// connection loop must drain that many bytes from its read buffer immediately,
/// even on `NeedMoreData` — bytes already folded into parser state (header bytes
/// tokenized by `httparse`, body bytes appended to the growable buffer) must never
/// be re-fed on the next socket read, or the next feed corrupts the body and
/// leaks stale bytes into the following keep-alive request.
pub enum Feed {
    /// Needs more bytes before it can make progress; `consumed` bytes of the input
    /// were folded into parser state and must not be re-fed.
    NeedMoreData { consumed: usize },
    /// The headers (and, if present, the full body) are ready; `consumed` is how
    /// many bytes of the input were used for this message.
    MessageComplete { consumed: usize },
}

impl IncrementalParser {
    pub fn new() -> Self {
        IncrementalParser {
            stage: Stage::AwaitingHeaders,
            method: String::new(),
            url: String::new(),
            headers: Vec::new(),
            content_type: ContentType::None,
            content_length: None,
            body: Vec::with_capacity(INITIAL_BODY_CAPACITY),
            header_buf_len: 0,
        }
    }

    /// `on_message_begin`.
    pub fn reset(&mut self) {
        self.stage = Stage::AwaitingHeaders;
        self.method.clear();
        self.url.clear();
        self.headers.clear();
        self.content_type = ContentType::None;
        self.content_length = None;
        self.body.clear();
        self.header_buf_len = 0;
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Feed newly-arrived bytes. `buf` is the connection's full unconsumed read
    /// buffer; returns how many bytes were consumed when a message completes.
    pub fn feed(&mut self, buf: &[u8]) -> Result<Feed, ParseError> {
        match self.stage {
            Stage::AwaitingHeaders => self.feed_headers(buf),
            Stage::ReadingBody => self.feed_body(buf),
            Stage::Complete => Ok(Feed::MessageComplete { consumed: 0 }),
        }
    }

    fn feed_headers(&mut self, buf: &[u8]) -> Result<Feed, ParseError> {
        if buf.len() > MAX_URL_LEN * 2 {
            return Err(ParseError::HeadersTooLarge(buf.len()));
        }

        let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut header_storage);

        let status = req
            .parse(buf)
            .map_err(|e| ParseError::Malformed(e.to_string()))?;

        let consumed = match status {
            httparse::Status::Complete(n) => n,
            httparse::Status::Partial => return Ok(Feed::NeedMoreData { consumed: 0 }),
        };

        // on_url: bounded copy, truncate on overflow rather than error.
        let url = req.path.unwrap_or("/");
        self.url = if url.len() > MAX_URL_LEN {
            url[..MAX_URL_LEN].to_string()
        } else {
            url.to_string()
        };

        // on_headers_complete: capture the final method name.
        self.method = req.method.unwrap_or("GET").to_ascii_uppercase();

        self.headers.clear();
        for h in req.headers.iter() {
            let name = h.name.to_string();
            let value = String::from_utf8_lossy(h.value).into_owned();

            // on_header_field / on_header_value: classify Content-Type.
            if name.eq_ignore_ascii_case("content-type") {
                self.content_type = classify_content_type(&value);
            }
            if name.eq_ignore_ascii_case("content-length") {
                self.content_length = value.trim().parse::<usize>().ok();
            }
            self.headers.push((name, value));
        }
        self.header_buf_len = consumed;

        match self.content_length {
            Some(0) | None => {
                self.stage = Stage::Complete;
                Ok(Feed::MessageComplete { consumed })
            }
            Some(_) => {
                self.stage = Stage::ReadingBody;
                match self.feed_body(&buf[consumed..])? {
                    Feed::MessageComplete { consumed: body_consumed } => {
                        Ok(Feed::MessageComplete { consumed: consumed + body_consumed })
                    }
                    Feed::NeedMoreData { consumed: body_consumed } => {
                        Ok(Feed::NeedMoreData { consumed: consumed + body_consumed })
                    }
                }
            }
        }
    }

    /// `on_body`: append to a growable buffer with a doubling strategy. Every byte
    /// taken from `buf` is reported as `consumed`, on both outcomes — the bytes
    /// are folded into `self.body` immediately, so a caller must never re-feed
    /// them on the next read.
    fn feed_body(&mut self, buf: &[u8]) -> Result<Feed, ParseError> {
        let target = self.content_length.unwrap_or(0);
        let remaining = target.saturating_sub(self.body.len());
        if remaining == 0 {
            self.stage = Stage::Complete;
            return Ok(Feed::MessageComplete { consumed: 0 });
        }
        if buf.is_empty() {
            return Ok(Feed::NeedMoreData { consumed: 0 });
        }

        let take = remaining.min(buf.len());
        if self.body.capacity() < self.body.len() + take {
            let mut new_cap = self.body.capacity().max(INITIAL_BODY_CAPACITY);
            while new_cap < self.body.len() + take {
                new_cap *= 2;
            }
            self.body.reserve(new_cap - self.body.capacity());
        }
        self.body.extend_from_slice(&buf[..take]);

        if self.body.len() >= target {
            self.stage = Stage::Complete;
            Ok(Feed::MessageComplete { consumed: take })
        } else {
            Ok(Feed::NeedMoreData { consumed: take })
        }
    }

    /// `on_message_complete`: split the URL into path and query, and validate the
    /// body-vs-content-type rule (§4.C "if body present and method ∈ {POST, PUT,
    /// PATCH} and content type is NONE, respond 415").
    pub fn finish(&self) -> Result<(String, String), ()> {
        let (path, query) = match self.url.split_once('?') {
            Some((p, q)) => (p.to_string(), q.to_string()),
            None => (self.url.clone(), String::new()),
        };

        let needs_content_type = matches!(self.method.as_str(), "POST" | "PUT" | "PATCH")
            && !self.body.is_empty()
            && self.content_type == ContentType::None;
        if needs_content_type {
            return Err(());
        }
        Ok((path, query))
    }
}

impl Default for IncrementalParser {
    fn default() -> Self {
        Self::new()
    }
}

fn classify_content_type(value: &str) -> ContentType {
    let value = value.trim().to_ascii_lowercase();
    if value.starts_with("application/json") {
        ContentType::Json
    } else if value.starts_with("application/x-www-form-urlencoded") {
        ContentType::Form
    } else {
        ContentType::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_get_with_no_body() {
        let mut parser = IncrementalParser::new();
        let raw = b"GET /users/42?x=1 HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let feed = parser.feed(raw).unwrap();
        assert!(matches!(feed, Feed::MessageComplete { .. }));
        assert_eq!(parser.method(), "GET");
        let (path, query) = parser.finish().unwrap();
        assert_eq!(path, "/users/42");
        assert_eq!(query, "x=1");
    }

    #[test]
    fn classifies_json_content_type() {
        let mut parser = IncrementalParser::new();
        let raw = b"POST /echo HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: 13\r\n\r\n{\"a\": true}\r\n";
        let feed = parser.feed(raw).unwrap();
        assert!(matches!(feed, Feed::MessageComplete { .. }));
        assert_eq!(parser.content_type(), ContentType::Json);
        assert_eq!(parser.body(), b"{\"a\": true}\r\n");
    }

    #[test]
    fn partial_body_requires_more_data() {
        let mut parser = IncrementalParser::new();
        let headers = b"POST /echo HTTP/1.1\r\nContent-Length: 10\r\n\r\n";
        let feed = parser.feed(headers).unwrap();
        assert!(matches!(feed, Feed::NeedMoreData { .. }));

        let feed2 = parser.feed(b"12345").unwrap();
        assert!(matches!(feed2, Feed::NeedMoreData { .. }));

        let feed3 = parser.feed(b"67890").unwrap();
        assert!(matches!(feed3, Feed::MessageComplete { .. }));
        assert_eq!(parser.body(), b"1234567890");
    }

    #[test]
    fn need_more_data_reports_every_consumed_byte() {
        // A caller must drain exactly `consumed` bytes from its read buffer after
        // every feed, even on NeedMoreData, or it re-feeds already-parsed bytes
        // and corrupts the body on the next read.
        let mut parser = IncrementalParser::new();
        let headers = b"POST /echo HTTP/1.1\r\nContent-Length: 6\r\n\r\n";
        let header_feed = parser.feed(headers).unwrap();
        let header_consumed = match header_feed {
            Feed::NeedMoreData { consumed } => consumed,
            Feed::MessageComplete { .. } => panic!("expected NeedMoreData"),
        };
        assert_eq!(header_consumed, headers.len());

        let partial_feed = parser.feed(b"abc").unwrap();
        let partial_consumed = match partial_feed {
            Feed::NeedMoreData { consumed } => consumed,
            Feed::MessageComplete { .. } => panic!("expected NeedMoreData"),
        };
        assert_eq!(partial_consumed, 3);

        let final_feed = parser.feed(b"def").unwrap();
        assert!(matches!(final_feed, Feed::MessageComplete { consumed: 3 }));
        assert_eq!(parser.body(), b"abcdef");
    }

    #[test]
    fn body_without_content_type_fails_finish_for_post() {
        let mut parser = IncrementalParser::new();
        let raw = b"POST /echo HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc";
        parser.feed(raw).unwrap();
        assert!(parser.finish().is_err());
    }

    #[test]
    fn get_without_content_type_is_fine() {
        let mut parser = IncrementalParser::new();
        let raw = b"GET / HTTP/1.1\r\n\r\n";
        parser.feed(raw).unwrap();
        assert!(parser.finish().is_ok());
    }

    #[test]
    fn reset_clears_state_between_messages() {
        let mut parser = IncrementalParser::new();
        parser.feed(b"GET /a HTTP/1.1\r\n\r\n").unwrap();
        parser.reset();
        assert_eq!(parser.method(), "");
        assert_eq!(parser.url(), "");
        assert_eq!(parser.content_type(), ContentType::None);
    }

    #[test]
    fn oversized_url_is_truncated_not_rejected() {
        let mut parser = IncrementalParser::new();
        let long_path = "/".to_string() + &"a".repeat(MAX_URL_LEN + 50);
        let raw = format!("GET {long_path} HTTP/1.1\r\n\r\n");
        let feed = parser.feed(raw.as_bytes()).unwrap();
        assert!(matches!(feed, Feed::MessageComplete { .. }));
        assert_eq!(parser.url().len(), MAX_URL_LEN);
    }
}
