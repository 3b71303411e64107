//! Request type (§3 "Request").

use std::collections::HashMap;

use crate::json::JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    None,
    Json,
    Form,
}

/// An inbound HTTP request, owned by the connection for the duration of dispatch.
/// Query-string, JSON, and form parsing are all lazy: `parsed_json`/`parsed_form`
/// start `None` and are filled in on first access (§4.C "lazy ... only performed on
/// the first ... lookup").
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub query_string: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub content_type: ContentType,
    pub path_params: Vec<(String, String)>,
    parsed_query: Option<HashMap<String, String>>,
    parsed_json: Option<JsonValue>,
    parsed_form: Option<HashMap<String, String>>,
}

impl Request {
    pub fn new(
        method: String,
        path: String,
        query_string: String,
        headers: Vec<(String, String)>,
        body: Option<Vec<u8>>,
        content_type: ContentType,
    ) -> Self {
        Request {
            method,
            path,
            query_string,
            headers,
            body,
            content_type,
            path_params: Vec::new(),
            parsed_query: None,
            parsed_json: None,
            parsed_form: None,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.path_params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Decode and cache the query string on first access.
    pub fn query_param(&mut self, name: &str) -> Option<&str> {
        if self.parsed_query.is_none() {
            self.parsed_query = Some(decode_www_form(&self.query_string, '&'));
        }
        self.parsed_query.as_ref().unwrap().get(name).map(|s| s.as_str())
    }

    /// Parse the body as JSON on first access, caching the result. Returns `None`
    /// when there is no body or the content type is not JSON.
    pub fn json(&mut self) -> Option<&JsonValue> {
        if self.content_type != ContentType::Json {
            return None;
        }
        if self.parsed_json.is_none() {
            let body = self.body.as_deref()?;
            self.parsed_json = crate::json::parse(body).ok();
        }
        self.parsed_json.as_ref()
    }

    /// Parse the body as `application/x-www-form-urlencoded` on first access.
    pub fn form(&mut self) -> Option<&HashMap<String, String>> {
        if self.content_type != ContentType::Form {
            return None;
        }
        if self.parsed_form.is_none() {
            let body = self.body.as_deref()?;
            let body_str = std::str::from_utf8(body).ok()?;
            self.parsed_form = Some(decode_www_form(body_str, '&'));
        }
        self.parsed_form.as_ref()
    }
}

/// Decode `key=value` pairs separated by `sep`, URL-decoding `%HH` escapes and
/// treating `+` as space (§4.C "Parsers must URL-decode `%HH` pairs and treat `+`
/// as space in form bodies").
fn decode_www_form(input: &str, sep: char) -> HashMap<String, String> {
    let mut out = HashMap::new();
    if input.is_empty() {
        return out;
    }
    for pair in input.split(sep) {
        if pair.is_empty() {
            continue;
        }
        let mut parts = pair.splitn(2, '=');
        let key = parts.next().unwrap_or("");
        let value = parts.next().unwrap_or("");
        let key = decode_component(key);
        let value = decode_component(value);
        out.insert(key, value);
    }
    out
}

fn decode_component(s: &str) -> String {
    let replaced = s.replace('+', " ");
    urlencoding::decode(&replaced)
        .map(|cow| cow.into_owned())
        .unwrap_or(replaced)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_param_decodes_percent_and_plus() {
        let mut req = Request::new(
            "GET".into(),
            "/search".into(),
            "q=hello+world&tag=a%2Fb".into(),
            Vec::new(),
            None,
            ContentType::None,
        );
        assert_eq!(req.query_param("q"), Some("hello world"));
        assert_eq!(req.query_param("tag"), Some("a/b"));
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let req = Request::new(
            "GET".into(),
            "/".into(),
            "".into(),
            vec![("Content-Type".into(), "application/json".into())],
            None,
            ContentType::Json,
        );
        assert_eq!(req.header("content-type"), Some("application/json"));
    }

    #[test]
    fn form_body_parses_lazily() {
        let mut req = Request::new(
            "POST".into(),
            "/submit".into(),
            "".into(),
            Vec::new(),
            Some(b"name=a+b&age=9".to_vec()),
            ContentType::Form,
        );
        let form = req.form().unwrap();
        assert_eq!(form.get("name").unwrap(), "a b");
        assert_eq!(form.get("age").unwrap(), "9");
    }

    #[test]
    fn json_body_is_none_for_non_json_content_type() {
        let mut req = Request::new(
            "POST".into(),
            "/submit".into(),
            "".into(),
            Vec::new(),
            Some(b"{}".to_vec()),
            ContentType::Form,
        );
        assert!(req.json().is_none());
    }
}
