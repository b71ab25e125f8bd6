//! Request descriptors.
//!
//! A [`Request`] is a plain value: an operation keeps it across retries and
//! the transport turns it into an actual exchange.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::{JSON_CONTENT_TYPE, OCTET_STREAM_CONTENT_TYPE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body attached to a request.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(serde_json::Value),
    Bytes {
        data: Vec<u8>,
        content_type: String,
    },
}

impl RequestBody {
    pub fn is_empty(&self) -> bool {
        matches!(self, RequestBody::Empty)
    }

    /// Content type header value for this body, if any.
    pub fn content_type(&self) -> Option<&str> {
        match self {
            RequestBody::Empty => None,
            RequestBody::Json(_) => Some(JSON_CONTENT_TYPE),
            RequestBody::Bytes { content_type, .. } => Some(content_type),
        }
    }

    /// Serialized body bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            RequestBody::Empty => Vec::new(),
            RequestBody::Json(value) => value.to_string().into_bytes(),
            RequestBody::Bytes { data, .. } => data.clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RequestBody::Empty => 0,
            RequestBody::Json(value) => value.to_string().len(),
            RequestBody::Bytes { data, .. } => data.len(),
        }
    }
}

/// Describes one network exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::Put, url)
    }

    /// Adds a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Attaches a JSON body.
    pub fn json(mut self, value: serde_json::Value) -> Self {
        self.body = RequestBody::Json(value);
        self
    }

    /// Attaches a raw body sent as `application/octet-stream`.
    pub fn bytes(mut self, data: Vec<u8>) -> Self {
        self.body = RequestBody::Bytes {
            data,
            content_type: OCTET_STREAM_CONTENT_TYPE.into(),
        };
        self
    }

    /// Returns the value of the first header named `name` (case-insensitive).
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// One-line rendering for logs. Header values are not included.
    pub fn describe(&self) -> String {
        let mut out = format!("{} {}", self.method, self.url);
        if !self.body.is_empty() {
            out.push_str(&format!(" ({} bytes", self.body.len()));
            if let Some(ct) = self.body.content_type() {
                out.push_str(&format!(", {ct}"));
            }
            out.push(')');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let req = Request::post("https://portal/forms")
            .header("Authorization", "Bearer t")
            .json(serde_json::json!({"a": 1}));
        assert_eq!(req.method, Method::Post);
        assert_eq!(req.header_value("authorization"), Some("Bearer t"));
        assert_eq!(req.body.content_type(), Some(JSON_CONTENT_TYPE));
        assert_eq!(req.body.to_bytes(), br#"{"a":1}"#.to_vec());
    }

    #[test]
    fn describe_omits_headers() {
        let req = Request::put("https://portal/doc")
            .header("Authorization", "Bearer secret")
            .bytes(vec![0; 10]);
        let line = req.describe();
        assert_eq!(
            line,
            "PUT https://portal/doc (10 bytes, application/octet-stream)"
        );
        assert!(!line.contains("secret"));
    }

    #[test]
    fn empty_body_describe() {
        assert_eq!(Request::get("https://x/y").describe(), "GET https://x/y");
    }
}
