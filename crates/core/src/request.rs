//! Request and response values flowing through the worker.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::Error;
use crate::url::canonicalize;

/// What the page intends to do with the response.
///
/// Mirrors the `destination` the browser attaches to every request; only the
/// variants the routing table cares about are modelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    Document,
    Style,
    Script,
    Image,
    Font,
    #[default]
    Empty,
}

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub url: Url,
    pub destination: Destination,
    pub body: Option<Bytes>,
}

impl Request {
    /// A GET request for `url` with no particular destination.
    pub fn get(url: Url) -> Self {
        Self { method: "GET".into(), url, destination: Destination::Empty, body: None }
    }

    /// A top-level navigation.
    pub fn navigate(url: Url) -> Self {
        Self { destination: Destination::Document, ..Self::get(url) }
    }

    /// Build a request from loosely typed input (event payloads).
    ///
    /// The method is upper-cased and the URL canonicalized.
    pub fn parse(method: &str, url: &str, destination: Destination, body: Option<Bytes>) -> Result<Self, Error> {
        let method = method.trim().to_ascii_uppercase();
        if method.is_empty() || !method.bytes().all(is_token_byte) {
            return Err(Error::InvalidInput(format!("invalid method: {method:?}")));
        }
        let url = canonicalize(url).map_err(|e| Error::InvalidUrl(e.to_string()))?;
        Ok(Self { method, url, destination, body })
    }

    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    pub fn is_get(&self) -> bool {
        self.method == "GET"
    }

    pub fn is_navigation(&self) -> bool {
        self.destination == Destination::Document
    }
}

/// `tchar` from RFC 9110: methods are tokens, e.g. `M-SEARCH`.
fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

/// A response, either fresh from the network or replayed from a store.
///
/// Status 0 marks an opaque response (cross-origin, contents hidden).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    /// URL the response was produced for, after redirects.
    pub url: String,
}

impl Response {
    pub fn new(status: u16, body: impl Into<Bytes>, url: impl Into<String>) -> Self {
        Self { status, headers: Vec::new(), body: body.into(), url: url.into() }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First header value matching `name`, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    pub fn is_opaque(&self) -> bool {
        self.status == 0
    }
}
