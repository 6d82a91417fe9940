//! Request/response values and the HTTP transport seam.
//!
//! Everything above this module only ever sees [`Request`], [`Response`] and
//! [`TransportError`]; the concrete HTTP stack lives behind [`Transport`].

use async_trait::async_trait;
use reqwest_middleware::ClientWithMiddleware;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use tracing::{debug, instrument};
use url::Url;
use uuid::Uuid;

use crate::errors::{BricataError, Result, TransportError, TransportErrorKind};

/// Header name/value pairs sent with a request
pub type Headers = BTreeMap<String, String>;

/// Percent-encode a value for use as one path segment
///
/// Reserved characters such as `/`, `?`, `#` and spaces are escaped, so the
/// value can never add segments, start a query or cut the path short.
pub fn path_segment(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

/// HTTP methods used by the Bricata API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    fn as_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

impl Display for HttpMethod {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpMethod::Get => write!(f, "GET"),
            HttpMethod::Post => write!(f, "POST"),
            HttpMethod::Put => write!(f, "PUT"),
            HttpMethod::Delete => write!(f, "DELETE"),
        }
    }
}

/// One API call, immutable once built
///
/// # Example
///
/// ```rust
/// use bricata_api_client::{HttpMethod, Request};
///
/// let request = Request::get("/alerts/")
///     .with_query("limit", "10")
///     .with_header("X-Trace", "abc");
///
/// assert_eq!(request.method(), HttpMethod::Get);
/// assert_eq!(request.endpoint(), "/alerts/");
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    id: Uuid,
    method: HttpMethod,
    endpoint: String,
    query: Vec<(String, String)>,
    body: Option<serde_json::Value>,
    headers: Headers,
}

impl Request {
    /// Create a request with a fresh correlation id
    pub fn new(method: HttpMethod, endpoint: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            method,
            endpoint: endpoint.into(),
            query: Vec::new(),
            body: None,
            headers: Headers::new(),
        }
    }

    pub fn get(endpoint: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, endpoint)
    }

    pub fn post(endpoint: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, endpoint)
    }

    pub fn put(endpoint: impl Into<String>) -> Self {
        Self::new(HttpMethod::Put, endpoint)
    }

    pub fn delete(endpoint: impl Into<String>) -> Self {
        Self::new(HttpMethod::Delete, endpoint)
    }

    /// Override the correlation id
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Append a query parameter
    pub fn with_query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    /// Append several query parameters, keeping their order
    pub fn with_query_pairs<I>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.query.extend(pairs);
        self
    }

    /// Set a JSON body
    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Serialize `body` to JSON and set it
    ///
    /// # Errors
    ///
    /// Returns an error if `body` cannot be represented as JSON.
    pub fn with_json<T: Serialize>(self, body: &T) -> Result<Self> {
        let value = serde_json::to_value(body).map_err(BricataError::Serialize)?;
        Ok(self.with_body(value))
    }

    /// Add a per-request header; it wins over session headers with the same name
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    pub fn body(&self) -> Option<&serde_json::Value> {
        self.body.as_ref()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }
}

/// Raw HTTP response for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Correlation id of the request that produced this response
    pub request_id: Uuid,
    /// HTTP status code
    pub status: u16,
    /// Undecoded response body
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(request_id: Uuid, status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            request_id,
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..=299).contains(&self.status)
    }

    /// Body as text, replacing invalid UTF-8
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Performs a single HTTP call
///
/// Implementations must not retry; retries belong to
/// [`RetryPolicy`](crate::RetryPolicy).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `request`, merging `headers` under the request's own headers
    async fn send(
        &self,
        request: &Request,
        headers: &Headers,
    ) -> std::result::Result<Response, TransportError>;
}

/// [`Transport`] backed by a reqwest middleware client
#[derive(Clone)]
pub struct ReqwestTransport {
    client: ClientWithMiddleware,
    api_url: Url,
}

impl ReqwestTransport {
    /// Wrap an existing client; endpoints are appended to `api_url`'s path
    pub fn new(client: ClientWithMiddleware, api_url: Url) -> Self {
        Self { client, api_url }
    }

    pub fn api_url(&self) -> &Url {
        &self.api_url
    }

    fn endpoint_url(&self, endpoint: &str) -> std::result::Result<Url, TransportError> {
        let base = self.api_url.as_str().trim_end_matches('/');
        let endpoint = endpoint.trim_start_matches('/');
        Url::parse(&format!("{base}/{endpoint}"))
            .map_err(|e| TransportError::new(TransportErrorKind::InvalidUrl, e.to_string()))
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    #[instrument(
        name = "ReqwestTransport::send",
        skip_all,
        fields(request_id = %request.id(), method = %request.method(), endpoint = request.endpoint())
    )]
    async fn send(
        &self,
        request: &Request,
        headers: &Headers,
    ) -> std::result::Result<Response, TransportError> {
        let url = self.endpoint_url(request.endpoint())?;

        let mut builder = self.client.request(request.method().as_reqwest(), url);
        for (name, value) in headers.iter().filter(|(k, _)| !request.headers().contains_key(*k)) {
            builder = builder.header(name.as_str(), value.as_str());
        }
        for (name, value) in request.headers() {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.query().is_empty() {
            builder = builder.query(request.query());
        }
        if let Some(body) = request.body() {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::from_reqwest(&e))?;

        debug!(status, bytes = body.len(), "Response received");
        Ok(Response::new(request.id(), status, body.to_vec()))
    }
}
