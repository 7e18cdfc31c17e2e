//! Raw HTTP invocation against the homeserver under test
//!
//! Everything the harness sends goes through [`Client::do_request`]: one
//! attempt per call, path segments escaped independently, bearer credential
//! attached from the client when present. [`Client::must_do`] layers 2xx
//! classification on top and is what the scenario helpers use. There is no
//! retry or backoff at this layer; a transport failure is a test failure.

use std::time::Instant;

use reqwest::{header::CONTENT_TYPE, Method, StatusCode};
use serde_json::Value;
use tracing::debug;

use crate::client::Client;
use crate::error::{Error, Result};

/// Optional request parts carried by a single invocation.
///
/// Query keys are repeatable and preserved in insertion order, which the
/// `server_name` parameter of the join endpoint relies on.
#[derive(Debug, Default)]
pub struct RequestOptions {
    body: Option<RequestBody>,
    queries: Vec<(String, String)>,
}

#[derive(Debug)]
enum RequestBody {
    Json(Value),
    Raw { bytes: Vec<u8>, content_type: String },
}

impl RequestOptions {
    /// A request with no body and no query parameters.
    pub fn new() -> Self {
        Self::default()
    }

    /// A request carrying `body` as `application/json`.
    pub fn json(body: Value) -> Self {
        Self {
            body: Some(RequestBody::Json(body)),
            queries: Vec::new(),
        }
    }

    /// A request carrying raw bytes with an explicit content type.
    pub fn raw(bytes: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self {
            body: Some(RequestBody::Raw {
                bytes,
                content_type: content_type.into(),
            }),
            queries: Vec::new(),
        }
    }

    /// Appends one query parameter. May be called repeatedly with the same
    /// key.
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.queries.push((key.into(), value.into()));
        self
    }

    fn is_binary(&self) -> Option<&str> {
        match &self.body {
            Some(RequestBody::Raw { content_type, .. })
                if content_type != "application/json" && !content_type.starts_with("text/") =>
            {
                Some(content_type)
            }
            _ => None,
        }
    }
}

/// A fully buffered response.
///
/// The harness never streams: every consumer reads the whole body anyway
/// (JSON envelopes, media round-trips), and buffering lets the debug mode
/// log response bodies without disturbing the caller.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl ApiResponse {
    /// Parses the body as JSON.
    pub fn json(&self) -> Result<Value> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// The body as text, lossily decoded for diagnostics.
    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    fn loggable_body(&self) -> String {
        match self.content_type.as_deref() {
            Some(ct) if ct.starts_with("application/json") || ct.starts_with("text/") => {
                self.body_str()
            }
            Some(ct) => format!("<binary:{ct}>"),
            None => self.body_str(),
        }
    }
}

impl Client {
    /// Joins `segments` onto the base URL, percent-escaping each segment on
    /// its own so identifiers containing `/` or `%` cannot splice extra
    /// segments into the route.
    fn endpoint_url(&self, segments: &[&str]) -> Result<url::Url> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|()| Error::BaseUrl(self.base_url.to_string()))?;
            path.pop_if_empty();
            path.extend(segments);
        }
        Ok(url)
    }

    /// Issues exactly one request and buffers the response whatever its
    /// status.
    pub async fn do_request(
        &self,
        method: Method,
        segments: &[&str],
        options: RequestOptions,
    ) -> Result<ApiResponse> {
        let url = self.endpoint_url(segments)?;

        let mut builder = self.http.request(method.clone(), url.clone());
        if let Some(token) = &self.access_token {
            builder = builder.bearer_auth(token);
        }
        if !options.queries.is_empty() {
            builder = builder.query(&options.queries);
        }

        if self.debug {
            debug!("Making {} request to {}", method, url);
            match options.is_binary() {
                Some(ct) => debug!("Request body: <binary:{ct}>"),
                None => {
                    if let Some(RequestBody::Json(body)) = &options.body {
                        debug!("Request body: {body}");
                    } else if let Some(RequestBody::Raw { bytes, .. }) = &options.body {
                        debug!("Request body: {}", String::from_utf8_lossy(bytes));
                    }
                }
            }
        }

        builder = match options.body {
            Some(RequestBody::Json(body)) => builder.json(&body),
            Some(RequestBody::Raw {
                bytes,
                content_type,
            }) => builder.header(CONTENT_TYPE, content_type).body(bytes),
            None => builder.header(CONTENT_TYPE, "application/json"),
        };

        let started = Instant::now();
        let response = builder.send().await?;
        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = response.bytes().await?.to_vec();
        let response = ApiResponse {
            status,
            content_type,
            body,
        };

        debug!(
            %method,
            %url,
            status = %response.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request completed"
        );
        if self.debug {
            debug!("Response body: {}", response.loggable_body());
        }
        Ok(response)
    }

    /// [`Client::do_request`], then classifies the status: anything outside
    /// `[200, 300)` becomes [`Error::Status`] carrying the method, URL,
    /// status and body text.
    pub async fn must_do(
        &self,
        method: Method,
        segments: &[&str],
        options: RequestOptions,
    ) -> Result<ApiResponse> {
        let url = self.endpoint_url(segments)?.to_string();
        let response = self.do_request(method.clone(), segments, options).await?;
        if !response.status.is_success() {
            return Err(Error::Status {
                method,
                url,
                status: response.status,
                body: response.body_str(),
            });
        }
        Ok(response)
    }
}
