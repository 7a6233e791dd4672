use crate::ringlog::{RingLog, stamp};
use reqwest::{Method, StatusCode, Url};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// The vendor rejects API calls carrying any other user agent with a 403.
pub(crate) const API_USER_AGENT: &str = "Indego-Connect_4.0.0.12253";
const CONNECT_TIMEOUT: Duration = Duration::new(3, 0);
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::new(40, 0);

#[derive(thiserror::Error, Debug)]
pub(crate) enum Error {
    #[error("could not build the HTTP client")]
    BuildClient(#[source] reqwest::Error),
    #[error("could not make a request to `{1}`")]
    Request(#[source] reqwest::Error, String),
    #[error("`{method} {url}` responded with HTTP {status}")]
    Status {
        method: Method,
        url: String,
        status: StatusCode,
    },
    #[error("could not read the response of `{1}`")]
    ReadBody(#[source] reqwest::Error, String),
    #[error("could not decode the JSON response of `{1}`")]
    Decode(#[source] serde_json::Error, String),
    #[error("could not build a request URL for `{0}`")]
    Url(String),
}

impl Error {
    pub(crate) fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// The bearer is no longer accepted and has to be renewed.
    pub(crate) fn is_auth_expired(&self) -> bool {
        matches!(
            self.status(),
            Some(StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
        )
    }

    /// The peer closed the connection underneath us (EPIPE).
    pub(crate) fn is_broken_pipe(&self) -> bool {
        let mut cause: Option<&(dyn std::error::Error + 'static)> = Some(self);
        while let Some(e) = cause {
            if let Some(io) = e.downcast_ref::<std::io::Error>() {
                return io.kind() == std::io::ErrorKind::BrokenPipe;
            }
            cause = e.source();
        }
        false
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Body {
    Json(serde_json::Value),
    Svg(Vec<u8>),
    Text(String),
    Empty,
}

impl Body {
    pub(crate) fn into_json(self) -> Option<serde_json::Value> {
        match self {
            Body::Json(v) => Some(v),
            _ => None,
        }
    }
}

/// Cloud API transport: a persistent keep-alive session towards the API host
/// that records every exchange in the communication log.
#[derive(Clone)]
pub(crate) struct Transport {
    client: reqwest::Client,
    comm_log: Arc<Mutex<RingLog>>,
}

impl Transport {
    pub(crate) fn new(comm_log: Arc<Mutex<RingLog>>) -> Result<Self, Error> {
        let client = reqwest::ClientBuilder::new()
            .user_agent(API_USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(DEFAULT_TIMEOUT)
            .gzip(true)
            .build()
            .map_err(Error::BuildClient)?;
        Ok(Self { client, comm_log })
    }

    pub(crate) fn comm_log(&self) -> &Arc<Mutex<RingLog>> {
        &self.comm_log
    }

    pub(crate) async fn get(&self, url: &Url, bearer: &str, timeout: Duration) -> Result<Body, Error> {
        let request = self.request(Method::GET, url, bearer, timeout);
        self.execute(Method::GET, url, request).await
    }

    pub(crate) async fn post(
        &self,
        url: &Url,
        bearer: &str,
        body: Option<&serde_json::Value>,
        basic_auth: Option<(&str, &str)>,
        timeout: Duration,
    ) -> Result<Body, Error> {
        let mut request = self.request(Method::POST, url, bearer, timeout);
        if let Some((user, password)) = basic_auth {
            request = request.basic_auth(user, Some(password));
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        self.execute(Method::POST, url, request).await
    }

    pub(crate) async fn put(
        &self,
        url: &Url,
        bearer: &str,
        body: Option<&serde_json::Value>,
        timeout: Duration,
    ) -> Result<Body, Error> {
        let mut request = self.request(Method::PUT, url, bearer, timeout);
        if let Some(body) = body {
            request = request.json(body);
        }
        self.execute(Method::PUT, url, request).await
    }

    pub(crate) async fn delete(&self, url: &Url, bearer: &str, timeout: Duration) -> Result<Body, Error> {
        let request = self.request(Method::DELETE, url, bearer, timeout);
        self.execute(Method::DELETE, url, request).await
    }

    fn request(
        &self,
        method: Method,
        url: &Url,
        bearer: &str,
        timeout: Duration,
    ) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .request(method, url.clone())
            .timeout(timeout)
            .header("authorization", format!("Bearer {bearer}"))
            .header("accept-encoding", "gzip")
            .header("connection", "Keep-Alive");
        if let Some(host) = authority(url) {
            request = request.header("host", host);
        }
        request
    }

    async fn execute(
        &self,
        method: Method,
        url: &Url,
        request: reqwest::RequestBuilder,
    ) -> Result<Body, Error> {
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                self.record(&method, url, "failed").await;
                tracing::warn!(
                    error = &e as &dyn std::error::Error,
                    uri = %url,
                    %method,
                    "request failed"
                );
                return Err(Error::Request(e, url.to_string()));
            }
        };
        let status = response.status();
        self.record(&method, url, status.as_str()).await;
        decode_response(method, url, response).await
    }

    async fn record(&self, method: &Method, url: &Url, result: &str) {
        self.comm_log
            .lock()
            .await
            .push(format!("{} {:<6} {} {}", stamp(), method.as_str(), result, url));
    }
}

pub(crate) async fn decode_response(
    method: Method,
    url: &Url,
    response: reqwest::Response,
) -> Result<Body, Error> {
    let status = response.status();
    match status {
        StatusCode::NO_CONTENT => {
            tracing::debug!(uri = %url, %method, "no content");
            Ok(Body::Empty)
        }
        StatusCode::OK | StatusCode::CREATED => {
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_ascii_lowercase();
            let bytes = response
                .bytes()
                .await
                .map_err(|e| Error::ReadBody(e, url.to_string()))?;
            if content_type.contains("json") {
                if bytes.is_empty() {
                    return Ok(Body::Empty);
                }
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::Decode(e, url.to_string()))?;
                tracing::debug!(response = ?value, uri = %url, %method);
                Ok(Body::Json(value))
            } else if content_type.contains("svg") {
                Ok(Body::Svg(bytes.to_vec()))
            } else if bytes.is_empty() {
                Ok(Body::Empty)
            } else {
                Ok(Body::Text(String::from_utf8_lossy(&bytes).into_owned()))
            }
        }
        status => {
            tracing::warn!(uri = %url, %method, %status, "unexpected HTTP status");
            Err(Error::Status {
                method,
                url: url.to_string(),
                status,
            })
        }
    }
}

/// `path` resolved against the API base, which is expected to end with a `/`.
pub(crate) fn endpoint(base: &Url, path: &str) -> Result<Url, Error> {
    base.join(path).map_err(|_| Error::Url(path.to_string()))
}

/// `host[:port]` of the URL, the value a browser would send as `Host`.
pub(crate) fn authority(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}
