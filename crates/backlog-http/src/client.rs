//! Request/response types and the connection logic.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

const USER_AGENT: &str = concat!("backlogd/", env!("CARGO_PKG_VERSION"));

/// Errors from a single HTTP exchange.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("invalid url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid header {name}: {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tls setup for {host} failed: {reason}")]
    Tls { host: String, reason: String },

    #[error("http handshake failed: {0}")]
    Handshake(#[source] hyper::Error),

    #[error("request failed: {0}")]
    Request(#[source] hyper::Error),

    #[error("reading response body failed: {0}")]
    Body(#[source] hyper::Error),

    #[error("request to {url} timed out after {after:?}")]
    Timeout { url: String, after: Duration },

    #[error("response decode failed: {0}")]
    Decode(String),
}

impl HttpError {
    /// Whether the peer actively refused the TCP connection.
    pub fn is_connection_refused(&self) -> bool {
        matches!(
            self,
            HttpError::Connect { source, .. }
                if source.kind() == std::io::ErrorKind::ConnectionRefused
        )
    }
}

/// An outgoing request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn new(method: Method, url: &str) -> Result<Self, HttpError> {
        let uri: Uri = url.parse().map_err(|e: http::uri::InvalidUri| HttpError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        if uri.host().is_none() {
            return Err(HttpError::InvalidUrl {
                url: url.to_string(),
                reason: "missing host".to_string(),
            });
        }
        Ok(Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        })
    }

    pub fn get(url: &str) -> Result<Self, HttpError> {
        Self::new(Method::GET, url)
    }

    pub fn put(url: &str) -> Result<Self, HttpError> {
        Self::new(Method::PUT, url)
    }

    pub fn post(url: &str) -> Result<Self, HttpError> {
        Self::new(Method::POST, url)
    }

    /// Add a header. Later values for the same name replace earlier ones.
    pub fn header(mut self, name: &str, value: &str) -> Result<Self, HttpError> {
        let invalid = |reason: String| HttpError::InvalidHeader {
            name: name.to_string(),
            reason,
        };
        let name_h = HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(e.to_string()))?;
        let value_h = HeaderValue::from_str(value).map_err(|e| invalid(e.to_string()))?;
        self.headers.insert(name_h, value_h);
        Ok(self)
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Serialize `value` as the JSON body.
    pub fn json<T: serde::Serialize>(self, value: &T) -> Result<Self, HttpError> {
        let body = serde_json::to_vec(value).map_err(|e| HttpError::Decode(e.to_string()))?;
        Ok(self.header("content-type", "application/json")?.body(body))
    }

    /// `host[:port]` as it should appear in the `Host` header.
    pub fn host_header(&self) -> String {
        let host = self.uri.host().unwrap_or_default();
        match self.uri.port_u16() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    fn is_tls(&self) -> bool {
        self.uri.scheme_str() == Some("https")
    }

    fn connect_addr(&self) -> String {
        let host = self.uri.host().unwrap_or_default();
        let port = self
            .uri
            .port_u16()
            .unwrap_or(if self.is_tls() { 443 } else { 80 });
        format!("{host}:{port}")
    }
}

/// A fully-read response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, HttpError> {
        serde_json::from_slice(&self.body).map_err(|e| HttpError::Decode(e.to_string()))
    }
}

/// HTTP/1.1 client. Cheap to clone.
#[derive(Clone)]
pub struct HttpClient {
    tls: Option<Arc<rustls::ClientConfig>>,
    timeout: Duration,
}

impl HttpClient {
    /// Client for plain `http` targets only (local endpoints).
    pub fn plain(timeout: Duration) -> Self {
        Self { tls: None, timeout }
    }

    /// Client that also speaks `https`, trusting the Mozilla root store.
    pub fn with_tls(timeout: Duration) -> Result<Self, HttpError> {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = rustls::ClientConfig::builder_with_provider(
            rustls::crypto::ring::default_provider().into(),
        )
        .with_safe_default_protocol_versions()
        .map_err(|e| HttpError::Tls {
            host: String::new(),
            reason: format!("protocol version error: {e}"),
        })?
        .with_root_certificates(roots)
        .with_no_client_auth();

        Ok(Self {
            tls: Some(Arc::new(config)),
            timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send `req` and read the whole response, bounded by the client timeout.
    pub async fn send(&self, req: HttpRequest) -> Result<HttpResponse, HttpError> {
        let url = req.uri.to_string();
        match tokio::time::timeout(self.timeout, self.exchange(req)).await {
            Ok(result) => result,
            Err(_) => {
                debug!(%url, "http request timed out");
                Err(HttpError::Timeout {
                    url,
                    after: self.timeout,
                })
            }
        }
    }

    pub async fn get(&self, url: &str) -> Result<HttpResponse, HttpError> {
        self.send(HttpRequest::get(url)?).await
    }

    async fn exchange(&self, req: HttpRequest) -> Result<HttpResponse, HttpError> {
        let addr = req.connect_addr();
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| HttpError::Connect {
                addr: addr.clone(),
                source,
            })?;
        let _ = stream.set_nodelay(true);

        if !req.is_tls() {
            return send_over(stream, req).await;
        }

        let host = req.uri.host().unwrap_or_default().to_string();
        let config = self.tls.clone().ok_or_else(|| HttpError::Tls {
            host: host.clone(),
            reason: "client built without tls support".to_string(),
        })?;
        let server_name = rustls::pki_types::ServerName::try_from(host.clone()).map_err(|e| {
            HttpError::Tls {
                host: host.clone(),
                reason: e.to_string(),
            }
        })?;
        let tls_stream = tokio_rustls::TlsConnector::from(config)
            .connect(server_name, stream)
            .await
            .map_err(|e| HttpError::Tls {
                host,
                reason: e.to_string(),
            })?;

        send_over(tls_stream, req).await
    }
}

async fn send_over<S>(io: S, req: HttpRequest) -> Result<HttpResponse, HttpError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .map_err(HttpError::Handshake)?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let path = req
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let host = req.host_header();

    let mut builder = http::Request::builder().method(req.method.clone()).uri(path);
    if let Some(headers) = builder.headers_mut() {
        headers.extend(req.headers);
        if !headers.contains_key(http::header::HOST) {
            headers.insert(
                http::header::HOST,
                HeaderValue::from_str(&host).map_err(|e| HttpError::InvalidHeader {
                    name: "host".to_string(),
                    reason: e.to_string(),
                })?,
            );
        }
        headers
            .entry(http::header::USER_AGENT)
            .or_insert(HeaderValue::from_static(USER_AGENT));
    }
    let request = builder
        .body(Full::new(req.body))
        .map_err(|e| HttpError::InvalidUrl {
            url: req.uri.to_string(),
            reason: e.to_string(),
        })?;

    let resp = sender.send_request(request).await.map_err(HttpError::Request)?;
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = resp
        .into_body()
        .collect()
        .await
        .map_err(HttpError::Body)?
        .to_bytes();

    Ok(HttpResponse {
        status,
        headers,
        body,
    })
}
