//! Session-token metadata client.

use std::time::Duration;

use backlog_http::{HttpClient, HttpRequest};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{MetadataError, MetadataResult};

const TOKEN_PATH: &str = "/latest/api/token";
const METADATA_PREFIX: &str = "/latest/meta-data/";
const TTL_HEADER: &str = "x-aws-ec2-metadata-token-ttl-seconds";
const TOKEN_HEADER: &str = "x-aws-ec2-metadata-token";
/// Longest token lifetime the endpoint issues.
const MAX_TOKEN_TTL: Duration = Duration::from_secs(21_600);

struct CachedToken {
    value: String,
    /// Refresh point, strictly before the endpoint-side expiry.
    refresh_at: Instant,
}

/// Client for the link-local metadata endpoint.
pub struct MetadataClient {
    http: HttpClient,
    endpoint: String,
    ttl: Duration,
    token: Mutex<Option<CachedToken>>,
}

impl MetadataClient {
    /// `endpoint` is the scheme and authority, e.g. `http://169.254.169.254`.
    /// `ttl` is clamped to the range the endpoint accepts.
    pub fn new(endpoint: impl Into<String>, ttl: Duration, timeout: Duration) -> Self {
        Self {
            http: HttpClient::plain(timeout),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            ttl: ttl.clamp(Duration::from_secs(1), MAX_TOKEN_TTL),
            token: Mutex::new(None),
        }
    }

    /// Return the cached session token, fetching a new one when the cached
    /// token is missing or close to expiry.
    ///
    /// Endpoint failures are returned as-is; there is no retry here.
    pub async fn get_token(&self) -> MetadataResult<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref()
            && Instant::now() < token.refresh_at
        {
            return Ok(token.value.clone());
        }

        let req = HttpRequest::put(&format!("{}{TOKEN_PATH}", self.endpoint))?
            .header(TTL_HEADER, &self.ttl.as_secs().to_string())?;
        let issued = Instant::now();
        let resp = self.http.send(req).await?;
        if !resp.is_success() {
            return Err(MetadataError::Status {
                path: TOKEN_PATH.to_string(),
                status: resp.status.as_u16(),
            });
        }

        let value = resp.text().trim().to_string();
        debug!(ttl_secs = self.ttl.as_secs(), "metadata token refreshed");
        *cached = Some(CachedToken {
            value: value.clone(),
            refresh_at: issued + self.ttl - refresh_margin(self.ttl),
        });
        Ok(value)
    }

    /// Read a metadata key. Absence and every failure yield `None`.
    pub async fn get_metadata(&self, path: &str) -> Option<String> {
        match self.read(path).await {
            Ok(value) => value,
            Err(e) => {
                warn!(path, error = %e, "metadata read failed");
                None
            }
        }
    }

    /// Read a metadata key, keeping the failure reason.
    ///
    /// `Ok(None)` means the key does not exist.
    pub async fn read(&self, path: &str) -> MetadataResult<Option<String>> {
        let token = self.get_token().await?;
        let path = path.trim_start_matches('/');
        let req = HttpRequest::get(&format!("{}{METADATA_PREFIX}{path}", self.endpoint))?
            .header(TOKEN_HEADER, &token)?;
        let resp = self.http.send(req).await?;

        match resp.status.as_u16() {
            200..=299 => Ok(Some(resp.text())),
            404 => {
                debug!(path, "metadata key absent");
                Ok(None)
            }
            401 => {
                // The endpoint no longer accepts our token; fetch a new one next time.
                *self.token.lock().await = None;
                Err(MetadataError::Status {
                    path: path.to_string(),
                    status: 401,
                })
            }
            status => Err(MetadataError::Status {
                path: path.to_string(),
                status,
            }),
        }
    }

    pub async fn instance_id(&self) -> MetadataResult<String> {
        self.require("instance-id").await
    }

    pub async fn region(&self) -> MetadataResult<String> {
        self.require("placement/region").await
    }

    async fn require(&self, path: &str) -> MetadataResult<String> {
        self.read(path)
            .await?
            .map(|v| v.trim().to_string())
            .ok_or_else(|| MetadataError::NotFound(path.to_string()))
    }
}

fn refresh_margin(ttl: Duration) -> Duration {
    (ttl / 10).min(Duration::from_secs(60))
}
