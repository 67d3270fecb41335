//! Bearer token sources for the REST clients.

use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::platform::CloudError;
use crate::platform::CloudResult;

const METADATA_TOKEN_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/token";
const DEFAULT_METADATA_HOST: &str = "http://metadata.google.internal";
const EXPIRY_SLACK: Duration = Duration::from_secs(60);

/// Supplies OAuth2 access tokens.
#[async_trait::async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> CloudResult<String>;
}

/// A fixed token.
#[derive(Debug, Clone)]
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait::async_trait]
impl TokenSource for StaticTokenSource {
    async fn token(&self) -> CloudResult<String> {
        Ok(self.token.clone())
    }
}

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug)]
struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// Token of the default service account, read from the instance metadata server.
pub struct MetadataTokenSource {
    http: reqwest::Client,
    host: String,
    cached: Mutex<Option<CachedToken>>,
}

impl MetadataTokenSource {
    pub fn new() -> CloudResult<Self> {
        Self::with_host(DEFAULT_METADATA_HOST)
    }

    pub fn with_host(host: impl Into<String>) -> CloudResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .change_context(CloudError::Configuration {
                message: "Failed to create metadata HTTP client".into(),
            })?;
        Ok(Self {
            http,
            host: host.into(),
            cached: Mutex::new(None),
        })
    }

    async fn fetch(&self) -> CloudResult<MetadataToken> {
        let url = format!("{}{METADATA_TOKEN_PATH}", self.host);
        let response = self
            .http
            .get(&url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .change_context(CloudError::Auth {
                message: "Failed to reach metadata server".into(),
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(Report::new(CloudError::Auth {
                message: format!("metadata server returned {status}"),
            }));
        }
        response
            .json::<MetadataToken>()
            .await
            .change_context(CloudError::Auth {
                message: "Malformed token response".into(),
            })
    }
}

#[async_trait::async_trait]
impl TokenSource for MetadataTokenSource {
    async fn token(&self) -> CloudResult<String> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let fresh = self.fetch().await?;
        debug!(expires_in = fresh.expires_in, "Fetched access token from metadata server");
        let lifetime = Duration::from_secs(fresh.expires_in).saturating_sub(EXPIRY_SLACK);
        *cached = Some(CachedToken {
            value: fresh.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(fresh.access_token)
    }
}
