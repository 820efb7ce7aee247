//! Cloud access tokens
//!
//! Either a static token from configuration or one fetched from the GCE
//! metadata server, cached until shortly before it expires.

use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Refresh this long before the metadata server says the token expires
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum CredentialsError {
    #[error("metadata server request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("metadata server returned {status}: {body}")]
    Status { status: u16, body: String },
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

#[derive(Debug)]
enum Source {
    Fixed(String),
    Metadata {
        http: reqwest::Client,
        url: String,
        cache: Mutex<Option<CachedToken>>,
    },
}

/// Shared bearer-token provider for the storage and compute adapters
#[derive(Debug, Clone)]
pub struct Credentials {
    source: Arc<Source>,
}

impl Credentials {
    /// Always hands out the same token
    pub fn fixed(token: impl Into<String>) -> Self {
        Self {
            source: Arc::new(Source::Fixed(token.into())),
        }
    }

    /// Fetches tokens from the instance metadata server
    pub fn metadata(http: reqwest::Client) -> Self {
        Self::metadata_at(http, METADATA_TOKEN_URL)
    }

    pub fn metadata_at(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            source: Arc::new(Source::Metadata {
                http,
                url: url.into(),
                cache: Mutex::new(None),
            }),
        }
    }

    /// Static token when configured, metadata server otherwise
    pub fn from_config(token: Option<String>, http: reqwest::Client) -> Self {
        match token {
            Some(token) => Self::fixed(token),
            None => Self::metadata(http),
        }
    }

    pub async fn token(&self) -> Result<String, CredentialsError> {
        match self.source.as_ref() {
            Source::Fixed(token) => Ok(token.clone()),
            Source::Metadata { http, url, cache } => {
                let mut cache = cache.lock().await;
                if let Some(cached) = cache.as_ref() {
                    if Instant::now() < cached.refresh_at {
                        return Ok(cached.value.clone());
                    }
                }

                tracing::debug!("Fetching access token from metadata server");
                let response = http
                    .get(url.as_str())
                    .header("Metadata-Flavor", "Google")
                    .send()
                    .await?;

                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(CredentialsError::Status {
                        status: status.as_u16(),
                        body,
                    });
                }

                let token: MetadataToken = response.json().await?;
                let lifetime = Duration::from_secs(token.expires_in).saturating_sub(EXPIRY_MARGIN);
                *cache = Some(CachedToken {
                    value: token.access_token.clone(),
                    refresh_at: Instant::now() + lifetime,
                });
                Ok(token.access_token)
            }
        }
    }
}
