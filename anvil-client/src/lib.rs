//! Anvil HTTP Client
//!
//! Typed access to the orchestrator's job API: quote, submit, inspect, poll
//! and cancel training jobs.
//!
//! # Example
//!
//! ```no_run
//! use anvil_client::OrchestratorClient;
//! use anvil_core::domain::routing::DatasetType;
//! use anvil_core::domain::tier::Tier;
//! use anvil_core::dto::job::QuoteRequest;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = OrchestratorClient::new("http://localhost:8080");
//!
//!     let quote = client.quote_job(&QuoteRequest {
//!         tier: Tier::Free,
//!         dataset_type: DatasetType::Tabular,
//!         task_type: "classification".to_string(),
//!         prefer_gpu: false,
//!         dataset_size_mb: 12.0,
//!         epochs: None,
//!     }).await?;
//!
//!     println!("{} for ${:.2}", quote.decision.machine_class, quote.estimate.cost);
//!     Ok(())
//! }
//! ```

pub mod error;
mod jobs;

pub use error::{ClientError, Result};

use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// HTTP client for the Anvil orchestrator API
#[derive(Debug, Clone)]
pub struct OrchestratorClient {
    base_url: String,
    client: Client,
}

impl OrchestratorClient {
    /// Client without a request timeout
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::from_parts(base_url.into(), Client::new())
    }

    /// Client whose requests give up after `timeout`
    ///
    /// Polling a job can wait on a status read from object storage, so
    /// interactive callers should bound it.
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::from_parts(base_url.into(), client))
    }

    fn from_parts(base_url: String, client: Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Sends a request and decodes the JSON body of a successful answer
    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        self.execute(request)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }

    /// Sends a request whose successful answer carries no body
    async fn send_empty(&self, request: RequestBuilder) -> Result<()> {
        self.execute(request).await.map(|_| ())
    }

    /// Turns a non-2xx answer into `ClientError::ApiError`
    async fn execute(&self, request: RequestBuilder) -> Result<Response> {
        let response = request.send().await?;
        let status = response.status();
        tracing::debug!("{} {}", status.as_u16(), response.url());

        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(ClientError::api_error(status.as_u16(), body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_urls_are_joined_without_double_slash() {
        let client = OrchestratorClient::new("http://localhost:8080/");
        assert_eq!(client.base_url(), "http://localhost:8080");
        assert_eq!(client.url("/job/quote"), "http://localhost:8080/job/quote");
    }

    #[tokio::test]
    async fn test_timeout_bounds_slow_answers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let client = OrchestratorClient::with_timeout(server.uri(), Duration::from_millis(50)).unwrap();
        let err = client
            .send_empty(client.client.get(client.url("/health")))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::RequestFailed(e) if e.is_timeout()));
    }

    #[tokio::test]
    async fn test_non_json_success_body_is_a_parse_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
            .mount(&server)
            .await;

        let client = OrchestratorClient::new(server.uri());
        let err = client
            .send::<serde_json::Value>(client.client.get(client.url("/health")))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ParseError(_)));
    }
}
