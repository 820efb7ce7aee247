//! Cloud Storage adapter
//!
//! Talks to the Cloud Storage JSON API directly with `reqwest`.

use async_trait::async_trait;
use reqwest::{StatusCode, Url};

use super::{ObjectStore, StorageError};
use crate::credentials::Credentials;

pub const DEFAULT_BASE_URL: &str = "https://storage.googleapis.com";

/// Bucket-scoped Cloud Storage client
#[derive(Debug, Clone)]
pub struct GcsObjectStore {
    http: reqwest::Client,
    credentials: Credentials,
    bucket: String,
    base_url: String,
}

impl GcsObjectStore {
    pub fn new(http: reqwest::Client, credentials: Credentials, bucket: impl Into<String>) -> Self {
        Self {
            http,
            credentials,
            bucket: bucket.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Points the client at a different endpoint (emulators, tests)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn url(&self, segments: &[&str]) -> Result<Url, StorageError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| StorageError::InvalidUrl(format!("{}: {}", self.base_url, e)))?;
        url.path_segments_mut()
            .map_err(|_| StorageError::InvalidUrl(self.base_url.clone()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

#[async_trait]
impl ObjectStore for GcsObjectStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let mut url = self.url(&["storage", "v1", "b", &self.bucket, "o", key])?;
        url.query_pairs_mut().append_pair("alt", "media");

        let token = self.credentials.token().await?;
        let response = self.http.get(url).bearer_auth(token).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.bytes().await?.to_vec())),
            status => Err(StorageError::Status {
                status: status.as_u16(),
                key: key.to_string(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), StorageError> {
        let mut url = self.url(&["upload", "storage", "v1", "b", &self.bucket, "o"])?;
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("name", key);

        let token = self.credentials.token().await?;
        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(StorageError::Status {
                status: status.as_u16(),
                key: key.to_string(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        tracing::debug!("Uploaded gs://{}/{}", self.bucket, key);
        Ok(())
    }

    fn uri(&self, key: &str) -> String {
        format!("gs://{}/{}", self.bucket, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn store(server: &MockServer) -> GcsObjectStore {
        GcsObjectStore::new(reqwest::Client::new(), Credentials::fixed("tok"), "artifacts")
            .with_base_url(server.uri())
    }

    #[tokio::test]
    async fn test_get_encodes_object_name() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/artifacts/o/jobs%2Fp%2Fstatus.json"))
            .and(query_param("alt", "media"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"status":"running"}"#))
            .mount(&server)
            .await;

        let body = store(&server).await.get("jobs/p/status.json").await.unwrap();
        assert_eq!(body.unwrap(), br#"{"status":"running"}"#.to_vec());
    }

    #[tokio::test]
    async fn test_get_missing_object_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        assert!(store(&server).await.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_server_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&server)
            .await;

        match store(&server).await.get("k").await {
            Err(StorageError::Status { status, .. }) => assert_eq!(status, 503),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_put_uses_media_upload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload/storage/v1/b/artifacts/o"))
            .and(query_param("uploadType", "media"))
            .and(query_param("name", "jobs/p/script.py"))
            .and(header("content-type", "text/x-python"))
            .and(body_string("print(1)"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;

        store(&server)
            .await
            .put("jobs/p/script.py", b"print(1)".to_vec(), "text/x-python")
            .await
            .unwrap();
    }

    #[test]
    fn test_uri() {
        let store = GcsObjectStore::new(reqwest::Client::new(), Credentials::fixed("t"), "b");
        assert_eq!(store.uri("jobs/x/script.py"), "gs://b/jobs/x/script.py");
    }
}
