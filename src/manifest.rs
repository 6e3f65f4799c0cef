//! Remote manifest service client
//!
//! The manifest is the service's record of what it already indexed for a
//! branch. It is strictly optional: every failure here degrades to a scan
//! without one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{Result, WatchError};

/// Previously indexed file and chunk counts for one branch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestSummary {
    pub total_files: u64,
    pub total_chunks: u64,
    pub last_updated: DateTime<Utc>,
}

/// Source of branch manifests
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ManifestSource: Send + Sync {
    /// Fetch the manifest for `branch`; fails when none exists
    async fn fetch(&self, branch: &str) -> Result<ManifestSummary>;
}

/// HTTP client for the manifest service
pub struct HttpManifestClient {
    client: reqwest::Client,
    base_url: String,
    org_id: String,
    project_id: String,
    token: Option<String>,
}

impl HttpManifestClient {
    pub fn new(
        base_url: impl Into<String>,
        org_id: impl Into<String>,
        project_id: impl Into<String>,
        token: Option<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            org_id: org_id.into(),
            project_id: project_id.into(),
            token,
        }
    }

    /// Build a client from config, or `None` when the manifest service is disabled
    pub fn from_config(config: &Config) -> Option<Self> {
        if !config.manifest.enabled {
            return None;
        }

        let token = config.manifest_token();
        if token.is_none() {
            info!(
                "No manifest token in ${}, requests will be unauthenticated",
                config.manifest.token_env
            );
        }

        Some(Self::new(
            &config.manifest.base_url,
            &config.manifest.org_id,
            &config.manifest.project_id,
            token,
        ))
    }

    fn manifest_url(&self) -> String {
        format!(
            "{}/orgs/{}/projects/{}/manifest",
            self.base_url, self.org_id, self.project_id
        )
    }
}

#[async_trait]
impl ManifestSource for HttpManifestClient {
    async fn fetch(&self, branch: &str) -> Result<ManifestSummary> {
        let url = self.manifest_url();
        debug!("Fetching manifest for {} from {}", branch, url);

        let mut request = self.client.get(&url).query(&[("branch", branch)]);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| WatchError::ManifestUnavailable(format!("request failed: {}", e)))?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => {
                return Err(WatchError::ManifestUnavailable(format!(
                    "no manifest for branch {}",
                    branch
                )))
            }
            status => {
                return Err(WatchError::ManifestUnavailable(format!(
                    "service returned {}",
                    status
                )))
            }
        }

        response
            .json::<ManifestSummary>()
            .await
            .map_err(|e| WatchError::ManifestUnavailable(format!("invalid manifest body: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer, token: Option<&str>) -> HttpManifestClient {
        HttpManifestClient::new(
            format!("{}/", server.uri()),
            "acme",
            "web",
            token.map(str::to_string),
        )
    }

    #[tokio::test]
    async fn test_fetch_manifest() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/orgs/acme/projects/web/manifest"))
            .and(query_param("branch", "main"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "total_files": 120,
                "total_chunks": 940,
                "last_updated": "2025-03-01T12:00:00Z"
            })))
            .mount(&server)
            .await;

        let manifest = client_for(&server, Some("secret"))
            .fetch("main")
            .await
            .unwrap();

        assert_eq!(manifest.total_files, 120);
        assert_eq!(manifest.total_chunks, 940);
        assert_eq!(manifest.last_updated.to_rfc3339(), "2025-03-01T12:00:00+00:00");
    }

    #[tokio::test]
    async fn test_missing_manifest_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let result = client_for(&server, None).fetch("feature-x").await;
        assert_matches!(result, Err(WatchError::ManifestUnavailable(msg)) if msg.contains("feature-x"));
    }

    #[tokio::test]
    async fn test_server_error_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let result = client_for(&server, None).fetch("main").await;
        assert_matches!(result, Err(WatchError::ManifestUnavailable(_)));
    }

    #[tokio::test]
    async fn test_malformed_body_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let result = client_for(&server, None).fetch("main").await;
        assert_matches!(result, Err(WatchError::ManifestUnavailable(_)));
    }

    #[test]
    fn test_disabled_config_builds_no_client() {
        let config = Config::default();
        assert!(HttpManifestClient::from_config(&config).is_none());
    }
}
