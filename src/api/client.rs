//! reqwest-backed implementation of IssueTrackerApi
//!
//! Every call carries `Authorization: Bearer <token>` taken from a
//! `TokenProvider`. When no token is available the call fails with
//! `SyncError::Auth` before anything is sent.

use super::traits::IssueTrackerApi;
use crate::auth::TokenProvider;
use crate::error::{SyncError, SyncResult};
use crate::models::{Issue, IssueQuery, IssueRequest, Page, Project, ProjectRequest};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// HTTP client for the issue-tracker REST API
#[derive(Clone)]
pub struct HttpApi {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpApi {
    /// Create a client for `base_url` (e.g. `http://localhost:8080/api`).
    ///
    /// `timeout` bounds each request end to end; an elapsed timeout surfaces
    /// as `SyncError::Network`.
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        tokens: Arc<dyn TokenProvider>,
    ) -> SyncResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("issue-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::Network(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> SyncResult<RequestBuilder> {
        let token = self
            .tokens
            .token()
            .ok_or_else(SyncError::missing_credential)?;
        let url = format!("{}{}", self.base_url, path);
        Ok(self.http.request(method, url).bearer_auth(token))
    }

    async fn send(&self, builder: RequestBuilder, label: &str) -> SyncResult<Response> {
        let response = builder.send().await.map_err(|e| {
            warn!(request = %label, "Request failed: {}", e);
            SyncError::from(e)
        })?;
        let status = response.status();
        debug!(request = %label, status = status.as_u16(), "Response received");
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(SyncError::from_status(status.as_u16(), &body))
    }

    async fn fetch<T: DeserializeOwned>(&self, builder: RequestBuilder, label: &str) -> SyncResult<T> {
        let response = self.send(builder, label).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| SyncError::Decode(format!("{}: {}", label, e)))
    }
}

#[async_trait]
impl IssueTrackerApi for HttpApi {
    async fn list_projects(&self) -> SyncResult<Vec<Project>> {
        let req = self.request(Method::GET, "/projects")?;
        self.fetch(req, "GET /projects").await
    }

    async fn create_project(&self, request: &ProjectRequest) -> SyncResult<Project> {
        let req = self.request(Method::POST, "/projects")?.json(request);
        self.fetch(req, "POST /projects").await
    }

    async fn get_project(&self, id: i64) -> SyncResult<Project> {
        let path = format!("/projects/{}", id);
        let req = self.request(Method::GET, &path)?;
        self.fetch(req, &format!("GET {}", path)).await
    }

    async fn update_project(&self, id: i64, request: &ProjectRequest) -> SyncResult<Project> {
        let path = format!("/projects/{}", id);
        let req = self.request(Method::PUT, &path)?.json(request);
        self.fetch(req, &format!("PUT {}", path)).await
    }

    async fn delete_project(&self, id: i64) -> SyncResult<()> {
        let path = format!("/projects/{}", id);
        let req = self.request(Method::DELETE, &path)?;
        self.send(req, &format!("DELETE {}", path)).await?;
        Ok(())
    }

    async fn list_issues(&self, query: &IssueQuery) -> SyncResult<Page<Issue>> {
        let req = self.request(Method::GET, "/issues")?.query(query);
        self.fetch(req, "GET /issues").await
    }

    async fn get_issue(&self, id: i64) -> SyncResult<Issue> {
        let path = format!("/issues/{}", id);
        let req = self.request(Method::GET, &path)?;
        self.fetch(req, &format!("GET {}", path)).await
    }

    async fn create_issue(&self, request: &IssueRequest) -> SyncResult<Issue> {
        let req = self.request(Method::POST, "/issues")?.json(request);
        self.fetch(req, "POST /issues").await
    }

    async fn update_issue(&self, id: i64, request: &IssueRequest) -> SyncResult<Issue> {
        let path = format!("/issues/{}", id);
        let req = self.request(Method::PUT, &path)?.json(request);
        self.fetch(req, &format!("PUT {}", path)).await
    }

    async fn delete_issue(&self, id: i64) -> SyncResult<()> {
        let path = format!("/issues/{}", id);
        let req = self.request(Method::DELETE, &path)?;
        self.send(req, &format!("DELETE {}", path)).await?;
        Ok(())
    }
}
