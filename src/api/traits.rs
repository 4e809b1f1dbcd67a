//! IssueTrackerApi trait definition
//!
//! The REST boundary consumed by the sync core. `HttpApi` implements it over
//! reqwest; tests use the in-memory `MockApi`.

use crate::error::SyncResult;
use crate::models::{Issue, IssueQuery, IssueRequest, Page, Project, ProjectRequest};
use async_trait::async_trait;

/// Abstract interface over the issue-tracker REST endpoints.
///
/// Every method maps to exactly one HTTP call. Failures are already
/// classified into `SyncError` variants when they reach the caller.
#[async_trait]
pub trait IssueTrackerApi: Send + Sync {
    // ========================================================================
    // Projects
    // ========================================================================

    /// `GET /projects`
    async fn list_projects(&self) -> SyncResult<Vec<Project>>;

    /// `POST /projects`
    async fn create_project(&self, request: &ProjectRequest) -> SyncResult<Project>;

    /// `GET /projects/{id}`
    async fn get_project(&self, id: i64) -> SyncResult<Project>;

    /// `PUT /projects/{id}`
    async fn update_project(&self, id: i64, request: &ProjectRequest) -> SyncResult<Project>;

    /// `DELETE /projects/{id}`
    async fn delete_project(&self, id: i64) -> SyncResult<()>;

    // ========================================================================
    // Issues
    // ========================================================================

    /// `GET /issues?projectId&page&size&status&priority&searchText&sortBy&sortOrder`
    async fn list_issues(&self, query: &IssueQuery) -> SyncResult<Page<Issue>>;

    /// `GET /issues/{id}`
    async fn get_issue(&self, id: i64) -> SyncResult<Issue>;

    /// `POST /issues`
    async fn create_issue(&self, request: &IssueRequest) -> SyncResult<Issue>;

    /// `PUT /issues/{id}`
    async fn update_issue(&self, id: i64, request: &IssueRequest) -> SyncResult<Issue>;

    /// `DELETE /issues/{id}`
    async fn delete_issue(&self, id: i64) -> SyncResult<()>;
}
