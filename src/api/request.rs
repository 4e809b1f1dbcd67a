//! Requests as data
//!
//! The mutation manager and the query coordinator never perform I/O. They
//! return `ApiRequest` values; the session engine executes them against an
//! `IssueTrackerApi` and feeds the `ApiResponse` back.

use super::traits::IssueTrackerApi;
use crate::error::SyncResult;
use crate::models::{
    Entity, EntityKind, Issue, IssueQuery, IssueRequest, Page, Project, ProjectRequest,
};
use std::fmt;

/// One REST call, described but not yet executed
#[derive(Debug, Clone, PartialEq)]
pub enum ApiRequest {
    ListProjects,
    ListIssues(IssueQuery),
    GetProject(i64),
    GetIssue(i64),
    CreateProject(ProjectRequest),
    UpdateProject(i64, ProjectRequest),
    DeleteProject(i64),
    CreateIssue(IssueRequest),
    UpdateIssue(i64, IssueRequest),
    DeleteIssue(i64),
}

/// Decoded result of an `ApiRequest`
#[derive(Debug, Clone, PartialEq)]
pub enum ApiResponse {
    Projects(Vec<Project>),
    IssuePage(Page<Issue>),
    Entity(Entity),
    Deleted,
}

impl ApiRequest {
    /// `GET /{kind}s/{id}`
    pub fn get(kind: EntityKind, id: i64) -> Self {
        match kind {
            EntityKind::Project => ApiRequest::GetProject(id),
            EntityKind::Issue => ApiRequest::GetIssue(id),
        }
    }

    /// `DELETE /{kind}s/{id}`
    pub fn delete(kind: EntityKind, id: i64) -> Self {
        match kind {
            EntityKind::Project => ApiRequest::DeleteProject(id),
            EntityKind::Issue => ApiRequest::DeleteIssue(id),
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            ApiRequest::ListProjects
            | ApiRequest::ListIssues(_)
            | ApiRequest::GetProject(_)
            | ApiRequest::GetIssue(_) => "GET",
            ApiRequest::CreateProject(_) | ApiRequest::CreateIssue(_) => "POST",
            ApiRequest::UpdateProject(..) | ApiRequest::UpdateIssue(..) => "PUT",
            ApiRequest::DeleteProject(_) | ApiRequest::DeleteIssue(_) => "DELETE",
        }
    }

    /// Path relative to the API base URL
    pub fn path(&self) -> String {
        match self {
            ApiRequest::ListProjects | ApiRequest::CreateProject(_) => "/projects".to_string(),
            ApiRequest::ListIssues(_) | ApiRequest::CreateIssue(_) => "/issues".to_string(),
            ApiRequest::GetProject(id)
            | ApiRequest::UpdateProject(id, _)
            | ApiRequest::DeleteProject(id) => format!("/projects/{}", id),
            ApiRequest::GetIssue(id) | ApiRequest::UpdateIssue(id, _) | ApiRequest::DeleteIssue(id) => {
                format!("/issues/{}", id)
            }
        }
    }

    /// Run the request against `api`
    pub async fn execute(self, api: &dyn IssueTrackerApi) -> SyncResult<ApiResponse> {
        Ok(match self {
            ApiRequest::ListProjects => ApiResponse::Projects(api.list_projects().await?),
            ApiRequest::ListIssues(query) => ApiResponse::IssuePage(api.list_issues(&query).await?),
            ApiRequest::GetProject(id) => ApiResponse::Entity(api.get_project(id).await?.into()),
            ApiRequest::GetIssue(id) => ApiResponse::Entity(api.get_issue(id).await?.into()),
            ApiRequest::CreateProject(body) => {
                ApiResponse::Entity(api.create_project(&body).await?.into())
            }
            ApiRequest::UpdateProject(id, body) => {
                ApiResponse::Entity(api.update_project(id, &body).await?.into())
            }
            ApiRequest::DeleteProject(id) => {
                api.delete_project(id).await?;
                ApiResponse::Deleted
            }
            ApiRequest::CreateIssue(body) => ApiResponse::Entity(api.create_issue(&body).await?.into()),
            ApiRequest::UpdateIssue(id, body) => {
                ApiResponse::Entity(api.update_issue(id, &body).await?.into())
            }
            ApiRequest::DeleteIssue(id) => {
                api.delete_issue(id).await?;
                ApiResponse::Deleted
            }
        })
    }
}

impl fmt::Display for ApiRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method(), self.path())
    }
}
