//! Test helper factories and seeded state builders
//!
//! Provides convenience functions for creating entities, pages and stores
//! with sensible defaults.
#![allow(dead_code)]

use crate::api::ApiResponse;
use crate::models::*;
use crate::store::{EntityStore, Pagination};
use chrono::{TimeZone, Utc};

// ============================================================================
// Entity factories
// ============================================================================

/// Create a test project with the given server id and name
pub fn project(id: i64, name: &str) -> Project {
    Project {
        id: EntityId::Server(id),
        name: name.to_string(),
        owner_id: Some(1),
        owner_name: Some("Owner".to_string()),
        created_at: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
        updated_at: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
    }
}

/// Create a test issue with the given server id, project and title
pub fn issue(id: i64, project_id: i64, title: &str) -> Issue {
    issue_with_id(EntityId::Server(id), project_id, title)
}

pub fn issue_with_id(id: EntityId, project_id: i64, title: &str) -> Issue {
    Issue {
        id,
        project_id: EntityId::Server(project_id),
        project_name: None,
        title: title.to_string(),
        description: String::new(),
        status: IssueStatus::Open,
        priority: IssuePriority::Medium,
        assignee_id: None,
        assignee_name: None,
        reporter_id: Some(1),
        reporter_name: Some("Reporter".to_string()),
        tags: Vec::new(),
        created_at: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
        updated_at: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
        version: Some(0),
    }
}

/// Issue last updated on day `day` of January 2024, at the given version
pub fn issue_at(id: i64, project_id: i64, title: &str, day: u32, version: i64) -> Issue {
    let mut issue = issue(id, project_id, title);
    issue.updated_at = Some(Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap());
    issue.version = Some(version);
    issue
}

pub fn make_project(id: i64, name: &str) -> Entity {
    Entity::Project(project(id, name))
}

pub fn make_issue(id: i64, project_id: i64, title: &str) -> Entity {
    Entity::Issue(issue(id, project_id, title))
}

pub fn make_issue_with_id(id: EntityId, project_id: i64, title: &str) -> Entity {
    Entity::Issue(issue_with_id(id, project_id, title))
}

// ============================================================================
// Pages and queries
// ============================================================================

/// Default issue query for a project (page 0, size 20, createdAt desc)
pub fn issue_query(project_id: i64) -> IssueQuery {
    IssueQuery {
        project_id,
        page: 0,
        size: 20,
        status: None,
        priority: None,
        search_text: None,
        sort_by: SortField::CreatedAt,
        sort_order: SortDirection::Desc,
    }
}

/// Single page holding all `issues`
pub fn issue_page(issues: Vec<Issue>) -> Page<Issue> {
    let total = issues.len() as u64;
    Page {
        content: issues,
        total_elements: total,
        total_pages: if total == 0 { 0 } else { 1 },
        size: 20,
        number: 0,
    }
}

pub fn page_response(issues: Vec<Issue>) -> ApiResponse {
    ApiResponse::IssuePage(issue_page(issues))
}

// ============================================================================
// Seeded stores
// ============================================================================

/// Store holding the given issues of one project, listed in its issue view
pub fn seeded_issue_store(project_id: i64, issues: &[(i64, &str)]) -> EntityStore {
    let mut store = EntityStore::new();
    let mut ids = Vec::new();
    for (id, title) in issues {
        store.upsert(make_issue(*id, project_id, title));
        ids.push(EntityId::Server(*id));
    }
    store.set_view(
        ViewKey::issues_of(project_id),
        ids,
        Pagination {
            page: 0,
            size: 20,
            total_elements: issues.len() as u64,
            total_pages: issues.len().div_ceil(20) as u32,
        },
    );
    store
}

/// Store holding the given projects, listed in the project view
pub fn seeded_project_store(projects: &[(i64, &str)]) -> EntityStore {
    let mut store = EntityStore::new();
    let mut ids = Vec::new();
    for (id, name) in projects {
        store.upsert(make_project(*id, name));
        ids.push(EntityId::Server(*id));
    }
    store.set_view(ViewKey::projects(), ids, Pagination::unpaged(projects.len()));
    store
}
