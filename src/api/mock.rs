//! In-memory mock implementation of IssueTrackerApi for testing.
//!
//! Behaves like a tiny issue-tracker server backed by
//! `tokio::sync::RwLock<BTreeMap<K, V>>` collections, with a request log,
//! scripted failures and gates that hold a response until released.
//! Conditionally compiled with `#[cfg(test)]`.

use super::traits::IssueTrackerApi;
use crate::error::{SyncError, SyncResult};
use crate::models::{
    EntityId, Issue, IssueQuery, IssueRequest, Page, Project, ProjectRequest, SortDirection,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};

/// Handle that releases one held call
#[derive(Clone)]
pub struct Gate {
    permit: Arc<Semaphore>,
}

impl Gate {
    pub fn release(&self) {
        self.permit.add_permits(1);
    }
}

/// In-memory mock implementation of IssueTrackerApi for testing.
pub struct MockApi {
    pub projects: RwLock<BTreeMap<i64, Project>>,
    pub issues: RwLock<BTreeMap<i64, Issue>>,
    next_id: AtomicI64,
    log: RwLock<Vec<String>>,
    failures: RwLock<HashMap<String, VecDeque<SyncError>>>,
    gates: RwLock<HashMap<String, VecDeque<Gate>>>,
}

impl MockApi {
    pub fn new() -> Self {
        Self {
            projects: RwLock::new(BTreeMap::new()),
            issues: RwLock::new(BTreeMap::new()),
            next_id: AtomicI64::new(100),
            log: RwLock::new(Vec::new()),
            failures: RwLock::new(HashMap::new()),
            gates: RwLock::new(HashMap::new()),
        }
    }

    pub async fn seed_project(&self, project: Project) {
        if let Some(id) = project.id.server() {
            self.projects.write().await.insert(id, project);
        }
    }

    pub async fn seed_issue(&self, issue: Issue) {
        if let Some(id) = issue.id.server() {
            self.issues.write().await.insert(id, issue);
        }
    }

    /// Make the next `call` (e.g. `"POST /issues"`) fail with `error`
    pub async fn fail_next(&self, call: &str, error: SyncError) {
        self.failures
            .write()
            .await
            .entry(call.to_string())
            .or_default()
            .push_back(error);
    }

    /// Hold the next `call` until the returned gate is released.
    ///
    /// The response is computed after release, from the state at that time.
    pub async fn hold(&self, call: &str) -> Gate {
        let gate = Gate {
            permit: Arc::new(Semaphore::new(0)),
        };
        self.gates
            .write()
            .await
            .entry(call.to_string())
            .or_default()
            .push_back(gate.clone());
        gate
    }

    /// Calls received so far, as `"METHOD /path"`
    pub async fn requests(&self) -> Vec<String> {
        self.log.read().await.clone()
    }

    pub async fn count(&self, call: &str) -> usize {
        self.log.read().await.iter().filter(|c| c.as_str() == call).count()
    }

    async fn enter(&self, call: String) -> SyncResult<()> {
        self.log.write().await.push(call.clone());
        let gate = self
            .gates
            .write()
            .await
            .get_mut(&call)
            .and_then(|q| q.pop_front());
        if let Some(gate) = gate {
            if let Ok(permit) = gate.permit.acquire().await {
                permit.forget();
            }
        }
        let failure = self
            .failures
            .write()
            .await
            .get_mut(&call)
            .and_then(|q| q.pop_front());
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for MockApi {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(what: &str, id: i64) -> SyncError {
    SyncError::NotFound(format!("{} {} not found", what, id))
}

#[async_trait]
impl IssueTrackerApi for MockApi {
    async fn list_projects(&self) -> SyncResult<Vec<Project>> {
        self.enter("GET /projects".into()).await?;
        Ok(self.projects.read().await.values().cloned().collect())
    }

    async fn create_project(&self, request: &ProjectRequest) -> SyncResult<Project> {
        self.enter("POST /projects".into()).await?;
        let id = self.allocate_id();
        let now = Utc::now();
        let project = Project {
            id: EntityId::Server(id),
            name: request.name.clone(),
            owner_id: Some(1),
            owner_name: Some("Owner".into()),
            created_at: Some(now),
            updated_at: Some(now),
        };
        self.projects.write().await.insert(id, project.clone());
        Ok(project)
    }

    async fn get_project(&self, id: i64) -> SyncResult<Project> {
        self.enter(format!("GET /projects/{}", id)).await?;
        self.projects
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("project", id))
    }

    async fn update_project(&self, id: i64, request: &ProjectRequest) -> SyncResult<Project> {
        self.enter(format!("PUT /projects/{}", id)).await?;
        let mut projects = self.projects.write().await;
        let project = projects.get_mut(&id).ok_or_else(|| not_found("project", id))?;
        project.name = request.name.clone();
        project.updated_at = Some(Utc::now());
        Ok(project.clone())
    }

    async fn delete_project(&self, id: i64) -> SyncResult<()> {
        self.enter(format!("DELETE /projects/{}", id)).await?;
        self.projects
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| not_found("project", id))
    }

    async fn list_issues(&self, query: &IssueQuery) -> SyncResult<Page<Issue>> {
        self.enter("GET /issues".into()).await?;
        let issues = self.issues.read().await;
        let mut matching: Vec<Issue> = issues
            .values()
            .filter(|i| i.project_id == EntityId::Server(query.project_id))
            .filter(|i| query.status.is_none_or(|s| i.status == s))
            .filter(|i| query.priority.is_none_or(|p| i.priority == p))
            .filter(|i| {
                query
                    .search_text
                    .as_ref()
                    .is_none_or(|t| i.title.to_lowercase().contains(&t.to_lowercase()))
            })
            .cloned()
            .collect();
        if query.sort_order == SortDirection::Desc {
            matching.reverse();
        }

        let total = matching.len() as u64;
        let size = query.size.max(1);
        let content = matching
            .into_iter()
            .skip((query.page * size) as usize)
            .take(size as usize)
            .collect();
        Ok(Page {
            content,
            total_elements: total,
            total_pages: total.div_ceil(size as u64) as u32,
            size,
            number: query.page,
        })
    }

    async fn get_issue(&self, id: i64) -> SyncResult<Issue> {
        self.enter(format!("GET /issues/{}", id)).await?;
        self.issues
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("issue", id))
    }

    async fn create_issue(&self, request: &IssueRequest) -> SyncResult<Issue> {
        self.enter("POST /issues".into()).await?;
        let project_id = request.project_id.ok_or_else(|| SyncError::Validation {
            message: "projectId is required".into(),
            field_errors: [("projectId".to_string(), "must not be null".to_string())].into(),
        })?;
        let id = self.allocate_id();
        let now = Utc::now();
        let issue = Issue {
            id: EntityId::Server(id),
            project_id: EntityId::Server(project_id),
            project_name: None,
            title: request.title.clone(),
            description: request.description.clone(),
            status: request.status.unwrap_or_default(),
            priority: request.priority.unwrap_or_default(),
            assignee_id: request.assignee_id.flatten(),
            assignee_name: None,
            reporter_id: Some(1),
            reporter_name: Some("Reporter".into()),
            tags: request.tags.clone().unwrap_or_default(),
            created_at: Some(now),
            updated_at: Some(now),
            version: Some(0),
        };
        self.issues.write().await.insert(id, issue.clone());
        Ok(issue)
    }

    async fn update_issue(&self, id: i64, request: &IssueRequest) -> SyncResult<Issue> {
        self.enter(format!("PUT /issues/{}", id)).await?;
        let mut issues = self.issues.write().await;
        let issue = issues.get_mut(&id).ok_or_else(|| not_found("issue", id))?;
        issue.title = request.title.clone();
        issue.description = request.description.clone();
        if let Some(status) = request.status {
            issue.status = status;
        }
        if let Some(priority) = request.priority {
            issue.priority = priority;
        }
        if let Some(tags) = &request.tags {
            issue.tags = tags.clone();
        }
        if let Some(assignee_id) = request.assignee_id {
            issue.assignee_id = assignee_id;
        }
        issue.updated_at = Some(Utc::now());
        issue.version = Some(issue.version.unwrap_or(0) + 1);
        Ok(issue.clone())
    }

    async fn delete_issue(&self, id: i64) -> SyncResult<()> {
        self.enter(format!("DELETE /issues/{}", id)).await?;
        self.issues
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| not_found("issue", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IssueStatus;
    use crate::test_helpers::*;

    #[tokio::test]
    async fn test_mock_filters_and_pages_issues() {
        let api = MockApi::new();
        for id in 1..=5 {
            let mut i = issue(id, 3, &format!("issue {}", id));
            if id % 2 == 0 {
                i.status = IssueStatus::Closed;
            }
            api.seed_issue(i).await;
        }
        api.seed_issue(issue(9, 4, "other project")).await;

        let mut query = issue_query(3);
        query.status = Some(IssueStatus::Open);
        let page = api.list_issues(&query).await.unwrap();
        assert_eq!(page.total_elements, 3);
        assert_eq!(page.content[0].id, EntityId::Server(5));

        query.size = 2;
        query.page = 1;
        let page = api.list_issues(&query).await.unwrap();
        assert_eq!(page.content.len(), 1);
        assert_eq!(page.total_pages, 2);
    }

    #[tokio::test]
    async fn test_mock_scripted_failure_applies_once() {
        let api = MockApi::new();
        api.fail_next("GET /projects", SyncError::Network("offline".into()))
            .await;
        assert!(api.list_projects().await.is_err());
        assert!(api.list_projects().await.is_ok());
        assert_eq!(api.count("GET /projects").await, 2);
    }

    #[tokio::test]
    async fn test_mock_gate_holds_until_released() {
        let api = Arc::new(MockApi::new());
        let gate = api.hold("GET /projects").await;

        let task = {
            let api = api.clone();
            tokio::spawn(async move { api.list_projects().await })
        };
        tokio::task::yield_now().await;
        assert!(!task.is_finished());

        gate.release();
        assert!(task.await.unwrap().is_ok());
    }
}
