//! Entity, identity and wire models
//!
//! Server entities (`Project`, `Issue`) deserialize straight from the REST
//! payloads (camelCase fields, SCREAMING_SNAKE_CASE enums). Identity is carried
//! by `EntityId`, which keeps client-assigned temp ids in a separate space from
//! server-assigned ids so the two can never collide.

use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Identity
// ============================================================================

/// The two entity kinds known to the sync core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Project,
    Issue,
}

impl EntityKind {
    /// REST collection segment (`projects`, `issues`)
    pub fn collection(&self) -> &'static str {
        match self {
            EntityKind::Project => "projects",
            EntityKind::Issue => "issues",
        }
    }

    /// Lenient parse used by push-message decoding
    pub fn parse_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "project" | "projects" => Some(EntityKind::Project),
            "issue" | "issues" => Some(EntityKind::Issue),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Project => write!(f, "project"),
            EntityKind::Issue => write!(f, "issue"),
        }
    }
}

/// Client-assigned provisional id. Never sent to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TempId(u64);

impl TempId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TempId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tmp-{}", self.0)
    }
}

/// Allocates temp ids for optimistic creates.
///
/// Ids are strictly increasing for the life of the allocator and are never
/// handed out twice, even after the entity they named has been reconciled.
#[derive(Debug)]
pub struct TempIdAllocator {
    next: u64,
}

impl TempIdAllocator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn allocate(&mut self) -> TempId {
        let id = TempId(self.next);
        self.next += 1;
        id
    }
}

impl Default for TempIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity of an entity: either server-assigned or a client temp id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityId {
    Server(i64),
    Temp(TempId),
}

impl EntityId {
    pub fn server(&self) -> Option<i64> {
        match self {
            EntityId::Server(id) => Some(*id),
            EntityId::Temp(_) => None,
        }
    }

    pub fn is_temp(&self) -> bool {
        matches!(self, EntityId::Temp(_))
    }

    /// Server id, or `InvalidOperation` when the entity is still provisional
    pub fn require_server(&self, what: &str) -> SyncResult<i64> {
        self.server().ok_or_else(|| {
            SyncError::InvalidOperation(format!("{} {} is not confirmed by the server yet", what, self))
        })
    }
}

impl From<i64> for EntityId {
    fn from(id: i64) -> Self {
        EntityId::Server(id)
    }
}

impl From<TempId> for EntityId {
    fn from(id: TempId) -> Self {
        EntityId::Temp(id)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Server(id) => write!(f, "{}", id),
            EntityId::Temp(t) => write!(f, "{}", t),
        }
    }
}

impl FromStr for EntityId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(n) = s.strip_prefix("tmp-") {
            return n
                .parse::<u64>()
                .map(|n| EntityId::Temp(TempId(n)))
                .map_err(|_| SyncError::InvalidOperation(format!("malformed temp id: {}", s)));
        }
        s.parse::<i64>()
            .map(EntityId::Server)
            .map_err(|_| SyncError::InvalidOperation(format!("malformed entity id: {}", s)))
    }
}

impl Serialize for EntityId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            EntityId::Server(id) => serializer.serialize_i64(*id),
            EntityId::Temp(t) => serializer.serialize_str(&t.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(i64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Num(n) => Ok(EntityId::Server(n)),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Store key: one record per (kind, id)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id: EntityId,
}

impl EntityKey {
    pub fn new(kind: EntityKind, id: impl Into<EntityId>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// Relational scope of a list view or an invalidation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    /// Unscoped (the project list)
    All,
    /// Issues belonging to one project
    Project(EntityId),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::All => write!(f, "all"),
            Scope::Project(id) => write!(f, "project:{}", id),
        }
    }
}

/// Identity of a list view: which entities, within which scope.
///
/// Filter, sort and page parameters are the view's mutable state, not part
/// of its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewKey {
    pub kind: EntityKind,
    pub scope: Scope,
}

impl ViewKey {
    /// The project list
    pub fn projects() -> Self {
        Self {
            kind: EntityKind::Project,
            scope: Scope::All,
        }
    }

    /// The issue list of one project
    pub fn issues_of(project_id: impl Into<EntityId>) -> Self {
        Self {
            kind: EntityKind::Issue,
            scope: Scope::Project(project_id.into()),
        }
    }

    /// Whether an entity of `kind` in `scope` belongs in this view
    pub fn contains(&self, kind: EntityKind, scope: &Scope) -> bool {
        self.kind == kind && (self.scope == Scope::All || &self.scope == scope)
    }
}

impl fmt::Display for ViewKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s@{}", self.kind, self.scope)
    }
}

// ============================================================================
// Entities
// ============================================================================

/// Issue workflow status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueStatus {
    #[default]
    Open,
    InProgress,
    Closed,
}

impl FromStr for IssueStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "OPEN" => Ok(IssueStatus::Open),
            "IN_PROGRESS" => Ok(IssueStatus::InProgress),
            "CLOSED" => Ok(IssueStatus::Closed),
            other => Err(SyncError::InvalidOperation(format!("unknown status: {}", other))),
        }
    }
}

/// Issue priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssuePriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl FromStr for IssuePriority {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOW" => Ok(IssuePriority::Low),
            "MEDIUM" => Ok(IssuePriority::Medium),
            "HIGH" => Ok(IssuePriority::High),
            "CRITICAL" => Ok(IssuePriority::Critical),
            other => Err(SyncError::InvalidOperation(format!("unknown priority: {}", other))),
        }
    }
}

/// A project as returned by `GET /projects/{id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: EntityId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_name: Option<String>,
    #[serde(
        default,
        deserialize_with = "timestamp::deserialize_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        deserialize_with = "timestamp::deserialize_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub updated_at: Option<DateTime<Utc>>,
}

/// An issue as returned by `GET /issues/{id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub id: EntityId,
    pub project_id: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    pub title: String,
    #[serde(default, deserialize_with = "null_default")]
    pub description: String,
    #[serde(default, deserialize_with = "null_default")]
    pub status: IssueStatus,
    #[serde(default, deserialize_with = "null_default")]
    pub priority: IssuePriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reporter_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reporter_name: Option<String>,
    #[serde(default, deserialize_with = "null_default")]
    pub tags: Vec<String>,
    #[serde(
        default,
        deserialize_with = "timestamp::deserialize_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        deserialize_with = "timestamp::deserialize_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
}

/// A cached entity of either kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entity {
    Project(Project),
    Issue(Issue),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Project(_) => EntityKind::Project,
            Entity::Issue(_) => EntityKind::Issue,
        }
    }

    pub fn id(&self) -> EntityId {
        match self {
            Entity::Project(p) => p.id,
            Entity::Issue(i) => i.id,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.kind(), self.id())
    }

    pub fn set_id(&mut self, id: EntityId) {
        match self {
            Entity::Project(p) => p.id = id,
            Entity::Issue(i) => i.id = id,
        }
    }

    /// The list-view scope this entity falls into
    pub fn scope(&self) -> Scope {
        match self {
            Entity::Project(_) => Scope::All,
            Entity::Issue(i) => Scope::Project(i.project_id),
        }
    }

    /// Freshness hint
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Entity::Project(p) => p.updated_at,
            Entity::Issue(i) => i.updated_at,
        }
    }

    pub fn version(&self) -> Option<i64> {
        match self {
            Entity::Project(_) => None,
            Entity::Issue(i) => i.version,
        }
    }

    /// Whether this record is strictly newer than `other`.
    ///
    /// Versions decide when both sides carry one, `updated_at` otherwise.
    /// Ties and missing hints count as not newer.
    pub fn is_newer_than(&self, other: &Entity) -> bool {
        if let (Some(mine), Some(theirs)) = (self.version(), other.version()) {
            return mine > theirs;
        }
        match (self.updated_at(), other.updated_at()) {
            (Some(mine), Some(theirs)) => mine > theirs,
            _ => false,
        }
    }

    /// Human-readable label (project name / issue title)
    pub fn label(&self) -> &str {
        match self {
            Entity::Project(p) => &p.name,
            Entity::Issue(i) => &i.title,
        }
    }

    pub fn as_project(&self) -> Option<&Project> {
        match self {
            Entity::Project(p) => Some(p),
            Entity::Issue(_) => None,
        }
    }

    pub fn as_issue(&self) -> Option<&Issue> {
        match self {
            Entity::Issue(i) => Some(i),
            Entity::Project(_) => None,
        }
    }
}

impl From<Project> for Entity {
    fn from(p: Project) -> Self {
        Entity::Project(p)
    }
}

impl From<Issue> for Entity {
    fn from(i: Issue) -> Self {
        Entity::Issue(i)
    }
}

// ============================================================================
// Mutation payloads
// ============================================================================

/// Fields of a project to create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProject {
    pub name: String,
}

/// Fields of an issue to create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewIssue {
    pub project_id: EntityId,
    pub title: String,
    pub description: String,
    pub priority: IssuePriority,
    pub status: Option<IssueStatus>,
    pub assignee_id: Option<i64>,
    pub tags: Option<Vec<String>>,
}

impl NewIssue {
    pub fn new(project_id: impl Into<EntityId>, title: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            title: title.into(),
            description: String::new(),
            priority: IssuePriority::default(),
            status: None,
            assignee_id: None,
            tags: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: IssuePriority) -> Self {
        self.priority = priority;
        self
    }
}

/// Payload of an optimistic create
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreatePayload {
    Project(NewProject),
    Issue(NewIssue),
}

impl CreatePayload {
    pub fn project(name: impl Into<String>) -> Self {
        CreatePayload::Project(NewProject { name: name.into() })
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            CreatePayload::Project(_) => EntityKind::Project,
            CreatePayload::Issue(_) => EntityKind::Issue,
        }
    }

    /// Build the provisional entity shown until the server confirms.
    ///
    /// Server-owned fields are placeholders: no owner/reporter, timestamps = `now`.
    pub fn provisional(&self, id: EntityId, now: DateTime<Utc>) -> Entity {
        match self {
            CreatePayload::Project(p) => Entity::Project(Project {
                id,
                name: p.name.clone(),
                owner_id: None,
                owner_name: None,
                created_at: Some(now),
                updated_at: Some(now),
            }),
            CreatePayload::Issue(i) => Entity::Issue(Issue {
                id,
                project_id: i.project_id,
                project_name: None,
                title: i.title.clone(),
                description: i.description.clone(),
                status: i.status.unwrap_or_default(),
                priority: i.priority,
                assignee_id: i.assignee_id,
                assignee_name: None,
                reporter_id: None,
                reporter_name: None,
                tags: i.tags.clone().unwrap_or_default(),
                created_at: Some(now),
                updated_at: Some(now),
                version: None,
            }),
        }
    }
}

/// Partial update of a project
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectPatch {
    pub name: Option<String>,
}

/// Partial update of an issue
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IssuePatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<IssueStatus>,
    pub priority: Option<IssuePriority>,
    /// `Some(None)` unassigns
    pub assignee_id: Option<Option<i64>>,
    /// `Some(vec![])` clears every tag
    pub tags: Option<Vec<String>>,
}

impl IssuePatch {
    pub fn status(status: IssueStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Default::default()
        }
    }
}

/// Payload of an optimistic update
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityPatch {
    Project(ProjectPatch),
    Issue(IssuePatch),
}

impl EntityPatch {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityPatch::Project(_) => EntityKind::Project,
            EntityPatch::Issue(_) => EntityKind::Issue,
        }
    }

    /// Apply the patch on top of `entity`, returning the patched copy
    pub fn apply_to(&self, entity: &Entity) -> SyncResult<Entity> {
        match (self, entity) {
            (EntityPatch::Project(patch), Entity::Project(p)) => {
                let mut p = p.clone();
                if let Some(name) = &patch.name {
                    p.name = name.clone();
                }
                Ok(Entity::Project(p))
            }
            (EntityPatch::Issue(patch), Entity::Issue(i)) => {
                let mut i = i.clone();
                if let Some(title) = &patch.title {
                    i.title = title.clone();
                }
                if let Some(description) = &patch.description {
                    i.description = description.clone();
                }
                if let Some(status) = patch.status {
                    i.status = status;
                }
                if let Some(priority) = patch.priority {
                    i.priority = priority;
                }
                if let Some(assignee_id) = patch.assignee_id {
                    if i.assignee_id != assignee_id {
                        i.assignee_name = None;
                    }
                    i.assignee_id = assignee_id;
                }
                if let Some(tags) = &patch.tags {
                    i.tags = tags.clone();
                }
                Ok(Entity::Issue(i))
            }
            _ => Err(SyncError::InvalidOperation(format!(
                "cannot apply a {} patch to a {}",
                self.kind(),
                entity.kind()
            ))),
        }
    }
}

// ============================================================================
// Wire DTOs
// ============================================================================

/// Body of `POST /projects` and `PUT /projects/{id}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectRequest {
    pub name: String,
}

impl ProjectRequest {
    pub fn from_project(p: &Project) -> Self {
        Self {
            name: p.name.clone(),
        }
    }
}

/// Body of `POST /issues` and `PUT /issues/{id}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<i64>,
    pub title: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<IssueStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<IssuePriority>,
    /// Omitted when `None`; `Some(None)` is sent as an explicit null
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee_id: Option<Option<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

impl IssueRequest {
    /// Create body; the parent project must already carry a server id
    pub fn for_create(new: &NewIssue) -> SyncResult<Self> {
        Ok(Self {
            project_id: Some(new.project_id.require_server("project")?),
            title: new.title.clone(),
            description: new.description.clone(),
            status: new.status,
            priority: Some(new.priority),
            assignee_id: new.assignee_id.map(Some),
            tags: new.tags.clone(),
        })
    }

    /// Full-state update body.
    ///
    /// The server replaces title and description wholesale, so the body is
    /// always built from a complete entity rather than from the patch alone.
    pub fn for_update(issue: &Issue) -> Self {
        Self {
            project_id: issue.project_id.server(),
            title: issue.title.clone(),
            description: issue.description.clone(),
            status: Some(issue.status),
            priority: Some(issue.priority),
            assignee_id: Some(issue.assignee_id),
            tags: Some(issue.tags.clone()),
        }
    }
}

/// Sortable issue fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortField {
    #[default]
    CreatedAt,
    UpdatedAt,
    Title,
    Status,
    Priority,
}

impl FromStr for SortField {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "createdAt" | "created_at" => Ok(SortField::CreatedAt),
            "updatedAt" | "updated_at" => Ok(SortField::UpdatedAt),
            "title" => Ok(SortField::Title),
            "status" => Ok(SortField::Status),
            "priority" => Ok(SortField::Priority),
            other => Err(SyncError::InvalidOperation(format!("unknown sort field: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl FromStr for SortDirection {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" => Ok(SortDirection::Asc),
            "desc" => Ok(SortDirection::Desc),
            other => Err(SyncError::InvalidOperation(format!("unknown sort order: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SortSpec {
    pub field: SortField,
    pub direction: SortDirection,
}

/// Server-side filters of an issue list
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct IssueFilters {
    pub status: Option<IssueStatus>,
    pub priority: Option<IssuePriority>,
    pub search_text: Option<String>,
}

impl IssueFilters {
    pub fn status(status: IssueStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// Query string of `GET /issues`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueQuery {
    pub project_id: i64,
    pub page: u32,
    pub size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<IssueStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<IssuePriority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_text: Option<String>,
    pub sort_by: SortField,
    pub sort_order: SortDirection,
}

/// Paged response of `GET /issues`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub content: Vec<T>,
    #[serde(default)]
    pub total_elements: u64,
    #[serde(default)]
    pub total_pages: u32,
    #[serde(default)]
    pub size: u32,
    #[serde(default)]
    pub number: u32,
}

// ============================================================================
// Serde helpers
// ============================================================================

/// Treat an explicit `null` like a missing field
fn null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Timestamp parsing that accepts RFC 3339 and zone-less ISO-8601 (read as UTC)
pub mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer};

    pub fn parse(s: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Some(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }

    pub fn deserialize_opt<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            None => Ok(None),
            Some(s) => parse(&s)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", s))),
        }
    }
}
