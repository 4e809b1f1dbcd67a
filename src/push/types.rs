//! Push message decoding
//!
//! Raw push frames are JSON of several historical shapes. They are decoded
//! here, once, into the closed `PushEvent` type. Anything unrecognised maps
//! to `PushEvent::Ignored`; decoding never fails.

use crate::models::{EntityId, EntityKind, Scope};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::fmt;

/// Default size of the duplicate-suppression window
pub const DEDUP_WINDOW: usize = 128;

/// "Entity `id` of `kind` may have changed"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Invalidation {
    pub kind: EntityKind,
    pub id: EntityId,
    /// `None` when the message does not say; matches every view of the kind
    pub scope: Option<Scope>,
}

impl fmt::Display for Invalidation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{}/{} in {}", self.kind, self.id, scope),
            None => write!(f, "{}/{}", self.kind, self.id),
        }
    }
}

/// Decoded push message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushEvent {
    Invalidate(Invalidation),
    Ignored,
}

/// Canonical change notification published on the push subject
///
/// Field names are snake_case; camelCase spellings are accepted on input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotification {
    #[serde(alias = "entityType", alias = "entity_kind", alias = "entityKind")]
    pub entity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(alias = "entityId")]
    pub entity_id: EntityId,
    #[serde(default, alias = "projectId", skip_serializing_if = "Option::is_none")]
    pub project_id: Option<EntityId>,
    /// ISO 8601 timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl ChangeNotification {
    /// Create a notification stamped with the current time
    pub fn new(kind: EntityKind, action: &str, entity_id: impl Into<EntityId>) -> Self {
        Self {
            entity_type: kind.to_string(),
            action: Some(action.to_string()),
            entity_id: entity_id.into(),
            project_id: None,
            timestamp: Some(chrono::Utc::now().to_rfc3339()),
        }
    }

    /// Set the parent project
    pub fn with_project(mut self, project_id: impl Into<EntityId>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn without_timestamp(mut self) -> Self {
        self.timestamp = None;
        self
    }

    fn to_invalidation(&self) -> Option<Invalidation> {
        let kind = EntityKind::parse_loose(&self.entity_type)?;
        let scope = match kind {
            EntityKind::Project => Some(Scope::All),
            EntityKind::Issue => self.project_id.map(Scope::Project),
        };
        Some(Invalidation {
            kind,
            id: self.entity_id,
            scope,
        })
    }
}

/// A decoded frame plus its duplicate-detection fingerprint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushMessage {
    pub event: PushEvent,
    /// `timestamp:kind:id`, only for messages that carry a timestamp
    pub fingerprint: Option<String>,
}

impl PushMessage {
    fn ignored() -> Self {
        Self {
            event: PushEvent::Ignored,
            fingerprint: None,
        }
    }

    fn invalidate(inv: Invalidation) -> Self {
        Self {
            event: PushEvent::Invalidate(inv),
            fingerprint: None,
        }
    }

    /// Decode one raw text frame
    pub fn parse(raw: &str) -> Self {
        let Ok(value) = serde_json::from_str::<Value>(raw) else {
            return Self::ignored();
        };
        Self::from_value(value)
    }

    fn from_value(value: Value) -> Self {
        let Value::Object(map) = &value else {
            return Self::ignored();
        };

        // Topic envelope: {"destination": "/topic/projects/3/issues", "payload": {...}}
        if let Some(topic) = map
            .get("destination")
            .or_else(|| map.get("topic"))
            .and_then(Value::as_str)
        {
            let payload = map.get("payload").or_else(|| map.get("body"));
            return parse_topic(topic, payload);
        }

        // Canonical change notification
        if ["entity_type", "entityType", "entity_kind", "entityKind"]
            .iter()
            .any(|k| map.contains_key(*k))
        {
            let Ok(note) = serde_json::from_value::<ChangeNotification>(value.clone()) else {
                return Self::ignored();
            };
            let Some(inv) = note.to_invalidation() else {
                return Self::ignored();
            };
            return Self {
                event: PushEvent::Invalidate(inv),
                fingerprint: note
                    .timestamp
                    .as_ref()
                    .map(|ts| format!("{}:{}:{}", ts, inv.kind, inv.id)),
            };
        }

        // {"issueId": 7}
        if let Some(id) = map.get("issueId").and_then(id_of) {
            let scope = map.get("projectId").and_then(id_of).map(Scope::Project);
            return Self::invalidate(Invalidation {
                kind: EntityKind::Issue,
                id,
                scope,
            });
        }

        // Bare issue body
        if map.contains_key("title") {
            if let Some(inv) = issue_body(&value, None) {
                return Self::invalidate(inv);
            }
        }

        Self::ignored()
    }
}

fn id_of(value: &Value) -> Option<EntityId> {
    match value {
        Value::Number(n) => n.as_i64().map(EntityId::Server),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Issue body `{id, projectId, ...}`; `project` overrides a missing `projectId`
fn issue_body(value: &Value, project: Option<EntityId>) -> Option<Invalidation> {
    let id = value.get("id").and_then(id_of)?;
    let project = value.get("projectId").and_then(id_of).or(project);
    Some(Invalidation {
        kind: EntityKind::Issue,
        id,
        scope: project.map(Scope::Project),
    })
}

/// `/topic/projects/{pid}/issues` and `/topic/projects/{pid}/issues/deleted`
fn parse_topic(topic: &str, payload: Option<&Value>) -> PushMessage {
    let segments: Vec<&str> = topic.split('/').filter(|s| !s.is_empty()).collect();
    let (project, deleted) = match segments.as_slice() {
        ["topic", "projects", pid, "issues"] => (pid.parse::<EntityId>().ok(), false),
        ["topic", "projects", pid, "issues", "deleted"] => (pid.parse::<EntityId>().ok(), true),
        _ => return PushMessage::ignored(),
    };
    let Some(project) = project else {
        return PushMessage::ignored();
    };

    // STOMP bodies may arrive as a JSON string
    let payload = match payload {
        Some(Value::String(s)) => serde_json::from_str::<Value>(s).unwrap_or(Value::String(s.clone())),
        Some(v) => v.clone(),
        None => return PushMessage::ignored(),
    };

    let inv = if deleted {
        id_of(&payload).map(|id| Invalidation {
            kind: EntityKind::Issue,
            id,
            scope: Some(Scope::Project(project)),
        })
    } else {
        issue_body(&payload, Some(project))
    };
    match inv {
        Some(inv) => PushMessage::invalidate(inv),
        None => PushMessage::ignored(),
    }
}

/// Bounded window of recently seen fingerprints
#[derive(Debug)]
pub struct DedupWindow {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// Record `fingerprint`; returns false if it was already in the window
    pub fn insert(&mut self, fingerprint: &str) -> bool {
        if self.seen.contains(fingerprint) {
            return false;
        }
        self.seen.insert(fingerprint.to_string());
        self.order.push_back(fingerprint.to_string());
        if self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self::new(DEDUP_WINDOW)
    }
}
