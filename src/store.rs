//! In-memory entity cache and list views
//!
//! The store is a plain data structure: it performs no I/O and has no side
//! effects beyond its own maps. All writes go through the session engine, one
//! at a time, so nothing here needs interior mutability.

use crate::models::{Entity, EntityId, EntityKey, EntityKind, Scope, ViewKey};
use std::collections::HashMap;
use tracing::trace;

/// Pagination counters of a list view
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pagination {
    pub page: u32,
    pub size: u32,
    pub total_elements: u64,
    pub total_pages: u32,
}

impl Pagination {
    /// Counters for an unpaginated list of `len` elements
    pub fn unpaged(len: usize) -> Self {
        Self {
            page: 0,
            size: len as u32,
            total_elements: len as u64,
            total_pages: if len == 0 { 0 } else { 1 },
        }
    }

    fn adjust_total(&mut self, delta: i64) {
        self.total_elements = (self.total_elements as i64 + delta).max(0) as u64;
        if self.size > 0 {
            self.total_pages = self.total_elements.div_ceil(self.size as u64) as u32;
        }
    }
}

/// Ordered id sequence of one list view plus its counters
#[derive(Debug, Clone, PartialEq)]
pub struct ListView {
    pub key: ViewKey,
    pub ids: Vec<EntityId>,
    pub pagination: Pagination,
}

/// Entity cache: exactly one record per (kind, id)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityStore {
    entities: HashMap<EntityKey, Entity>,
    views: HashMap<ViewKey, ListView>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Entities
    // ========================================================================

    pub fn get(&self, kind: EntityKind, id: EntityId) -> Option<&Entity> {
        self.entities.get(&EntityKey::new(kind, id))
    }

    pub fn contains(&self, kind: EntityKind, id: EntityId) -> bool {
        self.entities.contains_key(&EntityKey::new(kind, id))
    }

    /// Insert or replace wholesale. Returns the previous record.
    pub fn upsert(&mut self, entity: Entity) -> Option<Entity> {
        self.entities.insert(entity.key(), entity)
    }

    /// Upsert unless the cached record is strictly newer.
    /// Returns whether `entity` was written.
    pub fn upsert_if_fresh(&mut self, entity: Entity) -> bool {
        if self
            .entities
            .get(&entity.key())
            .is_some_and(|cached| cached.is_newer_than(&entity))
        {
            return false;
        }
        self.upsert(entity);
        true
    }

    /// Delete the record and drop its id from every view of that kind.
    pub fn remove(&mut self, kind: EntityKind, id: EntityId) -> Option<Entity> {
        for view in self.views.values_mut().filter(|v| v.key.kind == kind) {
            let before = view.ids.len();
            view.ids.retain(|v| *v != id);
            let removed = before - view.ids.len();
            if removed > 0 {
                view.pagination.adjust_total(-(removed as i64));
            }
        }
        self.entities.remove(&EntityKey::new(kind, id))
    }

    /// Atomically rename `temp` to `server`.
    ///
    /// Inserts `entity` under `server`, removes the `temp` record and rewrites
    /// every view occurrence of `temp` in place. If a view already listed
    /// `server` (a refetch raced the confirmation), the duplicate is dropped so
    /// the entry keeps the position the temp entry had.
    pub fn replace_id(&mut self, kind: EntityKind, temp: EntityId, server: EntityId, mut entity: Entity) {
        entity.set_id(server);
        self.entities.remove(&EntityKey::new(kind, temp));
        self.entities.insert(EntityKey::new(kind, server), entity);

        for view in self.views.values_mut().filter(|v| v.key.kind == kind) {
            if !view.ids.contains(&temp) {
                continue;
            }
            let before = view.ids.len();
            view.ids = view
                .ids
                .iter()
                .filter(|id| **id != server)
                .map(|id| if *id == temp { server } else { *id })
                .collect();
            let dropped = before - view.ids.len();
            if dropped > 0 {
                view.pagination.adjust_total(-(dropped as i64));
            }
        }
        trace!(entity_kind = %kind, temp = %temp, server = %server, "Id replaced");
    }

    /// All cached entities of one kind (unordered)
    pub fn entities_of(&self, kind: EntityKind) -> Vec<&Entity> {
        self.entities.values().filter(|e| e.kind() == kind).collect()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    // ========================================================================
    // List views
    // ========================================================================

    /// Replace the view's ordered ids and counters
    pub fn set_view(&mut self, key: ViewKey, ids: Vec<EntityId>, pagination: Pagination) {
        self.views.insert(
            key,
            ListView {
                key,
                ids,
                pagination,
            },
        );
    }

    pub fn view(&self, key: &ViewKey) -> Option<&ListView> {
        self.views.get(key)
    }

    /// Entities of a view in display order; ids without a record are skipped
    pub fn view_entities(&self, key: &ViewKey) -> Vec<&Entity> {
        self.views
            .get(key)
            .map(|view| {
                view.ids
                    .iter()
                    .filter_map(|id| self.get(key.kind, *id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Keys of the views an entity of `kind` in `scope` belongs to
    pub fn matching_views(&self, kind: EntityKind, scope: &Scope) -> Vec<ViewKey> {
        let mut keys: Vec<ViewKey> = self
            .views
            .keys()
            .filter(|k| k.contains(kind, scope))
            .copied()
            .collect();
        keys.sort();
        keys
    }

    /// Put `id` at the head of the view. No-op if absent or already listed.
    pub fn prepend_to_view(&mut self, key: &ViewKey, id: EntityId) -> bool {
        self.insert_at(key, 0, id)
    }

    /// Insert `id` at `position` (clamped). No-op if absent or already listed.
    pub fn insert_at(&mut self, key: &ViewKey, position: usize, id: EntityId) -> bool {
        let Some(view) = self.views.get_mut(key) else {
            return false;
        };
        if view.ids.contains(&id) {
            return false;
        }
        let position = position.min(view.ids.len());
        view.ids.insert(position, id);
        view.pagination.adjust_total(1);
        true
    }

    /// Where `id` currently sits in each view of its kind
    pub fn positions_of(&self, kind: EntityKind, id: EntityId) -> Vec<(ViewKey, usize)> {
        let mut positions: Vec<(ViewKey, usize)> = self
            .views
            .values()
            .filter(|v| v.key.kind == kind)
            .filter_map(|v| v.ids.iter().position(|x| *x == id).map(|p| (v.key, p)))
            .collect();
        positions.sort();
        positions
    }

    pub fn clear_view(&mut self, key: &ViewKey) -> Option<ListView> {
        self.views.remove(key)
    }

    pub fn view_keys(&self) -> Vec<ViewKey> {
        let mut keys: Vec<ViewKey> = self.views.keys().copied().collect();
        keys.sort();
        keys
    }
}
