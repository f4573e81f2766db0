//! Identity map: at most one tracked instance per identity key.
//!
//! Entries are owned strongly by the map and indexed twice, by instance id
//! (every tracked instance, keyed or not) and by identity key (instances that
//! have one). Tracking order is remembered so the flush snapshots come back
//! in the order the application added things.
//!
//! Eviction happens only through [`IdentityMap::prune`], which uses
//! `Arc::strong_count` to find persistent, clean instances nobody else holds.

use std::collections::HashMap;

use sessionkit_core::{Error, IdentityKey, InvalidRequestKind, Result};

use crate::instance::{Entity, EntityState};

/// Handle returned by [`IdentityMap::track`] and [`IdentityMap::lookup`].
#[derive(Debug, Clone)]
pub struct TrackedRef {
    pub entity: Entity,
    /// Tracking order inside the owning map.
    pub seq: u64,
    pub key: Option<IdentityKey>,
}

#[derive(Debug)]
struct Entry {
    entity: Entity,
    seq: u64,
}

/// Identity map owned by one session.
#[derive(Debug)]
pub struct IdentityMap {
    session: u64,
    next_seq: u64,
    entries: HashMap<u64, Entry>,
    by_key: HashMap<IdentityKey, u64>,
}

impl IdentityMap {
    pub fn new(session: u64) -> Self {
        Self {
            session,
            next_seq: 0,
            entries: HashMap::new(),
            by_key: HashMap::new(),
        }
    }

    /// Start tracking `entity`. Tracking an already tracked instance returns
    /// its existing entry.
    pub fn track(&mut self, entity: &Entity) -> Result<TrackedRef> {
        let (owner, key) = {
            let inner = entity.read();
            (inner.owner, inner.key.clone())
        };
        if let Some(owner) = owner {
            if owner != self.session {
                return Err(Error::invalid(
                    InvalidRequestKind::AlreadyTrackedElsewhere,
                    format!("instance {} is attached to session {}", entity.id(), owner),
                ));
            }
        }
        if let Some(entry) = self.entries.get(&entity.id()) {
            return Ok(TrackedRef {
                entity: entry.entity.clone(),
                seq: entry.seq,
                key,
            });
        }
        if let Some(key) = &key {
            if let Some(existing) = self.by_key.get(key) {
                if *existing != entity.id() {
                    return Err(identity_conflict(key));
                }
            }
            self.by_key.insert(key.clone(), entity.id());
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            entity.id(),
            Entry {
                entity: entity.clone(),
                seq,
            },
        );
        entity.write().owner = Some(self.session);
        tracing::trace!(instance = entity.id(), seq, "tracked");
        Ok(TrackedRef {
            entity: entity.clone(),
            seq,
            key,
        })
    }

    pub fn lookup(&self, key: &IdentityKey) -> Option<TrackedRef> {
        let id = self.by_key.get(key)?;
        let entry = self.entries.get(id)?;
        Some(TrackedRef {
            entity: entry.entity.clone(),
            seq: entry.seq,
            key: Some(key.clone()),
        })
    }

    pub fn contains(&self, entity: &Entity) -> bool {
        self.entries.contains_key(&entity.id())
    }

    pub fn seq_of(&self, entity: &Entity) -> Option<u64> {
        self.entries.get(&entity.id()).map(|e| e.seq)
    }

    /// Stop tracking `entity`. Its identity key, if any, is left on the
    /// instance.
    pub fn untrack(&mut self, entity: &Entity) -> bool {
        let Some(entry) = self.entries.remove(&entity.id()) else {
            return false;
        };
        let mut inner = entry.entity.write();
        if let Some(key) = &inner.key {
            if self.by_key.get(key) == Some(&entity.id()) {
                self.by_key.remove(key);
            }
        }
        inner.owner = None;
        true
    }

    /// Move a tracked instance to a new identity key (after its INSERT, or
    /// after a primary key change).
    pub fn rekey(&mut self, entity: &Entity, key: Option<IdentityKey>) -> Result<()> {
        if let Some(new_key) = &key {
            if let Some(existing) = self.by_key.get(new_key) {
                if *existing != entity.id() {
                    return Err(identity_conflict(new_key));
                }
            }
        }
        let mut inner = entity.write();
        if let Some(old) = inner.key.take() {
            if self.by_key.get(&old) == Some(&entity.id()) {
                self.by_key.remove(&old);
            }
        }
        if let Some(new_key) = &key {
            if self.entries.contains_key(&entity.id()) {
                self.by_key.insert(new_key.clone(), entity.id());
            }
        }
        inner.key = key;
        Ok(())
    }

    /// Drop persistent, clean instances held by nothing but this map.
    /// Repeats until stable, since releasing a parent can free its children.
    pub fn prune(&mut self) -> usize {
        let mut total = 0;
        loop {
            let evictable: Vec<u64> = self
                .entries
                .values()
                .filter(|entry| {
                    // One count for the map entry itself.
                    entry.entity.strong_count() == 1 && {
                        let inner = entry.entity.read();
                        inner.state == EntityState::Persistent && !inner.is_dirty()
                    }
                })
                .map(|entry| entry.entity.id())
                .collect();
            if evictable.is_empty() {
                break;
            }
            for id in evictable {
                if let Some(entry) = self.entries.remove(&id) {
                    let mut inner = entry.entity.write();
                    if let Some(key) = &inner.key {
                        if self.by_key.get(key) == Some(&id) {
                            self.by_key.remove(key);
                        }
                    }
                    inner.owner = None;
                    total += 1;
                }
            }
        }
        tracing::debug!(pruned = total, remaining = self.entries.len(), "identity map pruned");
        total
    }

    fn snapshot(&self, keep: impl Fn(&Entity) -> bool) -> Vec<Entity> {
        let mut entries: Vec<&Entry> = self.entries.values().filter(|e| keep(&e.entity)).collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.entity.clone()).collect()
    }

    /// Every tracked instance, in tracking order.
    pub fn entities(&self) -> Vec<Entity> {
        self.snapshot(|_| true)
    }

    pub fn all_new(&self) -> Vec<Entity> {
        self.snapshot(|e| e.state() == EntityState::Pending)
    }

    pub fn all_dirty(&self) -> Vec<Entity> {
        self.snapshot(|e| {
            let inner = e.read();
            inner.state == EntityState::Persistent && inner.is_dirty()
        })
    }

    pub fn all_deleted(&self) -> Vec<Entity> {
        self.snapshot(|e| e.state() == EntityState::Deleted)
    }

    /// Untrack everything, returning what was tracked.
    pub fn clear(&mut self) -> Vec<Entity> {
        let entities = self.entities();
        for entity in &entities {
            entity.write().owner = None;
        }
        self.entries.clear();
        self.by_key.clear();
        entities
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn identity_conflict(key: &IdentityKey) -> Error {
    Error::invalid(
        InvalidRequestKind::IdentityConflict,
        format!("another instance is already tracked as {key}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::family;
    use sessionkit_core::Value;

    fn persistent(registry: &std::sync::Arc<sessionkit_core::Registry>, id: i64) -> Entity {
        let entity = Entity::new(registry, "Parent").unwrap();
        {
            let mut inner = entity.write();
            inner.columns[0].load(Value::BigInt(id));
            inner.state = EntityState::Persistent;
            inner.key = inner.compute_key();
        }
        entity
    }

    #[test]
    fn test_track_and_lookup_return_same_instance() {
        let registry = family();
        let mut map = IdentityMap::new(1);
        let entity = persistent(&registry, 7);
        let tracked = map.track(&entity).unwrap();
        let key = tracked.key.clone().unwrap();
        let found = map.lookup(&key).unwrap();
        assert!(found.entity.ptr_eq(&entity));
        assert_eq!(found.seq, tracked.seq);
    }

    #[test]
    fn test_second_instance_with_same_key_conflicts() {
        let registry = family();
        let mut map = IdentityMap::new(1);
        map.track(&persistent(&registry, 7)).unwrap();
        let err = map.track(&persistent(&registry, 7)).unwrap_err();
        assert_eq!(
            err.invalid_request_kind(),
            Some(InvalidRequestKind::IdentityConflict)
        );
    }

    #[test]
    fn test_tracking_in_two_maps_is_rejected() {
        let registry = family();
        let mut first = IdentityMap::new(1);
        let mut second = IdentityMap::new(2);
        let entity = persistent(&registry, 3);
        first.track(&entity).unwrap();
        let err = second.track(&entity).unwrap_err();
        assert_eq!(
            err.invalid_request_kind(),
            Some(InvalidRequestKind::AlreadyTrackedElsewhere)
        );
        first.untrack(&entity);
        assert!(second.track(&entity).is_ok());
    }

    #[test]
    fn test_prune_keeps_dirty_pending_and_referenced() {
        let registry = family();
        let mut map = IdentityMap::new(1);
        map.track(&persistent(&registry, 1)).unwrap();

        let dirty = persistent(&registry, 2);
        map.track(&dirty).unwrap();
        dirty.set("name", "changed").unwrap();

        let pending = Entity::new(&registry, "Parent").unwrap();
        map.track(&pending).unwrap();
        pending.write().state = EntityState::Pending;

        let held = persistent(&registry, 3);
        map.track(&held).unwrap();

        drop(dirty);
        drop(pending);
        assert_eq!(map.prune(), 1);
        assert_eq!(map.len(), 3);
        assert!(map.contains(&held));
    }

    #[test]
    fn test_snapshots_follow_tracking_order() {
        let registry = family();
        let mut map = IdentityMap::new(1);
        let a = Entity::new(&registry, "Parent").unwrap();
        let b = Entity::new(&registry, "Parent").unwrap();
        map.track(&b).unwrap();
        map.track(&a).unwrap();
        a.write().state = EntityState::Pending;
        b.write().state = EntityState::Pending;
        assert_eq!(map.all_new(), vec![b, a]);
    }

    #[test]
    fn test_rekey_moves_index() {
        let registry = family();
        let mut map = IdentityMap::new(1);
        let entity = persistent(&registry, 1);
        map.track(&entity).unwrap();
        let old = entity.identity_key().unwrap();
        let new = IdentityKey::new("Parent", vec![Value::BigInt(9)], None);
        map.rekey(&entity, Some(new.clone())).unwrap();
        assert!(map.lookup(&old).is_none());
        assert!(map.lookup(&new).unwrap().entity.ptr_eq(&entity));
    }
}
