//! Session and unit of work for sessionkit.
//!
//! `sessionkit-session` is the **unit-of-work layer**. It tracks mapped
//! instances, works out which rows have to change and in what order, and
//! drives a [`Connection`] through nested transaction frames.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: at most one tracked instance per identity key.
//! - **Cascades**: `add`, `delete`, `expunge`, `merge` and `expire` follow
//!   relationship cascade rules; delete-orphan is settled at flush time.
//! - **Flush**: pending writes are ordered by foreign key dependencies,
//!   with cycles broken by post-updates, and executed in the current frame.
//! - **Expiration**: committed instances go stale and reload lazily.
//! - **Transactions**: root transaction, subtransactions and savepoints form
//!   a strict stack; two-phase commit on the root.
//!
//! # Design Philosophy
//!
//! - **Explicit over implicit**: no autoflush by default.
//! - **Blocking**: every call runs to completion; there is no internal
//!   concurrency and `&mut self` enforces it.
//! - **Pointer identity**: [`Entity`] handles compare by instance, never by
//!   value.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(registry.clone(), db.connect());
//!
//! let parent = Entity::new(&registry, "Parent")?.with("name", "p")?;
//! let child = Entity::new(&registry, "Child")?;
//! parent.append("children", &child)?;
//!
//! // The child is attached through the save-update cascade.
//! session.add(&parent)?;
//!
//! // parents INSERT runs before children INSERT.
//! session.flush()?;
//! session.commit()?;
//! ```

pub mod cascade;
pub mod expire;
pub mod flush;
pub mod identity_map;
pub mod instance;
pub mod transaction;
pub mod unit_of_work;

#[cfg(test)]
mod testing;

pub use cascade::CascadeOp;
pub use expire::ReloadRequest;
pub use flush::FlushResult;
pub use identity_map::{IdentityMap, TrackedRef};
pub use instance::{Access, AttributeState, Entity, EntityState, WeakEntity};
pub use unit_of_work::PendingCounts;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use sessionkit_core::{
    Connection, Error, ExecuteResult, FrameRef, IdentityKey, InvalidRequestKind, Registry,
    Result, Statement, Value,
};

use crate::transaction::TransactionStack;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Session Events
// ============================================================================

/// Type alias for session event callbacks.
///
/// Callbacks receive no arguments and return `Result<(), Error>`.
/// Returning `Err` aborts the operation (e.g., prevents commit).
type SessionEventFn = Box<dyn FnMut() -> Result<()> + Send>;

/// Holds registered session-level event callbacks.
#[derive(Default)]
pub struct SessionEventCallbacks {
    before_flush: Vec<SessionEventFn>,
    after_flush: Vec<SessionEventFn>,
    before_commit: Vec<SessionEventFn>,
    after_commit: Vec<SessionEventFn>,
    after_rollback: Vec<SessionEventFn>,
}

impl std::fmt::Debug for SessionEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEventCallbacks")
            .field("before_flush", &self.before_flush.len())
            .field("after_flush", &self.after_flush.len())
            .field("before_commit", &self.before_commit.len())
            .field("after_commit", &self.after_commit.len())
            .field("after_rollback", &self.after_rollback.len())
            .finish()
    }
}

impl SessionEventCallbacks {
    fn fire(&mut self, event: SessionEvent) -> Result<()> {
        let callbacks = match event {
            SessionEvent::BeforeFlush => &mut self.before_flush,
            SessionEvent::AfterFlush => &mut self.after_flush,
            SessionEvent::BeforeCommit => &mut self.before_commit,
            SessionEvent::AfterCommit => &mut self.after_commit,
            SessionEvent::AfterRollback => &mut self.after_rollback,
        };
        for cb in callbacks.iter_mut() {
            cb()?;
        }
        Ok(())
    }
}

/// Session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Fired before flush executes pending changes.
    BeforeFlush,
    /// Fired after flush completes successfully.
    AfterFlush,
    /// Fired before the root transaction commits (after its final flush).
    BeforeCommit,
    /// Fired after the root transaction commits.
    AfterCommit,
    /// Fired after any frame is rolled back.
    AfterRollback,
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Whether to open the root transaction on the first flush or load.
    pub auto_begin: bool,
    /// Whether to flush before lazy loads and `get` misses.
    pub auto_flush: bool,
    /// Whether to expire instances after commit (reload on next access).
    pub expire_on_commit: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_begin: true,
            auto_flush: false,
            expire_on_commit: true,
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// The unit of work: an identity map, the pending changes against it, and
/// the transaction frames they are flushed into.
pub struct Session<C: Connection> {
    id: u64,
    registry: Arc<Registry>,
    conn: C,
    config: SessionConfig,
    map: IdentityMap,
    frames: TransactionStack,
    /// A flush failed; only rollback is allowed.
    faulted: bool,
    callbacks: SessionEventCallbacks,
}

impl<C: Connection> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("tracked", &self.map.len())
            .field("depth", &self.frames.depth())
            .field("faulted", &self.faulted)
            .field("callbacks", &self.callbacks)
            .finish_non_exhaustive()
    }
}

impl<C: Connection> Session<C> {
    /// Create a new session over `conn`.
    pub fn new(registry: Arc<Registry>, conn: C) -> Self {
        Self::with_config(registry, conn, SessionConfig::default())
    }

    /// Create a new session with custom configuration.
    pub fn with_config(registry: Arc<Registry>, conn: C, config: SessionConfig) -> Self {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(session = id, "session created");
        Self {
            id,
            registry,
            conn,
            config,
            map: IdentityMap::new(id),
            frames: TransactionStack::default(),
            faulted: false,
            callbacks: SessionEventCallbacks::default(),
        }
    }

    /// Process-unique session id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Get a reference to the underlying connection.
    pub fn connection(&self) -> &C {
        &self.conn
    }

    /// Get the session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Compile and execute one statement in `frame`.
    pub(crate) fn run(&mut self, frame: &FrameRef, statement: Statement) -> Result<ExecuteResult> {
        let compiled = self.conn.compile(statement)?;
        tracing::debug!(
            frame = frame.id,
            depth = frame.depth,
            sql = %compiled.sql,
            params = compiled.params.len(),
            "execute"
        );
        self.conn.execute(frame, &compiled)
    }

    // ========================================================================
    // Session Events
    // ========================================================================

    /// Register a callback to run before flush.
    ///
    /// The callback can abort the flush by returning `Err`.
    pub fn on_before_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.callbacks.before_flush.push(Box::new(f));
    }

    /// Register a callback to run after a successful flush.
    pub fn on_after_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.callbacks.after_flush.push(Box::new(f));
    }

    /// Register a callback to run before commit (after flush).
    ///
    /// The callback can abort the commit by returning `Err`.
    pub fn on_before_commit(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.callbacks.before_commit.push(Box::new(f));
    }

    /// Register a callback to run after a successful commit.
    pub fn on_after_commit(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.callbacks.after_commit.push(Box::new(f));
    }

    /// Register a callback to run after rollback.
    pub fn on_after_rollback(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.callbacks.after_rollback.push(Box::new(f));
    }

    // ========================================================================
    // Object Tracking
    // ========================================================================

    /// Add an instance, and everything reachable from it along save-update,
    /// to the session. Adding an instance scheduled for deletion cancels
    /// the deletion.
    #[tracing::instrument(level = "debug", skip_all, fields(instance = entity.id()))]
    pub fn add(&mut self, entity: &Entity) -> Result<()> {
        self.check_not_prepared()?;
        let reached = cascade::expand(entity, CascadeOp::Attach, &mut |_, _| Ok(()))?;
        for (member, _) in reached {
            self.attach(&member)?;
        }
        Ok(())
    }

    pub fn add_all(&mut self, entities: &[Entity]) -> Result<()> {
        for entity in entities {
            self.add(entity)?;
        }
        Ok(())
    }

    /// Track one instance, moving it to the state tracking implies.
    pub(crate) fn attach(&mut self, entity: &Entity) -> Result<()> {
        entity.read().check_usable()?;
        let state = entity.state();
        let tracked = self.map.contains(entity);
        self.map.track(entity)?;
        let mut inner = entity.write();
        match state {
            EntityState::Transient => inner.state = EntityState::Pending,
            EntityState::Detached => inner.state = EntityState::Persistent,
            EntityState::Deleted if tracked => {
                inner.state = EntityState::Persistent;
                tracing::debug!(instance = entity.id(), "deletion cancelled");
            }
            EntityState::Deleted => {
                // The DELETE already ran in this transaction; insert it again.
                inner.mark_uncommitted();
                inner.state = EntityState::Pending;
            }
            EntityState::Pending | EntityState::Persistent => {}
        }
        Ok(())
    }

    /// Mark a persistent instance for deletion. Detached instances are
    /// attached first; the delete cascade runs immediately.
    #[tracing::instrument(level = "debug", skip_all, fields(instance = entity.id()))]
    pub fn delete(&mut self, entity: &Entity) -> Result<()> {
        self.check_not_prepared()?;
        match entity.state() {
            EntityState::Transient | EntityState::Pending => {
                return Err(Error::invalid(
                    InvalidRequestKind::NotPersistent,
                    format!("instance {} is not persisted; expunge it instead", entity.id()),
                ));
            }
            EntityState::Deleted if self.map.contains(entity) => return Ok(()),
            _ => self.attach(entity)?,
        }
        entity.write().state = EntityState::Deleted;
        self.cascade_delete(entity)?;
        Ok(())
    }

    /// Stop tracking one instance without cascading.
    pub(crate) fn expunge_one(&mut self, entity: &Entity) {
        let pending = entity.state() == EntityState::Pending;
        self.map.untrack(entity);
        if pending {
            cascade::discard_history(entity);
        }
        let mut inner = entity.write();
        inner.state = if inner.key.is_some() {
            EntityState::Detached
        } else {
            EntityState::Transient
        };
        tracing::trace!(instance = entity.id(), state = ?inner.state, "expunged");
    }

    /// Remove an instance, and everything reachable along expunge, from the
    /// session. Pending changes on them are forgotten.
    pub fn expunge(&mut self, entity: &Entity) -> Result<()> {
        if !self.map.contains(entity) {
            return Err(Error::invalid(
                InvalidRequestKind::Detached,
                format!("instance {} is not present in this session", entity.id()),
            ));
        }
        let reached = cascade::expand(entity, CascadeOp::Detach, &mut |_, _| Ok(()))?;
        for (member, _) in reached {
            if self.map.contains(&member) {
                self.expunge_one(&member);
            }
        }
        Ok(())
    }

    /// Remove every instance from the session.
    pub fn expunge_all(&mut self) {
        let entities = self.map.entities();
        let count = entities.len();
        for entity in entities {
            self.expunge_one(&entity);
        }
        tracing::debug!(session = self.id, count, "expunged all");
    }

    /// Drop clean persistent instances nothing outside the session holds.
    pub fn prune(&mut self) -> usize {
        self.map.prune()
    }

    // ========================================================================
    // Merge
    // ========================================================================

    /// Copy the state of `entity` onto the instance this session tracks
    /// under the same identity key, loading or creating it as needed, and
    /// return that instance. Cascades along merge.
    #[tracing::instrument(level = "debug", skip_all, fields(instance = entity.id()))]
    pub fn merge(&mut self, entity: &Entity) -> Result<Entity> {
        self.check_not_prepared()?;
        let mut visited = HashMap::new();
        self.merge_one(entity, &mut visited)
    }

    fn merge_one(&mut self, source: &Entity, visited: &mut HashMap<u64, Entity>) -> Result<Entity> {
        if let Some(done) = visited.get(&source.id()) {
            return Ok(done.clone());
        }
        if self.map.contains(source) {
            visited.insert(source.id(), source.clone());
            return Ok(source.clone());
        }
        source.read().check_usable()?;
        let registry = source.registry();
        let mapper = registry.mapper(source.mapper_id());
        let key = source.read().compute_key();
        let existing = match &key {
            Some(key) => self.get(key)?,
            None => None,
        };
        let target = match existing {
            Some(target) => {
                if let Some(request) = self.column_request(&target)? {
                    self.reload(&request)?;
                }
                target
            }
            None => {
                let target = Entity::blank(&registry, mapper.id(), true);
                self.attach(&target)?;
                target
            }
        };
        visited.insert(source.id(), target.clone());

        let values: Vec<(usize, Value)> = source
            .read()
            .columns
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.value().map(|v| (i, v.clone())))
            .collect();
        {
            let mut inner = target.write();
            for (index, value) in values {
                let same = inner.columns[index]
                    .value()
                    .is_some_and(|v| v.to_key_form().same_as(&value.to_key_form()));
                if !same {
                    inner.columns[index].assign(value);
                }
            }
        }

        for (index, rel) in mapper.relationships().iter().enumerate() {
            if !rel.cascade_rules().contains(CascadeOp::Merge.rule()) {
                continue;
            }
            let members = {
                let inner = source.read();
                let slot = &inner.relations[index];
                match slot.members() {
                    // A fresh empty collection says nothing about the target's.
                    Some(members) if !members.is_empty() || slot.has_history() => members,
                    _ => continue,
                }
            };
            let mut merged = Vec::with_capacity(members.len());
            for member in &members {
                merged.push(self.merge_one(member, visited)?);
            }
            if rel.is_collection() {
                let current = self.related(&target, rel.name())?;
                for old in &current {
                    if !merged.iter().any(|m| m.ptr_eq(old)) {
                        target.remove(rel.name(), old)?;
                    }
                }
                for new in &merged {
                    if !current.iter().any(|c| c.ptr_eq(new)) {
                        target.append(rel.name(), new)?;
                    }
                }
            } else {
                target.set_related(rel.name(), merged.first())?;
            }
        }
        tracing::trace!(source = source.id(), target = target.id(), "merged");
        Ok(target)
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Local edits or relationship changes not yet flushed.
    pub fn is_modified(&self, entity: &Entity) -> bool {
        entity.is_modified()
    }

    pub fn modified_attributes(&self, entity: &Entity) -> Vec<&'static str> {
        entity.modified_attributes()
    }

    pub fn state_of(&self, entity: &Entity) -> EntityState {
        entity.state()
    }

    pub fn identity_key_of(&self, entity: &Entity) -> Option<IdentityKey> {
        entity.identity_key()
    }

    /// Whether `entity` is tracked by this session.
    pub fn contains(&self, entity: &Entity) -> bool {
        self.map.contains(entity)
    }

    /// Get total tracked object count.
    pub fn tracked_count(&self) -> usize {
        self.map.len()
    }

    /// Counts of instances the next flush would insert, update and delete,
    /// before cascades run.
    pub fn pending_counts(&self) -> PendingCounts {
        PendingCounts {
            new: self.map.all_new().len(),
            dirty: self.map.all_dirty().len(),
            deleted: self.map.all_deleted().len(),
        }
    }

    /// Whether a transaction frame is active.
    pub fn in_transaction(&self) -> bool {
        self.frames.is_active()
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted
    }

    /// Dump session state for debugging.
    pub fn debug_state(&self) -> SessionDebugInfo {
        let pending = self.pending_counts();
        SessionDebugInfo {
            session: self.id,
            tracked: self.tracked_count(),
            pending_new: pending.new,
            pending_delete: pending.deleted,
            pending_dirty: pending.dirty,
            in_transaction: self.in_transaction(),
            transaction_depth: self.frames.depth(),
            faulted: self.faulted,
            prepared: self.frames.prepared().map(str::to_string),
        }
    }
}

/// Debug information about session state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionDebugInfo {
    pub session: u64,
    /// Total tracked objects.
    pub tracked: usize,
    /// Objects pending INSERT.
    pub pending_new: usize,
    /// Objects pending DELETE.
    pub pending_delete: usize,
    /// Objects pending UPDATE.
    pub pending_dirty: usize,
    /// Whether in a transaction.
    pub in_transaction: bool,
    pub transaction_depth: usize,
    pub faulted: bool,
    /// Transaction id, when the root transaction is prepared.
    pub prepared: Option<String>,
}

impl SessionDebugInfo {
    /// Render as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Custom(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{family, natural};
    use sessionkit_memory::{MemoryConnection, MemoryDatabase};
    use std::sync::Mutex;

    fn session() -> (Arc<Registry>, MemoryDatabase, Session<MemoryConnection>) {
        let registry = family();
        let db = MemoryDatabase::from_registry(&registry);
        let session = Session::new(Arc::clone(&registry), db.connect());
        (registry, db, session)
    }

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert!(config.auto_begin);
        assert!(!config.auto_flush);
        assert!(config.expire_on_commit);
    }

    #[test]
    fn test_add_cascades_to_children() {
        let (registry, _db, mut session) = session();
        let parent = Entity::new(&registry, "Parent").unwrap();
        let child = Entity::new(&registry, "Child").unwrap();
        parent.append("children", &child).unwrap();
        session.add(&parent).unwrap();
        assert_eq!(child.state(), EntityState::Pending);
        assert_eq!(session.pending_counts().new, 2);
    }

    #[test]
    fn test_entity_cannot_join_two_sessions() {
        let (registry, db, mut first) = session();
        let mut second = Session::new(Arc::clone(&registry), db.connect());
        let parent = Entity::new(&registry, "Parent").unwrap();
        first.add(&parent).unwrap();
        let err = second.add(&parent).unwrap_err();
        assert_eq!(
            err.invalid_request_kind(),
            Some(InvalidRequestKind::AlreadyTrackedElsewhere)
        );
        assert!(!second.contains(&parent));
    }

    #[test]
    fn test_delete_requires_persistent() {
        let (registry, _db, mut session) = session();
        let parent = Entity::new(&registry, "Parent").unwrap();
        session.add(&parent).unwrap();
        let err = session.delete(&parent).unwrap_err();
        assert_eq!(err.invalid_request_kind(), Some(InvalidRequestKind::NotPersistent));
    }

    #[test]
    fn test_readding_deleted_instance_cancels_delete() {
        let (registry, db, mut session) = session();
        let parent = Entity::new(&registry, "Parent").unwrap().with("name", "p").unwrap();
        session.add(&parent).unwrap();
        session.commit().unwrap();

        session.delete(&parent).unwrap();
        assert_eq!(parent.state(), EntityState::Deleted);
        session.add(&parent).unwrap();
        assert_eq!(parent.state(), EntityState::Persistent);
        session.commit().unwrap();
        assert_eq!(db.row_count("parents").unwrap(), 1);
    }

    #[test]
    fn test_orphan_removed_from_collection_is_deleted() {
        let (registry, db, mut session) = session();
        let parent = Entity::new(&registry, "Parent").unwrap();
        let child = Entity::new(&registry, "Child").unwrap();
        parent.append("children", &child).unwrap();
        session.add(&parent).unwrap();
        session.flush().unwrap();

        parent.remove("children", &child).unwrap();
        session.flush().unwrap();
        assert_eq!(session.connection().log().count("DELETE FROM children"), 1);
        session.commit().unwrap();
        assert_eq!(child.state(), EntityState::Detached);
        assert_eq!(db.row_count("children").unwrap(), 0);
    }

    #[test]
    fn test_reparented_orphan_survives() {
        let (registry, _db, mut session) = session();
        let p1 = Entity::new(&registry, "Parent").unwrap();
        let p2 = Entity::new(&registry, "Parent").unwrap();
        let child = Entity::new(&registry, "Child").unwrap();
        p1.append("children", &child).unwrap();
        session.add_all(&[p1.clone(), p2.clone()]).unwrap();
        session.flush().unwrap();

        p1.remove("children", &child).unwrap();
        p2.append("children", &child).unwrap();
        session.flush().unwrap();
        assert_eq!(child.state(), EntityState::Persistent);
        assert_eq!(
            child.peek("parent_id").unwrap().ready(),
            p2.peek("id").unwrap().ready()
        );
    }

    #[test]
    fn test_expunge_forgets_pending_instances() {
        let (registry, _db, mut session) = session();
        let parent = Entity::new(&registry, "Parent").unwrap();
        let child = Entity::new(&registry, "Child").unwrap();
        parent.append("children", &child).unwrap();
        session.add(&parent).unwrap();
        session.expunge(&parent).unwrap();
        assert_eq!(parent.state(), EntityState::Transient);
        assert_eq!(child.state(), EntityState::Transient);
        assert_eq!(session.tracked_count(), 0);
        assert!(session.expunge(&parent).is_err());
    }

    #[test]
    fn test_prune_keeps_held_and_dirty_instances() {
        let (registry, db, mut session) = session();
        db.seed("parents", &[("id", Value::BigInt(1)), ("name", Value::from("a"))])
            .unwrap();
        db.seed("parents", &[("id", Value::BigInt(2)), ("name", Value::from("b"))])
            .unwrap();
        db.seed("parents", &[("id", Value::BigInt(3)), ("name", Value::from("c"))])
            .unwrap();
        let key = |pk: i64| session_key(&registry, pk);
        let held = session.get(&key(1)).unwrap().unwrap();
        let dirty = session.get(&key(2)).unwrap().unwrap();
        dirty.set("name", "changed").unwrap();
        drop(dirty);
        session.get(&key(3)).unwrap();
        let pending = Entity::new(&registry, "Parent").unwrap();
        session.add(&pending).unwrap();
        drop(pending);

        assert_eq!(session.prune(), 1);
        assert_eq!(session.tracked_count(), 3);
        assert!(session.contains(&held));
    }

    fn session_key(registry: &Registry, pk: i64) -> IdentityKey {
        let mapper = registry.by_name("Parent").unwrap();
        IdentityKey::new(mapper.name(), vec![Value::BigInt(pk)], None)
    }

    #[test]
    fn test_merge_copies_onto_tracked_instance() {
        let (registry, db, mut session) = session();
        db.seed("parents", &[("id", Value::BigInt(1)), ("name", Value::from("old"))])
            .unwrap();
        let tracked = session.get(&session_key(&registry, 1)).unwrap().unwrap();

        let outside = Entity::new(&registry, "Parent")
            .unwrap()
            .with("id", 1_i64)
            .unwrap()
            .with("name", "new")
            .unwrap();
        let merged = session.merge(&outside).unwrap();
        assert!(merged.ptr_eq(&tracked));
        assert!(!session.contains(&outside));
        assert_eq!(tracked.modified_attributes(), vec!["name"]);

        let fresh = Entity::new(&registry, "Parent").unwrap().with("name", "n").unwrap();
        let copy = session.merge(&fresh).unwrap();
        assert!(!copy.ptr_eq(&fresh));
        assert_eq!(copy.state(), EntityState::Pending);
    }

    #[test]
    fn test_merge_cascades_into_collections() {
        let registry = natural(true);
        let db = MemoryDatabase::from_registry(&registry);
        let mut session = Session::new(Arc::clone(&registry), db.connect());
        let owner = Entity::new(&registry, "Owner").unwrap().with("name", "ann").unwrap();
        let pet = Entity::new(&registry, "Pet").unwrap().with("name", "rex").unwrap();
        owner.append("pets", &pet).unwrap();
        let merged = session.merge(&owner).unwrap();
        let pets = merged.related("pets").unwrap().ready().unwrap();
        assert_eq!(pets.len(), 1);
        assert!(!pets[0].ptr_eq(&pet));
        session.commit().unwrap();
        assert_eq!(db.row_count("pets").unwrap(), 1);
    }

    #[test]
    fn test_events_fire_in_order() {
        let (registry, _db, mut session) = session();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for (label, event) in [
            ("before_flush", SessionEvent::BeforeFlush),
            ("after_flush", SessionEvent::AfterFlush),
            ("before_commit", SessionEvent::BeforeCommit),
            ("after_commit", SessionEvent::AfterCommit),
        ] {
            let seen = Arc::clone(&seen);
            let cb = move || {
                seen.lock().unwrap().push(label);
                Ok::<(), Error>(())
            };
            match event {
                SessionEvent::BeforeFlush => session.on_before_flush(cb),
                SessionEvent::AfterFlush => session.on_after_flush(cb),
                SessionEvent::BeforeCommit => session.on_before_commit(cb),
                SessionEvent::AfterCommit => session.on_after_commit(cb),
                SessionEvent::AfterRollback => session.on_after_rollback(cb),
            }
        }
        session.add(&Entity::new(&registry, "Parent").unwrap()).unwrap();
        session.commit().unwrap();
        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen[..2], ["before_flush", "after_flush"]);
        assert_eq!(seen[seen.len() - 2..], ["before_commit", "after_commit"]);
    }

    #[test]
    fn test_before_commit_error_aborts_commit() {
        let (registry, db, mut session) = session();
        session.on_before_commit(|| Err(Error::Custom("veto".to_string())));
        session.add(&Entity::new(&registry, "Parent").unwrap()).unwrap();
        assert!(session.commit().is_err());
        session.rollback().unwrap();
        assert_eq!(db.row_count("parents").unwrap(), 0);
    }

    #[test]
    fn test_debug_state_serializes() {
        let (registry, _db, mut session) = session();
        session.add(&Entity::new(&registry, "Parent").unwrap()).unwrap();
        let info = session.debug_state();
        assert_eq!(info.pending_new, 1);
        assert!(!info.in_transaction);
        let json = info.to_json().unwrap();
        assert!(json.contains("\"pending_new\": 1"));
        assert!(format!("{session:?}").contains("tracked: 1"));
    }
}
