//! Transaction frame stack.
//!
//! The stack itself only does bookkeeping: frame ids, savepoint names, the
//! rollback-only flag and the per-frame record of what flushes touched. The
//! `Session` methods at the bottom of this module drive the connection and
//! apply the record to instance state on commit and rollback.

use sessionkit_core::{
    Connection, Error, FrameKind, FrameRef, InvalidRequestKind, Result,
};

use crate::Session;
use crate::instance::{Entity, EntityState, WeakEntity};
use crate::SessionEvent;

/// What flushes did while a frame was on top.
#[derive(Debug, Default)]
pub(crate) struct FrameRecord {
    pub(crate) inserted: Vec<WeakEntity>,
    /// Strong: deleted instances leave the identity map but must survive
    /// until the frame resolves so a rollback can restore them.
    pub(crate) deleted: Vec<Entity>,
    pub(crate) modified: Vec<WeakEntity>,
}

impl FrameRecord {
    fn absorb(&mut self, other: FrameRecord) {
        self.inserted.extend(other.inserted);
        self.deleted.extend(other.deleted);
        self.modified.extend(other.modified);
    }
}

#[derive(Debug)]
pub(crate) struct Frame {
    pub(crate) handle: FrameRef,
    pub(crate) savepoint: Option<String>,
    pub(crate) rollback_only: bool,
    pub(crate) record: FrameRecord,
}

#[derive(Debug, Default)]
pub(crate) struct TransactionStack {
    frames: Vec<Frame>,
    next_id: u64,
    next_savepoint: u64,
    /// Transaction id of a prepared root transaction.
    prepared: Option<String>,
}

impl TransactionStack {
    pub(crate) fn current(&self) -> Option<&FrameRef> {
        self.frames.last().map(|f| &f.handle)
    }

    pub(crate) fn top_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    pub(crate) fn depth(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn is_active(&self) -> bool {
        !self.frames.is_empty()
    }

    pub(crate) fn prepared(&self) -> Option<&str> {
        self.prepared.as_deref()
    }

    fn push(&mut self, kind: FrameKind) -> &Frame {
        self.next_id += 1;
        let savepoint = (kind == FrameKind::Savepoint).then(|| {
            self.next_savepoint += 1;
            format!("sp_{}", self.next_savepoint)
        });
        let handle = FrameRef {
            id: self.next_id,
            depth: self.frames.len(),
            kind,
        };
        self.frames.push(Frame {
            handle,
            savepoint,
            rollback_only: false,
            record: FrameRecord::default(),
        });
        // Just pushed.
        &self.frames[self.frames.len() - 1]
    }

    /// `frame` must be the top of the stack.
    fn check_top(&self, frame: &FrameRef) -> Result<()> {
        match self.frames.last() {
            Some(top) if top.handle == *frame => Ok(()),
            Some(top) => Err(Error::invalid(
                InvalidRequestKind::NotTopFrame,
                format!(
                    "frame {} at depth {} is not the top frame (top is {} at depth {})",
                    frame.id, frame.depth, top.handle.id, top.handle.depth
                ),
            )),
            None => Err(no_transaction()),
        }
    }

    fn pop(&mut self) -> Option<Frame> {
        let frame = self.frames.pop();
        if self.frames.is_empty() {
            self.prepared = None;
        }
        frame
    }

    /// Enclosing frames up to and including the nearest savepoint or root
    /// can no longer commit.
    fn poison_enclosing(&mut self) {
        for frame in self.frames.iter_mut().rev() {
            frame.rollback_only = true;
            if frame.handle.kind != FrameKind::Subtransaction {
                break;
            }
        }
    }
}

pub(crate) fn no_transaction() -> Error {
    Error::invalid(
        InvalidRequestKind::NoTransaction,
        "no transaction is active and autobegin is disabled",
    )
}

impl<C: Connection> Session<C> {
    /// Open the root transaction, or a subtransaction beneath the current
    /// frame.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn begin(&mut self) -> Result<FrameRef> {
        self.check_not_prepared()?;
        self.check_not_faulted()?;
        if self.frames.is_active() {
            let frame = self.frames.push(FrameKind::Subtransaction).handle.clone();
            tracing::debug!(frame = frame.id, depth = frame.depth, "subtransaction opened");
            return Ok(frame);
        }
        self.begin_root()
    }

    pub(crate) fn begin_root(&mut self) -> Result<FrameRef> {
        self.conn.begin()?;
        let frame = self.frames.push(FrameKind::Root).handle.clone();
        tracing::debug!(session = self.id, frame = frame.id, "transaction begun");
        Ok(frame)
    }

    /// The frame statements run in, opening the root transaction first when
    /// autobegin allows it.
    pub(crate) fn ensure_frame(&mut self) -> Result<FrameRef> {
        if let Some(frame) = self.frames.current() {
            return Ok(frame.clone());
        }
        if !self.config.auto_begin {
            return Err(no_transaction());
        }
        self.begin_root()
    }

    /// Open a SAVEPOINT. Pending changes are flushed first so the savepoint
    /// covers only what happens after it.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn begin_nested(&mut self) -> Result<FrameRef> {
        self.check_not_prepared()?;
        if self.faulted {
            return Err(Error::invalid(
                InvalidRequestKind::Faulted,
                "cannot open a savepoint: a previous flush failed, roll back first",
            ));
        }
        if !self.conn.capabilities().supports_savepoints {
            return Err(Error::invalid(
                InvalidRequestKind::Unsupported,
                "backend does not support savepoints",
            ));
        }
        self.ensure_frame()?;
        self.flush()?;
        let name = {
            let frame = self.frames.push(FrameKind::Savepoint);
            frame.savepoint.clone().unwrap_or_default()
        };
        if let Err(e) = self.conn.savepoint(&name) {
            self.frames.pop();
            return Err(e);
        }
        let frame = self
            .frames
            .current()
            .cloned()
            .ok_or_else(no_transaction)?;
        tracing::debug!(frame = frame.id, depth = frame.depth, savepoint = %name, "savepoint opened");
        Ok(frame)
    }

    /// Commit the top frame.
    pub fn commit(&mut self) -> Result<()> {
        let Some(frame) = self.frames.current().cloned() else {
            // Nothing begun yet: flush may open the root, then commit it.
            self.flush()?;
            return match self.frames.current().cloned() {
                Some(frame) => self.commit_frame(&frame),
                None => Ok(()),
            };
        };
        self.commit_frame(&frame)
    }

    /// Roll back the top frame.
    pub fn rollback(&mut self) -> Result<()> {
        match self.frames.current().cloned() {
            Some(frame) => self.rollback_frame(&frame),
            None => {
                self.discard_pending();
                self.revert_unflushed(true);
                self.faulted = false;
                Ok(())
            }
        }
    }

    #[tracing::instrument(level = "info", skip(self), fields(frame = frame.id, depth = frame.depth))]
    pub fn commit_frame(&mut self, frame: &FrameRef) -> Result<()> {
        self.frames.check_top(frame)?;
        self.check_not_faulted()?;
        if self.frames.top_mut().is_some_and(|f| f.rollback_only) {
            return Err(Error::invalid(
                InvalidRequestKind::InactiveTransaction,
                "this transaction was rolled back by an inner frame; roll it back",
            ));
        }
        if let Some(xid) = self.frames.prepared().map(str::to_string) {
            self.callbacks.fire(SessionEvent::BeforeCommit)?;
            self.conn.commit_prepared(&xid)?;
            tracing::info!(xid = %xid, "prepared transaction committed");
            return self.finish_root_commit();
        }
        self.flush()?;
        match frame.kind {
            FrameKind::Root => {
                self.callbacks.fire(SessionEvent::BeforeCommit)?;
                self.conn.commit()?;
                self.finish_root_commit()
            }
            FrameKind::Subtransaction | FrameKind::Savepoint => {
                let Some(done) = self.frames.pop() else {
                    return Err(no_transaction());
                };
                if let Some(name) = &done.savepoint {
                    if let Err(e) = self.conn.release_savepoint(name) {
                        self.frames.frames.push(done);
                        return Err(e);
                    }
                }
                if let Some(parent) = self.frames.top_mut() {
                    parent.record.absorb(done.record);
                }
                tracing::debug!(frame = frame.id, kind = ?frame.kind, "nested frame committed");
                Ok(())
            }
        }
    }

    fn finish_root_commit(&mut self) -> Result<()> {
        let root = self.frames.pop();
        if let Some(root) = root {
            for entity in root.record.deleted {
                let mut inner = entity.write();
                if inner.state == EntityState::Deleted {
                    inner.state = EntityState::Detached;
                }
            }
        }
        if self.config.expire_on_commit {
            for entity in self.map.entities() {
                if entity.state() == EntityState::Persistent {
                    self.expire_instance(&entity, None);
                }
            }
        }
        tracing::info!(session = self.id, "transaction committed");
        self.callbacks.fire(SessionEvent::AfterCommit)
    }

    #[tracing::instrument(level = "info", skip(self), fields(frame = frame.id, depth = frame.depth))]
    pub fn rollback_frame(&mut self, frame: &FrameRef) -> Result<()> {
        self.frames.check_top(frame)?;
        let prepared = self.frames.prepared().map(str::to_string);
        let Some(done) = self.frames.pop() else {
            return Err(no_transaction());
        };
        let result = match (frame.kind, prepared) {
            (FrameKind::Root, Some(xid)) => self.conn.rollback_prepared(&xid),
            (FrameKind::Root, None) => self.conn.rollback(),
            (FrameKind::Savepoint, _) => match &done.savepoint {
                Some(name) => self.conn.rollback_to_savepoint(name),
                None => Ok(()),
            },
            (FrameKind::Subtransaction, _) => Ok(()),
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "backend rollback failed");
            self.undo_record(done.record);
            self.discard_pending();
            self.revert_unflushed(frame.kind == FrameKind::Root);
            self.faulted = false;
            return Err(e);
        }

        if frame.kind == FrameKind::Subtransaction {
            self.frames.poison_enclosing();
            if let Some(parent) = self.frames.top_mut() {
                parent.record.absorb(done.record);
            }
            self.discard_pending();
        } else {
            self.undo_record(done.record);
            self.discard_pending();
            self.revert_unflushed(frame.kind == FrameKind::Root);
        }
        self.faulted = false;
        tracing::info!(frame = frame.id, kind = ?frame.kind, "frame rolled back");
        self.callbacks.fire(SessionEvent::AfterRollback)
    }

    /// Revert instance state for writes the backend just undid.
    fn undo_record(&mut self, record: FrameRecord) {
        for weak in record.inserted {
            let Some(entity) = weak.upgrade() else {
                continue;
            };
            self.map.untrack(&entity);
            let registry = entity.registry();
            let mut inner = entity.write();
            let mapper = registry.mapper(inner.mapper);
            for (index, column) in mapper.columns().iter().enumerate() {
                if column.autoincrement || column.sequence.is_some() {
                    inner.columns[index].state = crate::instance::AttributeState::Unloaded;
                }
            }
            inner.mark_uncommitted();
            inner.key = None;
            inner.state = EntityState::Transient;
            tracing::trace!(instance = entity.id(), "insert undone");
        }
        for entity in record.deleted {
            {
                let mut inner = entity.write();
                inner.state = EntityState::Persistent;
            }
            if let Err(e) = self.map.track(&entity) {
                tracing::warn!(instance = entity.id(), error = %e, "deleted instance could not be restored");
                entity.write().state = EntityState::Detached;
                continue;
            }
            self.expire_instance(&entity, None);
            tracing::trace!(instance = entity.id(), "delete undone");
        }
        for weak in record.modified {
            if let Some(entity) = weak.upgrade() {
                if self.map.contains(&entity) && entity.state() == EntityState::Persistent {
                    self.expire_instance(&entity, None);
                }
            }
        }
    }

    /// Bring back instances marked for delete but never flushed, and drop
    /// unflushed edits. `everything` expires every persistent instance;
    /// otherwise only those with edits or a cancelled delete.
    fn revert_unflushed(&mut self, everything: bool) {
        let mut restored = 0;
        for entity in self.map.entities() {
            let cancelled = {
                let mut inner = entity.write();
                let cancelled = inner.state == EntityState::Deleted;
                if cancelled {
                    inner.state = EntityState::Persistent;
                }
                cancelled
            };
            if entity.state() != EntityState::Persistent {
                continue;
            }
            if cancelled {
                restored += 1;
            }
            if everything || cancelled || entity.read().is_dirty() {
                self.discard_changes(&entity);
            }
        }
        tracing::debug!(session = self.id, restored, "unflushed changes reverted");
    }

    /// Expunge every pending instance.
    fn discard_pending(&mut self) {
        for entity in self.map.all_new() {
            self.expunge_one(&entity);
        }
    }

    /// First phase of two-phase commit. Only the root frame can be prepared.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn prepare(&mut self) -> Result<String> {
        self.check_not_prepared()?;
        if !self.conn.capabilities().supports_two_phase {
            return Err(Error::invalid(
                InvalidRequestKind::Unsupported,
                "backend does not support two-phase commit",
            ));
        }
        let frame = self.ensure_frame()?;
        if frame.kind != FrameKind::Root {
            return Err(Error::invalid(
                InvalidRequestKind::NotTopFrame,
                "two-phase commit is only available on the root frame",
            ));
        }
        self.flush()?;
        let xid = format!("sessionkit-{}-{}", self.id, frame.id);
        self.conn.prepare_two_phase(&xid)?;
        self.frames.prepared = Some(xid.clone());
        tracing::info!(xid = %xid, "transaction prepared");
        Ok(xid)
    }

    pub fn commit_prepared(&mut self) -> Result<()> {
        let frame = self.prepared_root()?;
        self.commit_frame(&frame)
    }

    pub fn rollback_prepared(&mut self) -> Result<()> {
        let frame = self.prepared_root()?;
        self.rollback_frame(&frame)
    }

    fn prepared_root(&self) -> Result<FrameRef> {
        if self.frames.prepared().is_none() {
            return Err(Error::invalid(
                InvalidRequestKind::NoTransaction,
                "no prepared transaction",
            ));
        }
        self.frames.current().cloned().ok_or_else(no_transaction)
    }

    pub(crate) fn check_not_prepared(&self) -> Result<()> {
        match self.frames.prepared() {
            Some(xid) => Err(Error::invalid(
                InvalidRequestKind::Prepared,
                format!("transaction {xid} is prepared; only commit or rollback is allowed"),
            )),
            None => Ok(()),
        }
    }

    pub(crate) fn check_not_faulted(&self) -> Result<()> {
        if self.faulted {
            return Err(Error::invalid(
                InvalidRequestKind::Faulted,
                "a previous flush failed; roll back before continuing",
            ));
        }
        Ok(())
    }

    /// The connection, checked against the frame that wants to use it.
    pub fn connection_for(&mut self, frame: &FrameRef) -> Result<&mut C> {
        self.frames.check_top(frame)?;
        Ok(&mut self.conn)
    }

    /// The frame on top of the stack, if a transaction is active.
    pub fn current_frame(&self) -> Option<FrameRef> {
        self.frames.current().cloned()
    }

    pub fn transaction_depth(&self) -> usize {
        self.frames.depth()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Session;
    use crate::testing::family;
    use sessionkit_memory::{MemoryDatabase, MemoryOptions};

    fn session() -> (MemoryDatabase, Session<sessionkit_memory::MemoryConnection>) {
        let registry = family();
        let db = MemoryDatabase::from_registry(&registry);
        let session = Session::new(registry, db.connect());
        (db, session)
    }

    #[test]
    fn test_stack_names_savepoints_in_order() {
        let mut stack = TransactionStack::default();
        stack.push(FrameKind::Root);
        let first = stack.push(FrameKind::Savepoint).savepoint.clone();
        let second = stack.push(FrameKind::Savepoint).savepoint.clone();
        assert_eq!(first.as_deref(), Some("sp_1"));
        assert_eq!(second.as_deref(), Some("sp_2"));
        assert_eq!(stack.depth(), 3);
    }

    #[test]
    fn test_subtransaction_rollback_poisons_up_to_savepoint() {
        let mut stack = TransactionStack::default();
        stack.push(FrameKind::Root);
        stack.push(FrameKind::Savepoint);
        stack.push(FrameKind::Subtransaction);
        stack.push(FrameKind::Subtransaction);
        stack.pop();
        stack.poison_enclosing();
        let flags: Vec<bool> = stack.frames.iter().map(|f| f.rollback_only).collect();
        assert_eq!(flags, vec![false, true, true]);
    }

    #[test]
    fn test_only_top_frame_commits() {
        let (_db, mut session) = session();
        let root = session.begin().unwrap();
        let _nested = session.begin_nested().unwrap();
        let err = session.commit_frame(&root).unwrap_err();
        assert_eq!(err.invalid_request_kind(), Some(InvalidRequestKind::NotTopFrame));
        assert!(session.connection_for(&root).is_err());
    }

    #[test]
    fn test_subtransaction_commit_does_not_touch_connection() {
        let (_db, mut session) = session();
        session.begin().unwrap();
        let sub = session.begin().unwrap();
        assert_eq!(sub.kind, FrameKind::Subtransaction);
        let log = session.connection().log();
        log.clear();
        session.commit_frame(&sub).unwrap();
        assert!(log.entries().is_empty());
        assert_eq!(session.transaction_depth(), 1);
    }

    #[test]
    fn test_rollback_only_frame_refuses_commit() {
        let (_db, mut session) = session();
        session.begin().unwrap();
        let sub = session.begin().unwrap();
        session.rollback_frame(&sub).unwrap();
        let err = session.commit().unwrap_err();
        assert_eq!(
            err.invalid_request_kind(),
            Some(InvalidRequestKind::InactiveTransaction)
        );
        session.rollback().unwrap();
        assert_eq!(session.transaction_depth(), 0);
    }

    #[test]
    fn test_savepoints_need_backend_support() {
        let registry = family();
        let db = MemoryDatabase::from_registry(&registry);
        let mut session = Session::new(
            registry,
            db.connect_with(MemoryOptions::default().without_savepoints()),
        );
        let err = session.begin_nested().unwrap_err();
        assert_eq!(err.invalid_request_kind(), Some(InvalidRequestKind::Unsupported));
    }

    #[test]
    fn test_autobegin_disabled_requires_begin() {
        let registry = family();
        let db = MemoryDatabase::from_registry(&registry);
        let config = crate::SessionConfig {
            auto_begin: false,
            ..crate::SessionConfig::default()
        };
        let mut session = Session::with_config(registry, db.connect(), config);
        let err = session.ensure_frame().unwrap_err();
        assert_eq!(err.invalid_request_kind(), Some(InvalidRequestKind::NoTransaction));
    }
}
