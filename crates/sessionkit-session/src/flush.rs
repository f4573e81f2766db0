//! Flush execution: run an ordered plan against the connection, then promote
//! instance state once every statement has succeeded.

use std::time::Instant;

use serde::Serialize;
use sessionkit_core::{
    Capabilities, Connection, Error, FlushErrorKind, FrameRef, InvalidRequestKind, MapperId,
    Result, Statement, Value,
};

use crate::instance::{AttributeState, Entity, EntityState};
use crate::unit_of_work::{self, AssociationRow, FkSync, FlushPlan, OpKind, PendingOp};
use crate::{Session, SessionEvent};

/// Result of a flush operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushResult {
    /// Number of rows inserted.
    pub inserted: usize,
    /// Number of UPDATE statements, including foreign key post-updates.
    pub updated: usize,
    /// Number of rows deleted.
    pub deleted: usize,
    /// Association rows inserted or deleted.
    pub associations: usize,
}

impl FlushResult {
    /// Total number of statements that changed data.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted + self.associations
    }
}

/// Columns whose value the backend generated during this flush, reset if the
/// flush fails.
type Generated = Vec<(Entity, usize)>;

fn values_of(entity: &Entity, columns: &[&'static str]) -> Vec<Value> {
    let inner = entity.read();
    columns
        .iter()
        .map(|c| inner.value_of(c).cloned().unwrap_or(Value::Null))
        .collect()
}

fn missing_key(table: &str, instance: u64) -> Error {
    Error::flush(
        FlushErrorKind::MissingPrimaryKey,
        format!("instance {instance} has no usable primary key for table '{table}'"),
    )
}

fn stale_update(table: &str, affected: u64) -> Error {
    Error::flush(
        FlushErrorKind::StaleData,
        format!(
            "UPDATE statement on table '{table}' expected to update 1 row(s); {affected} were matched"
        ),
    )
}

/// Key the row is stored under, for WHERE clauses.
fn stored_key(op: &PendingOp, entity: &Entity) -> Result<(Vec<&'static str>, Vec<Value>)> {
    let inner = entity.read();
    let columns = inner.mapper().primary_key_columns();
    let values = inner
        .committed_primary_key()
        .ok_or_else(|| missing_key(op.table, entity.id()))?;
    Ok((columns, values))
}

impl<C: Connection> Session<C> {
    /// Write all pending changes to the current transaction.
    ///
    /// A failure leaves the session faulted until [`Session::rollback`].
    #[tracing::instrument(level = "debug", skip(self), fields(session = self.id))]
    pub fn flush(&mut self) -> Result<FlushResult> {
        self.check_not_prepared()?;
        self.check_not_faulted()?;
        if self.frames.top_mut().is_some_and(|f| f.rollback_only) {
            return Err(Error::invalid(
                InvalidRequestKind::InactiveTransaction,
                "this transaction was rolled back by an inner frame; roll it back",
            ));
        }
        self.callbacks.fire(SessionEvent::BeforeFlush)?;
        match self.run_flush() {
            Ok(result) => {
                self.callbacks.fire(SessionEvent::AfterFlush)?;
                Ok(result)
            }
            Err(e) => {
                if !matches!(e, Error::InvalidRequest(_)) {
                    self.faulted = true;
                    tracing::warn!(session = self.id, error = %e, "flush failed; session faulted");
                }
                Err(e)
            }
        }
    }

    fn run_flush(&mut self) -> Result<FlushResult> {
        let set = self.prepare_flush()?;
        if set.is_empty() {
            return Ok(FlushResult::default());
        }
        let frame = self.ensure_frame()?;
        let plan = unit_of_work::plan(&self.registry, set)?;
        tracing::debug!(steps = plan.len(), ops = ?plan.labels(), "executing flush plan");

        let start = Instant::now();
        let mut generated = Vec::new();
        let result = match self.execute_plan(&frame, &plan, &mut generated) {
            Ok(result) => result,
            Err(e) => {
                for (entity, column) in generated {
                    entity.write().columns[column].state = AttributeState::Unloaded;
                }
                return Err(e);
            }
        };
        self.promote(&plan)?;
        tracing::info!(
            elapsed_ms = start.elapsed().as_millis(),
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            associations = result.associations,
            "Flush complete"
        );
        Ok(result)
    }

    fn execute_plan(
        &mut self,
        frame: &FrameRef,
        plan: &FlushPlan,
        generated: &mut Generated,
    ) -> Result<FlushResult> {
        let caps = self.conn.capabilities();
        let mut result = FlushResult::default();
        for op in &plan.ops {
            match &op.kind {
                OpKind::Insert => {
                    self.execute_insert(frame, op, caps, generated)?;
                    result.inserted += 1;
                }
                OpKind::Update { row_switch } => {
                    if self.execute_update(frame, op, row_switch.as_ref())? {
                        result.updated += 1;
                    }
                }
                OpKind::Delete => {
                    self.execute_delete(frame, op)?;
                    result.deleted += 1;
                }
                OpKind::PostUpdate(sync) => {
                    self.execute_post_update(frame, op, sync)?;
                    result.updated += 1;
                }
                OpKind::PreDeleteNull { columns } => {
                    let (key_columns, key_values) = stored_key(op, &op.entity)?;
                    let outcome = self.run(
                        frame,
                        Statement::Update {
                            table: op.table,
                            set_columns: columns.clone(),
                            set_values: vec![Value::Null; columns.len()],
                            key_columns,
                            key_values,
                        },
                    )?;
                    if outcome.affected_rows != 1 {
                        return Err(stale_update(op.table, outcome.affected_rows));
                    }
                    result.updated += 1;
                }
                OpKind::LinkInsert(row) => {
                    let (columns, values) = association_values(row, false)?;
                    self.run(
                        frame,
                        Statement::Insert {
                            table: row.table,
                            columns,
                            values,
                            returning: Vec::new(),
                        },
                    )?;
                    result.associations += 1;
                }
                OpKind::LinkDelete(row) => {
                    let (key_columns, key_values) = association_values(row, true)?;
                    let outcome = self.run(
                        frame,
                        Statement::Delete {
                            table: row.table,
                            key_columns,
                            key_values,
                        },
                    )?;
                    if outcome.affected_rows == 0 {
                        tracing::warn!(table = row.table, "association row to delete was not found");
                    }
                    result.associations += 1;
                }
                OpKind::LinkPurge { table, columns } => {
                    let key_values = op
                        .entity
                        .read()
                        .committed_primary_key()
                        .ok_or_else(|| missing_key(table, op.entity.id()))?;
                    let outcome = self.run(
                        frame,
                        Statement::Delete {
                            table: *table,
                            key_columns: columns.to_vec(),
                            key_values,
                        },
                    )?;
                    result.associations += usize::try_from(outcome.affected_rows).unwrap_or(usize::MAX);
                }
            }
        }
        Ok(result)
    }

    /// Copy parent key values into the holder's foreign key columns.
    fn apply_syncs(op: &PendingOp) {
        for sync in op.syncs.iter().filter(|s| !s.deferred) {
            let values = match &sync.parent {
                Some(parent) => values_of(parent, &sync.parent_columns),
                None => vec![Value::Null; sync.columns.len()],
            };
            let mut inner = op.entity.write();
            for (column, value) in sync.columns.iter().zip(values) {
                if let Some(index) = inner.mapper().find_column(column) {
                    let unchanged = inner.columns[index].value().is_some_and(|v| v.same_as(&value));
                    if !unchanged {
                        inner.columns[index].assign(value);
                    }
                }
            }
        }
    }

    fn deferred_columns(op: &PendingOp) -> Vec<&'static str> {
        op.syncs
            .iter()
            .filter(|s| s.deferred)
            .flat_map(|s| s.columns.iter().copied())
            .collect()
    }

    #[tracing::instrument(level = "trace", skip_all, fields(table = op.table, instance = op.entity.id()))]
    fn execute_insert(
        &mut self,
        frame: &FrameRef,
        op: &PendingOp,
        caps: Capabilities,
        generated: &mut Generated,
    ) -> Result<()> {
        Self::apply_syncs(op);
        let registry = std::sync::Arc::clone(&self.registry);
        let mapper = registry.mapper(op.mapper);

        if caps.requires_sequence_preexecute {
            for (index, column) in mapper.columns().iter().enumerate() {
                let Some(sequence) = column.sequence else {
                    continue;
                };
                let missing = op.entity.read().columns[index]
                    .value()
                    .is_none_or(Value::is_null);
                if !missing {
                    continue;
                }
                let outcome = self.run(frame, Statement::NextSequence { sequence })?;
                let value = outcome
                    .generated_keys
                    .first()
                    .cloned()
                    .ok_or_else(|| missing_key(op.table, op.entity.id()))?;
                tracing::trace!(sequence, value = ?value, "sequence pre-executed");
                op.entity.write().columns[index].assign(value);
                generated.push((op.entity.clone(), index));
            }
        }

        let deferred = Self::deferred_columns(op);
        let mut columns = Vec::new();
        let mut values = Vec::new();
        let mut awaiting = Vec::new();
        {
            let inner = op.entity.read();
            for (index, column) in mapper.columns().iter().enumerate() {
                match inner.columns[index].value() {
                    Some(value) if !(value.is_null() && column.autoincrement) => {
                        columns.push(column.name);
                        values.push(if deferred.contains(&column.name) {
                            Value::Null
                        } else {
                            value.clone()
                        });
                    }
                    _ if column.primary_key => awaiting.push(index),
                    _ => {}
                }
            }
        }
        let returning: Vec<&'static str> = if caps.supports_returning {
            awaiting.iter().map(|&i| mapper.columns()[i].name).collect()
        } else {
            Vec::new()
        };
        let outcome = self.run(
            frame,
            Statement::Insert {
                table: op.table,
                columns,
                values,
                returning: returning.clone(),
            },
        )?;

        let mut fetched: Vec<(usize, Value)> = Vec::new();
        if let Some(row) = outcome.returned_rows.first() {
            for &index in &awaiting {
                if let Some(value) = row.get_by_name(mapper.columns()[index].name) {
                    fetched.push((index, value.clone()));
                }
            }
        }
        if fetched.is_empty() {
            if let (Some(&index), Some(value)) = (awaiting.first(), outcome.generated_keys.first()) {
                fetched.push((index, value.clone()));
            }
        }
        {
            let mut inner = op.entity.write();
            for (index, value) in fetched {
                inner.columns[index].assign(value);
                generated.push((op.entity.clone(), index));
            }
            if inner.primary_key().is_none() {
                return Err(missing_key(op.table, op.entity.id()));
            }
        }
        Ok(())
    }

    /// Returns whether a statement was sent.
    #[tracing::instrument(level = "trace", skip_all, fields(table = op.table, instance = op.entity.id()))]
    fn execute_update(
        &mut self,
        frame: &FrameRef,
        op: &PendingOp,
        row_switch: Option<&Entity>,
    ) -> Result<bool> {
        Self::apply_syncs(op);
        let deferred = Self::deferred_columns(op);
        let (set_columns, set_values, key_columns, key_values) = {
            let inner = op.entity.read();
            let mapper = inner.mapper();
            let indices: Vec<usize> = match row_switch {
                // The surviving row still holds the deleted instance's values.
                Some(_) => (0..mapper.columns().len())
                    .filter(|&i| !mapper.is_primary_key(i) && inner.columns[i].value().is_some())
                    .collect(),
                None => inner.modified_columns(),
            };
            let indices: Vec<usize> = indices
                .into_iter()
                .filter(|&i| !deferred.contains(&mapper.columns()[i].name))
                .collect();
            if indices.is_empty() {
                return Ok(false);
            }
            let set_columns = indices.iter().map(|&i| mapper.columns()[i].name).collect();
            let set_values = indices
                .iter()
                .map(|&i| inner.columns[i].value().cloned().unwrap_or(Value::Null))
                .collect();
            let key_values = match row_switch {
                Some(deleted) => deleted.read().committed_primary_key(),
                None => inner.committed_primary_key(),
            }
            .ok_or_else(|| missing_key(op.table, op.entity.id()))?;
            (set_columns, set_values, mapper.primary_key_columns(), key_values)
        };
        let outcome = self.run(
            frame,
            Statement::Update {
                table: op.table,
                set_columns,
                set_values,
                key_columns,
                key_values,
            },
        )?;
        if outcome.affected_rows != 1 {
            return Err(stale_update(op.table, outcome.affected_rows));
        }
        Ok(true)
    }

    fn execute_delete(&mut self, frame: &FrameRef, op: &PendingOp) -> Result<()> {
        let (key_columns, key_values) = stored_key(op, &op.entity)?;
        let outcome = self.run(
            frame,
            Statement::Delete {
                table: op.table,
                key_columns,
                key_values,
            },
        )?;
        if outcome.affected_rows != 1 {
            tracing::warn!(
                table = op.table,
                expected = 1,
                actual = outcome.affected_rows,
                "DELETE matched an unexpected number of rows"
            );
        }
        Ok(())
    }

    fn execute_post_update(&mut self, frame: &FrameRef, op: &PendingOp, sync: &FkSync) -> Result<()> {
        let values = match &sync.parent {
            Some(parent) => values_of(parent, &sync.parent_columns),
            None => vec![Value::Null; sync.columns.len()],
        };
        {
            let mut inner = op.entity.write();
            for (column, value) in sync.columns.iter().zip(&values) {
                if let Some(index) = inner.mapper().find_column(column) {
                    inner.columns[index].assign(value.clone());
                }
            }
        }
        let (key_columns, key_values) = {
            let inner = op.entity.read();
            let key = inner
                .primary_key()
                .ok_or_else(|| missing_key(op.table, op.entity.id()))?;
            (inner.mapper().primary_key_columns(), key)
        };
        tracing::debug!(table = op.table, columns = ?sync.columns, "post-update");
        let outcome = self.run(
            frame,
            Statement::Update {
                table: op.table,
                set_columns: sync.columns.clone(),
                set_values: values,
                key_columns,
                key_values,
            },
        )?;
        if outcome.affected_rows != 1 {
            return Err(stale_update(op.table, outcome.affected_rows));
        }
        Ok(())
    }

    /// Every statement succeeded: move instances to their new states and
    /// record the writes on the current frame.
    fn promote(&mut self, plan: &FlushPlan) -> Result<()> {
        for parent in &plan.passive_rewrites {
            rewrite_loaded_children(parent);
        }
        for (_, deleted) in &plan.row_switches {
            self.map.untrack(deleted);
            deleted.write().state = EntityState::Deleted;
            if let Some(frame) = self.frames.top_mut() {
                frame.record.deleted.push(deleted.clone());
            }
        }
        for op in &plan.ops {
            let entity = &op.entity;
            match &op.kind {
                OpKind::Insert | OpKind::Update { row_switch: Some(_) } => {
                    let key = {
                        let mut inner = entity.write();
                        inner.mark_clean();
                        inner.state = EntityState::Persistent;
                        inner.compute_key()
                    };
                    self.map.rekey(entity, key)?;
                    if let Some(frame) = self.frames.top_mut() {
                        frame.record.inserted.push(entity.downgrade());
                    }
                }
                OpKind::Update { row_switch: None } => {
                    let (changed, key) = {
                        let inner = entity.read();
                        (inner.primary_key_changed(), inner.compute_key())
                    };
                    if changed {
                        self.map.rekey(entity, key)?;
                    }
                    entity.write().mark_clean();
                    if let Some(frame) = self.frames.top_mut() {
                        frame.record.modified.push(entity.downgrade());
                    }
                }
                OpKind::Delete => {
                    self.map.untrack(entity);
                    entity.write().mark_clean();
                    if let Some(frame) = self.frames.top_mut() {
                        frame.record.deleted.push(entity.clone());
                    }
                }
                OpKind::PostUpdate(_) => {
                    entity.write().mark_clean();
                }
                OpKind::PreDeleteNull { .. }
                | OpKind::LinkInsert(_)
                | OpKind::LinkDelete(_)
                | OpKind::LinkPurge { .. } => {}
            }
        }
        Ok(())
    }
}

/// The backend cascaded a key change; mirror it on loaded children.
fn rewrite_loaded_children(parent: &Entity) {
    let registry = parent.registry();
    let owner: MapperId = parent.mapper_id();
    for (index, rel) in registry.mapper(owner).relationships().iter().enumerate() {
        if !rel.fk_on_target() || !rel.is_passive_updates() {
            continue;
        }
        let Some(children) = parent.read().relations[index].members() else {
            continue;
        };
        let values = values_of(parent, rel.ref_columns());
        for child in children {
            let mut inner = child.write();
            for (column, value) in rel.fk_columns().iter().zip(&values) {
                let Some(slot) = inner.mapper().find_column(column) else {
                    continue;
                };
                if !inner.columns[slot].modified {
                    inner.columns[slot].load(value.clone());
                }
            }
            tracing::trace!(instance = child.id(), "foreign key rewritten in memory");
        }
    }
}

/// Column list and values for one association row. `stored` selects the
/// committed keys, for deleting a row that already exists.
fn association_values(row: &AssociationRow, stored: bool) -> Result<(Vec<&'static str>, Vec<Value>)> {
    let key_of = |entity: &Entity| {
        let inner = entity.read();
        let key = if stored {
            inner.committed_primary_key()
        } else {
            inner.primary_key()
        };
        key.ok_or_else(|| missing_key(row.table, entity.id()))
    };
    let mut values = key_of(&row.local)?;
    values.extend(key_of(&row.remote)?);
    let columns = row
        .local_columns
        .iter()
        .chain(row.remote_columns)
        .copied()
        .collect();
    Ok((columns, values))
}
