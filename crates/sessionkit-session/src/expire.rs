//! Expiration, reloads and loading.
//!
//! Expiring marks column slots `Stale`; nothing is fetched until an access
//! asks for it. A read of a stale column produces one [`ReloadRequest`]
//! covering every column of that instance that is not loaded, and the reload
//! only fills slots that are still unloaded and carry no local edit, so
//! values assigned after the expire always win.

use std::sync::Arc;

use sessionkit_core::{
    Connection, Error, IdentityKey, InvalidRequestKind, Mapper, MapperId, RelationshipKind,
    Result, Row, StaleReferenceError, Statement, Value,
};

use crate::cascade::{self, CascadeOp};
use crate::instance::{Access, Entity, EntityState, RelationState};
use crate::Session;

/// One round trip that brings an instance's unloaded state back.
#[derive(Debug, Clone)]
pub struct ReloadRequest {
    pub entity: Entity,
    pub mapper: &'static str,
    pub table: &'static str,
    /// Key the row is selected by.
    pub key: IdentityKey,
    /// Every column of the instance that is stale or unloaded.
    pub columns: Vec<&'static str>,
    /// Relationship to load, when the access was to one.
    pub relationship: Option<&'static str>,
}

/// Mark slots stale. Modified columns and relationships with unflushed
/// history are skipped unless `force` is set, which drops those edits;
/// primary key columns never expire.
fn expire_slots(entity: &Entity, attrs: Option<&[&str]>, force: bool) -> usize {
    let mut inner = entity.write();
    let registry = Arc::clone(&inner.registry);
    let mapper = registry.mapper(inner.mapper);
    let wanted = |name: &str| attrs.is_none_or(|names| names.iter().any(|n| *n == name));
    let mut expired = 0;
    for (index, column) in mapper.columns().iter().enumerate() {
        if mapper.is_primary_key(index) || !wanted(column.name) {
            continue;
        }
        let slot = &mut inner.columns[index];
        if slot.modified && !force {
            continue;
        }
        slot.expire();
        expired += 1;
    }
    for (index, rel) in mapper.relationships().iter().enumerate() {
        if !wanted(rel.name()) {
            continue;
        }
        let slot = &mut inner.relations[index];
        if slot.has_history() {
            if !force {
                continue;
            }
            slot.clear_history();
        }
        slot.state = RelationState::Stale;
        expired += 1;
    }
    if force && attrs.is_none() {
        inner.orphan_candidate = false;
    }
    expired
}

/// Names on `mapper` that are neither a column nor a relationship.
fn check_attributes(mapper: &Mapper, attrs: &[&str]) -> Result<()> {
    for name in attrs {
        if mapper.find_column(name).is_none() && mapper.find_relationship(name).is_none() {
            return Err(Error::invalid(
                InvalidRequestKind::UnknownAttribute,
                format!("{} has no attribute '{}'", mapper.name(), name),
            ));
        }
    }
    Ok(())
}

/// Load the columns present in `row` into slots that are not loaded and
/// not locally edited.
fn fill_from_row(entity: &Entity, row: &Row, force: bool) {
    let mut inner = entity.write();
    let registry = Arc::clone(&inner.registry);
    let mapper = registry.mapper(inner.mapper);
    for (index, column) in mapper.columns().iter().enumerate() {
        let Some(value) = row.get_by_name(column.name) else {
            continue;
        };
        let slot = &mut inner.columns[index];
        if force || (slot.value().is_none() && !slot.modified) {
            slot.load(value.clone());
        }
    }
}

fn gone(entity: &Entity, request: &ReloadRequest) -> Error {
    entity.write().row_gone = true;
    tracing::warn!(
        instance = entity.id(),
        key = %request.key,
        "row no longer exists; instance is stale"
    );
    StaleReferenceError {
        mapper: request.mapper.to_string(),
        key: request.key.to_string(),
    }
    .into()
}

impl<C: Connection> Session<C> {
    /// Expire every unmodified attribute of `entity`, or only `attrs`.
    pub(crate) fn expire_instance(&self, entity: &Entity, attrs: Option<&[&str]>) {
        let expired = expire_slots(entity, attrs, false);
        tracing::trace!(session = self.id, instance = entity.id(), expired, "expired");
    }

    /// Expire every attribute of `entity`, dropping unflushed edits.
    pub(crate) fn discard_changes(&self, entity: &Entity) {
        let expired = expire_slots(entity, None, true);
        tracing::trace!(session = self.id, instance = entity.id(), expired, "edits discarded");
    }

    fn check_persistent(&self, entity: &Entity, action: &str) -> Result<()> {
        if entity.state() == EntityState::Persistent && self.map.contains(entity) {
            return Ok(());
        }
        Err(Error::invalid(
            InvalidRequestKind::NotPersistent,
            format!(
                "cannot {action} instance {} in state {:?}; it is not persistent in this session",
                entity.id(),
                entity.state()
            ),
        ))
    }

    /// Persistent instances reached from `root` along refresh-expire.
    fn refresh_expire_set(&self, root: &Entity) -> Result<Vec<Entity>> {
        let reached = cascade::expand(root, CascadeOp::RefreshExpire, &mut |_, _| Ok(()))?;
        Ok(reached
            .into_iter()
            .map(|(entity, _)| entity)
            .filter(|e| e.state() == EntityState::Persistent && self.map.contains(e))
            .collect())
    }

    /// Mark attributes stale so the next access reloads them. An empty
    /// `attrs` expires the whole instance and cascades along refresh-expire.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(instance = entity.id()))]
    pub fn expire(&mut self, entity: &Entity, attrs: &[&str]) -> Result<()> {
        self.check_persistent(entity, "expire")?;
        if attrs.is_empty() {
            for member in self.refresh_expire_set(entity)? {
                self.expire_instance(&member, None);
            }
        } else {
            check_attributes(self.registry.mapper(entity.mapper_id()), attrs)?;
            self.expire_instance(entity, Some(attrs));
        }
        Ok(())
    }

    /// Expire every persistent instance in the identity map.
    pub fn expire_all(&mut self) {
        let mut count = 0;
        for entity in self.map.entities() {
            if entity.state() == EntityState::Persistent {
                self.expire_instance(&entity, None);
                count += 1;
            }
        }
        tracing::debug!(session = self.id, count, "expired all");
    }

    /// Reload every attribute of `entity` from the database now, discarding
    /// local edits. Cascades along refresh-expire.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(instance = entity.id()))]
    pub fn refresh(&mut self, entity: &Entity) -> Result<()> {
        self.check_persistent(entity, "refresh")?;
        self.check_not_faulted()?;
        for member in self.refresh_expire_set(entity)? {
            expire_slots(&member, None, true);
            if let Some(request) = self.column_request(&member)? {
                self.reload(&request)?;
            }
        }
        Ok(())
    }

    /// Reload only `attrs`; edits to other attributes survive.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(instance = entity.id()))]
    pub fn refresh_attrs(&mut self, entity: &Entity, attrs: &[&str]) -> Result<()> {
        self.check_persistent(entity, "refresh")?;
        self.check_not_faulted()?;
        let mapper_id = entity.mapper_id();
        let registry = Arc::clone(&self.registry);
        let mapper = registry.mapper(mapper_id);
        check_attributes(mapper, attrs)?;
        expire_slots(entity, Some(attrs), true);
        if let Some(request) = self.column_request(entity)? {
            self.reload(&request)?;
        }
        for name in attrs {
            if let Some(index) = mapper.find_relationship(name) {
                self.load_relationship(entity, index)?;
            }
        }
        Ok(())
    }

    /// Reload request for every column of `entity` that is not loaded, or
    /// `None` when all are.
    pub(crate) fn column_request(&self, entity: &Entity) -> Result<Option<ReloadRequest>> {
        let inner = entity.read();
        inner.check_usable()?;
        let mapper = inner.mapper();
        let columns: Vec<&'static str> = mapper
            .columns()
            .iter()
            .enumerate()
            .filter(|(index, _)| inner.columns[*index].value().is_none())
            .map(|(_, column)| column.name)
            .collect();
        if columns.is_empty() {
            return Ok(None);
        }
        let Some(key) = inner.key.clone() else {
            return Ok(None);
        };
        Ok(Some(ReloadRequest {
            entity: entity.clone(),
            mapper: mapper.name(),
            table: mapper.table(),
            key,
            columns,
            relationship: None,
        }))
    }

    /// What has to be fetched before `attr` can be read, or `None` when it
    /// is already available.
    pub fn on_stale_access(&self, entity: &Entity, attr: &str) -> Result<Option<ReloadRequest>> {
        let relationship = {
            let inner = entity.read();
            inner.check_usable()?;
            if inner.key.is_none() {
                return Ok(None);
            }
            match inner.mapper().find_column(attr) {
                Some(index) if inner.columns[index].value().is_some() => return Ok(None),
                Some(_) => None,
                None => {
                    let index = inner.relationship_index(attr)?;
                    if inner.relations[index].members().is_some() {
                        return Ok(None);
                    }
                    Some(inner.mapper().relationship_at(index).name())
                }
            }
        };
        if !self.map.contains(entity) {
            return Err(Error::invalid(
                InvalidRequestKind::Detached,
                format!(
                    "instance {} is not bound to a session; attribute '{}' cannot be loaded",
                    entity.id(),
                    attr
                ),
            ));
        }
        match relationship {
            Some(name) => {
                let inner = entity.read();
                let mapper = inner.mapper();
                Ok(inner.key.clone().map(|key| ReloadRequest {
                    entity: entity.clone(),
                    mapper: mapper.name(),
                    table: mapper.table(),
                    key,
                    columns: Vec::new(),
                    relationship: Some(name),
                }))
            }
            None => self.column_request(entity),
        }
    }

    /// Execute a reload. A missing row marks the instance stale for good.
    #[tracing::instrument(level = "debug", skip_all, fields(instance = request.entity.id(), table = request.table))]
    pub fn reload(&mut self, request: &ReloadRequest) -> Result<()> {
        self.check_not_faulted()?;
        let entity = &request.entity;
        entity.read().check_usable()?;
        if !request.columns.is_empty() {
            let key_columns = self
                .registry
                .by_name(request.mapper)?
                .primary_key_columns();
            let rows = self.select(
                request.table,
                request.columns.clone(),
                key_columns,
                request.key.primary_key().to_vec(),
            )?;
            let Some(row) = rows.first() else {
                return Err(gone(entity, request));
            };
            fill_from_row(entity, row, false);
            tracing::debug!(columns = request.columns.len(), "reloaded");
        }
        if let Some(name) = request.relationship {
            let index = entity.read().relationship_index(name)?;
            self.load_relationship(entity, index)?;
        }
        Ok(())
    }

    /// Read a column, reloading it first when it is stale.
    pub fn get_attr(&mut self, entity: &Entity, column: &str) -> Result<Value> {
        if let Access::Ready(value) = entity.peek(column)? {
            return Ok(value);
        }
        if let Some(request) = self.on_stale_access(entity, column)? {
            if self.config.auto_flush {
                self.flush()?;
            }
            self.reload(&request)?;
        }
        entity.peek(column)?.ready().ok_or_else(|| {
            Error::invalid(
                InvalidRequestKind::UnknownAttribute,
                format!("column '{column}' was not returned by the reload"),
            )
        })
    }

    /// Read a relationship, loading it first when needed.
    pub fn related(&mut self, entity: &Entity, name: &str) -> Result<Vec<Entity>> {
        if let Access::Ready(members) = entity.related(name)? {
            return Ok(members);
        }
        if self.on_stale_access(entity, name)?.is_some() && self.config.auto_flush {
            self.flush()?;
        }
        let index = entity.read().relationship_index(name)?;
        self.load_relationship(entity, index)
    }

    /// Look up `key`, in the identity map first, then in the database.
    #[tracing::instrument(level = "debug", skip(self), fields(key = %key))]
    pub fn get(&mut self, key: &IdentityKey) -> Result<Option<Entity>> {
        if let Some(tracked) = self.map.lookup(key) {
            tracked.entity.read().check_usable()?;
            return Ok(Some(tracked.entity));
        }
        if self.config.auto_flush {
            self.flush()?;
        }
        let registry = Arc::clone(&self.registry);
        let mapper = registry.by_name(key.mapper())?;
        let mut found = self.select_entities(
            mapper,
            mapper.primary_key_columns(),
            key.primary_key().to_vec(),
        )?;
        Ok(found.pop())
    }

    /// Identity key for `pk` under the named mapper.
    pub fn identity_key_for(&self, mapper: &str, pk: Vec<Value>) -> Result<IdentityKey> {
        let mapper = self.registry.by_name(mapper)?;
        Ok(IdentityKey::new(mapper.name(), pk, mapper.discriminator()))
    }

    /// Merge an externally loaded row into the identity map. A tracked
    /// instance with the same key is returned with its unloaded columns
    /// filled in; otherwise a new persistent instance is tracked.
    pub fn instance_from_row(&mut self, mapper: &str, row: &Row) -> Result<Entity> {
        let id = self.registry.by_name(mapper)?.id();
        self.materialize(id, row)
    }

    pub(crate) fn materialize(&mut self, mapper_id: MapperId, row: &Row) -> Result<Entity> {
        let registry = Arc::clone(&self.registry);
        let mapper = registry.mapper(mapper_id);
        let pk: Option<Vec<Value>> = mapper
            .primary_key_columns()
            .iter()
            .map(|c| row.get_by_name(c).filter(|v| !v.is_null()).cloned())
            .collect();
        let pk = pk.ok_or_else(|| {
            Error::mapping(
                Some(mapper.name()),
                format!("row from '{}' lacks primary key values", mapper.table()),
            )
        })?;
        let key = IdentityKey::new(mapper.name(), pk, mapper.discriminator());
        if let Some(tracked) = self.map.lookup(&key) {
            fill_from_row(&tracked.entity, row, false);
            return Ok(tracked.entity);
        }
        let entity = Entity::blank(&registry, mapper_id, false);
        fill_from_row(&entity, row, true);
        {
            let mut inner = entity.write();
            inner.state = EntityState::Persistent;
            inner.key = Some(key);
        }
        self.map.track(&entity)?;
        tracing::trace!(instance = entity.id(), mapper = mapper.name(), "loaded");
        Ok(entity)
    }

    fn select(
        &mut self,
        table: &'static str,
        columns: Vec<&'static str>,
        filter_columns: Vec<&'static str>,
        filter_values: Vec<Value>,
    ) -> Result<Vec<Row>> {
        let frame = self.ensure_frame()?;
        let outcome = self.run(
            &frame,
            Statement::Select {
                table,
                columns,
                filter_columns,
                filter_values,
            },
        )?;
        Ok(outcome.returned_rows)
    }

    fn select_entities(
        &mut self,
        mapper: &Mapper,
        filter_columns: Vec<&'static str>,
        filter_values: Vec<Value>,
    ) -> Result<Vec<Entity>> {
        let columns = mapper.columns().iter().map(|c| c.name).collect();
        let rows = self.select(mapper.table(), columns, filter_columns, filter_values)?;
        rows.iter()
            .map(|row| self.materialize(mapper.id(), row))
            .collect()
    }

    /// Values of `columns` on `entity`, as stored in the database. Reloads
    /// the instance first when one of them is stale.
    fn stored_values(&mut self, entity: &Entity, columns: &[&'static str]) -> Result<Option<Vec<Value>>> {
        let missing = {
            let inner = entity.read();
            columns.iter().any(|c| {
                inner
                    .mapper()
                    .find_column(c)
                    .is_some_and(|i| inner.columns[i].value().is_none() && inner.columns[i].committed.is_none())
            })
        };
        if missing {
            if let Some(request) = self.column_request(entity)? {
                self.reload(&request)?;
            }
        }
        let inner = entity.read();
        Ok(columns
            .iter()
            .map(|c| {
                let slot = &inner.columns[inner.mapper().find_column(c)?];
                slot.committed
                    .clone()
                    .or_else(|| slot.value().cloned())
                    .filter(|v| !v.is_null())
            })
            .collect())
    }

    /// Fetch rows on the far side of relationship `index`, before merging
    /// in unflushed history.
    fn fetch_related(&mut self, entity: &Entity, index: usize) -> Result<Vec<Entity>> {
        let registry = entity.registry();
        let rel = registry.mapper(entity.mapper_id()).relationship_at(index);
        let target = registry.mapper(rel.target_id());
        match rel.kind() {
            RelationshipKind::ManyToOne => {
                let current: Option<Vec<Value>> = {
                    let inner = entity.read();
                    rel.fk_columns()
                        .iter()
                        .map(|c| inner.value_of(c).filter(|v| !v.is_null()).cloned())
                        .collect()
                };
                let values = match current {
                    Some(values) => Some(values),
                    None => self.stored_values(entity, rel.fk_columns())?,
                };
                let Some(values) = values else {
                    return Ok(Vec::new());
                };
                if rel.ref_columns() == target.primary_key_columns().as_slice() {
                    let key = IdentityKey::new(target.name(), values.clone(), target.discriminator());
                    if let Some(tracked) = self.map.lookup(&key) {
                        return Ok(vec![tracked.entity]);
                    }
                }
                self.select_entities(target, rel.ref_columns().to_vec(), values)
            }
            RelationshipKind::OneToMany | RelationshipKind::OneToOne => {
                let Some(values) = self.stored_values(entity, rel.ref_columns())? else {
                    return Ok(Vec::new());
                };
                self.select_entities(target, rel.fk_columns().to_vec(), values)
            }
            RelationshipKind::ManyToMany => {
                let Some(secondary) = rel.secondary().cloned() else {
                    return Ok(Vec::new());
                };
                let Some(key) = entity.read().committed_primary_key() else {
                    return Ok(Vec::new());
                };
                let rows = self.select(
                    secondary.table,
                    secondary.remote_columns.to_vec(),
                    secondary.local_columns.to_vec(),
                    key,
                )?;
                let mut members = Vec::with_capacity(rows.len());
                for row in rows {
                    let pk: Vec<Value> = row.values().cloned().collect();
                    let key = IdentityKey::new(target.name(), pk.clone(), target.discriminator());
                    match self.map.lookup(&key) {
                        Some(tracked) => members.push(tracked.entity),
                        None => members.extend(self.select_entities(
                            target,
                            target.primary_key_columns(),
                            pk,
                        )?),
                    }
                }
                Ok(members)
            }
        }
    }

    /// Load relationship `index` of `entity` and install it, keeping
    /// unflushed additions and removals on top of what the database holds.
    pub(crate) fn load_relationship(&mut self, entity: &Entity, index: usize) -> Result<Vec<Entity>> {
        let stored = entity.read().key.is_some();
        let mut members = if stored {
            self.fetch_related(entity, index)?
        } else {
            Vec::new()
        };
        let (added, removed, collection) = {
            let inner = entity.read();
            let slot = &inner.relations[index];
            (
                slot.added.clone(),
                slot.removed.clone(),
                inner.mapper().relationship_at(index).is_collection(),
            )
        };
        members.retain(|m| !removed.iter().any(|r| r.id() == m.id()));
        if collection {
            for member in added {
                if !members.iter().any(|m| m.id() == member.id()) {
                    members.push(member);
                }
            }
        } else if let Some(last) = added.last() {
            members = vec![last.clone()];
        } else {
            members.truncate(1);
        }
        cascade::fill_relationship(entity, index, &members);
        tracing::trace!(instance = entity.id(), index, members = members.len(), "relationship loaded");
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::AttributeState;
    use crate::testing::{blog, family};
    use sessionkit_memory::MemoryDatabase;

    fn seeded() -> (MemoryDatabase, Session<sessionkit_memory::MemoryConnection>) {
        let registry = family();
        let db = MemoryDatabase::from_registry(&registry);
        db.seed("parents", &[("id", Value::BigInt(1)), ("name", Value::from("p"))])
            .unwrap();
        db.seed(
            "children",
            &[
                ("id", Value::BigInt(10)),
                ("name", Value::from("c")),
                ("parent_id", Value::BigInt(1)),
            ],
        )
        .unwrap();
        let session = Session::new(registry, db.connect());
        (db, session)
    }

    fn parent_key(session: &Session<sessionkit_memory::MemoryConnection>) -> IdentityKey {
        session.identity_key_for("Parent", vec![Value::BigInt(1)]).unwrap()
    }

    #[test]
    fn test_get_returns_identical_instance() {
        let (_db, mut session) = seeded();
        let key = parent_key(&session);
        let a = session.get(&key).unwrap().unwrap();
        let b = session.get(&key).unwrap().unwrap();
        assert!(a.ptr_eq(&b));
        assert_eq!(session.connection().log().count("SELECT"), 1);
        let missing = session.identity_key_for("Parent", vec![Value::BigInt(9)]).unwrap();
        assert!(session.get(&missing).unwrap().is_none());
    }

    #[test]
    fn test_jointly_stale_columns_reload_once() {
        let (_db, mut session) = seeded();
        let key = session.identity_key_for("Child", vec![Value::BigInt(10)]).unwrap();
        let child = session.get(&key).unwrap().unwrap();
        session.expire(&child, &[]).unwrap();
        assert!(child.peek("name").unwrap().needs_reload());

        let log = session.connection().log();
        log.clear();
        let request = session.on_stale_access(&child, "name").unwrap().unwrap();
        assert_eq!(request.columns, vec!["name", "parent_id"]);
        assert_eq!(session.get_attr(&child, "name").unwrap(), Value::from("c"));
        assert_eq!(session.get_attr(&child, "parent_id").unwrap(), Value::BigInt(1));
        assert_eq!(log.count("SELECT"), 1);
    }

    #[test]
    fn test_expire_keeps_later_edits() {
        let (_db, mut session) = seeded();
        let key = session.identity_key_for("Child", vec![Value::BigInt(10)]).unwrap();
        let child = session.get(&key).unwrap().unwrap();
        session.expire(&child, &[]).unwrap();
        child.set("name", "edited").unwrap();
        assert_eq!(session.get_attr(&child, "parent_id").unwrap(), Value::BigInt(1));
        assert_eq!(child.peek("name").unwrap().ready(), Some(Value::from("edited")));
        assert!(child.is_modified());
    }

    #[test]
    fn test_expire_skips_modified_and_primary_key() {
        let (_db, mut session) = seeded();
        let key = parent_key(&session);
        let parent = session.get(&key).unwrap().unwrap();
        parent.set("name", "local").unwrap();
        session.expire(&parent, &[]).unwrap();
        assert_eq!(parent.attribute_state("id").unwrap(), AttributeState::Loaded(Value::BigInt(1)));
        assert_eq!(parent.peek("name").unwrap().ready(), Some(Value::from("local")));
    }

    #[test]
    fn test_refresh_attrs_discards_only_named_edits() {
        let (_db, mut session) = seeded();
        let key = session.identity_key_for("Child", vec![Value::BigInt(10)]).unwrap();
        let child = session.get(&key).unwrap().unwrap();
        child.set("name", "x").unwrap();
        child.set("parent_id", Value::Null).unwrap();
        session.refresh_attrs(&child, &["name"]).unwrap();
        assert_eq!(child.peek("name").unwrap().ready(), Some(Value::from("c")));
        assert_eq!(child.peek("parent_id").unwrap().ready(), Some(Value::Null));
        assert_eq!(child.modified_attributes(), vec!["parent_id"]);
    }

    #[test]
    fn test_reload_of_deleted_row_is_stale_reference() {
        let (db, mut session) = seeded();
        let key = parent_key(&session);
        let parent = session.get(&key).unwrap().unwrap();
        session.commit().unwrap();
        db.delete_where("children", &[("id", Value::BigInt(10))]).unwrap();
        db.delete_where("parents", &[("id", Value::BigInt(1))]).unwrap();

        let err = session.get_attr(&parent, "name").unwrap_err();
        assert!(matches!(err, Error::StaleReference(_)));
        assert!(matches!(parent.peek("name").unwrap_err(), Error::StaleReference(_)));
    }

    #[test]
    fn test_expire_rejects_non_persistent() {
        let (_db, mut session) = seeded();
        let registry = family();
        let transient = Entity::new(&registry, "Parent").unwrap();
        let err = session.expire(&transient, &[]).unwrap_err();
        assert_eq!(err.invalid_request_kind(), Some(InvalidRequestKind::NotPersistent));
        let key = parent_key(&session);
        let parent = session.get(&key).unwrap().unwrap();
        let err = session.expire(&parent, &["nope"]).unwrap_err();
        assert_eq!(err.invalid_request_kind(), Some(InvalidRequestKind::UnknownAttribute));
    }

    #[test]
    fn test_lazy_collection_load_links_parents() {
        let (_db, mut session) = seeded();
        let key = parent_key(&session);
        let parent = session.get(&key).unwrap().unwrap();
        assert!(parent.related("children").unwrap().needs_reload());
        let children = session.related(&parent, "children").unwrap();
        assert_eq!(children.len(), 1);
        let back = session.related(&children[0], "parent").unwrap();
        assert!(back[0].ptr_eq(&parent));
    }

    #[test]
    fn test_many_to_many_load_uses_association_table() {
        let registry = blog();
        let db = MemoryDatabase::from_registry(&registry);
        db.seed("posts", &[("id", Value::BigInt(1)), ("title", Value::from("t"))]).unwrap();
        db.seed("tags", &[("id", Value::BigInt(5)), ("label", Value::from("rust"))]).unwrap();
        db.seed("post_tags", &[("post_id", Value::BigInt(1)), ("tag_id", Value::BigInt(5))])
            .unwrap();
        let mut session = Session::new(registry, db.connect());
        let key = session.identity_key_for("Post", vec![Value::BigInt(1)]).unwrap();
        let post = session.get(&key).unwrap().unwrap();
        let tags = session.related(&post, "tags").unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].peek("label").unwrap().ready(), Some(Value::from("rust")));
    }

    #[test]
    fn test_detached_instance_cannot_reload() {
        let (_db, mut session) = seeded();
        let key = parent_key(&session);
        let parent = session.get(&key).unwrap().unwrap();
        session.expire(&parent, &["name"]).unwrap();
        session.expunge(&parent).unwrap();
        let err = session.get_attr(&parent, "name").unwrap_err();
        assert_eq!(err.invalid_request_kind(), Some(InvalidRequestKind::Detached));
    }
}
