//! Entity handles and per-attribute state.
//!
//! An [`Entity`] is a cheap, clonable handle to one mapped instance. The
//! instance itself lives behind an `RwLock` so handles can cross threads, but
//! the engine never holds two instance locks at once: every relationship
//! mutation below touches one side, releases it, then touches the other.
//!
//! Column slots remember the last committed value next to the current one, so
//! "modified" is a comparison rather than a flag the caller has to maintain.
//! Relationship slots keep an added/removed history since the last flush;
//! history holds strong handles, loaded values on the weak side of a
//! `back_populates` pair do not.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use serde::Serialize;
use sessionkit_core::{
    Cascade, Error, IdentityKey, InvalidRequestKind, Mapper, MapperId, Registry, Relationship,
    Result, StaleReferenceError, Value,
};

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of an instance relative to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntityState {
    /// Not tracked and has no identity key.
    Transient,
    /// Tracked, INSERT not yet flushed.
    Pending,
    /// Tracked, backed by a row.
    Persistent,
    /// Tracked, DELETE scheduled or flushed but not yet committed.
    Deleted,
    /// Has an identity key but is no longer tracked.
    Detached,
}

/// Load state of one column attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeState {
    Loaded(Value),
    /// Never fetched.
    Unloaded,
    /// Expired; the next access reloads it.
    Stale,
}

/// Result of a non-blocking attribute read.
#[derive(Debug, Clone, PartialEq)]
pub enum Access<T> {
    Ready(T),
    /// The value must be fetched first, see `Session::on_stale_access`.
    NeedsReload,
}

impl<T> Access<T> {
    pub fn ready(self) -> Option<T> {
        match self {
            Access::Ready(value) => Some(value),
            Access::NeedsReload => None,
        }
    }

    pub fn needs_reload(&self) -> bool {
        matches!(self, Access::NeedsReload)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ColumnSlot {
    pub(crate) state: AttributeState,
    /// Value as last read from or written to the database.
    pub(crate) committed: Option<Value>,
    pub(crate) modified: bool,
}

impl ColumnSlot {
    fn unloaded() -> Self {
        Self {
            state: AttributeState::Unloaded,
            committed: None,
            modified: false,
        }
    }

    pub(crate) fn value(&self) -> Option<&Value> {
        match &self.state {
            AttributeState::Loaded(value) => Some(value),
            _ => None,
        }
    }

    /// Local edit.
    pub(crate) fn assign(&mut self, value: Value) {
        self.modified = self
            .committed
            .as_ref()
            .is_none_or(|c| !c.to_key_form().same_as(&value.to_key_form()));
        self.state = AttributeState::Loaded(value);
    }

    /// Value that now matches the database row.
    pub(crate) fn load(&mut self, value: Value) {
        self.committed = Some(value.clone());
        self.state = AttributeState::Loaded(value);
        self.modified = false;
    }

    pub(crate) fn expire(&mut self) {
        self.state = AttributeState::Stale;
        self.committed = None;
        self.modified = false;
    }

    fn commit(&mut self) {
        if let AttributeState::Loaded(value) = &self.state {
            self.committed = Some(value.clone());
        }
        self.modified = false;
    }
}

/// A relationship value: strong for forward references, weak on the reverse
/// side of a bidirectional pair.
#[derive(Clone)]
pub(crate) enum Link {
    Strong(Entity),
    Weak(WeakEntity),
}

impl Link {
    fn to(entity: &Entity, weak: bool) -> Self {
        if weak {
            Link::Weak(entity.downgrade())
        } else {
            Link::Strong(entity.clone())
        }
    }

    pub(crate) fn id(&self) -> u64 {
        match self {
            Link::Strong(entity) => entity.id,
            Link::Weak(weak) => weak.id,
        }
    }

    pub(crate) fn get(&self) -> Option<Entity> {
        match self {
            Link::Strong(entity) => Some(entity.clone()),
            Link::Weak(weak) => weak.upgrade(),
        }
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Link::Strong(entity) => write!(f, "Strong({})", entity.id),
            Link::Weak(weak) => write!(f, "Weak({})", weak.id),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum RelationState {
    Loaded(Vec<Link>),
    Unloaded,
    Stale,
}

#[derive(Debug, Clone)]
pub(crate) struct RelationSlot {
    pub(crate) state: RelationState,
    pub(crate) added: Vec<Entity>,
    pub(crate) removed: Vec<Entity>,
    /// Any mutation since the last flush, including clearing a scalar whose
    /// previous value was never loaded.
    pub(crate) touched: bool,
}

impl RelationSlot {
    fn new(loaded: bool) -> Self {
        Self {
            state: if loaded {
                RelationState::Loaded(Vec::new())
            } else {
                RelationState::Unloaded
            },
            added: Vec::new(),
            removed: Vec::new(),
            touched: false,
        }
    }

    /// Live members, or `None` when the value has to be loaded first. A dead
    /// weak link counts as unloaded.
    pub(crate) fn members(&self) -> Option<Vec<Entity>> {
        match &self.state {
            RelationState::Loaded(links) => links.iter().map(Link::get).collect(),
            RelationState::Unloaded | RelationState::Stale => None,
        }
    }

    pub(crate) fn contains(&self, id: u64) -> bool {
        match &self.state {
            RelationState::Loaded(links) => links.iter().any(|l| l.id() == id),
            _ => self.added.iter().any(|e| e.id == id),
        }
    }

    pub(crate) fn has_history(&self) -> bool {
        self.touched || !self.added.is_empty() || !self.removed.is_empty()
    }

    pub(crate) fn clear_history(&mut self) {
        self.added.clear();
        self.removed.clear();
        self.touched = false;
    }

    /// Replace the loaded value without recording history.
    pub(crate) fn fill(&mut self, members: &[Entity], weak: bool) {
        self.state =
            RelationState::Loaded(members.iter().map(|m| Link::to(m, weak)).collect());
    }

    fn add(&mut self, member: &Entity, weak: bool) {
        self.touched = true;
        if let RelationState::Loaded(links) = &mut self.state {
            if !links.iter().any(|l| l.id() == member.id) {
                links.push(Link::to(member, weak));
            }
        }
        if let Some(pos) = self.removed.iter().position(|e| e.id == member.id) {
            self.removed.remove(pos);
        } else if !self.added.iter().any(|e| e.id == member.id) {
            self.added.push(member.clone());
        }
    }

    fn remove(&mut self, member: &Entity) {
        self.touched = true;
        if let RelationState::Loaded(links) = &mut self.state {
            links.retain(|l| l.id() != member.id);
        }
        if let Some(pos) = self.added.iter().position(|e| e.id == member.id) {
            self.added.remove(pos);
        } else if !self.removed.iter().any(|e| e.id == member.id) {
            self.removed.push(member.clone());
        }
    }
}

/// Weak back-pointer from a member to the instance whose one-to-many or
/// one-to-one relationship holds it.
#[derive(Debug, Clone)]
pub(crate) struct ParentLink {
    pub(crate) owner: MapperId,
    pub(crate) relationship: usize,
    pub(crate) parent: WeakEntity,
}

#[derive(Debug)]
pub(crate) struct Instance {
    pub(crate) registry: Arc<Registry>,
    pub(crate) mapper: MapperId,
    pub(crate) columns: Vec<ColumnSlot>,
    pub(crate) relations: Vec<RelationSlot>,
    pub(crate) parents: Vec<ParentLink>,
    /// Was attached to some parent at least once.
    pub(crate) ever_parented: bool,
    /// Removed from a delete-orphan relationship since the last flush.
    pub(crate) orphan_candidate: bool,
    pub(crate) state: EntityState,
    /// Id of the session whose identity map tracks this instance.
    pub(crate) owner: Option<u64>,
    pub(crate) key: Option<IdentityKey>,
    /// A reload found the row deleted.
    pub(crate) row_gone: bool,
}

impl Instance {
    pub(crate) fn mapper(&self) -> &Mapper {
        self.registry.mapper(self.mapper)
    }

    pub(crate) fn check_usable(&self) -> Result<()> {
        if self.row_gone {
            return Err(StaleReferenceError {
                mapper: self.mapper().name().to_string(),
                key: self
                    .key
                    .as_ref()
                    .map_or_else(|| "?".to_string(), ToString::to_string),
            }
            .into());
        }
        Ok(())
    }

    pub(crate) fn column_index(&self, name: &str) -> Result<usize> {
        self.mapper().find_column(name).ok_or_else(|| {
            Error::invalid(
                InvalidRequestKind::UnknownAttribute,
                format!("{} has no column '{}'", self.mapper().name(), name),
            )
        })
    }

    pub(crate) fn relationship_index(&self, name: &str) -> Result<usize> {
        self.mapper().find_relationship(name).ok_or_else(|| {
            Error::invalid(
                InvalidRequestKind::UnknownAttribute,
                format!("{} has no relationship '{}'", self.mapper().name(), name),
            )
        })
    }

    pub(crate) fn value_of(&self, column: &str) -> Option<&Value> {
        self.mapper()
            .find_column(column)
            .and_then(|i| self.columns[i].value())
    }

    /// Current primary key, or `None` while any component is unloaded or NULL.
    pub(crate) fn primary_key(&self) -> Option<Vec<Value>> {
        self.mapper()
            .primary_key_indices()
            .iter()
            .map(|&i| self.columns[i].value().filter(|v| !v.is_null()).cloned())
            .collect()
    }

    /// Key the row is currently stored under in the database.
    pub(crate) fn committed_primary_key(&self) -> Option<Vec<Value>> {
        self.mapper()
            .primary_key_indices()
            .iter()
            .map(|&i| {
                let slot = &self.columns[i];
                slot.committed
                    .clone()
                    .or_else(|| slot.value().cloned())
                    .filter(|v| !v.is_null())
            })
            .collect()
    }

    pub(crate) fn compute_key(&self) -> Option<IdentityKey> {
        let mapper = self.mapper();
        self.primary_key()
            .map(|pk| IdentityKey::new(mapper.name(), pk, mapper.discriminator()))
    }

    pub(crate) fn primary_key_changed(&self) -> bool {
        self.mapper()
            .primary_key_indices()
            .iter()
            .any(|&i| self.columns[i].modified && self.columns[i].committed.is_some())
    }

    pub(crate) fn modified_columns(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.modified)
            .map(|(i, _)| i)
            .collect()
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.columns.iter().any(|c| c.modified) || self.relations.iter().any(RelationSlot::has_history)
    }

    /// Everything now matches the database.
    pub(crate) fn mark_clean(&mut self) {
        for slot in &mut self.columns {
            slot.commit();
        }
        for slot in &mut self.relations {
            slot.clear_history();
        }
        self.orphan_candidate = false;
    }

    /// Forget what the database holds, so the next INSERT writes every
    /// loaded column.
    pub(crate) fn mark_uncommitted(&mut self) {
        for slot in &mut self.columns {
            slot.committed = None;
            slot.modified = matches!(slot.state, AttributeState::Loaded(_));
        }
    }

    pub(crate) fn link_parent(&mut self, owner: MapperId, relationship: usize, parent: &Entity) {
        self.ever_parented = true;
        let present = self.parents.iter().any(|l| {
            l.owner == owner && l.relationship == relationship && l.parent.id == parent.id
        });
        if !present {
            self.parents.push(ParentLink {
                owner,
                relationship,
                parent: parent.downgrade(),
            });
        }
    }

    fn unlink_parent(&mut self, owner: MapperId, relationship: usize, parent: u64, orphan: bool) {
        self.parents.retain(|l| {
            !(l.owner == owner && l.relationship == relationship && l.parent.id == parent)
        });
        if orphan {
            self.orphan_candidate = true;
        }
    }
}

/// Shared handle to a mapped instance.
///
/// Equality and hashing are by instance identity, never by value.
#[derive(Clone)]
pub struct Entity {
    id: u64,
    inner: Arc<RwLock<Instance>>,
}

/// Non-owning counterpart of [`Entity`].
#[derive(Clone)]
pub struct WeakEntity {
    id: u64,
    inner: Weak<RwLock<Instance>>,
}

impl WeakEntity {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn upgrade(&self) -> Option<Entity> {
        self.inner.upgrade().map(|inner| Entity { id: self.id, inner })
    }

    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

impl fmt::Debug for WeakEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakEntity")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

fn wrong_kind(mapper: &Mapper, rel: &Relationship, expected: &str) -> Error {
    Error::invalid(
        InvalidRequestKind::WrongRelationshipKind,
        format!("{}.{} is not {}", mapper.name(), rel.name(), expected),
    )
}

impl Entity {
    /// Create a transient instance of the named mapper. Columns start
    /// unloaded and read as NULL until set.
    pub fn new(registry: &Arc<Registry>, mapper: &str) -> Result<Self> {
        let mapper = registry.by_name(mapper)?;
        Ok(Self::blank(registry, mapper.id(), true))
    }

    /// `relations_loaded` is true for brand-new instances, which start with
    /// empty relationships rather than unknown ones.
    pub(crate) fn blank(registry: &Arc<Registry>, mapper: MapperId, relations_loaded: bool) -> Self {
        let meta = registry.mapper(mapper);
        let instance = Instance {
            registry: Arc::clone(registry),
            mapper,
            columns: meta.columns().iter().map(|_| ColumnSlot::unloaded()).collect(),
            relations: meta
                .relationships()
                .iter()
                .map(|_| RelationSlot::new(relations_loaded))
                .collect(),
            parents: Vec::new(),
            ever_parented: false,
            orphan_candidate: false,
            state: EntityState::Transient,
            owner: None,
            key: None,
            row_gone: false,
        };
        Self {
            id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            inner: Arc::new(RwLock::new(instance)),
        }
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Instance> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Instance> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn strong_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Process-unique instance id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn ptr_eq(&self, other: &Entity) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn downgrade(&self) -> WeakEntity {
        WeakEntity {
            id: self.id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn mapper_name(&self) -> &'static str {
        self.read().mapper().name()
    }

    pub(crate) fn mapper_id(&self) -> MapperId {
        self.read().mapper
    }

    pub(crate) fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.read().registry)
    }

    pub fn state(&self) -> EntityState {
        self.read().state
    }

    pub fn identity_key(&self) -> Option<IdentityKey> {
        self.read().key.clone()
    }

    /// Local edits or relationship changes not yet flushed.
    pub fn is_modified(&self) -> bool {
        self.read().is_dirty()
    }

    /// Names of modified columns and relationships with unflushed history.
    pub fn modified_attributes(&self) -> Vec<&'static str> {
        let inner = self.read();
        let mapper = inner.mapper();
        let mut names: Vec<&'static str> = inner
            .modified_columns()
            .into_iter()
            .map(|i| mapper.columns()[i].name)
            .collect();
        names.extend(
            inner
                .relations
                .iter()
                .enumerate()
                .filter(|(_, slot)| slot.has_history())
                .map(|(i, _)| mapper.relationship_at(i).name()),
        );
        names
    }

    pub fn set(&self, column: &str, value: impl Into<Value>) -> Result<()> {
        let mut inner = self.write();
        inner.check_usable()?;
        let index = inner.column_index(column)?;
        inner.columns[index].assign(value.into());
        Ok(())
    }

    /// Builder form of [`Entity::set`].
    pub fn with(self, column: &str, value: impl Into<Value>) -> Result<Self> {
        self.set(column, value)?;
        Ok(self)
    }

    /// Read a column without touching the database.
    pub fn peek(&self, column: &str) -> Result<Access<Value>> {
        let inner = self.read();
        inner.check_usable()?;
        let index = inner.column_index(column)?;
        Ok(match &inner.columns[index].state {
            AttributeState::Loaded(value) => Access::Ready(value.clone()),
            _ if inner.key.is_none() => Access::Ready(Value::Null),
            _ => Access::NeedsReload,
        })
    }

    pub fn attribute_state(&self, column: &str) -> Result<AttributeState> {
        let inner = self.read();
        let index = inner.column_index(column)?;
        Ok(inner.columns[index].state.clone())
    }

    /// Read a relationship without touching the database. Scalars yield at
    /// most one member.
    pub fn related(&self, name: &str) -> Result<Access<Vec<Entity>>> {
        let inner = self.read();
        inner.check_usable()?;
        let index = inner.relationship_index(name)?;
        let slot = &inner.relations[index];
        Ok(match slot.members() {
            Some(members) => Access::Ready(members),
            None if inner.key.is_none() => Access::Ready(slot.added.clone()),
            None => Access::NeedsReload,
        })
    }

    /// Point a many-to-one or one-to-one relationship at `target`, keeping
    /// the reciprocal side in step.
    pub fn set_related(&self, name: &str, target: Option<&Entity>) -> Result<()> {
        let (registry, owner, index) = self.locate(name)?;
        let mapper = registry.mapper(owner);
        let rel = mapper.relationship_at(index);
        if rel.is_collection() {
            return Err(wrong_kind(mapper, rel, "a scalar relationship"));
        }
        if let Some(target) = target {
            check_target(&registry, rel, target)?;
        }
        let previous = self.scalar_target(index);
        if previous.is_some() && previous.as_ref().map(Entity::id) == target.map(Entity::id) {
            return Ok(());
        }
        self.replace_scalar(rel, index, owner, target, previous.as_ref());

        let Some(reverse_index) = rel.reverse() else {
            return Ok(());
        };
        let target_mapper = rel.target_id();
        let reverse = registry.mapper(target_mapper).relationship_at(reverse_index);
        if let Some(old) = &previous {
            if reverse.is_collection() {
                old.remove_member(reverse, reverse_index, target_mapper, self);
            } else if old.scalar_target(reverse_index).is_some_and(|e| e.id == self.id) {
                old.replace_scalar(reverse, reverse_index, target_mapper, None, Some(self));
            }
        }
        if let Some(new) = target {
            if reverse.is_collection() {
                if !new.read().relations[reverse_index].contains(self.id) {
                    new.add_member(reverse, reverse_index, target_mapper, self);
                }
            } else {
                let displaced = new.scalar_target(reverse_index);
                if displaced.as_ref().map(Entity::id) != Some(self.id) {
                    new.replace_scalar(reverse, reverse_index, target_mapper, Some(self), displaced.as_ref());
                    if let Some(displaced) = displaced {
                        displaced.replace_scalar(rel, index, owner, None, Some(new));
                    }
                }
            }
        }
        Ok(())
    }

    /// Add `member` to a collection relationship.
    pub fn append(&self, name: &str, member: &Entity) -> Result<()> {
        let (registry, owner, index) = self.locate(name)?;
        let mapper = registry.mapper(owner);
        let rel = mapper.relationship_at(index);
        if !rel.is_collection() {
            return Err(wrong_kind(mapper, rel, "a collection"));
        }
        check_target(&registry, rel, member)?;
        if self.read().relations[index].contains(member.id) {
            return Ok(());
        }
        self.add_member(rel, index, owner, member);

        let Some(reverse_index) = rel.reverse() else {
            return Ok(());
        };
        let target_mapper = rel.target_id();
        let reverse = registry.mapper(target_mapper).relationship_at(reverse_index);
        if reverse.is_collection() {
            member.add_member(reverse, reverse_index, target_mapper, self);
        } else {
            let previous = member.scalar_target(reverse_index);
            if previous.as_ref().map(Entity::id) != Some(self.id) {
                member.replace_scalar(reverse, reverse_index, target_mapper, Some(self), previous.as_ref());
                if let Some(old) = previous {
                    old.remove_member(rel, index, owner, member);
                }
            }
        }
        Ok(())
    }

    /// Remove `member` from a collection relationship.
    pub fn remove(&self, name: &str, member: &Entity) -> Result<()> {
        let (registry, owner, index) = self.locate(name)?;
        let mapper = registry.mapper(owner);
        let rel = mapper.relationship_at(index);
        if !rel.is_collection() {
            return Err(wrong_kind(mapper, rel, "a collection"));
        }
        self.remove_member(rel, index, owner, member);

        let Some(reverse_index) = rel.reverse() else {
            return Ok(());
        };
        let target_mapper = rel.target_id();
        let reverse = registry.mapper(target_mapper).relationship_at(reverse_index);
        if reverse.is_collection() {
            member.remove_member(reverse, reverse_index, target_mapper, self);
        } else if member.scalar_target(reverse_index).is_some_and(|e| e.id == self.id) {
            member.replace_scalar(reverse, reverse_index, target_mapper, None, Some(self));
        }
        Ok(())
    }

    fn locate(&self, name: &str) -> Result<(Arc<Registry>, MapperId, usize)> {
        let inner = self.read();
        inner.check_usable()?;
        let index = inner.relationship_index(name)?;
        Ok((Arc::clone(&inner.registry), inner.mapper, index))
    }

    /// Current live value of a scalar relationship, if loaded.
    pub(crate) fn scalar_target(&self, index: usize) -> Option<Entity> {
        self.read().relations[index]
            .members()
            .and_then(|members| members.into_iter().next())
    }

    /// Record `member` in this side's slot; links the member back when it
    /// holds the foreign key.
    pub(crate) fn add_member(&self, rel: &Relationship, index: usize, owner: MapperId, member: &Entity) {
        self.write().relations[index].add(member, rel.is_weak());
        if rel.fk_on_target() {
            member.write().link_parent(owner, index, self);
        }
    }

    pub(crate) fn remove_member(&self, rel: &Relationship, index: usize, owner: MapperId, member: &Entity) {
        self.write().relations[index].remove(member);
        if rel.fk_on_target() {
            let orphan = rel.cascade_rules().contains(Cascade::DELETE_ORPHAN);
            member.write().unlink_parent(owner, index, self.id, orphan);
        }
    }

    pub(crate) fn replace_scalar(
        &self,
        rel: &Relationship,
        index: usize,
        owner: MapperId,
        target: Option<&Entity>,
        previous: Option<&Entity>,
    ) {
        if let Some(previous) = previous {
            self.remove_member(rel, index, owner, previous);
        } else {
            self.settle_unknown_scalar(rel, index);
        }
        match target {
            Some(target) => self.add_member(rel, index, owner, target),
            None => self.write().relations[index].touched = true,
        }
    }

    /// A scalar assigned before its old value was loaded: the assignment
    /// becomes the loaded value, and the unseen old parent counts as lost.
    fn settle_unknown_scalar(&self, rel: &Relationship, index: usize) {
        let mut inner = self.write();
        let slot = &mut inner.relations[index];
        if slot.members().is_some() {
            return;
        }
        slot.fill(&[], rel.is_weak());
        slot.touched = true;
        if rel.fk_on_target() {
            return;
        }
        let governed = rel.reverse().is_some_and(|reverse| {
            let parent = inner.registry.mapper(rel.target_id()).relationship_at(reverse);
            parent.fk_on_target() && parent.cascade_rules().contains(Cascade::DELETE_ORPHAN)
        });
        if governed {
            inner.orphan_candidate = true;
        }
    }
}

fn check_target(registry: &Registry, rel: &Relationship, member: &Entity) -> Result<()> {
    let actual = member.mapper_id();
    if actual == rel.target_id() {
        return Ok(());
    }
    Err(Error::invalid(
        InvalidRequestKind::WrongRelationshipKind,
        format!(
            "relationship '{}' holds {} instances, not {}",
            rel.name(),
            rel.target(),
            registry.mapper(actual).name()
        ),
    ))
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Entity {}

impl Hash for Entity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("Entity");
        out.field("id", &self.id);
        // Never block inside Debug.
        if let Ok(inner) = self.inner.try_read() {
            out.field("mapper", &inner.mapper().name())
                .field("state", &inner.state)
                .field("key", &inner.key);
        }
        out.finish()
    }
}
