//! Unit of work: turning tracked state into an ordered list of writes.
//!
//! A flush runs in two halves. The first half (this module) is
//! side-effect free against the database apart from relationship loads: it
//! runs the save-update cascade, settles deletes and orphans, derives the
//! foreign-key writes implied by relationship history, and builds a
//! dependency graph over the pending operations. The graph is made acyclic
//! by deferring foreign keys to post-updates, then sorted with a stable
//! `(phase, mapper declaration order, tracking order)` tie-break. The second
//! half, in `flush`, executes the plan.
//!
//! Edges come from two sources:
//!
//! - instance level: a child's foreign key copied from a parent makes the
//!   parent's save precede the child's save, a deleted child precede its
//!   deleted parent, and a child moved off a deleted parent precede that
//!   parent's delete;
//! - table level: for mapper pairs that are not part of a foreign key cycle,
//!   every save of the referenced mapper precedes every save of the
//!   dependent one, and deletes run the other way.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use sessionkit_core::{
    AssociationTable, Cascade, Connection, Error, FlushErrorKind, IdentityKey, MapperId, Registry,
    Relationship, RelationshipKind, Result,
};

use crate::Session;
use crate::cascade::{self, CascadeOp, OrphanStatus};
use crate::instance::{Entity, EntityState, RelationState};

/// A foreign key write derived from relationship state: copy the parent's
/// referenced columns into the holder's foreign key columns, or write NULL.
#[derive(Debug, Clone)]
pub(crate) struct FkSync {
    pub(crate) columns: Vec<&'static str>,
    pub(crate) parent: Option<Entity>,
    pub(crate) parent_columns: Vec<&'static str>,
    pub(crate) nullable: bool,
    /// Either side of the relationship asked for `post_update`.
    pub(crate) post_update: bool,
    /// Cycle-breaking preference among equally eligible edges.
    pub(crate) order: (MapperId, &'static str),
    /// Written by a later post-update instead of the holder's own statement.
    pub(crate) deferred: bool,
}

impl FkSync {
    fn new(
        registry: &Registry,
        holder: MapperId,
        rel: &Relationship,
        parent: Option<Entity>,
    ) -> Self {
        let columns = rel.fk_columns().to_vec();
        let first = columns.first().copied().unwrap_or_default();
        Self {
            parent_columns: rel.ref_columns().to_vec(),
            nullable: rel.fk_nullable(),
            post_update: prefers_post_update(registry, rel),
            order: (holder, first),
            deferred: false,
            columns,
            parent,
        }
    }
}

fn prefers_post_update(registry: &Registry, rel: &Relationship) -> bool {
    rel.is_post_update()
        || rel.reverse().is_some_and(|r| {
            registry
                .mapper(rel.target_id())
                .relationship_at(r)
                .is_post_update()
        })
}

/// One row of a many-to-many association table.
#[derive(Debug, Clone)]
pub(crate) struct AssociationRow {
    pub(crate) table: &'static str,
    pub(crate) local_columns: &'static [&'static str],
    pub(crate) remote_columns: &'static [&'static str],
    pub(crate) local: Entity,
    pub(crate) remote: Entity,
}

impl AssociationRow {
    fn new(secondary: &AssociationTable, local: &Entity, remote: &Entity) -> Self {
        Self {
            table: secondary.table,
            local_columns: secondary.local_columns,
            remote_columns: secondary.remote_columns,
            local: local.clone(),
            remote: remote.clone(),
        }
    }

    /// The same row seen from either side of a bidirectional pair compares
    /// equal.
    fn identity(&self) -> (&'static str, Vec<(&'static str, u64)>) {
        let mut cells: Vec<(&'static str, u64)> = self
            .local_columns
            .iter()
            .map(|c| (*c, self.local.id()))
            .chain(self.remote_columns.iter().map(|c| (*c, self.remote.id())))
            .collect();
        cells.sort_unstable();
        (self.table, cells)
    }
}

#[derive(Debug, Clone)]
pub(crate) enum OpKind {
    Insert,
    /// `row_switch` names the deleted instance whose row this UPDATE reuses.
    Update { row_switch: Option<Entity> },
    Delete,
    PostUpdate(FkSync),
    /// NULL a foreign key so a cycle of deletes can proceed.
    PreDeleteNull { columns: Vec<&'static str> },
    LinkInsert(AssociationRow),
    LinkDelete(AssociationRow),
    /// Remove every association row pointing at a deleted endpoint.
    LinkPurge {
        table: &'static str,
        columns: &'static [&'static str],
    },
}

impl OpKind {
    fn phase(&self) -> u8 {
        match self {
            OpKind::Insert | OpKind::Update { .. } => 0,
            OpKind::LinkInsert(_) => 1,
            OpKind::PostUpdate(_) => 2,
            OpKind::PreDeleteNull { .. } => 3,
            OpKind::LinkDelete(_) | OpKind::LinkPurge { .. } => 4,
            OpKind::Delete => 5,
        }
    }

    pub(crate) fn label(&self) -> &'static str {
        match self {
            OpKind::Insert => "insert",
            OpKind::Update { .. } => "update",
            OpKind::Delete => "delete",
            OpKind::PostUpdate(_) => "post_update",
            OpKind::PreDeleteNull { .. } => "pre_delete_null",
            OpKind::LinkInsert(_) => "link_insert",
            OpKind::LinkDelete(_) => "link_delete",
            OpKind::LinkPurge { .. } => "link_purge",
        }
    }

    fn is_save(&self) -> bool {
        matches!(self, OpKind::Insert | OpKind::Update { .. })
    }
}

/// A pending write against one instance.
#[derive(Debug, Clone)]
pub(crate) struct PendingOp {
    pub(crate) kind: OpKind,
    pub(crate) entity: Entity,
    pub(crate) mapper: MapperId,
    pub(crate) table: &'static str,
    pub(crate) seq: u64,
    /// Foreign key writes folded into this op's own statement.
    pub(crate) syncs: Vec<FkSync>,
}

/// Everything one flush has to write, before ordering.
#[derive(Debug, Default)]
pub(crate) struct FlushSet {
    pub(crate) inserts: Vec<Entity>,
    pub(crate) updates: Vec<Entity>,
    pub(crate) deletes: Vec<Entity>,
    /// `(insert, deleted instance)` pairs sharing an identity key.
    pub(crate) row_switches: Vec<(Entity, Entity)>,
    pub(crate) syncs: HashMap<u64, Vec<FkSync>>,
    /// `(child, parent)`: the child stops referencing a parent that is being
    /// deleted.
    pub(crate) former_parents: Vec<(Entity, Entity)>,
    /// `(child, parent, foreign key)` where both are deleted.
    pub(crate) delete_pairs: Vec<(Entity, Entity, FkSync)>,
    pub(crate) links: Vec<(OpKind, Entity)>,
    pub(crate) seqs: HashMap<u64, u64>,
    /// Parents whose key change must be copied into loaded children in
    /// memory once their UPDATE succeeds.
    pub(crate) passive_rewrites: Vec<Entity>,
    link_seen: HashSet<(u8, (&'static str, Vec<(&'static str, u64)>))>,
    purge_seen: HashSet<(&'static str, u64)>,
}

impl FlushSet {
    pub(crate) fn is_empty(&self) -> bool {
        self.inserts.is_empty()
            && self.updates.is_empty()
            && self.deletes.is_empty()
            && self.links.is_empty()
    }

    fn add_link(&mut self, insert: bool, row: AssociationRow) {
        if !self.link_seen.insert((u8::from(insert), row.identity())) {
            return;
        }
        let entity = row.local.clone();
        let kind = if insert {
            OpKind::LinkInsert(row)
        } else {
            OpKind::LinkDelete(row)
        };
        self.links.push((kind, entity));
    }

    fn add_purge(&mut self, secondary: &AssociationTable, endpoint: &Entity) {
        if !self.purge_seen.insert((secondary.table, endpoint.id())) {
            return;
        }
        self.links.push((
            OpKind::LinkPurge {
                table: secondary.table,
                columns: secondary.local_columns,
            },
            endpoint.clone(),
        ));
    }
}

/// Foreign key writes per holder; an assignment wins over a NULL for the
/// same columns.
#[derive(Default)]
struct SyncCollector {
    order: Vec<u64>,
    entries: HashMap<u64, (Entity, Vec<FkSync>)>,
}

impl SyncCollector {
    fn push(&mut self, holder: &Entity, sync: FkSync) {
        let entry = self.entries.entry(holder.id()).or_insert_with(|| {
            self.order.push(holder.id());
            (holder.clone(), Vec::new())
        });
        match entry.1.iter_mut().find(|s| s.columns == sync.columns) {
            Some(existing) => {
                if existing.parent.is_none() && sync.parent.is_some() {
                    *existing = sync;
                }
            }
            None => entry.1.push(sync),
        }
    }
}

/// Counts of pending operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PendingCounts {
    /// Objects pending INSERT.
    pub new: usize,
    /// Objects pending UPDATE.
    pub dirty: usize,
    /// Objects pending DELETE.
    pub deleted: usize,
}

impl PendingCounts {
    pub fn total(&self) -> usize {
        self.new + self.dirty + self.deleted
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

struct SlotView {
    touched: bool,
    added: Vec<Entity>,
    removed: Vec<Entity>,
    members: Option<Vec<Entity>>,
    loaded_empty: bool,
}

fn slot_view(entity: &Entity, index: usize) -> SlotView {
    let inner = entity.read();
    let slot = &inner.relations[index];
    SlotView {
        touched: slot.has_history(),
        added: slot.added.clone(),
        removed: slot.removed.clone(),
        members: slot.members(),
        loaded_empty: matches!(&slot.state, RelationState::Loaded(links) if links.is_empty()),
    }
}

impl<C: Connection> Session<C> {
    /// Settle cascades and orphans, then collect every write the flush has
    /// to perform.
    pub(crate) fn prepare_flush(&mut self) -> Result<FlushSet> {
        self.cascade_attach()?;
        self.settle_deletes()?;
        self.collect_flush_set()
    }

    fn cascade_attach(&mut self) -> Result<()> {
        for root in self.map.entities() {
            if !matches!(root.state(), EntityState::Pending | EntityState::Persistent) {
                continue;
            }
            let reached = cascade::expand(&root, CascadeOp::Attach, &mut |_, _| Ok(()))?;
            for (entity, _) in reached.into_iter().skip(1) {
                if !self.map.contains(&entity) {
                    self.attach(&entity)?;
                    tracing::trace!(instance = entity.id(), via = root.id(), "attached by cascade");
                }
            }
        }
        Ok(())
    }

    /// Run delete cascades from every deleted instance and resolve
    /// delete-orphan candidates until nothing changes.
    fn settle_deletes(&mut self) -> Result<()> {
        loop {
            let mut changed = false;
            for entity in self.map.all_deleted() {
                changed |= self.cascade_delete(&entity)?;
            }
            for entity in self.map.entities() {
                let (state, candidate) = {
                    let inner = entity.read();
                    (inner.state, inner.orphan_candidate)
                };
                match state {
                    EntityState::Pending => match cascade::orphan_status(&entity) {
                        OrphanStatus::Orphaned {
                            ever_parented: false,
                            relationships,
                        } => {
                            return Err(cascade::orphan_error(&entity, relationships).into());
                        }
                        OrphanStatus::Orphaned { .. } => {
                            tracing::debug!(instance = entity.id(), "pending orphan expunged");
                            self.expunge_one(&entity);
                            changed = true;
                        }
                        OrphanStatus::Owned | OrphanStatus::Ungoverned => {}
                    },
                    EntityState::Persistent if candidate => {
                        if let OrphanStatus::Orphaned { .. } = cascade::orphan_status(&entity) {
                            tracing::debug!(
                                instance = entity.id(),
                                mapper = entity.mapper_name(),
                                "orphan scheduled for delete"
                            );
                            entity.write().state = EntityState::Deleted;
                            changed = true;
                        }
                    }
                    _ => {}
                }
            }
            if !changed {
                return Ok(());
            }
        }
    }

    /// Apply the delete cascade from `root`. Returns whether anything new was
    /// scheduled or expunged.
    pub(crate) fn cascade_delete(&mut self, root: &Entity) -> Result<bool> {
        let reached = cascade::expand(root, CascadeOp::Delete, &mut |entity, index| {
            self.load_relationship(entity, index).map(|_| ())
        })?;
        let mut changed = false;
        for (entity, _) in reached.into_iter().skip(1) {
            if !self.map.contains(&entity) {
                continue;
            }
            match entity.state() {
                EntityState::Pending => {
                    self.expunge_one(&entity);
                    changed = true;
                }
                EntityState::Persistent => {
                    entity.write().state = EntityState::Deleted;
                    changed = true;
                }
                _ => {}
            }
        }
        Ok(changed)
    }

    fn collect_flush_set(&mut self) -> Result<FlushSet> {
        let registry = Arc::clone(&self.registry);
        let mut set = FlushSet {
            inserts: self.map.all_new(),
            updates: self.map.all_dirty(),
            deletes: self.map.all_deleted(),
            ..FlushSet::default()
        };
        let mut syncs = SyncCollector::default();
        let sources: Vec<Entity> = set
            .inserts
            .iter()
            .chain(&set.updates)
            .chain(&set.deletes)
            .cloned()
            .collect();

        for entity in &sources {
            let deleted = entity.state() == EntityState::Deleted;
            let owner = entity.mapper_id();
            let mapper = registry.mapper(owner);
            let key_changed = !deleted && entity.read().primary_key_changed();
            let mut rewrite = false;
            for (index, rel) in mapper.relationships().iter().enumerate() {
                let view = slot_view(entity, index);
                match rel.kind() {
                    RelationshipKind::ManyToOne => {
                        if deleted {
                            if let Some(parent) = view.members.as_ref().and_then(|m| m.first()) {
                                if parent.state() == EntityState::Deleted {
                                    let sync = FkSync::new(&registry, owner, rel, Some(parent.clone()));
                                    set.delete_pairs.push((entity.clone(), parent.clone(), sync));
                                }
                            }
                            continue;
                        }
                        if view.touched {
                            let target = view.members.as_ref().and_then(|m| m.first().cloned());
                            if target.is_some() || view.loaded_empty {
                                syncs.push(entity, FkSync::new(&registry, owner, rel, target));
                            }
                        }
                        for old in &view.removed {
                            if old.state() == EntityState::Deleted {
                                set.former_parents.push((entity.clone(), old.clone()));
                            }
                        }
                    }
                    RelationshipKind::OneToMany | RelationshipKind::OneToOne => {
                        let holder = rel.target_id();
                        if deleted {
                            let rules = rel.cascade_rules();
                            if rules.contains(Cascade::DELETE) || rules.contains(Cascade::DELETE_ORPHAN) {
                                for child in view.members.unwrap_or_default() {
                                    if child.state() == EntityState::Deleted {
                                        let sync = FkSync::new(&registry, holder, rel, Some(entity.clone()));
                                        set.delete_pairs.push((child, entity.clone(), sync));
                                    }
                                }
                            } else if !rel.is_passive_deletes() {
                                let members = match view.members {
                                    Some(members) => members,
                                    None => self.load_relationship(entity, index)?,
                                };
                                for child in members {
                                    if child.state() == EntityState::Deleted {
                                        let sync = FkSync::new(&registry, holder, rel, Some(entity.clone()));
                                        set.delete_pairs.push((child, entity.clone(), sync));
                                    } else {
                                        syncs.push(&child, FkSync::new(&registry, holder, rel, None));
                                        set.former_parents.push((child, entity.clone()));
                                    }
                                }
                            }
                            continue;
                        }
                        for child in &view.added {
                            if child.state() != EntityState::Deleted {
                                syncs.push(child, FkSync::new(&registry, holder, rel, Some(entity.clone())));
                            }
                        }
                        for child in &view.removed {
                            let tracked = child.read().owner == Some(self.id);
                            if tracked && child.state() != EntityState::Deleted {
                                syncs.push(child, FkSync::new(&registry, holder, rel, None));
                            }
                        }
                        if key_changed {
                            if rel.is_passive_updates() {
                                rewrite = true;
                            } else {
                                let members = match view.members {
                                    Some(members) => members,
                                    None => self.load_relationship(entity, index)?,
                                };
                                for child in members {
                                    if child.state() != EntityState::Deleted {
                                        syncs.push(&child, FkSync::new(&registry, holder, rel, Some(entity.clone())));
                                    }
                                }
                            }
                        }
                    }
                    RelationshipKind::ManyToMany => {
                        let Some(secondary) = rel.secondary() else {
                            continue;
                        };
                        if deleted {
                            set.add_purge(secondary, entity);
                            continue;
                        }
                        for other in &view.added {
                            if other.state() != EntityState::Deleted {
                                set.add_link(true, AssociationRow::new(secondary, entity, other));
                            }
                        }
                        let stored = entity.identity_key().is_some();
                        for other in &view.removed {
                            if stored && other.identity_key().is_some() {
                                set.add_link(false, AssociationRow::new(secondary, entity, other));
                            }
                        }
                    }
                }
            }
            if rewrite {
                set.passive_rewrites.push(entity.clone());
            }
        }

        // Fold the foreign key writes into the save set.
        for id in syncs.order {
            let Some((holder, holder_syncs)) = syncs.entries.remove(&id) else {
                continue;
            };
            let (state, owner) = {
                let inner = holder.read();
                (inner.state, inner.owner)
            };
            if owner != Some(self.id) || !matches!(state, EntityState::Pending | EntityState::Persistent) {
                continue;
            }
            let mapper = registry.mapper(holder.mapper_id());
            for sync in &holder_syncs {
                if sync.parent.is_none() {
                    if let Some(column) = sync.columns.iter().find(|c| {
                        mapper
                            .find_column(c)
                            .is_some_and(|i| mapper.is_primary_key(i))
                    }) {
                        return Err(Error::flush(
                            FlushErrorKind::PrimaryKeyBlankout,
                            format!(
                                "dependency rule would blank out primary key column '{}.{}' of instance {}",
                                mapper.table(),
                                column,
                                holder.id()
                            ),
                        ));
                    }
                }
            }
            if state == EntityState::Persistent && !set.updates.iter().any(|e| e.id() == id) {
                set.updates.push(holder.clone());
            }
            set.syncs.insert(id, holder_syncs);
        }

        // Row switch: a delete and an insert of the same key become one UPDATE.
        let mut index = 0;
        while index < set.inserts.len() {
            let candidate = set.inserts[index].clone();
            let key = candidate.read().compute_key();
            let matched = key.and_then(|key| {
                set.deletes.iter().position(|deleted| {
                    let inner = deleted.read();
                    inner.mapper == candidate.mapper_id()
                        && inner.committed_primary_key().is_some_and(|pk| {
                            IdentityKey::new(key.mapper(), pk, key.discriminator()) == key
                        })
                })
            });
            match matched {
                Some(position) => {
                    let deleted = set.deletes.remove(position);
                    tracing::debug!(
                        inserted = candidate.id(),
                        deleted = deleted.id(),
                        "row switch"
                    );
                    set.inserts.remove(index);
                    set.row_switches.push((candidate, deleted));
                }
                None => index += 1,
            }
        }

        for entity in sources
            .iter()
            .chain(&set.updates)
            .chain(set.row_switches.iter().map(|(e, _)| e))
            .chain(set.links.iter().map(|(_, e)| e))
        {
            let seq = self.map.seq_of(entity).unwrap_or(u64::MAX);
            set.seqs.insert(entity.id(), seq);
        }
        set.updates.sort_by_key(|e| set.seqs.get(&e.id()).copied().unwrap_or(u64::MAX));
        Ok(set)
    }
}

/// The ordered result of planning.
#[derive(Debug, Default)]
pub(crate) struct FlushPlan {
    pub(crate) ops: Vec<PendingOp>,
    pub(crate) passive_rewrites: Vec<Entity>,
    pub(crate) row_switches: Vec<(Entity, Entity)>,
}

impl FlushPlan {
    pub(crate) fn len(&self) -> usize {
        self.ops.len()
    }

    /// `(op, table)` per step, for logging and tests.
    pub(crate) fn labels(&self) -> Vec<(&'static str, &'static str)> {
        self.ops.iter().map(|op| (op.kind.label(), op.table)).collect()
    }
}

#[derive(Debug, Clone)]
enum Breaker {
    /// Defer the holder's foreign key to a post-update.
    Save { holder: usize, sync: usize },
    /// NULL the child's foreign key before either delete.
    Delete { child: usize, sync: FkSync },
}

#[derive(Debug, Clone)]
struct Edge {
    from: usize,
    to: usize,
    active: bool,
    breaker: Option<Breaker>,
    /// `(not post_update, holder mapper, first column)`, lowest breaks first.
    rank: (bool, MapperId, &'static str),
}

#[derive(Default)]
struct Graph {
    ops: Vec<PendingOp>,
    edges: Vec<Edge>,
    plain: HashSet<(usize, usize)>,
}

impl Graph {
    fn push(&mut self, op: PendingOp) -> usize {
        self.ops.push(op);
        self.ops.len() - 1
    }

    fn edge(&mut self, from: usize, to: usize) {
        if from != to && self.plain.insert((from, to)) {
            self.edges.push(Edge {
                from,
                to,
                active: true,
                breaker: None,
                rank: (true, MapperId(usize::MAX), ""),
            });
        }
    }

    fn breakable(&mut self, from: usize, to: usize, breaker: Breaker, sync: &FkSync) {
        let eligible = sync.nullable || sync.post_update;
        self.edges.push(Edge {
            from,
            to,
            active: true,
            breaker: eligible.then_some(breaker),
            rank: (!sync.post_update, sync.order.0, sync.order.1),
        });
    }

    fn adjacency(&self) -> Vec<Vec<usize>> {
        let mut adjacency = vec![Vec::new(); self.ops.len()];
        for edge in self.edges.iter().filter(|e| e.active) {
            adjacency[edge.from].push(edge.to);
        }
        adjacency
    }
}

/// Strongly connected components, iterative Tarjan.
pub(crate) fn strongly_connected(adjacency: &[Vec<usize>]) -> Vec<Vec<usize>> {
    const UNVISITED: usize = usize::MAX;
    let n = adjacency.len();
    let mut index = vec![UNVISITED; n];
    let mut low = vec![0; n];
    let mut on_stack = vec![false; n];
    let mut stack = Vec::new();
    let mut next = 0;
    let mut components = Vec::new();

    for root in 0..n {
        if index[root] != UNVISITED {
            continue;
        }
        index[root] = next;
        low[root] = next;
        next += 1;
        stack.push(root);
        on_stack[root] = true;
        let mut work = vec![(root, 0usize)];
        while let Some(frame) = work.last_mut() {
            let (node, position) = *frame;
            if position < adjacency[node].len() {
                frame.1 += 1;
                let succ = adjacency[node][position];
                if index[succ] == UNVISITED {
                    index[succ] = next;
                    low[succ] = next;
                    next += 1;
                    stack.push(succ);
                    on_stack[succ] = true;
                    work.push((succ, 0));
                } else if on_stack[succ] {
                    low[node] = low[node].min(index[succ]);
                }
            } else {
                work.pop();
                if let Some(&(parent, _)) = work.last() {
                    low[parent] = low[parent].min(low[node]);
                }
                if low[node] == index[node] {
                    let mut component = Vec::new();
                    while let Some(member) = stack.pop() {
                        on_stack[member] = false;
                        component.push(member);
                        if member == node {
                            break;
                        }
                    }
                    components.push(component);
                }
            }
        }
    }
    components
}

fn cyclic(component: &[usize], adjacency: &[Vec<usize>]) -> bool {
    component.len() > 1 || adjacency[component[0]].contains(&component[0])
}

/// Mapper pairs `(referenced, dependent)` that may be ordered table-wide:
/// distinct mappers not inside a common foreign key cycle.
fn acyclic_mapper_pairs(registry: &Registry) -> Vec<(MapperId, MapperId)> {
    let pairs: Vec<(MapperId, MapperId)> = registry
        .dependency_pairs()
        .into_iter()
        .filter(|(a, b)| a != b)
        .collect();
    let count = registry.mappers().count();
    let mut adjacency = vec![Vec::new(); count];
    for (a, b) in &pairs {
        adjacency[a.0].push(b.0);
    }
    let mut component_of = vec![0; count];
    for (i, component) in strongly_connected(&adjacency).iter().enumerate() {
        for &node in component {
            component_of[node] = i;
        }
    }
    pairs
        .into_iter()
        .filter(|(a, b)| component_of[a.0] != component_of[b.0])
        .collect()
}

/// Order a flush set into an executable plan.
#[tracing::instrument(level = "debug", skip_all, fields(
    inserts = set.inserts.len(),
    updates = set.updates.len(),
    deletes = set.deletes.len(),
))]
pub(crate) fn plan(registry: &Registry, mut set: FlushSet) -> Result<FlushPlan> {
    let mut graph = Graph::default();
    let mut save_of: HashMap<u64, usize> = HashMap::new();
    let mut delete_of: HashMap<u64, usize> = HashMap::new();
    let seq = |set: &FlushSet, entity: &Entity| set.seqs.get(&entity.id()).copied().unwrap_or(u64::MAX);

    let make = |kind: OpKind, entity: &Entity, seq: u64, syncs: Vec<FkSync>| {
        let mapper = entity.mapper_id();
        PendingOp {
            kind,
            entity: entity.clone(),
            mapper,
            table: registry.mapper(mapper).table(),
            seq,
            syncs,
        }
    };

    let saves: Vec<(Entity, OpKind)> = set
        .inserts
        .iter()
        .map(|e| (e.clone(), OpKind::Insert))
        .chain(set.updates.iter().map(|e| (e.clone(), OpKind::Update { row_switch: None })))
        .chain(set.row_switches.iter().map(|(e, d)| {
            (e.clone(), OpKind::Update { row_switch: Some(d.clone()) })
        }))
        .collect();
    for (entity, kind) in saves {
        let syncs = set.syncs.remove(&entity.id()).unwrap_or_default();
        let id = graph.push(make(kind, &entity, seq(&set, &entity), syncs));
        save_of.insert(entity.id(), id);
    }
    for entity in &set.deletes {
        let id = graph.push(make(OpKind::Delete, entity, seq(&set, entity), Vec::new()));
        delete_of.insert(entity.id(), id);
    }

    // Parent save before child save, per copied foreign key.
    let holders: Vec<usize> = save_of.values().copied().collect();
    for holder in holders {
        let syncs = graph.ops[holder].syncs.clone();
        let holder_insert = matches!(graph.ops[holder].kind, OpKind::Insert);
        for (position, sync) in syncs.iter().enumerate() {
            let Some(parent) = &sync.parent else {
                continue;
            };
            let from = if parent.id() == graph.ops[holder].entity.id() {
                if !holder_insert {
                    continue;
                }
                holder
            } else {
                match save_of.get(&parent.id()) {
                    Some(&from) => from,
                    None => continue,
                }
            };
            graph.breakable(from, holder, Breaker::Save { holder, sync: position }, sync);
        }
    }

    for (child, parent) in &set.former_parents {
        if let (Some(&from), Some(&to)) = (save_of.get(&child.id()), delete_of.get(&parent.id())) {
            graph.edge(from, to);
        }
    }
    for (child, parent, sync) in &set.delete_pairs {
        if let (Some(&from), Some(&to)) = (delete_of.get(&child.id()), delete_of.get(&parent.id())) {
            if from == to {
                continue;
            }
            graph.breakable(
                from,
                to,
                Breaker::Delete {
                    child: from,
                    sync: sync.clone(),
                },
                sync,
            );
        }
    }

    // Table-level ordering for mapper pairs outside foreign key cycles.
    let pairs = acyclic_mapper_pairs(registry);
    if !pairs.is_empty() {
        let mut saves_by_mapper: HashMap<MapperId, Vec<usize>> = HashMap::new();
        let mut deletes_by_mapper: HashMap<MapperId, Vec<usize>> = HashMap::new();
        for (i, op) in graph.ops.iter().enumerate() {
            if op.kind.is_save() {
                saves_by_mapper.entry(op.mapper).or_default().push(i);
            } else {
                deletes_by_mapper.entry(op.mapper).or_default().push(i);
            }
        }
        for (referenced, dependent) in pairs {
            let parent_saves = saves_by_mapper.get(&referenced).cloned().unwrap_or_default();
            let child_saves = saves_by_mapper.get(&dependent).cloned().unwrap_or_default();
            let parent_deletes = deletes_by_mapper.get(&referenced).cloned().unwrap_or_default();
            let child_deletes = deletes_by_mapper.get(&dependent).cloned().unwrap_or_default();
            for &p in &parent_saves {
                for &c in &child_saves {
                    graph.edge(p, c);
                }
            }
            for &c in &child_deletes {
                for &p in &parent_deletes {
                    graph.edge(c, p);
                }
            }
            for &c in &child_saves {
                for &p in &parent_deletes {
                    graph.edge(c, p);
                }
            }
        }
    }

    // Association rows.
    let links = std::mem::take(&mut set.links);
    let mut purges = Vec::new();
    let mut link_inserts = Vec::new();
    for (kind, entity) in links {
        let endpoints: Vec<Entity> = match &kind {
            OpKind::LinkInsert(row) | OpKind::LinkDelete(row) => {
                vec![row.local.clone(), row.remote.clone()]
            }
            _ => vec![entity.clone()],
        };
        let table = match &kind {
            OpKind::LinkInsert(row) | OpKind::LinkDelete(row) => row.table,
            OpKind::LinkPurge { table, .. } => *table,
            _ => registry.mapper(entity.mapper_id()).table(),
        };
        let mut op = make(kind, &entity, seq(&set, &entity), Vec::new());
        op.table = table;
        let inserting = matches!(op.kind, OpKind::LinkInsert(_));
        let purging = matches!(op.kind, OpKind::LinkPurge { .. });
        let id = graph.push(op);
        for endpoint in endpoints {
            if inserting {
                if let Some(&save) = save_of.get(&endpoint.id()) {
                    graph.edge(save, id);
                }
            } else if let Some(&delete) = delete_of.get(&endpoint.id()) {
                graph.edge(id, delete);
            }
        }
        if inserting {
            link_inserts.push((id, table));
        } else if purging {
            purges.push((id, table));
        }
    }
    for &(purge, purge_table) in &purges {
        for &(insert, insert_table) in &link_inserts {
            if purge_table == insert_table {
                graph.edge(purge, insert);
            }
        }
    }

    break_cycles(&mut graph)?;
    let ops = topological_order(graph)?;
    tracing::debug!(steps = ops.len(), "flush plan ready");
    Ok(FlushPlan {
        ops,
        passive_rewrites: set.passive_rewrites,
        row_switches: set.row_switches,
    })
}

fn break_cycles(graph: &mut Graph) -> Result<()> {
    loop {
        let adjacency = graph.adjacency();
        let components: Vec<Vec<usize>> = strongly_connected(&adjacency)
            .into_iter()
            .filter(|c| cyclic(c, &adjacency))
            .collect();
        if components.is_empty() {
            return Ok(());
        }
        for component in components {
            let members: HashSet<usize> = component.iter().copied().collect();
            let choice = graph
                .edges
                .iter()
                .enumerate()
                .filter(|(_, e)| {
                    e.active && e.breaker.is_some() && members.contains(&e.from) && members.contains(&e.to)
                })
                .min_by_key(|(i, e)| (e.rank, *i))
                .map(|(i, _)| i);
            let Some(edge_index) = choice else {
                let mut tables: Vec<&str> = component.iter().map(|&i| graph.ops[i].table).collect();
                tables.sort_unstable();
                tables.dedup();
                return Err(Error::flush(
                    FlushErrorKind::CircularDependency,
                    format!(
                        "circular dependency between rows of {} with no nullable or post_update foreign key to defer",
                        tables.join(", ")
                    ),
                ));
            };
            graph.edges[edge_index].active = false;
            let Some(breaker) = graph.edges[edge_index].breaker.clone() else {
                continue;
            };
            match breaker {
                Breaker::Save { holder, sync } => {
                    let mut deferred = graph.ops[holder].syncs[sync].clone();
                    graph.ops[holder].syncs[sync].deferred = true;
                    deferred.deferred = false;
                    tracing::debug!(
                        table = graph.ops[holder].table,
                        columns = ?deferred.columns,
                        "dependency cycle broken with post-update"
                    );
                    let base = graph.ops[holder].clone();
                    let post = graph.push(PendingOp {
                        kind: OpKind::PostUpdate(deferred),
                        syncs: Vec::new(),
                        ..base
                    });
                    for &member in &component {
                        graph.edge(member, post);
                    }
                }
                Breaker::Delete { child, sync } => {
                    tracing::debug!(
                        table = graph.ops[child].table,
                        columns = ?sync.columns,
                        "delete cycle broken by nulling foreign key"
                    );
                    let base = graph.ops[child].clone();
                    let to = graph.edges[edge_index].to;
                    let null = graph.push(PendingOp {
                        kind: OpKind::PreDeleteNull {
                            columns: sync.columns.clone(),
                        },
                        syncs: Vec::new(),
                        ..base
                    });
                    graph.edge(null, to);
                    graph.edge(null, child);
                }
            }
        }
    }
}

fn topological_order(graph: Graph) -> Result<Vec<PendingOp>> {
    let n = graph.ops.len();
    let adjacency = graph.adjacency();
    let mut indegree = vec![0usize; n];
    for targets in &adjacency {
        for &t in targets {
            indegree[t] += 1;
        }
    }
    let key = |i: usize| {
        let op = &graph.ops[i];
        Reverse((op.kind.phase(), op.mapper, op.seq, i))
    };
    let mut ready: BinaryHeap<_> = (0..n).filter(|&i| indegree[i] == 0).map(key).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(Reverse((_, _, _, i))) = ready.pop() {
        order.push(i);
        for &t in &adjacency[i] {
            indegree[t] -= 1;
            if indegree[t] == 0 {
                ready.push(key(t));
            }
        }
    }
    if order.len() != n {
        return Err(Error::flush(
            FlushErrorKind::CircularDependency,
            "unresolved dependency cycle after post-update splitting",
        ));
    }
    let mut slots: Vec<Option<PendingOp>> = graph.ops.into_iter().map(Some).collect();
    Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{cyclic_registry, family};

    fn op_set(registry: &Arc<Registry>) -> (FlushSet, Entity, Entity) {
        let parent = Entity::new(registry, "Parent").unwrap();
        let child = Entity::new(registry, "Child").unwrap();
        parent.append("children", &child).unwrap();
        let mut set = FlushSet {
            inserts: vec![child.clone(), parent.clone()],
            ..FlushSet::default()
        };
        let rel = registry.by_name("Parent").unwrap().relationship_at(0);
        let holder = registry.by_name("Child").unwrap().id();
        set.syncs.insert(
            child.id(),
            vec![FkSync::new(registry, holder, rel, Some(parent.clone()))],
        );
        set.seqs.insert(child.id(), 0);
        set.seqs.insert(parent.id(), 1);
        (set, parent, child)
    }

    #[test]
    fn test_parent_insert_precedes_child_insert() {
        let registry = family();
        let (set, parent, child) = op_set(&registry);
        let plan = plan(&registry, set).unwrap();
        let order: Vec<u64> = plan.ops.iter().map(|op| op.entity.id()).collect();
        assert_eq!(order, vec![parent.id(), child.id()]);
    }

    #[test]
    fn test_strongly_connected_components() {
        let adjacency = vec![vec![1], vec![2], vec![0], vec![3], vec![]];
        let mut components = strongly_connected(&adjacency);
        for c in &mut components {
            c.sort_unstable();
        }
        assert!(components.contains(&vec![0, 1, 2]));
        assert!(cyclic(&[3], &adjacency));
        assert!(!cyclic(&[4], &adjacency));
    }

    #[test]
    fn test_cycle_is_broken_with_post_update() {
        let registry = cyclic_registry(true);
        let author = Entity::new(&registry, "Author").unwrap();
        let book = Entity::new(&registry, "Book").unwrap();
        book.set_related("author", Some(&author)).unwrap();
        author.set_related("favorite", Some(&book)).unwrap();

        let author_meta = registry.by_name("Author").unwrap();
        let book_meta = registry.by_name("Book").unwrap();
        let mut set = FlushSet {
            inserts: vec![author.clone(), book.clone()],
            ..FlushSet::default()
        };
        set.syncs.insert(
            author.id(),
            vec![FkSync::new(&registry, author_meta.id(), author_meta.relationship_at(0), Some(book.clone()))],
        );
        set.syncs.insert(
            book.id(),
            vec![FkSync::new(&registry, book_meta.id(), book_meta.relationship_at(0), Some(author.clone()))],
        );
        set.seqs.insert(author.id(), 0);
        set.seqs.insert(book.id(), 1);

        let plan = plan(&registry, set).unwrap();
        assert_eq!(
            plan.labels(),
            vec![("insert", "authors"), ("insert", "books"), ("post_update", "authors")]
        );
        assert!(plan.ops[0].syncs[0].deferred);
    }

    #[test]
    fn test_unbreakable_cycle_is_reported() {
        let registry = cyclic_registry(false);
        let author = Entity::new(&registry, "Author").unwrap();
        let book = Entity::new(&registry, "Book").unwrap();
        let author_meta = registry.by_name("Author").unwrap();
        let book_meta = registry.by_name("Book").unwrap();
        let mut set = FlushSet {
            inserts: vec![author.clone(), book.clone()],
            ..FlushSet::default()
        };
        set.syncs.insert(
            author.id(),
            vec![FkSync::new(&registry, author_meta.id(), author_meta.relationship_at(0), Some(book.clone()))],
        );
        set.syncs.insert(
            book.id(),
            vec![FkSync::new(&registry, book_meta.id(), book_meta.relationship_at(0), Some(author.clone()))],
        );
        let err = plan(&registry, set).unwrap_err();
        assert_eq!(err.flush_kind(), Some(FlushErrorKind::CircularDependency));
    }

    #[test]
    fn test_association_rows_dedupe_across_sides() {
        let registry = crate::testing::blog();
        let post = Entity::new(&registry, "Post").unwrap();
        let tag = Entity::new(&registry, "Tag").unwrap();
        let post_meta = registry.by_name("Post").unwrap();
        let tag_meta = registry.by_name("Tag").unwrap();
        let mut set = FlushSet::default();
        set.add_link(
            true,
            AssociationRow::new(post_meta.relationship_at(0).secondary().unwrap(), &post, &tag),
        );
        set.add_link(
            true,
            AssociationRow::new(tag_meta.relationship_at(0).secondary().unwrap(), &tag, &post),
        );
        assert_eq!(set.links.len(), 1);
    }

    #[test]
    fn test_pending_counts() {
        let counts = PendingCounts {
            new: 1,
            dirty: 2,
            deleted: 0,
        };
        assert_eq!(counts.total(), 3);
        assert!(!counts.is_empty());
        assert!(PendingCounts::default().is_empty());
    }
}
