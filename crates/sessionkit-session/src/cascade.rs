//! Cascade resolution and delete-orphan bookkeeping.
//!
//! [`expand`] walks relationship values breadth first from a root entity,
//! following only relationships whose cascade set contains the requested
//! rule. Walks see loaded values plus pending additions; unloaded values are
//! skipped, except that a delete walk asks the loader to fetch them unless
//! the relationship is `passive_deletes`.

use std::collections::{HashSet, VecDeque};

use sessionkit_core::{Cascade, OrphanError, Result};

use crate::instance::{Entity, EntityState};

/// Operations that can cascade along relationships.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CascadeOp {
    /// `add` and cascade-on-flush, driven by `save-update`.
    Attach,
    /// `expunge`.
    Detach,
    Delete,
    /// `expire` and `refresh`.
    RefreshExpire,
    Merge,
}

impl CascadeOp {
    pub fn rule(self) -> Cascade {
        match self {
            CascadeOp::Attach => Cascade::SAVE_UPDATE,
            CascadeOp::Detach => Cascade::EXPUNGE,
            CascadeOp::Delete => Cascade::DELETE,
            CascadeOp::RefreshExpire => Cascade::REFRESH_EXPIRE,
            CascadeOp::Merge => Cascade::MERGE,
        }
    }
}

/// Loads an unloaded relationship (by index) on the given entity.
pub type RelationLoader<'a> = dyn FnMut(&Entity, usize) -> Result<()> + 'a;

/// Every entity reached from `root` by `op`, root first. Each entity appears
/// once no matter how many paths lead to it.
pub fn expand(
    root: &Entity,
    op: CascadeOp,
    loader: &mut RelationLoader<'_>,
) -> Result<Vec<(Entity, CascadeOp)>> {
    let rule = op.rule();
    let mut visited = HashSet::new();
    let mut queue = VecDeque::new();
    let mut out = Vec::new();
    visited.insert(root.id());
    queue.push_back(root.clone());

    while let Some(entity) = queue.pop_front() {
        let registry = entity.registry();
        let mapper = registry.mapper(entity.mapper_id());
        for (index, rel) in mapper.relationships().iter().enumerate() {
            if !rel.cascade_rules().contains(rule) {
                continue;
            }
            let mut members = {
                let inner = entity.read();
                let slot = &inner.relations[index];
                slot.members().map(|mut members| {
                    members.extend(slot.added.iter().cloned());
                    members
                })
            };
            if members.is_none()
                && op == CascadeOp::Delete
                && !rel.is_passive_deletes()
                && entity.identity_key().is_some()
            {
                loader(&entity, index)?;
                members = entity.read().relations[index].members();
            }
            let members = match members {
                Some(members) => members,
                None => entity.read().relations[index].added.clone(),
            };
            for member in members {
                if visited.insert(member.id()) {
                    queue.push_back(member);
                }
            }
        }
        out.push((entity, op));
    }
    tracing::trace!(root = root.id(), ?op, reached = out.len(), "cascade expanded");
    Ok(out)
}

/// Where an entity stands with respect to delete-orphan ownership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum OrphanStatus {
    /// No delete-orphan relationship governs this mapper.
    Ungoverned,
    /// At least one live owning parent.
    Owned,
    /// Governed, but no live owner remains.
    Orphaned {
        ever_parented: bool,
        relationships: Vec<String>,
    },
}

pub(crate) fn orphan_status(entity: &Entity) -> OrphanStatus {
    let registry = entity.registry();
    let (mapper, parents, ever_parented) = {
        let inner = entity.read();
        (inner.mapper, inner.parents.clone(), inner.ever_parented)
    };
    let owners = registry.mapper(mapper).orphan_owners();
    if owners.is_empty() {
        return OrphanStatus::Ungoverned;
    }
    let owned = parents
        .iter()
        .filter(|link| owners.contains(&(link.owner, link.relationship)))
        .filter_map(|link| link.parent.upgrade())
        .any(|parent| parent.state() != EntityState::Deleted);
    if owned {
        return OrphanStatus::Owned;
    }
    OrphanStatus::Orphaned {
        ever_parented,
        relationships: owners
            .iter()
            .map(|(owner, index)| {
                let owner = registry.mapper(*owner);
                format!("{}.{}", owner.name(), owner.relationship_at(*index).name())
            })
            .collect(),
    }
}

pub(crate) fn orphan_error(entity: &Entity, relationships: Vec<String>) -> OrphanError {
    OrphanError {
        mapper: entity.mapper_name().to_string(),
        instance: entity.id(),
        relationships,
    }
}

/// Install a loaded relationship value without recording history, and
/// point the members' parent links back at `owner` where they hold the
/// foreign key.
pub(crate) fn fill_relationship(owner: &Entity, index: usize, members: &[Entity]) {
    let registry = owner.registry();
    let mapper_id = owner.mapper_id();
    let rel = registry.mapper(mapper_id).relationship_at(index);
    owner.write().relations[index].fill(members, rel.is_weak());
    if rel.fk_on_target() {
        for member in members {
            member.write().link_parent(mapper_id, index, owner);
        }
    }
}

/// Forget unflushed relationship history. History holds strong handles, so
/// this also releases pending members an expunged instance was keeping alive.
pub(crate) fn discard_history(entity: &Entity) {
    let mut inner = entity.write();
    for slot in &mut inner.relations {
        slot.clear_history();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{family, graph};
    use sessionkit_core::{IdentityKey, Value};

    fn noop() -> impl FnMut(&Entity, usize) -> Result<()> {
        |_, _| Ok(())
    }

    #[test]
    fn test_expand_reaches_children_once() {
        let registry = family();
        let parent = Entity::new(&registry, "Parent").unwrap();
        let a = Entity::new(&registry, "Child").unwrap();
        let b = Entity::new(&registry, "Child").unwrap();
        parent.append("children", &a).unwrap();
        parent.append("children", &b).unwrap();

        let reached = expand(&parent, CascadeOp::Attach, &mut noop()).unwrap();
        let ids: Vec<u64> = reached.iter().map(|(e, _)| e.id()).collect();
        assert_eq!(ids, vec![parent.id(), a.id(), b.id()]);
    }

    #[test]
    fn test_expand_survives_cycles() {
        let registry = graph();
        let a = Entity::new(&registry, "Node").unwrap();
        let b = Entity::new(&registry, "Node").unwrap();
        a.append("children", &b).unwrap();
        b.append("children", &a).unwrap();
        let reached = expand(&a, CascadeOp::Delete, &mut noop()).unwrap();
        assert_eq!(reached.len(), 2);
    }

    #[test]
    fn test_delete_walk_loads_unloaded_relationships() {
        let registry = family();
        let parent = Entity::blank(&registry, registry.by_name("Parent").unwrap().id(), false);
        parent.write().key = Some(IdentityKey::new("Parent", vec![Value::BigInt(1)], None));
        let child = Entity::new(&registry, "Child").unwrap();
        let mut calls = 0;
        let mut loader = |owner: &Entity, index: usize| {
            calls += 1;
            fill_relationship(owner, index, std::slice::from_ref(&child));
            Ok(())
        };
        let reached = expand(&parent, CascadeOp::Delete, &mut loader).unwrap();
        assert_eq!(calls, 1);
        assert_eq!(reached.len(), 2);
        assert_eq!(orphan_status(&child), OrphanStatus::Owned);

        // Attach never loads.
        let mut refuse = |_: &Entity, _: usize| -> Result<()> { panic!("attach must not load") };
        let other = Entity::blank(&registry, registry.by_name("Parent").unwrap().id(), false);
        other.write().key = Some(IdentityKey::new("Parent", vec![Value::BigInt(2)], None));
        assert_eq!(expand(&other, CascadeOp::Attach, &mut refuse).unwrap().len(), 1);
    }

    #[test]
    fn test_orphan_status_transitions() {
        let registry = family();
        let parent = Entity::new(&registry, "Parent").unwrap();
        let child = Entity::new(&registry, "Child").unwrap();
        assert_eq!(
            orphan_status(&child),
            OrphanStatus::Orphaned {
                ever_parented: false,
                relationships: vec!["Parent.children".to_string()],
            }
        );
        parent.append("children", &child).unwrap();
        assert_eq!(orphan_status(&child), OrphanStatus::Owned);
        parent.write().state = EntityState::Deleted;
        assert!(matches!(
            orphan_status(&child),
            OrphanStatus::Orphaned { ever_parented: true, .. }
        ));
        assert_eq!(orphan_status(&parent), OrphanStatus::Ungoverned);
    }
}
