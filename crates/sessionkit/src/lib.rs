//! sessionkit - a unit-of-work engine for mapped instances.
//!
//! sessionkit tracks mutable in-memory instances of mapped tables and turns
//! their accumulated changes into correctly ordered writes:
//!
//! - An identity map with one live instance per primary key
//! - Cascading `add`, `delete`, `expunge`, `merge` and `expire` along
//!   relationships, with delete-orphan resolved at flush time
//! - A flush coordinator that orders INSERT/UPDATE/DELETE by foreign key
//!   dependencies and breaks cycles with post-updates
//! - Lazy reload of expired attributes, coalesced per instance
//! - Nested transactions: subtransactions, savepoints and two-phase commit
//!
//! # Quick Start
//!
//! ```ignore
//! use sessionkit::prelude::*;
//!
//! let registry = Registry::builder()
//!     .mapper(
//!         Mapper::new("Parent", "parents")
//!             .column(ColumnDef::new("id").primary_key(true).autoincrement(true))
//!             .column(ColumnDef::new("name"))
//!             .relationship(
//!                 Relationship::one_to_many("children", "Child")
//!                     .cascade(Cascade::ALL | Cascade::DELETE_ORPHAN),
//!             ),
//!     )
//!     .mapper(
//!         Mapper::new("Child", "children")
//!             .column(ColumnDef::new("id").primary_key(true).autoincrement(true))
//!             .column(ColumnDef::new("parent_id").foreign_key("parents.id")),
//!     )
//!     .build()?;
//!
//! let db = MemoryDatabase::from_registry(&registry);
//! let mut session = Session::new(registry.clone(), db.connect());
//!
//! let parent = Entity::new(&registry, "Parent")?.with("name", "p")?;
//! parent.append("children", &Entity::new(&registry, "Child")?)?;
//! session.add(&parent)?;
//! session.commit()?;
//! ```
//!
//! # Backends
//!
//! The engine talks to storage only through [`Connection`]. The `memory`
//! feature (on by default) ships [`MemoryDatabase`], which enforces keys,
//! foreign keys and referential actions and supports savepoints and
//! two-phase commit.

pub use sessionkit_core::{
    AssociationTable, Capabilities, Cascade, ColumnDef, ColumnInfo, CompiledStatement, Connection,
    Error, ExecuteResult, FlushError, FlushErrorKind, FrameKind, FrameRef, IdentityKey,
    InvalidRequestError, InvalidRequestKind, Mapper, MapperId, MappingError, OrphanError,
    QueryError, QueryErrorKind, ReferentialAction, Registry, RegistryBuilder, Relationship,
    RelationshipKind, Result, Row, StaleReferenceError, Statement, Value,
};

pub use sessionkit_session::{
    Access, AttributeState, CascadeOp, Entity, EntityState, FlushResult, IdentityMap,
    PendingCounts, ReloadRequest, Session, SessionConfig, SessionDebugInfo, SessionEvent,
    SessionEventCallbacks, TrackedRef, WeakEntity,
};

#[cfg(feature = "memory")]
pub use sessionkit_memory::{MemoryConnection, MemoryDatabase, MemoryOptions, StatementLog};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use sessionkit::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        Access, Cascade, ColumnDef, Connection, Entity, EntityState, Error, FlushResult,
        IdentityKey, InvalidRequestKind, Mapper, Registry, Relationship, Result, Session,
        SessionConfig, Value,
    };

    #[cfg(feature = "memory")]
    pub use crate::{MemoryDatabase, MemoryOptions};
}

/// Open a session over an in-memory database created from `registry`.
///
/// Returns the database handle too, so callers can inspect committed rows.
#[cfg(feature = "memory")]
pub fn memory_session(
    registry: &std::sync::Arc<Registry>,
    options: MemoryOptions,
) -> (MemoryDatabase, Session<MemoryConnection>) {
    let db = MemoryDatabase::from_registry(registry);
    let conn = db.connect_with(options);
    tracing::debug!("in-memory session opened");
    (db, Session::new(std::sync::Arc::clone(registry), conn))
}

#[cfg(test)]
mod tests {
    use super::prelude::*;
    use std::sync::Arc;

    fn registry() -> Arc<Registry> {
        Registry::builder()
            .mapper(
                Mapper::new("Item", "items")
                    .column(ColumnDef::new("id").primary_key(true).autoincrement(true))
                    .column(ColumnDef::new("label")),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_memory_session_round_trip() {
        let registry = registry();
        let (db, mut session) = super::memory_session(&registry, MemoryOptions::default());
        let item = Entity::new(&registry, "Item").unwrap().with("label", "a").unwrap();
        session.add(&item).unwrap();
        session.commit().unwrap();
        assert_eq!(db.row_count("items").unwrap(), 1);
        assert_eq!(item.state(), EntityState::Persistent);
    }
}
