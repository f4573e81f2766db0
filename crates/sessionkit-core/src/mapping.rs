//! Mapping metadata: mappers, columns, relationships and cascade rules.
//!
//! Mappings are declared in code through [`Registry::builder`] and validated
//! once when the registry is built. Everything the engine later needs
//! (foreign-key column pairs, reciprocal relationships, which side of a
//! bidirectional pair holds weak links, delete-orphan ownership) is resolved
//! at that point, so a built [`Registry`] is immutable and can be shared
//! behind an `Arc` by any number of sessions.
//!
//! # Example
//!
//! ```
//! use sessionkit_core::{Cascade, ColumnDef, Mapper, Registry, Relationship};
//!
//! let registry = Registry::builder()
//!     .mapper(
//!         Mapper::new("Parent", "parents")
//!             .column(ColumnDef::new("id").primary_key(true).autoincrement(true))
//!             .column(ColumnDef::new("name"))
//!             .relationship(
//!                 Relationship::one_to_many("children", "Child")
//!                     .cascade(Cascade::ALL.with(Cascade::DELETE_ORPHAN))
//!                     .back_populates("parent"),
//!             ),
//!     )
//!     .mapper(
//!         Mapper::new("Child", "children")
//!             .column(ColumnDef::new("id").primary_key(true).autoincrement(true))
//!             .column(ColumnDef::new("parent_id").foreign_key("parents.id"))
//!             .relationship(Relationship::many_to_one("parent", "Parent").back_populates("children")),
//!     )
//!     .build()
//!     .unwrap();
//!
//! let child = registry.by_name("Child").unwrap();
//! assert_eq!(child.orphan_owners().len(), 1);
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::BitOr;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::Serialize;

use crate::Result;
use crate::error::Error;

/// Referential action for foreign key constraints (ON DELETE / ON UPDATE).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ReferentialAction {
    /// Raise an error if any references exist.
    #[default]
    NoAction,
    /// Same as NO ACTION.
    Restrict,
    /// Delete or update referencing rows.
    Cascade,
    /// Set referencing columns to NULL.
    SetNull,
}

impl ReferentialAction {
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            ReferentialAction::NoAction => "NO ACTION",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::SetNull => "SET NULL",
        }
    }
}

/// Column definition on a mapper.
#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub name: &'static str,
    pub primary_key: bool,
    pub nullable: bool,
    /// Backend assigns the value on INSERT when none is given
    pub autoincrement: bool,
    /// Sequence to pre-execute on backends that require it
    pub sequence: Option<&'static str>,
    /// Foreign key reference (table.column)
    pub foreign_key: Option<&'static str>,
    pub on_delete: ReferentialAction,
    pub on_update: ReferentialAction,
}

impl ColumnDef {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            primary_key: false,
            nullable: true,
            autoincrement: false,
            sequence: None,
            foreign_key: None,
            on_delete: ReferentialAction::NoAction,
            on_update: ReferentialAction::NoAction,
        }
    }

    /// Mark as part of the primary key. Primary key columns are never nullable.
    pub const fn primary_key(mut self, value: bool) -> Self {
        self.primary_key = value;
        if value {
            self.nullable = false;
        }
        self
    }

    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    pub const fn autoincrement(mut self, value: bool) -> Self {
        self.autoincrement = value;
        self
    }

    pub const fn sequence(mut self, name: &'static str) -> Self {
        self.sequence = Some(name);
        self
    }

    /// Reference another table's column, as `"table.column"`.
    pub const fn foreign_key(mut self, reference: &'static str) -> Self {
        self.foreign_key = Some(reference);
        self
    }

    pub const fn on_delete(mut self, action: ReferentialAction) -> Self {
        self.on_delete = action;
        self
    }

    pub const fn on_update(mut self, action: ReferentialAction) -> Self {
        self.on_update = action;
        self
    }

    /// The `(table, column)` this column references, if any.
    pub fn references(&self) -> Option<(&'static str, &'static str)> {
        self.foreign_key.and_then(|fk| fk.split_once('.'))
    }
}

/// Cascade rule set declared on a relationship.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Cascade(u8);

impl Cascade {
    pub const NONE: Cascade = Cascade(0);
    pub const SAVE_UPDATE: Cascade = Cascade(1);
    pub const DELETE: Cascade = Cascade(1 << 1);
    pub const DELETE_ORPHAN: Cascade = Cascade(1 << 2);
    pub const REFRESH_EXPIRE: Cascade = Cascade(1 << 3);
    pub const MERGE: Cascade = Cascade(1 << 4);
    pub const EXPUNGE: Cascade = Cascade(1 << 5);
    /// Every rule except delete-orphan.
    pub const ALL: Cascade = Cascade(1 | 1 << 1 | 1 << 3 | 1 << 4 | 1 << 5);

    const NAMES: [(Cascade, &'static str); 6] = [
        (Cascade::SAVE_UPDATE, "save-update"),
        (Cascade::DELETE, "delete"),
        (Cascade::DELETE_ORPHAN, "delete-orphan"),
        (Cascade::REFRESH_EXPIRE, "refresh-expire"),
        (Cascade::MERGE, "merge"),
        (Cascade::EXPUNGE, "expunge"),
    ];

    pub const fn contains(self, other: Cascade) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn with(self, other: Cascade) -> Cascade {
        Cascade(self.0 | other.0)
    }

    pub const fn without(self, other: Cascade) -> Cascade {
        Cascade(self.0 & !other.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Parse a comma separated rule list such as `"all, delete-orphan"`.
    pub fn parse(rules: &str) -> Result<Cascade> {
        let mut cascade = Cascade::NONE;
        for token in rules.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            if token == "all" {
                cascade = cascade.with(Cascade::ALL);
                continue;
            }
            let flag = Self::NAMES
                .iter()
                .find(|(_, name)| *name == token)
                .map(|(flag, _)| *flag)
                .ok_or_else(|| Error::mapping(None, format!("unknown cascade rule '{token}'")))?;
            cascade = cascade.with(flag);
        }
        Ok(cascade)
    }
}

impl Default for Cascade {
    /// `save-update, merge`
    fn default() -> Self {
        Cascade::SAVE_UPDATE.with(Cascade::MERGE)
    }
}

impl BitOr for Cascade {
    type Output = Cascade;

    fn bitor(self, rhs: Cascade) -> Cascade {
        self.with(rhs)
    }
}

impl fmt::Debug for Cascade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "Cascade({})", names.join(", "))
    }
}

/// The type of relationship between two mappers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RelationshipKind {
    /// Collection whose members hold the foreign key.
    OneToMany,
    /// Scalar reference held by a foreign key on this mapper.
    ManyToOne,
    /// Scalar whose target holds the foreign key.
    OneToOne,
    /// Collection joined through an association table.
    ManyToMany,
}

/// Association table backing a many-to-many relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationTable {
    pub table: &'static str,
    /// Columns referencing the declaring mapper's primary key, in key order.
    pub local_columns: &'static [&'static str],
    /// Columns referencing the target mapper's primary key, in key order.
    pub remote_columns: &'static [&'static str],
}

impl AssociationTable {
    pub const fn new(
        table: &'static str,
        local_columns: &'static [&'static str],
        remote_columns: &'static [&'static str],
    ) -> Self {
        Self {
            table,
            local_columns,
            remote_columns,
        }
    }

    /// All columns, local first.
    pub fn columns(&self) -> Vec<&'static str> {
        self.local_columns
            .iter()
            .chain(self.remote_columns)
            .copied()
            .collect()
    }
}

/// Index of a mapper inside its registry; doubles as declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct MapperId(pub usize);

/// A relationship declared on a mapper.
#[derive(Debug, Clone)]
pub struct Relationship {
    name: &'static str,
    kind: RelationshipKind,
    target: &'static str,
    declared_foreign_key: Option<&'static [&'static str]>,
    secondary: Option<AssociationTable>,
    cascade: Cascade,
    passive_updates: bool,
    passive_deletes: bool,
    post_update: bool,
    back_populates: Option<&'static str>,
    // Resolved by `RegistryBuilder::build`.
    target_id: MapperId,
    fk_columns: Vec<&'static str>,
    ref_columns: Vec<&'static str>,
    fk_nullable: bool,
    weak: bool,
    reverse: Option<usize>,
}

impl Relationship {
    fn new(name: &'static str, kind: RelationshipKind, target: &'static str) -> Self {
        Self {
            name,
            kind,
            target,
            declared_foreign_key: None,
            secondary: None,
            cascade: Cascade::default(),
            passive_updates: true,
            passive_deletes: false,
            post_update: false,
            back_populates: None,
            target_id: MapperId(usize::MAX),
            fk_columns: Vec::new(),
            ref_columns: Vec::new(),
            fk_nullable: true,
            weak: false,
            reverse: None,
        }
    }

    pub fn one_to_many(name: &'static str, target: &'static str) -> Self {
        Self::new(name, RelationshipKind::OneToMany, target)
    }

    pub fn many_to_one(name: &'static str, target: &'static str) -> Self {
        Self::new(name, RelationshipKind::ManyToOne, target)
    }

    pub fn one_to_one(name: &'static str, target: &'static str) -> Self {
        Self::new(name, RelationshipKind::OneToOne, target)
    }

    pub fn many_to_many(
        name: &'static str,
        target: &'static str,
        secondary: AssociationTable,
    ) -> Self {
        let mut rel = Self::new(name, RelationshipKind::ManyToMany, target);
        rel.secondary = Some(secondary);
        rel
    }

    /// Foreign key columns on whichever side holds them. Derived from column
    /// `foreign_key` declarations when omitted.
    pub fn foreign_key(mut self, columns: &'static [&'static str]) -> Self {
        self.declared_foreign_key = Some(columns);
        self
    }

    pub fn cascade(mut self, cascade: Cascade) -> Self {
        self.cascade = cascade;
        self
    }

    /// When false, a primary key change on the referenced side is propagated
    /// with explicit UPDATEs of every dependent row.
    pub fn passive_updates(mut self, value: bool) -> Self {
        self.passive_updates = value;
        self
    }

    /// When true, the backend's ON DELETE handles dependents; they are not
    /// loaded or touched when the parent is deleted.
    pub fn passive_deletes(mut self, value: bool) -> Self {
        self.passive_deletes = value;
        self
    }

    /// Preferred edge when a dependency cycle has to be broken.
    pub fn post_update(mut self, value: bool) -> Self {
        self.post_update = value;
        self
    }

    pub fn back_populates(mut self, name: &'static str) -> Self {
        self.back_populates = Some(name);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> RelationshipKind {
        self.kind
    }

    pub fn target(&self) -> &'static str {
        self.target
    }

    pub fn target_id(&self) -> MapperId {
        self.target_id
    }

    pub fn cascade_rules(&self) -> Cascade {
        self.cascade
    }

    pub fn is_passive_updates(&self) -> bool {
        self.passive_updates
    }

    pub fn is_passive_deletes(&self) -> bool {
        self.passive_deletes
    }

    pub fn is_post_update(&self) -> bool {
        self.post_update
    }

    pub fn back_populates_name(&self) -> Option<&'static str> {
        self.back_populates
    }

    pub fn secondary(&self) -> Option<&AssociationTable> {
        self.secondary.as_ref()
    }

    /// Foreign key columns on the holding side (empty for many-to-many).
    pub fn fk_columns(&self) -> &[&'static str] {
        &self.fk_columns
    }

    /// Columns on the referenced side, paired with [`Self::fk_columns`].
    pub fn ref_columns(&self) -> &[&'static str] {
        &self.ref_columns
    }

    /// Every foreign key column accepts NULL.
    pub fn fk_nullable(&self) -> bool {
        self.fk_nullable
    }

    /// Links stored through this relationship do not keep members alive.
    pub fn is_weak(&self) -> bool {
        self.weak
    }

    /// Index of the reciprocal relationship on the target mapper.
    pub fn reverse(&self) -> Option<usize> {
        self.reverse
    }

    pub fn is_collection(&self) -> bool {
        matches!(
            self.kind,
            RelationshipKind::OneToMany | RelationshipKind::ManyToMany
        )
    }

    /// The members hold the foreign key back to the declaring mapper.
    pub fn fk_on_target(&self) -> bool {
        matches!(
            self.kind,
            RelationshipKind::OneToMany | RelationshipKind::OneToOne
        )
    }
}

/// Static metadata binding an entity shape to a table.
#[derive(Debug, Clone)]
pub struct Mapper {
    name: &'static str,
    table: &'static str,
    columns: Vec<ColumnDef>,
    relationships: Vec<Relationship>,
    polymorphic_identity: Option<&'static str>,
    id: MapperId,
    primary_key: Vec<usize>,
    orphan_owners: Vec<(MapperId, usize)>,
}

impl Mapper {
    pub fn new(name: &'static str, table: &'static str) -> Self {
        Self {
            name,
            table,
            columns: Vec::new(),
            relationships: Vec::new(),
            polymorphic_identity: None,
            id: MapperId(usize::MAX),
            primary_key: Vec::new(),
            orphan_owners: Vec::new(),
        }
    }

    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    pub fn relationship(mut self, relationship: Relationship) -> Self {
        self.relationships.push(relationship);
        self
    }

    /// Discriminator carried in this mapper's identity keys.
    pub fn polymorphic_identity(mut self, identity: &'static str) -> Self {
        self.polymorphic_identity = Some(identity);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    pub fn id(&self) -> MapperId {
        self.id
    }

    pub fn discriminator(&self) -> Option<&'static str> {
        self.polymorphic_identity
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn relationships(&self) -> &[Relationship] {
        &self.relationships
    }

    pub fn relationship_at(&self, index: usize) -> &Relationship {
        &self.relationships[index]
    }

    pub fn find_column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn find_relationship(&self, name: &str) -> Option<usize> {
        self.relationships.iter().position(|r| r.name == name)
    }

    /// Column indices making up the primary key, in declaration order.
    pub fn primary_key_indices(&self) -> &[usize] {
        &self.primary_key
    }

    pub fn primary_key_columns(&self) -> Vec<&'static str> {
        self.primary_key
            .iter()
            .map(|&i| self.columns[i].name)
            .collect()
    }

    pub fn is_primary_key(&self, column: usize) -> bool {
        self.primary_key.contains(&column)
    }

    /// `(owner mapper, relationship index)` of every delete-orphan
    /// relationship whose members are instances of this mapper.
    pub fn orphan_owners(&self) -> &[(MapperId, usize)] {
        &self.orphan_owners
    }
}

/// Validated, immutable set of mappers.
#[derive(Debug)]
pub struct Registry {
    mappers: Vec<Mapper>,
    by_name: HashMap<&'static str, MapperId>,
    by_table: HashMap<&'static str, MapperId>,
    association_tables: Vec<AssociationTable>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn mapper(&self, id: MapperId) -> &Mapper {
        &self.mappers[id.0]
    }

    pub fn get(&self, name: &str) -> Option<&Mapper> {
        self.by_name.get(name).map(|id| self.mapper(*id))
    }

    pub fn by_name(&self, name: &str) -> Result<&Mapper> {
        self.get(name)
            .ok_or_else(|| Error::mapping(Some(name), "no such mapper"))
    }

    pub fn by_table(&self, table: &str) -> Option<&Mapper> {
        self.by_table.get(table).map(|id| self.mapper(*id))
    }

    pub fn mappers(&self) -> impl Iterator<Item = &Mapper> {
        self.mappers.iter()
    }

    pub fn association_tables(&self) -> &[AssociationTable] {
        &self.association_tables
    }

    /// Mapper-level `(referenced, dependent)` pairs: the dependent mapper
    /// holds a foreign key to the referenced one. Self references included.
    pub fn dependency_pairs(&self) -> Vec<(MapperId, MapperId)> {
        let mut pairs = Vec::new();
        for mapper in &self.mappers {
            for column in &mapper.columns {
                if let Some((table, _)) = column.references() {
                    if let Some(parent) = self.by_table.get(table) {
                        pairs.push((*parent, mapper.id));
                    }
                }
            }
            for rel in &mapper.relationships {
                match rel.kind {
                    RelationshipKind::ManyToOne => pairs.push((rel.target_id, mapper.id)),
                    RelationshipKind::OneToMany | RelationshipKind::OneToOne => {
                        pairs.push((mapper.id, rel.target_id));
                    }
                    RelationshipKind::ManyToMany => {}
                }
            }
        }
        pairs.sort();
        pairs.dedup();
        pairs
    }
}

/// Collects mapper declarations; [`RegistryBuilder::build`] validates them.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    mappers: Vec<Mapper>,
}

fn identifier_regex() -> std::result::Result<&'static Regex, &'static regex::Error> {
    static IDENT: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    IDENT
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$"))
        .as_ref()
}

fn check_identifier(mapper: Option<&str>, what: &str, ident: &str) -> Result<()> {
    let regex = identifier_regex()
        .map_err(|e| Error::mapping(mapper, format!("identifier pattern failed to compile: {e}")))?;
    if regex.is_match(ident) {
        Ok(())
    } else {
        Err(Error::mapping(
            mapper,
            format!("invalid {what} identifier '{ident}'"),
        ))
    }
}

struct Resolution {
    target_id: MapperId,
    fk_columns: Vec<&'static str>,
    ref_columns: Vec<&'static str>,
    fk_nullable: bool,
}

impl RegistryBuilder {
    pub fn mapper(mut self, mapper: Mapper) -> Self {
        self.mappers.push(mapper);
        self
    }

    #[tracing::instrument(level = "debug", skip(self), fields(mappers = self.mappers.len()))]
    pub fn build(self) -> Result<Arc<Registry>> {
        let mut mappers = self.mappers;
        let mut by_name = HashMap::new();
        let mut by_table = HashMap::new();

        for (i, mapper) in mappers.iter_mut().enumerate() {
            mapper.id = MapperId(i);
            check_identifier(None, "mapper", mapper.name)?;
            check_identifier(Some(mapper.name), "table", mapper.table)?;
            if by_name.insert(mapper.name, mapper.id).is_some() {
                return Err(Error::mapping(Some(mapper.name), "mapper declared twice"));
            }
            if by_table.insert(mapper.table, mapper.id).is_some() {
                return Err(Error::mapping(
                    Some(mapper.name),
                    format!("table '{}' is mapped twice", mapper.table),
                ));
            }

            let mut seen = HashSet::new();
            for column in &mapper.columns {
                check_identifier(Some(mapper.name), "column", column.name)?;
                if !seen.insert(column.name) {
                    return Err(Error::mapping(
                        Some(mapper.name),
                        format!("column '{}' declared twice", column.name),
                    ));
                }
                if column.autoincrement && !column.primary_key {
                    return Err(Error::mapping(
                        Some(mapper.name),
                        format!("autoincrement column '{}' is not a primary key", column.name),
                    ));
                }
            }
            for rel in &mapper.relationships {
                check_identifier(Some(mapper.name), "relationship", rel.name)?;
                if !seen.insert(rel.name) {
                    return Err(Error::mapping(
                        Some(mapper.name),
                        format!("attribute '{}' declared twice", rel.name),
                    ));
                }
            }

            mapper.primary_key = mapper
                .columns
                .iter()
                .enumerate()
                .filter(|(_, c)| c.primary_key)
                .map(|(i, _)| i)
                .collect();
            if mapper.primary_key.is_empty() {
                return Err(Error::mapping(Some(mapper.name), "mapper has no primary key"));
            }
        }

        // Column-level foreign keys must point at mapped columns.
        for mapper in &mappers {
            for column in &mapper.columns {
                let Some(reference) = column.foreign_key else {
                    continue;
                };
                let (table, target_column) = column.references().ok_or_else(|| {
                    Error::mapping(
                        Some(mapper.name),
                        format!("foreign key '{reference}' must be written as table.column"),
                    )
                })?;
                let target = by_table
                    .get(table)
                    .map(|id: &MapperId| &mappers[id.0])
                    .ok_or_else(|| {
                        Error::mapping(
                            Some(mapper.name),
                            format!("foreign key '{reference}' references an unmapped table"),
                        )
                    })?;
                if target.find_column(target_column).is_none() {
                    return Err(Error::mapping(
                        Some(mapper.name),
                        format!("foreign key '{reference}' references an unknown column"),
                    ));
                }
            }
        }

        let mut resolutions: Vec<Vec<Resolution>> = Vec::with_capacity(mappers.len());
        let mut association_tables: Vec<AssociationTable> = Vec::new();
        for mapper in &mappers {
            let mut resolved = Vec::with_capacity(mapper.relationships.len());
            for rel in &mapper.relationships {
                let target_id = *by_name.get(rel.target).ok_or_else(|| {
                    Error::mapping(
                        Some(mapper.name),
                        format!(
                            "relationship '{}' targets unknown mapper '{}'",
                            rel.name, rel.target
                        ),
                    )
                })?;
                let target = &mappers[target_id.0];
                let resolution = match rel.kind {
                    RelationshipKind::ManyToMany => {
                        let secondary = rel.secondary.as_ref().ok_or_else(|| {
                            Error::mapping(
                                Some(mapper.name),
                                format!("many-to-many '{}' needs an association table", rel.name),
                            )
                        })?;
                        check_identifier(Some(mapper.name), "table", secondary.table)?;
                        for col in secondary.columns() {
                            check_identifier(Some(mapper.name), "column", col)?;
                        }
                        if secondary.local_columns.len() != mapper.primary_key.len()
                            || secondary.remote_columns.len() != target.primary_key.len()
                        {
                            return Err(Error::mapping(
                                Some(mapper.name),
                                format!(
                                    "association table '{}' does not match the primary key arity of its endpoints",
                                    secondary.table
                                ),
                            ));
                        }
                        if by_table.contains_key(secondary.table) {
                            return Err(Error::mapping(
                                Some(mapper.name),
                                format!(
                                    "association table '{}' is also mapped as an entity",
                                    secondary.table
                                ),
                            ));
                        }
                        if !association_tables.iter().any(|t| t.table == secondary.table) {
                            association_tables.push(secondary.clone());
                        }
                        Resolution {
                            target_id,
                            fk_columns: Vec::new(),
                            ref_columns: Vec::new(),
                            fk_nullable: true,
                        }
                    }
                    kind => {
                        if rel.secondary.is_some() {
                            return Err(Error::mapping(
                                Some(mapper.name),
                                format!("only many-to-many relationships take an association table ('{}')", rel.name),
                            ));
                        }
                        let (holder, referenced) = if kind == RelationshipKind::ManyToOne {
                            (mapper, target)
                        } else {
                            (target, mapper)
                        };
                        resolve_foreign_key(rel, holder, referenced, target_id)?
                    }
                };
                resolved.push(resolution);
            }
            resolutions.push(resolved);
        }

        for (mapper, resolved) in mappers.iter_mut().zip(resolutions) {
            for (rel, resolution) in mapper.relationships.iter_mut().zip(resolved) {
                rel.target_id = resolution.target_id;
                rel.fk_columns = resolution.fk_columns;
                rel.ref_columns = resolution.ref_columns;
                rel.fk_nullable = resolution.fk_nullable;
            }
        }

        // Reciprocity, weak sides and delete-orphan ownership.
        let mut reverses = Vec::new();
        let mut orphan_owners: Vec<Vec<(MapperId, usize)>> = vec![Vec::new(); mappers.len()];
        for mapper in &mappers {
            for (index, rel) in mapper.relationships.iter().enumerate() {
                if rel.cascade.contains(Cascade::DELETE_ORPHAN) {
                    if !rel.fk_on_target() {
                        return Err(Error::mapping(
                            Some(mapper.name),
                            format!(
                                "delete-orphan on '{}' is only valid for one-to-many or one-to-one",
                                rel.name
                            ),
                        ));
                    }
                    orphan_owners[rel.target_id.0].push((mapper.id, index));
                }
                let Some(back) = rel.back_populates else {
                    continue;
                };
                let target = &mappers[rel.target_id.0];
                let reverse_index = target.find_relationship(back).ok_or_else(|| {
                    Error::mapping(
                        Some(mapper.name),
                        format!("back_populates '{}' not found on '{}'", back, target.name),
                    )
                })?;
                let reverse = &target.relationships[reverse_index];
                let compatible = matches!(
                    (rel.kind, reverse.kind),
                    (RelationshipKind::OneToMany, RelationshipKind::ManyToOne)
                        | (RelationshipKind::ManyToOne, RelationshipKind::OneToMany)
                        | (RelationshipKind::OneToOne, RelationshipKind::ManyToOne)
                        | (RelationshipKind::ManyToOne, RelationshipKind::OneToOne)
                        | (RelationshipKind::ManyToMany, RelationshipKind::ManyToMany)
                );
                if reverse.target_id != mapper.id
                    || reverse.back_populates != Some(rel.name)
                    || !compatible
                {
                    return Err(Error::mapping(
                        Some(mapper.name),
                        format!(
                            "'{}' and '{}.{}' are not reciprocal",
                            rel.name, target.name, back
                        ),
                    ));
                }
                let weak = match rel.kind {
                    RelationshipKind::ManyToOne => true,
                    RelationshipKind::ManyToMany => {
                        (mapper.id, index) > (target.id, reverse_index)
                    }
                    _ => false,
                };
                reverses.push((mapper.id, index, reverse_index, weak));
            }
        }
        for (mapper_id, index, reverse_index, weak) in reverses {
            let rel = &mut mappers[mapper_id.0].relationships[index];
            rel.reverse = Some(reverse_index);
            rel.weak = weak;
        }
        for (mapper, owners) in mappers.iter_mut().zip(orphan_owners) {
            mapper.orphan_owners = owners;
        }

        tracing::debug!(
            mappers = mappers.len(),
            association_tables = association_tables.len(),
            "Mapping registry built"
        );

        Ok(Arc::new(Registry {
            mappers,
            by_name,
            by_table,
            association_tables,
        }))
    }
}

fn resolve_foreign_key(
    rel: &Relationship,
    holder: &Mapper,
    referenced: &Mapper,
    target_id: MapperId,
) -> Result<Resolution> {
    let owner = if rel.kind == RelationshipKind::ManyToOne {
        holder.name
    } else {
        referenced.name
    };
    let fk_columns: Vec<&'static str> = match rel.declared_foreign_key {
        Some(columns) => columns.to_vec(),
        None => holder
            .columns
            .iter()
            .filter(|c| {
                c.references()
                    .is_some_and(|(table, _)| table == referenced.table)
            })
            .map(|c| c.name)
            .collect(),
    };
    if fk_columns.is_empty() {
        return Err(Error::mapping(
            Some(owner),
            format!(
                "relationship '{}': no foreign key from '{}' to '{}'",
                rel.name, holder.table, referenced.table
            ),
        ));
    }
    if fk_columns.len() != referenced.primary_key.len() && rel.declared_foreign_key.is_none() {
        return Err(Error::mapping(
            Some(owner),
            format!(
                "relationship '{}': ambiguous foreign key from '{}' to '{}', declare foreign_key explicitly",
                rel.name, holder.table, referenced.table
            ),
        ));
    }

    let pk_columns = referenced.primary_key_columns();
    let mut ref_columns = Vec::with_capacity(fk_columns.len());
    let mut fk_nullable = true;
    for (position, name) in fk_columns.iter().enumerate() {
        let column = holder
            .find_column(name)
            .map(|i| &holder.columns[i])
            .ok_or_else(|| {
                Error::mapping(
                    Some(owner),
                    format!(
                        "relationship '{}': unknown foreign key column '{}.{}'",
                        rel.name, holder.table, name
                    ),
                )
            })?;
        fk_nullable &= column.nullable;
        let referenced_column = match column.references() {
            Some((table, col)) if table == referenced.table => col,
            _ => *pk_columns.get(position).ok_or_else(|| {
                Error::mapping(
                    Some(owner),
                    format!(
                        "relationship '{}': more foreign key columns than '{}' has key columns",
                        rel.name, referenced.table
                    ),
                )
            })?,
        };
        ref_columns.push(referenced_column);
    }

    Ok(Resolution {
        target_id,
        fk_columns,
        ref_columns,
        fk_nullable,
    })
}
