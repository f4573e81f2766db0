//! Core types and collaborator traits for sessionkit.
//!
//! This crate provides the foundations shared by the engine and by backends:
//!
//! - [`Value`] and [`Row`] for attribute storage and result sets
//! - [`Error`] taxonomy for the unit-of-work engine
//! - Mapping metadata ([`Mapper`], [`Relationship`], [`Cascade`]) validated by [`Registry`]
//! - [`IdentityKey`] for identity-map lookups
//! - The [`Connection`] trait every backend implements

pub mod connection;
pub mod error;
pub mod identity;
pub mod mapping;
pub mod row;
pub mod value;

pub use connection::{
    Capabilities, CompiledStatement, Connection, ExecuteResult, FrameKind, FrameRef, Statement,
};
pub use error::{
    Error, FlushError, FlushErrorKind, InvalidRequestError, InvalidRequestKind, MappingError,
    OrphanError, QueryError, QueryErrorKind, Result, StaleReferenceError,
};
pub use identity::IdentityKey;
pub use mapping::{
    AssociationTable, Cascade, ColumnDef, Mapper, MapperId, ReferentialAction, Registry,
    RegistryBuilder, Relationship, RelationshipKind,
};
pub use row::{ColumnInfo, Row};
pub use value::Value;
