//! In-memory backend for sessionkit.
//!
//! Implements the `Connection` collaborator over plain Rust collections so the
//! engine can be exercised without a database server. Tables are created
//! from a mapping [`Registry`](sessionkit_core::Registry); the backend
//! enforces primary key uniqueness, NOT NULL and foreign keys (immediately or
//! at commit), applies ON DELETE / ON UPDATE actions, and supports
//! savepoints and two-phase commit.
//!
//! # Example
//!
//! ```rust,ignore
//! let db = MemoryDatabase::from_registry(&registry);
//! let conn = db.connect_with(MemoryOptions::default().with_returning());
//! let log = conn.log();
//! let mut session = Session::new(Arc::clone(&registry), conn);
//! // ... flush ...
//! assert!(log.position("INSERT INTO parents") < log.position("INSERT INTO children"));
//! ```
//!
//! Each connection's open transaction works on a private copy of the
//! database; COMMIT replaces the shared committed state with it.

pub mod connection;
mod store;

pub use connection::{MemoryConnection, MemoryDatabase, MemoryOptions, StatementLog};
