//! The SQL collaborator interface.
//!
//! The engine never builds SQL text itself. It describes each write or load
//! as a [`Statement`], asks the backend to [`Connection::compile`] it, and
//! hands the [`CompiledStatement`] back to [`Connection::execute`] inside the
//! current transaction frame. Dialect concerns (quoting, RETURNING, sequence
//! pre-execution, savepoint syntax) stay behind this trait; the engine only
//! reads the [`Capabilities`] flags to decide how to capture generated keys
//! and which transaction primitives are available.

use std::fmt;

use crate::error::{Error, InvalidRequestKind, Result};
use crate::row::Row;
use crate::value::Value;

/// What the backend can do, consulted once per flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// INSERT can return generated columns inline.
    pub supports_returning: bool,
    /// Sequence-backed keys must be fetched before the INSERT.
    pub requires_sequence_preexecute: bool,
    pub supports_savepoints: bool,
    pub supports_two_phase: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            supports_returning: false,
            requires_sequence_preexecute: false,
            supports_savepoints: true,
            supports_two_phase: false,
        }
    }
}

/// A backend-neutral description of one statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Insert {
        table: &'static str,
        columns: Vec<&'static str>,
        values: Vec<Value>,
        /// Columns to hand back in `returned_rows`, when RETURNING is supported.
        returning: Vec<&'static str>,
    },
    Update {
        table: &'static str,
        set_columns: Vec<&'static str>,
        set_values: Vec<Value>,
        key_columns: Vec<&'static str>,
        key_values: Vec<Value>,
    },
    Delete {
        table: &'static str,
        key_columns: Vec<&'static str>,
        key_values: Vec<Value>,
    },
    /// Equality-filtered load. An empty filter selects every row.
    Select {
        table: &'static str,
        columns: Vec<&'static str>,
        filter_columns: Vec<&'static str>,
        filter_values: Vec<Value>,
    },
    NextSequence {
        sequence: &'static str,
    },
}

impl Statement {
    pub fn table(&self) -> Option<&'static str> {
        match self {
            Statement::Insert { table, .. }
            | Statement::Update { table, .. }
            | Statement::Delete { table, .. }
            | Statement::Select { table, .. } => Some(*table),
            Statement::NextSequence { .. } => None,
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            Statement::Insert { .. } => "INSERT",
            Statement::Update { .. } => "UPDATE",
            Statement::Delete { .. } => "DELETE",
            Statement::Select { .. } => "SELECT",
            Statement::NextSequence { .. } => "NEXTVAL",
        }
    }
}

/// A statement compiled by the backend: SQL text, bound parameters, and the
/// structured form it was compiled from.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledStatement {
    pub sql: String,
    pub params: Vec<Value>,
    pub statement: Statement,
}

impl CompiledStatement {
    /// ANSI rendering with `$n` placeholders, for backends that need nothing
    /// dialect-specific.
    pub fn generic(statement: Statement) -> Self {
        let mut params = Vec::new();
        let bind = |value: &Value, params: &mut Vec<Value>| {
            params.push(value.clone());
            format!("${}", params.len())
        };
        let sql = match &statement {
            Statement::Insert {
                table,
                columns,
                values,
                returning,
            } => {
                let placeholders: Vec<String> =
                    values.iter().map(|v| bind(v, &mut params)).collect();
                let mut sql = if columns.is_empty() {
                    format!("INSERT INTO {table} DEFAULT VALUES")
                } else {
                    format!(
                        "INSERT INTO {table} ({}) VALUES ({})",
                        columns.join(", "),
                        placeholders.join(", ")
                    )
                };
                if !returning.is_empty() {
                    sql.push_str(&format!(" RETURNING {}", returning.join(", ")));
                }
                sql
            }
            Statement::Update {
                table,
                set_columns,
                set_values,
                key_columns,
                key_values,
            } => {
                let sets: Vec<String> = set_columns
                    .iter()
                    .zip(set_values)
                    .map(|(c, v)| format!("{c} = {}", bind(v, &mut params)))
                    .collect();
                let keys: Vec<String> = key_columns
                    .iter()
                    .zip(key_values)
                    .map(|(c, v)| format!("{c} = {}", bind(v, &mut params)))
                    .collect();
                format!(
                    "UPDATE {table} SET {} WHERE {}",
                    sets.join(", "),
                    keys.join(" AND ")
                )
            }
            Statement::Delete {
                table,
                key_columns,
                key_values,
            } => {
                let keys: Vec<String> = key_columns
                    .iter()
                    .zip(key_values)
                    .map(|(c, v)| format!("{c} = {}", bind(v, &mut params)))
                    .collect();
                format!("DELETE FROM {table} WHERE {}", keys.join(" AND "))
            }
            Statement::Select {
                table,
                columns,
                filter_columns,
                filter_values,
            } => {
                let mut sql = format!("SELECT {} FROM {table}", columns.join(", "));
                if !filter_columns.is_empty() {
                    let keys: Vec<String> = filter_columns
                        .iter()
                        .zip(filter_values)
                        .map(|(c, v)| format!("{c} = {}", bind(v, &mut params)))
                        .collect();
                    sql.push_str(&format!(" WHERE {}", keys.join(" AND ")));
                }
                sql
            }
            Statement::NextSequence { sequence } => format!("SELECT nextval('{sequence}')"),
        };
        Self {
            sql,
            params,
            statement,
        }
    }
}

impl fmt::Display for CompiledStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sql)
    }
}

/// Outcome of executing one compiled statement.
#[derive(Debug, Clone, Default)]
pub struct ExecuteResult {
    pub affected_rows: u64,
    /// Keys assigned by the backend (autoincrement, sequence value).
    pub generated_keys: Vec<Value>,
    /// RETURNING output, or the result set of a SELECT.
    pub returned_rows: Vec<Row>,
}

/// Kind of a transaction frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// The real database transaction.
    Root,
    /// Logical nesting; commit is a no-op against the connection.
    Subtransaction,
    /// A SAVEPOINT.
    Savepoint,
}

/// Handle to a transaction frame, passed to every `execute`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRef {
    pub id: u64,
    pub depth: usize,
    pub kind: FrameKind,
}

fn unsupported(what: &str) -> Error {
    Error::invalid(
        InvalidRequestKind::Unsupported,
        format!("backend does not support {what}"),
    )
}

/// A backend connection as seen by the unit-of-work engine.
///
/// Calls are synchronous and blocking. Implementations own statement
/// compilation and every dialect rule.
pub trait Connection {
    fn capabilities(&self) -> Capabilities;

    fn compile(&self, statement: Statement) -> Result<CompiledStatement> {
        Ok(CompiledStatement::generic(statement))
    }

    fn execute(&mut self, frame: &FrameRef, statement: &CompiledStatement)
    -> Result<ExecuteResult>;

    fn begin(&mut self) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;

    fn savepoint(&mut self, _name: &str) -> Result<()> {
        Err(unsupported("savepoints"))
    }

    /// Undo everything since the savepoint and discard it.
    fn rollback_to_savepoint(&mut self, _name: &str) -> Result<()> {
        Err(unsupported("savepoints"))
    }

    fn release_savepoint(&mut self, _name: &str) -> Result<()> {
        Err(unsupported("savepoints"))
    }

    /// First phase of two-phase commit for the current root transaction.
    fn prepare_two_phase(&mut self, _xid: &str) -> Result<()> {
        Err(unsupported("two-phase commit"))
    }

    fn commit_prepared(&mut self, _xid: &str) -> Result<()> {
        Err(unsupported("two-phase commit"))
    }

    fn rollback_prepared(&mut self, _xid: &str) -> Result<()> {
        Err(unsupported("two-phase commit"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generic_insert_rendering() {
        let compiled = CompiledStatement::generic(Statement::Insert {
            table: "parents",
            columns: vec!["id", "name"],
            values: vec![Value::BigInt(1), Value::from("p")],
            returning: vec!["id"],
        });
        assert_eq!(
            compiled.sql,
            "INSERT INTO parents (id, name) VALUES ($1, $2) RETURNING id"
        );
        assert_eq!(compiled.params.len(), 2);
    }

    #[test]
    fn test_generic_update_binds_set_then_key() {
        let compiled = CompiledStatement::generic(Statement::Update {
            table: "children",
            set_columns: vec!["parent_id"],
            set_values: vec![Value::BigInt(2)],
            key_columns: vec!["id"],
            key_values: vec![Value::BigInt(9)],
        });
        assert_eq!(compiled.sql, "UPDATE children SET parent_id = $1 WHERE id = $2");
        assert_eq!(compiled.params, vec![Value::BigInt(2), Value::BigInt(9)]);
        assert_eq!(compiled.statement.verb(), "UPDATE");
        assert_eq!(compiled.statement.table(), Some("children"));
    }

    #[test]
    fn test_generic_select_without_filter() {
        let compiled = CompiledStatement::generic(Statement::Select {
            table: "tags",
            columns: vec!["id"],
            filter_columns: vec![],
            filter_values: vec![],
        });
        assert_eq!(compiled.sql, "SELECT id FROM tags");
        assert!(compiled.params.is_empty());
    }
}
