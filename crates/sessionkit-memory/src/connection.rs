//! Connection implementation over the shared in-memory database.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use sessionkit_core::{
    Capabilities, CompiledStatement, Connection, Error, ExecuteResult, FrameRef,
    QueryError, QueryErrorKind, Registry, Result, Row, Statement, Value,
};

use crate::store::Store;

/// Behaviour switches for a [`MemoryConnection`].
#[derive(Debug, Clone, Copy)]
pub struct MemoryOptions {
    pub capabilities: Capabilities,
    /// Check foreign keys at COMMIT / PREPARE instead of per statement.
    pub deferred_foreign_keys: bool,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            capabilities: Capabilities {
                supports_returning: false,
                requires_sequence_preexecute: false,
                supports_savepoints: true,
                supports_two_phase: true,
            },
            deferred_foreign_keys: false,
        }
    }
}

impl MemoryOptions {
    pub fn with_returning(mut self) -> Self {
        self.capabilities.supports_returning = true;
        self
    }

    pub fn with_sequence_preexecute(mut self) -> Self {
        self.capabilities.requires_sequence_preexecute = true;
        self
    }

    pub fn without_savepoints(mut self) -> Self {
        self.capabilities.supports_savepoints = false;
        self
    }

    pub fn deferred_foreign_keys(mut self) -> Self {
        self.deferred_foreign_keys = true;
        self
    }
}

/// Append-only record of every statement and transaction command sent to a
/// connection. Cloning shares the record.
#[derive(Debug, Clone, Default)]
pub struct StatementLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl StatementLog {
    fn lock(&self) -> MutexGuard<'_, Vec<String>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, entry: impl Into<String>) {
        let entry = entry.into();
        tracing::trace!(sql = %entry, "memory backend statement");
        self.lock().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.lock().clone()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Entries starting with `prefix`, in order.
    pub fn matching(&self, prefix: &str) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.lock().iter().filter(|e| e.starts_with(prefix)).count()
    }

    /// Index of the first entry starting with `prefix`.
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.lock().iter().position(|e| e.starts_with(prefix))
    }
}

#[derive(Debug)]
struct Shared {
    committed: Store,
    prepared: HashMap<String, Store>,
}

/// A database shared by every connection opened on it.
#[derive(Debug, Clone)]
pub struct MemoryDatabase {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryDatabase {
    /// Create empty tables for every mapper and association table.
    pub fn from_registry(registry: &Registry) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                committed: Store::from_registry(registry),
                prepared: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn connect(&self) -> MemoryConnection {
        self.connect_with(MemoryOptions::default())
    }

    pub fn connect_with(&self, options: MemoryOptions) -> MemoryConnection {
        MemoryConnection {
            db: self.clone(),
            options,
            working: None,
            savepoints: Vec::new(),
            log: StatementLog::default(),
        }
    }

    /// Committed rows of a table, all columns.
    pub fn rows(&self, table: &str) -> Result<Vec<Row>> {
        Ok(self.lock().committed.all_rows(table)?)
    }

    pub fn row_count(&self, table: &str) -> Result<usize> {
        Ok(self.lock().committed.row_count(table)?)
    }

    /// Committed rows matching an equality filter.
    pub fn find(&self, table: &str, filter: &[(&str, Value)]) -> Result<Vec<Row>> {
        let shared = self.lock();
        let all = shared.committed.all_rows(table)?;
        Ok(all
            .into_iter()
            .filter(|row| {
                filter.iter().all(|(c, v)| {
                    row.get_by_name(c)
                        .is_some_and(|x| x.to_key_form().same_as(&v.to_key_form()))
                })
            })
            .collect())
    }

    /// Insert directly into committed state, outside any transaction.
    pub fn seed(&self, table: &str, values: &[(&str, Value)]) -> Result<()> {
        let columns: Vec<&str> = values.iter().map(|(c, _)| *c).collect();
        let values: Vec<Value> = values.iter().map(|(_, v)| v.clone()).collect();
        self.lock().committed.insert(table, &columns, &values, true)?;
        Ok(())
    }

    /// Delete directly from committed state, as another client would.
    pub fn delete_where(&self, table: &str, key: &[(&str, Value)]) -> Result<u64> {
        let columns: Vec<&str> = key.iter().map(|(c, _)| *c).collect();
        let values: Vec<Value> = key.iter().map(|(_, v)| v.clone()).collect();
        Ok(self.lock().committed.delete(table, &columns, &values, true)?)
    }

    /// Update committed state directly, as another client would.
    pub fn update_where(
        &self,
        table: &str,
        set: &[(&str, Value)],
        key: &[(&str, Value)],
    ) -> Result<u64> {
        let set_columns: Vec<&str> = set.iter().map(|(c, _)| *c).collect();
        let set_values: Vec<Value> = set.iter().map(|(_, v)| v.clone()).collect();
        let key_columns: Vec<&str> = key.iter().map(|(c, _)| *c).collect();
        let key_values: Vec<Value> = key.iter().map(|(_, v)| v.clone()).collect();
        Ok(self.lock().committed.update(
            table,
            &set_columns,
            &set_values,
            &key_columns,
            &key_values,
            true,
        )?)
    }

    /// Transaction ids currently in the prepared state.
    pub fn prepared_transactions(&self) -> Vec<String> {
        let mut xids: Vec<String> = self.lock().prepared.keys().cloned().collect();
        xids.sort();
        xids
    }
}

/// A connection holding at most one open transaction. The transaction works
/// on a private copy of the database that replaces the committed state on
/// COMMIT.
#[derive(Debug)]
pub struct MemoryConnection {
    db: MemoryDatabase,
    options: MemoryOptions,
    working: Option<Store>,
    savepoints: Vec<(String, Store)>,
    log: StatementLog,
}

fn no_transaction(command: &str) -> Error {
    QueryError::new(
        QueryErrorKind::Database,
        format!("{command} issued with no transaction in progress"),
    )
    .into_error()
}

impl MemoryConnection {
    /// Shared handle on this connection's statement log.
    pub fn log(&self) -> StatementLog {
        self.log.clone()
    }

    pub fn database(&self) -> &MemoryDatabase {
        &self.db
    }

    pub fn in_transaction(&self) -> bool {
        self.working.is_some()
    }

    fn run(&self, store: &mut Store, compiled: &CompiledStatement) -> Result<ExecuteResult> {
        let check = !self.options.deferred_foreign_keys;
        let with_sql = |e: QueryError| e.with_sql(compiled.sql.clone()).into_error();
        let result = match &compiled.statement {
            Statement::Insert {
                table,
                columns,
                values,
                returning,
            } => {
                let (row, generated) = store
                    .insert(table, columns, values, check)
                    .map_err(with_sql)?;
                let mut returned_rows = Vec::new();
                if !returning.is_empty() {
                    let names = store.column_names(table).map_err(with_sql)?;
                    let values = returning
                        .iter()
                        .map(|c| {
                            names
                                .iter()
                                .position(|name| name == c)
                                .map_or(Value::Null, |i| row[i].clone())
                        })
                        .collect();
                    returned_rows.push(Row::new(
                        returning.iter().map(|c| (*c).to_string()).collect(),
                        values,
                    ));
                }
                ExecuteResult {
                    affected_rows: 1,
                    generated_keys: generated.into_iter().collect(),
                    returned_rows,
                }
            }
            Statement::Update {
                table,
                set_columns,
                set_values,
                key_columns,
                key_values,
            } => ExecuteResult {
                affected_rows: store
                    .update(table, set_columns, set_values, key_columns, key_values, check)
                    .map_err(with_sql)?,
                ..ExecuteResult::default()
            },
            Statement::Delete {
                table,
                key_columns,
                key_values,
            } => ExecuteResult {
                affected_rows: store
                    .delete(table, key_columns, key_values, check)
                    .map_err(with_sql)?,
                ..ExecuteResult::default()
            },
            Statement::Select {
                table,
                columns,
                filter_columns,
                filter_values,
            } => {
                let rows = store
                    .select(table, columns, filter_columns, filter_values)
                    .map_err(with_sql)?;
                ExecuteResult {
                    affected_rows: rows.len() as u64,
                    generated_keys: Vec::new(),
                    returned_rows: rows,
                }
            }
            Statement::NextSequence { sequence } => {
                let value = Value::BigInt(store.next_sequence(sequence));
                ExecuteResult {
                    affected_rows: 0,
                    generated_keys: vec![value.clone()],
                    returned_rows: vec![Row::new(vec!["nextval".to_string()], vec![value])],
                }
            }
        };
        Ok(result)
    }
}

impl Connection for MemoryConnection {
    fn capabilities(&self) -> Capabilities {
        self.options.capabilities
    }

    fn compile(&self, statement: Statement) -> Result<CompiledStatement> {
        Ok(CompiledStatement::generic(statement))
    }

    fn execute(&mut self, frame: &FrameRef, statement: &CompiledStatement) -> Result<ExecuteResult> {
        tracing::trace!(frame = frame.id, depth = frame.depth, sql = %statement.sql, "memory execute");
        self.log.push(statement.sql.clone());
        match self.working.take() {
            Some(mut store) => {
                let result = self.run(&mut store, statement);
                self.working = Some(store);
                result
            }
            None => {
                // Autocommit: apply straight to committed state.
                let db = self.db.clone();
                let mut shared = db.lock();
                let mut store = shared.committed.clone();
                let result = self.run(&mut store, statement)?;
                if self.options.deferred_foreign_keys {
                    store.check_all_references()?;
                }
                shared.committed = store;
                Ok(result)
            }
        }
    }

    fn begin(&mut self) -> Result<()> {
        if self.working.is_some() {
            return Err(QueryError::new(
                QueryErrorKind::Database,
                "BEGIN issued inside a transaction",
            )
            .into_error());
        }
        self.log.push("BEGIN");
        self.working = Some(self.db.lock().committed.clone());
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let store = self.working.take().ok_or_else(|| no_transaction("COMMIT"))?;
        self.savepoints.clear();
        self.log.push("COMMIT");
        if self.options.deferred_foreign_keys {
            store.check_all_references()?;
        }
        self.db.lock().committed = store;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.log.push("ROLLBACK");
        self.savepoints.clear();
        self.working = None;
        Ok(())
    }

    fn savepoint(&mut self, name: &str) -> Result<()> {
        let snapshot = self
            .working
            .clone()
            .ok_or_else(|| no_transaction("SAVEPOINT"))?;
        self.log.push(format!("SAVEPOINT {name}"));
        self.savepoints.push((name.to_string(), snapshot));
        Ok(())
    }

    fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        let index = self
            .savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| {
                QueryError::new(QueryErrorKind::NotFound, format!("no such savepoint: {name}"))
                    .into_error()
            })?;
        self.log.push(format!("ROLLBACK TO SAVEPOINT {name}"));
        let (_, snapshot) = self.savepoints.remove(index);
        self.savepoints.truncate(index);
        self.working = Some(snapshot);
        Ok(())
    }

    fn release_savepoint(&mut self, name: &str) -> Result<()> {
        let index = self
            .savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| {
                QueryError::new(QueryErrorKind::NotFound, format!("no such savepoint: {name}"))
                    .into_error()
            })?;
        self.log.push(format!("RELEASE SAVEPOINT {name}"));
        self.savepoints.truncate(index);
        Ok(())
    }

    fn prepare_two_phase(&mut self, xid: &str) -> Result<()> {
        let store = self
            .working
            .take()
            .ok_or_else(|| no_transaction("PREPARE TRANSACTION"))?;
        if self.options.deferred_foreign_keys {
            store.check_all_references()?;
        }
        self.savepoints.clear();
        self.log.push(format!("PREPARE TRANSACTION '{xid}'"));
        self.db.lock().prepared.insert(xid.to_string(), store);
        Ok(())
    }

    fn commit_prepared(&mut self, xid: &str) -> Result<()> {
        let mut shared = self.db.lock();
        let store = shared.prepared.remove(xid).ok_or_else(|| {
            QueryError::new(
                QueryErrorKind::NotFound,
                format!("prepared transaction '{xid}' does not exist"),
            )
            .into_error()
        })?;
        shared.committed = store;
        drop(shared);
        self.log.push(format!("COMMIT PREPARED '{xid}'"));
        Ok(())
    }

    fn rollback_prepared(&mut self, xid: &str) -> Result<()> {
        self.db.lock().prepared.remove(xid);
        self.log.push(format!("ROLLBACK PREPARED '{xid}'"));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sessionkit_core::{ColumnDef, FrameKind, Mapper};

    fn database() -> MemoryDatabase {
        let registry = Registry::builder()
            .mapper(
                Mapper::new("Item", "items")
                    .column(ColumnDef::new("id").primary_key(true).autoincrement(true))
                    .column(ColumnDef::new("name")),
            )
            .build()
            .unwrap();
        MemoryDatabase::from_registry(&registry)
    }

    fn root() -> FrameRef {
        FrameRef {
            id: 1,
            depth: 0,
            kind: FrameKind::Root,
        }
    }

    fn insert(conn: &mut MemoryConnection, name: &str) -> ExecuteResult {
        let compiled = conn
            .compile(Statement::Insert {
                table: "items",
                columns: vec!["name"],
                values: vec![Value::from(name)],
                returning: vec!["id"],
            })
            .unwrap();
        conn.execute(&root(), &compiled).unwrap()
    }

    #[test]
    fn test_commit_publishes_working_copy() {
        let db = database();
        let mut conn = db.connect();
        conn.begin().unwrap();
        let result = insert(&mut conn, "a");
        assert_eq!(result.generated_keys, vec![Value::BigInt(1)]);
        assert_eq!(result.returned_rows[0].get_by_name("id"), Some(&Value::BigInt(1)));
        assert_eq!(db.row_count("items").unwrap(), 0);
        conn.commit().unwrap();
        assert_eq!(db.row_count("items").unwrap(), 1);
        assert_eq!(conn.log().entries()[0], "BEGIN");
    }

    #[test]
    fn test_savepoint_rollback_discards_later_work() {
        let db = database();
        let mut conn = db.connect();
        conn.begin().unwrap();
        insert(&mut conn, "kept");
        conn.savepoint("sp_1").unwrap();
        insert(&mut conn, "dropped");
        conn.rollback_to_savepoint("sp_1").unwrap();
        conn.commit().unwrap();
        let rows = db.rows("items").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_by_name("name"), Some(&Value::from("kept")));
        assert!(conn.release_savepoint("sp_1").is_err());
    }

    #[test]
    fn test_two_phase_commit() {
        let db = database();
        let mut conn = db.connect();
        conn.begin().unwrap();
        insert(&mut conn, "x");
        conn.prepare_two_phase("xid-1").unwrap();
        assert_eq!(db.prepared_transactions(), vec!["xid-1".to_string()]);
        assert_eq!(db.row_count("items").unwrap(), 0);
        conn.commit_prepared("xid-1").unwrap();
        assert_eq!(db.row_count("items").unwrap(), 1);
        assert!(db.prepared_transactions().is_empty());
    }

    #[test]
    fn test_rollback_discards_everything() {
        let db = database();
        let mut conn = db.connect();
        conn.begin().unwrap();
        insert(&mut conn, "x");
        conn.rollback().unwrap();
        assert!(!conn.in_transaction());
        assert_eq!(db.row_count("items").unwrap(), 0);
        assert_eq!(conn.log().count("INSERT INTO items"), 1);
    }
}
