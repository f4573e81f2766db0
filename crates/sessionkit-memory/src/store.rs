//! Table storage and constraint enforcement.

use std::collections::BTreeMap;
use std::sync::Arc;

use sessionkit_core::{
    ColumnInfo, QueryError, QueryErrorKind, ReferentialAction, Registry, Row, Value,
};

type StoreResult<T> = std::result::Result<T, QueryError>;

#[derive(Debug, Clone)]
pub(crate) struct ForeignKey {
    columns: Vec<usize>,
    ref_table: &'static str,
    ref_columns: Vec<&'static str>,
    on_delete: ReferentialAction,
    on_update: ReferentialAction,
}

#[derive(Debug)]
pub(crate) struct TableDef {
    name: &'static str,
    columns: Vec<&'static str>,
    nullable: Vec<bool>,
    primary_key: Vec<usize>,
    autoincrement: Option<usize>,
    foreign_keys: Vec<ForeignKey>,
}

impl TableDef {
    fn column_index(&self, name: &str) -> StoreResult<usize> {
        self.columns.iter().position(|c| *c == name).ok_or_else(|| {
            QueryError::new(
                QueryErrorKind::NotFound,
                format!("no such column: {}.{}", self.name, name),
            )
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Table {
    def: Arc<TableDef>,
    rows: Vec<Vec<Value>>,
    next_id: i64,
}

/// A complete database image. Transactions and savepoints work on clones.
#[derive(Debug, Clone, Default)]
pub(crate) struct Store {
    tables: BTreeMap<&'static str, Table>,
    sequences: BTreeMap<&'static str, i64>,
}

fn matches(a: &Value, b: &Value) -> bool {
    !a.is_null() && !b.is_null() && a.to_key_form().same_as(&b.to_key_form())
}

fn constraint(message: String) -> QueryError {
    QueryError::new(QueryErrorKind::Constraint, message)
}

impl Store {
    pub(crate) fn from_registry(registry: &Registry) -> Self {
        let mut store = Store::default();
        for mapper in registry.mappers() {
            let mut foreign_keys: Vec<ForeignKey> = Vec::new();
            for (i, column) in mapper.columns().iter().enumerate() {
                if let Some(seq) = column.sequence {
                    store.sequences.insert(seq, 0);
                }
                let Some((ref_table, ref_column)) = column.references() else {
                    continue;
                };
                if let Some(fk) = foreign_keys.iter_mut().find(|fk| fk.ref_table == ref_table) {
                    fk.columns.push(i);
                    fk.ref_columns.push(ref_column);
                } else {
                    foreign_keys.push(ForeignKey {
                        columns: vec![i],
                        ref_table,
                        ref_columns: vec![ref_column],
                        on_delete: column.on_delete,
                        on_update: column.on_update,
                    });
                }
            }
            let def = TableDef {
                name: mapper.table(),
                columns: mapper.columns().iter().map(|c| c.name).collect(),
                nullable: mapper.columns().iter().map(|c| c.nullable).collect(),
                primary_key: mapper.primary_key_indices().to_vec(),
                autoincrement: mapper.columns().iter().position(|c| c.autoincrement),
                foreign_keys,
            };
            store.add_table(def);
        }

        for mapper in registry.mappers() {
            for rel in mapper.relationships() {
                let Some(secondary) = rel.secondary() else {
                    continue;
                };
                if store.tables.contains_key(secondary.table) {
                    continue;
                }
                let target = registry.mapper(rel.target_id());
                let local = secondary.local_columns.len();
                let columns = secondary.columns();
                let def = TableDef {
                    name: secondary.table,
                    nullable: vec![false; columns.len()],
                    primary_key: (0..columns.len()).collect(),
                    autoincrement: None,
                    foreign_keys: vec![
                        ForeignKey {
                            columns: (0..local).collect(),
                            ref_table: mapper.table(),
                            ref_columns: mapper.primary_key_columns(),
                            on_delete: ReferentialAction::NoAction,
                            on_update: ReferentialAction::NoAction,
                        },
                        ForeignKey {
                            columns: (local..columns.len()).collect(),
                            ref_table: target.table(),
                            ref_columns: target.primary_key_columns(),
                            on_delete: ReferentialAction::NoAction,
                            on_update: ReferentialAction::NoAction,
                        },
                    ],
                    columns,
                };
                store.add_table(def);
            }
        }
        store
    }

    fn add_table(&mut self, def: TableDef) {
        self.tables.insert(
            def.name,
            Table {
                def: Arc::new(def),
                rows: Vec::new(),
                next_id: 0,
            },
        );
    }

    fn table(&self, name: &str) -> StoreResult<&Table> {
        self.tables.get(name).ok_or_else(|| {
            QueryError::new(QueryErrorKind::NotFound, format!("no such table: {name}"))
        })
    }

    fn table_mut(&mut self, name: &str) -> StoreResult<&mut Table> {
        self.tables.get_mut(name).ok_or_else(|| {
            QueryError::new(QueryErrorKind::NotFound, format!("no such table: {name}"))
        })
    }

    fn matching_rows(
        &self,
        table: &str,
        columns: &[&str],
        values: &[Value],
    ) -> StoreResult<Vec<usize>> {
        let table = self.table(table)?;
        let indices = columns
            .iter()
            .map(|c| table.def.column_index(c))
            .collect::<StoreResult<Vec<_>>>()?;
        Ok(table
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| {
                indices
                    .iter()
                    .zip(values)
                    .all(|(&i, v)| matches(&row[i], v))
            })
            .map(|(i, _)| i)
            .collect())
    }

    pub(crate) fn column_names(&self, table: &str) -> StoreResult<Vec<&'static str>> {
        Ok(self.table(table)?.def.columns.clone())
    }

    pub(crate) fn row_count(&self, table: &str) -> StoreResult<usize> {
        Ok(self.table(table)?.rows.len())
    }

    pub(crate) fn next_sequence(&mut self, sequence: &'static str) -> i64 {
        let next = self.sequences.entry(sequence).or_insert(0);
        *next += 1;
        *next
    }

    /// Insert a row. Returns the stored row and the generated key, if any.
    pub(crate) fn insert(
        &mut self,
        table_name: &str,
        columns: &[&str],
        values: &[Value],
        check_fks: bool,
    ) -> StoreResult<(Vec<Value>, Option<Value>)> {
        let table = self.table_mut(table_name)?;
        let def = Arc::clone(&table.def);
        let mut row = vec![Value::Null; def.columns.len()];
        for (column, value) in columns.iter().zip(values) {
            row[def.column_index(column)?] = value.clone();
        }

        let mut generated = None;
        if let Some(auto) = def.autoincrement {
            match row[auto].as_i64() {
                Some(explicit) => table.next_id = table.next_id.max(explicit),
                None if row[auto].is_null() => {
                    table.next_id += 1;
                    row[auto] = Value::BigInt(table.next_id);
                    generated = Some(row[auto].clone());
                }
                None => {}
            }
        }

        for (i, value) in row.iter().enumerate() {
            if value.is_null() && !def.nullable[i] {
                return Err(constraint(format!(
                    "NOT NULL constraint failed: {}.{}",
                    def.name, def.columns[i]
                )));
            }
        }
        let duplicate = table.rows.iter().any(|existing| {
            def.primary_key
                .iter()
                .all(|&i| matches(&existing[i], &row[i]))
        });
        if duplicate {
            return Err(constraint(format!(
                "UNIQUE constraint failed: {} primary key",
                def.name
            )));
        }
        table.rows.push(row.clone());

        if check_fks {
            if let Err(e) = self.check_row_references(&def, &row) {
                if let Ok(table) = self.table_mut(table_name) {
                    table.rows.pop();
                }
                return Err(e);
            }
        }
        Ok((row, generated))
    }

    pub(crate) fn update(
        &mut self,
        table_name: &str,
        set_columns: &[&str],
        set_values: &[Value],
        key_columns: &[&str],
        key_values: &[Value],
        check_fks: bool,
    ) -> StoreResult<u64> {
        let targets = self.matching_rows(table_name, key_columns, key_values)?;
        let def = Arc::clone(&self.table(table_name)?.def);
        let set_indices = set_columns
            .iter()
            .map(|c| def.column_index(c))
            .collect::<StoreResult<Vec<_>>>()?;

        for &row_index in &targets {
            let old = self.table(table_name)?.rows[row_index].clone();
            let mut new = old.clone();
            for (&i, value) in set_indices.iter().zip(set_values) {
                new[i] = value.clone();
            }
            for (i, value) in new.iter().enumerate() {
                if value.is_null() && !def.nullable[i] {
                    return Err(constraint(format!(
                        "NOT NULL constraint failed: {}.{}",
                        def.name, def.columns[i]
                    )));
                }
            }
            let key_changed = def
                .primary_key
                .iter()
                .any(|&i| !old[i].to_key_form().same_as(&new[i].to_key_form()));
            if key_changed {
                let clash = self
                    .table(table_name)?
                    .rows
                    .iter()
                    .enumerate()
                    .any(|(j, existing)| {
                        j != row_index
                            && def
                                .primary_key
                                .iter()
                                .all(|&i| matches(&existing[i], &new[i]))
                    });
                if clash {
                    return Err(constraint(format!(
                        "UNIQUE constraint failed: {} primary key",
                        def.name
                    )));
                }
            }
            if check_fks {
                self.check_row_references(&def, &new)?;
            }
            self.table_mut(table_name)?.rows[row_index] = new.clone();
            self.apply_referencing_actions(&def, &old, Some(&new), check_fks)?;
        }
        Ok(targets.len() as u64)
    }

    pub(crate) fn delete(
        &mut self,
        table_name: &str,
        key_columns: &[&str],
        key_values: &[Value],
        check_fks: bool,
    ) -> StoreResult<u64> {
        let targets = self.matching_rows(table_name, key_columns, key_values)?;
        let def = Arc::clone(&self.table(table_name)?.def);
        let removed: Vec<Vec<Value>> = {
            let table = self.table_mut(table_name)?;
            let mut removed = Vec::with_capacity(targets.len());
            for &i in targets.iter().rev() {
                removed.push(table.rows.remove(i));
            }
            removed
        };
        for old in &removed {
            self.apply_referencing_actions(&def, old, None, check_fks)?;
        }
        Ok(removed.len() as u64)
    }

    pub(crate) fn select(
        &self,
        table_name: &str,
        columns: &[&'static str],
        filter_columns: &[&str],
        filter_values: &[Value],
    ) -> StoreResult<Vec<Row>> {
        let rows = self.matching_rows(table_name, filter_columns, filter_values)?;
        let table = self.table(table_name)?;
        let projection = columns
            .iter()
            .map(|c| table.def.column_index(c))
            .collect::<StoreResult<Vec<_>>>()?;
        let info = Arc::new(ColumnInfo::new(
            columns.iter().map(|c| (*c).to_string()).collect(),
        ));
        Ok(rows
            .into_iter()
            .map(|i| {
                let values = projection
                    .iter()
                    .map(|&p| table.rows[i][p].clone())
                    .collect();
                Row::with_columns(Arc::clone(&info), values)
            })
            .collect())
    }

    pub(crate) fn all_rows(&self, table_name: &str) -> StoreResult<Vec<Row>> {
        let table = self.table(table_name)?;
        let columns = table.def.columns.clone();
        self.select(table_name, &columns, &[], &[])
    }

    /// Every foreign key of every row must resolve. Used for deferred checking.
    pub(crate) fn check_all_references(&self) -> StoreResult<()> {
        for table in self.tables.values() {
            for row in &table.rows {
                self.check_row_references(&table.def, row)?;
            }
        }
        Ok(())
    }

    fn check_row_references(&self, def: &TableDef, row: &[Value]) -> StoreResult<()> {
        for fk in &def.foreign_keys {
            let values: Vec<Value> = fk.columns.iter().map(|&i| row[i].clone()).collect();
            if values.iter().any(Value::is_null) {
                continue;
            }
            if self
                .matching_rows(fk.ref_table, &fk.ref_columns, &values)?
                .is_empty()
            {
                let columns: Vec<&str> = fk.columns.iter().map(|&i| def.columns[i]).collect();
                return Err(constraint(format!(
                    "FOREIGN KEY constraint failed: {}({}) references {}",
                    def.name,
                    columns.join(", "),
                    fk.ref_table
                )));
            }
        }
        Ok(())
    }

    /// Handle rows elsewhere that reference `old`, after it was updated to
    /// `new` or deleted (`new == None`).
    fn apply_referencing_actions(
        &mut self,
        parent: &TableDef,
        old: &[Value],
        new: Option<&[Value]>,
        check_fks: bool,
    ) -> StoreResult<()> {
        let referencing: Vec<(&'static str, ForeignKey, Vec<&'static str>)> = self
            .tables
            .values()
            .flat_map(|t| {
                t.def
                    .foreign_keys
                    .iter()
                    .filter(|fk| fk.ref_table == parent.name)
                    .map(|fk| {
                        let cols = fk.columns.iter().map(|&i| t.def.columns[i]).collect();
                        (t.def.name, fk.clone(), cols)
                    })
                    .collect::<Vec<_>>()
            })
            .collect();

        for (child_table, fk, fk_columns) in referencing {
            let ref_indices = fk
                .ref_columns
                .iter()
                .map(|c| parent.column_index(c))
                .collect::<StoreResult<Vec<_>>>()?;
            let old_values: Vec<Value> = ref_indices.iter().map(|&i| old[i].clone()).collect();
            if let Some(new) = new {
                let unchanged = ref_indices
                    .iter()
                    .all(|&i| old[i].to_key_form().same_as(&new[i].to_key_form()));
                if unchanged {
                    continue;
                }
            }
            let dependents = self.matching_rows(child_table, &fk_columns, &old_values)?;
            if dependents.is_empty() {
                continue;
            }
            let action = if new.is_some() { fk.on_update } else { fk.on_delete };
            match (action, new) {
                (ReferentialAction::Cascade, Some(new)) => {
                    let new_values: Vec<Value> =
                        ref_indices.iter().map(|&i| new[i].clone()).collect();
                    self.update(
                        child_table,
                        &fk_columns,
                        &new_values,
                        &fk_columns,
                        &old_values,
                        check_fks,
                    )?;
                }
                (ReferentialAction::Cascade, None) => {
                    self.delete(child_table, &fk_columns, &old_values, check_fks)?;
                }
                (ReferentialAction::SetNull, _) => {
                    let nulls = vec![Value::Null; fk_columns.len()];
                    self.update(
                        child_table,
                        &fk_columns,
                        &nulls,
                        &fk_columns,
                        &old_values,
                        check_fks,
                    )?;
                }
                (ReferentialAction::NoAction | ReferentialAction::Restrict, _) => {
                    if check_fks {
                        return Err(constraint(format!(
                            "FOREIGN KEY constraint failed: {} is still referenced by {}",
                            parent.name, child_table
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sessionkit_core::{ColumnDef, Mapper};

    fn store(on_delete: ReferentialAction) -> Store {
        let registry = Registry::builder()
            .mapper(
                Mapper::new("Parent", "parents")
                    .column(ColumnDef::new("id").primary_key(true).autoincrement(true)),
            )
            .mapper(
                Mapper::new("Child", "children")
                    .column(ColumnDef::new("id").primary_key(true).autoincrement(true))
                    .column(
                        ColumnDef::new("parent_id")
                            .foreign_key("parents.id")
                            .on_delete(on_delete)
                            .on_update(ReferentialAction::Cascade),
                    ),
            )
            .build()
            .unwrap();
        Store::from_registry(&registry)
    }

    #[test]
    fn test_autoincrement_and_duplicate_key() {
        let mut store = store(ReferentialAction::NoAction);
        let (_, generated) = store.insert("parents", &[], &[], true).unwrap();
        assert_eq!(generated, Some(Value::BigInt(1)));
        let err = store
            .insert("parents", &["id"], &[Value::BigInt(1)], true)
            .unwrap_err();
        assert_eq!(err.kind, QueryErrorKind::Constraint);
        let (_, generated) = store.insert("parents", &[], &[], true).unwrap();
        assert_eq!(generated, Some(Value::BigInt(2)));
    }

    #[test]
    fn test_foreign_key_checked_immediately() {
        let mut store = store(ReferentialAction::NoAction);
        let err = store
            .insert("children", &["parent_id"], &[Value::BigInt(5)], true)
            .unwrap_err();
        assert!(err.message.contains("FOREIGN KEY"));
        assert_eq!(store.row_count("children").unwrap(), 0);

        store.insert("parents", &[], &[], true).unwrap();
        store
            .insert("children", &["parent_id"], &[Value::BigInt(1)], true)
            .unwrap();
        let err = store
            .delete("parents", &["id"], &[Value::BigInt(1)], true)
            .unwrap_err();
        assert_eq!(err.kind, QueryErrorKind::Constraint);
    }

    #[test]
    fn test_deferred_checking_allows_temporary_violation() {
        let mut store = store(ReferentialAction::NoAction);
        store
            .insert("children", &["parent_id"], &[Value::BigInt(1)], false)
            .unwrap();
        assert!(store.check_all_references().is_err());
        store.insert("parents", &[], &[], false).unwrap();
        assert!(store.check_all_references().is_ok());
    }

    #[test]
    fn test_referential_actions() {
        let mut store = store(ReferentialAction::Cascade);
        store.insert("parents", &[], &[], true).unwrap();
        store
            .insert("children", &["parent_id"], &[Value::Int(1)], true)
            .unwrap();

        store
            .update("parents", &["id"], &[Value::BigInt(10)], &["id"], &[Value::BigInt(1)], true)
            .unwrap();
        let rows = store
            .select("children", &["parent_id"], &[], &[])
            .unwrap();
        assert_eq!(rows[0].get(0), Some(&Value::BigInt(10)));

        assert_eq!(
            store.delete("parents", &["id"], &[Value::BigInt(10)], true).unwrap(),
            1
        );
        assert_eq!(store.row_count("children").unwrap(), 0);
    }
}
