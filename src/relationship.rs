//! Relationship/FK engine: creation validation and enforcement for a
//! foreign-key link between a primary and a secondary table.

use crate::error::{Context, JetError, JetResult};
use crate::index::IndexCache;
use crate::table::{RowId, Table, TableIndex};
use crate::value::Value;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

/// A named FK link from a primary table's columns to a secondary table's
/// matching columns.
pub struct Relationship {
    pub name: String,
    pub primary_table: String,
    pub primary_columns: Vec<usize>,
    pub secondary_table: String,
    pub secondary_columns: Vec<usize>,
    pub referential_integrity: bool,
    pub cascade_update: bool,
    pub cascade_delete: bool,
    pub cascade_null: bool,
    pub one_to_one: bool,
}

/// Produce the next unused primary-index name in the sequence `.rB`, `.rC`,
/// …, `.rZ`, `.ra`, …
pub fn next_index_name(existing: &[String]) -> String {
    let candidates = ('B'..='Z').chain('a'..='z');
    for c in candidates {
        let name = format!(".r{c}");
        if !existing.iter().any(|e| e == &name) {
            return name;
        }
    }
    unreachable!("more than 51 relationship-backing indexes on one table")
}

fn column_names(table: &Table, columns: &[usize]) -> Vec<String> {
    columns.iter().map(|&i| table.columns[i].name.clone()).collect()
}

fn has_duplicate_names(names: &[String]) -> bool {
    for i in 0..names.len() {
        for j in (i + 1)..names.len() {
            if names[i] == names[j] {
                return true;
            }
        }
    }
    false
}

/// Validate and construct a relationship. Does not create the backing
/// indexes itself; see [`create_backing_indexes`].
pub fn validate(
    name: impl Into<String>,
    primary: &Table,
    primary_columns: &[usize],
    secondary: &Table,
    secondary_columns: &[usize],
    referential_integrity: bool,
    cascade_update: bool,
    cascade_delete: bool,
    cascade_null: bool,
) -> JetResult<Relationship> {
    let name = name.into();
    let ctx = || Context::relationship(name.clone());
    if primary_columns.len() != secondary_columns.len() || primary_columns.is_empty() {
        return Err(JetError::invalid_value(
            "relationship key column counts must match and be non-empty",
            ctx(),
        ));
    }
    for (&p, &s) in primary_columns.iter().zip(secondary_columns.iter()) {
        if !types_compatible(
            primary.columns[p].data_type,
            secondary.columns[s].data_type,
        ) {
            return Err(JetError::invalid_value(
                format!(
                    "key column type mismatch between {} and {}",
                    primary.columns[p].name, secondary.columns[s].name
                ),
                ctx(),
            ));
        }
    }

    let primary_names = column_names(primary, primary_columns);
    let secondary_names = column_names(secondary, secondary_columns);
    if has_duplicate_names(&primary_names) || has_duplicate_names(&secondary_names) {
        return Err(JetError::invalid_value(
            "relationship key columns must not repeat a column name",
            ctx(),
        ));
    }

    if referential_integrity {
        let refs: Vec<&str> = primary_names.iter().map(|s| s.as_str()).collect();
        match primary.find_index_by_columns(&refs) {
            Some(idx) if primary.index_is_unique(idx) => {}
            _ => {
                return Err(JetError::invalid_value(
                    "referential integrity requires a unique index on the primary key columns",
                    ctx(),
                ));
            }
        }
    }

    let one_to_one = {
        let refs: Vec<&str> = secondary_names.iter().map(|s| s.as_str()).collect();
        secondary
            .find_index_by_columns(&refs)
            .is_some_and(|idx| secondary.index_is_unique(idx))
    };

    Ok(Relationship {
        name,
        primary_table: primary.name.clone(),
        primary_columns: primary_columns.to_vec(),
        secondary_table: secondary.name.clone(),
        secondary_columns: secondary_columns.to_vec(),
        referential_integrity,
        cascade_update,
        cascade_delete,
        cascade_null,
        one_to_one,
    })
}

fn types_compatible(a: crate::value::ColumnType, b: crate::value::ColumnType) -> bool {
    std::mem::discriminant(&a) == std::mem::discriminant(&b)
}

/// Scan the secondary table for rows whose key is absent from the primary
/// unique index (ignoring all-null keys, which count as "no reference").
/// Called once at relationship-creation time.
pub fn check_no_orphans(rel: &Relationship, primary: &Table, secondary: &Table) -> JetResult<()> {
    if !rel.referential_integrity {
        return Ok(());
    }
    let primary_rows = primary.scan_rows()?;
    let mut primary_keys: Vec<Vec<Value>> = Vec::with_capacity(primary_rows.len());
    for (_, values) in &primary_rows {
        primary_keys.push(rel.primary_columns.iter().map(|&i| values[i].clone()).collect());
    }

    for (_, values) in secondary.scan_rows()? {
        let key: Vec<Value> = rel.secondary_columns.iter().map(|&i| values[i].clone()).collect();
        if key.iter().all(|v| v.is_null()) {
            continue;
        }
        if !primary_keys.contains(&key) {
            return Err(JetError::constraint_violation(
                format!(
                    "row in {} has no matching parent in {} for relationship {}",
                    secondary.name, primary.name, rel.name
                ),
                Context::relationship(rel.name.clone()),
            ));
        }
    }
    Ok(())
}

/// Create the backing indexes: unique on the primary side first,
/// named from [`next_index_name`]; non-unique (or unique, iff 1-1) on the
/// secondary side, named after the relationship.
pub fn create_backing_indexes(
    rel: &Relationship,
    primary: &Table,
    primary_cache: IndexCache,
    secondary: &Table,
    secondary_cache: IndexCache,
) {
    let existing: Vec<String> = primary.indexes.borrow().iter().map(|ix| ix.name.clone()).collect();
    let primary_name = next_index_name(&existing);
    primary.add_index(TableIndex {
        name: primary_name,
        cache: RefCell::new(primary_cache),
        columns: rel.primary_columns.clone(),
        ascending: vec![true; rel.primary_columns.len()],
        unique: true,
    });
    secondary.add_index(TableIndex {
        name: rel.name.clone(),
        cache: RefCell::new(secondary_cache),
        columns: rel.secondary_columns.clone(),
        ascending: vec![true; rel.secondary_columns.len()],
        unique: rel.one_to_one,
    });
    debug!(relationship = %rel.name, "created backing indexes");
}

/// Referential-integrity enforcement a [`Table`] holds a (weak) handle to
/// and calls from its own `add_one_row`/`update_row`/`delete_row`, so a
/// caller can't write to a table without the checks firing. Implemented by
/// the database-level type that owns a [`RelationshipSet`] and the table
/// registry it checks against.
pub trait ForeignKeyGuard {
    /// Child-side add/update check: the parent key must exist, or be
    /// entirely null (treated as no reference).
    fn check_child_write(&self, table_name: &str, values: &[Value]) -> JetResult<()>;

    /// Parent-side update: cascade the new key to matching children, or
    /// reject if any exist and cascading is off. A no-op if the primary
    /// key columns are unchanged.
    fn on_parent_update(&self, table_name: &str, old_values: &[Value], new_values: &[Value]) -> JetResult<()>;

    /// Parent-side delete: cascade-delete, cascade-null, or reject if any
    /// children exist.
    fn on_parent_delete(&self, table_name: &str, old_values: &[Value]) -> JetResult<()>;
}

/// Registry of relationships. Enforcement runs automatically: the
/// database type implements [`ForeignKeyGuard`] by delegating here, and
/// hands each [`Table`] a `Weak` reference to itself so `add_one_row`/
/// `update_row`/`delete_row` can call straight back in.
pub struct RelationshipSet {
    relationships: Vec<Relationship>,
}

impl RelationshipSet {
    pub fn new() -> Self {
        RelationshipSet { relationships: Vec::new() }
    }

    pub fn add(&mut self, rel: Relationship) {
        self.relationships.push(rel);
    }

    fn for_secondary<'a>(&'a self, table: &str) -> impl Iterator<Item = &'a Relationship> {
        self.relationships.iter().filter(move |r| r.secondary_table == table)
    }

    fn for_primary<'a>(&'a self, table: &str) -> impl Iterator<Item = &'a Relationship> {
        self.relationships.iter().filter(move |r| r.primary_table == table)
    }

    /// Child-side add/update check: the parent key must exist, or be
    /// entirely null (treated as no reference).
    pub fn check_child_write(
        &self,
        secondary_name: &str,
        secondary_values: &[Value],
        tables: &std::collections::HashMap<String, Rc<Table>>,
    ) -> JetResult<()> {
        for rel in self.for_secondary(secondary_name) {
            if !rel.referential_integrity {
                continue;
            }
            let key: Vec<Value> = rel
                .secondary_columns
                .iter()
                .map(|&i| secondary_values[i].clone())
                .collect();
            if key.iter().all(|v| v.is_null()) {
                continue;
            }
            let Some(primary) = tables.get(&rel.primary_table) else {
                continue;
            };
            let found = primary.scan_rows()?.iter().any(|(_, values)| {
                rel.primary_columns
                    .iter()
                    .zip(key.iter())
                    .all(|(&i, k)| &values[i] == k)
            });
            if !found {
                return Err(JetError::constraint_violation(
                    format!("no parent row in {} for relationship {}", rel.primary_table, rel.name),
                    Context::relationship(rel.name.clone()),
                ));
            }
        }
        Ok(())
    }

    /// Parent-side update: cascade the new key to matching children, or
    /// reject if any exist and cascading is off.
    pub fn on_parent_update(
        &self,
        primary_name: &str,
        old_values: &[Value],
        new_values: &[Value],
        tables: &std::collections::HashMap<String, Rc<Table>>,
    ) -> JetResult<()> {
        for rel in self.for_primary(primary_name) {
            if !rel.referential_integrity {
                continue;
            }
            let old_key: Vec<Value> = rel.primary_columns.iter().map(|&i| old_values[i].clone()).collect();
            let new_key: Vec<Value> = rel.primary_columns.iter().map(|&i| new_values[i].clone()).collect();
            if old_key == new_key {
                continue;
            }
            let Some(secondary) = tables.get(&rel.secondary_table) else {
                continue;
            };
            let children: Vec<RowId> = secondary
                .scan_rows()?
                .into_iter()
                .filter(|(_, values)| {
                    rel.secondary_columns
                        .iter()
                        .zip(old_key.iter())
                        .all(|(&i, k)| &values[i] == k)
                })
                .map(|(id, _)| id)
                .collect();
            if children.is_empty() {
                continue;
            }
            if !rel.cascade_update {
                return Err(JetError::constraint_violation(
                    format!("{} rows reference {} through {}", children.len(), primary_name, rel.name),
                    Context::relationship(rel.name.clone()),
                ));
            }
            for child_id in children {
                let mut values = secondary.decode_row_by_id(child_id)?;
                for (&sec_col, &pri_col) in rel.secondary_columns.iter().zip(rel.primary_columns.iter()) {
                    values[sec_col] = new_values[pri_col].clone();
                }
                secondary.update_row_raw(child_id, values)?;
            }
        }
        Ok(())
    }

    /// Parent-side delete: cascade-delete, cascade-null, or reject if any
    /// children exist.
    pub fn on_parent_delete(
        &self,
        primary_name: &str,
        old_values: &[Value],
        tables: &std::collections::HashMap<String, Rc<Table>>,
    ) -> JetResult<()> {
        for rel in self.for_primary(primary_name) {
            if !rel.referential_integrity {
                continue;
            }
            let key: Vec<Value> = rel.primary_columns.iter().map(|&i| old_values[i].clone()).collect();
            let Some(secondary) = tables.get(&rel.secondary_table) else {
                continue;
            };
            let children: Vec<RowId> = secondary
                .scan_rows()?
                .into_iter()
                .filter(|(_, values)| {
                    rel.secondary_columns
                        .iter()
                        .zip(key.iter())
                        .all(|(&i, k)| &values[i] == k)
                })
                .map(|(id, _)| id)
                .collect();
            if children.is_empty() {
                continue;
            }
            if rel.cascade_delete {
                for child_id in children {
                    secondary.delete_row(child_id)?;
                }
            } else if rel.cascade_null {
                for child_id in children {
                    let mut values = secondary.decode_row_by_id(child_id)?;
                    for &sec_col in &rel.secondary_columns {
                        values[sec_col] = Value::Null;
                    }
                    secondary.update_row_raw(child_id, values)?;
                }
            } else {
                return Err(JetError::constraint_violation(
                    format!("{} rows reference {} through {}", children.len(), primary_name, rel.name),
                    Context::relationship(rel.name.clone()),
                ));
            }
        }
        Ok(())
    }
}

impl Default for RelationshipSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_name_sequence_skips_existing() {
        let existing = vec![".rB".to_string(), ".rC".to_string()];
        assert_eq!(next_index_name(&existing), ".rD");
    }

    #[test]
    fn index_name_sequence_starts_at_b() {
        assert_eq!(next_index_name(&[]), ".rB");
    }

    #[test]
    fn duplicate_names_detected() {
        assert!(has_duplicate_names(&["A".to_string(), "A".to_string()]));
        assert!(!has_duplicate_names(&["A".to_string(), "B".to_string()]));
    }
}
