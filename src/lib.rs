//! Page-oriented table/row engine, B-tree index engine and column codec for
//! Jet-family desktop database files.
//!
//! General design: a [`table::Table`] owns a set of fixed-size data pages
//! holding row bodies encoded by [`row`]/[`value`], plus zero or more
//! [`index`] B-trees keyed by [`index::key`]'s order-preserving byte
//! encoding. [`relationship`] links tables pairwise and enforces
//! referential integrity across them. Both data pages and index pages are
//! read/written through the [`interfaces::PageChannel`] trait; [`stg`]
//! supplies a plain file-backed implementation.
//!
//! This crate does not implement a query language: callers drive
//! [`table::Table::add_rows`]/`update_row`/`delete_row` directly and supply
//! their own [`interfaces::ExpressionEvaluator`] for default values,
//! calculated columns and validation expressions.

#[macro_use]
pub mod util;

pub mod config;
pub mod error;
pub mod index;
pub mod interfaces;
pub mod page;
pub mod relationship;
pub mod row;
pub mod stg;
pub mod table;
pub mod value;

use error::JetResult;
use relationship::{ForeignKeyGuard, Relationship, RelationshipSet};
use std::collections::HashMap;
use std::cell::RefCell;
use std::rc::Rc;
use table::Table;
use tracing::info;

/// Shared database state. Held behind an `Rc` so each [`Table`] can carry
/// a `Weak<dyn ForeignKeyGuard>` back-reference to it without forming an
/// ownership cycle.
struct JetDatabaseInner {
    tables: RefCell<HashMap<String, Rc<Table>>>,
    relationships: RefCell<RelationshipSet>,
}

impl ForeignKeyGuard for JetDatabaseInner {
    fn check_child_write(&self, table_name: &str, values: &[value::Value]) -> JetResult<()> {
        self.relationships
            .borrow()
            .check_child_write(table_name, values, &self.tables.borrow())
    }

    fn on_parent_update(&self, table_name: &str, old_values: &[value::Value], new_values: &[value::Value]) -> JetResult<()> {
        self.relationships
            .borrow()
            .on_parent_update(table_name, old_values, new_values, &self.tables.borrow())
    }

    fn on_parent_delete(&self, table_name: &str, old_values: &[value::Value]) -> JetResult<()> {
        self.relationships
            .borrow()
            .on_parent_delete(table_name, old_values, &self.tables.borrow())
    }
}

/// Top-level handle tying a set of tables and the relationships between
/// them together, mirroring the way a single Jet-family `.mdb`/`.accdb`
/// file groups all of its tables.
pub struct JetDatabase {
    inner: Rc<JetDatabaseInner>,
}

impl JetDatabase {
    pub fn new() -> Self {
        JetDatabase {
            inner: Rc::new(JetDatabaseInner {
                tables: RefCell::new(HashMap::new()),
                relationships: RefCell::new(RelationshipSet::new()),
            }),
        }
    }

    /// Register a table, taking ownership; returns a shared handle so it
    /// can also be referenced from [`Relationship`] enforcement. The table
    /// is wired with a weak back-reference to this database so its own
    /// `add_one_row`/`update_row`/`delete_row` enforce FK constraints.
    pub fn add_table(&self, table: Table) -> Rc<Table> {
        let rc = Rc::new(table);
        let guard: Rc<dyn ForeignKeyGuard> = self.inner.clone();
        rc.set_fk_guard(Rc::downgrade(&guard));
        self.inner.tables.borrow_mut().insert(rc.name.clone(), rc.clone());
        rc
    }

    pub fn get_table(&self, name: &str) -> Option<Rc<Table>> {
        self.inner.tables.borrow().get(name).cloned()
    }

    pub fn add_relationship(&self, rel: Relationship) {
        self.inner.relationships.borrow_mut().add(rel);
    }

    /// Flush every table's dirty data and index pages.
    pub fn save(&self) -> JetResult<()> {
        for table in self.inner.tables.borrow().values() {
            table.save()?;
        }
        info!(tables = self.inner.tables.borrow().len(), "database saved");
        Ok(())
    }

    /// Discard every table's cached pages after a physical I/O failure,
    /// forcing a re-read from the page channel on next access.
    pub fn rollback(&self) {
        for table in self.inner.tables.borrow().values() {
            table.rollback();
        }
    }
}

impl Default for JetDatabase {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::interfaces::ExpressionContext;
    use crate::stg::FilePageChannel;
    use crate::table::Column;
    use crate::value::{ColumnType, Value};

    struct NoContext;
    impl ExpressionContext for NoContext {
        fn column_value(&self, _name: &str) -> Option<Value> {
            None
        }
        fn row_values(&self) -> &[Value] {
            &[]
        }
    }

    fn open_channel(tag: &str) -> (FilePageChannel, std::path::PathBuf) {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let path = std::env::temp_dir().join(format!("jetcore_lib_{tag}_{}.jdb", std::process::id()));
        let channel = FilePageChannel::open(path.to_str().unwrap(), 4096).unwrap();
        (channel, path)
    }

    #[test]
    fn basic_add_and_read_assigns_sequential_ids() {
        let (channel, path) = open_channel("basic");
        let mut id_col = Column::new("id", ColumnType::Long);
        id_col.is_autonumber = true;
        let columns = vec![id_col, Column::new("name", ColumnType::Text { max_len: 50, compressed: true })];
        let table = Table::new("people", columns, Config::default(), Box::new(channel), 1);

        let db = JetDatabase::new();
        let table = db.add_table(table);

        for name in ["alpha", "beta", "gamma"] {
            let mut row = vec![Value::Null, Value::Text(name.to_string())];
            table.add_rows(std::slice::from_mut(&mut row), None, &NoContext).unwrap();
        }
        db.save().unwrap();

        let rows = table.scan_rows().unwrap();
        let mut ids: Vec<i32> = rows
            .iter()
            .map(|(_, values)| match values[0] {
                Value::Long(n) => n,
                _ => panic!("expected autonumbered Long"),
            })
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(table.row_count(), 3);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn relationship_cascade_delete_removes_children() {
        let (parent_channel, parent_path) = open_channel("parent");
        let (child_channel, child_path) = open_channel("child");
        let (parent_index_channel, parent_index_path) = open_channel("parent_ix");

        let mut parent_id = Column::new("id", ColumnType::Long);
        parent_id.is_autonumber = true;
        let parent = Table::new(
            "parent",
            vec![parent_id],
            Config::default(),
            Box::new(parent_channel),
            1,
        );
        let child = Table::new(
            "child",
            vec![Column::new("parent_id", ColumnType::Long)],
            Config::default(),
            Box::new(child_channel),
            1,
        );

        let db = JetDatabase::new();
        let parent = db.add_table(parent);
        let child = db.add_table(child);

        let parent_cache = crate::index::IndexCache::create(Box::new(parent_index_channel), 1).unwrap();
        parent.add_index(crate::table::TableIndex {
            name: "PrimaryKey".to_string(),
            cache: std::cell::RefCell::new(parent_cache),
            columns: vec![0],
            ascending: vec![true],
            unique: true,
        });

        let mut prow = vec![Value::Null];
        let parent_ids = parent.add_rows(std::slice::from_mut(&mut prow), None, &NoContext).unwrap();
        let parent_key = match prow[0] {
            Value::Long(n) => n,
            _ => unreachable!(),
        };

        let mut crow1 = vec![Value::Long(parent_key)];
        let mut crow2 = vec![Value::Long(parent_key)];
        child.add_rows(std::slice::from_mut(&mut crow1), None, &NoContext).unwrap();
        child.add_rows(std::slice::from_mut(&mut crow2), None, &NoContext).unwrap();
        assert_eq!(child.row_count(), 2);

        let rel = crate::relationship::validate(
            "parent_child",
            &parent,
            &[0],
            &child,
            &[0],
            true,
            false,
            true,
            false,
        )
        .unwrap();
        db.add_relationship(rel);

        parent.delete_row(parent_ids[0]).unwrap();

        assert_eq!(child.row_count(), 0);
        assert_eq!(parent.row_count(), 0);

        let _ = std::fs::remove_file(parent_path);
        let _ = std::fs::remove_file(child_path);
        let _ = std::fs::remove_file(parent_index_path);
    }
}
