//! Table engine: column metadata, validator chains, autonumber
//! generation, calculated-column ordering, and the row add/update/delete
//! algorithms built on the data page format and the index cache.

use crate::config::Config;
use crate::error::{Context, JetError, JetResult};
use crate::index::{commit_all, IndexCache, PendingChange};
use crate::relationship::ForeignKeyGuard;
use crate::interfaces::{ExpressionContext, ExpressionEvaluator, PageChannel};
use crate::page::{Page, PagePtr};
use crate::row::{self, ColumnPlan};
use crate::value::{self, ColumnType, Value};
use rustc_hash::FxHashMap as HashMap;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// A page/row location: the file format's row identity.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub struct RowId {
    pub page_number: u32,
    pub row_number: u8,
}

impl RowId {
    pub const FIRST_ROW_ID: RowId = RowId {
        page_number: 0,
        row_number: 0,
    };
    pub const LAST_ROW_ID: RowId = RowId {
        page_number: u32::MAX,
        row_number: u8::MAX,
    };
    pub const INVALID: RowId = RowId {
        page_number: u32::MAX,
        row_number: 0,
    };
}

/// A cons-list validator chain: zero or more internal validators
/// wrapping a tail, which is either the caller-supplied external validator
/// or the identity.
pub enum Validator {
    Required(Box<Validator>),
    NoZeroLen(Box<Validator>),
    Expression(String, Box<Validator>),
    External,
}

impl Validator {
    pub fn identity() -> Validator {
        Validator::External
    }

    pub fn validate(
        &self,
        value: &Value,
        evaluator: Option<&dyn ExpressionEvaluator>,
        ectx: &dyn ExpressionContext,
        jctx: &Context,
    ) -> JetResult<()> {
        match self {
            Validator::Required(delegate) => {
                if value.is_null() {
                    return Err(JetError::constraint_violation(
                        "value is required",
                        jctx.clone(),
                    ));
                }
                delegate.validate(value, evaluator, ectx, jctx)
            }
            Validator::NoZeroLen(delegate) => {
                if let Value::Text(s) = value {
                    if s.is_empty() {
                        return Err(JetError::constraint_violation(
                            "zero-length text is not allowed",
                            jctx.clone(),
                        ));
                    }
                }
                delegate.validate(value, evaluator, ectx, jctx)
            }
            Validator::Expression(expr, delegate) => {
                if let Some(ev) = evaluator {
                    if matches!(ev.evaluate(expr, ectx)?, Value::Boolean(false)) {
                        return Err(JetError::constraint_violation(
                            format!("validation rule failed: {expr}"),
                            jctx.clone(),
                        ));
                    }
                }
                delegate.validate(value, evaluator, ectx, jctx)
            }
            Validator::External => Ok(()),
        }
    }
}

/// Column metadata. Autonumber columns always carry
/// `Validator::identity()`.
pub struct Column {
    pub name: String,
    pub data_type: ColumnType,
    pub is_autonumber: bool,
    pub is_calculated: bool,
    pub is_hyperlink: bool,
    pub is_append_only: bool,
    pub validator: Validator,
    pub default_expr: Option<String>,
    pub calculated_expr: Option<String>,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: ColumnType) -> Self {
        Column {
            name: name.into(),
            data_type,
            is_autonumber: false,
            is_calculated: false,
            is_hyperlink: false,
            is_append_only: false,
            validator: Validator::identity(),
            default_expr: None,
            calculated_expr: None,
        }
    }
}

/// Monotonic Long autonumber generator.
pub struct LongAutonumber {
    last: Cell<i32>,
}

impl LongAutonumber {
    pub fn new(last: i32) -> Self {
        LongAutonumber { last: Cell::new(last) }
    }

    pub fn next(&self) -> i32 {
        let v = self.last.get() + 1;
        self.last.set(v);
        v
    }

    pub fn handle_insert(&self, v: i32, allow_explicit_insert: bool, ctx: Context) -> JetResult<()> {
        if v <= 0 && !allow_explicit_insert {
            return Err(JetError::constraint_violation(
                "autonumber insert requires a positive explicit value",
                ctx,
            ));
        }
        if v > self.last.get() {
            self.last.set(v);
        }
        Ok(())
    }

    pub fn restore(&self, x: i32) {
        self.last.set(x - 1);
    }

    pub fn current(&self) -> i32 {
        self.last.get()
    }
}

/// Tracks the single complex-type autonumber value shared across every
/// complex FK column touched while writing one row.
#[derive(Default)]
pub struct WriteRowState {
    complex_value: Option<i32>,
}

/// One backing index: a B-tree keyed on a subset of the table's columns.
pub struct TableIndex {
    pub name: String,
    pub cache: RefCell<IndexCache>,
    pub columns: Vec<usize>,
    pub ascending: Vec<bool>,
    pub unique: bool,
}

/// Base table: column metadata, owned data pages, and backing
/// indexes. Drives the row add/update/delete algorithms.
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    pub config: Config,
    channel: RefCell<Box<dyn PageChannel>>,
    pages: RefCell<HashMap<u32, PagePtr>>,
    dirty_pages: RefCell<Vec<u32>>,
    owned_pages: RefCell<Vec<u32>>,
    tdef_page: u32,
    pub indexes: RefCell<Vec<TableIndex>>,
    row_count: Cell<u64>,
    mod_count: Cell<u64>,
    pub long_autonumber: LongAutonumber,
    pub complex_autonumber: LongAutonumber,
    pub row_validator_expr: Option<String>,
    fk_guard: RefCell<Option<std::rc::Weak<dyn ForeignKeyGuard>>>,
}

impl Table {
    pub fn new(
        name: impl Into<String>,
        columns: Vec<Column>,
        config: Config,
        channel: Box<dyn PageChannel>,
        tdef_page: u32,
    ) -> Self {
        Table {
            name: name.into(),
            columns,
            config,
            channel: RefCell::new(channel),
            pages: RefCell::new(HashMap::default()),
            dirty_pages: RefCell::new(Vec::new()),
            owned_pages: RefCell::new(Vec::new()),
            tdef_page,
            indexes: RefCell::new(Vec::new()),
            row_count: Cell::new(0),
            mod_count: Cell::new(0),
            long_autonumber: LongAutonumber::new(0),
            complex_autonumber: LongAutonumber::new(0),
            row_validator_expr: None,
            fk_guard: RefCell::new(None),
        }
    }

    /// Wire this table into a referential-integrity enforcer, so
    /// `add_one_row`/`update_row`/`delete_row` can no longer be called
    /// without it firing. Held as a `Weak` reference since the enforcer
    /// (a database-level registry) is the one that owns the tables.
    pub fn set_fk_guard(&self, guard: std::rc::Weak<dyn ForeignKeyGuard>) {
        *self.fk_guard.borrow_mut() = Some(guard);
    }

    fn fk_guard(&self) -> Option<Rc<dyn ForeignKeyGuard>> {
        self.fk_guard.borrow().as_ref().and_then(|w| w.upgrade())
    }

    pub fn row_count(&self) -> u64 {
        self.row_count.get()
    }

    pub fn mod_count(&self) -> u64 {
        self.mod_count.get()
    }

    /// Topologically sort the calculated columns by their expression's
    /// identifier set, so a calculated column referenced by another
    /// is evaluated first. A cycle is reported lazily, at evaluation time,
    /// since that is when the caller can name the offending column.
    pub fn calculated_order(&self) -> JetResult<Vec<usize>> {
        let calc: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_calculated)
            .map(|(i, _)| i)
            .collect();

        let deps_of = |idx: usize| -> Vec<usize> {
            let Some(expr) = &self.columns[idx].calculated_expr else {
                return Vec::new();
            };
            calc.iter()
                .copied()
                .filter(|&other| other != idx && expr.contains(&self.columns[other].name))
                .collect()
        };

        let mut order = Vec::with_capacity(calc.len());
        let mut visited = vec![false; self.columns.len()];
        let mut visiting = vec![false; self.columns.len()];

        fn visit(
            idx: usize,
            deps_of: &dyn Fn(usize) -> Vec<usize>,
            visited: &mut [bool],
            visiting: &mut [bool],
            order: &mut Vec<usize>,
        ) -> JetResult<()> {
            if visited[idx] {
                return Ok(());
            }
            if visiting[idx] {
                return Err(JetError::invalid_value(
                    "calculated column dependency graph is not acyclic",
                    Context::default(),
                ));
            }
            visiting[idx] = true;
            for dep in deps_of(idx) {
                visit(dep, deps_of, visited, visiting, order)?;
            }
            visiting[idx] = false;
            visited[idx] = true;
            order.push(idx);
            Ok(())
        }

        for idx in calc {
            visit(idx, &deps_of, &mut visited, &mut visiting, &mut order)?;
        }
        Ok(order)
    }

    fn row_layout(&self) -> (Vec<ColumnPlan>, usize, usize) {
        let mut fixed_offset = 0usize;
        let mut var_order = 0usize;
        let mut plans = Vec::with_capacity(self.columns.len());
        for (i, col) in self.columns.iter().enumerate() {
            let variable = col.data_type.is_variable();
            let stores_in_null_mask = col.data_type.stores_in_null_mask();
            let fixed_size = col.data_type.fixed_size().unwrap_or(0);
            let plan = ColumnPlan {
                null_mask_bit: i,
                stores_in_null_mask,
                variable,
                fixed_data_offset: fixed_offset,
                fixed_size,
                var_order: if variable { var_order } else { 0 },
            };
            if !variable && !stores_in_null_mask {
                fixed_offset += fixed_size;
            }
            if variable {
                var_order += 1;
            }
            plans.push(plan);
        }
        (plans, self.columns.len(), var_order)
    }

    fn get_page(&self, page_number: u32) -> JetResult<PagePtr> {
        if let Some(p) = self.pages.borrow().get(&page_number) {
            return Ok(p.clone());
        }
        let mut buf = vec![0u8; self.config.page_size];
        self.channel.borrow().read_page(page_number, &mut buf).map_err(|e| {
            let err = JetError::io(e, Context::table(self.name.clone()));
            if err.is_physical() {
                self.rollback();
            }
            err
        })?;
        let page = Rc::new(RefCell::new(Page::from_bytes(page_number, buf)));
        self.pages.borrow_mut().insert(page_number, page.clone());
        Ok(page)
    }

    fn new_page(&self) -> JetResult<PagePtr> {
        let page_number = self.channel.borrow_mut().allocate_new_page().map_err(|e| {
            let err = JetError::io(e, Context::table(self.name.clone()));
            if err.is_physical() {
                self.rollback();
            }
            err
        })?;
        let page = Rc::new(RefCell::new(Page::new_data_page(
            page_number,
            self.tdef_page,
            self.config.page_size,
        )));
        self.pages.borrow_mut().insert(page_number, page.clone());
        self.owned_pages.borrow_mut().push(page_number);
        self.dirty_pages.borrow_mut().push(page_number);
        Ok(page)
    }

    /// Find a data page with `needed` bytes free, searching the
    /// owned-pages list in reverse, or allocate a fresh one.
    fn find_or_allocate_page(&self, needed: usize) -> JetResult<PagePtr> {
        for &page_number in self.owned_pages.borrow().iter().rev() {
            let page = self.get_page(page_number)?;
            if page.borrow().free_space() as usize >= needed {
                return Ok(page);
            }
        }
        self.new_page()
    }

    /// Run the validator chain and default-expression substitution for
    /// every non-autonumber column.
    fn apply_defaults_and_validate(
        &self,
        values: &mut [Value],
        evaluator: Option<&dyn ExpressionEvaluator>,
        ectx: &dyn ExpressionContext,
    ) -> JetResult<()> {
        for (i, col) in self.columns.iter().enumerate() {
            if col.is_autonumber || col.is_calculated {
                continue;
            }
            if values[i].is_null() {
                if let (Some(expr), Some(ev)) = (&col.default_expr, evaluator) {
                    values[i] = ev.evaluate(expr, ectx)?;
                }
            }
            let col_ctx = Context::column(self.name.clone(), col.name.clone());
            col.validator.validate(&values[i], evaluator, ectx, &col_ctx)?;
        }
        Ok(())
    }

    /// Assign autonumber columns.
    fn assign_autonumbers(&self, values: &mut [Value], state: &mut WriteRowState) -> JetResult<()> {
        for (i, col) in self.columns.iter().enumerate() {
            if !col.is_autonumber {
                continue;
            }
            let col_ctx = Context::column(self.name.clone(), col.name.clone());
            match col.data_type {
                ColumnType::Long => {
                    let supplied = matches!(values[i], Value::Null);
                    if supplied && !self.config.allow_autonumber_insert {
                        values[i] = Value::Long(self.long_autonumber.next());
                    } else if let Value::Long(v) = values[i] {
                        self.long_autonumber
                            .handle_insert(v, self.config.allow_autonumber_insert, col_ctx)?;
                    }
                }
                ColumnType::Guid => {
                    if matches!(values[i], Value::Null) {
                        let uuid = Uuid::new_v4();
                        values[i] = Value::Guid(value::guid_from_uuid_bytes(*uuid.as_bytes()));
                    }
                }
                ColumnType::ComplexFk => {
                    if matches!(values[i], Value::Null) {
                        let v = *state.complex_value.get_or_insert_with(|| self.complex_autonumber.next());
                        values[i] = Value::ComplexFk(v);
                    } else if let Value::ComplexFk(v) = values[i] {
                        self.complex_autonumber
                            .handle_insert(v, self.config.allow_autonumber_insert, col_ctx)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn encode_row(&self, values: &[Value]) -> JetResult<Vec<u8>> {
        let (plans, max_column_count, max_var_column_count) = self.row_layout();
        let mut encoded = Vec::with_capacity(values.len());
        for (i, col) in self.columns.iter().enumerate() {
            let col_ctx = Context::column(self.name.clone(), col.name.clone());
            if values[i].is_null() {
                encoded.push(None);
                continue;
            }
            if col.data_type.stores_in_null_mask() {
                encoded.push(Some(Vec::new()));
                continue;
            }
            let remaining = self.config.page_size;
            encoded.push(Some(value::write(&values[i], col.data_type, remaining, &col_ctx)?));
        }
        row::create_row(
            max_column_count,
            max_var_column_count,
            &plans,
            &encoded,
            self.config.format.var_offset_width(),
            0,
            self.config.half_size(),
            &Context::table(self.name.clone()),
        )
    }

    /// Decode a row body back into column values.
    pub fn decode_row(&self, body: &[u8]) -> JetResult<Vec<Value>> {
        let (plans, max_column_count, max_var_column_count) = self.row_layout();
        let width = self.config.format.var_offset_width();
        let mut values = Vec::with_capacity(self.columns.len());
        for (col, plan) in self.columns.iter().zip(plans.iter()) {
            let col_ctx = Context::column(self.name.clone(), col.name.clone());
            if col.data_type.stores_in_null_mask() {
                let present = row::read_column(body, plan, max_column_count, max_var_column_count, width);
                values.push(if present.is_some() {
                    Value::Boolean(true)
                } else {
                    Value::Boolean(false)
                });
                continue;
            }
            let bytes = row::read_column(body, plan, max_column_count, max_var_column_count, width);
            values.push(match bytes {
                Some(b) => value::read(col.data_type, b, &col_ctx)?,
                None => Value::Null,
            });
        }
        Ok(values)
    }

    fn index_entries(&self, values: &[Value], row_id: RowId) -> Vec<(usize, Vec<u8>)> {
        let indexes = self.indexes.borrow();
        let mut out = Vec::with_capacity(indexes.len());
        for (i, ix) in indexes.iter().enumerate() {
            let keyed: Vec<(Value, bool)> = ix
                .columns
                .iter()
                .zip(ix.ascending.iter())
                .map(|(&c, &asc)| (values[c].clone(), asc))
                .collect();
            let entry = crate::index::key::encode_composite(
                &keyed,
                crate::index::key::NumericKeyVariant::Current,
                row_id.page_number,
                row_id.row_number,
            );
            out.push((i, entry));
        }
        out
    }

    /// Add one or more rows. `values` are replaced in place with the
    /// coerced/autonumbered row values on success.
    pub fn add_rows(
        &self,
        rows: &mut [Vec<Value>],
        evaluator: Option<&dyn ExpressionEvaluator>,
        ectx: &dyn ExpressionContext,
    ) -> JetResult<Vec<RowId>> {
        let mut written = Vec::with_capacity(rows.len());
        for values in rows.iter_mut() {
            if values.len() < self.columns.len() {
                values.resize(self.columns.len(), Value::Null);
            }
            let mut state = WriteRowState::default();
            match self.add_one_row(values, evaluator, ectx, &mut state) {
                Ok(row_id) => written.push(row_id),
                Err(e) => {
                    if !written.is_empty() {
                        return Err(JetError::batch_update(written.len(), e, Context::table(self.name.clone())));
                    }
                    return Err(e);
                }
            }
        }
        Ok(written)
    }

    fn add_one_row(
        &self,
        values: &mut [Value],
        evaluator: Option<&dyn ExpressionEvaluator>,
        ectx: &dyn ExpressionContext,
        state: &mut WriteRowState,
    ) -> JetResult<RowId> {
        self.apply_defaults_and_validate(values, evaluator, ectx)?;

        // Snapshot both autonumber counters so a failure anywhere past this
        // point (calculated columns, validation, FK check, index commit)
        // can undo any value(s) just consumed from them.
        let long_snapshot = self.long_autonumber.current();
        let complex_snapshot = self.complex_autonumber.current();
        self.assign_autonumbers(values, state)?;

        match self.finish_add_one_row(values, evaluator, ectx) {
            Ok(row_id) => Ok(row_id),
            Err(e) => {
                self.long_autonumber.restore(long_snapshot + 1);
                self.complex_autonumber.restore(complex_snapshot + 1);
                Err(e)
            }
        }
    }

    fn finish_add_one_row(
        &self,
        values: &mut [Value],
        evaluator: Option<&dyn ExpressionEvaluator>,
        ectx: &dyn ExpressionContext,
    ) -> JetResult<RowId> {
        for idx in self.calculated_order()? {
            if let (Some(expr), Some(ev)) = (&self.columns[idx].calculated_expr, evaluator) {
                values[idx] = ev.evaluate(expr, ectx)?;
            }
        }
        if let (Some(expr), Some(ev)) = (&self.row_validator_expr, evaluator) {
            if matches!(ev.evaluate(expr, ectx)?, Value::Boolean(false)) {
                return Err(JetError::constraint_violation(
                    format!("row validation rule failed: {expr}"),
                    Context::table(self.name.clone()),
                ));
            }
        }
        if let Some(guard) = self.fk_guard() {
            guard.check_child_write(&self.name, values)?;
        }

        let body = self.encode_row(values)?;
        let page = self.find_or_allocate_page(body.len() + 2)?;
        let page_number = page.borrow().page_number;

        // Tentatively slot the row so its page/row number is known for
        // index-entry encoding, then build and commit pending index
        // changes before making the insert durable.
        let row_number = {
            let mut p = page.borrow_mut();
            p.insert_row(&body).ok_or_else(|| {
                JetError::invalid_value("row does not fit on any page", Context::table(self.name.clone()))
            })?
        };
        let row_id = RowId {
            page_number,
            row_number: row_number as u8,
        };

        let entries = self.index_entries(values, row_id);
        let mut pending = Vec::with_capacity(entries.len());
        {
            let indexes = self.indexes.borrow();
            for (i, entry) in &entries {
                let cache = indexes[*i].cache.borrow();
                pending.push(PendingChange::prepare_add_row(&cache, entry.clone(), indexes[*i].unique)?);
            }
        }
        let mut indexes = self.indexes.borrow_mut();
        let commit_args: Vec<(&mut IndexCache, PendingChange)> = indexes
            .iter_mut()
            .zip(pending.into_iter())
            .map(|(ix, change)| (ix.cache.get_mut(), change))
            .collect();
        if let Err(e) = commit_all(commit_args) {
            page.borrow_mut().mark_deleted(row_number);
            return Err(e);
        }
        drop(indexes);

        self.dirty_pages.borrow_mut().push(page_number);
        self.row_count.set(self.row_count.get() + 1);
        self.mod_count.set(self.mod_count.get() + 1);
        trace!(table = %self.name, page = page_number, row = row_number, "row added");
        Ok(row_id)
    }

    /// Locate the live row body for `row_id`, following the overflow chain
    /// until a non-overflow row is reached.
    fn resolve_live_row(&self, row_id: RowId) -> JetResult<(PagePtr, u16)> {
        let mut page_number = row_id.page_number;
        let mut row_number = row_id.row_number as u16;
        loop {
            let page = self.get_page(page_number)?;
            let is_overflow = {
                let p = page.borrow();
                p.is_deleted(row_number) && p.is_overflow(row_number)
            };
            if !is_overflow {
                return Ok((page, row_number));
            }
            let (next_row, next_page) = page.borrow().overflow_pointer(row_number);
            page_number = next_page;
            row_number = next_row as u16;
        }
    }

    /// Row update: rewrite in place when the new body is no larger
    /// than the old one; otherwise write the new body to another page and
    /// turn the original slot into an overflow pointer.
    pub fn update_row(
        &self,
        row_id: RowId,
        values: &mut [Value],
        evaluator: Option<&dyn ExpressionEvaluator>,
        ectx: &dyn ExpressionContext,
    ) -> JetResult<()> {
        if values.len() < self.columns.len() {
            values.resize(self.columns.len(), Value::Null);
        }
        let mut state = WriteRowState::default();
        self.apply_defaults_and_validate(values, evaluator, ectx)?;

        let long_snapshot = self.long_autonumber.current();
        let complex_snapshot = self.complex_autonumber.current();
        self.assign_autonumbers(values, &mut state)?;

        match self.finish_update_row(row_id, values, evaluator, ectx) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.long_autonumber.restore(long_snapshot + 1);
                self.complex_autonumber.restore(complex_snapshot + 1);
                Err(e)
            }
        }
    }

    fn finish_update_row(
        &self,
        row_id: RowId,
        values: &mut [Value],
        evaluator: Option<&dyn ExpressionEvaluator>,
        ectx: &dyn ExpressionContext,
    ) -> JetResult<()> {
        for idx in self.calculated_order()? {
            if let (Some(expr), Some(ev)) = (&self.columns[idx].calculated_expr, evaluator) {
                values[idx] = ev.evaluate(expr, ectx)?;
            }
        }

        let (page, row_number) = self.resolve_live_row(row_id)?;
        let old_body_len = page.borrow().row_bytes_raw(row_number).len();
        let old_values = self.decode_row(page.borrow().row_bytes_raw(row_number))?;

        if let Some(guard) = self.fk_guard() {
            guard.check_child_write(&self.name, values)?;
            guard.on_parent_update(&self.name, &old_values, values)?;
        }

        let new_body = self.encode_row(values)?;

        let old_entries = self.index_entries(&old_values, row_id);
        let new_entries = self.index_entries(values, row_id);
        let mut pending = Vec::with_capacity(new_entries.len());
        for ((_, old_key), (_, new_key)) in old_entries.iter().zip(new_entries.iter()) {
            pending.push(PendingChange::prepare_update_row(old_key.clone(), new_key.clone()));
        }
        {
            let mut indexes = self.indexes.borrow_mut();
            let commit_args: Vec<(&mut IndexCache, PendingChange)> = indexes
                .iter_mut()
                .zip(pending.into_iter())
                .map(|(ix, change)| (ix.cache.get_mut(), change))
                .collect();
            commit_all(commit_args)?;
        }

        if new_body.len() <= old_body_len {
            page.borrow_mut().overwrite_row(row_number, &new_body);
            self.dirty_pages.borrow_mut().push(page.borrow().page_number);
        } else {
            let new_page = self.find_or_allocate_page(new_body.len() + 2)?;
            let new_page_number = new_page.borrow().page_number;
            let new_row_number = new_page
                .borrow_mut()
                .insert_row(&new_body)
                .ok_or_else(|| JetError::invalid_value("updated row does not fit", Context::table(self.name.clone())))?;
            page.borrow_mut()
                .write_overflow_pointer(row_number, new_row_number as u8, new_page_number);
            self.dirty_pages.borrow_mut().push(page.borrow().page_number);
            self.dirty_pages.borrow_mut().push(new_page_number);
            debug!(table = %self.name, old_page = page.borrow().page_number, new_page = new_page_number, "row overflowed to new page");
        }
        self.mod_count.set(self.mod_count.get() + 1);
        Ok(())
    }

    /// Row deletion: mark the header slot deleted, remove all index
    /// entries, bump `mod_count`.
    pub fn delete_row(&self, row_id: RowId) -> JetResult<()> {
        let (page, row_number) = self.resolve_live_row(row_id)?;
        let values = self.decode_row(page.borrow().row_bytes_raw(row_number))?;

        if let Some(guard) = self.fk_guard() {
            guard.on_parent_delete(&self.name, &values)?;
        }

        let entries = self.index_entries(&values, row_id);
        let pending: Vec<PendingChange> = entries
            .iter()
            .map(|(_, key)| PendingChange::Remove { key: key.clone() })
            .collect();
        {
            let mut indexes = self.indexes.borrow_mut();
            let commit_args: Vec<(&mut IndexCache, PendingChange)> = indexes
                .iter_mut()
                .zip(pending.into_iter())
                .map(|(ix, change)| (ix.cache.get_mut(), change))
                .collect();
            commit_all(commit_args)?;
        }

        page.borrow_mut().mark_deleted(row_number);
        self.dirty_pages.borrow_mut().push(page.borrow().page_number);
        self.row_count.set(self.row_count.get().saturating_sub(1));
        self.mod_count.set(self.mod_count.get() + 1);
        warn!(table = %self.name, page = row_id.page_number, row = row_id.row_number, "row deleted");
        Ok(())
    }

    /// Flush every dirty data page and every dirty index page.
    pub fn save(&self) -> JetResult<()> {
        self.channel.borrow_mut().start_exclusive_write();
        let dirty: Vec<u32> = self.dirty_pages.borrow_mut().drain(..).collect();
        for page_number in dirty {
            // Clone the Rc (not a reference) so the borrow of `self.pages`
            // is released before a physical failure tries to roll it back.
            let page = self.pages.borrow().get(&page_number).cloned();
            if let Some(page) = page {
                let mut p = page.borrow_mut();
                if p.dirty {
                    self.channel.borrow_mut().write_page(page_number, &p.data).map_err(|e| {
                        let err = JetError::io(e, Context::table(self.name.clone()));
                        if err.is_physical() {
                            self.rollback();
                        }
                        err
                    })?;
                    p.dirty = false;
                }
            }
        }
        for ix in self.indexes.borrow().iter() {
            ix.cache.borrow_mut().save()?;
        }
        self.channel.borrow_mut().finish_write();
        Ok(())
    }

    /// Discard cached pages on a physical I/O failure, forcing a re-read
    /// from the channel on next access.
    pub fn rollback(&self) {
        self.pages.borrow_mut().clear();
        self.dirty_pages.borrow_mut().clear();
        for ix in self.indexes.borrow().iter() {
            ix.cache.borrow_mut().rollback();
        }
    }

    /// Register a backing index, grown and maintained alongside row writes
    /// from this point on (existing rows are not retroactively indexed).
    pub fn add_index(&self, index: TableIndex) {
        self.indexes.borrow_mut().push(index);
    }

    /// Find a backing index over exactly these columns, in this order.
    pub fn find_index_by_columns(&self, column_names: &[&str]) -> Option<usize> {
        let indexes = self.indexes.borrow();
        indexes.iter().position(|ix| {
            ix.columns.len() == column_names.len()
                && ix
                    .columns
                    .iter()
                    .zip(column_names.iter())
                    .all(|(&ci, name)| self.columns[ci].name == **name)
        })
    }

    pub fn index_is_unique(&self, idx: usize) -> bool {
        self.indexes.borrow()[idx].unique
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Decode the current values for a live row id, following overflow
    /// redirects. Used by the relationship engine's cascade operations.
    pub fn decode_row_by_id(&self, row_id: RowId) -> JetResult<Vec<Value>> {
        let (page, slot) = self.resolve_live_row(row_id)?;
        self.decode_row(page.borrow().row_bytes_raw(slot))
    }

    /// Update a row with already-final values and no expression evaluator,
    /// bypassing default-value and calculated-column processing (the
    /// validator chain still runs). Used by the relationship engine's
    /// cascade-update/cascade-null operations, which construct `values`
    /// directly from the parent's new key.
    pub fn update_row_raw(&self, row_id: RowId, values: Vec<Value>) -> JetResult<()> {
        struct NoContext;
        impl ExpressionContext for NoContext {
            fn column_value(&self, _name: &str) -> Option<Value> {
                None
            }
            fn row_values(&self) -> &[Value] {
                &[]
            }
        }
        let mut values = values;
        self.update_row(row_id, &mut values, None, &NoContext)
    }

    /// Every live row currently stored, resolving overflow redirects.
    /// Used by the relationship engine's orphan scan
    /// and otherwise only for small tables / diagnostics — there is no
    /// paged cursor over table storage itself, only over indexes.
    pub fn scan_rows(&self) -> JetResult<Vec<(RowId, Vec<Value>)>> {
        let mut out = Vec::new();
        for &page_number in self.owned_pages.borrow().iter() {
            let page = self.get_page(page_number)?;
            let row_count = page.borrow().row_count();
            for slot in 0..row_count {
                let (deleted, overflow) = {
                    let p = page.borrow();
                    (p.is_deleted(slot), p.is_overflow(slot))
                };
                if deleted && !overflow {
                    continue;
                }
                let row_id = RowId {
                    page_number,
                    row_number: slot as u8,
                };
                let (body_page, body_slot) = self.resolve_live_row(row_id)?;
                let values = self.decode_row(body_page.borrow().row_bytes_raw(body_slot))?;
                out.push((row_id, values));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;
    use std::collections::HashMap as StdHashMap;

    struct MemChannel {
        pages: StdRefCell<StdHashMap<u32, Vec<u8>>>,
        next: StdRefCell<u32>,
        page_size: usize,
    }

    impl MemChannel {
        fn new(page_size: usize) -> Self {
            MemChannel {
                pages: StdRefCell::new(StdHashMap::new()),
                next: StdRefCell::new(1),
                page_size,
            }
        }
    }

    impl PageChannel for MemChannel {
        fn page_size(&self) -> usize {
            self.page_size
        }
        fn read_page(&self, page_number: u32, buf: &mut [u8]) -> std::io::Result<()> {
            if let Some(p) = self.pages.borrow().get(&page_number) {
                buf.copy_from_slice(p);
            }
            Ok(())
        }
        fn write_page(&mut self, page_number: u32, buf: &[u8]) -> std::io::Result<()> {
            self.pages.borrow_mut().insert(page_number, buf.to_vec());
            Ok(())
        }
        fn allocate_new_page(&mut self) -> std::io::Result<u32> {
            let mut n = self.next.borrow_mut();
            let p = *n;
            *n += 1;
            Ok(p)
        }
    }

    struct NoopCtx;
    impl ExpressionContext for NoopCtx {
        fn column_value(&self, _name: &str) -> Option<Value> {
            None
        }
        fn row_values(&self) -> &[Value] {
            &[]
        }
    }

    fn simple_table() -> Table {
        let mut id_col = Column::new("Id", ColumnType::Long);
        id_col.is_autonumber = true;
        let name_col = Column::new("Name", ColumnType::Text { max_len: 255, compressed: false });
        Table::new(
            "Customers",
            vec![id_col, name_col],
            Config::default(),
            Box::new(MemChannel::new(4096)),
            0,
        )
    }

    #[test]
    fn add_row_assigns_autonumber_and_persists() {
        let table = simple_table();
        let mut rows = vec![vec![Value::Null, Value::Text("Ada".into())]];
        let ids = table.add_rows(&mut rows, None, &NoopCtx).unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(rows[0][0], Value::Long(1));
        assert_eq!(table.row_count(), 1);
    }

    #[test]
    fn update_row_rewrites_in_place_when_smaller() {
        let table = simple_table();
        let mut rows = vec![vec![Value::Null, Value::Text("Grace Hopper".into())]];
        let ids = table.add_rows(&mut rows, None, &NoopCtx).unwrap();
        let mut updated = vec![Value::Long(1), Value::Text("GH".into())];
        table.update_row(ids[0], &mut updated, None, &NoopCtx).unwrap();
        let (page, row_number) = table.resolve_live_row(ids[0]).unwrap();
        let values = table.decode_row(page.borrow().row_bytes_raw(row_number)).unwrap();
        assert_eq!(values[1], Value::Text("GH".into()));
    }

    #[test]
    fn delete_row_marks_deleted_and_decrements_count() {
        let table = simple_table();
        let mut rows = vec![vec![Value::Null, Value::Text("Ada".into())]];
        let ids = table.add_rows(&mut rows, None, &NoopCtx).unwrap();
        table.delete_row(ids[0]).unwrap();
        assert_eq!(table.row_count(), 0);
    }

    #[test]
    fn required_validator_rejects_null() {
        let mut name_col = Column::new("Name", ColumnType::Text { max_len: 255, compressed: false });
        name_col.validator = Validator::Required(Box::new(Validator::identity()));
        let mut id_col = Column::new("Id", ColumnType::Long);
        id_col.is_autonumber = true;
        let table = Table::new(
            "Customers",
            vec![id_col, name_col],
            Config::default(),
            Box::new(MemChannel::new(4096)),
            0,
        );
        let mut rows = vec![vec![Value::Null, Value::Null]];
        assert!(table.add_rows(&mut rows, None, &NoopCtx).is_err());
    }

    #[test]
    fn calculated_order_detects_cycle() {
        let mut a = Column::new("A", ColumnType::Long);
        a.is_calculated = true;
        a.calculated_expr = Some("B + 1".into());
        let mut b = Column::new("B", ColumnType::Long);
        b.is_calculated = true;
        b.calculated_expr = Some("A + 1".into());
        let table = Table::new("T", vec![a, b], Config::default(), Box::new(MemChannel::new(4096)), 0);
        assert!(table.calculated_order().is_err());
    }
}
