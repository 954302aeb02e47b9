//! Per-table executor drivers: insert, select, update and delete on top of
//! the row tree and the primary-key index.
//!
//! All drivers run against the connection's transactional pager, so a
//! statement that fails mid-flight rolls back without a trace. Reads pull
//! rows through [`Rows`], which follows either the leaf chain (sequential
//! scan) or a list of row-ids resolved through the primary-key index
//! (point lookups), post-filtering either way.

use super::btree::BTree;
use super::column::Value;
use super::cursor::Cursor;
use super::index::IndexTree;
use super::page::{IndexKey, LeafCell};
use super::row::{self, Row};
use super::schema::{PrimaryKey, TableDefinition};
use super::txn::TxPager;
use crate::cancel::CancellationToken;
use crate::config::EngineConfig;
use crate::errors::Error;
use crate::statement::{Filter, Projection};
use std::collections::VecDeque;
use tracing::{debug, trace};

/// A table bound to a transaction: the definition plus derived sizes.
#[derive(Debug)]
pub struct Table<'a> {
    txn: &'a mut TxPager,
    def: TableDefinition,
    config: EngineConfig,
    row_size: usize,
}

/// How a statement visits candidate rows.
#[derive(Debug)]
enum Plan {
    /// Follow the leaf chain from the first row.
    Scan(Cursor),
    /// Fetch exactly these row-ids, resolved through the primary-key index.
    Lookups(VecDeque<u64>),
}

impl<'a> Table<'a> {
    pub fn new(txn: &'a mut TxPager, def: TableDefinition, config: &EngineConfig) -> Self {
        let row_size = def.row_size(config.max_inline_varchar);
        Table {
            txn,
            def,
            config: config.clone(),
            row_size,
        }
    }

    pub fn definition(&self) -> &TableDefinition {
        &self.def
    }

    pub fn row_size(&self) -> usize {
        self.row_size
    }

    fn tree(&mut self) -> BTree<'_> {
        BTree::new(
            self.txn,
            self.def.root_page,
            self.row_size,
            self.config.page_size,
            self.config.root_page_config_size,
        )
    }

    fn index(&mut self) -> Option<IndexTree<'_>> {
        let pk = self.def.primary_key.as_ref()?;
        if pk.index_root == 0 {
            return None;
        }
        Some(IndexTree::new(
            self.txn,
            pk.index_root,
            pk.key_kind,
            self.config.page_size,
        ))
    }

    fn primary_key(&self) -> Option<PrimaryKey> {
        self.def.primary_key.clone()
    }

    /// The primary-key value of a row as an index key.
    fn pk_key(&self, pk: &PrimaryKey, row: &Row) -> Result<IndexKey, Error> {
        let value = row.values[pk.column].as_ref().ok_or_else(|| {
            err!(
                NullInNonNullable,
                "primary key column '{}' is NULL",
                self.def.columns[pk.column].name
            )
        })?;
        IndexKey::from_value(value, pk.key_kind)
    }

    /// Inserts value tuples. Absent columns become NULL placeholders, or
    /// the next autoincrement value for the primary key. Returns the number
    /// of rows inserted.
    pub fn insert(
        &mut self,
        fields: &[String],
        tuples: &[Vec<Option<Value>>],
        cancel: &CancellationToken,
    ) -> Result<u64, Error> {
        let mut positions = Vec::with_capacity(fields.len());
        for field in fields {
            let idx = self
                .def
                .column_index(field)
                .ok_or_else(|| err!(FieldUnknown, "no column named '{}'", field))?;
            positions.push(idx);
        }

        let mut inserted = 0u64;
        for tuple in tuples {
            cancel.check()?;
            if tuple.len() != fields.len() {
                return Err(err!(
                    UnrecognizedStatement,
                    "tuple has {} values for {} fields",
                    tuple.len(),
                    fields.len()
                ));
            }
            let mut values: Vec<Option<Value>> = vec![None; self.def.columns.len()];
            for (value, idx) in tuple.iter().zip(&positions) {
                values[*idx] = value.clone();
            }

            if let Some(pk) = self.primary_key() {
                if values[pk.column].is_none() && pk.autoincrement {
                    values[pk.column] = Some(self.next_autoincrement(&pk)?);
                }
            }

            let mut new_row = Row::new(0, values);
            row::validate_row(&self.def.columns, &new_row, &self.config)?;

            let (_, row_id) = self.tree().seek_next_row_id()?;
            new_row.id = row_id;

            if let Some(pk) = self.primary_key() {
                let key = self.pk_key(&pk, &new_row)?;
                if let Some(mut index) = self.index() {
                    index.insert(key, row_id)?;
                }
            }

            let (null_mask, payload) =
                row::encode_row(self.txn, &self.def.columns, &new_row, &self.config)?;
            self.tree().insert(row_id, null_mask, payload)?;
            debug!(table = %self.def.name, row_id, "Inserted row");
            inserted += 1;
        }
        Ok(inserted)
    }

    /// Next primary-key value for an autoincrementing column: one past the
    /// highest key currently present.
    fn next_autoincrement(&mut self, pk: &PrimaryKey) -> Result<Value, Error> {
        let last = match self.index() {
            Some(mut index) => index.seek_last_key()?,
            None => None,
        };
        match last {
            None => match pk.key_kind {
                super::page::IndexKeyKind::I32 => Ok(Value::Int4(1)),
                super::page::IndexKeyKind::I64 => Ok(Value::Int8(1)),
                other => Err(err!(
                    UnrecognizedStatement,
                    "autoincrement is not supported for {:?} keys",
                    other
                )),
            },
            Some(IndexKey::I32(n)) => Ok(Value::Int4(n + 1)),
            Some(IndexKey::I64(n)) => Ok(Value::Int8(n + 1)),
            Some(other) => Err(err!(
                UnrecognizedStatement,
                "autoincrement is not supported for {:?} keys",
                other
            )),
        }
    }

    /// Picks the access path for a filter: point lookups when every OR
    /// branch pins the primary key with an equality, a sequential scan
    /// otherwise.
    fn plan(&mut self, filter: &Filter) -> Result<Plan, Error> {
        if let Some(pk) = self.primary_key() {
            let pk_name = self.def.columns[pk.column].name.clone();
            if let Some(literals) = filter.equality_literals(&pk_name) {
                if let Some(mut index) = self.index() {
                    let mut row_ids = VecDeque::with_capacity(literals.len());
                    for literal in &literals {
                        let key = IndexKey::from_value(literal, pk.key_kind)?;
                        if let Some(row_id) = index.seek(&key)? {
                            row_ids.push_back(row_id);
                        }
                    }
                    trace!(
                        table = %self.def.name,
                        lookups = row_ids.len(),
                        "Planned point lookups"
                    );
                    return Ok(Plan::Lookups(row_ids));
                }
            }
        }
        trace!(table = %self.def.name, "Planned sequential scan");
        Ok(Plan::Scan(self.tree().seek_first()?))
    }

    /// Next candidate cell under a plan; `None` when exhausted.
    fn next_candidate(&mut self, plan: &mut Plan) -> Result<Option<LeafCell>, Error> {
        match plan {
            Plan::Scan(cursor) => {
                let mut cursor_copy = *cursor;
                let cell = self.tree().fetch_cell(&mut cursor_copy)?;
                *cursor = cursor_copy;
                Ok(cell)
            }
            Plan::Lookups(row_ids) => match row_ids.pop_front() {
                None => Ok(None),
                Some(row_id) => self.tree().get(row_id),
            },
        }
    }

    /// Materializes every row matching `filter`, with its raw cell. Used
    /// by update and delete so mutation never races its own scan.
    fn collect_matches(
        &mut self,
        filter: &Filter,
        cancel: &CancellationToken,
    ) -> Result<Vec<(LeafCell, Row)>, Error> {
        let mut plan = self.plan(filter)?;
        let mut matches = Vec::new();
        while let Some(cell) = {
            cancel.check()?;
            self.next_candidate(&mut plan)?
        } {
            let row = row::decode_row(
                self.txn,
                &self.def.columns,
                cell.key,
                cell.null_mask,
                &cell.payload,
                &self.config,
            )?;
            if filter.matches(&self.def.columns, &row)? {
                matches.push((cell, row));
            }
        }
        Ok(matches)
    }

    /// Opens a pull iterator over the rows matching a select.
    pub fn select(
        mut self,
        projection: Projection,
        filter: Filter,
        limit: Option<usize>,
        offset: Option<usize>,
        cancel: CancellationToken,
    ) -> Result<Rows<'a>, Error> {
        let projected = match &projection {
            Projection::All => (0..self.def.columns.len()).collect(),
            Projection::Columns(names) => {
                let mut indices = Vec::with_capacity(names.len());
                for name in names {
                    let idx = self
                        .def
                        .column_index(name)
                        .ok_or_else(|| err!(FieldUnknown, "no column named '{}'", name))?;
                    indices.push(idx);
                }
                indices
            }
        };
        let plan = self.plan(&filter)?;
        Ok(Rows {
            table: self,
            plan,
            filter,
            projected,
            limit,
            offset: offset.unwrap_or(0),
            emitted: 0,
            cancel,
            done: false,
        })
    }

    /// Applies assignments to matching rows. Rows whose values do not
    /// actually change are skipped. Returns the number of rows updated.
    pub fn update(
        &mut self,
        assignments: &[(String, Option<Value>)],
        filter: &Filter,
        cancel: &CancellationToken,
    ) -> Result<u64, Error> {
        let mut resolved = Vec::with_capacity(assignments.len());
        for (field, value) in assignments {
            let idx = self
                .def
                .column_index(field)
                .ok_or_else(|| err!(FieldUnknown, "no column named '{}'", field))?;
            resolved.push((idx, value.clone()));
        }

        let matches = self.collect_matches(filter, cancel)?;
        let mut updated = 0u64;
        for (cell, old_row) in matches {
            cancel.check()?;
            let mut new_row = old_row.clone();
            for (idx, value) in &resolved {
                new_row.values[*idx] = value.clone();
            }
            if new_row.values == old_row.values {
                trace!(table = %self.def.name, row_id = old_row.id, "Row not changed");
                continue;
            }
            row::validate_row(&self.def.columns, &new_row, &self.config)?;

            if let Some(pk) = self.primary_key() {
                let old_key = self.pk_key(&pk, &old_row)?;
                let new_key = self.pk_key(&pk, &new_row)?;
                if old_key != new_key {
                    if let Some(mut index) = self.index() {
                        index.insert(new_key, new_row.id)?;
                        index.delete(&old_key)?;
                    }
                }
            }

            // Overwrite is free-then-reallocate: drop the old overflow
            // chains before encoding the replacement image.
            row::free_row_overflow(
                self.txn,
                &self.def.columns,
                cell.null_mask,
                &cell.payload,
                &self.config,
            )?;
            let (null_mask, payload) =
                row::encode_row(self.txn, &self.def.columns, &new_row, &self.config)?;
            if payload.len() <= self.row_size {
                self.tree().update_in_place(new_row.id, null_mask, payload)?;
            } else {
                // The replacement no longer fits the slot: reinsert under
                // the same row-id, which may split the leaf.
                self.tree().delete(new_row.id)?;
                self.tree().insert(new_row.id, null_mask, payload)?;
            }
            debug!(table = %self.def.name, row_id = new_row.id, "Updated row");
            updated += 1;
        }
        Ok(updated)
    }

    /// Deletes matching rows: index entry first, then the leaf cell, with
    /// any overflow chains returned to the free list.
    pub fn delete(&mut self, filter: &Filter, cancel: &CancellationToken) -> Result<u64, Error> {
        let matches = self.collect_matches(filter, cancel)?;
        let mut deleted = 0u64;
        for (cell, old_row) in matches {
            cancel.check()?;
            if let Some(pk) = self.primary_key() {
                let key = self.pk_key(&pk, &old_row)?;
                if let Some(mut index) = self.index() {
                    index.delete(&key)?;
                }
            }
            row::free_row_overflow(
                self.txn,
                &self.def.columns,
                cell.null_mask,
                &cell.payload,
                &self.config,
            )?;
            self.tree().delete(old_row.id)?;
            debug!(table = %self.def.name, row_id = old_row.id, "Deleted row");
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Every page belonging to this table: the row tree, overflow chains
    /// hanging off its cells, and the primary-key index. Used by DROP.
    pub fn all_pages(&mut self) -> Result<Vec<u32>, Error> {
        let mut pages = self.tree().pages()?;

        // Overflow chains referenced by text pointers in the leaves.
        let mut chains = Vec::new();
        {
            let mut cursor = self.tree().seek_first()?;
            while let Some(cell) = self.tree().fetch_cell(&mut cursor)? {
                chains.push(cell);
            }
        }
        for cell in chains {
            let mut heads = Vec::new();
            row::overflow_heads(
                &self.def.columns,
                cell.null_mask,
                &cell.payload,
                &self.config,
                &mut heads,
            )?;
            for head in heads {
                let mut idx = head;
                while idx != 0 {
                    pages.push(idx);
                    idx = self.txn.get_overflow(idx)?.next_page;
                }
            }
        }

        if let Some(mut index) = self.index() {
            let mut index_pages = index.pages()?;
            pages.append(&mut index_pages);
        }
        Ok(pages)
    }
}

/// Pull iterator over a select's result set. Iteration ends with
/// [`Error::NoMoreRows`]; cancellation surfaces as [`Error::Cancelled`] on
/// the next call.
#[derive(Debug)]
pub struct Rows<'a> {
    table: Table<'a>,
    plan: Plan,
    filter: Filter,
    projected: Vec<usize>,
    limit: Option<usize>,
    offset: usize,
    emitted: usize,
    cancel: CancellationToken,
    done: bool,
}

impl<'a> Rows<'a> {
    /// Names of the projected columns, in output order.
    pub fn columns(&self) -> Vec<String> {
        self.projected
            .iter()
            .map(|i| self.table.def.columns[*i].name.clone())
            .collect()
    }

    /// The next matching row, projected.
    pub fn next_row(&mut self) -> Result<Row, Error> {
        loop {
            if self.done {
                return Err(Error::NoMoreRows);
            }
            self.cancel.check()?;
            if let Some(limit) = self.limit {
                if self.emitted >= limit {
                    self.done = true;
                    return Err(Error::NoMoreRows);
                }
            }
            let cell = match self.table.next_candidate(&mut self.plan)? {
                None => {
                    self.done = true;
                    return Err(Error::NoMoreRows);
                }
                Some(cell) => cell,
            };
            let row = row::decode_row(
                self.table.txn,
                &self.table.def.columns,
                cell.key,
                cell.null_mask,
                &cell.payload,
                &self.table.config,
            )?;
            if !self.filter.matches(&self.table.def.columns, &row)? {
                continue;
            }
            if self.offset > 0 {
                self.offset -= 1;
                continue;
            }
            self.emitted += 1;
            let values = self
                .projected
                .iter()
                .map(|i| row.values[*i].clone())
                .collect();
            return Ok(Row::new(row.id, values));
        }
    }

    /// Drains the iterator into a vector, for callers that want it all.
    pub fn collect_rows(mut self) -> Result<Vec<Row>, Error> {
        let mut out = Vec::new();
        loop {
            match self.next_row() {
                Ok(row) => out.push(row),
                Err(Error::NoMoreRows) => return Ok(out),
                Err(e) => return Err(e),
            }
        }
    }
}
