//! Database handle, catalog and statement dispatch.
//!
//! A [`Database`] owns one page file and the in-memory catalog built from
//! the schema table at page 0. Each network connection (or test) gets its
//! own [`Connection`] with a private transactional overlay; statements run
//! inside an explicit transaction when one is open, otherwise each is
//! wrapped in an implicit transaction that commits on success.
//!
//! DDL serializes behind `db_lock`; DML takes the target table's lock in
//! read mode and relies on the tree's own consistency within the
//! transaction, while DROP TABLE takes it in write mode.

use crate::cancel::CancellationToken;
use crate::config::EngineConfig;
use crate::errors::Error;
use crate::statement::{Condition, CreateTable, Delete, DropTable, Filter, Insert, Select,
    Statement, Update};
use crate::storage::column::Value;
use crate::storage::page::{IndexNode, LeafNode, Page};
use crate::storage::pager::Pager;
use crate::storage::row::Row;
use crate::storage::schema::{self, TableDefinition, SCHEMA_TABLE_NAME, SCHEMA_TYPE_INDEX,
    SCHEMA_TYPE_TABLE};
use crate::storage::table::{Rows, Table};
use crate::storage::txn::TxPager;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{info, warn};

/// Outcome of one statement.
#[derive(Debug)]
pub enum ExecResult<'a> {
    /// A select's pull iterator; ends with [`Error::NoMoreRows`].
    Rows(Rows<'a>),
    /// Rows touched by an insert, update or delete.
    RowsAffected(u64),
    /// DDL and transaction control.
    Done,
}

struct Shared {
    config: EngineConfig,
    path: PathBuf,
    pager: Arc<Mutex<Pager>>,
    /// Serializes CREATE TABLE / DROP TABLE.
    db_lock: Mutex<()>,
    catalog: RwLock<HashMap<String, TableDefinition>>,
    table_locks: RwLock<HashMap<String, Arc<RwLock<()>>>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Ok(mut pager) = self.pager.lock() {
            if let Err(e) = pager.flush_all() {
                warn!(path = %self.path.display(), "Failed to flush on drop: {}", e);
            }
        }
    }
}

/// Handle to one database file. Cheap to clone; all clones share the pager
/// and catalog.
#[derive(Clone)]
pub struct Database {
    shared: Arc<Shared>,
}

impl Database {
    /// Opens a database file, bootstrapping the schema table on an empty
    /// file and loading the catalog from it otherwise.
    pub fn open(path: impl AsRef<Path>, config: EngineConfig) -> Result<Database, Error> {
        let path = path.as_ref().to_path_buf();
        let pager = Pager::open(&path, &config)?;
        let bootstrap_needed = pager.total_pages() == 0;

        let db = Database {
            shared: Arc::new(Shared {
                config,
                path: path.clone(),
                pager: Arc::new(Mutex::new(pager)),
                db_lock: Mutex::new(()),
                catalog: RwLock::new(HashMap::new()),
                table_locks: RwLock::new(HashMap::new()),
            }),
        };
        if bootstrap_needed {
            db.bootstrap()?;
        } else {
            db.load_catalog()?;
        }
        info!(path = %path.display(), "Opened database");
        Ok(db)
    }

    /// Opens a fresh connection with its own transaction state.
    pub fn connection(&self) -> Connection {
        Connection {
            db: self.clone(),
            txn: TxPager::new(self.shared.pager.clone()),
        }
    }

    /// Flushes every dirty page to the file. Durability is best-effort:
    /// this is also called when the last handle drops.
    pub fn flush(&self) -> Result<(), Error> {
        self.shared
            .pager
            .lock()
            .map_err(|_| err!(CorruptPage, "base pager mutex poisoned"))?
            .flush_all()
    }

    /// Flushes and releases this handle.
    pub fn close(self) -> Result<(), Error> {
        self.flush()
    }

    /// Names of the user tables in the catalog, sorted.
    pub fn list_tables(&self) -> Result<Vec<String>, Error> {
        let catalog = self
            .shared
            .catalog
            .read()
            .map_err(|_| err!(CorruptPage, "catalog lock poisoned"))?;
        let mut names: Vec<String> = catalog
            .keys()
            .filter(|n| n.as_str() != SCHEMA_TABLE_NAME)
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    fn table_def(&self, name: &str) -> Result<TableDefinition, Error> {
        let catalog = self
            .shared
            .catalog
            .read()
            .map_err(|_| err!(CorruptPage, "catalog lock poisoned"))?;
        catalog
            .get(name)
            .cloned()
            .ok_or_else(|| err!(TableDoesNotExist, "no table named '{}'", name))
    }

    fn table_lock(&self, name: &str) -> Result<Arc<RwLock<()>>, Error> {
        let mut locks = self
            .shared
            .table_locks
            .write()
            .map_err(|_| err!(CorruptPage, "table lock map poisoned"))?;
        Ok(locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone())
    }

    fn install_table(&self, def: TableDefinition) -> Result<(), Error> {
        let name = def.name.clone();
        self.shared
            .catalog
            .write()
            .map_err(|_| err!(CorruptPage, "catalog lock poisoned"))?
            .insert(name.clone(), def);
        self.table_lock(&name)?;
        Ok(())
    }

    fn remove_table(&self, name: &str) -> Result<(), Error> {
        self.shared
            .catalog
            .write()
            .map_err(|_| err!(CorruptPage, "catalog lock poisoned"))?
            .remove(name);
        self.shared
            .table_locks
            .write()
            .map_err(|_| err!(CorruptPage, "table lock map poisoned"))?
            .remove(name);
        Ok(())
    }

    /// Creates the schema table on an empty file: page 0 becomes its root
    /// leaf and the first row describes the schema table itself.
    fn bootstrap(&self) -> Result<(), Error> {
        let def = schema::schema_table_definition();
        let mut txn = TxPager::new(self.shared.pager.clone());
        txn.begin(false)?;

        let root = txn.get_free_page()?;
        if root != 0 {
            return Err(err!(CorruptPage, "bootstrap allocated page {} first", root));
        }
        txn.write_page(0, Page::Leaf(LeafNode::empty(true, 0)))?;

        let mut table = Table::new(&mut txn, def.clone(), &self.shared.config);
        table.insert(
            &schema_fields(),
            &[vec![
                Some(Value::Int4(SCHEMA_TYPE_TABLE)),
                Some(Value::Text(SCHEMA_TABLE_NAME.to_string())),
                Some(Value::Int4(0)),
                Some(Value::Text(def.ddl())),
            ]],
            &CancellationToken::new(),
        )?;
        txn.commit()?;

        self.install_table(def)?;
        info!("Bootstrapped schema table");
        Ok(())
    }

    /// Rebuilds the catalog from the schema table of an existing file.
    fn load_catalog(&self) -> Result<(), Error> {
        let schema_def = schema::schema_table_definition();
        let mut txn = TxPager::new(self.shared.pager.clone());
        let rows = Table::new(&mut txn, schema_def.clone(), &self.shared.config)
            .select(
                crate::statement::Projection::All,
                Filter::default(),
                None,
                None,
                CancellationToken::new(),
            )?
            .collect_rows()?;
        self.install_table(schema_def)?;

        let mut index_rows = Vec::new();
        for row in &rows {
            let kind = schema_row_i32(row, 0)?;
            let name = schema_row_text(row, 1)?;
            if kind == SCHEMA_TYPE_TABLE {
                if name == SCHEMA_TABLE_NAME {
                    continue;
                }
                let root = schema_row_i32(row, 2)? as u32;
                let sql = schema_row_text(row, 3)?;
                let (parsed_name, columns) = schema::parse_ddl(&sql)?;
                if parsed_name != name {
                    return Err(err!(
                        CorruptPage,
                        "schema row '{}' stores DDL for '{}'",
                        name,
                        parsed_name
                    ));
                }
                let def = TableDefinition::new(&name, columns, root)?;
                self.install_table(def)?;
            } else if kind == SCHEMA_TYPE_INDEX {
                index_rows.push(row.clone());
            } else {
                return Err(err!(CorruptPage, "schema row '{}' has type {}", name, kind));
            }
        }

        for row in index_rows {
            let root = schema_row_i32(&row, 2)? as u32;
            let sql = schema_row_text(&row, 3)?;
            let (_, table, _) = schema::parse_index_ddl(&sql)?;
            let mut catalog = self
                .shared
                .catalog
                .write()
                .map_err(|_| err!(CorruptPage, "catalog lock poisoned"))?;
            let def = catalog.get_mut(&table).ok_or_else(|| {
                err!(CorruptPage, "index row references unknown table '{}'", table)
            })?;
            let pk = def.primary_key.as_mut().ok_or_else(|| {
                err!(CorruptPage, "index row for table '{}' without a primary key", table)
            })?;
            pk.index_root = root;
        }

        info!(tables = self.list_tables()?.len(), "Loaded catalog");
        Ok(())
    }
}

fn schema_fields() -> Vec<String> {
    vec![
        "type".to_string(),
        "name".to_string(),
        "root_page".to_string(),
        "sql".to_string(),
    ]
}

fn schema_row_i32(row: &Row, idx: usize) -> Result<i32, Error> {
    match &row.values[idx] {
        Some(Value::Int4(v)) => Ok(*v),
        other => Err(err!(CorruptPage, "schema row field {} is {:?}", idx, other)),
    }
}

fn schema_row_text(row: &Row, idx: usize) -> Result<String, Error> {
    match &row.values[idx] {
        Some(Value::Text(v)) => Ok(v.clone()),
        other => Err(err!(CorruptPage, "schema row field {} is {:?}", idx, other)),
    }
}

/// One client's session: statement execution plus its transaction overlay.
pub struct Connection {
    db: Database,
    txn: TxPager,
}

impl Connection {
    /// Whether an explicit transaction is open on this connection.
    pub fn in_transaction(&self) -> bool {
        self.txn.in_transaction() && self.txn.is_explicit()
    }

    pub fn execute(&mut self, statement: Statement) -> Result<ExecResult<'_>, Error> {
        self.execute_with_cancel(statement, CancellationToken::new())
    }

    /// Runs one statement. Failures roll the active transaction back, as
    /// do explicit ROLLBACK statements; everything else commits either at
    /// COMMIT or, for autocommitted statements, immediately.
    pub fn execute_with_cancel(
        &mut self,
        statement: Statement,
        cancel: CancellationToken,
    ) -> Result<ExecResult<'_>, Error> {
        match statement {
            Statement::BeginTransaction => {
                self.txn.begin(true)?;
                Ok(ExecResult::Done)
            }
            Statement::CommitTransaction => {
                self.txn.commit()?;
                Ok(ExecResult::Done)
            }
            Statement::RollbackTransaction => {
                self.txn.rollback()?;
                Ok(ExecResult::Done)
            }
            Statement::Select(select) => self.execute_select(select, cancel),
            other => self.execute_write(other, cancel),
        }
    }

    /// Selects need no write wrapping: without a transaction the reads go
    /// straight to the base pager, inside one they see the overlay.
    fn execute_select(
        &mut self,
        select: Select,
        cancel: CancellationToken,
    ) -> Result<ExecResult<'_>, Error> {
        let def = self.db.table_def(&select.table)?;
        let lock = self.db.table_lock(&select.table)?;
        let _guard = lock
            .read()
            .map_err(|_| err!(CorruptPage, "table lock poisoned"))?;
        let config = self.db.shared.config.clone();
        let rows = Table::new(&mut self.txn, def, &config).select(
            select.projection,
            select.filter,
            select.limit,
            select.offset,
            cancel,
        )?;
        Ok(ExecResult::Rows(rows))
    }

    fn execute_write(
        &mut self,
        statement: Statement,
        cancel: CancellationToken,
    ) -> Result<ExecResult<'_>, Error> {
        let implicit = !self.txn.in_transaction();
        if implicit {
            self.txn.begin(false)?;
        }
        let result = self.dispatch_write(statement, &cancel);
        match result {
            Ok(outcome) => {
                if implicit {
                    self.txn.commit()?;
                }
                Ok(outcome)
            }
            Err(e) => {
                // Validation and structural failures abort the whole
                // transaction, explicit or not.
                self.txn.rollback_if_active();
                Err(e)
            }
        }
    }

    fn dispatch_write(
        &mut self,
        statement: Statement,
        cancel: &CancellationToken,
    ) -> Result<ExecResult<'static>, Error> {
        match statement {
            Statement::CreateTable(stmt) => {
                self.create_table(stmt, cancel)?;
                Ok(ExecResult::Done)
            }
            Statement::DropTable(stmt) => {
                self.drop_table(stmt, cancel)?;
                Ok(ExecResult::Done)
            }
            Statement::Insert(stmt) => self.insert(stmt, cancel).map(ExecResult::RowsAffected),
            Statement::Update(stmt) => self.update(stmt, cancel).map(ExecResult::RowsAffected),
            Statement::Delete(stmt) => self.delete(stmt, cancel).map(ExecResult::RowsAffected),
            Statement::Select(_)
            | Statement::BeginTransaction
            | Statement::CommitTransaction
            | Statement::RollbackTransaction => Err(err!(
                UnrecognizedStatement,
                "statement dispatched through the wrong path"
            )),
        }
    }

    fn guard_system_table(&self, name: &str) -> Result<(), Error> {
        if name == SCHEMA_TABLE_NAME {
            return Err(err!(
                SystemTableProtected,
                "'{}' cannot be modified directly",
                name
            ));
        }
        Ok(())
    }

    fn insert(&mut self, stmt: Insert, cancel: &CancellationToken) -> Result<u64, Error> {
        self.guard_system_table(&stmt.table)?;
        let def = self.db.table_def(&stmt.table)?;
        let lock = self.db.table_lock(&stmt.table)?;
        let _guard = lock
            .read()
            .map_err(|_| err!(CorruptPage, "table lock poisoned"))?;
        let config = self.db.shared.config.clone();
        Table::new(&mut self.txn, def, &config).insert(&stmt.fields, &stmt.rows, cancel)
    }

    fn update(&mut self, stmt: Update, cancel: &CancellationToken) -> Result<u64, Error> {
        self.guard_system_table(&stmt.table)?;
        let def = self.db.table_def(&stmt.table)?;
        let lock = self.db.table_lock(&stmt.table)?;
        let _guard = lock
            .read()
            .map_err(|_| err!(CorruptPage, "table lock poisoned"))?;
        let config = self.db.shared.config.clone();
        let assignments: Vec<(String, Option<Value>)> =
            stmt.assignments.into_iter().collect();
        Table::new(&mut self.txn, def, &config).update(&assignments, &stmt.filter, cancel)
    }

    fn delete(&mut self, stmt: Delete, cancel: &CancellationToken) -> Result<u64, Error> {
        self.guard_system_table(&stmt.table)?;
        let def = self.db.table_def(&stmt.table)?;
        let lock = self.db.table_lock(&stmt.table)?;
        let _guard = lock
            .read()
            .map_err(|_| err!(CorruptPage, "table lock poisoned"))?;
        let config = self.db.shared.config.clone();
        Table::new(&mut self.txn, def, &config).delete(&stmt.filter, cancel)
    }

    fn create_table(&mut self, stmt: CreateTable, cancel: &CancellationToken) -> Result<(), Error> {
        self.guard_system_table(&stmt.table)?;
        let shared = self.db.shared.clone();
        let _ddl_guard = shared
            .db_lock
            .lock()
            .map_err(|_| err!(CorruptPage, "db lock poisoned"))?;

        if self.db.table_def(&stmt.table).is_ok() {
            return Err(err!(TableAlreadyExists, "table '{}' exists", stmt.table));
        }
        validate_columns(&stmt, &shared.config)?;

        // The definition is built with a placeholder root so the schema row
        // can be written first, NULL-rooted, the way the file format wants.
        let mut def = TableDefinition::new(&stmt.table, stmt.columns.clone(), 0)?;
        let config = shared.config.clone();
        let schema_def = self.db.table_def(SCHEMA_TABLE_NAME)?;
        let schema_lock = self.db.table_lock(SCHEMA_TABLE_NAME)?;
        let _schema_guard = schema_lock
            .read()
            .map_err(|_| err!(CorruptPage, "table lock poisoned"))?;

        Table::new(&mut self.txn, schema_def.clone(), &config).insert(
            &schema_fields(),
            &[vec![
                Some(Value::Int4(SCHEMA_TYPE_TABLE)),
                Some(Value::Text(stmt.table.clone())),
                None,
                Some(Value::Text(def.ddl())),
            ]],
            cancel,
        )?;

        // Allocating the root may itself split the schema table's tree.
        let root = self.txn.get_free_page()?;
        self.txn.write_page(root, Page::Leaf(LeafNode::empty(true, 0)))?;
        def.root_page = root;

        let patch: Vec<(String, Option<Value>)> =
            vec![("root_page".to_string(), Some(Value::Int4(root as i32)))];
        Table::new(&mut self.txn, schema_def.clone(), &config).update(
            &patch,
            &schema_object_filter(SCHEMA_TYPE_TABLE, &stmt.table),
            cancel,
        )?;

        if let Some(pk) = &mut def.primary_key {
            let index_root = self.txn.get_free_page()?;
            self.txn.write_page(
                index_root,
                Page::Index(IndexNode::empty_leaf(pk.key_kind, true, 0)),
            )?;
            pk.index_root = index_root;
            let index_ddl = def.index_ddl()?;
            Table::new(&mut self.txn, schema_def, &config).insert(
                &schema_fields(),
                &[vec![
                    Some(Value::Int4(SCHEMA_TYPE_INDEX)),
                    Some(Value::Text(def.index_name())),
                    Some(Value::Int4(index_root as i32)),
                    Some(Value::Text(index_ddl)),
                ]],
                cancel,
            )?;
        }

        info!(table = %def.name, root = def.root_page, "Created table");
        self.db.install_table(def)
    }

    fn drop_table(&mut self, stmt: DropTable, cancel: &CancellationToken) -> Result<(), Error> {
        self.guard_system_table(&stmt.table)?;
        let shared = self.db.shared.clone();
        let _ddl_guard = shared
            .db_lock
            .lock()
            .map_err(|_| err!(CorruptPage, "db lock poisoned"))?;

        let def = self.db.table_def(&stmt.table)?;
        let lock = self.db.table_lock(&stmt.table)?;
        let _write_guard = lock
            .write()
            .map_err(|_| err!(CorruptPage, "table lock poisoned"))?;
        let config = shared.config.clone();

        // Drop the catalog rows (the table row and, when present, its
        // index row) in one statement.
        let schema_def = self.db.table_def(SCHEMA_TABLE_NAME)?;
        let schema_lock = self.db.table_lock(SCHEMA_TABLE_NAME)?;
        let _schema_guard = schema_lock
            .read()
            .map_err(|_| err!(CorruptPage, "table lock poisoned"))?;
        let filter = Filter {
            disjunction: vec![
                vec![Condition::eq("name", Value::Text(stmt.table.clone()))],
                vec![Condition::eq("name", Value::Text(def.index_name()))],
            ],
        };
        Table::new(&mut self.txn, schema_def, &config).delete(&filter, cancel)?;

        // Free every page reachable from the table: tree nodes, overflow
        // chains and the index.
        let pages = Table::new(&mut self.txn, def, &config).all_pages()?;
        let freed = pages.len();
        for page in pages {
            self.txn.add_free_page(page)?;
        }

        self.db.remove_table(&stmt.table)?;
        info!(table = %stmt.table, freed, "Dropped table");
        Ok(())
    }
}

fn schema_object_filter(kind: i32, name: &str) -> Filter {
    Filter::and(vec![
        Condition::eq("type", Value::Int4(kind)),
        Condition::eq("name", Value::Text(name.to_string())),
    ])
}

fn validate_columns(stmt: &CreateTable, config: &EngineConfig) -> Result<(), Error> {
    if stmt.columns.is_empty() {
        return Err(err!(
            UnrecognizedStatement,
            "table '{}' declares no columns",
            stmt.table
        ));
    }
    // The NULL bitmask is a u64, so 64 columns is the hard ceiling.
    let limit = config.max_columns.min(64);
    if stmt.columns.len() > limit {
        return Err(err!(
            ColumnCountTooLarge,
            "table '{}' declares {} columns, limit is {}",
            stmt.table,
            stmt.columns.len(),
            limit
        ));
    }
    for (i, column) in stmt.columns.iter().enumerate() {
        if stmt.columns[..i].iter().any(|c| c.name == column.name) {
            return Err(err!(
                UnrecognizedStatement,
                "duplicate column '{}'",
                column.name
            ));
        }
        if column.autoincrement {
            if !column.primary_key {
                return Err(err!(
                    UnrecognizedStatement,
                    "autoincrement column '{}' is not the primary key",
                    column.name
                ));
            }
            if !matches!(
                column.kind,
                crate::storage::column::ColumnKind::Int4
                    | crate::storage::column::ColumnKind::Int8
            ) {
                return Err(err!(
                    UnrecognizedStatement,
                    "autoincrement column '{}' must be an integer",
                    column.name
                ));
            }
        }
    }
    let row_size = crate::storage::row::row_size(&stmt.columns, config.max_inline_varchar);
    let available = config.page_size - crate::storage::page::NODE_HEADER_SIZE;
    if crate::storage::page::LEAF_CELL_OVERHEAD + row_size > available {
        return Err(err!(
            RowTooLarge,
            "rows of {} bytes do not fit a {}-byte page",
            row_size,
            config.page_size
        ));
    }
    Ok(())
}
