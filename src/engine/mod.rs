//! Storage engine facade.
//!
//! The one surface upper layers call. Owns the catalog, the transaction
//! manager, the optional WAL + recovery pair, the vacuum manager, and the
//! per-database table states (heap file, indexes, tuple-ID list). Routes
//! every read through MVCC visibility and every write through the WAL.
//!
//! Lock order is engine → database → table; a lock is dropped before disk
//! I/O wherever the operation allows it. Only one *explicit* transaction
//! may be open per engine; statements outside it run as implicit
//! auto-committed transactions.
//!
//! Write path: constraint hooks → tuple codec → heap write → WAL append +
//! sync → page LSN stamp → tuple-ID list → index maintenance. Explicit
//! transactions additionally keep an in-memory undo log so rollback can
//! physically revert heap changes (visibility alone cannot hide a loser
//! once its ID leaves the active set).

pub mod statement;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, Column, TableMeta};
use crate::common::{Row, TransactionId, TupleId, Value};
use crate::error::{DbError, Result};
use crate::index::{BPlusTree, IndexKey};
use crate::recovery::{RecoveryManager, RecoveryTarget};
use crate::storage::heap::HeapFile;
use crate::storage::tuple::{self, TupleHeader};
use crate::transaction::{Snapshot, Transaction, TransactionManager};
use crate::vacuum::{VacuumManager, VacuumStats};
use crate::wal::record::{DeletePayload, InsertPayload, UpdatePayload};
use crate::wal::{WalManager, WalRecordType};
use crate::Config;

pub use statement::{Assignment, ComparisonOp, Condition, Predicate, QueryResult, Statement};

/// One table's runtime state.
struct TableState {
    meta: RwLock<TableMeta>,
    heap: HeapFile,
    /// Unique indexes keyed by column name.
    indexes: RwLock<HashMap<String, BPlusTree>>,
    /// Known live tuple locations, maintained on insert and relocation.
    tuple_ids: Mutex<Vec<TupleId>>,
}

type TableRef = Arc<TableState>;

struct DatabaseState {
    tables: RwLock<HashMap<String, TableRef>>,
}

type DatabaseRef = Arc<DatabaseState>;

/// The explicit-transaction session state.
#[derive(Default)]
struct Session {
    txn: Option<Transaction>,
    undo_log: Vec<UndoEntry>,
}

/// Physical compensation for one write, applied in reverse on rollback.
enum UndoEntry {
    Insert {
        database: String,
        table: String,
        tid: TupleId,
    },
    UpdateInPlace {
        database: String,
        table: String,
        tid: TupleId,
        old: Vec<u8>,
    },
    Relocate {
        database: String,
        table: String,
        old_tid: TupleId,
        old: Vec<u8>,
        new_tid: TupleId,
    },
    Delete {
        database: String,
        table: String,
        tid: TupleId,
        old: Vec<u8>,
    },
}

/// The storage kernel's public facade.
pub struct StorageEngine {
    config: Config,
    catalog: Catalog,
    txn_mgr: TransactionManager,
    wal: Option<Arc<WalManager>>,
    recovery: Option<RecoveryManager>,
    vacuum: VacuumManager,
    databases: RwLock<HashMap<String, DatabaseRef>>,
    current_db: RwLock<Option<String>>,
    session: Mutex<Session>,
    closed: AtomicBool,
}

impl StorageEngine {
    /// Opens the engine: loads the catalog, opens every heap file it
    /// lists, runs WAL recovery, then loads or rebuilds the indexes.
    pub fn open(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let catalog = Catalog::open(&config.data_dir)?;
        let txn_mgr = TransactionManager::open(&config.data_dir)?;
        let wal = if config.enable_wal {
            Some(Arc::new(WalManager::open(
                config.data_dir.join("wal"),
                config.wal_segment_size,
            )?))
        } else {
            None
        };
        let recovery = wal.clone().map(RecoveryManager::new);

        let engine = Self {
            catalog,
            txn_mgr,
            wal,
            recovery,
            vacuum: VacuumManager::new(),
            databases: RwLock::new(HashMap::new()),
            current_db: RwLock::new(None),
            session: Mutex::new(Session::default()),
            closed: AtomicBool::new(false),
            config,
        };

        // Open heaps before recovery; indexes and tuple-ID lists are built
        // afterwards so they reflect the recovered heap contents.
        engine.load_tables()?;

        let mut replayed = false;
        if let Some(recovery) = &engine.recovery {
            let report = recovery.recover(&engine)?;
            engine.txn_mgr.bump_next_id(report.max_txn_id);
            replayed = report.redone + report.undone > 0;
        }

        engine.load_indexes(replayed)?;

        info!(data_dir = %engine.config.data_dir.display(), "storage engine open");
        Ok(engine)
    }

    // -----------------------------------------------------------------------
    // DDL
    // -----------------------------------------------------------------------

    /// Creates a database and selects it as current.
    pub fn create_database(&self, name: &str) -> Result<()> {
        self.check_open()?;
        self.catalog.create_database(name)?;
        std::fs::create_dir_all(self.config.data_dir.join(name))?;
        self.databases.write().insert(
            name.to_string(),
            Arc::new(DatabaseState {
                tables: RwLock::new(HashMap::new()),
            }),
        );
        *self.current_db.write() = Some(name.to_string());
        debug!(database = name, "created database");
        Ok(())
    }

    /// Drops a database and everything under it.
    pub fn drop_database(&self, name: &str) -> Result<()> {
        self.check_open()?;
        self.catalog.drop_database(name)?;
        self.databases.write().remove(name);
        {
            let mut current = self.current_db.write();
            if current.as_deref() == Some(name) {
                *current = None;
            }
        }
        let dir = self.config.data_dir.join(name);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Selects the current database.
    pub fn use_database(&self, name: &str) -> Result<()> {
        self.check_open()?;
        if !self.catalog.database_exists(name) {
            return Err(DbError::not_found("database", name));
        }
        *self.current_db.write() = Some(name.to_string());
        Ok(())
    }

    pub fn list_databases(&self) -> Vec<String> {
        self.catalog.list_databases()
    }

    pub fn list_tables(&self) -> Result<Vec<String>> {
        self.catalog.list_tables(&self.current_database()?)
    }

    /// Creates a table with its heap file and any PK/UNIQUE indexes.
    pub fn create_table(&self, name: &str, columns: Vec<Column>) -> Result<()> {
        self.check_open()?;
        let database = self.current_database()?;

        let heap_rel = format!("{}/{}.heap", database, name);
        let meta = TableMeta {
            name: name.to_string(),
            columns,
            heap_file: heap_rel.clone(),
            created_at: chrono::Utc::now(),
        };
        self.catalog.create_table(&database, meta.clone())?;

        let heap = HeapFile::open(
            self.config.data_dir.join(&heap_rel),
            self.config.buffer_pool_size,
        )?;
        let mut indexes = HashMap::new();
        for column in meta.columns.iter().filter(|c| c.is_indexed()) {
            indexes.insert(column.name.clone(), BPlusTree::new());
        }

        let table = Arc::new(TableState {
            meta: RwLock::new(meta),
            heap,
            indexes: RwLock::new(indexes),
            tuple_ids: Mutex::new(Vec::new()),
        });
        self.database_state(&database)?
            .tables
            .write()
            .insert(name.to_string(), table);
        debug!(database = %database, table = name, "created table");
        Ok(())
    }

    /// Drops a table, deleting its heap file and index files.
    pub fn drop_table(&self, name: &str) -> Result<()> {
        self.check_open()?;
        let database = self.current_database()?;
        let meta = self.catalog.drop_table(&database, name)?;

        let table = self
            .database_state(&database)?
            .tables
            .write()
            .remove(name);
        if let Some(table) = table {
            for column in meta.columns.iter().filter(|c| c.is_indexed()) {
                let path = self.index_path(&database, name, &column.name);
                if path.exists() {
                    std::fs::remove_file(&path)?;
                }
            }
            match Arc::try_unwrap(table) {
                Ok(state) => state.heap.delete()?,
                Err(_) => {
                    return Err(DbError::Internal(format!(
                        "table '{}' still referenced during drop",
                        name
                    )))
                }
            }
        }
        Ok(())
    }

    /// Appends a column to a table (the only supported ALTER).
    pub fn add_column(&self, table: &str, column: Column) -> Result<()> {
        self.check_open()?;
        let database = self.current_database()?;
        self.catalog.add_column(&database, table, column.clone())?;

        let table_ref = self.table(&database, table)?;
        table_ref.meta.write().columns.push(column.clone());
        if column.is_indexed() {
            table_ref
                .indexes
                .write()
                .insert(column.name.clone(), BPlusTree::new());
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // DML
    // -----------------------------------------------------------------------

    /// Inserts a row.
    pub fn insert_row(&self, table: &str, row: Row) -> Result<()> {
        self.check_open()?;
        let database = self.current_database()?;
        let table_ref = self.table(&database, table)?;

        let (columns, column_names) = {
            let meta = table_ref.meta.read();
            (meta.columns.clone(), meta.column_names())
        };

        // Constraint hooks run before anything touches disk.
        for column in &columns {
            let value = row.get(&column.name).unwrap_or(&Value::Null);
            if column.not_null && value.is_null() {
                return Err(DbError::ConstraintViolation(format!(
                    "column '{}' is NOT NULL",
                    column.name
                )));
            }
        }
        let snapshot = self.read_snapshot();
        self.check_unique(&table_ref, &row, &snapshot, None)?;

        let (txn_id, implicit) = self.write_txn()?;
        let mut undo = Vec::new();
        let result = (|| {
            let bytes = tuple::serialize(&row, &column_names, txn_id, 0)?;
            let tid = table_ref.heap.insert_tuple(&bytes)?;
            undo.push(UndoEntry::Insert {
                database: database.clone(),
                table: table.to_string(),
                tid,
            });

            if let Some(wal) = &self.wal {
                let payload = InsertPayload {
                    database: database.clone(),
                    table: table.to_string(),
                    tid,
                    tuple: bytes,
                };
                let lsn = wal.append_record(txn_id, WalRecordType::Insert, payload.encode())?;
                wal.sync()?;
                table_ref.heap.set_page_lsn(tid.page_id, lsn)?;
            }

            table_ref.tuple_ids.lock().push(tid);
            self.index_insert(&table_ref, &row, tid)?;
            Ok(())
        })();

        self.finish_write_txn(txn_id, implicit, result, undo)
    }

    /// Returns the rows visible to the caller that match the predicate,
    /// in heap order.
    pub fn select_rows(&self, table: &str, predicate: &Predicate) -> Result<Vec<Row>> {
        self.check_open()?;
        let database = self.current_database()?;
        let table_ref = self.table(&database, table)?;
        let snapshot = self.read_snapshot();

        let mut rows = Vec::new();
        table_ref.heap.scan(|_, bytes| {
            let header = TupleHeader::from_bytes(bytes)?;
            if !snapshot.is_visible(&header) {
                return Ok(());
            }
            let decoded = tuple::deserialize(bytes)?;
            if predicate.matches(&decoded.row) {
                rows.push(decoded.row);
            }
            Ok(())
        })?;
        Ok(rows)
    }

    /// Applies assignments to every visible matching row. Returns the
    /// number of rows updated.
    pub fn update_rows(
        &self,
        table: &str,
        assignments: &[Assignment],
        predicate: &Predicate,
    ) -> Result<usize> {
        self.check_open()?;
        let database = self.current_database()?;
        let table_ref = self.table(&database, table)?;
        let snapshot = self.read_snapshot();

        let columns = table_ref.meta.read().columns.clone();
        for assignment in assignments {
            let column = columns
                .iter()
                .find(|c| c.name == assignment.column)
                .ok_or_else(|| DbError::not_found("column", &assignment.column))?;
            if column.not_null && assignment.value.is_null() {
                return Err(DbError::ConstraintViolation(format!(
                    "column '{}' is NOT NULL",
                    column.name
                )));
            }
        }

        let targets = self.collect_matching(&table_ref, predicate, &snapshot)?;
        if targets.is_empty() {
            return Ok(0);
        }

        let (txn_id, implicit) = self.write_txn()?;
        let mut undo = Vec::new();
        let result = (|| {
            let column_names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
            let mut updated = 0;
            for (tid, old_bytes) in &targets {
                let old = tuple::deserialize(old_bytes)?;
                let mut row = old.row.clone();
                for assignment in assignments {
                    row.insert(assignment.column.clone(), assignment.value.clone());
                }

                // Re-check uniqueness when an indexed column changes value.
                self.check_unique(&table_ref, &row, &snapshot, Some(*tid))?;

                let new_bytes = tuple::serialize(
                    &row,
                    &column_names,
                    old.header.xmin,
                    old.header.xmax,
                )?;

                match table_ref.heap.update_tuple(*tid, &new_bytes) {
                    Ok(()) => {
                        undo.push(UndoEntry::UpdateInPlace {
                            database: database.clone(),
                            table: table.to_string(),
                            tid: *tid,
                            old: old_bytes.clone(),
                        });
                        self.log_update(
                            &database, table, &table_ref, *tid, old_bytes, &new_bytes, txn_id,
                        )?;
                        self.index_replace(&table_ref, &old.row, &row, *tid, *tid)?;
                    }
                    Err(DbError::TooLargeForInPlace { .. }) => {
                        // Relocate: kill the old slot, insert elsewhere.
                        table_ref.heap.delete_tuple(*tid)?;
                        let new_tid = table_ref.heap.insert_tuple(&new_bytes)?;
                        undo.push(UndoEntry::Relocate {
                            database: database.clone(),
                            table: table.to_string(),
                            old_tid: *tid,
                            old: old_bytes.clone(),
                            new_tid,
                        });
                        self.log_relocation(
                            &database, table, &table_ref, *tid, old_bytes, new_tid, &new_bytes,
                            txn_id,
                        )?;

                        let mut tids = table_ref.tuple_ids.lock();
                        if let Some(entry) = tids.iter_mut().find(|t| **t == *tid) {
                            *entry = new_tid;
                        }
                        drop(tids);

                        self.index_replace(&table_ref, &old.row, &row, *tid, new_tid)?;
                    }
                    Err(e) => return Err(e),
                }
                updated += 1;
            }
            Ok(updated)
        })();

        self.finish_write_txn(txn_id, implicit, result, undo)
    }

    /// MVCC-deletes every visible matching row by stamping its `xmax`.
    /// Returns the number of rows deleted.
    pub fn delete_rows(&self, table: &str, predicate: &Predicate) -> Result<usize> {
        self.check_open()?;
        let database = self.current_database()?;
        let table_ref = self.table(&database, table)?;
        let snapshot = self.read_snapshot();

        let targets = self.collect_matching(&table_ref, predicate, &snapshot)?;
        if targets.is_empty() {
            return Ok(0);
        }

        let (txn_id, implicit) = self.write_txn()?;
        let mut undo = Vec::new();
        let result = (|| {
            let mut deleted = 0;
            for (tid, old_bytes) in &targets {
                let mut new_bytes = old_bytes.clone();
                tuple::write_xmax(&mut new_bytes, txn_id)?;
                table_ref.heap.update_tuple(*tid, &new_bytes)?;
                undo.push(UndoEntry::Delete {
                    database: database.clone(),
                    table: table.to_string(),
                    tid: *tid,
                    old: old_bytes.clone(),
                });

                if let Some(wal) = &self.wal {
                    let payload = DeletePayload {
                        database: database.clone(),
                        table: table.to_string(),
                        tid: *tid,
                        tuple: old_bytes.clone(),
                    };
                    let lsn =
                        wal.append_record(txn_id, WalRecordType::Delete, payload.encode())?;
                    wal.sync()?;
                    table_ref.heap.set_page_lsn(tid.page_id, lsn)?;
                }
                deleted += 1;
            }
            Ok(deleted)
        })();

        self.finish_write_txn(txn_id, implicit, result, undo)
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Starts an explicit transaction. Only one may be open per engine.
    pub fn begin(&self) -> Result<TransactionId> {
        self.check_open()?;
        let mut session = self.session.lock();
        if let Some(txn) = &session.txn {
            return Err(DbError::TransactionInProgress(txn.id));
        }
        let txn = self.txn_mgr.begin();
        let id = txn.id;
        session.txn = Some(txn);
        session.undo_log.clear();
        debug!(txn = id, "transaction started");
        Ok(id)
    }

    /// Commits the explicit transaction: WAL Commit + sync, then the
    /// transaction leaves the active set.
    pub fn commit(&self) -> Result<()> {
        self.check_open()?;
        let mut session = self.session.lock();
        let txn = session.txn.take().ok_or(DbError::NoTransaction)?;
        session.undo_log.clear();
        drop(session);

        if let Some(wal) = &self.wal {
            wal.append_record(txn.id, WalRecordType::Commit, Vec::new())?;
            wal.sync()?;
        }
        self.txn_mgr.commit(txn.id)?;
        debug!(txn = txn.id, "transaction committed");
        Ok(())
    }

    /// Rolls back the explicit transaction, physically reverting its heap
    /// changes and rebuilding the indexes of every table it touched.
    pub fn rollback(&self) -> Result<()> {
        self.check_open()?;
        let mut session = self.session.lock();
        let txn = session.txn.take().ok_or(DbError::NoTransaction)?;
        let undo_log = std::mem::take(&mut session.undo_log);
        drop(session);

        self.apply_undo_log(undo_log)?;

        if let Some(wal) = &self.wal {
            wal.append_record(txn.id, WalRecordType::Abort, Vec::new())?;
            wal.sync()?;
        }
        self.txn_mgr.abort(txn.id)?;
        debug!(txn = txn.id, "transaction rolled back");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Vacuum and checkpoints
    // -----------------------------------------------------------------------

    /// Vacuums one table.
    pub fn vacuum_table(&self, table: &str) -> Result<VacuumStats> {
        self.check_open()?;
        let database = self.current_database()?;
        let table_ref = self.table(&database, table)?;

        let stats = self
            .vacuum
            .vacuum_heap(&table_ref.heap, self.txn_mgr.horizon())?;
        if stats.tuples_removed > 0 {
            self.rebuild_table_state(&table_ref)?;
        }
        Ok(stats)
    }

    /// Vacuums every table of the current database.
    pub fn vacuum_database(&self) -> Result<VacuumStats> {
        self.check_open()?;
        let mut stats = VacuumStats::default();
        for table in self.list_tables()? {
            stats.merge(&self.vacuum_table(&table)?);
        }
        Ok(stats)
    }

    /// Buffer pool hit/miss counters for one table's heap.
    pub fn buffer_stats(&self, table: &str) -> Result<crate::buffer::BufferPoolStats> {
        self.check_open()?;
        let database = self.current_database()?;
        Ok(self.table(&database, table)?.heap.pool_stats())
    }

    /// Flushes all heaps and writes a checkpoint record, establishing the
    /// redo start for the next recovery.
    pub fn checkpoint(&self) -> Result<()> {
        self.check_open()?;
        let Some(recovery) = &self.recovery else {
            return Ok(());
        };

        let mut dirty_pages = Vec::new();
        self.for_each_table(|table| {
            dirty_pages.extend(table.heap.dirty_page_ids());
            table.heap.flush()
        })?;
        recovery.create_checkpoint(self.txn_mgr.active_ids(), dirty_pages)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Statement dispatch
    // -----------------------------------------------------------------------

    /// Executes one structured statement.
    pub fn execute(&self, statement: Statement) -> Result<QueryResult> {
        match statement {
            Statement::CreateDatabase { name } => {
                self.create_database(&name)?;
                Ok(QueryResult::Ok)
            }
            Statement::DropDatabase { name } => {
                self.drop_database(&name)?;
                Ok(QueryResult::Ok)
            }
            Statement::UseDatabase { name } => {
                self.use_database(&name)?;
                Ok(QueryResult::Ok)
            }
            Statement::CreateTable { name, columns } => {
                self.create_table(&name, columns)?;
                Ok(QueryResult::Ok)
            }
            Statement::DropTable { name } => {
                self.drop_table(&name)?;
                Ok(QueryResult::Ok)
            }
            Statement::AlterTableAddColumn { table, column } => {
                self.add_column(&table, column)?;
                Ok(QueryResult::Ok)
            }
            Statement::Insert { table, row } => {
                self.insert_row(&table, row)?;
                Ok(QueryResult::Affected(1))
            }
            Statement::Select { table, predicate } => {
                Ok(QueryResult::Rows(self.select_rows(&table, &predicate)?))
            }
            Statement::Update {
                table,
                assignments,
                predicate,
            } => Ok(QueryResult::Affected(
                self.update_rows(&table, &assignments, &predicate)?,
            )),
            Statement::Delete { table, predicate } => {
                Ok(QueryResult::Affected(self.delete_rows(&table, &predicate)?))
            }
            Statement::Begin => {
                self.begin()?;
                Ok(QueryResult::Ok)
            }
            Statement::Commit => {
                self.commit()?;
                Ok(QueryResult::Ok)
            }
            Statement::Rollback => {
                self.rollback()?;
                Ok(QueryResult::Ok)
            }
            Statement::Vacuum { table } => {
                let stats = match table {
                    Some(table) => self.vacuum_table(&table)?,
                    None => self.vacuum_database()?,
                };
                Ok(QueryResult::Vacuum(stats))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Persists indexes, the catalog and the transaction counter, flushes
    /// heaps and syncs the WAL. The engine is unusable afterwards.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let databases: Vec<String> = self.catalog.list_databases();
        for database in &databases {
            for table_name in self.catalog.list_tables(database)? {
                let table = self.table(database, &table_name)?;
                table.heap.close()?;

                let meta = table.meta.read();
                let indexes = table.indexes.read();
                for column in meta.columns.iter().filter(|c| c.is_indexed()) {
                    if let Some(tree) = indexes.get(&column.name) {
                        tree.save(self.index_path(database, &table_name, &column.name))?;
                    }
                }
            }
        }

        self.catalog.save()?;
        self.txn_mgr.persist()?;
        if let Some(wal) = &self.wal {
            wal.sync()?;
        }
        info!("storage engine closed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::Closed);
        }
        Ok(())
    }

    fn current_database(&self) -> Result<String> {
        self.current_db
            .read()
            .clone()
            .ok_or_else(|| DbError::not_found("database", "(none selected)"))
    }

    fn database_state(&self, name: &str) -> Result<DatabaseRef> {
        self.databases
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::not_found("database", name))
    }

    fn table(&self, database: &str, table: &str) -> Result<TableRef> {
        self.database_state(database)?
            .tables
            .read()
            .get(table)
            .cloned()
            .ok_or_else(|| DbError::not_found("table", table))
    }

    /// Looks a table up without erroring; recovery wants a yes/no.
    fn table_opt(&self, database: &str, table: &str) -> Option<TableRef> {
        self.databases
            .read()
            .get(database)?
            .tables
            .read()
            .get(table)
            .cloned()
    }

    fn for_each_table(&self, mut f: impl FnMut(&TableState) -> Result<()>) -> Result<()> {
        let databases: Vec<DatabaseRef> = self.databases.read().values().cloned().collect();
        for db in databases {
            let tables: Vec<TableRef> = db.tables.read().values().cloned().collect();
            for table in tables {
                f(&table)?;
            }
        }
        Ok(())
    }

    fn index_path(&self, database: &str, table: &str, column: &str) -> PathBuf {
        self.config
            .data_dir
            .join(database)
            .join("indexes")
            .join(format!("{}_{}.idx", table, column))
    }

    /// The snapshot reads run under: the explicit transaction's if one is
    /// open, otherwise an ad-hoc snapshot of the current state.
    fn read_snapshot(&self) -> Snapshot {
        let session = self.session.lock();
        match &session.txn {
            Some(txn) => txn.snapshot.clone(),
            None => self.txn_mgr.current_snapshot(),
        }
    }

    /// The transaction a write runs under: the explicit one, or a fresh
    /// implicit transaction that `finish_write_txn` settles.
    fn write_txn(&self) -> Result<(TransactionId, bool)> {
        let session = self.session.lock();
        match &session.txn {
            Some(txn) => Ok((txn.id, false)),
            None => {
                drop(session);
                Ok((self.txn_mgr.begin().id, true))
            }
        }
    }

    /// Settles a write operation's transaction bookkeeping.
    ///
    /// On success, an implicit transaction commits (WAL Commit + sync) and
    /// an explicit one absorbs the undo entries into the session log. On
    /// error, the operation's own heap changes are reverted so the table
    /// is back in its pre-operation state, and an implicit transaction is
    /// aborted.
    fn finish_write_txn<T>(
        &self,
        txn_id: TransactionId,
        implicit: bool,
        result: Result<T>,
        undo: Vec<UndoEntry>,
    ) -> Result<T> {
        match result {
            Ok(value) => {
                if implicit {
                    if let Some(wal) = &self.wal {
                        wal.append_record(txn_id, WalRecordType::Commit, Vec::new())?;
                        wal.sync()?;
                    }
                    self.txn_mgr.commit(txn_id)?;
                } else {
                    self.session.lock().undo_log.extend(undo);
                }
                Ok(value)
            }
            Err(e) => {
                if let Err(undo_err) = self.apply_undo_log(undo) {
                    warn!(error = %undo_err, "failed to revert partial write");
                }
                if implicit {
                    if let Some(wal) = &self.wal {
                        wal.append_record(txn_id, WalRecordType::Abort, Vec::new())?;
                        wal.sync()?;
                    }
                    self.txn_mgr.abort(txn_id)?;
                }
                Err(e)
            }
        }
    }

    /// Collects `(tid, bytes)` of visible rows matching the predicate.
    fn collect_matching(
        &self,
        table: &TableState,
        predicate: &Predicate,
        snapshot: &Snapshot,
    ) -> Result<Vec<(TupleId, Vec<u8>)>> {
        let mut matches = Vec::new();
        table.heap.scan(|tid, bytes| {
            let header = TupleHeader::from_bytes(bytes)?;
            if !snapshot.is_visible(&header) {
                return Ok(());
            }
            let decoded = tuple::deserialize(bytes)?;
            if predicate.matches(&decoded.row) {
                matches.push((tid, bytes.to_vec()));
            }
            Ok(())
        })?;
        Ok(matches)
    }

    /// Probes every unique index for a conflicting *visible* row.
    /// `exclude` skips the row being updated.
    fn check_unique(
        &self,
        table: &TableState,
        row: &Row,
        snapshot: &Snapshot,
        exclude: Option<TupleId>,
    ) -> Result<()> {
        let indexes = table.indexes.read();
        for (column, tree) in indexes.iter() {
            let Some(value) = row.get(column) else {
                continue;
            };
            let Some(key) = IndexKey::from_value(value) else {
                continue;
            };
            let Some(tid) = tree.search(&key) else {
                continue;
            };
            if exclude == Some(tid) {
                continue;
            }
            // The entry may point at a vacuum-pending or aborted tuple;
            // only a visible conflict is a violation.
            match table.heap.get_tuple(tid) {
                Ok(bytes) => {
                    let header = TupleHeader::from_bytes(&bytes)?;
                    if snapshot.is_visible(&header) {
                        return Err(DbError::ConstraintViolation(format!(
                            "duplicate value {} for unique column '{}'",
                            value, column
                        )));
                    }
                }
                Err(DbError::SlotDead { .. }) | Err(DbError::InvalidSlot { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Adds a row's keys to every index it has values for.
    fn index_insert(&self, table: &TableState, row: &Row, tid: TupleId) -> Result<()> {
        let indexes = table.indexes.read();
        for (column, tree) in indexes.iter() {
            if let Some(key) = row.get(column).and_then(IndexKey::from_value) {
                self.index_upsert(table, tree, key, tid)?;
            }
        }
        Ok(())
    }

    /// Inserts a key, displacing a stale entry left behind by MVCC (a
    /// committed delete or a reclaimed slot keeps its index entry until
    /// someone reuses the key). A key owned by a live tuple still refuses
    /// the duplicate.
    fn index_upsert(
        &self,
        table: &TableState,
        tree: &BPlusTree,
        key: IndexKey,
        tid: TupleId,
    ) -> Result<()> {
        match tree.insert(key.clone(), tid) {
            Err(DbError::DuplicateKey(_)) => match tree.search(&key) {
                Some(existing) if existing == tid => Ok(()),
                Some(existing) if self.index_entry_is_stale(table, existing)? => {
                    tree.delete(&key);
                    tree.insert(key, tid)
                }
                _ => Err(DbError::DuplicateKey(key.to_string())),
            },
            other => other,
        }
    }

    /// True when an index entry's tuple can never be seen by a future
    /// snapshot: its slot was reclaimed, its deleter committed, or its
    /// deleter is the session's own transaction (whose rollback rebuilds
    /// the index anyway).
    fn index_entry_is_stale(&self, table: &TableState, tid: TupleId) -> Result<bool> {
        match table.heap.get_tuple(tid) {
            Ok(bytes) => {
                let header = TupleHeader::from_bytes(&bytes)?;
                if header.xmax == 0 {
                    return Ok(false);
                }
                let own_txn = self.session.lock().txn.as_ref().map(|t| t.id);
                Ok(own_txn == Some(header.xmax) || !self.txn_mgr.is_active(header.xmax))
            }
            Err(DbError::SlotDead { .. }) | Err(DbError::InvalidSlot { .. }) => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// Moves index entries from an old row image to a new one.
    fn index_replace(
        &self,
        table: &TableState,
        old_row: &Row,
        new_row: &Row,
        old_tid: TupleId,
        new_tid: TupleId,
    ) -> Result<()> {
        let indexes = table.indexes.read();
        for (column, tree) in indexes.iter() {
            let old_key = old_row.get(column).and_then(IndexKey::from_value);
            let new_key = new_row.get(column).and_then(IndexKey::from_value);
            let key_changed = old_key != new_key;

            if let Some(key) = &old_key {
                if key_changed || old_tid != new_tid {
                    tree.delete(key);
                }
            }
            if let Some(key) = new_key {
                if key_changed || old_tid != new_tid {
                    self.index_upsert(table, tree, key, new_tid)?;
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn log_update(
        &self,
        database: &str,
        table_name: &str,
        table: &TableState,
        tid: TupleId,
        old: &[u8],
        new: &[u8],
        txn_id: TransactionId,
    ) -> Result<()> {
        let Some(wal) = &self.wal else {
            return Ok(());
        };
        let payload = UpdatePayload {
            database: database.to_string(),
            table: table_name.to_string(),
            tid,
            old: old.to_vec(),
            new: new.to_vec(),
        };
        let lsn = wal.append_record(txn_id, WalRecordType::Update, payload.encode())?;
        wal.sync()?;
        table.heap.set_page_lsn(tid.page_id, lsn)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn log_relocation(
        &self,
        database: &str,
        table_name: &str,
        table: &TableState,
        old_tid: TupleId,
        old: &[u8],
        new_tid: TupleId,
        new: &[u8],
        txn_id: TransactionId,
    ) -> Result<()> {
        let Some(wal) = &self.wal else {
            return Ok(());
        };
        let delete = DeletePayload {
            database: database.to_string(),
            table: table_name.to_string(),
            tid: old_tid,
            tuple: old.to_vec(),
        };
        let lsn = wal.append_record(txn_id, WalRecordType::Delete, delete.encode())?;
        table.heap.set_page_lsn(old_tid.page_id, lsn)?;

        let insert = InsertPayload {
            database: database.to_string(),
            table: table_name.to_string(),
            tid: new_tid,
            tuple: new.to_vec(),
        };
        let lsn = wal.append_record(txn_id, WalRecordType::Insert, insert.encode())?;
        wal.sync()?;
        table.heap.set_page_lsn(new_tid.page_id, lsn)?;
        Ok(())
    }

    /// Applies an explicit transaction's undo log in reverse, then rebuilds
    /// the indexes and tuple-ID lists of every touched table.
    fn apply_undo_log(&self, undo_log: Vec<UndoEntry>) -> Result<()> {
        let mut touched: HashSet<(String, String)> = HashSet::new();

        for entry in undo_log.iter().rev() {
            match entry {
                UndoEntry::Insert {
                    database,
                    table,
                    tid,
                } => {
                    let table_ref = self.table(database, table)?;
                    table_ref.heap.delete_tuple(*tid)?;
                    touched.insert((database.clone(), table.clone()));
                }
                UndoEntry::UpdateInPlace {
                    database,
                    table,
                    tid,
                    old,
                } => {
                    let table_ref = self.table(database, table)?;
                    table_ref.heap.force_tuple(*tid, old)?;
                    touched.insert((database.clone(), table.clone()));
                }
                UndoEntry::Relocate {
                    database,
                    table,
                    old_tid,
                    old,
                    new_tid,
                } => {
                    let table_ref = self.table(database, table)?;
                    table_ref.heap.delete_tuple(*new_tid)?;
                    table_ref.heap.force_tuple(*old_tid, old)?;
                    touched.insert((database.clone(), table.clone()));
                }
                UndoEntry::Delete {
                    database,
                    table,
                    tid,
                    old,
                } => {
                    let table_ref = self.table(database, table)?;
                    table_ref.heap.force_tuple(*tid, old)?;
                    touched.insert((database.clone(), table.clone()));
                }
            }
        }

        for (database, table) in touched {
            let table_ref = self.table(&database, &table)?;
            self.rebuild_table_state(&table_ref)?;
        }
        Ok(())
    }

    /// Rebuilds a table's tuple-ID list and indexes from a heap scan.
    fn rebuild_table_state(&self, table: &TableState) -> Result<()> {
        let indexed_columns: Vec<String> = {
            let meta = table.meta.read();
            meta.columns
                .iter()
                .filter(|c| c.is_indexed())
                .map(|c| c.name.clone())
                .collect()
        };

        let mut tids = Vec::new();
        let mut fresh: HashMap<String, BPlusTree> = indexed_columns
            .iter()
            .map(|c| (c.clone(), BPlusTree::new()))
            .collect();

        table.heap.scan(|tid, bytes| {
            tids.push(tid);
            let decoded = tuple::deserialize(bytes)?;
            for column in &indexed_columns {
                if let Some(key) = decoded.row.get(column).and_then(IndexKey::from_value) {
                    let tree = fresh.get_mut(column).expect("index exists");
                    if let Err(DbError::DuplicateKey(_)) = tree.insert(key.clone(), tid) {
                        // Two versions of one logical row (the older one
                        // vacuum-pending); the undeleted version keeps
                        // the entry.
                        if decoded.header.xmax == 0 {
                            tree.delete(&key);
                            tree.insert(key, tid)?;
                        }
                    }
                }
            }
            Ok(())
        })?;

        *table.tuple_ids.lock() = tids;
        *table.indexes.write() = fresh;
        Ok(())
    }

    /// Opens every heap file the catalog lists.
    fn load_tables(&self) -> Result<()> {
        let mut databases = self.databases.write();
        for database in self.catalog.list_databases() {
            let mut tables = HashMap::new();
            for table_name in self.catalog.list_tables(&database)? {
                let meta = self.catalog.get_table(&database, &table_name)?;
                let heap = HeapFile::open(
                    self.config.data_dir.join(&meta.heap_file),
                    self.config.buffer_pool_size,
                )?;
                tables.insert(
                    table_name,
                    Arc::new(TableState {
                        meta: RwLock::new(meta),
                        heap,
                        indexes: RwLock::new(HashMap::new()),
                        tuple_ids: Mutex::new(Vec::new()),
                    }),
                );
            }
            databases.insert(
                database.clone(),
                Arc::new(DatabaseState {
                    tables: RwLock::new(tables),
                }),
            );
        }
        Ok(())
    }

    /// Loads on-disk indexes, or rebuilds them from the heap when missing,
    /// unreadable, or stale because recovery replayed work.
    fn load_indexes(&self, force_rebuild: bool) -> Result<()> {
        for database in self.catalog.list_databases() {
            for table_name in self.catalog.list_tables(&database)? {
                let table = self.table(&database, &table_name)?;

                let mut loaded = HashMap::new();
                let mut rebuild = force_rebuild;
                if !rebuild {
                    let meta = table.meta.read();
                    for column in meta.columns.iter().filter(|c| c.is_indexed()) {
                        let path = self.index_path(&database, &table_name, &column.name);
                        match BPlusTree::load(&path) {
                            Ok(tree) => {
                                loaded.insert(column.name.clone(), tree);
                            }
                            Err(e) => {
                                warn!(
                                    path = %path.display(),
                                    error = %e,
                                    "index unreadable, rebuilding from heap"
                                );
                                rebuild = true;
                                break;
                            }
                        }
                    }
                }

                if rebuild {
                    self.rebuild_table_state(&table)?;
                } else {
                    *table.indexes.write() = loaded;
                    let mut tids = Vec::new();
                    table.heap.scan(|tid, _| {
                        tids.push(tid);
                        Ok(())
                    })?;
                    *table.tuple_ids.lock() = tids;
                }
            }
        }
        Ok(())
    }
}

impl RecoveryTarget for StorageEngine {
    fn redo_insert(&self, payload: &InsertPayload, lsn: u64) -> Result<bool> {
        let Some(table) = self.table_opt(&payload.database, &payload.table) else {
            return Ok(false);
        };
        table.heap.ensure_page_exists(payload.tid.page_id)?;
        if table.heap.page_lsn(payload.tid.page_id)? >= lsn {
            return Ok(true);
        }
        table.heap.force_tuple(payload.tid, &payload.tuple)?;
        table.heap.set_page_lsn(payload.tid.page_id, lsn)?;
        Ok(true)
    }

    fn redo_update(&self, payload: &UpdatePayload, lsn: u64) -> Result<bool> {
        let Some(table) = self.table_opt(&payload.database, &payload.table) else {
            return Ok(false);
        };
        table.heap.ensure_page_exists(payload.tid.page_id)?;
        if table.heap.page_lsn(payload.tid.page_id)? >= lsn {
            return Ok(true);
        }
        table.heap.force_tuple(payload.tid, &payload.new)?;
        table.heap.set_page_lsn(payload.tid.page_id, lsn)?;
        Ok(true)
    }

    fn redo_delete(&self, payload: &DeletePayload, lsn: u64) -> Result<bool> {
        let Some(table) = self.table_opt(&payload.database, &payload.table) else {
            return Ok(false);
        };
        table.heap.ensure_page_exists(payload.tid.page_id)?;
        if table.heap.page_lsn(payload.tid.page_id)? >= lsn {
            return Ok(true);
        }
        match table.heap.delete_tuple(payload.tid) {
            Ok(()) | Err(DbError::SlotDead { .. }) | Err(DbError::InvalidSlot { .. }) => {}
            Err(e) => return Err(e),
        }
        table.heap.set_page_lsn(payload.tid.page_id, lsn)?;
        Ok(true)
    }

    fn undo_insert(&self, payload: &InsertPayload) -> Result<bool> {
        let Some(table) = self.table_opt(&payload.database, &payload.table) else {
            return Ok(false);
        };
        match table.heap.delete_tuple(payload.tid) {
            Ok(()) | Err(DbError::SlotDead { .. }) | Err(DbError::InvalidSlot { .. }) => Ok(true),
            Err(e) => Err(e),
        }
    }

    fn undo_update(&self, payload: &UpdatePayload) -> Result<bool> {
        let Some(table) = self.table_opt(&payload.database, &payload.table) else {
            return Ok(false);
        };
        table.heap.force_tuple(payload.tid, &payload.old)?;
        Ok(true)
    }

    fn undo_delete(&self, payload: &DeletePayload) -> Result<bool> {
        let Some(table) = self.table_opt(&payload.database, &payload.table) else {
            return Ok(false);
        };
        table.heap.force_tuple(payload.tid, &payload.tuple)?;
        Ok(true)
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            if let Err(e) = self.close() {
                warn!(error = %e, "error closing storage engine on drop");
            }
        }
    }
}
