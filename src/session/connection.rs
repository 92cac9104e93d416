//! Sessions and the database handle they hang off.
//!
//! A [`Database`] owns the lazily created connection pool and the shared
//! configuration; a [`Session`] is one logical caller. Statements route to a
//! native connection in three tiers: the connection pinned by an active
//! transaction, then the session's callback-bearing connection, then a
//! one-shot lease from the pool.
//!
//! Lock discipline: the transaction-state lock and the connection-slot locks
//! are never held across an engine call or the init hook. State is read (or
//! reserved) under a short lock, the lock is released, and the engine work
//! happens on a connection taken out of its slot.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex as SyncMutex;
use rusqlite::Params;
use rusqlite::types::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backup::{self, BackupOptions, BackupProgress};
use crate::callbacks::{
    AuthorizerFn, CallbackTable, ProgressFn, ProgressRegistration, ScalarFn, TraceFn, bridge,
};
use crate::config::PoolOptions;
use crate::dump;
use crate::pool::{ManagedConnection, Pool, PoolStats, PooledConnection};
use crate::session::state::TransactionState;
use crate::{Error, Result};

/// Columns and materialized rows of one query.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl FetchResult {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

/// One-time schema/setup hook, run on the first session operation against
/// the database rather than at open time. The hook gets its own [`Database`]
/// handle; sessions it creates skip re-initialization.
pub type InitHook = Box<dyn Fn(Database) -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum InitState {
    NotRun,
    Running,
    Done,
}

struct DatabaseInner {
    path: String,
    options: SyncMutex<PoolOptions>,
    pool: SyncMutex<Option<Arc<Pool>>>,
    init_hook: Option<InitHook>,
    init_state: SyncMutex<InitState>,
    include_query_in_errors: AtomicBool,
}

/// Handle to one SQLite database file (or `:memory:`). Cheap to clone; all
/// clones share the pool and configuration.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

pub struct DatabaseBuilder {
    path: String,
    options: PoolOptions,
    init_hook: Option<InitHook>,
    include_query_in_errors: bool,
}

/// Statements that alter the schema invalidate compiled metadata: a cached
/// `SELECT *` keeps reporting the pre-change column list until it is dropped.
/// The routed execute paths flush the statement cache after these run. A
/// false positive only costs a re-prepare.
fn is_schema_change(sql: &str) -> bool {
    sql.split(';').any(|stmt| {
        matches!(
            stmt.split_whitespace()
                .next()
                .map(str::to_ascii_uppercase)
                .as_deref(),
            Some("CREATE" | "ALTER" | "DROP")
        )
    })
}

fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(Error::InvalidPath("path is empty".to_string()));
    }
    if path.contains('\0') {
        return Err(Error::InvalidPath(
            "path contains an interior NUL byte".to_string(),
        ));
    }
    Ok(())
}

impl DatabaseBuilder {
    pub fn pool_size(mut self, max_size: usize) -> Self {
        self.options.max_size = max_size.max(1);
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.options.acquire_timeout = timeout;
        self
    }

    /// SQLite busy timeout in seconds, applied to every connection.
    pub fn busy_timeout(mut self, seconds: f64) -> Self {
        self.options.busy_timeout = seconds;
        self
    }

    /// Add a PRAGMA applied when each connection is opened. Order of calls
    /// is preserved.
    pub fn pragma(mut self, key: &str, value: &str) -> Self {
        self.options
            .pragmas
            .push((key.to_string(), value.to_string()));
        self
    }

    pub fn statement_cache_capacity(mut self, capacity: usize) -> Self {
        self.options.statement_cache_capacity = capacity;
        self
    }

    /// Whether engine errors carry the offending query text. On by default;
    /// turn off when query text may contain sensitive literals.
    pub fn include_query_in_errors(mut self, include: bool) -> Self {
        self.include_query_in_errors = include;
        self
    }

    /// Run `hook` once, lazily, before the first statement touches the
    /// database. Typically used for schema creation.
    pub fn init_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(Database) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        self.init_hook = Some(Box::new(hook));
        self
    }

    pub fn build(self) -> Result<Database> {
        validate_path(&self.path)?;
        Ok(Database {
            inner: Arc::new(DatabaseInner {
                path: self.path,
                options: SyncMutex::new(self.options),
                pool: SyncMutex::new(None),
                init_hook: self.init_hook,
                init_state: SyncMutex::new(InitState::NotRun),
                include_query_in_errors: AtomicBool::new(self.include_query_in_errors),
            }),
        })
    }
}

impl Database {
    pub fn builder(path: impl Into<String>) -> DatabaseBuilder {
        DatabaseBuilder {
            path: path.into(),
            options: PoolOptions::default(),
            init_hook: None,
            include_query_in_errors: true,
        }
    }

    /// Open with default options. No connection is made until a session
    /// runs its first operation.
    pub fn open(path: impl Into<String>) -> Result<Self> {
        Self::builder(path).build()
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// Create a new session. Sessions are independent logical callers;
    /// each carries its own transaction state and callback registrations.
    pub fn session(&self) -> Session {
        let id = Uuid::new_v4();
        info!(session = %id, path = self.inner.path, "session created");
        Session {
            id,
            db: self.clone(),
            tx_state: Mutex::new(TransactionState::Idle),
            tx_conn: Mutex::new(None),
            cb_conn: Mutex::new(None),
            callbacks: CallbackTable::new(),
        }
    }

    /// Resize the pool. Fails with [`Error::PoolFrozen`] once any
    /// connection has been created.
    pub fn set_pool_size(&self, max_size: usize) -> Result<()> {
        self.mutate_options(|options| options.max_size = max_size.max(1))
    }

    /// Change the acquire timeout. Same freezing rule as `set_pool_size`.
    pub fn set_acquire_timeout(&self, timeout: Duration) -> Result<()> {
        self.mutate_options(|options| options.acquire_timeout = timeout)
    }

    fn mutate_options(&self, f: impl FnOnce(&mut PoolOptions)) -> Result<()> {
        {
            let pool = self.inner.pool.lock();
            if pool.as_ref().is_some_and(|p| p.has_connections()) {
                return Err(Error::PoolFrozen);
            }
        }
        f(&mut self.inner.options.lock());
        // Drop a still-empty pool so the next acquire recreates it with the
        // new options.
        let mut pool = self.inner.pool.lock();
        if pool.as_ref().is_some_and(|p| !p.has_connections()) {
            *pool = None;
        }
        Ok(())
    }

    pub fn set_include_query_in_errors(&self, include: bool) {
        self.inner
            .include_query_in_errors
            .store(include, Ordering::Relaxed);
    }

    pub(crate) fn include_query_in_errors(&self) -> bool {
        self.inner.include_query_in_errors.load(Ordering::Relaxed)
    }

    pub(crate) fn pool(&self) -> Arc<Pool> {
        let mut slot = self.inner.pool.lock();
        if let Some(pool) = slot.as_ref() {
            return Arc::clone(pool);
        }
        let pool = Pool::new(self.inner.path.clone(), self.inner.options.lock().clone());
        *slot = Some(Arc::clone(&pool));
        pool
    }

    pub fn pool_stats(&self) -> Option<PoolStats> {
        self.inner.pool.lock().as_ref().map(|p| p.stats())
    }

    /// Close the underlying pool. Close sessions first: a connection still
    /// pinned by a transaction is destroyed when its lease drops.
    pub fn close(&self) {
        if let Some(pool) = self.inner.pool.lock().as_ref() {
            pool.close();
        }
    }
}

/// Where an exclusively taken connection goes back to after a backup.
enum ConnOrigin {
    Transaction,
    Callback,
    Pool,
}

/// One logical caller against a [`Database`].
///
/// A session is `Idle` until `begin` pins a connection to it; while `Active`
/// every statement runs on that pinned connection. Callback registrations
/// (`set_trace`, `set_authorizer`, `set_progress_handler`, scalar functions)
/// dedicate a connection to the session for as long as any registration
/// exists, so callbacks observe the session's own statements.
pub struct Session {
    id: Uuid,
    db: Database,
    tx_state: Mutex<TransactionState>,
    tx_conn: Mutex<Option<PooledConnection>>,
    cb_conn: Mutex<Option<PooledConnection>>,
    callbacks: Arc<CallbackTable>,
}

impl Session {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub async fn in_transaction(&self) -> bool {
        self.tx_state.lock().await.is_active()
    }

    fn query<'a>(&self, sql: &'a str) -> Option<&'a str> {
        if self.db.include_query_in_errors() {
            Some(sql)
        } else {
            None
        }
    }

    async fn ensure_init(&self) -> Result<()> {
        let Some(hook) = self.db.inner.init_hook.as_ref() else {
            return Ok(());
        };
        {
            let mut state = self.db.inner.init_state.lock();
            match *state {
                // `Running` covers re-entry: statements issued by the hook
                // itself must not trigger the hook again.
                InitState::Done | InitState::Running => return Ok(()),
                InitState::NotRun => *state = InitState::Running,
            }
        }

        debug!(session = %self.id, "running init hook");
        let result = hook(self.db.clone()).await;
        let mut state = self.db.inner.init_state.lock();
        match result {
            Ok(()) => {
                *state = InitState::Done;
                Ok(())
            }
            Err(e) => {
                // A failed hook runs again on the next operation.
                *state = InitState::NotRun;
                Err(e)
            }
        }
    }

    /// Route `f` to the right connection: pinned transaction connection
    /// first, then the callback-bearing connection, then a one-shot pool
    /// lease.
    async fn with_routed<T>(
        &self,
        f: impl FnOnce(&mut ManagedConnection) -> Result<T>,
    ) -> Result<T> {
        self.ensure_init().await?;

        let active = self.tx_state.lock().await.is_active();
        if active {
            let mut slot = self.tx_conn.lock().await;
            let lease = slot.as_mut().ok_or(Error::ConnectionMissing {
                session: self.id,
                slot: "transaction",
            })?;
            return f(&mut **lease);
        }

        if !self.callbacks.is_empty() {
            self.ensure_callback_connection().await?;
            let mut slot = self.cb_conn.lock().await;
            if let Some(lease) = slot.as_mut() {
                return f(&mut **lease);
            }
            // A concurrent begin claimed the slot between the two locks;
            // fall through to a one-shot lease.
        }

        let pool = self.db.pool();
        let mut lease = pool.acquire().await?;
        f(&mut *lease)
    }

    /// Make sure the callback slot holds an armed connection.
    async fn ensure_callback_connection(&self) -> Result<()> {
        let mut slot = self.cb_conn.lock().await;
        if slot.is_some() {
            return Ok(());
        }
        let pool = self.db.pool();
        let mut lease = pool.acquire().await?;
        bridge::arm_all(&mut lease, &self.callbacks)?;
        debug!(session = %self.id, conn = lease.id(), "connection dedicated to callbacks");
        *slot = Some(lease);
        Ok(())
    }

    /// Park a connection in the callback slot, disarming and releasing any
    /// previous occupant.
    async fn park_callback_connection(&self, lease: PooledConnection) {
        let mut slot = self.cb_conn.lock().await;
        if let Some(mut old) = slot.take() {
            bridge::disarm_all(&mut old);
        }
        *slot = Some(lease);
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Begin an explicit transaction, pinning one connection to this session
    /// until `commit` or `rollback`.
    pub async fn begin(&self) -> Result<()> {
        {
            let mut state = self.tx_state.lock().await;
            if !state.is_idle() {
                return Err(Error::AlreadyActive { session: self.id });
            }
            *state = TransactionState::Starting;
        }

        let result = self.begin_inner().await;
        if result.is_err() {
            *self.tx_state.lock().await = TransactionState::Idle;
        }
        result
    }

    async fn begin_inner(&self) -> Result<()> {
        self.ensure_init().await?;

        // A session with live registrations transacts on its armed
        // connection so hooks keep observing its statements.
        let (lease, from_cb_slot) = if self.callbacks.is_empty() {
            (self.db.pool().acquire().await?, false)
        } else {
            self.ensure_callback_connection().await?;
            match self.cb_conn.lock().await.take() {
                Some(lease) => (lease, true),
                None => (self.db.pool().acquire().await?, false),
            }
        };

        // IMMEDIATE takes the write lock up front, so later statements in
        // the transaction cannot hit a surprise busy error. The busy timeout
        // is refreshed first since BEGIN itself contends for that lock.
        let busy = self.db.inner.options.lock().busy_timeout_duration();
        let begin_result = lease
            .raw()
            .busy_timeout(busy)
            .and_then(|()| lease.raw().execute_batch("BEGIN IMMEDIATE"))
            .map_err(|e| self.engine_err("begin transaction", Some("BEGIN IMMEDIATE"), e));

        if let Err(e) = begin_result {
            if from_cb_slot {
                self.park_callback_connection(lease).await;
            }
            return Err(e);
        }

        debug!(session = %self.id, conn = lease.id(), "transaction started");
        *self.tx_conn.lock().await = Some(lease);
        *self.tx_state.lock().await = TransactionState::Active;
        Ok(())
    }

    pub async fn commit(&self) -> Result<()> {
        self.finish_transaction("COMMIT", TransactionState::Committing)
            .await
    }

    pub async fn rollback(&self) -> Result<()> {
        self.finish_transaction("ROLLBACK", TransactionState::RollingBack)
            .await
    }

    async fn finish_transaction(&self, sql: &'static str, via: TransactionState) -> Result<()> {
        {
            let mut state = self.tx_state.lock().await;
            if !state.is_active() {
                return Err(Error::NoActiveTransaction { session: self.id });
            }
            *state = via;
        }

        let lease = self.tx_conn.lock().await.take();
        let result = match lease {
            None => Err(Error::ConnectionMissing {
                session: self.id,
                slot: "transaction",
            }),
            Some(lease) => {
                let outcome = lease
                    .raw()
                    .execute_batch(sql)
                    .map_err(|e| self.engine_err("finish transaction", Some(sql), e));
                // A failed COMMIT (e.g. a deferred constraint) can leave the
                // engine-level transaction open; roll it back before the
                // connection can be reused.
                if outcome.is_err() && !lease.is_autocommit() {
                    if let Err(e) = lease.raw().execute_batch("ROLLBACK") {
                        warn!(session = %self.id, error = %e, "rollback after failed commit failed");
                    }
                }
                // The transaction is over either way; never leak a pinned
                // connection. With live registrations it stays dedicated to
                // the session, otherwise it goes back to the pool.
                if self.callbacks.is_empty() {
                    drop(lease);
                } else {
                    self.park_callback_connection(lease).await;
                }
                outcome
            }
        };

        *self.tx_state.lock().await = TransactionState::Idle;
        debug!(session = %self.id, op = sql, ok = result.is_ok(), "transaction finished");
        result
    }

    /// Run `body` inside a transaction: commit on `Ok`, roll back on `Err`.
    pub async fn with_transaction<T, Fut>(&self, body: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        self.begin().await?;
        match body.await {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = self.rollback().await {
                    warn!(
                        session = %self.id,
                        error = %rollback_err,
                        "rollback after failed transaction body also failed"
                    );
                }
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn engine_err(&self, op: &str, sql: Option<&str>, e: rusqlite::Error) -> Error {
        let sql = if self.db.include_query_in_errors() {
            sql
        } else {
            None
        };
        Error::engine(op, sql, e)
    }

    /// Execute one statement; returns the number of affected rows.
    pub async fn execute<P: Params>(&self, sql: &str, params: P) -> Result<usize> {
        self.with_routed(|conn| {
            let affected = {
                let mut stmt = conn
                    .cache()
                    .prepare(conn.raw(), sql)
                    .map_err(|e| self.engine_err("prepare", self.query(sql), e))?;
                stmt.execute(params)
                    .map_err(|e| self.engine_err("execute", self.query(sql), e))?
            };
            if is_schema_change(sql) {
                conn.cache().clear(conn.raw());
            }
            Ok(affected)
        })
        .await
    }

    /// Execute multiple statements separated by semicolons. Not cached.
    pub async fn execute_batch(&self, sql: &str) -> Result<()> {
        self.with_routed(|conn| {
            conn.raw()
                .execute_batch(sql)
                .map_err(|e| self.engine_err("execute batch", self.query(sql), e))?;
            if is_schema_change(sql) {
                conn.cache().clear(conn.raw());
            }
            Ok(())
        })
        .await
    }

    /// Execute one statement once per parameter set, reusing the prepared
    /// statement. Returns the total number of affected rows.
    pub async fn execute_many(&self, sql: &str, param_sets: Vec<Vec<Value>>) -> Result<usize> {
        self.with_routed(|conn| {
            let total = {
                let mut stmt = conn
                    .cache()
                    .prepare(conn.raw(), sql)
                    .map_err(|e| self.engine_err("prepare", self.query(sql), e))?;
                let mut total = 0;
                for set in &param_sets {
                    total += stmt
                        .execute(rusqlite::params_from_iter(set.iter()))
                        .map_err(|e| self.engine_err("execute many", self.query(sql), e))?;
                }
                total
            };
            if is_schema_change(sql) {
                conn.cache().clear(conn.raw());
            }
            Ok(total)
        })
        .await
    }

    /// Run a query and materialize every row.
    pub async fn fetch_all<P: Params>(&self, sql: &str, params: P) -> Result<FetchResult> {
        self.with_routed(|conn| {
            let mut stmt = conn
                .cache()
                .prepare(conn.raw(), sql)
                .map_err(|e| self.engine_err("prepare", self.query(sql), e))?;
            let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
            let column_count = columns.len();

            let mut out = Vec::new();
            let mut rows = stmt
                .query(params)
                .map_err(|e| self.engine_err("query", self.query(sql), e))?;
            while let Some(row) = rows
                .next()
                .map_err(|e| self.engine_err("fetch row", self.query(sql), e))?
            {
                let mut values = Vec::with_capacity(column_count);
                for i in 0..column_count {
                    let value: Value = row
                        .get_ref(i)
                        .map_err(|e| self.engine_err("read column", self.query(sql), e))?
                        .into();
                    values.push(value);
                }
                out.push(values);
            }
            Ok(FetchResult { columns, rows: out })
        })
        .await
    }

    /// Run a query that must return at least one row; extra rows are
    /// ignored.
    pub async fn fetch_one<P: Params>(&self, sql: &str, params: P) -> Result<Vec<Value>> {
        let result = self.fetch_all(sql, params).await?;
        result
            .rows
            .into_iter()
            .next()
            .ok_or_else(|| self.engine_err("fetch one", self.query(sql), rusqlite::Error::QueryReturnedNoRows))
    }

    /// Run a query returning its first row, if any.
    pub async fn fetch_optional<P: Params>(&self, sql: &str, params: P) -> Result<Option<Vec<Value>>> {
        let result = self.fetch_all(sql, params).await?;
        Ok(result.rows.into_iter().next())
    }

    pub async fn last_insert_rowid(&self) -> Result<i64> {
        self.with_routed(|conn| Ok(conn.raw().last_insert_rowid())).await
    }

    /// Rows affected by the most recent statement on this session's routed
    /// connection.
    pub async fn changes(&self) -> Result<u64> {
        self.with_routed(|conn| Ok(conn.raw().changes())).await
    }

    pub async fn total_changes(&self) -> Result<i64> {
        self.with_routed(|conn| Ok(conn.total_changes())).await
    }

    /// Produce a SQL script that recreates the database's schema and data.
    ///
    /// Runs on the routed connection, so a dump taken inside a transaction
    /// includes the session's own uncommitted writes.
    pub async fn dump(&self) -> Result<Vec<String>> {
        self.with_routed(|conn| {
            dump::run(conn.raw()).map_err(|e| self.engine_err("dump", None, e))
        })
        .await
    }

    // ------------------------------------------------------------------
    // Callbacks
    // ------------------------------------------------------------------

    /// Target for hook installs: the pinned transaction connection when one
    /// exists, otherwise the (created on demand) callback connection.
    async fn with_hook_connection<T>(
        &self,
        f: impl FnOnce(&mut ManagedConnection) -> Result<T>,
    ) -> Result<T> {
        let active = self.tx_state.lock().await.is_active();
        if active {
            let mut slot = self.tx_conn.lock().await;
            if let Some(lease) = slot.as_mut() {
                return f(&mut **lease);
            }
        }
        self.ensure_callback_connection().await?;
        let mut slot = self.cb_conn.lock().await;
        let lease = slot.as_mut().ok_or(Error::ConnectionMissing {
            session: self.id,
            slot: "callback",
        })?;
        f(&mut **lease)
    }

    /// Uninstall a hook from wherever it is armed. Never creates a
    /// connection; when the last registration goes away the callback
    /// connection is fully disarmed and released.
    async fn clear_hook(&self, f: impl FnOnce(&mut ManagedConnection)) -> Result<()> {
        let active = self.tx_state.lock().await.is_active();
        if active {
            let mut slot = self.tx_conn.lock().await;
            if let Some(lease) = slot.as_mut() {
                f(&mut **lease);
            }
            return Ok(());
        }

        let mut slot = self.cb_conn.lock().await;
        if let Some(lease) = slot.as_mut() {
            f(&mut **lease);
            if self.callbacks.is_empty() {
                if let Some(mut lease) = slot.take() {
                    bridge::disarm_all(&mut lease);
                    debug!(session = %self.id, "callback connection released");
                }
            }
        }
        Ok(())
    }

    /// Install (or with `None` remove) a statement-trace callback.
    pub async fn set_trace(&self, callback: Option<TraceFn>) -> Result<()> {
        let installing = callback.is_some();
        self.callbacks.set_trace(callback);
        if installing {
            self.with_hook_connection(|conn| {
                bridge::install_trace(conn, &self.callbacks);
                Ok(())
            })
            .await
        } else {
            self.clear_hook(|conn| conn.disarm_trace()).await
        }
    }

    /// Install (or with `None` remove) the authorizer consulted while
    /// statements are prepared.
    pub async fn set_authorizer(&self, callback: Option<AuthorizerFn>) -> Result<()> {
        let installing = callback.is_some();
        self.callbacks.set_authorizer(callback);
        if installing {
            self.with_hook_connection(|conn| {
                bridge::install_authorizer(conn, &self.callbacks);
                Ok(())
            })
            .await
        } else {
            self.clear_hook(|conn| bridge::clear_authorizer(conn)).await
        }
    }

    /// Install (or with `None` remove) a progress handler invoked every
    /// `n_ops` virtual-machine steps. Returning `true` interrupts the
    /// statement.
    pub async fn set_progress_handler(&self, n_ops: i32, handler: Option<ProgressFn>) -> Result<()> {
        match handler {
            Some(handler) => {
                self.callbacks.set_progress(Some(ProgressRegistration {
                    n_ops,
                    handler,
                }));
                self.with_hook_connection(|conn| {
                    bridge::install_progress(conn, &self.callbacks);
                    Ok(())
                })
                .await
            }
            None => {
                self.callbacks.set_progress(None);
                self.clear_hook(|conn| bridge::clear_progress(conn)).await
            }
        }
    }

    /// Register a scalar SQL function under `(name, arity)`.
    pub async fn create_function(&self, name: &str, arity: i32, callback: ScalarFn) -> Result<()> {
        self.callbacks.insert_function(name, arity, callback);
        self.with_hook_connection(|conn| bridge::install_function(conn, &self.callbacks, name, arity))
            .await
    }

    /// Remove a scalar SQL function registered under `(name, arity)`.
    pub async fn remove_function(&self, name: &str, arity: i32) -> Result<()> {
        self.callbacks.remove_function(name, arity);
        self.clear_hook(|conn| {
            if let Err(e) = bridge::remove_function(conn, name, arity) {
                warn!(session = %self.id, name, arity, error = %e, "failed to remove function");
            }
        })
        .await
    }

    // ------------------------------------------------------------------
    // Backup
    // ------------------------------------------------------------------

    /// Copy this session's database into `target`'s, page by page.
    ///
    /// Fails fast when the target session has an active transaction. Both
    /// sessions' routed connections are held exclusively for the duration;
    /// the copy itself runs on a blocking worker.
    pub async fn backup_to(&self, target: &Session, options: BackupOptions) -> Result<BackupProgress> {
        self.ensure_init().await?;

        if target.in_transaction().await {
            return Err(Error::TargetBusy { session: target.id });
        }

        let (source_lease, source_origin) = self.take_exclusive_connection().await?;
        let (target_lease, target_origin) = match target.take_exclusive_connection().await {
            Ok(taken) => taken,
            Err(e) => {
                self.restore_exclusive_connection(source_lease, source_origin)
                    .await;
                return Err(e);
            }
        };

        // Both checks re-run with the connections actually in hand: the
        // target may have started writing since the first check.
        if source_lease.provenance() != target_lease.provenance() {
            let err = Error::HandleIncompatible {
                source_instance: source_lease.provenance(),
                target_instance: target_lease.provenance(),
            };
            self.restore_exclusive_connection(source_lease, source_origin)
                .await;
            target
                .restore_exclusive_connection(target_lease, target_origin)
                .await;
            return Err(err);
        }
        if !target_lease.is_autocommit() {
            let err = Error::TargetBusy { session: target.id };
            self.restore_exclusive_connection(source_lease, source_origin)
                .await;
            target
                .restore_exclusive_connection(target_lease, target_origin)
                .await;
            return Err(err);
        }

        info!(session = %self.id, target = %target.id, "backup starting");
        let worker = tokio::task::spawn_blocking(move || {
            let source_lease = source_lease;
            let mut target_lease = target_lease;
            let result = backup::run(&source_lease, &mut target_lease, &options);
            (result, source_lease, target_lease)
        });

        match worker.await {
            Ok((result, source_lease, target_lease)) => {
                self.restore_exclusive_connection(source_lease, source_origin)
                    .await;
                target
                    .restore_exclusive_connection(target_lease, target_origin)
                    .await;
                result
            }
            // The worker panicked; its leases were dropped during unwinding
            // and their connections went back to the pool.
            Err(e) => Err(Error::Worker(e.to_string())),
        }
    }

    /// Take this session's routed connection out of its slot for exclusive
    /// use, remembering where to put it back.
    async fn take_exclusive_connection(&self) -> Result<(PooledConnection, ConnOrigin)> {
        let active = self.tx_state.lock().await.is_active();
        if active {
            return match self.tx_conn.lock().await.take() {
                Some(lease) => Ok((lease, ConnOrigin::Transaction)),
                None => Err(Error::ConnectionMissing {
                    session: self.id,
                    slot: "transaction",
                }),
            };
        }
        if !self.callbacks.is_empty() {
            self.ensure_callback_connection().await?;
            if let Some(lease) = self.cb_conn.lock().await.take() {
                return Ok((lease, ConnOrigin::Callback));
            }
        }
        Ok((self.db.pool().acquire().await?, ConnOrigin::Pool))
    }

    async fn restore_exclusive_connection(&self, lease: PooledConnection, origin: ConnOrigin) {
        match origin {
            ConnOrigin::Transaction => *self.tx_conn.lock().await = Some(lease),
            ConnOrigin::Callback => self.park_callback_connection(lease).await,
            ConnOrigin::Pool => drop(lease),
        }
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Release everything this session holds. A still-active transaction is
    /// rolled back, hooks are disarmed, and both dedicated connections go
    /// back to the pool.
    pub async fn close(&self) {
        let was_active = {
            let mut state = self.tx_state.lock().await;
            let active = state.is_active();
            if active {
                *state = TransactionState::RollingBack;
            }
            active
        };
        if was_active {
            if let Some(mut lease) = self.tx_conn.lock().await.take() {
                if let Err(e) = lease.raw().execute_batch("ROLLBACK") {
                    warn!(session = %self.id, error = %e, "implicit rollback on close failed");
                }
                bridge::disarm_all(&mut lease);
            }
            *self.tx_state.lock().await = TransactionState::Idle;
        }

        if let Some(mut lease) = self.cb_conn.lock().await.take() {
            bridge::disarm_all(&mut lease);
        }
        self.callbacks.clear();
        info!(session = %self.id, "session closed");
    }
}
