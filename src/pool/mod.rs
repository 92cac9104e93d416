use std::any::Any;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::cache::StatementCache;
use crate::config::PoolOptions;
use crate::{Error, Result};

/// Identity of the loaded SQLite library instance.
///
/// Two handles are safe to use together (e.g. in a backup) only when they
/// come from the same loaded instance of the engine; mixing instances is
/// undefined behavior at the C level. The address of the engine's static
/// version string identifies the instance.
pub fn engine_instance_id() -> usize {
    // Safety: sqlite3_libversion returns a pointer to a static string owned
    // by the library, valid for the life of the process.
    static INSTANCE: Lazy<usize> = Lazy::new(|| unsafe {
        rusqlite::ffi::sqlite3_libversion() as usize
    });
    *INSTANCE
}

/// One native SQLite handle plus its private statement cache.
///
/// Destroying a `ManagedConnection` is the single point where its trace
/// trampoline is disarmed and its prepared statements are finalized; the
/// engine never keeps a dangling reference past this drop.
pub struct ManagedConnection {
    id: u64,
    conn: Connection,
    cache: StatementCache,
    provenance: usize,
    // Context box for the raw trace trampoline, kept alive while the
    // trampoline is armed. See callbacks::bridge.
    trace_ctx: Option<Box<dyn Any + Send>>,
    // Scalar functions currently registered on the raw handle, so they can
    // be removed without the owning session's registration table.
    armed_functions: Vec<(String, i32)>,
}

impl ManagedConnection {
    fn open(path: &str, id: u64, options: &PoolOptions) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX
            | OpenFlags::SQLITE_OPEN_URI;

        debug!(path, id, "opening connection");
        let conn = Connection::open_with_flags(path, flags).map_err(|e| Error::Open {
            path: path.to_string(),
            source: e,
        })?;

        for (key, value) in &options.pragmas {
            let pragma_sql = format!("PRAGMA {key} = {value};");
            conn.execute_batch(&pragma_sql)
                .map_err(|e| Error::engine("apply pragma", Some(&pragma_sql), e))?;
        }

        conn.busy_timeout(options.busy_timeout_duration())
            .map_err(|e| Error::engine("set busy_timeout", None, e))?;
        conn.set_prepared_statement_cache_capacity(options.statement_cache_capacity);

        Ok(Self {
            id,
            conn,
            cache: StatementCache::new(options.statement_cache_capacity),
            provenance: engine_instance_id(),
            trace_ctx: None,
            armed_functions: Vec::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Which loaded engine instance this handle belongs to.
    pub fn provenance(&self) -> usize {
        self.provenance
    }

    pub fn raw(&self) -> &Connection {
        &self.conn
    }

    pub fn raw_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn cache(&self) -> &StatementCache {
        &self.cache
    }

    pub fn is_autocommit(&self) -> bool {
        self.conn.is_autocommit()
    }

    /// Total rows changed over the life of this connection; not exposed by
    /// the safe API.
    pub fn total_changes(&self) -> i64 {
        // Safety: the handle is valid while `self.conn` is alive.
        unsafe { i64::from(rusqlite::ffi::sqlite3_total_changes(self.conn.handle())) }
    }

    /// Store the trampoline context after the trace hook has been installed
    /// on the raw handle. The box must stay alive until `disarm_trace`.
    pub(crate) fn set_trace_ctx(&mut self, ctx: Box<dyn Any + Send>) {
        self.trace_ctx = Some(ctx);
    }

    pub(crate) fn note_function_armed(&mut self, name: &str, arity: i32) {
        if !self.armed_functions.iter().any(|(n, a)| n == name && *a == arity) {
            self.armed_functions.push((name.to_string(), arity));
        }
    }

    pub(crate) fn note_function_removed(&mut self, name: &str, arity: i32) {
        self.armed_functions.retain(|(n, a)| n != name || *a != arity);
    }

    pub(crate) fn take_armed_functions(&mut self) -> Vec<(String, i32)> {
        std::mem::take(&mut self.armed_functions)
    }

    /// Bring the connection back to a neutral state before it re-enters the
    /// free set: roll back a transaction left open by a dropped session and
    /// strip any hooks still armed. Returns false when the connection could
    /// not be cleaned and must be destroyed instead.
    fn sanitize(&mut self) -> bool {
        if !self.conn.is_autocommit() {
            warn!(id = self.id, "connection returned mid-transaction, rolling back");
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!(id = self.id, error = %e, "rollback failed, destroying connection");
                return false;
            }
        }
        self.disarm_trace();
        self.conn
            .authorizer(None::<fn(rusqlite::hooks::AuthContext<'_>) -> rusqlite::hooks::Authorization>);
        self.conn.progress_handler(0, None::<fn() -> bool>);
        for (name, arity) in self.take_armed_functions() {
            if let Err(e) = self.conn.remove_function(name.as_str(), arity as std::os::raw::c_int) {
                warn!(id = self.id, name, error = %e, "failed to remove leftover function");
            }
        }
        true
    }

    /// Remove the trace trampoline from the raw handle and drop its context.
    pub(crate) fn disarm_trace(&mut self) {
        if self.trace_ctx.is_none() {
            return;
        }
        // Safety: the handle is valid while `self.conn` is alive; passing a
        // null callback clears the trampoline so the engine holds no
        // reference to the context we are about to drop.
        unsafe {
            rusqlite::ffi::sqlite3_trace_v2(self.conn.handle(), 0, None, std::ptr::null_mut());
        }
        self.trace_ctx = None;
    }
}

impl Drop for ManagedConnection {
    fn drop(&mut self) {
        // Trampolines must be gone before the native handle is closed.
        self.disarm_trace();
        debug!(id = self.id, "destroying connection");
    }
}

/// Bounded pool of [`ManagedConnection`]s with FIFO waiters.
///
/// Connections are created lazily up to `max_size`; a fair semaphore bounds
/// leases and serves waiters strictly in arrival order. Bookkeeping locks
/// are never held across an engine call.
pub struct Pool {
    path: String,
    options: PoolOptions,
    semaphore: Arc<Semaphore>,
    free: Mutex<Vec<ManagedConnection>>,
    created: AtomicU64,
    closed: AtomicBool,
}

#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub max_size: usize,
    pub created: u64,
    pub free: usize,
}

impl Pool {
    pub fn new(path: String, options: PoolOptions) -> Arc<Self> {
        info!(
            path,
            max_size = options.max_size,
            timeout = ?options.acquire_timeout,
            "creating connection pool"
        );
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(options.max_size)),
            free: Mutex::new(Vec::new()),
            created: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            path,
            options,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// Lease a connection, waiting up to the configured acquire timeout.
    ///
    /// Waiters are served FIFO; a timed-out waiter is removed from the queue
    /// (dropping the pending permit future dequeues it), so no orphaned
    /// waiter can absorb a later release.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::PoolClosed);
        }

        let permit_fut = Arc::clone(&self.semaphore).acquire_owned();
        let permit = match tokio::time::timeout(self.options.acquire_timeout, permit_fut).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::PoolClosed),
            Err(_) => {
                warn!(path = self.path, "pool acquire timed out");
                return Err(Error::PoolTimeout {
                    path: self.path.clone(),
                    timeout: self.options.acquire_timeout,
                    max_size: self.options.max_size,
                });
            }
        };

        let conn = {
            let mut free = self.free.lock();
            free.pop()
        };
        let conn = match conn {
            Some(conn) => conn,
            None => {
                let id = self.created.fetch_add(1, Ordering::Relaxed) + 1;
                ManagedConnection::open(&self.path, id, &self.options)?
            }
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    /// Whether any connection has ever been created. Configuration is frozen
    /// once this is true.
    pub fn has_connections(&self) -> bool {
        self.created.load(Ordering::Relaxed) > 0
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            max_size: self.options.max_size,
            created: self.created.load(Ordering::Relaxed),
            free: self.free.lock().len(),
        }
    }

    /// Close the pool: pending and future acquires fail with `PoolClosed`,
    /// free connections are destroyed now, leased connections are destroyed
    /// as their leases are dropped.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.semaphore.close();
        let drained = {
            let mut free = self.free.lock();
            std::mem::take(&mut *free)
        };
        info!(path = self.path, count = drained.len(), "closing pool");
        drop(drained);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Exclusive lease on one connection. Returns the connection to the pool's
/// free set on drop and wakes the longest-waiting acquirer.
pub struct PooledConnection {
    conn: Option<ManagedConnection>,
    pool: Arc<Pool>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = ManagedConnection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("lease holds a connection")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("lease holds a connection")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            // A lease dropped mid-transaction (a session torn down without
            // close) must not poison the free set.
            if !self.pool.is_closed() && conn.sanitize() {
                self.pool.free.lock().push(conn);
            }
        }
        // The permit drops after the connection is back in the free set, so
        // the woken waiter always finds it there.
    }
}
