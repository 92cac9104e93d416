use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;
use rusqlite::{CachedStatement, Connection, ErrorCode};
use tracing::debug;

/// Per-connection prepared-statement cache.
///
/// The engine-side statement reuse is rusqlite's per-connection cache
/// (`prepare_cached`), bounded by the configured capacity. This layer tracks
/// usage per SQL string and implements the stale-statement rule: a
/// `SQLITE_SCHEMA` error at prepare time flushes the cached statement and
/// re-prepares once before surfacing.
///
/// Keys are the exact SQL string handed in; normalization is the caller's
/// responsibility.
pub struct StatementCache {
    usage: Mutex<LruCache<String, u64>>,
    stats: Mutex<CacheCounters>,
}

#[derive(Debug, Default, Clone, Copy)]
struct CacheCounters {
    hits: u64,
    misses: u64,
    stale_retries: u64,
}

/// Snapshot of cache activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub stale_retries: u64,
}

impl StatementCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self {
            usage: Mutex::new(LruCache::new(capacity)),
            stats: Mutex::new(CacheCounters::default()),
        }
    }

    /// Prepare `sql` on `conn`, reusing the engine-side cached statement
    /// when one exists.
    pub fn prepare<'c>(
        &self,
        conn: &'c Connection,
        sql: &str,
    ) -> rusqlite::Result<CachedStatement<'c>> {
        self.record_usage(sql);

        match conn.prepare_cached(sql) {
            Err(e) if is_stale_statement(&e) => {
                // One retry with a fresh prepare, then surface the error.
                debug!(sql, "cached statement went stale, re-preparing");
                self.stats.lock().stale_retries += 1;
                conn.flush_prepared_statement_cache();
                conn.prepare_cached(sql)
            }
            other => other,
        }
    }

    /// Drop every cached statement on `conn`. Used after schema-altering
    /// statements and before a connection is destroyed.
    pub fn clear(&self, conn: &Connection) {
        conn.flush_prepared_statement_cache();
        self.usage.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        let counters = *self.stats.lock();
        CacheStats {
            entries: self.usage.lock().len(),
            hits: counters.hits,
            misses: counters.misses,
            stale_retries: counters.stale_retries,
        }
    }

    fn record_usage(&self, sql: &str) {
        let mut usage = self.usage.lock();
        let mut stats = self.stats.lock();
        if let Some(count) = usage.get_mut(sql) {
            *count += 1;
            stats.hits += 1;
        } else {
            usage.push(sql.to_string(), 1);
            stats.misses += 1;
        }
    }
}

fn is_stale_statement(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::SchemaChanged
    )
}
