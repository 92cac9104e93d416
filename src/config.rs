use std::time::Duration;

/// Pool and per-connection configuration.
///
/// Applied when the pool is first created; once any connection exists the
/// configuration is frozen and setters on [`crate::Database`] return
/// [`crate::Error::PoolFrozen`].
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Maximum number of concurrently leased connections.
    pub max_size: usize,
    /// How long `acquire` waits for a free connection before failing.
    pub acquire_timeout: Duration,
    /// SQLite `busy_timeout` applied to every connection, in seconds.
    pub busy_timeout: f64,
    /// PRAGMA settings applied when a connection is opened, in order.
    pub pragmas: Vec<(String, String)>,
    /// Capacity of the per-connection prepared-statement cache.
    pub statement_cache_capacity: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_size: 10,
            acquire_timeout: Duration::from_secs(30),
            // Matches the sqlite3 default busy timeout.
            busy_timeout: 5.0,
            pragmas: Vec::new(),
            statement_cache_capacity: 128,
        }
    }
}

impl PoolOptions {
    pub fn busy_timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.busy_timeout.max(0.0))
    }
}
