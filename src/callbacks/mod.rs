pub mod bridge;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use rusqlite::hooks::{AuthContext, Authorization};
use rusqlite::types::Value;

/// Statement-trace callable. Failures never affect the traced statement.
pub type TraceFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Authorization callable. A failure inside the callable defaults to
/// [`Authorization::Deny`].
pub type AuthorizerFn = Arc<dyn for<'c> Fn(&AuthContext<'c>) -> Authorization + Send + Sync>;

/// Progress callable; returning `true` interrupts the in-flight statement.
/// A failure inside the callable defaults to "continue".
pub type ProgressFn = Arc<dyn Fn() -> bool + Send + Sync>;

pub type ScalarError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Scalar-function callable. An error (or panic) becomes an engine-level
/// error for the statement that invoked the function.
pub type ScalarFn = Arc<dyn Fn(&[Value]) -> Result<Value, ScalarError> + Send + Sync>;

#[derive(Clone)]
pub struct ProgressRegistration {
    pub n_ops: std::os::raw::c_int,
    pub handler: ProgressFn,
}

/// Per-session registration table.
///
/// At most one registration per non-function kind; the most recent `set_*`
/// replaces the previous one, `None` clears it. Scalar functions coexist,
/// keyed by `(name, arity)`.
///
/// Guarded by `std::sync::Mutex` (not the pool lock): the engine-side hook
/// closures look registrations up under a short-lived lock from inside
/// engine calls, and those closures must be unwind-safe.
#[derive(Default)]
pub struct CallbackTable {
    trace: Mutex<Option<TraceFn>>,
    authorizer: Mutex<Option<AuthorizerFn>>,
    progress: Mutex<Option<ProgressRegistration>>,
    functions: Mutex<HashMap<(String, i32), ScalarFn>>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    // Callables are never invoked while a table lock is held, so a poisoned
    // lock only means a panic elsewhere; the data is still consistent.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CallbackTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_trace(&self, callback: Option<TraceFn>) {
        *lock(&self.trace) = callback;
    }

    pub fn trace(&self) -> Option<TraceFn> {
        lock(&self.trace).clone()
    }

    pub fn set_authorizer(&self, callback: Option<AuthorizerFn>) {
        *lock(&self.authorizer) = callback;
    }

    pub fn authorizer(&self) -> Option<AuthorizerFn> {
        lock(&self.authorizer).clone()
    }

    pub fn set_progress(&self, registration: Option<ProgressRegistration>) {
        *lock(&self.progress) = registration;
    }

    pub fn progress(&self) -> Option<ProgressRegistration> {
        lock(&self.progress).clone()
    }

    pub fn insert_function(&self, name: &str, arity: i32, callback: ScalarFn) {
        lock(&self.functions).insert((name.to_string(), arity), callback);
    }

    pub fn remove_function(&self, name: &str, arity: i32) -> bool {
        lock(&self.functions)
            .remove(&(name.to_string(), arity))
            .is_some()
    }

    pub fn function(&self, name: &str, arity: i32) -> Option<ScalarFn> {
        lock(&self.functions).get(&(name.to_string(), arity)).cloned()
    }

    pub fn function_keys(&self) -> Vec<(String, i32)> {
        lock(&self.functions).keys().cloned().collect()
    }

    /// True when no registration of any kind is active.
    pub fn is_empty(&self) -> bool {
        lock(&self.trace).is_none()
            && lock(&self.authorizer).is_none()
            && lock(&self.progress).is_none()
            && lock(&self.functions).is_empty()
    }

    pub fn clear(&self) {
        *lock(&self.trace) = None;
        *lock(&self.authorizer) = None;
        *lock(&self.progress) = None;
        lock(&self.functions).clear();
    }
}
