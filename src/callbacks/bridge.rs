//! Installs and removes engine-side hooks on one specific connection.
//!
//! The engine invokes hooks synchronously inside its own call stack, with no
//! knowledge of the host runtime's failure model. Every entry point here
//! therefore catches unwinds and converts failures into the kind-specific
//! safe default: trace failures are swallowed, authorizer failures deny,
//! progress failures continue, scalar-function failures become a clean
//! statement error.

use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_uint, c_void};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

use rusqlite::ffi;
use rusqlite::functions::FunctionFlags;
use rusqlite::hooks::{AuthContext, Authorization};
use rusqlite::types::Value;
use tracing::{debug, warn};

use crate::pool::ManagedConnection;
use crate::{Error, Result};

use super::CallbackTable;

/// Context handed to the raw trace trampoline. Holds only a weak reference:
/// the trampoline never keeps the table (or anything async) alive.
struct TraceContext {
    table: Weak<CallbackTable>,
}

/// Trace trampoline registered with `sqlite3_trace_v2`.
///
/// Safety contract: called synchronously by the engine with `ctx` pointing
/// at the `TraceContext` box owned by the connection (kept alive until the
/// trampoline is disarmed) and `x` pointing at the statement text for
/// `SQLITE_TRACE_STMT` events. Nothing may unwind past this frame.
unsafe extern "C" fn trace_trampoline(
    event: c_uint,
    ctx: *mut c_void,
    _stmt: *mut c_void,
    x: *mut c_void,
) -> c_int {
    if event != ffi::SQLITE_TRACE_STMT as c_uint || ctx.is_null() || x.is_null() {
        return 0;
    }

    let context = unsafe { &*(ctx as *const TraceContext) };
    let Some(table) = context.table.upgrade() else {
        return 0;
    };
    let Some(callback) = table.trace() else {
        return 0;
    };

    let sql = unsafe { CStr::from_ptr(x as *const c_char) }
        .to_string_lossy()
        .into_owned();

    // Tracing must never affect correctness: failures are swallowed.
    let _ = catch_unwind(AssertUnwindSafe(|| callback(&sql)));
    0
}

/// Arm the trace trampoline on `conn`, replacing any previous one.
pub fn install_trace(conn: &mut ManagedConnection, table: &Arc<CallbackTable>) {
    conn.disarm_trace();

    let ctx = Box::new(TraceContext {
        table: Arc::downgrade(table),
    });
    let ctx_ptr = &*ctx as *const TraceContext as *mut c_void;

    // Safety: the handle is valid while the connection lives; ctx_ptr points
    // into the box stored on the connection right below, which outlives the
    // registration (disarm_trace clears the engine side before dropping it).
    unsafe {
        ffi::sqlite3_trace_v2(
            conn.raw().handle(),
            ffi::SQLITE_TRACE_STMT as c_uint,
            Some(trace_trampoline),
            ctx_ptr,
        );
    }
    conn.set_trace_ctx(ctx);
    debug!(conn = conn.id(), "trace trampoline armed");
}

pub fn install_authorizer(conn: &ManagedConnection, table: &Arc<CallbackTable>) {
    let table = Arc::clone(table);
    conn.raw()
        .authorizer(Some(move |ctx: AuthContext<'_>| -> Authorization {
            let Some(callback) = table.authorizer() else {
                return Authorization::Allow;
            };
            match catch_unwind(AssertUnwindSafe(|| callback(&ctx))) {
                Ok(decision) => decision,
                // Fail-secure: an authorizer that cannot answer denies.
                Err(_) => Authorization::Deny,
            }
        }));
}

pub fn clear_authorizer(conn: &ManagedConnection) {
    conn.raw()
        .authorizer(None::<fn(AuthContext<'_>) -> Authorization>);
}

pub fn install_progress(conn: &ManagedConnection, table: &Arc<CallbackTable>) {
    let Some(registration) = table.progress() else {
        return;
    };
    let table = Arc::clone(table);
    conn.raw()
        .progress_handler(registration.n_ops, Some(move || -> bool {
            let Some(registration) = table.progress() else {
                return false;
            };
            match catch_unwind(AssertUnwindSafe(|| (registration.handler)())) {
                Ok(interrupt) => interrupt,
                // Fail-open: aborting a statement mid-flight has stronger
                // side effects than letting it finish.
                Err(_) => false,
            }
        }));
}

pub fn clear_progress(conn: &ManagedConnection) {
    conn.raw().progress_handler(0, None::<fn() -> bool>);
}

/// Install one scalar function registered in the table under `(name, arity)`.
pub fn install_function(
    conn: &mut ManagedConnection,
    table: &Arc<CallbackTable>,
    name: &str,
    arity: i32,
) -> Result<()> {
    let table = Arc::clone(table);
    let key_name = name.to_string();
    conn.raw()
        .create_scalar_function(
            name,
            arity as c_int,
            FunctionFlags::SQLITE_UTF8,
            move |ctx| -> rusqlite::Result<Value> {
                let callback = table.function(&key_name, arity).ok_or_else(|| {
                    rusqlite::Error::UserFunctionError("function registration removed".into())
                })?;

                let args: Vec<Value> = (0..ctx.len())
                    .map(|i| ctx.get_raw(i).into())
                    .collect();

                match catch_unwind(AssertUnwindSafe(|| callback(&args))) {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(rusqlite::Error::UserFunctionError(e)),
                    Err(_) => Err(rusqlite::Error::UserFunctionError(
                        "user-defined function panicked".into(),
                    )),
                }
            },
        )
        .map_err(|e| Error::engine(&format!("create function {name}/{arity}"), None, e))?;
    conn.note_function_armed(name, arity);
    Ok(())
}

pub fn remove_function(conn: &mut ManagedConnection, name: &str, arity: i32) -> Result<()> {
    conn.raw()
        .remove_function(name, arity as c_int)
        .map_err(|e| Error::engine(&format!("remove function {name}/{arity}"), None, e))?;
    conn.note_function_removed(name, arity);
    Ok(())
}

/// Install every registration currently in the table on `conn`. Used when a
/// connection is first dedicated to callback-bearing work.
pub fn arm_all(conn: &mut ManagedConnection, table: &Arc<CallbackTable>) -> Result<()> {
    if table.trace().is_some() {
        install_trace(conn, table);
    }
    if table.authorizer().is_some() {
        install_authorizer(conn, table);
    }
    if table.progress().is_some() {
        install_progress(conn, table);
    }
    for (name, arity) in table.function_keys() {
        install_function(conn, table, &name, arity)?;
    }
    Ok(())
}

/// Remove every hook from `conn`. Must run before a callback-bearing
/// connection is released to the pool's free set or destroyed.
pub fn disarm_all(conn: &mut ManagedConnection) {
    conn.disarm_trace();
    clear_authorizer(conn);
    clear_progress(conn);
    for (name, arity) in conn.take_armed_functions() {
        if let Err(e) = conn.raw().remove_function(name.as_str(), arity as c_int) {
            warn!(name, arity, error = %e, "failed to remove scalar function");
        }
    }
    debug!(conn = conn.id(), "callback hooks disarmed");
}
