//! Native status classification and error construction.
//!
//! SQLite's last-error state is mutable per-connection data, so an error is
//! built at most once per failing call, immediately after the call that
//! produced it and before any other operation runs on that connection.

use std::ffi::CStr;

use libsqlite3_sys as sqlite;
use sqlspan_core::error::BridgeError;

/// Outcome of stepping a prepared statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A result row is available for column reads.
    Row,
    /// The statement has run to completion.
    Done,
}

/// The fixed success set: ok, row available, done.
pub(crate) fn rc_ok(rc: i32) -> bool {
    matches!(rc, sqlite::SQLITE_OK | sqlite::SQLITE_ROW | sqlite::SQLITE_DONE)
}

/// Builds an error from a live connection's last-error state.
///
/// # Safety
/// `db` must be null or a valid connection pointer.
pub(crate) unsafe fn error_from_db(db: *mut sqlite::sqlite3, rc: i32) -> BridgeError {
    if db.is_null() {
        return error_from_code(rc);
    }
    let extended = sqlite::sqlite3_extended_errcode(db);
    let code = if extended != 0 { extended } else { rc };
    let msg = sqlite::sqlite3_errmsg(db);
    let message = if msg.is_null() {
        None
    } else {
        Some(CStr::from_ptr(msg).to_string_lossy().into_owned())
    };
    BridgeError::Native { code, message }
}

/// Fallback when no usable connection exists (e.g. a failed open): a
/// generic description of the code, with no live-state message.
pub(crate) fn error_from_code(rc: i32) -> BridgeError {
    let message = unsafe {
        let p = sqlite::sqlite3_errstr(rc);
        if p.is_null() {
            None
        } else {
            Some(CStr::from_ptr(p).to_string_lossy().into_owned())
        }
    };
    BridgeError::Native { code: rc, message }
}
