//! C ABI exports for non-Rust hosts.
//!
//! The managed runtime's FFI layer calls these per-operation functions
//! with `u64` tokens and C strings. Statuses are integers: `0` is success,
//! positive values are native SQLite (extended) result codes passed
//! through verbatim, and negative values are bridge-detected failures that
//! never reached native code. Variable-length values come back through a
//! caller buffer with a required-length protocol: `out_len` is always
//! written, and a too-small buffer yields [`SQLSPAN_ERR_NOSPACE`] without
//! partial writes.
//!
//! This layer pins the one process-wide [`Bridge`]; the core itself takes
//! the bridge as an explicit context argument everywhere.

use std::ffi::{c_char, c_int, c_void, CStr, CString};

use once_cell::sync::OnceCell;

use crate::{
    AuthContext, AuthVerdict, AuthorizerFn, Bridge, BridgeError, ColumnType, ConnToken,
    StepOutcome, StmtToken,
};
use sqlspan_core::error::Result;

pub const SQLSPAN_OK: c_int = 0;
/// `sqlspan_step`: a result row is available.
pub const SQLSPAN_ROW: c_int = 100;
/// `sqlspan_step`: the statement has run to completion.
pub const SQLSPAN_DONE: c_int = 101;

/// A required pointer argument was null.
pub const SQLSPAN_ERR_MISUSE: c_int = -1;
/// A token was used after its resource was disposed.
pub const SQLSPAN_ERR_STALE_HANDLE: c_int = -2;
/// A value could not cross the boundary losslessly.
pub const SQLSPAN_ERR_CONVERSION: c_int = -3;
/// The host authorizer callback misbehaved during re-entry.
pub const SQLSPAN_ERR_CALLBACK: c_int = -4;
/// A configured bridge limit was hit.
pub const SQLSPAN_ERR_LIMIT: c_int = -5;
/// The caller buffer is too small; `out_len` holds the required size.
pub const SQLSPAN_ERR_NOSPACE: c_int = -6;

pub const SQLSPAN_TYPE_INTEGER: c_int = 1;
pub const SQLSPAN_TYPE_FLOAT: c_int = 2;
pub const SQLSPAN_TYPE_TEXT: c_int = 3;
pub const SQLSPAN_TYPE_BLOB: c_int = 4;
pub const SQLSPAN_TYPE_NULL: c_int = 5;

static BRIDGE: OnceCell<Bridge> = OnceCell::new();

fn bridge() -> &'static Bridge {
    BRIDGE.get_or_init(Bridge::from_env)
}

fn error_status(err: &BridgeError) -> c_int {
    match err {
        BridgeError::Native { code, .. } => *code,
        BridgeError::StaleHandle { .. } => SQLSPAN_ERR_STALE_HANDLE,
        BridgeError::Conversion(_) => SQLSPAN_ERR_CONVERSION,
        BridgeError::CallbackPanic(_) => SQLSPAN_ERR_CALLBACK,
        BridgeError::LimitExceeded(_) => SQLSPAN_ERR_LIMIT,
    }
}

fn unit_status(res: Result<()>) -> c_int {
    match res {
        Ok(()) => SQLSPAN_OK,
        Err(e) => error_status(&e),
    }
}

unsafe fn write_out<T>(out: *mut T, value: T) -> c_int {
    if out.is_null() {
        return SQLSPAN_ERR_MISUSE;
    }
    *out = value;
    SQLSPAN_OK
}

unsafe fn c_text<'a>(p: *const c_char) -> std::result::Result<&'a str, c_int> {
    if p.is_null() {
        return Err(SQLSPAN_ERR_MISUSE);
    }
    CStr::from_ptr(p).to_str().map_err(|_| SQLSPAN_ERR_CONVERSION)
}

unsafe fn copy_bytes(bytes: &[u8], buf: *mut u8, cap: u32, out_len: *mut u32) -> c_int {
    if out_len.is_null() {
        return SQLSPAN_ERR_MISUSE;
    }
    *out_len = bytes.len() as u32;
    if bytes.is_empty() {
        return SQLSPAN_OK;
    }
    if buf.is_null() || (cap as usize) < bytes.len() {
        return SQLSPAN_ERR_NOSPACE;
    }
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf, bytes.len());
    SQLSPAN_OK
}

// ---- connection lifecycle ----

#[no_mangle]
pub unsafe extern "C" fn sqlspan_open(path: *const c_char, out_conn: *mut u64) -> c_int {
    let path = match c_text(path) {
        Ok(p) => p,
        Err(status) => return status,
    };
    if out_conn.is_null() {
        return SQLSPAN_ERR_MISUSE;
    }
    match bridge().open(path) {
        Ok(token) => write_out(out_conn, token.raw()),
        Err(e) => error_status(&e),
    }
}

#[no_mangle]
pub unsafe extern "C" fn sqlspan_open_memory(out_conn: *mut u64) -> c_int {
    if out_conn.is_null() {
        return SQLSPAN_ERR_MISUSE;
    }
    match bridge().open_in_memory() {
        Ok(token) => write_out(out_conn, token.raw()),
        Err(e) => error_status(&e),
    }
}

#[no_mangle]
pub unsafe extern "C" fn sqlspan_close(conn: u64) -> c_int {
    unit_status(bridge().close(ConnToken::from_raw(conn)))
}

#[no_mangle]
pub unsafe extern "C" fn sqlspan_exec(conn: u64, sql: *const c_char) -> c_int {
    let sql = match c_text(sql) {
        Ok(s) => s,
        Err(status) => return status,
    };
    unit_status(bridge().exec(ConnToken::from_raw(conn), sql))
}

#[no_mangle]
pub unsafe extern "C" fn sqlspan_last_error_code(conn: u64, out_code: *mut i32) -> c_int {
    match bridge().last_error_code(ConnToken::from_raw(conn)) {
        Ok(code) => write_out(out_code, code),
        Err(e) => error_status(&e),
    }
}

#[no_mangle]
pub unsafe extern "C" fn sqlspan_last_error_message(
    conn: u64,
    buf: *mut u8,
    cap: u32,
    out_len: *mut u32,
) -> c_int {
    match bridge().last_error_message(ConnToken::from_raw(conn)) {
        Ok(message) => copy_bytes(message.as_bytes(), buf, cap, out_len),
        Err(e) => error_status(&e),
    }
}

#[no_mangle]
pub unsafe extern "C" fn sqlspan_changes(conn: u64, out_changes: *mut i64) -> c_int {
    match bridge().changes(ConnToken::from_raw(conn)) {
        Ok(n) => write_out(out_changes, n),
        Err(e) => error_status(&e),
    }
}

#[no_mangle]
pub unsafe extern "C" fn sqlspan_last_insert_rowid(conn: u64, out_rowid: *mut i64) -> c_int {
    match bridge().last_insert_rowid(ConnToken::from_raw(conn)) {
        Ok(id) => write_out(out_rowid, id),
        Err(e) => error_status(&e),
    }
}

#[no_mangle]
pub unsafe extern "C" fn sqlspan_busy_timeout(conn: u64, ms: u32) -> c_int {
    unit_status(bridge().busy_timeout(ConnToken::from_raw(conn), ms))
}

// ---- statement lifecycle ----

#[no_mangle]
pub unsafe extern "C" fn sqlspan_prepare(conn: u64, sql: *const c_char, out_stmt: *mut u64) -> c_int {
    let sql = match c_text(sql) {
        Ok(s) => s,
        Err(status) => return status,
    };
    if out_stmt.is_null() {
        return SQLSPAN_ERR_MISUSE;
    }
    match bridge().prepare(ConnToken::from_raw(conn), sql) {
        Ok(token) => write_out(out_stmt, token.raw()),
        Err(e) => error_status(&e),
    }
}

#[no_mangle]
pub unsafe extern "C" fn sqlspan_step(stmt: u64) -> c_int {
    match bridge().step(StmtToken::from_raw(stmt)) {
        Ok(StepOutcome::Row) => SQLSPAN_ROW,
        Ok(StepOutcome::Done) => SQLSPAN_DONE,
        Err(e) => error_status(&e),
    }
}

#[no_mangle]
pub unsafe extern "C" fn sqlspan_reset(stmt: u64) -> c_int {
    unit_status(bridge().reset(StmtToken::from_raw(stmt)))
}

#[no_mangle]
pub unsafe extern "C" fn sqlspan_clear_bindings(stmt: u64) -> c_int {
    unit_status(bridge().clear_bindings(StmtToken::from_raw(stmt)))
}

#[no_mangle]
pub unsafe extern "C" fn sqlspan_finalize(stmt: u64) -> c_int {
    unit_status(bridge().finalize(StmtToken::from_raw(stmt)))
}

// ---- parameter binding ----

#[no_mangle]
pub unsafe extern "C" fn sqlspan_bind_null(stmt: u64, index: i32) -> c_int {
    unit_status(bridge().bind_null(StmtToken::from_raw(stmt), index))
}

#[no_mangle]
pub unsafe extern "C" fn sqlspan_bind_int(stmt: u64, index: i32, value: i32) -> c_int {
    unit_status(bridge().bind_int(StmtToken::from_raw(stmt), index, value))
}

#[no_mangle]
pub unsafe extern "C" fn sqlspan_bind_int64(stmt: u64, index: i32, value: i64) -> c_int {
    unit_status(bridge().bind_int64(StmtToken::from_raw(stmt), index, value))
}

#[no_mangle]
pub unsafe extern "C" fn sqlspan_bind_double(stmt: u64, index: i32, value: f64) -> c_int {
    unit_status(bridge().bind_double(StmtToken::from_raw(stmt), index, value))
}

#[no_mangle]
pub unsafe extern "C" fn sqlspan_bind_text(stmt: u64, index: i32, value: *const c_char) -> c_int {
    let value = match c_text(value) {
        Ok(v) => v,
        Err(status) => return status,
    };
    unit_status(bridge().bind_text(StmtToken::from_raw(stmt), index, value))
}

#[no_mangle]
pub unsafe extern "C" fn sqlspan_bind_blob(
    stmt: u64,
    index: i32,
    value: *const u8,
    len: u32,
) -> c_int {
    let bytes = if len == 0 {
        &[][..]
    } else {
        if value.is_null() {
            return SQLSPAN_ERR_MISUSE;
        }
        std::slice::from_raw_parts(value, len as usize)
    };
    unit_status(bridge().bind_blob(StmtToken::from_raw(stmt), index, bytes))
}

// ---- column reads ----

#[no_mangle]
pub unsafe extern "C" fn sqlspan_column_count(stmt: u64, out_count: *mut i32) -> c_int {
    match bridge().column_count(StmtToken::from_raw(stmt)) {
        Ok(count) => write_out(out_count, count),
        Err(e) => error_status(&e),
    }
}

#[no_mangle]
pub unsafe extern "C" fn sqlspan_column_type(stmt: u64, index: i32, out_type: *mut c_int) -> c_int {
    match bridge().column_type(StmtToken::from_raw(stmt), index) {
        Ok(t) => {
            let code = match t {
                ColumnType::Integer => SQLSPAN_TYPE_INTEGER,
                ColumnType::Float => SQLSPAN_TYPE_FLOAT,
                ColumnType::Text => SQLSPAN_TYPE_TEXT,
                ColumnType::Blob => SQLSPAN_TYPE_BLOB,
                ColumnType::Null => SQLSPAN_TYPE_NULL,
            };
            write_out(out_type, code)
        }
        Err(e) => error_status(&e),
    }
}

#[no_mangle]
pub unsafe extern "C" fn sqlspan_column_is_null(stmt: u64, index: i32, out_null: *mut c_int) -> c_int {
    match bridge().column_is_null(StmtToken::from_raw(stmt), index) {
        Ok(is_null) => write_out(out_null, if is_null { 1 } else { 0 }),
        Err(e) => error_status(&e),
    }
}

#[no_mangle]
pub unsafe extern "C" fn sqlspan_column_int(stmt: u64, index: i32, out_value: *mut i32) -> c_int {
    match bridge().column_int(StmtToken::from_raw(stmt), index) {
        Ok(v) => write_out(out_value, v),
        Err(e) => error_status(&e),
    }
}

#[no_mangle]
pub unsafe extern "C" fn sqlspan_column_int64(stmt: u64, index: i32, out_value: *mut i64) -> c_int {
    match bridge().column_int64(StmtToken::from_raw(stmt), index) {
        Ok(v) => write_out(out_value, v),
        Err(e) => error_status(&e),
    }
}

#[no_mangle]
pub unsafe extern "C" fn sqlspan_column_double(stmt: u64, index: i32, out_value: *mut f64) -> c_int {
    match bridge().column_double(StmtToken::from_raw(stmt), index) {
        Ok(v) => write_out(out_value, v),
        Err(e) => error_status(&e),
    }
}

/// A NULL column reports success with `out_len = 0`; hosts distinguish it
/// from an empty string via `sqlspan_column_is_null`.
#[no_mangle]
pub unsafe extern "C" fn sqlspan_column_text(
    stmt: u64,
    index: i32,
    buf: *mut u8,
    cap: u32,
    out_len: *mut u32,
) -> c_int {
    match bridge().column_text(StmtToken::from_raw(stmt), index) {
        Ok(Some(text)) => copy_bytes(text.as_bytes(), buf, cap, out_len),
        Ok(None) => copy_bytes(&[], buf, cap, out_len),
        Err(e) => error_status(&e),
    }
}

#[no_mangle]
pub unsafe extern "C" fn sqlspan_column_blob(
    stmt: u64,
    index: i32,
    buf: *mut u8,
    cap: u32,
    out_len: *mut u32,
) -> c_int {
    match bridge().column_blob(StmtToken::from_raw(stmt), index) {
        Ok(Some(bytes)) => copy_bytes(&bytes, buf, cap, out_len),
        Ok(None) => copy_bytes(&[], buf, cap, out_len),
        Err(e) => error_status(&e),
    }
}

#[no_mangle]
pub unsafe extern "C" fn sqlspan_column_name(
    stmt: u64,
    index: i32,
    buf: *mut u8,
    cap: u32,
    out_len: *mut u32,
) -> c_int {
    match bridge().column_name(StmtToken::from_raw(stmt), index) {
        Ok(name) => copy_bytes(name.as_bytes(), buf, cap, out_len),
        Err(e) => error_status(&e),
    }
}

// ---- authorizer ----

/// Host authorizer in the C convention: returns 0 (allow), 1 (deny) or
/// 2 (ignore). Any other return degrades to deny, which fails the
/// triggering statement with a native authorization error observable
/// through `sqlspan_last_error_code`.
pub type SqlspanAuthorizer = unsafe extern "C" fn(
    user_data: *mut c_void,
    action: c_int,
    param1: *const c_char,
    param2: *const c_char,
    database: *const c_char,
    accessor: *const c_char,
) -> c_int;

struct CallbackData(*mut c_void);

unsafe impl Send for CallbackData {}
unsafe impl Sync for CallbackData {}

impl CallbackData {
    // the method receiver makes closures capture the wrapper, not the raw
    // pointer field, which would lose the Send + Sync impls
    fn ptr(&self) -> *mut c_void {
        self.0
    }
}

fn detail_cstring(s: Option<&str>) -> Option<CString> {
    s.and_then(|s| CString::new(s).ok())
}

fn detail_ptr(s: &Option<CString>) -> *const c_char {
    match s {
        Some(s) => s.as_ptr(),
        None => std::ptr::null(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn sqlspan_set_authorizer(
    conn: u64,
    callback: Option<SqlspanAuthorizer>,
    user_data: *mut c_void,
) -> c_int {
    let token = ConnToken::from_raw(conn);
    let res = match callback {
        None => bridge().set_authorizer(token, None),
        Some(cb) => {
            let data = CallbackData(user_data);
            let wrapped: AuthorizerFn = Box::new(move |ctx: &AuthContext<'_>| {
                let param1 = detail_cstring(ctx.param1);
                let param2 = detail_cstring(ctx.param2);
                let database = detail_cstring(ctx.database);
                let accessor = detail_cstring(ctx.accessor);
                let verdict = unsafe {
                    cb(
                        data.ptr(),
                        ctx.action,
                        detail_ptr(&param1),
                        detail_ptr(&param2),
                        detail_ptr(&database),
                        detail_ptr(&accessor),
                    )
                };
                match verdict {
                    0 => AuthVerdict::Allow,
                    2 => AuthVerdict::Ignore,
                    _ => AuthVerdict::Deny,
                }
            });
            bridge().set_authorizer(token, Some(wrapped))
        }
    };
    unit_status(res)
}
