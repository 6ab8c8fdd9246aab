//! SQLite boundary adapter for the sqlspan bridge.
//!
//! Managed callers address native connections and prepared statements
//! through opaque `u64` tokens; the [`Bridge`] resolves tokens, converts
//! values between host and native representations, invokes SQLite, and
//! maps native statuses into structured errors. The `Bridge` is an
//! explicit context object: every boundary operation takes `&self`, and
//! the only process-global instance lives behind the C ABI in [`abi`].
//!
//! Concurrency model: every call blocks until SQLite returns. Connections
//! open in serialized mode (`SQLITE_OPEN_FULLMUTEX`), so operations on
//! different handles are unrestricted and concurrent calls on one
//! connection are individually safe, without any host-visible ordering
//! guarantee. Nothing at this layer is cancellable; a busy wait obeys only
//! the native busy timeout.

pub mod abi;
mod authorizer;
mod status;

pub use authorizer::{AuthContext, AuthVerdict, AuthorizerFn};
pub use sqlspan_core::error::{BridgeError, HandleKind, Result};
pub use status::StepOutcome;

use std::ffi::{c_char, c_int, CStr, CString};
use std::sync::Arc;

use libsqlite3_sys as sqlite;
use sqlspan_core::env_u32;
use sqlspan_core::registry::Registry;

use authorizer::AuthorizerSlot;
use status::{error_from_code, error_from_db, rc_ok};

// present in the bundled library but missing from the 0.30 pregenerated
// bindings
extern "C" {
    fn sqlite3_close_v2(db: *mut sqlite::sqlite3) -> c_int;
}

pub const ENV_BUSY_TIMEOUT_MS: &str = "SQLSPAN_BUSY_TIMEOUT_MS";
pub const ENV_MAX_LIVE_CONNS: &str = "SQLSPAN_MAX_LIVE_CONNS";

#[derive(Debug, Clone, Copy)]
pub struct BridgeConfig {
    /// Native busy timeout applied at open. 0 leaves the native default.
    pub busy_timeout_ms: u32,
    /// Open fails with `LimitExceeded` beyond this many live connections.
    /// 0 means unlimited.
    pub max_live_conns: u32,
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        BridgeConfig {
            busy_timeout_ms: env_u32(ENV_BUSY_TIMEOUT_MS, 0),
            max_live_conns: env_u32(ENV_MAX_LIVE_CONNS, 0),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            busy_timeout_ms: 0,
            max_live_conns: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnToken(u64);

impl ConnToken {
    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn from_raw(raw: u64) -> Self {
        ConnToken(raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StmtToken(u64);

impl StmtToken {
    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn from_raw(raw: u64) -> Self {
        StmtToken(raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Float,
    Text,
    Blob,
    Null,
}

impl ColumnType {
    fn from_native(t: c_int) -> ColumnType {
        match t {
            sqlite::SQLITE_INTEGER => ColumnType::Integer,
            sqlite::SQLITE_FLOAT => ColumnType::Float,
            sqlite::SQLITE_TEXT => ColumnType::Text,
            sqlite::SQLITE_BLOB => ColumnType::Blob,
            _ => ColumnType::Null,
        }
    }
}

#[derive(Clone, Copy)]
struct DbPtr(*mut sqlite::sqlite3);

unsafe impl Send for DbPtr {}
unsafe impl Sync for DbPtr {}

#[derive(Clone)]
struct ConnEntry {
    db: DbPtr,
    authorizer: Arc<AuthorizerSlot>,
}

#[derive(Clone, Copy)]
struct StmtPtr(*mut sqlite::sqlite3_stmt);

unsafe impl Send for StmtPtr {}
unsafe impl Sync for StmtPtr {}

#[derive(Clone)]
struct StmtEntry {
    stmt: StmtPtr,
    // back-reference for error retrieval; the statement does not own the
    // connection
    conn: ConnToken,
}

pub struct Bridge {
    conns: Registry<ConnEntry>,
    stmts: Registry<StmtEntry>,
    config: BridgeConfig,
}

fn text_to_c(text: &str, what: &str) -> Result<CString> {
    CString::new(text)
        .map_err(|_| BridgeError::Conversion(format!("{what} contains an interior NUL byte")))
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        Bridge {
            conns: Registry::new(),
            stmts: Registry::new(),
            config,
        }
    }

    pub fn from_env() -> Self {
        Bridge::new(BridgeConfig::from_env())
    }

    fn conn_entry(&self, token: ConnToken) -> Result<ConnEntry> {
        self.conns.get(token.0).ok_or(BridgeError::StaleHandle {
            kind: HandleKind::Connection,
        })
    }

    fn stmt_entry(&self, token: StmtToken) -> Result<StmtEntry> {
        self.stmts.get(token.0).ok_or(BridgeError::StaleHandle {
            kind: HandleKind::Statement,
        })
    }

    /// Builds the error for a failed native call on a connection. A panic
    /// recorded by the authorizer trampoline takes precedence over the raw
    /// native status it caused.
    fn conn_failure(&self, entry: &ConnEntry, rc: c_int) -> BridgeError {
        if let Some(note) = entry.authorizer.take_violation() {
            return BridgeError::CallbackPanic(note);
        }
        unsafe { error_from_db(entry.db.0, rc) }
    }

    fn stmt_failure(&self, entry: &StmtEntry, rc: c_int) -> BridgeError {
        match self.conns.get(entry.conn.0) {
            Some(conn) => self.conn_failure(&conn, rc),
            // owning connection already closed: generic text only
            None => error_from_code(rc),
        }
    }

    fn check_stmt_rc(&self, entry: &StmtEntry, rc: c_int) -> Result<()> {
        if rc_ok(rc) {
            Ok(())
        } else {
            Err(self.stmt_failure(entry, rc))
        }
    }

    // ---- connection lifecycle ----

    pub fn open(&self, path: &str) -> Result<ConnToken> {
        if self.config.max_live_conns != 0
            && self.conns.live_count() >= self.config.max_live_conns as usize
        {
            return Err(BridgeError::LimitExceeded("max live connections"));
        }
        let cpath = text_to_c(path, "database path")?;
        let mut db: *mut sqlite::sqlite3 = std::ptr::null_mut();
        let flags = sqlite::SQLITE_OPEN_READWRITE
            | sqlite::SQLITE_OPEN_CREATE
            | sqlite::SQLITE_OPEN_FULLMUTEX;
        let rc = unsafe { sqlite::sqlite3_open_v2(cpath.as_ptr(), &mut db, flags, std::ptr::null()) };
        if rc != sqlite::SQLITE_OK || db.is_null() {
            // capture the message before discarding the half-open handle
            let err = if db.is_null() {
                error_from_code(rc)
            } else {
                let err = unsafe { error_from_db(db, rc) };
                unsafe {
                    let _ = sqlite::sqlite3_close(db);
                }
                err
            };
            return Err(err);
        }
        if self.config.busy_timeout_ms != 0 {
            let ms = self.config.busy_timeout_ms.min(c_int::MAX as u32) as c_int;
            unsafe {
                let _ = sqlite::sqlite3_busy_timeout(db, ms);
            }
        }
        let entry = ConnEntry {
            db: DbPtr(db),
            authorizer: Arc::new(AuthorizerSlot::new()),
        };
        Ok(ConnToken(self.conns.insert(entry)))
    }

    pub fn open_in_memory(&self) -> Result<ConnToken> {
        self.open(":memory:")
    }

    /// Disposes the connection handle and its callback registration. The
    /// first close wins; closing an already-closed token is a no-op. Uses
    /// the deferred native close, so statements prepared on this connection
    /// stay independently disposable.
    pub fn close(&self, conn: ConnToken) -> Result<()> {
        let Some(entry) = self.conns.take(conn.0) else {
            return Ok(());
        };
        // deregister while the pointer is still valid; on the serialized
        // build this blocks until an in-flight authorizer check on another
        // thread has completed, so the trampoline is never freed mid-check
        unsafe { entry.authorizer.teardown_on_close(entry.db.0) };
        let rc = unsafe { sqlite3_close_v2(entry.db.0) };
        if rc_ok(rc) {
            Ok(())
        } else {
            Err(error_from_code(rc))
        }
    }

    // ---- statement lifecycle ----

    pub fn prepare(&self, conn: ConnToken, sql: &str) -> Result<StmtToken> {
        let entry = self.conn_entry(conn)?;
        let csql = text_to_c(sql, "sql text")?;
        let mut stmt: *mut sqlite::sqlite3_stmt = std::ptr::null_mut();
        let rc = unsafe {
            sqlite::sqlite3_prepare_v2(entry.db.0, csql.as_ptr(), -1, &mut stmt, std::ptr::null_mut())
        };
        if rc != sqlite::SQLITE_OK {
            if !stmt.is_null() {
                unsafe {
                    let _ = sqlite::sqlite3_finalize(stmt);
                }
            }
            return Err(self.conn_failure(&entry, rc));
        }
        if stmt.is_null() {
            // whitespace or comments: no resource exists, so no handle is minted
            return Err(BridgeError::Conversion(
                "sql text contains no statement".to_string(),
            ));
        }
        Ok(StmtToken(self.stmts.insert(StmtEntry {
            stmt: StmtPtr(stmt),
            conn,
        })))
    }

    pub fn step(&self, stmt: StmtToken) -> Result<StepOutcome> {
        let entry = self.stmt_entry(stmt)?;
        let rc = unsafe { sqlite::sqlite3_step(entry.stmt.0) };
        match rc {
            sqlite::SQLITE_ROW => Ok(StepOutcome::Row),
            sqlite::SQLITE_DONE => Ok(StepOutcome::Done),
            rc => Err(self.stmt_failure(&entry, rc)),
        }
    }

    pub fn reset(&self, stmt: StmtToken) -> Result<()> {
        let entry = self.stmt_entry(stmt)?;
        let rc = unsafe { sqlite::sqlite3_reset(entry.stmt.0) };
        self.check_stmt_rc(&entry, rc)
    }

    pub fn clear_bindings(&self, stmt: StmtToken) -> Result<()> {
        let entry = self.stmt_entry(stmt)?;
        let rc = unsafe { sqlite::sqlite3_clear_bindings(entry.stmt.0) };
        self.check_stmt_rc(&entry, rc)
    }

    /// Disposes the statement handle. Idempotent; the native finalize runs
    /// exactly once, before this returns.
    pub fn finalize(&self, stmt: StmtToken) -> Result<()> {
        let Some(entry) = self.stmts.take(stmt.0) else {
            return Ok(());
        };
        // rc reports the most recent evaluation error; the handle is
        // released either way
        let rc = unsafe { sqlite::sqlite3_finalize(entry.stmt.0) };
        self.check_stmt_rc(&entry, rc)
    }

    // ---- parameter binding (1-based indices, native convention) ----

    pub fn bind_null(&self, stmt: StmtToken, index: i32) -> Result<()> {
        let entry = self.stmt_entry(stmt)?;
        let rc = unsafe { sqlite::sqlite3_bind_null(entry.stmt.0, index) };
        self.check_stmt_rc(&entry, rc)
    }

    pub fn bind_int(&self, stmt: StmtToken, index: i32, value: i32) -> Result<()> {
        let entry = self.stmt_entry(stmt)?;
        let rc = unsafe { sqlite::sqlite3_bind_int(entry.stmt.0, index, value) };
        self.check_stmt_rc(&entry, rc)
    }

    pub fn bind_int64(&self, stmt: StmtToken, index: i32, value: i64) -> Result<()> {
        let entry = self.stmt_entry(stmt)?;
        let rc = unsafe { sqlite::sqlite3_bind_int64(entry.stmt.0, index, value) };
        self.check_stmt_rc(&entry, rc)
    }

    pub fn bind_double(&self, stmt: StmtToken, index: i32, value: f64) -> Result<()> {
        let entry = self.stmt_entry(stmt)?;
        let rc = unsafe { sqlite::sqlite3_bind_double(entry.stmt.0, index, value) };
        self.check_stmt_rc(&entry, rc)
    }

    pub fn bind_text(&self, stmt: StmtToken, index: i32, value: &str) -> Result<()> {
        let entry = self.stmt_entry(stmt)?;
        let len = c_len(value.len(), "text parameter")?;
        let rc = unsafe {
            sqlite::sqlite3_bind_text(
                entry.stmt.0,
                index,
                value.as_ptr() as *const c_char,
                len,
                sqlite::SQLITE_TRANSIENT(),
            )
        };
        self.check_stmt_rc(&entry, rc)
    }

    pub fn bind_blob(&self, stmt: StmtToken, index: i32, value: &[u8]) -> Result<()> {
        let entry = self.stmt_entry(stmt)?;
        let len = c_len(value.len(), "blob parameter")?;
        // an empty slice binds through zeroblob: handing SQLite a null (or
        // dangling) pointer would bind NULL instead of a zero-length blob
        let rc = if value.is_empty() {
            unsafe { sqlite::sqlite3_bind_zeroblob(entry.stmt.0, index, 0) }
        } else {
            unsafe {
                sqlite::sqlite3_bind_blob(
                    entry.stmt.0,
                    index,
                    value.as_ptr() as *const std::ffi::c_void,
                    len,
                    sqlite::SQLITE_TRANSIENT(),
                )
            }
        };
        self.check_stmt_rc(&entry, rc)
    }

    // ---- column reads (0-based indices, native convention) ----

    fn checked_column(&self, entry: &StmtEntry, index: i32) -> Result<c_int> {
        let count = unsafe { sqlite::sqlite3_column_count(entry.stmt.0) };
        if index < 0 || index >= count {
            return Err(BridgeError::Conversion(format!(
                "column index {index} out of range 0..{count}"
            )));
        }
        Ok(index)
    }

    pub fn column_count(&self, stmt: StmtToken) -> Result<i32> {
        let entry = self.stmt_entry(stmt)?;
        Ok(unsafe { sqlite::sqlite3_column_count(entry.stmt.0) })
    }

    pub fn column_type(&self, stmt: StmtToken, index: i32) -> Result<ColumnType> {
        let entry = self.stmt_entry(stmt)?;
        let idx = self.checked_column(&entry, index)?;
        Ok(ColumnType::from_native(unsafe {
            sqlite::sqlite3_column_type(entry.stmt.0, idx)
        }))
    }

    pub fn column_is_null(&self, stmt: StmtToken, index: i32) -> Result<bool> {
        Ok(self.column_type(stmt, index)? == ColumnType::Null)
    }

    pub fn column_name(&self, stmt: StmtToken, index: i32) -> Result<String> {
        let entry = self.stmt_entry(stmt)?;
        let idx = self.checked_column(&entry, index)?;
        let name = unsafe { sqlite::sqlite3_column_name(entry.stmt.0, idx) };
        if name.is_null() {
            return Err(BridgeError::Conversion(format!(
                "no name for column {index}"
            )));
        }
        Ok(unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned())
    }

    pub fn column_int(&self, stmt: StmtToken, index: i32) -> Result<i32> {
        let entry = self.stmt_entry(stmt)?;
        let idx = self.checked_column(&entry, index)?;
        Ok(unsafe { sqlite::sqlite3_column_int(entry.stmt.0, idx) })
    }

    pub fn column_int64(&self, stmt: StmtToken, index: i32) -> Result<i64> {
        let entry = self.stmt_entry(stmt)?;
        let idx = self.checked_column(&entry, index)?;
        Ok(unsafe { sqlite::sqlite3_column_int64(entry.stmt.0, idx) })
    }

    pub fn column_double(&self, stmt: StmtToken, index: i32) -> Result<f64> {
        let entry = self.stmt_entry(stmt)?;
        let idx = self.checked_column(&entry, index)?;
        Ok(unsafe { sqlite::sqlite3_column_double(entry.stmt.0, idx) })
    }

    /// `None` for SQL NULL; invalid UTF-8 is a conversion error, never a
    /// lossy coercion.
    pub fn column_text(&self, stmt: StmtToken, index: i32) -> Result<Option<String>> {
        let entry = self.stmt_entry(stmt)?;
        let idx = self.checked_column(&entry, index)?;
        unsafe {
            if sqlite::sqlite3_column_type(entry.stmt.0, idx) == sqlite::SQLITE_NULL {
                return Ok(None);
            }
            let ptr = sqlite::sqlite3_column_text(entry.stmt.0, idx);
            let n = sqlite::sqlite3_column_bytes(entry.stmt.0, idx);
            if ptr.is_null() || n <= 0 {
                return Ok(Some(String::new()));
            }
            let bytes = std::slice::from_raw_parts(ptr, n as usize);
            match std::str::from_utf8(bytes) {
                Ok(s) => Ok(Some(s.to_owned())),
                Err(_) => Err(BridgeError::Conversion(format!(
                    "column {index} text is not valid UTF-8"
                ))),
            }
        }
    }

    /// `None` for SQL NULL; a zero-length blob is `Some` of an empty vec.
    pub fn column_blob(&self, stmt: StmtToken, index: i32) -> Result<Option<Vec<u8>>> {
        let entry = self.stmt_entry(stmt)?;
        let idx = self.checked_column(&entry, index)?;
        unsafe {
            if sqlite::sqlite3_column_type(entry.stmt.0, idx) == sqlite::SQLITE_NULL {
                return Ok(None);
            }
            let ptr = sqlite::sqlite3_column_blob(entry.stmt.0, idx);
            let n = sqlite::sqlite3_column_bytes(entry.stmt.0, idx);
            if ptr.is_null() || n <= 0 {
                return Ok(Some(Vec::new()));
            }
            let bytes = std::slice::from_raw_parts(ptr as *const u8, n as usize);
            Ok(Some(bytes.to_vec()))
        }
    }

    // ---- connection-level operations ----

    /// Runs a batch of semicolon-separated statements, discarding rows.
    pub fn exec(&self, conn: ConnToken, sql: &str) -> Result<()> {
        let entry = self.conn_entry(conn)?;
        let csql = text_to_c(sql, "sql text")?;
        let mut errmsg: *mut c_char = std::ptr::null_mut();
        let rc = unsafe {
            sqlite::sqlite3_exec(
                entry.db.0,
                csql.as_ptr(),
                None,
                std::ptr::null_mut(),
                &mut errmsg,
            )
        };
        let message = if errmsg.is_null() {
            None
        } else {
            let m = unsafe { CStr::from_ptr(errmsg) }.to_string_lossy().into_owned();
            unsafe { sqlite::sqlite3_free(errmsg as *mut std::ffi::c_void) };
            Some(m)
        };
        if rc_ok(rc) {
            return Ok(());
        }
        if let Some(note) = entry.authorizer.take_violation() {
            return Err(BridgeError::CallbackPanic(note));
        }
        let code = unsafe { sqlite::sqlite3_extended_errcode(entry.db.0) };
        let code = if code != 0 { code } else { rc };
        Err(BridgeError::Native { code, message })
    }

    /// Installs, replaces, or clears (`None`) the connection's authorizer.
    /// See the slot protocol in [`authorizer`] for the replacement and
    /// disposal discipline.
    pub fn set_authorizer(&self, conn: ConnToken, callback: Option<AuthorizerFn>) -> Result<()> {
        let entry = self.conn_entry(conn)?;
        match callback {
            Some(cb) => unsafe { entry.authorizer.set(entry.db.0, cb) },
            None => unsafe { entry.authorizer.clear(entry.db.0) },
        }
    }

    pub fn last_error_code(&self, conn: ConnToken) -> Result<i32> {
        let entry = self.conn_entry(conn)?;
        Ok(unsafe { sqlite::sqlite3_extended_errcode(entry.db.0) })
    }

    pub fn last_error_message(&self, conn: ConnToken) -> Result<String> {
        let entry = self.conn_entry(conn)?;
        let msg = unsafe { sqlite::sqlite3_errmsg(entry.db.0) };
        if msg.is_null() {
            return Ok(String::new());
        }
        Ok(unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned())
    }

    pub fn changes(&self, conn: ConnToken) -> Result<i64> {
        let entry = self.conn_entry(conn)?;
        Ok(unsafe { sqlite::sqlite3_changes(entry.db.0) } as i64)
    }

    pub fn last_insert_rowid(&self, conn: ConnToken) -> Result<i64> {
        let entry = self.conn_entry(conn)?;
        Ok(unsafe { sqlite::sqlite3_last_insert_rowid(entry.db.0) })
    }

    pub fn busy_timeout(&self, conn: ConnToken, ms: u32) -> Result<()> {
        let entry = self.conn_entry(conn)?;
        let ms = ms.min(c_int::MAX as u32) as c_int;
        let rc = unsafe { sqlite::sqlite3_busy_timeout(entry.db.0, ms) };
        if rc_ok(rc) {
            Ok(())
        } else {
            Err(self.conn_failure(&entry, rc))
        }
    }

    pub fn live_connections(&self) -> usize {
        self.conns.live_count()
    }
}

fn c_len(len: usize, what: &str) -> Result<c_int> {
    c_int::try_from(len)
        .map_err(|_| BridgeError::Conversion(format!("{what} exceeds the native length limit")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_type_mapping_covers_native_codes() {
        assert_eq!(ColumnType::from_native(sqlite::SQLITE_INTEGER), ColumnType::Integer);
        assert_eq!(ColumnType::from_native(sqlite::SQLITE_FLOAT), ColumnType::Float);
        assert_eq!(ColumnType::from_native(sqlite::SQLITE_TEXT), ColumnType::Text);
        assert_eq!(ColumnType::from_native(sqlite::SQLITE_BLOB), ColumnType::Blob);
        assert_eq!(ColumnType::from_native(sqlite::SQLITE_NULL), ColumnType::Null);
    }

    #[test]
    fn interior_nul_is_a_conversion_error_before_any_native_call() {
        let bridge = Bridge::new(BridgeConfig::default());
        let err = bridge.open("bad\0path").unwrap_err();
        assert!(matches!(err, BridgeError::Conversion(_)));
    }

    #[test]
    fn config_reads_env() {
        std::env::set_var(ENV_BUSY_TIMEOUT_MS, "1500");
        std::env::set_var(ENV_MAX_LIVE_CONNS, "3");
        let cfg = BridgeConfig::from_env();
        assert_eq!(cfg.busy_timeout_ms, 1500);
        assert_eq!(cfg.max_live_conns, 3);
        std::env::remove_var(ENV_BUSY_TIMEOUT_MS);
        std::env::remove_var(ENV_MAX_LIVE_CONNS);
    }
}
