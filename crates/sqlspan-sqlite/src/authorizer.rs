//! Per-connection authorizer callback slot and its native trampoline.
//!
//! The slot holds at most one active host callback. The callback crosses
//! into native code as a `Trampoline` record: SQLite keeps an opaque
//! capability pointer to it (one leaked `Arc` strong reference as
//! `user_data`) and re-enters the host through `authorizer_trampoline`,
//! possibly on a thread the host never saw. Replacement and teardown
//! dispose the previous record exactly once, and only after the native
//! library has acknowledged the new registration.

use std::any::Any;
use std::ffi::{c_char, c_int, c_void, CStr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use libsqlite3_sys as sqlite;
use sqlspan_core::error::Result;

use crate::status::error_from_db;

/// Verdict of one authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthVerdict {
    /// Allow the action.
    Allow,
    /// Abort the whole statement with an authorization error.
    Deny,
    /// Treat the touched column as NULL / skip the action.
    Ignore,
}

impl AuthVerdict {
    fn as_native(self) -> c_int {
        match self {
            AuthVerdict::Allow => sqlite::SQLITE_OK,
            AuthVerdict::Deny => sqlite::SQLITE_DENY,
            AuthVerdict::Ignore => sqlite::SQLITE_IGNORE,
        }
    }
}

/// Arguments of one authorization check: the action code and up to four
/// detail strings, borrowed from native memory for the duration of the
/// call. Detail strings that are absent or not valid UTF-8 arrive as
/// `None`; a malformed detail must never abort the check itself.
#[derive(Debug)]
pub struct AuthContext<'a> {
    pub action: i32,
    pub param1: Option<&'a str>,
    pub param2: Option<&'a str>,
    pub database: Option<&'a str>,
    pub accessor: Option<&'a str>,
}

/// Host callback invoked from native re-entry. Runs on whatever thread
/// SQLite is executing on.
pub type AuthorizerFn = Box<dyn Fn(&AuthContext<'_>) -> AuthVerdict + Send + Sync>;

struct Trampoline {
    callback: AuthorizerFn,
    // set when the callback panicked inside a check; consumed by the next
    // failing operation on the connection
    panic_note: Mutex<Option<String>>,
}

pub(crate) struct AuthorizerSlot {
    active: Mutex<Option<Arc<Trampoline>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl AuthorizerSlot {
    pub(crate) fn new() -> Self {
        AuthorizerSlot {
            active: Mutex::new(None),
        }
    }

    /// Installs a new callback. The native registration runs first; only
    /// once it returns successfully is the previous record disposed and the
    /// slot rewritten. On native failure the slot is untouched and the old
    /// callback remains fully installed.
    ///
    /// An in-flight check always completes against the trampoline captured
    /// at its invocation: the native-held reference is released only after
    /// `sqlite3_set_authorizer` returns, and on a serialized build that
    /// call cannot overlap a check running on the same connection.
    ///
    /// # Safety
    /// `db` must be a valid connection pointer.
    pub(crate) unsafe fn set(&self, db: *mut sqlite::sqlite3, callback: AuthorizerFn) -> Result<()> {
        let mut active = lock(&self.active);
        let tramp = Arc::new(Trampoline {
            callback,
            panic_note: Mutex::new(None),
        });
        let user = Arc::into_raw(Arc::clone(&tramp)) as *mut c_void;
        let rc = register_native(db, user);
        if rc != sqlite::SQLITE_OK {
            // reclaim the reference we leaked for the failed registration
            drop(Arc::from_raw(user as *const Trampoline));
            return Err(error_from_db(db, rc));
        }
        if let Some(old) = active.take() {
            dispose(old);
        }
        *active = Some(tramp);
        Ok(())
    }

    /// Deregisters natively, then disposes the stored record. A clear on an
    /// empty slot is a no-op.
    ///
    /// # Safety
    /// `db` must be a valid connection pointer.
    pub(crate) unsafe fn clear(&self, db: *mut sqlite::sqlite3) -> Result<()> {
        let mut active = lock(&self.active);
        if active.is_none() {
            return Ok(());
        }
        let rc = sqlite::sqlite3_set_authorizer(db, None, std::ptr::null_mut());
        if rc != sqlite::SQLITE_OK {
            return Err(error_from_db(db, rc));
        }
        if let Some(old) = active.take() {
            dispose(old);
        }
        Ok(())
    }

    /// Disposal when the owning connection is closing. Deregisters natively
    /// first: on the serialized build that call blocks on the connection
    /// mutex until an in-flight check has completed, so the record is never
    /// freed under a running trampoline. Best effort; close proceeds
    /// regardless of the deregistration status.
    ///
    /// # Safety
    /// `db` must be a valid connection pointer whenever a callback is
    /// installed.
    pub(crate) unsafe fn teardown_on_close(&self, db: *mut sqlite::sqlite3) {
        let mut active = lock(&self.active);
        let Some(old) = active.take() else {
            return;
        };
        let _ = sqlite::sqlite3_set_authorizer(db, None, std::ptr::null_mut());
        dispose(old);
    }

    /// Consumes a recorded callback panic, if one happened since the last
    /// call.
    pub(crate) fn take_violation(&self) -> Option<String> {
        let active = lock(&self.active);
        active.as_ref().and_then(|t| lock(&t.panic_note).take())
    }
}

#[cfg(test)]
static FAIL_NEXT_REGISTRATION: std::sync::atomic::AtomicBool =
    std::sync::atomic::AtomicBool::new(false);

/// The one native registration call. Tests can force the next call to fail
/// to exercise the rollback path in [`AuthorizerSlot::set`].
unsafe fn register_native(db: *mut sqlite::sqlite3, user: *mut c_void) -> c_int {
    #[cfg(test)]
    {
        if FAIL_NEXT_REGISTRATION.swap(false, std::sync::atomic::Ordering::SeqCst) {
            return sqlite::SQLITE_NOMEM;
        }
    }
    sqlite::sqlite3_set_authorizer(db, Some(authorizer_trampoline), user)
}

/// Releases both references to a replaced record: the slot's own and the
/// one leaked to native code at registration time. Called only after the
/// native library acknowledged that the record is no longer registered.
fn dispose(old: Arc<Trampoline>) {
    unsafe { Arc::decrement_strong_count(Arc::as_ptr(&old)) };
    drop(old);
}

unsafe fn opt_str<'a>(p: *const c_char) -> Option<&'a str> {
    if p.is_null() {
        return None;
    }
    CStr::from_ptr(p).to_str().ok()
}

fn panic_text(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

/// The native re-entry point. `user` is the capability pointer handed to
/// SQLite at registration; it is borrowed here, never consumed. A panic in
/// the host callback is caught, recorded on the trampoline, and answered
/// with a deny verdict so the unwind never crosses native frames.
unsafe extern "C" fn authorizer_trampoline(
    user: *mut c_void,
    action: c_int,
    param1: *const c_char,
    param2: *const c_char,
    database: *const c_char,
    accessor: *const c_char,
) -> c_int {
    let tramp = &*(user as *const Trampoline);
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let ctx = AuthContext {
            action,
            param1: opt_str(param1),
            param2: opt_str(param2),
            database: opt_str(database),
            accessor: opt_str(accessor),
        };
        (tramp.callback)(&ctx)
    }));
    match outcome {
        Ok(verdict) => verdict.as_native(),
        Err(payload) => {
            *lock(&tramp.panic_note) = Some(panic_text(payload));
            sqlite::SQLITE_DENY
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::sync::atomic::{AtomicUsize, Ordering};

    unsafe fn open_raw() -> *mut sqlite::sqlite3 {
        let path = CString::new(":memory:").unwrap();
        let mut db = std::ptr::null_mut();
        let flags = sqlite::SQLITE_OPEN_READWRITE
            | sqlite::SQLITE_OPEN_CREATE
            | sqlite::SQLITE_OPEN_FULLMUTEX;
        let rc = sqlite::sqlite3_open_v2(path.as_ptr(), &mut db, flags, std::ptr::null());
        assert_eq!(rc, sqlite::SQLITE_OK);
        db
    }

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn verdicts_map_to_native_convention() {
        assert_eq!(AuthVerdict::Allow.as_native(), sqlite::SQLITE_OK);
        assert_eq!(AuthVerdict::Deny.as_native(), sqlite::SQLITE_DENY);
        assert_eq!(AuthVerdict::Ignore.as_native(), sqlite::SQLITE_IGNORE);
    }

    #[test]
    fn teardown_on_empty_slot_is_a_noop() {
        let slot = AuthorizerSlot::new();
        unsafe {
            slot.teardown_on_close(std::ptr::null_mut());
            slot.teardown_on_close(std::ptr::null_mut());
        }
        assert!(slot.take_violation().is_none());
    }

    #[test]
    fn failed_registration_keeps_the_old_callback_installed() {
        unsafe {
            let db = open_raw();
            let slot = AuthorizerSlot::new();

            let checks = Arc::new(AtomicUsize::new(0));
            let drops_old = Arc::new(AtomicUsize::new(0));
            let seen = Arc::clone(&checks);
            let counter = DropCounter(Arc::clone(&drops_old));
            slot.set(
                db,
                Box::new(move |_| {
                    let _ = &counter;
                    seen.fetch_add(1, Ordering::SeqCst);
                    AuthVerdict::Allow
                }),
            )
            .unwrap();

            let drops_new = Arc::new(AtomicUsize::new(0));
            let counter = DropCounter(Arc::clone(&drops_new));
            FAIL_NEXT_REGISTRATION.store(true, std::sync::atomic::Ordering::SeqCst);
            let err = slot
                .set(
                    db,
                    Box::new(move |_| {
                        let _ = &counter;
                        AuthVerdict::Deny
                    }),
                )
                .unwrap_err();
            assert!(err.native_code().is_some());

            // the old record survives untouched; the rejected one is fully
            // reclaimed
            assert_eq!(drops_old.load(Ordering::SeqCst), 0);
            assert_eq!(drops_new.load(Ordering::SeqCst), 1);

            // the old callback still observes checks
            let before = checks.load(Ordering::SeqCst);
            let sql = CString::new("CREATE TABLE t (x)").unwrap();
            let rc = sqlite::sqlite3_exec(
                db,
                sql.as_ptr(),
                None,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            );
            assert_eq!(rc, sqlite::SQLITE_OK);
            assert!(checks.load(Ordering::SeqCst) > before);

            slot.clear(db).unwrap();
            assert_eq!(drops_old.load(Ordering::SeqCst), 1);
            let _ = sqlite::sqlite3_close(db);
        }
    }

    #[test]
    fn panic_text_prefers_string_payloads() {
        assert_eq!(panic_text(Box::new("boom")), "boom");
        assert_eq!(panic_text(Box::new("boom".to_string())), "boom");
        assert_eq!(panic_text(Box::new(17u32)), "opaque panic payload");
    }
}
