//! Error taxonomy shared by every boundary operation.
//!
//! Four failure classes cross the bridge: native status codes passed
//! through with their message, stale-token resolution, host/native value
//! conversion failures, and host callbacks that misbehaved during native
//! re-entry. Stale-token and conversion failures are detected before any
//! native call is issued; they never reach the database library.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Connection,
    Statement,
}

impl HandleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HandleKind::Connection => "connection",
            HandleKind::Statement => "statement",
        }
    }
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// Native status code, passed through verbatim with the connection's
    /// last-error message when one was retrievable.
    Native { code: i32, message: Option<String> },
    /// A token was used after its resource was released.
    StaleHandle { kind: HandleKind },
    /// A host value could not be represented natively, or vice versa.
    Conversion(String),
    /// A host callback panicked during native re-entry. The check was
    /// answered with a deny verdict; the unwind never crossed C frames.
    CallbackPanic(String),
    /// A configured bridge limit was hit.
    LimitExceeded(&'static str),
}

impl BridgeError {
    /// Native status code, when this error carries one.
    pub fn native_code(&self) -> Option<i32> {
        match self {
            BridgeError::Native { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, BridgeError::StaleHandle { .. })
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::Native { code, message } => match message {
                Some(m) => write!(f, "native error {code}: {m}"),
                None => write!(f, "native error {code}"),
            },
            BridgeError::StaleHandle { kind } => {
                write!(f, "{kind} handle used after dispose")
            }
            BridgeError::Conversion(why) => write!(f, "conversion failed: {why}"),
            BridgeError::CallbackPanic(why) => {
                write!(f, "host callback panicked during native re-entry: {why}")
            }
            BridgeError::LimitExceeded(what) => write!(f, "limit exceeded: {what}"),
        }
    }
}

impl std::error::Error for BridgeError {}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_code_and_message() {
        let e = BridgeError::Native {
            code: 1,
            message: Some("no such table: missing".to_string()),
        };
        assert_eq!(format!("{e}"), "native error 1: no such table: missing");
        assert_eq!(e.native_code(), Some(1));

        let e = BridgeError::Native {
            code: 5,
            message: None,
        };
        assert_eq!(format!("{e}"), "native error 5");
    }

    #[test]
    fn stale_handle_names_the_kind() {
        let e = BridgeError::StaleHandle {
            kind: HandleKind::Statement,
        };
        assert!(e.is_stale());
        assert_eq!(format!("{e}"), "statement handle used after dispose");
    }
}
