//! Engine-independent core of the sqlspan bridge.
//!
//! Holds everything that does not touch a database library: the
//! generation-tagged handle registry, the bridge error taxonomy, and the
//! env-var helpers the engine adapters read their configuration with.

pub mod error;
pub mod registry;

pub fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|v| match v.as_str() {
            "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
            "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

pub fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_bool_accepts_common_spellings() {
        std::env::set_var("SQLSPAN_TEST_BOOL", "YES");
        assert!(env_bool("SQLSPAN_TEST_BOOL", false));
        std::env::set_var("SQLSPAN_TEST_BOOL", "0");
        assert!(!env_bool("SQLSPAN_TEST_BOOL", true));
        std::env::set_var("SQLSPAN_TEST_BOOL", "maybe");
        assert!(env_bool("SQLSPAN_TEST_BOOL", true));
        std::env::remove_var("SQLSPAN_TEST_BOOL");
        assert!(!env_bool("SQLSPAN_TEST_BOOL", false));
    }

    #[test]
    fn env_u32_parses_and_falls_back() {
        std::env::set_var("SQLSPAN_TEST_U32", "250");
        assert_eq!(env_u32("SQLSPAN_TEST_U32", 7), 250);
        std::env::set_var("SQLSPAN_TEST_U32", "0");
        assert_eq!(env_u32("SQLSPAN_TEST_U32", 7), 0);
        std::env::set_var("SQLSPAN_TEST_U32", "not a number");
        assert_eq!(env_u32("SQLSPAN_TEST_U32", 7), 7);
        std::env::remove_var("SQLSPAN_TEST_U32");
        assert_eq!(env_u32("SQLSPAN_TEST_U32", 7), 7);
    }
}
