//! Environment variable helpers used by `EngineConfig::from_env` and the
//! echo host.
//!
//! ```ignore
//! use regio_core::env::{env_get, env_get_bool};
//!
//! let connections: usize = env_get("REGIO_CONNECTIONS", 1024);
//! let nagle = env_get_bool("REGIO_NAGLE", false);
//! ```

use std::str::FromStr;

/// Parse `key` as `T`; unset or unparsable values yield `default`.
#[inline]
pub fn env_get<T: FromStr>(key: &str, default: T) -> T {
    env_get_opt(key).unwrap_or(default)
}

/// Parse `key` as `T`, `None` when unset or unparsable.
#[inline]
pub fn env_get_opt<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// "1", "true", "yes", "on" are true and "0", "false", "no", "off" false
/// (case-insensitive). Anything else, or unset, yields `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[inline]
pub fn env_is_set(key: &str) -> bool {
    std::env::var_os(key).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_yields_default() {
        let v: usize = env_get("__REGIO_TEST_UNSET__", 42);
        assert_eq!(v, 42);
        assert!(!env_is_set("__REGIO_TEST_UNSET__"));
        assert_eq!(env_get_str("__REGIO_TEST_UNSET__", "x"), "x");
    }

    #[test]
    fn test_parse_and_bool() {
        std::env::set_var("__REGIO_TEST_NUM__", " 17 ");
        std::env::set_var("__REGIO_TEST_BOOL__", "Off");
        std::env::set_var("__REGIO_TEST_BAD__", "maybe");
        assert_eq!(env_get::<u32>("__REGIO_TEST_NUM__", 0), 17);
        assert!(!env_get_bool("__REGIO_TEST_BOOL__", true));
        assert!(env_get_bool("__REGIO_TEST_BAD__", true));
        assert_eq!(env_get_opt::<u32>("__REGIO_TEST_BAD__"), None);
    }
}
