//! Environment variable helpers
//!
//! Runtime knobs are read from `EFFEX_*` variables. Parsing never fails
//! loudly: an unset or malformed variable falls back to the default.
//!
//! ```ignore
//! use effex_core::env::{env_get, env_get_duration_ms};
//!
//! let workers: usize = env_get("EFFEX_WORKERS", 4);
//! let park = env_get_duration_ms("EFFEX_PARK_TIMEOUT_MS", Duration::from_millis(10));
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Get an environment variable parsed as `T`, or `default`
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Get an environment variable parsed as `T`, if set and well-formed
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Get an environment variable as a boolean
///
/// "1", "true", "yes" and "on" (any case) are true; "0", "false", "no" and
/// "off" are false; anything else yields `default`.
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Get an environment variable holding milliseconds as a `Duration`
pub fn env_get_duration_ms(key: &str, default: Duration) -> Duration {
    env_get_opt::<u64>(key)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

/// Get an environment variable as a string, or `default`
#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_uses_default() {
        let val: usize = env_get("__EFFEX_TEST_UNSET__", 42);
        assert_eq!(val, 42);
        assert_eq!(env_get_opt::<u32>("__EFFEX_TEST_UNSET__"), None);
        assert_eq!(env_get_str("__EFFEX_TEST_UNSET__", "info"), "info");
        assert!(env_get_bool("__EFFEX_TEST_UNSET__", true));
    }

    #[test]
    fn test_parse_and_trim() {
        std::env::set_var("__EFFEX_TEST_NUM__", " 12 ");
        assert_eq!(env_get::<usize>("__EFFEX_TEST_NUM__", 0), 12);
        assert_eq!(
            env_get_duration_ms("__EFFEX_TEST_NUM__", Duration::ZERO),
            Duration::from_millis(12)
        );
        std::env::remove_var("__EFFEX_TEST_NUM__");
    }

    #[test]
    fn test_malformed_falls_back() {
        std::env::set_var("__EFFEX_TEST_BAD__", "twelve");
        assert_eq!(env_get::<usize>("__EFFEX_TEST_BAD__", 3), 3);
        assert_eq!(
            env_get_duration_ms("__EFFEX_TEST_BAD__", Duration::from_millis(5)),
            Duration::from_millis(5)
        );
        std::env::remove_var("__EFFEX_TEST_BAD__");
    }

    #[test]
    fn test_bool_variants() {
        for (raw, expected) in [("1", true), ("TRUE", true), ("on", true), ("no", false), ("off", false)] {
            std::env::set_var("__EFFEX_TEST_BOOL__", raw);
            assert_eq!(env_get_bool("__EFFEX_TEST_BOOL__", !expected), expected, "{}", raw);
        }
        std::env::set_var("__EFFEX_TEST_BOOL__", "maybe");
        assert!(env_get_bool("__EFFEX_TEST_BOOL__", true));
        std::env::remove_var("__EFFEX_TEST_BOOL__");
    }
}
