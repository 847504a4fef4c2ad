//! Environment lookups with typed defaults.

use std::str::FromStr;

/// `key` parsed as `T`, or `default` when unset or unparsable.
#[inline]
pub fn env_get<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Accepts "1", "true", "yes", "on" and "0", "false", "no", "off"
/// (case-insensitive); anything else yields `default`.
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
pub fn env_get_opt<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let v: u32 = env_get("__BEEP_TEST_UNSET_VAR", 17);
        assert_eq!(v, 17);
    }

    #[test]
    fn test_env_get_parses() {
        std::env::set_var("__BEEP_TEST_NUM", " 42 ");
        let v: usize = env_get("__BEEP_TEST_NUM", 0);
        assert_eq!(v, 42);
        std::env::set_var("__BEEP_TEST_NUM_BAD", "forty");
        let v: usize = env_get("__BEEP_TEST_NUM_BAD", 3);
        assert_eq!(v, 3);
    }

    #[test]
    fn test_env_get_bool() {
        std::env::set_var("__BEEP_TEST_BOOL_ON", "Yes");
        std::env::set_var("__BEEP_TEST_BOOL_OFF", "off");
        std::env::set_var("__BEEP_TEST_BOOL_JUNK", "maybe");
        assert!(env_get_bool("__BEEP_TEST_BOOL_ON", false));
        assert!(!env_get_bool("__BEEP_TEST_BOOL_OFF", true));
        assert!(env_get_bool("__BEEP_TEST_BOOL_JUNK", true));
        assert!(!env_get_bool("__BEEP_TEST_BOOL_UNSET", false));
    }

    #[test]
    fn test_env_get_opt() {
        std::env::set_var("__BEEP_TEST_OPT", "9");
        assert_eq!(env_get_opt::<u8>("__BEEP_TEST_OPT"), Some(9));
        assert_eq!(env_get_opt::<u8>("__BEEP_TEST_OPT_UNSET"), None);
    }
}
