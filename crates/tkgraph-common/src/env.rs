//! Environment-variable tunables
//!
//! Every tunable has a default. A variable that is set but cannot be parsed
//! is an error rather than a silent fallback, so a typo in an operator's
//! environment surfaces at startup.

use crate::error::{CommonError, Result};
use std::fmt::Display;
use std::str::FromStr;

/// Read `key` and parse it, falling back to `default` when it is unset or empty.
pub fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env_opt(key)? {
        Some(value) => Ok(value),
        None => Ok(default),
    }
}

/// Read and parse `key` if it is set to a non-empty value.
pub fn env_opt<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => parse_value(key, &raw).map(Some),
        Ok(_) | Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(CommonError::InvalidEnvValue {
            key: key.to_string(),
            value: "<non-unicode>".to_string(),
            reason: "value is not valid UTF-8".to_string(),
        }),
    }
}

/// Read `key` as a string, falling back to `default`.
pub fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| CommonError::InvalidEnvValue {
            key: key.to_string(),
            value: raw.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_value_trims_whitespace() {
        let value: u32 = parse_value("TEST_KEY", " 42 ").unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_parse_value_reports_key() {
        let err = parse_value::<f64>("TKGRAPH_TEST_TIMEOUT", "soon").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("TKGRAPH_TEST_TIMEOUT"));
        assert!(message.contains("soon"));
    }

    #[test]
    fn test_env_or_uses_default_when_unset() {
        let value: usize = env_or("TKGRAPH_TEST_DEFINITELY_UNSET_VAR", 7).unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_env_string_default() {
        assert_eq!(env_string("TKGRAPH_TEST_DEFINITELY_UNSET_STR", "neo4j"), "neo4j");
    }
}
