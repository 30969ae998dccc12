//! environment variable parsing helpers
use std::env;
use std::str::FromStr;

use anyhow::{Context, Result};

/// Read `name` from the environment, falling back to `default` when unset.
/// Parse failures are returned, not swallowed.
pub fn parse_var_with_err<T>(name: &str, default: &str) -> Result<T>
where
    T: FromStr,
    <T as FromStr>::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = match env::var(name) {
        Ok(val) => val,
        Err(env::VarError::NotPresent) => default.to_owned(),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read env var {name}"));
        }
    };
    raw.parse()
        .with_context(|| format!("failed to parse env var {name}={raw}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_used_when_unset() {
        let val: String = parse_var_with_err("OFCIR_TEST_UNSET_VAR", "fallback").unwrap();
        assert_eq!(val, "fallback");
    }

    #[test]
    fn parses_typed_values() {
        let val: u16 = parse_var_with_err("OFCIR_TEST_UNSET_PORT", "8087").unwrap();
        assert_eq!(val, 8087);
    }
}
