//! Token to pool bindings.
//!
//! The binding file maps each bearer token to either `*` (any pool) or a
//! comma-separated list of pool names:
//!
//! ```yaml
//! ci-prod-token: "*"
//! team-a-token: "p0,p1"
//! ```
use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};

/// The token→pools allow-map consulted by the auth middleware
#[derive(Debug, Clone, Default)]
pub struct Tokens {
    bindings: HashMap<String, String>,
}

impl Tokens {
    /// Load bindings from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read tokens file {}", path.display()))?;
        let bindings: HashMap<String, String> = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse tokens file {}", path.display()))?;
        Ok(Self { bindings })
    }

    pub fn from_bindings(bindings: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            bindings: bindings.into_iter().collect(),
        }
    }

    /// The pool binding for `token`, `None` when the token is unknown or
    /// bound to nothing
    pub fn pools_for(&self, token: &str) -> Option<String> {
        let pools = self.bindings.get(token)?.trim();
        if pools.is_empty() {
            return None;
        }
        Some(pools.to_owned())
    }
}
