use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{HuskError, HuskResult};

/// Key-setup configuration (the `[keys]` section of huskfs.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeySetupConfig {
    /// Keyring name prefix for wrapping-key lookups (default: "huskfs:")
    pub key_prefix: String,
    /// Warn when a keyring entry exists but its payload is malformed
    /// (default: true)
    #[serde(default = "default_true")]
    pub warn_malformed_keys: bool,
}

fn default_true() -> bool {
    true
}

impl Default for KeySetupConfig {
    fn default() -> Self {
        Self {
            key_prefix: "huskfs:".into(),
            warn_malformed_keys: true,
        }
    }
}

impl KeySetupConfig {
    pub fn load(path: &Path) -> HuskResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| HuskError::Config(format!("{}: {e}", path.display())))
    }
}
