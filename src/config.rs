use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Tuning knobs for an opened store. Loaded from defaults, an optional
/// `formstore.toml`, and `FORMSTORE_*` environment variables, in that
/// order of increasing precedence.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StoreConfig {
    pub busy_timeout_ms: u64,
    pub attachments_root: Option<PathBuf>,
}

impl StoreConfig {
    const MAX_BUSY_TIMEOUT_MS: u64 = 60_000;
    const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

    pub fn load(config_file: Option<&Path>) -> Self {
        let mut figment = Figment::from(Serialized::defaults(StoreConfig::default()));
        if let Some(path) = config_file {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("FORMSTORE_"));

        let mut config: StoreConfig = match figment.extract() {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Config error: {e} - using defaults");
                StoreConfig::default()
            }
        };
        config.ensure_valid();
        config
    }

    fn ensure_valid(&mut self) {
        if self.busy_timeout_ms > Self::MAX_BUSY_TIMEOUT_MS {
            eprintln!(
                "Config error: busy_timeout_ms of '{}' is invalid - using default of '{}'",
                self.busy_timeout_ms,
                Self::DEFAULT_BUSY_TIMEOUT_MS
            );
            self.busy_timeout_ms = Self::DEFAULT_BUSY_TIMEOUT_MS;
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            busy_timeout_ms: Self::DEFAULT_BUSY_TIMEOUT_MS,
            attachments_root: None,
        }
    }
}
