//! TOML configuration for a whole stacking run.
//!
//! ```toml
//! threads = 4
//!
//! [resample]
//! folds = 5
//! seed = 42
//!
//! [blend]
//! mixture = 1.0
//! non_negative = true
//! penalty = { kind = "explicit", values = [1e-4, 1e-3, 1e-2] }
//!
//! [refit]
//! renormalize = "preserve_total"
//!
//! [[candidates]]
//! kind = "ridge"
//! penalty = 0.1
//! ```
//!
//! Every section and field is optional; missing values take their defaults.

use crate::blend::BlendConfig;
use crate::models::BuiltinSpec;
use crate::partition::ResampleConfig;
use crate::refit::RefitConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse configuration file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    /// Worker threads; one per logical CPU when unset.
    pub threads: Option<usize>,
    pub resample: ResampleConfig,
    pub blend: BlendConfig,
    pub refit: RefitConfig,
    /// Built-in candidate specifications.
    pub candidates: Vec<BuiltinSpec>,
}

impl StackConfig {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        let config = Self::from_toml(&text)?;
        log::info!("Loaded configuration from '{path}'");
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }
}
