//! External processing backends.
//!
//! Backends are opaque: the pipeline only assembles their inputs and reads
//! back their outputs.

mod external;
mod store;
mod traits;

pub use external::*;
pub use store::*;
pub use traits::*;

use crate::models::{Config, ConfigError};
use std::sync::Arc;

/// One handle per backend role.
#[derive(Clone)]
pub struct Backends {
    pub indexer: Arc<dyn Indexer>,
    pub refiner: Arc<dyn Refiner>,
    pub integrater: Arc<dyn Integrater>,
    pub scaler: Arc<dyn Scaler>,
}

impl Backends {
    /// Build external-process backends from configuration.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        config.require_backends()?;
        let command = |name: &str, cfg: &Option<crate::models::CommandConfig>| {
            cfg.as_ref()
                .map(|c| Arc::new(ExternalCommand::new(name, c)))
                .ok_or_else(|| ConfigError::MissingBackend(name.to_string()))
        };
        Ok(Self {
            indexer: command("indexer", &config.backends.indexer)?,
            refiner: command("refiner", &config.backends.refiner)?,
            integrater: command("integrater", &config.backends.integrater)?,
            scaler: command("scaler", &config.backends.scaler)?,
        })
    }
}
