pub mod build;
pub mod check;
pub mod generate;
pub mod list;
pub mod simulate;

use anyhow::{Context, Result};
use modelgen_core::config::Config;
use std::path::Path;
use tracing::debug;

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => {
            let config = Config::load(path)
                .with_context(|| format!("loading configuration {}", path.display()))?;
            debug!(path = %path.display(), "Loaded configuration");
            Ok(config)
        }
        None => Ok(Config::default()),
    }
}
