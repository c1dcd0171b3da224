//! Writes the generated unit of every model that is missing or stale.

use anyhow::{bail, Result};
use clap::Args;
use modelgen::discovery::load_models;
use modelgen_core::config::Config;
use modelgen_core::driver::UnitDriver;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Args, Debug)]
pub struct GenerateArgs {
    /// Manifests, or directories searched for manifests
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Regenerate even when the unit is up to date
    #[arg(long)]
    pub force: bool,
}

pub fn execute(args: GenerateArgs, config: &Config, ignore: &[PathBuf]) -> Result<()> {
    let models = load_models(&args.paths, ignore)?;
    if models.is_empty() {
        bail!("no model manifests found");
    }

    let mut failed = 0;
    let mut written = 0;
    for definition in models {
        let driver = UnitDriver::new(definition, config);
        let result = if args.force {
            driver.assemble().and_then(|unit| {
                driver.write_support_headers()?;
                driver.write(&unit)?;
                Ok(true)
            })
        } else {
            driver.refresh()
        };
        match result {
            Ok(true) => written += 1,
            Ok(false) => {}
            Err(e) => {
                error!(model = %driver.definition().name, "{e}");
                failed += 1;
            }
        }
    }
    info!(written, failed, "Generation finished");
    if failed > 0 {
        bail!("{failed} model(s) failed to generate");
    }
    Ok(())
}
