//! Runs the generation pipeline in memory and reports what each model would produce.

use anyhow::{bail, Result};
use clap::Args;
use modelgen::discovery::load_models;
use modelgen_core::codegen::compile;
use modelgen_core::config::Config;
use modelgen_core::driver::UnitDriver;
use std::path::PathBuf;
use tracing::error;

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Manifests, or directories searched for manifests
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Also report whether the unit on disk is stale
    #[arg(long)]
    pub staleness: bool,
}

pub fn execute(args: CheckArgs, config: &Config, ignore: &[PathBuf]) -> Result<()> {
    let models = load_models(&args.paths, ignore)?;
    let mut failed = 0;
    for definition in models {
        let driver = UnitDriver::new(definition, config);
        let name = driver.definition().name.clone();
        let checked = compile(driver.definition(), &config.generator)
            .and_then(|model| driver.assemble().map(|unit| (model, unit)));
        let (model, unit) = match checked {
            Ok(checked) => checked,
            Err(e) => {
                error!(model = %name, "{e}");
                failed += 1;
                continue;
            }
        };
        let methods = model.methods.len();
        println!(
            "{name}: {methods} method(s), {:?} integration, {} line unit {}",
            model.plan,
            unit.text.lines().count(),
            unit.file_name
        );
        if args.staleness {
            let state = if driver.needs_regeneration()? {
                "stale"
            } else {
                "up to date"
            };
            println!("  {}: {state}", driver.unit_path().display());
        }
    }
    if failed > 0 {
        bail!("{failed} model(s) failed the check");
    }
    Ok(())
}
