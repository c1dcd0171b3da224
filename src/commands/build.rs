//! Generates units and compiles them with the configured toolchain.

use anyhow::{bail, Result};
use clap::Args;
use modelgen::discovery::load_models;
use modelgen_core::config::Config;
use modelgen_core::driver::UnitDriver;
use modelgen_core::toolchain::CommandToolchain;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Manifests, or directories searched for manifests
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Compiler program, overriding the configured toolchain
    #[arg(long)]
    pub compiler: Option<String>,

    /// Stop at the first model that fails
    #[arg(long)]
    pub fail_fast: bool,
}

pub fn execute(args: BuildArgs, config: &Config, ignore: &[PathBuf]) -> Result<()> {
    let models = load_models(&args.paths, ignore)?;
    if models.is_empty() {
        bail!("no model manifests found");
    }
    let override_toolchain = args.compiler.as_deref().map(CommandToolchain::new);

    let mut failed = 0;
    for definition in models {
        let driver = UnitDriver::new(definition, config);
        let result = match &override_toolchain {
            Some(toolchain) => driver.build(toolchain),
            None => driver.build(config.build.toolchain.as_ref()),
        };
        match result {
            Ok(artifact) => println!("{}", artifact.display()),
            Err(e) => {
                error!(model = %driver.definition().name, "{e}");
                if args.fail_fast {
                    return Err(e.into());
                }
                failed += 1;
            }
        }
    }
    if failed > 0 {
        bail!("{failed} model(s) failed to build");
    }
    info!("Build finished");
    Ok(())
}
