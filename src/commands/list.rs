//! Lists the bundled models, optionally writing them to disk.

use anyhow::Result;
use clap::Args;
use modelgen_models::{bundled, materialize, names};
use std::path::PathBuf;
use tracing::info;

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Write every bundled model below this directory
    #[arg(long, value_name = "DIR")]
    pub materialize: Option<PathBuf>,
}

pub fn execute(args: ListArgs) -> Result<()> {
    for name in names() {
        let model = bundled(name)?;
        if model.requires.is_empty() {
            println!("{name}");
        } else {
            println!("{name} (uses {})", model.requires.join(", "));
        }
        if let Some(dir) = &args.materialize {
            let manifest = materialize(name, dir)?;
            info!(model = name, manifest = %manifest.display(), "Materialized");
        }
    }
    Ok(())
}
