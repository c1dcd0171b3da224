//! Simulates a model step by step with the reference runtime.

use anyhow::{anyhow, bail, Context, Result};
use clap::Args;
use modelgen_core::config::{Config, ExecutionMode};
use modelgen_core::manifest::ModelDefinition;
use modelgen_core::runtime::{ReferenceModel, SequenceIo};
use modelgen_models::scenarios;
use std::path::Path;
use tracing::{debug, info};

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Name of a bundled model or path of a manifest
    pub model: String,

    /// Number of macro steps
    #[arg(short, long, default_value_t = 1)]
    pub steps: usize,

    /// Resize a variable before assigning values, e.g. `states.s=3`
    #[arg(long, value_name = "KEY=DIMS")]
    pub shape: Vec<String>,

    /// Assign values in row-major order, e.g. `control.k=0.5` or `control.area=1,2`
    #[arg(long, value_name = "KEY=VALUES")]
    pub set: Vec<String>,

    /// Read a sequence from a file of native-endian doubles
    #[arg(long, value_name = "KEY=PATH")]
    pub input: Vec<String>,

    /// Write a sequence to a file of native-endian doubles
    #[arg(long, value_name = "KEY=PATH")]
    pub output: Vec<String>,

    /// Run with the reference runtime even if the configuration selects generated units
    #[arg(long)]
    pub reference: bool,
}

pub fn execute(args: SimulateArgs, config: Config) -> Result<()> {
    if config.generator.mode == ExecutionMode::Generated && !args.reference {
        bail!(
            "the configuration selects generated execution; build the unit with `modelgen build` \
             and load it from the host application, or pass --reference"
        );
    }

    let mut model = prepare(&args.model, &config)?;
    apply_values(&mut model, &args)?;

    let files = model.files_mut();
    for arg in &args.input {
        let (key, path) = split(arg)?;
        files.configure(key, SequenceIo::read_from(path));
    }
    for arg in &args.output {
        let (key, path) = split(arg)?;
        files.configure(key, SequenceIo::write_to(path));
    }
    files.open()?;

    for idx in 0..args.steps {
        model
            .simulate(idx)
            .with_context(|| format!("simulating step {idx}"))?;
    }
    model.files_mut().close();
    info!(model = %model.model().name(), steps = args.steps, "Simulation finished");

    let instance = model.instance();
    for key in instance.keys() {
        if key.starts_with("states.") || key.starts_with("fluxes.") {
            println!("{key} = {:?}", instance.flat(key)?);
        }
    }
    Ok(())
}

/// Bundled models start from their default scenario, manifests from zeros.
fn prepare(model: &str, config: &Config) -> Result<ReferenceModel> {
    let path = Path::new(model);
    if path.is_file() {
        let definition = ModelDefinition::load(path)?;
        return Ok(ReferenceModel::new(
            &definition,
            &config.generator,
            &config.solver,
        )?);
    }
    let model = match model {
        "decay" => scenarios::decay(&Default::default(), config)?,
        "counter" => scenarios::counter(&Default::default(), config)?,
        "lstorage" => scenarios::lstorage(&Default::default(), config)?,
        other => {
            let definition = modelgen_models::definition(other)?;
            ReferenceModel::new(&definition, &config.generator, &config.solver)?
        }
    };
    Ok(model)
}

fn apply_values(model: &mut ReferenceModel, args: &SimulateArgs) -> Result<()> {
    let instance = model.instance_mut();
    for arg in &args.shape {
        let (key, dims) = split(arg)?;
        let dims = dims
            .split(',')
            .map(|d| d.trim().parse::<usize>())
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("invalid shape in `{arg}`"))?;
        instance.set_shape(key, &dims)?;
    }
    for arg in &args.set {
        let (key, values) = split(arg)?;
        let values = values
            .split(',')
            .map(|v| v.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("invalid values in `{arg}`"))?;
        if instance.slot(key)?.ndim() == 0 && values.len() == 1 {
            instance.set_scalar(key, values[0])?;
        } else {
            instance.set_flat(key, &values)?;
        }
        debug!(key, ?values, "Assigned values");
    }
    instance.new2old();
    Ok(())
}

fn split(arg: &str) -> Result<(&str, &str)> {
    arg.split_once('=')
        .map(|(key, value)| (key.trim(), value.trim()))
        .ok_or_else(|| anyhow!("expected KEY=VALUE, got `{arg}`"))
}
