//! Reference instances of the bundled models with their parameters applied.

use crate::definition;
use modelgen_core::config::Config;
use modelgen_core::errors::ModelgenResult;
use modelgen_core::runtime::ReferenceModel;
use ndarray::{Array1, ArrayD, IxDyn};
use tracing::debug;

/// Parameters of the `decay` model.
#[derive(Debug, Clone, PartialEq)]
pub struct DecayParameters {
    /// Decay rate per step.
    pub k: f64,
    pub y0: f64,
}

impl Default for DecayParameters {
    fn default() -> Self {
        Self { k: 1.0, y0: 1.0 }
    }
}

/// Parameters of the `counter` model.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterParameters {
    pub increment: f64,
    pub n0: f64,
}

impl Default for CounterParameters {
    fn default() -> Self {
        Self {
            increment: 1.0,
            n0: 0.0,
        }
    }
}

/// Parameters of the `lstorage` model and its `lloss` sub-model.
#[derive(Debug, Clone, PartialEq)]
pub struct LStorageParameters {
    /// Area of every zone; also fixes the number of zones.
    pub area: Vec<f64>,
    /// Fraction of the content lost per step.
    pub c: f64,
    /// Smoothing of the loss around an empty storage.
    pub beta: f64,
    /// Initial content of every zone.
    pub s0: f64,
}

impl Default for LStorageParameters {
    fn default() -> Self {
        Self {
            area: vec![1.0, 2.0],
            c: 0.1,
            beta: 0.0,
            s0: 0.0,
        }
    }
}

pub fn decay(parameters: &DecayParameters, config: &Config) -> ModelgenResult<ReferenceModel> {
    let mut model = ReferenceModel::new(&definition("decay")?, &config.generator, &config.solver)?;
    let instance = model.instance_mut();
    instance.set_scalar("control.k", parameters.k)?;
    instance.set_scalar("states.y", parameters.y0)?;
    instance.new2old();
    debug!(?parameters, "Prepared decay scenario");
    Ok(model)
}

pub fn counter(parameters: &CounterParameters, config: &Config) -> ModelgenResult<ReferenceModel> {
    let mut model =
        ReferenceModel::new(&definition("counter")?, &config.generator, &config.solver)?;
    let instance = model.instance_mut();
    instance.set_scalar("control.increment", parameters.increment)?;
    instance.set_scalar("states.n", parameters.n0)?;
    instance.new2old();
    debug!(?parameters, "Prepared counter scenario");
    Ok(model)
}

pub fn lstorage(
    parameters: &LStorageParameters,
    config: &Config,
) -> ModelgenResult<ReferenceModel> {
    let mut model =
        ReferenceModel::new(&definition("lstorage")?, &config.generator, &config.solver)?;
    let zones = parameters.area.len();
    let instance = model.instance_mut();
    instance.set_scalar("control.nmb", zones as f64)?;
    instance.set_array(
        "control.area",
        Array1::from_vec(parameters.area.clone()).into_dyn(),
    )?;
    instance.set_shape("fluxes.qz", &[zones])?;
    instance.set_array(
        "states.s",
        ArrayD::from_elem(IxDyn(&[zones]), parameters.s0),
    )?;
    instance.new2old();
    instance.set_scalar("loss.control.c", parameters.c)?;
    instance.set_scalar("loss.control.beta", parameters.beta)?;
    debug!(zones, "Prepared lstorage scenario");
    Ok(model)
}
