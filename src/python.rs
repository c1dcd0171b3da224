use modelgen_core::codegen::unit::assemble as assemble_unit;
use modelgen_core::config::Config;
use modelgen_core::driver::UnitDriver;
use modelgen_core::errors::ModelgenError;
use modelgen_core::manifest::ModelDefinition;
use modelgen_core::runtime::ReferenceModel;
use pyo3::exceptions::{PyKeyError, PyValueError};
use pyo3::prelude::*;
use std::path::PathBuf;

fn to_py(err: ModelgenError) -> PyErr {
    match err {
        ModelgenError::UnknownVariable(name) => PyKeyError::new_err(name),
        other => PyValueError::new_err(other.to_string()),
    }
}

fn load_config(config: Option<PathBuf>) -> PyResult<Config> {
    match config {
        Some(path) => Config::load(&path).map_err(to_py),
        None => Ok(Config::default()),
    }
}

/// Return the generated C unit of a model as text.
///
/// Parameters
/// ----------
/// manifest : str
///     Path of the model's TOML manifest.
/// config : str, optional
///     Path of a modelgen configuration file.
#[pyfunction]
#[pyo3(signature = (manifest, config=None))]
fn assemble(manifest: PathBuf, config: Option<PathBuf>) -> PyResult<String> {
    let config = load_config(config)?;
    let definition = ModelDefinition::load(&manifest).map_err(to_py)?;
    let unit = assemble_unit(&definition, &config.generator, &config.solver).map_err(to_py)?;
    Ok(unit.text)
}

/// Write the generated unit of a model if it is missing or stale.
///
/// Returns a tuple of the unit's path and whether it was rewritten.
#[pyfunction]
#[pyo3(signature = (manifest, config=None))]
fn generate(manifest: PathBuf, config: Option<PathBuf>) -> PyResult<(PathBuf, bool)> {
    let config = load_config(config)?;
    let definition = ModelDefinition::load(&manifest).map_err(to_py)?;
    let driver = UnitDriver::new(definition, &config);
    let written = driver.refresh().map_err(to_py)?;
    Ok((driver.unit_path(), written))
}

/// A model executed by the reference runtime.
///
/// Variables are addressed as `<group>.<name>`, e.g. `states.y`, or
/// `<submodel>.<group>.<name>` for variables of sub-models.
#[pyclass(name = "ReferenceModel", unsendable)]
pub struct PyReferenceModel {
    inner: ReferenceModel,
}

#[pymethods]
impl PyReferenceModel {
    #[new]
    #[pyo3(signature = (manifest, config=None))]
    fn new(manifest: PathBuf, config: Option<PathBuf>) -> PyResult<Self> {
        let config = load_config(config)?;
        let definition = ModelDefinition::load(&manifest).map_err(to_py)?;
        let inner =
            ReferenceModel::new(&definition, &config.generator, &config.solver).map_err(to_py)?;
        Ok(Self { inner })
    }

    /// Values of a variable in row-major order.
    fn get(&self, key: &str) -> PyResult<Vec<f64>> {
        self.inner.instance().flat(key).map_err(to_py)
    }

    /// Overwrite the values of a variable in row-major order.
    fn set(&mut self, key: &str, values: Vec<f64>) -> PyResult<()> {
        let instance = self.inner.instance_mut();
        if instance.slot(key).map_err(to_py)?.ndim() == 0 && values.len() == 1 {
            instance.set_scalar(key, values[0]).map_err(to_py)
        } else {
            instance.set_flat(key, &values).map_err(to_py)
        }
    }

    fn set_shape(&mut self, key: &str, shape: Vec<usize>) -> PyResult<()> {
        self.inner.instance_mut().set_shape(key, &shape).map_err(to_py)
    }

    /// Copy the current states to the previous-step states.
    fn new2old(&mut self) {
        self.inner.instance_mut().new2old();
    }

    /// Simulate the macro step `idx`.
    fn simulate(&mut self, idx: usize) -> PyResult<()> {
        self.inner.simulate(idx).map_err(to_py)
    }

    #[getter]
    fn nmb_calls(&self) -> u64 {
        self.inner.solver().vars.nmb_calls as u64
    }

    #[getter]
    fn keys(&self) -> Vec<String> {
        self.inner.instance().keys().map(str::to_string).collect()
    }
}

#[pymodule]
#[pyo3(name = "_lib")]
fn modelgen(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add("__version__", env!("CARGO_PKG_VERSION"))?;
    m.add_function(wrap_pyfunction!(assemble, m)?)?;
    m.add_function(wrap_pyfunction!(generate, m)?)?;
    m.add_class::<PyReferenceModel>()?;
    Ok(())
}
