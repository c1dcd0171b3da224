//! Explicit configuration threaded through generation, simulation and build handoff.
//!
//! A configuration file is TOML with three optional tables:
//!
//! ```toml
//! [generator]
//! output_dir = "target/modelgen"
//! mode = "generated"
//!
//! [solver]
//! abs_error_max = 1e-6
//!
//! [build.toolchain]
//! type = "CommandToolchain"
//! program = "cc"
//! ```
//!
//! Every field has a default so an empty file is a valid configuration.

use crate::errors::{ModelgenError, ModelgenResult};
use crate::toolchain::{CommandToolchain, Toolchain};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Selects whether a model runs through its generated unit or the reference interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Generated,
    Reference,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Root directory below which generated units are written.
    pub output_dir: PathBuf,
    pub autogen_subdir: String,
    /// Tag prepended to the model name to form the unit's file stem.
    pub unit_prefix: String,
    pub unit_extension: String,
    /// Locals and arguments starting with this prefix are floating point accumulators.
    pub accumulator_prefix: String,
    pub fastaccess_marker: String,
    pub slowpath_marker: String,
    /// Qualifier stripped from shared helper calls.
    pub helper_module: String,
    pub mode: ExecutionMode,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            autogen_subdir: "autogen".to_string(),
            unit_prefix: "c_".to_string(),
            unit_extension: "c".to_string(),
            accumulator_prefix: "d_".to_string(),
            fastaccess_marker: "fastaccess".to_string(),
            slowpath_marker: "slowpath".to_string(),
            helper_module: "modelutils".to_string(),
            mode: ExecutionMode::Generated,
        }
    }
}

impl GeneratorConfig {
    /// Directory holding generated units and the support headers.
    pub fn unit_dir(&self) -> PathBuf {
        self.output_dir.join(&self.autogen_subdir)
    }

    pub fn unit_file_name(&self, model: &str) -> String {
        format!("{}{}.{}", self.unit_prefix, model, self.unit_extension)
    }
}

/// Numerical settings of the adaptive explicit solver.
///
/// Step sizes are relative to one macro step, so `rel_dt_max = 1.0` allows a
/// single trial step to cover the whole macro step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub abs_error_max: f64,
    /// Relative tolerance; `None` disables the relative error criterion.
    pub rel_error_max: Option<f64>,
    pub rel_dt_min: f64,
    pub rel_dt_max: f64,
    pub dt_increase: f64,
    pub dt_decrease: f64,
    pub accepts_before_growth: u32,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            abs_error_max: 0.01,
            rel_error_max: None,
            rel_dt_min: 0.001,
            rel_dt_max: 1.0,
            dt_increase: 2.0,
            dt_decrease: 10.0,
            accepts_before_growth: 1,
        }
    }
}

impl SolverConfig {
    pub fn with_abs_error_max(mut self, value: f64) -> Self {
        self.abs_error_max = value;
        self
    }

    pub fn with_rel_error_max(mut self, value: Option<f64>) -> Self {
        self.rel_error_max = value;
        self
    }

    pub fn with_rel_dt_min(mut self, value: f64) -> Self {
        self.rel_dt_min = value;
        self
    }

    pub fn with_rel_dt_max(mut self, value: f64) -> Self {
        self.rel_dt_max = value;
        self
    }

    /// The relative tolerance as stored in the solver parameters, NaN when disabled.
    pub fn rel_error_max_or_nan(&self) -> f64 {
        self.rel_error_max.unwrap_or(f64::NAN)
    }

    pub fn validate(&self) -> ModelgenResult<()> {
        let positive = |name: &str, value: f64| {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(ModelgenError::Config(format!(
                    "solver.{name} must be a positive finite number, got {value}"
                )))
            }
        };
        positive("abs_error_max", self.abs_error_max)?;
        if let Some(rel) = self.rel_error_max {
            positive("rel_error_max", rel)?;
        }
        positive("rel_dt_min", self.rel_dt_min)?;
        positive("rel_dt_max", self.rel_dt_max)?;
        if self.rel_dt_min > self.rel_dt_max {
            return Err(ModelgenError::Config(format!(
                "solver.rel_dt_min ({}) exceeds solver.rel_dt_max ({})",
                self.rel_dt_min, self.rel_dt_max
            )));
        }
        if self.rel_dt_max > 1.0 {
            return Err(ModelgenError::Config(format!(
                "solver.rel_dt_max must not exceed one macro step, got {}",
                self.rel_dt_max
            )));
        }
        if !(self.dt_increase > 1.0) || !(self.dt_decrease > 1.0) {
            return Err(ModelgenError::Config(
                "solver.dt_increase and solver.dt_decrease must both be greater than one"
                    .to_string(),
            ));
        }
        if self.accepts_before_growth == 0 {
            return Err(ModelgenError::Config(
                "solver.accepts_before_growth must be at least one".to_string(),
            ));
        }
        Ok(())
    }
}

/// Settings of the handoff to the native toolchain.
#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub toolchain: Box<dyn Toolchain>,
    /// Final location of built artifacts.
    pub artifact_dir: PathBuf,
    /// Scratch directory for the toolchain; defaults to `<unit_dir>/build`.
    pub build_dir: Option<PathBuf>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            toolchain: Box::new(CommandToolchain::default()),
            artifact_dir: PathBuf::from("lib"),
            build_dir: None,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub generator: GeneratorConfig,
    pub solver: SolverConfig,
    pub build: BuildConfig,
}

impl Config {
    pub fn from_toml_str(text: &str) -> ModelgenResult<Self> {
        let config: Config =
            toml::from_str(text).map_err(|e| ModelgenError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a configuration file.
    pub fn load(path: &Path) -> ModelgenResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| ModelgenError::io(path, e))?;
        let config: Config = toml::from_str(&text).map_err(|source| ModelgenError::Toml {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ModelgenResult<()> {
        self.solver.validate()?;
        let g = &self.generator;
        for (name, value) in [
            ("unit_extension", &g.unit_extension),
            ("accumulator_prefix", &g.accumulator_prefix),
            ("fastaccess_marker", &g.fastaccess_marker),
            ("slowpath_marker", &g.slowpath_marker),
            ("helper_module", &g.helper_module),
        ] {
            if value.is_empty() {
                return Err(ModelgenError::Config(format!(
                    "generator.{name} must not be empty"
                )));
            }
        }
        Ok(())
    }
}
