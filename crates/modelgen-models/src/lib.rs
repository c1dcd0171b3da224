//! Example models shipped with modelgen.
//!
//! Each model lives in its own directory below `models/` as a TOML manifest
//! plus the source file holding its method bodies:
//!
//! - `decay`: linear decay integrated by the adaptive solver
//! - `counter`: a state updated directly, without numerical integration
//! - `lstorage`: zoned storage without ODE methods that calls the `lloss`
//!   sub-model
//!
//! The files are embedded so that [`materialize`] can recreate them anywhere,
//! and [`scenarios`] prepares ready-to-run reference instances.

use modelgen_core::errors::{ModelgenError, ModelgenResult};
use modelgen_core::manifest::ModelDefinition;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub mod scenarios;

/// An embedded model directory.
#[derive(Debug, Clone, Copy)]
pub struct BundledModel {
    pub name: &'static str,
    /// File names and contents, manifest first.
    pub files: &'static [(&'static str, &'static str)],
    /// Bundled models whose manifests this one refers to.
    pub requires: &'static [&'static str],
}

macro_rules! model_file {
    ($model:literal, $file:literal) => {
        (
            $file,
            include_str!(concat!("../models/", $model, "/", $file)),
        )
    };
}

pub const MODELS: [BundledModel; 4] = [
    BundledModel {
        name: "decay",
        files: &[
            model_file!("decay", "decay.toml"),
            model_file!("decay", "decay.mdl"),
        ],
        requires: &[],
    },
    BundledModel {
        name: "counter",
        files: &[
            model_file!("counter", "counter.toml"),
            model_file!("counter", "counter.mdl"),
        ],
        requires: &[],
    },
    BundledModel {
        name: "lstorage",
        files: &[
            model_file!("lstorage", "lstorage.toml"),
            model_file!("lstorage", "lstorage.mdl"),
        ],
        requires: &["lloss"],
    },
    BundledModel {
        name: "lloss",
        files: &[
            model_file!("lloss", "lloss.toml"),
            model_file!("lloss", "lloss.mdl"),
        ],
        requires: &[],
    },
];

pub fn bundled(name: &str) -> ModelgenResult<&'static BundledModel> {
    MODELS.iter().find(|m| m.name == name).ok_or_else(|| {
        ModelgenError::Definition(format!(
            "no bundled model `{name}`, expected one of {:?}",
            names().collect::<Vec<_>>()
        ))
    })
}

pub fn names() -> impl Iterator<Item = &'static str> {
    MODELS.iter().map(|m| m.name)
}

/// Manifest of a bundled model inside this crate's source tree.
pub fn manifest_path(name: &str) -> ModelgenResult<PathBuf> {
    let model = bundled(name)?;
    Ok(Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("models")
        .join(model.name)
        .join(model.files[0].0))
}

/// Load a bundled model from this crate's source tree.
pub fn definition(name: &str) -> ModelgenResult<ModelDefinition> {
    ModelDefinition::load(&manifest_path(name)?)
}

/// Write a bundled model and the models it requires below `dir`, one
/// directory per model. Returns the path of the model's manifest.
pub fn materialize(name: &str, dir: &Path) -> ModelgenResult<PathBuf> {
    let model = bundled(name)?;
    for required in model.requires {
        materialize(required, dir)?;
    }
    let target = dir.join(model.name);
    fs::create_dir_all(&target).map_err(|e| io_error(&target, e))?;
    for (file, text) in model.files {
        let path = target.join(file);
        fs::write(&path, text).map_err(|e| io_error(&path, e))?;
    }
    debug!(model = name, dir = %target.display(), "Materialized bundled model");
    Ok(target.join(model.files[0].0))
}

fn io_error(path: &Path, source: std::io::Error) -> ModelgenError {
    ModelgenError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_bundled_model_loads() {
        for name in names() {
            let definition = definition(name).unwrap();
            assert_eq!(definition.name, name);
        }
    }

    #[test]
    fn materialized_models_load_with_their_submodels() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = materialize("lstorage", dir.path()).unwrap();
        assert!(dir.path().join("lloss/lloss.mdl").is_file());
        let definition = ModelDefinition::load(&manifest).unwrap();
        assert_eq!(definition.submodel("loss").unwrap().definition.name, "lloss");
    }

    #[test]
    fn unknown_models_are_reported() {
        let err = definition("missing").unwrap_err();
        assert!(err.to_string().contains("decay"));
    }
}
