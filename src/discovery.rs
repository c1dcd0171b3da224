//! Locating model manifests on disk.

use modelgen_core::errors::{ModelgenError, ModelgenResult};
use modelgen_core::manifest::ModelDefinition;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Load the models named by `paths`.
///
/// Files are loaded as manifests and any failure is returned. Directories
/// are searched recursively for `*.toml` files; those that do not load as a
/// manifest (configuration files, for instance) are skipped with a warning.
/// Files listed in `ignore` are never considered.
pub fn load_models(paths: &[PathBuf], ignore: &[PathBuf]) -> ModelgenResult<Vec<ModelDefinition>> {
    let ignored: Vec<PathBuf> = ignore.iter().filter_map(|p| p.canonicalize().ok()).collect();
    let mut explicit = Vec::new();
    let mut discovered = Vec::new();
    for path in paths {
        if path.is_dir() {
            for manifest in manifests_below(path) {
                if manifest
                    .canonicalize()
                    .is_ok_and(|p| ignored.contains(&p))
                {
                    continue;
                }
                match ModelDefinition::load(&manifest) {
                    Ok(definition) => discovered.push(definition),
                    Err(e) => warn!(path = %manifest.display(), error = %e, "Skipping file"),
                }
            }
        } else if path.is_file() {
            explicit.push(ModelDefinition::load(path)?);
        } else {
            return Err(ModelgenError::Definition(format!(
                "{} is neither a manifest nor a directory",
                path.display()
            )));
        }
    }
    // discovered sub-models are generated as part of their parent's unit
    let embedded: Vec<String> = explicit
        .iter()
        .chain(&discovered)
        .flat_map(|m| m.submodels.iter().map(|s| s.definition.name.clone()))
        .collect();
    for model in discovered {
        if embedded.contains(&model.name) {
            debug!(model = %model.name, "Generated through its parent model");
        } else {
            explicit.push(model);
        }
    }
    Ok(explicit)
}

fn manifests_below(dir: &Path) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .filter(|p| p.is_file() && p.extension().map(|e| e == "toml").unwrap_or(false))
        .collect();
    found.sort();
    found
}
