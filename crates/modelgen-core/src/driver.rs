//! Staleness checks, unit writing and the handoff to a [`Toolchain`].
//!
//! A unit is regenerated when it is missing or when any contributing source
//! file was modified strictly after it. Units are written through a temporary
//! file and a rename so that a failed write leaves the previous unit in place.

use crate::codegen::unit::{assemble, GeneratedUnit, SUPPORT_HEADERS};
use crate::config::{Config, GeneratorConfig, SolverConfig};
use crate::errors::{ModelgenError, ModelgenResult, Stage};
use crate::manifest::ModelDefinition;
use crate::toolchain::{BuildRequest, Toolchain};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct UnitDriver {
    definition: ModelDefinition,
    generator: GeneratorConfig,
    solver: SolverConfig,
    artifact_dir: PathBuf,
    build_dir: Option<PathBuf>,
}

impl UnitDriver {
    pub fn new(definition: ModelDefinition, config: &Config) -> Self {
        Self {
            definition,
            generator: config.generator.clone(),
            solver: config.solver.clone(),
            artifact_dir: config.build.artifact_dir.clone(),
            build_dir: config.build.build_dir.clone(),
        }
    }

    pub fn definition(&self) -> &ModelDefinition {
        &self.definition
    }

    pub fn unit_dir(&self) -> PathBuf {
        self.generator.unit_dir()
    }

    pub fn unit_path(&self) -> PathBuf {
        self.unit_dir()
            .join(self.generator.unit_file_name(&self.definition.name))
    }

    /// Files whose modification makes the unit stale.
    pub fn contributors(&self) -> Vec<PathBuf> {
        self.definition.contributors()
    }

    pub fn needs_regeneration(&self) -> ModelgenResult<bool> {
        let unit = self.unit_path();
        let generated = match fs::metadata(&unit) {
            Ok(metadata) => modified(&unit, &metadata)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(unit = %unit.display(), "Unit is missing");
                return Ok(true);
            }
            Err(e) => return Err(ModelgenError::io(unit, e)),
        };
        for contributor in self.contributors() {
            let metadata =
                fs::metadata(&contributor).map_err(|e| ModelgenError::io(&contributor, e))?;
            if modified(&contributor, &metadata)? > generated {
                debug!(
                    unit = %unit.display(),
                    contributor = %contributor.display(),
                    "Unit is older than a contributor"
                );
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn assemble(&self) -> ModelgenResult<GeneratedUnit> {
        assemble(&self.definition, &self.generator, &self.solver)
    }

    /// Write `unit` atomically into the unit directory and return its path.
    pub fn write(&self, unit: &GeneratedUnit) -> ModelgenResult<PathBuf> {
        let dir = self.unit_dir();
        let path = dir.join(&unit.file_name);
        let tmp = dir.join(format!(".{}.tmp", unit.file_name));
        let result = fs::create_dir_all(&dir)
            .map_err(|e| ModelgenError::io(&dir, e))
            .and_then(|_| fs::write(&tmp, &unit.text).map_err(|e| ModelgenError::io(&tmp, e)))
            .and_then(|_| fs::rename(&tmp, &path).map_err(|e| ModelgenError::io(&path, e)));
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(e.in_stage(&unit.model, Stage::Writing));
        }
        info!(model = %unit.model, path = %path.display(), "Wrote generated unit");
        Ok(path)
    }

    /// Write the helper headers next to the units, leaving unchanged ones untouched.
    pub fn write_support_headers(&self) -> ModelgenResult<()> {
        let dir = self.unit_dir();
        fs::create_dir_all(&dir).map_err(|e| ModelgenError::io(&dir, e))?;
        for (name, text) in SUPPORT_HEADERS {
            let path = dir.join(name);
            if fs::read_to_string(&path).is_ok_and(|current| current == text) {
                continue;
            }
            fs::write(&path, text).map_err(|e| ModelgenError::io(&path, e))?;
            debug!(header = %path.display(), "Wrote support header");
        }
        Ok(())
    }

    /// Regenerate the unit if it is stale. Returns whether it was rewritten.
    pub fn refresh(&self) -> ModelgenResult<bool> {
        if !self.needs_regeneration()? {
            debug!(model = %self.definition.name, "Unit is up to date");
            return Ok(false);
        }
        let unit = self.assemble()?;
        self.write_support_headers()
            .map_err(|e| e.in_stage(&unit.model, Stage::Writing))?;
        self.write(&unit)?;
        Ok(true)
    }

    /// Refresh the unit, compile it with `toolchain` and move the artifact
    /// into the artifact directory. Returns the artifact's final path.
    pub fn build(&self, toolchain: &dyn Toolchain) -> ModelgenResult<PathBuf> {
        self.refresh()?;
        let model = self.definition.name.as_str();
        self.handoff(toolchain)
            .map_err(|e| e.in_stage(model, Stage::Build))
    }

    fn handoff(&self, toolchain: &dyn Toolchain) -> ModelgenResult<PathBuf> {
        let unit_dir = self.unit_dir();
        let build_dir = self
            .build_dir
            .clone()
            .unwrap_or_else(|| unit_dir.join("build"));
        fs::create_dir_all(&build_dir).map_err(|e| ModelgenError::io(&build_dir, e))?;
        let unit_path = self.unit_path();
        let stem = unit_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.definition.name.clone());
        let request = BuildRequest {
            model: self.definition.name.clone(),
            unit_path,
            include_dirs: vec![unit_dir.clone()],
            build_dir: build_dir.clone(),
            artifact_stem: stem.clone(),
        };
        toolchain.compile(&request)?;

        let artifact = format!("{stem}.{}", toolchain.artifact_extension());
        let searched = vec![build_dir, unit_dir];
        let found = searched
            .iter()
            .map(|dir| dir.join(&artifact))
            .find(|path| path.is_file())
            .ok_or_else(|| ModelgenError::ArtifactNotFound {
                model: self.definition.name.clone(),
                artifact: artifact.clone(),
                searched: searched.clone(),
            })?;

        fs::create_dir_all(&self.artifact_dir)
            .map_err(|e| ModelgenError::io(&self.artifact_dir, e))?;
        let target = self.artifact_dir.join(&artifact);
        relocate(&found, &target)?;
        info!(model = %self.definition.name, artifact = %target.display(), "Built model");
        Ok(target)
    }
}

fn modified(path: &Path, metadata: &fs::Metadata) -> ModelgenResult<SystemTime> {
    metadata.modified().map_err(|e| ModelgenError::io(path, e))
}

/// Move a file, falling back to copy and remove across file systems.
fn relocate(from: &Path, to: &Path) -> ModelgenResult<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to).map_err(|e| ModelgenError::io(to, e))?;
    fs::remove_file(from).map_err(|e| ModelgenError::io(from, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::SourceFile;
    use crate::method::MethodKind;
    use crate::schema::{GroupKind, Variable, VariableGroup};
    use std::time::Duration;

    const SOURCE: &str = "def update_n(model):\n    new = model.sequences.states.fastaccess\n    old = model.sequences.old_states.fastaccess\n    new.n = old.n + 1.0\n";

    fn driver(dir: &Path) -> UnitDriver {
        let source = dir.join("counter.mdl");
        fs::write(&source, SOURCE).unwrap();
        let definition = ModelDefinition::builder("counter")
            .source(SourceFile::new(&source, SOURCE))
            .group(VariableGroup::new(GroupKind::States).variable(Variable::float("n")))
            .method(MethodKind::FullOde, "update_n")
            .build()
            .unwrap();
        let mut config = Config::default();
        config.generator.output_dir = dir.to_path_buf();
        config.build.artifact_dir = dir.join("lib");
        UnitDriver::new(definition, &config)
    }

    fn touch(path: &Path, time: SystemTime) {
        fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(time)
            .unwrap();
    }

    #[test]
    fn refresh_writes_once_until_a_contributor_changes() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(dir.path());
        assert!(driver.needs_regeneration().unwrap());
        assert!(driver.refresh().unwrap());
        assert!(driver.unit_path().ends_with("autogen/c_counter.c"));
        assert!(dir.path().join("autogen/mathutils.h").is_file());

        let now = SystemTime::now();
        touch(&driver.unit_path(), now);
        touch(&dir.path().join("counter.mdl"), now);
        // equal modification times are not stale
        assert!(!driver.needs_regeneration().unwrap());
        assert!(!driver.refresh().unwrap());

        touch(&dir.path().join("counter.mdl"), now + Duration::from_secs(5));
        assert!(driver.needs_regeneration().unwrap());
    }

    #[test]
    fn missing_contributor_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(dir.path());
        driver.refresh().unwrap();
        fs::remove_file(dir.path().join("counter.mdl")).unwrap();
        assert!(matches!(
            driver.needs_regeneration(),
            Err(ModelgenError::Io { .. })
        ));
    }

    #[test]
    fn failed_write_keeps_the_previous_unit() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(dir.path());
        driver.refresh().unwrap();
        let before = fs::read_to_string(driver.unit_path()).unwrap();

        // a directory squatting on the temporary file name makes the write fail
        fs::create_dir(dir.path().join("autogen/.c_counter.c.tmp")).unwrap();
        let mut unit = driver.assemble().unwrap();
        unit.text.push_str("\n/* changed */");
        let err = driver.write(&unit).unwrap_err();
        assert!(matches!(
            err,
            ModelgenError::Generation {
                stage: Stage::Writing,
                ..
            }
        ));
        assert_eq!(fs::read_to_string(driver.unit_path()).unwrap(), before);
    }
}
