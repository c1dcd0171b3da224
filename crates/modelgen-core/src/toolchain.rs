//! The seam between generated units and the native compiler.
//!
//! modelgen never assumes a particular compiler. A [`Toolchain`] receives a
//! [`BuildRequest`] and must either leave a loadable artifact named
//! `<artifact_stem>.<artifact_extension>` in the request's build directory, or
//! fail with [`ModelgenError::BuildToolchain`] carrying its diagnostics.

use crate::errors::{ModelgenError, ModelgenResult};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::path::PathBuf;
use std::process::Command;
use tracing::{debug, info};

/// Everything a toolchain needs to turn one generated unit into an artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildRequest {
    /// Name of the model, used in diagnostics.
    pub model: String,
    pub unit_path: PathBuf,
    /// Directories holding the shared helper headers.
    pub include_dirs: Vec<PathBuf>,
    /// Scratch directory the artifact is expected to appear in.
    pub build_dir: PathBuf,
    pub artifact_stem: String,
}

#[typetag::serde(tag = "type")]
pub trait Toolchain: Debug + Send + Sync {
    /// File extension of the loadable artifact, without the dot.
    fn artifact_extension(&self) -> &str;

    /// Run the toolchain. A successful return does not guarantee that the
    /// artifact exists; the caller checks for it.
    fn compile(&self, request: &BuildRequest) -> ModelgenResult<()>;
}

/// Invokes a C compiler from the command line.
///
/// The command is `program [args..] -I<dir>.. -o <build_dir>/<stem>.<ext> <unit> [link_args..]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandToolchain {
    pub program: String,
    pub args: Vec<String>,
    pub link_args: Vec<String>,
    pub artifact_extension: String,
}

impl Default for CommandToolchain {
    fn default() -> Self {
        Self {
            program: "cc".to_string(),
            args: vec![
                "-std=c99".to_string(),
                "-O2".to_string(),
                "-shared".to_string(),
                "-fPIC".to_string(),
            ],
            link_args: vec!["-lm".to_string()],
            artifact_extension: std::env::consts::DLL_EXTENSION.to_string(),
        }
    }
}

impl CommandToolchain {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_artifact_extension(mut self, extension: impl Into<String>) -> Self {
        self.artifact_extension = extension.into();
        self
    }

    fn command(&self, request: &BuildRequest) -> Command {
        let output = request.build_dir.join(format!(
            "{}.{}",
            request.artifact_stem, self.artifact_extension
        ));
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for dir in &request.include_dirs {
            cmd.arg(format!("-I{}", dir.display()));
        }
        cmd.arg("-o")
            .arg(output)
            .arg(&request.unit_path)
            .args(&self.link_args)
            .current_dir(&request.build_dir);
        cmd
    }
}

#[typetag::serde]
impl Toolchain for CommandToolchain {
    fn artifact_extension(&self) -> &str {
        &self.artifact_extension
    }

    fn compile(&self, request: &BuildRequest) -> ModelgenResult<()> {
        let mut cmd = self.command(request);
        debug!(model = %request.model, command = ?cmd, "Invoking toolchain");
        let output = cmd.output().map_err(|e| ModelgenError::BuildToolchain {
            model: request.model.clone(),
            status: None,
            diagnostics: format!("could not start `{}`: {e}", self.program),
        })?;
        if !output.status.success() {
            let mut diagnostics = String::from_utf8_lossy(&output.stderr).into_owned();
            let stdout = String::from_utf8_lossy(&output.stdout);
            if !stdout.trim().is_empty() {
                if !diagnostics.is_empty() && !diagnostics.ends_with('\n') {
                    diagnostics.push('\n');
                }
                diagnostics.push_str(&stdout);
            }
            return Err(ModelgenError::BuildToolchain {
                model: request.model.clone(),
                status: output.status.code(),
                diagnostics,
            });
        }
        info!(model = %request.model, program = %self.program, "Toolchain finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(dir: &std::path::Path) -> BuildRequest {
        BuildRequest {
            model: "decay".to_string(),
            unit_path: dir.join("c_decay.c"),
            include_dirs: vec![dir.to_path_buf()],
            build_dir: dir.to_path_buf(),
            artifact_stem: "c_decay".to_string(),
        }
    }

    #[test]
    fn command_layout() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = CommandToolchain::new("cc")
            .with_args(vec!["-O0".to_string()])
            .with_artifact_extension("so");
        let cmd = toolchain.command(&request(dir.path()));
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args[0], "-O0");
        assert!(args[1].starts_with("-I"));
        assert_eq!(args[2], "-o");
        assert!(args[3].ends_with("c_decay.so"));
        assert!(args[4].ends_with("c_decay.c"));
        assert_eq!(args[5], "-lm");
    }

    #[test]
    fn missing_program_is_a_toolchain_error() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = CommandToolchain::new("modelgen-no-such-compiler");
        match toolchain.compile(&request(dir.path())) {
            Err(ModelgenError::BuildToolchain { status, .. }) => assert_eq!(status, None),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn toolchain_round_trips_through_serde() {
        let toolchain: Box<dyn Toolchain> = Box::new(CommandToolchain::new("clang"));
        let text = serde_json::to_string(&toolchain).unwrap();
        assert!(text.contains("\"type\":\"CommandToolchain\""));
        let back: Box<dyn Toolchain> = serde_json::from_str(&text).unwrap();
        assert_eq!(back.artifact_extension(), toolchain.artifact_extension());
    }
}
