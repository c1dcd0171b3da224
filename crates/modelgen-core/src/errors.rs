use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Pipeline stage in which a generation failure happened.
///
/// Used to wrap the original error so that a user sees the model name, the
/// failing stage and the underlying message together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Introspection,
    Rewriting,
    Normalization,
    Parsing,
    Declarations,
    Lowering,
    Scaffold,
    Writing,
    Build,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Introspection => "source introspection",
            Stage::Rewriting => "variable reference rewriting",
            Stage::Normalization => "statement normalization",
            Stage::Parsing => "parsing",
            Stage::Declarations => "declaration emission",
            Stage::Lowering => "method lowering",
            Stage::Scaffold => "integration scaffold synthesis",
            Stage::Writing => "unit writing",
            Stage::Build => "build handoff",
        };
        f.write_str(name)
    }
}

/// Error type for invalid operations.
#[derive(Error, Debug)]
pub enum ModelgenError {
    #[error("{0}")]
    Error(String),
    #[error("model `{model}`: no source text for method `{method}` ({detail})")]
    SourceIntrospection {
        model: String,
        method: String,
        detail: String,
    },
    #[error("model `{model}`, method `{method}`, line {line}: {message}")]
    UnsupportedConstruct {
        model: String,
        method: String,
        line: usize,
        message: String,
    },
    #[error("building model `{model}` failed (status {status:?}):\n{diagnostics}")]
    BuildToolchain {
        model: String,
        status: Option<i32>,
        diagnostics: String,
    },
    #[error("the toolchain reported success for model `{model}` but no artifact `{artifact}` was found in {searched:?}")]
    ArtifactNotFound {
        model: String,
        artifact: String,
        searched: Vec<PathBuf>,
    },
    #[error("generating model `{model}` failed during {stage}: {source}")]
    Generation {
        model: String,
        stage: Stage,
        #[source]
        source: Box<ModelgenError>,
    },
    #[error("invalid model definition: {0}")]
    Definition(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("unknown variable `{0}`")]
    UnknownVariable(String),
    #[error("shape mismatch for `{variable}`: expected {expected} dimension(s), got shape {got:?}")]
    ShapeMismatch {
        variable: String,
        expected: usize,
        got: Vec<usize>,
    },
    #[error("index {index:?} is out of bounds for `{variable}` with shape {shape:?}")]
    IndexOutOfBounds {
        variable: String,
        index: Vec<i64>,
        shape: Vec<usize>,
    },
    #[error("runtime error in method `{method}`: {message}")]
    Runtime { method: String, message: String },
}

impl ModelgenError {
    /// Attach the model name and pipeline stage to an error.
    ///
    /// Errors that already carry a stage are returned unchanged.
    pub fn in_stage(self, model: &str, stage: Stage) -> Self {
        match self {
            ModelgenError::Generation { .. } => self,
            other => ModelgenError::Generation {
                model: model.to_string(),
                stage,
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, skipping any stage wrappers.
    pub fn root(&self) -> &ModelgenError {
        match self {
            ModelgenError::Generation { source, .. } => source.root(),
            other => other,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ModelgenError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Convenience type for `Result<T, ModelgenError>`.
pub type ModelgenResult<T> = Result<T, ModelgenError>;
