use std::path::PathBuf;
use std::process::ExitCode;

use plam::{BuildError, LoadError};

/// All errors produced by plam-pack.
///
/// Variants are split into two categories:
/// - **Input errors** (exit code 2): missing files, bad manifests, unknown tokens, I/O failures
/// - **Container errors** (exit code 1): the writer or loader rejected the container
#[derive(thiserror::Error, Debug)]
pub enum PackError {
    // ── Input errors (exit code 2) ───────────────────────────────────

    #[error("Input file not found: {path}")]
    InputNotFound { path: PathBuf },

    #[error("Manifest parse error: {0}")]
    ManifestParse(String),

    #[error("Unknown resource type: {token}")]
    UnknownResourceType { token: String },

    #[error("Unknown compression algorithm: {name}")]
    UnknownCompression { name: String },

    #[error("Unknown CPU architecture: {name}")]
    UnknownCpu { name: String },

    #[error("Unknown {field}: {value}")]
    UnknownToken { field: &'static str, value: String },

    #[error("Unknown section referenced by symbol `{symbol}`: {section}")]
    UnknownSection { symbol: String, section: String },

    #[error("Unknown symbol referenced by relocation: {name}")]
    UnknownSymbol { name: String },

    #[error("No input images")]
    NoInputs,

    #[error("Bad key: {0}")]
    BadKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ── Container errors (exit code 1) ───────────────────────────────

    #[error("Build failed: {0}")]
    Build(BuildError),

    #[error("Load failed: {0}")]
    Load(LoadError),
}

impl PackError {
    /// Map each error variant to its process exit code.
    ///
    /// - `2` — input error (the container was never produced or read)
    /// - `1` — container failure
    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    /// Numeric form of [`exit_code`](Self::exit_code).
    pub fn code(&self) -> u8 {
        match self {
            Self::InputNotFound { .. }
            | Self::ManifestParse(_)
            | Self::UnknownResourceType { .. }
            | Self::UnknownCompression { .. }
            | Self::UnknownCpu { .. }
            | Self::UnknownToken { .. }
            | Self::UnknownSection { .. }
            | Self::UnknownSymbol { .. }
            | Self::NoInputs
            | Self::BadKey(_)
            | Self::Io(_)
            | Self::Json(_) => 2,

            Self::Build(_) | Self::Load(_) => 1,
        }
    }
}

impl From<BuildError> for PackError {
    fn from(err: BuildError) -> Self {
        match err {
            // Codecs the writer lacks are argument errors.
            BuildError::UnsupportedCompression(alg) => Self::UnknownCompression {
                name: alg.to_string(),
            },
            other => Self::Build(other),
        }
    }
}

impl From<LoadError> for PackError {
    fn from(err: LoadError) -> Self {
        Self::Load(err)
    }
}

/// Read an input file, reporting a missing file as [`PackError::InputNotFound`].
pub fn read_input(path: &std::path::Path) -> Result<Vec<u8>, PackError> {
    std::fs::read(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            PackError::InputNotFound {
                path: path.to_path_buf(),
            }
        } else {
            PackError::Io(e)
        }
    })
}
