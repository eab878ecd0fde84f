//! Error types for the selection, gathering and registration stages.
//!
//! Errors fall in two classes. Configuration errors abort the whole run. Session errors
//! (missing images, wrong cardinality, a failed external tool) are logged and only the
//! offending session is skipped. See [PipelineError::is_session_error].

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cannot select from an empty list of candidate images")]
    EmptyInput,

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("input and output datasets cannot be the same: {0}")]
    SameDataset(PathBuf),

    #[error("dataset does not contain a dataset_description.json file: {0}")]
    MissingDescriptor(PathBuf),

    #[error("{what} not found for participant {participant}, session {session}: {}", path.display())]
    MissingInput {
        participant: String,
        session: String,
        what: String,
        path: PathBuf,
    },

    #[error("expected {expected} {what} for participant {participant}, session {session}, found {found}")]
    Cardinality {
        participant: String,
        session: String,
        what: String,
        expected: usize,
        found: usize,
    },

    #[error("{program} exited with status {status}: {stderr}")]
    ExternalTool {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("unexpected image data in {}: {reason}", path.display())]
    Image { path: PathBuf, reason: String },

    #[error("invalid transform file {}: {reason}", path.display())]
    Transform { path: PathBuf, reason: String },

    #[error("malformed worklist {}: {reason}", path.display())]
    Worklist { path: PathBuf, reason: String },

    #[error("nifti error: {0}")]
    Nifti(#[from] nifti::NiftiError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("failed to parse parameter file: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("failed to serialize parameters: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error(transparent)]
    Glob(#[from] glob::PatternError),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    pub fn missing_input(participant: &str, session: &str, what: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::MissingInput {
            participant: participant.to_string(),
            session: session.to_string(),
            what: what.into(),
            path: path.into(),
        }
    }

    pub fn image(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Image { path: path.into(), reason: reason.into() }
    }

    pub fn transform(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Transform { path: path.into(), reason: reason.into() }
    }

    /// true if the error only concerns the session being processed, so a batch run may log it
    /// and continue with the next session
    pub fn is_session_error(&self) -> bool {
        matches!(
            self,
            Self::EmptyInput
                | Self::MissingInput { .. }
                | Self::Cardinality { .. }
                | Self::ExternalTool { .. }
                | Self::Image { .. }
                | Self::Transform { .. }
                | Self::Nifti(_)
        )
    }
}
