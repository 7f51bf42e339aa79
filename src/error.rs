use thiserror::Error;

/// Errors raised while aligning a sequence set.
///
/// Every variant is fatal for the run: the pipeline has no partial results.
#[derive(Debug, Error)]
pub enum MsaError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no sequences to align")]
    EmptyInput,

    #[error("sequence {index} is malformed: {reason}")]
    MalformedSequence { index: usize, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("guide tree error: {0}")]
    GuideTree(String),

    #[error("{stage} stage failed: {reason}")]
    Stage { stage: &'static str, reason: String },
}

pub type Result<T> = std::result::Result<T, MsaError>;

impl MsaError {
    pub fn stage(stage: &'static str, reason: impl Into<String>) -> Self {
        MsaError::Stage {
            stage,
            reason: reason.into(),
        }
    }
}

impl From<MsaError> for std::io::Error {
    fn from(e: MsaError) -> Self {
        match e {
            MsaError::Io(inner) => inner,
            other => std::io::Error::other(other.to_string()),
        }
    }
}
