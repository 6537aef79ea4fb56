use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SymlabError {
    #[error("Unable to find data directory: {}", .0.display())]
    MissingDataDir(PathBuf),

    #[error("Time series resolution must be >= 1 (got {0})")]
    InvalidResolution(i64),

    #[error("Time series header mismatch in {run}: expected [{expected}], found [{found}]")]
    TimeSeriesHeaderMismatch {
        run: String,
        expected: String,
        found: String,
    },

    #[error("no row with time index {index} in {file}")]
    MissingTimeIndex { file: String, index: String },

    #[error("run {run} is missing parameter {name}")]
    MissingParameter { run: String, name: String },
}

impl SymlabError {
    /// Errors the CLI reports on stdout and exits with status -1 for.
    pub fn exits_with_diagnostic(&self) -> bool {
        matches!(
            self,
            SymlabError::MissingDataDir(_)
                | SymlabError::InvalidResolution(_)
                | SymlabError::TimeSeriesHeaderMismatch { .. }
        )
    }
}
