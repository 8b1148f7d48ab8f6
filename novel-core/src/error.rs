//! Crate-wide error type.

use crate::completion::CompletionError;
use crate::config::ConfigError;
use crate::finalize::FinalizeError;
use crate::memory::{ArchiveError, MemoryError};
use crate::pipeline::PipelineError;
use crate::recovery::RecoveryFailure;
use thiserror::Error;

/// Any error this crate can surface.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Completion(#[from] CompletionError),

    #[error(transparent)]
    Recovery(#[from] RecoveryFailure),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Finalize(#[from] FinalizeError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// A concurrent finalization won; reload memory and retry.
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Memory(e) => e.is_conflict(),
            Error::Finalize(e) => e.is_conflict(),
            Error::Pipeline(PipelineError::Memory(e)) => e.is_conflict(),
            Error::Pipeline(PipelineError::Finalize(e)) => e.is_conflict(),
            _ => false,
        }
    }

    /// Structured output was cut off by a length limit.
    pub fn is_truncation(&self) -> bool {
        matches!(self, Error::Recovery(e) if e.is_truncation())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_through_layers() {
        let conflict = MemoryError::VersionConflict { expected: 2, actual: 3 };
        assert!(Error::from(conflict.clone()).is_conflict());
        assert!(Error::from(FinalizeError::from(conflict.clone())).is_conflict());
        assert!(Error::from(PipelineError::from(FinalizeError::from(conflict))).is_conflict());
        assert!(!Error::from(PipelineError::NoCandidates).is_conflict());
    }

    #[test]
    fn test_truncation() {
        let failure = crate::recovery::recover("{\"a\": [1, 2").unwrap_err();
        assert!(Error::from(failure).is_truncation());
    }
}
