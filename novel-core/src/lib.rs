//! Structured-output recovery and narrative consistency for serialized fiction.
//!
//! This crate provides:
//! - Recovery of structured data from free-form model output
//! - Versioned, chapter-indexed narrative memory
//! - Severity-tiered consistency checking with bounded automatic repair
//! - Multi-dimension critique and a bounded critique/revise loop
//! - Candidate selection and chapter finalization
//!
//! # Quick Start
//!
//! ```ignore
//! use novel_core::memory::{InMemoryStore, ProjectId};
//! use novel_core::selection::CompletionReader;
//! use novel_core::{ChapterPipeline, CritiqueContext, StorySetting};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let claude = claude::Claude::from_env()?;
//!     let store = Arc::new(InMemoryStore::new());
//!     let reader = Arc::new(CompletionReader::new(claude.clone()));
//!     let pipeline = ChapterPipeline::new(claude, store, reader);
//!
//!     let outcome = pipeline
//!         .run(
//!             &ProjectId::new("my-novel"),
//!             1,
//!             vec![draft_a, draft_b],
//!             &StorySetting::default().with_genre("xianxia"),
//!             &CritiqueContext::default(),
//!         )
//!         .await?;
//!     println!("{}", outcome.text());
//!     Ok(())
//! }
//! ```

pub mod completion;
pub mod config;
pub mod consistency;
pub mod critique;
pub mod error;
pub mod finalize;
pub mod memory;
pub mod pipeline;
pub mod recovery;
pub mod selection;
pub mod testing;

// Re-export for convenience
pub use completion::{Completion, CompletionError, CompletionRequest, TextCompletion};
pub use config::{ConfigError, PipelineConfig};
pub use consistency::{
    CheckResult, ConsistencyChecker, ConsistencyConfig, ConsistencyViolation, FixReport,
    Resolution, Severity, StorySetting, ViolationCategory,
};
pub use critique::{
    AggregateReport, CritiqueConfig, CritiqueContext, CritiqueDimension, CritiqueEngine,
    CritiqueIssue, DimensionReport, LoopOutcome, LoopStatus,
};
pub use error::{Error, Result};
pub use finalize::{FinalizationCoordinator, FinalizeConfig, FinalizeError, FinalizeReport};
pub use pipeline::{ChapterOutcome, ChapterPipeline, PipelineError};
pub use recovery::{
    is_structurally_complete, recover, recover_as, FailureKind, Recovered, RecoveryFailure, Strategy,
};
pub use selection::{select_best_version, Candidate, ReaderFeedback, ReaderSimulation};
