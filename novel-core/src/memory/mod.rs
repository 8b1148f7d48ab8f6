//! Narrative memory for long-running stories.
//!
//! Memory accumulates chapter by chapter. Facts about characters, events and
//! causal threads are append-only and indexed by chapter, so "the current
//! value" is always a query (the latest row at or before a chapter) rather
//! than a field that gets overwritten. The project summary and plot arcs are
//! rewritten on every finalization and versioned for optimistic concurrency.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   NarrativeMemoryStore                          │
//! │                                                                 │
//! │  ┌──────────────────┐  ┌──────────────┐  ┌──────────────────┐  │
//! │  │ ProjectMemory    │  │ Character    │  │ Timeline         │  │
//! │  │ (summary, arcs,  │  │ States       │  │ (event DAG)      │  │
//! │  │  version)        │  │ (name, ch.)  │  │                  │  │
//! │  └──────────────────┘  └──────────────┘  └──────────────────┘  │
//! │                                                                 │
//! │  ┌──────────────────┐  ┌──────────────────────────────────────┐  │
//! │  │ ChapterSnapshots │  │ CausalChains (cause → pending effect)│  │
//! │  └──────────────────┘  └──────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!                   MemoryView (as of chapter N-1)
//! ```

mod causal;
mod character;
mod persist;
mod state;
mod store;
mod timeline;
mod view;

pub use causal::{CausalChain, CausalChainId, CausalStatus, Cause, CauseType, Effect, EffectType};
pub use character::{
    CharacterExtraction, CharacterState, CharacterStateUpdate, EmotionState, GoalProgress,
    HealthStatus, InventoryDelta, RelationshipDelta,
};
pub use persist::{ArchiveError, MemoryArchive};
pub use state::{
    word_count, ChapterSnapshot, CharacterArc, ConflictStatus, HookStatus, MainConflict,
    PlotArcs, ProjectId, ProjectMemoryState, UnresolvedHook, GLOBAL_SUMMARY_SOFT_CAP,
};
pub use store::{
    FinalizationBatch, FinalizationCommit, InMemoryStore, MemoryError, NarrativeMemoryStore,
    ProjectRecord,
};
pub use timeline::{
    creates_cycle, EventExtraction, EventType, ExtractedEvent, TimelineEvent, TimelineEventId,
};
pub use view::{ChapterDigest, MemoryView};
