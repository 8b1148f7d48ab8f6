//! The narrative memory store.
//!
//! [`NarrativeMemoryStore`] is the persistence seam. Writers go through
//! optimistic concurrency: every update names the version it was computed
//! from and fails with [`MemoryError::VersionConflict`] if someone else got
//! there first. [`InMemoryStore`] is the bundled implementation.

use super::causal::{CausalChain, CausalChainId, CausalStatus};
use super::character::{CharacterState, CharacterStateUpdate};
use super::state::{ChapterSnapshot, PlotArcs, ProjectId, ProjectMemoryState};
use super::timeline::{creates_cycle, TimelineEvent, TimelineEventId};
use super::view::MemoryView;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::ops::RangeInclusive;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Errors from memory store operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MemoryError {
    #[error("version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: u64, actual: u64 },

    #[error("edge {from} -> {to} would create a cycle in the timeline")]
    CycleRejected {
        from: TimelineEventId,
        to: TimelineEventId,
    },

    #[error("timeline event not found: {0}")]
    EventNotFound(TimelineEventId),

    #[error("timeline event already recorded: {0}")]
    DuplicateEvent(TimelineEventId),

    #[error("causal chain not found: {0}")]
    ChainNotFound(CausalChainId),

    #[error("causal chain {id} is {from}, cannot become {to}")]
    InvalidTransition {
        id: CausalChainId,
        from: &'static str,
        to: &'static str,
    },

    #[error("storage error: {0}")]
    Storage(String),
}

impl MemoryError {
    /// The caller should reload state and retry.
    pub fn is_conflict(&self) -> bool {
        matches!(self, MemoryError::VersionConflict { .. })
    }
}

/// Everything one chapter finalization writes, applied as a single unit.
#[derive(Debug, Clone, Default)]
pub struct FinalizationBatch {
    pub chapter_number: u32,
    pub global_summary: String,
    pub plot_arcs: PlotArcs,
    /// Replaces the stored value when set.
    pub story_timeline_summary: Option<String>,
    pub character_updates: Vec<CharacterStateUpdate>,
    pub timeline_events: Vec<TimelineEvent>,
    pub chapter_summary: Option<String>,
    pub word_count: usize,
}

/// Result of a successful finalization commit.
#[derive(Debug, Clone)]
pub struct FinalizationCommit {
    pub version: u64,
    pub snapshot: ChapterSnapshot,
    /// The character rows written for this chapter.
    pub character_states: Vec<CharacterState>,
    pub events_recorded: usize,
}

/// Durable store of narrative facts for any number of projects.
///
/// Unknown projects read as an empty state at version 0.
#[async_trait]
pub trait NarrativeMemoryStore: Send + Sync {
    async fn load_state(&self, project: &ProjectId) -> Result<ProjectMemoryState, MemoryError>;

    /// Replace summary and plot arcs if `expected_version` is current.
    /// Returns the new version.
    async fn commit_update(
        &self,
        project: &ProjectId,
        expected_version: u64,
        global_summary: String,
        plot_arcs: PlotArcs,
    ) -> Result<u64, MemoryError>;

    /// Apply a whole chapter finalization atomically.
    async fn commit_finalization(
        &self,
        project: &ProjectId,
        expected_version: u64,
        batch: FinalizationBatch,
    ) -> Result<FinalizationCommit, MemoryError>;

    async fn append_snapshot(&self, snapshot: ChapterSnapshot) -> Result<(), MemoryError>;

    /// Snapshots with chapter numbers in `chapters`, oldest first.
    async fn snapshots(
        &self,
        project: &ProjectId,
        chapters: RangeInclusive<u32>,
    ) -> Result<Vec<ChapterSnapshot>, MemoryError>;

    /// Insert a state, replacing any row for the same character and chapter.
    async fn upsert_character_state(
        &self,
        project: &ProjectId,
        state: CharacterState,
    ) -> Result<(), MemoryError>;

    /// All rows, optionally for one character, ordered by chapter.
    async fn character_states(
        &self,
        project: &ProjectId,
        character: Option<&str>,
    ) -> Result<Vec<CharacterState>, MemoryError>;

    /// Record an event. Rejects unknown causes and cycles.
    async fn record_timeline_event(
        &self,
        project: &ProjectId,
        event: TimelineEvent,
    ) -> Result<TimelineEventId, MemoryError>;

    /// Add a `cause -> effect` edge between two recorded events.
    async fn link_events(
        &self,
        project: &ProjectId,
        cause: TimelineEventId,
        effect: TimelineEventId,
    ) -> Result<(), MemoryError>;

    /// Events in `chapters`, in story order.
    async fn timeline(
        &self,
        project: &ProjectId,
        chapters: RangeInclusive<u32>,
    ) -> Result<Vec<TimelineEvent>, MemoryError>;

    async fn record_causal_chain(
        &self,
        project: &ProjectId,
        chain: CausalChain,
    ) -> Result<CausalChainId, MemoryError>;

    /// Pending to resolved. Resolving twice is a no-op that returns `false`.
    async fn resolve_causal_chain(
        &self,
        project: &ProjectId,
        id: CausalChainId,
        effect_chapter: u32,
        resolution: String,
    ) -> Result<bool, MemoryError>;

    /// Pending to abandoned.
    async fn abandon_causal_chain(
        &self,
        project: &ProjectId,
        id: CausalChainId,
    ) -> Result<bool, MemoryError>;

    async fn causal_chains(&self, project: &ProjectId) -> Result<Vec<CausalChain>, MemoryError>;

    // =========================================================================
    // Derived queries
    // =========================================================================

    /// The latest state of `character` with chapter number `<= chapter`.
    async fn character_state_at(
        &self,
        project: &ProjectId,
        character: &str,
        chapter: u32,
    ) -> Result<Option<CharacterState>, MemoryError> {
        let states = self.character_states(project, Some(character)).await?;
        Ok(latest_at(&states, chapter).into_iter().next())
    }

    /// The latest state of every character as of `chapter`.
    async fn character_states_at(
        &self,
        project: &ProjectId,
        chapter: u32,
    ) -> Result<Vec<CharacterState>, MemoryError> {
        let states = self.character_states(project, None).await?;
        Ok(latest_at(&states, chapter))
    }

    /// Up to `limit` most recent rows from chapters before `before_chapter`.
    async fn recent_character_states(
        &self,
        project: &ProjectId,
        before_chapter: u32,
        limit: usize,
    ) -> Result<Vec<CharacterState>, MemoryError> {
        let mut states: Vec<_> = self
            .character_states(project, None)
            .await?
            .into_iter()
            .filter(|s| s.chapter_number < before_chapter)
            .collect();
        states.sort_by(|a, b| b.chapter_number.cmp(&a.chapter_number));
        states.truncate(limit);
        Ok(states)
    }

    /// Chains still open at the end of `as_of_chapter`, most important first.
    async fn pending_causal_chains(
        &self,
        project: &ProjectId,
        as_of_chapter: u32,
    ) -> Result<Vec<CausalChain>, MemoryError> {
        let mut chains: Vec<_> = self
            .causal_chains(project)
            .await?
            .into_iter()
            .filter(|c| c.pending_as_of(as_of_chapter))
            .collect();
        chains.sort_by(|a, b| {
            b.importance
                .cmp(&a.importance)
                .then(a.cause.chapter.cmp(&b.cause.chapter))
        });
        Ok(chains)
    }

    /// The most recent snapshot written for `chapter`.
    async fn snapshot_for(
        &self,
        project: &ProjectId,
        chapter: u32,
    ) -> Result<Option<ChapterSnapshot>, MemoryError> {
        Ok(self.snapshots(project, chapter..=chapter).await?.pop())
    }

    /// Memory as it stood at the end of chapter `chapter - 1`.
    async fn view_before(
        &self,
        project: &ProjectId,
        chapter: u32,
    ) -> Result<MemoryView, MemoryError> {
        MemoryView::assemble(self, project, chapter).await
    }
}

/// Latest row per character with chapter `<= chapter`, sorted by name.
pub(crate) fn latest_at(states: &[CharacterState], chapter: u32) -> Vec<CharacterState> {
    let mut latest: BTreeMap<&str, &CharacterState> = BTreeMap::new();
    for state in states.iter().filter(|s| s.chapter_number <= chapter) {
        match latest.get(state.character.as_str()) {
            Some(current) if current.chapter_number > state.chapter_number => {}
            _ => {
                latest.insert(state.character.as_str(), state);
            }
        }
    }
    latest.into_values().cloned().collect()
}

// =============================================================================
// In-memory implementation
// =============================================================================

/// All stored data for one project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub state: ProjectMemoryState,
    pub snapshots: Vec<ChapterSnapshot>,
    pub character_states: Vec<CharacterState>,
    pub events: Vec<TimelineEvent>,
    pub causal_chains: Vec<CausalChain>,
}

impl ProjectRecord {
    pub fn new(project: ProjectId) -> Self {
        Self {
            state: ProjectMemoryState::new(project),
            snapshots: Vec::new(),
            character_states: Vec::new(),
            events: Vec::new(),
            causal_chains: Vec::new(),
        }
    }

    fn check_version(&self, expected: u64) -> Result<(), MemoryError> {
        if self.state.version != expected {
            return Err(MemoryError::VersionConflict {
                expected,
                actual: self.state.version,
            });
        }
        Ok(())
    }

    fn bump_version(&mut self) -> u64 {
        self.state.version += 1;
        self.state.updated_at = Some(Utc::now());
        self.state.version
    }

    fn upsert_state(&mut self, state: CharacterState) {
        match self
            .character_states
            .iter_mut()
            .find(|s| s.character == state.character && s.chapter_number == state.chapter_number)
        {
            Some(existing) => *existing = state,
            None => self.character_states.push(state),
        }
    }

    fn event_index(&self, id: TimelineEventId) -> Option<usize> {
        self.events.iter().position(|e| e.id == id)
    }

    fn insert_event(&mut self, event: TimelineEvent) -> Result<TimelineEventId, MemoryError> {
        if self.event_index(event.id).is_some() {
            return Err(MemoryError::DuplicateEvent(event.id));
        }
        if let Some(&target) = event.leads_to.iter().find(|t| self.event_index(**t).is_none()) {
            if target == event.id {
                return Err(MemoryError::CycleRejected {
                    from: event.id,
                    to: target,
                });
            }
            return Err(MemoryError::EventNotFound(target));
        }

        if let Some(cause) = event.caused_by {
            if cause == event.id {
                return Err(MemoryError::CycleRejected {
                    from: cause,
                    to: event.id,
                });
            }
            if self.event_index(cause).is_none() {
                return Err(MemoryError::EventNotFound(cause));
            }
            // Check the new edge against the graph that already contains the
            // event's outgoing edges.
            let mut candidate = event.clone();
            candidate.caused_by = None;
            if creates_cycle(
                self.events.iter().chain(std::iter::once(&candidate)),
                cause,
                event.id,
            ) {
                return Err(MemoryError::CycleRejected {
                    from: cause,
                    to: event.id,
                });
            }
        }

        let id = event.id;
        self.events.push(event);
        Ok(id)
    }

    fn link(&mut self, cause: TimelineEventId, effect: TimelineEventId) -> Result<(), MemoryError> {
        let cause_idx = self
            .event_index(cause)
            .ok_or(MemoryError::EventNotFound(cause))?;
        if self.event_index(effect).is_none() {
            return Err(MemoryError::EventNotFound(effect));
        }
        if self.events[cause_idx].leads_to.contains(&effect) {
            return Ok(());
        }
        if creates_cycle(&self.events, cause, effect) {
            return Err(MemoryError::CycleRejected {
                from: cause,
                to: effect,
            });
        }
        self.events[cause_idx].leads_to.push(effect);
        Ok(())
    }

    fn chain_mut(&mut self, id: CausalChainId) -> Result<&mut CausalChain, MemoryError> {
        self.causal_chains
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(MemoryError::ChainNotFound(id))
    }

    fn apply_finalization(&mut self, batch: FinalizationBatch) -> Result<FinalizationCommit, MemoryError> {
        let chapter = batch.chapter_number;

        // Events go first: they are the only step that can fail, and a
        // rejected one rolls back the events already inserted.
        let events_before = self.events.len();
        let mut events_recorded = 0;
        for mut event in batch.timeline_events {
            if event.chapter_number == 0 {
                event.chapter_number = chapter;
            }
            if let Err(e) = self.insert_event(event) {
                self.events.truncate(events_before);
                return Err(e);
            }
            events_recorded += 1;
        }

        let mut written = Vec::new();
        for update in &batch.character_updates {
            let name = update.character_name.trim();
            if name.is_empty() {
                continue;
            }
            let previous = latest_at(&self.character_states_of(name), chapter.saturating_sub(1));
            let mut state = CharacterState::carry_forward(previous.first(), name, chapter);
            state.apply(update);
            self.upsert_state(state.clone());
            written.push(state);
        }

        self.state.global_summary = batch.global_summary;
        self.state.plot_arcs = batch.plot_arcs;
        if batch.story_timeline_summary.is_some() {
            self.state.story_timeline_summary = batch.story_timeline_summary;
        }
        self.state.last_updated_chapter = self.state.last_updated_chapter.max(chapter);
        let version = self.bump_version();

        let snapshot = ChapterSnapshot {
            project_id: self.state.project_id.clone(),
            chapter_number: chapter,
            global_summary: self.state.global_summary.clone(),
            character_states: latest_at(&self.character_states, chapter),
            plot_arcs: self.state.plot_arcs.clone(),
            chapter_summary: batch.chapter_summary,
            word_count: batch.word_count,
            version,
            created_at: Utc::now(),
        };
        self.snapshots.push(snapshot.clone());

        Ok(FinalizationCommit {
            version,
            snapshot,
            character_states: written,
            events_recorded,
        })
    }

    fn character_states_of(&self, name: &str) -> Vec<CharacterState> {
        self.character_states
            .iter()
            .filter(|s| s.character == name)
            .cloned()
            .collect()
    }
}

/// A [`NarrativeMemoryStore`] held in process memory.
///
/// Every write takes the lock once, so version checks and the writes they
/// guard are atomic.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    projects: RwLock<HashMap<ProjectId, ProjectRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from previously exported records.
    pub fn from_records(records: impl IntoIterator<Item = ProjectRecord>) -> Self {
        let projects = records
            .into_iter()
            .map(|r| (r.state.project_id.clone(), r))
            .collect();
        Self {
            projects: RwLock::new(projects),
        }
    }

    /// Copy out everything stored for a project.
    pub async fn export(&self, project: &ProjectId) -> Option<ProjectRecord> {
        self.projects.read().await.get(project).cloned()
    }

    /// Copy out every project.
    pub async fn export_all(&self) -> Vec<ProjectRecord> {
        let projects = self.projects.read().await;
        let mut records: Vec<_> = projects.values().cloned().collect();
        records.sort_by(|a, b| a.state.project_id.cmp(&b.state.project_id));
        records
    }

    async fn read<T>(&self, project: &ProjectId, f: impl FnOnce(&ProjectRecord) -> T) -> T {
        let projects = self.projects.read().await;
        match projects.get(project) {
            Some(record) => f(record),
            None => f(&ProjectRecord::new(project.clone())),
        }
    }

    async fn write<T>(
        &self,
        project: &ProjectId,
        f: impl FnOnce(&mut ProjectRecord) -> Result<T, MemoryError>,
    ) -> Result<T, MemoryError> {
        let mut projects = self.projects.write().await;
        let record = projects
            .entry(project.clone())
            .or_insert_with(|| ProjectRecord::new(project.clone()));
        f(record)
    }
}

#[async_trait]
impl NarrativeMemoryStore for InMemoryStore {
    async fn load_state(&self, project: &ProjectId) -> Result<ProjectMemoryState, MemoryError> {
        Ok(self.read(project, |r| r.state.clone()).await)
    }

    async fn commit_update(
        &self,
        project: &ProjectId,
        expected_version: u64,
        global_summary: String,
        plot_arcs: PlotArcs,
    ) -> Result<u64, MemoryError> {
        let version = self
            .write(project, |record| {
                record.check_version(expected_version)?;
                record.state.global_summary = global_summary;
                record.state.plot_arcs = plot_arcs;
                Ok(record.bump_version())
            })
            .await?;
        debug!(project = %project, version, "memory state committed");
        Ok(version)
    }

    async fn commit_finalization(
        &self,
        project: &ProjectId,
        expected_version: u64,
        batch: FinalizationBatch,
    ) -> Result<FinalizationCommit, MemoryError> {
        let chapter = batch.chapter_number;
        let commit = self
            .write(project, |record| {
                record.check_version(expected_version)?;
                record.apply_finalization(batch)
            })
            .await?;
        info!(
            project = %project,
            chapter,
            version = commit.version,
            characters = commit.character_states.len(),
            events = commit.events_recorded,
            "chapter finalization committed"
        );
        Ok(commit)
    }

    async fn append_snapshot(&self, snapshot: ChapterSnapshot) -> Result<(), MemoryError> {
        let project = snapshot.project_id.clone();
        self.write(&project, |record| {
            record.snapshots.push(snapshot);
            Ok(())
        })
        .await
    }

    async fn snapshots(
        &self,
        project: &ProjectId,
        chapters: RangeInclusive<u32>,
    ) -> Result<Vec<ChapterSnapshot>, MemoryError> {
        Ok(self
            .read(project, |r| {
                let mut snapshots: Vec<_> = r
                    .snapshots
                    .iter()
                    .filter(|s| chapters.contains(&s.chapter_number))
                    .cloned()
                    .collect();
                // Stable: re-finalized chapters keep append order.
                snapshots.sort_by_key(|s| s.chapter_number);
                snapshots
            })
            .await)
    }

    async fn upsert_character_state(
        &self,
        project: &ProjectId,
        state: CharacterState,
    ) -> Result<(), MemoryError> {
        self.write(project, |record| {
            record.upsert_state(state);
            Ok(())
        })
        .await
    }

    async fn character_states(
        &self,
        project: &ProjectId,
        character: Option<&str>,
    ) -> Result<Vec<CharacterState>, MemoryError> {
        Ok(self
            .read(project, |r| {
                let mut states: Vec<_> = r
                    .character_states
                    .iter()
                    .filter(|s| character.map_or(true, |name| s.character == name))
                    .cloned()
                    .collect();
                states.sort_by_key(|s| s.chapter_number);
                states
            })
            .await)
    }

    async fn record_timeline_event(
        &self,
        project: &ProjectId,
        event: TimelineEvent,
    ) -> Result<TimelineEventId, MemoryError> {
        self.write(project, |record| record.insert_event(event)).await
    }

    async fn link_events(
        &self,
        project: &ProjectId,
        cause: TimelineEventId,
        effect: TimelineEventId,
    ) -> Result<(), MemoryError> {
        self.write(project, |record| record.link(cause, effect)).await
    }

    async fn timeline(
        &self,
        project: &ProjectId,
        chapters: RangeInclusive<u32>,
    ) -> Result<Vec<TimelineEvent>, MemoryError> {
        Ok(self
            .read(project, |r| {
                let mut events: Vec<_> = r
                    .events
                    .iter()
                    .filter(|e| chapters.contains(&e.chapter_number))
                    .cloned()
                    .collect();
                events.sort_by_key(|e| (e.chapter_number, e.recorded_at));
                events
            })
            .await)
    }

    async fn record_causal_chain(
        &self,
        project: &ProjectId,
        chain: CausalChain,
    ) -> Result<CausalChainId, MemoryError> {
        self.write(project, |record| {
            let id = chain.id;
            match record.causal_chains.iter_mut().find(|c| c.id == id) {
                Some(existing) => *existing = chain,
                None => record.causal_chains.push(chain),
            }
            Ok(id)
        })
        .await
    }

    async fn resolve_causal_chain(
        &self,
        project: &ProjectId,
        id: CausalChainId,
        effect_chapter: u32,
        resolution: String,
    ) -> Result<bool, MemoryError> {
        self.write(project, |record| {
            record
                .chain_mut(id)?
                .resolve(effect_chapter, resolution)
                .map_err(|from| MemoryError::InvalidTransition {
                    id,
                    from: from.name(),
                    to: CausalStatus::Resolved.name(),
                })
        })
        .await
    }

    async fn abandon_causal_chain(
        &self,
        project: &ProjectId,
        id: CausalChainId,
    ) -> Result<bool, MemoryError> {
        self.write(project, |record| {
            record
                .chain_mut(id)?
                .abandon()
                .map_err(|from| MemoryError::InvalidTransition {
                    id,
                    from: from.name(),
                    to: CausalStatus::Abandoned.name(),
                })
        })
        .await
    }

    async fn causal_chains(&self, project: &ProjectId) -> Result<Vec<CausalChain>, MemoryError> {
        Ok(self.read(project, |r| r.causal_chains.clone()).await)
    }
}
