//! Chapter finalization.
//!
//! Once a chapter is accepted, the coordinator asks the model to fold it into
//! narrative memory: a rewritten story summary, updated plot threads, a short
//! chapter summary, per-character state changes and key timeline events.
//! Each of those calls is fail-soft. Everything they produce is then written
//! with a single versioned commit, so a finalization either lands whole or
//! not at all.

use crate::completion::{complete_within, CompletionRequest, TextCompletion};
use crate::memory::{
    word_count, ChapterDigest, ChapterSnapshot, CharacterExtraction, CharacterStateUpdate,
    EventExtraction, FinalizationBatch, MemoryError, MemoryView, NarrativeMemoryStore, PlotArcs,
    ProjectId, TimelineEvent, GLOBAL_SUMMARY_SOFT_CAP,
};
use crate::recovery::{self, truncate_chars};
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

const CHAPTER_SUMMARY_SOURCE_CHARS: usize = 5000;
const EXTRACTION_SOURCE_CHARS: usize = 8000;

/// Errors that stop a finalization.
#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("chapter numbers start at 1")]
    InvalidChapter,

    #[error("chapter {0} has no text")]
    EmptyChapter(u32),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

impl FinalizeError {
    /// Another finalization committed first; reload and retry.
    pub fn is_conflict(&self) -> bool {
        matches!(self, FinalizeError::Memory(e) if e.is_conflict())
    }
}

/// Configuration for [`FinalizationCoordinator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalizeConfig {
    pub summary_temperature: f32,
    pub summary_max_tokens: usize,
    pub plot_arcs_max_tokens: usize,
    pub chapter_summary_max_tokens: usize,
    pub extraction_temperature: f32,

    /// Hard cap on the stored story summary, in characters.
    pub summary_char_cap: usize,

    pub extract_characters: bool,
    pub extract_events: bool,

    pub timeout_secs: u64,
}

impl Default for FinalizeConfig {
    fn default() -> Self {
        Self {
            summary_temperature: 0.3,
            summary_max_tokens: 3000,
            plot_arcs_max_tokens: 2000,
            chapter_summary_max_tokens: 500,
            extraction_temperature: 0.2,
            summary_char_cap: GLOBAL_SUMMARY_SOFT_CAP,
            extract_characters: true,
            extract_events: true,
            timeout_secs: 120,
        }
    }
}

impl FinalizeConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Which parts of memory a finalization produced fresh values for.
///
/// A part that is `false` (or zero) kept its previous value because the model
/// call behind it failed or returned nothing usable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FinalizeUpdates {
    pub global_summary: bool,
    pub plot_arcs: bool,
    pub chapter_summary: bool,
    pub character_states: usize,
    pub timeline_events: usize,
}

/// Result of a successful finalization.
#[derive(Debug, Clone)]
pub struct FinalizeReport {
    pub project_id: ProjectId,
    pub chapter_number: u32,
    pub new_version: u64,
    pub updated: FinalizeUpdates,
    pub snapshot: ChapterSnapshot,
}

/// Context for writing the next chapter.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizeContext {
    pub global_summary: Option<String>,
    pub plot_arcs: Option<PlotArcs>,
    /// Newest first, at most three.
    pub recent_snapshots: Vec<ChapterDigest>,
}

/// Folds accepted chapters into narrative memory.
pub struct FinalizationCoordinator<C> {
    completion: C,
    store: Arc<dyn NarrativeMemoryStore>,
    config: FinalizeConfig,
}

impl<C: TextCompletion> FinalizationCoordinator<C> {
    pub fn new(completion: C, store: Arc<dyn NarrativeMemoryStore>) -> Self {
        Self {
            completion,
            store,
            config: FinalizeConfig::default(),
        }
    }

    pub fn with_config(mut self, config: FinalizeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &FinalizeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn NarrativeMemoryStore> {
        &self.store
    }

    /// Finalize `chapter` of `project`.
    ///
    /// `tracked_characters` narrows character extraction; when empty, every
    /// character appearing in the chapter is extracted. A
    /// [`MemoryError::VersionConflict`] means another finalization committed
    /// first and nothing was written.
    pub async fn finalize_chapter(
        &self,
        project: &ProjectId,
        chapter: u32,
        chapter_text: &str,
        tracked_characters: &[String],
    ) -> Result<FinalizeReport, FinalizeError> {
        if chapter == 0 {
            return Err(FinalizeError::InvalidChapter);
        }
        if chapter_text.trim().is_empty() {
            return Err(FinalizeError::EmptyChapter(chapter));
        }

        let expected_version = self.store.load_state(project).await?.version;
        let view = self.store.view_before(project, chapter).await?;
        info!(project = %project, chapter, expected_version, "finalizing chapter");

        let (summary, arcs, chapter_summary, characters, events) = futures::join!(
            self.rewrite_summary(chapter_text, &view),
            self.update_plot_arcs(chapter_text, &view),
            self.summarize_chapter(chapter_text, chapter),
            self.extract_characters(chapter_text, &view, tracked_characters),
            self.extract_events(chapter_text, chapter),
        );

        let updated = FinalizeUpdates {
            global_summary: summary.is_some(),
            plot_arcs: arcs.is_some(),
            chapter_summary: chapter_summary.is_some(),
            character_states: characters.len(),
            timeline_events: events.len(),
        };

        let batch = FinalizationBatch {
            chapter_number: chapter,
            global_summary: summary.unwrap_or_else(|| view.global_summary.clone()),
            plot_arcs: arcs.unwrap_or_else(|| view.plot_arcs.clone()),
            story_timeline_summary: None,
            character_updates: characters,
            timeline_events: events,
            chapter_summary,
            word_count: word_count(chapter_text),
        };

        let commit = self
            .store
            .commit_finalization(project, expected_version, batch)
            .await
            .map_err(|e| {
                if e.is_conflict() {
                    warn!(project = %project, chapter, error = %e, "finalization lost a race");
                }
                e
            })?;

        info!(
            project = %project,
            chapter,
            version = commit.version,
            summary = updated.global_summary,
            plot_arcs = updated.plot_arcs,
            characters = updated.character_states,
            events = updated.timeline_events,
            "chapter finalized"
        );

        Ok(FinalizeReport {
            project_id: project.clone(),
            chapter_number: chapter,
            new_version: commit.version,
            updated,
            snapshot: commit.snapshot,
        })
    }

    /// Summary, plot arcs and recent chapter summaries as known before `chapter`.
    pub async fn finalize_context(
        &self,
        project: &ProjectId,
        chapter: u32,
    ) -> Result<FinalizeContext, FinalizeError> {
        let view = self.store.view_before(project, chapter).await?;
        Ok(FinalizeContext {
            global_summary: Some(view.global_summary).filter(|s| !s.is_empty()),
            plot_arcs: Some(view.plot_arcs).filter(|a| !a.is_empty()),
            recent_snapshots: view.recent_chapters,
        })
    }

    // =========================================================================
    // Model calls. Each returns `None` (or empty) instead of failing.
    // =========================================================================

    async fn ask(&self, prompt: String, temperature: f32, max_tokens: usize, what: &str) -> Option<String> {
        let request = CompletionRequest::prompt(prompt)
            .with_temperature(temperature)
            .with_max_tokens(max_tokens)
            .with_timeout(self.config.timeout());
        match complete_within(&self.completion, request).await {
            Ok(completion) if completion.text.trim().is_empty() => {
                warn!(what, "empty reply, keeping previous value");
                None
            }
            Ok(completion) => {
                if completion.truncated {
                    warn!(what, "reply hit the token limit");
                }
                Some(completion.text)
            }
            Err(e) => {
                warn!(what, error = %e, "finalization call failed, keeping previous value");
                None
            }
        }
    }

    async fn rewrite_summary(&self, chapter_text: &str, view: &MemoryView) -> Option<String> {
        let previous = if view.global_summary.is_empty() {
            "(empty)"
        } else {
            view.global_summary.as_str()
        };
        let cap = self.config.summary_char_cap;
        let prompt = format!(
            r#"Update the story summary with the newly finished chapter.

[New chapter]
{chapter_text}

[Current summary]
{previous}

Requirements:
- Keep important existing information and fold in the new plot points.
- Describe the whole story's progress concisely and coherently.
- Stay objective. Do not speculate or interpret.
- Highlight turning points, relationship changes and foreshadowing.
- Stay under {cap} characters.

Return only the summary text."#
        );
        let text = self
            .ask(prompt, self.config.summary_temperature, self.config.summary_max_tokens, "global summary")
            .await?;
        let text = recovery::strip_reasoning(&text);
        (!text.is_empty()).then(|| truncate_chars(&text, cap).to_string())
    }

    async fn update_plot_arcs(&self, chapter_text: &str, view: &MemoryView) -> Option<PlotArcs> {
        let current = serde_json::to_string_pretty(&view.plot_arcs).unwrap_or_else(|_| "{}".to_string());
        let chapter = view.chapter;
        let prompt = format!(
            r#"Update the plot threads after this chapter.

[New chapter]
{chapter_text}

[Chapter number]
{chapter}

[Current plot threads]
{current}

1. unresolved_hooks: add newly planted hooks, mark paid-off hooks "resolved", mark strengthened hooks "reinforced".
2. main_conflicts: add new conflicts and update the status of existing ones.
3. character_arcs: update each character's current stage and next milestone.

Respond with ONLY the updated JSON:
{{
  "unresolved_hooks": [
    {{"id": "hook_1", "description": "...", "planted_chapter": 1, "expected_payoff": 10, "status": "active|reinforced|resolved"}}
  ],
  "main_conflicts": [
    {{"id": "conflict_1", "description": "...", "status": "active|escalating|resolved"}}
  ],
  "character_arcs": [
    {{"character": "...", "current_stage": "...", "next_milestone": "..."}}
  ]
}}"#
        );
        let text = self
            .ask(prompt, self.config.summary_temperature, self.config.plot_arcs_max_tokens, "plot arcs")
            .await?;
        recovery::recover_as::<PlotArcs>(&text)
            .map_err(|e| warn!(error = %e, "unreadable plot threads, keeping previous"))
            .ok()
    }

    async fn summarize_chapter(&self, chapter_text: &str, chapter: u32) -> Option<String> {
        let source = truncate_chars(chapter_text, CHAPTER_SUMMARY_SOURCE_CHARS);
        let prompt = format!(
            r#"Summarize chapter {chapter} in 100 to 200 characters.

[Chapter text]
{source}

- Cover the main events and turning points.
- Highlight what characters did and how they felt.
- Stay objective.

Return only the summary."#
        );
        let text = self
            .ask(
                prompt,
                self.config.summary_temperature,
                self.config.chapter_summary_max_tokens,
                "chapter summary",
            )
            .await?;
        let text = recovery::strip_reasoning(&text);
        (!text.is_empty()).then_some(text)
    }

    async fn extract_characters(
        &self,
        chapter_text: &str,
        view: &MemoryView,
        tracked: &[String],
    ) -> Vec<CharacterStateUpdate> {
        if !self.config.extract_characters {
            return Vec::new();
        }

        let source = truncate_chars(chapter_text, EXTRACTION_SOURCE_CHARS);
        let mut known = String::new();
        for state in &view.character_states {
            let _ = writeln!(known, "- {}", state.describe());
        }
        if known.is_empty() {
            known.push_str("(none recorded)\n");
        }
        let tracked = if tracked.is_empty() {
            "every character who appears".to_string()
        } else {
            serde_json::to_string(tracked).unwrap_or_default()
        };

        let prompt = format!(
            r#"Extract each character's state changes from this chapter.

[Chapter]
{source}

[Known character states]
{known}
[Characters to track]
{tracked}

Respond with ONLY a JSON object:
{{
  "character_states": [
    {{
      "character_name": "...",
      "location": "...",
      "emotion": "...",
      "emotion_intensity": 1-10,
      "emotion_reason": "...",
      "health_status": "healthy|injured|critical|dead",
      "injuries": ["..."],
      "inventory_changes": {{"gained": ["..."], "lost": ["..."]}},
      "relationship_changes": [{{"target": "...", "change": "..."}}],
      "new_knowledge": ["..."],
      "goal_progress": [{{"goal": "...", "progress": "..."}}]
    }}
  ]
}}

Only include characters who appear or change in this chapter."#
        );
        let Some(text) = self
            .ask(prompt, self.config.extraction_temperature, 4000, "character states")
            .await
        else {
            return Vec::new();
        };
        match recovery::recover_as::<CharacterExtraction>(&text) {
            Ok(extraction) => extraction
                .character_states
                .into_iter()
                .filter(|u| !u.character_name.trim().is_empty())
                .collect(),
            Err(e) => {
                warn!(error = %e, "unreadable character states");
                Vec::new()
            }
        }
    }

    async fn extract_events(&self, chapter_text: &str, chapter: u32) -> Vec<TimelineEvent> {
        if !self.config.extract_events {
            return Vec::new();
        }

        let source = truncate_chars(chapter_text, EXTRACTION_SOURCE_CHARS);
        let prompt = format!(
            r#"Extract the key events of this chapter.

[Chapter]
{source}

Respond with ONLY a JSON object:
{{
  "events": [
    {{
      "event_title": "short title",
      "event_description": "...",
      "event_type": "plot|character|world|foreshadowing",
      "story_time": "in-story time, e.g. the third morning",
      "involved_characters": ["..."],
      "location": "...",
      "importance": 1-10,
      "is_turning_point": false
    }}
  ]
}}

Only important events; skip trivial details."#
        );
        let Some(text) = self
            .ask(prompt, self.config.extraction_temperature, 3000, "timeline events")
            .await
        else {
            return Vec::new();
        };
        match recovery::recover_as::<EventExtraction>(&text) {
            Ok(extraction) => extraction
                .events
                .into_iter()
                .filter(|e| !e.event_title.trim().is_empty())
                .map(|e| {
                    let mut event = TimelineEvent::from(e);
                    event.chapter_number = chapter;
                    event
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "unreadable timeline events");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{HookStatus, InMemoryStore};
    use crate::testing::ScriptedCompletion;

    const ARCS: &str = r#"```json
{"unresolved_hooks": [{"id": "hook_1", "description": "The sealed letter", "planted_chapter": 1, "expected_payoff": "6", "status": "active"}],
 "main_conflicts": [], "character_arcs": []}
```"#;

    const CHARACTERS: &str = r#"{"character_states": [
  {"character_name": "Lin", "location": "Harbor", "emotion": "wary", "emotion_intensity": "7",
   "inventory_changes": {"gained": ["sealed letter"], "lost": []}},
  {"character_name": "", "location": "nowhere"}
]}"#;

    const EVENTS: &str = r#"{"events": [
  {"event_title": "Letter arrives", "event_description": "A courier hands Lin a letter.", "importance": 8, "is_turning_point": true},
  {"event_title": "", "event_description": "noise"}
]}"#;

    fn scripted() -> ScriptedCompletion {
        ScriptedCompletion::new()
            .route("Update the story summary", "Lin receives a sealed letter at the harbor.")
            .route("Update the plot threads", ARCS)
            .route("Summarize chapter", "A courier brings Lin a letter.")
            .route("Extract each character", CHARACTERS)
            .route("Extract the key events", EVENTS)
    }

    fn coordinator(completion: ScriptedCompletion) -> (FinalizationCoordinator<ScriptedCompletion>, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        (FinalizationCoordinator::new(completion, store.clone()), store)
    }

    #[tokio::test]
    async fn test_finalize_chapter_commits_everything() {
        let (coordinator, store) = coordinator(scripted());
        let project = ProjectId::new("novel");
        let report = coordinator
            .finalize_chapter(&project, 1, "The courier found Lin at the harbor.", &["Lin".to_string()])
            .await
            .unwrap();

        assert_eq!(report.new_version, 1);
        assert_eq!(
            report.updated,
            FinalizeUpdates {
                global_summary: true,
                plot_arcs: true,
                chapter_summary: true,
                character_states: 1,
                timeline_events: 1,
            }
        );
        assert_eq!(report.snapshot.chapter_number, 1);
        assert_eq!(report.snapshot.chapter_summary.as_deref(), Some("A courier brings Lin a letter."));

        let state = store.load_state(&project).await.unwrap();
        assert_eq!(state.global_summary, "Lin receives a sealed letter at the harbor.");
        assert_eq!(state.plot_arcs.unresolved_hooks[0].expected_payoff_chapter, Some(6));
        assert_eq!(state.plot_arcs.unresolved_hooks[0].status, HookStatus::Active);

        let lin = store
            .character_state_at(&project, "Lin", 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lin.location.as_deref(), Some("Harbor"));
        assert!(lin.inventory.contains(&"sealed letter".to_string()));

        let events = store.timeline(&project, 1..=1).await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].is_turning_point);
    }

    #[tokio::test]
    async fn test_failed_calls_keep_previous_values() {
        let (coordinator, store) = coordinator(scripted());
        let project = ProjectId::new("novel");
        coordinator
            .finalize_chapter(&project, 1, "Chapter one.", &[])
            .await
            .unwrap();

        // Every call fails this time.
        let failing = FinalizationCoordinator::new(ScriptedCompletion::new(), store.clone());
        let report = failing
            .finalize_chapter(&project, 2, "Chapter two.", &[])
            .await
            .unwrap();

        assert_eq!(report.new_version, 2);
        assert_eq!(report.updated, FinalizeUpdates::default());
        let state = store.load_state(&project).await.unwrap();
        assert_eq!(state.global_summary, "Lin receives a sealed letter at the harbor.");
        assert_eq!(state.plot_arcs.unresolved_hooks.len(), 1);
        assert_eq!(state.last_updated_chapter, 2);
        assert!(report.snapshot.chapter_summary.is_none());
    }

    #[tokio::test]
    async fn test_summary_is_capped() {
        let long = "x".repeat(3000);
        let completion = ScriptedCompletion::new().route("Update the story summary", long);
        let (coordinator, store) = coordinator(completion);
        let project = ProjectId::new("novel");
        coordinator.finalize_chapter(&project, 1, "text", &[]).await.unwrap();

        let state = store.load_state(&project).await.unwrap();
        assert_eq!(state.global_summary.chars().count(), GLOBAL_SUMMARY_SOFT_CAP);
    }

    #[tokio::test]
    async fn test_rejects_empty_chapter() {
        let (coordinator, _) = coordinator(scripted());
        let project = ProjectId::new("novel");
        assert!(matches!(
            coordinator.finalize_chapter(&project, 1, "  ", &[]).await,
            Err(FinalizeError::EmptyChapter(1))
        ));
        assert!(matches!(
            coordinator.finalize_chapter(&project, 0, "text", &[]).await,
            Err(FinalizeError::InvalidChapter)
        ));
    }

    #[tokio::test]
    async fn test_finalize_context() {
        let (coordinator, _) = coordinator(scripted());
        let project = ProjectId::new("novel");
        for chapter in 1..=4 {
            coordinator
                .finalize_chapter(&project, chapter, "text", &[])
                .await
                .unwrap();
        }

        let context = coordinator.finalize_context(&project, 5).await.unwrap();
        assert!(context.global_summary.is_some());
        assert!(context.plot_arcs.is_some());
        let chapters: Vec<u32> = context.recent_snapshots.iter().map(|d| d.chapter_number).collect();
        assert_eq!(chapters, vec![4, 3, 2]);

        let empty = coordinator
            .finalize_context(&ProjectId::new("other"), 1)
            .await
            .unwrap();
        assert_eq!(empty.global_summary, None);
        assert!(empty.recent_snapshots.is_empty());
    }

    #[test]
    fn test_conflict_detection() {
        let err = FinalizeError::from(MemoryError::VersionConflict { expected: 1, actual: 2 });
        assert!(err.is_conflict());
        assert!(!FinalizeError::EmptyChapter(3).is_conflict());
    }
}
