//! End-to-end handling of one chapter.
//!
//! ```text
//! drafts ──┬─▶ critique/revise loop ─▶ check_and_fix ─▶ reader ─┐
//!          ├─▶ critique/revise loop ─▶ check_and_fix ─▶ reader ─┼─▶ select ─▶ finalize
//!          └─▶ ...                                             ─┘
//! ```
//!
//! Drafts are evaluated concurrently and share nothing but the read-only
//! memory view. The winner is finalized unless its consistency check asked
//! for a person to look at it.

use crate::completion::TextCompletion;
use crate::config::PipelineConfig;
use crate::consistency::{ConsistencyChecker, FixReport, Resolution, StorySetting};
use crate::critique::{CritiqueContext, CritiqueEngine, LoopOutcome, DEFAULT_SCORE};
use crate::finalize::{FinalizationCoordinator, FinalizeError, FinalizeReport};
use crate::memory::{MemoryError, MemoryView, NarrativeMemoryStore, ProjectId};
use crate::selection::{select_best_version, Candidate, ReaderSimulation};
use futures::future::join_all;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Errors that stop a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no candidate drafts to choose from")]
    NoCandidates,

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Finalize(#[from] FinalizeError),
}

/// How one draft fared.
#[derive(Debug, Clone)]
pub struct CandidateReport {
    /// Position in the input draft list.
    pub index: usize,
    /// `None` when the loop ran past its budget and the draft was kept as is.
    pub loop_outcome: Option<LoopOutcome>,
    pub fix_report: FixReport,
    pub candidate: Candidate,
}

impl CandidateReport {
    pub fn timed_out(&self) -> bool {
        self.loop_outcome.is_none()
    }
}

/// Result of [`ChapterPipeline::run`].
#[derive(Debug, Clone)]
pub struct ChapterOutcome {
    pub project_id: ProjectId,
    pub chapter_number: u32,
    /// Index of the winning draft.
    pub selected: usize,
    pub candidates: Vec<CandidateReport>,
    /// `None` when the winner was held for manual review.
    pub finalized: Option<FinalizeReport>,
}

impl ChapterOutcome {
    pub fn winner(&self) -> Option<&CandidateReport> {
        self.candidates.iter().find(|c| c.index == self.selected)
    }

    /// Final text of the winning draft.
    pub fn text(&self) -> &str {
        self.winner().map(|c| c.candidate.text.as_str()).unwrap_or("")
    }

    pub fn resolution(&self) -> Resolution {
        self.winner()
            .map(|c| c.fix_report.resolution())
            .unwrap_or(Resolution::Accepted)
    }

    pub fn needs_manual_review(&self) -> bool {
        self.resolution() == Resolution::ManualReviewRequired
    }
}

/// Critiques, checks, selects and finalizes chapter drafts.
pub struct ChapterPipeline<C> {
    critic: CritiqueEngine<C>,
    checker: ConsistencyChecker<C>,
    finalizer: FinalizationCoordinator<C>,
    reader: Arc<dyn ReaderSimulation>,
    store: Arc<dyn NarrativeMemoryStore>,
    config: PipelineConfig,
}

impl<C: TextCompletion + Clone> ChapterPipeline<C> {
    pub fn new(
        completion: C,
        store: Arc<dyn NarrativeMemoryStore>,
        reader: Arc<dyn ReaderSimulation>,
    ) -> Self {
        Self::with_config(completion, store, reader, PipelineConfig::default())
    }

    pub fn with_config(
        completion: C,
        store: Arc<dyn NarrativeMemoryStore>,
        reader: Arc<dyn ReaderSimulation>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            critic: CritiqueEngine::new(completion.clone()).with_config(config.critique.clone()),
            checker: ConsistencyChecker::new(completion.clone()).with_config(config.consistency.clone()),
            finalizer: FinalizationCoordinator::new(completion, store.clone())
                .with_config(config.finalize.clone()),
            reader,
            store,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn finalizer(&self) -> &FinalizationCoordinator<C> {
        &self.finalizer
    }

    /// Evaluate every draft, pick one, and finalize it.
    pub async fn run(
        &self,
        project: &ProjectId,
        chapter: u32,
        drafts: Vec<String>,
        setting: &StorySetting,
        context: &CritiqueContext,
    ) -> Result<ChapterOutcome, PipelineError> {
        if drafts.is_empty() {
            return Err(PipelineError::NoCandidates);
        }

        let view = self.store.view_before(project, chapter).await?;
        info!(project = %project, chapter, drafts = drafts.len(), "evaluating drafts");

        let candidates = join_all(
            drafts
                .iter()
                .enumerate()
                .map(|(index, draft)| self.evaluate(index, draft, &view, setting, context)),
        )
        .await;

        let pool: Vec<Candidate> = candidates.iter().map(|c| c.candidate.clone()).collect();
        let selected = select_best_version(&pool);

        let mut outcome = ChapterOutcome {
            project_id: project.clone(),
            chapter_number: chapter,
            selected,
            candidates,
            finalized: None,
        };

        if outcome.needs_manual_review() {
            warn!(project = %project, chapter, selected, "winning draft needs manual review, not finalizing");
            return Ok(outcome);
        }

        let report = self
            .finalizer
            .finalize_chapter(project, chapter, outcome.text(), &[])
            .await?;
        outcome.finalized = Some(report);
        Ok(outcome)
    }

    async fn evaluate(
        &self,
        index: usize,
        draft: &str,
        view: &MemoryView,
        setting: &StorySetting,
        context: &CritiqueContext,
    ) -> CandidateReport {
        let revise = self.critic.critique_and_revise_loop(
            draft,
            self.config.max_iterations,
            self.config.target_score,
            &self.config.dimensions,
            context,
        );
        let loop_outcome = match tokio::time::timeout(self.config.loop_budget(), revise).await {
            Ok(outcome) => Some(outcome),
            Err(_) => {
                warn!(index, budget = ?self.config.loop_budget(), "critique loop over budget, keeping draft");
                None
            }
        };

        let (text, critique_score) = match &loop_outcome {
            Some(outcome) => (outcome.preferred_text(), outcome.preferred_score()),
            None => (draft, DEFAULT_SCORE),
        };

        let fix_report = self
            .checker
            .check_and_fix(text, view, setting, self.config.auto_fix_threshold)
            .await;
        let final_text = fix_report.content(text).to_string();

        let previous = view
            .recent_chapters
            .first()
            .map(|d| d.summary.as_str())
            .or(Some(view.global_summary.as_str()).filter(|s| !s.is_empty()));
        let reader = self.reader.simulate(&final_text, previous).await;

        info!(
            index,
            critique_score,
            reader_score = reader.overall_score,
            hook = reader.hook_strength,
            resolution = ?fix_report.resolution(),
            "draft evaluated"
        );

        CandidateReport {
            index,
            loop_outcome,
            fix_report,
            candidate: Candidate::new(final_text, critique_score, reader),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use crate::selection::ReaderFeedback;
    use crate::testing::{ScriptedCompletion, ScriptedReader};

    const CRITIQUE: &str = "Review the chapter below strictly";
    const CHECK: &str = "Check the latest chapter";

    fn score(score: u32) -> String {
        format!(r#"{{"overall_score": {score}, "issues": []}}"#)
    }

    fn finalize_routes(completion: ScriptedCompletion) -> ScriptedCompletion {
        completion
            .route("Update the story summary", "The story so far.")
            .route("Summarize chapter", "Short summary.")
    }

    #[tokio::test]
    async fn test_empty_drafts_rejected() {
        let pipeline = ChapterPipeline::new(
            ScriptedCompletion::new(),
            Arc::new(InMemoryStore::new()),
            Arc::new(ScriptedReader::new()),
        );
        let err = pipeline
            .run(&ProjectId::new("p"), 1, Vec::new(), &StorySetting::default(), &CritiqueContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NoCandidates));
    }

    #[tokio::test]
    async fn test_reader_favourite_wins_and_is_finalized() {
        let completion = finalize_routes(ScriptedCompletion::new())
            .route_all([CRITIQUE, "ALPHA"], score(80))
            .route_all([CRITIQUE, "BETA"], score(60))
            .route(CHECK, r#"{"is_consistent": true, "violations": []}"#);
        let reader = ScriptedReader::new()
            .when("ALPHA", ReaderFeedback::new(50.0, 5.0))
            .when("BETA", ReaderFeedback::new(90.0, 9.0));
        let store = Arc::new(InMemoryStore::new());
        let pipeline = ChapterPipeline::new(completion.clone(), store.clone(), Arc::new(reader));
        let project = ProjectId::new("p");

        let outcome = pipeline
            .run(
                &project,
                1,
                vec!["Draft ALPHA.".to_string(), "Draft BETA.".to_string()],
                &StorySetting::default(),
                &CritiqueContext::default(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.selected, 1);
        assert_eq!(outcome.text(), "Draft BETA.");
        assert_eq!(outcome.resolution(), Resolution::Accepted);
        let finalized = outcome.finalized.as_ref().unwrap();
        assert_eq!(finalized.new_version, 1);
        assert_eq!(completion.calls_matching("Revise the chapter"), 0);

        let state = store.load_state(&project).await.unwrap();
        assert_eq!(state.global_summary, "The story so far.");
        assert_eq!(state.last_updated_chapter, 1);
    }

    #[tokio::test]
    async fn test_manual_review_blocks_finalization() {
        let report = r#"{"is_consistent": false, "violations": [
            {"severity": "major", "category": "character", "description": "Lin is in two places"}
        ]}"#;
        let completion = finalize_routes(ScriptedCompletion::new())
            .route(CRITIQUE, score(85))
            .route(CHECK, report);
        let store = Arc::new(InMemoryStore::new());
        let pipeline = ChapterPipeline::new(completion, store.clone(), Arc::new(ScriptedReader::new()));
        let project = ProjectId::new("p");

        let outcome = pipeline
            .run(&project, 1, vec!["Only draft.".to_string()], &StorySetting::default(), &CritiqueContext::default())
            .await
            .unwrap();

        assert!(outcome.needs_manual_review());
        assert!(outcome.finalized.is_none());
        assert_eq!(store.load_state(&project).await.unwrap().version, 0);
    }

    #[tokio::test]
    async fn test_auto_fixed_text_is_carried_forward() {
        let report = r#"{"is_consistent": false, "violations": [
            {"severity": "critical", "category": "setting", "description": "Magic used in a null zone"}
        ]}"#;
        let completion = finalize_routes(ScriptedCompletion::new())
            .route(CRITIQUE, score(85))
            .route(CHECK, report)
            .route("contradicts established facts", "Repaired draft.");
        let store = Arc::new(InMemoryStore::new());
        let pipeline = ChapterPipeline::new(completion, store, Arc::new(ScriptedReader::new()));

        let outcome = pipeline
            .run(
                &ProjectId::new("p"),
                1,
                vec!["Broken draft.".to_string()],
                &StorySetting::default(),
                &CritiqueContext::default(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.resolution(), Resolution::AutoFixed);
        assert_eq!(outcome.text(), "Repaired draft.");
        assert!(outcome.finalized.is_some());
    }
}
