//! A read-only view of memory pinned to the end of a chapter.
//!
//! Writing chapter N may only consult what was known at the end of chapter
//! N-1. When chapter N (or a later one) has already been finalized, the live
//! summary and plot arcs contain look-ahead, so the view falls back to the
//! latest snapshot taken before N.

use super::causal::CausalChain;
use super::character::CharacterState;
use super::state::{PlotArcs, ProjectId};
use super::store::{MemoryError, NarrativeMemoryStore};
use super::timeline::TimelineEvent;
use std::fmt::Write;

/// Recent chapters whose events are included.
pub const RECENT_EVENT_CHAPTERS: u32 = 5;
/// Most recent character rows included.
pub const RECENT_STATE_LIMIT: usize = 10;
/// Snapshot summaries included.
pub const RECENT_SNAPSHOT_LIMIT: usize = 3;

const RENDERED_EVENT_LIMIT: usize = 10;
const RENDERED_CHAIN_LIMIT: usize = 5;

/// Short summary of an earlier finalized chapter.
#[derive(Debug, Clone, PartialEq)]
pub struct ChapterDigest {
    pub chapter_number: u32,
    pub summary: String,
}

/// Everything a checker or writer may know before chapter `chapter`.
#[derive(Debug, Clone)]
pub struct MemoryView {
    pub project_id: ProjectId,
    /// The chapter being written or checked.
    pub chapter: u32,
    /// Chapter of the snapshot supplying summary and arcs, if the live state
    /// was ahead of this view.
    pub pinned_snapshot: Option<u32>,
    pub global_summary: String,
    pub plot_arcs: PlotArcs,
    pub story_timeline_summary: Option<String>,
    /// Latest state per character.
    pub character_states: Vec<CharacterState>,
    /// Most recent rows across all characters, newest first.
    pub recent_character_states: Vec<CharacterState>,
    pub recent_events: Vec<TimelineEvent>,
    pub pending_chains: Vec<CausalChain>,
    pub recent_chapters: Vec<ChapterDigest>,
}

impl MemoryView {
    /// Assemble the view of `project` before `chapter` from `store`.
    pub async fn assemble<S>(
        store: &S,
        project: &ProjectId,
        chapter: u32,
    ) -> Result<Self, MemoryError>
    where
        S: NarrativeMemoryStore + ?Sized,
    {
        let previous = chapter.saturating_sub(1);
        let state = store.load_state(project).await?;
        let earlier = if previous == 0 {
            Vec::new()
        } else {
            store.snapshots(project, 1..=previous).await?
        };

        let (pinned_snapshot, global_summary, plot_arcs, story_timeline_summary) =
            if state.last_updated_chapter < chapter {
                (
                    None,
                    state.global_summary,
                    state.plot_arcs,
                    state.story_timeline_summary,
                )
            } else {
                match earlier.last() {
                    Some(snapshot) => (
                        Some(snapshot.chapter_number),
                        snapshot.global_summary.clone(),
                        snapshot.plot_arcs.clone(),
                        None,
                    ),
                    None => (None, String::new(), PlotArcs::default(), None),
                }
            };

        let recent_chapters = earlier
            .iter()
            .rev()
            .filter_map(|s| {
                s.chapter_summary.as_ref().map(|summary| ChapterDigest {
                    chapter_number: s.chapter_number,
                    summary: summary.clone(),
                })
            })
            .fold(Vec::<ChapterDigest>::new(), |mut acc, digest| {
                // Re-finalized chapters have several snapshots; keep the newest.
                if !acc.iter().any(|d| d.chapter_number == digest.chapter_number) {
                    acc.push(digest);
                }
                acc
            })
            .into_iter()
            .take(RECENT_SNAPSHOT_LIMIT)
            .collect();

        let recent_events = if previous == 0 {
            Vec::new()
        } else {
            let from = chapter.saturating_sub(RECENT_EVENT_CHAPTERS).max(1);
            store.timeline(project, from..=previous).await?
        };

        Ok(Self {
            project_id: project.clone(),
            chapter,
            pinned_snapshot,
            global_summary,
            plot_arcs,
            story_timeline_summary,
            character_states: store.character_states_at(project, previous).await?,
            recent_character_states: store
                .recent_character_states(project, chapter, RECENT_STATE_LIMIT)
                .await?,
            recent_events,
            pending_chains: store.pending_causal_chains(project, previous).await?,
            recent_chapters,
        })
    }

    /// Nothing has been recorded before this chapter.
    pub fn is_empty(&self) -> bool {
        self.global_summary.is_empty()
            && self.plot_arcs.is_empty()
            && self.character_states.is_empty()
            && self.recent_events.is_empty()
            && self.pending_chains.is_empty()
    }

    /// Open hooks and pending chains, one per line.
    pub fn render_open_threads(&self) -> String {
        let mut out = String::new();
        for hook in self.plot_arcs.open_hooks() {
            let _ = write!(out, "- {}", hook.description);
            if let Some(planted) = hook.planted_chapter {
                let _ = write!(out, " (planted ch.{planted}");
                match hook.expected_payoff_chapter {
                    Some(payoff) => {
                        let _ = write!(out, ", payoff ~ch.{payoff})");
                    }
                    None => out.push(')'),
                }
            }
            out.push('\n');
        }
        for chain in self.pending_chains.iter().take(RENDERED_CHAIN_LIMIT) {
            let _ = writeln!(out, "- {}", chain.describe());
        }
        out
    }

    /// Render as prompt context.
    pub fn render(&self) -> String {
        let mut out = String::new();

        if !self.global_summary.is_empty() {
            let _ = writeln!(out, "## Story so far\n{}\n", self.global_summary);
        }

        if !self.recent_chapters.is_empty() {
            out.push_str("## Recent chapters\n");
            for digest in self.recent_chapters.iter().rev() {
                let _ = writeln!(out, "- Ch.{}: {}", digest.chapter_number, digest.summary);
            }
            out.push('\n');
        }

        if !self.character_states.is_empty() {
            out.push_str("## Character states\n");
            for state in &self.character_states {
                let _ = writeln!(out, "- {}", state.describe());
            }
            out.push('\n');
        }

        if !self.recent_events.is_empty() {
            out.push_str("## Recent events\n");
            let skip = self.recent_events.len().saturating_sub(RENDERED_EVENT_LIMIT);
            for event in self.recent_events.iter().skip(skip) {
                let marker = if event.is_turning_point { " [turning point]" } else { "" };
                let _ = writeln!(
                    out,
                    "- [Ch.{}] {}: {}{}",
                    event.chapter_number, event.title, event.description, marker
                );
            }
            out.push('\n');
        }

        let threads = self.render_open_threads();
        if !threads.is_empty() {
            let _ = writeln!(out, "## Open threads\n{threads}");
        }

        out.trim_end().to_string()
    }
}

#[cfg(test)]
mod tests {
    use crate::memory::{
        CausalChain, CauseType, CharacterState, EffectType, FinalizationBatch, InMemoryStore,
        NarrativeMemoryStore, PlotArcs, ProjectId, TimelineEvent, UnresolvedHook,
    };

    async fn finalize(store: &InMemoryStore, p: &ProjectId, chapter: u32, summary: &str) {
        let version = store.load_state(p).await.unwrap().version;
        let mut arcs = PlotArcs::default();
        arcs.unresolved_hooks
            .push(UnresolvedHook::new(format!("h{chapter}"), format!("hook from {chapter}"), chapter));
        let batch = FinalizationBatch {
            chapter_number: chapter,
            global_summary: summary.to_string(),
            plot_arcs: arcs,
            chapter_summary: Some(format!("chapter {chapter} summary")),
            ..Default::default()
        };
        store.commit_finalization(p, version, batch).await.unwrap();
    }

    #[tokio::test]
    async fn test_view_uses_live_state_when_not_ahead() {
        let store = InMemoryStore::new();
        let p = ProjectId::new("p");
        finalize(&store, &p, 1, "after one").await;
        finalize(&store, &p, 2, "after two").await;

        let view = store.view_before(&p, 3).await.unwrap();
        assert_eq!(view.pinned_snapshot, None);
        assert_eq!(view.global_summary, "after two");
        assert_eq!(view.recent_chapters.len(), 2);
        assert_eq!(view.recent_chapters[0].chapter_number, 2);
    }

    #[tokio::test]
    async fn test_view_pins_to_snapshot_when_live_state_is_ahead() {
        let store = InMemoryStore::new();
        let p = ProjectId::new("p");
        for chapter in 1..=4 {
            finalize(&store, &p, chapter, &format!("after {chapter}")).await;
        }

        let view = store.view_before(&p, 3).await.unwrap();
        assert_eq!(view.pinned_snapshot, Some(2));
        assert_eq!(view.global_summary, "after 2");
        assert_eq!(view.plot_arcs.unresolved_hooks[0].id.as_deref(), Some("h2"));
        assert!(view.recent_chapters.iter().all(|d| d.chapter_number < 3));
    }

    #[tokio::test]
    async fn test_view_excludes_later_facts() {
        let store = InMemoryStore::new();
        let p = ProjectId::new("p");
        store
            .upsert_character_state(&p, CharacterState::new("Lin", 2).with_location("Harbor"))
            .await
            .unwrap();
        store
            .upsert_character_state(&p, CharacterState::new("Lin", 3).with_location("Fort"))
            .await
            .unwrap();
        store
            .record_timeline_event(&p, TimelineEvent::new(3, "Siege"))
            .await
            .unwrap();
        let mut chain = CausalChain::new(CauseType::Event, "Spy seen", 1, EffectType::Confrontation, "Spy caught");
        chain.resolve(3, "Caught at the gate").unwrap();
        store.record_causal_chain(&p, chain).await.unwrap();

        let view = store.view_before(&p, 3).await.unwrap();
        assert_eq!(view.character_states[0].location.as_deref(), Some("Harbor"));
        assert!(view.recent_character_states.iter().all(|s| s.chapter_number < 3));
        assert!(view.recent_events.is_empty());
        // Resolved in chapter 3, so still pending as of chapter 2.
        assert_eq!(view.pending_chains.len(), 1);
    }

    #[tokio::test]
    async fn test_first_chapter_view_is_empty() {
        let store = InMemoryStore::new();
        let view = store.view_before(&ProjectId::new("p"), 1).await.unwrap();
        assert!(view.is_empty());
        assert_eq!(view.render(), "");
    }

    #[tokio::test]
    async fn test_render_sections() {
        let store = InMemoryStore::new();
        let p = ProjectId::new("p");
        finalize(&store, &p, 1, "Lin leaves home.").await;
        store
            .upsert_character_state(&p, CharacterState::new("Lin", 1).with_location("Road"))
            .await
            .unwrap();
        store
            .record_timeline_event(&p, TimelineEvent::new(1, "Departure").turning_point())
            .await
            .unwrap();

        let text = store.view_before(&p, 2).await.unwrap().render();
        assert!(text.contains("## Story so far\nLin leaves home."));
        assert!(text.contains("## Character states"));
        assert!(text.contains("Departure"));
        assert!(text.contains("[turning point]"));
        assert!(text.contains("hook from 1 (planted ch.1)"));
    }
}
