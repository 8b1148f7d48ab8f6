//! Project-level memory: the rolling summary, plot arcs, and snapshots.

use super::character::CharacterState;
use crate::recovery::lenient;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Soft cap on the rewritten global summary, in characters.
pub const GLOBAL_SUMMARY_SOFT_CAP: usize = 2000;

/// Identifier of a story project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(String);

impl ProjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProjectId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Status of a planted hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum HookStatus {
    #[default]
    Active,
    Reinforced,
    Resolved,
}

impl From<String> for HookStatus {
    fn from(raw: String) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "reinforced" | "strengthened" => HookStatus::Reinforced,
            "resolved" | "paid_off" | "closed" => HookStatus::Resolved,
            _ => HookStatus::Active,
        }
    }
}

/// Status of a main conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum ConflictStatus {
    #[default]
    Active,
    Escalating,
    Resolved,
}

impl From<String> for ConflictStatus {
    fn from(raw: String) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "escalating" | "escalated" => ConflictStatus::Escalating,
            "resolved" | "closed" => ConflictStatus::Resolved,
            _ => ConflictStatus::Active,
        }
    }
}

/// A narrative promise that has not been paid off yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnresolvedHook {
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub id: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default, deserialize_with = "lenient::opt_u32")]
    pub planted_chapter: Option<u32>,
    #[serde(
        default,
        alias = "expected_payoff",
        deserialize_with = "lenient::opt_u32"
    )]
    pub expected_payoff_chapter: Option<u32>,
    #[serde(default)]
    pub status: HookStatus,
}

impl UnresolvedHook {
    pub fn new(id: impl Into<String>, description: impl Into<String>, planted_chapter: u32) -> Self {
        Self {
            id: Some(id.into()),
            description: description.into(),
            planted_chapter: Some(planted_chapter),
            expected_payoff_chapter: None,
            status: HookStatus::Active,
        }
    }

    pub fn with_expected_payoff(mut self, chapter: u32) -> Self {
        self.expected_payoff_chapter = Some(chapter);
        self
    }

    pub fn is_open(&self) -> bool {
        self.status != HookStatus::Resolved
    }

    /// The expected payoff chapter has passed without a resolution.
    pub fn is_overdue(&self, chapter: u32) -> bool {
        self.is_open() && self.expected_payoff_chapter.is_some_and(|c| c < chapter)
    }
}

/// A main conflict driving the story.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MainConflict {
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub id: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: ConflictStatus,
}

/// Where a character is on their arc.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterArc {
    #[serde(default)]
    pub character: String,
    #[serde(default)]
    pub current_stage: String,
    #[serde(default)]
    pub next_milestone: String,
}

/// Structured plot tracking for a project.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlotArcs {
    #[serde(default)]
    pub unresolved_hooks: Vec<UnresolvedHook>,
    #[serde(default)]
    pub main_conflicts: Vec<MainConflict>,
    #[serde(default)]
    pub character_arcs: Vec<CharacterArc>,
}

impl PlotArcs {
    pub fn is_empty(&self) -> bool {
        self.unresolved_hooks.is_empty()
            && self.main_conflicts.is_empty()
            && self.character_arcs.is_empty()
    }

    /// Hooks that still need a payoff.
    pub fn open_hooks(&self) -> impl Iterator<Item = &UnresolvedHook> {
        self.unresolved_hooks.iter().filter(|h| h.is_open())
    }

    /// Conflicts not yet resolved.
    pub fn active_conflicts(&self) -> impl Iterator<Item = &MainConflict> {
        self.main_conflicts
            .iter()
            .filter(|c| c.status != ConflictStatus::Resolved)
    }
}

/// Long-range memory of one story.
///
/// Mutated only by finalization; `version` increments on every successful
/// update and guards concurrent writers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectMemoryState {
    pub project_id: ProjectId,
    pub global_summary: String,
    pub plot_arcs: PlotArcs,
    #[serde(default)]
    pub story_timeline_summary: Option<String>,
    pub last_updated_chapter: u32,
    pub version: u64,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ProjectMemoryState {
    /// Empty state for a project that has never been finalized.
    pub fn new(project_id: ProjectId) -> Self {
        Self {
            project_id,
            global_summary: String::new(),
            plot_arcs: PlotArcs::default(),
            story_timeline_summary: None,
            last_updated_chapter: 0,
            version: 0,
            updated_at: None,
        }
    }
}

/// Immutable record of memory at the moment a chapter was finalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterSnapshot {
    pub project_id: ProjectId,
    pub chapter_number: u32,
    pub global_summary: String,
    pub character_states: Vec<CharacterState>,
    pub plot_arcs: PlotArcs,
    pub chapter_summary: Option<String>,
    pub word_count: usize,
    /// Memory version the snapshot was written at.
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

/// Count words, treating each CJK ideograph as one word.
pub fn word_count(text: &str) -> usize {
    let mut count = 0;
    let mut in_word = false;
    for ch in text.chars() {
        if is_cjk(ch) {
            count += 1;
            in_word = false;
        } else if ch.is_alphanumeric() || ch == '\'' || ch == '-' {
            if !in_word {
                count += 1;
                in_word = true;
            }
        } else {
            in_word = false;
        }
    }
    count
}

fn is_cjk(ch: char) -> bool {
    matches!(ch as u32,
        0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0x3040..=0x30FF | 0xAC00..=0xD7AF | 0xF900..=0xFAFF)
}
