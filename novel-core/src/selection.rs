//! Picking one chapter out of several candidates.
//!
//! Each candidate carries its critique score and the verdict of a reader
//! simulation. The reader's view counts for more than the editor's, and a
//! strong closing hook earns a bonus.

use crate::completion::{complete_within, CompletionRequest, TextCompletion};
use crate::recovery::{self, lenient, truncate_chars};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Reader score assumed when the simulation gives none.
pub const DEFAULT_READER_SCORE: f64 = 50.0;

/// Hook strength assumed when the simulation gives none. Earns no bonus.
pub const DEFAULT_HOOK_STRENGTH: f64 = 5.0;

const CRITIQUE_WEIGHT: f64 = 0.4;
const READER_WEIGHT: f64 = 0.6;
const HOOK_BONUS_PER_POINT: f64 = 2.0;

/// How a simulated reader received a chapter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReaderFeedback {
    /// 0 to 100.
    pub overall_score: f64,
    /// 1 to 10, strength of the closing cliffhanger.
    pub hook_strength: f64,
    pub comments: Vec<String>,
}

impl Default for ReaderFeedback {
    fn default() -> Self {
        Self {
            overall_score: DEFAULT_READER_SCORE,
            hook_strength: DEFAULT_HOOK_STRENGTH,
            comments: Vec::new(),
        }
    }
}

impl ReaderFeedback {
    pub fn new(overall_score: f64, hook_strength: f64) -> Self {
        Self {
            overall_score,
            hook_strength,
            comments: Vec::new(),
        }
    }

    /// Read the collaborator's report shape:
    /// `{"overall_score": n, "hook_strength": {"hook_strength": n}}`.
    ///
    /// A flat numeric `hook_strength` is accepted too. Missing values take
    /// their defaults.
    pub fn from_value(value: &serde_json::Value) -> Self {
        let overall_score = value
            .get("overall_score")
            .and_then(recovery::lenient_number)
            .unwrap_or(DEFAULT_READER_SCORE);
        let hook_strength = match value.get("hook_strength") {
            Some(nested) if nested.is_object() => nested.get("hook_strength"),
            other => other,
        }
        .and_then(recovery::lenient_number)
        .unwrap_or(DEFAULT_HOOK_STRENGTH);

        Self {
            overall_score,
            hook_strength,
            comments: Vec::new(),
        }
    }

    /// `(hook_strength - 5) * 2`; negative for weak hooks.
    pub fn hook_bonus(&self) -> f64 {
        (self.hook_strength - DEFAULT_HOOK_STRENGTH) * HOOK_BONUS_PER_POINT
    }
}

/// A chapter draft competing for selection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub text: String,
    /// Composite critique score of `text`.
    pub critique_score: f64,
    pub reader: ReaderFeedback,
}

impl Candidate {
    pub fn new(text: impl Into<String>, critique_score: f64, reader: ReaderFeedback) -> Self {
        Self {
            text: text.into(),
            critique_score,
            reader,
        }
    }

    /// `critique * 0.4 + reader * 0.6 + hook bonus`.
    pub fn total(&self) -> f64 {
        self.critique_score * CRITIQUE_WEIGHT
            + self.reader.overall_score * READER_WEIGHT
            + self.reader.hook_bonus()
    }
}

/// Index of the candidate with the highest total.
///
/// Ties go to the earliest candidate. An empty slice yields 0; callers are
/// expected not to ask.
pub fn select_best_version(candidates: &[Candidate]) -> usize {
    let mut best = 0;
    let mut best_total = f64::NEG_INFINITY;
    for (i, candidate) in candidates.iter().enumerate() {
        let total = candidate.total();
        if total > best_total {
            best = i;
            best_total = total;
        }
    }
    debug!(candidates = candidates.len(), best, best_total, "version selected");
    best
}

// =============================================================================
// Reader simulation
// =============================================================================

/// Something that can read a chapter like an audience member would.
#[async_trait]
pub trait ReaderSimulation: Send + Sync {
    /// Never fails; an unreadable verdict becomes [`ReaderFeedback::default`].
    async fn simulate(&self, chapter_text: &str, previous_summary: Option<&str>) -> ReaderFeedback;
}

#[async_trait]
impl<T: ReaderSimulation + ?Sized> ReaderSimulation for std::sync::Arc<T> {
    async fn simulate(&self, chapter_text: &str, previous_summary: Option<&str>) -> ReaderFeedback {
        (**self).simulate(chapter_text, previous_summary).await
    }
}

const READER_EXCERPT_CHARS: usize = 6000;
const ENDING_CHARS: usize = 500;

#[derive(Debug, Deserialize)]
struct ReaderPayload {
    #[serde(default, alias = "overall_score", deserialize_with = "lenient::opt_f64")]
    satisfaction: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    comment: Option<String>,
    #[serde(default, deserialize_with = "lenient::string_list")]
    complaints: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct HookPayload {
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    hook_strength: Option<f64>,
}

/// A [`ReaderSimulation`] that asks the completion service to role-play a
/// web-fiction reader, then rates the chapter's ending separately.
pub struct CompletionReader<C> {
    completion: C,
    timeout: Duration,
}

impl<C: TextCompletion> CompletionReader<C> {
    pub fn new(completion: C) -> Self {
        Self {
            completion,
            timeout: Duration::from_secs(120),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn reader_verdict(&self, chapter_text: &str, previous_summary: Option<&str>) -> Option<ReaderPayload> {
        let prompt = format!(
            r#"Read this chapter as a regular serial-fiction reader would.

[Previously]
{}

[Chapter]
{}

Respond with ONLY a JSON object:
{{
  "satisfaction": 1-100,
  "complaints": ["what bothered you"],
  "comment": "one casual sentence"
}}"#,
            previous_summary.unwrap_or("This is the first chapter."),
            truncate_chars(chapter_text, READER_EXCERPT_CHARS),
        );
        let request = CompletionRequest::prompt(prompt)
            .with_system("You are a reader of web serials. Answer in a real reader's voice.")
            .with_temperature(0.7)
            .with_timeout(self.timeout);

        let completion = complete_within(&self.completion, request)
            .await
            .map_err(|e| warn!(error = %e, "reader simulation call failed"))
            .ok()?;
        recovery::recover_as(&completion.text)
            .map_err(|e| warn!(error = %e, "unreadable reader verdict"))
            .ok()
    }

    async fn hook_strength(&self, chapter_text: &str) -> Option<f64> {
        let total = chapter_text.chars().count();
        let ending: String = chapter_text.chars().skip(total.saturating_sub(ENDING_CHARS)).collect();
        let prompt = format!(
            r#"Rate how strongly this chapter ending makes a reader want the next chapter.

[Ending]
{ending}

Respond with ONLY a JSON object:
{{"hook_strength": 1-10, "hook_type": "suspense|conflict|anticipation|emotion|none"}}"#
        );
        let request = CompletionRequest::prompt(prompt)
            .with_system("You are a web-fiction editor who specializes in chapter hooks.")
            .with_temperature(0.3)
            .with_timeout(self.timeout.min(Duration::from_secs(60)));

        let completion = complete_within(&self.completion, request)
            .await
            .map_err(|e| warn!(error = %e, "hook rating call failed"))
            .ok()?;
        recovery::recover_as::<HookPayload>(&completion.text)
            .map_err(|e| warn!(error = %e, "unreadable hook rating"))
            .ok()?
            .hook_strength
    }
}

#[async_trait]
impl<C: TextCompletion> ReaderSimulation for CompletionReader<C> {
    async fn simulate(&self, chapter_text: &str, previous_summary: Option<&str>) -> ReaderFeedback {
        let verdict = self.reader_verdict(chapter_text, previous_summary).await;
        let hook = self.hook_strength(chapter_text).await;

        let mut feedback = ReaderFeedback::default();
        if let Some(verdict) = verdict {
            if let Some(score) = verdict.satisfaction {
                feedback.overall_score = score.clamp(0.0, 100.0);
            }
            feedback.comments = verdict.complaints;
            if let Some(comment) = verdict.comment {
                feedback.comments.push(comment);
            }
        }
        if let Some(hook) = hook {
            feedback.hook_strength = hook.clamp(1.0, 10.0);
        }
        feedback
    }
}
