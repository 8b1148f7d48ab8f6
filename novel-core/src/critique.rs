//! Multi-dimension critique and the critique/revise loop.
//!
//! Each dimension is scored independently by its own completion call. A
//! dimension whose report cannot be read falls back to a neutral score
//! without affecting the others. The loop is a bounded state machine with
//! four terminal states; see [`LoopStatus`].

use crate::completion::{complete_within, CompletionError, CompletionRequest, TextCompletion};
use crate::consistency::Severity;
use crate::recovery::{self, lenient, truncate_chars};
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Score used when a dimension cannot be evaluated.
pub const DEFAULT_SCORE: f64 = 70.0;

/// Composite score below which a draft always needs revision.
pub const REVISION_SCORE_FLOOR: f64 = 60.0;

/// Major issues at which a draft needs revision.
pub const MAJOR_ISSUE_LIMIT: usize = 3;

const DRAFT_PROMPT_CHARS: usize = 8000;
const QUICK_DRAFT_PROMPT_CHARS: usize = 6000;
const PROFILE_PROMPT_CHARS: usize = 2000;
const SUMMARY_PROMPT_CHARS: usize = 1000;

// =============================================================================
// Dimensions
// =============================================================================

/// An axis a draft is judged on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CritiqueDimension {
    Logic,
    Character,
    #[serde(alias = "writing")]
    Prose,
    Pacing,
    Emotion,
    Dialogue,
}

impl CritiqueDimension {
    pub const ALL: [CritiqueDimension; 6] = [
        CritiqueDimension::Logic,
        CritiqueDimension::Character,
        CritiqueDimension::Prose,
        CritiqueDimension::Pacing,
        CritiqueDimension::Emotion,
        CritiqueDimension::Dialogue,
    ];

    /// Dimensions the revise loop uses by default.
    pub const CORE: [CritiqueDimension; 3] = [
        CritiqueDimension::Logic,
        CritiqueDimension::Character,
        CritiqueDimension::Prose,
    ];

    /// Weight in the composite score.
    pub fn weight(&self) -> f64 {
        match self {
            CritiqueDimension::Logic => 1.5,
            CritiqueDimension::Character => 1.3,
            CritiqueDimension::Prose => 1.0,
            CritiqueDimension::Pacing => 1.0,
            CritiqueDimension::Emotion => 0.8,
            CritiqueDimension::Dialogue => 0.9,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CritiqueDimension::Logic => "logic",
            CritiqueDimension::Character => "character",
            CritiqueDimension::Prose => "prose",
            CritiqueDimension::Pacing => "pacing",
            CritiqueDimension::Emotion => "emotion",
            CritiqueDimension::Dialogue => "dialogue",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CritiqueDimension::Logic => "logical consistency",
            CritiqueDimension::Character => "character consistency",
            CritiqueDimension::Prose => "prose quality",
            CritiqueDimension::Pacing => "pacing",
            CritiqueDimension::Emotion => "emotional arc",
            CritiqueDimension::Dialogue => "dialogue",
        }
    }

    /// What the reviewer should look for.
    pub fn focus(&self) -> &'static [&'static str] {
        match self {
            CritiqueDimension::Logic => &[
                "Are causes and effects plausible?",
                "Is the timeline self-consistent?",
                "Are character motives sufficient for their actions?",
                "Are world rules applied consistently?",
                "Does anything contradict earlier text?",
            ],
            CritiqueDimension::Character => &[
                "Is each personality consistent?",
                "Does each character speak in their own established way?",
                "Do decisions match the character's values?",
                "Is character growth earned?",
                "Does anyone act out of character?",
            ],
            CritiqueDimension::Prose => &[
                "Stock filler phrases typical of generated text",
                "Repetition and padding",
                "Vague or empty wording",
                "Concrete, vivid description",
                "Adjective overuse",
            ],
            CritiqueDimension::Pacing => &[
                "Does the pace match the intended emotional curve?",
                "Are scene transitions smooth?",
                "Does anything drag or feel rushed?",
                "Are peaks and lulls well distributed?",
                "Does the reader get room to breathe?",
            ],
            CritiqueDimension::Emotion => &[
                "Are emotions believable?",
                "Do emotional shifts feel natural?",
                "Is it melodramatic or too cold?",
                "Will readers empathize?",
                "Are emotional climaxes set up?",
            ],
            CritiqueDimension::Dialogue => &[
                "Does dialogue flow naturally?",
                "Can speakers be told apart by voice?",
                "Is there lecturing or info-dumping?",
                "Does dialogue advance plot or reveal character?",
                "Is any exchange pointless?",
            ],
        }
    }

    fn rank(&self) -> usize {
        Self::ALL.iter().position(|d| d == self).unwrap_or(Self::ALL.len())
    }
}

// =============================================================================
// Reports
// =============================================================================

/// One problem found by a reviewer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CritiqueIssue {
    pub dimension: CritiqueDimension,
    pub severity: Severity,
    pub location: Option<String>,
    pub problem: String,
    pub suggestion: Option<String>,
    pub example: Option<String>,
}

impl CritiqueIssue {
    pub fn new(dimension: CritiqueDimension, severity: Severity, problem: impl Into<String>) -> Self {
        Self {
            dimension,
            severity,
            location: None,
            problem: problem.into(),
            suggestion: None,
            example: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

/// The verdict for one dimension.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DimensionReport {
    pub dimension: CritiqueDimension,
    /// 1 to 100.
    pub score: f64,
    pub issues: Vec<CritiqueIssue>,
    pub strengths: Vec<String>,
    pub summary: String,
    /// False when the score is the fallback default.
    pub evaluated: bool,
}

impl DimensionReport {
    /// Neutral report for a dimension that could not be evaluated.
    pub fn fallback(dimension: CritiqueDimension) -> Self {
        Self {
            dimension,
            score: DEFAULT_SCORE,
            issues: Vec::new(),
            strengths: Vec::new(),
            summary: "review could not be completed".to_string(),
            evaluated: false,
        }
    }
}

/// All dimensions combined.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateReport {
    pub reports: Vec<DimensionReport>,
    /// Weighted mean of dimension scores, one decimal.
    pub weighted_score: f64,
    pub critical_count: usize,
    pub major_count: usize,
    pub minor_count: usize,
    pub needs_revision: bool,
    /// Critical then major issues, at most five.
    pub priority_fixes: Vec<CritiqueIssue>,
}

impl AggregateReport {
    pub const MAX_PRIORITY_FIXES: usize = 5;

    /// Combine dimension reports. The result does not depend on their order.
    pub fn from_reports(mut reports: Vec<DimensionReport>) -> Self {
        reports.sort_by_key(|r| r.dimension.rank());

        let total_weight: f64 = reports.iter().map(|r| r.dimension.weight()).sum();
        let weighted_sum: f64 = reports.iter().map(|r| r.score * r.dimension.weight()).sum();
        let weighted_score = if total_weight > 0.0 {
            round1(weighted_sum / total_weight)
        } else {
            0.0
        };

        let issues = || reports.iter().flat_map(|r| r.issues.iter());
        let count = |severity| issues().filter(|i| i.severity == severity).count();
        let critical_count = count(Severity::Critical);
        let major_count = count(Severity::Major);
        let minor_count = count(Severity::Minor);

        let mut priority_fixes: Vec<CritiqueIssue> = issues()
            .filter(|i| i.severity != Severity::Minor)
            .cloned()
            .collect();
        priority_fixes.sort_by_key(|i| i.severity.rank());
        priority_fixes.truncate(Self::MAX_PRIORITY_FIXES);

        let needs_revision = critical_count > 0
            || major_count >= MAJOR_ISSUE_LIMIT
            || weighted_score < REVISION_SCORE_FLOOR;

        Self {
            reports,
            weighted_score,
            critical_count,
            major_count,
            minor_count,
            needs_revision,
            priority_fixes,
        }
    }

    pub fn report(&self, dimension: CritiqueDimension) -> Option<&DimensionReport> {
        self.reports.iter().find(|r| r.dimension == dimension)
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Material the reviewers may consult.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CritiqueContext {
    pub character_profiles: Option<String>,
    pub previous_summary: Option<String>,
    pub emotion_target: Option<String>,
}

impl CritiqueContext {
    pub fn with_character_profiles(mut self, profiles: impl Into<String>) -> Self {
        self.character_profiles = Some(profiles.into());
        self
    }

    pub fn with_previous_summary(mut self, summary: impl Into<String>) -> Self {
        self.previous_summary = Some(summary.into());
        self
    }

    pub fn with_emotion_target(mut self, target: impl Into<String>) -> Self {
        self.emotion_target = Some(target.into());
        self
    }

    fn render(&self) -> String {
        let mut out = String::new();
        if let Some(profiles) = &self.character_profiles {
            let _ = write!(out, "\n[Character profiles]\n{}\n", truncate_chars(profiles, PROFILE_PROMPT_CHARS));
        }
        if let Some(summary) = &self.previous_summary {
            let _ = write!(out, "\n[Previously]\n{}\n", truncate_chars(summary, SUMMARY_PROMPT_CHARS));
        }
        if let Some(target) = &self.emotion_target {
            let _ = write!(out, "\n[Emotional target]\n{target}\n");
        }
        out
    }
}

/// Configuration for the critique engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CritiqueConfig {
    pub critique_temperature: f32,
    pub critique_max_tokens: usize,
    pub revise_temperature: f32,
    pub revise_max_tokens: usize,
    pub quick_temperature: f32,

    pub critique_timeout_secs: u64,
    pub revise_timeout_secs: u64,
    pub quick_timeout_secs: u64,

    /// Issues passed to a single revision.
    pub max_revision_issues: usize,
}

impl Default for CritiqueConfig {
    fn default() -> Self {
        Self {
            critique_temperature: 0.3,
            critique_max_tokens: 2000,
            revise_temperature: 0.7,
            revise_max_tokens: 8000,
            quick_temperature: 0.2,
            critique_timeout_secs: 120,
            revise_timeout_secs: 180,
            quick_timeout_secs: 60,
            max_revision_issues: 10,
        }
    }
}

// =============================================================================
// Loop types
// =============================================================================

/// Why the critique/revise loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    /// Score at or above target with nothing requiring revision.
    TargetReached,
    /// Nothing requires revision, though the score is below target.
    Acceptable,
    /// The revision call failed or returned the text unchanged.
    RevisionFailed,
    /// The iteration budget ran out.
    MaxIterationsReached,
}

/// One round of the loop.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationRecord {
    /// 1-based.
    pub iteration: usize,
    pub score_before: f64,
    pub score_after: f64,
    pub revised: bool,
    pub critical_count: usize,
    pub major_count: usize,
    pub minor_count: usize,
    pub needs_revision: bool,
}

impl IterationRecord {
    fn new(iteration: usize, report: &AggregateReport) -> Self {
        Self {
            iteration,
            score_before: report.weighted_score,
            score_after: report.weighted_score,
            revised: false,
            critical_count: report.critical_count,
            major_count: report.major_count,
            minor_count: report.minor_count,
            needs_revision: report.needs_revision,
        }
    }
}

/// Result of [`CritiqueEngine::critique_and_revise_loop`].
#[derive(Debug, Clone, Serialize)]
pub struct LoopOutcome {
    pub original_text: String,
    pub final_text: String,
    pub iterations: Vec<IterationRecord>,
    pub first_score: f64,
    pub final_score: f64,
    /// `final_score - first_score`. May be negative.
    pub improvement: f64,
    pub status: LoopStatus,
    /// Critique of `final_text`.
    pub final_report: AggregateReport,
}

impl LoopOutcome {
    pub fn revisions(&self) -> usize {
        self.iterations.iter().filter(|i| i.revised).count()
    }

    /// The revised text, unless revising made the score worse.
    pub fn preferred_text(&self) -> &str {
        if self.improvement < 0.0 {
            &self.original_text
        } else {
            &self.final_text
        }
    }

    /// Score of [`preferred_text`](Self::preferred_text).
    pub fn preferred_score(&self) -> f64 {
        if self.improvement < 0.0 {
            self.first_score
        } else {
            self.final_score
        }
    }
}

/// A single-call quality screen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuickCritique {
    #[serde(default = "default_quick_score", deserialize_with = "score_or_default")]
    pub quick_score: f64,
    #[serde(default, deserialize_with = "lenient::string_list")]
    pub critical_issues: Vec<String>,
    #[serde(default, deserialize_with = "lenient::string_list")]
    pub ai_words_found: Vec<String>,
    #[serde(default = "yes", deserialize_with = "flag_or_yes")]
    pub has_hook: bool,
    #[serde(default = "yes", deserialize_with = "flag_or_yes")]
    pub pass: bool,
    #[serde(skip, default = "yes")]
    pub evaluated: bool,
}

impl Default for QuickCritique {
    fn default() -> Self {
        Self {
            quick_score: DEFAULT_SCORE,
            critical_issues: Vec::new(),
            ai_words_found: Vec::new(),
            has_hook: true,
            pass: true,
            evaluated: false,
        }
    }
}

fn default_quick_score() -> f64 {
    DEFAULT_SCORE
}

fn yes() -> bool {
    true
}

fn score_or_default<'de, D: serde::Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    Ok(lenient::opt_f64(d)?.map_or(DEFAULT_SCORE, |s| s.clamp(1.0, 100.0)))
}

fn flag_or_yes<'de, D: serde::Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(d)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => true,
        Some(serde_json::Value::Bool(b)) => b,
        Some(serde_json::Value::String(s)) => !matches!(s.trim().to_lowercase().as_str(), "false" | "no"),
        Some(other) => other.as_f64().map_or(true, |n| n != 0.0),
    })
}

/// Report shape requested from a dimension reviewer.
#[derive(Debug, Deserialize)]
struct DimensionPayload {
    #[serde(default, alias = "score", deserialize_with = "lenient::opt_f64")]
    overall_score: Option<f64>,
    #[serde(default)]
    issues: Vec<IssuePayload>,
    #[serde(default, deserialize_with = "lenient::string_list")]
    strengths: Vec<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    summary: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IssuePayload {
    #[serde(default, deserialize_with = "lenient::opt_string")]
    severity: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    location: Option<String>,
    #[serde(default, alias = "description", deserialize_with = "lenient::opt_string")]
    problem: Option<String>,
    #[serde(default, alias = "suggested_fix", deserialize_with = "lenient::opt_string")]
    suggestion: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    example: Option<String>,
}

impl IssuePayload {
    fn into_issue(self, dimension: CritiqueDimension) -> Option<CritiqueIssue> {
        let problem = self.problem.filter(|p| !p.trim().is_empty())?;
        Some(CritiqueIssue {
            dimension,
            severity: self.severity.map(Severity::from).unwrap_or(Severity::Minor),
            location: self.location,
            problem,
            suggestion: self.suggestion,
            example: self.example,
        })
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Scores drafts and drives the revise loop.
pub struct CritiqueEngine<C> {
    completion: C,
    config: CritiqueConfig,
}

impl<C: TextCompletion> CritiqueEngine<C> {
    pub fn new(completion: C) -> Self {
        Self {
            completion,
            config: CritiqueConfig::default(),
        }
    }

    pub fn with_config(mut self, config: CritiqueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &CritiqueConfig {
        &self.config
    }

    /// Score a draft on one dimension. Falls back to a neutral report.
    pub async fn critique(
        &self,
        draft: &str,
        dimension: CritiqueDimension,
        context: &CritiqueContext,
    ) -> DimensionReport {
        let request = CompletionRequest::prompt(self.critique_prompt(draft, dimension, context))
            .with_system(format!(
                "You are a strict fiction editor focused on {}. Point out problems objectively and specifically.",
                dimension.label()
            ))
            .with_temperature(self.config.critique_temperature)
            .with_max_tokens(self.config.critique_max_tokens)
            .with_timeout(Duration::from_secs(self.config.critique_timeout_secs));

        let text = match complete_within(&self.completion, request).await {
            Ok(completion) => completion.text,
            Err(e) => {
                warn!(dimension = dimension.name(), error = %e, "critique call failed, using default score");
                return DimensionReport::fallback(dimension);
            }
        };

        let payload: DimensionPayload = match recovery::recover_as(&text) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(dimension = dimension.name(), error = %e, "unreadable critique, using default score");
                return DimensionReport::fallback(dimension);
            }
        };

        DimensionReport {
            dimension,
            score: payload
                .overall_score
                .map_or(DEFAULT_SCORE, |s| s.clamp(1.0, 100.0)),
            issues: payload
                .issues
                .into_iter()
                .filter_map(|i| i.into_issue(dimension))
                .collect(),
            strengths: payload.strengths,
            summary: payload.summary.unwrap_or_default(),
            evaluated: true,
        }
    }

    /// Score a draft on several dimensions. An empty list means all of them.
    pub async fn full_critique(
        &self,
        draft: &str,
        dimensions: &[CritiqueDimension],
        context: &CritiqueContext,
    ) -> AggregateReport {
        let mut selected: Vec<CritiqueDimension> = if dimensions.is_empty() {
            CritiqueDimension::ALL.to_vec()
        } else {
            dimensions.to_vec()
        };
        selected.sort_by_key(|d| d.rank());
        selected.dedup();

        let mut reports = Vec::with_capacity(selected.len());
        for dimension in selected {
            reports.push(self.critique(draft, dimension, context).await);
        }

        let report = AggregateReport::from_reports(reports);
        debug!(
            score = report.weighted_score,
            critical = report.critical_count,
            major = report.major_count,
            needs_revision = report.needs_revision,
            "full critique complete"
        );
        report
    }

    /// Revise a draft to address `issues` and nothing else.
    pub async fn revise(
        &self,
        draft: &str,
        issues: &[CritiqueIssue],
        context: &CritiqueContext,
    ) -> Result<String, CompletionError> {
        if issues.is_empty() {
            return Ok(draft.to_string());
        }

        let request = CompletionRequest::prompt(self.revise_prompt(draft, issues, context))
            .with_system("You are an experienced serial fiction author who revises precisely from editor notes.")
            .with_temperature(self.config.revise_temperature)
            .with_max_tokens(self.config.revise_max_tokens)
            .with_timeout(Duration::from_secs(self.config.revise_timeout_secs));

        let completion = complete_within(&self.completion, request).await?;
        if completion.truncated {
            return Err(CompletionError::MalformedResponse(
                "revision stopped at the token limit".to_string(),
            ));
        }
        Ok(completion.text.trim().to_string())
    }

    /// Critique, revise, and re-critique until the draft is good enough or a
    /// terminal condition is hit.
    ///
    /// At most `max_iterations` revisions are attempted. An empty dimension
    /// list means [`CritiqueDimension::CORE`]. Callers bound wall-clock time.
    pub async fn critique_and_revise_loop(
        &self,
        draft: &str,
        max_iterations: usize,
        target_score: f64,
        dimensions: &[CritiqueDimension],
        context: &CritiqueContext,
    ) -> LoopOutcome {
        let dimensions: &[CritiqueDimension] = if dimensions.is_empty() {
            &CritiqueDimension::CORE
        } else {
            dimensions
        };

        let mut current = draft.to_string();
        let mut report = self.full_critique(&current, dimensions, context).await;
        let first_score = report.weighted_score;
        let mut iterations: Vec<IterationRecord> = Vec::new();
        let mut revisions = 0;

        let status = loop {
            // Once the revision budget is spent the score no longer decides the status.
            let budget_spent = revisions >= max_iterations;
            let terminal = if budget_spent && revisions > 0 {
                Some(LoopStatus::MaxIterationsReached)
            } else if report.weighted_score >= target_score && !report.needs_revision {
                Some(LoopStatus::TargetReached)
            } else if !report.needs_revision {
                Some(LoopStatus::Acceptable)
            } else if budget_spent {
                Some(LoopStatus::MaxIterationsReached)
            } else {
                None
            };
            if let Some(status) = terminal {
                if iterations.is_empty() {
                    iterations.push(IterationRecord::new(1, &report));
                }
                break status;
            }

            let round = iterations.len() + 1;
            let fixes: Vec<CritiqueIssue> = report
                .priority_fixes
                .iter()
                .take(self.config.max_revision_issues)
                .cloned()
                .collect();

            let revised = match self.revise(&current, &fixes, context).await {
                Ok(text) if !text.is_empty() && text != current => text,
                Ok(_) => {
                    debug!(round, "revision returned unchanged text");
                    iterations.push(IterationRecord::new(round, &report));
                    break LoopStatus::RevisionFailed;
                }
                Err(e) => {
                    warn!(round, error = %e, "revision call failed");
                    iterations.push(IterationRecord::new(round, &report));
                    break LoopStatus::RevisionFailed;
                }
            };

            revisions += 1;
            let next = self.full_critique(&revised, dimensions, context).await;
            let mut record = IterationRecord::new(round, &report);
            record.revised = true;
            record.score_after = next.weighted_score;
            iterations.push(record);

            current = revised;
            report = next;
        };

        let final_score = report.weighted_score;
        let outcome = LoopOutcome {
            original_text: draft.to_string(),
            final_text: current,
            iterations,
            first_score,
            final_score,
            improvement: round1(final_score - first_score),
            status,
            final_report: report,
        };
        info!(
            status = ?outcome.status,
            revisions = outcome.revisions(),
            first_score,
            final_score,
            "critique loop finished"
        );
        outcome
    }

    /// A fast screen for the most serious problems. Defaults to a pass.
    pub async fn quick_critique(&self, draft: &str) -> QuickCritique {
        let excerpt = truncate_chars(draft, QUICK_DRAFT_PROMPT_CHARS);
        let prompt = format!(
            r#"Quickly review this chapter for its most serious problems.

[Chapter]
{excerpt}

Check:
1. Obvious logic holes
2. Characters acting out of character
3. Stock phrases typical of generated text
4. Whether the ending has a hook

Respond with ONLY a JSON object:
{{
  "quick_score": 75,
  "critical_issues": ["..."],
  "ai_words_found": ["..."],
  "has_hook": true,
  "pass": true
}}"#
        );
        let request = CompletionRequest::prompt(prompt)
            .with_system("You are a fast first-pass editor. Be brief and point out key problems.")
            .with_temperature(self.config.quick_temperature)
            .with_timeout(Duration::from_secs(self.config.quick_timeout_secs));

        match complete_within(&self.completion, request).await {
            Ok(completion) => match recovery::recover_as::<QuickCritique>(&completion.text) {
                Ok(quick) => quick,
                Err(e) => {
                    warn!(error = %e, "unreadable quick critique, passing");
                    QuickCritique::default()
                }
            },
            Err(e) => {
                warn!(error = %e, "quick critique call failed, passing");
                QuickCritique::default()
            }
        }
    }

    fn critique_prompt(&self, draft: &str, dimension: CritiqueDimension, context: &CritiqueContext) -> String {
        let focus: Vec<String> = dimension.focus().iter().map(|f| format!("- {f}")).collect();
        let focus = focus.join("\n");
        let context_text = context.render();
        let excerpt = truncate_chars(draft, DRAFT_PROMPT_CHARS);
        let name = dimension.name();
        let label = dimension.label();

        format!(
            r#"Review the chapter below strictly for {label}.

[Focus]
{focus}
{context_text}
[Chapter]
{excerpt}

Find every problem. Respond with ONLY a JSON object:
{{
  "dimension": "{name}",
  "overall_score": 75,
  "issues": [
    {{
      "severity": "critical|major|minor",
      "location": "quote from the chapter",
      "problem": "what is wrong",
      "suggestion": "how to fix it",
      "example": "rewritten passage, if useful"
    }}
  ],
  "strengths": ["what works"],
  "summary": "one sentence"
}}

overall_score is 1-100. critical: must change. major: should change. minor: could improve."#
        )
    }

    fn revise_prompt(&self, draft: &str, issues: &[CritiqueIssue], context: &CritiqueContext) -> String {
        let mut notes = String::new();
        for (i, issue) in issues.iter().enumerate() {
            let _ = write!(
                notes,
                "\nIssue {}:\n- Dimension: {}\n- Severity: {}\n- Location: {}\n- Problem: {}\n- Suggestion: {}\n",
                i + 1,
                issue.dimension.name(),
                issue.severity,
                issue.location.as_deref().unwrap_or("unspecified"),
                issue.problem,
                issue.suggestion.as_deref().unwrap_or("none"),
            );
            if let Some(example) = &issue.example {
                let _ = writeln!(notes, "- Example: {example}");
            }
        }
        let profiles = context
            .character_profiles
            .as_deref()
            .map(|p| format!("\n[Character profiles]\n{}\n", truncate_chars(p, 1500)))
            .unwrap_or_default();

        format!(
            r#"Revise the chapter to address the editor notes below.

[Editor notes]
{notes}{profiles}
[Chapter]
{draft}

Rules:
1. Fix every listed issue and nothing else.
2. Do not change the plot direction or the order of events.
3. Keep the length roughly the same.
4. Blend changes in so no seams show.

Output the complete revised chapter and nothing else."#
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedCompletion;

    fn dimension_reply(score: u32, issues: &[(&str, &str)]) -> String {
        let items: Vec<String> = issues
            .iter()
            .map(|(severity, problem)| format!(r#"{{"severity": "{severity}", "problem": "{problem}"}}"#))
            .collect();
        format!(r#"{{"overall_score": {score}, "issues": [{}], "summary": "ok"}}"#, items.join(","))
    }

    fn report(dimension: CritiqueDimension, score: f64, severities: &[Severity]) -> DimensionReport {
        DimensionReport {
            dimension,
            score,
            issues: severities
                .iter()
                .map(|s| CritiqueIssue::new(dimension, *s, "issue"))
                .collect(),
            strengths: Vec::new(),
            summary: String::new(),
            evaluated: true,
        }
    }

    #[test]
    fn test_weights() {
        assert_eq!(CritiqueDimension::Logic.weight(), 1.5);
        assert_eq!(CritiqueDimension::Character.weight(), 1.3);
        assert_eq!(CritiqueDimension::Emotion.weight(), 0.8);
        let writing: CritiqueDimension = serde_json::from_str("\"writing\"").unwrap();
        assert_eq!(writing, CritiqueDimension::Prose);
    }

    #[test]
    fn test_weighted_score() {
        let aggregate = AggregateReport::from_reports(vec![
            report(CritiqueDimension::Logic, 80.0, &[]),
            report(CritiqueDimension::Prose, 60.0, &[]),
        ]);
        // (80 * 1.5 + 60 * 1.0) / 2.5 = 72
        assert_eq!(aggregate.weighted_score, 72.0);
        assert!(!aggregate.needs_revision);
    }

    #[test]
    fn test_single_critical_needs_revision() {
        let aggregate = AggregateReport::from_reports(vec![
            report(CritiqueDimension::Logic, 95.0, &[Severity::Critical]),
            report(CritiqueDimension::Character, 95.0, &[]),
        ]);
        assert_eq!(aggregate.critical_count, 1);
        assert!(aggregate.needs_revision);
    }

    #[test]
    fn test_three_majors_need_revision() {
        let two = AggregateReport::from_reports(vec![report(
            CritiqueDimension::Pacing,
            90.0,
            &[Severity::Major, Severity::Major],
        )]);
        assert!(!two.needs_revision);

        let three = AggregateReport::from_reports(vec![report(
            CritiqueDimension::Pacing,
            90.0,
            &[Severity::Major, Severity::Major, Severity::Major],
        )]);
        assert!(three.needs_revision);
    }

    #[test]
    fn test_low_score_needs_revision() {
        let aggregate = AggregateReport::from_reports(vec![report(CritiqueDimension::Logic, 59.9, &[])]);
        assert!(aggregate.needs_revision);
    }

    #[test]
    fn test_priority_fixes_ordering_and_cap() {
        let aggregate = AggregateReport::from_reports(vec![
            report(
                CritiqueDimension::Prose,
                70.0,
                &[Severity::Major, Severity::Minor, Severity::Major, Severity::Major],
            ),
            report(
                CritiqueDimension::Logic,
                70.0,
                &[Severity::Major, Severity::Critical, Severity::Critical],
            ),
        ]);
        assert_eq!(aggregate.priority_fixes.len(), 5);
        assert_eq!(aggregate.priority_fixes[0].severity, Severity::Critical);
        assert_eq!(aggregate.priority_fixes[1].severity, Severity::Critical);
        assert!(aggregate.priority_fixes.iter().all(|i| i.severity != Severity::Minor));
    }

    #[test]
    fn test_empty_reports() {
        let aggregate = AggregateReport::from_reports(Vec::new());
        assert_eq!(aggregate.weighted_score, 0.0);
        assert!(aggregate.needs_revision);
    }

    #[test]
    fn test_quick_critique_defaults() {
        let quick: QuickCritique = serde_json::from_str(r#"{"quick_score": "55", "critical_issues": null}"#).unwrap();
        assert_eq!(quick.quick_score, 55.0);
        assert!(quick.critical_issues.is_empty());
        assert!(quick.has_hook);
        assert!(quick.pass);
        assert!(quick.evaluated);
    }

    #[tokio::test]
    async fn test_dimension_falls_back_on_garbage() {
        let completion = ScriptedCompletion::new().reply("no idea");
        let engine = CritiqueEngine::new(completion);
        let report = engine
            .critique("draft", CritiqueDimension::Logic, &CritiqueContext::default())
            .await;
        assert_eq!(report.score, DEFAULT_SCORE);
        assert!(!report.evaluated);
    }

    #[tokio::test]
    async fn test_critique_parses_issues() {
        let completion = ScriptedCompletion::new().reply(dimension_reply(
            64,
            &[("major", "Lin forgets the key"), ("minor", "")],
        ));
        let engine = CritiqueEngine::new(completion.clone());
        let context = CritiqueContext::default().with_character_profiles("Lin: careful, quiet.");
        let report = engine.critique("draft", CritiqueDimension::Character, &context).await;

        assert_eq!(report.score, 64.0);
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].dimension, CritiqueDimension::Character);

        let request = &completion.requests()[0];
        assert_eq!(request.temperature, 0.3);
        assert!(request.user_prompt().contains("Lin: careful, quiet."));
    }

    #[tokio::test]
    async fn test_full_critique_empty_means_all() {
        let completion = ScriptedCompletion::new().fallback(dimension_reply(80, &[]));
        let engine = CritiqueEngine::new(completion.clone());
        let report = engine.full_critique("draft", &[], &CritiqueContext::default()).await;
        assert_eq!(report.reports.len(), 6);
        assert_eq!(completion.call_count(), 6);
        assert_eq!(report.weighted_score, 80.0);
    }

    #[tokio::test]
    async fn test_loop_target_reached_without_revision() {
        let completion = ScriptedCompletion::new().fallback(dimension_reply(90, &[]));
        let engine = CritiqueEngine::new(completion.clone());
        let outcome = engine
            .critique_and_revise_loop("draft", 3, 75.0, &[], &CritiqueContext::default())
            .await;
        assert_eq!(outcome.status, LoopStatus::TargetReached);
        assert_eq!(outcome.iterations.len(), 1);
        assert_eq!(outcome.final_text, "draft");
        assert_eq!(completion.call_count(), 3);
    }

    #[tokio::test]
    async fn test_loop_acceptable_below_target() {
        let completion = ScriptedCompletion::new().fallback(dimension_reply(65, &[]));
        let engine = CritiqueEngine::new(completion);
        let outcome = engine
            .critique_and_revise_loop("draft", 3, 75.0, &[CritiqueDimension::Logic], &CritiqueContext::default())
            .await;
        assert_eq!(outcome.status, LoopStatus::Acceptable);
    }

    #[tokio::test]
    async fn test_loop_revises_then_reaches_target() {
        let completion = ScriptedCompletion::new()
            .reply(dimension_reply(50, &[("critical", "plot hole")]))
            .reply("better draft")
            .reply(dimension_reply(85, &[]));
        let engine = CritiqueEngine::new(completion.clone());
        let outcome = engine
            .critique_and_revise_loop("draft", 3, 75.0, &[CritiqueDimension::Logic], &CritiqueContext::default())
            .await;

        assert_eq!(outcome.status, LoopStatus::TargetReached);
        assert_eq!(outcome.final_text, "better draft");
        assert_eq!(outcome.revisions(), 1);
        assert_eq!(outcome.iterations[0].score_before, 50.0);
        assert_eq!(outcome.iterations[0].score_after, 85.0);
        assert_eq!(outcome.improvement, 35.0);
        assert_eq!(completion.call_count(), 3);

        let revise = &completion.requests()[1];
        assert_eq!(revise.temperature, 0.7);
        assert!(revise.user_prompt().contains("plot hole"));
    }

    #[tokio::test]
    async fn test_loop_unchanged_revision_fails() {
        let completion = ScriptedCompletion::new()
            .reply(dimension_reply(40, &[]))
            .reply("draft");
        let engine = CritiqueEngine::new(completion);
        let outcome = engine
            .critique_and_revise_loop("draft", 3, 75.0, &[CritiqueDimension::Logic], &CritiqueContext::default())
            .await;
        assert_eq!(outcome.status, LoopStatus::RevisionFailed);
        assert_eq!(outcome.revisions(), 0);
        assert_eq!(outcome.final_text, "draft");
    }

    #[tokio::test]
    async fn test_loop_respects_max_iterations() {
        let completion = ScriptedCompletion::new()
            .reply(dimension_reply(40, &[("critical", "a")]))
            .reply("v2")
            .reply(dimension_reply(45, &[("critical", "b")]))
            .reply("v3")
            .reply(dimension_reply(42, &[("critical", "c")]));
        let engine = CritiqueEngine::new(completion.clone());
        let outcome = engine
            .critique_and_revise_loop("v1", 2, 75.0, &[CritiqueDimension::Logic], &CritiqueContext::default())
            .await;

        assert_eq!(outcome.status, LoopStatus::MaxIterationsReached);
        assert_eq!(outcome.revisions(), 2);
        assert_eq!(outcome.final_text, "v3");
        assert_eq!(outcome.improvement, 2.0);
        assert_eq!(completion.call_count(), 5);
    }

    #[tokio::test]
    async fn test_last_allowed_revision_ends_at_max_iterations() {
        let completion = ScriptedCompletion::new()
            .reply(dimension_reply(40, &[("critical", "plot hole")]))
            .reply("v2")
            .reply(dimension_reply(90, &[]));
        let engine = CritiqueEngine::new(completion.clone());
        let outcome = engine
            .critique_and_revise_loop("v1", 1, 75.0, &[CritiqueDimension::Logic], &CritiqueContext::default())
            .await;

        assert_eq!(outcome.status, LoopStatus::MaxIterationsReached);
        assert_eq!(outcome.revisions(), 1);
        assert_eq!(outcome.final_text, "v2");
        assert_eq!(outcome.final_score, 90.0);
        assert_eq!(completion.call_count(), 3);
    }

    #[tokio::test]
    async fn test_worse_revision_prefers_original() {
        let completion = ScriptedCompletion::new()
            .reply(dimension_reply(55, &[("critical", "a")]))
            .reply("v2")
            .reply(dimension_reply(50, &[("critical", "b")]));
        let engine = CritiqueEngine::new(completion);
        let outcome = engine
            .critique_and_revise_loop("v1", 1, 75.0, &[CritiqueDimension::Logic], &CritiqueContext::default())
            .await;
        assert_eq!(outcome.improvement, -5.0);
        assert_eq!(outcome.preferred_text(), "v1");
        assert_eq!(outcome.preferred_score(), 55.0);
    }

    #[tokio::test]
    async fn test_quick_critique_falls_back_to_pass() {
        let completion = ScriptedCompletion::new().fail(CompletionError::Timeout(Duration::from_secs(60)));
        let engine = CritiqueEngine::new(completion);
        let quick = engine.quick_critique("draft").await;
        assert!(quick.pass);
        assert!(!quick.evaluated);
        assert_eq!(quick.quick_score, DEFAULT_SCORE);
    }
}
