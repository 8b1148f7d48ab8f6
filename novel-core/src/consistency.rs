//! Consistency checking of chapter drafts against narrative memory.
//!
//! A check asks the model for a typed violation report and classifies each
//! violation by severity. The checker is advisory: when the report cannot be
//! obtained it fails open and lets the chapter through, unless strict mode
//! asks for those chapters to be routed to manual review.
//!
//! ```text
//! Unchecked ──check──▶ Checked{violations} ──┬──▶ Accepted
//!                                            ├──▶ AutoFixed
//!                                            └──▶ ManualReviewRequired
//! ```

use crate::completion::{complete_within, CompletionRequest, TextCompletion, DEFAULT_TIMEOUT};
use crate::memory::MemoryView;
use crate::recovery::{self, lenient};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// =============================================================================
// Types
// =============================================================================

/// How serious a violation is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Severity {
    /// Contradicts established facts; must be fixed.
    Critical,
    /// Noticeable problem; a revision should be offered.
    Major,
    /// Worth flagging only.
    Minor,
}

impl Severity {
    /// Most severe first.
    pub const ORDER: [Severity; 3] = [Severity::Critical, Severity::Major, Severity::Minor];

    pub fn name(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Major => "major",
            Severity::Minor => "minor",
        }
    }

    /// Position in [`Severity::ORDER`].
    pub fn rank(&self) -> usize {
        match self {
            Severity::Critical => 0,
            Severity::Major => 1,
            Severity::Minor => 2,
        }
    }

    /// Eligible for automatic repair under `threshold`.
    pub fn within(&self, threshold: Severity) -> bool {
        self.rank() <= threshold.rank()
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "critical" | "severe" | "high" => Some(Severity::Critical),
            "major" | "medium" | "moderate" => Some(Severity::Major),
            "minor" | "low" => Some(Severity::Minor),
            _ => None,
        }
    }
}

impl From<String> for Severity {
    fn from(raw: String) -> Self {
        Severity::parse(&raw).unwrap_or(Severity::Minor)
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// What kind of fact a violation contradicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum ViolationCategory {
    Setting,
    Character,
    Plot,
    Foreshadowing,
    Other,
}

impl ViolationCategory {
    pub fn name(&self) -> &'static str {
        match self {
            ViolationCategory::Setting => "setting",
            ViolationCategory::Character => "character",
            ViolationCategory::Plot => "plot",
            ViolationCategory::Foreshadowing => "foreshadowing",
            ViolationCategory::Other => "other",
        }
    }
}

impl From<String> for ViolationCategory {
    fn from(raw: String) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "setting" | "world" => ViolationCategory::Setting,
            "character" => ViolationCategory::Character,
            "plot" | "timeline" => ViolationCategory::Plot,
            "foreshadowing" | "hook" => ViolationCategory::Foreshadowing,
            _ => ViolationCategory::Other,
        }
    }
}

/// A contradiction between a draft and what is already established.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyViolation {
    pub severity: Severity,
    pub category: ViolationCategory,
    pub description: String,
    /// Quote or position in the draft.
    pub location: Option<String>,
    pub suggested_fix: Option<String>,
    /// 0.0 to 1.0.
    pub confidence: f64,
}

impl ConsistencyViolation {
    pub fn new(
        severity: Severity,
        category: ViolationCategory,
        description: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            category,
            description: description.into(),
            location: None,
            suggested_fix: None,
            confidence: DEFAULT_CONFIDENCE,
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_suggested_fix(mut self, fix: impl Into<String>) -> Self {
        self.suggested_fix = Some(fix.into());
        self
    }

    fn render(&self) -> String {
        let mut line = format!("- [{}] {}: {}", self.severity, self.category.name(), self.description);
        if let Some(location) = &self.location {
            let _ = write!(line, "\n  Location: {location}");
        }
        if let Some(fix) = &self.suggested_fix {
            let _ = write!(line, "\n  Suggested fix: {fix}");
        }
        line
    }
}

const DEFAULT_CONFIDENCE: f64 = 0.8;

/// Outcome of a single check.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckResult {
    pub is_consistent: bool,
    pub violations: Vec<ConsistencyViolation>,
    pub summary: String,
    /// False when the check could not run and the result is a fail-open default.
    pub evaluated: bool,
    pub elapsed: Duration,
}

impl CheckResult {
    fn unevaluated(reason: impl std::fmt::Display, elapsed: Duration) -> Self {
        Self {
            is_consistent: true,
            violations: Vec::new(),
            summary: format!("consistency check could not run: {reason}"),
            evaluated: false,
            elapsed,
        }
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.violations.iter().filter(|v| v.severity == severity).count()
    }
}

/// Terminal state of a check-and-fix pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Accepted,
    AutoFixed,
    ManualReviewRequired,
}

/// Outcome of [`ConsistencyChecker::check_and_fix`].
#[derive(Debug, Clone, PartialEq)]
pub struct FixReport {
    pub check_result: CheckResult,
    /// Repaired text. Not re-checked.
    pub fixed_content: Option<String>,
    pub needs_manual_review: bool,
    /// Violations sent to the repair call.
    pub fixed_violations: Vec<ConsistencyViolation>,
}

impl FixReport {
    /// Manual review wins over an automatic fix.
    pub fn resolution(&self) -> Resolution {
        if self.needs_manual_review {
            Resolution::ManualReviewRequired
        } else if self.fixed_content.is_some() {
            Resolution::AutoFixed
        } else {
            Resolution::Accepted
        }
    }

    /// The text to carry forward: the repair if there is one.
    pub fn content<'a>(&'a self, original: &'a str) -> &'a str {
        self.fixed_content.as_deref().unwrap_or(original)
    }
}

/// Violation counts across one or more checks.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ViolationStats {
    pub total_checks: usize,
    pub total_violations: usize,
    pub by_severity: BTreeMap<Severity, usize>,
    pub by_category: BTreeMap<ViolationCategory, usize>,
}

impl ViolationStats {
    pub fn from_violations<'a>(violations: impl IntoIterator<Item = &'a ConsistencyViolation>) -> Self {
        let mut stats = Self::default();
        stats.add(violations);
        stats
    }

    /// Tally one check.
    pub fn record(&mut self, result: &CheckResult) {
        self.total_checks += 1;
        self.add(&result.violations);
    }

    fn add<'a>(&mut self, violations: impl IntoIterator<Item = &'a ConsistencyViolation>) {
        for v in violations {
            self.total_violations += 1;
            *self.by_severity.entry(v.severity).or_default() += 1;
            *self.by_category.entry(v.category).or_default() += 1;
        }
    }

    pub fn severity(&self, severity: Severity) -> usize {
        self.by_severity.get(&severity).copied().unwrap_or(0)
    }
}

/// World rules and premise the draft must respect.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorySetting {
    pub genre: Option<String>,
    pub style: Option<String>,
    pub world: Option<String>,
    pub synopsis: Option<String>,
}

impl StorySetting {
    pub fn with_genre(mut self, genre: impl Into<String>) -> Self {
        self.genre = Some(genre.into());
        self
    }

    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.style = Some(style.into());
        self
    }

    pub fn with_world(mut self, world: impl Into<String>) -> Self {
        self.world = Some(world.into());
        self
    }

    pub fn with_synopsis(mut self, synopsis: impl Into<String>) -> Self {
        self.synopsis = Some(synopsis.into());
        self
    }

    pub fn render(&self) -> String {
        let parts: Vec<String> = [
            ("Genre", &self.genre),
            ("Style", &self.style),
            ("World", &self.world),
            ("Synopsis", &self.synopsis),
        ]
        .into_iter()
        .filter_map(|(label, value)| value.as_ref().map(|v| format!("{label}: {v}")))
        .collect();
        parts.join("\n")
    }
}

/// Configuration for the checker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsistencyConfig {
    /// Route chapters whose check could not run to manual review.
    pub strict: bool,

    /// Include open hooks and pending causal chains in the check.
    pub include_foreshadowing: bool,

    pub temperature: f32,
    pub max_tokens: usize,
    pub repair_temperature: f32,
    pub repair_max_tokens: usize,

    /// Per-call timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            strict: false,
            include_foreshadowing: true,
            temperature: 0.2,
            max_tokens: 2000,
            repair_temperature: 0.5,
            repair_max_tokens: 8000,
            timeout_secs: DEFAULT_TIMEOUT.as_secs(),
        }
    }
}

impl ConsistencyConfig {
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Report shape requested from the model.
#[derive(Debug, Deserialize)]
struct CheckPayload {
    #[serde(default)]
    is_consistent: Option<bool>,
    #[serde(default)]
    violations: Vec<ViolationPayload>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    summary: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ViolationPayload {
    #[serde(default, deserialize_with = "lenient::opt_string")]
    severity: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    category: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    description: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    location: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    suggested_fix: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    confidence: Option<f64>,
}

impl From<ViolationPayload> for ConsistencyViolation {
    fn from(raw: ViolationPayload) -> Self {
        Self {
            severity: raw.severity.map(Severity::from).unwrap_or(Severity::Minor),
            category: raw
                .category
                .map(ViolationCategory::from)
                .unwrap_or(ViolationCategory::Other),
            description: raw.description.unwrap_or_default(),
            location: raw.location,
            suggested_fix: raw.suggested_fix,
            confidence: raw.confidence.unwrap_or(DEFAULT_CONFIDENCE).clamp(0.0, 1.0),
        }
    }
}

// =============================================================================
// Checker
// =============================================================================

/// Checks drafts against memory and repairs what it is allowed to.
pub struct ConsistencyChecker<C> {
    completion: C,
    config: ConsistencyConfig,
}

impl<C: TextCompletion> ConsistencyChecker<C> {
    pub fn new(completion: C) -> Self {
        Self {
            completion,
            config: ConsistencyConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ConsistencyConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ConsistencyConfig {
        &self.config
    }

    /// Check a draft against memory as of the chapter before it.
    ///
    /// Never fails: if the report cannot be obtained the result is
    /// consistent with `evaluated = false`.
    pub async fn check(
        &self,
        chapter_text: &str,
        memory: &MemoryView,
        setting: &StorySetting,
    ) -> CheckResult {
        let started = Instant::now();
        let request = CompletionRequest::prompt(self.check_prompt(chapter_text, memory, setting))
            .with_temperature(self.config.temperature)
            .with_max_tokens(self.config.max_tokens)
            .with_timeout(self.config.timeout());

        let completion = match complete_within(&self.completion, request).await {
            Ok(completion) => completion,
            Err(e) => {
                warn!(chapter = memory.chapter, error = %e, "consistency check call failed, passing chapter");
                return CheckResult::unevaluated(e, started.elapsed());
            }
        };

        let payload: CheckPayload = match recovery::recover_as(&completion.text) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    chapter = memory.chapter,
                    truncated = e.is_truncation() || completion.truncated,
                    error = %e,
                    "unreadable consistency report, passing chapter"
                );
                return CheckResult::unevaluated(e, started.elapsed());
            }
        };

        let violations: Vec<ConsistencyViolation> = payload
            .violations
            .into_iter()
            .map(ConsistencyViolation::from)
            .filter(|v| !v.description.trim().is_empty())
            .collect();
        let is_consistent = violations.is_empty() && payload.is_consistent.unwrap_or(true);

        let result = CheckResult {
            is_consistent,
            summary: payload.summary.unwrap_or_default(),
            violations,
            evaluated: true,
            elapsed: started.elapsed(),
        };
        info!(
            chapter = memory.chapter,
            consistent = result.is_consistent,
            critical = result.count(Severity::Critical),
            major = result.count(Severity::Major),
            minor = result.count(Severity::Minor),
            "consistency check complete"
        );
        result
    }

    /// Check, then repair violations at or above `threshold`.
    ///
    /// The repaired text is not re-checked; call [`check`](Self::check)
    /// again if a guarantee is needed.
    pub async fn check_and_fix(
        &self,
        chapter_text: &str,
        memory: &MemoryView,
        setting: &StorySetting,
        threshold: Severity,
    ) -> FixReport {
        let check_result = self.check(chapter_text, memory, setting).await;

        let mut report = FixReport {
            needs_manual_review: self.config.strict && !check_result.evaluated,
            check_result,
            fixed_content: None,
            fixed_violations: Vec::new(),
        };
        if report.check_result.is_consistent {
            return report;
        }

        let eligible: Vec<ConsistencyViolation> = report
            .check_result
            .violations
            .iter()
            .filter(|v| v.severity.within(threshold))
            .cloned()
            .collect();

        if !eligible.is_empty() {
            report.fixed_content = self.auto_fix(chapter_text, &eligible, memory, setting).await;
            // Violations that had to be fixed but were not still need a person.
            if report.fixed_content.is_none() {
                report.needs_manual_review = true;
            }
            report.fixed_violations = eligible;
        }

        if threshold == Severity::Critical && report.check_result.count(Severity::Major) > 0 {
            report.needs_manual_review = true;
        }

        debug!(
            chapter = memory.chapter,
            resolution = ?report.resolution(),
            fixed = report.fixed_violations.len(),
            "check and fix complete"
        );
        report
    }

    /// Ask for a repaired draft that only touches the conflicting passages.
    ///
    /// Returns `None` when the call fails or produces nothing usable.
    pub async fn auto_fix(
        &self,
        chapter_text: &str,
        violations: &[ConsistencyViolation],
        memory: &MemoryView,
        setting: &StorySetting,
    ) -> Option<String> {
        if violations.is_empty() {
            return Some(chapter_text.to_string());
        }

        let request = CompletionRequest::prompt(self.repair_prompt(chapter_text, violations, memory, setting))
            .with_temperature(self.config.repair_temperature)
            .with_max_tokens(self.config.repair_max_tokens)
            .with_timeout(self.config.timeout());

        match complete_within(&self.completion, request).await {
            Ok(completion) => {
                let fixed = completion.text.trim();
                if fixed.is_empty() {
                    warn!(chapter = memory.chapter, "repair returned empty text");
                    return None;
                }
                if completion.truncated {
                    warn!(chapter = memory.chapter, "repair output hit the token limit");
                    return None;
                }
                Some(fixed.to_string())
            }
            Err(e) => {
                warn!(chapter = memory.chapter, error = %e, "repair call failed");
                None
            }
        }
    }

    fn check_prompt(&self, chapter_text: &str, memory: &MemoryView, setting: &StorySetting) -> String {
        let setting_text = non_empty(setting.render(), "(no setting recorded)");
        let states: Vec<String> = memory
            .recent_character_states
            .iter()
            .map(|s| format!("- {}", s.describe()))
            .collect();
        let states = non_empty(states.join("\n"), "(no character states recorded)");
        let summary = non_empty(memory.global_summary.clone(), "(no summary yet)");
        let threads = if self.config.include_foreshadowing {
            non_empty(memory.render_open_threads(), "(no open threads)")
        } else {
            "(not checked)".to_string()
        };

        format!(
            r#"Check the latest chapter of a serialized novel for contradictions with what is already established.

## What to check
1. Setting: world rules, magic or technology systems, geography and time.
2. Characters: location (no teleporting), abilities, what each character can know, personality.
3. Plot: cause and effect, timeline order, whether events follow logically.
4. Foreshadowing: planted hooks referenced correctly, payoffs that make sense.

## Setting
{setting_text}

## Character states (most recent first)
{states}

## Story so far
{summary}

## Open hooks and pending threads
{threads}

## Latest chapter
{chapter_text}

Respond with ONLY a JSON object:
{{
  "is_consistent": true,
  "violations": [
    {{
      "severity": "critical|major|minor",
      "category": "setting|character|plot|foreshadowing",
      "description": "what contradicts what",
      "location": "quote from the chapter",
      "suggested_fix": "how to fix it",
      "confidence": 0.8
    }}
  ],
  "summary": "overall assessment"
}}

If nothing conflicts, return an empty violations array and "is_consistent": true."#
        )
    }

    fn repair_prompt(
        &self,
        chapter_text: &str,
        violations: &[ConsistencyViolation],
        memory: &MemoryView,
        setting: &StorySetting,
    ) -> String {
        let problems: Vec<String> = violations.iter().map(ConsistencyViolation::render).collect();
        let problems = problems.join("\n");
        let setting_text = setting.render();
        let states: Vec<String> = memory.character_states.iter().map(|s| s.describe()).collect();
        let states = states.join("\n");
        let summary = &memory.global_summary;

        format!(
            r#"The chapter below contradicts established facts. Repair it.

## Chapter
{chapter_text}

## Problems
{problems}

## Rules
1. Keep the plot direction and the sequence of events.
2. Only change the passages involved in the problems above.
3. The result must agree with the setting and character states.
4. Keep the voice, style and approximate length.

## Reference
Setting: {setting_text}
Character states: {states}
Story so far: {summary}

Return the full repaired chapter and nothing else."#
        )
    }
}

fn non_empty(text: String, placeholder: &str) -> String {
    if text.trim().is_empty() {
        placeholder.to_string()
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryStore, NarrativeMemoryStore, ProjectId};
    use crate::testing::ScriptedCompletion;

    async fn empty_view() -> MemoryView {
        InMemoryStore::new()
            .view_before(&ProjectId::new("p"), 4)
            .await
            .unwrap()
    }

    fn report(violations: &[(&str, &str)]) -> String {
        let items: Vec<String> = violations
            .iter()
            .map(|(severity, description)| {
                format!(r#"{{"severity": "{severity}", "category": "character", "description": "{description}"}}"#)
            })
            .collect();
        format!(
            r#"{{"is_consistent": false, "violations": [{}], "summary": "problems"}}"#,
            items.join(",")
        )
    }

    #[test]
    fn test_severity_order() {
        assert!(Severity::Critical.within(Severity::Critical));
        assert!(!Severity::Major.within(Severity::Critical));
        assert!(Severity::Major.within(Severity::Major));
        assert!(Severity::Critical.within(Severity::Minor));
        assert_eq!(Severity::from("HIGH".to_string()), Severity::Critical);
        assert_eq!(Severity::from("whatever".to_string()), Severity::Minor);
    }

    #[test]
    fn test_violation_payload_defaults() {
        let raw: ViolationPayload =
            serde_json::from_str(r#"{"description": "Lin is in two places", "confidence": "1.7"}"#).unwrap();
        let v = ConsistencyViolation::from(raw);
        assert_eq!(v.severity, Severity::Minor);
        assert_eq!(v.category, ViolationCategory::Other);
        assert_eq!(v.confidence, 1.0);
    }

    #[test]
    fn test_violation_stats() {
        let violations = vec![
            ConsistencyViolation::new(Severity::Major, ViolationCategory::Plot, "a"),
            ConsistencyViolation::new(Severity::Major, ViolationCategory::Character, "b"),
            ConsistencyViolation::new(Severity::Minor, ViolationCategory::Plot, "c"),
        ];
        let stats = ViolationStats::from_violations(&violations);
        assert_eq!(stats.total_violations, 3);
        assert_eq!(stats.severity(Severity::Major), 2);
        assert_eq!(stats.severity(Severity::Critical), 0);
        assert_eq!(stats.by_category[&ViolationCategory::Plot], 2);
    }

    #[test]
    fn test_setting_render() {
        let setting = StorySetting::default().with_genre("wuxia").with_world("Nine sects");
        assert_eq!(setting.render(), "Genre: wuxia\nWorld: Nine sects");
    }

    #[tokio::test]
    async fn test_check_parses_report() {
        let completion = ScriptedCompletion::new().reply(format!(
            "Here is my analysis:\n```json\n{}\n```",
            report(&[("critical", "Lin was dead in chapter 2")])
        ));
        let checker = ConsistencyChecker::new(completion.clone());
        let result = checker.check("Lin waved.", &empty_view().await, &StorySetting::default()).await;

        assert!(!result.is_consistent);
        assert!(result.evaluated);
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.violations[0].severity, Severity::Critical);

        let request = &completion.requests()[0];
        assert_eq!(request.temperature, 0.2);
        assert_eq!(request.max_tokens, Some(2000));
        assert!(request.user_prompt().contains("Lin waved."));
    }

    #[tokio::test]
    async fn test_check_fails_open_on_garbage() {
        let completion = ScriptedCompletion::new().reply("I could not decide, sorry.");
        let checker = ConsistencyChecker::new(completion);
        let result = checker.check("text", &empty_view().await, &StorySetting::default()).await;
        assert!(result.is_consistent);
        assert!(!result.evaluated);
        assert!(result.violations.is_empty());
        assert!(result.summary.contains("could not run"));
    }

    #[tokio::test]
    async fn test_check_fails_open_on_transport_error() {
        let completion = ScriptedCompletion::new().fail(crate::completion::CompletionError::Server("503".into()));
        let checker = ConsistencyChecker::new(completion);
        let result = checker.check("text", &empty_view().await, &StorySetting::default()).await;
        assert!(result.is_consistent);
        assert!(!result.evaluated);
    }

    #[tokio::test]
    async fn test_flag_without_violations_is_consistent() {
        let completion = ScriptedCompletion::new().reply(r#"{"is_consistent": false, "violations": []}"#);
        let checker = ConsistencyChecker::new(completion);
        let result = checker.check("text", &empty_view().await, &StorySetting::default()).await;
        assert!(!result.is_consistent);

        let completion = ScriptedCompletion::new().reply(r#"{"violations": []}"#);
        let checker = ConsistencyChecker::new(completion);
        let result = checker.check("text", &empty_view().await, &StorySetting::default()).await;
        assert!(result.is_consistent);
    }

    #[tokio::test]
    async fn test_critical_threshold_repairs_only_critical() {
        let completion = ScriptedCompletion::new()
            .reply(report(&[("critical", "dead man walks"), ("major", "wrong city"), ("minor", "eye color")]))
            .reply("Repaired chapter.");
        let checker = ConsistencyChecker::new(completion.clone());
        let fix = checker
            .check_and_fix("Draft.", &empty_view().await, &StorySetting::default(), Severity::Critical)
            .await;

        assert_eq!(fix.fixed_content.as_deref(), Some("Repaired chapter."));
        assert_eq!(fix.fixed_violations.len(), 1);
        assert!(fix.needs_manual_review);
        assert_eq!(fix.resolution(), Resolution::ManualReviewRequired);

        let repair = &completion.requests()[1];
        assert_eq!(repair.temperature, 0.5);
        assert_eq!(repair.max_tokens, Some(8000));
        assert!(repair.user_prompt().contains("dead man walks"));
        assert!(!repair.user_prompt().contains("wrong city"));
    }

    #[tokio::test]
    async fn test_major_threshold_repairs_major() {
        let completion = ScriptedCompletion::new()
            .reply(report(&[("major", "wrong city"), ("minor", "eye color")]))
            .reply("Fixed.");
        let checker = ConsistencyChecker::new(completion.clone());
        let fix = checker
            .check_and_fix("Draft.", &empty_view().await, &StorySetting::default(), Severity::Major)
            .await;

        assert_eq!(fix.fixed_violations.len(), 1);
        assert!(!fix.needs_manual_review);
        assert_eq!(fix.resolution(), Resolution::AutoFixed);
        assert_eq!(fix.content("Draft."), "Fixed.");
    }

    #[tokio::test]
    async fn test_failed_repair_needs_review() {
        let completion = ScriptedCompletion::new()
            .reply(report(&[("critical", "dead man walks")]))
            .reply("   ");
        let checker = ConsistencyChecker::new(completion);
        let fix = checker
            .check_and_fix("Draft.", &empty_view().await, &StorySetting::default(), Severity::Critical)
            .await;
        assert!(fix.fixed_content.is_none());
        assert_eq!(fix.content("Draft."), "Draft.");
        assert_eq!(fix.resolution(), Resolution::ManualReviewRequired);
    }

    #[tokio::test]
    async fn test_strict_mode_flags_unevaluated() {
        let completion = ScriptedCompletion::new().reply("not json at all");
        let checker = ConsistencyChecker::new(completion.clone())
            .with_config(ConsistencyConfig::default().strict());
        let fix = checker
            .check_and_fix("Draft.", &empty_view().await, &StorySetting::default(), Severity::Critical)
            .await;
        assert!(fix.needs_manual_review);
        assert!(fix.fixed_content.is_none());
        assert_eq!(completion.call_count(), 1);
    }

    #[tokio::test]
    async fn test_foreshadowing_can_be_excluded() {
        let completion = ScriptedCompletion::new().reply(r#"{"violations": []}"#);
        let config = ConsistencyConfig {
            include_foreshadowing: false,
            ..Default::default()
        };
        let checker = ConsistencyChecker::new(completion.clone()).with_config(config);
        checker.check("x", &empty_view().await, &StorySetting::default()).await;
        assert!(completion.requests()[0].user_prompt().contains("(not checked)"));
    }
}
