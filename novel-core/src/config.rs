//! Pipeline configuration.
//!
//! Every setting has a default. [`PipelineConfig::from_env`] overrides the
//! defaults from `NOVEL_*` environment variables; unset variables are left
//! alone and unparseable ones are reported.

use crate::consistency::{ConsistencyConfig, Severity};
use crate::critique::{CritiqueConfig, CritiqueDimension};
use crate::finalize::FinalizeConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub const ENV_AUTO_FIX_THRESHOLD: &str = "NOVEL_AUTO_FIX_THRESHOLD";
pub const ENV_STRICT: &str = "NOVEL_STRICT";
pub const ENV_TARGET_SCORE: &str = "NOVEL_TARGET_SCORE";
pub const ENV_MAX_ITERATIONS: &str = "NOVEL_MAX_ITERATIONS";
pub const ENV_CALL_TIMEOUT_SECS: &str = "NOVEL_CALL_TIMEOUT_SECS";
pub const ENV_LOOP_BUDGET_SECS: &str = "NOVEL_LOOP_BUDGET_SECS";
pub const ENV_DIMENSIONS: &str = "NOVEL_DIMENSIONS";

/// An environment variable held a value that could not be used.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid value {value:?} for {key}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
}

/// Configuration for [`ChapterPipeline`](crate::pipeline::ChapterPipeline).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Violations at or above this severity are repaired automatically.
    pub auto_fix_threshold: Severity,

    /// Composite critique score the revise loop aims for.
    pub target_score: f64,

    /// Revisions attempted per draft.
    pub max_iterations: usize,

    /// Dimensions the revise loop scores. Empty means the core three.
    pub dimensions: Vec<CritiqueDimension>,

    /// Wall-clock budget for one draft's critique loop.
    pub loop_budget_secs: u64,

    pub consistency: ConsistencyConfig,
    pub critique: CritiqueConfig,
    pub finalize: FinalizeConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            auto_fix_threshold: Severity::Critical,
            target_score: 75.0,
            max_iterations: 3,
            dimensions: Vec::new(),
            loop_budget_secs: 900,
            consistency: ConsistencyConfig::default(),
            critique: CritiqueConfig::default(),
            finalize: FinalizeConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Defaults overridden by `NOVEL_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key/value source.
    pub fn apply_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let get = |key: &'static str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(|v| (key, v))
        };

        if let Some((key, value)) = get(ENV_AUTO_FIX_THRESHOLD) {
            self.auto_fix_threshold = Severity::parse(&value).ok_or(ConfigError { key, value })?;
        }
        if let Some((key, value)) = get(ENV_STRICT) {
            self.consistency.strict = parse_flag(&value).ok_or(ConfigError { key, value })?;
        }
        if let Some((key, value)) = get(ENV_TARGET_SCORE) {
            self.target_score = value
                .parse::<f64>()
                .ok()
                .filter(|s| (0.0..=100.0).contains(s))
                .ok_or(ConfigError { key, value })?;
        }
        if let Some((key, value)) = get(ENV_MAX_ITERATIONS) {
            self.max_iterations = value.parse().map_err(|_| ConfigError { key, value })?;
        }
        if let Some((key, value)) = get(ENV_CALL_TIMEOUT_SECS) {
            let secs: u64 = value
                .parse()
                .ok()
                .filter(|s| *s > 0)
                .ok_or(ConfigError { key, value })?;
            self = self.with_call_timeout(Duration::from_secs(secs));
        }
        if let Some((key, value)) = get(ENV_LOOP_BUDGET_SECS) {
            self.loop_budget_secs = value
                .parse()
                .ok()
                .filter(|s| *s > 0)
                .ok_or(ConfigError { key, value })?;
        }
        if let Some((key, value)) = get(ENV_DIMENSIONS) {
            self.dimensions = value
                .split(',')
                .map(|d| serde_json::from_value(serde_json::Value::String(d.trim().to_lowercase())).ok())
                .collect::<Option<Vec<CritiqueDimension>>>()
                .ok_or(ConfigError { key, value })?;
        }
        Ok(self)
    }

    pub fn with_auto_fix_threshold(mut self, threshold: Severity) -> Self {
        self.auto_fix_threshold = threshold;
        self
    }

    pub fn with_target_score(mut self, score: f64) -> Self {
        self.target_score = score;
        self
    }

    pub fn with_max_iterations(mut self, iterations: usize) -> Self {
        self.max_iterations = iterations;
        self
    }

    pub fn with_dimensions(mut self, dimensions: Vec<CritiqueDimension>) -> Self {
        self.dimensions = dimensions;
        self
    }

    pub fn with_loop_budget(mut self, budget: Duration) -> Self {
        self.loop_budget_secs = budget.as_secs().max(1);
        self
    }

    pub fn strict(mut self) -> Self {
        self.consistency.strict = true;
        self
    }

    /// Use one per-call timeout for every component.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        let secs = timeout.as_secs().max(1);
        self.consistency.timeout_secs = secs;
        self.critique.critique_timeout_secs = secs;
        self.critique.revise_timeout_secs = secs;
        self.critique.quick_timeout_secs = secs;
        self.finalize.timeout_secs = secs;
        self
    }

    pub fn loop_budget(&self) -> Duration {
        Duration::from_secs(self.loop_budget_secs)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.auto_fix_threshold, Severity::Critical);
        assert_eq!(config.target_score, 75.0);
        assert_eq!(config.max_iterations, 3);
        assert!(!config.consistency.strict);
    }

    #[test]
    fn test_overrides() {
        let config = PipelineConfig::default()
            .apply_overrides(lookup(&[
                (ENV_AUTO_FIX_THRESHOLD, "major"),
                (ENV_STRICT, "yes"),
                (ENV_TARGET_SCORE, "82.5"),
                (ENV_MAX_ITERATIONS, "0"),
                (ENV_CALL_TIMEOUT_SECS, "30"),
                (ENV_DIMENSIONS, "logic, writing"),
            ]))
            .unwrap();
        assert_eq!(config.auto_fix_threshold, Severity::Major);
        assert!(config.consistency.strict);
        assert_eq!(config.target_score, 82.5);
        assert_eq!(config.max_iterations, 0);
        assert_eq!(config.critique.revise_timeout_secs, 30);
        assert_eq!(config.finalize.timeout_secs, 30);
        assert_eq!(
            config.dimensions,
            vec![CritiqueDimension::Logic, CritiqueDimension::Prose]
        );
    }

    #[test]
    fn test_blank_values_are_ignored() {
        let config = PipelineConfig::default()
            .apply_overrides(lookup(&[(ENV_TARGET_SCORE, "  ")]))
            .unwrap();
        assert_eq!(config.target_score, 75.0);
    }

    #[test]
    fn test_invalid_values_are_reported() {
        let err = PipelineConfig::default()
            .apply_overrides(lookup(&[(ENV_TARGET_SCORE, "high")]))
            .unwrap_err();
        assert_eq!(err.key, ENV_TARGET_SCORE);

        let err = PipelineConfig::default()
            .apply_overrides(lookup(&[(ENV_DIMENSIONS, "logic,vibes")]))
            .unwrap_err();
        assert_eq!(err.key, ENV_DIMENSIONS);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"max_iterations": 5, "critique": {"revise_temperature": 0.9}}"#).unwrap();
        assert_eq!(config.max_iterations, 5);
        assert_eq!(config.critique.revise_temperature, 0.9);
        assert_eq!(config.critique.critique_temperature, 0.3);
    }
}
