//! Per-chapter character state.
//!
//! States are append-only and keyed by character and chapter. The "current"
//! state of a character as of chapter N is the row with the highest chapter
//! number not exceeding N. A new chapter's row is built by carrying the
//! previous row forward and applying the changes extracted from the chapter.

use crate::recovery::lenient;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health of a character.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Injured,
    Critical,
    Dead,
    /// Anything the model reported that does not map to a known status.
    Other(String),
}

impl HealthStatus {
    pub fn as_str(&self) -> &str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Injured => "injured",
            HealthStatus::Critical => "critical",
            HealthStatus::Dead => "dead",
            HealthStatus::Other(s) => s,
        }
    }
}

impl From<String> for HealthStatus {
    fn from(raw: String) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "" | "healthy" | "fine" | "normal" => HealthStatus::Healthy,
            "injured" | "wounded" | "hurt" => HealthStatus::Injured,
            "critical" | "dying" => HealthStatus::Critical,
            "dead" | "deceased" => HealthStatus::Dead,
            _ => HealthStatus::Other(raw.trim().to_string()),
        }
    }
}

impl From<HealthStatus> for String {
    fn from(status: HealthStatus) -> Self {
        status.as_str().to_string()
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emotional state with an intensity on a 1-10 scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionState {
    pub emotion: String,
    pub intensity: u8,
    pub reason: Option<String>,
}

impl EmotionState {
    pub fn new(emotion: impl Into<String>, intensity: u8) -> Self {
        Self {
            emotion: emotion.into(),
            intensity: intensity.clamp(1, 10),
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Items gained and lost during a chapter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InventoryDelta {
    #[serde(default, deserialize_with = "lenient::string_list")]
    pub gained: Vec<String>,
    #[serde(default, deserialize_with = "lenient::string_list")]
    pub lost: Vec<String>,
}

impl InventoryDelta {
    pub fn is_empty(&self) -> bool {
        self.gained.is_empty() && self.lost.is_empty()
    }
}

/// A change in how a character relates to someone else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipDelta {
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub change: String,
}

/// Progress toward one of a character's goals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalProgress {
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub progress: String,
}

/// A character's state at the end of a chapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterState {
    pub character: String,
    pub chapter_number: u32,
    pub location: Option<String>,
    pub location_detail: Option<String>,
    pub emotion: Option<EmotionState>,
    pub health: HealthStatus,
    pub injuries: Vec<String>,
    /// Everything the character carries after this chapter.
    pub inventory: Vec<String>,
    /// What changed in this chapter.
    pub inventory_delta: InventoryDelta,
    pub relationship_deltas: Vec<RelationshipDelta>,
    pub power_level: Option<String>,
    pub known_secrets: Vec<String>,
    pub new_knowledge: Vec<String>,
    pub current_goals: Vec<String>,
    pub goal_progress: Vec<GoalProgress>,
    pub recorded_at: DateTime<Utc>,
}

impl CharacterState {
    /// A blank state for a character first seen in `chapter`.
    pub fn new(character: impl Into<String>, chapter_number: u32) -> Self {
        Self {
            character: character.into(),
            chapter_number,
            location: None,
            location_detail: None,
            emotion: None,
            health: HealthStatus::Healthy,
            injuries: Vec::new(),
            inventory: Vec::new(),
            inventory_delta: InventoryDelta::default(),
            relationship_deltas: Vec::new(),
            power_level: None,
            known_secrets: Vec::new(),
            new_knowledge: Vec::new(),
            current_goals: Vec::new(),
            goal_progress: Vec::new(),
            recorded_at: Utc::now(),
        }
    }

    /// Start `chapter`'s row from the previous state.
    ///
    /// Durable attributes (location, emotion, health, inventory, power level,
    /// secrets, goals) are inherited; per-chapter deltas start empty.
    pub fn carry_forward(previous: Option<&CharacterState>, character: &str, chapter: u32) -> Self {
        let mut state = Self::new(character, chapter);
        if let Some(prev) = previous {
            state.location = prev.location.clone();
            state.location_detail = prev.location_detail.clone();
            state.emotion = prev.emotion.clone();
            state.health = prev.health.clone();
            state.injuries = prev.injuries.clone();
            state.inventory = prev.inventory.clone();
            state.power_level = prev.power_level.clone();
            state.known_secrets = prev.known_secrets.clone();
            state.current_goals = prev.current_goals.clone();
        }
        state
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_emotion(mut self, emotion: EmotionState) -> Self {
        self.emotion = Some(emotion);
        self
    }

    pub fn with_health(mut self, health: HealthStatus) -> Self {
        self.health = health;
        self
    }

    pub fn with_inventory(mut self, items: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.inventory = items.into_iter().map(Into::into).collect();
        self
    }

    /// Apply extracted changes on top of this state.
    pub fn apply(&mut self, update: &CharacterStateUpdate) {
        if let Some(location) = &update.location {
            self.location = Some(location.clone());
        }
        if let Some(detail) = &update.location_detail {
            self.location_detail = Some(detail.clone());
        }
        if let Some(emotion) = &update.emotion {
            let intensity = update
                .emotion_intensity
                .map(|i| i.clamp(1, 10) as u8)
                .or(self.emotion.as_ref().map(|e| e.intensity))
                .unwrap_or(5);
            self.emotion = Some(EmotionState {
                emotion: emotion.clone(),
                intensity,
                reason: update.emotion_reason.clone(),
            });
        }
        if let Some(health) = &update.health_status {
            self.health = HealthStatus::from(health.clone());
        }
        if !update.injuries.is_empty() {
            self.injuries = update.injuries.clone();
        }
        if self.health == HealthStatus::Healthy && update.health_status.is_some() {
            self.injuries.clear();
        }

        for item in &update.inventory_changes.lost {
            if let Some(pos) = self.inventory.iter().position(|i| i == item) {
                self.inventory.remove(pos);
            }
        }
        for item in &update.inventory_changes.gained {
            if !self.inventory.contains(item) {
                self.inventory.push(item.clone());
            }
        }
        self.inventory_delta = update.inventory_changes.clone();

        self.relationship_deltas = update
            .relationship_changes
            .iter()
            .filter(|r| !r.target.trim().is_empty())
            .cloned()
            .collect();

        if let Some(power) = &update.power_level {
            self.power_level = Some(power.clone());
        }
        for secret in &update.known_secrets {
            if !self.known_secrets.contains(secret) {
                self.known_secrets.push(secret.clone());
            }
        }
        self.new_knowledge = update.new_knowledge.clone();
        if !update.current_goals.is_empty() {
            self.current_goals = update.current_goals.clone();
        }
        self.goal_progress = update
            .goal_progress
            .iter()
            .filter(|g| !g.goal.trim().is_empty())
            .cloned()
            .collect();
    }

    /// One-line description used in prompts.
    pub fn describe(&self) -> String {
        let mut parts = vec![format!("[Ch.{}] {}", self.chapter_number, self.character)];
        if let Some(location) = &self.location {
            parts.push(format!("at {location}"));
        }
        if let Some(emotion) = &self.emotion {
            parts.push(format!("feeling {} ({}/10)", emotion.emotion, emotion.intensity));
        }
        if self.health != HealthStatus::Healthy {
            parts.push(format!("health: {}", self.health));
        }
        if !self.inventory.is_empty() {
            parts.push(format!("carrying {}", self.inventory.join(", ")));
        }
        if !self.current_goals.is_empty() {
            parts.push(format!("goals: {}", self.current_goals.join("; ")));
        }
        parts.join(", ")
    }
}

/// Changes to one character, as extracted from a chapter by the model.
///
/// Every field is optional; absent fields leave the inherited state alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CharacterStateUpdate {
    #[serde(default, alias = "character")]
    pub character_name: String,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub location: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub location_detail: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub emotion: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_u32")]
    pub emotion_intensity: Option<u32>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub emotion_reason: Option<String>,
    #[serde(default, alias = "health", deserialize_with = "lenient::opt_string")]
    pub health_status: Option<String>,
    #[serde(default, deserialize_with = "lenient::string_list")]
    pub injuries: Vec<String>,
    #[serde(default)]
    pub inventory_changes: InventoryDelta,
    #[serde(default)]
    pub relationship_changes: Vec<RelationshipDelta>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub power_level: Option<String>,
    #[serde(default, deserialize_with = "lenient::string_list")]
    pub known_secrets: Vec<String>,
    #[serde(default, deserialize_with = "lenient::string_list")]
    pub new_knowledge: Vec<String>,
    #[serde(default, deserialize_with = "lenient::string_list")]
    pub current_goals: Vec<String>,
    #[serde(default)]
    pub goal_progress: Vec<GoalProgress>,
}

/// The extraction payload: `{"character_states": [...]}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CharacterExtraction {
    #[serde(default)]
    pub character_states: Vec<CharacterStateUpdate>,
}
