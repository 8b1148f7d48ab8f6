//! Story timeline events and the causal graph between them.

use crate::recovery::lenient;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Unique identifier for a timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimelineEventId(Uuid);

impl TimelineEventId {
    /// Create a new unique event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TimelineEventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TimelineEventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of event, as classified by the extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", from = "String")]
pub enum EventType {
    #[default]
    Plot,
    Character,
    World,
    Foreshadowing,
}

impl From<String> for EventType {
    fn from(raw: String) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "character" => EventType::Character,
            "world" | "setting" => EventType::World,
            "foreshadowing" | "hook" => EventType::Foreshadowing,
            _ => EventType::Plot,
        }
    }
}

/// Something that happened in the story.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub id: TimelineEventId,
    pub chapter_number: u32,
    /// In-story time, e.g. "the third night".
    pub story_time: Option<String>,
    pub title: String,
    pub description: String,
    pub event_type: EventType,
    pub involved_characters: Vec<String>,
    pub location: Option<String>,
    /// The event this one was caused by.
    pub caused_by: Option<TimelineEventId>,
    /// Events this one leads to.
    pub leads_to: Vec<TimelineEventId>,
    /// 1-10.
    pub importance: u8,
    pub is_turning_point: bool,
    pub recorded_at: DateTime<Utc>,
}

impl TimelineEvent {
    pub fn new(chapter_number: u32, title: impl Into<String>) -> Self {
        Self {
            id: TimelineEventId::new(),
            chapter_number,
            story_time: None,
            title: title.into(),
            description: String::new(),
            event_type: EventType::Plot,
            involved_characters: Vec::new(),
            location: None,
            caused_by: None,
            leads_to: Vec::new(),
            importance: 5,
            is_turning_point: false,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_story_time(mut self, story_time: impl Into<String>) -> Self {
        self.story_time = Some(story_time.into());
        self
    }

    pub fn with_characters(mut self, characters: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.involved_characters = characters.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cause(mut self, cause: TimelineEventId) -> Self {
        self.caused_by = Some(cause);
        self
    }

    pub fn leading_to(mut self, effect: TimelineEventId) -> Self {
        if !self.leads_to.contains(&effect) {
            self.leads_to.push(effect);
        }
        self
    }

    /// Importance is clamped to 1-10.
    pub fn with_importance(mut self, importance: u8) -> Self {
        self.importance = importance.clamp(1, 10);
        self
    }

    pub fn turning_point(mut self) -> Self {
        self.is_turning_point = true;
        self
    }

    /// Outgoing causal edges: this event to everything it leads to.
    fn successors(&self) -> impl Iterator<Item = TimelineEventId> + '_ {
        self.leads_to.iter().copied()
    }
}

impl From<ExtractedEvent> for TimelineEvent {
    fn from(extracted: ExtractedEvent) -> Self {
        let mut event = TimelineEvent::new(0, extracted.event_title)
            .with_description(extracted.event_description)
            .with_characters(extracted.involved_characters)
            .with_importance(extracted.importance.unwrap_or(5).min(10) as u8);
        event.event_type = extracted.event_type;
        event.story_time = extracted.story_time;
        event.location = extracted.location;
        event.is_turning_point = extracted.is_turning_point;
        event
    }
}

/// An event as extracted by the model from a chapter.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ExtractedEvent {
    #[serde(default, alias = "title")]
    pub event_title: String,
    #[serde(default, alias = "description")]
    pub event_description: String,
    #[serde(default)]
    pub event_type: EventType,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub story_time: Option<String>,
    #[serde(default, deserialize_with = "lenient::string_list")]
    pub involved_characters: Vec<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub location: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_u32")]
    pub importance: Option<u32>,
    #[serde(default, deserialize_with = "lenient::bool_flag")]
    pub is_turning_point: bool,
}

/// The extraction payload: `{"events": [...]}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventExtraction {
    #[serde(default)]
    pub events: Vec<ExtractedEvent>,
}

/// Whether adding the edge `from -> to` to the event graph would form a cycle.
///
/// Edges are `caused_by -> event` and `event -> leads_to`. The new edge closes
/// a cycle exactly when `from` is already reachable from `to`.
pub fn creates_cycle<'a>(
    events: impl IntoIterator<Item = &'a TimelineEvent>,
    from: TimelineEventId,
    to: TimelineEventId,
) -> bool {
    if from == to {
        return true;
    }

    let mut edges: HashMap<TimelineEventId, Vec<TimelineEventId>> = HashMap::new();
    for event in events {
        if let Some(cause) = event.caused_by {
            edges.entry(cause).or_default().push(event.id);
        }
        edges.entry(event.id).or_default().extend(event.successors());
    }

    let mut stack = vec![to];
    let mut seen = HashSet::new();
    while let Some(node) = stack.pop() {
        if node == from {
            return true;
        }
        if !seen.insert(node) {
            continue;
        }
        if let Some(next) = edges.get(&node) {
            stack.extend(next.iter().copied());
        }
    }
    false
}
