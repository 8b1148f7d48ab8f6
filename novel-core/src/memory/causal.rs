//! Causal chains: causes whose effects the story still owes the reader.
//!
//! A chain stays pending until the effect lands in some chapter. Pending
//! chains are what a new chapter is checked against when asking "what must
//! be paid off".

use super::timeline::TimelineEventId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a causal chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CausalChainId(Uuid);

impl CausalChainId {
    /// Create a new unique chain ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CausalChainId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CausalChainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CausalStatus {
    /// The effect has not happened yet.
    Pending,
    /// The effect happened.
    Resolved,
    /// The thread was dropped.
    Abandoned,
}

impl CausalStatus {
    pub fn name(&self) -> &'static str {
        match self {
            CausalStatus::Pending => "pending",
            CausalStatus::Resolved => "resolved",
            CausalStatus::Abandoned => "abandoned",
        }
    }
}

/// What kind of thing set the chain in motion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CauseType {
    Event,
    Decision,
    Foreshadowing,
    Secret,
}

/// What kind of payoff is expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectType {
    Consequence,
    Revelation,
    Confrontation,
    Payoff,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cause {
    pub cause_type: CauseType,
    pub description: String,
    pub chapter: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Effect {
    pub effect_type: EffectType,
    pub description: String,
    /// Chapter the effect happened in, once it has.
    pub chapter: Option<u32>,
}

/// A cause and its (possibly still pending) effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CausalChain {
    pub id: CausalChainId,
    pub cause: Cause,
    pub effect: Effect,
    pub involved_characters: Vec<String>,
    pub cause_event: Option<TimelineEventId>,
    pub effect_event: Option<TimelineEventId>,
    pub status: CausalStatus,
    pub resolution: Option<String>,
    /// 1-10.
    pub importance: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CausalChain {
    /// Create a new pending chain.
    pub fn new(
        cause_type: CauseType,
        cause_description: impl Into<String>,
        cause_chapter: u32,
        effect_type: EffectType,
        effect_description: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: CausalChainId::new(),
            cause: Cause {
                cause_type,
                description: cause_description.into(),
                chapter: cause_chapter,
            },
            effect: Effect {
                effect_type,
                description: effect_description.into(),
                chapter: None,
            },
            involved_characters: Vec::new(),
            cause_event: None,
            effect_event: None,
            status: CausalStatus::Pending,
            resolution: None,
            importance: 5,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_characters(mut self, characters: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.involved_characters = characters.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_importance(mut self, importance: u8) -> Self {
        self.importance = importance.clamp(1, 10);
        self
    }

    pub fn with_cause_event(mut self, event: TimelineEventId) -> Self {
        self.cause_event = Some(event);
        self
    }

    pub fn is_pending(&self) -> bool {
        self.status == CausalStatus::Pending
    }

    /// Whether the chain was still open at the end of `chapter`.
    pub fn pending_as_of(&self, chapter: u32) -> bool {
        if self.cause.chapter > chapter {
            return false;
        }
        match self.status {
            CausalStatus::Pending => true,
            CausalStatus::Resolved => self.effect.chapter.is_some_and(|c| c > chapter),
            CausalStatus::Abandoned => false,
        }
    }

    /// Mark the effect as having happened.
    ///
    /// Returns `Ok(false)` when the chain was already resolved.
    pub fn resolve(
        &mut self,
        effect_chapter: u32,
        resolution: impl Into<String>,
    ) -> Result<bool, CausalStatus> {
        match self.status {
            CausalStatus::Resolved => Ok(false),
            CausalStatus::Abandoned => Err(self.status),
            CausalStatus::Pending => {
                self.status = CausalStatus::Resolved;
                self.effect.chapter = Some(effect_chapter);
                self.resolution = Some(resolution.into());
                self.updated_at = Utc::now();
                Ok(true)
            }
        }
    }

    /// Drop the thread. Returns `Ok(false)` if it was already abandoned.
    pub fn abandon(&mut self) -> Result<bool, CausalStatus> {
        match self.status {
            CausalStatus::Abandoned => Ok(false),
            CausalStatus::Resolved => Err(self.status),
            CausalStatus::Pending => {
                self.status = CausalStatus::Abandoned;
                self.updated_at = Utc::now();
                Ok(true)
            }
        }
    }

    pub fn describe(&self) -> String {
        format!(
            "[Ch.{}] {} -> (pending) {}",
            self.cause.chapter, self.cause.description, self.effect.description
        )
    }
}
