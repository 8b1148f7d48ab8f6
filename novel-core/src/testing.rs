//! Testing utilities.
//!
//! This module provides deterministic stand-ins for the external
//! collaborators so the pipeline can be exercised without API calls:
//! - `ScriptedCompletion` replays queued replies and records every request
//! - `ScriptedReader` returns fixed reader feedback per chapter

use crate::completion::{Completion, CompletionError, CompletionRequest, TextCompletion};
use crate::selection::{ReaderFeedback, ReaderSimulation};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Script {
    queue: VecDeque<Result<Completion, CompletionError>>,
    /// Replies chosen by substrings of the user prompt, checked before the queue.
    routes: Vec<(Vec<String>, Completion)>,
    fallback: Option<Completion>,
    requests: Vec<CompletionRequest>,
}

/// A completion service that returns scripted replies.
///
/// Clones share the same script and call log, so a test can hand one clone
/// to the component under test and inspect the other afterwards. Replies are
/// taken in order; once the queue is empty the fallback is used, and without
/// a fallback the call fails.
#[derive(Debug, Clone, Default)]
pub struct ScriptedCompletion {
    script: Arc<Mutex<Script>>,
}

impl ScriptedCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful reply.
    pub fn reply(self, text: impl Into<String>) -> Self {
        self.lock().queue.push_back(Ok(Completion::new(text)));
        self
    }

    /// Queue a reply that stopped at the token limit.
    pub fn reply_truncated(self, text: impl Into<String>) -> Self {
        let completion = Completion {
            text: text.into(),
            truncated: true,
        };
        self.lock().queue.push_back(Ok(completion));
        self
    }

    /// Queue a failure.
    pub fn fail(self, error: CompletionError) -> Self {
        self.lock().queue.push_back(Err(error));
        self
    }

    /// Always answer prompts containing `pattern` with `text`.
    pub fn route(self, pattern: impl Into<String>, text: impl Into<String>) -> Self {
        self.route_all([pattern.into()], text)
    }

    /// Always answer prompts containing every one of `patterns` with `text`.
    ///
    /// Routes are tried in the order they were added.
    pub fn route_all<I, P>(self, patterns: I, text: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        let patterns = patterns.into_iter().map(Into::into).collect();
        self.lock().routes.push((patterns, Completion::new(text)));
        self
    }

    /// Reply used once the queue is exhausted.
    pub fn fallback(self, text: impl Into<String>) -> Self {
        self.lock().fallback = Some(Completion::new(text));
        self
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.lock().requests.clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().requests.len()
    }

    /// Requests whose user prompt contains `pattern`.
    pub fn calls_matching(&self, pattern: &str) -> usize {
        self.lock()
            .requests
            .iter()
            .filter(|r| r.user_prompt().contains(pattern))
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        // A panicking test thread must not hide the log from the others.
        self.script.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl TextCompletion for ScriptedCompletion {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, CompletionError> {
        let mut script = self.lock();
        let prompt = request.user_prompt();
        let routed = script
            .routes
            .iter()
            .find(|(patterns, _)| patterns.iter().all(|p| prompt.contains(p.as_str())))
            .map(|(_, reply)| reply.clone());
        script.requests.push(request);

        if let Some(reply) = routed {
            return Ok(reply);
        }
        match script.queue.pop_front() {
            Some(next) => next,
            None => script
                .fallback
                .clone()
                .ok_or_else(|| CompletionError::Other("no scripted reply left".to_string())),
        }
    }
}

/// A reader simulation with fixed answers.
///
/// Feedback is chosen by the first registered pattern found in the chapter
/// text, or the default feedback otherwise.
#[derive(Debug, Clone, Default)]
pub struct ScriptedReader {
    by_pattern: Vec<(String, ReaderFeedback)>,
    default: ReaderFeedback,
}

impl ScriptedReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default(mut self, feedback: ReaderFeedback) -> Self {
        self.default = feedback;
        self
    }

    pub fn when(mut self, pattern: impl Into<String>, feedback: ReaderFeedback) -> Self {
        self.by_pattern.push((pattern.into(), feedback));
        self
    }
}

#[async_trait]
impl ReaderSimulation for ScriptedReader {
    async fn simulate(&self, chapter_text: &str, _previous_summary: Option<&str>) -> ReaderFeedback {
        self.by_pattern
            .iter()
            .find(|(pattern, _)| chapter_text.contains(pattern.as_str()))
            .map(|(_, feedback)| feedback.clone())
            .unwrap_or_else(|| self.default.clone())
    }
}
