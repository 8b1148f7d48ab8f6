//! Text-completion collaborator.
//!
//! Every component in this crate talks to the model through the
//! [`TextCompletion`] trait so tests can script replies and callers can plug
//! in any provider. [`complete_within`] enforces the caller-supplied timeout.

use async_trait::async_trait;
use claude::Claude;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Default per-call timeout when a component is not configured otherwise.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Errors surfaced by a completion provider.
#[derive(Debug, Clone, Error)]
pub enum CompletionError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("completion timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("completion failed: {0}")]
    Other(String),
}

/// Who authored a prompt message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptRole {
    User,
    Assistant,
}

/// One message in a completion request.
#[derive(Debug, Clone)]
pub struct PromptMessage {
    pub role: PromptRole,
    pub content: String,
}

impl PromptMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::Assistant,
            content: content.into(),
        }
    }
}

/// A provider-neutral completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub messages: Vec<PromptMessage>,
    pub temperature: f32,
    pub max_tokens: Option<usize>,
    pub timeout: Duration,
}

impl CompletionRequest {
    /// Create a single-turn request from a user prompt.
    pub fn prompt(text: impl Into<String>) -> Self {
        Self {
            system: None,
            messages: vec![PromptMessage::user(text)],
            temperature: 0.7,
            max_tokens: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The last user message, which carries the task prompt.
    pub fn user_prompt(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == PromptRole::User)
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }
}

/// Raw text returned by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    /// Generation stopped at the token limit.
    pub truncated: bool,
}

impl Completion {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            truncated: false,
        }
    }
}

/// A text-completion service.
#[async_trait]
pub trait TextCompletion: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, CompletionError>;
}

#[async_trait]
impl<T: TextCompletion + ?Sized> TextCompletion for std::sync::Arc<T> {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, CompletionError> {
        (**self).complete(request).await
    }
}

/// Run a completion under the request's timeout.
pub async fn complete_within<C>(
    service: &C,
    request: CompletionRequest,
) -> Result<Completion, CompletionError>
where
    C: TextCompletion + ?Sized,
{
    let timeout = request.timeout;
    match tokio::time::timeout(timeout, service.complete(request)).await {
        Ok(result) => result,
        Err(_) => {
            debug!(?timeout, "completion call exceeded its timeout");
            Err(CompletionError::Timeout(timeout))
        }
    }
}

impl From<claude::Error> for CompletionError {
    fn from(err: claude::Error) -> Self {
        match err {
            claude::Error::NoApiKey => CompletionError::Auth("API key not configured".into()),
            claude::Error::Unauthorized { message, .. } => CompletionError::Auth(message),
            claude::Error::RateLimited { message, .. } => CompletionError::RateLimited(message),
            claude::Error::Timeout => CompletionError::Timeout(DEFAULT_TIMEOUT),
            claude::Error::Server { status, message } => {
                CompletionError::Server(format!("{status}: {message}"))
            }
            claude::Error::Parse(message) => CompletionError::MalformedResponse(message),
            other => CompletionError::Other(other.to_string()),
        }
    }
}

#[async_trait]
impl TextCompletion for Claude {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, CompletionError> {
        let messages = request
            .messages
            .iter()
            .map(|m| match m.role {
                PromptRole::User => claude::Message::user(&m.content),
                PromptRole::Assistant => claude::Message::assistant(&m.content),
            })
            .collect();

        let mut api_request = claude::Request::new(messages)
            .with_temperature(request.temperature)
            .with_timeout(request.timeout);
        if let Some(system) = &request.system {
            api_request = api_request.with_system(system);
        }
        if let Some(max_tokens) = request.max_tokens {
            api_request = api_request.with_max_tokens(max_tokens);
        }

        let response = Claude::complete(self, api_request).await.map_err(|e| match e {
            claude::Error::Timeout => CompletionError::Timeout(request.timeout),
            other => other.into(),
        })?;

        Ok(Completion {
            truncated: response.hit_token_limit(),
            text: response.text(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Slow;

    #[async_trait]
    impl TextCompletion for Slow {
        async fn complete(&self, _: CompletionRequest) -> Result<Completion, CompletionError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Completion::new("late"))
        }
    }

    #[tokio::test]
    async fn test_timeout_is_enforced() {
        let request = CompletionRequest::prompt("hi").with_timeout(Duration::from_millis(20));
        let err = complete_within(&Slow, request).await.unwrap_err();
        assert!(matches!(err, CompletionError::Timeout(d) if d == Duration::from_millis(20)));
    }

    #[test]
    fn test_claude_error_mapping() {
        let err: CompletionError = claude::Error::RateLimited {
            retry_after_secs: None,
            message: "slow down".into(),
        }
        .into();
        assert!(matches!(err, CompletionError::RateLimited(_)));

        let err: CompletionError = claude::Error::Parse("eof".into()).into();
        assert!(matches!(err, CompletionError::MalformedResponse(_)));

        let err: CompletionError = claude::Error::NoApiKey.into();
        assert!(matches!(err, CompletionError::Auth(_)));
    }

    #[test]
    fn test_user_prompt() {
        let request = CompletionRequest::prompt("check this").with_system("editor");
        assert_eq!(request.user_prompt(), "check this");
    }
}
