//! Error types for the research pipeline.
//!
//! Each layer has its own enum: the search provider reports [`ProviderError`],
//! the language-model roles report [`AgentError`], and the orchestrator folds
//! everything that ends a run into a single [`PipelineError`].

use enum_as_inner::EnumAsInner;
use std::fmt;
use thiserror::Error;

/// Failures raised by a search provider.
#[derive(Debug, Clone, Error, EnumAsInner)]
pub enum ProviderError {
    /// Missing or rejected credential. Recurs for every query.
    #[error("search provider rejected the configured credential: {0}")]
    Auth(String),

    /// Network failure, timeout, rate limit or 5xx.
    #[error("transient search failure: {0}")]
    Transient(String),

    /// The provider answered, but not in a shape we understand.
    #[error("malformed search response: {0}")]
    Malformed(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

/// Failures raised by a language-model role.
#[derive(Debug, Clone, Error, EnumAsInner)]
pub enum AgentError {
    #[error("language model backend unreachable: {0}")]
    Unreachable(String),

    #[error("language model call timed out after {0}s")]
    Timeout(u64),

    #[error("language model returned unusable output: {0}")]
    Malformed(String),
}

impl AgentError {
    /// Timeouts and malformed output get another attempt; an unreachable
    /// backend will stay unreachable for the rest of the run.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AgentError::Timeout(_) | AgentError::Malformed(_))
    }
}

/// Why a pipeline run ended in the FAILED state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidTopic,
    ConfigError,
    PlanningFailed,
    WritingFailed,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidTopic => "invalid topic",
            ErrorKind::ConfigError => "configuration error",
            ErrorKind::PlanningFailed => "planning failed",
            ErrorKind::WritingFailed => "writing failed",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// The one error type that crosses the pipeline boundary.
///
/// `Display` renders only the user-facing message. The underlying cause is
/// kept in `source` for diagnostic logging and is never part of that text.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct PipelineError {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl PipelineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Text that is safe to show verbatim in a UI or return from a tool call.
    pub fn user_message(&self) -> &str {
        &self.message
    }

    /// Full cause chain, for logs only.
    pub fn diagnostic(&self) -> String {
        let mut out = format!("{} ({})", self.message, self.kind);
        let mut cause = std::error::Error::source(self);
        while let Some(err) = cause {
            out.push_str(": ");
            out.push_str(&err.to_string());
            cause = err.source();
        }
        out
    }

    pub fn missing_credential(var: &str) -> Self {
        Self::new(
            ErrorKind::ConfigError,
            format!("{var} not found in environment variables."),
        )
    }

    pub fn invalid_topic() -> Self {
        Self::new(ErrorKind::InvalidTopic, "Please provide a research topic.")
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "Research was cancelled.")
    }

    pub fn planning(err: AgentError) -> Self {
        Self::new(
            ErrorKind::PlanningFailed,
            "Could not plan search queries for this topic. Please try again later.",
        )
        .with_source(err)
    }

    pub fn writing(err: AgentError) -> Self {
        Self::new(
            ErrorKind::WritingFailed,
            "Could not write the research report. Please try again later.",
        )
        .with_source(err)
    }

    pub fn provider_config(err: ProviderError) -> Self {
        Self::new(
            ErrorKind::ConfigError,
            "The search provider rejected the configured API key. Check your search configuration.",
        )
        .with_source(err)
    }
}
