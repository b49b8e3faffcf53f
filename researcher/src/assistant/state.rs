use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::PipelineError;
use super::utils::defang_urls;

/// A research question. Never empty after trimming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Topic(String);

impl Topic {
    pub fn parse(raw: &str) -> Result<Self, PipelineError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PipelineError::invalid_topic());
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One web-search hit. `source_rank` is the provider's position for the
/// query that produced it, starting at 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub source_rank: usize,
}

impl SearchResult {
    pub fn new(
        title: impl Into<String>,
        url: impl Into<String>,
        snippet: impl Into<String>,
        source_rank: usize,
    ) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            snippet: snippet.into(),
            source_rank,
        }
    }
}

/// Deduplicated, capped, rank-ordered results used to ground the report.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvidenceSet {
    items: Vec<SearchResult>,
}

impl EvidenceSet {
    pub(crate) fn from_items(items: Vec<SearchResult>) -> Self {
        Self { items }
    }

    pub fn items(&self) -> &[SearchResult] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn urls(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(|item| item.url.as_str())
    }
}

/// Input handed to the writer role.
#[derive(Debug, Clone)]
pub struct WriterInput {
    pub topic: Topic,
    pub evidence: EvidenceSet,
}

/// The finished output of one run.
#[derive(Debug, Clone, Serialize)]
pub struct ResearchReport {
    pub topic: Topic,
    pub body: String,
    pub sources: Vec<SearchResult>,
    pub queries: Vec<String>,
    /// Set when no evidence was retrieved and the body rests on the model alone.
    pub low_confidence: bool,
}

pub const LOW_CONFIDENCE_NOTICE: &str = "> **Low confidence:** no web sources could be retrieved for this topic. \
The findings below were not checked against live search results and may be incomplete or out of date.";

impl ResearchReport {
    /// Final text handed to the caller. Only evidence URLs appear as links;
    /// any URL in the topic or a source title is rendered without its scheme.
    pub fn render(&self) -> String {
        let mut out = format!("## {}\n\n", defang_urls(self.topic.as_str()));
        if self.low_confidence {
            out.push_str(LOW_CONFIDENCE_NOTICE);
            out.push_str("\n\n");
        }
        out.push_str(self.body.trim());
        if !self.sources.is_empty() {
            out.push_str("\n\n### Sources:\n");
            for (i, source) in self.sources.iter().enumerate() {
                out.push_str(&format!(
                    "{}. {} : {}\n",
                    i + 1,
                    defang_urls(&source.title),
                    source.url
                ));
            }
        }
        out.trim_end().to_string()
    }
}

/// Pipeline state machine. FAILED is reachable from every state but DONE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    Searching,
    Aggregating,
    Writing,
    Done,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Planning => "planning",
            Phase::Searching => "searching",
            Phase::Aggregating => "aggregating",
            Phase::Writing => "writing",
            Phase::Done => "done",
            Phase::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done | Phase::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusUpdate {
    pub phase: Phase,
    pub message: String,
    pub elapsed_ms: u64,
    pub timestamp: u64,
    pub detail: Option<String>,
}
