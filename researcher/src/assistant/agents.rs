//! The two language-model roles of a run.
//!
//! Both implement [`Agent`], so the orchestrator can be driven by the real
//! [`Planner`] / [`Writer`] or by deterministic stand-ins.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::error::AgentError;
use super::llm::LanguageModel;
use super::prompts::{
    format_no_evidence_instructions, format_query_writer_instructions,
    format_report_writer_instructions, format_strict_grounding_reminder, STRICT_JSON_REMINDER,
    STRICT_REPORT_REMINDER,
};
use super::retry::RetryPolicy;
use super::state::{Topic, WriterInput};
use super::utils::{format_evidence, strip_think_tags, strip_ungrounded_urls, ungrounded_urls};

/// Longest query the planner may hand to the search provider.
const MAX_QUERY_CHARS: usize = 400;
const MAX_SNIPPET_CHARS: usize = 1500;

#[async_trait]
pub trait Agent: Send + Sync {
    type Input: Send + Sync;
    type Output: Send;

    async fn act(&self, input: &Self::Input) -> Result<Self::Output, AgentError>;
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PlannerReply {
    Many { queries: Vec<Value> },
    One { query: Value },
}

/// Turns a topic into search queries. May return an empty list when the
/// model answers with nothing usable; the orchestrator falls back to the
/// topic itself.
#[derive(Clone)]
pub struct Planner<M> {
    model: M,
    max_queries: usize,
    retry: RetryPolicy,
}

impl<M: LanguageModel> Planner<M> {
    pub fn new(model: M, max_queries: usize, retry: RetryPolicy) -> Self {
        Self {
            model,
            max_queries: max_queries.max(1),
            retry,
        }
    }
}

#[async_trait]
impl<M: LanguageModel> Agent for Planner<M> {
    type Input = Topic;
    type Output = Vec<String>;

    async fn act(&self, topic: &Topic) -> Result<Vec<String>, AgentError> {
        self.retry
            .run("planner", AgentError::is_retryable, |attempt| async move {
                let mut prompt = format_query_writer_instructions(topic.as_str(), self.max_queries);
                if attempt > 0 {
                    prompt.push_str(STRICT_JSON_REMINDER);
                }
                let response = self.model.generate(&prompt).await?;
                let queries = parse_queries(&strip_think_tags(&response))?;
                debug!(?queries, "Planner produced queries");
                Ok(clean_queries(queries, self.max_queries))
            })
            .await
    }
}

/// Pull the JSON object out of a model reply, tolerating prose or code
/// fences around it.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn parse_queries(text: &str) -> Result<Vec<String>, AgentError> {
    let json = extract_json_object(text)
        .ok_or_else(|| AgentError::Malformed("planner reply contains no JSON object".into()))?;
    let reply: PlannerReply = serde_json::from_str(json)
        .map_err(|e| AgentError::Malformed(format!("planner reply is not valid JSON: {e}")))?;

    let values = match reply {
        PlannerReply::Many { queries } => queries,
        PlannerReply::One { query } => vec![query],
    };
    Ok(values
        .into_iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect())
}

/// Trim, drop blanks and oversized entries, dedupe case-insensitively, cap.
fn clean_queries(raw: Vec<String>, max_queries: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    raw.into_iter()
        .map(|q| q.trim().trim_matches('"').trim().to_string())
        .filter(|q| !q.is_empty() && q.chars().count() <= MAX_QUERY_CHARS)
        .filter(|q| seen.insert(q.to_lowercase()))
        .take(max_queries)
        .collect()
}

/// Writes the report body from the topic and evidence. The returned text
/// never cites a URL outside the evidence set.
#[derive(Clone)]
pub struct Writer<M> {
    model: M,
    retry: RetryPolicy,
}

impl<M: LanguageModel> Writer<M> {
    pub fn new(model: M, retry: RetryPolicy) -> Self {
        Self { model, retry }
    }
}

#[async_trait]
impl<M: LanguageModel> Agent for Writer<M> {
    type Input = WriterInput;
    type Output = String;

    async fn act(&self, input: &WriterInput) -> Result<String, AgentError> {
        let base_prompt = if input.evidence.is_empty() {
            format_no_evidence_instructions(input.topic.as_str())
        } else {
            format_report_writer_instructions(
                input.topic.as_str(),
                &format_evidence(&input.evidence, MAX_SNIPPET_CHARS),
            )
        };
        let max_retries = self.retry.max_retries;
        let base_prompt = &base_prompt;
        let evidence = &input.evidence;
        // URLs the previous attempt invented, quoted back in the retry prompt.
        let previous_ungrounded = Mutex::new(Vec::<String>::new());
        let previous_ungrounded = &previous_ungrounded;

        self.retry
            .run("writer", AgentError::is_retryable, |attempt| async move {
                let mut prompt = base_prompt.clone();
                if attempt > 0 {
                    let previous = previous_ungrounded.lock().await;
                    if previous.is_empty() {
                        prompt.push_str(STRICT_REPORT_REMINDER);
                    } else {
                        prompt.push_str(&format_strict_grounding_reminder(&previous));
                    }
                }

                let body = strip_think_tags(&self.model.generate(&prompt).await?);
                if body.is_empty() {
                    previous_ungrounded.lock().await.clear();
                    return Err(AgentError::Malformed("writer returned an empty report".into()));
                }

                let ungrounded = ungrounded_urls(&body, evidence);
                if ungrounded.is_empty() {
                    return Ok(body);
                }
                if attempt < max_retries {
                    let err = AgentError::Malformed(format!(
                        "writer cited {} URL(s) outside the evidence",
                        ungrounded.len()
                    ));
                    *previous_ungrounded.lock().await = ungrounded;
                    return Err(err);
                }
                warn!(?ungrounded, "Removing citations outside the evidence set");
                Ok(strip_ungrounded_urls(&body, evidence))
            })
            .await
    }
}
