use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast::Sender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::agents::{Agent, Planner, Writer};
use super::configuration::Configuration;
use super::error::{PipelineError, ProviderError};
use super::llm::{Backend, GatedModel};
use super::retry::RetryPolicy;
use super::search::{SearchProvider, WebSearch};
use super::state::{Phase, ResearchReport, SearchResult, StatusUpdate, Topic, WriterInput};
use super::utils::{aggregate, format_sources, interleave_by_rank};

/// Knobs the orchestrator reads on every run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub max_results: usize,
    pub evidence_cap: usize,
    pub search_concurrency: usize,
    pub search_timeout: Duration,
    pub search_retry: RetryPolicy,
}

impl RunSettings {
    pub fn from_config(config: &Configuration) -> Self {
        Self {
            max_results: config.max_results(),
            evidence_cap: config.evidence_cap,
            search_concurrency: config.search_concurrency.max(1),
            search_timeout: config.search_timeout(),
            search_retry: config.search_retry.clone(),
        }
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        Self::from_config(&Configuration::default())
    }
}

/// The planner wired to the configured model backend.
pub type DefaultPlanner = Planner<GatedModel<Backend>>;
/// The writer wired to the configured model backend.
pub type DefaultWriter = Writer<GatedModel<Backend>>;

/// Drives one topic through PLANNING → SEARCHING → AGGREGATING → WRITING.
///
/// A graph holds only read-only collaborators, so one instance can serve any
/// number of concurrent runs. Each run keeps its own queries and evidence on
/// the stack and drops them when it returns.
pub struct ResearchGraph<S = WebSearch, P = DefaultPlanner, W = DefaultWriter> {
    search: S,
    planner: P,
    writer: W,
    settings: RunSettings,
}

impl ResearchGraph {
    /// Wire the real search client and model backend from configuration.
    pub fn from_config(config: &Configuration) -> Result<Self, PipelineError> {
        let model = GatedModel::new(
            Backend::from_config(config)?,
            config.model_concurrency(),
            config.model_timeout(),
        );
        Ok(Self::new(
            WebSearch::from_config(config),
            Planner::new(model.clone(), config.max_queries, config.agent_retry.clone()),
            Writer::new(model, config.agent_retry.clone()),
            RunSettings::from_config(config),
        ))
    }
}

impl<S, P, W> ResearchGraph<S, P, W>
where
    S: SearchProvider,
    P: Agent<Input = Topic, Output = Vec<String>>,
    W: Agent<Input = WriterInput, Output = String>,
{
    pub fn new(search: S, planner: P, writer: W, settings: RunSettings) -> Self {
        Self {
            search,
            planner,
            writer,
            settings,
        }
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Fails with the "missing configuration" error when the search
    /// credential is absent. Issues no network call.
    pub fn check_credentials(&self) -> Result<(), PipelineError> {
        if self.search.is_configured() {
            Ok(())
        } else {
            Err(PipelineError::missing_credential(self.search.credential_var()))
        }
    }

    /// Run the pipeline and return the rendered report text.
    pub async fn run_research(&self, topic: &str) -> Result<String, PipelineError> {
        self.run(topic).await.map(|report| report.render())
    }

    pub async fn run(&self, topic: &str) -> Result<ResearchReport, PipelineError> {
        self.run_inner(topic, None).await
    }

    /// Like [`run`](Self::run), publishing a [`StatusUpdate`] at every phase.
    pub async fn run_observed(
        &self,
        topic: &str,
        status_tx: &Sender<StatusUpdate>,
    ) -> Result<ResearchReport, PipelineError> {
        self.run_inner(topic, Some(status_tx)).await
    }

    /// Like [`run`](Self::run), abandoning all in-flight calls as soon as
    /// `token` is cancelled.
    pub async fn run_with_cancel(
        &self,
        topic: &str,
        token: CancellationToken,
    ) -> Result<ResearchReport, PipelineError> {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!("Research run cancelled");
                Err(PipelineError::cancelled())
            }
            result = self.run(topic) => result,
        }
    }

    async fn run_inner(
        &self,
        raw_topic: &str,
        status_tx: Option<&Sender<StatusUpdate>>,
    ) -> Result<ResearchReport, PipelineError> {
        let run = RunStatus {
            started: Instant::now(),
            tx: status_tx,
        };

        let result = self
            .start(raw_topic, &run)
            .instrument(info_span!("research", topic = %raw_topic.trim()))
            .await;

        match &result {
            Ok(report) => {
                info!(
                    sources = report.sources.len(),
                    low_confidence = report.low_confidence,
                    elapsed_ms = run.elapsed_ms(),
                    "Research complete"
                );
                run.send(Phase::Done, "Research complete", None);
            }
            Err(e) => {
                error!(kind = %e.kind(), diagnostic = %e.diagnostic(), "Research failed");
                run.send(Phase::Failed, e.user_message(), None);
            }
        }
        result
    }

    /// Validate the input and the search credential before any network call.
    async fn start(
        &self,
        raw_topic: &str,
        run: &RunStatus<'_>,
    ) -> Result<ResearchReport, PipelineError> {
        let topic = Topic::parse(raw_topic)?;
        self.check_credentials()?;
        self.execute(&topic, run).await
    }

    async fn execute(
        &self,
        topic: &Topic,
        run: &RunStatus<'_>,
    ) -> Result<ResearchReport, PipelineError> {
        run.send(Phase::Planning, "Planning search queries", None);
        let mut queries = self.planner.act(topic).await.map_err(PipelineError::planning)?;
        if queries.is_empty() {
            warn!("Planner produced no usable queries, searching for the topic itself");
            queries = vec![topic.as_str().to_string()];
        }
        info!(?queries, "Planned search queries");

        run.send(
            Phase::Searching,
            &format!("Searching the web with {} queries", queries.len()),
            Some(queries.join("\n")),
        );
        let per_query = self.search_all(&queries).await?;

        run.send(Phase::Aggregating, "Aggregating evidence", None);
        let evidence = aggregate(interleave_by_rank(per_query), self.settings.evidence_cap);
        let low_confidence = evidence.is_empty();
        if low_confidence {
            warn!("No evidence retrieved, writing a low-confidence report");
        } else {
            debug!(sources = %format_sources(&evidence), "Evidence set");
        }

        run.send(
            Phase::Writing,
            &format!("Writing report from {} sources", evidence.len()),
            Some(format_sources(&evidence)),
        );
        let input = WriterInput {
            topic: topic.clone(),
            evidence,
        };
        let body = self.writer.act(&input).await.map_err(PipelineError::writing)?;

        Ok(ResearchReport {
            topic: input.topic,
            body,
            sources: input.evidence.items().to_vec(),
            queries,
            low_confidence,
        })
    }

    /// Fan out over the queries with bounded concurrency, keeping query
    /// order. The first credential failure cancels the remaining searches.
    async fn search_all(
        &self,
        queries: &[String],
    ) -> Result<Vec<Vec<SearchResult>>, PipelineError> {
        let pending: Vec<_> = queries.iter().map(|query| self.search_one(query)).collect();
        stream::iter(pending)
            .buffered(self.settings.search_concurrency)
            .try_collect()
            .await
    }

    async fn search_one(&self, query: &str) -> Result<Vec<SearchResult>, PipelineError> {
        let timeout = self.settings.search_timeout;
        let max_results = self.settings.max_results;
        let result = self
            .settings
            .search_retry
            .run("search", ProviderError::is_retryable, |_| async move {
                match tokio::time::timeout(timeout, self.search.search(query, max_results)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Transient(format!(
                        "search timed out after {}s",
                        timeout.as_secs()
                    ))),
                }
            })
            .await;

        match result {
            Ok(results) => {
                debug!(query, hits = results.len(), "Search finished");
                Ok(results)
            }
            Err(ProviderError::Auth(detail)) => {
                Err(PipelineError::provider_config(ProviderError::Auth(detail)))
            }
            Err(e) => {
                warn!(query, error = %e, "Search failed, continuing without its results");
                Ok(Vec::new())
            }
        }
    }
}

/// What the UI and tool-server shells need from a pipeline.
#[async_trait]
pub trait ResearchService: Send + Sync + 'static {
    fn check_credentials(&self) -> Result<(), PipelineError>;

    async fn research(
        &self,
        topic: &str,
        status_tx: Option<&Sender<StatusUpdate>>,
    ) -> Result<ResearchReport, PipelineError>;
}

#[async_trait]
impl<S, P, W> ResearchService for ResearchGraph<S, P, W>
where
    S: SearchProvider + 'static,
    P: Agent<Input = Topic, Output = Vec<String>> + 'static,
    W: Agent<Input = WriterInput, Output = String> + 'static,
{
    fn check_credentials(&self) -> Result<(), PipelineError> {
        ResearchGraph::check_credentials(self)
    }

    async fn research(
        &self,
        topic: &str,
        status_tx: Option<&Sender<StatusUpdate>>,
    ) -> Result<ResearchReport, PipelineError> {
        self.run_inner(topic, status_tx).await
    }
}

/// Progress publisher for a single run.
struct RunStatus<'a> {
    started: Instant,
    tx: Option<&'a Sender<StatusUpdate>>,
}

impl RunStatus<'_> {
    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn send(&self, phase: Phase, message: &str, detail: Option<String>) {
        info!(phase = %phase, "{}", message);
        let Some(tx) = self.tx else {
            return;
        };

        let status = StatusUpdate {
            phase,
            message: message.to_string(),
            elapsed_ms: self.elapsed_ms(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            detail,
        };

        // No subscribers is fine; progress is best effort.
        if let Err(e) = tx.send(status) {
            debug!(phase = %phase, error = %e, "Status update dropped");
        }
    }
}
