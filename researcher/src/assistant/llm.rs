//! Language-model backends used by the planner and writer roles.

use async_trait::async_trait;
use ollama_rs::generation::completion::request::GenerationRequest;
use ollama_rs::Ollama;
use reqwest::Client;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

use super::configuration::{Configuration, ResearchMode};
use super::error::{AgentError, PipelineError};

const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// One prompt in, one completion out.
    async fn generate(&self, prompt: &str) -> Result<String, AgentError>;
}

/// Local model served by Ollama.
#[derive(Clone)]
pub struct OllamaModel {
    ollama: Ollama,
    model: String,
}

impl OllamaModel {
    pub fn new(host: impl Into<String>, port: u16, model: impl Into<String>) -> Self {
        Self {
            ollama: Ollama::new(host.into(), port),
            model: model.into(),
        }
    }
}

#[async_trait]
impl LanguageModel for OllamaModel {
    async fn generate(&self, prompt: &str) -> Result<String, AgentError> {
        debug!(model = %self.model, "Ollama generate");
        let request = GenerationRequest::new(self.model.clone(), prompt.to_string());
        self.ollama
            .generate(request)
            .await
            .map(|response| response.response)
            .map_err(|e| AgentError::Unreachable(format!("Ollama request failed: {}", e)))
    }
}

/// Hosted model behind Groq's OpenAI-compatible chat API.
#[derive(Clone)]
pub struct GroqClient {
    api_key: String,
    model: String,
    base_url: String,
    client: Client,
}

impl GroqClient {
    pub fn new(api_key: String, model: impl Into<String>) -> Self {
        Self::with_base_url(api_key, model, GROQ_BASE_URL)
    }

    pub fn with_base_url(
        api_key: String,
        model: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            api_key,
            model: model.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl LanguageModel for GroqClient {
    async fn generate(&self, prompt: &str) -> Result<String, AgentError> {
        debug!(model = %self.model, "Groq generate");
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&json!({
                "model": self.model,
                "messages": [
                    {
                        "role": "user",
                        "content": prompt
                    }
                ],
                "temperature": 0.7,
                "max_tokens": 2048
            }))
            .send()
            .await
            .map_err(|e| AgentError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::Unreachable(format!("Groq returned HTTP {}", status.as_u16())));
        }

        let data = response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| AgentError::Malformed(e.to_string()))?;

        Ok(data["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| AgentError::Malformed("Failed to get content from response".into()))?
            .to_string())
    }
}

/// Backend selected by [`ResearchMode`].
#[derive(Clone)]
pub enum Backend {
    Ollama(OllamaModel),
    Groq(GroqClient),
}

impl Backend {
    /// Fails when remote mode is selected without a Groq key.
    pub fn from_config(config: &Configuration) -> Result<Self, PipelineError> {
        match config.research_mode {
            ResearchMode::Remote => {
                let key = config
                    .groq_api_key
                    .clone()
                    .ok_or_else(|| PipelineError::missing_credential("GROQ_API_KEY"))?;
                let client = match &config.groq_base_url {
                    Some(base) => GroqClient::with_base_url(key, &config.groq_model, base),
                    None => GroqClient::new(key, &config.groq_model),
                };
                Ok(Backend::Groq(client))
            }
            ResearchMode::Local => Ok(Backend::Ollama(OllamaModel::new(
                &config.ollama_host,
                config.ollama_port,
                &config.local_llm,
            ))),
        }
    }
}

#[async_trait]
impl LanguageModel for Backend {
    async fn generate(&self, prompt: &str) -> Result<String, AgentError> {
        match self {
            Backend::Ollama(m) => m.generate(prompt).await,
            Backend::Groq(m) => m.generate(prompt).await,
        }
    }
}

/// Wraps a backend with a per-call timeout and a shared concurrency limit.
///
/// Clones share the same permits, so every run built from one gate queues
/// behind the same limit.
#[derive(Clone)]
pub struct GatedModel<M> {
    inner: M,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl<M: LanguageModel> GatedModel<M> {
    pub fn new(inner: M, max_concurrent: usize, timeout: Duration) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            timeout,
        }
    }
}

#[async_trait]
impl<M: LanguageModel> LanguageModel for GatedModel<M> {
    async fn generate(&self, prompt: &str) -> Result<String, AgentError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| AgentError::Unreachable("model gate closed".into()))?;
        match tokio::time::timeout(self.timeout, self.inner.generate(prompt)).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout(self.timeout.as_secs())),
        }
    }
}
