use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use super::error::PipelineError;
use super::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum SearchAPI {
    #[serde(rename = "linkup")]
    Linkup,
    #[serde(rename = "perplexity")]
    Perplexity,
}

impl SearchAPI {
    /// Environment variable that holds the credential for this provider.
    pub fn key_var(&self) -> &'static str {
        match self {
            SearchAPI::Linkup => "LINKUP_API_KEY",
            SearchAPI::Perplexity => "PERPLEXITY_API_KEY",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            SearchAPI::Linkup => "https://api.linkup.so",
            SearchAPI::Perplexity => "https://api.perplexity.ai",
        }
    }
}

impl Default for SearchAPI {
    fn default() -> Self {
        SearchAPI::Linkup
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum ResearchMode {
    #[serde(rename = "local")]
    Local,
    #[serde(rename = "remote")]
    Remote,
}

impl Default for ResearchMode {
    fn default() -> Self {
        ResearchMode::Local
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub search_api: SearchAPI,
    /// `None` when the credential is absent; checked before any network call.
    #[serde(default)]
    pub search_api_key: Option<String>,
    #[serde(default)]
    pub search_base_url: Option<String>,
    #[serde(default)]
    pub research_mode: ResearchMode,
    #[serde(default = "default_local_llm")]
    pub local_llm: String,
    #[serde(default = "default_ollama_host")]
    pub ollama_host: String,
    #[serde(default = "default_ollama_port")]
    pub ollama_port: u16,
    pub groq_api_key: Option<String>,
    #[serde(default = "default_groq_model")]
    pub groq_model: String,
    #[serde(default)]
    pub groq_base_url: Option<String>,
    #[serde(default = "default_max_queries")]
    pub max_queries: usize,
    #[serde(default = "default_max_results_per_query")]
    pub max_results_per_query: usize,
    #[serde(default = "default_evidence_cap")]
    pub evidence_cap: usize,
    #[serde(default = "default_search_concurrency")]
    pub search_concurrency: usize,
    #[serde(default)]
    pub model_concurrency: Option<usize>,
    #[serde(default = "default_search_timeout_secs")]
    pub search_timeout_secs: u64,
    #[serde(default = "default_model_timeout_secs")]
    pub model_timeout_secs: u64,
    #[serde(default = "RetryPolicy::search_default")]
    pub search_retry: RetryPolicy,
    #[serde(default = "RetryPolicy::agent_default")]
    pub agent_retry: RetryPolicy,
    /// Extra directory searched for the PDF export fonts.
    #[serde(default)]
    pub pdf_font_dir: Option<String>,
}

/// Upper bound on results requested per query.
pub const MAX_RESULTS_LIMIT: usize = 10;

fn default_local_llm() -> String {
    "deepseek-r1:8b".to_string()
}

fn default_ollama_host() -> String {
    "http://localhost".to_string()
}

fn default_ollama_port() -> u16 {
    11434
}

fn default_groq_model() -> String {
    "mixtral-8x7b-32768".to_string()
}

fn default_max_queries() -> usize {
    3
}

fn default_max_results_per_query() -> usize {
    5
}

fn default_evidence_cap() -> usize {
    8
}

fn default_search_concurrency() -> usize {
    2
}

fn default_search_timeout_secs() -> u64 {
    20
}

fn default_model_timeout_secs() -> u64 {
    120
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            search_api: SearchAPI::default(),
            search_api_key: None,
            search_base_url: None,
            research_mode: ResearchMode::default(),
            local_llm: default_local_llm(),
            ollama_host: default_ollama_host(),
            ollama_port: default_ollama_port(),
            groq_api_key: None,
            groq_model: default_groq_model(),
            groq_base_url: None,
            max_queries: default_max_queries(),
            max_results_per_query: default_max_results_per_query(),
            evidence_cap: default_evidence_cap(),
            search_concurrency: default_search_concurrency(),
            model_concurrency: None,
            search_timeout_secs: default_search_timeout_secs(),
            model_timeout_secs: default_model_timeout_secs(),
            search_retry: RetryPolicy::search_default(),
            agent_retry: RetryPolicy::agent_default(),
            pdf_font_dir: None,
        }
    }
}

impl Configuration {
    /// Load `.env` and read the configuration from the process environment.
    pub fn from_env() -> Result<Self, PipelineError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from any key/value source. Blank values count
    /// as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, PipelineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        for var in [
            "SEARCH_API",
            "LINKUP_API_KEY",
            "PERPLEXITY_API_KEY",
            "RESEARCH_MODE",
            "LOCAL_LLM",
            "GROQ_API_KEY",
            "GROQ_MODEL",
        ] {
            match get(var) {
                Some(_) if var.contains("KEY") => debug!(var, value = "***", "Found env var"),
                Some(value) => debug!(var, value = %value, "Found env var"),
                None => debug!(var, "Env var not set"),
            }
        }

        let defaults = Self::default();

        let search_api = match get("SEARCH_API").as_deref() {
            Some("perplexity") => SearchAPI::Perplexity,
            Some("linkup") | None => SearchAPI::Linkup,
            Some(other) => {
                warn!(value = other, "Unknown SEARCH_API, using linkup");
                SearchAPI::Linkup
            }
        };

        let research_mode = match get("RESEARCH_MODE").as_deref() {
            Some("remote") => ResearchMode::Remote,
            _ => ResearchMode::Local,
        };

        let groq_api_key = get("GROQ_API_KEY");
        if research_mode == ResearchMode::Remote && groq_api_key.is_none() {
            return Err(PipelineError::missing_credential("GROQ_API_KEY"));
        }

        Ok(Configuration {
            search_api,
            search_api_key: get(search_api.key_var()),
            search_base_url: get("SEARCH_BASE_URL"),
            research_mode,
            local_llm: get("LOCAL_LLM").unwrap_or(defaults.local_llm),
            ollama_host: get("OLLAMA_HOST").unwrap_or(defaults.ollama_host),
            ollama_port: parse_or("OLLAMA_PORT", get("OLLAMA_PORT"), defaults.ollama_port),
            groq_api_key,
            groq_model: get("GROQ_MODEL").unwrap_or(defaults.groq_model),
            groq_base_url: get("GROQ_BASE_URL"),
            max_queries: parse_or("MAX_QUERIES", get("MAX_QUERIES"), defaults.max_queries),
            max_results_per_query: parse_or(
                "MAX_RESULTS",
                get("MAX_RESULTS"),
                defaults.max_results_per_query,
            ),
            evidence_cap: parse_or("EVIDENCE_CAP", get("EVIDENCE_CAP"), defaults.evidence_cap),
            search_concurrency: parse_or(
                "SEARCH_CONCURRENCY",
                get("SEARCH_CONCURRENCY"),
                defaults.search_concurrency,
            ),
            model_concurrency: get("MODEL_CONCURRENCY").and_then(|v| v.parse().ok()),
            search_timeout_secs: parse_or(
                "SEARCH_TIMEOUT_SECS",
                get("SEARCH_TIMEOUT_SECS"),
                defaults.search_timeout_secs,
            ),
            model_timeout_secs: parse_or(
                "MODEL_TIMEOUT_SECS",
                get("MODEL_TIMEOUT_SECS"),
                defaults.model_timeout_secs,
            ),
            search_retry: defaults.search_retry,
            agent_retry: defaults.agent_retry,
            pdf_font_dir: get("PDF_FONT_DIR"),
        })
    }

    pub fn has_search_credential(&self) -> bool {
        self.search_api_key.is_some()
    }

    /// Fails with the user-facing "missing configuration" error when the
    /// search credential is absent.
    pub fn require_search_credential(&self) -> Result<&str, PipelineError> {
        self.search_api_key
            .as_deref()
            .ok_or_else(|| PipelineError::missing_credential(self.search_api.key_var()))
    }

    pub fn search_base_url(&self) -> &str {
        self.search_base_url
            .as_deref()
            .unwrap_or_else(|| self.search_api.default_base_url())
    }

    pub fn max_results(&self) -> usize {
        self.max_results_per_query.clamp(1, MAX_RESULTS_LIMIT)
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.search_timeout_secs)
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model_timeout_secs)
    }

    /// Simultaneous model calls allowed across all runs. A local backend
    /// serves one request at a time.
    pub fn model_concurrency(&self) -> usize {
        let default = match self.research_mode {
            ResearchMode::Local => 1,
            ResearchMode::Remote => 4,
        };
        self.model_concurrency.unwrap_or(default).max(1)
    }

    pub fn model_name(&self) -> &str {
        match self.research_mode {
            ResearchMode::Local => &self.local_llm,
            ResearchMode::Remote => &self.groq_model,
        }
    }
}

fn parse_or<T: FromStr + Copy>(var: &str, value: Option<String>, default: T) -> T {
    match value {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(var, value = %raw, "Could not parse env var, using default");
            default
        }),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assistant::error::ErrorKind;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_from_empty_environment() {
        let config = Configuration::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.search_api, SearchAPI::Linkup);
        assert_eq!(config.research_mode, ResearchMode::Local);
        assert_eq!(config.local_llm, "deepseek-r1:8b");
        assert!(!config.has_search_credential());
        assert_eq!(config.max_queries, 3);
        assert_eq!(config.evidence_cap, 8);
        assert_eq!(config.model_concurrency(), 1);
    }

    #[test]
    fn test_reads_linkup_key_and_tunables() {
        let config = Configuration::from_lookup(lookup(&[
            ("LINKUP_API_KEY", "lk-123"),
            ("EVIDENCE_CAP", "4"),
            ("MAX_RESULTS", "50"),
            ("SEARCH_CONCURRENCY", "not-a-number"),
            ("PDF_FONT_DIR", "/opt/fonts"),
        ]))
        .unwrap();
        assert_eq!(config.require_search_credential().unwrap(), "lk-123");
        assert_eq!(config.evidence_cap, 4);
        assert_eq!(config.max_results(), MAX_RESULTS_LIMIT);
        assert_eq!(config.search_concurrency, 2);
        assert_eq!(config.pdf_font_dir.as_deref(), Some("/opt/fonts"));
    }

    #[test]
    fn test_key_follows_selected_provider() {
        let config = Configuration::from_lookup(lookup(&[
            ("SEARCH_API", "perplexity"),
            ("LINKUP_API_KEY", "lk-123"),
        ]))
        .unwrap();
        assert_eq!(config.search_api, SearchAPI::Perplexity);
        let err = config.require_search_credential().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigError);
        assert!(err.user_message().contains("PERPLEXITY_API_KEY"));
    }

    #[test]
    fn test_blank_key_counts_as_missing() {
        let config = Configuration::from_lookup(lookup(&[("LINKUP_API_KEY", "   ")])).unwrap();
        assert!(!config.has_search_credential());
    }

    #[test]
    fn test_remote_mode_requires_groq_key() {
        let err = Configuration::from_lookup(lookup(&[("RESEARCH_MODE", "remote")])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigError);

        let config = Configuration::from_lookup(lookup(&[
            ("RESEARCH_MODE", "remote"),
            ("GROQ_API_KEY", "gsk"),
        ]))
        .unwrap();
        assert_eq!(config.model_name(), "mixtral-8x7b-32768");
        assert_eq!(config.model_concurrency(), 4);
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: Configuration =
            serde_json::from_str(r#"{"search_api": "perplexity", "groq_api_key": null}"#).unwrap();
        assert_eq!(config.search_api, SearchAPI::Perplexity);
        assert_eq!(config.search_base_url(), "https://api.perplexity.ai");
        assert_eq!(config.search_retry, RetryPolicy::search_default());
    }
}
