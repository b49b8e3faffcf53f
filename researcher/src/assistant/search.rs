//! Web search clients.
//!
//! [`SearchProvider`] is the seam the orchestrator depends on. [`LinkupClient`]
//! and [`PerplexityClient`] talk to the real APIs; [`WebSearch`] selects one
//! of them from the [`Configuration`].

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::configuration::{Configuration, SearchAPI};
use super::error::ProviderError;
use super::state::SearchResult;

#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Environment variable that supplies this provider's credential.
    fn credential_var(&self) -> &str;

    /// Whether a credential is present. Checked before any network call.
    fn is_configured(&self) -> bool;

    /// Best match first. An empty list is a valid answer.
    async fn search(&self, query: &str, max_results: usize)
        -> Result<Vec<SearchResult>, ProviderError>;
}

/// Map an HTTP status to the provider error taxonomy.
fn classify_status(status: StatusCode, body: &str) -> ProviderError {
    let excerpt: String = body.chars().take(200).collect();
    let detail = format!("HTTP {}: {}", status.as_u16(), excerpt);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Auth(detail),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            ProviderError::Transient(detail)
        }
        s if s.is_server_error() => ProviderError::Transient(detail),
        _ => ProviderError::Malformed(detail),
    }
}

fn classify_transport(err: reqwest::Error) -> ProviderError {
    ProviderError::Transient(err.to_string())
}

async fn post_json(
    client: &Client,
    url: &str,
    api_key: &str,
    body: &Value,
) -> Result<Value, ProviderError> {
    let response = client
        .post(url)
        .header("Authorization", format!("Bearer {}", api_key))
        .json(body)
        .send()
        .await
        .map_err(classify_transport)?;

    let status = response.status();
    let text = response.text().await.map_err(classify_transport)?;
    if !status.is_success() {
        return Err(classify_status(status, &text));
    }

    serde_json::from_str(&text).map_err(|e| ProviderError::Malformed(e.to_string()))
}

#[derive(Debug, Deserialize)]
struct LinkupResponse {
    results: Vec<LinkupResult>,
}

#[derive(Debug, Deserialize)]
struct LinkupResult {
    #[serde(default)]
    name: String,
    url: String,
    #[serde(default)]
    content: String,
}

#[derive(Clone)]
pub struct LinkupClient {
    api_key: Option<String>,
    base_url: String,
    client: Client,
}

impl LinkupClient {
    pub fn new(api_key: Option<String>, base_url: impl Into<String>) -> Self {
        Self {
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl SearchProvider for LinkupClient {
    fn credential_var(&self) -> &str {
        SearchAPI::Linkup.key_var()
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchResult>, ProviderError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::Auth(format!("{} is not set", self.credential_var())))?;

        debug!(query, max_results, "Linkup search");
        let data = post_json(
            &self.client,
            &format!("{}/v1/search", self.base_url),
            api_key,
            &json!({
                "q": query,
                "depth": "standard",
                "outputType": "searchResults",
            }),
        )
        .await?;

        let parsed: LinkupResponse =
            serde_json::from_value(data).map_err(|e| ProviderError::Malformed(e.to_string()))?;

        Ok(parsed
            .results
            .into_iter()
            .filter(|r| !r.url.trim().is_empty())
            .take(max_results)
            .enumerate()
            .map(|(i, r)| {
                let title = if r.name.trim().is_empty() { r.url.clone() } else { r.name };
                SearchResult::new(title, r.url, r.content, i + 1)
            })
            .collect())
    }
}

/// Uses Perplexity's search-backed chat endpoint. The answer text becomes the
/// snippet of the first citation; remaining citations carry a pointer to it.
#[derive(Clone)]
pub struct PerplexityClient {
    api_key: Option<String>,
    base_url: String,
    client: Client,
}

impl PerplexityClient {
    pub fn new(api_key: Option<String>, base_url: impl Into<String>) -> Self {
        Self {
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl SearchProvider for PerplexityClient {
    fn credential_var(&self) -> &str {
        SearchAPI::Perplexity.key_var()
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchResult>, ProviderError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::Auth(format!("{} is not set", self.credential_var())))?;

        debug!(query, max_results, "Perplexity search");
        let data = post_json(
            &self.client,
            &format!("{}/chat/completions", self.base_url),
            api_key,
            &json!({
                "model": "sonar-pro",
                "messages": [
                    {
                        "role": "system",
                        "content": "Search the web and provide factual information with sources."
                    },
                    {
                        "role": "user",
                        "content": query
                    }
                ]
            }),
        )
        .await?;

        let content = data["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| ProviderError::Malformed("missing choices[0].message.content".into()))?;

        let citations: Vec<&str> = data
            .get("citations")
            .and_then(|c| c.as_array())
            .map(|arr| arr.iter().filter_map(|c| c.as_str()).collect())
            .unwrap_or_default();

        Ok(citations
            .into_iter()
            .take(max_results)
            .enumerate()
            .map(|(i, url)| {
                let snippet = if i == 0 {
                    content.to_string()
                } else {
                    format!("Cited in the search answer for \"{}\"", query)
                };
                SearchResult::new(format!("Perplexity source {}", i + 1), url, snippet, i + 1)
            })
            .collect())
    }
}

#[derive(Clone)]
pub enum WebSearch {
    Linkup(LinkupClient),
    Perplexity(PerplexityClient),
}

impl WebSearch {
    pub fn from_config(config: &Configuration) -> Self {
        let key = config.search_api_key.clone();
        let base = config.search_base_url().to_string();
        match config.search_api {
            SearchAPI::Linkup => WebSearch::Linkup(LinkupClient::new(key, base)),
            SearchAPI::Perplexity => WebSearch::Perplexity(PerplexityClient::new(key, base)),
        }
    }
}

#[async_trait]
impl SearchProvider for WebSearch {
    fn credential_var(&self) -> &str {
        match self {
            WebSearch::Linkup(c) => c.credential_var(),
            WebSearch::Perplexity(c) => c.credential_var(),
        }
    }

    fn is_configured(&self) -> bool {
        match self {
            WebSearch::Linkup(c) => c.is_configured(),
            WebSearch::Perplexity(c) => c.is_configured(),
        }
    }

    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchResult>, ProviderError> {
        match self {
            WebSearch::Linkup(c) => c.search(query, max_results).await,
            WebSearch::Perplexity(c) => c.search(query, max_results).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode as ServerStatus};
    use axum::{routing::post, Json, Router};

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn status_app(status: ServerStatus) -> Router {
        Router::new().route(
            "/v1/search",
            post(move || async move { (status, "nope") }),
        )
    }

    #[tokio::test]
    async fn test_linkup_parses_results() {
        let app = Router::new().route(
            "/v1/search",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                assert_eq!(headers["authorization"], "Bearer lk-test");
                assert_eq!(body["q"], "rust async");
                Json(json!({
                    "results": [
                        {"type": "text", "name": "Tokio", "url": "https://tokio.rs", "content": "runtime"},
                        {"type": "text", "name": "", "url": "https://async.rs", "content": "std"},
                        {"type": "text", "name": "Skip", "url": "https://third.rs", "content": "x"}
                    ]
                }))
            }),
        );
        let base = spawn(app).await;
        let client = LinkupClient::new(Some("lk-test".into()), base);

        let results = client.search("rust async", 2).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0], SearchResult::new("Tokio", "https://tokio.rs", "runtime", 1));
        assert_eq!(results[1].title, "https://async.rs");
        assert_eq!(results[1].source_rank, 2);
    }

    #[tokio::test]
    async fn test_linkup_status_classification() {
        let base = spawn(status_app(ServerStatus::UNAUTHORIZED)).await;
        let err = LinkupClient::new(Some("bad".into()), base).search("q", 5).await.unwrap_err();
        assert!(err.is_auth());

        let base = spawn(status_app(ServerStatus::TOO_MANY_REQUESTS)).await;
        let err = LinkupClient::new(Some("k".into()), base).search("q", 5).await.unwrap_err();
        assert!(err.is_transient());

        let base = spawn(status_app(ServerStatus::BAD_GATEWAY)).await;
        let err = LinkupClient::new(Some("k".into()), base).search("q", 5).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_linkup_malformed_body() {
        let app = Router::new().route(
            "/v1/search",
            post(|| async { Json(json!({"answer": "no results field"})) }),
        );
        let base = spawn(app).await;
        let err = LinkupClient::new(Some("k".into()), base).search("q", 5).await.unwrap_err();
        assert!(err.is_malformed());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transient() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = LinkupClient::new(Some("k".into()), format!("http://{}", addr))
            .search("q", 5)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_missing_key_is_auth_without_network() {
        let client = LinkupClient::new(None, "http://127.0.0.1:1");
        assert!(!client.is_configured());
        assert_eq!(client.credential_var(), "LINKUP_API_KEY");
        assert!(client.search("q", 5).await.unwrap_err().is_auth());
    }

    #[tokio::test]
    async fn test_perplexity_maps_citations() {
        let app = Router::new().route(
            "/chat/completions",
            post(|| async {
                Json(json!({
                    "choices": [{"message": {"content": "Rust is fast."}}],
                    "citations": ["https://a.com", "https://b.com"]
                }))
            }),
        );
        let base = spawn(app).await;
        let client = PerplexityClient::new(Some("pplx".into()), base);
        let results = client.search("rust speed", 5).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].snippet, "Rust is fast.");
        assert_eq!(results[1].url, "https://b.com");
        assert_eq!(results[1].source_rank, 2);
    }

    #[test]
    fn test_web_search_follows_config() {
        let config = Configuration {
            search_api: SearchAPI::Perplexity,
            search_api_key: Some("k".into()),
            ..Configuration::default()
        };
        let search = WebSearch::from_config(&config);
        assert!(matches!(search, WebSearch::Perplexity(_)));
        assert_eq!(search.credential_var(), "PERPLEXITY_API_KEY");
        assert!(search.is_configured());
    }
}
