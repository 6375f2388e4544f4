//! Web search used by the enrichment stage.

use std::time::Duration;

use async_trait::async_trait;
use licitai_shared::{LicitaiError, Result, SearchConfig, resolve_api_key};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{instrument, warn};

/// One organic search hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub url: String,
    pub title: String,
    pub snippet: String,
}

/// Hits for one query, in provider rank order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResults {
    pub query: String,
    pub hits: Vec<SearchHit>,
}

/// Runs a batch of web search queries.
///
/// A query that fails on its own yields an empty hit list. An error is
/// returned only when the provider as a whole is unusable.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, queries: &[String]) -> Result<Vec<QueryResults>>;
}

// ---------------------------------------------------------------------------
// Serper
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SerperResponse {
    #[serde(default)]
    organic: Vec<SerperHit>,
}

#[derive(Deserialize)]
struct SerperHit {
    #[serde(default)]
    link: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    snippet: String,
}

/// [`SearchProvider`] backed by the Serper Google Search API.
pub struct SerperSearch {
    http: Client,
    endpoint: String,
    api_key: String,
    results_per_query: u32,
}

impl SerperSearch {
    /// Build from config. Fails when the API key env var is unset.
    pub fn from_config(config: &SearchConfig) -> Result<Self> {
        let api_key = resolve_api_key(&config.api_key_env)?;
        Self::new(config, api_key)
    }

    pub fn new(config: &SearchConfig, api_key: String) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LicitaiError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
            api_key,
            results_per_query: config.results_per_query,
        })
    }

    async fn search_one(&self, query: &str) -> Result<Vec<SearchHit>> {
        let body = json!({
            "q": query,
            "num": self.results_per_query,
            "gl": "br",
            "hl": "pt-br",
        });

        let response = self
            .http
            .post(&self.endpoint)
            .header("X-API-KEY", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LicitaiError::Enrichment(format!("search request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LicitaiError::Enrichment(format!(
                "search returned HTTP {status}"
            )));
        }

        let parsed: SerperResponse = response
            .json()
            .await
            .map_err(|e| LicitaiError::Enrichment(format!("search response unreadable: {e}")))?;

        Ok(parsed
            .organic
            .into_iter()
            .filter(|h| !h.link.is_empty())
            .map(|h| SearchHit {
                url: h.link,
                title: h.title,
                snippet: h.snippet,
            })
            .collect())
    }
}

#[async_trait]
impl SearchProvider for SerperSearch {
    #[instrument(skip_all, fields(queries = queries.len()))]
    async fn search(&self, queries: &[String]) -> Result<Vec<QueryResults>> {
        let mut results = Vec::with_capacity(queries.len());
        let mut last_error: Option<LicitaiError> = None;
        let mut failures = 0usize;

        for query in queries {
            let hits = match self.search_one(query).await {
                Ok(hits) => hits,
                Err(e) => {
                    warn!(%query, error = %e, "search query failed");
                    failures += 1;
                    last_error = Some(e);
                    Vec::new()
                }
            };
            results.push(QueryResults {
                query: query.clone(),
                hits,
            });
        }

        if failures > 0 && failures == queries.len() {
            let last = last_error.map(|e| e.to_string()).unwrap_or_default();
            return Err(LicitaiError::Enrichment(format!(
                "all {failures} search queries failed, last error: {last}"
            )));
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> SerperSearch {
        let config = SearchConfig {
            endpoint: format!("{}/search", server.uri()),
            timeout_secs: 5,
            ..SearchConfig::default()
        };
        SerperSearch::new(&config, "serper-key".into()).expect("build")
    }

    #[tokio::test]
    async fn maps_organic_hits() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("X-API-KEY", "serper-key"))
            .and(body_partial_json(json!({ "q": "email contato \"licitações\"", "num": 5 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "organic": [
                    { "link": "https://campinas.sp.gov.br/licitacoes", "title": "Licitações", "snippet": "licitacoes@campinas.sp.gov.br" },
                    { "title": "sem link" }
                ]
            })))
            .mount(&server)
            .await;

        let results = provider(&server)
            .search(&["email contato \"licitações\"".to_string()])
            .await
            .expect("search");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].hits.len(), 1);
        assert_eq!(results[0].hits[0].url, "https://campinas.sp.gov.br/licitacoes");
    }

    #[tokio::test]
    async fn single_failed_query_yields_empty_hits() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "q": "bad" })))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "q": "good" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "organic": [] })))
            .mount(&server)
            .await;

        let results = provider(&server)
            .search(&["bad".to_string(), "good".to_string()])
            .await
            .expect("partial failure is tolerated");
        assert_eq!(results.len(), 2);
        assert!(results[0].hits.is_empty());
    }

    #[tokio::test]
    async fn all_queries_failing_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let err = provider(&server)
            .search(&["a".to_string(), "b".to_string()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("all 2 search queries failed"));
    }
}
