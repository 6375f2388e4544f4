//! Procurement text classification.
//!
//! [`Classifier`] is the contract the analysis stage depends on.
//! [`GeminiClassifier`] implements it against the Gemini `generateContent`
//! REST endpoint.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use licitai_shared::{ClassifierConfig, LicitaiError, Result, resolve_api_key};
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument};

/// Sales trigger recorded when the model does not name one.
pub const NOT_INFORMED: &str = "Não informado";

/// Outermost `{...}` block in a model reply.
static JSON_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("valid JSON block regex"));

const PROMPT_TEMPLATE: &str = r#"Você é um assistente de análise de licitações para uma empresa de tecnologia que vende software.

Analise o "objeto da compra" abaixo e extraia:
1. Palavras-chave: até 10 termos técnicos (software, hardware ou serviços de TI).
2. Gatilho de venda: escolha UMA categoria:
   - Compra de Hardware
   - Renovação/Expiração de Licença de Software
   - Nova Aquisição de Software
   - Serviços de TI
   - Outros
   - Não se aplica

Objeto da compra:
"{text}"

Responda APENAS com um objeto JSON válido neste formato:
{"palavrasChave": ["termo1", "termo2"], "gatilhoVenda": "Categoria"}"#;

/// Classifier output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    #[serde(default, alias = "palavrasChave")]
    pub keywords: Vec<String>,
    #[serde(default, alias = "gatilhoVenda")]
    pub sales_trigger: Option<String>,
}

/// Classifies free-text procurement descriptions.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<Classification>;
}

/// Extract the JSON object from a model reply that may carry prose or
/// code fences around it.
pub fn parse_classification(reply: &str) -> Result<Classification> {
    let json = JSON_BLOCK
        .find(reply)
        .map(|m| m.as_str())
        .unwrap_or(reply);
    serde_json::from_str(json)
        .map_err(|e| LicitaiError::Enrichment(format!("classifier returned invalid JSON: {e}")))
}

// ---------------------------------------------------------------------------
// Gemini
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

/// Gemini-backed [`Classifier`].
pub struct GeminiClassifier {
    http: Client,
    url: String,
    api_key: String,
}

impl GeminiClassifier {
    /// Build from config. Fails when the API key env var is unset.
    pub fn from_config(config: &ClassifierConfig) -> Result<Self> {
        let api_key = resolve_api_key(&config.api_key_env)?;
        Self::new(config, api_key)
    }

    pub fn new(config: &ClassifierConfig, api_key: String) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LicitaiError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            url: format!(
                "{}/models/{}:generateContent",
                config.endpoint.trim_end_matches('/'),
                config.model
            ),
            api_key,
        })
    }
}

#[async_trait]
impl Classifier for GeminiClassifier {
    #[instrument(skip_all, fields(chars = text.len()))]
    async fn classify(&self, text: &str) -> Result<Classification> {
        if text.trim().is_empty() {
            return Ok(Classification::default());
        }

        let prompt = PROMPT_TEMPLATE.replace("{text}", text);
        let body = json!({ "contents": [{ "parts": [{ "text": prompt }] }] });

        let response = self
            .http
            .post(&self.url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LicitaiError::Enrichment(format!("classifier request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(LicitaiError::Enrichment(format!(
                "classifier returned HTTP {status}: {}",
                detail.chars().take(200).collect::<String>()
            )));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| LicitaiError::Enrichment(format!("classifier response unreadable: {e}")))?;

        let reply: String = parsed
            .candidates
            .into_iter()
            .next()
            .map(|c| c.content.parts.into_iter().map(|p| p.text).collect())
            .unwrap_or_default();
        debug!(reply_chars = reply.len(), "classifier replied");

        if reply.trim().is_empty() {
            return Err(LicitaiError::Enrichment("classifier returned no candidates".into()));
        }
        parse_classification(&reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> ClassifierConfig {
        ClassifierConfig {
            endpoint: server.uri(),
            model: "gemini-test".into(),
            timeout_secs: 5,
            ..ClassifierConfig::default()
        }
    }

    #[test]
    fn parses_fenced_reply() {
        let reply = "Claro!\n```json\n{\"palavrasChave\": [\"notebook\"], \"gatilhoVenda\": \"Compra de Hardware\"}\n```";
        let c = parse_classification(reply).expect("parse");
        assert_eq!(c.keywords, vec!["notebook"]);
        assert_eq!(c.sales_trigger.as_deref(), Some("Compra de Hardware"));
    }

    #[test]
    fn missing_fields_default() {
        let c = parse_classification("{}").expect("parse");
        assert!(c.keywords.is_empty());
        assert!(c.sales_trigger.is_none());
    }

    #[test]
    fn non_json_reply_is_enrichment_error() {
        let err = parse_classification("sem resposta").unwrap_err();
        assert!(matches!(err, LicitaiError::Enrichment(_)));
    }

    #[tokio::test]
    async fn gemini_roundtrip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-test:generateContent"))
            .and(header("x-goog-api-key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{ "content": { "parts": [{
                    "text": "{\"palavrasChave\": [\"office\", \"licença\"], \"gatilhoVenda\": \"Nova Aquisição de Software\"}"
                }]}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let classifier = GeminiClassifier::new(&config(&server), "test-key".into()).expect("build");
        let c = classifier
            .classify("Aquisição de licenças Microsoft Office")
            .await
            .expect("classify");
        assert_eq!(c.keywords, vec!["office", "licença"]);
    }

    #[tokio::test]
    async fn gemini_http_error_is_enrichment_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("quota"))
            .mount(&server)
            .await;

        let classifier = GeminiClassifier::new(&config(&server), "k".into()).expect("build");
        let err = classifier.classify("servidor").await.unwrap_err();
        assert!(err.to_string().contains("429"));
    }

    #[tokio::test]
    async fn blank_text_skips_the_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let classifier = GeminiClassifier::new(&config(&server), "k".into()).expect("build");
        let c = classifier.classify("   ").await.expect("empty");
        assert_eq!(c, Classification::default());
    }
}
