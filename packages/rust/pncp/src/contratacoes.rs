//! Typed access to the PNCP `contratacoes` endpoints.

use chrono::NaiveDate;
use licitai_shared::{LicitaiError, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::client::{Filters, PncpClient};

const PUBLICATION_ENDPOINT: &str = "/v1/contratacoes/publicacao";
const OPEN_PROPOSALS_ENDPOINT: &str = "/v1/contratacoes/proposta";

/// Wire format for dates in query strings.
const WIRE_DATE: &str = "%Y%m%d";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// A procurement notice as returned by PNCP. Only the fields the pipeline
/// reads are modelled; everything is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contratacao {
    #[serde(default, rename = "numeroControlePNCP")]
    pub numero_controle_pncp: Option<String>,
    #[serde(default)]
    pub objeto_compra: Option<String>,
    #[serde(default)]
    pub modalidade_nome: Option<String>,
    #[serde(default)]
    pub orgao_entidade: Option<OrgaoEntidade>,
    #[serde(default)]
    pub unidade_orgao: Option<UnidadeOrgao>,
    #[serde(default)]
    pub data_publicacao_pncp: Option<String>,
    #[serde(default)]
    pub link_aviso_publicacao_pncp: Option<String>,
    #[serde(default)]
    pub link_sistema_origem: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrgaoEntidade {
    #[serde(default)]
    pub razao_social: Option<String>,
    #[serde(default)]
    pub cnpj: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnidadeOrgao {
    #[serde(default)]
    pub uf_sigla: Option<String>,
    #[serde(default)]
    pub municipio_nome: Option<String>,
}

// ---------------------------------------------------------------------------
// DateWindow
// ---------------------------------------------------------------------------

/// Inclusive publication date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(LicitaiError::validation(format!(
                "start date {start} is after end date {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// Parse two `YYYY-MM-DD` dates.
    pub fn parse(start: &str, end: &str) -> Result<Self> {
        Self::new(parse_date(start)?, parse_date(end)?)
    }
}

impl std::fmt::Display for DateWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// Parse a `YYYY-MM-DD` date.
pub fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| LicitaiError::validation(format!("invalid date '{s}', expected YYYY-MM-DD: {e}")))
}

// ---------------------------------------------------------------------------
// ContratacoesApi
// ---------------------------------------------------------------------------

/// Endpoint wrappers over a [`PncpClient`].
#[derive(Debug, Clone)]
pub struct ContratacoesApi {
    client: PncpClient,
}

impl ContratacoesApi {
    pub fn new(client: PncpClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &PncpClient {
        &self.client
    }

    /// Notices published inside `window` for one modality, optionally
    /// restricted to one UF. All pages.
    #[instrument(skip_all, fields(window = %window, modality = modality, uf = uf.unwrap_or("*")))]
    pub async fn by_publication(
        &self,
        window: &DateWindow,
        modality: u32,
        uf: Option<&str>,
    ) -> Result<Vec<Contratacao>> {
        let mut filters: Filters = vec![
            ("dataInicial", window.start.format(WIRE_DATE).to_string()),
            ("dataFinal", window.end.format(WIRE_DATE).to_string()),
            ("codigoModalidadeContratacao", modality.to_string()),
        ];
        if let Some(uf) = uf {
            filters.push(("uf", uf.to_string()));
        }

        let items: Vec<Contratacao> = self.client.fetch_all(PUBLICATION_ENDPOINT, &filters).await?;
        info!(count = items.len(), "publication notices fetched");
        Ok(items)
    }

    /// Notices still receiving proposals on `end`.
    #[instrument(skip_all, fields(end = %end, modality = modality, uf = uf.unwrap_or("*")))]
    pub async fn open_proposals(
        &self,
        end: NaiveDate,
        modality: u32,
        uf: Option<&str>,
    ) -> Result<Vec<Contratacao>> {
        let mut filters: Filters = vec![
            ("dataFinal", end.format(WIRE_DATE).to_string()),
            ("codigoModalidadeContratacao", modality.to_string()),
        ];
        if let Some(uf) = uf {
            filters.push(("uf", uf.to_string()));
        }

        let items: Vec<Contratacao> = self
            .client
            .fetch_all(OPEN_PROPOSALS_ENDPOINT, &filters)
            .await?;
        info!(count = items.len(), "open-proposal notices fetched");
        Ok(items)
    }

    /// A single notice by organization CNPJ, year and sequence number.
    pub async fn by_id(&self, cnpj: &str, year: i32, sequence: u32) -> Result<Option<Contratacao>> {
        let cnpj: String = cnpj.chars().filter(char::is_ascii_digit).collect();
        if cnpj.is_empty() {
            return Err(LicitaiError::validation("CNPJ must contain digits"));
        }
        self.client
            .fetch_one(&format!("/v1/orgaos/{cnpj}/compras/{year}/{sequence}"))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use licitai_shared::{PncpConfig, RetryPolicy};
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn api(server: &MockServer) -> ContratacoesApi {
        let config = PncpConfig {
            base_url: server.uri(),
            page_size: 50,
            timeout_secs: 5,
        };
        let retry = RetryPolicy {
            delay: Duration::ZERO,
            ..RetryPolicy::default()
        };
        ContratacoesApi::new(PncpClient::new(&config, retry).expect("client"))
    }

    #[test]
    fn window_rejects_reversed_dates() {
        assert!(DateWindow::parse("2024-05-01", "2024-05-31").is_ok());
        let err = DateWindow::parse("2024-06-01", "2024-05-31").unwrap_err();
        assert!(err.to_string().contains("after"));
        assert!(DateWindow::parse("01/05/2024", "2024-05-31").is_err());
    }

    #[test]
    fn contratacao_deserializes_nested_fields() {
        let item: Contratacao = serde_json::from_value(json!({
            "numeroControlePNCP": "46068425000133-1-000321/2024",
            "objetoCompra": "Aquisição de notebooks",
            "orgaoEntidade": { "razaoSocial": "MUNICIPIO DE CAMPINAS", "cnpj": "46068425000133" },
            "unidadeOrgao": { "ufSigla": "SP", "municipioNome": "Campinas" },
            "dataPublicacaoPncp": "2024-05-02T10:11:12",
            "valorTotalEstimado": 1000.5
        }))
        .expect("deserialize");
        assert_eq!(
            item.numero_controle_pncp.as_deref(),
            Some("46068425000133-1-000321/2024")
        );
        assert_eq!(
            item.unidade_orgao.and_then(|u| u.municipio_nome).as_deref(),
            Some("Campinas")
        );
        assert!(item.link_sistema_origem.is_none());
    }

    #[tokio::test]
    async fn publication_sends_compact_dates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(PUBLICATION_ENDPOINT))
            .and(query_param("dataInicial", "20240501"))
            .and(query_param("dataFinal", "20240531"))
            .and(query_param("codigoModalidadeContratacao", "7"))
            .and(query_param("uf", "SP"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{ "numeroControlePNCP": "1-1-1/2024" }],
                "totalRegistros": 1
            })))
            .mount(&server)
            .await;

        let window = DateWindow::parse("2024-05-01", "2024-05-31").expect("window");
        let items = api(&server)
            .by_publication(&window, 7, Some("SP"))
            .await
            .expect("fetch");
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn open_proposals_uses_end_date_only() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(OPEN_PROPOSALS_ENDPOINT))
            .and(query_param("dataFinal", "20240531"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let end = parse_date("2024-05-31").expect("date");
        let items = api(&server).open_proposals(end, 1, None).await.expect("fetch");
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn by_id_strips_cnpj_punctuation() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/orgaos/46068425000133/compras/2024/321"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "numeroControlePNCP": "46068425000133-1-000321/2024",
                "objetoCompra": "Licença de software"
            })))
            .mount(&server)
            .await;

        let item = api(&server)
            .by_id("46.068.425/0001-33", 2024, 321)
            .await
            .expect("fetch")
            .expect("found");
        assert_eq!(item.objeto_compra.as_deref(), Some("Licença de software"));

        let missing = api(&server).by_id("46068425000133", 2023, 1).await.expect("404");
        assert!(missing.is_none());
    }
}
