//! Enrichment stage: look for public contact e-mails of the buying
//! organization.

use std::collections::HashSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use licitai_shared::{Contact, ProcurementRecord, Result, StageOutput, Task};
use regex::Regex;
use tracing::info;

use crate::search::{QueryResults, SearchProvider};
use crate::worker::StageProcessor;

/// Departments a query is built for, one query each.
pub const TARGET_DEPARTMENTS: [&str; 4] = [
    "departamento de TI",
    "secretaria de administração",
    "setor de compras",
    "licitações",
];

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}").expect("valid regex")
});

/// One query per target department, scoped to the organization and its city.
pub fn build_queries(org_name: &str, municipality: &str) -> Vec<String> {
    TARGET_DEPARTMENTS
        .iter()
        .map(|dept| format!("email contato \"{dept}\" \"{org_name}\" {municipality}"))
        .collect()
}

/// Pull e-mail addresses out of hit snippets, lower-cased, first sighting
/// wins.
pub fn extract_contacts(results: &[QueryResults]) -> Vec<Contact> {
    let mut seen = HashSet::new();
    let mut contacts = Vec::new();

    for hit in results.iter().flat_map(|r| r.hits.iter()) {
        for m in EMAIL_RE.find_iter(&hit.snippet) {
            let email = m.as_str().to_lowercase();
            if seen.insert(email.clone()) {
                contacts.push(Contact {
                    email,
                    source_url: hit.url.clone(),
                    snippet: hit.snippet.clone(),
                });
            }
        }
    }
    contacts
}

/// [`StageProcessor`] for `analysis-done → enrichment-done`.
pub struct Enricher<S> {
    search: S,
}

impl<S: SearchProvider> Enricher<S> {
    pub fn new(search: S) -> Self {
        Self { search }
    }
}

#[async_trait]
impl<S: SearchProvider> StageProcessor for Enricher<S> {
    async fn process(&self, task: &Task, record: &ProcurementRecord) -> Result<StageOutput> {
        let org_name = record.require_org_name()?;
        let municipality = record.require_municipality()?;

        let queries = build_queries(org_name, municipality);
        let results = self.search.search(&queries).await?;
        let contacts = extract_contacts(&results);

        info!(
            task_id = %task.id,
            org = org_name,
            municipality,
            contacts = contacts.len(),
            "enrichment search finished"
        );
        Ok(StageOutput::Enrichment(contacts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::SearchHit;
    use chrono::Utc;
    use licitai_shared::{LicitaiError, SearchDefinition};
    use std::sync::Mutex;

    fn hit(url: &str, snippet: &str) -> SearchHit {
        SearchHit {
            url: url.into(),
            title: String::new(),
            snippet: snippet.into(),
        }
    }

    struct RecordingSearch {
        queries: Mutex<Vec<String>>,
        results: Vec<QueryResults>,
    }

    #[async_trait]
    impl SearchProvider for RecordingSearch {
        async fn search(&self, queries: &[String]) -> Result<Vec<QueryResults>> {
            self.queries
                .lock()
                .expect("lock")
                .extend(queries.iter().cloned());
            Ok(self.results.clone())
        }
    }

    struct DownSearch;

    #[async_trait]
    impl SearchProvider for DownSearch {
        async fn search(&self, _queries: &[String]) -> Result<Vec<QueryResults>> {
            Err(LicitaiError::Enrichment("search unavailable".into()))
        }
    }

    fn record(org: Option<&str>, municipality: Option<&str>) -> ProcurementRecord {
        ProcurementRecord {
            id: "rec-1".into(),
            description: Some("Aquisição de servidor".into()),
            modality_name: None,
            org_name: org.map(String::from),
            region: Some("SP".into()),
            municipality: municipality.map(String::from),
            publication_date: None,
            external_link: None,
            synced_at: Utc::now(),
        }
    }

    fn task() -> Task {
        Task::pending("rec-1", &SearchDefinition::new("TI", "o", &["x"]))
    }

    #[test]
    fn contacts_are_lowercased_and_deduplicated() {
        let results = vec![
            QueryResults {
                query: "q1".into(),
                hits: vec![hit(
                    "https://a.gov.br",
                    "Fale com TI@Campinas.sp.gov.br ou compras@campinas.sp.gov.br",
                )],
            },
            QueryResults {
                query: "q2".into(),
                hits: vec![hit("https://b.gov.br", "ti@campinas.sp.gov.br")],
            },
        ];

        let contacts = extract_contacts(&results);
        let emails: Vec<&str> = contacts.iter().map(|c| c.email.as_str()).collect();
        assert_eq!(emails, vec!["ti@campinas.sp.gov.br", "compras@campinas.sp.gov.br"]);
        assert_eq!(contacts[0].source_url, "https://a.gov.br");
    }

    #[test]
    fn snippets_without_addresses_yield_nothing() {
        let results = vec![QueryResults {
            query: "q".into(),
            hits: vec![hit("https://a.gov.br", "Telefone (19) 2116-0555")],
        }];
        assert!(extract_contacts(&results).is_empty());
    }

    #[tokio::test]
    async fn queries_cover_every_department() {
        let search = RecordingSearch {
            queries: Mutex::new(Vec::new()),
            results: Vec::new(),
        };
        let enricher = Enricher::new(search);

        let output = enricher
            .process(&task(), &record(Some("Prefeitura de Campinas"), Some("Campinas")))
            .await
            .expect("zero contacts is still success");
        assert_eq!(output, StageOutput::Enrichment(Vec::new()));

        let queries = enricher.search.queries.lock().expect("lock").clone();
        assert_eq!(queries.len(), TARGET_DEPARTMENTS.len());
        assert!(queries[0].contains("\"Prefeitura de Campinas\""));
        assert!(queries[0].contains("Campinas"));
    }

    #[tokio::test]
    async fn missing_location_is_data_integrity() {
        let enricher = Enricher::new(DownSearch);
        let err = enricher
            .process(&task(), &record(Some("Prefeitura"), None))
            .await
            .unwrap_err();
        assert!(err.is_data_integrity());
    }

    #[tokio::test]
    async fn provider_failure_propagates() {
        let enricher = Enricher::new(DownSearch);
        let err = enricher
            .process(&task(), &record(Some("Prefeitura"), Some("Campinas")))
            .await
            .unwrap_err();
        assert!(matches!(err, LicitaiError::Enrichment(_)));
    }
}
