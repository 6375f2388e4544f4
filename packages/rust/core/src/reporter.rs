//! Lead report: terminal tasks joined with their records, written as CSV.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use licitai_shared::{LicitaiError, ProcurementRecord, Result, Task, TaskStatus};
use licitai_storage::Storage;
use serde::Serialize;
use tracing::{info, instrument};

/// Placeholder for values the record or task does not carry.
pub const PLACEHOLDER: &str = "N/A";

/// One report row per terminal task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeadRow {
    #[serde(rename = "PNCP")]
    pub control_number: String,
    #[serde(rename = "Orgao")]
    pub organization: String,
    #[serde(rename = "Municipio")]
    pub location: String,
    #[serde(rename = "Objeto da Compra")]
    pub description: String,
    #[serde(rename = "Link Edital")]
    pub link: String,
    #[serde(rename = "Gatilho de Venda")]
    pub sales_trigger: String,
    #[serde(rename = "Palavras-Chave IA")]
    pub keywords: String,
    #[serde(rename = "Status Final")]
    pub status: String,
    #[serde(rename = "Email Encontrado")]
    pub first_email: String,
    #[serde(rename = "Total Contatos")]
    pub total_contacts: usize,
}

impl LeadRow {
    /// Flatten a task and its record (if still present).
    pub fn from_parts(task: &Task, record: Option<&ProcurementRecord>) -> Self {
        let municipality = or_placeholder(record.and_then(|r| r.municipality.as_deref()));
        let region = or_placeholder(record.and_then(|r| r.region.as_deref()));

        Self {
            control_number: task.record_id.clone(),
            organization: or_placeholder(record.and_then(|r| r.org_name.as_deref())),
            location: format!("{municipality}/{region}"),
            description: or_placeholder(record.and_then(|r| r.description.as_deref())),
            link: or_placeholder(record.and_then(|r| r.external_link.as_deref())),
            sales_trigger: task
                .result
                .as_ref()
                .map(|r| r.sales_trigger.clone())
                .unwrap_or_else(|| PLACEHOLDER.to_string()),
            keywords: task
                .result
                .as_ref()
                .map(|r| r.keywords.join(", "))
                .unwrap_or_default(),
            status: task.status.to_string(),
            first_email: task
                .contacts
                .first()
                .map(|c| c.email.clone())
                .unwrap_or_else(|| PLACEHOLDER.to_string()),
            total_contacts: task.contacts.len(),
        }
    }
}

fn or_placeholder(value: Option<&str>) -> String {
    value.unwrap_or(PLACEHOLDER).to_string()
}

/// Build one row per task in a terminal status.
#[instrument(skip_all)]
pub async fn build_rows(storage: &Storage) -> Result<Vec<LeadRow>> {
    let tasks = storage.list_tasks_in(&TaskStatus::TERMINAL).await?;

    let mut records: HashMap<String, Option<ProcurementRecord>> = HashMap::new();
    let mut rows = Vec::with_capacity(tasks.len());
    for task in &tasks {
        if !records.contains_key(&task.record_id) {
            let record = storage.get_record(&task.record_id).await?;
            records.insert(task.record_id.clone(), record);
        }
        let record = records.get(&task.record_id).and_then(Option::as_ref);
        rows.push(LeadRow::from_parts(task, record));
    }

    info!(rows = rows.len(), "lead rows built");
    Ok(rows)
}

/// `lead_report_<YYYYMMDD_HHMMSS>.csv`
pub fn report_file_name(at: DateTime<Utc>) -> String {
    format!("lead_report_{}.csv", at.format("%Y%m%d_%H%M%S"))
}

/// Write `rows` as CSV into `output_dir`, creating it if needed.
/// Returns the file path.
pub fn write_csv(rows: &[LeadRow], output_dir: &Path, at: DateTime<Utc>) -> Result<PathBuf> {
    std::fs::create_dir_all(output_dir).map_err(|e| LicitaiError::io(output_dir, e))?;
    let path = output_dir.join(report_file_name(at));

    let mut writer = csv::Writer::from_path(&path)
        .map_err(|e| LicitaiError::io(&path, std::io::Error::other(e)))?;
    for row in rows {
        writer
            .serialize(row)
            .map_err(|e| LicitaiError::io(&path, std::io::Error::other(e)))?;
    }
    writer.flush().map_err(|e| LicitaiError::io(&path, e))?;

    info!(path = %path.display(), rows = rows.len(), "lead report written");
    Ok(path)
}

/// Build and write the report in one call.
pub async fn export(storage: &Storage, output_dir: &Path) -> Result<(PathBuf, usize)> {
    let rows = build_rows(storage).await?;
    let path = write_csv(&rows, output_dir, Utc::now())?;
    Ok((path, rows.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use licitai_shared::{AnalysisResult, Contact, SearchDefinition, Stage, StageOutput};
    use uuid::Uuid;

    async fn storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("licitai_report_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn record(id: &str) -> ProcurementRecord {
        ProcurementRecord {
            id: id.into(),
            description: Some("Aquisição de notebooks".into()),
            modality_name: None,
            org_name: Some("MUNICIPIO DE CAMPINAS".into()),
            region: Some("SP".into()),
            municipality: Some("Campinas".into()),
            publication_date: Some("2024-05-02".into()),
            external_link: None,
            synced_at: Utc::now(),
        }
    }

    fn contact(email: &str) -> Contact {
        Contact {
            email: email.into(),
            source_url: "https://campinas.sp.gov.br".into(),
            snippet: String::new(),
        }
    }

    /// Drive a task to `enrichment-done` through the normal transitions.
    async fn finish(storage: &Storage, task: &Task, contacts: Vec<Contact>) {
        storage
            .claim_task(&task.id, Stage::Analysis, TaskStatus::Pending, TaskStatus::Analyzing)
            .await
            .expect("claim");
        storage
            .complete_task(
                &task.id,
                TaskStatus::Analyzing,
                TaskStatus::AnalysisDone,
                &StageOutput::Analysis(AnalysisResult {
                    keywords: vec!["notebook".into(), "hardware".into()],
                    sales_trigger: "Compra de Hardware".into(),
                }),
            )
            .await
            .expect("analysis");
        storage
            .claim_task(
                &task.id,
                Stage::Enrichment,
                TaskStatus::AnalysisDone,
                TaskStatus::Enriching,
            )
            .await
            .expect("claim");
        storage
            .complete_task(
                &task.id,
                TaskStatus::Enriching,
                TaskStatus::EnrichmentDone,
                &StageOutput::Enrichment(contacts),
            )
            .await
            .expect("enrichment");
    }

    #[test]
    fn row_without_record_uses_placeholders() {
        let task = Task::pending("gone-1", &SearchDefinition::new("a", "o", &["x"]));
        let row = LeadRow::from_parts(&task, None);
        assert_eq!(row.organization, PLACEHOLDER);
        assert_eq!(row.location, "N/A/N/A");
        assert_eq!(row.first_email, PLACEHOLDER);
        assert_eq!(row.total_contacts, 0);
        assert_eq!(row.status, "pending");
    }

    #[tokio::test]
    async fn one_row_per_terminal_task() {
        let storage = storage().await;
        let def = SearchDefinition::new("a", "client-a", &["notebook"]);
        for id in ["r1", "r2", "r3"] {
            storage.insert_record(&record(id)).await.expect("record");
        }
        let done = Task::pending("r1", &def);
        let failed = Task::pending("r2", &def);
        let waiting = Task::pending("r3", &def);
        storage
            .insert_tasks(&[done.clone(), failed.clone(), waiting])
            .await
            .expect("tasks");

        finish(
            &storage,
            &done,
            vec![contact("ti@campinas.sp.gov.br"), contact("compras@campinas.sp.gov.br")],
        )
        .await;
        storage
            .claim_task(&failed.id, Stage::Analysis, TaskStatus::Pending, TaskStatus::Analyzing)
            .await
            .expect("claim");
        storage
            .fail_task(
                &failed.id,
                Stage::Analysis,
                TaskStatus::Analyzing,
                TaskStatus::AnalysisFailed,
                "enrichment: quota",
            )
            .await
            .expect("fail");

        let rows = build_rows(&storage).await.expect("rows");
        assert_eq!(rows.len(), 2);

        let done_row = rows.iter().find(|r| r.control_number == "r1").expect("r1 row");
        assert_eq!(done_row.first_email, "ti@campinas.sp.gov.br");
        assert_eq!(done_row.total_contacts, 2);
        assert_eq!(done_row.location, "Campinas/SP");
        assert_eq!(done_row.keywords, "notebook, hardware");
        assert_eq!(done_row.link, PLACEHOLDER);

        let failed_row = rows.iter().find(|r| r.control_number == "r2").expect("r2 row");
        assert_eq!(failed_row.status, "analysis-failed");
        assert_eq!(failed_row.first_email, PLACEHOLDER);
    }

    #[tokio::test]
    async fn csv_has_header_and_rows() {
        let storage = storage().await;
        let def = SearchDefinition::new("a", "client-a", &["notebook"]);
        storage.insert_record(&record("r1")).await.expect("record");
        let task = Task::pending("r1", &def);
        storage.insert_tasks(&[task.clone()]).await.expect("task");
        finish(&storage, &task, Vec::new()).await;

        let dir = std::env::temp_dir().join(format!("licitai_report_out_{}", Uuid::now_v7()));
        let (path, count) = export(&storage, &dir).await.expect("export");
        assert_eq!(count, 1);
        assert!(
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("lead_report_") && n.ends_with(".csv"))
        );

        let content = std::fs::read_to_string(&path).expect("read csv");
        let mut lines = content.lines();
        assert_eq!(
            lines.next(),
            Some("PNCP,Orgao,Municipio,Objeto da Compra,Link Edital,Gatilho de Venda,Palavras-Chave IA,Status Final,Email Encontrado,Total Contatos")
        );
        let row = lines.next().expect("data row");
        assert!(row.starts_with("r1,MUNICIPIO DE CAMPINAS,Campinas/SP,"));
        assert!(row.ends_with(",enrichment-done,N/A,0"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
