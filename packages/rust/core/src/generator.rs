//! Task generation: records × active search definitions → `pending` tasks.

use licitai_shared::{ProcurementRecord, Result, SearchDefinition, Task};
use licitai_storage::Storage;
use tracing::{debug, info, instrument, warn};

/// Totals for one generation run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerateReport {
    pub records_scanned: usize,
    pub definitions: usize,
    pub created: u64,
    /// Committed write batches.
    pub batches: usize,
}

/// First keyword of `definition` found in `text`, compared case-insensitively.
pub fn find_match<'a>(text: &str, definition: &'a SearchDefinition) -> Option<&'a str> {
    let haystack = text.to_lowercase();
    definition
        .keywords
        .iter()
        .find(|kw| haystack.contains(&kw.to_lowercase()))
        .map(String::as_str)
}

/// Create a `pending` task for every new (record, owner) match.
///
/// Existing pairs are loaded once up front; tasks are written in
/// transactions of at most `max_batch` rows. Re-running against unchanged
/// data writes nothing.
#[instrument(skip_all, fields(max_batch = max_batch))]
pub async fn generate_tasks(storage: &Storage, max_batch: usize) -> Result<GenerateReport> {
    let max_batch = max_batch.max(1);
    let definitions: Vec<SearchDefinition> = storage
        .list_active_search_definitions()
        .await?
        .into_iter()
        .filter(|d| {
            let usable = d.is_usable();
            if !usable {
                warn!(definition = %d.name, "search definition has no owner or keywords, skipping");
            }
            usable
        })
        .collect();

    let mut report = GenerateReport {
        definitions: definitions.len(),
        ..GenerateReport::default()
    };
    if definitions.is_empty() {
        warn!("no active search definitions, nothing to generate");
        return Ok(report);
    }

    let mut existing = storage.existing_task_pairs().await?;
    let records = storage.list_records().await?;
    report.records_scanned = records.len();
    info!(
        records = records.len(),
        definitions = definitions.len(),
        existing = existing.len(),
        "matching records against search definitions"
    );

    let mut buffer: Vec<Task> = Vec::with_capacity(max_batch);
    for record in &records {
        let Some(description) = description_of(record) else {
            continue;
        };

        for definition in &definitions {
            let pair = (record.id.clone(), definition.owner_id.clone());
            if existing.contains(&pair) {
                continue;
            }
            let Some(keyword) = find_match(description, definition) else {
                continue;
            };

            debug!(record_id = %record.id, owner = %definition.owner_id, keyword, "match");
            buffer.push(Task::pending(&record.id, definition));
            existing.insert(pair);

            if buffer.len() >= max_batch {
                flush(storage, &mut buffer, &mut report).await?;
            }
        }
    }
    flush(storage, &mut buffer, &mut report).await?;

    info!(
        created = report.created,
        batches = report.batches,
        "task generation finished"
    );
    Ok(report)
}

fn description_of(record: &ProcurementRecord) -> Option<&str> {
    record
        .description
        .as_deref()
        .filter(|d| !d.trim().is_empty())
}

async fn flush(
    storage: &Storage,
    buffer: &mut Vec<Task>,
    report: &mut GenerateReport,
) -> Result<()> {
    if buffer.is_empty() {
        return Ok(());
    }
    let written = storage.insert_tasks(buffer).await?;
    debug!(written, batch = buffer.len(), "task batch committed");
    report.created += written;
    report.batches += 1;
    buffer.clear();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use licitai_shared::TaskStatus;
    use uuid::Uuid;

    async fn storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("licitai_generate_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn record(id: &str, description: Option<&str>) -> ProcurementRecord {
        ProcurementRecord {
            id: id.into(),
            description: description.map(String::from),
            modality_name: None,
            org_name: Some("Prefeitura".into()),
            region: Some("SP".into()),
            municipality: Some("Campinas".into()),
            publication_date: None,
            external_link: None,
            synced_at: Utc::now(),
        }
    }

    async fn seed(storage: &Storage, records: &[(&str, Option<&str>)]) {
        for (id, description) in records {
            storage
                .insert_record(&record(id, *description))
                .await
                .expect("insert record");
        }
    }

    #[test]
    fn match_is_case_insensitive_and_ordered() {
        let def = SearchDefinition::new("TI", "owner", &["Firewall", "servidor"]);
        assert_eq!(find_match("Compra de SERVIDOR e firewall", &def), Some("Firewall"));
        assert_eq!(find_match("Aquisição de Servidores", &def), Some("servidor"));
        assert_eq!(find_match("Material de limpeza", &def), None);
    }

    #[tokio::test]
    async fn one_task_per_matching_record() {
        let storage = storage().await;
        seed(
            &storage,
            &[
                ("r1", Some("Aquisição de servidor de rede")),
                ("r2", Some("Locação de SERVIDOR e storage")),
                ("r3", Some("Material de escritório")),
                ("r4", None),
            ],
        )
        .await;
        storage
            .insert_search_definition(&SearchDefinition::new("infra", "client-a", &["servidor", "storage"]))
            .await
            .expect("insert def");

        let report = generate_tasks(&storage, 499).await.expect("generate");
        assert_eq!(report.records_scanned, 4);
        assert_eq!(report.created, 2);
        assert_eq!(
            storage
                .count_tasks_with_status(TaskStatus::Pending)
                .await
                .expect("count"),
            2
        );
    }

    #[tokio::test]
    async fn second_run_writes_nothing() {
        let storage = storage().await;
        seed(&storage, &[("r1", Some("servidor")), ("r2", Some("firewall"))]).await;
        storage
            .insert_search_definition(&SearchDefinition::new("a", "client-a", &["servidor"]))
            .await
            .expect("insert def");
        storage
            .insert_search_definition(&SearchDefinition::new("b", "client-b", &["firewall", "servidor"]))
            .await
            .expect("insert def");

        let first = generate_tasks(&storage, 499).await.expect("first");
        assert_eq!(first.created, 3);

        let second = generate_tasks(&storage, 499).await.expect("second");
        assert_eq!(second.created, 0);
        assert_eq!(second.batches, 0);
        assert_eq!(storage.count_tasks().await.expect("count"), 3);
    }

    #[tokio::test]
    async fn batches_are_bounded() {
        let storage = storage().await;
        let ids: Vec<String> = (0..5).map(|i| format!("r{i}")).collect();
        for id in &ids {
            storage
                .insert_record(&record(id, Some("licença de software")))
                .await
                .expect("insert");
        }
        storage
            .insert_search_definition(&SearchDefinition::new("sw", "client-a", &["software"]))
            .await
            .expect("insert def");

        let report = generate_tasks(&storage, 2).await.expect("generate");
        assert_eq!(report.created, 5);
        assert_eq!(report.batches, 3);
    }

    #[tokio::test]
    async fn no_active_definitions_is_a_no_op() {
        let storage = storage().await;
        seed(&storage, &[("r1", Some("servidor"))]).await;
        let def = SearchDefinition::new("off", "client-a", &["servidor"]);
        storage.insert_search_definition(&def).await.expect("insert def");
        storage
            .set_search_definition_active(&def.id, false)
            .await
            .expect("deactivate");

        let report = generate_tasks(&storage, 499).await.expect("generate");
        assert_eq!(report, GenerateReport::default());
        assert_eq!(storage.count_tasks().await.expect("count"), 0);
    }
}
