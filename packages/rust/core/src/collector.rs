//! Record collection: PNCP partitions → `records` table.
//!
//! A run walks every (region, modality) partition, fetches all pages for
//! it, and inserts records whose natural id is not stored yet. A partition
//! that fails is logged and skipped; the run always reaches the end.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{Datelike, Duration, NaiveDate, Utc};
use licitai_pncp::{Contratacao, ContratacoesApi, DateWindow, parse_date};
use licitai_shared::{CollectorConfig, LicitaiError, ProcurementRecord, Result};
use licitai_storage::Storage;
use tracing::{error, info, instrument};

/// Totals for one collection run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectReport {
    pub partitions: usize,
    pub failed_partitions: usize,
    /// Distinct items returned by the API across successful partitions.
    pub fetched: u64,
    pub inserted: u64,
    pub skipped_existing: u64,
}

/// Progress callback for collection runs.
pub trait CollectProgress: Send + Sync {
    /// Called before a partition is fetched. `current` is 1-based.
    fn partition_started(&self, region: &str, modality: u32, current: usize, total: usize);
    /// Called after a partition's records are stored.
    fn partition_finished(&self, region: &str, modality: u32, inserted: u64);
    /// Called when a partition is abandoned.
    fn partition_failed(&self, region: &str, modality: u32, error: &LicitaiError);
    /// Called once when the run completes.
    fn done(&self, report: &CollectReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl CollectProgress for SilentProgress {
    fn partition_started(&self, _region: &str, _modality: u32, _current: usize, _total: usize) {}
    fn partition_finished(&self, _region: &str, _modality: u32, _inserted: u64) {}
    fn partition_failed(&self, _region: &str, _modality: u32, _error: &LicitaiError) {}
    fn done(&self, _report: &CollectReport) {}
}

/// Which PNCP listing a run reads.
#[derive(Debug, Clone, Copy)]
enum Listing {
    Publication(DateWindow),
    OpenProposals(NaiveDate),
}

/// Per-partition counts.
#[derive(Debug, Default)]
struct PartitionCounts {
    fetched: u64,
    inserted: u64,
    skipped: u64,
}

/// Collects procurement notices into the record store.
pub struct RecordCollector {
    api: ContratacoesApi,
    storage: Arc<Storage>,
    regions: Vec<String>,
    modalities: Vec<u32>,
}

impl RecordCollector {
    pub fn new(api: ContratacoesApi, storage: Arc<Storage>, config: &CollectorConfig) -> Self {
        Self {
            api,
            storage,
            regions: config.regions.clone(),
            modalities: config.modalities.clone(),
        }
    }

    /// Collect notices published inside `window`.
    #[instrument(skip_all, fields(window = %window))]
    pub async fn collect(
        &self,
        window: DateWindow,
        progress: &dyn CollectProgress,
    ) -> Result<CollectReport> {
        self.run(Listing::Publication(window), progress).await
    }

    /// Collect notices still open for proposals on `end`.
    #[instrument(skip_all, fields(end = %end))]
    pub async fn collect_open(
        &self,
        end: NaiveDate,
        progress: &dyn CollectProgress,
    ) -> Result<CollectReport> {
        self.run(Listing::OpenProposals(end), progress).await
    }

    async fn run(&self, listing: Listing, progress: &dyn CollectProgress) -> Result<CollectReport> {
        self.storage.check_writable()?;

        let start = Instant::now();
        let total = self.regions.len() * self.modalities.len();
        let mut report = CollectReport {
            partitions: total,
            ..CollectReport::default()
        };
        info!(partitions = total, "starting collection");

        let partitions = self
            .regions
            .iter()
            .flat_map(|region| self.modalities.iter().map(move |m| (region.as_str(), *m)));

        for (index, (region, modality)) in partitions.enumerate() {
            progress.partition_started(region, modality, index + 1, total);

            match self.collect_partition(listing, region, modality).await {
                Ok(counts) => {
                    info!(
                        region,
                        modality,
                        fetched = counts.fetched,
                        inserted = counts.inserted,
                        "partition collected"
                    );
                    report.fetched += counts.fetched;
                    report.inserted += counts.inserted;
                    report.skipped_existing += counts.skipped;
                    progress.partition_finished(region, modality, counts.inserted);
                }
                Err(e) => {
                    error!(region, modality, error = %e, "partition failed, continuing");
                    report.failed_partitions += 1;
                    progress.partition_failed(region, modality, &e);
                }
            }
        }

        info!(
            inserted = report.inserted,
            skipped = report.skipped_existing,
            failed_partitions = report.failed_partitions,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "collection finished"
        );
        progress.done(&report);
        Ok(report)
    }

    async fn collect_partition(
        &self,
        listing: Listing,
        region: &str,
        modality: u32,
    ) -> Result<PartitionCounts> {
        let items = match listing {
            Listing::Publication(window) => {
                self.api
                    .by_publication(&window, modality, Some(region))
                    .await?
            }
            Listing::OpenProposals(end) => {
                self.api.open_proposals(end, modality, Some(region)).await?
            }
        };

        let records = normalize_all(&items);
        let mut counts = PartitionCounts {
            fetched: records.len() as u64,
            ..PartitionCounts::default()
        };

        for record in &records {
            if self.storage.record_exists(&record.id).await? {
                counts.skipped += 1;
                continue;
            }
            if self.storage.insert_record(record).await? {
                counts.inserted += 1;
            } else {
                counts.skipped += 1;
            }
        }
        Ok(counts)
    }
}

/// Natural id for a PNCP control number (`/` is replaced by `-`).
pub fn natural_id(control_number: &str) -> String {
    control_number.trim().replace('/', "-")
}

/// Map a wire item to a record. Items without a control number are
/// unusable and yield `None`.
pub fn to_record(item: &Contratacao) -> Option<ProcurementRecord> {
    let control = item
        .numero_controle_pncp
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())?;

    let org = item.orgao_entidade.as_ref();
    let unit = item.unidade_orgao.as_ref();

    Some(ProcurementRecord {
        id: natural_id(control),
        description: item.objeto_compra.clone(),
        modality_name: item.modalidade_nome.clone(),
        org_name: org.and_then(|o| o.razao_social.clone()),
        region: unit.and_then(|u| u.uf_sigla.clone()),
        municipality: unit.and_then(|u| u.municipio_nome.clone()),
        publication_date: item
            .data_publicacao_pncp
            .as_deref()
            .and_then(|d| d.split('T').next())
            .filter(|d| !d.is_empty())
            .map(String::from),
        external_link: item
            .link_aviso_publicacao_pncp
            .clone()
            .filter(|l| !l.is_empty())
            .or_else(|| item.link_sistema_origem.clone())
            .filter(|l| !l.is_empty()),
        synced_at: Utc::now(),
    })
}

/// Normalize a page set, keeping arrival order and the first item seen for
/// each natural id.
pub fn normalize_all(items: &[Contratacao]) -> Vec<ProcurementRecord> {
    let mut seen = HashSet::new();
    items
        .iter()
        .filter_map(to_record)
        .filter(|r| seen.insert(r.id.clone()))
        .collect()
}

/// Resolve the collection window from CLI inputs.
///
/// - `start` given: `start..=end`, with `end` defaulting to `today`.
/// - `months_back` given: `today - floor(n × 30.5) days ..= today`.
/// - neither: first day of the current month through `today`.
pub fn resolve_window(
    start: Option<&str>,
    end: Option<&str>,
    months_back: Option<u32>,
    today: NaiveDate,
) -> Result<DateWindow> {
    if let Some(start) = start {
        let end = match end {
            Some(end) => parse_date(end)?,
            None => today,
        };
        return DateWindow::new(parse_date(start)?, end);
    }

    if let Some(months) = months_back.filter(|m| *m > 0) {
        let days = i64::from(months) * 61 / 2;
        return DateWindow::new(today - Duration::days(days), today);
    }

    let first = today.with_day(1).unwrap_or(today);
    DateWindow::new(first, today)
}
