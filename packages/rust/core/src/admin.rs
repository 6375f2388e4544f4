//! Operator maintenance: queue purge, default search seeding, diagnostics,
//! and re-queueing of failed tasks.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use licitai_shared::{Result, SearchDefinition, Stage, TaskStatus};
use licitai_storage::{StatusCount, Storage};
use tracing::{info, instrument, warn};

/// Rows deleted per purge statement.
pub const PURGE_CHUNK: usize = 200;

/// Terms listed by [`diagnose`].
pub const TOP_TERMS: usize = 30;

pub const DEFAULT_SEARCH_NAME: &str = "Pesquisa Estratégica de Software e Gatilhos v3";
pub const DEFAULT_SEARCH_OWNER: &str = "licitai-admin";

/// Keywords of the default search: office suites and licensing, hardware
/// purchases, contract renewals, and infrastructure projects.
pub const DEFAULT_SEARCH_KEYWORDS: &[&str] = &[
    "microsoft office",
    "office ltsc",
    "pacote de escritório",
    "suite de produtividade",
    "licença perpétua",
    "licenciamento de software",
    "google workspace",
    "office 365",
    "m365",
    "aquisição de computadores",
    "compra de notebooks",
    "estações de trabalho",
    "desktop",
    "microcomputadores",
    "equipamentos de informática",
    "parque tecnológico",
    "renovação de licenças",
    "software assurance",
    "enterprise agreement",
    "expiração de licença",
    "atualização de software",
    "suporte técnico de software",
    "regularização de licenças",
    "antivírus corporativo",
    "firewall",
    "servidor",
    "solução de backup",
    "storage",
    "segurança da informação",
    "infraestrutura de TI",
    "virtualização",
];

/// Generic procurement vocabulary left out of the term ranking.
static STOP_WORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "processo", "contratação", "edital", "serviços", "aquisição", "fornecimento", "preços",
        "registro", "futura", "eventual", "objetivo", "municipal", "prefeitura", "secretaria",
        "conforme", "município", "nº", "n.º", "para", "de", "do", "da", "dos", "das", "com",
        "sem", "sob", "por", "pelo", "pela",
    ]
    .into_iter()
    .collect()
});

/// Queue and corpus health snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnosis {
    pub records: u64,
    pub tasks: u64,
    pub by_status: Vec<StatusCount>,
    /// Most frequent classifier keywords, most common first.
    pub top_terms: Vec<(String, u64)>,
}

/// Delete every task, [`PURGE_CHUNK`] rows at a time. Returns the total.
#[instrument(skip_all)]
pub async fn purge_tasks(storage: &Storage) -> Result<u64> {
    let mut total = 0u64;
    loop {
        let deleted = storage.purge_tasks_chunk(PURGE_CHUNK).await?;
        if deleted == 0 {
            break;
        }
        total += deleted;
        info!(deleted, total, "purged task chunk");
    }
    info!(total, "task queue purged");
    Ok(total)
}

/// Create the default search definition unless one with the same name
/// exists. Returns `true` when it was created.
pub async fn ensure_default_search(storage: &Storage) -> Result<bool> {
    if let Some(existing) = storage.find_search_definition(DEFAULT_SEARCH_NAME).await? {
        info!(id = %existing.id, "default search definition already present");
        return Ok(false);
    }

    let def = SearchDefinition::new(DEFAULT_SEARCH_NAME, DEFAULT_SEARCH_OWNER, DEFAULT_SEARCH_KEYWORDS);
    storage.insert_search_definition(&def).await?;
    info!(id = %def.id, keywords = def.keywords.len(), "default search definition created");
    Ok(true)
}

/// Number of tasks waiting for analysis.
pub async fn pending_count(storage: &Storage) -> Result<u64> {
    storage.count_tasks_with_status(TaskStatus::Pending).await
}

/// Send a stage's failed tasks back to its source status.
pub async fn requeue_failed(storage: &Storage, stage: Stage) -> Result<u64> {
    let moved = storage.requeue_failed(stage).await?;
    if moved == 0 {
        warn!(%stage, "no failed tasks to requeue");
    } else {
        info!(%stage, moved, "failed tasks requeued");
    }
    Ok(moved)
}

/// Record and task counts, status distribution, and the most frequent
/// classifier keywords.
#[instrument(skip_all)]
pub async fn diagnose(storage: &Storage) -> Result<Diagnosis> {
    let records = storage.count_records().await?;
    let tasks = storage.count_tasks().await?;
    let by_status = storage.count_tasks_by_status().await?;

    let analysed = storage
        .list_tasks_in(&[
            TaskStatus::AnalysisDone,
            TaskStatus::Enriching,
            TaskStatus::EnrichmentDone,
            TaskStatus::EnrichmentFailed,
        ])
        .await?;
    let keywords = analysed
        .iter()
        .filter_map(|t| t.result.as_ref())
        .flat_map(|r| r.keywords.iter().map(String::as_str));

    Ok(Diagnosis {
        records,
        tasks,
        by_status,
        top_terms: rank_terms(keywords, TOP_TERMS),
    })
}

/// Lower-case, drop stop words and terms of three characters or fewer,
/// count, and keep the `limit` most frequent. Ties sort alphabetically.
pub fn rank_terms<'a>(terms: impl IntoIterator<Item = &'a str>, limit: usize) -> Vec<(String, u64)> {
    let mut counts: HashMap<String, u64> = HashMap::new();
    for term in terms {
        let term = term.trim().to_lowercase();
        if term.chars().count() <= 3 || STOP_WORDS.contains(term.as_str()) {
            continue;
        }
        *counts.entry(term).or_default() += 1;
    }

    let mut ranked: Vec<(String, u64)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(limit);
    ranked
}
