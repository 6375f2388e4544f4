//! Core domain types: procurement records, search definitions, tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LicitaiError;

// ---------------------------------------------------------------------------
// TaskId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for task identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Generate a new time-sortable task identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// ProcurementRecord
// ---------------------------------------------------------------------------

/// A procurement notice discovered on PNCP. Append-only once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcurementRecord {
    /// Natural key: the PNCP control number with `/` replaced by `-`.
    pub id: String,
    /// Object of the purchase (`objetoCompra`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modality_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_name: Option<String>,
    /// Federative unit (UF).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub municipality: Option<String>,
    /// `YYYY-MM-DD`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publication_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_link: Option<String>,
    pub synced_at: DateTime<Utc>,
}

impl ProcurementRecord {
    /// Description text, or a data-integrity error when absent or blank.
    pub fn require_description(&self) -> Result<&str, LicitaiError> {
        require(&self.description, "description", &self.id)
    }

    /// Organization name, or a data-integrity error when absent or blank.
    pub fn require_org_name(&self) -> Result<&str, LicitaiError> {
        require(&self.org_name, "org_name", &self.id)
    }

    /// Municipality, or a data-integrity error when absent or blank.
    pub fn require_municipality(&self) -> Result<&str, LicitaiError> {
        require(&self.municipality, "municipality", &self.id)
    }
}

fn require<'a>(
    field: &'a Option<String>,
    name: &str,
    record_id: &str,
) -> Result<&'a str, LicitaiError> {
    field
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            LicitaiError::data_integrity(format!("record {record_id} is missing {name}"))
        })
}

// ---------------------------------------------------------------------------
// SearchDefinition
// ---------------------------------------------------------------------------

/// A saved keyword rule set owned by one client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchDefinition {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    pub active: bool,
    /// Ordered, no duplicates. Matching checks them in this order.
    pub keywords: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl SearchDefinition {
    /// Build a new active definition, dropping blank and repeated keywords.
    pub fn new(name: impl Into<String>, owner_id: impl Into<String>, keywords: &[&str]) -> Self {
        let mut ordered: Vec<String> = Vec::with_capacity(keywords.len());
        for kw in keywords {
            let kw = kw.trim();
            if !kw.is_empty() && !ordered.iter().any(|k| k == kw) {
                ordered.push(kw.to_string());
            }
        }

        Self {
            id: Uuid::now_v7().to_string(),
            name: name.into(),
            owner_id: owner_id.into(),
            active: true,
            keywords: ordered,
            created_at: Utc::now(),
        }
    }

    /// A definition without an owner or keywords never produces tasks.
    pub fn is_usable(&self) -> bool {
        !self.owner_id.trim().is_empty() && !self.keywords.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Task state machine
// ---------------------------------------------------------------------------

/// Pipeline stage driven by a stage worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Analysis,
    Enrichment,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Analysis => f.write_str("analysis"),
            Self::Enrichment => f.write_str("enrichment"),
        }
    }
}

/// Task status. The string literals are the on-disk contract shared by
/// every worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    Analyzing,
    AnalysisDone,
    AnalysisFailed,
    Enriching,
    EnrichmentDone,
    EnrichmentFailed,
    InsufficientData,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 8] = [
        Self::Pending,
        Self::Analyzing,
        Self::AnalysisDone,
        Self::AnalysisFailed,
        Self::Enriching,
        Self::EnrichmentDone,
        Self::EnrichmentFailed,
        Self::InsufficientData,
    ];

    /// Statuses no worker moves a task out of.
    pub const TERMINAL: [TaskStatus; 4] = [
        Self::EnrichmentDone,
        Self::AnalysisFailed,
        Self::EnrichmentFailed,
        Self::InsufficientData,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Analyzing => "analyzing",
            Self::AnalysisDone => "analysis-done",
            Self::AnalysisFailed => "analysis-failed",
            Self::Enriching => "enriching",
            Self::EnrichmentDone => "enrichment-done",
            Self::EnrichmentFailed => "enrichment-failed",
            Self::InsufficientData => "insufficient-data",
        }
    }

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::Analyzing | Self::Enriching)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = LicitaiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| LicitaiError::data_integrity(format!("unknown task status '{s}'")))
    }
}

/// Classifier output stored on a task.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AnalysisResult {
    #[serde(default)]
    pub keywords: Vec<String>,
    pub sales_trigger: String,
}

/// An e-mail contact found during enrichment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// Lower-cased.
    pub email: String,
    pub source_url: String,
    pub snippet: String,
}

/// Payload a stage worker writes when a task succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutput {
    Analysis(AnalysisResult),
    Enrichment(Vec<Contact>),
}

/// One unit of pipeline work: a (record, owner) match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub record_id: String,
    pub owner_id: String,
    pub search_def_id: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<AnalysisResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrichment_started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrichment_finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub contacts: Vec<Contact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_log: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// A fresh `pending` task for a matched (record, definition) pair.
    pub fn pending(record_id: &str, definition: &SearchDefinition) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            record_id: record_id.to_string(),
            owner_id: definition.owner_id.clone(),
            search_def_id: definition.id.clone(),
            status: TaskStatus::Pending,
            created_at: now,
            analysis_started_at: None,
            analysis_finished_at: None,
            result: None,
            enrichment_started_at: None,
            enrichment_finished_at: None,
            contacts: Vec::new(),
            error_log: None,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_roundtrip() {
        let id = TaskId::new();
        let parsed: TaskId = id.to_string().parse().expect("parse TaskId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn status_literals_roundtrip() {
        for status in TaskStatus::ALL {
            let parsed: TaskStatus = status.as_str().parse().expect("parse status");
            assert_eq!(parsed, status);
            let json = serde_json::to_string(&status).expect("serialize");
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
    }

    #[test]
    fn unknown_status_is_data_integrity() {
        let err = "analise_concluida".parse::<TaskStatus>().unwrap_err();
        assert!(err.is_data_integrity());
    }

    #[test]
    fn terminal_and_in_progress_sets() {
        assert!(TaskStatus::EnrichmentDone.is_terminal());
        assert!(TaskStatus::InsufficientData.is_terminal());
        assert!(!TaskStatus::AnalysisDone.is_terminal());
        assert!(TaskStatus::Enriching.is_in_progress());
        assert!(!TaskStatus::Pending.is_in_progress());
    }

    #[test]
    fn definition_keywords_are_ordered_and_unique() {
        let def = SearchDefinition::new("ti", "owner-1", &["servidor", " ", "firewall", "servidor"]);
        assert_eq!(def.keywords, vec!["servidor", "firewall"]);
        assert!(def.is_usable());

        let ownerless = SearchDefinition::new("ti", "", &["servidor"]);
        assert!(!ownerless.is_usable());
    }

    #[test]
    fn record_required_fields() {
        let record = ProcurementRecord {
            id: "123-1-000001-2024".into(),
            description: Some("Aquisição de servidor".into()),
            modality_name: None,
            org_name: Some("  ".into()),
            region: Some("SP".into()),
            municipality: None,
            publication_date: None,
            external_link: None,
            synced_at: Utc::now(),
        };
        assert_eq!(record.require_description().expect("desc"), "Aquisição de servidor");
        assert!(record.require_org_name().unwrap_err().is_data_integrity());
        assert!(record.require_municipality().is_err());
    }

    #[test]
    fn pending_task_copies_definition_owner() {
        let def = SearchDefinition::new("ti", "owner-1", &["servidor"]);
        let task = Task::pending("rec-1", &def);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.owner_id, "owner-1");
        assert_eq!(task.search_def_id, def.id);
        assert!(task.contacts.is_empty());
    }
}
