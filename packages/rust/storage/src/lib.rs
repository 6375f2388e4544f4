//! libSQL storage layer (local file mode).
//!
//! The [`Storage`] struct wraps a libSQL database holding procurement
//! records, search definitions and the task queue. Every stage worker
//! process opens the same file; task status changes are conditional
//! updates so a stale writer never overwrites a newer status.
//!
//! **Access rules:**
//! - Collector, generator, workers, admin: read-write via [`Storage::open`]
//! - Reporter: read-only via [`Storage::open_readonly`]

mod migrations;
mod tasks;

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database, params};
use licitai_shared::{LicitaiError, ProcurementRecord, Result, SearchDefinition};

pub use tasks::{PairSet, StatusCount, TaskRow};

/// Milliseconds SQLite waits on a lock held by another worker process.
const BUSY_TIMEOUT_MS: u32 = 5000;

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LicitaiError::io(parent, e))?;
        }

        let storage = Self::connect(path, false).await?;
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(LicitaiError::Storage(format!(
                "database not found at {}",
                path.display()
            )));
        }
        Self::connect(path, true).await
    }

    async fn connect(path: &Path, readonly: bool) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| LicitaiError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| LicitaiError::Storage(e.to_string()))?;

        let mut pragma = conn
            .query(&format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}"), params![])
            .await
            .map_err(|e| LicitaiError::Storage(e.to_string()))?;
        pragma
            .next()
            .await
            .map_err(|e| LicitaiError::Storage(e.to_string()))?;
        drop(pragma);

        Ok(Self { db, conn, readonly })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        LicitaiError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    pub fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(LicitaiError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Record operations
    // -----------------------------------------------------------------------

    /// Whether a record with this natural id is already stored.
    pub async fn record_exists(&self, id: &str) -> Result<bool> {
        let mut rows = self
            .conn
            .query("SELECT 1 FROM records WHERE id = ?1", params![id])
            .await
            .map_err(|e| LicitaiError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(row) => Ok(row.is_some()),
            Err(e) => Err(LicitaiError::Storage(e.to_string())),
        }
    }

    /// Insert a record. Returns `false` when the id already exists; the
    /// stored record is left untouched.
    pub async fn insert_record(&self, record: &ProcurementRecord) -> Result<bool> {
        self.check_writable()?;
        let affected = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO records
                   (id, description, modality_name, org_name, region, municipality,
                    publication_date, external_link, synced_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.id.as_str(),
                    record.description.as_deref(),
                    record.modality_name.as_deref(),
                    record.org_name.as_deref(),
                    record.region.as_deref(),
                    record.municipality.as_deref(),
                    record.publication_date.as_deref(),
                    record.external_link.as_deref(),
                    format_timestamp(&record.synced_at),
                ],
            )
            .await
            .map_err(|e| LicitaiError::Storage(e.to_string()))?;
        Ok(affected > 0)
    }

    /// Get a record by natural id.
    pub async fn get_record(&self, id: &str) -> Result<Option<ProcurementRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, description, modality_name, org_name, region, municipality,
                        publication_date, external_link, synced_at
                 FROM records WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(|e| LicitaiError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_record(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(LicitaiError::Storage(e.to_string())),
        }
    }

    /// All records, oldest sync first.
    pub async fn list_records(&self) -> Result<Vec<ProcurementRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, description, modality_name, org_name, region, municipality,
                        publication_date, external_link, synced_at
                 FROM records ORDER BY synced_at, id",
                params![],
            )
            .await
            .map_err(|e| LicitaiError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| LicitaiError::Storage(e.to_string()))?
        {
            results.push(row_to_record(&row)?);
        }
        Ok(results)
    }

    /// Total stored records.
    pub async fn count_records(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM records").await
    }

    // -----------------------------------------------------------------------
    // Search definition operations
    // -----------------------------------------------------------------------

    /// Insert a search definition.
    pub async fn insert_search_definition(&self, def: &SearchDefinition) -> Result<()> {
        self.check_writable()?;
        let keywords_json =
            serde_json::to_string(&def.keywords).map_err(|e| LicitaiError::parse(e.to_string()))?;
        self.conn
            .execute(
                "INSERT INTO search_definitions (id, name, owner_id, active, keywords_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    def.id.as_str(),
                    def.name.as_str(),
                    def.owner_id.as_str(),
                    i64::from(def.active),
                    keywords_json,
                    format_timestamp(&def.created_at),
                ],
            )
            .await
            .map_err(|e| LicitaiError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Find a definition by its display name.
    pub async fn find_search_definition(&self, name: &str) -> Result<Option<SearchDefinition>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, owner_id, active, keywords_json, created_at
                 FROM search_definitions WHERE name = ?1 LIMIT 1",
                params![name],
            )
            .await
            .map_err(|e| LicitaiError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_search_definition(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(LicitaiError::Storage(e.to_string())),
        }
    }

    /// All definitions with `active = 1`, oldest first.
    pub async fn list_active_search_definitions(&self) -> Result<Vec<SearchDefinition>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, owner_id, active, keywords_json, created_at
                 FROM search_definitions WHERE active = 1 ORDER BY created_at, id",
                params![],
            )
            .await
            .map_err(|e| LicitaiError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| LicitaiError::Storage(e.to_string()))?
        {
            results.push(row_to_search_definition(&row)?);
        }
        Ok(results)
    }

    /// Enable or disable a definition.
    pub async fn set_search_definition_active(&self, id: &str, active: bool) -> Result<bool> {
        self.check_writable()?;
        let affected = self
            .conn
            .execute(
                "UPDATE search_definitions SET active = ?1 WHERE id = ?2",
                params![i64::from(active), id],
            )
            .await
            .map_err(|e| LicitaiError::Storage(e.to_string()))?;
        Ok(affected > 0)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Run a single-value `COUNT(*)` query.
    async fn count(&self, sql: &str) -> Result<u64> {
        let mut rows = self
            .conn
            .query(sql, params![])
            .await
            .map_err(|e| LicitaiError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row
                .get::<i64>(0)
                .map_err(|e| LicitaiError::Storage(e.to_string()))? as u64),
            Ok(None) => Ok(0),
            Err(e) => Err(LicitaiError::Storage(e.to_string())),
        }
    }
}

/// Fixed-width RFC 3339 so text ordering matches time ordering.
pub(crate) fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 column value.
pub(crate) fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LicitaiError::data_integrity(format!("invalid timestamp '{s}': {e}")))
}

fn row_to_record(row: &libsql::Row) -> Result<ProcurementRecord> {
    Ok(ProcurementRecord {
        id: row
            .get::<String>(0)
            .map_err(|e| LicitaiError::Storage(e.to_string()))?,
        description: row.get::<String>(1).ok(),
        modality_name: row.get::<String>(2).ok(),
        org_name: row.get::<String>(3).ok(),
        region: row.get::<String>(4).ok(),
        municipality: row.get::<String>(5).ok(),
        publication_date: row.get::<String>(6).ok(),
        external_link: row.get::<String>(7).ok(),
        synced_at: {
            let s: String = row
                .get(8)
                .map_err(|e| LicitaiError::Storage(e.to_string()))?;
            parse_timestamp(&s)?
        },
    })
}

fn row_to_search_definition(row: &libsql::Row) -> Result<SearchDefinition> {
    let keywords_json: String = row
        .get(4)
        .map_err(|e| LicitaiError::Storage(e.to_string()))?;
    let keywords: Vec<String> = serde_json::from_str(&keywords_json)
        .map_err(|e| LicitaiError::data_integrity(format!("invalid keywords_json: {e}")))?;
    let created_at: String = row
        .get(5)
        .map_err(|e| LicitaiError::Storage(e.to_string()))?;

    Ok(SearchDefinition {
        id: row
            .get::<String>(0)
            .map_err(|e| LicitaiError::Storage(e.to_string()))?,
        name: row
            .get::<String>(1)
            .map_err(|e| LicitaiError::Storage(e.to_string()))?,
        owner_id: row
            .get::<String>(2)
            .map_err(|e| LicitaiError::Storage(e.to_string()))?,
        active: row
            .get::<i64>(3)
            .map_err(|e| LicitaiError::Storage(e.to_string()))?
            != 0,
        keywords,
        created_at: parse_timestamp(&created_at)?,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use uuid::Uuid;

    pub async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("licitai_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    pub fn record(id: &str, description: &str) -> ProcurementRecord {
        ProcurementRecord {
            id: id.into(),
            description: Some(description.into()),
            modality_name: Some("Pregão - Eletrônico".into()),
            org_name: Some("Prefeitura Municipal de Campinas".into()),
            region: Some("SP".into()),
            municipality: Some("Campinas".into()),
            publication_date: Some("2024-05-02".into()),
            external_link: Some("https://pncp.gov.br/app/editais/1".into()),
            synced_at: Utc::now(),
        }
    }
}
