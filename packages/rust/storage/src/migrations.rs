//! SQL migration definitions for the Licitai database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: records, search_definitions, tasks",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Procurement records, keyed by normalized PNCP control number
CREATE TABLE IF NOT EXISTS records (
    id               TEXT PRIMARY KEY,
    description      TEXT,
    modality_name    TEXT,
    org_name         TEXT,
    region           TEXT,
    municipality     TEXT,
    publication_date TEXT,
    external_link    TEXT,
    synced_at        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_records_region ON records(region);

-- Keyword rule sets
CREATE TABLE IF NOT EXISTS search_definitions (
    id            TEXT PRIMARY KEY,
    name          TEXT NOT NULL,
    owner_id      TEXT NOT NULL,
    active        INTEGER NOT NULL DEFAULT 1,
    keywords_json TEXT NOT NULL,
    created_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_search_definitions_active ON search_definitions(active);
CREATE INDEX IF NOT EXISTS idx_search_definitions_name ON search_definitions(name);

-- Task queue / stage state machine
CREATE TABLE IF NOT EXISTS tasks (
    id                     TEXT PRIMARY KEY,
    record_id              TEXT NOT NULL,
    owner_id               TEXT NOT NULL,
    search_def_id          TEXT NOT NULL,
    status                 TEXT NOT NULL,
    created_at             TEXT NOT NULL,
    analysis_started_at    TEXT,
    analysis_finished_at   TEXT,
    result_json            TEXT,
    enrichment_started_at  TEXT,
    enrichment_finished_at TEXT,
    contacts_json          TEXT NOT NULL DEFAULT '[]',
    error_log              TEXT,
    updated_at             TEXT NOT NULL,
    UNIQUE(record_id, owner_id)
);

CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status, created_at);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
    ]
}
