//! SQL migration definitions for the ditta database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed within a transaction.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: companies, job_log, dead_letters",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Enriched company records. record_json is the immutable input,
-- result_json the latest merged enrichment result.
CREATE TABLE IF NOT EXISTS companies (
    id             TEXT PRIMARY KEY,
    correlation_id TEXT NOT NULL,
    name           TEXT NOT NULL,
    city           TEXT NOT NULL,
    record_json    TEXT NOT NULL,
    result_json    TEXT NOT NULL,
    updated_at     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_companies_correlation ON companies(correlation_id);

-- Per-job audit trail: one row per attempt outcome.
CREATE TABLE IF NOT EXISTS job_log (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id         TEXT NOT NULL,
    correlation_id TEXT NOT NULL,
    status         TEXT NOT NULL,
    duration_ms    INTEGER NOT NULL,
    reason_code    TEXT,
    logged_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_job_log_job ON job_log(job_id);
CREATE INDEX IF NOT EXISTS idx_job_log_correlation ON job_log(correlation_id);

-- Jobs that exhausted all retry attempts. Inspectable, never auto-retried.
CREATE TABLE IF NOT EXISTS dead_letters (
    job_id         TEXT PRIMARY KEY,
    correlation_id TEXT NOT NULL,
    record_json    TEXT NOT NULL,
    reason_code    TEXT NOT NULL,
    history_json   TEXT NOT NULL,
    dead_at        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_dead_letters_correlation ON dead_letters(correlation_id);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
