//! PostgreSQL persistence.
//!
//! Owns the schema bootstrap and the row-level reads and writes the scan
//! engine performs. The pool is passed explicitly to every component; the
//! engine holds no long-lived caches other than the per-batch pattern
//! snapshot.

use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::{Postgres, Row, Transaction};
use tracing::info;

use crate::cache::LogStats;
use crate::error::Result;
use crate::matcher::LineMatch;

pub mod patterns;
pub mod planner;

pub use patterns::{NewPattern, Pattern, PatternCatalog};

/// Contract schema. Table and column names are preserved for compatibility
/// with the read-only projections that sit on the same database.
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS builds (
    build_num BIGINT PRIMARY KEY,
    vcs_revision CHAR(40),
    queued_at TIMESTAMPTZ,
    job_name TEXT,
    branch VARCHAR
);

CREATE TABLE IF NOT EXISTS build_steps (
    id BIGSERIAL PRIMARY KEY,
    build BIGINT NOT NULL REFERENCES builds(build_num),
    name TEXT,
    is_timeout BOOLEAN NOT NULL DEFAULT false,
    UNIQUE (build, name)
);

CREATE TABLE IF NOT EXISTS patterns (
    id BIGSERIAL PRIMARY KEY,
    expression TEXT NOT NULL,
    regex BOOLEAN NOT NULL DEFAULT false,
    has_nondeterministic_values BOOLEAN NOT NULL DEFAULT false,
    description TEXT,
    specificity INT NOT NULL DEFAULT 1,
    is_retired BOOLEAN NOT NULL DEFAULT false,
    lines_from_end INT
);

CREATE TABLE IF NOT EXISTS pattern_tags (
    pattern BIGINT NOT NULL REFERENCES patterns(id) ON DELETE CASCADE,
    tag TEXT NOT NULL,
    PRIMARY KEY (pattern, tag)
);

CREATE TABLE IF NOT EXISTS pattern_step_applicability (
    pattern BIGINT NOT NULL REFERENCES patterns(id) ON DELETE CASCADE,
    step_name TEXT NOT NULL,
    PRIMARY KEY (pattern, step_name)
);

CREATE TABLE IF NOT EXISTS pattern_authorship (
    pattern BIGINT PRIMARY KEY REFERENCES patterns(id) ON DELETE CASCADE,
    author TEXT NOT NULL,
    created TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS scans (
    id BIGSERIAL PRIMARY KEY,
    timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    latest_pattern_id BIGINT REFERENCES patterns(id)
);

CREATE TABLE IF NOT EXISTS matches (
    id BIGSERIAL PRIMARY KEY,
    build_step BIGINT NOT NULL REFERENCES build_steps(id),
    pattern BIGINT NOT NULL REFERENCES patterns(id),
    line_number INT NOT NULL,
    line_text TEXT NOT NULL,
    span_start INT NOT NULL,
    span_end INT NOT NULL,
    scan_id BIGINT NOT NULL REFERENCES scans(id)
);

CREATE TABLE IF NOT EXISTS log_metadata (
    step BIGINT PRIMARY KEY REFERENCES build_steps(id),
    line_count INT NOT NULL,
    byte_count INT NOT NULL,
    content TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS scanned_patterns (
    scan BIGINT NOT NULL REFERENCES scans(id),
    newest_pattern BIGINT NOT NULL REFERENCES patterns(id),
    build BIGINT NOT NULL REFERENCES builds(build_num),
    PRIMARY KEY (scan, newest_pattern, build)
);

CREATE INDEX IF NOT EXISTS idx_build_steps_build ON build_steps(build);
CREATE INDEX IF NOT EXISTS idx_matches_build_step ON matches(build_step);
CREATE INDEX IF NOT EXISTS idx_matches_pattern ON matches(pattern);
CREATE INDEX IF NOT EXISTS idx_scanned_patterns_build ON scanned_patterns(build);
"#;

/// Handle to the engine's database.
#[derive(Debug, Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect a pool. `max_connections` caps process-level DB concurrency;
    /// each worker holds at most one connection at a time.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the contract schema (idempotent).
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        info!("schema initialized");
        Ok(())
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    /// Row counts for status reporting.
    pub async fn counts(&self) -> Result<TableCounts> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM builds) AS builds,
                (SELECT COUNT(*) FROM build_steps) AS build_steps,
                (SELECT COUNT(*) FROM patterns) AS patterns,
                (SELECT COUNT(*) FROM matches) AS matches,
                (SELECT COUNT(*) FROM scans) AS scans
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(TableCounts {
            builds: row.get("builds"),
            build_steps: row.get("build_steps"),
            patterns: row.get("patterns"),
            matches: row.get("matches"),
            scans: row.get("scans"),
        })
    }
}

/// Row counts across the contract tables.
#[derive(Debug, Clone, Copy)]
pub struct TableCounts {
    pub builds: i64,
    pub build_steps: i64,
    pub patterns: i64,
    pub matches: i64,
    pub scans: i64,
}

/// A build as ingested from upstream.
#[derive(Debug, Clone)]
pub struct NewBuild {
    pub build_num: i64,
    pub vcs_revision: String,
    pub queued_at: Option<chrono::DateTime<chrono::Utc>>,
    pub job_name: String,
    pub branch: Option<String>,
}

/// Insert a build row. Builds are immutable after ingest, so a re-ingest of
/// the same build number is a no-op.
pub async fn insert_build(pool: &PgPool, build: &NewBuild) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO builds (build_num, vcs_revision, queued_at, job_name, branch)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (build_num) DO NOTHING
        "#,
    )
    .bind(build.build_num)
    .bind(&build.vcs_revision)
    .bind(build.queued_at)
    .bind(&build.job_name)
    .bind(&build.branch)
    .execute(pool)
    .await?;
    Ok(())
}

/// Open a scan record. `latest_pattern_id` is NULL while the catalog is
/// empty (there is no pattern row to reference).
pub async fn insert_scan(pool: &PgPool, latest_pattern_id: i64) -> Result<i64> {
    let latest = (latest_pattern_id >= 0).then_some(latest_pattern_id);
    let row = sqlx::query("INSERT INTO scans (latest_pattern_id) VALUES ($1) RETURNING id")
        .bind(latest)
        .fetch_one(pool)
        .await?;
    Ok(row.get("id"))
}

/// Find or insert the failing-step row for a build.
///
/// `UNIQUE (build, name)` does not cover NULL names (an idiopathic build),
/// so the lookup uses IS NOT DISTINCT FROM and the whole call stays
/// idempotent under retries and concurrent writers.
pub async fn find_or_insert_step(
    conn: &mut PgConnection,
    build_num: i64,
    step_name: Option<&str>,
    is_timeout: bool,
) -> Result<i64> {
    let existing = sqlx::query(
        "SELECT id FROM build_steps WHERE build = $1 AND name IS NOT DISTINCT FROM $2",
    )
    .bind(build_num)
    .bind(step_name)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(row) = existing {
        return Ok(row.get("id"));
    }

    let row = sqlx::query(
        "INSERT INTO build_steps (build, name, is_timeout) VALUES ($1, $2, $3) RETURNING id",
    )
    .bind(build_num)
    .bind(step_name)
    .bind(is_timeout)
    .fetch_one(&mut *conn)
    .await?;

    Ok(row.get("id"))
}

/// Insert the log row for a step within a transaction. At most one log per
/// step; a concurrent writer's row wins silently.
pub async fn insert_log_metadata(
    conn: &mut PgConnection,
    step_id: i64,
    stats: LogStats,
    content: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO log_metadata (step, line_count, byte_count, content)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (step) DO NOTHING
        "#,
    )
    .bind(step_id)
    .bind(stats.line_count)
    .bind(stats.byte_count)
    .bind(content)
    .execute(conn)
    .await?;
    Ok(())
}

/// Pool-level variant of [`insert_log_metadata`], used when rehydrating the
/// database tier from a cached file.
pub async fn ensure_log_metadata(
    pool: &PgPool,
    step_id: i64,
    stats: LogStats,
    content: &str,
) -> Result<()> {
    let mut conn = pool.acquire().await?;
    insert_log_metadata(&mut conn, step_id, stats, content).await
}

/// Read back the stored log text for a step.
pub async fn log_content(pool: &PgPool, step_id: i64) -> Result<Option<String>> {
    let row = sqlx::query("SELECT content FROM log_metadata WHERE step = $1")
        .bind(step_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| r.get("content")))
}

/// Persist matcher output for a step, stamped with the batch's scan id.
/// Match rows are never mutated afterwards.
pub async fn insert_matches(
    conn: &mut PgConnection,
    build_step: i64,
    scan_id: i64,
    matches: &[LineMatch],
) -> Result<()> {
    for m in matches {
        sqlx::query(
            r#"
            INSERT INTO matches
                (build_step, pattern, line_number, line_text, span_start, span_end, scan_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(build_step)
        .bind(m.pattern_id)
        .bind(m.line_index as i32)
        .bind(&m.line_text)
        .bind(m.span_start as i32)
        .bind(m.span_end as i32)
        .bind(scan_id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Record the scan high-watermark for a build: the assertion that the build
/// has been evaluated against every pattern with id <= `newest_pattern_id`.
pub async fn upsert_scanned_pattern(
    conn: &mut PgConnection,
    scan_id: i64,
    newest_pattern_id: i64,
    build_num: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO scanned_patterns (scan, newest_pattern, build)
        VALUES ($1, $2, $3)
        ON CONFLICT (scan, newest_pattern, build) DO NOTHING
        "#,
    )
    .bind(scan_id)
    .bind(newest_pattern_id)
    .bind(build_num)
    .execute(conn)
    .await?;
    Ok(())
}

/// The best pattern match selected for a build.
#[derive(Debug, Clone)]
pub struct BestMatch {
    pub match_id: i64,
    pub pattern_id: i64,
    pub build_step: i64,
    pub line_number: i32,
    pub line_text: String,
    pub span_start: i32,
    pub span_end: i32,
}

/// Deterministic best-match projection for a build: specificity DESC,
/// is_retired ASC, is_regex ASC, pattern id DESC.
pub async fn best_match_for_build(pool: &PgPool, build_num: i64) -> Result<Option<BestMatch>> {
    let row = sqlx::query(
        r#"
        SELECT m.id, m.pattern, m.build_step, m.line_number, m.line_text,
               m.span_start, m.span_end
        FROM matches m
        JOIN patterns p ON p.id = m.pattern
        JOIN build_steps s ON s.id = m.build_step
        WHERE s.build = $1
        ORDER BY p.specificity DESC, p.is_retired ASC, p.regex ASC, p.id DESC
        LIMIT 1
        "#,
    )
    .bind(build_num)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| BestMatch {
        match_id: r.get("id"),
        pattern_id: r.get("pattern"),
        build_step: r.get("build_step"),
        line_number: r.get("line_number"),
        line_text: r.get("line_text"),
        span_start: r.get("span_start"),
        span_end: r.get("span_end"),
    }))
}
