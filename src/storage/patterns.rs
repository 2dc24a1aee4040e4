//! Pattern catalog storage and in-memory snapshot.
//!
//! Patterns change rarely relative to scan volume, so the catalog is loaded
//! once per scan batch into an immutable snapshot keyed by pattern id. All
//! matches within a batch therefore reference a consistent catalog.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use regex::Regex;
use sqlx::{PgPool, Row};
use tracing::{debug, warn};

use crate::error::{Result, ScanError};

/// Compiled form of a pattern expression.
#[derive(Debug, Clone)]
pub enum CompiledExpr {
    /// Plain substring search.
    Literal(String),
    Regex(Regex),
}

/// A failure pattern from the catalog.
#[derive(Debug, Clone)]
pub struct Pattern {
    pub id: i64,
    pub expression: String,
    pub is_regex: bool,
    /// Persisted for schema compatibility; nothing consumes it.
    pub is_nondeterministic: bool,
    pub description: Option<String>,
    pub tags: BTreeSet<String>,
    /// Step names this pattern is restricted to; empty means universal.
    pub applicable_steps: BTreeSet<String>,
    pub specificity: i32,
    /// Retired patterns are excluded from best-match selection but keep
    /// their history.
    pub is_retired: bool,
    /// When set, the pattern is applied only to the last N lines of a log.
    pub lines_from_end: Option<i32>,
    compiled: CompiledExpr,
}

impl Pattern {
    /// Compile the expression. Regex failures surface as
    /// [`ScanError::PatternCompile`] so the caller can exclude the pattern.
    #[allow(clippy::too_many_arguments)]
    pub fn compile(
        id: i64,
        expression: String,
        is_regex: bool,
        is_nondeterministic: bool,
        description: Option<String>,
        tags: BTreeSet<String>,
        applicable_steps: BTreeSet<String>,
        specificity: i32,
        is_retired: bool,
        lines_from_end: Option<i32>,
    ) -> Result<Self> {
        let compiled = if is_regex {
            let regex = Regex::new(&expression)
                .map_err(|source| ScanError::PatternCompile { pattern_id: id, source })?;
            CompiledExpr::Regex(regex)
        } else {
            CompiledExpr::Literal(expression.clone())
        };

        Ok(Self {
            id,
            expression,
            is_regex,
            is_nondeterministic,
            description,
            tags,
            applicable_steps,
            specificity,
            is_retired,
            lines_from_end,
            compiled,
        })
    }

    pub fn compiled(&self) -> &CompiledExpr {
        &self.compiled
    }

    /// Whether the pattern applies to a build step. An empty applicability
    /// set matches any step name, including the empty string.
    pub fn applies_to(&self, step_name: &str) -> bool {
        self.applicable_steps.is_empty() || self.applicable_steps.contains(step_name)
    }
}

/// Immutable per-batch snapshot of the pattern catalog.
#[derive(Debug, Clone)]
pub struct PatternCatalog {
    patterns: BTreeMap<i64, Arc<Pattern>>,
    latest_id: i64,
}

impl PatternCatalog {
    /// Load all patterns with their tags and step applicability.
    ///
    /// Patterns whose expression fails to compile are excluded with a
    /// warning; no match can reference them, so match provenance holds.
    pub async fn load(pool: &PgPool) -> Result<Self> {
        let rows = sqlx::query(
            r#"
            SELECT id, expression, regex, has_nondeterministic_values,
                   description, specificity, is_retired, lines_from_end
            FROM patterns
            ORDER BY id
            "#,
        )
        .fetch_all(pool)
        .await?;

        let tag_rows = sqlx::query("SELECT pattern, tag FROM pattern_tags")
            .fetch_all(pool)
            .await?;
        let step_rows = sqlx::query("SELECT pattern, step_name FROM pattern_step_applicability")
            .fetch_all(pool)
            .await?;

        let mut tags: BTreeMap<i64, BTreeSet<String>> = BTreeMap::new();
        for row in tag_rows {
            tags.entry(row.get("pattern"))
                .or_default()
                .insert(row.get("tag"));
        }

        let mut steps: BTreeMap<i64, BTreeSet<String>> = BTreeMap::new();
        for row in step_rows {
            steps.entry(row.get("pattern"))
                .or_default()
                .insert(row.get("step_name"));
        }

        let mut patterns = BTreeMap::new();
        let mut latest_id = -1;

        for row in rows {
            let id: i64 = row.get("id");
            // The high-watermark must cover every persisted id, including
            // patterns excluded for compile errors.
            latest_id = latest_id.max(id);

            match Pattern::compile(
                id,
                row.get("expression"),
                row.get("regex"),
                row.get("has_nondeterministic_values"),
                row.get("description"),
                tags.remove(&id).unwrap_or_default(),
                steps.remove(&id).unwrap_or_default(),
                row.get("specificity"),
                row.get("is_retired"),
                row.get("lines_from_end"),
            ) {
                Ok(pattern) => {
                    patterns.insert(id, Arc::new(pattern));
                }
                Err(e) => {
                    warn!(pattern_id = id, error = %e, "excluding pattern from batch");
                }
            }
        }

        debug!(count = patterns.len(), latest_id, "loaded pattern catalog");

        Ok(Self { patterns, latest_id })
    }

    /// The maximum pattern id currently persisted, or -1 when the catalog is
    /// empty. Pattern ids are strictly increasing over time, so this value
    /// is a valid scan high-watermark.
    pub fn latest_id(&self) -> i64 {
        self.latest_id
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn get(&self, id: i64) -> Option<&Arc<Pattern>> {
        self.patterns.get(&id)
    }

    /// All patterns in id order.
    pub fn all(&self) -> Vec<Arc<Pattern>> {
        self.patterns.values().cloned().collect()
    }

    /// Patterns with id strictly greater than `watermark`, in id order.
    /// This is the pending set for a revisitable build.
    pub fn newer_than(&self, watermark: i64) -> Vec<Arc<Pattern>> {
        self.patterns
            .range(watermark + 1..)
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// Build a snapshot directly from patterns, bypassing the database.
    pub fn from_patterns(patterns: Vec<Pattern>) -> Self {
        let mut map = BTreeMap::new();
        let mut latest_id = -1;
        for pattern in patterns {
            latest_id = latest_id.max(pattern.id);
            map.insert(pattern.id, Arc::new(pattern));
        }
        Self {
            patterns: map,
            latest_id,
        }
    }
}

/// A pattern as submitted for insertion (the id is assigned by the catalog
/// sequence; identifiers are never reused).
#[derive(Debug, Clone)]
pub struct NewPattern {
    pub expression: String,
    pub is_regex: bool,
    pub is_nondeterministic: bool,
    pub description: Option<String>,
    pub tags: BTreeSet<String>,
    pub applicable_steps: BTreeSet<String>,
    pub specificity: i32,
    pub lines_from_end: Option<i32>,
    /// Recorded in pattern_authorship when present.
    pub author: Option<String>,
}

/// Insert a new pattern with its tag and applicability side tables.
/// Returns the assigned id.
pub async fn insert_pattern(pool: &PgPool, pattern: &NewPattern) -> Result<i64> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query(
        r#"
        INSERT INTO patterns
            (expression, regex, has_nondeterministic_values, description,
             specificity, is_retired, lines_from_end)
        VALUES ($1, $2, $3, $4, $5, false, $6)
        RETURNING id
        "#,
    )
    .bind(&pattern.expression)
    .bind(pattern.is_regex)
    .bind(pattern.is_nondeterministic)
    .bind(&pattern.description)
    .bind(pattern.specificity)
    .bind(pattern.lines_from_end)
    .fetch_one(&mut *tx)
    .await?;

    let id: i64 = row.get("id");

    for tag in &pattern.tags {
        sqlx::query("INSERT INTO pattern_tags (pattern, tag) VALUES ($1, $2)")
            .bind(id)
            .bind(tag)
            .execute(&mut *tx)
            .await?;
    }

    for step in &pattern.applicable_steps {
        sqlx::query("INSERT INTO pattern_step_applicability (pattern, step_name) VALUES ($1, $2)")
            .bind(id)
            .bind(step)
            .execute(&mut *tx)
            .await?;
    }

    if let Some(author) = &pattern.author {
        sqlx::query("INSERT INTO pattern_authorship (pattern, author) VALUES ($1, $2)")
            .bind(id)
            .bind(author)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(id)
}

/// Mark a pattern as retired. Retired patterns keep their match history but
/// lose best-match eligibility.
pub async fn retire_pattern(pool: &PgPool, pattern_id: i64) -> Result<()> {
    sqlx::query("UPDATE patterns SET is_retired = true WHERE id = $1")
        .bind(pattern_id)
        .execute(pool)
        .await?;
    Ok(())
}
