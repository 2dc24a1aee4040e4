//! Scan planning queries.
//!
//! Two work queues drive a batch: builds never inspected, and builds whose
//! log must be rescanned because patterns newer than their high-watermark
//! exist. Pattern-id monotonicity reduces "which patterns are still pending
//! for this build" to an integer comparison against the stored watermark.

use sqlx::{PgPool, Row};

use crate::error::Result;

/// A previously visited build with patterns still pending.
#[derive(Debug, Clone)]
pub struct RevisitableBuild {
    pub step_id: i64,
    pub step_name: String,
    pub build_num: i64,
    /// Largest pattern id already evaluated for this build; -1 when no
    /// scanned_patterns row exists. Pending patterns are those with a
    /// strictly greater id.
    pub max_scanned: i64,
}

/// Builds with no build_steps row yet, newest first. `limit` caps the queue;
/// a whitelist restricts it to the given build numbers.
pub async fn unvisited_builds(
    pool: &PgPool,
    limit: Option<i64>,
    whitelist: Option<&[i64]>,
) -> Result<Vec<i64>> {
    let rows = match whitelist {
        Some(builds) => {
            sqlx::query(
                r#"
                SELECT b.build_num
                FROM builds b
                WHERE NOT EXISTS (SELECT 1 FROM build_steps s WHERE s.build = b.build_num)
                  AND b.build_num = ANY($1)
                ORDER BY b.build_num DESC
                LIMIT $2
                "#,
            )
            .bind(builds)
            .bind(limit.unwrap_or(i64::MAX))
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(
                r#"
                SELECT b.build_num
                FROM builds b
                WHERE NOT EXISTS (SELECT 1 FROM build_steps s WHERE s.build = b.build_num)
                ORDER BY b.build_num DESC
                LIMIT $1
                "#,
            )
            .bind(limit.unwrap_or(i64::MAX))
            .fetch_all(pool)
            .await?
        }
    };

    Ok(rows.iter().map(|r| r.get("build_num")).collect())
}

/// Visited builds whose high-watermark trails `latest_pattern_id`, newest
/// first. Timeout steps and idiopathic builds are excluded: they have no
/// log to rescan.
pub async fn revisitable_builds(
    pool: &PgPool,
    latest_pattern_id: i64,
    whitelist: Option<&[i64]>,
) -> Result<Vec<RevisitableBuild>> {
    let rows = match whitelist {
        Some(builds) => {
            sqlx::query(
                r#"
                SELECT s.id AS step_id, s.name AS step_name, s.build AS build_num,
                       COALESCE(MAX(sp.newest_pattern), -1) AS max_scanned
                FROM build_steps s
                LEFT JOIN scanned_patterns sp ON sp.build = s.build
                WHERE s.name IS NOT NULL AND NOT s.is_timeout
                  AND s.build = ANY($2)
                GROUP BY s.id, s.name, s.build
                HAVING COALESCE(MAX(sp.newest_pattern), -1) < $1
                ORDER BY s.build DESC
                "#,
            )
            .bind(latest_pattern_id)
            .bind(builds)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(
                r#"
                SELECT s.id AS step_id, s.name AS step_name, s.build AS build_num,
                       COALESCE(MAX(sp.newest_pattern), -1) AS max_scanned
                FROM build_steps s
                LEFT JOIN scanned_patterns sp ON sp.build = s.build
                WHERE s.name IS NOT NULL AND NOT s.is_timeout
                GROUP BY s.id, s.name, s.build
                HAVING COALESCE(MAX(sp.newest_pattern), -1) < $1
                ORDER BY s.build DESC
                "#,
            )
            .bind(latest_pattern_id)
            .fetch_all(pool)
            .await?
        }
    };

    Ok(rows
        .iter()
        .map(|r| RevisitableBuild {
            step_id: r.get("step_id"),
            step_name: r.get("step_name"),
            build_num: r.get("build_num"),
            max_scanned: r.get("max_scanned"),
        })
        .collect())
}
