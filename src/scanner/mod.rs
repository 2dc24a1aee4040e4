//! Scan coordinator.
//!
//! Drains the planner's two work queues for one batch:
//! - revisitable builds get their cached log rescanned against patterns
//!   newer than their high-watermark;
//! - unvisited builds get metadata fetched, their failing step classified,
//!   and (when scannable) their log downloaded and scanned in full.
//!
//! Per-build persistence commits in one transaction before the next build
//! starts, so an interrupted batch resumes where it left off. Builds are
//! independent work items; a bounded worker pool runs them concurrently
//! while preserving the planner's newest-first order.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{info, warn};

use crate::cache::{LogCache, LogStats};
use crate::config::Config;
use crate::error::Result;
use crate::matcher::{scan_lines, split_lines};
use crate::provider::{failing_step, BuildSource, CiClient, FailingStep};
use crate::storage::planner::{self, RevisitableBuild};
use crate::storage::{self, Database, PatternCatalog};

/// Which builds a batch works on.
#[derive(Debug, Clone)]
pub enum ScanPolicy {
    /// Process up to `n` unvisited builds plus all revisitable builds.
    FetchLimit(usize),
    /// Restrict both queues to the given build numbers.
    Whitelist(HashSet<i64>),
}

/// Cooperative cancellation flag, checked between builds. In-flight builds
/// finish their current external call and persist before exiting.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Summary of one scan batch.
#[derive(Debug, Clone, Default)]
pub struct BatchStats {
    pub scan_id: i64,
    pub latest_pattern_id: i64,
    pub builds_visited: usize,
    pub builds_revisited: usize,
    pub matches_inserted: usize,
    pub timeouts: usize,
    pub idiopathic: usize,
    pub no_log: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub duration_ms: u128,
}

/// Outcome of one build's processing.
enum BuildOutcome {
    Scanned { matches: usize },
    Rescanned { matches: usize },
    Timeout,
    Idiopathic,
    NoLog,
    Skipped,
    Cancelled,
}

/// Top-level orchestrator for scan batches.
pub struct ScanEngine {
    db: Database,
    cache: LogCache,
    source: Arc<dyn BuildSource>,
    worker_count: usize,
    cancel: CancelFlag,
}

impl ScanEngine {
    pub fn new(
        db: Database,
        cache: LogCache,
        source: Arc<dyn BuildSource>,
        worker_count: usize,
    ) -> Self {
        Self {
            db,
            cache,
            source,
            worker_count: worker_count.max(1),
            cancel: CancelFlag::new(),
        }
    }

    /// Wire up an engine from configuration: pool, cache directory, and a
    /// real CI client with the configured request timeout.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let db = Database::connect(&config.database_url, config.worker_count as u32 + 1).await?;
        let cache = LogCache::new(&config.cache_dir);
        let source = Arc::new(CiClient::new(
            &config.ci_base_url,
            std::time::Duration::from_secs(config.request_timeout_secs),
        )?);
        Ok(Self::new(db, cache, source, config.worker_count))
    }

    /// The flag a signal handler should set to stop the batch between
    /// builds.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Run one scan batch under the given policy.
    ///
    /// Only catalog-load and database-connectivity failures abort the
    /// batch; everything else is recovered at the per-build boundary.
    pub async fn scan_batch(&self, policy: &ScanPolicy) -> Result<BatchStats> {
        let start = Instant::now();

        let catalog = PatternCatalog::load(self.db.pool()).await?;
        let scan_id = storage::insert_scan(self.db.pool(), catalog.latest_id()).await?;
        info!(
            scan_id,
            latest_pattern_id = catalog.latest_id(),
            patterns = catalog.len(),
            "opened scan batch"
        );

        let whitelist: Option<Vec<i64>> = match policy {
            ScanPolicy::Whitelist(set) => Some(set.iter().copied().collect()),
            ScanPolicy::FetchLimit(_) => None,
        };
        let fetch_limit = match policy {
            ScanPolicy::FetchLimit(n) => Some(*n as i64),
            ScanPolicy::Whitelist(_) => None,
        };

        let revisits =
            planner::revisitable_builds(self.db.pool(), catalog.latest_id(), whitelist.as_deref())
                .await?;
        info!(count = revisits.len(), "revisitable builds queued");

        let revisit_outcomes: Vec<BuildOutcome> = stream::iter(revisits)
            .map(|build| self.process_revisit(&catalog, scan_id, build))
            .buffered(self.worker_count)
            .try_collect()
            .await?;

        let unvisited =
            planner::unvisited_builds(self.db.pool(), fetch_limit, whitelist.as_deref()).await?;
        info!(count = unvisited.len(), "unvisited builds queued");

        let visit_outcomes: Vec<BuildOutcome> = stream::iter(unvisited)
            .map(|build_num| self.process_visit(&catalog, scan_id, build_num))
            .buffered(self.worker_count)
            .try_collect()
            .await?;

        let mut stats = BatchStats {
            scan_id,
            latest_pattern_id: catalog.latest_id(),
            duration_ms: start.elapsed().as_millis(),
            ..Default::default()
        };

        for outcome in &revisit_outcomes {
            if let BuildOutcome::Rescanned { matches } = outcome {
                stats.builds_revisited += 1;
                stats.matches_inserted += matches;
            } else {
                stats.tally_terminal(outcome);
            }
        }
        for outcome in &visit_outcomes {
            if let BuildOutcome::Scanned { matches } = outcome {
                stats.builds_visited += 1;
                stats.matches_inserted += matches;
            } else {
                stats.tally_terminal(outcome);
            }
        }

        info!(
            scan_id,
            visited = stats.builds_visited,
            revisited = stats.builds_revisited,
            matches = stats.matches_inserted,
            skipped = stats.skipped,
            duration_ms = stats.duration_ms as u64,
            "scan batch complete"
        );

        Ok(stats)
    }

    /// Rescan a visited build against its pending pattern subset.
    async fn process_revisit(
        &self,
        catalog: &PatternCatalog,
        scan_id: i64,
        build: RevisitableBuild,
    ) -> Result<BuildOutcome> {
        if self.cancel.is_cancelled() {
            return Ok(BuildOutcome::Cancelled);
        }

        let pending = catalog.newer_than(build.max_scanned);
        let Some(newest) = pending.last().map(|p| p.id) else {
            return Ok(BuildOutcome::Skipped);
        };

        // Applicability is evaluated per build; the watermark still covers
        // the full pending range because inapplicable patterns are vacuously
        // evaluated.
        let applicable: Vec<_> = pending
            .iter()
            .filter(|p| p.applies_to(&build.step_name))
            .cloned()
            .collect();

        let text = match self
            .cache
            .get_or_fetch(
                &self.db,
                self.source.as_ref(),
                build.build_num,
                build.step_id,
                None,
            )
            .await
        {
            Ok(text) => text,
            Err(e) if e.is_per_build() => {
                warn!(build_num = build.build_num, error = %e, "skipping revisit");
                return Ok(BuildOutcome::Skipped);
            }
            Err(e) => return Err(e),
        };

        let lines = split_lines(&text);
        let matches = scan_lines(&lines, &applicable);

        let mut tx = self.db.begin().await?;
        storage::insert_matches(&mut tx, build.step_id, scan_id, &matches).await?;
        storage::upsert_scanned_pattern(&mut tx, scan_id, newest, build.build_num).await?;
        tx.commit().await?;

        info!(
            build_num = build.build_num,
            pending = pending.len(),
            matches = matches.len(),
            newest_pattern = newest,
            "revisited build"
        );

        Ok(BuildOutcome::Rescanned {
            matches: matches.len(),
        })
    }

    /// First visitation of a build: classify the failing step, acquire the
    /// log when scannable, scan against the whole applicable catalog.
    async fn process_visit(
        &self,
        catalog: &PatternCatalog,
        scan_id: i64,
        build_num: i64,
    ) -> Result<BuildOutcome> {
        if self.cancel.is_cancelled() {
            return Ok(BuildOutcome::Cancelled);
        }

        let payload = match self.source.fetch_build(build_num).await {
            Ok(payload) => payload,
            Err(e) if e.is_per_build() => {
                warn!(build_num, error = %e, "skipping unvisited build");
                return Ok(BuildOutcome::Skipped);
            }
            Err(e) => return Err(e),
        };

        match failing_step(&payload) {
            FailingStep::None => {
                // No attributable failing step; record the fact so the build
                // is not revisited.
                let mut conn = self.db.pool().acquire().await?;
                storage::find_or_insert_step(&mut conn, build_num, None, false).await?;
                info!(build_num, "idiopathic build (no failed step)");
                Ok(BuildOutcome::Idiopathic)
            }
            FailingStep::Timeout { step_name } => {
                let mut conn = self.db.pool().acquire().await?;
                storage::find_or_insert_step(&mut conn, build_num, Some(&step_name), true).await?;
                info!(build_num, step_name = %step_name, "timed-out build");
                Ok(BuildOutcome::Timeout)
            }
            FailingStep::Failed {
                step_name,
                output_url,
            } => {
                self.scan_fresh_build(catalog, scan_id, build_num, &step_name, output_url)
                    .await
            }
        }
    }

    async fn scan_fresh_build(
        &self,
        catalog: &PatternCatalog,
        scan_id: i64,
        build_num: i64,
        step_name: &str,
        output_url: Option<String>,
    ) -> Result<BuildOutcome> {
        use crate::error::ScanError;

        // Acquire the text before inserting any row: a failed download must
        // leave no trace so the next batch retries from scratch.
        let text = match self
            .cache
            .fetch_fresh(self.source.as_ref(), build_num, output_url.as_deref())
            .await
        {
            Ok(text) => text,
            Err(ScanError::NoLogAvailable { .. }) => {
                let mut conn = self.db.pool().acquire().await?;
                storage::find_or_insert_step(&mut conn, build_num, Some(step_name), false).await?;
                info!(build_num, step_name, "failed step has no log output");
                return Ok(BuildOutcome::NoLog);
            }
            Err(e) if e.is_per_build() => {
                warn!(build_num, error = %e, "skipping unvisited build");
                return Ok(BuildOutcome::Skipped);
            }
            Err(e) => return Err(e),
        };

        let applicable: Vec<_> = catalog
            .all()
            .into_iter()
            .filter(|p| p.applies_to(step_name))
            .collect();

        let lines = split_lines(&text);
        let matches = scan_lines(&lines, &applicable);

        let mut tx = self.db.begin().await?;
        let step_id =
            storage::find_or_insert_step(&mut tx, build_num, Some(step_name), false).await?;
        storage::insert_log_metadata(&mut tx, step_id, LogStats::of(&text), &text).await?;
        storage::insert_matches(&mut tx, step_id, scan_id, &matches).await?;
        if catalog.latest_id() >= 0 {
            storage::upsert_scanned_pattern(&mut tx, scan_id, catalog.latest_id(), build_num)
                .await?;
        }
        tx.commit().await?;

        // File-tier write lands after the commit; if it fails the next
        // revisit rehydrates from log_metadata.
        self.cache.store(build_num, &text)?;

        info!(
            build_num,
            step_name,
            matches = matches.len(),
            "scanned fresh build"
        );

        Ok(BuildOutcome::Scanned {
            matches: matches.len(),
        })
    }
}

impl BatchStats {
    fn tally_terminal(&mut self, outcome: &BuildOutcome) {
        match outcome {
            BuildOutcome::Timeout => self.timeouts += 1,
            BuildOutcome::Idiopathic => self.idiopathic += 1,
            BuildOutcome::NoLog => self.no_log += 1,
            BuildOutcome::Skipped => self.skipped += 1,
            BuildOutcome::Cancelled => self.cancelled += 1,
            BuildOutcome::Scanned { .. } | BuildOutcome::Rescanned { .. } => {}
        }
    }
}
