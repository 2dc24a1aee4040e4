//! End-to-end scan scenarios against a live PostgreSQL database.
//!
//! These tests need a throwaway database; set LOGSIFT_TEST_DATABASE_URL and
//! run with `cargo test -- --ignored`. Each test truncates the contract
//! tables, so never point this at production data.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, OnceLock};
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::Row;
use tempfile::TempDir;

use logsift::error::{Result as ScanResult, ScanError};
use logsift::provider::{assemble_log_text, BuildPayload, BuildSource, LogChunk};
use logsift::storage::patterns::{insert_pattern, NewPattern};
use logsift::storage::{self, NewBuild};
use logsift::{Database, LogCache, ScanEngine, ScanPolicy};

/// Serializes tests that share the database.
static DB_LOCK: OnceLock<tokio::sync::Mutex<()>> = OnceLock::new();

async fn db_guard() -> tokio::sync::MutexGuard<'static, ()> {
    DB_LOCK
        .get_or_init(|| tokio::sync::Mutex::new(()))
        .lock()
        .await
}

/// Connect to the test database and reset the contract tables.
async fn test_db() -> Database {
    let url = std::env::var("LOGSIFT_TEST_DATABASE_URL")
        .expect("LOGSIFT_TEST_DATABASE_URL must be set for ignored scenario tests");
    let db = Database::connect(&url, 5).await.expect("connect test db");
    db.init_schema().await.expect("init schema");
    sqlx::raw_sql(
        "TRUNCATE builds, build_steps, patterns, pattern_tags, \
         pattern_step_applicability, pattern_authorship, scans, matches, \
         log_metadata, scanned_patterns RESTART IDENTITY CASCADE",
    )
    .execute(db.pool())
    .await
    .expect("truncate tables");
    db
}

/// In-memory CI provider for scenario tests.
#[derive(Default)]
struct FakeSource {
    builds: HashMap<i64, String>,
    logs: HashMap<String, String>,
    broken_urls: Mutex<HashSet<String>>,
}

impl FakeSource {
    fn with_build(mut self, build_num: i64, metadata_json: &str) -> Self {
        self.builds.insert(build_num, metadata_json.to_string());
        self
    }

    fn with_log(mut self, url: &str, chunks_json: &str) -> Self {
        self.logs.insert(url.to_string(), chunks_json.to_string());
        self
    }

    fn break_url(&self, url: &str) {
        self.broken_urls.lock().unwrap().insert(url.to_string());
    }

    fn fix_url(&self, url: &str) {
        self.broken_urls.lock().unwrap().remove(url);
    }
}

#[async_trait]
impl BuildSource for FakeSource {
    async fn fetch_build(&self, build_num: i64) -> ScanResult<BuildPayload> {
        let body = self.builds.get(&build_num).ok_or_else(|| ScanError::Http {
            status: reqwest::StatusCode::NOT_FOUND,
            url: format!("fake://builds/{}", build_num),
        })?;
        Ok(serde_json::from_str(body)?)
    }

    async fn fetch_log(&self, url: &str) -> ScanResult<String> {
        if self.broken_urls.lock().unwrap().contains(url) {
            return Err(ScanError::Http {
                status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                url: url.to_string(),
            });
        }
        let body = self.logs.get(url).ok_or_else(|| ScanError::Http {
            status: reqwest::StatusCode::NOT_FOUND,
            url: url.to_string(),
        })?;
        let chunks: Vec<LogChunk> = serde_json::from_str(body)?;
        Ok(assemble_log_text(&chunks))
    }
}

async fn seed_build(db: &Database, build_num: i64) {
    storage::insert_build(
        db.pool(),
        &NewBuild {
            build_num,
            vcs_revision: "abcabcabcabcabcabcabcabcabcabcabcabcabca".to_string(),
            queued_at: None,
            job_name: "ci-job".to_string(),
            branch: Some("main".to_string()),
        },
    )
    .await
    .expect("insert build");
}

async fn seed_literal_pattern(db: &Database, expression: &str) -> i64 {
    insert_pattern(
        db.pool(),
        &NewPattern {
            expression: expression.to_string(),
            is_regex: false,
            is_nondeterministic: false,
            description: None,
            tags: BTreeSet::new(),
            applicable_steps: BTreeSet::new(),
            specificity: 1,
            lines_from_end: None,
            author: None,
        },
    )
    .await
    .expect("insert pattern")
}

fn engine(db: &Database, cache_dir: &TempDir, source: Arc<FakeSource>) -> ScanEngine {
    ScanEngine::new(
        db.clone(),
        LogCache::new(cache_dir.path()),
        source,
        2,
    )
}

const COMPILE_FAILURE: &str = r#"{"steps": [
    {"name": "compile", "actions": [{"failed": true, "output_url": "fake://logs/u"}]}
]}"#;

const HELLO_ERROR_CHUNKS: &str = r#"[{"type": "out", "message": "hello\nERROR here\n"}]"#;

async fn match_rows(db: &Database, build_num: i64) -> Vec<(i64, i32, i32, i32, String)> {
    sqlx::query(
        "SELECT m.pattern, m.line_number, m.span_start, m.span_end, m.line_text \
         FROM matches m JOIN build_steps s ON s.id = m.build_step \
         WHERE s.build = $1 ORDER BY m.pattern, m.line_number",
    )
    .bind(build_num)
    .fetch_all(db.pool())
    .await
    .expect("query matches")
    .iter()
    .map(|r| {
        (
            r.get("pattern"),
            r.get("line_number"),
            r.get("span_start"),
            r.get("span_end"),
            r.get("line_text"),
        )
    })
    .collect()
}

async fn high_watermark(db: &Database, build_num: i64) -> i64 {
    sqlx::query("SELECT COALESCE(MAX(newest_pattern), -1) AS wm FROM scanned_patterns WHERE build = $1")
        .bind(build_num)
        .fetch_one(db.pool())
        .await
        .expect("query watermark")
        .get("wm")
}

#[tokio::test]
#[ignore = "requires LOGSIFT_TEST_DATABASE_URL"]
async fn fresh_scan_of_one_build() {
    let _guard = db_guard().await;
    let db = test_db().await;
    let cache_dir = TempDir::new().unwrap();

    seed_build(&db, 42).await;
    let pattern_id = seed_literal_pattern(&db, "ERROR").await;
    assert_eq!(pattern_id, 1);

    let source = Arc::new(
        FakeSource::default()
            .with_build(42, COMPILE_FAILURE)
            .with_log("fake://logs/u", HELLO_ERROR_CHUNKS),
    );

    let stats = engine(&db, &cache_dir, source)
        .scan_batch(&ScanPolicy::FetchLimit(10))
        .await
        .expect("scan batch");

    assert_eq!(stats.builds_visited, 1);
    assert_eq!(stats.matches_inserted, 1);

    let step = sqlx::query("SELECT id, name, is_timeout FROM build_steps WHERE build = 42")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(step.get::<Option<String>, _>("name").as_deref(), Some("compile"));
    assert!(!step.get::<bool, _>("is_timeout"));

    let log = sqlx::query("SELECT line_count, byte_count, content FROM log_metadata WHERE step = $1")
        .bind(step.get::<i64, _>("id"))
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(log.get::<i32, _>("line_count"), 2);
    assert_eq!(log.get::<i32, _>("byte_count"), 17);
    assert_eq!(log.get::<String, _>("content"), "hello\nERROR here\n");

    let matches = match_rows(&db, 42).await;
    assert_eq!(matches.len(), 1);
    let (pattern, line, start, end, text) = &matches[0];
    assert_eq!(*pattern, 1);
    assert_eq!(*line, 1);
    assert_eq!(*start, 0);
    assert_eq!(*end, 5);
    assert_eq!(text, "ERROR here");

    assert_eq!(high_watermark(&db, 42).await, 1);
}

#[tokio::test]
#[ignore = "requires LOGSIFT_TEST_DATABASE_URL"]
async fn timeout_build_records_step_without_log() {
    let _guard = db_guard().await;
    let db = test_db().await;
    let cache_dir = TempDir::new().unwrap();

    seed_build(&db, 43).await;
    seed_literal_pattern(&db, "ERROR").await;

    let source = Arc::new(FakeSource::default().with_build(
        43,
        r#"{"steps": [{"name": "compile", "actions": [{"timedout": true}]}]}"#,
    ));

    let stats = engine(&db, &cache_dir, source)
        .scan_batch(&ScanPolicy::FetchLimit(10))
        .await
        .unwrap();
    assert_eq!(stats.timeouts, 1);

    let step = sqlx::query("SELECT name, is_timeout FROM build_steps WHERE build = 43")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(step.get::<Option<String>, _>("name").as_deref(), Some("compile"));
    assert!(step.get::<bool, _>("is_timeout"));

    let logs: i64 = sqlx::query("SELECT COUNT(*) AS n FROM log_metadata")
        .fetch_one(db.pool())
        .await
        .unwrap()
        .get("n");
    assert_eq!(logs, 0);
    assert!(match_rows(&db, 43).await.is_empty());
    assert_eq!(high_watermark(&db, 43).await, -1);
}

#[tokio::test]
#[ignore = "requires LOGSIFT_TEST_DATABASE_URL"]
async fn idiopathic_build_records_null_step() {
    let _guard = db_guard().await;
    let db = test_db().await;
    let cache_dir = TempDir::new().unwrap();

    seed_build(&db, 44).await;

    let source = Arc::new(FakeSource::default().with_build(44, r#"{"steps": []}"#));

    let stats = engine(&db, &cache_dir, source)
        .scan_batch(&ScanPolicy::FetchLimit(10))
        .await
        .unwrap();
    assert_eq!(stats.idiopathic, 1);

    let step = sqlx::query("SELECT name FROM build_steps WHERE build = 44")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(step.get::<Option<String>, _>("name"), None);
    assert!(match_rows(&db, 44).await.is_empty());
}

#[tokio::test]
#[ignore = "requires LOGSIFT_TEST_DATABASE_URL"]
async fn revisit_after_new_pattern_scans_only_pending_range() {
    let _guard = db_guard().await;
    let db = test_db().await;
    let cache_dir = TempDir::new().unwrap();

    seed_build(&db, 42).await;
    seed_literal_pattern(&db, "ERROR").await;

    let source = Arc::new(
        FakeSource::default()
            .with_build(42, COMPILE_FAILURE)
            .with_log("fake://logs/u", HELLO_ERROR_CHUNKS),
    );

    let engine = engine(&db, &cache_dir, source);
    engine.scan_batch(&ScanPolicy::FetchLimit(10)).await.unwrap();
    assert_eq!(high_watermark(&db, 42).await, 1);

    // A new regex pattern restricted to the compile step.
    let mut steps = BTreeSet::new();
    steps.insert("compile".to_string());
    let new_id = insert_pattern(
        db.pool(),
        &NewPattern {
            expression: r"ERROR (\w+)".to_string(),
            is_regex: true,
            is_nondeterministic: false,
            description: None,
            tags: BTreeSet::new(),
            applicable_steps: steps,
            specificity: 2,
            lines_from_end: None,
            author: None,
        },
    )
    .await
    .unwrap();
    assert_eq!(new_id, 2);

    let stats = engine.scan_batch(&ScanPolicy::FetchLimit(10)).await.unwrap();
    assert_eq!(stats.builds_revisited, 1);
    assert_eq!(stats.matches_inserted, 1);

    let matches = match_rows(&db, 42).await;
    assert_eq!(matches.len(), 2);
    let (pattern, line, start, end, _) = &matches[1];
    assert_eq!(*pattern, 2);
    assert_eq!(*line, 1);
    assert_eq!(*start, 0);
    assert_eq!(*end, 11);

    assert_eq!(high_watermark(&db, 42).await, 2);

    // The best match prefers the more specific pattern.
    let best = storage::best_match_for_build(db.pool(), 42)
        .await
        .unwrap()
        .expect("best match");
    assert_eq!(best.pattern_id, 2);
}

#[tokio::test]
#[ignore = "requires LOGSIFT_TEST_DATABASE_URL"]
async fn inapplicable_pattern_still_advances_watermark() {
    let _guard = db_guard().await;
    let db = test_db().await;
    let cache_dir = TempDir::new().unwrap();

    seed_build(&db, 42).await;
    seed_literal_pattern(&db, "ERROR").await;

    let source = Arc::new(
        FakeSource::default()
            .with_build(42, COMPILE_FAILURE)
            .with_log("fake://logs/u", HELLO_ERROR_CHUNKS),
    );

    let engine = engine(&db, &cache_dir, source);
    engine.scan_batch(&ScanPolicy::FetchLimit(10)).await.unwrap();
    let before = match_rows(&db, 42).await.len();

    // Applicable only to a step this build does not have.
    let mut steps = BTreeSet::new();
    steps.insert("lint".to_string());
    insert_pattern(
        db.pool(),
        &NewPattern {
            expression: "ERROR".to_string(),
            is_regex: false,
            is_nondeterministic: false,
            description: None,
            tags: BTreeSet::new(),
            applicable_steps: steps,
            specificity: 1,
            lines_from_end: None,
            author: None,
        },
    )
    .await
    .unwrap();

    let stats = engine.scan_batch(&ScanPolicy::FetchLimit(10)).await.unwrap();
    assert_eq!(stats.builds_revisited, 1);
    assert_eq!(stats.matches_inserted, 0);

    assert_eq!(match_rows(&db, 42).await.len(), before);
    assert_eq!(high_watermark(&db, 42).await, 2);
}

#[tokio::test]
#[ignore = "requires LOGSIFT_TEST_DATABASE_URL"]
async fn network_failure_on_log_download_leaves_no_rows() {
    let _guard = db_guard().await;
    let db = test_db().await;
    let cache_dir = TempDir::new().unwrap();

    seed_build(&db, 42).await;
    seed_literal_pattern(&db, "ERROR").await;

    let source = Arc::new(
        FakeSource::default()
            .with_build(42, COMPILE_FAILURE)
            .with_log("fake://logs/u", HELLO_ERROR_CHUNKS),
    );
    source.break_url("fake://logs/u");

    let engine = engine(&db, &cache_dir, source.clone());
    let stats = engine.scan_batch(&ScanPolicy::FetchLimit(10)).await.unwrap();
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.builds_visited, 0);

    let steps: i64 = sqlx::query("SELECT COUNT(*) AS n FROM build_steps WHERE build = 42")
        .fetch_one(db.pool())
        .await
        .unwrap()
        .get("n");
    assert_eq!(steps, 0, "a failed download must leave no build_steps row");

    // The next batch retries and succeeds.
    source.fix_url("fake://logs/u");
    let stats = engine.scan_batch(&ScanPolicy::FetchLimit(10)).await.unwrap();
    assert_eq!(stats.builds_visited, 1);
    assert_eq!(match_rows(&db, 42).await.len(), 1);
}

#[tokio::test]
#[ignore = "requires LOGSIFT_TEST_DATABASE_URL"]
async fn rescanning_is_idempotent() {
    let _guard = db_guard().await;
    let db = test_db().await;
    let cache_dir = TempDir::new().unwrap();

    seed_build(&db, 42).await;
    seed_build(&db, 43).await;
    seed_literal_pattern(&db, "ERROR").await;

    let source = Arc::new(
        FakeSource::default()
            .with_build(42, COMPILE_FAILURE)
            .with_build(43, r#"{"steps": [{"name": "compile", "actions": [{"timedout": true}]}]}"#)
            .with_log("fake://logs/u", HELLO_ERROR_CHUNKS),
    );

    let engine = engine(&db, &cache_dir, source);
    engine.scan_batch(&ScanPolicy::FetchLimit(10)).await.unwrap();
    let after_first = match_rows(&db, 42).await.len();

    // No new patterns: the second run must not add rows.
    let stats = engine.scan_batch(&ScanPolicy::FetchLimit(10)).await.unwrap();
    assert_eq!(stats.matches_inserted, 0);
    assert_eq!(stats.builds_visited, 0);
    assert_eq!(stats.builds_revisited, 0);
    assert_eq!(match_rows(&db, 42).await.len(), after_first);
}

#[tokio::test]
#[ignore = "requires LOGSIFT_TEST_DATABASE_URL"]
async fn whitelist_restricts_both_queues() {
    let _guard = db_guard().await;
    let db = test_db().await;
    let cache_dir = TempDir::new().unwrap();

    seed_build(&db, 42).await;
    seed_build(&db, 50).await;
    seed_literal_pattern(&db, "ERROR").await;

    let source = Arc::new(
        FakeSource::default()
            .with_build(42, COMPILE_FAILURE)
            .with_build(50, COMPILE_FAILURE)
            .with_log("fake://logs/u", HELLO_ERROR_CHUNKS),
    );

    let engine = engine(&db, &cache_dir, source);
    let mut whitelist = std::collections::HashSet::new();
    whitelist.insert(42_i64);

    let stats = engine
        .scan_batch(&ScanPolicy::Whitelist(whitelist))
        .await
        .unwrap();
    assert_eq!(stats.builds_visited, 1);

    let other: i64 = sqlx::query("SELECT COUNT(*) AS n FROM build_steps WHERE build = 50")
        .fetch_one(db.pool())
        .await
        .unwrap()
        .get("n");
    assert_eq!(other, 0);
}

#[tokio::test]
#[ignore = "requires LOGSIFT_TEST_DATABASE_URL"]
async fn pattern_round_trips_through_persistence() {
    let _guard = db_guard().await;
    let db = test_db().await;

    let mut tags = BTreeSet::new();
    tags.insert("flaky".to_string());
    tags.insert("network".to_string());
    let mut steps = BTreeSet::new();
    steps.insert("test".to_string());

    let submitted = NewPattern {
        expression: r"connection reset by peer".to_string(),
        is_regex: false,
        is_nondeterministic: true,
        description: Some("transient socket failure".to_string()),
        tags: tags.clone(),
        applicable_steps: steps.clone(),
        specificity: 5,
        lines_from_end: Some(100),
        author: Some("maintainer".to_string()),
    };

    let id = insert_pattern(db.pool(), &submitted).await.unwrap();

    let catalog = logsift::PatternCatalog::load(db.pool()).await.unwrap();
    let loaded = catalog.get(id).expect("pattern loaded");

    assert_eq!(loaded.expression, submitted.expression);
    assert!(!loaded.is_regex);
    assert!(loaded.is_nondeterministic);
    assert_eq!(loaded.description, submitted.description);
    assert_eq!(loaded.tags, tags);
    assert_eq!(loaded.applicable_steps, steps);
    assert_eq!(loaded.specificity, 5);
    assert_eq!(loaded.lines_from_end, Some(100));
    assert!(!loaded.is_retired);
}

#[tokio::test]
#[ignore = "requires LOGSIFT_TEST_DATABASE_URL"]
async fn cache_file_rehydrates_wiped_log_metadata() {
    let _guard = db_guard().await;
    let db = test_db().await;
    let cache_dir = TempDir::new().unwrap();

    seed_build(&db, 42).await;
    seed_literal_pattern(&db, "ERROR").await;

    let source = Arc::new(
        FakeSource::default()
            .with_build(42, COMPILE_FAILURE)
            .with_log("fake://logs/u", HELLO_ERROR_CHUNKS),
    );

    let engine = engine(&db, &cache_dir, source.clone());
    engine.scan_batch(&ScanPolicy::FetchLimit(10)).await.unwrap();

    // Simulate a database wipe of the log tier, then force a revisit. The
    // download URL is broken, so only the cached file can supply the text.
    sqlx::raw_sql("DELETE FROM log_metadata")
        .execute(db.pool())
        .await
        .unwrap();
    source.break_url("fake://logs/u");
    seed_literal_pattern(&db, "hello").await;

    let stats = engine.scan_batch(&ScanPolicy::FetchLimit(10)).await.unwrap();
    assert_eq!(stats.builds_revisited, 1);
    assert_eq!(stats.matches_inserted, 1);

    let logs: i64 = sqlx::query("SELECT COUNT(*) AS n FROM log_metadata")
        .fetch_one(db.pool())
        .await
        .unwrap()
        .get("n");
    assert_eq!(logs, 1, "log_metadata rehydrated from the cached file");
}
