//! Two-tier log cache.
//!
//! Console logs live both as local files (keyed by build number, sharded to
//! bound directory size) and as `log_metadata` rows. Either tier can
//! rehydrate the other, so a wiped database or a cleaned cache directory
//! recovers without re-downloading.
//!
//! File writes go through a temp file and rename, so readers never observe a
//! partial log. Two workers racing to download the same build resolve by the
//! loser's rename overwriting byte-identical content.

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Result, ScanError};
use crate::provider::{failing_step, BuildSource, FailingStep};
use crate::storage::{self, Database};

/// Line and size statistics for a canonical log text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogStats {
    /// Number of newline-terminated lines.
    pub line_count: i32,
    /// Character count of the raw text.
    pub byte_count: i32,
}

impl LogStats {
    pub fn of(text: &str) -> Self {
        Self {
            line_count: text.matches('\n').count() as i32,
            byte_count: text.chars().count() as i32,
        }
    }
}

/// Filesystem tier of the log cache. Exclusively owns its root directory.
#[derive(Debug, Clone)]
pub struct LogCache {
    root: PathBuf,
}

impl LogCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `<root>/<shard>/<build_num>.log`; the shard is the build number
    /// divided by 10 000, bounding each directory to 10 000 entries.
    pub fn log_path(&self, build_num: i64) -> PathBuf {
        self.root
            .join((build_num / 10_000).to_string())
            .join(format!("{}.log", build_num))
    }

    /// Read a cached log, if present.
    pub fn load(&self, build_num: i64) -> Result<Option<String>> {
        let path = self.log_path(build_num);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(std::fs::read_to_string(&path)?))
    }

    /// Write a log atomically: temp file in the shard directory, then
    /// rename. The file is not visible to readers until the rename lands.
    pub fn store(&self, build_num: i64, text: &str) -> Result<()> {
        let path = self.log_path(build_num);
        let dir = path.parent().expect("log path always has a shard parent");
        std::fs::create_dir_all(dir)?;

        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        temp.write_all(text.as_bytes())?;
        temp.persist(&path).map_err(|e| ScanError::Io(e.error))?;

        debug!(build_num, path = %path.display(), "stored log file");
        Ok(())
    }

    /// Acquire the log text for a fresh build without touching the database:
    /// cached file if present, otherwise a download from `url`. Used by the
    /// visit loop, which defers all row inserts until the text is in hand.
    pub async fn fetch_fresh(
        &self,
        source: &dyn BuildSource,
        build_num: i64,
        url: Option<&str>,
    ) -> Result<String> {
        if let Some(text) = self.load(build_num)? {
            debug!(build_num, "log already cached on disk");
            return Ok(text);
        }

        let url = url.ok_or(ScanError::NoLogAvailable { build_num })?;
        source.fetch_log(url).await
    }

    /// Produce the log text for an already-visited build, ensuring both
    /// tiers end up populated.
    ///
    /// Resolution order: local file (rehydrating `log_metadata` if the
    /// database was wiped), then `log_metadata.content` (rewriting the
    /// file), then a download from `download_url` or a URL re-derived from
    /// the build metadata. Fails with `NoLogAvailable` when no URL can be
    /// derived.
    pub async fn get_or_fetch(
        &self,
        db: &Database,
        source: &dyn BuildSource,
        build_num: i64,
        step_id: i64,
        download_url: Option<&str>,
    ) -> Result<String> {
        if let Some(text) = self.load(build_num)? {
            let stats = LogStats::of(&text);
            storage::ensure_log_metadata(db.pool(), step_id, stats, &text).await?;
            return Ok(text);
        }

        if let Some(text) = storage::log_content(db.pool(), step_id).await? {
            info!(build_num, step_id, "rehydrating log file from database");
            self.store(build_num, &text)?;
            return Ok(text);
        }

        let url = match download_url {
            Some(url) => url.to_string(),
            None => self.derive_url(source, build_num).await?,
        };

        let text = source.fetch_log(&url).await?;
        self.store(build_num, &text)?;
        storage::ensure_log_metadata(db.pool(), step_id, LogStats::of(&text), &text).await?;
        Ok(text)
    }

    /// Re-fetch build metadata to recover a download URL for a build whose
    /// log is in neither tier.
    async fn derive_url(&self, source: &dyn BuildSource, build_num: i64) -> Result<String> {
        let payload = source.fetch_build(build_num).await?;
        match failing_step(&payload) {
            FailingStep::Failed {
                output_url: Some(url),
                ..
            } => Ok(url),
            _ => Err(ScanError::NoLogAvailable { build_num }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_path_sharding() {
        let cache = LogCache::new("/var/cache/logsift");

        assert_eq!(
            cache.log_path(42),
            PathBuf::from("/var/cache/logsift/0/42.log")
        );
        assert_eq!(
            cache.log_path(123_456),
            PathBuf::from("/var/cache/logsift/12/123456.log")
        );
    }

    #[test]
    fn test_store_then_load_round_trip() {
        let temp = tempfile::TempDir::new().unwrap();
        let cache = LogCache::new(temp.path());

        let text = "hello\nERROR here\n";
        cache.store(42, text).unwrap();

        assert_eq!(cache.load(42).unwrap().as_deref(), Some(text));
    }

    #[test]
    fn test_load_missing_is_none() {
        let temp = tempfile::TempDir::new().unwrap();
        let cache = LogCache::new(temp.path());

        assert_eq!(cache.load(7).unwrap(), None);
    }

    #[test]
    fn test_store_overwrite_is_clean() {
        let temp = tempfile::TempDir::new().unwrap();
        let cache = LogCache::new(temp.path());

        cache.store(42, "first\n").unwrap();
        cache.store(42, "first\n").unwrap();

        assert_eq!(cache.load(42).unwrap().as_deref(), Some("first\n"));
        // No leftover temp files in the shard directory.
        let entries: Vec<_> = std::fs::read_dir(temp.path().join("0"))
            .unwrap()
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_log_stats() {
        let stats = LogStats::of("hello\nERROR here\n");
        assert_eq!(stats.line_count, 2);
        assert_eq!(stats.byte_count, 17);
    }

    #[test]
    fn test_log_stats_empty() {
        let stats = LogStats::of("");
        assert_eq!(stats.line_count, 0);
        assert_eq!(stats.byte_count, 0);
    }

    #[test]
    fn test_log_stats_unterminated_final_line() {
        // Only newline-terminated lines are counted.
        let stats = LogStats::of("a\nb");
        assert_eq!(stats.line_count, 1);
        assert_eq!(stats.byte_count, 3);
    }
}
