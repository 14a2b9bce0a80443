//! Engine configuration
//!
//! Every section falls back to its defaults, so a partial JSON document (or none at all)
//! yields a working configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub performance: PerformanceConfig,
    pub storage: StorageConfig,
    pub security: SecurityConfig,
    pub monitoring: MonitoringConfig,
}

impl Config {
    /// Loads a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Default configuration rooted at `dir`, with indexes kept under `dir/index`
    pub fn with_base_path(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        let mut config = Self::default();
        config.storage.base_path = dir.to_path_buf();
        config.storage.index_path = dir.join("index");
        config
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Sheet row-data entries
    pub max_sheet_entries: usize,
    /// Workbook metadata entries
    pub max_workbook_entries: usize,
    /// Cached SELECT results
    pub max_query_results: usize,
    /// Lifetime of a cached SELECT result, counted from insertion
    pub query_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_sheet_entries: 1000,
            max_workbook_entries: 500,
            max_query_results: 2000,
            query_ttl_secs: 30 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    pub worker_threads: usize,
    pub queue_capacity: usize,
    /// Rows per page for paged sheet scans
    pub page_size: usize,
    /// Advisory; checked between pages, never preempts
    pub query_timeout_secs: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            queue_capacity: 200,
            page_size: 1000,
            query_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub base_path: PathBuf,
    pub index_path: PathBuf,
    pub supported_formats: Vec<String>,
    pub max_file_size_mb: u64,
    pub load_retries: u32,
    pub retry_delay_ms: u64,
    /// Replace an unreadable workbook with an empty one after the retries run out.
    /// Destroys the original file contents.
    pub auto_repair_corrupt: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("./data/excel"),
            index_path: PathBuf::from("./data/index"),
            supported_formats: vec!["xlsx".into(), "xls".into(), "csv".into()],
            max_file_size_mb: 100,
            load_retries: 3,
            retry_delay_ms: 500,
            auto_repair_corrupt: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Upper bound on rows a single SELECT may return
    pub max_query_rows: usize,
    /// Reject WHERE clauses the evaluator cannot read instead of matching every row
    pub strict_predicates: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_query_rows: 10000,
            strict_predicates: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub slow_query_threshold_ms: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            slow_query_threshold_ms: 5000,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::Config;
    use crate::error::Result;

    #[test]
    fn test_partial_config() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(
            file,
            r#"{{"cache": {{"max_query_results": 10}}, "security": {{"strict_predicates": true}}}}"#
        )?;

        let config = Config::load(file.path())?;
        assert_eq!(config.cache.max_query_results, 10);
        assert_eq!(config.cache.max_sheet_entries, 1000);
        assert!(config.security.strict_predicates);
        assert_eq!(config.security.max_query_rows, 10000);
        assert_eq!(config.performance.page_size, 1000);
        assert!(!config.storage.auto_repair_corrupt);
        Ok(())
    }

    #[test]
    fn test_with_base_path() {
        let config = Config::with_base_path("/tmp/books");
        assert_eq!(config.storage.index_path, std::path::Path::new("/tmp/books/index"));
    }
}
