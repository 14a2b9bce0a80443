//! Three independently evicted cache tiers
//!
//! - workbook metadata, keyed by workbook name, evicting the oldest last access
//! - sheet rows, keyed by `workbook#sheet`, strict LRU
//! - SELECT results, keyed by the query signature, expiring after a fixed lifetime
//!
//! Every entry captures the stamp of the file it was read from and is discarded as
//! soon as the file on disk no longer carries that stamp. Writers additionally evict
//! explicitly through the `invalidate_*` calls.

use std::{
    collections::HashMap,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;

use crate::{
    config::CacheConfig,
    sql::{
        executor::ResultSet,
        schema::{Sheet, WorkbookInfo},
    },
    storage::FileStamp,
};

const WORKBOOK_BYTES: usize = 1024;
const ROW_BYTES: usize = 256;

struct WorkbookEntry {
    info: Arc<WorkbookInfo>,
    stamp: Option<FileStamp>,
    last_access: Instant,
}

struct SheetEntry {
    workbook: String,
    sheet: Arc<Sheet>,
    path: PathBuf,
    stamp: Option<FileStamp>,
}

struct QueryEntry {
    workbook: String,
    table: String,
    result: Arc<ResultSet>,
    stamps: Vec<(PathBuf, Option<FileStamp>)>,
    expires_at: Instant,
}

impl QueryEntry {
    fn is_valid(&self, now: Instant) -> bool {
        now < self.expires_at && self.stamps.iter().all(|(path, stamp)| FileStamp::of(path) == *stamp)
    }

    fn mentions(&self, workbook: &str, table: Option<&str>) -> bool {
        self.workbook.eq_ignore_ascii_case(workbook)
            && table.is_none_or(|t| self.table.eq_ignore_ascii_case(t))
    }
}

/// Point-in-time cache statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub workbook_entries: usize,
    pub sheet_entries: usize,
    pub query_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
    pub memory_bytes: usize,
}

impl CacheStats {
    pub fn formatted_hit_rate(&self) -> String {
        format!("{:.2}%", self.hit_rate * 100.0)
    }

    pub fn formatted_memory(&self) -> String {
        let bytes = self.memory_bytes as f64;
        if bytes < 1024.0 {
            format!("{} B", self.memory_bytes)
        } else if bytes < 1024.0 * 1024.0 {
            format!("{:.2} KB", bytes / 1024.0)
        } else {
            format!("{:.2} MB", bytes / (1024.0 * 1024.0))
        }
    }
}

pub struct CacheManager {
    max_workbooks: usize,
    query_ttl: Duration,
    workbooks: Mutex<HashMap<String, WorkbookEntry>>,
    sheets: Mutex<LruCache<String, SheetEntry>>,
    queries: Mutex<LruCache<String, QueryEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

fn sheet_key(workbook: &str, sheet: &str) -> String {
    format!("{}#{}", workbook, sheet).to_lowercase()
}

fn capacity(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap_or(NonZeroUsize::MIN)
}

/// Inserts `value`, first evicting least recently used entries until it fits. Returns the
/// evicted entries.
fn put_bounded<V>(cache: &mut LruCache<String, V>, key: String, value: V) -> Vec<(String, V)> {
    let mut evicted = Vec::new();
    if !cache.contains(&key) {
        while cache.len() >= cache.cap().get() {
            match cache.pop_lru() {
                Some(entry) => evicted.push(entry),
                None => break,
            }
        }
    }
    cache.put(key, value);
    evicted
}

/// Removes and returns every entry `keep` rejects
fn retain<V>(cache: &mut LruCache<String, V>, mut keep: impl FnMut(&String, &V) -> bool) -> Vec<(String, V)> {
    let doomed: Vec<String> = cache
        .iter()
        .filter(|&(k, v)| !keep(k, v))
        .map(|(k, _)| k.clone())
        .collect();
    doomed
        .into_iter()
        .filter_map(|k| cache.pop(&k).map(|v| (k, v)))
        .collect()
}

impl CacheManager {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            max_workbooks: config.max_workbook_entries.max(1),
            query_ttl: Duration::from_secs(config.query_ttl_secs),
            workbooks: Mutex::new(HashMap::new()),
            sheets: Mutex::new(LruCache::new(capacity(config.max_sheet_entries))),
            queries: Mutex::new(LruCache::new(capacity(config.max_query_results))),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn record(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn evicted(&self, n: usize) {
        if n > 0 {
            self.evictions.fetch_add(n as u64, Ordering::Relaxed);
        }
    }

    pub fn get_workbook(&self, name: &str) -> Option<Arc<WorkbookInfo>> {
        let key = name.to_lowercase();
        let mut workbooks = self.workbooks.lock();
        let fresh = match workbooks.get_mut(&key) {
            Some(entry) if FileStamp::of(&entry.info.path) == entry.stamp => {
                entry.last_access = Instant::now();
                Some(entry.info.clone())
            }
            Some(_) => {
                workbooks.remove(&key);
                self.evicted(1);
                None
            }
            None => None,
        };
        drop(workbooks);
        self.record(fresh.is_some());
        fresh
    }

    /// Caches workbook metadata; `stamp` is the file's stamp from before it was read
    pub fn put_workbook(&self, info: WorkbookInfo, stamp: Option<FileStamp>) {
        let key = info.name.to_lowercase();
        let mut evicted = Vec::new();
        {
            let mut workbooks = self.workbooks.lock();
            workbooks.insert(
                key.clone(),
                WorkbookEntry {
                    info: Arc::new(info),
                    stamp,
                    last_access: Instant::now(),
                },
            );
            while workbooks.len() > self.max_workbooks {
                let oldest = workbooks
                    .iter()
                    .filter(|(k, _)| **k != key)
                    .min_by_key(|(_, e)| e.last_access)
                    .map(|(k, _)| k.clone());
                match oldest {
                    Some(k) => {
                        workbooks.remove(&k);
                        evicted.push(k);
                    }
                    None => break,
                }
            }
        }
        for name in evicted {
            log::debug!("workbook {} evicted from cache", name);
            self.evicted(1);
            // a workbook's sheets go with it
            self.evict_sheets(&name, None);
        }
    }

    /// Whether a sheet's rows are held, without touching recency or the hit counters
    pub fn has_sheet(&self, workbook: &str, sheet: &str) -> bool {
        self.sheets.lock().contains(&sheet_key(workbook, sheet))
    }

    /// A cached sheet and the stamp its rows were read under, while the file still
    /// carries that stamp
    pub fn get_sheet(&self, workbook: &str, sheet: &str) -> Option<(Arc<Sheet>, Option<FileStamp>)> {
        let key = sheet_key(workbook, sheet);
        let mut sheets = self.sheets.lock();
        let cached = sheets
            .get(&key)
            .map(|e| (FileStamp::of(&e.path) == e.stamp, e.sheet.clone(), e.stamp));
        let found = match cached {
            Some((true, sheet, stamp)) => Some((sheet, stamp)),
            Some((false, ..)) => {
                sheets.pop(&key);
                self.evicted(1);
                None
            }
            None => None,
        };
        drop(sheets);
        self.record(found.is_some());
        found
    }

    /// Caches rows read from `path`; `stamp` is the file's stamp from before the read, so
    /// a write racing the read leaves the entry stale rather than wrongly fresh
    pub fn put_sheet(&self, workbook: &str, sheet: Arc<Sheet>, path: &Path, stamp: Option<FileStamp>) {
        let key = sheet_key(workbook, &sheet.name);
        let entry = SheetEntry {
            workbook: workbook.to_lowercase(),
            sheet,
            path: path.to_path_buf(),
            stamp,
        };
        let evicted = put_bounded(&mut self.sheets.lock(), key, entry);
        for (_, entry) in evicted {
            self.evicted(1);
            // results computed from an evicted sheet go with it
            let dropped = retain(&mut self.queries.lock(), |_, q| {
                !q.mentions(&entry.workbook, Some(&entry.sheet.name))
            });
            self.evicted(dropped.len());
        }
    }

    pub fn get_query(&self, signature: &str) -> Option<Arc<ResultSet>> {
        let key = signature.to_string();
        let mut queries = self.queries.lock();
        let cached = queries
            .get(&key)
            .map(|e| (e.is_valid(Instant::now()), e.result.clone()));
        let found = match cached {
            Some((true, result)) => Some(result),
            Some((false, _)) => {
                queries.pop(&key);
                self.evicted(1);
                None
            }
            None => None,
        };
        drop(queries);
        self.record(found.is_some());
        if found.is_some() {
            log::debug!("query cache hit {}", signature);
        }
        found
    }

    /// Stores a SELECT result together with the stamps its input files carried when they
    /// were read
    pub fn put_query(
        &self,
        signature: &str,
        workbook: &str,
        table: &str,
        result: Arc<ResultSet>,
        stamps: Vec<(PathBuf, Option<FileStamp>)>,
    ) {
        let entry = QueryEntry {
            workbook: workbook.to_string(),
            table: table.to_string(),
            result,
            stamps,
            expires_at: Instant::now() + self.query_ttl,
        };
        let evicted = put_bounded(&mut self.queries.lock(), signature.to_string(), entry);
        self.evicted(evicted.len());
    }

    fn evict_sheets(&self, workbook: &str, sheet: Option<&str>) -> usize {
        let workbook = workbook.to_lowercase();
        let target = sheet.map(|s| sheet_key(&workbook, s));
        let dropped = retain(&mut self.sheets.lock(), |k, e| match &target {
            Some(t) => k != t,
            None => e.workbook != workbook,
        });
        self.evicted(dropped.len());
        dropped.len()
    }

    fn evict_queries(&self, workbook: &str, sheet: Option<&str>) -> usize {
        let now = Instant::now();
        let dropped = retain(&mut self.queries.lock(), |_, q| {
            !q.mentions(workbook, sheet) && q.is_valid(now)
        });
        self.evicted(dropped.len());
        dropped.len()
    }

    /// Drops one sheet's rows and every result touching that sheet or gone stale
    pub fn invalidate_sheet(&self, workbook: &str, sheet: &str) {
        let n = self.evict_sheets(workbook, Some(sheet)) + self.evict_queries(workbook, Some(sheet));
        log::debug!("invalidated {}#{} ({} entries)", workbook, sheet, n);
    }

    /// Drops everything cached for a workbook
    pub fn invalidate_workbook(&self, workbook: &str) {
        if self.workbooks.lock().remove(&workbook.to_lowercase()).is_some() {
            self.evicted(1);
        }
        let n = self.evict_sheets(workbook, None) + self.evict_queries(workbook, None);
        log::debug!("invalidated workbook {} ({} entries)", workbook, n);
    }

    /// Drops every entry read from `path` and every result whose stamps no longer match
    pub fn invalidate_path(&self, path: &Path) {
        let mut n = {
            let mut workbooks = self.workbooks.lock();
            let before = workbooks.len();
            workbooks.retain(|_, e| e.info.path != path);
            before - workbooks.len()
        };
        n += retain(&mut self.sheets.lock(), |_, e| e.path != path).len();
        let now = Instant::now();
        n += retain(&mut self.queries.lock(), |_, q| {
            q.is_valid(now) && q.stamps.iter().all(|(p, _)| p != path)
        })
        .len();
        self.evicted(n);
    }

    /// Empties every tier and resets the counters
    pub fn clear_all(&self) {
        self.workbooks.lock().clear();
        self.sheets.lock().clear();
        self.queries.lock().clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CacheStats {
        let workbook_entries = self.workbooks.lock().len();
        let (sheet_entries, sheet_rows) = {
            let sheets = self.sheets.lock();
            (sheets.len(), sheets.iter().map(|(_, e)| e.sheet.row_count()).sum::<usize>())
        };
        let (query_entries, query_rows) = {
            let queries = self.queries.lock();
            let rows = queries
                .iter()
                .map(|(_, q)| match q.result.as_ref() {
                    ResultSet::Scan { rows, .. } => rows.len(),
                    _ => 0,
                })
                .sum::<usize>();
            (queries.len(), rows)
        };
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            workbook_entries,
            sheet_entries,
            query_entries,
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
            memory_bytes: workbook_entries * WORKBOOK_BYTES + (sheet_rows + query_rows) * ROW_BYTES,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        path::{Path, PathBuf},
        sync::Arc,
    };

    use super::CacheManager;
    use crate::{
        config::CacheConfig,
        error::Result,
        sql::{
            executor::ResultSet,
            schema::{Row, Sheet, WorkbookInfo},
            types::Value,
        },
        storage::{FileStamp, atomic_write},
    };

    fn scan(n: i64) -> Arc<ResultSet> {
        Arc::new(ResultSet::Scan {
            columns: vec!["n".into()],
            rows: vec![vec![Value::Integer(n)]],
        })
    }

    fn stamped(path: &Path) -> (PathBuf, Option<FileStamp>) {
        (path.to_path_buf(), FileStamp::of(path))
    }

    fn info(name: &str, path: PathBuf) -> WorkbookInfo {
        let mtime = FileStamp::of(&path).and_then(|s| s.mtime);
        WorkbookInfo {
            name: name.into(),
            path,
            sheets: vec!["s".into()],
            mtime,
        }
    }

    #[test]
    fn test_query_hit_until_file_changes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("wb.csv");
        atomic_write(&path, b"n\n1\n")?;

        let cache = CacheManager::new(&CacheConfig::default());
        cache.put_query("wb:s:*", "wb", "s", scan(1), vec![stamped(&path)]);
        assert!(cache.get_query("wb:s:*").is_some());
        assert!(cache.get_query("wb:s:*").is_some());
        assert_eq!(cache.stats().hits, 2);

        atomic_write(&path, b"n\n1\n2\n")?;
        assert!(cache.get_query("wb:s:*").is_none());
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.query_entries, 0);
        Ok(())
    }

    #[test]
    fn test_query_ttl() {
        let cache = CacheManager::new(&CacheConfig {
            query_ttl_secs: 0,
            ..CacheConfig::default()
        });
        cache.put_query("k", "wb", "s", scan(1), vec![]);
        assert!(cache.get_query("k").is_none());
    }

    #[test]
    fn test_invalidate_by_sheet_and_workbook() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("wb.csv");
        atomic_write(&path, b"n\n1\n")?;
        let cache = CacheManager::new(&CacheConfig::default());

        let mut sheet = Sheet::new("lines", vec![]);
        sheet.rows.insert(Row::new(1, vec![Value::Integer(1)]));
        cache.put_sheet("wb", Arc::new(sheet), &path, FileStamp::of(&path));
        cache.put_sheet("wb", Arc::new(Sheet::new("other", vec![])), &path, FileStamp::of(&path));
        cache.put_query("q1", "wb", "lines", scan(1), vec![stamped(&path)]);
        cache.put_query("q2", "wb", "other", scan(2), vec![stamped(&path)]);
        cache.put_query("q3", "elsewhere", "lines", scan(3), vec![]);

        cache.invalidate_sheet("WB", "LINES");
        assert!(cache.get_sheet("wb", "lines").is_none());
        assert!(cache.get_sheet("wb", "other").is_some());
        assert!(cache.get_query("q1").is_none());
        assert!(cache.get_query("q2").is_some());
        assert!(cache.get_query("q3").is_some());

        cache.put_workbook(info("wb", path.clone()), FileStamp::of(&path));
        assert!(cache.get_workbook("wb").is_some());
        cache.invalidate_workbook("wb");
        assert!(cache.get_workbook("wb").is_none());
        assert!(cache.get_sheet("wb", "other").is_none());
        assert!(cache.get_query("q2").is_none());
        assert!(cache.get_query("q3").is_some());
        Ok(())
    }

    #[test]
    fn test_capacity_eviction_and_stats() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("wb.csv");
        atomic_write(&path, b"n\n")?;
        let cache = CacheManager::new(&CacheConfig {
            max_sheet_entries: 1,
            max_workbook_entries: 1,
            ..CacheConfig::default()
        });

        cache.put_sheet("wb", Arc::new(Sheet::new("a", vec![])), &path, FileStamp::of(&path));
        cache.put_query("qa", "wb", "a", scan(1), vec![]);
        cache.put_sheet("wb", Arc::new(Sheet::new("b", vec![])), &path, FileStamp::of(&path));
        // evicting sheet a drops its results
        assert!(cache.get_sheet("wb", "a").is_none());
        assert!(cache.get_query("qa").is_none());

        cache.put_workbook(info("one", path.clone()), FileStamp::of(&path));
        cache.put_workbook(info("two", path.clone()), FileStamp::of(&path));
        assert!(cache.get_workbook("one").is_none());
        assert!(cache.get_workbook("two").is_some());

        let stats = cache.stats();
        assert!(stats.evictions >= 3);
        assert_eq!(stats.workbook_entries, 1);
        assert_eq!(stats.formatted_hit_rate(), format!("{:.2}%", stats.hit_rate * 100.0));
        assert!(stats.formatted_memory().ends_with("KB"));

        cache.invalidate_path(&path);
        assert_eq!(cache.stats().sheet_entries, 0);
        cache.clear_all();
        assert_eq!(cache.stats().hits, 0);
        Ok(())
    }

    #[test]
    fn test_entries_keep_the_stamp_of_the_read() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("wb.csv");
        atomic_write(&path, b"n\n1\n")?;
        let cache = CacheManager::new(&CacheConfig::default());

        // another writer lands between the read and the put
        let read_at = FileStamp::of(&path);
        atomic_write(&path, b"n\n1\n2\n")?;
        cache.put_sheet("wb", Arc::new(Sheet::new("s", vec![])), &path, read_at);
        cache.put_query("q", "wb", "s", scan(1), vec![(path.clone(), read_at)]);
        cache.put_workbook(info("wb", path.clone()), read_at);

        assert!(cache.get_sheet("wb", "s").is_none());
        assert!(cache.get_query("q").is_none());
        assert!(cache.get_workbook("wb").is_none());

        let now = FileStamp::of(&path);
        cache.put_sheet("wb", Arc::new(Sheet::new("s", vec![])), &path, now);
        assert_eq!(cache.get_sheet("wb", "s").map(|(_, stamp)| stamp), Some(now));
        Ok(())
    }

    #[test]
    fn test_recently_used_sheet_survives() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("wb.csv");
        atomic_write(&path, b"n\n")?;
        let stamp = FileStamp::of(&path);
        let cache = CacheManager::new(&CacheConfig {
            max_sheet_entries: 2,
            ..CacheConfig::default()
        });

        cache.put_sheet("wb", Arc::new(Sheet::new("a", vec![])), &path, stamp);
        cache.put_sheet("wb", Arc::new(Sheet::new("b", vec![])), &path, stamp);
        assert!(cache.get_sheet("wb", "a").is_some());
        cache.put_sheet("wb", Arc::new(Sheet::new("c", vec![])), &path, stamp);

        assert!(cache.get_sheet("wb", "a").is_some());
        assert!(cache.get_sheet("wb", "b").is_none());
        assert!(cache.get_sheet("wb", "c").is_some());
        assert_eq!(cache.stats().sheet_entries, 2);
        Ok(())
    }
}
