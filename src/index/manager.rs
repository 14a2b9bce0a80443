use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    sql::{schema::Sheet, types::Value},
    storage,
};

use super::btree::{BPlusTree, IndexKey};

/// On-disk snapshot of one column index
#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    workbook: String,
    sheet: String,
    column: String,
    tree: BPlusTree,
}

/// Owns every secondary index: one B+Tree per (workbook, sheet, column), cached in memory
/// and persisted as `{index_path}/{workbook}.{sheet}.{column}.idx`. Each name is lowercased
/// and every byte outside `[a-z0-9_-]` is written as `%XX`, so any sheet or column name maps
/// to a single file directly under the index directory.
pub struct IndexManager {
    dir: PathBuf,
    indexes: RwLock<HashMap<String, Arc<BPlusTree>>>,
}

impl IndexManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            indexes: RwLock::new(HashMap::new()),
        }
    }

    pub fn key(workbook: &str, sheet: &str, column: &str) -> String {
        format!("{}.{}.{}", encode(workbook), encode(sheet), encode(column))
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.idx", key))
    }

    /// Builds the index from the sheet's current rows, replacing any previous one.
    /// Returns the number of distinct keys.
    pub fn create_index(&self, workbook: &str, sheet: &Sheet, column: &str) -> Result<usize> {
        let ordinal = sheet.must_get_column(column)?.ordinal;
        let mut tree = BPlusTree::new();
        for row in sheet.rows.iter() {
            tree.insert(IndexKey::from_value(row.get(ordinal)), row.row_num);
        }

        let key = Self::key(workbook, &sheet.name, column);
        let file = IndexFile {
            workbook: workbook.to_string(),
            sheet: sheet.name.clone(),
            column: column.to_string(),
            tree,
        };
        fs::create_dir_all(&self.dir)?;
        storage::atomic_write(&self.path(&key), &bincode::serialize(&file)?)?;

        let distinct = file.tree.len();
        log::info!("built index {} with {} keys", key, distinct);
        self.indexes.write().insert(key, Arc::new(file.tree));
        Ok(distinct)
    }

    /// The cached index, loading it from disk on a cold cache. Unreadable snapshots are
    /// treated as missing.
    pub fn get(&self, workbook: &str, sheet: &str, column: &str) -> Option<Arc<BPlusTree>> {
        let key = Self::key(workbook, sheet, column);
        if let Some(tree) = self.indexes.read().get(&key) {
            return Some(tree.clone());
        }

        let path = self.path(&key);
        if !path.exists() {
            return None;
        }
        match Self::load(&path) {
            Ok(file) => {
                let tree = Arc::new(file.tree);
                self.indexes.write().insert(key, tree.clone());
                Some(tree)
            }
            Err(err) => {
                log::warn!("ignoring unreadable index {}: {}", path.display(), err);
                None
            }
        }
    }

    fn load(path: &Path) -> Result<IndexFile> {
        let bytes = fs::read(path)?;
        Ok(bincode::deserialize(&bytes)?)
    }

    /// Row numbers whose `column` equals `value`, or None when the column has no index
    pub fn query(&self, workbook: &str, sheet: &str, column: &str, value: &Value) -> Option<Vec<usize>> {
        self.get(workbook, sheet, column)
            .map(|tree| tree.search(&IndexKey::from_value(value)))
    }

    /// Row numbers whose `column` holds a number in `[low, high]`. None without an index,
    /// and None when the column also holds text or booleans, since those compare as text.
    pub fn range(&self, workbook: &str, sheet: &str, column: &str, low: f64, high: f64) -> Option<Vec<usize>> {
        let tree = self.get(workbook, sheet, column)?;
        if !tree.is_numeric() {
            return None;
        }
        Some(tree.range_search(&IndexKey::Number(low), &IndexKey::Number(high)))
    }

    pub fn drop_index(&self, workbook: &str, sheet: &str, column: &str) -> Result<bool> {
        let key = Self::key(workbook, sheet, column);
        let cached = self.indexes.write().remove(&key).is_some();
        let path = self.path(&key);
        let on_disk = path.exists();
        if on_disk {
            fs::remove_file(&path)?;
        }
        if !cached && !on_disk {
            return Err(Error::Reference(format!(
                "no index on {}.{}({})",
                workbook, sheet, column
            )));
        }
        Ok(true)
    }

    /// Keys of every persisted or cached index under `prefix`
    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .indexes
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        if let Ok(entries) = fs::read_dir(&self.dir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if let Some(key) = name.strip_suffix(".idx") {
                    if key.starts_with(prefix) && !keys.iter().any(|k| k == key) {
                        keys.push(key.to_string());
                    }
                }
            }
        }
        keys.sort();
        keys
    }

    /// Columns of `sheet` that carry an index, lowercased
    pub fn indexed_columns(&self, workbook: &str, sheet: &str) -> Vec<String> {
        let prefix = format!("{}.{}.", encode(workbook), encode(sheet));
        self.keys_with_prefix(&prefix)
            .into_iter()
            .filter_map(|k| k.strip_prefix(&prefix).and_then(decode))
            .collect()
    }

    /// Rebuilds every index of a sheet after its rows changed
    pub fn refresh_sheet(&self, workbook: &str, sheet: &Sheet) -> Result<()> {
        for column in self.indexed_columns(workbook, &sheet.name) {
            if sheet.column(&column).is_some() {
                self.create_index(workbook, sheet, &column)?;
            } else {
                self.drop_index(workbook, &sheet.name, &column)?;
            }
        }
        Ok(())
    }

    /// Drops every index of a sheet, or of a whole workbook when `sheet` is None
    pub fn drop_all(&self, workbook: &str, sheet: Option<&str>) -> Result<usize> {
        let prefix = match sheet {
            Some(sheet) => format!("{}.{}.", encode(workbook), encode(sheet)),
            None => format!("{}.", encode(workbook)),
        };
        let keys = self.keys_with_prefix(&prefix);
        for key in &keys {
            self.indexes.write().remove(key);
            let path = self.path(key);
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(keys.len())
    }

    /// Forgets the in-memory copies; snapshots on disk stay
    pub fn clear_cache(&self) {
        self.indexes.write().clear();
    }
}

/// Lowercases a name and escapes it for use as one file-name segment
fn encode(name: &str) -> String {
    let mut out = String::new();
    for b in name.to_lowercase().bytes() {
        if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

fn decode(segment: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(segment.len());
    let mut rest = segment.as_bytes();
    while let Some((&b, tail)) = rest.split_first() {
        if b == b'%' {
            let hex = std::str::from_utf8(tail.get(..2)?).ok()?;
            bytes.push(u8::from_str_radix(hex, 16).ok()?);
            rest = &tail[2..];
        } else {
            bytes.push(b);
            rest = tail;
        }
    }
    String::from_utf8(bytes).ok()
}
