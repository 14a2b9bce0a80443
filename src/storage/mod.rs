//! Workbook files on disk
//!
//! `FileStorage` maps workbook names to files under the base directory, `codec`
//! converts between files and sheets, and writes go through a temp file that is
//! renamed over the destination so a crash never leaves a half-written workbook.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    time::SystemTime,
};

use tempfile::NamedTempFile;

use crate::{
    config::StorageConfig,
    error::{Error, Result},
};

pub mod codec;

/// Modification time plus length of a file at one moment; two stamps differ when the
/// file changed, even on filesystems with coarse mtime resolution as long as the size moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    pub mtime: Option<SystemTime>,
    pub len: u64,
}

impl FileStamp {
    /// Stamp of `path`, or None when the file is gone
    pub fn of(path: &Path) -> Option<Self> {
        let meta = fs::metadata(path).ok()?;
        Some(Self {
            mtime: meta.modified().ok(),
            len: meta.len(),
        })
    }
}

/// Maps workbook names onto files in the base directory
#[derive(Debug, Clone)]
pub struct FileStorage {
    base_path: PathBuf,
    formats: Vec<String>,
    max_file_size: u64,
}

impl FileStorage {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            base_path: config.base_path.clone(),
            formats: config
                .supported_formats
                .iter()
                .map(|f| f.to_lowercase())
                .collect(),
            max_file_size: config.max_file_size_mb.saturating_mul(1024 * 1024),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Workbook names are single path components made of word characters, `.` and `-`
    pub fn validate_name(name: &str) -> Result<()> {
        let valid = !name.is_empty()
            && name != "."
            && name != ".."
            && name
                .chars()
                .all(|c| c.is_alphanumeric() || c == '_' || c == '.' || c == '-');
        if valid {
            Ok(())
        } else {
            Err(Error::Parse(format!("invalid workbook name '{}'", name)))
        }
    }

    /// Path of an existing workbook in any supported format, else where a new xlsx goes
    pub fn workbook_path(&self, name: &str) -> PathBuf {
        self.formats
            .iter()
            .map(|ext| self.base_path.join(format!("{}.{}", name, ext)))
            .find(|p| p.is_file())
            .unwrap_or_else(|| self.base_path.join(format!("{}.xlsx", name)))
    }

    pub fn exists(&self, name: &str) -> bool {
        Self::validate_name(name).is_ok() && self.workbook_path(name).is_file()
    }

    /// Sorted names of every workbook file in the base directory
    pub fn list_workbooks(&self) -> Result<Vec<String>> {
        if !self.base_path.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.base_path)? {
            let path = entry?.path();
            let supported = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| self.formats.contains(&e.to_lowercase()))
                .unwrap_or(false);
            if !supported || !path.is_file() {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Rejects files above the configured size limit
    pub fn check_size(&self, path: &Path) -> Result<()> {
        let len = fs::metadata(path)?.len();
        if len > self.max_file_size {
            return Err(Error::Io(format!(
                "{} is {} bytes, limit is {}",
                path.display(),
                len,
                self.max_file_size
            )));
        }
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<PathBuf> {
        let path = self.workbook_path(name);
        fs::remove_file(&path)?;
        Ok(path)
    }
}

fn parent_dir_or_dot(path: &Path) -> &Path {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Writes `bytes` to a temp file beside `dest`, syncs it and renames it into place.
/// On failure the destination is left untouched.
pub fn atomic_write(dest: &Path, bytes: &[u8]) -> Result<()> {
    let dir = parent_dir_or_dot(dest);
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file_mut().flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest)?;
    Ok(())
}
