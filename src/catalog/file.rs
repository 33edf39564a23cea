use super::{CatalogRecord, CatalogStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tracing::{debug, warn};

const BACKUP_STAMP: &str = "%Y%m%d%H%M%S";

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog io failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("catalog file {path} is corrupt: {message}")]
    Corrupt { path: PathBuf, message: String },
    #[error("catalog serialization failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl CatalogError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// The persisted catalog: a JSON array of `{sku, images, name?}` objects.
///
/// Every write first copies the previous file to
/// `<name>.bak.<UTC timestamp>` and then replaces the file through a
/// temporary sibling, so readers never observe a half-written catalog.
#[derive(Clone)]
pub struct CatalogFile {
    path: PathBuf,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CatalogFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogFile")
            .field("path", &self.path)
            .finish()
    }
}

impl CatalogFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_clock(path, Arc::new(SystemClock))
    }

    pub fn with_clock(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            path: path.into(),
            clock,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Strict read. A missing file is an empty catalog; anything that is not
    /// a JSON array is [`CatalogError::Corrupt`]. Individual entries that do
    /// not look like records are skipped.
    pub fn read(&self) -> Result<CatalogStore, CatalogError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(CatalogStore::new()),
            Err(err) => return Err(CatalogError::io(&self.path, err)),
        };
        let entries: Vec<Value> =
            serde_json::from_slice(&bytes).map_err(|err| CatalogError::Corrupt {
                path: self.path.clone(),
                message: err.to_string(),
            })?;
        let total = entries.len();
        let records: Vec<CatalogRecord> = entries
            .into_iter()
            .filter_map(|entry| serde_json::from_value(entry).ok())
            .collect();
        if records.len() != total {
            warn!(
                target = "catalog.store",
                path = %self.path.display(),
                skipped = total - records.len(),
                "ignored malformed catalog entries"
            );
        }
        Ok(CatalogStore::from_records(records))
    }

    /// Lenient read: an unreadable or corrupt catalog is treated as empty.
    /// The bad bytes stay on disk and become the backup of the next write.
    pub fn load(&self) -> CatalogStore {
        match self.read() {
            Ok(store) => store,
            Err(err) => {
                warn!(
                    target = "catalog.store",
                    error = %err,
                    "catalog unreadable; starting from an empty catalog"
                );
                CatalogStore::new()
            }
        }
    }

    /// Writes `store`, returning the backup path when a previous file existed.
    pub fn persist(&self, store: &CatalogStore) -> Result<Option<PathBuf>, CatalogError> {
        let encoded = encode(store)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| CatalogError::io(parent, err))?;
        }
        let backup = self.backup()?;
        let staging = self.staging_path();
        fs::write(&staging, encoded).map_err(|err| CatalogError::io(&staging, err))?;
        fs::rename(&staging, &self.path).map_err(|err| CatalogError::io(&self.path, err))?;
        debug!(
            target = "catalog.store",
            path = %self.path.display(),
            records = store.len(),
            "catalog persisted"
        );
        Ok(backup)
    }

    /// Copies the current file to a timestamped sibling. No-op when the
    /// catalog does not exist yet.
    pub fn backup(&self) -> Result<Option<PathBuf>, CatalogError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let target = self.backup_path();
        fs::copy(&self.path, &target).map_err(|err| CatalogError::io(&target, err))?;
        Ok(Some(target))
    }

    fn backup_path(&self) -> PathBuf {
        let stamp = self.clock.now().format(BACKUP_STAMP).to_string();
        let base = format!("{}.bak.{stamp}", self.file_name());
        let mut candidate = self.path.with_file_name(&base);
        let mut counter = 1;
        while candidate.exists() {
            candidate = self.path.with_file_name(format!("{base}.{counter}"));
            counter += 1;
        }
        candidate
    }

    fn staging_path(&self) -> PathBuf {
        self.path.with_file_name(format!("{}.tmp", self.file_name()))
    }

    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "images.json".to_string())
    }
}

fn encode(store: &CatalogStore) -> Result<Vec<u8>, CatalogError> {
    let records: Vec<&CatalogRecord> = store.records().collect();
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    records.serialize(&mut serializer)?;
    buf.push(b'\n');
    Ok(buf)
}
