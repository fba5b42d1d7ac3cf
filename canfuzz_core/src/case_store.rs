use crate::record::FailureCaseRecord;
use indexmap::IndexMap;
use serde_json::Value;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Default location of the failure-case file, relative to the working directory.
pub const DEFAULT_STORE_PATH: &str = "failure_cases/failure_cases.json";

const CSV_COMMAND_LIMIT: usize = 200;
const CSV_OUTPUT_LIMIT: usize = 500;

/// Errors that can arise while persisting or exporting the case store.
#[derive(Error, Debug)]
pub enum CaseStoreError {
    /// Reading or writing the backing file failed.
    #[error("Case store I/O error: {0}")]
    Io(String),

    /// The in-memory cases could not be encoded as JSON.
    #[error("Case store serialization error: {0}")]
    Serialization(String),

    /// The file on disk is not a valid case document.
    #[error("Case store deserialization error: {0}")]
    Deserialization(String),
}

impl From<std::io::Error> for CaseStoreError {
    fn from(err: std::io::Error) -> Self {
        CaseStoreError::Io(err.to_string())
    }
}

type CaseMap = IndexMap<String, Vec<FailureCaseRecord>>;

/// Durable, deduplicated collection of failure cases keyed by module.
///
/// All mutation goes through one internal lock that is held across the
/// rewrite of the backing file, so concurrent callers queue behind each
/// other and the file always reflects a complete state. A failed write is
/// logged and the in-memory cases are kept.
pub struct CaseStore {
    path: Option<PathBuf>,
    cases: Mutex<CaseMap>,
}

impl CaseStore {
    /// A store that never touches the disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            cases: Mutex::new(IndexMap::new()),
        }
    }

    /// Loads the store backed by `path`.
    ///
    /// A missing file gives an empty store. A file that is not UTF-8 JSON
    /// is copied aside to `<path>.corrupt` and also gives an empty store.
    /// Individual records that do not have the expected shape are dropped.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let cases = match load_document(&path) {
            Ok(cases) => cases,
            Err(CaseStoreError::Deserialization(e)) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "failure case file is corrupt, starting empty"
                );
                quarantine(&path);
                IndexMap::new()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not read failure case file");
                IndexMap::new()
            }
        };
        let count: usize = cases.values().map(Vec::len).sum();
        info!(path = %path.display(), count, "loaded failure cases");
        Self {
            path: Some(path),
            cases: Mutex::new(cases),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, CaseMap> {
        self.cases.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds `record` under `module` unless a record with the same timestamp
    /// and command is already stored there. Returns whether it was inserted.
    pub fn add(&self, module: &str, record: FailureCaseRecord) -> bool {
        let mut cases = self.lock();
        let list = cases.entry(module.to_string()).or_default();
        if list.iter().any(|r| r.same_key(&record.timestamp, &record.command)) {
            debug!(module, timestamp = %record.timestamp, "duplicate failure case ignored");
            return false;
        }
        list.push(record);
        self.persist_locked(&cases);
        true
    }

    /// Records for one module, or every record in module order.
    pub fn get(&self, module: Option<&str>) -> Vec<FailureCaseRecord> {
        let cases = self.lock();
        match module {
            Some(module) => cases.get(module).cloned().unwrap_or_default(),
            None => cases.values().flatten().cloned().collect(),
        }
    }

    /// Removes the records of one module, or all of them. The module key goes with them.
    ///
    /// The removal stands in memory even when writing the file fails.
    pub fn clear(&self, module: Option<&str>) -> Result<(), CaseStoreError> {
        let mut cases = self.lock();
        match module {
            Some(module) => {
                cases.shift_remove(module);
            }
            None => cases.clear(),
        }
        self.write_locked(&cases)
    }

    /// Removes one record. Returns false if nothing matched.
    pub fn delete(
        &self,
        module: &str,
        timestamp: &str,
        command: &str,
    ) -> Result<bool, CaseStoreError> {
        let mut cases = self.lock();
        let Some(list) = cases.get_mut(module) else {
            return Ok(false);
        };
        let before = list.len();
        list.retain(|r| !r.same_key(timestamp, command));
        if list.len() == before {
            return Ok(false);
        }
        if list.is_empty() {
            cases.shift_remove(module);
        }
        self.write_locked(&cases)?;
        Ok(true)
    }

    /// Looks a record up by the prefix of its fingerprint.
    pub fn find(&self, fingerprint: &str) -> Option<FailureCaseRecord> {
        if fingerprint.is_empty() {
            return None;
        }
        self.lock()
            .values()
            .flatten()
            .find(|r| r.fingerprint().starts_with(fingerprint))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of stored records per module, in module order.
    pub fn summary(&self) -> IndexMap<String, usize> {
        self.lock()
            .iter()
            .map(|(module, list)| (module.clone(), list.len()))
            .collect()
    }

    /// Writes the full mapping to the backing file.
    pub fn persist(&self) -> Result<(), CaseStoreError> {
        let cases = self.lock();
        match &self.path {
            Some(path) => write_document(path, &cases),
            None => Ok(()),
        }
    }

    fn write_locked(&self, cases: &CaseMap) -> Result<(), CaseStoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        write_document(path, cases).inspect_err(|e| {
            error!(path = %path.display(), error = %e, "failed to persist failure cases");
        })
    }

    fn persist_locked(&self, cases: &CaseMap) {
        // Logged by write_locked; memory keeps the change.
        let _ = self.write_locked(cases);
    }

    /// Writes every record as CSV. Returns the number of rows written.
    pub fn export_csv(&self, path: &Path) -> Result<usize, CaseStoreError> {
        let records = self.get(None);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(out, "timestamp,module,status,command,output_preview")?;
        for r in &records {
            let command = truncate_chars(&r.command, CSV_COMMAND_LIMIT);
            let output = truncate_chars(&r.output, CSV_OUTPUT_LIMIT).replace(['\r', '\n'], " ");
            writeln!(
                out,
                "{},{},{},{},{}",
                csv_field(&r.timestamp),
                csv_field(&r.module),
                csv_field(&r.status),
                csv_field(command),
                csv_field(&output)
            )?;
        }
        out.flush()?;
        info!(path = %path.display(), rows = records.len(), "exported failure cases");
        Ok(records.len())
    }
}

fn load_document(path: &Path) -> Result<CaseMap, CaseStoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no failure case file yet");
            return Ok(IndexMap::new());
        }
        Err(e) => return Err(e.into()),
    };
    let content = String::from_utf8(bytes)
        .map_err(|e| CaseStoreError::Deserialization(format!("File is not UTF-8: {e}")))?;
    parse_document(&content)
}

fn parse_document(content: &str) -> Result<CaseMap, CaseStoreError> {
    let mut cases = IndexMap::new();
    if content.trim().is_empty() {
        return Ok(cases);
    }

    let root: Value = serde_json::from_str(content)
        .map_err(|e| CaseStoreError::Deserialization(format!("Invalid JSON: {e}")))?;
    let Value::Object(modules) = root else {
        return Err(CaseStoreError::Deserialization(
            "Top level is not a JSON object".to_string(),
        ));
    };

    for (module, value) in modules {
        let Value::Array(items) = value else {
            warn!(module = %module, "dropping failure cases that are not a list");
            continue;
        };
        let list: &mut Vec<FailureCaseRecord> = cases.entry(module.clone()).or_default();
        for item in items {
            match serde_json::from_value::<FailureCaseRecord>(item) {
                Ok(record) => {
                    if !list.iter().any(|r| r.same_key(&record.timestamp, &record.command)) {
                        list.push(record);
                    }
                }
                Err(e) => warn!(module = %module, error = %e, "dropping malformed failure case"),
            }
        }
        if list.is_empty() {
            cases.shift_remove(&module);
        }
    }
    Ok(cases)
}

fn quarantine(path: &Path) {
    let mut target = path.as_os_str().to_owned();
    target.push(".corrupt");
    if let Err(e) = fs::copy(path, &target) {
        warn!(path = %path.display(), error = %e, "could not keep a copy of the corrupt file");
    }
}

fn write_document(path: &Path, cases: &CaseMap) -> Result<(), CaseStoreError> {
    let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(dir) => dir,
        None => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(|e| {
        CaseStoreError::Io(format!("Failed to create directory {:?}: {}", dir, e))
    })?;

    let tmp = tempfile::NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(tmp.as_file());
        serde_json::to_writer_pretty(&mut writer, cases).map_err(|e| {
            CaseStoreError::Serialization(format!("Failed to encode failure cases: {}", e))
        })?;
        writer.flush()?;
    }
    tmp.persist(path).map_err(|e| {
        CaseStoreError::Io(format!("Failed to replace {:?}: {}", path, e.error))
    })?;
    Ok(())
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn csv_field(s: &str) -> String {
    if s.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
