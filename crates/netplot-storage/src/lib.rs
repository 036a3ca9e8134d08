use netplot_core::{GlobalConfig, PlotRecord};
use serde::Serialize;
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

pub const GLOBAL_CONFIG_FILE: &str = "global_config.json";
pub const MANIFEST_FILE: &str = "filelist.json";
const ARTIFACT_SUFFIX: &str = ".json";
const TEMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("invalid artifact name: {0}")]
    InvalidName(String),
}

fn io_error(path: &Path, source: io::Error) -> StorageError {
    StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// `{area}_{number:03}.json`; the padding keeps lexicographic and numeric order aligned
/// up to 999 plots per cell.
pub fn plot_artifact_name(plot_area: u32, plot_number: u32) -> String {
    format!("{plot_area}_{plot_number:03}{ARTIFACT_SUFFIX}")
}

/// Global config or `<digits>_<anything>.json`. The manifest is not an artifact.
pub fn is_artifact_name(name: &str) -> bool {
    if name == GLOBAL_CONFIG_FILE {
        return true;
    }
    let Some(stem) = name.strip_suffix(ARTIFACT_SUFFIX) else {
        return false;
    };
    match stem.split_once('_') {
        Some((area, _)) => !area.is_empty() && area.bytes().all(|byte| byte.is_ascii_digit()),
        None => false,
    }
}

/// Write-once artifact directory shared by every cell of a grid.
///
/// Names written during the current lifecycle are tracked explicitly; create-exclusive
/// file creation backs that up for files left on disk by anything else.
pub struct ArtifactStore {
    root: PathBuf,
    written: Mutex<HashSet<String>>,
}

impl ArtifactStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|err| io_error(&root, err))?;
        Ok(Self {
            root,
            written: Mutex::new(HashSet::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn written(&self) -> MutexGuard<'_, HashSet<String>> {
        self.written
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Creates `name` with `payload` unless it was already written; never overwrites.
    pub fn write_once(&self, name: &str, payload: &[u8]) -> Result<bool, StorageError> {
        validate_name(name)?;
        if !self.written().insert(name.to_string()) {
            return Ok(false);
        }

        let path = self.root.join(name);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
            Err(err) => {
                self.written().remove(name);
                return Err(io_error(&path, err));
            }
        };

        let result = file.write_all(payload).and_then(|_| file.sync_all());
        if let Err(err) = result {
            drop(file);
            let _ = fs::remove_file(&path);
            self.written().remove(name);
            return Err(io_error(&path, err));
        }
        Ok(true)
    }

    pub fn write_json_once<T: Serialize>(&self, name: &str, value: &T) -> Result<bool, StorageError> {
        let payload = serde_json::to_vec_pretty(value)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        self.write_once(name, &payload)
    }

    pub fn write_global(&self, config: &GlobalConfig) -> Result<bool, StorageError> {
        self.write_json_once(GLOBAL_CONFIG_FILE, config)
    }

    pub fn write_plot(&self, record: &PlotRecord) -> Result<bool, StorageError> {
        self.write_json_once(
            &plot_artifact_name(record.plot_area, record.plot_number),
            record,
        )
    }

    pub fn list_artifacts(&self) -> Result<Vec<String>, StorageError> {
        let mut names = self
            .dir_entries()?
            .into_iter()
            .filter(|name| is_artifact_name(name))
            .collect::<Vec<_>>();
        names.sort();
        Ok(names)
    }

    /// Deletes every artifact plus the manifest and forgets the names written so far.
    /// Unrelated files in the directory are left alone.
    pub fn sweep(&self) -> Result<usize, StorageError> {
        let mut removed = 0;
        for name in self.dir_entries()? {
            if !is_artifact_name(&name) && !is_manifest_name(&name) {
                continue;
            }
            let path = self.root.join(&name);
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(io_error(&path, err)),
            }
        }
        self.written().clear();
        Ok(removed)
    }

    /// Rebuilds the manifest from the directory and swaps it in atomically.
    pub fn write_manifest(&self) -> Result<Vec<String>, StorageError> {
        let names = self.list_artifacts()?;
        let payload = serde_json::to_vec_pretty(&names)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        write_atomic(&self.root.join(MANIFEST_FILE), &payload)?;
        Ok(names)
    }

    fn dir_entries(&self) -> Result<Vec<String>, StorageError> {
        let entries = fs::read_dir(&self.root).map_err(|err| io_error(&self.root, err))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| io_error(&self.root, err))?;
            let is_file = entry
                .file_type()
                .map(|file_type| file_type.is_file())
                .unwrap_or(false);
            if !is_file {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }
}

fn is_manifest_name(name: &str) -> bool {
    name == MANIFEST_FILE || name.strip_suffix(TEMP_SUFFIX) == Some(MANIFEST_FILE)
}

fn validate_name(name: &str) -> Result<(), StorageError> {
    let valid = name.ends_with(ARTIFACT_SUFFIX)
        && name.len() > ARTIFACT_SUFFIX.len()
        && !name.contains(['/', '\\'])
        && !name.starts_with('.')
        && name != MANIFEST_FILE;
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidName(name.to_string()))
    }
}

fn write_atomic(path: &Path, payload: &[u8]) -> Result<(), StorageError> {
    let temp_path = match path.file_name() {
        Some(name) => path.with_file_name(format!("{}{TEMP_SUFFIX}", name.to_string_lossy())),
        None => path.with_extension("tmp"),
    };
    fs::write(&temp_path, payload).map_err(|err| io_error(&temp_path, err))?;
    fs::rename(&temp_path, path).map_err(|err| io_error(path, err))?;
    Ok(())
}
