// src/process/system_log.rs - Tab-separated operational log
use chrono::Utc;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::PersistenceError;
use crate::file_manager::FileManagerError;

/// Appends `time \t module \t kind \t message \t params` lines to
/// `<data>/logs/system.log`. Each entry is a single write.
#[derive(Debug)]
pub struct SystemLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl SystemLog {
    pub fn open(path: &Path) -> Result<Self, PersistenceError> {
        let io_error = |source| FileManagerError::Io { path: path.to_path_buf(), source };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path).map_err(io_error)?;
        Ok(Self { path: path.to_path_buf(), file: Mutex::new(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log(&self, module: &str, kind: &str, message: &str, params: &[(&str, String)]) -> Result<(), PersistenceError> {
        let params: Vec<String> = params.iter().map(|(key, value)| format!("{}={}", key, clean(value))).collect();
        let entry = format!(
            "{}\t{}\t{}\t{}\t{}\n",
            Utc::now().to_rfc3339(),
            clean(module),
            clean(kind),
            clean(message),
            params.join(";")
        );
        let mut file = self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        file.write_all(entry.as_bytes())
            .map_err(|source| FileManagerError::Io { path: self.path.clone(), source })?;
        Ok(())
    }

    /// Log, and only warn if the log itself cannot be written.
    pub fn record(&self, module: &str, kind: &str, message: &str, params: &[(&str, String)]) {
        if let Err(e) = self.log(module, kind, message, params) {
            tracing::warn!("Could not append to {}: {}", self.path.display(), e);
        }
    }
}

fn clean(field: &str) -> String {
    field.replace(['\t', '\n', '\r'], " ")
}
