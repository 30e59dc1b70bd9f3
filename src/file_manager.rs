// src/file_manager.rs - Data directory layout and atomic file writes
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FileManagerError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("UTF-8 error in {0}")]
    Utf8(PathBuf),
    #[error("Could not replace {path}: {reason}")]
    Persist { path: PathBuf, reason: String },
}

impl FileManagerError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        FileManagerError::Io { path: path.to_path_buf(), source }
    }
}

/// Resolves where persisted state lives under the data directory:
///
/// ```text
/// <data>/APA/<apa-name>.xml
/// <data>/calibration/<layer>.xml
/// <data>/logs/system.log
/// ```
#[derive(Debug, Clone)]
pub struct FileManager {
    data_dir: PathBuf,
}

impl FileManager {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into() }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn apa_path(&self, apa_name: &str) -> PathBuf {
        self.data_dir.join("APA").join(format!("{}.xml", apa_name))
    }

    pub fn calibration_path(&self, layer: &str) -> PathBuf {
        self.data_dir.join("calibration").join(format!("{}.xml", layer))
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join("logs").join("system.log")
    }

    /// Resolve a recipe path given on the UI channel. Relative paths are
    /// taken from `<data>/recipes`.
    pub fn recipe_path(&self, name: &str) -> PathBuf {
        let path = Path::new(name);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join("recipes").join(path)
        }
    }

    /// Create the directory tree for persisted state.
    pub fn ensure_layout(&self) -> Result<(), FileManagerError> {
        for dir in ["APA", "calibration", "logs", "recipes"] {
            let path = self.data_dir.join(dir);
            fs::create_dir_all(&path).map_err(|e| FileManagerError::io(&path, e))?;
        }
        Ok(())
    }

    pub fn read_text(path: &Path) -> Result<String, FileManagerError> {
        let bytes = fs::read(path).map_err(|e| FileManagerError::io(path, e))?;
        String::from_utf8(bytes).map_err(|_| FileManagerError::Utf8(path.to_path_buf()))
    }

    /// Write `contents` to a temporary file beside `path`, flush it to disk,
    /// then rename it over `path`. Readers see either the old or the new file.
    pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), FileManagerError> {
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(|e| FileManagerError::io(&parent, e))?;

        let mut temp = tempfile::NamedTempFile::new_in(&parent).map_err(|e| FileManagerError::io(&parent, e))?;
        temp.write_all(contents).map_err(|e| FileManagerError::io(temp.path(), e))?;
        temp.as_file().sync_all().map_err(|e| FileManagerError::io(temp.path(), e))?;
        temp.persist(path).map_err(|e| FileManagerError::Persist {
            path: path.to_path_buf(),
            reason: e.error.to_string(),
        })?;
        tracing::debug!("Wrote {} bytes to {}", contents.len(), path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn layout_paths() {
        let files = FileManager::new("/srv/winder");
        assert_eq!(files.apa_path("APA-7"), PathBuf::from("/srv/winder/APA/APA-7.xml"));
        assert_eq!(files.calibration_path("V"), PathBuf::from("/srv/winder/calibration/V.xml"));
        assert_eq!(files.log_path(), PathBuf::from("/srv/winder/logs/system.log"));
        assert_eq!(files.recipe_path("V.gc"), PathBuf::from("/srv/winder/recipes/V.gc"));
        assert_eq!(files.recipe_path("/tmp/V.gc"), PathBuf::from("/tmp/V.gc"));
    }

    #[test]
    fn atomic_write_replaces_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("state.xml");
        FileManager::write_atomic(&path, b"first").unwrap();
        FileManager::write_atomic(&path, b"second").unwrap();
        assert_eq!(FileManager::read_text(&path).unwrap(), "second");
        // Only the target remains; the temporary file was renamed away.
        let entries = fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn read_missing_file_reports_path() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing.gc");
        match FileManager::read_text(&missing) {
            Err(FileManagerError::Io { path, .. }) => assert_eq!(path, missing),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
