// src/process/store.rs - Loads and saves the APA record
use std::path::{Path, PathBuf};

use super::apa::ApaRecord;
use super::PersistenceError;
use crate::file_manager::FileManager;

/// The APA record plus the policy deciding when it is written back.
#[derive(Debug)]
pub struct ApaStore {
    path: PathBuf,
    record: ApaRecord,
    line_interval: usize,
    persisted_line: Option<usize>,
}

impl ApaStore {
    /// Read `<data>/APA/<name>.xml`, or start a fresh record if there is none.
    pub fn load_or_create(files: &FileManager, name: &str, line_interval: usize) -> Result<Self, PersistenceError> {
        let path = files.apa_path(name);
        let record = if path.exists() {
            let record = ApaRecord::from_xml(&FileManager::read_text(&path)?)?;
            tracing::info!(
                "Loaded APA {} (stage {}, line {:?})",
                record.name,
                record.stage,
                record.current_line
            );
            record
        } else {
            tracing::info!("Starting new APA record {}", name);
            ApaRecord::new(name)
        };
        let persisted_line = record.current_line;
        Ok(Self { path, record, line_interval: line_interval.max(1), persisted_line })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self) -> &ApaRecord {
        &self.record
    }

    /// Mutable access for changes that are saved explicitly afterwards.
    pub fn record_mut(&mut self) -> &mut ApaRecord {
        &mut self.record
    }

    pub fn save(&mut self) -> Result<(), PersistenceError> {
        let xml = self.record.to_xml()?;
        FileManager::write_atomic(&self.path, xml.as_bytes())?;
        self.persisted_line = self.record.current_line;
        Ok(())
    }

    /// Track the recipe line; saves once it has moved `line_interval` lines
    /// from the last saved value. Returns whether a save happened.
    pub fn update_line(&mut self, line: usize) -> Result<bool, PersistenceError> {
        if self.record.current_recipe.is_none() {
            return Ok(false);
        }
        self.record.current_line = Some(line);
        let moved = match self.persisted_line {
            Some(saved) => saved.abs_diff(line) >= self.line_interval,
            None => true,
        };
        if moved {
            self.save()?;
        }
        Ok(moved)
    }
}
