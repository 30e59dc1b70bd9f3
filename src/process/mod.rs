// src/process/mod.rs
//! State that outlives the process: the APA record and the system log.
pub mod apa;
pub mod store;
pub mod system_log;

pub use apa::{ApaRecord, ApaStage, FaultRecord};
pub use store::ApaStore;
pub use system_log::SystemLog;

use thiserror::Error;

use crate::file_manager::FileManagerError;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("File error: {0}")]
    File(#[from] FileManagerError),
    #[error("XML error: {0}")]
    Xml(String),
    #[error("Invalid APA record: {0}")]
    Invalid(String),
}
