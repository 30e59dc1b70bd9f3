//! Documents published to UI clients.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::gcode::{HandlerState, RunningStats};
use crate::geometry::{FaceSide, Location};
use crate::machine::Mode;
use crate::motion::QueueStats;
use crate::plc::PlcStatus;
use crate::process::{ApaStage, FaultRecord};

/// Everything a read-only observer sees, rewritten once per control tick.
#[derive(Debug, Clone, Serialize)]
pub struct MachineSnapshot {
    pub mode: Mode,
    pub handler_state: HandlerState,
    pub position: Location,
    pub latch: FaceSide,
    pub head: FaceSide,
    pub active_pin: Option<String>,
    pub recipe: Option<RecipeSummary>,
    pub stats: RunningStats,
    pub queue: QueueStats,
    pub plc: PlcStatus,
    pub apa: ApaSummary,
    pub stop_requested: bool,
    pub last_error: Option<String>,
    pub updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecipeSummary {
    pub id: String,
    pub path: Option<String>,
    pub layer: String,
    pub hash: String,
    pub line: usize,
    pub total_lines: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApaSummary {
    pub name: String,
    pub stage: ApaStage,
    pub stage_name: String,
    pub wound_length: BTreeMap<String, f64>,
    pub current_recipe: Option<String>,
    pub current_line: Option<usize>,
    pub fault_count: usize,
    pub last_fault: Option<FaultRecord>,
}
