// src/gcode/handler.rs - Recipe execution engine
//! The handler owns the active recipe and the planned [`MachineState`].
//!
//! Each [`GCodeHandler::step`] plans the line under the cursor and pushes
//! all of its primitives onto the [`MotionQueue`] at once, or none of them.
//! Lines whose primitives are still queued are tracked so that a PLC fault
//! can rewind to the first line whose motion did not finish.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use super::command::GCodeLine;
use super::planner::{self, LinePlanner, MachineState};
use super::recipe::{Recipe, RecipeError};
use crate::calibration::{CalibrationError, CalibrationLibrary, PinId, PinTable};
use crate::config::MotionConfig;
use crate::geometry::{FaceSide, LayerGeometry, Location, MachineGeometry, SeekError};
use crate::motion::{MotionPrimitive, MotionQueue, QueueFull};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Recipe error: {0}")]
    Recipe(#[from] RecipeError),
    #[error("Calibration error: {0}")]
    Calibration(#[from] CalibrationError),
    #[error("No geometry configured for layer '{0}'")]
    UnknownLayer(String),
    #[error("No recipe loaded")]
    NoRecipe,
    #[error("Line {line} is outside the recipe ({len} lines)")]
    LineOutOfRange { line: usize, len: usize },
    #[error("Target {target} is outside the machine envelope")]
    OutOfBounds { target: Location },
    #[error("Seek failed: {0}")]
    Seek(#[from] SeekError),
    #[error("Head can only cross the frame inside the transfer area (at {position})")]
    NotInTransferArea { position: Location },
    #[error("Motion limits must be positive (velocity {velocity})")]
    InvalidLimits { velocity: f64 },
    #[error(transparent)]
    QueueFull(#[from] QueueFull),
    #[error("Line {line} needs {needed} queue slots, queue holds {capacity}")]
    LineTooLong { line: usize, needed: usize, capacity: usize },
    #[error("Handler is faulted")]
    Faulted,
    #[error("Handler is busy ({0})")]
    Busy(HandlerState),
    #[error("Cannot {operation} while {from}")]
    InvalidTransition { from: HandlerState, operation: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerState {
    Idle,
    Ready,
    Emitting,
    Blocked,
    Done,
    Faulted,
    Stopping,
}

impl HandlerState {
    /// Primitives of this recipe may still be on their way to the PLC.
    pub fn is_running(self) -> bool {
        matches!(self, HandlerState::Emitting | HandlerState::Blocked | HandlerState::Stopping)
    }
}

impl fmt::Display for HandlerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandlerState::Idle => "idle",
            HandlerState::Ready => "ready",
            HandlerState::Emitting => "emitting",
            HandlerState::Blocked => "blocked",
            HandlerState::Done => "done",
            HandlerState::Faulted => "faulted",
            HandlerState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    QueueFull,
    PlcNotReady,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// One line was planned and enqueued.
    Advanced,
    Blocked(BlockReason),
    /// The line held an `M0`; the handler is now stopping.
    Break,
    Finished,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunningStats {
    /// Wire planned so far, including lines still in the queue.
    pub wire_length: f64,
    /// Wire of lines whose motion has completed.
    pub committed_wire_length: f64,
    pub wind_seconds: f64,
    pub lines_emitted: usize,
    pub line: Option<usize>,
    pub total_lines: usize,
}

/// A loaded recipe and how far through it the handler is.
#[derive(Debug, Clone)]
pub struct RecipeSession {
    pub id: Uuid,
    pub path: Option<PathBuf>,
    pub layer: String,
    pub hash: String,
    pub lines: Vec<GCodeLine>,
    /// Index of the next line to plan.
    pub cursor: usize,
    pub start_line: usize,
    pub pin_table: Arc<PinTable>,
}

#[derive(Debug, Clone)]
struct EmittedLine {
    index: usize,
    wire_length: f64,
    state_before: MachineState,
}

pub struct GCodeHandler {
    geometry: Arc<MachineGeometry>,
    motion: MotionConfig,
    layers: HashMap<String, LayerGeometry>,
    calibrations: CalibrationLibrary,
    session: Option<RecipeSession>,
    machine: MachineState,
    state: HandlerState,
    wire_length: f64,
    wind_time: Duration,
    lines_emitted: usize,
    in_flight: VecDeque<EmittedLine>,
}

impl GCodeHandler {
    pub fn new(
        geometry: Arc<MachineGeometry>,
        motion: MotionConfig,
        layers: HashMap<String, LayerGeometry>,
        calibrations: CalibrationLibrary,
    ) -> Self {
        let machine = MachineState::new(motion.resolve(None));
        Self {
            geometry,
            motion,
            layers,
            calibrations,
            session: None,
            machine,
            state: HandlerState::Idle,
            wire_length: 0.0,
            wind_time: Duration::ZERO,
            lines_emitted: 0,
            in_flight: VecDeque::new(),
        }
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    pub fn machine(&self) -> &MachineState {
        &self.machine
    }

    pub fn session(&self) -> Option<&RecipeSession> {
        self.session.as_ref()
    }

    pub fn geometry(&self) -> &MachineGeometry {
        &self.geometry
    }

    /// Load and verify a recipe file, positioned at `start_line`.
    pub fn load(&mut self, path: &Path, start_line: usize) -> Result<(), HandlerError> {
        self.ensure_not_running()?;
        let recipe = Recipe::load(path)?;
        self.load_recipe(recipe, start_line)
    }

    /// Install an already parsed recipe. Every pin it references must be
    /// calibrated; on any failure the previous session is left untouched.
    pub fn load_recipe(&mut self, recipe: Recipe, start_line: usize) -> Result<(), HandlerError> {
        self.ensure_not_running()?;
        let layer = self
            .layers
            .get(recipe.layer())
            .ok_or_else(|| HandlerError::UnknownLayer(recipe.layer().to_string()))?;
        let table = self.calibrations.get(recipe.layer())?;
        table.validate(layer)?;
        if let Some(pin) = recipe.pin_references().into_iter().find(|pin| !table.contains(*pin)) {
            return Err(CalibrationError::UnknownPin(pin).into());
        }
        if start_line > recipe.len() {
            return Err(HandlerError::LineOutOfRange { line: start_line, len: recipe.len() });
        }

        let session = RecipeSession {
            id: Uuid::new_v4(),
            path: recipe.path().map(Path::to_path_buf),
            layer: recipe.layer().to_string(),
            hash: recipe.hash().to_string(),
            lines: recipe.into_lines(),
            cursor: start_line,
            start_line,
            pin_table: table,
        };
        tracing::info!(
            "Recipe session {} ready: layer {}, {} lines, starting at line {}",
            session.id,
            session.layer,
            session.lines.len(),
            start_line
        );
        self.session = Some(session);
        self.state = HandlerState::Ready;
        self.wire_length = 0.0;
        self.wind_time = Duration::ZERO;
        self.lines_emitted = 0;
        self.in_flight.clear();
        Ok(())
    }

    pub fn unload(&mut self) -> Result<(), HandlerError> {
        self.ensure_not_running()?;
        if let Some(session) = self.session.take() {
            tracing::info!("Recipe session {} unloaded", session.id);
        }
        self.state = HandlerState::Idle;
        self.in_flight.clear();
        Ok(())
    }

    /// Plan the next line and enqueue its primitives.
    pub fn step(&mut self, queue: &MotionQueue) -> Result<StepOutcome, HandlerError> {
        match self.state {
            HandlerState::Ready | HandlerState::Emitting | HandlerState::Blocked => {}
            HandlerState::Done => return Ok(StepOutcome::Finished),
            HandlerState::Stopping => return Ok(StepOutcome::Blocked(BlockReason::Stopping)),
            HandlerState::Faulted => return Err(HandlerError::Faulted),
            HandlerState::Idle => {
                return Err(match self.session {
                    Some(_) => HandlerError::InvalidTransition { from: HandlerState::Idle, operation: "step" },
                    None => HandlerError::NoRecipe,
                });
            }
        }

        let session = self.session.as_ref().ok_or(HandlerError::NoRecipe)?;
        let index = session.cursor;
        let Some(line) = session.lines.get(index) else {
            self.state = HandlerState::Done;
            return Ok(StepOutcome::Finished);
        };

        if !queue.consumer_ready() {
            self.state = HandlerState::Blocked;
            return Ok(StepOutcome::Blocked(BlockReason::PlcNotReady));
        }

        let plan = match LinePlanner::new(&self.geometry, &self.motion, Some(session.pin_table.as_ref()), self.machine.clone())
            .plan(line)
        {
            Ok(plan) => plan,
            Err(e) => {
                tracing::error!("Planning failed at line {} (N{}): {}", index, line.number, e);
                self.state = HandlerState::Faulted;
                return Err(e);
            }
        };

        if plan.primitives.len() > queue.capacity() {
            let needed = plan.primitives.len();
            tracing::error!("Line {} can never fit the motion queue ({} primitives)", index, needed);
            self.state = HandlerState::Faulted;
            return Err(HandlerError::LineTooLong { line: index, needed, capacity: queue.capacity() });
        }

        let has_primitives = !plan.primitives.is_empty();
        let count = plan.primitives.len();
        if queue.try_push_all(Some(index), plan.primitives).is_err() {
            self.state = HandlerState::Blocked;
            return Ok(StepOutcome::Blocked(BlockReason::QueueFull));
        }

        tracing::debug!("Line {} (N{}) emitted {} primitives", index, line.number, count);
        let total = session.lines.len();
        if has_primitives {
            self.in_flight.push_back(EmittedLine {
                index,
                wire_length: plan.wire_length,
                state_before: std::mem::replace(&mut self.machine, plan.machine),
            });
        } else {
            self.machine = plan.machine;
        }
        self.wire_length += plan.wire_length;
        self.lines_emitted += 1;
        if let Some(session) = self.session.as_mut() {
            session.cursor = index + 1;
        }

        if plan.has_break {
            tracing::info!("Break at line {}", index);
            self.state = HandlerState::Stopping;
            return Ok(StepOutcome::Break);
        }
        self.state = if index + 1 >= total { HandlerState::Done } else { HandlerState::Emitting };
        Ok(StepOutcome::Advanced)
    }

    /// Forget lines whose primitives have all left the queue.
    pub fn settle(&mut self, queue: &MotionQueue) {
        let oldest = queue.oldest_pending_line();
        while let Some(front) = self.in_flight.front() {
            if oldest.is_some_and(|line| line <= front.index) {
                break;
            }
            self.in_flight.pop_front();
        }
    }

    /// Wire length of every line whose motion has completed.
    pub fn committed_wire_length(&self) -> f64 {
        self.wire_length - self.in_flight.iter().map(|line| line.wire_length).sum::<f64>()
    }

    /// First line that has not fully completed.
    pub fn committed_line(&self) -> Option<usize> {
        let session = self.session.as_ref()?;
        Some(self.in_flight.front().map_or(session.cursor, |line| line.index))
    }

    /// The PLC failed. Rewind to `first_unfinished` (or the oldest line
    /// still in flight), dropping the wire planned for the rewound lines.
    pub fn fault(&mut self, first_unfinished: Option<usize>) {
        let rewind_to = first_unfinished
            .or_else(|| self.in_flight.front().map(|line| line.index))
            .or_else(|| self.session.as_ref().map(|s| s.cursor));

        if let Some(rewind_to) = rewind_to {
            let mut restored = None;
            while self.in_flight.back().is_some_and(|line| line.index >= rewind_to) {
                if let Some(line) = self.in_flight.pop_back() {
                    self.wire_length -= line.wire_length;
                    self.lines_emitted = self.lines_emitted.saturating_sub(1);
                    restored = Some(line.state_before);
                }
            }
            if let Some(machine) = restored {
                self.machine = machine;
            }
            if let Some(session) = self.session.as_mut() {
                if rewind_to < session.cursor {
                    tracing::warn!("Rewinding recipe from line {} to {}", session.cursor, rewind_to);
                    session.cursor = rewind_to;
                }
            }
        }
        self.in_flight.clear();
        self.state = HandlerState::Faulted;
    }

    pub fn clear_fault(&mut self) -> Result<(), HandlerError> {
        if self.state != HandlerState::Faulted {
            return Err(HandlerError::InvalidTransition { from: self.state, operation: "clear fault" });
        }
        self.state = if self.session.is_some() { HandlerState::Ready } else { HandlerState::Idle };
        Ok(())
    }

    /// Ask the handler to stop planning. Safe to call any number of times.
    pub fn request_stop(&mut self) {
        match self.state {
            HandlerState::Ready | HandlerState::Emitting | HandlerState::Blocked | HandlerState::Done => {
                tracing::info!("Handler stopping at line {:?}", self.get_line());
                self.state = HandlerState::Stopping;
            }
            HandlerState::Idle | HandlerState::Faulted | HandlerState::Stopping => {}
        }
    }

    /// Complete a stop once the queue has emptied. Returns true when idle.
    pub fn drain(&mut self, queue_empty: bool) -> bool {
        if self.state == HandlerState::Stopping && queue_empty {
            self.in_flight.clear();
            let finished = self.session.as_ref().is_some_and(|s| s.cursor >= s.lines.len());
            self.state = if finished { HandlerState::Done } else { HandlerState::Idle };
        }
        !self.state.is_running()
    }

    /// Resume a stopped or faulted session.
    pub fn arm(&mut self) -> Result<(), HandlerError> {
        match self.state {
            HandlerState::Ready | HandlerState::Emitting | HandlerState::Blocked => Ok(()),
            HandlerState::Idle if self.session.is_some() => {
                self.state = HandlerState::Ready;
                Ok(())
            }
            HandlerState::Idle => Err(HandlerError::NoRecipe),
            HandlerState::Faulted => self.clear_fault(),
            HandlerState::Stopping => Err(HandlerError::Busy(HandlerState::Stopping)),
            HandlerState::Done => Err(HandlerError::InvalidTransition { from: HandlerState::Done, operation: "arm" }),
        }
    }

    pub fn set_line(&mut self, line: usize) -> Result<(), HandlerError> {
        self.ensure_not_running()?;
        let session = self.session.as_mut().ok_or(HandlerError::NoRecipe)?;
        if line > session.lines.len() {
            return Err(HandlerError::LineOutOfRange { line, len: session.lines.len() });
        }
        session.cursor = line;
        self.in_flight.clear();
        if self.state == HandlerState::Done && line < session.lines.len() {
            self.state = HandlerState::Ready;
        }
        Ok(())
    }

    pub fn get_line(&self) -> Option<usize> {
        self.session.as_ref().map(|s| s.cursor)
    }

    pub fn record_wind_time(&mut self, elapsed: Duration) {
        self.wind_time += elapsed;
    }

    pub fn running_stats(&self) -> RunningStats {
        RunningStats {
            wire_length: self.wire_length,
            committed_wire_length: self.committed_wire_length(),
            wind_seconds: self.wind_time.as_secs_f64(),
            lines_emitted: self.lines_emitted,
            line: self.get_line(),
            total_lines: self.session.as_ref().map_or(0, |s| s.lines.len()),
        }
    }

    /// Adopt the position the PLC reports while nothing is queued.
    pub fn sync_position(&mut self, position: Location) {
        if !self.state.is_running() {
            self.machine.position = position;
        }
    }

    // --- manual and calibration moves ---
    //
    // Each of these plans on a copy of the machine state and only adopts it
    // once the primitive is on the queue.

    pub fn jog(&mut self, queue: &MotionQueue, target: Location, velocity: Option<f64>) -> Result<MotionPrimitive, HandlerError> {
        self.ensure_not_running()?;
        let limits = self.motion.resolve(velocity);
        let requested = velocity.unwrap_or(limits.velocity);
        // `resolve` clamps with `min`, which would turn NaN into the maximum.
        if !(requested.is_finite() && requested > 0.0) || !limits.is_valid() {
            return Err(HandlerError::InvalidLimits { velocity: requested });
        }
        let mut machine = self.machine.clone();
        planner::travel_update(&self.geometry, &mut machine, target)?;
        machine.limits = limits;
        self.enqueue_manual(queue, machine, MotionPrimitive::Move { to: target, limits })
    }

    pub fn manual_head(&mut self, queue: &MotionQueue, side: FaceSide) -> Result<MotionPrimitive, HandlerError> {
        self.ensure_not_running()?;
        let change = planner::head_change(&self.geometry, &self.machine, side)?;
        let mut machine = self.machine.clone();
        machine.head = side;
        machine.position.z = change.z;
        self.enqueue_manual(queue, machine, MotionPrimitive::Head { side, z: change.z })
    }

    pub fn manual_latch(&mut self, queue: &MotionQueue, side: FaceSide) -> Result<MotionPrimitive, HandlerError> {
        self.ensure_not_running()?;
        let mut machine = self.machine.clone();
        machine.latch = side;
        self.enqueue_manual(queue, machine, MotionPrimitive::Latch { side })
    }

    /// Move to a calibrated pin of the loaded recipe's layer.
    pub fn seek_pin(&mut self, queue: &MotionQueue, pin: PinId) -> Result<MotionPrimitive, HandlerError> {
        self.ensure_not_running()?;
        let session = self.session.as_ref().ok_or(HandlerError::NoRecipe)?;
        let target = session.pin_table.resolve(pin)?;
        let limits = self.motion.resolve(None);
        let mut machine = self.machine.clone();
        planner::travel_update(&self.geometry, &mut machine, target)?;
        machine.active_pin = Some(pin);
        self.enqueue_manual(queue, machine, MotionPrimitive::Move { to: target, limits })
    }

    fn enqueue_manual(
        &mut self,
        queue: &MotionQueue,
        machine: MachineState,
        primitive: MotionPrimitive,
    ) -> Result<MotionPrimitive, HandlerError> {
        queue.push(None, primitive.clone())?;
        self.machine = machine;
        Ok(primitive)
    }

    fn ensure_not_running(&self) -> Result<(), HandlerError> {
        if self.state.is_running() {
            return Err(HandlerError::Busy(self.state));
        }
        Ok(())
    }
}
