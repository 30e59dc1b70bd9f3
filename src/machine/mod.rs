// src/machine/mod.rs - Control state machine
//! The [`Machine`] is the single owner of the handler, the APA record and the
//! operator flags. The control loop feeds it UI commands and calls
//! [`Machine::tick`] once per I/O period; everything else only sees the
//! published [`MachineSnapshot`].

pub mod control_loop;
pub mod modes;

pub use control_loop::ControlLoop;
pub use modes::ModeHandler;

use chrono::Utc;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::calibration::{CalibrationLibrary, PinId};
use crate::config::Config;
use crate::file_manager::FileManager;
use crate::gcode::{GCodeHandler, HandlerError};
use crate::geometry::{FaceSide, GeometryError, Location};
use crate::motion::MotionQueue;
use crate::plc::PlcStatusHandle;
use crate::process::{ApaRecord, ApaStore, PersistenceError, SystemLog};
use crate::web::commands::UiCommand;
use crate::web::models::{ApaSummary, MachineSnapshot, RecipeSummary};
use modes::{CalibrationMode, ManualMode, StopMode, WindMode};

/// Errors that end the control loop.
#[derive(Debug, Error)]
pub enum MachineError {
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("Geometry error: {0}")]
    Geometry(#[from] GeometryError),
    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Stop,
    Manual,
    Wind,
    Calibration,
}

impl Mode {
    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Stop => "stop",
            Mode::Manual => "manual",
            Mode::Wind => "wind",
            Mode::Calibration => "calibration",
        };
        f.write_str(name)
    }
}

/// A manual motion waiting for Manual mode to pick it up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ManualRequest {
    Jog { target: Location, velocity: Option<f64> },
    Head(FaceSide),
    Latch(FaceSide),
}

/// Everything the mode handlers work on.
pub struct MachineContext {
    files: FileManager,
    handler: GCodeHandler,
    queue: MotionQueue,
    plc: PlcStatusHandle,
    apa: ApaStore,
    log: SystemLog,
    period: Duration,
    stop_requested: bool,
    start_requested: bool,
    shutdown_requested: bool,
    pending_manual: VecDeque<ManualRequest>,
    pending_calibration: Option<PinId>,
    last_error: Option<String>,
    /// APA wound length of the session's layer minus what this session
    /// has committed; committed wire is added on top of it.
    wind_base: f64,
}

impl MachineContext {
    /// Record a fault: drop pending motion, rewind the handler to the first
    /// unfinished line and save the APA record.
    fn fault(&mut self, kind: &str, message: &str) -> Result<(), MachineError> {
        let dropped = self.queue.clear();
        let first_unfinished = dropped.iter().filter_map(|entry| entry.line).min();
        self.handler.fault(first_unfinished);
        let line = self.handler.committed_line();
        tracing::error!("{} fault at line {:?}: {}", kind, line, message);

        // Wire of the rewound lines will be counted again when they re-run.
        let wound = self.wind_base + self.handler.committed_wire_length();
        let layer = self.handler.session().map(|session| session.layer.clone());
        let record = self.apa.record_mut();
        if let Some(layer) = layer {
            record.set_wound_length(&layer, wound);
        }
        if line.is_some() && record.current_recipe.is_some() {
            record.current_line = line;
        }
        record.record_fault(kind, message, line);
        self.apa.save()?;

        let line_param = line.map(|l| l.to_string()).unwrap_or_default();
        self.log.record("wind", "fault", message, &[("kind", kind.to_string()), ("line", line_param)]);
        self.last_error = Some(message.to_string());
        self.stop_requested = false;
        Ok(())
    }

    /// Record a PLC fault during a manual or calibration move: drop what is
    /// queued, take the PLC's position as the planned one and save.
    fn motion_fault(&mut self, module: &str, message: &str) -> Result<(), MachineError> {
        let dropped = self.queue.clear();
        let position = self.plc.get().position;
        self.handler.sync_position(position);
        tracing::error!("{} fault at {} ({} moves dropped): {}", module, position, dropped.len(), message);

        self.apa.record_mut().record_fault("plc", message, None);
        self.apa.save()?;
        self.log.record(
            module,
            "fault",
            message,
            &[("kind", "plc".to_string()), ("dropped", dropped.len().to_string())],
        );
        self.last_error = Some(message.to_string());
        self.stop_requested = false;
        Ok(())
    }

    /// Push committed wire and the committed line into the APA record.
    fn sync_progress(&mut self) -> Result<(), MachineError> {
        let Some(layer) = self.handler.session().map(|session| session.layer.clone()) else {
            return Ok(());
        };
        let wound = self.wind_base + self.handler.committed_wire_length();
        self.apa.record_mut().set_wound_length(&layer, wound);
        if let Some(line) = self.handler.committed_line() {
            self.apa.update_line(line)?;
        }
        Ok(())
    }

    /// The recipe ran to its end: advance the APA stage and forget the recipe.
    fn finish_recipe(&mut self) -> Result<(), MachineError> {
        self.sync_progress()?;
        let layer = self.handler.session().map(|session| session.layer.clone()).unwrap_or_default();
        let stats = self.handler.running_stats();
        self.handler.unload()?;

        let record = self.apa.record_mut();
        let stage = record.advance_stage();
        record.clear_recipe();
        self.apa.save()?;

        tracing::info!("Layer {} complete, APA now at stage {}", layer, stage);
        self.log.record(
            "wind",
            "complete",
            &format!("layer {} complete", layer),
            &[
                ("stage", stage.to_string()),
                ("wire", format!("{:.3}", stats.wire_length)),
                ("seconds", format!("{:.1}", stats.wind_seconds)),
            ],
        );
        Ok(())
    }
}

pub struct Machine {
    ctx: MachineContext,
    modes: [Box<dyn ModeHandler>; 4],
    mode: Mode,
}

impl Machine {
    /// Build the handler from the configuration and load the APA record.
    pub fn new(config: &Config, files: FileManager, queue: MotionQueue, plc: PlcStatusHandle) -> Result<Self, MachineError> {
        let geometry = Arc::new(config.machine_geometry()?);
        let layers = config.layer_geometries()?;
        let calibrations = CalibrationLibrary::new(config.calibration_paths(&files));
        let handler = GCodeHandler::new(geometry, config.motion, layers, calibrations);

        let apa = ApaStore::load_or_create(&files, &config.machine.apa_name, config.machine.persist_line_interval)?;
        let log = SystemLog::open(&files.log_path())?;

        let ctx = MachineContext {
            files,
            handler,
            queue,
            plc,
            apa,
            log,
            period: config.machine.io_period(),
            stop_requested: false,
            start_requested: false,
            shutdown_requested: false,
            pending_manual: VecDeque::new(),
            pending_calibration: None,
            last_error: None,
            wind_base: 0.0,
        };
        Ok(Self {
            ctx,
            modes: [
                Box::new(StopMode),
                Box::new(ManualMode),
                Box::new(WindMode),
                Box::new(CalibrationMode::default()),
            ],
            mode: Mode::Stop,
        })
    }

    /// Re-load the recipe the APA record was winding when the host went
    /// down. The session is left `Ready`; winding resumes on `start`.
    pub fn boot(&mut self) -> Result<(), MachineError> {
        let record = self.ctx.apa.record().clone();
        self.ctx.log.record("machine", "boot", "host started", &[("apa", record.name.clone())]);
        let status = self.ctx.plc.get();
        if status.responsive {
            self.ctx.handler.sync_position(status.position);
        }
        let Some(recipe) = record.current_recipe else {
            tracing::info!("APA {} has no active recipe", record.name);
            return Ok(());
        };
        let line = record.current_line.unwrap_or(0);
        match self.ctx.handler.load(Path::new(&recipe), line) {
            Ok(()) => {
                tracing::info!("Resuming {} at line {}; waiting for start", recipe, line);
            }
            Err(e) => {
                tracing::warn!("Could not reload {}: {}", recipe, e);
                self.ctx.apa.record_mut().record_fault("boot", e.to_string(), Some(line));
                self.ctx.apa.save()?;
                self.ctx.log.record("machine", "fault", &e.to_string(), &[("recipe", recipe)]);
                self.ctx.last_error = Some(e.to_string());
            }
        }
        Ok(())
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn handler(&self) -> &GCodeHandler {
        &self.ctx.handler
    }

    pub fn apa(&self) -> &ApaRecord {
        self.ctx.apa.record()
    }

    pub fn queue(&self) -> &MotionQueue {
        &self.ctx.queue
    }

    pub fn last_error(&self) -> Option<&str> {
        self.ctx.last_error.as_deref()
    }

    pub fn shutdown_requested(&self) -> bool {
        self.ctx.shutdown_requested
    }

    /// Stopped with nothing left for the PLC.
    pub fn is_quiescent(&self) -> bool {
        self.mode == Mode::Stop && self.ctx.queue.is_empty()
    }

    /// Apply one operator command and return the reply line. Refused
    /// commands are `error` replies; an `Err` is fatal to the control loop.
    pub fn handle(&mut self, command: UiCommand) -> Result<String, MachineError> {
        tracing::debug!("UI command {:?} in {} mode", command, self.mode);
        let reply = match command {
            UiCommand::Start => self.start(),
            UiCommand::Stop => {
                self.ctx.stop_requested = true;
                self.ctx.start_requested = false;
                "ok".to_string()
            }
            UiCommand::Jog { x, y, z, velocity } => {
                let target = Location::new(x, y, z);
                if !self.ctx.handler.geometry().bounds.contains(&target) {
                    return Ok(format!("error {}", HandlerError::OutOfBounds { target }));
                }
                if let Some(velocity) = velocity.filter(|v| !(v.is_finite() && *v > 0.0)) {
                    return Ok(format!("error {}", HandlerError::InvalidLimits { velocity }));
                }
                self.manual(ManualRequest::Jog { target, velocity })
            }
            UiCommand::Head(side) => self.manual(ManualRequest::Head(side)),
            UiCommand::Latch(side) => self.manual(ManualRequest::Latch(side)),
            UiCommand::Load { recipe, line } => self.load(&recipe, line.unwrap_or(0))?,
            UiCommand::Status => match serde_json::to_string(&self.snapshot()) {
                Ok(json) => json,
                Err(e) => format!("error {}", e),
            },
            UiCommand::Calibrate(pin) => self.calibrate(pin),
            UiCommand::Shutdown => {
                tracing::info!("Shutdown requested from the UI channel");
                self.ctx.shutdown_requested = true;
                self.ctx.stop_requested = true;
                self.ctx.start_requested = false;
                "ok shutting down".to_string()
            }
        };
        Ok(reply)
    }

    fn start(&mut self) -> String {
        if self.ctx.shutdown_requested {
            return "error shutting down".to_string();
        }
        if self.mode != Mode::Stop {
            return format!("error busy in {} mode", self.mode);
        }
        if self.ctx.handler.session().is_none() {
            return format!("error {}", HandlerError::NoRecipe);
        }
        if let Some(fault) = self.ctx.plc.get().fault_description() {
            return format!("error {}", fault);
        }
        if let Err(e) = self.ctx.handler.arm() {
            return format!("error {}", e);
        }
        self.ctx.stop_requested = false;
        self.ctx.start_requested = true;
        "ok".to_string()
    }

    fn manual(&mut self, request: ManualRequest) -> String {
        if !matches!(self.mode, Mode::Stop | Mode::Manual) {
            return format!("error busy in {} mode", self.mode);
        }
        if self.ctx.shutdown_requested {
            return "error shutting down".to_string();
        }
        self.ctx.pending_manual.push_back(request);
        "ok".to_string()
    }

    fn load(&mut self, recipe: &str, line: usize) -> Result<String, MachineError> {
        if self.mode != Mode::Stop {
            return Ok(format!("error busy in {} mode", self.mode));
        }
        let path = self.ctx.files.recipe_path(recipe);
        if let Err(e) = self.ctx.handler.load(&path, line) {
            tracing::warn!("Load of {} failed: {}", path.display(), e);
            self.ctx.log.record("machine", "load_failed", &e.to_string(), &[("recipe", path.display().to_string())]);
            return Ok(format!("error {}", e));
        }
        let (layer, lines) = match self.ctx.handler.session() {
            Some(session) => (session.layer.clone(), session.lines.len()),
            None => return Ok(format!("error {}", HandlerError::NoRecipe)),
        };
        self.ctx.apa.record_mut().set_recipe(path.display().to_string(), line);
        if let Err(e) = self.ctx.apa.save() {
            tracing::error!("Could not save APA record: {}", e);
            return Err(e.into());
        }
        self.ctx.log.record(
            "machine",
            "load",
            &format!("recipe {} loaded", path.display()),
            &[("layer", layer.clone()), ("line", line.to_string())],
        );
        Ok(format!("ok {} {} lines", layer, lines))
    }

    fn calibrate(&mut self, pin: PinId) -> String {
        if self.mode != Mode::Stop {
            return format!("error busy in {} mode", self.mode);
        }
        match self.ctx.handler.session() {
            Some(session) if session.pin_table.contains(pin) => {}
            Some(session) => return format!("error pin {} is not calibrated for layer {}", pin, session.layer),
            None => return format!("error {}", HandlerError::NoRecipe),
        }
        self.ctx.pending_calibration = Some(pin);
        "ok".to_string()
    }

    /// Run the active mode once and apply the transition it asks for.
    pub fn tick(&mut self) -> Result<(), MachineError> {
        let next = self.modes[self.mode.index()].update(&mut self.ctx)?;
        if let Some(next) = next {
            self.transition(next)?;
        }
        Ok(())
    }

    fn transition(&mut self, next: Mode) -> Result<(), MachineError> {
        if next == self.mode {
            return Ok(());
        }
        self.modes[self.mode.index()].exit(&mut self.ctx)?;
        self.ctx.apa.save()?;
        tracing::info!("Mode {} -> {}", self.mode, next);
        self.ctx.log.record("machine", "mode", &format!("{} -> {}", self.mode, next), &[]);
        self.mode = next;
        self.modes[next.index()].enter(&mut self.ctx)?;
        Ok(())
    }

    /// Save what is in memory before the process exits.
    pub fn shutdown(&mut self) -> Result<(), MachineError> {
        if self.mode != Mode::Stop {
            tracing::warn!("Shutting down in {} mode", self.mode);
            self.transition(Mode::Stop)?;
        }
        self.ctx.apa.save()?;
        self.ctx.log.record("machine", "shutdown", "host stopping", &[]);
        Ok(())
    }

    pub fn snapshot(&self) -> MachineSnapshot {
        let handler = &self.ctx.handler;
        let machine = handler.machine();
        let record = self.ctx.apa.record();
        MachineSnapshot {
            mode: self.mode,
            handler_state: handler.state(),
            position: machine.position,
            latch: machine.latch,
            head: machine.head,
            active_pin: machine.active_pin.map(|pin| pin.to_string()),
            recipe: handler.session().map(|session| RecipeSummary {
                id: session.id.to_string(),
                path: session.path.as_ref().map(|path| path.display().to_string()),
                layer: session.layer.clone(),
                hash: session.hash.clone(),
                line: session.cursor,
                total_lines: session.lines.len(),
            }),
            stats: handler.running_stats(),
            queue: self.ctx.queue.stats(),
            plc: self.ctx.plc.get(),
            apa: ApaSummary {
                name: record.name.clone(),
                stage: record.stage,
                stage_name: record.stage.to_string(),
                wound_length: record.wound_lengths().clone(),
                current_recipe: record.current_recipe.clone(),
                current_line: record.current_line,
                fault_count: record.faults.len(),
                last_fault: record.faults.last().cloned(),
            },
            stop_requested: self.ctx.stop_requested,
            last_error: self.ctx.last_error.clone(),
            updated: Utc::now(),
        }
    }
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("mode", &self.mode)
            .field("handler", &self.ctx.handler.state())
            .field("queue", &self.ctx.queue.len())
            .finish()
    }
}
