// src/machine/modes.rs - One handler per machine mode
use super::{MachineContext, MachineError, ManualRequest, Mode};
use crate::calibration::PinId;
use crate::gcode::{HandlerError, HandlerState, StepOutcome};

/// A machine mode. `update` runs once per tick and returns the mode to
/// switch to, if any. Errors returned from these calls are fatal. The APA
/// record is saved after every `exit`.
pub trait ModeHandler: Send {
    fn enter(&mut self, _ctx: &mut MachineContext) -> Result<(), MachineError> {
        Ok(())
    }

    fn update(&mut self, ctx: &mut MachineContext) -> Result<Option<Mode>, MachineError>;

    fn exit(&mut self, _ctx: &mut MachineContext) -> Result<(), MachineError> {
        Ok(())
    }
}

/// Idle. Picks up start, manual and calibration requests.
pub struct StopMode;

impl ModeHandler for StopMode {
    fn enter(&mut self, ctx: &mut MachineContext) -> Result<(), MachineError> {
        ctx.stop_requested = false;
        Ok(())
    }

    fn update(&mut self, ctx: &mut MachineContext) -> Result<Option<Mode>, MachineError> {
        ctx.stop_requested = false;
        if ctx.shutdown_requested {
            ctx.start_requested = false;
            ctx.pending_manual.clear();
            ctx.pending_calibration = None;
            return Ok(None);
        }
        if ctx.start_requested {
            ctx.start_requested = false;
            return Ok(Some(Mode::Wind));
        }
        if ctx.pending_calibration.is_some() {
            return Ok(Some(Mode::Calibration));
        }
        if !ctx.pending_manual.is_empty() {
            return Ok(Some(Mode::Manual));
        }
        Ok(None)
    }
}

/// Jog, head and latch moves, one per tick.
pub struct ManualMode;

impl ModeHandler for ManualMode {
    fn update(&mut self, ctx: &mut MachineContext) -> Result<Option<Mode>, MachineError> {
        if let Some(fault) = ctx.plc.get().fault_description() {
            if !ctx.pending_manual.is_empty() {
                tracing::warn!("Dropping {} manual moves: {}", ctx.pending_manual.len(), fault);
                ctx.pending_manual.clear();
            }
            ctx.motion_fault("manual", &fault)?;
            return Ok(Some(Mode::Stop));
        }

        if ctx.stop_requested {
            ctx.pending_manual.clear();
        }

        if let Some(request) = ctx.pending_manual.pop_front() {
            if ctx.queue.free() == 0 {
                ctx.pending_manual.push_front(request);
                return Ok(None);
            }
            let queued = match request {
                ManualRequest::Jog { target, velocity } => ctx.handler.jog(&ctx.queue, target, velocity),
                ManualRequest::Head(side) => ctx.handler.manual_head(&ctx.queue, side),
                ManualRequest::Latch(side) => ctx.handler.manual_latch(&ctx.queue, side),
            };
            match queued {
                Ok(primitive) => tracing::info!("Manual {}", primitive),
                Err(HandlerError::QueueFull(_)) => ctx.pending_manual.push_front(request),
                Err(e) => {
                    tracing::warn!("Manual move rejected: {}", e);
                    ctx.log.record("manual", "rejected", &e.to_string(), &[]);
                    ctx.last_error = Some(e.to_string());
                }
            }
            return Ok(None);
        }

        if ctx.queue.is_empty() {
            return Ok(Some(Mode::Stop));
        }
        Ok(None)
    }
}

/// Runs the loaded recipe.
pub struct WindMode;

impl ModeHandler for WindMode {
    fn enter(&mut self, ctx: &mut MachineContext) -> Result<(), MachineError> {
        let Some(session) = ctx.handler.session() else {
            return Ok(());
        };
        let layer = session.layer.clone();
        let line = session.cursor;
        ctx.wind_base = ctx.apa.record().wound_length(&layer) - ctx.handler.committed_wire_length();
        ctx.last_error = None;
        tracing::info!("Winding layer {} from line {}", layer, line);
        ctx.log.record("wind", "start", &format!("winding layer {}", layer), &[("line", line.to_string())]);
        Ok(())
    }

    fn update(&mut self, ctx: &mut MachineContext) -> Result<Option<Mode>, MachineError> {
        ctx.handler.record_wind_time(ctx.period);
        ctx.handler.settle(&ctx.queue);

        if let Some(fault) = ctx.plc.get().fault_description() {
            ctx.fault("plc", &fault)?;
            return Ok(Some(Mode::Stop));
        }

        if ctx.stop_requested {
            ctx.handler.request_stop();
        }

        match ctx.handler.state() {
            HandlerState::Stopping => {
                if !ctx.handler.drain(ctx.queue.is_empty()) {
                    ctx.sync_progress()?;
                    return Ok(None);
                }
                if ctx.handler.state() == HandlerState::Done {
                    ctx.finish_recipe()?;
                } else {
                    ctx.sync_progress()?;
                    let line = ctx.handler.committed_line().map(|l| l.to_string()).unwrap_or_default();
                    ctx.log.record("wind", "stopped", "winding stopped", &[("line", line)]);
                }
                return Ok(Some(Mode::Stop));
            }
            HandlerState::Done => {
                if ctx.queue.is_empty() {
                    ctx.finish_recipe()?;
                    return Ok(Some(Mode::Stop));
                }
                ctx.sync_progress()?;
                return Ok(None);
            }
            HandlerState::Idle => return Ok(Some(Mode::Stop)),
            _ => {}
        }

        // Fill the queue; every line goes in whole or not at all.
        for _ in 0..ctx.queue.capacity() {
            match ctx.handler.step(&ctx.queue) {
                Ok(StepOutcome::Advanced) => {}
                Ok(StepOutcome::Break) => {
                    let line = ctx.handler.get_line().map(|l| l.to_string()).unwrap_or_default();
                    ctx.log.record("wind", "break", "recipe break", &[("line", line)]);
                    break;
                }
                Ok(StepOutcome::Blocked(_)) | Ok(StepOutcome::Finished) => break,
                Err(e) => {
                    ctx.fault("recipe", &e.to_string())?;
                    return Ok(Some(Mode::Stop));
                }
            }
        }
        ctx.sync_progress()?;
        Ok(None)
    }

    fn exit(&mut self, ctx: &mut MachineContext) -> Result<(), MachineError> {
        ctx.sync_progress()
    }
}

/// Seeks to one calibrated pin so its position can be checked.
#[derive(Default)]
pub struct CalibrationMode {
    target: Option<PinId>,
    issued: bool,
}

impl CalibrationMode {
    fn log_position(ctx: &MachineContext, pin: Option<PinId>, kind: &str) {
        let position = ctx.plc.get().position;
        let pin = pin.map(|p| p.to_string()).unwrap_or_default();
        tracing::info!("Calibration {} at {} (pin {})", kind, position, pin);
        ctx.log.record(
            "calibration",
            kind,
            &format!("head at {}", position),
            &[("pin", pin), ("x", position.x.to_string()), ("y", position.y.to_string())],
        );
    }
}

impl ModeHandler for CalibrationMode {
    fn enter(&mut self, ctx: &mut MachineContext) -> Result<(), MachineError> {
        self.target = ctx.pending_calibration.take();
        self.issued = false;
        Ok(())
    }

    fn update(&mut self, ctx: &mut MachineContext) -> Result<Option<Mode>, MachineError> {
        if let Some(fault) = ctx.plc.get().fault_description() {
            ctx.motion_fault("calibration", &fault)?;
            return Ok(Some(Mode::Stop));
        }

        if !self.issued {
            let Some(pin) = self.target else {
                return Ok(Some(Mode::Stop));
            };
            if ctx.stop_requested {
                Self::log_position(ctx, Some(pin), "stopped");
                return Ok(Some(Mode::Stop));
            }
            if ctx.queue.free() == 0 {
                return Ok(None);
            }
            match ctx.handler.seek_pin(&ctx.queue, pin) {
                Ok(primitive) => {
                    tracing::info!("Calibration seek to {}: {}", pin, primitive);
                    self.issued = true;
                }
                Err(e) => {
                    tracing::warn!("Calibration seek to {} rejected: {}", pin, e);
                    ctx.last_error = Some(e.to_string());
                    return Ok(Some(Mode::Stop));
                }
            }
            return Ok(None);
        }

        if !ctx.queue.is_empty() {
            return Ok(None);
        }
        let kind = if ctx.stop_requested { "stopped" } else { "reached" };
        Self::log_position(ctx, self.target, kind);
        Ok(Some(Mode::Stop))
    }

    fn exit(&mut self, _ctx: &mut MachineContext) -> Result<(), MachineError> {
        self.target = None;
        self.issued = false;
        Ok(())
    }
}
