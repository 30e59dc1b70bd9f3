// src/gcode/planner.rs - Turns one G-code line into motion primitives
//! Planning works on a copy of the [`MachineState`]. Nothing is committed
//! until the handler has enqueued every primitive of the line.

use super::command::{Command, GCodeLine, PartialLocation};
use super::handler::HandlerError;
use crate::calibration::{PinId, PinTable};
use crate::config::MotionConfig;
use crate::geometry::{FaceSide, Location, MachineGeometry, SeekError, TransferEdge};
use crate::motion::{MotionLimits, MotionPrimitive};

/// Where the machine will be once everything emitted so far has completed.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineState {
    pub position: Location,
    pub latch: FaceSide,
    pub head: FaceSide,
    pub active_pin: Option<PinId>,
    pub limits: MotionLimits,
    /// XY direction of the last move, used by seeks.
    pub direction: Option<(f64, f64)>,
}

impl MachineState {
    pub fn new(limits: MotionLimits) -> Self {
        Self {
            position: Location::default(),
            latch: FaceSide::Front,
            head: FaceSide::Front,
            active_pin: None,
            limits,
            direction: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinePlan {
    pub primitives: Vec<MotionPrimitive>,
    pub machine: MachineState,
    pub wire_length: f64,
    pub has_break: bool,
}

pub struct LinePlanner<'a> {
    geometry: &'a MachineGeometry,
    motion: &'a MotionConfig,
    pins: Option<&'a PinTable>,
    machine: MachineState,
    limits: MotionLimits,
    pending: Option<Location>,
    pending_seek: Option<(TransferEdge, Location)>,
    primitives: Vec<MotionPrimitive>,
    wire_length: f64,
    has_break: bool,
}

impl<'a> LinePlanner<'a> {
    pub fn new(
        geometry: &'a MachineGeometry,
        motion: &'a MotionConfig,
        pins: Option<&'a PinTable>,
        machine: MachineState,
    ) -> Self {
        let limits = machine.limits;
        Self {
            geometry,
            motion,
            pins,
            machine,
            limits,
            pending: None,
            pending_seek: None,
            primitives: Vec::new(),
            wire_length: 0.0,
            has_break: false,
        }
    }

    pub fn plan(mut self, line: &GCodeLine) -> Result<LinePlan, HandlerError> {
        self.limits = self.motion.resolve(line.feed);
        if !self.limits.is_valid() {
            return Err(HandlerError::InvalidLimits { velocity: self.limits.velocity });
        }
        self.machine.limits = self.limits;

        for command in &line.commands {
            self.apply(command)?;
        }
        self.flush()?;

        Ok(LinePlan {
            primitives: self.primitives,
            machine: self.machine,
            wire_length: self.wire_length,
            has_break: self.has_break,
        })
    }

    fn apply(&mut self, command: &Command) -> Result<(), HandlerError> {
        match command {
            Command::Move { target, .. } => {
                self.flush_seek()?;
                self.set_target(*target);
            }
            Command::PinPositioning { front, back, offset_x, offset_y } => {
                self.flush_seek()?;
                let pins = self.pins.ok_or(HandlerError::NoRecipe)?;
                let front = front.map(PinId::front);
                let back = back.map(PinId::back);
                let base = match (front, back) {
                    (Some(f), Some(b)) => pins.resolve(f)?.midpoint(&pins.resolve(b)?),
                    (Some(pin), None) | (None, Some(pin)) => pins.resolve(pin)?,
                    (None, None) => return Ok(()),
                };
                self.pending = Some(base.offset_xy(*offset_x, *offset_y));
                self.machine.active_pin = front.or(back);
            }
            Command::Clip => {
                let transfer = &self.geometry.transfer;
                if let Some((_, to)) = self.pending_seek.as_mut() {
                    *to = transfer.clip(*to);
                } else {
                    let target = self.pending.unwrap_or(self.machine.position);
                    self.pending = Some(transfer.clip(target));
                }
            }
            Command::SeekTransfer(edge) => {
                self.flush()?;
                let (dx, dy) = self.machine.direction.ok_or(HandlerError::Seek(SeekError::NoDirection))?;
                let to = self.geometry.transfer.intercept(self.machine.position, dx, dy, *edge)?;
                self.pending_seek = Some((*edge, to));
            }
            Command::HeadLocation(side) => {
                self.flush()?;
                self.head(*side)?;
            }
            Command::Latch(side) => {
                self.flush()?;
                self.primitives.push(MotionPrimitive::Latch { side: *side });
                self.machine.latch = *side;
            }
            Command::Delay(ms) => {
                self.flush()?;
                self.primitives.push(MotionPrimitive::Dwell { ms: *ms });
            }
            Command::Break => {
                self.flush()?;
                self.primitives.push(MotionPrimitive::Break);
                self.has_break = true;
            }
        }
        Ok(())
    }

    fn set_target(&mut self, target: PartialLocation) {
        if target.is_empty() {
            return;
        }
        let base = self.pending.unwrap_or(self.machine.position);
        self.pending = Some(Location {
            x: target.x.unwrap_or(base.x),
            y: target.y.unwrap_or(base.y),
            z: target.z.unwrap_or(base.z),
        });
    }

    fn head(&mut self, side: FaceSide) -> Result<(), HandlerError> {
        let plan = head_change(self.geometry, &self.machine, side)?;
        self.wire_length += plan.wire_length;
        self.machine.head = side;
        self.machine.position.z = plan.z;
        self.primitives.push(MotionPrimitive::Head { side, z: plan.z });
        Ok(())
    }

    fn flush_seek(&mut self) -> Result<(), HandlerError> {
        if let Some((edge, to)) = self.pending_seek.take() {
            self.travel(to, Some(edge))?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), HandlerError> {
        self.flush_seek()?;
        if let Some(target) = self.pending.take() {
            if !target.approx_eq(&self.machine.position) {
                self.travel(target, None)?;
            }
        }
        Ok(())
    }

    fn travel(&mut self, to: Location, edge: Option<TransferEdge>) -> Result<(), HandlerError> {
        let length = travel_update(self.geometry, &mut self.machine, to)?;
        self.wire_length += length;
        let limits = self.limits;
        self.primitives.push(match edge {
            Some(edge) => MotionPrimitive::Seek { edge, to, limits },
            None => MotionPrimitive::Move { to, limits },
        });
        Ok(())
    }
}

/// Bounds-check `to`, move the machine there and return the XY length.
pub(crate) fn travel_update(
    geometry: &MachineGeometry,
    machine: &mut MachineState,
    to: Location,
) -> Result<f64, HandlerError> {
    if !to.is_finite() || !geometry.bounds.contains(&to) {
        return Err(HandlerError::OutOfBounds { target: to });
    }
    let from = machine.position;
    let (dx, dy) = (to.x - from.x, to.y - from.y);
    if dx.hypot(dy) > f64::EPSILON {
        machine.direction = Some((dx, dy));
    }
    machine.position = to;
    Ok(from.distance_xy(&to))
}

pub(crate) struct HeadChange {
    pub z: f64,
    pub wire_length: f64,
}

/// A head move through the frame must start inside the transfer area and
/// adds the Z travel to the wire length.
pub(crate) fn head_change(
    geometry: &MachineGeometry,
    machine: &MachineState,
    side: FaceSide,
) -> Result<HeadChange, HandlerError> {
    let z = geometry.head.z_for(side);
    if !side.crosses(machine.head) {
        return Ok(HeadChange { z, wire_length: 0.0 });
    }
    if !geometry.transfer.in_transfer_area(&machine.position) {
        return Err(HandlerError::NotInTransferArea { position: machine.position });
    }
    let from = geometry.head.z_for(machine.head);
    Ok(HeadChange { z, wire_length: (z - from).abs() })
}
