// src/gcode/command.rs - Typed commands produced by the parser
use std::fmt;

use crate::calibration::PinId;
use crate::geometry::{FaceSide, TransferEdge};

/// Axis targets given on a line; omitted axes keep their current value.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PartialLocation {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
}

impl PartialLocation {
    pub fn is_empty(&self) -> bool {
        self.x.is_none() && self.y.is_none() && self.z.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Move {
        target: PartialLocation,
        feed: Option<f64>,
    },
    SeekTransfer(TransferEdge),
    Latch(FaceSide),
    HeadLocation(FaceSide),
    /// Target a front pin, a back pin or the midpoint of both.
    PinPositioning {
        front: Option<u32>,
        back: Option<u32>,
        offset_x: f64,
        offset_y: f64,
    },
    Clip,
    Delay(u64),
    Break,
}

impl Command {
    /// Pins this command needs from the layer's calibration.
    pub fn pins(&self) -> impl Iterator<Item = PinId> {
        let (front, back) = match self {
            Command::PinPositioning { front, back, .. } => (*front, *back),
            _ => (None, None),
        };
        front.map(PinId::front).into_iter().chain(back.map(PinId::back))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Move { target, .. } => {
                f.write_str("G1")?;
                for (letter, value) in [('X', target.x), ('Y', target.y), ('Z', target.z)] {
                    if let Some(value) = value {
                        write!(f, " {}{}", letter, value)?;
                    }
                }
                Ok(())
            }
            Command::SeekTransfer(edge) => write!(f, "G102 P{}", edge.mask()),
            Command::Latch(side) => write!(f, "G100 P{}", side.code()),
            Command::HeadLocation(side) => write!(f, "G106 P{}", side.code()),
            Command::PinPositioning { front, back, offset_x, offset_y } => {
                f.write_str("G108")?;
                if let Some(pin) = front {
                    write!(f, " F{}", pin)?;
                }
                if let Some(pin) = back {
                    write!(f, " B{}", pin)?;
                }
                if *offset_x != 0.0 {
                    write!(f, " I{}", offset_x)?;
                }
                if *offset_y != 0.0 {
                    write!(f, " J{}", offset_y)?;
                }
                Ok(())
            }
            Command::Clip => f.write_str("G104"),
            Command::Delay(ms) => write!(f, "G4 P{}", ms),
            Command::Break => f.write_str("M0"),
        }
    }
}

/// One statement of a recipe.
#[derive(Debug, Clone, PartialEq)]
pub struct GCodeLine {
    /// `N` number, or the previous number plus one when omitted.
    pub number: u32,
    pub feed: Option<f64>,
    pub commands: Vec<Command>,
    /// 1-based line in the source text.
    pub source: usize,
}

impl GCodeLine {
    pub fn pins(&self) -> impl Iterator<Item = PinId> + '_ {
        self.commands.iter().flat_map(|command| command.pins())
    }
}

/// Canonical text. The feed is written straight after the line number so it
/// can never be taken for a `G108` front pin.
impl fmt::Display for GCodeLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{}", self.number)?;
        if let Some(feed) = self.feed {
            write!(f, " F{}", feed)?;
        }
        for command in &self.commands {
            write!(f, " {}", command)?;
        }
        Ok(())
    }
}
