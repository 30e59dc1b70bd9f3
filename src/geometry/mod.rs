// src/geometry/mod.rs - Pure geometric model of the winder and the APA frame
//! Value types shared by calibration, the G-code handler and the control
//! state machine. Nothing in here performs I/O.

pub mod layer;
pub mod transfer;

pub use layer::{Corner, FrameEdge, LayerGeometry, PinNumbering, WrapDirection};
pub use transfer::{SeekError, TransferBox, TransferEdge};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Tolerance used for position equality (1 µm).
pub const POSITION_EPSILON: f64 = 1e-3;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GeometryError {
    #[error("Invalid layer geometry for '{layer}': {reason}")]
    InvalidLayer { layer: String, reason: String },
    #[error("Invalid transfer box: {0}")]
    InvalidTransferBox(String),
    #[error("Invalid machine bounds: {0}")]
    InvalidBounds(String),
    #[error("Unknown side '{0}'")]
    UnknownSide(String),
}

/// A point in machine coordinates, millimetres.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Location {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Location {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    pub fn distance_xy(&self, other: &Location) -> f64 {
        (other.x - self.x).hypot(other.y - self.y)
    }

    pub fn midpoint(&self, other: &Location) -> Location {
        Location {
            x: (self.x + other.x) / 2.0,
            y: (self.y + other.y) / 2.0,
            z: (self.z + other.z) / 2.0,
        }
    }

    pub fn offset_xy(&self, dx: f64, dy: f64) -> Location {
        Location { x: self.x + dx, y: self.y + dy, z: self.z }
    }

    /// True when every axis is within [`POSITION_EPSILON`] of `other`.
    pub fn approx_eq(&self, other: &Location) -> bool {
        (self.x - other.x).abs() < POSITION_EPSILON
            && (self.y - other.y).abs() < POSITION_EPSILON
            && (self.z - other.z).abs() < POSITION_EPSILON
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.3}, {:.3}, {:.3})", self.x, self.y, self.z)
    }
}

/// Discrete positions of the latch and of the pulling head.
///
/// The two "partial" positions hold the mechanism part way through the
/// frame; they belong to the face they are named after when deciding
/// whether a move crosses the APA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaceSide {
    #[default]
    Front,
    PartialFront,
    PartialBack,
    Back,
}

impl FaceSide {
    pub const ALL: [FaceSide; 4] = [
        FaceSide::Front,
        FaceSide::PartialFront,
        FaceSide::PartialBack,
        FaceSide::Back,
    ];

    pub fn code(self) -> i32 {
        match self {
            FaceSide::Front => 0,
            FaceSide::PartialFront => 1,
            FaceSide::PartialBack => 2,
            FaceSide::Back => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(FaceSide::Front),
            1 => Some(FaceSide::PartialFront),
            2 => Some(FaceSide::PartialBack),
            3 => Some(FaceSide::Back),
            _ => None,
        }
    }

    pub fn is_front_group(self) -> bool {
        matches!(self, FaceSide::Front | FaceSide::PartialFront)
    }

    /// Moving between these two sides takes the wire through the frame.
    pub fn crosses(self, other: FaceSide) -> bool {
        self.is_front_group() != other.is_front_group()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FaceSide::Front => "front",
            FaceSide::PartialFront => "partial-front",
            FaceSide::PartialBack => "partial-back",
            FaceSide::Back => "back",
        }
    }
}

impl fmt::Display for FaceSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FaceSide {
    type Err = GeometryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "front" | "f" | "0" => Ok(FaceSide::Front),
            "partial-front" | "partial_front" | "1" => Ok(FaceSide::PartialFront),
            "partial-back" | "partial_back" | "2" => Ok(FaceSide::PartialBack),
            "back" | "b" | "3" => Ok(FaceSide::Back),
            _ => Err(GeometryError::UnknownSide(s.to_string())),
        }
    }
}

/// The reachable envelope of the three axes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MachineBounds {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
    pub z_min: f64,
    pub z_max: f64,
}

impl MachineBounds {
    pub fn validate(&self) -> Result<(), GeometryError> {
        let axes = [
            ("x", self.x_min, self.x_max),
            ("y", self.y_min, self.y_max),
            ("z", self.z_min, self.z_max),
        ];
        for (axis, min, max) in axes {
            if !min.is_finite() || !max.is_finite() || min >= max {
                return Err(GeometryError::InvalidBounds(format!(
                    "{} range [{}, {}] is empty or not finite",
                    axis, min, max
                )));
            }
        }
        Ok(())
    }

    pub fn contains(&self, location: &Location) -> bool {
        location.is_finite()
            && (self.x_min..=self.x_max).contains(&location.x)
            && (self.y_min..=self.y_max).contains(&location.y)
            && (self.z_min..=self.z_max).contains(&location.z)
    }
}

impl Default for MachineBounds {
    fn default() -> Self {
        Self {
            x_min: 0.0,
            x_max: 7360.0,
            y_min: 0.0,
            y_max: 2850.0,
            z_min: 0.0,
            z_max: 434.0,
        }
    }
}

/// Z coordinate of the pulling head for each [`FaceSide`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeadPositions {
    pub front: f64,
    pub partial_front: f64,
    pub partial_back: f64,
    pub back: f64,
}

impl HeadPositions {
    pub fn z_for(&self, side: FaceSide) -> f64 {
        match side {
            FaceSide::Front => self.front,
            FaceSide::PartialFront => self.partial_front,
            FaceSide::PartialBack => self.partial_back,
            FaceSide::Back => self.back,
        }
    }
}

impl Default for HeadPositions {
    fn default() -> Self {
        Self {
            front: 0.0,
            partial_front: 100.0,
            partial_back: 334.0,
            back: 434.0,
        }
    }
}

/// Everything the handler needs to know about the machine's physical layout.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineGeometry {
    pub bounds: MachineBounds,
    pub transfer: TransferBox,
    pub head: HeadPositions,
}

impl MachineGeometry {
    pub fn new(
        bounds: MachineBounds,
        transfer: TransferBox,
        head: HeadPositions,
    ) -> Result<Self, GeometryError> {
        bounds.validate()?;
        transfer.validate()?;
        Ok(Self { bounds, transfer, head })
    }
}
