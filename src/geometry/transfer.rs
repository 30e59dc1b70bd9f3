// src/geometry/transfer.rs - Transfer box and seek-to-edge intercepts
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::{GeometryError, Location};

const MIN_PARAMETER: f64 = 1e-9;

#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum SeekError {
    #[error("Seek requested with no direction of travel")]
    NoDirection,
    #[error("Direction never reaches the {0} transfer edge")]
    NoIntercept(TransferEdge),
}

/// Edge (or corner pair of edges) of the transfer box a seek travels to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferEdge {
    Top,
    Bottom,
    Left,
    Right,
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

const TOP: u8 = 1;
const BOTTOM: u8 = 2;
const LEFT: u8 = 4;
const RIGHT: u8 = 8;

impl TransferEdge {
    /// Bitmask encoding used by `G102 P<mask>`.
    pub fn mask(self) -> u8 {
        match self {
            TransferEdge::Top => TOP,
            TransferEdge::Bottom => BOTTOM,
            TransferEdge::Left => LEFT,
            TransferEdge::Right => RIGHT,
            TransferEdge::TopLeft => TOP | LEFT,
            TransferEdge::TopRight => TOP | RIGHT,
            TransferEdge::BottomLeft => BOTTOM | LEFT,
            TransferEdge::BottomRight => BOTTOM | RIGHT,
        }
    }

    pub fn from_mask(mask: i64) -> Option<Self> {
        let edge = match u8::try_from(mask).ok()? {
            TOP => TransferEdge::Top,
            BOTTOM => TransferEdge::Bottom,
            LEFT => TransferEdge::Left,
            RIGHT => TransferEdge::Right,
            m if m == TOP | LEFT => TransferEdge::TopLeft,
            m if m == TOP | RIGHT => TransferEdge::TopRight,
            m if m == BOTTOM | LEFT => TransferEdge::BottomLeft,
            m if m == BOTTOM | RIGHT => TransferEdge::BottomRight,
            _ => return None,
        };
        Some(edge)
    }

    fn includes(self, bit: u8) -> bool {
        self.mask() & bit != 0
    }
}

impl fmt::Display for TransferEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferEdge::Top => "top",
            TransferEdge::Bottom => "bottom",
            TransferEdge::Left => "left",
            TransferEdge::Right => "right",
            TransferEdge::TopLeft => "top-left",
            TransferEdge::TopRight => "top-right",
            TransferEdge::BottomLeft => "bottom-left",
            TransferEdge::BottomRight => "bottom-right",
        };
        f.write_str(name)
    }
}

/// Lines near each frame edge where wire can be handed between faces.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransferBox {
    pub top: f64,
    pub bottom: f64,
    pub left: f64,
    pub right: f64,
    /// Width of the band inside each edge that still counts as transfer area.
    pub window: f64,
}

impl Default for TransferBox {
    fn default() -> Self {
        Self {
            top: 2800.0,
            bottom: 50.0,
            left: 440.0,
            right: 7174.0,
            window: 10.0,
        }
    }
}

impl TransferBox {
    pub fn validate(&self) -> Result<(), GeometryError> {
        let values = [self.top, self.bottom, self.left, self.right, self.window];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(GeometryError::InvalidTransferBox("non-finite value".to_string()));
        }
        if self.left >= self.right {
            return Err(GeometryError::InvalidTransferBox(format!(
                "left {} must be less than right {}",
                self.left, self.right
            )));
        }
        if self.bottom >= self.top {
            return Err(GeometryError::InvalidTransferBox(format!(
                "bottom {} must be less than top {}",
                self.bottom, self.top
            )));
        }
        if self.window < 0.0 {
            return Err(GeometryError::InvalidTransferBox("negative window".to_string()));
        }
        Ok(())
    }

    /// Clamp `location` into the box. Z is untouched.
    pub fn clip(&self, location: Location) -> Location {
        Location {
            x: location.x.clamp(self.left, self.right),
            y: location.y.clamp(self.bottom, self.top),
            z: location.z,
        }
    }

    /// Within `window` of any transfer edge (inside or outside the box).
    pub fn in_transfer_area(&self, location: &Location) -> bool {
        let near = |value: f64, edge: f64| (value - edge).abs() <= self.window;
        near(location.y, self.top)
            || near(location.y, self.bottom)
            || near(location.x, self.left)
            || near(location.x, self.right)
    }

    /// First point on `edge` reached by travelling from `from` along `(dx, dy)`.
    ///
    /// For a corner the nearer of its two edge lines wins. Z is carried over
    /// from `from`.
    pub fn intercept(
        &self,
        from: Location,
        dx: f64,
        dy: f64,
        edge: TransferEdge,
    ) -> Result<Location, SeekError> {
        if dx.abs() < f64::EPSILON && dy.abs() < f64::EPSILON {
            return Err(SeekError::NoDirection);
        }

        let mut best: Option<(f64, Location)> = None;
        let mut consider = |t: f64, point: Location| {
            if t > MIN_PARAMETER && best.is_none_or(|(best_t, _)| t < best_t) {
                best = Some((t, point));
            }
        };

        for (bit, horizontal_line, value) in [
            (TOP, true, self.top),
            (BOTTOM, true, self.bottom),
            (LEFT, false, self.left),
            (RIGHT, false, self.right),
        ] {
            if !edge.includes(bit) {
                continue;
            }
            if horizontal_line {
                if dy != 0.0 {
                    let t = (value - from.y) / dy;
                    consider(t, Location { x: from.x + t * dx, y: value, z: from.z });
                }
            } else if dx != 0.0 {
                let t = (value - from.x) / dx;
                consider(t, Location { x: value, y: from.y + t * dy, z: from.z });
            }
        }

        best.map(|(_, point)| point).ok_or(SeekError::NoIntercept(edge))
    }
}
