// src/geometry/layer.rs - Per-layer wire and pin layout
use serde::{Deserialize, Serialize};

use super::GeometryError;

/// Corner of the frame where pin ordinal 1 sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Corner {
    #[default]
    BottomLeft,
    BottomRight,
    TopLeft,
    TopRight,
}

/// Direction in which pin ordinals increase around the frame, seen from the front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WrapDirection {
    Clockwise,
    #[default]
    CounterClockwise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameEdge {
    Bottom,
    Right,
    Top,
    Left,
}

impl FrameEdge {
    pub fn is_vertical(self) -> bool {
        matches!(self, FrameEdge::Left | FrameEdge::Right)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PinNumbering {
    #[serde(default)]
    pub start: Corner,
    #[serde(default)]
    pub wrap: WrapDirection,
}

impl PinNumbering {
    /// Edges in the order ordinals walk them.
    fn edge_order(&self) -> [FrameEdge; 4] {
        use FrameEdge::*;
        let clockwise = [Left, Top, Right, Bottom];
        let counter = [Bottom, Right, Top, Left];
        let (cycle, first) = match self.wrap {
            WrapDirection::Clockwise => (
                clockwise,
                match self.start {
                    Corner::BottomLeft => 0,
                    Corner::TopLeft => 1,
                    Corner::TopRight => 2,
                    Corner::BottomRight => 3,
                },
            ),
            WrapDirection::CounterClockwise => (
                counter,
                match self.start {
                    Corner::BottomLeft => 0,
                    Corner::BottomRight => 1,
                    Corner::TopRight => 2,
                    Corner::TopLeft => 3,
                },
            ),
        };
        [
            cycle[first],
            cycle[(first + 1) % 4],
            cycle[(first + 2) % 4],
            cycle[(first + 3) % 4],
        ]
    }
}

/// Wire and pin layout of one layer (G, X, U or V).
///
/// `delta_x` is `None` for straight layers whose wires run parallel to the
/// frame's long edge; diagonal layers give the horizontal pin step and the
/// perpendicular wire spacing follows from it.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerGeometry {
    pub name: String,
    /// Pins on each face; ordinals run `1..=pin_count`.
    pub pin_count: u32,
    /// Pins along each vertical edge.
    pub rows: u32,
    /// Pins along each horizontal edge.
    pub columns: u32,
    pub delta_x: Option<f64>,
    pub delta_y: f64,
    /// Angle of the wire to the horizontal, radians.
    pub diagonal_angle: f64,
    pub wire_spacing: f64,
    pub numbering: PinNumbering,
}

impl LayerGeometry {
    pub fn new(
        name: &str,
        rows: u32,
        columns: u32,
        delta_x: Option<f64>,
        delta_y: f64,
        numbering: PinNumbering,
    ) -> Result<Self, GeometryError> {
        let invalid = |reason: String| GeometryError::InvalidLayer { layer: name.to_string(), reason };
        if rows + columns == 0 {
            return Err(invalid("layer has no pins".to_string()));
        }
        if !(delta_y.is_finite() && delta_y > 0.0) {
            return Err(invalid(format!("delta_y must be positive, got {}", delta_y)));
        }
        let (diagonal_angle, wire_spacing) = match delta_x {
            None => (0.0, delta_y),
            Some(dx) if dx.is_finite() && dx > 0.0 => {
                let ratio = delta_y / dx;
                (ratio.atan(), delta_y / (ratio * ratio + 1.0).sqrt())
            }
            Some(dx) => return Err(invalid(format!("delta_x must be positive, got {}", dx))),
        };
        Ok(Self {
            name: name.to_string(),
            pin_count: 2 * (rows + columns),
            rows,
            columns,
            delta_x,
            delta_y,
            diagonal_angle,
            wire_spacing,
            numbering,
        })
    }

    /// Frame edge carrying the pin with this ordinal, or `None` when out of range.
    pub fn edge_of(&self, ordinal: u32) -> Option<FrameEdge> {
        if ordinal == 0 || ordinal > self.pin_count {
            return None;
        }
        let mut remaining = ordinal;
        for edge in self.numbering.edge_order() {
            let length = if edge.is_vertical() { self.rows } else { self.columns };
            if remaining <= length {
                return Some(edge);
            }
            remaining -= length;
        }
        None
    }
}
