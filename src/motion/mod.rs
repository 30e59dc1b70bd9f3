// src/motion/mod.rs - Motion primitives handed from the handler to the PLC
pub mod queue;

pub use queue::{MotionQueue, QueueFull, QueueStats, QueuedPrimitive};

use serde::Serialize;
use std::fmt;

use crate::geometry::{FaceSide, Location, TransferEdge};

/// Velocity, acceleration and deceleration for one move. All strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MotionLimits {
    pub velocity: f64,
    pub acceleration: f64,
    pub deceleration: f64,
}

impl MotionLimits {
    pub fn is_valid(&self) -> bool {
        [self.velocity, self.acceleration, self.deceleration]
            .iter()
            .all(|v| v.is_finite() && *v > 0.0)
    }
}

/// A single request the PLC can carry out on its own.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MotionPrimitive {
    /// Point-to-point move of all three axes.
    Move { to: Location, limits: MotionLimits },
    /// Move ending on a transfer edge; `to` is the precomputed intercept.
    Seek { edge: TransferEdge, to: Location, limits: MotionLimits },
    Latch { side: FaceSide },
    Head { side: FaceSide, z: f64 },
    Dwell { ms: u64 },
    Break,
}

impl fmt::Display for MotionPrimitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MotionPrimitive::Move { to, limits } => write!(f, "move to {} at {}", to, limits.velocity),
            MotionPrimitive::Seek { edge, to, limits } => {
                write!(f, "seek {} edge to {} at {}", edge, to, limits.velocity)
            }
            MotionPrimitive::Latch { side } => write!(f, "latch {}", side),
            MotionPrimitive::Head { side, z } => write!(f, "head {} (z {:.3})", side, z),
            MotionPrimitive::Dwell { ms } => write!(f, "dwell {} ms", ms),
            MotionPrimitive::Break => f.write_str("break"),
        }
    }
}
