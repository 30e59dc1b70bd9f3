// src/plc/tags.rs - PLC tag names and state codes
use serde::Serialize;
use std::fmt;

pub const STATE: &str = "STATE";
pub const ERROR_CODE: &str = "ERROR_CODE";
pub const MACHINE_SW_STAT: &str = "MACHINE_SW_STAT";
pub const READY: &str = "READY";

pub const MOVE_TYPE: &str = "MOVE_TYPE";
pub const X_POSITION: &str = "X_POSITION";
pub const Y_POSITION: &str = "Y_POSITION";
pub const Z_POSITION: &str = "Z_POSITION";
pub const XY_SPEED: &str = "XY_SPEED";
pub const XY_ACCELERATION: &str = "XY_ACCELERATION";
pub const XY_DECELERATION: &str = "XY_DECELERATION";
pub const LATCH_SIDE: &str = "LATCH_SIDE";
pub const HEAD_SIDE: &str = "HEAD_SIDE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    fn prefix(self) -> &'static str {
        match self {
            Axis::X => "X_axis",
            Axis::Y => "Y_axis",
            Axis::Z => "Z_axis",
        }
    }

    pub fn actual_position(self) -> String {
        format!("{}.ActualPosition", self.prefix())
    }

    pub fn actual_velocity(self) -> String {
        format!("{}.ActualVelocity", self.prefix())
    }

    pub fn command_acceleration(self) -> String {
        format!("{}.CommandAcceleration", self.prefix())
    }

    pub fn module_fault(self) -> String {
        format!("{}.ModuleFault", self.prefix())
    }

    /// Target written with a move.
    pub fn target(self) -> &'static str {
        match self {
            Axis::X => X_POSITION,
            Axis::Y => Y_POSITION,
            Axis::Z => Z_POSITION,
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Axis::X => "X",
            Axis::Y => "Y",
            Axis::Z => "Z",
        };
        f.write_str(name)
    }
}

/// Ladder state reported in `STATE`; also the `MOVE_TYPE` request codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlcState {
    #[default]
    Init,
    Ready,
    XySeek,
    ZSeek,
    Latching,
    Head,
    Error,
    /// A code this host does not know.
    Other(i32),
}

impl PlcState {
    pub fn code(self) -> i32 {
        match self {
            PlcState::Init => 0,
            PlcState::Ready => 1,
            PlcState::XySeek => 2,
            PlcState::ZSeek => 3,
            PlcState::Latching => 4,
            PlcState::Head => 5,
            PlcState::Error => 10,
            PlcState::Other(code) => code,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            0 => PlcState::Init,
            1 => PlcState::Ready,
            2 => PlcState::XySeek,
            3 => PlcState::ZSeek,
            4 => PlcState::Latching,
            5 => PlcState::Head,
            10 => PlcState::Error,
            other => PlcState::Other(other),
        }
    }
}
