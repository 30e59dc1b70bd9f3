// src/gcode/mod.rs
//! Recipe parsing, planning and execution.
pub mod command;
pub mod handler;
pub mod parser;
pub mod planner;
pub mod recipe;

pub use command::{Command, GCodeLine, PartialLocation};
pub use handler::{BlockReason, GCodeHandler, HandlerError, HandlerState, RecipeSession, RunningStats, StepOutcome};
pub use parser::{GCodeParser, ParseError, ParseReason};
pub use planner::MachineState;
pub use recipe::{Recipe, RecipeError};
