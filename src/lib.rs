// src/lib.rs - Library root for the winder host
//! Control core of an APA wire winder: recipe parsing and planning, the
//! machine state machine, the PLC I/O task and persisted production state.

pub mod calibration;
pub mod config;
pub mod file_manager;
pub mod gcode;
pub mod geometry;
pub mod machine;
pub mod motion;
pub mod plc;
pub mod process;
pub mod simulator;
pub mod web;

pub use config::{Config, ConfigError, load_config};
pub use machine::{Machine, MachineError, Mode};
