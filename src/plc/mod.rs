// src/plc/mod.rs
//! PLC side of the winder: the adapter boundary, the tag map, and the task
//! that hands queued motion primitives to the PLC one at a time.
pub mod adapter;
pub mod driver;
pub mod io;
pub mod logic;
pub mod tags;

pub use adapter::{PlcAdapter, PlcError, TagValue};
pub use driver::{PlcDriver, PlcStatusHandle};
pub use io::{IoPoint, IoRegistry};
pub use logic::{PlcLogic, PlcStatus};
pub use tags::{Axis, PlcState};
