//! The operator-facing UI channel.
//! This file declares the other files in this directory as sub-modules.

pub mod commands;
pub mod machine_channel;
pub mod models;
pub mod server;

pub use commands::{CommandError, UiCommand};
pub use machine_channel::MachineRequest;
pub use models::MachineSnapshot;
pub use server::UiServer;
