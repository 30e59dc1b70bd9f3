//! Messages between UI connections and the control loop.

use super::commands::UiCommand;
use tokio::sync::oneshot;

/// An operator command sent from a UI connection to the control loop.
#[derive(Debug)]
pub struct MachineRequest {
    pub command: UiCommand,
    /// Receives the reply line (`ok ...` or `error ...`).
    pub respond_to: oneshot::Sender<String>,
}

impl MachineRequest {
    pub fn new(command: UiCommand) -> (Self, oneshot::Receiver<String>) {
        let (respond_to, reply) = oneshot::channel();
        (Self { command, respond_to }, reply)
    }
}
