// src/machine/control_loop.rs - Periodic control task
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio::time::{MissedTickBehavior, interval};

use super::{Machine, MachineError};
use crate::web::machine_channel::MachineRequest;
use crate::web::models::MachineSnapshot;

/// Owns the [`Machine`]. Each tick drains the mailbox, runs the active mode
/// and publishes a fresh snapshot. Nothing in a tick awaits the PLC.
pub struct ControlLoop {
    machine: Machine,
    mailbox: mpsc::Receiver<MachineRequest>,
    snapshot: Arc<RwLock<MachineSnapshot>>,
    shutdown_tx: broadcast::Sender<()>,
    period: Duration,
}

impl ControlLoop {
    pub fn new(
        machine: Machine,
        mailbox: mpsc::Receiver<MachineRequest>,
        shutdown_tx: broadcast::Sender<()>,
        period: Duration,
    ) -> Self {
        let snapshot = Arc::new(RwLock::new(machine.snapshot()));
        Self { machine, mailbox, snapshot, shutdown_tx, period }
    }

    /// Handle for read-only observers.
    pub fn snapshot(&self) -> Arc<RwLock<MachineSnapshot>> {
        self.snapshot.clone()
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    /// One control period: commands first, then the mode update.
    pub async fn tick(&mut self) -> Result<(), MachineError> {
        while let Ok(request) = self.mailbox.try_recv() {
            let (reply, result) = match self.machine.handle(request.command) {
                Ok(reply) => (reply, Ok(())),
                Err(e) => (format!("error {}", e), Err(e)),
            };
            if request.respond_to.send(reply).is_err() {
                tracing::debug!("UI client went away before its reply");
            }
            result?;
        }
        self.machine.tick()?;
        *self.snapshot.write().await = self.machine.snapshot();
        Ok(())
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(), MachineError> {
        tracing::info!("Control loop started ({} ms period)", self.period.as_millis());
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut shutdown_sent = false;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!("Control loop failed: {}", e);
                        let _ = self.shutdown_tx.send(());
                        return Err(e);
                    }
                    if !shutdown_sent && self.machine.shutdown_requested() && self.machine.is_quiescent() {
                        tracing::info!("Machine stopped, broadcasting shutdown");
                        shutdown_sent = true;
                        let _ = self.shutdown_tx.send(());
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Control loop shutting down");
                    break;
                }
            }
        }
        self.machine.shutdown()?;
        *self.snapshot.write().await = self.machine.snapshot();
        Ok(())
    }
}
