// src/plc/driver.rs - PLC I/O task: feeds the motion queue to the PLC
//! One primitive is in the PLC at a time. The driver submits the queue's
//! front entry, waits for `READY` to drop and come back, then retires the
//! entry. The PLC holds `READY` low for at least one poll while it moves.
//!
//! A primitive that has not completed within the move timeout is reported as
//! a fault and stays at the queue front until the control loop clears it.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior, interval};

use super::adapter::PlcError;
use super::logic::{PlcLogic, PlcStatus};
use crate::motion::{MotionPrimitive, MotionQueue, QueuedPrimitive};

/// Status shared with the control loop.
#[derive(Debug, Clone, Default)]
pub struct PlcStatusHandle {
    inner: Arc<Mutex<PlcStatus>>,
}

impl PlcStatusHandle {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PlcStatus> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self) -> PlcStatus {
        self.lock().clone()
    }

    pub fn publish(&self, status: PlcStatus) {
        *self.lock() = status;
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Active {
    Plc { seq: u64, saw_busy: bool, deadline: Instant },
    Dwell { seq: u64, until: Instant },
}

impl Active {
    fn seq(&self) -> u64 {
        match *self {
            Active::Plc { seq, .. } | Active::Dwell { seq, .. } => seq,
        }
    }
}

const DEFAULT_MOVE_TIMEOUT: Duration = Duration::from_secs(120);

pub struct PlcDriver {
    logic: PlcLogic,
    queue: MotionQueue,
    status: PlcStatusHandle,
    period: Duration,
    move_timeout: Duration,
    active: Option<Active>,
    /// Queue entry that timed out, with the reason. Cleared once the entry
    /// leaves the queue.
    stalled: Option<(u64, String)>,
}

impl PlcDriver {
    pub fn new(logic: PlcLogic, queue: MotionQueue, status: PlcStatusHandle, period: Duration) -> Self {
        Self {
            logic,
            queue,
            status,
            period,
            move_timeout: DEFAULT_MOVE_TIMEOUT,
            active: None,
            stalled: None,
        }
    }

    pub fn with_move_timeout(mut self, move_timeout: Duration) -> Self {
        self.move_timeout = move_timeout;
        self
    }

    pub fn status_handle(&self) -> PlcStatusHandle {
        self.status.clone()
    }

    /// Poll every period until shutdown is broadcast.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!("PLC task started ({} ms period)", self.period.as_millis());
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.cycle().await,
                _ = shutdown.recv() => {
                    tracing::info!("PLC task shutting down");
                    break;
                }
            }
        }
        self.queue.set_consumer_ready(false);
    }

    /// One poll: refresh status, retire a finished primitive, submit the next.
    pub async fn cycle(&mut self) {
        let mut status = match self.logic.poll().await {
            Ok(status) => status,
            Err(e) => {
                tracing::error!("PLC poll failed: {}", e);
                self.fail(PlcStatus {
                    functional: self.logic.is_functional(),
                    responsive: false,
                    last_error: Some(e.to_string()),
                    ..self.status.get()
                });
                return;
            }
        };

        if let Some((seq, _)) = &self.stalled {
            if self.queue.front().map(|entry| entry.seq) != Some(*seq) {
                tracing::info!("Timed out primitive {} dropped from the queue", seq);
                self.stalled = None;
            }
        }
        status.stalled_move = self.stalled.as_ref().map(|(_, reason)| reason.clone());

        if status.is_fault() {
            if self.active.is_some() || !self.queue.is_empty() {
                tracing::error!("PLC fault with motion pending: {:?}", status.fault_description());
            }
            self.fail(status);
            return;
        }

        self.status.publish(status.clone());
        self.advance(&status).await;
        if let Some((_, reason)) = &self.stalled {
            status.stalled_move = Some(reason.clone());
            self.fail(status);
            return;
        }
        self.queue.set_consumer_ready(status.is_healthy());
    }

    fn fail(&mut self, status: PlcStatus) {
        self.active = None;
        self.queue.set_consumer_ready(false);
        self.status.publish(status);
    }

    async fn advance(&mut self, status: &PlcStatus) {
        let front = self.queue.front();

        // The control loop may have cleared the queue under us.
        if let Some(active) = self.active {
            if front.as_ref().map(|entry| entry.seq) != Some(active.seq()) {
                self.active = None;
            }
        }

        match self.active {
            Some(Active::Plc { seq, saw_busy, deadline }) => {
                if status.ready && saw_busy {
                    self.retire(seq);
                } else if Instant::now() >= deadline {
                    self.time_out(seq, front);
                    return;
                } else if !status.ready {
                    self.active = Some(Active::Plc { seq, saw_busy: true, deadline });
                }
            }
            Some(Active::Dwell { seq, until }) => {
                if Instant::now() >= until {
                    self.retire(seq);
                }
            }
            None => {}
        }

        if self.active.is_none() && status.ready {
            if let Some(entry) = self.queue.front() {
                self.start(entry).await;
            }
        }
    }

    async fn start(&mut self, entry: QueuedPrimitive) {
        match entry.primitive {
            MotionPrimitive::Dwell { ms } => {
                self.active = Some(Active::Dwell { seq: entry.seq, until: Instant::now() + Duration::from_millis(ms) });
            }
            MotionPrimitive::Break => {
                self.queue.complete(entry.seq);
            }
            ref primitive => match self.logic.submit(primitive).await {
                Ok(()) => {
                    let deadline = Instant::now() + self.move_timeout;
                    self.active = Some(Active::Plc { seq: entry.seq, saw_busy: false, deadline });
                }
                Err(e) => {
                    tracing::error!("Submitting {} failed: {}", primitive, e);
                    let mut status = self.status.get();
                    status.responsive = false;
                    status.last_error = Some(e.to_string());
                    self.fail(status);
                }
            },
        }
    }

    fn time_out(&mut self, seq: u64, entry: Option<QueuedPrimitive>) {
        let primitive = entry.map(|entry| entry.primitive.to_string()).unwrap_or_default();
        let error = PlcError::CompletionTimeout { primitive, timeout_ms: self.move_timeout.as_millis() as u64 };
        tracing::error!("{}", error);
        self.active = None;
        self.stalled = Some((seq, error.to_string()));
    }

    fn retire(&mut self, seq: u64) {
        if self.queue.complete(seq) {
            tracing::debug!("Primitive {} complete", seq);
        }
        self.active = None;
    }
}
