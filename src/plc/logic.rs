// src/plc/logic.rs - Translates motion primitives to tag writes and tags to status
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::adapter::{PlcAdapter, PlcError, TagValue};
use super::io::IoRegistry;
use super::tags::{self, Axis, PlcState};
use crate::geometry::{Location, POSITION_EPSILON};
use crate::motion::{MotionLimits, MotionPrimitive};

/// Latest view of the PLC, published by the PLC task.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlcStatus {
    pub functional: bool,
    pub responsive: bool,
    pub ready: bool,
    pub state: PlcState,
    pub error_code: i32,
    pub sw_status: i32,
    pub position: Location,
    pub velocity: [f64; 3],
    pub axis_faults: Vec<Axis>,
    /// Set by the PLC task when a submitted primitive never completed.
    pub stalled_move: Option<String>,
    pub last_error: Option<String>,
}

impl PlcStatus {
    pub fn is_fault(&self) -> bool {
        self.state == PlcState::Error
            || self.error_code != 0
            || !self.axis_faults.is_empty()
            || self.stalled_move.is_some()
    }

    /// Able to take the next primitive once the current one finishes.
    pub fn is_healthy(&self) -> bool {
        self.functional && self.responsive && !self.is_fault()
    }

    /// Description of the fault for logs and the APA record.
    pub fn fault_description(&self) -> Option<String> {
        if !self.responsive {
            return Some(self.last_error.clone().unwrap_or_else(|| "PLC unresponsive".to_string()));
        }
        if !self.functional {
            return Some("PLC not functional".to_string());
        }
        if let Some(stalled) = &self.stalled_move {
            return Some(stalled.clone());
        }
        if !self.is_fault() {
            return None;
        }
        let mut description = format!("PLC fault, state {:?}, error code {}", self.state, self.error_code);
        if !self.axis_faults.is_empty() {
            let axes: Vec<String> = self.axis_faults.iter().map(Axis::to_string).collect();
            description.push_str(&format!(", module fault on {}", axes.join("/")));
        }
        Some(description)
    }
}

/// Owns the adapter and the [`IoRegistry`]; every adapter call is bounded by `timeout`.
pub struct PlcLogic {
    adapter: Arc<dyn PlcAdapter>,
    registry: IoRegistry,
    timeout: Duration,
    last_position: Location,
}

impl PlcLogic {
    pub fn new(adapter: Arc<dyn PlcAdapter>, timeout: Duration) -> Self {
        Self {
            adapter,
            registry: IoRegistry::standard(),
            timeout,
            last_position: Location::default(),
        }
    }

    pub fn is_functional(&self) -> bool {
        self.adapter.is_functional()
    }

    pub async fn poll(&mut self) -> Result<PlcStatus, PlcError> {
        if !self.adapter.is_functional() {
            return Err(PlcError::NotFunctional);
        }
        let adapter = self.adapter.clone();
        let timeout = self.timeout;
        with_timeout(timeout, self.registry.poll_inputs(adapter.as_ref())).await?;

        let int = |tag: &str| self.registry.value(tag).and_then(|v| v.as_int()).unwrap_or_default();
        let float = |tag: String| self.registry.value(&tag).and_then(|v| v.as_float()).unwrap_or_default();
        let flag = |tag: String| self.registry.value(&tag).and_then(|v| v.as_bool()).unwrap_or_default();

        let position = Location::new(
            float(Axis::X.actual_position()),
            float(Axis::Y.actual_position()),
            float(Axis::Z.actual_position()),
        );
        let status = PlcStatus {
            functional: true,
            responsive: true,
            ready: self.registry.value(tags::READY).and_then(|v| v.as_bool()).unwrap_or(false),
            state: PlcState::from_code(int(tags::STATE)),
            error_code: int(tags::ERROR_CODE),
            sw_status: int(tags::MACHINE_SW_STAT),
            position,
            velocity: Axis::ALL.map(|axis| float(axis.actual_velocity())),
            axis_faults: Axis::ALL.into_iter().filter(|axis| flag(axis.module_fault())).collect(),
            stalled_move: None,
            last_error: None,
        };
        self.last_position = position;
        Ok(status)
    }

    /// Stage and send the tags for one primitive. Dwell and break never reach the PLC.
    pub async fn submit(&mut self, primitive: &MotionPrimitive) -> Result<(), PlcError> {
        let move_type = match primitive {
            MotionPrimitive::Move { to, limits } | MotionPrimitive::Seek { to, limits, .. } => {
                self.stage_target(*to, *limits)?;
                let z_only = (to.x - self.last_position.x).abs() < POSITION_EPSILON
                    && (to.y - self.last_position.y).abs() < POSITION_EPSILON;
                if z_only { PlcState::ZSeek } else { PlcState::XySeek }
            }
            MotionPrimitive::Latch { side } => {
                self.registry.set(tags::LATCH_SIDE, TagValue::Int(side.code()))?;
                PlcState::Latching
            }
            MotionPrimitive::Head { side, z } => {
                self.registry.set(tags::HEAD_SIDE, TagValue::Int(side.code()))?;
                self.registry.set(tags::Z_POSITION, TagValue::Float(*z as f32))?;
                PlcState::Head
            }
            MotionPrimitive::Dwell { .. } | MotionPrimitive::Break => return Ok(()),
        };
        self.registry.set(tags::MOVE_TYPE, TagValue::Int(move_type.code()))?;

        let adapter = self.adapter.clone();
        let timeout = self.timeout;
        with_timeout(timeout, self.registry.flush_outputs(adapter.as_ref())).await?;
        tracing::debug!("Submitted {} as move type {:?}", primitive, move_type);
        Ok(())
    }

    fn stage_target(&mut self, to: Location, limits: MotionLimits) -> Result<(), PlcError> {
        for (axis, value) in Axis::ALL.into_iter().zip([to.x, to.y, to.z]) {
            self.registry.set(axis.target(), TagValue::Float(value as f32))?;
        }
        self.registry.set(tags::XY_SPEED, TagValue::Float(limits.velocity as f32))?;
        self.registry.set(tags::XY_ACCELERATION, TagValue::Float(limits.acceleration as f32))?;
        self.registry.set(tags::XY_DECELERATION, TagValue::Float(limits.deceleration as f32))?;
        Ok(())
    }
}

async fn with_timeout<T>(
    timeout: Duration,
    operation: impl Future<Output = Result<T, PlcError>>,
) -> Result<T, PlcError> {
    match tokio::time::timeout(timeout, operation).await {
        Ok(result) => result,
        Err(_) => Err(PlcError::Unresponsive { timeout_ms: timeout.as_millis() as u64 }),
    }
}
