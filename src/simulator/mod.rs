// src/simulator/mod.rs - In-memory PLC used for bench runs and tests
//! Holds the tag map in memory and plays the ladder logic's part: a write to
//! `MOVE_TYPE` drops `READY` for the next `completion_polls` reads of
//! `READY`; the read after that finds the axes at their targets and `READY`
//! back up.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::plc::tags::{self, Axis, PlcState};
use crate::plc::{PlcAdapter, PlcError, TagValue};

#[derive(Debug)]
struct SimState {
    tags: HashMap<String, TagValue>,
    busy: Option<(u32, PlcState)>,
    completion_polls: u32,
    stalled: bool,
    ignore_moves: bool,
    functional: bool,
    submissions: Vec<PlcState>,
}

impl SimState {
    fn float(&self, tag: &str) -> TagValue {
        self.tags.get(tag).copied().unwrap_or(TagValue::Float(0.0))
    }

    fn finish(&mut self, move_type: PlcState) {
        match move_type {
            PlcState::XySeek | PlcState::ZSeek => {
                for axis in Axis::ALL {
                    let target = self.float(axis.target());
                    self.tags.insert(axis.actual_position(), target);
                }
            }
            PlcState::Head => {
                let target = self.float(tags::Z_POSITION);
                self.tags.insert(Axis::Z.actual_position(), target);
            }
            _ => {}
        }
        self.tags.insert(tags::STATE.to_string(), TagValue::Int(PlcState::Ready.code()));
        self.tags.insert(tags::READY.to_string(), TagValue::Bool(true));
    }
}

/// Cheap to clone; clones share one simulated PLC.
#[derive(Debug, Clone)]
pub struct SimulatedPlc {
    inner: Arc<Mutex<SimState>>,
}

impl SimulatedPlc {
    pub fn new(completion_polls: u32) -> Self {
        let mut tag_map = HashMap::new();
        for tag in [tags::STATE, tags::ERROR_CODE, tags::MACHINE_SW_STAT, tags::MOVE_TYPE, tags::LATCH_SIDE, tags::HEAD_SIDE] {
            tag_map.insert(tag.to_string(), TagValue::Int(0));
        }
        tag_map.insert(tags::STATE.to_string(), TagValue::Int(PlcState::Ready.code()));
        tag_map.insert(tags::READY.to_string(), TagValue::Bool(true));
        for tag in [
            tags::X_POSITION,
            tags::Y_POSITION,
            tags::Z_POSITION,
            tags::XY_SPEED,
            tags::XY_ACCELERATION,
            tags::XY_DECELERATION,
        ] {
            tag_map.insert(tag.to_string(), TagValue::Float(0.0));
        }
        for axis in Axis::ALL {
            tag_map.insert(axis.actual_position(), TagValue::Float(0.0));
            tag_map.insert(axis.actual_velocity(), TagValue::Float(0.0));
            tag_map.insert(axis.command_acceleration(), TagValue::Float(0.0));
            tag_map.insert(axis.module_fault(), TagValue::Bool(false));
        }

        Self {
            inner: Arc::new(Mutex::new(SimState {
                tags: tag_map,
                busy: None,
                completion_polls: completion_polls.max(1),
                stalled: false,
                ignore_moves: false,
                functional: true,
                submissions: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Put the PLC into its error state with `code`.
    pub fn inject_fault(&self, code: i32) {
        let mut state = self.lock();
        state.busy = None;
        state.tags.insert(tags::STATE.to_string(), TagValue::Int(PlcState::Error.code()));
        state.tags.insert(tags::ERROR_CODE.to_string(), TagValue::Int(code));
        state.tags.insert(tags::READY.to_string(), TagValue::Bool(false));
        tracing::warn!("Simulated PLC fault {}", code);
    }

    pub fn inject_axis_fault(&self, axis: Axis, faulted: bool) {
        self.lock().tags.insert(axis.module_fault(), TagValue::Bool(faulted));
    }

    pub fn clear_fault(&self) {
        let mut state = self.lock();
        state.tags.insert(tags::STATE.to_string(), TagValue::Int(PlcState::Ready.code()));
        state.tags.insert(tags::ERROR_CODE.to_string(), TagValue::Int(0));
        state.tags.insert(tags::READY.to_string(), TagValue::Bool(true));
        for axis in Axis::ALL {
            state.tags.insert(axis.module_fault(), TagValue::Bool(false));
        }
    }

    /// A stalled PLC never answers reads, so callers hit their timeout.
    pub fn stall(&self, stalled: bool) {
        self.lock().stalled = stalled;
    }

    /// Accept move requests without ever starting them; `READY` stays high.
    pub fn ignore_moves(&self, ignore: bool) {
        self.lock().ignore_moves = ignore;
    }

    pub fn set_functional(&self, functional: bool) {
        self.lock().functional = functional;
    }

    /// Move types requested so far, oldest first.
    pub fn submissions(&self) -> Vec<PlcState> {
        self.lock().submissions.clone()
    }

    pub fn tag(&self, tag: &str) -> Option<TagValue> {
        self.lock().tags.get(tag).copied()
    }

    pub fn is_busy(&self) -> bool {
        self.lock().busy.is_some()
    }
}

#[async_trait]
impl PlcAdapter for SimulatedPlc {
    async fn read_tag(&self, tag: &str) -> Result<TagValue, PlcError> {
        let stalled = self.lock().stalled;
        if stalled {
            std::future::pending::<()>().await;
        }

        let mut state = self.lock();
        if tag == tags::READY {
            if let Some((remaining, move_type)) = state.busy {
                if remaining > 0 {
                    state.busy = Some((remaining - 1, move_type));
                    return Ok(TagValue::Bool(false));
                }
                state.busy = None;
                state.finish(move_type);
            }
        }
        state.tags.get(tag).copied().ok_or_else(|| PlcError::UnknownTag(tag.to_string()))
    }

    async fn write_tag(&self, tag: &str, value: TagValue) -> Result<(), PlcError> {
        let mut state = self.lock();
        if !state.functional {
            return Err(PlcError::NotFunctional);
        }
        if !state.tags.contains_key(tag) {
            return Err(PlcError::UnknownTag(tag.to_string()));
        }
        state.tags.insert(tag.to_string(), value);

        if tag == tags::MOVE_TYPE {
            let move_type = PlcState::from_code(value.as_int().unwrap_or_default());
            state.submissions.push(move_type);
            if state.ignore_moves {
                return Ok(());
            }
            let polls = state.completion_polls;
            state.busy = Some((polls, move_type));
            state.tags.insert(tags::STATE.to_string(), TagValue::Int(move_type.code()));
            state.tags.insert(tags::READY.to_string(), TagValue::Bool(false));
        }
        Ok(())
    }

    fn is_functional(&self) -> bool {
        self.lock().functional
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn move_completes_after_configured_polls() {
        let plc = SimulatedPlc::new(2);
        plc.write_tag(tags::X_POSITION, TagValue::Float(12.0)).await.unwrap();
        plc.write_tag(tags::MOVE_TYPE, TagValue::Int(PlcState::XySeek.code())).await.unwrap();

        assert_eq!(plc.read_tag(tags::READY).await.unwrap(), TagValue::Bool(false));
        assert_eq!(plc.read_tag(tags::READY).await.unwrap(), TagValue::Bool(false));
        assert_eq!(plc.read_tag(tags::READY).await.unwrap(), TagValue::Bool(true));
        assert_eq!(plc.tag("X_axis.ActualPosition"), Some(TagValue::Float(12.0)));
        assert_eq!(plc.submissions(), vec![PlcState::XySeek]);
    }

    #[tokio::test]
    async fn unknown_tags_are_rejected() {
        let plc = SimulatedPlc::new(1);
        assert_eq!(plc.read_tag("NOPE").await, Err(PlcError::UnknownTag("NOPE".into())));
    }
}
