// src/plc/io.rs - I/O points and the registry that polls them
//! Each point mirrors one PLC tag. Inputs are refreshed by [`IoRegistry::poll_inputs`];
//! outputs are staged with [`IoPoint::write`] and sent by [`IoRegistry::flush_outputs`]
//! in registration order.

use std::collections::HashMap;

use super::adapter::{PlcAdapter, PlcError, TagValue};
use super::tags::{self, Axis};

#[derive(Debug, Clone, PartialEq)]
pub enum IoPoint {
    DigitalIn { tag: String, value: bool },
    DigitalOut { tag: String, value: bool, dirty: bool },
    AnalogIn { tag: String, value: f64 },
    AnalogOut { tag: String, value: f64, dirty: bool },
    Word { tag: String, value: i32, output: bool, dirty: bool },
}

impl IoPoint {
    pub fn digital_in(tag: impl Into<String>) -> Self {
        IoPoint::DigitalIn { tag: tag.into(), value: false }
    }

    pub fn digital_out(tag: impl Into<String>) -> Self {
        IoPoint::DigitalOut { tag: tag.into(), value: false, dirty: false }
    }

    pub fn analog_in(tag: impl Into<String>) -> Self {
        IoPoint::AnalogIn { tag: tag.into(), value: 0.0 }
    }

    pub fn analog_out(tag: impl Into<String>) -> Self {
        IoPoint::AnalogOut { tag: tag.into(), value: 0.0, dirty: false }
    }

    pub fn word_in(tag: impl Into<String>) -> Self {
        IoPoint::Word { tag: tag.into(), value: 0, output: false, dirty: false }
    }

    pub fn word_out(tag: impl Into<String>) -> Self {
        IoPoint::Word { tag: tag.into(), value: 0, output: true, dirty: false }
    }

    pub fn tag(&self) -> &str {
        match self {
            IoPoint::DigitalIn { tag, .. }
            | IoPoint::DigitalOut { tag, .. }
            | IoPoint::AnalogIn { tag, .. }
            | IoPoint::AnalogOut { tag, .. }
            | IoPoint::Word { tag, .. } => tag,
        }
    }

    pub fn is_output(&self) -> bool {
        matches!(
            self,
            IoPoint::DigitalOut { .. } | IoPoint::AnalogOut { .. } | IoPoint::Word { output: true, .. }
        )
    }

    /// Last known value.
    pub fn read(&self) -> TagValue {
        match *self {
            IoPoint::DigitalIn { value, .. } | IoPoint::DigitalOut { value, .. } => TagValue::Bool(value),
            IoPoint::AnalogIn { value, .. } | IoPoint::AnalogOut { value, .. } => TagValue::Float(value as f32),
            IoPoint::Word { value, .. } => TagValue::Int(value),
        }
    }

    /// Stage a new output value; it is sent on the next flush.
    pub fn write(&mut self, new: TagValue) -> Result<(), PlcError> {
        let mismatch = |tag: &str, expected: &'static str| PlcError::TypeMismatch {
            tag: tag.to_string(),
            expected,
            found: new,
        };
        match self {
            IoPoint::DigitalOut { tag, value, dirty } => {
                *value = new.as_bool().ok_or_else(|| mismatch(tag.as_str(), "bool"))?;
                *dirty = true;
            }
            IoPoint::AnalogOut { tag, value, dirty } => {
                *value = new.as_float().ok_or_else(|| mismatch(tag.as_str(), "float"))?;
                *dirty = true;
            }
            IoPoint::Word { tag, value, output: true, dirty } => {
                *value = new.as_int().ok_or_else(|| mismatch(tag.as_str(), "int"))?;
                *dirty = true;
            }
            input => return Err(PlcError::ReadOnly(input.tag().to_string())),
        }
        Ok(())
    }

    /// Refresh an input from the PLC, or send a staged output.
    pub async fn poll(&mut self, adapter: &dyn PlcAdapter) -> Result<(), PlcError> {
        if self.is_output() {
            let pending = match self {
                IoPoint::DigitalOut { dirty, .. } | IoPoint::AnalogOut { dirty, .. } | IoPoint::Word { dirty, .. } => {
                    *dirty
                }
                _ => false,
            };
            if pending {
                adapter.write_tag(self.tag(), self.read()).await?;
                if let IoPoint::DigitalOut { dirty, .. } | IoPoint::AnalogOut { dirty, .. } | IoPoint::Word { dirty, .. } =
                    self
                {
                    *dirty = false;
                }
            }
            return Ok(());
        }

        let fresh = adapter.read_tag(self.tag()).await?;
        let mismatch = |tag: &str, expected: &'static str| PlcError::TypeMismatch {
            tag: tag.to_string(),
            expected,
            found: fresh,
        };
        match self {
            IoPoint::DigitalIn { tag, value } => *value = fresh.as_bool().ok_or_else(|| mismatch(tag.as_str(), "bool"))?,
            IoPoint::AnalogIn { tag, value } => *value = fresh.as_float().ok_or_else(|| mismatch(tag.as_str(), "float"))?,
            IoPoint::Word { tag, value, .. } => *value = fresh.as_int().ok_or_else(|| mismatch(tag.as_str(), "int"))?,
            _ => {}
        }
        Ok(())
    }
}

/// All I/O points the host knows about, looked up by tag.
#[derive(Debug, Clone, Default)]
pub struct IoRegistry {
    points: Vec<IoPoint>,
    index: HashMap<String, usize>,
}

impl IoRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The winder's tag map. `MOVE_TYPE` is registered last so it is
    /// written after the parameters it triggers on.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        let mut points = vec![
            IoPoint::word_in(tags::STATE),
            IoPoint::word_in(tags::ERROR_CODE),
            IoPoint::word_in(tags::MACHINE_SW_STAT),
            IoPoint::digital_in(tags::READY),
        ];
        for axis in Axis::ALL {
            points.push(IoPoint::analog_in(axis.actual_position()));
            points.push(IoPoint::analog_in(axis.actual_velocity()));
            points.push(IoPoint::analog_in(axis.command_acceleration()));
            points.push(IoPoint::digital_in(axis.module_fault()));
        }
        for tag in [
            tags::X_POSITION,
            tags::Y_POSITION,
            tags::Z_POSITION,
            tags::XY_SPEED,
            tags::XY_ACCELERATION,
            tags::XY_DECELERATION,
        ] {
            points.push(IoPoint::analog_out(tag));
        }
        points.push(IoPoint::word_out(tags::LATCH_SIDE));
        points.push(IoPoint::word_out(tags::HEAD_SIDE));
        points.push(IoPoint::word_out(tags::MOVE_TYPE));

        for point in points {
            registry.register(point);
        }
        registry
    }

    /// Add a point. A point with an already registered tag replaces it.
    pub fn register(&mut self, point: IoPoint) {
        match self.index.get(point.tag()) {
            Some(&slot) => self.points[slot] = point,
            None => {
                self.index.insert(point.tag().to_string(), self.points.len());
                self.points.push(point);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn get(&self, tag: &str) -> Option<&IoPoint> {
        self.index.get(tag).map(|&slot| &self.points[slot])
    }

    pub fn value(&self, tag: &str) -> Option<TagValue> {
        self.get(tag).map(IoPoint::read)
    }

    pub fn set(&mut self, tag: &str, value: TagValue) -> Result<(), PlcError> {
        let slot = *self.index.get(tag).ok_or_else(|| PlcError::UnknownTag(tag.to_string()))?;
        self.points[slot].write(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &IoPoint> {
        self.points.iter()
    }

    pub async fn poll_inputs(&mut self, adapter: &dyn PlcAdapter) -> Result<(), PlcError> {
        for point in self.points.iter_mut().filter(|p| !p.is_output()) {
            point.poll(adapter).await?;
        }
        Ok(())
    }

    pub async fn flush_outputs(&mut self, adapter: &dyn PlcAdapter) -> Result<(), PlcError> {
        for point in self.points.iter_mut().filter(|p| p.is_output()) {
            point.poll(adapter).await?;
        }
        Ok(())
    }
}
