// src/plc/adapter.rs - Boundary to the PLC wire protocol
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PlcError {
    #[error("PLC did not answer within {timeout_ms} ms")]
    Unresponsive { timeout_ms: u64 },
    #[error("PLC did not complete {primitive} within {timeout_ms} ms")]
    CompletionTimeout { primitive: String, timeout_ms: u64 },
    #[error("Unknown PLC tag '{0}'")]
    UnknownTag(String),
    #[error("Tag '{tag}' holds {found}, expected {expected}")]
    TypeMismatch { tag: String, expected: &'static str, found: TagValue },
    #[error("Tag '{0}' is read-only")]
    ReadOnly(String),
    #[error("PLC is not functional")]
    NotFunctional,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TagValue {
    Bool(bool),
    Int(i32),
    Float(f32),
}

impl TagValue {
    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            TagValue::Bool(value) => Some(value),
            TagValue::Int(value) => Some(value != 0),
            TagValue::Float(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match *self {
            TagValue::Int(value) => Some(value),
            TagValue::Bool(value) => Some(value as i32),
            TagValue::Float(_) => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match *self {
            TagValue::Float(value) => Some(value as f64),
            TagValue::Int(value) => Some(value as f64),
            TagValue::Bool(_) => None,
        }
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::Bool(value) => write!(f, "{}", value),
            TagValue::Int(value) => write!(f, "{}", value),
            TagValue::Float(value) => write!(f, "{}", value),
        }
    }
}

/// Tag-level access to the PLC.
///
/// Implementations may block on the network; callers wrap every call in
/// the configured PLC timeout.
#[async_trait]
pub trait PlcAdapter: Send + Sync {
    async fn read_tag(&self, tag: &str) -> Result<TagValue, PlcError>;

    async fn write_tag(&self, tag: &str, value: TagValue) -> Result<(), PlcError>;

    /// Whether the connection is up and the PLC is in run mode.
    fn is_functional(&self) -> bool;
}
