// src/process/apa.rs - Persistent record of one APA's production progress
//! Stored as `<data>/APA/<name>.xml`:
//!
//! ```xml
//! <APA name="APA-1" stage="2" currentRecipe="recipes/V.gc" currentLine="1204">
//!   <layer name="X" woundLength="183211.5"/>
//!   <fault time="2026-03-02T10:11:12Z" kind="plc" line="1204" message="PLC did not answer within 500 ms"/>
//! </APA>
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::PersistenceError;

/// Coarse production phase; stored as its number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ApaStage {
    #[default]
    Uninitialized,
    XLayer,
    VLayer,
    ULayer,
    GLayer,
    SignOff,
    Complete,
}

impl ApaStage {
    pub fn next(self) -> ApaStage {
        match self {
            ApaStage::Uninitialized => ApaStage::XLayer,
            ApaStage::XLayer => ApaStage::VLayer,
            ApaStage::VLayer => ApaStage::ULayer,
            ApaStage::ULayer => ApaStage::GLayer,
            ApaStage::GLayer => ApaStage::SignOff,
            ApaStage::SignOff | ApaStage::Complete => ApaStage::Complete,
        }
    }
}

impl From<ApaStage> for u8 {
    fn from(stage: ApaStage) -> u8 {
        stage as u8
    }
}

impl TryFrom<u8> for ApaStage {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let stage = match value {
            0 => ApaStage::Uninitialized,
            1 => ApaStage::XLayer,
            2 => ApaStage::VLayer,
            3 => ApaStage::ULayer,
            4 => ApaStage::GLayer,
            5 => ApaStage::SignOff,
            6 => ApaStage::Complete,
            other => return Err(format!("unknown APA stage {}", other)),
        };
        Ok(stage)
    }
}

impl fmt::Display for ApaStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ApaStage::Uninitialized => "uninitialized",
            ApaStage::XLayer => "X layer",
            ApaStage::VLayer => "V layer",
            ApaStage::ULayer => "U layer",
            ApaStage::GLayer => "G layer",
            ApaStage::SignOff => "sign-off",
            ApaStage::Complete => "complete",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaultRecord {
    pub time: DateTime<Utc>,
    pub kind: String,
    pub message: String,
    pub line: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApaRecord {
    pub name: String,
    pub stage: ApaStage,
    wound_length: BTreeMap<String, f64>,
    pub current_recipe: Option<String>,
    pub current_line: Option<usize>,
    pub faults: Vec<FaultRecord>,
}

impl ApaRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stage: ApaStage::default(),
            wound_length: BTreeMap::new(),
            current_recipe: None,
            current_line: None,
            faults: Vec::new(),
        }
    }

    pub fn wound_length(&self, layer: &str) -> f64 {
        self.wound_length.get(layer).copied().unwrap_or(0.0)
    }

    pub fn wound_lengths(&self) -> &BTreeMap<String, f64> {
        &self.wound_length
    }

    /// Raise the wound length of `layer`. Lower values are ignored; the
    /// total never goes backwards.
    pub fn set_wound_length(&mut self, layer: &str, length: f64) -> bool {
        let current = self.wound_length(layer);
        if length.is_finite() && length > current {
            self.wound_length.insert(layer.to_string(), length);
            return true;
        }
        false
    }

    pub fn set_recipe(&mut self, recipe: impl Into<String>, line: usize) {
        self.current_recipe = Some(recipe.into());
        self.current_line = Some(line);
    }

    pub fn clear_recipe(&mut self) {
        self.current_recipe = None;
        self.current_line = None;
    }

    pub fn advance_stage(&mut self) -> ApaStage {
        self.stage = self.stage.next();
        self.stage
    }

    pub fn record_fault(&mut self, kind: impl Into<String>, message: impl Into<String>, line: Option<usize>) {
        self.faults.push(FaultRecord { time: Utc::now(), kind: kind.into(), message: message.into(), line });
    }

    pub fn to_xml(&self) -> Result<String, PersistenceError> {
        let document = ApaDocument {
            name: self.name.clone(),
            stage: self.stage,
            current_recipe: self.current_recipe.clone(),
            current_line: self.current_line,
            layers: self
                .wound_length
                .iter()
                .map(|(name, length)| LayerElement { name: name.clone(), wound_length: *length })
                .collect(),
            faults: self
                .faults
                .iter()
                .map(|fault| FaultElement {
                    time: fault.time,
                    kind: fault.kind.clone(),
                    line: fault.line,
                    message: fault.message.clone(),
                })
                .collect(),
        };
        quick_xml::se::to_string(&document).map_err(|e| PersistenceError::Xml(e.to_string()))
    }

    pub fn from_xml(xml: &str) -> Result<Self, PersistenceError> {
        let document: ApaDocument = quick_xml::de::from_str(xml).map_err(|e| {
            tracing::warn!("Rejected APA record: {}", e);
            PersistenceError::Xml(e.to_string())
        })?;
        let mut wound_length = BTreeMap::new();
        for layer in document.layers {
            if !layer.wound_length.is_finite() || layer.wound_length < 0.0 {
                return Err(PersistenceError::Invalid(format!("layer {} wound length", layer.name)));
            }
            wound_length.insert(layer.name, layer.wound_length);
        }
        Ok(Self {
            name: document.name,
            stage: document.stage,
            wound_length,
            current_recipe: document.current_recipe,
            current_line: document.current_line,
            faults: document
                .faults
                .into_iter()
                .map(|fault| FaultRecord { time: fault.time, kind: fault.kind, message: fault.message, line: fault.line })
                .collect(),
        })
    }
}

// --- XML schema ---

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "APA", deny_unknown_fields)]
struct ApaDocument {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@stage")]
    stage: ApaStage,
    #[serde(rename = "@currentRecipe", default, skip_serializing_if = "Option::is_none")]
    current_recipe: Option<String>,
    #[serde(rename = "@currentLine", default, skip_serializing_if = "Option::is_none")]
    current_line: Option<usize>,
    #[serde(rename = "layer", default)]
    layers: Vec<LayerElement>,
    #[serde(rename = "fault", default)]
    faults: Vec<FaultElement>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct LayerElement {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@woundLength")]
    wound_length: f64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct FaultElement {
    #[serde(rename = "@time")]
    time: DateTime<Utc>,
    #[serde(rename = "@kind")]
    kind: String,
    #[serde(rename = "@line", default, skip_serializing_if = "Option::is_none")]
    line: Option<usize>,
    // Attribute rather than text content so surrounding whitespace survives a reload.
    #[serde(rename = "@message", default)]
    message: String,
}
