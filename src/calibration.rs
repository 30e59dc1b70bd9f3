// src/calibration.rs - Per-layer pin calibration tables
//! Maps every pin of a layer to its measured machine location.
//!
//! Tables are stored as XML:
//!
//! ```xml
//! <LayerCalibration layer="X" zFront="20.5" zBack="415.0">
//!   <offset x="0.25" y="-0.1"/>
//!   <pin id="F1" x="571.2" y="170.0"/>
//!   <pin id="B1" x="571.2" y="170.0"/>
//! </LayerCalibration>
//! ```
//!
//! The `offset` element shifts every pin; Z comes from the face the pin is on.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

use crate::file_manager::{FileManager, FileManagerError};
use crate::geometry::{FrameEdge, LayerGeometry, Location};

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("Calibration for layer '{layer}' is missing ({path})")]
    CalibrationMissing { layer: String, path: PathBuf },
    #[error("Unknown pin {0}")]
    UnknownPin(PinId),
    #[error("Invalid pin id '{0}'")]
    InvalidPinId(String),
    #[error("Duplicate pin {0} in calibration")]
    DuplicatePin(PinId),
    #[error("Pin {pin} has a non-finite location")]
    NonFinite { pin: PinId },
    #[error("Calibration is for layer '{found}', expected '{expected}'")]
    LayerMismatch { expected: String, found: String },
    #[error("Pin {pin} is outside layer '{layer}' ({pin_count} pins per face)")]
    OrdinalOutOfRange { pin: PinId, layer: String, pin_count: u32 },
    #[error("Pin {pin} breaks the monotonic Y order of its edge")]
    NonMonotonic { pin: PinId },
    #[error("XML error: {0}")]
    Xml(String),
    #[error("File error: {0}")]
    File(#[from] FileManagerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PinSide {
    Front,
    Back,
}

impl PinSide {
    pub fn letter(self) -> char {
        match self {
            PinSide::Front => 'F',
            PinSide::Back => 'B',
        }
    }
}

/// A pin addressed by face and 1-based ordinal, written `F123` / `B456`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PinId {
    pub side: PinSide,
    pub ordinal: u32,
}

impl PinId {
    pub const fn front(ordinal: u32) -> Self {
        Self { side: PinSide::Front, ordinal }
    }

    pub const fn back(ordinal: u32) -> Self {
        Self { side: PinSide::Back, ordinal }
    }
}

impl fmt::Display for PinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.side.letter(), self.ordinal)
    }
}

impl FromStr for PinId {
    type Err = CalibrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CalibrationError::InvalidPinId(s.to_string());
        let mut chars = s.trim().chars();
        let side = match chars.next().map(|c| c.to_ascii_uppercase()) {
            Some('F') => PinSide::Front,
            Some('B') => PinSide::Back,
            _ => return Err(invalid()),
        };
        let ordinal: u32 = chars.as_str().parse().map_err(|_| invalid())?;
        if ordinal == 0 {
            return Err(invalid());
        }
        Ok(PinId { side, ordinal })
    }
}

// --- XML schema ---

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "LayerCalibration", deny_unknown_fields)]
struct CalibrationDocument {
    #[serde(rename = "@layer")]
    layer: String,
    #[serde(rename = "@zFront")]
    z_front: f64,
    #[serde(rename = "@zBack")]
    z_back: f64,
    #[serde(rename = "offset", default, skip_serializing_if = "Option::is_none")]
    offset: Option<OffsetElement>,
    #[serde(rename = "pin", default)]
    pins: Vec<PinElement>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct OffsetElement {
    #[serde(rename = "@x")]
    x: f64,
    #[serde(rename = "@y")]
    y: f64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct PinElement {
    #[serde(rename = "@id")]
    id: String,
    #[serde(rename = "@x")]
    x: f64,
    #[serde(rename = "@y")]
    y: f64,
}

/// Immutable pin → location table for one layer.
#[derive(Debug, Clone, PartialEq)]
pub struct PinTable {
    layer: String,
    z_front: f64,
    z_back: f64,
    pins: BTreeMap<PinId, Location>,
}

impl PinTable {
    /// Build a table from face-local XY points; Z is filled in per face.
    pub fn new(
        layer: &str,
        z_front: f64,
        z_back: f64,
        points: impl IntoIterator<Item = (PinId, f64, f64)>,
    ) -> Result<Self, CalibrationError> {
        let mut pins = BTreeMap::new();
        for (pin, x, y) in points {
            let z = match pin.side {
                PinSide::Front => z_front,
                PinSide::Back => z_back,
            };
            let location = Location::new(x, y, z);
            if !location.is_finite() {
                return Err(CalibrationError::NonFinite { pin });
            }
            if pins.insert(pin, location).is_some() {
                return Err(CalibrationError::DuplicatePin(pin));
            }
        }
        Ok(Self { layer: layer.to_string(), z_front, z_back, pins })
    }

    pub fn from_xml(xml: &str) -> Result<Self, CalibrationError> {
        let document: CalibrationDocument = quick_xml::de::from_str(xml).map_err(|e| {
            tracing::warn!("Rejected calibration document: {}", e);
            CalibrationError::Xml(e.to_string())
        })?;
        let (dx, dy) = document.offset.as_ref().map_or((0.0, 0.0), |o| (o.x, o.y));
        let mut points = Vec::with_capacity(document.pins.len());
        for pin in &document.pins {
            let id: PinId = pin.id.parse()?;
            points.push((id, pin.x + dx, pin.y + dy));
        }
        Self::new(&document.layer, document.z_front, document.z_back, points)
    }

    /// Serialise with a zero offset; locations are written as resolved.
    pub fn to_xml(&self) -> Result<String, CalibrationError> {
        let document = CalibrationDocument {
            layer: self.layer.clone(),
            z_front: self.z_front,
            z_back: self.z_back,
            offset: None,
            pins: self
                .pins
                .iter()
                .map(|(id, location)| PinElement { id: id.to_string(), x: location.x, y: location.y })
                .collect(),
        };
        quick_xml::se::to_string(&document).map_err(|e| CalibrationError::Xml(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, CalibrationError> {
        let xml = FileManager::read_text(path)?;
        let table = Self::from_xml(&xml)?;
        tracing::info!(
            "Loaded calibration for layer {} with {} pins from {}",
            table.layer,
            table.pins.len(),
            path.display()
        );
        Ok(table)
    }

    pub fn save(&self, path: &Path) -> Result<(), CalibrationError> {
        FileManager::write_atomic(path, self.to_xml()?.as_bytes())?;
        Ok(())
    }

    pub fn layer(&self) -> &str {
        &self.layer
    }

    pub fn z_front(&self) -> f64 {
        self.z_front
    }

    pub fn z_back(&self) -> f64 {
        self.z_back
    }

    pub fn len(&self) -> usize {
        self.pins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }

    pub fn contains(&self, pin: PinId) -> bool {
        self.pins.contains_key(&pin)
    }

    pub fn resolve(&self, pin: PinId) -> Result<Location, CalibrationError> {
        self.pins.get(&pin).copied().ok_or(CalibrationError::UnknownPin(pin))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PinId, &Location)> {
        self.pins.iter()
    }

    /// Check the table against the layer it claims to describe.
    pub fn validate(&self, geometry: &LayerGeometry) -> Result<(), CalibrationError> {
        if self.layer != geometry.name {
            return Err(CalibrationError::LayerMismatch {
                expected: geometry.name.clone(),
                found: self.layer.clone(),
            });
        }

        // Consecutive pins on a vertical edge must keep moving the same way in Y.
        let mut last_on_edge: HashMap<(PinSide, FrameEdge), (u32, f64, f64)> = HashMap::new();
        for (pin, location) in &self.pins {
            let edge = geometry.edge_of(pin.ordinal).ok_or(CalibrationError::OrdinalOutOfRange {
                pin: *pin,
                layer: geometry.name.clone(),
                pin_count: geometry.pin_count,
            })?;
            if !edge.is_vertical() {
                continue;
            }
            let key = (pin.side, edge);
            match last_on_edge.get(&key) {
                Some(&(ordinal, y, direction)) if ordinal + 1 == pin.ordinal => {
                    let step = location.y - y;
                    if step == 0.0 || (direction != 0.0 && step.signum() != direction) {
                        return Err(CalibrationError::NonMonotonic { pin: *pin });
                    }
                    last_on_edge.insert(key, (pin.ordinal, location.y, step.signum()));
                }
                Some(&(_, _, direction)) => {
                    last_on_edge.insert(key, (pin.ordinal, location.y, direction));
                }
                None => {
                    last_on_edge.insert(key, (pin.ordinal, location.y, 0.0));
                }
            }
        }
        Ok(())
    }
}

/// Lazily loads and caches one [`PinTable`] per layer.
#[derive(Debug, Clone)]
pub struct CalibrationLibrary {
    paths: HashMap<String, PathBuf>,
    tables: HashMap<String, std::sync::Arc<PinTable>>,
}

impl CalibrationLibrary {
    pub fn new(paths: HashMap<String, PathBuf>) -> Self {
        Self { paths, tables: HashMap::new() }
    }

    /// Register an already-loaded table, replacing any cached one.
    pub fn insert(&mut self, table: PinTable) {
        self.tables.insert(table.layer.clone(), std::sync::Arc::new(table));
    }

    pub fn get(&mut self, layer: &str) -> Result<std::sync::Arc<PinTable>, CalibrationError> {
        if let Some(table) = self.tables.get(layer) {
            return Ok(table.clone());
        }
        let path = self.paths.get(layer).cloned().unwrap_or_else(|| PathBuf::from(format!("{}.xml", layer)));
        if !path.exists() {
            return Err(CalibrationError::CalibrationMissing { layer: layer.to_string(), path });
        }
        let table = PinTable::load(&path)?;
        if table.layer != layer {
            return Err(CalibrationError::LayerMismatch {
                expected: layer.to_string(),
                found: table.layer.clone(),
            });
        }
        let table = std::sync::Arc::new(table);
        self.tables.insert(layer.to_string(), table.clone());
        Ok(table)
    }
}
