//! # Winder Configuration
//!
//! The host reads a single TOML file at startup. Every section is optional;
//! missing values fall back to the defaults below.
//!
//! ```toml
//! [machine]
//! apa_name = "APA-1"
//! data_dir = "data"
//! io_period_ms = 100
//!
//! [motion]
//! default_velocity = 300.0
//! max_velocity = 1000.0
//!
//! [layers.V]
//! rows = 400
//! columns = 799
//! delta_x = 8.0
//! delta_y = 5.75
//! wrap = "clockwise"
//! ```
//!
//! `validate()` must pass before the configuration is handed to the core.

// src/config.rs - Single configuration file
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::geometry::{
    Corner, GeometryError, HeadPositions, LayerGeometry, MachineBounds, MachineGeometry, PinNumbering,
    TransferBox, WrapDirection,
};
use crate::motion::MotionLimits;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Geometry error: {0}")]
    Geometry(#[from] GeometryError),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration struct for the winder host.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub machine: MachineConfig,
    #[serde(default)]
    pub motion: MotionConfig,
    #[serde(default)]
    pub bounds: MachineBounds,
    #[serde(default)]
    pub transfer: TransferBox,
    #[serde(default)]
    pub head: HeadPositions,
    #[serde(default = "default_layers")]
    pub layers: HashMap<String, LayerConfig>,
    #[serde(default)]
    pub ui: UiConfig,
    #[serde(default)]
    pub plc: PlcConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            machine: MachineConfig::default(),
            motion: MotionConfig::default(),
            bounds: MachineBounds::default(),
            transfer: TransferBox::default(),
            head: HeadPositions::default(),
            layers: default_layers(),
            ui: UiConfig::default(),
            plc: PlcConfig::default(),
        }
    }
}

/// Machine-level runtime settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MachineConfig {
    #[serde(default = "default_apa_name")]
    pub apa_name: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_io_period_ms")]
    pub io_period_ms: u64,
    #[serde(default = "default_plc_timeout_ms")]
    pub plc_timeout_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_persist_line_interval")]
    pub persist_line_interval: usize,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Longest the PLC may take to finish one primitive.
    #[serde(default = "default_move_timeout_ms")]
    pub move_timeout_ms: u64,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            apa_name: default_apa_name(),
            data_dir: default_data_dir(),
            io_period_ms: default_io_period_ms(),
            plc_timeout_ms: default_plc_timeout_ms(),
            queue_capacity: default_queue_capacity(),
            persist_line_interval: default_persist_line_interval(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            move_timeout_ms: default_move_timeout_ms(),
        }
    }
}

impl MachineConfig {
    pub fn io_period(&self) -> Duration {
        Duration::from_millis(self.io_period_ms)
    }

    pub fn plc_timeout(&self) -> Duration {
        Duration::from_millis(self.plc_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn move_timeout(&self) -> Duration {
        Duration::from_millis(self.move_timeout_ms)
    }
}

/// Velocity, acceleration and deceleration defaults and ceilings.
///
/// Feeds given with `F` on a recipe line use the same unit as `max_velocity`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct MotionConfig {
    #[serde(default = "default_velocity")]
    pub default_velocity: f64,
    #[serde(default = "default_max_velocity")]
    pub max_velocity: f64,
    #[serde(default = "default_acceleration")]
    pub default_acceleration: f64,
    #[serde(default = "default_max_acceleration")]
    pub max_acceleration: f64,
    #[serde(default = "default_acceleration")]
    pub default_deceleration: f64,
    #[serde(default = "default_max_acceleration")]
    pub max_deceleration: f64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            default_velocity: default_velocity(),
            max_velocity: default_max_velocity(),
            default_acceleration: default_acceleration(),
            max_acceleration: default_max_acceleration(),
            default_deceleration: default_acceleration(),
            max_deceleration: default_max_acceleration(),
        }
    }
}

impl MotionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let pairs = [
            ("velocity", self.default_velocity, self.max_velocity),
            ("acceleration", self.default_acceleration, self.max_acceleration),
            ("deceleration", self.default_deceleration, self.max_deceleration),
        ];
        for (name, default, max) in pairs {
            if !(default.is_finite() && max.is_finite() && default > 0.0 && max > 0.0) {
                return Err(ConfigError::Invalid(format!("motion {} limits must be positive", name)));
            }
            if default > max {
                return Err(ConfigError::Invalid(format!(
                    "default {} {} exceeds maximum {}",
                    name, default, max
                )));
            }
        }
        Ok(())
    }

    /// Effective limits for a move: the feed (or the default) capped at the maximum.
    pub fn resolve(&self, feed: Option<f64>) -> MotionLimits {
        MotionLimits {
            velocity: feed.unwrap_or(self.default_velocity).min(self.max_velocity),
            acceleration: self.default_acceleration.min(self.max_acceleration),
            deceleration: self.default_deceleration.min(self.max_deceleration),
        }
    }
}

/// One layer's pin layout.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LayerConfig {
    pub rows: u32,
    pub columns: u32,
    #[serde(default)]
    pub delta_x: Option<f64>,
    pub delta_y: f64,
    #[serde(default)]
    pub start: Corner,
    #[serde(default)]
    pub wrap: WrapDirection,
    /// Overrides `<data>/calibration/<layer>.xml`.
    #[serde(default)]
    pub calibration: Option<PathBuf>,
}

impl LayerConfig {
    pub fn geometry(&self, name: &str) -> Result<LayerGeometry, GeometryError> {
        LayerGeometry::new(
            name,
            self.rows,
            self.columns,
            self.delta_x,
            self.delta_y,
            PinNumbering { start: self.start, wrap: self.wrap },
        )
    }
}

/// Line-oriented command channel.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UiConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_ui_port")]
    pub port: u16,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_ui_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlcConfig {
    /// Run against the in-process simulated PLC.
    #[serde(default = "default_simulated")]
    pub simulated: bool,
    /// Polls a simulated motion stays busy before reporting ready.
    #[serde(default = "default_completion_polls")]
    pub completion_polls: u32,
}

impl Default for PlcConfig {
    fn default() -> Self {
        Self {
            simulated: default_simulated(),
            completion_polls: default_completion_polls(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let machine = &self.machine;
        if machine.apa_name.trim().is_empty() {
            return Err(ConfigError::Invalid("machine.apa_name cannot be empty".to_string()));
        }
        if machine.io_period_ms == 0 {
            return Err(ConfigError::Invalid("machine.io_period_ms must be positive".to_string()));
        }
        if machine.plc_timeout_ms == 0 {
            return Err(ConfigError::Invalid("machine.plc_timeout_ms must be positive".to_string()));
        }
        if machine.move_timeout_ms == 0 {
            return Err(ConfigError::Invalid("machine.move_timeout_ms must be positive".to_string()));
        }
        if machine.queue_capacity == 0 {
            return Err(ConfigError::Invalid("machine.queue_capacity must be at least 1".to_string()));
        }
        if machine.persist_line_interval == 0 {
            return Err(ConfigError::Invalid("machine.persist_line_interval must be at least 1".to_string()));
        }
        self.motion.validate()?;
        self.machine_geometry()?;
        self.layer_geometries()?;
        Ok(())
    }

    pub fn machine_geometry(&self) -> Result<MachineGeometry, GeometryError> {
        MachineGeometry::new(self.bounds, self.transfer, self.head)
    }

    pub fn layer_geometries(&self) -> Result<HashMap<String, LayerGeometry>, GeometryError> {
        self.layers
            .iter()
            .map(|(name, layer)| layer.geometry(name).map(|geometry| (name.clone(), geometry)))
            .collect()
    }

    /// Calibration file for every configured layer.
    pub fn calibration_paths(&self, files: &crate::file_manager::FileManager) -> HashMap<String, PathBuf> {
        self.layers
            .iter()
            .map(|(name, layer)| {
                let path = layer.calibration.clone().unwrap_or_else(|| files.calibration_path(name));
                (name.clone(), path)
            })
            .collect()
    }
}

// Default value functions
fn default_apa_name() -> String { "APA".to_string() }
fn default_data_dir() -> PathBuf { PathBuf::from("data") }
fn default_io_period_ms() -> u64 { 100 }
fn default_plc_timeout_ms() -> u64 { 500 }
fn default_queue_capacity() -> usize { 8 }
fn default_persist_line_interval() -> usize { 1 }
fn default_shutdown_timeout_ms() -> u64 { 5000 }
fn default_move_timeout_ms() -> u64 { 120_000 }
fn default_velocity() -> f64 { 300.0 }
fn default_max_velocity() -> f64 { 1000.0 }
fn default_acceleration() -> f64 { 500.0 }
fn default_max_acceleration() -> f64 { 2000.0 }
fn default_bind_address() -> String { "0.0.0.0".to_string() }
fn default_ui_port() -> u16 { 6626 }
fn default_simulated() -> bool { true }
fn default_completion_polls() -> u32 { 2 }

fn default_layers() -> HashMap<String, LayerConfig> {
    let straight = |rows| LayerConfig {
        rows,
        columns: 0,
        delta_x: None,
        delta_y: 4.7916,
        start: Corner::BottomLeft,
        wrap: WrapDirection::CounterClockwise,
        calibration: None,
    };
    let diagonal = |wrap| LayerConfig {
        rows: 400,
        columns: 1146,
        delta_x: Some(8.0),
        delta_y: 5.75,
        start: Corner::BottomLeft,
        wrap,
        calibration: None,
    };
    HashMap::from([
        ("X".to_string(), straight(480)),
        ("G".to_string(), straight(481)),
        ("V".to_string(), diagonal(WrapDirection::CounterClockwise)),
        ("U".to_string(), diagonal(WrapDirection::Clockwise)),
    ])
}

/// Load and validate the configuration file.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}
