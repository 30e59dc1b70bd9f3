// Shared fixtures for the integration tests.
#![allow(dead_code)]

use apa_winder::calibration::{CalibrationLibrary, PinId, PinTable};
use apa_winder::config::Config;
use apa_winder::file_manager::FileManager;
use apa_winder::gcode::{GCodeHandler, Recipe};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const LAYER: &str = "X";

/// Default machine, queue of four, data under `data_dir`.
pub fn config(data_dir: &Path) -> Config {
    let mut config = Config::default();
    config.machine.apa_name = "APA-T".to_string();
    config.machine.data_dir = data_dir.to_path_buf();
    config.machine.queue_capacity = 4;
    config
}

/// Pins 1..=8 on both faces of layer X, 100 mm apart up the right edge.
pub fn pin_table() -> PinTable {
    let points = (1..=8u32).flat_map(|n| {
        let y = 100.0 * n as f64;
        [(PinId::front(n), 7000.0, y), (PinId::back(n), 7000.0, y)]
    });
    PinTable::new(LAYER, 0.0, 434.0, points).unwrap()
}

pub fn handler_for(config: &Config, table: PinTable) -> GCodeHandler {
    let mut library = CalibrationLibrary::new(HashMap::new());
    library.insert(table);
    GCodeHandler::new(
        Arc::new(config.machine_geometry().unwrap()),
        config.motion,
        config.layer_geometries().unwrap(),
        library,
    )
}

pub fn handler() -> GCodeHandler {
    handler_for(&Config::default(), pin_table())
}

/// A sealed layer-X recipe.
pub fn recipe(statements: &str) -> Recipe {
    Recipe::parse(&Recipe::seal(&format!("(LAYER {})\n{}", LAYER, statements))).unwrap()
}

/// `count` one-move lines: (100, 100), then 100 mm steps along X.
pub fn straight_lines(count: usize) -> String {
    (1..=count).map(|n| format!("N{} G1 X{} Y100\n", n, 100 * n)).collect()
}

pub fn straight_lines_wire(count: usize) -> f64 {
    if count == 0 {
        return 0.0;
    }
    100.0 * 2f64.sqrt() + 100.0 * (count - 1) as f64
}

/// Lay out a data directory with the calibration and one sealed recipe.
pub fn data_dir(root: &Path, recipe_name: &str, statements: &str) -> (FileManager, PathBuf) {
    let files = FileManager::new(root);
    files.ensure_layout().unwrap();
    pin_table().save(&files.calibration_path(LAYER)).unwrap();
    let path = files.recipe_path(recipe_name);
    fs::write(&path, Recipe::seal(&format!("(LAYER {})\n{}", LAYER, statements))).unwrap();
    (files, path)
}
