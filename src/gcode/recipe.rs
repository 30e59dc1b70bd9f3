// src/gcode/recipe.rs - Sealed recipe files
//! A recipe is G-code text with two framing comments:
//!
//! ```text
//! (LAYER V)
//! N1 G108 F1 B1
//! ...
//! (SHA256 3f1c...e9)
//! ```
//!
//! The hash covers every byte before the final line and is checked before
//! any line is parsed.

use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::command::GCodeLine;
use super::parser::{GCodeParser, ParseError};
use crate::calibration::PinId;
use crate::file_manager::{FileManager, FileManagerError};

const HASH_PREFIX: &str = "(SHA256 ";
const LAYER_PREFIX: &str = "(LAYER ";

#[derive(Debug, Error)]
pub enum RecipeError {
    #[error("File error: {0}")]
    File(#[from] FileManagerError),
    #[error("Recipe has no (SHA256 ...) trailer")]
    MissingHash,
    #[error("Recipe hash mismatch: file says {expected}, content is {actual}")]
    HashMismatch { expected: String, actual: String },
    #[error("Recipe does not name its layer")]
    MissingLayer,
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Recipe {
    path: Option<PathBuf>,
    layer: String,
    lines: Vec<GCodeLine>,
    hash: String,
}

impl Recipe {
    pub fn load(path: &Path) -> Result<Self, RecipeError> {
        let text = FileManager::read_text(path)?;
        let mut recipe = Self::parse(&text)?;
        recipe.path = Some(path.to_path_buf());
        tracing::info!(
            "Loaded recipe {} (layer {}, {} lines)",
            path.display(),
            recipe.layer,
            recipe.lines.len()
        );
        Ok(recipe)
    }

    pub fn parse(text: &str) -> Result<Self, RecipeError> {
        let (body, expected) = split_trailer(text)?;
        let actual = digest(body);
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(RecipeError::HashMismatch { expected: expected.to_string(), actual });
        }

        let layer = find_layer(body).ok_or(RecipeError::MissingLayer)?;
        let mut parser = GCodeParser::new();
        let mut lines = Vec::new();
        for (index, text) in body.lines().enumerate() {
            if let Some(line) = parser.parse_line(text, index + 1)? {
                lines.push(line);
            }
        }
        Ok(Self { path: None, layer, lines, hash: actual })
    }

    /// Append the hash trailer to `body`.
    pub fn seal(body: &str) -> String {
        let mut sealed = body.to_string();
        if !sealed.is_empty() && !sealed.ends_with('\n') {
            sealed.push('\n');
        }
        let hash = digest(&sealed);
        sealed.push_str(HASH_PREFIX);
        sealed.push_str(&hash);
        sealed.push_str(")\n");
        sealed
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn layer(&self) -> &str {
        &self.layer
    }

    pub fn lines(&self) -> &[GCodeLine] {
        &self.lines
    }

    pub fn into_lines(self) -> Vec<GCodeLine> {
        self.lines
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Every pin the recipe positions on, sorted and without repeats.
    pub fn pin_references(&self) -> Vec<PinId> {
        let pins: BTreeSet<PinId> = self.lines.iter().flat_map(|line| line.pins()).collect();
        pins.into_iter().collect()
    }
}

fn digest(bytes: &str) -> String {
    hex::encode(Sha256::digest(bytes.as_bytes()))
}

/// Split off the final non-empty line and return `(body, hex)`.
fn split_trailer(text: &str) -> Result<(&str, &str), RecipeError> {
    let trimmed = text.trim_end();
    let start = trimmed.rfind('\n').map_or(0, |i| i + 1);
    let trailer = trimmed[start..].trim();
    let hash = trailer
        .strip_prefix(HASH_PREFIX)
        .and_then(|rest| rest.strip_suffix(')'))
        .map(str::trim)
        .filter(|hash| hash.len() == 64 && hash.chars().all(|c| c.is_ascii_hexdigit()))
        .ok_or(RecipeError::MissingHash)?;
    Ok((&text[..start], hash))
}

/// `(LAYER <name>)` among the comment lines before the first statement.
fn find_layer(body: &str) -> Option<String> {
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(name) = line.strip_prefix(LAYER_PREFIX).and_then(|rest| rest.strip_suffix(')')) {
            let name = name.trim();
            return (!name.is_empty()).then(|| name.to_string());
        }
        if !(line.starts_with('(') || line.starts_with(';')) {
            return None;
        }
    }
    None
}
