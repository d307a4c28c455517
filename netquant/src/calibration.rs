//! Calibration table: per-operator activation scales and per-channel weight scales.
//!
//! One entry per line, `<key> <scale> [<scale> ...]`. Keys containing `_param_` hold the
//! per-output-channel weight scales of an operator (`<op>_param_0`), every other key holds
//! the activation scale(s) of the operator input with that name.
use std::{
    collections::HashMap,
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

use crate::error::QuantizeError;

const WEIGHT_KEY_MARKER: &str = "_param_";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationTable {
    activations: HashMap<String, Vec<f32>>,
    weights: HashMap<String, Vec<f32>>,
}

/// Key of the weight scales of operator `op`.
pub fn weight_key(op: &str) -> String {
    format!("{op}{WEIGHT_KEY_MARKER}0")
}

impl CalibrationTable {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, QuantizeError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| malformed(path, e.to_string()))?;
        Self::from_reader(BufReader::new(file), path)
    }

    /// Parse a table. `origin` only labels errors.
    pub fn from_reader(reader: impl BufRead, origin: &Path) -> Result<Self, QuantizeError> {
        let mut table = Self::default();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| malformed(origin, e.to_string()))?;
            let mut tokens = line.split_whitespace();
            let Some(key) = tokens.next() else {
                continue;
            };
            let values = tokens
                .map(|t| t.parse::<f32>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| malformed(origin, format!("line {}: {e}", lineno + 1)))?;
            if values.is_empty() {
                return Err(malformed(
                    origin,
                    format!("line {}: entry {key:?} has no scales", lineno + 1),
                ));
            }
            table.insert(key, values);
        }
        debug!(
            activations = table.activations.len(),
            weights = table.weights.len(),
            "loaded calibration table"
        );
        Ok(table)
    }

    pub fn insert(&mut self, key: &str, values: Vec<f32>) {
        let target = if key.contains(WEIGHT_KEY_MARKER) {
            &mut self.weights
        } else {
            &mut self.activations
        };
        if target.insert(key.to_string(), values).is_some() {
            warn!("calibration entry {key:?} appears more than once, keeping the last");
        }
    }

    /// Activation scales calibrated for the input of operator `name`.
    pub fn activation(&self, name: &str) -> Option<&[f32]> {
        self.activations.get(name).map(Vec::as_slice)
    }

    /// First activation scale of operator `name`.
    pub fn activation_scale(&self, name: &str) -> Option<f32> {
        self.activation(name).and_then(|v| v.first().copied())
    }

    /// Per-output-channel weight scales of operator `op`.
    pub fn weight(&self, op: &str) -> Option<&[f32]> {
        self.weights.get(&weight_key(op)).map(Vec::as_slice)
    }

    pub fn activation_names(&self) -> impl Iterator<Item = &str> {
        self.activations.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.activations.len() + self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn malformed(path: &Path, reason: String) -> QuantizeError {
    QuantizeError::MalformedCalibrationFile {
        path: PathBuf::from(path),
        reason,
    }
}
