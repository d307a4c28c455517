//! Per-model output rescales that cannot be derived from calibration.
//!
//! Some trained networks need a bespoke rescale on specific Concat outputs. Those are
//! configured explicitly, keyed by output slot name, instead of being baked into the
//! operator:
//!
//! ```json
//! { "concat": { "output": { "dequantize": 7.0 }, "692": { "requantize": 0.8374 } } }
//! ```
use std::{collections::BTreeMap, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputRescale {
    /// Convert the int8 output to float by dividing by this value.
    Dequantize(f32),
    /// Multiply the int8 output by this ratio and requantize.
    Requantize(f32),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OverrideTable {
    #[serde(default)]
    pub concat: BTreeMap<String, OutputRescale>,
}

impl OverrideTable {
    fn from_json(text: &str) -> anyhow::Result<Self> {
        serde_json::from_str(text).context("parsing override table")
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading override table {}", path.display()))?;
        Self::from_json(&text)
    }

    pub fn concat_rescale(&self, top: &str) -> Option<OutputRescale> {
        self.concat.get(top).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.concat.is_empty()
    }
}
