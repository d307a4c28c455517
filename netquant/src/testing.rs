//! Small ncnn fixtures for tests.
use std::{collections::BTreeSet, io::Cursor, path::Path};

use itertools::Itertools;

use crate::{
    calibration::CalibrationTable,
    graph::{
        kind::weight_layout,
        loader::{load_weights, parse_param},
        Graph, Storage,
    },
};

/// A convolution whose output is split between a convolution and a residual add.
pub const RESIDUAL: &str = "Input            data     0 1 data 0=4 1=4 2=1
Convolution      conv0    1 1 data c0 0=2 1=1 5=1 6=2
Split            split    1 2 c0 s0 s1
Convolution      conv1    1 1 s0 o1 0=2 1=1 5=1 6=4
BinaryOp         add      2 1 s1 o1 sum 0=0
Convolution      conv2    1 1 sum o2 0=2 1=1 5=1 6=4
Softmax          prob     1 1 o2 prob 0=1";

pub const RESIDUAL_SCALES: &str = "conv0 10.0
conv0_param_0 100.0 50.0
conv1 2.0
conv1_param_0 20.0 20.0
conv2 3.0
conv2_param_0 30.0 30.0
";

/// Wrap layer lines with the magic and counts line of a param file.
pub fn param_text(layers: &str) -> String {
    let lines = layers
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect_vec();
    let mut blobs = BTreeSet::new();
    for line in &lines {
        let tokens = line.split_whitespace().collect_vec();
        let bottoms: usize = tokens[2].parse().unwrap();
        let tops: usize = tokens[3].parse().unwrap();
        blobs.extend(tokens[4..4 + bottoms + tops].iter().copied());
    }
    format!("7767517\n{} {}\n{}\n", lines.len(), blobs.len(), lines.join("\n"))
}

pub fn graph(layers: &str) -> Graph {
    parse_param(&param_text(layers)).unwrap()
}

pub fn table(text: &str) -> CalibrationTable {
    CalibrationTable::from_reader(Cursor::new(text), Path::new("test.table")).unwrap()
}

/// Deterministic float weights for every blob `graph` expects, as a weight stream.
pub fn synthetic_bin(graph: &Graph) -> Vec<u8> {
    let mut bin = Vec::new();
    let mut seed = 0usize;
    for op in graph.ops() {
        for spec in weight_layout(op.kind, &op.params).unwrap() {
            let values = (0..spec.len)
                .map(|i| (((seed + i) % 17) as f32 - 8.0) * 0.05)
                .collect_vec();
            seed += spec.len;
            match spec.storage {
                Storage::Tagged => {
                    bin.extend_from_slice(&0u32.to_le_bytes());
                    bin.extend_from_slice(bytemuck::cast_slice::<f32, u8>(&values));
                }
                Storage::RawF32 => bin.extend_from_slice(bytemuck::cast_slice::<f32, u8>(&values)),
                Storage::RawI32 => bin.extend(std::iter::repeat(0u8).take(spec.len * 4)),
            }
        }
    }
    bin
}

/// Parse `layers` and attach [`synthetic_bin`] weights.
pub fn graph_with_weights(layers: &str) -> Graph {
    let mut g = graph(layers);
    let bin = synthetic_bin(&g);
    load_weights(&mut g, &bin).unwrap();
    g
}
