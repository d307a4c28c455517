//! Writes a [`Graph`] back as an ncnn param/bin pair.
//!
//! The param text lists every operator except the `ncnnfused` placeholders; the slot
//! count is recomputed from the operators that remain. Weights are written in operator
//! order: tagged blobs get a 4-byte tag and are zero-padded to a 4-byte boundary, raw
//! blobs are written as is.
use std::{collections::BTreeSet, fs, path::Path};

use anyhow::{bail, Context};
use half::f16;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    graph::{
        loader::{PARAM_MAGIC, TAG_FP16, TAG_FP32, TAG_INT8},
        Graph, OpKind, Operator, Storage, Weight,
    },
    tensor::ElemType,
};

/// Encoding of float weights that carry a tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageType {
    #[default]
    Fp32,
    Fp16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveOptions {
    pub storage: StorageType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveSummary {
    pub layers: usize,
    pub blobs: usize,
    pub bin_bytes: usize,
}

fn saved_ops(graph: &Graph) -> impl Iterator<Item = &Operator> {
    graph.ops().iter().filter(|op| op.kind != OpKind::Fused)
}

/// The param text of `graph`.
pub fn write_param(graph: &Graph) -> String {
    let blob_names = saved_ops(graph)
        .flat_map(|op| op.bottoms.iter().chain(&op.tops))
        .map(|b| graph.blob(*b).name.as_str())
        .collect::<BTreeSet<_>>();
    let header = [
        PARAM_MAGIC.to_string(),
        format!("{} {}", saved_ops(graph).count(), blob_names.len()),
    ];
    let layers = saved_ops(graph).map(|op| {
        let slots = op
            .bottoms
            .iter()
            .chain(&op.tops)
            .map(|b| format!(" {}", graph.blob(*b).name))
            .join("");
        format!(
            "{:<24} {:<24} {} {}{slots}{}",
            op.kind.type_name(),
            op.name,
            op.bottoms.len(),
            op.tops.len(),
            op.params.to_text()
        )
    });
    header.into_iter().chain(layers).map(|line| line + "\n").join("")
}

/// The weight stream of `graph`.
pub fn write_bin(graph: &Graph, opts: &SaveOptions) -> anyhow::Result<Vec<u8>> {
    let mut bin = Vec::new();
    for op in saved_ops(graph) {
        for (i, weight) in op.weights.iter().enumerate() {
            write_weight(&mut bin, weight, opts)
                .with_context(|| format!("writing weight #{i} of {} {:?}", op.kind, op.name))?;
        }
    }
    Ok(bin)
}

fn write_weight(bin: &mut Vec<u8>, weight: &Weight, opts: &SaveOptions) -> anyhow::Result<()> {
    let data = &weight.data;
    match (weight.storage, data.elem_type()) {
        (Storage::Tagged, Some(ElemType::F32)) => match opts.storage {
            StorageType::Fp32 => {
                bin.extend_from_slice(&TAG_FP32.to_le_bytes());
                bin.extend_from_slice(&data.to_bytes()?);
            }
            StorageType::Fp16 => {
                let halves = data
                    .to_packed::<f32>()?
                    .into_iter()
                    .map(|v| f16::from_f32(v).to_bits())
                    .collect_vec();
                bin.extend_from_slice(&TAG_FP16.to_le_bytes());
                bin.extend_from_slice(bytemuck::cast_slice(&halves));
                pad(bin);
            }
        },
        (Storage::Tagged, Some(ElemType::I8)) => {
            bin.extend_from_slice(&TAG_INT8.to_le_bytes());
            bin.extend_from_slice(&data.to_bytes()?);
            pad(bin);
        }
        (Storage::RawF32, Some(ElemType::F32)) | (Storage::RawI32, Some(ElemType::I32)) => {
            bin.extend_from_slice(&data.to_bytes()?);
        }
        (storage, elem) => bail!("cannot store {elem:?} data as {storage:?}"),
    }
    Ok(())
}

fn pad(bin: &mut Vec<u8>) {
    bin.resize(bin.len().next_multiple_of(4), 0);
}

/// Write `graph` to `param` and `bin`.
pub fn save(
    graph: &Graph,
    param: impl AsRef<Path>,
    bin: impl AsRef<Path>,
    opts: &SaveOptions,
) -> anyhow::Result<SaveSummary> {
    let (param, bin) = (param.as_ref(), bin.as_ref());
    let text = write_param(graph);
    let weights = write_bin(graph, opts)?;
    fs::write(param, &text).with_context(|| format!("writing {}", param.display()))?;
    fs::write(bin, &weights).with_context(|| format!("writing {}", bin.display()))?;
    let summary = SaveSummary {
        layers: saved_ops(graph).count(),
        blobs: text
            .lines()
            .nth(1)
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|b| b.parse().ok())
            .unwrap_or_default(),
        bin_bytes: weights.len(),
    };
    info!(
        param = %param.display(),
        bin = %bin.display(),
        layers = summary.layers,
        blobs = summary.blobs,
        "saved model"
    );
    Ok(summary)
}
