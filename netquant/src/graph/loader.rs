//! Reads ncnn `.param` text and `.bin` weight files into a [`Graph`].
use std::{fs::File, path::Path};

use anyhow::{bail, ensure, Context};
use half::f16;
use itertools::Itertools;
use memmap2::Mmap;
use tracing::{debug, warn};

use super::{kind::weight_layout, Graph, OpKind, ParamDict, Storage, Weight, WeightSpec};
use crate::tensor::Tensor;

pub const PARAM_MAGIC: &str = "7767517";
pub const TAG_FP32: u32 = 0;
pub const TAG_FP16: u32 = 0x0130_6B47;
pub const TAG_INT8: u32 = 0x000D_4B38;
pub const TAG_FP32_SCALED: u32 = 0x0002_C056;

pub fn load_param_file(path: impl AsRef<Path>) -> anyhow::Result<Graph> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading param file {}", path.display()))?;
    parse_param(&text).with_context(|| format!("parsing param file {}", path.display()))
}

/// Parse the text graph description.
pub fn parse_param(text: &str) -> anyhow::Result<Graph> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let magic = lines.next().context("empty param file")?.trim();
    ensure!(magic == PARAM_MAGIC, "unsupported param magic {magic:?}");
    let counts = lines.next().context("missing layer/blob counts")?;
    let (layer_count, blob_count) = counts
        .split_whitespace()
        .map(|t| t.parse::<usize>())
        .collect_tuple()
        .with_context(|| format!("malformed counts line {counts:?}"))?;
    let (layer_count, blob_count) = (
        layer_count.context("invalid layer count")?,
        blob_count.context("invalid blob count")?,
    );

    let mut graph = Graph::new();
    for (i, line) in lines.enumerate() {
        ensure!(
            i < layer_count,
            "param file holds more than the {layer_count} announced layers"
        );
        parse_layer(&mut graph, line).with_context(|| format!("layer #{i}: {line:?}"))?;
    }
    ensure!(
        graph.ops().len() == layer_count,
        "param file announces {layer_count} layers but holds {}",
        graph.ops().len()
    );
    ensure!(
        graph.blobs().len() <= blob_count,
        "param file announces {blob_count} blobs but references {}",
        graph.blobs().len()
    );
    if graph.blobs().len() < blob_count {
        warn!(
            "param file announces {blob_count} blobs but only {} are referenced",
            graph.blobs().len()
        );
    }
    Ok(graph)
}

fn parse_layer(graph: &mut Graph, line: &str) -> anyhow::Result<()> {
    let mut tokens = line.split_whitespace();
    let type_name = tokens.next().context("missing layer type")?;
    let name = tokens.next().context("missing layer name")?;
    let kind = OpKind::from_type_name(type_name)
        .with_context(|| format!("unsupported operator type {type_name:?}"))?;
    let bottom_count: usize = tokens
        .next()
        .context("missing bottom count")?
        .parse()
        .context("invalid bottom count")?;
    let top_count: usize = tokens
        .next()
        .context("missing top count")?
        .parse()
        .context("invalid top count")?;
    let bottoms = tokens.by_ref().take(bottom_count).collect_vec();
    let tops = tokens.by_ref().take(top_count).collect_vec();
    ensure!(
        bottoms.len() == bottom_count && tops.len() == top_count,
        "layer {name:?} lists fewer slots than announced"
    );
    let mut params = ParamDict::new();
    for token in tokens {
        params.parse_entry(token)?;
    }
    graph.add_operator(kind, name, &bottoms, &tops, params)?;
    Ok(())
}

/// Cursor over a weight stream.
pub struct ModelBin<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ModelBin<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    fn take(&mut self, len: usize) -> anyhow::Result<&'a [u8]> {
        ensure!(
            len <= self.remaining(),
            "weight stream truncated: need {len} bytes at offset {}, {} left",
            self.offset,
            self.remaining()
        );
        let bytes = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(bytes)
    }

    /// Read `len` bytes and skip the zero padding up to the next 4-byte boundary.
    fn take_aligned(&mut self, len: usize) -> anyhow::Result<&'a [u8]> {
        let bytes = self.take(len)?;
        let padding = len.next_multiple_of(4) - len;
        self.take(padding)?;
        Ok(bytes)
    }

    fn read_u32(&mut self) -> anyhow::Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn load(&mut self, spec: WeightSpec) -> anyhow::Result<Weight> {
        let WeightSpec { len, storage } = spec;
        let data = match storage {
            Storage::RawF32 => {
                Tensor::from_vec_1d(bytemuck::pod_collect_to_vec::<u8, f32>(self.take(len * 4)?))?
            }
            Storage::RawI32 => {
                Tensor::from_vec_1d(bytemuck::pod_collect_to_vec::<u8, i32>(self.take(len * 4)?))?
            }
            Storage::Tagged => self.load_tagged(len)?,
        };
        Ok(Weight::new(data, storage))
    }

    fn load_tagged(&mut self, len: usize) -> anyhow::Result<Tensor> {
        let tag = self.read_u32()?;
        let tensor = match tag {
            TAG_FP16 => {
                let halves = bytemuck::pod_collect_to_vec::<u8, u16>(self.take_aligned(len * 2)?);
                Tensor::from_vec_1d(
                    halves
                        .into_iter()
                        .map(|h| f16::from_bits(h).to_f32())
                        .collect_vec(),
                )?
            }
            TAG_INT8 => {
                Tensor::from_vec_1d(bytemuck::cast_slice::<u8, i8>(self.take_aligned(len)?).to_vec())?
            }
            TAG_FP32 | TAG_FP32_SCALED => {
                Tensor::from_vec_1d(bytemuck::pod_collect_to_vec::<u8, f32>(self.take(len * 4)?))?
            }
            _ => {
                // 256-entry float lookup table followed by one index byte per value
                let table = bytemuck::pod_collect_to_vec::<u8, f32>(self.take(256 * 4)?);
                let indices = self.take_aligned(len)?;
                Tensor::from_vec_1d(indices.iter().map(|i| table[*i as usize]).collect_vec())?
            }
        };
        Ok(tensor)
    }
}

/// Attach the weights of every operator, reading `data` in operator order.
pub fn load_weights(graph: &mut Graph, data: &[u8]) -> anyhow::Result<()> {
    let mut bin = ModelBin::new(data);
    for id in 0..graph.ops().len() {
        let op = graph.op(id);
        let specs = weight_layout(op.kind, &op.params)
            .with_context(|| format!("weight layout of {} {:?}", op.kind, op.name))?;
        let mut weights = Vec::with_capacity(specs.len());
        for spec in specs {
            let weight = bin
                .load(spec)
                .with_context(|| format!("loading weights of {} {:?}", op.kind, op.name))?;
            weights.push(weight);
        }
        if !weights.is_empty() {
            debug!("loaded {} weight blobs for {:?}", weights.len(), op.name);
        }
        graph.op_mut(id).weights = weights;
    }
    if bin.remaining() > 0 {
        bail!(
            "{} trailing bytes left in the weight stream after the last operator",
            bin.remaining()
        );
    }
    Ok(())
}

/// Load a param/bin pair. The weight file is memory-mapped for the duration of the load.
pub fn load_model(param: impl AsRef<Path>, bin: impl AsRef<Path>) -> anyhow::Result<Graph> {
    let mut graph = load_param_file(param)?;
    let bin = bin.as_ref();
    let file = File::open(bin).with_context(|| format!("opening weight file {}", bin.display()))?;
    let len = file.metadata()?.len();
    if len == 0 {
        load_weights(&mut graph, &[])?;
    } else {
        // SAFETY: the file is opened read-only and not modified while mapped.
        let map = unsafe { Mmap::map(&file) }
            .with_context(|| format!("mapping weight file {}", bin.display()))?;
        load_weights(&mut graph, &map)
            .with_context(|| format!("reading weight file {}", bin.display()))?;
    }
    Ok(graph)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{graph::Storage, tensor::ElemType};

    const PARAM: &str = "7767517
3 4
Input            data     0 1 data 0=4 1=4 2=1
Convolution      conv     1 1 data conv 0=2 1=1 5=1 6=2
Split            split    1 2 conv a b
";

    #[test]
    fn parses_layers_and_slots() {
        let g = parse_param(PARAM).unwrap();
        assert_eq!(g.ops().len(), 3);
        assert_eq!(g.blobs().len(), 4);
        let conv = g.find_op("conv").unwrap();
        assert_eq!(g.kind(conv), OpKind::Convolution);
        assert_eq!(g.op(conv).params.get_int(6, 0), 2);
        assert_eq!(g.consumers(conv, 0), &[2]);
    }

    #[test]
    fn rejects_bad_headers_and_unknown_types() {
        assert!(parse_param("7767516\n0 0\n").is_err());
        assert!(parse_param("7767517\n1 1\nSwish s 1 1 a b\n").is_err());
        assert!(parse_param("7767517\n2 2\nInput data 0 1 data\n").is_err());
    }

    #[test]
    fn reads_tagged_and_raw_weights() {
        let mut g = parse_param(PARAM).unwrap();
        let mut bin = Vec::new();
        bin.extend(TAG_FP32.to_le_bytes());
        bin.extend_from_slice(bytemuck::cast_slice::<f32, u8>(&[0.5, -1.0]));
        bin.extend_from_slice(bytemuck::cast_slice::<f32, u8>(&[0.25, 0.75]));
        load_weights(&mut g, &bin).unwrap();
        let conv = g.op(1);
        assert_eq!(conv.weights.len(), 2);
        assert_eq!(conv.weights[0].storage, Storage::Tagged);
        assert_eq!(conv.weights[0].data.data::<f32>().unwrap(), &[0.5, -1.0]);
        assert_eq!(conv.weights[1].data.data::<f32>().unwrap(), &[0.25, 0.75]);
    }

    #[test]
    fn decodes_fp16_and_int8_payloads() {
        let mut bytes = Vec::new();
        bytes.extend(TAG_FP16.to_le_bytes());
        bytes.extend(f16::from_f32(1.5).to_bits().to_le_bytes());
        bytes.extend([0u8, 0]);
        bytes.extend(TAG_INT8.to_le_bytes());
        bytes.extend([0xffu8, 3, 0, 0]);
        let mut bin = ModelBin::new(&bytes);
        let half = bin
            .load(WeightSpec {
                len: 1,
                storage: Storage::Tagged,
            })
            .unwrap();
        assert_eq!(half.data.data::<f32>().unwrap(), &[1.5]);
        let int8 = bin
            .load(WeightSpec {
                len: 2,
                storage: Storage::Tagged,
            })
            .unwrap();
        assert_eq!(int8.data.elem_type(), Some(ElemType::I8));
        assert_eq!(int8.data.data::<i8>().unwrap(), &[-1, 3]);
        assert_eq!(bin.remaining(), 0);
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let mut g = parse_param(PARAM).unwrap();
        assert!(load_weights(&mut g, &[0, 0, 0, 0, 1]).is_err());
    }
}
