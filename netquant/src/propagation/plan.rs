//! Everything the serializer needs to know about scales, computed once before any weight
//! is touched.
use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, warn};

use super::{propagate, OutputScales};
use crate::{
    calibration::{weight_key, CalibrationTable},
    error::QuantizeError,
    graph::{kind::output_channels, Graph, OpId, OpKind},
    layers::{split::SplitFactor, LayerError},
    quantization::FixedPoint,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpPlan {
    pub name: String,
    pub kind: OpKind,
    pub output: OutputScales,
    pub output_fixed: FixedPoint,
    /// Calibrated input scale, for operators whose weights get quantized.
    pub input: Option<f32>,
    /// Per-channel weight scales, truncated to the channel count.
    #[serde(skip)]
    pub weight_scales: Vec<f32>,
    /// `output / (weight * input)` per channel; the output scale itself for graph inputs.
    pub result: Vec<f32>,
    pub result_fixed: Option<FixedPoint>,
}

impl OpPlan {
    pub fn is_quantized(&self) -> bool {
        self.result_fixed.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SplitRescale {
    pub split: String,
    pub ratio: f32,
    pub factor: SplitFactor,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScalePlan {
    pub ops: BTreeMap<OpId, OpPlan>,
    pub splits: BTreeMap<OpId, SplitRescale>,
    /// Input scale encodings handed to Clip operators.
    pub clips: BTreeMap<OpId, Vec<i32>>,
}

impl ScalePlan {
    pub fn build(graph: &Graph, table: &CalibrationTable) -> Result<Self, QuantizeError> {
        let outputs = propagate(graph, table)?;
        let mut plan = ScalePlan::default();
        for (id, output) in outputs {
            let op_plan = plan_operator(graph, table, id, output)?;
            plan.ops.insert(id, op_plan);
        }
        plan.plan_splits(graph)?;
        plan.plan_clips(graph);
        debug!(
            ops = plan.ops.len(),
            splits = plan.splits.len(),
            clips = plan.clips.len(),
            "scale plan ready"
        );
        Ok(plan)
    }

    /// The branch with the smaller scale is rescaled by `small / large`, since the producer
    /// is quantized with the larger one.
    fn plan_splits(&mut self, graph: &Graph) -> Result<(), QuantizeError> {
        for op in self.ops.values() {
            let OutputScales::Branched(b) = &op.output else {
                continue;
            };
            if b.conv == b.additive {
                continue;
            }
            let (output, ratio) = if b.conv < b.additive {
                (b.conv_output, b.conv / b.additive)
            } else {
                (b.additive_output, b.additive / b.conv)
            };
            let fixed = encode(&op.name, &[ratio])?;
            let factor = SplitFactor {
                output,
                mantissa: fixed.mantissas[0],
                exponent: fixed.exponent,
            };
            let split = graph.name(b.split).to_string();
            debug!(%split, ratio, ?factor, "split rescale");
            if let Some(previous) = self.splits.insert(
                b.split,
                SplitRescale {
                    split,
                    ratio,
                    factor,
                },
            ) {
                if previous.factor != factor {
                    warn!(split = %previous.split, "conflicting split rescales, keeping the last");
                }
            }
        }
        Ok(())
    }

    fn plan_clips(&mut self, graph: &Graph) {
        for id in 0..graph.ops().len() {
            if graph.kind(id) != OpKind::Clip {
                continue;
            }
            let Some(producer) = graph.producer_of_input(id, 0) else {
                continue;
            };
            if let Some(op) = self.ops.get(&producer) {
                let ints = op.output_fixed.to_ints();
                if matches!(ints.len(), 2 | 3) {
                    self.clips.insert(id, ints);
                }
            }
        }
    }

    pub fn op(&self, id: OpId) -> Option<&OpPlan> {
        self.ops.get(&id)
    }

    pub fn split_factor(&self, id: OpId) -> Option<SplitFactor> {
        self.splits.get(&id).map(|s| s.factor)
    }

    pub fn clip_scales(&self, id: OpId) -> Option<&[i32]> {
        self.clips.get(&id).map(Vec::as_slice)
    }

    pub fn quantized(&self) -> impl Iterator<Item = (OpId, &OpPlan)> {
        self.ops
            .iter()
            .filter(|(_, p)| p.is_quantized())
            .map(|(id, p)| (*id, p))
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

fn encode(op: &str, scales: &[f32]) -> Result<FixedPoint, QuantizeError> {
    FixedPoint::encode(scales).ok_or_else(|| {
        QuantizeError::layer(
            op,
            LayerError::ParameterError(format!("scales {scales:?} cannot be encoded")),
        )
    })
}

fn plan_operator(
    graph: &Graph,
    table: &CalibrationTable,
    id: OpId,
    output: OutputScales,
) -> Result<OpPlan, QuantizeError> {
    let op = graph.op(id);
    let name = op.name.as_str();
    let output_fixed = encode(name, &output.values())?;
    let mut plan = OpPlan {
        name: name.to_string(),
        kind: op.kind,
        output,
        output_fixed,
        input: None,
        weight_scales: Vec::new(),
        result: Vec::new(),
        result_fixed: None,
    };

    if op.kind == OpKind::Input {
        plan.result = plan.output.values()[..1].to_vec();
    } else if op.kind.has_quantizable_weights() {
        let Some(input) = table.activation_scale(name) else {
            debug!(op = %name, "not calibrated, kept in float");
            return Ok(plan);
        };
        let channels = output_channels(op.kind, &op.params)
            .map_err(|e| QuantizeError::layer(name, LayerError::ParameterError(e.to_string())))?;
        let weights = table
            .weight(name)
            .ok_or_else(|| QuantizeError::missing(name, weight_key(name)))?;
        if weights.len() < channels {
            return Err(QuantizeError::missing(
                name,
                format!(
                    "{} ({} of {channels} channel scales)",
                    weight_key(name),
                    weights.len()
                ),
            ));
        }
        if weights.len() > channels {
            warn!(
                op = %name,
                "calibration holds {} weight scales for {channels} channels, ignoring the rest",
                weights.len()
            );
        }
        let weights = &weights[..channels];
        plan.result = weights
            .iter()
            .enumerate()
            .map(|(c, w)| {
                plan.output
                    .for_channel(c)
                    .map(|out| out / (w * input))
                    .ok_or_else(|| {
                        QuantizeError::unhandled(
                            name,
                            format!("no output scale for channel {c} of {channels}"),
                        )
                    })
            })
            .collect::<Result<_, _>>()?;
        plan.input = Some(input);
        plan.weight_scales = weights.to_vec();
    } else {
        return Ok(plan);
    }
    plan.result_fixed = Some(encode(name, &plan.result)?);
    Ok(plan)
}
