//! Propagation of activation scales to operator outputs.
//!
//! For every operator that produces int8 data the pass decides which scale its consumers
//! expect. Operators are visited once, in file order. A convolution output usually takes
//! the input scale of the next weighted operator, but residual branches (a Split feeding
//! a convolution and an addition) need two scales, and channel-shuffle blocks need one
//! scale per output channel.
pub mod plan;
pub mod search;
mod shuffle;

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use crate::{
    calibration::CalibrationTable,
    error::QuantizeError,
    graph::{Graph, OpId, OpKind},
};
pub use plan::{OpPlan, ScalePlan, SplitRescale};
pub use search::{first_weighted, Search};

/// Two output scales of an operator whose output reaches a Split feeding one convolution
/// branch and one additive branch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BranchScales {
    #[serde(skip)]
    pub split: OpId,
    /// Split output leading to the convolution.
    pub conv_output: usize,
    pub conv: f32,
    /// Split output leading to the BinaryOp or Padding.
    pub additive_output: usize,
    pub additive: f32,
}

impl BranchScales {
    pub fn max(&self) -> f32 {
        self.conv.max(self.additive)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputScales {
    Uniform(f32),
    Branched(BranchScales),
    PerChannel(Vec<f32>),
}

impl OutputScales {
    /// Scales in serialized order.
    pub fn values(&self) -> Vec<f32> {
        match self {
            OutputScales::Uniform(s) => vec![*s],
            OutputScales::Branched(b) => vec![b.conv, b.additive],
            OutputScales::PerChannel(v) => v.clone(),
        }
    }

    /// Output scale of channel `c` as used for the result scales.
    pub fn for_channel(&self, c: usize) -> Option<f32> {
        match self {
            OutputScales::Uniform(s) => Some(*s),
            OutputScales::Branched(b) => Some(b.max()),
            OutputScales::PerChannel(v) => v.get(c).copied(),
        }
    }
}

/// Output scales of every operator that gets one.
pub type OutputTable = BTreeMap<OpId, OutputScales>;

pub struct ScaleEngine<'a> {
    graph: &'a Graph,
    table: &'a CalibrationTable,
}

impl<'a> ScaleEngine<'a> {
    pub fn new(graph: &'a Graph, table: &'a CalibrationTable) -> Self {
        Self { graph, table }
    }

    pub fn graph(&self) -> &'a Graph {
        self.graph
    }

    pub fn run(&self) -> Result<OutputTable, QuantizeError> {
        let mut outputs = OutputTable::new();
        for id in 0..self.graph.ops().len() {
            let scales = match self.graph.kind(id) {
                OpKind::Input => self.input_scale(id).map(OutputScales::Uniform),
                OpKind::Convolution | OpKind::ConvolutionDepthWise => {
                    Some(self.convolution_scales(id)?)
                }
                // the last fully-connected layer has nothing downstream and gets 1.0
                OpKind::InnerProduct => Some(OutputScales::Uniform(self.downstream_scale(id))),
                _ => None,
            };
            if let Some(scales) = scales {
                debug!(op = %self.graph.name(id), ?scales, "output scales");
                outputs.insert(id, scales);
            }
        }
        Ok(outputs)
    }

    /// Calibrated input scale of operator `id`.
    pub fn activation_scale(&self, id: OpId) -> Option<f32> {
        self.table.activation_scale(self.graph.name(id))
    }

    fn required_activation(&self, id: OpId) -> Result<f32, QuantizeError> {
        let name = self.graph.name(id);
        self.activation_scale(id)
            .ok_or_else(|| QuantizeError::missing(name, name))
    }

    /// Input scale of the next weighted operator after `id`, or 1.0 if there is none or it
    /// is not calibrated.
    pub fn downstream_scale(&self, id: OpId) -> f32 {
        match first_weighted(self.graph, id) {
            Search::Found(next) => self.activation_scale(next).unwrap_or(1.0),
            Search::NotFound => 1.0,
        }
    }

    /// Graph inputs take the calibrated scale of the first convolution reading them.
    fn input_scale(&self, id: OpId) -> Option<f32> {
        self.graph
            .consumers(id, 0)
            .iter()
            .filter(|c| self.graph.kind(**c).is_convolution())
            .find_map(|c| self.activation_scale(*c))
    }

    fn convolution_scales(&self, id: OpId) -> Result<OutputScales, QuantizeError> {
        let consumers = self.graph.consumers(id, 0);
        if consumers.is_empty() {
            return Ok(OutputScales::Uniform(self.downstream_scale(id)));
        }
        let mut decided: Option<OutputScales> = None;
        for consumer in consumers {
            let scales = self.consumer_scales(id, *consumer)?;
            match &decided {
                Some(previous) if *previous != scales => {
                    return Err(QuantizeError::unhandled(
                        self.graph.name(id),
                        format!("consumers disagree on the output scale: {previous:?} vs {scales:?}"),
                    ))
                }
                Some(_) => {}
                None => decided = Some(scales),
            }
        }
        Ok(decided.unwrap_or(OutputScales::Uniform(1.0)))
    }

    fn consumer_scales(&self, id: OpId, consumer: OpId) -> Result<OutputScales, QuantizeError> {
        let graph = self.graph;
        match graph.kind(consumer) {
            OpKind::Split => self.branch_scales(id, consumer),
            OpKind::Concat if self.feeds_shuffle_slice(consumer) => Ok(OutputScales::PerChannel(
                shuffle::channel_scales(self, id, consumer)?,
            )),
            OpKind::BinaryOp => match graph.first_consumer(consumer, 0) {
                Some(split) if graph.kind(split) == OpKind::Split => self.branch_scales(id, split),
                _ => Ok(OutputScales::Uniform(self.downstream_scale(id))),
            },
            _ => Ok(OutputScales::Uniform(self.downstream_scale(id))),
        }
    }

    /// Concat -> ShuffleChannel -> Slice.
    fn feeds_shuffle_slice(&self, concat: OpId) -> bool {
        let graph = self.graph;
        graph
            .first_consumer(concat, 0)
            .filter(|s| graph.kind(*s) == OpKind::ShuffleChannel)
            .and_then(|s| graph.first_consumer(s, 0))
            .is_some_and(|s| graph.kind(s) == OpKind::Slice)
    }

    /// Scales of `id` whose output fans out through `split`.
    fn branch_scales(&self, id: OpId, split: OpId) -> Result<OutputScales, QuantizeError> {
        let graph = self.graph;
        let heads = (0..graph.op(split).tops.len())
            .map(|t| graph.first_consumer(split, t))
            .collect::<Vec<_>>();
        let is_conv = |h: &Option<OpId>| h.is_some_and(|h| graph.kind(h).is_convolution());
        let is_additive = |h: &Option<OpId>| {
            h.is_some_and(|h| matches!(graph.kind(h), OpKind::BinaryOp | OpKind::Padding))
        };

        if !heads.is_empty() && heads.iter().all(is_conv) {
            // every branch is a convolution calibrated on the same data
            let last = heads.iter().rev().flatten().next().copied();
            return match last {
                Some(conv) => Ok(OutputScales::Uniform(self.required_activation(conv)?)),
                None => Err(QuantizeError::unhandled(graph.name(split), "Split without consumers")),
            };
        }
        if let [a, b] = heads.as_slice() {
            let pair = if is_conv(a) && is_additive(b) {
                Some((0, 1))
            } else if is_conv(b) && is_additive(a) {
                Some((1, 0))
            } else {
                None
            };
            if let Some((conv_output, additive_output)) = pair {
                let (Some(conv), Some(additive)) = (heads[conv_output], heads[additive_output])
                else {
                    return Err(QuantizeError::unhandled(graph.name(split), "dangling Split output"));
                };
                return Ok(OutputScales::Branched(BranchScales {
                    split,
                    conv_output,
                    conv: self.required_activation(conv)?,
                    additive_output,
                    additive: self.downstream_scale(additive),
                }));
            }
        }
        let shape = heads
            .iter()
            .map(|h| h.map(|h| graph.kind(h).type_name()).unwrap_or("nothing"))
            .collect::<Vec<_>>();
        Err(QuantizeError::unhandled(
            graph.name(id),
            format!("Split {:?} fans out to {shape:?}", graph.name(split)),
        ))
    }
}

/// Compute the output scales of every operator of `graph`.
pub fn propagate(graph: &Graph, table: &CalibrationTable) -> Result<OutputTable, QuantizeError> {
    ScaleEngine::new(graph, table).run()
}
