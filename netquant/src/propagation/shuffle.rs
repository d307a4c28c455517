//! Per-channel output scales through Concat -> ShuffleChannel -> Slice chains.
//!
//! Two convolutions are concatenated, their channels interleaved by ShuffleChannel and
//! split in halves again by Slice, possibly several times in a row. Every channel of the
//! producing convolution ends up feeding a different consumer, so it gets its own scale.
//! The walk tracks, for every position of the shuffled tensor, which original channel it
//! holds.
use std::collections::HashSet;

use tracing::{debug, warn};

use super::ScaleEngine;
use crate::{
    error::QuantizeError,
    graph::{keys, OpId, OpKind},
};

/// Scales of the `num_output` channels `conv` contributes to `concat`.
pub(crate) fn channel_scales(
    engine: &ScaleEngine<'_>,
    conv: OpId,
    concat: OpId,
) -> Result<Vec<f32>, QuantizeError> {
    let graph = engine.graph();
    let name = graph.name(conv);
    let oc = graph
        .op(conv)
        .params
        .get_usize(keys::NUM_OUTPUT, 0)
        .map_err(|e| QuantizeError::unhandled(name, e.to_string()))?;
    if oc == 0 {
        return Err(QuantizeError::unhandled(name, "convolution without outputs"));
    }
    let size = 2 * oc;
    // the second Concat input holds the right half of the shuffled channels
    let left = graph.op(concat).bottoms.len() != 2 || graph.producer_of_input(concat, 1) != Some(conv);

    let mut scales: Vec<Option<f32>> = vec![None; size];
    let mut status = (0..size).collect::<Vec<_>>();
    let mut visited = HashSet::new();
    let mut seen = HashSet::new();
    let mut cursor = Some(conv);
    while let Some(id) = cursor {
        if visited.len() >= oc || !seen.insert(id) {
            break;
        }
        if graph.kind(id) != OpKind::ShuffleChannel {
            cursor = graph
                .op(id)
                .tops
                .len()
                .checked_sub(1)
                .and_then(|last| graph.first_consumer(id, last));
            continue;
        }

        let half = status.len() / 2;
        let mut shuffled = vec![0; status.len()];
        for i in 0..2 {
            for j in 0..half {
                shuffled[2 * j + i] = status[half * i + j];
            }
        }
        let next = graph.first_consumer(id, 0);
        match next.map(|n| graph.kind(n)) {
            Some(OpKind::Slice) => {
                let scale = engine.downstream_scale(id);
                for origin in shuffled[half..].iter().rev() {
                    let ours = if left { *origin < half } else { *origin >= half };
                    if ours && visited.insert(*origin) {
                        scales[*origin] = Some(scale);
                    }
                }
                status = shuffled;
                cursor = next;
            }
            Some(OpKind::Split) => {
                let scale = engine.downstream_scale(id);
                for origin in &status {
                    if visited.insert(*origin) {
                        scales[*origin] = Some(scale);
                    }
                }
                break;
            }
            Some(kind) if kind.has_quantizable_weights() => {
                let scale = next
                    .and_then(|n| engine.activation_scale(n))
                    .unwrap_or(1.0);
                for (i, slot) in scales.iter_mut().enumerate() {
                    if !visited.contains(&i) {
                        *slot = Some(scale);
                    }
                }
                break;
            }
            other => {
                warn!(
                    op = %graph.name(id),
                    "channel shuffle followed by {other:?}, remaining channels keep the default scale"
                );
                break;
            }
        }
    }

    let fallback = engine.downstream_scale(conv);
    let range = if left { 0..oc } else { oc..size };
    let result = scales[range]
        .iter()
        .map(|s| s.unwrap_or(fallback))
        .collect::<Vec<_>>();
    debug!(op = %name, left, scales = ?result, "per-channel output scales");
    Ok(result)
}
