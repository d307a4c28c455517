//! Forward search for the next operator with calibrated weights.
use std::collections::HashSet;

use crate::graph::{Graph, OpId, OpKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Search {
    Found(OpId),
    /// The walk reached a graph output (or looped) without meeting a weighted operator.
    NotFound,
}

impl Search {
    pub fn found(self) -> Option<OpId> {
        match self {
            Search::Found(id) => Some(id),
            Search::NotFound => None,
        }
    }
}

/// The operator scales propagate to from `id`: the first consumer of the second output
/// for Slice and Split, of the first output otherwise.
pub fn successor(graph: &Graph, id: OpId) -> Option<OpId> {
    let op = graph.op(id);
    let top = match op.kind {
        OpKind::Slice | OpKind::Split if op.tops.len() > 1 => 1,
        _ => 0,
    };
    graph.first_consumer(id, top)
}

/// First Convolution, ConvolutionDepthWise or InnerProduct strictly after `start`.
pub fn first_weighted(graph: &Graph, start: OpId) -> Search {
    let mut visited = HashSet::from([start]);
    let mut worklist = vec![start];
    while let Some(id) = worklist.pop() {
        let Some(next) = successor(graph, id) else {
            continue;
        };
        if graph.kind(next).has_quantizable_weights() {
            return Search::Found(next);
        }
        if visited.insert(next) {
            worklist.push(next);
        }
    }
    Search::NotFound
}
