//! In-memory network: a flat operator list and the named slots connecting them.
//!
//! Operators and slots live in two dense vectors and refer to each other by index, so
//! the producer/consumer adjacency never forms ownership cycles.
pub mod kind;
pub mod loader;
pub mod param;

use std::collections::HashMap;

use anyhow::{bail, ensure};
use serde::Serialize;

use crate::tensor::Tensor;
pub use kind::{keys, OpKind, Storage, WeightSpec};
pub use param::{ParamDict, ParamValue};

pub type OpId = usize;
pub type BlobId = usize;

/// How much of an operator has been converted to integer arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Int8ScaleTerm {
    None = 0,
    Weight = 1,
    WeightAndBias = 2,
}

impl From<i32> for Int8ScaleTerm {
    fn from(v: i32) -> Self {
        match v {
            0 => Int8ScaleTerm::None,
            1 => Int8ScaleTerm::Weight,
            _ => Int8ScaleTerm::WeightAndBias,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Weight {
    pub data: Tensor,
    pub storage: Storage,
}

impl Weight {
    pub fn new(data: Tensor, storage: Storage) -> Self {
        Self { data, storage }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Operator {
    pub kind: OpKind,
    pub name: String,
    pub bottoms: Vec<BlobId>,
    pub tops: Vec<BlobId>,
    pub params: ParamDict,
    pub weights: Vec<Weight>,
}

impl Operator {
    pub fn int8_scale_term(&self) -> Int8ScaleTerm {
        if self.kind.has_quantizable_weights() {
            self.params.get_int(keys::INT8, 0).into()
        } else {
            Int8ScaleTerm::None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub name: String,
    /// `None` for graph inputs.
    pub producer: Option<OpId>,
    /// Readers of the slot, in file order. `ncnnfused` placeholders are not listed.
    pub consumers: Vec<OpId>,
}

#[derive(Debug, Clone, Default)]
pub struct Graph {
    ops: Vec<Operator>,
    blobs: Vec<Blob>,
    op_index: HashMap<String, OpId>,
    blob_index: HashMap<String, BlobId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an operator. Bottom slots are looked up by name (and created as graph
    /// inputs if unknown); top slots are created and owned by the new operator.
    pub fn add_operator(
        &mut self,
        kind: OpKind,
        name: &str,
        bottoms: &[&str],
        tops: &[&str],
        params: ParamDict,
    ) -> anyhow::Result<OpId> {
        ensure!(
            !self.op_index.contains_key(name),
            "duplicate operator name {name:?}"
        );
        let id = self.ops.len();
        let mut bottom_ids = Vec::with_capacity(bottoms.len());
        for bottom in bottoms {
            let blob = self.blob_or_input(bottom);
            if kind != OpKind::Fused {
                self.blobs[blob].consumers.push(id);
            }
            bottom_ids.push(blob);
        }
        let mut top_ids = Vec::with_capacity(tops.len());
        for top in tops {
            let blob = self.blob_or_input(top);
            if let Some(producer) = self.blobs[blob].producer {
                bail!(
                    "slot {top:?} is produced by both {:?} and {name:?}",
                    self.ops[producer].name
                );
            }
            self.blobs[blob].producer = Some(id);
            top_ids.push(blob);
        }
        self.ops.push(Operator {
            kind,
            name: name.to_string(),
            bottoms: bottom_ids,
            tops: top_ids,
            params,
            weights: Vec::new(),
        });
        self.op_index.insert(name.to_string(), id);
        Ok(id)
    }

    fn blob_or_input(&mut self, name: &str) -> BlobId {
        if let Some(id) = self.blob_index.get(name) {
            return *id;
        }
        let id = self.blobs.len();
        self.blobs.push(Blob {
            name: name.to_string(),
            producer: None,
            consumers: Vec::new(),
        });
        self.blob_index.insert(name.to_string(), id);
        id
    }

    pub fn ops(&self) -> &[Operator] {
        &self.ops
    }

    pub fn op(&self, id: OpId) -> &Operator {
        &self.ops[id]
    }

    pub fn op_mut(&mut self, id: OpId) -> &mut Operator {
        &mut self.ops[id]
    }

    pub fn blobs(&self) -> &[Blob] {
        &self.blobs
    }

    pub fn blob(&self, id: BlobId) -> &Blob {
        &self.blobs[id]
    }

    pub fn find_op(&self, name: &str) -> Option<OpId> {
        self.op_index.get(name).copied()
    }

    pub fn find_blob(&self, name: &str) -> Option<BlobId> {
        self.blob_index.get(name).copied()
    }

    /// Consumers of the `top`-th output of `op`; empty if the output does not exist.
    pub fn consumers(&self, op: OpId, top: usize) -> &[OpId] {
        self.ops[op]
            .tops
            .get(top)
            .map(|b| self.blobs[*b].consumers.as_slice())
            .unwrap_or_default()
    }

    pub fn first_consumer(&self, op: OpId, top: usize) -> Option<OpId> {
        self.consumers(op, top).first().copied()
    }

    /// Producer of the `bottom`-th input of `op`.
    pub fn producer_of_input(&self, op: OpId, bottom: usize) -> Option<OpId> {
        self.ops[op]
            .bottoms
            .get(bottom)
            .and_then(|b| self.blobs[*b].producer)
    }

    pub fn kind(&self, op: OpId) -> OpKind {
        self.ops[op].kind
    }

    pub fn name(&self, op: OpId) -> &str {
        &self.ops[op].name
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn records_producers_and_consumers() {
        let mut g = Graph::new();
        let input = g
            .add_operator(OpKind::Input, "data", &[], &["data"], ParamDict::new())
            .unwrap();
        let split = g
            .add_operator(OpKind::Split, "split", &["data"], &["a", "b"], ParamDict::new())
            .unwrap();
        let relu = g
            .add_operator(OpKind::Relu, "relu", &["b"], &["out"], ParamDict::new())
            .unwrap();
        assert_eq!(g.consumers(input, 0), &[split]);
        assert_eq!(g.first_consumer(split, 1), Some(relu));
        assert_eq!(g.first_consumer(split, 0), None);
        assert_eq!(g.first_consumer(split, 5), None);
        assert_eq!(g.producer_of_input(relu, 0), Some(split));
        assert_eq!(g.blobs().len(), 4);
        assert_eq!(g.find_op("relu"), Some(relu));
    }

    #[test]
    fn fused_placeholders_do_not_consume() {
        let mut g = Graph::new();
        let conv = g
            .add_operator(OpKind::Convolution, "conv", &[], &["c"], ParamDict::new())
            .unwrap();
        g.add_operator(OpKind::Fused, "fused", &["c"], &["f"], ParamDict::new())
            .unwrap();
        let bn = g
            .add_operator(OpKind::BatchNorm, "bn", &["c"], &["b"], ParamDict::new())
            .unwrap();
        assert_eq!(g.consumers(conv, 0), &[bn]);
        assert_eq!(g.first_consumer(conv, 0), Some(bn));
        assert_eq!(g.blobs().len(), 3);
    }

    #[test]
    fn rejects_second_producer_and_duplicate_names() {
        let mut g = Graph::new();
        g.add_operator(OpKind::Input, "data", &[], &["data"], ParamDict::new())
            .unwrap();
        assert!(g
            .add_operator(OpKind::Input, "other", &[], &["data"], ParamDict::new())
            .is_err());
        assert!(g
            .add_operator(OpKind::Relu, "data", &["data"], &["x"], ParamDict::new())
            .is_err());
    }
}
