//! Elementwise operators with a float and an int8 execution path.
//!
//! These are the operators whose int8 code paths consume the scales produced by the
//! quantization passes. Kernels parallelize over disjoint channels (or rows) with rayon.
pub mod clip;
pub mod concat;
pub mod quantize;
pub mod slice;
pub mod split;

use std::{
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
    sync::Arc,
};

use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::{
    graph::{Graph, OpId, OpKind},
    overrides::OverrideTable,
    tensor::{Tensor, TensorError},
};
pub use clip::Clip;
pub use concat::Concat;
pub use quantize::Quantize;
pub use slice::Slice;
pub use split::Split;

#[derive(Debug, Clone, PartialEq)]
pub enum LayerError {
    /// An output tensor could not be allocated; nothing was written.
    Allocation { elements: usize },
    ParameterError(String),
    ShapeError(String),
    Tensor(TensorError),
}

impl Display for LayerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            LayerError::Allocation { elements } => {
                write!(f, "failed to allocate an output of {elements} elements")
            }
            LayerError::ParameterError(s) => write!(f, "invalid layer parameters: {s}"),
            LayerError::ShapeError(s) => write!(f, "invalid input shapes: {s}"),
            LayerError::Tensor(e) => write!(f, "{e}"),
        }
    }
}

impl Error for LayerError {}

impl From<TensorError> for LayerError {
    fn from(e: TensorError) -> Self {
        match e {
            TensorError::Allocation { elements } => LayerError::Allocation { elements },
            other => LayerError::Tensor(other),
        }
    }
}

pub type LayerResult<T> = Result<T, LayerError>;

/// Execution options shared by every operator invocation.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Quantize produces int32 instead of int8.
    pub use_int32_storage: bool,
    /// Quantize input is int32 that was already scaled by a previous stage.
    pub use_int_internal: bool,
    pool: Option<Arc<ThreadPool>>,
}

impl Options {
    /// Run kernels on a dedicated pool of `threads` workers (0 keeps rayon's global pool).
    pub fn with_threads(mut self, threads: usize) -> LayerResult<Self> {
        self.pool = if threads == 0 {
            None
        } else {
            let pool = ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .map_err(|e| LayerError::ParameterError(format!("building thread pool: {e}")))?;
            Some(Arc::new(pool))
        };
        Ok(self)
    }

    pub fn with_int32_storage(mut self, enabled: bool) -> Self {
        self.use_int32_storage = enabled;
        self
    }

    pub fn with_int_internal(mut self, enabled: bool) -> Self {
        self.use_int_internal = enabled;
        self
    }

    pub fn threads(&self) -> usize {
        self.pool
            .as_ref()
            .map(|p| p.current_num_threads())
            .unwrap_or_else(rayon::current_num_threads)
    }

    /// Execute `f` on the configured pool.
    pub fn run<R: Send>(&self, f: impl FnOnce() -> R + Send) -> R {
        match &self.pool {
            Some(pool) => pool.install(f),
            None => f(),
        }
    }
}

/// A runtime operator built from a graph node.
#[derive(Debug, Clone, PartialEq)]
pub enum Layer {
    Clip(Clip),
    Concat(Concat),
    Slice(Slice),
    Split(Split),
    Quantize(Quantize),
}

impl Display for Layer {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.describe())
    }
}

impl Layer {
    /// Build the runtime operator for graph node `id`, or `None` if its kind has no
    /// elementwise implementation here.
    pub fn from_operator(
        graph: &Graph,
        id: OpId,
        overrides: &OverrideTable,
    ) -> LayerResult<Option<Self>> {
        let op = graph.op(id);
        let pd = &op.params;
        let layer = match op.kind {
            OpKind::Clip => Layer::Clip(Clip::load_param(pd)?),
            OpKind::Concat => {
                let mut concat = Concat::load_param(pd)?;
                concat.rescale = op
                    .tops
                    .first()
                    .and_then(|top| overrides.concat_rescale(&graph.blob(*top).name));
                Layer::Concat(concat)
            }
            OpKind::Slice => {
                let mut slice = Slice::load_param(pd)?;
                slice.load_model(&op.weights)?;
                Layer::Slice(slice)
            }
            OpKind::Split => {
                let mut split = Split::load_param(pd, op.tops.len())?;
                split.load_model(&op.weights)?;
                Layer::Split(split)
            }
            OpKind::Quantize => Layer::Quantize(Quantize::load_param(pd)),
            _ => return Ok(None),
        };
        Ok(Some(layer))
    }

    pub fn forward(&self, bottoms: &[Tensor], opt: &Options) -> LayerResult<Vec<Tensor>> {
        let single = || {
            bottoms.first().ok_or_else(|| {
                LayerError::ShapeError(format!("{} expects one input", self.describe()))
            })
        };
        match self {
            Layer::Clip(clip) => Ok(vec![clip.forward(single()?, opt)?]),
            Layer::Concat(concat) => Ok(vec![concat.forward(bottoms, opt)?]),
            Layer::Slice(slice) => slice.forward(single()?, opt),
            Layer::Split(split) => split.forward(single()?, opt),
            Layer::Quantize(quantize) => Ok(vec![quantize.forward(single()?, opt)?]),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Layer::Clip(c) => format!("Clip [{}, {}]", c.min, c.max),
            Layer::Concat(c) => format!("Concat axis {}", c.axis),
            Layer::Slice(s) => format!("Slice axis {} {:?}", s.axis, s.slices),
            Layer::Split(s) => format!("Split x{}", s.outputs),
            Layer::Quantize(q) => format!("Quantize scale {}", q.scale),
        }
    }
}
