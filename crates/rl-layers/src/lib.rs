#![forbid(unsafe_code)]

mod round;
mod smooth_l1;

use std::fmt;

use rl_config::{LayerParam, LayerType};
use rl_core::{Blob, BlobError, BlobShape, ExecutionMode};
use rl_kernel_cpu::KernelError;

pub use round::RoundLayer;
pub use smooth_l1::{LossWeights, SmoothL1Inputs, SmoothL1LossLayer, WeightLayout};

/// A numeric layer driven through setup, reshape, forward and backward.
///
/// `setup` runs once with the first bound blobs and fixes anything derived
/// from the number of inputs. `reshape` runs whenever input shapes may have
/// changed and resizes outputs and scratch state. `backward` consumes the
/// state left by the immediately preceding `forward`.
pub trait Layer: fmt::Debug {
    fn layer_type(&self) -> LayerType;

    fn min_bottom_blobs(&self) -> usize;

    fn max_bottom_blobs(&self) -> usize;

    fn exact_num_top_blobs(&self) -> usize {
        1
    }

    /// Whether gradients can flow to the bottom blob at `bottom_index`.
    fn allow_backward(&self, bottom_index: usize) -> bool;

    fn setup(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<(), LayerError>;

    fn reshape(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<(), LayerError>;

    fn forward(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<(), LayerError>;

    fn backward(
        &mut self,
        top: &[Blob],
        propagate_down: &[bool],
        bottom: &mut [Blob],
        mode: ExecutionMode,
    ) -> Result<BackwardReport, LayerError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackwardReport {
    pub layer: LayerType,
    /// Bottom indices whose gradient buffers were written.
    pub propagated: Vec<usize>,
    /// Bottom indices that requested a gradient but cannot receive one.
    pub skipped: Vec<usize>,
    pub rule: &'static str,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LayerError {
    BottomCount {
        layer: LayerType,
        min: usize,
        max: usize,
        actual: usize,
    },
    TopCount {
        layer: LayerType,
        expected: usize,
        actual: usize,
    },
    ShapeMismatch {
        layer: LayerType,
        input: &'static str,
        expected: BlobShape,
        actual: BlobShape,
    },
    EmptyBatch {
        layer: LayerType,
        input: &'static str,
    },
    InvalidSigma {
        sigma: f64,
    },
    WeightLayoutMismatch {
        expected: WeightLayout,
        actual: WeightLayout,
    },
    PropagateMaskLength {
        expected: usize,
        actual: usize,
    },
    NonDifferentiableInput {
        layer: LayerType,
        index: usize,
    },
    NotSetUp {
        layer: LayerType,
    },
    BackwardBeforeForward {
        layer: LayerType,
    },
    Blob(BlobError),
    Kernel(KernelError),
}

impl fmt::Display for LayerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BottomCount {
                layer,
                min,
                max,
                actual,
            } => write!(
                f,
                "{layer} expects between {min} and {max} bottom blobs, got {actual}"
            ),
            Self::TopCount {
                layer,
                expected,
                actual,
            } => write!(f, "{layer} expects {expected} top blobs, got {actual}"),
            Self::ShapeMismatch {
                layer,
                input,
                expected,
                actual,
            } => write!(
                f,
                "{layer} shape mismatch on {input}: expected geometry of {expected}, got {actual}"
            ),
            Self::EmptyBatch { layer, input } => {
                write!(f, "{layer} cannot normalize by an empty batch on {input}")
            }
            Self::InvalidSigma { sigma } => {
                write!(f, "sigma must be finite and > 0, got {sigma}")
            }
            Self::WeightLayoutMismatch { expected, actual } => write!(
                f,
                "weight layout mismatch: configured {expected:?}, bound {actual:?}"
            ),
            Self::PropagateMaskLength { expected, actual } => write!(
                f,
                "propagate_down mask length mismatch: expected={expected}, actual={actual}"
            ),
            Self::NonDifferentiableInput { layer, index } => {
                write!(f, "{layer} cannot propagate a gradient to bottom {index}")
            }
            Self::NotSetUp { layer } => write!(f, "{layer} used before setup"),
            Self::BackwardBeforeForward { layer } => {
                write!(f, "{layer} backward requested without a preceding forward")
            }
            Self::Blob(error) => write!(f, "blob failure: {error}"),
            Self::Kernel(error) => write!(f, "kernel failure: {error}"),
        }
    }
}

impl std::error::Error for LayerError {}

impl From<KernelError> for LayerError {
    fn from(value: KernelError) -> Self {
        Self::Kernel(value)
    }
}

impl From<BlobError> for LayerError {
    fn from(value: BlobError) -> Self {
        Self::Blob(value)
    }
}

/// Builds a layer from its parameter block, keyed by layer type.
pub fn build_layer(param: &LayerParam) -> Result<Box<dyn Layer>, LayerError> {
    match param.layer_type {
        LayerType::SmoothL1Loss => {
            let sigma = param.smooth_l1_param().sigma;
            Ok(Box::new(SmoothL1LossLayer::new(sigma)?))
        }
        LayerType::Round => Ok(Box::new(RoundLayer::new())),
    }
}

pub(crate) fn check_blob_counts(
    layer: &dyn Layer,
    bottom: usize,
    top: usize,
) -> Result<(), LayerError> {
    let (min, max) = (layer.min_bottom_blobs(), layer.max_bottom_blobs());
    if bottom < min || bottom > max {
        return Err(LayerError::BottomCount {
            layer: layer.layer_type(),
            min,
            max,
            actual: bottom,
        });
    }
    let expected = layer.exact_num_top_blobs();
    if top != expected {
        return Err(LayerError::TopCount {
            layer: layer.layer_type(),
            expected,
            actual: top,
        });
    }
    Ok(())
}

/// Splits a propagate_down mask into the indices that will receive a
/// gradient and the ones that cannot. Strict mode refuses the latter.
pub(crate) fn resolve_propagation(
    layer: &dyn Layer,
    propagate_down: &[bool],
    bottom_count: usize,
    mode: ExecutionMode,
) -> Result<(Vec<usize>, Vec<usize>), LayerError> {
    if propagate_down.len() != bottom_count {
        return Err(LayerError::PropagateMaskLength {
            expected: bottom_count,
            actual: propagate_down.len(),
        });
    }

    let mut propagated = Vec::new();
    let mut skipped = Vec::new();
    for (index, requested) in propagate_down.iter().copied().enumerate() {
        if !requested {
            continue;
        }
        if layer.allow_backward(index) {
            propagated.push(index);
            continue;
        }
        match mode {
            ExecutionMode::Strict => {
                return Err(LayerError::NonDifferentiableInput {
                    layer: layer.layer_type(),
                    index,
                });
            }
            ExecutionMode::Hardened => skipped.push(index),
        }
    }
    Ok((propagated, skipped))
}
