use rl_config::LayerType;
use rl_core::{Blob, BlobShape, ExecutionMode};
use rl_kernel_cpu::{dot, mul_in_place, scale_into, smooth_l1_grad_into, smooth_l1_into, sub_into};

use crate::{BackwardReport, Layer, LayerError, check_blob_counts, resolve_propagation};

const LAYER: LayerType = LayerType::SmoothL1Loss;

/// Which optional weight masks accompany `pred` and `target`.
///
/// Fixed at setup from the number of bound inputs (2, 3 or 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightLayout {
    NoWeights,
    InnerWeightOnly,
    InnerAndOuterWeights,
}

impl WeightLayout {
    #[must_use]
    pub const fn from_input_count(count: usize) -> Option<Self> {
        match count {
            2 => Some(Self::NoWeights),
            3 => Some(Self::InnerWeightOnly),
            4 => Some(Self::InnerAndOuterWeights),
            _ => None,
        }
    }

    #[must_use]
    pub const fn input_count(self) -> usize {
        match self {
            Self::NoWeights => 2,
            Self::InnerWeightOnly => 3,
            Self::InnerAndOuterWeights => 4,
        }
    }

    #[must_use]
    pub const fn has_weights(self) -> bool {
        !matches!(self, Self::NoWeights)
    }
}

/// Weight masks bound for one call, carrying exactly the blobs the layout needs.
#[derive(Debug, Clone, Copy)]
pub enum LossWeights<'a> {
    NoWeights,
    InnerWeightOnly { inner: &'a Blob },
    InnerAndOuterWeights { inner: &'a Blob, outer: &'a Blob },
}

impl<'a> LossWeights<'a> {
    /// Interprets the blobs after `pred` and `target` as weight masks.
    pub fn from_blobs(blobs: &'a [Blob]) -> Result<Self, LayerError> {
        match blobs {
            [] => Ok(Self::NoWeights),
            [inner] => Ok(Self::InnerWeightOnly { inner }),
            [inner, outer] => Ok(Self::InnerAndOuterWeights { inner, outer }),
            _ => Err(LayerError::BottomCount {
                layer: LAYER,
                min: 2,
                max: 4,
                actual: blobs.len() + 2,
            }),
        }
    }

    #[must_use]
    pub fn layout(&self) -> WeightLayout {
        match self {
            Self::NoWeights => WeightLayout::NoWeights,
            Self::InnerWeightOnly { .. } => WeightLayout::InnerWeightOnly,
            Self::InnerAndOuterWeights { .. } => WeightLayout::InnerAndOuterWeights,
        }
    }

    #[must_use]
    pub fn inner(&self) -> Option<&'a Blob> {
        match *self {
            Self::NoWeights => None,
            Self::InnerWeightOnly { inner } | Self::InnerAndOuterWeights { inner, .. } => {
                Some(inner)
            }
        }
    }

    #[must_use]
    pub fn outer(&self) -> Option<&'a Blob> {
        match *self {
            Self::InnerAndOuterWeights { outer, .. } => Some(outer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SmoothL1Inputs<'a> {
    pub pred: &'a Blob,
    pub target: &'a Blob,
    pub weights: LossWeights<'a>,
}

impl<'a> SmoothL1Inputs<'a> {
    pub fn from_bottom(bottom: &'a [Blob]) -> Result<Self, LayerError> {
        match bottom {
            [pred, target, weights @ ..] => Ok(Self {
                pred,
                target,
                weights: LossWeights::from_blobs(weights)?,
            }),
            _ => Err(LayerError::BottomCount {
                layer: LAYER,
                min: 2,
                max: 4,
                actual: bottom.len(),
            }),
        }
    }
}

/// Smooth L1 (Huber-style) regression loss with optional inside/outside
/// weight masks, normalized by the batch size of `pred`.
///
/// Forward keeps the inner-weighted residual `w_in * (pred - target)` in
/// `residual.data`; backward writes the kernel derivative into
/// `residual.diff` and never reads `pred` or `target` again.
#[derive(Debug, Clone)]
pub struct SmoothL1LossLayer {
    sigma: f64,
    sigma2: f64,
    layout: Option<WeightLayout>,
    residual: Blob,
    errors: Blob,
    ones: Blob,
    forward_done: bool,
}

impl SmoothL1LossLayer {
    pub fn new(sigma: f64) -> Result<Self, LayerError> {
        if !sigma.is_finite() || sigma <= 0.0 {
            return Err(LayerError::InvalidSigma { sigma });
        }
        Ok(Self {
            sigma,
            sigma2: sigma * sigma,
            layout: None,
            residual: Blob::new(BlobShape::scalar()),
            errors: Blob::new(BlobShape::scalar()),
            ones: Blob::filled(BlobShape::scalar(), 1.0),
            forward_done: false,
        })
    }

    #[must_use]
    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    #[must_use]
    pub fn sigma2(&self) -> f64 {
        self.sigma2
    }

    #[must_use]
    pub fn weight_layout(&self) -> Option<WeightLayout> {
        self.layout
    }

    #[must_use]
    pub fn has_weights(&self) -> bool {
        self.layout.is_some_and(WeightLayout::has_weights)
    }

    #[must_use]
    pub fn residual(&self) -> &Blob {
        &self.residual
    }

    #[must_use]
    pub fn errors(&self) -> &Blob {
        &self.errors
    }

    /// Fixes the weight layout from the bound input count. Calling it again
    /// with a different count is refused.
    pub fn configure(&mut self, input_count: usize) -> Result<(), LayerError> {
        let layout =
            WeightLayout::from_input_count(input_count).ok_or(LayerError::BottomCount {
                layer: LAYER,
                min: 2,
                max: 4,
                actual: input_count,
            })?;
        match self.layout {
            Some(expected) if expected != layout => {
                return Err(LayerError::WeightLayoutMismatch {
                    expected,
                    actual: layout,
                });
            }
            _ => {}
        }
        self.layout = Some(layout);
        Ok(())
    }

    /// Checks per-input geometry and resizes scratch state and the scalar output.
    /// A zero batch is refused since the loss is normalized by it.
    pub fn prepare(
        &mut self,
        inputs: &SmoothL1Inputs<'_>,
        top: &mut Blob,
    ) -> Result<(), LayerError> {
        self.ensure_layout(&inputs.weights)?;

        let expected = inputs.pred.shape();
        if inputs.pred.num() == 0 {
            return Err(LayerError::EmptyBatch {
                layer: LAYER,
                input: "pred",
            });
        }
        ensure_geometry("target", expected, inputs.target)?;
        if let Some(inner) = inputs.weights.inner() {
            ensure_geometry("inner_weight", expected, inner)?;
        }
        if let Some(outer) = inputs.weights.outer() {
            ensure_geometry("outer_weight", expected, outer)?;
        }

        self.residual.reshape(expected.clone());
        self.errors.reshape(expected.clone());
        self.ones.reshape(expected.clone());
        self.ones.fill_data(1.0);
        top.reshape(BlobShape::scalar());
        self.forward_done = false;
        Ok(())
    }

    /// Writes `sum(errors) / pred.num` into `top` and returns it.
    pub fn compute_loss(
        &mut self,
        inputs: &SmoothL1Inputs<'_>,
        top: &mut Blob,
    ) -> Result<f64, LayerError> {
        self.ensure_layout(&inputs.weights)?;
        self.forward_done = false;

        sub_into(
            inputs.pred.data(),
            inputs.target.data(),
            self.residual.data_mut(),
        )?;
        if let Some(inner) = inputs.weights.inner() {
            mul_in_place(self.residual.data_mut(), inner.data())?;
        }

        smooth_l1_into(self.residual.data(), self.sigma2, self.errors.data_mut())?;
        if let Some(outer) = inputs.weights.outer() {
            mul_in_place(self.errors.data_mut(), outer.data())?;
        }

        let total = dot(self.ones.data(), self.errors.data())?;
        let loss = total / inputs.pred.num() as f64;
        top.set_data(vec![loss])?;
        self.forward_done = true;
        Ok(loss)
    }

    /// Writes gradients for `pred` (index 0) and `target` (index 1) given the
    /// upstream scalar gradient. Buffers are overwritten, not accumulated.
    pub fn compute_gradients(
        &mut self,
        upstream: f64,
        propagate_down: &[bool],
        pred: &mut Blob,
        target: &mut Blob,
        weights: &LossWeights<'_>,
        mode: ExecutionMode,
    ) -> Result<BackwardReport, LayerError> {
        self.ensure_layout(weights)?;
        if !self.forward_done {
            return Err(LayerError::BackwardBeforeForward { layer: LAYER });
        }
        let (propagated, skipped) =
            resolve_propagation(&*self, propagate_down, weights.layout().input_count(), mode)?;

        let (residual, derivative) = self.residual.data_and_diff_mut();
        smooth_l1_grad_into(residual, self.sigma2, derivative)?;

        for index in &propagated {
            match *index {
                0 => self.write_input_gradient(1.0, upstream, pred, weights)?,
                1 => self.write_input_gradient(-1.0, upstream, target, weights)?,
                _ => {}
            }
        }

        Ok(BackwardReport {
            layer: LAYER,
            propagated,
            skipped,
            rule: "d/dpred=+g*f'(r)*w_in*w_out/num; d/dtarget=-g*f'(r)*w_in*w_out/num",
        })
    }

    fn write_input_gradient(
        &self,
        sign: f64,
        upstream: f64,
        input: &mut Blob,
        weights: &LossWeights<'_>,
    ) -> Result<(), LayerError> {
        let alpha = sign * upstream / input.num() as f64;
        scale_into(alpha, self.residual.diff(), input.diff_mut())?;
        if let Some(inner) = weights.inner() {
            mul_in_place(input.diff_mut(), inner.data())?;
        }
        if let Some(outer) = weights.outer() {
            mul_in_place(input.diff_mut(), outer.data())?;
        }
        Ok(())
    }

    fn ensure_layout(&self, weights: &LossWeights<'_>) -> Result<(), LayerError> {
        let expected = self.layout.ok_or(LayerError::NotSetUp { layer: LAYER })?;
        let actual = weights.layout();
        if expected != actual {
            return Err(LayerError::WeightLayoutMismatch { expected, actual });
        }
        Ok(())
    }
}

fn ensure_geometry(
    input: &'static str,
    expected: &BlobShape,
    blob: &Blob,
) -> Result<(), LayerError> {
    if !expected.same_geometry(blob.shape()) {
        return Err(LayerError::ShapeMismatch {
            layer: LAYER,
            input,
            expected: expected.clone(),
            actual: blob.shape().clone(),
        });
    }
    Ok(())
}

impl Layer for SmoothL1LossLayer {
    fn layer_type(&self) -> LayerType {
        LAYER
    }

    fn min_bottom_blobs(&self) -> usize {
        2
    }

    fn max_bottom_blobs(&self) -> usize {
        4
    }

    fn allow_backward(&self, bottom_index: usize) -> bool {
        bottom_index < 2
    }

    fn setup(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<(), LayerError> {
        check_blob_counts(&*self, bottom.len(), top.len())?;
        self.configure(bottom.len())
    }

    fn reshape(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<(), LayerError> {
        check_blob_counts(&*self, bottom.len(), top.len())?;
        let inputs = SmoothL1Inputs::from_bottom(bottom)?;
        self.prepare(&inputs, &mut top[0])
    }

    fn forward(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<(), LayerError> {
        check_blob_counts(&*self, bottom.len(), top.len())?;
        let inputs = SmoothL1Inputs::from_bottom(bottom)?;
        self.compute_loss(&inputs, &mut top[0]).map(|_| ())
    }

    fn backward(
        &mut self,
        top: &[Blob],
        propagate_down: &[bool],
        bottom: &mut [Blob],
        mode: ExecutionMode,
    ) -> Result<BackwardReport, LayerError> {
        check_blob_counts(&*self, bottom.len(), top.len())?;
        let upstream = top[0].diff().first().copied().unwrap_or(0.0);

        let (primary, rest) = bottom.split_at_mut(2);
        let (pred, target) = primary.split_at_mut(1);
        let weights = LossWeights::from_blobs(rest)?;
        self.compute_gradients(
            upstream,
            propagate_down,
            &mut pred[0],
            &mut target[0],
            &weights,
            mode,
        )
    }
}
