use rl_config::LayerType;
use rl_core::{Blob, ExecutionMode};
use rl_kernel_cpu::{round_in_place, round_into};

use crate::{BackwardReport, Layer, LayerError, check_blob_counts, resolve_propagation};

const LAYER: LayerType = LayerType::Round;

/// Element-wise rounding to the nearest integer, ties away from zero.
///
/// Rounding has no useful gradient, so any request to propagate through
/// this layer is refused in strict mode and skipped in hardened mode.
#[derive(Debug, Clone, Default)]
pub struct RoundLayer {
    set_up: bool,
}

impl RoundLayer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Gives `top` the shape of `bottom`.
    pub fn prepare(&self, bottom: &Blob, top: &mut Blob) -> Result<(), LayerError> {
        self.ensure_set_up()?;
        top.reshape_like(bottom);
        Ok(())
    }

    pub fn compute_rounded(&self, bottom: &Blob, top: &mut Blob) -> Result<(), LayerError> {
        self.ensure_set_up()?;
        if bottom.shape() != top.shape() {
            return Err(LayerError::ShapeMismatch {
                layer: LAYER,
                input: "top",
                expected: bottom.shape().clone(),
                actual: top.shape().clone(),
            });
        }
        round_into(bottom.data(), top.data_mut())?;
        Ok(())
    }

    /// Rounds a blob in place, for callers that bind the same blob as input and output.
    pub fn compute_rounded_in_place(&self, blob: &mut Blob) -> Result<(), LayerError> {
        self.ensure_set_up()?;
        round_in_place(blob.data_mut());
        Ok(())
    }

    fn ensure_set_up(&self) -> Result<(), LayerError> {
        if self.set_up {
            Ok(())
        } else {
            Err(LayerError::NotSetUp { layer: LAYER })
        }
    }
}

impl Layer for RoundLayer {
    fn layer_type(&self) -> LayerType {
        LAYER
    }

    fn min_bottom_blobs(&self) -> usize {
        1
    }

    fn max_bottom_blobs(&self) -> usize {
        1
    }

    fn allow_backward(&self, _bottom_index: usize) -> bool {
        false
    }

    fn setup(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<(), LayerError> {
        check_blob_counts(&*self, bottom.len(), top.len())?;
        self.set_up = true;
        Ok(())
    }

    fn reshape(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<(), LayerError> {
        check_blob_counts(&*self, bottom.len(), top.len())?;
        self.prepare(&bottom[0], &mut top[0])
    }

    fn forward(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<(), LayerError> {
        check_blob_counts(&*self, bottom.len(), top.len())?;
        self.compute_rounded(&bottom[0], &mut top[0])
    }

    fn backward(
        &mut self,
        top: &[Blob],
        propagate_down: &[bool],
        bottom: &mut [Blob],
        mode: ExecutionMode,
    ) -> Result<BackwardReport, LayerError> {
        check_blob_counts(&*self, bottom.len(), top.len())?;
        let (propagated, skipped) =
            resolve_propagation(&*self, propagate_down, bottom.len(), mode)?;
        Ok(BackwardReport {
            layer: LAYER,
            propagated,
            skipped,
            rule: "round is not differentiable; no gradient written",
        })
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rl_config::LayerType;
    use rl_core::{Blob, BlobShape, ExecutionMode};

    use super::RoundLayer;
    use crate::{Layer, LayerError};

    fn row(values: &[f64]) -> Blob {
        Blob::from_data(BlobShape::nchw(1, 1, 1, values.len()), values.to_vec())
            .expect("test blob should build")
    }

    fn ready(bottom: &[Blob], top: &mut [Blob]) -> RoundLayer {
        let mut layer = RoundLayer::new();
        layer.setup(bottom, top).expect("setup");
        layer.reshape(bottom, top).expect("reshape");
        layer
    }

    #[test]
    fn rounds_halves_away_from_zero() {
        let bottom = vec![row(&[1.4, 1.5, -1.5, -1.4, 2.5])];
        let mut top = vec![Blob::new(BlobShape::scalar())];
        let mut layer = ready(&bottom, &mut top);

        layer.forward(&bottom, &mut top).expect("forward");
        assert_eq!(top[0].shape(), bottom[0].shape());
        assert_eq!(top[0].data(), &[1.0, 2.0, -2.0, -1.0, 3.0]);
        assert_eq!(bottom[0].data(), &[1.4, 1.5, -1.5, -1.4, 2.5]);
    }

    #[test]
    fn in_place_matches_separate_output() {
        let mut blob = row(&[0.5, -0.5, 7.49, -7.51]);
        let bottom = vec![blob.clone()];
        let mut top = vec![Blob::new(BlobShape::scalar())];
        let mut layer = ready(&bottom, &mut top);
        layer.forward(&bottom, &mut top).expect("forward");

        layer.compute_rounded_in_place(&mut blob).expect("in place");
        assert_eq!(blob.data(), top[0].data());
        assert_eq!(blob.data(), &[1.0, -1.0, 7.0, -8.0]);
    }

    #[test]
    fn reshape_follows_input_shape() {
        let mut bottom = vec![Blob::new(BlobShape::nchw(2, 3, 1, 1))];
        let mut top = vec![Blob::new(BlobShape::scalar())];
        let mut layer = ready(&bottom, &mut top);
        assert_eq!(top[0].shape(), &BlobShape::nchw(2, 3, 1, 1));

        bottom[0] = Blob::filled(BlobShape::nchw(1, 1, 4, 4), 0.6);
        layer.reshape(&bottom, &mut top).expect("reshape");
        layer.forward(&bottom, &mut top).expect("forward");
        assert_eq!(top[0].count(), 16);
        assert!(top[0].data().iter().all(|value| *value == 1.0));
    }

    #[test]
    fn forward_without_reshape_reports_shape_mismatch() {
        let bottom = vec![row(&[1.0, 2.0])];
        let mut top = vec![Blob::new(BlobShape::scalar())];
        let mut layer = RoundLayer::new();
        layer.setup(&bottom, &mut top).expect("setup");
        let err = layer
            .forward(&bottom, &mut top)
            .expect_err("top was never reshaped");
        assert!(matches!(err, LayerError::ShapeMismatch { input: "top", .. }));
    }

    #[test]
    fn use_before_setup_is_refused() {
        let layer = RoundLayer::new();
        let mut blob = row(&[1.2]);
        assert_eq!(
            layer.compute_rounded_in_place(&mut blob),
            Err(LayerError::NotSetUp {
                layer: LayerType::Round
            })
        );
    }

    #[test]
    fn setup_rejects_extra_inputs() {
        let bottom = vec![row(&[1.0]), row(&[2.0])];
        let mut top = vec![Blob::new(BlobShape::scalar())];
        let err = RoundLayer::new()
            .setup(&bottom, &mut top)
            .expect_err("two inputs");
        assert_eq!(
            err,
            LayerError::BottomCount {
                layer: LayerType::Round,
                min: 1,
                max: 1,
                actual: 2
            }
        );
    }

    #[test]
    fn backward_is_blocked_by_mode() {
        let mut bottom = vec![row(&[0.2, 0.7])];
        bottom[0].fill_diff(5.0);
        let mut top = vec![Blob::new(BlobShape::scalar())];
        let mut layer = ready(&bottom, &mut top);
        layer.forward(&bottom, &mut top).expect("forward");
        top[0].fill_diff(1.0);

        let err = layer
            .backward(&top, &[true], &mut bottom, ExecutionMode::Strict)
            .expect_err("strict refuses");
        assert_eq!(
            err,
            LayerError::NonDifferentiableInput {
                layer: LayerType::Round,
                index: 0
            }
        );

        let report = layer
            .backward(&top, &[true], &mut bottom, ExecutionMode::Hardened)
            .expect("hardened skips");
        assert!(report.propagated.is_empty());
        assert_eq!(report.skipped, vec![0]);
        assert_eq!(bottom[0].diff(), &[5.0, 5.0]);

        let report = layer
            .backward(&top, &[false], &mut bottom, ExecutionMode::Strict)
            .expect("nothing requested");
        assert!(report.skipped.is_empty());
    }

    proptest! {
        #[test]
        fn prop_rounded_values_are_integral_and_close(
            values in prop::collection::vec(-1.0e6f64..1.0e6, 1..=16),
        ) {
            let bottom = vec![row(&values)];
            let mut top = vec![Blob::new(BlobShape::scalar())];
            let mut layer = ready(&bottom, &mut top);
            layer.forward(&bottom, &mut top).expect("forward");

            for (input, output) in values.iter().zip(top[0].data()) {
                prop_assert_eq!(output.fract(), 0.0);
                prop_assert!((output - input).abs() <= 0.5);
                if (input.fract().abs() - 0.5).abs() > 1e-9 {
                    prop_assert!((output - input).abs() < 0.5);
                }
            }
        }
    }
}
