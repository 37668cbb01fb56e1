#![forbid(unsafe_code)]

use std::fmt;

use rl_config::{
    ConfigError, DecodeMode, LayerParam, LayerType, decode_layer_param, validate_layer_param,
};
use rl_core::{Blob, BlobShape, ExecutionMode};
use rl_layers::{BackwardReport, Layer, LayerError, build_layer};
use rl_runtime::{EvidenceEntry, EvidenceEvent, RuntimeContext};

#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    Config(ConfigError),
    Layer(LayerError),
    /// Forward, backward or a data update was requested before any inputs were bound.
    NotBound { layer: LayerType },
    BottomIndex { index: usize, bound: usize },
    /// The layer parameter names a different number of bottoms than were bound.
    DeclaredBottomCount { declared: usize, bound: usize },
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(error) => write!(f, "config failure: {error}"),
            Self::Layer(error) => write!(f, "layer failure: {error}"),
            Self::NotBound { layer } => write!(f, "{layer} session has no bound inputs"),
            Self::BottomIndex { index, bound } => {
                write!(f, "bottom index {index} out of range for {bound} bound inputs")
            }
            Self::DeclaredBottomCount { declared, bound } => write!(
                f,
                "layer declares {declared} bottoms but {bound} blobs were bound"
            ),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<ConfigError> for SessionError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<LayerError> for SessionError {
    fn from(value: LayerError) -> Self {
        Self::Layer(value)
    }
}

impl From<rl_core::BlobError> for SessionError {
    fn from(value: rl_core::BlobError) -> Self {
        Self::Layer(LayerError::Blob(value))
    }
}

/// One configured layer together with the blobs bound to it and the
/// evidence ledger recording every lifecycle call.
#[derive(Debug)]
pub struct LayerSession {
    name: String,
    layer: Box<dyn Layer>,
    loss_weight: f64,
    declared_bottoms: Vec<String>,
    bottom: Vec<Blob>,
    top: Vec<Blob>,
    set_up: bool,
    runtime: RuntimeContext,
}

impl LayerSession {
    pub fn from_param(param: &LayerParam, mode: ExecutionMode) -> Result<Self, SessionError> {
        validate_layer_param(param)?;
        let layer = build_layer(param)?;
        let tops = layer.exact_num_top_blobs();
        if !param.top.is_empty() && param.top.len() != tops {
            return Err(SessionError::Layer(LayerError::TopCount {
                layer: param.layer_type,
                expected: tops,
                actual: param.top.len(),
            }));
        }
        let mut runtime = RuntimeContext::new(mode);
        let loss_weight = param.effective_loss_weight();
        let sigma = match param.layer_type {
            LayerType::SmoothL1Loss => Some(param.smooth_l1_param().sigma),
            LayerType::Round => None,
        };
        runtime.record(EvidenceEvent::LayerBuilt {
            layer: param.layer_type,
            name: param.name.clone(),
            loss_weight,
            sigma,
        });
        Ok(Self {
            name: param.name.clone(),
            layer,
            loss_weight,
            declared_bottoms: param.bottom.clone(),
            bottom: Vec::new(),
            top: Vec::new(),
            set_up: false,
            runtime,
        })
    }

    pub fn from_json(
        input: &str,
        decode_mode: DecodeMode,
        mode: ExecutionMode,
    ) -> Result<Self, SessionError> {
        let decoded = decode_layer_param(input, decode_mode)?;
        let mut session = Self::from_param(&decoded.param, mode)?;
        for field in decoded.ignored_fields {
            session.runtime.record(EvidenceEvent::FieldIgnored {
                decode: decode_mode,
                field,
            });
        }
        Ok(session)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn layer_type(&self) -> LayerType {
        self.layer.layer_type()
    }

    #[must_use]
    pub fn loss_weight(&self) -> f64 {
        self.loss_weight
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.runtime.mode()
    }

    pub fn set_mode(&mut self, mode: ExecutionMode) {
        self.runtime.set_mode(mode);
    }

    #[must_use]
    pub fn declared_bottoms(&self) -> &[String] {
        &self.declared_bottoms
    }

    /// Binds the layer inputs. The first bind runs setup; every bind reshapes.
    /// When the parameter names its bottoms, exactly that many blobs must be
    /// bound. On failure the previously bound inputs stay in place.
    pub fn bind_bottom(&mut self, bottom: Vec<Blob>) -> Result<(), SessionError> {
        let declared = self.declared_bottoms.len();
        if declared != 0 && declared != bottom.len() {
            return Err(SessionError::DeclaredBottomCount {
                declared,
                bound: bottom.len(),
            });
        }
        let mut top = if self.top.is_empty() {
            vec![Blob::new(BlobShape::scalar()); self.layer.exact_num_top_blobs()]
        } else {
            std::mem::take(&mut self.top)
        };

        let result = self.setup_and_reshape(&bottom, &mut top);
        self.top = top;
        result?;

        self.runtime.record(EvidenceEvent::Reshape {
            layer: self.layer.layer_type(),
            bottoms: bottom.len(),
            shape: bottom[0].shape().clone(),
            top_shape: self.top[0].shape().clone(),
        });
        self.bottom = bottom;
        Ok(())
    }

    /// Replaces the values of one bound input without changing its shape.
    pub fn set_bottom_data(&mut self, index: usize, data: Vec<f64>) -> Result<(), SessionError> {
        self.ensure_bound()?;
        let bound = self.bottom.len();
        let blob = self
            .bottom
            .get_mut(index)
            .ok_or(SessionError::BottomIndex { index, bound })?;
        blob.set_data(data)?;
        Ok(())
    }

    /// Runs the layer forward and returns its weighted contribution to the
    /// objective, `sum(top) * loss_weight`.
    pub fn forward(&mut self) -> Result<f64, SessionError> {
        self.ensure_bound()?;
        self.layer.forward(&self.bottom, &mut self.top)?;

        let objective: f64 = self
            .top
            .iter()
            .flat_map(|blob| blob.data().iter())
            .map(|value| value * self.loss_weight)
            .sum();
        self.runtime.record(EvidenceEvent::Forward {
            layer: self.layer.layer_type(),
            count: self.bottom[0].count(),
            objective,
            top_fingerprint: self.top[0].evidence_fingerprint64(),
        });
        Ok(objective)
    }

    /// Seeds each output gradient with the loss weight and runs the layer backward.
    pub fn backward(&mut self, propagate_down: &[bool]) -> Result<BackwardReport, SessionError> {
        self.ensure_bound()?;
        for blob in &mut self.top {
            blob.fill_diff(self.loss_weight);
        }

        let mode = self.mode();
        let report = self
            .layer
            .backward(&self.top, propagate_down, &mut self.bottom, mode)?;

        self.runtime.record(EvidenceEvent::Backward {
            layer: report.layer,
            upstream: self.loss_weight,
            propagated: report.propagated.clone(),
            skipped: report.skipped.clone(),
        });
        for &bottom in &report.skipped {
            self.runtime.record(EvidenceEvent::GradientSkipped {
                layer: report.layer,
                mode,
                bottom,
            });
        }
        Ok(report)
    }

    #[must_use]
    pub fn bottom(&self, index: usize) -> Option<&Blob> {
        self.bottom.get(index)
    }

    #[must_use]
    pub fn top(&self) -> Option<&Blob> {
        self.top.first()
    }

    #[must_use]
    pub fn bottom_gradient(&self, index: usize) -> Option<&[f64]> {
        self.bottom.get(index).map(Blob::diff)
    }

    #[must_use]
    pub fn evidence(&self) -> &[EvidenceEntry] {
        self.runtime.ledger().entries()
    }

    #[must_use]
    pub fn evidence_len(&self) -> usize {
        self.runtime.ledger().len()
    }

    /// Config fields dropped by a hardened decode of this session's parameter.
    #[must_use]
    pub fn ignored_fields(&self) -> Vec<&str> {
        self.runtime.ledger().ignored_fields().collect()
    }

    /// Bottoms whose gradient requests were skipped by the hardened policy.
    #[must_use]
    pub fn skipped_gradients(&self) -> Vec<usize> {
        self.runtime.ledger().skipped_gradients().collect()
    }

    fn setup_and_reshape(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<(), LayerError> {
        if !self.set_up {
            self.layer.setup(bottom, top)?;
            self.set_up = true;
            self.runtime.record(EvidenceEvent::Setup {
                layer: self.layer.layer_type(),
                bottoms: bottom.len(),
                tops: top.len(),
            });
        }
        self.layer.reshape(bottom, top)
    }

    fn ensure_bound(&self) -> Result<(), SessionError> {
        if self.bottom.is_empty() {
            return Err(SessionError::NotBound {
                layer: self.layer.layer_type(),
            });
        }
        Ok(())
    }
}
