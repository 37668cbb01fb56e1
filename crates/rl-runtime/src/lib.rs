#![forbid(unsafe_code)]

use std::fmt;

use rl_config::{DecodeMode, LayerType};
use rl_core::{BlobShape, ExecutionMode};

/// Lifecycle step of a layer that produced evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerPhase {
    Setup,
    Reshape,
    Forward,
    Backward,
}

/// Coarse grouping of evidence: one per lifecycle phase plus policy decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvidenceKind {
    Setup,
    Reshape,
    Forward,
    Backward,
    Policy,
}

impl From<LayerPhase> for EvidenceKind {
    fn from(value: LayerPhase) -> Self {
        match value {
            LayerPhase::Setup => Self::Setup,
            LayerPhase::Reshape => Self::Reshape,
            LayerPhase::Forward => Self::Forward,
            LayerPhase::Backward => Self::Backward,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EvidenceEvent {
    ModeSet {
        mode: ExecutionMode,
        previous: Option<ExecutionMode>,
    },
    LayerBuilt {
        layer: LayerType,
        name: String,
        loss_weight: f64,
        /// Present for layers parameterized by sigma.
        sigma: Option<f64>,
    },
    FieldIgnored {
        decode: DecodeMode,
        field: String,
    },
    Setup {
        layer: LayerType,
        bottoms: usize,
        tops: usize,
    },
    Reshape {
        layer: LayerType,
        bottoms: usize,
        shape: BlobShape,
        top_shape: BlobShape,
    },
    Forward {
        layer: LayerType,
        count: usize,
        objective: f64,
        top_fingerprint: u64,
    },
    Backward {
        layer: LayerType,
        upstream: f64,
        propagated: Vec<usize>,
        skipped: Vec<usize>,
    },
    GradientSkipped {
        layer: LayerType,
        mode: ExecutionMode,
        bottom: usize,
    },
}

impl EvidenceEvent {
    #[must_use]
    pub fn phase(&self) -> Option<LayerPhase> {
        match self {
            Self::Setup { .. } => Some(LayerPhase::Setup),
            Self::Reshape { .. } => Some(LayerPhase::Reshape),
            Self::Forward { .. } => Some(LayerPhase::Forward),
            Self::Backward { .. } => Some(LayerPhase::Backward),
            Self::ModeSet { .. }
            | Self::LayerBuilt { .. }
            | Self::FieldIgnored { .. }
            | Self::GradientSkipped { .. } => None,
        }
    }

    #[must_use]
    pub fn kind(&self) -> EvidenceKind {
        self.phase().map_or(EvidenceKind::Policy, EvidenceKind::from)
    }

    /// Layer the event concerns; `None` for session-wide policy.
    #[must_use]
    pub fn layer(&self) -> Option<LayerType> {
        match self {
            Self::LayerBuilt { layer, .. }
            | Self::Setup { layer, .. }
            | Self::Reshape { layer, .. }
            | Self::Forward { layer, .. }
            | Self::Backward { layer, .. }
            | Self::GradientSkipped { layer, .. } => Some(*layer),
            Self::ModeSet { .. } | Self::FieldIgnored { .. } => None,
        }
    }
}

impl fmt::Display for EvidenceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ModeSet {
                mode,
                previous: None,
            } => write!(f, "mode initialized to {mode:?}"),
            Self::ModeSet {
                mode,
                previous: Some(previous),
            } => write!(f, "mode switched from {previous:?} to {mode:?}"),
            Self::LayerBuilt {
                layer,
                name,
                loss_weight,
                sigma,
            } => {
                write!(f, "layer={layer} name={name} loss_weight={loss_weight}")?;
                if let Some(sigma) = sigma {
                    write!(f, " sigma={sigma}")?;
                }
                Ok(())
            }
            Self::FieldIgnored { decode, field } => {
                write!(f, "decode={decode:?} ignored_field={field}")
            }
            Self::Setup {
                layer,
                bottoms,
                tops,
            } => write!(f, "layer={layer} setup bottoms={bottoms} tops={tops}"),
            Self::Reshape {
                layer,
                bottoms,
                shape,
                top_shape,
            } => write!(
                f,
                "layer={layer} bottoms={bottoms} shape={shape} top_shape={top_shape}"
            ),
            Self::Forward {
                layer,
                count,
                objective,
                top_fingerprint,
            } => write!(
                f,
                "layer={layer} count={count} objective={objective} top_fingerprint=0x{top_fingerprint:016x}"
            ),
            Self::Backward {
                layer,
                upstream,
                propagated,
                skipped,
            } => write!(
                f,
                "layer={layer} upstream={upstream} propagated={propagated:?} skipped={skipped:?}"
            ),
            Self::GradientSkipped {
                layer,
                mode,
                bottom,
            } => write!(
                f,
                "mode={mode:?} skipped gradient request for bottom={bottom} of {layer}"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvidenceEntry {
    pub ts_unix_ms: u128,
    pub event: EvidenceEvent,
}

impl EvidenceEntry {
    #[must_use]
    pub fn kind(&self) -> EvidenceKind {
        self.event.kind()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvidenceLedger {
    entries: Vec<EvidenceEntry>,
}

impl EvidenceLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: EvidenceEvent) {
        self.entries.push(EvidenceEntry {
            ts_unix_ms: now_unix_ms(),
            event,
        });
    }

    #[must_use]
    pub fn entries(&self) -> &[EvidenceEntry] {
        &self.entries
    }

    pub fn entries_of(&self, kind: EvidenceKind) -> impl Iterator<Item = &EvidenceEntry> {
        self.entries.iter().filter(move |entry| entry.kind() == kind)
    }

    /// Config fields a hardened decode dropped, in the order they were logged.
    pub fn ignored_fields(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().filter_map(|entry| match &entry.event {
            EvidenceEvent::FieldIgnored { field, .. } => Some(field.as_str()),
            _ => None,
        })
    }

    /// Bottom indices whose gradient request was skipped under the hardened policy.
    pub fn skipped_gradients(&self) -> impl Iterator<Item = usize> + '_ {
        self.entries.iter().filter_map(|entry| match entry.event {
            EvidenceEvent::GradientSkipped { bottom, .. } => Some(bottom),
            _ => None,
        })
    }

    #[must_use]
    pub fn last_phase(&self) -> Option<LayerPhase> {
        self.entries
            .iter()
            .rev()
            .find_map(|entry| entry.event.phase())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Execution policy of one session plus the ledger of what it did.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeContext {
    mode: ExecutionMode,
    ledger: EvidenceLedger,
}

impl RuntimeContext {
    #[must_use]
    pub fn new(mode: ExecutionMode) -> Self {
        let mut ledger = EvidenceLedger::new();
        ledger.record(EvidenceEvent::ModeSet {
            mode,
            previous: None,
        });
        Self { mode, ledger }
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Switches policy; a switch to the current mode is not logged.
    pub fn set_mode(&mut self, mode: ExecutionMode) {
        if mode == self.mode {
            return;
        }
        let previous = std::mem::replace(&mut self.mode, mode);
        self.ledger.record(EvidenceEvent::ModeSet {
            mode,
            previous: Some(previous),
        });
    }

    #[must_use]
    pub fn ledger(&self) -> &EvidenceLedger {
        &self.ledger
    }

    pub fn record(&mut self, event: EvidenceEvent) {
        self.ledger.record(event);
    }
}

fn now_unix_ms() -> u128 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}

#[cfg(test)]
mod tests {
    use rl_config::{DecodeMode, LayerType};
    use rl_core::{BlobShape, ExecutionMode};

    use super::{EvidenceEvent, EvidenceKind, LayerPhase, RuntimeContext};

    #[test]
    fn new_context_logs_initial_mode_as_policy() {
        let ctx = RuntimeContext::new(ExecutionMode::Strict);
        assert_eq!(ctx.ledger().len(), 1);
        let entry = &ctx.ledger().entries()[0];
        assert_eq!(entry.kind(), EvidenceKind::Policy);
        assert_eq!(entry.event.layer(), None);
        assert_eq!(entry.event.to_string(), "mode initialized to Strict");
    }

    #[test]
    fn mode_switch_records_previous_mode_once() {
        let mut ctx = RuntimeContext::new(ExecutionMode::Strict);
        ctx.set_mode(ExecutionMode::Hardened);
        ctx.set_mode(ExecutionMode::Hardened);

        assert_eq!(ctx.mode(), ExecutionMode::Hardened);
        assert_eq!(ctx.ledger().entries_of(EvidenceKind::Policy).count(), 2);
        assert_eq!(
            ctx.ledger().entries()[1].event,
            EvidenceEvent::ModeSet {
                mode: ExecutionMode::Hardened,
                previous: Some(ExecutionMode::Strict),
            }
        );
    }

    #[test]
    fn lifecycle_events_map_to_phase_kinds() {
        let mut ctx = RuntimeContext::new(ExecutionMode::Strict);
        ctx.record(EvidenceEvent::Setup {
            layer: LayerType::SmoothL1Loss,
            bottoms: 4,
            tops: 1,
        });
        ctx.record(EvidenceEvent::Reshape {
            layer: LayerType::SmoothL1Loss,
            bottoms: 4,
            shape: BlobShape::nchw(2, 8, 1, 1),
            top_shape: BlobShape::scalar(),
        });
        ctx.record(EvidenceEvent::Forward {
            layer: LayerType::SmoothL1Loss,
            count: 16,
            objective: 0.75,
            top_fingerprint: 0xab,
        });

        let kinds: Vec<EvidenceKind> = ctx.ledger().entries().iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                EvidenceKind::Policy,
                EvidenceKind::Setup,
                EvidenceKind::Reshape,
                EvidenceKind::Forward,
            ]
        );
        assert_eq!(ctx.ledger().last_phase(), Some(LayerPhase::Forward));
        assert_eq!(
            ctx.ledger().entries()[2].event.to_string(),
            "layer=SmoothL1Loss bottoms=4 shape=(2,8,1,1) top_shape=()"
        );
    }

    #[test]
    fn policy_queries_read_typed_events() {
        let mut ctx = RuntimeContext::new(ExecutionMode::Hardened);
        ctx.record(EvidenceEvent::FieldIgnored {
            decode: DecodeMode::Hardened,
            field: "phase".to_string(),
        });
        ctx.record(EvidenceEvent::Backward {
            layer: LayerType::SmoothL1Loss,
            upstream: 1.0,
            propagated: vec![0, 1],
            skipped: vec![2, 3],
        });
        for bottom in [2, 3] {
            ctx.record(EvidenceEvent::GradientSkipped {
                layer: LayerType::SmoothL1Loss,
                mode: ExecutionMode::Hardened,
                bottom,
            });
        }

        assert_eq!(ctx.ledger().ignored_fields().collect::<Vec<_>>(), vec!["phase"]);
        assert_eq!(
            ctx.ledger().skipped_gradients().collect::<Vec<_>>(),
            vec![2, 3]
        );
        // policy events do not move the lifecycle phase
        assert_eq!(ctx.ledger().last_phase(), Some(LayerPhase::Backward));
        assert_eq!(
            ctx.ledger().entries()[3].event.layer(),
            Some(LayerType::SmoothL1Loss)
        );
    }

    #[test]
    fn layer_built_omits_sigma_when_absent() {
        let round = EvidenceEvent::LayerBuilt {
            layer: LayerType::Round,
            name: "q".to_string(),
            loss_weight: 0.0,
            sigma: None,
        };
        assert_eq!(round.to_string(), "layer=Round name=q loss_weight=0");
        assert_eq!(round.kind(), EvidenceKind::Policy);
    }
}
