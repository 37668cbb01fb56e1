#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use rl_api::{LayerSession, SessionError};
use rl_config::{ConfigError, DecodeMode, LayerParam};
use rl_core::{Blob, BlobShape, ExecutionMode};
use rl_layers::LayerError;
use serde::Deserialize;
use serde_json::Value;

const MAX_FIXTURE_BYTES: u64 = 1_048_576;
const DEFAULT_TOLERANCE: f64 = 1e-12;

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub fixture_root: PathBuf,
    pub strict_mode: bool,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        Self {
            fixture_root: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures"),
            strict_mode: true,
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessReport {
    pub suite: &'static str,
    pub fixture_count: usize,
    pub strict_mode: bool,
    pub cases_total: usize,
    pub cases_passed: usize,
}

impl HarnessReport {
    #[must_use]
    pub fn is_green(&self) -> bool {
        self.cases_total == self.cases_passed
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SmoothL1CaseReport {
    pub name: String,
    pub mode: ExecutionMode,
    pub loss_ok: bool,
    pub pred_grad_ok: bool,
    pub target_grad_ok: bool,
    pub error_ok: bool,
    pub observed_error: Option<&'static str>,
    pub evidence_len: usize,
}

impl SmoothL1CaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.loss_ok && self.pred_grad_ok && self.target_grad_ok && self.error_ok
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoundCaseReport {
    pub name: String,
    pub mode: ExecutionMode,
    pub output_ok: bool,
    pub backward_policy_ok: bool,
    pub evidence_len: usize,
}

impl RoundCaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.output_ok && self.backward_policy_ok
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerParamCaseReport {
    pub name: String,
    pub mode: ExecutionMode,
    pub decode_ok: bool,
    pub ignored_fields_ok: bool,
    pub observed_error: Option<&'static str>,
}

impl LayerParamCaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.decode_ok && self.ignored_fields_ok
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct SmoothL1FixtureFile {
    cases: Vec<SmoothL1Case>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct SmoothL1Case {
    name: String,
    #[serde(default = "default_sigma")]
    sigma: f64,
    loss_weight: Option<f64>,
    shape: [usize; 4],
    target_shape: Option<[usize; 4]>,
    #[serde(default)]
    pred: Vec<f64>,
    #[serde(default)]
    target: Vec<f64>,
    inner_weight: Option<Vec<f64>>,
    outer_weight: Option<Vec<f64>>,
    propagate_down: Option<Vec<bool>>,
    expected_loss: Option<f64>,
    expected_pred_grad: Option<Vec<f64>>,
    expected_target_grad: Option<Vec<f64>>,
    /// Failure expected in every mode.
    expected_error: Option<String>,
    /// Failure expected only in strict mode; hardened must succeed.
    expected_strict_error: Option<String>,
    tolerance: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RoundFixtureFile {
    cases: Vec<RoundCase>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RoundCase {
    name: String,
    shape: Option<[usize; 4]>,
    input: Vec<f64>,
    expected_output: Vec<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct LayerParamFixtureFile {
    cases: Vec<LayerParamCase>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct LayerParamCase {
    name: String,
    payload: Value,
    strict_ok: bool,
    hardened_ok: bool,
    #[serde(default)]
    expected_ignored: Vec<String>,
}

fn default_sigma() -> f64 {
    1.0
}

pub fn run_smoke(config: &HarnessConfig) -> HarnessReport {
    let fixture_count = fs::read_dir(&config.fixture_root)
        .ok()
        .into_iter()
        .flat_map(|it| it.filter_map(Result::ok))
        .count();

    let mode = mode_for(config);

    let (smooth_l1_total, smooth_l1_passed) = run_smooth_l1_conformance(config, mode)
        .map_or((0, 0), |(_, cases)| {
            summarize_passes(cases.iter().map(SmoothL1CaseReport::passed))
        });
    let (round_total, round_passed) = run_round_conformance(config, mode)
        .map_or((0, 0), |(_, cases)| {
            summarize_passes(cases.iter().map(RoundCaseReport::passed))
        });
    let (param_total, param_passed) = run_layer_param_conformance(config, mode)
        .map_or((0, 0), |(_, cases)| {
            summarize_passes(cases.iter().map(LayerParamCaseReport::passed))
        });

    HarnessReport {
        suite: "smoke",
        fixture_count,
        strict_mode: config.strict_mode,
        cases_total: smooth_l1_total + round_total + param_total,
        cases_passed: smooth_l1_passed + round_passed + param_passed,
    }
}

pub fn run_smooth_l1_conformance(
    config: &HarnessConfig,
    mode: ExecutionMode,
) -> Result<(HarnessReport, Vec<SmoothL1CaseReport>), String> {
    let fixture: SmoothL1FixtureFile =
        load_fixture(&config.fixture_root.join("smooth_l1_cases.json"))?;
    let mut case_reports = Vec::with_capacity(fixture.cases.len());
    for case in &fixture.cases {
        case_reports.push(run_smooth_l1_case(case, mode)?);
    }

    let (cases_total, cases_passed) =
        summarize_passes(case_reports.iter().map(SmoothL1CaseReport::passed));
    Ok((
        HarnessReport {
            suite: "smooth_l1_loss",
            fixture_count: 1,
            strict_mode: mode == ExecutionMode::Strict,
            cases_total,
            cases_passed,
        },
        case_reports,
    ))
}

pub fn run_round_conformance(
    config: &HarnessConfig,
    mode: ExecutionMode,
) -> Result<(HarnessReport, Vec<RoundCaseReport>), String> {
    let fixture: RoundFixtureFile = load_fixture(&config.fixture_root.join("round_cases.json"))?;
    let mut case_reports = Vec::with_capacity(fixture.cases.len());
    for case in &fixture.cases {
        case_reports.push(run_round_case(case, mode)?);
    }

    let (cases_total, cases_passed) =
        summarize_passes(case_reports.iter().map(RoundCaseReport::passed));
    Ok((
        HarnessReport {
            suite: "round",
            fixture_count: 1,
            strict_mode: mode == ExecutionMode::Strict,
            cases_total,
            cases_passed,
        },
        case_reports,
    ))
}

pub fn run_layer_param_conformance(
    config: &HarnessConfig,
    mode: ExecutionMode,
) -> Result<(HarnessReport, Vec<LayerParamCaseReport>), String> {
    let fixture: LayerParamFixtureFile =
        load_fixture(&config.fixture_root.join("layer_param_cases.json"))?;
    let mut case_reports = Vec::with_capacity(fixture.cases.len());
    for case in &fixture.cases {
        case_reports.push(run_layer_param_case(case, mode)?);
    }

    let (cases_total, cases_passed) =
        summarize_passes(case_reports.iter().map(LayerParamCaseReport::passed));
    Ok((
        HarnessReport {
            suite: "layer_param",
            fixture_count: 1,
            strict_mode: mode == ExecutionMode::Strict,
            cases_total,
            cases_passed,
        },
        case_reports,
    ))
}

fn run_smooth_l1_case(
    case: &SmoothL1Case,
    mode: ExecutionMode,
) -> Result<SmoothL1CaseReport, String> {
    let mut param = LayerParam::smooth_l1(case.name.as_str(), case.sigma);
    if let Some(loss_weight) = case.loss_weight {
        param = param.with_loss_weight(loss_weight);
    }
    let mut session = LayerSession::from_param(&param, mode)
        .map_err(|error| format!("session build failed for '{}': {error}", case.name))?;

    let pred_shape = shape_from(case.shape);
    let target_shape = case.target_shape.map_or_else(|| pred_shape.clone(), shape_from);
    let mut bottom = vec![
        blob_or_zeros(&case.name, "pred", pred_shape.clone(), &case.pred)?,
        blob_or_zeros(&case.name, "target", target_shape, &case.target)?,
    ];
    if let Some(inner) = &case.inner_weight {
        bottom.push(blob_or_zeros(&case.name, "inner_weight", pred_shape.clone(), inner)?);
    }
    if let Some(outer) = &case.outer_weight {
        bottom.push(blob_or_zeros(&case.name, "outer_weight", pred_shape, outer)?);
    }
    let propagate_down = case.propagate_down.clone().unwrap_or_else(|| {
        (0..bottom.len()).map(|index| index < 2).collect()
    });

    let expected_error = match mode {
        ExecutionMode::Strict => case
            .expected_error
            .as_deref()
            .or(case.expected_strict_error.as_deref()),
        ExecutionMode::Hardened => case.expected_error.as_deref(),
    };

    let outcome = drive_smooth_l1(&mut session, bottom, &propagate_down);
    let observed_error = outcome.as_ref().err().map(error_label);
    let loss = session.top().and_then(|top| top.data().first().copied());

    let tolerance = case.tolerance.unwrap_or(DEFAULT_TOLERANCE);
    let loss_ok = match (case.expected_loss, loss) {
        (Some(expected), Some(actual)) => within(actual, expected, tolerance),
        (Some(_), None) => false,
        (None, _) => true,
    };
    // Gradients are only compared when backward ran to completion.
    let check_grads = outcome.is_ok();
    let pred_grad_ok = grad_matches(
        check_grads,
        case.expected_pred_grad.as_deref(),
        session.bottom_gradient(0),
        tolerance,
    );
    let target_grad_ok = grad_matches(
        check_grads,
        case.expected_target_grad.as_deref(),
        session.bottom_gradient(1),
        tolerance,
    );
    let error_ok = observed_error == expected_error;

    Ok(SmoothL1CaseReport {
        name: case.name.clone(),
        mode,
        loss_ok,
        pred_grad_ok,
        target_grad_ok,
        error_ok,
        observed_error,
        evidence_len: session.evidence_len(),
    })
}

fn drive_smooth_l1(
    session: &mut LayerSession,
    bottom: Vec<Blob>,
    propagate_down: &[bool],
) -> Result<(), SessionError> {
    session.bind_bottom(bottom)?;
    session.forward()?;
    session.backward(propagate_down)?;
    Ok(())
}

fn run_round_case(case: &RoundCase, mode: ExecutionMode) -> Result<RoundCaseReport, String> {
    let mut session = LayerSession::from_param(&LayerParam::round(case.name.as_str()), mode)
        .map_err(|error| format!("session build failed for '{}': {error}", case.name))?;
    let shape = case
        .shape
        .map_or_else(|| BlobShape::nchw(1, 1, 1, case.input.len()), shape_from);
    let input = blob_or_zeros(&case.name, "input", shape, &case.input)?;

    session
        .bind_bottom(vec![input])
        .map_err(|error| format!("bind failed for '{}': {error}", case.name))?;
    session
        .forward()
        .map_err(|error| format!("forward failed for '{}': {error}", case.name))?;
    let output_ok = session
        .top()
        .is_some_and(|top| vec_within(top.data(), &case.expected_output, DEFAULT_TOLERANCE));

    let backward = session.backward(&[true]);
    let untouched = session
        .bottom_gradient(0)
        .is_some_and(|grad| grad.iter().all(|value| *value == 0.0));
    let backward_policy_ok = untouched
        && match (mode, backward) {
            (ExecutionMode::Strict, Err(error)) => error_label(&error) == "non_differentiable_input",
            (ExecutionMode::Hardened, Ok(report)) => {
                report.propagated.is_empty() && report.skipped == [0]
            }
            _ => false,
        };

    Ok(RoundCaseReport {
        name: case.name.clone(),
        mode,
        output_ok,
        backward_policy_ok,
        evidence_len: session.evidence_len(),
    })
}

fn run_layer_param_case(
    case: &LayerParamCase,
    mode: ExecutionMode,
) -> Result<LayerParamCaseReport, String> {
    let payload = serde_json::to_string(&case.payload)
        .map_err(|error| format!("payload encode failed for '{}': {error}", case.name))?;
    let (decode_mode, expected_ok) = match mode {
        ExecutionMode::Strict => (DecodeMode::Strict, case.strict_ok),
        ExecutionMode::Hardened => (DecodeMode::Hardened, case.hardened_ok),
    };

    let result = LayerSession::from_json(payload.as_str(), decode_mode, mode);
    let observed_error = result.as_ref().err().map(error_label);
    let decode_ok = result.is_ok() == expected_ok;
    let ignored_fields_ok = match &result {
        Ok(session) => {
            let mut ignored = session.ignored_fields();
            ignored.sort_unstable();
            let mut expected: Vec<&str> = match mode {
                ExecutionMode::Strict => Vec::new(),
                ExecutionMode::Hardened => {
                    case.expected_ignored.iter().map(String::as_str).collect()
                }
            };
            expected.sort_unstable();
            ignored == expected
        }
        Err(_) => true,
    };

    Ok(LayerParamCaseReport {
        name: case.name.clone(),
        mode,
        decode_ok,
        ignored_fields_ok,
        observed_error,
    })
}

/// Stable snake_case label for a session failure, as used by fixtures.
#[must_use]
pub fn error_label(error: &SessionError) -> &'static str {
    match error {
        SessionError::Config(ConfigError::InvalidJson { .. }) => "invalid_json",
        SessionError::Config(ConfigError::UnknownField { .. }) => "unknown_field",
        SessionError::Config(ConfigError::IncompatiblePayload { .. }) => "incompatible_payload",
        SessionError::Config(ConfigError::InvalidParam { .. }) => "invalid_param",
        SessionError::Layer(layer) => match layer {
            LayerError::BottomCount { .. } => "bottom_count",
            LayerError::TopCount { .. } => "top_count",
            LayerError::ShapeMismatch { .. } => "shape_mismatch",
            LayerError::EmptyBatch { .. } => "empty_batch",
            LayerError::InvalidSigma { .. } => "invalid_sigma",
            LayerError::WeightLayoutMismatch { .. } => "weight_layout_mismatch",
            LayerError::PropagateMaskLength { .. } => "propagate_mask_length",
            LayerError::NonDifferentiableInput { .. } => "non_differentiable_input",
            LayerError::NotSetUp { .. } => "not_set_up",
            LayerError::BackwardBeforeForward { .. } => "backward_before_forward",
            LayerError::Blob(_) => "blob",
            LayerError::Kernel(_) => "kernel_length_mismatch",
        },
        SessionError::NotBound { .. } => "not_bound",
        SessionError::BottomIndex { .. } => "bottom_index",
        SessionError::DeclaredBottomCount { .. } => "declared_bottom_count",
    }
}

#[must_use]
pub fn mode_label(mode: ExecutionMode) -> &'static str {
    match mode {
        ExecutionMode::Strict => "strict",
        ExecutionMode::Hardened => "hardened",
    }
}

fn mode_for(config: &HarnessConfig) -> ExecutionMode {
    if config.strict_mode {
        ExecutionMode::Strict
    } else {
        ExecutionMode::Hardened
    }
}

fn shape_from(dims: [usize; 4]) -> BlobShape {
    let [num, channels, height, width] = dims;
    BlobShape::nchw(num, channels, height, width)
}

fn blob_or_zeros(
    case: &str,
    input: &str,
    shape: BlobShape,
    values: &[f64],
) -> Result<Blob, String> {
    if values.is_empty() {
        return Ok(Blob::new(shape));
    }
    Blob::from_data(shape, values.to_vec())
        .map_err(|error| format!("fixture '{case}' has a bad {input} blob: {error}"))
}

fn grad_matches(
    check: bool,
    expected: Option<&[f64]>,
    actual: Option<&[f64]>,
    tolerance: f64,
) -> bool {
    match (expected, actual) {
        (None, _) => true,
        _ if !check => true,
        (Some(expected), Some(actual)) => vec_within(actual, expected, tolerance),
        (Some(_), None) => false,
    }
}

fn load_fixture<T>(path: &Path) -> Result<T, String>
where
    T: for<'de> Deserialize<'de>,
{
    let metadata = fs::metadata(path).map_err(|error| {
        format!(
            "failed reading fixture metadata {}: {error}",
            path.display()
        )
    })?;
    let size = metadata.len();
    if size > MAX_FIXTURE_BYTES {
        return Err(format!(
            "fixture {} exceeds max bytes: actual={size} max={MAX_FIXTURE_BYTES}",
            path.display()
        ));
    }

    let raw = fs::read_to_string(path)
        .map_err(|error| format!("failed reading fixture {}: {error}", path.display()))?;
    serde_json::from_str::<T>(&raw)
        .map_err(|error| format!("failed parsing fixture {}: {error}", path.display()))
}

fn summarize_passes<I>(iter: I) -> (usize, usize)
where
    I: Iterator<Item = bool>,
{
    let mut total = 0usize;
    let mut passed = 0usize;
    for is_passed in iter {
        total += 1;
        if is_passed {
            passed += 1;
        }
    }
    (total, passed)
}

fn within(actual: f64, expected: f64, tolerance: f64) -> bool {
    (actual - expected).abs() <= tolerance
}

fn vec_within(actual: &[f64], expected: &[f64], tolerance: f64) -> bool {
    actual.len() == expected.len()
        && actual
            .iter()
            .zip(expected.iter())
            .all(|(actual, expected)| within(*actual, *expected, tolerance))
}
