#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

const MAX_LAYER_PARAM_PAYLOAD_BYTES: usize = 65_536;
const LAYER_PARAM_FIELDS: [&str; 6] = [
    "name",
    "type",
    "bottom",
    "top",
    "loss_weight",
    "smooth_l1_loss_param",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerType {
    SmoothL1Loss,
    Round,
}

impl LayerType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SmoothL1Loss => "SmoothL1Loss",
            Self::Round => "Round",
        }
    }

    /// Loss layers contribute their output to the objective with weight 1
    /// unless configured otherwise; everything else contributes nothing.
    #[must_use]
    pub const fn default_loss_weight(self) -> f64 {
        match self {
            Self::SmoothL1Loss => 1.0,
            Self::Round => 0.0,
        }
    }
}

impl fmt::Display for LayerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_sigma() -> f64 {
    1.0
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SmoothL1LossParam {
    #[serde(default = "default_sigma")]
    pub sigma: f64,
}

impl Default for SmoothL1LossParam {
    fn default() -> Self {
        Self {
            sigma: default_sigma(),
        }
    }
}

impl SmoothL1LossParam {
    #[must_use]
    pub fn sigma2(&self) -> f64 {
        self.sigma * self.sigma
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LayerParam {
    pub name: String,
    #[serde(rename = "type")]
    pub layer_type: LayerType,
    #[serde(default)]
    pub bottom: Vec<String>,
    #[serde(default)]
    pub top: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss_weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smooth_l1_loss_param: Option<SmoothL1LossParam>,
}

impl LayerParam {
    #[must_use]
    pub fn new(name: impl Into<String>, layer_type: LayerType) -> Self {
        Self {
            name: name.into(),
            layer_type,
            bottom: Vec::new(),
            top: Vec::new(),
            loss_weight: None,
            smooth_l1_loss_param: None,
        }
    }

    #[must_use]
    pub fn smooth_l1(name: impl Into<String>, sigma: f64) -> Self {
        let mut param = Self::new(name, LayerType::SmoothL1Loss);
        param.smooth_l1_loss_param = Some(SmoothL1LossParam { sigma });
        param
    }

    #[must_use]
    pub fn round(name: impl Into<String>) -> Self {
        Self::new(name, LayerType::Round)
    }

    #[must_use]
    pub fn with_bottoms<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bottom = names.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_tops<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.top = names.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_loss_weight(mut self, loss_weight: f64) -> Self {
        self.loss_weight = Some(loss_weight);
        self
    }

    #[must_use]
    pub fn effective_loss_weight(&self) -> f64 {
        self.loss_weight
            .unwrap_or_else(|| self.layer_type.default_loss_weight())
    }

    #[must_use]
    pub fn smooth_l1_param(&self) -> SmoothL1LossParam {
        self.smooth_l1_loss_param.unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    /// Any field outside the schema fails the decode.
    Strict,
    /// Unknown top-level fields are dropped and reported back.
    Hardened,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedLayerParam {
    pub param: LayerParam,
    pub ignored_fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidJson { diagnostic: String },
    UnknownField { field: String },
    IncompatiblePayload { reason: String },
    InvalidParam { field: &'static str, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidJson { diagnostic } => write!(f, "invalid json: {diagnostic}"),
            Self::UnknownField { field } => write!(f, "unknown field '{field}'"),
            Self::IncompatiblePayload { reason } => write!(f, "incompatible payload: {reason}"),
            Self::InvalidParam { field, reason } => {
                write!(f, "invalid layer parameter '{field}': {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

pub fn encode_layer_param(param: &LayerParam) -> Result<String, ConfigError> {
    validate_layer_param(param)?;
    serde_json::to_string(param).map_err(|error| ConfigError::IncompatiblePayload {
        reason: format!("layer parameter encoding failed: {error}"),
    })
}

pub fn decode_layer_param(
    input: &str,
    mode: DecodeMode,
) -> Result<DecodedLayerParam, ConfigError> {
    validate_payload_size(input)?;
    match mode {
        DecodeMode::Strict => decode_layer_param_strict(input),
        DecodeMode::Hardened => decode_layer_param_hardened(input),
    }
}

pub fn validate_layer_param(param: &LayerParam) -> Result<(), ConfigError> {
    if param.name.trim().is_empty() {
        return Err(ConfigError::InvalidParam {
            field: "name",
            reason: "layer name must not be empty".to_string(),
        });
    }

    if let Some(loss_weight) = param.loss_weight.filter(|weight| !weight.is_finite()) {
        return Err(ConfigError::InvalidParam {
            field: "loss_weight",
            reason: format!("loss weight must be finite, got {loss_weight}"),
        });
    }

    match (param.layer_type, param.smooth_l1_loss_param) {
        (LayerType::SmoothL1Loss, Some(loss_param)) => {
            if !loss_param.sigma.is_finite() || loss_param.sigma <= 0.0 {
                return Err(ConfigError::InvalidParam {
                    field: "smooth_l1_loss_param.sigma",
                    reason: format!("sigma must be finite and > 0, got {}", loss_param.sigma),
                });
            }
        }
        (LayerType::SmoothL1Loss, None) => {}
        (other, Some(_)) => {
            return Err(ConfigError::InvalidParam {
                field: "smooth_l1_loss_param",
                reason: format!("not accepted by layer type {other}"),
            });
        }
        (_, None) => {}
    }

    Ok(())
}

fn decode_layer_param_strict(input: &str) -> Result<DecodedLayerParam, ConfigError> {
    let param: LayerParam = serde_json::from_str(input).map_err(|error| {
        if let Some(field) = extract_unknown_field(error.to_string().as_str()) {
            ConfigError::UnknownField { field }
        } else {
            ConfigError::InvalidJson {
                diagnostic: bounded(error.to_string().as_str(), 200),
            }
        }
    })?;
    validate_layer_param(&param)?;
    Ok(DecodedLayerParam {
        param,
        ignored_fields: Vec::new(),
    })
}

fn decode_layer_param_hardened(input: &str) -> Result<DecodedLayerParam, ConfigError> {
    let mut raw: Value = serde_json::from_str(input).map_err(|error| ConfigError::InvalidJson {
        diagnostic: bounded(
            format!(
                "{error}; payload_prefix={} ",
                bounded(input.replace('\n', " ").as_str(), 96)
            )
            .as_str(),
            220,
        ),
    })?;

    let obj = raw
        .as_object_mut()
        .ok_or_else(|| ConfigError::IncompatiblePayload {
            reason: "top-level layer parameter must be a JSON object".to_string(),
        })?;

    let allowed: BTreeSet<&str> = BTreeSet::from(LAYER_PARAM_FIELDS);
    let ignored_fields: Vec<String> = obj
        .keys()
        .filter(|key| !allowed.contains(key.as_str()))
        .cloned()
        .collect();
    for field in &ignored_fields {
        obj.remove(field);
    }

    let param: LayerParam = serde_json::from_value(raw).map_err(|error| {
        if let Some(field) = extract_unknown_field(error.to_string().as_str()) {
            ConfigError::UnknownField { field }
        } else {
            ConfigError::IncompatiblePayload {
                reason: bounded(error.to_string().as_str(), 200),
            }
        }
    })?;

    validate_layer_param(&param)?;
    Ok(DecodedLayerParam {
        param,
        ignored_fields,
    })
}

fn validate_payload_size(input: &str) -> Result<(), ConfigError> {
    let actual = input.len();
    if actual > MAX_LAYER_PARAM_PAYLOAD_BYTES {
        return Err(ConfigError::IncompatiblePayload {
            reason: format!(
                "layer parameter payload exceeds max bytes: actual={actual} max={MAX_LAYER_PARAM_PAYLOAD_BYTES}"
            ),
        });
    }
    Ok(())
}

fn extract_unknown_field(message: &str) -> Option<String> {
    // serde_json message shape: "unknown field `x`, expected ..."
    let marker = "unknown field `";
    let start = message.find(marker)? + marker.len();
    let tail = &message[start..];
    let end = tail.find('`')?;
    Some(tail[..end].to_string())
}

fn bounded(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let mut end = max_len;
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &input[..end])
}
