#![forbid(unsafe_code)]

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    LengthMismatch {
        op: &'static str,
        lhs: usize,
        rhs: usize,
    },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LengthMismatch { op, lhs, rhs } => {
                write!(f, "{op}: element count mismatch lhs={lhs}, rhs={rhs}")
            }
        }
    }
}

impl std::error::Error for KernelError {}

fn ensure_same_len(op: &'static str, lhs: usize, rhs: usize) -> Result<(), KernelError> {
    if lhs != rhs {
        return Err(KernelError::LengthMismatch { op, lhs, rhs });
    }
    Ok(())
}

/// `out[i] = lhs[i] - rhs[i]`
pub fn sub_into(lhs: &[f64], rhs: &[f64], out: &mut [f64]) -> Result<(), KernelError> {
    ensure_same_len("sub", lhs.len(), rhs.len())?;
    ensure_same_len("sub", lhs.len(), out.len())?;
    for ((slot, left), right) in out.iter_mut().zip(lhs).zip(rhs) {
        *slot = left - right;
    }
    Ok(())
}

/// `values[i] *= weights[i]`
pub fn mul_in_place(values: &mut [f64], weights: &[f64]) -> Result<(), KernelError> {
    ensure_same_len("mul", values.len(), weights.len())?;
    for (value, weight) in values.iter_mut().zip(weights) {
        *value *= weight;
    }
    Ok(())
}

/// `out[i] = alpha * src[i]`, overwriting whatever `out` held.
pub fn scale_into(alpha: f64, src: &[f64], out: &mut [f64]) -> Result<(), KernelError> {
    ensure_same_len("scale", src.len(), out.len())?;
    for (slot, value) in out.iter_mut().zip(src) {
        *slot = alpha * value;
    }
    Ok(())
}

pub fn dot(lhs: &[f64], rhs: &[f64]) -> Result<f64, KernelError> {
    ensure_same_len("dot", lhs.len(), rhs.len())?;
    Ok(lhs.iter().zip(rhs).map(|(left, right)| left * right).sum())
}

/// +1, -1, or 0 for exactly zero.
#[must_use]
pub fn sign(value: f64) -> f64 {
    if value > 0.0 {
        1.0
    } else if value < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Smooth L1 kernel with the quadratic/linear transition at `|v| = 1 / sigma2`.
///
/// ```text
/// f(v) = 0.5 * v^2 * sigma2     if |v| < 1 / sigma2
///      = |v| - 0.5 / sigma2     otherwise
/// ```
///
/// Both value and first derivative are continuous at the transition.
/// `sigma2` must be positive.
#[must_use]
pub fn smooth_l1(value: f64, sigma2: f64) -> f64 {
    let abs = value.abs();
    if abs < 1.0 / sigma2 {
        0.5 * value * value * sigma2
    } else {
        abs - 0.5 / sigma2
    }
}

/// Derivative of [`smooth_l1`]: `sigma2 * v` in the quadratic regime,
/// `sign(v)` in the linear one.
#[must_use]
pub fn smooth_l1_grad(value: f64, sigma2: f64) -> f64 {
    if value.abs() < 1.0 / sigma2 {
        sigma2 * value
    } else {
        sign(value)
    }
}

pub fn smooth_l1_into(residual: &[f64], sigma2: f64, errors: &mut [f64]) -> Result<(), KernelError> {
    ensure_same_len("smooth_l1", residual.len(), errors.len())?;
    for (slot, value) in errors.iter_mut().zip(residual) {
        *slot = smooth_l1(*value, sigma2);
    }
    Ok(())
}

pub fn smooth_l1_grad_into(
    residual: &[f64],
    sigma2: f64,
    out: &mut [f64],
) -> Result<(), KernelError> {
    ensure_same_len("smooth_l1_grad", residual.len(), out.len())?;
    for (slot, value) in out.iter_mut().zip(residual) {
        *slot = smooth_l1_grad(*value, sigma2);
    }
    Ok(())
}

/// Nearest integer, ties rounded away from zero.
#[must_use]
pub fn round_half_away(value: f64) -> f64 {
    value.round()
}

pub fn round_into(input: &[f64], out: &mut [f64]) -> Result<(), KernelError> {
    ensure_same_len("round", input.len(), out.len())?;
    for (slot, value) in out.iter_mut().zip(input) {
        *slot = round_half_away(*value);
    }
    Ok(())
}

pub fn round_in_place(values: &mut [f64]) {
    for value in values.iter_mut() {
        *value = round_half_away(*value);
    }
}
