#![forbid(unsafe_code)]

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_BLOB_ID: AtomicU64 = AtomicU64::new(1);

/// Blobs address at most (num, channels, height, width).
pub const MAX_BLOB_AXES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Strict,
    Hardened,
}

/// Row-major shape of a [`Blob`] with legacy 4-D accessors.
///
/// Axes past the stored rank read as 1, so a scalar shape `[]` behaves like
/// `(1, 1, 1, 1)` and has a count of one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct BlobShape {
    dims: Vec<usize>,
}

impl BlobShape {
    #[must_use]
    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    pub fn new(dims: Vec<usize>) -> Result<Self, BlobError> {
        if dims.len() > MAX_BLOB_AXES {
            return Err(BlobError::TooManyAxes {
                axes: dims.len(),
                max: MAX_BLOB_AXES,
            });
        }
        Ok(Self { dims })
    }

    #[must_use]
    pub fn nchw(num: usize, channels: usize, height: usize, width: usize) -> Self {
        Self {
            dims: vec![num, channels, height, width],
        }
    }

    #[must_use]
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    #[must_use]
    pub fn legacy_dim(&self, axis: usize) -> usize {
        self.dims.get(axis).copied().unwrap_or(1)
    }

    #[must_use]
    pub fn num(&self) -> usize {
        self.legacy_dim(0)
    }

    #[must_use]
    pub fn channels(&self) -> usize {
        self.legacy_dim(1)
    }

    #[must_use]
    pub fn height(&self) -> usize {
        self.legacy_dim(2)
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.legacy_dim(3)
    }

    #[must_use]
    pub fn count(&self) -> usize {
        if self.dims.is_empty() {
            return 1;
        }
        self.dims.iter().copied().product()
    }

    /// (channels, height, width): everything except the batch axis.
    #[must_use]
    pub fn geometry(&self) -> [usize; 3] {
        [self.channels(), self.height(), self.width()]
    }

    #[must_use]
    pub fn same_geometry(&self, other: &Self) -> bool {
        self.geometry() == other.geometry()
    }

    #[must_use]
    pub fn fingerprint64(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.dims.hash(&mut hasher);
        hasher.finish()
    }
}

impl fmt::Display for BlobShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims = self
            .dims
            .iter()
            .map(usize::to_string)
            .collect::<Vec<_>>()
            .join(",");
        write!(f, "({dims})")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobError {
    TooManyAxes { axes: usize, max: usize },
    LengthMismatch { expected: usize, actual: usize },
}

impl fmt::Display for BlobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooManyAxes { axes, max } => {
                write!(f, "blob shape has {axes} axes, at most {max} are supported")
            }
            Self::LengthMismatch { expected, actual } => {
                write!(
                    f,
                    "blob buffer length mismatch: expected={expected}, actual={actual}"
                )
            }
        }
    }
}

impl std::error::Error for BlobError {}

/// Dense `f64` tensor holding a value buffer and a same-sized gradient buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Blob {
    id: u64,
    shape: BlobShape,
    data: Vec<f64>,
    diff: Vec<f64>,
    version: u64,
}

impl Blob {
    #[must_use]
    pub fn new(shape: BlobShape) -> Self {
        Self::filled(shape, 0.0)
    }

    #[must_use]
    pub fn filled(shape: BlobShape, value: f64) -> Self {
        let count = shape.count();
        Self {
            id: NEXT_BLOB_ID.fetch_add(1, Ordering::Relaxed),
            shape,
            data: vec![value; count],
            diff: vec![0.0; count],
            version: 0,
        }
    }

    pub fn from_data(shape: BlobShape, data: Vec<f64>) -> Result<Self, BlobError> {
        let expected = shape.count();
        if data.len() != expected {
            return Err(BlobError::LengthMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            id: NEXT_BLOB_ID.fetch_add(1, Ordering::Relaxed),
            shape,
            diff: vec![0.0; expected],
            data,
            version: 0,
        })
    }

    /// Resizes both buffers to `shape`. Surviving elements keep their
    /// values; new elements start at zero.
    pub fn reshape(&mut self, shape: BlobShape) {
        let count = shape.count();
        self.data.resize(count, 0.0);
        self.diff.resize(count, 0.0);
        self.shape = shape;
        self.version = self.version.saturating_add(1);
    }

    pub fn reshape_like(&mut self, other: &Blob) {
        self.reshape(other.shape.clone());
    }

    pub fn set_data(&mut self, data: Vec<f64>) -> Result<(), BlobError> {
        if data.len() != self.data.len() {
            return Err(BlobError::LengthMismatch {
                expected: self.data.len(),
                actual: data.len(),
            });
        }
        self.data = data;
        self.version = self.version.saturating_add(1);
        Ok(())
    }

    pub fn fill_data(&mut self, value: f64) {
        self.data.fill(value);
        self.version = self.version.saturating_add(1);
    }

    pub fn fill_diff(&mut self, value: f64) {
        self.diff.fill(value);
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn shape(&self) -> &BlobShape {
        &self.shape
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn num(&self) -> usize {
        self.shape.num()
    }

    #[must_use]
    pub fn channels(&self) -> usize {
        self.shape.channels()
    }

    #[must_use]
    pub fn height(&self) -> usize {
        self.shape.height()
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.shape.width()
    }

    #[must_use]
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f64] {
        self.version = self.version.saturating_add(1);
        &mut self.data
    }

    #[must_use]
    pub fn diff(&self) -> &[f64] {
        &self.diff
    }

    pub fn diff_mut(&mut self) -> &mut [f64] {
        &mut self.diff
    }

    /// Borrows the value buffer for reading and the gradient buffer for
    /// writing at the same time.
    pub fn data_and_diff_mut(&mut self) -> (&[f64], &mut [f64]) {
        (&self.data, &mut self.diff)
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub fn evidence_fingerprint64(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.id.hash(&mut hasher);
        self.version.hash(&mut hasher);
        self.shape.fingerprint64().hash(&mut hasher);
        for value in &self.data {
            value.to_bits().hash(&mut hasher);
        }
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{Blob, BlobError, BlobShape, MAX_BLOB_AXES};

    #[test]
    fn scalar_shape_has_unit_count_and_legacy_axes() {
        let shape = BlobShape::scalar();
        assert_eq!(shape.count(), 1);
        assert!(shape.dims().is_empty());
        assert_eq!(shape.geometry(), [1, 1, 1]);
        assert_eq!(shape.num(), 1);
    }

    #[test]
    fn nchw_shape_reports_each_axis() {
        let shape = BlobShape::nchw(2, 4, 3, 5);
        assert_eq!(shape.num(), 2);
        assert_eq!(shape.channels(), 4);
        assert_eq!(shape.height(), 3);
        assert_eq!(shape.width(), 5);
        assert_eq!(shape.count(), 120);
        assert_eq!(shape.to_string(), "(2,4,3,5)");
    }

    #[test]
    fn short_shapes_pad_missing_axes_with_one() {
        let shape = BlobShape::new(vec![3, 2]).expect("rank two shape is valid");
        assert_eq!(shape.geometry(), [2, 1, 1]);
        assert_eq!(shape.count(), 6);
    }

    #[test]
    fn geometry_ignores_batch_axis() {
        let lhs = BlobShape::nchw(1, 4, 2, 2);
        let rhs = BlobShape::nchw(8, 4, 2, 2);
        let wider = BlobShape::nchw(1, 4, 2, 3);
        assert!(lhs.same_geometry(&rhs));
        assert!(!lhs.same_geometry(&wider));
    }

    #[test]
    fn five_axes_are_rejected() {
        let err = BlobShape::new(vec![1; MAX_BLOB_AXES + 1]).expect_err("rank 5 must fail");
        assert_eq!(err, BlobError::TooManyAxes { axes: 5, max: 4 });
    }

    #[test]
    fn from_data_rejects_wrong_length() {
        let err = Blob::from_data(BlobShape::nchw(1, 1, 1, 3), vec![1.0, 2.0])
            .expect_err("length mismatch must fail");
        assert_eq!(
            err,
            BlobError::LengthMismatch {
                expected: 3,
                actual: 2
            }
        );
    }

    #[test]
    fn reshape_resizes_both_buffers() {
        let mut blob = Blob::from_data(BlobShape::nchw(1, 1, 1, 2), vec![3.0, 4.0])
            .expect("blob should build");
        blob.reshape(BlobShape::nchw(1, 1, 2, 2));
        assert_eq!(blob.count(), 4);
        assert_eq!(blob.data(), &[3.0, 4.0, 0.0, 0.0]);
        assert_eq!(blob.diff().len(), 4);

        blob.reshape(BlobShape::scalar());
        assert_eq!(blob.data(), &[3.0]);
        assert_eq!(blob.diff().len(), 1);
    }

    #[test]
    fn reshape_like_copies_shape_not_values() {
        let source = Blob::filled(BlobShape::nchw(2, 1, 1, 2), 7.0);
        let mut target = Blob::new(BlobShape::scalar());
        target.reshape_like(&source);
        assert_eq!(target.shape(), source.shape());
        assert!(target.data().iter().all(|value| *value == 0.0));
    }

    #[test]
    fn mutation_bumps_version_and_fingerprint() {
        let mut blob = Blob::filled(BlobShape::nchw(1, 1, 1, 2), 1.0);
        let before = blob.evidence_fingerprint64();
        blob.data_mut()[0] = 5.0;
        assert_eq!(blob.version(), 1);
        assert_ne!(before, blob.evidence_fingerprint64());
    }

    #[test]
    fn set_data_guards_length() {
        let mut blob = Blob::new(BlobShape::nchw(1, 1, 1, 2));
        assert!(blob.set_data(vec![1.0, 2.0]).is_ok());
        assert!(matches!(
            blob.set_data(vec![1.0]),
            Err(BlobError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn distinct_blobs_get_distinct_ids() {
        let a = Blob::new(BlobShape::scalar());
        let b = Blob::new(BlobShape::scalar());
        assert_ne!(a.id(), b.id());
    }

    proptest! {
        #[test]
        fn prop_count_matches_buffer_lengths(dims in prop::collection::vec(1usize..=5, 0..=4)) {
            let shape = BlobShape::new(dims.clone()).expect("rank <= 4 is valid");
            let blob = Blob::new(shape.clone());
            let expected: usize = dims.iter().copied().product();
            prop_assert_eq!(shape.count(), expected);
            prop_assert_eq!(blob.data().len(), expected);
            prop_assert_eq!(blob.diff().len(), expected);
        }

        #[test]
        fn prop_geometry_is_batch_invariant(
            num_a in 1usize..=8,
            num_b in 1usize..=8,
            c in 1usize..=4,
            h in 1usize..=4,
            w in 1usize..=4,
        ) {
            let a = BlobShape::nchw(num_a, c, h, w);
            let b = BlobShape::nchw(num_b, c, h, w);
            prop_assert!(a.same_geometry(&b));
        }
    }
}
