//! Read-only pixel access for measurement algorithms.
//!
//! The numeric core is written against the [`SourceImage`] trait rather
//! than a concrete pixel container, so the same accumulation loops serve
//! plain images and images carrying a per-pixel variance plane.

use ndarray::ArrayView2;
use thiserror::Error;

/// Errors constructing an [`Exposure`].
#[derive(Error, Debug)]
pub enum ExposureError {
    /// Variance plane dimensions do not match the image plane.
    #[error("variance plane {variance:?} does not match image plane {image:?}")]
    VarianceDimensionMismatch {
        /// Image dimensions as (rows, cols).
        image: (usize, usize),
        /// Variance dimensions as (rows, cols).
        variance: (usize, usize),
    },
}

/// Read-only access to pixel values and optional per-pixel variance.
///
/// Coordinates are local: `(0, 0)` is the first pixel of the backing
/// array regardless of the exposure's origin offset. Callers are expected
/// to stay within `width() x height()`; implementations may panic on
/// out-of-range access, so bounds are validated before any pixel loop.
pub trait SourceImage {
    /// Number of columns.
    fn width(&self) -> usize;

    /// Number of rows.
    fn height(&self) -> usize;

    /// Offset of the local origin in parent coordinates, `(x0, y0)`.
    fn origin(&self) -> (i32, i32);

    /// Pixel value at local coordinates `(x, y)`.
    fn value(&self, x: usize, y: usize) -> f64;

    /// Per-pixel variance at local coordinates `(x, y)`, if available.
    fn variance(&self, x: usize, y: usize) -> Option<f64>;

    /// Whether a variance plane exists.
    fn has_variance(&self) -> bool;
}

/// An image view plus optional variance plane and parent-coordinate origin.
#[derive(Debug, Clone)]
pub struct Exposure<'a> {
    image: ArrayView2<'a, f64>,
    variance: Option<ArrayView2<'a, f64>>,
    x0: i32,
    y0: i32,
}

impl<'a> Exposure<'a> {
    /// Wrap an image view with no variance plane and origin `(0, 0)`.
    pub fn new(image: ArrayView2<'a, f64>) -> Self {
        Self {
            image,
            variance: None,
            x0: 0,
            y0: 0,
        }
    }

    /// Attach a variance plane of matching dimensions.
    pub fn with_variance(mut self, variance: ArrayView2<'a, f64>) -> Result<Self, ExposureError> {
        if variance.dim() != self.image.dim() {
            return Err(ExposureError::VarianceDimensionMismatch {
                image: self.image.dim(),
                variance: variance.dim(),
            });
        }
        self.variance = Some(variance);
        Ok(self)
    }

    /// Set the parent-coordinate origin of the exposure.
    pub fn with_origin(mut self, x0: i32, y0: i32) -> Self {
        self.x0 = x0;
        self.y0 = y0;
        self
    }
}

impl SourceImage for Exposure<'_> {
    fn width(&self) -> usize {
        self.image.ncols()
    }

    fn height(&self) -> usize {
        self.image.nrows()
    }

    fn origin(&self) -> (i32, i32) {
        (self.x0, self.y0)
    }

    fn value(&self, x: usize, y: usize) -> f64 {
        self.image[[y, x]]
    }

    fn variance(&self, x: usize, y: usize) -> Option<f64> {
        self.variance.as_ref().map(|v| v[[y, x]])
    }

    fn has_variance(&self) -> bool {
        self.variance.is_some()
    }
}

/// Convert a floating-point position to the index of the pixel containing
/// it (pixel `i` covers `[i - 0.5, i + 0.5)`).
pub fn position_to_index(position: f64) -> i32 {
    (position + 0.5).floor() as i32
}
