//! Integer pixel bounding boxes in local image coordinates.
//!
//! Boxes use inclusive corners, matching the accumulation loops that visit
//! every pixel from `(x0, y0)` to `(x1, y1)`. A box with `x1 < x0` or
//! `y1 < y0` is empty.

/// Axis-aligned pixel bounding box with inclusive corners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelBox {
    /// Minimum column (x) coordinate.
    pub x0: i32,
    /// Minimum row (y) coordinate.
    pub y0: i32,
    /// Maximum column (x) coordinate, inclusive.
    pub x1: i32,
    /// Maximum row (y) coordinate, inclusive.
    pub y1: i32,
}

impl PixelBox {
    /// Create an empty box.
    pub fn empty() -> Self {
        Self {
            x0: 0,
            y0: 0,
            x1: -1,
            y1: -1,
        }
    }

    /// Create a box from inclusive corner coordinates.
    pub fn from_corners(x0: i32, y0: i32, x1: i32, y1: i32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    /// Create the smallest box containing a disc of the given radius
    /// around a (possibly sub-pixel) center.
    pub fn from_center_radius(x: f64, y: f64, radius: f64) -> Self {
        Self {
            x0: (x - radius).floor() as i32,
            y0: (y - radius).floor() as i32,
            x1: (x + radius).ceil() as i32,
            y1: (y + radius).ceil() as i32,
        }
    }

    /// The full extent of an image with the given dimensions.
    pub fn image_bounds(width: usize, height: usize) -> Self {
        Self {
            x0: 0,
            y0: 0,
            x1: width as i32 - 1,
            y1: height as i32 - 1,
        }
    }

    /// Intersect this box with another, producing the overlapping region
    /// (empty when they do not overlap).
    pub fn clipped_to(&self, other: &Self) -> Self {
        Self {
            x0: self.x0.max(other.x0),
            y0: self.y0.max(other.y0),
            x1: self.x1.min(other.x1),
            y1: self.y1.min(other.y1),
        }
    }

    /// True when the box contains no pixels.
    pub fn is_empty(&self) -> bool {
        self.x1 < self.x0 || self.y1 < self.y0
    }

    /// Number of columns spanned (zero when empty).
    pub fn width(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            (self.x1 - self.x0 + 1) as usize
        }
    }

    /// Number of rows spanned (zero when empty).
    pub fn height(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            (self.y1 - self.y0 + 1) as usize
        }
    }

    /// True when the pixel `(x, y)` lies inside the box.
    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x0 && x <= self.x1 && y >= self.y0 && y <= self.y1
    }
}

/// Maximum radius (in pixels) of the region examined around a source.
pub const MAX_MOMENT_RADIUS: f64 = 1000.0;

/// Bounding box for moment accumulation around a source.
///
/// The radius is four times the larger weighting sigma, capped at
/// [`MAX_MOMENT_RADIUS`] and clipped to the image extent. Works in local
/// image coordinates.
///
/// # Arguments
/// * `center` - Current centroid estimate `(x, y)` in local coordinates
/// * `sigma11` - xx second moment of the weighting function
/// * `sigma22` - yy second moment of the weighting function
/// * `width`, `height` - Image dimensions
pub fn adaptive_moments_box(
    center: (f64, f64),
    sigma11: f64,
    sigma22: f64,
    width: usize,
    height: usize,
) -> PixelBox {
    let radius = (4.0 * sigma11.max(sigma22).sqrt()).min(MAX_MOMENT_RADIUS);
    PixelBox::from_center_radius(center.0, center.1, radius)
        .clipped_to(&PixelBox::image_bounds(width, height))
}
