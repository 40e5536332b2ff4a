//! Weighted moment accumulation over a bounding box.
//!
//! For every pixel in the box the Gaussian exponent
//! `Q = x² w11 + 2xy w12 + y² w22` (with `x, y` relative to the current
//! center) selects the weight `exp(-Q/2)`. Pixels with negligible weight
//! are skipped outright. When the kernel is narrower than a pixel, pixels
//! near its effective edge are subdivided into a 4x4 sub-grid so the
//! steeply varying weight is sampled where it actually is, not just at the
//! pixel center.

use std::f64::consts::PI;

use thiserror::Error;

use crate::bbox::PixelBox;
use crate::image::SourceImage;
use crate::weights::MomentWeights;

/// Largest admissible weight-coefficient magnitude.
pub const MAX_WEIGHT: f64 = 1e6;

/// Exponent above which a pixel-centered sample is skipped.
const EXPONENT_CUTOFF: f64 = 14.0;

/// Corner-exponent bound selecting pixels for sub-grid accumulation.
const CORNER_CUTOFF: f64 = 9.0;

/// Offset from the pixel center to the outermost sub-grid sample.
const CORNER_OFFSET: f64 = 0.375;

/// Spacing of the 4x4 sub-grid samples.
const SUBGRID_STEP: f64 = 0.25;

/// Errors from moment accumulation.
#[derive(Error, Debug)]
pub enum MomentError {
    /// Weight coefficients outside the admissible magnitude range.
    #[error("invalid weight parameter(s): w11={w11:.6e}, w12={w12:.6e}, w22={w22:.6e}")]
    InvalidWeights {
        /// xx weight coefficient.
        w11: f64,
        /// xy weight coefficient.
        w12: f64,
        /// yy weight coefficient.
        w22: f64,
    },

    /// Bounding box not fully contained in the image.
    #[error(
        "region x=[{x0}, {x1}] y=[{y0}, {y1}] extends outside the {width}x{height} image"
    )]
    RegionOutOfBounds {
        /// Minimum column of the region.
        x0: i32,
        /// Maximum column of the region.
        x1: i32,
        /// Minimum row of the region.
        y0: i32,
        /// Maximum row of the region.
        y1: i32,
        /// Image width.
        width: usize,
        /// Image height.
        height: usize,
    },
}

/// Weighted pixel-intensity accumulations for one weighting kernel.
///
/// First moments (`sumx`, `sumy`) are accumulated in absolute local pixel
/// coordinates; second moments are relative to the accumulation center.
/// `sums4` is carried for interface compatibility and consumed nowhere in
/// this crate.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RawMoments {
    /// Sum of weighted intensities.
    pub sum: f64,
    /// Weighted first moment in x.
    pub sumx: f64,
    /// Weighted first moment in y.
    pub sumy: f64,
    /// Weighted second moment in xx.
    pub sumxx: f64,
    /// Weighted second moment in xy.
    pub sumxy: f64,
    /// Weighted second moment in yy.
    pub sumyy: f64,
    /// Weighted fourth-order term, `sum Q² w I`.
    pub sums4: f64,
}

impl RawMoments {
    /// Whether the accumulated signs describe a source of the expected
    /// polarity: `sum`, `sumxx` and `sumyy` jointly positive, or jointly
    /// negative when measuring a negative-going source.
    pub fn is_sign_consistent(&self, negative: bool) -> bool {
        if negative {
            self.sum < 0.0 && self.sumxx < 0.0 && self.sumyy < 0.0
        } else {
            self.sum > 0.0 && self.sumxx > 0.0 && self.sumyy > 0.0
        }
    }
}

fn validate<S: SourceImage>(
    image: &S,
    bbox: &PixelBox,
    weights: &MomentWeights,
) -> Result<(), MomentError> {
    if weights.w11 < 0.0
        || weights.w11 > MAX_WEIGHT
        || weights.w12.abs() > MAX_WEIGHT
        || weights.w22 < 0.0
        || weights.w22 > MAX_WEIGHT
    {
        return Err(MomentError::InvalidWeights {
            w11: weights.w11,
            w12: weights.w12,
            w22: weights.w22,
        });
    }
    if bbox.is_empty()
        || bbox.x0 < 0
        || bbox.x1 >= image.width() as i32
        || bbox.y0 < 0
        || bbox.y1 >= image.height() as i32
    {
        return Err(MomentError::RegionOutOfBounds {
            x0: bbox.x0,
            x1: bbox.x1,
            y0: bbox.y0,
            y1: bbox.y1,
            width: image.width(),
            height: image.height(),
        });
    }
    Ok(())
}

/// Peak amplitude of the best-fit Gaussian from the weighted sum.
///
/// The raw sum is normalized by `pi * sqrt(det)` of the weighting kernel's
/// covariance, obtained by inverting the weight coefficients back. Flat
/// weights have no covariance, so the amplitude is NaN there.
fn peak_amplitude(sum: f64, weights: &MomentWeights) -> f64 {
    match MomentWeights::from_covariance(weights.w11, weights.w12, weights.w22) {
        Some(inverse) => {
            let det_cov = inverse.w11 * inverse.w22 - inverse.w12 * inverse.w12;
            sum / (PI * det_cov.sqrt())
        }
        None => f64::NAN,
    }
}

/// Largest Gaussian exponent over the four sub-grid corners of a pixel.
fn max_corner_exponent(xl: f64, xh: f64, yl: f64, yh: f64, w: &MomentWeights) -> f64 {
    let mut expon = xl * xl * w.w11 + yl * yl * w.w22 + 2.0 * xl * yl * w.w12;
    expon = expon.max(xh * xh * w.w11 + yh * yh * w.w22 + 2.0 * xh * yh * w.w12);
    expon = expon.max(xl * xl * w.w11 + yh * yh * w.w22 + 2.0 * xl * yh * w.w12);
    expon.max(xh * xh * w.w11 + yl * yl * w.w22 + 2.0 * xh * yl * w.w12)
}

/// Accumulate weighted moments of a source up to second order.
///
/// # Arguments
/// * `image` - Pixel data
/// * `center` - Accumulation center `(x, y)` in local coordinates
/// * `bbox` - Region to accumulate over; must lie inside the image
/// * `bkgd` - Background level subtracted from every pixel
/// * `interpolate` - Sample a 4x4 sub-grid near the kernel edge
/// * `weights` - Weighting kernel coefficients
///
/// # Returns
/// The peak amplitude of the best-fit Gaussian and the raw moment sums.
/// Sign consistency of the sums is *not* checked here; see
/// [`RawMoments::is_sign_consistent`].
///
/// # Errors
/// [`MomentError::InvalidWeights`] for out-of-range weight magnitudes and
/// [`MomentError::RegionOutOfBounds`] when the box leaves the image.
pub fn accumulate<S: SourceImage>(
    image: &S,
    center: (f64, f64),
    bbox: &PixelBox,
    bkgd: f64,
    interpolate: bool,
    weights: &MomentWeights,
) -> Result<(f64, RawMoments), MomentError> {
    validate(image, bbox, weights)?;

    let (xcen, ycen) = center;
    let mut m = RawMoments::default();

    for iy in bbox.y0..=bbox.y1 {
        let y = iy as f64 - ycen;
        let y2 = y * y;
        let yl = y - CORNER_OFFSET;
        let yh = y + CORNER_OFFSET;
        for ix in bbox.x0..=bbox.x1 {
            let x = ix as f64 - xcen;
            if interpolate {
                let xl = x - CORNER_OFFSET;
                let xh = x + CORNER_OFFSET;
                if max_corner_exponent(xl, xh, yl, yh, weights) <= CORNER_CUTOFF {
                    let tmod = image.value(ix as usize, iy as usize) - bkgd;
                    for sy in 0..4 {
                        let sub_y = yl + sy as f64 * SUBGRID_STEP;
                        let sub_y2 = sub_y * sub_y;
                        for sx in 0..4 {
                            let sub_x = xl + sx as f64 * SUBGRID_STEP;
                            let sub_x2 = sub_x * sub_x;
                            let sub_xy = sub_x * sub_y;
                            let expon =
                                sub_x2 * weights.w11 + 2.0 * sub_xy * weights.w12 + sub_y2 * weights.w22;
                            let ymod = tmod * (-0.5 * expon).exp();
                            m.sum += ymod;
                            m.sumx += ymod * (sub_x + xcen);
                            m.sumy += ymod * (sub_y + ycen);
                            m.sumxx += sub_x2 * ymod;
                            m.sumxy += sub_xy * ymod;
                            m.sumyy += sub_y2 * ymod;
                            m.sums4 += expon * expon * ymod;
                        }
                    }
                }
            } else {
                let x2 = x * x;
                let xy = x * y;
                let expon = x2 * weights.w11 + 2.0 * xy * weights.w12 + y2 * weights.w22;
                if expon <= EXPONENT_CUTOFF {
                    let tmod = image.value(ix as usize, iy as usize) - bkgd;
                    let ymod = tmod * (-0.5 * expon).exp();
                    m.sum += ymod;
                    m.sumx += ymod * ix as f64;
                    m.sumy += ymod * iy as f64;
                    m.sumxx += x2 * ymod;
                    m.sumxy += xy * ymod;
                    m.sumyy += y2 * ymod;
                    m.sums4 += expon * expon * ymod;
                }
            }
        }
    }

    Ok((peak_amplitude(m.sum, weights), m))
}

/// Accumulate only the weighted intensity sum, skipping the moment terms.
///
/// Used by the fixed-moments flux estimator, which never needs centroid or
/// shape updates. Same validation and sampling rules as [`accumulate`].
pub fn accumulate_flux<S: SourceImage>(
    image: &S,
    center: (f64, f64),
    bbox: &PixelBox,
    bkgd: f64,
    interpolate: bool,
    weights: &MomentWeights,
) -> Result<f64, MomentError> {
    validate(image, bbox, weights)?;

    let (xcen, ycen) = center;
    let mut sum = 0.0;

    for iy in bbox.y0..=bbox.y1 {
        let y = iy as f64 - ycen;
        let y2 = y * y;
        let yl = y - CORNER_OFFSET;
        let yh = y + CORNER_OFFSET;
        for ix in bbox.x0..=bbox.x1 {
            let x = ix as f64 - xcen;
            if interpolate {
                let xl = x - CORNER_OFFSET;
                let xh = x + CORNER_OFFSET;
                if max_corner_exponent(xl, xh, yl, yh, weights) <= CORNER_CUTOFF {
                    let tmod = image.value(ix as usize, iy as usize) - bkgd;
                    for sy in 0..4 {
                        let sub_y = yl + sy as f64 * SUBGRID_STEP;
                        let sub_y2 = sub_y * sub_y;
                        for sx in 0..4 {
                            let sub_x = xl + sx as f64 * SUBGRID_STEP;
                            let expon = sub_x * sub_x * weights.w11
                                + 2.0 * sub_x * sub_y * weights.w12
                                + sub_y2 * weights.w22;
                            sum += tmod * (-0.5 * expon).exp();
                        }
                    }
                }
            } else {
                let expon = x * x * weights.w11 + 2.0 * x * y * weights.w12 + y2 * weights.w22;
                if expon <= EXPONENT_CUTOFF {
                    sum += (image.value(ix as usize, iy as usize) - bkgd) * (-0.5 * expon).exp();
                }
            }
        }
    }

    Ok(sum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Exposure;
    use approx::assert_relative_eq;
    use ndarray::Array2;

    /// Render a pixel-sampled elliptical Gaussian.
    fn gaussian_image(
        size: usize,
        center: (f64, f64),
        amplitude: f64,
        xx: f64,
        yy: f64,
        xy: f64,
    ) -> Array2<f64> {
        let det = xx * yy - xy * xy;
        let mut image = Array2::<f64>::zeros((size, size));
        for iy in 0..size {
            for ix in 0..size {
                let dx = ix as f64 - center.0;
                let dy = iy as f64 - center.1;
                let q = (dx * dx * yy - 2.0 * dx * dy * xy + dy * dy * xx) / det;
                image[[iy, ix]] = amplitude * (-0.5 * q).exp();
            }
        }
        image
    }

    #[test]
    fn test_flat_image_sums_to_zero() {
        let image = Array2::<f64>::zeros((21, 21));
        let exposure = Exposure::new(image.view());
        let weights = MomentWeights::from_covariance(1.5, 0.0, 1.5).unwrap();
        let bbox = PixelBox::from_corners(0, 0, 20, 20);

        let (_, m) = accumulate(&exposure, (10.0, 10.0), &bbox, 0.0, false, &weights).unwrap();
        assert_eq!(m.sum, 0.0);
        assert_eq!(m.sumxx, 0.0);
        assert!(!m.is_sign_consistent(false));
        assert!(!m.is_sign_consistent(true));
    }

    #[test]
    fn test_gaussian_moments_match_product_covariance() {
        // Weighting a sigma^2 = 4 Gaussian with a matching kernel halves
        // the measured covariance (product of two equal Gaussians).
        let image = gaussian_image(41, (20.0, 20.0), 1000.0, 4.0, 4.0, 0.0);
        let exposure = Exposure::new(image.view());
        let weights = MomentWeights::from_covariance(4.0, 0.0, 4.0).unwrap();
        let bbox = PixelBox::from_corners(0, 0, 40, 40);

        let (i0, m) = accumulate(&exposure, (20.0, 20.0), &bbox, 0.0, false, &weights).unwrap();
        assert!(m.is_sign_consistent(false));
        assert_relative_eq!(m.sumxx / m.sum, 2.0, max_relative = 1e-2);
        assert_relative_eq!(m.sumyy / m.sum, 2.0, max_relative = 1e-2);
        assert_relative_eq!(m.sumxy / m.sum, 0.0, epsilon = 1e-6);
        // Centroid from absolute first moments
        assert_relative_eq!(m.sumx / m.sum, 20.0, epsilon = 1e-9);
        assert_relative_eq!(m.sumy / m.sum, 20.0, epsilon = 1e-9);
        // Peak amplitude estimate recovers the rendered amplitude
        assert_relative_eq!(i0, 1000.0, max_relative = 1e-2);
    }

    #[test]
    fn test_background_subtraction() {
        let mut image = gaussian_image(41, (20.0, 20.0), 1000.0, 4.0, 4.0, 0.0);
        image += 50.0;
        let exposure = Exposure::new(image.view());
        let weights = MomentWeights::from_covariance(4.0, 0.0, 4.0).unwrap();
        let bbox = PixelBox::from_corners(0, 0, 40, 40);

        let (i0, m) = accumulate(&exposure, (20.0, 20.0), &bbox, 50.0, false, &weights).unwrap();
        assert_relative_eq!(m.sumxx / m.sum, 2.0, max_relative = 1e-2);
        assert_relative_eq!(i0, 1000.0, max_relative = 1e-2);
    }

    #[test]
    fn test_invalid_weights_rejected() {
        let image = Array2::<f64>::zeros((5, 5));
        let exposure = Exposure::new(image.view());
        let bbox = PixelBox::from_corners(0, 0, 4, 4);

        let negative = MomentWeights {
            w11: -1.0,
            w12: 0.0,
            w22: 1.0,
            det: 1.0,
        };
        let oversized = MomentWeights {
            w11: 1.0,
            w12: 2e6,
            w22: 1.0,
            det: 1.0,
        };
        for weights in [negative, oversized] {
            let result = accumulate(&exposure, (2.0, 2.0), &bbox, 0.0, false, &weights);
            assert!(matches!(result, Err(MomentError::InvalidWeights { .. })));
        }
    }

    #[test]
    fn test_region_out_of_bounds_rejected() {
        let image = Array2::<f64>::zeros((5, 5));
        let exposure = Exposure::new(image.view());
        let weights = MomentWeights::from_covariance(1.5, 0.0, 1.5).unwrap();

        for bbox in [
            PixelBox::from_corners(-1, 0, 4, 4),
            PixelBox::from_corners(0, 0, 5, 4),
            PixelBox::from_corners(0, -2, 4, 4),
            PixelBox::from_corners(0, 0, 4, 5),
            PixelBox::empty(),
        ] {
            let result = accumulate(&exposure, (2.0, 2.0), &bbox, 0.0, false, &weights);
            assert!(
                matches!(result, Err(MomentError::RegionOutOfBounds { .. })),
                "box {:?} should be rejected",
                bbox
            );
        }
    }

    #[test]
    fn test_negative_mode_sign_convention() {
        let mut image = gaussian_image(41, (20.0, 20.0), 1000.0, 4.0, 4.0, 0.0);
        image.mapv_inplace(|v| -v);
        let exposure = Exposure::new(image.view());
        let weights = MomentWeights::from_covariance(4.0, 0.0, 4.0).unwrap();
        let bbox = PixelBox::from_corners(0, 0, 40, 40);

        let (i0, m) = accumulate(&exposure, (20.0, 20.0), &bbox, 0.0, false, &weights).unwrap();
        assert!(m.is_sign_consistent(true));
        assert!(!m.is_sign_consistent(false));
        assert!(i0 < 0.0);
    }

    #[test]
    fn test_flux_only_matches_full_sum() {
        let image = gaussian_image(41, (20.0, 20.0), 500.0, 2.5, 3.5, 0.5);
        let exposure = Exposure::new(image.view());
        let weights = MomentWeights::from_covariance(2.5, 0.5, 3.5).unwrap();
        let bbox = PixelBox::from_corners(0, 0, 40, 40);

        for interpolate in [false, true] {
            let (_, m) =
                accumulate(&exposure, (20.0, 20.0), &bbox, 0.0, interpolate, &weights).unwrap();
            let sum =
                accumulate_flux(&exposure, (20.0, 20.0), &bbox, 0.0, interpolate, &weights).unwrap();
            assert_relative_eq!(sum, m.sum, max_relative = 1e-12);
        }
    }

    #[test]
    fn test_interpolated_second_moments_consistent() {
        // For a kernel near the interpolation threshold, sub-grid sampling
        // must agree with pixel-centered sampling on the moment *ratios*.
        let image = gaussian_image(31, (15.0, 15.0), 1000.0, 0.8, 0.8, 0.0);
        let exposure = Exposure::new(image.view());
        let weights = MomentWeights::from_covariance(0.8, 0.0, 0.8).unwrap();
        let bbox = PixelBox::from_corners(5, 5, 25, 25);

        let (_, plain) = accumulate(&exposure, (15.0, 15.0), &bbox, 0.0, false, &weights).unwrap();
        let (_, interp) = accumulate(&exposure, (15.0, 15.0), &bbox, 0.0, true, &weights).unwrap();

        assert_relative_eq!(
            interp.sumxx / interp.sum,
            plain.sumxx / plain.sum,
            max_relative = 0.05
        );
        assert_relative_eq!(
            interp.sumx / interp.sum,
            plain.sumx / plain.sum,
            epsilon = 1e-3
        );
    }

    #[test]
    fn test_flat_weights_count_every_pixel() {
        let mut image = Array2::<f64>::zeros((5, 5));
        image.fill(2.0);
        let exposure = Exposure::new(image.view());
        let bbox = PixelBox::from_corners(0, 0, 4, 4);

        let (i0, m) =
            accumulate(&exposure, (2.0, 2.0), &bbox, 0.0, false, &MomentWeights::flat()).unwrap();
        assert_relative_eq!(m.sum, 50.0);
        // No kernel covariance exists for flat weights
        assert!(i0.is_nan());
    }
}
