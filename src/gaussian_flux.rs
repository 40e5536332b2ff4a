//! Flux through a fixed elliptical Gaussian weight.
//!
//! Unlike the adaptive estimator, the weighting kernel here is supplied by
//! the caller (typically a shape measured earlier, or the PSF model shape)
//! and is never re-estimated. The weighted sum is doubled to reconcile the
//! matched-filter normalization with the integrated-flux definition: for a
//! Gaussian source weighted by its own shape, twice the weighted sum is
//! the total flux.

use std::f64::consts::PI;

use thiserror::Error;

use crate::bbox::adaptive_moments_box;
use crate::image::SourceImage;
use crate::moments::{accumulate_flux, MomentError};
use crate::results::{FluxEstimate, Quadrupole};
use crate::weights::{should_interpolate, MomentWeights};

/// Errors from the fixed-moments flux measurement.
#[derive(Error, Debug)]
pub enum FluxError {
    /// The supplied shape cannot be inverted into a weighting kernel.
    #[error("input shape is singular: xx={xx:.6e}, yy={yy:.6e}, xy={xy:.6e}")]
    SingularShape {
        /// xx component of the supplied shape.
        xx: f64,
        /// yy component of the supplied shape.
        yy: f64,
        /// xy component of the supplied shape.
        xy: f64,
    },

    /// The measurement center lies outside the image.
    #[error("center ({x:.1}, {y:.1}) not in image ({width}x{height})")]
    CenterOutOfBounds {
        /// Local column coordinate of the center.
        x: f64,
        /// Local row coordinate of the center.
        y: f64,
        /// Image width.
        width: usize,
        /// Image height.
        height: usize,
    },

    /// Moment accumulation failed.
    #[error(transparent)]
    Moments(#[from] MomentError),
}

/// Measure the flux of a source through a fixed Gaussian weight.
///
/// A pure function of its inputs: repeated calls with identical arguments
/// produce identical results.
///
/// # Arguments
/// * `image` - Pixel data (variance plane optional)
/// * `shape` - Second-moment tensor defining the weighting kernel
/// * `center` - Source position in parent coordinates
///
/// # Returns
/// The instrumental flux, with an uncertainty when the image carries a
/// variance plane (NaN otherwise).
///
/// # Errors
/// [`FluxError::SingularShape`] when the shape has no usable inverse,
/// [`FluxError::CenterOutOfBounds`] when the center is off the image, and
/// [`FluxError::Moments`] for accumulation failures.
pub fn compute_fixed_moments_flux<S: SourceImage>(
    image: &S,
    shape: &Quadrupole,
    center: (f64, f64),
) -> Result<FluxEstimate, FluxError> {
    let (x0, y0) = image.origin();
    let local = (center.0 - x0 as f64, center.1 - y0 as f64);

    let ix = local.0 as i32;
    let iy = local.1 as i32;
    if !local.0.is_finite()
        || !local.1.is_finite()
        || ix < 0
        || ix >= image.width() as i32
        || iy < 0
        || iy >= image.height() as i32
    {
        return Err(FluxError::CenterOutOfBounds {
            x: local.0,
            y: local.1,
            width: image.width(),
            height: image.height(),
        });
    }

    let bbox = adaptive_moments_box(local, shape.xx, shape.yy, image.width(), image.height());

    let weights = MomentWeights::from_covariance(shape.xx, shape.xy, shape.yy).ok_or(
        FluxError::SingularShape {
            xx: shape.xx,
            yy: shape.yy,
            xy: shape.xy,
        },
    )?;
    let interpolate = should_interpolate(shape.xx, shape.yy, weights.det);

    let sum = accumulate_flux(image, local, &bbox, 0.0, interpolate, &weights)?;

    let mut result = FluxEstimate {
        inst_flux: 2.0 * sum,
        inst_flux_err: f64::NAN,
    };

    if let Some(variance) = image.variance(ix as usize, iy as usize) {
        // Zeroth-moment error is sqrt(var / wArea); the flux scaling by
        // 2 * wArea turns it into 2 * sqrt(var * wArea).
        let weighted_area = PI * shape.determinant().sqrt();
        result.inst_flux_err = 2.0 * (variance * weighted_area).sqrt();
    }

    Ok(result)
}
