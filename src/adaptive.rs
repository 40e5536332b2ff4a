//! Adaptive (Gaussian-weighted) moment estimation.
//!
//! The estimator alternates between measuring weighted moments of the
//! source and re-deriving the weighting kernel from those moments. The
//! update uses the product-of-Gaussians identity: the weighted object is
//! the product of the true object and the kernel, so their precision
//! matrices add. Subtracting the kernel precision from the measured
//! precision estimates the object covariance, which becomes the next
//! kernel. At the fixed point the kernel matches the object and the
//! moments are the maximum-likelihood elliptical Gaussian fit.
//!
//! The iteration can fail in several distinct ways (singular kernel,
//! wrong-sign sums, a bimodal source breaking the Gaussian-product
//! assumption); all of these fall back to plain unweighted moments and
//! are reported through [`ShapeFlag`]s rather than errors. Only an
//! internal inconsistency (a degenerate result with no flag raised)
//! surfaces as a hard error.

use std::f64::consts::TAU;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bbox::{adaptive_moments_box, PixelBox};
use crate::fisher::propagate_errors;
use crate::flags::ShapeFlag;
use crate::image::{position_to_index, SourceImage};
use crate::moments::{accumulate, MomentError, RawMoments};
use crate::results::AdaptiveMomentsResult;
use crate::weights::{should_interpolate, MomentWeights};

/// Tolerance on the relative non-degeneracy margin `xx*yy > (1+eps)*xy²`.
const DEGENERACY_EPSILON: f64 = 1.0e-6;

/// Configuration of the adaptive-moments measurement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveMomentsConfig {
    /// Additional background level to subtract from every pixel.
    pub background: f64,
    /// Maximum number of weight-update iterations.
    pub max_iter: usize,
    /// Maximum allowed centroid shift in pixels; clamped into `[2, 10]`
    /// at measurement time.
    pub max_shift: f64,
    /// Convergence tolerance on the ellipticity parameters e1 and e2.
    pub tol1: f64,
    /// Convergence tolerance on the relative change of the xx moment.
    pub tol2: f64,
    /// Also measure the PSF model shape at the source position.
    pub do_measure_psf: bool,
}

impl Default for AdaptiveMomentsConfig {
    fn default() -> Self {
        Self {
            background: 0.0,
            max_iter: 100,
            max_shift: 0.0,
            tol1: 1.0e-5,
            tol2: 1.0e-4,
            do_measure_psf: true,
        }
    }
}

/// Hard failures of the adaptive-moments measurement.
///
/// Data-quality problems never appear here; they are reported through the
/// flag set on the result. An error from this enum means the estimator
/// itself misbehaved.
#[derive(Error, Debug)]
pub enum AdaptiveMomentsError {
    /// A result claimed success while carrying degenerate second moments.
    #[error(
        "singular moments (xx*yy={xx_yy:.6e} <= (1+{epsilon:.0e})*xy^2={xy_sq:.6e}) \
         without any failure flag set"
    )]
    InconsistentMoments {
        /// Product of the diagonal moments.
        xx_yy: f64,
        /// Squared cross moment.
        xy_sq: f64,
        /// Relative margin used by the check.
        epsilon: f64,
    },
}

/// Measure adaptive moments of the source at `center` (parent coords).
///
/// Runs the weighted-moment iteration, falling back to unweighted moments
/// when the adaptive scheme breaks down, then converts the fitted
/// amplitude to an integrated flux and propagates errors from the
/// background variance when one is available. `negative` selects sources
/// that are darker than the background.
///
/// The returned result always carries flags describing any problem; see
/// [`ShapeFlag`]. The only `Err` outcome is
/// [`AdaptiveMomentsError::InconsistentMoments`], which indicates an
/// internal logic error rather than bad data.
pub fn compute_adaptive_moments<S: SourceImage>(
    image: &S,
    center: (f64, f64),
    negative: bool,
    config: &AdaptiveMomentsConfig,
) -> Result<AdaptiveMomentsResult, AdaptiveMomentsError> {
    let (x0, y0) = image.origin();
    let xcen = center.0 - x0 as f64;
    let ycen = center.1 - y0 as f64;

    // The shift limit affects convergence behavior; out-of-range
    // configured values are pinned rather than honored.
    let shiftmax = config.max_shift.clamp(2.0, 10.0);

    let mut result = AdaptiveMomentsResult::new();
    let ok = match estimate_adaptive_moments(
        image,
        config.background,
        xcen,
        ycen,
        shiftmax,
        config.max_iter,
        config.tol1,
        config.tol2,
        negative,
        &mut result,
    ) {
        Ok(ok) => ok,
        Err(err) => {
            log::debug!("adaptive moments at ({xcen:.1}, {ycen:.1}) failed: {err}");
            false
        }
    };
    if !ok {
        result.flags.set(ShapeFlag::Failure);
    }
    if result.flags.get(ShapeFlag::Unweighted) || result.flags.get(ShapeFlag::Shift) {
        // Quality failures: values exist but cannot be trusted.
        result.flags.set(ShapeFlag::Failure);
    }

    let xx_yy = result.shape.xx * result.shape.yy;
    let xy_sq = result.shape.xy * result.shape.xy;
    if xx_yy < (1.0 + DEGENERACY_EPSILON) * xy_sq && !result.flags.get(ShapeFlag::Failure) {
        return Err(AdaptiveMomentsError::InconsistentMoments {
            xx_yy,
            xy_sq,
            epsilon: DEGENERACY_EPSILON,
        });
    }

    // The iteration estimates the *peak* amplitude of the best-fit
    // Gaussian; multiplying by the inverse of the Gaussian normalization
    // (twice the ellipse area) yields the integrated flux.
    let flux_scale = TAU * (xx_yy - xy_sq).sqrt();
    result.flux.inst_flux *= flux_scale;
    result.flux.inst_flux_err *= flux_scale;
    result.centroid.x += x0 as f64;
    result.centroid.y += y0 as f64;
    if image.has_variance() {
        result.flux_xx_cov *= flux_scale;
        result.flux_yy_cov *= flux_scale;
        result.flux_xy_cov *= flux_scale;
    }

    Ok(result)
}

/// The workhorse: iterate weighted moments in local coordinates.
///
/// Returns `Ok(false)` when the measurement failed in a way already
/// recorded in `result.flags`; the caller derives the umbrella failure
/// flag from the return value.
#[allow(clippy::too_many_arguments)]
fn estimate_adaptive_moments<S: SourceImage>(
    image: &S,
    bkgd: f64,
    xcen: f64,
    ycen: f64,
    shiftmax: f64,
    max_iter: usize,
    tol1: f64,
    tol2: f64,
    negative: bool,
    result: &mut AdaptiveMomentsResult,
) -> Result<bool, MomentError> {
    if xcen.is_nan() || ycen.is_nan() {
        result.flags.set(ShapeFlag::UnweightedBad);
        return Ok(false);
    }

    // Weighting covariance, isotropic starting guess
    let mut sigma11_w = 1.5;
    let mut sigma12_w = 0.0;
    let mut sigma22_w = 1.5;

    // Current weight coefficients; always replaced on the first iteration
    let mut w11 = -1.0;
    let mut w12 = -1.0;
    let mut w22 = -1.0;

    let mut e1_old = 1.0e6;
    let mut e2_old = 1.0e6;
    let mut sigma11_ow_old = 1.0e6;

    let mut amplitude = 0.0;
    let mut moments = RawMoments::default();
    let mut interpolate = false;
    let mut bbox = PixelBox::empty();

    let mut iter = 0;
    while iter < max_iter {
        bbox = adaptive_moments_box(
            (xcen, ycen),
            sigma11_w,
            sigma22_w,
            image.width(),
            image.height(),
        );
        let Some(weights) = MomentWeights::from_covariance(sigma11_w, sigma12_w, sigma22_w)
        else {
            result.flags.set(ShapeFlag::Unweighted);
            break;
        };

        let ow11 = w11;
        let ow12 = w12;
        let ow22 = w22;
        w11 = weights.w11;
        w12 = weights.w12;
        w22 = weights.w22;

        if should_interpolate(sigma11_w, sigma22_w, weights.det) && !interpolate {
            interpolate = true; // stays set for this source
            if iter > 0 {
                // Re-do the iteration with the previous weights so the
                // switch to sub-grid sampling is not itself a step.
                sigma11_ow_old = 1.0e6; // force at least one more iteration
                w11 = ow11;
                w12 = ow12;
                w22 = ow22;
                iter -= 1;
            }
        }

        let step_weights = MomentWeights {
            w11,
            w12,
            w22,
            det: weights.det,
        };
        let (i0, m) = accumulate(image, (xcen, ycen), &bbox, bkgd, interpolate, &step_weights)?;
        amplitude = i0;
        moments = m;
        if !moments.is_sign_consistent(negative) {
            result.flags.set(ShapeFlag::Unweighted);
            break;
        }

        result.centroid.x = moments.sumx / moments.sum;
        result.centroid.y = moments.sumy / moments.sum;

        if (result.centroid.x - xcen).abs() > shiftmax
            || (result.centroid.y - ycen).abs() > shiftmax
        {
            result.flags.set(ShapeFlag::Shift);
        }

        // Second moments of the weighted object
        let sigma11_ow = moments.sumxx / moments.sum;
        let sigma22_ow = moments.sumyy / moments.sum;
        let sigma12_ow = moments.sumxy / moments.sum;

        if sigma11_ow <= 0.0 || sigma22_ow <= 0.0 {
            result.flags.set(ShapeFlag::Unweighted);
            break;
        }

        let d = sigma11_ow + sigma22_ow;
        let e1 = (sigma11_ow - sigma22_ow) / d;
        let e2 = 2.0 * sigma12_ow / d;

        if iter > 0
            && (e1 - e1_old).abs() < tol1
            && (e2 - e2_old).abs() < tol1
            && (sigma11_ow / sigma11_ow_old - 1.0).abs() < tol2
        {
            break; // converged
        }

        e1_old = e1;
        e2_old = e2;
        sigma11_ow_old = sigma11_ow;

        // Deconvolve: precision of the weighted object minus precision of
        // the kernel estimates the object precision, which (inverted)
        // becomes the next kernel covariance. A source that is not
        // remotely Gaussian (e.g. a pair of deltas) makes this difference
        // singular; that is the signal to give up on weighting.
        let Some(ow) = MomentWeights::from_covariance(sigma11_ow, sigma12_ow, sigma22_ow) else {
            result.flags.set(ShapeFlag::Unweighted);
            break;
        };
        let n11 = ow.w11 - w11;
        let n12 = ow.w12 - w12;
        let n22 = ow.w22 - w22;
        let Some(next) = MomentWeights::from_covariance(n11, n12, n22) else {
            result.flags.set(ShapeFlag::Unweighted);
            break;
        };
        sigma11_w = next.w11;
        sigma12_w = next.w12;
        sigma22_w = next.w22;

        if sigma11_w <= 0.0 || sigma22_w <= 0.0 {
            result.flags.set(ShapeFlag::Unweighted);
            break;
        }

        iter += 1;
    }

    if iter == max_iter {
        result.flags.set(ShapeFlag::Unweighted);
        result.flags.set(ShapeFlag::MaxIter);
    }
    if moments.sumxx + moments.sumyy == 0.0 {
        result.flags.set(ShapeFlag::Unweighted);
    }

    if result.flags.get(ShapeFlag::Unweighted) {
        log::debug!(
            "adaptive weighting failed at ({xcen:.1}, {ycen:.1}); \
             falling back to unweighted moments"
        );
        let (i0, m) = accumulate(
            image,
            (xcen, ycen),
            &bbox,
            bkgd,
            interpolate,
            &MomentWeights::flat(),
        )?;
        amplitude = i0;
        moments = m;
        if !moments.is_sign_consistent(negative)
            || (!negative && moments.sum <= 0.0)
            || (negative && moments.sum >= 0.0)
        {
            // Even the top-hat sum is unusable
            result.flags.clear(ShapeFlag::Unweighted);
            result.flags.set(ShapeFlag::UnweightedBad);
            if moments.sum > 0.0 {
                // the second moments of a single pixel
                result.shape.xx = 1.0 / 12.0;
                result.shape.xy = 0.0;
                result.shape.yy = 1.0 / 12.0;
            }
            return Ok(false);
        }

        sigma11_w = moments.sumxx / moments.sum;
        sigma12_w = moments.sumxy / moments.sum;
        sigma22_w = moments.sumyy / moments.sum;
    }

    result.flux.inst_flux = amplitude;
    result.shape.xx = sigma11_w;
    result.shape.xy = sigma12_w;
    result.shape.yy = sigma22_w;

    if result.shape.xx + result.shape.yy != 0.0 {
        let ix = position_to_index(xcen);
        let iy = position_to_index(ycen);
        if ix >= 0 && ix < image.width() as i32 && iy >= 0 && iy < image.height() as i32 {
            // Overestimates the background variance where the object sits
            // on top of it, but it is the only per-pixel noise we have.
            let bkgd_var = image.variance(ix as usize, iy as usize);
            if let Some(bkgd_var) = bkgd_var.filter(|v| *v > 0.0) {
                if !result.flags.get(ShapeFlag::Unweighted) {
                    match propagate_errors(result.flux.inst_flux, &result.shape, bkgd_var) {
                        Ok(errs) => {
                            result.flux.inst_flux_err = errs.inst_flux_err;
                            result.xx_err = errs.xx_err;
                            result.yy_err = errs.yy_err;
                            result.xy_err = errs.xy_err;
                            result.flux_xx_cov = errs.flux_xx_cov;
                            result.flux_yy_cov = errs.flux_yy_cov;
                            result.flux_xy_cov = errs.flux_xy_cov;
                            result.xx_yy_cov = errs.xx_yy_cov;
                            result.xx_xy_cov = errs.xx_xy_cov;
                            result.yy_xy_cov = errs.yy_xy_cov;
                        }
                        Err(err) => {
                            log::debug!(
                                "error propagation failed at ({xcen:.1}, {ycen:.1}): {err}"
                            );
                            return Ok(false);
                        }
                    }
                }
            }
        }
    }

    Ok(true)
}
