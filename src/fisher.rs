//! Analytic error propagation for the converged flux and shape.
//!
//! The measurement is a least-squares fit of an elliptical Gaussian with
//! four parameters `(flux, xx, yy, xy)`. Following the standard
//! approximation the second-derivative terms are ignored, so the Fisher
//! information matrix is a closed-form function of the best-fit parameters
//! and the background variance. Its inverse is the parameter covariance.

use std::f64::consts::PI;

use nalgebra::Matrix4;
use thiserror::Error;

use crate::results::Quadrupole;

/// Errors from Fisher-matrix error propagation.
#[derive(Error, Debug)]
pub enum FisherError {
    /// Shape determinant too small for a meaningful fit covariance.
    #[error("shape determinant {det:.6e} is too small for the Fisher matrix")]
    DegenerateShape {
        /// Determinant of the shape tensor.
        det: f64,
    },

    /// Background variance must be positive.
    #[error("background variance must be positive (saw {variance:.6e})")]
    NonPositiveVariance {
        /// Offending variance value.
        variance: f64,
    },

    /// The Fisher matrix could not be inverted.
    #[error("Fisher matrix is not invertible")]
    NotInvertible,
}

/// Uncertainties and covariances of `(flux, xx, yy, xy)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MomentUncertainty {
    /// One-sigma uncertainty of the flux amplitude.
    pub inst_flux_err: f64,
    /// One-sigma uncertainty of xx.
    pub xx_err: f64,
    /// One-sigma uncertainty of yy.
    pub yy_err: f64,
    /// One-sigma uncertainty of xy.
    pub xy_err: f64,
    /// Covariance between flux and xx.
    pub flux_xx_cov: f64,
    /// Covariance between flux and yy.
    pub flux_yy_cov: f64,
    /// Covariance between flux and xy.
    pub flux_xy_cov: f64,
    /// Covariance between xx and yy.
    pub xx_yy_cov: f64,
    /// Covariance between xx and xy.
    pub xx_xy_cov: f64,
    /// Covariance between yy and xy.
    pub yy_xy_cov: f64,
}

/// Build the 4x4 Fisher matrix for an elliptical Gaussian fit.
fn fisher_matrix(amplitude: f64, shape: &Quadrupole, bkgd_var: f64) -> Matrix4<f64> {
    let d = shape.determinant();
    let f = PI * d.sqrt() / bkgd_var;

    let mut fisher = Matrix4::zeros();
    fisher[(0, 0)] = f;

    let fac = f * amplitude / (4.0 * d);
    fisher[(0, 1)] = fac * shape.yy;
    fisher[(0, 2)] = fac * shape.xx;
    fisher[(0, 3)] = -fac * 2.0 * shape.xy;

    let fac = 3.0 * f * amplitude * amplitude / (16.0 * d * d);
    fisher[(1, 1)] = fac * shape.yy * shape.yy;
    fisher[(2, 2)] = fac * shape.xx * shape.xx;
    fisher[(3, 3)] = fac * 4.0 * (shape.xy * shape.xy + d / 3.0);
    fisher[(1, 2)] = fisher[(3, 3)] / 4.0;
    fisher[(1, 3)] = fac * (-2.0 * shape.yy * shape.xy);
    fisher[(2, 3)] = fac * (-2.0 * shape.xx * shape.xy);

    fisher[(1, 0)] = fisher[(0, 1)];
    fisher[(2, 0)] = fisher[(0, 2)];
    fisher[(3, 0)] = fisher[(0, 3)];
    fisher[(2, 1)] = fisher[(1, 2)];
    fisher[(3, 1)] = fisher[(1, 3)];
    fisher[(3, 2)] = fisher[(2, 3)];

    fisher
}

/// Covariance of `(flux, xx, yy, xy)` for a converged measurement.
///
/// # Arguments
/// * `amplitude` - Peak amplitude of the best-fit Gaussian
/// * `shape` - Converged second-moment tensor
/// * `bkgd_var` - Background variance at the source position
///
/// # Errors
/// [`FisherError::DegenerateShape`] when the shape determinant is at or
/// below machine epsilon, [`FisherError::NonPositiveVariance`] for
/// non-positive variance, and [`FisherError::NotInvertible`] when the
/// Fisher matrix is numerically singular.
pub fn propagate_errors(
    amplitude: f64,
    shape: &Quadrupole,
    bkgd_var: f64,
) -> Result<MomentUncertainty, FisherError> {
    let det = shape.determinant();
    if !(det > f64::EPSILON) {
        return Err(FisherError::DegenerateShape { det });
    }
    if bkgd_var <= 0.0 {
        return Err(FisherError::NonPositiveVariance {
            variance: bkgd_var,
        });
    }

    let fisher = fisher_matrix(amplitude, shape, bkgd_var);
    let cov = fisher.try_inverse().ok_or(FisherError::NotInvertible)?;

    Ok(MomentUncertainty {
        inst_flux_err: cov[(0, 0)].sqrt(),
        xx_err: cov[(1, 1)].sqrt(),
        yy_err: cov[(2, 2)].sqrt(),
        xy_err: cov[(3, 3)].sqrt(),
        flux_xx_cov: cov[(0, 1)],
        flux_yy_cov: cov[(0, 2)],
        flux_xy_cov: cov[(0, 3)],
        xx_yy_cov: cov[(1, 2)],
        xx_xy_cov: cov[(1, 3)],
        yy_xy_cov: cov[(2, 3)],
    })
}
