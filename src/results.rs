//! Result types produced by the measurement algorithms.
//!
//! All fields default to NaN sentinels; a measurement that fails part-way
//! leaves the untouched fields at NaN and explains itself through the flag
//! set, never through plausible-looking numbers.

use crate::flags::{FlagSet, ShapeFlag};

/// Second-moment (quadrupole) tensor of a source, in pixel² units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quadrupole {
    /// xx second moment.
    pub xx: f64,
    /// yy second moment.
    pub yy: f64,
    /// xy second moment.
    pub xy: f64,
}

impl Quadrupole {
    /// Construct from the three independent tensor components.
    pub fn new(xx: f64, yy: f64, xy: f64) -> Self {
        Self { xx, yy, xy }
    }

    /// Determinant `xx * yy - xy²`, the squared area scale of the ellipse.
    pub fn determinant(&self) -> f64 {
        self.xx * self.yy - self.xy * self.xy
    }
}

impl Default for Quadrupole {
    fn default() -> Self {
        Self {
            xx: f64::NAN,
            yy: f64::NAN,
            xy: f64::NAN,
        }
    }
}

/// Refined centroid of a source, in parent pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CentroidEstimate {
    /// Column (x) position.
    pub x: f64,
    /// Row (y) position.
    pub y: f64,
}

impl Default for CentroidEstimate {
    fn default() -> Self {
        Self {
            x: f64::NAN,
            y: f64::NAN,
        }
    }
}

/// Instrumental flux and its uncertainty, in image counts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FluxEstimate {
    /// Instrumental flux.
    pub inst_flux: f64,
    /// One-sigma flux uncertainty.
    pub inst_flux_err: f64,
}

impl Default for FluxEstimate {
    fn default() -> Self {
        Self {
            inst_flux: f64::NAN,
            inst_flux_err: f64::NAN,
        }
    }
}

/// Complete result of one adaptive-moments measurement.
///
/// Composes the centroid, shape and flux estimates with the shape
/// uncertainties, the flux/shape covariance terms and the failure flags.
#[derive(Debug, Clone)]
pub struct AdaptiveMomentsResult {
    /// Refined centroid in parent coordinates.
    pub centroid: CentroidEstimate,
    /// Converged (or fallback) second-moment tensor.
    pub shape: Quadrupole,
    /// Integrated flux of the best-fit elliptical Gaussian.
    pub flux: FluxEstimate,
    /// One-sigma uncertainty of `shape.xx`.
    pub xx_err: f64,
    /// One-sigma uncertainty of `shape.yy`.
    pub yy_err: f64,
    /// One-sigma uncertainty of `shape.xy`.
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
    /// Failure flags raised during the measurement.
    pub flags: FlagSet<ShapeFlag>,
}

impl Default for AdaptiveMomentsResult {
    fn default() -> Self {
        Self {
            xx_err: f64::NAN,
            yy_err: f64::NAN,
            xy_err: f64::NAN,
            flux_xx_cov: f64::NAN,
            flux_yy_cov: f64::NAN,
            flux_xy_cov: f64::NAN,
            xx_yy_cov: f64::NAN,
            xx_xy_cov: f64::NAN,
            yy_xy_cov: f64::NAN,
            centroid: CentroidEstimate::default(),
            shape: Quadrupole::default(),
            flux: FluxEstimate::default(),
            flags: FlagSet::empty(),
        }
    }
}

impl AdaptiveMomentsResult {
    /// A result with every numeric field at its NaN sentinel.
    pub fn new() -> Self {
        Self::default()
    }
}
