//! Gaussian weighting coefficients from a 2x2 moment covariance.
//!
//! The weighting kernel `exp(-(x² w11 + 2xy w12 + y² w22) / 2)` is
//! parameterized by the inverse of a covariance matrix
//! `[[sigma11, sigma12], [sigma12, sigma22]]`. Inversion fails for NaN
//! input or a near-singular determinant; callers decide the fallback.

/// Determinant threshold below which a covariance is treated as singular.
///
/// Matches single precision so that marginal covariances arriving from
/// lower-precision upstream measurements fail cleanly rather than
/// producing enormous weights.
pub const SINGULAR_DET: f64 = f32::EPSILON as f64;

/// Precision (inverse-covariance) coefficients of a Gaussian weighting
/// kernel, with the determinant of the covariance they came from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MomentWeights {
    /// xx precision coefficient.
    pub w11: f64,
    /// xy precision coefficient.
    pub w12: f64,
    /// yy precision coefficient.
    pub w22: f64,
    /// Determinant of the source covariance matrix.
    pub det: f64,
}

impl MomentWeights {
    /// Invert a symmetric 2x2 covariance into weighting coefficients.
    ///
    /// Returns `None` when any input is NaN or the determinant
    /// `sigma11 * sigma22 - sigma12²` is NaN or below [`SINGULAR_DET`].
    pub fn from_covariance(sigma11: f64, sigma12: f64, sigma22: f64) -> Option<Self> {
        if sigma11.is_nan() || sigma12.is_nan() || sigma22.is_nan() {
            return None;
        }
        let det = sigma11 * sigma22 - sigma12 * sigma12;
        if det.is_nan() || det < SINGULAR_DET {
            return None;
        }
        Some(Self {
            w11: sigma22 / det,
            w12: -sigma12 / det,
            w22: sigma11 / det,
            det,
        })
    }

    /// Flat (top-hat) weights: every pixel in the bounding box counts with
    /// unit weight. Used for the unweighted-moments fallback.
    pub fn flat() -> Self {
        Self {
            w11: 0.0,
            w12: 0.0,
            w22: 0.0,
            det: 0.0,
        }
    }
}

/// Whether moment accumulation needs sub-pixel interpolation.
///
/// True when the weighting kernel is narrower than roughly half a pixel
/// in either axis, where sampling at pixel centers alone aliases badly.
pub fn should_interpolate(sigma11: f64, sigma22: f64, det: f64) -> bool {
    const XINTERP: f64 = 0.25; // (0.5 pixel)^2
    sigma11 < XINTERP || sigma22 < XINTERP || det < XINTERP * XINTERP
}
