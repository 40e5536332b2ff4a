//! Adaptive Gaussian-weighted moment measurement of astronomical sources.
//!
//! This crate measures the shape, centroid and flux of point-like and
//! slightly-extended sources detected in telescope images. The core
//! estimator fits an elliptical Gaussian to a source by iterating weighted
//! second moments: the weighting kernel is repeatedly re-estimated from the
//! measured moments until the two agree, which makes the measurement
//! adaptive to the actual size and orientation of the source.
//!
//! # Module Organization
//!
//! ## Numeric core
//! - **weights**: inversion of a 2x2 moment covariance into weighting
//!   coefficients, plus the sub-pixel interpolation predicate
//! - **moments**: weighted moment accumulation over a bounding box, with
//!   optional 4x4 sub-pixel subdivision near the kernel cutoff
//! - **adaptive**: the fixed-point iteration engine, its fallback to
//!   unweighted moments, and post-processing to integrated flux
//! - **fisher**: analytic Fisher-matrix error propagation for the
//!   converged flux and shape parameters
//! - **gaussian_flux**: flux through a fixed (externally supplied)
//!   elliptical Gaussian weight, bypassing the iteration
//!
//! ## Collaborator interfaces
//! - **image**: read-only pixel/variance access behind the [`SourceImage`]
//!   trait, with an [`ndarray`]-backed [`Exposure`] implementation
//! - **bbox**: integer pixel bounding boxes in local image coordinates
//! - **record**: schema registration and per-source key/value result
//!   storage
//! - **flags**: data-only failure-flag bitsets parameterized over a
//!   per-algorithm flag enum
//! - **algorithm**: ties configuration, schema keys and collaborators
//!   together into per-source measurement calls
//!
//! # Coordinate conventions
//!
//! Images are indexed `[row, col]` = `[y, x]`. Measurement centers are
//! given in parent coordinates (local pixel index plus the exposure's
//! origin offset); all internal arithmetic is local.

pub mod adaptive;
pub mod algorithm;
pub mod bbox;
pub mod fisher;
pub mod flags;
pub mod gaussian_flux;
pub mod image;
pub mod moments;
pub mod record;
pub mod results;
pub mod weights;

pub use adaptive::{compute_adaptive_moments, AdaptiveMomentsConfig, AdaptiveMomentsError};
pub use algorithm::{
    AdaptiveMomentsAlgorithm, AdaptiveMomentsKeys, CentroidProvider, GaussianFluxAlgorithm,
    PsfModel,
};
pub use bbox::PixelBox;
pub use fisher::{propagate_errors, FisherError, MomentUncertainty};
pub use flags::{FlagDefinition, FlagSet, ShapeFlag};
pub use gaussian_flux::{compute_fixed_moments_flux, FluxError};
pub use image::{Exposure, ExposureError, SourceImage};
pub use moments::{MomentError, RawMoments};
pub use record::{FlagKey, Schema, SourceRecord, ValueKey};
pub use results::{AdaptiveMomentsResult, CentroidEstimate, FluxEstimate, Quadrupole};
pub use weights::{should_interpolate, MomentWeights};
